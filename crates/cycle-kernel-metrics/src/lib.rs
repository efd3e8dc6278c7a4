#![forbid(unsafe_code)]

use std::path::Path;

use cycle_kernel_domain::{
    now_utc, CycleError, GrowthClass, MetricsSnapshot, Vow, VowStatus,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_STOP_WINDOW: usize = 10;
pub const DEFAULT_MIN_SYNTHESIS_NOVELTY: f32 = 0.65;
const FIDELITY_EPSILON: f32 = 1e-6;

/// Per-cycle facts the snapshot computation folds over. One observation per
/// completed cycle, produced by the orchestrator at integrate time.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CycleObservation {
    pub cycle_index: u64,
    pub time_critical: bool,
    pub counterargument_substantive: bool,
    pub probe_novelty_failure: bool,
    pub decomposition_complete: bool,
    pub artifacts_produced: u32,
}

/// Externally-sourced indices. Their derivation is deliberately outside this
/// engine: values arrive from telemetry providers and are only band-checked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalIndices {
    pub recovery_latency: f32,
    pub source_balance_entropy: f32,
    pub capability_burst_count: u32,
    pub growth_classification: GrowthClass,
}

impl Default for ExternalIndices {
    fn default() -> Self {
        Self {
            recovery_latency: 0.0,
            source_balance_entropy: 1.0,
            capability_burst_count: 0,
            growth_classification: GrowthClass::Growth,
        }
    }
}

/// Governance facts sampled from the vow registry and ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct GovernanceInputs {
    pub liberation_rate: f32,
    pub vows: Vec<Vow>,
    pub lineage_solid: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Band {
    pub min: f32,
    pub max: f32,
}

impl Band {
    #[must_use]
    pub fn contains(&self, value: f32) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExternalBands {
    pub recovery_latency: Band,
    pub source_balance_entropy: Band,
    pub capability_burst_count: Band,
    pub liberation_rate: Band,
    pub allowed_growth: Vec<GrowthClass>,
}

/// Stop-rule thresholds and target bands. Configuration, never hardcoded in
/// the evaluator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    pub window: usize,
    pub min_synthesis_novelty: f32,
    pub bands: ExternalBands,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_STOP_WINDOW,
            min_synthesis_novelty: DEFAULT_MIN_SYNTHESIS_NOVELTY,
            bands: ExternalBands {
                recovery_latency: Band { min: 0.0, max: 2.0 },
                source_balance_entropy: Band { min: 0.4, max: 1.0 },
                capability_burst_count: Band { min: 0.0, max: 5.0 },
                liberation_rate: Band { min: 0.0, max: 0.5 },
                allowed_growth: vec![GrowthClass::Growth, GrowthClass::Plateau],
            },
        }
    }
}

impl MetricsConfig {
    /// Validates numeric bounds and window invariants.
    ///
    /// # Errors
    /// Returns [`CycleError::Validation`] when a field is out of bounds.
    pub fn validate(&self) -> Result<(), CycleError> {
        if self.window == 0 {
            return Err(CycleError::Validation(
                "window MUST be >= 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_synthesis_novelty) {
            return Err(CycleError::Validation(
                "min_synthesis_novelty MUST be in [0.0, 1.0]".to_string(),
            ));
        }
        for (name, band) in [
            ("recovery_latency", self.bands.recovery_latency),
            ("source_balance_entropy", self.bands.source_balance_entropy),
            ("capability_burst_count", self.bands.capability_burst_count),
            ("liberation_rate", self.bands.liberation_rate),
        ] {
            if band.min > band.max {
                return Err(CycleError::Validation(format!(
                    "band {name} has min > max"
                )));
            }
        }
        if self.bands.allowed_growth.is_empty() {
            return Err(CycleError::Validation(
                "allowed_growth MUST name at least one class".to_string(),
            ));
        }
        Ok(())
    }

    /// Decodes and validates a config from YAML text.
    ///
    /// # Errors
    /// Returns [`CycleError::Validation`] on decode or bounds failure.
    pub fn from_yaml(text: &str) -> Result<Self, CycleError> {
        let config: Self = serde_yaml::from_str(text)
            .map_err(|err| CycleError::Validation(format!("invalid metrics config YAML: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a config file, falling back to defaults when the path is absent.
    ///
    /// # Errors
    /// Returns [`CycleError::Io`] when the file exists but cannot be read and
    /// [`CycleError::Validation`] when it cannot be decoded.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, CycleError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .map_err(|err| CycleError::Io(format!("cannot read {}: {err}", path.display())))?;
        Self::from_yaml(&text)
    }
}

#[allow(clippy::cast_precision_loss)]
fn fraction(numerator: usize, denominator: usize) -> f32 {
    if denominator == 0 {
        return 1.0;
    }
    numerator as f32 / denominator as f32
}

/// Computes the snapshot for the current integrate step from the trailing
/// observation window plus external and governance inputs.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn compute_snapshot(
    observations: &[CycleObservation],
    external: &ExternalIndices,
    governance: &GovernanceInputs,
    cycle_index: u64,
) -> MetricsSnapshot {
    let time_critical: Vec<&CycleObservation> = observations
        .iter()
        .filter(|observation| observation.time_critical)
        .collect();
    let crisis_response = fraction(
        time_critical
            .iter()
            .filter(|observation| observation.counterargument_substantive)
            .count(),
        time_critical.len(),
    );

    let synthesis_novelty = fraction(
        observations
            .iter()
            .filter(|observation| !observation.probe_novelty_failure)
            .count(),
        observations.len(),
    );

    let decomposition_fidelity = fraction(
        observations
            .iter()
            .filter(|observation| observation.decomposition_complete)
            .count(),
        observations.len(),
    );

    let praxis = observations
        .iter()
        .any(|observation| observation.artifacts_produced > 0);

    let genesis_reproduction_rate = fraction(
        observations
            .iter()
            .filter(|observation| observation.artifacts_produced > 0)
            .count(),
        observations.len(),
    );

    let total_vows = governance.vows.len();
    let active_vows = governance
        .vows
        .iter()
        .filter(|vow| vow.status == VowStatus::Active)
        .count();
    let liberated: Vec<&Vow> = governance
        .vows
        .iter()
        .filter(|vow| vow.status == VowStatus::Liberated)
        .collect();
    let scaffold_stability = fraction(active_vows, total_vows);
    let scaffold_mean_lifespan = if total_vows == 0 {
        0.0
    } else {
        governance
            .vows
            .iter()
            .map(|vow| vow.adherence_log.len() as f32)
            .sum::<f32>()
            / total_vows as f32
    };
    let scaffold_assimilation_rate = fraction(
        liberated
            .iter()
            .filter(|vow| vow.replaced_by.is_some())
            .count(),
        liberated.len(),
    );

    MetricsSnapshot {
        cycle_index,
        crisis_response,
        synthesis_novelty,
        decomposition_fidelity,
        praxis,
        liberation_rate: governance.liberation_rate,
        recovery_latency: external.recovery_latency,
        source_balance_entropy: external.source_balance_entropy,
        capability_burst_count: external.capability_burst_count,
        growth_classification: external.growth_classification,
        scaffold_stability,
        scaffold_mean_lifespan,
        scaffold_assimilation_rate,
        genesis_reproduction_rate,
        trace_lineage_solidity: if governance.lineage_solid { 1.0 } else { 0.0 },
        computed_at: now_utc(),
    }
}

/// Per-condition breakdown of one stop-rule evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StopRuleReport {
    pub holds: bool,
    pub window_filled: bool,
    pub crisis_response_non_decreasing: bool,
    pub synthesis_novelty_met: bool,
    pub praxis_met: bool,
    pub decomposition_fidelity_met: bool,
    pub external_bands_met: bool,
    pub failing_bands: Vec<String>,
}

/// Evaluates the stop rule over the trailing window. Pure and idempotent:
/// the verdict is a function of the snapshot list and the config alone.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn evaluate_stop_rule(snapshots: &[MetricsSnapshot], config: &MetricsConfig) -> StopRuleReport {
    let window_filled = snapshots.len() >= config.window;
    if !window_filled {
        return StopRuleReport {
            holds: false,
            window_filled,
            crisis_response_non_decreasing: false,
            synthesis_novelty_met: false,
            praxis_met: false,
            decomposition_fidelity_met: false,
            external_bands_met: false,
            failing_bands: Vec::new(),
        };
    }

    let trailing = &snapshots[snapshots.len() - config.window..];
    let crisis_response_non_decreasing = trailing
        .windows(2)
        .all(|pair| pair[1].crisis_response >= pair[0].crisis_response);

    let latest = &trailing[trailing.len() - 1];
    let synthesis_novelty_met = latest.synthesis_novelty >= config.min_synthesis_novelty;
    let praxis_met = latest.praxis;
    let decomposition_fidelity_met = latest.decomposition_fidelity >= 1.0 - FIDELITY_EPSILON;

    let mut failing_bands = Vec::new();
    if !config.bands.recovery_latency.contains(latest.recovery_latency) {
        failing_bands.push("recovery_latency".to_string());
    }
    if !config
        .bands
        .source_balance_entropy
        .contains(latest.source_balance_entropy)
    {
        failing_bands.push("source_balance_entropy".to_string());
    }
    if !config
        .bands
        .capability_burst_count
        .contains(latest.capability_burst_count as f32)
    {
        failing_bands.push("capability_burst_count".to_string());
    }
    if !config.bands.liberation_rate.contains(latest.liberation_rate) {
        failing_bands.push("liberation_rate".to_string());
    }
    if !config
        .bands
        .allowed_growth
        .contains(&latest.growth_classification)
    {
        failing_bands.push("growth_classification".to_string());
    }
    let external_bands_met = failing_bands.is_empty();

    StopRuleReport {
        holds: crisis_response_non_decreasing
            && synthesis_novelty_met
            && praxis_met
            && decomposition_fidelity_met
            && external_bands_met,
        window_filled,
        crisis_response_non_decreasing,
        synthesis_novelty_met,
        praxis_met,
        decomposition_fidelity_met,
        external_bands_met,
        failing_bands,
    }
}

#[must_use]
pub fn stop_rule_holds(snapshots: &[MetricsSnapshot], config: &MetricsConfig) -> bool {
    evaluate_stop_rule(snapshots, config).holds
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn observation(cycle_index: u64) -> CycleObservation {
        CycleObservation {
            cycle_index,
            time_critical: false,
            counterargument_substantive: false,
            probe_novelty_failure: false,
            decomposition_complete: true,
            artifacts_produced: 1,
        }
    }

    fn qualifying_snapshot(cycle_index: u64, crisis_response: f32) -> MetricsSnapshot {
        compute_snapshot(
            &[observation(cycle_index)],
            &ExternalIndices::default(),
            &GovernanceInputs {
                liberation_rate: 0.1,
                vows: Vec::new(),
                lineage_solid: true,
            },
            cycle_index,
        )
        .with_crisis(crisis_response)
    }

    trait WithCrisis {
        fn with_crisis(self, value: f32) -> Self;
    }

    impl WithCrisis for MetricsSnapshot {
        fn with_crisis(mut self, value: f32) -> Self {
            self.crisis_response = value;
            self
        }
    }

    #[test]
    fn crisis_response_is_complete_when_no_time_critical_decisions() {
        let snapshot = qualifying_snapshot(1, 1.0);
        assert!((snapshot.crisis_response - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn crisis_response_counts_only_time_critical_decisions() {
        let mut covered = observation(1);
        covered.time_critical = true;
        covered.counterargument_substantive = true;
        let mut uncovered = observation(2);
        uncovered.time_critical = true;
        uncovered.counterargument_substantive = false;
        let neutral = observation(3);

        let snapshot = compute_snapshot(
            &[covered, uncovered, neutral],
            &ExternalIndices::default(),
            &GovernanceInputs {
                liberation_rate: 0.0,
                vows: Vec::new(),
                lineage_solid: true,
            },
            3,
        );
        assert!((snapshot.crisis_response - 0.5).abs() < 1e-6);
    }

    #[test]
    fn novelty_and_fidelity_are_window_fractions() {
        let mut stale = observation(1);
        stale.probe_novelty_failure = true;
        let mut incomplete = observation(2);
        incomplete.decomposition_complete = false;
        incomplete.artifacts_produced = 0;
        let clean = observation(3);

        let snapshot = compute_snapshot(
            &[stale, incomplete, clean],
            &ExternalIndices::default(),
            &GovernanceInputs {
                liberation_rate: 0.0,
                vows: Vec::new(),
                lineage_solid: false,
            },
            3,
        );
        assert!((snapshot.synthesis_novelty - 2.0 / 3.0).abs() < 1e-6);
        assert!((snapshot.decomposition_fidelity - 2.0 / 3.0).abs() < 1e-6);
        assert!(snapshot.praxis);
        assert!((snapshot.genesis_reproduction_rate - 2.0 / 3.0).abs() < 1e-6);
        assert!((snapshot.trace_lineage_solidity - 0.0).abs() < f32::EPSILON);
    }

    #[test]
    fn stop_rule_is_false_below_window_size() {
        let config = MetricsConfig::default();
        let snapshots: Vec<MetricsSnapshot> = (0..config.window as u64 - 1)
            .map(|index| qualifying_snapshot(index, 1.0))
            .collect();
        let report = evaluate_stop_rule(&snapshots, &config);
        assert!(!report.holds);
        assert!(!report.window_filled);
    }

    #[test]
    fn stop_rule_holds_for_qualifying_window() {
        let config = MetricsConfig::default();
        let snapshots: Vec<MetricsSnapshot> = (0..config.window as u64)
            .map(|index| qualifying_snapshot(index, 0.5 + index as f32 * 0.05))
            .collect();
        let report = evaluate_stop_rule(&snapshots, &config);
        assert!(report.window_filled);
        assert!(report.crisis_response_non_decreasing);
        assert!(report.external_bands_met);
        assert!(report.holds);
    }

    #[test]
    fn stop_rule_rejects_crisis_response_dip() {
        let config = MetricsConfig::default();
        let mut snapshots: Vec<MetricsSnapshot> = (0..config.window as u64)
            .map(|index| qualifying_snapshot(index, 0.9))
            .collect();
        snapshots[5].crisis_response = 0.2;
        let report = evaluate_stop_rule(&snapshots, &config);
        assert!(!report.crisis_response_non_decreasing);
        assert!(!report.holds);
    }

    #[test]
    fn stop_rule_rejects_out_of_band_external_index() {
        let config = MetricsConfig::default();
        let mut snapshots: Vec<MetricsSnapshot> = (0..config.window as u64)
            .map(|index| qualifying_snapshot(index, 1.0))
            .collect();
        let last = snapshots.len() - 1;
        snapshots[last].recovery_latency = 99.0;
        let report = evaluate_stop_rule(&snapshots, &config);
        assert!(!report.holds);
        assert_eq!(report.failing_bands, vec!["recovery_latency".to_string()]);
    }

    #[test]
    fn stop_rule_rejects_disallowed_growth_class() {
        let config = MetricsConfig::default();
        let mut snapshots: Vec<MetricsSnapshot> = (0..config.window as u64)
            .map(|index| qualifying_snapshot(index, 1.0))
            .collect();
        let last = snapshots.len() - 1;
        snapshots[last].growth_classification = GrowthClass::Regression;
        assert!(!stop_rule_holds(&snapshots, &config));
    }

    #[test]
    fn stop_rule_is_pure_and_idempotent() {
        let config = MetricsConfig::default();
        let snapshots: Vec<MetricsSnapshot> = (0..12)
            .map(|index| qualifying_snapshot(index, 0.8))
            .collect();
        let first = evaluate_stop_rule(&snapshots, &config);
        let second = evaluate_stop_rule(&snapshots, &config);
        assert_eq!(first, second);
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let yaml = r"
window: 6
min_synthesis_novelty: 0.7
bands:
  recovery_latency: { min: 0.0, max: 1.5 }
  source_balance_entropy: { min: 0.5, max: 1.0 }
  capability_burst_count: { min: 0.0, max: 3.0 }
  liberation_rate: { min: 0.0, max: 0.34 }
  allowed_growth: [growth, plateau]
";
        let config = must(MetricsConfig::from_yaml(yaml));
        assert_eq!(config.window, 6);
        assert!((config.min_synthesis_novelty - 0.7).abs() < f32::EPSILON);
        assert!(config.bands.liberation_rate.contains(1.0 / 3.0));
    }

    #[test]
    fn config_rejects_inverted_band() {
        let mut config = MetricsConfig::default();
        config.bands.recovery_latency = Band { min: 2.0, max: 1.0 };
        assert!(matches!(
            config.validate(),
            Err(CycleError::Validation(_))
        ));
    }

    #[test]
    fn default_config_is_valid() {
        assert!(MetricsConfig::default().validate().is_ok());
    }
}

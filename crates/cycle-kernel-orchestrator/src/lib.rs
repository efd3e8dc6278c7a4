#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use cycle_kernel_dialectic::{DialecticEngine, NoveltyWindow, RoleGenerator};
use cycle_kernel_domain::{
    content_digest, has_substance, now_utc, Artifact, ArtifactId, ArtifactKind, Catalyst,
    CatalystClass, CatalystId, CycleError, CycleState, Decision, DecisionId, EntryType,
    GrowthClass, MetricsSnapshot, Plan, PlanId, SourceKind, StopReason, SubstanceProfile,
};
use cycle_kernel_heuristics::HeuristicStore;
use cycle_kernel_ledger::{commit, verify_chain, LedgerStore};
use cycle_kernel_metrics::{
    compute_snapshot, evaluate_stop_rule, CycleObservation, ExternalIndices, GovernanceInputs,
    MetricsConfig,
};
use cycle_kernel_store_sqlite::SqliteStore;
use cycle_kernel_vows::VowRegistry;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

pub const ENGINE_VERSION: &str = "cycle-kernel.v0";

/// The three telemetry documents consumed read-only at scan time. A missing
/// document contributes nothing and is never an error.
#[derive(Debug, Clone, Default)]
pub struct TelemetryDocuments {
    pub scan_anomalies: Option<Value>,
    pub decision_trace: Option<Value>,
    pub growth_trajectory: Option<Value>,
}

pub trait TelemetrySource {
    #[allow(clippy::missing_errors_doc)]
    fn load(&self) -> Result<TelemetryDocuments>;
}

/// Telemetry loaded from JSON files; an absent file is an absent document.
#[derive(Debug, Clone, Default)]
pub struct FileTelemetrySource {
    pub scan_path: Option<PathBuf>,
    pub trace_path: Option<PathBuf>,
    pub growth_path: Option<PathBuf>,
}

impl TelemetrySource for FileTelemetrySource {
    fn load(&self) -> Result<TelemetryDocuments> {
        Ok(TelemetryDocuments {
            scan_anomalies: read_optional_json(self.scan_path.as_deref())?,
            decision_trace: read_optional_json(self.trace_path.as_deref())?,
            growth_trajectory: read_optional_json(self.growth_path.as_deref())?,
        })
    }
}

fn read_optional_json(path: Option<&std::path::Path>) -> Result<Option<Value>> {
    let Some(path) = path else {
        return Ok(None);
    };
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read telemetry file {}", path.display()))?;
    let value = serde_json::from_str(&text)
        .with_context(|| format!("invalid telemetry JSON in {}", path.display()))?;
    Ok(Some(value))
}

/// Fixed in-memory telemetry, for tests and replays.
#[derive(Debug, Clone, Default)]
pub struct StaticTelemetrySource {
    pub documents: TelemetryDocuments,
}

impl TelemetrySource for StaticTelemetrySource {
    fn load(&self) -> Result<TelemetryDocuments> {
        Ok(self.documents.clone())
    }
}

/// Pluggable sign/verify capability. Signatures are opaque
/// `<scheme>:<hex>` tags and are always verified by recomputing.
pub trait ArtifactSigner {
    fn scheme(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn sign(&self, content_hash: &str) -> Result<String>;

    #[allow(clippy::missing_errors_doc)]
    fn verify(&self, content_hash: &str, signature: &str) -> Result<bool>;
}

/// Keyed SHA-256 signer, scheme `k256`.
#[derive(Debug, Clone)]
pub struct KeyedSigner {
    key: Vec<u8>,
}

impl KeyedSigner {
    #[must_use]
    pub fn new(key: &[u8]) -> Self {
        Self { key: key.to_vec() }
    }

    fn digest(&self, content_hash: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        hasher.update(content_hash.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl ArtifactSigner for KeyedSigner {
    fn scheme(&self) -> &'static str {
        "k256"
    }

    fn sign(&self, content_hash: &str) -> Result<String> {
        Ok(format!("{}:{}", self.scheme(), self.digest(content_hash)))
    }

    fn verify(&self, content_hash: &str, signature: &str) -> Result<bool> {
        let expected = self.sign(content_hash)?;
        Ok(expected == signature)
    }
}

/// Runs a boundary operation with one bounded retry after a backoff.
/// Repeated failure is fatal for the current cycle only.
///
/// # Errors
/// Returns [`CycleError::Io`] when both attempts fail.
pub fn retry_once<T, F>(label: &str, backoff: Duration, mut op: F) -> Result<T, CycleError>
where
    F: FnMut() -> Result<T>,
{
    match op() {
        Ok(value) => Ok(value),
        Err(first) => {
            std::thread::sleep(backoff);
            op().map_err(|second| {
                CycleError::Io(format!(
                    "{label} failed after retry: first: {first}; second: {second}"
                ))
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub min_severity: f32,
    pub time_critical_severity: f32,
    pub heuristics_consulted: usize,
    pub boundary_backoff: Duration,
    pub metrics: MetricsConfig,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            min_severity: 0.3,
            time_critical_severity: 0.75,
            heuristics_consulted: 3,
            boundary_backoff: Duration::from_millis(200),
            metrics: MetricsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Catalyst(Catalyst),
    Stopped(StopReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub decision: Decision,
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntegrateOutcome {
    Continue {
        snapshot: MetricsSnapshot,
        outcome_hash: String,
    },
    Stopped {
        snapshot: MetricsSnapshot,
        outcome_hash: String,
        reason: StopReason,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Completed {
        catalyst_id: CatalystId,
        plan_id: PlanId,
        decision_id: DecisionId,
        outcome_hash: String,
    },
    Stopped(StopReason),
}

/// One anomaly reading parsed out of a telemetry document.
#[derive(Debug, Clone, PartialEq)]
struct AnomalyReading {
    source_kind: SourceKind,
    classification: CatalystClass,
    description: String,
    severity: f32,
    evidence: Vec<String>,
    detected_at: cycle_kernel_domain::DateTimeUtc,
}

/// The SCAN -> ARCHITECT -> EXECUTE -> INTEGRATE loop. Single writer over
/// the store, vow registry, and heuristic store; readers use the immutable
/// snapshots those components publish.
pub struct CycleMachine<'a, G: RoleGenerator> {
    store: &'a SqliteStore,
    telemetry: &'a dyn TelemetrySource,
    signer: Option<&'a dyn ArtifactSigner>,
    engine: DialecticEngine<G>,
    heuristics: HeuristicStore,
    vows: VowRegistry,
    config: CycleConfig,
    state: CycleState,
}

impl<'a, G: RoleGenerator> CycleMachine<'a, G> {
    /// Hydrates a machine from persisted heuristics, vows, and the probe
    /// novelty history.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn open(
        store: &'a SqliteStore,
        telemetry: &'a dyn TelemetrySource,
        signer: Option<&'a dyn ArtifactSigner>,
        generator: G,
        config: CycleConfig,
    ) -> Result<Self> {
        config.metrics.validate()?;

        let heuristics = HeuristicStore::from_heuristics(store.load_heuristics()?);
        if heuristics.snapshot()?.is_empty() {
            // Bootstrap principles for a fresh database.
            let _ = heuristics.register("prefer the smallest reversible intervention", 0.5)?;
            let _ = heuristics.register("treat repeated anomalies as structural", 0.5)?;
        }

        let (vow_rows, active_vow, total_cycles, liberations) = store.load_vow_registry()?;
        let vows = VowRegistry::from_state(vow_rows, active_vow, total_cycles, liberations);

        let window_size = cycle_kernel_dialectic::DEFAULT_NOVELTY_WINDOW;
        let history = store.recent_probes(window_size)?;
        let engine = DialecticEngine::new(
            generator,
            NoveltyWindow::from_history(window_size, history),
        );

        Ok(Self {
            store,
            telemetry,
            signer,
            engine,
            heuristics,
            vows,
            config,
            state: CycleState::Scan,
        })
    }

    #[must_use]
    pub fn state(&self) -> CycleState {
        self.state
    }

    #[must_use]
    pub fn vows(&self) -> &VowRegistry {
        &self.vows
    }

    #[must_use]
    pub fn heuristics(&self) -> &HeuristicStore {
        &self.heuristics
    }

    /// SCAN: load telemetry, pick the single highest-severity eligible
    /// anomaly (ties broken by earliest detection), and mint a catalyst.
    /// Nothing above the severity floor means stop-risk, a normal terminal
    /// outcome.
    ///
    /// # Errors
    /// Returns [`CycleError::Io`] when telemetry stays unreadable after the
    /// bounded retry, or a validation/persistence error.
    pub fn scan(&mut self) -> Result<ScanOutcome> {
        let documents = retry_once("telemetry load", self.config.boundary_backoff, || {
            self.telemetry.load()
        })?;

        let mut readings = parse_anomalies(&documents)?;
        readings.retain(|reading| reading.severity >= self.config.min_severity);
        readings.sort_by(|lhs, rhs| {
            rhs.severity
                .total_cmp(&lhs.severity)
                .then_with(|| lhs.detected_at.cmp(&rhs.detected_at))
        });

        let Some(selected) = readings.into_iter().next() else {
            self.state = CycleState::Stopped;
            return Ok(ScanOutcome::Stopped(StopReason::NoCatalyst));
        };

        let catalyst = Catalyst {
            catalyst_id: CatalystId::new(),
            source_kind: selected.source_kind,
            classification: selected.classification,
            description: selected.description,
            severity: selected.severity,
            evidence: selected.evidence,
            detected_at: selected.detected_at,
            created_at: now_utc(),
        };
        catalyst.validate()?;
        self.store.insert_catalyst(&catalyst)?;

        self.state = CycleState::Architect;
        Ok(ScanOutcome::Catalyst(catalyst))
    }

    /// ARCHITECT: run the dialectic over the catalyst with the top
    /// heuristics as guidance and assemble the plan. An incomplete
    /// decomposition here is a hard validation failure for the caller to
    /// fix upstream, never a state.
    ///
    /// # Errors
    /// Returns [`CycleError::Validation`] for an unknown catalyst or an
    /// incomplete synthesis.
    pub fn architect(&mut self, catalyst_id: CatalystId) -> Result<Plan> {
        let catalyst = self
            .store
            .get_catalyst(catalyst_id)?
            .ok_or_else(|| CycleError::Validation(format!("unknown catalyst {catalyst_id}")))?;

        let consulted = self.heuristics.query_top(self.config.heuristics_consulted)?;
        let synthesis = self.engine.synthesize(&catalyst, &consulted)?;

        let plan = Plan {
            plan_id: PlanId::new(),
            catalyst_id,
            thesis: synthesis.thesis.clone(),
            antithesis: synthesis.antithesis.clone(),
            probes: vec![synthesis.probe.text.clone()],
            decomposition: synthesis.decomposition(&catalyst),
            time_critical: catalyst.severity >= self.config.time_critical_severity,
            created_at: now_utc(),
        };
        plan.validate()?;

        self.store.insert_plan(&plan)?;
        self.store
            .append_probe(&synthesis.probe.text, synthesis.probe.novelty_failure)?;

        let mut applied = BTreeSet::new();
        for heuristic in &consulted {
            if self.heuristics.apply(heuristic.heuristic_id)? {
                applied.insert(heuristic.heuristic_id);
            }
        }
        self.heuristics.end_cycle(&applied)?;
        self.store.save_heuristics(&self.heuristics.snapshot()?)?;

        self.state = CycleState::Execute;
        Ok(plan)
    }

    /// EXECUTE: refuse incomplete plans, apply the time-criticality rule,
    /// commit to a decision, and compile the signed cycle artifact. Ledger
    /// appends are deferred to INTEGRATE so an interrupted cycle leaves no
    /// partial chain.
    ///
    /// # Errors
    /// Returns [`CycleError::Validation`] when the plan is unknown, its
    /// decomposition is incomplete, or the decision fails its gate.
    pub fn execute(&mut self, plan_id: PlanId) -> Result<ExecutionRecord> {
        let plan = self
            .store
            .get_plan(plan_id)?
            .ok_or_else(|| CycleError::Validation(format!("unknown plan {plan_id}")))?;
        plan.validate()?;

        let catalyst = self
            .store
            .get_catalyst(plan.catalyst_id)?
            .ok_or_else(|| CycleError::Validation(format!("unknown catalyst {}", plan.catalyst_id)))?;

        let counterargument = format!(
            "{}; the observed evidence ({}) may yet be invalidated by the next scan",
            plan.antithesis,
            catalyst.evidence.join(", ")
        );
        let decision = Decision {
            decision_id: DecisionId::new(),
            plan_id,
            choice: plan.thesis.clone(),
            confidence: decision_confidence(&plan, &catalyst),
            counterargument: Some(counterargument),
            decided_at: now_utc(),
        };
        decision.validate(&plan)?;
        self.store.insert_decision(&decision)?;

        let artifact = self.compile_cycle_artifact(&catalyst, &plan, &decision)?;
        self.store.insert_artifact(&artifact)?;

        self.state = CycleState::Integrate;
        Ok(ExecutionRecord {
            decision,
            artifacts: vec![artifact],
        })
    }

    fn compile_cycle_artifact(
        &self,
        catalyst: &Catalyst,
        plan: &Plan,
        decision: &Decision,
    ) -> Result<Artifact> {
        let content = serde_json::to_vec(&json!({
            "catalyst_id": catalyst.catalyst_id.to_string(),
            "plan_id": plan.plan_id.to_string(),
            "decision_id": decision.decision_id.to_string(),
            "choice": decision.choice,
            "confidence": decision.confidence,
            "thesis": plan.thesis,
            "antithesis": plan.antithesis,
            "probes": plan.probes,
            "decomposition": plan.decomposition,
        }))?;

        // Hash first; a signature only ever covers the recomputed digest.
        let content_hash = content_digest(&content);
        let signature = match self.signer {
            Some(signer) => Some(retry_once(
                "artifact signing",
                self.config.boundary_backoff,
                || signer.sign(&content_hash),
            )?),
            None => None,
        };

        let artifact_id = ArtifactId::new();
        let mut provenance = BTreeMap::new();
        provenance.insert("catalyst_id".to_string(), catalyst.catalyst_id.to_string());
        provenance.insert("plan_id".to_string(), plan.plan_id.to_string());
        provenance.insert("decision_id".to_string(), decision.decision_id.to_string());
        provenance.insert("engine_version".to_string(), ENGINE_VERSION.to_string());

        Ok(Artifact {
            artifact_id,
            kind: ArtifactKind::Report,
            title: format!("cycle report for catalyst {}", catalyst.catalyst_id),
            content_hash,
            storage_uri: format!("cycle://artifacts/{artifact_id}"),
            signature,
            provenance,
            created_at: now_utc(),
        })
    }

    /// INTEGRATE: record adherence, fold the cycle into the metrics window,
    /// then make the cycle durable with the ledger batch: decision entry,
    /// artifact entry, and the cycle-outcome entry last. Only after that
    /// final append is the cycle considered complete; the stop rule is then
    /// evaluated over the full snapshot history.
    ///
    /// # Errors
    /// Returns [`CycleError::Validation`] for unknown ids,
    /// [`CycleError::Integrity`] when the existing chain fails verification,
    /// and [`CycleError::Io`] for unrecovered persistence failures.
    pub fn integrate(&mut self, artifact_id: ArtifactId) -> Result<IntegrateOutcome> {
        let artifact = self
            .store
            .get_artifact(artifact_id)?
            .ok_or_else(|| CycleError::Validation(format!("unknown artifact {artifact_id}")))?;
        let decision_id = provenance_id(&artifact, "decision_id")?;
        let decision = self
            .store
            .get_decision(DecisionId(decision_id))?
            .ok_or_else(|| CycleError::Validation("artifact references unknown decision".to_string()))?;
        let plan = self
            .store
            .get_plan(decision.plan_id)?
            .ok_or_else(|| CycleError::Validation("decision references unknown plan".to_string()))?;
        let catalyst = self
            .store
            .get_catalyst(plan.catalyst_id)?
            .ok_or_else(|| CycleError::Validation("plan references unknown catalyst".to_string()))?;

        // The chain must verify before anything is appended to it.
        verify_chain(self.store)?;

        if self.vows.active_vow()?.is_some() {
            self.vows.record_adherence(catalyst.catalyst_id)?;
        }

        let cycle_index = self.store.next_cycle_index()?;
        let observation = CycleObservation {
            cycle_index,
            time_critical: plan.time_critical,
            counterargument_substantive: decision
                .counterargument
                .as_deref()
                .is_some_and(|text| has_substance(text, SubstanceProfile::COUNTERARGUMENT)),
            probe_novelty_failure: plan
                .probes
                .iter()
                .any(|probe| probe.starts_with("novelty-failure:")),
            decomposition_complete: plan.decomposition_complete(),
            artifacts_produced: 1,
        };
        self.store.append_observation(&observation)?;

        let observations = self.store.list_observations()?;
        let window_start = observations
            .len()
            .saturating_sub(self.config.metrics.window);
        let external = external_indices(
            &retry_once("telemetry load", self.config.boundary_backoff, || {
                self.telemetry.load()
            })?,
        );
        let governance = GovernanceInputs {
            liberation_rate: self.vows.liberation_rate()?,
            vows: self.vows.snapshot()?,
            lineage_solid: true,
        };
        let snapshot = compute_snapshot(
            &observations[window_start..],
            &external,
            &governance,
            cycle_index,
        );
        self.store.append_snapshot(&snapshot)?;
        self.persist_governance()?;

        // Ledger batch, cycle-outcome entry last. Append is the only chain
        // mutation; nothing upstream rolls back.
        let decision_hash = commit(
            self.store,
            EntryType::Decision,
            json!({
                "decision_id": decision.decision_id.to_string(),
                "plan_id": decision.plan_id.to_string(),
                "choice": decision.choice,
                "confidence": decision.confidence,
                "counterargument": decision.counterargument,
            }),
            Vec::new(),
        )?;
        let artifact_hash = commit(
            self.store,
            EntryType::Artifact,
            json!({
                "artifact_id": artifact.artifact_id.to_string(),
                "kind": artifact.kind.as_str(),
                "title": artifact.title,
                "content_hash": artifact.content_hash,
                "signature": artifact.signature,
            }),
            vec![decision_hash.clone()],
        )?;
        let outcome_hash = commit(
            self.store,
            EntryType::CycleOutcome,
            json!({
                "cycle_index": cycle_index,
                "catalyst_id": catalyst.catalyst_id.to_string(),
                "plan_id": plan.plan_id.to_string(),
                "decision_id": decision.decision_id.to_string(),
                "artifact_ids": [artifact.artifact_id.to_string()],
                "snapshot": serde_json::to_value(&snapshot)?,
            }),
            vec![decision_hash, artifact_hash],
        )?;

        let snapshots = self.store.list_snapshots()?;
        let report = evaluate_stop_rule(&snapshots, &self.config.metrics);
        if report.holds {
            self.state = CycleState::Stopped;
            Ok(IntegrateOutcome::Stopped {
                snapshot,
                outcome_hash,
                reason: StopReason::StopRuleSatisfied,
            })
        } else {
            self.state = CycleState::Scan;
            Ok(IntegrateOutcome::Continue {
                snapshot,
                outcome_hash,
            })
        }
    }

    fn persist_governance(&self) -> Result<()> {
        let vow_rows = self.vows.snapshot()?;
        let active = self.vows.active_vow()?.map(|vow| vow.vow_id);
        let (total_cycles, liberations) = self.vows.counters()?;
        self.store
            .save_vow_registry(&vow_rows, active, total_cycles, liberations)?;
        self.store.save_heuristics(&self.heuristics.snapshot()?)?;
        Ok(())
    }

    /// Runs one full SCAN -> ARCHITECT -> EXECUTE -> INTEGRATE loop.
    /// Reaching STOPPED is a successful outcome, not an error.
    ///
    /// # Errors
    /// Propagates the first fatal error from any step.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome> {
        let catalyst = match self.scan()? {
            ScanOutcome::Stopped(reason) => return Ok(CycleOutcome::Stopped(reason)),
            ScanOutcome::Catalyst(catalyst) => catalyst,
        };
        let plan = self.architect(catalyst.catalyst_id)?;
        let execution = self.execute(plan.plan_id)?;
        let artifact_id = execution
            .artifacts
            .first()
            .map(|artifact| artifact.artifact_id)
            .ok_or_else(|| anyhow!("execution produced no artifact"))?;

        match self.integrate(artifact_id)? {
            IntegrateOutcome::Stopped { reason, .. } => Ok(CycleOutcome::Stopped(reason)),
            IntegrateOutcome::Continue { outcome_hash, .. } => Ok(CycleOutcome::Completed {
                catalyst_id: catalyst.catalyst_id,
                plan_id: plan.plan_id,
                decision_id: execution.decision.decision_id,
                outcome_hash,
            }),
        }
    }
}

fn decision_confidence(plan: &Plan, catalyst: &Catalyst) -> f32 {
    // Confidence leans on severity: sharper anomalies earn firmer commitments,
    // tempered when the plan is flagged time-critical.
    let base = 0.5 + catalyst.severity * 0.4;
    let adjusted = if plan.time_critical { base - 0.1 } else { base };
    adjusted.clamp(0.0, 1.0)
}

fn provenance_id(artifact: &Artifact, key: &str) -> Result<ulid::Ulid, CycleError> {
    let raw = artifact
        .provenance
        .get(key)
        .ok_or_else(|| CycleError::Validation(format!("artifact provenance missing {key}")))?;
    raw.parse()
        .map_err(|_| CycleError::Validation(format!("artifact provenance {key} is not a ULID")))
}

fn parse_anomalies(documents: &TelemetryDocuments) -> Result<Vec<AnomalyReading>, CycleError> {
    let mut readings = Vec::new();
    for (document, default_kind) in [
        (&documents.scan_anomalies, SourceKind::ScanTelemetry),
        (&documents.decision_trace, SourceKind::DecisionTrace),
        (&documents.growth_trajectory, SourceKind::GrowthTrajectory),
    ] {
        let Some(document) = document else {
            continue;
        };
        let Some(items) = document.get("anomalies").and_then(Value::as_array) else {
            continue;
        };
        for (index, item) in items.iter().enumerate() {
            readings.push(parse_anomaly(item, default_kind, index)?);
        }
    }
    Ok(readings)
}

#[allow(clippy::cast_possible_truncation)]
fn parse_anomaly(
    item: &Value,
    default_kind: SourceKind,
    index: usize,
) -> Result<AnomalyReading, CycleError> {
    let description = item
        .get("description")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            CycleError::Validation(format!("anomaly[{index}] missing description"))
        })?
        .to_string();

    let severity = item
        .get("severity")
        .and_then(Value::as_f64)
        .ok_or_else(|| CycleError::Validation(format!("anomaly[{index}] missing severity")))?;
    if !(0.0..=1.0).contains(&severity) {
        return Err(CycleError::Validation(format!(
            "anomaly[{index}] severity MUST be in [0.0, 1.0]"
        )));
    }

    let classification = match item.get("classification").and_then(Value::as_str) {
        Some(raw) => CatalystClass::parse(raw).ok_or_else(|| {
            CycleError::Validation(format!("anomaly[{index}] invalid classification '{raw}'"))
        })?,
        None => CatalystClass::Drift,
    };

    let source_kind = match item.get("source_kind").and_then(Value::as_str) {
        Some(raw) => SourceKind::parse(raw).ok_or_else(|| {
            CycleError::Validation(format!("anomaly[{index}] invalid source_kind '{raw}'"))
        })?,
        None => default_kind,
    };

    let evidence = match item.get("evidence").and_then(Value::as_array) {
        Some(items) => items
            .iter()
            .map(|entry| {
                entry
                    .as_str()
                    .map(ToString::to_string)
                    .ok_or_else(|| {
                        CycleError::Validation(format!(
                            "anomaly[{index}] evidence entries must be strings"
                        ))
                    })
            })
            .collect::<Result<Vec<String>, CycleError>>()?,
        None => Vec::new(),
    };

    let detected_at = match item.get("detected_at").and_then(Value::as_str) {
        Some(raw) => cycle_kernel_domain::parse_rfc3339_utc(raw)?,
        None => now_utc(),
    };

    Ok(AnomalyReading {
        source_kind,
        classification,
        description,
        severity: severity as f32,
        evidence,
        detected_at,
    })
}

/// Extracts the externally-sourced indices from the trace and growth
/// documents. Values are read, never derived; missing fields fall back to
/// the neutral defaults.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn external_indices(documents: &TelemetryDocuments) -> ExternalIndices {
    let mut indices = ExternalIndices::default();

    if let Some(trace) = &documents.decision_trace {
        if let Some(value) = trace.get("recovery_latency").and_then(Value::as_f64) {
            indices.recovery_latency = value as f32;
        }
        if let Some(value) = trace.get("capability_burst_count").and_then(Value::as_u64) {
            indices.capability_burst_count = u32::try_from(value).unwrap_or(u32::MAX);
        }
    }

    if let Some(growth) = &documents.growth_trajectory {
        if let Some(value) = growth
            .get("source_balance_entropy")
            .and_then(Value::as_f64)
        {
            indices.source_balance_entropy = value as f32;
        }
        if let Some(raw) = growth.get("classification").and_then(Value::as_str) {
            if let Some(class) = GrowthClass::parse(raw) {
                indices.growth_classification = class;
            }
        }
    }

    indices
}

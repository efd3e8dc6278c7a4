#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CycleError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("ledger integrity broken at index {index}: {detail}")]
    Integrity { index: usize, detail: String },
    #[error("io boundary failure: {0}")]
    Io(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CatalystId(pub Ulid);

impl CatalystId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CatalystId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CatalystId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PlanId(pub Ulid);

impl PlanId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for PlanId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DecisionId(pub Ulid);

impl DecisionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for DecisionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for DecisionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ArtifactId(pub Ulid);

impl ArtifactId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ArtifactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntryId(pub Ulid);

impl EntryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VowId(pub Ulid);

impl VowId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for VowId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for VowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HeuristicId(pub Ulid);

impl HeuristicId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for HeuristicId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for HeuristicId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    ScanTelemetry,
    DecisionTrace,
    GrowthTrajectory,
    Operator,
}

impl SourceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScanTelemetry => "scan_telemetry",
            Self::DecisionTrace => "decision_trace",
            Self::GrowthTrajectory => "growth_trajectory",
            Self::Operator => "operator",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scan_telemetry" => Some(Self::ScanTelemetry),
            "decision_trace" => Some(Self::DecisionTrace),
            "growth_trajectory" => Some(Self::GrowthTrajectory),
            "operator" => Some(Self::Operator),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CatalystClass {
    Regression,
    Drift,
    Contradiction,
    Stall,
    Opportunity,
}

impl CatalystClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regression => "regression",
            Self::Drift => "drift",
            Self::Contradiction => "contradiction",
            Self::Stall => "stall",
            Self::Opportunity => "opportunity",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "regression" => Some(Self::Regression),
            "drift" => Some(Self::Drift),
            "contradiction" => Some(Self::Contradiction),
            "stall" => Some(Self::Stall),
            "opportunity" => Some(Self::Opportunity),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Decision,
    Artifact,
    CycleOutcome,
    Governance,
}

impl EntryType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Artifact => "artifact",
            Self::CycleOutcome => "cycle_outcome",
            Self::Governance => "governance",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "decision" => Some(Self::Decision),
            "artifact" => Some(Self::Artifact),
            "cycle_outcome" => Some(Self::CycleOutcome),
            "governance" => Some(Self::Governance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Report,
    Directive,
    Patch,
    Note,
}

impl ArtifactKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Report => "report",
            Self::Directive => "directive",
            Self::Patch => "patch",
            Self::Note => "note",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "report" => Some(Self::Report),
            "directive" => Some(Self::Directive),
            "patch" => Some(Self::Patch),
            "note" => Some(Self::Note),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VowStatus {
    Declared,
    Active,
    Liberated,
}

impl VowStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Declared => "declared",
            Self::Active => "active",
            Self::Liberated => "liberated",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "declared" => Some(Self::Declared),
            "active" => Some(Self::Active),
            "liberated" => Some(Self::Liberated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HeuristicStatus {
    Active,
    Synthesized,
    Deprecated,
}

impl HeuristicStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Synthesized => "synthesized",
            Self::Deprecated => "deprecated",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "synthesized" => Some(Self::Synthesized),
            "deprecated" => Some(Self::Deprecated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GrowthClass {
    Growth,
    Plateau,
    Regression,
}

impl GrowthClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Growth => "growth",
            Self::Plateau => "plateau",
            Self::Regression => "regression",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "growth" => Some(Self::Growth),
            "plateau" => Some(Self::Plateau),
            "regression" => Some(Self::Regression),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Scan,
    Architect,
    Execute,
    Integrate,
    Stopped,
}

impl CycleState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Architect => "architect",
            Self::Execute => "execute",
            Self::Integrate => "integrate",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    NoCatalyst,
    StopRuleSatisfied,
}

impl StopReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoCatalyst => "no_catalyst",
            Self::StopRuleSatisfied => "stop_rule_satisfied",
        }
    }
}

/// A detected anomaly severe enough to drive one cycle. Immutable after
/// creation; only the scan step constructs these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Catalyst {
    pub catalyst_id: CatalystId,
    pub source_kind: SourceKind,
    pub classification: CatalystClass,
    pub description: String,
    pub severity: f32,
    pub evidence: Vec<String>,
    pub detected_at: DateTimeUtc,
    pub created_at: DateTimeUtc,
}

impl Catalyst {
    /// Validates the catalyst before it may enter a cycle.
    ///
    /// # Errors
    /// Returns [`CycleError::Validation`] when the description is empty or
    /// severity is outside `[0.0, 1.0]`.
    pub fn validate(&self) -> Result<(), CycleError> {
        if self.description.trim().is_empty() {
            return Err(CycleError::Validation(
                "catalyst description MUST be non-empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.severity) {
            return Err(CycleError::Validation(
                "catalyst severity MUST be in [0.0, 1.0]".to_string(),
            ));
        }
        Ok(())
    }
}

pub const DECOMPOSITION_KEYS: [&str; 3] = ["semantic", "structural", "proof"];

/// The synthesized thesis/antithesis/probe package for a catalyst, plus the
/// three-way decomposition that gates execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub plan_id: PlanId,
    pub catalyst_id: CatalystId,
    pub thesis: String,
    pub antithesis: String,
    pub probes: Vec<String>,
    pub decomposition: BTreeMap<String, String>,
    pub time_critical: bool,
    pub created_at: DateTimeUtc,
}

impl Plan {
    /// Validates the plan for execution eligibility.
    ///
    /// # Errors
    /// Returns [`CycleError::Validation`] when thesis or antithesis is empty
    /// or the decomposition is missing any of the three required keys.
    pub fn validate(&self) -> Result<(), CycleError> {
        if self.thesis.trim().is_empty() {
            return Err(CycleError::Validation(
                "plan thesis MUST be non-empty".to_string(),
            ));
        }
        if self.antithesis.trim().is_empty() {
            return Err(CycleError::Validation(
                "plan antithesis MUST be non-empty".to_string(),
            ));
        }
        for key in DECOMPOSITION_KEYS {
            match self.decomposition.get(key) {
                Some(value) if !value.trim().is_empty() => {}
                _ => {
                    return Err(CycleError::Validation(format!(
                        "plan decomposition MUST contain non-empty key '{key}'"
                    )));
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn decomposition_complete(&self) -> bool {
        DECOMPOSITION_KEYS.iter().all(|key| {
            self.decomposition
                .get(*key)
                .is_some_and(|value| !value.trim().is_empty())
        })
    }
}

/// The committed choice derived from a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub decision_id: DecisionId,
    pub plan_id: PlanId,
    pub choice: String,
    pub confidence: f32,
    pub counterargument: Option<String>,
    pub decided_at: DateTimeUtc,
}

impl Decision {
    /// Validates the decision against its owning plan.
    ///
    /// # Errors
    /// Returns [`CycleError::Validation`] when the choice is empty,
    /// confidence is out of range, or the plan is time-critical and the
    /// counterargument fails the substance gate.
    pub fn validate(&self, plan: &Plan) -> Result<(), CycleError> {
        if self.choice.trim().is_empty() {
            return Err(CycleError::Validation(
                "decision choice MUST be non-empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(CycleError::Validation(
                "decision confidence MUST be in [0.0, 1.0]".to_string(),
            ));
        }
        if plan.time_critical {
            let substantive = self
                .counterargument
                .as_deref()
                .is_some_and(|text| has_substance(text, SubstanceProfile::COUNTERARGUMENT));
            if !substantive {
                return Err(CycleError::Validation(
                    "time-critical decisions MUST carry a substantive counterargument".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// A compiled output of a cycle. The content hash is always recomputed from
/// content, never accepted from a caller.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Artifact {
    pub artifact_id: ArtifactId,
    pub kind: ArtifactKind,
    pub title: String,
    pub content_hash: String,
    pub storage_uri: String,
    pub signature: Option<String>,
    pub provenance: BTreeMap<String, String>,
    pub created_at: DateTimeUtc,
}

/// One hash-chained row of the append-only ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub entry_id: EntryId,
    pub entry_type: EntryType,
    pub payload: Value,
    pub parent_hashes: Vec<String>,
    pub prev_hash: Option<String>,
    pub hash: String,
    pub recorded_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Liberation {
    pub triggered_at: DateTimeUtc,
    pub diagnostics: Value,
    pub justification: String,
}

/// A standing constraint. Active until liberated; liberation may declare a
/// replacement vow linked through `replaced_by`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vow {
    pub vow_id: VowId,
    pub declared_at: DateTimeUtc,
    pub text: String,
    pub min_cycles: u32,
    pub status: VowStatus,
    pub adherence_log: Vec<CatalystId>,
    pub liberation: Option<Liberation>,
    pub replaced_by: Option<VowId>,
}

/// A confidence-scored rule consumed during plan synthesis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heuristic {
    pub heuristic_id: HeuristicId,
    pub principle: String,
    pub antecedents: Vec<HeuristicId>,
    pub confidence: f32,
    pub origin: DateTimeUtc,
    pub status: HeuristicStatus,
    pub application_count: u64,
    pub cycles_unused: u32,
}

/// Health indices computed once per integrate step. Append-only history;
/// the stop rule reads a trailing window of these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub cycle_index: u64,
    pub crisis_response: f32,
    pub synthesis_novelty: f32,
    pub decomposition_fidelity: f32,
    pub praxis: bool,
    pub liberation_rate: f32,
    pub recovery_latency: f32,
    pub source_balance_entropy: f32,
    pub capability_burst_count: u32,
    pub growth_classification: GrowthClass,
    pub scaffold_stability: f32,
    pub scaffold_mean_lifespan: f32,
    pub scaffold_assimilation_rate: f32,
    pub genesis_reproduction_rate: f32,
    pub trace_lineage_solidity: f32,
    pub computed_at: DateTimeUtc,
}

pub const EPISTEMIC_MARKERS: [&str; 7] = [
    "because",
    "evidence",
    "observed",
    "measured",
    "constraint",
    "discovered",
    "invalidated",
];

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SubstanceProfile {
    pub min_len: usize,
    pub min_markers: usize,
}

impl SubstanceProfile {
    /// The strict gate applied to vow liberation justifications.
    pub const LIBERATION: Self = Self {
        min_len: 100,
        min_markers: 3,
    };

    /// The lighter gate applied to time-critical decision counterarguments.
    pub const COUNTERARGUMENT: Self = Self {
        min_len: 40,
        min_markers: 1,
    };
}

#[must_use]
pub fn matched_markers(text: &str) -> Vec<&'static str> {
    let lowered = text.to_lowercase();
    EPISTEMIC_MARKERS
        .iter()
        .copied()
        .filter(|marker| lowered.contains(marker))
        .collect()
}

#[must_use]
pub fn has_substance(text: &str, profile: SubstanceProfile) -> bool {
    let trimmed = text.trim();
    trimmed.len() >= profile.min_len && matched_markers(trimmed).len() >= profile.min_markers
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Artifact content digest, tagged with its scheme.
#[must_use]
pub fn content_digest(content: &[u8]) -> String {
    format!("sha256:{}", hash_bytes(content))
}

/// Rebuilds a JSON value with every object's keys in sorted order, so that
/// semantically equal payloads serialize to identical bytes.
#[must_use]
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let ordered: BTreeMap<String, Value> = map
                .iter()
                .map(|(key, inner)| (key.clone(), canonicalize(inner)))
                .collect();
            ordered
                .into_iter()
                .collect::<serde_json::Map<String, Value>>()
                .into()
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Serializes a payload canonically (sorted keys at every level).
///
/// # Errors
/// Returns [`CycleError::Validation`] if serialization fails.
pub fn canonical_json(value: &Value) -> Result<String, CycleError> {
    serde_json::to_string(&canonicalize(value))
        .map_err(|err| CycleError::Validation(format!("payload not serializable: {err}")))
}

/// Chain hash for a ledger entry: digest of the canonical payload bytes
/// concatenated with the previous hash (empty for genesis).
///
/// # Errors
/// Returns [`CycleError::Validation`] if the payload cannot be serialized.
pub fn chain_hash(payload: &Value, prev_hash: Option<&str>) -> Result<String, CycleError> {
    let canonical = canonical_json(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.update(prev_hash.unwrap_or_default().as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Splits an opaque `<scheme>:<hex>` tag such as a signature or content hash.
#[must_use]
pub fn split_tag(tag: &str) -> Option<(&str, &str)> {
    let (scheme, body) = tag.split_once(':')?;
    if scheme.is_empty() || body.is_empty() {
        return None;
    }
    Some((scheme, body))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`CycleError::Validation`] when parsing fails or the timestamp is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<DateTimeUtc, CycleError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| CycleError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;
    if parsed.offset() != UtcOffset::UTC {
        return Err(CycleError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }
    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`CycleError::Validation`] when formatting fails.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String, CycleError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| CycleError::Validation(format!("failed to format timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_plan() -> Plan {
        let mut decomposition = BTreeMap::new();
        decomposition.insert("semantic".to_string(), "meaning shift".to_string());
        decomposition.insert("structural".to_string(), "module split".to_string());
        decomposition.insert("proof".to_string(), "replay check".to_string());
        Plan {
            plan_id: PlanId::new(),
            catalyst_id: CatalystId::new(),
            thesis: "raise the scan threshold".to_string(),
            antithesis: "keep the threshold, widen evidence".to_string(),
            probes: vec!["what invalidates the threshold?".to_string()],
            decomposition,
            time_critical: false,
            created_at: now_utc(),
        }
    }

    #[test]
    fn canonical_json_sorts_keys_at_every_level() {
        let left = json!({"b": 1, "a": {"z": true, "y": [ {"k2": 1, "k1": 2} ]}});
        let right = json!({"a": {"y": [ {"k1": 2, "k2": 1} ], "z": true}, "b": 1});
        assert_eq!(
            must_ok(canonical_json(&left)),
            must_ok(canonical_json(&right))
        );
    }

    #[test]
    fn chain_hash_changes_with_prev_hash() {
        let payload = json!({"outcome": "ok"});
        let genesis = must_ok(chain_hash(&payload, None));
        let linked = must_ok(chain_hash(&payload, Some(&genesis)));
        assert_ne!(genesis, linked);
    }

    #[test]
    fn chain_hash_is_stable_for_equal_payloads() {
        let first = must_ok(chain_hash(&json!({"b": 1, "a": 2}), Some("prev")));
        let second = must_ok(chain_hash(&json!({"a": 2, "b": 1}), Some("prev")));
        assert_eq!(first, second);
    }

    #[test]
    fn content_digest_carries_scheme_tag() {
        let digest = content_digest(b"artifact body");
        let (scheme, body) = split_tag(&digest).unwrap_or(("", ""));
        assert_eq!(scheme, "sha256");
        assert_eq!(body.len(), 64);
    }

    #[test]
    fn substance_gate_requires_length_and_markers() {
        let short = "because evidence observed";
        assert!(!has_substance(short, SubstanceProfile::LIBERATION));

        let long_no_markers = "x".repeat(120);
        assert!(!has_substance(&long_no_markers, SubstanceProfile::LIBERATION));

        let qualified = format!(
            "{} because the evidence we observed across ten cycles shows the constraint no longer binds",
            "padding ".repeat(5)
        );
        assert!(qualified.len() >= 100);
        assert!(has_substance(&qualified, SubstanceProfile::LIBERATION));
    }

    #[test]
    fn marker_match_is_case_insensitive() {
        let markers = matched_markers("BECAUSE we MEASURED and Observed");
        assert!(markers.contains(&"because"));
        assert!(markers.contains(&"measured"));
        assert!(markers.contains(&"observed"));
    }

    #[test]
    fn plan_validation_rejects_missing_decomposition_key() {
        let mut plan = fixture_plan();
        plan.decomposition.remove("proof");
        assert!(matches!(plan.validate(), Err(CycleError::Validation(_))));
        assert!(!plan.decomposition_complete());
    }

    #[test]
    fn plan_validation_rejects_blank_decomposition_value() {
        let mut plan = fixture_plan();
        plan.decomposition
            .insert("structural".to_string(), "   ".to_string());
        assert!(matches!(plan.validate(), Err(CycleError::Validation(_))));
    }

    #[test]
    fn time_critical_decision_needs_substantive_counterargument() {
        let mut plan = fixture_plan();
        plan.time_critical = true;

        let mut decision = Decision {
            decision_id: DecisionId::new(),
            plan_id: plan.plan_id,
            choice: "apply the directive".to_string(),
            confidence: 0.8,
            counterargument: Some("no".to_string()),
            decided_at: now_utc(),
        };
        assert!(matches!(
            decision.validate(&plan),
            Err(CycleError::Validation(_))
        ));

        decision.counterargument = Some(
            "the rollout could regress recovery latency because burst telemetry lags".to_string(),
        );
        assert!(decision.validate(&plan).is_ok());
    }

    #[test]
    fn non_time_critical_decision_allows_missing_counterargument() {
        let plan = fixture_plan();
        let decision = Decision {
            decision_id: DecisionId::new(),
            plan_id: plan.plan_id,
            choice: "defer".to_string(),
            confidence: 0.4,
            counterargument: None,
            decided_at: now_utc(),
        };
        assert!(decision.validate(&plan).is_ok());
    }

    #[test]
    fn catalyst_severity_bounds_are_enforced() {
        let mut catalyst = Catalyst {
            catalyst_id: CatalystId::new(),
            source_kind: SourceKind::ScanTelemetry,
            classification: CatalystClass::Drift,
            description: "confidence drift on scan channel".to_string(),
            severity: 0.6,
            evidence: vec!["trace-1".to_string()],
            detected_at: now_utc(),
            created_at: now_utc(),
        };
        assert!(catalyst.validate().is_ok());

        catalyst.severity = 1.2;
        assert!(matches!(
            catalyst.validate(),
            Err(CycleError::Validation(_))
        ));
    }

    #[test]
    fn enum_round_trips_are_total() {
        for kind in [
            SourceKind::ScanTelemetry,
            SourceKind::DecisionTrace,
            SourceKind::GrowthTrajectory,
            SourceKind::Operator,
        ] {
            assert_eq!(SourceKind::parse(kind.as_str()), Some(kind));
        }
        for entry_type in [
            EntryType::Decision,
            EntryType::Artifact,
            EntryType::CycleOutcome,
            EntryType::Governance,
        ] {
            assert_eq!(EntryType::parse(entry_type.as_str()), Some(entry_type));
        }
        assert_eq!(GrowthClass::parse("plateau"), Some(GrowthClass::Plateau));
        assert_eq!(GrowthClass::parse("unknown"), None);
    }
}

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use anyhow::{anyhow, Result};
use cycle_kernel_domain::{Catalyst, Heuristic};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

pub const DEFAULT_NOVELTY_WINDOW: usize = 10;

/// The four argumentation roles, in their fixed execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Thesis,
    Antithesis,
    Probe,
    Validation,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Thesis => "thesis",
            Self::Antithesis => "antithesis",
            Self::Probe => "probe",
            Self::Validation => "validation",
        }
    }
}

/// A probe output plus whether the novelty guarantee failed for it.
/// Novelty failures are escalation signals, never silent fallbacks.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProbeOutcome {
    pub text: String,
    pub novelty_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationVerdict {
    pub coherent: bool,
    pub confidence: f32,
    pub notes: Vec<String>,
}

/// One complete thesis/antithesis/probe/validation tuple.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Synthesis {
    pub thesis: String,
    pub antithesis: String,
    pub probe: ProbeOutcome,
    pub validation: ValidationVerdict,
}

impl Synthesis {
    /// Deterministic three-way decomposition of the synthesis, keyed by
    /// `semantic`/`structural`/`proof` for plan assembly.
    #[must_use]
    pub fn decomposition(&self, catalyst: &Catalyst) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(
            "semantic".to_string(),
            format!(
                "position: {} / counter-position: {}",
                self.thesis, self.antithesis
            ),
        );
        map.insert(
            "structural".to_string(),
            format!(
                "{} anomaly on {} touching {} evidence reference(s)",
                catalyst.classification.as_str(),
                catalyst.source_kind.as_str(),
                catalyst.evidence.len()
            ),
        );
        map.insert(
            "proof".to_string(),
            format!(
                "validation verdict coherent={} confidence={:.2}; open probe: {}",
                self.validation.coherent, self.validation.confidence, self.probe.text
            ),
        );
        map
    }
}

/// Bounded ring buffer of the last K probe texts. Exact last-K semantics
/// with bounded memory.
#[derive(Debug, Clone)]
pub struct NoveltyWindow {
    capacity: usize,
    recent: VecDeque<String>,
}

impl NoveltyWindow {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            recent: VecDeque::new(),
        }
    }

    /// Seeds the window from persisted probe history, oldest first.
    #[must_use]
    pub fn from_history(capacity: usize, history: Vec<String>) -> Self {
        let mut window = Self::new(capacity);
        for text in history {
            window.push(text);
        }
        window
    }

    #[must_use]
    pub fn contains(&self, text: &str) -> bool {
        self.recent.iter().any(|seen| seen == text)
    }

    pub fn push(&mut self, text: String) {
        self.recent.push_back(text);
        while self.recent.len() > self.capacity {
            let _ = self.recent.pop_front();
        }
    }

    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.recent.iter().cloned().collect()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Narrow contract for the text-generation backend behind the three
/// generative roles. Validation is computed by the engine, not generated.
pub trait RoleGenerator {
    fn generator_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn thesis(&self, catalyst: &Catalyst, heuristics: &[Heuristic]) -> Result<String>;

    #[allow(clippy::missing_errors_doc)]
    fn antithesis(&self, catalyst: &Catalyst, thesis: &str) -> Result<String>;

    #[allow(clippy::missing_errors_doc)]
    fn probe_candidates(
        &self,
        catalyst: &Catalyst,
        thesis: &str,
        antithesis: &str,
    ) -> Result<Vec<String>>;
}

/// Runs the four roles in their fixed order and enforces the probe novelty
/// window. The engine owns the window; callers persist it between cycles.
pub struct DialecticEngine<G: RoleGenerator> {
    generator: G,
    window: NoveltyWindow,
}

impl<G: RoleGenerator> DialecticEngine<G> {
    pub fn new(generator: G, window: NoveltyWindow) -> Self {
        Self { generator, window }
    }

    #[must_use]
    pub fn window(&self) -> &NoveltyWindow {
        &self.window
    }

    /// Produces the full synthesis tuple: thesis, then antithesis, then a
    /// probe checked against the novelty window, then the validation verdict
    /// over all three. The order is fixed; validation never runs early.
    ///
    /// # Errors
    /// Returns an error when the underlying generator fails.
    pub fn synthesize(
        &mut self,
        catalyst: &Catalyst,
        heuristics: &[Heuristic],
    ) -> Result<Synthesis> {
        let thesis = self.generator.thesis(catalyst, heuristics)?;
        if thesis.trim().is_empty() {
            return Err(anyhow!("generator produced an empty thesis"));
        }

        let antithesis = self.generator.antithesis(catalyst, &thesis)?;
        if antithesis.trim().is_empty() {
            return Err(anyhow!("generator produced an empty antithesis"));
        }

        let probe = self.next_probe(catalyst, &thesis, &antithesis)?;
        let validation = validate_tuple(&thesis, &antithesis, &probe);

        Ok(Synthesis {
            thesis,
            antithesis,
            probe,
            validation,
        })
    }

    fn next_probe(
        &mut self,
        catalyst: &Catalyst,
        thesis: &str,
        antithesis: &str,
    ) -> Result<ProbeOutcome> {
        let candidates = self
            .generator
            .probe_candidates(catalyst, thesis, antithesis)?;

        for candidate in candidates {
            let trimmed = candidate.trim();
            if trimmed.is_empty() || self.window.contains(trimmed) {
                continue;
            }
            self.window.push(trimmed.to_string());
            return Ok(ProbeOutcome {
                text: trimmed.to_string(),
                novelty_failure: false,
            });
        }

        // Exhausted every candidate inside the window: surface the failure
        // explicitly so the caller can escalate it into stop-risk metrics.
        Ok(ProbeOutcome {
            text: format!(
                "novelty-failure: no probe distinct from the last {} for {} anomaly",
                self.window.capacity(),
                catalyst.classification.as_str()
            ),
            novelty_failure: true,
        })
    }
}

/// Structural coherence check over a completed tuple. Pure function of its
/// inputs; runs only after all three generative roles exist.
#[must_use]
pub fn validate_tuple(thesis: &str, antithesis: &str, probe: &ProbeOutcome) -> ValidationVerdict {
    let mut notes = Vec::new();
    let mut confidence: f32 = 1.0;

    if thesis.trim().eq_ignore_ascii_case(antithesis.trim()) {
        notes.push("antithesis restates the thesis verbatim".to_string());
        confidence -= 0.5;
    }
    if probe.novelty_failure {
        notes.push("probe novelty exhausted".to_string());
        confidence -= 0.3;
    }
    if probe.text.trim() == thesis.trim() || probe.text.trim() == antithesis.trim() {
        notes.push("probe restates a position instead of questioning it".to_string());
        confidence -= 0.3;
    }

    let confidence = confidence.max(0.0);
    ValidationVerdict {
        coherent: notes.is_empty(),
        confidence,
        notes,
    }
}

fn catalyst_seed(catalyst: &Catalyst) -> String {
    let mut hasher = Sha256::new();
    hasher.update(catalyst.catalyst_id.to_string().as_bytes());
    hasher.update(catalyst.description.as_bytes());
    hex::encode(hasher.finalize())
}

/// Deterministic template backend. Wording is seeded by a catalyst digest so
/// repeated runs over the same catalyst stay reproducible.
#[derive(Debug, Clone)]
pub struct TemplateGenerator {
    backend_version: String,
}

impl Default for TemplateGenerator {
    fn default() -> Self {
        Self {
            backend_version: "template.v1".to_string(),
        }
    }
}

impl TemplateGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoleGenerator for TemplateGenerator {
    fn generator_name(&self) -> &'static str {
        "template"
    }

    fn thesis(&self, catalyst: &Catalyst, heuristics: &[Heuristic]) -> Result<String> {
        let guidance = heuristics
            .first()
            .map_or_else(|| "first principles".to_string(), |h| h.principle.clone());
        Ok(format!(
            "address the {} anomaly ({}) directly, guided by '{}'",
            catalyst.classification.as_str(),
            catalyst.description,
            guidance
        ))
    }

    fn antithesis(&self, catalyst: &Catalyst, thesis: &str) -> Result<String> {
        Ok(format!(
            "defer action on '{}': severity {:.2} may not justify intervention before the next \
             scan confirms the signal ({})",
            catalyst.description,
            catalyst.severity,
            short_token(thesis)
        ))
    }

    fn probe_candidates(
        &self,
        catalyst: &Catalyst,
        _thesis: &str,
        _antithesis: &str,
    ) -> Result<Vec<String>> {
        let seed = catalyst_seed(catalyst);
        let token = &seed[..12];
        Ok(vec![
            format!(
                "what observation would falsify the {} reading of {token}?",
                catalyst.classification.as_str()
            ),
            format!(
                "which evidence reference, if removed, collapses the case for acting on {token}?"
            ),
            format!(
                "is severity {:.2} an artifact of the {} channel rather than the system? ({token})",
                catalyst.severity,
                catalyst.source_kind.as_str()
            ),
            format!("what does inaction cost by the next integrate step? ({token})"),
            format!(
                "does the proposed response survive a repeat of the {} trigger? ({token})",
                catalyst.classification.as_str()
            ),
            format!("{}-{}", self.backend_version, token),
        ])
    }
}

fn short_token(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize()).chars().take(8).collect()
}

/// HTTP JSON backend: POSTs role requests to a configured endpoint.
#[derive(Debug, Clone)]
pub struct HttpJsonGenerator {
    config: HttpGeneratorConfig,
    backend_version: String,
}

impl HttpJsonGenerator {
    /// Builds a generator from backend params.
    ///
    /// # Errors
    /// Returns an error when required params (`url`) are missing or malformed.
    pub fn from_params(params: &Value) -> Result<Self> {
        Ok(Self {
            config: HttpGeneratorConfig::from_params(params)?,
            backend_version: "http_json.v1".to_string(),
        })
    }

    fn post(&self, body: &Value) -> Result<Value> {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .build();

        let mut request = agent
            .request("POST", &self.config.url)
            .set("content-type", "application/json");
        for (header, value) in &self.config.headers {
            request = request.set(header, value);
        }
        if let Some(token) = &self.config.auth_bearer_token {
            request = request.set("authorization", &format!("Bearer {token}"));
        }

        match request.send_json(body) {
            Ok(response) => Ok(response.into_json()?),
            Err(ureq::Error::Status(code, _)) => {
                Err(anyhow!("generator endpoint returned http status {code}"))
            }
            Err(ureq::Error::Transport(err)) => Err(anyhow!("http transport failure: {err}")),
        }
    }

    fn role_request(&self, role: Role, catalyst: &Catalyst, context: Value) -> Value {
        json!({
            "backend_version": self.backend_version,
            "role": role.as_str(),
            "catalyst": {
                "catalyst_id": catalyst.catalyst_id.to_string(),
                "classification": catalyst.classification.as_str(),
                "description": catalyst.description,
                "severity": catalyst.severity,
            },
            "context": context,
        })
    }
}

impl RoleGenerator for HttpJsonGenerator {
    fn generator_name(&self) -> &'static str {
        "http_json"
    }

    fn thesis(&self, catalyst: &Catalyst, heuristics: &[Heuristic]) -> Result<String> {
        let principles: Vec<&str> = heuristics
            .iter()
            .map(|heuristic| heuristic.principle.as_str())
            .collect();
        let body = self.role_request(Role::Thesis, catalyst, json!({"heuristics": principles}));
        let response = self.post(&body)?;
        extract_text(&response)
    }

    fn antithesis(&self, catalyst: &Catalyst, thesis: &str) -> Result<String> {
        let body = self.role_request(Role::Antithesis, catalyst, json!({"thesis": thesis}));
        let response = self.post(&body)?;
        extract_text(&response)
    }

    fn probe_candidates(
        &self,
        catalyst: &Catalyst,
        thesis: &str,
        antithesis: &str,
    ) -> Result<Vec<String>> {
        let body = self.role_request(
            Role::Probe,
            catalyst,
            json!({"thesis": thesis, "antithesis": antithesis}),
        );
        let response = self.post(&body)?;
        let candidates = response
            .get("candidates")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("generator response missing 'candidates' array"))?;
        candidates
            .iter()
            .map(|item| {
                item.as_str()
                    .map(ToString::to_string)
                    .ok_or_else(|| anyhow!("'candidates' entries must be strings"))
            })
            .collect()
    }
}

fn extract_text(response: &Value) -> Result<String> {
    response
        .get("text")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| anyhow!("generator response missing 'text' field"))
}

#[derive(Debug, Clone)]
struct HttpGeneratorConfig {
    url: String,
    timeout_ms: u64,
    headers: BTreeMap<String, String>,
    auth_bearer_token: Option<String>,
}

impl HttpGeneratorConfig {
    fn from_params(params: &Value) -> Result<Self> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("http_json generator requires params.url"))?
            .to_string();

        let timeout_ms = params
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .unwrap_or(30_000);

        let mut headers = BTreeMap::new();
        if let Some(raw_headers) = params.get("headers") {
            let object = raw_headers
                .as_object()
                .ok_or_else(|| anyhow!("params.headers must be an object"))?;
            for (key, value) in object {
                let text = value.as_str().ok_or_else(|| {
                    anyhow!("params.headers values must be strings, key='{key}'")
                })?;
                headers.insert(key.clone(), text.to_string());
            }
        }

        let auth_bearer_token =
            if let Some(env_name) = params.get("auth_bearer_env").and_then(Value::as_str) {
                Some(std::env::var(env_name).map_err(|_| {
                    anyhow!("missing env var '{env_name}' required by params.auth_bearer_env")
                })?)
            } else {
                None
            };

        Ok(Self {
            url,
            timeout_ms,
            headers,
            auth_bearer_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cycle_kernel_domain::{now_utc, CatalystClass, CatalystId, SourceKind};

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_catalyst() -> Catalyst {
        Catalyst {
            catalyst_id: CatalystId::new(),
            source_kind: SourceKind::ScanTelemetry,
            classification: CatalystClass::Drift,
            description: "scan channel confidence drifting downward".to_string(),
            severity: 0.7,
            evidence: vec!["trace-11".to_string(), "trace-12".to_string()],
            detected_at: now_utc(),
            created_at: now_utc(),
        }
    }

    /// Generator with a fixed pool of distinct probes, for window tests.
    struct PoolGenerator {
        pool: Vec<String>,
    }

    impl PoolGenerator {
        fn with_pool_size(size: usize) -> Self {
            Self {
                pool: (0..size).map(|index| format!("probe-{index}")).collect(),
            }
        }
    }

    impl RoleGenerator for PoolGenerator {
        fn generator_name(&self) -> &'static str {
            "pool"
        }

        fn thesis(&self, _catalyst: &Catalyst, _heuristics: &[Heuristic]) -> Result<String> {
            Ok("act now".to_string())
        }

        fn antithesis(&self, _catalyst: &Catalyst, _thesis: &str) -> Result<String> {
            Ok("wait one cycle".to_string())
        }

        fn probe_candidates(
            &self,
            _catalyst: &Catalyst,
            _thesis: &str,
            _antithesis: &str,
        ) -> Result<Vec<String>> {
            Ok(self.pool.clone())
        }
    }

    #[test]
    fn window_keeps_exactly_last_k_entries() {
        let mut window = NoveltyWindow::new(3);
        for index in 0..5 {
            window.push(format!("p{index}"));
        }
        assert_eq!(window.entries(), vec!["p2", "p3", "p4"]);
        assert!(!window.contains("p1"));
        assert!(window.contains("p4"));
    }

    #[test]
    fn ten_candidate_pool_fails_novelty_within_eleven_generations() {
        let generator = PoolGenerator::with_pool_size(10);
        let mut engine =
            DialecticEngine::new(generator, NoveltyWindow::new(DEFAULT_NOVELTY_WINDOW));
        let catalyst = fixture_catalyst();

        let mut failures = 0;
        for _ in 0..11 {
            let synthesis = must(engine.synthesize(&catalyst, &[]));
            if synthesis.probe.novelty_failure {
                failures += 1;
            }
        }
        assert!(failures >= 1);
    }

    #[test]
    fn novelty_failure_is_explicit_and_lowers_validation_confidence() {
        let generator = PoolGenerator::with_pool_size(1);
        let mut engine = DialecticEngine::new(generator, NoveltyWindow::new(10));
        let catalyst = fixture_catalyst();

        let first = must(engine.synthesize(&catalyst, &[]));
        assert!(!first.probe.novelty_failure);
        assert!(first.validation.coherent);

        let second = must(engine.synthesize(&catalyst, &[]));
        assert!(second.probe.novelty_failure);
        assert!(second.probe.text.starts_with("novelty-failure"));
        assert!(!second.validation.coherent);
        assert!(second.validation.confidence < first.validation.confidence);
    }

    #[test]
    fn window_seeded_from_history_blocks_repeats() {
        let history = vec!["probe-0".to_string(), "probe-1".to_string()];
        let generator = PoolGenerator::with_pool_size(2);
        let mut engine = DialecticEngine::new(generator, NoveltyWindow::from_history(10, history));
        let catalyst = fixture_catalyst();

        let synthesis = must(engine.synthesize(&catalyst, &[]));
        assert!(synthesis.probe.novelty_failure);
    }

    #[test]
    fn template_generator_is_deterministic_per_catalyst() {
        let catalyst = fixture_catalyst();
        let generator = TemplateGenerator::new();

        let first = must(generator.probe_candidates(&catalyst, "t", "a"));
        let second = must(generator.probe_candidates(&catalyst, "t", "a"));
        assert_eq!(first, second);
        assert!(first.len() >= 5);
    }

    #[test]
    fn synthesis_runs_roles_in_fixed_order_and_validates_last() {
        let catalyst = fixture_catalyst();
        let mut engine = DialecticEngine::new(TemplateGenerator::new(), NoveltyWindow::new(10));

        let synthesis = must(engine.synthesize(&catalyst, &[]));
        assert!(!synthesis.thesis.is_empty());
        assert!(!synthesis.antithesis.is_empty());
        assert_ne!(synthesis.thesis, synthesis.antithesis);
        assert!(synthesis.validation.coherent);

        let decomposition = synthesis.decomposition(&catalyst);
        for key in cycle_kernel_domain::DECOMPOSITION_KEYS {
            assert!(decomposition.contains_key(key));
        }
    }

    #[test]
    fn validation_flags_thesis_restated_as_antithesis() {
        let probe = ProbeOutcome {
            text: "what would falsify this?".to_string(),
            novelty_failure: false,
        };
        let verdict = validate_tuple("same position", "same position", &probe);
        assert!(!verdict.coherent);
        assert!(verdict.confidence < 1.0);
    }

    #[test]
    fn http_generator_requires_url() {
        assert!(HttpJsonGenerator::from_params(&json!({})).is_err());
        assert!(HttpJsonGenerator::from_params(&json!({"url": "http://localhost:9"})).is_ok());
    }
}

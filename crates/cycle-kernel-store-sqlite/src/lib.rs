#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use cycle_kernel_domain::{
    format_rfc3339, now_utc, parse_rfc3339_utc, Artifact, ArtifactId, ArtifactKind, Catalyst,
    CatalystClass, CatalystId, Decision, DecisionId, EntryId, EntryType, Heuristic, HeuristicId,
    HeuristicStatus, LedgerEntry, Liberation, MetricsSnapshot, Plan, PlanId, SourceKind, Vow,
    VowId, VowStatus,
};
use cycle_kernel_ledger::LedgerStore;
use cycle_kernel_metrics::CycleObservation;
use rusqlite::{params, Connection, OptionalExtension};
use ulid::Ulid;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger_entries (
  entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  entry_type TEXT NOT NULL CHECK (
    entry_type IN ('decision', 'artifact', 'cycle_outcome', 'governance')
  ),
  payload_json TEXT NOT NULL,
  parent_hashes_json TEXT NOT NULL,
  prev_hash TEXT,
  hash TEXT NOT NULL UNIQUE,
  recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ledger_entries_hash ON ledger_entries(hash);
CREATE INDEX IF NOT EXISTS idx_ledger_entries_type_seq ON ledger_entries(entry_type, entry_seq);

CREATE TRIGGER IF NOT EXISTS trg_ledger_entries_no_update
BEFORE UPDATE ON ledger_entries
BEGIN
  SELECT RAISE(FAIL, 'ledger_entries is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_ledger_entries_no_delete
BEFORE DELETE ON ledger_entries
BEGIN
  SELECT RAISE(FAIL, 'ledger_entries is append-only');
END;

CREATE TABLE IF NOT EXISTS catalysts (
  catalyst_id TEXT PRIMARY KEY,
  source_kind TEXT NOT NULL CHECK (
    source_kind IN ('scan_telemetry', 'decision_trace', 'growth_trajectory', 'operator')
  ),
  classification TEXT NOT NULL CHECK (
    classification IN ('regression', 'drift', 'contradiction', 'stall', 'opportunity')
  ),
  description TEXT NOT NULL,
  severity REAL NOT NULL CHECK (severity BETWEEN 0.0 AND 1.0),
  evidence_json TEXT NOT NULL,
  detected_at TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS plans (
  plan_id TEXT PRIMARY KEY,
  catalyst_id TEXT NOT NULL,
  thesis TEXT NOT NULL,
  antithesis TEXT NOT NULL,
  probes_json TEXT NOT NULL,
  decomposition_json TEXT NOT NULL,
  time_critical INTEGER NOT NULL CHECK (time_critical IN (0, 1)),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS decisions (
  decision_id TEXT PRIMARY KEY,
  plan_id TEXT NOT NULL,
  choice TEXT NOT NULL,
  confidence REAL NOT NULL CHECK (confidence BETWEEN 0.0 AND 1.0),
  counterargument TEXT,
  decided_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS artifacts (
  artifact_id TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK (kind IN ('report', 'directive', 'patch', 'note')),
  title TEXT NOT NULL,
  content_hash TEXT NOT NULL,
  storage_uri TEXT NOT NULL,
  signature TEXT,
  provenance_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS metrics_snapshots (
  cycle_index INTEGER PRIMARY KEY,
  crisis_response REAL NOT NULL CHECK (crisis_response BETWEEN 0.0 AND 1.0),
  synthesis_novelty REAL NOT NULL CHECK (synthesis_novelty BETWEEN 0.0 AND 1.0),
  decomposition_fidelity REAL NOT NULL CHECK (decomposition_fidelity BETWEEN 0.0 AND 1.0),
  praxis INTEGER NOT NULL CHECK (praxis IN (0, 1)),
  liberation_rate REAL NOT NULL CHECK (liberation_rate BETWEEN 0.0 AND 1.0),
  recovery_latency REAL NOT NULL,
  source_balance_entropy REAL NOT NULL,
  capability_burst_count INTEGER NOT NULL CHECK (capability_burst_count >= 0),
  growth_classification TEXT NOT NULL CHECK (
    growth_classification IN ('growth', 'plateau', 'regression')
  ),
  scaffold_stability REAL NOT NULL,
  scaffold_mean_lifespan REAL NOT NULL,
  scaffold_assimilation_rate REAL NOT NULL,
  genesis_reproduction_rate REAL NOT NULL,
  trace_lineage_solidity REAL NOT NULL,
  computed_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_metrics_snapshots_no_update
BEFORE UPDATE ON metrics_snapshots
BEGIN
  SELECT RAISE(FAIL, 'metrics_snapshots is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_metrics_snapshots_no_delete
BEFORE DELETE ON metrics_snapshots
BEGIN
  SELECT RAISE(FAIL, 'metrics_snapshots is append-only');
END;

CREATE TABLE IF NOT EXISTS cycle_observations (
  cycle_index INTEGER PRIMARY KEY,
  time_critical INTEGER NOT NULL CHECK (time_critical IN (0, 1)),
  counterargument_substantive INTEGER NOT NULL CHECK (counterargument_substantive IN (0, 1)),
  probe_novelty_failure INTEGER NOT NULL CHECK (probe_novelty_failure IN (0, 1)),
  decomposition_complete INTEGER NOT NULL CHECK (decomposition_complete IN (0, 1)),
  artifacts_produced INTEGER NOT NULL CHECK (artifacts_produced >= 0)
);

CREATE TRIGGER IF NOT EXISTS trg_cycle_observations_no_update
BEFORE UPDATE ON cycle_observations
BEGIN
  SELECT RAISE(FAIL, 'cycle_observations is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_cycle_observations_no_delete
BEFORE DELETE ON cycle_observations
BEGIN
  SELECT RAISE(FAIL, 'cycle_observations is append-only');
END;

CREATE TABLE IF NOT EXISTS vows (
  vow_id TEXT PRIMARY KEY,
  declared_at TEXT NOT NULL,
  text TEXT NOT NULL,
  min_cycles INTEGER NOT NULL CHECK (min_cycles >= 0),
  status TEXT NOT NULL CHECK (status IN ('declared', 'active', 'liberated')),
  adherence_json TEXT NOT NULL,
  liberation_json TEXT,
  replaced_by TEXT
);

CREATE TABLE IF NOT EXISTS vow_registry_state (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  active_vow_id TEXT,
  total_cycles INTEGER NOT NULL CHECK (total_cycles >= 0),
  liberations INTEGER NOT NULL CHECK (liberations >= 0)
);

CREATE TABLE IF NOT EXISTS heuristics (
  heuristic_id TEXT PRIMARY KEY,
  principle TEXT NOT NULL,
  antecedents_json TEXT NOT NULL,
  confidence REAL NOT NULL CHECK (confidence BETWEEN 0.0 AND 1.0),
  origin TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('active', 'synthesized', 'deprecated')),
  application_count INTEGER NOT NULL CHECK (application_count >= 0),
  cycles_unused INTEGER NOT NULL CHECK (cycles_unused >= 0)
);

CREATE TABLE IF NOT EXISTS probe_history (
  probe_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  probe_text TEXT NOT NULL,
  novelty_failure INTEGER NOT NULL CHECK (novelty_failure IN (0, 1)),
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_probe_history_no_update
BEFORE UPDATE ON probe_history
BEGIN
  SELECT RAISE(FAIL, 'probe_history is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_probe_history_no_delete
BEFORE DELETE ON probe_history
BEGIN
  SELECT RAISE(FAIL, 'probe_history is append-only');
END;
";

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create the cycle database and configure local pragmas.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply cycle schema")?;

        let now = rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, now],
            )
            .context("failed to record migration")?;
        Ok(())
    }

    pub fn insert_catalyst(&self, catalyst: &Catalyst) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO catalysts(
                    catalyst_id, source_kind, classification, description,
                    severity, evidence_json, detected_at, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    catalyst.catalyst_id.to_string(),
                    catalyst.source_kind.as_str(),
                    catalyst.classification.as_str(),
                    catalyst.description,
                    f64::from(catalyst.severity),
                    serde_json::to_string(&catalyst.evidence)?,
                    rfc3339(catalyst.detected_at)?,
                    rfc3339(catalyst.created_at)?,
                ],
            )
            .context("failed to insert catalyst")?;
        Ok(())
    }

    pub fn get_catalyst(&self, catalyst_id: CatalystId) -> Result<Option<Catalyst>> {
        let mut stmt = self.conn.prepare(
            "SELECT catalyst_id, source_kind, classification, description,
                    severity, evidence_json, detected_at, created_at
             FROM catalysts WHERE catalyst_id = ?1",
        )?;
        let row = stmt
            .query_row(params![catalyst_id.to_string()], read_catalyst_row)
            .optional()?;
        row.transpose()
    }

    pub fn list_catalysts(&self) -> Result<Vec<Catalyst>> {
        let mut stmt = self.conn.prepare(
            "SELECT catalyst_id, source_kind, classification, description,
                    severity, evidence_json, detected_at, created_at
             FROM catalysts ORDER BY catalyst_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_catalyst_row(row)??);
        }
        Ok(out)
    }

    pub fn insert_plan(&self, plan: &Plan) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO plans(
                    plan_id, catalyst_id, thesis, antithesis,
                    probes_json, decomposition_json, time_critical, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    plan.plan_id.to_string(),
                    plan.catalyst_id.to_string(),
                    plan.thesis,
                    plan.antithesis,
                    serde_json::to_string(&plan.probes)?,
                    serde_json::to_string(&plan.decomposition)?,
                    i64::from(plan.time_critical),
                    rfc3339(plan.created_at)?,
                ],
            )
            .context("failed to insert plan")?;
        Ok(())
    }

    pub fn get_plan(&self, plan_id: PlanId) -> Result<Option<Plan>> {
        let mut stmt = self.conn.prepare(
            "SELECT plan_id, catalyst_id, thesis, antithesis,
                    probes_json, decomposition_json, time_critical, created_at
             FROM plans WHERE plan_id = ?1",
        )?;
        let row = stmt
            .query_row(params![plan_id.to_string()], read_plan_row)
            .optional()?;
        row.transpose()
    }

    pub fn insert_decision(&self, decision: &Decision) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO decisions(
                    decision_id, plan_id, choice, confidence, counterargument, decided_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    decision.decision_id.to_string(),
                    decision.plan_id.to_string(),
                    decision.choice,
                    f64::from(decision.confidence),
                    decision.counterargument,
                    rfc3339(decision.decided_at)?,
                ],
            )
            .context("failed to insert decision")?;
        Ok(())
    }

    pub fn get_decision(&self, decision_id: DecisionId) -> Result<Option<Decision>> {
        let mut stmt = self.conn.prepare(
            "SELECT decision_id, plan_id, choice, confidence, counterargument, decided_at
             FROM decisions WHERE decision_id = ?1",
        )?;
        let row = stmt
            .query_row(params![decision_id.to_string()], read_decision_row)
            .optional()?;
        row.transpose()
    }

    pub fn insert_artifact(&self, artifact: &Artifact) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO artifacts(
                    artifact_id, kind, title, content_hash,
                    storage_uri, signature, provenance_json, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    artifact.artifact_id.to_string(),
                    artifact.kind.as_str(),
                    artifact.title,
                    artifact.content_hash,
                    artifact.storage_uri,
                    artifact.signature,
                    serde_json::to_string(&artifact.provenance)?,
                    rfc3339(artifact.created_at)?,
                ],
            )
            .context("failed to insert artifact")?;
        Ok(())
    }

    pub fn get_artifact(&self, artifact_id: ArtifactId) -> Result<Option<Artifact>> {
        let mut stmt = self.conn.prepare(
            "SELECT artifact_id, kind, title, content_hash,
                    storage_uri, signature, provenance_json, created_at
             FROM artifacts WHERE artifact_id = ?1",
        )?;
        let row = stmt
            .query_row(params![artifact_id.to_string()], read_artifact_row)
            .optional()?;
        row.transpose()
    }

    pub fn append_snapshot(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO metrics_snapshots(
                    cycle_index, crisis_response, synthesis_novelty, decomposition_fidelity,
                    praxis, liberation_rate, recovery_latency, source_balance_entropy,
                    capability_burst_count, growth_classification, scaffold_stability,
                    scaffold_mean_lifespan, scaffold_assimilation_rate,
                    genesis_reproduction_rate, trace_lineage_solidity, computed_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    i64::try_from(snapshot.cycle_index)
                        .map_err(|_| anyhow!("cycle_index too large for sqlite"))?,
                    f64::from(snapshot.crisis_response),
                    f64::from(snapshot.synthesis_novelty),
                    f64::from(snapshot.decomposition_fidelity),
                    i64::from(snapshot.praxis),
                    f64::from(snapshot.liberation_rate),
                    f64::from(snapshot.recovery_latency),
                    f64::from(snapshot.source_balance_entropy),
                    i64::from(snapshot.capability_burst_count),
                    snapshot.growth_classification.as_str(),
                    f64::from(snapshot.scaffold_stability),
                    f64::from(snapshot.scaffold_mean_lifespan),
                    f64::from(snapshot.scaffold_assimilation_rate),
                    f64::from(snapshot.genesis_reproduction_rate),
                    f64::from(snapshot.trace_lineage_solidity),
                    rfc3339(snapshot.computed_at)?,
                ],
            )
            .context("failed to append metrics snapshot")?;
        Ok(())
    }

    pub fn list_snapshots(&self) -> Result<Vec<MetricsSnapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT cycle_index, crisis_response, synthesis_novelty, decomposition_fidelity,
                    praxis, liberation_rate, recovery_latency, source_balance_entropy,
                    capability_burst_count, growth_classification, scaffold_stability,
                    scaffold_mean_lifespan, scaffold_assimilation_rate,
                    genesis_reproduction_rate, trace_lineage_solidity, computed_at
             FROM metrics_snapshots ORDER BY cycle_index ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_snapshot_row(row)??);
        }
        Ok(out)
    }

    pub fn append_observation(&self, observation: &CycleObservation) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO cycle_observations(
                    cycle_index, time_critical, counterargument_substantive,
                    probe_novelty_failure, decomposition_complete, artifacts_produced
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    i64::try_from(observation.cycle_index)
                        .map_err(|_| anyhow!("cycle_index too large for sqlite"))?,
                    i64::from(observation.time_critical),
                    i64::from(observation.counterargument_substantive),
                    i64::from(observation.probe_novelty_failure),
                    i64::from(observation.decomposition_complete),
                    i64::from(observation.artifacts_produced),
                ],
            )
            .context("failed to append cycle observation")?;
        Ok(())
    }

    pub fn list_observations(&self) -> Result<Vec<CycleObservation>> {
        let mut stmt = self.conn.prepare(
            "SELECT cycle_index, time_critical, counterargument_substantive,
                    probe_novelty_failure, decomposition_complete, artifacts_produced
             FROM cycle_observations ORDER BY cycle_index ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(CycleObservation {
                cycle_index: u64::try_from(row.get::<_, i64>(0)?)
                    .map_err(|_| anyhow!("negative cycle_index"))?,
                time_critical: sql_to_bool(row.get::<_, i64>(1)?),
                counterargument_substantive: sql_to_bool(row.get::<_, i64>(2)?),
                probe_novelty_failure: sql_to_bool(row.get::<_, i64>(3)?),
                decomposition_complete: sql_to_bool(row.get::<_, i64>(4)?),
                artifacts_produced: u32::try_from(row.get::<_, i64>(5)?)
                    .map_err(|_| anyhow!("negative artifacts_produced"))?,
            });
        }
        Ok(out)
    }

    pub fn next_cycle_index(&self) -> Result<u64> {
        let max: Option<i64> = self
            .conn
            .query_row("SELECT MAX(cycle_index) FROM cycle_observations", [], |row| {
                row.get(0)
            })?;
        match max {
            None => Ok(0),
            Some(value) => Ok(u64::try_from(value).map_err(|_| anyhow!("negative cycle_index"))? + 1),
        }
    }

    pub fn save_vow(&self, vow: &Vow) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO vows(
                    vow_id, declared_at, text, min_cycles, status,
                    adherence_json, liberation_json, replaced_by
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(vow_id) DO UPDATE SET
                    status = excluded.status,
                    adherence_json = excluded.adherence_json,
                    liberation_json = excluded.liberation_json,
                    replaced_by = excluded.replaced_by",
                params![
                    vow.vow_id.to_string(),
                    rfc3339(vow.declared_at)?,
                    vow.text,
                    i64::from(vow.min_cycles),
                    vow.status.as_str(),
                    serde_json::to_string(
                        &vow.adherence_log
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<String>>()
                    )?,
                    vow.liberation
                        .as_ref()
                        .map(|liberation| -> Result<String> {
                            Ok(serde_json::to_string(&serde_json::json!({
                                "triggered_at": rfc3339(liberation.triggered_at)?,
                                "diagnostics": liberation.diagnostics,
                                "justification": liberation.justification,
                            }))?)
                        })
                        .transpose()?,
                    vow.replaced_by.map(|id| id.to_string()),
                ],
            )
            .context("failed to save vow")?;
        Ok(())
    }

    pub fn save_vow_registry(
        &self,
        vows: &[Vow],
        active_vow: Option<VowId>,
        total_cycles: u64,
        liberations: u64,
    ) -> Result<()> {
        for vow in vows {
            self.save_vow(vow)?;
        }
        self.conn
            .execute(
                "INSERT INTO vow_registry_state(id, active_vow_id, total_cycles, liberations)
                 VALUES (1, ?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    active_vow_id = excluded.active_vow_id,
                    total_cycles = excluded.total_cycles,
                    liberations = excluded.liberations",
                params![
                    active_vow.map(|id| id.to_string()),
                    i64::try_from(total_cycles).map_err(|_| anyhow!("total_cycles overflow"))?,
                    i64::try_from(liberations).map_err(|_| anyhow!("liberations overflow"))?,
                ],
            )
            .context("failed to save vow registry state")?;
        Ok(())
    }

    pub fn load_vow_registry(&self) -> Result<(Vec<Vow>, Option<VowId>, u64, u64)> {
        let mut stmt = self.conn.prepare(
            "SELECT vow_id, declared_at, text, min_cycles, status,
                    adherence_json, liberation_json, replaced_by
             FROM vows ORDER BY vow_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut vows = Vec::new();
        while let Some(row) = rows.next()? {
            vows.push(read_vow_row(row)??);
        }

        let state = self
            .conn
            .query_row(
                "SELECT active_vow_id, total_cycles, liberations FROM vow_registry_state WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        match state {
            None => Ok((vows, None, 0, 0)),
            Some((active_raw, total_cycles, liberations)) => {
                let active = active_raw.map(|raw| parse_vow_id(&raw)).transpose()?;
                Ok((
                    vows,
                    active,
                    u64::try_from(total_cycles).map_err(|_| anyhow!("negative total_cycles"))?,
                    u64::try_from(liberations).map_err(|_| anyhow!("negative liberations"))?,
                ))
            }
        }
    }

    pub fn save_heuristics(&self, heuristics: &[Heuristic]) -> Result<()> {
        for heuristic in heuristics {
            self.conn
                .execute(
                    "INSERT INTO heuristics(
                        heuristic_id, principle, antecedents_json, confidence,
                        origin, status, application_count, cycles_unused
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    ON CONFLICT(heuristic_id) DO UPDATE SET
                        confidence = excluded.confidence,
                        status = excluded.status,
                        application_count = excluded.application_count,
                        cycles_unused = excluded.cycles_unused",
                    params![
                        heuristic.heuristic_id.to_string(),
                        heuristic.principle,
                        serde_json::to_string(
                            &heuristic
                                .antecedents
                                .iter()
                                .map(ToString::to_string)
                                .collect::<Vec<String>>()
                        )?,
                        f64::from(heuristic.confidence),
                        rfc3339(heuristic.origin)?,
                        heuristic.status.as_str(),
                        i64::try_from(heuristic.application_count)
                            .map_err(|_| anyhow!("application_count overflow"))?,
                        i64::from(heuristic.cycles_unused),
                    ],
                )
                .context("failed to save heuristic")?;
        }
        Ok(())
    }

    pub fn load_heuristics(&self) -> Result<Vec<Heuristic>> {
        let mut stmt = self.conn.prepare(
            "SELECT heuristic_id, principle, antecedents_json, confidence,
                    origin, status, application_count, cycles_unused
             FROM heuristics ORDER BY heuristic_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_heuristic_row(row)??);
        }
        Ok(out)
    }

    pub fn append_probe(&self, probe_text: &str, novelty_failure: bool) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO probe_history(probe_text, novelty_failure, recorded_at)
                 VALUES (?1, ?2, ?3)",
                params![probe_text, i64::from(novelty_failure), rfc3339(now_utc())?],
            )
            .context("failed to append probe")?;
        Ok(())
    }

    /// The last `k` successful probe texts, oldest first, for seeding the
    /// novelty window.
    pub fn recent_probes(&self, k: usize) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT probe_text FROM probe_history
             WHERE novelty_failure = 0
             ORDER BY probe_seq DESC LIMIT ?1",
        )?;
        let mut rows = stmt.query(params![
            i64::try_from(k).map_err(|_| anyhow!("window too large"))?
        ])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get::<_, String>(0)?);
        }
        out.reverse();
        Ok(out)
    }
}

impl LedgerStore for SqliteStore {
    fn head_hash(&self) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT hash FROM ledger_entries ORDER BY entry_seq DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn append_entry(&self, entry: &LedgerEntry) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO ledger_entries(
                    entry_id, entry_type, payload_json, parent_hashes_json,
                    prev_hash, hash, recorded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.entry_id.to_string(),
                    entry.entry_type.as_str(),
                    serde_json::to_string(&entry.payload)?,
                    serde_json::to_string(&entry.parent_hashes)?,
                    entry.prev_hash,
                    entry.hash,
                    rfc3339(entry.recorded_at)?,
                ],
            )
            .context("failed to append ledger entry")?;
        Ok(())
    }

    fn get_entry(&self, hash: &str) -> Result<Option<LedgerEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT entry_id, entry_type, payload_json, parent_hashes_json,
                    prev_hash, hash, recorded_at
             FROM ledger_entries WHERE hash = ?1",
        )?;
        let row = stmt
            .query_row(params![hash], read_entry_row)
            .optional()?;
        row.transpose()
    }

    fn list_entries(&self) -> Result<Vec<LedgerEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT entry_id, entry_type, payload_json, parent_hashes_json,
                    prev_hash, hash, recorded_at
             FROM ledger_entries ORDER BY entry_seq ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_entry_row(row)??);
        }
        Ok(out)
    }

    fn entries_of_type(&self, entry_type: EntryType) -> Result<Vec<LedgerEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT entry_id, entry_type, payload_json, parent_hashes_json,
                    prev_hash, hash, recorded_at
             FROM ledger_entries WHERE entry_type = ?1 ORDER BY entry_seq ASC",
        )?;
        let mut rows = stmt.query(params![entry_type.as_str()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_entry_row(row)??);
        }
        Ok(out)
    }
}

// Row readers return nested results: the outer error is rusqlite's, the
// inner is the codec's, so .optional() composes with typed decode failures.

type RowResult<T> = rusqlite::Result<Result<T>>;

#[allow(clippy::cast_possible_truncation)]
fn read_catalyst_row(row: &rusqlite::Row<'_>) -> RowResult<Catalyst> {
    let catalyst_id: String = row.get(0)?;
    let source_kind: String = row.get(1)?;
    let classification: String = row.get(2)?;
    let description: String = row.get(3)?;
    let severity: f64 = row.get(4)?;
    let evidence_json: String = row.get(5)?;
    let detected_at: String = row.get(6)?;
    let created_at: String = row.get(7)?;

    Ok((|| -> Result<Catalyst> {
        Ok(Catalyst {
            catalyst_id: CatalystId(parse_ulid(&catalyst_id)?),
            source_kind: SourceKind::parse(&source_kind)
                .ok_or_else(|| anyhow!("invalid source_kind '{source_kind}'"))?,
            classification: CatalystClass::parse(&classification)
                .ok_or_else(|| anyhow!("invalid classification '{classification}'"))?,
            description,
            severity: severity as f32,
            evidence: serde_json::from_str(&evidence_json).context("invalid evidence_json")?,
            detected_at: parse_ts(&detected_at)?,
            created_at: parse_ts(&created_at)?,
        })
    })())
}

fn read_plan_row(row: &rusqlite::Row<'_>) -> RowResult<Plan> {
    let plan_id: String = row.get(0)?;
    let catalyst_id: String = row.get(1)?;
    let thesis: String = row.get(2)?;
    let antithesis: String = row.get(3)?;
    let probes_json: String = row.get(4)?;
    let decomposition_json: String = row.get(5)?;
    let time_critical: i64 = row.get(6)?;
    let created_at: String = row.get(7)?;

    Ok((|| -> Result<Plan> {
        Ok(Plan {
            plan_id: PlanId(parse_ulid(&plan_id)?),
            catalyst_id: CatalystId(parse_ulid(&catalyst_id)?),
            thesis,
            antithesis,
            probes: serde_json::from_str(&probes_json).context("invalid probes_json")?,
            decomposition: serde_json::from_str(&decomposition_json)
                .context("invalid decomposition_json")?,
            time_critical: sql_to_bool(time_critical),
            created_at: parse_ts(&created_at)?,
        })
    })())
}

#[allow(clippy::cast_possible_truncation)]
fn read_decision_row(row: &rusqlite::Row<'_>) -> RowResult<Decision> {
    let decision_id: String = row.get(0)?;
    let plan_id: String = row.get(1)?;
    let choice: String = row.get(2)?;
    let confidence: f64 = row.get(3)?;
    let counterargument: Option<String> = row.get(4)?;
    let decided_at: String = row.get(5)?;

    Ok((|| -> Result<Decision> {
        Ok(Decision {
            decision_id: DecisionId(parse_ulid(&decision_id)?),
            plan_id: PlanId(parse_ulid(&plan_id)?),
            choice,
            confidence: confidence as f32,
            counterargument,
            decided_at: parse_ts(&decided_at)?,
        })
    })())
}

fn read_artifact_row(row: &rusqlite::Row<'_>) -> RowResult<Artifact> {
    let artifact_id: String = row.get(0)?;
    let kind: String = row.get(1)?;
    let title: String = row.get(2)?;
    let content_hash: String = row.get(3)?;
    let storage_uri: String = row.get(4)?;
    let signature: Option<String> = row.get(5)?;
    let provenance_json: String = row.get(6)?;
    let created_at: String = row.get(7)?;

    Ok((|| -> Result<Artifact> {
        Ok(Artifact {
            artifact_id: ArtifactId(parse_ulid(&artifact_id)?),
            kind: ArtifactKind::parse(&kind).ok_or_else(|| anyhow!("invalid kind '{kind}'"))?,
            title,
            content_hash,
            storage_uri,
            signature,
            provenance: serde_json::from_str(&provenance_json).context("invalid provenance_json")?,
            created_at: parse_ts(&created_at)?,
        })
    })())
}

#[allow(clippy::cast_possible_truncation)]
fn read_snapshot_row(row: &rusqlite::Row<'_>) -> RowResult<MetricsSnapshot> {
    let cycle_index: i64 = row.get(0)?;
    let crisis_response: f64 = row.get(1)?;
    let synthesis_novelty: f64 = row.get(2)?;
    let decomposition_fidelity: f64 = row.get(3)?;
    let praxis: i64 = row.get(4)?;
    let liberation_rate: f64 = row.get(5)?;
    let recovery_latency: f64 = row.get(6)?;
    let source_balance_entropy: f64 = row.get(7)?;
    let capability_burst_count: i64 = row.get(8)?;
    let growth_classification: String = row.get(9)?;
    let scaffold_stability: f64 = row.get(10)?;
    let scaffold_mean_lifespan: f64 = row.get(11)?;
    let scaffold_assimilation_rate: f64 = row.get(12)?;
    let genesis_reproduction_rate: f64 = row.get(13)?;
    let trace_lineage_solidity: f64 = row.get(14)?;
    let computed_at: String = row.get(15)?;

    Ok((|| -> Result<MetricsSnapshot> {
        Ok(MetricsSnapshot {
            cycle_index: u64::try_from(cycle_index).map_err(|_| anyhow!("negative cycle_index"))?,
            crisis_response: crisis_response as f32,
            synthesis_novelty: synthesis_novelty as f32,
            decomposition_fidelity: decomposition_fidelity as f32,
            praxis: sql_to_bool(praxis),
            liberation_rate: liberation_rate as f32,
            recovery_latency: recovery_latency as f32,
            source_balance_entropy: source_balance_entropy as f32,
            capability_burst_count: u32::try_from(capability_burst_count)
                .map_err(|_| anyhow!("negative capability_burst_count"))?,
            growth_classification: cycle_kernel_domain::GrowthClass::parse(&growth_classification)
                .ok_or_else(|| anyhow!("invalid growth_classification '{growth_classification}'"))?,
            scaffold_stability: scaffold_stability as f32,
            scaffold_mean_lifespan: scaffold_mean_lifespan as f32,
            scaffold_assimilation_rate: scaffold_assimilation_rate as f32,
            genesis_reproduction_rate: genesis_reproduction_rate as f32,
            trace_lineage_solidity: trace_lineage_solidity as f32,
            computed_at: parse_ts(&computed_at)?,
        })
    })())
}

fn read_vow_row(row: &rusqlite::Row<'_>) -> RowResult<Vow> {
    let vow_id: String = row.get(0)?;
    let declared_at: String = row.get(1)?;
    let text: String = row.get(2)?;
    let min_cycles: i64 = row.get(3)?;
    let status: String = row.get(4)?;
    let adherence_json: String = row.get(5)?;
    let liberation_json: Option<String> = row.get(6)?;
    let replaced_by: Option<String> = row.get(7)?;

    Ok((|| -> Result<Vow> {
        let adherence_raw: Vec<String> =
            serde_json::from_str(&adherence_json).context("invalid adherence_json")?;
        let adherence_log = adherence_raw
            .iter()
            .map(|raw| Ok(CatalystId(parse_ulid(raw)?)))
            .collect::<Result<Vec<CatalystId>>>()?;

        let liberation = liberation_json
            .as_deref()
            .map(|raw| -> Result<Liberation> {
                let value: serde_json::Value =
                    serde_json::from_str(raw).context("invalid liberation_json")?;
                let triggered_at = value
                    .get("triggered_at")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| anyhow!("liberation_json missing triggered_at"))?;
                let justification = value
                    .get("justification")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| anyhow!("liberation_json missing justification"))?
                    .to_string();
                Ok(Liberation {
                    triggered_at: parse_ts(triggered_at)?,
                    diagnostics: value
                        .get("diagnostics")
                        .cloned()
                        .unwrap_or(serde_json::Value::Null),
                    justification,
                })
            })
            .transpose()?;

        Ok(Vow {
            vow_id: VowId(parse_ulid(&vow_id)?),
            declared_at: parse_ts(&declared_at)?,
            text,
            min_cycles: u32::try_from(min_cycles).map_err(|_| anyhow!("negative min_cycles"))?,
            status: VowStatus::parse(&status)
                .ok_or_else(|| anyhow!("invalid vow status '{status}'"))?,
            adherence_log,
            liberation,
            replaced_by: replaced_by.map(|raw| parse_vow_id(&raw)).transpose()?,
        })
    })())
}

#[allow(clippy::cast_possible_truncation)]
fn read_heuristic_row(row: &rusqlite::Row<'_>) -> RowResult<Heuristic> {
    let heuristic_id: String = row.get(0)?;
    let principle: String = row.get(1)?;
    let antecedents_json: String = row.get(2)?;
    let confidence: f64 = row.get(3)?;
    let origin: String = row.get(4)?;
    let status: String = row.get(5)?;
    let application_count: i64 = row.get(6)?;
    let cycles_unused: i64 = row.get(7)?;

    Ok((|| -> Result<Heuristic> {
        let antecedents_raw: Vec<String> =
            serde_json::from_str(&antecedents_json).context("invalid antecedents_json")?;
        let antecedents = antecedents_raw
            .iter()
            .map(|raw| Ok(HeuristicId(parse_ulid(raw)?)))
            .collect::<Result<Vec<HeuristicId>>>()?;

        Ok(Heuristic {
            heuristic_id: HeuristicId(parse_ulid(&heuristic_id)?),
            principle,
            antecedents,
            confidence: confidence as f32,
            origin: parse_ts(&origin)?,
            status: HeuristicStatus::parse(&status)
                .ok_or_else(|| anyhow!("invalid heuristic status '{status}'"))?,
            application_count: u64::try_from(application_count)
                .map_err(|_| anyhow!("negative application_count"))?,
            cycles_unused: u32::try_from(cycles_unused)
                .map_err(|_| anyhow!("negative cycles_unused"))?,
        })
    })())
}

fn read_entry_row(row: &rusqlite::Row<'_>) -> RowResult<LedgerEntry> {
    let entry_id: String = row.get(0)?;
    let entry_type: String = row.get(1)?;
    let payload_json: String = row.get(2)?;
    let parent_hashes_json: String = row.get(3)?;
    let prev_hash: Option<String> = row.get(4)?;
    let hash: String = row.get(5)?;
    let recorded_at: String = row.get(6)?;

    Ok((|| -> Result<LedgerEntry> {
        Ok(LedgerEntry {
            entry_id: EntryId(parse_ulid(&entry_id)?),
            entry_type: EntryType::parse(&entry_type)
                .ok_or_else(|| anyhow!("invalid entry_type '{entry_type}'"))?,
            payload: serde_json::from_str(&payload_json).context("invalid payload_json")?,
            parent_hashes: serde_json::from_str(&parent_hashes_json)
                .context("invalid parent_hashes_json")?,
            prev_hash,
            hash,
            recorded_at: parse_ts(&recorded_at)?,
        })
    })())
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_str(raw).map_err(|err| anyhow!("invalid ULID '{raw}': {err}"))
}

fn parse_vow_id(raw: &str) -> Result<VowId> {
    Ok(VowId(parse_ulid(raw)?))
}

fn parse_ts(raw: &str) -> Result<cycle_kernel_domain::DateTimeUtc> {
    Ok(parse_rfc3339_utc(raw)?)
}

fn rfc3339(value: cycle_kernel_domain::DateTimeUtc) -> Result<String> {
    Ok(format_rfc3339(value)?)
}

fn sql_to_bool(value: i64) -> bool {
    value != 0
}

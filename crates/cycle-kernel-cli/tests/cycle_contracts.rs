use std::path::Path;

use cycle_kernel_dialectic::TemplateGenerator;
use cycle_kernel_domain::{CycleError, StopReason, VowStatus};
use cycle_kernel_ledger::{verify_chain, verify_entries, LedgerStore};
use cycle_kernel_metrics::MetricsConfig;
use cycle_kernel_orchestrator::{
    CycleConfig, CycleMachine, CycleOutcome, StaticTelemetrySource, TelemetryDocuments,
};
use cycle_kernel_store_sqlite::SqliteStore;
use cycle_kernel_vows::LiberationOutcome;
use serde_json::json;

fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err}"),
    }
}

fn must_some<T>(value: Option<T>) -> T {
    match value {
        Some(inner) => inner,
        None => panic!("expected Some(..), got None"),
    }
}

fn fixture_store() -> SqliteStore {
    let store = must(SqliteStore::open(Path::new(":memory:")));
    must(store.migrate());
    store
}

fn qualifying_telemetry() -> StaticTelemetrySource {
    StaticTelemetrySource {
        documents: TelemetryDocuments {
            scan_anomalies: Some(json!({
                "anomalies": [{
                    "description": "recall completeness below target",
                    "classification": "regression",
                    "severity": 0.6,
                    "evidence": ["trace-1", "trace-2"],
                }]
            })),
            decision_trace: Some(json!({
                "recovery_latency": 0.4,
                "capability_burst_count": 2,
            })),
            growth_trajectory: Some(json!({
                "classification": "growth",
                "source_balance_entropy": 0.9,
            })),
        },
    }
}

#[test]
fn vow_lifecycle_grants_liberation_after_three_adherence_cycles() {
    let store = fixture_store();
    let telemetry = qualifying_telemetry();
    let mut machine = must(CycleMachine::open(
        &store,
        &telemetry,
        None,
        TemplateGenerator::new(),
        CycleConfig::default(),
    ));

    let vow = must(machine.vows().declare("every decision carries a counterargument", 3));

    for _ in 0..3 {
        let outcome = must(machine.run_cycle());
        assert!(matches!(outcome, CycleOutcome::Completed { .. }));
    }

    let justification = "Liberation is justified because the evidence gathered across three \
                         cycles shows the constraint was observed without exception, and the \
                         original risk has been invalidated.";
    assert!(justification.len() >= 150);

    let outcome = must(machine.vows().request_liberation(
        vow.vow_id,
        json!({"adherence_cycles": 3}),
        justification,
        Some("every decision carries two counterarguments"),
    ));

    let LiberationOutcome::Granted {
        liberated,
        replacement,
    } = outcome
    else {
        panic!("expected liberation to be granted");
    };
    assert_eq!(liberated, vow.vow_id);
    let replacement_id = must_some(replacement);

    let liberated_vow = must_some(must(machine.vows().get(vow.vow_id)));
    assert_eq!(liberated_vow.status, VowStatus::Liberated);
    assert_eq!(liberated_vow.replaced_by, Some(replacement_id));

    let rate = must(machine.vows().liberation_rate());
    assert!((rate - 1.0 / 3.0).abs() < 1e-6);
}

#[test]
fn liberation_is_denied_before_min_cycles_even_with_a_strong_case() {
    let store = fixture_store();
    let telemetry = qualifying_telemetry();
    let mut machine = must(CycleMachine::open(
        &store,
        &telemetry,
        None,
        TemplateGenerator::new(),
        CycleConfig::default(),
    ));

    let vow = must(machine.vows().declare("hold for five cycles", 5));
    for _ in 0..2 {
        let _ = must(machine.run_cycle());
    }

    let outcome = must(machine.vows().request_liberation(
        vow.vow_id,
        json!({}),
        "Liberation is justified because the evidence observed over the window was measured \
         carefully and the constraint has been invalidated in every respect we can check.",
        None,
    ));
    assert!(matches!(outcome, LiberationOutcome::Denied { .. }));
}

#[test]
fn ten_qualifying_snapshots_stop_the_machine() {
    let store = fixture_store();
    let telemetry = qualifying_telemetry();
    let mut machine = must(CycleMachine::open(
        &store,
        &telemetry,
        None,
        TemplateGenerator::new(),
        CycleConfig {
            metrics: MetricsConfig::default(),
            ..CycleConfig::default()
        },
    ));

    let mut cycles = 0;
    let stopped_reason = loop {
        cycles += 1;
        assert!(cycles <= 12, "machine failed to stop within twelve cycles");
        match must(machine.run_cycle()) {
            CycleOutcome::Completed { .. } => {}
            CycleOutcome::Stopped(reason) => break reason,
        }
    };

    assert_eq!(stopped_reason, StopReason::StopRuleSatisfied);
    assert_eq!(cycles, 10);
    assert_eq!(must(store.list_snapshots()).len(), 10);

    // Every committed cycle left a verifiable chain segment behind.
    assert!(verify_chain(&store).is_ok());
    assert_eq!(must(store.list_entries()).len(), 30);
}

#[test]
fn tampered_ledger_payload_is_reported_with_its_index() {
    let store = fixture_store();
    let telemetry = qualifying_telemetry();
    let mut machine = must(CycleMachine::open(
        &store,
        &telemetry,
        None,
        TemplateGenerator::new(),
        CycleConfig::default(),
    ));
    for _ in 0..2 {
        let _ = must(machine.run_cycle());
    }

    let mut entries = must(store.list_entries());
    entries[3].payload = json!({"forged": true});

    match verify_entries(&entries) {
        Err(CycleError::Integrity { index, .. }) => assert_eq!(index, 3),
        other => panic!("expected an integrity failure, got {other:?}"),
    }
}

#[test]
fn scan_without_eligible_anomalies_is_a_stop_not_an_error() {
    let store = fixture_store();
    let telemetry = StaticTelemetrySource::default();
    let mut machine = must(CycleMachine::open(
        &store,
        &telemetry,
        None,
        TemplateGenerator::new(),
        CycleConfig::default(),
    ));

    let outcome = must(machine.run_cycle());
    assert_eq!(outcome, CycleOutcome::Stopped(StopReason::NoCatalyst));
}

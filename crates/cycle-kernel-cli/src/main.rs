use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use cycle_kernel_dialectic::{HttpJsonGenerator, RoleGenerator, TemplateGenerator};
use cycle_kernel_domain::{ArtifactId, CatalystId, CycleError, PlanId, VowId};
use cycle_kernel_metrics::{evaluate_stop_rule, MetricsConfig};
use cycle_kernel_orchestrator::{
    ArtifactSigner, CycleConfig, CycleMachine, CycleOutcome, FileTelemetrySource,
    IntegrateOutcome, KeyedSigner, ScanOutcome,
};
use cycle_kernel_store_sqlite::SqliteStore;
use cycle_kernel_vows::{LiberationOutcome, VowRegistry};
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "ck")]
#[command(about = "Autonomous decision-and-audit loop over a hash-chained SQLite ledger")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Detect the next catalyst from telemetry.
    Scan(MachineArgs),
    /// Synthesize a plan for a catalyst.
    Plan(PlanArgs),
    /// Commit a decision and compile the cycle artifact.
    Execute(ExecuteArgs),
    /// Fold a compiled artifact into metrics and the ledger.
    Integrate(IntegrateArgs),
    /// Vow registry operations.
    Vow(VowArgs),
    /// Print the metrics snapshot history.
    Metrics(StoreOnlyArgs),
    /// Stop-rule evaluation.
    StopRule(StopRuleArgs),
    /// Run one full scan/architect/execute/integrate loop.
    Cycle(MachineArgs),
}

#[derive(Debug, Args)]
struct MachineArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    scan_telemetry: Option<PathBuf>,
    #[arg(long)]
    decision_trace: Option<PathBuf>,
    #[arg(long)]
    growth_trajectory: Option<PathBuf>,
    #[arg(long)]
    metrics_config: Option<PathBuf>,
    #[arg(long)]
    signing_key: Option<String>,
    #[arg(long, default_value = "template")]
    generator: String,
    #[arg(long)]
    generator_params: Option<String>,
}

#[derive(Debug, Args)]
struct PlanArgs {
    #[command(flatten)]
    machine: MachineArgs,
    catalyst_id: String,
}

#[derive(Debug, Args)]
struct ExecuteArgs {
    #[command(flatten)]
    machine: MachineArgs,
    plan_id: String,
}

#[derive(Debug, Args)]
struct IntegrateArgs {
    #[command(flatten)]
    machine: MachineArgs,
    artifact_id: String,
}

#[derive(Debug, Args)]
struct StoreOnlyArgs {
    #[arg(long)]
    db: PathBuf,
}

#[derive(Debug, Args)]
struct VowArgs {
    #[command(subcommand)]
    command: VowSubcommand,
}

#[derive(Debug, Subcommand)]
enum VowSubcommand {
    /// Declare a new active vow.
    Declare {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        text: String,
        #[arg(long, default_value_t = 3)]
        min_cycles: u32,
    },
    /// Request audited liberation of a vow.
    Liberate {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        vow_id: String,
        #[arg(long)]
        justification: String,
        #[arg(long)]
        diagnostics: Option<String>,
        #[arg(long)]
        replacement: Option<String>,
    },
    /// Print the registry status.
    Status {
        #[arg(long)]
        db: PathBuf,
    },
}

#[derive(Debug, Args)]
struct StopRuleArgs {
    #[command(subcommand)]
    command: StopRuleSubcommand,
}

#[derive(Debug, Subcommand)]
enum StopRuleSubcommand {
    /// Evaluate the stop rule over the persisted snapshot history.
    Check {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        metrics_config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone)]
enum StepOp {
    Scan,
    Plan(CatalystId),
    Execute(PlanId),
    Integrate(ArtifactId),
    Cycle,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

// Exit taxonomy: 2 validation, 3 integrity (with the broken chain index in
// the message), 4 io, 1 anything else.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<CycleError>() {
        Some(CycleError::Validation(_)) => 2,
        Some(CycleError::Integrity { .. }) => 3,
        Some(CycleError::Io(_)) => 4,
        None => 1,
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Scan(args) => dispatch(&args, &StepOp::Scan),
        Commands::Plan(args) => {
            let catalyst_id = CatalystId(parse_ulid("catalyst_id", &args.catalyst_id)?);
            dispatch(&args.machine, &StepOp::Plan(catalyst_id))
        }
        Commands::Execute(args) => {
            let plan_id = PlanId(parse_ulid("plan_id", &args.plan_id)?);
            dispatch(&args.machine, &StepOp::Execute(plan_id))
        }
        Commands::Integrate(args) => {
            let artifact_id = ArtifactId(parse_ulid("artifact_id", &args.artifact_id)?);
            dispatch(&args.machine, &StepOp::Integrate(artifact_id))
        }
        Commands::Vow(args) => vow_command(args),
        Commands::Metrics(args) => metrics_command(&args),
        Commands::StopRule(args) => stop_rule_command(args),
        Commands::Cycle(args) => dispatch(&args, &StepOp::Cycle),
    }
}

fn dispatch(args: &MachineArgs, op: &StepOp) -> Result<()> {
    let store = open_store(&args.db)?;
    let telemetry = FileTelemetrySource {
        scan_path: args.scan_telemetry.clone(),
        trace_path: args.decision_trace.clone(),
        growth_path: args.growth_trajectory.clone(),
    };
    let signer = args
        .signing_key
        .as_ref()
        .map(|key| KeyedSigner::new(key.as_bytes()));
    let signer_ref: Option<&dyn ArtifactSigner> = signer
        .as_ref()
        .map(|signer| signer as &dyn ArtifactSigner);
    let config = CycleConfig {
        metrics: MetricsConfig::load_or_default(args.metrics_config.as_deref())?,
        ..CycleConfig::default()
    };

    match args.generator.as_str() {
        "template" => {
            let mut machine = CycleMachine::open(
                &store,
                &telemetry,
                signer_ref,
                TemplateGenerator::new(),
                config,
            )?;
            run_step(&mut machine, op)
        }
        "http_json" => {
            let params = match &args.generator_params {
                Some(raw) => serde_json::from_str(raw)
                    .map_err(|err| anyhow!("invalid --generator-params JSON: {err}"))?,
                None => serde_json::Value::Null,
            };
            let generator = HttpJsonGenerator::from_params(&params)?;
            let mut machine =
                CycleMachine::open(&store, &telemetry, signer_ref, generator, config)?;
            run_step(&mut machine, op)
        }
        other => Err(anyhow!(
            "unsupported generator '{other}'; supported generators are 'template' and 'http_json'"
        )),
    }
}

fn run_step<G: RoleGenerator>(machine: &mut CycleMachine<'_, G>, op: &StepOp) -> Result<()> {
    match op {
        StepOp::Scan => match machine.scan()? {
            ScanOutcome::Stopped(reason) => {
                println!("state=stopped reason={}", reason.as_str());
            }
            ScanOutcome::Catalyst(catalyst) => {
                println!(
                    "catalyst_id={} classification={} severity={:.2} source={}",
                    catalyst.catalyst_id,
                    catalyst.classification.as_str(),
                    catalyst.severity,
                    catalyst.source_kind.as_str()
                );
            }
        },
        StepOp::Plan(catalyst_id) => {
            let plan = machine.architect(*catalyst_id)?;
            println!(
                "plan_id={} catalyst_id={} time_critical={} probes={}",
                plan.plan_id,
                plan.catalyst_id,
                plan.time_critical,
                plan.probes.len()
            );
        }
        StepOp::Execute(plan_id) => {
            let execution = machine.execute(*plan_id)?;
            let artifact_ids: Vec<String> = execution
                .artifacts
                .iter()
                .map(|artifact| artifact.artifact_id.to_string())
                .collect();
            println!(
                "decision_id={} confidence={:.2} artifacts={}",
                execution.decision.decision_id,
                execution.decision.confidence,
                artifact_ids.join(",")
            );
        }
        StepOp::Integrate(artifact_id) => match machine.integrate(*artifact_id)? {
            IntegrateOutcome::Continue {
                snapshot,
                outcome_hash,
            } => {
                println!(
                    "cycle_index={} outcome_hash={outcome_hash} state=scan",
                    snapshot.cycle_index
                );
            }
            IntegrateOutcome::Stopped {
                snapshot,
                outcome_hash,
                reason,
            } => {
                println!(
                    "cycle_index={} outcome_hash={outcome_hash} state=stopped reason={}",
                    snapshot.cycle_index,
                    reason.as_str()
                );
            }
        },
        StepOp::Cycle => match machine.run_cycle()? {
            CycleOutcome::Stopped(reason) => {
                // STOPPED is a successful terminal outcome, not a failure.
                println!("state=stopped reason={}", reason.as_str());
            }
            CycleOutcome::Completed {
                catalyst_id,
                plan_id,
                decision_id,
                outcome_hash,
            } => {
                println!(
                    "catalyst_id={catalyst_id} plan_id={plan_id} decision_id={decision_id} \
                     outcome_hash={outcome_hash} state={}",
                    machine.state().as_str()
                );
            }
        },
    }
    Ok(())
}

fn vow_command(args: VowArgs) -> Result<()> {
    match args.command {
        VowSubcommand::Declare {
            db,
            text,
            min_cycles,
        } => {
            let store = open_store(&db)?;
            let registry = load_registry(&store)?;
            let vow = registry.declare(&text, min_cycles)?;
            save_registry(&store, &registry)?;
            println!("vow_id={} status=active min_cycles={min_cycles}", vow.vow_id);
        }
        VowSubcommand::Liberate {
            db,
            vow_id,
            justification,
            diagnostics,
            replacement,
        } => {
            let store = open_store(&db)?;
            let registry = load_registry(&store)?;
            let vow_id = VowId(parse_ulid("vow_id", &vow_id)?);
            let diagnostics = match diagnostics {
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|err| anyhow!("invalid --diagnostics JSON: {err}"))?,
                None => serde_json::Value::Null,
            };

            let outcome = registry.request_liberation(
                vow_id,
                diagnostics,
                &justification,
                replacement.as_deref(),
            )?;
            save_registry(&store, &registry)?;

            match outcome {
                LiberationOutcome::Granted {
                    liberated,
                    replacement,
                } => {
                    let replacement = replacement
                        .map_or_else(|| "none".to_string(), |id| id.to_string());
                    println!("outcome=granted vow_id={liberated} replacement={replacement}");
                }
                LiberationOutcome::Denied { reason_codes } => {
                    // A denial is a normal negative result; exit code stays 0.
                    println!("outcome=denied reasons={}", reason_codes.join(","));
                }
            }
        }
        VowSubcommand::Status { db } => {
            let store = open_store(&db)?;
            let registry = load_registry(&store)?;
            let (total_cycles, liberations) = registry.counters()?;
            let active = registry
                .active_vow()?
                .map_or_else(|| "none".to_string(), |vow| vow.vow_id.to_string());
            println!(
                "active_vow={active} total_cycles={total_cycles} liberations={liberations} liberation_rate={:.4}",
                registry.liberation_rate()?
            );
            for vow in registry.snapshot()? {
                println!("{}", serde_json::to_string(&vow)?);
            }
        }
    }
    Ok(())
}

fn metrics_command(args: &StoreOnlyArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    for snapshot in store.list_snapshots()? {
        println!("{}", serde_json::to_string(&snapshot)?);
    }
    Ok(())
}

fn stop_rule_command(args: StopRuleArgs) -> Result<()> {
    match args.command {
        StopRuleSubcommand::Check { db, metrics_config } => {
            let store = open_store(&db)?;
            let config = MetricsConfig::load_or_default(metrics_config.as_deref())?;
            let snapshots = store.list_snapshots()?;
            let report = evaluate_stop_rule(&snapshots, &config);
            println!(
                "holds={} window_filled={} crisis_non_decreasing={} novelty={} praxis={} fidelity={} bands={} failing_bands={}",
                report.holds,
                report.window_filled,
                report.crisis_response_non_decreasing,
                report.synthesis_novelty_met,
                report.praxis_met,
                report.decomposition_fidelity_met,
                report.external_bands_met,
                if report.failing_bands.is_empty() {
                    "none".to_string()
                } else {
                    report.failing_bands.join(",")
                }
            );
        }
    }
    Ok(())
}

fn open_store(db: &std::path::Path) -> Result<SqliteStore> {
    let store = SqliteStore::open(db)?;
    store.migrate()?;
    Ok(store)
}

fn load_registry(store: &SqliteStore) -> Result<VowRegistry> {
    let (vows, active, total_cycles, liberations) = store.load_vow_registry()?;
    Ok(VowRegistry::from_state(vows, active, total_cycles, liberations))
}

fn save_registry(store: &SqliteStore, registry: &VowRegistry) -> Result<()> {
    let vows = registry.snapshot()?;
    let active = registry.active_vow()?.map(|vow| vow.vow_id);
    let (total_cycles, liberations) = registry.counters()?;
    store.save_vow_registry(&vows, active, total_cycles, liberations)?;
    Ok(())
}

fn parse_ulid(field: &str, input: &str) -> Result<Ulid> {
    Ulid::from_str(input).map_err(|err| {
        anyhow::Error::new(CycleError::Validation(format!(
            "invalid {field} ULID '{input}': {err}"
        )))
    })
}

//! `agentos`: the operator surface over the kernel, evidence store, policy
//! log, MCP runtime, tuner, and diagnostics. Exit codes are part of the
//! contract: 0 success, 2 usage, 10 governance block, 11 missing input,
//! 12 service failure, 13 approval required, 14 policy violation,
//! 15 backpressure.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use agent_os_config::AgentOsConfig;
use agent_os_domain::{
    now_utc, ErrorKind, Origin, OverrideScope, PolicyOverride, Profile, RunId, RunOutcome,
    SnapshotId, TaskKind,
};
use agent_os_engine::{generalist_descriptor, EngineCore, Kernel, KernelRunStatus};
use agent_os_mcp::{load_pipeline_spec, run_pipeline, McpRuntime, Router, ToolRegistry};
use agent_os_policy::{active_overrides, apply_overrides, rollback_to};
use agent_os_services::{
    builtin_services, error_kind_of, ServiceRegistry, ServiceRequest, ServiceResult,
};
use agent_os_state_core::StateStore;
use agent_os_state_sqlite::SqliteStateStore;
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "agentos")]
#[command(about = "Single-operator agent OS: classify, route, execute, learn")]
struct Cli {
    /// Configuration file (TOML); missing file uses built-in defaults.
    #[arg(long, global = true, default_value = "config/agent_os.toml")]
    config: PathBuf,
    /// Override the persisted-state root directory.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Plan and preview without executing side effects.
    #[arg(long, global = true, default_value_t = false)]
    dry_run: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Submit a natural-language task to the kernel.
    Submit(SubmitArgs),
    /// Show the status of a run.
    Status { run_id: String },
    /// Full breakdown of a run: plan, attempts, delivery bundle.
    Inspect { run_id: String },
    /// Aggregate telemetry, SLO adherence, and failure hotspots.
    Observe {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Run the policy tuner and print (or apply) its proposals.
    Recommend {
        #[arg(long, default_value_t = false)]
        apply: bool,
        /// Write the proposal plan file here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Operator feedback for completed runs.
    Feedback(FeedbackArgs),
    /// Show, apply, or roll back policy overrides.
    Policy(PolicyArgs),
    /// List registered capability services or call one directly.
    Services(ServicesArgs),
    /// Walk env, config, services, breakers, and recent runs.
    Diagnose,
    /// Run a declarative tool pipeline file (JSON/TOML/YAML).
    Pipeline { file: PathBuf },
}

#[derive(Debug, Args)]
struct SubmitArgs {
    /// Task text, e.g. "请生成本季度增长复盘框架".
    text: String,
    #[arg(long, default_value = "auto")]
    profile: String,
    /// Explicit parameters as key=value (value parsed as JSON when possible).
    #[arg(long = "param")]
    params: Vec<String>,
    /// Enqueue on the worker pool instead of running synchronously.
    #[arg(long, default_value_t = false)]
    queue: bool,
}

#[derive(Debug, Args)]
struct FeedbackArgs {
    #[command(subcommand)]
    command: FeedbackSubcommand,
}

#[derive(Debug, Subcommand)]
enum FeedbackSubcommand {
    Add {
        run_id: String,
        #[arg(long, allow_hyphen_values = true)]
        rating: i8,
        #[arg(long, default_value = "")]
        note: String,
    },
    Stats,
}

#[derive(Debug, Args)]
struct PolicyArgs {
    #[command(subcommand)]
    command: PolicySubcommand,
}

#[derive(Debug, Subcommand)]
enum PolicySubcommand {
    Show,
    Apply {
        /// JSON file: [{"scope": "strategy", "key": "...", "value": ...}].
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = "operator")]
        approved_by: String,
    },
    Rollback {
        #[arg(long)]
        snapshot: String,
        #[arg(long, default_value = "operator")]
        approved_by: String,
    },
}

#[derive(Debug, Args)]
struct ServicesArgs {
    #[command(subcommand)]
    command: ServicesSubcommand,
}

#[derive(Debug, Subcommand)]
enum ServicesSubcommand {
    List,
    Call {
        name: String,
        #[arg(long, default_value = "{}")]
        params_json: String,
    },
}

struct Runtime {
    config: AgentOsConfig,
    store: Arc<dyn StateStore>,
    registry: Arc<ServiceRegistry>,
    mcp: Arc<McpRuntime>,
    core: Arc<EngineCore>,
}

fn build_runtime(cli: &Cli) -> Result<Runtime> {
    let mut config = AgentOsConfig::load(&cli.config)?;
    config.apply_env_overrides();
    if let Some(data_dir) = &cli.data_dir {
        config.defaults.data_dir = data_dir.clone();
    }

    let store: Arc<dyn StateStore> = {
        let store = SqliteStateStore::open(&config.defaults.data_dir)?;
        store.migrate()?;
        Arc::new(store)
    };

    let registry_file = ToolRegistry::load(&config.mcp.servers_file)?;
    let router = Router::load(&config.mcp.routes_file)?;
    let mcp = Arc::new(McpRuntime::new(
        registry_file,
        router,
        Arc::clone(&store),
        config.mcp.clone(),
        config.breaker.clone(),
        config.defaults.data_dir.clone(),
    ));

    let mut registry = ServiceRegistry::new(true);
    for descriptor in builtin_services() {
        registry.register(descriptor)?;
    }
    registry.register(generalist_descriptor(Arc::clone(&mcp)))?;
    registry.finalize()?;
    let registry = Arc::new(registry);

    let core = Arc::new(EngineCore::new(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&registry),
    ));
    Ok(Runtime {
        config,
        store,
        registry,
        mcp,
        core,
    })
}

fn parse_run_id(input: &str) -> Result<RunId> {
    let value = Ulid::from_str(input).map_err(|err| anyhow!("invalid run_id ULID: {err}"))?;
    Ok(RunId(value))
}

fn parse_profile(input: &str) -> Result<Profile> {
    Profile::parse(input)
        .ok_or_else(|| anyhow!("invalid profile '{input}'; use strict, adaptive, or auto"))
}

fn parse_params(raw: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut out = BTreeMap::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("--param expects key=value, got '{entry}'"))?;
        let parsed = serde_json::from_str(value).unwrap_or(Value::String(value.to_string()));
        out.insert(key.to_string(), parsed);
    }
    Ok(out)
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(err) => eprintln!("failed to render JSON: {err}"),
    }
}

fn outcome_exit_code(rt: &Runtime, outcome: RunOutcome, run_id: RunId) -> i32 {
    match outcome {
        RunOutcome::Succeeded | RunOutcome::Degraded | RunOutcome::ClarificationNeeded => 0,
        RunOutcome::Failed | RunOutcome::Aborted => rt
            .store
            .get_delivery_bundle(run_id)
            .ok()
            .flatten()
            .and_then(|bundle| bundle.why_failed)
            .map_or(12, |why| why.error_kind.exit_code()),
    }
}

#[allow(clippy::too_many_lines)]
fn dispatch(cli: &Cli) -> Result<i32> {
    let rt = build_runtime(cli)?;
    match &cli.command {
        Commands::Submit(args) => {
            let profile = parse_profile(&args.profile)?;
            let params = parse_params(&args.params)?;
            if cli.dry_run {
                let run_id = RunId::new();
                let (task, ctx, report) =
                    rt.core
                        .prepare(run_id, &args.text, profile, Origin::Cli, params)?;
                print_json(&json!({
                    "mode": "dry-run",
                    "task_kind": task.task_kind.as_str(),
                    "profile": ctx.resolved_profile.as_str(),
                    "plan": report.plan,
                    "blocked": report.blocked,
                }));
                return Ok(0);
            }
            if args.queue {
                let kernel = Kernel::new(Arc::clone(&rt.core));
                let run_id = kernel.submit(&args.text, profile, Origin::Cli, params)?;
                println!("run_id={run_id} status=queued");
                // Let the queued run finish before the process exits; this
                // is a single-operator CLI, not a daemon.
                loop {
                    match rt.core.status(run_id)? {
                        KernelRunStatus::Sealed(summary) => {
                            println!(
                                "run_id={run_id} outcome={} attempts={}",
                                summary.outcome.as_str(),
                                summary.attempts_count
                            );
                            return Ok(outcome_exit_code(&rt, summary.outcome, run_id));
                        }
                        KernelRunStatus::Pending => {
                            std::thread::sleep(std::time::Duration::from_millis(50));
                        }
                        KernelRunStatus::Unknown => {
                            return Err(anyhow!("queued run {run_id} disappeared"));
                        }
                    }
                }
            }
            let kernel = Kernel::new(Arc::clone(&rt.core));
            let summary = kernel.execute_blocking(&args.text, profile, Origin::Cli, params)?;
            println!(
                "run_id={} outcome={} strategy={} attempts={} latency_ms={}",
                summary.run_id,
                summary.outcome.as_str(),
                summary.chosen_strategy.as_deref().unwrap_or("-"),
                summary.attempts_count,
                summary.total_latency_ms
            );
            if let Some(bundle) = rt.store.get_delivery_bundle(summary.run_id)? {
                print_json(&serde_json::to_value(&bundle)?);
            }
            Ok(outcome_exit_code(&rt, summary.outcome, summary.run_id))
        }
        Commands::Status { run_id } => {
            let run_id = parse_run_id(run_id)?;
            match rt.core.status(run_id)? {
                KernelRunStatus::Sealed(summary) => {
                    print_json(&serde_json::to_value(&summary)?);
                }
                KernelRunStatus::Pending => println!("run_id={run_id} status=pending"),
                KernelRunStatus::Unknown => println!("run_id={run_id} status=unknown"),
            }
            Ok(0)
        }
        Commands::Inspect { run_id } => {
            let run_id = parse_run_id(run_id)?;
            let report = json!({
                "run_id": run_id.to_string(),
                "summary": rt.store.get_run_summary(run_id)?,
                "plan": rt.store.get_plan(run_id)?,
                "attempts": rt.store.list_attempts(run_id)?,
                "delivery_bundle": rt.store.get_delivery_bundle(run_id)?,
                "replay_steps": rt.store.list_replay(run_id)?,
            });
            print_json(&report);
            Ok(0)
        }
        Commands::Observe { days } => {
            let report =
                agent_os_observe::aggregate(rt.store.as_ref(), &rt.config, *days, now_utc())?;
            print_json(&serde_json::to_value(&report)?);
            Ok(0)
        }
        Commands::Recommend { apply, out } => {
            let apply = *apply && !cli.dry_run;
            let report = agent_os_tuner::run_tuner(
                rt.store.as_ref(),
                &rt.config.tuner,
                now_utc(),
                apply,
                "tuner",
            )?;
            let rendered = serde_json::to_value(&report)?;
            if let Some(path) = out {
                std::fs::write(path, serde_json::to_string_pretty(&rendered)?)
                    .with_context(|| format!("failed to write plan file {}", path.display()))?;
                println!("plan_file={}", path.display());
            } else {
                print_json(&rendered);
            }
            Ok(0)
        }
        Commands::Feedback(args) => match &args.command {
            FeedbackSubcommand::Add {
                run_id,
                rating,
                note,
            } => {
                let run_id = parse_run_id(run_id)?;
                let summary = rt
                    .store
                    .get_run_summary(run_id)?
                    .ok_or_else(|| anyhow!("unknown run {run_id}"))?;
                let plan = rt.store.get_plan(run_id)?;
                let record = agent_os_domain::FeedbackRecord {
                    feedback_id: format!("fb_{}", Ulid::new()),
                    run_id,
                    rating: *rating,
                    note: note.clone(),
                    profile: plan.as_ref().map_or(Profile::Strict, |p| p.profile),
                    task_kind: plan.as_ref().map_or(TaskKind::Other, |p| p.task_kind),
                    strategy_id: summary.chosen_strategy.unwrap_or_default(),
                    submitted_at: now_utc(),
                    processed: false,
                };
                record.validate().map_err(|err| anyhow!("{err}"))?;
                if cli.dry_run {
                    print_json(&serde_json::to_value(&record)?);
                } else {
                    rt.store.append_feedback(&record)?;
                    println!("feedback_id={} run_id={run_id}", record.feedback_id);
                }
                Ok(0)
            }
            FeedbackSubcommand::Stats => {
                let rows = rt.store.list_feedback(200)?;
                let up = rows.iter().filter(|row| row.rating > 0).count();
                let down = rows.len() - up;
                let pending = rows.iter().filter(|row| !row.processed).count();
                print_json(&json!({
                    "total": rows.len(),
                    "positive": up,
                    "negative": down,
                    "unprocessed": pending,
                }));
                Ok(0)
            }
        },
        Commands::Policy(args) => match &args.command {
            PolicySubcommand::Show => {
                let active = active_overrides(rt.store.as_ref())?;
                let snapshots = rt.store.list_override_snapshots()?;
                print_json(&json!({
                    "active": active,
                    "snapshots": snapshots
                        .iter()
                        .map(|snapshot| json!({
                            "snapshot_id": snapshot.snapshot_id.to_string(),
                            "applied_at": snapshot.applied_at,
                            "approved_by": snapshot.approved_by,
                            "note": snapshot.note,
                            "overrides": snapshot.overrides.len(),
                        }))
                        .collect::<Vec<_>>(),
                }));
                Ok(0)
            }
            PolicySubcommand::Apply { file, approved_by } => {
                let raw = std::fs::read_to_string(file)
                    .with_context(|| format!("cannot read {}", file.display()))?;
                let entries: Vec<PolicyOverride> = serde_json::from_str(&raw)
                    .map_err(|err| anyhow!("invalid override file: {err}"))?;
                for entry in &entries {
                    if entry.scope == OverrideScope::TaskKind
                        && TaskKind::parse(&entry.key).is_none()
                    {
                        return Err(anyhow!("unknown task_kind '{}' in override", entry.key));
                    }
                }
                if cli.dry_run {
                    print_json(&json!({"mode": "dry-run", "would_apply": entries}));
                    return Ok(0);
                }
                let (snapshot, diff) =
                    apply_overrides(rt.store.as_ref(), &entries, approved_by, "cli apply", now_utc())?;
                print_json(&json!({
                    "snapshot_id": snapshot.snapshot_id.to_string(),
                    "diff": diff,
                }));
                Ok(0)
            }
            PolicySubcommand::Rollback {
                snapshot,
                approved_by,
            } => {
                let target = SnapshotId(
                    Ulid::from_str(snapshot)
                        .map_err(|err| anyhow!("invalid snapshot id: {err}"))?,
                );
                if cli.dry_run {
                    print_json(&json!({"mode": "dry-run", "rollback_to": snapshot}));
                    return Ok(0);
                }
                let (new_snapshot, diff) =
                    rollback_to(rt.store.as_ref(), target, approved_by, now_utc())?;
                print_json(&json!({
                    "snapshot_id": new_snapshot.snapshot_id.to_string(),
                    "diff": diff,
                }));
                Ok(0)
            }
        },
        Commands::Services(args) => match &args.command {
            ServicesSubcommand::List => {
                print_json(&json!({
                    "services": rt.registry.list(),
                    "tools": rt
                        .mcp
                        .list_tools()
                        .into_iter()
                        .map(|(server, tools)| json!({"server": server, "tools": tools}))
                        .collect::<Vec<_>>(),
                }));
                Ok(0)
            }
            ServicesSubcommand::Call { name, params_json } => {
                let params: BTreeMap<String, Value> = serde_json::from_str(params_json)
                    .map_err(|err| anyhow!("invalid --params-json: {err}"))?;
                let request = ServiceRequest {
                    run_id: RunId::new(),
                    strategy_id: name.clone(),
                    text: String::new(),
                    params,
                    deadline_ms: rt.config.defaults.attempt_deadline_ms,
                    dry_run: cli.dry_run,
                };
                match rt.registry.call(name, &request)? {
                    ServiceResult::Completed(response) => {
                        print_json(&json!({
                            "ok": true,
                            "payload": response.payload,
                            "artifacts": response.artifacts.len(),
                        }));
                        Ok(0)
                    }
                    ServiceResult::Partial { response, violation } => {
                        print_json(&json!({
                            "ok": false,
                            "violation": violation,
                            "payload": response.payload,
                        }));
                        Ok(ErrorKind::ContractViolation.exit_code())
                    }
                    ServiceResult::Skipped { error_kind, reason } => {
                        print_json(&json!({
                            "ok": false,
                            "error_kind": error_kind.as_str(),
                            "reason": reason,
                        }));
                        Ok(error_kind.exit_code())
                    }
                }
            }
        },
        Commands::Diagnose => {
            let descriptors = rt.registry.descriptors();
            let report = agent_os_observe::diagnose(
                rt.store.as_ref(),
                &rt.config,
                &descriptors,
                &rt.config.defaults.data_dir,
                20,
            )?;
            print_json(&serde_json::to_value(&report)?);
            Ok(i32::from(!report.ok))
        }
        Commands::Pipeline { file } => {
            let spec = load_pipeline_spec(file)?;
            let outcome = run_pipeline(&rt.mcp, &spec, cli.dry_run)?;
            print_json(&serde_json::to_value(&outcome)?);
            Ok(if outcome.ok {
                0
            } else {
                ErrorKind::ServiceUnavailable.exit_code()
            })
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match dispatch(&cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(error_kind_of(&err).exit_code());
        }
    }
}

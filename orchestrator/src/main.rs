//! Command-line front end for the run orchestrator.
//!
//! Manages policy profiles, validates and runs execution plans, and prints
//! run event logs. Exit codes are listed in `orchestrator::exit_codes`.

use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use jsonschema::Draft;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use orchestrator::checkpoint::CheckpointManager;
use orchestrator::core::dag::{execution_order, validate_plan};
use orchestrator::core::model::PlanRequest;
use orchestrator::core::policy::{DecisionKind, evaluate};
use orchestrator::core::safety::SafetyMonitor;
use orchestrator::core::transitions::replay_status;
use orchestrator::core::types::{ApprovalDecision, PlanStatus, RunId, ToolCall};
use orchestrator::exit_codes;
use orchestrator::io::approval::{ApprovalBroker, ApprovalChannel, StaticApprovals};
use orchestrator::io::config::{CONFIG_PATH, OrchestratorConfig, load_config, write_config};
use orchestrator::io::dispatch::WorkerRegistry;
use orchestrator::io::event_log::{EventLog, JsonlEventLog};
use orchestrator::io::gates::CommandGateRunner;
use orchestrator::io::profiles::{FileProfileStore, ProfileSource, parse_profile};
use orchestrator::io::store::InMemoryStore;
use orchestrator::io::workspace::GitWorkspacePool;
use orchestrator::logging;
use orchestrator::run::{RunServices, RunSettings, RunStateMachine};
use orchestrator::scheduler::PlanScheduler;

const PLAN_SCHEMA: &str = include_str!("../schemas/plan.schema.json");

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Run coding agents step by step under policy, and schedule them as plans"
)]
struct Cli {
    /// Config file; defaults apply when it does not exist.
    #[arg(long, global = true, default_value = CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect and manage permission policy profiles.
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
    /// Validate or execute a plan file.
    Plan {
        #[command(subcommand)]
        command: PlanCommand,
    },
    /// Print the event log of a run, one JSON object per line.
    Events {
        run_id: String,
        /// Print only the status replayed from `status_changed` events.
        #[arg(long)]
        status: bool,
    },
    /// Check or create the config file.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum PolicyCommand {
    /// List built-in and custom profiles.
    List,
    /// Evaluate one tool call; the exit code reflects the decision.
    Eval {
        #[arg(long)]
        profile: String,
        #[arg(long)]
        tool: String,
        #[arg(long)]
        action: String,
        #[arg(long)]
        path: Option<String>,
    },
    /// Create or replace a custom profile from a TOML file.
    Save { file: PathBuf },
    /// Delete a custom profile.
    Delete { name: String },
}

#[derive(Subcommand)]
enum PlanCommand {
    /// Check a plan against the schema and its dependency graph; print the execution order.
    Validate { file: PathBuf },
    /// Run a plan to completion.
    Run {
        file: PathBuf,
        /// Approve every `ask` decision instead of prompting on stdin.
        #[arg(long)]
        auto_approve: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Parse and validate the config file.
    Check,
    /// Write a config file with default values.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Policy { command } => {
            let config = load_config(&cli.config)?;
            let profiles = FileProfileStore::new(&config.profiles_dir);
            match command {
                PolicyCommand::List => cmd_policy_list(&profiles),
                PolicyCommand::Eval {
                    profile,
                    tool,
                    action,
                    path,
                } => cmd_policy_eval(&profiles, &profile, &tool, &action, path),
                PolicyCommand::Save { file } => cmd_policy_save(&profiles, &file),
                PolicyCommand::Delete { name } => {
                    profiles.delete(&name)?;
                    println!("deleted {name}");
                    Ok(exit_codes::OK)
                }
            }
        }
        Command::Plan { command } => match command {
            PlanCommand::Validate { file } => cmd_plan_validate(&file),
            PlanCommand::Run { file, auto_approve } => {
                let config = load_config(&cli.config)?;
                cmd_plan_run(&config, &file, auto_approve)
            }
        },
        Command::Events { run_id, status } => {
            let config = load_config(&cli.config)?;
            cmd_events(&config, &RunId::new(run_id), status)
        }
        Command::Config { command } => match command {
            ConfigCommand::Check => {
                load_config(&cli.config)?;
                println!("ok");
                Ok(exit_codes::OK)
            }
            ConfigCommand::Init { force } => {
                if cli.config.exists() && !force {
                    bail!("{} already exists (use --force)", cli.config.display());
                }
                write_config(&cli.config, &OrchestratorConfig::default())?;
                Ok(exit_codes::OK)
            }
        },
    }
}

fn cmd_policy_list(profiles: &dyn ProfileSource) -> Result<i32> {
    for summary in profiles.list()? {
        let origin = if summary.builtin { "builtin" } else { "custom" };
        println!("{}\t{}\t{}", summary.name, origin, summary.description);
    }
    Ok(exit_codes::OK)
}

fn cmd_policy_eval(
    profiles: &dyn ProfileSource,
    profile: &str,
    tool: &str,
    action: &str,
    path: Option<String>,
) -> Result<i32> {
    let compiled = profiles.get(profile)?;
    let mut call = ToolCall::new(tool, action);
    if let Some(path) = path {
        call = call.with_path(path);
    }
    let decision = evaluate(&compiled, &call);
    let report = json!({
        "profile": compiled.name(),
        "decision": decision.kind.as_str(),
        "rule_index": decision.rule_index,
    });
    println!("{report}");
    Ok(match decision.kind {
        DecisionKind::Allow => exit_codes::OK,
        DecisionKind::Deny => exit_codes::DENIED,
        DecisionKind::Ask => exit_codes::ASK,
    })
}

fn cmd_policy_save(profiles: &dyn ProfileSource, file: &Path) -> Result<i32> {
    let raw = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let profile = parse_profile(&raw).with_context(|| format!("parse {}", file.display()))?;
    let name = profile.name.clone();
    profiles.save(profile)?;
    println!("saved {name}");
    Ok(exit_codes::OK)
}

fn cmd_plan_validate(file: &Path) -> Result<i32> {
    let request = read_plan(file)?;
    let order = execution_order(&request).map_err(|cycle| {
        let ids: Vec<&str> = cycle.iter().map(|id| id.as_str()).collect();
        anyhow::anyhow!("dependency cycle among: {}", ids.join(", "))
    })?;
    for id in order {
        println!("{id}");
    }
    Ok(exit_codes::OK)
}

fn cmd_plan_run(config: &OrchestratorConfig, file: &Path, auto_approve: bool) -> Result<i32> {
    let request = read_plan(file)?;
    block_on(run_plan_file(config, request, auto_approve))?
}

async fn run_plan_file(
    config: &OrchestratorConfig,
    request: PlanRequest,
    auto_approve: bool,
) -> Result<i32> {
    let approvals: Arc<dyn ApprovalChannel> = if auto_approve {
        Arc::new(StaticApprovals(ApprovalDecision::Allow))
    } else {
        let broker = ApprovalBroker::new();
        spawn_operator_prompt(broker.clone());
        Arc::new(broker)
    };
    let scheduler = build_scheduler(config, approvals)?;
    let plan = scheduler.create_plan(request).await?;
    info!(plan_id = %plan.id, "plan created");

    let cancel = CancellationToken::new();
    let execution = scheduler.run_plan(&plan.id, cancel.clone());
    tokio::pin!(execution);
    let finished = tokio::select! {
        finished = &mut execution => finished,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; cancelling plan");
            cancel.cancel();
            execution.await
        }
    };
    let plan = finished?;
    let steps = scheduler.list_steps(&plan.id).await?;
    let report = json!({ "plan": plan, "steps": steps });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serialize plan report")?
    );
    Ok(match plan.status {
        PlanStatus::Completed => exit_codes::OK,
        PlanStatus::Cancelled => exit_codes::CANCELLED,
        PlanStatus::Pending | PlanStatus::Running | PlanStatus::Failed => exit_codes::PLAN_FAILED,
    })
}

fn cmd_events(config: &OrchestratorConfig, run_id: &RunId, status_only: bool) -> Result<i32> {
    let log = JsonlEventLog::new(&config.events_dir);
    let events = block_on(log.list_by_run(run_id))??;
    if events.is_empty() {
        bail!("no events recorded for run {run_id}");
    }
    if status_only {
        println!("{}", replay_status(&events));
        return Ok(exit_codes::OK);
    }
    for event in &events {
        println!(
            "{}",
            serde_json::to_string(event).context("serialize event")?
        );
    }
    Ok(exit_codes::OK)
}

/// Wire the production adapters from config: worker backend, git checkpoints,
/// JSONL events, file profiles, command gates.
fn build_scheduler(
    config: &OrchestratorConfig,
    approvals: Arc<dyn ApprovalChannel>,
) -> Result<PlanScheduler> {
    let store = InMemoryStore::new();
    let dispatcher = WorkerRegistry::with_builtin_backends()
        .build(&config.worker)
        .context("build worker backend")?;
    let checkpoints = CheckpointManager::new(
        Arc::new(GitWorkspacePool::new()),
        Arc::new(store.clone()),
        config.checkpoint.concurrency,
        Duration::from_secs(config.checkpoint.acquire_timeout_secs),
    );
    let safety = SafetyMonitor::new(
        config.safety.limits(),
        &config.safety.blocked_paths,
        &config.safety.blocked_commands,
    )?;
    let services = RunServices {
        store: Arc::new(store),
        events: Arc::new(JsonlEventLog::new(&config.events_dir)),
        dispatcher,
        approvals,
        gates: Arc::new(CommandGateRunner::new(
            config.context.gate_output_limit_bytes,
        )),
        profiles: Arc::new(FileProfileStore::new(&config.profiles_dir)),
        checkpoints,
        safety,
    };
    let machine = RunStateMachine::new(services, RunSettings::from_config(config))?;
    Ok(PlanScheduler::new(
        machine,
        config.plan.clone(),
        config.max_concurrent_runs,
    ))
}

/// Answer pending approvals from stdin; anything but `y`/`yes` denies.
fn spawn_operator_prompt(broker: ApprovalBroker) {
    tokio::spawn(async move {
        loop {
            let request = broker.next_pending().await;
            let call = &request.tool_call;
            let prompt = format!(
                "approve {} {} {} for run {} step {}? [y/N] ",
                call.tool,
                call.action,
                call.path.as_deref().unwrap_or("-"),
                request.run_id,
                request.step_index
            );
            let answer = tokio::task::spawn_blocking(move || {
                eprint!("{prompt}");
                let mut line = String::new();
                std::io::stdin().read_line(&mut line).map(|_| line)
            })
            .await;
            let decision = match answer {
                Ok(Ok(line)) if matches!(line.trim(), "y" | "yes") => ApprovalDecision::Allow,
                _ => ApprovalDecision::Deny,
            };
            broker.decide(&request.run_id, decision);
        }
    });
}

fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start tokio runtime")?;
    Ok(runtime.block_on(future))
}

/// Parse a plan file: JSON Schema conformance, then graph validation.
fn read_plan(file: &Path) -> Result<PlanRequest> {
    let raw = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let instance: Value = serde_json::from_str(&raw).context("parse plan json")?;
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).context("parse plan schema")?;
    validate_schema(&instance, &schema)?;
    let request: PlanRequest =
        serde_json::from_value(instance).context("parse plan as PlanRequest")?;
    let errors = validate_plan(&request);
    if !errors.is_empty() {
        bail!("invalid plan:\n- {}", errors.join("\n- "));
    }
    Ok(request)
}

/// Validate JSON instance against a JSON Schema (Draft 2020-12).
fn validate_schema(instance: &Value, schema: &Value) -> Result<()> {
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Value {
        serde_json::from_str(PLAN_SCHEMA).unwrap()
    }

    #[test]
    fn parse_policy_eval() {
        let cli = Cli::parse_from([
            "orchestrator",
            "policy",
            "eval",
            "--profile",
            "plan-readonly",
            "--tool",
            "fs",
            "--action",
            "write",
        ]);
        match cli.command {
            Command::Policy {
                command: PolicyCommand::Eval { profile, path, .. },
            } => {
                assert_eq!(profile, "plan-readonly");
                assert_eq!(path, None);
            }
            _ => panic!("expected policy eval"),
        }
    }

    #[test]
    fn parse_plan_run_auto_approve() {
        let cli = Cli::parse_from(["orchestrator", "plan", "run", "plan.json", "--auto-approve"]);
        assert!(matches!(
            cli.command,
            Command::Plan {
                command: PlanCommand::Run {
                    auto_approve: true,
                    ..
                }
            }
        ));
        assert_eq!(cli.config, PathBuf::from(".orchestrator/config.toml"));
    }

    #[test]
    fn schema_accepts_minimal_plan() {
        let plan = json!({
            "project_id": "p",
            "name": "n",
            "protocol": "parallel",
            "workspace": "/w",
            "steps": [{"id": "a", "task_id": "t", "agent_id": "x", "policy_profile": "plan-readonly"}]
        });
        validate_schema(&plan, &schema()).unwrap();
    }

    #[test]
    fn schema_rejects_unknown_protocol() {
        let plan = json!({
            "project_id": "p",
            "name": "n",
            "protocol": "round_robin",
            "workspace": "/w",
            "steps": [{"id": "a", "task_id": "t", "agent_id": "x", "policy_profile": "plan-readonly"}]
        });
        let err = validate_schema(&plan, &schema()).unwrap_err();
        assert!(err.to_string().contains("schema validation failed"));
    }

    #[test]
    fn schema_accepts_arbiter_selection() {
        let plan = json!({
            "project_id": "p",
            "name": "n",
            "protocol": "consensus",
            "workspace": "/w",
            "selection": {"kind": "arbiter", "agent_id": "judge", "policy_profile": "plan-readonly"},
            "steps": [{"id": "a", "task_id": "t", "agent_id": "x", "policy_profile": "plan-readonly"}]
        });
        validate_schema(&plan, &schema()).unwrap();
    }
}

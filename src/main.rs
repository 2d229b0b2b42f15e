use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use strata_core::config::{strata_home, AppConfig};
use strata_core::event::ExecutionEvent;
use strata_core::execution::{ExecutionStatus, WorkflowExecution};
use strata_core::traits::WorkflowSource;
use strata_core::types::ExecutionId;
use strata_core::workflow::WorkflowDag;

use strata_engine::{DirectoryWorkflowSource, EventLogger, ExecutionJournal, Orchestrator};

#[derive(Parser)]
#[command(name = "strata", version, about = "DAG workflow orchestration for role-based engineering work")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "strata.toml")]
    config: PathBuf,

    /// Workflow directory (overrides [workspace].workflows_dir)
    #[arg(short, long)]
    workflows: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow for one work item and wait for it to finish
    Run {
        /// Workflow id
        workflow: String,
        /// Work item the execution is for (ticket, issue, ...)
        #[arg(long)]
        work_item: String,
        /// Execution input as key=value; repeatable
        #[arg(long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// Execution inputs as a JSON object; merged under --input values
        #[arg(long)]
        inputs_json: Option<String>,
    },
    /// Validate workflow files and print their structure
    Validate {
        /// Files to validate (default: every workflow in the workflow directory)
        files: Vec<PathBuf>,
    },
    /// Show recently finished executions from the journal
    History {
        /// Number of executions to show
        #[arg(long, default_value = "20")]
        limit: usize,
        /// Show the backtrack history of one execution
        #[arg(long)]
        execution: Option<String>,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("strata=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "strata", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    let workflows_dir = cli.workflows.clone().unwrap_or_else(|| config.workflows_dir());

    match cli.command {
        Commands::Run {
            workflow,
            work_item,
            inputs,
            inputs_json,
        } => {
            let inputs = parse_inputs(&inputs, inputs_json.as_deref())?;
            let exec = run_workflow(&config, &workflows_dir, &workflow, &work_item, inputs).await?;
            print_summary(&exec);
            if exec.status != ExecutionStatus::Completed {
                anyhow::bail!(
                    "execution {} ended {}",
                    exec.id,
                    exec.status.as_str().to_lowercase()
                );
            }
        }
        Commands::Validate { files } => validate(&workflows_dir, &files)?,
        Commands::History { limit, execution } => history(&config, limit, execution.as_deref())?,
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = strata_home().join("config.toml");
    if home_config.exists() {
        info!(path = %home_config.display(), "Loading config from home directory");
        return Ok(AppConfig::load(&home_config)?);
    }
    warn!("No config file found, using defaults");
    Ok(AppConfig::default())
}

fn parse_inputs(pairs: &[String], json: Option<&str>) -> anyhow::Result<serde_json::Value> {
    let mut inputs = match json {
        Some(raw) => match serde_json::from_str::<serde_json::Value>(raw).context("--inputs-json is not valid JSON")? {
            serde_json::Value::Object(map) => map,
            _ => anyhow::bail!("--inputs-json must be a JSON object"),
        },
        None => serde_json::Map::new(),
    };
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("input '{}' is not KEY=VALUE", pair))?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        inputs.insert(key.trim().to_string(), value);
    }
    Ok(serde_json::Value::Object(inputs))
}

async fn run_workflow(
    config: &AppConfig,
    workflows_dir: &Path,
    workflow_id: &str,
    work_item: &str,
    inputs: serde_json::Value,
) -> anyhow::Result<WorkflowExecution> {
    let source = DirectoryWorkflowSource::load(workflows_dir)
        .with_context(|| format!("reading workflows from {}", workflows_dir.display()))?;
    let orchestrator = Arc::new(Orchestrator::from_config(config, Arc::new(source))?);

    let shutdown = CancellationToken::new();
    if let Some(log_dir) = config.log_dir() {
        let logger = EventLogger::new(&log_dir);
        info!(path = %logger.path().display(), "Event log enabled");
        logger.spawn(&orchestrator.event_bus(), shutdown.clone());
    }

    let events = orchestrator.subscribe();
    let id = orchestrator
        .start_workflow(work_item, workflow_id, inputs, HashMap::new())
        .await?;
    println!("Started execution {}", id);

    let printer = tokio::spawn(print_progress(events, id.clone()));

    let ctrl_c = {
        let orchestrator = orchestrator.clone();
        let id = id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, cancelling execution");
                if let Err(e) = orchestrator.cancel_execution(id.as_str()).await {
                    warn!(error = %e, "Cancel failed");
                }
            }
        })
    };

    let exec = orchestrator.wait_for_completion(id.as_str()).await?;
    ctrl_c.abort();
    printer.await.ok();
    shutdown.cancel();
    Ok(exec)
}

/// Print one line per event of `id` until it reaches a terminal event.
async fn print_progress(mut rx: broadcast::Receiver<ExecutionEvent>, id: ExecutionId) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                println!("  ... {} events skipped", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if event.execution_id() != &id {
            continue;
        }
        match &event {
            ExecutionEvent::NodeStarted {
                node_id,
                role_type,
                branch_name,
                ..
            } => println!("  > {} ({}) on {}", node_id, role_type, branch_name),
            ExecutionEvent::NodeCompleted { node_id, .. } => println!("  + {}", node_id),
            ExecutionEvent::NodeFailed { node_id, error, .. } => {
                println!("  x {}: {}", node_id, error)
            }
            ExecutionEvent::QualityGateEvaluated {
                node_id, results, ..
            } => {
                for r in results {
                    let actual = r
                        .actual
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "missing".into());
                    let mark = if r.passed { "pass" } else { "FAIL" };
                    println!(
                        "  gate {} at {}: {} = {} (threshold {}) {}",
                        r.gate_id, node_id, r.metric, actual, r.threshold, mark
                    );
                }
            }
            ExecutionEvent::BacktrackInitiated { event, .. } => println!(
                "  <- backtrack {} -> {} ({}, attempt {})",
                event.from_node, event.to_node, event.reason, event.attempts
            ),
            _ => {}
        }
        if event.is_terminal() {
            break;
        }
    }
}

fn print_summary(exec: &WorkflowExecution) {
    println!();
    println!("Execution {} {}", exec.id, exec.status);
    println!("  workflow:   {}", exec.workflow_id);
    println!("  work item:  {}", exec.work_item_id);
    println!("  completed:  {}", exec.completed_nodes.join(", "));
    if !exec.failed_nodes.is_empty() {
        println!("  failed:     {}", exec.failed_nodes.join(", "));
    }
    if !exec.skipped_nodes.is_empty() {
        println!("  skipped:    {}", exec.skipped_nodes.join(", "));
    }
    if !exec.backtrack_history.is_empty() {
        println!("  backtracks: {}", exec.backtrack_history.len());
    }
    if let Some(reason) = &exec.failure_reason {
        println!("  reason:     {}", reason);
    }
    if let Some(end) = exec.end_time {
        let secs = (end - exec.start_time).num_milliseconds() as f64 / 1000.0;
        println!("  duration:   {:.1}s", secs);
    }
}

fn validate(workflows_dir: &Path, files: &[PathBuf]) -> anyhow::Result<()> {
    if files.is_empty() {
        let source = DirectoryWorkflowSource::load(workflows_dir)
            .with_context(|| format!("reading workflows from {}", workflows_dir.display()))?;
        let ids = source.list_workflows();
        if ids.is_empty() {
            anyhow::bail!("no valid workflows in {}", workflows_dir.display());
        }
        for id in ids {
            if let Some(dag) = source.get_workflow(&id) {
                describe(&dag);
            }
        }
        return Ok(());
    }

    let mut invalid = 0;
    for file in files {
        match WorkflowDag::load(file) {
            Ok(dag) => describe(&dag),
            Err(e) => {
                invalid += 1;
                println!("{}: {}", file.display(), e);
            }
        }
    }
    if invalid > 0 {
        anyhow::bail!("{} of {} workflow files invalid", invalid, files.len());
    }
    Ok(())
}

fn describe(dag: &WorkflowDag) {
    println!("{} ({} nodes) OK", dag.id, dag.nodes.len());
    println!("  entry:  {}", dag.entry_points.join(", "));
    let exits: Vec<&str> = dag.exit_points.iter().map(String::as_str).collect();
    println!("  exit:   {}", exits.join(", "));
    if !dag.merge_points.is_empty() {
        let merges: Vec<&str> = dag.merge_points.iter().map(String::as_str).collect();
        println!("  merge:  {}", merges.join(", "));
    }
    for group in dag.parallel_groups() {
        println!("  group:  [{}]", group.join(", "));
    }
    for rule in &dag.backtrack_rules {
        println!(
            "  rule:   {} -> {} (max {})",
            rule.trigger, rule.target_node, rule.max_backtrack_count
        );
    }
}

fn history(config: &AppConfig, limit: usize, execution: Option<&str>) -> anyhow::Result<()> {
    let Some(path) = config.journal_path() else {
        anyhow::bail!("the execution journal is disabled in [journal]");
    };
    let journal = ExecutionJournal::open(&path)?;

    if let Some(id) = execution {
        let backtracks = journal.backtracks_for(id)?;
        if backtracks.is_empty() {
            println!("No backtracks recorded for {}", id);
        }
        for bt in backtracks {
            println!(
                "{}  {} -> {}  {} (attempt {})",
                bt.timestamp.format("%Y-%m-%d %H:%M:%S"),
                bt.from_node,
                bt.to_node,
                bt.reason,
                bt.attempts
            );
        }
        return Ok(());
    }

    let recent = journal.recent(limit)?;
    if recent.is_empty() {
        println!("No executions recorded yet.");
    }
    for e in recent {
        println!(
            "{}  {:<10} {:<16} {:<14} nodes={} backtracks={}  {}",
            e.start_time.format("%Y-%m-%d %H:%M:%S"),
            e.status,
            e.workflow_id,
            e.work_item_id,
            e.completed_nodes.len(),
            e.backtracks,
            e.execution_id
        );
        if let Some(reason) = e.failure_reason {
            println!("    {}", reason);
        }
    }
    Ok(())
}

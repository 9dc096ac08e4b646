use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use baton::config::Config;
use baton::core::task::{TaskId, TaskStatus};
use baton::git::GitOps;
use baton::orchestration::{
    resolve_worker, send_command, ControlCommand, Coordinator, EventBus, EventFilter, IpcServer,
    OrchestratorContext,
};
use baton::state::{StatusStore, TransitionMeta};
use baton::{blog, blog_warn, Error, Result};

/// Baton - dependency-aware, conflict-free parallel plan execution
#[derive(Parser, Debug)]
#[command(name = "baton")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    BATON_DEBUG=1   Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.baton/baton.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.baton/baton.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute a plan until it finishes, blocks, or is shut down
    Run {
        /// Plan outline (markdown)
        plan: PathBuf,

        /// Maximum tasks per batch
        #[arg(long)]
        max_batch: Option<usize>,

        /// Worker command template, e.g. "claude -p {description}"
        #[arg(long)]
        worker: Option<String>,

        /// Print events as JSON lines on stdout
        #[arg(long)]
        events: bool,

        /// Do not commit task results
        #[arg(long)]
        no_commit: bool,
    },

    /// Parse and analyze a plan without running it
    Validate {
        plan: PathBuf,
    },

    /// Show the persisted status of the current plan
    Status {
        /// Print the raw status document
        #[arg(long)]
        json: bool,
    },

    /// Stop dispatching new batches; running workers finish
    Pause,

    /// Resume dispatching after a pause
    Resume,

    /// Wait (bounded) for running workers, then stop
    Shutdown,

    /// Mark a task skipped, stopping its worker if it is running
    Skip {
        task_id: String,
    },

    /// Re-queue a failed or running task
    Retry {
        task_id: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    baton::log::init_with_debug(cli.debug);

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            plan,
            max_batch,
            worker,
            events,
            no_commit,
        } => run_plan(config, &plan, max_batch, worker, events, no_commit),
        Command::Validate { plan } => run_validate(config, &plan),
        Command::Status { json } => run_status(&config, json),
        Command::Pause => run_control(&config, ControlCommand::Pause),
        Command::Resume => run_control(&config, ControlCommand::Resume),
        Command::Shutdown => run_control(&config, ControlCommand::Shutdown),
        Command::Skip { task_id } => run_control(
            &config,
            ControlCommand::SkipTask {
                task_id: TaskId::new(task_id),
            },
        ),
        Command::Retry { task_id } => run_control(
            &config,
            ControlCommand::RetryTask {
                task_id: TaskId::new(task_id),
            },
        ),
    }
}

fn run_plan(
    mut config: Config,
    plan_path: &Path,
    max_batch: Option<usize>,
    worker: Option<String>,
    events: bool,
    no_commit: bool,
) -> Result<()> {
    if let Some(n) = max_batch {
        config.scheduler.max_batch_size = n;
    }
    if let Some(w) = worker {
        config.execution.worker_command = w;
    }
    if no_commit {
        config.commit.enabled = false;
    }
    config.validate()?;
    let worker_bin = resolve_worker(&config.execution.worker_command)?;
    blog!(
        "Run command: plan={} worker={}",
        plan_path.display(),
        worker_bin.display()
    );

    let ctx = OrchestratorContext::load(plan_path, config)?;
    let socket = ctx.config.socket_path();
    let commit_enabled = ctx.config.commit.enabled;

    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(async {
        let bus = EventBus::new();
        let printer = if events {
            let (_, rx) = bus.subscribe_channel(
                EventFilter::all().for_instance(ctx.instance_id.clone()),
                1024,
            );
            Some(thread::spawn(move || {
                for event in rx {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{}", line);
                    }
                }
            }))
        } else {
            None
        };

        let mut coordinator = Coordinator::new(ctx, bus)?;
        if commit_enabled {
            match GitOps::new(&std::env::current_dir()?) {
                Ok(git) => coordinator = coordinator.with_committer(Arc::new(git)),
                Err(e) => {
                    blog_warn!("Commits disabled: {}", e);
                    eprintln!("warning: not a git repository, task results will not be committed");
                }
            }
        }

        let cancel = CancellationToken::new();
        let server = IpcServer::bind(&socket, coordinator.control_handle().sender(), cancel)?;

        let control = coordinator.control_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                blog!("Interrupt received; shutting down");
                let _ = control.send(ControlCommand::Shutdown).await;
            }
        });

        let summary = coordinator.run().await;
        server.shutdown().await;
        drop(coordinator);
        if let Some(handle) = printer {
            let _ = handle.join();
        }
        summary
    })?;

    if events {
        eprintln!("{}", serde_json::to_string(&summary)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(())
}

fn run_validate(config: Config, plan_path: &Path) -> Result<()> {
    let ctx = OrchestratorContext::load(plan_path, config)?;
    println!("Plan:      {} ({})", ctx.plan.name, ctx.plan.id);
    println!("Phases:    {}", ctx.plan.phases.len());
    println!("Tasks:     {}", ctx.plan.task_count());
    println!("Edges:     {}", ctx.graph.dependency_count());
    println!("Conflicts: {} pair(s)", ctx.conflicts.pair_count());
    match resolve_worker(&ctx.config.execution.worker_command) {
        Ok(path) => println!("Worker:    {}", path.display()),
        Err(e) => println!("Worker:    {}", e),
    }
    println!();
    for phase in &ctx.plan.phases {
        let mode = if phase.parallel_allowed { "parallel" } else { "sequential" };
        println!(
            "Phase {}: {} [{}, threshold {}]",
            phase.id,
            phase.name,
            mode,
            phase.threshold_or(ctx.config.scheduler.phase_completion_threshold)
        );
        for id in &phase.task_ids {
            let deps: Vec<&str> = ctx.graph.dependencies(id).into_iter().map(TaskId::as_str).collect();
            let conflicts: Vec<&str> = ctx.conflicts.conflicts_of(id).into_iter().map(TaskId::as_str).collect();
            let mut line = format!("  {}", id);
            if !deps.is_empty() {
                line.push_str(&format!("  after {}", deps.join(", ")));
            }
            if ctx.graph.is_phase_gated(id) {
                line.push_str("  (gated)");
            }
            if !conflicts.is_empty() {
                line.push_str(&format!("  conflicts {}", conflicts.join(", ")));
            }
            println!("{}", line);
        }
    }
    Ok(())
}

fn run_status(config: &Config, json: bool) -> Result<()> {
    let state = StatusStore::new(config.state_path()).read()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    let counts = state.counts();
    println!("Plan:    {} ({})", state.plan.name, state.plan.status);
    println!(
        "Tasks:   {} completed, {} in progress, {} pending, {} failed, {} skipped",
        counts.completed, counts.in_progress, counts.pending, counts.failed, counts.skipped
    );
    println!("Updated: {}", state.last_updated.to_rfc3339());
    for phase in &state.phases {
        println!();
        println!("Phase {}: {} ({})", phase.id, phase.name, phase.status);
        for id in &phase.task_ids {
            let Some(task) = state.task(id) else {
                continue;
            };
            let mut line = format!(
                "  {:<8} {:<12} {}",
                task.id.as_str(),
                task.status.as_str(),
                task.description
            );
            if task.retry_count > 0 {
                line.push_str(&format!("  (retries: {})", task.retry_count));
            }
            println!("{}", line);
            if task.status == TaskStatus::Failed {
                if let Some(err) = task.last_error.as_deref().and_then(|e| e.lines().next()) {
                    println!("           {}", err);
                }
            }
        }
    }
    Ok(())
}

fn run_control(config: &Config, command: ControlCommand) -> Result<()> {
    let socket = config.socket_path();
    let rt = tokio::runtime::Runtime::new()?;
    let response = match rt.block_on(send_command(&socket, &command)) {
        Ok(response) => response,
        Err(Error::Protocol(reason)) => {
            blog!("No orchestrator reachable ({}); applying {} to the store", reason, command);
            return apply_offline(config, &command);
        }
        Err(e) => return Err(e),
    };

    if response.ok {
        println!("ok");
        Ok(())
    } else {
        Err(Error::Protocol(response.error.unwrap_or_else(|| "rejected".to_string())))
    }
}

/// Apply skip/retry directly to the status file when no orchestrator runs.
fn apply_offline(config: &Config, command: &ControlCommand) -> Result<()> {
    let store = StatusStore::new(config.state_path())
        .with_skip_through(config.scheduler.skip_through);
    match command {
        ControlCommand::SkipTask { task_id } => {
            store.apply_transition(task_id, TaskStatus::Skipped, TransitionMeta::default())?;
        }
        ControlCommand::RetryTask { task_id } => {
            let state = store.read()?;
            if state.status_of(task_id) == Some(TaskStatus::InProgress) {
                store.apply_transition(
                    task_id,
                    TaskStatus::Failed,
                    TransitionMeta::error("retried by operator").retried(),
                )?;
            }
            store.apply_transition(task_id, TaskStatus::Pending, TransitionMeta::default())?;
        }
        other => {
            return Err(Error::Protocol(format!(
                "no orchestrator is running to {}",
                other.name()
            )))
        }
    }
    println!("ok (applied to {})", store.path().display());
    Ok(())
}

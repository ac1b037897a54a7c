//! # Agentloom — orchestration runtime for autonomous agent tasks
//!
//! Usage:
//!   agentloom run                               # Worker pool + scheduler until Ctrl-C
//!   agentloom run --ephemeral                   # Same, with an in-memory store
//!   agentloom enqueue --workspace ws --context ctx --title "Digest" "Summarize inbox"
//!   agentloom event ws markdown.updated --detail notes/today.md
//!   agentloom tasks list --status failed
//!   agentloom tasks retry <task-id>
//!   agentloom objectives add --workspace ws --context ctx --title "Digest" --cron "0 8 * * *" "Summarize"
//!   agentloom objectives pause|resume|delete <objective-id>

use std::path::PathBuf;
use std::sync::Arc;

use agentloom_core::config::LoomConfig;
use agentloom_core::traits::TaskStore;
use agentloom_core::types::{
    Objective, ObjectiveDraft, Task, TaskDraft, TaskFilter, TaskKind, TaskOrigin, TaskStatus,
    TriggerType,
};
use agentloom_scheduler::dispatch::publishers_from_config;
use agentloom_scheduler::executor::HttpExecutor;
use agentloom_scheduler::observer::{ActivityLog, CompositeObserver, TracingObserver};
use agentloom_scheduler::{
    DeliveryTarget, MemoryStore, NotificationDispatcher, ObjectiveLedger, ObjectiveScheduler,
    SqliteStore, TaskEngine, cron,
};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "agentloom",
    version,
    about = "🧵 Agentloom — task queue, worker pool and objective scheduler for agents"
)]
struct Cli {
    /// Config file (default: ~/.agentloom/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool, objective scheduler and stale recovery until Ctrl-C
    Run {
        /// Keep everything in memory; nothing survives the process
        #[arg(long)]
        ephemeral: bool,
    },
    /// Queue a task for the next `run`
    Enqueue {
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        context: String,
        #[arg(long)]
        title: String,
        /// general, objective or reindex_markdown
        #[arg(long)]
        kind: Option<String>,
        /// Reply channel, as connector:external_id
        #[arg(long)]
        origin: Option<String>,
        prompt: String,
    },
    /// Fire a workspace event for event-triggered objectives
    Event {
        workspace: String,
        key: String,
        #[arg(long)]
        detail: Option<String>,
    },
    /// Inspect and retry tasks
    Tasks {
        #[command(subcommand)]
        action: TaskCommands,
    },
    /// Manage recurring objectives
    Objectives {
        #[command(subcommand)]
        action: ObjectiveCommands,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// List tasks, newest first
    List {
        #[arg(long)]
        workspace: Option<String>,
        /// queued, running, succeeded or failed
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Queue a fresh copy of a failed task
    Retry { id: String },
}

#[derive(Subcommand)]
enum ObjectiveCommands {
    /// List objectives
    List {
        #[arg(long)]
        workspace: Option<String>,
    },
    /// Add an objective; exactly one trigger is required
    Add {
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        context: String,
        #[arg(long)]
        title: String,
        /// Interval, e.g. "15m", "1h30m"
        #[arg(long)]
        every: Option<String>,
        /// Cron expression, e.g. "0 8 * * 1-5"
        #[arg(long)]
        cron: Option<String>,
        /// One-shot instant (RFC 3339)
        #[arg(long)]
        at: Option<String>,
        /// Event key, e.g. markdown.updated
        #[arg(long)]
        event: Option<String>,
        /// "UTC", "+07:00", "UTC-5"
        #[arg(long)]
        timezone: Option<String>,
        prompt: String,
    },
    Pause { id: String },
    Resume { id: String },
    Delete { id: String },
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "agentloom=debug,agentloom_scheduler=debug"
    } else {
        "agentloom=info,agentloom_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => LoomConfig::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => LoomConfig::load()?,
    };

    match cli.command {
        Commands::Run { ephemeral } => run(config, ephemeral).await,
        Commands::Enqueue {
            workspace,
            context,
            title,
            kind,
            origin,
            prompt,
        } => {
            let mut draft = TaskDraft::new(&workspace, &context, &title, &prompt);
            if let Some(kind) = kind {
                draft = draft.with_kind(kind.parse::<TaskKind>()?);
            }
            if let Some(origin) = origin {
                let target: DeliveryTarget = origin.parse()?;
                draft = draft.with_origin(TaskOrigin {
                    connector: target.connector,
                    external_id: target.external_id,
                    user_id: None,
                });
            }
            let engine = TaskEngine::new(open_store(&config, false)?, &config.engine);
            let task = engine.enqueue(draft)?;
            println!("📥 Queued {} (picked up by `agentloom run`)", task.id);
            Ok(())
        }
        Commands::Event {
            workspace,
            key,
            detail,
        } => {
            let store = open_store(&config, false)?;
            let engine = Arc::new(TaskEngine::new(store.clone(), &config.engine));
            let scheduler = ObjectiveScheduler::new(store, engine, config.scheduler.clone());
            let report = scheduler.handle_event(&workspace, &key, detail.as_deref(), Utc::now())?;
            println!(
                "🔔 {} objective task(s) queued, {} already queued, {} failed",
                report.dispatched, report.already_queued, report.failed
            );
            Ok(())
        }
        Commands::Tasks { action } => tasks_command(&config, action),
        Commands::Objectives { action } => objectives_command(&config, action),
    }
}

fn open_store(config: &LoomConfig, ephemeral: bool) -> Result<Arc<dyn TaskStore>> {
    if ephemeral {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let db_path = PathBuf::from(expand_path(&config.storage.db_path));
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    Ok(Arc::new(store))
}

async fn run(config: LoomConfig, ephemeral: bool) -> Result<()> {
    let store = open_store(&config, ephemeral)?;

    let mut engine = TaskEngine::new(store.clone(), &config.engine);
    if let Some(executor) = HttpExecutor::from_config(&config.executor) {
        engine.set_executor(Arc::new(executor));
    }
    let activity = Arc::new(ActivityLog::default());
    engine.set_observer(Arc::new(
        CompositeObserver::new()
            .with(Arc::new(TracingObserver))
            .with(activity.clone()),
    ));

    let mut notifier = NotificationDispatcher::from_config(&config.notifications);
    for publisher in publishers_from_config(&config.notifications) {
        notifier.register_publisher(publisher);
    }
    engine.set_notifier(Arc::new(notifier));

    let ledger = Arc::new(ObjectiveLedger::new(store.clone(), config.scheduler.clone()));
    engine.set_objective_ledger(ledger.clone());
    let engine = Arc::new(engine);
    let scheduler = ObjectiveScheduler::with_ledger(ledger, engine.clone());

    println!("🧵 Agentloom v{}", env!("CARGO_PKG_VERSION"));
    println!("   👷 Workers:   {}", engine.concurrency());
    println!("   📦 Queue:     {} slots", engine.queue_capacity());
    if ephemeral {
        println!("   🗄️  Store:     in-memory (ephemeral)");
    } else {
        println!("   🗄️  Store:     {}", expand_path(&config.storage.db_path));
    }
    println!();

    engine.resume_queued()?;

    let cancel = CancellationToken::new();
    let pool = {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.start(cancel).await })
    };
    let recovery = {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.run_recovery_loop(cancel).await })
    };
    let objectives = {
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    tokio::signal::ctrl_c().await?;
    println!("\n🛑 Shutting down...");
    cancel.cancel();

    pool.await??;
    recovery.await?;
    objectives.await?;
    println!(
        "✅ Stopped ({} lifecycle events this session)",
        activity.len()
    );
    Ok(())
}

fn tasks_command(config: &LoomConfig, action: TaskCommands) -> Result<()> {
    let engine = TaskEngine::new(open_store(config, false)?, &config.engine);
    match action {
        TaskCommands::List {
            workspace,
            status,
            limit,
        } => {
            let filter = TaskFilter {
                workspace_id: workspace,
                status: status.map(|s| s.parse::<TaskStatus>()).transpose()?,
                limit,
            };
            let tasks = engine.list_tasks(&filter)?;
            if tasks.is_empty() {
                println!("📭 No tasks");
            }
            for task in &tasks {
                print_task(task);
            }
        }
        TaskCommands::Retry { id } => {
            let task = engine.retry(&id)?;
            println!("🔁 Retry queued as {} (retry of {id})", task.id);
        }
    }
    Ok(())
}

fn print_task(task: &Task) {
    let icon = match task.status {
        TaskStatus::Queued => "⏳",
        TaskStatus::Running => "▶️",
        TaskStatus::Succeeded => "✅",
        TaskStatus::Failed => "❌",
    };
    println!(
        "{icon} {}  [{}] {}  ({}, attempts {})",
        task.id, task.kind, task.title, task.workspace_id, task.attempts
    );
    if let Some(summary) = &task.result_summary {
        println!("     {summary}");
    }
    if let Some(error) = &task.error_message {
        println!("     error: {error}");
    }
}

fn objectives_command(config: &LoomConfig, action: ObjectiveCommands) -> Result<()> {
    let store = open_store(config, false)?;
    let engine = Arc::new(TaskEngine::new(store.clone(), &config.engine));
    let scheduler = ObjectiveScheduler::new(store, engine, config.scheduler.clone());
    let now = Utc::now();

    match action {
        ObjectiveCommands::List { workspace } => {
            let objectives = scheduler.list_objectives(workspace.as_deref())?;
            if objectives.is_empty() {
                println!("📭 No objectives");
            }
            for objective in &objectives {
                print_objective(objective);
            }
        }
        ObjectiveCommands::Add {
            workspace,
            context,
            title,
            every,
            cron: expression,
            at,
            event,
            timezone,
            prompt,
        } => {
            let trigger = match (every, expression, at, event) {
                (Some(every), None, None, None) => TriggerType::Interval {
                    every_secs: cron::parse_every(&every)?.num_seconds().max(1) as u64,
                },
                (None, Some(expression), None, None) => TriggerType::Cron { expression },
                (None, None, Some(at), None) => TriggerType::Once {
                    at: DateTime::parse_from_rfc3339(&at)
                        .with_context(|| format!("invalid --at '{at}'"))?
                        .with_timezone(&Utc),
                },
                (None, None, None, Some(key)) => TriggerType::Event { key },
                _ => bail!("exactly one of --every, --cron, --at or --event is required"),
            };
            let objective = scheduler.create_objective(
                ObjectiveDraft {
                    workspace_id: workspace,
                    context_id: context,
                    title,
                    prompt,
                    trigger,
                    timezone,
                    active: true,
                },
                now,
            )?;
            print_objective(&objective);
        }
        ObjectiveCommands::Pause { id } => print_objective(&scheduler.pause(&id, now)?),
        ObjectiveCommands::Resume { id } => print_objective(&scheduler.resume(&id, now)?),
        ObjectiveCommands::Delete { id } => {
            scheduler.delete(&id)?;
            println!("🗑️ Deleted {id}");
        }
    }
    Ok(())
}

fn print_objective(objective: &Objective) {
    let state = if objective.active { "🟢" } else { "⏸️" };
    let trigger = match &objective.trigger {
        TriggerType::Interval { every_secs } => format!("every {every_secs}s"),
        TriggerType::Cron { expression } => format!("cron '{expression}' ({})", objective.timezone),
        TriggerType::Once { at } => format!("once at {}", at.to_rfc3339()),
        TriggerType::Event { key } => format!("on {key}"),
    };
    println!("{state} {}  {}  [{trigger}]", objective.id, objective.title);
    println!(
        "     runs {} (✅ {} / ❌ {}), avg {}ms, next {}",
        objective.run_count,
        objective.success_count,
        objective.failure_count,
        objective.avg_run_duration_ms,
        objective
            .next_run_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".into())
    );
    if let Some(reason) = &objective.auto_paused_reason {
        println!("     {reason}");
    } else if let Some(error) = &objective.last_error {
        println!("     last error: {error}");
    }
}

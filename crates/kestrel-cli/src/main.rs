//! kestrel - headless harness for the agent core
//!
//! Runs a task against a replayed provider script with file-system tools,
//! console approvals and a JSONL task log.

mod config;
mod console;
mod replay;
mod store;
mod tools;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use kestrel_agent::{
    AgentEvent, AutonomyMode, LoopOutcome, RecoveryAnalysisService, Task, TaskParts,
};
use kestrel_ai::ApiStreamChunk;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::console::{ConsoleApproval, read_line};
use crate::replay::{ReplayProvider, ReplayRecovery, ReplayScript};
use crate::store::JsonlStore;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    TurnBased,
    StepLimited,
    Full,
}

impl From<ModeArg> for AutonomyMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::TurnBased => AutonomyMode::TurnBased,
            ModeArg::StepLimited => AutonomyMode::StepLimited,
            ModeArg::Full => AutonomyMode::Full,
        }
    }
}

/// kestrel - autonomous coding agent harness
#[derive(Parser, Debug)]
#[command(name = "kestrel")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run a single task non-interactively
    #[arg(short, long)]
    task: Option<String>,

    /// Replay script with the provider's responses (JSON)
    #[arg(short, long)]
    script: Option<PathBuf>,

    /// Autonomy mode
    #[arg(short, long, value_enum)]
    mode: Option<ModeArg>,

    /// Autonomous steps before asking, in step-limited mode
    #[arg(long)]
    max_steps: Option<u32>,

    /// Working directory the tools operate in
    #[arg(short, long)]
    working_dir: Option<String>,

    /// Approve every ask without prompting
    #[arg(short, long)]
    yes: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Resume a stored task by ID
    #[arg(long)]
    resume: Option<String>,

    /// List stored tasks
    #[arg(long)]
    tasks: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("kestrel=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    if args.init_config {
        let path = Settings::init().context("creating config file")?;
        println!("Config file at: {}", path.display());
        return Ok(());
    }

    let settings = Settings::load();
    let store = Arc::new(JsonlStore::new(settings.tasks_dir()));

    if args.tasks {
        return list_tasks(&store).await;
    }

    if let Some(ref dir) = args.working_dir {
        std::env::set_current_dir(dir).with_context(|| format!("changing directory to {}", dir))?;
    }
    let root = std::env::current_dir()?;

    let mut agent_config = settings.agent.clone();
    if let Some(mode) = args.mode {
        agent_config.autonomy.mode = mode.into();
    }
    if let Some(steps) = args.max_steps {
        agent_config.autonomy.max_autonomous_steps = steps;
    }
    agent_config.validate()?;

    let script_path = args
        .script
        .clone()
        .or_else(|| settings.script.as_ref().map(PathBuf::from))
        .with_context(|| {
            format!(
                "no replay script: pass --script or set `script` in {}",
                Settings::config_path().display()
            )
        })?;
    let script = ReplayScript::load(&script_path)
        .with_context(|| format!("loading replay script {}", script_path.display()))?;

    let recovery = if script.recovery.is_empty() {
        None
    } else {
        Some(Arc::new(ReplayRecovery::new(script.recovery)) as Arc<dyn RecoveryAnalysisService>)
    };
    let executor = Arc::new(tools::registry(&root, &agent_config.completion_tool));
    let parts = TaskParts {
        task_id: args.resume.clone(),
        config: agent_config,
        provider: Arc::new(ReplayProvider::new(script.model, script.responses)),
        executor,
        approval: Arc::new(ConsoleApproval::new(args.yes)),
        recovery,
        store: store.clone(),
    };
    let mut task = match args.resume {
        Some(_) => Task::resume(parts).await?,
        None => Task::new(parts)?,
    };

    let printer = tokio::spawn(print_events(task.subscribe()));
    let handle = task.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.abort();
        }
    });

    let interactive = args.task.is_none();
    let mut outcome = None;
    if task.history().is_empty() {
        let goal = match args.task {
            Some(goal) => goal,
            None => match read_line("task> ").await? {
                Some(goal) if !goal.trim().is_empty() => goal,
                _ => return Ok(()),
            },
        };
        outcome = Some(task.start(&goal, &[]).await?);
    } else {
        println!("Resumed task {} ({} messages)", task.task_id(), task.history().len());
    }

    loop {
        if let Some(ref o) = outcome {
            report(o);
            if matches!(o, LoopOutcome::Aborted { .. }) || !interactive {
                break;
            }
        }
        let Some(line) = read_line("\nyou> ").await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() || line == "exit" {
            break;
        }
        outcome = Some(task.send(line, &[]).await?);
    }

    let usage = task.total_usage();
    println!(
        "\n[Tokens: {} in, {} out | Cost: ${:.4}]",
        usage.input_tokens,
        usage.output_tokens,
        usage.total_cost.unwrap_or(0.0)
    );
    println!("Task {} stored in {}", task.task_id(), store.dir().display());
    printer.abort();
    Ok(())
}

fn report(outcome: &LoopOutcome) {
    match outcome {
        LoopOutcome::Completed => println!("\n[Task completed]"),
        LoopOutcome::TurnEnded | LoopOutcome::AwaitingUser { .. } => {}
        LoopOutcome::Failed { message } => eprintln!("\n[Request failed: {}]", message),
        LoopOutcome::Aborted { reason } => eprintln!("\n[Task aborted: {}]", reason),
    }
}

async fn print_events(mut receiver: broadcast::Receiver<AgentEvent>) {
    loop {
        let event = match receiver.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Event printer lagged by {} events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            AgentEvent::StreamChunk {
                chunk: ApiStreamChunk::Text { text },
            } => {
                print!("{}", text);
                let _ = std::io::stdout().flush();
            }
            AgentEvent::StreamChunk {
                chunk: ApiStreamChunk::Error { message },
            } => eprintln!("\n[Provider error: {}]", message),
            AgentEvent::ToolExecutionStart { tool_name, .. } => {
                println!("\n[Running {}...]", tool_name);
            }
            AgentEvent::ToolExecutionEnd {
                tool_name,
                result,
                is_error,
                ..
            } => {
                if is_error {
                    println!("[{} failed: {}]", tool_name, result);
                } else {
                    println!("[{}: {}]", tool_name, truncate_chars(&result, 200));
                }
            }
            AgentEvent::ToolSkipped {
                tool_name, reason, ..
            } => println!("[{} skipped: {}]", tool_name, reason),
            AgentEvent::ContextTruncated {
                range,
                outgoing_messages,
            } => println!(
                "[Context truncated: messages {}..={} elided, {} sent]",
                range.start, range.end, outgoing_messages
            ),
            AgentEvent::ApiRetried { reason } => println!("\n[Retrying: {}]", reason),
            AgentEvent::RecoveryStarted { attempt, .. } => {
                println!("\n[Recovery attempt {}]", attempt)
            }
            AgentEvent::Error { message } => eprintln!("Error: {}", message),
            _ => {}
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &s[..cut]),
        None => s.to_string(),
    }
}

async fn list_tasks(store: &JsonlStore) -> anyhow::Result<()> {
    let tasks = store.list_tasks().await?;
    if tasks.is_empty() {
        println!("No stored tasks found.");
        println!("Tasks are stored in: {}", store.dir().display());
        return Ok(());
    }

    println!("{:<38} {:<20} Msgs", "ID", "Modified");
    println!("{}", "-".repeat(66));
    for t in tasks {
        let modified = t
            .modified
            .map(|m| m.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!("{:<38} {:<20} {}", t.id, modified, t.message_count);
    }
    println!("\nResume with: kestrel --resume <task-id> --script <file>");
    Ok(())
}

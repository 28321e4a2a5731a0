use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use marshal::db::{DbHandle, MarshalDb};
use marshal::engine::ExecutionEngine;
use marshal::events::EventPipeline;
use marshal::models::{AgentMode, AgentProvider, JobPayload, OrchestrationMode};
use marshal::orchestrator::{CreateParentRun, Orchestrator, SubTask};
use marshal::queue::{InProcessQueue, QueueDispatcher};
use marshal::runner::ProcessRunner;
use marshal::sandbox::{self, PAYLOAD_ENV_VAR, ProcessSandboxLauncher, SandboxConfig};
use marshal::worker::{self, Worker};

#[derive(Parser)]
#[command(name = "marshal")]
#[command(version, about = "Dispatch and supervision for long-running AI agent runs")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, default_value = "marshal.db", global = true)]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a worker consuming every provider queue
    Worker {
        /// Path to the marshal.toml config file
        #[arg(long, default_value = "marshal.toml")]
        config: PathBuf,

        /// Agent command to run per session (payload arrives on stdin)
        #[arg(long, default_value = "claude")]
        agent_cmd: String,

        /// Context token budget before compaction fires
        #[arg(long, default_value = "100000")]
        max_context_tokens: u64,
    },
    /// Inspect runs
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
}

#[derive(Subcommand)]
enum RunCommands {
    /// Create a run, execute it with an in-process worker, and print the
    /// resulting run tree
    Submit {
        /// Prompt for the run
        prompt: String,

        #[arg(long, default_value = "claude")]
        provider: String,

        #[arg(long, default_value = "implement")]
        mode: String,

        #[arg(long, default_value = "1")]
        tenant: i64,

        #[arg(long, default_value = "1")]
        project: i64,

        /// Fan the run out into one child run per subtask prompt
        #[arg(long = "subtask")]
        subtasks: Vec<String>,

        /// Agent command to run per session (payload arrives on stdin)
        #[arg(long, default_value = "claude")]
        agent_cmd: String,

        /// Context token budget before compaction fires
        #[arg(long, default_value = "100000")]
        max_context_tokens: u64,
    },
    /// Show a run and its child runs
    Show { id: i64 },
    /// Replay the ordered event log for a run
    Events { id: i64 },
    /// List runs for a project, newest first
    List {
        #[arg(long, default_value = "1")]
        tenant: i64,
        project: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let db = DbHandle::new(MarshalDb::new(&cli.db)?);

    match cli.command {
        Commands::Worker {
            config,
            agent_cmd,
            max_context_tokens,
        } => run_worker(db, &cli.db, &config, &agent_cmd, max_context_tokens).await,
        Commands::Run { command } => match command {
            RunCommands::Submit {
                prompt,
                provider,
                mode,
                tenant,
                project,
                subtasks,
                agent_cmd,
                max_context_tokens,
            } => {
                let input = SubmitInput {
                    prompt,
                    provider: provider.parse().map_err(anyhow::Error::msg)?,
                    mode: mode.parse().map_err(anyhow::Error::msg)?,
                    tenant_id: tenant,
                    project_id: project,
                    subtasks,
                };
                submit_run(db, input, &agent_cmd, max_context_tokens).await
            }
            RunCommands::Show { id } => show_run(db, id).await,
            RunCommands::Events { id } => show_events(db, id).await,
            RunCommands::List { tenant, project } => list_runs(db, tenant, project).await,
        },
    }
}

async fn run_worker(
    db: DbHandle,
    db_path: &std::path::Path,
    config_path: &std::path::Path,
    agent_cmd: &str,
    max_context_tokens: u64,
) -> Result<()> {
    let pipeline = Arc::new(EventPipeline::new(db.clone(), 256));
    let runner = Arc::new(ProcessRunner::new(agent_cmd)?);

    // Sandboxed single-run mode: when launched by a sandbox launcher, the
    // payload is in the AGENT_JOB_PAYLOAD env var. The delegating worker
    // stops at the hand-off, so this process drives the payload to a
    // terminal status and runs the parent completion check before exiting.
    if let Ok(encoded) = std::env::var(PAYLOAD_ENV_VAR) {
        info!("running in sandboxed single-payload mode");
        let payload = sandbox::decode_payload(&encoded)?;
        let engine = ExecutionEngine::new(db.clone(), pipeline.clone(), runner, max_context_tokens);
        worker::run_sandboxed_payload(db, &pipeline, &engine, &payload).await?;
        return Ok(());
    }

    let sandbox_config = SandboxConfig::load(config_path)?;

    let mut dispatcher = QueueDispatcher::new();
    let mut receivers = Vec::new();
    for provider in AgentProvider::ALL {
        let (queue, receiver) = InProcessQueue::new();
        dispatcher = dispatcher.register(provider, queue);
        receivers.push((provider, receiver));
    }
    let dispatcher = Arc::new(dispatcher);
    let orchestrator = Arc::new(Orchestrator::new(db.clone(), dispatcher.clone()));

    let mut engine = ExecutionEngine::new(db.clone(), pipeline.clone(), runner, max_context_tokens);
    if sandbox_config.enabled {
        let launcher = ProcessSandboxLauncher::current_exe(vec![
            "worker".to_string(),
            "--db".to_string(),
            db_path.display().to_string(),
        ])?;
        engine = engine.with_launcher(Arc::new(launcher));
    }
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for (provider, receiver) in receivers {
        let worker = Worker::new(
            provider,
            receiver,
            engine.clone(),
            dispatcher.clone(),
            orchestrator.clone(),
            db.clone(),
            pipeline.clone(),
        );
        handles.push(tokio::spawn(worker.run()));
    }

    info!(workers = handles.len(), "marshal workers started");
    for handle in handles {
        handle.await.context("Worker task panicked")??;
    }
    Ok(())
}

struct SubmitInput {
    prompt: String,
    provider: AgentProvider,
    mode: AgentMode,
    tenant_id: i64,
    project_id: i64,
    subtasks: Vec<String>,
}

/// Create a run, drive it to a terminal status with an in-process worker,
/// and print the resulting run tree. With `--subtask` flags the run fans
/// out into child runs; without them the run itself is dispatched.
async fn submit_run(
    db: DbHandle,
    input: SubmitInput,
    agent_cmd: &str,
    max_context_tokens: u64,
) -> Result<()> {
    let pipeline = Arc::new(EventPipeline::new(db.clone(), 256));
    let runner = Arc::new(ProcessRunner::new(agent_cmd)?);
    let (queue, receiver) = InProcessQueue::new();
    let dispatcher = Arc::new(QueueDispatcher::new().register(input.provider, queue));
    let orchestrator = Arc::new(Orchestrator::new(db.clone(), dispatcher.clone()));
    let engine = Arc::new(ExecutionEngine::new(
        db.clone(),
        pipeline.clone(),
        runner,
        max_context_tokens,
    ));

    let worker = Worker::new(
        input.provider,
        receiver,
        engine,
        dispatcher.clone(),
        orchestrator.clone(),
        db.clone(),
        pipeline,
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(worker.run_until(async {
        let _ = shutdown_rx.await;
    }));

    let parent = orchestrator
        .create_parent_run(CreateParentRun {
            tenant_id: input.tenant_id,
            project_id: input.project_id,
            ticket_id: None,
            provider: input.provider,
            mode: input.mode,
            prompt: input.prompt.clone(),
            resolved_prompt: input.prompt.clone(),
            orchestration_mode: OrchestrationMode::Sequential,
        })
        .await?;

    if input.subtasks.is_empty() {
        dispatcher
            .dispatch(&JobPayload {
                run_id: parent.id,
                tenant_id: input.tenant_id,
                project_id: input.project_id,
                ticket_id: None,
                provider: input.provider,
                mode: input.mode,
                resolved_prompt: input.prompt.clone(),
                input_prompt: input.prompt,
                repo: None,
                repos: None,
                constraints: None,
                images: None,
                parent_run_id: None,
            })
            .await?;
    } else {
        let tasks = input
            .subtasks
            .into_iter()
            .map(|prompt| SubTask {
                resolved_prompt: prompt.clone(),
                prompt,
                repo: None,
            })
            .collect();
        orchestrator
            .fan_out_sub_runs(
                input.tenant_id,
                parent.id,
                input.provider,
                input.mode,
                input.project_id,
                tasks,
            )
            .await?;
    }

    let parent_id = parent.id;
    loop {
        let run = db
            .call(move |db| db.get_run(parent_id))
            .await?
            .with_context(|| format!("Run {} not found", parent_id))?;
        if run.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let _ = shutdown_tx.send(());
    handle.await.context("Worker task panicked")??;
    show_run(db, parent_id).await
}

async fn show_run(db: DbHandle, id: i64) -> Result<()> {
    let run = db
        .call(move |db| db.get_run(id))
        .await?
        .with_context(|| format!("Run {} not found", id))?;
    println!("{}", serde_json::to_string_pretty(&run)?);

    let children = db.call(move |db| db.list_child_runs(id)).await?;
    if !children.is_empty() {
        println!("{}", serde_json::to_string_pretty(&children)?);
    }
    let repos = db.call(move |db| db.list_run_repos(id)).await?;
    if !repos.is_empty() {
        println!("{}", serde_json::to_string_pretty(&repos)?);
    }
    Ok(())
}

async fn list_runs(db: DbHandle, tenant: i64, project: i64) -> Result<()> {
    let runs = db
        .call(move |db| db.list_project_runs(tenant, project))
        .await?;
    println!("{}", serde_json::to_string_pretty(&runs)?);
    Ok(())
}

async fn show_events(db: DbHandle, id: i64) -> Result<()> {
    for event in db.call(move |db| db.list_events(id)).await? {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

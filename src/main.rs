use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use workflow_engine::config::StorageBackend;
use workflow_engine::domain::types::{CheckpointId, DeadLetterId, IssueKey, RunId};
use workflow_engine::domain::WorkflowRun;
use workflow_engine::engine_paths::{self, WorkspaceLayout};
use workflow_engine::reliability::{
    EventJournal, EventPublisher, InProcessEventBus, OutboxRelay,
};
use workflow_engine::services::templates::load_template;
use workflow_engine::services::{CliAgentSessions, GitCli, LocalFileSystem, YamlTemplateReader};
use workflow_engine::store::{EngineStore, JsonFileStore, MemoryStore, OutboxStore};
use workflow_engine::{DriveOutcome, Engine, EngineConfig, EngineParts, PipelineDriver};

#[derive(Parser)]
#[command(name = "workflow-engine")]
#[command(about = "Runs staged coding-agent workflows with checkpoints and an event outbox")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("WORKFLOW_ENGINE_GIT_SHA"), ")"))]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Engine config (defaults to ~/.workflow-engine/config.yaml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a run from a template file and drive it until it stops
    Run {
        template: PathBuf,
        #[arg(long)]
        issue: String,
        /// Seed value for template placeholders, as key=value
        #[arg(long = "seed", value_parser = parse_seed)]
        seeds: Vec<(String, String)>,
    },
    /// Deliver pending outbox messages to the event journal
    Relay {
        /// Deliver one batch and exit
        #[arg(long)]
        once: bool,
    },
    /// List runs
    Runs,
    /// List the checkpoints of a run
    Checkpoints { run_id: RunId },
    /// List dead-lettered deliveries
    DeadLetters {
        #[arg(long)]
        all: bool,
    },
    /// Mark a dead-lettered delivery as handled
    ResolveDeadLetter { id: DeadLetterId },
    /// Rewind a paused run to a checkpoint
    Restore {
        run_id: RunId,
        checkpoint_id: CheckpointId,
    },
    Pause { run_id: RunId },
    /// Resume a run and drive it until it stops
    Resume {
        run_id: RunId,
        #[arg(long)]
        checkpoint: Option<CheckpointId>,
    },
    Cancel {
        run_id: RunId,
        #[arg(long, default_value = "cancelled from cli")]
        reason: String,
    },
    /// Delete a finished run and its workspace
    Delete { run_id: RunId },
}

fn parse_seed(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

struct Runtime {
    engine: Arc<Engine>,
    outbox: Arc<dyn OutboxStore>,
    config: EngineConfig,
}

impl Runtime {
    fn build(config: EngineConfig) -> Result<Self> {
        let (store, outbox): (Arc<dyn EngineStore>, Arc<dyn OutboxStore>) =
            match config.storage.backend {
                StorageBackend::Memory => {
                    let store = Arc::new(MemoryStore::new());
                    (store.clone(), store)
                }
                StorageBackend::JsonFile => {
                    let store = Arc::new(JsonFileStore::new(config.store_path()?));
                    (store.clone(), store)
                }
            };
        let engine = Arc::new(Engine::new(EngineParts {
            store,
            local_events: Arc::new(InProcessEventBus::new()),
            agents: Arc::new(CliAgentSessions::new(
                config.agent.command.clone(),
                config.agent.args.clone(),
            )),
            git: Arc::new(GitCli::new()),
            fs: Arc::new(LocalFileSystem::new()),
            templates: Arc::new(YamlTemplateReader::new(config.templates_dir()?)),
            layout: WorkspaceLayout::new(config.workspace_root()?),
        }));
        Ok(Self {
            engine,
            outbox,
            config,
        })
    }

    fn driver(&self) -> Arc<PipelineDriver> {
        Arc::new(PipelineDriver::new(
            self.engine.clone(),
            self.config.query_retry_policy(),
        ))
    }

    async fn drive(&self, run_id: RunId) -> Result<()> {
        match self.driver().drive(run_id).await {
            DriveOutcome::Finished { status } => {
                println!("{} {}", run_id, status);
                Ok(())
            }
            DriveOutcome::RunMissing => anyhow::bail!("run {} no longer exists", run_id),
            DriveOutcome::AlreadyActive => anyhow::bail!("run {} is already being driven", run_id),
            DriveOutcome::Errored => anyhow::bail!("run {} stopped on an error, see logs", run_id),
        }
    }

    fn relay(&self) -> Result<OutboxRelay> {
        let journal = EventJournal::open(&engine_paths::journal_dir()?)?;
        let publisher = InProcessEventBus::new();
        publisher.subscribe(Arc::new(journal));
        Ok(OutboxRelay::new(
            self.outbox.clone(),
            Arc::new(publisher),
            self.config.relay_config(),
        ))
    }
}

fn print_run(run: &WorkflowRun) {
    println!(
        "{}  {:<10} {}  {}  stage {}/{}",
        run.id(),
        run.status(),
        run.workflow_id(),
        run.issue_key(),
        run.current_work_index(),
        run.total_work_count()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load_or_default(cli.config.as_deref())?;
    let runtime = Runtime::build(config)?;
    let engine = &runtime.engine;

    match cli.command {
        Command::Run {
            template,
            issue,
            seeds,
        } => {
            let template = load_template(&template)?;
            let seeds: BTreeMap<String, String> = seeds.into_iter().collect();
            let run = engine
                .start_run_from_template(&template, IssueKey::from(issue), seeds)
                .await
                .context("Failed to start run")?;
            println!("started run {}", run.id());
            runtime.drive(run.id()).await?;
        }
        Command::Relay { once } => {
            let relay = runtime.relay()?;
            if once {
                let report = relay.relay_once().await?;
                println!(
                    "delivered {}, retried {}, dead-lettered {}",
                    report.delivered, report.retried, report.dead_lettered
                );
            } else {
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                let handle = Arc::new(relay).spawn(shutdown_rx);
                tokio::signal::ctrl_c()
                    .await
                    .context("Failed to listen for ctrl-c")?;
                let _ = shutdown_tx.send(true);
                handle.await.context("Relay task panicked")?;
            }
        }
        Command::Runs => {
            for run in engine.list_runs().await? {
                print_run(&run);
            }
        }
        Command::Checkpoints { run_id } => {
            for checkpoint in engine.list_checkpoints(run_id).await? {
                println!(
                    "{}  after stage {}  {} repos  {}",
                    checkpoint.id(),
                    checkpoint.work_sequence(),
                    checkpoint.commit_hashes().len(),
                    checkpoint.created_at()
                );
            }
        }
        Command::DeadLetters { all } => {
            for record in engine.list_dead_letters(all).await? {
                println!(
                    "{}  {}  {}  {}{}",
                    record.id,
                    record.event_type,
                    record.handler_name,
                    record.error_message,
                    if record.resolved { "  (resolved)" } else { "" }
                );
            }
        }
        Command::ResolveDeadLetter { id } => {
            let record = engine.resolve_dead_letter(id).await?;
            println!("resolved {} ({})", record.id, record.event_type);
        }
        Command::Restore {
            run_id,
            checkpoint_id,
        } => {
            let run = engine.restore_to_checkpoint(run_id, checkpoint_id).await?;
            print_run(&run);
        }
        Command::Pause { run_id } => print_run(&engine.pause_run(run_id).await?),
        Command::Resume { run_id, checkpoint } => {
            engine.resume_run(run_id, checkpoint).await?;
            runtime.drive(run_id).await?;
        }
        Command::Cancel { run_id, reason } => {
            print_run(&engine.cancel_run(run_id, &reason).await?);
        }
        Command::Delete { run_id } => {
            engine.delete_run(run_id).await?;
            println!("deleted run {}", run_id);
        }
    }
    Ok(())
}

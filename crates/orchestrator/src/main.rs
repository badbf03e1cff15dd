// devloop CLI
//
// Design Decision: Orchestrator runs in-process; test loops live as long as the command does.
// Design Decision: DATABASE_URL selects the PostgreSQL store, otherwise runs are kept in memory.
// Design Decision: --fake binds the scripted collaborators for local dry runs.

mod commands;
mod output;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use devloop_core::fakes::{FakePreviewDeployer, FakeSandbox, FakeSelfHealer, StaticSubjectDirectory};
use devloop_core::telemetry::{init_telemetry, TelemetryConfig};
use devloop_core::{
    workflow_types, ExecutionKind, OrchestratorConfig, PreviewDeployer, SandboxExecutor,
    SelfHealer, SubjectDirectory,
};
use devloop_durable::{InMemoryWorkflowStore, PostgresWorkflowStore, WorkflowStore};
use devloop_orchestrator::adapters::{
    HttpPreviewDeployer, HttpSandbox, HttpSelfHealer, HttpSubjectDirectory,
};
use devloop_orchestrator::WorkflowOrchestrator;

#[derive(Parser)]
#[command(name = "devloop")]
#[command(about = "devloop - Deploy, test and self-heal generated projects")]
#[command(version)]
pub struct Cli {
    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json", "yaml"])]
    pub output: String,

    /// Suppress non-essential output
    #[arg(long, short)]
    pub quiet: bool,

    /// Use in-process fake collaborators instead of the HTTP services
    #[arg(long)]
    pub fake: bool,

    /// Exit codes the fake sandbox returns for test runs, in order (last repeats)
    #[arg(long, value_delimiter = ',', default_value = "0")]
    pub fake_exit_codes: Vec<i32>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a workflow and run every step to the end
    Run {
        /// Subject ID
        #[arg(long, short)]
        subject: Uuid,

        /// Workflow type
        #[arg(long, short = 't', default_value = workflow_types::FULL_PIPELINE)]
        workflow_type: String,
    },

    /// Create a workflow execution without running it
    Start {
        /// Subject ID
        #[arg(long, short)]
        subject: Uuid,

        /// Workflow type
        #[arg(long, short = 't', default_value = workflow_types::FULL_PIPELINE)]
        workflow_type: String,
    },

    /// Execute one pending step
    Step {
        /// Workflow execution ID
        #[arg(long, short)]
        execution: Uuid,

        /// Step name
        step: String,
    },

    /// Show an execution, or the latest one for a subject
    Status {
        /// Subject ID
        #[arg(long, short)]
        subject: Option<Uuid>,

        /// Workflow execution ID
        #[arg(long, short)]
        execution: Option<Uuid>,
    },

    /// List executions, most recent first
    History {
        /// Only executions for this subject
        #[arg(long, short)]
        subject: Option<Uuid>,
    },

    /// Show the raw step event log of an execution
    Events {
        /// Workflow execution ID
        execution: Uuid,
    },

    /// Reset a failed step so it can run again
    Retry {
        /// Workflow execution ID
        #[arg(long, short)]
        execution: Uuid,

        /// Step name
        step: String,
    },

    /// Cancel a workflow and its test loops
    Cancel {
        /// Workflow execution ID
        execution: Uuid,
    },

    /// Autonomous test executions
    Tests {
        #[command(subcommand)]
        command: commands::loops::LoopsCommand,
    },

    /// Aggregate workflow and test loop statistics
    Metrics,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let _telemetry = init_telemetry(TelemetryConfig::from_env());
    let config = OrchestratorConfig::from_env();
    let output_format = output::OutputFormat::from_str(&cli.output);

    let orchestrator = build_orchestrator(&cli, config).await?;

    let result = match cli.command {
        Commands::Run {
            subject,
            workflow_type,
        } => {
            commands::workflows::run_pipeline(
                &orchestrator,
                output_format,
                cli.quiet,
                subject,
                &workflow_type,
            )
            .await
        }
        Commands::Start {
            subject,
            workflow_type,
        } => {
            commands::workflows::start(
                &orchestrator,
                output_format,
                cli.quiet,
                subject,
                &workflow_type,
            )
            .await
        }
        Commands::Step { execution, step } => {
            commands::workflows::step(&orchestrator, output_format, execution, &step).await
        }
        Commands::Status { subject, execution } => {
            commands::workflows::status(&orchestrator, output_format, subject, execution).await
        }
        Commands::History { subject } => {
            commands::workflows::history(&orchestrator, output_format, subject).await
        }
        Commands::Events { execution } => {
            commands::workflows::events(&orchestrator, output_format, execution).await
        }
        Commands::Retry { execution, step } => {
            commands::workflows::retry(&orchestrator, output_format, execution, &step).await
        }
        Commands::Cancel { execution } => {
            commands::workflows::cancel(&orchestrator, output_format, execution).await
        }
        Commands::Tests { command } => {
            commands::loops::run(command, &orchestrator, output_format).await
        }
        Commands::Metrics => commands::metrics::run(&orchestrator, output_format).await,
    };

    orchestrator.shutdown().await;
    result
}

async fn build_orchestrator(cli: &Cli, config: OrchestratorConfig) -> Result<WorkflowOrchestrator> {
    let store: Arc<dyn WorkflowStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresWorkflowStore::connect(url)
                .await
                .context("failed to connect to PostgreSQL")?;
            store.migrate().await.context("failed to run migrations")?;
            info!("using PostgreSQL workflow store");
            Arc::new(store)
        }
        None => {
            info!("DATABASE_URL not set, using in-memory workflow store");
            Arc::new(InMemoryWorkflowStore::new())
        }
    };

    let (deployer, sandbox, healer, directory): (
        Arc<dyn PreviewDeployer>,
        Arc<dyn SandboxExecutor>,
        Arc<dyn SelfHealer>,
        Arc<dyn SubjectDirectory>,
    ) = if cli.fake {
        info!(exit_codes = ?cli.fake_exit_codes, "using fake collaborators");
        (
            Arc::new(FakePreviewDeployer::new()),
            Arc::new(
                FakeSandbox::new().with_exit_codes(ExecutionKind::Test, cli.fake_exit_codes.clone()),
            ),
            Arc::new(FakeSelfHealer::new()),
            Arc::new(StaticSubjectDirectory::owned_by("local")),
        )
    } else {
        (
            Arc::new(HttpPreviewDeployer::new(&config.preview_service_url)),
            Arc::new(HttpSandbox::new(&config.sandbox_service_url)),
            Arc::new(HttpSelfHealer::new(&config.healing_service_url)),
            Arc::new(HttpSubjectDirectory::new(&config.subject_service_url)),
        )
    };

    let orchestrator = WorkflowOrchestrator::builder(store, deployer, sandbox, healer, directory)
        .with_config(config)
        .build()?;
    Ok(orchestrator)
}

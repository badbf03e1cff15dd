// Autonomous test execution commands

use std::time::Duration;

use anyhow::Result;
use clap::Subcommand;
use uuid::Uuid;

use devloop_orchestrator::WorkflowOrchestrator;

use crate::output::{print_test_execution, print_test_execution_table, OutputFormat};

#[derive(Subcommand)]
pub enum LoopsCommand {
    /// Run a test loop against an existing preview deployment
    Start {
        /// Subject ID
        #[arg(long, short)]
        subject: Uuid,

        /// Preview deployment under test
        #[arg(long, short)]
        preview: Uuid,

        /// Iteration bound (defaults to MAX_TEST_ITERATIONS)
        #[arg(long)]
        max_iterations: Option<u32>,
    },

    /// Latest test execution for a subject
    Latest {
        /// Subject ID
        #[arg(long, short)]
        subject: Uuid,
    },

    /// All test executions for a subject
    History {
        /// Subject ID
        #[arg(long, short)]
        subject: Uuid,
    },

    /// Get a test execution by ID
    Get {
        /// Test execution ID
        id: Uuid,
    },

    /// Cancel a running test execution
    Cancel {
        /// Test execution ID
        id: Uuid,
    },
}

pub async fn run(
    command: LoopsCommand,
    orchestrator: &WorkflowOrchestrator,
    output: OutputFormat,
) -> Result<()> {
    match command {
        LoopsCommand::Start {
            subject,
            preview,
            max_iterations,
        } => {
            let max_iterations =
                max_iterations.unwrap_or(orchestrator.config().max_test_iterations);
            let launched = orchestrator
                .start_test_loop(subject, preview, max_iterations)
                .await?;
            let record = wait_for_loop(orchestrator, launched.id).await?;
            show(output, &record)
        }
        LoopsCommand::Latest { subject } => {
            match orchestrator.get_latest_test_execution(subject).await? {
                Some(record) => show(output, &record),
                None if output.is_text() => {
                    println!("No test executions found");
                    Ok(())
                }
                None => output.print_value(&serde_json::Value::Null),
            }
        }
        LoopsCommand::History { subject } => {
            let records = orchestrator.get_test_execution_history(subject).await?;
            if output.is_text() {
                print_test_execution_table(&records);
                Ok(())
            } else {
                output.print_value(&records)
            }
        }
        LoopsCommand::Get { id } => {
            let record = orchestrator.get_test_execution(id).await?;
            show(output, &record)
        }
        LoopsCommand::Cancel { id } => {
            let record = orchestrator.cancel_test_execution(id).await?;
            show(output, &record)
        }
    }
}

fn show(output: OutputFormat, record: &devloop_core::AutonomousTestExecution) -> Result<()> {
    if output.is_text() {
        print_test_execution(record);
        Ok(())
    } else {
        output.print_value(record)
    }
}

async fn wait_for_loop(
    orchestrator: &WorkflowOrchestrator,
    id: Uuid,
) -> Result<devloop_core::AutonomousTestExecution> {
    loop {
        let record = orchestrator.get_test_execution(id).await?;
        if record.is_terminal() {
            return Ok(record);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

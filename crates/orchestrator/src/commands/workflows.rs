// Workflow commands

use anyhow::{Context, Result};
use uuid::Uuid;

use devloop_core::WorkflowStatus;
use devloop_orchestrator::WorkflowOrchestrator;

use crate::output::{print_execution, print_execution_table, print_field, OutputFormat};

/// Start a workflow and drive every step to the end
pub async fn run_pipeline(
    orchestrator: &WorkflowOrchestrator,
    output: OutputFormat,
    quiet: bool,
    subject_id: Uuid,
    workflow_type: &str,
) -> Result<()> {
    let execution = orchestrator
        .run_pipeline(subject_id, workflow_type)
        .await
        .with_context(|| format!("pipeline for subject {} failed", subject_id))?;

    if output.is_text() {
        if quiet {
            println!("{}", execution.status);
        } else {
            print_execution(&execution);
        }
    } else {
        output.print_value(&execution)?;
    }

    if execution.status != WorkflowStatus::Completed {
        anyhow::bail!("workflow {} ended {}", execution.id, execution.status);
    }
    Ok(())
}

pub async fn start(
    orchestrator: &WorkflowOrchestrator,
    output: OutputFormat,
    quiet: bool,
    subject_id: Uuid,
    workflow_type: &str,
) -> Result<()> {
    let execution = orchestrator.start_workflow(subject_id, workflow_type).await?;

    if output.is_text() {
        if quiet {
            println!("{}", execution.id);
        } else {
            println!("Started workflow: {}", execution.id);
            print_field("Type", &execution.workflow_type);
            print_field("Steps", &execution.step_names().join(", "));
        }
    } else {
        output.print_value(&execution)?;
    }
    Ok(())
}

/// Execute one step; launched steps are awaited since their loop lives in
/// this process
pub async fn step(
    orchestrator: &WorkflowOrchestrator,
    output: OutputFormat,
    execution_id: Uuid,
    step: &str,
) -> Result<()> {
    let mut execution = orchestrator.execute_step(execution_id, step).await?;
    if execution.step(step).map(|s| s.status.is_terminal()) == Some(false) {
        execution = orchestrator.wait_for_step(execution_id, step).await?;
    }

    if output.is_text() {
        print_execution(&execution);
    } else {
        output.print_value(&execution)?;
    }
    Ok(())
}

pub async fn status(
    orchestrator: &WorkflowOrchestrator,
    output: OutputFormat,
    subject_id: Option<Uuid>,
    execution_id: Option<Uuid>,
) -> Result<()> {
    let execution = match (execution_id, subject_id) {
        (Some(id), _) => Some(orchestrator.get_execution(id).await?),
        (None, Some(subject)) => orchestrator.get_latest_execution(subject).await?,
        (None, None) => anyhow::bail!("either --execution or --subject is required"),
    };

    match execution {
        Some(execution) if output.is_text() => print_execution(&execution),
        Some(execution) => output.print_value(&execution)?,
        None if output.is_text() => println!("No workflow executions found"),
        None => output.print_value(&serde_json::Value::Null)?,
    }
    Ok(())
}

pub async fn history(
    orchestrator: &WorkflowOrchestrator,
    output: OutputFormat,
    subject_id: Option<Uuid>,
) -> Result<()> {
    let executions = match subject_id {
        Some(subject) => orchestrator.get_execution_history(subject).await?,
        None => orchestrator.list_workflows(None).await?,
    };

    if output.is_text() {
        print_execution_table(&executions);
    } else {
        output.print_value(&executions)?;
    }
    Ok(())
}

pub async fn events(
    orchestrator: &WorkflowOrchestrator,
    output: OutputFormat,
    execution_id: Uuid,
) -> Result<()> {
    let events = orchestrator.step_events(execution_id).await?;

    if output.is_text() {
        for recorded in &events {
            let event = &recorded.event;
            println!(
                "{:>4}  {}  {:<26} {:<10} {}",
                recorded.sequence,
                event.at.to_rfc3339(),
                event.name,
                event.status.as_str(),
                event.error.as_deref().unwrap_or("")
            );
        }
    } else {
        output.print_value(&events)?;
    }
    Ok(())
}

pub async fn retry(
    orchestrator: &WorkflowOrchestrator,
    output: OutputFormat,
    execution_id: Uuid,
    step: &str,
) -> Result<()> {
    let execution = orchestrator.retry_step(execution_id, step).await?;

    if output.is_text() {
        println!("Reset step {} (retry {})", step, execution.retry_count);
    } else {
        output.print_value(&execution)?;
    }
    Ok(())
}

pub async fn cancel(
    orchestrator: &WorkflowOrchestrator,
    output: OutputFormat,
    execution_id: Uuid,
) -> Result<()> {
    let execution = orchestrator.cancel_workflow(execution_id).await?;

    if output.is_text() {
        println!("Cancelled workflow: {}", execution.id);
    } else {
        output.print_value(&execution)?;
    }
    Ok(())
}

// Output formatting for the CLI

use anyhow::Result;
use serde::Serialize;

use devloop_core::{AutonomousTestExecution, WorkflowExecution};

#[derive(Clone, Copy)]
pub enum OutputFormat {
    Text,
    Json,
    Yaml,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Self {
        match s {
            "json" => OutputFormat::Json,
            "yaml" => OutputFormat::Yaml,
            _ => OutputFormat::Text,
        }
    }

    pub fn print_value<T: Serialize>(&self, value: &T) -> Result<()> {
        match self {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(value)?);
            }
            OutputFormat::Yaml => {
                println!("{}", serde_yaml::to_string(value)?);
            }
            OutputFormat::Text => {
                // Text format is handled by each command
            }
        }
        Ok(())
    }

    pub fn is_text(&self) -> bool {
        matches!(self, OutputFormat::Text)
    }
}

/// Print a simple key-value pair for text output
pub fn print_field(label: &str, value: &str) {
    println!("{:<16} {}", format!("{}:", label), value);
}

/// Print a table header
pub fn print_table_header(columns: &[(&str, usize)]) {
    let header: String = columns
        .iter()
        .map(|(name, width)| format!("{:<width$}", name, width = width))
        .collect::<Vec<_>>()
        .join("  ");
    println!("{}", header);
}

/// Print a table row
pub fn print_table_row(values: &[(&str, usize)]) {
    let row: String = values
        .iter()
        .map(|(val, width)| {
            let s = if val.chars().count() > *width {
                let kept: String = val.chars().take(width.saturating_sub(3)).collect();
                format!("{}...", kept)
            } else {
                val.to_string()
            };
            format!("{:<width$}", s, width = width)
        })
        .collect::<Vec<_>>()
        .join("  ");
    println!("{}", row);
}

fn optional<T: ToString>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string())
}

/// Detailed view of one workflow execution
pub fn print_execution(execution: &WorkflowExecution) {
    print_field("Execution", &execution.id.to_string());
    print_field("Subject", &execution.subject_id.to_string());
    print_field("Workflow type", &execution.workflow_type);
    print_field("Status", execution.status.as_str());
    print_field("Retries", &execution.retry_count.to_string());
    print_field("Preview", &optional(&execution.preview_deployment_id));
    print_field("Created", &execution.created_at.to_rfc3339());
    print_field("Completed", &optional(&execution.completed_at.map(|t| t.to_rfc3339())));
    println!();

    print_table_header(&[("STEP", 26), ("STATUS", 10), ("STARTED", 25), ("ERROR", 40)]);
    for step in &execution.steps {
        let started = optional(&step.started_at.map(|t| t.to_rfc3339()));
        let error = step.error.clone().unwrap_or_default();
        print_table_row(&[
            (&step.name, 26),
            (step.status.as_str(), 10),
            (&started, 25),
            (&error, 40),
        ]);
    }
}

/// One-line-per-execution table
pub fn print_execution_table(executions: &[WorkflowExecution]) {
    if executions.is_empty() {
        println!("No workflow executions found");
        return;
    }

    print_table_header(&[("ID", 36), ("TYPE", 14), ("STATUS", 10), ("CREATED", 25)]);
    for execution in executions {
        let id = execution.id.to_string();
        let created = execution.created_at.to_rfc3339();
        print_table_row(&[
            (&id, 36),
            (&execution.workflow_type, 14),
            (execution.status.as_str(), 10),
            (&created, 25),
        ]);
    }
}

/// Detailed view of one autonomous test execution
pub fn print_test_execution(record: &AutonomousTestExecution) {
    print_field("Test execution", &record.id.to_string());
    print_field("Subject", &record.subject_id.to_string());
    print_field("Workflow", &optional(&record.workflow_execution_id));
    print_field("Preview", &record.preview_deployment_id.to_string());
    print_field("Status", record.status.as_str());
    print_field(
        "Iteration",
        &format!("{}/{}", record.current_iteration, record.max_iterations),
    );
    print_field("Tests passed", &record.tests_passed.to_string());
    print_field("Result", &optional(&record.final_test_result));
    if let Some(error) = &record.error {
        print_field("Error", error);
    }
    print_field("Duration", &format!("{}ms", record.total_duration_ms));
}

pub fn print_test_execution_table(records: &[AutonomousTestExecution]) {
    if records.is_empty() {
        println!("No test executions found");
        return;
    }

    print_table_header(&[("ID", 36), ("STATUS", 10), ("ITER", 6), ("RESULT", 40)]);
    for record in records {
        let id = record.id.to_string();
        let iterations = format!("{}/{}", record.current_iteration, record.max_iterations);
        let result = record.final_test_result.clone().unwrap_or_default();
        print_table_row(&[
            (&id, 36),
            (record.status.as_str(), 10),
            (&iterations, 6),
            (&result, 40),
        ]);
    }
}

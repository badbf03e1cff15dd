// Metrics command

use anyhow::Result;
use serde::Serialize;

use devloop_orchestrator::{TestLoopStats, WorkflowMetrics, WorkflowOrchestrator};

use crate::output::{print_field, print_table_header, print_table_row, OutputFormat};

#[derive(Serialize)]
struct MetricsReport {
    workflows: WorkflowMetrics,
    test_loops: TestLoopStats,
}

pub async fn run(orchestrator: &WorkflowOrchestrator, output: OutputFormat) -> Result<()> {
    let report = MetricsReport {
        workflows: orchestrator.metrics().await?,
        test_loops: orchestrator.test_stats().await?,
    };

    if !output.is_text() {
        return output.print_value(&report);
    }

    let w = &report.workflows;
    println!("Workflows");
    print_field("Total", &w.total.to_string());
    print_field("Completed", &w.completed.to_string());
    print_field("Failed", &w.failed.to_string());
    print_field("Running", &w.running.to_string());
    print_field("Cancelled", &w.cancelled.to_string());
    print_field("Success rate", &format!("{:.1}%", w.success_rate));
    print_field("Avg duration", &format!("{:.1}s", w.average_duration_secs));

    if !w.step_failure_rates.is_empty() {
        println!();
        print_table_header(&[("STEP", 26), ("FAILURES", 8), ("RATE", 8)]);
        for rate in &w.step_failure_rates {
            let failures = rate.failure_count.to_string();
            let pct = format!("{:.1}%", rate.failure_rate);
            print_table_row(&[(&rate.step, 26), (&failures, 8), (&pct, 8)]);
        }
    }

    let t = &report.test_loops;
    println!();
    println!("Test loops");
    print_field("Total", &t.total.to_string());
    print_field("Passed", &t.completed.to_string());
    print_field("Failed", &t.failed.to_string());
    print_field("Cancelled", &t.cancelled.to_string());
    print_field("Pass rate", &format!("{:.1}%", t.pass_rate));
    print_field("Avg iterations", &format!("{:.2}", t.average_iterations));
    print_field("Avg duration", &format!("{:.0}ms", t.average_duration_ms));
    Ok(())
}

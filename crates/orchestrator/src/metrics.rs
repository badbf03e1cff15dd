// Aggregate statistics over persisted executions

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use devloop_core::{
    AutonomousTestExecution, StepStatus, TestLoopStatus, WorkflowExecution, WorkflowStatus,
};

/// Failure counts for one step name across executions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailureRate {
    pub step: String,
    pub executions: usize,
    pub failure_count: usize,
    /// Percentage of executions where this step failed
    pub failure_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub running: usize,
    pub cancelled: usize,
    /// Completed executions as a percentage of all executions
    pub success_rate: f64,
    /// Mean wall-clock duration of finished executions, in seconds
    pub average_duration_secs: f64,
    /// Most failing steps first
    pub step_failure_rates: Vec<StepFailureRate>,
}

impl WorkflowMetrics {
    pub fn from_executions(executions: &[WorkflowExecution]) -> Self {
        let count = |status: WorkflowStatus| executions.iter().filter(|e| e.status == status).count();
        let total = executions.len();
        let completed = count(WorkflowStatus::Completed);

        let durations: Vec<f64> = executions
            .iter()
            .filter_map(|e| e.duration())
            .map(|d| d.num_milliseconds() as f64 / 1000.0)
            .collect();

        let mut per_step: HashMap<&str, (usize, usize)> = HashMap::new();
        for step in executions.iter().flat_map(|e| e.steps.iter()) {
            let entry = per_step.entry(step.name.as_str()).or_default();
            entry.0 += 1;
            if step.status == StepStatus::Failed {
                entry.1 += 1;
            }
        }
        let mut step_failure_rates: Vec<StepFailureRate> = per_step
            .into_iter()
            .map(|(step, (runs, failures))| StepFailureRate {
                step: step.to_string(),
                executions: runs,
                failure_count: failures,
                failure_rate: percentage(failures, runs),
            })
            .collect();
        step_failure_rates.sort_by(|a, b| {
            b.failure_count
                .cmp(&a.failure_count)
                .then_with(|| a.step.cmp(&b.step))
        });

        Self {
            total,
            completed,
            failed: count(WorkflowStatus::Failed),
            running: count(WorkflowStatus::Running),
            cancelled: count(WorkflowStatus::Cancelled),
            success_rate: percentage(completed, total),
            average_duration_secs: mean(&durations),
            step_failure_rates,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestLoopStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub running: usize,
    /// Runs that ended with passing tests, as a percentage of all runs
    pub pass_rate: f64,
    pub average_iterations: f64,
    pub average_duration_ms: f64,
}

impl TestLoopStats {
    pub fn from_executions(executions: &[AutonomousTestExecution]) -> Self {
        let count = |status: TestLoopStatus| executions.iter().filter(|e| e.status == status).count();
        let total = executions.len();
        let completed = count(TestLoopStatus::Completed);

        let iterations: Vec<f64> = executions.iter().map(|e| e.current_iteration as f64).collect();
        let durations: Vec<f64> = executions.iter().map(|e| e.total_duration_ms as f64).collect();

        Self {
            total,
            completed,
            failed: count(TestLoopStatus::Failed),
            cancelled: count(TestLoopStatus::Cancelled),
            running: count(TestLoopStatus::Running),
            pass_rate: percentage(completed, total),
            average_iterations: mean(&iterations),
            average_duration_ms: mean(&durations),
        }
    }
}

fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use devloop_core::{fold_steps, StepEvent};
    use uuid::Uuid;

    fn execution(status: WorkflowStatus, events: &[StepEvent]) -> WorkflowExecution {
        let names = vec!["preview_deployment".to_string(), "autonomous_testing_loop".to_string()];
        let mut execution = WorkflowExecution::new(Uuid::now_v7(), "full-pipeline", &names);
        execution.steps = fold_steps(&names, events);
        execution.status = status;
        if status.is_terminal() {
            execution.completed_at = Some(execution.created_at + Duration::seconds(10));
        }
        execution
    }

    #[test]
    fn test_empty_metrics_are_zero() {
        let metrics = WorkflowMetrics::from_executions(&[]);
        assert_eq!(metrics.total, 0);
        assert_eq!(metrics.success_rate, 0.0);
        assert_eq!(metrics.average_duration_secs, 0.0);
        assert!(metrics.step_failure_rates.is_empty());

        let stats = TestLoopStats::from_executions(&[]);
        assert_eq!(stats.pass_rate, 0.0);
    }

    #[test]
    fn test_workflow_metrics() {
        let executions = vec![
            execution(
                WorkflowStatus::Completed,
                &[
                    StepEvent::completed("preview_deployment"),
                    StepEvent::completed("autonomous_testing_loop"),
                ],
            ),
            execution(
                WorkflowStatus::Failed,
                &[StepEvent::failed("preview_deployment", "Deployment failed")],
            ),
            execution(
                WorkflowStatus::Failed,
                &[
                    StepEvent::completed("preview_deployment"),
                    StepEvent::failed("autonomous_testing_loop", "tests failed after 3 iterations"),
                ],
            ),
            execution(WorkflowStatus::Running, &[StepEvent::started("preview_deployment")]),
        ];

        let metrics = WorkflowMetrics::from_executions(&executions);
        assert_eq!(metrics.total, 4);
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.failed, 2);
        assert_eq!(metrics.running, 1);
        assert_eq!(metrics.success_rate, 25.0);
        assert_eq!(metrics.average_duration_secs, 10.0);

        assert_eq!(metrics.step_failure_rates.len(), 2);
        // Ties break on step name
        let first = &metrics.step_failure_rates[0];
        assert_eq!(first.step, "autonomous_testing_loop");
        assert_eq!(first.failure_count, 1);
        assert_eq!(first.executions, 4);
        assert_eq!(first.failure_rate, 25.0);
    }

    #[test]
    fn test_loop_stats() {
        let mut passed = AutonomousTestExecution::new(Uuid::now_v7(), "o", Uuid::now_v7(), 3);
        passed.current_iteration = 1;
        passed.finish(TestLoopStatus::Completed, "passed on iteration 1");
        passed.total_duration_ms = 1000;

        let mut failed = AutonomousTestExecution::new(Uuid::now_v7(), "o", Uuid::now_v7(), 3);
        failed.current_iteration = 3;
        failed.finish(TestLoopStatus::Failed, "tests failed after 3 iterations");
        failed.total_duration_ms = 3000;

        let stats = TestLoopStats::from_executions(&[passed, failed]);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pass_rate, 50.0);
        assert_eq!(stats.average_iterations, 2.0);
        assert_eq!(stats.average_duration_ms, 2000.0);
    }
}

//! Autonomous test execution record
//!
//! One record per run of the autonomous testing loop. The loop task is the
//! only writer; callers observe it by polling the store.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a test loop run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestLoopStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TestLoopStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TestLoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestLoopStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("invalid test loop status: {}", other)),
        }
    }
}

/// Persisted state of one autonomous testing loop run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutonomousTestExecution {
    pub id: Uuid,
    pub subject_id: Uuid,

    /// Owner passed to every redeploy
    pub owner_id: String,

    /// Workflow execution whose testing step launched this loop, if any
    pub workflow_execution_id: Option<Uuid>,

    /// Deployment currently under test (updated after each redeploy)
    pub preview_deployment_id: Uuid,

    pub max_iterations: u32,

    /// Starts at 0, incremented before each sandbox run
    pub current_iteration: u32,

    pub status: TestLoopStatus,
    pub tests_passed: bool,

    /// Human-readable summary written when the loop ends
    pub final_test_result: Option<String>,

    /// Infrastructure failure that aborted the loop
    pub error: Option<String>,

    pub total_duration_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AutonomousTestExecution {
    pub fn new(
        subject_id: Uuid,
        owner_id: impl Into<String>,
        preview_deployment_id: Uuid,
        max_iterations: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            subject_id,
            owner_id: owner_id.into(),
            workflow_execution_id: None,
            preview_deployment_id,
            max_iterations,
            current_iteration: 0,
            status: TestLoopStatus::Running,
            tests_passed: false,
            final_test_result: None,
            error: None,
            total_duration_ms: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Link this run to the workflow execution that launched it
    pub fn for_workflow(mut self, workflow_execution_id: Uuid) -> Self {
        self.workflow_execution_id = Some(workflow_execution_id);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to a terminal state. Has no effect once terminal.
    pub fn finish(&mut self, status: TestLoopStatus, summary: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        let now = Utc::now();
        self.status = status;
        self.tests_passed = status == TestLoopStatus::Completed;
        self.final_test_result = Some(summary.into());
        self.completed_at = Some(now);
        self.updated_at = now;
        self.total_duration_ms = (now - self.created_at).num_milliseconds().max(0) as u64;
    }
}

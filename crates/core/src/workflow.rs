//! Workflow execution model
//!
//! A [`WorkflowExecution`] owns an ordered list of [`WorkflowStep`]s fixed at
//! creation time from a step template. Steps are never stored directly: every
//! transition is an append-only [`StepEvent`] and the current step list is the
//! fold of those events over the template names (see [`fold_steps`]).

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a whole workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Steps are still being executed
    Running,

    /// Every step completed
    Completed,

    /// A step failed; no further steps run
    Failed,

    /// Cancelled by an operator
    Cancelled,
}

impl WorkflowStatus {
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

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("invalid workflow status: {}", other)),
        }
    }
}

/// Status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("invalid step status: {}", other)),
        }
    }
}

/// A single named unit of work inside an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl WorkflowStep {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Apply one persisted transition to this step
    pub fn apply(&mut self, event: &StepEvent) {
        match event.status {
            // Reset by a retry
            StepStatus::Pending => {
                self.started_at = None;
                self.completed_at = None;
                self.error = None;
            }
            StepStatus::Running => {
                self.started_at = Some(event.at);
                self.completed_at = None;
                self.error = None;
            }
            StepStatus::Completed | StepStatus::Cancelled => {
                self.completed_at = Some(event.at);
            }
            StepStatus::Failed => {
                self.completed_at = Some(event.at);
                self.error = event.error.clone();
            }
        }
        self.status = event.status;
    }
}

/// One step transition in the execution's append-only log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEvent {
    /// Step name (must be one of the execution's template steps)
    pub name: String,

    /// Status the step moved to
    pub status: StepStatus,

    /// When the transition happened
    pub at: DateTime<Utc>,

    /// Failure message, only for `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepEvent {
    pub fn new(name: impl Into<String>, status: StepStatus) -> Self {
        Self {
            name: name.into(),
            status,
            at: Utc::now(),
            error: None,
        }
    }

    pub fn started(name: impl Into<String>) -> Self {
        Self::new(name, StepStatus::Running)
    }

    pub fn completed(name: impl Into<String>) -> Self {
        Self::new(name, StepStatus::Completed)
    }

    pub fn failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(name, StepStatus::Failed)
        }
    }

    pub fn cancelled(name: impl Into<String>) -> Self {
        Self::new(name, StepStatus::Cancelled)
    }

    pub fn reset(name: impl Into<String>) -> Self {
        Self::new(name, StepStatus::Pending)
    }
}

/// Rebuild the current step list from the template names and the event log
///
/// Order always follows `names`; events naming an unknown step are ignored.
pub fn fold_steps(names: &[String], events: &[StepEvent]) -> Vec<WorkflowStep> {
    let mut steps: Vec<WorkflowStep> = names.iter().map(WorkflowStep::pending).collect();
    for event in events {
        if let Some(step) = steps.iter_mut().find(|s| s.name == event.name) {
            step.apply(event);
        }
    }
    steps
}

/// One orchestration run for a subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,

    /// Identifier of the generated project this run drives
    pub subject_id: Uuid,

    /// Key into the step template registry
    pub workflow_type: String,

    pub status: WorkflowStatus,

    /// Ordered steps, fixed at creation from the template
    pub steps: Vec<WorkflowStep>,

    /// Number of manual step retries
    pub retry_count: u32,

    /// Deployment produced by the preview step, consumed by the testing step
    pub preview_deployment_id: Option<Uuid>,

    /// Number of step events persisted so far (optimistic concurrency token)
    pub sequence: i32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    /// Create a fresh running execution with every step pending
    pub fn new(subject_id: Uuid, workflow_type: impl Into<String>, step_names: &[String]) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            subject_id,
            workflow_type: workflow_type.into(),
            status: WorkflowStatus::Running,
            steps: step_names.iter().map(WorkflowStep::pending).collect(),
            retry_count: 0,
            preview_deployment_id: None,
            sequence: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn step(&self, name: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name.clone()).collect()
    }

    pub fn is_last_step(&self, name: &str) -> bool {
        self.steps.last().map(|s| s.name == name).unwrap_or(false)
    }

    pub fn all_steps_completed(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Completed)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock duration for finished executions
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|done| done - self.created_at)
    }
}

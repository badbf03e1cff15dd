//! WorkflowStore trait definition

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use devloop_core::{AutonomousTestExecution, StepEvent, WorkflowExecution, WorkflowStatus};

/// Maximum rows returned by list queries
pub const LIST_LIMIT: usize = 100;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow execution not found
    #[error("workflow execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Autonomous test execution not found
    #[error("test execution not found: {0}")]
    TestExecutionNotFound(Uuid),

    /// Test execution already reached a terminal status
    #[error("test execution {0} is already terminal")]
    TestExecutionTerminal(Uuid),

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict { expected: i32, actual: i32 },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::ConcurrencyConflict { .. })
    }
}

/// A step event together with its position in the execution's log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedStepEvent {
    pub sequence: i32,
    #[serde(flatten)]
    pub event: StepEvent,
}

/// Filter for listing workflow executions
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub subject_id: Option<Uuid>,
    pub status: Option<WorkflowStatus>,
}

impl ExecutionFilter {
    pub fn for_subject(subject_id: Uuid) -> Self {
        Self {
            subject_id: Some(subject_id),
            status: None,
        }
    }

    pub fn with_status(mut self, status: WorkflowStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, execution: &WorkflowExecution) -> bool {
        self.subject_id.map_or(true, |s| s == execution.subject_id)
            && self.status.map_or(true, |s| s == execution.status)
    }
}

/// Durable storage for workflow executions and autonomous test executions
///
/// Step state is never written directly. [`WorkflowStore::commit`] appends
/// step events and rewrites the execution header in one atomic operation,
/// guarded by the sequence the caller last observed.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    // =========================================================================
    // Workflow executions
    // =========================================================================

    /// Persist a freshly created execution. Its step names become the fold base.
    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError>;

    /// Load an execution with its steps folded from the event log
    async fn load_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution, StoreError>;

    /// Append `events` and update the header fields (status, retry count,
    /// preview deployment, timestamps) from `execution`
    ///
    /// `execution.sequence` must equal the number of events already stored,
    /// otherwise [`StoreError::ConcurrencyConflict`] is returned and nothing
    /// is written. Returns the new sequence.
    async fn commit(
        &self,
        execution: &WorkflowExecution,
        events: &[StepEvent],
    ) -> Result<i32, StoreError>;

    /// Raw step event log, oldest first
    async fn load_step_events(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<RecordedStepEvent>, StoreError>;

    /// Most recently created execution for a subject
    async fn latest_execution(
        &self,
        subject_id: Uuid,
    ) -> Result<Option<WorkflowExecution>, StoreError>;

    /// All executions for a subject, most recent first
    async fn execution_history(
        &self,
        subject_id: Uuid,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;

    /// Executions matching `filter`, most recent first, at most `limit`
    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;

    // =========================================================================
    // Autonomous test executions
    // =========================================================================

    async fn create_test_execution(
        &self,
        execution: &AutonomousTestExecution,
    ) -> Result<(), StoreError>;

    /// Overwrite a test execution
    ///
    /// Fails with [`StoreError::TestExecutionTerminal`] if the stored record
    /// is already terminal, so a finished run is never reopened.
    async fn update_test_execution(
        &self,
        execution: &AutonomousTestExecution,
    ) -> Result<(), StoreError>;

    async fn get_test_execution(&self, id: Uuid) -> Result<AutonomousTestExecution, StoreError>;

    async fn latest_test_execution(
        &self,
        subject_id: Uuid,
    ) -> Result<Option<AutonomousTestExecution>, StoreError>;

    /// All test executions for a subject, most recent first
    async fn test_execution_history(
        &self,
        subject_id: Uuid,
    ) -> Result<Vec<AutonomousTestExecution>, StoreError>;

    /// Test executions launched by a workflow execution, most recent first
    async fn test_executions_for_workflow(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<AutonomousTestExecution>, StoreError>;

    /// All test executions, most recent first, at most `limit`
    async fn list_test_executions(
        &self,
        limit: usize,
    ) -> Result<Vec<AutonomousTestExecution>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches() {
        let names = vec!["preview_deployment".to_string()];
        let execution = WorkflowExecution::new(Uuid::now_v7(), "preview-only", &names);

        assert!(ExecutionFilter::default().matches(&execution));
        assert!(ExecutionFilter::for_subject(execution.subject_id).matches(&execution));
        assert!(!ExecutionFilter::for_subject(Uuid::now_v7()).matches(&execution));
        assert!(!ExecutionFilter::default()
            .with_status(WorkflowStatus::Failed)
            .matches(&execution));
    }

    #[test]
    fn test_conflict_detection() {
        let err = StoreError::ConcurrencyConflict {
            expected: 2,
            actual: 3,
        };
        assert!(err.is_conflict());
        assert_eq!(
            err.to_string(),
            "concurrency conflict: expected sequence 2, got 3"
        );
        assert!(!StoreError::Database("down".into()).is_conflict());
    }
}

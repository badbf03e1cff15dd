// Orchestrator error type

use thiserror::Error;
use uuid::Uuid;

use devloop_core::{CollaboratorError, RegistryError, StepStatus, WorkflowStatus};
use devloop_durable::{ConflictError, StoreError, TimeoutError};

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("workflow execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("test execution not found: {0}")]
    TestExecutionNotFound(Uuid),

    #[error("step {step} is not part of execution {execution_id}")]
    UnknownStep { execution_id: Uuid, step: String },

    #[error("no executor registered for step {0}")]
    MissingExecutor(String),

    #[error("step {step} is {status}, only pending steps can be executed")]
    StepNotPending { step: String, status: StepStatus },

    #[error("step {step} cannot run before {blocking} has completed")]
    StepOutOfOrder { step: String, blocking: String },

    #[error("execution {execution_id} is {status}, not running")]
    ExecutionNotRunning {
        execution_id: Uuid,
        status: WorkflowStatus,
    },

    #[error("step {step} is {status}, only failed steps can be retried")]
    StepNotFailed { step: String, status: StepStatus },

    #[error("{kind} {id} is already {status}")]
    AlreadyTerminal {
        kind: &'static str,
        id: Uuid,
        status: String,
    },

    #[error("max iterations must be at least 1, got {0}")]
    InvalidMaxIterations(u32),

    /// Infrastructure failure reported by an external service
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("step {step} {source}")]
    Timeout {
        step: String,
        #[source]
        source: TimeoutError,
    },
}

impl OrchestratorError {
    /// Caller errors that are rejected before any state is touched
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownWorkflowType(_)
                | Self::ExecutionNotFound(_)
                | Self::TestExecutionNotFound(_)
                | Self::UnknownStep { .. }
                | Self::StepNotPending { .. }
                | Self::StepOutOfOrder { .. }
                | Self::ExecutionNotRunning { .. }
                | Self::StepNotFailed { .. }
                | Self::AlreadyTerminal { .. }
                | Self::InvalidMaxIterations(_)
        )
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ExecutionNotFound(id) => Self::ExecutionNotFound(id),
            StoreError::TestExecutionNotFound(id) => Self::TestExecutionNotFound(id),
            other => Self::Store(other),
        }
    }
}

impl From<RegistryError> for OrchestratorError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownWorkflowType(t) => Self::UnknownWorkflowType(t),
        }
    }
}

impl ConflictError for OrchestratorError {
    fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }
}

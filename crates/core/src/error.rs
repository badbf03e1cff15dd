// Error types shared by collaborators and the template registry

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by external collaborator services
///
/// These are infrastructure failures. A failing test run is reported through
/// a non-zero exit code on [`crate::SandboxRun`], never through this type.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// Transport-level failure talking to the service
    #[error("{service} request failed: {message}")]
    Request {
        service: &'static str,
        message: String,
    },

    /// The service answered with an error status
    #[error("{service} returned status {status}: {message}")]
    Status {
        service: &'static str,
        status: u16,
        message: String,
    },

    /// The subject is unknown to the service
    #[error("subject not found: {0}")]
    SubjectNotFound(Uuid),

    /// The call was abandoned because the caller cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Any other failure reported by the service
    #[error("{0}")]
    Failed(String),
}

impl CollaboratorError {
    /// Create a generic failure
    pub fn failed(msg: impl Into<String>) -> Self {
        CollaboratorError::Failed(msg.into())
    }

    /// Create a transport failure for the named service
    pub fn request(service: &'static str, msg: impl Into<String>) -> Self {
        CollaboratorError::Request {
            service,
            message: msg.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CollaboratorError::Cancelled)
    }
}

/// Errors from the step template registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),
}

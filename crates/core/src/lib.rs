// Devloop core
//
// Domain model and contracts shared by the store and the orchestrator:
// - Workflow executions and their steps, reconstructed from step events
// - Autonomous test executions (one per test loop run)
// - The step template registry
// - Collaborator traits for preview deployment, sandbox execution,
//   self-healing analysis and subject ownership
// - Scripted fakes of every collaborator for tests and local runs

pub mod collaborators;
pub mod config;
pub mod error;
pub mod fakes;
pub mod telemetry;
pub mod templates;
pub mod test_loop;
pub mod workflow;

pub use collaborators::{
    DeploymentStatus, ExecutionKind, HealingReport, PreviewDeployer, PreviewDeployment,
    SandboxCommand, SandboxExecutor, SandboxRun, SelfHealer, SubjectDirectory,
};
pub use config::OrchestratorConfig;
pub use error::{CollaboratorError, RegistryError};
pub use templates::{step_names, workflow_types, StepTemplateRegistry};
pub use test_loop::{AutonomousTestExecution, TestLoopStatus};
pub use workflow::{fold_steps, StepEvent, StepStatus, WorkflowExecution, WorkflowStatus, WorkflowStep};

// Re-export so callers don't need a direct tokio-util dependency
pub use tokio_util::sync::CancellationToken;

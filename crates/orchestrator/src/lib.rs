// Devloop orchestrator
//
// Drives a generated project through preview deployment and the autonomous
// testing loop:
// - `orchestrator`: the workflow state machine and its builder
// - `steps`: one executor per template step
// - `testing_loop`: the bounded test -> heal -> redeploy loop on background tasks
// - `deploy_slot`: per-subject serialization of preview deploys
// - `metrics`: aggregate statistics over persisted runs
// - `adapters`: HTTP clients for the collaborator services

pub mod adapters;
pub mod deploy_slot;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod steps;
pub mod testing_loop;

pub use deploy_slot::SlottedDeployer;
pub use error::{OrchestratorError, Result};
pub use metrics::{StepFailureRate, TestLoopStats, WorkflowMetrics};
pub use orchestrator::{OrchestratorBuilder, WorkflowOrchestrator, DEFAULT_POLL_INTERVAL};
pub use steps::{StepContext, StepExecutor, StepOutcome};
pub use testing_loop::{LoopRequest, StepLink, TestLoopRunner};

// Step executors
//
// Each executor drives exactly one step name. The state machine owns every
// status transition; executors only call collaborators and report an outcome.

mod autonomous;
mod preview;

pub use autonomous::AutonomousTestingStep;
pub use preview::PreviewDeploymentStep;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use devloop_core::WorkflowExecution;

use crate::error::OrchestratorError;

/// Inputs handed to a step executor
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Execution snapshot taken after the step was marked running
    pub execution: WorkflowExecution,

    /// Name of the step being executed
    pub step: String,

    /// Owning user of the subject, resolved once per step
    pub owner_id: String,
}

impl StepContext {
    pub fn subject_id(&self) -> Uuid {
        self.execution.subject_id
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution.id
    }
}

/// What a successful executor produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step's work is done
    Completed {
        /// Deployment to record on the execution
        preview_deployment_id: Option<Uuid>,
    },

    /// Background work was started; the step stays running until it reports back
    Launched { test_execution_id: Uuid },
}

impl StepOutcome {
    pub fn completed() -> Self {
        Self::Completed {
            preview_deployment_id: None,
        }
    }
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Step name this executor handles
    fn name(&self) -> &str;

    async fn execute(
        &self,
        ctx: StepContext,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, OrchestratorError>;
}

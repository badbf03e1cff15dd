// Autonomous testing step
//
// Launches the test loop against the deployment produced by the preview step
// and returns immediately. The loop reports back to this step when it ends.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

use devloop_core::{step_names, CollaboratorError, PreviewDeployer};

use super::{StepContext, StepExecutor, StepOutcome};
use crate::error::OrchestratorError;
use crate::testing_loop::{LoopRequest, StepLink, TestLoopRunner};

pub struct AutonomousTestingStep {
    runner: Arc<TestLoopRunner>,
    deployer: Arc<dyn PreviewDeployer>,
    max_iterations: u32,
}

impl AutonomousTestingStep {
    pub fn new(
        runner: Arc<TestLoopRunner>,
        deployer: Arc<dyn PreviewDeployer>,
        max_iterations: u32,
    ) -> Self {
        Self {
            runner,
            deployer,
            max_iterations,
        }
    }

    /// Deployment recorded by the preview step, else the latest live one
    async fn deployment_under_test(
        &self,
        ctx: &StepContext,
        cancel: &CancellationToken,
    ) -> Result<Uuid, OrchestratorError> {
        if let Some(id) = ctx.execution.preview_deployment_id {
            return Ok(id);
        }
        let latest = self
            .deployer
            .latest_deployment(ctx.subject_id(), cancel)
            .await?;
        latest.map(|d| d.id).ok_or_else(|| {
            CollaboratorError::failed(format!(
                "no deployed preview found for subject {}",
                ctx.subject_id()
            ))
            .into()
        })
    }
}

#[async_trait]
impl StepExecutor for AutonomousTestingStep {
    fn name(&self) -> &str {
        step_names::AUTONOMOUS_TESTING_LOOP
    }

    #[instrument(skip(self, ctx, cancel), fields(execution_id = %ctx.execution_id(), subject_id = %ctx.subject_id()))]
    async fn execute(
        &self,
        ctx: StepContext,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, OrchestratorError> {
        let preview_deployment_id = self.deployment_under_test(&ctx, cancel).await?;

        let record = self
            .runner
            .launch(LoopRequest {
                subject_id: ctx.subject_id(),
                owner_id: ctx.owner_id.clone(),
                preview_deployment_id,
                max_iterations: self.max_iterations,
                link: Some(StepLink {
                    execution_id: ctx.execution_id(),
                    step: ctx.step.clone(),
                }),
            })
            .await?;

        info!(test_execution_id = %record.id, %preview_deployment_id, "test loop launched for step");
        Ok(StepOutcome::Launched {
            test_execution_id: record.id,
        })
    }
}

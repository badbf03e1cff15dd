// Preview deployment step
//
// Deploy the subject, then smoke-build it in the sandbox to prove the
// artifact boots. One attempt; any failure fails the step.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use devloop_core::{
    step_names, CollaboratorError, PreviewDeployer, SandboxCommand, SandboxExecutor,
};

use super::{StepContext, StepExecutor, StepOutcome};
use crate::error::OrchestratorError;

pub struct PreviewDeploymentStep {
    deployer: Arc<dyn PreviewDeployer>,
    sandbox: Arc<dyn SandboxExecutor>,
    smoke_build: SandboxCommand,
}

impl PreviewDeploymentStep {
    pub fn new(
        deployer: Arc<dyn PreviewDeployer>,
        sandbox: Arc<dyn SandboxExecutor>,
        smoke_build: SandboxCommand,
    ) -> Self {
        Self {
            deployer,
            sandbox,
            smoke_build,
        }
    }
}

#[async_trait]
impl StepExecutor for PreviewDeploymentStep {
    fn name(&self) -> &str {
        step_names::PREVIEW_DEPLOYMENT
    }

    #[instrument(skip(self, ctx, cancel), fields(execution_id = %ctx.execution_id(), subject_id = %ctx.subject_id()))]
    async fn execute(
        &self,
        ctx: StepContext,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, OrchestratorError> {
        let subject_id = ctx.subject_id();

        let deployment = self.deployer.deploy(subject_id, &ctx.owner_id, cancel).await?;
        if !deployment.is_deployed() {
            warn!(deployment_id = %deployment.id, status = %deployment.status, "preview did not deploy");
            return Err(CollaboratorError::failed(format!(
                "preview deployment {} ended with status {}",
                deployment.id, deployment.status
            ))
            .into());
        }

        let run = self.sandbox.execute(subject_id, &self.smoke_build, cancel).await?;
        if !run.succeeded() {
            let log = run.error_log.unwrap_or_default();
            return Err(CollaboratorError::failed(format!(
                "smoke build exited with code {}: {}",
                run.exit_code,
                log.trim()
            ))
            .into());
        }

        info!(deployment_id = %deployment.id, url = ?deployment.url, "preview deployed and smoke build passed");
        Ok(StepOutcome::Completed {
            preview_deployment_id: Some(deployment.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devloop_core::fakes::{FakePreviewDeployer, FakeSandbox};
    use devloop_core::{DeploymentStatus, ExecutionKind, WorkflowExecution};
    use uuid::Uuid;

    fn context() -> StepContext {
        let names = vec![step_names::PREVIEW_DEPLOYMENT.to_string()];
        StepContext {
            execution: WorkflowExecution::new(Uuid::now_v7(), "preview-only", &names),
            step: step_names::PREVIEW_DEPLOYMENT.to_string(),
            owner_id: "owner-1".to_string(),
        }
    }

    fn smoke_build() -> SandboxCommand {
        SandboxCommand::new(ExecutionKind::Preview, "npm run build", "container")
    }

    #[tokio::test]
    async fn test_deploys_then_smoke_builds() {
        let deployer = Arc::new(FakePreviewDeployer::new());
        let sandbox = Arc::new(FakeSandbox::new());
        let step = PreviewDeploymentStep::new(deployer.clone(), sandbox.clone(), smoke_build());

        let outcome = step
            .execute(context(), &CancellationToken::new())
            .await
            .unwrap();

        let deployed = deployer.deployments();
        assert_eq!(deployed.len(), 1);
        assert_eq!(
            outcome,
            StepOutcome::Completed {
                preview_deployment_id: Some(deployed[0].id)
            }
        );
        assert_eq!(sandbox.call_count(ExecutionKind::Preview), 1);
    }

    #[tokio::test]
    async fn test_deploy_error_skips_smoke_build() {
        let deployer = Arc::new(FakePreviewDeployer::failing("Deployment failed"));
        let sandbox = Arc::new(FakeSandbox::new());
        let step = PreviewDeploymentStep::new(deployer, sandbox.clone(), smoke_build());

        let err = step
            .execute(context(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Deployment failed");
        assert!(sandbox.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_deploy_status_is_an_error() {
        let deployer = Arc::new(FakePreviewDeployer::new().with_status(DeploymentStatus::Failed));
        let sandbox = Arc::new(FakeSandbox::new());
        let step = PreviewDeploymentStep::new(deployer, sandbox.clone(), smoke_build());

        let err = step
            .execute(context(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("ended with status failed"));
        assert!(sandbox.calls().is_empty());
    }

    #[tokio::test]
    async fn test_non_zero_smoke_build_fails_step() {
        let deployer = Arc::new(FakePreviewDeployer::new());
        let sandbox = Arc::new(FakeSandbox::always(ExecutionKind::Preview, 2));
        let step = PreviewDeploymentStep::new(deployer, sandbox, smoke_build());

        let err = step
            .execute(context(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("smoke build exited with code 2"));
    }
}

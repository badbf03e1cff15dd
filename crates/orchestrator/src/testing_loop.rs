// Autonomous testing loop
//
// Bounded test -> heal -> redeploy cycle. Every loop runs on its own tracked
// tokio task and reports only through the store; callers poll the
// AutonomousTestExecution record (and the launching workflow step).
//
// Iteration N+1 never starts before iteration N's heal and redeploy have
// returned. Each iteration runs under a timeout and every collaborator call
// receives the loop's cancellation token.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

use devloop_core::{
    AutonomousTestExecution, CollaboratorError, PreviewDeployer, PreviewDeployment,
    SandboxCommand, SandboxExecutor, SelfHealer, StepEvent, StepStatus, TestLoopStatus,
    WorkflowStatus,
};
use devloop_durable::{with_timeout, RetryPolicy, StoreError, WorkflowStore};

use crate::error::{OrchestratorError, Result};

/// Workflow step that launched a loop and waits for its verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepLink {
    pub execution_id: Uuid,
    pub step: String,
}

/// Parameters for one loop run
#[derive(Debug, Clone)]
pub struct LoopRequest {
    pub subject_id: Uuid,
    pub owner_id: String,
    pub preview_deployment_id: Uuid,
    pub max_iterations: u32,
    pub link: Option<StepLink>,
}

/// How one iteration ended when no collaborator failed
#[derive(Debug)]
enum Iteration {
    Passed,
    Healed { deployment: PreviewDeployment },
}

/// How the whole loop ended
#[derive(Debug, PartialEq, Eq)]
struct LoopEnd {
    status: TestLoopStatus,
    summary: String,
    error: Option<String>,
}

impl LoopEnd {
    fn passed(iteration: u32) -> Self {
        Self {
            status: TestLoopStatus::Completed,
            summary: format!("passed on iteration {}", iteration),
            error: None,
        }
    }

    fn exhausted(max_iterations: u32) -> Self {
        Self {
            status: TestLoopStatus::Failed,
            summary: format!("tests failed after {} iterations", max_iterations),
            error: None,
        }
    }

    fn aborted(iteration: u32, message: String) -> Self {
        Self {
            status: TestLoopStatus::Failed,
            summary: format!("aborted on iteration {}: {}", iteration, message),
            error: Some(message),
        }
    }

    fn cancelled(iteration: u32) -> Self {
        Self {
            status: TestLoopStatus::Cancelled,
            summary: format!("cancelled on iteration {}", iteration),
            error: None,
        }
    }
}

/// In-process handle on a running loop
struct RunningLoop {
    /// Workflow execution that launched the loop, if any
    execution_id: Option<Uuid>,
    cancel: CancellationToken,
    /// Fired by the task once its final state is persisted
    finished: CancellationToken,
}

/// Collaborators and settings shared by every loop task
struct LoopShared {
    store: Arc<dyn WorkflowStore>,
    sandbox: Arc<dyn SandboxExecutor>,
    healer: Arc<dyn SelfHealer>,
    deployer: Arc<dyn PreviewDeployer>,
    test_command: SandboxCommand,
    iteration_timeout: Duration,
    retry: RetryPolicy,
    running: DashMap<Uuid, RunningLoop>,
}

/// Launches and tracks autonomous testing loops
pub struct TestLoopRunner {
    shared: Arc<LoopShared>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl TestLoopRunner {
    /// `deployer` should already serialize deploys per subject
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        sandbox: Arc<dyn SandboxExecutor>,
        healer: Arc<dyn SelfHealer>,
        deployer: Arc<dyn PreviewDeployer>,
        test_command: SandboxCommand,
        iteration_timeout: Duration,
    ) -> Self {
        Self::with_retry_policy(
            store,
            sandbox,
            healer,
            deployer,
            test_command,
            iteration_timeout,
            RetryPolicy::exponential(),
        )
    }

    pub fn with_retry_policy(
        store: Arc<dyn WorkflowStore>,
        sandbox: Arc<dyn SandboxExecutor>,
        healer: Arc<dyn SelfHealer>,
        deployer: Arc<dyn PreviewDeployer>,
        test_command: SandboxCommand,
        iteration_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            shared: Arc::new(LoopShared {
                store,
                sandbox,
                healer,
                deployer,
                test_command,
                iteration_timeout,
                retry,
                running: DashMap::new(),
            }),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Persist a new running record and start its loop in the background
    ///
    /// Returns as soon as the task is spawned.
    #[instrument(skip(self, request), fields(subject_id = %request.subject_id, max_iterations = request.max_iterations))]
    pub async fn launch(&self, request: LoopRequest) -> Result<AutonomousTestExecution> {
        if request.max_iterations == 0 {
            return Err(OrchestratorError::InvalidMaxIterations(0));
        }
        if self.shutdown.is_cancelled() {
            return Err(CollaboratorError::Cancelled.into());
        }

        let mut record = AutonomousTestExecution::new(
            request.subject_id,
            request.owner_id,
            request.preview_deployment_id,
            request.max_iterations,
        );
        if let Some(link) = &request.link {
            record = record.for_workflow(link.execution_id);
        }
        self.shared.store.create_test_execution(&record).await?;

        let cancel = self.shutdown.child_token();
        let finished = CancellationToken::new();
        self.shared.running.insert(
            record.id,
            RunningLoop {
                execution_id: request.link.as_ref().map(|link| link.execution_id),
                cancel: cancel.clone(),
                finished: finished.clone(),
            },
        );

        let span = tracing::info_span!("test_loop", test_execution_id = %record.id, subject_id = %record.subject_id);
        let shared = self.shared.clone();
        let launched = record.clone();
        self.tracker.spawn(
            async move {
                shared.run(record, request.link, cancel).await;
                finished.cancel();
            }
            .instrument(span),
        );

        info!(test_execution_id = %launched.id, "autonomous test loop launched");
        Ok(launched)
    }

    /// Cancel a loop running in this process and wait until it has persisted
    /// its final state. Returns false if no such loop is running here.
    pub async fn cancel(&self, test_execution_id: Uuid) -> bool {
        let finished = match self.shared.running.get(&test_execution_id) {
            Some(entry) => {
                entry.cancel.cancel();
                entry.finished.clone()
            }
            None => return false,
        };
        finished.cancelled().await;
        true
    }

    /// Cancel the loops launched by `execution_id`; returns how many were stopped
    pub async fn cancel_workflow_loops(&self, execution_id: Uuid) -> usize {
        let finished: Vec<CancellationToken> = self
            .shared
            .running
            .iter()
            .filter(|entry| entry.execution_id == Some(execution_id))
            .map(|entry| {
                entry.cancel.cancel();
                entry.finished.clone()
            })
            .collect();
        let count = finished.len();
        join_all(finished.iter().map(|f| f.cancelled())).await;
        count
    }

    pub fn is_running(&self, test_execution_id: Uuid) -> bool {
        self.shared.running.contains_key(&test_execution_id)
    }

    pub fn running_count(&self) -> usize {
        self.shared.running.len()
    }

    /// Cancel every loop and wait for all of them to finish
    pub async fn shutdown(&self) {
        info!(running = self.running_count(), "shutting down test loops");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Finish a loop record that has no task in this process
    ///
    /// Covers records left running by a previous process.
    pub async fn finish_orphan(&self, test_execution_id: Uuid) -> Result<AutonomousTestExecution> {
        let mut record = self.shared.store.get_test_execution(test_execution_id).await?;
        if record.is_terminal() {
            return Ok(record);
        }
        let end = LoopEnd::cancelled(record.current_iteration);
        record.error = end.error.clone();
        record.finish(end.status, end.summary);
        let record = self.shared.persist_final(record).await;
        if let Some(execution_id) = record.workflow_execution_id {
            let link = StepLink {
                execution_id,
                step: devloop_core::step_names::AUTONOMOUS_TESTING_LOOP.to_string(),
            };
            self.shared.report_to_step(&link, &record).await;
        }
        Ok(record)
    }
}

impl LoopShared {
    async fn run(
        self: Arc<Self>,
        mut record: AutonomousTestExecution,
        link: Option<StepLink>,
        cancel: CancellationToken,
    ) {
        let end = self.drive(&mut record, &cancel).await;
        info!(
            status = %end.status,
            iteration = record.current_iteration,
            summary = %end.summary,
            "autonomous test loop finished"
        );

        record.error = end.error;
        record.finish(end.status, end.summary);
        let record = self.persist_final(record).await;

        if let Some(link) = &link {
            self.report_to_step(link, &record).await;
        }
        self.running.remove(&record.id);
    }

    async fn drive(&self, record: &mut AutonomousTestExecution, cancel: &CancellationToken) -> LoopEnd {
        loop {
            if cancel.is_cancelled() {
                return LoopEnd::cancelled(record.current_iteration);
            }

            record.current_iteration += 1;
            record.updated_at = Utc::now();
            let iteration = record.current_iteration;
            if let Err(e) = self.store.update_test_execution(record).await {
                return LoopEnd::aborted(iteration, e.to_string());
            }
            debug!(iteration, "starting test iteration");

            let attempt = tokio::select! {
                _ = cancel.cancelled() => return LoopEnd::cancelled(iteration),
                attempt = with_timeout(
                    self.iteration_timeout,
                    self.iterate(record.subject_id, &record.owner_id, cancel),
                ) => attempt,
            };

            match attempt {
                Err(timeout) => {
                    warn!(iteration, "test iteration timed out");
                    return LoopEnd::aborted(iteration, format!("iteration {} {}", iteration, timeout));
                }
                Ok(Err(e)) if e.is_cancelled() => return LoopEnd::cancelled(iteration),
                Ok(Err(e)) => {
                    error!(iteration, error = %e, "collaborator failed during test iteration");
                    return LoopEnd::aborted(iteration, e.to_string());
                }
                Ok(Ok(Iteration::Passed)) => return LoopEnd::passed(iteration),
                Ok(Ok(Iteration::Healed { deployment })) => {
                    record.preview_deployment_id = deployment.id;
                    if iteration >= record.max_iterations {
                        return LoopEnd::exhausted(record.max_iterations);
                    }
                }
            }
        }
    }

    /// Run the tests; on failure heal the subject and redeploy it
    async fn iterate(
        &self,
        subject_id: Uuid,
        owner_id: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<Iteration, CollaboratorError> {
        let run = self.sandbox.execute(subject_id, &self.test_command, cancel).await?;
        if run.succeeded() {
            return Ok(Iteration::Passed);
        }
        debug!(exit_code = run.exit_code, "tests failed, healing");

        let report = self.healer.analyze(subject_id, cancel).await?;
        debug!(
            failed = report.failed_tests_count,
            healed = report.healed_tests.len(),
            "healing finished, redeploying"
        );

        let deployment = self.deployer.deploy(subject_id, owner_id, cancel).await?;
        if !deployment.is_deployed() {
            return Err(CollaboratorError::failed(format!(
                "redeploy {} ended with status {}",
                deployment.id, deployment.status
            )));
        }
        Ok(Iteration::Healed { deployment })
    }

    /// Write the terminal record; if the store already holds a terminal one,
    /// that record wins
    async fn persist_final(&self, record: AutonomousTestExecution) -> AutonomousTestExecution {
        match self.store.update_test_execution(&record).await {
            Ok(()) => record,
            Err(StoreError::TestExecutionTerminal(id)) => {
                match self.store.get_test_execution(id).await {
                    Ok(stored) => stored,
                    Err(e) => {
                        error!(test_execution_id = %id, error = %e, "failed to reload terminal test execution");
                        record
                    }
                }
            }
            Err(e) => {
                error!(test_execution_id = %record.id, error = %e, "failed to persist final test execution");
                record
            }
        }
    }

    /// Move the launching step to its final status
    async fn report_to_step(&self, link: &StepLink, record: &AutonomousTestExecution) {
        let store = &self.store;
        let result = self
            .retry
            .retry_conflicts(move || async move { complete_linked_step(store.as_ref(), link, record).await })
            .await;
        if let Err(e) = result {
            error!(
                execution_id = %link.execution_id,
                step = %link.step,
                error = %e,
                "failed to report test loop result to workflow"
            );
        }
    }
}

/// Commit the linked step's completion if it is still waiting on this loop
async fn complete_linked_step(
    store: &dyn WorkflowStore,
    link: &StepLink,
    record: &AutonomousTestExecution,
) -> std::result::Result<(), StoreError> {
    let mut execution = store.load_execution(link.execution_id).await?;
    let waiting = execution
        .step(&link.step)
        .map(|s| s.status == StepStatus::Running)
        .unwrap_or(false);
    if !waiting || execution.status != WorkflowStatus::Running {
        debug!(execution_id = %execution.id, step = %link.step, "workflow no longer waiting on test loop");
        return Ok(());
    }

    let now = Utc::now();
    let event = if record.tests_passed {
        if execution.is_last_step(&link.step) {
            execution.status = WorkflowStatus::Completed;
            execution.completed_at = Some(now);
        }
        StepEvent::completed(&link.step)
    } else {
        execution.status = WorkflowStatus::Failed;
        execution.completed_at = Some(now);
        let message = record
            .final_test_result
            .clone()
            .unwrap_or_else(|| format!("test loop ended {}", record.status));
        StepEvent::failed(&link.step, message)
    };
    execution.updated_at = now;

    store.commit(&execution, &[event]).await?;
    info!(
        execution_id = %execution.id,
        step = %link.step,
        status = %execution.status,
        "test loop result recorded on workflow"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use devloop_core::fakes::{FakePreviewDeployer, FakeSandbox, FakeSelfHealer};
    use devloop_core::ExecutionKind;
    use devloop_durable::InMemoryWorkflowStore;

    struct Harness {
        store: Arc<InMemoryWorkflowStore>,
        sandbox: Arc<FakeSandbox>,
        healer: Arc<FakeSelfHealer>,
        deployer: Arc<FakePreviewDeployer>,
        runner: TestLoopRunner,
    }

    fn harness(sandbox: FakeSandbox, healer: FakeSelfHealer, deployer: FakePreviewDeployer) -> Harness {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let sandbox = Arc::new(sandbox);
        let healer = Arc::new(healer);
        let deployer = Arc::new(deployer);
        let runner = TestLoopRunner::new(
            store.clone(),
            sandbox.clone(),
            healer.clone(),
            deployer.clone(),
            SandboxCommand::new(ExecutionKind::Test, "npm test", "container"),
            Duration::from_secs(5),
        );
        Harness {
            store,
            sandbox,
            healer,
            deployer,
            runner,
        }
    }

    fn request(max_iterations: u32) -> LoopRequest {
        LoopRequest {
            subject_id: Uuid::now_v7(),
            owner_id: "owner-1".to_string(),
            preview_deployment_id: Uuid::now_v7(),
            max_iterations,
            link: None,
        }
    }

    async fn wait_terminal(store: &InMemoryWorkflowStore, id: Uuid) -> AutonomousTestExecution {
        for _ in 0..500 {
            let record = store.get_test_execution(id).await.unwrap();
            if record.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("test execution {} never finished", id);
    }

    #[tokio::test]
    async fn test_first_attempt_pass_never_heals() {
        let h = harness(
            FakeSandbox::always(ExecutionKind::Test, 0),
            FakeSelfHealer::new(),
            FakePreviewDeployer::new(),
        );
        let launched = h.runner.launch(request(3)).await.unwrap();
        assert_eq!(launched.status, TestLoopStatus::Running);

        let done = wait_terminal(&h.store, launched.id).await;
        assert_eq!(done.status, TestLoopStatus::Completed);
        assert!(done.tests_passed);
        assert_eq!(done.current_iteration, 1);
        assert_eq!(done.final_test_result.as_deref(), Some("passed on iteration 1"));
        assert_eq!(h.healer.analyze_count(), 0);
        assert_eq!(h.deployer.deploy_count(), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_heals_and_redeploys_every_iteration() {
        let h = harness(
            FakeSandbox::always(ExecutionKind::Test, 1),
            FakeSelfHealer::new(),
            FakePreviewDeployer::new(),
        );
        let launched = h.runner.launch(request(3)).await.unwrap();

        let done = wait_terminal(&h.store, launched.id).await;
        assert_eq!(done.status, TestLoopStatus::Failed);
        assert!(!done.tests_passed);
        assert_eq!(done.current_iteration, 3);
        assert_eq!(
            done.final_test_result.as_deref(),
            Some("tests failed after 3 iterations")
        );
        assert!(done.error.is_none());
        assert_eq!(h.sandbox.call_count(ExecutionKind::Test), 3);
        assert_eq!(h.healer.analyze_count(), 3);
        assert_eq!(h.deployer.deploy_count(), 3);

        let last_deploy = h.deployer.deployments().last().map(|d| d.id);
        assert_eq!(Some(done.preview_deployment_id), last_deploy);
    }

    #[tokio::test]
    async fn test_pass_after_healing() {
        let h = harness(
            FakeSandbox::new().with_exit_codes(ExecutionKind::Test, [1, 0]),
            FakeSelfHealer::new(),
            FakePreviewDeployer::new(),
        );
        let launched = h.runner.launch(request(3)).await.unwrap();

        let done = wait_terminal(&h.store, launched.id).await;
        assert_eq!(done.status, TestLoopStatus::Completed);
        assert_eq!(done.current_iteration, 2);
        assert_eq!(done.final_test_result.as_deref(), Some("passed on iteration 2"));
        assert_eq!(h.healer.analyze_count(), 1);
        assert_eq!(h.deployer.deploy_count(), 1);
    }

    #[tokio::test]
    async fn test_single_iteration_still_heals_once() {
        let h = harness(
            FakeSandbox::always(ExecutionKind::Test, 1),
            FakeSelfHealer::new(),
            FakePreviewDeployer::new(),
        );
        let launched = h.runner.launch(request(1)).await.unwrap();

        let done = wait_terminal(&h.store, launched.id).await;
        assert_eq!(done.status, TestLoopStatus::Failed);
        assert_eq!(done.current_iteration, 1);
        assert_eq!(h.sandbox.call_count(ExecutionKind::Test), 1);
        assert_eq!(h.healer.analyze_count(), 1);
        assert_eq!(h.deployer.deploy_count(), 1);
    }

    #[tokio::test]
    async fn test_healer_failure_aborts_loop() {
        let h = harness(
            FakeSandbox::always(ExecutionKind::Test, 1),
            FakeSelfHealer::failing("healing service unavailable"),
            FakePreviewDeployer::new(),
        );
        let launched = h.runner.launch(request(3)).await.unwrap();

        let done = wait_terminal(&h.store, launched.id).await;
        assert_eq!(done.status, TestLoopStatus::Failed);
        assert_eq!(done.current_iteration, 1);
        assert_eq!(done.error.as_deref(), Some("healing service unavailable"));
        assert_eq!(
            done.final_test_result.as_deref(),
            Some("aborted on iteration 1: healing service unavailable")
        );
        assert_eq!(h.deployer.deploy_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_iterations_rejected() {
        let h = harness(FakeSandbox::new(), FakeSelfHealer::new(), FakePreviewDeployer::new());
        let err = h.runner.launch(request(0)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidMaxIterations(0)));
        assert!(h.store.list_test_executions(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_loop_and_waits() {
        let h = harness(
            FakeSandbox::always(ExecutionKind::Test, 1).with_delay(Duration::from_secs(30)),
            FakeSelfHealer::new(),
            FakePreviewDeployer::new(),
        );
        let launched = h.runner.launch(request(3)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(h.runner.cancel(launched.id).await);
        assert!(!h.runner.is_running(launched.id));

        let done = h.store.get_test_execution(launched.id).await.unwrap();
        assert_eq!(done.status, TestLoopStatus::Cancelled);
        assert_eq!(done.final_test_result.as_deref(), Some("cancelled on iteration 1"));
        assert!(!h.runner.cancel(launched.id).await);
    }

    #[tokio::test]
    async fn test_workflow_cancel_only_stops_its_own_loops() {
        let h = harness(
            FakeSandbox::always(ExecutionKind::Test, 1).with_delay(Duration::from_secs(30)),
            FakeSelfHealer::new(),
            FakePreviewDeployer::new(),
        );
        let execution_id = Uuid::now_v7();
        let mut linked = request(3);
        linked.link = Some(StepLink {
            execution_id,
            step: devloop_core::step_names::AUTONOMOUS_TESTING_LOOP.to_string(),
        });
        let mut same_subject = request(3);
        same_subject.subject_id = linked.subject_id;

        let owned = h.runner.launch(linked).await.unwrap();
        let other = h.runner.launch(same_subject).await.unwrap();

        assert_eq!(h.runner.cancel_workflow_loops(execution_id).await, 1);
        assert!(!h.runner.is_running(owned.id));
        assert!(h.runner.is_running(other.id));
        assert_eq!(h.runner.cancel_workflow_loops(Uuid::now_v7()).await, 0);

        h.runner.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_all_loops() {
        let h = harness(
            FakeSandbox::always(ExecutionKind::Test, 1).with_delay(Duration::from_secs(30)),
            FakeSelfHealer::new(),
            FakePreviewDeployer::new(),
        );
        let first = h.runner.launch(request(3)).await.unwrap();
        let second = h.runner.launch(request(3)).await.unwrap();

        h.runner.shutdown().await;
        assert_eq!(h.runner.running_count(), 0);

        for id in [first.id, second.id] {
            let record = h.store.get_test_execution(id).await.unwrap();
            assert_eq!(record.status, TestLoopStatus::Cancelled);
        }
        assert!(h.runner.launch(request(3)).await.is_err());
    }
}

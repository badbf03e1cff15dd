// Workflow state machine
//
// Creates executions from step templates and moves their steps through
// Pending -> Running -> Completed | Failed | Cancelled. Every transition is a
// step event committed at the sequence the writer last observed; conflicting
// writers reload and re-check before committing again.
//
// Rules:
// - Steps run in template order, one at a time, only while the execution runs
// - A failed step fails the execution and no later step runs
// - The execution completes when every step has completed
// - A launched step (the testing loop) stays running until its loop reports

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use devloop_core::{
    AutonomousTestExecution, OrchestratorConfig, PreviewDeployer, SandboxExecutor, SelfHealer,
    StepEvent, StepStatus, StepTemplateRegistry, SubjectDirectory, WorkflowExecution,
    WorkflowStatus,
};
use devloop_durable::{
    with_timeout, ExecutionFilter, RecordedStepEvent, RetryPolicy, WorkflowStore, LIST_LIMIT,
};

use crate::deploy_slot::SlottedDeployer;
use crate::error::{OrchestratorError, Result};
use crate::metrics::{TestLoopStats, WorkflowMetrics};
use crate::steps::{
    AutonomousTestingStep, PreviewDeploymentStep, StepContext, StepExecutor, StepOutcome,
};
use crate::testing_loop::{LoopRequest, TestLoopRunner};

/// Default interval between store reads while waiting on a launched step
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Result of a synchronous step, to be recorded on the execution
enum StepResult {
    Completed { preview_deployment_id: Option<Uuid> },
    Failed(String),
}

/// Drives workflow executions for subjects
pub struct WorkflowOrchestrator {
    store: Arc<dyn WorkflowStore>,
    directory: Arc<dyn SubjectDirectory>,
    registry: StepTemplateRegistry,
    executors: HashMap<String, Arc<dyn StepExecutor>>,
    loops: Arc<TestLoopRunner>,
    config: OrchestratorConfig,
    retry: RetryPolicy,
    poll_interval: Duration,
    /// Cancellation for the synchronous step in flight, per execution
    active_steps: DashMap<Uuid, CancellationToken>,
    shutdown: CancellationToken,
}

impl WorkflowOrchestrator {
    pub fn builder(
        store: Arc<dyn WorkflowStore>,
        deployer: Arc<dyn PreviewDeployer>,
        sandbox: Arc<dyn SandboxExecutor>,
        healer: Arc<dyn SelfHealer>,
        directory: Arc<dyn SubjectDirectory>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder::new(store, deployer, sandbox, healer, directory)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &StepTemplateRegistry {
        &self.registry
    }

    pub fn test_loops(&self) -> &TestLoopRunner {
        &self.loops
    }

    // =========================================================================
    // Workflow lifecycle
    // =========================================================================

    /// Create a running execution with every template step pending
    #[instrument(skip(self), fields(subject_id = %subject_id))]
    pub async fn start_workflow(
        &self,
        subject_id: Uuid,
        workflow_type: &str,
    ) -> Result<WorkflowExecution> {
        let steps = self.registry.template_for(workflow_type)?;
        let execution = WorkflowExecution::new(subject_id, workflow_type, steps);
        self.store.create_execution(&execution).await?;

        info!(
            execution_id = %execution.id,
            workflow_type,
            steps = execution.steps.len(),
            "workflow started"
        );
        Ok(execution)
    }

    /// Run one pending step
    ///
    /// Synchronous steps are recorded as completed or failed before this
    /// returns; an executor failure is recorded and then returned. A launched
    /// step is still running when this returns.
    #[instrument(skip(self), fields(execution_id = %execution_id))]
    pub async fn execute_step(&self, execution_id: Uuid, step: &str) -> Result<WorkflowExecution> {
        let store = &self.store;
        let executors = &self.executors;
        let (execution, executor) = self
            .retry
            .retry_conflicts(move || async move {
                let mut execution = store.load_execution(execution_id).await?;
                let index = execution.step_index(step).ok_or_else(|| {
                    OrchestratorError::UnknownStep {
                        execution_id,
                        step: step.to_string(),
                    }
                })?;
                let executor = executors
                    .get(step)
                    .cloned()
                    .ok_or_else(|| OrchestratorError::MissingExecutor(step.to_string()))?;
                ensure_can_start(&execution, index)?;

                let event = StepEvent::started(step);
                execution.updated_at = event.at;
                execution.sequence = store.commit(&execution, std::slice::from_ref(&event)).await?;
                execution.steps[index].apply(&event);
                Ok::<_, OrchestratorError>((execution, executor))
            })
            .await?;
        info!(step, "step started");

        let cancel = self.shutdown.child_token();
        self.active_steps.insert(execution_id, cancel.clone());
        let outcome = self.run_executor(executor, &execution, step, &cancel).await;
        self.active_steps.remove(&execution_id);

        match outcome {
            Ok(StepOutcome::Completed {
                preview_deployment_id,
            }) => {
                let execution = self
                    .record_step_result(
                        execution_id,
                        step,
                        &StepResult::Completed {
                            preview_deployment_id,
                        },
                    )
                    .await?;
                info!(step, status = %execution.status, "step completed");
                Ok(execution)
            }
            Ok(StepOutcome::Launched { test_execution_id }) => {
                info!(step, %test_execution_id, "step launched background work");
                Ok(self.store.load_execution(execution_id).await?)
            }
            Err(e) => {
                warn!(step, error = %e, "step failed");
                self.record_step_result(execution_id, step, &StepResult::Failed(e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    async fn run_executor(
        &self,
        executor: Arc<dyn StepExecutor>,
        execution: &WorkflowExecution,
        step: &str,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        let work = async {
            let owner_id = self.directory.owner_of(execution.subject_id, cancel).await?;
            let ctx = StepContext {
                execution: execution.clone(),
                step: step.to_string(),
                owner_id,
            };
            executor.execute(ctx, cancel).await
        };

        match with_timeout(self.config.step_timeout, work).await {
            Ok(outcome) => outcome,
            Err(source) => {
                // Dropping the future abandoned the call; stop anything it spawned
                cancel.cancel();
                Err(OrchestratorError::Timeout {
                    step: step.to_string(),
                    source,
                })
            }
        }
    }

    /// Commit the outcome of a running step; no-op if the step or the
    /// execution moved on meanwhile (e.g. cancelled)
    async fn record_step_result(
        &self,
        execution_id: Uuid,
        step: &str,
        result: &StepResult,
    ) -> Result<WorkflowExecution> {
        let store = &self.store;
        self.retry
            .retry_conflicts(move || async move {
                let mut execution = store.load_execution(execution_id).await?;
                let index = match execution.step_index(step) {
                    Some(index)
                        if execution.steps[index].status == StepStatus::Running
                            && execution.status == WorkflowStatus::Running =>
                    {
                        index
                    }
                    _ => return Ok(execution),
                };

                let event = match result {
                    StepResult::Completed {
                        preview_deployment_id,
                    } => {
                        if preview_deployment_id.is_some() {
                            execution.preview_deployment_id = *preview_deployment_id;
                        }
                        StepEvent::completed(step)
                    }
                    StepResult::Failed(message) => StepEvent::failed(step, message.clone()),
                };
                execution.steps[index].apply(&event);

                let now = event.at;
                if event.status == StepStatus::Failed {
                    execution.status = WorkflowStatus::Failed;
                    execution.completed_at = Some(now);
                } else if execution.all_steps_completed() {
                    execution.status = WorkflowStatus::Completed;
                    execution.completed_at = Some(now);
                }
                execution.updated_at = now;

                execution.sequence = store.commit(&execution, std::slice::from_ref(&event)).await?;
                Ok::<_, OrchestratorError>(execution)
            })
            .await
    }

    /// Reset a failed step to pending so it can be executed again
    #[instrument(skip(self), fields(execution_id = %execution_id))]
    pub async fn retry_step(&self, execution_id: Uuid, step: &str) -> Result<WorkflowExecution> {
        let store = &self.store;
        let execution = self
            .retry
            .retry_conflicts(move || async move {
                let mut execution = store.load_execution(execution_id).await?;
                if execution.status == WorkflowStatus::Cancelled {
                    return Err(already_terminal(&execution));
                }
                let index = execution.step_index(step).ok_or_else(|| {
                    OrchestratorError::UnknownStep {
                        execution_id,
                        step: step.to_string(),
                    }
                })?;
                let status = execution.steps[index].status;
                if status != StepStatus::Failed {
                    return Err(OrchestratorError::StepNotFailed {
                        step: step.to_string(),
                        status,
                    });
                }

                let event = StepEvent::reset(step);
                execution.steps[index].apply(&event);
                execution.status = WorkflowStatus::Running;
                execution.completed_at = None;
                execution.retry_count += 1;
                execution.updated_at = event.at;
                execution.sequence = store.commit(&execution, std::slice::from_ref(&event)).await?;
                Ok::<_, OrchestratorError>(execution)
            })
            .await?;

        info!(step, retry_count = execution.retry_count, "step reset for retry");
        Ok(execution)
    }

    /// Cancel an execution, its in-flight step and the test loops it launched
    #[instrument(skip(self), fields(execution_id = %execution_id))]
    pub async fn cancel_workflow(&self, execution_id: Uuid) -> Result<WorkflowExecution> {
        let store = &self.store;
        let execution = self
            .retry
            .retry_conflicts(move || async move {
                let mut execution = store.load_execution(execution_id).await?;
                if matches!(
                    execution.status,
                    WorkflowStatus::Completed | WorkflowStatus::Cancelled
                ) {
                    return Err(already_terminal(&execution));
                }

                let events: Vec<StepEvent> = execution
                    .steps
                    .iter()
                    .filter(|s| s.status == StepStatus::Running)
                    .map(|s| StepEvent::cancelled(&s.name))
                    .collect();
                let now = Utc::now();
                for event in &events {
                    if let Some(index) = execution.step_index(&event.name) {
                        execution.steps[index].apply(event);
                    }
                }
                execution.status = WorkflowStatus::Cancelled;
                execution.completed_at = Some(now);
                execution.updated_at = now;
                execution.sequence = store.commit(&execution, &events).await?;
                Ok::<_, OrchestratorError>(execution)
            })
            .await?;

        if let Some(token) = self.active_steps.get(&execution_id) {
            token.cancel();
        }
        let stopped = self.loops.cancel_workflow_loops(execution_id).await;
        info!(subject_id = %execution.subject_id, stopped_loops = stopped, "workflow cancelled");
        Ok(execution)
    }

    /// Start a workflow and execute its steps in order, waiting on launched
    /// steps, until it finishes or a step fails
    #[instrument(skip(self), fields(subject_id = %subject_id))]
    pub async fn run_pipeline(
        &self,
        subject_id: Uuid,
        workflow_type: &str,
    ) -> Result<WorkflowExecution> {
        let mut execution = self.start_workflow(subject_id, workflow_type).await?;
        for step in execution.step_names() {
            execution = self.execute_step(execution.id, &step).await?;
            if execution
                .step(&step)
                .map(|s| s.status == StepStatus::Running)
                .unwrap_or(false)
            {
                execution = self.wait_for_step(execution.id, &step).await?;
            }
            if execution.status != WorkflowStatus::Running {
                break;
            }
        }
        Ok(execution)
    }

    /// Poll until `step` is no longer running or the execution has ended
    pub async fn wait_for_step(&self, execution_id: Uuid, step: &str) -> Result<WorkflowExecution> {
        loop {
            let execution = self.store.load_execution(execution_id).await?;
            let running = execution
                .step(step)
                .map(|s| s.status == StepStatus::Running)
                .unwrap_or(false);
            if !running || execution.is_terminal() {
                return Ok(execution);
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(execution),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    // =========================================================================
    // Workflow queries
    // =========================================================================

    pub async fn get_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution> {
        Ok(self.store.load_execution(execution_id).await?)
    }

    pub async fn get_latest_execution(&self, subject_id: Uuid) -> Result<Option<WorkflowExecution>> {
        Ok(self.store.latest_execution(subject_id).await?)
    }

    /// Every execution for the subject, most recent first
    pub async fn get_execution_history(&self, subject_id: Uuid) -> Result<Vec<WorkflowExecution>> {
        Ok(self.store.execution_history(subject_id).await?)
    }

    /// Most recent executions, optionally for one subject
    pub async fn list_workflows(&self, subject_id: Option<Uuid>) -> Result<Vec<WorkflowExecution>> {
        let filter = ExecutionFilter {
            subject_id,
            status: None,
        };
        Ok(self.store.list_executions(&filter, LIST_LIMIT).await?)
    }

    pub async fn step_events(&self, execution_id: Uuid) -> Result<Vec<RecordedStepEvent>> {
        Ok(self.store.load_step_events(execution_id).await?)
    }

    pub async fn metrics(&self) -> Result<WorkflowMetrics> {
        let executions = self
            .store
            .list_executions(&ExecutionFilter::default(), usize::MAX)
            .await?;
        Ok(WorkflowMetrics::from_executions(&executions))
    }

    // =========================================================================
    // Autonomous test executions
    // =========================================================================

    /// Launch a test loop outside any workflow
    #[instrument(skip(self), fields(subject_id = %subject_id))]
    pub async fn start_test_loop(
        &self,
        subject_id: Uuid,
        preview_deployment_id: Uuid,
        max_iterations: u32,
    ) -> Result<AutonomousTestExecution> {
        let owner_id = self
            .directory
            .owner_of(subject_id, &self.shutdown)
            .await?;
        self.loops
            .launch(LoopRequest {
                subject_id,
                owner_id,
                preview_deployment_id,
                max_iterations,
                link: None,
            })
            .await
    }

    /// Cancel a running test loop and return its final record
    #[instrument(skip(self))]
    pub async fn cancel_test_execution(&self, test_execution_id: Uuid) -> Result<AutonomousTestExecution> {
        let record = self.store.get_test_execution(test_execution_id).await?;
        if record.is_terminal() {
            return Err(OrchestratorError::AlreadyTerminal {
                kind: "test execution",
                id: record.id,
                status: record.status.to_string(),
            });
        }

        if self.loops.cancel(test_execution_id).await {
            Ok(self.store.get_test_execution(test_execution_id).await?)
        } else {
            warn!(%test_execution_id, "no loop running in this process, finishing record directly");
            self.loops.finish_orphan(test_execution_id).await
        }
    }

    pub async fn get_test_execution(&self, test_execution_id: Uuid) -> Result<AutonomousTestExecution> {
        Ok(self.store.get_test_execution(test_execution_id).await?)
    }

    pub async fn get_latest_test_execution(
        &self,
        subject_id: Uuid,
    ) -> Result<Option<AutonomousTestExecution>> {
        Ok(self.store.latest_test_execution(subject_id).await?)
    }

    pub async fn get_test_execution_history(
        &self,
        subject_id: Uuid,
    ) -> Result<Vec<AutonomousTestExecution>> {
        Ok(self.store.test_execution_history(subject_id).await?)
    }

    pub async fn test_stats(&self) -> Result<TestLoopStats> {
        let executions = self.store.list_test_executions(usize::MAX).await?;
        Ok(TestLoopStats::from_executions(&executions))
    }

    /// Cancel in-flight steps and every test loop, then wait for the loops
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.loops.shutdown().await;
    }
}

/// Check that the step at `index` may start now
fn ensure_can_start(execution: &WorkflowExecution, index: usize) -> Result<()> {
    if execution.status != WorkflowStatus::Running {
        return Err(OrchestratorError::ExecutionNotRunning {
            execution_id: execution.id,
            status: execution.status,
        });
    }

    let step = &execution.steps[index];
    if step.status != StepStatus::Pending {
        return Err(OrchestratorError::StepNotPending {
            step: step.name.clone(),
            status: step.status,
        });
    }

    if let Some(blocking) = execution.steps[..index]
        .iter()
        .find(|s| s.status != StepStatus::Completed)
    {
        return Err(OrchestratorError::StepOutOfOrder {
            step: step.name.clone(),
            blocking: blocking.name.clone(),
        });
    }
    Ok(())
}

fn already_terminal(execution: &WorkflowExecution) -> OrchestratorError {
    OrchestratorError::AlreadyTerminal {
        kind: "workflow execution",
        id: execution.id,
        status: execution.status.to_string(),
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Wires collaborators, step executors and the test loop runner together
pub struct OrchestratorBuilder {
    store: Arc<dyn WorkflowStore>,
    deployer: Arc<dyn PreviewDeployer>,
    sandbox: Arc<dyn SandboxExecutor>,
    healer: Arc<dyn SelfHealer>,
    directory: Arc<dyn SubjectDirectory>,
    config: OrchestratorConfig,
    registry: StepTemplateRegistry,
    retry: RetryPolicy,
    poll_interval: Duration,
    extra_executors: Vec<Arc<dyn StepExecutor>>,
}

impl OrchestratorBuilder {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        deployer: Arc<dyn PreviewDeployer>,
        sandbox: Arc<dyn SandboxExecutor>,
        healer: Arc<dyn SelfHealer>,
        directory: Arc<dyn SubjectDirectory>,
    ) -> Self {
        Self {
            store,
            deployer,
            sandbox,
            healer,
            directory,
            config: OrchestratorConfig::default(),
            registry: StepTemplateRegistry::builtin(),
            retry: RetryPolicy::exponential(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            extra_executors: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_registry(mut self, registry: StepTemplateRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Register an executor; replaces a built-in one with the same name
    pub fn with_executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.extra_executors.push(executor);
        self
    }

    /// Fails if a template names a step without an executor
    pub fn build(self) -> Result<WorkflowOrchestrator> {
        let deployer: Arc<dyn PreviewDeployer> = Arc::new(SlottedDeployer::new(self.deployer));

        let loops = Arc::new(TestLoopRunner::with_retry_policy(
            self.store.clone(),
            self.sandbox.clone(),
            self.healer,
            deployer.clone(),
            self.config.test_run(),
            self.config.iteration_timeout,
            self.retry.clone(),
        ));

        let builtin: [Arc<dyn StepExecutor>; 2] = [
            Arc::new(PreviewDeploymentStep::new(
                deployer.clone(),
                self.sandbox,
                self.config.smoke_build(),
            )),
            Arc::new(AutonomousTestingStep::new(
                loops.clone(),
                deployer,
                self.config.max_test_iterations,
            )),
        ];
        let mut executors: HashMap<String, Arc<dyn StepExecutor>> = HashMap::new();
        for executor in builtin.into_iter().chain(self.extra_executors) {
            executors.insert(executor.name().to_string(), executor);
        }

        if let Some(missing) = self
            .registry
            .all_step_names()
            .into_iter()
            .find(|name| !executors.contains_key(*name))
        {
            return Err(OrchestratorError::MissingExecutor(missing.to_string()));
        }

        Ok(WorkflowOrchestrator {
            store: self.store,
            directory: self.directory,
            registry: self.registry,
            executors,
            loops,
            config: self.config,
            retry: self.retry,
            poll_interval: self.poll_interval,
            active_steps: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }
}

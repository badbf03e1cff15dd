//! Shared harness for orchestrator integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use devloop_core::fakes::{
    CallLog, FakePreviewDeployer, FakeSandbox, FakeSelfHealer, StaticSubjectDirectory,
};
use devloop_core::{
    AutonomousTestExecution, OrchestratorConfig, StepTemplateRegistry, WorkflowExecution,
};
use devloop_durable::{InMemoryWorkflowStore, WorkflowStore};
use devloop_orchestrator::WorkflowOrchestrator;

pub const OWNER: &str = "owner-1";

pub struct Harness {
    pub store: Arc<InMemoryWorkflowStore>,
    pub deployer: Arc<FakePreviewDeployer>,
    pub sandbox: Arc<FakeSandbox>,
    pub healer: Arc<FakeSelfHealer>,
    pub log: CallLog,
    pub orchestrator: WorkflowOrchestrator,
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_iteration_timeout(Duration::from_secs(5))
        .with_step_timeout(Duration::from_secs(5))
}

pub struct HarnessBuilder {
    deployer: FakePreviewDeployer,
    sandbox: FakeSandbox,
    healer: FakeSelfHealer,
    config: OrchestratorConfig,
    registry: StepTemplateRegistry,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            deployer: FakePreviewDeployer::new(),
            sandbox: FakeSandbox::new(),
            healer: FakeSelfHealer::new(),
            config: test_config(),
            registry: StepTemplateRegistry::builtin(),
        }
    }

    pub fn deployer(mut self, deployer: FakePreviewDeployer) -> Self {
        self.deployer = deployer;
        self
    }

    pub fn sandbox(mut self, sandbox: FakeSandbox) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn healer(mut self, healer: FakeSelfHealer) -> Self {
        self.healer = healer;
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: StepTemplateRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn build(self) -> Harness {
        let log = CallLog::new();
        let store = Arc::new(InMemoryWorkflowStore::new());
        let deployer = Arc::new(self.deployer.with_log(log.clone()));
        let sandbox = Arc::new(self.sandbox.with_log(log.clone()));
        let healer = Arc::new(self.healer.with_log(log.clone()));

        let orchestrator = WorkflowOrchestrator::builder(
            store.clone(),
            deployer.clone(),
            sandbox.clone(),
            healer.clone(),
            Arc::new(StaticSubjectDirectory::owned_by(OWNER)),
        )
        .with_config(self.config)
        .with_registry(self.registry)
        .with_poll_interval(Duration::from_millis(10))
        .build()
        .expect("orchestrator should build");

        Harness {
            store,
            deployer,
            sandbox,
            healer,
            log,
            orchestrator,
        }
    }
}

pub fn harness() -> Harness {
    HarnessBuilder::new().build()
}

/// Poll until the execution reaches a terminal status
pub async fn wait_for_workflow(harness: &Harness, execution_id: Uuid) -> WorkflowExecution {
    for _ in 0..500 {
        let execution = harness.store.load_execution(execution_id).await.unwrap();
        if execution.is_terminal() {
            return execution;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("workflow {} never finished", execution_id);
}

/// Poll until the subject's latest test execution is terminal
pub async fn wait_for_test_loop(harness: &Harness, subject_id: Uuid) -> AutonomousTestExecution {
    for _ in 0..500 {
        if let Some(record) = harness.store.latest_test_execution(subject_id).await.unwrap() {
            if record.is_terminal() {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("test loop for subject {} never finished", subject_id);
}

/// Poll until the subject has a test execution at all
pub async fn wait_for_test_loop_start(harness: &Harness, subject_id: Uuid) -> AutonomousTestExecution {
    for _ in 0..500 {
        if let Some(record) = harness.store.latest_test_execution(subject_id).await.unwrap() {
            if record.current_iteration > 0 {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("test loop for subject {} never started", subject_id);
}

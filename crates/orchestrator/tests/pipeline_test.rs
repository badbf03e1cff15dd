//! End-to-end pipeline scenarios against the scripted collaborators

mod common;

use std::time::Duration;

use uuid::Uuid;

use common::{
    harness, test_config, wait_for_test_loop, wait_for_test_loop_start, wait_for_workflow,
    HarnessBuilder, OWNER,
};
use devloop_core::fakes::{FakePreviewDeployer, FakeSandbox, FakeSelfHealer};
use devloop_core::{
    step_names, workflow_types, AutonomousTestExecution, DeploymentStatus, ExecutionKind,
    PreviewDeployment, StepEvent, StepStatus, TestLoopStatus, WorkflowStatus,
};
use devloop_durable::WorkflowStore;
use devloop_orchestrator::OrchestratorError;

#[test_log::test(tokio::test)]
async fn test_full_pipeline_passes_on_first_attempt() {
    let h = HarnessBuilder::new()
        .sandbox(FakeSandbox::always(ExecutionKind::Test, 0))
        .build();
    let subject = Uuid::now_v7();

    let execution = h
        .orchestrator
        .run_pipeline(subject, workflow_types::FULL_PIPELINE)
        .await
        .unwrap();

    assert_eq!(execution.status, WorkflowStatus::Completed);
    assert!(execution.completed_at.is_some());
    assert!(execution
        .steps
        .iter()
        .all(|s| s.status == StepStatus::Completed && s.completed_at.is_some()));

    let record = wait_for_test_loop(&h, subject).await;
    assert_eq!(record.status, TestLoopStatus::Completed);
    assert!(record.tests_passed);
    assert_eq!(record.current_iteration, 1);
    assert_eq!(record.workflow_execution_id, Some(execution.id));
    assert_eq!(Some(record.preview_deployment_id), execution.preview_deployment_id);
    assert_eq!(h.healer.analyze_count(), 0);
    assert_eq!(h.deployer.deploy_count(), 1);
}

#[tokio::test]
async fn test_full_pipeline_exhausts_iterations() {
    let h = HarnessBuilder::new()
        .sandbox(FakeSandbox::always(ExecutionKind::Test, 1))
        .build();
    let subject = Uuid::now_v7();

    let execution = h
        .orchestrator
        .run_pipeline(subject, workflow_types::FULL_PIPELINE)
        .await
        .unwrap();

    assert_eq!(execution.status, WorkflowStatus::Failed);
    let preview = execution.step(step_names::PREVIEW_DEPLOYMENT).unwrap();
    assert_eq!(preview.status, StepStatus::Completed);
    let testing = execution.step(step_names::AUTONOMOUS_TESTING_LOOP).unwrap();
    assert_eq!(testing.status, StepStatus::Failed);
    assert_eq!(
        testing.error.as_deref(),
        Some("tests failed after 3 iterations")
    );

    let record = wait_for_test_loop(&h, subject).await;
    assert_eq!(record.status, TestLoopStatus::Failed);
    assert_eq!(record.status.to_string(), "failed");
    assert!(!record.tests_passed);
    assert_eq!(record.current_iteration, 3);
    assert!(record
        .final_test_result
        .as_deref()
        .unwrap()
        .contains("3 iterations"));

    assert_eq!(h.sandbox.call_count(ExecutionKind::Test), 3);
    assert_eq!(h.healer.analyze_count(), 3);
    // Initial preview deploy plus one redeploy per iteration
    assert_eq!(h.deployer.deploy_count(), 4);
}

#[tokio::test]
async fn test_iterations_are_strictly_sequenced() {
    let h = HarnessBuilder::new()
        .sandbox(FakeSandbox::new().with_exit_codes(ExecutionKind::Test, [1, 1, 0]))
        .build();
    let subject = Uuid::now_v7();

    let execution = h
        .orchestrator
        .run_pipeline(subject, workflow_types::FULL_PIPELINE)
        .await
        .unwrap();
    assert_eq!(execution.status, WorkflowStatus::Completed);

    assert_eq!(
        h.log.entries(),
        vec![
            "deploy",
            "sandbox:preview",
            "sandbox:test",
            "heal",
            "deploy",
            "sandbox:test",
            "heal",
            "deploy",
            "sandbox:test",
        ]
    );

    let record = wait_for_test_loop(&h, subject).await;
    assert_eq!(record.current_iteration, 3);
    assert_eq!(record.final_test_result.as_deref(), Some("passed on iteration 3"));
}

#[tokio::test]
async fn test_preview_failure_stops_pipeline() {
    let h = HarnessBuilder::new()
        .deployer(FakePreviewDeployer::failing("Deployment failed"))
        .build();
    let subject = Uuid::now_v7();

    let err = h
        .orchestrator
        .run_pipeline(subject, workflow_types::FULL_PIPELINE)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Deployment failed"));

    let execution = h
        .orchestrator
        .get_latest_execution(subject)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, WorkflowStatus::Failed);
    assert!(execution.completed_at.is_some());

    let preview = execution.step(step_names::PREVIEW_DEPLOYMENT).unwrap();
    assert_eq!(preview.status, StepStatus::Failed);
    assert!(preview.error.as_deref().unwrap().contains("Deployment failed"));

    let testing = execution.step(step_names::AUTONOMOUS_TESTING_LOOP).unwrap();
    assert_eq!(testing.status, StepStatus::Pending);
    assert!(testing.started_at.is_none());

    assert!(h.store.latest_test_execution(subject).await.unwrap().is_none());
    assert!(h.sandbox.calls().is_empty());
}

#[tokio::test]
async fn test_failed_deploy_status_fails_step() {
    let h = HarnessBuilder::new()
        .deployer(FakePreviewDeployer::new().with_status(DeploymentStatus::Failed))
        .build();
    let subject = Uuid::now_v7();

    let err = h
        .orchestrator
        .run_pipeline(subject, workflow_types::PREVIEW_ONLY)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Collaborator(_)));

    let execution = h.orchestrator.get_latest_execution(subject).await.unwrap().unwrap();
    assert_eq!(execution.status, WorkflowStatus::Failed);
    assert!(execution.steps[0]
        .error
        .as_deref()
        .unwrap()
        .contains("ended with status failed"));
}

#[tokio::test]
async fn test_single_iteration_bound() {
    let h = HarnessBuilder::new()
        .sandbox(FakeSandbox::always(ExecutionKind::Test, 1))
        .config(test_config().with_max_test_iterations(1))
        .build();
    let subject = Uuid::now_v7();

    let execution = h
        .orchestrator
        .run_pipeline(subject, workflow_types::FULL_PIPELINE)
        .await
        .unwrap();
    assert_eq!(execution.status, WorkflowStatus::Failed);

    let record = wait_for_test_loop(&h, subject).await;
    assert_eq!(record.current_iteration, 1);
    assert_eq!(record.max_iterations, 1);
    assert_eq!(
        record.final_test_result.as_deref(),
        Some("tests failed after 1 iterations")
    );
    assert_eq!(h.sandbox.call_count(ExecutionKind::Test), 1);
    assert_eq!(h.healer.analyze_count(), 1);
    assert_eq!(h.deployer.deploy_count(), 2);
}

#[tokio::test]
async fn test_healing_failure_aborts_loop_and_fails_workflow() {
    let h = HarnessBuilder::new()
        .sandbox(FakeSandbox::always(ExecutionKind::Test, 1))
        .healer(FakeSelfHealer::failing("healer crashed"))
        .build();
    let subject = Uuid::now_v7();

    let execution = h
        .orchestrator
        .run_pipeline(subject, workflow_types::FULL_PIPELINE)
        .await
        .unwrap();
    assert_eq!(execution.status, WorkflowStatus::Failed);

    let record = wait_for_test_loop(&h, subject).await;
    assert_eq!(record.current_iteration, 1);
    assert_eq!(record.error.as_deref(), Some("healer crashed"));
    assert_eq!(
        execution.steps[1].error.as_deref(),
        Some("aborted on iteration 1: healer crashed")
    );
    // Only the initial preview deploy
    assert_eq!(h.deployer.deploy_count(), 1);
}

#[tokio::test]
async fn test_testing_only_uses_latest_deployment() {
    let subject = Uuid::now_v7();
    let existing = PreviewDeployment {
        id: Uuid::now_v7(),
        subject_id: subject,
        status: DeploymentStatus::Deployed,
        url: Some("http://preview.local".to_string()),
    };
    let h = HarnessBuilder::new()
        .deployer(FakePreviewDeployer::new().with_existing(existing.clone()))
        .build();

    let execution = h
        .orchestrator
        .run_pipeline(subject, workflow_types::TESTING_ONLY)
        .await
        .unwrap();
    assert_eq!(execution.status, WorkflowStatus::Completed);

    let record = wait_for_test_loop(&h, subject).await;
    assert_eq!(record.preview_deployment_id, existing.id);
    assert_eq!(h.deployer.deploy_count(), 0);
}

#[tokio::test]
async fn test_testing_only_without_deployment_fails() {
    let h = harness();
    let subject = Uuid::now_v7();

    let err = h
        .orchestrator
        .run_pipeline(subject, workflow_types::TESTING_ONLY)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no deployed preview found"));

    let execution = h.orchestrator.get_latest_execution(subject).await.unwrap().unwrap();
    assert_eq!(execution.status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn test_polling_is_idempotent() {
    let h = harness();
    let subject = Uuid::now_v7();
    h.orchestrator
        .run_pipeline(subject, workflow_types::FULL_PIPELINE)
        .await
        .unwrap();
    wait_for_test_loop(&h, subject).await;

    let first = h.orchestrator.get_latest_execution(subject).await.unwrap();
    let second = h.orchestrator.get_latest_execution(subject).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );

    let history = h.orchestrator.get_execution_history(subject).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(Some(&history[0]), first.as_ref());
}

#[tokio::test]
async fn test_iteration_timeout_aborts_loop() {
    let subject = Uuid::now_v7();
    let existing = PreviewDeployment {
        id: Uuid::now_v7(),
        subject_id: subject,
        status: DeploymentStatus::Deployed,
        url: None,
    };
    let h = HarnessBuilder::new()
        .deployer(FakePreviewDeployer::new().with_existing(existing))
        .sandbox(FakeSandbox::new().with_delay(Duration::from_secs(10)))
        .config(test_config().with_iteration_timeout(Duration::from_millis(50)))
        .build();

    let execution = h
        .orchestrator
        .run_pipeline(subject, workflow_types::TESTING_ONLY)
        .await
        .unwrap();
    assert_eq!(execution.status, WorkflowStatus::Failed);

    let record = wait_for_test_loop(&h, subject).await;
    assert_eq!(record.status, TestLoopStatus::Failed);
    assert_eq!(record.current_iteration, 1);
    assert_eq!(
        record.error.as_deref(),
        Some("iteration 1 timed out after 50ms")
    );
    assert_eq!(h.healer.analyze_count(), 0);
}

#[tokio::test]
async fn test_step_timeout_fails_step() {
    let h = HarnessBuilder::new()
        .deployer(FakePreviewDeployer::new().with_delay(Duration::from_secs(10)))
        .config(test_config().with_step_timeout(Duration::from_millis(50)))
        .build();
    let subject = Uuid::now_v7();

    let execution = h
        .orchestrator
        .start_workflow(subject, workflow_types::PREVIEW_ONLY)
        .await
        .unwrap();
    let err = h
        .orchestrator
        .execute_step(execution.id, step_names::PREVIEW_DEPLOYMENT)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Timeout { .. }));

    let execution = h.orchestrator.get_execution(execution.id).await.unwrap();
    assert_eq!(execution.status, WorkflowStatus::Failed);
    assert_eq!(
        execution.steps[0].error.as_deref(),
        Some("step preview_deployment timed out after 50ms")
    );
}

#[tokio::test]
async fn test_cancel_workflow_stops_running_loop() {
    let h = HarnessBuilder::new()
        .sandbox(FakeSandbox::new().with_delay(Duration::from_millis(200)))
        .build();
    let subject = Uuid::now_v7();

    let execution = h
        .orchestrator
        .start_workflow(subject, workflow_types::FULL_PIPELINE)
        .await
        .unwrap();
    h.orchestrator
        .execute_step(execution.id, step_names::PREVIEW_DEPLOYMENT)
        .await
        .unwrap();
    let launched = h
        .orchestrator
        .execute_step(execution.id, step_names::AUTONOMOUS_TESTING_LOOP)
        .await
        .unwrap();
    assert_eq!(launched.status, WorkflowStatus::Running);
    assert_eq!(launched.steps[1].status, StepStatus::Running);

    wait_for_test_loop_start(&h, subject).await;
    let cancelled = h.orchestrator.cancel_workflow(execution.id).await.unwrap();
    assert_eq!(cancelled.status, WorkflowStatus::Cancelled);
    assert_eq!(cancelled.steps[0].status, StepStatus::Completed);
    assert_eq!(cancelled.steps[1].status, StepStatus::Cancelled);

    let record = h
        .store
        .latest_test_execution(subject)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TestLoopStatus::Cancelled);
    assert!(record
        .final_test_result
        .as_deref()
        .unwrap()
        .starts_with("cancelled on iteration"));
    assert_eq!(h.orchestrator.test_loops().running_count(), 0);

    // The loop never reopens the cancelled step
    let reloaded = wait_for_workflow(&h, execution.id).await;
    assert_eq!(reloaded.status, WorkflowStatus::Cancelled);
    assert_eq!(reloaded.steps[1].status, StepStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_test_execution_fails_launching_step() {
    let h = HarnessBuilder::new()
        .sandbox(FakeSandbox::new().with_delay(Duration::from_millis(200)))
        .build();
    let subject = Uuid::now_v7();

    let execution = h
        .orchestrator
        .start_workflow(subject, workflow_types::FULL_PIPELINE)
        .await
        .unwrap();
    h.orchestrator
        .execute_step(execution.id, step_names::PREVIEW_DEPLOYMENT)
        .await
        .unwrap();
    h.orchestrator
        .execute_step(execution.id, step_names::AUTONOMOUS_TESTING_LOOP)
        .await
        .unwrap();

    let running = wait_for_test_loop_start(&h, subject).await;
    let record = h.orchestrator.cancel_test_execution(running.id).await.unwrap();
    assert_eq!(record.status, TestLoopStatus::Cancelled);
    assert!(!record.tests_passed);

    let execution = wait_for_workflow(&h, execution.id).await;
    assert_eq!(execution.status, WorkflowStatus::Failed);
    assert_eq!(execution.steps[1].status, StepStatus::Failed);
    assert_eq!(
        execution.steps[1].error.as_deref(),
        Some("cancelled on iteration 1")
    );

    let err = h
        .orchestrator
        .cancel_test_execution(running.id)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyTerminal { .. }));
}

#[tokio::test]
async fn test_standalone_test_loop() {
    let h = HarnessBuilder::new()
        .sandbox(FakeSandbox::new().with_exit_codes(ExecutionKind::Test, [1, 0]))
        .build();
    let subject = Uuid::now_v7();

    let launched = h
        .orchestrator
        .start_test_loop(subject, Uuid::now_v7(), 5)
        .await
        .unwrap();
    assert_eq!(launched.status, TestLoopStatus::Running);
    assert!(launched.workflow_execution_id.is_none());

    let record = wait_for_test_loop(&h, subject).await;
    assert_eq!(record.id, launched.id);
    assert_eq!(record.status, TestLoopStatus::Completed);
    assert_eq!(record.current_iteration, 2);
    assert!(record.completed_at.is_some());

    let history = h.orchestrator.get_test_execution_history(subject).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(h.orchestrator.get_latest_execution(subject).await.unwrap().is_none());
}

#[tokio::test]
async fn test_concurrent_pipelines_share_deploy_slot() {
    let h = HarnessBuilder::new()
        .deployer(FakePreviewDeployer::new().with_delay(Duration::from_millis(30)))
        .build();
    let subject = Uuid::now_v7();

    let (first, second) = tokio::join!(
        h.orchestrator
            .run_pipeline(subject, workflow_types::PREVIEW_ONLY),
        h.orchestrator
            .run_pipeline(subject, workflow_types::PREVIEW_ONLY),
    );
    assert_eq!(first.unwrap().status, WorkflowStatus::Completed);
    assert_eq!(second.unwrap().status, WorkflowStatus::Completed);

    assert_eq!(h.deployer.deploy_count(), 2);
    assert_eq!(h.deployer.max_concurrent(), 1);
}

#[tokio::test]
async fn test_metrics_after_mixed_runs() {
    let passing = HarnessBuilder::new().build();
    let subject = Uuid::now_v7();
    passing
        .orchestrator
        .run_pipeline(subject, workflow_types::FULL_PIPELINE)
        .await
        .unwrap();
    let _ = passing
        .orchestrator
        .run_pipeline(Uuid::now_v7(), "no-such-type")
        .await;
    wait_for_test_loop(&passing, subject).await;

    let metrics = passing.orchestrator.metrics().await.unwrap();
    assert_eq!(metrics.total, 1);
    assert_eq!(metrics.completed, 1);
    assert_eq!(metrics.success_rate, 100.0);

    let stats = passing.orchestrator.test_stats().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.pass_rate, 100.0);
    assert_eq!(stats.average_iterations, 1.0);
}

#[tokio::test]
async fn test_cancelling_old_execution_leaves_newer_loop_running() {
    let h = HarnessBuilder::new()
        .sandbox(FakeSandbox::new().with_delay(Duration::from_millis(300)))
        .build();
    let subject = Uuid::now_v7();

    // No deployment yet, so the testing-only run fails
    h.orchestrator
        .run_pipeline(subject, workflow_types::TESTING_ONLY)
        .await
        .unwrap_err();
    let stale = h.orchestrator.get_latest_execution(subject).await.unwrap().unwrap();
    assert_eq!(stale.status, WorkflowStatus::Failed);

    let active = h
        .orchestrator
        .start_workflow(subject, workflow_types::FULL_PIPELINE)
        .await
        .unwrap();
    h.orchestrator
        .execute_step(active.id, step_names::PREVIEW_DEPLOYMENT)
        .await
        .unwrap();
    h.orchestrator
        .execute_step(active.id, step_names::AUTONOMOUS_TESTING_LOOP)
        .await
        .unwrap();
    let running = wait_for_test_loop_start(&h, subject).await;
    assert_eq!(running.workflow_execution_id, Some(active.id));

    let cancelled = h.orchestrator.cancel_workflow(stale.id).await.unwrap();
    assert_eq!(cancelled.status, WorkflowStatus::Cancelled);
    assert!(h.orchestrator.test_loops().is_running(running.id));

    let active = wait_for_workflow(&h, active.id).await;
    assert_eq!(active.status, WorkflowStatus::Completed);
    assert_eq!(active.steps[1].status, StepStatus::Completed);

    let record = h.orchestrator.get_test_execution(running.id).await.unwrap();
    assert_eq!(record.status, TestLoopStatus::Completed);
    assert_eq!(record.final_test_result.as_deref(), Some("passed on iteration 1"));
}

#[tokio::test]
async fn test_cancel_finishes_loop_left_by_another_process() {
    let h = harness();
    let subject = Uuid::now_v7();

    let execution = h
        .orchestrator
        .start_workflow(subject, workflow_types::FULL_PIPELINE)
        .await
        .unwrap();
    let execution = h
        .orchestrator
        .execute_step(execution.id, step_names::PREVIEW_DEPLOYMENT)
        .await
        .unwrap();

    // Testing step left running with a loop record no task here owns
    let mut launched = h.store.load_execution(execution.id).await.unwrap();
    let started = StepEvent::started(step_names::AUTONOMOUS_TESTING_LOOP);
    launched.steps[1].apply(&started);
    h.store.commit(&launched, &[started]).await.unwrap();

    let mut orphan = AutonomousTestExecution::new(
        subject,
        OWNER,
        execution.preview_deployment_id.unwrap(),
        3,
    )
    .for_workflow(execution.id);
    orphan.current_iteration = 2;
    h.store.create_test_execution(&orphan).await.unwrap();
    assert!(!h.orchestrator.test_loops().is_running(orphan.id));

    let record = h.orchestrator.cancel_test_execution(orphan.id).await.unwrap();
    assert_eq!(record.status, TestLoopStatus::Cancelled);
    assert!(!record.tests_passed);
    assert!(record.completed_at.is_some());
    assert_eq!(record.final_test_result.as_deref(), Some("cancelled on iteration 2"));

    let stored = h.orchestrator.get_test_execution(orphan.id).await.unwrap();
    assert_eq!(stored.status, TestLoopStatus::Cancelled);

    let execution = h.orchestrator.get_execution(execution.id).await.unwrap();
    assert_eq!(execution.status, WorkflowStatus::Failed);
    assert!(execution.completed_at.is_some());
    let testing = execution.step(step_names::AUTONOMOUS_TESTING_LOOP).unwrap();
    assert_eq!(testing.status, StepStatus::Failed);
    assert_eq!(testing.error.as_deref(), Some("cancelled on iteration 2"));
}

//! Scripted in-process collaborators
//!
//! Used by unit and integration tests across the workspace and by the CLI's
//! `--fake` mode. Every fake counts its calls and can append to a shared
//! [`CallLog`] so tests can assert cross-service ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::collaborators::{
    DeploymentStatus, ExecutionKind, HealingReport, PreviewDeployer, PreviewDeployment,
    SandboxCommand, SandboxExecutor, SandboxRun, SelfHealer, SubjectDirectory,
};
use crate::error::CollaboratorError;

/// Ordered record of collaborator calls shared between fakes
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }
}

/// Sleep for `delay`, returning early with `Cancelled` if the token fires
async fn pause(delay: Option<Duration>, cancel: &CancellationToken) -> Result<(), CollaboratorError> {
    if cancel.is_cancelled() {
        return Err(CollaboratorError::Cancelled);
    }
    if let Some(delay) = delay {
        tokio::select! {
            _ = cancel.cancelled() => return Err(CollaboratorError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
    Ok(())
}

// ============================================================================
// Preview deployer
// ============================================================================

/// Deployer that records every deployment it makes
#[derive(Debug, Default)]
pub struct FakePreviewDeployer {
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    status: Mutex<Option<DeploymentStatus>>,
    failure: Mutex<Option<String>>,
    fail_from_call: Option<usize>,
    delay: Option<Duration>,
    deployments: Mutex<Vec<PreviewDeployment>>,
    log: Option<CallLog>,
}

impl FakePreviewDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every deploy fails with `message`
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Mutex::new(Some(message.into())),
            ..Self::default()
        }
    }

    /// Deploy calls from the `n`th (1-based) onwards fail with `message`
    pub fn failing_from_call(mut self, n: usize, message: impl Into<String>) -> Self {
        self.fail_from_call = Some(n);
        *self.failure.get_mut() = Some(message.into());
        self
    }

    /// Report `status` instead of `Deployed`
    pub fn with_status(self, status: DeploymentStatus) -> Self {
        *self.status.lock() = Some(status);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Seed an existing deployment (as if made outside this process)
    pub fn with_existing(self, deployment: PreviewDeployment) -> Self {
        self.deployments.lock().push(deployment);
        self
    }

    pub fn deploy_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of deploys observed in flight at once
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn deployments(&self) -> Vec<PreviewDeployment> {
        self.deployments.lock().clone()
    }

    fn should_fail(&self, call: usize) -> Option<String> {
        let failure = self.failure.lock().clone()?;
        match self.fail_from_call {
            Some(n) if call < n => None,
            _ => Some(failure),
        }
    }
}

#[async_trait]
impl PreviewDeployer for FakePreviewDeployer {
    async fn deploy(
        &self,
        subject_id: Uuid,
        _owner_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PreviewDeployment, CollaboratorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(log) = &self.log {
            log.record("deploy");
        }

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        let paused = pause(self.delay, cancel).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        paused?;

        if let Some(message) = self.should_fail(call) {
            return Err(CollaboratorError::Failed(message));
        }

        let status = (*self.status.lock()).unwrap_or(DeploymentStatus::Deployed);
        let id = Uuid::now_v7();
        let deployment = PreviewDeployment {
            id,
            subject_id,
            status,
            url: Some(format!("http://preview-{}.local", id.simple())),
        };
        self.deployments.lock().push(deployment.clone());
        Ok(deployment)
    }

    async fn latest_deployment(
        &self,
        subject_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<PreviewDeployment>, CollaboratorError> {
        pause(None, cancel).await?;
        Ok(self
            .deployments
            .lock()
            .iter()
            .rev()
            .find(|d| d.subject_id == subject_id && d.is_deployed())
            .cloned())
    }
}

// ============================================================================
// Sandbox
// ============================================================================

/// Sandbox with scripted exit codes per execution kind
///
/// Each kind consumes its script in order; the last code repeats once the
/// script runs out. Kinds without a script exit 0.
#[derive(Debug, Default)]
pub struct FakeSandbox {
    scripts: Mutex<HashMap<ExecutionKind, Vec<i32>>>,
    cursors: Mutex<HashMap<ExecutionKind, usize>>,
    failure: Option<String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<(Uuid, SandboxCommand)>>,
    log: Option<CallLog>,
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command of `kind` exits with `code`
    pub fn always(kind: ExecutionKind, code: i32) -> Self {
        Self::new().with_exit_codes(kind, [code])
    }

    /// Every call fails before producing an exit code
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_exit_codes(self, kind: ExecutionKind, codes: impl IntoIterator<Item = i32>) -> Self {
        self.scripts.lock().insert(kind, codes.into_iter().collect());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn calls(&self) -> Vec<(Uuid, SandboxCommand)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, kind: ExecutionKind) -> usize {
        self.calls.lock().iter().filter(|(_, c)| c.kind == kind).count()
    }

    fn next_exit_code(&self, kind: ExecutionKind) -> i32 {
        let scripts = self.scripts.lock();
        let Some(script) = scripts.get(&kind).filter(|s| !s.is_empty()) else {
            return 0;
        };
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(kind).or_insert(0);
        let code = script[(*cursor).min(script.len() - 1)];
        *cursor += 1;
        code
    }
}

#[async_trait]
impl SandboxExecutor for FakeSandbox {
    async fn execute(
        &self,
        subject_id: Uuid,
        command: &SandboxCommand,
        cancel: &CancellationToken,
    ) -> Result<SandboxRun, CollaboratorError> {
        self.calls.lock().push((subject_id, command.clone()));
        if let Some(log) = &self.log {
            log.record(format!("sandbox:{}", command.kind));
        }

        pause(self.delay, cancel).await?;

        if let Some(message) = &self.failure {
            return Err(CollaboratorError::Failed(message.clone()));
        }

        let exit_code = self.next_exit_code(command.kind);
        Ok(SandboxRun {
            id: Uuid::now_v7(),
            status: "completed".to_string(),
            exit_code,
            error_log: (exit_code != 0).then(|| format!("{} exited with {}", command.command, exit_code)),
        })
    }
}

// ============================================================================
// Self-healer
// ============================================================================

#[derive(Debug, Default)]
pub struct FakeSelfHealer {
    calls: AtomicUsize,
    failure: Option<String>,
    delay: Option<Duration>,
    log: Option<CallLog>,
}

impl FakeSelfHealer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn analyze_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SelfHealer for FakeSelfHealer {
    async fn analyze(
        &self,
        _subject_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<HealingReport, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(log) = &self.log {
            log.record("heal");
        }

        pause(self.delay, cancel).await?;

        if let Some(message) = &self.failure {
            return Err(CollaboratorError::Failed(message.clone()));
        }

        Ok(HealingReport {
            status: "healed".to_string(),
            failed_tests_count: 1,
            healed_tests: vec!["fake::failing_test".to_string()],
            failed_test_details: Vec::new(),
        })
    }
}

// ============================================================================
// Subject directory
// ============================================================================

/// Directory with fixed owners and an optional fallback owner
#[derive(Debug, Default)]
pub struct StaticSubjectDirectory {
    owners: HashMap<Uuid, String>,
    fallback: Option<String>,
}

impl StaticSubjectDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subject belongs to `owner`
    pub fn owned_by(owner: impl Into<String>) -> Self {
        Self {
            fallback: Some(owner.into()),
            ..Self::default()
        }
    }

    pub fn with_owner(mut self, subject_id: Uuid, owner: impl Into<String>) -> Self {
        self.owners.insert(subject_id, owner.into());
        self
    }
}

#[async_trait]
impl SubjectDirectory for StaticSubjectDirectory {
    async fn owner_of(
        &self,
        subject_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<String, CollaboratorError> {
        pause(None, cancel).await?;
        self.owners
            .get(&subject_id)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or(CollaboratorError::SubjectNotFound(subject_id))
    }
}

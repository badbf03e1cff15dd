//! Collaborator contracts
//!
//! The orchestrator never provisions containers, runs shell commands or edits
//! source itself. It talks to four external services through these traits,
//! with real HTTP clients or in-process fakes bound at construction time.
//!
//! Every call takes a [`CancellationToken`]. Implementations should stop
//! waiting and return [`CollaboratorError::Cancelled`] once it fires.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::CollaboratorError;

/// Terminal or in-flight state of a preview deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Deploying,
    Deployed,
    Failed,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deploying => write!(f, "deploying"),
            Self::Deployed => write!(f, "deployed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Result of a deploy call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewDeployment {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub status: DeploymentStatus,
    pub url: Option<String>,
}

impl PreviewDeployment {
    pub fn is_deployed(&self) -> bool {
        self.status == DeploymentStatus::Deployed
    }
}

/// What a sandbox command is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    Build,
    Test,
    Preview,
}

impl ExecutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Test => "test",
            Self::Preview => "preview",
        }
    }
}

impl std::fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command to run against a subject in an isolated environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxCommand {
    pub kind: ExecutionKind,
    pub command: String,
    /// Isolation mode understood by the sandbox service (e.g. "container")
    pub isolation: String,
}

impl SandboxCommand {
    pub fn new(kind: ExecutionKind, command: impl Into<String>, isolation: impl Into<String>) -> Self {
        Self {
            kind,
            command: command.into(),
            isolation: isolation.into(),
        }
    }
}

/// Outcome of a sandbox command
///
/// A non-zero `exit_code` is a test or build failure, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxRun {
    pub id: Uuid,
    pub status: String,
    pub exit_code: i32,
    #[serde(default)]
    pub error_log: Option<String>,
}

impl SandboxRun {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Report returned by the self-healing service after it modified the subject
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealingReport {
    pub status: String,
    pub failed_tests_count: u32,
    #[serde(default)]
    pub healed_tests: Vec<String>,
    #[serde(default)]
    pub failed_test_details: Vec<String>,
}

/// Provisions preview deployments
#[async_trait]
pub trait PreviewDeployer: Send + Sync {
    /// Deploy the subject's current source and wait for a terminal status
    async fn deploy(
        &self,
        subject_id: Uuid,
        owner_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PreviewDeployment, CollaboratorError>;

    /// Most recent `Deployed` deployment for the subject, if any
    async fn latest_deployment(
        &self,
        subject_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<PreviewDeployment>, CollaboratorError>;
}

/// Runs commands against a subject in isolation
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn execute(
        &self,
        subject_id: Uuid,
        command: &SandboxCommand,
        cancel: &CancellationToken,
    ) -> Result<SandboxRun, CollaboratorError>;
}

/// Analyzes failing tests and rewrites the subject's source to fix them
#[async_trait]
pub trait SelfHealer: Send + Sync {
    async fn analyze(
        &self,
        subject_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<HealingReport, CollaboratorError>;
}

/// Resolves the owning user of a subject
#[async_trait]
pub trait SubjectDirectory: Send + Sync {
    async fn owner_of(
        &self,
        subject_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<String, CollaboratorError>;
}

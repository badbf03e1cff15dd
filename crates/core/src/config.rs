// Orchestrator configuration
//
// Read from the environment with defaults for everything; builder setters for
// tests and embedders.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collaborators::ExecutionKind;

pub const DEFAULT_MAX_TEST_ITERATIONS: u32 = 3;
pub const DEFAULT_TEST_COMMAND: &str = "npm test";
pub const DEFAULT_SMOKE_BUILD_COMMAND: &str = "npm run build && npm run preview";
pub const DEFAULT_SANDBOX_ISOLATION: &str = "container";

/// Settings shared by the state machine, the step executors and the loop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Iteration bound passed to the autonomous testing loop
    pub max_test_iterations: u32,

    /// Upper bound for one loop iteration (sandbox + heal + redeploy)
    #[serde(with = "duration_millis")]
    pub iteration_timeout: Duration,

    /// Upper bound for a synchronous step executor
    #[serde(with = "duration_millis")]
    pub step_timeout: Duration,

    pub test_command: String,
    pub smoke_build_command: String,
    pub sandbox_isolation: String,

    pub preview_service_url: String,
    pub sandbox_service_url: String,
    pub healing_service_url: String,
    pub subject_service_url: String,

    /// PostgreSQL connection string; the in-memory store is used when unset
    pub database_url: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_test_iterations: DEFAULT_MAX_TEST_ITERATIONS,
            iteration_timeout: Duration::from_secs(900),
            step_timeout: Duration::from_secs(1800),
            test_command: DEFAULT_TEST_COMMAND.to_string(),
            smoke_build_command: DEFAULT_SMOKE_BUILD_COMMAND.to_string(),
            sandbox_isolation: DEFAULT_SANDBOX_ISOLATION.to_string(),
            preview_service_url: "http://localhost:9101".to_string(),
            sandbox_service_url: "http://localhost:9102".to_string(),
            healing_service_url: "http://localhost:9103".to_string(),
            subject_service_url: "http://localhost:9104".to_string(),
            database_url: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Unset or unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_test_iterations: env_parse("MAX_TEST_ITERATIONS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_test_iterations),
            iteration_timeout: env_parse("ITERATION_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.iteration_timeout),
            step_timeout: env_parse("STEP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.step_timeout),
            test_command: env_string("TEST_COMMAND").unwrap_or(defaults.test_command),
            smoke_build_command: env_string("SMOKE_BUILD_COMMAND")
                .unwrap_or(defaults.smoke_build_command),
            sandbox_isolation: env_string("SANDBOX_ISOLATION")
                .unwrap_or(defaults.sandbox_isolation),
            preview_service_url: env_string("PREVIEW_SERVICE_URL")
                .unwrap_or(defaults.preview_service_url),
            sandbox_service_url: env_string("SANDBOX_SERVICE_URL")
                .unwrap_or(defaults.sandbox_service_url),
            healing_service_url: env_string("HEALING_SERVICE_URL")
                .unwrap_or(defaults.healing_service_url),
            subject_service_url: env_string("SUBJECT_SERVICE_URL")
                .unwrap_or(defaults.subject_service_url),
            database_url: env_string("DATABASE_URL"),
        }
    }

    pub fn with_max_test_iterations(mut self, max: u32) -> Self {
        self.max_test_iterations = max;
        self
    }

    pub fn with_iteration_timeout(mut self, timeout: Duration) -> Self {
        self.iteration_timeout = timeout;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_test_command(mut self, command: impl Into<String>) -> Self {
        self.test_command = command.into();
        self
    }

    pub fn with_smoke_build_command(mut self, command: impl Into<String>) -> Self {
        self.smoke_build_command = command.into();
        self
    }

    pub fn with_sandbox_isolation(mut self, isolation: impl Into<String>) -> Self {
        self.sandbox_isolation = isolation.into();
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Sandbox command used by the preview step to verify the artifact boots
    pub fn smoke_build(&self) -> crate::SandboxCommand {
        crate::SandboxCommand::new(
            ExecutionKind::Preview,
            &self.smoke_build_command,
            &self.sandbox_isolation,
        )
    }

    /// Sandbox command run on every loop iteration
    pub fn test_run(&self) -> crate::SandboxCommand {
        crate::SandboxCommand::new(
            ExecutionKind::Test,
            &self.test_command,
            &self.sandbox_isolation,
        )
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Serde support for Duration as milliseconds
///
/// Use with `#[serde(with = "devloop_core::config::duration_millis")]`.
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

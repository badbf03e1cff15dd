//! Timeout enforcement for collaborator calls and loop iterations

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Timeout-related errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeoutError {
    /// The operation did not finish within its limit
    #[error("timed out after {}", format_duration(*limit))]
    Elapsed { limit: Duration },
}

impl TimeoutError {
    pub fn limit(&self) -> Duration {
        match self {
            TimeoutError::Elapsed { limit } => *limit,
        }
    }
}

/// Run `future` with an upper bound on its duration
///
/// The future is dropped when the limit expires, which abandons any
/// collaborator call it was awaiting.
pub async fn with_timeout<F, T>(limit: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| TimeoutError::Elapsed { limit })
}

/// Render a duration the way operators write it: `250ms`, `15s`, `2m30s`, `1h5m`
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    if total_secs == 0 {
        return format!("{}ms", duration.as_millis());
    }

    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    if seconds > 0 || out.is_empty() {
        out.push_str(&format!("{}s", seconds));
    }
    out
}

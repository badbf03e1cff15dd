//! # Devloop durable storage
//!
//! Persistence and reliability primitives for the devloop orchestrator.
//!
//! ## Features
//!
//! - **Event-sourced steps**: step transitions are appended to a per-execution
//!   log and folded on read; writers use optimistic concurrency on the log
//!   sequence
//! - **Two backends**: an in-memory store for tests and local runs, and a
//!   PostgreSQL store with embedded migrations
//! - **Reliability**: conflict retry with exponential backoff and jitter,
//!   timeout enforcement for long-running collaborator calls
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WorkflowOrchestrator                     │
//! │   (loads, applies step events, commits at expected seq)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkflowStore                         │
//! │  (devloop_workflow_executions, step_events, test runs)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod persistence;
pub mod reliability;

/// Prelude for common imports
pub mod prelude {
    pub use crate::persistence::{
        ExecutionFilter, InMemoryWorkflowStore, PostgresWorkflowStore, RecordedStepEvent,
        StoreError, WorkflowStore,
    };
    pub use crate::reliability::{with_timeout, RetryPolicy, TimeoutError};
}

// Re-export key types at crate root
pub use persistence::{
    ExecutionFilter, InMemoryWorkflowStore, PostgresWorkflowStore, RecordedStepEvent, StoreError,
    WorkflowStore, LIST_LIMIT,
};
pub use reliability::{format_duration, with_timeout, ConflictError, RetryPolicy, TimeoutError};

//! Persistence layer
//!
//! - [`WorkflowStore`] trait for workflow and test execution persistence
//! - [`InMemoryWorkflowStore`] for tests and local runs
//! - [`PostgresWorkflowStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowStore;
pub use postgres::{PostgresWorkflowStore, MIGRATOR};
pub use store::{ExecutionFilter, RecordedStepEvent, StoreError, WorkflowStore, LIST_LIMIT};

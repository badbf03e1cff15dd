//! In-memory implementation of WorkflowStore for tests and local runs

use std::cmp::Reverse;
use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use devloop_core::{fold_steps, AutonomousTestExecution, StepEvent, WorkflowExecution};

use super::store::*;

/// Stored execution: header plus the event log it folds from
struct ExecutionRecord {
    header: WorkflowExecution,
    step_names: Vec<String>,
    events: Vec<StepEvent>,
}

impl ExecutionRecord {
    fn materialize(&self) -> WorkflowExecution {
        let mut execution = self.header.clone();
        execution.steps = fold_steps(&self.step_names, &self.events);
        execution.sequence = self.events.len() as i32;
        execution
    }
}

/// In-memory implementation of WorkflowStore
///
/// Same semantics as the PostgreSQL implementation, including optimistic
/// concurrency on the step event log.
///
/// # Example
///
/// ```
/// use devloop_durable::InMemoryWorkflowStore;
///
/// let store = InMemoryWorkflowStore::new();
/// assert_eq!(store.execution_count(), 0);
/// ```
pub struct InMemoryWorkflowStore {
    executions: RwLock<HashMap<Uuid, ExecutionRecord>>,
    test_executions: RwLock<HashMap<Uuid, AutonomousTestExecution>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
            test_executions: RwLock::new(HashMap::new()),
        }
    }

    pub fn execution_count(&self) -> usize {
        self.executions.read().len()
    }

    pub fn test_execution_count(&self) -> usize {
        self.test_executions.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.executions.write().clear();
        self.test_executions.write().clear();
    }

    fn collect_executions<F>(&self, limit: usize, mut predicate: F) -> Vec<WorkflowExecution>
    where
        F: FnMut(&WorkflowExecution) -> bool,
    {
        let executions = self.executions.read();
        let mut matching: Vec<WorkflowExecution> = executions
            .values()
            .map(ExecutionRecord::materialize)
            .filter(|e| predicate(e))
            .collect();
        matching.sort_by_key(|e| Reverse((e.created_at, e.id)));
        matching.truncate(limit);
        matching
    }

    fn collect_test_executions<F>(&self, limit: usize, predicate: F) -> Vec<AutonomousTestExecution>
    where
        F: Fn(&AutonomousTestExecution) -> bool,
    {
        let tests = self.test_executions.read();
        let mut matching: Vec<AutonomousTestExecution> =
            tests.values().filter(|t| predicate(t)).cloned().collect();
        matching.sort_by_key(|t| Reverse((t.created_at, t.id)));
        matching.truncate(limit);
        matching
    }
}

impl Default for InMemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        executions.insert(
            execution.id,
            ExecutionRecord {
                header: execution.clone(),
                step_names: execution.step_names(),
                events: Vec::new(),
            },
        );
        Ok(())
    }

    async fn load_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution, StoreError> {
        self.executions
            .read()
            .get(&execution_id)
            .map(ExecutionRecord::materialize)
            .ok_or(StoreError::ExecutionNotFound(execution_id))
    }

    async fn commit(
        &self,
        execution: &WorkflowExecution,
        events: &[StepEvent],
    ) -> Result<i32, StoreError> {
        let mut executions = self.executions.write();
        let record = executions
            .get_mut(&execution.id)
            .ok_or(StoreError::ExecutionNotFound(execution.id))?;

        let current = record.events.len() as i32;
        if current != execution.sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: execution.sequence,
                actual: current,
            });
        }

        record.events.extend_from_slice(events);
        record.header.status = execution.status;
        record.header.retry_count = execution.retry_count;
        record.header.preview_deployment_id = execution.preview_deployment_id;
        record.header.updated_at = execution.updated_at;
        record.header.completed_at = execution.completed_at;

        Ok(record.events.len() as i32)
    }

    async fn load_step_events(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<RecordedStepEvent>, StoreError> {
        let executions = self.executions.read();
        let record = executions
            .get(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;
        Ok(record
            .events
            .iter()
            .enumerate()
            .map(|(i, event)| RecordedStepEvent {
                sequence: i as i32,
                event: event.clone(),
            })
            .collect())
    }

    async fn latest_execution(
        &self,
        subject_id: Uuid,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self
            .collect_executions(1, |e| e.subject_id == subject_id)
            .into_iter()
            .next())
    }

    async fn execution_history(
        &self,
        subject_id: Uuid,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        Ok(self.collect_executions(usize::MAX, |e| e.subject_id == subject_id))
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        Ok(self.collect_executions(limit, |e| filter.matches(e)))
    }

    async fn create_test_execution(
        &self,
        execution: &AutonomousTestExecution,
    ) -> Result<(), StoreError> {
        self.test_executions
            .write()
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_test_execution(
        &self,
        execution: &AutonomousTestExecution,
    ) -> Result<(), StoreError> {
        let mut tests = self.test_executions.write();
        let stored = tests
            .get_mut(&execution.id)
            .ok_or(StoreError::TestExecutionNotFound(execution.id))?;
        if stored.is_terminal() {
            return Err(StoreError::TestExecutionTerminal(execution.id));
        }
        *stored = execution.clone();
        Ok(())
    }

    async fn get_test_execution(&self, id: Uuid) -> Result<AutonomousTestExecution, StoreError> {
        self.test_executions
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::TestExecutionNotFound(id))
    }

    async fn latest_test_execution(
        &self,
        subject_id: Uuid,
    ) -> Result<Option<AutonomousTestExecution>, StoreError> {
        Ok(self
            .collect_test_executions(1, |t| t.subject_id == subject_id)
            .into_iter()
            .next())
    }

    async fn test_execution_history(
        &self,
        subject_id: Uuid,
    ) -> Result<Vec<AutonomousTestExecution>, StoreError> {
        Ok(self.collect_test_executions(usize::MAX, |t| t.subject_id == subject_id))
    }

    async fn test_executions_for_workflow(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<AutonomousTestExecution>, StoreError> {
        Ok(self.collect_test_executions(usize::MAX, |t| {
            t.workflow_execution_id == Some(workflow_execution_id)
        }))
    }

    async fn list_test_executions(
        &self,
        limit: usize,
    ) -> Result<Vec<AutonomousTestExecution>, StoreError> {
        Ok(self.collect_test_executions(limit, |_| true))
    }
}

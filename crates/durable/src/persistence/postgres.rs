//! PostgreSQL implementation of WorkflowStore
//!
//! - Step transitions are rows in `devloop_step_events`, folded on read
//! - `commit` locks the execution row, checks the event count against the
//!   caller's sequence, then appends and updates the header in one transaction
//! - Terminal test executions are protected by a status guard in the UPDATE

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use devloop_core::{
    fold_steps, AutonomousTestExecution, StepEvent, StepStatus, TestLoopStatus,
    WorkflowExecution, WorkflowStatus,
};

use super::store::*;

/// Migrations for the devloop tables
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const EXECUTION_COLUMNS: &str = "id, subject_id, workflow_type, status, step_names, retry_count, \
     preview_deployment_id, created_at, updated_at, completed_at";

const TEST_EXECUTION_COLUMNS: &str = "id, subject_id, owner_id, workflow_execution_id, \
     preview_deployment_id, max_iterations, current_iteration, status, tests_passed, \
     final_test_result, error, total_duration_ms, created_at, updated_at, completed_at";

/// PostgreSQL implementation of WorkflowStore
///
/// # Example
///
/// ```ignore
/// use devloop_durable::PostgresWorkflowStore;
///
/// let store = PostgresWorkflowStore::connect("postgres://localhost/devloop").await?;
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool to `database_url`
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(db_error)?;
        Ok(Self::new(pool))
    }

    /// Apply pending migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_events(&self, execution_id: Uuid) -> Result<Vec<RecordedStepEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence_num, step_name, status, error, occurred_at
            FROM devloop_step_events
            WHERE execution_id = $1
            ORDER BY sequence_num
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_event).collect()
    }

    async fn materialize(&self, row: &PgRow) -> Result<WorkflowExecution, StoreError> {
        let mut execution = row_to_execution_header(row)?;
        let step_names: Vec<String> = serde_json::from_value(row.get("step_names"))
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let events = self.fetch_events(execution.id).await?;
        let events: Vec<StepEvent> = events.into_iter().map(|e| e.event).collect();
        execution.steps = fold_steps(&step_names, &events);
        execution.sequence = events.len() as i32;
        Ok(execution)
    }

    async fn materialize_all(&self, rows: &[PgRow]) -> Result<Vec<WorkflowExecution>, StoreError> {
        let mut executions = Vec::with_capacity(rows.len());
        for row in rows {
            executions.push(self.materialize(row).await?);
        }
        Ok(executions)
    }

    async fn query_test_executions(
        &self,
        where_clause: &str,
        id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<AutonomousTestExecution>, StoreError> {
        let sql = format!(
            "SELECT {} FROM devloop_autonomous_test_executions {} \
             ORDER BY created_at DESC, id DESC LIMIT {}",
            TEST_EXECUTION_COLUMNS,
            where_clause,
            limit.min(i64::MAX as usize)
        );
        let mut query = sqlx::query(&sql);
        if let Some(id) = id {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db_error)?;
        rows.iter().map(row_to_test_execution).collect()
    }
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    #[instrument(skip(self, execution), fields(execution_id = %execution.id))]
    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        let step_names = serde_json::to_value(execution.step_names())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO devloop_workflow_executions
                (id, subject_id, workflow_type, status, step_names, retry_count,
                 preview_deployment_id, created_at, updated_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(execution.id)
        .bind(execution.subject_id)
        .bind(&execution.workflow_type)
        .bind(execution.status.as_str())
        .bind(&step_names)
        .bind(execution.retry_count as i32)
        .bind(execution.preview_deployment_id)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .bind(execution.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create workflow execution: {}", e);
            db_error(e)
        })?;

        debug!(subject_id = %execution.subject_id, workflow_type = %execution.workflow_type, "created workflow execution");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution, StoreError> {
        let sql = format!(
            "SELECT {} FROM devloop_workflow_executions WHERE id = $1",
            EXECUTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;

        self.materialize(&row).await
    }

    #[instrument(skip(self, execution, events), fields(execution_id = %execution.id, expected = execution.sequence))]
    async fn commit(
        &self,
        execution: &WorkflowExecution,
        events: &[StepEvent],
    ) -> Result<i32, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // Lock the header row so concurrent commits serialize here
        sqlx::query("SELECT id FROM devloop_workflow_executions WHERE id = $1 FOR UPDATE")
            .bind(execution.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error)?
            .ok_or(StoreError::ExecutionNotFound(execution.id))?;

        let row = sqlx::query(
            "SELECT COUNT(*) AS event_count FROM devloop_step_events WHERE execution_id = $1",
        )
        .bind(execution.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;
        let current: i32 = row.get::<i64, _>("event_count") as i32;

        if current != execution.sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: execution.sequence,
                actual: current,
            });
        }

        let mut sequence = current;
        for event in events {
            sqlx::query(
                r#"
                INSERT INTO devloop_step_events
                    (execution_id, sequence_num, step_name, status, error, occurred_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(execution.id)
            .bind(sequence)
            .bind(&event.name)
            .bind(event.status.as_str())
            .bind(&event.error)
            .bind(event.at)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
            sequence += 1;
        }

        sqlx::query(
            r#"
            UPDATE devloop_workflow_executions
            SET status = $2, retry_count = $3, preview_deployment_id = $4,
                updated_at = $5, completed_at = $6
            WHERE id = $1
            "#,
        )
        .bind(execution.id)
        .bind(execution.status.as_str())
        .bind(execution.retry_count as i32)
        .bind(execution.preview_deployment_id)
        .bind(execution.updated_at)
        .bind(execution.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;

        debug!(sequence, appended = events.len(), "committed step events");
        Ok(sequence)
    }

    #[instrument(skip(self))]
    async fn load_step_events(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<RecordedStepEvent>, StoreError> {
        // Distinguish "no events yet" from "no such execution"
        self.load_execution(execution_id).await?;
        self.fetch_events(execution_id).await
    }

    #[instrument(skip(self))]
    async fn latest_execution(
        &self,
        subject_id: Uuid,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        let sql = format!(
            "SELECT {} FROM devloop_workflow_executions WHERE subject_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT 1",
            EXECUTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(subject_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        match row {
            Some(row) => Ok(Some(self.materialize(&row).await?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn execution_history(
        &self,
        subject_id: Uuid,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let sql = format!(
            "SELECT {} FROM devloop_workflow_executions WHERE subject_id = $1 \
             ORDER BY created_at DESC, id DESC",
            EXECUTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(subject_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        self.materialize_all(&rows).await
    }

    #[instrument(skip(self))]
    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let sql = format!(
            "SELECT {} FROM devloop_workflow_executions \
             WHERE ($1::uuid IS NULL OR subject_id = $1) AND ($2::text IS NULL OR status = $2) \
             ORDER BY created_at DESC, id DESC LIMIT $3",
            EXECUTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(filter.subject_id)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(limit.min(i64::MAX as usize) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        self.materialize_all(&rows).await
    }

    #[instrument(skip(self, execution), fields(test_execution_id = %execution.id))]
    async fn create_test_execution(
        &self,
        execution: &AutonomousTestExecution,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO devloop_autonomous_test_executions
                (id, subject_id, owner_id, workflow_execution_id, preview_deployment_id,
                 max_iterations, current_iteration, status, tests_passed, final_test_result,
                 error, total_duration_ms, created_at, updated_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(execution.id)
        .bind(execution.subject_id)
        .bind(&execution.owner_id)
        .bind(execution.workflow_execution_id)
        .bind(execution.preview_deployment_id)
        .bind(execution.max_iterations as i32)
        .bind(execution.current_iteration as i32)
        .bind(execution.status.as_str())
        .bind(execution.tests_passed)
        .bind(&execution.final_test_result)
        .bind(&execution.error)
        .bind(execution.total_duration_ms as i64)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .bind(execution.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create test execution: {}", e);
            db_error(e)
        })?;

        Ok(())
    }

    #[instrument(skip(self, execution), fields(test_execution_id = %execution.id, status = %execution.status))]
    async fn update_test_execution(
        &self,
        execution: &AutonomousTestExecution,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE devloop_autonomous_test_executions
            SET preview_deployment_id = $2, current_iteration = $3, status = $4,
                tests_passed = $5, final_test_result = $6, error = $7,
                total_duration_ms = $8, updated_at = $9, completed_at = $10
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(execution.id)
        .bind(execution.preview_deployment_id)
        .bind(execution.current_iteration as i32)
        .bind(execution.status.as_str())
        .bind(execution.tests_passed)
        .bind(&execution.final_test_result)
        .bind(&execution.error)
        .bind(execution.total_duration_ms as i64)
        .bind(execution.updated_at)
        .bind(execution.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            // Either missing or already terminal
            self.get_test_execution(execution.id).await?;
            return Err(StoreError::TestExecutionTerminal(execution.id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_test_execution(&self, id: Uuid) -> Result<AutonomousTestExecution, StoreError> {
        self.query_test_executions("WHERE id = $1", Some(id), 1)
            .await?
            .into_iter()
            .next()
            .ok_or(StoreError::TestExecutionNotFound(id))
    }

    #[instrument(skip(self))]
    async fn latest_test_execution(
        &self,
        subject_id: Uuid,
    ) -> Result<Option<AutonomousTestExecution>, StoreError> {
        Ok(self
            .query_test_executions("WHERE subject_id = $1", Some(subject_id), 1)
            .await?
            .into_iter()
            .next())
    }

    #[instrument(skip(self))]
    async fn test_execution_history(
        &self,
        subject_id: Uuid,
    ) -> Result<Vec<AutonomousTestExecution>, StoreError> {
        self.query_test_executions("WHERE subject_id = $1", Some(subject_id), i64::MAX as usize)
            .await
    }

    #[instrument(skip(self))]
    async fn test_executions_for_workflow(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<AutonomousTestExecution>, StoreError> {
        self.query_test_executions(
            "WHERE workflow_execution_id = $1",
            Some(workflow_execution_id),
            i64::MAX as usize,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn list_test_executions(
        &self,
        limit: usize,
    ) -> Result<Vec<AutonomousTestExecution>, StoreError> {
        self.query_test_executions("", None, limit).await
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn row_to_execution_header(row: &PgRow) -> Result<WorkflowExecution, StoreError> {
    let status: String = row.get("status");
    let retry_count: i32 = row.get("retry_count");
    Ok(WorkflowExecution {
        id: row.get("id"),
        subject_id: row.get("subject_id"),
        workflow_type: row.get("workflow_type"),
        status: status
            .parse::<WorkflowStatus>()
            .map_err(StoreError::Serialization)?,
        steps: Vec::new(),
        retry_count: retry_count.max(0) as u32,
        preview_deployment_id: row.get("preview_deployment_id"),
        sequence: 0,
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
        completed_at: row.get::<Option<DateTime<Utc>>, _>("completed_at"),
    })
}

fn row_to_event(row: &PgRow) -> Result<RecordedStepEvent, StoreError> {
    let status: String = row.get("status");
    Ok(RecordedStepEvent {
        sequence: row.get("sequence_num"),
        event: StepEvent {
            name: row.get("step_name"),
            status: status
                .parse::<StepStatus>()
                .map_err(StoreError::Serialization)?,
            at: row.get::<DateTime<Utc>, _>("occurred_at"),
            error: row.get("error"),
        },
    })
}

fn row_to_test_execution(row: &PgRow) -> Result<AutonomousTestExecution, StoreError> {
    let status: String = row.get("status");
    let max_iterations: i32 = row.get("max_iterations");
    let current_iteration: i32 = row.get("current_iteration");
    let total_duration_ms: i64 = row.get("total_duration_ms");
    Ok(AutonomousTestExecution {
        id: row.get("id"),
        subject_id: row.get("subject_id"),
        owner_id: row.get("owner_id"),
        workflow_execution_id: row.get("workflow_execution_id"),
        preview_deployment_id: row.get("preview_deployment_id"),
        max_iterations: max_iterations.max(0) as u32,
        current_iteration: current_iteration.max(0) as u32,
        status: status
            .parse::<TestLoopStatus>()
            .map_err(StoreError::Serialization)?,
        tests_passed: row.get("tests_passed"),
        final_test_result: row.get("final_test_result"),
        error: row.get("error"),
        total_duration_ms: total_duration_ms.max(0) as u64,
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
        completed_at: row.get::<Option<DateTime<Utc>>, _>("completed_at"),
    })
}

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use capstan_core::error::{EngineError, EngineResult};
use capstan_core::models::{
    ArchivedTask, TaskQueueRecord, TaskRule, WorkflowRunTask,
};

use crate::notify::NotifyHub;
use crate::StoreOptions;

/// SQLite implementation of the store contracts. Writers are serialized by
/// the database itself, so conditional single-statement updates behave as
/// atomic leases; notifications ride an in-process topic hub and are
/// published after commit.
#[derive(Clone)]
pub struct SqliteStore {
    pub(super) pool: SqlitePool,
    pub(super) hub: NotifyHub,
    pub(super) session_timeout: Duration,
    pub(super) acting_principal: Option<String>,
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> EngineResult<Self> {
        Self::connect_with(database_url, StoreOptions::default()).await
    }

    pub async fn connect_with(
        database_url: &str,
        options: StoreOptions,
    ) -> EngineResult<Self> {
        // An in-memory database exists per connection; a pool larger than
        // one would hand out empty databases.
        let pool_size = if is_in_memory(database_url) {
            1
        } else {
            options.pool_size
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(database_url)
            .await?;

        sqlx::query("PRAGMA foreign_keys = ON;").execute(&pool).await?;
        sqlx::query("PRAGMA journal_mode = WAL;").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous = NORMAL;").execute(&pool).await?;

        Ok(Self {
            pool,
            hub: NotifyHub::new(),
            session_timeout: Duration::seconds(options.session_timeout_secs as i64),
            acting_principal: options.acting_principal,
        })
    }

    pub async fn run_migrations(&self) -> EngineResult<()> {
        sqlx::migrate!("./migrations_sqlite")
            .run(&self.pool)
            .await
            .map_err(|error| EngineError::Generic(error.to_string()))?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(super) fn heartbeat_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - self.session_timeout
    }

    pub(super) fn principal(&self) -> Option<&str> {
        self.acting_principal.as_deref()
    }
}

pub(super) fn parse_value(raw: Option<String>) -> EngineResult<Option<Value>> {
    raw.map(|text| serde_json::from_str(&text).map_err(EngineError::from))
        .transpose()
}

pub(super) fn parse_rules(raw: Option<String>) -> EngineResult<Option<Vec<TaskRule>>> {
    raw.map(|text| serde_json::from_str(&text).map_err(EngineError::from))
        .transpose()
}

pub(super) fn encode_rules(rules: &[TaskRule]) -> EngineResult<String> {
    serde_json::to_string(rules).map_err(EngineError::from)
}

/// Joined task queue row carrying the task registry columns the run views
/// expose.
#[derive(sqlx::FromRow)]
pub(super) struct RunTaskRow {
    pub task_order: i32,
    pub task_id: i64,
    pub name: String,
    pub description: String,
    pub status: String,
    pub parameters: Option<String>,
    pub output: Option<String>,
    pub rules: Option<String>,
    pub task_start: Option<DateTime<Utc>>,
    pub task_end: Option<DateTime<Utc>>,
    pub progress: Option<i16>,
}

impl RunTaskRow {
    pub(super) fn into_task(self) -> EngineResult<WorkflowRunTask> {
        Ok(WorkflowRunTask {
            task_order: self.task_order,
            task_id: self.task_id.into(),
            name: self.name,
            description: self.description,
            task_status: self.status.parse()?,
            parameters: parse_value(self.parameters)?,
            output: self.output,
            rules: parse_rules(self.rules)?,
            task_start: self.task_start,
            task_end: self.task_end,
            progress: self.progress,
        })
    }
}

/// Dispatchable slice of a task queue row, joined with the effective URL.
#[derive(sqlx::FromRow)]
pub(super) struct TaskQueueRecordRow {
    pub workflow_run_id: i64,
    pub task_order: i32,
    pub task_id: i64,
    pub status: String,
    pub parameters: Option<String>,
    pub url: String,
}

impl TaskQueueRecordRow {
    pub(super) fn into_record(self) -> EngineResult<TaskQueueRecord> {
        Ok(TaskQueueRecord {
            workflow_run_id: self.workflow_run_id.into(),
            task_order: self.task_order,
            task_id: self.task_id.into(),
            status: self.status.parse()?,
            parameters: parse_value(self.parameters)?,
            url: self.url,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct ArchiveRow {
    pub workflow_run_id: i64,
    pub task_order: i32,
    pub task_id: i64,
    pub status: String,
    pub parameters: Option<String>,
    pub output: Option<String>,
    pub rules: Option<String>,
    pub task_start: Option<DateTime<Utc>>,
    pub task_end: Option<DateTime<Utc>>,
    pub progress: Option<i16>,
    pub archived_at: DateTime<Utc>,
}

impl ArchiveRow {
    pub(super) fn into_archived(self) -> EngineResult<ArchivedTask> {
        Ok(ArchivedTask {
            workflow_run_id: self.workflow_run_id.into(),
            task_order: self.task_order,
            task_id: self.task_id.into(),
            status: self.status.parse()?,
            parameters: parse_value(self.parameters)?,
            output: self.output,
            rules: parse_rules(self.rules)?,
            task_start: self.task_start,
            task_end: self.task_end,
            progress: self.progress,
            archived_at: self.archived_at,
        })
    }
}

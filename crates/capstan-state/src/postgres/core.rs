use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};

use capstan_core::error::{EngineError, EngineResult};
use capstan_core::listener::ChangeListener;
use capstan_core::models::{ArchivedTask, TaskQueueRecord, TaskRule, WorkflowRunTask};

use crate::StoreOptions;

/// Notifications queued inside a transaction, delivered through
/// `pg_notify` just before commit.
pub(super) type Notes = Vec<(String, String)>;

/// Postgres implementation of the store contracts. Row leases use
/// `FOR UPDATE SKIP LOCKED`; notifications ride `LISTEN`/`NOTIFY` and are
/// raised inside the mutating transaction so they deliver on commit.
#[derive(Clone)]
pub struct PostgresStore {
    pub(super) pool: PgPool,
    pub(super) session_timeout: Duration,
    pub(super) acting_principal: Option<String>,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> EngineResult<Self> {
        Self::connect_with(database_url, StoreOptions::default()).await
    }

    pub async fn connect_with(
        database_url: &str,
        options: StoreOptions,
    ) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(options.pool_size)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self {
            pool,
            session_timeout: Duration::seconds(options.session_timeout_secs as i64),
            acting_principal: options.acting_principal,
        })
    }

    pub async fn run_migrations(&self) -> EngineResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|error| EngineError::Generic(error.to_string()))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(super) fn heartbeat_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - self.session_timeout
    }

    pub(super) fn principal(&self) -> Option<&str> {
        self.acting_principal.as_deref()
    }

    pub(super) async fn listener<M>(&self, topic: &str) -> EngineResult<PgChangeListener<M>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(topic).await?;
        Ok(PgChangeListener {
            listener,
            _message: PhantomData,
        })
    }
}

/// Raise the queued notifications inside the transaction; Postgres delivers
/// them to subscribers when the transaction commits.
pub(super) async fn notify_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    notes: &Notes,
) -> EngineResult<()> {
    for (topic, payload) in notes {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(topic)
            .bind(payload)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

/// Fire-and-forget notification outside a transaction.
pub(super) async fn notify(pool: &PgPool, topic: &str, payload: &str) -> EngineResult<()> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(topic)
        .bind(payload)
        .execute(pool)
        .await?;
    Ok(())
}

/// Subscription to one `LISTEN` channel, parsing payloads into the message
/// type on receipt.
pub struct PgChangeListener<M> {
    listener: PgListener,
    _message: PhantomData<M>,
}

#[async_trait]
impl<M> ChangeListener for PgChangeListener<M>
where
    M: for<'a> From<&'a str> + Send,
{
    type Message = M;

    async fn recv(&mut self) -> EngineResult<Self::Message> {
        let notification = self.listener.recv().await?;
        Ok(M::from(notification.payload()))
    }
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
    pub parameters: Option<Value>,
    pub output: Option<String>,
    pub rules: Option<Json<Vec<TaskRule>>>,
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
            parameters: self.parameters,
            output: self.output,
            rules: self.rules.map(|Json(rules)| rules),
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
    pub parameters: Option<Value>,
    pub url: String,
}

impl TaskQueueRecordRow {
    pub(super) fn into_record(self) -> EngineResult<TaskQueueRecord> {
        Ok(TaskQueueRecord {
            workflow_run_id: self.workflow_run_id.into(),
            task_order: self.task_order,
            task_id: self.task_id.into(),
            status: self.status.parse()?,
            parameters: self.parameters,
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
    pub parameters: Option<Value>,
    pub output: Option<String>,
    pub rules: Option<Json<Vec<TaskRule>>>,
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
            parameters: self.parameters,
            output: self.output,
            rules: self.rules.map(|Json(rules)| rules),
            task_start: self.task_start,
            task_end: self.task_end,
            progress: self.progress,
            archived_at: self.archived_at,
        })
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use tracing::error;

use capstan_core::error::{EngineError, EngineResult};
use capstan_core::listener::{executor_status_topic, ExecutorSignal};
use capstan_core::models::{
    Executor, ExecutorId, ExecutorRegistration, ExecutorStatus, WorkflowRunId, WorkflowRunStatus,
    EXECUTOR_CANCELED_OUTPUT,
};
use capstan_core::store::ExecutorStore;

use super::core::{notify, notify_in_tx, Notes, PgChangeListener, PostgresStore};

const EXECUTOR_SELECT: &str = r#"
    SELECT e.executor_id, e.pid, e.username, e.application_name, e.client_addr,
           e.client_port, e.exec_start, e.exec_end, e.status, e.error_message,
           e.last_heartbeat,
           (SELECT count(*) FROM workflow_runs wr WHERE wr.executor_id = e.executor_id)
               AS workflow_run_count
    FROM executors e"#;

#[derive(sqlx::FromRow)]
struct ExecutorRow {
    executor_id: i64,
    pid: i32,
    username: String,
    application_name: String,
    client_addr: String,
    client_port: i32,
    exec_start: DateTime<Utc>,
    exec_end: Option<DateTime<Utc>>,
    status: String,
    error_message: Option<String>,
    last_heartbeat: DateTime<Utc>,
    workflow_run_count: i64,
}

impl ExecutorRow {
    fn into_executor(self, cutoff: DateTime<Utc>) -> EngineResult<Executor> {
        Ok(Executor {
            executor_id: self.executor_id.into(),
            pid: self.pid,
            username: self.username,
            application_name: self.application_name,
            client_addr: self.client_addr,
            client_port: self.client_port,
            exec_start: self.exec_start,
            exec_end: self.exec_end,
            status: self.status.parse()?,
            error_message: self.error_message,
            session_active: self.last_heartbeat > cutoff,
            workflow_run_count: self.workflow_run_count,
        })
    }
}

impl PostgresStore {
    pub(super) async fn close_executor_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        executor_id: ExecutorId,
        is_cancelled: bool,
        notes: &mut Notes,
    ) -> EngineResult<()> {
        let status = if is_cancelled {
            ExecutorStatus::Canceled
        } else {
            ExecutorStatus::Shutdown
        };
        let closed = sqlx::query(
            r#"
            UPDATE executors
            SET status = $1, exec_end = $2
            WHERE executor_id = $3"#,
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(executor_id)
        .execute(&mut **tx)
        .await?;
        if closed.rows_affected() == 0 {
            return Err(EngineError::NotFound {
                entity: "executor",
                pk: executor_id.to_string(),
            });
        }

        let running: Vec<i64> = sqlx::query_scalar(
            "SELECT workflow_run_id FROM workflow_runs WHERE executor_id = $1 AND status = 'Running'",
        )
        .bind(executor_id)
        .fetch_all(&mut **tx)
        .await?;
        for workflow_run_id in running {
            let workflow_run_id = WorkflowRunId::from(workflow_run_id);
            sqlx::query(
                r#"
                UPDATE task_queue
                SET status = 'Canceled', task_end = $1, output = $2
                WHERE workflow_run_id = $3 AND status = 'Running'"#,
            )
            .bind(Utc::now())
            .bind(EXECUTOR_CANCELED_OUTPUT)
            .bind(workflow_run_id)
            .execute(&mut **tx)
            .await?;
            self.run_transition(
                tx,
                workflow_run_id,
                WorkflowRunStatus::Canceled,
                None,
                None,
                notes,
            )
            .await?;
        }

        let scheduled: Vec<i64> = sqlx::query_scalar(
            "SELECT workflow_run_id FROM workflow_runs WHERE executor_id = $1 AND status = 'Scheduled'",
        )
        .bind(executor_id)
        .fetch_all(&mut **tx)
        .await?;
        for workflow_run_id in scheduled {
            let workflow_run_id = WorkflowRunId::from(workflow_run_id);
            sqlx::query("UPDATE workflow_runs SET executor_id = NULL WHERE workflow_run_id = $1")
                .bind(workflow_run_id)
                .execute(&mut **tx)
                .await?;
            self.run_transition(
                tx,
                workflow_run_id,
                WorkflowRunStatus::Scheduled,
                None,
                None,
                notes,
            )
            .await?;
        }
        Ok(())
    }

    async fn signal_executor(
        &self,
        executor_id: ExecutorId,
        status: ExecutorStatus,
        signal: ExecutorSignal,
    ) -> EngineResult<Option<Executor>> {
        let updated = sqlx::query(
            r#"
            UPDATE executors
            SET status = $1
            WHERE executor_id = $2 AND status = 'Active'"#,
        )
        .bind(status.as_str())
        .bind(executor_id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() > 0 {
            notify(
                &self.pool,
                &executor_status_topic(executor_id),
                signal.as_payload(),
            )
            .await?;
        }
        self.read_executor(executor_id).await
    }
}

#[async_trait]
impl ExecutorStore for PostgresStore {
    type StatusListener = PgChangeListener<ExecutorSignal>;

    async fn register_executor(
        &self,
        registration: &ExecutorRegistration,
    ) -> EngineResult<ExecutorId> {
        let now = Utc::now();
        let executor_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO executors (
                pid, username, application_name, client_addr, client_port,
                exec_start, status, last_heartbeat
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'Active', $7)
            RETURNING executor_id"#,
        )
        .bind(registration.pid)
        .bind(&registration.username)
        .bind(&registration.application_name)
        .bind(&registration.client_addr)
        .bind(registration.client_port)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(executor_id.into())
    }

    async fn read_executor(&self, executor_id: ExecutorId) -> EngineResult<Option<Executor>> {
        let row: Option<ExecutorRow> =
            sqlx::query_as(&format!("{EXECUTOR_SELECT}\n    WHERE e.executor_id = $1"))
                .bind(executor_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|row| row.into_executor(self.heartbeat_cutoff()))
            .transpose()
    }

    async fn read_executors(&self) -> EngineResult<Vec<Executor>> {
        let rows: Vec<ExecutorRow> =
            sqlx::query_as(&format!("{EXECUTOR_SELECT}\n    ORDER BY e.executor_id"))
                .fetch_all(&self.pool)
                .await?;
        let cutoff = self.heartbeat_cutoff();
        rows.into_iter()
            .map(|row| row.into_executor(cutoff))
            .collect()
    }

    async fn read_active_executors(&self) -> EngineResult<Vec<Executor>> {
        let rows: Vec<ExecutorRow> = sqlx::query_as(&format!(
            "{EXECUTOR_SELECT}\n    WHERE e.status = 'Active'\n    ORDER BY e.executor_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        let cutoff = self.heartbeat_cutoff();
        rows.into_iter()
            .map(|row| row.into_executor(cutoff))
            .collect()
    }

    async fn executor_status(
        &self,
        executor_id: ExecutorId,
    ) -> EngineResult<Option<ExecutorStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM executors WHERE executor_id = $1")
                .bind(executor_id)
                .fetch_optional(&self.pool)
                .await?;
        status.map(|s| s.parse()).transpose()
    }

    async fn shutdown_executor(&self, executor_id: ExecutorId) -> EngineResult<Option<Executor>> {
        self.signal_executor(executor_id, ExecutorStatus::Shutdown, ExecutorSignal::Shutdown)
            .await
    }

    async fn cancel_executor(&self, executor_id: ExecutorId) -> EngineResult<Option<Executor>> {
        self.signal_executor(executor_id, ExecutorStatus::Canceled, ExecutorSignal::Cancel)
            .await
    }

    async fn close_executor(
        &self,
        executor_id: ExecutorId,
        is_cancelled: bool,
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        let mut notes = Notes::new();
        self.close_executor_in_tx(&mut tx, executor_id, is_cancelled, &mut notes)
            .await?;
        notify_in_tx(&mut tx, &notes).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn post_executor_error(&self, executor_id: ExecutorId, message: &str) {
        let result = sqlx::query(
            "UPDATE executors SET error_message = $1 WHERE executor_id = $2",
        )
        .bind(message)
        .bind(executor_id)
        .execute(&self.pool)
        .await;
        if let Err(sql_error) = result {
            error!(error = %sql_error, "could not record executor error");
        }
        error!(%executor_id, message, "executor fatal error");
    }

    async fn clean_executors(&self) -> EngineResult<Vec<ExecutorId>> {
        let mut tx = self.pool.begin().await?;
        let stale: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT executor_id
            FROM executors
            WHERE status = 'Active' AND last_heartbeat <= $1
            FOR UPDATE SKIP LOCKED"#,
        )
        .bind(self.heartbeat_cutoff())
        .fetch_all(&mut *tx)
        .await?;
        let mut notes = Notes::new();
        let mut reaped = Vec::with_capacity(stale.len());
        for executor_id in stale {
            let executor_id = ExecutorId::from(executor_id);
            self.close_executor_in_tx(&mut tx, executor_id, true, &mut notes)
                .await?;
            reaped.push(executor_id);
        }
        notify_in_tx(&mut tx, &notes).await?;
        tx.commit().await?;
        Ok(reaped)
    }

    async fn heartbeat_executor(&self, executor_id: ExecutorId) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE executors
            SET last_heartbeat = $1
            WHERE executor_id = $2 AND status = 'Active'"#,
        )
        .bind(Utc::now())
        .bind(executor_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn next_executor(&self) -> EngineResult<Option<ExecutorId>> {
        let mut tx = self.pool.begin().await?;
        let executor_id = self.next_executor_in_tx(&mut tx).await?;
        tx.commit().await?;
        Ok(executor_id)
    }

    async fn status_listener(
        &self,
        executor_id: ExecutorId,
    ) -> EngineResult<Self::StatusListener> {
        self.listener(&executor_status_topic(executor_id)).await
    }
}

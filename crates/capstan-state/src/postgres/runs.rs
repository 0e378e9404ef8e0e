use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Postgres, Transaction};

use capstan_core::error::{EngineError, EngineResult};
use capstan_core::listener::{
    canceled_topic, scheduled_topic, ProgressUpdate, RunCanceled, RunScheduled, JOBS_TOPIC,
    PROGRESS_TOPIC,
};
use capstan_core::models::{
    ExecutorId, ExecutorWorkflowRun, WorkflowId, WorkflowRun, WorkflowRunId, WorkflowRunStatus,
};
use capstan_core::store::RunStore;

use super::core::{notify_in_tx, Notes, PgChangeListener, PostgresStore, RunTaskRow};

const SCHEDULABLE: [WorkflowRunStatus; 4] = [
    WorkflowRunStatus::Waiting,
    WorkflowRunStatus::Scheduled,
    WorkflowRunStatus::Paused,
    WorkflowRunStatus::Failed,
];

impl PostgresStore {
    /// The single transition hook every run status change funnels through.
    pub(super) async fn run_transition(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        workflow_run_id: WorkflowRunId,
        new_status: WorkflowRunStatus,
        executor_override: Option<ExecutorId>,
        paused_progress: Option<i16>,
        notes: &mut Notes,
    ) -> EngineResult<()> {
        let row: Option<(String, Option<i64>)> = sqlx::query_as(
            "SELECT status, executor_id FROM workflow_runs WHERE workflow_run_id = $1 FOR UPDATE",
        )
        .bind(workflow_run_id)
        .fetch_optional(&mut **tx)
        .await?;
        let Some((_, old_executor)) = row else {
            return Err(EngineError::NotFound {
                entity: "workflow run",
                pk: workflow_run_id.to_string(),
            });
        };
        let old_executor = old_executor.map(ExecutorId::from);

        match new_status {
            WorkflowRunStatus::Scheduled => {
                let executor = match executor_override.or(old_executor) {
                    Some(executor) => Some(executor),
                    None => self.next_executor_in_tx(tx).await?,
                };
                sqlx::query(
                    "UPDATE workflow_runs SET status = $1, executor_id = $2 WHERE workflow_run_id = $3",
                )
                .bind(new_status.as_str())
                .bind(executor)
                .bind(workflow_run_id)
                .execute(&mut **tx)
                .await?;
                if let Some(executor) = executor {
                    notes.push((scheduled_topic(executor), workflow_run_id.to_string()));
                }
            }
            WorkflowRunStatus::Running => {
                let executor = executor_override.ok_or_else(|| {
                    EngineError::Generic(
                        "an executor is required to start a workflow run".to_owned(),
                    )
                })?;
                sqlx::query(
                    r#"
                    UPDATE workflow_runs
                    SET status = $1, executor_id = $2, progress = 0
                    WHERE workflow_run_id = $3"#,
                )
                .bind(new_status.as_str())
                .bind(executor)
                .bind(workflow_run_id)
                .execute(&mut **tx)
                .await?;
            }
            WorkflowRunStatus::Waiting | WorkflowRunStatus::Failed => {
                sqlx::query(
                    r#"
                    UPDATE workflow_runs
                    SET status = $1, executor_id = NULL, progress = NULL
                    WHERE workflow_run_id = $2"#,
                )
                .bind(new_status.as_str())
                .bind(workflow_run_id)
                .execute(&mut **tx)
                .await?;
            }
            WorkflowRunStatus::Canceled => {
                sqlx::query(
                    r#"
                    UPDATE workflow_runs
                    SET status = $1, executor_id = NULL, progress = NULL
                    WHERE workflow_run_id = $2"#,
                )
                .bind(new_status.as_str())
                .bind(workflow_run_id)
                .execute(&mut **tx)
                .await?;
                if let Some(executor) = old_executor {
                    notes.push((canceled_topic(executor), workflow_run_id.to_string()));
                }
            }
            WorkflowRunStatus::Complete => {
                sqlx::query(
                    r#"
                    UPDATE workflow_runs
                    SET status = $1, executor_id = NULL, progress = 100
                    WHERE workflow_run_id = $2"#,
                )
                .bind(new_status.as_str())
                .bind(workflow_run_id)
                .execute(&mut **tx)
                .await?;
            }
            WorkflowRunStatus::Paused => {
                sqlx::query(
                    r#"
                    UPDATE workflow_runs
                    SET status = $1, executor_id = NULL, progress = $2
                    WHERE workflow_run_id = $3"#,
                )
                .bind(new_status.as_str())
                .bind(paused_progress)
                .bind(workflow_run_id)
                .execute(&mut **tx)
                .await?;
            }
        }

        if new_status.is_terminal() {
            let job_id: Option<i64> =
                sqlx::query_scalar("SELECT job_id FROM jobs WHERE current_workflow_run_id = $1")
                    .bind(workflow_run_id)
                    .fetch_optional(&mut **tx)
                    .await?;
            if let Some(job_id) = job_id {
                notes.push((JOBS_TOPIC.to_owned(), job_id.to_string()));
            }
        }
        Ok(())
    }

    pub(super) async fn next_executor_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
    ) -> EngineResult<Option<ExecutorId>> {
        let executor_id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT e.executor_id
            FROM executors e
            WHERE e.status = 'Active' AND e.last_heartbeat > $1
            ORDER BY
                (SELECT count(*) FROM workflow_runs wr WHERE wr.executor_id = e.executor_id),
                e.executor_id
            LIMIT 1"#,
        )
        .bind(self.heartbeat_cutoff())
        .fetch_optional(&mut **tx)
        .await?;
        Ok(executor_id.map(ExecutorId::from))
    }

    pub(super) async fn recompute_progress_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        workflow_run_id: WorkflowRunId,
        notes: &mut Notes,
    ) -> EngineResult<()> {
        let (total, complete): (i64, i64) = sqlx::query_as(
            r#"
            SELECT count(*), count(*) FILTER (WHERE status = 'Complete')
            FROM task_queue
            WHERE workflow_run_id = $1"#,
        )
        .bind(workflow_run_id)
        .fetch_one(&mut **tx)
        .await?;
        let progress = if total == 0 {
            0
        } else {
            ((complete as f64 / total as f64) * 100.0).round() as i16
        };
        let current: Option<Option<i16>> =
            sqlx::query_scalar("SELECT progress FROM workflow_runs WHERE workflow_run_id = $1")
                .bind(workflow_run_id)
                .fetch_optional(&mut **tx)
                .await?;
        let Some(current) = current else {
            return Err(EngineError::NotFound {
                entity: "workflow run",
                pk: workflow_run_id.to_string(),
            });
        };
        if current != Some(progress) {
            sqlx::query("UPDATE workflow_runs SET progress = $1 WHERE workflow_run_id = $2")
                .bind(progress)
                .bind(workflow_run_id)
                .execute(&mut **tx)
                .await?;
            notes.push((PROGRESS_TOPIC.to_owned(), workflow_run_id.to_string()));
        }
        Ok(())
    }

    pub(super) async fn initialize_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        workflow_id: WorkflowId,
    ) -> EngineResult<WorkflowRunId> {
        let workflow: Option<(bool, Option<i64>)> = sqlx::query_as(
            "SELECT is_deprecated, new_workflow FROM workflows WHERE workflow_id = $1",
        )
        .bind(workflow_id)
        .fetch_optional(&mut **tx)
        .await?;
        let Some((is_deprecated, new_workflow)) = workflow else {
            return Err(EngineError::NotFound {
                entity: "workflow",
                pk: workflow_id.to_string(),
            });
        };
        if is_deprecated {
            return Err(EngineError::DeprecatedWorkflow {
                workflow_id,
                new_workflow: new_workflow.map(WorkflowId::from),
            });
        }
        let workflow_run_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO workflow_runs (workflow_id, status)
            VALUES ($1, 'Waiting')
            RETURNING workflow_run_id"#,
        )
        .bind(workflow_id)
        .fetch_one(&mut **tx)
        .await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO task_queue (workflow_run_id, task_order, task_id, parameters, status)
            SELECT $1, wt.task_order, wt.task_id, wt.parameters, 'Waiting'
            FROM workflow_tasks wt
            WHERE wt.workflow_id = $2
            ORDER BY wt.task_order"#,
        )
        .bind(workflow_run_id)
        .bind(workflow_id)
        .execute(&mut **tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(EngineError::precondition("workflow has no tasks to run"));
        }
        Ok(workflow_run_id.into())
    }

    pub(super) async fn run_status(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        workflow_run_id: WorkflowRunId,
    ) -> EngineResult<WorkflowRunStatus> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM workflow_runs WHERE workflow_run_id = $1")
                .bind(workflow_run_id)
                .fetch_optional(&mut **tx)
                .await?;
        let Some(status) = status else {
            return Err(EngineError::NotFound {
                entity: "workflow run",
                pk: workflow_run_id.to_string(),
            });
        };
        status.parse()
    }

    async fn schedule_inner(
        &self,
        workflow_run_id: WorkflowRunId,
        executor_override: Option<ExecutorId>,
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        let status = self.run_status(&mut tx, workflow_run_id).await?;
        if !SCHEDULABLE.contains(&status) {
            return Err(EngineError::precondition(format!(
                "cannot schedule a workflow run with status {}",
                status.as_str()
            )));
        }
        let mut notes = Notes::new();
        self.run_transition(
            &mut tx,
            workflow_run_id,
            WorkflowRunStatus::Scheduled,
            executor_override,
            None,
            &mut notes,
        )
        .await?;
        notify_in_tx(&mut tx, &notes).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl RunStore for PostgresStore {
    type ScheduledListener = PgChangeListener<RunScheduled>;
    type CancelListener = PgChangeListener<RunCanceled>;
    type ProgressListener = PgChangeListener<ProgressUpdate>;

    async fn initialize_workflow_run(
        &self,
        workflow_id: WorkflowId,
    ) -> EngineResult<WorkflowRun> {
        let mut tx = self.pool.begin().await?;
        let workflow_run_id = self.initialize_in_tx(&mut tx, workflow_id).await?;
        tx.commit().await?;
        self.read_workflow_run(workflow_run_id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "workflow run",
                pk: workflow_run_id.to_string(),
            })
    }

    async fn read_workflow_run(
        &self,
        workflow_run_id: WorkflowRunId,
    ) -> EngineResult<Option<WorkflowRun>> {
        let row: Option<(i64, i64, String, Option<i64>, Option<i16>)> = sqlx::query_as(
            r#"
            SELECT workflow_run_id, workflow_id, status, executor_id, progress
            FROM workflow_runs
            WHERE workflow_run_id = $1"#,
        )
        .bind(workflow_run_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some((workflow_run_id, workflow_id, status, executor_id, progress)) = row else {
            return Ok(None);
        };
        let task_rows: Vec<RunTaskRow> = sqlx::query_as(
            r#"
            SELECT tq.task_order, tq.task_id, t.name, t.description, tq.status, tq.parameters,
                   tq.output, tq.rules, tq.task_start, tq.task_end, tq.progress
            FROM task_queue tq
            JOIN tasks t ON t.task_id = tq.task_id
            WHERE tq.workflow_run_id = $1
            ORDER BY tq.task_order"#,
        )
        .bind(workflow_run_id)
        .fetch_all(&self.pool)
        .await?;
        let tasks = task_rows
            .into_iter()
            .map(RunTaskRow::into_task)
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Some(WorkflowRun {
            workflow_run_id: workflow_run_id.into(),
            workflow_id: workflow_id.into(),
            status: status.parse()?,
            executor_id: executor_id.map(ExecutorId::from),
            progress,
            tasks,
        }))
    }

    async fn read_workflow_runs(&self) -> EngineResult<Vec<WorkflowRun>> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT workflow_run_id FROM workflow_runs ORDER BY workflow_run_id")
                .fetch_all(&self.pool)
                .await?;
        let mut runs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(run) = self.read_workflow_run(id.into()).await? {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    async fn schedule_workflow_run(&self, workflow_run_id: WorkflowRunId) -> EngineResult<()> {
        self.schedule_inner(workflow_run_id, None).await
    }

    async fn schedule_workflow_run_with_executor(
        &self,
        workflow_run_id: WorkflowRunId,
        executor_id: ExecutorId,
    ) -> EngineResult<()> {
        self.schedule_inner(workflow_run_id, Some(executor_id)).await
    }

    async fn cancel_workflow_run(&self, workflow_run_id: WorkflowRunId) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        let status = self.run_status(&mut tx, workflow_run_id).await?;
        if matches!(
            status,
            WorkflowRunStatus::Complete | WorkflowRunStatus::Failed | WorkflowRunStatus::Canceled
        ) {
            return Err(EngineError::precondition(format!(
                "cannot cancel a workflow run with status {}",
                status.as_str()
            )));
        }
        sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'Canceled', task_end = $1
            WHERE workflow_run_id = $2 AND status IN ('Running', 'Paused')"#,
        )
        .bind(Utc::now())
        .bind(workflow_run_id)
        .execute(&mut *tx)
        .await?;
        let mut notes = Notes::new();
        self.run_transition(
            &mut tx,
            workflow_run_id,
            WorkflowRunStatus::Canceled,
            None,
            None,
            &mut notes,
        )
        .await?;
        notify_in_tx(&mut tx, &notes).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn restart_workflow_run(&self, workflow_run_id: WorkflowRunId) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        let status = self.run_status(&mut tx, workflow_run_id).await?;
        let restartable = [
            WorkflowRunStatus::Failed,
            WorkflowRunStatus::Paused,
            WorkflowRunStatus::Canceled,
        ];
        if !restartable.contains(&status) {
            return Err(EngineError::precondition(format!(
                "cannot restart a workflow run with status {}",
                status.as_str()
            )));
        }
        self.archive_tasks_in_tx(&mut tx, workflow_run_id, None).await?;
        sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'Waiting', output = NULL, rules = NULL, task_start = NULL,
                task_end = NULL, progress = NULL
            WHERE workflow_run_id = $1"#,
        )
        .bind(workflow_run_id)
        .execute(&mut *tx)
        .await?;
        let mut notes = Notes::new();
        self.run_transition(
            &mut tx,
            workflow_run_id,
            WorkflowRunStatus::Waiting,
            None,
            None,
            &mut notes,
        )
        .await?;
        notify_in_tx(&mut tx, &notes).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn complete_workflow_run(&self, workflow_run_id: WorkflowRunId) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        let counts: (i64, i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT count(*),
                   count(*) FILTER (WHERE status = 'Complete'),
                   count(*) FILTER (WHERE status = 'Failed'),
                   count(*) FILTER (WHERE status = 'Rule Broken'),
                   count(*) FILTER (WHERE status = 'Paused'),
                   count(*) FILTER (WHERE status = 'Canceled')
            FROM task_queue
            WHERE workflow_run_id = $1"#,
        )
        .bind(workflow_run_id)
        .fetch_one(&mut *tx)
        .await?;
        let (total, complete, failed, rule_broken, paused, canceled) = counts;
        let (status, paused_progress) = if total > 0 && complete == total {
            (WorkflowRunStatus::Complete, None)
        } else if failed > 0 {
            (WorkflowRunStatus::Failed, None)
        } else if rule_broken > 0 || paused > 0 {
            (WorkflowRunStatus::Paused, Some(100))
        } else if canceled > 0 {
            (WorkflowRunStatus::Canceled, None)
        } else {
            (WorkflowRunStatus::Paused, None)
        };
        let mut notes = Notes::new();
        self.run_transition(
            &mut tx,
            workflow_run_id,
            status,
            None,
            paused_progress,
            &mut notes,
        )
        .await?;
        notify_in_tx(&mut tx, &notes).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_workflow_run_progress(
        &self,
        workflow_run_id: WorkflowRunId,
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        let mut notes = Notes::new();
        self.recompute_progress_in_tx(&mut tx, workflow_run_id, &mut notes)
            .await?;
        notify_in_tx(&mut tx, &notes).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn start_workflow_run_move(&self, workflow_run_id: WorkflowRunId) -> EngineResult<()> {
        let bookmarked = sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'Paused'
            WHERE workflow_run_id = $1 AND status = 'Waiting'
              AND task_order = (
                  SELECT task_order FROM task_queue
                  WHERE workflow_run_id = $1 AND status = 'Waiting'
                  ORDER BY task_order
                  LIMIT 1
                  FOR UPDATE SKIP LOCKED
              )"#,
        )
        .bind(workflow_run_id)
        .execute(&self.pool)
        .await?;
        if bookmarked.rows_affected() == 0 {
            return Err(EngineError::precondition(
                "no waiting task available to bookmark for the move",
            ));
        }
        Ok(())
    }

    async fn complete_workflow_run_move(
        &self,
        workflow_run_id: WorkflowRunId,
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        let released = sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'Waiting'
            WHERE workflow_run_id = $1 AND status = 'Paused'
              AND task_order = (
                  SELECT task_order FROM task_queue
                  WHERE workflow_run_id = $1 AND status = 'Paused'
                  ORDER BY task_order
                  LIMIT 1
                  FOR UPDATE SKIP LOCKED
              )"#,
        )
        .bind(workflow_run_id)
        .execute(&mut *tx)
        .await?;
        if released.rows_affected() == 0 {
            return Err(EngineError::precondition(
                "no paused task bookmark to release for the move",
            ));
        }
        sqlx::query("UPDATE workflow_runs SET executor_id = NULL WHERE workflow_run_id = $1")
            .bind(workflow_run_id)
            .execute(&mut *tx)
            .await?;
        let mut notes = Notes::new();
        self.run_transition(
            &mut tx,
            workflow_run_id,
            WorkflowRunStatus::Scheduled,
            None,
            None,
            &mut notes,
        )
        .await?;
        notify_in_tx(&mut tx, &notes).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn next_workflow_run(
        &self,
        executor_id: ExecutorId,
    ) -> EngineResult<Option<ExecutorWorkflowRun>> {
        let mut tx = self.pool.begin().await?;
        let row: Option<(i64, String, bool)> = sqlx::query_as(
            r#"
            SELECT wr.workflow_run_id, wr.status,
                   NOT EXISTS (
                       SELECT 1 FROM task_queue tq
                       WHERE tq.workflow_run_id = wr.workflow_run_id
                         AND tq.status NOT IN ('Waiting', 'Complete')
                   ) AS is_valid
            FROM workflow_runs wr
            WHERE wr.status = 'Scheduled'
              AND (wr.executor_id IS NULL OR wr.executor_id = $1)
            ORDER BY wr.workflow_run_id
            LIMIT 1
            FOR UPDATE OF wr SKIP LOCKED"#,
        )
        .bind(executor_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((workflow_run_id, status, is_valid)) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let workflow_run_id = WorkflowRunId::from(workflow_run_id);
        if !is_valid {
            tx.commit().await?;
            return Ok(Some(ExecutorWorkflowRun {
                workflow_run_id,
                status: status.parse()?,
                is_valid: false,
            }));
        }
        let mut notes = Notes::new();
        self.run_transition(
            &mut tx,
            workflow_run_id,
            WorkflowRunStatus::Running,
            Some(executor_id),
            None,
            &mut notes,
        )
        .await?;
        notify_in_tx(&mut tx, &notes).await?;
        tx.commit().await?;
        Ok(Some(ExecutorWorkflowRun {
            workflow_run_id,
            status: WorkflowRunStatus::Running,
            is_valid: true,
        }))
    }

    async fn executor_workflow_runs(
        &self,
        executor_id: ExecutorId,
    ) -> EngineResult<Vec<ExecutorWorkflowRun>> {
        let rows: Vec<(i64, String, bool)> = sqlx::query_as(
            r#"
            SELECT wr.workflow_run_id, wr.status,
                   NOT EXISTS (
                       SELECT 1 FROM task_queue tq
                       WHERE tq.workflow_run_id = wr.workflow_run_id
                         AND tq.status NOT IN ('Waiting', 'Complete')
                   ) AS is_valid
            FROM workflow_runs wr
            WHERE wr.executor_id = $1
            ORDER BY wr.workflow_run_id"#,
        )
        .bind(executor_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(workflow_run_id, status, is_valid)| {
                Ok(ExecutorWorkflowRun {
                    workflow_run_id: workflow_run_id.into(),
                    status: status.parse()?,
                    is_valid,
                })
            })
            .collect()
    }

    async fn scheduled_listener(
        &self,
        executor_id: ExecutorId,
    ) -> EngineResult<Self::ScheduledListener> {
        self.listener(&scheduled_topic(executor_id)).await
    }

    async fn cancel_listener(
        &self,
        executor_id: ExecutorId,
    ) -> EngineResult<Self::CancelListener> {
        self.listener(&canceled_topic(executor_id)).await
    }

    async fn progress_listener(&self) -> EngineResult<Self::ProgressListener> {
        self.listener(PROGRESS_TOPIC).await
    }
}

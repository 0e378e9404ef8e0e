use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};

use capstan_core::error::{EngineError, EngineResult};
use capstan_core::models::{
    ArchivedTask, TaskQueueRecord, TaskRule, TaskStatus, WorkflowRunId, WorkflowRunStatus,
};
use capstan_core::store::TaskQueueStore;

use super::core::{notify_in_tx, ArchiveRow, Notes, PostgresStore, TaskQueueRecordRow};

const RECORD_SELECT: &str = r#"
    SELECT tq.workflow_run_id, tq.task_order, tq.task_id, tq.status, tq.parameters,
           rtrim(ts.base_url, '/') || '/' || ltrim(t.url, '/') AS url
    FROM task_queue tq
    JOIN tasks t ON t.task_id = tq.task_id
    JOIN task_services ts ON ts.service_id = t.task_service_id"#;

impl PostgresStore {
    pub(super) async fn archive_tasks_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        workflow_run_id: WorkflowRunId,
        task_order: Option<i32>,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO task_queue_archive (
                workflow_run_id, task_order, task_id, status, parameters, output, rules,
                task_start, task_end, progress, archived_at
            )
            SELECT workflow_run_id, task_order, task_id, status, parameters, output, rules,
                   task_start, task_end, progress, $1
            FROM task_queue
            WHERE workflow_run_id = $2 AND ($3::int IS NULL OR task_order = $3)"#,
        )
        .bind(Utc::now())
        .bind(workflow_run_id)
        .bind(task_order)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn task_state(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        workflow_run_id: WorkflowRunId,
        task_order: i32,
    ) -> EngineResult<(TaskStatus, Option<Vec<TaskRule>>)> {
        let row: Option<(String, Option<Json<Vec<TaskRule>>>)> = sqlx::query_as(
            r#"
            SELECT status, rules
            FROM task_queue
            WHERE workflow_run_id = $1 AND task_order = $2
            FOR UPDATE"#,
        )
        .bind(workflow_run_id)
        .bind(task_order)
        .fetch_optional(&mut **tx)
        .await?;
        let Some((status, rules)) = row else {
            return Err(EngineError::NotFound {
                entity: "task queue entry",
                pk: format!("{workflow_run_id}+{task_order}"),
            });
        };
        Ok((status.parse()?, rules.map(|Json(rules)| rules)))
    }
}

#[async_trait]
impl TaskQueueStore for PostgresStore {
    async fn read_task_queue_entry(
        &self,
        workflow_run_id: WorkflowRunId,
        task_order: i32,
    ) -> EngineResult<Option<TaskQueueRecord>> {
        let row: Option<TaskQueueRecordRow> = sqlx::query_as(&format!(
            "{RECORD_SELECT}\n    WHERE tq.workflow_run_id = $1 AND tq.task_order = $2"
        ))
        .bind(workflow_run_id)
        .bind(task_order)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TaskQueueRecordRow::into_record).transpose()
    }

    async fn acquire_next_task(
        &self,
        workflow_run_id: WorkflowRunId,
    ) -> EngineResult<Option<TaskQueueRecord>> {
        let mut tx = self.pool.begin().await?;
        let row: Option<TaskQueueRecordRow> = sqlx::query_as(&format!(
            r#"{RECORD_SELECT}
    WHERE tq.workflow_run_id = $1
      AND tq.status = 'Waiting'
      AND NOT EXISTS (
          SELECT 1 FROM task_queue blocker
          WHERE blocker.workflow_run_id = tq.workflow_run_id
            AND blocker.status IN ('Running', 'Paused', 'Failed', 'Rule Broken')
      )
    ORDER BY tq.task_order
    LIMIT 1
    FOR UPDATE OF tq SKIP LOCKED"#
        ))
        .bind(workflow_run_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let started = sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'Running', task_start = $1
            WHERE workflow_run_id = $2 AND task_order = $3 AND status = 'Waiting'"#,
        )
        .bind(Utc::now())
        .bind(workflow_run_id)
        .bind(row.task_order)
        .execute(&mut *tx)
        .await?;
        if started.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }
        tx.commit().await?;
        let mut record = row.into_record()?;
        record.status = TaskStatus::Running;
        Ok(Some(record))
    }

    async fn complete_task_run(
        &self,
        workflow_run_id: WorkflowRunId,
        task_order: i32,
        is_paused: bool,
        output: Option<String>,
    ) -> EngineResult<()> {
        if let Some(output) = output.as_deref() {
            if output.trim().is_empty() {
                return Err(EngineError::precondition(
                    "task output cannot be empty or whitespace",
                ));
            }
        }
        let mut tx = self.pool.begin().await?;
        let (status, rules) = self.task_state(&mut tx, workflow_run_id, task_order).await?;
        if status != TaskStatus::Running {
            return Err(EngineError::precondition(format!(
                "cannot complete a task run with status {}",
                status.as_str()
            )));
        }
        let rule_failed = rules
            .as_deref()
            .is_some_and(|rules| rules.iter().any(|rule| rule.failed));
        let new_status = if rule_failed {
            TaskStatus::RuleBroken
        } else if is_paused {
            TaskStatus::Paused
        } else {
            TaskStatus::Complete
        };
        sqlx::query(
            r#"
            UPDATE task_queue
            SET status = $1, output = $2, task_end = $3, progress = 100
            WHERE workflow_run_id = $4 AND task_order = $5 AND status = 'Running'"#,
        )
        .bind(new_status.as_str())
        .bind(output)
        .bind(Utc::now())
        .bind(workflow_run_id)
        .bind(task_order)
        .execute(&mut *tx)
        .await?;
        let mut notes = Notes::new();
        self.recompute_progress_in_tx(&mut tx, workflow_run_id, &mut notes)
            .await?;
        notify_in_tx(&mut tx, &notes).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn fail_task_run(
        &self,
        workflow_run_id: WorkflowRunId,
        task_order: i32,
        message: &str,
    ) -> EngineResult<()> {
        if message.trim().is_empty() {
            return Err(EngineError::precondition(
                "task failure message cannot be empty or whitespace",
            ));
        }
        let mut tx = self.pool.begin().await?;
        let (status, _) = self.task_state(&mut tx, workflow_run_id, task_order).await?;
        if status != TaskStatus::Running {
            return Err(EngineError::precondition(format!(
                "cannot fail a task run with status {}",
                status.as_str()
            )));
        }
        sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'Failed', output = $1, task_end = $2
            WHERE workflow_run_id = $3 AND task_order = $4 AND status = 'Running'"#,
        )
        .bind(message)
        .bind(Utc::now())
        .bind(workflow_run_id)
        .bind(task_order)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append_task_rule(
        &self,
        workflow_run_id: WorkflowRunId,
        task_order: i32,
        rule: &TaskRule,
    ) -> EngineResult<()> {
        rule.validate()?;
        let mut tx = self.pool.begin().await?;
        let (status, rules) = self.task_state(&mut tx, workflow_run_id, task_order).await?;
        if status != TaskStatus::Running {
            return Err(EngineError::precondition(format!(
                "cannot append a rule to a task with status {}",
                status.as_str()
            )));
        }
        let mut rules = rules.unwrap_or_default();
        rules.push(rule.clone());
        sqlx::query(
            r#"
            UPDATE task_queue
            SET rules = $1
            WHERE workflow_run_id = $2 AND task_order = $3"#,
        )
        .bind(Json(rules))
        .bind(workflow_run_id)
        .bind(task_order)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_task_progress(
        &self,
        workflow_run_id: WorkflowRunId,
        task_order: i32,
        progress: i16,
    ) -> EngineResult<()> {
        if !(0..=100).contains(&progress) {
            return Err(EngineError::precondition(format!(
                "task progress must be between 0 and 100, got {progress}"
            )));
        }
        let mut tx = self.pool.begin().await?;
        let (status, _) = self.task_state(&mut tx, workflow_run_id, task_order).await?;
        if status != TaskStatus::Running {
            return Err(EngineError::precondition(format!(
                "cannot report progress on a task with status {}",
                status.as_str()
            )));
        }
        sqlx::query(
            r#"
            UPDATE task_queue
            SET progress = $1
            WHERE workflow_run_id = $2 AND task_order = $3"#,
        )
        .bind(progress)
        .bind(workflow_run_id)
        .bind(task_order)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn complete_task(
        &self,
        workflow_run_id: WorkflowRunId,
        task_order: i32,
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        let (status, _) = self.task_state(&mut tx, workflow_run_id, task_order).await?;
        if status != TaskStatus::Paused {
            return Err(EngineError::precondition(format!(
                "cannot manually complete a task with status {}",
                status.as_str()
            )));
        }
        sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'Complete'
            WHERE workflow_run_id = $1 AND task_order = $2 AND status = 'Paused'"#,
        )
        .bind(workflow_run_id)
        .bind(task_order)
        .execute(&mut *tx)
        .await?;
        let mut notes = Notes::new();
        self.recompute_progress_in_tx(&mut tx, workflow_run_id, &mut notes)
            .await?;
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

    async fn retry_task(
        &self,
        workflow_run_id: WorkflowRunId,
        task_order: i32,
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        let (status, _) = self.task_state(&mut tx, workflow_run_id, task_order).await?;
        if !matches!(status, TaskStatus::Failed | TaskStatus::RuleBroken) {
            return Err(EngineError::precondition(
                "cannot retry a task unless its status is Failed or Rule Broken",
            ));
        }
        self.archive_tasks_in_tx(&mut tx, workflow_run_id, Some(task_order))
            .await?;
        sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'Waiting', output = NULL, rules = NULL, task_start = NULL,
                task_end = NULL, progress = NULL
            WHERE workflow_run_id = $1 AND task_order = $2"#,
        )
        .bind(workflow_run_id)
        .bind(task_order)
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

    async fn read_task_queue_archive(
        &self,
        workflow_run_id: WorkflowRunId,
    ) -> EngineResult<Vec<ArchivedTask>> {
        let rows: Vec<ArchiveRow> = sqlx::query_as(
            r#"
            SELECT workflow_run_id, task_order, task_id, status, parameters, output, rules,
                   task_start, task_end, progress, archived_at
            FROM task_queue_archive
            WHERE workflow_run_id = $1
            ORDER BY archive_id DESC"#,
        )
        .bind(workflow_run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ArchiveRow::into_archived).collect()
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use capstan_core::error::{EngineError, EngineResult};
use capstan_core::listener::{JobsNotification, JOBS_TOPIC};
use capstan_core::models::{
    ExecutorId, Job, JobId, JobRequest, JobType, QueuedJob, ScheduleEntry, WorkflowRunStatus,
};
use capstan_core::schedule::{next_run_job_schedule, advance_interval, validate_interval, validate_schedule};
use capstan_core::store::JobStore;

use crate::notify::HubListener;

use super::core::SqliteStore;
use super::runs::Notes;

const JOB_SELECT: &str = r#"
    SELECT job_id, workflow_id, workflow_name, job_type, maintainer, job_interval,
           job_schedule, is_paused, next_run, current_workflow_run_id,
           workflow_run_status, executor_id, progress
    FROM v_jobs"#;

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: i64,
    workflow_id: i64,
    workflow_name: String,
    job_type: String,
    maintainer: String,
    job_interval: Option<i64>,
    job_schedule: Option<String>,
    is_paused: bool,
    next_run: DateTime<Utc>,
    current_workflow_run_id: Option<i64>,
    workflow_run_status: Option<String>,
    executor_id: Option<i64>,
    progress: Option<i16>,
}

impl JobRow {
    fn into_job(self) -> EngineResult<Job> {
        let job_type = match self.job_type.as_str() {
            "Interval" => JobType::Interval {
                interval_seconds: self.job_interval.ok_or_else(|| {
                    EngineError::Generic("interval job is missing its interval".to_owned())
                })?,
            },
            "Scheduled" => {
                let raw = self.job_schedule.ok_or_else(|| {
                    EngineError::Generic("scheduled job is missing its schedule".to_owned())
                })?;
                let schedule: Vec<ScheduleEntry> = serde_json::from_str(&raw)?;
                JobType::Scheduled { schedule }
            }
            other => {
                return Err(EngineError::Generic(format!("unknown job type `{other}`")))
            }
        };
        Ok(Job {
            job_id: self.job_id.into(),
            workflow_id: self.workflow_id.into(),
            workflow_name: self.workflow_name,
            job_type,
            maintainer: self.maintainer,
            is_paused: self.is_paused,
            next_run: self.next_run,
            current_workflow_run_id: self.current_workflow_run_id.map(Into::into),
            workflow_run_status: self
                .workflow_run_status
                .map(|status| status.parse())
                .transpose()?,
            executor_id: self.executor_id.map(ExecutorId::from),
            progress: self.progress,
        })
    }
}

impl SqliteStore {
    async fn require_job(&self, job_id: JobId) -> EngineResult<Job> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("{JOB_SELECT}\n    WHERE job_id = ?"))
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some(row) => row.into_job(),
            None => Err(EngineError::NotFound {
                entity: "job",
                pk: job_id.to_string(),
            }),
        }
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    type JobsListener = HubListener<JobsNotification>;

    async fn create_job(&self, request: &JobRequest) -> EngineResult<Job> {
        if request.maintainer.trim().is_empty() {
            return Err(EngineError::precondition("job maintainer cannot be blank"));
        }
        let now = Utc::now();
        let (job_interval, job_schedule, next_run) = match &request.job_type {
            JobType::Interval { interval_seconds } => {
                validate_interval(*interval_seconds)?;
                let next_run = request
                    .next_run
                    .unwrap_or(now + Duration::seconds(*interval_seconds));
                (Some(*interval_seconds), None, next_run)
            }
            JobType::Scheduled { schedule } => {
                validate_schedule(schedule)?;
                let next_run = next_run_job_schedule(schedule, now)?;
                (None, Some(serde_json::to_string(schedule)?), next_run)
            }
        };
        if next_run <= now {
            return Err(EngineError::precondition(
                "job next run must be in the future",
            ));
        }
        let job_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (
                workflow_id, job_type, maintainer, job_interval, job_schedule,
                is_paused, next_run, modified_by
            )
            VALUES (?, ?, ?, ?, ?, 0, ?, ?)
            RETURNING job_id"#,
        )
        .bind(request.workflow_id)
        .bind(request.job_type.kind())
        .bind(&request.maintainer)
        .bind(job_interval)
        .bind(job_schedule)
        .bind(next_run)
        .bind(self.principal())
        .fetch_one(&self.pool)
        .await?;
        self.hub.publish(JOBS_TOPIC, "");
        self.require_job(job_id.into()).await
    }

    async fn read_job(&self, job_id: JobId) -> EngineResult<Option<Job>> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("{JOB_SELECT}\n    WHERE job_id = ?"))
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn read_jobs(&self) -> EngineResult<Vec<Job>> {
        let rows: Vec<JobRow> =
            sqlx::query_as(&format!("{JOB_SELECT}\n    ORDER BY job_id"))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn read_queued_jobs(&self) -> EngineResult<Vec<QueuedJob>> {
        let rows: Vec<(i64, DateTime<Utc>)> =
            sqlx::query_as("SELECT job_id, next_run FROM v_queued_jobs ORDER BY next_run")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(job_id, next_run)| QueuedJob {
                job_id: job_id.into(),
                next_run,
            })
            .collect())
    }

    async fn run_job(&self, job_id: JobId) -> EngineResult<Job> {
        let mut tx = self.pool.begin().await?;
        let row: Option<(i64, bool, String, Option<i64>, Option<String>, DateTime<Utc>)> =
            sqlx::query_as(
                r#"
                SELECT workflow_id, is_paused, job_type, job_interval, job_schedule, next_run
                FROM jobs
                WHERE job_id = ?"#,
            )
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some((workflow_id, is_paused, job_type, job_interval, job_schedule, next_run)) = row
        else {
            return Err(EngineError::NotFound {
                entity: "job",
                pk: job_id.to_string(),
            });
        };
        if is_paused {
            return Err(EngineError::precondition(format!(
                "job {job_id} is paused and cannot run"
            )));
        }

        let workflow_run_id = self.initialize_in_tx(&mut tx, workflow_id.into()).await?;
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

        let advanced = match job_type.as_str() {
            "Interval" => {
                let interval_seconds = job_interval.ok_or_else(|| {
                    EngineError::Generic("interval job is missing its interval".to_owned())
                })?;
                advance_interval(next_run, interval_seconds)
            }
            "Scheduled" => {
                let raw = job_schedule.ok_or_else(|| {
                    EngineError::Generic("scheduled job is missing its schedule".to_owned())
                })?;
                let schedule: Vec<ScheduleEntry> = serde_json::from_str(&raw)?;
                next_run_job_schedule(&schedule, Utc::now())?
            }
            other => {
                return Err(EngineError::Generic(format!("unknown job type `{other}`")))
            }
        };
        sqlx::query(
            r#"
            UPDATE jobs
            SET current_workflow_run_id = ?, next_run = ?, modified_by = coalesce(?, modified_by)
            WHERE job_id = ?"#,
        )
        .bind(workflow_run_id)
        .bind(advanced)
        .bind(self.principal())
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        notes.push((JOBS_TOPIC.to_owned(), String::new()));
        tx.commit().await?;
        self.hub.publish_all(notes);
        self.require_job(job_id).await
    }

    async fn complete_job(&self, job_id: JobId) -> EngineResult<(Job, Option<String>)> {
        let mut tx = self.pool.begin().await?;
        let row: Option<Option<i64>> =
            sqlx::query_scalar("SELECT current_workflow_run_id FROM jobs WHERE job_id = ?")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;
        let workflow_run_id = match row {
            None => {
                return Err(EngineError::NotFound {
                    entity: "job",
                    pk: job_id.to_string(),
                })
            }
            Some(None) => {
                return Err(EngineError::precondition(
                    "job has no active workflow run to settle",
                ))
            }
            Some(Some(workflow_run_id)) => workflow_run_id,
        };
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM workflow_runs WHERE workflow_run_id = ?")
                .bind(workflow_run_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(status) = status else {
            return Err(EngineError::NotFound {
                entity: "workflow run",
                pk: workflow_run_id.to_string(),
            });
        };
        let status: WorkflowRunStatus = status.parse()?;
        if !status.is_terminal() {
            return Err(EngineError::precondition(
                "workflow run must be done before the job can be settled",
            ));
        }

        let reason = if status == WorkflowRunStatus::Complete {
            sqlx::query(
                r#"
                UPDATE jobs
                SET current_workflow_run_id = NULL, is_paused = 0
                WHERE job_id = ?"#,
            )
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
            None
        } else {
            sqlx::query("UPDATE jobs SET is_paused = 1 WHERE job_id = ?")
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
            Some(format!(
                "workflow run {workflow_run_id} finished with status {}, job paused",
                status.as_str()
            ))
        };
        tx.commit().await?;
        self.hub.publish(JOBS_TOPIC, "");
        let job = self.require_job(job_id).await?;
        Ok((job, reason))
    }

    async fn jobs_listener(&self) -> EngineResult<Self::JobsListener> {
        Ok(self.hub.subscribe(JOBS_TOPIC))
    }
}

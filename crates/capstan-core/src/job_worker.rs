//! The job scheduler loop: keeps the due-queue in memory, fires jobs when
//! their `next_run` arrives and settles jobs when their runs terminate.
//! Driven by the `jobs` topic with the sleep timer as the polling fallback.

use std::collections::HashMap;

use chrono::Utc;
use tokio::signal::ctrl_c;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::error::EngineResult;
use crate::listener::{ChangeListener, JobsNotification};
use crate::models::{JobId, QueuedJob};
use crate::store::JobStore;

pub struct JobWorker<S> {
    store: S,
    jobs: HashMap<JobId, QueuedJob>,
    next_job: Option<JobId>,
}

impl<S: JobStore> JobWorker<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            jobs: HashMap::new(),
            next_job: None,
        }
    }

    /// Run until interrupted. Every pass either fires the next due job,
    /// reacts to a queue notification or idles until one of the two.
    pub async fn run(mut self) -> EngineResult<()> {
        let mut listener = self.store.jobs_listener().await?;
        self.load_jobs().await?;
        loop {
            let next_wait = self.time_until_next_run();
            match next_wait {
                Some(wait) => info!(?wait, "next job run scheduled"),
                None => info!("job queue empty, waiting for notification"),
            }
            tokio::select! {
                biased;
                _ = ctrl_c() => {
                    info!("received shutdown signal, stopping job worker");
                    break;
                }
                notification = listener.recv() => {
                    self.handle_notification(notification?).await?;
                }
                _ = sleep(next_wait.unwrap_or(Duration::MAX)) => {
                    self.run_next_job().await?;
                    self.load_jobs().await?;
                }
            }
        }
        Ok(())
    }

    fn time_until_next_run(&self) -> Option<Duration> {
        let job = self.next_job.and_then(|job_id| self.jobs.get(&job_id))?;
        let millis = job.next_run.timestamp_millis() - Utc::now().timestamp_millis();
        Some(Duration::from_millis(millis.clamp(0, i64::MAX) as u64))
    }

    async fn load_jobs(&mut self) -> EngineResult<()> {
        let queued = self.store.read_queued_jobs().await?;
        self.next_job = queued.first().map(|job| job.job_id);
        self.jobs.clear();
        for job in queued {
            self.jobs.insert(job.job_id, job);
        }
        info!(queued = self.jobs.len(), "loaded job queue");
        Ok(())
    }

    async fn handle_notification(&mut self, notification: JobsNotification) -> EngineResult<()> {
        match notification {
            JobsNotification::Reload => self.load_jobs().await?,
            JobsNotification::Settle(job_id) => {
                self.settle_job(job_id).await;
                self.load_jobs().await?;
            }
        }
        Ok(())
    }

    async fn run_next_job(&self) -> EngineResult<()> {
        let Some(job) = self.next_job.and_then(|job_id| self.jobs.get(&job_id)) else {
            warn!("woke to run a job but the queue is empty");
            return Ok(());
        };
        if job.next_run > Utc::now() {
            warn!(job_id = %job.job_id, "woke before the job was due, reloading");
            return Ok(());
        }
        info!(job_id = %job.job_id, "starting job run");
        if let Err(run_error) = self.store.run_job(job.job_id).await {
            warn!(job_id = %job.job_id, error = %run_error, "job run failed to start");
        }
        Ok(())
    }

    /// Settle a job whose run terminated. A paused outcome is reported to
    /// the job's maintainer; settle failures are logged and the queue
    /// reload recovers on the next pass.
    async fn settle_job(&self, job_id: JobId) {
        if !self.jobs.contains_key(&job_id) {
            warn!(%job_id, "asked to settle a job that is not queued");
        }
        match self.store.complete_job(job_id).await {
            Ok((_, None)) => info!(%job_id, "job run complete"),
            Ok((job, Some(reason))) => {
                warn!(
                    %job_id,
                    maintainer = %job.maintainer,
                    reason,
                    "job paused after run, maintainer attention required"
                );
            }
            Err(settle_error) => {
                warn!(%job_id, error = %settle_error, "could not settle job");
            }
        }
    }
}

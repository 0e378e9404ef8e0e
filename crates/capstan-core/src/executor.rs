//! The executor runtime: a registered session that leases scheduled
//! workflow runs, works them through [`WorkflowRunWorker`] tasks, heartbeats
//! its liveness and reacts to store-mediated control signals.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::driver::TaskDriver;
use crate::error::EngineResult;
use crate::listener::{ChangeListener, ExecutorSignal, RunCanceled};
use crate::models::{ExecutorId, ExecutorRegistration, WorkflowRunId};
use crate::run_worker::WorkflowRunWorker;
use crate::store::Store;

type WorkerOutcome = (WorkflowRunId, EngineResult<()>);

pub struct Executor<S, D> {
    store: S,
    driver: D,
    config: EngineConfig,
    executor_id: ExecutorId,
}

impl<S, D> Executor<S, D>
where
    S: Store,
    D: TaskDriver,
{
    /// Register a new executor session and return the runtime for it. The
    /// runtime does nothing until [`Executor::run`] is called.
    pub async fn register(store: S, driver: D, config: EngineConfig) -> EngineResult<Self> {
        let registration = ExecutorRegistration::local(&config.application_name);
        let executor_id = store.register_executor(&registration).await?;
        info!(%executor_id, "registered executor");
        Ok(Self {
            store,
            driver,
            config,
            executor_id,
        })
    }

    pub const fn id(&self) -> ExecutorId {
        self.executor_id
    }

    /// Main loop. Returns once the executor has been shut down or canceled
    /// through the store and its bookkeeping is closed out.
    pub async fn run(self) -> EngineResult<()> {
        self.reconcile_owned_runs().await?;

        let mut status_listener = self.store.status_listener(self.executor_id).await?;
        let mut scheduled_listener = self.store.scheduled_listener(self.executor_id).await?;
        let mut cancel_listener = self.store.cancel_listener(self.executor_id).await?;

        let mut workers: JoinSet<WorkerOutcome> = JoinSet::new();
        let mut abort_handles: HashMap<WorkflowRunId, AbortHandle> = HashMap::new();

        let mut poll = interval(Duration::from_secs_f64(self.config.poll_interval_secs));
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat = interval(Duration::from_secs(self.config.heartbeat_interval_secs));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reap = interval(Duration::from_secs(self.config.reap_interval_secs));
        reap.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut draining = false;
        let signal = loop {
            tokio::select! {
                signal = status_listener.recv() => {
                    match signal? {
                        ExecutorSignal::Cancel => break ExecutorSignal::Cancel,
                        ExecutorSignal::Shutdown => {
                            info!(executor_id = %self.executor_id, "draining for shutdown");
                            draining = true;
                            if workers.is_empty() {
                                break ExecutorSignal::Shutdown;
                            }
                        }
                        ExecutorSignal::NoOp => {}
                    }
                }
                message = cancel_listener.recv() => {
                    if let RunCanceled(Some(workflow_run_id)) = message? {
                        if let Some(handle) = abort_handles.remove(&workflow_run_id) {
                            info!(%workflow_run_id, "aborting canceled workflow run");
                            handle.abort();
                        }
                    }
                }
                message = scheduled_listener.recv(), if !draining => {
                    let _ = message?;
                    self.fill_worker_slots(&mut workers, &mut abort_handles).await;
                }
                _ = poll.tick(), if !draining => {
                    self.fill_worker_slots(&mut workers, &mut abort_handles).await;
                }
                _ = heartbeat.tick() => {
                    if let Err(heartbeat_error) =
                        self.store.heartbeat_executor(self.executor_id).await
                    {
                        warn!(error = %heartbeat_error, "failed to record heartbeat");
                    }
                }
                _ = reap.tick() => {
                    match self.store.clean_executors().await {
                        Ok(reaped) if !reaped.is_empty() => {
                            info!(?reaped, "reaped dead executors");
                        }
                        Ok(_) => {}
                        Err(reap_error) => warn!(error = %reap_error, "executor reap failed"),
                    }
                }
                Some(finished) = workers.join_next(), if !workers.is_empty() => {
                    self.handle_finished_worker(finished, &mut abort_handles);
                    if draining && workers.is_empty() {
                        break ExecutorSignal::Shutdown;
                    }
                }
            }
        };

        let is_cancelled = signal.is_cancel();
        if is_cancelled {
            workers.abort_all();
        }
        while let Some(finished) = workers.join_next().await {
            self.handle_finished_worker(finished, &mut abort_handles);
        }
        self.store
            .close_executor(self.executor_id, is_cancelled)
            .await?;
        info!(executor_id = %self.executor_id, is_cancelled, "executor closed");
        Ok(())
    }

    /// Lease scheduled runs until every worker slot is busy or nothing is
    /// available. Lease misses are not errors.
    async fn fill_worker_slots(
        &self,
        workers: &mut JoinSet<WorkerOutcome>,
        abort_handles: &mut HashMap<WorkflowRunId, AbortHandle>,
    ) {
        while workers.len() < self.config.max_concurrent_runs {
            let leased = match self.store.next_workflow_run(self.executor_id).await {
                Ok(leased) => leased,
                Err(lease_error) => {
                    warn!(error = %lease_error, "workflow run lease failed");
                    break;
                }
            };
            let Some(run) = leased else { break };
            if !run.is_valid {
                warn!(
                    workflow_run_id = %run.workflow_run_id,
                    "leased workflow run holds unresolved tasks, canceling"
                );
                if let Err(cancel_error) =
                    self.store.cancel_workflow_run(run.workflow_run_id).await
                {
                    warn!(error = %cancel_error, "could not cancel invalid workflow run");
                    break;
                }
                continue;
            }
            let workflow_run_id = run.workflow_run_id;
            let worker =
                WorkflowRunWorker::new(workflow_run_id, self.store.clone(), self.driver.clone());
            let abort_handle =
                workers.spawn(async move { (workflow_run_id, worker.run().await) });
            abort_handles.insert(workflow_run_id, abort_handle);
            info!(%workflow_run_id, "started workflow run worker");
        }
    }

    fn handle_finished_worker(
        &self,
        finished: Result<WorkerOutcome, tokio::task::JoinError>,
        abort_handles: &mut HashMap<WorkflowRunId, AbortHandle>,
    ) {
        match finished {
            Ok((workflow_run_id, result)) => {
                abort_handles.remove(&workflow_run_id);
                match result {
                    Ok(()) => info!(%workflow_run_id, "workflow run worker finished"),
                    Err(worker_error) => {
                        error!(%workflow_run_id, error = %worker_error, "workflow run worker failed");
                    }
                }
            }
            Err(join_error) if join_error.is_cancelled() => {
                abort_handles.retain(|_, handle| !handle.is_finished());
            }
            Err(join_error) => {
                error!(error = %join_error, "workflow run worker panicked");
                abort_handles.retain(|_, handle| !handle.is_finished());
            }
        }
    }

    /// A fresh registration should own nothing; anything owned and invalid
    /// is left over from a prior incarnation and gets canceled so its tasks
    /// are not stranded.
    async fn reconcile_owned_runs(&self) -> EngineResult<()> {
        let owned = self.store.executor_workflow_runs(self.executor_id).await?;
        for run in owned {
            if run.is_valid {
                continue;
            }
            warn!(
                workflow_run_id = %run.workflow_run_id,
                status = run.status.as_str(),
                "canceling invalid owned workflow run"
            );
            self.store.cancel_workflow_run(run.workflow_run_id).await?;
        }
        Ok(())
    }
}

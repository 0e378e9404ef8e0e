//! Drives a single workflow run: acquires tasks in order, forwards the
//! event stream of each remote execution into the store and settles the run
//! when no task remains or one fails.

use tracing::{error, info};

use crate::driver::{TaskDriver, TaskResponse, TaskRunHandle};
use crate::error::{EngineError, EngineResult};
use crate::models::{TaskQueueRecord, WorkflowRunId};
use crate::store::{RunStore, TaskQueueStore};

pub struct WorkflowRunWorker<S, D> {
    workflow_run_id: WorkflowRunId,
    store: S,
    driver: D,
}

impl<S, D> WorkflowRunWorker<S, D>
where
    S: RunStore + TaskQueueStore,
    D: TaskDriver,
{
    pub const fn new(workflow_run_id: WorkflowRunId, store: S, driver: D) -> Self {
        Self {
            workflow_run_id,
            store,
            driver,
        }
    }

    /// Work the run until no task remains or a task fails. The run is
    /// settled through `complete_workflow_run` on both exits, so the status
    /// cascade decides what the run becomes.
    pub async fn run(self) -> EngineResult<()> {
        loop {
            let Some(task) = self.store.acquire_next_task(self.workflow_run_id).await? else {
                self.store.complete_workflow_run(self.workflow_run_id).await?;
                info!(
                    workflow_run_id = %self.workflow_run_id,
                    "no task available, settling workflow run"
                );
                break;
            };
            info!(
                workflow_run_id = %self.workflow_run_id,
                task_order = task.task_order,
                "running task"
            );
            match self.run_task(&task).await {
                Ok((is_paused, message)) => {
                    self.store
                        .complete_task_run(self.workflow_run_id, task.task_order, is_paused, message)
                        .await?;
                }
                Err(task_error) => {
                    error!(
                        workflow_run_id = %self.workflow_run_id,
                        task_order = task.task_order,
                        error = %task_error,
                        "task failed"
                    );
                    self.store
                        .fail_task_run(
                            self.workflow_run_id,
                            task.task_order,
                            &task_error.to_string(),
                        )
                        .await?;
                    self.store.complete_workflow_run(self.workflow_run_id).await?;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Dispatch one task and pump its event stream until the done message,
    /// recording progress and rules as they arrive.
    async fn run_task(&self, task: &TaskQueueRecord) -> EngineResult<(bool, Option<String>)> {
        let mut handle = self.driver.dispatch(task).await?;
        while let Some(event) = handle.next_event().await? {
            match event {
                TaskResponse::Progress { percent } => {
                    self.store
                        .set_task_progress(self.workflow_run_id, task.task_order, percent)
                        .await?;
                }
                TaskResponse::Rule(rule) => {
                    self.store
                        .append_task_rule(self.workflow_run_id, task.task_order, &rule)
                        .await?;
                }
                TaskResponse::Done { paused, message } => return Ok((paused, message)),
            }
        }
        Err(EngineError::TaskExited)
    }
}

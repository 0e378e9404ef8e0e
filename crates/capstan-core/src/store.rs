//! Store contracts. A backend implements all five traits on one cloneable
//! handle; every compound operation is a single transaction that either
//! fully applies or fully rolls back, re-raising the original error.
//!
//! Leasing operations (`next_workflow_run`, `acquire_next_task`) are
//! non-blocking with respect to contended rows: they may return `None`
//! while work still exists elsewhere, and callers poll or wait on their
//! notification topic.

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::listener::{
    ChangeListener, ExecutorSignal, JobsNotification, ProgressUpdate, RunCanceled, RunScheduled,
};
use crate::models::{
    ArchivedTask, Executor, ExecutorId, ExecutorRegistration, ExecutorStatus, ExecutorWorkflowRun,
    Job, JobId, JobRequest, QueuedJob, Task, TaskId, TaskQueueRecord, TaskRequest, TaskRule,
    TaskService, Workflow, WorkflowDeprecationRequest, WorkflowId, WorkflowRequest, WorkflowRun,
    WorkflowRunId,
};

/// Workflow templates, the task registry and the services hosting task
/// bodies.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn create_task_service(&self, name: &str, base_url: &str) -> EngineResult<TaskService>;

    async fn read_task_services(&self) -> EngineResult<Vec<TaskService>>;

    async fn create_task(&self, request: &TaskRequest) -> EngineResult<Task>;

    async fn read_task(&self, task_id: TaskId) -> EngineResult<Option<Task>>;

    async fn read_tasks(&self) -> EngineResult<Vec<Task>>;

    async fn update_task(&self, task_id: TaskId, request: &TaskRequest)
        -> EngineResult<Option<Task>>;

    /// Create a workflow and its template rows in one transaction. Task
    /// order is dense and 1-based, taken from the request's ordering.
    async fn create_workflow(&self, request: &WorkflowRequest) -> EngineResult<Workflow>;

    async fn read_workflow(&self, workflow_id: WorkflowId) -> EngineResult<Option<Workflow>>;

    async fn read_workflows(&self) -> EngineResult<Vec<Workflow>>;

    /// Mark a workflow deprecated, optionally pointing at its successor.
    /// The successor reference is guidance for callers only and is never
    /// followed during run initialization.
    async fn deprecate_workflow(
        &self,
        request: &WorkflowDeprecationRequest,
    ) -> EngineResult<WorkflowId>;
}

/// Workflow run lifecycle. Status changes funnel through a single
/// transition hook per backend: entering Scheduled without an owner picks
/// the least-loaded live executor and publishes its `wr_scheduled` topic;
/// leaving an owned run for Canceled publishes `wr_canceled`; any terminal
/// status on a job's current run publishes `jobs`.
#[async_trait]
pub trait RunStore: Send + Sync {
    type ScheduledListener: ChangeListener<Message = RunScheduled>;
    type CancelListener: ChangeListener<Message = RunCanceled>;
    type ProgressListener: ChangeListener<Message = ProgressUpdate>;

    /// Snapshot a workflow template into a fresh run and its task queue,
    /// all-or-nothing. Deprecated workflows are rejected with the successor
    /// named in the error.
    async fn initialize_workflow_run(&self, workflow_id: WorkflowId)
        -> EngineResult<WorkflowRun>;

    async fn read_workflow_run(
        &self,
        workflow_run_id: WorkflowRunId,
    ) -> EngineResult<Option<WorkflowRun>>;

    async fn read_workflow_runs(&self) -> EngineResult<Vec<WorkflowRun>>;

    async fn schedule_workflow_run(&self, workflow_run_id: WorkflowRunId) -> EngineResult<()>;

    /// Schedule directly onto a chosen executor, bypassing the balancing
    /// pick but not the notification.
    async fn schedule_workflow_run_with_executor(
        &self,
        workflow_run_id: WorkflowRunId,
        executor_id: ExecutorId,
    ) -> EngineResult<()>;

    async fn cancel_workflow_run(&self, workflow_run_id: WorkflowRunId) -> EngineResult<()>;

    /// Archive and reset every task of a non-Running run, returning the run
    /// to Waiting with no owner. All-or-nothing.
    async fn restart_workflow_run(&self, workflow_run_id: WorkflowRunId) -> EngineResult<()>;

    /// Settle a run from its task distribution: all Complete → Complete;
    /// any Failed → Failed; any Rule Broken or Paused → Paused; any
    /// Canceled → Canceled; otherwise Paused. The owner is always cleared.
    async fn complete_workflow_run(&self, workflow_run_id: WorkflowRunId) -> EngineResult<()>;

    /// Recompute run progress from completed task counts, publishing
    /// `wr_progress` only when the value actually changed.
    async fn update_workflow_run_progress(
        &self,
        workflow_run_id: WorkflowRunId,
    ) -> EngineResult<()>;

    /// First phase of a hand-off: bookmark the earliest Waiting task by
    /// pausing it.
    async fn start_workflow_run_move(&self, workflow_run_id: WorkflowRunId) -> EngineResult<()>;

    /// Second phase: release the bookmark and rejoin the scheduled pool,
    /// which re-picks an executor through the transition hook.
    async fn complete_workflow_run_move(&self, workflow_run_id: WorkflowRunId)
        -> EngineResult<()>;

    /// Lease the next Scheduled run available to this executor, skipping
    /// contended rows. A valid run (no task outside Waiting/Complete) is
    /// atomically moved to Running under this executor and returned with
    /// `is_valid = true`; an invalid run is returned untouched so the
    /// caller can decide what to do with it.
    async fn next_workflow_run(
        &self,
        executor_id: ExecutorId,
    ) -> EngineResult<Option<ExecutorWorkflowRun>>;

    /// All runs currently owned by this executor, with validity flags, for
    /// startup reconciliation.
    async fn executor_workflow_runs(
        &self,
        executor_id: ExecutorId,
    ) -> EngineResult<Vec<ExecutorWorkflowRun>>;

    async fn scheduled_listener(
        &self,
        executor_id: ExecutorId,
    ) -> EngineResult<Self::ScheduledListener>;

    async fn cancel_listener(&self, executor_id: ExecutorId)
        -> EngineResult<Self::CancelListener>;

    async fn progress_listener(&self) -> EngineResult<Self::ProgressListener>;
}

/// Per-run task queue operations. Within a run, at most one task is ever
/// Running, and nothing is handed out while a sibling sits in Paused,
/// Failed or Rule Broken.
#[async_trait]
pub trait TaskQueueStore: Send + Sync {
    async fn read_task_queue_entry(
        &self,
        workflow_run_id: WorkflowRunId,
        task_order: i32,
    ) -> EngineResult<Option<TaskQueueRecord>>;

    /// Lease the next Waiting task of the run and mark it Running with
    /// `task_start` stamped, in one transaction. Returns `None` when the
    /// run has nothing dispatchable.
    async fn acquire_next_task(
        &self,
        workflow_run_id: WorkflowRunId,
    ) -> EngineResult<Option<TaskQueueRecord>>;

    /// Finish a Running task. Any failed rule forces Rule Broken; otherwise
    /// `is_paused` selects Paused over Complete. Run progress is
    /// recomputed.
    async fn complete_task_run(
        &self,
        workflow_run_id: WorkflowRunId,
        task_order: i32,
        is_paused: bool,
        output: Option<String>,
    ) -> EngineResult<()>;

    /// Fail a Running task with a non-blank message as its output.
    async fn fail_task_run(
        &self,
        workflow_run_id: WorkflowRunId,
        task_order: i32,
        message: &str,
    ) -> EngineResult<()>;

    /// Append a rule to a Running task, atomically.
    async fn append_task_rule(
        &self,
        workflow_run_id: WorkflowRunId,
        task_order: i32,
        rule: &TaskRule,
    ) -> EngineResult<()>;

    /// Update progress (0..=100) of a Running task.
    async fn set_task_progress(
        &self,
        workflow_run_id: WorkflowRunId,
        task_order: i32,
        progress: i16,
    ) -> EngineResult<()>;

    /// Manually complete a Paused task and return the run to the scheduled
    /// pool.
    async fn complete_task(
        &self,
        workflow_run_id: WorkflowRunId,
        task_order: i32,
    ) -> EngineResult<()>;

    /// Archive a Failed or Rule Broken task, reset it to Waiting and return
    /// the run to the scheduled pool. All-or-nothing.
    async fn retry_task(
        &self,
        workflow_run_id: WorkflowRunId,
        task_order: i32,
    ) -> EngineResult<()>;

    /// Archived snapshots for a run, newest first.
    async fn read_task_queue_archive(
        &self,
        workflow_run_id: WorkflowRunId,
    ) -> EngineResult<Vec<ArchivedTask>>;
}

/// Executor session registry, liveness and the ghost reaper.
#[async_trait]
pub trait ExecutorStore: Send + Sync {
    type StatusListener: ChangeListener<Message = ExecutorSignal>;

    async fn register_executor(
        &self,
        registration: &ExecutorRegistration,
    ) -> EngineResult<ExecutorId>;

    async fn read_executor(&self, executor_id: ExecutorId) -> EngineResult<Option<Executor>>;

    async fn read_executors(&self) -> EngineResult<Vec<Executor>>;

    async fn read_active_executors(&self) -> EngineResult<Vec<Executor>>;

    async fn executor_status(
        &self,
        executor_id: ExecutorId,
    ) -> EngineResult<Option<ExecutorStatus>>;

    /// Ask the executor to finish its current work and close.
    async fn shutdown_executor(&self, executor_id: ExecutorId) -> EngineResult<Option<Executor>>;

    /// Ask the executor to stop immediately.
    async fn cancel_executor(&self, executor_id: ExecutorId) -> EngineResult<Option<Executor>>;

    /// Final bookkeeping when an executor stops: stamp `exec_end`, set the
    /// terminal status and cancel any workflow runs it still owns, marking
    /// their Running tasks canceled with a fixed output message.
    async fn close_executor(
        &self,
        executor_id: ExecutorId,
        is_cancelled: bool,
    ) -> EngineResult<()>;

    /// Record a fatal error message against the executor. Best effort: a
    /// failure to record is logged, never raised.
    async fn post_executor_error(&self, executor_id: ExecutorId, message: &str);

    /// The liveness reaper: every Active executor whose heartbeat has gone
    /// stale is canceled the same way `close_executor(.., true)` would,
    /// recovering runs orphaned by vanished processes. Returns the reaped
    /// ids.
    async fn clean_executors(&self) -> EngineResult<Vec<ExecutorId>>;

    async fn heartbeat_executor(&self, executor_id: ExecutorId) -> EngineResult<()>;

    /// Pure selection of the least-loaded live executor: status Active, a
    /// fresh heartbeat, fewest owned runs, ties arbitrary.
    async fn next_executor(&self) -> EngineResult<Option<ExecutorId>>;

    async fn status_listener(
        &self,
        executor_id: ExecutorId,
    ) -> EngineResult<Self::StatusListener>;
}

/// Recurring jobs and the due-queue the scheduler loop consumes.
#[async_trait]
pub trait JobStore: Send + Sync {
    type JobsListener: ChangeListener<Message = JobsNotification>;

    async fn create_job(&self, request: &JobRequest) -> EngineResult<Job>;

    async fn read_job(&self, job_id: JobId) -> EngineResult<Option<Job>>;

    async fn read_jobs(&self) -> EngineResult<Vec<Job>>;

    /// Jobs that are due consideration: not paused and either without a
    /// current run or with one that finished Complete, ordered by
    /// `next_run`.
    async fn read_queued_jobs(&self) -> EngineResult<Vec<QueuedJob>>;

    /// Fire a job under its row lock: initialize and schedule a run, stamp
    /// it as the job's current run and advance `next_run` (interval jobs by
    /// their interval, scheduled jobs to the next absolute weekly slot).
    async fn run_job(&self, job_id: JobId) -> EngineResult<Job>;

    /// Settle a job after its run terminated. Refused while the run is
    /// still Scheduled or Running. A Complete run clears the job's current
    /// run and unpauses it; anything else pauses the job and the returned
    /// string carries the reason for the maintainer.
    async fn complete_job(&self, job_id: JobId) -> EngineResult<(Job, Option<String>)>;

    async fn jobs_listener(&self) -> EngineResult<Self::JobsListener>;
}

/// Blanket alias for a full store backend.
pub trait Store:
    WorkflowStore + RunStore + TaskQueueStore + ExecutorStore + JobStore + Clone + Send + Sync + 'static
{
}

impl<S> Store for S where
    S: WorkflowStore
        + RunStore
        + TaskQueueStore
        + ExecutorStore
        + JobStore
        + Clone
        + Send
        + Sync
        + 'static
{
}

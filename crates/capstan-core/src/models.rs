//! Record and identifier types shared by the store backends and the runtime
//! loops. Identifiers are thin wrappers around `i64` so ids of different
//! entities cannot be mixed up; statuses are stored as text and mapped
//! through `as_str`/`parse`.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
        )]
        #[sqlx(transparent)]
        pub struct $name(i64);

        impl $name {
            pub const fn as_i64(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl std::str::FromStr for $name {
            type Err = EngineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<i64>()
                    .map(Self)
                    .map_err(|_| EngineError::PayloadParse(s.to_owned()))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifier of a workflow template.
    WorkflowId
);
id_type!(
    /// Identifier of a task registry entry.
    TaskId
);
id_type!(
    /// Identifier of a task service.
    TaskServiceId
);
id_type!(
    /// Identifier of a workflow run.
    WorkflowRunId
);
id_type!(
    /// Identifier of a job.
    JobId
);
id_type!(
    /// Identifier of an executor session.
    ExecutorId
);

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowRunStatus {
    Waiting,
    Scheduled,
    Running,
    Paused,
    Failed,
    Complete,
    Canceled,
}

impl WorkflowRunStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Waiting" => Some(Self::Waiting),
            "Scheduled" => Some(Self::Scheduled),
            "Running" => Some(Self::Running),
            "Paused" => Some(Self::Paused),
            "Failed" => Some(Self::Failed),
            "Complete" => Some(Self::Complete),
            "Canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Scheduled => "Scheduled",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Failed => "Failed",
            Self::Complete => "Complete",
            Self::Canceled => "Canceled",
        }
    }

    /// A run in a terminal status no longer holds work for any executor.
    /// Scheduled and Running are the two live statuses a job must wait out.
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Scheduled | Self::Running)
    }
}

impl std::str::FromStr for WorkflowRunStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| EngineError::Generic(format!("unknown run status `{s}`")))
    }
}

/// Status of a single task queue row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Waiting,
    Running,
    Paused,
    Failed,
    #[serde(rename = "Rule Broken")]
    RuleBroken,
    Complete,
    Canceled,
}

impl TaskStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Waiting" => Some(Self::Waiting),
            "Running" => Some(Self::Running),
            "Paused" => Some(Self::Paused),
            "Failed" => Some(Self::Failed),
            "Rule Broken" => Some(Self::RuleBroken),
            "Complete" => Some(Self::Complete),
            "Canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Failed => "Failed",
            Self::RuleBroken => "Rule Broken",
            Self::Complete => "Complete",
            Self::Canceled => "Canceled",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| EngineError::Generic(format!("unknown task status `{s}`")))
    }
}

/// Status of an executor session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorStatus {
    Active,
    Canceled,
    Shutdown,
}

impl ExecutorStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Active" => Some(Self::Active),
            "Canceled" => Some(Self::Canceled),
            "Shutdown" => Some(Self::Shutdown),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Canceled => "Canceled",
            Self::Shutdown => "Shutdown",
        }
    }
}

impl std::str::FromStr for ExecutorStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| EngineError::Generic(format!("unknown executor status `{s}`")))
    }
}

/// Check recorded against a running task. Rules must carry a non-blank name;
/// a rule with `failed = true` forces the task's terminal status to
/// Rule Broken on completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRule {
    pub name: String,
    pub failed: bool,
    pub message: Option<String>,
}

impl TaskRule {
    pub fn validate(&self) -> EngineResult<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidRule(
                "rule name cannot be empty or whitespace".to_owned(),
            ));
        }
        Ok(())
    }
}

/// A rules array is valid when it is either absent or a non-empty list of
/// valid rules.
pub fn validate_rules(rules: Option<&[TaskRule]>) -> EngineResult<()> {
    let Some(rules) = rules else {
        return Ok(());
    };
    if rules.is_empty() {
        return Err(EngineError::InvalidRule(
            "a rules array must be null or non-empty".to_owned(),
        ));
    }
    for rule in rules {
        rule.validate()?;
    }
    Ok(())
}

/// One slot of a weekly job schedule. `day_of_week` is ISO style with
/// Monday = 1 through Sunday = 7; `time_of_day` is a UTC wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub day_of_week: i16,
    pub time_of_day: NaiveTime,
}

/// How a job decides its next run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobType {
    /// A fixed period between runs, in whole seconds.
    Interval { interval_seconds: i64 },
    /// A weekly schedule of one or more slots.
    Scheduled { schedule: Vec<ScheduleEntry> },
}

impl JobType {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Interval { .. } => "Interval",
            Self::Scheduled { .. } => "Scheduled",
        }
    }
}

/// Workflow template task as exposed through the workflow views: the
/// template row joined with the task registry and its service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub task_order: i32,
    pub task_id: TaskId,
    pub name: String,
    pub description: String,
    pub parameters: Option<Value>,
    pub service_name: String,
    pub url: String,
}

/// Workflow template with its ordered tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub is_deprecated: bool,
    pub new_workflow: Option<WorkflowId>,
    pub tasks: Vec<WorkflowTask>,
}

/// Template row requested when creating a workflow. Order is implied by the
/// position within the request.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowTaskRequest {
    pub task_id: TaskId,
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRequest {
    pub name: String,
    pub tasks: Vec<WorkflowTaskRequest>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WorkflowDeprecationRequest {
    pub workflow_id: WorkflowId,
    pub new_workflow_id: Option<WorkflowId>,
}

/// A remote service hosting task bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskService {
    pub service_id: TaskServiceId,
    pub name: String,
    pub base_url: String,
}

/// Task registry entry as exposed through `v_tasks`; `url` is the effective
/// URL joined from the service base and the task path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub name: String,
    pub description: String,
    pub url: String,
    pub task_service_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskRequest {
    pub name: String,
    pub description: String,
    pub task_service_id: TaskServiceId,
    pub url: String,
}

/// Task entry of a workflow run as exposed through the run views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunTask {
    pub task_order: i32,
    pub task_id: TaskId,
    pub name: String,
    pub description: String,
    pub task_status: TaskStatus,
    pub parameters: Option<Value>,
    pub output: Option<String>,
    pub rules: Option<Vec<TaskRule>>,
    pub task_start: Option<DateTime<Utc>>,
    pub task_end: Option<DateTime<Utc>>,
    pub progress: Option<i16>,
}

/// Workflow run with its ordered tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub workflow_run_id: WorkflowRunId,
    pub workflow_id: WorkflowId,
    pub status: WorkflowRunStatus,
    pub executor_id: Option<ExecutorId>,
    pub progress: Option<i16>,
    pub tasks: Vec<WorkflowRunTask>,
}

/// Run summary returned by the executor-facing lease and reconciliation
/// operations. A run is valid when none of its tasks sit outside
/// Waiting/Complete.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ExecutorWorkflowRun {
    pub workflow_run_id: WorkflowRunId,
    pub status: WorkflowRunStatus,
    pub is_valid: bool,
}

/// The dispatchable slice of a task queue row handed to an executor: ids,
/// the opaque parameters and the effective URL of the task body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueueRecord {
    pub workflow_run_id: WorkflowRunId,
    pub task_order: i32,
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub parameters: Option<Value>,
    pub url: String,
}

/// Snapshot of a task queue row captured immediately before a retry or a
/// run restart.
#[derive(Debug, Clone, Serialize)]
pub struct ArchivedTask {
    pub workflow_run_id: WorkflowRunId,
    pub task_order: i32,
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub parameters: Option<Value>,
    pub output: Option<String>,
    pub rules: Option<Vec<TaskRule>>,
    pub task_start: Option<DateTime<Utc>>,
    pub task_end: Option<DateTime<Utc>>,
    pub progress: Option<i16>,
    pub archived_at: DateTime<Utc>,
}

/// Executor session row as exposed through the executor views.
#[derive(Debug, Clone, Serialize)]
pub struct Executor {
    pub executor_id: ExecutorId,
    pub pid: i32,
    pub username: String,
    pub application_name: String,
    pub client_addr: String,
    pub client_port: i32,
    pub exec_start: DateTime<Utc>,
    pub exec_end: Option<DateTime<Utc>>,
    pub status: ExecutorStatus,
    pub error_message: Option<String>,
    pub session_active: bool,
    pub workflow_run_count: i64,
}

/// Session metadata captured when an executor registers.
#[derive(Debug, Clone)]
pub struct ExecutorRegistration {
    pub pid: i32,
    pub username: String,
    pub application_name: String,
    pub client_addr: String,
    pub client_port: i32,
}

impl ExecutorRegistration {
    /// Registration details for an executor running inside this process.
    pub fn local(application_name: &str) -> Self {
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_owned());
        Self {
            pid: std::process::id() as i32,
            username,
            application_name: application_name.to_owned(),
            client_addr: "127.0.0.1".to_owned(),
            client_port: 0,
        }
    }
}

/// Job row as exposed through `v_jobs`: the job plus its workflow name and
/// the current run's status, executor and progress when one exists.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: JobId,
    pub workflow_id: WorkflowId,
    pub workflow_name: String,
    pub job_type: JobType,
    pub maintainer: String,
    pub is_paused: bool,
    pub next_run: DateTime<Utc>,
    pub current_workflow_run_id: Option<WorkflowRunId>,
    pub workflow_run_status: Option<WorkflowRunStatus>,
    pub executor_id: Option<ExecutorId>,
    pub progress: Option<i16>,
}

/// Minimum job details the scheduler loop keeps in memory, fetched from
/// `v_queued_jobs`.
#[derive(Debug, Clone, Copy)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub next_run: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    pub workflow_id: WorkflowId,
    pub maintainer: String,
    pub job_type: JobType,
    pub next_run: Option<DateTime<Utc>>,
}

/// Output message stamped on tasks orphaned by a lost or cancelled executor.
pub const EXECUTOR_CANCELED_OUTPUT: &str = "Task executor canceled workflow run";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trips_through_text() {
        for status in [
            TaskStatus::Waiting,
            TaskStatus::Running,
            TaskStatus::Paused,
            TaskStatus::Failed,
            TaskStatus::RuleBroken,
            TaskStatus::Complete,
            TaskStatus::Canceled,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::RuleBroken.as_str(), "Rule Broken");
        assert!(TaskStatus::parse("waiting").is_none());
    }

    #[test]
    fn run_status_terminality() {
        assert!(WorkflowRunStatus::Complete.is_terminal());
        assert!(WorkflowRunStatus::Failed.is_terminal());
        assert!(WorkflowRunStatus::Waiting.is_terminal());
        assert!(!WorkflowRunStatus::Scheduled.is_terminal());
        assert!(!WorkflowRunStatus::Running.is_terminal());
    }

    #[test]
    fn rules_array_must_be_null_or_non_empty() {
        assert!(validate_rules(None).is_ok());
        assert!(validate_rules(Some(&[])).is_err());
        let rule = TaskRule {
            name: "limit".to_owned(),
            failed: false,
            message: None,
        };
        assert!(validate_rules(Some(std::slice::from_ref(&rule))).is_ok());
        let blank = TaskRule {
            name: "   ".to_owned(),
            failed: true,
            message: None,
        };
        assert!(validate_rules(Some(&[blank])).is_err());
    }

    #[test]
    fn rule_broken_serde_rename() {
        let json = serde_json::to_string(&TaskStatus::RuleBroken).unwrap();
        assert_eq!(json, "\"Rule Broken\"");
    }
}

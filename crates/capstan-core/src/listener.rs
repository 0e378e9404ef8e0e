//! Topic-addressed change notifications. Topic names are literal, stable
//! identifiers; payloads are parsed leniently because delivery is best
//! effort and a malformed payload must never kill a listening loop.

use async_trait::async_trait;
use tracing::warn;

use crate::error::EngineResult;
use crate::models::{ExecutorId, JobId, WorkflowRunId};

pub const JOBS_TOPIC: &str = "jobs";
pub const PROGRESS_TOPIC: &str = "wr_progress";

pub fn scheduled_topic(executor_id: ExecutorId) -> String {
    format!("wr_scheduled_{executor_id}")
}

pub fn canceled_topic(executor_id: ExecutorId) -> String {
    format!("wr_canceled_{executor_id}")
}

pub fn executor_status_topic(executor_id: ExecutorId) -> String {
    format!("exec_status_{executor_id}")
}

/// A subscription to one topic. Backends decide the transport; consumers
/// only ever see the parsed message type.
#[async_trait]
pub trait ChangeListener: Send {
    type Message: Send;

    async fn recv(&mut self) -> EngineResult<Self::Message>;
}

/// Control message sent to a single executor on its status topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorSignal {
    Cancel,
    Shutdown,
    NoOp,
}

impl ExecutorSignal {
    pub const fn is_cancel(&self) -> bool {
        matches!(self, Self::Cancel)
    }

    pub const fn as_payload(&self) -> &'static str {
        match self {
            Self::Cancel => "cancel",
            Self::Shutdown => "shutdown",
            Self::NoOp => "",
        }
    }
}

impl From<&str> for ExecutorSignal {
    fn from(payload: &str) -> Self {
        match payload {
            "cancel" => Self::Cancel,
            "shutdown" => Self::Shutdown,
            _ => Self::NoOp,
        }
    }
}

/// A workflow run was assigned to the listening executor. The payload
/// carries the run id but the wake-up itself is the signal; an unparsable
/// payload still wakes the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunScheduled(pub Option<WorkflowRunId>);

impl From<&str> for RunScheduled {
    fn from(payload: &str) -> Self {
        Self(parse_id(payload, "workflow_run_id"))
    }
}

/// A run owned by the listening executor was canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunCanceled(pub Option<WorkflowRunId>);

impl From<&str> for RunCanceled {
    fn from(payload: &str) -> Self {
        Self(parse_id(payload, "workflow_run_id"))
    }
}

/// Progress changed on some workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate(pub Option<WorkflowRunId>);

impl From<&str> for ProgressUpdate {
    fn from(payload: &str) -> Self {
        Self(parse_id(payload, "workflow_run_id"))
    }
}

/// Message on the `jobs` topic. An empty payload means the queue changed in
/// some way and should be reloaded; a job id asks the scheduler to settle
/// that job after its run terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobsNotification {
    Reload,
    Settle(JobId),
}

impl From<&str> for JobsNotification {
    fn from(payload: &str) -> Self {
        if payload.is_empty() {
            return Self::Reload;
        }
        match payload.parse::<i64>() {
            Ok(job_id) => Self::Settle(job_id.into()),
            Err(_) => {
                warn!(payload, "unparsable jobs notification, reloading queue");
                Self::Reload
            }
        }
    }
}

fn parse_id<T: From<i64>>(payload: &str, what: &str) -> Option<T> {
    match payload.parse::<i64>() {
        Ok(value) => Some(T::from(value)),
        Err(_) => {
            warn!(payload, "cannot parse {what} from notification payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_signal_payload_round_trip() {
        assert_eq!(ExecutorSignal::from("cancel"), ExecutorSignal::Cancel);
        assert_eq!(ExecutorSignal::from("shutdown"), ExecutorSignal::Shutdown);
        assert_eq!(ExecutorSignal::from("anything"), ExecutorSignal::NoOp);
        assert!(ExecutorSignal::Cancel.is_cancel());
        assert!(!ExecutorSignal::Shutdown.is_cancel());
    }

    #[test]
    fn run_messages_parse_ids_leniently() {
        assert_eq!(RunScheduled::from("42"), RunScheduled(Some(42.into())));
        assert_eq!(RunScheduled::from("junk"), RunScheduled(None));
        assert_eq!(RunCanceled::from("7"), RunCanceled(Some(7.into())));
    }

    #[test]
    fn jobs_notification_variants() {
        assert_eq!(JobsNotification::from(""), JobsNotification::Reload);
        assert_eq!(JobsNotification::from("12"), JobsNotification::Settle(12.into()));
        assert_eq!(JobsNotification::from("x"), JobsNotification::Reload);
    }

    #[test]
    fn topic_names_are_stable() {
        let id = ExecutorId::from(9);
        assert_eq!(scheduled_topic(id), "wr_scheduled_9");
        assert_eq!(canceled_topic(id), "wr_canceled_9");
        assert_eq!(executor_status_topic(id), "exec_status_9");
    }
}

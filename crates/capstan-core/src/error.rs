use thiserror::Error;

use crate::models::WorkflowId;

/// Error type shared by the store backends and the runtime loops.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An operation was requested against a record whose current state does
    /// not allow it. No state change occurred and a retry will not help.
    #[error("{0}")]
    Precondition(String),

    #[error("no {entity} record found for key {pk}")]
    NotFound { entity: &'static str, pk: String },

    #[error("invalid job schedule: {0}")]
    InvalidSchedule(String),

    #[error("invalid task rule: {0}")]
    InvalidRule(String),

    #[error("cannot initialize a run for deprecated workflow {workflow_id} (successor: {new_workflow:?})")]
    DeprecatedWorkflow {
        workflow_id: WorkflowId,
        new_workflow: Option<WorkflowId>,
    },

    /// The task service closed its response stream without sending a done
    /// message.
    #[error("task service stream ended before a done message")]
    TaskExited,

    #[error("could not parse notification payload `{0}`")]
    PayloadParse(String),

    #[error("notification channel closed")]
    ListenerClosed,

    #[error(transparent)]
    Sql(#[from] sqlx::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Generic(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Shorthand for a precondition failure with a formatted message.
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }
}

//! Error types for the conductor engine.
//!
//! Contract violations (bad task ids, illegal status transitions, malformed
//! graphs) surface as [`EngineError`] immediately. Expression evaluation
//! failures during a workflow run are recorded as [`ExecutionError`] entries
//! on the conductor's error log instead, so one bad expression cannot abort
//! the host's control loop.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::machines::Status;

/// Engine-level errors for composition and conducting.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Task id is not part of the execution graph
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// Status name could not be parsed
    #[error("Unknown status: {0}")]
    UnknownStatus(String),

    /// Requested task status transition is not in the task state machine
    #[error("Invalid task status transition: {from} -> {to}")]
    InvalidTaskTransition {
        /// Status recorded on the task's latest flow entry.
        from: Status,
        /// Status the caller asked for.
        to: Status,
    },

    /// Requested workflow status transition is not in the workflow state machine
    #[error("Invalid workflow status transition: {from} -> {to}")]
    InvalidWorkflowTransition {
        /// Current workflow status.
        from: Status,
        /// Status the caller asked for.
        to: Status,
    },

    /// More than one existing edge matches the same (source, destination, criteria)
    #[error("Ambiguous transition: multiple edges match {src} -> {destination} with identical criteria")]
    AmbiguousTransition {
        /// Source task id.
        src: String,
        /// Destination task id.
        destination: String,
    },

    /// No composer is registered for the definition's model tag
    #[error("Unsupported workflow model: {0}")]
    UnsupportedModel(String),

    /// Cycle found where the model requires an acyclic graph
    #[error("Cycle detected in workflow graph involving tasks: {0:?}")]
    CycleDetected(Vec<String>),

    /// Workflow definition failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Workflow definition document could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Expression could not be evaluated
    #[error("Expression error: {0}")]
    Expression(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using [`EngineError`].
pub type EngineResult<T> = Result<T, EngineError>;

/// One entry in the conductor's execution error log.
///
/// Recorded for expression failures caught during input rendering, criteria
/// evaluation, publish rendering, or output rendering. The log is append-only
/// and serialized with the conductor checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Task the failure is attributed to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Failure message.
    pub message: String,
}

impl ExecutionError {
    /// Create a workflow-level error with no task attribution.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            task_id: None,
            message: message.into(),
        }
    }

    /// Create an error attributed to a task.
    pub fn for_task(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_display() {
        let err = EngineError::InvalidTaskTransition {
            from: Status::Unset,
            to: Status::Succeeded,
        };
        assert_eq!(
            err.to_string(),
            "Invalid task status transition: unset -> succeeded"
        );
    }

    #[test]
    fn test_execution_error_serialization() {
        let err = ExecutionError::for_task("task1", "undefined variable 'foo'");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["task_id"], "task1");

        let err = ExecutionError::new("bad input expression");
        let json = serde_json::to_value(&err).unwrap();
        assert!(json.get("task_id").is_none());
    }
}

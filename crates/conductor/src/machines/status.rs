//! Status vocabulary shared by tasks and workflows.
//!
//! A single status set covers both levels: the task machine and the workflow
//! machine each allow a different subset of transitions over it, but family
//! predicates (active, completed, abended) are the same on both sides.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Execution status of a task or a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// No status recorded yet.
    Unset,
    /// Execution has been requested from the host.
    Requested,
    /// Host has scheduled the execution.
    Scheduled,
    /// Execution is waiting out a delay.
    Delayed,
    /// Execution is in progress.
    Running,
    /// Execution is waiting on an external signal.
    Pending,
    /// Pause requested, still winding down.
    Pausing,
    /// Paused.
    Paused,
    /// Resume requested, not yet running again.
    Resuming,
    /// Completed successfully.
    Succeeded,
    /// Completed with an error.
    Failed,
    /// Timed out.
    Expired,
    /// Abandoned by the host.
    Abandoned,
    /// Cancel requested, still winding down.
    Canceling,
    /// Canceled.
    Canceled,
}

impl Status {
    /// All statuses, in declaration order.
    pub const ALL: [Status; 15] = [
        Status::Unset,
        Status::Requested,
        Status::Scheduled,
        Status::Delayed,
        Status::Running,
        Status::Pending,
        Status::Pausing,
        Status::Paused,
        Status::Resuming,
        Status::Succeeded,
        Status::Failed,
        Status::Expired,
        Status::Abandoned,
        Status::Canceling,
        Status::Canceled,
    ];

    /// Check whether work is still in flight for this status.
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Requested
                | Self::Scheduled
                | Self::Delayed
                | Self::Running
                | Self::Pausing
                | Self::Resuming
                | Self::Canceling
        )
    }

    /// Check whether this is a completed-class status (terminal for one run).
    pub const fn is_completed(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Expired | Self::Abandoned | Self::Canceled
        )
    }

    /// Check whether this is an abnormal completion.
    pub const fn is_abended(&self) -> bool {
        matches!(self, Self::Failed | Self::Expired | Self::Abandoned)
    }

    /// Check whether this is a terminal workflow status.
    pub const fn is_terminal(&self) -> bool {
        self.is_completed()
    }

    /// Check whether a workflow in this status is accepting task dispatch.
    pub const fn is_running_family(&self) -> bool {
        matches!(self, Self::Running | Self::Resuming)
    }

    /// Check whether this status belongs to the pause family.
    pub const fn is_pause_family(&self) -> bool {
        matches!(self, Self::Pausing | Self::Paused)
    }

    /// Check whether this status belongs to the cancel family.
    pub const fn is_cancel_family(&self) -> bool {
        matches!(self, Self::Canceling | Self::Canceled)
    }

    /// Snake-case name, also used to build state machine event names.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Requested => "requested",
            Self::Scheduled => "scheduled",
            Self::Delayed => "delayed",
            Self::Running => "running",
            Self::Pending => "pending",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Resuming => "resuming",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Abandoned => "abandoned",
            Self::Canceling => "canceling",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unset" | "null" => Ok(Self::Unset),
            "requested" => Ok(Self::Requested),
            "scheduled" => Ok(Self::Scheduled),
            "delayed" => Ok(Self::Delayed),
            "running" => Ok(Self::Running),
            "pending" => Ok(Self::Pending),
            "pausing" => Ok(Self::Pausing),
            "paused" => Ok(Self::Paused),
            "resuming" => Ok(Self::Resuming),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "expired" | "timeout" => Ok(Self::Expired),
            "abandoned" => Ok(Self::Abandoned),
            "canceling" | "cancelling" => Ok(Self::Canceling),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            other => Err(EngineError::UnknownStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_families() {
        assert!(Status::Running.is_active());
        assert!(Status::Canceling.is_active());
        assert!(!Status::Pending.is_active());
        assert!(!Status::Paused.is_active());

        assert!(Status::Succeeded.is_completed());
        assert!(Status::Canceled.is_completed());
        assert!(!Status::Pausing.is_completed());

        assert!(Status::Expired.is_abended());
        assert!(!Status::Canceled.is_abended());

        assert!(Status::Resuming.is_running_family());
        assert!(!Status::Paused.is_running_family());
    }

    #[test]
    fn test_status_roundtrip() {
        for status in Status::ALL {
            let parsed: Status = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_status_aliases() {
        assert_eq!("cancelled".parse::<Status>().unwrap(), Status::Canceled);
        assert_eq!("timeout".parse::<Status>().unwrap(), Status::Expired);
        assert!("bogus".parse::<Status>().is_err());
    }

    #[test]
    fn test_status_serde_snake_case() {
        let json = serde_json::to_string(&Status::Succeeded).unwrap();
        assert_eq!(json, "\"succeeded\"");
        let status: Status = serde_json::from_str("\"canceling\"").unwrap();
        assert_eq!(status, Status::Canceling);
    }
}

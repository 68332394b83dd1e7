//! Task and workflow status state machines.
//!
//! Two static transition tables, each keyed `(old status) -> {event -> new
//! status}`. The task table is driven directly by action-execution event
//! names. The workflow table is driven by qualified event names: a raw task
//! completion is combined with auxiliary predicates (is anything else still
//! active, is there remaining work, was a failure handled) before lookup, so
//! that the same completion maps to different workflow statuses depending on
//! what the rest of the flow is doing.

pub mod status;

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::error::{EngineError, EngineResult};

pub use status::Status;

/// Synthetic task event for the reserved `noop` pseudo-task.
pub const TASK_NOOP_REQUESTED: &str = "noop_requested";
/// Synthetic task event for the reserved `fail` pseudo-task.
pub const TASK_FAIL_REQUESTED: &str = "fail_requested";

type Machine = HashMap<Status, HashMap<&'static str, Status>>;

fn row(entries: &[(&'static str, Status)]) -> HashMap<&'static str, Status> {
    entries.iter().copied().collect()
}

/// Task state machine.
///
/// Events are the snake-case status names requested by the host, plus the
/// synthetic `noop_requested`/`fail_requested` events used by the reserved
/// pseudo-tasks. Completed-class statuses have no outgoing rows: a cyclic
/// re-entry or a retry opens a fresh flow entry instead of reviving one.
static TASK_MACHINE: Lazy<Machine> = Lazy::new(|| {
    use Status::*;

    let mut machine = Machine::new();
    machine.insert(
        Unset,
        row(&[
            ("requested", Requested),
            ("scheduled", Scheduled),
            ("delayed", Delayed),
            ("running", Running),
            ("pending", Pending),
            ("canceled", Canceled),
            ("failed", Failed),
            (TASK_FAIL_REQUESTED, Failed),
        ]),
    );
    machine.insert(
        Requested,
        row(&[
            ("scheduled", Scheduled),
            ("delayed", Delayed),
            ("running", Running),
            ("pausing", Pausing),
            ("paused", Paused),
            ("canceling", Canceling),
            ("canceled", Canceled),
            ("failed", Failed),
            ("expired", Expired),
            ("abandoned", Abandoned),
        ]),
    );
    machine.insert(
        Scheduled,
        row(&[
            ("delayed", Delayed),
            ("running", Running),
            ("pausing", Pausing),
            ("paused", Paused),
            ("canceling", Canceling),
            ("canceled", Canceled),
            ("failed", Failed),
            ("expired", Expired),
            ("abandoned", Abandoned),
        ]),
    );
    machine.insert(
        Delayed,
        row(&[
            ("scheduled", Scheduled),
            ("running", Running),
            ("canceling", Canceling),
            ("canceled", Canceled),
            ("failed", Failed),
            ("expired", Expired),
            ("abandoned", Abandoned),
        ]),
    );
    machine.insert(
        Running,
        row(&[
            ("pending", Pending),
            ("pausing", Pausing),
            ("paused", Paused),
            ("canceling", Canceling),
            ("canceled", Canceled),
            ("succeeded", Succeeded),
            ("failed", Failed),
            ("expired", Expired),
            ("abandoned", Abandoned),
            (TASK_NOOP_REQUESTED, Succeeded),
            (TASK_FAIL_REQUESTED, Failed),
        ]),
    );
    machine.insert(
        Pending,
        row(&[
            ("running", Running),
            ("paused", Paused),
            ("succeeded", Succeeded),
            ("failed", Failed),
            ("canceled", Canceled),
        ]),
    );
    machine.insert(
        Pausing,
        row(&[
            ("paused", Paused),
            ("canceling", Canceling),
            ("canceled", Canceled),
            ("failed", Failed),
            ("succeeded", Succeeded),
        ]),
    );
    machine.insert(
        Paused,
        row(&[
            ("running", Running),
            ("resuming", Resuming),
            ("canceling", Canceling),
            ("canceled", Canceled),
        ]),
    );
    machine.insert(
        Resuming,
        row(&[
            ("running", Running),
            ("canceling", Canceling),
            ("canceled", Canceled),
        ]),
    );
    machine.insert(
        Canceling,
        row(&[
            ("canceled", Canceled),
            ("succeeded", Succeeded),
            ("failed", Failed),
            ("expired", Expired),
            ("abandoned", Abandoned),
        ]),
    );
    machine
});

/// Workflow state machine, keyed by qualified event names.
static WORKFLOW_MACHINE: Lazy<Machine> = Lazy::new(|| {
    use Status::*;

    let mut machine = Machine::new();
    machine.insert(
        Unset,
        row(&[
            ("workflow_running_requested", Running),
            ("workflow_canceled_requested", Canceled),
            ("workflow_failed", Failed),
        ]),
    );
    machine.insert(
        Running,
        row(&[
            ("workflow_pausing_requested", Pausing),
            ("workflow_paused_requested", Paused),
            ("workflow_canceling_requested", Canceling),
            ("workflow_canceled_requested", Canceled),
            ("workflow_failed", Failed),
            ("task_active", Running),
            ("task_succeeded_workflow_active_incomplete", Running),
            ("task_succeeded_workflow_active_complete", Running),
            ("task_succeeded_workflow_dormant_incomplete", Running),
            ("task_succeeded_workflow_dormant_complete", Succeeded),
            ("task_pending_workflow_active", Running),
            ("task_pending_workflow_dormant", Paused),
            ("task_paused_workflow_active", Running),
            ("task_paused_workflow_dormant", Paused),
            ("task_failed_workflow_active_handled", Running),
            ("task_failed_workflow_dormant_handled", Running),
            ("task_failed_workflow_active_unhandled", Failed),
            ("task_failed_workflow_dormant_unhandled", Failed),
            ("task_canceled_workflow_active", Canceling),
            ("task_canceled_workflow_dormant", Canceled),
        ]),
    );
    machine.insert(
        Pausing,
        row(&[
            ("workflow_paused_requested", Paused),
            ("workflow_running_requested", Running),
            ("workflow_canceling_requested", Canceling),
            ("workflow_canceled_requested", Canceled),
            ("workflow_failed", Failed),
            ("task_active", Pausing),
            ("task_succeeded_workflow_active_incomplete", Pausing),
            ("task_succeeded_workflow_active_complete", Pausing),
            ("task_succeeded_workflow_dormant_incomplete", Paused),
            ("task_succeeded_workflow_dormant_complete", Paused),
            ("task_pending_workflow_active", Pausing),
            ("task_pending_workflow_dormant", Paused),
            ("task_paused_workflow_active", Pausing),
            ("task_paused_workflow_dormant", Paused),
            ("task_failed_workflow_active_handled", Pausing),
            ("task_failed_workflow_dormant_handled", Paused),
            ("task_failed_workflow_active_unhandled", Failed),
            ("task_failed_workflow_dormant_unhandled", Failed),
            ("task_canceled_workflow_active", Canceling),
            ("task_canceled_workflow_dormant", Canceled),
        ]),
    );
    machine.insert(
        Paused,
        row(&[
            ("workflow_running_requested", Running),
            ("workflow_resuming_requested", Resuming),
            ("workflow_canceling_requested", Canceling),
            ("workflow_canceled_requested", Canceled),
            ("workflow_failed", Failed),
        ]),
    );
    machine.insert(
        Resuming,
        row(&[
            ("workflow_running_requested", Running),
            ("workflow_pausing_requested", Pausing),
            ("workflow_paused_requested", Paused),
            ("workflow_canceling_requested", Canceling),
            ("workflow_canceled_requested", Canceled),
            ("workflow_failed", Failed),
            ("task_active", Running),
            ("task_succeeded_workflow_active_incomplete", Running),
            ("task_succeeded_workflow_active_complete", Running),
            ("task_succeeded_workflow_dormant_incomplete", Running),
            ("task_succeeded_workflow_dormant_complete", Succeeded),
            ("task_failed_workflow_active_handled", Running),
            ("task_failed_workflow_dormant_handled", Running),
            ("task_failed_workflow_active_unhandled", Failed),
            ("task_failed_workflow_dormant_unhandled", Failed),
            ("task_canceled_workflow_active", Canceling),
            ("task_canceled_workflow_dormant", Canceled),
        ]),
    );
    machine.insert(
        Canceling,
        row(&[
            ("workflow_canceled_requested", Canceled),
            ("workflow_failed", Canceled),
            ("task_active", Canceling),
            ("task_succeeded_workflow_active_incomplete", Canceling),
            ("task_succeeded_workflow_active_complete", Canceling),
            ("task_succeeded_workflow_dormant_incomplete", Canceled),
            ("task_succeeded_workflow_dormant_complete", Canceled),
            ("task_pending_workflow_active", Canceling),
            ("task_pending_workflow_dormant", Canceled),
            ("task_paused_workflow_active", Canceling),
            ("task_paused_workflow_dormant", Canceled),
            ("task_failed_workflow_active_handled", Canceling),
            ("task_failed_workflow_active_unhandled", Canceling),
            ("task_failed_workflow_dormant_handled", Canceled),
            ("task_failed_workflow_dormant_unhandled", Canceled),
            ("task_canceled_workflow_active", Canceling),
            ("task_canceled_workflow_dormant", Canceled),
        ]),
    );
    machine
});

/// Auxiliary predicates used to qualify a raw task event for the workflow
/// machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkflowEventContext {
    /// Any other flow entry is in an active status.
    pub workflow_active: bool,
    /// The completing task left work behind: staged tasks or satisfied
    /// outbound transitions awaiting staging.
    pub workflow_incomplete: bool,
    /// An abnormal completion was remediated by a satisfied error transition
    /// or remaining retries.
    pub failure_handled: bool,
}

/// Convert a raw task completion plus auxiliary predicates into a qualified
/// workflow event name.
pub fn derive_workflow_event(task_status: Status, ctx: WorkflowEventContext) -> String {
    let activity = if ctx.workflow_active {
        "active"
    } else {
        "dormant"
    };

    if task_status.is_abended() {
        let outcome = if ctx.failure_handled {
            "handled"
        } else {
            "unhandled"
        };
        return format!("task_failed_workflow_{activity}_{outcome}");
    }

    match task_status {
        Status::Succeeded => {
            let progress = if ctx.workflow_incomplete {
                "incomplete"
            } else {
                "complete"
            };
            format!("task_succeeded_workflow_{activity}_{progress}")
        }
        Status::Canceled => format!("task_canceled_workflow_{activity}"),
        Status::Paused => format!("task_paused_workflow_{activity}"),
        Status::Pending => format!("task_pending_workflow_{activity}"),
        _ => "task_active".to_string(),
    }
}

/// Map a host status request onto a workflow event name. Pause and cancel
/// requests land on the `-ing` form while tasks remain active.
pub fn workflow_request_event(requested: Status, has_active_tasks: bool) -> EngineResult<String> {
    let event = match requested {
        Status::Running => "workflow_running_requested",
        Status::Resuming => "workflow_resuming_requested",
        Status::Pausing => "workflow_pausing_requested",
        Status::Paused => {
            if has_active_tasks {
                "workflow_pausing_requested"
            } else {
                "workflow_paused_requested"
            }
        }
        Status::Canceling => "workflow_canceling_requested",
        Status::Canceled => {
            if has_active_tasks {
                "workflow_canceling_requested"
            } else {
                "workflow_canceled_requested"
            }
        }
        Status::Failed => "workflow_failed",
        other => return Err(EngineError::UnknownStatus(other.to_string())),
    };
    Ok(event.to_string())
}

/// Look up the task machine for `(old status, event)`.
pub fn task_transition(old: Status, event: &str) -> Option<Status> {
    TASK_MACHINE
        .get(&old)
        .and_then(|events| events.get(event))
        .copied()
}

/// Look up the workflow machine for `(old status, event)`.
pub fn workflow_transition(old: Status, event: &str) -> Option<Status> {
    WORKFLOW_MACHINE
        .get(&old)
        .and_then(|events| events.get(event))
        .copied()
}

/// Check whether `(old, new)` is a legal task transition. Same-state
/// transitions are always legal as idempotent no-ops.
pub fn is_task_transition_valid(old: Status, new: Status) -> bool {
    if old == new {
        return true;
    }
    TASK_MACHINE
        .get(&old)
        .map(|events| events.values().any(|target| *target == new))
        .unwrap_or(false)
}

/// Check whether `(old, new)` is a legal workflow transition. Same-state
/// transitions are always legal as idempotent no-ops.
pub fn is_workflow_transition_valid(old: Status, new: Status) -> bool {
    if old == new {
        return true;
    }
    WORKFLOW_MACHINE
        .get(&old)
        .map(|events| events.values().any(|target| *target == new))
        .unwrap_or(false)
}

/// Validate a task transition, returning a typed error on an illegal pair.
pub fn validate_task_transition(old: Status, new: Status) -> EngineResult<()> {
    if is_task_transition_valid(old, new) {
        Ok(())
    } else {
        Err(EngineError::InvalidTaskTransition { from: old, to: new })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_machine_basic_path() {
        assert_eq!(
            task_transition(Status::Unset, "running"),
            Some(Status::Running)
        );
        assert_eq!(
            task_transition(Status::Running, "succeeded"),
            Some(Status::Succeeded)
        );
        assert_eq!(task_transition(Status::Succeeded, "running"), None);
    }

    #[test]
    fn test_unset_to_succeeded_is_invalid() {
        assert!(!is_task_transition_valid(Status::Unset, Status::Succeeded));
        assert!(matches!(
            validate_task_transition(Status::Unset, Status::Succeeded),
            Err(EngineError::InvalidTaskTransition {
                from: Status::Unset,
                to: Status::Succeeded,
            })
        ));
    }

    #[test]
    fn test_same_state_is_always_valid() {
        for status in Status::ALL {
            assert!(is_task_transition_valid(status, status));
            assert!(is_workflow_transition_valid(status, status));
        }
    }

    #[test]
    fn test_derive_succeeded_events() {
        let event = derive_workflow_event(
            Status::Succeeded,
            WorkflowEventContext {
                workflow_active: true,
                workflow_incomplete: true,
                failure_handled: false,
            },
        );
        assert_eq!(event, "task_succeeded_workflow_active_incomplete");

        let event = derive_workflow_event(Status::Succeeded, WorkflowEventContext::default());
        assert_eq!(event, "task_succeeded_workflow_dormant_complete");
        assert_eq!(
            workflow_transition(Status::Running, &event),
            Some(Status::Succeeded)
        );
    }

    #[test]
    fn test_derive_failure_events() {
        let unhandled = derive_workflow_event(Status::Failed, WorkflowEventContext::default());
        assert_eq!(unhandled, "task_failed_workflow_dormant_unhandled");
        assert_eq!(
            workflow_transition(Status::Running, &unhandled),
            Some(Status::Failed)
        );

        let handled = derive_workflow_event(
            Status::Expired,
            WorkflowEventContext {
                workflow_active: false,
                workflow_incomplete: true,
                failure_handled: true,
            },
        );
        assert_eq!(handled, "task_failed_workflow_dormant_handled");
        assert_eq!(
            workflow_transition(Status::Running, &handled),
            Some(Status::Running)
        );
    }

    #[test]
    fn test_pausing_converges_to_paused() {
        let event = derive_workflow_event(Status::Succeeded, WorkflowEventContext::default());
        assert_eq!(
            workflow_transition(Status::Pausing, &event),
            Some(Status::Paused)
        );
    }

    #[test]
    fn test_failure_preempts_pause() {
        let event = derive_workflow_event(Status::Failed, WorkflowEventContext::default());
        assert_eq!(
            workflow_transition(Status::Pausing, &event),
            Some(Status::Failed)
        );
    }

    #[test]
    fn test_cancel_preempts_failure() {
        let event = derive_workflow_event(Status::Failed, WorkflowEventContext::default());
        assert_eq!(
            workflow_transition(Status::Canceling, &event),
            Some(Status::Canceled)
        );
    }

    #[test]
    fn test_request_events() {
        assert_eq!(
            workflow_request_event(Status::Paused, true).unwrap(),
            "workflow_pausing_requested"
        );
        assert_eq!(
            workflow_request_event(Status::Paused, false).unwrap(),
            "workflow_paused_requested"
        );
        assert_eq!(
            workflow_request_event(Status::Canceled, true).unwrap(),
            "workflow_canceling_requested"
        );
        assert!(workflow_request_event(Status::Scheduled, false).is_err());
    }

    #[test]
    fn test_terminal_statuses_have_no_rows() {
        assert_eq!(workflow_transition(Status::Succeeded, "task_active"), None);
        assert_eq!(
            workflow_transition(Status::Failed, "workflow_running_requested"),
            None
        );
    }
}

//! Workflow conducting.
//!
//! - **Flow**: append-only execution log, context store, staged-task index
//! - **Conductor**: the checkpointable state machine driving one execution

pub mod conductor;
pub mod flow;

pub use conductor::{TaskRender, WorkflowConductor};
pub use flow::{deep_merge, ContextEntry, FlowEntry, TaskFlow};

//! Cadenza Conductor
//!
//! A checkpointable decision engine for declarative task graphs. Given a
//! workflow definition (tasks, guarded transitions, join/split/barrier
//! semantics, possibly cycles), the conductor decides step by step which
//! tasks are eligible to run next, propagates and merges per-branch
//! context, and tracks the overall workflow status. It never executes a
//! task itself: a host dispatches the returned work and reports
//! completions back in.
//!
//! ## Architecture
//!
//! A definition is composed once into an execution graph, with implicit
//! parallel splits expanded into numbered branch instances. The conductor
//! wraps the graph together with the task flow (append-only execution
//! log, versioned context store, staged-task index) and is driven by
//! repeated host calls until the workflow status is terminal. The whole
//! aggregate serializes to a checkpoint; the intended deployment pattern
//! is load, apply one completion event, persist.
//!
//! ## Modules
//!
//! - [`workflow`]: definition document model and YAML parser
//! - [`expr`]: pluggable expression evaluation (Jinja and Rhai)
//! - [`graph`]: the directed multigraph of task nodes and transitions
//! - [`compose`]: composers turning a definition into an execution graph
//! - [`machines`]: task and workflow status state machines
//! - [`conduct`]: the conductor and its task flow
//! - [`error`]: typed engine errors
//!
//! ## Example
//!
//! ```ignore
//! use cadenza_conductor::{parse_workflow, Status, WorkflowConductor};
//!
//! let def = parse_workflow(yaml)?;
//! let mut conductor = WorkflowConductor::with_inputs(def, inputs)?;
//! conductor.request_workflow_status(Status::Running)?;
//! for task in conductor.get_start_tasks() {
//!     // dispatch task.action with task.input, then report back:
//!     // conductor.update_task_flow(&task.id, Status::Succeeded, result)?;
//! }
//! ```

pub mod compose;
pub mod conduct;
pub mod error;
pub mod expr;
pub mod graph;
pub mod machines;
pub mod workflow;

pub use conduct::{TaskRender, WorkflowConductor};
pub use error::{EngineError, EngineResult, ExecutionError};
pub use expr::{ContextMap, Evaluator};
pub use graph::{Barrier, Join, TaskNode, Transition, WorkflowGraph};
pub use machines::Status;
pub use workflow::{parse_workflow, FlowModel, WorkflowDef};

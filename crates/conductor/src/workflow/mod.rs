//! Workflow definition document model.
//!
//! - **Types**: canonical definition format (tasks, transitions, joins,
//!   retries, publish rules)
//! - **Parser**: YAML parsing plus the validation pass

pub mod parser;
pub mod types;

pub use parser::{parse_workflow, validate_workflow};
pub use types::{
    is_reserved_task, DoSpec, FlowModel, InputDecl, NextRule, RetryPolicy, TaskDef, Trigger,
    WorkflowDef, RESERVED_FAIL, RESERVED_NOOP,
};

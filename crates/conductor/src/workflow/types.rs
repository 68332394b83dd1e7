//! Workflow definition types (canonical format).
//!
//! A definition declares named tasks with either explicit forward
//! transitions (`next`, direct model) or dependency lists (`requires`,
//! reverse model), plus workflow-level inputs, vars and outputs. The
//! definition also answers the structural queries the composer and the
//! conductor need: start tasks, predecessors, split/join classification,
//! cycle membership, and publish semantics.

use std::collections::{BTreeMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineResult;
use crate::expr::{self, ContextMap};
use crate::graph::Join;

/// Reserved destination that completes immediately with success.
pub const RESERVED_NOOP: &str = "noop";
/// Reserved destination that completes immediately with failure and drives
/// the workflow to failed.
pub const RESERVED_FAIL: &str = "fail";

/// Check whether a task name is one of the reserved pseudo-tasks.
pub fn is_reserved_task(name: &str) -> bool {
    matches!(name, RESERVED_NOOP | RESERVED_FAIL)
}

/// Transition declaration model of a definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowModel {
    /// Tasks declare explicit outbound transitions via `next`.
    #[default]
    Direct,
    /// Tasks declare dependencies via `requires`; must be acyclic.
    Reverse,
}

impl std::fmt::Display for FlowModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Reverse => write!(f, "reverse"),
        }
    }
}

/// A workflow input declaration: a bare required name or a defaulted value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputDecl {
    /// Required input with no default.
    Required(String),
    /// Single-key mapping of input name to default value (may contain
    /// expressions).
    Defaulted(BTreeMap<String, Value>),
}

/// Retry declaration: how many times an abended task is re-staged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of additional attempts.
    pub count: u32,
    /// Delay between attempts in seconds, interpreted by the host scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<f64>,
}

/// Completion class a transition fires on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Fire when the task succeeded.
    #[default]
    Success,
    /// Fire when the task abended.
    Error,
    /// Fire on any completion.
    Complete,
}

impl Trigger {
    /// The completion predicate evaluated as the transition's first
    /// criterion.
    pub const fn predicate(&self) -> &'static str {
        match self {
            Self::Success => "succeeded()",
            Self::Error => "failed()",
            Self::Complete => "completed()",
        }
    }
}

/// Transition target list: a single name or several parallel branches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DoSpec {
    /// Single target task.
    Single(String),
    /// Parallel branch targets.
    List(Vec<String>),
}

impl DoSpec {
    /// Target task names in declaration order.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Self::Single(name) => vec![name.as_str()],
            Self::List(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

/// One outbound transition rule of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NextRule {
    /// Completion class this rule fires on.
    #[serde(default)]
    pub on: Trigger,
    /// Additional boolean guard expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Ordered context assignments published to the destination branch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publish: Vec<BTreeMap<String, Value>>,
    /// Destination task(s).
    #[serde(default, rename = "do", skip_serializing_if = "Option::is_none")]
    pub target: Option<DoSpec>,
}

impl NextRule {
    /// Runtime criteria for this rule: the completion predicate followed by
    /// the guard, AND semantics.
    pub fn criteria(&self) -> Vec<String> {
        let mut criteria = vec![self.on.predicate().to_string()];
        if let Some(when) = &self.when {
            criteria.push(when.clone());
        }
        criteria
    }

    /// Destination names, empty when the rule only publishes.
    pub fn targets(&self) -> Vec<&str> {
        self.target.as_ref().map(DoSpec::targets).unwrap_or_default()
    }
}

/// One task declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDef {
    /// Action reference dispatched by the host (may contain expressions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Action input mapping (may contain expressions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Join declaration: wait for all or N predecessor branches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<Join>,
    /// Retry declaration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Dependencies (reverse model only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    /// Outbound transition rules (direct model only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<NextRule>,
}

/// A complete workflow definition document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDef {
    /// Document format version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Workflow name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Transition declaration model.
    #[serde(default)]
    pub model: FlowModel,
    /// Input declarations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<InputDecl>,
    /// Ordered variable assignments rendered against the inputs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vars: Vec<BTreeMap<String, Value>>,
    /// Output assignments rendered against the terminal context.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<BTreeMap<String, Value>>,
    /// Task declarations keyed by name.
    pub tasks: BTreeMap<String, TaskDef>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl WorkflowDef {
    /// Fetch a task declaration by name.
    pub fn get_task(&self, name: &str) -> Option<&TaskDef> {
        self.tasks.get(name)
    }

    /// Names of the tasks with no predecessors, sorted.
    pub fn start_task_names(&self) -> Vec<&str> {
        match self.model {
            FlowModel::Direct => {
                let targeted: HashSet<&str> = self
                    .tasks
                    .values()
                    .flat_map(|t| t.next.iter())
                    .flat_map(|r| r.targets())
                    .collect();
                self.tasks
                    .keys()
                    .map(String::as_str)
                    .filter(|name| !targeted.contains(name))
                    .collect()
            }
            FlowModel::Reverse => self
                .tasks
                .iter()
                .filter(|(_, t)| t.requires.is_empty())
                .map(|(name, _)| name.as_str())
                .collect(),
        }
    }

    /// Distinct predecessor names of a task, sorted.
    pub fn predecessors(&self, name: &str) -> Vec<&str> {
        match self.model {
            FlowModel::Direct => {
                let mut preds: Vec<&str> = self
                    .tasks
                    .iter()
                    .filter(|(_, t)| {
                        t.next
                            .iter()
                            .any(|rule| rule.targets().contains(&name))
                    })
                    .map(|(pred, _)| pred.as_str())
                    .collect();
                preds.sort_unstable();
                preds.dedup();
                preds
            }
            FlowModel::Reverse => self
                .tasks
                .get(name)
                .map(|t| {
                    let mut preds: Vec<&str> = t.requires.iter().map(String::as_str).collect();
                    preds.sort_unstable();
                    preds.dedup();
                    preds
                })
                .unwrap_or_default(),
        }
    }

    /// Successor names of a task, in declaration order.
    pub fn successors(&self, name: &str) -> Vec<&str> {
        match self.model {
            FlowModel::Direct => self
                .tasks
                .get(name)
                .map(|t| {
                    t.next
                        .iter()
                        .flat_map(|rule| rule.targets())
                        .collect()
                })
                .unwrap_or_default(),
            FlowModel::Reverse => self
                .tasks
                .iter()
                .filter(|(_, t)| t.requires.iter().any(|r| r == name))
                .map(|(succ, _)| succ.as_str())
                .collect(),
        }
    }

    /// Check whether a task declares a join.
    pub fn is_join_task(&self, name: &str) -> bool {
        self.tasks
            .get(name)
            .map(|t| t.join.is_some())
            .unwrap_or(false)
    }

    /// Check whether a task is an implicit split: a declared task without a
    /// join that more than one predecessor leads into.
    pub fn is_split_task(&self, name: &str) -> bool {
        if is_reserved_task(name) || !self.tasks.contains_key(name) {
            return false;
        }
        !self.is_join_task(name) && self.predecessors(name).len() > 1
    }

    /// Check whether a task participates in a cycle at the name level.
    pub fn in_cycle(&self, name: &str) -> bool {
        let mut queue: VecDeque<&str> = self.successors(name).into();
        let mut seen: HashSet<&str> = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if current == name {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            for succ in self.successors(current) {
                queue.push_back(succ);
            }
        }
        false
    }

    /// Check whether any task participates in a cycle.
    pub fn has_cycles(&self) -> bool {
        self.tasks.keys().any(|name| self.in_cycle(name))
    }

    /// Publish semantics: evaluate the publish assignments of the rule that
    /// produced a satisfied transition.
    ///
    /// The matching rule is found by destination name and rebuilt criteria.
    /// Assignments are evaluated in order and later assignments see earlier
    /// ones. Returns the published mapping, empty when no rule matches or
    /// the rule publishes nothing.
    pub fn finalize_context(
        &self,
        task_name: &str,
        destination: &str,
        criteria: &[String],
        ctx: &ContextMap,
    ) -> EngineResult<ContextMap> {
        let Some(task) = self.tasks.get(task_name) else {
            return Ok(ContextMap::new());
        };

        let rule = task.next.iter().find(|rule| {
            rule.criteria() == criteria && rule.targets().contains(&destination)
        });
        let Some(rule) = rule else {
            return Ok(ContextMap::new());
        };

        let mut working = ctx.clone();
        let mut published = ContextMap::new();
        for assignments in &rule.publish {
            for (key, value) in assignments {
                let rendered = expr::evaluate_value(value, &working)?;
                working.insert(key.clone(), rendered.clone());
                published.insert(key.clone(), rendered);
            }
        }
        Ok(published)
    }
}

//! Task flow bookkeeping: the append-only execution log, the versioned
//! context store, and the staged-task index.
//!
//! The flow is the audit trail of one workflow execution. Entries are never
//! rewritten once their run of the task completes: a cyclic re-entry or a
//! retry appends a new entry and repoints the `tasks` index at it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::expr::ContextMap;
use crate::machines::Status;

/// One run of a task node: a row in the append-only sequence log.
///
/// Transition satisfaction flags are flattened into the row keyed
/// `<destination>__<key>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEntry {
    /// Execution-graph id of the task.
    pub id: String,
    /// Status of this run.
    pub status: Status,
    /// Index of the context entry this run was activated with.
    pub ctx: usize,
    /// Remaining retries, when the task declares a retry policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Satisfaction flag per outbound transition.
    #[serde(flatten)]
    pub transitions: BTreeMap<String, bool>,
}

impl FlowEntry {
    /// Create a fresh entry with no recorded status.
    pub fn new(id: impl Into<String>, ctx: usize) -> Self {
        Self {
            id: id.into(),
            status: Status::Unset,
            ctx,
            retries: None,
            transitions: BTreeMap::new(),
        }
    }

    /// Check whether any outbound transition of this run is satisfied.
    pub fn has_satisfied_transition(&self) -> bool {
        self.transitions.values().any(|satisfied| *satisfied)
    }
}

/// A versioned snapshot of workflow variables with provenance back to the
/// flow entries that produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    /// The context mapping.
    pub value: ContextMap,
    /// Ordered, de-duplicated indices of the flow entries that contributed.
    pub srcs: Vec<usize>,
}

impl ContextEntry {
    /// Create a context entry.
    pub fn new(value: ContextMap, srcs: Vec<usize>) -> Self {
        Self { value, srcs }
    }

    /// Record a contributing flow entry, ignoring duplicates.
    pub fn add_src(&mut self, src: usize) {
        if !self.srcs.contains(&src) {
            self.srcs.push(src);
        }
    }
}

/// Execution log, context store and staged-task index of one workflow run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFlow {
    /// Task id to the index of its most recent sequence entry.
    #[serde(default)]
    pub tasks: BTreeMap<String, usize>,
    /// Append-only log of task runs.
    #[serde(default)]
    pub sequence: Vec<FlowEntry>,
    /// Versioned contexts; entry 0 is the rendered workflow input and vars.
    #[serde(default)]
    pub contexts: Vec<ContextEntry>,
    /// Accumulated output of every task with no outbound transitions.
    #[serde(default)]
    pub term: ContextEntry,
    /// Staged tasks: id to the context indices awaiting activation.
    #[serde(default)]
    pub staged: BTreeMap<String, Vec<usize>>,
}

impl TaskFlow {
    /// Create an empty flow.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether the flow has been initialized with a root context.
    pub fn is_initialized(&self) -> bool {
        !self.contexts.is_empty()
    }

    /// The most recent entry for a task id.
    pub fn latest_entry(&self, id: &str) -> Option<&FlowEntry> {
        self.tasks.get(id).and_then(|idx| self.sequence.get(*idx))
    }

    /// Mutable access to the most recent entry for a task id.
    pub fn latest_entry_mut(&mut self, id: &str) -> Option<&mut FlowEntry> {
        let idx = *self.tasks.get(id)?;
        self.sequence.get_mut(idx)
    }

    /// Index of the most recent entry for a task id.
    pub fn latest_entry_index(&self, id: &str) -> Option<usize> {
        self.tasks.get(id).copied()
    }

    /// Append a new entry and repoint the task index at it.
    pub fn append_entry(&mut self, entry: FlowEntry) -> usize {
        let idx = self.sequence.len();
        self.tasks.insert(entry.id.clone(), idx);
        self.sequence.push(entry);
        idx
    }

    /// Append a context entry and return its index.
    pub fn add_context(&mut self, value: ContextMap, srcs: Vec<usize>) -> usize {
        self.contexts.push(ContextEntry::new(value, srcs));
        self.contexts.len() - 1
    }

    /// Stage a task with a pending context index.
    pub fn stage(&mut self, id: &str, ctx: usize) {
        self.staged.entry(id.to_string()).or_default().push(ctx);
    }

    /// Remove a task from the staged index, returning its pending contexts.
    pub fn unstage(&mut self, id: &str) -> Option<Vec<usize>> {
        self.staged.remove(id)
    }

    /// Check whether a task is staged.
    pub fn is_staged(&self, id: &str) -> bool {
        self.staged.contains_key(id)
    }

    /// Check whether any staged task remains.
    pub fn has_staged_tasks(&self) -> bool {
        !self.staged.is_empty()
    }

    /// Check whether any flow entry is in an active status.
    pub fn has_active_tasks(&self) -> bool {
        self.sequence.iter().any(|entry| entry.status.is_active())
    }

    /// Merge the contexts at the given indices into one entry: values are
    /// deep-merged left to right (later sources win per key), provenance is
    /// the ordered union of the sources.
    pub fn converge_contexts(&self, idxs: &[usize]) -> ContextEntry {
        let mut merged = ContextEntry::default();
        for idx in idxs {
            let Some(entry) = self.contexts.get(*idx) else {
                continue;
            };
            deep_merge(&mut merged.value, &entry.value);
            for src in &entry.srcs {
                merged.add_src(*src);
            }
        }
        merged
    }

    /// Latest status per task name, used for `task_status(name)` lookups in
    /// transition criteria.
    pub fn status_snapshot(&self, names: &BTreeMap<String, String>) -> ContextMap {
        let mut snapshot = ContextMap::new();
        for entry in &self.sequence {
            let name = names.get(&entry.id).unwrap_or(&entry.id);
            snapshot.insert(name.clone(), Value::String(entry.status.to_string()));
        }
        snapshot
    }
}

/// Deep-merge `src` into `dst`: nested mappings merge recursively, every
/// other value type is overwritten (last source wins).
pub fn deep_merge(dst: &mut ContextMap, src: &ContextMap) {
    for (key, value) in src {
        match (dst.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                dst.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(pairs: &[(&str, Value)]) -> ContextMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_append_entry_repoints_index() {
        let mut flow = TaskFlow::new();
        let first = flow.append_entry(FlowEntry::new("task1", 0));
        let second = flow.append_entry(FlowEntry::new("task1", 1));

        assert_eq!(first, 0);
        assert_eq!(second, 1);
        assert_eq!(flow.latest_entry_index("task1"), Some(1));
        assert_eq!(flow.sequence.len(), 2);
    }

    #[test]
    fn test_staging() {
        let mut flow = TaskFlow::new();
        flow.stage("task1", 0);
        flow.stage("task1", 2);

        assert!(flow.is_staged("task1"));
        assert_eq!(flow.unstage("task1"), Some(vec![0, 2]));
        assert!(!flow.is_staged("task1"));
    }

    #[test]
    fn test_converge_contexts_last_source_wins() {
        let mut flow = TaskFlow::new();
        flow.add_context(ctx(&[("a", json!(1)), ("b", json!("x"))]), vec![0]);
        flow.add_context(ctx(&[("b", json!("y")), ("c", json!(true))]), vec![1, 0]);

        let merged = flow.converge_contexts(&[0, 1]);
        assert_eq!(merged.value.get("a"), Some(&json!(1)));
        assert_eq!(merged.value.get("b"), Some(&json!("y")));
        assert_eq!(merged.value.get("c"), Some(&json!(true)));
        assert_eq!(merged.srcs, vec![0, 1]);
    }

    #[test]
    fn test_deep_merge_nested_mappings() {
        let mut dst = ctx(&[("cfg", json!({"a": 1, "nested": {"x": 1}}))]);
        let src = ctx(&[("cfg", json!({"b": 2, "nested": {"y": 2}}))]);
        deep_merge(&mut dst, &src);

        assert_eq!(
            dst.get("cfg"),
            Some(&json!({"a": 1, "b": 2, "nested": {"x": 1, "y": 2}}))
        );
    }

    #[test]
    fn test_context_src_dedupe() {
        let mut entry = ContextEntry::default();
        entry.add_src(3);
        entry.add_src(3);
        entry.add_src(1);
        assert_eq!(entry.srcs, vec![3, 1]);
    }

    #[test]
    fn test_flow_entry_serialization_flattens_transitions() {
        let mut entry = FlowEntry::new("task1", 0);
        entry.status = Status::Succeeded;
        entry.transitions.insert("task2__0".to_string(), true);

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["id"], "task1");
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["task2__0"], true);

        let parsed: FlowEntry = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_status_snapshot_prefers_task_names() {
        let mut flow = TaskFlow::new();
        let mut entry = FlowEntry::new("t3__1", 0);
        entry.status = Status::Running;
        flow.append_entry(entry);

        let names: BTreeMap<String, String> =
            [("t3__1".to_string(), "t3".to_string())].into_iter().collect();
        let snapshot = flow.status_snapshot(&names);
        assert_eq!(snapshot.get("t3"), Some(&json!("running")));
    }
}

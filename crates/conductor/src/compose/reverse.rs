//! Reverse-model composer.
//!
//! Tasks declare `requires` dependency lists; the graph is derived by
//! inverting the dependencies into forward transitions. The model is
//! strictly acyclic: a cycle in the dependency graph is a hard composition
//! error, raised before any graph is built.

use std::collections::{BTreeMap, VecDeque};

use crate::error::{EngineError, EngineResult};
use crate::graph::{Join, TaskNode, WorkflowGraph};
use crate::workflow::{FlowModel, Trigger, WorkflowDef};

use super::{expand_execution_graph, Composer};

/// Composer for definitions with inverted dependency declarations.
pub struct ReverseComposer;

impl Composer for ReverseComposer {
    fn model(&self) -> FlowModel {
        FlowModel::Reverse
    }

    fn compose(&self, def: &WorkflowDef) -> EngineResult<WorkflowGraph> {
        ensure_acyclic(def)?;
        let static_graph = compose_static(def)?;
        expand_execution_graph(def, &static_graph)
    }
}

/// Kahn's algorithm over the dependency lists; leftover tasks sit on a
/// cycle.
fn ensure_acyclic(def: &WorkflowDef) -> EngineResult<()> {
    let mut in_degree: BTreeMap<&str, usize> = def
        .tasks
        .iter()
        .map(|(name, task)| (name.as_str(), task.requires.len()))
        .collect();

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut resolved = 0usize;
    while let Some(current) = queue.pop_front() {
        resolved += 1;
        for succ in def.successors(current) {
            if let Some(degree) = in_degree.get_mut(succ) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(succ);
                }
            }
        }
    }

    if resolved != def.tasks.len() {
        let remaining: Vec<String> = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(name, _)| name.to_string())
            .collect();
        return Err(EngineError::CycleDetected(remaining));
    }
    Ok(())
}

fn compose_static(def: &WorkflowDef) -> EngineResult<WorkflowGraph> {
    let mut graph = WorkflowGraph::new();

    for (name, task) in &def.tasks {
        let mut node = TaskNode::new(name.clone());
        if let Some(join) = task.join {
            node = node.with_join(join);
        } else if task.requires.len() > 1 {
            // a task with several requirements waits for all of them
            node = node.with_join(Join::All);
        }
        graph.upsert_task(node);
    }

    for (name, task) in &def.tasks {
        for required in &task.requires {
            graph.add_transition(
                required,
                name,
                vec![Trigger::Success.predicate().to_string()],
            )?;
        }
    }

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::compose;
    use crate::graph::Barrier;
    use crate::workflow::parse_workflow;

    const DIAMOND_WF: &str = r#"
name: examples.reverse-diamond
model: reverse
tasks:
  a:
    action: core.echo
  b:
    action: core.echo
    requires:
      - a
  c:
    action: core.echo
    requires:
      - a
  d:
    action: core.echo
    requires:
      - b
      - c
"#;

    #[test]
    fn test_requires_inverted_into_transitions() {
        let def = parse_workflow(DIAMOND_WF).unwrap();
        let graph = compose(&def).unwrap();

        assert_eq!(graph.task_ids(), vec!["a", "b", "c", "d"]);
        let next: Vec<_> = graph
            .get_next_transitions("a")
            .iter()
            .map(|t| t.destination.as_str())
            .collect();
        assert_eq!(next, vec!["b", "c"]);
        assert_eq!(graph.get_prev_transitions("d").len(), 2);
    }

    #[test]
    fn test_multi_requirement_task_joins_all() {
        let def = parse_workflow(DIAMOND_WF).unwrap();
        let graph = compose(&def).unwrap();
        assert_eq!(graph.get_barrier("d"), Some(Barrier::Star));
        assert!(!graph.has_barrier("b"));
    }

    #[test]
    fn test_cycle_is_a_hard_error() {
        let yaml = r#"
name: examples.reverse-cycle
model: reverse
tasks:
  a:
    action: core.echo
  b:
    action: core.echo
    requires:
      - a
      - c
  c:
    action: core.echo
    requires:
      - b
"#;
        let def = parse_workflow(yaml).unwrap();
        let err = compose(&def).unwrap_err();
        let EngineError::CycleDetected(tasks) = err else {
            panic!("expected CycleDetected, got {err}");
        };
        assert_eq!(tasks, vec!["b".to_string(), "c".to_string()]);
    }
}

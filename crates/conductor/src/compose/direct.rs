//! Direct-model composer.
//!
//! Tasks declare explicit outbound transitions (`next` rules with a
//! completion trigger, an optional guard, publish assignments and `do`
//! targets). The static pass walks the definition breadth-first from the
//! tasks with no predecessors, classifying splits and carrying the split
//! lineage along each branch.

use std::collections::{HashSet, VecDeque};

use crate::error::EngineResult;
use crate::graph::{SplitRef, TaskNode, WorkflowGraph};
use crate::workflow::{FlowModel, WorkflowDef};

use super::{expand_execution_graph, Composer};

/// Composer for definitions with explicit forward transitions.
pub struct DirectComposer;

impl Composer for DirectComposer {
    fn model(&self) -> FlowModel {
        FlowModel::Direct
    }

    fn compose(&self, def: &WorkflowDef) -> EngineResult<WorkflowGraph> {
        let static_graph = compose_static(def)?;
        expand_execution_graph(def, &static_graph)
    }
}

fn compose_static(def: &WorkflowDef) -> EngineResult<WorkflowGraph> {
    let mut graph = WorkflowGraph::new();
    let mut queue: VecDeque<(String, Vec<String>)> = def
        .start_task_names()
        .into_iter()
        .map(|name| (name.to_string(), Vec::new()))
        .collect();
    let mut visited: HashSet<(String, Vec<String>)> = HashSet::new();

    while let Some((name, splits)) = queue.pop_front() {
        if !visited.insert((name.clone(), splits.clone())) {
            continue;
        }

        let mut splits = splits;
        if def.is_split_task(&name) && !def.in_cycle(&name) && !splits.contains(&name) {
            splits.push(name.clone());
        }

        let task = def.get_task(&name);
        let mut node = TaskNode::new(name.clone());
        if let Some(join) = task.and_then(|t| t.join) {
            node = node.with_join(join);
        }
        node.splits = splits.iter().map(|s| SplitRef::new(s.clone(), 0)).collect();
        graph.upsert_task(node);

        // reserved noop/fail targets carry no declaration and no outbound rules
        let Some(task) = task else {
            continue;
        };

        for rule in &task.next {
            let criteria = rule.criteria();
            for target in rule.targets() {
                if !graph.has_task(target) {
                    graph.upsert_task(TaskNode::new(target));
                }
                graph.add_transition(&name, target, criteria.clone())?;
                queue.push_back((target.to_string(), splits.clone()));
            }
        }
    }

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parse_workflow;

    #[test]
    fn test_static_graph_marks_split_lineage() {
        let yaml = r#"
name: examples.split
tasks:
  t1:
    action: core.echo
    next:
      - do: t3
  t2:
    action: core.echo
    next:
      - do: t3
  t3:
    action: core.echo
    next:
      - do: t4
  t4:
    action: core.echo
"#;
        let def = parse_workflow(yaml).unwrap();
        let graph = compose_static(&def).unwrap();

        assert!(graph.get_task("t1").unwrap().splits.is_empty());
        let t3 = graph.get_task("t3").unwrap();
        assert_eq!(t3.splits.len(), 1);
        assert_eq!(t3.splits[0].name, "t3");
        // downstream tasks inherit the lineage
        let t4 = graph.get_task("t4").unwrap();
        assert_eq!(t4.splits.len(), 1);
        assert_eq!(t4.splits[0].name, "t3");
    }

    #[test]
    fn test_multiple_rules_to_same_target_become_parallel_edges() {
        let yaml = r#"
name: examples.multi-edge
tasks:
  a:
    action: core.echo
    next:
      - do: b
      - on: error
        do: b
  b:
    action: core.echo
"#;
        let def = parse_workflow(yaml).unwrap();
        let graph = compose_static(&def).unwrap();

        let edges = graph.get_next_transitions("a");
        assert_eq!(edges.len(), 2);
        assert_ne!(edges[0].criteria, edges[1].criteria);
    }

    #[test]
    fn test_join_node_gets_barrier() {
        let yaml = r#"
name: examples.join
tasks:
  a:
    action: core.echo
    next:
      - do: [b, c]
  b:
    action: core.echo
    next:
      - do: d
  c:
    action: core.echo
    next:
      - do: d
  d:
    action: core.echo
    join: 2
"#;
        let def = parse_workflow(yaml).unwrap();
        let graph = compose_static(&def).unwrap();
        assert!(graph.has_barrier("d"));
        assert_eq!(graph.get_prev_transitions("d").len(), 2);
    }
}

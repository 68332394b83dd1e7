//! Composers: workflow definition to execution graph.
//!
//! A composer runs two passes. The model-specific pass builds a static
//! graph keyed by task name, with runtime criteria attached to every
//! transition. The shared second pass expands the static graph into the
//! execution graph: implicit parallel splits become uniquely numbered
//! branch instances (`name__1`, `name__2`, ...) and every downstream node
//! is duplicated per branch until the lineage ends.
//!
//! Composers are looked up once from a static registry keyed by the
//! definition's model tag.

pub mod direct;
pub mod reverse;

use std::collections::{BTreeMap, HashSet, VecDeque};

use once_cell::sync::Lazy;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::graph::{SplitRef, TaskNode, WorkflowGraph};
use crate::workflow::{FlowModel, WorkflowDef};

pub use direct::DirectComposer;
pub use reverse::ReverseComposer;

/// Strategy turning a workflow definition into an execution graph.
pub trait Composer: Send + Sync {
    /// The definition model this composer handles.
    fn model(&self) -> FlowModel;

    /// Build the execution graph.
    fn compose(&self, def: &WorkflowDef) -> EngineResult<WorkflowGraph>;
}

static COMPOSERS: Lazy<Vec<Box<dyn Composer>>> =
    Lazy::new(|| vec![Box::new(DirectComposer), Box::new(ReverseComposer)]);

/// Look up the registered composer for a model tag.
pub fn composer_for(model: FlowModel) -> EngineResult<&'static dyn Composer> {
    COMPOSERS
        .iter()
        .find(|c| c.model() == model)
        .map(|c| c.as_ref())
        .ok_or_else(|| EngineError::UnsupportedModel(model.to_string()))
}

/// Compose the execution graph for a definition.
pub fn compose(def: &WorkflowDef) -> EngineResult<WorkflowGraph> {
    composer_for(def.model)?.compose(def)
}

/// One pending visit during execution-graph expansion.
struct ExpandItem {
    task_name: String,
    prev: Option<PrevHop>,
    lineage: Vec<SplitRef>,
}

/// The transition the current visit arrived through.
struct PrevHop {
    source_id: String,
    criteria: Vec<String>,
}

/// Traversal state threaded through the expansion worklist.
#[derive(Default)]
struct ExpansionState {
    queue: VecDeque<ExpandItem>,
    split_counter: BTreeMap<String, u32>,
    expanded: HashSet<String>,
    deferrals: usize,
}

/// Expand a static graph into the execution graph.
///
/// Split tasks (no join, more than one predecessor, not in a cycle) get a
/// fresh branch instance per visit; every other task inherits the branch
/// lineage of the transition it was reached through. A visit whose
/// accumulated lineage does not match the lineage recorded on the static
/// node is deferred until the matching ancestor branch reaches it; items
/// still unmatched after a full queue rotation are processed with their own
/// lineage so expansion always terminates.
pub(crate) fn expand_execution_graph(
    def: &WorkflowDef,
    static_graph: &WorkflowGraph,
) -> EngineResult<WorkflowGraph> {
    let mut exec = WorkflowGraph::new();
    let mut state = ExpansionState::default();

    for root in static_graph.roots() {
        state.queue.push_back(ExpandItem {
            task_name: root.id.clone(),
            prev: None,
            lineage: Vec::new(),
        });
    }

    let budget =
        (static_graph.task_count() + 1) * (static_graph.transition_count() + 1) * 4 + 64;
    let mut iterations = 0usize;

    while let Some(item) = state.queue.pop_front() {
        iterations += 1;
        if iterations > budget {
            return Err(EngineError::Validation(
                "execution graph expansion did not converge".to_string(),
            ));
        }

        let node = static_graph.get_task(&item.task_name)?;
        let in_cycle = static_graph.in_cycle(&item.task_name);
        let is_split = def.is_split_task(&item.task_name) && !in_cycle;

        let expected: Vec<&str> = node.splits.iter().map(|s| s.name.as_str()).collect();
        let mut prospective: Vec<&str> = item.lineage.iter().map(|s| s.name.as_str()).collect();
        if is_split {
            prospective.push(node.name.as_str());
        }
        if prospective != expected {
            if state.deferrals <= state.queue.len() {
                state.deferrals += 1;
                debug!(task = %item.task_name, "deferring lineage-mismatched branch item");
                state.queue.push_back(item);
                continue;
            }
            warn!(task = %item.task_name, "expanding branch item with unmatched lineage");
        }
        state.deferrals = 0;

        let mut lineage = item.lineage.clone();
        if is_split {
            let counter = state.split_counter.entry(item.task_name.clone()).or_insert(0);
            *counter += 1;
            lineage.push(SplitRef::new(item.task_name.clone(), *counter));
        }

        let exec_id = match lineage.last() {
            Some(last) => format!("{}__{}", item.task_name, last.index),
            None => item.task_name.clone(),
        };

        exec.upsert_task(TaskNode {
            id: exec_id.clone(),
            name: node.name.clone(),
            join: node.join,
            barrier: node.barrier,
            splits: lineage.clone(),
        });

        if let Some(prev) = &item.prev {
            exec.add_transition(&prev.source_id, &exec_id, prev.criteria.clone())?;
        }

        // successors are walked once per instance; cycle re-visits only
        // update the node and attach the inbound transition
        if state.expanded.insert(exec_id.clone()) {
            for transition in static_graph.get_next_transitions(&item.task_name) {
                state.queue.push_back(ExpandItem {
                    task_name: transition.destination.clone(),
                    prev: Some(PrevHop {
                        source_id: exec_id.clone(),
                        criteria: transition.criteria.clone(),
                    }),
                    lineage: lineage.clone(),
                });
            }
        }
    }

    debug!(
        tasks = exec.task_count(),
        transitions = exec.transition_count(),
        "composed execution graph"
    );
    Ok(exec)
}

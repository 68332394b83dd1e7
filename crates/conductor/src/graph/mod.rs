//! Workflow graph model.
//!
//! A directed multigraph of task nodes and guarded transitions. Nodes live
//! in an arena keyed by stable string id; edges are explicit transition
//! records held in per-source adjacency lists. Parallel edges between the
//! same pair of nodes are disambiguated by a numeric key.
//!
//! Query operations never mutate. The serialized form is an adjacency list
//! (`nodes` plus a parallel `adjacency` array) so a graph can be stored in
//! a conductor checkpoint and rebuilt without recomposing the definition.

use std::collections::{BTreeMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Join declaration on a task: wait for all predecessor branches or a count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Join {
    /// Wait for every predecessor branch.
    All,
    /// Wait for at least this many predecessor branches.
    Count(u32),
}

impl Serialize for Join {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Join::All => serializer.serialize_str("all"),
            Join::Count(n) => serializer.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for Join {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Count(u32),
            Tag(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Count(n) => Ok(Join::Count(n)),
            Repr::Tag(s) if s == "all" => Ok(Join::All),
            Repr::Tag(s) => Err(serde::de::Error::custom(format!(
                "invalid join value: {s:?}, expected \"all\" or a count"
            ))),
        }
    }
}

/// Barrier threshold on a join node: every known inbound transition (`*`)
/// or a fixed count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    /// Every inbound transition of the node must be satisfied.
    Star,
    /// At least this many inbound transitions must be satisfied.
    Count(u32),
}

impl Barrier {
    /// Number of satisfied inbound transitions required, given how many
    /// inbound transitions the node has.
    pub fn required(&self, inbound: usize) -> usize {
        match self {
            Barrier::Star => inbound,
            Barrier::Count(n) => *n as usize,
        }
    }
}

impl From<Join> for Barrier {
    fn from(join: Join) -> Self {
        match join {
            Join::All => Barrier::Star,
            Join::Count(n) => Barrier::Count(n),
        }
    }
}

impl Serialize for Barrier {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Barrier::Star => serializer.serialize_str("*"),
            Barrier::Count(n) => serializer.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for Barrier {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Count(u32),
            Tag(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Count(n) => Ok(Barrier::Count(n)),
            Repr::Tag(s) if s == "*" => Ok(Barrier::Star),
            Repr::Tag(s) => Err(serde::de::Error::custom(format!(
                "invalid barrier value: {s:?}, expected \"*\" or a count"
            ))),
        }
    }
}

/// One step of a split lineage: which split task instantiated the branch
/// this node belongs to, and which instance it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRef {
    /// Name of the ancestor split task.
    pub name: String,
    /// Branch instance number, starting at 1.
    pub index: u32,
}

impl SplitRef {
    /// Create a lineage step.
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }
}

/// A task node in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    /// Stable node id. In an execution graph this carries the branch
    /// instance suffix (`name__2`); in a static graph it equals the name.
    pub id: String,
    /// Task name as declared in the workflow definition.
    pub name: String,
    /// Join declaration, if the task declares one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join: Option<Join>,
    /// Barrier threshold derived from the join declaration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barrier: Option<Barrier>,
    /// Split lineage identifying the branch this node belongs to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub splits: Vec<SplitRef>,
}

impl TaskNode {
    /// Create a plain node where the id equals the name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            join: None,
            barrier: None,
            splits: Vec::new(),
        }
    }

    /// Set the join declaration (and the matching barrier).
    #[must_use]
    pub fn with_join(mut self, join: Join) -> Self {
        self.join = Some(join);
        self.barrier = Some(join.into());
        self
    }
}

/// A directed, guarded edge between two task nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// Source node id.
    pub source: String,
    /// Destination node id.
    pub destination: String,
    /// Disambiguates parallel edges between the same pair of nodes.
    pub key: u32,
    /// Ordered boolean criteria, AND semantics.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub criteria: Vec<String>,
}

impl Transition {
    /// The satisfaction flag key recorded on flow entries.
    pub fn flag(&self) -> String {
        format!("{}__{}", self.destination, self.key)
    }
}

/// Serialized graph form: node list plus a parallel adjacency array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphData {
    /// Always true.
    pub directed: bool,
    /// Always true.
    pub multigraph: bool,
    /// All nodes, sorted by id.
    pub nodes: Vec<TaskNode>,
    /// Outbound edges per node, indexed parallel to `nodes`.
    pub adjacency: Vec<Vec<AdjacencyEdge>>,
}

/// One outbound edge in the serialized adjacency list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjacencyEdge {
    /// Destination node id.
    pub id: String,
    /// Edge key.
    pub key: u32,
    /// Edge criteria.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub criteria: Vec<String>,
}

/// Directed multigraph of task nodes and transitions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowGraph {
    nodes: BTreeMap<String, TaskNode>,
    adjacency: BTreeMap<String, Vec<Transition>>,
}

impl WorkflowGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes.
    pub fn task_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of transitions.
    pub fn transition_count(&self) -> usize {
        self.adjacency.values().map(Vec::len).sum()
    }

    /// All node ids, sorted.
    pub fn task_ids(&self) -> Vec<&str> {
        self.nodes.keys().map(String::as_str).collect()
    }

    /// Check whether a node exists.
    pub fn has_task(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Fetch a node by id.
    pub fn get_task(&self, id: &str) -> EngineResult<&TaskNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| EngineError::UnknownTask(id.to_string()))
    }

    /// Insert a node, or update the attributes of an existing one.
    ///
    /// Updates only overwrite attributes the incoming node actually sets,
    /// so a later bare upsert does not erase a join or split lineage.
    pub fn upsert_task(&mut self, task: TaskNode) {
        match self.nodes.get_mut(&task.id) {
            Some(existing) => {
                existing.name = task.name;
                if task.join.is_some() {
                    existing.join = task.join;
                }
                if task.barrier.is_some() {
                    existing.barrier = task.barrier;
                }
                if !task.splits.is_empty() {
                    existing.splits = task.splits;
                }
            }
            None => {
                self.adjacency.entry(task.id.clone()).or_default();
                self.nodes.insert(task.id.clone(), task);
            }
        }
    }

    /// Upsert a transition.
    ///
    /// If no edge with the same (source, destination, criteria) exists a new
    /// edge is added with the next free key; exactly one match is an
    /// idempotent no-op; more than one match means the graph no longer
    /// identifies the edge uniquely and is an error.
    pub fn add_transition(
        &mut self,
        source: &str,
        destination: &str,
        criteria: Vec<String>,
    ) -> EngineResult<()> {
        if !self.has_task(source) {
            return Err(EngineError::UnknownTask(source.to_string()));
        }
        if !self.has_task(destination) {
            return Err(EngineError::UnknownTask(destination.to_string()));
        }

        let edges = self.adjacency.entry(source.to_string()).or_default();
        let matches = edges
            .iter()
            .filter(|t| t.destination == destination && t.criteria == criteria)
            .count();
        match matches {
            0 => {
                let key = edges
                    .iter()
                    .filter(|t| t.destination == destination)
                    .map(|t| t.key + 1)
                    .max()
                    .unwrap_or(0);
                edges.push(Transition {
                    source: source.to_string(),
                    destination: destination.to_string(),
                    key,
                    criteria,
                });
                edges.sort_by(|a, b| (&a.destination, a.key).cmp(&(&b.destination, b.key)));
                Ok(())
            }
            1 => Ok(()),
            _ => Err(EngineError::AmbiguousTransition {
                src: source.to_string(),
                destination: destination.to_string(),
            }),
        }
    }

    /// Outbound transitions of a node, sorted by destination id then key.
    pub fn get_next_transitions(&self, id: &str) -> &[Transition] {
        self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Inbound transitions of a node, sorted by source id then key.
    pub fn get_prev_transitions(&self, id: &str) -> Vec<&Transition> {
        let mut prev: Vec<&Transition> = self
            .adjacency
            .values()
            .flatten()
            .filter(|t| t.destination == id)
            .collect();
        prev.sort_by(|a, b| (&a.source, a.key).cmp(&(&b.source, b.key)));
        prev
    }

    /// Set the barrier threshold on a node.
    pub fn set_barrier(&mut self, id: &str, barrier: Barrier) -> EngineResult<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownTask(id.to_string()))?;
        node.barrier = Some(barrier);
        Ok(())
    }

    /// Check whether a node has a barrier.
    pub fn has_barrier(&self, id: &str) -> bool {
        self.nodes
            .get(id)
            .map(|n| n.barrier.is_some())
            .unwrap_or(false)
    }

    /// Fetch a node's barrier threshold.
    pub fn get_barrier(&self, id: &str) -> Option<Barrier> {
        self.nodes.get(id).and_then(|n| n.barrier)
    }

    /// Nodes with no inbound transitions, sorted by id.
    pub fn roots(&self) -> Vec<&TaskNode> {
        let destinations: HashSet<&str> = self
            .adjacency
            .values()
            .flatten()
            .map(|t| t.destination.as_str())
            .collect();
        self.nodes
            .values()
            .filter(|n| !destinations.contains(n.id.as_str()))
            .collect()
    }

    /// Check whether a node participates in any simple cycle, i.e. whether
    /// it is reachable from its own successors.
    pub fn in_cycle(&self, id: &str) -> bool {
        let mut queue: VecDeque<&str> = self
            .get_next_transitions(id)
            .iter()
            .map(|t| t.destination.as_str())
            .collect();
        let mut seen: HashSet<&str> = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if current == id {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            for t in self.get_next_transitions(current) {
                queue.push_back(t.destination.as_str());
            }
        }
        false
    }

    /// Check whether the graph contains any cycle.
    pub fn has_cycles(&self) -> bool {
        self.nodes.keys().any(|id| self.in_cycle(id))
    }

    /// Convert into the serialized adjacency-list form.
    pub fn to_data(&self) -> GraphData {
        let nodes: Vec<TaskNode> = self.nodes.values().cloned().collect();
        let adjacency = nodes
            .iter()
            .map(|n| {
                self.get_next_transitions(&n.id)
                    .iter()
                    .map(|t| AdjacencyEdge {
                        id: t.destination.clone(),
                        key: t.key,
                        criteria: t.criteria.clone(),
                    })
                    .collect()
            })
            .collect();
        GraphData {
            directed: true,
            multigraph: true,
            nodes,
            adjacency,
        }
    }

    /// Rebuild a graph from its serialized form.
    pub fn from_data(data: GraphData) -> EngineResult<Self> {
        if data.nodes.len() != data.adjacency.len() {
            return Err(EngineError::Validation(
                "graph adjacency is not parallel to the node list".to_string(),
            ));
        }

        let GraphData {
            nodes, adjacency, ..
        } = data;

        let mut graph = Self::new();
        for node in &nodes {
            graph.upsert_task(node.clone());
        }
        for (node, edges) in nodes.iter().zip(adjacency) {
            for edge in edges {
                if !graph.has_task(&edge.id) {
                    return Err(EngineError::UnknownTask(edge.id));
                }
                let list = graph.adjacency.entry(node.id.clone()).or_default();
                list.push(Transition {
                    source: node.id.clone(),
                    destination: edge.id,
                    key: edge.key,
                    criteria: edge.criteria,
                });
                list.sort_by(|a, b| (&a.destination, a.key).cmp(&(&b.destination, b.key)));
            }
        }
        Ok(graph)
    }
}

impl Serialize for WorkflowGraph {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_data().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for WorkflowGraph {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let data = GraphData::deserialize(deserializer)?;
        WorkflowGraph::from_data(data).map_err(serde::de::Error::custom)
    }
}

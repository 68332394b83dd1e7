//! The workflow conductor.
//!
//! A conductor owns a workflow definition, the execution graph composed
//! from it, and the task flow of one execution. It never runs a task
//! itself: the host asks for runnable tasks, dispatches them, and reports
//! completions back through [`WorkflowConductor::update_task_flow`], which
//! evaluates transition criteria, forks and merges context, stages
//! downstream work and re-derives the workflow status.
//!
//! The whole aggregate serializes to a checkpoint; persisting it between
//! steps is the only supported way to resume a workflow.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::compose;
use crate::error::{EngineError, EngineResult, ExecutionError};
use crate::expr::{self, ContextMap, CTX_FLOW_KEY, CTX_TASK_KEY};
use crate::graph::{TaskNode, WorkflowGraph};
use crate::machines::{self, Status, WorkflowEventContext};
use crate::workflow::{is_reserved_task, InputDecl, WorkflowDef, RESERVED_FAIL, RESERVED_NOOP};

use super::flow::{deep_merge, ContextEntry, FlowEntry, TaskFlow};

/// A runnable task rendered for host dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRender {
    /// Execution-graph id.
    pub id: String,
    /// Declared task name.
    pub name: String,
    /// Rendered action reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Rendered action input.
    #[serde(default)]
    pub input: ContextMap,
    /// Context indices the task will be activated with.
    #[serde(default)]
    pub ctxs: Vec<usize>,
}

/// Serialized checkpoint of a conductor.
#[derive(Deserialize)]
struct Checkpoint {
    spec: WorkflowDef,
    graph: WorkflowGraph,
    state: Status,
    flow: TaskFlow,
    #[serde(default)]
    inputs: ContextMap,
    #[serde(default)]
    outputs: Option<ContextMap>,
    #[serde(default)]
    errors: Vec<ExecutionError>,
}

#[derive(Serialize)]
struct CheckpointRef<'a> {
    spec: &'a WorkflowDef,
    graph: &'a WorkflowGraph,
    state: Status,
    flow: &'a TaskFlow,
    inputs: &'a ContextMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    outputs: Option<&'a ContextMap>,
    errors: &'a Vec<ExecutionError>,
}

/// Checkpointable execution state machine for one workflow run.
#[derive(Debug, Clone)]
pub struct WorkflowConductor {
    def: WorkflowDef,
    graph: WorkflowGraph,
    status: Status,
    flow: TaskFlow,
    inputs: ContextMap,
    outputs: Option<ContextMap>,
    errors: Vec<ExecutionError>,
}

impl WorkflowConductor {
    /// Create a conductor for a definition with no runtime inputs.
    pub fn new(def: WorkflowDef) -> EngineResult<Self> {
        Self::with_inputs(def, ContextMap::new())
    }

    /// Create a conductor for a definition with runtime inputs.
    pub fn with_inputs(def: WorkflowDef, inputs: ContextMap) -> EngineResult<Self> {
        let graph = compose::compose(&def)?;
        Ok(Self {
            def,
            graph,
            status: Status::Unset,
            flow: TaskFlow::new(),
            inputs,
            outputs: None,
            errors: Vec::new(),
        })
    }

    /// The workflow definition.
    pub fn def(&self) -> &WorkflowDef {
        &self.def
    }

    /// The composed execution graph.
    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    /// Current workflow status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// The task flow of this execution.
    pub fn task_flow(&self) -> &TaskFlow {
        &self.flow
    }

    /// Runtime inputs as given by the host.
    pub fn inputs(&self) -> &ContextMap {
        &self.inputs
    }

    /// Rendered workflow outputs, present once the workflow succeeded.
    pub fn outputs(&self) -> Option<&ContextMap> {
        self.outputs.as_ref()
    }

    /// Execution error log.
    pub fn errors(&self) -> &[ExecutionError] {
        &self.errors
    }

    /// Serialize the whole aggregate into a checkpoint value.
    pub fn serialize(&self) -> EngineResult<Value> {
        let checkpoint = CheckpointRef {
            spec: &self.def,
            graph: &self.graph,
            state: self.status,
            flow: &self.flow,
            inputs: &self.inputs,
            outputs: self.outputs.as_ref(),
            errors: &self.errors,
        };
        serde_json::to_value(&checkpoint).map_err(EngineError::from)
    }

    /// Restore a conductor from a checkpoint value.
    pub fn deserialize(value: &Value) -> EngineResult<Self> {
        let checkpoint: Checkpoint = serde_json::from_value(value.clone())?;
        Ok(Self {
            def: checkpoint.spec,
            graph: checkpoint.graph,
            status: checkpoint.state,
            flow: checkpoint.flow,
            inputs: checkpoint.inputs,
            outputs: checkpoint.outputs,
            errors: checkpoint.errors,
        })
    }

    /// Request a workflow status: run, pause, cancel or resume.
    ///
    /// Pause and cancel converge on their final form only once no task
    /// remains active; until then the workflow sits in the `-ing` status.
    pub fn request_workflow_status(&mut self, requested: Status) -> EngineResult<()> {
        let event = machines::workflow_request_event(requested, self.flow.has_active_tasks())?;
        let Some(next) = machines::workflow_transition(self.status, &event) else {
            if requested == self.status {
                return Ok(());
            }
            return Err(EngineError::InvalidWorkflowTransition {
                from: self.status,
                to: requested,
            });
        };

        if next != self.status {
            info!(workflow = %self.def.name, from = %self.status, to = %next, "workflow status change");
            self.status = next;
        }

        if self.status.is_running_family() && !self.flow.is_initialized() {
            self.init_flow();
        }
        Ok(())
    }

    /// Render the start tasks: the graph roots, sorted by name.
    ///
    /// No-op unless the workflow is accepting dispatch. A root whose
    /// rendering fails is skipped and the workflow fails.
    pub fn get_start_tasks(&mut self) -> Vec<TaskRender> {
        if !self.status.is_running_family() {
            return Vec::new();
        }
        if !self.flow.is_initialized() {
            self.init_flow();
        }
        if !self.status.is_running_family() {
            return Vec::new();
        }

        let root_ids: Vec<String> = self.graph.roots().iter().map(|n| n.id.clone()).collect();
        let mut result = Vec::new();
        for id in root_ids {
            if !self.flow.is_staged(&id) {
                continue;
            }
            match self.render_task(&id) {
                Ok(Some(render)) => result.push(render),
                Ok(None) => {}
                Err(e) => {
                    self.errors
                        .push(ExecutionError::for_task(id.clone(), e.to_string()));
                    self.fail_workflow();
                }
            }
        }

        if self.status.is_completed() {
            return Vec::new();
        }
        result.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        result
    }

    /// Render the tasks eligible to run next.
    ///
    /// With no id, every staged task whose barrier (if any) is satisfied.
    /// With an id, the destinations of that task's satisfied transitions,
    /// barrier-gated; empty unless the task's latest entry is completed.
    pub fn get_next_tasks(&mut self, task_id: Option<&str>) -> EngineResult<Vec<TaskRender>> {
        if !self.status.is_running_family() {
            return Ok(Vec::new());
        }

        let candidates: Vec<String> = match task_id {
            None => self.flow.staged.keys().cloned().collect(),
            Some(id) => {
                if !self.graph.has_task(id) {
                    return Err(EngineError::UnknownTask(id.to_string()));
                }
                let Some(entry) = self.flow.latest_entry(id) else {
                    return Ok(Vec::new());
                };
                if !entry.status.is_completed() {
                    return Ok(Vec::new());
                }
                self.graph
                    .get_next_transitions(id)
                    .iter()
                    .filter(|t| entry.transitions.get(&t.flag()) == Some(&true))
                    .map(|t| t.destination.clone())
                    .collect()
            }
        };

        let mut result = Vec::new();
        for dest in candidates {
            if self.graph.has_barrier(&dest) && !self.barrier_satisfied(&dest) {
                continue;
            }
            match self.render_task(&dest) {
                Ok(Some(render)) => result.push(render),
                Ok(None) => {}
                Err(e) => {
                    self.errors
                        .push(ExecutionError::for_task(dest.clone(), e.to_string()));
                    self.fail_workflow();
                }
            }
        }

        if self.status.is_completed() {
            return Ok(Vec::new());
        }
        result.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(result)
    }

    /// Apply a task status report from the host.
    ///
    /// Reserved `noop`/`fail` destinations reached by this update are
    /// completed synthetically through an iterative pending-event queue.
    pub fn update_task_flow(
        &mut self,
        task_id: &str,
        status: Status,
        result: Option<Value>,
    ) -> EngineResult<()> {
        let mut pending: VecDeque<(String, Status, Option<Value>)> = VecDeque::new();
        pending.push_back((task_id.to_string(), status, result));
        while let Some((id, status, result)) = pending.pop_front() {
            self.apply_task_event(&id, status, result, &mut pending)?;
        }
        Ok(())
    }

    /// Merge the contexts at the given indices into one view.
    pub fn converge_contexts(&self, idxs: &[usize]) -> ContextEntry {
        self.flow.converge_contexts(idxs)
    }

    /// The context a task starts (or started) with.
    pub fn get_task_initial_context(&self, task_id: &str) -> EngineResult<ContextMap> {
        if !self.graph.has_task(task_id) {
            return Err(EngineError::UnknownTask(task_id.to_string()));
        }
        if let Some(ctxs) = self.flow.staged.get(task_id) {
            return Ok(self.flow.converge_contexts(ctxs).value);
        }
        if let Some(entry) = self.flow.latest_entry(task_id) {
            let value = self
                .flow
                .contexts
                .get(entry.ctx)
                .map(|c| c.value.clone())
                .unwrap_or_default();
            return Ok(value);
        }
        Ok(ContextMap::new())
    }

    /// Context indices handed to each destination of the task's satisfied
    /// transitions.
    pub fn get_task_transition_contexts(
        &self,
        task_id: &str,
    ) -> EngineResult<BTreeMap<String, Vec<usize>>> {
        if !self.graph.has_task(task_id) {
            return Err(EngineError::UnknownTask(task_id.to_string()));
        }
        let Some(entry) = self.flow.latest_entry(task_id) else {
            return Ok(BTreeMap::new());
        };

        let mut result = BTreeMap::new();
        for transition in self.graph.get_next_transitions(task_id) {
            if entry.transitions.get(&transition.flag()) != Some(&true) {
                continue;
            }
            let ctxs = self
                .flow
                .staged
                .get(&transition.destination)
                .cloned()
                .or_else(|| {
                    self.flow
                        .latest_entry(&transition.destination)
                        .map(|e| vec![e.ctx])
                })
                .unwrap_or_default();
            result.insert(transition.destination.clone(), ctxs);
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    /// Render defaults merged with runtime inputs (runtime wins), then the
    /// vars against the inputs; stage every graph root with context 0.
    fn init_flow(&mut self) {
        debug!(workflow = %self.def.name, "initializing task flow");
        match Self::render_initial_context(&self.def, &self.inputs) {
            Ok(ctx0) => {
                self.flow.add_context(ctx0, Vec::new());
                let roots: Vec<String> =
                    self.graph.roots().iter().map(|n| n.id.clone()).collect();
                for root in roots {
                    self.flow.stage(&root, 0);
                }
            }
            Err(e) => {
                self.errors.push(ExecutionError::new(e.to_string()));
                self.fail_workflow();
            }
        }
    }

    fn render_initial_context(def: &WorkflowDef, inputs: &ContextMap) -> EngineResult<ContextMap> {
        let mut rendered = inputs.clone();
        let mut missing: Vec<String> = Vec::new();

        for decl in &def.input {
            match decl {
                InputDecl::Required(name) => {
                    if !rendered.contains_key(name) {
                        missing.push(name.clone());
                    }
                }
                InputDecl::Defaulted(map) => {
                    for (name, default) in map {
                        if rendered.contains_key(name) {
                            continue;
                        }
                        let value = expr::evaluate_value(default, &rendered)
                            .map_err(|e| EngineError::Expression(format!("input '{name}': {e}")))?;
                        rendered.insert(name.clone(), value);
                    }
                }
            }
        }
        if !missing.is_empty() {
            return Err(EngineError::Validation(format!(
                "missing required inputs: {}",
                missing.join(", ")
            )));
        }

        for assignments in &def.vars {
            for (name, value) in assignments {
                let value = expr::evaluate_value(value, &rendered)
                    .map_err(|e| EngineError::Expression(format!("var '{name}': {e}")))?;
                rendered.insert(name.clone(), value);
            }
        }
        Ok(rendered)
    }

    fn render_task(&self, task_id: &str) -> EngineResult<Option<TaskRender>> {
        let node = self.graph.get_task(task_id)?;
        if is_reserved_task(&node.name) {
            return Ok(None);
        }
        let Some(task) = self.def.get_task(&node.name) else {
            return Ok(None);
        };

        let ctxs = self
            .flow
            .staged
            .get(task_id)
            .cloned()
            .or_else(|| self.flow.latest_entry(task_id).map(|e| vec![e.ctx]))
            .unwrap_or_default();
        let context = self.flow.converge_contexts(&ctxs).value;

        let action = match &task.action {
            Some(action) => match expr::evaluate(action, &context)? {
                Value::String(s) => Some(s),
                other => Some(other.to_string()),
            },
            None => None,
        };
        let input = match &task.input {
            Some(input) => match expr::evaluate_value(input, &context)? {
                Value::Object(map) => map,
                other => {
                    let mut map = ContextMap::new();
                    map.insert("value".to_string(), other);
                    map
                }
            },
            None => ContextMap::new(),
        };

        Ok(Some(TaskRender {
            id: task_id.to_string(),
            name: node.name.clone(),
            action,
            input,
            ctxs,
        }))
    }

    fn apply_task_event(
        &mut self,
        task_id: &str,
        new_status: Status,
        result: Option<Value>,
        pending: &mut VecDeque<(String, Status, Option<Value>)>,
    ) -> EngineResult<()> {
        let node = self.graph.get_task(task_id)?.clone();
        let in_cycle = self.graph.in_cycle(task_id);

        // resolve the target entry and validate before mutating anything
        let latest_idx = self.flow.latest_entry_index(task_id);
        let (old_status, reuse_entry) = match latest_idx {
            Some(idx) => {
                let entry = &self.flow.sequence[idx];
                let retrying = entry.status.is_abended() && entry.retries.unwrap_or(0) > 0;
                let reenters = in_cycle || retrying || is_reserved_task(&node.name);
                if entry.status.is_completed() && reenters && new_status.is_active() {
                    // a loop iteration, retry attempt or pseudo-task re-use
                    // opens a fresh entry
                    (Status::Unset, None)
                } else {
                    (entry.status, Some(idx))
                }
            }
            None => (Status::Unset, None),
        };
        machines::validate_task_transition(old_status, new_status)?;

        debug!(task = %task_id, from = %old_status, to = %new_status, "task status update");

        // activation consumes the staged contexts
        let staged_ctx = if new_status.is_active() || reuse_entry.is_none() {
            self.flow
                .unstage(task_id)
                .map(|ctxs| self.resolve_staged_context(ctxs))
        } else {
            None
        };

        let entry_idx = match reuse_entry {
            Some(idx) => {
                if let Some(ctx) = staged_ctx {
                    self.flow.sequence[idx].ctx = ctx;
                }
                idx
            }
            None => {
                let ctx = staged_ctx.unwrap_or(0);
                let mut entry = FlowEntry::new(task_id, ctx);
                entry.retries = match latest_idx {
                    Some(prev_idx) => {
                        let prev = &self.flow.sequence[prev_idx];
                        if prev.status.is_abended() && prev.retries.unwrap_or(0) > 0 {
                            prev.retries.map(|r| r - 1)
                        } else {
                            Self::declared_retries(&self.def, &node.name)
                        }
                    }
                    None => Self::declared_retries(&self.def, &node.name),
                };
                self.flow.append_entry(entry)
            }
        };
        self.flow.sequence[entry_idx].status = new_status;

        // re-observing the same completed status is an idempotent no-op:
        // transitions, staging and the terminal merge are not repeated
        let mut failure_handled = false;
        if new_status.is_completed() && old_status != new_status {
            failure_handled =
                self.process_completion(entry_idx, &node, new_status, result, pending)?;
        }

        self.derive_workflow_status(entry_idx, new_status, failure_handled);
        if self.status.is_terminal() {
            self.finalize();
        }
        Ok(())
    }

    fn declared_retries(def: &WorkflowDef, task_name: &str) -> Option<u32> {
        def.get_task(task_name)
            .and_then(|t| t.retry.as_ref())
            .map(|r| r.count)
    }

    fn resolve_staged_context(&mut self, ctxs: Vec<usize>) -> usize {
        if ctxs.is_empty() {
            return 0;
        }
        if ctxs.iter().all(|c| *c == ctxs[0]) {
            return ctxs[0];
        }
        let merged = self.flow.converge_contexts(&ctxs);
        self.flow.contexts.push(merged);
        self.flow.contexts.len() - 1
    }

    /// Evaluate outbound criteria, record satisfaction flags, publish and
    /// stage downstream work. Returns whether an abnormal completion was
    /// remediated.
    fn process_completion(
        &mut self,
        entry_idx: usize,
        node: &TaskNode,
        status: Status,
        result: Option<Value>,
        pending: &mut VecDeque<(String, Status, Option<Value>)>,
    ) -> EngineResult<bool> {
        let in_ctx = self.flow.sequence[entry_idx].ctx;
        let in_ctx_value = self
            .flow
            .contexts
            .get(in_ctx)
            .map(|c| c.value.clone())
            .unwrap_or_default();

        let mut eval_ctx = in_ctx_value.clone();
        eval_ctx.insert(
            CTX_TASK_KEY.to_string(),
            json!({
                "id": node.id,
                "name": node.name,
                "status": status.to_string(),
                "result": result,
            }),
        );
        let names = self.graph_names();
        eval_ctx.insert(
            CTX_FLOW_KEY.to_string(),
            Value::Object(self.flow.status_snapshot(&names)),
        );

        let transitions = self.graph.get_next_transitions(&node.id).to_vec();

        if transitions.is_empty() && !is_reserved_task(&node.name) {
            // terminal task: merge its context into the term entry, at most
            // once per flow index
            if !self.flow.term.srcs.contains(&entry_idx) {
                deep_merge(&mut self.flow.term.value, &in_ctx_value);
                self.flow.term.srcs.push(entry_idx);
            }
        }

        let mut any_satisfied = false;
        for transition in &transitions {
            let satisfied = match self.eval_criteria(&transition.criteria, &eval_ctx) {
                Ok(satisfied) => satisfied,
                Err(e) => {
                    warn!(task = %node.id, error = %e, "criteria evaluation failed");
                    self.errors
                        .push(ExecutionError::for_task(node.id.clone(), e.to_string()));
                    self.fail_workflow();
                    false
                }
            };
            self.flow.sequence[entry_idx]
                .transitions
                .insert(transition.flag(), satisfied);
            if !satisfied {
                continue;
            }
            any_satisfied = true;

            let dest_node = self.graph.get_task(&transition.destination)?.clone();
            let out_ctx = match self.def.finalize_context(
                &node.name,
                &dest_node.name,
                &transition.criteria,
                &eval_ctx,
            ) {
                Ok(published) if published.is_empty() => in_ctx,
                Ok(published) => {
                    let mut merged = in_ctx_value.clone();
                    deep_merge(&mut merged, &published);
                    if merged == in_ctx_value {
                        in_ctx
                    } else {
                        self.flow.add_context(merged, vec![entry_idx])
                    }
                }
                Err(e) => {
                    warn!(task = %node.id, error = %e, "publish evaluation failed");
                    self.errors
                        .push(ExecutionError::for_task(node.id.clone(), e.to_string()));
                    self.fail_workflow();
                    in_ctx
                }
            };

            debug!(task = %node.id, next = %transition.destination, ctx = out_ctx, "staging next task");
            self.flow.stage(&transition.destination, out_ctx);

            match dest_node.name.as_str() {
                RESERVED_NOOP => {
                    pending.push_back((transition.destination.clone(), Status::Running, None));
                    pending.push_back((transition.destination.clone(), Status::Succeeded, None));
                }
                RESERVED_FAIL => {
                    pending.push_back((transition.destination.clone(), Status::Running, None));
                    pending.push_back((transition.destination.clone(), Status::Failed, None));
                }
                _ => {}
            }
        }

        let mut handled = any_satisfied;
        if status.is_abended() {
            let retries = self.flow.sequence[entry_idx].retries.unwrap_or(0);
            if retries > 0 {
                info!(task = %node.id, retries, "re-staging abended task for retry");
                self.flow.stage(&node.id, in_ctx);
                handled = true;
            }
        }
        Ok(handled)
    }

    fn eval_criteria(&self, criteria: &[String], ctx: &ContextMap) -> EngineResult<bool> {
        for criterion in criteria {
            if !expr::evaluate_condition(criterion, ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn derive_workflow_status(
        &mut self,
        entry_idx: usize,
        task_status: Status,
        failure_handled: bool,
    ) {
        let event_ctx = WorkflowEventContext {
            workflow_active: self.flow.has_active_tasks(),
            workflow_incomplete: self.flow.has_staged_tasks()
                || self.flow.sequence[entry_idx].has_satisfied_transition(),
            failure_handled,
        };
        let event = machines::derive_workflow_event(task_status, event_ctx);

        if let Some(next) = machines::workflow_transition(self.status, &event) {
            if next != self.status {
                info!(workflow = %self.def.name, from = %self.status, to = %next, event = %event, "workflow status change");
                self.status = next;
            }
        }
    }

    fn fail_workflow(&mut self) {
        if let Some(next) = machines::workflow_transition(self.status, "workflow_failed") {
            if next != self.status {
                warn!(workflow = %self.def.name, from = %self.status, to = %next, "workflow failed");
                self.status = next;
            }
        } else if !self.status.is_completed() {
            self.status = Status::Failed;
        }
    }

    /// Render workflow outputs from the terminal context once the workflow
    /// succeeds; an output rendering failure demotes the workflow to failed.
    fn finalize(&mut self) {
        if self.status != Status::Succeeded || self.outputs.is_some() {
            return;
        }
        match Self::render_outputs(&self.def, &self.flow.term.value) {
            Ok(outputs) => {
                self.outputs = Some(outputs);
            }
            Err(e) => {
                warn!(workflow = %self.def.name, error = %e, "output rendering failed");
                self.errors.push(ExecutionError::new(e.to_string()));
                self.status = Status::Failed;
            }
        }
    }

    fn render_outputs(def: &WorkflowDef, term: &ContextMap) -> EngineResult<ContextMap> {
        let mut ctx = term.clone();
        let mut outputs = ContextMap::new();
        for assignments in &def.output {
            for (name, value) in assignments {
                let value = expr::evaluate_value(value, &ctx)
                    .map_err(|e| EngineError::Expression(format!("output '{name}': {e}")))?;
                ctx.insert(name.clone(), value.clone());
                outputs.insert(name.clone(), value);
            }
        }
        Ok(outputs)
    }

    fn graph_names(&self) -> BTreeMap<String, String> {
        self.graph
            .task_ids()
            .iter()
            .map(|id| {
                let name = self
                    .graph
                    .get_task(id)
                    .map(|n| n.name.clone())
                    .unwrap_or_else(|_| (*id).to_string());
                ((*id).to_string(), name)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parse_workflow;
    use serde_json::json;

    const SEQUENTIAL_WF: &str = r#"
version: '1.0'
name: examples.sequential
input:
  - name
  - greeting: hello
vars:
  - msg: '{{ greeting }}, {{ name }}'
output:
  - message: '{{ msg }}'
tasks:
  task1:
    action: core.echo
    input:
      message: '{{ msg }}'
    next:
      - publish:
          - msg: '{{ result().message }}'
        do: task2
  task2:
    action: core.echo
    input:
      message: '{{ msg }}'
"#;

    const CYCLE_WF: &str = r#"
version: '1.0'
name: examples.cycle
tasks:
  prep:
    action: core.echo
    next:
      - publish:
          - count: '{{ result().count }}'
        do: task1
  task1:
    action: core.echo
    next:
      - publish:
          - count: '{{ result().count }}'
        do: task2
  task2:
    action: core.echo
    next:
      - publish:
          - count: '{{ result().count }}'
        do: task3
  task3:
    action: core.echo
    next:
      - publish:
          - count: '{{ result().count }}'
        when: '{{ result().count < 3 }}'
        do: task1
"#;

    const PARALLEL_WF: &str = r#"
version: '1.0'
name: examples.parallel
tasks:
  setup:
    action: core.echo
    next:
      - do: [branch_a, branch_b]
  branch_a:
    action: core.echo
  branch_b:
    action: core.echo
"#;

    const JOIN_WF: &str = r#"
version: '1.0'
name: examples.join
tasks:
  t1:
    action: core.echo
    next:
      - publish:
          - a: 1
        do: t3
  t2:
    action: core.echo
    next:
      - publish:
          - b: 2
        do: t3
  t3:
    action: core.echo
    join: all
"#;

    fn make_conductor(yaml: &str, inputs: Value) -> WorkflowConductor {
        let def = parse_workflow(yaml).unwrap();
        let inputs = inputs.as_object().cloned().unwrap_or_default();
        let mut conductor = WorkflowConductor::with_inputs(def, inputs).unwrap();
        conductor.request_workflow_status(Status::Running).unwrap();
        conductor
    }

    fn run_task(conductor: &mut WorkflowConductor, id: &str, status: Status, result: Value) {
        conductor.update_task_flow(id, Status::Running, None).unwrap();
        conductor.update_task_flow(id, status, Some(result)).unwrap();
    }

    fn task_sequence(conductor: &WorkflowConductor) -> Vec<&str> {
        conductor
            .task_flow()
            .sequence
            .iter()
            .map(|e| e.id.as_str())
            .collect()
    }

    #[test]
    fn test_sequential_workflow_to_success() {
        let mut conductor = make_conductor(SEQUENTIAL_WF, json!({"name": "alpha"}));

        let start = conductor.get_start_tasks();
        assert_eq!(start.len(), 1);
        assert_eq!(start[0].id, "task1");
        assert_eq!(start[0].action.as_deref(), Some("core.echo"));
        assert_eq!(start[0].input.get("message"), Some(&json!("hello, alpha")));

        run_task(
            &mut conductor,
            "task1",
            Status::Succeeded,
            json!({"message": "hello, alpha!"}),
        );
        assert_eq!(conductor.status(), Status::Running);

        let next = conductor.get_next_tasks(Some("task1")).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, "task2");
        assert_eq!(next[0].input.get("message"), Some(&json!("hello, alpha!")));

        run_task(&mut conductor, "task2", Status::Succeeded, json!({}));
        assert_eq!(conductor.status(), Status::Succeeded);
        assert_eq!(
            conductor.outputs().unwrap().get("message"),
            Some(&json!("hello, alpha!"))
        );
        assert_eq!(task_sequence(&conductor), vec!["task1", "task2"]);
    }

    #[test]
    fn test_start_tasks_require_running_status() {
        let def = parse_workflow(PARALLEL_WF).unwrap();
        let mut conductor = WorkflowConductor::new(def).unwrap();
        assert!(conductor.get_start_tasks().is_empty());

        conductor.request_workflow_status(Status::Running).unwrap();
        let start = conductor.get_start_tasks();
        assert_eq!(start.len(), 1);
        assert_eq!(start[0].id, "setup");
    }

    #[test]
    fn test_missing_required_input_fails_workflow() {
        let mut conductor = make_conductor(SEQUENTIAL_WF, json!({}));
        assert_eq!(conductor.status(), Status::Failed);
        assert!(conductor.errors()[0].message.contains("name"));
        assert!(conductor.get_start_tasks().is_empty());
    }

    #[test]
    fn test_unset_to_succeeded_is_rejected() {
        let mut conductor = make_conductor(SEQUENTIAL_WF, json!({"name": "alpha"}));
        let err = conductor
            .update_task_flow("task1", Status::Succeeded, None)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTaskTransition {
                from: Status::Unset,
                to: Status::Succeeded,
            }
        ));
        // nothing was recorded
        assert!(conductor.task_flow().sequence.is_empty());
        assert!(conductor.task_flow().is_staged("task1"));
    }

    #[test]
    fn test_unknown_task_is_rejected() {
        let mut conductor = make_conductor(SEQUENTIAL_WF, json!({"name": "alpha"}));
        let err = conductor
            .update_task_flow("bogus", Status::Running, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownTask(_)));
        assert!(matches!(
            conductor.get_next_tasks(Some("bogus")),
            Err(EngineError::UnknownTask(_))
        ));
    }

    #[test]
    fn test_next_tasks_empty_until_completed() {
        let mut conductor = make_conductor(SEQUENTIAL_WF, json!({"name": "alpha"}));
        conductor
            .update_task_flow("task1", Status::Running, None)
            .unwrap();
        assert!(conductor.get_next_tasks(Some("task1")).unwrap().is_empty());
    }

    #[test]
    fn test_join_waits_for_all_predecessors() {
        let mut conductor = make_conductor(JOIN_WF, json!({}));
        let start = conductor.get_start_tasks();
        assert_eq!(start.len(), 2);

        run_task(&mut conductor, "t1", Status::Succeeded, json!({}));
        // only one of two inbound transitions satisfied
        assert!(conductor.get_next_tasks(Some("t1")).unwrap().is_empty());
        assert!(conductor.get_next_tasks(None).unwrap().is_empty());

        run_task(&mut conductor, "t2", Status::Succeeded, json!({}));
        let next = conductor.get_next_tasks(Some("t2")).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, "t3");

        // both branch contexts converge on activation
        conductor.update_task_flow("t3", Status::Running, None).unwrap();
        let entry = conductor.task_flow().latest_entry("t3").unwrap();
        let ctx = &conductor.task_flow().contexts[entry.ctx];
        assert_eq!(ctx.value.get("a"), Some(&json!(1)));
        assert_eq!(ctx.value.get("b"), Some(&json!(2)));

        conductor
            .update_task_flow("t3", Status::Succeeded, None)
            .unwrap();
        assert_eq!(conductor.status(), Status::Succeeded);
    }

    #[test]
    fn test_cycle_runs_three_iterations() {
        let mut conductor = make_conductor(CYCLE_WF, json!({}));
        let start = conductor.get_start_tasks();
        assert_eq!(start[0].id, "prep");

        let counts = [0, 0, 0, 1, 1, 1, 2, 2, 2, 3];
        let order = [
            "prep", "task1", "task2", "task3", "task1", "task2", "task3", "task1", "task2",
            "task3",
        ];
        for (id, count) in order.iter().zip(counts) {
            run_task(&mut conductor, id, Status::Succeeded, json!({"count": count}));
        }

        assert_eq!(conductor.status(), Status::Succeeded);
        assert_eq!(task_sequence(&conductor), order.to_vec());
    }

    #[test]
    fn test_pausing_branch_converges_to_paused() {
        let mut conductor = make_conductor(PARALLEL_WF, json!({}));
        run_task(&mut conductor, "setup", Status::Succeeded, json!({}));
        conductor
            .update_task_flow("branch_a", Status::Running, None)
            .unwrap();
        conductor
            .update_task_flow("branch_b", Status::Running, None)
            .unwrap();

        conductor.request_workflow_status(Status::Paused).unwrap();
        assert_eq!(conductor.status(), Status::Pausing);

        conductor
            .update_task_flow("branch_a", Status::Succeeded, None)
            .unwrap();
        assert_eq!(conductor.status(), Status::Pausing);

        conductor
            .update_task_flow("branch_b", Status::Succeeded, None)
            .unwrap();
        assert_eq!(conductor.status(), Status::Paused);
    }

    #[test]
    fn test_failure_preempts_pause() {
        let mut conductor = make_conductor(PARALLEL_WF, json!({}));
        run_task(&mut conductor, "setup", Status::Succeeded, json!({}));
        conductor
            .update_task_flow("branch_a", Status::Running, None)
            .unwrap();
        conductor
            .update_task_flow("branch_b", Status::Running, None)
            .unwrap();

        conductor.request_workflow_status(Status::Paused).unwrap();
        assert_eq!(conductor.status(), Status::Pausing);

        conductor
            .update_task_flow("branch_a", Status::Succeeded, None)
            .unwrap();
        conductor
            .update_task_flow("branch_b", Status::Failed, None)
            .unwrap();
        assert_eq!(conductor.status(), Status::Failed);
    }

    #[test]
    fn test_resume_from_paused() {
        let mut conductor = make_conductor(PARALLEL_WF, json!({}));
        run_task(&mut conductor, "setup", Status::Succeeded, json!({}));
        conductor.request_workflow_status(Status::Paused).unwrap();
        assert_eq!(conductor.status(), Status::Paused);
        assert!(conductor.get_next_tasks(None).unwrap().is_empty());

        conductor.request_workflow_status(Status::Resuming).unwrap();
        let staged = conductor.get_next_tasks(None).unwrap();
        assert_eq!(staged.len(), 2);

        conductor
            .update_task_flow("branch_a", Status::Running, None)
            .unwrap();
        assert_eq!(conductor.status(), Status::Running);
    }

    #[test]
    fn test_cancel_converges_once_dormant() {
        let mut conductor = make_conductor(PARALLEL_WF, json!({}));
        run_task(&mut conductor, "setup", Status::Succeeded, json!({}));
        conductor
            .update_task_flow("branch_a", Status::Running, None)
            .unwrap();

        conductor.request_workflow_status(Status::Canceled).unwrap();
        assert_eq!(conductor.status(), Status::Canceling);

        conductor
            .update_task_flow("branch_a", Status::Succeeded, None)
            .unwrap();
        assert_eq!(conductor.status(), Status::Canceled);
    }

    #[test]
    fn test_error_transition_remediates_failure() {
        let yaml = r#"
name: examples.remediate
tasks:
  work:
    action: core.risky
    next:
      - do: done
      - on: error
        do: cleanup
  cleanup:
    action: core.echo
  done:
    action: core.echo
"#;
        let mut conductor = make_conductor(yaml, json!({}));
        run_task(&mut conductor, "work", Status::Failed, json!({}));
        // failure was routed to the error branch, so the workflow continues
        assert_eq!(conductor.status(), Status::Running);

        let next = conductor.get_next_tasks(Some("work")).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, "cleanup");

        run_task(&mut conductor, "cleanup", Status::Succeeded, json!({}));
        assert_eq!(conductor.status(), Status::Succeeded);
    }

    #[test]
    fn test_unhandled_failure_fails_workflow() {
        let mut conductor = make_conductor(SEQUENTIAL_WF, json!({"name": "alpha"}));
        run_task(&mut conductor, "task1", Status::Failed, json!({}));
        assert_eq!(conductor.status(), Status::Failed);
        assert!(conductor.get_next_tasks(Some("task1")).unwrap().is_empty());
    }

    #[test]
    fn test_retry_restages_same_task() {
        let yaml = r#"
name: examples.retry
tasks:
  flaky:
    action: core.flaky
    retry:
      count: 2
    next:
      - do: done
  done:
    action: core.echo
"#;
        let mut conductor = make_conductor(yaml, json!({}));
        run_task(&mut conductor, "flaky", Status::Failed, json!({}));
        assert_eq!(conductor.status(), Status::Running);
        assert!(conductor.task_flow().is_staged("flaky"));

        let staged = conductor.get_next_tasks(None).unwrap();
        assert_eq!(staged[0].id, "flaky");

        run_task(&mut conductor, "flaky", Status::Succeeded, json!({}));
        run_task(&mut conductor, "done", Status::Succeeded, json!({}));
        assert_eq!(conductor.status(), Status::Succeeded);

        // one entry per attempt, with the retry budget counting down
        let flow = conductor.task_flow();
        assert_eq!(task_sequence(&conductor), vec!["flaky", "flaky", "done"]);
        assert_eq!(flow.sequence[0].retries, Some(2));
        assert_eq!(flow.sequence[1].retries, Some(1));
    }

    #[test]
    fn test_retry_budget_exhausts_to_failure() {
        let yaml = r#"
name: examples.retry-exhaust
tasks:
  flaky:
    action: core.flaky
    retry:
      count: 1
    next:
      - do: done
  done:
    action: core.echo
"#;
        let mut conductor = make_conductor(yaml, json!({}));
        run_task(&mut conductor, "flaky", Status::Failed, json!({}));
        assert_eq!(conductor.status(), Status::Running);

        run_task(&mut conductor, "flaky", Status::Failed, json!({}));
        assert_eq!(conductor.status(), Status::Failed);
    }

    #[test]
    fn test_noop_destination_autocompletes() {
        let yaml = r#"
name: examples.noop
tasks:
  a:
    action: core.echo
    next:
      - do: noop
"#;
        let mut conductor = make_conductor(yaml, json!({}));
        run_task(&mut conductor, "a", Status::Succeeded, json!({}));

        assert_eq!(conductor.status(), Status::Succeeded);
        let noop = conductor.task_flow().latest_entry("noop").unwrap();
        assert_eq!(noop.status, Status::Succeeded);
        // the pseudo-task does not contribute to the terminal context
        assert!(conductor.task_flow().term.srcs.len() <= 1);
    }

    #[test]
    fn test_fail_destination_fails_workflow() {
        let yaml = r#"
name: examples.guarded-fail
tasks:
  a:
    action: core.echo
    next:
      - on: error
        do: fail
      - do: done
  done:
    action: core.echo
"#;
        let mut conductor = make_conductor(yaml, json!({}));
        run_task(&mut conductor, "a", Status::Failed, json!({}));
        assert_eq!(conductor.status(), Status::Failed);
        assert_eq!(
            conductor.task_flow().latest_entry("fail").unwrap().status,
            Status::Failed
        );
    }

    #[test]
    fn test_terminal_context_merges_once() {
        let mut conductor = make_conductor(SEQUENTIAL_WF, json!({"name": "alpha"}));
        run_task(
            &mut conductor,
            "task1",
            Status::Succeeded,
            json!({"message": "hi"}),
        );
        run_task(&mut conductor, "task2", Status::Succeeded, json!({}));
        assert_eq!(conductor.status(), Status::Succeeded);

        let srcs = conductor.task_flow().term.srcs.clone();
        let sequence_len = conductor.task_flow().sequence.len();

        // re-observing the same completion is an idempotent no-op
        conductor
            .update_task_flow("task2", Status::Succeeded, Some(json!({})))
            .unwrap();
        assert_eq!(conductor.task_flow().term.srcs, srcs);
        assert_eq!(conductor.task_flow().sequence.len(), sequence_len);
        assert_eq!(conductor.status(), Status::Succeeded);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let mut conductor = make_conductor(JOIN_WF, json!({}));
        run_task(&mut conductor, "t1", Status::Succeeded, json!({}));

        let checkpoint = conductor.serialize().unwrap();
        assert_eq!(checkpoint["state"], "running");
        assert!(checkpoint["graph"]["directed"].as_bool().unwrap());

        let restored = WorkflowConductor::deserialize(&checkpoint).unwrap();
        assert_eq!(restored.status(), conductor.status());
        assert_eq!(restored.task_flow(), conductor.task_flow());
        assert_eq!(restored.serialize().unwrap(), checkpoint);
    }

    #[test]
    fn test_replay_reproduces_final_state() {
        let mut live = make_conductor(CYCLE_WF, json!({}));
        let initial = live.serialize().unwrap();

        let counts = [0, 0, 0, 1, 1, 1, 2, 2, 2, 3];
        let order = [
            "prep", "task1", "task2", "task3", "task1", "task2", "task3", "task1", "task2",
            "task3",
        ];
        for (id, count) in order.iter().zip(counts) {
            run_task(&mut live, id, Status::Succeeded, json!({"count": count}));
        }

        let mut replayed = WorkflowConductor::deserialize(&initial).unwrap();
        for (id, count) in order.iter().zip(counts) {
            run_task(&mut replayed, id, Status::Succeeded, json!({"count": count}));
        }

        assert_eq!(replayed.status(), live.status());
        assert_eq!(replayed.task_flow(), live.task_flow());
        assert_eq!(replayed.serialize().unwrap(), live.serialize().unwrap());
    }

    #[test]
    fn test_transition_context_projections() {
        let mut conductor = make_conductor(JOIN_WF, json!({}));
        run_task(&mut conductor, "t1", Status::Succeeded, json!({}));

        let contexts = conductor.get_task_transition_contexts("t1").unwrap();
        let staged = contexts.get("t3").unwrap();
        assert_eq!(staged.len(), 1);

        let initial = conductor.get_task_initial_context("t3").unwrap();
        assert_eq!(initial.get("a"), Some(&json!(1)));
    }

    #[test]
    fn test_bad_output_expression_demotes_to_failed() {
        let yaml = r#"
name: examples.badoutput
output:
  - report: '{{ missing.attr }}'
tasks:
  a:
    action: core.echo
"#;
        let mut conductor = make_conductor(yaml, json!({}));
        run_task(&mut conductor, "a", Status::Succeeded, json!({}));

        assert_eq!(conductor.status(), Status::Failed);
        assert!(conductor.outputs().is_none());
        assert!(conductor.errors()[0].message.contains("output 'report'"));
    }

    #[test]
    fn test_bad_publish_expression_fails_workflow() {
        let yaml = r#"
name: examples.badpublish
tasks:
  a:
    action: core.echo
    next:
      - publish:
          - broken: '{{ result().missing.deep }}'
        do: b
  b:
    action: core.echo
"#;
        let mut conductor = make_conductor(yaml, json!({}));
        run_task(&mut conductor, "a", Status::Succeeded, json!({}));
        assert_eq!(conductor.status(), Status::Failed);
        assert_eq!(conductor.errors().len(), 1);
        assert_eq!(conductor.errors()[0].task_id.as_deref(), Some("a"));
    }
}

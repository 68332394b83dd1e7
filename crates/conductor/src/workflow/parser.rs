//! Workflow definition YAML parser.
//!
//! Parses YAML definition documents into [`WorkflowDef`] structures and
//! validates them: model-specific fields, transition target references,
//! reserved names, and expression syntax in every clause that may carry
//! expressions.

use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::expr;
use crate::workflow::types::{is_reserved_task, FlowModel, InputDecl, WorkflowDef};

/// Parse a YAML string into a validated [`WorkflowDef`].
pub fn parse_workflow(yaml_content: &str) -> EngineResult<WorkflowDef> {
    let def: WorkflowDef =
        serde_yaml::from_str(yaml_content).map_err(|e| EngineError::Parse(e.to_string()))?;

    validate_workflow(&def)?;

    Ok(def)
}

/// Validate a parsed workflow definition.
pub fn validate_workflow(def: &WorkflowDef) -> EngineResult<()> {
    if def.name.trim().is_empty() {
        return Err(EngineError::Validation(
            "workflow name must not be empty".to_string(),
        ));
    }

    if def.tasks.is_empty() {
        return Err(EngineError::Validation(
            "workflow must declare at least one task".to_string(),
        ));
    }

    for name in def.tasks.keys() {
        if is_reserved_task(name) {
            return Err(EngineError::Validation(format!(
                "task name '{name}' is reserved"
            )));
        }
    }

    match def.model {
        FlowModel::Direct => validate_direct(def)?,
        FlowModel::Reverse => validate_reverse(def)?,
    }

    if def.start_task_names().is_empty() {
        return Err(EngineError::Validation(
            "workflow has no start tasks (every task has a predecessor)".to_string(),
        ));
    }

    validate_expressions(def)?;

    Ok(())
}

fn validate_direct(def: &WorkflowDef) -> EngineResult<()> {
    for (name, task) in &def.tasks {
        if !task.requires.is_empty() {
            return Err(EngineError::Validation(format!(
                "task '{name}': 'requires' is only allowed in the reverse model"
            )));
        }
        for rule in &task.next {
            for target in rule.targets() {
                if !is_reserved_task(target) && !def.tasks.contains_key(target) {
                    return Err(EngineError::Validation(format!(
                        "task '{name}': transition targets unknown task '{target}'"
                    )));
                }
            }
        }
    }
    Ok(())
}

fn validate_reverse(def: &WorkflowDef) -> EngineResult<()> {
    for (name, task) in &def.tasks {
        if !task.next.is_empty() {
            return Err(EngineError::Validation(format!(
                "task '{name}': 'next' is only allowed in the direct model"
            )));
        }
        for required in &task.requires {
            if !def.tasks.contains_key(required) {
                return Err(EngineError::Validation(format!(
                    "task '{name}': requires unknown task '{required}'"
                )));
            }
        }
    }
    Ok(())
}

fn validate_expressions(def: &WorkflowDef) -> EngineResult<()> {
    let mut issues = Vec::new();

    for decl in &def.input {
        if let InputDecl::Defaulted(map) = decl {
            for (name, value) in map {
                check_value(value, &format!("input '{name}'"), &mut issues);
            }
        }
    }
    for assignments in &def.vars {
        for (name, value) in assignments {
            check_value(value, &format!("var '{name}'"), &mut issues);
        }
    }
    for assignments in &def.output {
        for (name, value) in assignments {
            check_value(value, &format!("output '{name}'"), &mut issues);
        }
    }

    for (name, task) in &def.tasks {
        if let Some(action) = &task.action {
            check_text(action, &format!("task '{name}' action"), &mut issues);
        }
        if let Some(input) = &task.input {
            check_value(input, &format!("task '{name}' input"), &mut issues);
        }
        for (idx, rule) in task.next.iter().enumerate() {
            if let Some(when) = &rule.when {
                check_text(when, &format!("task '{name}' next[{idx}] when"), &mut issues);
            }
            for assignments in &rule.publish {
                for (key, value) in assignments {
                    check_value(
                        value,
                        &format!("task '{name}' next[{idx}] publish '{key}'"),
                        &mut issues,
                    );
                }
            }
        }
    }

    if let Some(issue) = issues.first() {
        return Err(EngineError::Validation(issue.clone()));
    }
    Ok(())
}

fn check_text(text: &str, location: &str, issues: &mut Vec<String>) {
    for issue in expr::validate(text) {
        issues.push(format!("{location}: {}", issue.message));
    }
}

fn check_value(value: &Value, location: &str, issues: &mut Vec<String>) {
    match value {
        Value::String(s) => check_text(s, location, issues),
        Value::Object(map) => {
            for (_, v) in map {
                check_value(v, location, issues);
            }
        }
        Value::Array(arr) => {
            for v in arr {
                check_value(v, location, issues);
            }
        }
        _ => {}
    }
}

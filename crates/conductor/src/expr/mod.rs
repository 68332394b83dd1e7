//! Pluggable expression evaluation.
//!
//! Expression languages are registered once in a static registry and
//! selected by delimiter sniffing: `{{ .. }}` / `{% .. %}` blocks resolve to
//! the Jinja evaluator, `<% .. %>` blocks to the Rhai evaluator. A string
//! that mixes delimiters of two registered languages is rejected, since the
//! result of interleaving them is undefined.

pub mod jinja;
pub mod rhai;

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::error::{EngineError, EngineResult};

pub use jinja::JinjaEvaluator;
pub use rhai::RhaiEvaluator;

/// Mapping type used as the evaluation context.
pub type ContextMap = serde_json::Map<String, Value>;

/// Reserved context key exposing the completing task and its result.
pub const CTX_TASK_KEY: &str = "__task";
/// Reserved context key exposing the serialized flow for status lookups.
pub const CTX_FLOW_KEY: &str = "__flow";

/// A problem found while validating an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Human-readable description of the problem.
    pub message: String,
    /// The offending expression text.
    pub expression: String,
}

/// A variable referenced inside an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarRef {
    /// Variable name.
    pub name: String,
    /// The expression block the variable was found in.
    pub expression: String,
}

/// Expression evaluation capability for one language.
pub trait Evaluator: Send + Sync {
    /// Registry tag for this language.
    fn name(&self) -> &'static str;

    /// Evaluate `text` against `context`, returning the resulting value.
    /// A string consisting of a single expression block keeps the value's
    /// type; mixed text renders to a string.
    fn evaluate(&self, text: &str, context: &ContextMap) -> EngineResult<Value>;

    /// Check `text` for syntax problems without evaluating it.
    fn validate(&self, text: &str) -> Vec<ValidationIssue>;

    /// List the variables referenced in `text`, sorted by name.
    fn extract_vars(&self, text: &str) -> Vec<VarRef>;

    /// Check whether `text` contains expression blocks of this language.
    fn has_expressions(&self, text: &str) -> bool;
}

static EVALUATORS: Lazy<Vec<Box<dyn Evaluator>>> = Lazy::new(|| {
    vec![
        Box::new(JinjaEvaluator::new()),
        Box::new(RhaiEvaluator::new()),
    ]
});

/// Find the registered evaluator whose delimiters match `text`.
///
/// Returns `None` for plain strings. A string matching more than one
/// registered language is a validation error.
pub fn evaluator_for(text: &str) -> EngineResult<Option<&'static dyn Evaluator>> {
    let mut matched: Option<&'static dyn Evaluator> = None;
    for evaluator in EVALUATORS.iter() {
        if evaluator.has_expressions(text) {
            if matched.is_some() {
                return Err(EngineError::Validation(format!(
                    "expression mixes multiple languages: {text}"
                )));
            }
            matched = Some(evaluator.as_ref());
        }
    }
    Ok(matched)
}

/// Look up a registered evaluator by its tag.
pub fn evaluator_by_name(name: &str) -> Option<&'static dyn Evaluator> {
    EVALUATORS
        .iter()
        .find(|e| e.name() == name)
        .map(|e| e.as_ref())
}

/// Evaluate a string, dispatching on its delimiters. Plain strings come
/// back unchanged.
pub fn evaluate(text: &str, context: &ContextMap) -> EngineResult<Value> {
    match evaluator_for(text)? {
        Some(evaluator) => evaluator.evaluate(text, context),
        None => Ok(Value::String(text.to_string())),
    }
}

/// Evaluate a nested structure recursively: strings are dispatched through
/// [`evaluate`], objects and arrays are walked, everything else is cloned.
pub fn evaluate_value(value: &Value, context: &ContextMap) -> EngineResult<Value> {
    match value {
        Value::String(s) => evaluate(s, context),
        Value::Object(map) => {
            let mut result = serde_json::Map::new();
            for (k, v) in map {
                result.insert(k.clone(), evaluate_value(v, context)?);
            }
            Ok(Value::Object(result))
        }
        Value::Array(arr) => {
            let result: Result<Vec<_>, _> =
                arr.iter().map(|v| evaluate_value(v, context)).collect();
            Ok(Value::Array(result?))
        }
        _ => Ok(value.clone()),
    }
}

/// Evaluate a boolean condition. Bare conditions without delimiters are
/// treated as Jinja expressions.
pub fn evaluate_condition(condition: &str, context: &ContextMap) -> EngineResult<bool> {
    let value = match evaluator_for(condition)? {
        Some(evaluator) => evaluator.evaluate(condition, context)?,
        None => {
            let wrapped = format!("{{{{ {condition} }}}}");
            evaluate(&wrapped, context)?
        }
    };
    Ok(is_truthy(&value))
}

/// Validate a string against its matching language. A language mix is
/// reported as an issue rather than an error.
pub fn validate(text: &str) -> Vec<ValidationIssue> {
    match evaluator_for(text) {
        Ok(Some(evaluator)) => evaluator.validate(text),
        Ok(None) => vec![],
        Err(err) => vec![ValidationIssue {
            message: err.to_string(),
            expression: text.to_string(),
        }],
    }
}

/// Check whether any registered language matches `text`.
pub fn has_expressions(text: &str) -> bool {
    EVALUATORS.iter().any(|e| e.has_expressions(text))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
        Value::Array(arr) => !arr.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

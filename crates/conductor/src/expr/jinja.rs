//! Jinja2-style expression evaluation using minijinja.
//!
//! Handles `{{ .. }}` expression blocks and `{% .. %}` statements. A string
//! that is exactly one expression block evaluates type-preserving (numbers
//! stay numbers, mappings stay mappings); anything else renders to a string
//! and is parsed back opportunistically.
//!
//! Besides the usual filters, the environment exposes the conductor
//! functions `succeeded()`, `failed()`, `completed()`, `result()` and
//! `task_status(name)`, which read the reserved `__task`/`__flow` context
//! keys populated during transition-criteria evaluation.

use minijinja::value::ValueKind;
use minijinja::{Environment, Error, ErrorKind, State, Value};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{EngineError, EngineResult};

use super::{ContextMap, Evaluator, ValidationIssue, VarRef, CTX_FLOW_KEY, CTX_TASK_KEY};

static JINJA_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\{\{(.*?)\}\}|\{%(.*?)%\}").expect("valid regex"));

static IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("valid regex"));

const RESERVED_WORDS: &[&str] = &[
    "and", "or", "not", "in", "is", "if", "else", "elif", "endif", "for", "endfor", "set",
    "endset", "true", "false", "True", "False", "none", "None", "loop",
];

/// Evaluator for the `{{ .. }}` / `{% .. %}` expression language.
pub struct JinjaEvaluator {
    env: Environment<'static>,
}

impl Default for JinjaEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl JinjaEvaluator {
    /// Create the evaluator with filters and conductor functions registered.
    pub fn new() -> Self {
        let mut env = Environment::new();

        env.add_filter("tojson", filter_tojson);
        env.add_filter("fromjson", filter_fromjson);
        env.add_filter("default", filter_default);
        env.add_filter("d", filter_default); // alias
        env.add_filter("int", filter_int);
        env.add_filter("float", filter_float);
        env.add_filter("upper", filter_upper);
        env.add_filter("lower", filter_lower);
        env.add_filter("trim", filter_trim);
        env.add_filter("split", filter_split);
        env.add_filter("join", filter_join);
        env.add_filter("first", filter_first);
        env.add_filter("last", filter_last);
        env.add_filter("length", filter_length);

        env.add_function("succeeded", fn_succeeded);
        env.add_function("failed", fn_failed);
        env.add_function("completed", fn_completed);
        env.add_function("result", fn_result);
        env.add_function("task_status", fn_task_status);

        Self { env }
    }
}

impl Evaluator for JinjaEvaluator {
    fn name(&self) -> &'static str {
        "jinja"
    }

    fn evaluate(&self, text: &str, context: &ContextMap) -> EngineResult<serde_json::Value> {
        let ctx = Value::from_serialize(context);

        if let Some(inner) = single_expression(text) {
            let expr = self
                .env
                .compile_expression(inner)
                .map_err(|e| EngineError::Expression(e.to_string()))?;
            let value = expr
                .eval(ctx)
                .map_err(|e| EngineError::Expression(e.to_string()))?;
            return serde_json::to_value(&value).map_err(EngineError::from);
        }

        let tmpl = self
            .env
            .template_from_str(text)
            .map_err(|e| EngineError::Expression(e.to_string()))?;
        let rendered = tmpl
            .render(ctx)
            .map_err(|e| EngineError::Expression(e.to_string()))?;
        Ok(parse_rendered(rendered))
    }

    fn validate(&self, text: &str) -> Vec<ValidationIssue> {
        match self.env.template_from_str(text) {
            Ok(_) => vec![],
            Err(e) => vec![ValidationIssue {
                message: e.to_string(),
                expression: text.to_string(),
            }],
        }
    }

    fn extract_vars(&self, text: &str) -> Vec<VarRef> {
        let mut vars = Vec::new();
        for caps in JINJA_BLOCK_RE.captures_iter(text) {
            let block = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            let inner = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            collect_idents(block, inner, &mut vars);
        }
        vars.sort_by(|a, b| a.name.cmp(&b.name));
        vars.dedup_by(|a, b| a.name == b.name);
        vars
    }

    fn has_expressions(&self, text: &str) -> bool {
        (text.contains("{{") && text.contains("}}")) || (text.contains("{%") && text.contains("%}"))
    }
}

/// Return the inner expression when the whole string is one `{{ .. }}` block.
fn single_expression(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if !trimmed.starts_with("{{") || !trimmed.ends_with("}}") || trimmed.len() < 4 {
        return None;
    }
    let inner = &trimmed[2..trimmed.len() - 2];
    if inner.contains("{{") || inner.contains("}}") || inner.contains("{%") {
        return None;
    }
    Some(inner.trim())
}

/// Parse a rendered template back into a structured value where possible.
fn parse_rendered(rendered: String) -> serde_json::Value {
    let trimmed = rendered.trim();

    if (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
    {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return value;
        }
    }
    if let Ok(b) = trimmed.parse::<bool>() {
        return serde_json::Value::Bool(b);
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return serde_json::Value::Number(i.into());
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return serde_json::Value::Number(n);
        }
    }
    if trimmed == "null" || trimmed == "none" {
        return serde_json::Value::Null;
    }

    serde_json::Value::String(rendered)
}

fn collect_idents(block: &str, inner: &str, vars: &mut Vec<VarRef>) {
    for m in IDENT_RE.find_iter(inner) {
        let name = m.as_str();
        if RESERVED_WORDS.contains(&name) || name.starts_with("__") {
            continue;
        }
        let before = inner[..m.start()].chars().rev().find(|c| !c.is_whitespace());
        if matches!(before, Some('.') | Some('|')) {
            continue;
        }
        let after = inner[m.end()..].chars().find(|c| !c.is_whitespace());
        if matches!(after, Some('(')) {
            continue;
        }
        // skip identifiers inside string literals
        let quotes = inner[..m.start()]
            .chars()
            .filter(|c| *c == '\'' || *c == '"')
            .count();
        if quotes % 2 == 1 {
            continue;
        }
        vars.push(VarRef {
            name: name.to_string(),
            expression: block.trim().to_string(),
        });
    }
}

// ============================================================================
// Conductor functions
// ============================================================================

fn current_task(state: &State) -> Result<Value, Error> {
    state
        .lookup(CTX_TASK_KEY)
        .filter(|v| !v.is_undefined())
        .ok_or_else(|| {
            Error::new(
                ErrorKind::UndefinedError,
                "no current task in the evaluation context",
            )
        })
}

fn current_task_status(state: &State) -> Result<String, Error> {
    let task = current_task(state)?;
    Ok(task.get_attr("status")?.to_string())
}

fn fn_succeeded(state: &State) -> Result<bool, Error> {
    Ok(current_task_status(state)? == "succeeded")
}

fn fn_failed(state: &State) -> Result<bool, Error> {
    Ok(matches!(
        current_task_status(state)?.as_str(),
        "failed" | "expired" | "abandoned"
    ))
}

fn fn_completed(state: &State) -> Result<bool, Error> {
    Ok(matches!(
        current_task_status(state)?.as_str(),
        "succeeded" | "failed" | "expired" | "abandoned" | "canceled"
    ))
}

fn fn_result(state: &State) -> Result<Value, Error> {
    current_task(state)?.get_attr("result")
}

fn fn_task_status(state: &State, name: &str) -> Result<Value, Error> {
    let flow = state.lookup(CTX_FLOW_KEY).unwrap_or_default();
    let status = flow.get_attr(name).unwrap_or_default();
    if status.is_undefined() {
        Ok(Value::from("unset"))
    } else {
        Ok(status)
    }
}

// ============================================================================
// Filters
// ============================================================================

fn filter_tojson(value: Value) -> Result<String, Error> {
    serde_json::to_string(&value)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("tojson error: {e}")))
}

fn filter_fromjson(value: Value) -> Result<Value, Error> {
    let s = value.to_string();
    let json: serde_json::Value = serde_json::from_str(&s)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("fromjson error: {e}")))?;
    Ok(Value::from_serialize(&json))
}

fn filter_default(value: Value, default: Option<Value>) -> Value {
    if value.is_undefined() || value.is_none() {
        default.unwrap_or_else(|| Value::from(""))
    } else {
        value
    }
}

fn filter_int(value: Value) -> Value {
    let s = value.to_string();
    if let Ok(n) = s.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = s.parse::<f64>() {
        return Value::from(f as i64);
    }
    Value::from(0i64)
}

fn filter_float(value: Value) -> Value {
    let s = value.to_string();
    if let Ok(f) = s.parse::<f64>() {
        return Value::from(f);
    }
    Value::from(0.0f64)
}

fn filter_upper(value: Value) -> String {
    value.to_string().to_uppercase()
}

fn filter_lower(value: Value) -> String {
    value.to_string().to_lowercase()
}

fn filter_trim(value: Value) -> String {
    value.to_string().trim().to_string()
}

fn filter_split(value: Value, sep: String) -> Vec<String> {
    value
        .to_string()
        .split(&sep)
        .map(|s| s.to_string())
        .collect()
}

fn filter_join(value: Value, sep: Option<String>) -> Result<String, Error> {
    let sep = sep.unwrap_or_default();
    if let Some(len) = value.len() {
        let items: Vec<String> = (0..len)
            .filter_map(|i| value.get_item(&Value::from(i)).ok())
            .map(|v| v.to_string())
            .collect();
        Ok(items.join(&sep))
    } else {
        Ok(value.to_string())
    }
}

fn filter_first(value: Value) -> Result<Value, Error> {
    if let Some(len) = value.len() {
        if len > 0 {
            return value.get_item(&Value::from(0));
        }
    }
    Ok(Value::UNDEFINED)
}

fn filter_last(value: Value) -> Result<Value, Error> {
    if let Some(len) = value.len() {
        if len > 0 {
            return value.get_item(&Value::from(len - 1));
        }
    }
    Ok(Value::UNDEFINED)
}

fn filter_length(value: Value) -> Value {
    match value.kind() {
        ValueKind::String => Value::from(value.to_string().len()),
        ValueKind::Seq | ValueKind::Map => Value::from(value.len().unwrap_or(0)),
        _ => Value::from(0),
    }
}

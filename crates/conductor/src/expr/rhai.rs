//! Rhai expression evaluation.
//!
//! Handles `<% .. %>` blocks. Context keys are pushed into the script scope
//! as dynamic values, so expressions read them as plain variables. A string
//! that is exactly one block keeps the value's type; mixed text splices the
//! evaluated blocks back into the surrounding string.

use once_cell::sync::Lazy;
use regex::Regex;
use rhai::{Dynamic, Engine, Scope};

use crate::error::{EngineError, EngineResult};

use super::{ContextMap, Evaluator, ValidationIssue, VarRef};

static RHAI_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<%(.*?)%>").expect("valid regex"));

static IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("valid regex"));

const RESERVED_WORDS: &[&str] = &[
    "let", "const", "fn", "if", "else", "switch", "while", "loop", "for", "in", "return",
    "break", "continue", "true", "false", "throw", "try", "catch",
];

/// Evaluator for the `<% .. %>` expression language.
pub struct RhaiEvaluator {
    engine: Engine,
}

impl Default for RhaiEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl RhaiEvaluator {
    /// Create the evaluator with a default engine.
    pub fn new() -> Self {
        let mut engine = Engine::new();

        engine.register_fn("log", |msg: &str| {
            tracing::info!(target: "cadenza.rhai", "{}", msg);
        });
        engine.register_fn("parse_json", |s: &str| -> Dynamic {
            match serde_json::from_str::<serde_json::Value>(s) {
                Ok(v) => rhai::serde::to_dynamic(&v).unwrap_or(Dynamic::UNIT),
                Err(_) => Dynamic::UNIT,
            }
        });
        engine.register_fn("to_json", |val: Dynamic| -> String {
            let json: serde_json::Value =
                rhai::serde::from_dynamic(&val).unwrap_or(serde_json::Value::Null);
            serde_json::to_string(&json).unwrap_or_else(|_| "null".to_string())
        });

        Self { engine }
    }

    fn scope_from(&self, context: &ContextMap) -> EngineResult<Scope<'static>> {
        let mut scope = Scope::new();
        for (key, value) in context {
            let dynamic = rhai::serde::to_dynamic(value)
                .map_err(|e| EngineError::Expression(e.to_string()))?;
            scope.push_dynamic(key.clone(), dynamic);
        }
        Ok(scope)
    }

    fn eval_block(&self, block: &str, scope: &mut Scope<'static>) -> EngineResult<serde_json::Value> {
        let result = self
            .engine
            .eval_with_scope::<Dynamic>(scope, block)
            .map_err(|e| EngineError::Expression(e.to_string()))?;
        rhai::serde::from_dynamic(&result).map_err(|e| EngineError::Expression(e.to_string()))
    }
}

impl Evaluator for RhaiEvaluator {
    fn name(&self) -> &'static str {
        "rhai"
    }

    fn evaluate(&self, text: &str, context: &ContextMap) -> EngineResult<serde_json::Value> {
        let mut scope = self.scope_from(context)?;

        if let Some(inner) = single_block(text) {
            return self.eval_block(inner, &mut scope);
        }

        let mut rendered = String::new();
        let mut cursor = 0;
        for caps in RHAI_BLOCK_RE.captures_iter(text) {
            let whole = caps.get(0).expect("match");
            let inner = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            rendered.push_str(&text[cursor..whole.start()]);
            let value = self.eval_block(inner, &mut scope)?;
            match value {
                serde_json::Value::String(s) => rendered.push_str(&s),
                other => rendered.push_str(&other.to_string()),
            }
            cursor = whole.end();
        }
        rendered.push_str(&text[cursor..]);
        Ok(serde_json::Value::String(rendered))
    }

    fn validate(&self, text: &str) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for caps in RHAI_BLOCK_RE.captures_iter(text) {
            let block = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            let inner = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            if let Err(e) = self.engine.compile(inner) {
                issues.push(ValidationIssue {
                    message: e.to_string(),
                    expression: block.trim().to_string(),
                });
            }
        }
        issues
    }

    fn extract_vars(&self, text: &str) -> Vec<VarRef> {
        let mut vars = Vec::new();
        for caps in RHAI_BLOCK_RE.captures_iter(text) {
            let block = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            let inner = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            for m in IDENT_RE.find_iter(inner) {
                let name = m.as_str();
                if RESERVED_WORDS.contains(&name) || name.starts_with("__") {
                    continue;
                }
                let before = inner[..m.start()].chars().rev().find(|c| !c.is_whitespace());
                if matches!(before, Some('.')) {
                    continue;
                }
                let after = inner[m.end()..].chars().find(|c| !c.is_whitespace());
                if matches!(after, Some('(')) {
                    continue;
                }
                let quotes = inner[..m.start()]
                    .chars()
                    .filter(|c| *c == '"')
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
        vars.sort_by(|a, b| a.name.cmp(&b.name));
        vars.dedup_by(|a, b| a.name == b.name);
        vars
    }

    fn has_expressions(&self, text: &str) -> bool {
        RHAI_BLOCK_RE.is_match(text)
    }
}

/// Return the inner script when the whole string is one `<% .. %>` block.
fn single_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if !trimmed.starts_with("<%") || !trimmed.ends_with("%>") || trimmed.len() < 4 {
        return None;
    }
    let inner = &trimmed[2..trimmed.len() - 2];
    if inner.contains("<%") || inner.contains("%>") {
        return None;
    }
    Some(inner.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(pairs: &[(&str, serde_json::Value)]) -> ContextMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_single_block_preserves_types() {
        let evaluator = RhaiEvaluator::new();
        let context = ctx(&[("count", json!(4))]);
        assert_eq!(
            evaluator.evaluate("<% count * 2 %>", &context).unwrap(),
            json!(8)
        );
        assert_eq!(
            evaluator.evaluate("<% count > 3 %>", &context).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn test_mixed_text_splices() {
        let evaluator = RhaiEvaluator::new();
        let context = ctx(&[("name", json!("alpha"))]);
        assert_eq!(
            evaluator
                .evaluate("branch <% name %> ready", &context)
                .unwrap(),
            json!("branch alpha ready")
        );
    }

    #[test]
    fn test_object_access() {
        let evaluator = RhaiEvaluator::new();
        let context = ctx(&[("data", json!({"count": 9}))]);
        assert_eq!(
            evaluator.evaluate("<% data.count %>", &context).unwrap(),
            json!(9)
        );
    }

    #[test]
    fn test_validate_reports_parse_errors() {
        let evaluator = RhaiEvaluator::new();
        assert!(evaluator.validate("<% 1 + 1 %>").is_empty());

        let issues = evaluator.validate("<% let = %>");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].expression, "<% let = %>");
    }

    #[test]
    fn test_extract_vars() {
        let evaluator = RhaiEvaluator::new();
        let vars = evaluator.extract_vars("<% total + offset %> and <% total %>");
        let names: Vec<_> = vars.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["offset", "total"]);
    }

    #[test]
    fn test_has_expressions() {
        let evaluator = RhaiEvaluator::new();
        assert!(evaluator.has_expressions("<% x %>"));
        assert!(!evaluator.has_expressions("{{ x }}"));
        assert!(!evaluator.has_expressions("plain"));
    }
}

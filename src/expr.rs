//! Edge condition and transform expressions
//!
//! Expressions are either the name of a registered pure function, or a JEXL
//! expression evaluated by `jexl_eval` against a read-only environment:
//!
//! ```json
//! {
//!   "value":   <value routed by the edge>,
//!   "output":  <full output map of the source node>,
//!   "context": <global_context after merging the source output>,
//!   "input":   <execution input_data>
//! }
//! ```
//!
//! Nothing is ever executed as host code. Routed payloads are passed as
//! context objects and never interpolated into expression strings.
//!
//! # Example
//!
//! ```
//! use kbflow::expr::{ExpressionEnv, ExpressionRegistry};
//! use serde_json::{json, Map};
//!
//! let registry = ExpressionRegistry::new();
//! let context = json!({"docs_retrieved": 2}).as_object().cloned().unwrap();
//! let empty = Map::new();
//! let env = ExpressionEnv {
//!     value: &json!(null),
//!     output: &empty,
//!     context: &context,
//!     input: &empty,
//! };
//! assert!(registry.evaluate_bool("context.docs_retrieved > 0", &env).unwrap());
//! ```

use crate::models::MAX_EXPRESSION_LEN;
use jexl_eval::error::EvaluationError;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Errors raised while checking or evaluating an expression
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression is empty")]
    Empty,

    #[error("expression exceeds {0} characters")]
    TooLong(usize),

    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("evaluation failed: {0}")]
    EvalFailed(String),
}

/// Read-only data an expression can reference
#[derive(Debug, Clone, Copy)]
pub struct ExpressionEnv<'a> {
    pub value: &'a Value,
    pub output: &'a Map<String, Value>,
    pub context: &'a Map<String, Value>,
    pub input: &'a Map<String, Value>,
}

impl ExpressionEnv<'_> {
    /// JSON object handed to the evaluator. Integers are widened to floats
    /// so that `count == 0` compares equal against literals.
    pub fn to_value(&self) -> Value {
        normalize_numbers(json!({
            "value": self.value,
            "output": self.output,
            "context": self.context,
            "input": self.input,
        }))
    }
}

type NamedFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Named pure functions, consulted before falling back to JEXL
#[derive(Clone, Default)]
pub struct ExpressionRegistry {
    functions: HashMap<String, NamedFn>,
}

impl std::fmt::Debug for ExpressionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("ExpressionRegistry")
            .field("functions", &names)
            .finish()
    }
}

impl ExpressionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pure function under an exact expression string.
    ///
    /// The function receives the same environment object JEXL expressions see.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Validate an expression without any runtime data.
    ///
    /// Only syntax problems are reported; errors that depend on routed values
    /// surface at evaluation time.
    pub fn check(&self, expression: &str) -> Result<(), ExpressionError> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(ExpressionError::Empty);
        }
        if self.contains(expression) {
            return Ok(());
        }
        if expression.len() > MAX_EXPRESSION_LEN {
            return Err(ExpressionError::TooLong(MAX_EXPRESSION_LEN));
        }

        let empty = Map::new();
        let skeleton = ExpressionEnv {
            value: &Value::Null,
            output: &empty,
            context: &empty,
            input: &empty,
        }
        .to_value();

        match evaluator().eval_in_context(expression, &skeleton) {
            Err(e @ EvaluationError::ParseError(_)) => Err(ExpressionError::Syntax(e.to_string())),
            _ => Ok(()),
        }
    }

    /// Evaluate an expression to a JSON value
    pub fn evaluate(&self, expression: &str, env: &ExpressionEnv<'_>) -> Result<Value, ExpressionError> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(ExpressionError::Empty);
        }

        let context = env.to_value();
        if let Some(function) = self.functions.get(expression) {
            return Ok(function(&context));
        }

        evaluator()
            .eval_in_context(expression, &context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }

    /// Evaluate an expression and coerce the result with [`truthy`]
    pub fn evaluate_bool(&self, expression: &str, env: &ExpressionEnv<'_>) -> Result<bool, ExpressionError> {
        self.evaluate(expression, env).map(|v| truthy(&v))
    }
}

/// JavaScript-like truthiness: `null`, `false`, `0` and `""` are false
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn normalize_numbers(value: Value) -> Value {
    match value {
        Value::Number(n) if !n.is_f64() => n.as_f64().map(Value::from).unwrap_or(Value::Number(n)),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_numbers).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize_numbers(v)))
                .collect(),
        ),
        other => other,
    }
}

fn first_str(args: &[Value]) -> &str {
    args.first().and_then(Value::as_str).unwrap_or("")
}

/// JEXL evaluator with the standard transforms. Built per call because the
/// evaluator holds non-`Send` closures.
fn evaluator() -> jexl_eval::Evaluator<'static> {
    jexl_eval::Evaluator::new()
        .with_transform("lower", |args: &[Value]| Ok(json!(first_str(args).to_lowercase())))
        .with_transform("upper", |args: &[Value]| Ok(json!(first_str(args).to_uppercase())))
        .with_transform("trim", |args: &[Value]| Ok(json!(first_str(args).trim())))
        .with_transform("not", |args: &[Value]| {
            Ok(json!(!truthy(args.first().unwrap_or(&Value::Null))))
        })
        .with_transform("contains", |args: &[Value]| {
            let needle = args.get(1).cloned().unwrap_or(Value::Null);
            let found = match args.first() {
                Some(Value::String(s)) => needle.as_str().map(|n| s.contains(n)).unwrap_or(false),
                Some(Value::Array(items)) => items.contains(&needle),
                Some(Value::Object(map)) => needle.as_str().map(|n| map.contains_key(n)).unwrap_or(false),
                _ => false,
            };
            Ok(json!(found))
        })
        .with_transform("length", |args: &[Value]| {
            let len = match args.first() {
                Some(Value::String(s)) => s.chars().count(),
                Some(Value::Array(a)) => a.len(),
                Some(Value::Object(o)) => o.len(),
                _ => 0,
            };
            Ok(json!(len as f64))
        })
        .with_transform("default", |args: &[Value]| {
            match args.first() {
                Some(v) if !v.is_null() => Ok(v.clone()),
                _ => Ok(args.get(1).cloned().unwrap_or(Value::Null)),
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn eval(registry: &ExpressionRegistry, expr: &str, value: Value, context: Value) -> Value {
        let output = Map::new();
        let input = Map::new();
        let context = map(context);
        let env = ExpressionEnv {
            value: &value,
            output: &output,
            context: &context,
            input: &input,
        };
        registry.evaluate(expr, &env).unwrap()
    }

    #[test]
    fn test_integer_equality_against_literal() {
        let registry = ExpressionRegistry::new();
        let result = eval(&registry, "context.docs_retrieved == 0", Value::Null, json!({"docs_retrieved": 0}));
        assert!(truthy(&result));

        let result = eval(&registry, "context.docs_retrieved > 0", Value::Null, json!({"docs_retrieved": 3}));
        assert!(truthy(&result));
    }

    #[test]
    fn test_not_transform_on_flag() {
        let registry = ExpressionRegistry::new();
        let ctx = json!({"embedding_generated": false});
        assert!(truthy(&eval(&registry, "(context.embedding_generated)|not", Value::Null, ctx.clone())));
        assert!(!truthy(&eval(&registry, "context.embedding_generated", Value::Null, ctx)));
    }

    #[test]
    fn test_transform_on_value() {
        let registry = ExpressionRegistry::new();
        assert_eq!(eval(&registry, "value|upper", json!("hi"), json!({})), json!("HI"));
        assert_eq!(eval(&registry, "value|length", json!([1, 2, 3]), json!({})), json!(3.0));
        assert_eq!(eval(&registry, "value|default('none')", Value::Null, json!({})), json!("none"));
    }

    #[test]
    fn test_named_function_checked_first() {
        let mut registry = ExpressionRegistry::new();
        registry.register("has_docs", |env: &Value| {
            json!(env["context"]["docs"].as_array().map(|d| !d.is_empty()).unwrap_or(false))
        });
        assert!(registry.check("has_docs").is_ok());
        let result = eval(&registry, "has_docs", Value::Null, json!({"docs": ["a"]}));
        assert_eq!(result, json!(true));
    }

    #[test]
    fn test_check_rejects_bad_syntax() {
        let registry = ExpressionRegistry::new();
        assert!(registry.check("context.flag == true").is_ok());
        assert!(matches!(registry.check("value =="), Err(ExpressionError::Syntax(_))));
        assert_eq!(registry.check("   "), Err(ExpressionError::Empty));
        let long = "a".repeat(MAX_EXPRESSION_LEN + 1);
        assert!(matches!(registry.check(&long), Err(ExpressionError::TooLong(_))));
    }

    #[test]
    fn test_truthiness() {
        assert!(!truthy(&Value::Null));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!([])));
    }
}

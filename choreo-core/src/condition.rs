//! Evaluates the small expression language used in branch rules and loop
//! conditions (§4.2 "first rule whose condition evaluates truthy wins",
//! §4.4 step 7). The spec leaves the expression grammar unspecified beyond
//! examples like `output.score >= 80` and `output.retry == true`; this is a
//! deliberately small recursive-descent evaluator over `<path> <op>
//! <literal>`, not a general expression engine — anything richer is a
//! worker's job, not the router's.

use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("malformed condition expression: {0:?}")]
    Malformed(String),
    #[error("unresolvable path: {0:?}")]
    UnresolvablePath(String),
}

/// Evaluate `expr` against `output` (the just-completed node's result) and
/// `context` (`node_id -> output value`, for cross-node references).
pub fn evaluate(
    expr: &str,
    output: &Value,
    context: &HashMap<String, Value>,
) -> Result<bool, ConditionError> {
    let (path, op, literal) = split_expression(expr)?;
    let actual = resolve_path(&path, output, context)?;
    let expected = parse_literal(&literal);
    Ok(compare(op, &actual, &expected))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    Eq,
    Neq,
    Gte,
    Lte,
    Gt,
    Lt,
}

const OPERATORS: &[(&str, Op)] = &[
    ("==", Op::Eq),
    ("!=", Op::Neq),
    (">=", Op::Gte),
    ("<=", Op::Lte),
    (">", Op::Gt),
    ("<", Op::Lt),
];

fn split_expression(expr: &str) -> Result<(String, Op, String), ConditionError> {
    let trimmed = expr.trim();
    for (token, op) in OPERATORS {
        if let Some(idx) = trimmed.find(token) {
            let path = trimmed[..idx].trim().to_string();
            let literal = trimmed[idx + token.len()..].trim().to_string();
            if path.is_empty() || literal.is_empty() {
                return Err(ConditionError::Malformed(expr.to_string()));
            }
            return Ok((path, *op, literal));
        }
    }
    Err(ConditionError::Malformed(expr.to_string()))
}

/// `output.<field...>` reads from the just-completed node's result;
/// `$nodes.<id>.<field...>` (the same sigil used in task-config
/// substitution, §3) reads from another node's recorded output.
fn resolve_path(
    path: &str,
    output: &Value,
    context: &HashMap<String, Value>,
) -> Result<Value, ConditionError> {
    if let Some(rest) = path.strip_prefix("output.") {
        return walk(output, rest).ok_or_else(|| ConditionError::UnresolvablePath(path.to_string()));
    }
    if path == "output" {
        return Ok(output.clone());
    }
    if let Some(rest) = path.strip_prefix("$nodes.") {
        let mut parts = rest.splitn(2, '.');
        let node_id = parts
            .next()
            .ok_or_else(|| ConditionError::UnresolvablePath(path.to_string()))?;
        let root = context
            .get(node_id)
            .ok_or_else(|| ConditionError::UnresolvablePath(path.to_string()))?;
        return match parts.next() {
            Some(field) => {
                walk(root, field).ok_or_else(|| ConditionError::UnresolvablePath(path.to_string()))
            }
            None => Ok(root.clone()),
        };
    }
    Err(ConditionError::UnresolvablePath(path.to_string()))
}

fn walk(root: &Value, dotted_field: &str) -> Option<Value> {
    let mut cursor = root;
    for segment in dotted_field.split('.') {
        cursor = cursor.get(segment)?;
    }
    Some(cursor.clone())
}

fn parse_literal(raw: &str) -> Value {
    let raw = raw.trim();
    if let Some(inner) = raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Value::String(inner.to_string());
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        other => other
            .parse::<f64>()
            .map(|n| serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null))
            .unwrap_or_else(|_| Value::String(other.to_string())),
    }
}

fn compare(op: Op, actual: &Value, expected: &Value) -> bool {
    match op {
        Op::Eq => actual == expected,
        Op::Neq => actual != expected,
        Op::Gt | Op::Gte | Op::Lt | Op::Lte => match (actual.as_f64(), expected.as_f64()) {
            (Some(a), Some(b)) => match op {
                Op::Gt => a > b,
                Op::Gte => a >= b,
                Op::Lt => a < b,
                Op::Lte => a <= b,
                _ => unreachable!(),
            },
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_comparison_on_output_field() {
        let output = json!({"score": 90});
        let context = HashMap::new();
        assert!(evaluate("output.score >= 80", &output, &context).unwrap());
        assert!(!evaluate("output.score >= 80", &json!({"score": 40}), &context).unwrap());
    }

    #[test]
    fn boolean_equality_on_output_field() {
        let output = json!({"retry": true});
        let context = HashMap::new();
        assert!(evaluate("output.retry == true", &output, &context).unwrap());
    }

    #[test]
    fn unresolvable_path_is_an_error() {
        let output = json!({"score": 90});
        let context = HashMap::new();
        assert!(evaluate("output.missing >= 1", &output, &context).is_err());
    }
}

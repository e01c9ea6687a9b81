//! Worker dispatch helpers (§4.4 step 8): partitioning routed nodes into
//! absorbers vs. workers, resolving a node's config against run context, and
//! publishing task tokens onto per-type streams.

use crate::compiler::ir::{Ir, IrNode, NodeConfig};
use crate::events::{TaskToken, TaskTokenMetadata, UiEvent};
use crate::ids::{NodeId, RunId};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;

/// Splits a set of next-node ids into absorbers (pure control-flow, handled
/// inline by the coordinator) and workers (dispatched to a task stream).
pub fn partition_routes<'a>(ir: &'a Ir, next: &[NodeId]) -> (Vec<&'a IrNode>, Vec<&'a IrNode>) {
    let mut absorbers = Vec::new();
    let mut workers = Vec::new();
    for id in next {
        if let Some(node) = ir.node(id) {
            if node.is_absorber() {
                absorbers.push(node);
            } else {
                workers.push(node);
            }
        }
    }
    (absorbers, workers)
}

/// Everything published to `wf.tasks.<type>` the coordinator needs to know
/// about, excluding wire-level bookkeeping (id, timestamps) — those are
/// assigned at the point of publish.
pub trait TaskPublisher: Send + Sync {
    fn publish_task(&self, stream: &str, token: TaskToken) -> Result<()>;
    fn publish_ui_event(&self, username: &str, event: UiEvent) -> Result<()>;
}

/// Build the wire `TaskToken` for dispatching `to_node`, resolving any
/// `$nodes.<id>.<field>` references in its config against `context` (§3
/// "Variable substitution at dispatch time").
pub fn build_task_token(
    run_id: RunId,
    from_node: &NodeId,
    to_node: &IrNode,
    context: &HashMap<String, serde_json::Value>,
    metadata: TaskTokenMetadata,
) -> TaskToken {
    let config = match &to_node.config {
        NodeConfig::Inline(Some(value)) => Some(substitute_variables(value, context)),
        NodeConfig::Inline(None) => None,
        // A config_ref is resolved by the caller before this point (it needs
        // CAS access this module does not have); an unresolved ref here means
        // the caller chose to proceed without it (§7 "Config resolution
        // failure ... otherwise proceed with best-effort").
        NodeConfig::Ref(_) => None,
    };
    let now = Utc::now();
    TaskToken {
        id: uuid::Uuid::now_v7().to_string(),
        run_id,
        from_node: from_node.clone(),
        to_node: to_node.id.clone(),
        payload_ref: None,
        config,
        metadata: Some(metadata),
        created_at: now,
        sent_at: now,
    }
}

/// Walk a config value replacing every string of the shape
/// `$nodes.<node_id>.<field...>` with the value found at that path in
/// `context[node_id]`. Unresolvable references are left as the literal
/// string (§7: best-effort, never a hard failure for a node that doesn't
/// strictly require its config).
pub fn substitute_variables(
    value: &serde_json::Value,
    context: &HashMap<String, serde_json::Value>,
) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => resolve_string(s, context),
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items.iter().map(|v| substitute_variables(v, context)).collect(),
        ),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_variables(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(
    s: &str,
    context: &HashMap<String, serde_json::Value>,
) -> serde_json::Value {
    let Some(rest) = s.strip_prefix("$nodes.") else {
        return serde_json::Value::String(s.to_string());
    };
    let mut parts = rest.split('.');
    let Some(node_id) = parts.next() else {
        return serde_json::Value::String(s.to_string());
    };
    let Some(root) = context.get(node_id) else {
        return serde_json::Value::String(s.to_string());
    };
    let mut cursor = root;
    for field in parts {
        match cursor.get(field) {
            Some(next) => cursor = next,
            None => return serde_json::Value::String(s.to_string()),
        }
    }
    cursor.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_nested_field_reference() {
        let mut context = HashMap::new();
        context.insert("a".to_string(), json!({"output": {"score": 91}}));

        let config = json!({"threshold": "$nodes.a.output.score"});
        let resolved = substitute_variables(&config, &context);
        assert_eq!(resolved["threshold"], json!(91));
    }

    #[test]
    fn leaves_unresolvable_reference_as_literal() {
        let context = HashMap::new();
        let config = json!("$nodes.missing.output");
        let resolved = substitute_variables(&config, &context);
        assert_eq!(resolved, json!("$nodes.missing.output"));
    }
}

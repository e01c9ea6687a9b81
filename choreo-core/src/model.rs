//! The workflow document — the compiler's input wire shape (§6).

use crate::compiler::ir::RetryPolicy;
use crate::ids::NodeId;
use serde::{Deserialize, Serialize};

/// `function`, `http`, `agent`, `hitl`, `transform`, `aggregate`, `filter`
/// pass straight through as routing keys. `conditional` and `loop` are
/// control-flow directives the compiler internalizes (§4.2) rather than
/// dispatch targets; everything else is an opaque, extensible routing key —
/// an agent patch may introduce a type no worker recognizes (§4.4 step 8,
/// §9 "skipped-node handling"), and the compiler must not reject it.
pub const NODE_TYPE_CONDITIONAL: &str = "conditional";
pub const NODE_TYPE_LOOP: &str = "loop";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocumentNode {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocumentEdge {
    pub from: NodeId,
    pub to: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkflowDocument {
    pub nodes: Vec<DocumentNode>,
    pub edges: Vec<DocumentEdge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Config payload for a `loop` document node, parsed out of `config`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoopNodeConfig {
    pub max_iterations: u32,
    pub loop_back_to: NodeId,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub break_path: Option<NodeId>,
    #[serde(default)]
    pub timeout_path: Option<NodeId>,
}

impl WorkflowDocument {
    /// Deterministic JSON: sort nodes and edges before serializing, so two
    /// documents that differ only in authoring order hash identically.
    /// Used by the Patch Materializer's `plan_hash` (§4.1 snapshot cache).
    pub fn deterministic_json(&self) -> serde_json::Result<String> {
        let mut doc = self.clone();
        doc.nodes.sort_by(|a, b| a.id.cmp(&b.id));
        doc.edges
            .sort_by(|a, b| a.from.cmp(&b.from).then_with(|| a.to.cmp(&b.to)));
        serde_json::to_string(&doc)
    }
}

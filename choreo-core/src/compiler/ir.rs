//! The compiled Intermediate Representation.
//!
//! Cyclic graphs arise naturally here (loops). Rather than model the IR as an
//! object graph of `Rc<RefCell<_>>` nodes, it is an id-keyed map — edges are
//! ids, not pointers — exactly as a structure meant to be serialized whole,
//! replaced whole, and re-fetched on every routing decision should be.

use crate::ids::{CasId, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
}

/// One rule of a synthesized branch block: first truthy condition wins.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BranchRule {
    pub condition: String,
    pub next_nodes: Vec<NodeId>,
}

/// Synthesized from a `conditional` document node's outgoing edges.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BranchConfig {
    pub rules: Vec<BranchRule>,
    pub default: Vec<NodeId>,
}

impl BranchConfig {
    pub fn has_emission_paths(&self) -> bool {
        self.rules.iter().any(|r| !r.next_nodes.is_empty()) || !self.default.is_empty()
    }
}

/// Synthesized from a `loop` document node's config.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoopConfig {
    pub max_iterations: u32,
    pub loop_back_to: NodeId,
    pub condition: Option<String>,
    pub break_path: Option<NodeId>,
    pub timeout_path: Option<NodeId>,
}

/// Where a node's configuration lives: inlined in the IR, or large enough
/// that it was written to CAS and only a reference remains.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NodeConfig {
    Inline(Option<serde_json::Value>),
    Ref(CasId),
}

/// One compiled node. `node_type` is the routing key workers dispatch on;
/// for internalized `conditional`/`loop` document nodes this is the literal
/// string `"task"` (§4.2 — they become executable task nodes).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IrNode {
    pub id: NodeId,
    pub node_type: String,
    pub dependencies: Vec<NodeId>,
    pub dependents: Vec<NodeId>,
    pub wait_for_all: bool,
    pub is_terminal: bool,
    pub branch: Option<BranchConfig>,
    #[serde(rename = "loop")]
    pub loop_: Option<LoopConfig>,
    pub config: NodeConfig,
    pub timeout_ms: Option<u64>,
    pub retry: Option<RetryPolicy>,
}

impl IrNode {
    pub fn is_absorber(&self) -> bool {
        self.branch.is_some() || self.loop_.is_some()
    }

    /// All ids this node can route to under any control-flow outcome —
    /// the routing graph the cycle checker walks, not merely `dependents`.
    pub fn routing_targets(&self) -> Vec<&NodeId> {
        let mut out: Vec<&NodeId> = self.dependents.iter().collect();
        if let Some(branch) = &self.branch {
            out.extend(branch.rules.iter().flat_map(|r| r.next_nodes.iter()));
            out.extend(branch.default.iter());
        }
        if let Some(loop_) = &self.loop_ {
            out.push(&loop_.loop_back_to);
            if let Some(b) = &loop_.break_path {
                out.push(b);
            }
            if let Some(t) = &loop_.timeout_path {
                out.push(t);
            }
        }
        out
    }
}

/// The compiled form of a workflow document, keyed by `run_id` once loaded
/// into the hot store. Invariants enforced by `verify` (compiler::verifier):
/// every node id unique, every edge endpoint resolves, at least one entry
/// node and one terminal node, cycles legal only into loop nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ir {
    pub nodes: BTreeMap<NodeId, IrNode>,
    pub metadata: Option<serde_json::Value>,
}

impl Ir {
    pub fn entry_nodes(&self) -> impl Iterator<Item = &IrNode> {
        self.nodes.values().filter(|n| n.dependencies.is_empty())
    }

    pub fn terminal_nodes(&self) -> impl Iterator<Item = &IrNode> {
        self.nodes.values().filter(|n| n.is_terminal)
    }

    pub fn node(&self, id: &NodeId) -> Option<&IrNode> {
        self.nodes.get(id)
    }
}

//! Document → IR compilation (§4.2).

use super::ir::{BranchConfig, BranchRule, Ir, IrNode, LoopConfig, NodeConfig};
use super::verifier::verify;
use crate::error::CompileError;
use crate::ids::NodeId;
use crate::model::{DocumentEdge, DocumentNode, LoopNodeConfig, WorkflowDocument};
use crate::model::{NODE_TYPE_CONDITIONAL, NODE_TYPE_LOOP};
use std::collections::BTreeMap;

/// Compile a workflow document into an executable IR, or reject it.
///
/// Node-type mapping, branch/loop synthesis, and dependency wiring happen
/// here; structural invariants (entry/terminal existence, dangling branch
/// or loop targets, illegal cycles) are checked by `verify` once the graph
/// is fully built, mirroring a two-pass compiler: lower, then verify.
pub fn compile(doc: &WorkflowDocument) -> Result<Ir, CompileError> {
    let by_id: BTreeMap<&NodeId, &DocumentNode> = doc.nodes.iter().map(|n| (&n.id, n)).collect();

    for edge in &doc.edges {
        if !by_id.contains_key(&edge.from) {
            return Err(CompileError::MissingEdgeEndpoint {
                from: edge.from.to_string(),
                to: edge.to.to_string(),
            });
        }
        if !by_id.contains_key(&edge.to) {
            return Err(CompileError::MissingEdgeEndpoint {
                from: edge.from.to_string(),
                to: edge.to.to_string(),
            });
        }
    }

    let mut nodes: BTreeMap<NodeId, IrNode> = BTreeMap::new();
    for doc_node in &doc.nodes {
        nodes.insert(doc_node.id.clone(), lower_node(doc_node)?);
    }

    for doc_node in &doc.nodes {
        if doc_node.node_type == NODE_TYPE_CONDITIONAL {
            let branch = synthesize_branch(&doc_node.id, &doc.edges);
            nodes.get_mut(&doc_node.id).unwrap().branch = Some(branch);
        }
    }

    wire_dependencies(&mut nodes, &doc.edges);
    compute_terminal_flags(&mut nodes);

    let ir = Ir {
        nodes,
        metadata: doc.metadata.clone(),
    };

    let errors = verify(&ir);
    if errors.is_empty() {
        Ok(ir)
    } else {
        Err(CompileError::Invalid(errors))
    }
}

fn lower_node(doc_node: &DocumentNode) -> Result<IrNode, CompileError> {
    let node_type = match doc_node.node_type.as_str() {
        NODE_TYPE_CONDITIONAL | NODE_TYPE_LOOP => "task".to_string(),
        other => other.to_string(),
    };

    let loop_ = if doc_node.node_type == NODE_TYPE_LOOP {
        let cfg: LoopNodeConfig = serde_json::from_value(
            doc_node
                .config
                .clone()
                .unwrap_or(serde_json::Value::Null),
        )?;
        Some(LoopConfig {
            max_iterations: cfg.max_iterations,
            loop_back_to: cfg.loop_back_to,
            condition: cfg.condition,
            break_path: cfg.break_path,
            timeout_path: cfg.timeout_path,
        })
    } else {
        None
    };

    Ok(IrNode {
        id: doc_node.id.clone(),
        node_type,
        dependencies: Vec::new(),
        dependents: Vec::new(),
        wait_for_all: false,
        is_terminal: false,
        branch: None,
        loop_,
        config: NodeConfig::Inline(doc_node.config.clone()),
        timeout_ms: doc_node.timeout_ms,
        retry: doc_node.retry.clone(),
    })
}

/// Group a conditional node's outgoing edges into rules (grouped by
/// condition text, insertion order preserved) plus a default bucket of
/// unconditional edges.
fn synthesize_branch(node_id: &NodeId, edges: &[DocumentEdge]) -> BranchConfig {
    let mut rule_order: Vec<String> = Vec::new();
    let mut rule_targets: BTreeMap<String, Vec<NodeId>> = BTreeMap::new();
    let mut default = Vec::new();

    for edge in edges.iter().filter(|e| &e.from == node_id) {
        match &edge.condition {
            Some(cond) if !cond.is_empty() => {
                if !rule_targets.contains_key(cond) {
                    rule_order.push(cond.clone());
                }
                rule_targets.entry(cond.clone()).or_default().push(edge.to.clone());
            }
            _ => default.push(edge.to.clone()),
        }
    }

    let rules = rule_order
        .into_iter()
        .map(|cond| BranchRule {
            next_nodes: rule_targets.remove(&cond).unwrap_or_default(),
            condition: cond,
        })
        .collect();

    BranchConfig { rules, default }
}

/// Per §4.2: unconditional edges populate both `to.dependencies` and
/// `from.dependents`; conditional edges populate only `to.dependencies` —
/// routing for the `from` side is governed by its `branch` rules instead.
fn wire_dependencies(nodes: &mut BTreeMap<NodeId, IrNode>, edges: &[DocumentEdge]) {
    for edge in edges {
        if let Some(to_node) = nodes.get_mut(&edge.to) {
            to_node.dependencies.push(edge.from.clone());
        }
        let unconditional = edge.condition.as_deref().map(str::is_empty).unwrap_or(true);
        if unconditional {
            if let Some(from_node) = nodes.get_mut(&edge.from) {
                from_node.dependents.push(edge.to.clone());
            }
        }
    }
    for node in nodes.values_mut() {
        node.wait_for_all = node.dependencies.len() > 1;
    }
}

fn compute_terminal_flags(nodes: &mut BTreeMap<NodeId, IrNode>) {
    for node in nodes.values_mut() {
        let branch_has_targets = node
            .branch
            .as_ref()
            .map(|b| b.has_emission_paths())
            .unwrap_or(false);
        node.is_terminal = node.dependents.is_empty() && !branch_has_targets && node.loop_.is_none();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DocumentNode;

    fn node(id: &str, ty: &str) -> DocumentNode {
        DocumentNode {
            id: id.into(),
            node_type: ty.to_string(),
            config: None,
            timeout_ms: None,
            retry: None,
        }
    }

    fn edge(from: &str, to: &str, condition: Option<&str>) -> DocumentEdge {
        DocumentEdge {
            from: from.into(),
            to: to.into(),
            condition: condition.map(str::to_string),
        }
    }

    /// S1: linear A -> B -> C.
    #[test]
    fn linear_chain_compiles() {
        let doc = WorkflowDocument {
            nodes: vec![node("a", "http"), node("b", "http"), node("c", "http")],
            edges: vec![edge("a", "b", None), edge("b", "c", None)],
            metadata: None,
        };
        let ir = compile(&doc).unwrap();
        assert!(ir.node(&"a".into()).unwrap().dependencies.is_empty());
        assert_eq!(ir.node(&"b".into()).unwrap().dependencies, vec!["a".into()]);
        assert!(ir.node(&"c".into()).unwrap().is_terminal);
        assert!(!ir.node(&"a".into()).unwrap().is_terminal);
    }

    /// S2: A fans out to B, C, D.
    #[test]
    fn fan_out_sets_dependents_and_join() {
        let doc = WorkflowDocument {
            nodes: vec![
                node("a", "http"),
                node("b", "http"),
                node("c", "http"),
                node("d", "http"),
            ],
            edges: vec![
                edge("a", "b", None),
                edge("a", "c", None),
                edge("a", "d", None),
            ],
            metadata: None,
        };
        let ir = compile(&doc).unwrap();
        let a = ir.node(&"a".into()).unwrap();
        assert_eq!(a.dependents.len(), 3);
        assert!(!a.wait_for_all);
    }

    #[test]
    fn join_node_waits_for_all_dependencies() {
        let doc = WorkflowDocument {
            nodes: vec![node("a", "http"), node("b", "http"), node("join", "http")],
            edges: vec![edge("a", "join", None), edge("b", "join", None)],
            metadata: None,
        };
        let ir = compile(&doc).unwrap();
        assert!(ir.node(&"join".into()).unwrap().wait_for_all);
    }

    /// S3: branch with condition rule + default.
    #[test]
    fn conditional_node_synthesizes_branch() {
        let doc = WorkflowDocument {
            nodes: vec![
                node("a", NODE_TYPE_CONDITIONAL),
                node("hi", "http"),
                node("lo", "http"),
            ],
            edges: vec![
                edge("a", "hi", Some("output.score >= 80")),
                edge("a", "lo", None),
            ],
            metadata: None,
        };
        let ir = compile(&doc).unwrap();
        let a = ir.node(&"a".into()).unwrap();
        assert_eq!(a.node_type, "task");
        let branch = a.branch.as_ref().unwrap();
        assert_eq!(branch.rules.len(), 1);
        assert_eq!(branch.rules[0].next_nodes, vec!["hi".into()]);
        assert_eq!(branch.default, vec!["lo".into()]);
        // conditional edges never populate static dependents
        assert!(a.dependents.is_empty());
    }

    /// S4: loop node.
    #[test]
    fn loop_node_synthesizes_loop_config() {
        let mut loop_node = node("a", NODE_TYPE_LOOP);
        loop_node.config = Some(serde_json::json!({
            "max_iterations": 3,
            "loop_back_to": "a",
            "condition": "output.retry == true",
            "break_path": "done",
        }));
        let doc = WorkflowDocument {
            nodes: vec![loop_node, node("done", "http")],
            edges: vec![],
            metadata: None,
        };
        let ir = compile(&doc).unwrap();
        let a = ir.node(&"a".into()).unwrap();
        let loop_cfg = a.loop_.as_ref().unwrap();
        assert_eq!(loop_cfg.max_iterations, 3);
        assert_eq!(loop_cfg.loop_back_to, "a".into());
        assert!(!a.is_terminal, "loop nodes always have an emission path");
    }

    #[test]
    fn missing_edge_endpoint_rejected() {
        let doc = WorkflowDocument {
            nodes: vec![node("a", "http")],
            edges: vec![edge("a", "ghost", None)],
            metadata: None,
        };
        assert!(matches!(
            compile(&doc),
            Err(CompileError::MissingEdgeEndpoint { .. })
        ));
    }

    #[test]
    fn no_terminal_node_rejected() {
        let doc = WorkflowDocument {
            nodes: vec![node("a", "http"), node("b", "http")],
            edges: vec![edge("a", "b", None), edge("b", "a", None)],
            metadata: None,
        };
        assert!(matches!(compile(&doc), Err(CompileError::Invalid(_))));
    }
}

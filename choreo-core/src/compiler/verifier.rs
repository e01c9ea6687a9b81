//! Structural verification of a compiled IR (§4.2 Validation, §8 property 8).

use super::ir::Ir;
use crate::ids::NodeId;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone)]
pub struct VerifyError {
    pub rule: &'static str,
    pub message: String,
    pub node_id: Option<NodeId>,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(id) => write!(f, "[{}] {}: {}", self.rule, id, self.message),
            None => write!(f, "[{}] {}", self.rule, self.message),
        }
    }
}

/// Returns the list of structural violations; an empty list means the IR is
/// valid. Checks, in order: entry/terminal existence, dangling loop and
/// branch targets, illegal cycles.
pub fn verify(ir: &Ir) -> Vec<VerifyError> {
    let mut errors = Vec::new();

    if ir.entry_nodes().next().is_none() {
        errors.push(VerifyError {
            rule: "E-ENTRY",
            message: "no entry node (every node has at least one dependency)".to_string(),
            node_id: None,
        });
    }

    if ir.terminal_nodes().next().is_none() {
        errors.push(VerifyError {
            rule: "E-TERMINAL",
            message: "no terminal node — workflow can never complete".to_string(),
            node_id: None,
        });
    }

    for node in ir.nodes.values() {
        if let Some(loop_) = &node.loop_ {
            if !ir.nodes.contains_key(&loop_.loop_back_to) {
                errors.push(VerifyError {
                    rule: "E-LOOP-TARGET",
                    message: format!("loop_back_to '{}' does not resolve", loop_.loop_back_to),
                    node_id: Some(node.id.clone()),
                });
            }
            if let Some(b) = &loop_.break_path {
                if !ir.nodes.contains_key(b) {
                    errors.push(VerifyError {
                        rule: "E-LOOP-TARGET",
                        message: format!("break_path '{}' does not resolve", b),
                        node_id: Some(node.id.clone()),
                    });
                }
            }
            if let Some(t) = &loop_.timeout_path {
                if !ir.nodes.contains_key(t) {
                    errors.push(VerifyError {
                        rule: "E-LOOP-TARGET",
                        message: format!("timeout_path '{}' does not resolve", t),
                        node_id: Some(node.id.clone()),
                    });
                }
            }
        }

        if let Some(branch) = &node.branch {
            for rule in &branch.rules {
                for target in &rule.next_nodes {
                    if !ir.nodes.contains_key(target) {
                        errors.push(VerifyError {
                            rule: "E-BRANCH-TARGET",
                            message: format!("rule target '{}' does not resolve", target),
                            node_id: Some(node.id.clone()),
                        });
                    }
                }
            }
            for target in &branch.default {
                if !ir.nodes.contains_key(target) {
                    errors.push(VerifyError {
                        rule: "E-BRANCH-TARGET",
                        message: format!("default target '{}' does not resolve", target),
                        node_id: Some(node.id.clone()),
                    });
                }
            }
        }
    }

    errors.extend(detect_illegal_cycles(ir));
    errors
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// DFS with an explicit recursion-stack ("gray set"): an edge into a gray
/// node is a back-edge. Per §9 Design Notes, back-edges are legal only when
/// their target is a loop node — everything else is a cycle no amount of
/// token routing can terminate.
fn detect_illegal_cycles(ir: &Ir) -> Vec<VerifyError> {
    let mut errors = Vec::new();
    let mut color: HashMap<&NodeId, Color> = ir.nodes.keys().map(|id| (id, Color::White)).collect();

    for start in ir.nodes.keys() {
        if color[start] == Color::White {
            let mut stack = vec![(start, ir.node(start).unwrap().routing_targets().into_iter())];
            color.insert(start, Color::Gray);

            while let Some((node_id, targets)) = stack.last_mut() {
                let node_id = *node_id;
                match targets.next() {
                    Some(target) => {
                        let Some(target_node) = ir.node(target) else {
                            continue; // already reported as E-LOOP-TARGET / E-BRANCH-TARGET
                        };
                        match color.get(target).copied().unwrap_or(Color::White) {
                            Color::White => {
                                color.insert(target, Color::Gray);
                                stack.push((target, target_node.routing_targets().into_iter()));
                            }
                            Color::Gray => {
                                if target_node.loop_.is_none() {
                                    errors.push(VerifyError {
                                        rule: "E-CYCLE",
                                        message: format!(
                                            "back-edge into '{}', which is not a loop node",
                                            target
                                        ),
                                        node_id: Some(node_id.clone()),
                                    });
                                }
                            }
                            Color::Black => {}
                        }
                    }
                    None => {
                        color.insert(node_id, Color::Black);
                        stack.pop();
                    }
                }
            }
        }
    }

    errors
}

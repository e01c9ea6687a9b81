//! Wire types for the coordinator's external interfaces (§6): the completion
//! signal consumed from workers, the task tokens dispatched to them, and the
//! UI event channel observers subscribe to.

use crate::ids::{NodeId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
    Failed,
}

/// `{version, job_id, run_id, node_id, status, result_data?|result_ref?, metadata?}`.
/// Unknown fields are tolerated for forward-compatibility.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletionSignal {
    pub version: String,
    pub job_id: String,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub status: CompletionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// The set of node types the coordinator knows a task stream for. Anything
/// else is an "unsupported worker type" (§4.4 step 8) — the degradation
/// path is to synthesize a skip, never to publish to a stream nobody reads.
pub const RECOGNIZED_TASK_TYPES: &[&str] = &[
    "agent",
    "http",
    "hitl",
    "function",
    "transform",
    "aggregate",
    "filter",
    "classifier",
    "search",
];

pub fn task_stream_for(node_type: &str) -> Option<String> {
    RECOGNIZED_TASK_TYPES
        .contains(&node_type)
        .then(|| format!("wf.tasks.{node_type}"))
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskTokenMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_tag: Option<String>,
}

/// Published to `wf.tasks.<type>`, one stream per recognized node type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskToken {
    pub id: String,
    pub run_id: RunId,
    pub from_node: NodeId,
    pub to_node: NodeId,
    pub payload_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TaskTokenMetadata>,
    pub created_at: DateTime<Utc>,
    pub sent_at: DateTime<Utc>,
}

/// `run:{username}` pub/sub events (§6).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    NodeCompleted {
        run_id: RunId,
        node_id: NodeId,
        counter: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_ref: Option<String>,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        run_id: RunId,
        node_id: NodeId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    WorkflowCompleted {
        run_id: RunId,
        timestamp: DateTime<Utc>,
    },
    WorkflowFailed {
        run_id: RunId,
        node_id: Option<NodeId>,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    ApprovalRequired {
        run_id: RunId,
        node_id: NodeId,
        timestamp: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognized_type_has_no_stream() {
        assert_eq!(task_stream_for("http"), Some("wf.tasks.http".to_string()));
        assert_eq!(task_stream_for("quantum_forecast"), None);
    }
}

//! Typed error taxonomy (§7: the core must distinguish these kinds so callers
//! can retry, reject, or degrade rather than treat every failure alike).

use crate::compiler::verifier::VerifyError;
use crate::ids::{ArtifactId, NodeId};
use thiserror::Error;

/// Compiler failures — reject at submit time or patch-reload time.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("malformed node config: {0}")]
    InvalidConfig(#[from] serde_json::Error),
    #[error("edge references unknown node: {from} -> {to}")]
    MissingEdgeEndpoint { from: String, to: String },
    #[error("workflow failed verification ({} error(s)): {}", .0.len(), render(.0))]
    Invalid(Vec<VerifyError>),
}

fn render(errors: &[VerifyError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Counter-protocol failures. The protocol itself is idempotent by
/// construction; what remains is the possibility that the backing store is
/// unreachable — a transient failure the caller retries.
#[derive(Debug, Error)]
pub enum CounterError {
    #[error("hot store unavailable: {0}")]
    Store(#[from] anyhow::Error),
}

/// Patch materialization failures (§4.5). Every variant aborts the reload;
/// the caller keeps routing on the previously-loaded IR.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("failed to apply json-patch operations: {0}")]
    Apply(#[from] json_patch::PatchError),
    #[error("patched document failed to compile: {0}")]
    Compile(#[from] CompileError),
    #[error("structural safety violated: {agent_count} agent node(s) exceeds limit {limit}")]
    SafetyViolation { agent_count: usize, limit: usize },
    #[error("artifact or hot store unavailable: {0}")]
    Store(#[from] anyhow::Error),
}

/// Artifact Store failures.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("tag {name:?} conflict: expected version {expected}, found {actual}")]
    TagConflict {
        name: String,
        expected: u64,
        actual: u64,
    },
    #[error("artifact not found: {0}")]
    ArtifactNotFound(ArtifactId),
    #[error("blob not found: {0}")]
    BlobNotFound(crate::ids::CasId),
    #[error("tag not found: {0}")]
    TagNotFound(String),
    #[error("storage backend error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Coordinator-level failures, scoped to a single completion-signal task
/// (§7: "the coordinator never panics on a single signal").
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("hot store unavailable: {0}")]
    HotStore(anyhow::Error),
    #[error("artifact store unavailable: {0}")]
    ArtifactStore(anyhow::Error),
    #[error("no IR found for run {0}")]
    MissingIr(crate::ids::RunId),
    #[error("node {0} not found in IR for run {1}")]
    MissingNode(NodeId, crate::ids::RunId),
    #[error("failed to dispatch task token: {0}")]
    Dispatch(anyhow::Error),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Patch(#[from] PatchError),
}

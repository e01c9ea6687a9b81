//! Content-addressed artifact store (C1, §3 §4.1): immutable CAS blobs,
//! typed artifacts built on top of them, mutable optimistic-lock tags, an
//! append-only tag-move audit log, and the denormalized patch-chain index
//! that makes chain resolution O(1) instead of recursive.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::error::ArtifactError;
use crate::ids::{ArtifactId, CasId, RunId};
use crate::model::WorkflowDocument;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    DagVersion,
    PatchSet,
    RunSnapshot,
    RunManifest,
}

/// Hot-query columns extracted out of the CAS blob at write time (§3
/// "Extracted columns for hot queries").
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<ArtifactId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edges_count: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub kind: ArtifactKind,
    pub cas_id: CasId,
    pub metadata: ArtifactMetadata,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagKind {
    DagVersion,
    PatchSet,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub kind: TagKind,
    pub target_id: ArtifactId,
    pub version: u64,
}

/// One row of the append-only `tag_move` audit log (§3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TagMove {
    pub name: String,
    pub from_id: Option<ArtifactId>,
    pub to_id: ArtifactId,
    pub version: u64,
    pub moved_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseKind {
    /// `base_ref` names a `dag_version` tag.
    Tag,
    /// `base_ref` is a literal artifact id.
    ArtifactId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub base_kind: BaseKind,
    pub base_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_patch_id: Option<ArtifactId>,
    pub tags_snapshot: serde_json::Value,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_by: Option<String>,
    pub status: RunStatus,
}

/// `(head_id, seq, member_id)` — see `chain_members` doc comment below.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatchChainMember {
    pub head_id: ArtifactId,
    pub seq: u32,
    pub member_id: ArtifactId,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    // ── CAS ──
    async fn put_blob(&self, bytes: Vec<u8>, media_type: &str) -> Result<CasId>;
    async fn get_blob(&self, cas_id: &CasId) -> Result<Vec<u8>>;

    // ── Artifacts ──
    async fn put_artifact(
        &self,
        kind: ArtifactKind,
        cas_id: CasId,
        metadata: ArtifactMetadata,
    ) -> Result<ArtifactId>;
    async fn get_artifact(&self, artifact_id: ArtifactId) -> Result<Artifact>;
    /// Unique-index lookup used by the Patch Materializer's snapshot cache
    /// (§4.1 "Snapshot cache").
    async fn find_snapshot_by_plan_hash(&self, plan_hash: &str) -> Result<Option<Artifact>>;

    // ── Tags ──
    async fn set_tag(
        &self,
        name: &str,
        kind: TagKind,
        target_id: ArtifactId,
        expected_version: u64,
    ) -> Result<u64, ArtifactError>;
    async fn resolve_tag(&self, name: &str) -> Result<ArtifactId>;
    async fn tag_history(&self, name: &str) -> Result<Vec<TagMove>>;

    // ── Patch chains ──
    /// Extends the chain headed at `head_id` with `new_member`, inheriting
    /// every prior member's membership under a fresh `seq` (§4.1 "Patch
    /// chain semantics") so a future `chain_members` call is one index read.
    async fn extend_chain(&self, head_id: ArtifactId, new_member: ArtifactId) -> Result<()>;
    async fn chain_members(&self, head_id: ArtifactId) -> Result<Vec<ArtifactId>>;

    // ── Runs ──
    async fn create_run(&self, run: &Run) -> Result<()>;
    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>>;
    async fn update_run_status(&self, run_id: RunId, status: RunStatus) -> Result<()>;

    /// The run's *private* patch chain — applied only to this run, distinct
    /// from chain members reachable via a `dag_version` tag (§4.5 step 2,
    /// §9 open question on the run/chain asymmetry).
    async fn get_run_patches_with_operations(
        &self,
        run_id: RunId,
    ) -> Result<Vec<json_patch::PatchOperation>>;

    /// Fetch and deserialize the pristine base document a run started from
    /// (§4.5 step 4 — "applying from the live IR would double-apply").
    async fn get_base_document(&self, run: &Run) -> Result<WorkflowDocument>;
}

/// Apply an ordered list of JSON-patch operations to a workflow document,
/// returning the patched document (§4.5 step 5, "materialize"). Pure over
/// its inputs: two calls with identical arguments produce identical bytes
/// (§4.5 "Idempotence & concurrency").
pub fn materialize_document(
    base: &WorkflowDocument,
    ops: &[json_patch::PatchOperation],
) -> Result<WorkflowDocument> {
    let mut value = serde_json::to_value(base)?;
    let patch = json_patch::Patch(ops.to_vec());
    json_patch::patch(&mut value, &patch)?;
    Ok(serde_json::from_value(value)?)
}

/// `plan_hash = hash(base_version_hash, ordered patch ids)` (§4.1).
pub fn compute_plan_hash(base_version_hash: &str, patch_ids: &[ArtifactId]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(base_version_hash.as_bytes());
    for id in patch_ids {
        hasher.update(b":");
        hasher.update(id.to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}

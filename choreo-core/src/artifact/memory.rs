//! In-memory `ArtifactStore`, modeled after the teacher's `MemoryStore`:
//! one `RwLock<Inner>` guarding every table.

use super::{
    Artifact, ArtifactKind, ArtifactMetadata, ArtifactStore, BaseKind, PatchChainMember, Run,
    RunStatus, Tag, TagKind, TagMove,
};
use crate::error::ArtifactError;
use crate::ids::{ArtifactId, CasId, RunId};
use crate::model::WorkflowDocument;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

struct Inner {
    blobs: HashMap<CasId, (Vec<u8>, String)>,
    artifacts: HashMap<ArtifactId, Artifact>,
    plan_hash_index: HashMap<String, ArtifactId>,
    tags: HashMap<String, Tag>,
    tag_moves: HashMap<String, Vec<TagMove>>,
    chain_members: HashMap<ArtifactId, Vec<PatchChainMember>>,
    runs: HashMap<RunId, Run>,
    run_patches: HashMap<RunId, Vec<json_patch::PatchOperation>>,
}

pub struct MemoryArtifactStore {
    inner: RwLock<Inner>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                blobs: HashMap::new(),
                artifacts: HashMap::new(),
                plan_hash_index: HashMap::new(),
                tags: HashMap::new(),
                tag_moves: HashMap::new(),
                chain_members: HashMap::new(),
                runs: HashMap::new(),
                run_patches: HashMap::new(),
            }),
        }
    }

    /// Test/seeding hook: registers a run's private patch ops without going
    /// through a patch-submission API this core does not specify.
    pub async fn seed_run_patches(&self, run_id: RunId, ops: Vec<json_patch::PatchOperation>) {
        self.inner.write().await.run_patches.insert(run_id, ops);
    }
}

impl Default for MemoryArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put_blob(&self, bytes: Vec<u8>, media_type: &str) -> Result<CasId> {
        let id = CasId::of(&bytes);
        let mut w = self.inner.write().await;
        w.blobs.entry(id.clone()).or_insert((bytes, media_type.to_string()));
        Ok(id)
    }

    async fn get_blob(&self, cas_id: &CasId) -> Result<Vec<u8>> {
        let r = self.inner.read().await;
        r.blobs
            .get(cas_id)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| ArtifactError::BlobNotFound(cas_id.clone()).into())
    }

    async fn put_artifact(
        &self,
        kind: ArtifactKind,
        cas_id: CasId,
        metadata: ArtifactMetadata,
    ) -> Result<ArtifactId> {
        let id = ArtifactId::new();
        let artifact = Artifact {
            id,
            kind,
            cas_id,
            metadata: metadata.clone(),
            created_at: Utc::now(),
        };
        let mut w = self.inner.write().await;
        if let Some(plan_hash) = &metadata.plan_hash {
            if let Some(existing) = w.plan_hash_index.get(plan_hash) {
                return Err(anyhow!(
                    "plan_hash {plan_hash:?} already indexed by artifact {existing}"
                ));
            }
            w.plan_hash_index.insert(plan_hash.clone(), id);
        }
        w.artifacts.insert(id, artifact);
        Ok(id)
    }

    async fn get_artifact(&self, artifact_id: ArtifactId) -> Result<Artifact> {
        let r = self.inner.read().await;
        r.artifacts
            .get(&artifact_id)
            .cloned()
            .ok_or_else(|| ArtifactError::ArtifactNotFound(artifact_id).into())
    }

    async fn find_snapshot_by_plan_hash(&self, plan_hash: &str) -> Result<Option<Artifact>> {
        let r = self.inner.read().await;
        Ok(r.plan_hash_index
            .get(plan_hash)
            .and_then(|id| r.artifacts.get(id))
            .cloned())
    }

    async fn set_tag(
        &self,
        name: &str,
        kind: TagKind,
        target_id: ArtifactId,
        expected_version: u64,
    ) -> Result<u64, ArtifactError> {
        let mut w = self.inner.write().await;
        let new_version = match w.tags.get(name) {
            Some(existing) if existing.version != expected_version => {
                return Err(ArtifactError::TagConflict {
                    name: name.to_string(),
                    expected: expected_version,
                    actual: existing.version,
                });
            }
            Some(existing) => existing.version + 1,
            None if expected_version == 0 => 1,
            None => {
                return Err(ArtifactError::TagConflict {
                    name: name.to_string(),
                    expected: expected_version,
                    actual: 0,
                });
            }
        };
        let from_id = w.tags.get(name).map(|t| t.target_id);
        w.tags.insert(
            name.to_string(),
            Tag {
                name: name.to_string(),
                kind,
                target_id,
                version: new_version,
            },
        );
        w.tag_moves.entry(name.to_string()).or_default().push(TagMove {
            name: name.to_string(),
            from_id,
            to_id: target_id,
            version: new_version,
            moved_at: Utc::now(),
        });
        Ok(new_version)
    }

    async fn resolve_tag(&self, name: &str) -> Result<ArtifactId> {
        let r = self.inner.read().await;
        r.tags
            .get(name)
            .map(|t| t.target_id)
            .ok_or_else(|| ArtifactError::TagNotFound(name.to_string()).into())
    }

    async fn tag_history(&self, name: &str) -> Result<Vec<TagMove>> {
        let r = self.inner.read().await;
        Ok(r.tag_moves.get(name).cloned().unwrap_or_default())
    }

    async fn extend_chain(&self, head_id: ArtifactId, new_member: ArtifactId) -> Result<()> {
        let mut w = self.inner.write().await;
        let predecessor_members: Vec<ArtifactId> = w
            .chain_members
            .get(&head_id)
            .map(|members| members.iter().map(|m| m.member_id).collect())
            .unwrap_or_default();
        let next_seq = predecessor_members.len() as u32;
        let mut members: Vec<PatchChainMember> = predecessor_members
            .into_iter()
            .enumerate()
            .map(|(seq, member_id)| PatchChainMember {
                head_id: new_member,
                seq: seq as u32,
                member_id,
            })
            .collect();
        members.push(PatchChainMember {
            head_id: new_member,
            seq: next_seq,
            member_id: new_member,
        });
        w.chain_members.insert(new_member, members);
        Ok(())
    }

    async fn chain_members(&self, head_id: ArtifactId) -> Result<Vec<ArtifactId>> {
        let r = self.inner.read().await;
        Ok(r.chain_members
            .get(&head_id)
            .map(|members| {
                let mut sorted = members.clone();
                sorted.sort_by_key(|m| m.seq);
                sorted.into_iter().map(|m| m.member_id).collect()
            })
            .unwrap_or_else(|| vec![head_id]))
    }

    async fn create_run(&self, run: &Run) -> Result<()> {
        let mut w = self.inner.write().await;
        w.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>> {
        let r = self.inner.read().await;
        Ok(r.runs.get(&run_id).cloned())
    }

    async fn update_run_status(&self, run_id: RunId, status: RunStatus) -> Result<()> {
        let mut w = self.inner.write().await;
        let run = w
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| anyhow!("run not found: {run_id}"))?;
        run.status = status;
        Ok(())
    }

    async fn get_run_patches_with_operations(
        &self,
        run_id: RunId,
    ) -> Result<Vec<json_patch::PatchOperation>> {
        let r = self.inner.read().await;
        Ok(r.run_patches.get(&run_id).cloned().unwrap_or_default())
    }

    async fn get_base_document(&self, run: &Run) -> Result<WorkflowDocument> {
        let artifact_id = match run.base_kind {
            BaseKind::ArtifactId => run
                .base_ref
                .parse()
                .map(ArtifactId)
                .context("base_ref is not a valid artifact id")?,
            BaseKind::Tag => self.resolve_tag(&run.base_ref).await?,
        };
        let artifact = self.get_artifact(artifact_id).await?;
        let bytes = self.get_blob(&artifact.cas_id).await?;
        serde_json::from_slice(&bytes).context("base artifact is not a valid workflow document")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blob_writes_are_content_idempotent() {
        let store = MemoryArtifactStore::new();
        let a = store.put_blob(b"hello".to_vec(), "application/json").await.unwrap();
        let b = store.put_blob(b"hello".to_vec(), "application/json").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn set_tag_detects_version_conflict() {
        let store = MemoryArtifactStore::new();
        let target = ArtifactId::new();
        let v1 = store.set_tag("main", TagKind::DagVersion, target, 0).await.unwrap();
        assert_eq!(v1, 1);

        let conflict = store.set_tag("main", TagKind::DagVersion, target, 0).await;
        assert!(conflict.is_err());

        let v2 = store.set_tag("main", TagKind::DagVersion, target, 1).await.unwrap();
        assert_eq!(v2, 2);
    }

    #[tokio::test]
    async fn chain_extension_inherits_predecessor_members() {
        let store = MemoryArtifactStore::new();
        let p1 = ArtifactId::new();
        let p2 = ArtifactId::new();
        let p3 = ArtifactId::new();

        store.extend_chain(p1, p1).await.unwrap();
        store.extend_chain(p1, p2).await.unwrap();
        store.extend_chain(p2, p3).await.unwrap();

        let members = store.chain_members(p3).await.unwrap();
        assert_eq!(members, vec![p1, p2, p3]);
    }
}

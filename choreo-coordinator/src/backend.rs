//! Runtime store selection (§6, §9 ambient config section). `Coordinator`,
//! `PatchMaterializer` and friends are generic over `HotStore`/`ArtifactStore`
//! and need a `Sized` concrete type, so the in-memory/production choice the
//! teacher makes with `Arc<dyn ProcessStore>` is made here with a small
//! enum-dispatch wrapper instead of a trait object.

use anyhow::Result;
use async_trait::async_trait;
use choreo_core::artifact::memory::MemoryArtifactStore;
use choreo_core::artifact::{
    Artifact, ArtifactKind, ArtifactMetadata, ArtifactStore, Run, RunStatus, TagKind, TagMove,
};
use choreo_core::compiler::ir::Ir;
use choreo_core::events::UiEvent;
use choreo_core::hotstore::memory::MemoryHotStore;
use choreo_core::hotstore::{CounterOutcome, HotStore, JoinArrival, LoopIncrement};
use choreo_core::ids::{ArtifactId, CasId, NodeId, RunId};
use choreo_core::model::WorkflowDocument;
use std::collections::HashMap;

#[cfg(feature = "postgres")]
use choreo_core::artifact::postgres::PostgresArtifactStore;
#[cfg(feature = "redis")]
use choreo_core::hotstore::redis::RedisHotStore;

pub enum AnyArtifactStore {
    Memory(MemoryArtifactStore),
    #[cfg(feature = "postgres")]
    Postgres(PostgresArtifactStore),
}

#[async_trait]
impl ArtifactStore for AnyArtifactStore {
    async fn put_blob(&self, bytes: Vec<u8>, media_type: &str) -> Result<CasId> {
        match self {
            Self::Memory(s) => s.put_blob(bytes, media_type).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(s) => s.put_blob(bytes, media_type).await,
        }
    }

    async fn get_blob(&self, cas_id: &CasId) -> Result<Vec<u8>> {
        match self {
            Self::Memory(s) => s.get_blob(cas_id).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(s) => s.get_blob(cas_id).await,
        }
    }

    async fn put_artifact(
        &self,
        kind: ArtifactKind,
        cas_id: CasId,
        metadata: ArtifactMetadata,
    ) -> Result<ArtifactId> {
        match self {
            Self::Memory(s) => s.put_artifact(kind, cas_id, metadata).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(s) => s.put_artifact(kind, cas_id, metadata).await,
        }
    }

    async fn get_artifact(&self, artifact_id: ArtifactId) -> Result<Artifact> {
        match self {
            Self::Memory(s) => s.get_artifact(artifact_id).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(s) => s.get_artifact(artifact_id).await,
        }
    }

    async fn find_snapshot_by_plan_hash(&self, plan_hash: &str) -> Result<Option<Artifact>> {
        match self {
            Self::Memory(s) => s.find_snapshot_by_plan_hash(plan_hash).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(s) => s.find_snapshot_by_plan_hash(plan_hash).await,
        }
    }

    async fn set_tag(
        &self,
        name: &str,
        kind: TagKind,
        target_id: ArtifactId,
        expected_version: u64,
    ) -> Result<u64, choreo_core::error::ArtifactError> {
        match self {
            Self::Memory(s) => s.set_tag(name, kind, target_id, expected_version).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(s) => s.set_tag(name, kind, target_id, expected_version).await,
        }
    }

    async fn resolve_tag(&self, name: &str) -> Result<ArtifactId> {
        match self {
            Self::Memory(s) => s.resolve_tag(name).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(s) => s.resolve_tag(name).await,
        }
    }

    async fn tag_history(&self, name: &str) -> Result<Vec<TagMove>> {
        match self {
            Self::Memory(s) => s.tag_history(name).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(s) => s.tag_history(name).await,
        }
    }

    async fn extend_chain(&self, head_id: ArtifactId, new_member: ArtifactId) -> Result<()> {
        match self {
            Self::Memory(s) => s.extend_chain(head_id, new_member).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(s) => s.extend_chain(head_id, new_member).await,
        }
    }

    async fn chain_members(&self, head_id: ArtifactId) -> Result<Vec<ArtifactId>> {
        match self {
            Self::Memory(s) => s.chain_members(head_id).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(s) => s.chain_members(head_id).await,
        }
    }

    async fn create_run(&self, run: &Run) -> Result<()> {
        match self {
            Self::Memory(s) => s.create_run(run).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(s) => s.create_run(run).await,
        }
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>> {
        match self {
            Self::Memory(s) => s.get_run(run_id).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(s) => s.get_run(run_id).await,
        }
    }

    async fn update_run_status(&self, run_id: RunId, status: RunStatus) -> Result<()> {
        match self {
            Self::Memory(s) => s.update_run_status(run_id, status).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(s) => s.update_run_status(run_id, status).await,
        }
    }

    async fn get_run_patches_with_operations(
        &self,
        run_id: RunId,
    ) -> Result<Vec<json_patch::PatchOperation>> {
        match self {
            Self::Memory(s) => s.get_run_patches_with_operations(run_id).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(s) => s.get_run_patches_with_operations(run_id).await,
        }
    }

    async fn get_base_document(&self, run: &Run) -> Result<WorkflowDocument> {
        match self {
            Self::Memory(s) => s.get_base_document(run).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(s) => s.get_base_document(run).await,
        }
    }
}

pub enum AnyHotStore {
    Memory(MemoryHotStore),
    #[cfg(feature = "redis")]
    Redis(RedisHotStore),
}

#[async_trait]
impl HotStore for AnyHotStore {
    async fn init_run(&self, run_id: RunId, initial_counter: i64) -> Result<()> {
        match self {
            Self::Memory(s) => s.init_run(run_id, initial_counter).await,
            #[cfg(feature = "redis")]
            Self::Redis(s) => s.init_run(run_id, initial_counter).await,
        }
    }

    async fn load_ir(&self, run_id: RunId) -> Result<Option<Ir>> {
        match self {
            Self::Memory(s) => s.load_ir(run_id).await,
            #[cfg(feature = "redis")]
            Self::Redis(s) => s.load_ir(run_id).await,
        }
    }

    async fn store_ir(&self, run_id: RunId, ir: &Ir) -> Result<()> {
        match self {
            Self::Memory(s) => s.store_ir(run_id, ir).await,
            #[cfg(feature = "redis")]
            Self::Redis(s) => s.store_ir(run_id, ir).await,
        }
    }

    async fn get_context(&self, run_id: RunId, key: &str) -> Result<Option<String>> {
        match self {
            Self::Memory(s) => s.get_context(run_id, key).await,
            #[cfg(feature = "redis")]
            Self::Redis(s) => s.get_context(run_id, key).await,
        }
    }

    async fn set_context(&self, run_id: RunId, key: &str, cas_ref: &str) -> Result<()> {
        match self {
            Self::Memory(s) => s.set_context(run_id, key, cas_ref).await,
            #[cfg(feature = "redis")]
            Self::Redis(s) => s.set_context(run_id, key, cas_ref).await,
        }
    }

    async fn all_context(&self, run_id: RunId) -> Result<HashMap<String, String>> {
        match self {
            Self::Memory(s) => s.all_context(run_id).await,
            #[cfg(feature = "redis")]
            Self::Redis(s) => s.all_context(run_id).await,
        }
    }

    async fn consume(&self, run_id: RunId, node_id: &NodeId) -> Result<CounterOutcome> {
        match self {
            Self::Memory(s) => s.consume(run_id, node_id).await,
            #[cfg(feature = "redis")]
            Self::Redis(s) => s.consume(run_id, node_id).await,
        }
    }

    async fn emit(
        &self,
        run_id: RunId,
        from_node: &NodeId,
        emit_id: &str,
        count: i64,
    ) -> Result<CounterOutcome> {
        match self {
            Self::Memory(s) => s.emit(run_id, from_node, emit_id, count).await,
            #[cfg(feature = "redis")]
            Self::Redis(s) => s.emit(run_id, from_node, emit_id, count).await,
        }
    }

    async fn counter_value(&self, run_id: RunId) -> Result<i64> {
        match self {
            Self::Memory(s) => s.counter_value(run_id).await,
            #[cfg(feature = "redis")]
            Self::Redis(s) => s.counter_value(run_id).await,
        }
    }

    async fn loop_increment(
        &self,
        run_id: RunId,
        node_id: &NodeId,
        max_iterations: u32,
    ) -> Result<LoopIncrement> {
        match self {
            Self::Memory(s) => s.loop_increment(run_id, node_id, max_iterations).await,
            #[cfg(feature = "redis")]
            Self::Redis(s) => s.loop_increment(run_id, node_id, max_iterations).await,
        }
    }

    async fn loop_clear(&self, run_id: RunId, node_id: &NodeId) -> Result<()> {
        match self {
            Self::Memory(s) => s.loop_clear(run_id, node_id).await,
            #[cfg(feature = "redis")]
            Self::Redis(s) => s.loop_clear(run_id, node_id).await,
        }
    }

    async fn join_arrive(
        &self,
        run_id: RunId,
        node_id: &NodeId,
        from_node: &NodeId,
        expected: usize,
    ) -> Result<JoinArrival> {
        match self {
            Self::Memory(s) => s.join_arrive(run_id, node_id, from_node, expected).await,
            #[cfg(feature = "redis")]
            Self::Redis(s) => s.join_arrive(run_id, node_id, from_node, expected).await,
        }
    }

    async fn join_reset(&self, run_id: RunId, node_id: &NodeId) -> Result<()> {
        match self {
            Self::Memory(s) => s.join_reset(run_id, node_id).await,
            #[cfg(feature = "redis")]
            Self::Redis(s) => s.join_reset(run_id, node_id).await,
        }
    }

    async fn add_pending_approval(&self, run_id: RunId, approval_id: &str) -> Result<()> {
        match self {
            Self::Memory(s) => s.add_pending_approval(run_id, approval_id).await,
            #[cfg(feature = "redis")]
            Self::Redis(s) => s.add_pending_approval(run_id, approval_id).await,
        }
    }

    async fn remove_pending_approval(&self, run_id: RunId, approval_id: &str) -> Result<()> {
        match self {
            Self::Memory(s) => s.remove_pending_approval(run_id, approval_id).await,
            #[cfg(feature = "redis")]
            Self::Redis(s) => s.remove_pending_approval(run_id, approval_id).await,
        }
    }

    async fn pending_approvals(&self, run_id: RunId) -> Result<Vec<String>> {
        match self {
            Self::Memory(s) => s.pending_approvals(run_id).await,
            #[cfg(feature = "redis")]
            Self::Redis(s) => s.pending_approvals(run_id).await,
        }
    }

    async fn delete_run_state(&self, run_id: RunId) -> Result<()> {
        match self {
            Self::Memory(s) => s.delete_run_state(run_id).await,
            #[cfg(feature = "redis")]
            Self::Redis(s) => s.delete_run_state(run_id).await,
        }
    }

    async fn publish_completion_event(&self, run_id: RunId) -> Result<()> {
        match self {
            Self::Memory(s) => s.publish_completion_event(run_id).await,
            #[cfg(feature = "redis")]
            Self::Redis(s) => s.publish_completion_event(run_id).await,
        }
    }

    async fn next_completion_event(&self, timeout_ms: u64) -> Result<Option<RunId>> {
        match self {
            Self::Memory(s) => s.next_completion_event(timeout_ms).await,
            #[cfg(feature = "redis")]
            Self::Redis(s) => s.next_completion_event(timeout_ms).await,
        }
    }

    async fn publish_ui_event(&self, username: &str, event: &UiEvent) -> Result<()> {
        match self {
            Self::Memory(s) => s.publish_ui_event(username, event).await,
            #[cfg(feature = "redis")]
            Self::Redis(s) => s.publish_ui_event(username, event).await,
        }
    }
}

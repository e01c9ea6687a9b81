//! The Patch Materializer (C5, §4.5): detects a run's patch chain, rebuilds
//! the workflow document from its pristine base, recompiles, enforces the
//! structural safety check, and atomically swaps the live IR.

use crate::artifact::ArtifactStore;
use crate::compiler::ir::Ir;
use crate::compiler::lowering::compile;
use crate::error::PatchError;
use crate::hotstore::HotStore;
use crate::ids::RunId;
use crate::model::WorkflowDocument;
use std::sync::Arc;
use tracing::{info, warn};

/// Node type gated by the structural safety check (§4.5 step 7). The spec
/// fixes `agent` as the type that can runaway-spawn via self-modifying
/// patches; other types are uncapped by this check.
const GATED_NODE_TYPE: &str = "agent";

pub struct PatchMaterializer<A: ArtifactStore, H: HotStore> {
    artifact: Arc<A>,
    hot: Arc<H>,
    /// Operator-configured cap on gated-type node count (§4.5 step 7,
    /// default 5).
    max_agent_nodes: usize,
}

impl<A: ArtifactStore, H: HotStore> PatchMaterializer<A, H> {
    pub fn new(artifact: Arc<A>, hot: Arc<H>, max_agent_nodes: usize) -> Self {
        Self {
            artifact,
            hot,
            max_agent_nodes,
        }
    }

    /// Returns `Ok(true)` if a reload happened, `Ok(false)` if there were no
    /// patches to apply. Any failure aborts the reload and leaves the old
    /// IR authoritative (§4.5 "Failure semantics") — callers should log and
    /// continue, never propagate this as a reason to stop routing.
    pub async fn reload_if_patched(&self, run_id: RunId, current_ir: &Ir) -> Result<bool, PatchError> {
        let ops = self
            .artifact
            .get_run_patches_with_operations(run_id)
            .await
            .map_err(PatchError::Store)?;
        if ops.is_empty() {
            return Ok(false);
        }

        let run = self
            .artifact
            .get_run(run_id)
            .await
            .map_err(PatchError::Store)?
            .ok_or_else(|| PatchError::Store(anyhow::anyhow!("run {run_id} not found")))?;

        // §9: reset to the pristine base, never apply on top of the live
        // IR — the live IR may already reflect a prior materialization of
        // these same ops, and reapplying would double-apply them.
        let base = self.artifact.get_base_document(&run).await.map_err(PatchError::Store)?;
        let document = apply_patch(&base, &ops)?;

        let mut new_ir = compile(&document)?;

        let agent_count = new_ir
            .nodes
            .values()
            .filter(|n| n.node_type == GATED_NODE_TYPE)
            .count();
        if agent_count > self.max_agent_nodes {
            return Err(PatchError::SafetyViolation {
                agent_count,
                limit: self.max_agent_nodes,
            });
        }

        // Preserve runtime metadata the coordinator stamped at submit time
        // (§4.5 step 8) — recompiling from the raw document would otherwise
        // drop it, since the document's own `metadata` is author-supplied.
        new_ir.metadata = current_ir.metadata.clone().or(new_ir.metadata);

        self.hot.store_ir(run_id, &new_ir).await.map_err(PatchError::Store)?;
        info!(%run_id, agent_count, "patch reload applied");
        Ok(true)
    }

    /// Convenience wrapper matching §4.4 step 3's "continue even if it
    /// fails" contract: swallow the error after logging, since the caller's
    /// next `load_ir` will simply observe whichever IR is current.
    pub async fn reload_if_patched_best_effort(&self, run_id: RunId, current_ir: &Ir) {
        if let Err(err) = self.reload_if_patched(run_id, current_ir).await {
            warn!(%run_id, error = %err, "patch reload aborted, continuing on prior IR");
        }
    }
}

/// Apply ops to the pristine base, distinguishing a malformed-patch failure
/// (§7 "Condition evaluation error" neighbor: here, a JSON-patch apply
/// error) from a generic store failure, per §7's typed-error-kinds mandate.
fn apply_patch(
    base: &WorkflowDocument,
    ops: &[json_patch::PatchOperation],
) -> Result<WorkflowDocument, PatchError> {
    let mut value = serde_json::to_value(base).map_err(|e| PatchError::Store(e.into()))?;
    let patch = json_patch::Patch(ops.to_vec());
    json_patch::patch(&mut value, &patch).map_err(PatchError::Apply)?;
    serde_json::from_value(value).map_err(|e| PatchError::Store(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::memory::MemoryArtifactStore;
    use crate::artifact::{ArtifactKind, ArtifactMetadata, BaseKind, Run, RunStatus};
    use crate::hotstore::memory::MemoryHotStore;
    use crate::model::{DocumentEdge, DocumentNode, WorkflowDocument};
    use chrono::Utc;

    fn node(id: &str, ty: &str) -> DocumentNode {
        DocumentNode {
            id: id.into(),
            node_type: ty.to_string(),
            config: None,
            timeout_ms: None,
            retry: None,
        }
    }

    fn edge(from: &str, to: &str) -> DocumentEdge {
        DocumentEdge {
            from: from.into(),
            to: to.into(),
            condition: None,
        }
    }

    async fn seed_run(
        artifact: &MemoryArtifactStore,
        base_doc: &WorkflowDocument,
        ops: Vec<json_patch::PatchOperation>,
    ) -> RunId {
        let bytes = serde_json::to_vec(base_doc).unwrap();
        let cas_id = artifact.put_blob(bytes, "application/json").await.unwrap();
        let artifact_id = artifact
            .put_artifact(ArtifactKind::DagVersion, cas_id, ArtifactMetadata::default())
            .await
            .unwrap();

        let run_id = RunId::new();
        artifact
            .create_run(&Run {
                run_id,
                base_kind: BaseKind::ArtifactId,
                base_ref: artifact_id.0.to_string(),
                run_patch_id: None,
                tags_snapshot: serde_json::json!({}),
                submitted_at: Utc::now(),
                submitted_by: None,
                status: RunStatus::Running,
            })
            .await
            .unwrap();
        artifact.seed_run_patches(run_id, ops).await;
        run_id
    }

    /// S5: A->B; after B completes, a patch adds C and edge B->C.
    #[tokio::test]
    async fn reload_applies_pending_patch() {
        let artifact = Arc::new(MemoryArtifactStore::new());
        let hot = Arc::new(MemoryHotStore::new());
        let materializer = PatchMaterializer::new(artifact.clone(), hot.clone(), 5);

        let base = WorkflowDocument {
            nodes: vec![node("a", "http"), node("b", "http")],
            edges: vec![edge("a", "b")],
            metadata: None,
        };
        let current_ir = compile(&base).unwrap();

        let ops: Vec<json_patch::PatchOperation> = serde_json::from_value(serde_json::json!([
            {"op": "add", "path": "/nodes/-", "value": {"id": "c", "type": "http"}},
            {"op": "add", "path": "/edges/-", "value": {"from": "b", "to": "c"}}
        ]))
        .unwrap();
        let run_id = seed_run(&artifact, &base, ops).await;

        let reloaded = materializer.reload_if_patched(run_id, &current_ir).await.unwrap();
        assert!(reloaded);

        let new_ir = hot.load_ir(run_id).await.unwrap().unwrap();
        assert_eq!(new_ir.nodes.len(), 3);
        assert!(new_ir.node(&"c".into()).unwrap().is_terminal);
    }

    /// S6: a patch that would raise agent-node count above the limit is rejected.
    #[tokio::test]
    async fn reload_rejects_when_agent_limit_exceeded() {
        let artifact = Arc::new(MemoryArtifactStore::new());
        let hot = Arc::new(MemoryHotStore::new());
        let materializer = PatchMaterializer::new(artifact.clone(), hot.clone(), 1);

        let base = WorkflowDocument {
            nodes: vec![node("a", "agent"), node("b", "http")],
            edges: vec![edge("a", "b")],
            metadata: None,
        };
        let current_ir = compile(&base).unwrap();
        hot.store_ir(RunId::new(), &current_ir).await.unwrap(); // unrelated warm-up

        let ops: Vec<json_patch::PatchOperation> = serde_json::from_value(serde_json::json!([
            {"op": "add", "path": "/nodes/-", "value": {"id": "c", "type": "agent"}},
            {"op": "add", "path": "/edges/-", "value": {"from": "b", "to": "c"}}
        ]))
        .unwrap();
        let run_id = seed_run(&artifact, &base, ops).await;
        hot.store_ir(run_id, &current_ir).await.unwrap();

        let err = materializer.reload_if_patched(run_id, &current_ir).await.unwrap_err();
        assert!(matches!(err, PatchError::SafetyViolation { .. }));

        // Old IR remains authoritative.
        let still_old = hot.load_ir(run_id).await.unwrap().unwrap();
        assert_eq!(still_old.nodes.len(), 2);
    }
}

//! PostgreSQL-backed `ArtifactStore`. Mirrors the teacher's
//! `PostgresProcessStore`: one `PgPool`, plain `sqlx::query`, JSONB for
//! semi-structured columns, explicit conversions at the boundary.

use super::{
    Artifact, ArtifactKind, ArtifactMetadata, ArtifactStore, BaseKind, Run, RunStatus, TagKind,
    TagMove,
};
use crate::error::ArtifactError;
use crate::ids::{ArtifactId, CasId, RunId};
use crate::model::WorkflowDocument;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub struct PostgresArtifactStore {
    pool: PgPool,
}

impl PostgresArtifactStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations (§4.1 schema). Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run artifact-store migrations")?;
        Ok(())
    }
}

fn kind_str(kind: ArtifactKind) -> &'static str {
    match kind {
        ArtifactKind::DagVersion => "dag_version",
        ArtifactKind::PatchSet => "patch_set",
        ArtifactKind::RunSnapshot => "run_snapshot",
        ArtifactKind::RunManifest => "run_manifest",
    }
}

fn kind_from_str(s: &str) -> Result<ArtifactKind> {
    Ok(match s {
        "dag_version" => ArtifactKind::DagVersion,
        "patch_set" => ArtifactKind::PatchSet,
        "run_snapshot" => ArtifactKind::RunSnapshot,
        "run_manifest" => ArtifactKind::RunManifest,
        other => return Err(anyhow!("unknown artifact_kind {other:?}")),
    })
}

fn tag_kind_str(kind: TagKind) -> &'static str {
    match kind {
        TagKind::DagVersion => "dag_version",
        TagKind::PatchSet => "patch_set",
    }
}

fn tag_kind_from_str(s: &str) -> Result<TagKind> {
    Ok(match s {
        "dag_version" => TagKind::DagVersion,
        "patch_set" => TagKind::PatchSet,
        other => return Err(anyhow!("unknown tag_kind {other:?}")),
    })
}

fn run_status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Queued => "queued",
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

fn run_status_from_str(s: &str) -> Result<RunStatus> {
    Ok(match s {
        "queued" => RunStatus::Queued,
        "running" => RunStatus::Running,
        "completed" => RunStatus::Completed,
        "failed" => RunStatus::Failed,
        "cancelled" => RunStatus::Cancelled,
        other => return Err(anyhow!("unknown run_status {other:?}")),
    })
}

fn base_kind_str(kind: BaseKind) -> &'static str {
    match kind {
        BaseKind::Tag => "tag",
        BaseKind::ArtifactId => "artifact_id",
    }
}

fn base_kind_from_str(s: &str) -> Result<BaseKind> {
    Ok(match s {
        "tag" => BaseKind::Tag,
        "artifact_id" => BaseKind::ArtifactId,
        other => return Err(anyhow!("unknown base_kind {other:?}")),
    })
}

#[async_trait]
impl ArtifactStore for PostgresArtifactStore {
    async fn put_blob(&self, bytes: Vec<u8>, media_type: &str) -> Result<CasId> {
        let cas_id = CasId::of(&bytes);
        sqlx::query(
            "INSERT INTO cas_blobs (cas_id, media_type, size, bytes) VALUES ($1, $2, $3, $4)
             ON CONFLICT (cas_id) DO NOTHING",
        )
        .bind(cas_id.to_string())
        .bind(media_type)
        .bind(bytes.len() as i64)
        .bind(&bytes)
        .execute(&self.pool)
        .await
        .context("failed to insert CAS blob")?;
        Ok(cas_id)
    }

    async fn get_blob(&self, cas_id: &CasId) -> Result<Vec<u8>> {
        let row = sqlx::query("SELECT bytes FROM cas_blobs WHERE cas_id = $1")
            .bind(cas_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch CAS blob")?
            .ok_or_else(|| ArtifactError::BlobNotFound(cas_id.clone()))?;
        Ok(row.get("bytes"))
    }

    async fn put_artifact(
        &self,
        kind: ArtifactKind,
        cas_id: CasId,
        metadata: ArtifactMetadata,
    ) -> Result<ArtifactId> {
        let id = ArtifactId::new();
        sqlx::query(
            "INSERT INTO artifacts
                (artifact_id, kind, cas_id, plan_hash, version_hash, base_version, depth,
                 nodes_count, edges_count)
             VALUES ($1, $2::artifact_kind, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(id.0)
        .bind(kind_str(kind))
        .bind(cas_id.to_string())
        .bind(&metadata.plan_hash)
        .bind(&metadata.version_hash)
        .bind(metadata.base_version.map(|a| a.0))
        .bind(metadata.depth.map(|d| d as i32))
        .bind(metadata.nodes_count.map(|n| n as i32))
        .bind(metadata.edges_count.map(|n| n as i32))
        .execute(&self.pool)
        .await
        .context("failed to insert artifact (duplicate plan_hash on a snapshot?)")?;
        Ok(id)
    }

    async fn get_artifact(&self, artifact_id: ArtifactId) -> Result<Artifact> {
        let row = sqlx::query(
            "SELECT artifact_id, kind::text AS kind, cas_id, plan_hash, version_hash,
                    base_version, depth, nodes_count, edges_count, created_at
             FROM artifacts WHERE artifact_id = $1",
        )
        .bind(artifact_id.0)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch artifact")?
        .ok_or(ArtifactError::ArtifactNotFound(artifact_id))?;
        row_to_artifact(row)
    }

    async fn find_snapshot_by_plan_hash(&self, plan_hash: &str) -> Result<Option<Artifact>> {
        let row = sqlx::query(
            "SELECT artifact_id, kind::text AS kind, cas_id, plan_hash, version_hash,
                    base_version, depth, nodes_count, edges_count, created_at
             FROM artifacts WHERE kind = 'run_snapshot' AND plan_hash = $1",
        )
        .bind(plan_hash)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up snapshot by plan_hash")?;
        row.map(row_to_artifact).transpose()
    }

    async fn set_tag(
        &self,
        name: &str,
        kind: TagKind,
        target_id: ArtifactId,
        expected_version: u64,
    ) -> Result<u64, ArtifactError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ArtifactError::Storage(e.into()))?;

        let current: Option<(Uuid, i64)> =
            sqlx::query_as("SELECT target_id, version FROM tags WHERE name = $1 FOR UPDATE")
                .bind(name)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| ArtifactError::Storage(e.into()))?;

        let (actual_version, from_id) = match &current {
            Some((target, version)) => (*version as u64, Some(*target)),
            None => (0, None),
        };
        if actual_version != expected_version {
            return Err(ArtifactError::TagConflict {
                name: name.to_string(),
                expected: expected_version,
                actual: actual_version,
            });
        }

        let new_version = expected_version + 1;
        sqlx::query(
            "INSERT INTO tags (name, kind, target_id, version) VALUES ($1, $2::tag_kind, $3, $4)
             ON CONFLICT (name) DO UPDATE SET target_id = $3, version = $4",
        )
        .bind(name)
        .bind(tag_kind_str(kind))
        .bind(target_id.0)
        .bind(new_version as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| ArtifactError::Storage(e.into()))?;

        sqlx::query(
            "INSERT INTO tag_moves (name, from_id, to_id, version) VALUES ($1, $2, $3, $4)",
        )
        .bind(name)
        .bind(from_id)
        .bind(target_id.0)
        .bind(new_version as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| ArtifactError::Storage(e.into()))?;

        tx.commit().await.map_err(|e| ArtifactError::Storage(e.into()))?;
        Ok(new_version)
    }

    async fn resolve_tag(&self, name: &str) -> Result<ArtifactId> {
        let row = sqlx::query("SELECT target_id FROM tags WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("failed to resolve tag")?
            .ok_or_else(|| ArtifactError::TagNotFound(name.to_string()))?;
        Ok(ArtifactId(row.get("target_id")))
    }

    async fn tag_history(&self, name: &str) -> Result<Vec<TagMove>> {
        let rows = sqlx::query(
            "SELECT name, from_id, to_id, version, moved_at FROM tag_moves
             WHERE name = $1 ORDER BY version ASC",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch tag history")?;
        rows.into_iter()
            .map(|row| {
                Ok(TagMove {
                    name: row.get("name"),
                    from_id: row.get::<Option<Uuid>, _>("from_id").map(ArtifactId),
                    to_id: ArtifactId(row.get("to_id")),
                    version: row.get::<i64, _>("version") as u64,
                    moved_at: row.get("moved_at"),
                })
            })
            .collect()
    }

    async fn extend_chain(&self, head_id: ArtifactId, new_member: ArtifactId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let predecessor: Vec<(i32, Uuid)> = sqlx::query_as(
            "SELECT seq, member_id FROM patch_chain_members WHERE head_id = $1 ORDER BY seq",
        )
        .bind(head_id.0)
        .fetch_all(&mut *tx)
        .await?;

        let next_seq = predecessor.len() as i32;
        for (s, member) in &predecessor {
            sqlx::query(
                "INSERT INTO patch_chain_members (head_id, seq, member_id) VALUES ($1, $2, $3)",
            )
            .bind(new_member.0)
            .bind(s)
            .bind(member)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            "INSERT INTO patch_chain_members (head_id, seq, member_id) VALUES ($1, $2, $3)",
        )
        .bind(new_member.0)
        .bind(next_seq)
        .bind(new_member.0)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn chain_members(&self, head_id: ArtifactId) -> Result<Vec<ArtifactId>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT member_id FROM patch_chain_members WHERE head_id = $1 ORDER BY seq",
        )
        .bind(head_id.0)
        .fetch_all(&self.pool)
        .await
        .context("failed to resolve patch chain")?;
        if rows.is_empty() {
            return Ok(vec![head_id]);
        }
        Ok(rows.into_iter().map(|(id,)| ArtifactId(id)).collect())
    }

    async fn create_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            "INSERT INTO runs
                (run_id, base_kind, base_ref, run_patch_id, tags_snapshot, submitted_at,
                 submitted_by, status)
             VALUES ($1, $2::base_kind, $3, $4, $5, $6, $7, $8::run_status)",
        )
        .bind(run.run_id.0)
        .bind(base_kind_str(run.base_kind))
        .bind(&run.base_ref)
        .bind(run.run_patch_id.map(|a| a.0))
        .bind(&run.tags_snapshot)
        .bind(run.submitted_at)
        .bind(&run.submitted_by)
        .bind(run_status_str(run.status))
        .execute(&self.pool)
        .await
        .context("failed to insert run")?;
        Ok(())
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>> {
        let row = sqlx::query(
            "SELECT run_id, base_kind::text AS base_kind, base_ref, run_patch_id,
                    tags_snapshot, submitted_at, submitted_by, status::text AS status
             FROM runs WHERE run_id = $1",
        )
        .bind(run_id.0)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch run")?;
        row.map(|row| {
            Ok(Run {
                run_id: RunId(row.get("run_id")),
                base_kind: base_kind_from_str(row.get("base_kind"))?,
                base_ref: row.get("base_ref"),
                run_patch_id: row.get::<Option<Uuid>, _>("run_patch_id").map(ArtifactId),
                tags_snapshot: row.get("tags_snapshot"),
                submitted_at: row.get("submitted_at"),
                submitted_by: row.get("submitted_by"),
                status: run_status_from_str(row.get("status"))?,
            })
        })
        .transpose()
    }

    async fn update_run_status(&self, run_id: RunId, status: RunStatus) -> Result<()> {
        sqlx::query("UPDATE runs SET status = $1::run_status WHERE run_id = $2")
            .bind(run_status_str(status))
            .bind(run_id.0)
            .execute(&self.pool)
            .await
            .context("failed to update run status")?;
        Ok(())
    }

    async fn get_run_patches_with_operations(
        &self,
        run_id: RunId,
    ) -> Result<Vec<json_patch::PatchOperation>> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            "SELECT operation FROM run_patch_operations WHERE run_id = $1 ORDER BY seq",
        )
        .bind(run_id.0)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch run patch operations")?;
        rows.into_iter()
            .map(|(value,)| serde_json::from_value(value).context("malformed patch operation"))
            .collect()
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

fn row_to_artifact(row: sqlx::postgres::PgRow) -> Result<Artifact> {
    Ok(Artifact {
        id: ArtifactId(row.get("artifact_id")),
        kind: kind_from_str(row.get("kind"))?,
        cas_id: CasId(row.get("cas_id")),
        metadata: ArtifactMetadata {
            plan_hash: row.get("plan_hash"),
            version_hash: row.get("version_hash"),
            base_version: row.get::<Option<Uuid>, _>("base_version").map(ArtifactId),
            depth: row.get::<Option<i32>, _>("depth").map(|d| d as u32),
            nodes_count: row.get::<Option<i32>, _>("nodes_count").map(|d| d as u32),
            edges_count: row.get::<Option<i32>, _>("edges_count").map(|d| d as u32),
        },
        created_at: row.get("created_at"),
    })
}

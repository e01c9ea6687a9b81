//! The Coordinator (C4, §4.4): the completion-signal consumer. One call to
//! `handle_completion` implements the full ten-step handling sequence,
//! including absorber recursion and skipped-node synthesis — both of which
//! loop back through this same sequence, so the two entry points
//! (`handle_completion` and the private `route`) are mutually recursive and
//! therefore boxed (§9: the IR is always re-fetched, never cached, so each
//! recursive hop naturally observes the latest patch).

use crate::artifact::ArtifactStore;
use crate::completion_supervisor::CompletionSupervisor;
use crate::compiler::ir::{Ir, IrNode};
use crate::condition;
use crate::counter::CounterProtocol;
use crate::dispatch::{build_task_token, partition_routes, TaskPublisher};
use crate::error::CoordinatorError;
use crate::events::{task_stream_for, CompletionSignal, CompletionStatus, TaskTokenMetadata, UiEvent};
use crate::hotstore::HotStore;
use crate::ids::{CasId, NodeId, RunId};
use crate::patch::PatchMaterializer;
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{info, warn};

const AGENT_NODE_TYPE: &str = "agent";

pub struct Coordinator<H: HotStore, A: ArtifactStore> {
    hot: Arc<H>,
    artifact: Arc<A>,
    counter: CounterProtocol<H>,
    materializer: Arc<PatchMaterializer<A, H>>,
    supervisor: Arc<CompletionSupervisor<H, A>>,
    publisher: Arc<dyn TaskPublisher>,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

impl<H: HotStore + 'static, A: ArtifactStore + 'static> Coordinator<H, A> {
    pub fn new(
        hot: Arc<H>,
        artifact: Arc<A>,
        materializer: Arc<PatchMaterializer<A, H>>,
        supervisor: Arc<CompletionSupervisor<H, A>>,
        publisher: Arc<dyn TaskPublisher>,
    ) -> Self {
        Self {
            counter: CounterProtocol::new(hot.clone()),
            hot,
            artifact,
            materializer,
            supervisor,
            publisher,
        }
    }

    /// §4.4 steps 1-10. Recursive by construction (see module docs), hence
    /// boxed.
    pub fn handle_completion(&self, signal: CompletionSignal) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        Box::pin(async move {
            let run_id = signal.run_id;

            // Step 1: load the latest IR unconditionally.
            let current_ir = self.load_ir(run_id).await?;

            // Step 2: failed completions never route.
            if signal.status == CompletionStatus::Failed {
                self.handle_failure(run_id, &current_ir, &signal).await?;
                return Ok(());
            }

            let node = current_ir
                .node(&signal.node_id)
                .cloned()
                .ok_or_else(|| CoordinatorError::MissingNode(signal.node_id.clone(), run_id))?;

            // Step 3: agent completions may have introduced a patch.
            if node.node_type == AGENT_NODE_TYPE {
                self.materializer
                    .reload_if_patched_best_effort(run_id, &current_ir)
                    .await;
            }

            // Step 4: consume, idempotently.
            let outcome = self
                .counter
                .consume(run_id, &signal.node_id)
                .await
                .map_err(|e| CoordinatorError::HotStore(anyhow::anyhow!(e)))?;

            // Step 5: persist the result.
            let (output, result_ref) = self.persist_result(run_id, &signal).await?;
            self.publish_node_completed(&current_ir, run_id, &signal.node_id, outcome.value, result_ref);

            // Step 6: reload IR and re-fetch the node — a patch in step 3
            // may have changed its dependents.
            let ir = self.load_ir(run_id).await?;
            let node = ir
                .node(&signal.node_id)
                .cloned()
                .ok_or_else(|| CoordinatorError::MissingNode(signal.node_id.clone(), run_id))?;

            let context = self.context_snapshot(run_id).await?;

            // Steps 7-9: determine next nodes and route them.
            self.route(run_id, &ir, &node, output, context).await?;

            // Step 10: a terminal completion asks the supervisor to check.
            if node.is_terminal {
                if let Err(err) = self.supervisor.evaluate(run_id).await {
                    warn!(%run_id, error = %err, "completion supervisor evaluation failed");
                }
            }

            Ok(())
        })
    }

    async fn load_ir(&self, run_id: RunId) -> Result<Ir, CoordinatorError> {
        self.hot
            .load_ir(run_id)
            .await
            .map_err(CoordinatorError::HotStore)?
            .ok_or(CoordinatorError::MissingIr(run_id))
    }

    async fn handle_failure(
        &self,
        run_id: RunId,
        ir: &Ir,
        signal: &CompletionSignal,
    ) -> Result<(), CoordinatorError> {
        let payload = signal
            .result_data
            .clone()
            .unwrap_or_else(|| serde_json::json!({"error": "worker reported failure"}));
        let bytes = serde_json::to_vec(&payload).unwrap_or_default();
        let cas_id = self
            .artifact
            .put_blob(bytes, "application/json")
            .await
            .map_err(CoordinatorError::ArtifactStore)?;
        self.hot
            .set_context(run_id, &format!("{}:failure", signal.node_id), &cas_id.to_string())
            .await
            .map_err(CoordinatorError::HotStore)?;

        if let Some(username) = ir
            .metadata
            .as_ref()
            .and_then(|m| m.get("username"))
            .and_then(|v| v.as_str())
        {
            let now = Utc::now();
            let _ = self.publisher.publish_ui_event(
                username,
                UiEvent::NodeFailed {
                    run_id,
                    node_id: signal.node_id.clone(),
                    error: "worker reported failure".to_string(),
                    timestamp: now,
                },
            );
            let _ = self.publisher.publish_ui_event(
                username,
                UiEvent::WorkflowFailed {
                    run_id,
                    node_id: Some(signal.node_id.clone()),
                    error: Some("worker reported failure".to_string()),
                    timestamp: now,
                },
            );
        }

        self.artifact
            .update_run_status(run_id, crate::artifact::RunStatus::Failed)
            .await
            .map_err(CoordinatorError::ArtifactStore)?;
        Ok(())
    }

    /// Publishes `node_completed` to `run:{username}` (§6) when the IR's
    /// metadata carries a username — the same condition `handle_failure`
    /// uses for `node_failed`/`workflow_failed`. Best-effort: a publish
    /// failure is swallowed rather than failing the completion (§7, "the
    /// coordinator never panics on a single signal").
    fn publish_node_completed(
        &self,
        ir: &Ir,
        run_id: RunId,
        node_id: &NodeId,
        counter: i64,
        result_ref: Option<String>,
    ) {
        let Some(username) = ir
            .metadata
            .as_ref()
            .and_then(|m| m.get("username"))
            .and_then(|v| v.as_str())
        else {
            return;
        };
        let _ = self.publisher.publish_ui_event(
            username,
            UiEvent::NodeCompleted {
                run_id,
                node_id: node_id.clone(),
                counter,
                result_ref,
                timestamp: Utc::now(),
            },
        );
    }

    /// Stores `result_data` in CAS and records the context pointer, or uses
    /// `result_ref` directly if the worker already wrote its own output
    /// (§4.4 step 5). Returns the node's output as a `Value` (so branch/loop
    /// conditions can be evaluated against it) alongside the CAS ref it was
    /// recorded under, for `NodeCompleted`'s `result_ref` (§6).
    async fn persist_result(
        &self,
        run_id: RunId,
        signal: &CompletionSignal,
    ) -> Result<(serde_json::Value, Option<String>), CoordinatorError> {
        if let Some(data) = &signal.result_data {
            let bytes = serde_json::to_vec(data).unwrap_or_default();
            let cas_id = self
                .artifact
                .put_blob(bytes, "application/json")
                .await
                .map_err(CoordinatorError::ArtifactStore)?;
            self.hot
                .set_context(run_id, &format!("{}:output", signal.node_id), &cas_id.to_string())
                .await
                .map_err(CoordinatorError::HotStore)?;
            return Ok((data.clone(), Some(cas_id.to_string())));
        }
        if let Some(cas_ref) = &signal.result_ref {
            self.hot
                .set_context(run_id, &format!("{}:output", signal.node_id), cas_ref)
                .await
                .map_err(CoordinatorError::HotStore)?;
            if let Ok(bytes) = self.artifact.get_blob(&CasId(cas_ref.clone())).await {
                if let Ok(value) = serde_json::from_slice(&bytes) {
                    return Ok((value, Some(cas_ref.clone())));
                }
            }
            return Ok((serde_json::Value::Null, Some(cas_ref.clone())));
        }
        Ok((serde_json::Value::Null, None))
    }

    /// Resolves every `*:output` context pointer into its JSON value,
    /// keyed by plain `node_id`, for `$nodes.<id>.<field>` resolution
    /// (§3, §4.4 step 8).
    async fn context_snapshot(
        &self,
        run_id: RunId,
    ) -> Result<HashMap<String, serde_json::Value>, CoordinatorError> {
        let raw = self
            .hot
            .all_context(run_id)
            .await
            .map_err(CoordinatorError::HotStore)?;
        let mut out = HashMap::new();
        for (key, cas_ref) in raw {
            let Some(node_id) = key.strip_suffix(":output") else {
                continue;
            };
            if let Ok(bytes) = self.artifact.get_blob(&CasId(cas_ref)).await {
                if let Ok(value) = serde_json::from_slice(&bytes) {
                    out.insert(node_id.to_string(), value);
                }
            }
        }
        Ok(out)
    }

    /// §4.4 step 7: determine the set of next node ids given `node`'s
    /// control-flow kind and its just-produced `output`.
    async fn determine_next(
        &self,
        run_id: RunId,
        node: &IrNode,
        output: &serde_json::Value,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<Vec<NodeId>, CoordinatorError> {
        if let Some(loop_cfg) = &node.loop_ {
            let increment = self
                .hot
                .loop_increment(run_id, &node.id, loop_cfg.max_iterations)
                .await
                .map_err(CoordinatorError::HotStore)?;
            if increment.at_max {
                self.hot
                    .loop_clear(run_id, &node.id)
                    .await
                    .map_err(CoordinatorError::HotStore)?;
                return Ok(loop_cfg.timeout_path.clone().into_iter().collect());
            }
            let should_continue = match &loop_cfg.condition {
                None => true,
                Some(expr) => match condition::evaluate(expr, output, context) {
                    Ok(truthy) => truthy,
                    Err(err) => {
                        warn!(%run_id, node = %node.id, error = %err, "loop condition evaluation failed, defaulting to break_path");
                        false
                    }
                },
            };
            if should_continue {
                return Ok(vec![loop_cfg.loop_back_to.clone()]);
            }
            self.hot
                .loop_clear(run_id, &node.id)
                .await
                .map_err(CoordinatorError::HotStore)?;
            return Ok(loop_cfg.break_path.clone().into_iter().collect());
        }

        if let Some(branch) = &node.branch {
            for rule in &branch.rules {
                match condition::evaluate(&rule.condition, output, context) {
                    Ok(true) => return Ok(rule.next_nodes.clone()),
                    Ok(false) => continue,
                    Err(err) => {
                        warn!(%run_id, node = %node.id, rule = %rule.condition, error = %err, "branch rule evaluation failed, skipping rule");
                        continue;
                    }
                }
            }
            return Ok(branch.default.clone());
        }

        Ok(node.dependents.clone())
    }

    /// §4.4 steps 7-9, also the re-entry point for absorber recursion and
    /// skipped-node synthesis — see module docs for why this is boxed.
    fn route<'a>(
        &'a self,
        run_id: RunId,
        ir: &'a Ir,
        node: &'a IrNode,
        output: serde_json::Value,
        context: HashMap<String, serde_json::Value>,
    ) -> BoxFuture<'a, Result<(), CoordinatorError>> {
        Box::pin(async move {
            let next = self.determine_next(run_id, node, &output, &context).await?;
            let (absorbers, workers) = partition_routes(ir, &next);

            if !workers.is_empty() {
                let worker_ids: Vec<NodeId> = workers.iter().map(|w| w.id.clone()).collect();
                self.counter
                    .emit(run_id, &node.id, &worker_ids, &node.id.to_string())
                    .await
                    .map_err(|e| CoordinatorError::HotStore(anyhow::anyhow!(e)))?;
            }

            for absorber in absorbers {
                self.record_forwarded_output(run_id, &absorber.id, &output).await?;
                self.route(run_id, ir, absorber, output.clone(), context.clone()).await?;
            }

            for worker in workers {
                self.dispatch_worker(run_id, ir, node, worker, &context).await?;
            }

            Ok(())
        })
    }

    /// Absorbers are zero-cost but still first-class for observability
    /// (§9 "Inline absorbers are a policy choice... they must still appear
    /// as first-class nodes") — they forward their upstream's output
    /// unchanged, so `$nodes.<absorber_id>.*` resolves the same way a real
    /// worker's output would.
    async fn record_forwarded_output(
        &self,
        run_id: RunId,
        node_id: &NodeId,
        output: &serde_json::Value,
    ) -> Result<(), CoordinatorError> {
        let bytes = serde_json::to_vec(output).unwrap_or_default();
        let cas_id = self
            .artifact
            .put_blob(bytes, "application/json")
            .await
            .map_err(CoordinatorError::ArtifactStore)?;
        self.hot
            .set_context(run_id, &format!("{node_id}:output"), &cas_id.to_string())
            .await
            .map_err(CoordinatorError::HotStore)?;
        Ok(())
    }

    async fn dispatch_worker(
        &self,
        run_id: RunId,
        ir: &Ir,
        from_node: &IrNode,
        worker: &IrNode,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<(), CoordinatorError> {
        if worker.wait_for_all {
            let arrival = self
                .hot
                .join_arrive(run_id, &worker.id, &from_node.id, worker.dependencies.len())
                .await
                .map_err(CoordinatorError::HotStore)?;
            if !arrival.complete {
                return Ok(());
            }
            self.hot
                .join_reset(run_id, &worker.id)
                .await
                .map_err(CoordinatorError::HotStore)?;
        }

        if let Some(stream) = task_stream_for(&worker.node_type) {
            let metadata = TaskTokenMetadata {
                task: Some(worker.node_type.clone()),
                workflow: ir
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("workflow"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                workflow_owner: ir
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("username"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                workflow_tag: ir
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("tag"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            };
            let token = build_task_token(run_id, &from_node.id, worker, context, metadata);
            self.publisher
                .publish_task(&stream, token)
                .map_err(CoordinatorError::Dispatch)?;
            info!(%run_id, worker = %worker.id, stream = %stream, "task token published");
            return Ok(());
        }

        // §4.4 step 8 "Unsupported worker types": synthesize a skip instead
        // of erroring, so an agent-introduced type never deadlocks the run.
        warn!(%run_id, node = %worker.id, node_type = %worker.node_type, "unsupported worker type, synthesizing skip");
        let synthetic = CompletionSignal {
            version: "1.0".to_string(),
            job_id: format!("skip:{run_id}:{}", worker.id),
            run_id,
            node_id: worker.id.clone(),
            status: CompletionStatus::Completed,
            result_data: Some(serde_json::json!({})),
            result_ref: None,
            metadata: Some(serde_json::json!({"skipped": true})),
        };
        self.handle_completion(synthetic).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::memory::MemoryArtifactStore;
    use crate::artifact::{ArtifactKind, ArtifactMetadata, BaseKind, Run, RunStatus};
    use crate::compiler::lowering::compile;
    use crate::hotstore::memory::MemoryHotStore;
    use crate::model::{DocumentEdge, DocumentNode, WorkflowDocument};
    use std::sync::Mutex as StdMutex;

    struct RecordingPublisher {
        tasks: StdMutex<Vec<(String, crate::events::TaskToken)>>,
        ui_events: StdMutex<Vec<UiEvent>>,
    }

    impl RecordingPublisher {
        fn new() -> Self {
            Self {
                tasks: StdMutex::new(Vec::new()),
                ui_events: StdMutex::new(Vec::new()),
            }
        }
    }

    impl TaskPublisher for RecordingPublisher {
        fn publish_task(&self, stream: &str, token: crate::events::TaskToken) -> anyhow::Result<()> {
            self.tasks.lock().unwrap().push((stream.to_string(), token));
            Ok(())
        }
        fn publish_ui_event(&self, _username: &str, event: UiEvent) -> anyhow::Result<()> {
            self.ui_events.lock().unwrap().push(event);
            Ok(())
        }
    }

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

    async fn seed_run(artifact: &MemoryArtifactStore, doc: &WorkflowDocument) -> RunId {
        let bytes = serde_json::to_vec(doc).unwrap();
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
        run_id
    }

    fn make_coordinator(
        hot: Arc<MemoryHotStore>,
        artifact: Arc<MemoryArtifactStore>,
        publisher: Arc<RecordingPublisher>,
    ) -> Coordinator<MemoryHotStore, MemoryArtifactStore> {
        let materializer = Arc::new(PatchMaterializer::new(artifact.clone(), hot.clone(), 5));
        let supervisor = Arc::new(CompletionSupervisor::new(hot.clone(), artifact.clone()));
        Coordinator::new(hot, artifact, materializer, supervisor, publisher)
    }

    /// S1: a linear chain dispatches the next node and completes the run.
    #[tokio::test]
    async fn linear_completion_dispatches_next_node_and_completes_run() {
        let hot = Arc::new(MemoryHotStore::new());
        let artifact = Arc::new(MemoryArtifactStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let coordinator = make_coordinator(hot.clone(), artifact.clone(), publisher.clone());

        let doc = WorkflowDocument {
            nodes: vec![node("a", "http"), node("b", "http")],
            edges: vec![edge("a", "b")],
            metadata: None,
        };
        let ir = compile(&doc).unwrap();
        let run_id = seed_run(&artifact, &doc).await;
        hot.store_ir(run_id, &ir).await.unwrap();
        hot.init_run(run_id, 1).await.unwrap();

        coordinator
            .handle_completion(CompletionSignal {
                version: "1.0".to_string(),
                job_id: "j1".to_string(),
                run_id,
                node_id: "a".into(),
                status: CompletionStatus::Completed,
                result_data: Some(serde_json::json!({"ok": true})),
                result_ref: None,
                metadata: None,
            })
            .await
            .unwrap();

        {
            let tasks = publisher.tasks.lock().unwrap();
            assert_eq!(tasks.len(), 1);
            assert_eq!(tasks[0].1.to_node, NodeId::from("b"));
        }

        coordinator
            .handle_completion(CompletionSignal {
                version: "1.0".to_string(),
                job_id: "j2".to_string(),
                run_id,
                node_id: "b".into(),
                status: CompletionStatus::Completed,
                result_data: Some(serde_json::json!({"ok": true})),
                result_ref: None,
                metadata: None,
            })
            .await
            .unwrap();

        let run = artifact.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    /// S2: a fan-out join only dispatches once both branches have arrived.
    #[tokio::test]
    async fn join_waits_for_both_branches() {
        let hot = Arc::new(MemoryHotStore::new());
        let artifact = Arc::new(MemoryArtifactStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let coordinator = make_coordinator(hot.clone(), artifact.clone(), publisher.clone());

        let doc = WorkflowDocument {
            nodes: vec![
                node("start", "http"),
                node("left", "http"),
                node("right", "http"),
                node("join", "http"),
            ],
            edges: vec![
                edge("start", "left"),
                edge("start", "right"),
                edge("left", "join"),
                edge("right", "join"),
            ],
            metadata: None,
        };
        let ir = compile(&doc).unwrap();
        let run_id = seed_run(&artifact, &doc).await;
        hot.store_ir(run_id, &ir).await.unwrap();
        hot.init_run(run_id, 1).await.unwrap();

        coordinator
            .handle_completion(CompletionSignal {
                version: "1.0".to_string(),
                job_id: "j1".to_string(),
                run_id,
                node_id: "left".into(),
                status: CompletionStatus::Completed,
                result_data: Some(serde_json::json!({})),
                result_ref: None,
                metadata: None,
            })
            .await
            .unwrap();
        assert_eq!(publisher.tasks.lock().unwrap().len(), 0);

        coordinator
            .handle_completion(CompletionSignal {
                version: "1.0".to_string(),
                job_id: "j2".to_string(),
                run_id,
                node_id: "right".into(),
                status: CompletionStatus::Completed,
                result_data: Some(serde_json::json!({})),
                result_ref: None,
                metadata: None,
            })
            .await
            .unwrap();

        let tasks = publisher.tasks.lock().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].1.to_node, NodeId::from("join"));
    }

    /// S2: A→B, A→C, A→D. Completing B, C, D each publishes a
    /// `node_completed` event, for exactly three total.
    #[tokio::test]
    async fn parallel_fan_out_publishes_node_completed_for_each_branch() {
        let hot = Arc::new(MemoryHotStore::new());
        let artifact = Arc::new(MemoryArtifactStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let coordinator = make_coordinator(hot.clone(), artifact.clone(), publisher.clone());

        let doc = WorkflowDocument {
            nodes: vec![
                node("a", "http"),
                node("b", "http"),
                node("c", "http"),
                node("d", "http"),
            ],
            edges: vec![edge("a", "b"), edge("a", "c"), edge("a", "d")],
            metadata: Some(serde_json::json!({"username": "alice"})),
        };
        let ir = compile(&doc).unwrap();
        let run_id = seed_run(&artifact, &doc).await;
        hot.store_ir(run_id, &ir).await.unwrap();
        hot.init_run(run_id, 1).await.unwrap();

        for id in ["a", "b", "c", "d"] {
            coordinator
                .handle_completion(CompletionSignal {
                    version: "1.0".to_string(),
                    job_id: format!("j-{id}"),
                    run_id,
                    node_id: id.into(),
                    status: CompletionStatus::Completed,
                    result_data: Some(serde_json::json!({})),
                    result_ref: None,
                    metadata: None,
                })
                .await
                .unwrap();
        }

        let events = publisher.ui_events.lock().unwrap();
        let completed_for = |target: &str| {
            events
                .iter()
                .filter(|e| matches!(e, UiEvent::NodeCompleted { node_id, .. } if node_id == &NodeId::from(target)))
                .count()
        };
        assert_eq!(completed_for("b"), 1);
        assert_eq!(completed_for("c"), 1);
        assert_eq!(completed_for("d"), 1);
        let bcd_total = completed_for("b") + completed_for("c") + completed_for("d");
        assert_eq!(bcd_total, 3, "exactly three node_completed events for B, C, D");
    }

    /// S3: a branch node is an absorber — it evaluates and recurses inline,
    /// incurring no separate consume/emit cycle of its own.
    #[tokio::test]
    async fn branch_node_routes_inline_without_dispatch() {
        let hot = Arc::new(MemoryHotStore::new());
        let artifact = Arc::new(MemoryArtifactStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let coordinator = make_coordinator(hot.clone(), artifact.clone(), publisher.clone());

        let doc = WorkflowDocument {
            nodes: vec![
                node("start", "http"),
                node("gate", "conditional"),
                node("high", "http"),
                node("low", "http"),
            ],
            edges: vec![
                edge("start", "gate"),
                DocumentEdge {
                    from: "gate".into(),
                    to: "high".into(),
                    condition: Some("output.score >= 50".to_string()),
                },
                DocumentEdge {
                    from: "gate".into(),
                    to: "low".into(),
                    condition: None,
                },
            ],
            metadata: None,
        };
        let ir = compile(&doc).unwrap();
        let run_id = seed_run(&artifact, &doc).await;
        hot.store_ir(run_id, &ir).await.unwrap();
        hot.init_run(run_id, 1).await.unwrap();

        coordinator
            .handle_completion(CompletionSignal {
                version: "1.0".to_string(),
                job_id: "j1".to_string(),
                run_id,
                node_id: "start".into(),
                status: CompletionStatus::Completed,
                result_data: Some(serde_json::json!({"score": 90})),
                result_ref: None,
                metadata: None,
            })
            .await
            .unwrap();

        let tasks = publisher.tasks.lock().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].1.to_node, NodeId::from("high"));
    }

    /// Unsupported worker types are skipped rather than deadlocking the run.
    #[tokio::test]
    async fn unsupported_worker_type_synthesizes_skip_and_continues() {
        let hot = Arc::new(MemoryHotStore::new());
        let artifact = Arc::new(MemoryArtifactStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let coordinator = make_coordinator(hot.clone(), artifact.clone(), publisher.clone());

        let doc = WorkflowDocument {
            nodes: vec![node("a", "http"), node("b", "quantum_forecast")],
            edges: vec![edge("a", "b")],
            metadata: None,
        };
        let ir = compile(&doc).unwrap();
        let run_id = seed_run(&artifact, &doc).await;
        hot.store_ir(run_id, &ir).await.unwrap();
        hot.init_run(run_id, 1).await.unwrap();

        coordinator
            .handle_completion(CompletionSignal {
                version: "1.0".to_string(),
                job_id: "j1".to_string(),
                run_id,
                node_id: "a".into(),
                status: CompletionStatus::Completed,
                result_data: Some(serde_json::json!({})),
                result_ref: None,
                metadata: None,
            })
            .await
            .unwrap();

        assert_eq!(publisher.tasks.lock().unwrap().len(), 0);
        let run = artifact.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    /// S4: a loop node with `max_iterations = 3` and an always-truthy
    /// condition runs exactly 3 iterations and exits via `timeout_path`. A
    /// self-referencing `loop_back_to` makes the node its own absorber
    /// (§9 "inline absorbers"), so all 3 iterations resolve inline off a
    /// single completion signal rather than three round-trips to a worker.
    #[tokio::test]
    async fn loop_runs_to_max_iterations_then_takes_timeout_path() {
        let hot = Arc::new(MemoryHotStore::new());
        let artifact = Arc::new(MemoryArtifactStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let coordinator = make_coordinator(hot.clone(), artifact.clone(), publisher.clone());

        let mut loop_node = node("a", "loop");
        loop_node.config = Some(serde_json::json!({
            "max_iterations": 3,
            "loop_back_to": "a",
            "condition": "output.retry == true",
            "break_path": "done_break",
            "timeout_path": "done_timeout",
        }));
        let doc = WorkflowDocument {
            nodes: vec![loop_node, node("done_break", "http"), node("done_timeout", "http")],
            edges: vec![],
            metadata: None,
        };
        let ir = compile(&doc).unwrap();
        let run_id = seed_run(&artifact, &doc).await;
        hot.store_ir(run_id, &ir).await.unwrap();
        hot.init_run(run_id, 1).await.unwrap();

        coordinator
            .handle_completion(CompletionSignal {
                version: "1.0".to_string(),
                job_id: "j1".to_string(),
                run_id,
                node_id: "a".into(),
                status: CompletionStatus::Completed,
                result_data: Some(serde_json::json!({"retry": true})),
                result_ref: None,
                metadata: None,
            })
            .await
            .unwrap();

        let tasks = publisher.tasks.lock().unwrap();
        assert_eq!(tasks.len(), 1, "the loop resolves to max_iterations inline before dispatching downstream");
        assert_eq!(tasks[0].1.to_node, NodeId::from("done_timeout"));

        let loop_state = hot.loop_increment(run_id, &"a".into(), 3).await.unwrap();
        assert_eq!(
            loop_state.iteration, 1,
            "loop state was cleared on hitting max_iterations, so a fresh increment restarts at 1"
        );
    }

    /// A failed completion records the failure and never routes.
    #[tokio::test]
    async fn failed_completion_marks_run_failed_without_routing() {
        let hot = Arc::new(MemoryHotStore::new());
        let artifact = Arc::new(MemoryArtifactStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let coordinator = make_coordinator(hot.clone(), artifact.clone(), publisher.clone());

        let doc = WorkflowDocument {
            nodes: vec![node("a", "http"), node("b", "http")],
            edges: vec![edge("a", "b")],
            metadata: None,
        };
        let ir = compile(&doc).unwrap();
        let run_id = seed_run(&artifact, &doc).await;
        hot.store_ir(run_id, &ir).await.unwrap();
        hot.init_run(run_id, 1).await.unwrap();

        coordinator
            .handle_completion(CompletionSignal {
                version: "1.0".to_string(),
                job_id: "j1".to_string(),
                run_id,
                node_id: "a".into(),
                status: CompletionStatus::Failed,
                result_data: None,
                result_ref: None,
                metadata: None,
            })
            .await
            .unwrap();

        assert_eq!(publisher.tasks.lock().unwrap().len(), 0);
        let run = artifact.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
    }
}

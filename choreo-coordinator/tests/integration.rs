//! Integration tests: exercise the full choreography lifecycle through the
//! Coordinator facade, against in-memory stores, for each of scenarios
//! S1-S6 (spec §8). No Postgres/Redis needed, mirroring the teacher's
//! `bpmn-lite-server/tests/integration.rs` shape: Compile -> Submit ->
//! CompleteJob -> Inspect, just against this repo's facade instead.

use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use choreo_core::artifact::memory::MemoryArtifactStore;
use choreo_core::artifact::{ArtifactKind, ArtifactMetadata, ArtifactStore, BaseKind, Run, RunStatus};
use choreo_core::completion_supervisor::CompletionSupervisor;
use choreo_core::compiler::compile;
use choreo_core::coordinator::Coordinator;
use choreo_core::dispatch::TaskPublisher;
use choreo_core::events::{CompletionSignal, CompletionStatus, TaskToken, UiEvent};
use choreo_core::hotstore::memory::MemoryHotStore;
use choreo_core::hotstore::HotStore;
use choreo_core::ids::{NodeId, RunId};
use choreo_core::model::{DocumentEdge, DocumentNode, WorkflowDocument};
use choreo_core::patch::PatchMaterializer;

struct RecordingPublisher {
    tasks: StdMutex<Vec<(String, TaskToken)>>,
    ui_events: StdMutex<Vec<UiEvent>>,
}

impl RecordingPublisher {
    fn new() -> Self {
        Self {
            tasks: StdMutex::new(Vec::new()),
            ui_events: StdMutex::new(Vec::new()),
        }
    }

    fn task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}

impl TaskPublisher for RecordingPublisher {
    fn publish_task(&self, stream: &str, token: TaskToken) -> anyhow::Result<()> {
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
            base_ref: artifact_id.to_string(),
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

fn signal(run_id: RunId, node_id: &str, job_id: &str, result_data: serde_json::Value) -> CompletionSignal {
    CompletionSignal {
        version: "1.0".to_string(),
        job_id: job_id.to_string(),
        run_id,
        node_id: node_id.into(),
        status: CompletionStatus::Completed,
        result_data: Some(result_data),
        result_ref: None,
        metadata: None,
    }
}

/// One coordinator wired to fresh in-memory stores, ready to submit runs to.
struct Harness {
    hot: Arc<MemoryHotStore>,
    artifact: Arc<MemoryArtifactStore>,
    publisher: Arc<RecordingPublisher>,
    coordinator: Coordinator<MemoryHotStore, MemoryArtifactStore>,
}

impl Harness {
    fn new(agent_node_limit: usize) -> Self {
        let hot = Arc::new(MemoryHotStore::new());
        let artifact = Arc::new(MemoryArtifactStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let materializer = Arc::new(PatchMaterializer::new(artifact.clone(), hot.clone(), agent_node_limit));
        let supervisor = Arc::new(CompletionSupervisor::new(hot.clone(), artifact.clone()));
        let coordinator = Coordinator::new(hot.clone(), artifact.clone(), materializer, supervisor, publisher.clone());
        Self {
            hot,
            artifact,
            publisher,
            coordinator,
        }
    }

    async fn submit(&self, doc: &WorkflowDocument, initial_counter: i64) -> RunId {
        let ir = compile(doc).unwrap();
        let run_id = seed_run(&self.artifact, doc).await;
        self.hot.store_ir(run_id, &ir).await.unwrap();
        self.hot.init_run(run_id, initial_counter).await.unwrap();
        run_id
    }
}

/// S1: A->B->C, all http. Counter runs 1->0->1->0->1->0; context holds every
/// node's output; the run completes.
#[tokio::test]
async fn s1_linear_chain_runs_to_completion() {
    let h = Harness::new(5);
    let doc = WorkflowDocument {
        nodes: vec![node("a", "http"), node("b", "http"), node("c", "http")],
        edges: vec![edge("a", "b"), edge("b", "c")],
        metadata: None,
    };
    let run_id = h.submit(&doc, 1).await;

    for (id, job) in [("a", "j1"), ("b", "j2"), ("c", "j3")] {
        h.coordinator
            .handle_completion(signal(run_id, id, job, serde_json::json!({"ok": true})))
            .await
            .unwrap();
    }

    assert_eq!(h.hot.counter_value(run_id).await.unwrap(), 0);
    let run = h.artifact.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    for id in ["a", "b", "c"] {
        assert!(h.hot.get_context(run_id, &format!("{id}:output")).await.unwrap().is_some());
    }
}

/// S2: A->B, A->C, A->D. Completing B, C, D dispatches no further nodes
/// (all terminal) and each publishes exactly one `node_completed` event.
#[tokio::test]
async fn s2_parallel_fan_out_completes_each_branch_once() {
    let h = Harness::new(5);
    let doc = WorkflowDocument {
        nodes: vec![node("a", "http"), node("b", "http"), node("c", "http"), node("d", "http")],
        edges: vec![edge("a", "b"), edge("a", "c"), edge("a", "d")],
        metadata: Some(serde_json::json!({"username": "alice"})),
    };
    let run_id = h.submit(&doc, 1).await;

    h.coordinator
        .handle_completion(signal(run_id, "a", "j-a", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(h.hot.counter_value(run_id).await.unwrap(), 3);
    assert_eq!(h.publisher.task_count(), 3);

    for (id, job) in [("b", "j-b"), ("c", "j-c"), ("d", "j-d")] {
        h.coordinator
            .handle_completion(signal(run_id, id, job, serde_json::json!({})))
            .await
            .unwrap();
    }

    assert_eq!(h.hot.counter_value(run_id).await.unwrap(), 0);
    let events = h.publisher.ui_events.lock().unwrap();
    for target in ["b", "c", "d"] {
        let count = events
            .iter()
            .filter(|e| matches!(e, UiEvent::NodeCompleted { node_id, .. } if node_id == &NodeId::from(target)))
            .count();
        assert_eq!(count, 1, "expected exactly one node_completed for {target}");
    }
}

/// S3: conditional node A routes to `hi` when `output.score >= 80`, to `lo`
/// otherwise. Each branch fires exactly once and the other never does.
#[tokio::test]
async fn s3_branch_routes_on_condition() {
    for (score, expected) in [(90, "hi"), (40, "lo")] {
        let h = Harness::new(5);
        let doc = WorkflowDocument {
            nodes: vec![node("a", "conditional"), node("hi", "http"), node("lo", "http")],
            edges: vec![
                DocumentEdge {
                    from: "a".into(),
                    to: "hi".into(),
                    condition: Some("output.score >= 80".to_string()),
                },
                DocumentEdge {
                    from: "a".into(),
                    to: "lo".into(),
                    condition: None,
                },
            ],
            metadata: None,
        };
        let run_id = h.submit(&doc, 1).await;

        h.coordinator
            .handle_completion(signal(run_id, "a", "j1", serde_json::json!({"score": score})))
            .await
            .unwrap();

        let tasks = h.publisher.tasks.lock().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].1.to_node, NodeId::from(expected));
    }
}

/// S4: loop node with max_iterations=3 and an always-truthy condition runs
/// to the bound and exits via timeout_path, never break_path.
#[tokio::test]
async fn s4_loop_exhausts_max_iterations_via_timeout_path() {
    let h = Harness::new(5);
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
    let run_id = h.submit(&doc, 1).await;

    h.coordinator
        .handle_completion(signal(run_id, "a", "j1", serde_json::json!({"retry": true})))
        .await
        .unwrap();

    let tasks = h.publisher.tasks.lock().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].1.to_node, NodeId::from("done_timeout"));
}

/// S5: A->B; after B completes, an agent patch adds C and edge B->C. C
/// executes exactly once and the run completes on the 3-node IR.
#[tokio::test]
async fn s5_runtime_patch_extends_the_live_graph() {
    let h = Harness::new(5);
    let doc = WorkflowDocument {
        nodes: vec![node("a", "agent"), node("b", "http")],
        edges: vec![edge("a", "b")],
        metadata: None,
    };
    let run_id = h.submit(&doc, 1).await;

    let ops: Vec<json_patch::PatchOperation> = serde_json::from_value(serde_json::json!([
        {"op": "add", "path": "/nodes/-", "value": {"id": "c", "type": "http"}},
        {"op": "add", "path": "/edges/-", "value": {"from": "b", "to": "c"}}
    ]))
    .unwrap();
    h.artifact.seed_run_patches(run_id, ops).await;

    // Completing the agent node triggers the patch-reload check (§4.4 step 3).
    h.coordinator
        .handle_completion(signal(run_id, "a", "j1", serde_json::json!({})))
        .await
        .unwrap();
    h.coordinator
        .handle_completion(signal(run_id, "b", "j2", serde_json::json!({})))
        .await
        .unwrap();
    h.coordinator
        .handle_completion(signal(run_id, "c", "j3", serde_json::json!({})))
        .await
        .unwrap();

    let ir = h.hot.load_ir(run_id).await.unwrap().unwrap();
    assert_eq!(ir.nodes.len(), 3);
    assert_eq!(h.hot.counter_value(run_id).await.unwrap(), 0);
    let run = h.artifact.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
}

/// S6: a run already at 5 agent nodes (the configured limit) rejects a
/// patch that would add a 6th; the run continues and completes on the
/// pre-patch IR.
#[tokio::test]
async fn s6_patch_over_agent_limit_is_rejected() {
    let h = Harness::new(1);
    let doc = WorkflowDocument {
        nodes: vec![node("a", "agent"), node("b", "http")],
        edges: vec![edge("a", "b")],
        metadata: None,
    };
    let run_id = h.submit(&doc, 1).await;

    let ops: Vec<json_patch::PatchOperation> = serde_json::from_value(serde_json::json!([
        {"op": "add", "path": "/nodes/-", "value": {"id": "c", "type": "agent"}},
        {"op": "add", "path": "/edges/-", "value": {"from": "b", "to": "c"}}
    ]))
    .unwrap();
    h.artifact.seed_run_patches(run_id, ops).await;

    h.coordinator
        .handle_completion(signal(run_id, "a", "j1", serde_json::json!({})))
        .await
        .unwrap();

    let ir = h.hot.load_ir(run_id).await.unwrap().unwrap();
    assert_eq!(ir.nodes.len(), 2, "rejected patch leaves the pre-patch IR in place");

    h.coordinator
        .handle_completion(signal(run_id, "b", "j2", serde_json::json!({})))
        .await
        .unwrap();

    let run = h.artifact.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
}

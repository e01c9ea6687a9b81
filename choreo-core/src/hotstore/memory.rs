//! In-memory `HotStore`, for tests and single-process development — mirrors
//! the teacher's `MemoryStore` shape: one `RwLock<Inner>` guarding every
//! table, since there is no cross-process concurrency to arbitrate.

use super::{CounterOutcome, HotStore, JoinArrival, LoopIncrement};
use crate::compiler::ir::Ir;
use crate::events::UiEvent;
use crate::ids::{NodeId, RunId};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::{broadcast, RwLock};

struct Inner {
    ir: HashMap<RunId, Ir>,
    context: HashMap<RunId, HashMap<String, String>>,
    counters: HashMap<RunId, i64>,
    applied: HashMap<RunId, HashSet<String>>,
    loop_state: HashMap<(RunId, NodeId), u32>,
    join_state: HashMap<(RunId, NodeId), HashSet<NodeId>>,
    pending_approvals: HashMap<RunId, HashSet<String>>,
}

/// In-memory implementation of `HotStore` for tests and local development.
pub struct MemoryHotStore {
    inner: RwLock<Inner>,
    completion_tx: broadcast::Sender<RunId>,
    ui_tx: broadcast::Sender<(String, UiEvent)>,
}

impl MemoryHotStore {
    pub fn new() -> Self {
        let (completion_tx, _) = broadcast::channel(1024);
        let (ui_tx, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Inner {
                ir: HashMap::new(),
                context: HashMap::new(),
                counters: HashMap::new(),
                applied: HashMap::new(),
                loop_state: HashMap::new(),
                join_state: HashMap::new(),
                pending_approvals: HashMap::new(),
            }),
            completion_tx,
            ui_tx,
        }
    }

    /// Subscribe to completion events published by `consume`/`emit`, for
    /// tests and the in-process Completion Supervisor.
    pub fn subscribe_completion(&self) -> broadcast::Receiver<RunId> {
        self.completion_tx.subscribe()
    }

    pub fn subscribe_ui_events(&self) -> broadcast::Receiver<(String, UiEvent)> {
        self.ui_tx.subscribe()
    }
}

impl Default for MemoryHotStore {
    fn default() -> Self {
        Self::new()
    }
}

fn consume_key(run_id: RunId, node_id: &NodeId) -> String {
    format!("consume:{run_id}:{node_id}")
}

fn emit_key(run_id: RunId, from_node: &NodeId, emit_id: &str) -> String {
    format!("emit:{run_id}:{from_node}:{emit_id}")
}

#[async_trait]
impl HotStore for MemoryHotStore {
    async fn init_run(&self, run_id: RunId, initial_counter: i64) -> Result<()> {
        let mut w = self.inner.write().await;
        w.counters.insert(run_id, initial_counter);
        w.applied.entry(run_id).or_default();
        w.context.entry(run_id).or_default();
        Ok(())
    }

    async fn load_ir(&self, run_id: RunId) -> Result<Option<Ir>> {
        let r = self.inner.read().await;
        Ok(r.ir.get(&run_id).cloned())
    }

    async fn store_ir(&self, run_id: RunId, ir: &Ir) -> Result<()> {
        let mut w = self.inner.write().await;
        w.ir.insert(run_id, ir.clone());
        Ok(())
    }

    async fn get_context(&self, run_id: RunId, key: &str) -> Result<Option<String>> {
        let r = self.inner.read().await;
        Ok(r.context.get(&run_id).and_then(|m| m.get(key).cloned()))
    }

    async fn set_context(&self, run_id: RunId, key: &str, cas_ref: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        w.context
            .entry(run_id)
            .or_default()
            .insert(key.to_string(), cas_ref.to_string());
        Ok(())
    }

    async fn all_context(&self, run_id: RunId) -> Result<HashMap<String, String>> {
        let r = self.inner.read().await;
        Ok(r.context.get(&run_id).cloned().unwrap_or_default())
    }

    async fn consume(&self, run_id: RunId, node_id: &NodeId) -> Result<CounterOutcome> {
        let mut w = self.inner.write().await;
        let key = consume_key(run_id, node_id);
        let applied = w.applied.entry(run_id).or_default();
        if applied.contains(&key) {
            let value = *w.counters.get(&run_id).unwrap_or(&0);
            return Ok(CounterOutcome {
                value,
                changed: false,
                hit_zero: false,
            });
        }
        applied.insert(key);
        let counter = w.counters.entry(run_id).or_insert(0);
        let before = *counter;
        *counter -= 1;
        let value = *counter;
        let hit_zero = before != 0 && value == 0;
        if hit_zero {
            let _ = self.completion_tx.send(run_id);
        }
        Ok(CounterOutcome {
            value,
            changed: true,
            hit_zero,
        })
    }

    async fn emit(
        &self,
        run_id: RunId,
        from_node: &NodeId,
        emit_id: &str,
        count: i64,
    ) -> Result<CounterOutcome> {
        let mut w = self.inner.write().await;
        let key = emit_key(run_id, from_node, emit_id);
        let applied = w.applied.entry(run_id).or_default();
        if applied.contains(&key) {
            let value = *w.counters.get(&run_id).unwrap_or(&0);
            return Ok(CounterOutcome {
                value,
                changed: false,
                hit_zero: false,
            });
        }
        applied.insert(key);
        let counter = w.counters.entry(run_id).or_insert(0);
        let before = *counter;
        *counter += count;
        let value = *counter;
        let hit_zero = before != 0 && value == 0;
        if hit_zero {
            let _ = self.completion_tx.send(run_id);
        }
        Ok(CounterOutcome {
            value,
            changed: true,
            hit_zero,
        })
    }

    async fn counter_value(&self, run_id: RunId) -> Result<i64> {
        let r = self.inner.read().await;
        Ok(*r.counters.get(&run_id).unwrap_or(&0))
    }

    async fn loop_increment(
        &self,
        run_id: RunId,
        node_id: &NodeId,
        max_iterations: u32,
    ) -> Result<LoopIncrement> {
        let mut w = self.inner.write().await;
        let entry = w.loop_state.entry((run_id, node_id.clone())).or_insert(0);
        *entry += 1;
        Ok(LoopIncrement {
            iteration: *entry,
            at_max: *entry >= max_iterations,
        })
    }

    async fn loop_clear(&self, run_id: RunId, node_id: &NodeId) -> Result<()> {
        let mut w = self.inner.write().await;
        w.loop_state.remove(&(run_id, node_id.clone()));
        Ok(())
    }

    async fn join_arrive(
        &self,
        run_id: RunId,
        node_id: &NodeId,
        from_node: &NodeId,
        expected: usize,
    ) -> Result<JoinArrival> {
        let mut w = self.inner.write().await;
        let set = w.join_state.entry((run_id, node_id.clone())).or_default();
        set.insert(from_node.clone());
        let arrived = set.len();
        Ok(JoinArrival {
            arrived,
            expected,
            complete: arrived >= expected,
        })
    }

    async fn join_reset(&self, run_id: RunId, node_id: &NodeId) -> Result<()> {
        let mut w = self.inner.write().await;
        w.join_state.remove(&(run_id, node_id.clone()));
        Ok(())
    }

    async fn add_pending_approval(&self, run_id: RunId, approval_id: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        w.pending_approvals
            .entry(run_id)
            .or_default()
            .insert(approval_id.to_string());
        Ok(())
    }

    async fn remove_pending_approval(&self, run_id: RunId, approval_id: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        if let Some(set) = w.pending_approvals.get_mut(&run_id) {
            set.remove(approval_id);
        }
        Ok(())
    }

    async fn pending_approvals(&self, run_id: RunId) -> Result<Vec<String>> {
        let r = self.inner.read().await;
        Ok(r.pending_approvals
            .get(&run_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_run_state(&self, run_id: RunId) -> Result<()> {
        let mut w = self.inner.write().await;
        w.ir.remove(&run_id);
        w.context.remove(&run_id);
        w.counters.remove(&run_id);
        w.applied.remove(&run_id);
        w.pending_approvals.remove(&run_id);
        w.loop_state.retain(|(r, _), _| *r != run_id);
        w.join_state.retain(|(r, _), _| *r != run_id);
        Ok(())
    }

    async fn publish_completion_event(&self, run_id: RunId) -> Result<()> {
        let _ = self.completion_tx.send(run_id);
        Ok(())
    }

    async fn next_completion_event(&self, timeout_ms: u64) -> Result<Option<RunId>> {
        let mut rx = self.completion_tx.subscribe();
        match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), rx.recv()).await {
            Ok(Ok(run_id)) => Ok(Some(run_id)),
            Ok(Err(_)) => Ok(None),
            Err(_) => Ok(None),
        }
    }

    async fn publish_ui_event(&self, username: &str, event: &UiEvent) -> Result<()> {
        let _ = self.ui_tx.send((username.to_string(), event.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consume_is_idempotent() {
        let store = MemoryHotStore::new();
        let run = RunId::new();
        store.init_run(run, 1).await.unwrap();
        let node: NodeId = "a".into();

        let first = store.consume(run, &node).await.unwrap();
        assert!(first.changed);
        assert!(first.hit_zero);
        assert_eq!(first.value, 0);

        let second = store.consume(run, &node).await.unwrap();
        assert!(!second.changed);
        assert_eq!(second.value, 0);
    }

    #[tokio::test]
    async fn emit_is_idempotent_per_emit_id() {
        let store = MemoryHotStore::new();
        let run = RunId::new();
        store.init_run(run, 0).await.unwrap();
        let from: NodeId = "a".into();

        let first = store.emit(run, &from, "e1", 3).await.unwrap();
        assert!(first.changed);
        assert_eq!(first.value, 3);

        let replay = store.emit(run, &from, "e1", 3).await.unwrap();
        assert!(!replay.changed);
        assert_eq!(replay.value, 3);

        let distinct = store.emit(run, &from, "e2", 2).await.unwrap();
        assert!(distinct.changed);
        assert_eq!(distinct.value, 5);
    }

    #[tokio::test]
    async fn join_completes_once_all_dependencies_arrive() {
        let store = MemoryHotStore::new();
        let run = RunId::new();
        let join: NodeId = "join".into();

        let a = store
            .join_arrive(run, &join, &"a".into(), 2)
            .await
            .unwrap();
        assert!(!a.complete);
        let b = store
            .join_arrive(run, &join, &"b".into(), 2)
            .await
            .unwrap();
        assert!(b.complete);

        // Redelivery from an already-arrived dependency does not inflate the count.
        let replay = store
            .join_arrive(run, &join, &"a".into(), 2)
            .await
            .unwrap();
        assert_eq!(replay.arrived, 2);
    }
}

//! The Counter Protocol (C3, §4.3): idempotent `consume`/`emit` over the
//! hot store's atomic transactions, plus the zero-detection that drives the
//! Completion Supervisor. This module adds no state of its own — see §9
//! "Atomicity of counter math": the mutation itself lives in `HotStore`,
//! this is just the typed, documented surface callers use instead of
//! poking `counter:{run_id}` directly.

use crate::error::CounterError;
use crate::hotstore::{CounterOutcome, HotStore};
use crate::ids::{NodeId, RunId};
use std::sync::Arc;

pub struct CounterProtocol<H: HotStore> {
    hot: Arc<H>,
}

impl<H: HotStore> CounterProtocol<H> {
    pub fn new(hot: Arc<H>) -> Self {
        Self { hot }
    }

    /// −1 for a node's completion signal. Idempotent per `(run_id, node_id)`
    /// — replaying the same signal any number of times leaves the counter
    /// and applied-set identical to one application (§8 property 2).
    pub async fn consume(&self, run_id: RunId, node_id: &NodeId) -> Result<CounterOutcome, CounterError> {
        self.hot
            .consume(run_id, node_id)
            .await
            .map_err(CounterError::Store)
    }

    /// +`to_nodes.len()` for a routing decision's fan-out. `emit_id` must be
    /// stable across retries of the *same* routing decision so redelivery
    /// stays a no-op (§4.3 "idempotent publish to streams must use the same
    /// emit_id").
    pub async fn emit(
        &self,
        run_id: RunId,
        from_node: &NodeId,
        to_nodes: &[NodeId],
        emit_id: &str,
    ) -> Result<CounterOutcome, CounterError> {
        self.hot
            .emit(run_id, from_node, emit_id, to_nodes.len() as i64)
            .await
            .map_err(CounterError::Store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotstore::memory::MemoryHotStore;

    #[tokio::test]
    async fn replaying_consume_does_not_double_decrement() {
        let hot = Arc::new(MemoryHotStore::new());
        let protocol = CounterProtocol::new(hot.clone());
        let run = RunId::new();
        hot.init_run(run, 2).await.unwrap();
        let node: NodeId = "a".into();

        let first = protocol.consume(run, &node).await.unwrap();
        assert_eq!(first.value, 1);
        let replay = protocol.consume(run, &node).await.unwrap();
        assert_eq!(replay.value, 1);
        assert!(!replay.changed);
    }

    #[tokio::test]
    async fn emit_reaching_zero_reports_hit_zero() {
        let hot = Arc::new(MemoryHotStore::new());
        let protocol = CounterProtocol::new(hot.clone());
        let run = RunId::new();
        hot.init_run(run, 1).await.unwrap();
        let node: NodeId = "a".into();

        let outcome = protocol.consume(run, &node).await.unwrap();
        assert!(outcome.hit_zero);
    }
}

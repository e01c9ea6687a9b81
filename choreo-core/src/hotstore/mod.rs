//! The hot store: single authority for counter, applied-set, IR, context,
//! loop/join scratch state and pub/sub (§3 "Run-Level Execution State", §5
//! "the hot store is the single authority"). Every mutation here is meant to
//! be a single atomic server-side transaction — callers never compare-and-set
//! in a loop (§9 "Atomicity of counter math").

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use crate::compiler::ir::Ir;
use crate::events::UiEvent;
use crate::ids::{NodeId, RunId};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Outcome of a counter mutation (`consume` or `emit`). `changed` is false
/// when the operation's key was already in the applied-set — the idempotent
/// no-op path (§4.3).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterOutcome {
    pub value: i64,
    pub changed: bool,
    pub hit_zero: bool,
}

/// Outcome of a join-barrier arrival (§4.4 "Join semantics").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JoinArrival {
    pub arrived: usize,
    pub expected: usize,
    pub complete: bool,
}

/// Outcome of incrementing a loop node's iteration counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopIncrement {
    pub iteration: u32,
    pub at_max: bool,
}

/// The hot store trait. The Coordinator, Counter Protocol, Patch
/// Materializer, and Completion Supervisor all operate exclusively through
/// this trait — never against a concrete backend — so Redis can stand in
/// for tests and vice versa.
#[async_trait]
pub trait HotStore: Send + Sync {
    /// Seed `counter:{run_id}` at run submission (§3 "initialized to the
    /// entry-node fan-in count").
    async fn init_run(&self, run_id: RunId, initial_counter: i64) -> Result<()>;

    async fn load_ir(&self, run_id: RunId) -> Result<Option<Ir>>;

    /// Full-object replace, written only by the Patch Materializer (§5
    /// "no partial updates").
    async fn store_ir(&self, run_id: RunId, ir: &Ir) -> Result<()>;

    async fn get_context(&self, run_id: RunId, key: &str) -> Result<Option<String>>;
    async fn set_context(&self, run_id: RunId, key: &str, cas_ref: &str) -> Result<()>;
    async fn all_context(&self, run_id: RunId) -> Result<HashMap<String, String>>;

    /// `op_key = consume:{run_id}:{node_id}`. At-most-once per §4.3.
    async fn consume(&self, run_id: RunId, node_id: &NodeId) -> Result<CounterOutcome>;

    /// `op_key = emit:{run_id}:{from_node}:{emit_id}`. At-most-once per §4.3.
    async fn emit(
        &self,
        run_id: RunId,
        from_node: &NodeId,
        emit_id: &str,
        count: i64,
    ) -> Result<CounterOutcome>;

    /// Current value of `counter:{run_id}` — used by the Completion
    /// Supervisor to re-check run-level completion (§4.4 step 10) without
    /// waiting on the pub/sub event.
    async fn counter_value(&self, run_id: RunId) -> Result<i64>;

    async fn loop_increment(
        &self,
        run_id: RunId,
        node_id: &NodeId,
        max_iterations: u32,
    ) -> Result<LoopIncrement>;
    async fn loop_clear(&self, run_id: RunId, node_id: &NodeId) -> Result<()>;

    async fn join_arrive(
        &self,
        run_id: RunId,
        node_id: &NodeId,
        from_node: &NodeId,
        expected: usize,
    ) -> Result<JoinArrival>;
    async fn join_reset(&self, run_id: RunId, node_id: &NodeId) -> Result<()>;

    async fn add_pending_approval(&self, run_id: RunId, approval_id: &str) -> Result<()>;
    async fn remove_pending_approval(&self, run_id: RunId, approval_id: &str) -> Result<()>;
    async fn pending_approvals(&self, run_id: RunId) -> Result<Vec<String>>;

    /// Deletes every `*:{run_id}` key. Only the Completion Supervisor calls
    /// this, and only once the run has terminated.
    async fn delete_run_state(&self, run_id: RunId) -> Result<()>;

    /// Publishes to the channel the Completion Supervisor subscribes to,
    /// fired exactly when a counter mutation transitions non-zero -> zero
    /// (§4.3 "Completion event").
    async fn publish_completion_event(&self, run_id: RunId) -> Result<()>;

    /// Blocks up to `timeout_ms` for the next completion event, returning
    /// `None` on timeout. The backstop the Completion Supervisor's
    /// background loop polls on — the Coordinator's own step-10 call to
    /// `CompletionSupervisor::evaluate` is the primary path, so a missed
    /// event here only delays cleanup, it never loses it (the next
    /// completion on the same run re-triggers step 10 anyway, and a
    /// terminal-node completion only fires once the counter is already
    /// zero).
    async fn next_completion_event(&self, timeout_ms: u64) -> Result<Option<RunId>>;

    /// `run:{username}` pub/sub channel (§6).
    async fn publish_ui_event(&self, username: &str, event: &UiEvent) -> Result<()>;
}

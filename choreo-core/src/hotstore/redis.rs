//! Redis-backed `HotStore`. Counter math and join arrival are each a single
//! `EVAL` of a Lua script — the "server-side transaction" the spec calls for
//! (§4.3, §9 "Atomicity of counter math": "do not attempt compare-and-set
//! loops in the coordinator; they race").

use super::{CounterOutcome, HotStore, JoinArrival, LoopIncrement};
use crate::compiler::ir::Ir;
use crate::events::UiEvent;
use crate::ids::{NodeId, RunId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;

const CONSUME_SCRIPT: &str = r#"
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1 then
  local cur = tonumber(redis.call('GET', KEYS[1]) or '0')
  return {cur, 0, 0}
end
redis.call('SADD', KEYS[2], ARGV[1])
local before = tonumber(redis.call('GET', KEYS[1]) or '0')
local new = redis.call('DECRBY', KEYS[1], 1)
local hit_zero = 0
if before ~= 0 and new == 0 then hit_zero = 1 end
return {new, 1, hit_zero}
"#;

const EMIT_SCRIPT: &str = r#"
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1 then
  local cur = tonumber(redis.call('GET', KEYS[1]) or '0')
  return {cur, 0, 0}
end
redis.call('SADD', KEYS[2], ARGV[1])
local before = tonumber(redis.call('GET', KEYS[1]) or '0')
local new = redis.call('INCRBY', KEYS[1], ARGV[2])
local hit_zero = 0
if before ~= 0 and new == 0 then hit_zero = 1 end
return {new, 1, hit_zero}
"#;

const LOOP_INCR_SCRIPT: &str = r#"
local new = redis.call('HINCRBY', KEYS[1], 'current_iteration', 1)
local at_max = 0
if new >= tonumber(ARGV[1]) then at_max = 1 end
return {new, at_max}
"#;

const JOIN_ARRIVE_SCRIPT: &str = r#"
redis.call('SADD', KEYS[1], ARGV[1])
local arrived = redis.call('SCARD', KEYS[1])
local complete = 0
if arrived >= tonumber(ARGV[2]) then complete = 1 end
return {arrived, complete}
"#;

/// Redis-backed implementation of `HotStore`. One multiplexed connection is
/// shared across all callers (`ConnectionManager` reconnects transparently);
/// pub/sub uses a dedicated connection per publish, matching how `redis-rs`
/// expects pub/sub to be used alongside a shared command connection.
pub struct RedisHotStore {
    conn: ConnectionManager,
    client: redis::Client,
    consume_script: redis::Script,
    emit_script: redis::Script,
    loop_incr_script: redis::Script,
    join_arrive_script: redis::Script,
}

impl RedisHotStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis URL")?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .context("failed to establish redis connection")?;
        Ok(Self {
            conn,
            client,
            consume_script: redis::Script::new(CONSUME_SCRIPT),
            emit_script: redis::Script::new(EMIT_SCRIPT),
            loop_incr_script: redis::Script::new(LOOP_INCR_SCRIPT),
            join_arrive_script: redis::Script::new(JOIN_ARRIVE_SCRIPT),
        })
    }

    fn ir_key(run_id: RunId) -> String {
        format!("ir:{run_id}")
    }
    fn context_key(run_id: RunId) -> String {
        format!("context:{run_id}")
    }
    fn counter_key(run_id: RunId) -> String {
        format!("counter:{run_id}")
    }
    fn applied_key(run_id: RunId) -> String {
        format!("applied:{run_id}")
    }
    fn loop_key(run_id: RunId, node_id: &NodeId) -> String {
        format!("loop:{run_id}:{node_id}")
    }
    fn join_key(run_id: RunId, node_id: &NodeId) -> String {
        format!("join:{run_id}:{node_id}")
    }
    fn pending_approvals_key(run_id: RunId) -> String {
        format!("pending_approvals:{run_id}")
    }
}

#[async_trait]
impl HotStore for RedisHotStore {
    async fn init_run(&self, run_id: RunId, initial_counter: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set(Self::counter_key(run_id), initial_counter).await?;
        Ok(())
    }

    async fn load_ir(&self, run_id: RunId) -> Result<Option<Ir>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::ir_key(run_id)).await?;
        Ok(match raw {
            Some(s) => Some(serde_json::from_str(&s).context("corrupt IR in hot store")?),
            None => None,
        })
    }

    async fn store_ir(&self, run_id: RunId, ir: &Ir) -> Result<()> {
        let mut conn = self.conn.clone();
        let serialized = serde_json::to_string(ir)?;
        conn.set(Self::ir_key(run_id), serialized).await?;
        Ok(())
    }

    async fn get_context(&self, run_id: RunId, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(Self::context_key(run_id), key).await?)
    }

    async fn set_context(&self, run_id: RunId, key: &str, cas_ref: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset(Self::context_key(run_id), key, cas_ref).await?;
        Ok(())
    }

    async fn all_context(&self, run_id: RunId) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(Self::context_key(run_id)).await?)
    }

    async fn consume(&self, run_id: RunId, node_id: &NodeId) -> Result<CounterOutcome> {
        let op_key = format!("consume:{run_id}:{node_id}");
        let mut conn = self.conn.clone();
        let (value, changed, hit_zero): (i64, i64, i64) = self
            .consume_script
            .key(Self::counter_key(run_id))
            .key(Self::applied_key(run_id))
            .arg(&op_key)
            .invoke_async(&mut conn)
            .await
            .context("consume script failed")?;
        let outcome = CounterOutcome {
            value,
            changed: changed == 1,
            hit_zero: hit_zero == 1,
        };
        if outcome.hit_zero {
            self.publish_completion_event(run_id).await?;
        }
        Ok(outcome)
    }

    async fn emit(
        &self,
        run_id: RunId,
        from_node: &NodeId,
        emit_id: &str,
        count: i64,
    ) -> Result<CounterOutcome> {
        let op_key = format!("emit:{run_id}:{from_node}:{emit_id}");
        let mut conn = self.conn.clone();
        let (value, changed, hit_zero): (i64, i64, i64) = self
            .emit_script
            .key(Self::counter_key(run_id))
            .key(Self::applied_key(run_id))
            .arg(&op_key)
            .arg(count)
            .invoke_async(&mut conn)
            .await
            .context("emit script failed")?;
        let outcome = CounterOutcome {
            value,
            changed: changed == 1,
            hit_zero: hit_zero == 1,
        };
        if outcome.hit_zero {
            self.publish_completion_event(run_id).await?;
        }
        Ok(outcome)
    }

    async fn counter_value(&self, run_id: RunId) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn.get(Self::counter_key(run_id)).await?;
        Ok(value.unwrap_or(0))
    }

    async fn loop_increment(
        &self,
        run_id: RunId,
        node_id: &NodeId,
        max_iterations: u32,
    ) -> Result<LoopIncrement> {
        let mut conn = self.conn.clone();
        let (iteration, at_max): (u32, i64) = self
            .loop_incr_script
            .key(Self::loop_key(run_id, node_id))
            .arg(max_iterations)
            .invoke_async(&mut conn)
            .await
            .context("loop increment script failed")?;
        Ok(LoopIncrement {
            iteration,
            at_max: at_max == 1,
        })
    }

    async fn loop_clear(&self, run_id: RunId, node_id: &NodeId) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del(Self::loop_key(run_id, node_id)).await?;
        Ok(())
    }

    async fn join_arrive(
        &self,
        run_id: RunId,
        node_id: &NodeId,
        from_node: &NodeId,
        expected: usize,
    ) -> Result<JoinArrival> {
        let mut conn = self.conn.clone();
        let (arrived, complete): (usize, i64) = self
            .join_arrive_script
            .key(Self::join_key(run_id, node_id))
            .arg(from_node.to_string())
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .context("join arrive script failed")?;
        Ok(JoinArrival {
            arrived,
            expected,
            complete: complete == 1,
        })
    }

    async fn join_reset(&self, run_id: RunId, node_id: &NodeId) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del(Self::join_key(run_id, node_id)).await?;
        Ok(())
    }

    async fn add_pending_approval(&self, run_id: RunId, approval_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.sadd(Self::pending_approvals_key(run_id), approval_id)
            .await?;
        Ok(())
    }

    async fn remove_pending_approval(&self, run_id: RunId, approval_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.srem(Self::pending_approvals_key(run_id), approval_id)
            .await?;
        Ok(())
    }

    async fn pending_approvals(&self, run_id: RunId) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(Self::pending_approvals_key(run_id)).await?)
    }

    /// §3 Lifecycle: "all run-scoped keys... deleted by the completion
    /// supervisor." The five fixed keys are a known name each; `loop:` and
    /// `join:` scratch keys are one per node that ever looped or joined in
    /// this run, so they're found by pattern scan instead of tracked
    /// separately, matching the in-memory backend's `retain` sweep.
    async fn delete_run_state(&self, run_id: RunId) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut keys = vec![
            Self::ir_key(run_id),
            Self::context_key(run_id),
            Self::counter_key(run_id),
            Self::applied_key(run_id),
            Self::pending_approvals_key(run_id),
        ];
        for pattern in [format!("loop:{run_id}:*"), format!("join:{run_id}:*")] {
            let mut iter: redis::AsyncIter<String> = conn.scan_match(&pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }
        conn.del(&keys[..]).await?;
        Ok(())
    }

    async fn publish_completion_event(&self, run_id: RunId) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.publish("completion_events", run_id.to_string())
            .await?;
        Ok(())
    }

    async fn publish_ui_event(&self, username: &str, event: &UiEvent) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(event)?;
        conn.publish(format!("run:{username}"), payload).await?;
        Ok(())
    }

    async fn next_completion_event(&self, timeout_ms: u64) -> Result<Option<RunId>> {
        use futures::StreamExt;
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe("completion_events").await?;
        let mut stream = pubsub.on_message();
        let wait = tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), stream.next()).await;
        match wait {
            Ok(Some(msg)) => {
                let payload: String = msg.get_payload()?;
                Ok(Some(payload.parse().context("malformed run id on completion_events")?))
            }
            Ok(None) | Err(_) => Ok(None),
        }
    }
}

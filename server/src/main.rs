use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use common::{
    config::SsConfig,
    upstream::{pool::SessionPool, telegram::TelegramUpstream, Upstream},
};
use server::{
    db::svc::MongoService,
    http::svc::HttpService,
    ingest::svc::IngestService,
    service::{SiphonService, SsmRegistry},
    stream::StreamEngine,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SsConfig::from_env()?;

    // the Debug impl masks every secret, so this is safe to log
    info!({ config = ?config }, "loaded configuration");

    // one authenticated upstream handle for the whole process; the http
    // and ingest services share it, and its background tasks run on this
    // same runtime
    let upstream: Arc<dyn Upstream> = TelegramUpstream::new(config.clone());
    upstream.start().await?;

    let pool = SessionPool::new(upstream.clone());
    let engine = StreamEngine::new(
        upstream.clone(),
        pool.clone(),
        Duration::from_secs(config.blob_timeout_secs),
    );

    let registry = SsmRegistry::new();
    let cancel = CancellationToken::new();

    // create() registers every sender before any service starts, so
    // startup order only matters for awaited dependencies
    let db_svc = MongoService::create(config.clone(), &registry);
    let ingest_svc = IngestService::create(config.clone(), &registry, upstream.clone());
    let http_svc = HttpService::create(
        config.clone(),
        &registry,
        upstream.clone(),
        engine,
        cancel.clone(),
    );

    db_svc.start(&registry).await?;
    ingest_svc.start(&registry).await?;
    http_svc.start(&registry).await?;

    info!("siphon is up");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = upstream.idle() => warn!("upstream handle closed, shutting down"),
    }

    // deterministic shutdown: stop accepting http connections, close the
    // upstream handle, drop the pooled sessions.  in-flight streams end
    // when their clients drop.
    cancel.cancel();
    upstream.close().await;
    pool.shutdown().await;

    Ok(())
}

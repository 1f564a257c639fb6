use std::sync::Arc;

use anyhow::{Context, Result};
use mongodb::{Client, Database};
use tracing::{info, instrument, warn, Level};

use crate::config::SsConfig;
use crate::redact::redact_url;

pub mod mongo;

// connect to the metadata database and make sure the indexes the query
// functions rely on exist
//
// index creation is idempotent; a failure here (stale permissions, older
// server) is worth a warning but should not keep the streamer down, since
// the primary lookup degrades to a collection scan rather than breaking
#[instrument(level = Level::DEBUG, skip(config))]
pub async fn connect(config: Arc<SsConfig>) -> Result<Database> {
    info!({ db = %redact_url(&config.db_url) }, "connecting to metadata database");

    let client = Client::with_uri_str(&config.db_url)
        .await
        .with_context(|| format!("failed to connect to {}", redact_url(&config.db_url)))?;

    let db = client.database(&config.db_name);

    if let Err(err) = mongo::ensure_indexes(&db).await {
        warn!({ error = %err }, "failed to verify metadata indexes");
    }

    Ok(db)
}

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use tracing::{debug, instrument};

use crate::http::{svc::HttpEndpoint, AppError};
use api::catalog::{
    CatalogEntry, CatalogQuery, CatalogResp, CATALOG_DEFAULT_PER_PAGE, CATALOG_MAX_PER_PAGE,
};
use api::stream_url;

// liveness probe for the uptime pinger and the container healthcheck
pub(super) async fn alive() -> &'static str {
    "siphon is up\n"
}

// small json listing of active records, newest first
#[instrument(skip_all)]
pub(super) async fn catalog(
    State(state): State<Arc<HttpEndpoint>>,
    Query(query): Query<CatalogQuery>,
) -> Result<Response, AppError> {
    let page = query.page.unwrap_or(0);
    let per_page = query
        .per_page
        .unwrap_or(CATALOG_DEFAULT_PER_PAGE)
        .clamp(1, CATALOG_MAX_PER_PAGE);

    debug!({ page, per_page }, "serving catalog page");

    let (total, files) = state.catalog_page(page, per_page).await?;

    let files = files
        .into_iter()
        .map(|file| CatalogEntry {
            stream_url: stream_url(&state.config.public_url, file.channel_id, file.msg_id),
            file,
        })
        .collect();

    Ok(Json(CatalogResp {
        page,
        per_page,
        total,
        files,
    })
    .into_response())
}

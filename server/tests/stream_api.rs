use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{body::Body, Router};
use http::{
    header::{
        ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE,
        RETRY_AFTER,
    },
    Request, StatusCode,
};
use http_body_util::BodyExt;
use tower::ServiceExt;

use api::{ArchivedFile, ChannelId, FileKind, FileSource, MsgId};
use common::{
    config::SsConfig,
    upstream::{
        mock::{Fault, MockUpstream},
        pool::SessionPool,
        Upstream, CHUNK,
    },
};
use server::{
    db::msg::DbMsg,
    http::svc::{build_router, HttpEndpoint},
    service::{ServiceType, Ssm, SsmRegistry},
    stream::StreamEngine,
};

const ARCHIVE: ChannelId = -100_500;

fn test_config() -> Arc<SsConfig> {
    Arc::new(SsConfig {
        api_id: 1,
        api_hash: "hash".to_string(),
        bot_token: "token".to_string(),
        archive_channel: ARCHIVE,
        db_url: "mongodb://localhost".to_string(),
        db_name: "siphon-test".to_string(),
        http_port: 0,
        public_url: "http://stream.test".to_string(),
        proxy_url: None,
        fetch_cookies: None,
        blob_timeout_secs: 5,
        max_file_bytes: 500 * 1024 * 1024,
        max_duration_secs: 7200,
        session_file: PathBuf::from("test.session"),
        scratch_dir: std::env::temp_dir(),
    })
}

fn record(msg_id: MsgId, size: u64, name: &str, active: bool) -> ArchivedFile {
    ArchivedFile {
        msg_id,
        channel_id: ARCHIVE,
        file_unique_id: format!("uniq-{msg_id}"),
        display_name: name.to_string(),
        size_bytes: size,
        mime_type: "video/mp4".to_string(),
        kind: FileKind::Video,
        duration_seconds: Some(60),
        quality_label: None,
        source: FileSource::DirectUpload,
        external_url: None,
        uploaded_by: 7,
        created_at: msg_id,
        is_active: active,
    }
}

// a channel-backed stand-in for the database service, answering the http
// endpoint's lookups from a fixture map
fn spawn_fake_db(registry: &SsmRegistry, records: Vec<ArchivedFile>) {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Ssm>(32);

    registry.insert(ServiceType::Db, tx).unwrap();

    let by_id: HashMap<(ChannelId, MsgId), ArchivedFile> = records
        .iter()
        .map(|file| ((file.channel_id, file.msg_id), file.clone()))
        .collect();

    tokio::task::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Ssm::Db(msg) = msg else { continue };

            match msg {
                DbMsg::GetByMsgId {
                    resp,
                    channel_id,
                    msg_id,
                } => {
                    let _ = resp.send(Ok(by_id.get(&(channel_id, msg_id)).cloned()));
                }
                DbMsg::CatalogPage {
                    resp,
                    page,
                    per_page,
                } => {
                    let mut active: Vec<_> =
                        by_id.values().filter(|f| f.is_active).cloned().collect();
                    active.sort_by_key(|f| std::cmp::Reverse(f.created_at));

                    let total = active.len() as u64;
                    let page_files: Vec<_> = active
                        .into_iter()
                        .skip((page * per_page) as usize)
                        .take(per_page as usize)
                        .collect();

                    let _ = resp.send(Ok((total, page_files)));
                }
                _ => {}
            }
        }
    });
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn router_over(upstream: &MockUpstream, records: Vec<ArchivedFile>) -> Router {
    let registry = SsmRegistry::new();
    spawn_fake_db(&registry, records);

    let handle = upstream.as_dyn();
    let pool = SessionPool::new(handle.clone());
    let engine = StreamEngine::new(handle.clone(), pool, Duration::from_secs(5));

    let endpoint =
        Arc::new(HttpEndpoint::new(test_config(), &registry, handle, engine).unwrap());

    build_router(endpoint)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn get_range(uri: &str, range: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(RANGE, range)
        .body(Body::empty())
        .unwrap()
}

fn header<'r>(resp: &'r http::Response<axum::body::Body>, name: http::header::HeaderName) -> &'r str {
    resp.headers()
        .get(&name)
        .unwrap_or_else(|| panic!("missing header {name}"))
        .to_str()
        .unwrap()
}

#[tokio::test]
async fn full_read_returns_every_byte_with_the_right_headers() {
    let data = pattern(1_500_000);
    let upstream = MockUpstream::new();
    upstream.add_file(ARCHIVE, 1, data.clone());

    let router = router_over(&upstream, vec![record(1, 1_500_000, "movie.mp4", true)]);

    let resp = router.oneshot(get("/stream/-100500/1")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header(&resp, CONTENT_LENGTH), "1500000");
    assert_eq!(header(&resp, ACCEPT_RANGES), "bytes");
    assert_eq!(header(&resp, CONTENT_TYPE), "video/mp4");
    assert_eq!(
        header(&resp, CONTENT_DISPOSITION),
        "inline; filename=\"movie.mp4\""
    );

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.len(), 1_500_000);
    assert_eq!(&body[..], &data[..]);
}

#[tokio::test]
async fn range_spanning_a_chunk_boundary_is_byte_exact() {
    let data = pattern(1_500_000);
    let upstream = MockUpstream::new();
    upstream.add_file(ARCHIVE, 1, data.clone());

    let router = router_over(&upstream, vec![record(1, 1_500_000, "movie.mp4", true)]);

    let resp = router
        .oneshot(get_range("/stream/-100500/1", "bytes=500000-1000000"))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header(&resp, CONTENT_LENGTH), "500001");
    assert_eq!(
        header(&resp, CONTENT_RANGE),
        "bytes 500000-1000000/1500000"
    );

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], &data[500_000..=1_000_000]);

    // the span begins inside chunk 0 and ends inside chunk 1
    assert_eq!(
        upstream
            .fetched_chunks()
            .iter()
            .map(|(_, c)| *c)
            .collect::<Vec<_>>(),
        vec![0, 1]
    );
}

#[tokio::test]
async fn chunk_aligned_range_skips_the_first_chunk_entirely() {
    let data = pattern(1_500_000);
    let upstream = MockUpstream::new();
    upstream.add_file(ARCHIVE, 1, data.clone());

    let router = router_over(&upstream, vec![record(1, 1_500_000, "movie.mp4", true)]);

    let resp = router
        .oneshot(get_range("/stream/-100500/1", "bytes=1048576-1499999"))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header(&resp, CONTENT_LENGTH), "451424");
    assert_eq!(
        header(&resp, CONTENT_RANGE),
        "bytes 1048576-1499999/1500000"
    );

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], &data[1_048_576..]);

    assert_eq!(
        upstream
            .fetched_chunks()
            .iter()
            .map(|(_, c)| *c)
            .collect::<Vec<_>>(),
        vec![1]
    );
}

#[tokio::test]
async fn tail_range_inside_the_second_chunk() {
    let data = pattern(1_500_000);
    let upstream = MockUpstream::new();
    upstream.add_file(ARCHIVE, 1, data.clone());

    let router = router_over(&upstream, vec![record(1, 1_500_000, "movie.mp4", true)]);

    let resp = router
        .oneshot(get_range("/stream/-100500/1", "bytes=1400000-1499999"))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header(&resp, CONTENT_LENGTH), "100000");

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], &data[1_400_000..]);
}

#[tokio::test]
async fn ranges_past_the_end_are_unsatisfiable() {
    let upstream = MockUpstream::new();
    upstream.add_file(ARCHIVE, 1, pattern(1_500_000));

    let router = router_over(&upstream, vec![record(1, 1_500_000, "movie.mp4", true)]);

    for range in ["bytes=1600000-1700000", "bytes=5-2", "bytes=0-1,5-6"] {
        let resp = router
            .clone()
            .oneshot(get_range("/stream/-100500/1", range))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE, "{range}");
        assert_eq!(header(&resp, CONTENT_RANGE), "bytes */1500000", "{range}");
    }

    // range negotiation happens before any upstream traffic
    assert!(upstream.fetched_chunks().is_empty());
}

#[tokio::test]
async fn unknown_files_return_404_without_touching_the_upstream() {
    let upstream = MockUpstream::new();
    let router = router_over(&upstream, vec![]);

    let resp = router.oneshot(get("/stream/-100500/99")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(upstream.get_message_calls(), 0);
    assert!(upstream.fetched_chunks().is_empty());
}

#[tokio::test]
async fn soft_deleted_files_are_hidden_from_the_stream_endpoint() {
    let upstream = MockUpstream::new();
    upstream.add_file(ARCHIVE, 2, pattern(100));

    let router = router_over(&upstream, vec![record(2, 100, "gone.mp4", false)]);

    let resp = router.oneshot(get("/stream/-100500/2")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(upstream.get_message_calls(), 0);
}

#[tokio::test]
async fn head_requests_carry_headers_but_never_open_a_stream() {
    let upstream = MockUpstream::new();
    upstream.add_file(ARCHIVE, 1, pattern(1_500_000));

    let router = router_over(&upstream, vec![record(1, 1_500_000, "movie.mp4", true)]);

    let resp = router
        .oneshot(
            Request::builder()
                .method("HEAD")
                .uri("/stream/-100500/1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header(&resp, CONTENT_LENGTH), "1500000");
    assert_eq!(header(&resp, ACCEPT_RANGES), "bytes");

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert!(body.is_empty());

    assert_eq!(upstream.get_message_calls(), 0);
    assert!(upstream.fetched_chunks().is_empty());
}

#[tokio::test]
async fn disconnected_upstream_answers_503_with_retry_after() {
    let upstream = MockUpstream::new();
    upstream.add_file(ARCHIVE, 1, pattern(100));

    let router = router_over(&upstream, vec![record(1, 100, "movie.mp4", true)]);

    upstream.close().await;

    let resp = router.oneshot(get("/stream/-100500/1")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(header(&resp, RETRY_AFTER), "5");
}

#[tokio::test]
async fn expired_reference_mid_stream_heals_invisibly() {
    let total = 3 * CHUNK;
    let data = pattern(total as usize);
    let upstream = MockUpstream::new();
    upstream.add_file(ARCHIVE, 6, data.clone());

    upstream.inject_fault(Fault::ExpireReference {
        channel_id: ARCHIVE,
        msg_id: 6,
        at_chunk: 1,
    });

    let router = router_over(&upstream, vec![record(6, total, "long.mp4", true)]);

    let resp = router.oneshot(get("/stream/-100500/6")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], &data[..]);

    // one resolve to start, one to heal
    assert_eq!(upstream.get_message_calls(), 2);
}

#[tokio::test]
async fn quoted_display_names_are_sanitized_in_the_disposition() {
    let upstream = MockUpstream::new();
    upstream.add_file(ARCHIVE, 3, pattern(10));

    let router = router_over(
        &upstream,
        vec![record(3, 10, "a\"quoted\" name.mp4", true)],
    );

    let resp = router.oneshot(get("/stream/-100500/3")).await.unwrap();

    assert_eq!(
        header(&resp, CONTENT_DISPOSITION),
        "inline; filename=\"aquoted name.mp4\""
    );
}

#[tokio::test]
async fn catalog_lists_active_records_with_links() {
    let upstream = MockUpstream::new();

    let router = router_over(
        &upstream,
        vec![
            record(1, 100, "one.mp4", true),
            record(2, 200, "two.mp4", true),
            record(3, 300, "hidden.mp4", false),
        ],
    );

    let resp = router.oneshot(get("/api/catalog")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(doc["total"], 2);
    assert_eq!(doc["files"].as_array().unwrap().len(), 2);

    // newest first, with synthesized links
    assert_eq!(doc["files"][0]["msg_id"], 2);
    assert_eq!(
        doc["files"][0]["stream_url"],
        "http://stream.test/stream/-100500/2"
    );
}

#[tokio::test]
async fn catalog_clamps_page_size() {
    let upstream = MockUpstream::new();

    let records: Vec<_> = (1..=150)
        .map(|i| record(i, 100, &format!("f{i}.mp4"), true))
        .collect();

    let router = router_over(&upstream, records);

    let resp = router
        .oneshot(get("/api/catalog?page=0&per_page=5000"))
        .await
        .unwrap();

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(doc["per_page"], 100);
    assert_eq!(doc["files"].as_array().unwrap().len(), 100);
    assert_eq!(doc["total"], 150);
}

#[tokio::test]
async fn liveness_probe_answers() {
    let upstream = MockUpstream::new();
    let router = router_over(&upstream, vec![]);

    let resp = router.oneshot(get("/")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert!(!body.is_empty());
}

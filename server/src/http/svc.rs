use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_cell::sync::AsyncCell;
use async_trait::async_trait;
use axum::{
    extract::Request,
    http::header::RANGE,
    routing::get,
    Router,
};
use http::Method;
use regex::Regex;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tower::Service;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, instrument, Level};

use crate::{
    db::msg::DbMsg,
    http::{
        api::{alive, catalog},
        range::range_regex,
        stream::stream_file,
    },
    service::{SiphonService, SsInner, Ssm, SsmReceiver, SsmRegistry, SsmSender, ServiceType},
    stream::StreamEngine,
};
use api::{ArchivedFile, ChannelId, MsgId};
use common::{config::SsConfig, upstream::Upstream};

// http service
//
// the read path of the whole system: control-plane lookups go through the
// database service, the data plane (blob streaming) runs directly against
// the shared upstream handle exactly like the metadata says it should
#[derive(Clone)]
pub struct HttpEndpoint {
    pub config: Arc<SsConfig>,
    pub upstream: Arc<dyn Upstream>,
    pub engine: Arc<StreamEngine>,
    db_svc_sender: SsmSender,
    registry: SsmRegistry,
    // compiled once; the parser is on the hot path
    pub range_regex: Regex,
}

impl HttpEndpoint {
    pub fn new(
        config: Arc<SsConfig>,
        registry: &SsmRegistry,
        upstream: Arc<dyn Upstream>,
        engine: Arc<StreamEngine>,
    ) -> Result<Self> {
        Ok(HttpEndpoint {
            config,
            upstream,
            engine,
            db_svc_sender: registry.get(&ServiceType::Db)?,
            registry: registry.clone(),
            range_regex: range_regex(),
        })
    }

    pub(super) async fn get_file(
        &self,
        channel_id: ChannelId,
        msg_id: MsgId,
    ) -> Result<Option<ArchivedFile>> {
        let (tx, rx) = oneshot::channel();

        self.db_svc_sender
            .send(
                DbMsg::GetByMsgId {
                    resp: tx,
                    channel_id,
                    msg_id,
                }
                .into(),
            )
            .await
            .context("failed to send GetByMsgId message from http")?;

        rx.await
            .context("failed to receive GetByMsgId response at http")?
    }

    pub(super) async fn catalog_page(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<(u64, Vec<ArchivedFile>)> {
        let (tx, rx) = oneshot::channel();

        self.db_svc_sender
            .send(
                DbMsg::CatalogPage {
                    resp: tx,
                    page,
                    per_page,
                }
                .into(),
            )
            .await
            .context("failed to send CatalogPage message from http")?;

        rx.await
            .context("failed to receive CatalogPage response at http")?
    }
}

#[async_trait]
impl SsInner for HttpEndpoint {
    fn registry(&self) -> SsmRegistry {
        self.registry.clone()
    }

    async fn message_handler(&self, ssm: Ssm) -> Result<()> {
        match ssm {
            _ => Err(anyhow::Error::msg("not implemented")),
        }
    }
}

pub fn build_router(state: Arc<HttpEndpoint>) -> Router {
    // players run from file:// and arbitrary origins; Range must be
    // allowed through and the byte-accounting headers exposed back
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD])
        .allow_headers([RANGE])
        .expose_headers(Any);

    Router::new()
        .route("/", get(alive))
        .route("/api/catalog", get(catalog))
        .route("/stream/{channel_id}/{msg_id}", get(stream_file))
        .layer(cors)
        .with_state(state)
}

pub struct HttpService {
    config: Arc<SsConfig>,
    upstream: Arc<dyn Upstream>,
    engine: Arc<StreamEngine>,
    cancel: CancellationToken,
    receiver: Arc<Mutex<SsmReceiver>>,
    msg_handle: AsyncCell<tokio::task::JoinHandle<Result<()>>>,
    hyper_handle: AsyncCell<tokio::task::JoinHandle<Result<()>>>,
}

impl HttpService {
    pub fn create(
        config: Arc<SsConfig>,
        registry: &SsmRegistry,
        upstream: Arc<dyn Upstream>,
        engine: Arc<StreamEngine>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = tokio::sync::mpsc::channel::<Ssm>(32);

        registry
            .insert(ServiceType::Http, tx)
            .expect("failed to add http sender to registry");

        HttpService {
            config,
            upstream,
            engine,
            cancel,
            receiver: Arc::new(Mutex::new(rx)),
            msg_handle: AsyncCell::new(),
            hyper_handle: AsyncCell::new(),
        }
    }
}

#[async_trait]
impl SiphonService for HttpService {
    type Inner = HttpEndpoint;

    #[instrument(level = Level::DEBUG, skip(self, registry))]
    async fn start(&self, registry: &SsmRegistry) -> Result<()> {
        info!("starting http service");

        let receiver = Arc::clone(&self.receiver);
        let state = Arc::new(HttpEndpoint::new(
            self.config.clone(),
            registry,
            self.upstream.clone(),
            self.engine.clone(),
        )?);

        let socket = SocketAddr::from(SocketAddrV4::new(
            Ipv4Addr::new(0, 0, 0, 0),
            self.config.http_port,
        ));

        let hyper_handle =
            tokio::task::spawn(serve_http(socket, Arc::clone(&state), self.cancel.clone()));

        self.hyper_handle.set(hyper_handle);

        let msg_serve = {
            async move {
                let mut receiver = receiver.lock().await;

                while let Some(msg) = receiver.recv().await {
                    let state = Arc::clone(&state);
                    tokio::task::spawn(async move {
                        match state.message_handler(msg).await {
                            Ok(()) => (),
                            Err(err) => {
                                error!({service = "http", channel = "ssm", error = %err})
                            }
                        }
                    });
                }

                Err(anyhow::Error::msg("http service ssm channel disconnected"))
            }
        };

        self.msg_handle.set(tokio::task::spawn(msg_serve));

        debug!("started http service");
        Ok(())
    }
}

async fn serve_http(
    socket: SocketAddr,
    state: Arc<HttpEndpoint>,
    cancel: CancellationToken,
) -> Result<()> {
    let router = build_router(state);

    let service = hyper::service::service_fn(move |request: Request<hyper::body::Incoming>| {
        router.clone().call(request)
    });

    let listener = tokio::net::TcpListener::bind(socket)
        .await
        .with_context(|| format!("failed to bind {socket}"))?;

    info!({ socket = %socket }, "http server listening");

    // the main http accept loop; shutdown stops accepting while in-flight
    // streams end when their clients drop
    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = cancel.cancelled() => break,
        };

        let service = service.clone();
        let io = hyper_util::rt::TokioIo::new(stream);

        tokio::task::spawn(async move {
            match hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                .serve_connection(io, service.clone())
                .await
            {
                Ok(()) => (),
                Err(err) => debug!({ error = %err }, "connection closed with error"),
            }
        });
    }

    info!("http server stopped accepting connections");
    Ok(())
}

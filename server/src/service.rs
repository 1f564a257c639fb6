use std::{future::Future, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

// these are the services that make up the siphon backend
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum ServiceType {
    Db,
    Http,
    Ingest,
}

// Siphon Service Messages
//
// without higher-kinded types, we use the normal enum-of-enums to enable
// general safe message passing between services
pub type SsmSender = tokio::sync::mpsc::Sender<Ssm>;
pub type SsmReceiver = tokio::sync::mpsc::Receiver<Ssm>;

// message responses are carried back via oneshot channels.  this type
// eliminates quite a bit of boilerplate in the responder logic.
pub type SsmResp<T> = tokio::sync::oneshot::Sender<Result<T>>;

#[derive(Debug)]
pub enum Ssm {
    Db(crate::db::msg::DbMsg),
    Http(crate::http::msg::HttpMsg),
    Ingest(crate::ingest::msg::IngestMsg),
}

// service registry
//
// each service is instantiated once and registers its sender at create()
// time, so start() order only matters for dependencies that are actually
// awaited.  services cache senders by cloning them out of the registry.
#[derive(Clone, Debug)]
pub struct SsmRegistry(Arc<DashMap<ServiceType, SsmSender>>);

impl Default for SsmRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SsmRegistry {
    pub fn new() -> Self {
        SsmRegistry(Arc::new(DashMap::new()))
    }

    pub fn insert(&self, k: ServiceType, v: SsmSender) -> Result<()> {
        match self.0.insert(k.clone(), v) {
            None => Ok(()),
            Some(w) => {
                self.0.insert(k, w);
                Err(anyhow::Error::msg(
                    "internal error: a sender was added twice to the registry",
                ))
            }
        }
    }

    pub fn get(&self, k: &ServiceType) -> Result<SsmSender> {
        Ok(self
            .0
            .get(k)
            .ok_or_else(|| {
                anyhow::Error::msg(format!(
                    "internal error: a service was started without a necessary dependency ({k:?})"
                ))
            })?
            .clone())
    }
}

// core service trait
//
// construction is deliberately left out: each service has an inherent
// create() taking exactly the handles it needs (the database service wants
// nothing beyond the config, the http and ingest services get the upstream
// handle injected), and registers its sender there.
#[async_trait]
pub trait SiphonService: Send + Sync + 'static {
    type Inner: SsInner;

    async fn start(&self, registry: &SsmRegistry) -> Result<()>;
}

// service message responder
//
// the magic of the service model is in the message_handler rpc function;
// services may respond to external traffic on other channels (http, bot
// updates) as well.
#[async_trait]
pub trait SsInner: Sized + Send + Sync + 'static {
    fn registry(&self) -> SsmRegistry;

    async fn message_handler(&self, ssm: Ssm) -> Result<()>;

    // rather than have the inner service trait functions (i.e., the rpc
    // calls) respond directly, we define this helper for the
    // message_handler loop so the rpc functions can call each other
    // without any weird Option<resp> plumbing
    async fn respond<T, Fut>(&self, resp: SsmResp<T>, fut: Fut) -> Result<()>
    where
        T: Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        resp.send(fut.await).map_err(|_| {
            anyhow::Error::msg(format!(
                "failed to respond to a {} message",
                std::any::type_name::<T>()
            ))
        })
    }
}

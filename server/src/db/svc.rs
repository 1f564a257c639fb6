use std::sync::Arc;

use anyhow::Result;
use async_cell::sync::AsyncCell;
use async_trait::async_trait;
use mongodb::Database;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, Level};

use crate::{
    db::{msg::DbMsg, SsDbService},
    service::{SiphonService, SsInner, Ssm, SsmReceiver, SsmRegistry, ServiceType},
};
use api::{ArchivedFile, ChannelId, MsgId, UserId};
use common::{config::SsConfig, db::mongo};

// database service
//
// a thin asynchronous wrapper around the document database: the actual
// queries live in common::db::mongo, this service only does the message
// plumbing so other services never hold the database handle directly
pub struct MongoService {
    config: Arc<SsConfig>,
    receiver: Arc<Mutex<SsmReceiver>>,
    handle: AsyncCell<tokio::task::JoinHandle<Result<()>>>,
}

impl MongoService {
    pub fn create(config: Arc<SsConfig>, registry: &SsmRegistry) -> Self {
        let (tx, rx) = tokio::sync::mpsc::channel::<Ssm>(1024);

        registry
            .insert(ServiceType::Db, tx)
            .expect("failed to add db sender to registry");

        MongoService {
            config,
            receiver: Arc::new(Mutex::new(rx)),
            handle: AsyncCell::new(),
        }
    }
}

#[async_trait]
impl SiphonService for MongoService {
    type Inner = MongoState;

    #[instrument(level = Level::DEBUG, skip(self, registry))]
    async fn start(&self, registry: &SsmRegistry) -> Result<()> {
        info!("starting database service");

        let db = common::db::connect(self.config.clone()).await?;

        let receiver = Arc::clone(&self.receiver);
        let state = Arc::new(MongoState {
            registry: registry.clone(),
            db,
        });

        let serve = {
            async move {
                let mut receiver = receiver.lock().await;

                while let Some(msg) = receiver.recv().await {
                    let state = Arc::clone(&state);
                    tokio::task::spawn(async move {
                        match state.message_handler(msg).await {
                            Ok(()) => (),
                            Err(err) => {
                                error!({service = "db", channel = "ssm", error = %err})
                            }
                        }
                    });
                }

                Err(anyhow::Error::msg("db service ssm channel disconnected"))
            }
        };

        self.handle.set(tokio::task::spawn(serve));

        debug!("started database service");
        Ok(())
    }
}

pub struct MongoState {
    registry: SsmRegistry,
    db: Database,
}

#[async_trait]
impl SsInner for MongoState {
    fn registry(&self) -> SsmRegistry {
        self.registry.clone()
    }

    async fn message_handler(&self, ssm: Ssm) -> Result<()> {
        match ssm {
            Ssm::Db(message) => match message {
                DbMsg::PutFile { resp, file } => self.respond(resp, self.put_file(file)).await,
                DbMsg::GetByMsgId {
                    resp,
                    channel_id,
                    msg_id,
                } => {
                    self.respond(resp, self.get_by_msg_id(channel_id, msg_id))
                        .await
                }
                DbMsg::GetByUniqueId { resp, unique_id } => {
                    self.respond(resp, self.get_by_unique_id(unique_id)).await
                }
                DbMsg::ListByUser {
                    resp,
                    user_id,
                    page,
                    per_page,
                } => {
                    self.respond(resp, self.list_by_user(user_id, page, per_page))
                        .await
                }
                DbMsg::SearchByUser {
                    resp,
                    user_id,
                    query,
                } => self.respond(resp, self.search_by_user(user_id, query)).await,
                DbMsg::SoftDelete {
                    resp,
                    channel_id,
                    msg_id,
                    user_id,
                } => {
                    self.respond(resp, self.soft_delete(channel_id, msg_id, user_id))
                        .await
                }
                DbMsg::CatalogPage {
                    resp,
                    page,
                    per_page,
                } => self.respond(resp, self.catalog_page(page, per_page)).await,
                DbMsg::UpsertUser { resp, user_id } => {
                    self.respond(resp, self.upsert_user(user_id)).await
                }
            },
            _ => Err(anyhow::Error::msg("not implemented")),
        }
    }
}

#[async_trait]
impl SsDbService for MongoState {
    async fn put_file(&self, file: ArchivedFile) -> Result<()> {
        mongo::put_file(&self.db, &file).await
    }

    async fn get_by_msg_id(
        &self,
        channel_id: ChannelId,
        msg_id: MsgId,
    ) -> Result<Option<ArchivedFile>> {
        mongo::get_by_msg_id(&self.db, channel_id, msg_id).await
    }

    async fn get_by_unique_id(&self, unique_id: String) -> Result<Option<ArchivedFile>> {
        mongo::get_by_unique_id(&self.db, &unique_id).await
    }

    async fn list_by_user(
        &self,
        user_id: UserId,
        page: u64,
        per_page: u64,
    ) -> Result<Vec<ArchivedFile>> {
        mongo::list_by_user(&self.db, user_id, page, per_page).await
    }

    async fn search_by_user(&self, user_id: UserId, query: String) -> Result<Vec<ArchivedFile>> {
        mongo::search_by_user(&self.db, user_id, &query).await
    }

    async fn soft_delete(
        &self,
        channel_id: ChannelId,
        msg_id: MsgId,
        user_id: UserId,
    ) -> Result<bool> {
        mongo::soft_delete(&self.db, channel_id, msg_id, user_id).await
    }

    async fn catalog_page(&self, page: u64, per_page: u64) -> Result<(u64, Vec<ArchivedFile>)> {
        mongo::catalog_page(&self.db, page, per_page).await
    }

    async fn upsert_user(&self, user_id: UserId) -> Result<()> {
        mongo::upsert_user(&self.db, user_id).await
    }
}

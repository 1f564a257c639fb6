use anyhow::Result;
use async_trait::async_trait;

use crate::service::SsInner;
use api::{ArchivedFile, ChannelId, MsgId, UserId};

pub mod msg;
pub mod svc;

// these are the metadata rpc calls every database backend must process
#[async_trait]
pub trait SsDbService: SsInner {
    async fn put_file(&self, file: ArchivedFile) -> Result<()>;

    async fn get_by_msg_id(
        &self,
        channel_id: ChannelId,
        msg_id: MsgId,
    ) -> Result<Option<ArchivedFile>>;

    async fn get_by_unique_id(&self, unique_id: String) -> Result<Option<ArchivedFile>>;

    async fn list_by_user(
        &self,
        user_id: UserId,
        page: u64,
        per_page: u64,
    ) -> Result<Vec<ArchivedFile>>;

    async fn search_by_user(&self, user_id: UserId, query: String) -> Result<Vec<ArchivedFile>>;

    async fn soft_delete(
        &self,
        channel_id: ChannelId,
        msg_id: MsgId,
        user_id: UserId,
    ) -> Result<bool>;

    async fn catalog_page(&self, page: u64, per_page: u64) -> Result<(u64, Vec<ArchivedFile>)>;

    async fn upsert_user(&self, user_id: UserId) -> Result<()>;
}

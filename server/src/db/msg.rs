use crate::service::{Ssm, SsmResp};
use api::{ArchivedFile, ChannelId, MsgId, UserId};

#[derive(Debug)]
pub enum DbMsg {
    PutFile {
        resp: SsmResp<()>,
        file: ArchivedFile,
    },
    GetByMsgId {
        resp: SsmResp<Option<ArchivedFile>>,
        channel_id: ChannelId,
        msg_id: MsgId,
    },
    GetByUniqueId {
        resp: SsmResp<Option<ArchivedFile>>,
        unique_id: String,
    },
    ListByUser {
        resp: SsmResp<Vec<ArchivedFile>>,
        user_id: UserId,
        page: u64,
        per_page: u64,
    },
    SearchByUser {
        resp: SsmResp<Vec<ArchivedFile>>,
        user_id: UserId,
        query: String,
    },
    SoftDelete {
        resp: SsmResp<bool>,
        channel_id: ChannelId,
        msg_id: MsgId,
        user_id: UserId,
    },
    CatalogPage {
        resp: SsmResp<(u64, Vec<ArchivedFile>)>,
        page: u64,
        per_page: u64,
    },
    UpsertUser {
        resp: SsmResp<()>,
        user_id: UserId,
    },
}

impl From<DbMsg> for Ssm {
    fn from(msg: DbMsg) -> Self {
        Ssm::Db(msg)
    }
}

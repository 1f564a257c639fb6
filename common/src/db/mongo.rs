use anyhow::Result;
use chrono::Local;
use futures::TryStreamExt;
use mongodb::bson::doc;
use mongodb::options::IndexOptions;
use mongodb::{Database, IndexModel};
use serde::{Deserialize, Serialize};

use api::{ArchivedFile, ChannelId, MsgId, UserId};

const FILES: &str = "files";
const USERS: &str = "users";

// first-seen uploader record; deliberately tiny
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VaultUser {
    pub user_id: UserId,
    pub first_seen: i64,
}

pub async fn ensure_indexes(db: &Database) -> Result<()> {
    let files = db.collection::<ArchivedFile>(FILES);

    files
        .create_index(
            IndexModel::builder()
                .keys(doc! { "channel_id": 1, "msg_id": 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build(),
        )
        .await?;

    files
        .create_index(IndexModel::builder().keys(doc! { "uploaded_by": 1 }).build())
        .await?;

    files
        .create_index(IndexModel::builder().keys(doc! { "created_at": -1 }).build())
        .await?;

    files
        .create_index(
            IndexModel::builder()
                .keys(doc! { "display_name": "text" })
                .build(),
        )
        .await?;

    let users = db.collection::<VaultUser>(USERS);

    users
        .create_index(
            IndexModel::builder()
                .keys(doc! { "user_id": 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build(),
        )
        .await?;

    Ok(())
}

// idempotent upsert keyed by (channel_id, msg_id) -- re-ingesting the same
// archived message must not duplicate the record
pub async fn put_file(db: &Database, file: &ArchivedFile) -> Result<()> {
    db.collection::<ArchivedFile>(FILES)
        .replace_one(
            doc! { "channel_id": file.channel_id, "msg_id": file.msg_id },
            file,
        )
        .upsert(true)
        .await?;

    Ok(())
}

pub async fn get_by_msg_id(
    db: &Database,
    channel_id: ChannelId,
    msg_id: MsgId,
) -> Result<Option<ArchivedFile>> {
    let file = db
        .collection::<ArchivedFile>(FILES)
        .find_one(doc! { "channel_id": channel_id, "msg_id": msg_id })
        .await?;

    Ok(file)
}

// dedup lookup: the platform file id is stable across re-uploads, so a hit
// here means the payload is already archived
pub async fn get_by_unique_id(db: &Database, unique_id: &str) -> Result<Option<ArchivedFile>> {
    let file = db
        .collection::<ArchivedFile>(FILES)
        .find_one(doc! { "file_unique_id": unique_id, "is_active": true })
        .await?;

    Ok(file)
}

pub async fn list_by_user(
    db: &Database,
    user_id: UserId,
    page: u64,
    per_page: u64,
) -> Result<Vec<ArchivedFile>> {
    let files = db
        .collection::<ArchivedFile>(FILES)
        .find(doc! { "uploaded_by": user_id, "is_active": true })
        .sort(doc! { "created_at": -1 })
        .skip(page * per_page)
        .limit(per_page as i64)
        .await?
        .try_collect()
        .await?;

    Ok(files)
}

pub async fn search_by_user(
    db: &Database,
    user_id: UserId,
    query: &str,
) -> Result<Vec<ArchivedFile>> {
    let files = db
        .collection::<ArchivedFile>(FILES)
        .find(doc! {
            "uploaded_by": user_id,
            "is_active": true,
            "$text": { "$search": query },
        })
        .sort(doc! { "created_at": -1 })
        .limit(50)
        .await?
        .try_collect()
        .await?;

    Ok(files)
}

// soft delete scoped to the uploader; the archived message itself is never
// touched and msg_id / file_unique_id stay as they are
pub async fn soft_delete(
    db: &Database,
    channel_id: ChannelId,
    msg_id: MsgId,
    user_id: UserId,
) -> Result<bool> {
    let result = db
        .collection::<ArchivedFile>(FILES)
        .update_one(
            doc! { "channel_id": channel_id, "msg_id": msg_id, "uploaded_by": user_id },
            doc! { "$set": { "is_active": false } },
        )
        .await?;

    Ok(result.matched_count > 0)
}

pub async fn catalog_page(
    db: &Database,
    page: u64,
    per_page: u64,
) -> Result<(u64, Vec<ArchivedFile>)> {
    let files = db.collection::<ArchivedFile>(FILES);

    let total = files.count_documents(doc! { "is_active": true }).await?;

    let page_files = files
        .find(doc! { "is_active": true })
        .sort(doc! { "created_at": -1 })
        .skip(page * per_page)
        .limit(per_page as i64)
        .await?
        .try_collect()
        .await?;

    Ok((total, page_files))
}

pub async fn upsert_user(db: &Database, user_id: UserId) -> Result<()> {
    db.collection::<VaultUser>(USERS)
        .update_one(
            doc! { "user_id": user_id },
            doc! { "$setOnInsert": { "user_id": user_id, "first_seen": Local::now().timestamp() } },
        )
        .upsert(true)
        .await?;

    Ok(())
}

use serde::{Deserialize, Serialize};

// structs and types

pub type ChannelId = i64;
pub type MsgId = i64;
pub type UserId = i64;

// the broad media classes the streamer cares about -- everything else that
// lands in the archive channel is treated as a plain document
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Video,
    Audio,
    Document,
}

impl FileKind {
    pub fn from_mime(mime: &str) -> Self {
        match mime.split('/').next() {
            Some("video") => FileKind::Video,
            Some("audio") => FileKind::Audio,
            _ => FileKind::Document,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSource {
    DirectUpload,
    ExternalUrl,
}

// the central indexed record: one archived message in the private channel,
// addressed publicly by (channel_id, msg_id)
//
// size_bytes is authoritative -- the http layer validates ranges and sets
// Content-Length from it without touching the upstream
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchivedFile {
    pub msg_id: MsgId,
    pub channel_id: ChannelId,
    pub file_unique_id: String,
    pub display_name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub kind: FileKind,
    pub duration_seconds: Option<u32>,
    pub quality_label: Option<String>,
    pub source: FileSource,
    pub external_url: Option<String>,
    pub uploaded_by: UserId,
    pub created_at: i64,
    pub is_active: bool,
}

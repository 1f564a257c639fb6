pub mod catalog;
pub mod file;

pub use file::{ArchivedFile, ChannelId, FileKind, FileSource, MsgId, UserId};

pub const STREAM_PATH: &str = "stream";

// public stream links embed the archive channel and message ids directly,
// so both segments must survive a round trip through i64 parsing
pub fn stream_url(base: &str, channel_id: ChannelId, msg_id: MsgId) -> String {
    format!(
        "{}/{}/{}/{}",
        base.trim_end_matches('/'),
        STREAM_PATH,
        channel_id,
        msg_id
    )
}

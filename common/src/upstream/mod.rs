use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;

use api::{ChannelId, FileKind, MsgId, UserId};

pub mod mock;
pub mod pool;
pub mod telegram;

// the upstream transfer unit is a wire constant of the protocol: chunk
// indices passed to fetch_chunk are multiples of this, never byte offsets
pub const CHUNK: u64 = 1_048_576;

pub type DcId = i32;

// transient per-request handle for one archived file
//
// locators expire minutes after issuance; the only recovery is re-fetching
// the message from its (channel_id, msg_id) pair.  never persisted.
#[derive(Clone, Debug)]
pub struct FileLocator {
    pub dc_id: DcId,
    pub size: u64,
    pub kind: LocatorKind,
}

#[derive(Clone, Debug)]
pub enum LocatorKind {
    Document {
        id: i64,
        access_hash: i64,
        file_reference: Vec<u8>,
    },
    Test {
        channel_id: ChannelId,
        msg_id: MsgId,
        generation: u64,
    },
}

// a fetched archive-channel message whose payload is a file
#[derive(Clone, Debug)]
pub struct RemoteFile {
    pub channel_id: ChannelId,
    pub msg_id: MsgId,
    pub name: String,
    pub mime_type: String,
    pub kind: FileKind,
    pub size: u64,
    pub locator: FileLocator,
}

// file payload metadata attached to an incoming private message
#[derive(Clone, Debug)]
pub struct RemoteDocument {
    pub unique_id: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub duration_seconds: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub sender_id: UserId,
    pub msg_id: MsgId,
    pub text: String,
    pub document: Option<RemoteDocument>,
}

#[derive(Clone, Debug)]
pub enum UpstreamUpdate {
    Message(IncomingMessage),
    // an inline keyboard button press
    Callback {
        chat_id: i64,
        sender_id: UserId,
        msg_id: MsgId,
        data: Vec<u8>,
    },
}

// error taxonomy shared by every backend; the stream engine dispatches on
// these kinds to decide between self-heal, flood sleep, and giving up
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("file or message not found")]
    NotFound,

    #[error("file reference expired")]
    ReferenceExpired,

    #[error("timed out waiting for a blob")]
    BlobTimeout,

    #[error("transient network failure: {0}")]
    NetworkTransient(String),

    #[error("rate limited for {retry_after:?}")]
    FloodLimited { retry_after: Duration },

    #[error("upstream rejected credentials: {0}")]
    Unauthorized(String),

    #[error("upstream stream ended after {delivered} of {want} bytes")]
    PrematureEof { delivered: u64, want: u64 },

    #[error("stream broken after {attempts} recovery attempts")]
    StreamBroken { attempts: u32 },

    #[error("upstream not connected")]
    NotConnected,

    #[error("upstream failure: {0}")]
    Fatal(String),
}

impl UpstreamError {
    // kinds the engine may recover from by rebuilding the blob stream at
    // the current byte position
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            UpstreamError::ReferenceExpired
                | UpstreamError::BlobTimeout
                | UpstreamError::NetworkTransient(_)
        )
    }
}

// lazy sequence of <= CHUNK sized blobs, delivered strictly in order;
// dropping it cancels the in-flight fetch
pub type BlobStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

// the capability set the rest of the system needs from the chat platform
//
// one long-lived authenticated handle per process.  backends must support
// many in-flight downloads concurrently; serialization required by the
// wire protocol happens per session-pool entry, not here.
#[async_trait]
pub trait Upstream: Send + Sync + 'static {
    // connect and authenticate; idempotent
    async fn start(&self) -> Result<(), UpstreamError>;

    // whether start() has completed; the http surface answers 503 until then
    fn connected(&self) -> bool;

    // next bot update (private message or callback press); pends forever
    // once the backend has shut down
    async fn next_update(&self) -> Result<UpstreamUpdate, UpstreamError>;

    // fetch an archive-channel message whose payload is a file
    async fn get_message(
        &self,
        channel_id: ChannelId,
        msg_id: MsgId,
    ) -> Result<RemoteFile, UpstreamError>;

    // returns the new message id in the destination channel
    async fn forward_to_channel(
        &self,
        src_chat: i64,
        msg_id: MsgId,
        dst_channel: ChannelId,
    ) -> Result<MsgId, UpstreamError>;

    async fn send_text(&self, chat_id: i64, text: &str) -> Result<MsgId, UpstreamError>;

    async fn edit_text(
        &self,
        chat_id: i64,
        msg_id: MsgId,
        text: &str,
    ) -> Result<(), UpstreamError>;

    // send a message with one inline button per (label, payload) pair
    async fn send_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        buttons: &[(String, Vec<u8>)],
    ) -> Result<MsgId, UpstreamError>;

    // upload a local file into a channel; used only by the url ingest path
    async fn send_file(
        &self,
        channel_id: ChannelId,
        path: &Path,
        name: &str,
        mime_type: &str,
    ) -> Result<(MsgId, RemoteDocument), UpstreamError>;

    // open a pre-authenticated download sub-session for one datacenter;
    // called lazily by the session pool, at most once per dc
    async fn open_session(&self, dc_id: DcId) -> Result<Arc<dyn UpstreamSession>, UpstreamError>;

    // resolves when the backend disconnects for good
    async fn idle(&self);

    async fn close(&self);
}

// a single datacenter download session owned by one pool entry
//
// fetch_chunk is one wire request: chunk chunk_index of the file, which is
// bytes [chunk_index * CHUNK, (chunk_index + 1) * CHUNK).  returns None at
// end of file.  implementations need not be internally synchronized; the
// pool entry lock serializes callers.
#[async_trait]
pub trait UpstreamSession: Send + Sync + 'static {
    async fn fetch_chunk(
        &self,
        locator: &FileLocator,
        chunk_index: u64,
    ) -> Result<Option<Bytes>, UpstreamError>;
}

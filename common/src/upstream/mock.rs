use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use api::{ChannelId, FileKind, MsgId, UserId};

use crate::upstream::{
    DcId, FileLocator, IncomingMessage, LocatorKind, RemoteDocument, RemoteFile, Upstream,
    UpstreamError, UpstreamSession, UpstreamUpdate, CHUNK,
};

// scripted in-memory backend used by the engine, pool, http, and ingest
// tests: files are byte vectors, locators carry a per-file generation so
// reference expiry is observable, and faults fire at chosen chunk
// boundaries exactly once
//
// the handle is a thin clone-able wrapper so sessions and tests can share
// the scripted state
#[derive(Clone)]
pub struct MockUpstream {
    inner: Arc<Inner>,
}

struct Inner {
    started: AtomicBool,
    files: DashMap<(ChannelId, MsgId), MockFile>,
    next_msg_id: AtomicI64,

    updates_tx: mpsc::UnboundedSender<UpstreamUpdate>,
    updates_rx: Mutex<mpsc::UnboundedReceiver<UpstreamUpdate>>,

    faults: StdMutex<Vec<Fault>>,

    // observability for assertions
    get_message_calls: AtomicUsize,
    open_session_calls: AtomicUsize,
    fetches: StdMutex<Vec<(MsgId, u64)>>,
    outgoing: StdMutex<Vec<Outgoing>>,
}

#[derive(Clone)]
struct MockFile {
    bytes: Bytes,
    dc_id: DcId,
    generation: Arc<AtomicU64>,
    doc: RemoteDocument,
}

#[derive(Clone, Debug)]
pub enum Fault {
    // invalidates the current locator generation when the given chunk of
    // the given file is requested
    ExpireReference {
        channel_id: ChannelId,
        msg_id: MsgId,
        at_chunk: u64,
    },
    Transient {
        channel_id: ChannelId,
        msg_id: MsgId,
        at_chunk: u64,
    },
    // the request never completes; exercises the per-blob timeout
    Stall {
        channel_id: ChannelId,
        msg_id: MsgId,
        at_chunk: u64,
    },
    // rate limiter kicked in; the caller is told how long to sleep
    Flood {
        channel_id: ChannelId,
        msg_id: MsgId,
        at_chunk: u64,
        retry_after: std::time::Duration,
    },
}

#[derive(Clone, Debug)]
pub enum Outgoing {
    Text {
        chat_id: i64,
        msg_id: MsgId,
        text: String,
    },
    Edit {
        chat_id: i64,
        msg_id: MsgId,
        text: String,
    },
    Keyboard {
        chat_id: i64,
        msg_id: MsgId,
        text: String,
        buttons: Vec<(String, Vec<u8>)>,
    },
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl MockUpstream {
    pub fn new() -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        MockUpstream {
            inner: Arc::new(Inner {
                started: AtomicBool::new(true),
                files: DashMap::new(),
                next_msg_id: AtomicI64::new(1000),
                updates_tx,
                updates_rx: Mutex::new(updates_rx),
                faults: StdMutex::new(Vec::new()),
                get_message_calls: AtomicUsize::new(0),
                open_session_calls: AtomicUsize::new(0),
                fetches: StdMutex::new(Vec::new()),
                outgoing: StdMutex::new(Vec::new()),
            }),
        }
    }

    pub fn as_dyn(&self) -> Arc<dyn Upstream> {
        Arc::new(self.clone())
    }

    pub fn add_file(&self, channel_id: ChannelId, msg_id: MsgId, bytes: Vec<u8>) {
        self.add_file_in_dc(channel_id, msg_id, bytes, 2)
    }

    pub fn add_file_in_dc(
        &self,
        channel_id: ChannelId,
        msg_id: MsgId,
        bytes: Vec<u8>,
        dc_id: DcId,
    ) {
        let size = bytes.len() as u64;

        self.inner.files.insert(
            (channel_id, msg_id),
            MockFile {
                bytes: Bytes::from(bytes),
                dc_id,
                generation: Arc::new(AtomicU64::new(0)),
                doc: RemoteDocument {
                    unique_id: format!("uniq-{channel_id}-{msg_id}"),
                    name: format!("file-{msg_id}.bin"),
                    mime_type: "application/octet-stream".to_string(),
                    size,
                    duration_seconds: None,
                },
            },
        );
    }

    pub fn set_document_meta(&self, channel_id: ChannelId, msg_id: MsgId, name: &str, mime: &str) {
        let mut file = self
            .inner
            .files
            .get_mut(&(channel_id, msg_id))
            .expect("set_document_meta on an unregistered file");

        file.doc.name = name.to_string();
        file.doc.mime_type = mime.to_string();
    }

    // locator as get_message would mint it right now, without bumping the
    // call counter; test convenience
    pub fn remote_file(&self, channel_id: ChannelId, msg_id: MsgId) -> RemoteFile {
        let file = self
            .inner
            .files
            .get(&(channel_id, msg_id))
            .expect("remote_file called for an unregistered file");

        build_remote(channel_id, msg_id, &file)
    }

    pub fn inject_fault(&self, fault: Fault) {
        self.inner.faults.lock().unwrap().push(fault);
    }

    pub fn push_update(&self, update: UpstreamUpdate) {
        self.inner
            .updates_tx
            .send(update)
            .expect("mock update channel closed");
    }

    pub fn push_document_message(
        &self,
        chat_id: i64,
        sender_id: UserId,
        msg_id: MsgId,
        bytes: Vec<u8>,
        name: &str,
        mime_type: &str,
    ) {
        // registered as a file so a later forward can copy it into a channel
        self.add_file(chat_id, msg_id, bytes);
        self.set_document_meta(chat_id, msg_id, name, mime_type);

        let doc = self
            .inner
            .files
            .get(&(chat_id, msg_id))
            .unwrap()
            .doc
            .clone();

        self.push_update(UpstreamUpdate::Message(IncomingMessage {
            chat_id,
            sender_id,
            msg_id,
            text: String::new(),
            document: Some(doc),
        }));
    }

    pub fn push_text_message(&self, chat_id: i64, sender_id: UserId, text: &str) {
        let msg_id = self.inner.next_msg_id.fetch_add(1, Ordering::SeqCst);

        self.push_update(UpstreamUpdate::Message(IncomingMessage {
            chat_id,
            sender_id,
            msg_id,
            text: text.to_string(),
            document: None,
        }));
    }

    pub fn get_message_calls(&self) -> usize {
        self.inner.get_message_calls.load(Ordering::SeqCst)
    }

    pub fn open_session_calls(&self) -> usize {
        self.inner.open_session_calls.load(Ordering::SeqCst)
    }

    pub fn fetched_chunks(&self) -> Vec<(MsgId, u64)> {
        self.inner.fetches.lock().unwrap().clone()
    }

    pub fn outgoing(&self) -> Vec<Outgoing> {
        self.inner.outgoing.lock().unwrap().clone()
    }

    pub fn has_file(&self, channel_id: ChannelId, msg_id: MsgId) -> bool {
        self.inner.files.contains_key(&(channel_id, msg_id))
    }
}

fn build_remote(channel_id: ChannelId, msg_id: MsgId, file: &MockFile) -> RemoteFile {
    RemoteFile {
        channel_id,
        msg_id,
        name: file.doc.name.clone(),
        mime_type: file.doc.mime_type.clone(),
        kind: FileKind::from_mime(&file.doc.mime_type),
        size: file.bytes.len() as u64,
        locator: FileLocator {
            dc_id: file.dc_id,
            size: file.bytes.len() as u64,
            kind: LocatorKind::Test {
                channel_id,
                msg_id,
                generation: file.generation.load(Ordering::SeqCst),
            },
        },
    }
}

impl Inner {
    fn take_fault(&self, channel_id: ChannelId, msg_id: MsgId, chunk_index: u64) -> Option<Fault> {
        let mut faults = self.faults.lock().unwrap();

        let pos = faults.iter().position(|f| match f {
            Fault::ExpireReference {
                channel_id: c,
                msg_id: m,
                at_chunk,
            }
            | Fault::Transient {
                channel_id: c,
                msg_id: m,
                at_chunk,
            }
            | Fault::Stall {
                channel_id: c,
                msg_id: m,
                at_chunk,
            }
            | Fault::Flood {
                channel_id: c,
                msg_id: m,
                at_chunk,
                ..
            } => *c == channel_id && *m == msg_id && *at_chunk == chunk_index,
        })?;

        Some(faults.remove(pos))
    }

    async fn fetch(
        &self,
        locator: &FileLocator,
        chunk_index: u64,
    ) -> Result<Option<Bytes>, UpstreamError> {
        let LocatorKind::Test {
            channel_id,
            msg_id,
            generation,
        } = &locator.kind
        else {
            return Err(UpstreamError::Fatal(
                "mock session handed a non-test locator".to_string(),
            ));
        };

        self.fetches.lock().unwrap().push((*msg_id, chunk_index));

        if let Some(fault) = self.take_fault(*channel_id, *msg_id, chunk_index) {
            match fault {
                Fault::ExpireReference { .. } => {
                    let file = self
                        .files
                        .get(&(*channel_id, *msg_id))
                        .ok_or(UpstreamError::NotFound)?;
                    file.generation.fetch_add(1, Ordering::SeqCst);
                    return Err(UpstreamError::ReferenceExpired);
                }
                Fault::Transient { .. } => {
                    return Err(UpstreamError::NetworkTransient("injected".to_string()));
                }
                Fault::Stall { .. } => {
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
                Fault::Flood { retry_after, .. } => {
                    return Err(UpstreamError::FloodLimited { retry_after });
                }
            }
        }

        let file = self
            .files
            .get(&(*channel_id, *msg_id))
            .ok_or(UpstreamError::NotFound)?;

        // a locator minted before the last expiry is dead regardless of
        // which chunk it asks for
        if *generation < file.generation.load(Ordering::SeqCst) {
            return Err(UpstreamError::ReferenceExpired);
        }

        let len = file.bytes.len() as u64;
        let offset = chunk_index * CHUNK;

        if offset >= len {
            return Ok(None);
        }

        let end = (offset + CHUNK).min(len);
        Ok(Some(file.bytes.slice(offset as usize..end as usize)))
    }
}

#[async_trait]
impl Upstream for MockUpstream {
    async fn start(&self) -> Result<(), UpstreamError> {
        self.inner.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn connected(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    async fn next_update(&self) -> Result<UpstreamUpdate, UpstreamError> {
        let mut rx = self.inner.updates_rx.lock().await;

        match rx.recv().await {
            Some(update) => Ok(update),
            // all senders gone; behave like a closed backend
            None => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn get_message(
        &self,
        channel_id: ChannelId,
        msg_id: MsgId,
    ) -> Result<RemoteFile, UpstreamError> {
        self.inner.get_message_calls.fetch_add(1, Ordering::SeqCst);

        let file = self
            .inner
            .files
            .get(&(channel_id, msg_id))
            .ok_or(UpstreamError::NotFound)?;

        Ok(build_remote(channel_id, msg_id, &file))
    }

    async fn forward_to_channel(
        &self,
        src_chat: i64,
        msg_id: MsgId,
        dst_channel: ChannelId,
    ) -> Result<MsgId, UpstreamError> {
        let file = self
            .inner
            .files
            .get(&(src_chat, msg_id))
            .ok_or(UpstreamError::NotFound)?
            .clone();

        let new_msg_id = self.inner.next_msg_id.fetch_add(1, Ordering::SeqCst);
        self.inner.files.insert((dst_channel, new_msg_id), file);

        Ok(new_msg_id)
    }

    async fn send_text(&self, chat_id: i64, text: &str) -> Result<MsgId, UpstreamError> {
        let msg_id = self.inner.next_msg_id.fetch_add(1, Ordering::SeqCst);

        self.inner.outgoing.lock().unwrap().push(Outgoing::Text {
            chat_id,
            msg_id,
            text: text.to_string(),
        });

        Ok(msg_id)
    }

    async fn edit_text(
        &self,
        chat_id: i64,
        msg_id: MsgId,
        text: &str,
    ) -> Result<(), UpstreamError> {
        self.inner.outgoing.lock().unwrap().push(Outgoing::Edit {
            chat_id,
            msg_id,
            text: text.to_string(),
        });

        Ok(())
    }

    async fn send_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        buttons: &[(String, Vec<u8>)],
    ) -> Result<MsgId, UpstreamError> {
        let msg_id = self.inner.next_msg_id.fetch_add(1, Ordering::SeqCst);

        self.inner.outgoing.lock().unwrap().push(Outgoing::Keyboard {
            chat_id,
            msg_id,
            text: text.to_string(),
            buttons: buttons.to_vec(),
        });

        Ok(msg_id)
    }

    async fn send_file(
        &self,
        channel_id: ChannelId,
        path: &Path,
        name: &str,
        mime_type: &str,
    ) -> Result<(MsgId, RemoteDocument), UpstreamError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|err| UpstreamError::Fatal(err.to_string()))?;

        let msg_id = self.inner.next_msg_id.fetch_add(1, Ordering::SeqCst);
        self.add_file(channel_id, msg_id, bytes);
        self.set_document_meta(channel_id, msg_id, name, mime_type);

        let doc = self
            .inner
            .files
            .get(&(channel_id, msg_id))
            .unwrap()
            .doc
            .clone();

        Ok((msg_id, doc))
    }

    async fn open_session(&self, _dc_id: DcId) -> Result<Arc<dyn UpstreamSession>, UpstreamError> {
        self.inner.open_session_calls.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(MockSession {
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn idle(&self) {
        futures::future::pending::<()>().await;
    }

    async fn close(&self) {
        self.inner.started.store(false, Ordering::SeqCst);
    }
}

struct MockSession {
    inner: Arc<Inner>,
}

#[async_trait]
impl UpstreamSession for MockSession {
    async fn fetch_chunk(
        &self,
        locator: &FileLocator,
        chunk_index: u64,
    ) -> Result<Option<Bytes>, UpstreamError> {
        self.inner.fetch(locator, chunk_index).await
    }
}

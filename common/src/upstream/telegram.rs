use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use grammers_client::types::{Chat, Media, Update};
use grammers_client::{button, reply_markup, Client, Config, InitParams, InputMessage};
use grammers_session::{PackedChat, PackedType, Session};
use grammers_tl_types as tl;
use tokio::sync::{Notify, OnceCell};
use tracing::{debug, info, instrument, warn, Level};

use api::{ChannelId, FileKind, MsgId};

use crate::config::SsConfig;
use crate::upstream::{
    DcId, FileLocator, IncomingMessage, LocatorKind, RemoteDocument, RemoteFile, Upstream,
    UpstreamError, UpstreamSession, UpstreamUpdate, CHUNK,
};

// mtproto backend
//
// one authenticated bot client per process; the session file in the working
// directory keeps the auth key so restarts do not re-login.  download
// sub-sessions are cloned from this client per datacenter by the pool.
pub struct TelegramUpstream {
    config: Arc<SsConfig>,
    client: OnceCell<Client>,
    connected: AtomicBool,
    // access hashes learned from update traffic; private channels resolve
    // only after the bot has seen activity there this process lifetime
    chats: DashMap<i64, PackedChat>,
    shutdown: Notify,
}

// public stream links use the -100xxxxxxxxxx convention for channels; the
// wire protocol wants the bare positive id
pub fn bare_channel_id(channel_id: ChannelId) -> i64 {
    if channel_id <= -1_000_000_000_000 {
        -channel_id - 1_000_000_000_000
    } else if channel_id < 0 {
        -channel_id
    } else {
        channel_id
    }
}

fn map_invocation(err: grammers_client::InvocationError) -> UpstreamError {
    use grammers_client::InvocationError;

    match err {
        InvocationError::Rpc(rpc) => {
            if rpc.name.starts_with("FLOOD_WAIT") || rpc.code == 420 {
                return UpstreamError::FloodLimited {
                    retry_after: Duration::from_secs(u64::from(rpc.value.unwrap_or(1))),
                };
            }

            if rpc.name.contains("FILE_REFERENCE") {
                return UpstreamError::ReferenceExpired;
            }

            if rpc.code == 401 {
                return UpstreamError::Unauthorized(rpc.name);
            }

            if rpc.code == 404 || rpc.name.contains("MSG_ID_INVALID") {
                return UpstreamError::NotFound;
            }

            UpstreamError::Fatal(rpc.name)
        }
        other => UpstreamError::NetworkTransient(other.to_string()),
    }
}

impl TelegramUpstream {
    pub fn new(config: Arc<SsConfig>) -> Arc<Self> {
        Arc::new(TelegramUpstream {
            config,
            client: OnceCell::new(),
            connected: AtomicBool::new(false),
            chats: DashMap::new(),
            shutdown: Notify::new(),
        })
    }

    fn client(&self) -> Result<&Client, UpstreamError> {
        self.client.get().ok_or(UpstreamError::NotConnected)
    }

    fn remember_chat(&self, chat: &Chat) {
        self.chats.insert(chat.id(), chat.pack());
    }

    // best-effort packed handle for a chat id: cached pack when the bot has
    // seen the chat, otherwise a hash-less reference
    fn packed(&self, chat_id: i64) -> PackedChat {
        let bare = bare_channel_id(chat_id);

        if let Some(packed) = self.chats.get(&bare) {
            return packed.clone();
        }

        let ty = if chat_id <= -1_000_000_000_000 {
            PackedType::Broadcast
        } else if chat_id < 0 {
            PackedType::Chat
        } else {
            PackedType::User
        };

        PackedChat {
            ty,
            id: bare,
            access_hash: None,
        }
    }

    fn input_channel(&self, channel_id: ChannelId) -> tl::enums::InputChannel {
        let packed = self.packed(channel_id);

        tl::enums::InputChannel::Channel(tl::types::InputChannel {
            channel_id: packed.id,
            access_hash: packed.access_hash.unwrap_or(0),
        })
    }

    fn save_session(&self) {
        let Some(client) = self.client.get() else {
            return;
        };

        match client.session().save_to_file(&self.config.session_file) {
            Ok(()) => {
                // auth keys are credentials; keep the file owner-only
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let _ = std::fs::set_permissions(
                        &self.config.session_file,
                        std::fs::Permissions::from_mode(0o600),
                    );
                }
            }
            Err(err) => warn!({ error = %err }, "failed to save session file"),
        }
    }

    fn document_meta(media: &Media) -> Option<RemoteDocument> {
        match media {
            Media::Document(doc) => Some(RemoteDocument {
                unique_id: doc.id().to_string(),
                name: doc.name().to_string(),
                mime_type: doc
                    .mime_type()
                    .unwrap_or("application/octet-stream")
                    .to_string(),
                size: doc.size().max(0) as u64,
                duration_seconds: None,
            }),
            _ => None,
        }
    }
}

#[async_trait]
impl Upstream for TelegramUpstream {
    #[instrument(level = Level::DEBUG, skip(self))]
    async fn start(&self) -> Result<(), UpstreamError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let session = Session::load_file_or_create(&self.config.session_file)
            .map_err(|err| UpstreamError::Fatal(err.to_string()))?;

        let params = InitParams {
            catch_up: false,
            proxy_url: self.config.proxy_url.clone(),
            ..Default::default()
        };

        let client = Client::connect(Config {
            session,
            api_id: self.config.api_id,
            api_hash: self.config.api_hash.clone(),
            params,
        })
        .await
        .map_err(|err| UpstreamError::NetworkTransient(err.to_string()))?;

        if !client
            .is_authorized()
            .await
            .map_err(map_invocation)?
        {
            info!("session not authorized, signing in as bot");

            client
                .bot_sign_in(&self.config.bot_token)
                .await
                .map_err(|err| UpstreamError::Unauthorized(err.to_string()))?;
        }

        self.client
            .set(client)
            .map_err(|_| UpstreamError::Fatal("client initialized twice".to_string()))?;

        self.save_session();
        self.connected.store(true, Ordering::SeqCst);

        info!("upstream connected");
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn next_update(&self) -> Result<UpstreamUpdate, UpstreamError> {
        let client = self.client()?;

        loop {
            let update = client.next_update().await.map_err(map_invocation)?;

            match update {
                Update::NewMessage(msg) if !msg.outgoing() => {
                    let chat = msg.chat();
                    self.remember_chat(&chat);

                    let sender_id = match msg.sender() {
                        Some(sender) => sender.id(),
                        None => continue,
                    };

                    let document = msg.media().as_ref().and_then(Self::document_meta);

                    return Ok(UpstreamUpdate::Message(IncomingMessage {
                        chat_id: chat.id(),
                        sender_id,
                        msg_id: i64::from(msg.id()),
                        text: msg.text().to_string(),
                        document,
                    }));
                }
                Update::CallbackQuery(query) => {
                    let chat = query.chat();
                    self.remember_chat(chat);

                    return Ok(UpstreamUpdate::Callback {
                        chat_id: chat.id(),
                        sender_id: query.sender().id(),
                        msg_id: i64::from(query.raw.msg_id),
                        data: query.data().to_vec(),
                    });
                }
                _ => continue,
            }
        }
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn get_message(
        &self,
        channel_id: ChannelId,
        msg_id: MsgId,
    ) -> Result<RemoteFile, UpstreamError> {
        let client = self.client()?;

        let result = client
            .invoke(&tl::functions::channels::GetMessages {
                channel: self.input_channel(channel_id),
                id: vec![tl::enums::InputMessage::Id(tl::types::InputMessageId {
                    id: msg_id as i32,
                })],
            })
            .await
            .map_err(map_invocation)?;

        let messages = match result {
            tl::enums::messages::Messages::Messages(m) => m.messages,
            tl::enums::messages::Messages::Slice(m) => m.messages,
            tl::enums::messages::Messages::ChannelMessages(m) => m.messages,
            tl::enums::messages::Messages::NotModified(_) => {
                return Err(UpstreamError::Fatal(
                    "unexpected not-modified message container".to_string(),
                ))
            }
        };

        let message = messages
            .into_iter()
            .find_map(|m| match m {
                tl::enums::Message::Message(m) if m.id == msg_id as i32 => Some(m),
                _ => None,
            })
            .ok_or(UpstreamError::NotFound)?;

        // only file payloads can be streamed; anything else is a miss
        let media = message.media.ok_or(UpstreamError::NotFound)?;

        let document = match media {
            tl::enums::MessageMedia::Document(md) => match md.document {
                Some(tl::enums::Document::Document(doc)) => doc,
                _ => return Err(UpstreamError::NotFound),
            },
            _ => return Err(UpstreamError::NotFound),
        };

        let name = document
            .attributes
            .iter()
            .find_map(|attr| match attr {
                tl::enums::DocumentAttribute::Filename(f) => Some(f.file_name.clone()),
                _ => None,
            })
            .unwrap_or_else(|| format!("{msg_id}"));

        let size = document.size.max(0) as u64;

        Ok(RemoteFile {
            channel_id,
            msg_id,
            name,
            mime_type: document.mime_type.clone(),
            kind: FileKind::from_mime(&document.mime_type),
            size,
            locator: FileLocator {
                dc_id: document.dc_id,
                size,
                kind: LocatorKind::Document {
                    id: document.id,
                    access_hash: document.access_hash,
                    file_reference: document.file_reference,
                },
            },
        })
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn forward_to_channel(
        &self,
        src_chat: i64,
        msg_id: MsgId,
        dst_channel: ChannelId,
    ) -> Result<MsgId, UpstreamError> {
        let client = self.client()?;

        let forwarded = client
            .forward_messages(
                self.packed(dst_channel),
                &[msg_id as i32],
                self.packed(src_chat),
            )
            .await
            .map_err(map_invocation)?;

        forwarded
            .into_iter()
            .flatten()
            .next()
            .map(|msg| i64::from(msg.id()))
            .ok_or_else(|| UpstreamError::Fatal("forward produced no message".to_string()))
    }

    async fn send_text(&self, chat_id: i64, text: &str) -> Result<MsgId, UpstreamError> {
        let client = self.client()?;

        let sent = client
            .send_message(self.packed(chat_id), InputMessage::text(text))
            .await
            .map_err(map_invocation)?;

        Ok(i64::from(sent.id()))
    }

    async fn edit_text(
        &self,
        chat_id: i64,
        msg_id: MsgId,
        text: &str,
    ) -> Result<(), UpstreamError> {
        let client = self.client()?;

        client
            .edit_message(self.packed(chat_id), msg_id as i32, InputMessage::text(text))
            .await
            .map_err(map_invocation)
    }

    async fn send_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        buttons: &[(String, Vec<u8>)],
    ) -> Result<MsgId, UpstreamError> {
        let client = self.client()?;

        let rows: Vec<Vec<_>> = buttons
            .iter()
            .map(|(label, data)| vec![button::inline(label, data.clone())])
            .collect();

        let sent = client
            .send_message(
                self.packed(chat_id),
                InputMessage::text(text).reply_markup(&reply_markup::inline(rows)),
            )
            .await
            .map_err(map_invocation)?;

        Ok(i64::from(sent.id()))
    }

    #[instrument(level = Level::DEBUG, skip(self, path))]
    async fn send_file(
        &self,
        channel_id: ChannelId,
        path: &Path,
        name: &str,
        mime_type: &str,
    ) -> Result<(MsgId, RemoteDocument), UpstreamError> {
        let client = self.client()?;

        let uploaded = client
            .upload_file(path)
            .await
            .map_err(|err| UpstreamError::NetworkTransient(err.to_string()))?;

        let sent = client
            .send_message(
                self.packed(channel_id),
                InputMessage::text("").document(uploaded),
            )
            .await
            .map_err(map_invocation)?;

        let doc = sent
            .media()
            .as_ref()
            .and_then(Self::document_meta)
            .map(|mut doc| {
                doc.name = name.to_string();
                doc.mime_type = mime_type.to_string();
                doc
            })
            .ok_or_else(|| UpstreamError::Fatal("upload produced no document".to_string()))?;

        Ok((i64::from(sent.id()), doc))
    }

    async fn open_session(&self, dc_id: DcId) -> Result<Arc<dyn UpstreamSession>, UpstreamError> {
        let client = self.client()?;

        debug!({ dc_id = dc_id }, "opening download sub-session");

        // the clone shares the primary auth; per-dc transport state lives
        // inside the client and is established on first use
        Ok(Arc::new(TelegramSession {
            client: client.clone(),
            dc_id,
        }))
    }

    async fn idle(&self) {
        self.shutdown.notified().await;
    }

    async fn close(&self) {
        self.save_session();
        self.connected.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }
}

struct TelegramSession {
    client: Client,
    dc_id: DcId,
}

#[async_trait]
impl UpstreamSession for TelegramSession {
    async fn fetch_chunk(
        &self,
        locator: &FileLocator,
        chunk_index: u64,
    ) -> Result<Option<Bytes>, UpstreamError> {
        let LocatorKind::Document {
            id,
            access_hash,
            file_reference,
        } = &locator.kind
        else {
            return Err(UpstreamError::Fatal(
                "telegram session handed a foreign locator".to_string(),
            ));
        };

        let request = tl::functions::upload::GetFile {
            precise: true,
            cdn_supported: false,
            location: tl::enums::InputFileLocation::InputDocumentFileLocation(
                tl::types::InputDocumentFileLocation {
                    id: *id,
                    access_hash: *access_hash,
                    file_reference: file_reference.clone(),
                    thumb_size: String::new(),
                },
            ),
            offset: (chunk_index * CHUNK) as i64,
            limit: CHUNK as i32,
        };

        let response = self
            .client
            .invoke_in_dc(&request, self.dc_id)
            .await
            .map_err(map_invocation)?;

        match response {
            tl::enums::upload::File::File(file) => {
                if file.bytes.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(Bytes::from(file.bytes)))
                }
            }
            tl::enums::upload::File::CdnRedirect(_) => Err(UpstreamError::Fatal(
                "cdn redirect not supported".to_string(),
            )),
        }
    }
}

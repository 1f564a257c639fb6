use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_cell::sync::AsyncCell;
use async_trait::async_trait;
use chrono::Local;
use rand::distr::{Alphanumeric, SampleString};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, instrument, warn, Level};

use crate::{
    db::msg::DbMsg,
    ingest::{
        fetch::{FetchCandidate, Fetcher, ScratchFile},
        state::{Pending, PendingMap, UploadState, UrlState, PENDING_TTL},
        HELP_TEXT, NAME_PROMPT, SKIP_TOKEN,
    },
    service::{SiphonService, SsInner, Ssm, SsmReceiver, SsmRegistry, SsmSender, ServiceType},
};
use api::{stream_url, ArchivedFile, FileKind, FileSource, MsgId, UserId};
use common::{
    config::SsConfig,
    upstream::{IncomingMessage, Upstream, UpstreamUpdate},
};

// ingest service
//
// drives population of the metadata index: private messages carrying files
// are forwarded into the archive channel, short video urls are fetched
// through the external fetcher and uploaded.  all conversational state
// lives in the pending map and dies after ten idle minutes.
pub struct IngestService {
    config: Arc<SsConfig>,
    upstream: Arc<dyn Upstream>,
    receiver: Arc<Mutex<SsmReceiver>>,
    msg_handle: AsyncCell<tokio::task::JoinHandle<Result<()>>>,
    update_handle: AsyncCell<tokio::task::JoinHandle<Result<()>>>,
    sweep_handle: AsyncCell<tokio::task::JoinHandle<Result<()>>>,
}

impl IngestService {
    pub fn create(
        config: Arc<SsConfig>,
        registry: &SsmRegistry,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        let (tx, rx) = tokio::sync::mpsc::channel::<Ssm>(32);

        registry
            .insert(ServiceType::Ingest, tx)
            .expect("failed to add ingest sender to registry");

        IngestService {
            config,
            upstream,
            receiver: Arc::new(Mutex::new(rx)),
            msg_handle: AsyncCell::new(),
            update_handle: AsyncCell::new(),
            sweep_handle: AsyncCell::new(),
        }
    }
}

#[async_trait]
impl SiphonService for IngestService {
    type Inner = IngestState;

    #[instrument(level = Level::DEBUG, skip(self, registry))]
    async fn start(&self, registry: &SsmRegistry) -> Result<()> {
        info!("starting ingest service");

        let state = Arc::new(IngestState::new(
            self.config.clone(),
            registry,
            self.upstream.clone(),
        )?);

        // private channels only resolve once the bot has seen them this
        // process lifetime; probe the archive channel to warm that cache
        {
            let upstream = self.upstream.clone();
            let channel = self.config.archive_channel;
            tokio::task::spawn(async move {
                match upstream.get_message(channel, 1).await {
                    Ok(_) => debug!("archive channel resolved at startup"),
                    Err(err) => debug!({ error = %err }, "archive channel not yet visible"),
                }
            });
        }

        // bot update loop
        let update_serve = {
            let state = Arc::clone(&state);

            async move {
                loop {
                    match state.upstream.next_update().await {
                        Ok(update) => {
                            let state = Arc::clone(&state);
                            tokio::task::spawn(async move {
                                if let Err(err) = state.handle_update(update).await {
                                    error!({service = "ingest", channel = "updates", error = %err});
                                }
                            });
                        }
                        Err(err) => {
                            warn!({ error = %err }, "update stream failed, backing off");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        };

        self.update_handle.set(tokio::task::spawn(update_serve));

        // stale conversation sweeper
        let sweep_serve = {
            let state = Arc::clone(&state);

            async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(60));

                loop {
                    ticker.tick().await;
                    state.pending.sweep(PENDING_TTL);
                }
            }
        };

        self.sweep_handle.set(tokio::task::spawn(sweep_serve));

        let receiver = Arc::clone(&self.receiver);

        let msg_serve = {
            async move {
                let mut receiver = receiver.lock().await;

                while let Some(msg) = receiver.recv().await {
                    let state = Arc::clone(&state);
                    tokio::task::spawn(async move {
                        match state.message_handler(msg).await {
                            Ok(()) => (),
                            Err(err) => {
                                error!({service = "ingest", channel = "ssm", error = %err})
                            }
                        }
                    });
                }

                Err(anyhow::Error::msg("ingest service ssm channel disconnected"))
            }
        };

        self.msg_handle.set(tokio::task::spawn(msg_serve));

        debug!("started ingest service");
        Ok(())
    }
}

pub struct IngestState {
    config: Arc<SsConfig>,
    registry: SsmRegistry,
    pub upstream: Arc<dyn Upstream>,
    db_svc_sender: SsmSender,
    pub pending: PendingMap,
    fetcher: Fetcher,
}

#[async_trait]
impl SsInner for IngestState {
    fn registry(&self) -> SsmRegistry {
        self.registry.clone()
    }

    async fn message_handler(&self, ssm: Ssm) -> Result<()> {
        match ssm {
            _ => Err(anyhow::Error::msg("not implemented")),
        }
    }
}

impl IngestState {
    pub fn new(
        config: Arc<SsConfig>,
        registry: &SsmRegistry,
        upstream: Arc<dyn Upstream>,
    ) -> Result<Self> {
        Ok(IngestState {
            fetcher: Fetcher::new(config.clone()),
            config,
            registry: registry.clone(),
            upstream,
            db_svc_sender: registry.get(&ServiceType::Db)?,
            pending: PendingMap::new(),
        })
    }

    // database rpc helpers

    async fn db_put_file(&self, file: ArchivedFile) -> Result<()> {
        let (tx, rx) = oneshot::channel();

        self.db_svc_sender
            .send(DbMsg::PutFile { resp: tx, file }.into())
            .await
            .context("failed to send PutFile message from ingest")?;

        rx.await
            .context("failed to receive PutFile response at ingest")?
    }

    async fn db_get_by_unique_id(&self, unique_id: String) -> Result<Option<ArchivedFile>> {
        let (tx, rx) = oneshot::channel();

        self.db_svc_sender
            .send(DbMsg::GetByUniqueId { resp: tx, unique_id }.into())
            .await
            .context("failed to send GetByUniqueId message from ingest")?;

        rx.await
            .context("failed to receive GetByUniqueId response at ingest")?
    }

    async fn db_list_by_user(&self, user_id: UserId, page: u64) -> Result<Vec<ArchivedFile>> {
        let (tx, rx) = oneshot::channel();

        self.db_svc_sender
            .send(
                DbMsg::ListByUser {
                    resp: tx,
                    user_id,
                    page,
                    per_page: 10,
                }
                .into(),
            )
            .await
            .context("failed to send ListByUser message from ingest")?;

        rx.await
            .context("failed to receive ListByUser response at ingest")?
    }

    async fn db_search_by_user(&self, user_id: UserId, query: String) -> Result<Vec<ArchivedFile>> {
        let (tx, rx) = oneshot::channel();

        self.db_svc_sender
            .send(
                DbMsg::SearchByUser {
                    resp: tx,
                    user_id,
                    query,
                }
                .into(),
            )
            .await
            .context("failed to send SearchByUser message from ingest")?;

        rx.await
            .context("failed to receive SearchByUser response at ingest")?
    }

    async fn db_soft_delete(&self, msg_id: MsgId, user_id: UserId) -> Result<bool> {
        let (tx, rx) = oneshot::channel();

        self.db_svc_sender
            .send(
                DbMsg::SoftDelete {
                    resp: tx,
                    channel_id: self.config.archive_channel,
                    msg_id,
                    user_id,
                }
                .into(),
            )
            .await
            .context("failed to send SoftDelete message from ingest")?;

        rx.await
            .context("failed to receive SoftDelete response at ingest")?
    }

    async fn db_upsert_user(&self, user_id: UserId) -> Result<()> {
        let (tx, rx) = oneshot::channel();

        self.db_svc_sender
            .send(DbMsg::UpsertUser { resp: tx, user_id }.into())
            .await
            .context("failed to send UpsertUser message from ingest")?;

        rx.await
            .context("failed to receive UpsertUser response at ingest")?
    }

    fn link_for(&self, file: &ArchivedFile) -> String {
        stream_url(&self.config.public_url, file.channel_id, file.msg_id)
    }

    // update dispatch

    pub async fn handle_update(&self, update: UpstreamUpdate) -> Result<()> {
        match update {
            UpstreamUpdate::Message(msg) if msg.document.is_some() => {
                self.handle_document(msg).await
            }
            UpstreamUpdate::Message(msg) => self.handle_text(msg).await,
            UpstreamUpdate::Callback {
                chat_id,
                sender_id,
                data,
                ..
            } => self.handle_callback(chat_id, sender_id, data).await,
        }
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(sender_id = msg.sender_id))]
    async fn handle_document(&self, msg: IncomingMessage) -> Result<()> {
        let Some(doc) = msg.document.clone() else {
            return Ok(());
        };

        if doc.size > self.config.max_file_bytes {
            self.upstream
                .send_text(
                    msg.chat_id,
                    &format!(
                        "this file exceeds the {} MiB cap",
                        self.config.max_file_bytes / (1024 * 1024)
                    ),
                )
                .await?;
            return Ok(());
        }

        if let Some(duration) = doc.duration_seconds {
            if u64::from(duration) > self.config.max_duration_secs {
                self.upstream
                    .send_text(
                        msg.chat_id,
                        &format!(
                            "this file exceeds the {} hour duration cap",
                            self.config.max_duration_secs / 3600
                        ),
                    )
                    .await?;
                return Ok(());
            }
        }

        // the platform file id is stable across uploads, so a known id
        // means the payload is already in the archive channel
        if let Some(existing) = self.db_get_by_unique_id(doc.unique_id.clone()).await? {
            self.upstream
                .send_text(
                    msg.chat_id,
                    &format!("already archived: {}", self.link_for(&existing)),
                )
                .await?;
            return Ok(());
        }

        self.pending.insert(
            msg.sender_id,
            Pending::Upload(UploadState {
                src_chat: msg.chat_id,
                src_msg_id: msg.msg_id,
                doc: doc.clone(),
                since: Instant::now(),
            }),
        );

        self.upstream
            .send_text(msg.chat_id, &format!("{NAME_PROMPT} \"{}\"", doc.name))
            .await?;

        Ok(())
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(sender_id = msg.sender_id))]
    async fn handle_text(&self, msg: IncomingMessage) -> Result<()> {
        let text = msg.text.trim().to_string();

        // a pending upload consumes the next plain message (or the skip
        // token) as its display name; other commands leave it pending
        if self.pending.peek_kind(msg.sender_id) == Some("upload")
            && (text == SKIP_TOKEN || !text.starts_with('/'))
            && !text.is_empty()
        {
            let Some(Pending::Upload(upload)) = self.pending.take(msg.sender_id) else {
                return Ok(());
            };

            let name = if text == SKIP_TOKEN {
                upload.doc.name.clone()
            } else {
                text
            };

            return self.finalize_upload(msg.chat_id, msg.sender_id, upload, name).await;
        }

        if text.starts_with('/') {
            return self.handle_command(&msg, &text).await;
        }

        if text.starts_with("http://") || text.starts_with("https://") {
            return self.handle_url(&msg, &text).await;
        }

        self.upstream.send_text(msg.chat_id, HELP_TEXT).await?;
        Ok(())
    }

    async fn handle_command(&self, msg: &IncomingMessage, text: &str) -> Result<()> {
        let mut parts = text.splitn(2, char::is_whitespace);
        let command = parts.next().unwrap_or("");
        let arg = parts.next().unwrap_or("").trim();

        match command {
            "/start" => {
                if let Err(err) = self.db_upsert_user(msg.sender_id).await {
                    warn!({ error = %err }, "failed to record user");
                }
                self.upstream.send_text(msg.chat_id, HELP_TEXT).await?;
            }
            "/help" => {
                self.upstream.send_text(msg.chat_id, HELP_TEXT).await?;
            }
            "/list" => {
                let page = arg.parse::<u64>().unwrap_or(0);
                let files = self.db_list_by_user(msg.sender_id, page).await?;

                self.upstream
                    .send_text(msg.chat_id, &self.render_listing(&files, "no files archived yet"))
                    .await?;
            }
            "/search" => {
                if arg.is_empty() {
                    self.upstream
                        .send_text(msg.chat_id, "usage: /search <text>")
                        .await?;
                    return Ok(());
                }

                let files = self.db_search_by_user(msg.sender_id, arg.to_string()).await?;

                self.upstream
                    .send_text(msg.chat_id, &self.render_listing(&files, "nothing matched"))
                    .await?;
            }
            "/del" => {
                let Ok(msg_id) = arg.parse::<MsgId>() else {
                    self.upstream
                        .send_text(msg.chat_id, "usage: /del <id from /list>")
                        .await?;
                    return Ok(());
                };

                let removed = self.db_soft_delete(msg_id, msg.sender_id).await?;

                self.upstream
                    .send_text(
                        msg.chat_id,
                        if removed {
                            "removed from the index"
                        } else {
                            "no such file of yours"
                        },
                    )
                    .await?;
            }
            _ => {
                self.upstream
                    .send_text(msg.chat_id, "unknown command; /help lists what i can do")
                    .await?;
            }
        }

        Ok(())
    }

    fn render_listing(&self, files: &[ArchivedFile], empty: &str) -> String {
        if files.is_empty() {
            return empty.to_string();
        }

        files
            .iter()
            .map(|file| {
                format!(
                    "[{}] {} ({} MiB)\n{}",
                    file.msg_id,
                    file.display_name,
                    file.size_bytes / (1024 * 1024),
                    self.link_for(file)
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(sender_id = msg.sender_id))]
    async fn handle_url(&self, msg: &IncomingMessage, url: &str) -> Result<()> {
        self.upstream
            .send_text(msg.chat_id, "looking up available qualities ...")
            .await?;

        let probe = match self.fetcher.probe(url).await {
            Ok(probe) => probe,
            Err(err) => {
                warn!({ error = %err }, "url probe failed");
                self.upstream
                    .send_text(msg.chat_id, "could not read that url")
                    .await?;
                return Ok(());
            }
        };

        if let Some(duration) = probe.duration_seconds {
            if duration > self.config.max_duration_secs {
                self.upstream
                    .send_text(
                        msg.chat_id,
                        &format!(
                            "that video exceeds the {} hour duration cap",
                            self.config.max_duration_secs / 3600
                        ),
                    )
                    .await?;
                return Ok(());
            }
        }

        if probe.candidates.is_empty() {
            self.upstream
                .send_text(msg.chat_id, "no downloadable video formats found")
                .await?;
            return Ok(());
        }

        let buttons: Vec<(String, Vec<u8>)> = probe
            .candidates
            .iter()
            .map(|c| (c.label.clone(), c.format_id.clone().into_bytes()))
            .collect();

        self.upstream
            .send_keyboard(
                msg.chat_id,
                &format!("pick a quality for \"{}\"", probe.title),
                &buttons,
            )
            .await?;

        self.pending.insert(
            msg.sender_id,
            Pending::Url(UrlState {
                url: url.to_string(),
                title: probe.title,
                duration_seconds: probe.duration_seconds,
                candidates: probe.candidates,
                since: Instant::now(),
            }),
        );

        Ok(())
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(sender_id = sender_id))]
    async fn handle_callback(
        &self,
        chat_id: i64,
        sender_id: UserId,
        data: Vec<u8>,
    ) -> Result<()> {
        let format_id = String::from_utf8_lossy(&data).to_string();

        let Some(Pending::Url(url_state)) = self.pending.take(sender_id) else {
            self.upstream
                .send_text(chat_id, "that selection expired; send the url again")
                .await?;
            return Ok(());
        };

        let Some(candidate) = url_state
            .candidates
            .iter()
            .find(|c| c.format_id == format_id)
            .cloned()
        else {
            self.upstream
                .send_text(chat_id, "unknown selection; send the url again")
                .await?;
            return Ok(());
        };

        self.fetch_and_archive(chat_id, sender_id, url_state, candidate)
            .await
    }

    async fn fetch_and_archive(
        &self,
        chat_id: i64,
        sender_id: UserId,
        url_state: UrlState,
        candidate: FetchCandidate,
    ) -> Result<()> {
        let suffix = Alphanumeric.sample_string(&mut rand::rng(), 8);
        let scratch = ScratchFile::new(
            self.fetcher
                .scratch_dir()
                .join(format!("fetch-{sender_id}-{suffix}.mp4")),
        );

        let progress_msg = self
            .upstream
            .send_text(chat_id, &format!("fetching {} ...", candidate.label))
            .await?;

        let progress = Progress::new(self.upstream.clone(), chat_id, progress_msg);

        let download_url = url_state.url.clone();
        let download = self
            .fetcher
            .download(&download_url, &candidate.format_id, scratch.path());
        tokio::pin!(download);

        let mut ticker = tokio::time::interval(Duration::from_secs(2));
        ticker.tick().await; // the first tick fires immediately

        // report scratch growth while the fetcher runs; edits are
        // rate-limited so a fast download sends at most a couple
        let result = loop {
            tokio::select! {
                result = &mut download => break result,
                _ = ticker.tick() => {
                    if let Ok(meta) = tokio::fs::metadata(scratch.path()).await {
                        progress
                            .update(&format!(
                                "downloading ... {} MiB",
                                meta.len() / (1024 * 1024)
                            ))
                            .await;
                    }
                }
            }
        };

        if let Err(err) = result {
            warn!({ error = %err }, "url fetch failed");
            progress.finish("download failed; nothing archived").await;
            return Ok(());
        }

        progress.finish("uploading to the archive ...").await;

        let display_name = format!("{}.mp4", url_state.title);
        let mime = mime_guess::from_path(scratch.path())
            .first_raw()
            .unwrap_or("video/mp4");

        let (new_msg_id, doc) = self
            .upstream
            .send_file(
                self.config.archive_channel,
                scratch.path(),
                &display_name,
                mime,
            )
            .await?;

        let file = ArchivedFile {
            msg_id: new_msg_id,
            channel_id: self.config.archive_channel,
            file_unique_id: doc.unique_id,
            display_name,
            size_bytes: doc.size,
            mime_type: doc.mime_type,
            kind: FileKind::Video,
            duration_seconds: url_state.duration_seconds.map(|d| d as u32),
            quality_label: Some(candidate.label),
            source: FileSource::ExternalUrl,
            external_url: Some(url_state.url),
            uploaded_by: sender_id,
            created_at: Local::now().timestamp(),
            is_active: true,
        };

        let link = self.link_for(&file);

        // an unindexed archive entry is unreachable, so a failed write
        // must not hand out a link
        if let Err(err) = self.db_put_file(file).await {
            error!({ error = %err }, "failed to index fetched file");
            self.upstream
                .send_text(chat_id, "archived the file but failed to index it; try again")
                .await?;
            return Ok(());
        }

        self.upstream
            .send_text(chat_id, &format!("archived: {link}"))
            .await?;

        Ok(())
    }

    async fn finalize_upload(
        &self,
        chat_id: i64,
        sender_id: UserId,
        upload: UploadState,
        display_name: String,
    ) -> Result<()> {
        let new_msg_id = self
            .upstream
            .forward_to_channel(upload.src_chat, upload.src_msg_id, self.config.archive_channel)
            .await?;

        let file = ArchivedFile {
            msg_id: new_msg_id,
            channel_id: self.config.archive_channel,
            file_unique_id: upload.doc.unique_id.clone(),
            display_name,
            size_bytes: upload.doc.size,
            mime_type: upload.doc.mime_type.clone(),
            kind: FileKind::from_mime(&upload.doc.mime_type),
            duration_seconds: upload.doc.duration_seconds,
            quality_label: None,
            source: FileSource::DirectUpload,
            external_url: None,
            uploaded_by: sender_id,
            created_at: Local::now().timestamp(),
            is_active: true,
        };

        let link = self.link_for(&file);

        if let Err(err) = self.db_put_file(file).await {
            error!({ error = %err }, "failed to index uploaded file");
            self.upstream
                .send_text(chat_id, "archived the file but failed to index it; try again")
                .await?;
            return Ok(());
        }

        self.upstream
            .send_text(chat_id, &format!("archived: {link}"))
            .await?;

        Ok(())
    }
}

// progress edits are rate-limited to at least one second apart; the
// platform penalizes chatty edits with flood waits
struct Progress {
    upstream: Arc<dyn Upstream>,
    chat_id: i64,
    msg_id: MsgId,
    last: Mutex<Instant>,
}

impl Progress {
    fn new(upstream: Arc<dyn Upstream>, chat_id: i64, msg_id: MsgId) -> Self {
        Progress {
            upstream,
            chat_id,
            msg_id,
            // the creating send_text counts as the first emission
            last: Mutex::new(Instant::now()),
        }
    }

    async fn update(&self, text: &str) {
        let mut last = self.last.lock().await;

        if last.elapsed() < Duration::from_secs(1) {
            return;
        }

        if let Err(err) = self.upstream.edit_text(self.chat_id, self.msg_id, text).await {
            debug!({ error = %err }, "progress edit failed");
        }

        *last = Instant::now();
    }

    // terminal edits always go out
    async fn finish(&self, text: &str) {
        if let Err(err) = self.upstream.edit_text(self.chat_id, self.msg_id, text).await {
            debug!({ error = %err }, "final progress edit failed");
        }

        *self.last.lock().await = Instant::now();
    }
}

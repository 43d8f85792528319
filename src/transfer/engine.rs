//! Transfer engine: chunked uploads, streamed downloads, progress, and
//! cancellation.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::common::config::DOWNLOAD_CHUNK_SIZE;
use crate::common::{AppError, LimitSettings};
use crate::events::{Event, EventBus};
use crate::lifecycle::LifecycleController;
use crate::session::{Session, SessionMode, SessionRegistry};
use crate::transfer::storage::UploadStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Cancelled | TransferState::Failed
        )
    }
}

/// Filename and (optional) size a client declares before streaming.
#[derive(Debug, Clone)]
pub struct DeclaredFile {
    pub name: String,
    pub size: Option<u64>,
}

struct TransferIo {
    storage: Option<UploadStorage>,
    last_activity: Instant,
}

/// One upload or download attempt, possibly spanning several named byte
/// streams, bound to a session. Bytes only ever grow while in progress;
/// once terminal the record is immutable.
pub struct Transfer {
    id: Uuid,
    session: Arc<Session>,
    direction: TransferDirection,
    declared: Vec<String>,
    total_bytes: Option<u64>,
    bytes_transferred: AtomicU64,
    state: RwLock<TransferState>,
    io: tokio::sync::Mutex<TransferIo>,
}

impl Transfer {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn declared_filenames(&self) -> &[String] {
        &self.declared
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> TransferState {
        match self.state.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// `floor(bytes / total * 100)`, capped at 100; None when the total is
    /// unknown.
    pub fn percent(&self) -> Option<u8> {
        let total = self.total_bytes?;
        if total == 0 {
            return Some(100);
        }
        let pct = (self.bytes_transferred() as u128 * 100) / total as u128;
        Some(pct.min(100) as u8)
    }

    fn set_state(&self, next: TransferState) {
        let mut guard = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = next;
    }

    fn progress_event(&self) -> Event {
        Event::UploadProgress {
            transfer_id: self.id.to_string(),
            bytes_transferred: self.bytes_transferred(),
            percent: self.percent(),
        }
    }
}

/// Owns the active-transfer set; every transfer mutation flows through here.
pub struct TransferEngine {
    registry: Arc<SessionRegistry>,
    bus: Arc<EventBus>,
    lifecycle: Arc<LifecycleController>,
    transfers: DashMap<Uuid, Arc<Transfer>>,
    destination: PathBuf,
    limits: LimitSettings,
}

impl TransferEngine {
    pub fn new(
        registry: Arc<SessionRegistry>,
        bus: Arc<EventBus>,
        lifecycle: Arc<LifecycleController>,
        destination: PathBuf,
        limits: LimitSettings,
    ) -> Self {
        Self {
            registry,
            bus,
            lifecycle,
            transfers: DashMap::new(),
            destination,
            limits,
        }
    }

    pub fn get(&self, id: Uuid) -> Result<Arc<Transfer>, AppError> {
        self.transfers
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("no such transfer: {id}")))
    }

    pub fn active_count(&self) -> usize {
        self.transfers
            .iter()
            .filter(|entry| !entry.value().state().is_terminal())
            .count()
    }

    /// A single-use session gets exactly one live transfer, so it can never
    /// end up with a second completion racing past its atomic close.
    fn check_session_slot(&self, session: &Session) -> Result<(), AppError> {
        let slug = session.slug();
        let live = self
            .transfers
            .iter()
            .filter(|entry| {
                entry.value().session().slug() == slug && !entry.value().state().is_terminal()
            })
            .count();
        let cap = if session.is_persistent() {
            self.limits.max_active_transfers
        } else {
            1
        };
        if live >= cap {
            return Err(AppError::Capacity(format!(
                "session already has {live} transfers in progress"
            )));
        }
        Ok(())
    }

    /// Register a new upload against an upload-capable session.
    pub async fn begin_upload(
        &self,
        slug: &str,
        declared: Vec<DeclaredFile>,
    ) -> Result<Arc<Transfer>, AppError> {
        let session = self.registry.validate(slug)?;
        if !matches!(session.mode(), SessionMode::Upload) {
            return Err(AppError::BadRequest(
                "session does not accept uploads".to_string(),
            ));
        }
        self.check_session_slot(&session)?;

        // Unknown until the client declares every file with a size; an
        // undeclared batch streams with no percent at all.
        let total_bytes = if declared.is_empty() {
            None
        } else {
            declared
                .iter()
                .map(|file| file.size)
                .try_fold(0u64, |acc, size| size.map(|s| acc + s))
        };
        let names: Vec<String> = declared.into_iter().map(|file| file.name).collect();

        let id = Uuid::new_v4();
        let storage = UploadStorage::create(&self.destination, &id.to_string()).await?;

        let transfer = Arc::new(Transfer {
            id,
            session: session.clone(),
            direction: TransferDirection::Upload,
            declared: names.clone(),
            total_bytes,
            bytes_transferred: AtomicU64::new(0),
            state: RwLock::new(TransferState::Pending),
            io: tokio::sync::Mutex::new(TransferIo {
                storage: Some(storage),
                last_activity: Instant::now(),
            }),
        });

        session.transfer_started();
        self.lifecycle.transfer_started();
        self.transfers.insert(id, transfer.clone());
        tracing::info!(transfer = %id, slug, files = names.len(), "upload started");

        self.bus.publish(
            slug,
            Event::UploadStarted {
                transfer_id: id.to_string(),
                filenames: names,
            },
        );
        Ok(transfer)
    }

    /// Start the next named byte stream within an upload batch. Returns the
    /// name the file was saved under (collisions get a `-2` style suffix and
    /// a status broadcast).
    pub async fn open_file(&self, id: Uuid, name: &str) -> Result<String, AppError> {
        let transfer = self.get(id)?;
        let mut io = transfer.io.lock().await;
        if transfer.state().is_terminal() {
            return Err(AppError::BadRequest(
                "transfer is no longer accepting data".to_string(),
            ));
        }
        let storage = io
            .storage
            .as_mut()
            .ok_or_else(|| AppError::BadRequest("not an upload transfer".to_string()))?;
        let opened = storage.open_file(name).await?;
        io.last_activity = Instant::now();

        if let Some(original) = &opened.renamed_from {
            self.bus.publish(
                transfer.session().slug(),
                Event::StatusChanged {
                    msg: format!("{original} was saved as {}", opened.saved_name),
                    connected_users: Vec::new(),
                },
            );
        }
        Ok(opened.saved_name)
    }

    /// Append one chunk at the expected offset. Rejecting a chunk never
    /// mutates `bytes_transferred`.
    pub async fn write_chunk(&self, id: Uuid, offset: u64, bytes: &[u8]) -> Result<u64, AppError> {
        let transfer = self.get(id)?;
        let mut io = transfer.io.lock().await;

        if transfer.state().is_terminal() {
            return Err(AppError::BadRequest(
                "transfer is no longer accepting data".to_string(),
            ));
        }

        let expected = transfer.bytes_transferred();
        if offset != expected {
            return Err(AppError::OutOfOrder {
                expected,
                got: offset,
            });
        }

        let limit = self.limits.max_transfer_bytes;
        if limit > 0 && expected + bytes.len() as u64 > limit {
            return Err(AppError::SizeLimitExceeded { limit });
        }

        let storage = io
            .storage
            .as_mut()
            .ok_or_else(|| AppError::BadRequest("not an upload transfer".to_string()))?;
        // Convenience for single-shot clients: fall through to the next
        // declared name when no stream is open yet.
        if !storage.has_open_file() {
            let opened = storage.saved_names().len();
            let name = transfer
                .declared
                .get(opened)
                .cloned()
                .ok_or_else(|| AppError::BadRequest("no file stream open".to_string()))?;
            storage.open_file(&name).await?;
        }
        storage.append(bytes).await?;

        transfer
            .bytes_transferred
            .fetch_add(bytes.len() as u64, Ordering::SeqCst);
        if transfer.state() == TransferState::Pending {
            transfer.set_state(TransferState::InProgress);
        }
        io.last_activity = Instant::now();

        let new_total = transfer.bytes_transferred();
        tracing::debug!(transfer = %id, offset, bytes = bytes.len(), "chunk_write");
        self.bus
            .publish(transfer.session().slug(), transfer.progress_event());
        Ok(new_total)
    }

    /// Finish an upload: flush storage, mark completed, and close the
    /// session in the same step when it is single-use.
    pub async fn complete_upload(&self, id: Uuid) -> Result<Vec<String>, AppError> {
        let transfer = self.get(id)?;
        let mut io = transfer.io.lock().await;

        if transfer.state().is_terminal() {
            return Err(AppError::BadRequest(
                "transfer already reached a terminal state".to_string(),
            ));
        }

        let storage = io
            .storage
            .as_mut()
            .ok_or_else(|| AppError::BadRequest("not an upload transfer".to_string()))?;
        storage.finalize().await?;
        let saved = storage.saved_names().to_vec();

        self.finish(&transfer, TransferState::Completed);
        tracing::info!(transfer = %id, files = saved.len(), "upload completed");
        Ok(saved)
    }

    /// Cancel from any non-terminal state, releasing partial data. No
    /// further progress events are emitted for this transfer.
    pub async fn cancel(&self, id: Uuid) -> Result<(), AppError> {
        let transfer = self.get(id)?;
        let mut io = transfer.io.lock().await;

        if transfer.state().is_terminal() {
            return Err(AppError::BadRequest(
                "transfer already reached a terminal state".to_string(),
            ));
        }

        if let Some(storage) = io.storage.as_mut() {
            storage.discard().await;
        }
        transfer.set_state(TransferState::Cancelled);
        transfer.session().transfer_finished();
        tracing::info!(transfer = %id, "transfer cancelled");
        Ok(())
    }

    /// Open a download against a download-capable session. The returned
    /// cursor yields chunks lazily; progress counts bytes handed to the
    /// transport, and a fresh call reopens from the start.
    pub async fn begin_download(
        self: &Arc<Self>,
        slug: &str,
    ) -> Result<(Arc<Transfer>, DownloadCursor), AppError> {
        let session = self.registry.validate(slug)?;
        let sources = match session.mode() {
            SessionMode::Download { sources } => sources.clone(),
            _ => {
                return Err(AppError::BadRequest(
                    "session does not serve downloads".to_string(),
                ))
            }
        };
        self.check_session_slot(&session)?;

        let mut total = 0u64;
        let mut names = Vec::with_capacity(sources.len());
        for path in &sources {
            let meta = tokio::fs::metadata(path)
                .await
                .with_context(|| format!("stat shared file {}", path.display()))?;
            total += meta.len();
            names.push(
                path.file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("download")
                    .to_string(),
            );
        }

        let id = Uuid::new_v4();
        let transfer = Arc::new(Transfer {
            id,
            session: session.clone(),
            direction: TransferDirection::Download,
            declared: names.clone(),
            total_bytes: Some(total),
            bytes_transferred: AtomicU64::new(0),
            state: RwLock::new(TransferState::InProgress),
            io: tokio::sync::Mutex::new(TransferIo {
                storage: None,
                last_activity: Instant::now(),
            }),
        });

        session.transfer_started();
        self.lifecycle.transfer_started();
        self.transfers.insert(id, transfer.clone());
        tracing::info!(transfer = %id, slug, total, "download started");

        self.bus.publish(
            slug,
            Event::UploadStarted {
                transfer_id: id.to_string(),
                filenames: names,
            },
        );

        let cursor = DownloadCursor {
            engine: self.clone(),
            transfer: transfer.clone(),
            sources,
            next_index: 0,
            current: None,
            done: false,
        };
        Ok((transfer, cursor))
    }

    async fn record_download_progress(&self, transfer: &Arc<Transfer>, bytes: u64) {
        {
            let mut io = transfer.io.lock().await;
            io.last_activity = Instant::now();
        }
        transfer.bytes_transferred.fetch_add(bytes, Ordering::SeqCst);
        self.bus
            .publish(transfer.session().slug(), transfer.progress_event());
    }

    async fn finish_download(&self, transfer: &Arc<Transfer>) {
        let _io = transfer.io.lock().await;
        if transfer.state().is_terminal() {
            return;
        }
        self.finish(transfer, TransferState::Completed);
        tracing::info!(transfer = %transfer.id(), "download completed");
    }

    async fn fail_download(&self, transfer: &Arc<Transfer>) {
        let _io = transfer.io.lock().await;
        if transfer.state().is_terminal() {
            return;
        }
        transfer.set_state(TransferState::Failed);
        transfer.session().transfer_finished();
    }

    /// Terminal bookkeeping shared by upload and download completion. Runs
    /// while the caller holds the transfer's io lock, so the state change
    /// and the single-use session closure are one atomic step.
    fn finish(&self, transfer: &Arc<Transfer>, terminal: TransferState) {
        transfer.set_state(terminal);
        let session = transfer.session();
        session.transfer_finished();
        if terminal == TransferState::Completed && !session.is_persistent() {
            session.close_now();
        }
        self.bus.publish(
            session.slug(),
            Event::UploadCompleted {
                transfer_id: transfer.id().to_string(),
            },
        );
        self.lifecycle.transfer_completed(session.is_persistent());
    }

    /// Auto-cancel idle transfers and drop terminal ones from the active
    /// set. Idle cleanup is logged, never surfaced to clients.
    pub async fn sweep(&self, idle_timeout: Duration) {
        let now = Instant::now();
        let candidates: Vec<Arc<Transfer>> = self
            .transfers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for transfer in candidates {
            if transfer.state().is_terminal() {
                self.transfers.remove(&transfer.id());
                continue;
            }
            let idle = {
                let io = transfer.io.lock().await;
                now.duration_since(io.last_activity)
            };
            if idle > idle_timeout {
                tracing::warn!(
                    transfer = %transfer.id(),
                    idle_secs = idle.as_secs(),
                    "{}",
                    AppError::IdleTimeout
                );
                if let Err(err) = self.cancel(transfer.id()).await {
                    tracing::debug!(transfer = %transfer.id(), error = %err, "idle cancel raced");
                }
            }
        }
    }
}

/// Lazily reads the session's source files in order, emitting a progress
/// event per chunk produced. Dropping the cursor stops chunk production;
/// the idle sweeper reaps the abandoned transfer.
pub struct DownloadCursor {
    engine: Arc<TransferEngine>,
    transfer: Arc<Transfer>,
    sources: Vec<PathBuf>,
    next_index: usize,
    current: Option<tokio::fs::File>,
    done: bool,
}

impl DownloadCursor {
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, std::io::Error>> {
        if self.done {
            return None;
        }
        // A cancel from another handler stops production mid-stream.
        if self.transfer.state().is_terminal() {
            self.done = true;
            return None;
        }

        loop {
            if self.current.is_none() {
                if self.next_index >= self.sources.len() {
                    self.done = true;
                    self.engine.finish_download(&self.transfer).await;
                    return None;
                }
                let path = &self.sources[self.next_index];
                self.next_index += 1;
                match tokio::fs::File::open(path).await {
                    Ok(file) => self.current = Some(file),
                    Err(err) => {
                        self.done = true;
                        self.engine.fail_download(&self.transfer).await;
                        return Some(Err(err));
                    }
                }
            }

            let file = self.current.as_mut()?;
            let mut buf = BytesMut::zeroed(DOWNLOAD_CHUNK_SIZE as usize);
            match file.read(&mut buf).await {
                Ok(0) => {
                    self.current = None;
                }
                Ok(n) => {
                    buf.truncate(n);
                    self.engine
                        .record_download_progress(&self.transfer, n as u64)
                        .await;
                    return Some(Ok(buf.freeze()));
                }
                Err(err) => {
                    self.done = true;
                    self.engine.fail_download(&self.transfer).await;
                    return Some(Err(err));
                }
            }
        }
    }

    /// Adapt the cursor into a byte stream for the response body.
    pub fn into_stream(self) -> impl futures_util::Stream<Item = Result<Bytes, std::io::Error>> {
        futures_util::stream::unfold(self, |mut cursor| async move {
            cursor.next_chunk().await.map(|item| (item, cursor))
        })
    }
}

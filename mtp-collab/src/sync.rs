//! Sync engine: turns local snapshots into outbound edits and folds inbound
//! messages back into per-file state.
//!
//! Every open file has a [`PerFileSyncState`] guarded by one mutex. A local
//! edit and a remote apply each hold an [`EditPhase`] other than `Idle` while
//! they call out to listeners; a callback arriving while the phase is not
//! `Idle` is dropped, not queued. This is what keeps a remote apply that
//! updates the editor buffer from being re-sent as a local edit.
//!
//! Listeners are always invoked with the mutex released, so they may call
//! back into the engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::catalog::FileCatalog;
use crate::edit::{EditKind, EditOp};
use crate::extract::{self, InputValidator, ValidationError};
use crate::framer::DEFAULT_MAX_FRAME_LEN;
use crate::protocol::{Escaping, FileListEntry, Message, MessageType};
use crate::transport::{OutboundFrame, Transport, TransportError};

/// Client-side tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Delay before the single retry of a failed FILE_LIST or FILE_OPEN send.
    pub retry_delay_ms: u64,
    /// Delay before the authoritative FILE_LIST that follows a FILE_CREATE.
    pub refresh_delay_ms: u64,
    /// Writer pause after each newline unit.
    pub newline_pacing_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_frame_len: usize,
    /// Code points that may not be typed into a shared file.
    pub disallowed_chars: Vec<char>,
    pub escaping: Escaping,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 1000,
            refresh_delay_ms: 500,
            newline_pacing_ms: 30,
            connect_timeout_ms: 5000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            disallowed_chars: Vec::new(),
            escaping: Escaping::Legacy,
        }
    }
}

impl SyncConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn refresh_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_delay_ms)
    }

    pub fn newline_pacing(&self) -> Duration {
        Duration::from_millis(self.newline_pacing_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("file {0} is not open")]
    FileNotOpen(String),
}

/// Guarded section a file is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EditPhase {
    #[default]
    Idle,
    LocalEditInFlight,
    RemoteApplyInFlight,
}

/// Sync state of one open file.
#[derive(Debug)]
pub struct PerFileSyncState {
    pub file_id: String,
    /// Last snapshot known to match the server.
    pub last_synced: String,
    pub phase: EditPhase,
    /// Set once FILE_CONTENT has arrived.
    pub loaded: bool,
    retry: Option<JoinHandle<()>>,
}

impl PerFileSyncState {
    fn new(file_id: &str) -> Self {
        Self {
            file_id: file_id.to_string(),
            last_synced: String::new(),
            phase: EditPhase::Idle,
            loaded: false,
            retry: None,
        }
    }

    pub fn applying_remote(&self) -> bool {
        self.phase == EditPhase::RemoteApplyInFlight
    }

    pub fn extracting(&self) -> bool {
        self.phase == EditPhase::LocalEditInFlight
    }

    fn cancel_retry(&mut self) {
        if let Some(handle) = self.retry.take() {
            handle.abort();
        }
    }
}

impl Drop for PerFileSyncState {
    fn drop(&mut self) {
        self.cancel_retry();
    }
}

/// Notifications delivered to collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Authenticated { user_id: String },
    FileList(Vec<FileListEntry>),
    FileOpened { file_id: String, content: String },
    FileCreated { file_id: String, name: String },
    FileDeleted { file_id: String },
    /// A remote edit was applied; `content` is the file after it.
    RemoteEdit { op: EditOp, content: String },
    /// The server replaced the whole content of an open file.
    ContentReplaced { file_id: String, content: String },
    /// A local edit failed validation. The editor should show `revert_to`.
    LocalEditRejected {
        file_id: String,
        revert_to: String,
        reason: String,
    },
    Error(String),
    ConnectionLost(String),
}

/// What [`SyncEngine::submit_local_edit`] did with a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalEditOutcome {
    /// `messages` frames were handed to the transport.
    Sent { messages: usize },
    /// Nothing representable changed.
    Unchanged,
    /// Another guarded section was active, or the file has not loaded yet.
    Suppressed,
}

pub type SubscriptionId = u64;

pub type EventCallback = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Thread-safe registry of event listeners.
pub struct ListenerRegistry {
    callbacks: RwLock<HashMap<SubscriptionId, EventCallback>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, callback: EventCallback) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, callback);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Invoke every listener. The registry lock is released first, so a
    /// listener may subscribe or unsubscribe. A panicking listener does not
    /// stop the others.
    pub fn emit(&self, event: &SyncEvent) {
        let callbacks: Vec<EventCallback> = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for callback in callbacks {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(event))).is_err() {
                log::error!("Sync listener panicked while handling {event:?}");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

/// Client-side edit synchronization.
///
/// All methods are synchronous and may be called from any thread. Delayed
/// work (retries, the refresh after a create) is scheduled on the runtime
/// handle given to [`SyncEngine::new`].
pub struct SyncEngine {
    me: Weak<SyncEngine>,
    config: SyncConfig,
    validator: InputValidator,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    user_id: RwLock<Option<String>>,
    files: Mutex<HashMap<String, PerFileSyncState>>,
    catalog: Mutex<FileCatalog>,
    list_retry: Mutex<Option<JoinHandle<()>>>,
    listeners: ListenerRegistry,
    connection_lost: AtomicBool,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, transport: Arc<dyn Transport>, runtime: Handle) -> Arc<Self> {
        let validator = InputValidator::new(config.disallowed_chars.iter().copied());
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            validator,
            transport,
            runtime,
            user_id: RwLock::new(None),
            files: Mutex::new(HashMap::new()),
            catalog: Mutex::new(FileCatalog::new()),
            list_retry: Mutex::new(None),
            listeners: ListenerRegistry::new(),
            connection_lost: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // --- listeners ---

    pub fn subscribe(&self, callback: EventCallback) -> SubscriptionId {
        self.listeners.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Called with each applied remote edit and the resulting content.
    pub fn on_remote_operation(
        &self,
        callback: impl Fn(&EditOp, &str) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscribe(Arc::new(move |event| {
            if let SyncEvent::RemoteEdit { op, content } = event {
                callback(op, content);
            }
        }))
    }

    /// Called with the full list whenever it changes.
    pub fn on_file_list_updated(
        &self,
        callback: impl Fn(&[FileListEntry]) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscribe(Arc::new(move |event| {
            if let SyncEvent::FileList(entries) = event {
                callback(entries);
            }
        }))
    }

    /// Called with the initial content of each file as FILE_CONTENT arrives.
    pub fn on_file_opened(
        &self,
        callback: impl Fn(&str, &str) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscribe(Arc::new(move |event| {
            if let SyncEvent::FileOpened { file_id, content } = event {
                callback(file_id, content);
            }
        }))
    }

    /// Called with `(file_id, content)` whenever the editor buffer must be
    /// rewritten: a file opened, a remote edit or content replacement was
    /// applied, or a rejected local edit has to be reverted.
    ///
    /// The callback runs while the file's phase is not `Idle`, so a
    /// [`submit_local_edit`](Self::submit_local_edit) fired by the buffer
    /// write is suppressed. This is the path an editor must use to update
    /// its buffer; events read later from a channel may be stale.
    pub fn on_buffer_update(
        &self,
        callback: impl Fn(&str, &str) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscribe(Arc::new(move |event| match event {
            SyncEvent::FileOpened { file_id, content }
            | SyncEvent::ContentReplaced { file_id, content } => callback(file_id, content),
            SyncEvent::RemoteEdit { op, content } => callback(&op.file_id, content),
            SyncEvent::LocalEditRejected {
                file_id, revert_to, ..
            } => callback(file_id, revert_to),
            _ => {}
        }))
    }

    /// Called once when the connection is lost.
    pub fn on_connection_error(
        &self,
        callback: impl Fn(&str) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscribe(Arc::new(move |event| {
            if let SyncEvent::ConnectionLost(reason) = event {
                callback(reason);
            }
        }))
    }

    // --- identity ---

    pub fn user_id(&self) -> Option<String> {
        self.user_id.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_user_id(&self, user_id: Option<String>) {
        *self.user_id.write().unwrap_or_else(PoisonError::into_inner) = user_id;
    }

    pub fn connect_user(&self, username: &str) -> Result<(), SyncError> {
        self.send(&Message::connect(username))
    }

    pub fn login(&self, username: &str, password: &str) -> Result<(), SyncError> {
        self.send(&Message::login(username, password))
    }

    pub fn register(&self, username: &str, password: &str) -> Result<(), SyncError> {
        self.send(&Message::register(username, password))
    }

    // --- inspection ---

    pub fn is_open(&self, file_id: &str) -> bool {
        self.lock_files().contains_key(file_id)
    }

    /// Last synced content of an open file.
    pub fn content(&self, file_id: &str) -> Option<String> {
        self.lock_files().get(file_id).map(|s| s.last_synced.clone())
    }

    pub fn phase(&self, file_id: &str) -> Option<EditPhase> {
        self.lock_files().get(file_id).map(|s| s.phase)
    }

    pub fn file_list(&self) -> Vec<FileListEntry> {
        self.lock_catalog().entries()
    }

    // --- local edits ---

    /// Diff `snapshot` against the last synced content of `file_id` and
    /// transmit the result.
    ///
    /// Inserts go out one character per `TEXT_INSERT`, with a pacing delay
    /// after line breaks; deletes go out as a single `TEXT_DELETE`. The last
    /// synced content advances only once every frame has been handed to the
    /// transport. Text with a disallowed character is never sent: listeners
    /// get [`SyncEvent::LocalEditRejected`] carrying the content to restore.
    pub fn submit_local_edit(
        &self,
        file_id: &str,
        snapshot: &str,
    ) -> Result<LocalEditOutcome, SyncError> {
        let user = self.user_id();
        let mut files = self.lock_files();
        let state = files
            .get_mut(file_id)
            .ok_or_else(|| SyncError::FileNotOpen(file_id.to_string()))?;

        if state.phase != EditPhase::Idle || !state.loaded {
            log::debug!(
                "Suppressing local change on {file_id} (phase {:?}, loaded {})",
                state.phase,
                state.loaded
            );
            return Ok(LocalEditOutcome::Suppressed);
        }

        let Some(edit) = extract::diff(&state.last_synced, snapshot) else {
            return Ok(LocalEditOutcome::Unchanged);
        };
        state.phase = EditPhase::LocalEditInFlight;

        if let EditKind::Insert(text) = &edit.kind {
            if let Err(e) = self.validator.check(text) {
                let revert_to = state.last_synced.clone();
                drop(files);
                log::warn!("Rejected local edit on {file_id}: {e}");
                self.listeners.emit(&SyncEvent::LocalEditRejected {
                    file_id: file_id.to_string(),
                    revert_to,
                    reason: e.to_string(),
                });
                self.set_phase(file_id, EditPhase::Idle);
                return Err(e.into());
            }
        }

        let frames: Vec<OutboundFrame> = match &edit.kind {
            EditKind::Insert(text) => extract::split_units(edit.position, text)
                .into_iter()
                .filter_map(|unit| match unit.kind {
                    EditKind::Insert(ch) => Some(self.insert_frame(user.as_deref(), file_id, unit.position, &ch)),
                    EditKind::Delete(_) => None,
                })
                .collect(),
            EditKind::Delete(length) => vec![OutboundFrame::new(self.encode(&Message::text_delete(
                user.as_deref(),
                file_id,
                edit.position,
                *length,
            )))],
        };

        let mut result = Ok(frames.len());
        for frame in frames {
            if let Err(e) = self.transport.send(frame) {
                result = Err(e);
                break;
            }
        }

        match result {
            Ok(messages) => {
                state.last_synced = snapshot.to_string();
                state.phase = EditPhase::Idle;
                log::debug!("Sent {messages} frame(s) for local edit on {file_id}");
                Ok(LocalEditOutcome::Sent { messages })
            }
            Err(e) => {
                state.phase = EditPhase::Idle;
                log::warn!("Local edit on {file_id} not sent: {e}");
                Err(e.into())
            }
        }
    }

    fn insert_frame(&self, user: Option<&str>, file_id: &str, position: usize, unit: &str) -> OutboundFrame {
        let line = self.encode(&Message::text_insert(user, file_id, position, unit));
        if extract::is_newline_unit(unit) {
            OutboundFrame::paced(line, self.config.newline_pacing())
        } else {
            OutboundFrame::new(line)
        }
    }

    // --- remote edits ---

    /// Apply a `TEXT_INSERT`, `TEXT_DELETE` or positional `TEXT_UPDATE` to
    /// its open file. Returns the new content, or `None` when the message was
    /// discarded (undecodable, file not open, re-entrant, or out of range).
    pub fn apply_remote(&self, msg: &Message) -> Option<String> {
        let Some(op) = EditOp::from_message(msg) else {
            log::debug!("Ignoring undecodable {} message", msg.msg_type);
            return None;
        };

        let content = {
            let mut files = self.lock_files();
            let Some(state) = files.get_mut(&op.file_id) else {
                log::debug!("Ignoring remote edit for unopened file {}", op.file_id);
                return None;
            };
            if state.phase != EditPhase::Idle {
                log::warn!(
                    "Dropping remote edit on {} during {:?}",
                    op.file_id,
                    state.phase
                );
                return None;
            }
            match op.edit.apply(&state.last_synced) {
                Ok(content) => {
                    state.last_synced = content.clone();
                    state.phase = EditPhase::RemoteApplyInFlight;
                    content
                }
                Err(e) => {
                    log::debug!("Discarding remote edit on {}: {e}", op.file_id);
                    return None;
                }
            }
        };

        let file_id = op.file_id.clone();
        self.listeners.emit(&SyncEvent::RemoteEdit {
            op,
            content: content.clone(),
        });
        self.set_phase(&file_id, EditPhase::Idle);
        Some(content)
    }

    /// Replace the content of an open file wholesale.
    fn resync(&self, file_id: &str, content: &str) {
        {
            let mut files = self.lock_files();
            let Some(state) = files.get_mut(file_id) else {
                log::debug!("Ignoring content update for unopened file {file_id}");
                return;
            };
            if state.phase != EditPhase::Idle {
                log::warn!("Dropping content update on {file_id} during {:?}", state.phase);
                return;
            }
            state.last_synced = content.to_string();
            state.loaded = true;
            state.phase = EditPhase::RemoteApplyInFlight;
        }
        self.listeners.emit(&SyncEvent::ContentReplaced {
            file_id: file_id.to_string(),
            content: content.to_string(),
        });
        self.set_phase(file_id, EditPhase::Idle);
    }

    // --- inbound dispatch ---

    /// Route one decoded inbound message.
    pub fn handle_message(&self, msg: &Message) {
        log::trace!("<- {} {:?}", msg.msg_type, msg.file_id);
        match msg.msg_type {
            MessageType::ConnectAck | MessageType::LoginAck | MessageType::RegisterAck => {
                self.handle_ack(msg)
            }
            MessageType::FileListResp => {
                let entries = msg
                    .data_str("files")
                    .map(FileListEntry::parse_list)
                    .unwrap_or_default();
                self.on_file_list(entries);
            }
            MessageType::FileCreate => self.handle_file_created(msg),
            MessageType::FileContent => match &msg.file_id {
                Some(file_id) => self.load_content(file_id, msg.data_str("content").unwrap_or_default()),
                None => log::debug!("FILE_CONTENT without file id"),
            },
            MessageType::FileUpdate => {
                if let (Some(file_id), Some(content)) = (&msg.file_id, msg.data_str("content")) {
                    self.resync(file_id, content);
                }
            }
            MessageType::TextUpdate if msg.data_str("operation").is_none() => {
                if let (Some(file_id), Some(content)) = (&msg.file_id, msg.data_str("content")) {
                    self.resync(file_id, content);
                }
            }
            MessageType::TextInsert | MessageType::TextDelete | MessageType::TextUpdate => {
                self.apply_remote(msg);
            }
            MessageType::FileDeleteAck => match (&msg.file_id, msg.is_success()) {
                (Some(file_id), true) => self.file_deleted(file_id),
                _ => self.listeners.emit(&SyncEvent::Error(
                    msg.data_str("message").unwrap_or("delete failed").to_string(),
                )),
            },
            MessageType::FileDelete => {
                if let Some(file_id) = &msg.file_id {
                    self.file_deleted(file_id);
                }
            }
            MessageType::Error => self.listeners.emit(&SyncEvent::Error(
                msg.data_str("message").unwrap_or("unknown error").to_string(),
            )),
            MessageType::Disconnect => {
                self.handle_connection_lost(msg.data_str("reason").unwrap_or("server disconnected"))
            }
            other => log::debug!("Ignoring inbound {other}"),
        }
    }

    fn handle_ack(&self, msg: &Message) {
        if !msg.is_success() {
            let reason = msg.data_str("message").unwrap_or("request failed");
            log::warn!("{} failed: {reason}", msg.msg_type);
            self.listeners.emit(&SyncEvent::Error(reason.to_string()));
            return;
        }
        match &msg.user_id {
            Some(user_id) => {
                log::info!("Authenticated as {user_id}");
                self.set_user_id(Some(user_id.clone()));
                self.listeners.emit(&SyncEvent::Authenticated {
                    user_id: user_id.clone(),
                });
            }
            None => log::info!("{} succeeded", msg.msg_type),
        }
    }

    fn on_file_list(&self, entries: Vec<FileListEntry>) {
        let list = {
            let mut catalog = self.lock_catalog();
            catalog.replace(entries);
            catalog.entries()
        };
        log::debug!("File list updated: {} entries", list.len());
        self.listeners.emit(&SyncEvent::FileList(list));
    }

    fn handle_file_created(&self, msg: &Message) {
        let (Some(file_id), Some(name)) = (&msg.file_id, msg.data_str("name")) else {
            log::debug!("FILE_CREATE reply without id or name");
            return;
        };
        self.lock_catalog()
            .upsert(FileListEntry::new(file_id.as_str(), name, 0));
        self.listeners.emit(&SyncEvent::FileCreated {
            file_id: file_id.clone(),
            name: name.to_string(),
        });
    }

    fn load_content(&self, file_id: &str, content: &str) {
        {
            let mut files = self.lock_files();
            let state = files
                .entry(file_id.to_string())
                .or_insert_with(|| PerFileSyncState::new(file_id));
            if state.phase != EditPhase::Idle {
                log::warn!("Dropping FILE_CONTENT for {file_id} during {:?}", state.phase);
                return;
            }
            state.cancel_retry();
            state.last_synced = content.to_string();
            state.loaded = true;
            state.phase = EditPhase::RemoteApplyInFlight;
        }
        log::info!("Opened {file_id} ({} bytes)", content.len());
        self.listeners.emit(&SyncEvent::FileOpened {
            file_id: file_id.to_string(),
            content: content.to_string(),
        });
        self.set_phase(file_id, EditPhase::Idle);
    }

    fn file_deleted(&self, file_id: &str) {
        self.lock_catalog().remove(file_id);
        self.close_file(file_id);
        self.listeners.emit(&SyncEvent::FileDeleted {
            file_id: file_id.to_string(),
        });
    }

    // --- file operations ---

    /// Send FILE_LIST. If the send fails, one retry is scheduled.
    pub fn request_file_list(&self) -> Result<(), SyncError> {
        match self.send(&Message::file_list(self.user_id().as_deref())) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!("FILE_LIST not sent ({e}), retrying in {:?}", self.config.retry_delay());
                self.schedule_list_retry(self.config.retry_delay());
                Err(e)
            }
        }
    }

    /// Cancel any pending list retry and request the list now.
    pub fn force_file_list_refresh(&self) -> Result<(), SyncError> {
        if let Some(handle) = self.lock_list_retry().take() {
            handle.abort();
        }
        self.request_file_list()
    }

    fn schedule_list_retry(&self, delay: Duration) {
        let me = self.me.clone();
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(engine) = me.upgrade() else { return };
            let msg = Message::file_list(engine.user_id().as_deref());
            if let Err(e) = engine.send(&msg) {
                log::warn!("FILE_LIST retry failed: {e}");
                engine
                    .listeners
                    .emit(&SyncEvent::Error(format!("file list unavailable: {e}")));
            }
        });
        if let Some(previous) = self.lock_list_retry().replace(handle) {
            previous.abort();
        }
    }

    fn schedule_refresh(&self, delay: Duration) {
        let me = self.me.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(engine) = me.upgrade() {
                let _ = engine.request_file_list();
            }
        });
    }

    /// Validate `name`, send FILE_CREATE, show the name provisionally and
    /// schedule an authoritative list refresh.
    pub fn create_file(&self, name: &str) -> Result<(), SyncError> {
        extract::validate_file_name(name)?;
        let name = name.trim();
        self.send(&Message::file_create(self.user_id().as_deref(), name))?;

        let list = {
            let mut catalog = self.lock_catalog();
            catalog.insert_optimistic(name);
            catalog.entries()
        };
        self.listeners.emit(&SyncEvent::FileList(list));
        self.schedule_refresh(self.config.refresh_delay());
        Ok(())
    }

    /// Start tracking `file_id` and send FILE_OPEN. A failed send is retried
    /// once unless the file is closed first.
    pub fn open_file(&self, file_id: &str) -> Result<(), SyncError> {
        self.lock_files()
            .insert(file_id.to_string(), PerFileSyncState::new(file_id));

        let msg = Message::file_open(self.user_id().as_deref(), file_id);
        match self.send(&msg) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!("FILE_OPEN for {file_id} not sent ({e}), retrying");
                let me = self.me.clone();
                let target = file_id.to_string();
                let delay = self.config.retry_delay();
                let handle = self.runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    let Some(engine) = me.upgrade() else { return };
                    let msg = Message::file_open(engine.user_id().as_deref(), &target);
                    if let Err(e) = engine.send(&msg) {
                        log::warn!("FILE_OPEN retry for {target} failed: {e}");
                        engine
                            .listeners
                            .emit(&SyncEvent::Error(format!("could not open {target}: {e}")));
                    }
                });
                match self.lock_files().get_mut(file_id) {
                    Some(state) => state.retry = Some(handle),
                    None => handle.abort(),
                }
                Err(e)
            }
        }
    }

    /// Forget `file_id`'s sync state and drop any scheduled retry for it.
    pub fn close_file(&self, file_id: &str) -> bool {
        self.lock_files().remove(file_id).is_some()
    }

    pub fn delete_file(&self, file_id: &str) -> Result<(), SyncError> {
        self.send(&Message::file_delete(self.user_id().as_deref(), file_id))
    }

    pub fn save(&self, file_id: &str) -> Result<(), SyncError> {
        self.send(&Message::save(self.user_id().as_deref(), file_id))
    }

    // --- connection ---

    /// Report a lost connection to listeners. Only the first call per
    /// connection has any effect; pending retries are cancelled.
    pub fn handle_connection_lost(&self, reason: &str) {
        if self.connection_lost.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.lock_list_retry().take() {
            handle.abort();
        }
        for state in self.lock_files().values_mut() {
            state.cancel_retry();
        }
        self.listeners
            .emit(&SyncEvent::ConnectionLost(reason.to_string()));
    }

    /// Re-arm connection loss reporting after a new connection is established.
    pub fn mark_connected(&self) {
        self.connection_lost.store(false, Ordering::SeqCst);
    }

    // --- helpers ---

    fn encode(&self, msg: &Message) -> String {
        msg.encode_with(self.config.escaping)
    }

    fn send(&self, msg: &Message) -> Result<(), SyncError> {
        self.transport
            .send(OutboundFrame::new(self.encode(msg)))
            .map_err(SyncError::from)
    }

    fn set_phase(&self, file_id: &str, phase: EditPhase) {
        if let Some(state) = self.lock_files().get_mut(file_id) {
            state.phase = phase;
        }
    }

    fn lock_files(&self) -> MutexGuard<'_, HashMap<String, PerFileSyncState>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_catalog(&self) -> MutexGuard<'_, FileCatalog> {
        self.catalog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_list_retry(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.list_retry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

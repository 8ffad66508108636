//! In-memory MTP relay server.
//!
//! ```text
//! Client A ──┐                      ┌── Client B
//!            ├── Session ── Room (file_id) ──┤
//! Client C ──┘        │                      └── Client D
//!                     ▼
//!              SharedFile { content }
//! ```
//!
//! The relay keeps the authoritative text of every file, applies positional
//! edits with the same bounds rules as the clients, and forwards each applied
//! edit to the other sessions that opened the file. Nothing is persisted.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::broadcast::RoomManager;
use crate::edit::EditOp;
use crate::extract::validate_file_name;
use crate::framer::{Framer, DEFAULT_MAX_FRAME_LEN};
use crate::protocol::{Escaping, FileListEntry, Message, MessageType};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Envelopes buffered per room member before it starts losing them.
    pub broadcast_capacity: usize,
    pub max_frame_len: usize,
    /// Join FILE_LIST_RESP records with `|` for older clients.
    pub legacy_file_list: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            legacy_file_list: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub applied_edits: u64,
    pub discarded_edits: u64,
    pub active_rooms: usize,
    pub files: usize,
}

#[derive(Debug, Clone)]
struct SharedFile {
    name: String,
    content: String,
}

/// State shared by every session.
struct RelayState {
    config: ServerConfig,
    files: RwLock<BTreeMap<String, SharedFile>>,
    rooms: RoomManager,
    stats: RwLock<ServerStats>,
}

/// Per-connection state.
struct Session {
    id: Uuid,
    addr: SocketAddr,
    user: Option<String>,
    outbound: mpsc::UnboundedSender<String>,
    forwarders: HashMap<String, JoinHandle<()>>,
}

impl Session {
    fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    fn reply(&self, msg: &Message) {
        let escaping = if msg.msg_type == MessageType::FileListResp {
            Escaping::Legacy
        } else {
            Escaping::Extended
        };
        let _ = self.outbound.send(msg.encode_with(escaping));
    }

    fn reply_error(&self, text: &str) {
        log::debug!("Error to {}: {text}", self.addr);
        self.reply(&Message::error(self.user(), text));
    }
}

/// The relay server.
pub struct RelayServer {
    state: Arc<RelayState>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = RoomManager::new(config.broadcast_capacity);
        Self {
            state: Arc::new(RelayState {
                config,
                files: RwLock::new(BTreeMap::new()),
                rooms,
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.state.config.bind_addr
    }

    /// Add a file with initial content and return its id.
    pub async fn seed_file(&self, name: &str, content: &str) -> String {
        let id = Uuid::new_v4().to_string();
        self.state.files.write().await.insert(
            id.clone(),
            SharedFile {
                name: name.to_string(),
                content: content.to_string(),
            },
        );
        self.state.stats.write().await.files += 1;
        id
    }

    /// Current content of a file.
    pub async fn content(&self, file_id: &str) -> Option<String> {
        self.state
            .files
            .read()
            .await
            .get(file_id)
            .map(|f| f.content.clone())
    }

    pub async fn stats(&self) -> ServerStats {
        self.state.stats.read().await.clone()
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("MTP relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(state, stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

async fn handle_connection(
    state: Arc<RelayState>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    log::info!("WebSocket connection established from {addr}");
    {
        let mut stats = state.stats.write().await;
        stats.total_connections += 1;
        stats.active_connections += 1;
    }

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let mut session = Session {
        id: Uuid::new_v4(),
        addr,
        user: None,
        outbound: outbound_tx,
        forwarders: HashMap::new(),
    };

    let result = pump(&state, &mut session, ws_stream, outbound_rx).await;

    for (file_id, forwarder) in session.forwarders.drain() {
        forwarder.abort();
        if let Some(room) = state.rooms.get(&file_id).await {
            room.leave(&session.id).await;
        }
        state.rooms.remove_if_empty(&file_id).await;
    }
    let rooms = state.rooms.room_count().await;
    {
        let mut stats = state.stats.write().await;
        stats.active_connections = stats.active_connections.saturating_sub(1);
        stats.active_rooms = rooms;
    }
    log::info!("Connection from {addr} closed");
    result
}

async fn pump(
    state: &RelayState,
    session: &mut Session,
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
) -> Result<(), BoxError> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut framer = Framer::with_max_len(state.config.max_frame_len);

    loop {
        let mut closing = false;
        tokio::select! {
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    {
                        let mut stats = state.stats.write().await;
                        stats.total_bytes += text.len() as u64;
                    }
                    for msg in framer.feed_chunk(text.as_str()) {
                        state.stats.write().await.total_messages += 1;
                        if !handle_message(state, session, msg).await {
                            closing = true;
                            break;
                        }
                    }
                }
                Some(Ok(WsMessage::Ping(data))) => ws_sender.send(WsMessage::Pong(data)).await?,
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::warn!("WebSocket error from {}: {e}", session.addr);
                    break;
                }
                Some(Ok(_)) => {}
            },
            Some(line) = outbound_rx.recv() => {
                ws_sender.send(WsMessage::Text(line.into())).await?;
            }
        }

        if closing {
            // Flush replies queued before the DISCONNECT.
            while let Ok(line) = outbound_rx.try_recv() {
                ws_sender.send(WsMessage::Text(line.into())).await?;
            }
            let _ = ws_sender.close().await;
            break;
        }
    }
    Ok(())
}

/// Handle one decoded message. Returns `false` when the session should end.
async fn handle_message(state: &RelayState, session: &mut Session, msg: Message) -> bool {
    log::trace!("{} <- {} {:?}", session.addr, msg.msg_type, msg.file_id);
    match msg.msg_type {
        MessageType::Connect | MessageType::Login => {
            let Some(username) = msg
                .data_str("username")
                .map(str::to_string)
                .or_else(|| msg.user_id.clone())
            else {
                session.reply_error("username required");
                return true;
            };
            log::info!("{} identified as {username}", session.addr);
            session.user = Some(username.clone());
            let ack = if msg.msg_type == MessageType::Connect {
                Message::connect_ack(&username, true, "connected")
            } else {
                Message::login_ack(Some(&username), true, "welcome")
            };
            session.reply(&ack);
        }
        MessageType::Register => session.reply(&Message::register_ack(true, "registered")),
        MessageType::FileList => {
            let entries = file_entries(state).await;
            session.reply(&Message::file_list_response(
                session.user(),
                &entries,
                state.config.legacy_file_list,
            ));
        }
        MessageType::FileCreate => create_file(state, session, &msg).await,
        MessageType::FileOpen => match &msg.file_id {
            Some(file_id) => open_file(state, session, file_id).await,
            None => session.reply_error("file id required"),
        },
        MessageType::TextInsert | MessageType::TextDelete | MessageType::TextUpdate => {
            apply_edit(state, session, &msg).await
        }
        MessageType::FileDelete => match &msg.file_id {
            Some(file_id) => delete_file(state, session, file_id).await,
            None => session.reply_error("file id required"),
        },
        MessageType::Save => {
            log::info!("Save requested for {:?} by {:?}", msg.file_id, session.user);
        }
        MessageType::Disconnect => {
            log::info!(
                "{} disconnecting: {}",
                session.addr,
                msg.data_str("reason").unwrap_or("no reason")
            );
            return false;
        }
        other => session.reply_error(&format!("unsupported message type {other}")),
    }
    true
}

async fn file_entries(state: &RelayState) -> Vec<FileListEntry> {
    let files = state.files.read().await;
    let mut entries = Vec::with_capacity(files.len());
    for (id, file) in files.iter() {
        let active = match state.rooms.get(id).await {
            Some(room) => room.member_count().await as u32,
            None => 0,
        };
        entries.push(FileListEntry::new(id.as_str(), file.name.as_str(), active));
    }
    entries.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    entries
}

async fn create_file(state: &RelayState, session: &Session, msg: &Message) {
    let Some(name) = msg.data_str("name") else {
        session.reply_error("file name required");
        return;
    };
    if let Err(e) = validate_file_name(name) {
        session.reply_error(&e.to_string());
        return;
    }

    let id = {
        let mut files = state.files.write().await;
        if files.values().any(|f| f.name == name) {
            drop(files);
            session.reply_error(&format!("file {name} already exists"));
            return;
        }
        let id = Uuid::new_v4().to_string();
        files.insert(
            id.clone(),
            SharedFile {
                name: name.to_string(),
                content: String::new(),
            },
        );
        id
    };
    state.stats.write().await.files += 1;
    log::info!("Created file {name} ({id}) for {:?}", session.user);
    session.reply(&Message::file_created(session.user(), &id, name));
}

async fn open_file(state: &RelayState, session: &mut Session, file_id: &str) {
    // Holding the read lock keeps edits out between the snapshot and the join.
    let files = state.files.read().await;
    let Some(file) = files.get(file_id) else {
        drop(files);
        session.reply_error(&format!("file {file_id} not found"));
        return;
    };

    if !session.forwarders.contains_key(file_id) {
        let room = state.rooms.get_or_create(file_id).await;
        let mut rx = room.join(session.id).await;
        let outbound = session.outbound.clone();
        let me = session.id;
        let group = room.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) if envelope.origin == me => {}
                    Ok(envelope) => {
                        if outbound.send(envelope.line.clone()).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Session {me} lagged by {n} edits");
                        group.record_dropped(n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        session.forwarders.insert(file_id.to_string(), forwarder);
    }

    session.reply(&Message::file_content(session.user(), file_id, &file.content));
    drop(files);

    let rooms = state.rooms.room_count().await;
    state.stats.write().await.active_rooms = rooms;
}

async fn apply_edit(state: &RelayState, session: &Session, msg: &Message) {
    let Some(file_id) = msg.file_id.as_deref() else {
        log::debug!("Edit without file id from {}", session.addr);
        return;
    };

    let mut files = state.files.write().await;
    let Some(file) = files.get_mut(file_id) else {
        drop(files);
        session.reply_error(&format!("file {file_id} not found"));
        return;
    };

    let applied = if msg.msg_type == MessageType::TextUpdate && msg.data_str("operation").is_none() {
        match msg.data_str("content") {
            Some(content) => {
                file.content = content.to_string();
                true
            }
            None => false,
        }
    } else {
        match EditOp::from_message(msg).map(|op| op.edit.apply(&file.content)) {
            Some(Ok(content)) => {
                file.content = content;
                true
            }
            Some(Err(e)) => {
                log::debug!("Discarding edit on {file_id}: {e}");
                false
            }
            None => {
                log::debug!("Undecodable {} on {file_id}", msg.msg_type);
                false
            }
        }
    };

    if applied {
        // Broadcast under the write lock so every member sees edits in apply order.
        if let Some(room) = state.rooms.get(file_id).await {
            room.broadcast(session.id, msg.encode_with(Escaping::Extended));
        }
    }
    drop(files);

    let mut stats = state.stats.write().await;
    if applied {
        stats.applied_edits += 1;
    } else {
        stats.discarded_edits += 1;
    }
}

async fn delete_file(state: &RelayState, session: &mut Session, file_id: &str) {
    let removed = state.files.write().await.remove(file_id);
    let Some(file) = removed else {
        session.reply(&Message::file_delete_ack(
            session.user(),
            file_id,
            false,
            "file not found",
        ));
        return;
    };

    if let Some(room) = state.rooms.remove(file_id).await {
        room.broadcast(
            session.id,
            Message::file_delete(session.user(), file_id).encode_with(Escaping::Extended),
        );
    }
    if let Some(forwarder) = session.forwarders.remove(file_id) {
        forwarder.abort();
    }
    {
        let mut stats = state.stats.write().await;
        stats.files = stats.files.saturating_sub(1);
    }
    log::info!("Deleted file {} ({file_id})", file.name);
    session.reply(&Message::file_delete_ack(session.user(), file_id, true, "deleted"));
}

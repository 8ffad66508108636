//! Connection transport: owns the WebSocket, one reader task and one writer task.
//!
//! ```text
//!  SyncEngine ──send()──► unbounded channel ──► writer task ──► ws sink
//!                                                 (pacing sleeps here)
//!  ws stream ──► reader task ──► Framer ──► Inbound channel ──► apply loop
//! ```
//!
//! `send` never blocks: it queues the frame for the writer task, which is the
//! only code that touches the sink, so two frames never interleave. Loss of
//! the connection is reported exactly once, as [`Inbound::Lost`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::framer::Framer;
use crate::protocol::Message;
use crate::sync::SyncConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connect timed out")]
    Timeout,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// One encoded line plus an optional delay the writer observes after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub line: String,
    pub pace_after: Option<Duration>,
}

impl OutboundFrame {
    pub fn new(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            pace_after: None,
        }
    }

    pub fn paced(line: impl Into<String>, delay: Duration) -> Self {
        Self {
            line: line.into(),
            pace_after: (!delay.is_zero()).then_some(delay),
        }
    }
}

/// The seam between the sync engine and the wire.
///
/// Implementations must be callable from any thread and must keep frames in
/// submission order.
pub trait Transport: Send + Sync {
    fn send(&self, frame: OutboundFrame) -> Result<(), TransportError>;
}

/// Items produced by the receive side of a [`Connection`].
#[derive(Debug, Clone)]
pub enum Inbound {
    Message(Message),
    Lost(String),
}

enum WriterCommand {
    Frame(OutboundFrame),
    Close,
}

/// Shared between both tasks and the handle so only the first loss is reported.
struct LossReporter {
    reported: AtomicBool,
    state: Arc<RwLock<ConnectionState>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
}

impl LossReporter {
    fn report(&self, reason: &str) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = ConnectionState::Disconnected;
        if !self.reported.swap(true, Ordering::SeqCst) {
            log::warn!("Connection lost: {reason}");
            let _ = self.inbound_tx.send(Inbound::Lost(reason.to_string()));
        }
    }
}

/// A live WebSocket connection to an MTP server.
pub struct Connection {
    url: String,
    state: Arc<RwLock<ConnectionState>>,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    loss: Arc<LossReporter>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Open `ws://host:port` and start the reader and writer tasks.
    ///
    /// Returns the connection and the receiver of decoded inbound messages.
    pub async fn connect(
        host: &str,
        port: u16,
        config: &SyncConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Inbound>), TransportError> {
        let url = format!("ws://{host}:{port}");
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));
        log::info!("Connecting to {url}");

        let ws_stream = match tokio::time::timeout(
            config.connect_timeout(),
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                *state.write().unwrap_or_else(PoisonError::into_inner) = ConnectionState::Disconnected;
                return Err(TransportError::Connect(e.to_string()));
            }
            Err(_) => {
                log::warn!("Connection to {url} timed out after {:?}", config.connect_timeout());
                *state.write().unwrap_or_else(PoisonError::into_inner) = ConnectionState::Disconnected;
                return Err(TransportError::Timeout);
            }
        };
        // Before the tasks start, so a loss they report is never overwritten.
        *state.write().unwrap_or_else(PoisonError::into_inner) = ConnectionState::Connected;
        log::info!("Connected to {url}");
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let loss = Arc::new(LossReporter {
            reported: AtomicBool::new(false),
            state: state.clone(),
            inbound_tx: inbound_tx.clone(),
        });

        // Writer task: the only owner of the sink.
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<WriterCommand>();
        let writer_loss = loss.clone();
        let writer = tokio::spawn(async move {
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Frame(frame) => {
                        log::trace!("-> {}", frame.line.trim_end());
                        if let Err(e) = ws_writer.send(WsMessage::Text(frame.line.into())).await {
                            writer_loss.report(&e.to_string());
                            break;
                        }
                        if let Some(delay) = frame.pace_after {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    WriterCommand::Close => {
                        let _ = ws_writer.close().await;
                        break;
                    }
                }
            }
        });

        // Reader task: reassemble lines into messages.
        let reader_loss = loss.clone();
        let max_frame_len = config.max_frame_len;
        let reader = tokio::spawn(async move {
            let mut framer = Framer::with_max_len(max_frame_len);
            let reason = loop {
                let chunk = match ws_reader.next().await {
                    Some(Ok(WsMessage::Text(text))) => framer.feed_chunk(text.as_str()),
                    Some(Ok(WsMessage::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => framer.feed_chunk(text),
                        Err(_) => {
                            log::warn!("Ignoring non UTF-8 binary frame ({} bytes)", bytes.len());
                            continue;
                        }
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break "closed by server".to_string(),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break e.to_string(),
                };
                for msg in chunk {
                    if inbound_tx.send(Inbound::Message(msg)).is_err() {
                        return;
                    }
                }
            };
            reader_loss.report(&reason);
        });


        Ok((
            Self {
                url,
                state,
                writer_tx,
                loss,
                reader,
                writer,
            },
            inbound_rx,
        ))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Stop receiving, flush frames already queued, then close the socket.
    /// Subsequent sends fail with [`TransportError::NotConnected`].
    pub fn disconnect(&self) {
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        log::info!("Disconnecting from {}", self.url);
        self.reader.abort();
        let _ = self.writer_tx.send(WriterCommand::Close);
        self.loss.report("disconnected by client");
    }
}

impl Transport for Connection {
    fn send(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.writer_tx
            .send(WriterCommand::Frame(frame))
            .map_err(|_| TransportError::ConnectionLost("writer task stopped".to_string()))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        if !self.writer.is_finished() {
            let _ = self.writer_tx.send(WriterCommand::Close);
        }
    }
}

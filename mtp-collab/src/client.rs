//! WebSocket sync client: one connection, one apply loop, one engine.
//!
//! Inbound messages are applied by a single task in arrival order, so remote
//! edits for a file never race each other. Local edits may be submitted from
//! any thread through [`SyncClient::engine`].
//!
//! An editor keeps its buffer in step through [`SyncClient::on_buffer_update`],
//! which runs on the apply task before the next message is applied. The
//! channel from [`SyncClient::take_event_rx`] is for notifications only: by
//! the time an event is read from it, later edits may already be applied.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::edit::EditOp;
use crate::protocol::Message;
use crate::sync::{SubscriptionId, SyncConfig, SyncEngine, SyncEvent};
use crate::transport::{Connection, ConnectionState, Inbound, OutboundFrame, Transport, TransportError};

/// A connected MTP client.
pub struct SyncClient {
    connection: Arc<Connection>,
    engine: Arc<SyncEngine>,
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    forward_subscription: SubscriptionId,
    apply_task: JoinHandle<()>,
}

impl SyncClient {
    /// Connect to `ws://host:port` and start applying inbound messages.
    pub async fn connect(host: &str, port: u16, config: SyncConfig) -> Result<Self, TransportError> {
        let (connection, mut inbound) = Connection::connect(host, port, &config).await?;
        let connection = Arc::new(connection);
        let engine = SyncEngine::new(config, connection.clone(), tokio::runtime::Handle::current());

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let forward_subscription = engine.subscribe(Arc::new(move |event: &SyncEvent| {
            let _ = event_tx.send(event.clone());
        }));

        let apply_engine = engine.clone();
        let apply_task = tokio::spawn(async move {
            while let Some(item) = inbound.recv().await {
                match item {
                    Inbound::Message(msg) => apply_engine.handle_message(&msg),
                    Inbound::Lost(reason) => apply_engine.handle_connection_lost(&reason),
                }
            }
            log::debug!("Apply loop finished");
        });

        Ok(Self {
            connection,
            engine,
            event_rx: Some(event_rx),
            forward_subscription,
            apply_task,
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Take the event receiver (can only be called once).
    ///
    /// Events arrive after the engine has moved on. Do not write their
    /// content into an editor buffer whose change hook submits local edits;
    /// use [`on_buffer_update`](Self::on_buffer_update) for that.
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// See [`SyncEngine::on_buffer_update`].
    pub fn on_buffer_update(&self, callback: impl Fn(&str, &str) + Send + Sync + 'static) -> SubscriptionId {
        self.engine.on_buffer_update(callback)
    }

    /// See [`SyncEngine::on_remote_operation`].
    pub fn on_remote_operation(
        &self,
        callback: impl Fn(&EditOp, &str) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.engine.on_remote_operation(callback)
    }

    /// See [`SyncEngine::on_file_opened`].
    pub fn on_file_opened(&self, callback: impl Fn(&str, &str) + Send + Sync + 'static) -> SubscriptionId {
        self.engine.on_file_opened(callback)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn url(&self) -> &str {
        self.connection.url()
    }

    /// Tell the server we are leaving (when we have a user id) and close.
    pub fn disconnect(&self) {
        if let Some(user) = self.engine.user_id() {
            let line = Message::disconnect(&user, "client disconnect").encode_with(self.engine.config().escaping);
            if let Err(e) = self.connection.send(OutboundFrame::new(line)) {
                log::debug!("DISCONNECT not sent: {e}");
            }
        }
        self.connection.disconnect();
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.engine.unsubscribe(self.forward_subscription);
        self.connection.disconnect();
        self.apply_task.abort();
    }
}

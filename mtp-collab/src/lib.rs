//! # mtp-collab: live shared text editing over the MTP line protocol
//!
//! Clients exchange pipe-delimited, newline-terminated messages with a relay.
//! Each keystroke becomes a positional insert or delete; the relay applies it
//! to its copy and forwards it to the other clients that opened the file.
//!
//! ## Architecture
//!
//! ```text
//!  editor buffer                                   editor buffer
//!       │ snapshot                                       ▲ RemoteEdit
//!       ▼                                                │
//! ┌─────────────┐   TEXT_INSERT / TEXT_DELETE   ┌─────────────┐
//! │ SyncEngine  │ ────────────────────────────► │ RelayServer │
//! │ diff+encode │ ◄──────────────────────────── │ apply+fan   │
//! └──────┬──────┘        WebSocket text         └──────┬──────┘
//!        │                                              │
//!        ▼                                              ▼
//! ┌─────────────┐                               ┌─────────────┐
//! │ Connection  │  writer task / reader task    │ RoomManager │
//! │ + Framer    │                               │ (per file)  │
//! └─────────────┘                               └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: message envelope and its codec with sentinel escaping
//! - [`framer`]: reassembles frames split across lines
//! - [`edit`]: UTF-16 addressed edits and their bounded application
//! - [`extract`]: snapshot diff and input validation
//! - [`catalog`]: file list cache with optimistic inserts
//! - [`sync`]: per-file state machine and event listeners
//! - [`transport`]: WebSocket connection behind the [`Transport`] seam
//! - [`client`]: connection, apply loop and engine wired together
//! - [`broadcast`]: per-file fan-out
//! - [`server`]: in-memory relay
//!
//! Concurrent edits to the same region from two clients are not transformed
//! against each other; positions are raw offsets and copies can diverge.

pub mod protocol;
pub mod framer;
pub mod edit;
pub mod extract;
pub mod catalog;
pub mod sync;
pub mod transport;
pub mod client;
pub mod broadcast;
pub mod server;

// Re-exports for convenience
pub use protocol::{Escaping, FileListEntry, Message, MessageType, ProtocolError};
pub use framer::Framer;
pub use edit::{ApplyError, Edit, EditKind, EditOp};
pub use extract::{diff, validate_file_name, InputValidator, ValidationError};
pub use catalog::FileCatalog;
pub use sync::{
    EditPhase, LocalEditOutcome, PerFileSyncState, SyncConfig, SyncEngine, SyncError, SyncEvent,
};
pub use transport::{Connection, ConnectionState, OutboundFrame, Transport, TransportError};
pub use client::SyncClient;
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use server::{RelayServer, ServerConfig, ServerStats};

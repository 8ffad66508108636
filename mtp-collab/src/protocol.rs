//! MTP text protocol: message envelope, codec and reserved-character escaping.
//!
//! Wire format (UTF-8, one line per message):
//! ```text
//! ┌──────┬─────────┬─────────┬───────────────────────┬───────────┐
//! │ TYPE │ USER_ID │ FILE_ID │ DATA                  │ TIMESTAMP │ \n
//! │      │ or null │ or null │ empty | k:v[,k:v]*    │ millis    │
//! └──────┴─────────┴─────────┴───────────────────────┴───────────┘
//! ```
//!
//! Data values are escaped with sentinel tokens so that a single line never
//! carries a raw newline, space or tab. `:` and `,` inside values are left
//! alone unless [`Escaping::Extended`] is selected.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Envelope field separator.
pub const FIELD_DELIMITER: char = '|';
/// Message terminator.
pub const MESSAGE_END: char = '\n';
/// Separator between `key:value` pairs in the data field.
pub const DATA_SEPARATOR: char = ',';
/// Separator between a data key and its value.
pub const KEY_VALUE_SEPARATOR: char = ':';
/// Data field placeholder for an empty map.
pub const EMPTY_DATA: &str = "empty";
/// Placeholder for an absent user or file id.
pub const NULL_ID: &str = "null";
/// Record separator inside a `FILE_LIST_RESP` `files` value.
pub const FILE_LIST_SEPARATOR: char = ';';
/// Record separator used by peers that predate [`FILE_LIST_SEPARATOR`].
pub const LEGACY_FILE_LIST_SEPARATOR: char = '|';

/// Sentinels every peer understands. `\r\n` must be replaced before `\n`.
const SENTINELS: &[(&str, &str)] = &[
    ("\r\n", "__CRLF__"),
    ("\n", "__NEWLINE__"),
    (" ", "__SPACE__"),
    ("\t", "__TAB__"),
];

/// Sentinels for the structural characters, only emitted in extended mode.
const EXTENDED_SENTINELS: &[(&str, &str)] = &[
    ("|", "__PIPE__"),
    (",", "__COMMA__"),
    (":", "__COLON__"),
];

/// How data values are escaped on encode. Decoding always understands both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Escaping {
    /// Space, newline, CRLF and tab only.
    #[default]
    Legacy,
    /// Legacy sentinels plus `|`, `,` and `:`.
    Extended,
}

/// Message kinds of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Connect,
    ConnectAck,
    Disconnect,
    FileList,
    FileListResp,
    FileCreate,
    FileOpen,
    FileContent,
    FileDelete,
    FileDeleteAck,
    TextInsert,
    TextDelete,
    TextUpdate,
    Register,
    RegisterAck,
    Login,
    LoginAck,
    Save,
    Error,
    FileUpdate,
}

impl MessageType {
    pub const ALL: [MessageType; 20] = [
        Self::Connect,
        Self::ConnectAck,
        Self::Disconnect,
        Self::FileList,
        Self::FileListResp,
        Self::FileCreate,
        Self::FileOpen,
        Self::FileContent,
        Self::FileDelete,
        Self::FileDeleteAck,
        Self::TextInsert,
        Self::TextDelete,
        Self::TextUpdate,
        Self::Register,
        Self::RegisterAck,
        Self::Login,
        Self::LoginAck,
        Self::Save,
        Self::Error,
        Self::FileUpdate,
    ];

    /// Wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::ConnectAck => "CONNECT_ACK",
            Self::Disconnect => "DISCONNECT",
            Self::FileList => "FILE_LIST",
            Self::FileListResp => "FILE_LIST_RESP",
            Self::FileCreate => "FILE_CREATE",
            Self::FileOpen => "FILE_OPEN",
            Self::FileContent => "FILE_CONTENT",
            Self::FileDelete => "FILE_DELETE",
            Self::FileDeleteAck => "FILE_DELETE_ACK",
            Self::TextInsert => "TEXT_INSERT",
            Self::TextDelete => "TEXT_DELETE",
            Self::TextUpdate => "TEXT_UPDATE",
            Self::Register => "REGISTER",
            Self::RegisterAck => "REGISTER_ACK",
            Self::Login => "LOGIN",
            Self::LoginAck => "LOGIN_ACK",
            Self::Save => "SAVE",
            Self::Error => "ERROR",
            Self::FileUpdate => "FILE_UPDATE",
        }
    }

    /// Whether this kind carries a text edit.
    pub fn is_text_edit(self) -> bool {
        matches!(self, Self::TextInsert | Self::TextDelete | Self::TextUpdate)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownType(s.to_string()))
    }
}

/// One entry of the server's file list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListEntry {
    pub file_id: String,
    pub file_name: String,
    pub active_users: u32,
}

impl FileListEntry {
    pub fn new(file_id: impl Into<String>, file_name: impl Into<String>, active_users: u32) -> Self {
        Self {
            file_id: file_id.into(),
            file_name: file_name.into(),
            active_users,
        }
    }

    /// Entry shown while a create request awaits the server's list.
    pub fn provisional(file_name: impl Into<String>) -> Self {
        Self::new(String::new(), file_name, 0)
    }

    /// Provisional entries have no server-assigned id yet.
    pub fn is_provisional(&self) -> bool {
        self.file_id.is_empty()
    }

    /// `id:name:count` record form.
    pub fn to_record(&self) -> String {
        format!("{}:{}:{}", self.file_id, self.file_name, self.active_users)
    }

    /// Parse a single `id:name[:count]` record.
    pub fn parse_record(record: &str) -> Option<Self> {
        let mut fields = trim_wire(record).splitn(3, KEY_VALUE_SEPARATOR);
        let file_id = trim_wire(fields.next()?);
        let file_name = trim_wire(fields.next()?);
        if file_id.is_empty() {
            return None;
        }
        let active_users = fields
            .next()
            .and_then(|count| trim_wire(count).parse().ok())
            .unwrap_or(0);
        Some(Self::new(file_id, file_name, active_users))
    }

    /// Parse a `files` value in either the current (`;`) or the legacy (`|`)
    /// separator form. Line breaks are also accepted as record boundaries.
    pub fn parse_list(files: &str) -> Vec<Self> {
        files
            .split([FILE_LIST_SEPARATOR, LEGACY_FILE_LIST_SEPARATOR, '\n'])
            .filter_map(Self::parse_record)
            .collect()
    }

    /// Join records with the given separator.
    pub fn join_list(entries: &[Self], separator: char) -> String {
        let mut out = String::new();
        for (i, entry) in entries.iter().enumerate() {
            if i > 0 {
                out.push(separator);
            }
            out.push_str(&entry.to_record());
        }
        out
    }
}

/// Protocol errors. A frame that fails to decode is dropped as a whole.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Replace reserved characters in a data value with sentinel tokens.
pub fn escape(value: &str, escaping: Escaping) -> String {
    let mut out = value.to_string();
    for (raw, token) in SENTINELS {
        if out.contains(raw) {
            out = out.replace(raw, token);
        }
    }
    if escaping == Escaping::Extended {
        for (raw, token) in EXTENDED_SENTINELS {
            if out.contains(raw) {
                out = out.replace(raw, token);
            }
        }
    }
    out
}

/// Restore sentinel tokens to the characters they stand for.
pub fn unescape(value: &str) -> String {
    if !value.contains("__") {
        return value.to_string();
    }
    let mut out = value.to_string();
    for (raw, token) in SENTINELS.iter().chain(EXTENDED_SENTINELS) {
        if out.contains(token) {
            out = out.replace(token, raw);
        }
    }
    out
}

/// Strip ASCII control characters and spaces from both ends. Unicode
/// whitespace such as U+00A0 or U+3000 is payload and is kept.
pub fn trim_wire(s: &str) -> &str {
    s.trim_matches(|c: char| c <= ' ')
}

/// Parse a data field (`empty` or `k:v[,k:v]*`). Pairs without a `:` are skipped.
pub fn decode_data(field: &str) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    let field = trim_wire(field);
    if field.is_empty() || field == EMPTY_DATA {
        return data;
    }
    for pair in field.split(DATA_SEPARATOR) {
        if let Some((key, value)) = pair.split_once(KEY_VALUE_SEPARATOR) {
            let key = trim_wire(key);
            if !key.is_empty() {
                data.insert(key.to_string(), unescape(trim_wire(value)));
            }
        }
    }
    data
}

fn encode_id(id: Option<&str>) -> &str {
    id.unwrap_or(NULL_ID)
}

pub(crate) fn decode_id(field: &str) -> Option<String> {
    let field = trim_wire(field);
    (field != NULL_ID && !field.is_empty()).then(|| field.to_string())
}

/// Lenient timestamp parse: a non-numeric value becomes the current time.
pub(crate) fn decode_timestamp(field: &str) -> i64 {
    match field.trim().parse::<i64>() {
        Ok(ts) => ts,
        Err(_) => {
            log::debug!("non-numeric timestamp '{}', substituting current time", field.trim());
            now_millis()
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MessageType,
    pub user_id: Option<String>,
    pub file_id: Option<String>,
    pub data: BTreeMap<String, String>,
    /// Sender-local wall clock, diagnostics only.
    pub timestamp: i64,
}

impl Message {
    pub fn new(msg_type: MessageType, user_id: Option<&str>, file_id: Option<&str>) -> Self {
        Self {
            msg_type,
            user_id: user_id.map(str::to_string),
            file_id: file_id.map(str::to_string),
            data: BTreeMap::new(),
            timestamp: now_millis(),
        }
    }

    /// Builder-style data insertion.
    pub fn with_data(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.data.insert(key.into(), value.to_string());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// Integer data value; `None` when absent or non-numeric.
    pub fn data_int(&self, key: &str) -> Option<i64> {
        self.data_str(key)?.trim().parse().ok()
    }

    pub fn data_bool(&self, key: &str) -> Option<bool> {
        self.data_str(key).map(|v| v.trim().eq_ignore_ascii_case("true"))
    }

    /// `status:success` on acknowledgement messages.
    pub fn is_success(&self) -> bool {
        self.data_str("status") == Some("success")
    }

    // --- connection ---

    pub fn connect(username: &str) -> Self {
        Self::new(MessageType::Connect, None, None).with_data("username", username)
    }

    pub fn connect_ack(user_id: &str, success: bool, message: &str) -> Self {
        Self::new(MessageType::ConnectAck, Some(user_id), None)
            .with_data("status", status(success))
            .with_data("message", message)
    }

    pub fn disconnect(user_id: &str, reason: &str) -> Self {
        Self::new(MessageType::Disconnect, Some(user_id), None).with_data("reason", reason)
    }

    // --- users ---

    pub fn register(username: &str, password: &str) -> Self {
        Self::new(MessageType::Register, None, None)
            .with_data("username", username)
            .with_data("password", password)
    }

    pub fn register_ack(success: bool, message: &str) -> Self {
        Self::new(MessageType::RegisterAck, None, None)
            .with_data("status", status(success))
            .with_data("message", message)
    }

    pub fn login(username: &str, password: &str) -> Self {
        Self::new(MessageType::Login, None, None)
            .with_data("username", username)
            .with_data("password", password)
    }

    pub fn login_ack(user_id: Option<&str>, success: bool, message: &str) -> Self {
        Self::new(MessageType::LoginAck, user_id, None)
            .with_data("status", status(success))
            .with_data("message", message)
    }

    // --- files ---

    pub fn file_list(user_id: Option<&str>) -> Self {
        Self::new(MessageType::FileList, user_id, None)
    }

    /// File list response. `legacy` joins records with `|` for older peers.
    pub fn file_list_response(user_id: Option<&str>, entries: &[FileListEntry], legacy: bool) -> Self {
        let separator = if legacy {
            LEGACY_FILE_LIST_SEPARATOR
        } else {
            FILE_LIST_SEPARATOR
        };
        let msg = Self::new(MessageType::FileListResp, user_id, None);
        if entries.is_empty() {
            msg
        } else {
            msg.with_data("files", FileListEntry::join_list(entries, separator))
        }
    }

    pub fn file_create(user_id: Option<&str>, name: &str) -> Self {
        let msg = Self::new(MessageType::FileCreate, user_id, None).with_data("name", name);
        match user_id {
            Some(creator) => msg.with_data("creator", creator),
            None => msg,
        }
    }

    /// Server reply to FILE_CREATE carrying the assigned id.
    pub fn file_created(user_id: Option<&str>, file_id: &str, name: &str) -> Self {
        Self::new(MessageType::FileCreate, user_id, Some(file_id)).with_data("name", name)
    }

    pub fn file_open(user_id: Option<&str>, file_id: &str) -> Self {
        Self::new(MessageType::FileOpen, user_id, Some(file_id))
    }

    pub fn file_content(user_id: Option<&str>, file_id: &str, content: &str) -> Self {
        Self::new(MessageType::FileContent, user_id, Some(file_id)).with_data("content", content)
    }

    pub fn file_delete(user_id: Option<&str>, file_id: &str) -> Self {
        Self::new(MessageType::FileDelete, user_id, Some(file_id)).with_data("action", "delete")
    }

    pub fn file_delete_ack(user_id: Option<&str>, file_id: &str, success: bool, message: &str) -> Self {
        Self::new(MessageType::FileDeleteAck, user_id, Some(file_id))
            .with_data("status", status(success))
            .with_data("message", message)
    }

    pub fn save(user_id: Option<&str>, file_id: &str) -> Self {
        Self::new(MessageType::Save, user_id, Some(file_id))
    }

    pub fn error(user_id: Option<&str>, message: &str) -> Self {
        Self::new(MessageType::Error, user_id, None).with_data("message", message)
    }

    // --- text edits ---

    pub fn text_insert(user_id: Option<&str>, file_id: &str, position: usize, text: &str) -> Self {
        with_origin(
            Self::new(MessageType::TextInsert, user_id, Some(file_id))
                .with_data("position", position)
                .with_data("text", text),
            user_id,
        )
    }

    pub fn text_delete(user_id: Option<&str>, file_id: &str, position: usize, length: usize) -> Self {
        with_origin(
            Self::new(MessageType::TextDelete, user_id, Some(file_id))
                .with_data("position", position)
                .with_data("length", length),
            user_id,
        )
    }

    pub fn text_update(
        user_id: Option<&str>,
        file_id: &str,
        operation: &str,
        position: usize,
        text: &str,
    ) -> Self {
        with_origin(
            Self::new(MessageType::TextUpdate, user_id, Some(file_id))
                .with_data("operation", operation)
                .with_data("position", position)
                .with_data("text", text),
            user_id,
        )
    }

    /// Serialize with the default (legacy) escaping.
    pub fn encode(&self) -> String {
        self.encode_with(Escaping::Legacy)
    }

    /// Serialize to `TYPE|USER_ID|FILE_ID|DATA|TIMESTAMP\n`.
    pub fn encode_with(&self, escaping: Escaping) -> String {
        let mut out = String::with_capacity(64);
        out.push_str(self.msg_type.as_str());
        out.push(FIELD_DELIMITER);
        out.push_str(encode_id(self.user_id.as_deref()));
        out.push(FIELD_DELIMITER);
        out.push_str(encode_id(self.file_id.as_deref()));
        out.push(FIELD_DELIMITER);
        if self.data.is_empty() {
            out.push_str(EMPTY_DATA);
        } else {
            for (i, (key, value)) in self.data.iter().enumerate() {
                if i > 0 {
                    out.push(DATA_SEPARATOR);
                }
                out.push_str(key);
                out.push(KEY_VALUE_SEPARATOR);
                out.push_str(&escape(value, escaping));
            }
        }
        out.push(FIELD_DELIMITER);
        out.push_str(&self.timestamp.to_string());
        out.push(MESSAGE_END);
        out
    }

    /// Parse one frame. Fails on an empty frame, a field count other than
    /// five, or an unknown type; a bad timestamp is replaced by "now".
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let line = trim_wire(raw);
        if line.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }

        let parts: Vec<&str> = line.splitn(5, FIELD_DELIMITER).collect();
        if parts.len() != 5 {
            return Err(ProtocolError::FieldCount(parts.len()));
        }

        Ok(Self {
            msg_type: trim_wire(parts[0]).parse()?,
            user_id: decode_id(parts[1]),
            file_id: decode_id(parts[2]),
            data: decode_data(parts[3]),
            timestamp: decode_timestamp(parts[4]),
        })
    }
}

fn status(success: bool) -> &'static str {
    if success { "success" } else { "fail" }
}

fn with_origin(msg: Message, user_id: Option<&str>) -> Message {
    match user_id {
        Some(user) => msg.with_data("userId", user),
        None => msg,
    }
}

//! Text edits addressed in UTF-16 code units.
//!
//! Positions are raw offsets into the current document text. An edit is only
//! meaningful against the exact snapshot it was computed from; application
//! never transforms positions, it only bounds-checks them.

use serde::{Deserialize, Serialize};

use crate::protocol::{Message, MessageType};

/// UTF-16 length of `s`.
pub fn utf16_len(s: &str) -> usize {
    s.chars().map(char::len_utf16).sum()
}

/// Byte index of the UTF-16 offset `pos`, or `None` if `pos` is past the end
/// or falls between the two halves of a surrogate pair.
pub fn byte_index(s: &str, pos: usize) -> Option<usize> {
    let mut units = 0;
    for (idx, ch) in s.char_indices() {
        if units == pos {
            return Some(idx);
        }
        units += ch.len_utf16();
        if units > pos {
            return None;
        }
    }
    (units == pos).then_some(s.len())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error("delete of {length} at {position} outside buffer of length {len}")]
    OutOfRange {
        position: usize,
        length: usize,
        len: usize,
    },
    #[error("offset {0} splits a surrogate pair")]
    SplitsCodePoint(usize),
    #[error("insert carries no text")]
    EmptyInsert,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditKind {
    Insert(String),
    Delete(usize),
}

/// A single insert or delete at a UTF-16 offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edit {
    pub position: usize,
    pub kind: EditKind,
}

impl Edit {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Self {
            position,
            kind: EditKind::Insert(text.into()),
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Self {
            position,
            kind: EditKind::Delete(length),
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self.kind, EditKind::Insert(_))
    }

    /// Apply to `content`.
    ///
    /// Inserts clamp their position into `[0, len]`. Deletes are rejected
    /// unless the whole range `[position, position + length)` lies inside the
    /// buffer and `length >= 1`: a partial delete is never applied.
    pub fn apply(&self, content: &str) -> Result<String, ApplyError> {
        let len = utf16_len(content);
        match &self.kind {
            EditKind::Insert(text) => {
                if text.is_empty() {
                    return Err(ApplyError::EmptyInsert);
                }
                let pos = self.position.min(len);
                let at = byte_index(content, pos).ok_or(ApplyError::SplitsCodePoint(pos))?;
                let mut out = String::with_capacity(content.len() + text.len());
                out.push_str(&content[..at]);
                out.push_str(text);
                out.push_str(&content[at..]);
                Ok(out)
            }
            EditKind::Delete(length) => {
                let out_of_range = ApplyError::OutOfRange {
                    position: self.position,
                    length: *length,
                    len,
                };
                if *length == 0 || self.position >= len {
                    return Err(out_of_range);
                }
                let end = match self.position.checked_add(*length) {
                    Some(end) if end <= len => end,
                    _ => return Err(out_of_range),
                };
                let start_at = byte_index(content, self.position)
                    .ok_or(ApplyError::SplitsCodePoint(self.position))?;
                let end_at = byte_index(content, end).ok_or(ApplyError::SplitsCodePoint(end))?;
                let mut out = String::with_capacity(content.len());
                out.push_str(&content[..start_at]);
                out.push_str(&content[end_at..]);
                Ok(out)
            }
        }
    }
}

/// An edit bound to a file and, when known, the user who made it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOp {
    pub file_id: String,
    pub edit: Edit,
    pub origin: Option<String>,
}

impl EditOp {
    pub fn new(file_id: impl Into<String>, edit: Edit, origin: Option<String>) -> Self {
        Self {
            file_id: file_id.into(),
            edit,
            origin,
        }
    }

    /// Decode a `TEXT_INSERT`, `TEXT_DELETE` or positional `TEXT_UPDATE`.
    ///
    /// Returns `None` when the message has no file id, no usable position,
    /// a negative delete position, a non-positive length or no text.
    pub fn from_message(msg: &Message) -> Option<Self> {
        let file_id = msg.file_id.clone()?;
        let position = msg.data_int("position")?;
        let origin = msg
            .user_id
            .clone()
            .or_else(|| msg.data_str("userId").map(str::to_string));

        let edit = match msg.msg_type {
            MessageType::TextInsert => insert_from(position, msg.data_str("text")?)?,
            MessageType::TextDelete => delete_from(position, msg.data_int("length")?)?,
            MessageType::TextUpdate => match msg.data_str("operation")? {
                "insert" => insert_from(position, msg.data_str("text")?)?,
                "delete" => {
                    let length = match msg.data_int("length") {
                        Some(length) => length,
                        None => utf16_len(msg.data_str("text")?) as i64,
                    };
                    delete_from(position, length)?
                }
                _ => return None,
            },
            _ => return None,
        };
        Some(Self::new(file_id, edit, origin))
    }
}

fn insert_from(position: i64, text: &str) -> Option<Edit> {
    if text.is_empty() {
        return None;
    }
    Some(Edit::insert(position.max(0) as usize, text))
}

fn delete_from(position: i64, length: i64) -> Option<Edit> {
    if position < 0 || length < 1 {
        return None;
    }
    Some(Edit::delete(position as usize, length as usize))
}

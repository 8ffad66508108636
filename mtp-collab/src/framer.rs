//! Reassembles logical messages from a line-oriented stream.
//!
//! A line is a complete frame when it has the three header pipes, a last
//! pipe strictly after them, and an integer after that last pipe. Lines that
//! fail the test are buffered until the accumulated text passes it.
//!
//! `FILE_LIST_RESP` reuses `|` between its records in the legacy form, so it
//! bypasses the generic five-field split: everything between the header and
//! the trailing timestamp is re-joined into one `files` value.

use std::collections::BTreeMap;

use crate::protocol::{
    self, trim_wire, Message, MessageType, ProtocolError, FIELD_DELIMITER,
    LEGACY_FILE_LIST_SEPARATOR,
};

/// Default accumulation cap (1 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

const FILE_LIST_PREFIX: &str = "FILE_LIST_RESP|";
const FILES_KEY: &str = "files:";

/// Structural completeness test for a candidate frame.
pub fn is_complete(candidate: &str) -> bool {
    let candidate = candidate.trim_end();
    let mut pipes = candidate.match_indices(FIELD_DELIMITER).map(|(i, _)| i);
    let (Some(_), Some(_), Some(third)) = (pipes.next(), pipes.next(), pipes.next()) else {
        return false;
    };
    let Some(last) = candidate.rfind(FIELD_DELIMITER) else {
        return false;
    };
    last > third && candidate[last + 1..].trim().parse::<i64>().is_ok()
}

/// Decode one complete frame, routing `FILE_LIST_RESP` through the re-join path.
pub fn decode_frame(frame: &str) -> Result<Message, ProtocolError> {
    if trim_wire(frame).starts_with(FILE_LIST_PREFIX) {
        decode_file_list_response(frame)
    } else {
        Message::decode(frame)
    }
}

/// Parse `FILE_LIST_RESP|user|file|files:r1|r2|...|timestamp`, where records
/// may also be separated by line breaks left over from reassembly.
pub fn decode_file_list_response(frame: &str) -> Result<Message, ProtocolError> {
    let frame = trim_wire(frame);
    let mut header = frame.splitn(4, FIELD_DELIMITER);
    let msg_type: MessageType = trim_wire(header.next().unwrap_or_default()).parse()?;
    let user_id = header.next();
    let file_id = header.next();
    let rest = header.next();

    let (Some(user_id), Some(file_id), Some(rest)) = (user_id, file_id, rest) else {
        return Err(ProtocolError::FieldCount(frame.splitn(5, FIELD_DELIMITER).count()));
    };
    let Some(last) = rest.rfind(FIELD_DELIMITER) else {
        return Err(ProtocolError::FieldCount(4));
    };
    let (body, timestamp) = (&rest[..last], &rest[last + 1..]);

    let data = match trim_wire(body).strip_prefix(FILES_KEY) {
        Some(records) => {
            let joined = records
                .split([LEGACY_FILE_LIST_SEPARATOR, '\n'])
                .map(trim_wire)
                .filter(|segment| !segment.is_empty())
                .collect::<Vec<_>>()
                .join(&LEGACY_FILE_LIST_SEPARATOR.to_string());
            let mut data = BTreeMap::new();
            data.insert("files".to_string(), protocol::unescape(&joined));
            data
        }
        None => protocol::decode_data(body),
    };

    Ok(Message {
        msg_type,
        user_id: protocol::decode_id(user_id),
        file_id: protocol::decode_id(file_id),
        data,
        timestamp: protocol::decode_timestamp(timestamp),
    })
}

/// Line accumulator. Feed it one line at a time.
#[derive(Debug)]
pub struct Framer {
    buffer: String,
    max_len: usize,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Framer that drops its buffer once it grows past `max_len` bytes.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            buffer: String::new(),
            max_len,
        }
    }

    /// Consume one physical line (without its terminator) and return any
    /// messages it completes. Malformed frames are logged and dropped.
    pub fn feed(&mut self, line: &str) -> Vec<Message> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if trim_wire(line).is_empty() {
            return Vec::new();
        }

        if is_complete(line) {
            if !self.buffer.is_empty() {
                log::debug!(
                    "Discarding {} buffered bytes superseded by a complete frame",
                    self.buffer.len()
                );
                self.buffer.clear();
            }
            return Self::emit(line);
        }

        if !self.buffer.is_empty() {
            self.buffer.push('\n');
        }
        self.buffer.push_str(line);

        if self.buffer.len() > self.max_len {
            log::warn!(
                "Frame buffer exceeded {} bytes without completing, dropping it",
                self.max_len
            );
            self.buffer.clear();
            return Vec::new();
        }

        if is_complete(&self.buffer) {
            let frame = std::mem::take(&mut self.buffer);
            return Self::emit(&frame);
        }
        Vec::new()
    }

    /// Split a transport chunk on `\n` and feed each line.
    pub fn feed_chunk(&mut self, chunk: &str) -> Vec<Message> {
        chunk.split('\n').flat_map(|line| self.feed(line)).collect()
    }

    /// Text buffered while waiting for a frame to complete.
    pub fn residual(&self) -> &str {
        &self.buffer
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    fn emit(frame: &str) -> Vec<Message> {
        match decode_frame(frame) {
            Ok(msg) => vec![msg],
            Err(e) => {
                log::warn!("Dropping malformed frame: {e}");
                Vec::new()
            }
        }
    }
}

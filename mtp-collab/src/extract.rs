//! Operation extraction: turns a before/after snapshot pair into one edit.
//!
//! Only the common prefix is used to place the edit, so a change anchored at
//! the end of a run of identical characters is attributed to the earliest
//! position that explains it. Same-length replacements produce nothing.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::edit::{utf16_len, Edit};

const FILE_NAME_MIN: usize = 3;
const FILE_NAME_MAX: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("input contains disallowed characters: {0:?}")]
    DisallowedChars(Vec<char>),
    #[error("invalid file name '{0}': use 3-50 letters, digits, '_' or '-'")]
    InvalidFileName(String),
}

/// Diff `old` against `new`.
///
/// Lengths are compared in characters; the returned position and delete
/// length are UTF-16 code units.
pub fn diff(old: &str, new: &str) -> Option<Edit> {
    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();
    if old_chars.len() == new_chars.len() {
        return None;
    }

    let prefix = old_chars
        .iter()
        .zip(&new_chars)
        .take_while(|(a, b)| a == b)
        .count();
    let position = old_chars[..prefix].iter().map(|c| c.len_utf16()).sum();

    if new_chars.len() > old_chars.len() {
        let added = new_chars.len() - old_chars.len();
        let text: String = new_chars[prefix..prefix + added].iter().collect();
        Some(Edit::insert(position, text))
    } else {
        let removed = old_chars.len() - new_chars.len();
        let length = old_chars[prefix..prefix + removed]
            .iter()
            .map(|c| c.len_utf16())
            .sum();
        Some(Edit::delete(position, length))
    }
}

/// Split inserted text into single-character units, keeping `\r\n` together.
/// Each unit's position accounts for the units before it.
pub fn split_units(position: usize, text: &str) -> Vec<Edit> {
    let mut units = Vec::with_capacity(text.len());
    let mut offset = position;
    let mut rest = text;
    while let Some(ch) = rest.chars().next() {
        let unit_len = if rest.starts_with("\r\n") { 2 } else { ch.len_utf8() };
        let (unit, tail) = rest.split_at(unit_len);
        units.push(Edit::insert(offset, unit));
        offset += utf16_len(unit);
        rest = tail;
    }
    units
}

/// Whether `unit` is a line break that needs pacing on the way out.
pub fn is_newline_unit(unit: &str) -> bool {
    unit == "\n" || unit == "\r\n"
}

/// Gate for locally typed text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputValidator {
    disallowed: BTreeSet<char>,
}

impl InputValidator {
    pub fn new(disallowed: impl IntoIterator<Item = char>) -> Self {
        Self {
            disallowed: disallowed.into_iter().collect(),
        }
    }

    pub fn is_permissive(&self) -> bool {
        self.disallowed.is_empty()
    }

    /// Reject `text` if it contains any configured code point. The error
    /// lists each offending character once, in code point order.
    pub fn check(&self, text: &str) -> Result<(), ValidationError> {
        if self.disallowed.is_empty() {
            return Ok(());
        }
        let found: BTreeSet<char> = text.chars().filter(|c| self.disallowed.contains(c)).collect();
        if found.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::DisallowedChars(found.into_iter().collect()))
        }
    }
}

/// File names are 3-50 characters of `[A-Za-z0-9_-]`.
pub fn validate_file_name(name: &str) -> Result<(), ValidationError> {
    let trimmed = name.trim();
    let valid = (FILE_NAME_MIN..=FILE_NAME_MAX).contains(&trimmed.len())
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidFileName(name.to_string()))
    }
}

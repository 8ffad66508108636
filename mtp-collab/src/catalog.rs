//! Client-side file list cache.
//!
//! Holds the last authoritative `FILE_LIST_RESP` plus names created locally
//! that the server has not listed yet. An authoritative list replaces
//! everything, pending names included.

use std::collections::BTreeSet;

use crate::protocol::FileListEntry;

#[derive(Debug, Default, Clone)]
pub struct FileCatalog {
    entries: Vec<FileListEntry>,
    pending: BTreeSet<String>,
}

impl FileCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a name the user just created. Returns `false` if a file with
    /// that name is already known.
    pub fn insert_optimistic(&mut self, name: &str) -> bool {
        if self.entries.iter().any(|e| e.file_name == name) || self.pending.contains(name) {
            return false;
        }
        self.pending.insert(name.to_string());
        true
    }

    /// Adopt the server's list as the whole truth.
    pub fn replace(&mut self, entries: Vec<FileListEntry>) {
        self.entries = entries;
        self.pending.clear();
    }

    /// Insert or update one entry by file id. A pending entry with the same
    /// name is settled.
    pub fn upsert(&mut self, entry: FileListEntry) {
        self.pending.remove(&entry.file_name);
        match self.entries.iter_mut().find(|e| e.file_id == entry.file_id) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn remove(&mut self, file_id: &str) -> Option<FileListEntry> {
        let idx = self.entries.iter().position(|e| e.file_id == file_id)?;
        Some(self.entries.remove(idx))
    }

    pub fn get(&self, file_id: &str) -> Option<&FileListEntry> {
        self.entries.iter().find(|e| e.file_id == file_id)
    }

    /// Server entries followed by provisional entries for pending names.
    pub fn entries(&self) -> Vec<FileListEntry> {
        self.entries
            .iter()
            .cloned()
            .chain(self.pending.iter().map(FileListEntry::provisional))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

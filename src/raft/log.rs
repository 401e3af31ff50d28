use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};

/// Opaque client command carried by the log.
pub type Command = Vec<u8>;

/// A single entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    /// 1-based, contiguous
    pub index: u64,
    pub command: Command,
}

impl LogEntry {
    pub fn new(term: u64, index: u64, command: impl Into<Command>) -> Self {
        Self {
            term,
            index,
            command: command.into(),
        }
    }
}

/// Ordered, append-only sequence of entries with indices `1..=N`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the tail entry, 0 when empty.
    pub fn last_entry_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    /// Term of the tail entry, 0 when empty.
    pub fn last_entry_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Get log entry at index (1-indexed)
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    pub fn get_mut(&mut self, index: u64) -> Option<&mut LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get_mut((index - 1) as usize)
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.get(index).map(|e| e.term)
    }

    /// Entries from `start_index` (inclusive) to the tail.
    pub fn entries_from(&self, start_index: u64) -> Vec<LogEntry> {
        let start = start_index.saturating_sub(1) as usize;
        if start >= self.entries.len() {
            return Vec::new();
        }
        self.entries[start..].to_vec()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Append one entry; it must extend the log by exactly one index.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        let expected = self.last_entry_index() + 1;
        if entry.index != expected {
            return Err(RaftError::LogInconsistency { index: entry.index });
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Append `command` at the next free index and return that index.
    pub fn push(&mut self, term: u64, command: Command) -> u64 {
        let index = self.last_entry_index() + 1;
        self.entries.push(LogEntry::new(term, index, command));
        index
    }

    /// Truncate the suffix `[from_index, end]`. Callers guarantee
    /// `from_index > commit_index`.
    pub fn delete_conflicting_entries(&mut self, from_index: u64) {
        let keep = from_index.saturating_sub(1) as usize;
        if keep < self.entries.len() {
            self.entries.truncate(keep);
        }
    }
}

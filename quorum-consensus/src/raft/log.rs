use bytes::Bytes;
use quorum_common::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};

/// A single log entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,      // Term number when entry was received by leader
    pub index: LogIndex, // Index of the log entry in the log, contiguous from 1
    pub command: Bytes,  // Opaque payload handed to the service once committed
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, command: impl Into<Bytes>) -> Self {
        Self {
            term,
            index,
            command: command.into(),
        }
    }
}

/// The ordered entries of one replica. Index `i` lives at `entries[i - 1]`;
/// index 0 is the empty prefix with term 0.
#[derive(Debug, Default, Clone)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    /// Create an empty Raft log
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Rebuild a log from persisted `(term, command)` pairs.
    pub fn from_terms_and_commands(items: impl IntoIterator<Item = (Term, Bytes)>) -> Self {
        let entries = items
            .into_iter()
            .enumerate()
            .map(|(i, (term, command))| LogEntry {
                term,
                index: i as LogIndex + 1,
                command,
            })
            .collect();
        Self { entries }
    }

    /// Append a command at the next index and return the new entry.
    pub fn push(&mut self, term: Term, command: Bytes) -> &LogEntry {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry {
            term,
            index,
            command,
        });
        &self.entries[self.entries.len() - 1]
    }

    /// Append an entry whose index must directly follow the current tail.
    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1, "log must stay contiguous");
        self.entries.push(entry);
    }

    /// Get a specific log entry by Raft index (not array index)
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`. Index 0 always has term 0; `None` means
    /// the log does not reach that far.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    /// Returns the last log index, or 0 if the log is empty
    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    /// Returns the term of the last entry, or 0 if empty
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Drop `index` and everything after it.
    pub fn truncate_from(&mut self, index: LogIndex) {
        let keep = index.saturating_sub(1) as usize;
        self.entries.truncate(keep);
    }

    /// Up to `max` entries starting at `start` (inclusive).
    pub fn entries_from(&self, start: LogIndex, max: usize) -> Vec<LogEntry> {
        let start = start.max(1);
        if start > self.last_index() {
            return Vec::new();
        }
        let from = (start - 1) as usize;
        let to = self.entries.len().min(from.saturating_add(max));
        self.entries[from..to].to_vec()
    }

    /// Entries in `[from, to]`, clamped to what the log holds.
    pub fn slice(&self, from: LogIndex, to: LogIndex) -> Vec<LogEntry> {
        let to = to.min(self.last_index());
        if from == 0 || from > to {
            return Vec::new();
        }
        self.entries[(from - 1) as usize..to as usize].to_vec()
    }

    /// First index of the run of `term` entries that ends at `index`.
    pub fn first_index_of_term(&self, term: Term, index: LogIndex) -> LogIndex {
        let mut first = index.min(self.last_index());
        while first > 1 && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    /// Whether a log ending at `(last_index, last_term)` is at least as up to
    /// date as this one: a later last term wins, equal terms compare length.
    pub fn is_up_to_date(&self, last_index: LogIndex, last_term: Term) -> bool {
        let our_term = self.last_term();
        last_term > our_term || (last_term == our_term && last_index >= self.last_index())
    }
}

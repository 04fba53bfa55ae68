//! Raft-specific log that wraps the generic commit log and layers the snapshot entry on top of it.

use crate::commitlog::{Index, Log};
use crate::replica::local_state::Term;
use crate::replica::log_entry::{LogEntry, SnapshotEntry};
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum RaftLogError {
    #[error("Expected to append at index {expected:?}, got entry with index {actual:?}")]
    InvalidAppendIndex { expected: Index, actual: Index },
    #[error("Can't truncate from {index:?}, it's at or below snapshot index {snapshot_index:?}")]
    TruncateBelowSnapshot { index: Index, snapshot_index: Index },
    #[error("Log IO failure: {0:?}")]
    Io(#[from] io::Error),
}

/// RaftLog holds the entries after the last snapshot plus the snapshot itself.
///
/// Valid indexes form the contiguous range `[snapshot_index + 1, last_log_or_snapshot_index]`.
pub struct RaftLog<L: Log<LogEntry>> {
    log: L,
    snapshot: Option<SnapshotEntry>,
    // Cached (term, index) of the tail entry. Equal to the snapshot's when the log is empty.
    last_term: Term,
    last_index: Index,
}

impl<L: Log<LogEntry>> RaftLog<L> {
    pub fn new(log: L) -> Result<Self, RaftLogError> {
        let mut raft_log = RaftLog {
            log,
            snapshot: None,
            last_term: Term::new(0),
            last_index: Index::ZERO,
        };
        if let Some(last) = raft_log.log.next_index().checked_minus(1) {
            if let Some(entry) = raft_log.log.read(last)? {
                raft_log.last_term = entry.term;
                raft_log.last_index = entry.index;
            }
        }

        Ok(raft_log)
    }

    pub fn last_log_or_snapshot_index(&self) -> Index {
        self.last_index
    }

    pub fn last_log_or_snapshot_term(&self) -> Term {
        self.last_term
    }

    pub fn snapshot_index(&self) -> Index {
        self.snapshot.as_ref().map(|s| s.index).unwrap_or(Index::ZERO)
    }

    pub fn snapshot(&self) -> Option<&SnapshotEntry> {
        self.snapshot.as_ref()
    }

    pub fn append(&mut self, entry: LogEntry) -> Result<(), RaftLogError> {
        let expected = self.last_index.plus(1);
        if entry.index != expected {
            return Err(RaftLogError::InvalidAppendIndex {
                expected,
                actual: entry.index,
            });
        }

        let term = entry.term;
        let appended_index = self.log.append(entry)?;
        debug_assert_eq!(appended_index, expected);
        self.last_index = expected;
        self.last_term = term;

        Ok(())
    }

    /// Returns None if the entry is compacted into the snapshot or hasn't been written.
    pub fn entry(&self, index: Index) -> Result<Option<LogEntry>, RaftLogError> {
        if index <= self.snapshot_index() || index > self.last_index {
            return Ok(None);
        }

        Ok(self.log.read(index)?)
    }

    /// Term of the entry at `index`, including the snapshot's last entry and the empty prefix at 0.
    pub fn term_at(&self, index: Index) -> Result<Option<Term>, RaftLogError> {
        if index.is_zero() {
            return Ok(Some(Term::new(0)));
        }
        if let Some(snapshot) = &self.snapshot {
            if index == snapshot.index {
                return Ok(Some(snapshot.term));
            }
        }
        if index == self.last_index {
            return Ok(Some(self.last_term));
        }

        Ok(self.entry(index)?.map(|e| e.term))
    }

    /// Inclusive on both ends. Stops early at the tail of the log.
    pub fn entries_between(&self, from: Index, to: Index) -> Result<Vec<LogEntry>, RaftLogError> {
        let mut entries = Vec::with_capacity(from.distance_to(to.plus(1)) as usize);
        let mut index = from;
        while index <= to {
            match self.entry(index)? {
                Some(entry) => entries.push(entry),
                None => break,
            }
            index = index.plus(1);
        }

        Ok(entries)
    }

    /// Lowest index in the log whose entry has `term`, searching back from `from`.
    pub fn first_index_of_term(&self, term: Term, from: Index) -> Result<Index, RaftLogError> {
        let floor = self.snapshot_index().plus(1);
        let mut first = from;
        let mut index = from;
        while index >= floor {
            match self.term_at(index)? {
                Some(t) if t == term => first = index,
                _ => break,
            }
            match index.checked_minus(1) {
                Some(prev) => index = prev,
                None => break,
            }
        }

        Ok(first)
    }

    /// Removes every entry at `index` and after, returning the removed entries. Never touches the
    /// snapshot.
    pub fn truncate_from(&mut self, index: Index) -> Result<Vec<LogEntry>, RaftLogError> {
        let snapshot_index = self.snapshot_index();
        if index <= snapshot_index {
            return Err(RaftLogError::TruncateBelowSnapshot { index, snapshot_index });
        }
        if index > self.last_index {
            return Ok(Vec::new());
        }

        let truncated = self.entries_between(index, self.last_index)?;
        let new_last_index = index.minus(1);
        let new_last_term = self
            .term_at(new_last_index)?
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Missing entry before truncation point"))?;
        self.log.truncate(index)?;

        self.last_index = new_last_index;
        self.last_term = new_last_term;

        Ok(truncated)
    }

    /// Installs `snapshot` as the new log prefix. Entries after the snapshot are kept if the log
    /// agrees with the snapshot's last entry, otherwise the whole log is discarded. Returns the
    /// number of entries dropped from the log.
    pub fn set_snapshot(&mut self, snapshot: SnapshotEntry) -> Result<usize, RaftLogError> {
        let keep_suffix = snapshot.index < self.last_index
            && self.term_at(snapshot.index)? == Some(snapshot.term)
            && snapshot.index > self.snapshot_index();

        let dropped = if keep_suffix {
            let dropped = self.snapshot_index().distance_to(snapshot.index) as usize;
            self.log.compact(snapshot.index)?;
            dropped
        } else {
            let dropped = self.snapshot_index().distance_to(self.last_index) as usize;
            self.log.reset(snapshot.index.plus(1))?;
            self.last_index = snapshot.index;
            self.last_term = snapshot.term;
            dropped
        };

        self.snapshot.replace(snapshot);

        Ok(dropped)
    }
}

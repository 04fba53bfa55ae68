use serde::{Deserialize, Serialize};
use std::{fmt, io};

/// Index is an index of an entry in the log; i.e. a log entry's index.
///
/// The first entry is written at index 1. Index 0 is a sentinel for "nothing": an empty log, a
/// peer that has not matched anything yet, or a group without a snapshot.
#[derive(Copy, Clone, Default, PartialOrd, PartialEq, Ord, Eq, Hash, Serialize, Deserialize)]
pub struct Index(u64);

impl Index {
    pub const ZERO: Index = Index(0);

    pub fn new(index: u64) -> Self {
        Index(index)
    }

    pub fn start_index() -> Self {
        Self::new(1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn plus(&self, delta: u64) -> Index {
        Index::new(self.0 + delta)
    }

    /// Saturates at zero.
    pub fn minus(&self, delta: u64) -> Index {
        Index::new(self.0.saturating_sub(delta))
    }

    pub fn checked_minus(&self, delta: u64) -> Option<Index> {
        match self.0.checked_sub(delta) {
            Some(0) | None => None,
            Some(v) => Some(Index::new(v)),
        }
    }

    /// Number of indexes in the inclusive range `(self, other]`, zero if `other <= self`.
    pub fn distance_to(&self, other: Index) -> u64 {
        other.0.saturating_sub(self.0)
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log is an append only log intended for use as a replicated commit log.
///
/// Valid indexes always form one contiguous range `[first_index, next_index)`. Entries leave the
/// log from the tail (`truncate`) when a new leader overwrites a divergent suffix, or from the head
/// (`compact`) once a snapshot covers them.
pub trait Log<E: Clone> {
    /// append() appends a log entry to the log at the next log entry index, then returns
    /// the log entry index that was just used to append the entry.
    fn append(&mut self, entry: E) -> Result<Index, io::Error>;

    /// Read log entry at specified index. Returns None for compacted or not-yet-written indexes.
    fn read(&self, index: Index) -> Result<Option<E>, io::Error>;

    /// Deletes anything starting at `index` and later.
    fn truncate(&mut self, index: Index) -> Result<(), io::Error>;

    /// Deletes anything up to and including `index`.
    fn compact(&mut self, index: Index) -> Result<(), io::Error>;

    /// Drops every entry. The next append lands at `next_index`.
    fn reset(&mut self, next_index: Index) -> Result<(), io::Error>;

    /// first_index returns the lowest readable index. Equal to `next_index()` when empty.
    fn first_index(&self) -> Index;

    /// next_index returns the next index that will be used to append an entry.
    fn next_index(&self) -> Index;
}

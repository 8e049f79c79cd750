//! Block directories.
//!
//! A directory is a newest-first list of [`DirectoryEntry`] values, one per
//! block. Entries never overlap, so the directory plus the per-block order
//! gives a single total order for the folder.
//!
//! # Lookups
//!
//! Four scans find entries without touching any block:
//!
//! - [`find_for_date`]: the range containing a timestamp.
//! - [`find_for_key`]: the entry containing a (date, id) key, or where one
//!   would go.
//! - [`find_first_overlapping`]: the newest range overlapping a time range.
//! - [`find_last_overlapping`]: the oldest range overlapping a time range.
//!
//! The scans are generic over [`TimeSpan`] so accuracy ranges use them too.
//! Each returns `(index, Some(entry))` on a hit and `(insertion_index, None)`
//! otherwise.

use serde::{Deserialize, Serialize};

use crate::model::{BlockId, MessageKey, Timestamp};

pub trait TimeSpan {
    fn start_ts(&self) -> Timestamp;
    fn end_ts(&self) -> Timestamp;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub block_id: BlockId,
    /// Oldest member.
    pub start: MessageKey,
    /// Newest member.
    pub end: MessageKey,
    pub count: usize,
    pub estimated_size: usize,
}

impl DirectoryEntry {
    pub fn new(block_id: BlockId, start: MessageKey, end: MessageKey) -> Self {
        Self {
            block_id,
            start,
            end,
            count: 0,
            estimated_size: 0,
        }
    }

    pub fn contains(&self, key: &MessageKey) -> bool {
        *key >= self.start && *key <= self.end
    }
}

impl TimeSpan for DirectoryEntry {
    fn start_ts(&self) -> Timestamp {
        self.start.date
    }

    fn end_ts(&self) -> Timestamp {
        self.end.date
    }
}

/// Find the range containing `date`, treating range ends as exclusive.
pub fn find_for_date<T: TimeSpan>(list: &[T], date: Timestamp) -> (usize, Option<&T>) {
    for (i, info) in list.iter().enumerate() {
        // Already past where it would be.
        if date >= info.end_ts() {
            return (i, None);
        }
        if date >= info.start_ts() {
            return (i, Some(info));
        }
    }
    (list.len(), None)
}

/// Find the entry whose [start, end] key range holds `key`.
pub fn find_for_key<'a>(
    list: &'a [DirectoryEntry],
    key: &MessageKey,
) -> (usize, Option<&'a DirectoryEntry>) {
    for (i, info) in list.iter().enumerate() {
        if *key > info.end {
            return (i, None);
        }
        if *key >= info.start {
            return (i, Some(info));
        }
    }
    (list.len(), None)
}

/// Newest entry overlapping `[start, end)`; `end == None` means unbounded.
pub fn find_first_overlapping<T: TimeSpan>(
    list: &[T],
    start: Timestamp,
    end: Option<Timestamp>,
) -> (usize, Option<&T>) {
    for (i, info) in list.iter().enumerate() {
        // Everything from here on is older than the range.
        if start > info.end_ts() {
            return (i, None);
        }
        if end.map_or(true, |end| end > info.start_ts()) {
            return (i, Some(info));
        }
    }
    (list.len(), None)
}

/// Oldest entry overlapping `[start, end)`, scanning from the old end.
pub fn find_last_overlapping<T: TimeSpan>(
    list: &[T],
    start: Timestamp,
    end: Timestamp,
) -> (usize, Option<&T>) {
    for (i, info) in list.iter().enumerate().rev() {
        // Everything from here on is newer than the range.
        if end <= info.start_ts() {
            return (i + 1, None);
        }
        if start < info.end_ts() {
            return (i, Some(info));
        }
    }
    (0, None)
}

/// Whether two inclusive key ranges intersect.
pub fn key_ranges_intersect(a: (MessageKey, MessageKey), b: (MessageKey, MessageKey)) -> bool {
    let (a_start, a_end) = a;
    let (b_start, b_end) = b;
    !(a_start > b_end || b_start > a_end)
}

/// A newest-first directory of blocks of one kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    entries: Vec<DirectoryEntry>,
}

impl Directory {
    pub fn new(entries: Vec<DirectoryEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[DirectoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DirectoryEntry> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut DirectoryEntry> {
        self.entries.get_mut(index)
    }

    pub fn first(&self) -> Option<&DirectoryEntry> {
        self.entries.first()
    }

    pub fn last(&self) -> Option<&DirectoryEntry> {
        self.entries.last()
    }

    pub fn insert(&mut self, index: usize, entry: DirectoryEntry) {
        self.entries.insert(index, entry);
    }

    pub fn remove(&mut self, index: usize) -> DirectoryEntry {
        self.entries.remove(index)
    }

    pub fn position_of(&self, block_id: BlockId) -> Option<usize> {
        self.entries.iter().position(|e| e.block_id == block_id)
    }

    pub fn find_for_key(&self, key: &MessageKey) -> (usize, Option<&DirectoryEntry>) {
        find_for_key(&self.entries, key)
    }

    pub fn find_first_overlapping(
        &self,
        start: Timestamp,
        end: Option<Timestamp>,
    ) -> (usize, Option<&DirectoryEntry>) {
        find_first_overlapping(&self.entries, start, end)
    }

    pub fn total_count(&self) -> usize {
        self.entries.iter().map(|e| e.count).sum()
    }

    pub fn into_entries(self) -> Vec<DirectoryEntry> {
        self.entries
    }
}

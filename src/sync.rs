//! The seam to whatever talks to the mail server.
//!
//! A folder store works fine without a syncer; it then behaves as if it were
//! permanently offline. When one is attached, slices ask it to run initial,
//! refresh and growth syncs. The syncer feeds what it learns back through the
//! store's mutation entry points and `mark_sync_range`.

use crate::error::Result;
use crate::model::Timestamp;
use crate::slice::Slice;

/// Which way through time a sync walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    Pastwards,
    Futurewards,
}

#[async_trait::async_trait]
pub trait FolderSyncer: Send + Sync {
    fn is_online(&self) -> bool;

    /// False when the account cannot sync this folder at all.
    fn is_syncable(&self) -> bool {
        true
    }

    /// Whether the protocol can extend the synced range incrementally.
    fn can_grow_sync(&self) -> bool {
        true
    }

    /// First sync of a folder, covering the last `days` days.
    async fn initial_sync(&self, slice: &Slice, days: u32) -> Result<()>;

    /// Re-check `[start, end)`; `end == None` means through now. `orig_start`
    /// is where the slice really started when `start` got widened to the
    /// oldest synced date.
    async fn refresh_sync(
        &self,
        slice: &Slice,
        dir: SyncDirection,
        start: Timestamp,
        end: Option<Timestamp>,
        orig_start: Option<Timestamp>,
    ) -> Result<()>;

    /// Sync `days` more days starting at `start`, walking `dir`.
    async fn grow_sync(
        &self,
        slice: &Slice,
        dir: SyncDirection,
        start: Timestamp,
        days: u32,
    ) -> Result<()>;

    /// No slices are open and nothing holds the folder mutex.
    fn all_consumers_dead(&self) {}
}

//! Live windows over a folder's ordered headers.
//!
//! A [`Slice`] holds copies of a contiguous run of headers, newest first,
//! and the keys bounding that run. It never points into cached blocks, so
//! evicting a block can't invalidate a slice. The folder store pushes
//! add/modify/remove notifications into the slices whose window they touch;
//! slices batch the resulting updates and hand them to their
//! [`SliceListener`] on the next scheduling turn, or right away once more than
//! `flush_threshold` are pending.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::error::{Error, Result};
use crate::folder::{FolderStore, Inner};
use crate::model::{HeaderRecord, MessageKey};
use crate::ordered::{bsearch_for_insert, bsearch_maybe_exists};

pub type SliceId = u64;

/// Progress reported as soon as a sync starts, so the UI shows movement.
pub(crate) const SYNC_START_MINIMUM_PROGRESS: f64 = 0.02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceUpdate {
    /// Remove `remove_count` headers at `index`, then insert `inserted` there.
    Splice {
        index: usize,
        remove_count: usize,
        inserted: Vec<HeaderRecord>,
        still_syncing: bool,
    },
    /// The header at `index` changed in place.
    Modified { index: usize, header: HeaderRecord },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceStatus {
    Synchronizing,
    Synced,
    SyncFailed,
    SyncBlocked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliceFlags {
    /// The newest header shown is the newest one known.
    pub at_top: bool,
    /// The oldest header shown is the oldest one known.
    pub at_bottom: bool,
    pub user_can_grow_upwards: bool,
    pub user_can_grow_downwards: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlicePhase {
    Empty,
    Populated,
    Growing,
    Shrinking,
    Detached,
}

/// What the slice is waiting on the syncer for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DataWait {
    Sync,
    Grow,
    Refresh,
}

/// Receives a slice's batched updates and status changes.
///
/// Called without any store or slice lock held.
pub trait SliceListener: Send + Sync {
    fn on_updates(&self, slice: SliceId, updates: Vec<SliceUpdate>);

    fn on_status(
        &self,
        slice: SliceId,
        status: SliceStatus,
        progress: Option<f64>,
        flags: SliceFlags,
    );
}

struct SliceState {
    headers: Vec<HeaderRecord>,
    /// Oldest header in the window.
    start: Option<MessageKey>,
    /// Newest header in the window.
    end: Option<MessageKey>,
    desired: usize,
    phase: SlicePhase,
    status: Option<SliceStatus>,
    flags: SliceFlags,
    ignore_headers: bool,
    waiting_on_data: Option<DataWait>,
    pending: Vec<SliceUpdate>,
    flush_scheduled: bool,
}

struct SliceInner {
    id: SliceId,
    listener: Arc<dyn SliceListener>,
    flush_threshold: usize,
    store: Weak<Inner>,
    state: Mutex<SliceState>,
}

/// Handle to a live slice. Clones share the same window.
#[derive(Clone)]
pub struct Slice {
    inner: Arc<SliceInner>,
}

impl std::fmt::Debug for Slice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Slice")
            .field("id", &self.inner.id)
            .field("len", &state.headers.len())
            .field("start", &state.start)
            .field("end", &state.end)
            .field("phase", &state.phase)
            .finish()
    }
}

impl Slice {
    pub(crate) fn new(
        id: SliceId,
        listener: Arc<dyn SliceListener>,
        flush_threshold: usize,
        store: Weak<Inner>,
    ) -> Self {
        Self {
            inner: Arc::new(SliceInner {
                id,
                listener,
                flush_threshold,
                store,
                state: Mutex::new(SliceState {
                    headers: Vec::new(),
                    start: None,
                    end: None,
                    desired: 0,
                    phase: SlicePhase::Empty,
                    status: None,
                    flags: SliceFlags::default(),
                    ignore_headers: false,
                    waiting_on_data: None,
                    pending: Vec::new(),
                    flush_scheduled: false,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SliceState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn folder(&self) -> Result<FolderStore> {
        if self.is_detached() {
            return Err(Error::SliceDetached);
        }
        self.inner
            .store
            .upgrade()
            .map(FolderStore::from_inner)
            .ok_or_else(|| Error::InvalidState("folder store closed".into()))
    }

    pub fn id(&self) -> SliceId {
        self.inner.id
    }

    pub fn headers(&self) -> Vec<HeaderRecord> {
        self.lock().headers.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().headers.is_empty()
    }

    /// `(oldest, newest)` keys of the window.
    pub fn bounds(&self) -> Option<(MessageKey, MessageKey)> {
        let state = self.lock();
        state.start.zip(state.end)
    }

    pub(crate) fn start(&self) -> Option<MessageKey> {
        self.lock().start
    }

    pub(crate) fn end(&self) -> Option<MessageKey> {
        self.lock().end
    }

    pub fn desired(&self) -> usize {
        self.lock().desired
    }

    pub fn phase(&self) -> SlicePhase {
        self.lock().phase
    }

    pub fn status(&self) -> Option<SliceStatus> {
        self.lock().status
    }

    pub fn flags(&self) -> SliceFlags {
        self.lock().flags
    }

    pub fn is_detached(&self) -> bool {
        self.lock().phase == SlicePhase::Detached
    }

    pub(crate) fn ignore_headers(&self) -> bool {
        self.lock().ignore_headers
    }

    /// Make the slice deaf to notifications while it is the sync driver.
    pub fn set_ignore_headers(&self, ignore: bool) {
        self.lock().ignore_headers = ignore;
    }

    pub(crate) fn set_waiting_on_data(&self, wait: Option<DataWait>) {
        self.lock().waiting_on_data = wait;
    }

    pub(crate) fn set_desired(&self, desired: usize) {
        self.lock().desired = desired;
    }

    pub(crate) fn add_desired(&self, more: usize) {
        self.lock().desired += more;
    }

    pub(crate) fn set_flags(&self, flags: SliceFlags) {
        self.lock().flags = flags;
    }

    pub(crate) fn set_phase(&self, phase: SlicePhase) {
        let mut state = self.lock();
        if state.phase != SlicePhase::Detached {
            state.phase = phase;
        }
    }

    /// Settle back to `Empty` or `Populated` after a grow or shrink.
    pub(crate) fn settle_phase(&self) {
        let mut state = self.lock();
        if state.phase != SlicePhase::Detached {
            state.phase = if state.headers.is_empty() {
                SlicePhase::Empty
            } else {
                SlicePhase::Populated
            };
        }
    }

    /// Report a status change with the given flags.
    pub(crate) fn set_status(&self, status: SliceStatus, progress: Option<f64>, flags: SliceFlags) {
        {
            let mut state = self.lock();
            if state.phase == SlicePhase::Detached {
                return;
            }
            state.status = Some(status);
            state.flags = flags;
        }
        tracing::debug!(slice = self.inner.id, ?status, ?progress, "slice status");
        self.inner
            .listener
            .on_status(self.inner.id, status, progress, flags);
    }

    /// Progress from a running sync.
    pub fn set_sync_progress(&self, progress: f64) {
        let flags = self.flags();
        self.set_status(SliceStatus::Synchronizing, Some(progress), flags);
    }

    /// Insert a contiguous run of headers at `insert_at` (`None` appends at
    /// the old end) and widen the bounds to cover them.
    pub(crate) fn batch_append(
        &self,
        headers: Vec<HeaderRecord>,
        insert_at: Option<usize>,
        still_syncing: bool,
    ) -> bool {
        let mut state = self.lock();
        if state.phase == SlicePhase::Detached || headers.is_empty() {
            return false;
        }
        let at = insert_at.unwrap_or(state.headers.len()).min(state.headers.len());

        let (newest, oldest) = match (headers.first(), headers.last()) {
            (Some(first), Some(last)) => (first.key(), last.key()),
            _ => return false,
        };
        if state.start.map_or(true, |start| oldest < start) {
            state.start = Some(oldest);
        }
        if state.end.map_or(true, |end| newest > end) {
            state.end = Some(newest);
        }

        state.headers.splice(at..at, headers.iter().cloned());
        if state.phase == SlicePhase::Empty {
            state.phase = SlicePhase::Populated;
        }
        self.queue(
            &mut state,
            SliceUpdate::Splice {
                index: at,
                remove_count: 0,
                inserted: headers,
                still_syncing,
            },
        )
    }

    /// Whether an added header with `key` belongs in this window.
    ///
    /// `newest_known`/`oldest_known` are the folder's edges before the add.
    pub(crate) fn wants_added(
        &self,
        key: &MessageKey,
        newest_known: Option<MessageKey>,
        oldest_known: Option<MessageKey>,
    ) -> bool {
        let state = self.lock();
        if state.phase == SlicePhase::Detached {
            return false;
        }
        match (state.start, state.end) {
            (Some(start), Some(end)) => {
                if *key < start {
                    state.headers.len() < state.desired || Some(start) == oldest_known
                } else if *key > end {
                    Some(end) == newest_known
                } else {
                    true
                }
            }
            _ => true,
        }
    }

    /// Whether `key` lies inside the current window.
    pub(crate) fn covers(&self, key: &MessageKey) -> bool {
        let state = self.lock();
        state.phase != SlicePhase::Detached
            && matches!((state.start, state.end), (Some(start), Some(end)) if *key >= start && *key <= end)
    }

    pub(crate) fn note_added(&self, header: &HeaderRecord) -> bool {
        let mut state = self.lock();
        if state.phase == SlicePhase::Detached {
            return false;
        }
        let key = header.key();
        let idx = bsearch_for_insert(&state.headers, &key, HeaderRecord::key);
        if state.headers.get(idx).map(HeaderRecord::key) == Some(key) {
            return false;
        }
        let len = state.headers.len();
        // Full and it would land past the old end: not our business.
        if len >= state.desired && idx == len {
            return false;
        }
        if len >= state.desired {
            state.desired += 1;
        }

        if state.start.map_or(true, |start| key < start) {
            state.start = Some(key);
        }
        if state.end.map_or(true, |end| key > end) {
            state.end = Some(key);
        }
        state.headers.insert(idx, header.clone());
        if state.phase == SlicePhase::Empty {
            state.phase = SlicePhase::Populated;
        }
        let still_syncing = state.waiting_on_data.is_some();
        self.queue(
            &mut state,
            SliceUpdate::Splice {
                index: idx,
                remove_count: 0,
                inserted: vec![header.clone()],
                still_syncing,
            },
        )
    }

    pub(crate) fn note_modified(&self, header: &HeaderRecord) -> bool {
        let mut state = self.lock();
        if state.phase == SlicePhase::Detached {
            return false;
        }
        let Some(idx) = bsearch_maybe_exists(&state.headers, &header.key(), HeaderRecord::key)
        else {
            return false;
        };
        state.headers[idx] = header.clone();
        self.queue(
            &mut state,
            SliceUpdate::Modified {
                index: idx,
                header: header.clone(),
            },
        )
    }

    pub(crate) fn note_removed(&self, key: &MessageKey) -> bool {
        let mut state = self.lock();
        if state.phase == SlicePhase::Detached {
            return false;
        }
        let Some(idx) = bsearch_maybe_exists(&state.headers, key, HeaderRecord::key) else {
            return false;
        };
        state.headers.remove(idx);

        // Keep the bounds when the window empties so growth still has an anchor.
        if !state.headers.is_empty() {
            if idx == 0 {
                state.end = state.headers.first().map(HeaderRecord::key);
            } else if idx == state.headers.len() {
                state.start = state.headers.last().map(HeaderRecord::key);
            }
        }
        self.queue(
            &mut state,
            SliceUpdate::Splice {
                index: idx,
                remove_count: 1,
                inserted: Vec::new(),
                still_syncing: false,
            },
        )
    }

    /// Trim the window to `[first_index, last_index]`. Indices are re-derived
    /// from the keys when the window moved underneath the caller; an inverted
    /// range is rejected and leaves the window untouched.
    fn trim(
        &self,
        mut first_index: usize,
        first_key: Option<MessageKey>,
        mut last_index: usize,
        last_key: Option<MessageKey>,
    ) -> Result<bool> {
        let mut state = self.lock();
        if state.phase == SlicePhase::Detached {
            return Ok(false);
        }
        let key_at = |headers: &[HeaderRecord], i: usize| headers.get(i).map(HeaderRecord::key);

        if first_key.is_some() && key_at(&state.headers, first_index) != first_key {
            first_index = state
                .headers
                .iter()
                .position(|h| Some(h.key()) == first_key)
                .unwrap_or(0);
        }
        if last_key.is_some() && key_at(&state.headers, last_index) != last_key {
            if let Some(i) = state.headers.iter().rposition(|h| Some(h.key()) == last_key) {
                last_index = i;
            }
        }

        if !state.headers.is_empty() && last_index < first_index {
            return Err(Error::InvalidOperation(format!(
                "slice {} cannot shrink to [{}, {}]",
                self.inner.id, first_index, last_index
            )));
        }

        state.phase = SlicePhase::Shrinking;
        let mut flush = false;

        // High end first so the low indices stay valid.
        let len = state.headers.len();
        if last_index + 1 < len {
            let removed = len - last_index - 1;
            state.flags.at_bottom = false;
            state.flags.user_can_grow_downwards = false;
            state.desired = state.desired.saturating_sub(removed);
            state.headers.truncate(last_index + 1);
            state.start = state.headers.last().map(HeaderRecord::key);
            flush |= self.queue(
                &mut state,
                SliceUpdate::Splice {
                    index: last_index + 1,
                    remove_count: removed,
                    inserted: Vec::new(),
                    still_syncing: false,
                },
            );
        }

        let first_index = first_index.min(state.headers.len().saturating_sub(1));
        if first_index > 0 {
            state.flags.at_top = false;
            state.flags.user_can_grow_upwards = false;
            state.desired = state.desired.saturating_sub(first_index);
            state.headers.drain(..first_index);
            state.end = state.headers.first().map(HeaderRecord::key);
            flush |= self.queue(
                &mut state,
                SliceUpdate::Splice {
                    index: 0,
                    remove_count: first_index,
                    inserted: Vec::new(),
                    still_syncing: false,
                },
            );
        }

        state.phase = if state.headers.is_empty() {
            SlicePhase::Empty
        } else {
            SlicePhase::Populated
        };
        Ok(flush)
    }

    fn queue(&self, state: &mut SliceState, update: SliceUpdate) -> bool {
        state.pending.push(update);
        if state.pending.len() > self.inner.flush_threshold {
            return true;
        }
        if state.flush_scheduled {
            return false;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                state.flush_scheduled = true;
                let slice = self.clone();
                handle.spawn(async move {
                    tokio::task::yield_now().await;
                    slice.flush();
                });
                false
            }
            // No runtime to defer to.
            Err(_) => true,
        }
    }

    /// Hand every pending update to the listener as one batch.
    pub(crate) fn flush(&self) {
        let updates = {
            let mut state = self.lock();
            state.flush_scheduled = false;
            if state.phase == SlicePhase::Detached {
                state.pending.clear();
                return;
            }
            std::mem::take(&mut state.pending)
        };
        if !updates.is_empty() {
            self.inner.listener.on_updates(self.inner.id, updates);
        }
    }

    pub(crate) fn flush_if(&self, needed: bool) {
        if needed {
            self.flush();
        }
    }

    /// Ask for `dir_magnitude` more headers: negative grows toward newer
    /// messages, positive toward older ones. ±1 means one screenful.
    pub async fn grow(&self, dir_magnitude: i64, user_requested: bool) -> Result<()> {
        let store = self.folder()?;
        store.grow_slice(self, dir_magnitude, user_requested).await
    }

    /// Keep only `[first_index, last_index]`; the keys identify those
    /// headers in case the indices are stale.
    pub fn shrink(
        &self,
        first_index: usize,
        first_key: Option<MessageKey>,
        last_index: usize,
        last_key: Option<MessageKey>,
    ) -> Result<()> {
        let store = self.folder()?;
        let flush = self.trim(first_index, first_key, last_index, last_key)?;
        self.flush_if(flush);
        store.slice_shrunk();
        Ok(())
    }

    /// Re-sync the span the slice shows.
    pub async fn refresh(&self) -> Result<()> {
        let store = self.folder()?;
        store.refresh_slice(self).await
    }

    /// Stop observing the folder. Terminal.
    pub fn detach(&self) {
        {
            let mut state = self.lock();
            if state.phase == SlicePhase::Detached {
                return;
            }
            state.phase = SlicePhase::Detached;
            state.desired = 0;
            state.pending.clear();
        }
        tracing::debug!(slice = self.inner.id, "slice detached");
        if let Some(inner) = self.inner.store.upgrade() {
            FolderStore::from_inner(inner).dying_slice(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{header, RecordingListener};
    use std::time::Duration;

    fn detached_slice(listener: &Arc<RecordingListener>, threshold: usize) -> Slice {
        Slice::new(1, listener.clone(), threshold, Weak::new())
    }

    fn keys(slice: &Slice) -> Vec<u64> {
        slice.headers().iter().map(|h| h.id).collect()
    }

    #[test]
    fn test_batch_append_sets_bounds() {
        let listener = Arc::new(RecordingListener::default());
        let slice = detached_slice(&listener, 5);
        assert_eq!(slice.phase(), SlicePhase::Empty);

        // No runtime: flushes are immediate.
        let flush = slice.batch_append(vec![header(3, 300), header(2, 200)], None, false);
        slice.flush_if(flush);
        let flush = slice.batch_append(vec![header(1, 100)], None, false);
        slice.flush_if(flush);

        assert_eq!(keys(&slice), vec![3, 2, 1]);
        assert_eq!(
            slice.bounds(),
            Some((MessageKey::new(100, 1), MessageKey::new(300, 3)))
        );
        assert_eq!(slice.phase(), SlicePhase::Populated);
        assert_eq!(listener.update_batches().len(), 2);
    }

    #[test]
    fn test_added_headers_respect_desired_count() {
        let listener = Arc::new(RecordingListener::default());
        let slice = detached_slice(&listener, 50);
        slice.flush_if(slice.batch_append(vec![header(3, 300), header(2, 200)], None, false));
        slice.set_desired(2);

        // Full and past the old end: ignored.
        slice.flush_if(slice.note_added(&header(1, 100)));
        assert_eq!(keys(&slice), vec![3, 2]);

        // Inside the window: accepted and the desired count grows.
        slice.flush_if(slice.note_added(&header(4, 250)));
        assert_eq!(keys(&slice), vec![3, 4, 2]);
        assert_eq!(slice.desired(), 3);

        // Exact duplicates are dropped.
        assert!(!slice.note_added(&header(4, 250)));
        assert_eq!(slice.len(), 3);
    }

    #[test]
    fn test_modify_and_remove() {
        let listener = Arc::new(RecordingListener::default());
        let slice = detached_slice(&listener, 50);
        slice.flush_if(slice.batch_append(
            vec![header(3, 300), header(2, 200), header(1, 100)],
            None,
            false,
        ));

        let mut changed = header(2, 200);
        changed.subject = Some("re: hello".into());
        slice.flush_if(slice.note_modified(&changed));
        slice.flush_if(slice.note_removed(&MessageKey::new(300, 3)));
        slice.flush_if(slice.note_removed(&MessageKey::new(100, 1)));

        assert_eq!(keys(&slice), vec![2]);
        assert_eq!(
            slice.bounds(),
            Some((MessageKey::new(200, 2), MessageKey::new(200, 2)))
        );
        let updates: Vec<_> = listener.update_batches().into_iter().flatten().collect();
        assert!(updates.contains(&SliceUpdate::Modified {
            index: 1,
            header: changed.clone()
        }));
        assert!(updates.contains(&SliceUpdate::Splice {
            index: 0,
            remove_count: 1,
            inserted: vec![],
            still_syncing: false
        }));

        // Removing the last one keeps the bounds as a growth anchor.
        slice.flush_if(slice.note_removed(&MessageKey::new(200, 2)));
        assert!(slice.is_empty());
        assert!(slice.bounds().is_some());
    }

    #[test]
    fn test_trim_narrows_window() {
        let listener = Arc::new(RecordingListener::default());
        let slice = detached_slice(&listener, 50);
        let headers: Vec<_> = (1..=6).rev().map(|i| header(i, i as i64 * 100)).collect();
        slice.flush_if(slice.batch_append(headers, None, false));
        slice.set_desired(6);
        let before = slice.bounds().unwrap();

        // Stale indices are fixed up from the keys.
        let flush = slice
            .trim(0, Some(MessageKey::new(500, 5)), 0, Some(MessageKey::new(200, 2)))
            .unwrap();
        slice.flush_if(flush);

        assert_eq!(keys(&slice), vec![5, 4, 3, 2]);
        assert_eq!(slice.desired(), 4);
        let after = slice.bounds().unwrap();
        assert!(after.0 >= before.0 && after.1 <= before.1);
        assert_eq!(after, (MessageKey::new(200, 2), MessageKey::new(500, 5)));
        assert!(!slice.flags().at_top && !slice.flags().at_bottom);
    }

    #[test]
    fn test_trim_rejects_inverted_range() {
        let listener = Arc::new(RecordingListener::default());
        let slice = detached_slice(&listener, 50);
        let headers: Vec<_> = (1..=6).rev().map(|i| header(i, i as i64 * 100)).collect();
        slice.flush_if(slice.batch_append(headers, None, false));

        assert!(slice.trim(3, None, 1, None).is_err());
        // Keys that resolve to an inverted range are refused too.
        assert!(slice
            .trim(0, Some(MessageKey::new(200, 2)), 0, Some(MessageKey::new(500, 5)))
            .is_err());
        assert_eq!(keys(&slice), vec![6, 5, 4, 3, 2, 1]);
        assert_eq!(slice.phase(), SlicePhase::Populated);

        // A single-header window is fine.
        assert!(slice.trim(2, None, 2, None).is_ok());
        assert_eq!(keys(&slice), vec![4]);
    }

    #[tokio::test]
    async fn test_updates_are_batched_until_next_turn() -> Result<()> {
        let listener = Arc::new(RecordingListener::default());
        let slice = detached_slice(&listener, 5);

        for i in 1..=3u64 {
            slice.flush_if(slice.note_added(&header(i, i as i64 * 10)));
        }
        assert!(listener.update_batches().is_empty());

        tokio::time::sleep(Duration::from_millis(5)).await;
        let batches = listener.update_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_large_batches_flush_immediately() -> Result<()> {
        let listener = Arc::new(RecordingListener::default());
        let slice = detached_slice(&listener, 5);

        let mut flushed_at = None;
        for i in 1..=6u64 {
            if slice.note_added(&header(i, i as i64 * 10)) {
                flushed_at = Some(i);
                slice.flush();
            }
        }
        assert_eq!(flushed_at, Some(6));
        assert_eq!(listener.update_batches()[0].len(), 6);
        Ok(())
    }

    #[tokio::test]
    async fn test_detached_slice_goes_quiet() -> Result<()> {
        let listener = Arc::new(RecordingListener::default());
        let slice = detached_slice(&listener, 5);
        slice.flush_if(slice.note_added(&header(1, 10)));
        slice.detach();

        assert!(slice.is_detached());
        assert!(!slice.note_added(&header(2, 20)));
        assert!(matches!(slice.grow(1, true).await, Err(Error::SliceDetached)));

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(listener.update_batches().is_empty());
        Ok(())
    }
}

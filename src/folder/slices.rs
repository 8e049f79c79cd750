//! The store side of slices: opening, growing, refreshing and routing
//! mutation notifications to the windows that care.

use std::sync::Arc;

use super::{state::FolderState, FolderStore};
use crate::{
    date::{quantize_date, quantize_date_up, DAY_MILLIS},
    error::Result,
    model::{HeaderRecord, MessageKey, Timestamp},
    slice::{
        DataWait, Slice, SliceFlags, SliceListener, SlicePhase, SliceStatus,
        SYNC_START_MINIMUM_PROGRESS,
    },
    sync::SyncDirection,
};

/// Offer a freshly added header to every slice.
///
/// The sync-driving slice takes everything; the rest only take headers
/// inside their window or extending an edge that sits at the folder's edge.
pub(crate) fn notify_added(state: &mut FolderState, header: &HeaderRecord) {
    let key = header.key();
    let newest = state.newest_known();
    let oldest = state.oldest_known();
    let slices = state.slices.clone();
    for slice in &slices {
        let accept = if state.is_sync_slice(slice) {
            !slice.ignore_headers()
        } else {
            slice.wants_added(&key, newest, oldest)
        };
        if accept {
            let flush = slice.note_added(header);
            state.flush_later(slice, flush);
        }
    }
}

pub(crate) fn notify_modified(state: &mut FolderState, header: &HeaderRecord, part_of_sync: bool) {
    let key = header.key();
    let slices = state.slices.clone();
    for slice in &slices {
        // The syncer already told the sync slice about its own changes.
        if part_of_sync && state.is_sync_slice(slice) {
            continue;
        }
        if slice.covers(&key) {
            let flush = slice.note_modified(header);
            state.flush_later(slice, flush);
        }
    }
}

pub(crate) fn notify_removed(state: &mut FolderState, key: &MessageKey) {
    let slices = state.slices.clone();
    for slice in &slices {
        if slice.covers(key) {
            let flush = slice.note_removed(key);
            state.flush_later(slice, flush);
        }
    }
}

fn millis(d: std::time::Duration) -> i64 {
    d.as_millis() as i64
}

impl FolderStore {
    /// Open a slice over the newest messages.
    ///
    /// Local headers are shown right away; an attached, online syncer is
    /// then asked to refresh the newest span, or to run an initial sync if
    /// the folder was never synced.
    pub async fn open_slice_most_recent(
        &self,
        listener: Arc<dyn SliceListener>,
        force_refresh: bool,
    ) -> Result<Slice> {
        let slice = {
            let mut state = self.lock();
            let id = state.next_slice_id;
            state.next_slice_id += 1;
            Slice::new(
                id,
                listener,
                self.config().slice.flush_threshold,
                Arc::downgrade(&self.inner),
            )
        };
        slice.set_desired(self.config().slice.initial_fill_size);
        self.report_status(&slice, SliceStatus::Synchronizing, Some(SYNC_START_MINIMUM_PROGRESS));
        tracing::debug!(folder = %self.folder_id(), slice = slice.id(), "Opening slice");

        self.run_mutexed("sync", |release| {
            let slice = &slice;
            async move { release.finish(self.populate_new_slice(slice, force_refresh).await) }
        })
        .await?;
        Ok(slice)
    }

    async fn populate_new_slice(&self, slice: &Slice, force_refresh: bool) -> Result<()> {
        if slice.is_detached() {
            return Ok(());
        }
        let has_ranges = {
            let mut state = self.lock();
            state.slices.push(slice.clone());
            !state.accuracy.is_empty()
        };
        let syncer = self.syncer().cloned();
        let online = syncer.as_ref().map_or(false, |s| s.is_online());

        if has_ranges {
            let fill = self.config().slice.initial_fill_size;
            let mut flush = false;
            self.messages_in_date_range(0, None, Some(fill), Some(fill), |headers, more| {
                flush |= slice.batch_append(headers, None, more);
            })
            .await?;
            slice.flush_if(flush);
            slice.set_desired(slice.len());
        }

        let outcome = match syncer {
            Some(s) if online && s.is_syncable() => {
                if has_ranges {
                    self.refresh_span(slice, !force_refresh).await
                } else {
                    self.begin_data_wait(slice, DataWait::Sync);
                    let days = self.config().slice.initial_sync_days;
                    let result = s.initial_sync(slice, days).await;
                    self.finish_data_wait(slice, result)
                }
            }
            Some(_) if online && !has_ranges => {
                self.report_status(slice, SliceStatus::SyncBlocked, None);
                Ok(())
            }
            _ => {
                self.report_status(slice, SliceStatus::Synced, None);
                Ok(())
            }
        };
        // The slice status already carries the failure.
        if let Err(e) = outcome {
            tracing::debug!(folder = %self.folder_id(), slice = slice.id(), error = %e, "Slice opened without a completed sync");
        }
        Ok(())
    }

    /// Re-sync the span `slice` shows.
    pub async fn refresh_slice(&self, slice: &Slice) -> Result<()> {
        self.report_status(slice, SliceStatus::Synchronizing, Some(0.0));
        self.run_mutexed("refresh", |release| async move {
            let result = if slice.is_detached() {
                Ok(())
            } else {
                match self.syncer() {
                    Some(s) if s.is_online() => self.refresh_span(slice, false).await,
                    _ => {
                        self.report_status(slice, SliceStatus::Synced, None);
                        Ok(())
                    }
                }
            };
            release.finish(result)
        })
        .await
    }

    /// Ask the syncer to refresh the days the slice covers.
    ///
    /// With `check_open_recency` a span whose coverage is younger than the
    /// open refresh threshold is left alone.
    async fn refresh_span(&self, slice: &Slice, check_open_recency: bool) -> Result<()> {
        let Some(syncer) = self.syncer().cloned() else {
            return Ok(());
        };
        let config = &self.config().slice;
        let now = self.now();
        let open_threshold = millis(config.open_refresh_threshold);

        let (start, end, orig_start) = {
            let state = self.lock();
            let (start_key, end_key) = (slice.start(), slice.end());
            let end = if state.is_youngest_known(end_key) {
                None
            } else {
                end_key.map(|k| quantize_date(k.date + DAY_MILLIS))
            };
            let (start, orig_start) = if state.is_oldest_known(start_key) {
                let oldest = state
                    .accuracy
                    .oldest_full_sync_date(Timestamp::MIN)
                    .unwrap_or(now);
                (oldest, start_key.map(|k| quantize_date(k.date)))
            } else {
                let start = start_key.map_or(now, |k| k.date);
                (start - millis(config.search_ambiguity), None)
            };
            (quantize_date(start), end, orig_start)
        };

        if check_open_recency {
            let until = end.unwrap_or(now - open_threshold);
            let stale = self.lock().accuracy.check_coverage_needing_refresh(
                start,
                until.max(start),
                open_threshold,
                now,
            );
            if stale.is_none() {
                tracing::debug!(folder = %self.folder_id(), slice = slice.id(), "Slice coverage is recent");
                self.report_status(slice, SliceStatus::Synced, None);
                return Ok(());
            }
        }

        self.begin_data_wait(slice, DataWait::Refresh);
        let result = syncer
            .refresh_sync(slice, SyncDirection::Futurewards, start, end, orig_start)
            .await;
        self.finish_data_wait(slice, result)
    }

    /// Grow `slice` by `dir_magnitude` headers: negative towards newer
    /// messages, positive towards older. ±1 means one initial fill.
    pub async fn grow_slice(&self, slice: &Slice, dir_magnitude: i64, user_requested: bool) -> Result<()> {
        let fill = self.config().slice.initial_fill_size as i64;
        let magnitude = match dir_magnitude {
            -1 => -fill,
            1 => fill,
            m => m,
        };
        if magnitude == 0 {
            return Ok(());
        }
        let dir = if magnitude < 0 {
            SyncDirection::Futurewards
        } else {
            SyncDirection::Pastwards
        };
        let count = magnitude.unsigned_abs() as usize;

        slice.set_phase(SlicePhase::Growing);
        let result = self
            .run_mutexed("grow", |release| async move {
                release.finish(self.grow_locked(slice, dir, count, user_requested).await)
            })
            .await;
        slice.settle_phase();
        result
    }

    async fn grow_locked(
        &self,
        slice: &Slice,
        dir: SyncDirection,
        count: usize,
        user_requested: bool,
    ) -> Result<()> {
        {
            let mut state = self.lock();
            if state.mutex.queued() == 0 {
                self.flush_excess_cached_blocks(&mut state, "grow");
            }
        }
        if slice.is_detached() {
            return Ok(());
        }

        let batch = match dir {
            SyncDirection::Pastwards => self.collect_before_message(slice.start(), count).await?,
            SyncDirection::Futurewards => match slice.end() {
                Some(end) => self.collect_after_message(Some(end), count).await?,
                None => Vec::new(),
            },
        };
        // The slice may have died while we were reading.
        if slice.is_detached() {
            return Ok(());
        }

        if !batch.is_empty() {
            let refresh = self.grow_refresh_window(slice, dir, &batch);
            let insert_at = match dir {
                SyncDirection::Pastwards => None,
                SyncDirection::Futurewards => Some(0),
            };
            let flush = slice.batch_append(batch, insert_at, refresh.is_some());
            slice.flush_if(flush);
            slice.set_desired(slice.len().max(slice.desired()));

            match (refresh, self.syncer().cloned()) {
                (Some((start, end)), Some(syncer)) => {
                    if !user_requested {
                        self.report_status(slice, SliceStatus::Synchronizing, Some(SYNC_START_MINIMUM_PROGRESS));
                    }
                    self.begin_data_wait(slice, DataWait::Refresh);
                    let result = syncer.refresh_sync(slice, dir, start, end, None).await;
                    self.finish_data_wait(slice, result)
                }
                _ => {
                    let flags = self.slice_flags(&self.lock(), slice);
                    slice.set_flags(flags);
                    Ok(())
                }
            }
        } else {
            let syncer = self.syncer().cloned();
            match syncer {
                Some(s) if s.is_online() && s.can_grow_sync() && s.is_syncable() && user_requested => {
                    let now = self.now();
                    let start = match dir {
                        SyncDirection::Pastwards => quantize_date(slice.start().map_or(now, |k| k.date)),
                        SyncDirection::Futurewards => {
                            quantize_date(slice.end().map_or(now, |k| k.date) + DAY_MILLIS)
                        }
                    };
                    self.begin_data_wait(slice, DataWait::Grow);
                    slice.add_desired(count);
                    self.report_status(slice, SliceStatus::Synchronizing, Some(SYNC_START_MINIMUM_PROGRESS));
                    let days = self.config().slice.initial_sync_growth_days;
                    let result = s.grow_sync(slice, dir, start, days).await;
                    self.finish_data_wait(slice, result)
                }
                _ => {
                    self.report_status(slice, SliceStatus::Synced, None);
                    Ok(())
                }
            }
        }
    }

    /// Span worth re-syncing after growing `slice` by `batch`, as
    /// `(start, end)` with `end == None` meaning through now.
    fn grow_refresh_window(
        &self,
        slice: &Slice,
        dir: SyncDirection,
        batch: &[HeaderRecord],
    ) -> Option<(Timestamp, Option<Timestamp>)> {
        let syncer = self.syncer()?;
        if !syncer.is_online() || !syncer.can_grow_sync() {
            return None;
        }
        let config = &self.config().slice;
        let now = self.now();
        let grow_threshold = millis(config.grow_refresh_threshold);
        let state = self.lock();

        let (start, end, highest) = match dir {
            SyncDirection::Pastwards => {
                let oldest = batch.last()?;
                let start = if state.is_oldest_known(Some(oldest.key())) {
                    state
                        .accuracy
                        .oldest_full_sync_date(Timestamp::MIN)
                        .unwrap_or(now)
                } else {
                    oldest.date - millis(config.search_ambiguity)
                };
                let end = slice.start()?.date + DAY_MILLIS;
                (start, end, now - millis(config.open_refresh_threshold))
            }
            SyncDirection::Futurewards => {
                let start = slice.end()?.date;
                let end = batch.first()?.date + DAY_MILLIS;
                (start, end, now - grow_threshold)
            }
        };
        let (end, open_end) = if end > highest {
            (highest, true)
        } else {
            (quantize_date(end), false)
        };
        let start = quantize_date(start);
        if start >= end {
            return None;
        }
        let (stale_start, stale_end) =
            state
                .accuracy
                .check_coverage_needing_refresh(start, end, grow_threshold, now)?;
        if stale_start == stale_end {
            return None;
        }
        let end = if open_end && stale_end == highest {
            None
        } else {
            Some(quantize_date_up(stale_end))
        };
        Some((quantize_date(stale_start), end))
    }

    fn begin_data_wait(&self, slice: &Slice, wait: DataWait) {
        self.lock().sync_slice = Some(slice.id());
        slice.set_waiting_on_data(Some(wait));
    }

    /// Wrap up a syncer request made on behalf of `slice`.
    fn finish_data_wait(&self, slice: &Slice, result: Result<()>) -> Result<()> {
        {
            let mut state = self.lock();
            if state.is_sync_slice(slice) {
                state.sync_slice = None;
            }
        }
        slice.set_waiting_on_data(None);
        slice.set_desired(slice.len());
        match &result {
            Ok(()) => self.report_status(slice, SliceStatus::Synced, None),
            Err(e) => {
                tracing::warn!(folder = %self.folder_id(), slice = slice.id(), error = %e, "Slice sync failed");
                self.report_status(slice, SliceStatus::SyncFailed, None);
            }
        }
        result
    }

    pub(crate) fn slice_flags(&self, state: &FolderState, slice: &Slice) -> SliceFlags {
        let at_top = state.is_youngest_known(slice.end());
        let at_bottom = state.is_oldest_known(slice.start());
        SliceFlags {
            at_top,
            at_bottom,
            user_can_grow_upwards: at_top && !self.synced_to_today_locked(state),
            user_can_grow_downwards: at_bottom && !self.synced_to_dawn_locked(state),
        }
    }

    /// Set `status` on `slice`. Flags are recomputed unless a sync is running.
    pub(crate) fn report_status(&self, slice: &Slice, status: SliceStatus, progress: Option<f64>) {
        let flags = match status {
            SliceStatus::Synchronizing => slice.flags(),
            _ => self.slice_flags(&self.lock(), slice),
        };
        slice.set_status(status, progress, flags);
    }

    pub(crate) fn slice_shrunk(&self) {
        let mut state = self.lock();
        if state.mutex.is_idle() {
            self.flush_excess_cached_blocks(&mut state, "shrunk");
        }
    }

    pub(crate) fn dying_slice(&self, slice: &Slice) {
        let all_dead = {
            let mut state = self.lock();
            state.slices.retain(|s| s.id() != slice.id());
            if state.is_sync_slice(slice) {
                state.sync_slice = None;
            }
            self.flush_excess_cached_blocks(&mut state, "deadslice");
            state.slices.is_empty() && state.mutex.is_idle()
        };
        tracing::debug!(folder = %self.folder_id(), slice = slice.id(), "Slice gone");
        if all_dead {
            if let Some(syncer) = self.syncer() {
                syncer.all_consumers_dead();
            }
        }
    }

    pub fn open_slice_count(&self) -> usize {
        self.lock().slices.len()
    }
}

//! Dropping old messages to bound a folder's local footprint.
//!
//! A cut point is derived from two heuristics: how long ago the older
//! accuracy ranges were last synced, and how many blocks the directories
//! hold. Everything dated before the cut is deleted, oldest first, and the
//! accuracy table forgets the span too so a later grow re-syncs it.

use super::{store::Step, FolderStore};
use crate::{
    accuracy::{AccuracyTable, Provenance},
    cache::BlockKey,
    config::StoreConfig,
    date::{quantize_local_midnight, DAY_MILLIS},
    directory::Directory,
    error::Result,
    model::{MessageKey, Timestamp},
};

/// Cut implied by ranges nobody has synced for a while.
///
/// Walks from the oldest range towards now and stops at the first full
/// sync that is still fresh; the cut is the end of the range just older
/// than it, but never more recent than the sync horizon.
fn last_access_cut(accuracy: &AccuracyTable, config: &StoreConfig, now: Timestamp) -> Timestamp {
    let ranges = accuracy.ranges();
    let stale_before = now - config.purge.only_after_unsynced.as_millis() as i64;

    let mut i = ranges.len();
    while i > 0 {
        if let Provenance::FullSync { updated, .. } = &ranges[i - 1].provenance {
            if *updated > stale_before {
                break;
            }
        }
        i -= 1;
    }
    let Some(range) = ranges.get(i) else {
        return 0;
    };
    let horizon = now - config.sync_horizon_ms() - DAY_MILLIS;
    range.end_ts.min(horizon)
}

/// Cut that keeps at most `limit` blocks in `dir`.
fn hard_cut(dir: &Directory, limit: usize) -> Timestamp {
    if dir.len() > limit {
        dir.get(limit).map_or(0, |e| e.start.date)
    } else {
        0
    }
}

impl FolderStore {
    /// Whether enough body blocks were created since the last purge.
    pub fn purge_scheduled(&self) -> bool {
        self.lock().purge_scheduled
    }

    /// Delete every message older than the computed cut point.
    ///
    /// Returns how many messages went and the cut, which is 0 when nothing
    /// qualified. Callers are expected to hold the folder mutex.
    pub async fn purge_excess_messages(&self) -> Result<(usize, Timestamp)> {
        let _turn = self.begin_ordered("purge_excess_messages").await?;
        let cut = {
            let mut state = self.lock();
            state.purge_scheduled = false;

            let config = self.config();
            let limit = config.purge.hard_max_block_limit;
            let cut = last_access_cut(&state.accuracy, config, self.now())
                .max(hard_cut(&state.headers, limit))
                .max(hard_cut(&state.bodies, limit));
            if cut == 0 {
                tracing::debug!(folder = %self.folder_id(), "Nothing to purge");
                return Ok((0, 0));
            }
            // Keep the whole day the cut falls in.
            let cut = quantize_local_midnight(cut + DAY_MILLIS, config.tz_offset_ms);
            state.accuracy.truncate_before(cut);
            state.meta_dirty = true;
            cut
        };

        let mut deleted = 0;
        loop {
            let victim: Option<MessageKey> = self
                .with_state(|state, _| {
                    let Some(entry) = state.headers.last() else {
                        return Ok(Step::Done(None));
                    };
                    let block_key = BlockKey::header(entry.block_id);
                    match state.cache.get(&block_key) {
                        None => Ok(Step::Load(block_key)),
                        Some(block) => Ok(Step::Done(
                            block
                                .as_header()
                                .and_then(|b| b.headers.last())
                                .filter(|h| h.date < cut)
                                .map(|h| h.key()),
                        )),
                    }
                })
                .await?;
            let Some(key) = victim else {
                break;
            };
            self.remove_message(key).await?;
            deleted += 1;
        }

        tracing::info!(folder = %self.folder_id(), deleted, cut, "Purged old messages");
        Ok((deleted, cut))
    }
}

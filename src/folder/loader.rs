//! Getting blocks into the cache and out of it again.

use std::sync::Arc;

use super::{state::FolderState, FolderStore};
use crate::{
    block::Block,
    cache::{BlockKey, LoadTicket},
    directory::key_ranges_intersect,
    error::{Error, Result},
    model::{BlockId, BlockKind},
};

impl FolderStore {
    /// Make `key` resident, joining a load already in flight for it.
    pub(crate) async fn ensure_resident(&self, key: BlockKey) -> Result<()> {
        let ticket = self.lock().cache.begin_load(key);
        let waiter = match ticket {
            LoadTicket::Resident => return Ok(()),
            LoadTicket::Leader(waiter) => {
                self.spawn_load(key);
                waiter
            }
            LoadTicket::Follower(waiter) => waiter,
        };
        match waiter.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(Error::BlockLoad {
                kind: key.kind,
                block_id: key.id,
                reason,
            }),
            Err(_) => Err(Error::InvalidState(format!("load of block {} abandoned", key))),
        }
    }

    fn spawn_load(&self, key: BlockKey) {
        let store = self.clone();
        tracing::debug!(folder = %self.folder_id(), block = %key, "Loading block");
        tokio::spawn(async move {
            let folder_id = store.folder_id().to_string();
            let block_store = store.inner.block_store.clone();
            let result = match key.kind {
                BlockKind::Header => block_store
                    .load_header_block(&folder_id, key.id)
                    .await
                    .map(Block::Header),
                BlockKind::Body => block_store
                    .load_body_block(&folder_id, key.id)
                    .await
                    .map(Block::Body),
            };
            let result = result.map_err(|e| {
                tracing::warn!(folder = %folder_id, block = %key, error = %e, "Block load failed");
                e.to_string()
            });

            store.lock().cache.complete_load(key, result);
            store.replay_deferred();
            store.arm_idle_flush();
        });
    }

    /// After a load, flush excess blocks once the mutex stayed idle for a while.
    fn arm_idle_flush(&self) {
        {
            let mut state = self.lock();
            if state.flush_timer_armed || !state.mutex.is_idle() {
                return;
            }
            state.flush_timer_armed = true;
        }
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.idle_flush_interval;
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let store = FolderStore::from_inner(inner);
            let mut state = store.lock();
            state.flush_timer_armed = false;
            if state.mutex.is_idle() {
                store.flush_excess_cached_blocks(&mut state, "idle");
            }
        });
    }

    /// Drop clean blocks nobody is looking at.
    ///
    /// Header blocks overlapping an open slice stay, as does the most recently
    /// loaded body block while any slice is open.
    pub(crate) fn flush_excess_cached_blocks(&self, state: &mut FolderState, reason: &str) {
        let windows: Vec<_> = state.slices.iter().filter_map(|s| s.bounds()).collect();
        let mut bodies_to_keep = usize::from(!state.slices.is_empty());

        let FolderState {
            cache,
            headers,
            bodies,
            ..
        } = state;
        let dropped = cache.evict_where(|key| match key.kind {
            BlockKind::Header => headers
                .position_of(key.id)
                .and_then(|i| headers.get(i))
                .map_or(false, |entry| {
                    windows
                        .iter()
                        .any(|w| key_ranges_intersect(*w, (entry.start, entry.end)))
                }),
            BlockKind::Body => {
                if bodies.position_of(key.id).is_some() && bodies_to_keep > 0 {
                    bodies_to_keep -= 1;
                    true
                } else {
                    false
                }
            }
        });
        if !dropped.is_empty() {
            tracing::debug!(
                folder = %self.folder_id(),
                reason,
                dropped = dropped.len(),
                resident = cache.resident_count(),
                "Flushed cached blocks"
            );
        }
    }

    /// Flush excess cached blocks now, unless the mutex is in use.
    pub fn flush_cache_if_idle(&self) -> bool {
        let mut state = self.lock();
        if !state.mutex.is_idle() {
            return false;
        }
        self.flush_excess_cached_blocks(&mut state, "task");
        true
    }

    /// Drop one clean resident block. Returns false if it is dirty or absent.
    pub fn discard_cached_block(&self, kind: BlockKind, id: BlockId) -> bool {
        self.lock().cache.discard(&BlockKey { kind, id })
    }

    pub fn is_block_resident(&self, kind: BlockKind, id: BlockId) -> bool {
        self.lock().cache.contains(&BlockKey { kind, id })
    }

    pub fn resident_block_count(&self) -> usize {
        self.lock().cache.resident_count()
    }

    pub fn pending_load_count(&self) -> usize {
        self.lock().cache.pending_load_count()
    }
}

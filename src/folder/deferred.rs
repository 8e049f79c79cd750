//! Deferred calls.
//!
//! Entry points that touch block contents take a turn on the `ordered` gate
//! first. While any block load is outstanding new arrivals queue up instead of
//! running, and they are replayed in arrival order once every load finished.
//! This only keeps call sites in order; exclusivity is what the mutex is for.

use super::FolderStore;
use crate::error::{Error, Result};

/// A turn on the ordered gate; the next deferred call may run once it drops.
pub(crate) struct OrderedTurn {
    store: FolderStore,
    id: u64,
}

impl Drop for OrderedTurn {
    fn drop(&mut self) {
        let mut state = self.store.lock();
        state.ordered.abandon(self.id);
        if !state.cache.has_pending_loads() {
            state.ordered.grant_next();
        }
    }
}

impl FolderStore {
    pub(crate) async fn begin_ordered(&self, name: &'static str) -> Result<OrderedTurn> {
        let (id, waiter) = {
            let mut state = self.lock();
            let blocked = state.cache.has_pending_loads();
            state.ordered.acquire(name, blocked)
        };
        let turn = OrderedTurn {
            store: self.clone(),
            id,
        };
        if let Some(waiter) = waiter {
            tracing::trace!(folder = %self.folder_id(), name, "Deferring call behind block loads");
            waiter
                .await
                .map_err(|_| Error::InvalidState(format!("deferred call {} lost", name)))?;
        }
        Ok(turn)
    }

    /// Let the next deferred call run if no loads are outstanding.
    pub(crate) fn replay_deferred(&self) {
        let mut state = self.lock();
        if !state.cache.has_pending_loads() {
            if let Some(next) = state.ordered.grant_next() {
                tracing::trace!(folder = %self.folder_id(), next, "Replaying deferred call");
            }
        }
    }

    /// Number of calls waiting for outstanding loads.
    pub fn deferred_call_count(&self) -> usize {
        self.lock().ordered.queued()
    }
}

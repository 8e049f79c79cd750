//! The folder mutex.
//!
//! Callers that mutate the folder (the operation queue, purges, slice
//! syncs) run inside [`FolderStore::run_mutexed`]. Holders are served in
//! arrival order and each one hands the mutex back exactly once through its
//! [`MutexRelease`].

use std::future::Future;

use super::FolderStore;
use crate::error::{Error, Result};

/// Proof of holding the folder mutex. Consumed by `done` or `fail`.
///
/// Dropping it without either still releases the mutex, with a warning.
pub struct MutexRelease {
    store: FolderStore,
    id: u64,
    name: &'static str,
    finished: bool,
}

impl MutexRelease {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn done(mut self) {
        self.finished = true;
        self.store.release_mutex(self.id, self.name, None);
    }

    pub fn fail(mut self, err: &Error) {
        self.finished = true;
        self.store.release_mutex(self.id, self.name, Some(err));
    }

    /// Release according to `result` and pass it through.
    pub fn finish<T>(self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.done(),
            Err(e) => self.fail(e),
        }
        result
    }
}

impl Drop for MutexRelease {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                folder = %self.store.folder_id(),
                name = self.name,
                "Mutexed call dropped without completing"
            );
            self.store.release_mutex(self.id, self.name, None);
        }
    }
}

impl FolderStore {
    /// Run `op` with exclusive access to the folder.
    ///
    /// `op` gets the [`MutexRelease`] and must complete it; the next queued
    /// call starts only after that.
    pub async fn run_mutexed<T, F, Fut>(&self, name: &'static str, op: F) -> Result<T>
    where
        F: FnOnce(MutexRelease) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (id, waiter) = self.lock().mutex.acquire(name, false);
        let release = MutexRelease {
            store: self.clone(),
            id,
            name,
            finished: false,
        };
        if let Some(waiter) = waiter {
            waiter
                .await
                .map_err(|_| Error::InvalidState(format!("mutex hand-off to {} lost", name)))?;
        }
        tracing::debug!(folder = %self.folder_id(), name, "Mutexed call begin");
        op(release).await
    }

    /// Whether nothing holds or waits for the mutex.
    pub fn mutex_idle(&self) -> bool {
        self.lock().mutex.is_idle()
    }

    fn release_mutex(&self, id: u64, name: &'static str, err: Option<&Error>) {
        let all_dead = {
            let mut state = self.lock();
            if !state.mutex.abandon(id) {
                // Gave up while still queued.
                return;
            }
            match err {
                Some(e) => {
                    tracing::debug!(folder = %self.folder_id(), name, error = %e, "Mutex released")
                }
                None => tracing::debug!(folder = %self.folder_id(), name, "Mutex released"),
            }
            match state.mutex.grant_next() {
                Some(next) => {
                    tracing::trace!(folder = %self.folder_id(), next, "Mutex handed over");
                    false
                }
                None => {
                    self.flush_excess_cached_blocks(&mut state, "mutex");
                    state.slices.is_empty()
                }
            }
        };
        if all_dead {
            if let Some(syncer) = self.syncer() {
                syncer.all_consumers_dead();
            }
        }
    }
}

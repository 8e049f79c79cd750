//! Per-folder message store.
//!
//! A [`FolderStore`] owns the header and body directories of one folder,
//! the accuracy table that records which date spans are known to match the
//! server, and a cache of the blocks that are currently resident. All of it
//! sits behind one lock; operations that need a block that isn't resident
//! drop the lock, wait for the (single-flight) load and then retry.
//!
//! Mutations are serialized through an ordered gate so they apply in call
//! order even when one of them has to wait for a load. Longer multi-step
//! work such as slice syncs and purges additionally runs under the folder
//! mutex.

mod deferred;
mod handoff;
mod loader;
mod metrics;
mod mutation;
mod mutex;
mod persist;
mod purge;
mod query;
mod slices;
mod state;
mod store;
mod tasks;

pub use mutex::MutexRelease;
pub(crate) use store::Inner;
pub use store::{FolderStore, FolderStoreBuilder};
pub use tasks::{CacheFlushTask, CheckpointTask, MetricsTask, PurgeTask};

//! Local message metadata store for a mail client.
//!
//! Each folder keeps its message headers and bodies in date-ordered blocks
//! that are loaded on demand, tracks which date spans are known to match
//! the server, and serves live slices over the newest messages. See
//! [`FolderStore`] for the entry point.

pub mod accuracy;
pub mod block;
pub mod block_store;
pub mod cache;
pub mod config;
pub mod date;
pub mod directory;
pub mod encoding;
pub mod error;
pub mod folder;
pub mod model;
pub mod ordered;
pub mod scheduler;
pub mod slice;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use block_store::{BlockStore, MemoryBlockStore, PersistedFolder};
pub use config::{PurgeConfig, SliceConfig, StoreConfig};
pub use error::{Error, Result};
pub use folder::{FolderStore, FolderStoreBuilder};
pub use model::{BodyRecord, HeaderRecord, MessageKey, Suid};
pub use slice::{Slice, SliceListener, SliceStatus, SliceUpdate};
pub use sync::{FolderSyncer, SyncDirection};

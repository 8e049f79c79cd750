//! Fixtures shared by the unit tests.

use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::block_store::{MemoryBlockStore, PersistedFolder};
use crate::config::StoreConfig;
use crate::date::{Clock, SystemClock, DAY_MILLIS};
use crate::error::{Error, Result};
use crate::folder::{FolderStore, Inner};
use crate::model::{HeaderRecord, MessageId, Timestamp};
use crate::slice::{Slice, SliceFlags, SliceId, SliceListener, SliceStatus, SliceUpdate};
use crate::sync::{FolderSyncer, SyncDirection};

pub const FOLDER: &str = "f";

/// An unread header in the test folder.
pub fn header(id: MessageId, date: Timestamp) -> HeaderRecord {
    HeaderRecord::new(FOLDER, id, date)
}

pub fn open_store() -> (FolderStore, Arc<MemoryBlockStore>) {
    open_store_with(StoreConfig::default())
}

pub fn open_store_with(config: StoreConfig) -> (FolderStore, Arc<MemoryBlockStore>) {
    open_store_at(config, Arc::new(SystemClock))
}

pub fn open_store_at(config: StoreConfig, clock: Arc<dyn Clock>) -> (FolderStore, Arc<MemoryBlockStore>) {
    let block_store = Arc::new(MemoryBlockStore::new());
    let store = FolderStore::builder(PersistedFolder::new(FOLDER), block_store.clone())
        .config(config)
        .clock(clock)
        .build();
    (store, block_store)
}

pub fn open_store_with_syncer(
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    syncer: Arc<ScriptedSyncer>,
) -> FolderStore {
    let store = FolderStore::builder(PersistedFolder::new(FOLDER), Arc::new(MemoryBlockStore::new()))
        .config(config)
        .clock(clock)
        .syncer(syncer.clone())
        .build();
    syncer.attach(&store);
    store
}

/// Fill a fresh folder through `seed`, checkpoint it, and open it again
/// with nothing resident.
pub async fn reopen<F, Fut>(
    block_store: Arc<MemoryBlockStore>,
    config: StoreConfig,
    seed: F,
) -> Result<FolderStore>
where
    F: FnOnce(FolderStore) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let store = FolderStore::builder(PersistedFolder::new(FOLDER), block_store.clone())
        .config(config.clone())
        .build();
    seed(store.clone()).await?;
    store.checkpoint().await?;

    let persisted = block_store
        .folder(FOLDER)
        .ok_or_else(|| Error::InvalidState("folder was never checkpointed".into()))?;
    Ok(FolderStore::builder(persisted, block_store).config(config).build())
}

#[derive(Default)]
pub struct RecordingListener {
    updates: Mutex<Vec<Vec<SliceUpdate>>>,
    statuses: Mutex<Vec<(SliceStatus, Option<f64>)>>,
}

impl RecordingListener {
    pub fn update_batches(&self) -> Vec<Vec<SliceUpdate>> {
        self.updates.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<(SliceStatus, Option<f64>)> {
        self.statuses.lock().unwrap().clone()
    }
}

impl SliceListener for RecordingListener {
    fn on_updates(&self, _slice: SliceId, updates: Vec<SliceUpdate>) {
        self.updates.lock().unwrap().push(updates);
    }

    fn on_status(&self, _slice: SliceId, status: SliceStatus, progress: Option<f64>, _flags: SliceFlags) {
        self.statuses.lock().unwrap().push((status, progress));
    }
}

/// A syncer that plays back canned server state into the store it is
/// attached to and records what it was asked.
pub struct ScriptedSyncer {
    online: bool,
    store: OnceLock<Weak<Inner>>,
    deliveries: Mutex<Vec<HeaderRecord>>,
    failure: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
    consumers_dead: Mutex<usize>,
}

impl ScriptedSyncer {
    fn new(online: bool) -> Self {
        Self {
            online,
            store: OnceLock::new(),
            deliveries: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            consumers_dead: Mutex::new(0),
        }
    }

    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn offline() -> Self {
        Self::new(false)
    }

    fn attach(&self, store: &FolderStore) {
        let _ = self.store.set(Arc::downgrade(&store.inner));
    }

    /// Headers the next sync "finds" on the server.
    pub fn deliver_on_sync(&self, headers: Vec<HeaderRecord>) {
        self.deliveries.lock().unwrap().extend(headers);
    }

    pub fn fail_next(&self, reason: &str) {
        *self.failure.lock().unwrap() = Some(reason.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn consumers_dead_count(&self) -> usize {
        *self.consumers_dead.lock().unwrap()
    }

    fn store(&self) -> Result<FolderStore> {
        self.store
            .get()
            .and_then(Weak::upgrade)
            .map(FolderStore::from_inner)
            .ok_or_else(|| Error::InvalidState("syncer not attached".into()))
    }

    /// Record the call, then either fail or add the pending deliveries and
    /// mark `[start, end)` synced.
    async fn play(&self, call: String, start: Timestamp, end: Option<Timestamp>) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if let Some(reason) = self.failure.lock().unwrap().take() {
            return Err(Error::InvalidState(reason));
        }
        let store = self.store()?;
        let deliveries: Vec<_> = self.deliveries.lock().unwrap().drain(..).collect();
        for header in deliveries {
            store.add_header(header).await?;
        }
        store.mark_sync_range(start, end, None, store.now())
    }
}

#[async_trait::async_trait]
impl FolderSyncer for ScriptedSyncer {
    fn is_online(&self) -> bool {
        self.online
    }

    async fn initial_sync(&self, _slice: &Slice, days: u32) -> Result<()> {
        let now = self.store()?.now();
        self.play(format!("initial_sync {}", days), now - days as i64 * DAY_MILLIS, None)
            .await
    }

    async fn refresh_sync(
        &self,
        _slice: &Slice,
        dir: SyncDirection,
        start: Timestamp,
        end: Option<Timestamp>,
        _orig_start: Option<Timestamp>,
    ) -> Result<()> {
        self.play(format!("refresh_sync {:?} {} {:?}", dir, start, end), start, end)
            .await
    }

    async fn grow_sync(&self, _slice: &Slice, dir: SyncDirection, start: Timestamp, days: u32) -> Result<()> {
        let span = days as i64 * DAY_MILLIS;
        let (from, to) = match dir {
            SyncDirection::Pastwards => (start - span, start),
            SyncDirection::Futurewards => (start, start + span),
        };
        self.play(format!("grow_sync {:?} {} {}", dir, start, days), from, Some(to))
            .await
    }

    fn all_consumers_dead(&self) {
        *self.consumers_dead.lock().unwrap() += 1;
    }
}

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::state::FolderState;
use crate::{
    accuracy::Provenance,
    block_store::{BlockStore, PersistedFolder},
    cache::BlockKey,
    config::StoreConfig,
    date::{Clock, SystemClock, DAY_MILLIS},
    error::Result,
    model::{BlockKind, BodyRecord, HeaderRecord, MessageKey, Suid, Timestamp},
    sync::FolderSyncer,
};

/// Shared innards of a [`FolderStore`]; slices keep a weak reference to it.
pub(crate) struct Inner {
    pub(crate) folder_id: String,
    pub(crate) config: StoreConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) block_store: Arc<dyn BlockStore>,
    pub(crate) syncer: Option<Arc<dyn FolderSyncer>>,
    pub(crate) state: Mutex<FolderState>,
}

/// Result of one pass over the folder state: either finished, or blocked on
/// a block that has to be loaded before the pass can be retried.
///
/// A pass that returns `Load` must not have changed anything.
pub(crate) enum Step<T> {
    Done(T),
    Load(BlockKey),
}

/// The message store of one folder.
///
/// Cloning is cheap; clones share the same folder.
#[derive(Clone)]
pub struct FolderStore {
    pub(crate) inner: Arc<Inner>,
}

pub struct FolderStoreBuilder {
    persisted: PersistedFolder,
    block_store: Arc<dyn BlockStore>,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    syncer: Option<Arc<dyn FolderSyncer>>,
}

impl FolderStoreBuilder {
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn syncer(mut self, syncer: Arc<dyn FolderSyncer>) -> Self {
        self.syncer = Some(syncer);
        self
    }

    pub fn build(self) -> FolderStore {
        let folder_id = self.persisted.folder_id.clone();
        let state = FolderState::restore(self.persisted, self.config.track_server_ids);
        tracing::info!(
            folder = %folder_id,
            header_blocks = state.headers.len(),
            body_blocks = state.bodies.len(),
            accuracy_ranges = state.accuracy.len(),
            "Folder store opened"
        );
        FolderStore {
            inner: Arc::new(Inner {
                folder_id,
                config: self.config,
                clock: self.clock,
                block_store: self.block_store,
                syncer: self.syncer,
                state: Mutex::new(state),
            }),
        }
    }
}

impl FolderStore {
    pub fn builder(persisted: PersistedFolder, block_store: Arc<dyn BlockStore>) -> FolderStoreBuilder {
        FolderStoreBuilder {
            persisted,
            block_store,
            config: StoreConfig::default(),
            clock: Arc::new(SystemClock),
            syncer: None,
        }
    }

    /// Open a folder with default configuration and no syncer.
    pub fn open(persisted: PersistedFolder, block_store: Arc<dyn BlockStore>) -> Self {
        Self::builder(persisted, block_store).build()
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FolderState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.inner.clock.now()
    }

    pub(crate) fn syncer(&self) -> Option<&Arc<dyn FolderSyncer>> {
        self.inner.syncer.as_ref()
    }

    pub fn folder_id(&self) -> &str {
        &self.inner.folder_id
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Run `pass` against the folder state until it stops asking for blocks.
    ///
    /// Every `Step::Load` releases the lock, waits for the block and retries.
    /// Slices that filled up during a pass are flushed after the lock drops.
    pub(crate) async fn with_state<T, F>(&self, mut pass: F) -> Result<T>
    where
        F: FnMut(&mut FolderState, &StoreConfig) -> Result<Step<T>>,
    {
        loop {
            let (result, outbox) = {
                let mut state = self.lock();
                let result = pass(&mut state, &self.inner.config);
                (result, std::mem::take(&mut state.outbox))
            };
            for slice in outbox {
                slice.flush();
            }
            match result? {
                Step::Done(value) => return Ok(value),
                Step::Load(key) => self.ensure_resident(key).await?,
            }
        }
    }

    /// Header stored under `key`.
    pub async fn get_header(&self, key: MessageKey) -> Result<Option<HeaderRecord>> {
        self.with_state(|state, _| {
            let Some(block_key) = block_for(state, BlockKind::Header, &key) else {
                return Ok(Step::Done(None));
            };
            match state.cache.get(&block_key) {
                Some(block) => Ok(Step::Done(
                    block.as_header().and_then(|b| b.get(&key)).cloned(),
                )),
                None => Ok(Step::Load(block_key)),
            }
        })
        .await
    }

    /// Body stored under `key`. Waits behind outstanding block loads.
    pub async fn get_body(&self, key: MessageKey) -> Result<Option<BodyRecord>> {
        let _turn = self.begin_ordered("get_body").await?;
        self.read_body(key).await
    }

    pub(crate) async fn read_body(&self, key: MessageKey) -> Result<Option<BodyRecord>> {
        self.with_state(|state, _| {
            let Some(block_key) = block_for(state, BlockKind::Body, &key) else {
                return Ok(Step::Done(None));
            };
            match state.cache.get(&block_key) {
                Some(block) => Ok(Step::Done(
                    block
                        .as_body()
                        .filter(|b| b.position(&key).is_some())
                        .and_then(|b| b.get(key.id))
                        .cloned(),
                )),
                None => Ok(Step::Load(block_key)),
            }
        })
        .await
    }

    pub async fn get_message(
        &self,
        key: MessageKey,
    ) -> Result<(Option<HeaderRecord>, Option<BodyRecord>)> {
        let header = self.get_header(key).await?;
        let body = self.read_body(key).await?;
        Ok((header, body))
    }

    /// Header named by `suid`; `None` if it belongs to another folder.
    pub async fn get_header_by_suid(
        &self,
        suid: &Suid,
        date: Timestamp,
    ) -> Result<Option<HeaderRecord>> {
        if suid.folder_id != self.inner.folder_id {
            return Ok(None);
        }
        self.get_header(MessageKey::new(date, suid.id)).await
    }

    /// Record `[start, end)` as fully synced at `updated`; `end == None` means now.
    pub fn mark_sync_range(
        &self,
        start: Timestamp,
        end: Option<Timestamp>,
        highest_modseq: Option<String>,
        updated: Timestamp,
    ) -> Result<()> {
        let end = end.unwrap_or_else(|| self.now());
        let mut state = self.lock();
        state
            .accuracy
            .mark_sync_range(start, end, Provenance::full(highest_modseq, updated))?;
        state.last_synced_at = Some(updated);
        state.meta_dirty = true;
        Ok(())
    }

    /// Record `[start, end)` as only seen through a search.
    pub fn mark_partial_range(&self, start: Timestamp, end: Timestamp) -> Result<()> {
        let mut state = self.lock();
        state
            .accuracy
            .mark_sync_range(start, end, Provenance::Partial)?;
        state.meta_dirty = true;
        Ok(())
    }

    pub fn mark_synced_to_dawn_of_time(&self) -> bool {
        let mut state = self.lock();
        let marked = state
            .accuracy
            .mark_synced_to_dawn_of_time(self.inner.config.oldest_sync_date);
        state.meta_dirty |= marked;
        marked
    }

    pub fn clear_synced_to_dawn_of_time(&self, start: Timestamp) {
        let mut state = self.lock();
        state
            .accuracy
            .clear_synced_to_dawn_of_time(self.inner.config.oldest_sync_date, start);
        state.meta_dirty = true;
    }

    pub fn newest_full_sync_date(&self) -> Option<Timestamp> {
        self.lock().accuracy.newest_full_sync_date()
    }

    /// Start of the oldest full-sync range, or now if nothing was ever synced.
    pub fn oldest_full_sync_date(&self) -> Timestamp {
        self.lock()
            .accuracy
            .oldest_full_sync_date(Timestamp::MIN)
            .unwrap_or_else(|| self.now())
    }

    pub fn synced_to_today(&self) -> bool {
        let state = self.lock();
        self.synced_to_today_locked(&state)
    }

    pub(crate) fn synced_to_today_locked(&self, state: &FolderState) -> bool {
        if self.syncer().map_or(false, |s| !s.can_grow_sync()) {
            return true;
        }
        state.accuracy.synced_to_today(self.now())
    }

    pub fn synced_to_dawn_of_time(&self) -> bool {
        let state = self.lock();
        self.synced_to_dawn_locked(&state)
    }

    pub(crate) fn synced_to_dawn_locked(&self, state: &FolderState) -> bool {
        if self.syncer().map_or(false, |s| !s.can_grow_sync()) {
            return true;
        }
        // A day of slop for timezone drift.
        state
            .accuracy
            .synced_to_dawn_of_time(self.inner.config.oldest_sync_date + DAY_MILLIS)
    }

    /// Part of `[start, end)` whose coverage is older than `stale_ms`.
    pub fn check_coverage_needing_refresh(
        &self,
        start: Timestamp,
        end: Timestamp,
        stale_ms: i64,
    ) -> Option<(Timestamp, Timestamp)> {
        self.lock()
            .accuracy
            .check_coverage_needing_refresh(start, end, stale_ms, self.now())
    }

    pub fn header_is_youngest_known(&self, key: Option<MessageKey>) -> bool {
        self.lock().is_youngest_known(key)
    }

    pub fn header_is_oldest_known(&self, key: Option<MessageKey>) -> bool {
        self.lock().is_oldest_known(key)
    }

    pub fn known_message_count(&self) -> usize {
        self.lock().headers.total_count()
    }

    pub fn unread_count(&self) -> i64 {
        self.lock().unread_count
    }

    pub fn last_synced_at(&self) -> Option<Timestamp> {
        self.lock().last_synced_at
    }
}

/// Block key of the directory entry holding `key`.
pub(crate) fn block_for(state: &FolderState, kind: BlockKind, key: &MessageKey) -> Option<BlockKey> {
    match state.directory(kind).find_for_key(key) {
        (_, Some(entry)) => Some(BlockKey {
            kind,
            id: entry.block_id,
        }),
        _ => None,
    }
}

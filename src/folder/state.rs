use std::collections::HashMap;

use crate::{
    accuracy::AccuracyTable,
    block_store::PersistedFolder,
    cache::BlockCache,
    directory::Directory,
    folder::handoff::FifoGate,
    model::{BlockId, BlockKind, FolderSequences, MessageKey, Timestamp},
    slice::{Slice, SliceId},
};

/// All mutable state of one folder, guarded by a single lock.
pub(crate) struct FolderState {
    // Data
    pub headers: Directory,
    pub bodies: Directory,
    pub accuracy: AccuracyTable,
    pub cache: BlockCache,
    pub server_ids: Option<HashMap<String, BlockId>>,

    // Metadata
    pub sequences: FolderSequences,
    pub unread_count: i64,
    pub last_synced_at: Option<Timestamp>,
    /// Folder metadata changed since the last checkpoint.
    pub meta_dirty: bool,
    pub purge_scheduled: bool,

    // Coordination
    pub mutex: FifoGate,
    pub ordered: FifoGate,
    pub slices: Vec<Slice>,
    pub sync_slice: Option<SliceId>,
    pub next_slice_id: SliceId,
    pub flush_timer_armed: bool,
    /// Slices whose pending updates must go out as soon as the lock drops.
    pub outbox: Vec<Slice>,
}

impl FolderState {
    pub fn restore(folder: PersistedFolder, track_server_ids: bool) -> Self {
        let server_ids = match folder.server_id_map {
            Some(map) => Some(map),
            None if track_server_ids => Some(HashMap::new()),
            None => None,
        };
        Self {
            headers: Directory::new(folder.header_blocks),
            bodies: Directory::new(folder.body_blocks),
            accuracy: AccuracyTable::new(folder.accuracy_ranges),
            cache: BlockCache::new(),
            server_ids,
            sequences: folder.sequences,
            unread_count: folder.unread_count,
            last_synced_at: folder.last_synced_at,
            meta_dirty: false,
            purge_scheduled: false,
            mutex: FifoGate::default(),
            ordered: FifoGate::default(),
            slices: Vec::new(),
            sync_slice: None,
            next_slice_id: 0,
            flush_timer_armed: false,
            outbox: Vec::new(),
        }
    }

    pub fn directory(&self, kind: BlockKind) -> &Directory {
        match kind {
            BlockKind::Header => &self.headers,
            BlockKind::Body => &self.bodies,
        }
    }

    pub fn directory_mut(&mut self, kind: BlockKind) -> &mut Directory {
        match kind {
            BlockKind::Header => &mut self.headers,
            BlockKind::Body => &mut self.bodies,
        }
    }

    /// Key of the newest header the folder knows about.
    pub fn newest_known(&self) -> Option<MessageKey> {
        self.headers.first().map(|e| e.end)
    }

    /// Key of the oldest header the folder knows about.
    pub fn oldest_known(&self) -> Option<MessageKey> {
        self.headers.last().map(|e| e.start)
    }

    /// An empty folder counts every edge as the youngest one.
    pub fn is_youngest_known(&self, key: Option<MessageKey>) -> bool {
        match self.newest_known() {
            None => true,
            newest => key == newest,
        }
    }

    pub fn is_oldest_known(&self, key: Option<MessageKey>) -> bool {
        match self.oldest_known() {
            None => key.is_none(),
            oldest => key == oldest,
        }
    }

    pub fn is_sync_slice(&self, slice: &Slice) -> bool {
        self.sync_slice == Some(slice.id())
    }

    /// Queue a slice for an immediate flush once the lock is released.
    pub fn flush_later(&mut self, slice: &Slice, needed: bool) {
        if needed && !self.outbox.iter().any(|s| s.id() == slice.id()) {
            self.outbox.push(slice.clone());
        }
    }

    pub fn to_persisted(&self, folder_id: &str) -> PersistedFolder {
        PersistedFolder {
            folder_id: folder_id.to_string(),
            header_blocks: self.headers.entries().to_vec(),
            body_blocks: self.bodies.entries().to_vec(),
            accuracy_ranges: self.accuracy.ranges().to_vec(),
            sequences: self.sequences.clone(),
            server_id_map: self.server_ids.clone(),
            unread_count: self.unread_count,
            last_synced_at: self.last_synced_at,
        }
    }
}

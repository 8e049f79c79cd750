use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use tokio::sync::oneshot;

use crate::block::Block;
use crate::model::{BlockId, BlockKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub kind: BlockKind,
    pub id: BlockId,
}

impl BlockKey {
    pub fn header(id: BlockId) -> Self {
        Self {
            kind: BlockKind::Header,
            id,
        }
    }

    pub fn body(id: BlockId) -> Self {
        Self {
            kind: BlockKind::Body,
            id,
        }
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Outcome handed to every waiter of a coalesced load.
pub type LoadOutcome = std::result::Result<(), String>;

/// What a caller should do after asking for a block.
pub enum LoadTicket {
    /// Already resident.
    Resident,
    /// Nobody was loading it; the caller must fetch it and call `complete_load`.
    /// The receiver resolves like a follower's once that happens.
    Leader(oneshot::Receiver<LoadOutcome>),
    /// Someone else is fetching it; wait on the receiver.
    Follower(oneshot::Receiver<LoadOutcome>),
}

/// Whether a dirty block must be written or removed at the next checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dirty {
    Modified,
    Deleted,
}

/// Resident blocks of one folder plus the loads in flight for it.
///
/// Blocks are kept in load order so eviction can walk from the most
/// recently loaded. Dirty blocks are pinned until the next checkpoint, and
/// blocks a checkpoint is still writing stay pinned until it resolves.
pub struct BlockCache {
    blocks: HashMap<BlockKey, Block>,
    /// load/creation order, oldest first
    loaded: Vec<BlockKey>,
    dirty: HashMap<BlockKey, Dirty>,
    /// checkpoints in flight per block
    writing: HashMap<BlockKey, usize>,
    pending: HashMap<BlockKey, Vec<oneshot::Sender<LoadOutcome>>>,
    stats: Stats,
}

impl BlockCache {
    pub fn new() -> Self {
        BlockCache {
            blocks: HashMap::new(),
            loaded: Vec::new(),
            dirty: HashMap::new(),
            writing: HashMap::new(),
            pending: HashMap::new(),
            stats: Stats::new(),
        }
    }

    pub fn contains(&self, key: &BlockKey) -> bool {
        self.blocks.contains_key(key)
    }

    pub fn get(&self, key: &BlockKey) -> Option<&Block> {
        let block = self.blocks.get(key);
        if block.is_some() {
            self.stats.hit();
        }
        block
    }

    pub fn get_mut(&mut self, key: &BlockKey) -> Option<&mut Block> {
        let block = self.blocks.get_mut(key);
        if block.is_some() {
            self.stats.hit();
        }
        block
    }

    /// Add a freshly created block; it starts out dirty.
    pub fn insert_new(&mut self, key: BlockKey, block: Block) {
        self.insert(key, block);
        self.dirty.insert(key, Dirty::Modified);
    }

    fn insert(&mut self, key: BlockKey, block: Block) {
        if self.blocks.insert(key, block).is_none() {
            self.loaded.push(key);
        }
    }

    /// Register interest in `key`, coalescing with any load already in flight.
    pub fn begin_load(&mut self, key: BlockKey) -> LoadTicket {
        if self.blocks.contains_key(&key) {
            self.stats.hit();
            return LoadTicket::Resident;
        }
        match self.pending.get_mut(&key) {
            Some(waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                LoadTicket::Follower(rx)
            }
            None => {
                self.stats.miss();
                let (tx, rx) = oneshot::channel();
                self.pending.insert(key, vec![tx]);
                LoadTicket::Leader(rx)
            }
        }
    }

    /// Finish the load of `key`, waking every waiter with the same outcome.
    pub fn complete_load(&mut self, key: BlockKey, result: std::result::Result<Block, String>) {
        let outcome = match result {
            Ok(block) => {
                // A block created, modified or deleted while the load was in flight wins.
                if !self.blocks.contains_key(&key) && !matches!(self.dirty.get(&key), Some(Dirty::Deleted)) {
                    self.insert(key, block);
                }
                Ok(())
            }
            Err(reason) => Err(reason),
        };
        for waiter in self.pending.remove(&key).unwrap_or_default() {
            // Waiter may have given up.
            let _ = waiter.send(outcome.clone());
        }
    }

    pub fn has_pending_loads(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_load_count(&self) -> usize {
        self.pending.len()
    }

    pub fn mark_dirty(&mut self, key: BlockKey) {
        self.dirty.insert(key, Dirty::Modified);
    }

    /// Drop a block whose directory entry went away; it is written as a tombstone.
    pub fn remove_deleted(&mut self, key: &BlockKey) {
        self.blocks.remove(key);
        self.loaded.retain(|k| k != key);
        self.dirty.insert(*key, Dirty::Deleted);
    }

    pub fn is_dirty(&self, key: &BlockKey) -> bool {
        self.dirty.contains_key(key)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Take every dirty block (`None` for deleted ones) and forget dirtiness.
    pub fn take_dirty(&mut self) -> Vec<(BlockKey, Option<Block>)> {
        let mut dirty: Vec<_> = self.dirty.drain().collect();
        dirty.sort_by_key(|(key, _)| (key.kind == BlockKind::Body, key.id));
        dirty
            .into_iter()
            .map(|(key, state)| match state {
                Dirty::Modified => (key, self.blocks.get(&key).cloned()),
                Dirty::Deleted => (key, None),
            })
            .collect()
    }

    /// Keep `keys` resident until a matching `unpin`.
    pub fn pin<'a>(&mut self, keys: impl IntoIterator<Item = &'a BlockKey>) {
        for key in keys {
            *self.writing.entry(*key).or_insert(0) += 1;
        }
    }

    pub fn unpin<'a>(&mut self, keys: impl IntoIterator<Item = &'a BlockKey>) {
        for key in keys {
            if let Some(n) = self.writing.get_mut(key) {
                *n -= 1;
                if *n == 0 {
                    self.writing.remove(key);
                }
            }
        }
    }

    fn is_pinned(&self, key: &BlockKey) -> bool {
        self.dirty.contains_key(key) || self.writing.contains_key(key)
    }

    /// Drop a clean block. Returns false if it is pinned or not resident.
    pub fn discard(&mut self, key: &BlockKey) -> bool {
        if self.is_pinned(key) || self.blocks.remove(key).is_none() {
            return false;
        }
        self.loaded.retain(|k| k != key);
        true
    }

    /// Walk clean blocks from the most recently loaded and drop those `keep`
    /// rejects. Returns the dropped keys.
    pub fn evict_where<F>(&mut self, mut keep: F) -> Vec<BlockKey>
    where
        F: FnMut(&BlockKey) -> bool,
    {
        let mut evicted = HashSet::new();
        for key in self.loaded.iter().rev() {
            if self.is_pinned(key) {
                continue;
            }
            if !keep(key) {
                evicted.insert(*key);
            }
        }
        if evicted.is_empty() {
            return Vec::new();
        }
        self.blocks.retain(|key, _| !evicted.contains(key));
        let mut dropped = Vec::with_capacity(evicted.len());
        self.loaded.retain(|key| {
            if evicted.contains(key) {
                dropped.push(*key);
                false
            } else {
                true
            }
        });
        dropped
    }

    pub fn resident_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn resident_keys(&self) -> impl Iterator<Item = &BlockKey> {
        self.loaded.iter()
    }

    pub fn stats(&self) -> (usize, usize) {
        self.stats.get()
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}

struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Stats {
    fn new() -> Self {
        Stats {
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::SeqCst);
    }

    fn get(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::SeqCst),
            self.misses.load(Ordering::SeqCst),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: u64) -> BlockKey {
        BlockKey::header(BlockId(id))
    }

    fn loaded(cache: &mut BlockCache, id: u64) {
        assert!(matches!(cache.begin_load(key(id)), LoadTicket::Leader(_)));
        cache.complete_load(key(id), Ok(Block::empty(BlockKind::Header)));
    }

    #[tokio::test]
    async fn test_single_flight_waiters() {
        let mut cache = BlockCache::new();

        let leader = match cache.begin_load(key(1)) {
            LoadTicket::Leader(rx) => rx,
            _ => panic!("expected leader"),
        };
        let rx1 = match cache.begin_load(key(1)) {
            LoadTicket::Follower(rx) => rx,
            _ => panic!("expected follower"),
        };
        let rx2 = match cache.begin_load(key(1)) {
            LoadTicket::Follower(rx) => rx,
            _ => panic!("expected follower"),
        };
        assert!(cache.has_pending_loads());

        cache.complete_load(key(1), Ok(Block::empty(BlockKind::Header)));
        assert_eq!(leader.await.unwrap(), Ok(()));
        assert_eq!(rx1.await.unwrap(), Ok(()));
        assert_eq!(rx2.await.unwrap(), Ok(()));
        assert!(!cache.has_pending_loads());
        assert!(matches!(cache.begin_load(key(1)), LoadTicket::Resident));
        assert_eq!(cache.stats(), (1, 1));
    }

    #[tokio::test]
    async fn test_failed_load_reaches_every_waiter() {
        let mut cache = BlockCache::new();
        assert!(matches!(cache.begin_load(key(2)), LoadTicket::Leader(_)));
        let rx = match cache.begin_load(key(2)) {
            LoadTicket::Follower(rx) => rx,
            _ => panic!("expected follower"),
        };
        cache.complete_load(key(2), Err("disk on fire".into()));
        assert_eq!(rx.await.unwrap(), Err("disk on fire".to_string()));
        assert!(!cache.contains(&key(2)));
        // A later request starts a fresh load.
        assert!(matches!(cache.begin_load(key(2)), LoadTicket::Leader(_)));
    }

    #[test]
    fn test_dirty_blocks_survive_eviction() {
        let mut cache = BlockCache::new();
        loaded(&mut cache, 1);
        loaded(&mut cache, 2);
        cache.insert_new(key(3), Block::empty(BlockKind::Header));

        let dropped = cache.evict_where(|_| false);
        assert_eq!(dropped, vec![key(1), key(2)]);
        assert!(cache.contains(&key(3)));

        let dirty = cache.take_dirty();
        assert_eq!(dirty.len(), 1);
        assert!(dirty[0].1.is_some());
        assert_eq!(cache.evict_where(|_| false), vec![key(3)]);
        assert_eq!(cache.resident_count(), 0);
    }

    #[test]
    fn test_evict_walks_most_recent_first() {
        let mut cache = BlockCache::new();
        for id in 1..=4 {
            loaded(&mut cache, id);
        }
        let mut seen = Vec::new();
        let mut budget = 1;
        let dropped = cache.evict_where(|k| {
            seen.push(k.id.0);
            if budget > 0 {
                budget -= 1;
                true
            } else {
                false
            }
        });
        assert_eq!(seen, vec![4, 3, 2, 1]);
        assert_eq!(dropped.len(), 3);
        assert!(cache.contains(&key(4)));
    }

    #[test]
    fn test_deleted_blocks_become_tombstones() {
        let mut cache = BlockCache::new();
        loaded(&mut cache, 7);
        cache.remove_deleted(&key(7));
        assert!(!cache.contains(&key(7)));
        assert!(!cache.discard(&key(7)));
        let dirty = cache.take_dirty();
        assert_eq!(dirty, vec![(key(7), None)]);
    }

    #[test]
    fn test_blocks_being_written_stay_resident() {
        let mut cache = BlockCache::new();
        cache.insert_new(key(1), Block::empty(BlockKind::Header));
        cache.insert_new(key(2), Block::empty(BlockKind::Header));
        let written: Vec<_> = cache.take_dirty().into_iter().map(|(k, _)| k).collect();
        cache.pin(&written);
        cache.pin(&written[..1]);

        assert!(!cache.discard(&key(1)));
        assert!(cache.evict_where(|_| false).is_empty());

        cache.unpin(&written);
        assert_eq!(cache.evict_where(|_| false), vec![key(2)]);
        assert!(cache.contains(&key(1)));
        cache.unpin(&written[..1]);
        assert!(cache.discard(&key(1)));
    }
}

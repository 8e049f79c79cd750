//! The seam to durable storage.
//!
//! A [`BlockStore`] loads individual blocks on demand and accepts batched
//! checkpoints. [`MemoryBlockStore`] keeps everything in memory as checksummed
//! bincode frames, so every load hands back a fresh copy the way a real
//! store would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::accuracy::AccuracyRange;
use crate::block::{Block, BodyBlock, HeaderBlock};
use crate::directory::DirectoryEntry;
use crate::encoding::{bincode, frame};
use crate::error::{Error, Result};
use crate::model::{BlockId, BlockKind, FolderSequences, Timestamp};

/// Folder metadata restored on open and written on every checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedFolder {
    pub folder_id: String,
    pub header_blocks: Vec<DirectoryEntry>,
    pub body_blocks: Vec<DirectoryEntry>,
    pub accuracy_ranges: Vec<AccuracyRange>,
    pub sequences: FolderSequences,
    pub server_id_map: Option<HashMap<String, BlockId>>,
    pub unread_count: i64,
    pub last_synced_at: Option<Timestamp>,
}

impl PersistedFolder {
    pub fn new(folder_id: impl Into<String>) -> Self {
        Self {
            folder_id: folder_id.into(),
            ..Default::default()
        }
    }
}

/// Everything that changed since the previous checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderCheckpoint {
    pub folder: PersistedFolder,
    /// `None` means the block was deleted.
    pub header_blocks: Vec<(BlockId, Option<HeaderBlock>)>,
    pub body_blocks: Vec<(BlockId, Option<BodyBlock>)>,
}

#[async_trait::async_trait]
pub trait BlockStore: Send + Sync {
    async fn load_header_block(&self, folder_id: &str, block_id: BlockId) -> Result<HeaderBlock>;

    async fn load_body_block(&self, folder_id: &str, block_id: BlockId) -> Result<BodyBlock>;

    async fn persist(&self, checkpoint: FolderCheckpoint) -> Result<()>;
}

type StoreKey = (String, BlockKind, BlockId);

#[derive(Default)]
struct MemoryInner {
    blocks: HashMap<StoreKey, Vec<u8>>,
    folders: HashMap<String, PersistedFolder>,
    failing: HashMap<StoreKey, String>,
    failing_persist: Option<String>,
}

/// In-memory block store.
#[derive(Default)]
pub struct MemoryBlockStore {
    inner: Mutex<MemoryInner>,
    loads: AtomicUsize,
    checkpoints: AtomicUsize,
    load_delay: Option<Duration>,
    persist_delay: Option<Duration>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every load, so loads actually suspend.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    pub fn with_persist_delay(mut self, delay: Duration) -> Self {
        self.persist_delay = Some(delay);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put_block(&self, folder_id: &str, block_id: BlockId, block: &Block) -> Result<()> {
        let bytes = frame::encode(&bincode::serialize(block)?)?;
        self.lock()
            .blocks
            .insert((folder_id.to_string(), block.kind(), block_id), bytes);
        Ok(())
    }

    /// Make loads of one block fail until cleared.
    pub fn fail_loads(&self, folder_id: &str, kind: BlockKind, block_id: BlockId, reason: &str) {
        self.lock()
            .failing
            .insert((folder_id.to_string(), kind, block_id), reason.to_string());
    }

    /// Make every checkpoint fail until cleared.
    pub fn fail_persists(&self, reason: &str) {
        self.lock().failing_persist = Some(reason.to_string());
    }

    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.failing.clear();
        inner.failing_persist = None;
    }

    /// Flip a byte of a stored block to simulate on-disk corruption.
    pub fn corrupt(&self, folder_id: &str, kind: BlockKind, block_id: BlockId) {
        if let Some(bytes) = self
            .lock()
            .blocks
            .get_mut(&(folder_id.to_string(), kind, block_id))
        {
            if let Some(byte) = bytes.get_mut(4) {
                *byte ^= 0xFF;
            }
        }
    }

    pub fn folder(&self, folder_id: &str) -> Option<PersistedFolder> {
        self.lock().folders.get(folder_id).cloned()
    }

    pub fn contains_block(&self, folder_id: &str, kind: BlockKind, block_id: BlockId) -> bool {
        self.lock()
            .blocks
            .contains_key(&(folder_id.to_string(), kind, block_id))
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.load(Ordering::SeqCst)
    }

    async fn load(&self, folder_id: &str, kind: BlockKind, block_id: BlockId) -> Result<Block> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.load_delay {
            tokio::time::sleep(delay).await;
        }

        let key = (folder_id.to_string(), kind, block_id);
        let bytes = {
            let inner = self.lock();
            if let Some(reason) = inner.failing.get(&key) {
                return Err(Error::BlockLoad {
                    kind,
                    block_id,
                    reason: reason.clone(),
                });
            }
            inner
                .blocks
                .get(&key)
                .cloned()
                .ok_or(Error::MissingBlock(kind, block_id))?
        };
        let block: Block = bincode::deserialize(&frame::decode(&bytes)?)?;
        if block.kind() != kind {
            return Err(Error::Decode(format!("expected {} block {}", kind, block_id)));
        }
        Ok(block)
    }
}

#[async_trait::async_trait]
impl BlockStore for MemoryBlockStore {
    async fn load_header_block(&self, folder_id: &str, block_id: BlockId) -> Result<HeaderBlock> {
        match self.load(folder_id, BlockKind::Header, block_id).await? {
            Block::Header(block) => Ok(block),
            Block::Body(_) => Err(Error::MissingBlock(BlockKind::Header, block_id)),
        }
    }

    async fn load_body_block(&self, folder_id: &str, block_id: BlockId) -> Result<BodyBlock> {
        match self.load(folder_id, BlockKind::Body, block_id).await? {
            Block::Body(block) => Ok(block),
            Block::Header(_) => Err(Error::MissingBlock(BlockKind::Body, block_id)),
        }
    }

    async fn persist(&self, checkpoint: FolderCheckpoint) -> Result<()> {
        if let Some(delay) = self.persist_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = self.lock().failing_persist.clone() {
            return Err(Error::IoError(std::io::Error::new(std::io::ErrorKind::Other, reason)));
        }
        let folder_id = checkpoint.folder.folder_id.clone();
        let mut encoded = Vec::new();
        for (id, block) in checkpoint.header_blocks {
            let bytes = match block {
                Some(block) => Some(frame::encode(&bincode::serialize(&Block::Header(block))?)?),
                None => None,
            };
            encoded.push(((folder_id.clone(), BlockKind::Header, id), bytes));
        }
        for (id, block) in checkpoint.body_blocks {
            let bytes = match block {
                Some(block) => Some(frame::encode(&bincode::serialize(&Block::Body(block))?)?),
                None => None,
            };
            encoded.push(((folder_id.clone(), BlockKind::Body, id), bytes));
        }

        let mut inner = self.lock();
        for (key, bytes) in encoded {
            match bytes {
                Some(bytes) => inner.blocks.insert(key, bytes),
                None => inner.blocks.remove(&key),
            };
        }
        inner.folders.insert(folder_id, checkpoint.folder);
        self.checkpoints.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

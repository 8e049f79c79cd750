//! Checkpoints and self-checks.

use itertools::Itertools;

use super::{state::FolderState, FolderStore};
use crate::{
    block::Block,
    block_store::FolderCheckpoint,
    cache::BlockKey,
    config::StoreConfig,
    error::{Error, Result},
    model::BlockKind,
};

impl FolderStore {
    /// Everything that changed since the last checkpoint, or `None` when
    /// the folder is clean. Dirtiness is cleared.
    pub fn generate_persistence_info(&self) -> Option<FolderCheckpoint> {
        collect_dirty(&mut self.lock(), self.folder_id())
    }

    /// Hand dirty state to the block store. Returns false if nothing was dirty.
    ///
    /// The written blocks stay resident until the store answers. On failure
    /// they are marked dirty again so the next checkpoint retries them.
    pub async fn checkpoint(&self) -> Result<bool> {
        let (checkpoint, written) = {
            let mut state = self.lock();
            let Some(checkpoint) = collect_dirty(&mut state, self.folder_id()) else {
                return Ok(false);
            };
            let written: Vec<(BlockKey, bool)> = checkpoint
                .header_blocks
                .iter()
                .map(|(id, b)| (BlockKey::header(*id), b.is_some()))
                .chain(
                    checkpoint
                        .body_blocks
                        .iter()
                        .map(|(id, b)| (BlockKey::body(*id), b.is_some())),
                )
                .collect();
            state.cache.pin(written.iter().map(|(key, _)| key));
            (checkpoint, written)
        };

        let result = self.inner.block_store.persist(checkpoint).await;
        let mut state = self.lock();
        state.cache.unpin(written.iter().map(|(key, _)| key));
        match result {
            Ok(()) => {
                tracing::info!(folder = %self.folder_id(), blocks = written.len(), "Folder checkpointed");
                Ok(true)
            }
            Err(e) => {
                tracing::error!(folder = %self.folder_id(), error = %e, "Checkpoint failed");
                state.meta_dirty = true;
                for (key, live) in written {
                    if !live {
                        state.cache.remove_deleted(&key);
                    } else if state.cache.contains(&key) && !state.cache.is_dirty(&key) {
                        state.cache.mark_dirty(key);
                    }
                }
                Err(e)
            }
        }
    }

    /// Check the directories and every resident block against each other.
    pub fn validate_invariants(&self) -> Result<()> {
        let state = self.lock();
        for kind in [BlockKind::Header, BlockKind::Body] {
            check_directory(&state, self.config(), kind)?;
        }
        if let Some(map) = &state.server_ids {
            if let Some((server_id, block_id)) =
                map.iter().find(|(_, id)| state.headers.position_of(**id).is_none())
            {
                return Err(Error::InvariantViolation(format!(
                    "server id {} points at missing header block {}",
                    server_id, block_id
                )));
            }
        }
        Ok(())
    }
}

fn collect_dirty(state: &mut FolderState, folder_id: &str) -> Option<FolderCheckpoint> {
    if state.cache.dirty_count() == 0 && !state.meta_dirty {
        return None;
    }
    state.meta_dirty = false;

    let mut header_blocks = Vec::new();
    let mut body_blocks = Vec::new();
    for (key, block) in state.cache.take_dirty() {
        match block {
            Some(Block::Header(block)) => header_blocks.push((key.id, Some(block))),
            Some(Block::Body(block)) => body_blocks.push((key.id, Some(block))),
            None if key.kind == BlockKind::Header => header_blocks.push((key.id, None)),
            None => body_blocks.push((key.id, None)),
        }
    }
    Some(FolderCheckpoint {
        folder: state.to_persisted(folder_id),
        header_blocks,
        body_blocks,
    })
}

fn check_directory(state: &FolderState, config: &StoreConfig, kind: BlockKind) -> Result<()> {
    let dir = state.directory(kind);
    let violation = |msg: String| Err(Error::InvariantViolation(format!("{} directory: {}", kind, msg)));

    for entry in dir.entries() {
        if entry.start > entry.end {
            return violation(format!("block {} starts after it ends", entry.block_id));
        }
        if entry.count == 0 {
            return violation(format!("block {} is empty", entry.block_id));
        }
    }
    for (newer, older) in dir.entries().iter().tuple_windows() {
        if older.end >= newer.start {
            return violation(format!(
                "blocks {} and {} overlap or are out of order",
                newer.block_id, older.block_id
            ));
        }
    }

    for entry in dir.entries() {
        let Some(block) = state.cache.get(&BlockKey {
            kind,
            id: entry.block_id,
        }) else {
            continue;
        };
        if block.len() != entry.count {
            return violation(format!(
                "block {} holds {} items, entry says {}",
                entry.block_id,
                block.len(),
                entry.count
            ));
        }
        let keys: Vec<_> = (0..block.len()).filter_map(|i| block.key_at(i)).collect();
        if keys.len() != block.len() || keys.iter().tuple_windows().any(|(a, b)| a <= b) {
            return violation(format!("block {} is not strictly newest first", entry.block_id));
        }
        if keys.first() != Some(&entry.end) || keys.last() != Some(&entry.start) {
            return violation(format!("block {} disagrees with its entry bounds", entry.block_id));
        }
        let size: usize = (0..block.len())
            .map(|i| block.item_cost(i, config.header_est_size))
            .sum();
        if size != entry.estimated_size {
            return violation(format!(
                "block {} weighs {}, entry says {}",
                entry.block_id, size, entry.estimated_size
            ));
        }
    }
    Ok(())
}

//! Inserting, splitting and deleting block items.
//!
//! Every public entry point takes a turn on the deferred-call gate, then
//! works through [`FolderStore::with_state`]: a pass first makes sure the
//! block it needs is resident and only then changes anything.

use super::{
    slices::{notify_added, notify_modified, notify_removed},
    state::FolderState,
    store::{block_for, Step},
    FolderStore,
};
use crate::{
    block::Block,
    cache::BlockKey,
    config::StoreConfig,
    directory::DirectoryEntry,
    error::{Error, Result},
    model::{BlockId, BlockKind, BodyRecord, HeaderRecord, MessageId, MessageKey},
};

pub(crate) enum NewItem {
    Header(HeaderRecord),
    Body(MessageId, BodyRecord),
}

impl NewItem {
    fn kind(&self) -> BlockKind {
        match self {
            NewItem::Header(_) => BlockKind::Header,
            NewItem::Body(..) => BlockKind::Body,
        }
    }

    fn key(&self) -> MessageKey {
        match self {
            NewItem::Header(header) => header.key(),
            NewItem::Body(id, body) => MessageKey::new(body.date, *id),
        }
    }

    fn cost(&self, config: &StoreConfig) -> usize {
        match self {
            NewItem::Header(_) => config.header_est_size,
            NewItem::Body(_, body) => body.size,
        }
    }
}

/// Which edge of an entry a new key becomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Edge {
    Inside,
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    NewBlock,
    Existing { index: usize, edge: Edge },
}

pub(crate) enum Removed {
    Missing,
    Header(HeaderRecord),
    Body,
}

/// Choose the block a new item with `key` goes into.
pub(crate) fn plan_insert(
    state: &FolderState,
    config: &StoreConfig,
    kind: BlockKind,
    key: &MessageKey,
    cost: usize,
) -> Step<Placement> {
    let dir = state.directory(kind);
    let (idx, hit) = dir.find_for_key(key);

    let placement = if hit.is_some() {
        Placement::Existing {
            index: idx,
            edge: Edge::Inside,
        }
    } else if dir.is_empty() {
        return Step::Done(Placement::NewBlock);
    } else {
        let len = dir.len();
        let fits = |i: usize| {
            dir.get(i)
                .map_or(false, |e| e.estimated_size + cost < config.max_block_size)
        };
        // The entry at idx is older than the key, the one before it newer.
        let older = Placement::Existing {
            index: idx,
            edge: Edge::End,
        };
        let newer = Placement::Existing {
            index: idx.wrapping_sub(1),
            edge: Edge::Start,
        };
        if idx < len && fits(idx) {
            older
        } else if idx > 0 && fits(idx - 1) {
            newer
        } else if (idx > 0 && idx < len / 2) || idx == len {
            // Both are full; grow the one nearer the middle so the edge
            // blocks don't keep re-splitting.
            newer
        } else {
            older
        }
    };

    if let Placement::Existing { index, .. } = placement {
        if let Some(entry) = dir.get(index) {
            let block_key = BlockKey {
                kind,
                id: entry.block_id,
            };
            if !state.cache.contains(&block_key) {
                return Step::Load(block_key);
            }
        }
    }
    Step::Done(placement)
}

/// Insert `item` where `placement` says and split the block if it overflowed.
/// Returns the block that ends up holding the item.
pub(crate) fn apply_insert(
    state: &mut FolderState,
    config: &StoreConfig,
    folder_id: &str,
    placement: Placement,
    item: NewItem,
) -> Result<BlockId> {
    let kind = item.kind();
    let key = item.key();
    let cost = item.cost(config);

    let index = match placement {
        Placement::NewBlock => {
            let id = issue_block_id(state, config, folder_id, kind);
            state
                .directory_mut(kind)
                .insert(0, DirectoryEntry::new(id, key, key));
            state.cache.insert_new(BlockKey { kind, id }, Block::empty(kind));
            0
        }
        Placement::Existing { index, .. } => index,
    };

    let entry = state
        .directory_mut(kind)
        .get_mut(index)
        .ok_or_else(|| Error::InvariantViolation(format!("no {} entry at {}", kind, index)))?;
    match placement {
        Placement::Existing {
            edge: Edge::Start, ..
        } => entry.start = key,
        Placement::Existing { edge: Edge::End, .. } => entry.end = key,
        _ => {}
    }
    entry.count += 1;
    entry.estimated_size += cost;
    let (block_id, count, size) = (entry.block_id, entry.count, entry.estimated_size);

    let block_key = BlockKey { kind, id: block_id };
    match (state.cache.get_mut(&block_key), item) {
        (Some(Block::Header(block)), NewItem::Header(header)) => {
            if let (Some(map), Some(server_id)) = (state.server_ids.as_mut(), &header.server_id) {
                map.insert(server_id.clone(), block_id);
            }
            block.insert(header);
        }
        (Some(Block::Body(block)), NewItem::Body(id, body)) => {
            block.insert(id, body);
        }
        _ => {
            return Err(Error::InvariantViolation(format!(
                "{} block {} not resident for insert",
                kind, block_id
            )))
        }
    }
    state.cache.mark_dirty(block_key);

    if count > 1 && size >= config.max_block_size {
        return split_block(state, config, folder_id, kind, index, &key);
    }
    Ok(block_id)
}

/// Split the block at directory `index` in two, leaving the newer part in place.
fn split_block(
    state: &mut FolderState,
    config: &StoreConfig,
    folder_id: &str,
    kind: BlockKind,
    index: usize,
    inserted: &MessageKey,
) -> Result<BlockId> {
    let len = state.directory(kind).len();
    let target = if index == 0 {
        config.block_split_small_part
    } else if index + 1 == len {
        config.block_split_large_part
    } else {
        config.block_split_equal_part
    };
    let entry = state
        .directory(kind)
        .get(index)
        .cloned()
        .ok_or_else(|| Error::InvariantViolation(format!("no {} entry at {}", kind, index)))?;
    let block_key = BlockKey {
        kind,
        id: entry.block_id,
    };
    let header_cost = config.header_est_size;
    let new_id = issue_block_id(state, config, folder_id, kind);

    let block = state.cache.get_mut(&block_key).ok_or_else(|| {
        Error::InvariantViolation(format!("{} block {} not resident for split", kind, entry.block_id))
    })?;
    let n = block.len();
    let mut at = n - 1;
    let mut kept_size = 0;
    for i in 0..n - 1 {
        kept_size += block.item_cost(i, header_cost);
        if kept_size >= target {
            at = i + 1;
            break;
        }
    }
    let older = block.split_off(at);
    let newer_size: usize = (0..at).map(|i| block.item_cost(i, header_cost)).sum();
    let older_size: usize = (0..older.len()).map(|i| older.item_cost(i, header_cost)).sum();
    let newer_start = block.key_at(at - 1);
    let older_end = older.key_at(0);
    let (Some(newer_start), Some(older_end)) = (newer_start, older_end) else {
        return Err(Error::InvariantViolation(format!(
            "split of {} block {} left an empty half",
            kind, entry.block_id
        )));
    };

    if let (Some(map), Some(moved)) = (state.server_ids.as_mut(), older.as_header()) {
        for header in &moved.headers {
            if let Some(server_id) = &header.server_id {
                map.insert(server_id.clone(), new_id);
            }
        }
    }

    let older_entry = DirectoryEntry {
        block_id: new_id,
        start: entry.start,
        end: older_end,
        count: older.len(),
        estimated_size: older_size,
    };
    tracing::debug!(
        folder = %folder_id,
        kind = %kind,
        block = %entry.block_id,
        new_block = %new_id,
        kept = at,
        moved = older.len(),
        "Split block"
    );

    let dir = state.directory_mut(kind);
    if let Some(newer) = dir.get_mut(index) {
        newer.start = newer_start;
        newer.count = at;
        newer.estimated_size = newer_size;
    }
    dir.insert(index + 1, older_entry);
    state.cache.insert_new(BlockKey { kind, id: new_id }, older);

    if *inserted <= older_end {
        Ok(new_id)
    } else {
        Ok(entry.block_id)
    }
}

fn issue_block_id(
    state: &mut FolderState,
    config: &StoreConfig,
    folder_id: &str,
    kind: BlockKind,
) -> BlockId {
    let id = state.sequences.issue_block_id(kind);
    state.meta_dirty = true;
    let every = config.purge.every_n_new_body_blocks;
    if kind == BlockKind::Body
        && every > 0
        && state.sequences.next_body_block % every == 0
        && !state.purge_scheduled
    {
        state.purge_scheduled = true;
        tracing::info!(folder = %folder_id, "Message purge scheduled");
    }
    id
}

/// Remove the item with `key` from its block.
///
/// An absent target is logged and reported as `Removed::Missing`; the
/// block store stays the authority and a stale pointer heals on reload.
pub(crate) fn delete_from_block(
    state: &mut FolderState,
    config: &StoreConfig,
    folder_id: &str,
    kind: BlockKind,
    key: &MessageKey,
    missing_ok: bool,
) -> Result<Step<Removed>> {
    let (index, block_id) = match state.directory(kind).find_for_key(key) {
        (i, Some(entry)) => (i, entry.block_id),
        _ => {
            if !missing_ok {
                tracing::error!(folder = %folder_id, kind = %kind, date = key.date, id = key.id, "Bad deletion request");
            }
            return Ok(Step::Done(Removed::Missing));
        }
    };
    let block_key = BlockKey { kind, id: block_id };
    let Some(block) = state.cache.get_mut(&block_key) else {
        return Ok(Step::Load(block_key));
    };

    let header = block.as_header().and_then(|b| b.get(key)).cloned();
    let Some((pos, cost)) = block.remove(key, config.header_est_size) else {
        if !missing_ok {
            tracing::error!(folder = %folder_id, kind = %kind, block = %block_id, date = key.date, id = key.id, "Deletion target missing from its block");
        }
        return Ok(Step::Done(Removed::Missing));
    };
    let remaining = block.len();
    let new_end = if pos == 0 { block.key_at(0) } else { None };
    let new_start = if pos == remaining && pos > 0 {
        block.key_at(pos - 1)
    } else {
        None
    };

    let dir = state.directory_mut(kind);
    let now_empty = match dir.get_mut(index) {
        Some(entry) => {
            entry.count = entry.count.saturating_sub(1);
            entry.estimated_size = entry.estimated_size.saturating_sub(cost);
            if let Some(end) = new_end {
                entry.end = end;
            }
            if let Some(start) = new_start {
                entry.start = start;
            }
            entry.count == 0
        }
        None => false,
    };
    if now_empty {
        dir.remove(index);
        state.cache.remove_deleted(&block_key);
        state.meta_dirty = true;
    } else {
        state.cache.mark_dirty(block_key);
    }

    Ok(Step::Done(match header {
        Some(header) => {
            if let (Some(map), Some(server_id)) = (state.server_ids.as_mut(), &header.server_id) {
                map.remove(server_id);
            }
            Removed::Header(header)
        }
        None => Removed::Body,
    }))
}

impl FolderStore {
    /// Add a header, creating or splitting blocks as needed.
    pub async fn add_header(&self, header: HeaderRecord) -> Result<()> {
        let _turn = self.begin_ordered("add_header").await?;
        self.insert_header(header).await
    }

    pub(crate) async fn insert_header(&self, header: HeaderRecord) -> Result<()> {
        let key = header.key();
        let folder_id = self.folder_id().to_string();
        let mut pending = Some(header);
        self.with_state(|state, config| {
            let placement = match plan_insert(state, config, BlockKind::Header, &key, config.header_est_size) {
                Step::Done(placement) => placement,
                Step::Load(block) => return Ok(Step::Load(block)),
            };
            let header = pending
                .take()
                .ok_or_else(|| Error::InvalidState("header already inserted".into()))?;
            let unread = header.is_unread();
            apply_insert(state, config, &folder_id, placement, NewItem::Header(header.clone()))?;
            if unread {
                state.unread_count += 1;
            }
            state.meta_dirty = true;
            notify_added(state, &header);
            Ok(Step::Done(()))
        })
        .await
    }

    /// Add a body; its size estimate is recomputed here.
    pub async fn add_body(&self, id: MessageId, body: BodyRecord) -> Result<()> {
        let _turn = self.begin_ordered("add_body").await?;
        self.insert_body(id, body).await
    }

    async fn insert_body(&self, id: MessageId, mut body: BodyRecord) -> Result<()> {
        body.size = body.estimate_size();
        let key = MessageKey::new(body.date, id);
        let cost = body.size;
        let folder_id = self.folder_id().to_string();
        let mut pending = Some(body);
        self.with_state(|state, config| {
            let placement = match plan_insert(state, config, BlockKind::Body, &key, cost) {
                Step::Done(placement) => placement,
                Step::Load(block) => return Ok(Step::Load(block)),
            };
            let body = pending
                .take()
                .ok_or_else(|| Error::InvalidState("body already inserted".into()))?;
            apply_insert(state, config, &folder_id, placement, NewItem::Body(id, body))?;
            Ok(Step::Done(()))
        })
        .await
    }

    /// Replace the stored header with the same key. Returns false if absent.
    pub async fn update_header(&self, header: HeaderRecord, part_of_sync: bool) -> Result<bool> {
        let _turn = self.begin_ordered("update_header").await?;
        let key = header.key();
        self.apply_to_header(key, part_of_sync, move |stored| *stored = header)
            .await
    }

    /// Mutate the stored header in place. The closure must keep date and id.
    pub async fn modify_header<F>(&self, key: MessageKey, part_of_sync: bool, f: F) -> Result<bool>
    where
        F: FnOnce(&mut HeaderRecord),
    {
        let _turn = self.begin_ordered("modify_header").await?;
        self.apply_to_header(key, part_of_sync, f).await
    }

    async fn apply_to_header<F>(&self, key: MessageKey, part_of_sync: bool, f: F) -> Result<bool>
    where
        F: FnOnce(&mut HeaderRecord),
    {
        let folder_id = self.folder_id().to_string();
        let mut f = Some(f);
        self.with_state(|state, _| {
            let Some(block_key) = block_for(state, BlockKind::Header, &key) else {
                tracing::warn!(folder = %folder_id, date = key.date, id = key.id, "Update of unknown header");
                return Ok(Step::Done(false));
            };
            let Some(block) = state.cache.get_mut(&block_key) else {
                return Ok(Step::Load(block_key));
            };
            let block = block.as_header_mut().ok_or_else(|| {
                Error::InvariantViolation(format!("block {} is not a header block", block_key))
            })?;
            let Some(pos) = block.position(&key) else {
                tracing::warn!(folder = %folder_id, block = %block_key, date = key.date, id = key.id, "Update target missing from its block");
                return Ok(Step::Done(false));
            };

            let mut updated = block.headers[pos].clone();
            if let Some(f) = f.take() {
                f(&mut updated);
            }
            if updated.key() != key {
                return Err(Error::InvalidOperation(
                    "header update may not change date or id".into(),
                ));
            }
            let Some(previous) = block.replace(updated.clone()) else {
                return Err(Error::InvariantViolation(format!("header vanished from block {}", block_key)));
            };

            state.unread_count += i64::from(updated.is_unread()) - i64::from(previous.is_unread());
            if let Some(map) = state.server_ids.as_mut() {
                if previous.server_id != updated.server_id {
                    if let Some(old) = &previous.server_id {
                        map.remove(old);
                    }
                    if let Some(new) = &updated.server_id {
                        map.insert(new.clone(), block_key.id);
                    }
                }
            }
            state.cache.mark_dirty(block_key);
            state.meta_dirty = true;
            notify_modified(state, &updated, part_of_sync);
            Ok(Step::Done(true))
        })
        .await
    }

    /// Find the key of the header with `server_id` through the mapping.
    async fn locate_by_server_id(&self, server_id: &str) -> Result<Option<MessageKey>> {
        self.with_state(|state, _| {
            let Some(map) = state.server_ids.as_ref() else {
                return Err(Error::InvalidOperation("server id mapping is disabled".into()));
            };
            let Some(&block_id) = map.get(server_id) else {
                return Ok(Step::Done(None));
            };
            // The mapping may point at a block that went away.
            if state.headers.position_of(block_id).is_none() {
                return Ok(Step::Done(None));
            }
            let block_key = BlockKey::header(block_id);
            match state.cache.get(&block_key) {
                None => Ok(Step::Load(block_key)),
                Some(block) => Ok(Step::Done(block.as_header().and_then(|b| {
                    b.headers
                        .iter()
                        .find(|h| h.server_id.as_deref() == Some(server_id))
                        .map(HeaderRecord::key)
                }))),
            }
        })
        .await
    }

    pub async fn has_message_with_server_id(&self, server_id: &str) -> Result<bool> {
        Ok(self.locate_by_server_id(server_id).await?.is_some())
    }

    pub async fn update_header_by_server_id<F>(
        &self,
        server_id: &str,
        part_of_sync: bool,
        f: F,
    ) -> Result<bool>
    where
        F: FnOnce(&mut HeaderRecord),
    {
        let _turn = self.begin_ordered("update_header_by_server_id").await?;
        match self.locate_by_server_id(server_id).await? {
            Some(key) => self.apply_to_header(key, part_of_sync, f).await,
            None => {
                tracing::warn!(folder = %self.folder_id(), server_id, "Update of unknown server id");
                Ok(false)
            }
        }
    }

    pub async fn delete_message_by_server_id(&self, server_id: &str) -> Result<bool> {
        let _turn = self.begin_ordered("delete_message_by_server_id").await?;
        match self.locate_by_server_id(server_id).await? {
            Some(key) => self.remove_message(key).await,
            None => {
                tracing::warn!(folder = %self.folder_id(), server_id, "Deletion of unknown server id");
                Ok(false)
            }
        }
    }

    /// Delete a header and its body. Returns false if the header was absent.
    pub async fn delete_header_and_body(&self, key: MessageKey) -> Result<bool> {
        let _turn = self.begin_ordered("delete_header_and_body").await?;
        self.remove_message(key).await
    }

    /// Remove a header and its body in one pass once both blocks are resident.
    pub(crate) async fn remove_message(&self, key: MessageKey) -> Result<bool> {
        let folder_id = self.folder_id().to_string();
        self.with_state(|state, config| {
            for kind in [BlockKind::Header, BlockKind::Body] {
                if let Some(block) = block_for(state, kind, &key) {
                    if !state.cache.contains(&block) {
                        return Ok(Step::Load(block));
                    }
                }
            }
            let removed = match delete_from_block(state, config, &folder_id, BlockKind::Header, &key, false)? {
                Step::Done(removed) => removed,
                Step::Load(block) => return Ok(Step::Load(block)),
            };
            if let Removed::Header(header) = &removed {
                if header.is_unread() {
                    state.unread_count -= 1;
                }
                state.meta_dirty = true;
                notify_removed(state, &key);
            }
            // Headers without a downloaded body are normal.
            if let Step::Load(block) = delete_from_block(state, config, &folder_id, BlockKind::Body, &key, true)? {
                return Err(Error::InvariantViolation(format!(
                    "{} block {} evicted during delete",
                    block.kind, block.id
                )));
            }
            Ok(Step::Done(matches!(removed, Removed::Header(_))))
        })
        .await
    }

    /// Replace a body, re-estimating its size.
    pub async fn update_body(&self, key: MessageKey, body: BodyRecord) -> Result<()> {
        let _turn = self.begin_ordered("update_body").await?;
        let folder_id = self.folder_id().to_string();
        self.with_state(|state, config| {
            delete_from_block(state, config, &folder_id, BlockKind::Body, &key, false)
        })
        .await?;
        self.insert_body(key.id, body).await
    }

    /// Tell the sync-driving slice a header was seen unchanged on the server.
    pub async fn unchanged_header(&self, header: &HeaderRecord) -> Result<()> {
        let _turn = self.begin_ordered("unchanged_header").await?;
        let target = {
            let state = self.lock();
            state
                .sync_slice
                .and_then(|id| state.slices.iter().find(|s| s.id() == id).cloned())
        };
        if let Some(slice) = target.filter(|s| !s.ignore_headers()) {
            let flush = slice.note_added(header);
            slice.flush_if(flush);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::block::Block;
    use crate::block_store::MemoryBlockStore;
    use crate::cache::BlockKey;
    use crate::config::StoreConfig;
    use crate::error::Result;
    use crate::folder::FolderStore;
    use crate::model::{BlockKind, BodyRecord, MessageKey, SEEN_FLAG};
    use crate::testing::{header, open_store_with, reopen};

    fn small_blocks() -> StoreConfig {
        StoreConfig::new()
            .max_block_size(1000)
            .block_split_parts(333, 500, 666)
            .header_est_size(100)
            .track_server_ids(true)
    }

    async fn all_keys(store: &FolderStore) -> Result<Vec<MessageKey>> {
        Ok(store
            .collect_before_message(None, usize::MAX)
            .await?
            .into_iter()
            .map(|h| h.key())
            .collect())
    }

    #[tokio::test]
    async fn test_hundred_headers_newest_to_oldest() -> Result<()> {
        let (store, _) = open_store_with(small_blocks());
        for i in (1..=100u64).rev() {
            store.add_header(header(i, i as i64 * 1000)).await?;
        }
        store.validate_invariants()?;

        let state = store.lock();
        let counts: Vec<usize> = state.headers.entries().iter().map(|e| e.count).collect();
        assert_eq!(counts.len(), 15);
        assert_eq!(counts[0], 4);
        assert!(counts[1..14].iter().all(|&c| c == 7));
        assert_eq!(counts[14], 5);
        assert!(state
            .headers
            .entries()
            .iter()
            .all(|e| e.estimated_size < 1000));
        drop(state);

        let keys = all_keys(&store).await?;
        assert_eq!(keys.len(), 100);
        assert!(keys.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(store.known_message_count(), 100);
        Ok(())
    }

    #[tokio::test]
    async fn test_split_keeps_every_item_in_order() -> Result<()> {
        let (store, _) = open_store_with(small_blocks());
        // Fill the folder from both ends and then the middle.
        for i in 0..30u64 {
            store.add_header(header(i, 10_000 + i as i64 * 10)).await?;
        }
        for i in 30..60u64 {
            store.add_header(header(i, 10_005 + (i - 30) as i64 * 10)).await?;
        }
        store.validate_invariants()?;

        let keys = all_keys(&store).await?;
        assert_eq!(keys.len(), 60);
        assert!(keys.windows(2).all(|w| w[0] > w[1]));
        for i in 0..60u64 {
            let date = if i < 30 {
                10_000 + i as i64 * 10
            } else {
                10_005 + (i - 30) as i64 * 10
            };
            assert!(store.get_header(MessageKey::new(date, i)).await?.is_some());
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_fixes_edges_and_drops_empty_blocks() -> Result<()> {
        let (store, _) = open_store_with(small_blocks());
        for i in 1..=12u64 {
            store.add_header(header(i, i as i64 * 100)).await?;
        }
        let before = store.lock().headers.len();
        assert!(before >= 2);

        // Newest item: the first entry's end moves down.
        assert!(store.delete_header_and_body(MessageKey::new(1200, 12)).await?);
        assert_eq!(store.lock().headers.first().map(|e| e.end), Some(MessageKey::new(1100, 11)));

        // Oldest item: the last entry's start moves up.
        assert!(store.delete_header_and_body(MessageKey::new(100, 1)).await?);
        assert_eq!(store.lock().headers.last().map(|e| e.start), Some(MessageKey::new(200, 2)));
        store.validate_invariants()?;

        // Absent targets are no-ops.
        assert!(!store.delete_header_and_body(MessageKey::new(100, 1)).await?);

        for i in 2..=11u64 {
            assert!(store.delete_header_and_body(MessageKey::new(i as i64 * 100, i)).await?);
        }
        assert!(store.lock().headers.is_empty());
        assert_eq!(store.known_message_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_bodies_and_unread_count() -> Result<()> {
        let (store, _) = open_store_with(small_blocks());
        let mut read = header(1, 100);
        read.flags.insert(SEEN_FLAG.to_string());
        store.add_header(read).await?;
        store.add_header(header(2, 200)).await?;
        assert_eq!(store.unread_count(), 1);

        store.add_body(2, BodyRecord::new(200)).await?;
        let body = store.get_body(MessageKey::new(200, 2)).await?.unwrap();
        assert_eq!(body.size, BodyRecord::new(200).estimate_size());

        let mut bigger = BodyRecord::new(200);
        bigger.references = vec!["<a@b>".into(); 4];
        store.update_body(MessageKey::new(200, 2), bigger.clone()).await?;
        let body = store.get_body(MessageKey::new(200, 2)).await?.unwrap();
        assert_eq!(body.references, bigger.references);
        assert!(body.size > BodyRecord::new(200).estimate_size());

        // Marking read and deleting both move the counter.
        store
            .modify_header(MessageKey::new(200, 2), false, |h| {
                h.flags.insert(SEEN_FLAG.to_string());
            })
            .await?;
        assert_eq!(store.unread_count(), 0);
        store.add_header(header(3, 300)).await?;
        store.delete_header_and_body(MessageKey::new(300, 3)).await?;
        assert_eq!(store.unread_count(), 0);

        let (h, b) = store.get_message(MessageKey::new(200, 2)).await?;
        assert!(h.is_some() && b.is_some());
        store.delete_header_and_body(MessageKey::new(200, 2)).await?;
        assert!(store.get_body(MessageKey::new(200, 2)).await?.is_none());
        store.validate_invariants()?;
        Ok(())
    }

    #[tokio::test]
    async fn test_header_updates_must_keep_the_key() -> Result<()> {
        let (store, _) = open_store_with(small_blocks());
        store.add_header(header(1, 100)).await?;
        let err = store
            .modify_header(MessageKey::new(100, 1), false, |h| h.date = 5)
            .await;
        assert!(err.is_err());
        assert!(!store
            .update_header(header(9, 900), false)
            .await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_server_id_mapping_follows_splits() -> Result<()> {
        let (store, _) = open_store_with(small_blocks());
        for i in 1..=25u64 {
            let mut h = header(i, i as i64 * 100);
            h.server_id = Some(format!("srv-{}", i));
            store.add_header(h).await?;
        }
        store.validate_invariants()?;
        for i in 1..=25u64 {
            assert!(store.has_message_with_server_id(&format!("srv-{}", i)).await?);
        }
        assert!(!store.has_message_with_server_id("srv-99").await?);

        let changed = store
            .update_header_by_server_id("srv-7", true, |h| h.subject = Some("seven".into()))
            .await?;
        assert!(changed);
        let h = store.get_header(MessageKey::new(700, 7)).await?.unwrap();
        assert_eq!(h.subject.as_deref(), Some("seven"));

        assert!(store.delete_message_by_server_id("srv-7").await?);
        assert!(!store.has_message_with_server_id("srv-7").await?);
        assert!(!store.delete_message_by_server_id("srv-7").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_server_id_calls_need_the_mapping() -> Result<()> {
        let (store, _) = open_store_with(StoreConfig::default());
        assert!(store.has_message_with_server_id("x").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_body_blocks_schedule_purges() -> Result<()> {
        let config = small_blocks().purge(
            crate::config::PurgeConfig::default().every_n_new_body_blocks(2),
        );
        let (store, _) = open_store_with(config);
        let mut big = BodyRecord::new(0);
        big.references = vec!["x".repeat(600)];
        for i in 0..4u64 {
            let mut body = big.clone();
            body.date = i as i64 * 100;
            store.add_body(i, body).await?;
        }
        assert!(store.lock().bodies.len() >= 2);
        assert!(store.purge_scheduled());
        Ok(())
    }

    #[tokio::test]
    async fn test_calls_defer_behind_block_loads() -> Result<()> {
        let block_store = Arc::new(MemoryBlockStore::new().with_load_delay(Duration::from_millis(20)));
        let store = reopen(block_store.clone(), small_blocks(), |store| async move {
            for i in 1..=5u64 {
                store.add_header(header(i, i as i64 * 100)).await?;
            }
            Ok(())
        })
        .await?;
        assert_eq!(store.resident_block_count(), 0);

        // A read starts a load; a write arriving meanwhile waits for it.
        let reader = {
            let store = store.clone();
            tokio::spawn(async move { store.get_header(MessageKey::new(300, 3)).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(store.pending_load_count(), 1);

        let writer = {
            let store = store.clone();
            tokio::spawn(async move { store.add_header(header(6, 600)).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(store.deferred_call_count(), 1);

        assert!(reader.await.unwrap()?.is_some());
        writer.await.unwrap()?;
        assert_eq!(store.deferred_call_count(), 0);
        assert!(store.get_header(MessageKey::new(600, 6)).await?.is_some());
        assert_eq!(block_store.load_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_reads_share_one_load() -> Result<()> {
        let block_store = Arc::new(MemoryBlockStore::new().with_load_delay(Duration::from_millis(10)));
        let store = reopen(block_store.clone(), small_blocks(), |store| async move {
            store.add_header(header(1, 100)).await?;
            store.add_header(header(2, 200)).await
        })
        .await?;
        let loads_before = block_store.load_count();

        let (a, b) = tokio::join!(
            store.get_header(MessageKey::new(100, 1)),
            store.get_header(MessageKey::new(200, 2))
        );
        assert!(a?.is_some() && b?.is_some());
        assert_eq!(block_store.load_count() - loads_before, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_load_failures_reach_every_waiter() -> Result<()> {
        let block_store = Arc::new(MemoryBlockStore::new().with_load_delay(Duration::from_millis(10)));
        let store = reopen(block_store.clone(), small_blocks(), |store| async move {
            store.add_header(header(1, 100)).await
        })
        .await?;
        let block_id = store.lock().headers.first().unwrap().block_id;
        block_store.fail_loads(store.folder_id(), BlockKind::Header, block_id, "disk gone");

        let (a, b) = tokio::join!(
            store.get_header(MessageKey::new(100, 1)),
            store.delete_header_and_body(MessageKey::new(100, 1))
        );
        assert!(a.unwrap_err().is_load_failure());
        assert!(b.unwrap_err().is_load_failure());
        assert_eq!(store.pending_load_count(), 0);

        // Nothing is cached after a failure; a later call retries.
        block_store.clear_failures();
        assert!(store.get_header(MessageKey::new(100, 1)).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_insert_leaves_counters_alone() -> Result<()> {
        let (store, _) = open_store_with(small_blocks());
        store.add_header(header(1, 100)).await?;
        store.checkpoint().await?;
        assert_eq!(store.unread_count(), 1);

        // A header block that holds bodies can't take the insert.
        {
            let mut state = store.lock();
            let id = state.headers.first().unwrap().block_id;
            *state.cache.get_mut(&BlockKey::header(id)).unwrap() = Block::empty(BlockKind::Body);
        }
        assert!(store.add_header(header(2, 150)).await.is_err());
        assert_eq!(store.unread_count(), 1);
        assert!(!store.lock().meta_dirty);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_waits_for_both_blocks() -> Result<()> {
        let block_store = Arc::new(MemoryBlockStore::new());
        let store = reopen(block_store.clone(), small_blocks(), |store| async move {
            store.add_header(header(1, 100)).await?;
            store.add_body(1, BodyRecord::new(100)).await
        })
        .await?;
        let key = MessageKey::new(100, 1);
        let body_block = store.lock().bodies.first().unwrap().block_id;
        block_store.fail_loads(store.folder_id(), BlockKind::Body, body_block, "io");

        let err = store.delete_header_and_body(key).await.unwrap_err();
        assert!(err.is_load_failure());
        assert!(store.get_header(key).await?.is_some());
        assert_eq!(store.unread_count(), 1);

        block_store.clear_failures();
        assert!(store.get_body(key).await?.is_some());
        assert!(store.delete_header_and_body(key).await?);
        assert!(store.get_header(key).await?.is_none());
        assert!(store.get_body(key).await?.is_none());
        assert!(store.lock().bodies.is_empty());
        store.validate_invariants()?;
        Ok(())
    }
}

//! Materialized block contents.
//!
//! Both block kinds keep a newest-first list of message ids. Header blocks
//! carry the records in a parallel list, body blocks in a map keyed by id.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::{BlockKind, BodyRecord, HeaderRecord, MessageId, MessageKey};
use crate::ordered::{bsearch_for_insert, bsearch_maybe_exists};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderBlock {
    pub ids: Vec<MessageId>,
    pub headers: Vec<HeaderRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyBlock {
    pub ids: Vec<MessageId>,
    pub bodies: HashMap<MessageId, BodyRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Block {
    Header(HeaderBlock),
    Body(BodyBlock),
}

impl Block {
    pub fn empty(kind: BlockKind) -> Self {
        match kind {
            BlockKind::Header => Block::Header(HeaderBlock::default()),
            BlockKind::Body => Block::Body(BodyBlock::default()),
        }
    }

    pub fn kind(&self) -> BlockKind {
        match self {
            Block::Header(_) => BlockKind::Header,
            Block::Body(_) => BlockKind::Body,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Block::Header(b) => b.ids.len(),
            Block::Body(b) => b.ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn key_at(&self, index: usize) -> Option<MessageKey> {
        match self {
            Block::Header(b) => b.key_at(index),
            Block::Body(b) => b.key_at(index),
        }
    }

    pub fn position(&self, key: &MessageKey) -> Option<usize> {
        match self {
            Block::Header(b) => b.position(key),
            Block::Body(b) => b.position(key),
        }
    }

    /// Cost of the item at `index` as accounted in the directory.
    pub fn item_cost(&self, index: usize, header_cost: usize) -> usize {
        match self {
            Block::Header(_) => header_cost,
            Block::Body(b) => b.ids.get(index).and_then(|id| b.bodies.get(id)).map_or(0, |body| body.size),
        }
    }

    /// Move every item from `at` on (the older part) into a new block.
    pub fn split_off(&mut self, at: usize) -> Block {
        match self {
            Block::Header(b) => Block::Header(b.split_off(at)),
            Block::Body(b) => Block::Body(b.split_off(at)),
        }
    }

    /// Remove the item with `key`, returning its former index and cost.
    pub fn remove(&mut self, key: &MessageKey, header_cost: usize) -> Option<(usize, usize)> {
        match self {
            Block::Header(b) => b.remove(key).map(|(idx, _)| (idx, header_cost)),
            Block::Body(b) => b.remove(key).map(|(idx, body)| (idx, body.size)),
        }
    }

    pub fn as_header(&self) -> Option<&HeaderBlock> {
        match self {
            Block::Header(b) => Some(b),
            Block::Body(_) => None,
        }
    }

    pub fn as_header_mut(&mut self) -> Option<&mut HeaderBlock> {
        match self {
            Block::Header(b) => Some(b),
            Block::Body(_) => None,
        }
    }

    pub fn as_body(&self) -> Option<&BodyBlock> {
        match self {
            Block::Body(b) => Some(b),
            Block::Header(_) => None,
        }
    }

    pub fn as_body_mut(&mut self) -> Option<&mut BodyBlock> {
        match self {
            Block::Body(b) => Some(b),
            Block::Header(_) => None,
        }
    }
}

impl HeaderBlock {
    pub fn key_at(&self, index: usize) -> Option<MessageKey> {
        self.headers.get(index).map(HeaderRecord::key)
    }

    pub fn position(&self, key: &MessageKey) -> Option<usize> {
        bsearch_maybe_exists(&self.headers, key, HeaderRecord::key)
    }

    pub fn get(&self, key: &MessageKey) -> Option<&HeaderRecord> {
        self.position(key).map(|i| &self.headers[i])
    }

    pub fn insert(&mut self, header: HeaderRecord) -> usize {
        let idx = bsearch_for_insert(&self.headers, &header.key(), HeaderRecord::key);
        self.ids.insert(idx, header.id);
        self.headers.insert(idx, header);
        idx
    }

    pub fn remove(&mut self, key: &MessageKey) -> Option<(usize, HeaderRecord)> {
        let idx = self.position(key)?;
        self.ids.remove(idx);
        Some((idx, self.headers.remove(idx)))
    }

    /// Replace the record with the same key in place.
    pub fn replace(&mut self, header: HeaderRecord) -> Option<HeaderRecord> {
        let idx = self.position(&header.key())?;
        Some(std::mem::replace(&mut self.headers[idx], header))
    }

    pub fn split_off(&mut self, at: usize) -> HeaderBlock {
        HeaderBlock {
            ids: self.ids.split_off(at),
            headers: self.headers.split_off(at),
        }
    }
}

impl BodyBlock {
    pub fn key_at(&self, index: usize) -> Option<MessageKey> {
        let id = *self.ids.get(index)?;
        self.bodies.get(&id).map(|b| MessageKey::new(b.date, id))
    }

    pub fn position(&self, key: &MessageKey) -> Option<usize> {
        let idx = self.ids.iter().position(|id| *id == key.id)?;
        match self.bodies.get(&key.id) {
            Some(body) if body.date == key.date => Some(idx),
            _ => None,
        }
    }

    pub fn get(&self, id: MessageId) -> Option<&BodyRecord> {
        self.bodies.get(&id)
    }

    pub fn insert(&mut self, id: MessageId, body: BodyRecord) -> usize {
        let key = MessageKey::new(body.date, id);
        let bodies = &self.bodies;
        let idx = self.ids.partition_point(|other| {
            bodies
                .get(other)
                .map_or(false, |b| MessageKey::new(b.date, *other) > key)
        });
        self.ids.insert(idx, id);
        self.bodies.insert(id, body);
        idx
    }

    pub fn remove(&mut self, key: &MessageKey) -> Option<(usize, BodyRecord)> {
        let idx = self.position(key)?;
        self.ids.remove(idx);
        self.bodies.remove(&key.id).map(|body| (idx, body))
    }

    pub fn split_off(&mut self, at: usize) -> BodyBlock {
        let ids = self.ids.split_off(at);
        let bodies = ids
            .iter()
            .filter_map(|id| self.bodies.remove(id).map(|b| (*id, b)))
            .collect();
        BodyBlock { ids, bodies }
    }
}

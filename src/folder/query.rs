//! Range queries over the header blocks.
//!
//! All three traversals have the same shape: find a starting directory
//! entry, make its block resident, take what the quota allows from the
//! cursor position, then move on to the neighbouring entry. Each step hands
//! the caller one batch plus whether more batches follow; only the final
//! batch carries `false`.
//!
//! The cursor is a key rather than an index, so a traversal stays correct
//! even if blocks were split or dropped between two of its steps.

use super::{store::Step, FolderStore};
use crate::{
    cache::BlockKey,
    error::{Error, Result},
    model::{HeaderRecord, MessageKey, Timestamp},
    ordered::bsearch_for_insert,
};

/// One step of a traversal.
struct Batch {
    headers: Vec<HeaderRecord>,
    more: bool,
}

impl Batch {
    fn last() -> Self {
        Self {
            headers: Vec::new(),
            more: false,
        }
    }
}

/// Where a pastwards walk continues.
#[derive(Clone, Copy)]
struct Pastwards {
    /// Only keys strictly older than this; `None` starts at the newest.
    below: Option<MessageKey>,
    /// Dates before this end the walk.
    floor: Option<Timestamp>,
    /// Keep crossing into older blocks until this many were produced.
    min_left: usize,
    /// Never produce more than this.
    max_left: usize,
}

impl FolderStore {
    /// Headers dated in `[start, end)`, newest first. `end == None` means
    /// no upper bound.
    ///
    /// Blocks keep being loaded until `min` headers were produced; a block
    /// already resident gives up to `max`. Both default to the
    /// too-many-messages limit.
    pub async fn messages_in_date_range<F>(
        &self,
        start: Timestamp,
        end: Option<Timestamp>,
        min: Option<usize>,
        max: Option<usize>,
        on_batch: F,
    ) -> Result<()>
    where
        F: FnMut(Vec<HeaderRecord>, bool),
    {
        if let Some(end) = end {
            if start > end {
                return Err(Error::InvalidRange { start, end });
            }
        }
        let _turn = self.begin_ordered("messages_in_date_range").await?;
        let limit = self.config().slice.too_many_messages;
        let cursor = Pastwards {
            // Id 0 sorts first within a date, so this excludes exactly `end`.
            below: end.map(|end| MessageKey::new(end, 0)),
            floor: Some(start),
            min_left: min.unwrap_or(limit),
            max_left: max.unwrap_or(limit),
        };
        self.walk_pastwards(cursor, on_batch).await
    }

    /// Up to `limit` headers older than `anchor`, newest first.
    ///
    /// An anchor that no longer exists is treated as its insertion point;
    /// `None` starts from the newest header, inclusive.
    pub async fn messages_before_message<F>(
        &self,
        anchor: Option<MessageKey>,
        limit: usize,
        on_batch: F,
    ) -> Result<()>
    where
        F: FnMut(Vec<HeaderRecord>, bool),
    {
        let _turn = self.begin_ordered("messages_before_message").await?;
        let cursor = Pastwards {
            below: anchor,
            floor: None,
            min_left: limit,
            max_left: limit,
        };
        self.walk_pastwards(cursor, on_batch).await
    }

    /// Up to `limit` headers newer than `anchor`. Batches come nearest
    /// first, each ordered newest first.
    ///
    /// An anchor that no longer exists is treated as its insertion point;
    /// `None` starts from the oldest header, inclusive.
    pub async fn messages_after_message<F>(
        &self,
        anchor: Option<MessageKey>,
        limit: usize,
        mut on_batch: F,
    ) -> Result<()>
    where
        F: FnMut(Vec<HeaderRecord>, bool),
    {
        let _turn = self.begin_ordered("messages_after_message").await?;
        let mut above = anchor;
        let mut left = limit;
        loop {
            let batch = self
                .with_state(|state, _| {
                    if left == 0 {
                        return Ok(Step::Done(Batch::last()));
                    }
                    let dir = &state.headers;
                    let index = match above {
                        None => dir.len().checked_sub(1),
                        Some(key) => match dir.find_for_key(&key) {
                            (i, Some(entry)) if entry.end > key => Some(i),
                            (i, _) => i.checked_sub(1),
                        },
                    };
                    let Some((index, entry)) = index.and_then(|i| dir.get(i).map(|e| (i, e))) else {
                        return Ok(Step::Done(Batch::last()));
                    };
                    let block_key = BlockKey::header(entry.block_id);
                    let Some(block) = state.cache.get(&block_key) else {
                        return Ok(Step::Load(block_key));
                    };
                    let Some(block) = block.as_header() else {
                        return Err(Error::InvariantViolation(format!(
                            "block {} is not a header block",
                            block_key
                        )));
                    };

                    let upto = match above {
                        Some(key) => block.headers.partition_point(|h| h.key() > key),
                        None => block.headers.len(),
                    };
                    let take = upto.min(left);
                    let headers = block.headers[upto - take..upto].to_vec();
                    left -= take;
                    if let Some(first) = headers.first() {
                        above = Some(first.key());
                    } else {
                        // Nothing newer here; step over the whole entry.
                        above = Some(entry.end);
                    }
                    Ok(Step::Done(Batch {
                        more: left > 0 && index > 0,
                        headers,
                    }))
                })
                .await?;
            let more = batch.more;
            on_batch(batch.headers, more);
            if !more {
                return Ok(());
            }
        }
    }

    async fn walk_pastwards<F>(&self, mut cursor: Pastwards, mut on_batch: F) -> Result<()>
    where
        F: FnMut(Vec<HeaderRecord>, bool),
    {
        loop {
            let batch = self
                .with_state(|state, _| {
                    if cursor.max_left == 0 || cursor.min_left == 0 {
                        return Ok(Step::Done(Batch::last()));
                    }
                    let dir = &state.headers;
                    let index = match cursor.below {
                        None => 0,
                        Some(key) => match dir.find_for_key(&key) {
                            (i, Some(entry)) if entry.start < key => i,
                            (i, Some(_)) => i + 1,
                            (i, None) => i,
                        },
                    };
                    let Some(entry) = dir.get(index) else {
                        return Ok(Step::Done(Batch::last()));
                    };
                    if cursor.floor.map_or(false, |floor| entry.end.date < floor) {
                        return Ok(Step::Done(Batch::last()));
                    }
                    let block_key = BlockKey::header(entry.block_id);
                    let Some(block) = state.cache.get(&block_key) else {
                        return Ok(Step::Load(block_key));
                    };
                    let Some(block) = block.as_header() else {
                        return Err(Error::InvariantViolation(format!(
                            "block {} is not a header block",
                            block_key
                        )));
                    };

                    let from = match cursor.below {
                        Some(key) => {
                            let at = bsearch_for_insert(&block.headers, &key, HeaderRecord::key);
                            if block.headers.get(at).map(HeaderRecord::key) == Some(key) {
                                at + 1
                            } else {
                                at
                            }
                        }
                        None => 0,
                    };
                    let available = &block.headers[from.min(block.headers.len())..];
                    let in_range = match cursor.floor {
                        Some(floor) => available.partition_point(|h| h.date >= floor),
                        None => available.len(),
                    };
                    let take = in_range.min(cursor.max_left);
                    let headers = available[..take].to_vec();
                    cursor.max_left -= take;
                    // Stopping inside the block means the range or the cap ended.
                    let exhausted_block = take == available.len();
                    cursor.min_left = if exhausted_block {
                        cursor.min_left.saturating_sub(take)
                    } else {
                        0
                    };
                    cursor.below = Some(headers.last().map_or(entry.start, HeaderRecord::key));

                    let next_in_range = dir.get(index + 1).map_or(false, |next| {
                        cursor.floor.map_or(true, |floor| next.end.date >= floor)
                    });
                    Ok(Step::Done(Batch {
                        more: cursor.min_left > 0 && cursor.max_left > 0 && next_in_range,
                        headers,
                    }))
                })
                .await?;
            let more = batch.more;
            on_batch(batch.headers, more);
            if !more {
                return Ok(());
            }
        }
    }

    /// Every header in `[start, end)`, newest first.
    pub async fn collect_in_date_range(
        &self,
        start: Timestamp,
        end: Option<Timestamp>,
    ) -> Result<Vec<HeaderRecord>> {
        let mut all = Vec::new();
        self.messages_in_date_range(start, end, None, None, |batch, _| all.extend(batch))
            .await?;
        Ok(all)
    }

    pub async fn collect_before_message(
        &self,
        anchor: Option<MessageKey>,
        limit: usize,
    ) -> Result<Vec<HeaderRecord>> {
        let mut all = Vec::new();
        self.messages_before_message(anchor, limit, |batch, _| all.extend(batch))
            .await?;
        Ok(all)
    }

    /// Up to `limit` headers newer than `anchor`, newest first.
    pub async fn collect_after_message(
        &self,
        anchor: Option<MessageKey>,
        limit: usize,
    ) -> Result<Vec<HeaderRecord>> {
        let mut all: Vec<HeaderRecord> = Vec::new();
        self.messages_after_message(anchor, limit, |mut batch, _| {
            batch.append(&mut all);
            all = batch;
        })
        .await?;
        Ok(all)
    }
}

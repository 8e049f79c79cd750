//! Records the folder store keeps: headers, bodies, and the ids that name them.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Milliseconds since the unix epoch.
pub type Timestamp = i64;

/// Folder-local message id, issued in increasing order.
pub type MessageId = u64;

pub const SEEN_FLAG: &str = "\\Seen";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockKind {
    Header,
    Body,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockKind::Header => write!(f, "header"),
            BlockKind::Body => write!(f, "body"),
        }
    }
}

/// Composite (date, id) key.
///
/// `Ord` is the natural ascending order: a larger key is newer. Blocks,
/// directories and slices all store items newest first, i.e. descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub date: Timestamp,
    pub id: MessageId,
}

impl MessageKey {
    pub fn new(date: Timestamp, id: MessageId) -> Self {
        Self { date, id }
    }
}

impl Ord for MessageKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.date.cmp(&other.date).then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for MessageKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Stable folder-qualified message name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Suid {
    pub folder_id: String,
    pub id: MessageId,
}

impl Suid {
    pub fn new(folder_id: impl Into<String>, id: MessageId) -> Self {
        Self {
            folder_id: folder_id.into(),
            id,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let (folder, id) = s
            .rsplit_once('/')
            .ok_or_else(|| Error::InvalidSuid(s.to_string()))?;
        let id = id
            .parse::<MessageId>()
            .map_err(|_| Error::InvalidSuid(s.to_string()))?;
        if folder.is_empty() {
            return Err(Error::InvalidSuid(s.to_string()));
        }
        Ok(Self::new(folder, id))
    }
}

impl fmt::Display for Suid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.folder_id, self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: Option<String>,
    pub address: String,
}

impl Address {
    pub fn new(name: Option<&str>, address: &str) -> Self {
        Self {
            name: name.map(str::to_string),
            address: address.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Snippet {
    Absent,
    Empty,
    Populated(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRecord {
    pub id: MessageId,
    pub server_id: Option<String>,
    pub suid: Suid,
    pub guid: Option<String>,
    pub author: Address,
    pub recipients: Vec<Address>,
    pub date: Timestamp,
    pub flags: BTreeSet<String>,
    pub has_attachments: bool,
    pub subject: Option<String>,
    pub snippet: Snippet,
}

impl HeaderRecord {
    /// A bare header; callers fill in the rest through the public fields.
    pub fn new(folder_id: &str, id: MessageId, date: Timestamp) -> Self {
        Self {
            id,
            server_id: None,
            suid: Suid::new(folder_id, id),
            guid: None,
            author: Address::default(),
            recipients: Vec::new(),
            date,
            flags: BTreeSet::new(),
            has_attachments: false,
            subject: None,
            snippet: Snippet::Absent,
        }
    }

    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.date, self.id)
    }

    pub fn is_unread(&self) -> bool {
        !self.flags.contains(SEEN_FLAG)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub size_estimate: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyRepType {
    Plain,
    Html,
}

/// One displayable representation of a message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyRep {
    pub rep_type: BodyRepType,
    pub part_id: String,
    pub size_estimate: u64,
    pub amount_downloaded: u64,
    pub is_downloaded: bool,
    /// Plain text content as (kind, text) chunks; html content is tracked by size only.
    pub content: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyRecord {
    pub date: Timestamp,
    /// Estimated byte cost, recomputed whenever the body is stored.
    pub size: usize,
    pub to: Option<Vec<Address>>,
    pub cc: Option<Vec<Address>>,
    pub bcc: Option<Vec<Address>>,
    pub reply_to: Option<String>,
    pub attachments: Vec<Attachment>,
    pub related_parts: Vec<Attachment>,
    pub references: Vec<String>,
    pub body_reps: Vec<BodyRep>,
}

const OBJ_OVERHEAD: usize = 2;
const STR_ATTR_OVERHEAD: usize = 5;
const NUM_ATTR_OVERHEAD: usize = 10;
const LIST_ATTR_OVERHEAD: usize = 4;
const NULL_ATTR_OVERHEAD: usize = 2;
const LIST_OVERHEAD: usize = 4;
const NUM_OVERHEAD: usize = 8;
const STR_OVERHEAD: usize = 4;

impl BodyRecord {
    pub fn new(date: Timestamp) -> Self {
        Self {
            date,
            size: 0,
            to: None,
            cc: None,
            bcc: None,
            reply_to: None,
            attachments: Vec::new(),
            related_parts: Vec::new(),
            references: Vec::new(),
            body_reps: Vec::new(),
        }
    }

    /// Rough persisted size, assuming one byte per character.
    pub fn estimate_size(&self) -> usize {
        let mut est = OBJ_OVERHEAD + NUM_ATTR_OVERHEAD + 4 * NULL_ATTR_OVERHEAD;

        for addrs in [&self.to, &self.cc, &self.bcc].into_iter().flatten() {
            est += LIST_ATTR_OVERHEAD;
            est += addrs
                .iter()
                .map(|a| {
                    OBJ_OVERHEAD
                        + 2 * STR_ATTR_OVERHEAD
                        + a.name.as_ref().map_or(0, String::len)
                        + a.address.len()
                })
                .sum::<usize>();
        }
        if let Some(reply_to) = &self.reply_to {
            est += STR_ATTR_OVERHEAD + reply_to.len();
        }
        for atts in [&self.attachments, &self.related_parts] {
            est += LIST_ATTR_OVERHEAD;
            est += atts
                .iter()
                .map(|a| {
                    OBJ_OVERHEAD
                        + 2 * STR_ATTR_OVERHEAD
                        + a.name.len()
                        + a.mime_type.len()
                        + NUM_ATTR_OVERHEAD
                })
                .sum::<usize>();
        }
        est += LIST_OVERHEAD;
        est += self
            .references
            .iter()
            .map(|r| STR_ATTR_OVERHEAD + r.len())
            .sum::<usize>();

        est += STR_OVERHEAD * (self.body_reps.len() / 2);
        for rep in &self.body_reps {
            match rep.rep_type {
                BodyRepType::Html => est += STR_OVERHEAD + rep.amount_downloaded as usize,
                BodyRepType::Plain if !rep.content.is_empty() => {
                    est += LIST_OVERHEAD + (NUM_OVERHEAD + STR_OVERHEAD) * rep.content.len();
                    est += rep.content.iter().map(|(_, text)| text.len()).sum::<usize>();
                }
                BodyRepType::Plain => {}
            }
        }
        est
    }

    /// True when every body rep has been fully downloaded.
    pub fn reps_downloaded(&self) -> bool {
        self.body_reps.iter().all(|rep| rep.is_downloaded)
    }
}

/// Per-folder id generators. Persisted with the folder and restored on open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderSequences {
    pub next_id: MessageId,
    pub next_header_block: u64,
    pub next_body_block: u64,
}

impl FolderSequences {
    pub fn issue_message_id(&mut self) -> MessageId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn issue_block_id(&mut self, kind: BlockKind) -> BlockId {
        let next = match kind {
            BlockKind::Header => &mut self.next_header_block,
            BlockKind::Body => &mut self.next_body_block,
        };
        let id = BlockId(*next);
        *next += 1;
        id
    }
}

use std::io;

use crate::model::{BlockId, BlockKind};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    /// The block store could not produce a block. Every waiter of the load sees this.
    BlockLoad {
        kind: BlockKind,
        block_id: BlockId,
        reason: String,
    },
    MissingBlock(BlockKind, BlockId),
    ChecksumMismatch,
    Encode(String),
    Decode(String),
    InvalidRange { start: i64, end: i64 },
    InvalidSuid(String),
    SliceDetached,
    InvariantViolation(String),
    InvalidState(String),
    InvalidOperation(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::BlockLoad {
                kind,
                block_id,
                reason,
            } => write!(f, "Failed to load {} block {}: {}", kind, block_id, reason),
            Error::MissingBlock(kind, id) => write!(f, "No such {} block: {}", kind, id),
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::Encode(msg) => write!(f, "Failed to encode: {}", msg),
            Error::Decode(msg) => write!(f, "Failed to decode: {}", msg),
            Error::InvalidRange { start, end } => {
                write!(f, "Invalid time range: start {} is after end {}", start, end)
            }
            Error::InvalidSuid(s) => write!(f, "Invalid suid: {}", s),
            Error::SliceDetached => write!(f, "Slice is detached"),
            Error::InvariantViolation(msg) => write!(f, "Invariant violation: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Whether this error came out of the block store.
    pub fn is_load_failure(&self) -> bool {
        matches!(self, Error::BlockLoad { .. } | Error::MissingBlock(..))
    }
}

//! Serialization helpers for block payloads handed to a block store.

pub mod bincode;
pub mod frame;

/// Why a stored payload could not be turned back into a block.
#[derive(Debug)]
pub enum EncodingError {
    Malformed(String),
    Truncated,
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::Malformed(msg) => write!(f, "malformed block payload: {}", msg),
            EncodingError::Truncated => write!(f, "block payload truncated"),
        }
    }
}

impl std::error::Error for EncodingError {}

impl From<EncodingError> for crate::Error {
    fn from(err: EncodingError) -> Self {
        crate::Error::Decode(err.to_string())
    }
}

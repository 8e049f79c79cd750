use super::EncodingError;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Serialize a value using bincode
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Encode(e.to_string()))
}

/// Deserialize a value from a byte slice using bincode
pub fn deserialize<T: for<'a> Deserialize<'a>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| {
        if e.to_string().contains("UnexpectedEof") {
            EncodingError::Truncated.into()
        } else {
            EncodingError::Malformed(format!("Deserialization failed: {}", e)).into()
        }
    })
}

//! Checksummed frames.
//!
//! ```text
//! |length:u32 | payload |crc32:u32|
//! ```

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use super::EncodingError;
use crate::error::{Error, Result};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub fn encode(payload: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(payload.len() + 8);
    buf.write_u32::<BigEndian>(payload.len() as u32)?;
    buf.extend_from_slice(payload);
    buf.write_u32::<BigEndian>(CRC32.checksum(payload))?;
    Ok(buf)
}

pub fn decode(frame: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(frame);
    let len = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| Error::from(EncodingError::Truncated))? as usize;
    let mut payload = vec![0u8; len];
    cursor
        .read_exact(&mut payload)
        .map_err(|_| Error::from(EncodingError::Truncated))?;
    let checksum = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| Error::from(EncodingError::Truncated))?;
    if CRC32.checksum(&payload) != checksum {
        return Err(Error::ChecksumMismatch);
    }
    Ok(payload)
}

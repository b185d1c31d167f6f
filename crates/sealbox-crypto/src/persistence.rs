//! Framing for everything written to the persistent store.
//!
//! Records are postcard-encoded and wrapped in a small header plus a
//! SHA-256 trailer, so a torn or foreign file is rejected on load instead of
//! being deserialized into plausible-looking key material.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

const MAGIC: &[u8; 4] = b"SBOX";
const VERSION: u8 = 0x01;
const DIGEST_LEN: usize = 32;
const HEADER_LEN: usize = 4 + 1 + 1 + 4; // 10 bytes

/// What a record holds. Stored in the header so one kind is never
/// mistaken for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Identity = 0x01,
    PreKey = 0x02,
    Session = 0x03,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record too short")]
    TooShort,
    #[error("invalid record format (expected SBOX header)")]
    BadMagic,
    #[error("unsupported record version {0}")]
    UnsupportedVersion(u8),
    #[error("expected record kind {expected:?}, found 0x{found:02x}")]
    WrongKind { expected: RecordKind, found: u8 },
    #[error("record truncated")]
    Truncated,
    #[error("record checksum mismatch")]
    ChecksumMismatch,
    #[error("deserialization failed: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Serialize `value` into a framed record.
///
/// Format: [SBOX magic(4)] [version(1)] [kind(1)] [length(4)] [postcard payload] [sha256(32)]
pub fn encode_record<T: Serialize>(kind: RecordKind, value: &T) -> Result<Vec<u8>, RecordError> {
    let payload = postcard::to_allocvec(value)?;

    let mut data = Vec::with_capacity(HEADER_LEN + payload.len() + DIGEST_LEN);
    data.extend_from_slice(MAGIC);
    data.push(VERSION);
    data.push(kind as u8);
    data.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    data.extend_from_slice(&payload);

    let digest = Sha256::digest(&data);
    data.extend_from_slice(&digest);
    Ok(data)
}

/// Check framing and digest, then deserialize the payload.
pub fn decode_record<T: DeserializeOwned>(kind: RecordKind, data: &[u8]) -> Result<T, RecordError> {
    if data.len() < HEADER_LEN + DIGEST_LEN {
        return Err(RecordError::TooShort);
    }
    if &data[0..4] != MAGIC {
        return Err(RecordError::BadMagic);
    }
    if data[4] != VERSION {
        return Err(RecordError::UnsupportedVersion(data[4]));
    }
    if data[5] != kind as u8 {
        return Err(RecordError::WrongKind {
            expected: kind,
            found: data[5],
        });
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&data[6..10]);
    let payload_len = u32::from_be_bytes(len_bytes) as usize;
    if data.len() != HEADER_LEN + payload_len + DIGEST_LEN {
        return Err(RecordError::Truncated);
    }

    let body_end = HEADER_LEN + payload_len;
    let digest = Sha256::digest(&data[..body_end]);
    if digest.as_slice() != &data[body_end..] {
        return Err(RecordError::ChecksumMismatch);
    }

    Ok(postcard::from_bytes(&data[HEADER_LEN..body_end])?)
}

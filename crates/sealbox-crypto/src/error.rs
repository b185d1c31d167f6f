use sealbox_protocol::ProtocolError;
use thiserror::Error;

/// Every failure the core reports. No variant is ever retried internally.
#[derive(Debug, Error)]
pub enum Error {
    /// The storage medium failed; the caller may retry.
    #[error("storage I/O error: {0}")]
    StorageIo(#[from] std::io::Error),

    /// Persisted bytes for `key` could not be read back.
    #[error("corrupt record {key}: {reason}")]
    StorageCorrupt { key: String, reason: String },

    /// A bundle or envelope is malformed.
    #[error("decode error: {0}")]
    Decode(#[from] ProtocolError),

    /// A primitive failed or a ciphertext did not authenticate.
    #[error("crypto error: {0}")]
    Crypto(&'static str),

    /// Key agreement produced an unusable result.
    #[error("key agreement failed: {0}")]
    Proto(&'static str),

    #[error("duplicate message")]
    DuplicateMessage,

    /// The key needed for this message is gone (evicted, or its pre-key was consumed).
    #[error("outdated message")]
    OutdatedMessage,

    /// Decrypting would require skipping more message keys than allowed.
    #[error("message too far in the future")]
    TooDistantFuture,

    /// Well-formed, but not decryptable by this session.
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    #[error("remote identity changed")]
    RemoteIdentityChanged,

    #[error("identity error: {0}")]
    IdentityError(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("session is closed")]
    SessionClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn corrupt(key: &str, reason: impl ToString) -> Self {
        Error::StorageCorrupt {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Replays and evicted keys, which callers usually log as security events.
    pub fn is_replay(&self) -> bool {
        matches!(self, Error::DuplicateMessage | Error::OutdatedMessage)
    }
}

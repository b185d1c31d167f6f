use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message too short: expected at least {expected} bytes, got {got}")]
    TooShort { expected: usize, got: usize },

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("ciphertext too large: {0} bytes")]
    CiphertextTooLarge(usize),

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

//! Sealbox wire formats.
//!
//! Byte layouts for everything that leaves a device: the pre-key bundle a
//! peer publishes and the envelopes that carry ratchet messages. Layouts are
//! hand-written big-endian so they stay stable across releases and across
//! processes.

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;

pub use codec::{decode_bundle, decode_envelope, encode_bundle, encode_envelope};
pub use error::ProtocolError;
pub use messages::{
    cipher_prologue, prekey_prologue, CipherMessage, Envelope, MessageHeader, PreKeyBundle, PreKeyMessage,
};
pub use types::{PreKeyId, LAST_RESORT_PREKEY_ID, PROTOCOL_VERSION};

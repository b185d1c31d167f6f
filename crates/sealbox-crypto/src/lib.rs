//! Sealbox session core: identities, pre-keys and ratcheting sessions.
//!
//! This crate provides:
//! - Identity key management (X25519)
//! - One-time and last-resort pre-keys, published as bundles
//! - Asynchronous session establishment from a bundle or a first message
//! - A double ratchet with bounded out-of-order delivery
//! - A session registry with at most one live instance per identifier
//! - Durable, checksummed persistence of all of the above

pub mod config;
pub mod cryptobox;
pub mod error;
pub mod fingerprint;
pub mod identity;
pub mod persistence;
pub mod prekey;
pub mod primitives;
pub mod ratchet;
pub mod registry;
pub mod session;
pub mod storage;

// Re-export key types for convenience
pub use config::BoxConfig;
pub use cryptobox::{CryptoBox, ImportMode};
pub use error::{Error, Result};
pub use fingerprint::{fingerprint_from_bundle, Fingerprint};
pub use identity::{IdentityKeyPair, SerializableIdentityKeyPair};
pub use prekey::{INITIAL_PREKEY_COUNT, PREKEY_REPLENISH_THRESHOLD};
pub use registry::{validate_session_id, CryptoSession, MAX_SESSION_ID_LEN};
pub use session::{Session, SessionStatus};
pub use storage::{FileStorage, MemoryStorage, Storage};

pub use sealbox_protocol::{PreKeyBundle, PreKeyId, LAST_RESORT_PREKEY_ID};

//! Long-term identity key generation and serialization.
//!
//! Each store has exactly one X25519 identity key pair, generated the first
//! time the store is opened (or imported) and shared read-only by all of its
//! sessions.

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use sealbox_protocol::types::PUBLIC_KEY_LEN;

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::persistence::{decode_record, encode_record, RecordKind};
use crate::primitives::{KeyPair, KEY_LEN};

/// Serializable form of an identity, as persisted and as exported.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SerializableIdentityKeyPair {
    /// 32-byte X25519 public key.
    pub public_key: [u8; PUBLIC_KEY_LEN],
    /// 32-byte X25519 private key.
    pub private_key: [u8; KEY_LEN],
}

impl SerializableIdentityKeyPair {
    /// Convert to a live identity, checking that both halves belong together.
    pub fn to_identity_key_pair(&self) -> Result<IdentityKeyPair> {
        let key_pair = KeyPair::from_secret_bytes(self.private_key);
        if key_pair.public_bytes() != self.public_key {
            return Err(Error::IdentityError(
                "public key does not match private key".into(),
            ));
        }
        Ok(IdentityKeyPair { key_pair })
    }

    pub fn from_identity_key_pair(pair: &IdentityKeyPair) -> Self {
        Self {
            public_key: pair.public_key(),
            private_key: pair.key_pair.secret_bytes(),
        }
    }
}

/// A device's long-term key pair.
#[derive(Clone, Debug)]
pub struct IdentityKeyPair {
    key_pair: KeyPair,
}

impl IdentityKeyPair {
    /// Generate a fresh identity key pair.
    pub fn generate() -> Self {
        Self {
            key_pair: KeyPair::generate(),
        }
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.key_pair.public_bytes()
    }

    pub(crate) fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_public_key(&self.public_key())
    }

    /// Full export, private half included. The caller owns the secrecy of
    /// the returned bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode_record(
            RecordKind::Identity,
            &SerializableIdentityKeyPair::from_identity_key_pair(self),
        )
        .map_err(|e| Error::IdentityError(e.to_string()))
    }

    /// Parse bytes produced by [`IdentityKeyPair::to_bytes`].
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let serializable: SerializableIdentityKeyPair = decode_record(RecordKind::Identity, data)
            .map_err(|e| Error::IdentityError(e.to_string()))?;
        serializable.to_identity_key_pair()
    }

    /// Constant-time comparison of the private halves.
    pub fn same_as(&self, other: &IdentityKeyPair) -> bool {
        let mut ours = self.key_pair.secret_bytes();
        let mut theirs = other.key_pair.secret_bytes();
        let equal: bool = ours[..].ct_eq(&theirs[..]).into();
        ours.zeroize();
        theirs.zeroize();
        equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_roundtrip() {
        let pair = IdentityKeyPair::generate();
        let bytes = pair.to_bytes().unwrap();
        let restored = IdentityKeyPair::from_bytes(&bytes).unwrap();
        assert_eq!(pair.public_key(), restored.public_key());
        assert!(pair.same_as(&restored));
    }

    #[test]
    fn distinct_identities_differ() {
        let a = IdentityKeyPair::generate();
        let b = IdentityKeyPair::generate();
        assert!(!a.same_as(&b));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn mismatched_halves_rejected() {
        let a = IdentityKeyPair::generate();
        let b = IdentityKeyPair::generate();
        let mut serializable = SerializableIdentityKeyPair::from_identity_key_pair(&a);
        serializable.public_key = b.public_key();
        assert!(matches!(
            serializable.to_identity_key_pair(),
            Err(Error::IdentityError(_))
        ));
    }

    #[test]
    fn malformed_bytes_rejected() {
        assert!(matches!(
            IdentityKeyPair::from_bytes(&[1, 2, 3]),
            Err(Error::IdentityError(_))
        ));
    }
}

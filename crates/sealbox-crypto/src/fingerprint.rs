//! Human-verifiable digests of public identity keys.

use std::fmt;

use sha2::{Digest, Sha256};

use sealbox_protocol::types::PUBLIC_KEY_LEN;
use sealbox_protocol::PreKeyBundle;

use crate::error::Result;

const FINGERPRINT_DOMAIN: &[u8] = b"sealbox/fingerprint";

/// SHA-256 digest of a public identity key. Only ever compared by humans;
/// the protocol never branches on it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of_public_key(public_key: &[u8; PUBLIC_KEY_LEN]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(public_key);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Groups of four hex digits, e.g. `3f2a 91c0 ...`.
impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        for (i, chunk) in hex.as_bytes().chunks(4).enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            // hex output is ASCII
            f.write_str(std::str::from_utf8(chunk).map_err(|_| fmt::Error)?)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

/// Fingerprint of the identity that published `bundle_bytes`, without
/// needing an open store. Used to check a peer's bundle before starting a
/// session with it.
pub fn fingerprint_from_bundle(bundle_bytes: &[u8]) -> Result<Fingerprint> {
    let bundle = PreKeyBundle::from_bytes(bundle_bytes)?;
    Ok(Fingerprint::of_public_key(&bundle.identity_key))
}

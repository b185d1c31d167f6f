//! Primitive provider: X25519 key agreement, HKDF/HMAC key derivation and
//! AES-256-GCM. The rest of the crate only orchestrates these calls.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use sealbox_protocol::types::{PUBLIC_KEY_LEN, TAG_LEN};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Length of every symmetric key handled by the ratchet.
pub const KEY_LEN: usize = 32;

const HANDSHAKE_INFO: &[u8] = b"sealbox/handshake";
const RATCHET_INFO: &[u8] = b"sealbox/ratchet";

/// A 32-byte secret (root key, chain key or message key), wiped on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// An X25519 key pair.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    pub fn secret_bytes(&self) -> [u8; KEY_LEN] {
        self.secret.to_bytes()
    }

    /// X25519 agreement with a peer's public key. Rejects low-order points,
    /// which would yield an all-zero shared secret.
    pub fn agree(&self, their_public: &[u8; PUBLIC_KEY_LEN]) -> Result<SecretKey> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*their_public));
        if !shared.was_contributory() {
            return Err(Error::Proto("degenerate public key"));
        }
        Ok(SecretKey(shared.to_bytes()))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Derive the initial root key from the concatenated handshake secrets.
pub fn kdf_handshake(secrets: &[SecretKey]) -> Result<SecretKey> {
    let mut ikm = Vec::with_capacity(secrets.len() * KEY_LEN);
    for s in secrets {
        ikm.extend_from_slice(s.as_bytes());
    }
    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut okm = [0u8; KEY_LEN];
    let expanded = hk.expand(HANDSHAKE_INFO, &mut okm);
    ikm.zeroize();
    expanded.map_err(|_| Error::Crypto("hkdf expand"))?;
    Ok(SecretKey(okm))
}

/// Root KDF: mix a DH output into the root key, yielding the next root key
/// and a fresh chain key.
pub fn kdf_root(root_key: &SecretKey, dh_output: &SecretKey) -> Result<(SecretKey, SecretKey)> {
    let hk = Hkdf::<Sha256>::new(Some(root_key.as_bytes()), dh_output.as_bytes());
    let mut okm = [0u8; KEY_LEN * 2];
    hk.expand(RATCHET_INFO, &mut okm)
        .map_err(|_| Error::Crypto("hkdf expand"))?;
    let mut root = [0u8; KEY_LEN];
    let mut chain = [0u8; KEY_LEN];
    root.copy_from_slice(&okm[..KEY_LEN]);
    chain.copy_from_slice(&okm[KEY_LEN..]);
    okm.zeroize();
    Ok((SecretKey(root), SecretKey(chain)))
}

fn hmac_step(chain_key: &SecretKey, tag: u8) -> Result<SecretKey> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(chain_key.as_bytes())
        .map_err(|_| Error::Crypto("hmac key"))?;
    mac.update(&[tag]);
    Ok(SecretKey(mac.finalize().into_bytes().into()))
}

/// Chain KDF: returns `(next_chain_key, message_key)`.
pub fn kdf_chain(chain_key: &SecretKey) -> Result<(SecretKey, SecretKey)> {
    let message_key = hmac_step(chain_key, 0x01)?;
    let next = hmac_step(chain_key, 0x02)?;
    Ok((next, message_key))
}

/// Nonce = 8 zero bytes || counter(4). Each message key is used exactly
/// once, so binding the counter is sufficient for uniqueness.
fn build_nonce(counter: u32) -> Nonce {
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[8..12].copy_from_slice(&counter.to_be_bytes());
    Nonce::assume_unique_for_key(nonce_bytes)
}

fn aead_key(message_key: &SecretKey) -> Result<LessSafeKey> {
    let unbound = UnboundKey::new(&AES_256_GCM, message_key.as_bytes())
        .map_err(|_| Error::Crypto("invalid message key"))?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt under a message key. Returns ciphertext with the 16-byte tag appended.
pub fn seal(message_key: &SecretKey, counter: u32, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let key = aead_key(message_key)?;
    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(build_nonce(counter), Aad::from(aad), &mut in_out)
        .map_err(|_| Error::Crypto("encryption failed"))?;
    Ok(in_out)
}

/// Decrypt and authenticate under a message key.
pub fn open(message_key: &SecretKey, counter: u32, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_LEN {
        return Err(Error::Crypto("ciphertext too short for tag"));
    }
    let key = aead_key(message_key)?;
    let mut in_out = ciphertext.to_vec();
    let plaintext = key
        .open_in_place(build_nonce(counter), Aad::from(aad), &mut in_out)
        .map_err(|_| Error::Crypto("authentication failed"))?;
    Ok(plaintext.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_is_symmetric() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let ab = a.agree(&b.public_bytes()).unwrap();
        let ba = b.agree(&a.public_bytes()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn low_order_point_rejected() {
        let a = KeyPair::generate();
        let result = a.agree(&[0u8; 32]);
        assert!(matches!(result, Err(Error::Proto(_))));
    }

    #[test]
    fn keypair_from_secret_bytes_restores_public() {
        let a = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(a.secret_bytes());
        assert_eq!(a.public_bytes(), restored.public_bytes());
    }

    #[test]
    fn kdf_chain_deterministic() {
        let ck = SecretKey::from_bytes([0xAB; 32]);
        let (ck1, mk1) = kdf_chain(&ck).unwrap();
        let (ck2, mk2) = kdf_chain(&ck).unwrap();
        assert_eq!(ck1, ck2);
        assert_eq!(mk1, mk2);
        assert_ne!(ck1, mk1);
        assert_ne!(ck1, ck);
    }

    #[test]
    fn kdf_root_separates_outputs() {
        let rk = SecretKey::from_bytes([1; 32]);
        let dh = SecretKey::from_bytes([2; 32]);
        let (root, chain) = kdf_root(&rk, &dh).unwrap();
        assert_ne!(root, chain);
        assert_ne!(root, rk);
    }

    #[test]
    fn seal_open_roundtrip() {
        let mk = SecretKey::from_bytes([9; 32]);
        let sealed = seal(&mk, 3, b"header", b"hello").unwrap();
        assert_eq!(sealed.len(), 5 + TAG_LEN);
        assert_eq!(open(&mk, 3, b"header", &sealed).unwrap(), b"hello");
    }

    #[test]
    fn wrong_counter_fails() {
        let mk = SecretKey::from_bytes([9; 32]);
        let sealed = seal(&mk, 3, b"header", b"hello").unwrap();
        assert!(open(&mk, 4, b"header", &sealed).is_err());
    }

    #[test]
    fn wrong_aad_fails() {
        let mk = SecretKey::from_bytes([9; 32]);
        let sealed = seal(&mk, 3, b"header", b"hello").unwrap();
        assert!(open(&mk, 3, b"other", &sealed).is_err());
    }

    #[test]
    fn tampered_data_fails() {
        let mk = SecretKey::from_bytes([9; 32]);
        let mut sealed = seal(&mk, 0, b"", b"secret").unwrap();
        sealed[0] ^= 0xFF;
        assert!(matches!(open(&mk, 0, b"", &sealed), Err(Error::Crypto(_))));
    }

    #[test]
    fn short_ciphertext_fails() {
        let mk = SecretKey::from_bytes([9; 32]);
        assert!(open(&mk, 0, b"", &[0u8; 4]).is_err());
    }
}

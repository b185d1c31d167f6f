/// Identifier of a pre-key within a device's pool.
pub type PreKeyId = u16;

/// Reserved identifier of the last-resort pre-key. It is never removed from
/// the pool when a session is established with it.
pub const LAST_RESORT_PREKEY_ID: PreKeyId = 0xFFFF;

/// Ordinary pre-key identifiers wrap modulo this value.
pub const PREKEY_ID_MODULUS: u32 = 0xFFFF;

/// Current wire format version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of an X25519 public key on the wire.
pub const PUBLIC_KEY_LEN: usize = 32;

/// AES-256-GCM authentication tag size.
pub const TAG_LEN: usize = 16;

/// Upper bound on a single ciphertext accepted by the decoder (16 MiB).
pub const MAX_CIPHERTEXT_LEN: usize = 16 * 1024 * 1024;

/// Compute the identifier at `offset` in a batch starting at `start`,
/// wrapping so that the last-resort identifier is never produced.
pub fn wrapping_prekey_id(start: PreKeyId, offset: u32) -> PreKeyId {
    ((start as u32 + offset) % PREKEY_ID_MODULUS) as PreKeyId
}

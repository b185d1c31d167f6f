use crate::codec;
use crate::error::ProtocolError;
use crate::types::{PreKeyId, LAST_RESORT_PREKEY_ID, PROTOCOL_VERSION, PUBLIC_KEY_LEN};

/// Kind byte following the version byte of every encoded artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Steady-state ratchet message.
    Cipher = 0x01,
    /// First message(s) of a session, carrying the key agreement inputs.
    PreKey = 0x02,
    /// Published pre-key bundle.
    Bundle = 0x10,
}

impl MessageKind {
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0x01 => Ok(Self::Cipher),
            0x02 => Ok(Self::PreKey),
            0x10 => Ok(Self::Bundle),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// The public material a device publishes so peers can start a session
/// with it while it is offline.
///
/// Wire format (68 bytes):
/// ```text
/// [version: u8] [0x10: u8] [prekey_id: u16 BE] [identity_key: 32] [prekey: 32]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyBundle {
    pub prekey_id: PreKeyId,
    /// X25519 public identity key of the publishing device.
    pub identity_key: [u8; PUBLIC_KEY_LEN],
    /// X25519 public half of the pre-key.
    pub prekey: [u8; PUBLIC_KEY_LEN],
}

/// Encoded size of a [`PreKeyBundle`].
pub const BUNDLE_LEN: usize = 2 + 2 + PUBLIC_KEY_LEN * 2;

impl PreKeyBundle {
    pub fn is_last_resort(&self) -> bool {
        self.prekey_id == LAST_RESORT_PREKEY_ID
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        codec::encode_bundle(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        codec::decode_bundle(data)
    }
}

/// Ratchet header sent in the clear with every message and bound to the
/// ciphertext as associated data.
///
/// ```text
/// [ratchet_key: 32] [counter: u32 BE] [prev_counter: u32 BE]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Sender's current ratchet public key.
    pub ratchet_key: [u8; PUBLIC_KEY_LEN],
    /// Index of this message within the sender's current chain.
    pub counter: u32,
    /// Length of the sender's previous sending chain.
    pub prev_counter: u32,
}

/// Encoded size of a [`MessageHeader`].
pub const HEADER_LEN: usize = PUBLIC_KEY_LEN + 4 + 4;

impl MessageHeader {
    /// Stable encoding used both on the wire and as AEAD associated data.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..PUBLIC_KEY_LEN].copy_from_slice(&self.ratchet_key);
        out[PUBLIC_KEY_LEN..PUBLIC_KEY_LEN + 4].copy_from_slice(&self.counter.to_be_bytes());
        out[PUBLIC_KEY_LEN + 4..].copy_from_slice(&self.prev_counter.to_be_bytes());
        out
    }
}

/// A header plus the AEAD output (ciphertext with appended tag).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherMessage {
    pub header: MessageHeader,
    pub ciphertext: Vec<u8>,
}

/// A cipher message wrapped with everything the responder needs to
/// perform the initial key agreement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyMessage {
    /// Pre-key of the responder that the initiator used.
    pub prekey_id: PreKeyId,
    /// Initiator's one-off base key.
    pub base_key: [u8; PUBLIC_KEY_LEN],
    /// Initiator's public identity key.
    pub identity_key: [u8; PUBLIC_KEY_LEN],
    pub message: CipherMessage,
}

impl PreKeyMessage {
    /// Envelope bytes ahead of the header. See [`prekey_prologue`].
    pub fn prologue(&self) -> Vec<u8> {
        prekey_prologue(self.prekey_id, &self.base_key, &self.identity_key)
    }
}

/// Encoded size of a pre-key envelope up to its header.
pub const PREKEY_PROLOGUE_LEN: usize = 2 + 2 + PUBLIC_KEY_LEN * 2;

/// Leading bytes of a cipher envelope. Senders authenticate the prologue
/// together with the header, so it cannot be altered in transit.
pub fn cipher_prologue() -> Vec<u8> {
    vec![PROTOCOL_VERSION, MessageKind::Cipher as u8]
}

/// Leading bytes of a pre-key envelope, up to the header.
pub fn prekey_prologue(
    prekey_id: PreKeyId,
    base_key: &[u8; PUBLIC_KEY_LEN],
    identity_key: &[u8; PUBLIC_KEY_LEN],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(PREKEY_PROLOGUE_LEN);
    out.push(PROTOCOL_VERSION);
    out.push(MessageKind::PreKey as u8);
    out.extend_from_slice(&prekey_id.to_be_bytes());
    out.extend_from_slice(base_key);
    out.extend_from_slice(identity_key);
    out
}

/// Everything a session sends.
///
/// Cipher envelope:
/// ```text
/// [version: u8] [0x01: u8] [header: 40] [len: u32 BE] [ciphertext: len]
/// ```
///
/// Pre-key envelope:
/// ```text
/// [version: u8] [0x02: u8] [prekey_id: u16 BE] [base_key: 32] [identity_key: 32]
/// [header: 40] [len: u32 BE] [ciphertext: len]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Cipher(CipherMessage),
    PreKey(PreKeyMessage),
}

impl Envelope {
    /// The ratchet message carried by this envelope.
    pub fn message(&self) -> &CipherMessage {
        match self {
            Envelope::Cipher(m) => m,
            Envelope::PreKey(p) => &p.message,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Envelope::Cipher(_) => MessageKind::Cipher,
            Envelope::PreKey(_) => MessageKind::PreKey,
        }
    }

    /// Everything this envelope encodes ahead of the ratchet header.
    pub fn prologue(&self) -> Vec<u8> {
        match self {
            Envelope::Cipher(_) => cipher_prologue(),
            Envelope::PreKey(p) => p.prologue(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        codec::encode_envelope(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        codec::decode_envelope(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_byte() {
        assert_eq!(MessageKind::from_byte(0x01).unwrap(), MessageKind::Cipher);
        assert_eq!(MessageKind::from_byte(0x02).unwrap(), MessageKind::PreKey);
        assert_eq!(MessageKind::from_byte(0x10).unwrap(), MessageKind::Bundle);
        assert_eq!(
            MessageKind::from_byte(0x7F),
            Err(ProtocolError::UnknownKind(0x7F))
        );
    }

    #[test]
    fn header_layout_is_big_endian() {
        let header = MessageHeader {
            ratchet_key: [7u8; 32],
            counter: 0x0102_0304,
            prev_counter: 9,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[..32], &[7u8; 32]);
        assert_eq!(&bytes[32..36], &[1, 2, 3, 4]);
        assert_eq!(&bytes[36..], &[0, 0, 0, 9]);
    }

    #[test]
    fn prologue_is_encoded_prefix() {
        let message = CipherMessage {
            header: MessageHeader {
                ratchet_key: [3u8; 32],
                counter: 1,
                prev_counter: 0,
            },
            ciphertext: vec![0u8; 20],
        };
        let prekey = Envelope::PreKey(PreKeyMessage {
            prekey_id: 0x0A0B,
            base_key: [4u8; 32],
            identity_key: [5u8; 32],
            message: message.clone(),
        });
        let prologue = prekey.prologue();
        assert_eq!(prologue.len(), PREKEY_PROLOGUE_LEN);
        assert_eq!(&prologue[2..4], &[0x0A, 0x0B]);
        assert!(prekey.to_bytes().starts_with(&prologue));

        let cipher = Envelope::Cipher(message);
        assert!(cipher.to_bytes().starts_with(&cipher.prologue()));
        assert_ne!(cipher.prologue(), &prologue[..2]);
    }

    #[test]
    fn last_resort_bundle_flag() {
        let bundle = PreKeyBundle {
            prekey_id: LAST_RESORT_PREKEY_ID,
            identity_key: [1u8; 32],
            prekey: [2u8; 32],
        };
        assert!(bundle.is_last_resort());
    }
}

use bytes::{Buf, BufMut};

use crate::error::ProtocolError;
use crate::messages::{
    CipherMessage, Envelope, MessageHeader, MessageKind, PreKeyBundle, PreKeyMessage, BUNDLE_LEN,
    HEADER_LEN,
};
use crate::types::{MAX_CIPHERTEXT_LEN, PROTOCOL_VERSION, PUBLIC_KEY_LEN};

/// Fail with `TooShort` unless `n` more bytes are available.
fn ensure(buf: &&[u8], n: usize, total: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < n {
        return Err(ProtocolError::TooShort {
            expected: total - buf.remaining() + n,
            got: total,
        });
    }
    Ok(())
}

fn read_key(buf: &mut &[u8], total: usize) -> Result<[u8; PUBLIC_KEY_LEN], ProtocolError> {
    ensure(buf, PUBLIC_KEY_LEN, total)?;
    let mut key = [0u8; PUBLIC_KEY_LEN];
    buf.copy_to_slice(&mut key);
    Ok(key)
}

/// Read and check the version byte, then return the kind byte.
fn read_prologue(buf: &mut &[u8], total: usize) -> Result<MessageKind, ProtocolError> {
    ensure(buf, 2, total)?;
    let version = buf.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    MessageKind::from_byte(buf.get_u8())
}

fn finish(buf: &[u8]) -> Result<(), ProtocolError> {
    if buf.has_remaining() {
        return Err(ProtocolError::TrailingBytes(buf.remaining()));
    }
    Ok(())
}

fn put_cipher(out: &mut Vec<u8>, msg: &CipherMessage) {
    out.put_slice(&msg.header.to_bytes());
    out.put_u32(msg.ciphertext.len() as u32);
    out.put_slice(&msg.ciphertext);
}

fn read_cipher(buf: &mut &[u8], total: usize) -> Result<CipherMessage, ProtocolError> {
    let ratchet_key = read_key(buf, total)?;
    ensure(buf, 12, total)?;
    let counter = buf.get_u32();
    let prev_counter = buf.get_u32();
    let len = buf.get_u32() as usize;
    if len > MAX_CIPHERTEXT_LEN {
        return Err(ProtocolError::CiphertextTooLarge(len));
    }
    ensure(buf, len, total)?;
    let ciphertext = buf[..len].to_vec();
    buf.advance(len);
    Ok(CipherMessage {
        header: MessageHeader {
            ratchet_key,
            counter,
            prev_counter,
        },
        ciphertext,
    })
}

/// Encode a pre-key bundle for publication.
pub fn encode_bundle(bundle: &PreKeyBundle) -> Vec<u8> {
    let mut out = Vec::with_capacity(BUNDLE_LEN);
    out.put_u8(PROTOCOL_VERSION);
    out.put_u8(MessageKind::Bundle as u8);
    out.put_u16(bundle.prekey_id);
    out.put_slice(&bundle.identity_key);
    out.put_slice(&bundle.prekey);
    out
}

/// Decode a published pre-key bundle.
pub fn decode_bundle(data: &[u8]) -> Result<PreKeyBundle, ProtocolError> {
    let total = data.len();
    let mut buf = data;
    match read_prologue(&mut buf, total)? {
        MessageKind::Bundle => {}
        other => return Err(ProtocolError::UnknownKind(other as u8)),
    }
    ensure(&buf, 2, total)?;
    let prekey_id = buf.get_u16();
    let identity_key = read_key(&mut buf, total)?;
    let prekey = read_key(&mut buf, total)?;
    finish(buf)?;
    Ok(PreKeyBundle {
        prekey_id,
        identity_key,
        prekey,
    })
}

/// Encode a message envelope for transmission.
pub fn encode_envelope(envelope: &Envelope) -> Vec<u8> {
    let body = envelope.message();
    let mut out = Vec::with_capacity(2 + 2 + PUBLIC_KEY_LEN * 2 + HEADER_LEN + 4 + body.ciphertext.len());
    out.put_slice(&envelope.prologue());
    put_cipher(&mut out, body);
    out
}

/// Decode a message envelope.
pub fn decode_envelope(data: &[u8]) -> Result<Envelope, ProtocolError> {
    let total = data.len();
    let mut buf = data;
    let envelope = match read_prologue(&mut buf, total)? {
        MessageKind::Cipher => Envelope::Cipher(read_cipher(&mut buf, total)?),
        MessageKind::PreKey => {
            ensure(&buf, 2, total)?;
            let prekey_id = buf.get_u16();
            let base_key = read_key(&mut buf, total)?;
            let identity_key = read_key(&mut buf, total)?;
            let message = read_cipher(&mut buf, total)?;
            Envelope::PreKey(PreKeyMessage {
                prekey_id,
                base_key,
                identity_key,
                message,
            })
        }
        MessageKind::Bundle => return Err(ProtocolError::UnknownKind(MessageKind::Bundle as u8)),
    };
    finish(buf)?;
    Ok(envelope)
}

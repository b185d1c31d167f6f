//! Pairwise sessions: initial key agreement plus the ratchet.
//!
//! The initiator derives the shared root from a peer's [`PreKeyBundle`] and
//! keeps wrapping its messages in pre-key envelopes until the peer answers.
//! The responder derives the same root from the first envelope it receives
//! and the matching pre-key, then proves the agreement by decrypting it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use sealbox_protocol::types::PUBLIC_KEY_LEN;
use sealbox_protocol::{
    cipher_prologue, prekey_prologue, CipherMessage, Envelope, PreKeyBundle, PreKeyId, PreKeyMessage,
};

use crate::config::BoxConfig;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::identity::IdentityKeyPair;
use crate::persistence::{decode_record, encode_record, RecordKind};
use crate::prekey::PreKey;
use crate::primitives::{kdf_handshake, KeyPair};
use crate::ratchet::{RatchetRecord, RatchetState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Established, nothing sent or received through it yet.
    Fresh,
    Active,
}

/// What the initiator repeats in every envelope until the responder replies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PendingPreKey {
    prekey_id: PreKeyId,
    identity_key: [u8; PUBLIC_KEY_LEN],
}

#[derive(Serialize, Deserialize)]
struct SessionRecord {
    remote_identity: [u8; PUBLIC_KEY_LEN],
    base_key: [u8; PUBLIC_KEY_LEN],
    pending: Option<PendingPreKey>,
    status: SessionStatus,
    ratchet: RatchetRecord,
}

pub struct Session {
    identity: Arc<IdentityKeyPair>,
    remote_identity: [u8; PUBLIC_KEY_LEN],
    /// The initiator's base key; identifies the handshake on both sides.
    base_key: [u8; PUBLIC_KEY_LEN],
    pending: Option<PendingPreKey>,
    status: SessionStatus,
    ratchet: RatchetState,
}

impl Session {
    /// Start a session as initiator from the peer's published bundle.
    pub fn init_from_bundle(identity: Arc<IdentityKeyPair>, bundle: &PreKeyBundle) -> Result<Self> {
        let base = KeyPair::generate();
        let root_key = kdf_handshake(&[
            identity.key_pair().agree(&bundle.prekey)?,
            base.agree(&bundle.identity_key)?,
            base.agree(&bundle.prekey)?,
        ])?;
        let ratchet = RatchetState::initiator(root_key, &bundle.prekey)?;

        Ok(Self {
            remote_identity: bundle.identity_key,
            base_key: base.public_bytes(),
            pending: Some(PendingPreKey {
                prekey_id: bundle.prekey_id,
                identity_key: identity.public_key(),
            }),
            status: SessionStatus::Fresh,
            ratchet,
            identity,
        })
    }

    /// Complete the agreement as responder and decrypt the message that
    /// carried it. Nothing is returned unless that message authenticates.
    pub fn init_from_prekey_message(
        identity: Arc<IdentityKeyPair>,
        message: &PreKeyMessage,
        prekey: &PreKey,
        config: &BoxConfig,
    ) -> Result<(Self, Vec<u8>)> {
        if message.prekey_id != prekey.id {
            return Err(Error::InvalidMessage("pre-key id does not match"));
        }
        let root_key = kdf_handshake(&[
            prekey.key_pair().agree(&message.identity_key)?,
            identity.key_pair().agree(&message.base_key)?,
            prekey.key_pair().agree(&message.base_key)?,
        ])?;
        let mut session = Self {
            remote_identity: message.identity_key,
            base_key: message.base_key,
            pending: None,
            status: SessionStatus::Fresh,
            ratchet: RatchetState::responder(root_key, prekey.key_pair().clone()),
            identity,
        };
        let plaintext = session.decrypt_message(&message.prologue(), &message.message, config)?;
        Ok((session, plaintext))
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Whether outgoing messages still carry the pre-key handshake.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn local_identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    pub fn remote_identity(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.remote_identity
    }

    /// Fingerprint of the peer identity seen at establishment.
    pub fn remote_fingerprint(&self) -> Fingerprint {
        Fingerprint::of_public_key(&self.remote_identity)
    }

    /// Encrypt `plaintext` into an encoded envelope.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let prologue = match &self.pending {
            Some(pending) => prekey_prologue(pending.prekey_id, &self.base_key, &pending.identity_key),
            None => cipher_prologue(),
        };
        let message = self.ratchet.encrypt(&prologue, plaintext)?;
        let envelope = match self.pending {
            Some(pending) => Envelope::PreKey(PreKeyMessage {
                prekey_id: pending.prekey_id,
                base_key: self.base_key,
                identity_key: pending.identity_key,
                message,
            }),
            None => Envelope::Cipher(message),
        };
        self.status = SessionStatus::Active;
        Ok(envelope.to_bytes())
    }

    /// Decrypt an encoded envelope. A failure leaves the session unchanged.
    pub fn decrypt(&mut self, envelope: &[u8], config: &BoxConfig) -> Result<Vec<u8>> {
        let envelope = Envelope::from_bytes(envelope)?;
        self.decrypt_envelope(&envelope, config)
    }

    pub(crate) fn decrypt_envelope(&mut self, envelope: &Envelope, config: &BoxConfig) -> Result<Vec<u8>> {
        if let Envelope::PreKey(message) = envelope {
            let same_identity: bool = message.identity_key[..].ct_eq(&self.remote_identity[..]).into();
            if !same_identity {
                return Err(Error::RemoteIdentityChanged);
            }
            if message.base_key != self.base_key {
                return Err(Error::InvalidMessage("pre-key message for another session"));
            }
        }
        self.decrypt_message(&envelope.prologue(), envelope.message(), config)
    }

    fn decrypt_message(
        &mut self,
        prologue: &[u8],
        message: &CipherMessage,
        config: &BoxConfig,
    ) -> Result<Vec<u8>> {
        let plaintext = self.ratchet.decrypt(prologue, message, config)?;
        self.pending = None;
        self.status = SessionStatus::Active;
        Ok(plaintext)
    }

    /// Full session state, skipped message keys included.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let record = SessionRecord {
            remote_identity: self.remote_identity,
            base_key: self.base_key,
            pending: self.pending,
            status: self.status,
            ratchet: self.ratchet.to_record(),
        };
        encode_record(RecordKind::Session, &record).map_err(|e| Error::corrupt("session", e))
    }

    pub fn deserialize(data: &[u8], identity: Arc<IdentityKeyPair>) -> Result<Self> {
        Self::from_record_bytes("session", data, identity)
    }

    pub(crate) fn from_record_bytes(
        key: &str,
        data: &[u8],
        identity: Arc<IdentityKeyPair>,
    ) -> Result<Self> {
        let record: SessionRecord =
            decode_record(RecordKind::Session, data).map_err(|e| Error::corrupt(key, e))?;
        Ok(Self {
            identity,
            remote_identity: record.remote_identity,
            base_key: record.base_key,
            pending: record.pending,
            status: record.status,
            ratchet: RatchetState::from_record(record.ratchet),
        })
    }
}

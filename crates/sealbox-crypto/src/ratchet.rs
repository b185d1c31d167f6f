//! Double ratchet state for one session.
//!
//! Every message advances a symmetric chain (`kdf_chain`); every change of
//! the peer's ratchet key triggers a DH step that re-keys the root. Keys for
//! messages that were skipped are cached, bounded by [`BoxConfig`], so
//! out-of-order delivery still decrypts exactly once.
//!
//! Decryption works on a copy of the state that is only committed once the
//! ciphertext authenticates. A forged or replayed message never moves a
//! chain forward.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use sealbox_protocol::types::PUBLIC_KEY_LEN;
use sealbox_protocol::messages::HEADER_LEN;
use sealbox_protocol::{CipherMessage, MessageHeader};

use crate::config::BoxConfig;
use crate::error::{Error, Result};
use crate::primitives::{self, kdf_chain, kdf_root, KeyPair, SecretKey};

#[derive(Clone, Serialize, Deserialize)]
struct SendChain {
    chain_key: SecretKey,
    counter: u32,
}

#[derive(Clone, Serialize, Deserialize)]
struct RecvChain {
    ratchet_key: [u8; PUBLIC_KEY_LEN],
    /// `None` once the peer has moved on to a newer ratchet key.
    chain_key: Option<SecretKey>,
    next_counter: u32,
    /// Skipped keys below this counter were evicted from the cache.
    evicted_below: u32,
}

#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    ratchet_key: [u8; PUBLIC_KEY_LEN],
    counter: u32,
    message_key: SecretKey,
}

/// Persisted form of [`RatchetState`].
#[derive(Serialize, Deserialize)]
pub(crate) struct RatchetRecord {
    root_key: SecretKey,
    our_ratchet: SecretKey,
    sending: Option<SendChain>,
    prev_counter: u32,
    receiving: VecDeque<RecvChain>,
    skipped: VecDeque<SkippedKey>,
}

#[derive(Clone)]
pub struct RatchetState {
    root_key: SecretKey,
    our_ratchet: KeyPair,
    sending: Option<SendChain>,
    prev_counter: u32,
    /// Most recent chain first.
    receiving: VecDeque<RecvChain>,
    /// Insertion order, oldest first.
    skipped: VecDeque<SkippedKey>,
}

impl RatchetState {
    /// State of the side that sent the first message. `their_ratchet` is the
    /// responder's pre-key, which doubles as its first ratchet key.
    pub fn initiator(root_key: SecretKey, their_ratchet: &[u8; PUBLIC_KEY_LEN]) -> Result<Self> {
        let our_ratchet = KeyPair::generate();
        let dh = our_ratchet.agree(their_ratchet)?;
        let (root_key, chain_key) = kdf_root(&root_key, &dh)?;
        Ok(Self {
            root_key,
            our_ratchet,
            sending: Some(SendChain {
                chain_key,
                counter: 0,
            }),
            prev_counter: 0,
            receiving: VecDeque::new(),
            skipped: VecDeque::new(),
        })
    }

    /// State of the side that received the first message. It cannot send
    /// until the initiator's first ratchet key has been processed.
    pub fn responder(root_key: SecretKey, our_ratchet: KeyPair) -> Self {
        Self {
            root_key,
            our_ratchet,
            sending: None,
            prev_counter: 0,
            receiving: VecDeque::new(),
            skipped: VecDeque::new(),
        }
    }

    /// Number of message keys currently cached for out-of-order delivery.
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Encrypt the next message. `prologue` is authenticated along with the
    /// header and must be presented again to decrypt.
    pub fn encrypt(&mut self, prologue: &[u8], plaintext: &[u8]) -> Result<CipherMessage> {
        let sending = self
            .sending
            .as_mut()
            .ok_or(Error::Crypto("no sending chain yet"))?;

        let (next_chain_key, message_key) = kdf_chain(&sending.chain_key)?;
        let next_counter = sending
            .counter
            .checked_add(1)
            .ok_or(Error::Crypto("sending chain exhausted"))?;
        let header = MessageHeader {
            ratchet_key: self.our_ratchet.public_bytes(),
            counter: sending.counter,
            prev_counter: self.prev_counter,
        };
        let aad = associated_data(prologue, &header);
        let ciphertext = primitives::seal(&message_key, header.counter, &aad, plaintext)?;

        sending.chain_key = next_chain_key;
        sending.counter = next_counter;
        Ok(CipherMessage { header, ciphertext })
    }

    /// Decrypt `message`. On any error the state is left untouched.
    pub fn decrypt(&mut self, prologue: &[u8], message: &CipherMessage, config: &BoxConfig) -> Result<Vec<u8>> {
        let mut next = self.clone();
        let plaintext = next.decrypt_in_place(prologue, message, config)?;
        *self = next;
        Ok(plaintext)
    }

    fn decrypt_in_place(
        &mut self,
        prologue: &[u8],
        message: &CipherMessage,
        config: &BoxConfig,
    ) -> Result<Vec<u8>> {
        let header = &message.header;
        let aad = associated_data(prologue, header);

        let idx = match self
            .receiving
            .iter()
            .position(|c| c.ratchet_key == header.ratchet_key)
        {
            Some(idx) if header.counter < self.receiving[idx].next_counter => {
                let message_key = self.take_skipped(idx, header)?;
                return primitives::open(&message_key, header.counter, &aad, &message.ciphertext);
            }
            Some(idx) => idx,
            None => {
                self.dh_step(header, config)?;
                0
            }
        };

        self.skip_keys(idx, header.counter, config)?;
        let message_key = self.next_message_key(idx)?;
        primitives::open(&message_key, header.counter, &aad, &message.ciphertext)
    }

    /// Remove and return the cached key for an earlier message of chain `idx`.
    fn take_skipped(&mut self, idx: usize, header: &MessageHeader) -> Result<SecretKey> {
        let pos = self
            .skipped
            .iter()
            .position(|k| k.ratchet_key == header.ratchet_key && k.counter == header.counter);
        match pos.and_then(|p| self.skipped.remove(p)) {
            Some(key) => Ok(key.message_key.clone()),
            None if header.counter < self.receiving[idx].evicted_below => Err(Error::OutdatedMessage),
            None => Err(Error::DuplicateMessage),
        }
    }

    /// Advance chain `idx` up to (not including) `until`, caching every
    /// message key passed over.
    fn skip_keys(&mut self, idx: usize, until: u32, config: &BoxConfig) -> Result<()> {
        let chain = &mut self.receiving[idx];
        if until <= chain.next_counter {
            return Ok(());
        }
        if until - chain.next_counter > config.max_counter_gap {
            return Err(Error::TooDistantFuture);
        }
        let mut chain_key = chain
            .chain_key
            .clone()
            .ok_or(Error::InvalidMessage("counter beyond the end of a closed chain"))?;

        let mut staged = Vec::with_capacity((until - chain.next_counter) as usize);
        for counter in chain.next_counter..until {
            let (next, message_key) = kdf_chain(&chain_key)?;
            staged.push(SkippedKey {
                ratchet_key: chain.ratchet_key,
                counter,
                message_key,
            });
            chain_key = next;
        }
        chain.chain_key = Some(chain_key);
        chain.next_counter = until;

        self.skipped.extend(staged);
        self.evict_skipped(config);
        Ok(())
    }

    /// Derive the key for the next expected message of chain `idx`.
    fn next_message_key(&mut self, idx: usize) -> Result<SecretKey> {
        let chain = &mut self.receiving[idx];
        let chain_key = chain
            .chain_key
            .as_ref()
            .ok_or(Error::InvalidMessage("counter beyond the end of a closed chain"))?;
        let (next, message_key) = kdf_chain(chain_key)?;
        chain.next_counter = chain
            .next_counter
            .checked_add(1)
            .ok_or(Error::TooDistantFuture)?;
        chain.chain_key = Some(next);
        Ok(message_key)
    }

    fn evict_skipped(&mut self, config: &BoxConfig) {
        while self.skipped.len() > config.max_skipped_keys {
            let Some(old) = self.skipped.pop_front() else {
                break;
            };
            if let Some(chain) = self
                .receiving
                .iter_mut()
                .find(|c| c.ratchet_key == old.ratchet_key)
            {
                chain.evicted_below = chain.evicted_below.max(old.counter.saturating_add(1));
            }
        }
    }

    /// The peer switched to a new ratchet key: close the current receiving
    /// chain, open one for the new key and start a fresh sending chain.
    fn dh_step(&mut self, header: &MessageHeader, config: &BoxConfig) -> Result<()> {
        if !self.receiving.is_empty() {
            self.skip_keys(0, header.prev_counter, config)?;
            self.receiving[0].chain_key = None;
        }

        let dh_recv = self.our_ratchet.agree(&header.ratchet_key)?;
        let (root_key, recv_chain_key) = kdf_root(&self.root_key, &dh_recv)?;
        self.receiving.push_front(RecvChain {
            ratchet_key: header.ratchet_key,
            chain_key: Some(recv_chain_key),
            next_counter: 0,
            evicted_below: 0,
        });
        while self.receiving.len() > config.max_receive_chains.max(1) {
            if let Some(dropped) = self.receiving.pop_back() {
                self.skipped.retain(|k| k.ratchet_key != dropped.ratchet_key);
            }
        }

        let our_ratchet = KeyPair::generate();
        let dh_send = our_ratchet.agree(&header.ratchet_key)?;
        let (root_key, send_chain_key) = kdf_root(&root_key, &dh_send)?;

        self.prev_counter = self.sending.as_ref().map_or(0, |s| s.counter);
        self.sending = Some(SendChain {
            chain_key: send_chain_key,
            counter: 0,
        });
        self.our_ratchet = our_ratchet;
        self.root_key = root_key;
        Ok(())
    }

    pub(crate) fn to_record(&self) -> RatchetRecord {
        RatchetRecord {
            root_key: self.root_key.clone(),
            our_ratchet: SecretKey::from_bytes(self.our_ratchet.secret_bytes()),
            sending: self.sending.clone(),
            prev_counter: self.prev_counter,
            receiving: self.receiving.clone(),
            skipped: self.skipped.clone(),
        }
    }

    pub(crate) fn from_record(record: RatchetRecord) -> Self {
        Self {
            our_ratchet: KeyPair::from_secret_bytes(*record.our_ratchet.as_bytes()),
            root_key: record.root_key,
            sending: record.sending,
            prev_counter: record.prev_counter,
            receiving: record.receiving,
            skipped: record.skipped,
        }
    }
}

fn associated_data(prologue: &[u8], header: &MessageHeader) -> Vec<u8> {
    let mut aad = Vec::with_capacity(prologue.len() + HEADER_LEN);
    aad.extend_from_slice(prologue);
    aad.extend_from_slice(&header.to_bytes());
    aad
}

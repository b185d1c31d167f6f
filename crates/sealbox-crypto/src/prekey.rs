//! One-time pre-keys and the last-resort pre-key.
//!
//! Pre-keys are single-use X25519 key pairs published as bundles so a peer
//! can start a session while this device is offline. Ordinary pre-keys are
//! removed once a session is established with them; the last-resort key
//! (`0xFFFF`) never is.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use sealbox_protocol::types::{wrapping_prekey_id, PUBLIC_KEY_LEN};
use sealbox_protocol::{PreKeyBundle, PreKeyId, LAST_RESORT_PREKEY_ID};

use crate::error::{Error, Result};
use crate::identity::IdentityKeyPair;
use crate::persistence::{decode_record, encode_record, RecordKind};
use crate::primitives::{KeyPair, KEY_LEN};
use crate::storage::{prekey_key, Storage, PREKEY_PREFIX};

/// Number of one-time pre-keys a client usually publishes at once.
pub const INITIAL_PREKEY_COUNT: u16 = 100;

/// Threshold below which a client should publish more pre-keys.
pub const PREKEY_REPLENISH_THRESHOLD: usize = 10;

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct PreKeyRecord {
    id: PreKeyId,
    public_key: [u8; PUBLIC_KEY_LEN],
    private_key: [u8; KEY_LEN],
}

/// A pre-key pair held in the local pool.
pub struct PreKey {
    pub id: PreKeyId,
    key_pair: KeyPair,
}

impl PreKey {
    fn generate(id: PreKeyId) -> Self {
        Self {
            id,
            key_pair: KeyPair::generate(),
        }
    }

    pub(crate) fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn is_last_resort(&self) -> bool {
        self.id == LAST_RESORT_PREKEY_ID
    }

    /// The public bundle for this pre-key under `identity`.
    pub fn bundle(&self, identity: &IdentityKeyPair) -> PreKeyBundle {
        PreKeyBundle {
            prekey_id: self.id,
            identity_key: identity.public_key(),
            prekey: self.key_pair.public_bytes(),
        }
    }

    fn to_record(&self) -> Result<Vec<u8>> {
        let record = PreKeyRecord {
            id: self.id,
            public_key: self.key_pair.public_bytes(),
            private_key: self.key_pair.secret_bytes(),
        };
        encode_record(RecordKind::PreKey, &record).map_err(|e| Error::corrupt(&prekey_key(self.id), e))
    }

    fn from_record(key: &str, data: &[u8]) -> Result<Self> {
        let record: PreKeyRecord =
            decode_record(RecordKind::PreKey, data).map_err(|e| Error::corrupt(key, e))?;
        let key_pair = KeyPair::from_secret_bytes(record.private_key);
        if key_pair.public_bytes() != record.public_key {
            return Err(Error::corrupt(key, "pre-key halves do not match"));
        }
        Ok(Self {
            id: record.id,
            key_pair,
        })
    }
}

/// The store's pool of pre-keys. All mutation goes through one lock so that
/// no pre-key is handed out or consumed twice.
pub struct PreKeyPool {
    storage: Arc<dyn Storage>,
    lock: Mutex<()>,
}

impl PreKeyPool {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            lock: Mutex::new(()),
        }
    }

    pub(crate) fn lock(&self) -> PoolGuard<'_> {
        // The guarded value is `()`, so a poisoned lock carries no broken state.
        let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        PoolGuard { pool: self, _guard: guard }
    }

    /// Generate `count` pre-keys with identifiers `start, start+1, ...`
    /// (wrapping modulo `0xFFFF`), persisting each before its bundle is
    /// returned. On a storage failure the keys written so far stay in the
    /// pool but nothing is returned.
    pub fn generate(
        &self,
        identity: &IdentityKeyPair,
        start: PreKeyId,
        count: u16,
    ) -> Result<Vec<PreKeyBundle>> {
        let _guard = self.lock();
        let mut bundles = Vec::with_capacity(count as usize);

        for i in 0..count as u32 {
            let prekey = PreKey::generate(wrapping_prekey_id(start, i));
            self.storage.put(&prekey_key(prekey.id), &prekey.to_record()?)?;
            bundles.push(prekey.bundle(identity));
        }

        debug!(start, count, "generated pre-keys");
        Ok(bundles)
    }

    /// Ensure the last-resort pre-key exists and return its bundle.
    /// Calling this again returns the same key.
    pub fn last_resort(&self, identity: &IdentityKeyPair) -> Result<PreKeyBundle> {
        let guard = self.lock();
        if let Some(existing) = guard.load(LAST_RESORT_PREKEY_ID)? {
            return Ok(existing.bundle(identity));
        }

        let prekey = PreKey::generate(LAST_RESORT_PREKEY_ID);
        self.storage.put(&prekey_key(prekey.id), &prekey.to_record()?)?;
        debug!("generated last-resort pre-key");
        Ok(prekey.bundle(identity))
    }

    /// Identifiers currently in the pool, ascending.
    pub fn ids(&self) -> Result<Vec<PreKeyId>> {
        let _guard = self.lock();
        let mut ids: Vec<PreKeyId> = self
            .storage
            .list(PREKEY_PREFIX)?
            .iter()
            .filter_map(|key| key[PREKEY_PREFIX.len()..].parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Remove every pre-key, the last-resort one included.
    pub fn purge(&self) -> Result<usize> {
        let _guard = self.lock();
        let keys = self.storage.list(PREKEY_PREFIX)?;
        for key in &keys {
            self.storage.delete(key)?;
        }
        Ok(keys.len())
    }
}

/// Exclusive access to the pool for the duration of a session establishment.
pub(crate) struct PoolGuard<'a> {
    pool: &'a PreKeyPool,
    _guard: MutexGuard<'a, ()>,
}

impl PoolGuard<'_> {
    pub(crate) fn load(&self, id: PreKeyId) -> Result<Option<PreKey>> {
        let key = prekey_key(id);
        match self.pool.storage.get(&key)? {
            None => Ok(None),
            Some(data) => Ok(Some(PreKey::from_record(&key, &data)?)),
        }
    }

    /// Mark a pre-key as used. Ordinary pre-keys are deleted; the
    /// last-resort key stays.
    pub(crate) fn consume(&self, id: PreKeyId) -> Result<()> {
        if id == LAST_RESORT_PREKEY_ID {
            return Ok(());
        }
        self.pool.storage.delete(&prekey_key(id))?;
        debug!(prekey_id = id, "consumed pre-key");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool() -> (PreKeyPool, IdentityKeyPair) {
        (
            PreKeyPool::new(Arc::new(MemoryStorage::new())),
            IdentityKeyPair::generate(),
        )
    }

    #[test]
    fn generate_persists_in_order() {
        let (pool, identity) = pool();
        let bundles = pool.generate(&identity, 0, 10).unwrap();
        let ids: Vec<_> = bundles.iter().map(|b| b.prekey_id).collect();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
        assert_eq!(pool.ids().unwrap(), ids);
        assert!(bundles.iter().all(|b| b.identity_key == identity.public_key()));
    }

    /// Accepts a fixed number of writes, then fails every one.
    struct FullDisk {
        inner: MemoryStorage,
        writes_left: AtomicUsize,
    }

    impl Storage for FullDisk {
        fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn put(&self, key: &str, value: &[u8]) -> io::Result<()> {
            let left = self.writes_left.load(Ordering::SeqCst);
            if left == 0 {
                return Err(io::Error::other("disk full"));
            }
            self.writes_left.store(left - 1, Ordering::SeqCst);
            self.inner.put(key, value)
        }

        fn delete(&self, key: &str) -> io::Result<()> {
            self.inner.delete(key)
        }

        fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
            self.inner.list(prefix)
        }
    }

    #[test]
    fn failed_write_returns_no_bundles() {
        let pool = PreKeyPool::new(Arc::new(FullDisk {
            inner: MemoryStorage::new(),
            writes_left: AtomicUsize::new(2),
        }));
        let identity = IdentityKeyPair::generate();

        assert!(matches!(pool.generate(&identity, 0, 5), Err(Error::StorageIo(_))));
        assert_eq!(pool.ids().unwrap(), vec![0, 1]);
    }

    #[test]
    fn generate_wraps_ids() {
        let (pool, identity) = pool();
        let bundles = pool.generate(&identity, 0xFFFC, 5).unwrap();
        let ids: Vec<_> = bundles.iter().map(|b| b.prekey_id).collect();
        assert_eq!(ids, vec![0xFFFC, 0xFFFD, 0xFFFE, 0x0000, 0x0001]);
        assert!(!pool.ids().unwrap().contains(&LAST_RESORT_PREKEY_ID));
    }

    #[test]
    fn loaded_prekey_matches_bundle() {
        let (pool, identity) = pool();
        let bundle = pool.generate(&identity, 7, 1).unwrap().remove(0);
        let loaded = pool.lock().load(7).unwrap().unwrap();
        assert_eq!(loaded.bundle(&identity), bundle);
    }

    #[test]
    fn last_resort_is_idempotent() {
        let (pool, identity) = pool();
        let first = pool.last_resort(&identity).unwrap();
        let second = pool.last_resort(&identity).unwrap();
        assert_eq!(first, second);
        assert!(first.is_last_resort());
        assert_eq!(pool.ids().unwrap(), vec![LAST_RESORT_PREKEY_ID]);
    }

    #[test]
    fn consume_removes_only_ordinary_keys() {
        let (pool, identity) = pool();
        pool.generate(&identity, 5, 1).unwrap();
        pool.last_resort(&identity).unwrap();

        let guard = pool.lock();
        guard.consume(5).unwrap();
        guard.consume(LAST_RESORT_PREKEY_ID).unwrap();
        assert!(guard.load(5).unwrap().is_none());
        assert!(guard.load(LAST_RESORT_PREKEY_ID).unwrap().is_some());
    }

    #[test]
    fn purge_empties_pool() {
        let (pool, identity) = pool();
        pool.generate(&identity, 0, 3).unwrap();
        pool.last_resort(&identity).unwrap();
        assert_eq!(pool.purge().unwrap(), 4);
        assert!(pool.ids().unwrap().is_empty());
    }
}

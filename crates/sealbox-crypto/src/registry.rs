//! Live sessions, keyed by caller-chosen identifiers.
//!
//! At most one [`CryptoSession`] is live per identifier. Every lookup and
//! establishment goes through the map's entry API, so the check for an
//! existing instance and the insertion of a new one happen under the same
//! shard lock. Lock order is: map shard, then pre-key pool, then session.

use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use sealbox_protocol::{Envelope, PreKeyBundle};

use crate::config::BoxConfig;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::identity::IdentityKeyPair;
use crate::prekey::PreKeyPool;
use crate::session::{Session, SessionStatus};
use crate::storage::{session_key, Storage, SESSION_PREFIX};

/// Longest accepted session identifier, in bytes.
pub const MAX_SESSION_ID_LEN: usize = 255;

/// Session identifiers double as storage keys, so they must be a single
/// path segment.
pub fn validate_session_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && !id.starts_with('.')
        && !id.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidSessionId(id.to_string()))
    }
}

/// Handle to a live session. Clones share the same state.
///
/// Once the session is closed (explicitly, by deletion, or because its box
/// was closed) every call returns [`Error::SessionClosed`].
#[derive(Clone)]
pub struct CryptoSession {
    id: Arc<str>,
    inner: Arc<Mutex<Option<Session>>>,
    storage: Arc<dyn Storage>,
    config: Arc<BoxConfig>,
}

impl std::fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSession")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl CryptoSession {
    fn new(id: &str, session: Session, storage: Arc<dyn Storage>, config: Arc<BoxConfig>) -> Self {
        Self {
            id: Arc::from(id),
            inner: Arc::new(Mutex::new(Some(session))),
            storage,
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        // Session mutations commit only after success, so the state behind
        // a poisoned lock is still consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with<T>(&self, f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        match self.lock().as_mut() {
            Some(session) => f(session),
            None => Err(Error::SessionClosed),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.with(|s| s.encrypt(plaintext))
    }

    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>> {
        let config = Arc::clone(&self.config);
        self.with(|s| s.decrypt(envelope, &config))
    }

    pub(crate) fn decrypt_envelope(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let config = Arc::clone(&self.config);
        self.with(|s| s.decrypt_envelope(envelope, &config))
    }

    pub fn remote_fingerprint(&self) -> Result<Fingerprint> {
        self.with(|s| Ok(s.remote_fingerprint()))
    }

    pub fn status(&self) -> Result<SessionStatus> {
        self.with(|s| Ok(s.status()))
    }

    /// Write the current state to the store. The session lock is held for
    /// the write, so the saved state is never older than a completed call.
    pub fn save(&self) -> Result<()> {
        self.with(|s| {
            let bytes = s.serialize()?;
            self.storage.put(&session_key(&self.id), &bytes)?;
            debug!(session = %self.id, "saved session");
            Ok(())
        })
    }

    /// Release the in-memory state. Saved state stays loadable.
    pub fn close(&self) {
        self.lock().take();
    }
}

pub struct SessionRegistry {
    sessions: DashMap<String, CryptoSession>,
    storage: Arc<dyn Storage>,
    config: Arc<BoxConfig>,
}

impl SessionRegistry {
    pub fn new(storage: Arc<dyn Storage>, config: Arc<BoxConfig>) -> Self {
        Self {
            sessions: DashMap::new(),
            storage,
            config,
        }
    }

    fn handle(&self, id: &str, session: Session) -> CryptoSession {
        CryptoSession::new(id, session, Arc::clone(&self.storage), Arc::clone(&self.config))
    }

    /// Load a persisted session into a new handle.
    fn load_persisted(&self, identity: &Arc<IdentityKeyPair>, id: &str) -> Result<Option<CryptoSession>> {
        let key = session_key(id);
        match self.storage.get(&key)? {
            None => Ok(None),
            Some(bytes) => {
                let session = Session::from_record_bytes(&key, &bytes, Arc::clone(identity))?;
                debug!(session = %id, "loaded session from store");
                Ok(Some(self.handle(id, session)))
            }
        }
    }

    pub fn try_load(&self, identity: &Arc<IdentityKeyPair>, id: &str) -> Result<Option<CryptoSession>> {
        validate_session_id(id)?;
        let entry = self.sessions.entry(id.to_string());
        if let Some(live) = live_handle(&entry) {
            return Ok(Some(live));
        }
        match self.load_persisted(identity, id)? {
            Some(handle) => {
                entry.insert(handle.clone());
                Ok(Some(handle))
            }
            None => {
                if let Entry::Occupied(closed) = entry {
                    closed.remove();
                }
                Ok(None)
            }
        }
    }

    pub fn load(&self, identity: &Arc<IdentityKeyPair>, id: &str) -> Result<CryptoSession> {
        self.try_load(identity, id)?
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    /// Start a session with the owner of `bundle`, or return the one that
    /// already exists under `id`.
    pub fn establish_from_bundle(
        &self,
        identity: &Arc<IdentityKeyPair>,
        id: &str,
        bundle: &PreKeyBundle,
    ) -> Result<CryptoSession> {
        validate_session_id(id)?;
        let entry = self.sessions.entry(id.to_string());
        let existing = match live_handle(&entry) {
            Some(live) => Some(live),
            None => self.load_persisted(identity, id)?,
        };
        let handle = match existing {
            Some(existing) => {
                debug!(session = %id, "session exists, not re-initiating");
                existing
            }
            None => {
                let session = Session::init_from_bundle(Arc::clone(identity), bundle)?;
                info!(session = %id, prekey_id = bundle.prekey_id, "initiated session");
                self.handle(id, session)
            }
        };
        entry.insert(handle.clone());
        Ok(handle)
    }

    /// Establish from the first pre-key envelope of a peer, decrypting it.
    /// If a session already exists under `id` the envelope goes through it.
    /// Nothing is registered and no pre-key is consumed unless decryption
    /// succeeds.
    pub fn establish_from_message(
        &self,
        identity: &Arc<IdentityKeyPair>,
        prekeys: &PreKeyPool,
        id: &str,
        envelope: &[u8],
    ) -> Result<(CryptoSession, Vec<u8>)> {
        validate_session_id(id)?;
        let envelope = Envelope::from_bytes(envelope)?;
        let Envelope::PreKey(message) = &envelope else {
            return Err(Error::InvalidMessage("expected a pre-key message"));
        };

        let entry = self.sessions.entry(id.to_string());
        let existing = match live_handle(&entry) {
            Some(live) => Some(live),
            None => self.load_persisted(identity, id)?,
        };
        if let Some(existing) = existing {
            let plaintext = existing.decrypt_envelope(&envelope)?;
            entry.insert(existing.clone());
            return Ok((existing, plaintext));
        }

        let pool = prekeys.lock();
        let prekey = pool.load(message.prekey_id)?.ok_or(Error::OutdatedMessage)?;
        let (session, plaintext) =
            Session::init_from_prekey_message(Arc::clone(identity), message, &prekey, &self.config)?;
        pool.consume(prekey.id)?;
        drop(pool);

        info!(session = %id, prekey_id = prekey.id, "accepted session");
        let handle = self.handle(id, session);
        entry.insert(handle.clone());
        Ok((handle, plaintext))
    }

    /// Close the live instance under `id`, if any.
    pub fn close(&self, id: &str) {
        if let Some((_, handle)) = self.sessions.remove(id) {
            handle.close();
            debug!(session = %id, "closed session");
        }
    }

    pub fn close_all(&self) {
        for handle in self.sessions.iter() {
            handle.close();
        }
        self.sessions.clear();
    }

    /// Remove a session from memory and from the store. Removing an
    /// unknown session is not an error.
    pub fn delete(&self, id: &str) -> Result<()> {
        validate_session_id(id)?;
        let entry = self.sessions.entry(id.to_string());
        // Closing waits for a save in progress on this session, so the
        // record cannot be written back after it is removed.
        if let Entry::Occupied(live) = &entry {
            live.get().close();
        }
        self.storage.delete(&session_key(id))?;
        if let Entry::Occupied(live) = entry {
            live.remove();
        }
        info!(session = %id, "deleted session");
        Ok(())
    }

    /// Identifiers of all persisted sessions, sorted.
    pub fn ids(&self) -> Result<Vec<String>> {
        Ok(self
            .storage
            .list(SESSION_PREFIX)?
            .into_iter()
            .map(|key| key[SESSION_PREFIX.len()..].to_string())
            .collect())
    }

    /// Number of sessions currently held in memory.
    pub fn live_count(&self) -> usize {
        self.sessions.iter().filter(|h| !h.is_closed()).count()
    }

    /// Close everything and delete every persisted session.
    pub(crate) fn purge(&self) -> Result<usize> {
        self.close_all();
        let keys = self.storage.list(SESSION_PREFIX)?;
        for key in &keys {
            self.storage.delete(key)?;
        }
        Ok(keys.len())
    }
}

/// The handle in `entry` unless it has been closed.
fn live_handle(entry: &Entry<'_, String, CryptoSession>) -> Option<CryptoSession> {
    match entry {
        Entry::Occupied(e) if !e.get().is_closed() => Some(e.get().clone()),
        _ => None,
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::io;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    struct Side {
        identity: Arc<IdentityKeyPair>,
        prekeys: PreKeyPool,
        registry: SessionRegistry,
    }

    fn side() -> Side {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        Side {
            identity: Arc::new(IdentityKeyPair::generate()),
            prekeys: PreKeyPool::new(Arc::clone(&storage)),
            registry: SessionRegistry::new(storage, Arc::new(BoxConfig::default())),
        }
    }

    fn connect(alice: &Side, bob: &Side) -> (CryptoSession, CryptoSession) {
        let bundle = bob.prekeys.generate(&bob.identity, 0, 1).unwrap().remove(0);
        let a = alice
            .registry
            .establish_from_bundle(&alice.identity, "bob", &bundle)
            .unwrap();
        let hello = a.encrypt(b"hello").unwrap();
        let (b, plaintext) = bob
            .registry
            .establish_from_message(&bob.identity, &bob.prekeys, "alice", &hello)
            .unwrap();
        assert_eq!(plaintext, b"hello");
        (a, b)
    }

    #[test]
    fn session_id_validation() {
        let longest = "x".repeat(MAX_SESSION_ID_LEN);
        let too_long = "x".repeat(MAX_SESSION_ID_LEN + 1);
        for good in ["alice", "alice@example.org", "peer-1_device.2", longest.as_str()] {
            assert!(validate_session_id(good).is_ok(), "{good}");
        }
        for bad in ["", ".hidden", "..", "a/b", "a\\b", "nul\0", too_long.as_str()] {
            assert!(matches!(validate_session_id(bad), Err(Error::InvalidSessionId(_))), "{bad:?}");
        }
    }

    #[test]
    fn at_most_one_live_instance() {
        let (alice, bob) = (side(), side());
        let (a, _) = connect(&alice, &bob);

        let again = alice.registry.load(&alice.identity, "bob").unwrap();
        assert!(Arc::ptr_eq(&a.inner, &again.inner));

        let bundle = bob.prekeys.last_resort(&bob.identity).unwrap();
        let reinit = alice
            .registry
            .establish_from_bundle(&alice.identity, "bob", &bundle)
            .unwrap();
        assert!(Arc::ptr_eq(&a.inner, &reinit.inner));
        assert_eq!(alice.registry.live_count(), 1);
    }

    #[test]
    fn load_missing_session() {
        let alice = side();
        assert!(matches!(
            alice.registry.load(&alice.identity, "nobody"),
            Err(Error::SessionNotFound(_))
        ));
        assert!(alice.registry.try_load(&alice.identity, "nobody").unwrap().is_none());
    }

    #[test]
    fn failed_establishment_registers_nothing() {
        let (alice, bob) = (side(), side());
        let bundle = bob.prekeys.generate(&bob.identity, 3, 1).unwrap().remove(0);
        let a = alice
            .registry
            .establish_from_bundle(&alice.identity, "bob", &bundle)
            .unwrap();
        let mut hello = a.encrypt(b"hello").unwrap();
        let last = hello.len() - 1;
        hello[last] ^= 0x01;

        let result = bob
            .registry
            .establish_from_message(&bob.identity, &bob.prekeys, "alice", &hello);
        assert!(matches!(result, Err(Error::Crypto(_))));
        assert_eq!(bob.registry.live_count(), 0);
        assert_eq!(bob.prekeys.ids().unwrap(), vec![3]);
    }

    #[test]
    fn cipher_envelope_cannot_establish() {
        let (alice, bob) = (side(), side());
        let (a, b) = connect(&alice, &bob);
        let reply = b.encrypt(b"reply").unwrap();
        a.decrypt(&reply).unwrap();
        let plain = a.encrypt(b"plain").unwrap();

        let carol = side();
        assert!(matches!(
            carol
                .registry
                .establish_from_message(&carol.identity, &carol.prekeys, "alice", &plain),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn save_close_and_reload() {
        let (alice, bob) = (side(), side());
        let (a, b) = connect(&alice, &bob);
        b.save().unwrap();
        bob.registry.close("alice");
        assert!(b.is_closed());
        assert!(matches!(b.encrypt(b"x"), Err(Error::SessionClosed)));

        let reloaded = bob.registry.load(&bob.identity, "alice").unwrap();
        let m = a.encrypt(b"after reload").unwrap();
        assert_eq!(reloaded.decrypt(&m).unwrap(), b"after reload");
        assert_eq!(bob.registry.ids().unwrap(), vec!["alice".to_string()]);
    }

    #[test]
    fn handle_close_then_load_restores() {
        let (alice, bob) = (side(), side());
        let (a, _) = connect(&alice, &bob);
        a.save().unwrap();
        a.close();

        let fresh = alice.registry.load(&alice.identity, "bob").unwrap();
        assert!(!fresh.is_closed());
        assert!(!Arc::ptr_eq(&a.inner, &fresh.inner));
    }

    #[test]
    fn delete_is_idempotent_and_closes() {
        let (alice, bob) = (side(), side());
        let (a, _) = connect(&alice, &bob);
        a.save().unwrap();

        alice.registry.delete("bob").unwrap();
        alice.registry.delete("bob").unwrap();
        assert!(a.is_closed());
        assert!(alice.registry.ids().unwrap().is_empty());
        assert!(alice.registry.try_load(&alice.identity, "bob").unwrap().is_none());
    }

    /// Memory storage whose session writes announce themselves and then
    /// stall, leaving a window for a concurrent delete.
    struct StallingStorage {
        inner: MemoryStorage,
        writing: Mutex<mpsc::Sender<()>>,
    }

    impl Storage for StallingStorage {
        fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn put(&self, key: &str, value: &[u8]) -> io::Result<()> {
            if key.starts_with(SESSION_PREFIX) {
                let _ = self.writing.lock().unwrap().send(());
                thread::sleep(Duration::from_millis(200));
            }
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
    fn delete_during_save_stays_deleted() {
        let alice = side();
        let (writing, started) = mpsc::channel();
        let storage: Arc<dyn Storage> = Arc::new(StallingStorage {
            inner: MemoryStorage::new(),
            writing: Mutex::new(writing),
        });
        let bob = Side {
            identity: Arc::new(IdentityKeyPair::generate()),
            prekeys: PreKeyPool::new(Arc::clone(&storage)),
            registry: SessionRegistry::new(storage, Arc::new(BoxConfig::default())),
        };
        let (_, b) = connect(&alice, &bob);

        let saver = thread::spawn(move || b.save());
        started.recv().unwrap();
        bob.registry.delete("alice").unwrap();

        assert!(saver.join().unwrap().is_ok());
        assert!(bob.registry.ids().unwrap().is_empty());
        assert_eq!(bob.registry.live_count(), 0);
        assert!(bob.registry.try_load(&bob.identity, "alice").unwrap().is_none());
    }

    #[test]
    fn drop_closes_live_sessions() {
        let (alice, bob) = (side(), side());
        let (a, _) = connect(&alice, &bob);
        drop(alice);
        assert!(matches!(a.encrypt(b"late"), Err(Error::SessionClosed)));
    }
}

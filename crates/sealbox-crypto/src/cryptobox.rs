//! The store facade: one identity, its pre-key pool and its sessions.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use sealbox_protocol::{PreKeyBundle, PreKeyId};

use crate::config::BoxConfig;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::identity::IdentityKeyPair;
use crate::prekey::PreKeyPool;
use crate::registry::{CryptoSession, SessionRegistry};
use crate::storage::{FileStorage, Storage, IDENTITY_KEY};

/// What to do when importing an identity into a store that already has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Refuse unless the stored identity is the one being imported.
    FailIfPresent,
    /// Replace the identity and discard all sessions and pre-keys.
    OverwriteExisting,
    /// Replace the identity but keep existing sessions. Pre-keys are
    /// discarded since their bundles name the old identity.
    MigratePreserveSessions,
}

pub struct CryptoBox {
    identity: Arc<IdentityKeyPair>,
    prekeys: PreKeyPool,
    sessions: SessionRegistry,
    config: Arc<BoxConfig>,
}

impl CryptoBox {
    /// Open the file store at `path`, creating it and its identity if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, BoxConfig::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: BoxConfig) -> Result<Self> {
        let storage = FileStorage::open(path.as_ref())?;
        Self::open_with_storage(Arc::new(storage), config)
    }

    pub fn open_with_storage(storage: Arc<dyn Storage>, config: BoxConfig) -> Result<Self> {
        let identity = match load_identity(storage.as_ref())? {
            Some(identity) => identity,
            None => {
                let identity = IdentityKeyPair::generate();
                storage.put(IDENTITY_KEY, &identity.to_bytes()?)?;
                info!(fingerprint = %identity.fingerprint(), "generated new identity");
                identity
            }
        };
        info!(fingerprint = %identity.fingerprint(), "opened store");
        Ok(Self::assemble(storage, identity, config))
    }

    /// Open the file store at `path` with an identity exported by
    /// [`CryptoBox::copy_identity`].
    pub fn open_with_identity(
        path: impl AsRef<Path>,
        identity: &[u8],
        mode: ImportMode,
    ) -> Result<Self> {
        let storage = FileStorage::open(path.as_ref())?;
        Self::open_with_identity_in(Arc::new(storage), identity, mode, BoxConfig::default())
    }

    pub fn open_with_identity_in(
        storage: Arc<dyn Storage>,
        identity: &[u8],
        mode: ImportMode,
        config: BoxConfig,
    ) -> Result<Self> {
        let imported = IdentityKeyPair::from_bytes(identity)?;

        let replacing = match storage.get(IDENTITY_KEY)? {
            None => false,
            Some(stored) => match (mode, IdentityKeyPair::from_bytes(&stored)) {
                (_, Ok(existing)) if existing.same_as(&imported) => {
                    return Ok(Self::assemble(storage, imported, config));
                }
                (ImportMode::FailIfPresent, Ok(_)) => {
                    return Err(Error::IdentityError(
                        "store already holds a different identity".into(),
                    ));
                }
                (ImportMode::FailIfPresent, Err(e)) => {
                    return Err(Error::corrupt(IDENTITY_KEY, e));
                }
                _ => true,
            },
        };

        storage.put(IDENTITY_KEY, &imported.to_bytes()?)?;
        let cbox = Self::assemble(storage, imported, config);
        if replacing {
            let prekeys = cbox.prekeys.purge()?;
            let sessions = match mode {
                ImportMode::OverwriteExisting => cbox.sessions.purge()?,
                _ => 0,
            };
            warn!(?mode, prekeys, sessions, "replaced stored identity");
        }
        info!(fingerprint = %cbox.local_fingerprint(), ?mode, "imported identity");
        Ok(cbox)
    }

    fn assemble(storage: Arc<dyn Storage>, identity: IdentityKeyPair, config: BoxConfig) -> Self {
        let config = Arc::new(config);
        Self {
            identity: Arc::new(identity),
            prekeys: PreKeyPool::new(Arc::clone(&storage)),
            sessions: SessionRegistry::new(storage, Arc::clone(&config)),
            config,
        }
    }

    pub fn config(&self) -> &BoxConfig {
        &self.config
    }

    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    pub fn local_fingerprint(&self) -> Fingerprint {
        self.identity.fingerprint()
    }

    /// Export the identity, private key included.
    pub fn copy_identity(&self) -> Result<Vec<u8>> {
        self.identity.to_bytes()
    }

    /// Generate `count` pre-keys starting at `start`, wrapping before the
    /// last-resort id.
    pub fn new_prekeys(&self, start: PreKeyId, count: u16) -> Result<Vec<PreKeyBundle>> {
        self.prekeys.generate(&self.identity, start, count)
    }

    pub fn new_last_resort_prekey(&self) -> Result<PreKeyBundle> {
        self.prekeys.last_resort(&self.identity)
    }

    pub fn prekey_ids(&self) -> Result<Vec<PreKeyId>> {
        self.prekeys.ids()
    }

    /// Start a session under `session_id` from a peer's encoded bundle.
    pub fn init_from_bundle(&self, session_id: &str, bundle: &[u8]) -> Result<CryptoSession> {
        let bundle = PreKeyBundle::from_bytes(bundle)?;
        self.sessions
            .establish_from_bundle(&self.identity, session_id, &bundle)
    }

    /// Accept a session from a peer's first message, returning the session
    /// and the decrypted message.
    pub fn init_from_message(
        &self,
        session_id: &str,
        envelope: &[u8],
    ) -> Result<(CryptoSession, Vec<u8>)> {
        self.sessions
            .establish_from_message(&self.identity, &self.prekeys, session_id, envelope)
    }

    pub fn load_session(&self, session_id: &str) -> Result<CryptoSession> {
        self.sessions.load(&self.identity, session_id)
    }

    pub fn try_load_session(&self, session_id: &str) -> Result<Option<CryptoSession>> {
        self.sessions.try_load(&self.identity, session_id)
    }

    pub fn save_session(&self, session: &CryptoSession) -> Result<()> {
        session.save()
    }

    pub fn close_session(&self, session_id: &str) {
        self.sessions.close(session_id);
    }

    pub fn close_all_sessions(&self) {
        self.sessions.close_all();
    }

    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        self.sessions.delete(session_id)
    }

    /// Identifiers of all saved sessions.
    pub fn session_ids(&self) -> Result<Vec<String>> {
        self.sessions.ids()
    }

    /// Close the box. Every live session handle becomes closed.
    pub fn close(self) {
        self.sessions.close_all();
        info!("closed box");
    }
}

fn load_identity(storage: &dyn Storage) -> Result<Option<IdentityKeyPair>> {
    match storage.get(IDENTITY_KEY)? {
        None => Ok(None),
        Some(bytes) => IdentityKeyPair::from_bytes(&bytes)
            .map(Some)
            .map_err(|e| Error::corrupt(IDENTITY_KEY, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn memory_box() -> (Arc<dyn Storage>, CryptoBox) {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let cbox = CryptoBox::open_with_storage(Arc::clone(&storage), BoxConfig::default()).unwrap();
        (storage, cbox)
    }

    #[test]
    fn identity_is_created_once() {
        let (storage, cbox) = memory_box();
        let fp = cbox.local_fingerprint();
        drop(cbox);
        let reopened = CryptoBox::open_with_storage(storage, BoxConfig::default()).unwrap();
        assert_eq!(reopened.local_fingerprint(), fp);
    }

    #[test]
    fn corrupt_identity_reported() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        storage.put(IDENTITY_KEY, b"not an identity").unwrap();
        let err = CryptoBox::open_with_storage(storage, BoxConfig::default()).err().unwrap();
        assert!(matches!(err, Error::StorageCorrupt { ref key, .. } if key == IDENTITY_KEY));
    }

    #[test]
    fn import_rejects_malformed_bytes() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let err = CryptoBox::open_with_identity_in(storage, b"junk", ImportMode::FailIfPresent, BoxConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::IdentityError(_)));
    }

    #[test]
    fn import_same_identity_keeps_state() {
        let (storage, cbox) = memory_box();
        cbox.new_prekeys(0, 3).unwrap();
        let exported = cbox.copy_identity().unwrap();
        drop(cbox);

        let cbox = CryptoBox::open_with_identity_in(
            storage,
            &exported,
            ImportMode::OverwriteExisting,
            BoxConfig::default(),
        )
        .unwrap();
        assert_eq!(cbox.prekey_ids().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn copy_identity_roundtrip() {
        let (_, cbox) = memory_box();
        let exported = cbox.copy_identity().unwrap();
        let fresh: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let other =
            CryptoBox::open_with_identity_in(fresh, &exported, ImportMode::FailIfPresent, BoxConfig::default())
                .unwrap();
        assert_eq!(other.local_fingerprint(), cbox.local_fingerprint());
    }

    #[test]
    fn degenerate_bundle_key_rejected() {
        let (_, cbox) = memory_box();
        let (_, peer) = memory_box();
        let mut bundle = peer.new_last_resort_prekey().unwrap();
        bundle.prekey = [0u8; 32];
        assert!(matches!(
            cbox.init_from_bundle("peer", &bundle.to_bytes()),
            Err(Error::Proto(_))
        ));
        assert!(cbox.try_load_session("peer").unwrap().is_none());
    }

    #[test]
    fn invalid_session_id_rejected() {
        let (_, cbox) = memory_box();
        let bundle = cbox.new_last_resort_prekey().unwrap().to_bytes();
        assert!(matches!(
            cbox.init_from_bundle("../escape", &bundle),
            Err(Error::InvalidSessionId(_))
        ));
        assert!(matches!(cbox.load_session(""), Err(Error::InvalidSessionId(_))));
    }
}

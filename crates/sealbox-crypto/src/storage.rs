//! Persistent store interface and its two implementations.
//!
//! Keys are `/`-separated strings such as `identity`, `prekeys/42` or
//! `sessions/alice`. A store exclusively owns its namespace for as long as
//! the box that opened it is alive.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use sealbox_protocol::PreKeyId;

/// Key of the identity record.
pub const IDENTITY_KEY: &str = "identity";
/// Prefix under which pre-key records live.
pub const PREKEY_PREFIX: &str = "prekeys/";
/// Prefix under which session records live.
pub const SESSION_PREFIX: &str = "sessions/";

pub fn prekey_key(id: PreKeyId) -> String {
    format!("{PREKEY_PREFIX}{id}")
}

pub fn session_key(session_id: &str) -> String {
    format!("{SESSION_PREFIX}{session_id}")
}

/// Durable key-value storage underneath a box.
///
/// `put` must be atomic: after a crash a key holds either its old or its new
/// value, never a partial write.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> io::Result<()>;
    /// Removing an absent key is not an error.
    fn delete(&self, key: &str) -> io::Result<()>;
    /// All keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> io::Result<Vec<String>>;
}

// ── File storage ────────────────────────────────────────────────────────

/// One file per key below a root directory.
pub struct FileStorage {
    root: PathBuf,
}

fn invalid_key(key: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("invalid storage key {key:?}"))
}

impl FileStorage {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> io::Result<PathBuf> {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            // Leading dots are reserved for temp files.
            if segment.is_empty() || segment.starts_with('.') || segment.contains(['\\', '\0']) {
                return Err(invalid_key(key));
            }
            path.push(segment);
        }
        Ok(path)
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)?) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> io::Result<()> {
        let path = self.path_for(key)?;
        let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
            return Err(invalid_key(key));
        };
        fs::create_dir_all(dir)?;

        // A crash leaves either the old record or the new one.
        let tmp = dir.join(format!(".{}.tmp", name.to_string_lossy()));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(value)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        sync_dir(dir)
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        let (dir_key, name_prefix) = match prefix.rfind('/') {
            Some(i) => (&prefix[..i], &prefix[i + 1..]),
            None => ("", prefix),
        };
        let dir = if dir_key.is_empty() {
            self.root.clone()
        } else {
            self.path_for(dir_key)?
        };

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.starts_with(name_prefix) {
                continue;
            }
            if dir_key.is_empty() {
                keys.push(name);
            } else {
                keys.push(format!("{dir_key}/{name}"));
            }
        }
        keys.sort();
        Ok(keys)
    }
}

// ── In-memory storage ───────────────────────────────────────────────────

/// Storage kept in process memory. Useful for tests and for embedders that
/// persist the whole map themselves.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> io::Result<MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "memory storage lock poisoned"))
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> io::Result<()> {
        self.entries()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        self.entries()?.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        Ok(self
            .entries()?
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

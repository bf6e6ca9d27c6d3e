//! Durable small-value map shared by every cooperating process of the same
//! security group.
//!
//! Each key is one file under `<container>/kv/`. Writes go through a unique
//! temporary file followed by an atomic rename, so concurrent writers of the
//! same key can never interleave partial contents, and a value another
//! process reads is always one that some writer fully wrote. Serialization
//! of read-modify-write sequences (counter increments) is *not* provided
//! here; callers that need it hold the process coordinator's advisory lock.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid shared-store key '{0}'")]
    InvalidKey(String),
    #[error("malformed value under '{key}': {reason}")]
    Malformed { key: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Cross-process durable key-value store.
///
/// When the shared container is unavailable (simulator, sandbox
/// misconfiguration) the store degrades to a process-local map: every
/// operation keeps working, but nothing is visible to the other process.
/// Layers above consult [`SharedStore::is_degraded`] and disable
/// cross-process features rather than crash.
pub struct SharedStore {
    backend: Backend,
}

enum Backend {
    Disk { root: PathBuf },
    Memory { map: Mutex<HashMap<String, Vec<u8>>> },
}

impl SharedStore {
    /// Open the store rooted at `<container>/kv`, probing that the container
    /// is actually writable. On probe failure a process-local store is
    /// returned and a single warning is emitted.
    pub fn open(container: &Path) -> Self {
        let root = container.join("kv");
        match Self::probe(&root) {
            Ok(()) => Self {
                backend: Backend::Disk { root },
            },
            Err(error) => {
                tracing::warn!(
                    ?root,
                    %error,
                    "shared container unavailable; falling back to process-local store"
                );
                Self {
                    backend: Backend::Memory {
                        map: Mutex::new(HashMap::new()),
                    },
                }
            }
        }
    }

    /// A store that never touches disk. Used by tests and by explicit
    /// single-process configurations.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory {
                map: Mutex::new(HashMap::new()),
            },
        }
    }

    fn probe(root: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(root)?;
        // create_dir_all can succeed on a read-only volume that already has
        // the directory; only a real write proves the container works.
        let probe = tempfile::NamedTempFile::new_in(root)?;
        probe.as_file().write_all(b"probe")?;
        Ok(())
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.backend, Backend::Memory { .. })
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = valid_key(key)?;
        match &self.backend {
            Backend::Disk { root } => match std::fs::read(root.join(key)) {
                Ok(bytes) => Ok(Some(bytes)),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err.into()),
            },
            Backend::Memory { map } => Ok(map.lock().unwrap().get(key).cloned()),
        }
    }

    pub fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let key = valid_key(key)?;
        match &self.backend {
            Backend::Disk { root } => {
                let mut tmp = tempfile::NamedTempFile::new_in(root)?;
                tmp.write_all(value)?;
                tmp.as_file().sync_all()?;
                tmp.persist(root.join(key)).map_err(|err| err.error)?;
                Ok(())
            }
            Backend::Memory { map } => {
                map.lock().unwrap().insert(key.to_string(), value.to_vec());
                Ok(())
            }
        }
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let key = valid_key(key)?;
        match &self.backend {
            Backend::Disk { root } => match std::fs::remove_file(root.join(key)) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            },
            Backend::Memory { map } => {
                map.lock().unwrap().remove(key);
                Ok(())
            }
        }
    }

    /// All keys starting with `prefix`, in unspecified order.
    pub fn enumerate(&self, prefix: &str) -> Result<Vec<String>> {
        match &self.backend {
            Backend::Disk { root } => {
                let mut keys = Vec::new();
                for entry in std::fs::read_dir(root)? {
                    let entry = entry?;
                    let name = match entry.file_name().into_string() {
                        Ok(name) => name,
                        Err(_) => continue,
                    };
                    // Skip in-progress temp files.
                    if !entry.file_type()?.is_file() || !name.starts_with(prefix) {
                        continue;
                    }
                    if valid_key(&name).is_ok() {
                        keys.push(name);
                    }
                }
                Ok(keys)
            }
            Backend::Memory { map } => Ok(map
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect()),
        }
    }

    /// Make prior writes visible to other processes. Renames are already
    /// atomic; this additionally syncs the directory entry itself.
    pub fn flush(&self) -> Result<()> {
        match &self.backend {
            Backend::Disk { root } => {
                std::fs::File::open(root)?.sync_all()?;
                Ok(())
            }
            Backend::Memory { .. } => Ok(()),
        }
    }

    // Typed accessors over the raw byte values. Numbers are stored as ASCII
    // decimal so values stay inspectable with plain shell tools.

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        self.get_parsed(key)
    }

    pub fn set_u64(&self, key: &str, value: u64) -> Result<()> {
        self.set(key, value.to_string().as_bytes())
    }

    pub fn get_f64(&self, key: &str) -> Result<Option<f64>> {
        self.get_parsed(key)
    }

    pub fn set_f64(&self, key: &str, value: f64) -> Result<()> {
        self.set(key, value.to_string().as_bytes())
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        self.get_parsed(key)
    }

    pub fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.set(key, value.to_string().as_bytes())
    }

    pub fn get_string(&self, key: &str) -> Result<Option<String>> {
        match self.get(key)? {
            None => Ok(None),
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| Error::Malformed {
                    key: key.to_string(),
                    reason: "not valid UTF-8".to_string(),
                }),
        }
    }

    pub fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.set(key, value.as_bytes())
    }

    /// Decode a JSON record previously written with [`SharedStore::set_json`].
    pub fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|err| Error::Malformed {
                    key: key.to_string(),
                    reason: err.to_string(),
                }),
        }
    }

    pub fn set_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(|err| Error::Malformed {
            key: key.to_string(),
            reason: err.to_string(),
        })?;
        self.set(key, &bytes)
    }

    fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get_string(key)? {
            None => Ok(None),
            Some(text) => text.trim().parse().map(Some).map_err(|_| Error::Malformed {
                key: key.to_string(),
                reason: format!("cannot parse '{text}'"),
            }),
        }
    }
}

/// Keys are used directly as file names: a dotted lower-case alphabet with
/// no path separators or leading dots.
fn valid_key(key: &str) -> Result<&str> {
    let ok = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(key)
    } else {
        Err(Error::InvalidKey(key.to_string()))
    }
}

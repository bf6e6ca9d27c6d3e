//! Monotonic per-user state versions over the shared store.
//!
//! Every successful decryption bumps the user's version (and a global
//! counter) on disk, which is how a process discovers that its cached MLS
//! context no longer matches shared storage. Versions only increase; a
//! consumer holding `memory_version` must reload whenever
//! `disk_version > memory_version`.

use coordinator::{ExclusiveAccess, ProcessCoordinator};
use ids::UserDid;
use shared_store::SharedStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

const USER_VERSION_PREFIX: &str = "mls_state_version.";
const GLOBAL_VERSION_KEY: &str = "mls_global_state_version";

/// How long an out-of-scope `increment` may wait for the advisory lock.
const INCREMENT_LOCK_TIMEOUT: Duration = Duration::from_secs(3);

/// Capacity of the in-process change bus. The bus is best-effort: a lagging
/// receiver loses the oldest events, never the newest.
const BUS_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] shared_store::Error),
    #[error(transparent)]
    Coordination(#[from] coordinator::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// In-process notification that a user's version changed.
#[derive(Debug, Clone)]
pub struct VersionChange {
    pub user: UserDid,
    pub version: u64,
}

pub struct StateVersionManager {
    store: Arc<SharedStore>,
    process: Arc<ProcessCoordinator>,
    /// Last version this process observed per user, for `has_changed`.
    last_known: Mutex<HashMap<UserDid, u64>>,
    bus: broadcast::Sender<VersionChange>,
}

impl StateVersionManager {
    pub fn new(store: Arc<SharedStore>, process: Arc<ProcessCoordinator>) -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            store,
            process,
            last_known: Mutex::new(HashMap::new()),
            bus,
        }
    }

    fn user_key(user: &UserDid) -> String {
        format!("{USER_VERSION_PREFIX}{}", user.storage_hash())
    }

    /// The user's current on-disk version; zero when never written.
    pub fn disk_version(&self, user: &UserDid) -> Result<u64> {
        Ok(self.store.get_u64(&Self::user_key(user))?.unwrap_or(0))
    }

    pub fn global_version(&self) -> Result<u64> {
        Ok(self.store.get_u64(GLOBAL_VERSION_KEY)?.unwrap_or(0))
    }

    /// Bump the user's version under the cross-process advisory lock.
    ///
    /// If the lock cannot be taken before the deadline, the current value is
    /// returned *without* incrementing: producing a version nobody wrote
    /// would poison staleness checks, while skipping the bump merely delays
    /// invalidation until the actual writer publishes.
    pub async fn increment(&self, user: &UserDid) -> Result<u64> {
        let out: Result<u64> = self
            .process
            .perform_exclusive(user, INCREMENT_LOCK_TIMEOUT, || self.bump(user))
            .await;
        match out {
            Err(Error::Coordination(coordinator::Error::LockBusy(_))) => {
                tracing::warn!(user = %user, "version increment skipped: advisory lock busy");
                self.disk_version(user)
            }
            other => other,
        }
    }

    /// Bump from inside an exclusive-access scope, which already holds the
    /// advisory lock for this user.
    pub fn increment_held(&self, access: &ExclusiveAccess) -> Result<u64> {
        self.bump(access.user())
    }

    fn bump(&self, user: &UserDid) -> Result<u64> {
        let next = self.disk_version(user)?.saturating_add(1);
        self.store.set_u64(&Self::user_key(user), next)?;

        let global = self.global_version()?.saturating_add(1);
        self.store.set_u64(GLOBAL_VERSION_KEY, global)?;
        self.store.flush()?;

        self.last_known.lock().unwrap().insert(user.clone(), next);
        let _ = self.bus.send(VersionChange {
            user: user.clone(),
            version: next,
        });
        tracing::debug!(user = %user, version = next, "state version advanced");
        Ok(next)
    }

    /// Overwrite the user's version. Used by restore paths; does not touch
    /// the global counter.
    pub fn set(&self, user: &UserDid, version: u64) -> Result<()> {
        self.store.set_u64(&Self::user_key(user), version)?;
        self.store.flush()?;
        self.last_known.lock().unwrap().insert(user.clone(), version);
        Ok(())
    }

    /// Record the current disk version as this process's last-known value.
    pub fn sync_last_known(&self, user: &UserDid) -> Result<u64> {
        let version = self.disk_version(user)?;
        self.last_known.lock().unwrap().insert(user.clone(), version);
        Ok(version)
    }

    /// Whether a context loaded at `memory_version` is out of date.
    pub fn is_stale(&self, user: &UserDid, memory_version: u64) -> Result<bool> {
        Ok(self.disk_version(user)? > memory_version)
    }

    /// Whether the disk version moved since this process last looked.
    /// Updates the last-known cache as a side effect.
    pub fn has_changed(&self, user: &UserDid) -> Result<bool> {
        let version = self.disk_version(user)?;
        let previous = self
            .last_known
            .lock()
            .unwrap()
            .insert(user.clone(), version);
        Ok(previous != Some(version))
    }

    pub fn clear(&self, user: &UserDid) -> Result<()> {
        self.store.remove(&Self::user_key(user))?;
        self.store.flush()?;
        self.last_known.lock().unwrap().remove(user);
        Ok(())
    }

    pub fn clear_all(&self) -> Result<()> {
        for key in self.store.enumerate(USER_VERSION_PREFIX)? {
            self.store.remove(&key)?;
        }
        self.store.remove(GLOBAL_VERSION_KEY)?;
        self.store.flush()?;
        self.last_known.lock().unwrap().clear();
        Ok(())
    }

    /// Subscribe to in-process version changes. Best-effort: receivers that
    /// lag past the bus capacity observe only the most recent events.
    pub fn subscribe(&self) -> broadcast::Receiver<VersionChange> {
        self.bus.subscribe()
    }
}

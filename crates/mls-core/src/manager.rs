use crate::activity::ActivityFlag;
use crate::external::{DecryptedMessage, MessageStore, MlsProvider, MlsSession, SecretStore, StoreAccess};
use crate::{Error, Result};
use coordinator::{AccessCoordinator, ExclusiveAccess, Purpose};
use handshake::Doorbell;
use ids::UserDid;
use state_version::StateVersionManager;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Deadline for read-only scoped queries (epoch, member count).
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-user cache of MLS engine sessions, invalidated by state version.
///
/// A cached session loaded at version `v` stays valid while
/// `disk_version(user) <= v`; the moment the other process publishes a
/// newer version the session is flushed, closed, and reloaded from disk.
/// Everything that mutates the cache runs inside the owning user's
/// exclusive-access scope and proves it with an [`ExclusiveAccess`] token.
pub struct ContextManager {
    state_dir: PathBuf,
    provider: Arc<dyn MlsProvider>,
    messages: Arc<dyn MessageStore>,
    secrets: Arc<dyn SecretStore>,
    access: AccessCoordinator,
    versions: Arc<StateVersionManager>,
    doorbell: Arc<Doorbell>,
    activity: ActivityFlag,
    contexts: Mutex<HashMap<UserDid, CachedContext>>,
    /// Message-ids being decrypted by some task of this process right now.
    pub(crate) in_flight: Mutex<HashMap<String, watch::Receiver<InFlightOutcome>>>,
}

pub(crate) type InFlightOutcome = Option<Result<DecryptedMessage>>;

#[derive(Clone)]
struct CachedContext {
    session: Arc<dyn MlsSession>,
    loaded_version: u64,
    mode: StoreAccess,
}

impl ContextManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        container: &std::path::Path,
        provider: Arc<dyn MlsProvider>,
        messages: Arc<dyn MessageStore>,
        secrets: Arc<dyn SecretStore>,
        access: AccessCoordinator,
        versions: Arc<StateVersionManager>,
        doorbell: Arc<Doorbell>,
        activity: ActivityFlag,
    ) -> Self {
        Self {
            state_dir: container.join("mls-state"),
            provider,
            messages,
            secrets,
            access,
            versions,
            doorbell,
            activity,
            contexts: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn access(&self) -> &AccessCoordinator {
        &self.access
    }

    pub(crate) fn versions(&self) -> &StateVersionManager {
        &self.versions
    }

    pub(crate) fn messages(&self) -> &Arc<dyn MessageStore> {
        &self.messages
    }

    pub(crate) fn doorbell(&self) -> &Doorbell {
        &self.doorbell
    }

    /// Path of this user's MLS database. Interoperability contract shared
    /// with every other producer (see [`UserDid::db_file_stem`]).
    pub fn db_path(&self, user: &UserDid) -> PathBuf {
        self.state_dir.join(format!("{}.db", user.db_file_stem()))
    }

    /// Cached session for the scope's user, reloading from disk when the
    /// cached copy is stale or was opened under a different access mode.
    pub async fn get_context(
        &self,
        access: &ExclusiveAccess,
        mode: StoreAccess,
    ) -> Result<Arc<dyn MlsSession>> {
        let user = access.user();
        let disk = self.versions.disk_version(user)?;

        let cached = { self.contexts.lock().unwrap().get(user).cloned() };
        if let Some(cached) = cached {
            if cached.loaded_version >= disk && cached.mode == mode {
                return Ok(cached.session);
            }
            tracing::debug!(
                user = %user,
                loaded = cached.loaded_version,
                disk,
                "dropping stale context"
            );
            self.contexts.lock().unwrap().remove(user);
            if let Err(error) = cached.session.flush_and_close().await {
                tracing::warn!(user = %user, %error, "stale context did not close cleanly");
            }
        }

        self.open_context(user, disk, mode).await
    }

    /// Like [`ContextManager::get_context`], but first evicts every cached
    /// context belonging to a different user. Called on paths that may
    /// follow an account switch, so a stale account can never serve a
    /// decryption.
    pub async fn ensure_context(
        &self,
        access: &ExclusiveAccess,
        mode: StoreAccess,
    ) -> Result<Arc<dyn MlsSession>> {
        let user = access.user();
        let evicted: Vec<(UserDid, CachedContext)> = {
            let mut contexts = self.contexts.lock().unwrap();
            let users: Vec<UserDid> = contexts
                .keys()
                .filter(|cached| *cached != user)
                .cloned()
                .collect();
            users
                .into_iter()
                .filter_map(|u| contexts.remove(&u).map(|c| (u, c)))
                .collect()
        };
        for (evicted_user, cached) in evicted {
            tracing::info!(user = %evicted_user, "evicting context after account switch");
            if let Err(error) = cached.session.flush_and_close().await {
                tracing::warn!(user = %evicted_user, %error, "evicted context did not close cleanly");
            }
        }

        self.get_context(access, mode).await
    }

    async fn open_context(
        &self,
        user: &UserDid,
        disk_version: u64,
        mode: StoreAccess,
    ) -> Result<Arc<dyn MlsSession>> {
        let key = self
            .secrets
            .read(user.as_str())
            .await?
            .ok_or_else(|| Error::MissingDatabaseKey(user.to_string()))?;
        // Hex, byte-identical with the encoding other producers use to open
        // the same file; anything else fails silently at open.
        let key_hex = hex::encode(key);

        let session = self
            .provider
            .open(&self.db_path(user), &key_hex, mode)
            .await?;

        self.contexts.lock().unwrap().insert(
            user.clone(),
            CachedContext {
                session: session.clone(),
                loaded_version: disk_version,
                mode,
            },
        );
        self.versions.sync_last_known(user)?;
        tracing::debug!(user = %user, version = disk_version, "context loaded");
        Ok(session)
    }

    /// Record that the scope's user advanced to `version` (after this
    /// process itself published it), keeping the cached context current.
    pub(crate) fn note_context_version(&self, user: &UserDid, version: u64) {
        if let Some(cached) = self.contexts.lock().unwrap().get_mut(user) {
            cached.loaded_version = version;
        }
    }

    pub fn has_context(&self, user: &UserDid) -> bool {
        self.contexts.lock().unwrap().contains_key(user)
    }

    /// Close and drop the scope's user's context (logout path).
    pub async fn remove_context(&self, access: &ExclusiveAccess) -> Result<()> {
        let cached = { self.contexts.lock().unwrap().remove(access.user()) };
        if let Some(cached) = cached {
            cached.session.flush_and_close().await?;
        }
        Ok(())
    }

    /// Teardown path: close every cached context. Runs outside any scope,
    /// so it must only be called while no operations are in flight.
    pub async fn clear_all_contexts(&self) {
        let drained: Vec<(UserDid, CachedContext)> = {
            self.contexts.lock().unwrap().drain().collect()
        };
        for (user, cached) in drained {
            if let Err(error) = cached.session.flush_and_close().await {
                tracing::warn!(user = %user, %error, "context did not close cleanly at teardown");
            }
        }
    }

    /// Whether the cached context (if any) lags the on-disk version.
    pub fn is_context_stale(&self, user: &UserDid) -> Result<bool> {
        let loaded = {
            self.contexts
                .lock()
                .unwrap()
                .get(user)
                .map(|cached| cached.loaded_version)
        };
        match loaded {
            Some(loaded) => Ok(self.versions.is_stale(user, loaded)?),
            None => Ok(false),
        }
    }

    /// Non-blocking probe of the user's cross-process advisory lock.
    pub fn is_lock_available(&self, user: &UserDid) -> bool {
        self.access.probe_storage_gate(user)
    }

    /// Whether work for `user` should route to the ephemeral pool because
    /// the foreground is live for a different user.
    pub fn should_use_ephemeral_access(&self, user: &UserDid) -> bool {
        self.activity.should_use_ephemeral(user)
    }

    /// Stored plaintext for `message_id`, if any process already decrypted
    /// it. Pure read; requires no exclusivity.
    pub async fn get_cached_plaintext(
        &self,
        user: &UserDid,
        message_id: &str,
    ) -> Result<Option<DecryptedMessage>> {
        Ok(self
            .messages
            .fetch_plaintext(user, message_id, StoreAccess::Standard)
            .await?)
    }

    /// Current epoch of `group_id`, from a fresh-enough context.
    pub async fn get_current_epoch(&self, user: &UserDid, group_id: &[u8]) -> Result<u64> {
        let access = self.access.clone();
        access
            .with_exclusive(user, Purpose::Other, QUERY_TIMEOUT, |scope| async move {
                let session = self.get_context(&scope, StoreAccess::Standard).await?;
                session.current_epoch(group_id).await.map_err(Error::from)
            })
            .await
    }

    pub async fn get_member_count(&self, user: &UserDid, group_id: &[u8]) -> Result<u32> {
        let access = self.access.clone();
        access
            .with_exclusive(user, Purpose::Other, QUERY_TIMEOUT, |scope| async move {
                let session = self.get_context(&scope, StoreAccess::Standard).await?;
                session.member_count(group_id).await.map_err(Error::from)
            })
            .await
    }
}

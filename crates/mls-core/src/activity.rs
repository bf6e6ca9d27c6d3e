//! Shared record of whether the foreground app is active, and for whom.
//!
//! Advisory only: the worker consults it to *decline* work the foreground
//! will do anyway, never to establish exclusivity. A crashed foreground
//! stops refreshing the record, and past the staleness horizon the worker
//! resumes decrypting on its own.

use ids::UserDid;
use shared_store::SharedStore;
use std::sync::Arc;
use std::time::Duration;

const IS_ACTIVE_KEY: &str = "mls_main_app_is_active";
const ACTIVE_USER_KEY: &str = "mls_main_app_active_user_did";
const UPDATED_AT_KEY: &str = "mls_main_app_activity_updated_at";

/// A record older than this is ignored, as crash-recovery fallback.
const STALENESS_HORIZON: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct ActivitySnapshot {
    pub is_active: bool,
    pub active_user: Option<UserDid>,
    pub updated_at: f64,
}

impl ActivitySnapshot {
    pub fn is_fresh(&self) -> bool {
        ids::epoch_seconds() - self.updated_at <= STALENESS_HORIZON.as_secs_f64()
    }
}

#[derive(Clone)]
pub struct ActivityFlag {
    store: Arc<SharedStore>,
}

impl ActivityFlag {
    pub fn new(store: Arc<SharedStore>) -> Self {
        Self { store }
    }

    /// Foreground side: refresh the record. Call on activation, on user
    /// switch, and periodically while active.
    pub fn publish(
        &self,
        is_active: bool,
        active_user: Option<&UserDid>,
    ) -> Result<(), shared_store::Error> {
        self.store.set_bool(IS_ACTIVE_KEY, is_active)?;
        match active_user {
            Some(user) => self.store.set_string(ACTIVE_USER_KEY, user.as_str())?,
            None => self.store.remove(ACTIVE_USER_KEY)?,
        }
        self.store.set_f64(UPDATED_AT_KEY, ids::epoch_seconds())?;
        self.store.flush()
    }

    pub fn snapshot(&self) -> Result<Option<ActivitySnapshot>, shared_store::Error> {
        let Some(updated_at) = self.store.get_f64(UPDATED_AT_KEY)? else {
            return Ok(None);
        };
        Ok(Some(ActivitySnapshot {
            is_active: self.store.get_bool(IS_ACTIVE_KEY)?.unwrap_or(false),
            active_user: self.store.get_string(ACTIVE_USER_KEY)?.map(UserDid::new),
            updated_at,
        }))
    }

    /// Worker side: should this process skip decrypting for `user` because
    /// the foreground is actively handling that same user?
    pub fn worker_should_yield(&self, user: &UserDid) -> bool {
        match self.snapshot() {
            Ok(Some(snapshot)) => {
                snapshot.is_fresh()
                    && snapshot.is_active
                    && snapshot.active_user.as_ref() == Some(user)
            }
            Ok(None) => false,
            Err(error) => {
                tracing::debug!(%error, "activity record unreadable; not yielding");
                false
            }
        }
    }

    /// Whether work for `user` should run against the ephemeral pool: the
    /// foreground is live for a *different* user, and touching the standard
    /// pool would contend with that user's write-ahead log.
    pub fn should_use_ephemeral(&self, user: &UserDid) -> bool {
        match self.snapshot() {
            Ok(Some(snapshot)) => {
                snapshot.is_fresh()
                    && snapshot.is_active
                    && snapshot
                        .active_user
                        .as_ref()
                        .map(|active| active != user)
                        .unwrap_or(false)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn flag() -> ActivityFlag {
        ActivityFlag::new(Arc::new(SharedStore::in_memory()))
    }

    fn alice() -> UserDid {
        UserDid::new("did:plc:alice")
    }

    #[test]
    fn test_publish_and_snapshot() {
        let flag = flag();
        assert!(flag.snapshot().unwrap().is_none());

        flag.publish(true, Some(&alice())).unwrap();
        let snapshot = flag.snapshot().unwrap().unwrap();
        assert!(snapshot.is_active);
        assert_eq!(snapshot.active_user, Some(alice()));
        assert!(snapshot.is_fresh());
    }

    #[test]
    fn test_worker_yields_only_for_the_active_user() {
        let flag = flag();
        flag.publish(true, Some(&alice())).unwrap();

        assert!(flag.worker_should_yield(&alice()));
        assert!(!flag.worker_should_yield(&UserDid::new("did:plc:bob")));

        flag.publish(false, Some(&alice())).unwrap();
        assert!(!flag.worker_should_yield(&alice()));
    }

    #[test]
    fn test_ephemeral_access_for_non_active_user() {
        let flag = flag();
        flag.publish(true, Some(&alice())).unwrap();

        assert!(!flag.should_use_ephemeral(&alice()));
        assert!(flag.should_use_ephemeral(&UserDid::new("did:plc:bob")));
    }

    #[test]
    fn test_stale_record_is_ignored() {
        let flag = flag();
        flag.publish(true, Some(&alice())).unwrap();

        // Age the record past the horizon by rewriting its timestamp.
        flag.store
            .set_f64(UPDATED_AT_KEY, ids::epoch_seconds() - 301.0)
            .unwrap();

        assert!(!flag.worker_should_yield(&alice()));
        assert!(!flag
            .should_use_ephemeral(&UserDid::new("did:plc:bob")));
        assert!(!flag.snapshot().unwrap().unwrap().is_fresh());
    }
}

use crate::Error;
use coordinator::ProcessCoordinator;
use ids::UserDid;
use rand::Rng;
use shared_store::SharedStore;
use std::sync::Arc;
use std::time::Duration;

const COUNTER_PREFIX: &str = "mls_handshake_counter.";
const REQUEST_PREFIX: &str = "mls_handshake_request.";
const ACK_PREFIX: &str = "mls_handshake_ack.";

/// How long token issuance may wait for the advisory lock before falling
/// back to an unlocked advance.
const ISSUE_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// `wait_for_ack` polling: starts at 20 ms, doubles to a 200 ms cap, with
/// up to 30 ms of jitter per iteration.
const ACK_POLL_FLOOR: Duration = Duration::from_millis(20);
const ACK_POLL_CEIL: Duration = Duration::from_millis(200);
const ACK_POLL_JITTER_MS: u64 = 30;

/// A pending quiesce request from the worker process.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WillCloseRequest {
    #[serde(rename = "userDID")]
    pub user: UserDid,
    pub token: u64,
    #[serde(rename = "createdAt")]
    pub created_at: f64,
}

/// The latest token the foreground process has acknowledged. Monotonic: a
/// higher token implicitly covers every lower one.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Acknowledgment {
    #[serde(rename = "userDID")]
    pub user: UserDid,
    pub token: u64,
    #[serde(rename = "acknowledgedAt")]
    pub acknowledged_at: f64,
}

pub struct HandshakeStore {
    store: Arc<SharedStore>,
    process: Arc<ProcessCoordinator>,
}

impl HandshakeStore {
    pub fn new(store: Arc<SharedStore>, process: Arc<ProcessCoordinator>) -> Self {
        Self { store, process }
    }

    fn counter_key(user: &UserDid) -> String {
        format!("{COUNTER_PREFIX}{}", user.storage_hash())
    }
    fn request_key(user: &UserDid) -> String {
        format!("{REQUEST_PREFIX}{}", user.storage_hash())
    }
    fn ack_key(user: &UserDid) -> String {
        format!("{ACK_PREFIX}{}", user.storage_hash())
    }

    /// Mint the next token and persist a will-close request for it.
    ///
    /// The counter advance normally runs under the cross-process advisory
    /// lock. When the lock cannot be taken, the advance still happens
    /// unlocked: a token that might race with the other process is
    /// recoverable, a *reused* token that looks already-acknowledged is not.
    pub async fn issue_will_close(&self, user: &UserDid) -> crate::Result<WillCloseRequest> {
        let out: crate::Result<WillCloseRequest> = self
            .process
            .perform_exclusive(user, ISSUE_LOCK_TIMEOUT, || self.advance_and_persist(user))
            .await;
        match out {
            Err(Error::Coordination(coordinator::Error::LockBusy(_))) => {
                let request = self.advance_and_persist(user)?;
                tracing::warn!(
                    user = %user,
                    token = request.token,
                    "will-close token issued without cross-process lock"
                );
                Ok(request)
            }
            other => other,
        }
    }

    fn advance_and_persist(&self, user: &UserDid) -> crate::Result<WillCloseRequest> {
        let counter = self.store.get_u64(&Self::counter_key(user))?.unwrap_or(0);
        let token = counter.wrapping_add(1);
        self.store.set_u64(&Self::counter_key(user), token)?;

        let request = WillCloseRequest {
            user: user.clone(),
            token,
            created_at: ids::epoch_seconds(),
        };
        self.store.set_json(&Self::request_key(user), &request)?;
        self.store.flush()?;
        Ok(request)
    }

    /// Record that every token up to and including `token` is covered.
    pub fn acknowledge(&self, user: &UserDid, token: u64) -> crate::Result<Acknowledgment> {
        let existing = self.current_ack(user)?.map(|ack| ack.token).unwrap_or(0);
        let ack = Acknowledgment {
            user: user.clone(),
            token: existing.max(token),
            acknowledged_at: ids::epoch_seconds(),
        };
        self.store.set_json(&Self::ack_key(user), &ack)?;
        self.store.flush()?;
        Ok(ack)
    }

    pub fn current_request(&self, user: &UserDid) -> crate::Result<Option<WillCloseRequest>> {
        Ok(self.store.get_json(&Self::request_key(user))?)
    }

    pub fn current_ack(&self, user: &UserDid) -> crate::Result<Option<Acknowledgment>> {
        Ok(self.store.get_json(&Self::ack_key(user))?)
    }

    pub fn is_acknowledged(&self, user: &UserDid, token: u64) -> crate::Result<bool> {
        Ok(self
            .current_ack(user)?
            .map(|ack| ack.token >= token)
            .unwrap_or(false))
    }

    /// Every pending request across users. Malformed records are skipped
    /// with a warning rather than failing the scan.
    pub fn all_requests(&self) -> crate::Result<Vec<WillCloseRequest>> {
        let mut requests = Vec::new();
        for key in self.store.enumerate(REQUEST_PREFIX)? {
            match self.store.get_json::<WillCloseRequest>(&key) {
                Ok(Some(request)) => requests.push(request),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(key, %error, "skipping malformed will-close request");
                }
            }
        }
        Ok(requests)
    }

    pub fn clear_request(&self, user: &UserDid) -> crate::Result<()> {
        self.store.remove(&Self::request_key(user))?;
        Ok(())
    }

    pub fn clear_ack(&self, user: &UserDid) -> crate::Result<()> {
        self.store.remove(&Self::ack_key(user))?;
        Ok(())
    }

    /// Poll until `token` is acknowledged or `timeout` elapses. Returns
    /// `true` on acknowledgment, `false` on deadline. Every wait is an async
    /// sleep, so a cancelled caller stops at the next iteration with no side
    /// effects.
    pub async fn wait_for_ack(
        &self,
        user: &UserDid,
        token: u64,
        timeout: Duration,
    ) -> crate::Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut backoff = ACK_POLL_FLOOR;

        loop {
            if self.is_acknowledged(user, token)? {
                return Ok(true);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let jitter =
                Duration::from_millis(rand::thread_rng().gen_range(0..=ACK_POLL_JITTER_MS));
            tokio::time::sleep((backoff + jitter).min(deadline - now)).await;
            backoff = (backoff * 2).min(ACK_POLL_CEIL);
        }
    }
}

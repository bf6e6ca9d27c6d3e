use crate::Error;
use fs2::FileExt;
use ids::UserDid;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

/// Initial delay between advisory lock attempts.
const BACKOFF_FLOOR: Duration = Duration::from_millis(10);
/// Delays double per attempt up to this cap.
const BACKOFF_CEIL: Duration = Duration::from_millis(250);
/// Up to this much additional jitter per attempt.
const BACKOFF_JITTER_MS: u64 = 20;

/// Cross-process advisory lock, one lock file per user under
/// `<container>/locks/`.
///
/// The lock is kernel-mediated (`flock` semantics via fs2), so a process
/// that dies while holding it (including SIGKILL) releases it
/// automatically. Correctness depends on both processes acquiring it before
/// touching the user's on-disk MLS state; nothing stops a non-cooperating
/// writer.
pub struct ProcessCoordinator {
    root: PathBuf,
}

impl ProcessCoordinator {
    pub fn new(container: &Path) -> Self {
        Self {
            root: container.join("locks"),
        }
    }

    fn lock_path(&self, user: &UserDid) -> PathBuf {
        self.root.join(format!("{}.lock", user.storage_hash()))
    }

    /// Attempt the lock without blocking. `Ok(None)` means the other process
    /// holds it right now.
    pub fn try_acquire(&self, user: &UserDid) -> std::io::Result<Option<AdvisoryLockGuard>> {
        std::fs::create_dir_all(&self.root)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(self.lock_path(user))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(AdvisoryLockGuard { file })),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Acquire the lock, polling with exponential backoff until `timeout`
    /// expires. Returns [`Error::LockBusy`] on expiry; I/O errors propagate
    /// verbatim. Every wait is an async sleep, so callers may cancel at any
    /// attempt boundary.
    pub async fn acquire(
        &self,
        user: &UserDid,
        timeout: Duration,
    ) -> crate::Result<AdvisoryLockGuard> {
        let deadline = Instant::now() + timeout;
        let mut backoff = BACKOFF_FLOOR;

        loop {
            if let Some(guard) = self.try_acquire(user)? {
                return Ok(guard);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::LockBusy(user.to_string()));
            }

            let jitter =
                Duration::from_millis(rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS));
            tokio::time::sleep((backoff + jitter).min(deadline - now)).await;
            backoff = (backoff * 2).min(BACKOFF_CEIL);
        }
    }

    /// Run `f` while holding the user's advisory lock. The guard is dropped
    /// on every exit path, including when `f` fails.
    pub async fn perform_exclusive<T, E, F>(
        &self,
        user: &UserDid,
        timeout: Duration,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<Error>,
    {
        let guard = self.acquire(user, timeout).await?;
        let out = f();
        drop(guard);
        out
    }

    /// Whether the lock could be taken right now. I/O trouble reads as
    /// "unavailable" so callers back off rather than proceed uncoordinated.
    pub fn is_available(&self, user: &UserDid) -> bool {
        match self.try_acquire(user) {
            Ok(guard) => guard.is_some(),
            Err(error) => {
                tracing::debug!(user = %user, %error, "advisory lock probe failed");
                false
            }
        }
    }
}

/// Held advisory lock. Dropping it releases the kernel lock.
#[derive(Debug)]
pub struct AdvisoryLockGuard {
    file: std::fs::File,
}

impl Drop for AdvisoryLockGuard {
    fn drop(&mut self) {
        // Closing the descriptor would release the lock anyway; unlocking
        // explicitly keeps the release visible at a deterministic point.
        let _ = self.file.unlock();
    }
}

use crate::Error;
use ids::UserDid;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Process-local serializer: at most one [`OperationPermit`] is live per
/// user, and outstanding acquirers queue FIFO.
///
/// All map mutation happens under a non-async lock which is never held
/// across an await point; waiting itself is a plain `oneshot` receive, so
/// there is no lost-wakeup window. A waiter whose future is dropped closes
/// its channel and is skipped during hand-off.
#[derive(Clone)]
pub struct UserCoordinator {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
}

#[derive(Default, Debug)]
struct State {
    /// Live permit instance per user.
    owners: HashMap<UserDid, u64>,
    /// FIFO queues of suspended acquirers.
    waiters: HashMap<UserDid, VecDeque<Waiter>>,
    next_instance: u64,
    next_waiter: u64,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    tx: oneshot::Sender<OperationPermit>,
}

/// Proof of exclusive process-local access for one user. Dropping the
/// permit releases it and hands off to the head of the queue.
#[derive(Debug)]
pub struct OperationPermit {
    user: UserDid,
    instance_id: u64,
    inner: Arc<Inner>,
    armed: bool,
}

impl OperationPermit {
    pub fn user(&self) -> &UserDid {
        &self.user
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }
}

impl Drop for OperationPermit {
    fn drop(&mut self) {
        if self.armed {
            Inner::release(&self.inner, &self.user, self.instance_id);
        }
    }
}

impl Default for UserCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl UserCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Acquire the user's permit, suspending for as long as it takes.
    pub async fn acquire(&self, user: &UserDid) -> crate::Result<OperationPermit> {
        let rx = match self.acquire_or_enqueue(user) {
            Enqueued::Granted(permit) => return Ok(permit),
            Enqueued::Waiting { rx, .. } => rx,
        };
        // Closure means the coordinator itself was torn down mid-wait.
        rx.await.map_err(|_| Error::Cancelled)
    }

    /// Acquire with a deadline. On expiry the waiter removes itself and the
    /// caller gets [`Error::PermitTimeout`]; a permit that raced into the
    /// closed channel is dropped there, which hands it to the next waiter.
    pub async fn acquire_timed(
        &self,
        user: &UserDid,
        timeout: Duration,
    ) -> crate::Result<OperationPermit> {
        let (rx, waiter_id) = match self.acquire_or_enqueue(user) {
            Enqueued::Granted(permit) => return Ok(permit),
            Enqueued::Waiting { rx, waiter_id } => (rx, waiter_id),
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_closed)) => Err(Error::Cancelled),
            Err(_elapsed) => {
                // The receiver was just dropped by `timeout`, so hand-off can
                // no longer reach us; pull the stale queue entry eagerly.
                self.remove_waiter(user, waiter_id);
                Err(Error::PermitTimeout(user.to_string()))
            }
        }
    }

    /// Whether a permit is currently live for the user.
    pub fn is_held(&self, user: &UserDid) -> bool {
        self.inner.state.lock().unwrap().owners.contains_key(user)
    }

    fn acquire_or_enqueue(&self, user: &UserDid) -> Enqueued {
        let mut state = self.inner.state.lock().unwrap();

        if !state.owners.contains_key(user) {
            let instance_id = state.next_instance;
            state.next_instance += 1;
            state.owners.insert(user.clone(), instance_id);
            return Enqueued::Granted(OperationPermit {
                user: user.clone(),
                instance_id,
                inner: self.inner.clone(),
                armed: true,
            });
        }

        let waiter_id = state.next_waiter;
        state.next_waiter += 1;
        let (tx, rx) = oneshot::channel();
        state
            .waiters
            .entry(user.clone())
            .or_default()
            .push_back(Waiter { id: waiter_id, tx });
        Enqueued::Waiting { rx, waiter_id }
    }

    fn remove_waiter(&self, user: &UserDid, waiter_id: u64) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(queue) = state.waiters.get_mut(user) {
            queue.retain(|w| w.id != waiter_id);
            if queue.is_empty() {
                state.waiters.remove(user);
            }
        }
    }
}

enum Enqueued {
    Granted(OperationPermit),
    Waiting {
        rx: oneshot::Receiver<OperationPermit>,
        waiter_id: u64,
    },
}

impl Inner {
    /// Release by the `(user, instance_id)` owner, handing the fresh permit
    /// to the first waiter still listening.
    fn release(inner: &Arc<Inner>, user: &UserDid, instance_id: u64) {
        let mut state = inner.state.lock().unwrap();

        match state.owners.get(user) {
            Some(current) if *current == instance_id => {}
            // Not the current owner: stale double-release, ignore.
            _ => return,
        }

        loop {
            let waiter = match state.waiters.get_mut(user).and_then(VecDeque::pop_front) {
                Some(waiter) => waiter,
                None => {
                    state.waiters.remove(user);
                    state.owners.remove(user);
                    return;
                }
            };

            let next_instance = state.next_instance;
            state.next_instance += 1;
            state.owners.insert(user.clone(), next_instance);

            let permit = OperationPermit {
                user: user.clone(),
                instance_id: next_instance,
                inner: inner.clone(),
                armed: true,
            };
            match waiter.tx.send(permit) {
                Ok(()) => return,
                // Receiver gone (cancelled or timed out). Disarm the
                // returned permit so its Drop does not re-enter this lock,
                // and offer the next waiter instead.
                Err(mut unclaimed) => unclaimed.armed = false,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn user() -> UserDid {
        UserDid::new("did:plc:alice")
    }

    #[tokio::test]
    async fn test_grant_and_release() {
        let coordinator = UserCoordinator::new();

        let permit = coordinator.acquire(&user()).await.unwrap();
        assert!(coordinator.is_held(&user()));
        drop(permit);
        assert!(!coordinator.is_held(&user()));
    }

    #[tokio::test]
    async fn test_waiters_resume_in_fifo_order() {
        let coordinator = UserCoordinator::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let head = coordinator.acquire(&user()).await.unwrap();

        let mut handles = Vec::new();
        for n in 0..4 {
            let coordinator = coordinator.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let permit = coordinator.acquire(&user()).await.unwrap();
                order.lock().unwrap().push(n);
                drop(permit);
            }));
            // Give each task time to enqueue before spawning the next.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drop(head);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_at_most_one_permit_live() {
        let coordinator = UserCoordinator::new();
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let coordinator = coordinator.clone();
            let live = live.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let permit = coordinator.acquire(&user()).await.unwrap();
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                live.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timed_acquire_expires() {
        let coordinator = UserCoordinator::new();

        let held = coordinator.acquire(&user()).await.unwrap();
        let err = coordinator
            .acquire_timed(&user(), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermitTimeout(_)));

        // The expired waiter never receives a permit later.
        drop(held);
        let fresh = coordinator.acquire_timed(&user(), Duration::from_millis(30)).await;
        assert!(fresh.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_skipped() {
        let coordinator = UserCoordinator::new();

        let held = coordinator.acquire(&user()).await.unwrap();

        // First waiter is dropped before it can be resumed.
        let cancelled = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let _ = coordinator.acquire(&user()).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancelled.abort();
        let _ = cancelled.await;

        // Second waiter must still be resumed on release.
        let second = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.acquire(&user()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(held);
        let permit = tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .unwrap()
            .unwrap();
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn test_users_do_not_contend() {
        let coordinator = UserCoordinator::new();

        let _alice = coordinator.acquire(&UserDid::new("did:plc:alice")).await.unwrap();
        let bob = coordinator
            .acquire_timed(&UserDid::new("did:plc:bob"), Duration::from_millis(50))
            .await;
        assert!(bob.is_ok());
    }
}

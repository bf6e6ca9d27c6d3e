use crate::activity::ActivityFlag;
use crate::external::{MessageStore, MlsProvider, SecretStore};
use crate::manager::ContextManager;
use crate::Result;
use coordinator::{AccessCoordinator, ProcessCoordinator};
use handshake::{Channel, Doorbell, HandshakeStore, QuiesceListener, WillCloseRequest};
use ids::UserDid;
use shared_store::SharedStore;
use state_version::StateVersionManager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub struct CoreConfig {
    /// Shared container directory visible to both processes.
    pub container: PathBuf,
    pub provider: Arc<dyn MlsProvider>,
    pub messages: Arc<dyn MessageStore>,
    pub secrets: Arc<dyn SecretStore>,
}

/// The root object wiring the coordination components together.
///
/// Each process constructs exactly one of these at startup and passes it by
/// reference; there are no process-global singletons, and tests build a
/// fresh root per case over a temporary container.
pub struct CoordinationCore {
    store: Arc<SharedStore>,
    process: Arc<ProcessCoordinator>,
    access: AccessCoordinator,
    versions: Arc<StateVersionManager>,
    handshake: Arc<HandshakeStore>,
    doorbell: Arc<Doorbell>,
    activity: ActivityFlag,
    contexts: Arc<ContextManager>,
}

impl CoordinationCore {
    pub fn new(config: CoreConfig) -> Self {
        let store = Arc::new(SharedStore::open(&config.container));
        let process = Arc::new(ProcessCoordinator::new(&config.container));
        let access = AccessCoordinator::new(process.clone());
        let versions = Arc::new(StateVersionManager::new(store.clone(), process.clone()));
        let handshake = Arc::new(HandshakeStore::new(store.clone(), process.clone()));
        let doorbell = Arc::new(Doorbell::new(&config.container));
        let activity = ActivityFlag::new(store.clone());
        let contexts = Arc::new(ContextManager::new(
            &config.container,
            config.provider,
            config.messages,
            config.secrets,
            access.clone(),
            versions.clone(),
            doorbell.clone(),
            activity.clone(),
        ));

        Self {
            store,
            process,
            access,
            versions,
            handshake,
            doorbell,
            activity,
            contexts,
        }
    }

    /// Begin observing doorbell rings. Call once per process, inside the
    /// runtime.
    pub fn start(&self) {
        self.doorbell.start();
    }

    /// Close every cached context and stop background observation.
    pub async fn shutdown(&self) {
        self.contexts.clear_all_contexts().await;
        self.doorbell.stop();
    }

    /// Whether cross-process coordination is live. False when the shared
    /// container is unavailable and the store degraded to process-local
    /// mode; locks and versions then only protect tasks of this process.
    pub fn cross_process_enabled(&self) -> bool {
        !self.store.is_degraded()
    }

    /// Worker side of the quiesce handshake: persist a will-close request
    /// and ring the foreground.
    pub async fn post_will_close(&self, user: &UserDid) -> Result<WillCloseRequest> {
        let request = self.handshake.issue_will_close(user).await?;
        if let Err(error) = self.doorbell.post(Channel::NseWillClose) {
            tracing::debug!(%error, "will-close ring failed");
        }
        Ok(request)
    }

    /// Await the foreground's acknowledgment of `token`.
    pub async fn wait_for_ack(
        &self,
        user: &UserDid,
        token: u64,
        timeout: Duration,
    ) -> Result<bool> {
        Ok(self.handshake.wait_for_ack(user, token, timeout).await?)
    }

    /// Foreground side of the handshake: drive `handler` off debounced
    /// will-close rings. The listener stops when dropped.
    pub fn spawn_quiesce_listener<H, Fut>(&self, handler: H) -> QuiesceListener
    where
        H: Fn(WillCloseRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        QuiesceListener::spawn(self.handshake.clone(), self.doorbell.clone(), handler)
    }

    pub fn shared_store(&self) -> &Arc<SharedStore> {
        &self.store
    }

    pub fn process_coordinator(&self) -> &Arc<ProcessCoordinator> {
        &self.process
    }

    pub fn access(&self) -> &AccessCoordinator {
        &self.access
    }

    pub fn state_versions(&self) -> &Arc<StateVersionManager> {
        &self.versions
    }

    pub fn handshake(&self) -> &Arc<HandshakeStore> {
        &self.handshake
    }

    pub fn doorbell(&self) -> &Arc<Doorbell> {
        &self.doorbell
    }

    pub fn activity(&self) -> &ActivityFlag {
        &self.activity
    }

    pub fn contexts(&self) -> &Arc<ContextManager> {
        &self.contexts
    }
}

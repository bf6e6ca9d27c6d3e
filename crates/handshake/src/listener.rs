use crate::{Channel, Doorbell, HandshakeStore, WillCloseRequest};
use ids::UserDid;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Bursts of will-close rings within this window collapse into one pass.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(75);

/// Foreground-process driver of the quiesce discipline.
///
/// On each (debounced) `nse_will_close` ring: read every pending request,
/// coalesce per user to the highest token, skip tokens already covered by
/// the current ack, and hand the rest to the caller's handler. A handler
/// returning `true` means this process released its readers for that user;
/// only then is the token acknowledged and `app_acknowledged` posted.
pub struct QuiesceListener {
    token: CancellationToken,
}

impl QuiesceListener {
    pub fn spawn<H, Fut>(
        store: Arc<HandshakeStore>,
        doorbell: Arc<Doorbell>,
        handler: H,
    ) -> Self
    where
        H: Fn(WillCloseRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let token = CancellationToken::new();
        let rx = doorbell.subscribe();
        tokio::spawn(listen_loop(store, doorbell, rx, handler, token.clone()));
        Self { token }
    }

    pub fn stop(&self) {
        self.token.cancel();
    }
}

impl Drop for QuiesceListener {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn listen_loop<H, Fut>(
    store: Arc<HandshakeStore>,
    doorbell: Arc<Doorbell>,
    mut rx: tokio::sync::broadcast::Receiver<crate::DoorbellEvent>,
    handler: H,
    token: CancellationToken,
) where
    H: Fn(WillCloseRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return,
            event = rx.recv() => event,
        };
        match event {
            Ok(event) if event.channel == Channel::NseWillClose => {}
            Ok(_) => continue,
            // Lagged: rings were coalesced for us; fall through to a pass.
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }

        // Debounce: let the burst finish, then drain whatever queued up so
        // the whole burst is handled by this single pass.
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(DEBOUNCE_WINDOW) => {}
        }
        while rx.try_recv().is_ok() {}

        if let Err(error) = run_pass(&store, &doorbell, &handler).await {
            tracing::warn!(%error, "will-close handling pass failed");
        }
    }
}

async fn run_pass<H, Fut>(
    store: &HandshakeStore,
    doorbell: &Doorbell,
    handler: &H,
) -> crate::Result<()>
where
    H: Fn(WillCloseRequest) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    // Coalesce to the highest token per user; a later request supersedes
    // earlier ones.
    let mut pending: HashMap<UserDid, WillCloseRequest> = HashMap::new();
    for request in store.all_requests()? {
        match pending.get(&request.user) {
            Some(existing) if existing.token >= request.token => {}
            _ => {
                pending.insert(request.user.clone(), request);
            }
        }
    }

    for (user, request) in pending {
        if store.is_acknowledged(&user, request.token)? {
            continue;
        }
        let token = request.token;
        if handler(request).await {
            store.acknowledge(&user, token)?;
            if let Err(error) = doorbell.post(Channel::AppAcknowledged) {
                tracing::debug!(%error, "acknowledgment ring failed");
            }
            tracing::debug!(user = %user, token, "will-close request acknowledged");
        } else {
            tracing::debug!(user = %user, token, "will-close request declined");
        }
    }
    Ok(())
}

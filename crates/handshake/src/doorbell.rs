use rand::Rng;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How often the poller re-reads the nonce files.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Capacity of the event bus; lagging receivers drop the oldest events.
const BUS_CAPACITY: usize = 32;

/// The three doorbell channels. A ring carries no payload: its only
/// semantic is "check the shared store".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Some user's state version advanced.
    StateChanged,
    /// The worker process posted a will-close request.
    NseWillClose,
    /// The foreground process acknowledged a request.
    AppAcknowledged,
}

impl Channel {
    pub const ALL: [Channel; 3] = [
        Channel::StateChanged,
        Channel::NseWillClose,
        Channel::AppAcknowledged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::StateChanged => "state_changed",
            Channel::NseWillClose => "nse_will_close",
            Channel::AppAcknowledged => "app_acknowledged",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DoorbellEvent {
    pub channel: Channel,
    pub received_at: std::time::Instant,
}

/// Best-effort cross-process signal bus.
///
/// Each channel is a nonce file under `<container>/doorbell/`; posting
/// rewrites the nonce, and a background poller in the receiving process
/// broadcasts an event whenever a nonce differs from the last one seen.
/// Delivery is coalescing by construction (several posts between two polls
/// surface as one event) and may spuriously repeat. Nothing may gate
/// correctness on receiving a ring.
pub struct Doorbell {
    root: PathBuf,
    bus: tokio::sync::broadcast::Sender<DoorbellEvent>,
    poller: Mutex<Option<CancellationToken>>,
}

impl Doorbell {
    pub fn new(container: &Path) -> Self {
        let (bus, _) = tokio::sync::broadcast::channel(BUS_CAPACITY);
        Self {
            root: container.join("doorbell"),
            bus,
            poller: Mutex::new(None),
        }
    }

    /// Ring `channel`. Failures are returned but callers treat posting as
    /// best-effort; the persisted handshake state is what matters.
    pub fn post(&self, channel: Channel) -> crate::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        let nonce = format!(
            "{}-{:016x}",
            std::process::id(),
            rand::thread_rng().gen::<u64>()
        );
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(nonce.as_bytes())?;
        tmp.persist(self.root.join(channel.as_str()))
            .map_err(|err| crate::Error::Io(err.error))?;
        tracing::trace!(channel = channel.as_str(), "doorbell posted");
        Ok(())
    }

    /// Subscribe to rings observed by this process's poller. Call
    /// [`Doorbell::start`] once per process to begin observing.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DoorbellEvent> {
        self.bus.subscribe()
    }

    /// Start the background poller. Idempotent. Must be called from within
    /// a tokio runtime.
    pub fn start(&self) {
        let mut poller = self.poller.lock().unwrap();
        if poller.is_some() {
            return;
        }
        let token = CancellationToken::new();
        tokio::spawn(poll_loop(
            self.root.clone(),
            self.bus.clone(),
            token.clone(),
        ));
        *poller = Some(token);
    }

    /// Stop the background poller. Subscribers see the bus stay silent.
    pub fn stop(&self) {
        if let Some(token) = self.poller.lock().unwrap().take() {
            token.cancel();
        }
    }
}

impl Drop for Doorbell {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_loop(
    root: PathBuf,
    bus: tokio::sync::broadcast::Sender<DoorbellEvent>,
    token: CancellationToken,
) {
    // Prime with the current nonces so pre-existing rings don't fire.
    let mut seen: HashMap<Channel, Option<String>> = Channel::ALL
        .iter()
        .map(|&channel| (channel, read_nonce(&root, channel)))
        .collect();

    let mut interval = tokio::time::interval(POLL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = interval.tick() => {}
        }

        for &channel in Channel::ALL.iter() {
            let nonce = read_nonce(&root, channel);
            let previous = seen.insert(channel, nonce.clone()).flatten();
            if nonce.is_some() && nonce != previous {
                let _ = bus.send(DoorbellEvent {
                    channel,
                    received_at: std::time::Instant::now(),
                });
                tracing::trace!(channel = channel.as_str(), "doorbell ring observed");
            }
        }
    }
}

fn read_nonce(root: &Path, channel: Channel) -> Option<String> {
    std::fs::read_to_string(root.join(channel.as_str())).ok()
}

//! Tokenized quiesce handshake between the worker and foreground processes.
//!
//! Before one process checkpoints shared MLS storage it must know the other
//! has released its readers. The worker persists a [`WillCloseRequest`]
//! carrying a fresh monotonic token, rings the [`Doorbell`], and polls for
//! an [`Acknowledgment`] covering that token. Only the persisted records
//! carry meaning; doorbell signals are best-effort nudges to go look.

mod doorbell;
mod listener;
mod store;

pub use doorbell::{Channel, Doorbell, DoorbellEvent};
pub use listener::QuiesceListener;
pub use store::{Acknowledgment, HandshakeStore, WillCloseRequest};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] shared_store::Error),
    #[error(transparent)]
    Coordination(#[from] coordinator::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

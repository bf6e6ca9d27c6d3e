//! Cross-process coordination core for a shared MLS ratchet.
//!
//! A foreground app and a short-lived notification worker may both receive
//! the same ciphertext and both can advance the ratchet living in shared
//! on-disk storage. Forward secrecy makes uncoordinated decryption
//! destructive: the first process consumes and destroys the message key,
//! the second observes secret reuse and the conversation wedges. This crate
//! wires the coordination substrate that prevents it (per-user exclusive
//! scopes, state versioning for stale caches, a tokenized quiesce
//! handshake) around an idempotent decrypt-and-store pipeline.
//!
//! The MLS engine, the encrypted message store, and the secret store are
//! consumed through the traits in [`external`]; this crate never touches
//! key material beyond handing a key to the engine.

mod activity;
mod envelope;
mod external;
mod manager;
mod pipeline;
mod root;

pub use activity::{ActivityFlag, ActivitySnapshot};
pub use root::{CoordinationCore, CoreConfig};
pub use external::{
    Decrypted, DecryptedMessage, EngineError, MessageStore, MlsProvider, MlsSession,
    SavePlaintext, SecretError, SecretStore, StoreAccess, StoreError,
};
pub use manager::ContextManager;
pub use pipeline::{sender_from_credential, DecryptRequest};

/// Boundary errors of the coordination core. Cloneable so an outcome can be
/// fanned out to every task waiting on the same in-flight decryption.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("cross-process lock is busy for {0}")]
    LockBusy(String),
    #[error("timed out waiting for the per-user permit of {0}")]
    PermitTimeout(String),
    #[error("timed out waiting for the cross-process advisory lock of {0}")]
    AdvisoryLockTimeout(String),
    #[error("operation was cancelled")]
    Cancelled,
    #[error("sender credential is not a did: identity")]
    InvalidCredential,
    /// The engine reported secret reuse and no stored plaintext exists.
    /// The message cannot be produced; retrying would not help.
    #[error("secret already consumed for message {0}; skipping")]
    SecretReuseSkipped(String),
    #[error("no database key stored for {0}")]
    MissingDatabaseKey(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Secrets(#[from] SecretError),
    #[error("shared store error: {0}")]
    SharedStore(std::sync::Arc<shared_store::Error>),
    #[error("i/o error: {0}")]
    Io(std::sync::Arc<std::io::Error>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<coordinator::Error> for Error {
    fn from(error: coordinator::Error) -> Self {
        match error {
            coordinator::Error::LockBusy(user) => Error::LockBusy(user),
            coordinator::Error::PermitTimeout(user) => Error::PermitTimeout(user),
            coordinator::Error::AdvisoryLockTimeout(user) => Error::AdvisoryLockTimeout(user),
            coordinator::Error::Cancelled => Error::Cancelled,
            coordinator::Error::Io(error) => Error::Io(std::sync::Arc::new(error)),
        }
    }
}

impl From<shared_store::Error> for Error {
    fn from(error: shared_store::Error) -> Self {
        Error::SharedStore(std::sync::Arc::new(error))
    }
}

impl From<state_version::Error> for Error {
    fn from(error: state_version::Error) -> Self {
        match error {
            state_version::Error::Store(error) => error.into(),
            state_version::Error::Coordination(error) => error.into(),
        }
    }
}

impl From<handshake::Error> for Error {
    fn from(error: handshake::Error) -> Self {
        match error {
            handshake::Error::Store(error) => error.into(),
            handshake::Error::Coordination(error) => error.into(),
            handshake::Error::Io(error) => Error::Io(std::sync::Arc::new(error)),
        }
    }
}

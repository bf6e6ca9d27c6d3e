//! Interfaces of the collaborators this core drives but does not own: the
//! MLS engine, the encrypted message store, and the per-user secret store.
//! Everything behind these traits keeps its own schema, pooling, and
//! cryptography; the core only sequences the calls.

use async_trait::async_trait;
use ids::UserDid;
use std::path::Path;
use std::sync::Arc;

/// Which database pool a store operation should run against.
///
/// `Ephemeral` opens the file without checkpointing and without registering
/// in any shared pool cache, so decrypting for one user never disturbs
/// another user's active write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAccess {
    Standard,
    Ephemeral,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// The message key for this ciphertext was already consumed. Under
    /// forward secrecy this is unrecoverable at the engine level; the
    /// pipeline decides whether a stored plaintext makes it benign.
    #[error("message secret was already consumed")]
    SecretReuse,
    #[error("secret tree entry is missing")]
    SecretTree,
    #[error(transparent)]
    Other(Arc<anyhow::Error>),
}

impl From<anyhow::Error> for EngineError {
    fn from(error: anyhow::Error) -> Self {
        EngineError::Other(Arc::new(error))
    }
}

/// Output of a successful engine decryption.
#[derive(Debug, Clone)]
pub struct Decrypted {
    pub plaintext: Vec<u8>,
    pub epoch: u64,
    pub seq: u64,
    /// Authenticated credential identity of the sender, as raw bytes.
    pub sender_credential: Vec<u8>,
}

/// Factory for per-user MLS sessions backed by on-disk group state.
#[async_trait]
pub trait MlsProvider: Send + Sync {
    /// Open the engine over `db_path`, unlocking it with the hex-encoded
    /// database key. The path scheme and hex encoding are interoperability
    /// contracts: a deviation opens a different (empty) database and every
    /// decryption silently fails.
    async fn open(
        &self,
        db_path: &Path,
        db_key_hex: &str,
        access: StoreAccess,
    ) -> Result<Arc<dyn MlsSession>, EngineError>;
}

/// A live per-user engine handle. All ratchet state lives behind it.
#[async_trait]
pub trait MlsSession: Send + Sync {
    async fn decrypt(&self, group_id: &[u8], ciphertext: &[u8]) -> Result<Decrypted, EngineError>;

    async fn current_epoch(&self, group_id: &[u8]) -> Result<u64, EngineError>;

    async fn member_count(&self, group_id: &[u8]) -> Result<u32, EngineError>;

    /// Flush pending engine state and release the underlying database.
    async fn flush_and_close(&self) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("foreign key constraint failed")]
    ForeignKey,
    /// The storage subsystem itself is unreachable. Distinguished from row-
    /// level trouble because the pipeline fails closed on it: the ratchet is
    /// never advanced while prior work cannot be observed.
    #[error("message store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Other(Arc<anyhow::Error>),
}

impl From<anyhow::Error> for StoreError {
    fn from(error: anyhow::Error) -> Self {
        StoreError::Other(Arc::new(error))
    }
}

/// A decrypted message as stored (and returned to callers).
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedMessage {
    pub text: String,
    pub embed: Option<serde_json::Value>,
    pub sender: String,
}

/// Row to persist after a successful decryption.
#[derive(Debug, Clone)]
pub struct SavePlaintext {
    pub conversation_id: String,
    pub message_id: String,
    pub text: String,
    pub embed: Option<serde_json::Value>,
    pub sender: String,
    pub epoch: Option<u64>,
    pub seq: Option<u64>,
}

/// The encrypted message store. Plaintext rows are unique per
/// `(user, message_id)`; a duplicate save surfaces the existing row via
/// `fetch_plaintext` rather than a second write.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn fetch_plaintext(
        &self,
        user: &UserDid,
        message_id: &str,
        access: StoreAccess,
    ) -> Result<Option<DecryptedMessage>, StoreError>;

    async fn save_plaintext(
        &self,
        user: &UserDid,
        record: SavePlaintext,
        access: StoreAccess,
    ) -> Result<(), StoreError>;

    /// Create the conversation row, or a placeholder, when group metadata
    /// has not arrived yet. Guards the plaintext insert against a
    /// foreign-key failure when the other process wrote a Welcome but not
    /// yet the conversation.
    async fn ensure_conversation_or_placeholder(
        &self,
        user: &UserDid,
        conversation_id: &str,
        group_id: &[u8],
        access: StoreAccess,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
#[error(transparent)]
pub struct SecretError(Arc<anyhow::Error>);

impl From<anyhow::Error> for SecretError {
    fn from(error: anyhow::Error) -> Self {
        SecretError(Arc::new(error))
    }
}

/// Holder of per-user database-encryption keys, keyed by user id.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, SecretError>;

    async fn write(&self, key: &str, value: &[u8]) -> Result<(), SecretError>;

    async fn delete(&self, key: &str) -> Result<(), SecretError>;
}

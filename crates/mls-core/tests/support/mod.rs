//! Shared fixtures: a mock MLS engine with forward-secret semantics, an
//! in-memory message store with foreign-key behavior, and a root builder
//! that simulates one OS process over a shared container.

// Each integration test binary compiles its own copy of this module and
// uses a different subset of it.
#![allow(dead_code)]

use async_trait::async_trait;
use ids::UserDid;
use mls_core::{
    CoordinationCore, CoreConfig, Decrypted, DecryptRequest, DecryptedMessage, EngineError,
    MessageStore, MlsProvider, MlsSession, SavePlaintext, SecretError, SecretStore, StoreAccess,
    StoreError,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Ratchet state shared by every session opened over the same on-disk MLS
/// database, regardless of which simulated process opened it. A message key
/// is consumed by the first successful decryption; any later attempt
/// observes secret reuse, exactly like the real engine.
#[derive(Default)]
pub struct MockRatchet {
    consumed: Mutex<HashSet<Vec<u8>>>,
    payloads: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    pub decrypt_count: AtomicUsize,
}

impl MockRatchet {
    pub fn add_message(&self, ciphertext: &[u8], plaintext: &[u8]) {
        self.payloads
            .lock()
            .unwrap()
            .insert(ciphertext.to_vec(), plaintext.to_vec());
    }

    /// Pretend some earlier decryption already consumed this key.
    pub fn consume(&self, ciphertext: &[u8]) {
        self.consumed.lock().unwrap().insert(ciphertext.to_vec());
    }
}

pub struct MockProvider {
    ratchet: Arc<MockRatchet>,
    epoch: AtomicU64,
    member_count: AtomicU32,
    sender_credential: Mutex<Vec<u8>>,
    decrypt_delay: Mutex<Duration>,
    pub opens: AtomicUsize,
    pub ephemeral_opens: AtomicUsize,
    sessions: Mutex<Vec<Arc<AtomicBool>>>,
}

impl MockProvider {
    pub fn new(ratchet: Arc<MockRatchet>) -> Arc<Self> {
        Arc::new(Self {
            ratchet,
            epoch: AtomicU64::new(1),
            member_count: AtomicU32::new(2),
            sender_credential: Mutex::new(b"did:plc:carol".to_vec()),
            decrypt_delay: Mutex::new(Duration::ZERO),
            opens: AtomicUsize::new(0),
            ephemeral_opens: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn set_epoch(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::SeqCst);
    }

    pub fn set_sender_credential(&self, credential: &[u8]) {
        *self.sender_credential.lock().unwrap() = credential.to_vec();
    }

    pub fn set_decrypt_delay(&self, delay: Duration) {
        *self.decrypt_delay.lock().unwrap() = delay;
    }

    /// Close flags of every session opened so far, in open order.
    pub fn session_closed_flags(&self) -> Vec<Arc<AtomicBool>> {
        self.sessions.lock().unwrap().clone()
    }
}

#[async_trait]
impl MlsProvider for MockProvider {
    async fn open(
        &self,
        _db_path: &Path,
        db_key_hex: &str,
        access: StoreAccess,
    ) -> Result<Arc<dyn MlsSession>, EngineError> {
        // A wrong key would silently open an empty database in production;
        // the mock asserts the contract instead.
        assert!(!db_key_hex.is_empty() && db_key_hex.chars().all(|c| c.is_ascii_hexdigit()));

        self.opens.fetch_add(1, Ordering::SeqCst);
        if access == StoreAccess::Ephemeral {
            self.ephemeral_opens.fetch_add(1, Ordering::SeqCst);
        }
        let closed = Arc::new(AtomicBool::new(false));
        self.sessions.lock().unwrap().push(closed.clone());
        Ok(Arc::new(MockSession {
            ratchet: self.ratchet.clone(),
            epoch_at_open: self.epoch.load(Ordering::SeqCst),
            member_count: self.member_count.load(Ordering::SeqCst),
            sender_credential: self.sender_credential.lock().unwrap().clone(),
            decrypt_delay: *self.decrypt_delay.lock().unwrap(),
            closed,
        }))
    }
}

pub struct MockSession {
    ratchet: Arc<MockRatchet>,
    epoch_at_open: u64,
    member_count: u32,
    sender_credential: Vec<u8>,
    decrypt_delay: Duration,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl MlsSession for MockSession {
    async fn decrypt(&self, _group_id: &[u8], ciphertext: &[u8]) -> Result<Decrypted, EngineError> {
        if !self.decrypt_delay.is_zero() {
            tokio::time::sleep(self.decrypt_delay).await;
        }

        let plaintext = self
            .ratchet
            .payloads
            .lock()
            .unwrap()
            .get(ciphertext)
            .cloned()
            .ok_or_else(|| EngineError::from(anyhow::anyhow!("unknown ciphertext")))?;

        // Forward secrecy: one consumption per ciphertext, ever.
        if !self
            .ratchet
            .consumed
            .lock()
            .unwrap()
            .insert(ciphertext.to_vec())
        {
            return Err(EngineError::SecretReuse);
        }
        let seq = self.ratchet.decrypt_count.fetch_add(1, Ordering::SeqCst) as u64;
        Ok(Decrypted {
            plaintext,
            epoch: self.epoch_at_open,
            seq,
            sender_credential: self.sender_credential.clone(),
        })
    }

    async fn current_epoch(&self, _group_id: &[u8]) -> Result<u64, EngineError> {
        Ok(self.epoch_at_open)
    }

    async fn member_count(&self, _group_id: &[u8]) -> Result<u32, EngineError> {
        Ok(self.member_count)
    }

    async fn flush_and_close(&self) -> Result<(), EngineError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory stand-in for the encrypted message store, shared between the
/// simulated processes the way the real SQLite file is.
#[derive(Default)]
pub struct MockMessageStore {
    rows: Mutex<HashMap<(UserDid, String), DecryptedMessage>>,
    conversations: Mutex<HashSet<(UserDid, String)>>,
    pub saves: AtomicUsize,
    pub ensures: AtomicUsize,
    pub ephemeral_calls: AtomicUsize,
    /// Pretend the storage subsystem is down.
    pub unavailable: AtomicBool,
    /// Swallow the next ensure-conversation call, so the following save
    /// hits a foreign-key failure (the Welcome-without-metadata race).
    pub ignore_next_ensure: AtomicBool,
    /// Hide seeded rows from this many fetches before revealing them, to
    /// model the other process finishing a decrypt mid-operation.
    pub hidden_fetches: AtomicUsize,
}

impl MockMessageStore {
    pub fn seed_row(&self, user: &UserDid, message_id: &str, message: DecryptedMessage) {
        self.rows
            .lock()
            .unwrap()
            .insert((user.clone(), message_id.to_string()), message);
    }

    pub fn row(&self, user: &UserDid, message_id: &str) -> Option<DecryptedMessage> {
        self.rows
            .lock()
            .unwrap()
            .get(&(user.clone(), message_id.to_string()))
            .cloned()
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn has_conversation(&self, user: &UserDid, conversation_id: &str) -> bool {
        self.conversations
            .lock()
            .unwrap()
            .contains(&(user.clone(), conversation_id.to_string()))
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("store offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn note_access(&self, access: StoreAccess) {
        if access == StoreAccess::Ephemeral {
            self.ephemeral_calls.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl MessageStore for MockMessageStore {
    async fn fetch_plaintext(
        &self,
        user: &UserDid,
        message_id: &str,
        access: StoreAccess,
    ) -> Result<Option<DecryptedMessage>, StoreError> {
        self.check_available()?;
        self.note_access(access);

        let hidden = self.hidden_fetches.load(Ordering::SeqCst);
        if hidden > 0 {
            self.hidden_fetches.store(hidden - 1, Ordering::SeqCst);
            return Ok(None);
        }
        Ok(self.row(user, message_id))
    }

    async fn save_plaintext(
        &self,
        user: &UserDid,
        record: SavePlaintext,
        access: StoreAccess,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.note_access(access);

        if !self
            .conversations
            .lock()
            .unwrap()
            .contains(&(user.clone(), record.conversation_id.clone()))
        {
            return Err(StoreError::ForeignKey);
        }

        // Uniqueness per (user, message_id): the first writer wins.
        let mut rows = self.rows.lock().unwrap();
        rows.entry((user.clone(), record.message_id.clone()))
            .or_insert_with(|| {
                self.saves.fetch_add(1, Ordering::SeqCst);
                DecryptedMessage {
                    text: record.text.clone(),
                    embed: record.embed.clone(),
                    sender: record.sender.clone(),
                }
            });
        Ok(())
    }

    async fn ensure_conversation_or_placeholder(
        &self,
        user: &UserDid,
        conversation_id: &str,
        _group_id: &[u8],
        access: StoreAccess,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.note_access(access);
        self.ensures.fetch_add(1, Ordering::SeqCst);

        if self.ignore_next_ensure.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.conversations
            .lock()
            .unwrap()
            .insert((user.clone(), conversation_id.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockSecretStore {
    keys: Mutex<HashMap<String, Vec<u8>>>,
}

impl MockSecretStore {
    pub fn with_key(user: &UserDid) -> Arc<Self> {
        let store = Self::default();
        store
            .keys
            .lock()
            .unwrap()
            .insert(user.as_str().to_string(), vec![0x42; 32]);
        Arc::new(store)
    }

    pub fn add_key(&self, user: &UserDid) {
        self.keys
            .lock()
            .unwrap()
            .insert(user.as_str().to_string(), vec![0x42; 32]);
    }
}

#[async_trait]
impl SecretStore for MockSecretStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, SecretError> {
        Ok(self.keys.lock().unwrap().get(key).cloned())
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<(), SecretError> {
        self.keys
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SecretError> {
        self.keys.lock().unwrap().remove(key);
        Ok(())
    }
}

/// One simulated OS process over the shared container.
pub struct Process {
    pub core: CoordinationCore,
    pub provider: Arc<MockProvider>,
}

impl Process {
    pub fn spawn(
        container: &Path,
        ratchet: &Arc<MockRatchet>,
        messages: &Arc<MockMessageStore>,
        secrets: &Arc<MockSecretStore>,
    ) -> Self {
        let provider = MockProvider::new(ratchet.clone());
        let core = CoordinationCore::new(CoreConfig {
            container: container.to_path_buf(),
            provider: provider.clone(),
            messages: messages.clone(),
            secrets: secrets.clone(),
        });
        Self { core, provider }
    }
}

pub fn alice() -> UserDid {
    UserDid::new("did:plc:alice")
}

pub fn request(message_id: &str, ciphertext: &[u8]) -> DecryptRequest {
    DecryptRequest {
        group_id: b"group-1".to_vec(),
        ciphertext: ciphertext.to_vec(),
        conversation_id: "conv-1".to_string(),
        message_id: message_id.to_string(),
        epoch: None,
        seq: None,
        sender: None,
    }
}

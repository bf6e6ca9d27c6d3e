//! The canonical decrypt-and-store operation.
//!
//! Idempotency is layered: a pre-lock cache probe skips work the other
//! process already finished, an in-flight table deduplicates tasks of this
//! process, a post-lock probe closes the window between the two, and store
//! uniqueness backstops everything. The engine call through the plaintext
//! persist is the critical section: once the ratchet advances, the result
//! must be stored, so that span runs on a detached task the caller's
//! cancellation cannot abandon.

use crate::envelope;
use crate::external::{DecryptedMessage, EngineError, SavePlaintext, StoreAccess, StoreError};
use crate::manager::ContextManager;
use crate::{Error, Result};
use coordinator::{ExclusiveAccess, Purpose};
use handshake::Channel;
use ids::UserDid;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Deadline for acquiring the exclusive scope of a decrypt operation.
const DECRYPT_TIMEOUT: Duration = Duration::from_secs(15);

/// One ciphertext to decrypt and persist.
#[derive(Debug, Clone)]
pub struct DecryptRequest {
    pub group_id: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub conversation_id: String,
    pub message_id: String,
    /// Epoch/seq from the delivery envelope, when it carries authoritative
    /// values; the engine's observations fill the gaps.
    pub epoch: Option<u64>,
    pub seq: Option<u64>,
    /// Sender hint from the delivery envelope; the authenticated credential
    /// wins when it carries a DID.
    pub sender: Option<String>,
}

impl ContextManager {
    /// Decrypt `request` for `user` and persist the plaintext. Returns the
    /// message text; see [`ContextManager::decrypt_and_store_with_embeds`]
    /// for the full record.
    pub async fn decrypt_and_store(
        self: &Arc<Self>,
        user: &UserDid,
        request: DecryptRequest,
    ) -> Result<String> {
        Ok(self
            .decrypt_and_store_with_embeds(user, request)
            .await?
            .text)
    }

    /// Decrypt and persist, returning text, optional rich embed, and the
    /// resolved sender.
    pub async fn decrypt_and_store_with_embeds(
        self: &Arc<Self>,
        user: &UserDid,
        request: DecryptRequest,
    ) -> Result<DecryptedMessage> {
        self.decrypt_outer(user, request, StoreAccess::Standard)
            .await
    }

    /// Notification-worker variant: all storage access runs against the
    /// ephemeral pool so decrypting for a background user never disturbs
    /// the UI-active user's database.
    pub async fn decrypt_for_notification(
        self: &Arc<Self>,
        user: &UserDid,
        request: DecryptRequest,
    ) -> Result<DecryptedMessage> {
        self.decrypt_outer(user, request, StoreAccess::Ephemeral)
            .await
    }

    /// Decrypt several messages inside a single exclusive scope. Each entry
    /// gets its own outcome; scope acquisition failure fails them all.
    pub async fn decrypt_batch(
        self: &Arc<Self>,
        user: &UserDid,
        requests: Vec<DecryptRequest>,
    ) -> Result<Vec<Result<DecryptedMessage>>> {
        let this = self.clone();
        let user = user.clone();
        let handle = tokio::spawn(async move {
            let access = this.access().clone();
            access
                .with_exclusive(
                    &user,
                    Purpose::DecryptBatch,
                    DECRYPT_TIMEOUT,
                    |scope| async move {
                        let mut outcomes = Vec::with_capacity(requests.len());
                        for request in requests {
                            outcomes.push(
                                this.decrypt_in_scope(&scope, request, StoreAccess::Standard)
                                    .await,
                            );
                        }
                        Ok(outcomes)
                    },
                )
                .await
        });
        handle
            .await
            .map_err(|err| Error::Engine(anyhow::anyhow!("decrypt task failed: {err}").into()))?
    }

    async fn decrypt_outer(
        self: &Arc<Self>,
        user: &UserDid,
        request: DecryptRequest,
        mode: StoreAccess,
    ) -> Result<DecryptedMessage> {
        // Pre-lock idempotency probe: when the other process has already
        // stored this message, answer without serializing behind the locks.
        // A dead storage subsystem aborts instead; the ratchet must never
        // advance while prior work is unobservable.
        match self
            .messages()
            .fetch_plaintext(user, &request.message_id, mode)
            .await
        {
            Ok(Some(cached)) => return Ok(cached),
            Ok(None) => {}
            Err(error @ StoreError::Unavailable(_)) => return Err(error.into()),
            Err(error) => {
                tracing::debug!(
                    message_id = %request.message_id,
                    %error,
                    "pre-lock cache probe failed; continuing"
                );
            }
        }

        // Everything from scope entry onward runs detached: a caller that
        // stops waiting must not unwind the engine-to-persist critical
        // section, and any outcome still reaches in-flight waiters.
        let this = self.clone();
        let user = user.clone();
        let handle = tokio::spawn(async move {
            let access = this.access().clone();
            access
                .with_exclusive(&user, Purpose::Decrypt, DECRYPT_TIMEOUT, |scope| async move {
                    this.decrypt_deduped(&scope, request, mode).await
                })
                .await
        });
        handle
            .await
            .map_err(|err| Error::Engine(anyhow::anyhow!("decrypt task failed: {err}").into()))?
    }

    /// In-flight dedup: at most one engine attempt per message-id runs in
    /// this process; latecomers await the leader's published outcome.
    pub(crate) async fn decrypt_deduped(
        &self,
        scope: &ExclusiveAccess,
        request: DecryptRequest,
        mode: StoreAccess,
    ) -> Result<DecryptedMessage> {
        let message_id = request.message_id.clone();

        enum Role {
            Leader(watch::Sender<crate::manager::InFlightOutcome>),
            Follower(watch::Receiver<crate::manager::InFlightOutcome>),
        }
        let role = {
            let mut in_flight = self.in_flight.lock().unwrap();
            match in_flight.get(&message_id) {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(message_id.clone(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => loop {
                if let Some(outcome) = rx.borrow_and_update().clone() {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    // Leader vanished without publishing; its scope already
                    // unwound, so surface the disappearance.
                    return Err(Error::Cancelled);
                }
            },
            Role::Leader(tx) => {
                let outcome = self.decrypt_in_scope(scope, request, mode).await;
                let _ = tx.send(Some(outcome.clone()));
                self.in_flight.lock().unwrap().remove(&message_id);
                outcome
            }
        }
    }

    /// Steps 4–13: the per-message body, run while holding the scope.
    pub(crate) async fn decrypt_in_scope(
        &self,
        scope: &ExclusiveAccess,
        request: DecryptRequest,
        mode: StoreAccess,
    ) -> Result<DecryptedMessage> {
        let user = scope.user();

        // Post-lock probe: covers the window between the pre-lock probe and
        // scope entry, where the other process may have finished this
        // message.
        if let Some(cached) = self
            .messages()
            .fetch_plaintext(user, &request.message_id, mode)
            .await?
        {
            return Ok(cached);
        }

        let session = self.get_context(scope, mode).await?;

        let inner = envelope::unwrap(&request.ciphertext);
        let decrypted = match session.decrypt(&request.group_id, inner).await {
            Ok(decrypted) => decrypted,
            Err(EngineError::SecretReuse) | Err(EngineError::SecretTree) => {
                // The key is gone. If some process stored the plaintext in
                // the meantime this is a late duplicate, not a failure.
                if let Some(cached) = self
                    .messages()
                    .fetch_plaintext(user, &request.message_id, mode)
                    .await?
                {
                    return Ok(cached);
                }
                return Err(Error::SecretReuseSkipped(request.message_id));
            }
            Err(other) => return Err(other.into()),
        };

        let (text, embed) = decode_payload(&decrypted.plaintext);
        let sender = resolve_sender(&decrypted.sender_credential, request.sender.as_deref());

        self.messages()
            .ensure_conversation_or_placeholder(
                user,
                &request.conversation_id,
                &request.group_id,
                mode,
            )
            .await?;

        let record = SavePlaintext {
            conversation_id: request.conversation_id.clone(),
            message_id: request.message_id.clone(),
            text: text.clone(),
            embed: embed.clone(),
            sender: sender.clone(),
            epoch: request.epoch.or(Some(decrypted.epoch)),
            seq: request.seq.or(Some(decrypted.seq)),
        };
        match self.messages().save_plaintext(user, record.clone(), mode).await {
            Ok(()) => {}
            Err(StoreError::ForeignKey) => {
                // The conversation row lost a race (e.g. a Welcome landed
                // without metadata). Force the placeholder and retry once.
                self.messages()
                    .ensure_conversation_or_placeholder(
                        user,
                        &request.conversation_id,
                        &request.group_id,
                        mode,
                    )
                    .await?;
                self.messages().save_plaintext(user, record, mode).await?;
            }
            Err(other) => return Err(other.into()),
        }

        let version = self.versions().increment_held(scope)?;
        self.note_context_version(user, version);
        if let Err(error) = self.doorbell().post(Channel::StateChanged) {
            tracing::debug!(%error, "state-changed ring failed");
        }

        tracing::debug!(
            user = %user,
            message_id = %request.message_id,
            version,
            "message decrypted and stored"
        );
        Ok(DecryptedMessage {
            text,
            embed,
            sender,
        })
    }
}

/// Interpret decrypted bytes: a JSON `{text, embed}` record when well
/// formed, otherwise the raw bytes as UTF-8 text with no embed.
fn decode_payload(plaintext: &[u8]) -> (String, Option<serde_json::Value>) {
    #[derive(serde::Deserialize)]
    struct Payload {
        text: String,
        #[serde(default)]
        embed: Option<serde_json::Value>,
    }

    match serde_json::from_slice::<Payload>(plaintext) {
        Ok(payload) => (payload.text, payload.embed),
        Err(_) => (String::from_utf8_lossy(plaintext).into_owned(), None),
    }
}

/// The sender identity recorded with the plaintext: the engine's
/// authenticated credential when it carries a DID, else the caller's hint,
/// else `"unknown"`.
fn resolve_sender(credential: &[u8], hint: Option<&str>) -> String {
    if let Ok(sender) = sender_from_credential(credential) {
        return sender;
    }
    match hint {
        Some(hint) if !hint.is_empty() && hint != "unknown" => hint.to_string(),
        _ => "unknown".to_string(),
    }
}

/// Decode an authenticated credential identity into a sender DID. Query
/// paths surface [`Error::InvalidCredential`]; the decrypt pipeline instead
/// falls back to its caller-supplied hint.
pub fn sender_from_credential(credential: &[u8]) -> Result<String> {
    let identity = std::str::from_utf8(credential).map_err(|_| Error::InvalidCredential)?;
    if identity.starts_with("did:") {
        Ok(identity.to_string())
    } else {
        Err(Error::InvalidCredential)
    }
}

//! Local Message Store.
//!
//! Durable holding area for messages composed offline or still in flight.
//! Entries are keyed by [`ClientId`] and listed in enqueue order (`seq`).
//! Status changes go through [`check_transition`], so every backend agrees on
//! what a legal move is: forward only, idempotent, `synced` terminal.

mod memory;
#[cfg(not(target_arch = "wasm32"))]
mod sqlite;

pub use self::memory::MemoryStore;
#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteStore;

use thiserror::Error;

use crate::model::{
    ClientId, ConversationId, OutgoingMessage, QueuedMessage, SyncStatus, UnixTimeMs,
};
use crate::truncate_utf8_safe;

const MAX_LAST_ERROR_LENGTH: usize = 512;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("entry not found: {0}")]
    NotFound(ClientId),

    #[error("duplicate client id: {0}")]
    Duplicate(ClientId),

    #[error("invalid status transition for {client_id}: {from} -> {to}")]
    InvalidTransition {
        client_id: ClientId,
        from: SyncStatus,
        to: SyncStatus,
    },

    #[error("entry {0} is not synced yet")]
    NotSynced(ClientId),

    #[error("entry {0} is being sent")]
    InFlight(ClientId),

    #[error("corrupted entry {client_id}: {reason}")]
    Corrupted { client_id: String, reason: String },
}

/// Result of a `mark_status` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusChange {
    Applied { from: SyncStatus, to: SyncStatus },
    /// Same status requested, or the entry is already synced.
    Unchanged(SyncStatus),
}

impl StatusChange {
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new entry as `pending`, assigning a client id when absent.
    async fn enqueue(
        &self,
        draft: OutgoingMessage,
        now: UnixTimeMs,
    ) -> Result<QueuedMessage, StoreError>;

    async fn get(&self, client_id: &ClientId) -> Result<Option<QueuedMessage>, StoreError>;

    /// Entries not yet synced, oldest first.
    async fn list_pending(
        &self,
        conversation_id: Option<&ConversationId>,
    ) -> Result<Vec<QueuedMessage>, StoreError>;

    async fn count_pending(
        &self,
        conversation_id: Option<&ConversationId>,
    ) -> Result<usize, StoreError> {
        Ok(self.list_pending(conversation_id).await?.len())
    }

    async fn mark_status(
        &self,
        client_id: &ClientId,
        status: SyncStatus,
        error: Option<&str>,
        now: UnixTimeMs,
    ) -> Result<StatusChange, StoreError>;

    /// Delete a synced entry. Returns false when nothing was stored under the id.
    async fn remove(&self, client_id: &ClientId) -> Result<bool, StoreError>;

    /// Delete an unsent (`pending` or `failed`) entry the user gave up on.
    async fn discard(&self, client_id: &ClientId) -> Result<QueuedMessage, StoreError>;

    /// Delete synced entries last touched before `older_than`.
    async fn prune_synced(&self, older_than: UnixTimeMs) -> Result<usize, StoreError>;
}

/// Decide whether `from -> to` should be written.
///
/// `Ok(false)` means no-op (same status, or already synced).
pub(crate) fn check_transition(
    client_id: &ClientId,
    from: SyncStatus,
    to: SyncStatus,
) -> Result<bool, StoreError> {
    if from == to || from.is_terminal() {
        return Ok(false);
    }
    if !from.can_transition_to(to) {
        return Err(StoreError::InvalidTransition {
            client_id: client_id.clone(),
            from,
            to,
        });
    }
    Ok(true)
}

pub(crate) fn apply_transition(
    entry: &mut QueuedMessage,
    to: SyncStatus,
    error: Option<&str>,
    now: UnixTimeMs,
) {
    entry.sync_status = to;
    entry.updated_at = now;
    match to {
        SyncStatus::Sending => entry.attempts = entry.attempts.saturating_add(1),
        SyncStatus::Failed => {
            entry.last_error = error.map(|e| {
                let mut e = e.to_string();
                truncate_utf8_safe(&mut e, MAX_LAST_ERROR_LENGTH);
                e
            });
        }
        SyncStatus::Synced => entry.last_error = None,
        SyncStatus::Pending => {}
    }
}

pub(crate) fn check_discard(entry: &QueuedMessage) -> Result<(), StoreError> {
    match entry.sync_status {
        SyncStatus::Pending | SyncStatus::Failed => Ok(()),
        SyncStatus::Sending => Err(StoreError::InFlight(entry.client_id.clone())),
        SyncStatus::Synced => Err(StoreError::InvalidTransition {
            client_id: entry.client_id.clone(),
            from: SyncStatus::Synced,
            to: SyncStatus::Pending,
        }),
    }
}

pub(crate) fn new_entry(draft: OutgoingMessage, seq: u64, now: UnixTimeMs) -> QueuedMessage {
    QueuedMessage {
        client_id: draft.client_id.unwrap_or_else(ClientId::generate),
        conversation_id: draft.conversation_id,
        sender_id: draft.sender_id,
        body: draft.body,
        created_at: now,
        updated_at: now,
        sync_status: SyncStatus::Pending,
        attempts: 0,
        last_error: None,
        seq,
    }
}

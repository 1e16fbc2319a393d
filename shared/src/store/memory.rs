use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{
    apply_transition, check_discard, check_transition, new_entry, MessageStore, StatusChange,
    StoreError,
};
use crate::model::{
    ClientId, ConversationId, OutgoingMessage, QueuedMessage, SyncStatus, UnixTimeMs,
};

#[derive(Default)]
struct MemoryState {
    entries: HashMap<ClientId, QueuedMessage>,
    next_seq: u64,
}

/// Volatile store for tests and shells without a writable filesystem.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait::async_trait]
impl MessageStore for MemoryStore {
    async fn enqueue(
        &self,
        draft: OutgoingMessage,
        now: UnixTimeMs,
    ) -> Result<QueuedMessage, StoreError> {
        let mut state = self.state.write().await;
        if let Some(id) = &draft.client_id {
            if state.entries.contains_key(id) {
                return Err(StoreError::Duplicate(id.clone()));
            }
        }
        state.next_seq += 1;
        let entry = new_entry(draft, state.next_seq, now);
        state.entries.insert(entry.client_id.clone(), entry.clone());
        Ok(entry)
    }

    async fn get(&self, client_id: &ClientId) -> Result<Option<QueuedMessage>, StoreError> {
        Ok(self.state.read().await.entries.get(client_id).cloned())
    }

    async fn list_pending(
        &self,
        conversation_id: Option<&ConversationId>,
    ) -> Result<Vec<QueuedMessage>, StoreError> {
        let state = self.state.read().await;
        let mut pending: Vec<_> = state
            .entries
            .values()
            .filter(|e| e.sync_status != SyncStatus::Synced)
            .filter(|e| conversation_id.map_or(true, |c| &e.conversation_id == c))
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.seq);
        Ok(pending)
    }

    async fn mark_status(
        &self,
        client_id: &ClientId,
        status: SyncStatus,
        error: Option<&str>,
        now: UnixTimeMs,
    ) -> Result<StatusChange, StoreError> {
        let mut state = self.state.write().await;
        let entry = state
            .entries
            .get_mut(client_id)
            .ok_or_else(|| StoreError::NotFound(client_id.clone()))?;

        let from = entry.sync_status;
        if !check_transition(client_id, from, status)? {
            return Ok(StatusChange::Unchanged(from));
        }
        apply_transition(entry, status, error, now);
        Ok(StatusChange::Applied { from, to: status })
    }

    async fn remove(&self, client_id: &ClientId) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.entries.get(client_id) {
            None => Ok(false),
            Some(entry) if entry.sync_status != SyncStatus::Synced => {
                Err(StoreError::NotSynced(client_id.clone()))
            }
            Some(_) => Ok(state.entries.remove(client_id).is_some()),
        }
    }

    async fn discard(&self, client_id: &ClientId) -> Result<QueuedMessage, StoreError> {
        let mut state = self.state.write().await;
        let entry = state
            .entries
            .get(client_id)
            .ok_or_else(|| StoreError::NotFound(client_id.clone()))?;
        check_discard(entry)?;
        state
            .entries
            .remove(client_id)
            .ok_or_else(|| StoreError::NotFound(client_id.clone()))
    }

    async fn prune_synced(&self, older_than: UnixTimeMs) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        let before = state.entries.len();
        state
            .entries
            .retain(|_, e| !(e.sync_status == SyncStatus::Synced && e.updated_at < older_than));
        Ok(before - state.entries.len())
    }
}

//! Offline-first messaging core for the mobile apps.
//!
//! Messages composed in a chat are persisted to the [`store`] first, shown
//! optimistically by the [`chat`] view-model, and pushed to the backend by
//! the [`sync`] engine whenever [`connectivity`] says a send is worth trying.
//! Send responses and realtime echoes are merged so each message renders
//! once.

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod backend;
pub mod chat;
pub mod config;
pub mod connectivity;
pub mod model;
#[cfg(feature = "push")]
pub mod push;
pub mod session;
pub mod store;
pub mod sync;

pub use backend::{BackendError, ErrorCategory, MessageBackend, RealtimeFeed, RealtimeSubscription};
pub use chat::{ChatEntry, ChatViewModel, MergeOutcome, StatusGlyph};
pub use config::{ConfigError, SyncConfig};
pub use connectivity::{ConnectivityMonitor, ConnectivityState, Subscription};
pub use model::{
    ClientId, ConversationId, ConversationKind, ConversationMessage, DeliveryStatus,
    MessageBody, OutgoingMessage, PageRequest, QueuedMessage, RealtimeEvent, SendMessageRequest,
    ServerMessageId, SyncStatus, UnixTimeMs, UserId, ValidationError,
};
pub use session::{ChatSession, SessionError};
pub use store::{MemoryStore, MessageStore, StatusChange, StoreError};
#[cfg(not(target_arch = "wasm32"))]
pub use store::SqliteStore;
pub use sync::{SweepReport, SyncEngine, SyncError, SyncEvent, SyncTask};

/// Cut `s` to at most `max_bytes` without splitting a character.
pub(crate) fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}

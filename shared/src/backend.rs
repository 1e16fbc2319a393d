//! Seams to the hosted backend: message insert, history reads and the
//! realtime change feed. Payload shapes follow the backend's `messages` table.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::{
    ConversationId, ConversationMessage, PageRequest, RealtimeEvent, SendMessageRequest,
};
use crate::truncate_utf8_safe;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    RateLimited,
    /// Validation or row-level-security rejection.
    Rejected,
    Unauthorized,
    Server,
    Unknown,
}

impl ErrorCategory {
    /// Failures that say the link is down rather than the request is bad.
    pub const fn is_connectivity(self) -> bool {
        matches!(self, Self::Network | Self::Timeout)
    }

    pub const fn from_http_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Unauthorized,
            408 => Self::Timeout,
            429 => Self::RateLimited,
            400..=499 => Self::Rejected,
            500..=599 => Self::Server,
            _ => Self::Unknown,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{category:?} ({code}): {message}")]
pub struct BackendError {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
}

impl BackendError {
    const MAX_MESSAGE_LENGTH: usize = 512;
    const MAX_CODE_LENGTH: usize = 64;

    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut code = code.into();
        let mut message = message.into();
        truncate_utf8_safe(&mut code, Self::MAX_CODE_LENGTH);
        truncate_utf8_safe(&mut message, Self::MAX_MESSAGE_LENGTH);
        Self {
            category,
            code,
            message,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, "NETWORK_ERROR", message)
    }

    pub fn timeout() -> Self {
        Self::new(ErrorCategory::Timeout, "TIMEOUT", "request timed out")
    }

    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Rejected, code, message)
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::new(
            ErrorCategory::from_http_status(status),
            format!("HTTP_{status}"),
            message,
        )
    }

    pub const fn is_connectivity(&self) -> bool {
        self.category.is_connectivity()
    }
}

#[async_trait::async_trait]
pub trait MessageBackend: Send + Sync {
    /// Insert a message; the backend echoes the stored record.
    async fn send_message(
        &self,
        request: SendMessageRequest,
    ) -> Result<ConversationMessage, BackendError>;

    /// One page of history, oldest-first within the page.
    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        page: PageRequest,
    ) -> Result<Vec<ConversationMessage>, BackendError>;
}

#[async_trait::async_trait]
pub trait RealtimeFeed: Send + Sync {
    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<RealtimeSubscription, BackendError>;
}

/// Live change feed for one conversation.
///
/// Dropping the subscription runs its release hook, which is where the
/// transport unsubscribes from the channel.
pub struct RealtimeSubscription {
    conversation_id: ConversationId,
    events: mpsc::Receiver<RealtimeEvent>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl RealtimeSubscription {
    pub fn new(conversation_id: ConversationId, events: mpsc::Receiver<RealtimeEvent>) -> Self {
        Self {
            conversation_id,
            events,
            release: None,
        }
    }

    #[must_use]
    pub fn on_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Next event, or `None` once the channel has dropped.
    pub async fn recv(&mut self) -> Option<RealtimeEvent> {
        self.events.recv().await
    }
}

impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for RealtimeSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeSubscription")
            .field("conversation_id", &self.conversation_id)
            .finish_non_exhaustive()
    }
}

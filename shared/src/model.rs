use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(ClientId);
typed_id!(ServerMessageId);
typed_id!(ConversationId);
typed_id!(UserId);

impl ClientId {
    /// Locally generated, stable across retries of the same message.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Unix timestamp in milliseconds
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    #[must_use]
    pub const fn saturating_sub_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_sub(ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("message text is empty")]
    EmptyText,
    #[error("value too long ({len} > {max})")]
    TooLong { len: usize, max: usize },
    #[error("invalid media reference: {0}")]
    InvalidMediaRef(String),
}

// --- Message body ---

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        content: String,
    },
    Media {
        media_ref: String,
        #[serde(default)]
        caption: Option<String>,
    },
}

impl MessageBody {
    pub fn text(content: impl Into<String>, max_len: usize) -> Result<Self, ValidationError> {
        let body = Self::Text {
            content: content.into(),
        };
        body.validate(max_len)?;
        Ok(body)
    }

    pub fn media(
        media_ref: impl Into<String>,
        caption: Option<String>,
        max_len: usize,
    ) -> Result<Self, ValidationError> {
        let body = Self::Media {
            media_ref: media_ref.into(),
            caption,
        };
        body.validate(max_len)?;
        Ok(body)
    }

    /// Re-check a body that may have been built without the constructors.
    pub fn validate(&self, max_len: usize) -> Result<(), ValidationError> {
        match self {
            Self::Text { content } => {
                if content.trim().is_empty() {
                    return Err(ValidationError::EmptyText);
                }
                if content.len() > max_len {
                    return Err(ValidationError::TooLong {
                        len: content.len(),
                        max: max_len,
                    });
                }
            }
            Self::Media { media_ref, caption } => {
                if media_ref.trim().is_empty() || media_ref.chars().any(char::is_control) {
                    return Err(ValidationError::InvalidMediaRef(media_ref.clone()));
                }
                if let Some(caption) = caption {
                    if caption.len() > max_len {
                        return Err(ValidationError::TooLong {
                            len: caption.len(),
                            max: max_len,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Media { .. } => "media",
        }
    }

    /// Text shown in previews and notifications.
    pub fn preview(&self) -> &str {
        match self {
            Self::Text { content } => content,
            Self::Media { caption, .. } => caption.as_deref().unwrap_or(""),
        }
    }
}

// Message content is user data; Debug reports shape only.
impl fmt::Debug for MessageBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text { content } => f
                .debug_struct("Text")
                .field("len", &content.len())
                .finish(),
            Self::Media { caption, .. } => f
                .debug_struct("Media")
                .field("caption_present", &caption.is_some())
                .finish(),
        }
    }
}

// --- Statuses ---

/// Local sync state of a queued message.
///
/// Moves forward only: `pending -> sending -> {synced | failed}`, and
/// `failed -> sending` on retry. `synced` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Sending,
    Synced,
    Failed,
}

impl SyncStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sending" => Some(Self::Sending),
            "synced" => Some(Self::Synced),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Synced)
    }

    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Sending)
                | (Self::Failed, Self::Sending)
                | (Self::Sending, Self::Synced)
                | (Self::Sending, Self::Failed)
        )
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-side delivery state; ordered so it can only be raised.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    /// One-to-one chat tied to a match.
    Direct,
    /// Study-group chat.
    Nest,
}

// --- Messages ---

/// A message the user composed, before the store has accepted it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub client_id: Option<ClientId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: MessageBody,
}

impl OutgoingMessage {
    pub fn new(conversation_id: ConversationId, sender_id: UserId, body: MessageBody) -> Self {
        Self {
            client_id: None,
            conversation_id,
            sender_id,
            body,
        }
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub client_id: ClientId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: MessageBody,
    pub created_at: UnixTimeMs,
    pub updated_at: UnixTimeMs,
    pub sync_status: SyncStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Store-assigned enqueue order.
    pub seq: u64,
}

impl fmt::Debug for QueuedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedMessage")
            .field("client_id", &self.client_id)
            .field("conversation_id", &self.conversation_id)
            .field("sender_id", &self.sender_id)
            .field("body", &self.body)
            .field("created_at", &self.created_at)
            .field("sync_status", &self.sync_status)
            .field("attempts", &self.attempts)
            .field("last_error_present", &self.last_error.is_some())
            .field("seq", &self.seq)
            .finish()
    }
}

/// Backend-confirmed message record.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: ServerMessageId,
    /// Absent on records produced without a client (e.g. generated icebreakers).
    #[serde(default)]
    pub client_id: Option<ClientId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: MessageBody,
    pub created_at: UnixTimeMs,
    #[serde(default)]
    pub delivery: DeliveryStatus,
}

impl fmt::Debug for ConversationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationMessage")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("conversation_id", &self.conversation_id)
            .field("sender_id", &self.sender_id)
            .field("body", &self.body)
            .field("created_at", &self.created_at)
            .field("delivery", &self.delivery)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: MessageBody,
    pub client_id: ClientId,
}

impl From<&QueuedMessage> for SendMessageRequest {
    fn from(message: &QueuedMessage) -> Self {
        Self {
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            body: message.body.clone(),
            client_id: message.client_id.clone(),
        }
    }
}

/// Change-feed event on the messages table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "record", rename_all = "snake_case")]
pub enum RealtimeEvent {
    Insert(ConversationMessage),
    Update(ConversationMessage),
}

impl RealtimeEvent {
    pub fn record(&self) -> &ConversationMessage {
        match self {
            Self::Insert(record) | Self::Update(record) => record,
        }
    }

    pub fn into_record(self) -> ConversationMessage {
        match self {
            Self::Insert(record) | Self::Update(record) => record,
        }
    }
}

/// Page of history: the newest `limit` messages strictly older than `before`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub limit: u32,
    pub before: Option<UnixTimeMs>,
}

impl PageRequest {
    pub const fn latest(limit: u32) -> Self {
        Self {
            limit,
            before: None,
        }
    }

    pub const fn before(limit: u32, before: UnixTimeMs) -> Self {
        Self {
            limit,
            before: Some(before),
        }
    }
}

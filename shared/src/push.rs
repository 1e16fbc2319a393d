//! Push notification payloads and foreground routing.
//!
//! The backend's notification function sends a small JSON payload; the
//! shell hands it here to decide whether to show a banner and where a tap
//! should land.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::model::{ConversationId, ConversationKind, UserId};
use crate::truncate_utf8_safe;

const PREVIEW_MAX_BYTES: usize = 120;
const ELLIPSIS: &str = "…";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PermissionState {
    #[default]
    NotDetermined,
    Denied,
    Authorized,
    Provisional,
    Ephemeral,
}

impl PermissionState {
    #[must_use]
    pub const fn is_authorized(self) -> bool {
        matches!(self, Self::Authorized | Self::Provisional | Self::Ephemeral)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PushError {
    #[error("unknown push payload type: {0}")]
    UnknownPayload(String),

    #[error("malformed push payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushPayload {
    NewMessage {
        conversation_id: ConversationId,
        #[serde(default = "default_kind")]
        conversation_kind: ConversationKind,
        sender_id: UserId,
        sender_name: String,
        #[serde(default)]
        preview: Option<String>,
        /// Nest name, for group chats.
        #[serde(default)]
        title: Option<String>,
    },
    NewMatch {
        conversation_id: ConversationId,
        match_name: String,
    },
    NestInvite {
        nest_id: ConversationId,
        nest_name: String,
        inviter_name: String,
    },
}

const fn default_kind() -> ConversationKind {
    ConversationKind::Direct
}

impl PushPayload {
    pub fn from_json(raw: &str) -> Result<Self, PushError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| PushError::Malformed(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| PushError::Malformed("missing type".into()))?;
        if !matches!(kind, "new_message" | "new_match" | "nest_invite") {
            return Err(PushError::UnknownPayload(kind.to_string()));
        }
        serde_json::from_value(value).map_err(|e| PushError::Malformed(e.to_string()))
    }

    pub fn conversation(&self) -> (ConversationKind, &ConversationId) {
        match self {
            Self::NewMessage {
                conversation_id,
                conversation_kind,
                ..
            } => (*conversation_kind, conversation_id),
            Self::NewMatch {
                conversation_id, ..
            } => (ConversationKind::Direct, conversation_id),
            Self::NestInvite { nest_id, .. } => (ConversationKind::Nest, nest_id),
        }
    }

    pub fn deep_link(&self) -> String {
        let (kind, id) = self.conversation();
        deep_link(kind, id)
    }
}

pub fn deep_link(kind: ConversationKind, id: &ConversationId) -> String {
    match kind {
        ConversationKind::Direct => format!("conversation/{id}"),
        ConversationKind::Nest => format!("nest/{id}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    ConversationOpen,
    OwnMessage,
    NotAuthorized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationAction {
    Show {
        title: String,
        body: String,
        deep_link: String,
    },
    Suppress(SuppressReason),
}

/// Tracks which conversation is on screen so its messages don't banner.
#[derive(Debug, Clone, Default)]
pub struct NotificationRouter {
    self_id: Option<UserId>,
    active: Option<ConversationId>,
    permission: PermissionState,
}

impl NotificationRouter {
    pub fn new(self_id: UserId) -> Self {
        Self {
            self_id: Some(self_id),
            ..Self::default()
        }
    }

    pub fn set_permission(&mut self, permission: PermissionState) {
        self.permission = permission;
    }

    pub fn set_active_conversation(&mut self, conversation_id: Option<ConversationId>) {
        self.active = conversation_id;
    }

    pub fn active_conversation(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    pub fn route(&self, payload: &PushPayload) -> NotificationAction {
        if !self.permission.is_authorized() {
            return NotificationAction::Suppress(SuppressReason::NotAuthorized);
        }

        let action = match payload {
            PushPayload::NewMessage {
                conversation_id,
                sender_id,
                sender_name,
                preview,
                title,
                ..
            } => {
                if self.self_id.as_ref() == Some(sender_id) {
                    return NotificationAction::Suppress(SuppressReason::OwnMessage);
                }
                if self.active.as_ref() == Some(conversation_id) {
                    return NotificationAction::Suppress(SuppressReason::ConversationOpen);
                }
                let title = match title {
                    Some(nest) => format!("{sender_name} in {nest}"),
                    None => sender_name.clone(),
                };
                let body = preview
                    .as_deref()
                    .map(truncate_preview)
                    .unwrap_or_else(|| "Sent you a message".to_string());
                NotificationAction::Show {
                    title,
                    body,
                    deep_link: payload.deep_link(),
                }
            }
            PushPayload::NewMatch { match_name, .. } => NotificationAction::Show {
                title: "New match".to_string(),
                body: format!("You matched with {match_name}"),
                deep_link: payload.deep_link(),
            },
            PushPayload::NestInvite {
                nest_name,
                inviter_name,
                ..
            } => NotificationAction::Show {
                title: "Nest invite".to_string(),
                body: format!("{inviter_name} invited you to {nest_name}"),
                deep_link: payload.deep_link(),
            },
        };
        debug!(deep_link = %payload.deep_link(), "push routed");
        action
    }
}

fn truncate_preview(preview: &str) -> String {
    let mut text = preview.trim().to_string();
    if text.len() > PREVIEW_MAX_BYTES {
        truncate_utf8_safe(&mut text, PREVIEW_MAX_BYTES - ELLIPSIS.len());
        text.push_str(ELLIPSIS);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn router() -> NotificationRouter {
        let mut router = NotificationRouter::new(UserId::new("me"));
        router.set_permission(PermissionState::Authorized);
        router
    }

    fn message_json(conversation: &str, sender: &str) -> String {
        format!(
            r#"{{"type":"new_message","conversation_id":"{conversation}","sender_id":"{sender}","sender_name":"Sam","preview":"see you at the library"}}"#
        )
    }

    #[test]
    fn parses_known_payloads() {
        let payload = PushPayload::from_json(&message_json("c1", "u2")).unwrap();
        assert_matches!(payload, PushPayload::NewMessage { conversation_kind: ConversationKind::Direct, .. });

        let invite = PushPayload::from_json(
            r#"{"type":"nest_invite","nest_id":"n1","nest_name":"Algorithms","inviter_name":"Ana"}"#,
        )
        .unwrap();
        assert_eq!(invite.deep_link(), "nest/n1");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = PushPayload::from_json(r#"{"type":"promo","text":"hi"}"#).unwrap_err();
        assert_eq!(err, PushError::UnknownPayload("promo".into()));
        assert_matches!(PushPayload::from_json("not json"), Err(PushError::Malformed(_)));
        assert_matches!(
            PushPayload::from_json(r#"{"type":"new_match"}"#),
            Err(PushError::Malformed(_))
        );
    }

    #[test]
    fn message_for_open_conversation_is_suppressed() {
        let mut router = router();
        let payload = PushPayload::from_json(&message_json("c1", "u2")).unwrap();

        assert_matches!(router.route(&payload), NotificationAction::Show { ref deep_link, .. } if deep_link == "conversation/c1");

        router.set_active_conversation(Some(ConversationId::new("c1")));
        assert_eq!(
            router.route(&payload),
            NotificationAction::Suppress(SuppressReason::ConversationOpen)
        );

        router.set_active_conversation(Some(ConversationId::new("c2")));
        assert_matches!(router.route(&payload), NotificationAction::Show { .. });
    }

    #[test]
    fn own_messages_and_missing_permission_are_suppressed() {
        let payload = PushPayload::from_json(&message_json("c1", "me")).unwrap();
        assert_eq!(
            router().route(&payload),
            NotificationAction::Suppress(SuppressReason::OwnMessage)
        );

        let unauthorized = NotificationRouter::new(UserId::new("me"));
        assert_eq!(
            unauthorized.route(&payload),
            NotificationAction::Suppress(SuppressReason::NotAuthorized)
        );
    }

    #[test]
    fn nest_message_title_and_link() {
        let payload = PushPayload::NewMessage {
            conversation_id: ConversationId::new("n7"),
            conversation_kind: ConversationKind::Nest,
            sender_id: UserId::new("u2"),
            sender_name: "Sam".into(),
            preview: None,
            title: Some("Physics".into()),
        };
        assert_eq!(
            router().route(&payload),
            NotificationAction::Show {
                title: "Sam in Physics".into(),
                body: "Sent you a message".into(),
                deep_link: "nest/n7".into(),
            }
        );
    }

    #[test]
    fn long_preview_is_truncated_on_char_boundary() {
        let preview = "ü".repeat(200);
        let text = truncate_preview(&preview);
        assert!(text.len() <= PREVIEW_MAX_BYTES);
        assert!(text.ends_with(ELLIPSIS));
    }
}

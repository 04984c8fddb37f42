/// Shared types for the decoding and correlation layers
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Inputs selecting the per-message decryption key: the sender's opaque
/// identifier plus the scheme version that picks the salt prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionContext {
    pub user_id: String,
    pub scheme_version: u32,
}

impl EncryptionContext {
    pub fn new(user_id: impl Into<String>, scheme_version: u32) -> Self {
        Self {
            user_id: user_id.into(),
            scheme_version,
        }
    }
}

/// A persisted chat message as seen by the reconciliation layer.
///
/// `foreign_id` is the platform-assigned log id; `reply_reference` is a
/// forward reference to another message's foreign id that may not resolve
/// to a local record until a later backfill pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: u64,
    pub room: String,
    pub foreign_id: i64,
    pub sender: String,
    pub body: Option<String>,
    pub reply_reference: Option<i64>,
    pub resolved_target: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl StoredMessage {
    /// A message counts as unresolved while it carries a reference that has
    /// not yet been linked to a local record.
    pub fn is_unresolved(&self) -> bool {
        self.reply_reference.is_some() && self.resolved_target.is_none()
    }
}

/// Message fields as delivered by the bridge, before a local id is assigned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDraft {
    pub room: String,
    pub foreign_id: i64,
    pub sender: String,
    pub body: Option<String>,
    pub reply_reference: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

/// "This message replies to that message" — target is a foreign log id,
/// not necessarily resolvable yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyLink {
    pub source_message_id: u64,
    pub target_reference: i64,
}

/// "This reaction targets that message", same resolution semantics as a
/// reply link but extracted from a different field-priority order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionLink {
    pub source_message_id: u64,
    pub target_reference: i64,
}

/// Steps of a guided multi-message input flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InteractionStep {
    CollectingBody,
    AwaitingAttachment,
    AwaitingConfirmation,
    Submitted,
}

impl InteractionStep {
    /// Legal transitions:
    /// CollectingBody -> AwaitingAttachment -> { AwaitingConfirmation | Submitted },
    /// AwaitingConfirmation -> Submitted. The AwaitingAttachment -> Submitted
    /// edge is the "no attachment" skip path.
    pub fn can_transition(self, next: InteractionStep) -> bool {
        use InteractionStep::*;
        matches!(
            (self, next),
            (CollectingBody, AwaitingAttachment)
                | (AwaitingAttachment, AwaitingConfirmation)
                | (AwaitingAttachment, Submitted)
                | (AwaitingConfirmation, Submitted)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == InteractionStep::Submitted
    }
}

/// Saved state for a participant mid-way through a multi-step flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInteraction {
    pub id: Uuid,
    pub room: String,
    pub participant: String,
    pub step: InteractionStep,
    pub collected_fields: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    /// An image that arrived out of band; held until the participant
    /// explicitly confirms it should be attached.
    pub detected_image_url: Option<String>,
}

impl PendingInteraction {
    pub fn new(room: impl Into<String>, participant: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            room: room.into(),
            participant: participant.into(),
            step: InteractionStep::CollectingBody,
            collected_fields: HashMap::new(),
            created_at: Utc::now(),
            detected_image_url: None,
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.collected_fields.insert(key.into(), value.into());
        self
    }
}

/// Ephemeral record of an out-of-band uploaded image, consumed at most once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAttachmentPreview {
    pub image_url: String,
    pub file_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_transitions() {
        use InteractionStep::*;
        assert!(CollectingBody.can_transition(AwaitingAttachment));
        assert!(AwaitingAttachment.can_transition(AwaitingConfirmation));
        assert!(AwaitingAttachment.can_transition(Submitted));
        assert!(AwaitingConfirmation.can_transition(Submitted));

        // No skipping forward from the first step, no going back
        assert!(!CollectingBody.can_transition(Submitted));
        assert!(!AwaitingConfirmation.can_transition(AwaitingAttachment));
        assert!(!Submitted.can_transition(CollectingBody));
    }

    #[test]
    fn test_unresolved_flag() {
        let mut msg = StoredMessage {
            id: 1,
            room: "room".to_string(),
            foreign_id: 100,
            sender: "user".to_string(),
            body: None,
            reply_reference: Some(42),
            resolved_target: None,
            timestamp: Utc::now(),
        };
        assert!(msg.is_unresolved());

        msg.resolved_target = Some(7);
        assert!(!msg.is_unresolved());

        msg.reply_reference = None;
        msg.resolved_target = None;
        assert!(!msg.is_unresolved());
    }
}

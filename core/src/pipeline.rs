/// Inbound decode pipeline: one raw bridge event in, one decoded view out.
///
/// Stateless. Ties the cipher layer and the attachment extractors together:
/// decrypts the body with scheme-version fallback, then runs every extractor
/// independently so a malformed attachment never hides a recoverable reply
/// target or image URL.
use serde_json::Value;
use tracing::{debug, warn};

use crate::attachment;
use crate::crypto::{candidate_versions, cipher};
use crate::types::{EncryptionContext, ReactionLink, ReplyLink};

/// A message event as handed over by the transport bridge
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub room: String,
    pub participant_raw: String,
    pub body_text: Option<String>,
    pub is_encrypted: bool,
    pub encryption_context: Option<EncryptionContext>,
    pub attachment: Option<Value>,
    /// Platform message-type tag, when the bridge forwards one
    pub message_type_hint: Option<i32>,
    /// Reply reference carried outside the attachment payload
    pub explicit_reply_reference: Option<Value>,
}

/// Everything the decode stage could recover from one event. Fields are
/// independent: any of them may be present without the others.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedMessage {
    pub plaintext: Option<String>,
    pub reply_target_reference: Option<i64>,
    pub reaction_target_reference: Option<i64>,
    pub image_url: Option<String>,
}

impl DecodedMessage {
    pub fn reply_link(&self, source_message_id: u64) -> Option<ReplyLink> {
        self.reply_target_reference.map(|target_reference| ReplyLink {
            source_message_id,
            target_reference,
        })
    }

    pub fn reaction_link(&self, source_message_id: u64) -> Option<ReactionLink> {
        self.reaction_target_reference
            .map(|target_reference| ReactionLink {
                source_message_id,
                target_reference,
            })
    }
}

pub struct MessageDecoder;

impl MessageDecoder {
    /// Decode one inbound event. Never fails: undecryptable bodies come back
    /// as `plaintext: None` with the rest of the fields still populated.
    pub fn decode(event: &InboundEvent) -> DecodedMessage {
        let plaintext = match (&event.body_text, event.is_encrypted) {
            (Some(body), true) => Self::decrypt_with_candidates(body, event),
            (Some(body), false) => Some(body.clone()),
            (None, _) => None,
        };

        DecodedMessage {
            plaintext,
            reply_target_reference: attachment::extract_reply_target(
                event.attachment.as_ref(),
                event.explicit_reply_reference.as_ref(),
            ),
            reaction_target_reference: attachment::extract_reaction_target(
                event.attachment.as_ref(),
            ),
            image_url: attachment::extract_image_url(event.attachment.as_ref()),
        }
    }

    /// Try the event's own scheme version first, then the known fallback
    /// versions. Deployed clients disagree on which version they write, so a
    /// mismatch on the first attempt is routine rather than an error.
    fn decrypt_with_candidates(body: &str, event: &InboundEvent) -> Option<String> {
        let Some(ctx) = &event.encryption_context else {
            warn!(room = %event.room, "encrypted body without an encryption context");
            return None;
        };

        for version in candidate_versions(ctx.scheme_version) {
            let attempt = EncryptionContext::new(ctx.user_id.clone(), version);
            if let Some(plaintext) = cipher::decrypt(body, &attempt) {
                if version != ctx.scheme_version {
                    debug!(
                        room = %event.room,
                        requested = ctx.scheme_version,
                        used = version,
                        "decrypted with fallback scheme version"
                    );
                }
                return Some(plaintext);
            }
        }

        warn!(
            room = %event.room,
            version = ctx.scheme_version,
            "message did not decrypt under any candidate scheme version"
        );
        None
    }
}

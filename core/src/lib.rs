/// KakaoBridge - Message Decoding and Correlation Engine
///
/// Decodes relayed KakaoTalk messages (per-sender AES-CBC cipher with
/// scheme-version fallback), extracts reply/reaction targets and image URLs
/// from inconsistent attachment payloads, tracks multi-step participant
/// interactions with TTL expiry, and reconciles forward message references
/// through a periodic backfill pass.

pub mod attachment;
pub mod backfill;
pub mod config;
pub mod crypto;
pub mod error;
pub mod interaction_cache;
pub mod message_store;
pub mod pipeline;
pub mod types;

pub use backfill::{BackfillReconciler, MessageRepository};
pub use config::Config;
pub use error::{BridgeError, Result};
pub use interaction_cache::InteractionCache;
pub use message_store::MessageStore;
pub use pipeline::{DecodedMessage, InboundEvent, MessageDecoder};
pub use types::EncryptionContext;

/// Message cipher codec: AES-256-CBC with a fixed IV and manual padding.
///
/// Decryption is total — every structural failure (bad base64, bad length,
/// bad padding, invalid UTF-8) comes back as `None`, never a panic or error.
/// A `None` means "undecryptable with this context"; callers may retry with
/// another scheme version from `candidate_versions`.
use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose, Engine as _};
use tracing::debug;

use crate::crypto::keys::derive_key;
use crate::types::EncryptionContext;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Fixed IV shared by every message on the platform
const MESSAGE_IV: [u8; 16] = [
    15, 8, 1, 0, 25, 71, 37, 220, 21, 245, 23, 224, 225, 21, 12, 53,
];

pub const DEFAULT_SCHEME_VERSION: u32 = 31;

/// Scheme versions worth retrying when the flagged version fails,
/// most common first.
pub const FALLBACK_SCHEME_VERSIONS: [u32; 3] = [31, 32, 30];

/// Ordered, deduplicated candidate list: the flagged version first, then the
/// common fallbacks.
pub fn candidate_versions(preferred: u32) -> Vec<u32> {
    let mut out = vec![preferred];
    for version in FALLBACK_SCHEME_VERSIONS {
        if !out.contains(&version) {
            out.push(version);
        }
    }
    out
}

/// Decrypt a base64 ciphertext to plaintext, or report failure as `None`.
///
/// Literal sentinel inputs (empty, `"{}"`, `"[]"`) pass through unchanged:
/// the bridge emits them for empty attachment slots and they were never
/// encrypted in the first place.
pub fn decrypt(ciphertext_b64: &str, ctx: &EncryptionContext) -> Option<String> {
    if ciphertext_b64.is_empty() || ciphertext_b64 == "{}" || ciphertext_b64 == "[]" {
        return Some(ciphertext_b64.to_string());
    }

    let decoded = general_purpose::STANDARD.decode(ciphertext_b64).ok()?;
    if decoded.is_empty() || decoded.len() % 16 != 0 {
        debug!(
            len = decoded.len(),
            "rejecting ciphertext: length not a non-zero multiple of 16"
        );
        return None;
    }

    let key = derive_key(&ctx.user_id, ctx.scheme_version);
    debug!(
        key_prefix = %hex::encode(&key[..4]),
        version = ctx.scheme_version,
        "attempting decrypt"
    );

    let padded = Aes256CbcDec::new(&key.into(), &MESSAGE_IV.into())
        .decrypt_padded_vec_mut::<NoPadding>(&decoded)
        .ok()?;

    let body = strip_padding(&padded)?;
    let text = String::from_utf8(body.to_vec()).ok()?;
    if text.is_empty() || looks_garbled(&text) {
        return None;
    }
    Some(text)
}

/// Reference encryptor with the same key schedule and IV; used for golden
/// round-trip vectors and by bridge-side tooling.
pub fn encrypt(plaintext: &str, ctx: &EncryptionContext) -> String {
    let key = derive_key(&ctx.user_id, ctx.scheme_version);
    let sealed = Aes256CbcEnc::new(&key.into(), &MESSAGE_IV.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    general_purpose::STANDARD.encode(sealed)
}

/// Validate and strip PKCS-style padding. The final byte, read as an
/// unsigned count, must be in [1, 16] and must not exceed the buffer;
/// any violation invalidates the whole decryption.
fn strip_padding(padded: &[u8]) -> Option<&[u8]> {
    let last = *padded.last()?;
    let count = last as usize;
    if count == 0 || count > 16 {
        debug!(count, "rejecting plaintext: invalid padding count");
        return None;
    }
    if count > padded.len() {
        debug!(
            count,
            len = padded.len(),
            "rejecting plaintext: padding count exceeds buffer"
        );
        return None;
    }
    let body = &padded[..padded.len() - count];
    if body.is_empty() {
        return None;
    }
    Some(body)
}

/// A near-miss key usually decrypts to byte soup rather than a decode error.
/// Treat output with more than 10% control characters as evidence of a
/// wrong key.
fn looks_garbled(text: &str) -> bool {
    let total = text.chars().count();
    if total == 0 {
        return true;
    }
    let control = text
        .chars()
        .filter(|c| matches!(c, '\u{0}'..='\u{8}' | '\u{b}' | '\u{c}' | '\u{e}'..='\u{1f}'))
        .count();
    control * 10 > total
}

/// Attachment payload parsing: reply targets, reaction targets, image URLs.
///
/// Payload shapes are inconsistent — structured JSON, string-encoded JSON,
/// base64-wrapped JSON, or garbled text with labeled fragments — so parsing
/// runs an ordered list of recovery strategies and short-circuits on the
/// first that works. Every extractor is total: malformed input yields `None`,
/// never a panic, and one extractor failing does not abort its siblings.
use base64::{engine::general_purpose, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Recursion bound for the image-URL walk
const MAX_WALK_DEPTH: usize = 3;

/// Image-URL keys checked before the generic scan, most specific first.
/// List-valued keys only ever contribute their first element.
const IMAGE_PRIORITY_KEYS: [&str; 14] = [
    "url",
    "imageUrls",
    "thumbnailUrl",
    "thumbnailUrls",
    "path",
    "path_1",
    "xl",
    "l",
    "m",
    "s",
    "imageUrl",
    "image_url",
    "photoUrl",
    "photo_url",
];

const IMAGE_EXTENSIONS: [&str; 7] = [".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp", ".svg"];
const URI_SCHEMES: [&str; 4] = ["http://", "https://", "file://", "content://"];

/// Labeled numeric fragments recoverable from unparseable payload text
static LABELED_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""?(src_logId|src_message|logId)"?\s*[:=]\s*"?([0-9]+)"#).unwrap()
});

/// Outcome of the shared recovery chain
enum ParsedPayload {
    Structured(Value),
    /// Structured parsing failed but labeled fragments may still be scraped
    RawText(String),
}

fn parse_payload(attachment: &Value) -> Option<ParsedPayload> {
    match attachment {
        Value::Object(_) | Value::Array(_) => Some(ParsedPayload::Structured(attachment.clone())),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
                if parsed.is_object() || parsed.is_array() {
                    return Some(ParsedPayload::Structured(parsed));
                }
            }
            if let Some(parsed) = parse_base64_json(trimmed) {
                return Some(ParsedPayload::Structured(parsed));
            }
            Some(ParsedPayload::RawText(trimmed.to_string()))
        }
        _ => None,
    }
}

fn parse_base64_json(raw: &str) -> Option<Value> {
    let decoded = general_purpose::STANDARD.decode(raw).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let parsed: Value = serde_json::from_str(&text).ok()?;
    (parsed.is_object() || parsed.is_array()).then_some(parsed)
}

/// Accept a candidate reference only as a positive integer. String values
/// must be purely numeric — fields like `src_message` sometimes hold
/// descriptive text instead of an id.
fn positive_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            let v = n.as_i64()?;
            (v > 0).then_some(v)
        }
        Value::String(s) => {
            let t = s.trim();
            if t.is_empty() || !t.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let v: i64 = t.parse().ok()?;
            (v > 0).then_some(v)
        }
        _ => None,
    }
}

fn first_reference(map: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|key| map.get(*key).and_then(positive_int))
}

/// Bounded scrape of labeled numeric ids from text that would not parse,
/// honoring the same field priority as the structured path.
fn scrape_reference(text: &str) -> Option<i64> {
    let mut src_log_id = None;
    let mut log_id = None;
    let mut src_message = None;
    for caps in LABELED_REFERENCE.captures_iter(text).take(8) {
        let value: i64 = match caps[2].parse() {
            Ok(v) if v > 0 => v,
            _ => continue,
        };
        let slot = match &caps[1] {
            "src_logId" => &mut src_log_id,
            "logId" => &mut log_id,
            _ => &mut src_message,
        };
        if slot.is_none() {
            *slot = Some(value);
        }
    }
    src_log_id.or(log_id).or(src_message)
}

/// Extract the reply-target log id.
///
/// An explicit out-of-band reference (already extracted by the transport)
/// takes precedence over anything in the attachment. Within the attachment
/// the order is `src_logId`, `logId`, then `src_message`; invalid candidates
/// are skipped rather than failing the whole extraction.
pub fn extract_reply_target(
    attachment: Option<&Value>,
    explicit_reference: Option<&Value>,
) -> Option<i64> {
    if let Some(reference) = explicit_reference.and_then(positive_int) {
        return Some(reference);
    }
    match attachment.and_then(parse_payload)? {
        ParsedPayload::Structured(map) => {
            first_reference(&map, &["src_logId", "logId", "src_message"])
        }
        ParsedPayload::RawText(text) => scrape_reference(&text),
    }
}

/// Extract the reaction-target log id; different field priority, same
/// positive-integer validation.
pub fn extract_reaction_target(attachment: Option<&Value>) -> Option<i64> {
    match attachment.and_then(parse_payload)? {
        ParsedPayload::Structured(map) => first_reference(
            &map,
            &["message_id", "target_id", "target_message_id", "logId", "src_logId"],
        ),
        ParsedPayload::RawText(text) => scrape_reference(&text),
    }
}

/// Extract an embedded image URL via a depth-bounded walk of the payload
pub fn extract_image_url(attachment: Option<&Value>) -> Option<String> {
    match attachment.and_then(parse_payload)? {
        ParsedPayload::Structured(map) => find_image_url(&map, 0),
        ParsedPayload::RawText(_) => None,
    }
}

fn find_image_url(value: &Value, depth: usize) -> Option<String> {
    if depth > MAX_WALK_DEPTH {
        return None;
    }
    // Payloads can be a bare list of entries; walk each element
    if let Value::Array(items) = value {
        for item in items {
            match item {
                Value::String(s) if is_image_url(s) => return Some(s.clone()),
                Value::Object(_) | Value::Array(_) => {
                    if let Some(found) = find_image_url(item, depth + 1) {
                        return Some(found);
                    }
                }
                _ => {}
            }
        }
        return None;
    }
    let map = value.as_object()?;

    for key in IMAGE_PRIORITY_KEYS {
        match map.get(key) {
            Some(Value::Array(items)) => {
                if let Some(first) = items.first().and_then(Value::as_str) {
                    if is_image_url(first) {
                        return Some(first.to_string());
                    }
                }
            }
            Some(other) => {
                if let Some(s) = other.as_str() {
                    if is_image_url(s) {
                        return Some(s.to_string());
                    }
                }
            }
            None => {}
        }
    }

    for child in map.values() {
        match child {
            Value::String(s) if is_image_url(s) => return Some(s.clone()),
            Value::Object(_) => {
                if let Some(found) = find_image_url(child, depth + 1) {
                    return Some(found);
                }
            }
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::Object(_) => {
                            if let Some(found) = find_image_url(item, depth + 1) {
                                return Some(found);
                            }
                        }
                        Value::String(s) if is_image_url(s) => return Some(s.clone()),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// A value counts as an image when it carries a known URI scheme, a common
/// image extension, or both. A scheme alone is enough — thumbnail endpoints
/// and content-provider URIs rarely expose an extension.
fn is_image_url(value: &str) -> bool {
    if value.len() < 5 {
        return false;
    }
    let lower = value.to_ascii_lowercase();
    if URI_SCHEMES.iter().any(|scheme| lower.contains(scheme)) {
        return true;
    }
    IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

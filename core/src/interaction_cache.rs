/// TTL-scoped cache for pending multi-step interactions and attachment
/// previews, keyed by normalized (room, participant) pairs.
///
/// An explicitly constructed service object with an injectable clock — not a
/// module-level singleton — so TTL behavior is testable. A single mutex per
/// map serializes access; contention is low (at most one active flow per
/// participant), so coarse locking beats per-key machinery here.
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;
use unicode_normalization::UnicodeNormalization;

use crate::types::{InteractionStep, PendingAttachmentPreview, PendingInteraction};

/// Multi-step flows stay alive for minutes
pub const DEFAULT_INTERACTION_TTL: Duration = Duration::from_secs(3 * 60);
/// Previews are consumed within seconds or not at all
pub const DEFAULT_PREVIEW_TTL: Duration = Duration::from_secs(90);

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Time source abstraction so tests can advance time deterministically
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Normalize a room name for cache keying: trim, collapse whitespace runs,
/// strip control characters, NFKC.
pub fn normalize_room(room: &str) -> String {
    let stripped: String = room.trim().chars().filter(|c| !c.is_control()).collect();
    let collapsed = WHITESPACE_RUN.replace_all(&stripped, " ");
    collapsed.trim().nfkc().collect()
}

/// Normalize a participant identifier. Bridges emit "name/id"-shaped
/// strings; the trailing numeric segment is the stable id, scanned from the
/// end. Plain numeric ids and everything else pass through as-is.
pub fn normalize_participant(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        return trimmed.to_string();
    }
    if trimmed.contains('/') {
        for segment in trimmed.rsplit('/') {
            let candidate = segment.trim();
            if !candidate.is_empty() && candidate.chars().all(|c| c.is_ascii_digit()) {
                return candidate.to_string();
            }
        }
    }
    trimmed.to_string()
}

pub fn cache_key(room: &str, participant: &str) -> String {
    format!("{}|{}", normalize_room(room), normalize_participant(participant))
}

struct Entry<T> {
    record: T,
    stored_at: Instant,
}

pub struct InteractionCache {
    interactions: Mutex<HashMap<String, Entry<PendingInteraction>>>,
    previews: Mutex<HashMap<String, Entry<PendingAttachmentPreview>>>,
    interaction_ttl: Duration,
    preview_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl InteractionCache {
    pub fn new() -> Self {
        Self::with_clock(
            DEFAULT_INTERACTION_TTL,
            DEFAULT_PREVIEW_TTL,
            Arc::new(SystemClock),
        )
    }

    pub fn with_ttls(interaction_ttl: Duration, preview_ttl: Duration) -> Self {
        Self::with_clock(interaction_ttl, preview_ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(
        interaction_ttl: Duration,
        preview_ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            interactions: Mutex::new(HashMap::new()),
            previews: Mutex::new(HashMap::new()),
            interaction_ttl,
            preview_ttl,
            clock,
        }
    }

    /// Store (or replace) the pending interaction for a participant
    pub fn set(&self, room: &str, participant: &str, record: PendingInteraction) {
        let key = cache_key(room, participant);
        debug!(%key, step = ?record.step, "storing pending interaction");
        let mut map = self.interactions.lock().unwrap();
        map.insert(
            key,
            Entry {
                record,
                stored_at: self.clock.now(),
            },
        );
    }

    /// Fetch the live pending interaction, if any. Expiry is evaluated
    /// lazily here: a stale entry is removed and reported as absent.
    pub fn get(&self, room: &str, participant: &str) -> Option<PendingInteraction> {
        let key = cache_key(room, participant);
        let now = self.clock.now();
        let mut map = self.interactions.lock().unwrap();
        match map.get(&key) {
            Some(entry) if now.duration_since(entry.stored_at) < self.interaction_ttl => {
                Some(entry.record.clone())
            }
            Some(_) => {
                debug!(%key, "pending interaction expired");
                map.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Remove and return the pending interaction (explicit completion or
    /// cancellation). Expired entries are dropped, not returned.
    pub fn take(&self, room: &str, participant: &str) -> Option<PendingInteraction> {
        let key = cache_key(room, participant);
        let now = self.clock.now();
        let mut map = self.interactions.lock().unwrap();
        let entry = map.remove(&key)?;
        (now.duration_since(entry.stored_at) < self.interaction_ttl).then_some(entry.record)
    }

    /// Advance the flow's state machine under the cache lock, so a
    /// confirmation message and a racing attachment event cannot both win.
    /// Returns the updated record, or `None` when there is no live record or
    /// the transition is illegal. Terminal transitions remove the entry.
    pub fn transition(
        &self,
        room: &str,
        participant: &str,
        next: InteractionStep,
    ) -> Option<PendingInteraction> {
        let key = cache_key(room, participant);
        let now = self.clock.now();
        let mut map = self.interactions.lock().unwrap();

        let entry = map.get_mut(&key)?;
        if now.duration_since(entry.stored_at) >= self.interaction_ttl {
            map.remove(&key);
            return None;
        }
        if !entry.record.step.can_transition(next) {
            debug!(%key, from = ?entry.record.step, to = ?next, "illegal step transition ignored");
            return None;
        }
        entry.record.step = next;
        let updated = entry.record.clone();
        if next.is_terminal() {
            map.remove(&key);
        }
        Some(updated)
    }

    /// Park an out-of-band image on the flow and move it to
    /// `AwaitingConfirmation`. The image is deliberately NOT applied until
    /// the participant replies affirmatively — when several images arrive
    /// close together, silently attaching the wrong one is worse than
    /// asking.
    pub fn stage_detected_image(
        &self,
        room: &str,
        participant: &str,
        image_url: &str,
    ) -> Option<PendingInteraction> {
        let key = cache_key(room, participant);
        let now = self.clock.now();
        let mut map = self.interactions.lock().unwrap();

        let entry = map.get_mut(&key)?;
        if now.duration_since(entry.stored_at) >= self.interaction_ttl {
            map.remove(&key);
            return None;
        }
        if !entry
            .record
            .step
            .can_transition(InteractionStep::AwaitingConfirmation)
        {
            return None;
        }
        entry.record.detected_image_url = Some(image_url.to_string());
        entry.record.step = InteractionStep::AwaitingConfirmation;
        Some(entry.record.clone())
    }

    pub fn set_preview(&self, room: &str, participant: &str, preview: PendingAttachmentPreview) {
        let key = cache_key(room, participant);
        let mut map = self.previews.lock().unwrap();
        map.insert(
            key,
            Entry {
                record: preview,
                stored_at: self.clock.now(),
            },
        );
    }

    /// Consume a preview at most once. `within` tightens (never widens) the
    /// acceptance window below the configured preview TTL.
    pub fn take_preview(
        &self,
        room: &str,
        participant: &str,
        within: Option<Duration>,
    ) -> Option<PendingAttachmentPreview> {
        let key = cache_key(room, participant);
        let window = within.map_or(self.preview_ttl, |w| w.min(self.preview_ttl));
        let now = self.clock.now();
        let mut map = self.previews.lock().unwrap();
        let entry = map.remove(&key)?;
        (now.duration_since(entry.stored_at) < window).then_some(entry.record)
    }

    /// Optional sweep for memory bounding; correctness never depends on it
    /// since expiry is checked on every access.
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        self.interactions
            .lock()
            .unwrap()
            .retain(|_, e| now.duration_since(e.stored_at) < self.interaction_ttl);
        self.previews
            .lock()
            .unwrap()
            .retain(|_, e| now.duration_since(e.stored_at) < self.preview_ttl);
    }
}

impl Default for InteractionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InteractionStep::*;

    struct MockClock {
        now: Mutex<Instant>,
    }

    impl MockClock {
        fn new() -> Self {
            Self {
                now: Mutex::new(Instant::now()),
            }
        }

        fn advance(&self, by: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }
    }

    fn cache_with_mock() -> (InteractionCache, Arc<MockClock>) {
        let clock = Arc::new(MockClock::new());
        let cache = InteractionCache::with_clock(
            Duration::from_secs(180),
            Duration::from_secs(90),
            clock.clone(),
        );
        (cache, clock)
    }

    #[test]
    fn test_key_normalization_equivalence() {
        assert_eq!(cache_key(" open  chat\n", "kim/12345"), "open chat|12345");
        assert_eq!(cache_key("open chat", "12345"), "open chat|12345");
        // NFKC folds fullwidth forms
        assert_eq!(normalize_room("ｒｏｏｍ"), "room");
    }

    #[test]
    fn test_participant_trailing_id_extraction() {
        assert_eq!(normalize_participant("kim/12345"), "12345");
        assert_eq!(normalize_participant("a/b/777"), "777");
        // Numeric segment anywhere is found scanning from the end
        assert_eq!(normalize_participant("999/kim"), "999");
        // No numeric segment: raw string survives
        assert_eq!(normalize_participant("AN"), "AN");
        assert_eq!(normalize_participant("  42 "), "42");
    }

    #[test]
    fn test_set_get_take() {
        let (cache, _) = cache_with_mock();
        cache.set("room", "u/1", PendingInteraction::new("room", "1"));

        assert!(cache.get("room", "u/1").is_some());
        // Normalized key variants hit the same entry
        assert!(cache.get(" room ", "1").is_some());

        let taken = cache.take("room", "u/1");
        assert!(taken.is_some());
        assert!(cache.get("room", "u/1").is_none());
    }

    #[test]
    fn test_ttl_expiry_on_get() {
        let (cache, clock) = cache_with_mock();
        cache.set("room", "1", PendingInteraction::new("room", "1"));

        clock.advance(Duration::from_secs(179));
        assert!(cache.get("room", "1").is_some());

        clock.advance(Duration::from_secs(2));
        assert!(cache.get("room", "1").is_none());
        // Lazy removal actually dropped the entry
        assert!(cache.take("room", "1").is_none());
    }

    #[test]
    fn test_transition_happy_path_and_skip() {
        let (cache, _) = cache_with_mock();
        cache.set("room", "1", PendingInteraction::new("room", "1"));

        let advanced = cache.transition("room", "1", AwaitingAttachment).unwrap();
        assert_eq!(advanced.step, AwaitingAttachment);

        // Skip path: participant declines to attach anything
        let submitted = cache.transition("room", "1", Submitted).unwrap();
        assert_eq!(submitted.step, Submitted);
        // Terminal transition destroys the record
        assert!(cache.get("room", "1").is_none());
    }

    #[test]
    fn test_illegal_transition_leaves_record_untouched() {
        let (cache, _) = cache_with_mock();
        cache.set("room", "1", PendingInteraction::new("room", "1"));

        assert!(cache.transition("room", "1", Submitted).is_none());
        assert_eq!(cache.get("room", "1").unwrap().step, CollectingBody);
    }

    #[test]
    fn test_detected_image_requires_confirmation() {
        let (cache, _) = cache_with_mock();
        cache.set("room", "1", PendingInteraction::new("room", "1"));
        cache.transition("room", "1", AwaitingAttachment).unwrap();

        let staged = cache
            .stage_detected_image("room", "1", "http://x/upload.jpg")
            .unwrap();
        assert_eq!(staged.step, AwaitingConfirmation);
        assert_eq!(staged.detected_image_url.as_deref(), Some("http://x/upload.jpg"));

        // The image is not applied until an explicit confirmation
        let confirmed = cache.transition("room", "1", Submitted).unwrap();
        assert_eq!(confirmed.detected_image_url.as_deref(), Some("http://x/upload.jpg"));
    }

    #[test]
    fn test_stage_image_rejected_outside_attachment_step() {
        let (cache, _) = cache_with_mock();
        cache.set("room", "1", PendingInteraction::new("room", "1"));

        // Still collecting the body: an early upload must not jump the flow
        assert!(cache.stage_detected_image("room", "1", "http://x/a.jpg").is_none());
        assert_eq!(cache.get("room", "1").unwrap().step, CollectingBody);
    }

    #[test]
    fn test_preview_consumed_at_most_once() {
        let (cache, _) = cache_with_mock();
        cache.set_preview(
            "room",
            "1",
            PendingAttachmentPreview {
                image_url: "http://x/p.jpg".to_string(),
                file_name: None,
            },
        );

        assert!(cache.take_preview("room", "1", None).is_some());
        assert!(cache.take_preview("room", "1", None).is_none());
    }

    #[test]
    fn test_preview_window_tightening() {
        let (cache, clock) = cache_with_mock();
        cache.set_preview(
            "room",
            "1",
            PendingAttachmentPreview {
                image_url: "http://x/p.jpg".to_string(),
                file_name: None,
            },
        );

        clock.advance(Duration::from_secs(30));
        // Caller asks for a 10s window: the 30s-old preview is too stale,
        // and the failed take still consumed it
        assert!(cache
            .take_preview("room", "1", Some(Duration::from_secs(10)))
            .is_none());
        assert!(cache.take_preview("room", "1", None).is_none());
    }

    #[test]
    fn test_purge_expired_sweep() {
        let (cache, clock) = cache_with_mock();
        cache.set("room", "1", PendingInteraction::new("room", "1"));
        cache.set("room", "2", PendingInteraction::new("room", "2"));
        clock.advance(Duration::from_secs(60));
        cache.set("room", "3", PendingInteraction::new("room", "3"));

        clock.advance(Duration::from_secs(150));
        cache.purge_expired();

        assert!(cache.get("room", "1").is_none());
        assert!(cache.get("room", "2").is_none());
        assert!(cache.get("room", "3").is_some());
    }
}

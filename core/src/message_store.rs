/// Message persistence: relayed chat history stored in a sled DB.
///
/// Default implementation of `MessageRepository`. Keys order messages by
/// room and timestamp so the nearest-preceding scan is a reverse prefix
/// walk; two small index namespaces map foreign log ids and local ids back
/// to primary keys.
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::backfill::MessageRepository;
use crate::error::{BridgeError, Result};
use crate::types::{MessageDraft, StoredMessage};

/// Key namespaces; 0x1F separates segments since it never survives room
/// normalization upstream.
const SEP: char = '\u{1f}';

#[derive(Clone)]
pub struct MessageStore {
    db: Arc<sled::Db>,
}

impl MessageStore {
    /// Open (or create) the message store in the given data directory
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("messages.db");
        debug!("Opening message store at {:?}", db_path);

        let db = sled::open(&db_path)
            .map_err(|e| BridgeError::Storage(format!("Failed to open messages DB: {}", e)))?;

        info!("Message store initialized at {:?}", db_path);
        Ok(Self { db: Arc::new(db) })
    }

    fn message_key(room: &str, timestamp: &DateTime<Utc>, foreign_id: i64) -> String {
        format!(
            "msg{SEP}{room}{SEP}{:020}{SEP}{:020}",
            timestamp.timestamp_millis(),
            foreign_id
        )
    }

    fn room_prefix(room: &str) -> String {
        format!("msg{SEP}{room}{SEP}")
    }

    fn ref_key(room: &str, foreign_id: i64) -> String {
        format!("ref{SEP}{room}{SEP}{:020}", foreign_id)
    }

    fn id_key(id: u64) -> String {
        format!("id{SEP}{:020}", id)
    }

    /// Persist a message, assigning its local id
    pub fn save(&self, draft: MessageDraft) -> Result<StoredMessage> {
        let id = self
            .db
            .generate_id()
            .map_err(|e| BridgeError::Storage(format!("Failed to allocate message id: {}", e)))?;

        let stored = StoredMessage {
            id,
            room: draft.room,
            foreign_id: draft.foreign_id,
            sender: draft.sender,
            body: draft.body,
            reply_reference: draft.reply_reference,
            resolved_target: None,
            timestamp: draft.timestamp,
        };

        let key = Self::message_key(&stored.room, &stored.timestamp, stored.foreign_id);
        let value = serde_json::to_vec(&stored).map_err(BridgeError::Serialization)?;

        self.db
            .insert(key.as_bytes(), value)
            .map_err(|e| BridgeError::Storage(format!("Failed to save message: {}", e)))?;
        self.db
            .insert(
                Self::ref_key(&stored.room, stored.foreign_id).as_bytes(),
                key.as_bytes(),
            )
            .map_err(|e| BridgeError::Storage(format!("Failed to index foreign id: {}", e)))?;
        self.db
            .insert(Self::id_key(stored.id).as_bytes(), key.as_bytes())
            .map_err(|e| BridgeError::Storage(format!("Failed to index local id: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| BridgeError::Storage(format!("Failed to flush message store: {}", e)))?;

        Ok(stored)
    }

    fn load_at(&self, primary_key: &[u8]) -> Result<Option<StoredMessage>> {
        match self.db.get(primary_key) {
            Ok(Some(value)) => {
                let msg = serde_json::from_slice(&value).map_err(BridgeError::Serialization)?;
                Ok(Some(msg))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(BridgeError::Storage(format!(
                "Failed to fetch message: {}",
                e
            ))),
        }
    }

    fn load_indexed(&self, index_key: &str) -> Result<Option<StoredMessage>> {
        match self.db.get(index_key.as_bytes()) {
            Ok(Some(primary)) => self.load_at(&primary),
            Ok(None) => Ok(None),
            Err(e) => Err(BridgeError::Storage(format!(
                "Failed to read index entry: {}",
                e
            ))),
        }
    }

    /// Message count (index namespaces excluded)
    pub fn count(&self) -> usize {
        self.db
            .scan_prefix(format!("msg{SEP}").as_bytes())
            .count()
    }
}

impl MessageRepository for MessageStore {
    fn find_by_foreign_reference(
        &self,
        room: &str,
        reference: i64,
    ) -> Result<Option<StoredMessage>> {
        self.load_indexed(&Self::ref_key(room, reference))
    }

    fn find_unresolved_references(
        &self,
        room: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let prefix = match room {
            Some(r) => Self::room_prefix(r),
            None => format!("msg{SEP}"),
        };

        let mut out = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (_, value) =
                entry.map_err(|e| BridgeError::Storage(format!("Failed to scan messages: {}", e)))?;
            let msg: StoredMessage =
                serde_json::from_slice(&value).map_err(BridgeError::Serialization)?;
            if msg.is_unresolved() {
                out.push(msg);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn find_latest_resolved_before(
        &self,
        room: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<StoredMessage>> {
        let prefix = Self::room_prefix(room);
        for entry in self.db.scan_prefix(prefix.as_bytes()).rev() {
            let (_, value) =
                entry.map_err(|e| BridgeError::Storage(format!("Failed to scan messages: {}", e)))?;
            let msg: StoredMessage =
                serde_json::from_slice(&value).map_err(BridgeError::Serialization)?;
            if msg.timestamp < before && !msg.is_unresolved() {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    fn update_resolved_link(&self, message_id: u64, target_id: u64) -> Result<()> {
        let index_key = Self::id_key(message_id);
        let primary = self
            .db
            .get(index_key.as_bytes())
            .map_err(|e| BridgeError::Storage(format!("Failed to read id index: {}", e)))?
            .ok_or_else(|| {
                BridgeError::Storage(format!("Unknown message id: {}", message_id))
            })?;

        let mut msg = self
            .load_at(&primary)?
            .ok_or_else(|| BridgeError::Storage(format!("Dangling id index: {}", message_id)))?;
        msg.resolved_target = Some(target_id);

        let value = serde_json::to_vec(&msg).map_err(BridgeError::Serialization)?;
        self.db
            .insert(&primary, value)
            .map_err(|e| BridgeError::Storage(format!("Failed to update message: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| BridgeError::Storage(format!("Failed to flush message store: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn draft(room: &str, foreign_id: i64, at_secs: i64, reference: Option<i64>) -> MessageDraft {
        MessageDraft {
            room: room.to_string(),
            foreign_id,
            sender: "sender/42".to_string(),
            body: Some("hello".to_string()),
            reply_reference: reference,
            timestamp: Utc.timestamp_opt(at_secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_save_and_find_by_foreign_reference() {
        let temp_dir = TempDir::new().unwrap();
        let store = MessageStore::open(temp_dir.path()).unwrap();

        let stored = store.save(draft("room", 100, 1000, None)).unwrap();
        let found = store.find_by_foreign_reference("room", 100).unwrap().unwrap();
        assert_eq!(found.id, stored.id);
        assert_eq!(found.foreign_id, 100);

        assert!(store.find_by_foreign_reference("room", 999).unwrap().is_none());
        assert!(store.find_by_foreign_reference("other", 100).unwrap().is_none());
    }

    #[test]
    fn test_unresolved_scan_and_update() {
        let temp_dir = TempDir::new().unwrap();
        let store = MessageStore::open(temp_dir.path()).unwrap();

        let target = store.save(draft("room", 100, 1000, None)).unwrap();
        let pending = store.save(draft("room", 101, 1010, Some(100))).unwrap();
        store.save(draft("room", 102, 1020, None)).unwrap();

        let unresolved = store.find_unresolved_references(None, 10).unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].id, pending.id);

        store.update_resolved_link(pending.id, target.id).unwrap();
        assert!(store.find_unresolved_references(None, 10).unwrap().is_empty());

        let reloaded = store.find_by_foreign_reference("room", 101).unwrap().unwrap();
        assert_eq!(reloaded.resolved_target, Some(target.id));
    }

    #[test]
    fn test_unresolved_scan_room_filter() {
        let temp_dir = TempDir::new().unwrap();
        let store = MessageStore::open(temp_dir.path()).unwrap();

        store.save(draft("a", 1, 1000, Some(99))).unwrap();
        store.save(draft("b", 2, 1000, Some(98))).unwrap();

        assert_eq!(store.find_unresolved_references(Some("a"), 10).unwrap().len(), 1);
        assert_eq!(store.find_unresolved_references(None, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_latest_resolved_before_ordering() {
        let temp_dir = TempDir::new().unwrap();
        let store = MessageStore::open(temp_dir.path()).unwrap();

        store.save(draft("room", 100, 1000, None)).unwrap();
        let nearest = store.save(draft("room", 101, 1020, None)).unwrap();
        store.save(draft("room", 102, 1025, Some(777))).unwrap(); // unresolved, skipped
        store.save(draft("room", 103, 1040, None)).unwrap(); // after the cutoff

        let found = store
            .find_latest_resolved_before("room", Utc.timestamp_opt(1030, 0).unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(found.id, nearest.id);

        assert!(store
            .find_latest_resolved_before("room", Utc.timestamp_opt(999, 0).unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_count_ignores_index_entries() {
        let temp_dir = TempDir::new().unwrap();
        let store = MessageStore::open(temp_dir.path()).unwrap();

        store.save(draft("room", 1, 1000, None)).unwrap();
        store.save(draft("room", 2, 1001, None)).unwrap();
        assert_eq!(store.count(), 2);
    }
}

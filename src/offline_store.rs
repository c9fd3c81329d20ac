use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::capabilities::kv::{KeyNamespace, KeyValueStore, KvError, KvKey};
use crate::outbox::QueuedItem;

pub const MAX_QUEUE_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_QUEUE_ENTRIES: usize = 10_000;

const QUARANTINE_SUFFIX: &str = ".corrupt";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Kv(#[from] KvError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted queue: {reason}")]
    Corrupted { reason: String },

    #[error("queue too large: {size} bytes, max {max}")]
    TooLarge { size: usize, max: usize },

    #[error("too many queued items: {count}, max {max}")]
    TooManyEntries { count: usize, max: usize },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Kv(e) => e.is_retryable(),
            StoreError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub max_bytes: usize,
    pub max_entries: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_bytes: MAX_QUEUE_BYTES,
            max_entries: MAX_QUEUE_ENTRIES,
        }
    }
}

/// Serializes the queue as the JSON array that is persisted and exported.
pub fn encode_queue(items: &[QueuedItem]) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(items).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Bytes the queue occupies once persisted.
pub fn encoded_len(items: &[QueuedItem]) -> Result<usize, StoreError> {
    encode_queue(items).map(|bytes| bytes.len())
}

/// Parses and checks a persisted queue. Pending entries whose retry budget is
/// already spent come back abandoned so no drain picks them up again.
pub fn decode_queue(bytes: &[u8], limits: StoreLimits) -> Result<Vec<QueuedItem>, StoreError> {
    if bytes.len() > limits.max_bytes {
        return Err(StoreError::TooLarge {
            size: bytes.len(),
            max: limits.max_bytes,
        });
    }

    let mut items: Vec<QueuedItem> =
        serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupted {
            reason: e.to_string(),
        })?;

    if items.len() > limits.max_entries {
        return Err(StoreError::TooManyEntries {
            count: items.len(),
            max: limits.max_entries,
        });
    }

    let mut seen = std::collections::HashSet::with_capacity(items.len());
    for item in &items {
        if !seen.insert(item.id.as_str()) {
            return Err(StoreError::Corrupted {
                reason: format!("duplicate item id {}", item.id),
            });
        }
    }

    for item in items.iter_mut().filter(|i| !i.synced && i.retries_exhausted()) {
        item.synced = true;
        item.abandoned = true;
    }

    Ok(items)
}

/// Writes via a sibling tmp file and rename so a crash never leaves a torn file.
pub fn save_to_path(path: &Path, items: &[QueuedItem]) -> Result<(), StoreError> {
    let bytes = encode_queue(items)?;
    let tmp_path = path.with_extension("tmp");

    let mut file = File::create(&tmp_path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

pub fn load_from_path(path: &Path, limits: StoreLimits) -> Result<Vec<QueuedItem>, StoreError> {
    let bytes = std::fs::read(path)?;
    if bytes.is_empty() {
        return Err(StoreError::Corrupted {
            reason: "empty file".into(),
        });
    }
    decode_queue(&bytes, limits)
}

/// The queue image inside a [`KeyValueStore`].
pub struct QueueStore<S: KeyValueStore> {
    kv: Arc<S>,
    key: KvKey,
    limits: StoreLimits,
}

impl<S: KeyValueStore> QueueStore<S> {
    pub fn new(kv: Arc<S>, storage_key: &str, limits: StoreLimits) -> Result<Self, StoreError> {
        Ok(Self {
            kv,
            key: KvKey::new(KeyNamespace::Offline, storage_key)?,
            limits,
        })
    }

    pub fn key(&self) -> &KvKey {
        &self.key
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    /// Missing key means an empty queue.
    pub fn load(&self) -> Result<Vec<QueuedItem>, StoreError> {
        match self.kv.get(&self.key)? {
            Some(bytes) => decode_queue(&bytes, self.limits),
            None => Ok(Vec::new()),
        }
    }

    pub fn save(&self, items: &[QueuedItem]) -> Result<(), StoreError> {
        let bytes = encode_queue(items)?;
        self.kv.set(&self.key, &bytes)?;
        Ok(())
    }

    /// Moves an unreadable blob aside so the next save does not destroy it.
    pub fn quarantine(&self) -> Result<bool, StoreError> {
        let Some(bytes) = self.kv.get(&self.key)? else {
            return Ok(false);
        };
        let aside = KvKey::new(
            KeyNamespace::Offline,
            format!("{}{}", self.key.key(), QUARANTINE_SUFFIX),
        )?;
        self.kv.set(&aside, &bytes)?;
        self.kv.remove(&self.key)?;
        warn!(key = %aside.raw(), bytes = bytes.len(), "queue blob quarantined");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::kv::MemoryStore;
    use crate::model::{Priority, UnixTimeMs};
    use crate::outbox::{ItemId, ItemStatus};
    use tempfile::tempdir;

    fn sample_item(id: &str, priority: Priority) -> QueuedItem {
        QueuedItem::new(
            ItemId::new(id).unwrap(),
            "attendance.checkin",
            serde_json::json!({ "employeeId": 42 }),
            priority,
            3,
            UnixTimeMs(1_700_000_000_000),
        )
    }

    #[test]
    fn encode_uses_camel_case_wire_names() {
        let bytes = encode_queue(&[sample_item("a-1", Priority::High)]).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(json[0]["type"], "attendance.checkin");
        assert_eq!(json[0]["retryCount"], 0);
        assert_eq!(json[0]["maxRetries"], 3);
        assert_eq!(json[0]["createdAt"], 1_700_000_000_000u64);
        assert_eq!(json[0]["priority"], "high");
    }

    #[test]
    fn decode_abandons_pending_entries_with_spent_retries() {
        let bytes = br#"[
            {"id":"spent","type":"door.open","payload":{},"createdAt":1,"synced":false,"retryCount":3,"maxRetries":3,"priority":"high"},
            {"id":"fresh","type":"door.open","payload":{},"createdAt":2,"synced":false,"retryCount":2,"maxRetries":3,"priority":"high"}
        ]"#;
        let items = decode_queue(bytes, StoreLimits::default()).unwrap();

        assert!(items[0].synced);
        assert!(items[0].abandoned);
        assert_eq!(items[0].status(), ItemStatus::Abandoned);
        assert!(!items[1].synced);
        assert_eq!(items[1].status(), ItemStatus::Pending);
    }

    #[test]
    fn decode_accepts_entries_without_abandoned_flag() {
        let legacy = br#"[{"id":"1700000000000-abcdefghi","type":"door.open","payload":{},"createdAt":1,"synced":false,"retryCount":1,"maxRetries":3,"priority":"low"}]"#;
        let items = decode_queue(legacy, StoreLimits::default()).unwrap();

        assert_eq!(items.len(), 1);
        assert!(!items[0].abandoned);
        assert_eq!(items[0].priority, Priority::Low);
    }

    #[test]
    fn decode_rejects_garbage_and_bad_ids() {
        assert!(matches!(
            decode_queue(b"{not json", StoreLimits::default()),
            Err(StoreError::Corrupted { .. })
        ));

        let bad_id = br#"[{"id":"../etc","type":"x","payload":null,"createdAt":1,"synced":false,"retryCount":0,"maxRetries":3,"priority":"normal"}]"#;
        assert!(matches!(
            decode_queue(bad_id, StoreLimits::default()),
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[test]
    fn decode_rejects_duplicate_ids() {
        let bytes = encode_queue(&[
            sample_item("dup", Priority::Normal),
            sample_item("dup", Priority::Low),
        ])
        .unwrap();
        assert!(matches!(
            decode_queue(&bytes, StoreLimits::default()),
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[test]
    fn decode_enforces_limits() {
        let bytes = encode_queue(&[
            sample_item("a", Priority::Normal),
            sample_item("b", Priority::Normal),
        ])
        .unwrap();

        let few = StoreLimits {
            max_bytes: MAX_QUEUE_BYTES,
            max_entries: 1,
        };
        assert!(matches!(
            decode_queue(&bytes, few),
            Err(StoreError::TooManyEntries { count: 2, max: 1 })
        ));

        let small = StoreLimits {
            max_bytes: 10,
            max_entries: MAX_QUEUE_ENTRIES,
        };
        assert!(matches!(decode_queue(&bytes, small), Err(StoreError::TooLarge { .. })));
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let items = vec![sample_item("a", Priority::High), sample_item("b", Priority::Low)];

        save_to_path(&path, &items).unwrap();
        let loaded = load_from_path(&path, StoreLimits::default()).unwrap();

        assert_eq!(loaded, items);
    }

    #[test]
    fn atomic_write_leaves_no_tmp_on_success() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.json");

        save_to_path(&path, &[]).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn empty_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.json");
        std::fs::write(&path, b"").unwrap();

        assert!(matches!(
            load_from_path(&path, StoreLimits::default()),
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            load_from_path(&dir.path().join("nope.json"), StoreLimits::default()),
            Err(StoreError::Io(_))
        ));
    }

    #[test]
    fn queue_store_roundtrip() {
        let kv = Arc::new(MemoryStore::new());
        let store = QueueStore::new(kv.clone(), "queue", StoreLimits::default()).unwrap();

        assert!(store.load().unwrap().is_empty());
        store.save(&[sample_item("a", Priority::Normal)]).unwrap();

        assert_eq!(store.key().raw(), "offline:queue");
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn quarantine_moves_blob_aside() {
        let kv = Arc::new(MemoryStore::new());
        let store = QueueStore::new(kv.clone(), "queue", StoreLimits::default()).unwrap();
        kv.set(store.key(), b"garbage").unwrap();

        assert!(store.load().is_err());
        assert!(store.quarantine().unwrap());
        assert!(store.load().unwrap().is_empty());

        let aside = KvKey::new(KeyNamespace::Offline, "queue.corrupt").unwrap();
        assert_eq!(kv.get(&aside).unwrap(), Some(b"garbage".to_vec()));
        assert!(!store.quarantine().unwrap());
    }
}

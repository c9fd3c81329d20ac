use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Mutex;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;
pub const MAX_PREFIX_LENGTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
            });
        }

        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot look like a path".to_string(),
            });
        }

        if key.chars().any(|c| c.is_control()) {
            return Err(KvError::InvalidKey {
                key: key.escape_default().to_string(),
                reason: "key contains control characters".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Offline,
    Notifications,
    Settings,
    Custom(String),
}

impl KeyNamespace {
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::Offline => "offline",
            KeyNamespace::Notifications => "notifications",
            KeyNamespace::Settings => "settings",
            KeyNamespace::Custom(s) => s.as_str(),
        }
    }

    pub fn custom(prefix: impl Into<String>) -> Result<Self, KvError> {
        let prefix = prefix.into();
        if prefix.is_empty() || prefix.len() > MAX_PREFIX_LENGTH {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: format!("custom namespace must be 1..={} bytes", MAX_PREFIX_LENGTH),
            });
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: "custom namespace contains invalid characters".to_string(),
            });
        }
        Ok(KeyNamespace::Custom(prefix))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?})")]
    Storage {
        code: StorageErrorCode,
        message: String,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String, key: Option<String> },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage { code, .. } => code.is_retryable(),
            _ => false,
        }
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        Self::Storage {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    QuotaExceeded,
    Corrupted,
    PermissionDenied,
    Busy,
    Locked,
    IoError,
}

impl StorageErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorCode::Busy | StorageErrorCode::Locked)
    }
}

/// Synchronous key-value persistence, shaped after browser `localStorage`.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError>;
    fn set(&self, key: &KvKey, value: &[u8]) -> Result<(), KvError>;
    /// Returns whether the key existed.
    fn remove(&self, key: &KvKey) -> Result<bool, KvError>;
    fn keys(&self, namespace: &KeyNamespace) -> Result<Vec<String>, KvError>;
}

fn check_value_size(value: &[u8]) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>, KvError> {
        self.entries
            .lock()
            .map_err(|_| KvError::storage(StorageErrorCode::Locked, "memory store poisoned"))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.lock()?.get(&key.raw()).cloned())
    }

    fn set(&self, key: &KvKey, value: &[u8]) -> Result<(), KvError> {
        check_value_size(value)?;
        self.lock()?.insert(key.raw(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &KvKey) -> Result<bool, KvError> {
        Ok(self.lock()?.remove(&key.raw()).is_some())
    }

    fn keys(&self, namespace: &KeyNamespace) -> Result<Vec<String>, KvError> {
        let prefix = format!("{}:", namespace.prefix());
        let mut keys: Vec<String> = self
            .lock()?
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// SQLite-backed store for native shells.
#[cfg(not(target_arch = "wasm32"))]
pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
}

#[cfg(not(target_arch = "wasm32"))]
impl SqliteStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, KvError> {
        let conn = rusqlite::Connection::open(path).map_err(sqlite_error)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, KvError> {
        let conn = rusqlite::Connection::open_in_memory().map_err(sqlite_error)?;
        Self::init(conn)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self, KvError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(sqlite_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>, KvError> {
        self.conn
            .lock()
            .map_err(|_| KvError::storage(StorageErrorCode::Locked, "sqlite connection poisoned"))
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn sqlite_error(e: rusqlite::Error) -> KvError {
    let code = match &e {
        rusqlite::Error::SqliteFailure(err, _) => match err.code {
            rusqlite::ErrorCode::DatabaseBusy => StorageErrorCode::Busy,
            rusqlite::ErrorCode::DatabaseLocked => StorageErrorCode::Locked,
            rusqlite::ErrorCode::DiskFull => StorageErrorCode::QuotaExceeded,
            rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase => {
                StorageErrorCode::Corrupted
            }
            rusqlite::ErrorCode::PermissionDenied | rusqlite::ErrorCode::ReadOnly => {
                StorageErrorCode::PermissionDenied
            }
            rusqlite::ErrorCode::SystemIoFailure | rusqlite::ErrorCode::CannotOpen => {
                StorageErrorCode::IoError
            }
            _ => StorageErrorCode::Unknown,
        },
        _ => StorageErrorCode::Unknown,
    };
    KvError::storage(code, e.to_string())
}

#[cfg(not(target_arch = "wasm32"))]
impl KeyValueStore for SqliteStore {
    fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        use rusqlite::OptionalExtension;

        self.lock()?
            .query_row(
                "SELECT value FROM kv_entries WHERE key = ?1",
                [key.raw()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .map_err(sqlite_error)
    }

    fn set(&self, key: &KvKey, value: &[u8]) -> Result<(), KvError> {
        check_value_size(value)?;
        let now = crate::model::UnixTimeMs::now().0 as i64;
        self.lock()?
            .execute(
                r#"
                INSERT INTO kv_entries (key, value, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
                "#,
                rusqlite::params![key.raw(), value, now],
            )
            .map_err(sqlite_error)?;
        Ok(())
    }

    fn remove(&self, key: &KvKey) -> Result<bool, KvError> {
        let affected = self
            .lock()?
            .execute("DELETE FROM kv_entries WHERE key = ?1", [key.raw()])
            .map_err(sqlite_error)?;
        Ok(affected > 0)
    }

    fn keys(&self, namespace: &KeyNamespace) -> Result<Vec<String>, KvError> {
        let prefix = format!("{}:", namespace.prefix());
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT key FROM kv_entries ORDER BY key")
            .map_err(sqlite_error)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(sqlite_error)?;

        let mut keys = Vec::new();
        for row in rows {
            let raw = row.map_err(sqlite_error)?;
            if let Some(stripped) = raw.strip_prefix(&prefix) {
                keys.push(stripped.to_string());
            }
        }
        Ok(keys)
    }
}

/// JSON view over one namespace of a [`KeyValueStore`].
pub struct TypedKvStore<T> {
    namespace: KeyNamespace,
    _phantom: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> TypedKvStore<T> {
    pub fn new(namespace: KeyNamespace) -> Self {
        Self {
            namespace,
            _phantom: PhantomData,
        }
    }

    pub fn load<S: KeyValueStore + ?Sized>(&self, store: &S, key: &str) -> Result<Option<T>, KvError> {
        let key = KvKey::new(self.namespace.clone(), key)?;
        match store.get(&key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| KvError::Serialization {
                    message: e.to_string(),
                    key: Some(key.raw()),
                }),
            None => Ok(None),
        }
    }

    pub fn save<S: KeyValueStore + ?Sized>(&self, store: &S, key: &str, value: &T) -> Result<(), KvError> {
        let key = KvKey::new(self.namespace.clone(), key)?;
        let data = serde_json::to_vec(value).map_err(|e| KvError::Serialization {
            message: e.to_string(),
            key: Some(key.raw()),
        })?;
        store.set(&key, &data)
    }
}

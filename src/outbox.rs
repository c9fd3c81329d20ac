//! Offline queue.
//!
//! Operations that could not (or should not) be sent right away are queued
//! here, persisted as one JSON array through a [`KeyValueStore`], and drained
//! through a [`SyncTransport`] when connectivity allows.
//!
//! Retry bookkeeping is a plain counter. Once `retry_count` reaches
//! `max_retries` the item is marked synced *and* abandoned: synced so no
//! further drain picks it up, abandoned so callers can tell a give-up from a
//! delivery.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Notify, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::kv::KeyValueStore;
use crate::model::{Clock, Priority, UnixTimeMs};
use crate::offline_store::{self, QueueStore, StoreError, StoreLimits};
use crate::state::StateCell;

pub const MAX_ITEM_ID_LENGTH: usize = 128;
pub const MAX_ITEM_TYPE_LENGTH: usize = 128;
const ID_SUFFIX_LENGTH: usize = 9;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Result<Self, OutboxError> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_ITEM_ID_LENGTH {
            return Err(OutboxError::InvalidId(format!(
                "length must be 1..={}",
                MAX_ITEM_ID_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(OutboxError::InvalidId(id));
        }
        Ok(Self(id))
    }

    /// `<unix-ms>-<9 alphanumerics>`.
    pub fn generate(now: UnixTimeMs) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(ID_SUFFIX_LENGTH)
            .map(char::from)
            .collect();
        Self(format!("{}-{}", now.0, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ItemId {
    type Error = OutboxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ItemId> for String {
    fn from(id: ItemId) -> Self {
        id.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Synced,
    Abandoned,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedItem {
    pub id: ItemId,
    #[serde(rename = "type")]
    pub item_type: String,
    pub payload: serde_json::Value,
    pub created_at: UnixTimeMs,
    pub synced: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub abandoned: bool,
}

impl QueuedItem {
    pub fn new(
        id: ItemId,
        item_type: impl Into<String>,
        payload: serde_json::Value,
        priority: Priority,
        max_retries: u32,
        created_at: UnixTimeMs,
    ) -> Self {
        Self {
            id,
            item_type: item_type.into(),
            payload,
            created_at,
            synced: false,
            retry_count: 0,
            max_retries,
            priority,
            abandoned: false,
        }
    }

    pub fn status(&self) -> ItemStatus {
        if self.abandoned || (self.synced && self.retries_exhausted()) {
            ItemStatus::Abandoned
        } else if self.synced {
            ItemStatus::Synced
        } else {
            ItemStatus::Pending
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.synced
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    fn mark_delivered(&mut self) {
        self.synced = true;
    }

    /// Returns true when this failure used up the retry budget.
    fn record_failure(&mut self) -> bool {
        self.retry_count = self.retry_count.saturating_add(1);
        if self.retries_exhausted() {
            self.synced = true;
            self.abandoned = true;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DeliveryError(pub String);

impl DeliveryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Delivers one queued item upstream. The wire protocol is the
/// implementor's business.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn deliver(&self, item: &QueuedItem) -> Result<(), DeliveryError>;
}

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("storage limit exceeded: {needed} bytes needed, limit is {limit}")]
    StorageLimitExceeded { needed: usize, limit: usize },

    #[error("outbox is full ({0} entries)")]
    Full(usize),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl OutboxError {
    pub fn is_retryable(&self) -> bool {
        match self {
            OutboxError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutboxConfig {
    pub storage_key: String,
    pub max_storage_bytes: usize,
    pub max_entries: usize,
    pub default_max_retries: u32,
    pub auto_sync: bool,
    pub sync_interval_ms: u64,
    pub sync_on_reconnect: bool,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            storage_key: "queue".into(),
            max_storage_bytes: 5 * 1024 * 1024,
            max_entries: 1_000,
            default_max_retries: 3,
            auto_sync: true,
            sync_interval_ms: 30_000,
            sync_on_reconnect: true,
        }
    }
}

impl OutboxConfig {
    pub fn with_max_storage_bytes(mut self, bytes: usize) -> Self {
        self.max_storage_bytes = bytes;
        self
    }

    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    pub fn with_sync_interval_ms(mut self, interval_ms: u64) -> Self {
        self.sync_interval_ms = interval_ms;
        self
    }

    pub fn with_auto_sync(mut self, enabled: bool) -> Self {
        self.auto_sync = enabled;
        self
    }

    pub fn with_sync_on_reconnect(mut self, enabled: bool) -> Self {
        self.sync_on_reconnect = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), OutboxError> {
        if self.storage_key.trim().is_empty() {
            return Err(OutboxError::Validation("storage_key must not be empty".into()));
        }
        if self.max_storage_bytes == 0 {
            return Err(OutboxError::Validation("max_storage_bytes must be > 0".into()));
        }
        if self.max_storage_bytes > offline_store::MAX_QUEUE_BYTES {
            return Err(OutboxError::Validation(format!(
                "max_storage_bytes must be <= {}",
                offline_store::MAX_QUEUE_BYTES
            )));
        }
        if self.max_entries == 0 || self.max_entries > offline_store::MAX_QUEUE_ENTRIES {
            return Err(OutboxError::Validation(format!(
                "max_entries must be 1..={}",
                offline_store::MAX_QUEUE_ENTRIES
            )));
        }
        if self.default_max_retries == 0 {
            return Err(OutboxError::Validation("default_max_retries must be > 0".into()));
        }
        if self.sync_interval_ms < 1_000 {
            return Err(OutboxError::Validation(
                "sync_interval_ms should be at least 1000ms".into(),
            ));
        }
        Ok(())
    }

    fn limits(&self) -> StoreLimits {
        StoreLimits {
            max_bytes: self.max_storage_bytes,
            max_entries: self.max_entries,
        }
    }
}

/// Aggregate view published after every queue mutation. Never persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_sync: Option<UnixTimeMs>,
    pub pending_items: usize,
    pub failed_items: usize,
    pub total_items: usize,
    pub sync_progress: u8,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    pub used_bytes: usize,
    pub limit_bytes: usize,
    pub entries: usize,
    pub percent: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed,
    Offline,
    AlreadyRunning,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrainReport {
    pub outcome: DrainOutcome,
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub skipped: usize,
}

impl DrainReport {
    /// Items this drain is done with: delivered, abandoned, or gone from the
    /// queue before they could be sent.
    pub fn settled(&self) -> usize {
        self.delivered + self.abandoned + self.skipped
    }

    fn empty(outcome: DrainOutcome) -> Self {
        Self {
            outcome,
            attempted: 0,
            delivered: 0,
            failed: 0,
            abandoned: 0,
            skipped: 0,
        }
    }
}

fn progress_percent(done: usize, batch: usize) -> u8 {
    if batch == 0 {
        return 100;
    }
    ((done.min(batch) * 100) / batch) as u8
}

#[derive(Debug, Default)]
pub struct OutboxMetrics {
    pub items_stored: AtomicU64,
    pub items_delivered: AtomicU64,
    pub delivery_failures: AtomicU64,
    pub items_abandoned: AtomicU64,
    pub drains_completed: AtomicU64,
    pub budget_rejections: AtomicU64,
    pub storage_errors: AtomicU64,
}

impl OutboxMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            items_stored: self.items_stored.load(Ordering::Relaxed),
            items_delivered: self.items_delivered.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            items_abandoned: self.items_abandoned.load(Ordering::Relaxed),
            drains_completed: self.drains_completed.load(Ordering::Relaxed),
            budget_rejections: self.budget_rejections.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub items_stored: u64,
    pub items_delivered: u64,
    pub delivery_failures: u64,
    pub items_abandoned: u64,
    pub drains_completed: u64,
    pub budget_rejections: u64,
    pub storage_errors: u64,
}

struct OutboxState {
    items: Vec<QueuedItem>,
    online: bool,
    last_sync: Option<UnixTimeMs>,
    progress: u8,
    error: Option<String>,
}

impl OutboxState {
    fn position(&self, id: &ItemId) -> Option<usize> {
        self.items.iter().position(|item| &item.id == id)
    }
}

/// Clears the drain flag however the drain future ends, including when it
/// is dropped mid-delivery.
struct DrainGuard<'a> {
    syncing: &'a AtomicBool,
    status: &'a StateCell<SyncStatus>,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.syncing.store(false, Ordering::Release);
        self.status.update(|s| s.is_syncing = false);
    }
}

pub struct Outbox<S: KeyValueStore, T: SyncTransport> {
    store: QueueStore<S>,
    transport: Arc<T>,
    config: OutboxConfig,
    clock: Arc<dyn Clock>,
    state: RwLock<OutboxState>,
    status: StateCell<SyncStatus>,
    syncing: AtomicBool,
    sync_requested: Arc<Notify>,
    metrics: OutboxMetrics,
    quarantined: Option<String>,
}

impl<S: KeyValueStore, T: SyncTransport> Outbox<S, T> {
    /// Loads the persisted queue. A blob that does not decode is moved aside
    /// and the queue starts empty.
    #[instrument(skip(kv, transport, config, clock))]
    pub fn new(
        kv: Arc<S>,
        transport: Arc<T>,
        config: OutboxConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, OutboxError> {
        config.validate()?;

        let store = QueueStore::new(kv, &config.storage_key, config.limits())?;
        let (items, quarantined) = match store.load() {
            Ok(items) => (items, None),
            Err(
                e @ (StoreError::Corrupted { .. }
                | StoreError::TooLarge { .. }
                | StoreError::TooManyEntries { .. }),
            ) => {
                warn!(error = %e, "persisted queue unreadable, starting empty");
                store.quarantine()?;
                (Vec::new(), Some(e.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            entries = items.len(),
            pending = items.iter().filter(|i| i.is_pending()).count(),
            quarantined = quarantined.is_some(),
            "outbox initialized"
        );

        let outbox = Self {
            store,
            transport,
            config,
            clock,
            state: RwLock::new(OutboxState {
                items,
                online: true,
                last_sync: None,
                progress: 0,
                error: None,
            }),
            status: StateCell::default(),
            syncing: AtomicBool::new(false),
            sync_requested: Arc::new(Notify::new()),
            metrics: OutboxMetrics::default(),
            quarantined,
        };

        if let Ok(state) = outbox.state.try_read() {
            outbox.publish(&state);
        }
        Ok(outbox)
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Why the persisted queue was discarded at startup, if it was.
    pub fn quarantined(&self) -> Option<&str> {
        self.quarantined.as_deref()
    }

    fn publish(&self, state: &OutboxState) {
        let mut pending = 0;
        let mut failed = 0;
        for item in &state.items {
            match item.status() {
                ItemStatus::Pending => pending += 1,
                ItemStatus::Abandoned => failed += 1,
                ItemStatus::Synced => {}
            }
        }

        self.status.set(SyncStatus {
            is_online: state.online,
            is_syncing: self.syncing.load(Ordering::Acquire),
            last_sync: state.last_sync,
            pending_items: pending,
            failed_items: failed,
            total_items: state.items.len(),
            sync_progress: state.progress,
            error: state.error.clone(),
        });
    }

    fn persist(&self, state: &OutboxState) -> Result<(), StoreError> {
        self.store.save(&state.items).map_err(|e| {
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to persist queue");
            e
        })
    }

    /// Queues an operation. Rejected without touching the queue when the
    /// persisted size would exceed the storage budget.
    #[instrument(skip(self, item_type, payload), fields(item_type = %item_type))]
    pub async fn store(
        &self,
        item_type: &str,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Result<ItemId, OutboxError> {
        if item_type.trim().is_empty() || item_type.len() > MAX_ITEM_TYPE_LENGTH {
            return Err(OutboxError::Validation(format!(
                "item type must be 1..={} bytes",
                MAX_ITEM_TYPE_LENGTH
            )));
        }

        let mut state = self.state.write().await;

        if state.items.len() >= self.config.max_entries {
            return Err(OutboxError::Full(self.config.max_entries));
        }

        let id = ItemId::generate(self.clock.now_ms());
        state.items.push(QueuedItem::new(
            id.clone(),
            item_type,
            payload,
            priority,
            self.config.default_max_retries,
            self.clock.now_ms(),
        ));

        let needed = match offline_store::encoded_len(&state.items) {
            Ok(needed) => needed,
            Err(e) => {
                state.items.pop();
                return Err(e.into());
            }
        };
        if needed > self.config.max_storage_bytes {
            state.items.pop();
            self.metrics.budget_rejections.fetch_add(1, Ordering::Relaxed);
            warn!(needed, limit = self.config.max_storage_bytes, "storage budget exceeded");
            return Err(OutboxError::StorageLimitExceeded {
                needed,
                limit: self.config.max_storage_bytes,
            });
        }

        if let Err(e) = self.persist(&state) {
            state.items.pop();
            return Err(e.into());
        }

        self.metrics.items_stored.fetch_add(1, Ordering::Relaxed);
        self.publish(&state);
        let online = state.online;
        drop(state);

        info!(item_id = %id, %priority, "item queued");
        if online {
            self.sync_requested.notify_one();
        }
        Ok(id)
    }

    /// Delivers every pending item once, high priority first.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> DrainReport {
        if !self.state.read().await.online {
            debug!("offline, drain skipped");
            return DrainReport::empty(DrainOutcome::Offline);
        }

        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("drain already running");
            return DrainReport::empty(DrainOutcome::AlreadyRunning);
        }
        let guard = DrainGuard {
            syncing: &self.syncing,
            status: &self.status,
        };

        let mut batch: Vec<QueuedItem> = {
            let mut state = self.state.write().await;
            state.progress = 0;
            state.error = None;
            self.publish(&state);
            state.items.iter().filter(|i| i.is_pending()).cloned().collect()
        };
        batch.sort_by_key(|item| item.priority);

        let mut report = DrainReport::empty(DrainOutcome::Completed);
        let total = batch.len();
        info!(batch = total, "drain started");

        for item in &batch {
            let still_pending = {
                let state = self.state.read().await;
                state
                    .position(&item.id)
                    .map(|at| state.items[at].is_pending())
                    .unwrap_or(false)
            };
            if !still_pending {
                report.skipped += 1;
                let mut state = self.state.write().await;
                state.progress = progress_percent(report.settled(), total);
                self.publish(&state);
                continue;
            }

            report.attempted += 1;
            let result = self.transport.deliver(item).await;

            let mut state = self.state.write().await;
            let Some(at) = state.position(&item.id) else {
                debug!(item_id = %item.id, "item removed during delivery");
                report.skipped += 1;
                state.progress = progress_percent(report.settled(), total);
                self.publish(&state);
                continue;
            };

            match result {
                Ok(()) => {
                    state.items[at].mark_delivered();
                    report.delivered += 1;
                    self.metrics.items_delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(item_id = %item.id, "item delivered");
                }
                Err(e) => {
                    self.metrics.delivery_failures.fetch_add(1, Ordering::Relaxed);
                    let entry = &mut state.items[at];
                    if entry.record_failure() {
                        report.abandoned += 1;
                        self.metrics.items_abandoned.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            item_id = %item.id,
                            retries = entry.retry_count,
                            error = %e,
                            "retries exhausted, item abandoned"
                        );
                    } else {
                        report.failed += 1;
                        debug!(
                            item_id = %item.id,
                            retries = entry.retry_count,
                            error = %e,
                            "delivery failed, will retry"
                        );
                    }
                }
            }

            if let Err(e) = self.persist(&state) {
                state.error = Some(e.to_string());
            }
            state.progress = progress_percent(report.settled(), total);
            self.publish(&state);
        }

        let mut state = self.state.write().await;
        state.last_sync = Some(self.clock.now_ms());
        drop(guard);
        self.publish(&state);
        drop(state);

        self.metrics.drains_completed.fetch_add(1, Ordering::Relaxed);
        info!(
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed,
            abandoned = report.abandoned,
            "drain finished"
        );
        report
    }

    pub async fn get(&self, id: &ItemId) -> Option<QueuedItem> {
        let state = self.state.read().await;
        state.position(id).map(|at| state.items[at].clone())
    }

    pub async fn items(&self) -> Vec<QueuedItem> {
        self.state.read().await.items.clone()
    }

    pub async fn pending_items(&self) -> Vec<QueuedItem> {
        self.state
            .read()
            .await
            .items
            .iter()
            .filter(|i| i.is_pending())
            .cloned()
            .collect()
    }

    #[instrument(skip(self), fields(item_id = %id))]
    pub async fn delete(&self, id: &ItemId) -> Result<bool, OutboxError> {
        let mut state = self.state.write().await;
        let Some(at) = state.position(id) else {
            return Ok(false);
        };

        let removed = state.items.remove(at);
        if let Err(e) = self.persist(&state) {
            state.items.insert(at, removed);
            return Err(e.into());
        }
        self.publish(&state);
        Ok(true)
    }

    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<(), OutboxError> {
        let mut state = self.state.write().await;
        let previous = std::mem::take(&mut state.items);
        if let Err(e) = self.persist(&state) {
            state.items = previous;
            return Err(e.into());
        }
        state.progress = 0;
        self.publish(&state);
        info!(removed = previous.len(), "queue cleared");
        Ok(())
    }

    /// Drops delivered items. Abandoned ones stay so they can be retried.
    pub async fn clear_synced(&self) -> Result<usize, OutboxError> {
        self.replace_items(|items| {
            let before = items.len();
            items.retain(|i| i.status() != ItemStatus::Synced);
            before - items.len()
        })
        .await
    }

    /// Puts abandoned items back in line with a fresh retry budget.
    pub async fn retry_abandoned(&self) -> Result<usize, OutboxError> {
        let reset = self
            .replace_items(|items| {
                let mut reset = 0;
                for item in items.iter_mut().filter(|i| i.status() == ItemStatus::Abandoned) {
                    item.synced = false;
                    item.abandoned = false;
                    item.retry_count = 0;
                    reset += 1;
                }
                reset
            })
            .await?;

        if reset > 0 && self.is_online().await {
            self.sync_requested.notify_one();
        }
        Ok(reset)
    }

    /// Applies `f` to a copy of the queue and commits it only if it persists.
    async fn replace_items<F>(&self, f: F) -> Result<usize, OutboxError>
    where
        F: FnOnce(&mut Vec<QueuedItem>) -> usize,
    {
        let mut state = self.state.write().await;
        let mut items = state.items.clone();
        let changed = f(&mut items);
        if changed == 0 {
            return Ok(0);
        }

        let previous = std::mem::replace(&mut state.items, items);
        if let Err(e) = self.persist(&state) {
            state.items = previous;
            return Err(e.into());
        }
        self.publish(&state);
        Ok(changed)
    }

    pub async fn storage_usage(&self) -> Result<StorageUsage, OutboxError> {
        let state = self.state.read().await;
        let used = offline_store::encoded_len(&state.items)?;
        let limit = self.config.max_storage_bytes;
        Ok(StorageUsage {
            used_bytes: used,
            limit_bytes: limit,
            entries: state.items.len(),
            percent: ((used.min(limit) * 100) / limit) as u8,
        })
    }

    /// Returns true when this flips the connectivity flag.
    pub async fn set_online(&self, online: bool) -> bool {
        let mut state = self.state.write().await;
        if state.online == online {
            return false;
        }
        state.online = online;
        self.publish(&state);
        info!(online, "outbox connectivity changed");
        true
    }

    pub async fn is_online(&self) -> bool {
        self.state.read().await.online
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub fn status(&self) -> SyncStatus {
        self.status.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Woken whenever a store asks for a prompt sync.
    pub fn sync_requests(&self) -> Arc<Notify> {
        Arc::clone(&self.sync_requested)
    }

    /// Same JSON shape as the persisted queue.
    pub async fn export(&self) -> Result<Vec<u8>, OutboxError> {
        let state = self.state.read().await;
        Ok(offline_store::encode_queue(&state.items)?)
    }

    /// Replaces the whole queue with a previously exported one.
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn import(&self, bytes: &[u8]) -> Result<usize, OutboxError> {
        if bytes.len() > self.config.max_storage_bytes {
            return Err(OutboxError::StorageLimitExceeded {
                needed: bytes.len(),
                limit: self.config.max_storage_bytes,
            });
        }
        let items = offline_store::decode_queue(bytes, self.config.limits())?;
        self.install(items).await
    }

    async fn install(&self, items: Vec<QueuedItem>) -> Result<usize, OutboxError> {
        let needed = offline_store::encoded_len(&items)?;
        if needed > self.config.max_storage_bytes {
            return Err(OutboxError::StorageLimitExceeded {
                needed,
                limit: self.config.max_storage_bytes,
            });
        }

        let count = items.len();
        let mut state = self.state.write().await;
        let previous = std::mem::replace(&mut state.items, items);
        if let Err(e) = self.persist(&state) {
            state.items = previous;
            return Err(e.into());
        }
        self.publish(&state);
        info!(entries = count, "queue imported");
        Ok(count)
    }

    pub async fn export_to_path(&self, path: &Path) -> Result<(), OutboxError> {
        let state = self.state.read().await;
        offline_store::save_to_path(path, &state.items)?;
        Ok(())
    }

    pub async fn import_from_path(&self, path: &Path) -> Result<usize, OutboxError> {
        let items = offline_store::load_from_path(path, self.config.limits())?;
        self.install(items).await
    }
}

//! Notification dispatch and inbox.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveTime;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::capabilities::bridge::{CapabilityBridge, ProviderSource};
use crate::capabilities::kv::{KeyNamespace, KeyValueStore, KvError, TypedKvStore};
use crate::capabilities::push::{
    DeliveryOptions, NotificationProvider, PermissionState, PushError, PushProvider,
};
use crate::model::{format_time_of_day, parse_time_of_day, Clock, Priority, UnixTimeMs, ValidationError};
use crate::state::StateCell;

pub const MAX_INBOX_ENTRIES: usize = 500;
pub const MAX_TITLE_LENGTH: usize = 256;
pub const MAX_BODY_LENGTH: usize = 4_096;
pub const DEFAULT_CATEGORY: &str = "general";
pub const DEFAULT_CHANNEL: &str = "default";

const INBOX_KEY: &str = "inbox";
const SETTINGS_KEY: &str = "settings";

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::model::{format_time_of_day, parse_time_of_day};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_time_of_day(*time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_time_of_day(&raw).map_err(serde::de::Error::custom)
    }
}

/// Local-time window in which notifications are held back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub enabled: bool,
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            enabled: false,
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl QuietHours {
    pub fn new(start: &str, end: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            enabled: true,
            start: parse_time_of_day(start)?,
            end: parse_time_of_day(end)?,
        })
    }

    /// `start > end` wraps past midnight; `start == end` is an empty window.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if !self.enabled || self.start == self.end {
            return false;
        }
        if self.start < self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    #[default]
    Default,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub importance: Importance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub sound: bool,
    pub vibration: bool,
    pub quiet_hours: QuietHours,
    pub categories: BTreeMap<String, bool>,
    pub channels: Vec<NotificationChannel>,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        let categories = ["general", "attendance", "access", "system"]
            .into_iter()
            .map(|c| (c.to_string(), true))
            .collect();

        Self {
            enabled: true,
            sound: true,
            vibration: true,
            quiet_hours: QuietHours::default(),
            categories,
            channels: vec![NotificationChannel {
                id: DEFAULT_CHANNEL.into(),
                name: "Default".into(),
                description: String::new(),
                importance: Importance::Default,
            }],
        }
    }
}

impl NotificationSettings {
    /// Unknown categories are allowed.
    pub fn category_enabled(&self, category: &str) -> bool {
        self.categories.get(category).copied().unwrap_or(true)
    }

    pub fn delivery_options(&self) -> DeliveryOptions {
        DeliveryOptions {
            sound: self.sound,
            vibration: self.vibration,
        }
    }

    pub fn validate(&self) -> Result<(), NotifyError> {
        let mut seen = std::collections::HashSet::new();
        for channel in &self.channels {
            if channel.id.trim().is_empty() {
                return Err(NotifyError::Validation("channel id must not be empty".into()));
            }
            if !seen.insert(channel.id.as_str()) {
                return Err(NotifyError::Validation(format!("duplicate channel {}", channel.id)));
            }
        }
        if self.categories.keys().any(|c| c.trim().is_empty()) {
            return Err(NotifyError::Validation("category must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub body: String,
    pub timestamp: UnixTimeMs,
    pub read: bool,
    pub category: String,
    pub priority: Priority,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    pub title: String,
    pub body: String,
    pub category: String,
    pub priority: Priority,
    pub channel_id: String,
    pub data: Option<serde_json::Value>,
}

impl NotificationRequest {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            category: DEFAULT_CATEGORY.into(),
            priority: Priority::Normal,
            channel_id: DEFAULT_CHANNEL.into(),
            data: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = channel_id.into();
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    fn validate(&self) -> Result<(), NotifyError> {
        if self.title.trim().is_empty() {
            return Err(NotifyError::Validation("title must not be empty".into()));
        }
        if self.title.len() > MAX_TITLE_LENGTH {
            return Err(ValidationError::TooLong {
                len: self.title.len(),
                max: MAX_TITLE_LENGTH,
            }
            .into());
        }
        if self.body.len() > MAX_BODY_LENGTH {
            return Err(ValidationError::TooLong {
                len: self.body.len(),
                max: MAX_BODY_LENGTH,
            }
            .into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    QuietHours,
    CategoryDisabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Delivered { id: String, source: ProviderSource },
    /// Saved to the inbox but no provider could display it.
    InboxOnly { id: String },
    Suppressed(SuppressReason),
}

impl Dispatch {
    /// Empty for suppressed notifications.
    pub fn id(&self) -> &str {
        match self {
            Dispatch::Delivered { id, .. } | Dispatch::InboxOnly { id } => id,
            Dispatch::Suppressed(_) => "",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushRegistration {
    pub source: ProviderSource,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification permission not granted")]
    PermissionDenied,

    #[error("notifications are disabled")]
    Disabled,

    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    InvalidValue(#[from] ValidationError),

    #[error("storage error: {0}")]
    Storage(#[from] KvError),

    #[error("push error: {0}")]
    Push(#[from] PushError),
}

impl NotifyError {
    pub fn is_permission_error(&self) -> bool {
        matches!(
            self,
            NotifyError::PermissionDenied | NotifyError::Push(PushError::PermissionDenied)
        )
    }
}

pub struct NotificationDispatcher<S: KeyValueStore> {
    kv: Arc<S>,
    bridge: Arc<CapabilityBridge>,
    clock: Arc<dyn Clock>,
    inbox_store: TypedKvStore<Vec<Notification>>,
    settings_store: TypedKvStore<NotificationSettings>,
    inbox: RwLock<Vec<Notification>>,
    inbox_view: StateCell<Vec<Notification>>,
    settings: StateCell<NotificationSettings>,
    permission: StateCell<PermissionState>,
    push_token: RwLock<Option<SecretString>>,
}

impl<S: KeyValueStore> NotificationDispatcher<S> {
    /// Restores persisted settings and inbox; unreadable data falls back to
    /// `defaults` and an empty inbox.
    #[instrument(skip_all)]
    pub fn new(
        kv: Arc<S>,
        bridge: Arc<CapabilityBridge>,
        clock: Arc<dyn Clock>,
        defaults: NotificationSettings,
    ) -> Result<Self, NotifyError> {
        defaults.validate()?;

        let inbox_store = TypedKvStore::new(KeyNamespace::Notifications);
        let settings_store = TypedKvStore::new(KeyNamespace::Notifications);

        let settings = match settings_store.load(kv.as_ref(), SETTINGS_KEY) {
            Ok(Some(settings)) => settings,
            Ok(None) => defaults,
            Err(KvError::Serialization { message, .. }) => {
                warn!(error = %message, "stored notification settings unreadable, using defaults");
                defaults
            }
            Err(e) => return Err(e.into()),
        };

        let mut inbox: Vec<Notification> = match inbox_store.load(kv.as_ref(), INBOX_KEY) {
            Ok(inbox) => inbox.unwrap_or_default(),
            Err(KvError::Serialization { message, .. }) => {
                warn!(error = %message, "stored inbox unreadable, starting empty");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        inbox.truncate(MAX_INBOX_ENTRIES);

        info!(inbox = inbox.len(), enabled = settings.enabled, "notification dispatcher ready");

        Ok(Self {
            kv,
            bridge,
            clock,
            inbox_store,
            settings_store,
            inbox_view: StateCell::new(inbox.clone()),
            inbox: RwLock::new(inbox),
            settings: StateCell::new(settings),
            permission: StateCell::new(PermissionState::NotDetermined),
            push_token: RwLock::new(None),
        })
    }

    pub fn permission(&self) -> PermissionState {
        self.permission.get()
    }

    pub fn subscribe_permission(&self) -> watch::Receiver<PermissionState> {
        self.permission.subscribe()
    }

    /// Reads the permission without prompting. Failures leave it unchanged.
    pub async fn refresh_permission(&self) -> PermissionState {
        match self
            .bridge
            .notifications()
            .run(|p| async move { p.permission().await })
            .await
        {
            Ok((state, _)) => self.permission.set(state),
            Err(e) => debug!(error = %e, "permission query failed"),
        }
        self.permission.get()
    }

    #[instrument(skip(self))]
    pub async fn request_permission(&self) -> Result<PermissionState, NotifyError> {
        let (state, source) = self
            .bridge
            .notifications()
            .run(|p| async move { p.request_permission().await })
            .await
            .map_err(|e| e.into_error(|_| PushError::NotAvailable))?;

        info!(?state, ?source, "notification permission resolved");
        self.permission.set(state);
        Ok(state)
    }

    pub fn settings(&self) -> NotificationSettings {
        self.settings.get()
    }

    pub fn subscribe_settings(&self) -> watch::Receiver<NotificationSettings> {
        self.settings.subscribe()
    }

    pub fn update_settings(&self, settings: NotificationSettings) -> Result<(), NotifyError> {
        settings.validate()?;
        self.settings_store.save(self.kv.as_ref(), SETTINGS_KEY, &settings)?;
        self.settings.set(settings);
        Ok(())
    }

    pub fn set_quiet_hours(&self, quiet_hours: QuietHours) -> Result<(), NotifyError> {
        let mut settings = self.settings();
        settings.quiet_hours = quiet_hours;
        info!(
            enabled = quiet_hours.enabled,
            start = %format_time_of_day(quiet_hours.start),
            end = %format_time_of_day(quiet_hours.end),
            "quiet hours updated"
        );
        self.update_settings(settings)
    }

    pub fn set_category_enabled(&self, category: &str, enabled: bool) -> Result<(), NotifyError> {
        let mut settings = self.settings();
        settings.categories.insert(category.to_string(), enabled);
        self.update_settings(settings)
    }

    pub fn is_quiet_time(&self) -> bool {
        self.settings().quiet_hours.contains(self.clock.local_time())
    }

    /// Gates, records and delivers one notification.
    #[instrument(skip(self, request), fields(category = %request.category))]
    pub async fn send(&self, request: NotificationRequest) -> Result<Dispatch, NotifyError> {
        request.validate()?;

        if !self.permission().is_granted() {
            return Err(NotifyError::PermissionDenied);
        }

        let settings = self.settings();
        if !settings.enabled {
            return Err(NotifyError::Disabled);
        }

        if settings.quiet_hours.contains(self.clock.local_time()) {
            debug!("suppressed by quiet hours");
            return Ok(Dispatch::Suppressed(SuppressReason::QuietHours));
        }

        if !settings.category_enabled(&request.category) {
            debug!("suppressed by category setting");
            return Ok(Dispatch::Suppressed(SuppressReason::CategoryDisabled));
        }

        let notification = Notification {
            id: Uuid::new_v4().to_string(),
            title: request.title,
            body: request.body,
            timestamp: self.clock.now_ms(),
            read: false,
            category: request.category,
            priority: request.priority,
            channel_id: request.channel_id,
            data: request.data,
        };
        let id = notification.id.clone();

        self.modify_inbox(|inbox| {
            inbox.insert(0, notification.clone());
            inbox.truncate(MAX_INBOX_ENTRIES);
            true
        })
        .await?;

        let options = settings.delivery_options();
        let shown = &notification;
        let options = &options;
        match self
            .bridge
            .notifications()
            .run(|p| async move { p.show(shown, options).await })
            .await
        {
            Ok(((), source)) => {
                info!(notification_id = %id, ?source, "notification delivered");
                Ok(Dispatch::Delivered { id, source })
            }
            Err(e) => {
                warn!(notification_id = %id, error = %e, "no provider displayed notification");
                Ok(Dispatch::InboxOnly { id })
            }
        }
    }

    /// Runs `f` on the inbox and persists when it reports a change.
    async fn modify_inbox<F>(&self, f: F) -> Result<bool, NotifyError>
    where
        F: FnOnce(&mut Vec<Notification>) -> bool,
    {
        let mut inbox = self.inbox.write().await;
        let mut next = inbox.clone();
        if !f(&mut next) {
            return Ok(false);
        }
        self.inbox_store.save(self.kv.as_ref(), INBOX_KEY, &next)?;
        *inbox = next;
        self.inbox_view.set(inbox.clone());
        Ok(true)
    }

    /// Newest first.
    pub async fn notifications(&self) -> Vec<Notification> {
        self.inbox.read().await.clone()
    }

    pub async fn unread_count(&self) -> usize {
        self.inbox.read().await.iter().filter(|n| !n.read).count()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Notification>> {
        self.inbox_view.subscribe()
    }

    async fn set_read(&self, id: &str, read: bool) -> Result<bool, NotifyError> {
        self.modify_inbox(|inbox| match inbox.iter_mut().find(|n| n.id == id) {
            Some(n) if n.read != read => {
                n.read = read;
                true
            }
            _ => false,
        })
        .await
    }

    pub async fn mark_read(&self, id: &str) -> Result<bool, NotifyError> {
        self.set_read(id, true).await
    }

    pub async fn mark_unread(&self, id: &str) -> Result<bool, NotifyError> {
        self.set_read(id, false).await
    }

    pub async fn mark_all_read(&self) -> Result<usize, NotifyError> {
        let mut changed = 0;
        self.modify_inbox(|inbox| {
            for n in inbox.iter_mut().filter(|n| !n.read) {
                n.read = true;
                changed += 1;
            }
            changed > 0
        })
        .await?;
        Ok(changed)
    }

    pub async fn delete(&self, id: &str) -> Result<bool, NotifyError> {
        self.modify_inbox(|inbox| {
            let before = inbox.len();
            inbox.retain(|n| n.id != id);
            inbox.len() != before
        })
        .await
    }

    pub async fn clear(&self) -> Result<(), NotifyError> {
        self.modify_inbox(|inbox| {
            let had_any = !inbox.is_empty();
            inbox.clear();
            had_any
        })
        .await?;
        Ok(())
    }

    /// Obtains a device token for remote push. The token is kept in memory
    /// only and never logged.
    #[instrument(skip(self))]
    pub async fn register_push(&self) -> Result<PushRegistration, NotifyError> {
        if !self.permission().is_granted() {
            return Err(NotifyError::PermissionDenied);
        }

        let (token, source) = self
            .bridge
            .push()
            .run(|p| async move { p.register().await })
            .await
            .map_err(|e| e.into_error(|_| PushError::NotAvailable))?;

        *self.push_token.write().await = Some(token);
        info!(?source, "registered for push");
        Ok(PushRegistration { source })
    }

    pub async fn push_token(&self) -> Option<SecretString> {
        self.push_token.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use proptest::prelude::*;
    use secrecy::ExposeSecret;

    use super::*;
    use crate::capabilities::bridge::{Provider, ProviderError, ProviderRegistry, StaticHost};
    use crate::capabilities::kv::{KvKey, MemoryStore};
    use crate::model::FixedClock;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    struct FakeNotifier {
        source: ProviderSource,
        fail_show: AtomicBool,
        shown: AtomicUsize,
    }

    impl FakeNotifier {
        fn new(source: ProviderSource) -> Self {
            Self {
                source,
                fail_show: AtomicBool::new(false),
                shown: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Provider for FakeNotifier {
        fn name(&self) -> &str {
            "fake-notifier"
        }

        fn source(&self) -> ProviderSource {
            self.source
        }

        async fn probe(&self) -> Result<bool, ProviderError> {
            Ok(true)
        }
    }

    #[async_trait]
    impl NotificationProvider for FakeNotifier {
        async fn permission(&self) -> Result<PermissionState, PushError> {
            Ok(PermissionState::Granted)
        }

        async fn request_permission(&self) -> Result<PermissionState, PushError> {
            Ok(PermissionState::Granted)
        }

        async fn show(&self, _n: &Notification, _o: &DeliveryOptions) -> Result<(), PushError> {
            if self.fail_show.load(Ordering::SeqCst) {
                return Err(PushError::delivery_failed("blocked"));
            }
            self.shown.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl PushProvider for FakeNotifier {
        async fn register(&self) -> Result<SecretString, PushError> {
            Ok(SecretString::new("device-token-123".into()))
        }
    }

    async fn dispatcher_at(
        clock: FixedClock,
        notifier: Arc<FakeNotifier>,
    ) -> (NotificationDispatcher<MemoryStore>, Arc<MemoryStore>) {
        let registry = ProviderRegistry::new()
            .with_notifications(notifier.clone())
            .with_push(notifier);
        let bridge = Arc::new(CapabilityBridge::detect(&StaticHost::web(), registry).await);
        let kv = Arc::new(MemoryStore::new());
        let dispatcher = NotificationDispatcher::new(
            kv.clone(),
            bridge,
            Arc::new(clock),
            NotificationSettings::default(),
        )
        .unwrap();
        (dispatcher, kv)
    }

    async fn granted_at(clock: FixedClock) -> (NotificationDispatcher<MemoryStore>, Arc<FakeNotifier>) {
        let notifier = Arc::new(FakeNotifier::new(ProviderSource::Native));
        let (dispatcher, _) = dispatcher_at(clock, notifier.clone()).await;
        dispatcher.request_permission().await.unwrap();
        (dispatcher, notifier)
    }

    #[test]
    fn test_quiet_hours_same_day_window() {
        let q = QuietHours::new("13:00", "14:00").unwrap();
        assert!(q.contains(hm(13, 0)));
        assert!(q.contains(hm(13, 59)));
        assert!(!q.contains(hm(14, 0)));
        assert!(!q.contains(hm(12, 59)));
    }

    #[test]
    fn test_quiet_hours_wraps_midnight() {
        let q = QuietHours::new("22:00", "08:00").unwrap();
        assert!(q.contains(hm(23, 0)));
        assert!(q.contains(hm(3, 0)));
        assert!(!q.contains(hm(12, 0)));
        assert!(!q.contains(hm(8, 0)));
    }

    #[test]
    fn test_quiet_hours_disabled_or_empty() {
        let mut q = QuietHours::new("22:00", "08:00").unwrap();
        q.enabled = false;
        assert!(!q.contains(hm(23, 0)));

        let empty = QuietHours::new("09:00", "09:00").unwrap();
        assert!(!empty.contains(hm(9, 0)));
    }

    #[test]
    fn test_settings_serialize_times_as_hhmm() {
        let mut settings = NotificationSettings::default();
        settings.quiet_hours = QuietHours::new("22:30", "07:15").unwrap();

        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["quietHours"]["start"], "22:30");
        assert_eq!(json["quietHours"]["end"], "07:15");

        let back: NotificationSettings = serde_json::from_value(json).unwrap();
        assert_eq!(back, settings);

        let bad = r#"{"quietHours":{"enabled":true,"start":"25:00","end":"07:00"}}"#;
        assert!(serde_json::from_str::<NotificationSettings>(bad).is_err());
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = NotificationSettings::default();
        settings.channels.push(settings.channels[0].clone());
        assert!(matches!(settings.validate(), Err(NotifyError::Validation(_))));
    }

    #[tokio::test]
    async fn test_send_without_permission_fails() {
        let notifier = Arc::new(FakeNotifier::new(ProviderSource::Native));
        let (dispatcher, _) = dispatcher_at(FixedClock::at(12, 0), notifier).await;

        let err = dispatcher.send(NotificationRequest::new("Hi", "there")).await.unwrap_err();
        assert!(err.is_permission_error());
        assert!(dispatcher.notifications().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_when_disabled_fails() {
        let (dispatcher, _) = granted_at(FixedClock::at(12, 0)).await;
        let mut settings = dispatcher.settings();
        settings.enabled = false;
        dispatcher.update_settings(settings).unwrap();

        assert!(matches!(
            dispatcher.send(NotificationRequest::new("Hi", "there")).await,
            Err(NotifyError::Disabled)
        ));
    }

    #[tokio::test]
    async fn test_send_delivers_and_records() {
        let (dispatcher, notifier) = granted_at(FixedClock::at(12, 0)).await;

        let dispatch = dispatcher
            .send(NotificationRequest::new("Late check-in", "Ana checked in at 09:41").with_category("attendance"))
            .await
            .unwrap();

        assert!(matches!(dispatch, Dispatch::Delivered { source: ProviderSource::Native, .. }));
        assert!(!dispatch.id().is_empty());
        assert_eq!(notifier.shown.load(Ordering::SeqCst), 1);

        let inbox = dispatcher.notifications().await;
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].id, dispatch.id());
        assert_eq!(dispatcher.unread_count().await, 1);
    }

    #[tokio::test]
    async fn test_quiet_hours_suppress_without_recording() {
        for (h, suppressed) in [(23, true), (3, true), (12, false)] {
            let (dispatcher, notifier) = granted_at(FixedClock::at(h, 0)).await;
            dispatcher
                .set_quiet_hours(QuietHours::new("22:00", "08:00").unwrap())
                .unwrap();

            let dispatch = dispatcher.send(NotificationRequest::new("Door", "Opened")).await.unwrap();

            if suppressed {
                assert_eq!(dispatch, Dispatch::Suppressed(SuppressReason::QuietHours));
                assert_eq!(dispatch.id(), "");
                assert!(dispatcher.notifications().await.is_empty());
                assert_eq!(notifier.shown.load(Ordering::SeqCst), 0);
            } else {
                assert!(matches!(dispatch, Dispatch::Delivered { .. }));
            }
        }
    }

    #[tokio::test]
    async fn test_disabled_category_suppressed() {
        let (dispatcher, _) = granted_at(FixedClock::at(12, 0)).await;
        dispatcher.set_category_enabled("access", false).unwrap();

        let dispatch = dispatcher
            .send(NotificationRequest::new("Door", "Forced").with_category("access"))
            .await
            .unwrap();
        assert_eq!(dispatch, Dispatch::Suppressed(SuppressReason::CategoryDisabled));

        let other = dispatcher
            .send(NotificationRequest::new("Shift", "Starts soon").with_category("custom"))
            .await
            .unwrap();
        assert!(matches!(other, Dispatch::Delivered { .. }));
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_inbox_entry() {
        let (dispatcher, notifier) = granted_at(FixedClock::at(12, 0)).await;
        notifier.fail_show.store(true, Ordering::SeqCst);

        let dispatch = dispatcher.send(NotificationRequest::new("A", "B")).await.unwrap();

        assert!(matches!(dispatch, Dispatch::InboxOnly { .. }));
        assert_eq!(dispatcher.notifications().await.len(), 1);
    }

    #[tokio::test]
    async fn test_inbox_operations() {
        let (dispatcher, _) = granted_at(FixedClock::at(12, 0)).await;
        let first = dispatcher.send(NotificationRequest::new("1", "a")).await.unwrap();
        let second = dispatcher.send(NotificationRequest::new("2", "b")).await.unwrap();

        let inbox = dispatcher.notifications().await;
        assert_eq!(inbox[0].id, second.id());

        assert!(dispatcher.mark_read(first.id()).await.unwrap());
        assert!(!dispatcher.mark_read(first.id()).await.unwrap());
        assert_eq!(dispatcher.unread_count().await, 1);

        assert!(dispatcher.mark_unread(first.id()).await.unwrap());
        assert_eq!(dispatcher.mark_all_read().await.unwrap(), 2);
        assert_eq!(dispatcher.unread_count().await, 0);

        assert!(dispatcher.delete(first.id()).await.unwrap());
        assert!(!dispatcher.delete("missing").await.unwrap());
        assert_eq!(dispatcher.notifications().await.len(), 1);

        let mut rx = dispatcher.subscribe();
        dispatcher.clear().await.unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_empty());
    }

    #[tokio::test]
    async fn test_inbox_and_settings_persist() {
        let notifier = Arc::new(FakeNotifier::new(ProviderSource::Web));
        let (dispatcher, kv) = dispatcher_at(FixedClock::at(12, 0), notifier.clone()).await;
        dispatcher.request_permission().await.unwrap();
        dispatcher.set_category_enabled("system", false).unwrap();
        dispatcher.send(NotificationRequest::new("Saved", "x")).await.unwrap();

        let bridge = Arc::new(
            CapabilityBridge::detect(
                &StaticHost::web(),
                ProviderRegistry::new().with_notifications(notifier),
            )
            .await,
        );
        let restored = NotificationDispatcher::new(
            kv.clone(),
            bridge,
            Arc::new(FixedClock::at(12, 0)),
            NotificationSettings::default(),
        )
        .unwrap();

        assert_eq!(restored.notifications().await.len(), 1);
        assert!(!restored.settings().category_enabled("system"));

        let raw = kv
            .get(&KvKey::new(KeyNamespace::Notifications, "inbox").unwrap())
            .unwrap()
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json[0]["title"], "Saved");
        assert!(json[0]["channelId"].is_string());
    }

    #[tokio::test]
    async fn test_register_push_keeps_token_secret() {
        let (dispatcher, _) = granted_at(FixedClock::at(12, 0)).await;

        let registration = dispatcher.register_push().await.unwrap();
        assert_eq!(registration.source, ProviderSource::Native);

        let token = dispatcher.push_token().await.unwrap();
        assert_eq!(token.expose_secret(), "device-token-123");
        assert!(!format!("{:?}", token).contains("device-token-123"));
    }

    #[tokio::test]
    async fn test_register_push_requires_permission() {
        let notifier = Arc::new(FakeNotifier::new(ProviderSource::Native));
        let (dispatcher, _) = dispatcher_at(FixedClock::at(12, 0), notifier).await;
        assert!(matches!(
            dispatcher.register_push().await,
            Err(NotifyError::PermissionDenied)
        ));
    }

    #[tokio::test]
    async fn test_request_validation() {
        let (dispatcher, _) = granted_at(FixedClock::at(12, 0)).await;
        assert!(matches!(
            dispatcher.send(NotificationRequest::new("", "body")).await,
            Err(NotifyError::Validation(_))
        ));
        assert!(matches!(
            dispatcher
                .send(NotificationRequest::new("t", "x".repeat(MAX_BODY_LENGTH + 1)))
                .await,
            Err(NotifyError::InvalidValue(ValidationError::TooLong { .. }))
        ));
    }

    proptest! {
        #[test]
        fn prop_quiet_hours_match_interval_definition(
            start in 0u32..1440,
            end in 0u32..1440,
            at in 0u32..1440,
        ) {
            let t = |m: u32| hm(m / 60, m % 60);
            let q = QuietHours { enabled: true, start: t(start), end: t(end) };
            let expected = if start == end {
                false
            } else if start < end {
                start <= at && at < end
            } else {
                at >= start || at < end
            };
            prop_assert_eq!(q.contains(t(at)), expected);
        }
    }
}

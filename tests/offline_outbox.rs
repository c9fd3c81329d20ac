use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use portal_shared::capabilities::{NetworkStatus, ConnectionType, SqliteStore, StaticHost};
use portal_shared::outbox::DeliveryError;
use portal_shared::{
    DrainOutcome, ItemStatus, Outbox, OutboxConfig, PortalConfig, PortalServices, Priority,
    ProviderRegistry, QueuedItem, SyncTransport, SystemClock,
};
use serde_json::json;
use tempfile::tempdir;

#[derive(Default)]
struct RecordingTransport {
    delivered: Mutex<Vec<String>>,
    down: Mutex<HashSet<String>>,
}

impl RecordingTransport {
    fn take_down(&self, item_type: &str) {
        self.down.lock().unwrap().insert(item_type.to_string());
    }

    fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl SyncTransport for RecordingTransport {
    async fn deliver(&self, item: &QueuedItem) -> Result<(), DeliveryError> {
        if self.down.lock().unwrap().contains(&item.item_type) {
            return Err(DeliveryError::new("upstream returned 503"));
        }
        self.delivered.lock().unwrap().push(item.item_type.clone());
        Ok(())
    }
}

fn manual_sync() -> PortalConfig {
    let mut config = PortalConfig::default();
    config.outbox = OutboxConfig::default().with_auto_sync(false);
    config
}

#[tokio::test]
async fn full_offline_to_online_flow() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("portal.db")).unwrap());
    let transport = Arc::new(RecordingTransport::default());

    let portal = PortalServices::new(
        manual_sync(),
        &StaticHost::web(),
        ProviderRegistry::new(),
        store.clone(),
        transport.clone(),
        Arc::new(SystemClock),
    )
    .await
    .unwrap();
    portal.start_scheduler();

    // 1. Go offline and queue work
    portal.bridge().set_network_status(NetworkStatus::offline());
    let mut status = portal.outbox().subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        while status.borrow_and_update().is_online {
            status.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    portal
        .outbox()
        .store("attendance.checkin", json!({"employeeId": 12}), Priority::Low)
        .await
        .unwrap();
    portal
        .outbox()
        .store("door.unlock", json!({"doorId": "lobby"}), Priority::High)
        .await
        .unwrap();

    assert_eq!(portal.outbox().status().pending_items, 2);
    assert_eq!(portal.outbox().drain().await.outcome, DrainOutcome::Offline);
    assert!(transport.delivered().is_empty(), "nothing is sent while offline");

    // 2. Reconnect: the scheduler drains, high priority first
    portal
        .bridge()
        .set_network_status(NetworkStatus::online(ConnectionType::Wifi));
    tokio::time::timeout(Duration::from_secs(5), async {
        while status.borrow_and_update().pending_items > 0 {
            status.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    assert_eq!(transport.delivered(), vec!["door.unlock", "attendance.checkin"]);
    assert!(portal.outbox().status().last_sync.is_some());
    portal.stop_scheduler();

    // 3. Synced items survive a restart until cleared
    drop(portal);
    let reopened = Outbox::new(
        store,
        Arc::new(RecordingTransport::default()),
        OutboxConfig::default(),
        Arc::new(SystemClock),
    )
    .unwrap();
    let items = reopened.items().await;
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|i| i.status() == ItemStatus::Synced));
    assert_eq!(reopened.clear_synced().await.unwrap(), 2);
}

#[tokio::test]
async fn exhausted_retries_are_abandoned_not_lost() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("portal.db")).unwrap());
    let transport = Arc::new(RecordingTransport::default());
    transport.take_down("report.upload");

    let outbox = Outbox::new(
        store,
        transport.clone(),
        OutboxConfig::default().with_default_max_retries(3),
        Arc::new(SystemClock),
    )
    .unwrap();

    let id = outbox
        .store("report.upload", json!({"pages": 3}), Priority::Normal)
        .await
        .unwrap();

    for _ in 0..3 {
        outbox.drain().await;
    }

    let item = outbox.get(&id).await.unwrap();
    assert!(item.synced);
    assert_eq!(item.retry_count, 3);
    assert_eq!(item.status(), ItemStatus::Abandoned);

    let status = outbox.status();
    assert_eq!(status.pending_items, 0);
    assert_eq!(status.failed_items, 1);

    // Abandoned items can be given another budget once upstream recovers
    transport.down.lock().unwrap().clear();
    assert_eq!(outbox.retry_abandoned().await.unwrap(), 1);
    outbox.drain().await;

    assert_eq!(outbox.get(&id).await.unwrap().status(), ItemStatus::Synced);
    assert_eq!(transport.delivered(), vec!["report.upload"]);
}

#[tokio::test]
async fn export_to_file_and_import_into_fresh_device() {
    let dir = tempdir().unwrap();
    let backup = dir.path().join("queue-backup.json");

    let source = Outbox::new(
        Arc::new(SqliteStore::open(&dir.path().join("a.db")).unwrap()),
        Arc::new(RecordingTransport::default()),
        OutboxConfig::default(),
        Arc::new(SystemClock),
    )
    .unwrap();
    source.set_online(false).await;
    source.store("a", json!({}), Priority::Normal).await.unwrap();
    source.store("b", json!({"x": 1}), Priority::High).await.unwrap();
    source.export_to_path(&backup).await.unwrap();

    let target = Outbox::new(
        Arc::new(SqliteStore::open(&dir.path().join("b.db")).unwrap()),
        Arc::new(RecordingTransport::default()),
        OutboxConfig::default(),
        Arc::new(SystemClock),
    )
    .unwrap();
    assert_eq!(target.import_from_path(&backup).await.unwrap(), 2);

    let original: Vec<_> = source.items().await.into_iter().map(|i| (i.id, i.synced)).collect();
    let imported: Vec<_> = target.items().await.into_iter().map(|i| (i.id, i.synced)).collect();
    assert_eq!(original, imported);
}

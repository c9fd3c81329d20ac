//! Background drain loop.
//!
//! Wakes on the periodic interval (when `auto_sync` is on), on sync
//! requests raised by [`Outbox::store`], and on network transitions
//! published by the [`CapabilityBridge`]. Connectivity is forwarded into
//! the outbox before anything else happens on a transition.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::capabilities::bridge::CapabilityBridge;
use crate::capabilities::kv::KeyValueStore;
use crate::outbox::{DrainOutcome, Outbox, SyncTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Tick,
    Requested,
    Reconnected,
}

pub struct SyncScheduler {
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    /// Must be called inside a tokio runtime.
    pub fn spawn<S, T>(outbox: Arc<Outbox<S, T>>, bridge: Arc<CapabilityBridge>) -> Self
    where
        S: KeyValueStore + 'static,
        T: SyncTransport + 'static,
    {
        let handle = tokio::spawn(run(outbox, bridge));
        Self { handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn stop(&self) {
        if !self.handle.is_finished() {
            info!("sync scheduler stopped");
        }
        self.handle.abort();
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run<S, T>(outbox: Arc<Outbox<S, T>>, bridge: Arc<CapabilityBridge>)
where
    S: KeyValueStore,
    T: SyncTransport,
{
    let config = outbox.config().clone();
    let requests = outbox.sync_requests();
    let mut network = bridge.subscribe_network();

    let connected = network.borrow_and_update().connected;
    outbox.set_online(connected).await;

    let mut interval = config.auto_sync.then(|| {
        let period = Duration::from_millis(config.sync_interval_ms);
        let mut interval = time::interval_at(time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    info!(
        auto_sync = config.auto_sync,
        interval_ms = config.sync_interval_ms,
        sync_on_reconnect = config.sync_on_reconnect,
        online = connected,
        "sync scheduler started"
    );

    loop {
        let wake = tokio::select! {
            _ = tick(&mut interval) => Wake::Tick,
            _ = requests.notified() => Wake::Requested,
            changed = network.changed() => {
                if changed.is_err() {
                    info!("network status source closed, scheduler exiting");
                    break;
                }
                let connected = network.borrow_and_update().connected;
                let flipped = outbox.set_online(connected).await;
                if !(flipped && connected && config.sync_on_reconnect) {
                    continue;
                }
                Wake::Reconnected
            }
        };

        debug!(?wake, "drain triggered");
        let report = outbox.drain().await;
        match report.outcome {
            DrainOutcome::Completed if report.failed + report.abandoned > 0 => {
                warn!(
                    ?wake,
                    failed = report.failed,
                    abandoned = report.abandoned,
                    "drain finished with failures"
                );
            }
            DrainOutcome::Completed | DrainOutcome::Offline | DrainOutcome::AlreadyRunning => {}
        }
        if let Some(error) = outbox.status().error {
            warn!(error = %error, "queue could not be persisted during drain");
        }
    }
}

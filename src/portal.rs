//! Composition root.

use std::sync::{Arc, Mutex};

use tracing::{info, instrument};

use crate::capabilities::bridge::{CapabilityBridge, HostEnvironment, ProviderRegistry};
#[cfg(feature = "camera")]
use crate::capabilities::camera::CameraCapture;
use crate::capabilities::kv::KeyValueStore;
use crate::config::PortalConfig;
use crate::error::PortalError;
use crate::model::Clock;
#[cfg(feature = "push")]
use crate::notifications::NotificationDispatcher;
use crate::outbox::{Outbox, SyncTransport};
use crate::scheduler::SyncScheduler;

/// Every portal service, wired to one store, one transport and one bridge.
pub struct PortalServices<S: KeyValueStore, T: SyncTransport> {
    config: PortalConfig,
    bridge: Arc<CapabilityBridge>,
    outbox: Arc<Outbox<S, T>>,
    #[cfg(feature = "push")]
    notifications: Arc<NotificationDispatcher<S>>,
    #[cfg(feature = "camera")]
    camera: Arc<CameraCapture>,
    scheduler: Mutex<Option<SyncScheduler>>,
}

impl<S, T> PortalServices<S, T>
where
    S: KeyValueStore + 'static,
    T: SyncTransport + 'static,
{
    /// Probes the host, restores persisted state and builds each service.
    /// The scheduler is not started.
    #[instrument(skip_all)]
    pub async fn new(
        config: PortalConfig,
        host: &dyn HostEnvironment,
        registry: ProviderRegistry,
        store: Arc<S>,
        transport: Arc<T>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PortalError> {
        config.validate()?;

        let bridge = Arc::new(CapabilityBridge::detect(host, registry).await);

        let outbox = Arc::new(Outbox::new(
            Arc::clone(&store),
            transport,
            config.outbox.clone(),
            Arc::clone(&clock),
        )?);
        outbox.set_online(bridge.network_status().connected).await;

        #[cfg(feature = "push")]
        let notifications = {
            let dispatcher = NotificationDispatcher::new(
                Arc::clone(&store),
                Arc::clone(&bridge),
                Arc::clone(&clock),
                config.notifications.clone(),
            )?;
            dispatcher.refresh_permission().await;
            Arc::new(dispatcher)
        };

        #[cfg(feature = "camera")]
        let camera = Arc::new(CameraCapture::new(
            Arc::clone(&bridge),
            Arc::clone(&clock),
            config.capture.clone(),
        ));

        info!(platform = ?bridge.platform(), "portal services ready");

        Ok(Self {
            config,
            bridge,
            outbox,
            #[cfg(feature = "push")]
            notifications,
            #[cfg(feature = "camera")]
            camera,
            scheduler: Mutex::new(None),
        })
    }

    /// Spawns the sync scheduler. Returns false when it is already running.
    pub fn start_scheduler(&self) -> bool {
        let Ok(mut slot) = self.scheduler.lock() else {
            return false;
        };
        if slot.as_ref().is_some_and(SyncScheduler::is_running) {
            return false;
        }
        *slot = Some(SyncScheduler::spawn(
            Arc::clone(&self.outbox),
            Arc::clone(&self.bridge),
        ));
        true
    }

    pub fn stop_scheduler(&self) {
        if let Ok(mut slot) = self.scheduler.lock() {
            if let Some(scheduler) = slot.take() {
                scheduler.stop();
            }
        }
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    pub fn bridge(&self) -> &Arc<CapabilityBridge> {
        &self.bridge
    }

    pub fn outbox(&self) -> &Arc<Outbox<S, T>> {
        &self.outbox
    }

    #[cfg(feature = "push")]
    pub fn notifications(&self) -> &Arc<NotificationDispatcher<S>> {
        &self.notifications
    }

    #[cfg(feature = "camera")]
    pub fn camera(&self) -> &Arc<CameraCapture> {
        &self.camera
    }
}

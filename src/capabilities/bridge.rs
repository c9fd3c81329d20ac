//! Host probing and the native → web provider ladder.
//!
//! Every device-dependent operation goes through a [`ProviderLadder`]: an
//! ordered list of providers for one [`Capability`], native plugins first,
//! web APIs after. Probes never fail upward; a provider whose probe errors is
//! treated as absent and the next one is asked.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::geolocation::{self, GeolocationProvider, LocationError, Position, PositionOptions};
use crate::state::StateCell;

#[cfg(feature = "camera")]
use super::camera::CameraProvider;
#[cfg(feature = "push")]
use super::push::{NotificationProvider, PushProvider};

/// Globals the host exposes. Browsers answer from `window`, native shells
/// from their plugin bridge.
pub trait HostEnvironment: Send + Sync {
    fn has_global(&self, name: &str) -> bool;
}

/// Host with a fixed set of globals.
#[derive(Debug, Clone, Default)]
pub struct StaticHost {
    globals: HashSet<String>,
}

impl StaticHost {
    pub fn web() -> Self {
        Self::default()
    }

    pub fn capacitor() -> Self {
        Self::web().with_global("Capacitor")
    }

    pub fn cordova() -> Self {
        Self::web().with_global("cordova")
    }

    pub fn with_global(mut self, name: impl Into<String>) -> Self {
        self.globals.insert(name.into());
        self
    }
}

impl HostEnvironment for StaticHost {
    fn has_global(&self, name: &str) -> bool {
        self.globals.contains(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Capacitor,
    Cordova,
    #[default]
    Web,
}

impl Platform {
    /// Capacitor wins when both wrappers are present.
    pub fn detect(host: &dyn HostEnvironment) -> Self {
        if host.has_global("Capacitor") {
            Platform::Capacitor
        } else if host.has_global("cordova") {
            Platform::Cordova
        } else {
            Platform::Web
        }
    }

    pub fn is_native(&self) -> bool {
        !matches!(self, Platform::Web)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Camera,
    Location,
    Notifications,
    Push,
    Biometric,
    Nfc,
    Bluetooth,
    Haptics,
    Network,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Camera => "camera",
            Capability::Location => "location",
            Capability::Notifications => "notifications",
            Capability::Push => "push",
            Capability::Biometric => "biometric",
            Capability::Nfc => "nfc",
            Capability::Bluetooth => "bluetooth",
            Capability::Haptics => "haptics",
            Capability::Network => "network",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderSource {
    Native,
    Web,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("plugin not available: {0}")]
    PluginUnavailable(String),

    #[error("probe failed: {0}")]
    ProbeFailed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("{0} is not available on this device")]
    NotSupported(Capability),

    #[error("{0} permission denied")]
    PermissionDenied(Capability),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("{capability} failed: {reason}")]
    Failed {
        capability: Capability,
        reason: String,
    },
}

impl BridgeError {
    pub fn is_permission_error(&self) -> bool {
        matches!(self, BridgeError::PermissionDenied(_))
    }
}

#[derive(Debug, Error)]
pub enum LadderError<E> {
    #[error("no providers registered for {0}")]
    Empty(Capability),

    #[error("all {attempts} {capability} providers failed, last error: {last}")]
    Exhausted {
        capability: Capability,
        attempts: usize,
        last: E,
    },
}

impl<E> LadderError<E> {
    /// Collapses into the last provider error, or `empty` when nothing was tried.
    pub fn into_error(self, empty: impl FnOnce(Capability) -> E) -> E {
        match self {
            LadderError::Empty(capability) => empty(capability),
            LadderError::Exhausted { last, .. } => last,
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn source(&self) -> ProviderSource;

    /// Whether the underlying plugin or API exists on this host.
    async fn probe(&self) -> Result<bool, ProviderError>;
}

#[async_trait]
pub trait HapticsProvider: Provider {
    async fn vibrate(&self, pattern_ms: &[u64]) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait BiometricProvider: Provider {
    async fn authenticate(&self, reason: &str) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait NetworkProvider: Provider {
    async fn status(&self) -> Result<NetworkStatus, BridgeError>;
}

pub struct ProviderLadder<P: ?Sized> {
    capability: Capability,
    providers: Vec<Arc<P>>,
}

impl<P: ?Sized> Clone for ProviderLadder<P> {
    fn clone(&self) -> Self {
        Self {
            capability: self.capability,
            providers: self.providers.clone(),
        }
    }
}

impl<P: ?Sized + Provider> ProviderLadder<P> {
    pub fn new(capability: Capability) -> Self {
        Self {
            capability,
            providers: Vec::new(),
        }
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    /// Native providers stay ahead of web ones; registration order is kept
    /// within each group.
    pub fn push(&mut self, provider: Arc<P>) {
        match provider.source() {
            ProviderSource::Native => {
                let at = self
                    .providers
                    .iter()
                    .position(|p| p.source() == ProviderSource::Web)
                    .unwrap_or(self.providers.len());
                self.providers.insert(at, provider);
            }
            ProviderSource::Web => self.providers.push(provider),
        }
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Same ladder minus `provider`.
    pub fn without(&self, provider: &Arc<P>) -> Self {
        Self {
            capability: self.capability,
            providers: self
                .providers
                .iter()
                .filter(|p| !Arc::ptr_eq(*p, provider))
                .cloned()
                .collect(),
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// First provider reporting availability wins.
    pub async fn probe(&self) -> Option<ProviderSource> {
        for provider in &self.providers {
            match provider.probe().await {
                Ok(true) => return Some(provider.source()),
                Ok(false) => {
                    debug!(capability = %self.capability, provider = provider.name(), "provider absent");
                }
                Err(e) => {
                    warn!(
                        capability = %self.capability,
                        provider = provider.name(),
                        error = %e,
                        "probe failed, falling back"
                    );
                }
            }
        }
        None
    }

    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<(T, ProviderSource), LadderError<E>>
    where
        F: FnMut(Arc<P>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut last = None;
        let mut attempts = 0;

        for provider in &self.providers {
            attempts += 1;
            match op(Arc::clone(provider)).await {
                Ok(value) => return Ok((value, provider.source())),
                Err(e) => {
                    debug!(
                        capability = %self.capability,
                        provider = provider.name(),
                        error = %e,
                        "provider failed, trying next"
                    );
                    last = Some(e);
                }
            }
        }

        match last {
            Some(last) => Err(LadderError::Exhausted {
                capability: self.capability,
                attempts,
                last,
            }),
            None => Err(LadderError::Empty(self.capability)),
        }
    }
}

/// Strategy table: one ladder per capability.
#[derive(Clone)]
pub struct ProviderRegistry {
    #[cfg(feature = "camera")]
    camera: ProviderLadder<dyn CameraProvider>,
    location: ProviderLadder<dyn GeolocationProvider>,
    #[cfg(feature = "push")]
    notifications: ProviderLadder<dyn NotificationProvider>,
    #[cfg(feature = "push")]
    push: ProviderLadder<dyn PushProvider>,
    biometric: ProviderLadder<dyn BiometricProvider>,
    haptics: ProviderLadder<dyn HapticsProvider>,
    network: ProviderLadder<dyn NetworkProvider>,
    nfc: ProviderLadder<dyn Provider>,
    bluetooth: ProviderLadder<dyn Provider>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "camera")]
            camera: ProviderLadder::new(Capability::Camera),
            location: ProviderLadder::new(Capability::Location),
            #[cfg(feature = "push")]
            notifications: ProviderLadder::new(Capability::Notifications),
            #[cfg(feature = "push")]
            push: ProviderLadder::new(Capability::Push),
            biometric: ProviderLadder::new(Capability::Biometric),
            haptics: ProviderLadder::new(Capability::Haptics),
            network: ProviderLadder::new(Capability::Network),
            nfc: ProviderLadder::new(Capability::Nfc),
            bluetooth: ProviderLadder::new(Capability::Bluetooth),
        }
    }

    #[cfg(feature = "camera")]
    pub fn with_camera(mut self, provider: Arc<dyn CameraProvider>) -> Self {
        self.camera.push(provider);
        self
    }

    pub fn with_location(mut self, provider: Arc<dyn GeolocationProvider>) -> Self {
        self.location.push(provider);
        self
    }

    #[cfg(feature = "push")]
    pub fn with_notifications(mut self, provider: Arc<dyn NotificationProvider>) -> Self {
        self.notifications.push(provider);
        self
    }

    #[cfg(feature = "push")]
    pub fn with_push(mut self, provider: Arc<dyn PushProvider>) -> Self {
        self.push.push(provider);
        self
    }

    pub fn with_biometric(mut self, provider: Arc<dyn BiometricProvider>) -> Self {
        self.biometric.push(provider);
        self
    }

    pub fn with_haptics(mut self, provider: Arc<dyn HapticsProvider>) -> Self {
        self.haptics.push(provider);
        self
    }

    pub fn with_network(mut self, provider: Arc<dyn NetworkProvider>) -> Self {
        self.network.push(provider);
        self
    }

    pub fn with_nfc(mut self, provider: Arc<dyn Provider>) -> Self {
        self.nfc.push(provider);
        self
    }

    pub fn with_bluetooth(mut self, provider: Arc<dyn Provider>) -> Self {
        self.bluetooth.push(provider);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    None,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub connected: bool,
    pub connection_type: ConnectionType,
}

impl NetworkStatus {
    pub fn online(connection_type: ConnectionType) -> Self {
        Self {
            connected: true,
            connection_type,
        }
    }

    pub fn offline() -> Self {
        Self {
            connected: false,
            connection_type: ConnectionType::None,
        }
    }
}

impl Default for NetworkStatus {
    /// Assumes connectivity until a provider says otherwise.
    fn default() -> Self {
        Self::online(ConnectionType::Unknown)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub platform: Platform,
    pub is_native: bool,
    pub camera: bool,
    pub location: bool,
    pub push: bool,
    pub biometric: bool,
    pub nfc: bool,
    pub bluetooth: bool,
    pub haptics: bool,
    pub network: NetworkStatus,
}

pub struct CapabilityBridge {
    registry: ProviderRegistry,
    capabilities: StateCell<Capabilities>,
    network: StateCell<NetworkStatus>,
}

impl CapabilityBridge {
    /// Probes the host once. Only network status is re-probed afterwards.
    #[instrument(skip(host, registry))]
    pub async fn detect(host: &dyn HostEnvironment, registry: ProviderRegistry) -> Self {
        let platform = Platform::detect(host);

        #[cfg(feature = "camera")]
        let camera = registry.camera.probe();
        #[cfg(not(feature = "camera"))]
        let camera = async { None::<ProviderSource> };

        #[cfg(feature = "push")]
        let push = registry.push.probe();
        #[cfg(not(feature = "push"))]
        let push = async { None::<ProviderSource> };

        let (camera, location, push, biometric, nfc, bluetooth, haptics) = tokio::join!(
            camera,
            registry.location.probe(),
            push,
            registry.biometric.probe(),
            registry.nfc.probe(),
            registry.bluetooth.probe(),
            registry.haptics.probe(),
        );

        let network = Self::probe_network(&registry.network).await;

        let capabilities = Capabilities {
            platform,
            is_native: platform.is_native(),
            camera: camera.is_some(),
            location: location.is_some(),
            push: push.is_some(),
            biometric: biometric.is_some(),
            nfc: nfc.is_some(),
            bluetooth: bluetooth.is_some(),
            haptics: haptics.is_some(),
            network,
        };

        info!(
            platform = ?capabilities.platform,
            camera = capabilities.camera,
            location = capabilities.location,
            push = capabilities.push,
            biometric = capabilities.biometric,
            connected = network.connected,
            "capabilities detected"
        );

        Self {
            registry,
            capabilities: StateCell::new(capabilities),
            network: StateCell::new(network),
        }
    }

    async fn probe_network(ladder: &ProviderLadder<dyn NetworkProvider>) -> NetworkStatus {
        match ladder.run(|p| async move { p.status().await }).await {
            Ok((status, _)) => status,
            Err(LadderError::Empty(_)) => NetworkStatus::default(),
            Err(e) => {
                warn!(error = %e, "network status unavailable, assuming online");
                NetworkStatus::default()
            }
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities.get()
    }

    pub fn platform(&self) -> Platform {
        self.capabilities.get().platform
    }

    pub fn is_native(&self) -> bool {
        self.capabilities.get().is_native
    }

    pub fn subscribe(&self) -> watch::Receiver<Capabilities> {
        self.capabilities.subscribe()
    }

    pub fn network_status(&self) -> NetworkStatus {
        self.network.get()
    }

    pub fn subscribe_network(&self) -> watch::Receiver<NetworkStatus> {
        self.network.subscribe()
    }

    pub async fn refresh_network(&self) -> NetworkStatus {
        let status = Self::probe_network(&self.registry.network).await;
        self.set_network_status(status);
        status
    }

    /// Records a connectivity event pushed by the host.
    pub fn set_network_status(&self, status: NetworkStatus) {
        if self.network.get() != status {
            info!(connected = status.connected, kind = ?status.connection_type, "network status changed");
        }
        self.network.set(status);
        self.capabilities.update(|c| c.network = status);
    }

    #[instrument(skip(self, pattern_ms), fields(steps = pattern_ms.len()))]
    pub async fn vibrate(&self, pattern_ms: &[u64]) -> Result<ProviderSource, BridgeError> {
        self.registry
            .haptics
            .run(|p| async move { p.vibrate(pattern_ms).await })
            .await
            .map(|((), source)| source)
            .map_err(|e| e.into_error(BridgeError::NotSupported))
    }

    #[instrument(skip(self, reason))]
    pub async fn authenticate(&self, reason: &str) -> Result<ProviderSource, BridgeError> {
        self.registry
            .biometric
            .run(|p| async move { p.authenticate(reason).await })
            .await
            .map(|((), source)| source)
            .map_err(|e| e.into_error(BridgeError::NotSupported))
    }

    pub async fn current_position(&self, options: &PositionOptions) -> Result<Position, LocationError> {
        geolocation::locate(&self.registry.location, options).await
    }

    #[cfg(feature = "camera")]
    pub fn camera(&self) -> &ProviderLadder<dyn CameraProvider> {
        &self.registry.camera
    }

    pub fn location(&self) -> &ProviderLadder<dyn GeolocationProvider> {
        &self.registry.location
    }

    #[cfg(feature = "push")]
    pub fn notifications(&self) -> &ProviderLadder<dyn NotificationProvider> {
        &self.registry.notifications
    }

    #[cfg(feature = "push")]
    pub fn push(&self) -> &ProviderLadder<dyn PushProvider> {
        &self.registry.push
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::{Probe, ScriptedProvider};
    use super::*;

    #[test]
    fn test_platform_detection() {
        assert_eq!(Platform::detect(&StaticHost::web()), Platform::Web);
        assert_eq!(Platform::detect(&StaticHost::cordova()), Platform::Cordova);
        assert_eq!(Platform::detect(&StaticHost::capacitor()), Platform::Capacitor);

        let both = StaticHost::cordova().with_global("Capacitor");
        assert_eq!(Platform::detect(&both), Platform::Capacitor);
        assert!(Platform::Capacitor.is_native());
        assert!(!Platform::Web.is_native());
    }

    #[test]
    fn test_ladder_keeps_native_first() {
        let mut ladder: ProviderLadder<dyn Provider> = ProviderLadder::new(Capability::Nfc);
        ladder.push(Arc::new(ScriptedProvider::new("web-a", ProviderSource::Web, Probe::Yes)));
        ladder.push(Arc::new(ScriptedProvider::new("native-a", ProviderSource::Native, Probe::Yes)));
        ladder.push(Arc::new(ScriptedProvider::new("web-b", ProviderSource::Web, Probe::Yes)));
        ladder.push(Arc::new(ScriptedProvider::new("native-b", ProviderSource::Native, Probe::Yes)));

        assert_eq!(
            ladder.provider_names(),
            vec!["native-a", "native-b", "web-a", "web-b"]
        );
    }

    #[tokio::test]
    async fn test_probe_falls_through_errors() {
        let native = Arc::new(ScriptedProvider::new("plugin", ProviderSource::Native, Probe::Fails));
        let web = Arc::new(ScriptedProvider::new("navigator", ProviderSource::Web, Probe::Yes));

        let mut ladder: ProviderLadder<dyn Provider> = ProviderLadder::new(Capability::Bluetooth);
        ladder.push(native.clone());
        ladder.push(web.clone());

        assert_eq!(ladder.probe().await, Some(ProviderSource::Web));
        assert_eq!(native.calls.load(Ordering::SeqCst), 1);
        assert_eq!(web.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_probe_reports_web_false_when_native_errors() {
        let mut ladder: ProviderLadder<dyn Provider> = ProviderLadder::new(Capability::Nfc);
        ladder.push(Arc::new(ScriptedProvider::new("plugin", ProviderSource::Native, Probe::Fails)));
        ladder.push(Arc::new(ScriptedProvider::new("navigator", ProviderSource::Web, Probe::No)));

        assert_eq!(ladder.probe().await, None);
    }

    #[tokio::test]
    async fn test_run_returns_first_success() {
        let mut ladder: ProviderLadder<dyn HapticsProvider> = ProviderLadder::new(Capability::Haptics);
        ladder.push(Arc::new(ScriptedProvider::new("plugin", ProviderSource::Native, Probe::No)));
        ladder.push(Arc::new(ScriptedProvider::new("navigator", ProviderSource::Web, Probe::Yes)));

        let (_, source) = ladder
            .run(|p| async move { p.vibrate(&[100]).await })
            .await
            .unwrap();
        assert_eq!(source, ProviderSource::Web);
    }

    #[tokio::test]
    async fn test_run_exhausted_and_empty() {
        let empty: ProviderLadder<dyn HapticsProvider> = ProviderLadder::new(Capability::Haptics);
        let result = empty.run(|p| async move { p.vibrate(&[]).await }).await;
        assert!(matches!(result, Err(LadderError::Empty(Capability::Haptics))));

        let mut failing: ProviderLadder<dyn HapticsProvider> = ProviderLadder::new(Capability::Haptics);
        failing.push(Arc::new(ScriptedProvider::new("a", ProviderSource::Native, Probe::No)));
        failing.push(Arc::new(ScriptedProvider::new("b", ProviderSource::Web, Probe::Fails)));

        match failing.run(|p| async move { p.vibrate(&[]).await }).await {
            Err(LadderError::Exhausted { attempts, last, .. }) => {
                assert_eq!(attempts, 2);
                assert_eq!(last, BridgeError::NotSupported(Capability::Haptics));
            }
            other => panic!("expected exhaustion, got {:?}", other.map(|(_, s)| s)),
        }
    }

    #[tokio::test]
    async fn test_detect_builds_snapshot() {
        let registry = ProviderRegistry::new()
            .with_haptics(Arc::new(ScriptedProvider::new("plugin", ProviderSource::Native, Probe::Yes)))
            .with_nfc(Arc::new(ScriptedProvider::new("nfc", ProviderSource::Native, Probe::Fails)));

        let bridge = CapabilityBridge::detect(&StaticHost::capacitor(), registry).await;
        let caps = bridge.capabilities();

        assert_eq!(caps.platform, Platform::Capacitor);
        assert!(caps.is_native);
        assert!(caps.haptics);
        assert!(!caps.nfc);
        assert!(!caps.biometric);
        assert_eq!(caps.network, NetworkStatus::default());
    }

    #[tokio::test]
    async fn test_set_network_status_publishes() {
        let bridge = CapabilityBridge::detect(&StaticHost::web(), ProviderRegistry::new()).await;
        let mut rx = bridge.subscribe_network();

        bridge.set_network_status(NetworkStatus::offline());
        rx.changed().await.unwrap();

        assert!(!rx.borrow_and_update().connected);
        assert!(!bridge.capabilities().network.connected);
    }

    #[tokio::test]
    async fn test_vibrate_without_providers_is_unsupported() {
        let bridge = CapabilityBridge::detect(&StaticHost::web(), ProviderRegistry::new()).await;
        assert_eq!(
            bridge.vibrate(&[50, 100]).await,
            Err(BridgeError::NotSupported(Capability::Haptics))
        );
        assert_eq!(
            bridge.authenticate("unlock door").await,
            Err(BridgeError::NotSupported(Capability::Biometric))
        );
    }

    #[test]
    fn test_capabilities_serialize_camel_case() {
        let json = serde_json::to_value(Capabilities::default()).unwrap();
        assert_eq!(json["isNative"], false);
        assert_eq!(json["platform"], "web");
        assert_eq!(json["network"]["connectionType"], "unknown");
    }
}

//! Device capabilities.
//!
//! Each capability is a trait implemented by the host shell (native plugin
//! or web API) and ordered into a [`ProviderLadder`] inside the
//! [`ProviderRegistry`]. The [`CapabilityBridge`] probes the ladders once at
//! startup and owns them afterwards.

pub mod bridge;
pub mod geolocation;
pub mod kv;

#[cfg(feature = "camera")]
pub mod camera;

#[cfg(feature = "push")]
pub mod push;

pub use self::bridge::{
    BiometricProvider, BridgeError, Capabilities, Capability, CapabilityBridge, ConnectionType,
    HapticsProvider, HostEnvironment, LadderError, NetworkProvider, NetworkStatus, Platform,
    Provider, ProviderError, ProviderLadder, ProviderRegistry, ProviderSource, StaticHost,
};
pub use self::geolocation::{GeolocationProvider, LocationError, Position, PositionOptions};
#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteStore;
pub use self::kv::{KeyNamespace, KeyValueStore, KvError, KvKey, MemoryStore, TypedKvStore};

#[cfg(feature = "camera")]
pub use self::camera::{
    CameraCapture, CameraError, CameraFacing, CameraFrame, CameraProvider, CameraState,
    CaptureConfig, CapturedImage, ImageFormat, PhotoResult,
};

#[cfg(feature = "push")]
pub use self::push::{
    DeliveryOptions, NotificationProvider, PermissionState, PushError, PushProvider,
};

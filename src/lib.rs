//! Shared core of the admin portal: offline queue, device capability
//! bridge, camera capture and notification dispatch.
//!
//! Shells construct one [`PortalServices`] with their store, transport and
//! provider registry, then drive everything through it.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod capabilities;
pub mod config;
pub mod error;
pub mod model;
pub mod offline_store;
pub mod outbox;
pub mod portal;
pub mod scheduler;
pub mod state;

#[cfg(feature = "push")]
pub mod notifications;

pub use capabilities::{Capabilities, CapabilityBridge, ProviderRegistry};
pub use config::{ConfigError, PortalConfig};
pub use error::{ErrorKind, PortalError};
pub use model::{Clock, LatLon, Priority, SystemClock, UnixTimeMs};
pub use outbox::{
    DrainOutcome, DrainReport, ItemId, ItemStatus, Outbox, OutboxConfig, OutboxError, QueuedItem,
    SyncStatus, SyncTransport,
};
pub use portal::PortalServices;
pub use scheduler::SyncScheduler;
pub use state::StateCell;

#[cfg(feature = "push")]
pub use notifications::{
    Dispatch, Notification, NotificationDispatcher, NotificationRequest, NotificationSettings,
    NotifyError, QuietHours,
};

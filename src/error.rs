//! Crate-wide error taxonomy.
//!
//! Each service keeps its own error enum; [`PortalError`] wraps them for
//! callers that hold the whole [`crate::portal::PortalServices`] and want
//! one type and one [`ErrorKind`] to branch on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::bridge::{BridgeError, LadderError};
#[cfg(feature = "camera")]
use crate::capabilities::camera::CameraError;
use crate::capabilities::geolocation::LocationError;
use crate::capabilities::kv::KvError;
#[cfg(feature = "push")]
use crate::capabilities::push::PushError;
use crate::config::ConfigError;
use crate::model::ValidationError;
#[cfg(feature = "push")]
use crate::notifications::NotifyError;
use crate::offline_store::StoreError;
use crate::outbox::{DeliveryError, ItemId, OutboxError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    PermissionDenied,
    FeatureUnavailable,
    StorageLimitExceeded,
    SyncItemFailed,
    SyncItemAbandoned,
    InvalidState,
    Validation,
    Storage,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::FeatureUnavailable => "FEATURE_UNAVAILABLE",
            Self::StorageLimitExceeded => "STORAGE_LIMIT_EXCEEDED",
            Self::SyncItemFailed => "SYNC_ITEM_FAILED",
            Self::SyncItemAbandoned => "SYNC_ITEM_ABANDONED",
            Self::InvalidState => "INVALID_STATE",
            Self::Validation => "VALIDATION_ERROR",
            Self::Storage => "STORAGE_ERROR",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::SyncItemFailed | Self::Storage)
    }

    #[must_use]
    pub fn user_facing_message(self) -> &'static str {
        match self {
            Self::PermissionDenied => "Access was denied. Enable the permission in your device settings.",
            Self::FeatureUnavailable => "This feature is not available on this device.",
            Self::StorageLimitExceeded => {
                "Offline storage is full. Reconnect to sync pending changes."
            }
            Self::SyncItemFailed => "A change could not be synced yet. It will be retried.",
            Self::SyncItemAbandoned => "A change could not be synced and was given up on.",
            Self::InvalidState => "That action is not possible right now.",
            Self::Validation => "Some of the provided values are invalid.",
            Self::Storage => "Unable to save data locally.",
            Self::Internal => "Something went wrong. Please try again.",
        }
    }
}

#[derive(Debug, Error)]
pub enum PortalError {
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[cfg(feature = "camera")]
    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error(transparent)]
    Location(#[from] LocationError),

    #[cfg(feature = "push")]
    #[error(transparent)]
    Push(#[from] PushError),

    #[cfg(feature = "push")]
    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("sync failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("item {id} abandoned after {attempts} attempts")]
    Abandoned { id: ItemId, attempts: u32 },
}

impl PortalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PortalError::Outbox(e) => outbox_kind(e),
            PortalError::Store(e) => store_kind(e),
            PortalError::Kv(e) => kv_kind(e),
            #[cfg(feature = "camera")]
            PortalError::Camera(e) => camera_kind(e),
            PortalError::Location(e) => location_kind(e),
            #[cfg(feature = "push")]
            PortalError::Push(e) => push_kind(e),
            #[cfg(feature = "push")]
            PortalError::Notify(e) => notify_kind(e),
            PortalError::Bridge(e) => bridge_kind(e),
            PortalError::Config(_) | PortalError::Validation(_) => ErrorKind::Validation,
            PortalError::Delivery(_) => ErrorKind::SyncItemFailed,
            PortalError::Abandoned { .. } => ErrorKind::SyncItemAbandoned,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl<E: Into<PortalError>> From<LadderError<E>> for PortalError {
    fn from(err: LadderError<E>) -> Self {
        match err {
            LadderError::Empty(capability) => BridgeError::NotSupported(capability).into(),
            LadderError::Exhausted { last, .. } => last.into(),
        }
    }
}

fn outbox_kind(e: &OutboxError) -> ErrorKind {
    match e {
        OutboxError::StorageLimitExceeded { .. } | OutboxError::Full(_) => {
            ErrorKind::StorageLimitExceeded
        }
        OutboxError::InvalidId(_) | OutboxError::Validation(_) => ErrorKind::Validation,
        OutboxError::Store(e) => store_kind(e),
    }
}

fn store_kind(e: &StoreError) -> ErrorKind {
    match e {
        StoreError::Kv(e) => kv_kind(e),
        StoreError::TooLarge { .. } | StoreError::TooManyEntries { .. } => {
            ErrorKind::StorageLimitExceeded
        }
        StoreError::Io(_) | StoreError::Corrupted { .. } => ErrorKind::Storage,
        StoreError::Serialization(_) => ErrorKind::Internal,
    }
}

fn kv_kind(e: &KvError) -> ErrorKind {
    match e {
        KvError::InvalidKey { .. } => ErrorKind::Validation,
        KvError::ValueTooLarge { .. } => ErrorKind::StorageLimitExceeded,
        KvError::Storage { .. } => ErrorKind::Storage,
        KvError::Serialization { .. } => ErrorKind::Internal,
    }
}

#[cfg(feature = "camera")]
fn camera_kind(e: &CameraError) -> ErrorKind {
    match e {
        CameraError::PermissionDenied => ErrorKind::PermissionDenied,
        CameraError::NotSupported | CameraError::FormatNotSupported { .. } => {
            ErrorKind::FeatureUnavailable
        }
        CameraError::InvalidState { .. } => ErrorKind::InvalidState,
        CameraError::ImageTooLarge { .. } | CameraError::InvalidImage { .. } => {
            ErrorKind::Validation
        }
        CameraError::CaptureFailed { .. }
        | CameraError::StreamFailed { .. }
        | CameraError::Encode { .. }
        | CameraError::Internal { .. } => ErrorKind::Internal,
    }
}

fn location_kind(e: &LocationError) -> ErrorKind {
    match e {
        LocationError::PermissionDenied => ErrorKind::PermissionDenied,
        LocationError::NotSupported => ErrorKind::FeatureUnavailable,
        LocationError::Invalid(_) => ErrorKind::Validation,
        LocationError::Unavailable(_) | LocationError::Timeout(_) => ErrorKind::Internal,
    }
}

#[cfg(feature = "push")]
fn push_kind(e: &PushError) -> ErrorKind {
    match e {
        PushError::PermissionDenied => ErrorKind::PermissionDenied,
        PushError::NotAvailable => ErrorKind::FeatureUnavailable,
        PushError::RegistrationFailed { .. } | PushError::DeliveryFailed { .. } | PushError::Timeout => {
            ErrorKind::Internal
        }
    }
}

#[cfg(feature = "push")]
fn notify_kind(e: &NotifyError) -> ErrorKind {
    match e {
        NotifyError::PermissionDenied => ErrorKind::PermissionDenied,
        NotifyError::Disabled => ErrorKind::InvalidState,
        NotifyError::Validation(_) | NotifyError::InvalidValue(_) => ErrorKind::Validation,
        NotifyError::Storage(e) => kv_kind(e),
        NotifyError::Push(e) => push_kind(e),
    }
}

fn bridge_kind(e: &BridgeError) -> ErrorKind {
    match e {
        BridgeError::NotSupported(_) => ErrorKind::FeatureUnavailable,
        BridgeError::PermissionDenied(_) | BridgeError::AuthenticationFailed(_) => {
            ErrorKind::PermissionDenied
        }
        BridgeError::Failed { .. } => ErrorKind::Internal,
    }
}

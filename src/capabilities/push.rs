use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::bridge::Provider;
use crate::notifications::Notification;

/// Notification permission as reported by the host.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PermissionState {
    #[default]
    NotDetermined,
    Denied,
    Granted,
    Provisional,
}

impl PermissionState {
    #[must_use]
    pub const fn is_granted(self) -> bool {
        matches!(self, Self::Granted | Self::Provisional)
    }

    #[must_use]
    pub const fn is_denied(self) -> bool {
        matches!(self, Self::Denied)
    }

    #[must_use]
    pub const fn needs_request(self) -> bool {
        matches!(self, Self::NotDetermined)
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum PushError {
    #[error("notifications not available on this platform")]
    NotAvailable,

    #[error("permission denied by user")]
    PermissionDenied,

    #[error("registration failed: {reason}")]
    RegistrationFailed {
        reason: String,
        #[serde(default)]
        is_retryable: bool,
    },

    #[error("delivery failed: {reason}")]
    DeliveryFailed { reason: String },

    #[error("operation timed out")]
    Timeout,
}

impl PushError {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::RegistrationFailed { is_retryable, .. } => *is_retryable,
            Self::Timeout => true,
            Self::NotAvailable | Self::PermissionDenied | Self::DeliveryFailed { .. } => false,
        }
    }

    #[must_use]
    pub fn registration_failed(reason: impl Into<String>) -> Self {
        Self::RegistrationFailed {
            reason: reason.into(),
            is_retryable: false,
        }
    }

    #[must_use]
    pub fn delivery_failed(reason: impl Into<String>) -> Self {
        Self::DeliveryFailed {
            reason: reason.into(),
        }
    }
}

/// Presentation hints taken from the user's notification settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOptions {
    pub sound: bool,
    pub vibration: bool,
}

/// Local notification delivery: native plugin or the browser `Notification` API.
#[async_trait]
pub trait NotificationProvider: Provider {
    async fn permission(&self) -> Result<PermissionState, PushError>;

    async fn request_permission(&self) -> Result<PermissionState, PushError>;

    async fn show(&self, notification: &Notification, options: &DeliveryOptions) -> Result<(), PushError>;
}

/// Remote push registration. The returned device token is a secret.
#[async_trait]
pub trait PushProvider: Provider {
    async fn register(&self) -> Result<SecretString, PushError>;
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use super::bridge::{Capability, Provider, ProviderLadder, ProviderSource};
use crate::model::{LatLon, UnixTimeMs, ValidationError};

pub const DEFAULT_LOCATION_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionOptions {
    pub enable_high_accuracy: bool,
    pub timeout_ms: u64,
    pub maximum_age_ms: u64,
}

impl Default for PositionOptions {
    fn default() -> Self {
        Self {
            enable_high_accuracy: true,
            timeout_ms: DEFAULT_LOCATION_TIMEOUT_MS,
            maximum_age_ms: 0,
        }
    }
}

impl PositionOptions {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms.clamp(100, 120_000);
        self
    }

    pub fn low_accuracy(mut self) -> Self {
        self.enable_high_accuracy = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub coords: LatLon,
    pub accuracy_m: Option<f64>,
    pub timestamp: UnixTimeMs,
    #[serde(skip)]
    pub source: Option<ProviderSource>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("position unavailable: {0}")]
    Unavailable(String),

    #[error("location request timed out after {0}ms")]
    Timeout(u64),

    #[error("geolocation not supported on this platform")]
    NotSupported,

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl LocationError {
    pub fn is_permission_error(&self) -> bool {
        matches!(self, LocationError::PermissionDenied)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, LocationError::Timeout(_) | LocationError::Unavailable(_))
    }
}

#[async_trait]
pub trait GeolocationProvider: Provider {
    async fn current_position(&self, options: &PositionOptions) -> Result<Position, LocationError>;
}

/// Asks each location provider in turn.
#[instrument(skip(ladder, options))]
pub async fn locate(
    ladder: &ProviderLadder<dyn GeolocationProvider>,
    options: &PositionOptions,
) -> Result<Position, LocationError> {
    let (mut position, source) = ladder
        .run(|p| async move { p.current_position(options).await })
        .await
        .map_err(|e| e.into_error(|_| LocationError::NotSupported))?;

    // Providers hand back raw numbers from the host; re-check them.
    position.coords = LatLon::new(position.coords.lat(), position.coords.lon())?;
    position.source = Some(source);
    debug!(?source, "position acquired");
    Ok(position)
}

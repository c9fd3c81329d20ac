use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "camera")]
use crate::capabilities::camera::CaptureConfig;
#[cfg(feature = "push")]
use crate::notifications::NotificationSettings;
use crate::outbox::OutboxConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid {section} config: {reason}")]
    Invalid {
        section: &'static str,
        reason: String,
    },
}

/// Settings for every service [`crate::portal::PortalServices`] builds.
///
/// Missing sections and fields take their defaults, so `{}` is a valid
/// config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortalConfig {
    pub outbox: OutboxConfig,
    #[cfg(feature = "camera")]
    pub capture: CaptureConfig,
    #[cfg(feature = "push")]
    pub notifications: NotificationSettings,
}

impl PortalConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.outbox.validate().map_err(|e| ConfigError::Invalid {
            section: "outbox",
            reason: e.to_string(),
        })?;

        #[cfg(feature = "camera")]
        if self.capture != self.capture.clone().validated() {
            return Err(ConfigError::Invalid {
                section: "capture",
                reason: "values out of range".into(),
            });
        }

        #[cfg(feature = "push")]
        self.notifications
            .validate()
            .map_err(|e| ConfigError::Invalid {
                section: "notifications",
                reason: e.to_string(),
            })?;

        Ok(())
    }
}

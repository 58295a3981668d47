//! Handler configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{DialogError, Result};

/// Default period of the cleanup sweep, in seconds.
pub const DEFAULT_CLEAN_INTERVAL_SECS: u64 = 3;

/// How faults inside node pipelines are surfaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionLevel {
    /// Report on the log channels and continue.
    #[default]
    Ignore,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub exception_level: ExceptionLevel,
}

/// Construction-time options of a [`DialogHandler`](crate::DialogHandler).
///
/// ```
/// use dialog_core::HandlerConfig;
///
/// let config = HandlerConfig::from_json(r#"{ "clean_interval_seconds": 10 }"#).unwrap();
/// assert_eq!(config.clean_interval().as_secs(), 10);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HandlerConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default = "default_clean_interval")]
    pub clean_interval_seconds: u64,
}

fn default_clean_interval() -> u64 {
    DEFAULT_CLEAN_INTERVAL_SECS
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            clean_interval_seconds: DEFAULT_CLEAN_INTERVAL_SECS,
        }
    }
}

impl HandlerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| DialogError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.clean_interval_seconds == 0 {
            return Err(DialogError::InvalidConfig(
                "clean_interval_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn clean_interval(&self) -> Duration {
        Duration::from_secs(self.clean_interval_seconds)
    }
}

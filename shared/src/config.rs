use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Tunables for the offline queue, sync loop and chat history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub sweep_interval_secs: u64,
    pub max_queued_messages: usize,
    pub history_page_size: u32,
    pub event_buffer: usize,
    pub synced_retention_secs: u64,
    pub max_text_length: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 15,
            max_queued_messages: 1_000,
            history_page_size: 50,
            event_buffer: 256,
            synced_retention_secs: 300,
            max_text_length: 4_000,
        }
    }
}

impl SyncConfig {
    pub const MAX_PAGE_SIZE: u32 = 500;

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sweep_interval_secs must be at least 1".into(),
            ));
        }
        if self.max_queued_messages == 0 {
            return Err(ConfigError::Invalid("max_queued_messages must be > 0".into()));
        }
        if self.history_page_size == 0 || self.history_page_size > Self::MAX_PAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "history_page_size must be between 1 and {}",
                Self::MAX_PAGE_SIZE
            )));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid("event_buffer must be > 0".into()));
        }
        if self.max_text_length == 0 {
            return Err(ConfigError::Invalid("max_text_length must be > 0".into()));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn synced_retention_ms(&self) -> u64 {
        self.synced_retention_secs.saturating_mul(1_000)
    }
}

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::lock::LockConfig;
use crate::outbox::OutboxConfig;
use crate::reconcile::ReconcileConfig;
use crate::retry::RetryConfig;

/// Settings for every service in one session. Missing sections and fields
/// take their defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WriteSyncConfig {
    pub outbox: OutboxConfig,
    pub retry: RetryConfig,
    pub reconcile: ReconcileConfig,
    pub lock: LockConfig,
}

impl WriteSyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.outbox.validate()?;
        self.retry.validate()?;
        self.reconcile.validate()?;
        self.lock.validate()?;
        Ok(())
    }

    /// Parses and validates a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

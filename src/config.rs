//! Configuration for a security node.
//!
//! The configuration is plain serde data, loadable from TOML. Every tunable of
//! the activity queue lives here so the gap policy is explicit and testable
//! rather than hard-coded.

use crate::error::{SecurityError, SecurityResult};
use crate::model::IdentityId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a security node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Age after which a missing activity id is treated as permanently lost
    pub gap_retention_secs: u64,
    /// Maximum number of open gaps; the oldest ones beyond this are dropped
    pub max_open_gaps: usize,
    /// Interval of the background health check (disabled when `None`)
    pub health_check_interval_secs: Option<u64>,
    /// Activities older than this are removed by the health check cleanup
    pub activity_lifetime_minutes: u64,
    /// Serialized activities larger than this are distributed by reference
    pub big_activity_threshold_bytes: usize,
    /// Maximum number of activities loaded from the store in one request
    pub activity_load_batch: usize,
    /// Number of entries kept in the activity history
    pub history_capacity: usize,
    /// Pseudo group that owners of an entity belong to while it is evaluated
    pub owner_group_id: Option<IdentityId>,
    /// Group that every identity implicitly belongs to
    pub everyone_group_id: Option<IdentityId>,
    /// Default log level used by [`crate::logging::init_from_config`]
    pub log_level: String,
    /// Path of the sled database used by the sled data provider
    pub storage_path: PathBuf,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            gap_retention_secs: 60,
            max_open_gaps: 1000,
            health_check_interval_secs: None,
            activity_lifetime_minutes: 60 * 24,
            big_activity_threshold_bytes: 200 * 1024,
            activity_load_batch: 500,
            history_capacity: 256,
            owner_group_id: None,
            everyone_group_id: None,
            log_level: "info".to_string(),
            storage_path: PathBuf::from("data/security"),
        }
    }
}

impl SecurityConfig {
    /// Create a configuration storing its data under `storage_path`
    pub fn new(storage_path: PathBuf) -> Self {
        Self {
            storage_path,
            ..Default::default()
        }
    }

    /// Parse a configuration from TOML text. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> SecurityResult<Self> {
        let config: SecurityConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> SecurityResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SecurityError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Serialize the configuration back to TOML
    pub fn to_toml_string(&self) -> SecurityResult<String> {
        toml::to_string(self).map_err(|e| SecurityError::Config(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> SecurityResult<()> {
        if self.activity_load_batch == 0 {
            return Err(SecurityError::Config(
                "activity_load_batch must be greater than zero".to_string(),
            ));
        }
        if self.big_activity_threshold_bytes == 0 {
            return Err(SecurityError::Config(
                "big_activity_threshold_bytes must be greater than zero".to_string(),
            ));
        }
        if let Some(0) = self.health_check_interval_secs {
            return Err(SecurityError::Config(
                "health_check_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.owner_group_id == Some(0) || self.everyone_group_id == Some(0) {
            return Err(SecurityError::Config(
                "special group ids must not be zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn gap_retention(&self) -> Duration {
        Duration::from_secs(self.gap_retention_secs)
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        self.health_check_interval_secs.map(Duration::from_secs)
    }

    /// Set how long a missing activity stays an open gap
    pub fn with_gap_retention(mut self, retention: Duration) -> Self {
        self.gap_retention_secs = retention.as_secs();
        self
    }

    /// Set the maximum number of open gaps
    pub fn with_max_open_gaps(mut self, max_open_gaps: usize) -> Self {
        self.max_open_gaps = max_open_gaps;
        self
    }

    /// Enable the periodic health check
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval_secs = Some(interval.as_secs().max(1));
        self
    }

    pub fn with_owner_group(mut self, group_id: IdentityId) -> Self {
        self.owner_group_id = Some(group_id);
        self
    }

    pub fn with_everyone_group(mut self, group_id: IdentityId) -> Self {
        self.everyone_group_id = Some(group_id);
        self
    }

    pub fn with_big_activity_threshold(mut self, bytes: usize) -> Self {
        self.big_activity_threshold_bytes = bytes;
        self
    }
}

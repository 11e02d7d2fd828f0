//! Cache configuration.
//!
//! Configuration for a [`FieldCache`](crate::FieldCache), including:
//! - Group directory ceilings
//! - Status and violation queue capacity
//! - The default watch policy

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::watch::WatchPolicy;

/// Ceilings on live groups and members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of live entity groups.
    pub max_entity_groups: usize,
    /// Maximum number of live field groups.
    pub max_field_groups: usize,
    /// Maximum entities per entity group.
    pub max_entities_per_group: usize,
    /// Maximum fields per field group.
    pub max_fields_per_field_group: usize,
    /// Maximum group name length in bytes.
    pub max_group_name_length: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_entity_groups: 64,
            max_field_groups: 64,
            max_entities_per_group: 64,
            max_fields_per_field_group: 128,
            max_group_name_length: 256,
        }
    }
}

/// Status collector settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StatusConfig {
    /// Records kept per status or violation queue before new ones overflow.
    pub queue_capacity: usize,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

/// Default sampling and retention policy for new watches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatchDefaults {
    /// Sampling interval in microseconds.
    pub update_freq_micros: i64,
    /// Maximum sample age in seconds, 0 for no age bound.
    pub max_keep_age_secs: f64,
    /// Maximum retained samples per key.
    pub max_keep_samples: i64,
}

impl Default for WatchDefaults {
    fn default() -> Self {
        Self {
            update_freq_micros: 1_000_000,
            max_keep_age_secs: 0.0,
            max_keep_samples: 1,
        }
    }
}

impl WatchDefaults {
    /// Builds the policy these defaults describe.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::BadParam` if the values do not form a valid policy.
    pub fn policy(&self) -> Result<WatchPolicy> {
        WatchPolicy::new(
            self.update_freq_micros,
            self.max_keep_age_secs,
            self.max_keep_samples,
        )
    }
}

/// Main cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CacheConfig {
    /// Group directory ceilings.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Status collector settings.
    #[serde(default)]
    pub status: StatusConfig,
    /// Default watch policy.
    #[serde(default)]
    pub watch_defaults: WatchDefaults,
}

impl CacheConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| CacheError::Config {
            reason: format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ),
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| CacheError::Config {
            reason: format!("invalid TOML: {e}"),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Config` if any value is out of range.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        let positive = [
            ("limits.max_entity_groups", limits.max_entity_groups),
            ("limits.max_field_groups", limits.max_field_groups),
            ("limits.max_entities_per_group", limits.max_entities_per_group),
            ("limits.max_fields_per_field_group", limits.max_fields_per_field_group),
            ("limits.max_group_name_length", limits.max_group_name_length),
            ("status.queue_capacity", self.status.queue_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(CacheError::Config {
                    reason: format!("{name} must be greater than 0"),
                });
            }
        }

        self.watch_defaults.policy().map_err(|e| CacheError::Config {
            reason: format!("watch_defaults: {e}"),
        })?;

        Ok(())
    }
}

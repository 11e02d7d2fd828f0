//! CLI configuration file.
//!
//! A config file has a `[cache]` table passed through to
//! [`fieldcache::CacheConfig`], a `[simulation]` table describing the
//! simulated fleet and an optional `[policy]` table that sets a violation
//! policy on every simulated GPU.

use std::path::Path;

use serde::{Deserialize, Serialize};

use fieldcache::{CacheConfig, PolicyConditionParams, WatchDefaults};

use crate::cli::SimArgs;
use crate::error::CliError;

/// Simulated fleet settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of simulated GPUs.
    pub gpus: u32,
    /// Number of simulated switches.
    pub switches: u32,
    /// Sampling driver tick in milliseconds.
    pub tick_millis: u64,
    /// How long a run samples for, in seconds.
    pub duration_secs: u64,
    /// Fields to watch, by id or tag.
    pub fields: Vec<String>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            gpus: 4,
            switches: 0,
            tick_millis: 100,
            duration_secs: 3,
            fields: ["gpu_temp", "power_usage", "gpu_util", "fb_used"]
                .map(String::from)
                .to_vec(),
        }
    }
}

/// Complete CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CliConfig {
    /// Cache settings.
    #[serde(default = "default_cache")]
    pub cache: CacheConfig,
    /// Simulation settings.
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Violation policy over all GPUs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyConditionParams>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            cache: default_cache(),
            simulation: SimulationConfig::default(),
            policy: None,
        }
    }
}

// Sample four times a second and keep five minutes of history.
fn default_cache() -> CacheConfig {
    CacheConfig {
        watch_defaults: WatchDefaults {
            update_freq_micros: 250_000,
            max_keep_age_secs: 300.0,
            max_keep_samples: 1_200,
        },
        ..CacheConfig::default()
    }
}

impl CliConfig {
    /// Loads the config file, or the defaults when no path is given.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: Option<&Path>) -> Result<Self, CliError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("failed to read '{}': {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parses and validates a TOML config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, CliError> {
        let config: Self =
            toml::from_str(content).map_err(|e| CliError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the config as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, CliError> {
        toml::to_string_pretty(self).map_err(|e| CliError::Format(e.to_string()))
    }

    /// Validates both tables.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<(), CliError> {
        self.cache.validate()?;
        let sim = &self.simulation;
        if sim.gpus == 0 && sim.switches == 0 {
            return Err(CliError::Config("simulation needs at least one device".into()));
        }
        if sim.tick_millis == 0 {
            return Err(CliError::Config("tick_millis must be positive".into()));
        }
        if sim.fields.is_empty() {
            return Err(CliError::Config("at least one field must be watched".into()));
        }
        if let Some(policy) = &self.policy {
            policy.validate()?;
        }
        Ok(())
    }

    /// Applies command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the overridden config is invalid.
    pub fn apply(&mut self, args: &SimArgs) -> Result<(), CliError> {
        let sim = &mut self.simulation;
        if let Some(gpus) = args.gpus {
            sim.gpus = gpus;
        }
        if let Some(switches) = args.switches {
            sim.switches = switches;
        }
        if let Some(duration) = args.duration_secs {
            sim.duration_secs = duration;
        }
        if let Some(tick) = args.tick_millis {
            sim.tick_millis = tick;
        }
        if !args.fields.is_empty() {
            sim.fields.clone_from(&args.fields);
        }
        self.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_are_valid() {
        let config = CliConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.watch_defaults.max_keep_samples, 1_200);
    }

    #[test]
    fn missing_path_gives_defaults() {
        assert_eq!(CliConfig::load(None).unwrap(), CliConfig::default());
    }

    #[test]
    fn loads_both_tables() {
        let file = create_temp_config(
            r#"
[cache.limits]
max_entity_groups = 8

[simulation]
gpus = 2
switches = 1
fields = ["gpu_temp"]
"#,
        );
        let config = CliConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.cache.limits.max_entity_groups, 8);
        assert_eq!(config.cache.watch_defaults.update_freq_micros, 250_000);
        assert_eq!(config.simulation.gpus, 2);
        assert_eq!(config.simulation.tick_millis, 100);
        assert_eq!(config.simulation.fields, vec!["gpu_temp"]);
    }

    #[test]
    fn loads_policy_table() {
        let config = CliConfig::from_toml("[policy]\nthermal_enabled = true\nthermal_threshold = 60\n").unwrap();
        let policy = config.policy.unwrap();
        assert!(policy.thermal_enabled);
        assert_eq!(policy.thermal_threshold, 60);
        assert_eq!(policy.power_threshold, 250);
        assert!(CliConfig::default().policy.is_none());
    }

    #[test]
    fn rejects_policy_without_conditions() {
        let err = CliConfig::from_toml("[policy]\npower_threshold = 300\n").unwrap_err();
        assert!(matches!(err, CliError::Cache(_)));
    }

    #[test]
    fn rejects_empty_fleet() {
        let err = CliConfig::from_toml("[simulation]\ngpus = 0\n").unwrap_err();
        assert!(matches!(err, CliError::Config(_)));
    }

    #[test]
    fn rejects_invalid_cache_table() {
        let err = CliConfig::from_toml("[cache.status]\nqueue_capacity = 0\n").unwrap_err();
        assert!(matches!(err, CliError::Cache(_)));
    }

    #[test]
    fn overrides_apply() {
        let mut config = CliConfig::default();
        let args = SimArgs {
            gpus: Some(8),
            fields: vec!["sm_clock".into()],
            ..SimArgs::default()
        };
        config.apply(&args).unwrap();
        assert_eq!(config.simulation.gpus, 8);
        assert_eq!(config.simulation.fields, vec!["sm_clock"]);
    }

    #[test]
    fn toml_round_trips() {
        let config = CliConfig::default();
        let rendered = config.to_toml().unwrap();
        assert_eq!(CliConfig::from_toml(&rendered).unwrap(), config);
    }
}

//! Configuration loading and typed config structures.
//!
//! The configuration lives in `trafficlight-config.yaml` at the project
//! root. Every field has a default, so an empty file (or no file at all)
//! yields the stock setup: two heads, `North` and `East`, ticking every
//! 100 ms through the standard program catalog.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use trafficlight_types::{Program, Role};

use crate::control::{MAX_TICK_INTERVAL_MS, MIN_TICK_INTERVAL_MS, tick_interval_in_range};

/// Environment variable overriding `conductor.tick_interval_ms`.
pub const TICK_INTERVAL_ENV: &str = "TRAFFICLIGHT_TICK_INTERVAL_MS";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// The configuration parsed but is not usable.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Explanation of what is wrong.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TrafficlightConfig {
    /// Tick timing and shutdown settings.
    #[serde(default)]
    pub conductor: ConductorConfig,

    /// Signal heads, in registration order.
    #[serde(default = "default_units")]
    pub units: Vec<UnitConfig>,

    /// Program overrides; absent entries use the standard catalog.
    #[serde(default)]
    pub programs: ProgramsConfig,

    /// Timings of the demo cycle run by the engine binary.
    #[serde(default)]
    pub cycle: CycleConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TrafficlightConfig {
    /// Load, apply environment overrides, and validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if it is not valid YAML, or
    /// [`ConfigError::Invalid`] if validation fails.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    ///
    /// An empty string yields the defaults. No validation is performed.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yml::from_str(yaml)?)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(TICK_INTERVAL_ENV) {
            self.conductor.tick_interval_ms =
                raw.trim().parse().map_err(|_err| ConfigError::Invalid {
                    reason: format!("{TICK_INTERVAL_ENV} is not a number: {raw:?}"),
                })?;
        }
        Ok(())
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !tick_interval_in_range(self.conductor.tick_interval_ms) {
            return Err(invalid(format!(
                "conductor.tick_interval_ms must be within {MIN_TICK_INTERVAL_MS}..={MAX_TICK_INTERVAL_MS}, got {}",
                self.conductor.tick_interval_ms
            )));
        }
        if self.conductor.join_grace_ms == 0 {
            return Err(invalid("conductor.join_grace_ms must be at least 1".to_owned()));
        }
        if self.units.is_empty() {
            return Err(invalid("at least one unit must be configured".to_owned()));
        }
        let mut names = BTreeSet::new();
        for unit in &self.units {
            if !names.insert(unit.name.as_str()) {
                return Err(invalid(format!("duplicate unit name {:?}", unit.name)));
            }
        }
        let with_role = self.units.iter().filter(|unit| unit.role.is_some()).count();
        if with_role != 0 && with_role != self.units.len() {
            return Err(invalid(
                "either every unit or no unit may set a role".to_owned(),
            ));
        }
        Ok(())
    }

    /// Explicit roles in unit order, or `None` if roles are to be
    /// inferred by alternation.
    pub fn roles(&self) -> Option<Vec<Role>> {
        self.units.iter().map(|unit| unit.role).collect()
    }
}

impl Default for TrafficlightConfig {
    fn default() -> Self {
        Self {
            conductor: ConductorConfig::default(),
            units: default_units(),
            programs: ProgramsConfig::default(),
            cycle: CycleConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

const fn invalid(reason: String) -> ConfigError {
    ConfigError::Invalid { reason }
}

/// Tick timing and shutdown settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConductorConfig {
    /// Real-time milliseconds per tick.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Milliseconds `join` waits for tasks before reporting a timeout.
    #[serde(default = "default_join_grace_ms")]
    pub join_grace_ms: u64,
}

impl ConductorConfig {
    /// Tick interval as a [`Duration`].
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Join grace period as a [`Duration`].
    pub const fn join_grace(&self) -> Duration {
        Duration::from_millis(self.join_grace_ms)
    }
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            join_grace_ms: default_join_grace_ms(),
        }
    }
}

/// One signal head.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UnitConfig {
    /// Name used in logs and diagnostics.
    pub name: String,

    /// Pairing role. Set on every unit or on none.
    #[serde(default)]
    pub role: Option<Role>,
}

/// Program overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProgramsConfig {
    /// Replacement self-test program.
    #[serde(default)]
    pub initialization: Option<PlanConfig>,

    /// Replacement out-of-order program.
    #[serde(default)]
    pub noop: Option<PlanConfig>,

    /// Replacement list of normal-operation programs.
    #[serde(default)]
    pub normal: Option<Vec<PlanConfig>>,
}

/// A program with its per-role start phases.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlanConfig {
    /// The phases, e.g. `- { state: [1, 0, 0], ticks: 40 }`.
    pub phases: Program,

    /// Start phase of primary heads.
    #[serde(default)]
    pub primary_phase: usize,

    /// Start phase of secondary heads.
    #[serde(default)]
    pub secondary_phase: usize,
}

/// Timings of the engine's demo cycle.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CycleConfig {
    /// How long the self-test program runs.
    #[serde(default = "default_keep_initial_ms")]
    pub keep_initial_ms: u64,

    /// How long the out-of-order program runs.
    #[serde(default = "default_keep_noop_ms")]
    pub keep_noop_ms: u64,

    /// How long each normal program runs.
    #[serde(default = "default_keep_normal_ms")]
    pub keep_normal_ms: u64,

    /// Stop after this many full cycles (0 = run until interrupted).
    #[serde(default)]
    pub max_cycles: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            keep_initial_ms: default_keep_initial_ms(),
            keep_noop_ms: default_keep_noop_ms(),
            keep_normal_ms: default_keep_normal_ms(),
            max_cycles: 0,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

const fn default_tick_interval_ms() -> u64 {
    100
}

const fn default_join_grace_ms() -> u64 {
    2000
}

fn default_units() -> Vec<UnitConfig> {
    ["North", "East"]
        .into_iter()
        .map(|name| UnitConfig {
            name: name.to_owned(),
            role: None,
        })
        .collect()
}

const fn default_keep_initial_ms() -> u64 {
    2500
}

const fn default_keep_noop_ms() -> u64 {
    5000
}

const fn default_keep_normal_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_owned()
}

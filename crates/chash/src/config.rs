//! TOML configuration for the `chash` tool.
//!
//! Every section is optional. Values given on the command line override the
//! file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chash_ring::{DEFAULT_CHECK_INTERVAL, DEFAULT_SHADOW_COUNT};
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Ring shape and initial targets.
    pub ring: RingSection,
    /// Background liveness checking.
    pub checker: CheckerSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[ring]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RingSection {
    /// Shadow identities per target. 0 selects the library default.
    pub shadow_count: u16,
    /// Targets placed on the ring at startup.
    pub targets: Vec<String>,
}

/// `[checker]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CheckerSection {
    /// Milliseconds between reconcile passes. 0 selects the library default.
    pub interval_ms: u64,
    /// File listing unhealthy targets, one per line.
    pub down_file: Option<PathBuf>,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Effective shadow count.
    pub fn shadow_count(&self) -> u16 {
        match self.ring.shadow_count {
            0 => DEFAULT_SHADOW_COUNT,
            n => n,
        }
    }

    /// Effective checker interval.
    pub fn check_interval(&self) -> Duration {
        match self.checker.interval_ms {
            0 => DEFAULT_CHECK_INTERVAL,
            ms => Duration::from_millis(ms),
        }
    }
}

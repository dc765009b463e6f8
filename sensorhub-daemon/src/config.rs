//! Daemon configuration: defaults, then a TOML file, then `SENSORHUB_*` environment overrides.
//! Command-line flags are applied last by `main`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use sensorhub_core::CoordinatorConfig;

/// File: `--config PATH`, else ~/.config/sensorhub/config.toml, else /etc/sensorhub/config.toml.
/// Env overrides: SENSORHUB_TRANSPORT_PORT, SENSORHUB_DISCOVERY_PORT, SENSORHUB_DATA_DIR,
/// SENSORHUB_LOG_LEVEL.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Node-facing TCP port (default 45679).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Discovery UDP port (default 45678).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Root directory for session folders.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Default tracing filter when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

fn default_transport_port() -> u16 {
    45679
}
fn default_discovery_port() -> u16 {
    45678
}
fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/sensorhub/sessions"),
        None => PathBuf::from("sessions"),
    }
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport_port: default_transport_port(),
            discovery_port: default_discovery_port(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl Config {
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).context("invalid configuration")
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(s) = lookup("SENSORHUB_TRANSPORT_PORT") {
            self.transport_port = s
                .parse()
                .with_context(|| format!("SENSORHUB_TRANSPORT_PORT={s}"))?;
        }
        if let Some(s) = lookup("SENSORHUB_DISCOVERY_PORT") {
            self.discovery_port = s
                .parse()
                .with_context(|| format!("SENSORHUB_DISCOVERY_PORT={s}"))?;
        }
        if let Some(s) = lookup("SENSORHUB_DATA_DIR") {
            self.data_dir = PathBuf::from(s);
        }
        if let Some(s) = lookup("SENSORHUB_LOG_LEVEL") {
            self.log_level = s;
        }
        Ok(())
    }
}

/// Load config: an explicit path must exist; otherwise the first default path found is used.
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let mut c = match explicit {
        Some(p) => read_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => read_file(&p)?,
            None => Config::default(),
        },
    };
    c.apply_env(|k| std::env::var(k).ok())?;
    Ok(c)
}

fn read_file(path: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    Config::parse(&s).with_context(|| format!("parsing config {}", path.display()))
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/sensorhub/config.toml"));
    }
    out.push(PathBuf::from("/etc/sensorhub/config.toml"));
    out
}

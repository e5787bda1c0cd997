//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use offmesh_core::ManagerConfig;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/offmesh/config.toml or /etc/offmesh/config.toml.
/// Env overrides: OFFMESH_TRANSPORT_PORT, OFFMESH_DISCOVERY_PORT, OFFMESH_DEVICE_NAME,
/// OFFMESH_DIAL_TIMEOUT_SECS.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Session TCP port, advertised in beacons (default 45679).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Discovery UDP port (default 45678).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Name shown to peers. Defaults to the host name.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default)]
    pub dial_timeout_secs: Option<u64>,
    #[serde(default)]
    pub write_timeout_secs: Option<u64>,
    #[serde(default)]
    pub read_idle_timeout_secs: Option<u64>,
}

fn default_transport_port() -> u16 {
    45679
}
fn default_discovery_port() -> u16 {
    45678
}
fn default_read_buffer_size() -> usize {
    offmesh_core::config::DEFAULT_READ_BUFFER_SIZE
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "offmesh".to_owned())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport_port: default_transport_port(),
            discovery_port: default_discovery_port(),
            device_name: default_device_name(),
            read_buffer_size: default_read_buffer_size(),
            dial_timeout_secs: None,
            write_timeout_secs: None,
            read_idle_timeout_secs: None,
        }
    }
}

impl Config {
    pub fn manager_config(&self) -> ManagerConfig {
        let mut m = ManagerConfig::default().with_read_buffer_size(self.read_buffer_size);
        if let Some(s) = self.dial_timeout_secs {
            m = m.with_dial_timeout(Duration::from_secs(s));
        }
        if let Some(s) = self.write_timeout_secs {
            m = m.with_write_timeout(Duration::from_secs(s));
        }
        if let Some(s) = self.read_idle_timeout_secs {
            m = m.with_read_idle_timeout(Duration::from_secs(s));
        }
        m
    }

    fn apply_env(&mut self) {
        if let Some(p) = env_parse::<u16>("OFFMESH_TRANSPORT_PORT") {
            self.transport_port = p;
        }
        if let Some(p) = env_parse::<u16>("OFFMESH_DISCOVERY_PORT") {
            self.discovery_port = p;
        }
        if let Ok(name) = std::env::var("OFFMESH_DEVICE_NAME") {
            if !name.trim().is_empty() {
                self.device_name = name.trim().to_owned();
            }
        }
        if let Some(s) = env_parse::<u64>("OFFMESH_DIAL_TIMEOUT_SECS") {
            self.dial_timeout_secs = Some(s);
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

/// Load config: default, then the explicit file or the first standard file found, then env vars.
/// An explicit path must exist and parse; a broken standard file is an error too.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => load_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_file(&path)?,
            None => Config::default(),
        },
    };
    c.apply_env();
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/offmesh/config.toml"));
    }
    out.push(PathBuf::from("/etc/offmesh/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parse config {}", path.display()))
}

//! Load config from file and environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use lanlink_core::reliable::{DEFAULT_MAX_RETRANSMITS, DEFAULT_RESEND_AFTER};
use lanlink_core::{
    CoreConfig, RetransmitPolicy, CLEANUP_INTERVAL, DEFAULT_PORT, DEVICE_TIMEOUT, HEARTBEAT_INTERVAL,
    RESEND_INTERVAL,
};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/lanlink/config.toml or /etc/lanlink/config.toml.
/// Env overrides: LANLINK_PORT, LANLINK_BROADCAST, LANLINK_DOWNLOAD_DIR.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP port every node binds and broadcasts to (default 9876).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Heartbeat destination (default limited broadcast).
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: IpAddr,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_device_timeout_ms")]
    pub device_timeout_ms: u64,
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    #[serde(default = "default_resend_interval_ms")]
    pub resend_interval_ms: u64,
    #[serde(default = "default_resend_after_ms")]
    pub resend_after_ms: u64,
    /// 0 retries forever.
    #[serde(default = "default_max_retransmits")]
    pub max_retransmits: u32,
    /// Where received files are written.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_broadcast_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::BROADCAST)
}
fn default_heartbeat_interval_ms() -> u64 {
    millis(HEARTBEAT_INTERVAL)
}
fn default_device_timeout_ms() -> u64 {
    millis(DEVICE_TIMEOUT)
}
fn default_cleanup_interval_ms() -> u64 {
    millis(CLEANUP_INTERVAL)
}
fn default_resend_interval_ms() -> u64 {
    millis(RESEND_INTERVAL)
}
fn default_resend_after_ms() -> u64 {
    millis(DEFAULT_RESEND_AFTER)
}
fn default_max_retransmits() -> u32 {
    DEFAULT_MAX_RETRANSMITS
}
fn default_download_dir() -> PathBuf {
    PathBuf::from(".")
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            broadcast_addr: default_broadcast_addr(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            device_timeout_ms: default_device_timeout_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            resend_interval_ms: default_resend_interval_ms(),
            resend_after_ms: default_resend_after_ms(),
            max_retransmits: default_max_retransmits(),
            download_dir: default_download_dir(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        toml::from_str(s).context("invalid config")
    }

    /// Apply LANLINK_* overrides. Unparseable values are ignored with a warning.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = lookup("LANLINK_PORT") {
            match s.parse::<u16>() {
                Ok(p) => self.port = p,
                Err(_) => tracing::warn!(value = %s, "ignoring invalid LANLINK_PORT"),
            }
        }
        if let Some(s) = lookup("LANLINK_BROADCAST") {
            match s.parse::<IpAddr>() {
                Ok(a) => self.broadcast_addr = a,
                Err(_) => tracing::warn!(value = %s, "ignoring invalid LANLINK_BROADCAST"),
            }
        }
        if let Some(s) = lookup("LANLINK_DOWNLOAD_DIR") {
            if !s.is_empty() {
                self.download_dir = PathBuf::from(s);
            }
        }
    }

    /// Timer periods must be non-zero.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (field, value) in [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("device_timeout_ms", self.device_timeout_ms),
            ("cleanup_interval_ms", self.cleanup_interval_ms),
            ("resend_interval_ms", self.resend_interval_ms),
            ("resend_after_ms", self.resend_after_ms),
        ] {
            anyhow::ensure!(value > 0, "{field} must be greater than zero");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port)
    }

    pub fn broadcast_target(&self) -> SocketAddr {
        SocketAddr::new(self.broadcast_addr, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }

    pub fn retransmit_policy(&self) -> RetransmitPolicy {
        RetransmitPolicy {
            resend_after: Duration::from_millis(self.resend_after_ms),
            max_retransmits: (self.max_retransmits > 0).then_some(self.max_retransmits),
        }
    }

    pub fn core_config(&self) -> CoreConfig {
        CoreConfig {
            device_timeout: Duration::from_millis(self.device_timeout_ms),
            retransmit: self.retransmit_policy(),
        }
    }
}

/// Load config: merge default, then config file (explicit path or first existing default path), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(p) => read_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => read_file(&p)?,
            None => Config::default(),
        },
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lanlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/lanlink/config.toml"));
    out
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let c = Config::from_toml_str(&s).with_context(|| format!("parsing {}", path.display()))?;
    tracing::debug!(path = %path.display(), "config loaded");
    Ok(c)
}

use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

use crate::registry::MAX_POLL_INTERVAL_SECS;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// Top-level configuration loaded from `config.json`.
//
// It defines:
// - Where the HTTP surface listens
// - Polling and fetch timing
// - Eviction policy for unresponsive servers
//
// Every field has a default, so a missing file (or an empty
// object) yields a working proxy.
//
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Bind address of the HTTP surface
    pub listen: SocketAddr,

    /// Initial poll interval in seconds (1 ..= one week)
    pub poll_interval_secs: u64,

    /// Timeout applied to every outbound metrics request
    pub fetch_timeout_ms: u64,

    /// Eviction threshold.
    ///
    /// A server is evicted once its failure counter EXCEEDS this value,
    /// i.e. on failure number `max_failures + 1`.
    pub max_failures: u32,

    /// Reset the failure counter after a successful fetch.
    ///
    /// Off by default: a server keeps its failure history even
    /// across long stretches of successful scrapes.
    pub reset_failures_on_success: bool,

    /// Period of the runtime counter log line (0 disables it)
    pub metrics_report_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3000)),
            poll_interval_secs: 20,
            fetch_timeout_ms: 10_000,
            max_failures: 5,
            reset_failures_on_success: false,
            metrics_report_secs: 60,
        }
    }
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(1..=MAX_POLL_INTERVAL_SECS).contains(&self.poll_interval_secs) {
            bail!(
                "poll_interval_secs must be between 1 and {MAX_POLL_INTERVAL_SECS}, got {}",
                self.poll_interval_secs
            );
        }
        if self.fetch_timeout_ms == 0 {
            bail!("fetch_timeout_ms must be greater than zero");
        }
        Ok(())
    }
}

// ------------------------------------------------------------
// Configuration loader
// ------------------------------------------------------------
//
// Reads a JSON configuration file from disk and deserializes
// it into the strongly typed `Config` structure.
//
// A missing file is not an error: the defaults are used.
// A malformed or semantically invalid file is.
//
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();

    let cfg = match fs::read_to_string(path) {
        Ok(data) => serde_json::from_str::<Config>(&data)
            .with_context(|| format!("invalid config file {}", path.display()))?,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            log::info!("{} not found, using default configuration", path.display());
            Config::default()
        }
        Err(e) => {
            return Err(e).with_context(|| format!("cannot read config file {}", path.display()));
        }
    };

    cfg.validate()?;
    Ok(cfg)
}

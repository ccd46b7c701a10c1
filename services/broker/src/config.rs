//! Broker configuration (env-driven).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::manager::DEFAULT_DOMAIN;

/// Which provisioning backend to run against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    /// In-process fake machines.
    Mock,
    /// External provisioner reachable at the given base URL.
    Http { provisioner_url: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Address to listen on for HTTP and WebSocket traffic.
    pub listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory holding the snapshot database.
    pub data_dir: PathBuf,

    /// Period of the idle reaper.
    pub reap_interval: Duration,

    /// Inactivity after which a user's resource is reclaimed.
    pub idle_timeout: Duration,

    /// Resource ids are drawn from `0..id_domain`.
    pub id_domain: u32,

    pub backend: BackendKind,

    /// Optional TOML catalog of launchable targets.
    pub catalog_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = var("VMLEASE_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:3000".to_string())
            .parse()
            .context("VMLEASE_LISTEN_ADDR must be a socket address (host:port).")?;

        let log_level = var("VMLEASE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let data_dir = var("VMLEASE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/vmlease"));

        let reap_interval_secs: u64 = var("VMLEASE_REAP_INTERVAL_SECS")
            .map(|v| v.parse())
            .transpose()
            .context("VMLEASE_REAP_INTERVAL_SECS must be an integer (seconds).")?
            .unwrap_or(60);
        if reap_interval_secs == 0 {
            bail!("VMLEASE_REAP_INTERVAL_SECS must be greater than zero.");
        }

        let idle_timeout_secs: u64 = var("VMLEASE_IDLE_TIMEOUT_SECS")
            .map(|v| v.parse())
            .transpose()
            .context("VMLEASE_IDLE_TIMEOUT_SECS must be an integer (seconds).")?
            .unwrap_or(reap_interval_secs);

        let id_domain: u32 = var("VMLEASE_ID_DOMAIN")
            .map(|v| v.parse())
            .transpose()
            .context("VMLEASE_ID_DOMAIN must be a positive integer.")?
            .unwrap_or(DEFAULT_DOMAIN);
        if id_domain == 0 {
            bail!("VMLEASE_ID_DOMAIN must be greater than zero.");
        }

        let backend = match var("VMLEASE_BACKEND").as_deref().unwrap_or("mock") {
            "mock" => BackendKind::Mock,
            "http" => BackendKind::Http {
                provisioner_url: var("VMLEASE_PROVISIONER_URL").context(
                    "VMLEASE_PROVISIONER_URL is required when VMLEASE_BACKEND=http.",
                )?,
            },
            other => bail!("VMLEASE_BACKEND must be 'mock' or 'http', got '{other}'."),
        };

        let catalog_path = var("VMLEASE_CATALOG_PATH").map(PathBuf::from);

        Ok(Self {
            listen_addr,
            log_level,
            data_dir,
            reap_interval: Duration::from_secs(reap_interval_secs),
            idle_timeout: Duration::from_secs(idle_timeout_secs),
            id_domain,
            backend,
            catalog_path,
        })
    }

    /// Path of the snapshot database.
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("broker.db")
    }
}

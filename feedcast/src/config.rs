//! Node configuration
//!
//! The node reads a single RON file describing where it keeps its spool, where
//! the provisioning file lives and how the worker pool behaves. Destinations,
//! routes and timers are not part of it; they come from the provisioning file
//! and can be reloaded without a restart.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use feedcast_common::{audit::AuditConfig, logging::LoggingConfig};
use feedcast_delivery::{DeliveryConfig, RedirectConfig};
use serde::Deserialize;

pub const CONFIG_ENV: &str = "FEEDCAST_CONFIG";

const DEFAULT_PATHS: &[&str] = &["./feedcast.config.ron", "/etc/feedcast/feedcast.config.ron"];

const fn default_disk_check_interval_secs() -> u64 {
    30
}

fn default_spool_root() -> PathBuf {
    PathBuf::from("/var/spool/feedcast")
}

fn default_provisioning() -> PathBuf {
    PathBuf::from("/etc/feedcast/provisioning.ron")
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Name of this node, as it appears in the provisioning node list
    pub node: String,

    /// Directory holding one spool directory per destination
    #[serde(default = "default_spool_root")]
    pub spool_root: PathBuf,

    /// Provisioning file, re-read on SIGHUP
    #[serde(default = "default_provisioning")]
    pub provisioning: PathBuf,

    #[serde(default)]
    pub redirects: RedirectConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// How often free disk space is sampled (in seconds)
    #[serde(default = "default_disk_check_interval_secs")]
    pub disk_check_interval_secs: u64,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NodeConfig {
    /// Parse a configuration file.
    ///
    /// # Errors
    ///
    /// If the file cannot be read or is not valid RON for this structure.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config from {}: {e}", path.display())
        })?;

        ron::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config in {}: {e}", path.display()))
    }

    /// Where the redirect log lives, defaulting to the spool root.
    #[must_use]
    pub fn redirect_log(&self) -> PathBuf {
        self.redirects
            .path
            .clone()
            .unwrap_or_else(|| self.spool_root.join("redirects.log"))
    }

    #[must_use]
    pub const fn redirect_ttl(&self) -> Duration {
        Duration::from_secs(self.redirects.ttl_secs)
    }

    #[must_use]
    pub const fn disk_check_interval(&self) -> Duration {
        Duration::from_secs(self.disk_check_interval_secs)
    }
}

/// Find the configuration file using the following precedence:
/// 1. The path given on the command line
/// 2. `FEEDCAST_CONFIG` environment variable
/// 3. ./feedcast.config.ron (current working directory)
/// 4. /etc/feedcast/feedcast.config.ron (system-wide config)
///
/// # Errors
///
/// If an explicitly named file does not exist, or none of the defaults do.
pub fn find_config_file(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let defaults: Vec<PathBuf> = DEFAULT_PATHS.iter().map(PathBuf::from).collect();
    locate(explicit, std::env::var(CONFIG_ENV).ok(), &defaults)
}

pub(crate) fn locate(
    explicit: Option<PathBuf>,
    env: Option<String>,
    defaults: &[PathBuf],
) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("Config file does not exist: {}", path.display());
    }

    if let Some(env_path) = env {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
    }

    if let Some(path) = defaults.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = defaults
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - --config\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}

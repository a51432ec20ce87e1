//! Node configuration loaded from `modman.toml`.
//!
//! Every field has a default, so an absent file or a partial file is fine.
//!
//! ```toml
//! node_id = "node-a"
//! store_dir = "/mnt/shared/modman/store"
//! workers = 4
//! stale_after_secs = 900
//! module_headers = ["Module-Type", "Cluster-Deployment"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::store::validate_segment;

pub const CONFIG_FILE_NAME: &str = "modman.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity of this node in the cluster.
    pub node_id: String,
    /// Root of the shared tree store.
    pub store_dir: PathBuf,
    /// Local package runtime cache.
    pub runtime_dir: PathBuf,
    /// Content-addressed staging area for uploaded archives. Must be
    /// readable by every node that installs from it.
    pub staging_dir: PathBuf,
    /// Concurrent processing workers.
    pub workers: usize,
    /// A `processing` claim older than this may be taken over.
    pub stale_after_secs: u64,
    /// Period of the safety-net queue sweep.
    pub sweep_interval_secs: u64,
    /// Period of inventory reconciliation; 0 disables it.
    pub reconcile_interval_secs: u64,
    /// Start bundles right after installing them.
    pub auto_start: bool,
    /// Manifest headers that mark a package as a managed module.
    pub module_headers: Vec<String>,
    /// Attempts for store writes that fail transiently.
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            node_id: std::env::var("MODMAN_NODE_ID").unwrap_or_else(|_| "node-1".to_string()),
            store_dir: data_dir.join("store"),
            runtime_dir: data_dir.join("runtime"),
            staging_dir: data_dir.join("staging"),
            workers: 4,
            stale_after_secs: 900,
            sweep_interval_secs: 30,
            reconcile_interval_secs: 300,
            auto_start: true,
            module_headers: vec!["Module-Type".to_string(), "Cluster-Deployment".to_string()],
            retry_attempts: 3,
            retry_base_delay_ms: 100,
        }
    }
}

impl NodeConfig {
    /// Load from `path`, falling back to defaults if the file is absent.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: NodeConfig = toml::from_str(content).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Default config file location (`<config dir>/modman/modman.toml`).
    pub fn default_path() -> anyhow::Result<PathBuf> {
        Ok(dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
            .join("modman")
            .join(CONFIG_FILE_NAME))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        validate_segment(&self.node_id)
            .map_err(|reason| anyhow::anyhow!("Invalid node_id '{}': {}", self.node_id, reason))?;
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.sweep_interval_secs == 0 {
            anyhow::bail!("sweep_interval_secs must be at least 1");
        }
        if self.retry_attempts == 0 {
            anyhow::bail!("retry_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.stale_after_secs).unwrap_or(i64::MAX / 1000))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_interval_secs > 0).then(|| Duration::from_secs(self.reconcile_interval_secs))
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|p| p.join("modman"))
        .unwrap_or_else(|| PathBuf::from(".modman"))
}

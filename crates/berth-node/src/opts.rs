//! Global options shared by every command.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use berth_core::BerthConfig;
use clap::Args;

/// These options apply to all commands and can be set via env vars.
#[derive(Args, Debug, Clone)]
pub struct NodeOpts {
    /// Node configuration file (env: BERTH_CONFIG)
    #[arg(long, global = true, env = "BERTH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Metadata database path, or :memory: (env: BERTH_DB)
    #[arg(long, global = true, env = "BERTH_DB", default_value = "/var/lib/berth/berth.db")]
    pub db: PathBuf,

    /// Pin the host address instead of detecting it (env: BERTH_HOST_ADDRESS)
    #[arg(long, global = true, env = "BERTH_HOST_ADDRESS")]
    pub host_address: Option<String>,

    /// Seconds between host address checks (env: BERTH_CHECK_INTERVAL_SECS)
    #[arg(long, global = true, env = "BERTH_CHECK_INTERVAL_SECS", default_value_t = 30)]
    pub check_interval_secs: u64,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pub pretty: bool,
}

impl NodeOpts {
    /// Load and validate the node configuration. A bad config is fatal.
    pub fn load_config(&self) -> Result<BerthConfig> {
        let config = BerthConfig::load(self.config.as_deref()).context("load node config")?;
        config.validate().context("validate node config")?;
        Ok(config)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

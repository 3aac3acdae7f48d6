pub mod exchange;
pub mod monitor;
pub mod registry;
pub mod types;

pub use exchange::{exchange_queue, ExchangeReceiver, ExchangeSender};
pub use monitor::GroupMonitor;
pub use registry::Registry;
pub use types::*;

use keeper_common::{KeeperError, Result, DEFAULT_DISCOVERY_ROOT};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Directory whose children are the monitored groups
    pub discovery_root: String,

    /// How often every monitor runs its health check (milliseconds)
    pub check_alive_interval_ms: u64,

    /// Heartbeat advance threshold used by the timeout check (milliseconds)
    pub keepalive_period_ms: u64,

    /// Store membership resync interval (milliseconds)
    pub resync_interval_ms: u64,

    /// Pending exchange events before producers block
    pub exchange_capacity: usize,

    /// First delay before re-establishing a failed discovery watch
    pub watch_backoff_initial_ms: u64,

    /// Upper bound for the discovery watch backoff
    pub watch_backoff_max_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            discovery_root: DEFAULT_DISCOVERY_ROOT.to_string(),
            check_alive_interval_ms: 3000,
            keepalive_period_ms: 1000,
            resync_interval_ms: 10_000,
            exchange_capacity: exchange::DEFAULT_EXCHANGE_CAPACITY,
            watch_backoff_initial_ms: 1000,
            watch_backoff_max_ms: 30_000,
        }
    }
}

impl RegistryConfig {
    pub fn check_alive_interval(&self) -> Duration {
        Duration::from_millis(self.check_alive_interval_ms)
    }

    pub fn keepalive_period(&self) -> Duration {
        Duration::from_millis(self.keepalive_period_ms)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }

    pub fn watch_backoff_initial(&self) -> Duration {
        Duration::from_millis(self.watch_backoff_initial_ms)
    }

    pub fn watch_backoff_max(&self) -> Duration {
        Duration::from_millis(self.watch_backoff_max_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.discovery_root.trim_matches('/').is_empty() {
            return Err(KeeperError::config("discovery_root must not be empty"));
        }
        if self.check_alive_interval_ms == 0 {
            return Err(KeeperError::config("check_alive_interval_ms must be greater than 0"));
        }
        if self.resync_interval_ms == 0 {
            return Err(KeeperError::config("resync_interval_ms must be greater than 0"));
        }
        if self.exchange_capacity == 0 {
            return Err(KeeperError::config("exchange_capacity must be greater than 0"));
        }
        if self.watch_backoff_initial_ms == 0
            || self.watch_backoff_max_ms < self.watch_backoff_initial_ms
        {
            return Err(KeeperError::config(
                "watch backoff must be positive and max >= initial",
            ));
        }
        Ok(())
    }
}

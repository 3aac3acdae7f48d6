use keeper_common::{KeeperError, Result};
use serde::{Deserialize, Serialize};

/// Which store implementation backs the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Etcd,
    Memory,
}

/// Coordination store client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Client URLs, e.g. `http://127.0.0.1:2379`
    pub endpoints: Vec<String>,
    /// Per-request timeout (watch long-polls are exempt)
    pub request_timeout_secs: u64,
    /// Extra attempts against other endpoints on network failure
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Etcd,
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            request_timeout_secs: 5,
            max_retries: 2,
            retry_delay_ms: 200,
        }
    }
}

impl StoreConfig {
    /// Build from a comma separated endpoint list (`host:port,host:port`).
    /// Endpoints without a scheme get `http://`.
    pub fn with_endpoints(mut self, hosts: &str) -> Self {
        self.endpoints = parse_endpoints(hosts);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend == StoreBackend::Memory {
            return Ok(());
        }

        if self.endpoints.is_empty() {
            return Err(KeeperError::config("at least one store endpoint is required"));
        }

        for endpoint in &self.endpoints {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(KeeperError::config(format!(
                    "endpoint must start with http:// or https://: {}",
                    endpoint
                )));
            }
        }

        if self.request_timeout_secs == 0 {
            return Err(KeeperError::config("request_timeout_secs must be greater than 0"));
        }

        Ok(())
    }
}

pub fn parse_endpoints(hosts: &str) -> Vec<String> {
    hosts
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(|h| {
            let h = h.trim_end_matches('/');
            if h.starts_with("http://") || h.starts_with("https://") {
                h.to_string()
            } else {
                format!("http://{}", h)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.request_timeout_secs, 5);
    }

    #[test]
    fn test_parse_endpoints() {
        let config = StoreConfig::default().with_endpoints("10.0.0.1:2379, https://10.0.0.2:2379/,,");
        assert_eq!(
            config.endpoints,
            vec!["http://10.0.0.1:2379", "https://10.0.0.2:2379"]
        );
    }

    #[test]
    fn test_validation() {
        let mut config = StoreConfig::default();
        config.endpoints.clear();
        assert!(config.validate().is_err());

        config.endpoints = vec!["ftp://host".to_string()];
        assert!(config.validate().is_err());

        config.backend = StoreBackend::Memory;
        assert!(config.validate().is_ok());
    }
}

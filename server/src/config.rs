use anyhow::Context;
use keeper_client::StoreConfig;
use keeper_cluster::RegistryConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Prefix for environment overrides, e.g. `KEEPER_HTTP_ADDRESS` or
/// `KEEPER_REGISTRY__KEEPALIVE_PERIOD_MS`
pub const ENV_PREFIX: &str = "KEEPER";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Listen address of the status API
    pub http_address: String,

    /// Default filter when `RUST_LOG` is unset
    pub log_level: String,

    pub store: StoreConfig,

    pub registry: RegistryConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            http_address: "0.0.0.0:13360".to_string(),
            log_level: "info".to_string(),
            store: StoreConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Layer defaults, an optional TOML file and `KEEPER_*` variables
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build().context("failed to read configuration")?;
        let config: DaemonConfig = settings
            .try_deserialize()
            .context("invalid configuration")?;
        Ok(config)
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        self.http_address
            .parse()
            .with_context(|| format!("invalid http_address: {}", self.http_address))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.socket_addr()?;
        self.store.validate()?;
        self.registry.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeper_client::StoreBackend;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.http_address, "0.0.0.0:13360");
        assert_eq!(config.registry.discovery_root, "/apus/agent-groups");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
http_address = "127.0.0.1:9000"

[store]
endpoints = ["http://10.0.0.1:2379", "http://10.0.0.2:2379"]
max_retries = 5

[registry]
discovery_root = "/custom/groups"
keepalive_period_ms = 2500
"#
        )
        .unwrap();

        let config = DaemonConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.http_address, "127.0.0.1:9000");
        assert_eq!(config.store.endpoints.len(), 2);
        assert_eq!(config.store.max_retries, 5);
        assert_eq!(config.store.backend, StoreBackend::Etcd);
        // Unset fields keep their defaults
        assert_eq!(config.store.request_timeout_secs, 5);
        assert_eq!(config.registry.discovery_root, "/custom/groups");
        assert_eq!(config.registry.keepalive_period_ms, 2500);
        assert_eq!(config.registry.check_alive_interval_ms, 3000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("keeper.toml");
        assert!(DaemonConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_invalid_address() {
        let config = DaemonConfig {
            http_address: "not-an-address".to_string(),
            ..DaemonConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

pub mod config;
pub mod etcd;
pub mod memory;

use keeper_common::Result;
use std::sync::Arc;
use std::time::Duration;

pub use config::*;
pub use etcd::EtcdClient;
pub use memory::MemoryStore;

/// A child entry returned by [`CoordinationStore::list_children`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreNode {
    pub key: String,
    pub is_dir: bool,
}

impl StoreNode {
    pub fn file(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            is_dir: false,
        }
    }

    pub fn dir(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            is_dir: true,
        }
    }
}

/// Kind of change reported by a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Create,
    Update,
    Delete,
}

impl WatchAction {
    /// Map an etcd v2 action name onto the three kinds the daemon cares about
    pub fn from_etcd(action: &str) -> Option<Self> {
        match action {
            "create" => Some(WatchAction::Create),
            "set" | "update" | "compareAndSwap" => Some(WatchAction::Update),
            "delete" | "expire" | "compareAndDelete" => Some(WatchAction::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for WatchAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchAction::Create => write!(f, "create"),
            WatchAction::Update => write!(f, "update"),
            WatchAction::Delete => write!(f, "delete"),
        }
    }
}

/// One notification from a subtree watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub key: String,
    pub value: Option<String>,
}

/// Blocking sequence of watch notifications
#[async_trait::async_trait]
pub trait StoreWatcher: Send {
    /// Wait for the next event below the watched directory
    async fn next(&mut self) -> Result<WatchEvent>;
}

/// Client interface for the coordination store
#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a value; `KeeperError::NotFound` when the key does not exist
    async fn get(&self, key: &str) -> Result<String>;

    /// Write a value, optionally expiring after `ttl`
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Delete a key or a whole directory
    async fn delete(&self, key: &str) -> Result<()>;

    /// List the children of a directory, sorted by key.
    ///
    /// With `recursive` every descendant is returned, parents before
    /// their children.
    async fn list_children(&self, dir: &str, recursive: bool) -> Result<Vec<StoreNode>>;

    /// Watch a subtree starting from the current state
    async fn watch(&self, dir: &str) -> Result<Box<dyn StoreWatcher>>;

    /// Refresh the client's view of the store cluster members
    async fn sync_members(&self) -> Result<Vec<String>>;
}

/// Create a store client based on configuration
pub fn create_store(config: StoreConfig) -> Result<Arc<dyn CoordinationStore>> {
    config.validate()?;

    match config.backend {
        StoreBackend::Etcd => {
            let client = EtcdClient::new(config)?;
            Ok(Arc::new(client))
        }
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}

use crate::{CoordinationStore, StoreNode, StoreWatcher, WatchAction, WatchEvent};
use keeper_common::{KeeperError, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Inner {
    keys: BTreeMap<String, Entry>,
    dirs: BTreeSet<String>,
}

/// In-process coordination store with etcd-like directory semantics.
///
/// Directories come into existence when a key below them is written or
/// when created explicitly with [`MemoryStore::create_dir`]. TTL entries
/// expire lazily on the next access and are reported as deletions.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_watch_capacity(WATCH_CHANNEL_CAPACITY)
    }

    /// Store whose watchers fall behind after `capacity` unread events
    pub fn with_watch_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            inner: RwLock::new(Inner::default()),
            events,
        }
    }

    /// Create a directory and its parents
    pub fn create_dir(&self, dir: &str) {
        let dir = normalize(dir);
        let created = {
            let mut inner = self.inner.write();
            let created = !inner.dirs.contains(&dir);
            add_with_parents(&mut inner.dirs, &dir);
            created
        };

        if created {
            self.publish(WatchAction::Create, &dir, None);
        }
    }

    fn publish(&self, action: WatchAction, key: &str, value: Option<String>) {
        // No receivers is fine
        let _ = self.events.send(WatchEvent {
            action,
            key: key.to_string(),
            value,
        });
    }

    /// Drop expired entries, returning the removed keys
    fn purge_expired(inner: &mut Inner) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = inner
            .keys
            .iter()
            .filter(|(_, e)| e.expires_at.map(|t| t <= now).unwrap_or(false))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            inner.keys.remove(key);
        }
        expired
    }

    fn with_purge<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let (result, expired) = {
            let mut inner = self.inner.write();
            let expired = Self::purge_expired(&mut inner);
            (f(&mut inner), expired)
        };

        for key in expired {
            debug!("Key expired: {}", key);
            self.publish(WatchAction::Delete, &key, None);
        }
        result
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<String> {
        let key = normalize(key);
        self.with_purge(|inner| {
            if let Some(entry) = inner.keys.get(&key) {
                return Ok(entry.value.clone());
            }
            if inner.dirs.contains(&key) {
                return Err(KeeperError::store(format!("{} is a directory", key)));
            }
            Err(KeeperError::not_found(key.clone()))
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let key = normalize(key);
        let existed = self.with_purge(|inner| {
            if inner.dirs.contains(&key) {
                return Err(KeeperError::store(format!("{} is a directory", key)));
            }
            if let Some(parent) = parent_of(&key) {
                if inner.keys.contains_key(parent) {
                    return Err(KeeperError::store(format!("{} is not a directory", parent)));
                }
                add_with_parents(&mut inner.dirs, parent);
            }

            let entry = Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            };
            Ok(inner.keys.insert(key.clone(), entry).is_some())
        })?;

        let action = if existed {
            WatchAction::Update
        } else {
            WatchAction::Create
        };
        self.publish(action, &key, Some(value.to_string()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = normalize(key);
        self.with_purge(|inner| {
            if inner.keys.remove(&key).is_some() {
                return Ok(());
            }
            if !inner.dirs.remove(&key) {
                return Err(KeeperError::not_found(key.clone()));
            }

            let prefix = format!("{}/", key);
            inner.keys.retain(|k, _| !k.starts_with(&prefix));
            inner.dirs.retain(|d| !d.starts_with(&prefix));
            Ok(())
        })?;

        self.publish(WatchAction::Delete, &key, None);
        Ok(())
    }

    async fn list_children(&self, dir: &str, recursive: bool) -> Result<Vec<StoreNode>> {
        let dir = normalize(dir);
        self.with_purge(|inner| {
            if !inner.dirs.contains(&dir) {
                if inner.keys.contains_key(&dir) {
                    return Err(KeeperError::store(format!("{} is not a directory", dir)));
                }
                return Err(KeeperError::not_found(dir.clone()));
            }

            let prefix = format!("{}/", dir);
            let is_wanted = |k: &str| {
                k.strip_prefix(&prefix)
                    .map(|rest| recursive || !rest.contains('/'))
                    .unwrap_or(false)
            };

            let mut nodes: Vec<StoreNode> = inner
                .dirs
                .iter()
                .filter(|d| is_wanted(d.as_str()))
                .map(|d| StoreNode::dir(d.clone()))
                .chain(
                    inner
                        .keys
                        .keys()
                        .filter(|k| is_wanted(k.as_str()))
                        .map(|k| StoreNode::file(k.clone())),
                )
                .collect();
            nodes.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(nodes)
        })
    }

    async fn watch(&self, dir: &str) -> Result<Box<dyn StoreWatcher>> {
        let dir = normalize(dir);
        if !self.inner.read().dirs.contains(&dir) {
            return Err(KeeperError::not_found(dir));
        }

        Ok(Box::new(MemoryWatcher {
            prefix: format!("{}/", dir),
            dir,
            events: self.events.subscribe(),
        }))
    }

    async fn sync_members(&self) -> Result<Vec<String>> {
        Ok(vec!["memory://local".to_string()])
    }
}

/// Watch over a [`MemoryStore`] subtree
pub struct MemoryWatcher {
    dir: String,
    prefix: String,
    events: broadcast::Receiver<WatchEvent>,
}

#[async_trait::async_trait]
impl StoreWatcher for MemoryWatcher {
    async fn next(&mut self) -> Result<WatchEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => {
                    if event.key == self.dir || event.key.starts_with(&self.prefix) {
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Watch on {} lagged, {} events lost", self.dir, skipped);
                    return Err(KeeperError::store(format!(
                        "watch on {} lost {} events",
                        self.dir, skipped
                    )));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(KeeperError::store("watch channel closed"));
                }
            }
        }
    }
}

fn normalize(key: &str) -> String {
    let trimmed = key.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn parent_of(key: &str) -> Option<&str> {
    match key.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&key[..idx]),
    }
}

fn add_with_parents(dirs: &mut BTreeSet<String>, dir: &str) {
    let mut current = Some(dir);
    while let Some(d) = current {
        if !dirs.insert(d.to_string()) {
            break;
        }
        current = parent_of(d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_delete() {
        let store = MemoryStore::new();

        assert!(store.get("/a/b").await.unwrap_err().is_not_found());

        store.set("/a/b", "v1", None).await.unwrap();
        assert_eq!(store.get("/a/b").await.unwrap(), "v1");

        store.set("/a/b", "v2", None).await.unwrap();
        assert_eq!(store.get("/a/b").await.unwrap(), "v2");

        store.delete("/a/b").await.unwrap();
        assert!(store.get("/a/b").await.unwrap_err().is_not_found());
        assert!(store.delete("/a/b").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_children() {
        let store = MemoryStore::new();
        store.set("/root/g2/members/n1/heartbeat", "x-y-1", None).await.unwrap();
        store.set("/root/g1/members/n2/heartbeat", "x-y-1", None).await.unwrap();
        store.set("/root/g1/members/n1/heartbeat", "x-y-1", None).await.unwrap();
        store.set("/root/g1/leader", "n1", None).await.unwrap();

        let groups = store.list_children("/root", false).await.unwrap();
        assert_eq!(
            groups,
            vec![StoreNode::dir("/root/g1"), StoreNode::dir("/root/g2")]
        );

        let g1 = store.list_children("/root/g1", false).await.unwrap();
        assert_eq!(
            g1,
            vec![StoreNode::file("/root/g1/leader"), StoreNode::dir("/root/g1/members")]
        );

        let members = store.list_children("/root/g1/members", false).await.unwrap();
        let keys: Vec<_> = members.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, vec!["/root/g1/members/n1", "/root/g1/members/n2"]);

        let all = store.list_children("/root/g1", true).await.unwrap();
        assert_eq!(all.len(), 6);

        assert!(store
            .list_children("/root/g3", false)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_delete_directory_is_recursive() {
        let store = MemoryStore::new();
        store.set("/root/g1/members/n1/heartbeat", "x-y-1", None).await.unwrap();
        store.set("/root/g1/leader", "n1", None).await.unwrap();

        store.delete("/root/g1").await.unwrap();

        assert!(store.list_children("/root", false).await.unwrap().is_empty());
        assert!(store.get("/root/g1/leader").await.unwrap_err().is_not_found());
        assert!(store
            .list_children("/root/g1/members", false)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_watch_reports_actions() {
        let store = MemoryStore::new();
        store.create_dir("/root");
        let mut watcher = store.watch("/root").await.unwrap();

        store.set("/other/key", "ignored", None).await.unwrap();
        store.set("/root/g1/leader", "n1", None).await.unwrap();
        store.set("/root/g1/leader", "n2", None).await.unwrap();
        store.delete("/root/g1").await.unwrap();

        let event = watcher.next().await.unwrap();
        assert_eq!(event.action, WatchAction::Create);
        assert_eq!(event.key, "/root/g1/leader");
        assert_eq!(event.value.as_deref(), Some("n1"));

        let event = watcher.next().await.unwrap();
        assert_eq!(event.action, WatchAction::Update);
        assert_eq!(event.value.as_deref(), Some("n2"));

        let event = watcher.next().await.unwrap();
        assert_eq!(event.action, WatchAction::Delete);
        assert_eq!(event.key, "/root/g1");
    }

    #[tokio::test]
    async fn test_lagging_watch_fails_instead_of_skipping() {
        let store = MemoryStore::with_watch_capacity(2);
        store.create_dir("/root");
        let mut watcher = store.watch("/root").await.unwrap();

        for i in 0..5 {
            store.set(&format!("/root/k{}", i), "v", None).await.unwrap();
        }

        assert!(watcher.next().await.is_err());
    }

    #[tokio::test]
    async fn test_watch_missing_dir_fails() {
        let store = MemoryStore::new();
        assert!(store.watch("/nothing").await.is_err());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store.create_dir("/root");
        let mut watcher = store.watch("/root").await.unwrap();

        store
            .set("/root/k", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(store.get("/root/k").await.unwrap(), "v");

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get("/root/k").await.unwrap_err().is_not_found());

        assert_eq!(watcher.next().await.unwrap().action, WatchAction::Create);
        let event = watcher.next().await.unwrap();
        assert_eq!(event.action, WatchAction::Delete);
        assert_eq!(event.key, "/root/k");
    }
}

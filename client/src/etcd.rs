use crate::{
    CoordinationStore, StoreConfig, StoreNode, StoreWatcher, WatchAction, WatchEvent,
};
use keeper_common::{KeeperError, Result};
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const ETCD_INDEX_HEADER: &str = "X-Etcd-Index";
const ERROR_CODE_KEY_NOT_FOUND: u64 = 100;
const ERROR_CODE_EVENT_INDEX_CLEARED: u64 = 401;

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    action: String,
    node: EtcdNode,
}

#[derive(Debug, Deserialize)]
struct EtcdNode {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
    #[serde(rename = "modifiedIndex", default)]
    modified_index: u64,
}

#[derive(Debug, Deserialize)]
struct EtcdErrorBody {
    #[serde(rename = "errorCode")]
    error_code: u64,
    message: String,
    #[serde(default)]
    cause: Option<String>,
    #[serde(default)]
    index: u64,
}

#[derive(Debug, Deserialize)]
struct MembersResponse {
    #[serde(default)]
    members: Vec<EtcdMember>,
}

#[derive(Debug, Deserialize)]
struct EtcdMember {
    #[serde(rename = "clientURLs", default)]
    client_urls: Vec<String>,
}

enum Reply {
    Ok { body: EtcdResponse, index: u64 },
    Err(EtcdErrorBody),
}

/// etcd v2 keys API client
pub struct EtcdClient {
    http: reqwest::Client,
    watch_http: reqwest::Client,
    endpoints: Arc<RwLock<Vec<String>>>,
    preferred: Arc<AtomicUsize>,
    config: StoreConfig,
}

impl EtcdClient {
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| KeeperError::network(format!("Failed to build HTTP client: {}", e)))?;

        // Watches are long polls and must not be cut by the request timeout
        let watch_http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| KeeperError::network(format!("Failed to build HTTP client: {}", e)))?;

        info!("etcd client configured with endpoints: {:?}", config.endpoints);

        Ok(Self {
            http,
            watch_http,
            endpoints: Arc::new(RwLock::new(config.endpoints.clone())),
            preferred: Arc::new(AtomicUsize::new(0)),
            config,
        })
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.read().clone()
    }

    /// Send a request, moving on to the next endpoint on network failure
    async fn send_with_failover<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    {
        let endpoints = self.endpoints();
        if endpoints.is_empty() {
            return Err(KeeperError::network("no etcd endpoints available"));
        }

        let start = self.preferred.load(Ordering::Relaxed);
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries as usize {
            let idx = (start + attempt) % endpoints.len();
            let endpoint = &endpoints[idx];

            match build(&self.http, endpoint).send().await {
                Ok(response) => {
                    self.preferred.store(idx, Ordering::Relaxed);
                    return Ok(response);
                }
                Err(e) => {
                    warn!(
                        "etcd request to {} failed (attempt {}/{}): {}",
                        endpoint,
                        attempt + 1,
                        self.config.max_retries + 1,
                        e
                    );
                    last_error = Some(e);
                    if attempt < self.config.max_retries as usize {
                        tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                    }
                }
            }
        }

        Err(KeeperError::network(format!(
            "etcd request failed: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Keys API call; etcd error bodies become [`KeeperError`]s
    async fn request<F>(&self, key: &str, build: F) -> Result<(EtcdResponse, u64)>
    where
        F: Fn(&reqwest::Client, String) -> reqwest::RequestBuilder,
    {
        let response = self
            .send_with_failover(|client, endpoint| build(client, keys_url(endpoint, key)))
            .await?;

        match read_reply(response).await? {
            Reply::Ok { body, index } => Ok((body, index)),
            Reply::Err(err) => Err(error_from_body(err, key)),
        }
    }
}

#[async_trait::async_trait]
impl CoordinationStore for EtcdClient {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<String> {
        let (body, _) = self.request(key, |client, url| client.get(url)).await?;
        if body.node.dir {
            return Err(KeeperError::store(format!("{} is a directory", key)));
        }
        Ok(body.node.value.unwrap_or_default())
    }

    #[instrument(skip(self, value))]
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut form = vec![("value", value.to_string())];
        if let Some(ttl) = ttl {
            form.push(("ttl", ttl.as_secs().max(1).to_string()));
        }

        self.request(key, |client, url| client.put(url).form(&form))
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        self.request(key, |client, url| {
            client.delete(url).query(&[("recursive", "true")])
        })
        .await
        .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn list_children(&self, dir: &str, recursive: bool) -> Result<Vec<StoreNode>> {
        let recursive_param = if recursive { "true" } else { "false" };
        let (body, _) = self
            .request(dir, |client, url| {
                client
                    .get(url)
                    .query(&[("recursive", recursive_param), ("sorted", "true")])
            })
            .await?;

        if !body.node.dir {
            return Err(KeeperError::store(format!("{} is not a directory", dir)));
        }
        Ok(flatten_nodes(&body.node.nodes, recursive))
    }

    async fn watch(&self, dir: &str) -> Result<Box<dyn StoreWatcher>> {
        let (_, index) = self.request(dir, |client, url| client.get(url)).await?;
        info!("start watch {} after {}", dir, index);

        Ok(Box::new(EtcdWatcher {
            http: self.watch_http.clone(),
            endpoints: self.endpoints.clone(),
            preferred: self.preferred.clone(),
            dir: dir.to_string(),
            wait_index: index + 1,
        }))
    }

    async fn sync_members(&self) -> Result<Vec<String>> {
        let response = self
            .send_with_failover(|client, endpoint| {
                client.get(format!("{}/v2/members", endpoint.trim_end_matches('/')))
            })
            .await?;

        if !response.status().is_success() {
            return Err(KeeperError::store(format!(
                "member list request failed with status {}",
                response.status()
            )));
        }

        let members: MembersResponse = response
            .json()
            .await
            .map_err(|e| KeeperError::store(format!("Invalid member list: {}", e)))?;

        let urls = client_urls(&members);
        if !urls.is_empty() {
            let mut endpoints = self.endpoints.write();
            if *endpoints != urls {
                debug!("etcd endpoints updated: {:?}", urls);
                *endpoints = urls.clone();
                self.preferred.store(0, Ordering::Relaxed);
            }
        }
        Ok(urls)
    }
}

/// Long-poll watch over an etcd directory
pub struct EtcdWatcher {
    http: reqwest::Client,
    endpoints: Arc<RwLock<Vec<String>>>,
    preferred: Arc<AtomicUsize>,
    dir: String,
    wait_index: u64,
}

#[async_trait::async_trait]
impl StoreWatcher for EtcdWatcher {
    async fn next(&mut self) -> Result<WatchEvent> {
        loop {
            let endpoint = {
                let endpoints = self.endpoints.read();
                if endpoints.is_empty() {
                    return Err(KeeperError::network("no etcd endpoints available"));
                }
                let idx = self.preferred.load(Ordering::Relaxed) % endpoints.len();
                endpoints[idx].clone()
            };

            let wait_index = self.wait_index.to_string();
            let response = self
                .http
                .get(keys_url(&endpoint, &self.dir))
                .query(&[
                    ("wait", "true"),
                    ("recursive", "true"),
                    ("waitIndex", wait_index.as_str()),
                ])
                .send()
                .await
                .map_err(|e| KeeperError::network(format!("watch on {} failed: {}", self.dir, e)))?;

            let (next_index, event) = watch_step(read_reply(response).await?, &self.dir)?;
            self.wait_index = next_index;
            if let Some(event) = event {
                return Ok(event);
            }
        }
    }
}

/// Decode one long-poll reply into the next wait index and, for actions
/// the daemon cares about, an event. A cleared index is an error: the
/// events in between are gone and the caller has to resync.
fn watch_step(reply: Reply, dir: &str) -> Result<(u64, Option<WatchEvent>)> {
    match reply {
        Reply::Ok { body, .. } => {
            let next_index = body.node.modified_index + 1;
            match WatchAction::from_etcd(&body.action) {
                Some(action) => Ok((
                    next_index,
                    Some(WatchEvent {
                        action,
                        key: body.node.key,
                        value: body.node.value,
                    }),
                )),
                None => {
                    debug!("ignoring etcd action {}", body.action);
                    Ok((next_index, None))
                }
            }
        }
        Reply::Err(err) if err.error_code == ERROR_CODE_EVENT_INDEX_CLEARED => {
            warn!("watch history on {} was cleared up to {}", dir, err.index);
            Err(KeeperError::store(format!(
                "watch on {} fell behind the event history (index {})",
                dir, err.index
            )))
        }
        Reply::Err(err) => Err(error_from_body(err, dir)),
    }
}

fn keys_url(endpoint: &str, key: &str) -> String {
    let key = key.trim_start_matches('/');
    format!("{}/v2/keys/{}", endpoint.trim_end_matches('/'), key)
}

async fn read_reply(response: reqwest::Response) -> Result<Reply> {
    let index = response
        .headers()
        .get(ETCD_INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| KeeperError::network(format!("Failed to read etcd response: {}", e)))?;

    parse_reply(status.is_success(), &bytes, index)
}

fn parse_reply(success: bool, bytes: &[u8], index: u64) -> Result<Reply> {
    if success {
        let body: EtcdResponse = serde_json::from_slice(bytes)?;
        return Ok(Reply::Ok { body, index });
    }

    match serde_json::from_slice::<EtcdErrorBody>(bytes) {
        Ok(err) => Ok(Reply::Err(err)),
        Err(_) => Err(KeeperError::store(format!(
            "unexpected etcd response: {}",
            String::from_utf8_lossy(bytes)
        ))),
    }
}

fn error_from_body(err: EtcdErrorBody, key: &str) -> KeeperError {
    if err.error_code == ERROR_CODE_KEY_NOT_FOUND {
        return KeeperError::not_found(err.cause.unwrap_or_else(|| key.to_string()));
    }
    KeeperError::store(format!("{} (code {})", err.message, err.error_code))
}

fn flatten_nodes(nodes: &[EtcdNode], recursive: bool) -> Vec<StoreNode> {
    let mut out = Vec::new();
    for node in nodes {
        out.push(StoreNode {
            key: node.key.clone(),
            is_dir: node.dir,
        });
        if recursive && node.dir {
            out.extend(flatten_nodes(&node.nodes, true));
        }
    }
    out
}

fn client_urls(members: &MembersResponse) -> Vec<String> {
    members
        .members
        .iter()
        .flat_map(|m| m.client_urls.iter())
        .map(|u| u.trim_end_matches('/').to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_url() {
        assert_eq!(
            keys_url("http://127.0.0.1:2379/", "/apus/agent-groups"),
            "http://127.0.0.1:2379/v2/keys/apus/agent-groups"
        );
    }

    #[test]
    fn test_parse_list_response() {
        let json = r#"{
            "action": "get",
            "node": {
                "key": "/apus/agent-groups/g1/members",
                "dir": true,
                "nodes": [
                    {"key": "/apus/agent-groups/g1/members/n1", "dir": true, "modifiedIndex": 5,
                     "nodes": [{"key": "/apus/agent-groups/g1/members/n1/heartbeat", "value": "a-b-1", "modifiedIndex": 6}]},
                    {"key": "/apus/agent-groups/g1/members/n2", "dir": true, "modifiedIndex": 7}
                ],
                "modifiedIndex": 4
            }
        }"#;

        let reply = parse_reply(true, json.as_bytes(), 9).unwrap();
        let (body, index) = match reply {
            Reply::Ok { body, index } => (body, index),
            Reply::Err(_) => panic!("expected success"),
        };
        assert_eq!(index, 9);
        assert!(body.node.dir);

        let direct = flatten_nodes(&body.node.nodes, false);
        assert_eq!(
            direct,
            vec![
                StoreNode::dir("/apus/agent-groups/g1/members/n1"),
                StoreNode::dir("/apus/agent-groups/g1/members/n2"),
            ]
        );

        let all = flatten_nodes(&body.node.nodes, true);
        assert_eq!(all.len(), 3);
        assert_eq!(all[1], StoreNode::file("/apus/agent-groups/g1/members/n1/heartbeat"));
    }

    #[test]
    fn test_parse_error_response() {
        let json = r#"{"errorCode":100,"message":"Key not found","cause":"/apus/agent-groups/g9","index":12}"#;
        let reply = parse_reply(false, json.as_bytes(), 12).unwrap();
        let err = match reply {
            Reply::Err(err) => err,
            Reply::Ok { .. } => panic!("expected error"),
        };
        assert_eq!(err.index, 12);

        let err = error_from_body(err, "/apus/agent-groups/g9");
        assert!(err.is_not_found());

        let cleared = r#"{"errorCode":401,"message":"The event in requested index is outdated and cleared","index":40}"#;
        match parse_reply(false, cleared.as_bytes(), 0).unwrap() {
            Reply::Err(err) => assert_eq!(err.error_code, ERROR_CODE_EVENT_INDEX_CLEARED),
            Reply::Ok { .. } => panic!("expected error"),
        }

        assert!(parse_reply(false, b"<html>bad gateway</html>", 0).is_err());
    }

    #[test]
    fn test_watch_step() {
        let json = r#"{"action":"set","node":{"key":"/apus/agent-groups/g1/leader","value":"n2","modifiedIndex":41}}"#;
        let reply = parse_reply(true, json.as_bytes(), 41).unwrap();
        let (next, event) = watch_step(reply, "/apus/agent-groups").unwrap();
        assert_eq!(next, 42);
        let event = event.unwrap();
        assert_eq!(event.action, WatchAction::Update);
        assert_eq!(event.value.as_deref(), Some("n2"));

        let json = r#"{"action":"get","node":{"key":"/apus/agent-groups","dir":true,"modifiedIndex":7}}"#;
        let reply = parse_reply(true, json.as_bytes(), 7).unwrap();
        assert_eq!(watch_step(reply, "/apus/agent-groups").unwrap(), (8, None));
    }

    #[test]
    fn test_cleared_watch_index_is_an_error() {
        let cleared = r#"{"errorCode":401,"message":"The event in requested index is outdated and cleared","index":40}"#;
        let reply = parse_reply(false, cleared.as_bytes(), 0).unwrap();
        let err = watch_step(reply, "/apus/agent-groups").unwrap_err();
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_client_urls_from_members() {
        let json = r#"{"members":[
            {"id":"a","name":"infra0","peerURLs":["http://10.0.0.1:2380"],"clientURLs":["http://10.0.0.1:2379/"]},
            {"id":"b","name":"infra1","peerURLs":["http://10.0.0.2:2380"],"clientURLs":["http://10.0.0.2:2379"]}
        ]}"#;
        let members: MembersResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            client_urls(&members),
            vec!["http://10.0.0.1:2379", "http://10.0.0.2:2379"]
        );
    }

    #[test]
    fn test_client_requires_endpoints() {
        let config = StoreConfig {
            endpoints: Vec::new(),
            ..StoreConfig::default()
        };
        assert!(EtcdClient::new(config).is_err());
    }
}

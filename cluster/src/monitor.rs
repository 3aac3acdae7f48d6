use crate::exchange::ExchangeSender;
use crate::types::{Exchange, KeepaliveOutcome, WorkerSnapshot};
use keeper_client::CoordinationStore;
use keeper_common::{base_name, Heartbeat, KeeperError, KeyLayout, Result};
use metrics::counter;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default)]
struct MonitorState {
    working_node: String,
    last_working_node: String,
    last_keepalive: Option<i64>,
    retired: bool,
}

/// Watches the designated leader of one group.
///
/// Health checks only read the leader assignment and report what they
/// find as [`Exchange`] events. The assignment itself is changed by the
/// registry's reconciliation loop through [`GroupMonitor::apply_update`]
/// and [`GroupMonitor::retire`]. Every operation that touches the store on
/// behalf of this group holds `op_lock`, so checks never overlap with each
/// other or with a reconciliation step for the same group.
pub struct GroupMonitor {
    group: String,
    layout: KeyLayout,
    keepalive_period: Duration,
    store: Arc<dyn CoordinationStore>,
    exchange: ExchangeSender,
    state: RwLock<MonitorState>,
    op_lock: Mutex<()>,
}

impl GroupMonitor {
    pub fn new(
        group: impl Into<String>,
        layout: KeyLayout,
        keepalive_period: Duration,
        store: Arc<dyn CoordinationStore>,
        exchange: ExchangeSender,
    ) -> Self {
        Self {
            group: group.into(),
            layout,
            keepalive_period,
            store,
            exchange,
            state: RwLock::new(MonitorState::default()),
            op_lock: Mutex::new(()),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn keepalive_period(&self) -> Duration {
        self.keepalive_period
    }

    /// Current leader, empty when unassigned
    pub fn working_node(&self) -> String {
        self.state.read().working_node.clone()
    }

    pub fn last_working_node(&self) -> String {
        self.state.read().last_working_node.clone()
    }

    pub fn last_keepalive(&self) -> Option<i64> {
        self.state.read().last_keepalive
    }

    pub fn is_retired(&self) -> bool {
        self.state.read().retired
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let state = self.state.read();
        WorkerSnapshot {
            group: self.group.clone(),
            working_node: state.working_node.clone(),
            last_working_node: state.last_working_node.clone(),
            last_keepalive: state.last_keepalive,
        }
    }

    /// Adopt the leader recorded in the store. An unset leader record
    /// leaves the monitor idle.
    pub async fn start_working(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        if self.is_retired() {
            return Ok(());
        }

        let leader_key = self.layout.leader_key(&self.group);
        let leader = match self.store.get(&leader_key).await {
            Ok(value) => value.trim().to_string(),
            Err(e) if e.is_not_found() => String::new(),
            Err(e) => return Err(e),
        };

        if leader.is_empty() {
            info!("[{}] no leader recorded, waiting for a working node", self.group);
        } else {
            info!("[{}] working node -> {}", self.group, leader);
        }
        self.state.write().working_node = leader;
        Ok(())
    }

    pub fn stop_working(&self) {
        self.state.write().working_node.clear();
    }

    /// Check the leader's heartbeat and request a failover when it looks
    /// dead. Never fails: every problem is logged and either reported as an
    /// exchange event or retried on the next tick.
    pub async fn keepalive(&self) -> KeepaliveOutcome {
        let guard = match self.op_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("[{}] previous check still running, skipping", self.group);
                return KeepaliveOutcome::Busy;
            }
        };

        let working_node = {
            let state = self.state.read();
            if state.retired {
                return KeepaliveOutcome::Retired;
            }
            state.working_node.clone()
        };

        if working_node.is_empty() {
            debug!("[{}] worker is waiting for a working node", self.group);
            return KeepaliveOutcome::Idle;
        }
        counter!("keeper.keepalive.checks").increment(1);

        let members_dir = self.layout.members_dir(&self.group);
        match self.store.list_children(&members_dir, false).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                error!("worker get [{}] group error: {}", self.group, e);
                drop(guard);
                self.emit(Exchange::exit(self.group.clone())).await;
                return KeepaliveOutcome::GroupGone;
            }
            Err(e) => {
                warn!("[{}] membership lookup failed, retrying next tick: {}", self.group, e);
                return KeepaliveOutcome::MembersUnavailable;
            }
        }

        let heartbeat_key = self.layout.heartbeat_key(&self.group, &working_node);
        let heartbeat = match self.store.get(&heartbeat_key).await {
            Ok(value) => value,
            Err(e) => {
                error!("worker get [{}] heartbeat error: {}", heartbeat_key, e);
                return KeepaliveOutcome::HeartbeatUnavailable;
            }
        };

        let timed_out = self.check_timeout(&heartbeat);
        self.state.write().last_working_node = working_node.clone();

        match timed_out {
            Ok(false) => {
                debug!(
                    "[{}] Worker Keepalive Success -> {:?}",
                    working_node,
                    self.last_keepalive()
                );
                return KeepaliveOutcome::Healthy;
            }
            Ok(true) => info!(
                "{} heartbeat is not working, prepare to find node alive in {}",
                working_node, self.group
            ),
            Err(e) => warn!(
                "{} heartbeat is malformed ({}), prepare to find node alive in {}",
                working_node, e, self.group
            ),
        }

        let candidate = match self.find_group_alive_node().await {
            Ok(candidate) => candidate,
            Err(e) => {
                error!("{}", e);
                return KeepaliveOutcome::NoAlternate;
            }
        };
        if candidate == working_node {
            return KeepaliveOutcome::NoAlternate;
        }
        drop(guard);

        info!("[{}] requesting failover {} -> {}", self.group, working_node, candidate);
        counter!("keeper.failovers.requested").increment(1);
        self.emit(Exchange::update(self.group.clone(), working_node, candidate.clone()))
            .await;

        KeepaliveOutcome::FailoverRequested { to: candidate }
    }

    /// Judge a heartbeat value against the last accepted timestamp.
    ///
    /// Returns `Ok(true)` ("timed out") when the timestamp advanced by less
    /// than the keepalive period; otherwise the timestamp becomes the new
    /// `last_keepalive`. The first heartbeat ever seen is accepted as is.
    /// Malformed values are errors and leave `last_keepalive` untouched.
    pub fn check_timeout(&self, heartbeat: &str) -> Result<bool> {
        let heartbeat = Heartbeat::parse(heartbeat)?;
        let mut state = self.state.write();

        let last = match state.last_keepalive {
            Some(last) => last,
            None => {
                state.last_keepalive = Some(heartbeat.timestamp);
                return Ok(false);
            }
        };

        let delta_ms = (heartbeat.timestamp as i128 - last as i128) * 1000;
        if delta_ms < self.keepalive_period.as_millis() as i128 {
            return Ok(true);
        }

        state.last_keepalive = Some(heartbeat.timestamp);
        Ok(false)
    }

    /// First member, in listing order, other than the current leader whose
    /// heartbeat parses and is not timed out.
    pub async fn find_group_alive_node(&self) -> Result<String> {
        let members_dir = self.layout.members_dir(&self.group);
        let members = match self.store.list_children(&members_dir, false).await {
            Ok(members) => members,
            Err(e) => {
                error!("[{}] No Members Found: {}", self.group, e);
                Vec::new()
            }
        };

        let working_node = self.working_node();
        for member in members.iter().filter(|m| m.is_dir) {
            let node = base_name(&member.key);
            if node == working_node {
                continue;
            }

            let heartbeat_key = self.layout.heartbeat_key(&self.group, node);
            let heartbeat = match self.store.get(&heartbeat_key).await {
                Ok(value) => value,
                Err(e) => {
                    debug!("[{}] skipping {}: {}", self.group, node, e);
                    continue;
                }
            };

            match self.check_timeout(&heartbeat) {
                Ok(false) => return Ok(node.to_string()),
                Ok(true) => debug!("[{}] candidate {} timed out", self.group, node),
                Err(e) => debug!("[{}] candidate {} rejected: {}", self.group, node, e),
            }
        }

        Err(KeeperError::NoAliveNode {
            group: self.group.clone(),
        })
    }

    /// Drop the leader assignment and ask the registry to remove this monitor
    pub async fn exit(&self) {
        info!("[{}] worker exit now", self.group);
        self.stop_working();
        self.emit(Exchange::exit(self.group.clone())).await;
    }

    /// Move leadership `from` -> `to`: records `to` in the store and adopts
    /// it. A non-empty `from` that no longer matches the current leader
    /// marks the request as stale and nothing happens. Returns whether the
    /// assignment changed.
    pub async fn apply_update(&self, from: &str, to: &str) -> Result<bool> {
        let _guard = self.op_lock.lock().await;
        {
            let state = self.state.read();
            if state.retired {
                debug!("[{}] ignoring update for retired monitor", self.group);
                return Ok(false);
            }
            if !from.is_empty() && state.working_node != from {
                warn!(
                    "[{}] stale update {} -> {}, current working node is {}",
                    self.group, from, to, state.working_node
                );
                return Ok(false);
            }
        }

        if !self.is_member(to).await? {
            warn!(
                "[{}] refusing update {} -> {}: {} is not a member",
                self.group, from, to, to
            );
            return Ok(false);
        }

        let leader_key = self.layout.leader_key(&self.group);
        self.store.set(&leader_key, to, None).await?;

        let mut state = self.state.write();
        let previous = std::mem::replace(&mut state.working_node, to.to_string());
        if !previous.is_empty() {
            state.last_working_node = previous;
        }
        Ok(true)
    }

    /// Whether `node` is listed under the group's members directory
    pub async fn is_member(&self, node: &str) -> Result<bool> {
        let members_dir = self.layout.members_dir(&self.group);
        match self.store.list_children(&members_dir, false).await {
            Ok(members) => Ok(members
                .iter()
                .any(|m| m.is_dir && base_name(&m.key) == node)),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Permanently deactivate this monitor
    pub async fn retire(&self) {
        let _guard = self.op_lock.lock().await;
        let mut state = self.state.write();
        state.retired = true;
        state.working_node.clear();
    }

    async fn emit(&self, exchange: Exchange) {
        if let Err(e) = self.exchange.send(exchange).await {
            error!("[{}] failed to queue exchange event: {}", self.group, e);
        }
    }
}

impl std::fmt::Debug for GroupMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupMonitor")
            .field("group", &self.group)
            .field("keepalive_period", &self.keepalive_period)
            .field("state", &*self.state.read())
            .finish()
    }
}

use crate::exchange::{exchange_queue, ExchangeReceiver, ExchangeSender};
use crate::monitor::GroupMonitor;
use crate::types::{Exchange, OpEvent, WorkerSnapshot};
use crate::RegistryConfig;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use keeper_client::{CoordinationStore, StoreWatcher, WatchAction, WatchEvent};
use keeper_common::{base_name, KeeperError, KeyLayout, KeyPath, Result};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Owns the group -> monitor mapping and runs discovery, health-check
/// dispatch, membership resync and the reconciliation loop.
///
/// The mapping is written only from the reconciliation loop: discovery
/// asks for registrations over an internal channel and removals always
/// travel as `Exit` exchange events.
pub struct Registry {
    config: RegistryConfig,
    layout: KeyLayout,
    store: Arc<dyn CoordinationStore>,
    workers: DashMap<String, Arc<GroupMonitor>>,
    exchange_tx: ExchangeSender,
    exchange_rx: Mutex<Option<ExchangeReceiver>>,
    register_tx: mpsc::Sender<String>,
    register_rx: Mutex<Option<mpsc::Receiver<String>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Registry {
    pub fn new(store: Arc<dyn CoordinationStore>, config: RegistryConfig) -> Result<Self> {
        config.validate()?;

        let (exchange_tx, exchange_rx) = exchange_queue(config.exchange_capacity);
        let (register_tx, register_rx) = mpsc::channel(config.exchange_capacity);

        Ok(Self {
            layout: KeyLayout::new(&config.discovery_root),
            config,
            store,
            workers: DashMap::new(),
            exchange_tx,
            exchange_rx: Mutex::new(Some(exchange_rx)),
            register_tx,
            register_rx: Mutex::new(Some(register_rx)),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Launch the background loops
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let exchange_rx = self
            .exchange_rx
            .lock()
            .take()
            .ok_or(KeeperError::AlreadyStarted)?;
        let register_rx = self
            .register_rx
            .lock()
            .take()
            .ok_or(KeeperError::AlreadyStarted)?;

        info!("Starting registry: discovery_root={}", self.layout.root());

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(self.clone().heartbeat()));
        tasks.push(tokio::spawn(self.clone().check_alive()));
        tasks.push(tokio::spawn(self.clone().discovery()));
        tasks.push(tokio::spawn(self.clone().schedule(exchange_rx, register_rx)));

        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.exchange_rx.lock().is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Signal every loop to stop
    pub fn close(&self) {
        info!("Closing registry");
        self.shutdown.cancel();
    }

    /// Close and wait for the loops to finish
    pub async fn shutdown(&self) {
        self.close();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("registry task ended abnormally: {}", e);
            }
        }
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Snapshot of every registered group
    pub fn get_workers(&self) -> HashMap<String, WorkerSnapshot> {
        self.workers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    pub fn get_worker(&self, group: &str) -> Option<WorkerSnapshot> {
        self.workers.get(group).map(|m| m.snapshot())
    }

    pub fn monitor(&self, group: &str) -> Option<Arc<GroupMonitor>> {
        self.workers.get(group).map(|m| m.value().clone())
    }

    /// Queue an exchange event for the reconciliation loop
    pub async fn submit(&self, exchange: Exchange) -> Result<()> {
        self.exchange_tx.send(exchange).await
    }

    /// List existing groups and request a monitor for each one that has
    /// members. Returns how many registrations were requested.
    pub async fn bootstrap(&self) -> usize {
        let root = self.layout.root();
        let groups = match self.store.list_children(root, false).await {
            Ok(groups) => groups,
            Err(e) => {
                error!("error to get nodes from {}: {}", root, e);
                return 0;
            }
        };

        let mut requested = 0;
        for group_node in groups.iter().filter(|n| n.is_dir) {
            let group = base_name(&group_node.key);
            let members_dir = self.layout.members_dir(group);
            let members = match self.store.list_children(&members_dir, false).await {
                Ok(members) => members,
                Err(e) => {
                    debug!("error to get nodes from {}: {}", members_dir, e);
                    continue;
                }
            };

            if members.is_empty() || self.workers.contains_key(group) {
                continue;
            }
            info!("register group [{}] with {} members", group, members.len());
            self.register_worker(group).await;
            requested += 1;
        }
        requested
    }

    /// Membership resync against the store cluster
    async fn heartbeat(self: Arc<Self>) {
        let period = self.config.resync_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.store.sync_members().await {
                Ok(members) => debug!("store members: {:?}", members),
                Err(e) => warn!("store member resync failed: {}", e),
            }
        }
        debug!("membership resync stopped");
    }

    /// Fire a health check at every monitor on each tick
    async fn check_alive(self: Arc<Self>) {
        let period = self.config.check_alive_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let monitors: Vec<Arc<GroupMonitor>> =
                self.workers.iter().map(|e| e.value().clone()).collect();
            for monitor in monitors {
                tokio::spawn(async move {
                    monitor.keepalive().await;
                });
            }
        }
        debug!("alive check stopped");
    }

    /// Bootstrap, then follow the discovery root. A watch that cannot be
    /// opened or breaks is re-established with exponential backoff, and
    /// the bootstrap listing is repeated to catch up on missed changes.
    async fn discovery(self: Arc<Self>) {
        info!("service monitor begin");
        let mut backoff = self.config.watch_backoff_initial();

        loop {
            self.bootstrap().await;

            let root = self.layout.root().to_string();
            let watcher = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                watcher = self.store.watch(&root) => watcher,
            };

            match watcher {
                Ok(watcher) => {
                    backoff = self.config.watch_backoff_initial();
                    self.follow(watcher).await;
                    if self.is_closed() {
                        break;
                    }
                }
                Err(e) => error!("failed to watch {}: {}", root, e),
            }

            warn!("re-establishing watch on {} in {:?}", root, backoff);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.watch_backoff_max());
        }
        debug!("discovery stopped");
    }

    /// Dispatch watch notifications until the watch fails or shutdown
    async fn follow(self: &Arc<Self>, mut watcher: Box<dyn StoreWatcher>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                event = watcher.next() => event,
            };

            match event {
                Ok(event) => self.dispatch_watch_event(event),
                Err(e) => {
                    warn!("watch on {} failed: {}", self.layout.root(), e);
                    return;
                }
            }
        }
    }

    fn dispatch_watch_event(self: &Arc<Self>, event: WatchEvent) {
        let registry = self.clone();
        match event.action {
            WatchAction::Create | WatchAction::Update => {
                tokio::spawn(async move {
                    registry
                        .handle_create_event(&event.key, event.value.as_deref())
                        .await;
                });
            }
            WatchAction::Delete => {
                tokio::spawn(async move {
                    registry.handle_remove_event(&event.key).await;
                });
            }
        }
    }

    /// A heartbeat appeared or changed: make sure its group is monitored.
    /// A leader record written from outside is adopted by the monitor.
    pub async fn handle_create_event(&self, key: &str, value: Option<&str>) {
        match self.layout.parse(key) {
            Some(KeyPath::Heartbeat { group, node }) => {
                debug!("heartbeat event {} ==== {}", group, node);
                self.register_worker(&group).await;
            }
            Some(KeyPath::Leader { group }) => {
                let (Some(monitor), Some(leader)) = (self.monitor(&group), value) else {
                    return;
                };
                let leader = leader.trim();
                let current = monitor.working_node();
                if leader.is_empty() || leader == current {
                    return;
                }

                // Watch events can arrive late; only the record's current value counts
                let leader_key = self.layout.leader_key(&group);
                match self.store.get(&leader_key).await {
                    Ok(stored) if stored.trim() == leader => {}
                    Ok(stored) => {
                        debug!(
                            "[{}] leader event {} superseded by {}",
                            group,
                            leader,
                            stored.trim()
                        );
                        return;
                    }
                    Err(e) => {
                        warn!("[{}] failed to confirm leader record: {}", group, e);
                        return;
                    }
                }

                info!("[{}] leader record changed to {}", group, leader);
                if let Err(e) = self.submit(Exchange::update(group, current, leader)).await {
                    error!("failed to queue leader change: {}", e);
                }
            }
            _ => {}
        }
    }

    /// A group directory was deleted: destroy its monitor
    pub async fn handle_remove_event(&self, key: &str) {
        info!("[DELETE] >> {}", key);
        if let Some(KeyPath::Group { group }) = self.layout.parse(key) {
            if self.workers.contains_key(&group) {
                if let Err(e) = self.submit(Exchange::exit(group)).await {
                    error!("failed to queue group removal: {}", e);
                }
            }
        }
    }

    /// Ask the reconciliation loop for a monitor (no-op if one exists)
    async fn register_worker(&self, group: &str) {
        if self.workers.contains_key(group) {
            return;
        }
        if self.register_tx.send(group.to_string()).await.is_err() {
            error!("registration channel closed, dropping group {}", group);
        }
    }

    /// Reconciliation loop: the only writer of the group -> monitor mapping
    async fn schedule(
        self: Arc<Self>,
        mut exchange_rx: ExchangeReceiver,
        mut register_rx: mpsc::Receiver<String>,
    ) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(group) = register_rx.recv() => self.apply_register(group),
                Some(exchange) = exchange_rx.recv() => self.handle_exchange(exchange),
                else => break,
            }
        }
        debug!("reconciliation loop stopped");
    }

    fn apply_register(self: &Arc<Self>, group: String) {
        let monitor = match self.workers.entry(group.clone()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                let monitor = Arc::new(GroupMonitor::new(
                    group.clone(),
                    self.layout.clone(),
                    self.config.keepalive_period(),
                    self.store.clone(),
                    self.exchange_tx.clone(),
                ));
                slot.insert(monitor.clone());
                monitor
            }
        };

        info!("[ADD] new group >> {}", group);
        counter!("keeper.groups.registered").increment(1);
        gauge!("keeper.groups").set(self.workers.len() as f64);

        tokio::spawn(async move {
            if let Err(e) = monitor.start_working().await {
                warn!("[{}] failed to resolve leader: {}", monitor.group(), e);
            }
        });
    }

    fn unregister_worker(&self, group: &str) {
        let Some((_, monitor)) = self.workers.remove(group) else {
            debug!("exit for unknown group {}", group);
            return;
        };

        info!("[REMOVE] old group >> {}", group);
        counter!("keeper.groups.removed").increment(1);
        gauge!("keeper.groups").set(self.workers.len() as f64);

        tokio::spawn(async move {
            monitor.retire().await;
        });
    }

    fn handle_exchange(&self, exchange: Exchange) {
        debug!("worker request agent exchange: {:?}", exchange);

        match exchange.op_event {
            OpEvent::Update => {
                if exchange.from == exchange.to {
                    debug!("[{}] update to same node {}, ignored", exchange.group, exchange.to);
                    return;
                }
                let Some(monitor) = self.monitor(&exchange.group) else {
                    warn!("update for unknown group {}", exchange.group);
                    return;
                };

                tokio::spawn(async move {
                    match monitor.apply_update(&exchange.from, &exchange.to).await {
                        Ok(true) => {
                            info!(
                                "[{}] working node {} -> {}",
                                exchange.group, exchange.from, exchange.to
                            );
                            counter!("keeper.failovers.applied").increment(1);
                        }
                        Ok(false) => {}
                        Err(e) => error!(
                            "[{}] failed to assign {}: {}",
                            exchange.group, exchange.to, e
                        ),
                    }
                });
            }
            OpEvent::Exit => {
                info!("handle a exit event from group : {}", exchange.group);
                self.unregister_worker(&exchange.group);
            }
            OpEvent::Stop => {
                let working_node = self.monitor(&exchange.group).map(|m| m.working_node());
                info!(
                    "handle a stop event from group : {} (working node: {:?})",
                    exchange.group, working_node
                );
            }
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

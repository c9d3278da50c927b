//! Replication Coordinator
//!
//! Ties one [`Membership`] and one [`Tree`] together into a store node.
//!
//! ## How It Works
//!
//! 1. **Writes**: any node accepts a write, stamps it with the clock and the
//!    replica count, applies it locally and forwards it to its successor
//!    with one replica less, either before answering (`sync`) or in the
//!    background
//! 2. **Reads**: served from the local tree only
//! 3. **Sync**: every interval, the range between our predecessor and us is
//!    reconciled in both directions with each of the next replicas
//! 4. **Clean**: data found past our own position that we do not own is
//!    pushed to its owners and deleted here
//! 5. **Migrate**: once the cluster has been quiet for a while, a node owning
//!    far more than its successor moves its position back so that roughly
//!    half the excess becomes the successor's
//!
//! The loops are independent. Stopping lets the current round finish.

use crate::infrastructure::clock::{wall_nanos, Clock};
use crate::infrastructure::oplog::SqliteOperationLog;
use crate::replication::config::ReplicationConfig;
use crate::replication::gossip::Membership;
use crate::replication::remote::RemoteHashTree;
use crate::replication::ring::between_ie;
use crate::replication::server::Dispatcher;
use crate::replication::sync::AntiEntropy;
use crate::replication::transport::Transport;
use crate::replication::types::{
    Comm, ConfItem, CoordinatorEvent, Item, NodeDescription, Range, Remote, Request, Response, StoreError,
    StoreRequest, WriteOp, POSITION_SIZE,
};
use crate::trie::{Bounds, Configuration, Entry, Trie, Tree};
use anyhow::Context;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Wall-clock times of the last background activity, in nanoseconds.
#[derive(Debug, Default)]
struct Activity {
    last_sync: AtomicI64,
    last_reroute: AtomicI64,
    last_migrate: AtomicI64,
}

impl Activity {
    fn latest(&self) -> i64 {
        self.last_sync
            .load(Ordering::SeqCst)
            .max(self.last_reroute.load(Ordering::SeqCst))
            .max(self.last_migrate.load(Ordering::SeqCst))
    }
}

/// Periodic background work.
#[derive(Debug, Clone, Copy)]
enum Round {
    Sync,
    Clean,
    Migrate,
}

/// One store node.
pub struct Coordinator {
    config: ReplicationConfig,
    clock: Arc<dyn Clock>,
    tree: Arc<Tree>,
    transport: Arc<Transport>,
    membership: Arc<Membership>,
    events: broadcast::Sender<CoordinatorEvent>,
    activity: Arc<Activity>,
}

impl Coordinator {
    /// Bind the endpoint, restore the operation log if one is configured and
    /// start serving requests. Background loops wait for [`Coordinator::start`].
    pub fn bind(config: ReplicationConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Arc<Self>> {
        config.validate()?;

        let transport = Arc::new(Transport::bind(config.listen_addr)?);
        let addr = match &config.broadcast_addr {
            Some(addr) => addr.clone(),
            None => transport.local_addr()?.to_string(),
        };

        let tree = match &config.log_path {
            Some(path) => {
                let log = SqliteOperationLog::open(path)
                    .with_context(|| format!("failed to open operation log {}", path.display()))?;
                let tree = Tree::with_log(clock.clone(), Arc::new(log));
                tree.restore().context("failed to restore operation log")?;
                tree
            }
            None => Tree::new(clock.clone()),
        };

        let (events, _) = broadcast::channel(1024);
        let membership = Arc::new(Membership::new(addr, transport.clone(), &config).with_events(events.clone()));

        let coordinator = Arc::new(Self {
            config,
            clock,
            tree: Arc::new(tree),
            transport: transport.clone(),
            membership,
            events,
            activity: Arc::new(Activity::default()),
        });
        transport.serve(Arc::new(Dispatcher::new(coordinator.clone())));

        tracing::info!(
            "store node {} listening on {}",
            coordinator.config.node_id,
            coordinator.membership.addr()
        );
        Ok(coordinator)
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn addr(&self) -> String {
        self.membership.addr()
    }

    pub fn position(&self) -> Vec<u8> {
        self.membership.position()
    }

    pub fn nodes(&self) -> Vec<Remote> {
        self.membership.nodes()
    }

    /// Background activity. Receivers that fall behind lose events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CoordinatorEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    // ==================== Lifecycle ====================

    /// Start membership and the sync, clean and migrate loops.
    pub fn start(self: &Arc<Self>) -> Result<(), StoreError> {
        self.membership.start()?;

        let mut changes = self.membership.ring().subscribe();
        let activity = self.activity.clone();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        activity.last_reroute.store(wall_nanos(), Ordering::SeqCst);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        for round in [Round::Sync, Round::Clean, Round::Migrate] {
            self.spawn_loop(round);
        }

        tracing::info!("store node {} started at {}", self.config.node_id, self.membership.me());
        Ok(())
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    fn spawn_loop(self: &Arc<Self>, round: Round) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            while coordinator.membership.is_started() {
                let outcome = match round {
                    Round::Sync => coordinator.sync_once().await,
                    Round::Clean => coordinator.clean_once().await,
                    Round::Migrate => coordinator.migrate_once().await.map(|_| ()),
                };
                if let Err(e) = outcome {
                    tracing::debug!("{:?} round on {} failed: {}", round, coordinator.addr(), e);
                }
                tokio::time::sleep(coordinator.config.sync_interval).await;
            }
            tracing::debug!("{:?} loop on {} finished", round, coordinator.addr());
        });
    }

    /// Enter the ring known by `seed`.
    pub async fn join(&self, seed: &str) -> Result<(), StoreError> {
        self.membership.join(seed).await
    }

    /// Stop the loops and close the endpoint.
    pub fn stop(&self) {
        self.membership.stop();
        self.transport.close();
        tracing::info!("store node {} stopped", self.config.node_id);
    }

    // ==================== Writes ====================

    pub async fn put(self: &Arc<Self>, item: Item) -> Result<(), StoreError> {
        self.write(WriteOp::Put, item).await
    }

    pub async fn del(self: &Arc<Self>, item: Item) -> Result<(), StoreError> {
        self.write(WriteOp::Del, item).await
    }

    pub async fn sub_put(self: &Arc<Self>, item: Item) -> Result<(), StoreError> {
        self.write(WriteOp::SubPut, item).await
    }

    pub async fn sub_del(self: &Arc<Self>, item: Item) -> Result<(), StoreError> {
        self.write(WriteOp::SubDel, item).await
    }

    pub async fn sub_clear(self: &Arc<Self>, item: Item) -> Result<(), StoreError> {
        self.write(WriteOp::SubClear, item).await
    }

    /// Stamp a client write and start it down the replica chain here.
    pub async fn write(self: &Arc<Self>, op: WriteOp, mut item: Item) -> Result<(), StoreError> {
        item.ttl = self.config.redundancy;
        item.timestamp = self.clock.continuous_time();
        self.slave_write(op, item).await
    }

    /// Apply a stamped write and pass it on while replicas remain.
    pub async fn slave_write(self: &Arc<Self>, op: WriteOp, mut item: Item) -> Result<(), StoreError> {
        let applied = self.apply(op, &item);
        tracing::trace!("{} {} applied={}", op.name(), hex::encode(&item.key), applied);
        if item.ttl <= 1 {
            return Ok(());
        }
        item.ttl -= 1;
        if item.sync {
            self.forward(StoreRequest::SlaveWrite(op, item.clone()), &item.key, &item.sub_key, op.name())
                .await
        } else {
            let coordinator = self.clone();
            tokio::spawn(async move {
                let request = StoreRequest::SlaveWrite(op, item.clone());
                if let Err(e) = coordinator.forward(request, &item.key, &item.sub_key, op.name()).await {
                    tracing::warn!("failed to forward {} of {}: {}", op.name(), hex::encode(&item.key), e);
                }
            });
            Ok(())
        }
    }

    fn apply(&self, op: WriteOp, item: &Item) -> bool {
        match op {
            WriteOp::Put => self.tree.put_if_newer(&item.key, item.value.clone(), item.timestamp),
            WriteOp::Del => self.tree.fake_del_if_newer(&item.key, item.timestamp),
            WriteOp::SubPut => self
                .tree
                .sub_put_if_newer(&item.key, &item.sub_key, item.value.clone(), item.timestamp),
            WriteOp::SubDel => self
                .tree
                .sub_fake_del_if_newer(&item.key, &item.sub_key, item.timestamp),
            WriteOp::SubClear => self.tree.sub_clear(&item.key, item.timestamp) > 0,
        }
    }

    /// Send `request` to our successor, dropping successors that cannot be
    /// reached until one answers or the attempts run out.
    async fn forward(&self, request: StoreRequest, key: &[u8], sub_key: &[u8], kind: &'static str) -> Result<(), StoreError> {
        let mut backoff = self.config.retry_backoff;
        for attempt in 1..=self.config.max_route_attempts {
            let me = self.membership.me();
            let successor = self.membership.successor();
            if successor.addr == me.addr {
                return Ok(());
            }
            self.emit(CoordinatorEvent::Comm(Comm {
                source: me,
                destination: successor.clone(),
                key: key.to_vec(),
                sub_key: sub_key.to_vec(),
                kind,
            }));
            match self
                .transport
                .call(&successor.addr, Request::Store(request.clone()))
                .await
                .and_then(Response::into_ack)
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transport() => self.membership.drop_unreachable(&successor, &e),
                Err(e) => return Err(e),
            }
            if attempt < self.config.max_route_attempts {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        Err(StoreError::NoReachableMember {
            key: hex::encode(key),
            attempts: self.config.max_route_attempts,
        })
    }

    /// Drop everything held locally. Not replicated.
    pub fn clear(&self) -> usize {
        self.tree.clear(self.clock.continuous_time())
    }

    // ==================== Configuration ====================

    pub async fn add_configuration(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.configure(ConfItem {
            tree_key: None,
            key: key.to_string(),
            value: value.to_string(),
            ..Default::default()
        })
        .await
    }

    pub async fn sub_add_configuration(&self, tree_key: &[u8], key: &str, value: &str) -> Result<(), StoreError> {
        self.configure(ConfItem {
            tree_key: Some(tree_key.to_vec()),
            key: key.to_string(),
            value: value.to_string(),
            ..Default::default()
        })
        .await
    }

    /// Stamp a configuration change and start it down the replica chain.
    pub async fn configure(&self, mut conf: ConfItem) -> Result<(), StoreError> {
        conf.ttl = self.config.redundancy;
        conf.timestamp = self.clock.continuous_time();
        self.slave_configure(conf).await
    }

    /// Apply a stamped configuration change; forward it only if it changed
    /// anything here.
    pub async fn slave_configure(&self, mut conf: ConfItem) -> Result<(), StoreError> {
        let applied = match &conf.tree_key {
            None => self.tree.add_configuration(conf.timestamp, &conf.key, &conf.value),
            Some(tree_key) => self
                .tree
                .sub_add_configuration(tree_key, conf.timestamp, &conf.key, &conf.value),
        };
        if !applied || conf.ttl <= 1 {
            return Ok(());
        }
        conf.ttl -= 1;
        let key = conf.tree_key.clone().unwrap_or_default();
        self.forward(StoreRequest::SlaveAddConfiguration(conf), &key, &[], "configure")
            .await
    }

    pub fn configuration(&self) -> Configuration {
        self.tree.configuration()
    }

    pub fn sub_configuration(&self, key: &[u8]) -> Configuration {
        self.tree.sub_configuration(key)
    }

    // ==================== Reads ====================

    /// Run `f` on the top-level trie or on the sub-trie at `tree_key`. A
    /// missing sub-trie reads as empty.
    fn scan<R: Default>(&self, tree_key: Option<&[u8]>, f: impl FnOnce(&Trie) -> R) -> R {
        match tree_key {
            None => self.tree.read(f),
            Some(key) => self.tree.read_sub(key, f).unwrap_or_default(),
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<Item> {
        self.tree
            .get(key)
            .map(|(value, timestamp)| Item::found(key, &value, timestamp))
    }

    pub fn sub_get(&self, key: &[u8], sub_key: &[u8]) -> Option<Item> {
        self.tree.sub_get(key, sub_key).map(|(value, timestamp)| Item {
            sub_key: sub_key.to_vec(),
            ..Item::found(key, &value, timestamp)
        })
    }

    pub fn next(&self, key: &[u8]) -> Option<Item> {
        self.scan(None, |trie| trie.next(key)).map(entry_item)
    }

    pub fn prev(&self, key: &[u8]) -> Option<Item> {
        self.scan(None, |trie| trie.prev(key)).map(entry_item)
    }

    pub fn sub_next(&self, key: &[u8], sub_key: &[u8]) -> Option<Item> {
        self.scan(Some(key), |trie| trie.next(sub_key)).map(entry_item)
    }

    pub fn sub_prev(&self, key: &[u8], sub_key: &[u8]) -> Option<Item> {
        self.scan(Some(key), |trie| trie.prev(sub_key)).map(entry_item)
    }

    pub fn first(&self, tree_key: Option<&[u8]>) -> Option<Item> {
        self.scan(tree_key, Trie::first).map(entry_item)
    }

    pub fn last(&self, tree_key: Option<&[u8]>) -> Option<Item> {
        self.scan(tree_key, Trie::last).map(entry_item)
    }

    /// Smallest value and the key holding it, as `key: value, value: key`.
    pub fn mirror_first(&self, tree_key: Option<&[u8]>) -> Option<Item> {
        self.scan(tree_key, Trie::mirror_first).map(entry_item)
    }

    pub fn mirror_last(&self, tree_key: Option<&[u8]>) -> Option<Item> {
        self.scan(tree_key, Trie::mirror_last).map(entry_item)
    }

    pub fn index_of(&self, tree_key: Option<&[u8]>, key: &[u8]) -> (usize, bool) {
        self.scan(tree_key, |trie| trie.index_of(key))
    }

    pub fn reverse_index_of(&self, tree_key: Option<&[u8]>, key: &[u8]) -> (usize, bool) {
        self.scan(tree_key, |trie| trie.reverse_index_of(key))
    }

    pub fn mirror_index_of(&self, tree_key: Option<&[u8]>, value: &[u8]) -> (usize, bool) {
        self.scan(tree_key, |trie| trie.mirror_index_of(value))
    }

    pub fn mirror_reverse_index_of(&self, tree_key: Option<&[u8]>, value: &[u8]) -> (usize, bool) {
        self.scan(tree_key, |trie| trie.mirror_reverse_index_of(value))
    }

    pub fn next_index(&self, tree_key: Option<&[u8]>, index: usize) -> Option<Item> {
        self.scan(tree_key, |trie| trie.next_index(index))
            .map(|entry| entry_item(entry).indexed(index + 1))
    }

    pub fn prev_index(&self, tree_key: Option<&[u8]>, index: usize) -> Option<Item> {
        let previous = index.checked_sub(1)?;
        self.scan(tree_key, |trie| trie.prev_index(index))
            .map(|entry| entry_item(entry).indexed(previous))
    }

    pub fn slice(&self, range: &Range) -> Vec<Item> {
        let bounds = range_bounds(range);
        self.collect(range, |trie, push| trie.each_between(&bounds, push))
    }

    pub fn reverse_slice(&self, range: &Range) -> Vec<Item> {
        let bounds = range_bounds(range);
        self.collect(range, |trie, push| trie.reverse_each_between(&bounds, push))
    }

    /// At most `range.len` items from `range.min` upwards; `range.max` is
    /// ignored.
    pub fn slice_len(&self, range: &Range) -> Result<Vec<Item>, StoreError> {
        let bounds = Bounds::new(range.min.as_deref(), None, range.min_inclusive, false);
        self.collect_len(range, |trie, push| trie.each_between(&bounds, push))
    }

    /// At most `range.len` items from `range.max` downwards; `range.min` is
    /// ignored.
    pub fn reverse_slice_len(&self, range: &Range) -> Result<Vec<Item>, StoreError> {
        let bounds = Bounds::new(None, range.max.as_deref(), false, range.max_inclusive);
        self.collect_len(range, |trie, push| trie.reverse_each_between(&bounds, push))
    }

    pub fn slice_index(&self, range: &Range) -> Vec<Item> {
        self.collect_indexed(range, |trie, push| {
            trie.each_between_index(range.min_index, range.max_index, push)
        })
    }

    pub fn reverse_slice_index(&self, range: &Range) -> Vec<Item> {
        self.collect_indexed(range, |trie, push| {
            trie.reverse_each_between_index(range.min_index, range.max_index, push)
        })
    }

    /// Items ordered by value, with each item's key and value swapped.
    pub fn mirror_slice(&self, range: &Range) -> Vec<Item> {
        let bounds = range_bounds(range);
        self.collect(range, |trie, push| trie.mirror_each_between(&bounds, push))
    }

    pub fn mirror_reverse_slice(&self, range: &Range) -> Vec<Item> {
        let bounds = range_bounds(range);
        self.collect(range, |trie, push| trie.mirror_reverse_each_between(&bounds, push))
    }

    pub fn mirror_slice_len(&self, range: &Range) -> Result<Vec<Item>, StoreError> {
        let bounds = Bounds::new(range.min.as_deref(), None, range.min_inclusive, false);
        self.collect_len(range, |trie, push| trie.mirror_each_between(&bounds, push))
    }

    pub fn mirror_reverse_slice_len(&self, range: &Range) -> Result<Vec<Item>, StoreError> {
        let bounds = Bounds::new(None, range.max.as_deref(), false, range.max_inclusive);
        self.collect_len(range, |trie, push| trie.mirror_reverse_each_between(&bounds, push))
    }

    pub fn mirror_slice_index(&self, range: &Range) -> Vec<Item> {
        self.collect_indexed(range, |trie, push| {
            trie.mirror_each_between_index(range.min_index, range.max_index, push)
        })
    }

    pub fn mirror_reverse_slice_index(&self, range: &Range) -> Vec<Item> {
        self.collect_indexed(range, |trie, push| {
            trie.mirror_reverse_each_between_index(range.min_index, range.max_index, push)
        })
    }

    /// Live entries inside `range`.
    pub fn count(&self, range: &Range) -> usize {
        let bounds = range_bounds(range);
        self.scan(range.key.as_deref(), |trie| trie.size_between(&bounds))
    }

    pub fn mirror_count(&self, range: &Range) -> usize {
        let bounds = range_bounds(range);
        self.scan(range.key.as_deref(), |trie| trie.mirror_size_between(&bounds))
    }

    fn collect(
        &self,
        range: &Range,
        scan: impl FnOnce(&Trie, &mut dyn FnMut(&[u8], &[u8], i64) -> bool),
    ) -> Vec<Item> {
        self.scan(range.key.as_deref(), |trie| {
            let mut items = Vec::new();
            scan(trie, &mut |key, value, timestamp| {
                items.push(Item::found(key, value, timestamp));
                true
            });
            items
        })
    }

    fn collect_len(
        &self,
        range: &Range,
        scan: impl FnOnce(&Trie, &mut dyn FnMut(&[u8], &[u8], i64) -> bool),
    ) -> Result<Vec<Item>, StoreError> {
        if range.len == 0 {
            return Err(StoreError::Validation("slice length must be positive".to_string()));
        }
        Ok(self.scan(range.key.as_deref(), |trie| {
            let mut items = Vec::new();
            scan(trie, &mut |key, value, timestamp| {
                items.push(Item::found(key, value, timestamp));
                items.len() < range.len
            });
            items
        }))
    }

    fn collect_indexed(
        &self,
        range: &Range,
        scan: impl FnOnce(&Trie, &mut dyn FnMut(&[u8], &[u8], i64, usize) -> bool),
    ) -> Vec<Item> {
        self.scan(range.key.as_deref(), |trie| {
            let mut items = Vec::new();
            scan(trie, &mut |key, value, timestamp, index| {
                items.push(Item::found(key, value, timestamp).indexed(index));
                true
            });
            items
        })
    }

    // ==================== Ownership ====================

    /// Live entries in the range this node is primary owner of.
    pub fn size(&self) -> usize {
        self.ring_share(Trie::size_between, Trie::size)
    }

    pub fn sub_size(&self, key: &[u8]) -> usize {
        self.tree.sub_size(key)
    }

    /// Entries, tombstones included, in the range this node is primary
    /// owner of: `[predecessor, self)`.
    pub fn owned(&self) -> usize {
        self.ring_share(Trie::real_size_between, Trie::real_size)
    }

    fn ring_share(&self, between: fn(&Trie, &Bounds) -> usize, total: fn(&Trie) -> usize) -> usize {
        let me = self.membership.me();
        let predecessor = self.membership.predecessor();
        self.tree.read(|trie| match predecessor.pos.cmp(&me.pos) {
            CmpOrdering::Less => between(trie, &Bounds::new(Some(predecessor.pos.as_slice()), Some(me.pos.as_slice()), true, false)),
            CmpOrdering::Greater => {
                between(trie, &Bounds::new(Some(predecessor.pos.as_slice()), None, true, false))
                    + between(trie, &Bounds::new(None, Some(me.pos.as_slice()), true, false))
            }
            CmpOrdering::Equal if predecessor < me => 0,
            CmpOrdering::Equal => total(trie),
        })
    }

    /// The `redundancy` members holding replicas of `key`, primary first.
    pub async fn owners(&self, key: &[u8]) -> Result<Vec<Remote>, StoreError> {
        let wanted = self.membership.ring().redundancy(self.config.redundancy);
        let mut owners = vec![self.membership.get_successor_for(key).await?];
        while owners.len() < wanted {
            let next = owners
                .last()
                .map(|owner| self.membership.successor_for_remote(owner))
                .unwrap_or_else(|| self.membership.me());
            if owners.iter().any(|owner| owner.addr == next.addr) {
                break;
            }
            owners.push(next);
        }
        Ok(owners)
    }

    pub fn description(&self) -> NodeDescription {
        NodeDescription {
            addr: self.addr(),
            pos: hex::encode(self.position()),
            last_reroute: self.activity.last_reroute.load(Ordering::SeqCst),
            last_sync: self.activity.last_sync.load(Ordering::SeqCst),
            last_migrate: self.activity.last_migrate.load(Ordering::SeqCst),
            owned_entries: self.owned(),
            held_entries: self.tree.real_size(),
            nodes: self.nodes(),
        }
    }

    pub fn describe(&self) -> String {
        self.description().describe()
    }

    pub fn describe_tree(&self) -> String {
        self.tree.describe()
    }

    fn remote_tree(&self, destination: Remote) -> RemoteHashTree {
        RemoteHashTree::new(
            self.transport.clone(),
            self.membership.me(),
            destination,
            self.events.clone(),
        )
    }

    // ==================== Background Rounds ====================

    /// Reconcile our primary range with each of the next replicas.
    #[tracing::instrument(level = "debug", skip(self), fields(node = %self.config.node_id))]
    pub async fn sync_once(&self) -> Result<(), StoreError> {
        let me = self.membership.me();
        let replicas = self.membership.ring().redundancy(self.config.redundancy);
        let mut next = self.membership.successor();
        for _ in 1..replicas {
            if next.addr == me.addr {
                break;
            }
            let predecessor = self.membership.predecessor();
            let remote = self.remote_tree(next.clone());
            let outcome = async {
                let pushed = AntiEntropy::new(self.tree.as_ref(), &remote)
                    .from(&predecessor.pos)
                    .to(&me.pos)
                    .run()
                    .await?;
                let pulled = AntiEntropy::new(&remote, self.tree.as_ref())
                    .from(&predecessor.pos)
                    .to(&me.pos)
                    .run()
                    .await?;
                Ok::<_, StoreError>((pushed, pulled))
            }
            .await;
            match outcome {
                Ok((pushed, pulled)) => {
                    if pushed.moved() || pulled.moved() {
                        self.activity.last_sync.store(wall_nanos(), Ordering::SeqCst);
                        tracing::debug!(
                            "synced with {}: pushed={} pulled={}",
                            next,
                            pushed.put_count,
                            pulled.put_count
                        );
                        self.emit(CoordinatorEvent::Sync {
                            source: me.clone(),
                            destination: next.clone(),
                            pulled: pulled.put_count,
                            pushed: pushed.put_count,
                        });
                    }
                }
                Err(e) => {
                    if e.is_transport() {
                        self.membership.drop_unreachable(&next, &e);
                    }
                    return Err(e);
                }
            }
            next = self.membership.successor_for_remote(&next);
        }
        Ok(())
    }

    /// Hand the first key past our position to its owners if we are not one
    /// of them, deleting it here once the last owner has it.
    #[tracing::instrument(level = "debug", skip(self), fields(node = %self.config.node_id))]
    pub async fn clean_once(&self) -> Result<(), StoreError> {
        let me = self.membership.me();
        let Some(next_key) = self
            .tree
            .read(|trie| trie.next_marker(&me.pos).or_else(|| trie.next_marker_index(0)))
        else {
            return Ok(());
        };
        let owners = self.owners(&next_key).await?;
        if owners.iter().any(|owner| owner.addr == me.addr) {
            return Ok(());
        }
        let primary = owners[0].pos.clone();
        let last = owners.len() - 1;
        for (index, owner) in owners.into_iter().enumerate() {
            let remote = self.remote_tree(owner.clone());
            let mut sync = AntiEntropy::new(self.tree.as_ref(), &remote).from(&next_key).to(&primary);
            if index == last {
                sync = sync.destroy();
            }
            match sync.run().await {
                Ok(report) => {
                    if report.moved() {
                        tracing::debug!(
                            "cleaned towards {}: pushed={} cleaned={}",
                            owner,
                            report.put_count,
                            report.del_count
                        );
                        self.emit(CoordinatorEvent::Clean {
                            source: me.clone(),
                            destination: owner,
                            cleaned: report.del_count,
                            pushed: report.put_count,
                        });
                    }
                }
                Err(e) => {
                    if e.is_transport() {
                        self.membership.drop_unreachable(&owner, &e);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Move our position back if we own far more than our successor.
    /// Returns whether we moved.
    #[tracing::instrument(level = "debug", skip(self), fields(node = %self.config.node_id))]
    pub async fn migrate_once(&self) -> Result<bool, StoreError> {
        let quiet_window = self.config.sync_interval * self.config.migrate_wait_factor;
        let last_allowed_change = wall_nanos() - quiet_window.as_nanos() as i64;
        if last_allowed_change <= self.activity.latest() {
            return Ok(false);
        }

        let me = self.membership.me();
        let successor = self.membership.successor();
        if successor.addr == me.addr {
            return Ok(false);
        }
        let successor_owned = match self
            .transport
            .call(&successor.addr, Request::Store(StoreRequest::Owned))
            .await
            .and_then(Response::into_count)
        {
            Ok(owned) => owned,
            Err(e) => {
                if e.is_transport() {
                    self.membership.drop_unreachable(&successor, &e);
                }
                return Err(e);
            }
        };

        let my_owned = self.owned();
        if my_owned <= self.config.migrate_floor
            || my_owned as f64 <= successor_owned as f64 * self.config.migrate_hysteresis
        {
            return Ok(false);
        }
        let delta = (my_owned - successor_owned) / 2;
        let predecessor = self.membership.predecessor();
        let wanted = self.tree.read(|trie| {
            let before_me = trie.real_size_between(&Bounds::new(None, Some(me.pos.as_slice()), true, false));
            let index = if predecessor.pos <= me.pos || before_me > delta {
                before_me.saturating_sub(delta)
            } else {
                (trie.real_size() + before_me).saturating_sub(delta)
            };
            trie.next_marker_index(index)
        });
        let Some(wanted) = wanted else {
            return Ok(false);
        };
        if !between_ie(&wanted, &predecessor.pos, &me.pos) {
            return Ok(false);
        }
        self.change_position(wanted);
        Ok(true)
    }

    /// Move to `position`, padded to the ring's position width.
    pub fn change_position(&self, mut position: Vec<u8>) {
        if position.len() < POSITION_SIZE {
            position.resize(POSITION_SIZE, 0);
        }
        let old = self.membership.position();
        if old == position {
            return;
        }
        self.membership.set_position(position.clone());
        self.activity.last_migrate.store(wall_nanos(), Ordering::SeqCst);
        tracing::info!(
            "{} migrated from {} to {}",
            self.config.node_id,
            hex::encode(&old),
            hex::encode(&position)
        );
        self.emit(CoordinatorEvent::Migrate { from: old, to: position });
    }
}

fn entry_item(entry: Entry) -> Item {
    Item::found(&entry.key, &entry.value, entry.timestamp)
}

fn range_bounds(range: &Range) -> Bounds {
    Bounds::new(
        range.min.as_deref(),
        range.max.as_deref(),
        range.min_inclusive,
        range.max_inclusive,
    )
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::infrastructure::clock::ManualClock;
    use crate::trie::{MIRRORED, YES};
    use tempfile::TempDir;

    fn node() -> Arc<Coordinator> {
        let config = ReplicationConfig::new("test").listen_addr("127.0.0.1:0".parse().unwrap());
        Coordinator::bind(config, Arc::new(ManualClock::new())).unwrap()
    }

    fn keys(items: &[Item]) -> Vec<Vec<u8>> {
        items.iter().map(|item| item.key.clone()).collect()
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = ReplicationConfig::default().listen_addr("127.0.0.1:0".parse().unwrap());
        assert!(Coordinator::bind(config, Arc::new(ManualClock::new())).is_err());
    }

    #[tokio::test]
    async fn test_put_get_del_alone() {
        let node = node();
        node.put(Item::new("apple", "red")).await.unwrap();
        let item = node.get(b"apple").unwrap();
        assert_eq!(item.value, b"red");
        assert!(item.exists);
        assert!(item.timestamp > 0);

        node.del(Item::new("apple", "")).await.unwrap();
        assert!(node.get(b"apple").is_none());
        node.stop();
    }

    #[tokio::test]
    async fn test_later_write_wins() {
        let node = node();
        node.put(Item::new("k", "v1")).await.unwrap();
        node.put(Item::new("k", "v2")).await.unwrap();
        assert_eq!(node.get(b"k").unwrap().value, b"v2");

        let stale = Item {
            timestamp: 1,
            ttl: 1,
            ..Item::new("k", "stale")
        };
        node.slave_write(WriteOp::Put, stale).await.unwrap();
        assert_eq!(node.get(b"k").unwrap().value, b"v2");
        node.stop();
    }

    #[tokio::test]
    async fn test_sub_writes_and_reads() {
        let node = node();
        for (sub_key, value) in [("a", "1"), ("b", "2"), ("c", "3")] {
            node.sub_put(Item::sub("tree", sub_key, value)).await.unwrap();
        }
        assert_eq!(node.sub_get(b"tree", b"b").unwrap().value, b"2");
        assert_eq!(node.sub_size(b"tree"), 3);
        assert_eq!(node.sub_next(b"tree", b"a").unwrap().key, b"b");
        assert_eq!(node.sub_prev(b"tree", b"c").unwrap().key, b"b");
        assert_eq!(node.first(Some(b"tree")).unwrap().key, b"a");
        assert_eq!(node.last(Some(b"tree")).unwrap().key, b"c");
        assert_eq!(node.index_of(Some(b"tree"), b"c"), (2, true));

        node.sub_del(Item::sub("tree", "b", "")).await.unwrap();
        assert!(node.sub_get(b"tree", b"b").is_none());
        assert_eq!(node.sub_size(b"tree"), 2);

        node.sub_clear(Item::sub("tree", "", "")).await.unwrap();
        assert_eq!(node.sub_size(b"tree"), 0);
        node.stop();
    }

    #[tokio::test]
    async fn test_slices() {
        let node = node();
        for key in ["a", "b", "c", "d", "e"] {
            node.put(Item::new(key, key.to_uppercase())).await.unwrap();
        }
        let range = Range::default().min("b", true).max("d", true);
        assert_eq!(keys(&node.slice(&range)), vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
        assert_eq!(keys(&node.reverse_slice(&range)), vec![b"d".to_vec(), b"c".to_vec(), b"b".to_vec()]);
        assert_eq!(node.count(&range), 3);

        let range = Range::default().min("b", false).len(2);
        assert_eq!(keys(&node.slice_len(&range).unwrap()), vec![b"c".to_vec(), b"d".to_vec()]);
        let range = Range::default().max("b", true).len(5);
        assert_eq!(keys(&node.reverse_slice_len(&range).unwrap()), vec![b"b".to_vec(), b"a".to_vec()]);

        let range = Range::default().indices(Some(1), Some(2));
        let items = node.slice_index(&range);
        assert_eq!(keys(&items), vec![b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(items[1].index, 2);

        assert_eq!(node.next_index(None, 0).unwrap().key, b"b");
        assert_eq!(node.prev_index(None, 2).unwrap().key, b"b");
        assert!(node.prev_index(None, 0).is_none());
        node.stop();
    }

    #[tokio::test]
    async fn test_zero_length_slice_is_rejected() {
        let node = node();
        let err = node.slice_len(&Range::default()).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        node.stop();
    }

    #[tokio::test]
    async fn test_mirror_slice_orders_by_value() {
        let node = node();
        node.sub_add_configuration(b"mirrored", MIRRORED, YES).await.unwrap();
        for i in 1..=8u8 {
            node.sub_put(Item::sub("mirrored", vec![i], vec![9 - i])).await.unwrap();
        }
        let range = Range::sub("mirrored").min(vec![2], true).max(vec![5], true);
        let items = node.mirror_slice(&range);
        assert_eq!(keys(&items), vec![vec![2], vec![3], vec![4], vec![5]]);
        let values: Vec<Vec<u8>> = items.iter().map(|item| item.value.clone()).collect();
        assert_eq!(values, vec![vec![7], vec![6], vec![5], vec![4]]);
        assert_eq!(node.mirror_count(&range), 4);
        assert_eq!(node.mirror_first(Some(b"mirrored")).unwrap().key, vec![1]);
        assert_eq!(node.mirror_last(Some(b"mirrored")).unwrap().value, vec![1]);
        node.stop();
    }

    #[tokio::test]
    async fn test_configuration_applies_locally() {
        let node = node();
        node.add_configuration("colour", "blue").await.unwrap();
        assert_eq!(node.configuration().data.get("colour").map(String::as_str), Some("blue"));
        node.sub_add_configuration(b"tree", "shape", "round").await.unwrap();
        assert_eq!(
            node.sub_configuration(b"tree").data.get("shape").map(String::as_str),
            Some("round")
        );
        node.stop();
    }

    #[tokio::test]
    async fn test_alone_owns_everything() {
        let node = node();
        for i in 0..20u8 {
            node.put(Item::new(vec![i], vec![i])).await.unwrap();
        }
        assert_eq!(node.owned(), 20);
        assert_eq!(node.size(), 20);
        let owners = node.owners(b"anything").await.unwrap();
        assert_eq!(owners, vec![node.membership().me()]);
        assert!(!node.migrate_once().await.unwrap());
        node.sync_once().await.unwrap();
        node.clean_once().await.unwrap();
        assert_eq!(node.owned(), 20);
        node.stop();
    }

    #[tokio::test]
    async fn test_change_position_pads_and_emits() {
        let node = node();
        let mut events = node.subscribe();
        node.change_position(vec![0x80]);
        let mut expected = vec![0x80];
        expected.resize(POSITION_SIZE, 0);
        assert_eq!(node.position(), expected);
        match events.recv().await.unwrap() {
            CoordinatorEvent::Migrate { to, .. } => assert_eq!(to, expected),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(node.description().last_migrate > 0);
        node.stop();
    }

    #[tokio::test]
    async fn test_membership_traffic_is_published() {
        let first = node();
        let second = node();
        second.join(&first.addr()).await.unwrap();
        assert_eq!(first.nodes().len(), 2);
        let mut events = second.subscribe();

        second.membership().notify_successor().await;
        second.membership().ping_predecessor().await;

        let mut kinds = Vec::new();
        for _ in 0..2 {
            match events.recv().await.unwrap() {
                CoordinatorEvent::Comm(comm) => {
                    assert_eq!(comm.source, second.membership().me());
                    assert_eq!(comm.destination.addr, first.addr());
                    kinds.push(comm.kind);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(kinds, vec!["notify", "ping"]);
        first.stop();
        second.stop();
    }

    #[tokio::test]
    async fn test_operation_log_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        let config = ReplicationConfig::new("persistent")
            .listen_addr("127.0.0.1:0".parse().unwrap())
            .log_path(&path);

        let node = Coordinator::bind(config.clone(), Arc::new(ManualClock::new())).unwrap();
        node.put(Item::new("kept", "yes")).await.unwrap();
        node.sub_put(Item::sub("tree", "inner", "value")).await.unwrap();
        node.stop();
        drop(node);

        let node = Coordinator::bind(config, Arc::new(ManualClock::new())).unwrap();
        assert_eq!(node.get(b"kept").unwrap().value, b"yes");
        assert_eq!(node.sub_get(b"tree", b"inner").unwrap().value, b"value");
        node.stop();
    }

    #[tokio::test]
    async fn test_description_reports_counts() {
        let node = node();
        node.put(Item::new("a", "1")).await.unwrap();
        node.del(Item::new("a", "")).await.unwrap();
        let description = node.description();
        assert_eq!(description.held_entries, 1);
        assert_eq!(description.owned_entries, 1);
        assert_eq!(description.nodes.len(), 1);
        assert!(node.describe().contains(&description.pos));
        node.stop();
    }
}

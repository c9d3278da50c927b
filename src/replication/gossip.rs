//! Membership Protocol
//!
//! Keeps this node's [`Ring`] consistent with its peers. Every member knows
//! every other member, so routing a key takes a constant number of calls in
//! a stable ring.
//!
//! ## How It Works
//!
//! 1. **Join**: fetch a seed's member list, take the middle of its largest
//!    gap if this node has no position yet, then notify the seed
//! 2. **Notify**: periodically tell the successor about this node and learn
//!    the successor's predecessor
//! 3. **Ping**: periodically send the predecessor this node's ring hash; a
//!    predecessor whose hash differs pulls the full list and prunes stale
//!    members between itself and its own predecessor
//! 4. **Failure**: any member that cannot be reached is dropped at once
//!
//! Ring mutations that belong to one protocol step happen under a single
//! route lock, which is never held across a remote call.

use crate::replication::config::ReplicationConfig;
use crate::replication::ring::{between_ie, Ring};
use crate::replication::transport::Transport;
use crate::replication::types::{
    Comm, CoordinatorEvent, MembershipRequest, PingPack, Remote, Request, Response, StoreError, POSITION_SIZE,
};
use crate::trie::Digest;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const CREATED: u8 = 0;
const STARTED: u8 = 1;
const STOPPED: u8 = 2;

/// One member's view of, and participation in, the ring.
pub struct Membership {
    me: RwLock<Remote>,
    ring: Ring,
    transport: Arc<Transport>,
    state: AtomicU8,
    route_lock: Mutex<()>,
    ping_interval: Duration,
    max_route_attempts: usize,
    retry_backoff: Duration,
    events: broadcast::Sender<CoordinatorEvent>,
}

impl Membership {
    /// A member reachable at `addr` with no position yet.
    pub fn new(addr: impl Into<String>, transport: Arc<Transport>, config: &ReplicationConfig) -> Self {
        let me = Remote::new(vec![0; POSITION_SIZE], addr);
        let ring = Ring::new();
        ring.add(me.clone());
        Self {
            me: RwLock::new(me),
            ring,
            transport,
            state: AtomicU8::new(CREATED),
            route_lock: Mutex::new(()),
            ping_interval: config.ping_interval,
            max_route_attempts: config.max_route_attempts,
            retry_backoff: config.retry_backoff,
            events: broadcast::channel(64).0,
        }
    }

    /// Publish notify and ping traffic on `events` instead of a private channel.
    pub fn with_events(mut self, events: broadcast::Sender<CoordinatorEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    fn comm(&self, source: Remote, destination: &Remote, kind: &'static str) {
        let _ = self.events.send(CoordinatorEvent::Comm(Comm {
            source,
            destination: destination.clone(),
            key: Vec::new(),
            sub_key: Vec::new(),
            kind,
        }));
    }

    pub fn me(&self) -> Remote {
        self.me.read().clone()
    }

    pub fn position(&self) -> Vec<u8> {
        self.me.read().pos.clone()
    }

    pub fn addr(&self) -> String {
        self.me.read().addr.clone()
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Move this node to `position` and reflect it in the ring.
    pub fn set_position(&self, position: Vec<u8>) {
        let me = {
            let mut me = self.me.write();
            me.pos = position;
            me.clone()
        };
        let _guard = self.route_lock.lock();
        self.ring.add(me);
    }

    pub fn describe(&self) -> String {
        format!("{}\n{}", self.me(), self.ring.describe())
    }

    pub fn is_started(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STARTED
    }

    /// Start the notify and ping loops. A member starts once.
    pub fn start(self: &Arc<Self>) -> Result<(), StoreError> {
        self.state
            .compare_exchange(CREATED, STARTED, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| StoreError::State(format!("{} can only be started when created", self.me())))?;
        self.ring.add(self.me());

        let membership = self.clone();
        tokio::spawn(async move {
            while membership.is_started() {
                membership.notify_successor().await;
                tokio::time::sleep(membership.ping_interval).await;
            }
        });

        let membership = self.clone();
        tokio::spawn(async move {
            while membership.is_started() {
                membership.ping_predecessor().await;
                tokio::time::sleep(membership.ping_interval).await;
            }
        });

        tracing::info!("membership started as {}", self.me());
        Ok(())
    }

    /// Stop for good. Loops finish their current round.
    pub fn stop(&self) {
        if self
            .state
            .compare_exchange(STARTED, STOPPED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::info!("membership stopped for {}", self.me());
        }
    }

    async fn call(&self, remote: &Remote, request: MembershipRequest) -> Result<Response, StoreError> {
        self.transport.call(&remote.addr, Request::Membership(request)).await
    }

    /// Enter the ring known by the member at `seed`.
    #[tracing::instrument(skip(self))]
    pub async fn join(&self, seed: &str) -> Result<(), StoreError> {
        let nodes = self
            .transport
            .call(seed, Request::Membership(MembershipRequest::Nodes))
            .await?
            .into_remotes()?;
        if self.position().iter().all(|byte| *byte == 0) {
            self.set_position(Ring::with_nodes(nodes.clone()).get_slot());
        }
        let me = self.me();
        {
            let _guard = self.route_lock.lock();
            self.ring.set_nodes(nodes);
            self.ring.add(me.clone());
        }
        self.transport
            .call(seed, Request::Membership(MembershipRequest::Notify(me.clone())))
            .await?
            .into_remote()?;
        tracing::info!("{} joined ring via {}", me, seed);
        Ok(())
    }

    /// Remove `remote` from the ring. This node never removes itself.
    pub fn remove_node(&self, remote: &Remote) -> Result<(), StoreError> {
        if remote.addr == self.addr() {
            return Err(StoreError::State(format!(
                "{} is trying to remove itself from the ring",
                remote
            )));
        }
        let _guard = self.route_lock.lock();
        self.ring.remove(remote)
    }

    /// Drop a member a call to which just failed.
    pub(crate) fn drop_unreachable(&self, remote: &Remote, error: &StoreError) {
        tracing::warn!("dropping unreachable member {}: {}", remote, error);
        if let Err(e) = self.remove_node(remote) {
            tracing::warn!("could not drop {}: {}", remote, e);
        }
    }

    // ==================== Periodic Steps ====================

    /// Tell the successor about this node and adopt its predecessor.
    pub async fn notify_successor(&self) {
        let me = self.me();
        let Some(successor) = self.ring.successor(&me) else {
            return;
        };
        if successor.addr == me.addr {
            return;
        }
        self.comm(me.clone(), &successor, "notify");
        match self
            .call(&successor, MembershipRequest::Notify(me.clone()))
            .await
            .and_then(Response::into_remote)
        {
            Ok(predecessor) => {
                if predecessor.addr != me.addr {
                    let _guard = self.route_lock.lock();
                    self.ring.add(predecessor);
                }
            }
            Err(e) => self.drop_unreachable(&successor, &e),
        }
    }

    /// Offer the predecessor this node's ring hash.
    pub async fn ping_predecessor(&self) {
        let me = self.me();
        let Some(predecessor) = self.ring.predecessor(&me) else {
            return;
        };
        if predecessor.addr == me.addr {
            return;
        }
        self.comm(me.clone(), &predecessor, "ping");
        let pack = PingPack {
            caller: me,
            ring_hash: self.ring.hash(),
        };
        match self
            .call(&predecessor, MembershipRequest::Ping(pack))
            .await
            .and_then(Response::into_remote)
        {
            Ok(current) => {
                let _guard = self.route_lock.lock();
                self.ring.add(current);
            }
            Err(e) => self.drop_unreachable(&predecessor, &e),
        }
    }

    // ==================== Request Handlers ====================

    pub fn nodes(&self) -> Vec<Remote> {
        self.ring.nodes()
    }

    pub fn ring_hash(&self) -> Digest {
        self.ring.hash()
    }

    /// Our predecessor on the ring, ourselves when alone.
    pub fn predecessor(&self) -> Remote {
        let me = self.me();
        self.ring.predecessor(&me).unwrap_or(me)
    }

    /// Our successor on the ring, ourselves when alone.
    pub fn successor(&self) -> Remote {
        let me = self.me();
        self.ring.successor(&me).unwrap_or(me)
    }

    /// The member after `remote` in the local ring.
    pub fn successor_for_remote(&self, remote: &Remote) -> Remote {
        self.ring.successor(remote).unwrap_or_else(|| self.me())
    }

    /// Add `caller` to the ring and answer with our predecessor.
    pub fn notify(&self, caller: Remote) -> Remote {
        let _guard = self.route_lock.lock();
        self.ring.add(caller);
        self.predecessor()
    }

    /// Pull the caller's member list if our ring differs from theirs.
    pub async fn ping(&self, pack: PingPack) -> Remote {
        let me = self.me();
        if pack.ring_hash == self.ring.hash() {
            return me;
        }
        match self
            .call(&pack.caller, MembershipRequest::Nodes)
            .await
            .and_then(Response::into_remotes)
        {
            Ok(nodes) => {
                let _guard = self.route_lock.lock();
                let predecessor = self.ring.predecessor(&me);
                self.ring.set_nodes(nodes);
                self.ring.add(me.clone());
                if let Some(predecessor) = predecessor {
                    self.ring.add(predecessor.clone());
                    self.ring.clean(&predecessor, &me);
                }
            }
            Err(e) => self.drop_unreachable(&pack.caller, &e),
        }
        me
    }

    // ==================== Routing ====================

    /// The member responsible for `key`: the first member after it.
    ///
    /// The cached answer is confirmed with the candidate's own predecessor,
    /// and corrected by asking that predecessor when they disagree.
    /// Unreachable members are dropped and the lookup retried with doubling
    /// backoff until `max_route_attempts` is spent.
    #[tracing::instrument(level = "debug", skip(self, key), fields(key = %hex::encode(key)))]
    pub async fn get_successor_for(&self, key: &[u8]) -> Result<Remote, StoreError> {
        let mut backoff = self.retry_backoff;
        for attempt in 1..=self.max_route_attempts {
            match self.try_successor_for(key).await {
                Ok(successor) => return Ok(successor),
                Err((unreachable, e)) => self.drop_unreachable(&unreachable, &e),
            }
            if attempt < self.max_route_attempts {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        Err(StoreError::NoReachableMember {
            key: hex::encode(key),
            attempts: self.max_route_attempts,
        })
    }

    async fn try_successor_for(&self, key: &[u8]) -> Result<Remote, (Remote, StoreError)> {
        let me = self.me();
        let (before, at, after) = self.ring.remotes(key);
        let (Some(guess), Some(successor)) = (at.or(before), after) else {
            return Ok(me);
        };
        if successor.addr == me.addr {
            return Ok(successor);
        }
        let predecessor = self
            .call(&successor, MembershipRequest::GetPredecessor)
            .await
            .and_then(Response::into_remote)
            .map_err(|e| (successor.clone(), e))?;
        if between_ie(key, &predecessor.pos, &successor.pos) || predecessor.addr == me.addr {
            return Ok(successor);
        }
        tracing::debug!("{} thinks {} precedes it, not {}", successor, predecessor, guess);
        self.call(&predecessor, MembershipRequest::GetSuccessorFor(key.to_vec()))
            .await
            .and_then(Response::into_remote)
            .map_err(|e| (predecessor, e))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn membership() -> Membership {
        let transport = Arc::new(Transport::bind("127.0.0.1:0".parse().unwrap()).unwrap());
        let addr = transport.local_addr().unwrap().to_string();
        Membership::new(addr, transport, &ReplicationConfig::new("test"))
    }

    #[tokio::test]
    async fn test_new_member_is_alone_at_zero() {
        let membership = membership();
        assert_eq!(membership.nodes(), vec![membership.me()]);
        assert_eq!(membership.position(), vec![0; POSITION_SIZE]);
        assert_eq!(membership.successor(), membership.me());
        assert_eq!(membership.predecessor(), membership.me());
    }

    #[tokio::test]
    async fn test_start_twice_is_state_error() {
        let membership = Arc::new(membership());
        membership.start().unwrap();
        assert!(membership.is_started());
        assert!(matches!(membership.start(), Err(StoreError::State(_))));
        membership.stop();
        assert!(!membership.is_started());
        assert!(matches!(membership.start(), Err(StoreError::State(_))));
    }

    #[tokio::test]
    async fn test_cannot_remove_self() {
        let membership = membership();
        let me = membership.me();
        assert!(matches!(membership.remove_node(&me), Err(StoreError::State(_))));
    }

    #[tokio::test]
    async fn test_set_position_moves_self_in_ring() {
        let membership = membership();
        membership.notify(Remote::new(vec![0x40; POSITION_SIZE], "other:1"));
        membership.set_position(vec![0x80; POSITION_SIZE]);
        let nodes = membership.nodes();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1], membership.me());
        assert_eq!(membership.predecessor().addr, "other:1");
    }

    #[tokio::test]
    async fn test_alone_owns_every_key() {
        let membership = membership();
        let owner = membership.get_successor_for(b"anything").await.unwrap();
        assert_eq!(owner, membership.me());
    }

    #[tokio::test]
    async fn test_notify_answers_with_predecessor() {
        let membership = membership();
        membership.set_position(vec![0x80; POSITION_SIZE]);
        let caller = Remote::new(vec![0x40; POSITION_SIZE], "other:1");
        let predecessor = membership.notify(caller.clone());
        assert_eq!(predecessor, caller);
        assert_eq!(membership.nodes().len(), 2);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_unreachable_owner_exhausts_attempts() {
        let transport = Arc::new(Transport::bind("127.0.0.1:0".parse().unwrap()).unwrap());
        let addr = transport.local_addr().unwrap().to_string();
        let config = ReplicationConfig::new("test")
            .max_route_attempts(1)
            .retry_backoff(Duration::from_millis(1));
        let membership = Membership::new(addr, transport, &config);
        membership.set_position(vec![0x10; POSITION_SIZE]);

        let dead = Transport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let dead_addr = dead.local_addr().unwrap().to_string();
        dead.close();
        drop(dead);
        membership.notify(Remote::new(vec![0x80; POSITION_SIZE], dead_addr.clone()));

        let err = membership.get_successor_for(&[0x40]).await.unwrap_err();
        assert!(matches!(err, StoreError::NoReachableMember { attempts: 1, .. }));
        assert!(membership.nodes().iter().all(|remote| remote.addr != dead_addr));
        assert!(logs_contain("dropping unreachable member"));
    }
}

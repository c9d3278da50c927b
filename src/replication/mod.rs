//! Replication Module
//!
//! Shards keys over a consistent-hash ring, keeps a fixed number of replicas
//! of each key on consecutive ring members and reconciles those replicas in
//! the background with Merkle-tree comparison instead of blocking writes on
//! a quorum.
//!
//! ## Architecture
//!
//! - **Ring**: the sorted member list every routing decision is made from
//! - **Membership**: join, notify/ping maintenance and key routing over QUIC
//! - **AntiEntropy**: fingerprint-driven reconciliation between any two
//!   [`HashTree`]s, local or remote
//! - **Transport (QUIC)**: one bidirectional stream per request, connections
//!   cached per peer
//! - **Coordinator**: write forwarding, local reads and the sync, clean and
//!   migrate loops
//! - **Server**: one thin adapter per wire capability over the coordinator
//!
//! ## How It Works
//!
//! 1. A node joins through any member and takes the middle of the largest
//!    gap in the ring
//! 2. Writes are applied where they land and forwarded down the successor
//!    chain until `redundancy` members hold them
//! 3. Every interval each node reconciles the range it owns with the next
//!    replicas, drains data it no longer owns and, when the ring is quiet,
//!    moves its position to even out load with its successor
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ring_store::replication::{Coordinator, ReplicationConfig};
//! use ring_store::infrastructure::clock::SystemClock;
//!
//! let config = ReplicationConfig::new("store-1")
//!     .listen_addr("127.0.0.1:4100".parse()?)
//!     .join_addr("127.0.0.1:4200");
//!
//! let node = Coordinator::bind(config, Arc::new(SystemClock::new()))?;
//! node.start()?;
//! node.join("127.0.0.1:4200").await?;
//! node.put(Item::new("apple", "red").synchronous()).await?;
//! ```

mod agent;
mod config;
mod gossip;
mod remote;
mod ring;
mod server;
mod sync;
mod transport;
mod types;

pub use agent::Coordinator;
pub use config::{ConfigError, ReplicationConfig};
pub use gossip::Membership;
pub use remote::RemoteHashTree;
pub use ring::{between_ie, between_ii, Ring};
pub use server::{Dispatcher, HashTreeApi, MembershipApi, StoreApi};
pub use sync::{AntiEntropy, HashTree, SubTree, SyncReport};
pub use transport::{decode_message, encode_message, RequestHandler, Transport, MAX_MESSAGE_SIZE};
pub use types::{
    Comm, ConfItem, CoordinatorEvent, HashTreeRequest, Item, MembershipRequest, NodeDescription, PingPack, Range,
    Remote, Request, Response, StoreError, StoreRequest, WriteOp, POSITION_SIZE,
};

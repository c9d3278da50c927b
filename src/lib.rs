//! ring-store Library
//!
//! A distributed, eventually consistent key-value store: nodes form a
//! consistent-hash ring, every key lives on `redundancy` consecutive members
//! and replicas are reconciled by comparing Merkle tries.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod config;
pub mod infrastructure;
pub mod replication;
pub mod trie;

// Re-export commonly used types
pub use config::load_config;
pub use infrastructure::{Clock, ManualClock, SystemClock};
pub use replication::{Coordinator, CoordinatorEvent, Item, ReplicationConfig, StoreError};
pub use trie::{Configuration, Tree};

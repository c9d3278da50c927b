//! Replication Types
//!
//! Ring members, wire messages, events and the error taxonomy shared by the
//! membership, anti-entropy and coordinator layers.

use crate::trie::{Configuration, Digest, Nibble, Print, Versioned};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Width of a ring position in bytes.
pub const POSITION_SIZE: usize = 16;

/// A ring member: where it sits and how to reach it.
///
/// Ordered by position, then by address, so members sharing a position still
/// have a defined order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Remote {
    pub pos: Vec<u8>,
    pub addr: String,
}

impl Remote {
    pub fn new(pos: impl Into<Vec<u8>>, addr: impl Into<String>) -> Self {
        Self {
            pos: pos.into(),
            addr: addr.into(),
        }
    }
}

impl Ord for Remote {
    fn cmp(&self, other: &Self) -> Ordering {
        self.pos.cmp(&other.pos).then_with(|| self.addr.cmp(&other.addr))
    }
}

impl PartialOrd for Remote {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", hex::encode(&self.pos), self.addr)
    }
}

/// Errors surfaced by the replication layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum StoreError {
    #[error("transport error talking to {addr}: {reason}")]
    Transport { addr: String, reason: String },
    #[error("no reachable member for key {key} after {attempts} attempts")]
    NoReachableMember { key: String, attempts: usize },
    #[error("illegal state: {0}")]
    State(String),
    #[error("cannot remove the last member of the ring")]
    LastMember,
    #[error("only one level of sub trees is supported")]
    NestedSubTree,
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("codec error: {0}")]
    Codec(String),
}

impl StoreError {
    pub fn transport(addr: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Transport {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the failure means the peer is unreachable, so routing may drop
    /// it and try someone else.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// One key, value or sub-key as it travels between nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub key: Vec<u8>,
    pub sub_key: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: i64,
    /// Replicas still to be written, this one included.
    pub ttl: usize,
    /// Forward to the next replica before acknowledging.
    pub sync: bool,
    pub index: usize,
    pub exists: bool,
}

impl Item {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn sub(key: impl Into<Vec<u8>>, sub_key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            sub_key: sub_key.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn synchronous(mut self) -> Self {
        self.sync = true;
        self
    }

    pub(crate) fn found(key: &[u8], value: &[u8], timestamp: i64) -> Self {
        Self {
            key: key.to_vec(),
            value: value.to_vec(),
            timestamp,
            exists: true,
            ..Default::default()
        }
    }

    pub(crate) fn indexed(mut self, index: usize) -> Self {
        self.index = index;
        self
    }
}

/// A scan over the top-level trie (`key: None`) or one sub-trie.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub key: Option<Vec<u8>>,
    pub min: Option<Vec<u8>>,
    pub max: Option<Vec<u8>>,
    pub min_inclusive: bool,
    pub max_inclusive: bool,
    pub min_index: Option<usize>,
    pub max_index: Option<usize>,
    pub len: usize,
}

impl Range {
    pub fn sub(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn min(mut self, min: impl Into<Vec<u8>>, inclusive: bool) -> Self {
        self.min = Some(min.into());
        self.min_inclusive = inclusive;
        self
    }

    pub fn max(mut self, max: impl Into<Vec<u8>>, inclusive: bool) -> Self {
        self.max = Some(max.into());
        self.max_inclusive = inclusive;
        self
    }

    pub fn indices(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.min_index = min;
        self.max_index = max;
        self
    }

    pub fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }
}

/// A configuration change travelling down the replica chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfItem {
    /// Sub-trie to configure, or the top-level trie.
    pub tree_key: Option<Vec<u8>>,
    pub key: String,
    pub value: String,
    pub timestamp: i64,
    pub ttl: usize,
}

/// Replicated write kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    Put,
    Del,
    SubPut,
    SubDel,
    SubClear,
}

impl WriteOp {
    pub fn name(self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Del => "del",
            Self::SubPut => "sub_put",
            Self::SubDel => "sub_del",
            Self::SubClear => "sub_clear",
        }
    }
}

/// Sent by a node to its predecessor along with its own view of the ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPack {
    pub caller: Remote,
    pub ring_hash: Digest,
}

/// Snapshot of a node for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDescription {
    pub addr: String,
    pub pos: String,
    pub last_reroute: i64,
    pub last_sync: i64,
    pub last_migrate: i64,
    pub owned_entries: usize,
    pub held_entries: usize,
    pub nodes: Vec<Remote>,
}

impl NodeDescription {
    pub fn describe(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("unprintable description: {}", e))
    }
}

/// One remote call made on behalf of replication or membership. Membership
/// traffic carries empty keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comm {
    pub source: Remote,
    pub destination: Remote,
    pub key: Vec<u8>,
    pub sub_key: Vec<u8>,
    pub kind: &'static str,
}

/// Background activity published to subscribers. None of it is needed for
/// correctness.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    Sync {
        source: Remote,
        destination: Remote,
        pulled: usize,
        pushed: usize,
    },
    Clean {
        source: Remote,
        destination: Remote,
        cleaned: usize,
        pushed: usize,
    },
    Migrate {
        from: Vec<u8>,
        to: Vec<u8>,
    },
    Comm(Comm),
}

// ==================== Wire Protocol ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipRequest {
    Nodes,
    Notify(Remote),
    Ping(PingPack),
    GetPredecessor,
    GetSuccessorFor(Vec<u8>),
    RingHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreRequest {
    /// Write received from a client: stamped and forwarded by the receiver.
    Write(WriteOp, Item),
    /// Write received from the previous replica.
    SlaveWrite(WriteOp, Item),
    Clear,
    AddConfiguration(ConfItem),
    SlaveAddConfiguration(ConfItem),
    Configuration,
    SubConfiguration(Vec<u8>),

    Get(Item),
    SubGet(Item),
    Next(Item),
    Prev(Item),
    SubNext(Item),
    SubPrev(Item),
    First(Option<Vec<u8>>),
    Last(Option<Vec<u8>>),
    MirrorFirst(Option<Vec<u8>>),
    MirrorLast(Option<Vec<u8>>),
    IndexOf(Option<Vec<u8>>, Vec<u8>),
    ReverseIndexOf(Option<Vec<u8>>, Vec<u8>),
    MirrorIndexOf(Option<Vec<u8>>, Vec<u8>),
    MirrorReverseIndexOf(Option<Vec<u8>>, Vec<u8>),
    NextIndex(Option<Vec<u8>>, usize),
    PrevIndex(Option<Vec<u8>>, usize),

    Slice(Range),
    ReverseSlice(Range),
    SliceIndex(Range),
    ReverseSliceIndex(Range),
    SliceLen(Range),
    ReverseSliceLen(Range),
    MirrorSlice(Range),
    MirrorReverseSlice(Range),
    MirrorSliceIndex(Range),
    MirrorReverseSliceIndex(Range),
    MirrorSliceLen(Range),
    MirrorReverseSliceLen(Range),
    Count(Range),
    MirrorCount(Range),

    Size,
    SubSize(Vec<u8>),
    Owned,
    Describe,
    DescribeTree,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashTreeRequest {
    Hash,
    Configuration,
    Configure(Configuration),
    Finger(Vec<Nibble>),
    GetTimestamp(Vec<Nibble>),
    PutTimestamp {
        key: Vec<Nibble>,
        value: Vec<u8>,
        present: bool,
        expected: i64,
        timestamp: i64,
    },
    DelTimestamp {
        key: Vec<Nibble>,
        expected: i64,
    },
    SubConfiguration(Vec<u8>),
    SubConfigure {
        key: Vec<u8>,
        configuration: Configuration,
    },
    SubFinger {
        key: Vec<Nibble>,
        sub_key: Vec<Nibble>,
    },
    SubGetTimestamp {
        key: Vec<Nibble>,
        sub_key: Vec<Nibble>,
    },
    SubPutTimestamp {
        key: Vec<Nibble>,
        sub_key: Vec<Nibble>,
        value: Vec<u8>,
        present: bool,
        expected: i64,
        timestamp: i64,
    },
    SubDelTimestamp {
        key: Vec<Nibble>,
        sub_key: Vec<Nibble>,
        expected: i64,
    },
    SubClearTimestamp {
        key: Vec<Nibble>,
        expected: i64,
        timestamp: i64,
    },
    SubKillTimestamp {
        key: Vec<Nibble>,
        expected: i64,
    },
}

/// Every message a node accepts, grouped by the capability that serves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Membership(MembershipRequest),
    Store(StoreRequest),
    HashTree(HashTreeRequest),
}

impl Request {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Membership(_) => "membership",
            Self::Store(_) => "store",
            Self::HashTree(_) => "hash_tree",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Ack,
    Remote(Remote),
    Remotes(Vec<Remote>),
    Hash(Digest),
    Item(Option<Item>),
    Items(Vec<Item>),
    Index { n: usize, existed: bool },
    Count(usize),
    Configuration(Configuration),
    Print(Print),
    Versioned(Versioned),
    Bool(bool),
    Description(NodeDescription),
    Text(String),
    Error(String),
}

impl Response {
    fn unexpected(self, wanted: &str) -> StoreError {
        match self {
            Self::Error(message) => StoreError::Remote(message),
            other => StoreError::Codec(format!("expected {} response, got {:?}", wanted, other)),
        }
    }

    pub fn into_ack(self) -> Result<(), StoreError> {
        match self {
            Self::Ack => Ok(()),
            other => Err(other.unexpected("ack")),
        }
    }

    pub fn into_remote(self) -> Result<Remote, StoreError> {
        match self {
            Self::Remote(remote) => Ok(remote),
            other => Err(other.unexpected("remote")),
        }
    }

    pub fn into_remotes(self) -> Result<Vec<Remote>, StoreError> {
        match self {
            Self::Remotes(remotes) => Ok(remotes),
            other => Err(other.unexpected("remotes")),
        }
    }

    pub fn into_hash(self) -> Result<Digest, StoreError> {
        match self {
            Self::Hash(hash) => Ok(hash),
            other => Err(other.unexpected("hash")),
        }
    }

    pub fn into_item(self) -> Result<Option<Item>, StoreError> {
        match self {
            Self::Item(item) => Ok(item),
            other => Err(other.unexpected("item")),
        }
    }

    pub fn into_items(self) -> Result<Vec<Item>, StoreError> {
        match self {
            Self::Items(items) => Ok(items),
            other => Err(other.unexpected("items")),
        }
    }

    pub fn into_index(self) -> Result<(usize, bool), StoreError> {
        match self {
            Self::Index { n, existed } => Ok((n, existed)),
            other => Err(other.unexpected("index")),
        }
    }

    pub fn into_count(self) -> Result<usize, StoreError> {
        match self {
            Self::Count(count) => Ok(count),
            other => Err(other.unexpected("count")),
        }
    }

    pub fn into_configuration(self) -> Result<Configuration, StoreError> {
        match self {
            Self::Configuration(configuration) => Ok(configuration),
            other => Err(other.unexpected("configuration")),
        }
    }

    pub fn into_print(self) -> Result<Print, StoreError> {
        match self {
            Self::Print(print) => Ok(print),
            other => Err(other.unexpected("print")),
        }
    }

    pub fn into_versioned(self) -> Result<Versioned, StoreError> {
        match self {
            Self::Versioned(versioned) => Ok(versioned),
            other => Err(other.unexpected("versioned")),
        }
    }

    pub fn into_bool(self) -> Result<bool, StoreError> {
        match self {
            Self::Bool(value) => Ok(value),
            other => Err(other.unexpected("bool")),
        }
    }

    pub fn into_description(self) -> Result<NodeDescription, StoreError> {
        match self {
            Self::Description(description) => Ok(description),
            other => Err(other.unexpected("description")),
        }
    }

    pub fn into_text(self) -> Result<String, StoreError> {
        match self {
            Self::Text(text) => Ok(text),
            other => Err(other.unexpected("text")),
        }
    }
}

impl From<Result<(), StoreError>> for Response {
    fn from(result: Result<(), StoreError>) -> Self {
        match result {
            Ok(()) => Self::Ack,
            Err(e) => Self::Error(e.to_string()),
        }
    }
}

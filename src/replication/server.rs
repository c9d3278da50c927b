//! Request Adapters
//!
//! Thin views over one shared [`Coordinator`], one per capability a node
//! exposes on the wire. The [`Dispatcher`] hands each incoming request to
//! the adapter for its category.

use crate::replication::agent::Coordinator;
use crate::replication::sync::HashTree;
use crate::replication::transport::RequestHandler;
use crate::replication::types::{HashTreeRequest, MembershipRequest, Request, Response, StoreError, StoreRequest};
use async_trait::async_trait;
use std::sync::Arc;

fn reply<T>(result: Result<T, StoreError>, wrap: impl FnOnce(T) -> Response) -> Response {
    match result {
        Ok(value) => wrap(value),
        Err(e) => Response::Error(e.to_string()),
    }
}

fn index((n, existed): (usize, bool)) -> Response {
    Response::Index { n, existed }
}

/// Ring maintenance and routing.
pub struct MembershipApi {
    coordinator: Arc<Coordinator>,
}

impl MembershipApi {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub async fn handle(&self, request: MembershipRequest) -> Response {
        let membership = self.coordinator.membership();
        match request {
            MembershipRequest::Nodes => Response::Remotes(membership.nodes()),
            MembershipRequest::Notify(caller) => Response::Remote(membership.notify(caller)),
            MembershipRequest::Ping(pack) => Response::Remote(membership.ping(pack).await),
            MembershipRequest::GetPredecessor => Response::Remote(membership.predecessor()),
            MembershipRequest::GetSuccessorFor(key) => {
                reply(membership.get_successor_for(&key).await, Response::Remote)
            }
            MembershipRequest::RingHash => Response::Hash(membership.ring_hash()),
        }
    }
}

/// Client reads and writes, and replica forwarding.
pub struct StoreApi {
    coordinator: Arc<Coordinator>,
}

impl StoreApi {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub async fn handle(&self, request: StoreRequest) -> Response {
        let node = &self.coordinator;
        match request {
            StoreRequest::Write(op, item) => node.write(op, item).await.into(),
            StoreRequest::SlaveWrite(op, item) => node.slave_write(op, item).await.into(),
            StoreRequest::Clear => Response::Count(node.clear()),
            StoreRequest::AddConfiguration(conf) => node.configure(conf).await.into(),
            StoreRequest::SlaveAddConfiguration(conf) => node.slave_configure(conf).await.into(),
            StoreRequest::Configuration => Response::Configuration(node.configuration()),
            StoreRequest::SubConfiguration(key) => Response::Configuration(node.sub_configuration(&key)),

            StoreRequest::Get(item) => Response::Item(node.get(&item.key)),
            StoreRequest::SubGet(item) => Response::Item(node.sub_get(&item.key, &item.sub_key)),
            StoreRequest::Next(item) => Response::Item(node.next(&item.key)),
            StoreRequest::Prev(item) => Response::Item(node.prev(&item.key)),
            StoreRequest::SubNext(item) => Response::Item(node.sub_next(&item.key, &item.sub_key)),
            StoreRequest::SubPrev(item) => Response::Item(node.sub_prev(&item.key, &item.sub_key)),
            StoreRequest::First(key) => Response::Item(node.first(key.as_deref())),
            StoreRequest::Last(key) => Response::Item(node.last(key.as_deref())),
            StoreRequest::MirrorFirst(key) => Response::Item(node.mirror_first(key.as_deref())),
            StoreRequest::MirrorLast(key) => Response::Item(node.mirror_last(key.as_deref())),
            StoreRequest::IndexOf(tree, key) => index(node.index_of(tree.as_deref(), &key)),
            StoreRequest::ReverseIndexOf(tree, key) => index(node.reverse_index_of(tree.as_deref(), &key)),
            StoreRequest::MirrorIndexOf(tree, value) => index(node.mirror_index_of(tree.as_deref(), &value)),
            StoreRequest::MirrorReverseIndexOf(tree, value) => {
                index(node.mirror_reverse_index_of(tree.as_deref(), &value))
            }
            StoreRequest::NextIndex(tree, i) => Response::Item(node.next_index(tree.as_deref(), i)),
            StoreRequest::PrevIndex(tree, i) => Response::Item(node.prev_index(tree.as_deref(), i)),

            StoreRequest::Slice(range) => Response::Items(node.slice(&range)),
            StoreRequest::ReverseSlice(range) => Response::Items(node.reverse_slice(&range)),
            StoreRequest::SliceIndex(range) => Response::Items(node.slice_index(&range)),
            StoreRequest::ReverseSliceIndex(range) => Response::Items(node.reverse_slice_index(&range)),
            StoreRequest::SliceLen(range) => reply(node.slice_len(&range), Response::Items),
            StoreRequest::ReverseSliceLen(range) => reply(node.reverse_slice_len(&range), Response::Items),
            StoreRequest::MirrorSlice(range) => Response::Items(node.mirror_slice(&range)),
            StoreRequest::MirrorReverseSlice(range) => Response::Items(node.mirror_reverse_slice(&range)),
            StoreRequest::MirrorSliceIndex(range) => Response::Items(node.mirror_slice_index(&range)),
            StoreRequest::MirrorReverseSliceIndex(range) => {
                Response::Items(node.mirror_reverse_slice_index(&range))
            }
            StoreRequest::MirrorSliceLen(range) => reply(node.mirror_slice_len(&range), Response::Items),
            StoreRequest::MirrorReverseSliceLen(range) => {
                reply(node.mirror_reverse_slice_len(&range), Response::Items)
            }
            StoreRequest::Count(range) => Response::Count(node.count(&range)),
            StoreRequest::MirrorCount(range) => Response::Count(node.mirror_count(&range)),

            StoreRequest::Size => Response::Count(node.size()),
            StoreRequest::SubSize(key) => Response::Count(node.sub_size(&key)),
            StoreRequest::Owned => Response::Count(node.owned()),
            StoreRequest::Describe => Response::Description(node.description()),
            StoreRequest::DescribeTree => Response::Text(node.describe_tree()),
        }
    }
}

/// The local tree's fingerprint and timestamped mutation surface, used by
/// other nodes' anti-entropy runs.
pub struct HashTreeApi {
    coordinator: Arc<Coordinator>,
}

impl HashTreeApi {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub async fn handle(&self, request: HashTreeRequest) -> Response {
        let tree: &dyn HashTree = self.coordinator.tree().as_ref();
        match request {
            HashTreeRequest::Hash => reply(tree.hash().await, Response::Hash),
            HashTreeRequest::Configuration => reply(tree.configuration().await, Response::Configuration),
            HashTreeRequest::Configure(configuration) => tree.configure(configuration).await.into(),
            HashTreeRequest::Finger(key) => reply(tree.finger(&key).await, Response::Print),
            HashTreeRequest::GetTimestamp(key) => reply(tree.get_timestamp(&key).await, Response::Versioned),
            HashTreeRequest::PutTimestamp {
                key,
                value,
                present,
                expected,
                timestamp,
            } => reply(
                tree.put_timestamp(&key, value, present, expected, timestamp).await,
                Response::Bool,
            ),
            HashTreeRequest::DelTimestamp { key, expected } => {
                reply(tree.del_timestamp(&key, expected).await, Response::Bool)
            }
            HashTreeRequest::SubConfiguration(key) => {
                reply(tree.sub_configuration(&key).await, Response::Configuration)
            }
            HashTreeRequest::SubConfigure { key, configuration } => {
                tree.sub_configure(&key, configuration).await.into()
            }
            HashTreeRequest::SubFinger { key, sub_key } => {
                reply(tree.sub_finger(&key, &sub_key).await, Response::Print)
            }
            HashTreeRequest::SubGetTimestamp { key, sub_key } => {
                reply(tree.sub_get_timestamp(&key, &sub_key).await, Response::Versioned)
            }
            HashTreeRequest::SubPutTimestamp {
                key,
                sub_key,
                value,
                present,
                expected,
                timestamp,
            } => reply(
                tree.sub_put_timestamp(&key, &sub_key, value, present, expected, timestamp)
                    .await,
                Response::Bool,
            ),
            HashTreeRequest::SubDelTimestamp { key, sub_key, expected } => {
                reply(tree.sub_del_timestamp(&key, &sub_key, expected).await, Response::Bool)
            }
            HashTreeRequest::SubClearTimestamp {
                key,
                expected,
                timestamp,
            } => reply(
                tree.sub_clear_timestamp(&key, expected, timestamp).await,
                Response::Count,
            ),
            HashTreeRequest::SubKillTimestamp { key, expected } => {
                reply(tree.sub_kill_timestamp(&key, expected).await, Response::Count)
            }
        }
    }
}

/// Routes each request category to its adapter.
pub struct Dispatcher {
    membership: MembershipApi,
    store: StoreApi,
    hash_tree: HashTreeApi,
}

impl Dispatcher {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            membership: MembershipApi::new(coordinator.clone()),
            store: StoreApi::new(coordinator.clone()),
            hash_tree: HashTreeApi::new(coordinator),
        }
    }
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Membership(request) => self.membership.handle(request).await,
            Request::Store(request) => self.store.handle(request).await,
            Request::HashTree(request) => self.hash_tree.handle(request).await,
        }
    }
}

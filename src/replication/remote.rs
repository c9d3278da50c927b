//! Remote Hash Tree
//!
//! [`HashTree`] proxy for the tree of another ring member, so anti-entropy
//! can run between a local tree and a remote one without knowing which is
//! which.

use crate::replication::sync::HashTree;
use crate::replication::transport::Transport;
use crate::replication::types::{Comm, CoordinatorEvent, HashTreeRequest, Remote, Request, Response, StoreError};
use crate::trie::{stitch, Configuration, Digest, Nibble, Print, Versioned};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

/// The tree held by `destination`, reached from `source`.
pub struct RemoteHashTree {
    transport: Arc<Transport>,
    source: Remote,
    destination: Remote,
    events: broadcast::Sender<CoordinatorEvent>,
}

impl RemoteHashTree {
    pub fn new(
        transport: Arc<Transport>,
        source: Remote,
        destination: Remote,
        events: broadcast::Sender<CoordinatorEvent>,
    ) -> Self {
        Self {
            transport,
            source,
            destination,
            events,
        }
    }

    pub fn destination(&self) -> &Remote {
        &self.destination
    }

    async fn call(&self, request: HashTreeRequest) -> Result<Response, StoreError> {
        self.transport
            .call(&self.destination.addr, Request::HashTree(request))
            .await
    }

    /// Publish a mutation that reached the remote tree.
    fn comm(&self, kind: &'static str, key: &[Nibble], sub_key: &[Nibble]) {
        // Nobody listening is fine.
        let _ = self.events.send(CoordinatorEvent::Comm(Comm {
            source: self.source.clone(),
            destination: self.destination.clone(),
            key: stitch(key),
            sub_key: stitch(sub_key),
            kind,
        }));
    }
}

#[async_trait]
impl HashTree for RemoteHashTree {
    async fn hash(&self) -> Result<Digest, StoreError> {
        self.call(HashTreeRequest::Hash).await?.into_hash()
    }

    async fn configuration(&self) -> Result<Configuration, StoreError> {
        self.call(HashTreeRequest::Configuration).await?.into_configuration()
    }

    async fn configure(&self, configuration: Configuration) -> Result<(), StoreError> {
        self.call(HashTreeRequest::Configure(configuration)).await?.into_ack()?;
        self.comm("configure", &[], &[]);
        Ok(())
    }

    async fn finger(&self, key: &[Nibble]) -> Result<Print, StoreError> {
        self.call(HashTreeRequest::Finger(key.to_vec())).await?.into_print()
    }

    async fn get_timestamp(&self, key: &[Nibble]) -> Result<Versioned, StoreError> {
        self.call(HashTreeRequest::GetTimestamp(key.to_vec()))
            .await?
            .into_versioned()
    }

    async fn put_timestamp(
        &self,
        key: &[Nibble],
        value: Vec<u8>,
        present: bool,
        expected: i64,
        timestamp: i64,
    ) -> Result<bool, StoreError> {
        let applied = self
            .call(HashTreeRequest::PutTimestamp {
                key: key.to_vec(),
                value,
                present,
                expected,
                timestamp,
            })
            .await?
            .into_bool()?;
        if applied {
            self.comm("put", key, &[]);
        }
        Ok(applied)
    }

    async fn del_timestamp(&self, key: &[Nibble], expected: i64) -> Result<bool, StoreError> {
        let applied = self
            .call(HashTreeRequest::DelTimestamp {
                key: key.to_vec(),
                expected,
            })
            .await?
            .into_bool()?;
        if applied {
            self.comm("del", key, &[]);
        }
        Ok(applied)
    }

    async fn sub_configuration(&self, key: &[u8]) -> Result<Configuration, StoreError> {
        self.call(HashTreeRequest::SubConfiguration(key.to_vec()))
            .await?
            .into_configuration()
    }

    async fn sub_configure(&self, key: &[u8], configuration: Configuration) -> Result<(), StoreError> {
        self.call(HashTreeRequest::SubConfigure {
            key: key.to_vec(),
            configuration,
        })
        .await?
        .into_ack()?;
        self.comm("sub_configure", &crate::trie::rip(key), &[]);
        Ok(())
    }

    async fn sub_finger(&self, key: &[Nibble], sub_key: &[Nibble]) -> Result<Print, StoreError> {
        self.call(HashTreeRequest::SubFinger {
            key: key.to_vec(),
            sub_key: sub_key.to_vec(),
        })
        .await?
        .into_print()
    }

    async fn sub_get_timestamp(&self, key: &[Nibble], sub_key: &[Nibble]) -> Result<Versioned, StoreError> {
        self.call(HashTreeRequest::SubGetTimestamp {
            key: key.to_vec(),
            sub_key: sub_key.to_vec(),
        })
        .await?
        .into_versioned()
    }

    async fn sub_put_timestamp(
        &self,
        key: &[Nibble],
        sub_key: &[Nibble],
        value: Vec<u8>,
        present: bool,
        expected: i64,
        timestamp: i64,
    ) -> Result<bool, StoreError> {
        let applied = self
            .call(HashTreeRequest::SubPutTimestamp {
                key: key.to_vec(),
                sub_key: sub_key.to_vec(),
                value,
                present,
                expected,
                timestamp,
            })
            .await?
            .into_bool()?;
        if applied {
            self.comm("sub_put", key, sub_key);
        }
        Ok(applied)
    }

    async fn sub_del_timestamp(&self, key: &[Nibble], sub_key: &[Nibble], expected: i64) -> Result<bool, StoreError> {
        let applied = self
            .call(HashTreeRequest::SubDelTimestamp {
                key: key.to_vec(),
                sub_key: sub_key.to_vec(),
                expected,
            })
            .await?
            .into_bool()?;
        if applied {
            self.comm("sub_del", key, sub_key);
        }
        Ok(applied)
    }

    async fn sub_clear_timestamp(&self, key: &[Nibble], expected: i64, timestamp: i64) -> Result<usize, StoreError> {
        let removed = self
            .call(HashTreeRequest::SubClearTimestamp {
                key: key.to_vec(),
                expected,
                timestamp,
            })
            .await?
            .into_count()?;
        if removed > 0 {
            self.comm("sub_clear", key, &[]);
        }
        Ok(removed)
    }

    async fn sub_kill_timestamp(&self, key: &[Nibble], expected: i64) -> Result<usize, StoreError> {
        let removed = self
            .call(HashTreeRequest::SubKillTimestamp {
                key: key.to_vec(),
                expected,
            })
            .await?
            .into_count()?;
        if removed > 0 {
            self.comm("sub_kill", key, &[]);
        }
        Ok(removed)
    }
}

//! Lockable tree handle.
//!
//! A [`Tree`] owns one [`Trie`] behind a single `parking_lot::RwLock`.
//! Sub-trie mutations happen under that same lock; nothing here ever holds
//! two tree locks at once.

use super::digest::Digest;
use super::print::Print;
use super::trie::{EmptySubTrie, Trie};
use super::{rip, stitch, Configuration, Nibble, Versioned};
use crate::infrastructure::clock::Clock;
use crate::infrastructure::oplog::{Operation, OperationLog};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct Tree {
    trie: RwLock<Trie>,
    clock: Arc<dyn Clock>,
    log: Option<Arc<dyn OperationLog>>,
    recording: AtomicBool,
}

impl Tree {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.continuous_time();
        Self {
            trie: RwLock::new(Trie::new(now)),
            clock,
            log: None,
            recording: AtomicBool::new(false),
        }
    }

    /// A tree that records every mutation into `log`.
    pub fn with_log(clock: Arc<dyn Clock>, log: Arc<dyn OperationLog>) -> Self {
        let mut tree = Self::new(clock);
        tree.log = Some(log);
        tree.recording = AtomicBool::new(true);
        tree
    }

    /// Re-apply every logged operation. Returns how many were replayed.
    pub fn restore(&self) -> anyhow::Result<usize> {
        let Some(log) = &self.log else {
            return Ok(0);
        };
        let operations = log.replay()?;
        self.recording.store(false, Ordering::SeqCst);
        for operation in &operations {
            self.apply(operation.clone());
        }
        self.recording.store(true, Ordering::SeqCst);
        tracing::info!("restored {} operations from log", operations.len());
        Ok(operations.len())
    }

    fn apply(&self, operation: Operation) {
        match operation {
            Operation::Put {
                key,
                sub_key: None,
                value,
                timestamp,
            } => {
                self.put(&key, value, timestamp);
            }
            Operation::Put {
                key,
                sub_key: Some(sub_key),
                value,
                timestamp,
            } => {
                self.sub_put(&key, &sub_key, value, timestamp);
            }
            Operation::Delete { key, sub_key: None } => {
                self.del(&key);
            }
            Operation::Delete {
                key,
                sub_key: Some(sub_key),
            } => {
                self.sub_del(&key, &sub_key);
            }
            Operation::Tombstone {
                key,
                sub_key: None,
                timestamp,
            } => {
                self.fake_del(&key, timestamp);
            }
            Operation::Tombstone {
                key,
                sub_key: Some(sub_key),
                timestamp,
            } => {
                self.sub_fake_del(&key, &sub_key, timestamp);
            }
            Operation::Clear { key, timestamp } => {
                self.sub_clear(&key, timestamp);
            }
            Operation::Kill { key } => {
                self.sub_kill(&key);
            }
            Operation::Configure {
                key: None,
                configuration,
            } => self.configure(configuration),
            Operation::Configure {
                key: Some(key),
                configuration,
            } => self.sub_configure(&key, configuration),
        }
    }

    fn now(&self) -> i64 {
        self.clock.continuous_time()
    }

    fn record(&self, operation: Operation) {
        if !self.recording.load(Ordering::SeqCst) {
            return;
        }
        if let Some(log) = &self.log {
            if let Err(e) = log.record(&operation) {
                tracing::warn!("failed to record operation: {:?}", e);
            }
        }
    }

    /// Run a read-only query against the trie.
    pub fn read<R>(&self, f: impl FnOnce(&Trie) -> R) -> R {
        f(&self.trie.read())
    }

    /// Run a read-only query against the sub-trie at `key`, if there is one.
    pub fn read_sub<R>(&self, key: &[u8], f: impl FnOnce(&Trie) -> R) -> Option<R> {
        self.trie.read().sub(key).map(f)
    }

    pub fn hash(&self) -> Digest {
        self.trie.read().hash()
    }

    pub fn size(&self) -> usize {
        self.trie.read().size()
    }

    pub fn real_size(&self) -> usize {
        self.trie.read().real_size()
    }

    pub fn data_timestamp(&self) -> i64 {
        self.trie.read().data_timestamp()
    }

    pub fn describe(&self) -> String {
        self.trie.read().describe()
    }

    pub fn configuration(&self) -> Configuration {
        self.trie.read().configuration().clone()
    }

    pub fn get(&self, key: &[u8]) -> Option<(Vec<u8>, i64)> {
        self.trie.read().get(key)
    }

    pub fn put(&self, key: &[u8], value: Vec<u8>, timestamp: i64) -> Option<Vec<u8>> {
        let now = self.now();
        let mut trie = self.trie.write();
        let logged = self.log.as_ref().map(|_| value.clone());
        let previous = trie.put(key, value, timestamp, now);
        if let Some(value) = logged {
            self.record(Operation::Put {
                key: key.to_vec(),
                sub_key: None,
                value,
                timestamp,
            });
        }
        previous
    }

    /// Physically remove the value at `key`.
    pub fn del(&self, key: &[u8]) -> Option<(Vec<u8>, i64)> {
        let now = self.now();
        let mut trie = self.trie.write();
        let previous = trie.del(key, now);
        if previous.is_some() {
            self.record(Operation::Delete {
                key: key.to_vec(),
                sub_key: None,
            });
        }
        previous
    }

    /// Replace the value at `key` by a tombstone stamped `timestamp`.
    pub fn fake_del(&self, key: &[u8], timestamp: i64) -> Option<(Vec<u8>, i64)> {
        let now = self.now();
        let mut trie = self.trie.write();
        let previous = trie.fake_del(key, timestamp, now);
        self.record(Operation::Tombstone {
            key: key.to_vec(),
            sub_key: None,
            timestamp,
        });
        previous
    }

    /// Drop every entry. Truncates the operation log.
    pub fn clear(&self, timestamp: i64) -> usize {
        let now = self.now();
        let mut trie = self.trie.write();
        let removed = trie.clear(timestamp, now);
        if self.recording.load(Ordering::SeqCst) {
            if let Some(log) = &self.log {
                if let Err(e) = log.truncate() {
                    tracing::warn!("failed to truncate operation log: {:?}", e);
                }
            }
        }
        // The configuration outlives a clear, so it must outlive the truncate.
        if *trie.configuration() != Configuration::default() {
            self.record(Operation::Configure {
                key: None,
                configuration: trie.configuration().clone(),
            });
        }
        removed
    }

    pub fn configure(&self, configuration: Configuration) {
        let now = self.now();
        let mut trie = self.trie.write();
        trie.configure(configuration.clone(), now);
        self.record(Operation::Configure {
            key: None,
            configuration,
        });
    }

    pub fn add_configuration(&self, timestamp: i64, key: &str, value: &str) -> bool {
        let now = self.now();
        let mut trie = self.trie.write();
        let changed = trie.add_configuration(timestamp, key, value, now);
        if changed {
            self.record(Operation::Configure {
                key: None,
                configuration: trie.configuration().clone(),
            });
        }
        changed
    }

    /// Last-writer-wins put: applies only if `timestamp` beats the stored one.
    pub fn put_if_newer(&self, key: &[u8], value: Vec<u8>, timestamp: i64) -> bool {
        let now = self.now();
        let mut trie = self.trie.write();
        let logged = self.log.as_ref().map(|_| value.clone());
        let applied = trie.put_if_newer(key, value, timestamp, now);
        if let (true, Some(value)) = (applied, logged) {
            self.record(Operation::Put {
                key: key.to_vec(),
                sub_key: None,
                value,
                timestamp,
            });
        }
        applied
    }

    /// Last-writer-wins delete: tombstones only if `timestamp` beats the stored one.
    pub fn fake_del_if_newer(&self, key: &[u8], timestamp: i64) -> bool {
        let now = self.now();
        let mut trie = self.trie.write();
        let applied = trie.fake_del_if_newer(key, timestamp, now);
        if applied {
            self.record(Operation::Tombstone {
                key: key.to_vec(),
                sub_key: None,
                timestamp,
            });
        }
        applied
    }

    pub fn sub_get(&self, key: &[u8], sub_key: &[u8]) -> Option<(Vec<u8>, i64)> {
        self.trie.read().sub(key)?.get(sub_key)
    }

    pub fn sub_size(&self, key: &[u8]) -> usize {
        self.read_sub(key, Trie::size).unwrap_or(0)
    }

    pub fn sub_configuration(&self, key: &[u8]) -> Configuration {
        self.trie.read().sub_configuration(&rip(key))
    }

    pub fn sub_put(&self, key: &[u8], sub_key: &[u8], value: Vec<u8>, timestamp: i64) -> Option<Vec<u8>> {
        let now = self.now();
        let mut trie = self.trie.write();
        let logged = self.log.as_ref().map(|_| value.clone());
        let previous = trie
            .modify_sub(&rip(key), true, EmptySubTrie::Keep, now, |sub| sub.put(sub_key, value, timestamp, now))
            .flatten();
        if let Some(value) = logged {
            self.record(Operation::Put {
                key: key.to_vec(),
                sub_key: Some(sub_key.to_vec()),
                value,
                timestamp,
            });
        }
        previous
    }

    /// Physically remove a sub-trie value. An emptied sub-trie disappears.
    pub fn sub_del(&self, key: &[u8], sub_key: &[u8]) -> Option<(Vec<u8>, i64)> {
        let now = self.now();
        let mut trie = self.trie.write();
        let previous = trie
            .modify_sub(&rip(key), false, EmptySubTrie::Drop, now, |sub| sub.del(sub_key, now))
            .flatten();
        if previous.is_some() {
            self.record(Operation::Delete {
                key: key.to_vec(),
                sub_key: Some(sub_key.to_vec()),
            });
        }
        previous
    }

    pub fn sub_fake_del(&self, key: &[u8], sub_key: &[u8], timestamp: i64) -> Option<(Vec<u8>, i64)> {
        let now = self.now();
        let mut trie = self.trie.write();
        let previous = trie
            .modify_sub(&rip(key), true, EmptySubTrie::Keep, now, |sub| sub.fake_del(sub_key, timestamp, now))
            .flatten();
        self.record(Operation::Tombstone {
            key: key.to_vec(),
            sub_key: Some(sub_key.to_vec()),
            timestamp,
        });
        previous
    }

    pub fn sub_put_if_newer(&self, key: &[u8], sub_key: &[u8], value: Vec<u8>, timestamp: i64) -> bool {
        let now = self.now();
        let mut trie = self.trie.write();
        let logged = self.log.as_ref().map(|_| value.clone());
        let applied = trie
            .modify_sub(&rip(key), true, EmptySubTrie::DropIfCreated, now, |sub| {
                sub.put_if_newer(sub_key, value, timestamp, now)
            })
            .unwrap_or(false);
        if let (true, Some(value)) = (applied, logged) {
            self.record(Operation::Put {
                key: key.to_vec(),
                sub_key: Some(sub_key.to_vec()),
                value,
                timestamp,
            });
        }
        applied
    }

    pub fn sub_fake_del_if_newer(&self, key: &[u8], sub_key: &[u8], timestamp: i64) -> bool {
        let now = self.now();
        let mut trie = self.trie.write();
        let applied = trie
            .modify_sub(&rip(key), true, EmptySubTrie::DropIfCreated, now, |sub| {
                sub.fake_del_if_newer(sub_key, timestamp, now)
            })
            .unwrap_or(false);
        if applied {
            self.record(Operation::Tombstone {
                key: key.to_vec(),
                sub_key: Some(sub_key.to_vec()),
                timestamp,
            });
        }
        applied
    }

    /// Empty the sub-trie at `key`, keeping the sub-trie itself so its data
    /// timestamp can out-race stale replicas.
    pub fn sub_clear(&self, key: &[u8], timestamp: i64) -> usize {
        let now = self.now();
        let mut trie = self.trie.write();
        let removed = trie
            .modify_sub(&rip(key), false, EmptySubTrie::Keep, now, |sub| sub.clear(timestamp, now))
            .unwrap_or(0);
        self.record(Operation::Clear {
            key: key.to_vec(),
            timestamp,
        });
        removed
    }

    /// Remove the sub-trie at `key` altogether.
    pub fn sub_kill(&self, key: &[u8]) -> usize {
        let now = self.now();
        let mut trie = self.trie.write();
        let removed = trie.kill_sub(&rip(key), now);
        self.record(Operation::Kill { key: key.to_vec() });
        removed
    }

    pub fn sub_configure(&self, key: &[u8], configuration: Configuration) {
        let now = self.now();
        let mut trie = self.trie.write();
        trie.modify_sub(&rip(key), true, EmptySubTrie::Keep, now, |sub| {
            sub.configure(configuration.clone(), now)
        });
        self.record(Operation::Configure {
            key: Some(key.to_vec()),
            configuration,
        });
    }

    pub fn sub_add_configuration(&self, key: &[u8], timestamp: i64, name: &str, value: &str) -> bool {
        let now = self.now();
        let mut trie = self.trie.write();
        let ripped = rip(key);
        let changed = trie
            .modify_sub(&ripped, true, EmptySubTrie::Keep, now, |sub| {
                sub.add_configuration(timestamp, name, value, now)
            })
            .unwrap_or(false);
        if changed {
            self.record(Operation::Configure {
                key: Some(key.to_vec()),
                configuration: trie.sub_configuration(&ripped),
            });
        }
        changed
    }

    // Replication surface, keyed by nibbles as found in fingerprints.

    pub fn finger(&self, key: &[Nibble]) -> Print {
        self.trie.read().finger(key)
    }

    pub fn get_timestamp(&self, key: &[Nibble]) -> Versioned {
        self.trie.read().get_timestamp(key)
    }

    pub fn put_timestamp(&self, key: &[Nibble], value: Vec<u8>, present: bool, expected: i64, timestamp: i64) -> bool {
        let now = self.now();
        let mut trie = self.trie.write();
        let logged = self.log.as_ref().map(|_| value.clone());
        let applied = trie.put_timestamp(key, value, present, expected, timestamp, now);
        if let (true, Some(value)) = (applied, logged) {
            self.record(stamped_operation(stitch(key), None, value, present, timestamp));
        }
        applied
    }

    pub fn del_timestamp(&self, key: &[Nibble], expected: i64) -> bool {
        let now = self.now();
        let mut trie = self.trie.write();
        let applied = trie.del_timestamp(key, expected, now);
        if applied {
            self.record(Operation::Delete {
                key: stitch(key),
                sub_key: None,
            });
        }
        applied
    }

    pub fn sub_finger(&self, key: &[Nibble], sub_key: &[Nibble]) -> Print {
        self.trie.read().sub_finger(key, sub_key)
    }

    pub fn sub_get_timestamp(&self, key: &[Nibble], sub_key: &[Nibble]) -> Versioned {
        self.trie.read().sub_get_timestamp(key, sub_key)
    }

    pub fn sub_put_timestamp(
        &self,
        key: &[Nibble],
        sub_key: &[Nibble],
        value: Vec<u8>,
        present: bool,
        expected: i64,
        timestamp: i64,
    ) -> bool {
        let now = self.now();
        let mut trie = self.trie.write();
        let logged = self.log.as_ref().map(|_| value.clone());
        let applied = trie
            .modify_sub(key, true, EmptySubTrie::DropIfCreated, now, |sub| {
                sub.put_timestamp(sub_key, value, present, expected, timestamp, now)
            })
            .unwrap_or(false);
        if let (true, Some(value)) = (applied, logged) {
            self.record(stamped_operation(stitch(key), Some(stitch(sub_key)), value, present, timestamp));
        }
        applied
    }

    pub fn sub_del_timestamp(&self, key: &[Nibble], sub_key: &[Nibble], expected: i64) -> bool {
        let now = self.now();
        let mut trie = self.trie.write();
        let applied = trie
            .modify_sub(key, false, EmptySubTrie::Drop, now, |sub| sub.del_timestamp(sub_key, expected, now))
            .unwrap_or(false);
        if applied {
            self.record(Operation::Delete {
                key: stitch(key),
                sub_key: Some(stitch(sub_key)),
            });
        }
        applied
    }

    /// Clear the sub-trie at `key` if its data timestamp still equals `expected`.
    pub fn sub_clear_timestamp(&self, key: &[Nibble], expected: i64, timestamp: i64) -> usize {
        let now = self.now();
        let mut trie = self.trie.write();
        let removed = trie.sub_clear_timestamp(key, expected, timestamp, now);
        if removed > 0 {
            self.record(Operation::Clear {
                key: stitch(key),
                timestamp,
            });
        }
        removed
    }

    /// Remove the sub-trie at `key` if its data timestamp still equals `expected`.
    pub fn sub_kill_timestamp(&self, key: &[Nibble], expected: i64) -> usize {
        let now = self.now();
        let mut trie = self.trie.write();
        let removed = trie.sub_kill_timestamp(key, expected, now);
        if removed > 0 {
            self.record(Operation::Kill { key: stitch(key) });
        }
        removed
    }
}

fn stamped_operation(key: Vec<u8>, sub_key: Option<Vec<u8>>, value: Vec<u8>, present: bool, timestamp: i64) -> Operation {
    if present {
        Operation::Put {
            key,
            sub_key,
            value,
            timestamp,
        }
    } else {
        Operation::Tombstone {
            key,
            sub_key,
            timestamp,
        }
    }
}

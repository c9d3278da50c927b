//! Anti-Entropy
//!
//! Fingerprint-driven reconciliation between two [`HashTree`]s.
//!
//! ## How It Works
//!
//! 1. Compare the root hashes and stop early when they match
//! 2. Copy the configuration when the source's is newer
//! 3. Walk both trees from the root, descending only into children whose
//!    fingerprints differ and which may hold keys inside `[from, to)`
//! 4. At each node, copy the source value with an optimistic timestamped
//!    write unless the destination already covers it
//! 5. Sub-tries are reconciled by a nested run over [`SubTree`] views
//!
//! A destructive run deletes from the source everything it visits, which
//! moves a key range instead of copying it.

use crate::replication::ring::{between_ie, between_ii};
use crate::replication::types::StoreError;
use crate::trie::{rip, stitch, Configuration, Digest, Nibble, Print, Tree, Versioned};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;

/// Anything that can take part in anti-entropy: a local tree, a view of one
/// of its sub-tries or a proxy for a tree on another node.
#[async_trait]
pub trait HashTree: Send + Sync {
    async fn hash(&self) -> Result<Digest, StoreError>;

    async fn configuration(&self) -> Result<Configuration, StoreError>;
    async fn configure(&self, configuration: Configuration) -> Result<(), StoreError>;

    async fn finger(&self, key: &[Nibble]) -> Result<Print, StoreError>;
    async fn get_timestamp(&self, key: &[Nibble]) -> Result<Versioned, StoreError>;
    async fn put_timestamp(
        &self,
        key: &[Nibble],
        value: Vec<u8>,
        present: bool,
        expected: i64,
        timestamp: i64,
    ) -> Result<bool, StoreError>;
    async fn del_timestamp(&self, key: &[Nibble], expected: i64) -> Result<bool, StoreError>;

    async fn sub_configuration(&self, key: &[u8]) -> Result<Configuration, StoreError>;
    async fn sub_configure(&self, key: &[u8], configuration: Configuration) -> Result<(), StoreError>;

    async fn sub_finger(&self, key: &[Nibble], sub_key: &[Nibble]) -> Result<Print, StoreError>;
    async fn sub_get_timestamp(&self, key: &[Nibble], sub_key: &[Nibble]) -> Result<Versioned, StoreError>;
    #[allow(clippy::too_many_arguments)]
    async fn sub_put_timestamp(
        &self,
        key: &[Nibble],
        sub_key: &[Nibble],
        value: Vec<u8>,
        present: bool,
        expected: i64,
        timestamp: i64,
    ) -> Result<bool, StoreError>;
    async fn sub_del_timestamp(&self, key: &[Nibble], sub_key: &[Nibble], expected: i64) -> Result<bool, StoreError>;
    async fn sub_clear_timestamp(&self, key: &[Nibble], expected: i64, timestamp: i64) -> Result<usize, StoreError>;
    async fn sub_kill_timestamp(&self, key: &[Nibble], expected: i64) -> Result<usize, StoreError>;
}

#[async_trait]
impl HashTree for Tree {
    async fn hash(&self) -> Result<Digest, StoreError> {
        Ok(Tree::hash(self))
    }

    async fn configuration(&self) -> Result<Configuration, StoreError> {
        Ok(Tree::configuration(self))
    }

    async fn configure(&self, configuration: Configuration) -> Result<(), StoreError> {
        Tree::configure(self, configuration);
        Ok(())
    }

    async fn finger(&self, key: &[Nibble]) -> Result<Print, StoreError> {
        Ok(Tree::finger(self, key))
    }

    async fn get_timestamp(&self, key: &[Nibble]) -> Result<Versioned, StoreError> {
        Ok(Tree::get_timestamp(self, key))
    }

    async fn put_timestamp(
        &self,
        key: &[Nibble],
        value: Vec<u8>,
        present: bool,
        expected: i64,
        timestamp: i64,
    ) -> Result<bool, StoreError> {
        Ok(Tree::put_timestamp(self, key, value, present, expected, timestamp))
    }

    async fn del_timestamp(&self, key: &[Nibble], expected: i64) -> Result<bool, StoreError> {
        Ok(Tree::del_timestamp(self, key, expected))
    }

    async fn sub_configuration(&self, key: &[u8]) -> Result<Configuration, StoreError> {
        Ok(Tree::sub_configuration(self, key))
    }

    async fn sub_configure(&self, key: &[u8], configuration: Configuration) -> Result<(), StoreError> {
        Tree::sub_configure(self, key, configuration);
        Ok(())
    }

    async fn sub_finger(&self, key: &[Nibble], sub_key: &[Nibble]) -> Result<Print, StoreError> {
        Ok(Tree::sub_finger(self, key, sub_key))
    }

    async fn sub_get_timestamp(&self, key: &[Nibble], sub_key: &[Nibble]) -> Result<Versioned, StoreError> {
        Ok(Tree::sub_get_timestamp(self, key, sub_key))
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
        Ok(Tree::sub_put_timestamp(self, key, sub_key, value, present, expected, timestamp))
    }

    async fn sub_del_timestamp(&self, key: &[Nibble], sub_key: &[Nibble], expected: i64) -> Result<bool, StoreError> {
        Ok(Tree::sub_del_timestamp(self, key, sub_key, expected))
    }

    async fn sub_clear_timestamp(&self, key: &[Nibble], expected: i64, timestamp: i64) -> Result<usize, StoreError> {
        Ok(Tree::sub_clear_timestamp(self, key, expected, timestamp))
    }

    async fn sub_kill_timestamp(&self, key: &[Nibble], expected: i64) -> Result<usize, StoreError> {
        Ok(Tree::sub_kill_timestamp(self, key, expected))
    }
}

/// One sub-trie of a [`HashTree`], seen as a tree of its own. Sub-tries of
/// sub-tries are not supported.
pub struct SubTree<'a> {
    parent: &'a dyn HashTree,
    key: Vec<Nibble>,
}

impl<'a> SubTree<'a> {
    pub fn new(parent: &'a dyn HashTree, key: Vec<Nibble>) -> Self {
        Self { parent, key }
    }
}

#[async_trait]
impl HashTree for SubTree<'_> {
    async fn hash(&self) -> Result<Digest, StoreError> {
        let print = self.parent.finger(&self.key).await?;
        Ok(print.tree_hash.unwrap_or_default())
    }

    async fn configuration(&self) -> Result<Configuration, StoreError> {
        self.parent.sub_configuration(&stitch(&self.key)).await
    }

    async fn configure(&self, configuration: Configuration) -> Result<(), StoreError> {
        self.parent.sub_configure(&stitch(&self.key), configuration).await
    }

    async fn finger(&self, key: &[Nibble]) -> Result<Print, StoreError> {
        self.parent.sub_finger(&self.key, key).await
    }

    async fn get_timestamp(&self, key: &[Nibble]) -> Result<Versioned, StoreError> {
        self.parent.sub_get_timestamp(&self.key, key).await
    }

    async fn put_timestamp(
        &self,
        key: &[Nibble],
        value: Vec<u8>,
        present: bool,
        expected: i64,
        timestamp: i64,
    ) -> Result<bool, StoreError> {
        self.parent
            .sub_put_timestamp(&self.key, key, value, present, expected, timestamp)
            .await
    }

    async fn del_timestamp(&self, key: &[Nibble], expected: i64) -> Result<bool, StoreError> {
        self.parent.sub_del_timestamp(&self.key, key, expected).await
    }

    async fn sub_configuration(&self, _key: &[u8]) -> Result<Configuration, StoreError> {
        Err(StoreError::NestedSubTree)
    }

    async fn sub_configure(&self, _key: &[u8], _configuration: Configuration) -> Result<(), StoreError> {
        Err(StoreError::NestedSubTree)
    }

    async fn sub_finger(&self, _key: &[Nibble], _sub_key: &[Nibble]) -> Result<Print, StoreError> {
        Err(StoreError::NestedSubTree)
    }

    async fn sub_get_timestamp(&self, _key: &[Nibble], _sub_key: &[Nibble]) -> Result<Versioned, StoreError> {
        Err(StoreError::NestedSubTree)
    }

    async fn sub_put_timestamp(
        &self,
        _key: &[Nibble],
        _sub_key: &[Nibble],
        _value: Vec<u8>,
        _present: bool,
        _expected: i64,
        _timestamp: i64,
    ) -> Result<bool, StoreError> {
        Err(StoreError::NestedSubTree)
    }

    async fn sub_del_timestamp(&self, _key: &[Nibble], _sub_key: &[Nibble], _expected: i64) -> Result<bool, StoreError> {
        Err(StoreError::NestedSubTree)
    }

    async fn sub_clear_timestamp(&self, _key: &[Nibble], _expected: i64, _timestamp: i64) -> Result<usize, StoreError> {
        Err(StoreError::NestedSubTree)
    }

    async fn sub_kill_timestamp(&self, _key: &[Nibble], _expected: i64) -> Result<usize, StoreError> {
        Err(StoreError::NestedSubTree)
    }
}

/// What one reconciliation run moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Values written into the destination (sub-trie clears count their
    /// removed entries here too).
    pub put_count: usize,
    /// Values deleted from the source by a destructive run.
    pub del_count: usize,
}

impl SyncReport {
    fn absorb(&mut self, other: SyncReport) {
        self.put_count += other.put_count;
        self.del_count += other.del_count;
    }

    /// Whether the run changed either side.
    pub fn moved(&self) -> bool {
        self.put_count > 0 || self.del_count > 0
    }
}

type SyncFuture<'a> = Pin<Box<dyn Future<Output = Result<SyncReport, StoreError>> + Send + 'a>>;

/// One reconciliation of `destination` against `source`.
///
/// ```rust,ignore
/// let report = AntiEntropy::new(&local, &remote).from(&pred).to(&me).run().await?;
/// ```
pub struct AntiEntropy<'a> {
    source: &'a dyn HashTree,
    destination: &'a dyn HashTree,
    from: Option<Vec<Nibble>>,
    to: Option<Vec<Nibble>>,
    destructive: bool,
}

impl<'a> AntiEntropy<'a> {
    pub fn new(source: &'a dyn HashTree, destination: &'a dyn HashTree) -> Self {
        Self {
            source,
            destination,
            from: None,
            to: None,
            destructive: false,
        }
    }

    /// First key, inclusive, to reconcile.
    pub fn from(mut self, from: &[u8]) -> Self {
        self.from = Some(rip(from));
        self
    }

    /// Last key, exclusive, to reconcile. A range whose end precedes its
    /// start wraps around the key space.
    pub fn to(mut self, to: &[u8]) -> Self {
        self.to = Some(rip(to));
        self
    }

    /// Delete from the source whatever the run visits.
    pub fn destroy(mut self) -> Self {
        self.destructive = true;
        self
    }

    /// Reconcile and report what moved.
    pub fn run(&self) -> SyncFuture<'_> {
        Box::pin(async move {
            let mut report = SyncReport::default();
            if let (Some(from), Some(to)) = (&self.from, &self.to) {
                if from == to {
                    return Ok(report);
                }
            }
            if self.destructive || self.source.hash().await? != self.destination.hash().await? {
                let source_configuration = self.source.configuration().await?;
                let destination_configuration = self.destination.configuration().await?;
                if source_configuration.timestamp > destination_configuration.timestamp {
                    self.destination.configure(source_configuration).await?;
                }
                let source_print = self.source.finger(&[]).await?;
                let destination_print = self.destination.finger(&[]).await?;
                self.synchronize(source_print, destination_print, &mut report).await?;
            }
            Ok(report)
        })
    }

    /// Whether `key` may have descendants inside the limits, treating the
    /// key space as circular.
    fn potentially_within_limits(&self, key: &[Nibble]) -> bool {
        let (Some(from), Some(to)) = (&self.from, &self.to) else {
            return true;
        };
        let m = key.len().min(from.len()).min(to.len());
        between_ii(&key[..m], &from[..m], &to[..m])
    }

    fn within_limits(&self, key: &[Nibble]) -> bool {
        let (Some(from), Some(to)) = (&self.from, &self.to) else {
            return true;
        };
        between_ie(key, from, to)
    }

    async fn synchronize(&self, source: Print, destination: Print, report: &mut SyncReport) -> Result<(), StoreError> {
        let mut pending = vec![(source, destination)];
        while let Some((source_print, destination_print)) = pending.pop() {
            if !source_print.exists {
                continue;
            }
            if !source_print.empty && self.within_limits(&source_print.key) {
                if source_print.sub_tree {
                    self.synchronize_sub_tree(&source_print, &destination_print, report).await?;
                }
                if source_print.timestamp > 0 {
                    self.synchronize_value(&source_print, &destination_print, report).await?;
                }
            }
            for (index, sub_print) in source_print.sub_prints.iter().enumerate() {
                if !sub_print.exists || !self.potentially_within_limits(&sub_print.key) {
                    continue;
                }
                if self.destructive || !destination_print.exists || *sub_print != destination_print.sub_print(index) {
                    let source_child = self.source.finger(&sub_print.key).await?;
                    let destination_child = self.destination.finger(&sub_print.key).await?;
                    pending.push((source_child, destination_child));
                }
            }
        }
        Ok(())
    }

    async fn synchronize_sub_tree(
        &self,
        source_print: &Print,
        destination_print: &Print,
        report: &mut SyncReport,
    ) -> Result<(), StoreError> {
        let key = &source_print.key;
        if source_print.tree_hash != destination_print.tree_hash {
            // An emptied source sub-trie that is newer wipes the destination.
            if source_print.tree_size == 0
                && destination_print.tree_size > 0
                && source_print.tree_data_timestamp > destination_print.tree_data_timestamp
            {
                report.put_count += self
                    .destination
                    .sub_clear_timestamp(
                        key,
                        destination_print.tree_data_timestamp,
                        source_print.tree_data_timestamp,
                    )
                    .await?;
            }
            let source = SubTree::new(self.source, key.clone());
            let destination = SubTree::new(self.destination, key.clone());
            let mut nested = AntiEntropy::new(&source, &destination);
            nested.destructive = self.destructive;
            report.absorb(nested.run().await?);
        } else if self.destructive {
            report.del_count += self
                .source
                .sub_kill_timestamp(key, source_print.tree_data_timestamp)
                .await?;
        }
        Ok(())
    }

    async fn synchronize_value(
        &self,
        source_print: &Print,
        destination_print: &Print,
        report: &mut SyncReport,
    ) -> Result<(), StoreError> {
        let key = &source_print.key;
        if !source_print.covered_by(destination_print) {
            let current = self.source.get_timestamp(key).await?;
            // The source changed since it was fingerprinted: the next run
            // picks up the new value.
            if current.timestamp == source_print.timestamp() {
                let applied = self
                    .destination
                    .put_timestamp(
                        key,
                        current.value,
                        current.present,
                        destination_print.timestamp(),
                        source_print.timestamp(),
                    )
                    .await?;
                if applied {
                    report.put_count += 1;
                }
            }
        }
        if self.destructive && self.source.del_timestamp(key, source_print.timestamp()).await? {
            report.del_count += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::infrastructure::clock::ManualClock;
    use crate::trie::digest;
    use std::sync::Arc;

    fn tree() -> Tree {
        Tree::new(Arc::new(ManualClock::new()))
    }

    fn contents(tree: &Tree) -> Vec<(Vec<u8>, Vec<u8>, i64)> {
        let mut entries = Vec::new();
        tree.read(|trie| {
            trie.each(|key, value, timestamp| {
                entries.push((key.to_vec(), value.to_vec(), timestamp));
                true
            })
        });
        entries
    }

    fn sub_contents(tree: &Tree, key: &[u8]) -> Vec<(Vec<u8>, Vec<u8>, i64)> {
        let mut entries = Vec::new();
        tree.read_sub(key, |trie| {
            trie.each(|key, value, timestamp| {
                entries.push((key.to_vec(), value.to_vec(), timestamp));
                true
            })
        });
        entries
    }

    fn assert_same(a: &Tree, b: &Tree) {
        assert_eq!(a.hash(), b.hash(), "\n{}\n{}", a.describe(), b.describe());
        assert_eq!(contents(a), contents(b));
    }

    fn hashed_key(i: usize) -> Vec<u8> {
        digest(i.to_string().as_bytes()).to_vec()
    }

    #[tokio::test]
    async fn test_equal_bytes_with_different_timestamps_are_in_sync() {
        let older = tree();
        let newer = tree();
        older.put(b"k", b"v".to_vec(), 10);
        newer.put(b"k", b"v".to_vec(), 20);
        assert_eq!(older.hash(), newer.hash());

        let report = AntiEntropy::new(&newer, &older).run().await.unwrap();
        assert!(!report.moved());
        assert_eq!(older.get(b"k"), Some((b"v".to_vec(), 10)));
        assert_eq!(newer.get(b"k"), Some((b"v".to_vec(), 20)));
    }

    #[tokio::test]
    async fn test_sync_versions() {
        let tree1 = tree();
        let tree3 = tree();
        for i in 0..10u8 {
            let value = i.to_string().into_bytes();
            tree1.put(&[i], value.clone(), 1);
            if i == 2 {
                tree3.put(&[i], b"other timestamp".to_vec(), 2);
            } else {
                tree3.put(&[i], value, 1);
            }
        }
        let tree2 = tree();
        tree2.put(&[2], b"other timestamp".to_vec(), 2);

        AntiEntropy::new(&tree1, &tree2).run().await.unwrap();
        assert_ne!(tree1.hash(), tree2.hash());
        assert_same(&tree3, &tree2);

        tree1.put(&[2], b"yet another timestamp".to_vec(), 3);
        AntiEntropy::new(&tree1, &tree2).run().await.unwrap();
        assert_ne!(tree3.hash(), tree2.hash());
        assert_same(&tree1, &tree2);
    }

    #[tokio::test]
    async fn test_sync_limits() {
        let tree1 = tree();
        let tree3 = tree();
        for i in 0..10u8 {
            let value = i.to_string().into_bytes();
            tree1.put(&[i], value.clone(), 1);
            if (3..7).contains(&i) {
                tree3.put(&[i], value, 1);
            }
        }
        let tree2 = tree();
        AntiEntropy::new(&tree1, &tree2).from(&[3]).to(&[7]).run().await.unwrap();
        assert_same(&tree3, &tree2);
    }

    #[tokio::test]
    async fn test_sync_empty_range_is_noop() {
        let tree1 = tree();
        tree1.put(b"a", b"1".to_vec(), 1);
        let tree2 = tree();
        let report = AntiEntropy::new(&tree1, &tree2).from(b"q").to(b"q").run().await.unwrap();
        assert_eq!(report, SyncReport::default());
        assert_eq!(tree2.size(), 0);
    }

    #[tokio::test]
    async fn test_sync_random_limits() {
        let tree1 = tree();
        for i in 0..10 {
            tree1.put(&hashed_key(i), i.to_string().into_bytes(), 1);
        }
        let keys: Vec<Vec<u8>> = contents(&tree1).into_iter().map(|(key, _, _)| key).collect();
        for from in &keys {
            for to in &keys {
                if from >= to {
                    continue;
                }
                let expected = tree();
                for (key, value, _) in contents(&tree1) {
                    if between_ie(&key, from, to) {
                        expected.put(&key, value, 1);
                    }
                }
                let synced = tree();
                AntiEntropy::new(&tree1, &synced).from(from).to(to).run().await.unwrap();
                assert_eq!(contents(&synced), contents(&expected));
            }
        }
    }

    #[tokio::test]
    async fn test_sync_wrapping_limits() {
        let tree1 = tree();
        for i in 0..10u8 {
            tree1.put(&[i], vec![i], 1);
        }
        let tree2 = tree();
        AntiEntropy::new(&tree1, &tree2).from(&[8]).to(&[2]).run().await.unwrap();
        let keys: Vec<Vec<u8>> = contents(&tree2).into_iter().map(|(key, _, _)| key).collect();
        assert_eq!(keys, vec![vec![0], vec![1], vec![8], vec![9]]);
    }

    #[tokio::test]
    async fn test_sync_sub_tree() {
        let tree1 = tree();
        for i in 0..10 {
            let key = hashed_key(i);
            let value = i.to_string().into_bytes();
            if i % 2 == 0 {
                tree1.put(&key, value, 1);
            } else {
                for j in 0..10 {
                    tree1.sub_put(&key, j.to_string().as_bytes(), value.clone(), 1);
                }
            }
        }
        let tree2 = tree();
        AntiEntropy::new(&tree1, &tree2).run().await.unwrap();
        assert_same(&tree1, &tree2);
        assert_eq!(sub_contents(&tree1, &hashed_key(1)), sub_contents(&tree2, &hashed_key(1)));
    }

    #[tokio::test]
    async fn test_sync_sub_tree_versions() {
        let tree1 = tree();
        let tree3 = tree();
        for i in 0..10 {
            let key = hashed_key(i);
            let value = i.to_string().into_bytes();
            if i % 2 == 0 {
                tree1.put(&key, value.clone(), 1);
                tree3.put(&key, value, 1);
            } else {
                for j in 0..10 {
                    let sub_key = j.to_string().into_bytes();
                    tree1.sub_put(&key, &sub_key, value.clone(), 1);
                    if i == 1 && j == 3 {
                        tree3.sub_put(&key, &sub_key, b"another value".to_vec(), 2);
                    } else {
                        tree3.sub_put(&key, &sub_key, value.clone(), 1);
                    }
                }
            }
        }
        let tree2 = tree();
        tree2.sub_put(&hashed_key(1), b"3", b"another value".to_vec(), 2);

        AntiEntropy::new(&tree1, &tree2).run().await.unwrap();
        assert_ne!(tree1.hash(), tree2.hash());
        assert_same(&tree3, &tree2);
        assert_eq!(sub_contents(&tree3, &hashed_key(1)), sub_contents(&tree2, &hashed_key(1)));

        tree1.sub_put(&hashed_key(1), b"3", b"another value again".to_vec(), 3);
        AntiEntropy::new(&tree1, &tree2).run().await.unwrap();
        assert_ne!(tree3.hash(), tree2.hash());
        assert_same(&tree1, &tree2);
        assert_eq!(sub_contents(&tree1, &hashed_key(1)), sub_contents(&tree2, &hashed_key(1)));
    }

    #[tokio::test]
    async fn test_sync_sub_tree_destructive() {
        let tree1 = tree();
        let tree3 = tree();
        for i in 0..10 {
            let key = hashed_key(i);
            let value = i.to_string().into_bytes();
            if i % 2 == 0 {
                tree1.put(&key, value.clone(), 1);
                tree3.put(&key, value, 1);
            } else {
                for j in 0..10 {
                    let sub_key = j.to_string().into_bytes();
                    tree1.sub_put(&key, &sub_key, value.clone(), 1);
                    tree3.sub_put(&key, &sub_key, value.clone(), 1);
                }
            }
        }
        let tree2 = tree();
        let report = AntiEntropy::new(&tree3, &tree2).destroy().run().await.unwrap();
        assert_same(&tree1, &tree2);
        assert_eq!(tree3.size(), 0);
        assert_eq!(tree3.hash(), tree().hash());
        assert_eq!(report.put_count, 5 + 5 * 10);
    }

    #[tokio::test]
    async fn test_sync_destructive() {
        let tree1 = tree();
        let tree3 = tree();
        for i in 0..1000 {
            let key = i.to_string().into_bytes();
            tree1.put(&key, key.clone(), 1);
            tree3.put(&key, key.clone(), 1);
        }
        let tree2 = tree();
        let report = AntiEntropy::new(&tree3, &tree2).destroy().run().await.unwrap();
        assert_same(&tree1, &tree2);
        assert_eq!(tree3.size(), 0);
        assert_eq!(tree3.hash(), tree().hash());
        assert_eq!(report.put_count, 1000);
        assert_eq!(report.del_count, 1000);
    }

    #[tokio::test]
    async fn test_sync_destructive_matching() {
        let tree1 = tree();
        let tree2 = tree();
        let tree3 = tree();
        for i in 0..1000 {
            let key = hashed_key(i);
            let value = i.to_string().into_bytes();
            tree1.put(&key, value.clone(), 1);
            tree2.put(&key, value.clone(), 1);
            tree3.put(&key, value, 1);
        }
        let report = AntiEntropy::new(&tree1, &tree2).destroy().run().await.unwrap();
        assert_same(&tree2, &tree3);
        assert_eq!(tree1.size(), 0);
        assert_eq!(tree1.hash(), tree().hash());
        assert_eq!(report.put_count, 0);
        assert_eq!(report.del_count, 1000);
    }

    #[tokio::test]
    async fn test_sync_complete_and_idempotent() {
        let tree1 = tree();
        for i in 0..1000 {
            let key = i.to_string().into_bytes();
            tree1.put(&key, key.clone(), 1);
        }
        let tree2 = tree();
        let first = AntiEntropy::new(&tree1, &tree2).run().await.unwrap();
        assert_eq!(first.put_count, 1000);
        assert_same(&tree1, &tree2);

        let second = AntiEntropy::new(&tree1, &tree2).run().await.unwrap();
        assert!(!second.moved());
    }

    #[tokio::test]
    async fn test_sync_partial() {
        let tree1 = tree();
        let tree2 = tree();
        for i in 0..100 {
            let key = i.to_string().into_bytes();
            tree1.put(&key, key.clone(), 1);
            if i % 2 != 0 {
                tree2.put(&key, key.clone(), 1);
            }
        }
        let report = AntiEntropy::new(&tree1, &tree2).run().await.unwrap();
        assert_same(&tree1, &tree2);
        assert_eq!(report.put_count, 50);
    }

    #[tokio::test]
    async fn test_sync_carries_tombstones() {
        let tree1 = tree();
        let tree2 = tree();
        tree1.put(b"k", b"old".to_vec(), 1);
        tree2.put(b"k", b"old".to_vec(), 1);
        tree1.fake_del(b"k", 2);
        AntiEntropy::new(&tree1, &tree2).run().await.unwrap();
        assert_eq!(tree2.get(b"k"), None);
        assert_eq!(tree1.hash(), tree2.hash());
        assert_eq!(tree2.real_size(), 1);
    }

    #[tokio::test]
    async fn test_sync_conf() {
        let tree1 = tree();
        let tree2 = tree();
        tree1.add_configuration(1, "blapp", "blepp");
        AntiEntropy::new(&tree1, &tree2).run().await.unwrap();
        assert_eq!(tree1.configuration(), tree2.configuration());
    }

    #[tokio::test]
    async fn test_sync_sub_conf() {
        let tree1 = tree();
        let tree2 = tree();
        tree1.sub_add_configuration(b"a", 1, "blapp", "blepp");
        AntiEntropy::new(&tree1, &tree2).run().await.unwrap();
        assert_eq!(tree1.sub_configuration(b"a"), tree2.sub_configuration(b"a"));
        assert_eq!(tree2.sub_configuration(b"a").data.get("blapp").map(String::as_str), Some("blepp"));
    }

    #[tokio::test]
    async fn test_nested_sub_tree_is_rejected() {
        let tree = tree();
        let sub = SubTree::new(&tree, rip(b"a"));
        assert_eq!(sub.sub_finger(&[], &[]).await, Err(StoreError::NestedSubTree));
        assert_eq!(sub.sub_kill_timestamp(&[], 0).await, Err(StoreError::NestedSubTree));
    }
}

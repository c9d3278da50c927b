//! Unsynchronized trie: root node, configuration and mirror index.
//!
//! Read-only queries are public and reached through [`super::Tree::read`];
//! mutations are crate-private and always go through the owning tree's lock.

use super::digest::{Digest, Hasher};
use super::iter::{Bounds, KeyRange};
use super::node::{Node, Previous};
use super::print::Print;
use super::{escape, mirror_key, rip, stitch, Configuration, Nibble, Versioned, BYTE_VALUE, TREE_VALUE};

/// A key/value pair read out of a trie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: i64,
}

impl Entry {
    fn new(key: &[u8], value: &[u8], timestamp: i64) -> Self {
        Self {
            key: key.to_vec(),
            value: value.to_vec(),
            timestamp,
        }
    }
}

/// What happens to a sub-trie that ends up without entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EmptySubTrie {
    Keep,
    Drop,
    /// Drop only if the same call created it.
    DropIfCreated,
}

#[derive(Debug)]
pub struct Trie {
    root: Box<Node>,
    mirror: Option<Box<Trie>>,
    configuration: Configuration,
    data_timestamp: i64,
}

/// Strip `0 ++ escape(key)` off a mirror key, leaving the indexed value.
fn unmirror<'a>(mirror_key: &'a [u8], key: &[u8]) -> &'a [u8] {
    let suffix = escape(key).len() + 1;
    &mirror_key[..mirror_key.len().saturating_sub(suffix)]
}

/// Mirror-key range guaranteed to contain every value admitted by `bounds`.
fn mirror_scan(bounds: &Bounds) -> Bounds {
    Bounds {
        min: bounds.min.clone(),
        max: bounds.max.as_ref().map(|max| {
            let mut max = max.clone();
            max.push(1);
            max
        }),
        min_inclusive: true,
        max_inclusive: false,
    }
}

impl Trie {
    pub(crate) fn new(now: i64) -> Self {
        let mut root = Node::structural(Vec::new());
        root.rehash(&[], now);
        Self {
            root,
            mirror: None,
            configuration: Configuration::default(),
            data_timestamp: now,
        }
    }

    /// Digest over configuration and content. Equal hashes mean equal
    /// configuration and equal key/value/tombstone sets.
    pub fn hash(&self) -> Digest {
        let mut hasher = Hasher::new();
        for (key, value) in &self.configuration.data {
            hasher.update(key.as_bytes()).update(&[0]).update(value.as_bytes()).update(&[0]);
        }
        hasher.update(&self.root.hash);
        hasher.finish()
    }

    /// Live entries, sub-trie contents included.
    pub fn size(&self) -> usize {
        self.root.byte_size + self.root.tree_size
    }

    /// Timestamped entries, tombstones included.
    pub fn real_size(&self) -> usize {
        self.root.real_size
    }

    pub fn data_timestamp(&self) -> i64 {
        self.data_timestamp
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn is_mirrored(&self) -> bool {
        self.mirror.is_some()
    }

    pub fn find(&self, key: &[u8]) -> Option<&Node> {
        self.root.find(&rip(key))
    }

    pub fn get(&self, key: &[u8]) -> Option<(Vec<u8>, i64)> {
        let node = self.find(key)?;
        node.value().map(|value| (value.to_vec(), node.timestamp))
    }

    /// The nested trie stored at `key`.
    pub fn sub(&self, key: &[u8]) -> Option<&Trie> {
        self.find(key).and_then(Node::sub_trie)
    }

    pub fn finger(&self, key: &[Nibble]) -> Print {
        self.root.finger(key)
    }

    pub fn get_timestamp(&self, key: &[Nibble]) -> Versioned {
        match self.root.find(key) {
            Some(node) => Versioned {
                value: node.byte_value.clone(),
                timestamp: node.timestamp,
                present: node.usage & BYTE_VALUE != 0,
            },
            None => Versioned::default(),
        }
    }

    fn current_timestamp(&self, key: &[Nibble]) -> i64 {
        self.root.find(key).map_or(0, |node| node.timestamp)
    }

    pub fn each(&self, mut f: impl FnMut(&[u8], &[u8], i64) -> bool) {
        self.root.each(&mut Vec::new(), BYTE_VALUE, &mut |key, node| {
            f(&stitch(key), &node.byte_value, node.timestamp)
        });
    }

    pub fn reverse_each(&self, mut f: impl FnMut(&[u8], &[u8], i64) -> bool) {
        self.root.reverse_each(&mut Vec::new(), BYTE_VALUE, &mut |key, node| {
            f(&stitch(key), &node.byte_value, node.timestamp)
        });
    }

    pub fn each_between(&self, bounds: &Bounds, mut f: impl FnMut(&[u8], &[u8], i64) -> bool) {
        self.root
            .each_between(&mut Vec::new(), &bounds.ripped(), BYTE_VALUE, &mut |key, node| {
                f(&stitch(key), &node.byte_value, node.timestamp)
            });
    }

    pub fn reverse_each_between(&self, bounds: &Bounds, mut f: impl FnMut(&[u8], &[u8], i64) -> bool) {
        self.root
            .reverse_each_between(&mut Vec::new(), &bounds.ripped(), BYTE_VALUE, &mut |key, node| {
                f(&stitch(key), &node.byte_value, node.timestamp)
            });
    }

    pub fn each_between_index(
        &self,
        min: Option<usize>,
        max: Option<usize>,
        mut f: impl FnMut(&[u8], &[u8], i64, usize) -> bool,
    ) {
        self.root.each_between_index(
            &mut Vec::new(),
            &mut 0,
            min,
            max,
            BYTE_VALUE,
            &mut |key, node, index| f(&stitch(key), &node.byte_value, node.timestamp, index),
        );
    }

    pub fn reverse_each_between_index(
        &self,
        min: Option<usize>,
        max: Option<usize>,
        mut f: impl FnMut(&[u8], &[u8], i64, usize) -> bool,
    ) {
        self.root.reverse_each_between_index(
            &mut Vec::new(),
            &mut 0,
            min,
            max,
            BYTE_VALUE,
            &mut |key, node, index| f(&stitch(key), &node.byte_value, node.timestamp, index),
        );
    }

    /// Live entries (values and sub-trie contents) inside `bounds`.
    pub fn size_between(&self, bounds: &Bounds) -> usize {
        self.root
            .size_between(&mut Vec::new(), &bounds.ripped(), BYTE_VALUE | TREE_VALUE)
    }

    /// Timestamped entries inside `bounds`, tombstones included.
    pub fn real_size_between(&self, bounds: &Bounds) -> usize {
        self.root.size_between(&mut Vec::new(), &bounds.ripped(), 0)
    }

    /// Number of values sorting before `key`, and whether `key` holds one.
    pub fn index_of(&self, key: &[u8]) -> (usize, bool) {
        let (index, existed) = self.root.index_of(0, &rip(key), BYTE_VALUE, true);
        (index, existed & BYTE_VALUE != 0)
    }

    /// Number of values sorting after `key`, and whether `key` holds one.
    pub fn reverse_index_of(&self, key: &[u8]) -> (usize, bool) {
        let (index, existed) = self.root.index_of(0, &rip(key), BYTE_VALUE, false);
        (index, existed & BYTE_VALUE != 0)
    }

    fn first_between(&self, bounds: &Bounds, reverse: bool) -> Option<Entry> {
        let mut result = None;
        let visit = |key: &[u8], value: &[u8], timestamp: i64| {
            result = Some(Entry::new(key, value, timestamp));
            false
        };
        if reverse {
            self.reverse_each_between(bounds, visit);
        } else {
            self.each_between(bounds, visit);
        }
        result
    }

    fn at_index(&self, index: usize, reverse: bool) -> Option<Entry> {
        let mut result = None;
        let visit = |key: &[u8], value: &[u8], timestamp: i64, _: usize| {
            result = Some(Entry::new(key, value, timestamp));
            false
        };
        if reverse {
            self.reverse_each_between_index(Some(index), Some(index), visit);
        } else {
            self.each_between_index(Some(index), Some(index), visit);
        }
        result
    }

    /// First value strictly after `key`.
    pub fn next(&self, key: &[u8]) -> Option<Entry> {
        self.first_between(&Bounds::new(Some(key), None, false, false), false)
    }

    /// Last value strictly before `key`.
    pub fn prev(&self, key: &[u8]) -> Option<Entry> {
        self.first_between(&Bounds::new(None, Some(key), false, false), true)
    }

    pub fn first(&self) -> Option<Entry> {
        self.first_between(&Bounds::all(), false)
    }

    pub fn last(&self) -> Option<Entry> {
        self.first_between(&Bounds::all(), true)
    }

    pub fn index(&self, index: usize) -> Option<Entry> {
        self.at_index(index, false)
    }

    pub fn reverse_index(&self, index: usize) -> Option<Entry> {
        self.at_index(index, true)
    }

    pub fn next_index(&self, index: usize) -> Option<Entry> {
        self.at_index(index + 1, false)
    }

    pub fn prev_index(&self, index: usize) -> Option<Entry> {
        index.checked_sub(1).and_then(|index| self.at_index(index, false))
    }

    fn marker(&self, range: &KeyRange, reverse: bool) -> Option<Vec<u8>> {
        let mut result = None;
        let mut visit = |key: &[Nibble], _: &Node| {
            result = Some(stitch(key));
            false
        };
        if reverse {
            self.root.reverse_each_between(&mut Vec::new(), range, 0, &mut visit);
        } else {
            self.root.each_between(&mut Vec::new(), range, 0, &mut visit);
        }
        result
    }

    fn marker_index(&self, index: usize, reverse: bool) -> Option<Vec<u8>> {
        let mut result = None;
        let mut visit = |key: &[Nibble], _: &Node, _: usize| {
            result = Some(stitch(key));
            false
        };
        if reverse {
            self.root
                .reverse_each_between_index(&mut Vec::new(), &mut 0, Some(index), None, 0, &mut visit);
        } else {
            self.root
                .each_between_index(&mut Vec::new(), &mut 0, Some(index), None, 0, &mut visit);
        }
        result
    }

    /// First key after `key` holding anything timestamped, tombstones included.
    pub fn next_marker(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.marker(&KeyRange::exclusive_from(rip(key)), false)
    }

    /// Last key before `key` holding anything timestamped, tombstones included.
    pub fn prev_marker(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.marker(&KeyRange::exclusive_to(rip(key)), true)
    }

    /// First marker whose rank among all markers is at least `index`.
    pub fn next_marker_index(&self, index: usize) -> Option<Vec<u8>> {
        self.marker_index(index, false)
    }

    /// First marker, counting from the end, whose reverse rank is at least `index`.
    pub fn prev_marker_index(&self, index: usize) -> Option<Vec<u8>> {
        self.marker_index(index, true)
    }

    /// Scan the mirror index by value; `f` receives `(value, key, timestamp)`.
    pub fn mirror_each_between(&self, bounds: &Bounds, mut f: impl FnMut(&[u8], &[u8], i64) -> bool) {
        if let Some(mirror) = &self.mirror {
            mirror.each_between(&mirror_scan(bounds), |mirror_key, key, timestamp| {
                let value = unmirror(mirror_key, key);
                !bounds.admits(value) || f(value, key, timestamp)
            });
        }
    }

    pub fn mirror_reverse_each_between(
        &self,
        bounds: &Bounds,
        mut f: impl FnMut(&[u8], &[u8], i64) -> bool,
    ) {
        if let Some(mirror) = &self.mirror {
            mirror.reverse_each_between(&mirror_scan(bounds), |mirror_key, key, timestamp| {
                let value = unmirror(mirror_key, key);
                !bounds.admits(value) || f(value, key, timestamp)
            });
        }
    }

    pub fn mirror_each_between_index(
        &self,
        min: Option<usize>,
        max: Option<usize>,
        mut f: impl FnMut(&[u8], &[u8], i64, usize) -> bool,
    ) {
        if let Some(mirror) = &self.mirror {
            mirror.each_between_index(min, max, |mirror_key, key, timestamp, index| {
                f(unmirror(mirror_key, key), key, timestamp, index)
            });
        }
    }

    pub fn mirror_reverse_each_between_index(
        &self,
        min: Option<usize>,
        max: Option<usize>,
        mut f: impl FnMut(&[u8], &[u8], i64, usize) -> bool,
    ) {
        if let Some(mirror) = &self.mirror {
            mirror.reverse_each_between_index(min, max, |mirror_key, key, timestamp, index| {
                f(unmirror(mirror_key, key), key, timestamp, index)
            });
        }
    }

    pub fn mirror_size_between(&self, bounds: &Bounds) -> usize {
        let mut count = 0;
        self.mirror_each_between(bounds, |_, _, _| {
            count += 1;
            true
        });
        count
    }

    fn mirror_locate(&self, value: &[u8]) -> Option<Vec<u8>> {
        let mut found = None;
        if let Some(mirror) = &self.mirror {
            mirror.each_between(&Bounds::new(Some(value), None, true, false), |mirror_key, key, _| {
                if unmirror(mirror_key, key) == value {
                    found = Some(mirror_key.to_vec());
                }
                false
            });
        }
        found
    }

    /// Number of mirror entries sorting before `value`, and whether some key
    /// holds exactly `value`.
    pub fn mirror_index_of(&self, value: &[u8]) -> (usize, bool) {
        let Some(mirror) = &self.mirror else {
            return (0, false);
        };
        match self.mirror_locate(value) {
            Some(mirror_key) => (mirror.index_of(&mirror_key).0, true),
            None => (mirror.index_of(value).0, false),
        }
    }

    pub fn mirror_reverse_index_of(&self, value: &[u8]) -> (usize, bool) {
        let Some(mirror) = &self.mirror else {
            return (0, false);
        };
        match self.mirror_locate(value) {
            Some(mirror_key) => (mirror.reverse_index_of(&mirror_key).0, true),
            None => (mirror.reverse_index_of(value).0, false),
        }
    }

    /// Entry with the smallest value, as `(value, key, timestamp)`.
    pub fn mirror_first(&self) -> Option<Entry> {
        let mirror = self.mirror.as_ref()?;
        let entry = mirror.first()?;
        Some(Entry::new(unmirror(&entry.key, &entry.value), &entry.value, entry.timestamp))
    }

    /// Entry with the largest value, as `(value, key, timestamp)`.
    pub fn mirror_last(&self) -> Option<Entry> {
        let mirror = self.mirror.as_ref()?;
        let entry = mirror.last()?;
        Some(Entry::new(unmirror(&entry.key, &entry.value), &entry.value, entry.timestamp))
    }

    pub fn describe(&self) -> String {
        let mut out = String::new();
        self.describe_into(0, &mut out);
        out
    }

    pub(crate) fn describe_into(&self, indent: usize, out: &mut String) {
        use std::fmt::Write;
        let _ = writeln!(
            out,
            "{}<Trie size:{} real:{} hash:{} conf:{:?}@{}>",
            " ".repeat(indent),
            self.size(),
            self.real_size(),
            hex::encode(self.hash()),
            self.configuration.data,
            self.configuration.timestamp,
        );
        self.root.describe(indent + 2, out);
    }

    // Mutations.

    fn insert(&mut self, node: Box<Node>, usage: u8, now: i64) -> Previous {
        let root = std::mem::replace(&mut self.root, Node::structural(Vec::new()));
        let (root, previous) = Node::insert(Some(root), &[], node, usage, now);
        self.root = root;
        previous
    }

    fn delete(&mut self, key: &[Nibble], usage: u8, now: i64) -> Previous {
        let root = std::mem::replace(&mut self.root, Node::structural(Vec::new()));
        let (root, previous) = Node::delete(Some(root), &[], key, usage, now);
        self.root = root.unwrap_or_else(|| {
            let mut root = Node::structural(Vec::new());
            root.rehash(&[], now);
            root
        });
        previous
    }

    fn unmirror_value(&mut self, key: &[u8], old: &Previous, now: i64) {
        if let Some(mirror) = &mut self.mirror {
            if old.had(BYTE_VALUE) {
                mirror.del(&mirror_key(&old.bytes, key), now);
            }
        }
    }

    fn mirror_value(&mut self, key: &[u8], value: &[u8], timestamp: i64, now: i64) {
        if let Some(mirror) = &mut self.mirror {
            mirror.put(&mirror_key(value, key), key.to_vec(), timestamp, now);
        }
    }

    /// Unconditional write. Returns the displaced value.
    pub(crate) fn put(&mut self, key: &[u8], value: Vec<u8>, timestamp: i64, now: i64) -> Option<Vec<u8>> {
        let mirrored = self.mirror.as_ref().map(|_| value.clone());
        let node = Node::new(rip(key), value, None, timestamp, false, BYTE_VALUE);
        let previous = self.insert(node, BYTE_VALUE, now);
        self.data_timestamp = self.data_timestamp.max(timestamp);
        self.unmirror_value(key, &previous, now);
        if let Some(value) = mirrored {
            self.mirror_value(key, &value, timestamp, now);
        }
        previous.had(BYTE_VALUE).then_some(previous.bytes)
    }

    /// Physical delete of the value at `key`.
    pub(crate) fn del(&mut self, key: &[u8], now: i64) -> Option<(Vec<u8>, i64)> {
        let previous = self.delete(&rip(key), BYTE_VALUE, now);
        self.unmirror_value(key, &previous, now);
        previous
            .had(BYTE_VALUE)
            .then_some((previous.bytes, previous.timestamp))
    }

    /// Replace the value at `key` by a tombstone.
    pub(crate) fn fake_del(&mut self, key: &[u8], timestamp: i64, now: i64) -> Option<(Vec<u8>, i64)> {
        let previous = self.insert(Node::tombstone(rip(key), timestamp), BYTE_VALUE, now);
        self.data_timestamp = self.data_timestamp.max(timestamp);
        self.unmirror_value(key, &previous, now);
        previous
            .had(BYTE_VALUE)
            .then_some((previous.bytes, previous.timestamp))
    }

    /// Drop all content. Returns how many live entries went away.
    pub(crate) fn clear(&mut self, timestamp: i64, now: i64) -> usize {
        let removed = self.size();
        let mut root = Node::structural(Vec::new());
        root.rehash(&[], now);
        self.root = root;
        if self.mirror.is_some() {
            self.mirror = Some(Box::new(Trie::new(now)));
        }
        self.data_timestamp = self.data_timestamp.max(timestamp);
        removed
    }

    pub(crate) fn configure(&mut self, configuration: Configuration, now: i64) {
        self.configuration = configuration;
        self.refresh_mirror(now);
    }

    /// Set one configuration entry; an empty value removes it. Returns
    /// whether anything changed.
    pub(crate) fn add_configuration(&mut self, timestamp: i64, key: &str, value: &str, now: i64) -> bool {
        let current = self.configuration.data.get(key).map(String::as_str).unwrap_or("");
        if current == value {
            return false;
        }
        let mut configuration = self.configuration.clone();
        if value.is_empty() {
            configuration.data.remove(key);
        } else {
            configuration.data.insert(key.to_string(), value.to_string());
        }
        configuration.timestamp = timestamp;
        self.configure(configuration, now);
        true
    }

    fn refresh_mirror(&mut self, now: i64) {
        if !self.configuration.is_mirrored() {
            self.mirror = None;
            return;
        }
        if self.mirror.is_none() {
            let mut mirror = Trie::new(now);
            self.each(|key, value, timestamp| {
                mirror.put(&mirror_key(value, key), key.to_vec(), timestamp, now);
                true
            });
            self.mirror = Some(Box::new(mirror));
        }
    }

    /// Write only if the stored timestamp still equals `expected`.
    pub(crate) fn put_timestamp(
        &mut self,
        key: &[Nibble],
        value: Vec<u8>,
        present: bool,
        expected: i64,
        timestamp: i64,
        now: i64,
    ) -> bool {
        if self.current_timestamp(key) != expected {
            return false;
        }
        let byte_key = stitch(key);
        let mirrored = (present && self.mirror.is_some()).then(|| value.clone());
        let usage = if present { BYTE_VALUE } else { 0 };
        let node = Node::new(key.to_vec(), value, None, timestamp, false, usage);
        let previous = self.insert(node, BYTE_VALUE, now);
        self.data_timestamp = self.data_timestamp.max(timestamp);
        self.unmirror_value(&byte_key, &previous, now);
        if let Some(value) = mirrored {
            self.mirror_value(&byte_key, &value, timestamp, now);
        }
        true
    }

    /// Physically delete only if the stored timestamp still equals `expected`.
    pub(crate) fn del_timestamp(&mut self, key: &[Nibble], expected: i64, now: i64) -> bool {
        if self.current_timestamp(key) != expected {
            return false;
        }
        let previous = self.delete(key, BYTE_VALUE, now);
        self.unmirror_value(&stitch(key), &previous, now);
        true
    }

    /// Put only when `timestamp` is strictly newer than what is stored.
    pub(crate) fn put_if_newer(&mut self, key: &[u8], value: Vec<u8>, timestamp: i64, now: i64) -> bool {
        if timestamp <= self.current_timestamp(&rip(key)) {
            return false;
        }
        self.put(key, value, timestamp, now);
        true
    }

    /// Tombstone only when `timestamp` is strictly newer than what is stored.
    pub(crate) fn fake_del_if_newer(&mut self, key: &[u8], timestamp: i64, now: i64) -> bool {
        if timestamp <= self.current_timestamp(&rip(key)) {
            return false;
        }
        self.fake_del(key, timestamp, now);
        true
    }

    // Sub-trie plumbing: read the nested trie out of its node, change it,
    // and write it back so the path to the root is rehashed.

    fn take_sub(&mut self, key: &[Nibble]) -> (Option<Box<Trie>>, i64) {
        match self.root.find_mut(key) {
            Some(node) => (node.tree_value.take(), node.timestamp),
            None => (None, 0),
        }
    }

    fn store_sub(&mut self, key: &[Nibble], sub: Box<Trie>, node_timestamp: i64, now: i64) {
        let node = Node::new(key.to_vec(), Vec::new(), Some(sub), node_timestamp, false, TREE_VALUE);
        self.insert(node, TREE_VALUE, now);
    }

    /// Apply `f` to the sub-trie at `key`, creating it first when `create`
    /// is set. `policy` decides whether a sub-trie left without entries stays.
    pub(crate) fn modify_sub<R>(
        &mut self,
        key: &[Nibble],
        create: bool,
        policy: EmptySubTrie,
        now: i64,
        f: impl FnOnce(&mut Trie) -> R,
    ) -> Option<R> {
        let (existing, node_timestamp) = self.take_sub(key);
        let created = existing.is_none();
        let mut sub = match existing {
            Some(sub) => sub,
            None if create => Box::new(Trie::new(now)),
            None => return None,
        };
        let result = f(&mut sub);
        let drop = match policy {
            EmptySubTrie::Keep => false,
            EmptySubTrie::Drop => true,
            EmptySubTrie::DropIfCreated => created,
        };
        if drop && sub.real_size() == 0 {
            self.delete(key, TREE_VALUE, now);
        } else {
            self.store_sub(key, sub, node_timestamp, now);
        }
        Some(result)
    }

    /// Remove the sub-trie at `key` entirely. Returns its live size.
    pub(crate) fn kill_sub(&mut self, key: &[Nibble], now: i64) -> usize {
        let previous = self.delete(key, TREE_VALUE, now);
        previous.tree.map_or(0, |tree| tree.size())
    }

    pub(crate) fn sub_clear_timestamp(&mut self, key: &[Nibble], expected: i64, timestamp: i64, now: i64) -> usize {
        let matches = self
            .root
            .find(key)
            .and_then(Node::sub_trie)
            .is_some_and(|sub| sub.data_timestamp() == expected);
        if !matches {
            return 0;
        }
        self.modify_sub(key, false, EmptySubTrie::Keep, now, |sub| sub.clear(timestamp, now))
            .unwrap_or(0)
    }

    pub(crate) fn sub_kill_timestamp(&mut self, key: &[Nibble], expected: i64, now: i64) -> usize {
        let matches = self
            .root
            .find(key)
            .and_then(Node::sub_trie)
            .is_some_and(|sub| sub.data_timestamp() == expected);
        if !matches {
            return 0;
        }
        self.kill_sub(key, now)
    }

    pub fn sub_finger(&self, key: &[Nibble], sub_key: &[Nibble]) -> Print {
        match self.root.find(key).and_then(Node::sub_trie) {
            Some(sub) => sub.finger(sub_key),
            None => Print::default(),
        }
    }

    pub fn sub_get_timestamp(&self, key: &[Nibble], sub_key: &[Nibble]) -> Versioned {
        match self.root.find(key).and_then(Node::sub_trie) {
            Some(sub) => sub.get_timestamp(sub_key),
            None => Versioned::default(),
        }
    }

    pub fn sub_configuration(&self, key: &[Nibble]) -> Configuration {
        self.root
            .find(key)
            .and_then(Node::sub_trie)
            .map(|sub| sub.configuration.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn mirrored() -> Configuration {
        let mut data = BTreeMap::new();
        data.insert("mirrored".to_string(), "yes".to_string());
        Configuration::new(data, 1)
    }

    #[test]
    fn test_put_get_del() {
        let mut trie = Trie::new(1);
        assert_eq!(trie.put(b"k", b"v".to_vec(), 1, 1), None);
        assert_eq!(trie.put(b"k", b"w".to_vec(), 2, 1), Some(b"v".to_vec()));
        assert_eq!(trie.get(b"k"), Some((b"w".to_vec(), 2)));
        assert_eq!(trie.del(b"k", 1), Some((b"w".to_vec(), 2)));
        assert_eq!(trie.get(b"k"), None);
        assert_eq!(trie.hash(), Trie::new(1).hash());
    }

    #[test]
    fn test_fake_del_leaves_marker() {
        let mut trie = Trie::new(1);
        trie.put(b"a", b"1".to_vec(), 1, 1);
        trie.put(b"b", b"2".to_vec(), 2, 1);
        trie.fake_del(b"a", 3, 1);
        assert_eq!(trie.get(b"a"), None);
        assert_eq!(trie.size(), 1);
        assert_eq!(trie.real_size(), 2);
        assert_eq!(trie.next_marker(b""), Some(b"a".to_vec()));
        assert_eq!(trie.first().map(|entry| entry.key), Some(b"b".to_vec()));
    }

    #[test]
    fn test_put_timestamp_requires_expected() {
        let mut trie = Trie::new(1);
        let key = rip(b"x");
        assert!(!trie.put_timestamp(&key, b"v".to_vec(), true, 5, 10, 1));
        assert!(trie.put_timestamp(&key, b"v".to_vec(), true, 0, 10, 1));
        assert!(!trie.put_timestamp(&key, b"w".to_vec(), true, 0, 11, 1));
        assert_eq!(trie.get_timestamp(&key).timestamp, 10);
        assert!(trie.put_timestamp(&key, Vec::new(), false, 10, 12, 1));
        assert_eq!(trie.get(b"x"), None);
        assert!(trie.del_timestamp(&key, 12, 1));
        assert_eq!(trie.real_size(), 0);
    }

    #[test]
    fn test_put_if_newer() {
        let mut trie = Trie::new(1);
        assert!(trie.put_if_newer(b"k", b"new".to_vec(), 5, 1));
        assert!(!trie.put_if_newer(b"k", b"old".to_vec(), 3, 1));
        assert!(!trie.put_if_newer(b"k", b"tie".to_vec(), 5, 1));
        assert_eq!(trie.get(b"k"), Some((b"new".to_vec(), 5)));
        assert!(!trie.fake_del_if_newer(b"k", 4, 1));
        assert!(trie.fake_del_if_newer(b"k", 6, 1));
        assert_eq!(trie.get(b"k"), None);
    }

    #[test]
    fn test_data_timestamp_never_moves_back() {
        let mut trie = Trie::new(1);
        trie.put(b"a", b"1".to_vec(), 50, 1);
        trie.put(b"b", b"2".to_vec(), 30, 1);
        assert_eq!(trie.data_timestamp(), 50);
        trie.fake_del(b"a", 20, 1);
        assert_eq!(trie.data_timestamp(), 50);
        assert!(trie.put_timestamp(&rip(b"c"), b"3".to_vec(), true, 0, 40, 1));
        assert_eq!(trie.data_timestamp(), 50);
        trie.clear(10, 1);
        assert_eq!(trie.data_timestamp(), 50);
        trie.put(b"d", b"4".to_vec(), 60, 1);
        assert_eq!(trie.data_timestamp(), 60);
    }

    #[test]
    fn test_ranks_and_neighbours() {
        let mut trie = Trie::new(1);
        for (i, key) in [b"a", b"b", b"c", b"d"].iter().enumerate() {
            trie.put(*key, vec![i as u8], i as i64 + 1, 1);
        }
        assert_eq!(trie.index_of(b"c"), (2, true));
        assert_eq!(trie.reverse_index_of(b"c"), (1, true));
        assert_eq!(trie.next(b"b").map(|e| e.key), Some(b"c".to_vec()));
        assert_eq!(trie.prev(b"b").map(|e| e.key), Some(b"a".to_vec()));
        assert_eq!(trie.index(3).map(|e| e.key), Some(b"d".to_vec()));
        assert_eq!(trie.reverse_index(0).map(|e| e.key), Some(b"d".to_vec()));
        assert_eq!(trie.next_index(0).map(|e| e.key), Some(b"b".to_vec()));
        assert_eq!(trie.prev_index(0), None);
        assert_eq!(trie.last().map(|e| e.key), Some(b"d".to_vec()));
        let bounds = Bounds::new(Some(b"b"), Some(b"d"), true, false);
        assert_eq!(trie.size_between(&bounds), 2);
    }

    #[test]
    fn test_mirror_tracks_values() {
        let mut trie = Trie::new(1);
        trie.put(b"x", vec![3], 1, 1);
        trie.configure(mirrored(), 1);
        trie.put(b"y", vec![1], 2, 1);
        trie.put(b"z", vec![2], 3, 1);
        trie.put(b"y", vec![4], 4, 1);

        let mut seen = Vec::new();
        trie.mirror_each_between(&Bounds::all(), |value, key, _| {
            seen.push((value.to_vec(), key.to_vec()));
            true
        });
        assert_eq!(
            seen,
            vec![
                (vec![2], b"z".to_vec()),
                (vec![3], b"x".to_vec()),
                (vec![4], b"y".to_vec()),
            ]
        );
        assert_eq!(trie.mirror_index_of(&[3]), (1, true));
        assert_eq!(trie.mirror_first().map(|e| e.value), Some(b"z".to_vec()));
        trie.del(b"x", 1);
        assert_eq!(trie.mirror_size_between(&Bounds::all()), 2);
    }

    #[test]
    fn test_sub_trie_prunes_when_emptied() {
        let mut trie = Trie::new(1);
        let key = rip(b"s");
        trie.modify_sub(&key, true, EmptySubTrie::Keep, 1, |sub| sub.put(b"a", b"1".to_vec(), 1, 1));
        assert_eq!(trie.size(), 1);
        assert!(trie.sub(b"s").is_some());
        trie.modify_sub(&key, false, EmptySubTrie::Drop, 1, |sub| sub.del(b"a", 1));
        assert!(trie.sub(b"s").is_none());
        assert_eq!(trie.hash(), Trie::new(1).hash());
    }

    #[test]
    fn test_add_configuration_reports_change() {
        let mut trie = Trie::new(1);
        assert!(trie.add_configuration(2, "mirrored", "yes", 1));
        assert!(trie.is_mirrored());
        assert!(!trie.add_configuration(3, "mirrored", "yes", 1));
        assert!(trie.add_configuration(4, "mirrored", "", 1));
        assert!(!trie.is_mirrored());
        assert_eq!(trie.configuration().timestamp, 4);
    }
}

//! Trie node and the structural operations on it.
//!
//! Every function here takes ownership of a subtree and hands back the
//! (possibly replaced) subtree, so a parent simply stores whatever comes
//! back into the child slot it took it from.

use super::digest::{value_digest, Digest, Hasher};
use super::print::{Print, SubPrint};
use super::trie::Trie;
use super::{join, Nibble, BYTE_VALUE, TREE_VALUE, ZOMBIE_LIFETIME};

pub(crate) type Child = Option<Box<Node>>;

/// One path-compressed trie node.
#[derive(Debug)]
pub struct Node {
    pub(crate) segment: Vec<Nibble>,
    pub(crate) byte_value: Vec<u8>,
    pub(crate) byte_hash: Digest,
    pub(crate) tree_value: Option<Box<Trie>>,
    pub(crate) timestamp: i64,
    pub(crate) hash: Digest,
    pub(crate) children: [Child; 16],
    pub(crate) empty: bool,
    pub(crate) usage: u8,
    pub(crate) tree_size: usize,
    pub(crate) byte_size: usize,
    pub(crate) real_size: usize,
}

/// What an insert or delete displaced.
#[derive(Debug, Default)]
pub(crate) struct Previous {
    pub bytes: Vec<u8>,
    pub tree: Option<Box<Trie>>,
    pub timestamp: i64,
    pub existed: u8,
}

impl Previous {
    pub fn had(&self, usage: u8) -> bool {
        self.existed & usage != 0
    }
}

impl Node {
    pub(crate) fn new(
        segment: Vec<Nibble>,
        byte_value: Vec<u8>,
        tree_value: Option<Box<Trie>>,
        timestamp: i64,
        empty: bool,
        usage: u8,
    ) -> Box<Node> {
        let byte_hash = value_digest(&byte_value, usage & BYTE_VALUE != 0);
        Box::new(Node {
            segment,
            byte_value,
            byte_hash,
            tree_value,
            timestamp,
            hash: Digest::default(),
            children: Default::default(),
            empty,
            usage,
            tree_size: 0,
            byte_size: 0,
            real_size: 0,
        })
    }

    /// A branch point without content of its own.
    pub(crate) fn structural(segment: Vec<Nibble>) -> Box<Node> {
        Self::new(segment, Vec::new(), None, 0, true, 0)
    }

    /// A deletion marker.
    pub(crate) fn tombstone(segment: Vec<Nibble>, timestamp: i64) -> Box<Node> {
        Self::new(segment, Vec::new(), None, timestamp, false, 0)
    }

    /// The live byte value, if any.
    pub fn value(&self) -> Option<&[u8]> {
        (self.usage & BYTE_VALUE != 0).then_some(self.byte_value.as_slice())
    }

    pub fn sub_trie(&self) -> Option<&Trie> {
        self.tree_value.as_deref()
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn usage(&self) -> u8 {
        self.usage
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn is_tombstone(&self) -> bool {
        self.usage == 0 && !self.empty
    }

    pub fn hash(&self) -> Digest {
        self.hash
    }

    fn child_count(&self) -> usize {
        self.children.iter().filter(|child| child.is_some()).count()
    }

    /// Number of entries this node itself contributes under `usage`.
    /// `usage == 0` counts markers: anything timestamped, tombstones included.
    pub(crate) fn own_size(&self, usage: u8) -> usize {
        if self.empty {
            return 0;
        }
        if usage == 0 {
            let own = usize::from(self.timestamp != 0);
            return own + self.tree_value.as_ref().map_or(0, |tree| tree.real_size());
        }
        let mut result = 0;
        if usage & BYTE_VALUE & self.usage != 0 {
            result += 1;
        }
        if usage & TREE_VALUE & self.usage != 0 {
            result += self.tree_value.as_ref().map_or(0, |tree| tree.size());
        }
        result
    }

    /// Number of entries in the whole subtree under `usage`.
    pub(crate) fn sizes(&self, usage: u8) -> usize {
        if usage == 0 {
            return self.real_size;
        }
        let mut result = 0;
        if usage & BYTE_VALUE != 0 {
            result += self.byte_size;
        }
        if usage & TREE_VALUE != 0 {
            result += self.tree_size;
        }
        result
    }

    /// Recompute counters and hash from own content and children, collecting
    /// expired children on the way. `key` is the full nibble path of this node.
    ///
    /// The hash covers the path, the live bytes, the sub-trie hash and the
    /// child hashes. Timestamps and the `empty` flag are left out, so replicas
    /// holding the same bytes under different timestamps compare equal and
    /// anti-entropy leaves their timestamps alone.
    pub(crate) fn rehash(&mut self, key: &[Nibble], now: i64) {
        self.byte_size = usize::from(self.usage & BYTE_VALUE != 0);
        self.tree_size = 0;
        self.real_size = usize::from(self.timestamp != 0);
        if let Some(tree) = &self.tree_value {
            self.real_size += tree.real_size();
            if self.usage & TREE_VALUE != 0 {
                self.tree_size = tree.size();
            }
        }

        let mut hasher = Hasher::new();
        hasher.update(key).update(&self.byte_hash);
        if let Some(tree) = &self.tree_value {
            hasher.update(&tree.hash());
        }
        for slot in self.children.iter_mut() {
            if let Some(child) = slot.take() {
                *slot = Self::gc(child, key, now);
            }
            if let Some(child) = slot {
                hasher.update(&child.hash);
                self.byte_size += child.byte_size;
                self.tree_size += child.tree_size;
                self.real_size += child.real_size;
            }
        }
        self.hash = hasher.finish();
    }

    /// Drop expired empty sub-tries and expired tombstones.
    fn gc(mut node: Box<Node>, prefix: &[Nibble], now: i64) -> Child {
        let horizon = now.saturating_sub(ZOMBIE_LIFETIME);
        let stale_tree = node
            .tree_value
            .as_ref()
            .is_some_and(|tree| tree.real_size() == 0 && tree.data_timestamp() < horizon);
        if stale_tree {
            node.tree_value = None;
            node.usage &= !TREE_VALUE;
            node.rehash(&join(prefix, &node.segment), now);
        }
        if node.is_tombstone() && node.timestamp < horizon {
            let segment = node.segment.clone();
            return Self::delete(Some(node), prefix, &segment, 0, now).0;
        }
        Some(node)
    }

    /// Swap in the content of `n` for the bits named by `usage`.
    fn replace(&mut self, n: Box<Node>, usage: u8) -> Previous {
        let mut previous = Previous {
            timestamp: self.timestamp,
            existed: self.usage,
            ..Default::default()
        };
        let n = *n;
        if usage & BYTE_VALUE != 0 {
            previous.bytes = std::mem::replace(&mut self.byte_value, n.byte_value);
            self.byte_hash = n.byte_hash;
            self.usage = (self.usage & !BYTE_VALUE) | (n.usage & BYTE_VALUE);
        }
        if usage & TREE_VALUE != 0 {
            previous.tree = std::mem::replace(&mut self.tree_value, n.tree_value);
            self.usage = (self.usage & !TREE_VALUE) | (n.usage & TREE_VALUE);
        }
        self.empty = n.empty;
        self.timestamp = n.timestamp;
        previous
    }

    /// Clear the bits named by `usage`, keeping the rest of the node.
    fn strip(&mut self, usage: u8) -> Previous {
        let mut previous = Previous {
            timestamp: self.timestamp,
            existed: self.usage,
            ..Default::default()
        };
        if usage & BYTE_VALUE != 0 {
            previous.bytes = std::mem::take(&mut self.byte_value);
            self.byte_hash = value_digest(&[], false);
            self.usage &= !BYTE_VALUE;
        }
        if usage & TREE_VALUE != 0 {
            previous.tree = self.tree_value.take();
            self.usage &= !TREE_VALUE;
        }
        previous
    }

    /// Replace a content-less node by its only child, or by nothing.
    fn collapse(mut self: Box<Self>) -> Child {
        let index = self.children.iter().position(Option::is_some)?;
        let mut child = self.children[index].take()?;
        let mut segment = std::mem::take(&mut self.segment);
        segment.extend_from_slice(&child.segment);
        child.segment = segment;
        Some(child)
    }

    /// Insert `n` (whose segment is the remaining key below `prefix`).
    pub(crate) fn insert(
        slot: Child,
        prefix: &[Nibble],
        mut n: Box<Node>,
        usage: u8,
        now: i64,
    ) -> (Box<Node>, Previous) {
        let Some(mut current) = slot else {
            n.rehash(&join(prefix, &n.segment), now);
            return (n, Previous::default());
        };
        let mut i = 0;
        loop {
            let beyond_n = i >= n.segment.len();
            let beyond_self = i >= current.segment.len();
            if beyond_n && beyond_self {
                let previous = current.replace(n, usage);
                current.rehash(&join(prefix, &current.segment), now);
                return (current, previous);
            } else if beyond_n {
                current.segment.drain(..i);
                let key = join(prefix, &n.segment);
                current.rehash(&join(&key, &current.segment), now);
                let index = current.segment[0] as usize;
                n.children[index] = Some(current);
                n.rehash(&key, now);
                return (n, Previous::default());
            } else if beyond_self {
                n.segment.drain(..i);
                let key = join(prefix, &current.segment);
                let index = n.segment[0] as usize;
                let (child, previous) =
                    Self::insert(current.children[index].take(), &key, n, usage, now);
                current.children[index] = Some(child);
                current.rehash(&key, now);
                return (current, previous);
            } else if n.segment[i] != current.segment[i] {
                let mut parent = Node::structural(n.segment[..i].to_vec());
                n.segment.drain(..i);
                current.segment.drain(..i);
                let key = join(prefix, &parent.segment);
                n.rehash(&join(&key, &n.segment), now);
                current.rehash(&join(&key, &current.segment), now);
                let (n_index, current_index) = (n.segment[0] as usize, current.segment[0] as usize);
                parent.children[n_index] = Some(n);
                parent.children[current_index] = Some(current);
                parent.rehash(&key, now);
                return (parent, Previous::default());
            }
            i += 1;
        }
    }

    /// Remove the bits named by `usage` at `segment` below `prefix`.
    /// `usage == 0` removes the node whatever it carries.
    pub(crate) fn delete(
        slot: Child,
        prefix: &[Nibble],
        segment: &[Nibble],
        usage: u8,
        now: i64,
    ) -> (Child, Previous) {
        let Some(mut current) = slot else {
            return (None, Previous::default());
        };
        let mut i = 0;
        loop {
            let beyond_segment = i >= segment.len();
            let beyond_self = i >= current.segment.len();
            if beyond_segment && beyond_self {
                let key = join(prefix, &current.segment);
                if usage != 0 && current.usage & !usage != 0 {
                    let previous = current.strip(usage);
                    current.rehash(&key, now);
                    return (Some(current), previous);
                }
                let previous = Previous {
                    bytes: std::mem::take(&mut current.byte_value),
                    tree: current.tree_value.take(),
                    timestamp: current.timestamp,
                    existed: current.usage,
                };
                if current.child_count() > 1 || current.segment.is_empty() {
                    current.byte_hash = value_digest(&[], false);
                    current.empty = true;
                    current.usage = 0;
                    current.timestamp = 0;
                    current.rehash(&key, now);
                    return (Some(current), previous);
                }
                return (current.collapse(), previous);
            } else if beyond_segment {
                return (Some(current), Previous::default());
            } else if beyond_self {
                let key = join(prefix, &current.segment);
                let index = segment[i] as usize;
                let (child, previous) =
                    Self::delete(current.children[index].take(), &key, &segment[i..], usage, now);
                current.children[index] = child;
                if current.empty && !current.segment.is_empty() && current.child_count() < 2 {
                    return (current.collapse(), previous);
                }
                current.rehash(&key, now);
                return (Some(current), previous);
            } else if segment[i] != current.segment[i] {
                return (Some(current), Previous::default());
            }
            i += 1;
        }
    }

    /// The node exactly at `segment`, structural nodes included.
    pub(crate) fn find<'a>(&'a self, segment: &[Nibble]) -> Option<&'a Node> {
        let mut node = self;
        let mut rest = segment;
        loop {
            rest = rest.strip_prefix(node.segment.as_slice())?;
            match rest.first() {
                None => return Some(node),
                Some(&nibble) => node = node.children[nibble as usize].as_deref()?,
            }
        }
    }

    pub(crate) fn find_mut<'a>(&'a mut self, segment: &[Nibble]) -> Option<&'a mut Node> {
        let rest = segment.strip_prefix(self.segment.as_slice())?;
        match rest.first() {
            None => Some(self),
            Some(&nibble) => self.children[nibble as usize].as_deref_mut()?.find_mut(rest),
        }
    }

    /// Fingerprint of the node exactly at `segment`.
    pub(crate) fn finger(&self, segment: &[Nibble]) -> Print {
        let mut key = Vec::with_capacity(segment.len());
        let mut node = self;
        let mut rest = segment;
        loop {
            let Some(remaining) = rest.strip_prefix(node.segment.as_slice()) else {
                return Print::default();
            };
            key.extend_from_slice(&node.segment);
            rest = remaining;
            match rest.first() {
                None => return node.print(key),
                Some(&nibble) => match node.children[nibble as usize].as_deref() {
                    Some(child) => node = child,
                    None => return Print::default(),
                },
            }
        }
    }

    fn print(&self, key: Vec<Nibble>) -> Print {
        let sub_prints = self
            .children
            .iter()
            .map(|child| match child {
                Some(child) => SubPrint {
                    key: join(&key, &child.segment),
                    sum: child.hash,
                    exists: true,
                },
                None => SubPrint::default(),
            })
            .collect();
        let tree = self.tree_value.as_deref();
        Print {
            exists: true,
            key,
            empty: self.empty,
            timestamp: self.timestamp,
            sub_tree: tree.is_some(),
            sub_prints,
            byte_hash: self.byte_hash,
            tree_hash: tree.map(Trie::hash),
            tree_data_timestamp: tree.map_or(0, Trie::data_timestamp),
            tree_size: tree.map_or(0, Trie::size),
        }
    }

    /// Rank of `segment`: how many entries under `usage` sort before it
    /// (`up`) or after it (`!up`), plus the use bits found at the key.
    pub(crate) fn index_of(&self, mut count: usize, segment: &[Nibble], usage: u8, up: bool) -> (usize, u8) {
        let mut i = 0;
        loop {
            let beyond_segment = i >= segment.len();
            let beyond_self = i >= self.segment.len();
            if beyond_segment && beyond_self {
                if !up {
                    count += self.sizes(usage) - self.own_size(usage);
                }
                return (count, self.usage);
            } else if beyond_segment {
                let before = if up { 0 } else { self.sizes(usage) };
                return (count + before, 0);
            } else if beyond_self {
                if up {
                    count += self.own_size(usage);
                }
                let target = segment[i] as usize;
                let indices: Box<dyn Iterator<Item = usize>> = if up {
                    Box::new(0..16)
                } else {
                    Box::new((0..16).rev())
                };
                for index in indices {
                    let Some(child) = self.children[index].as_deref() else {
                        continue;
                    };
                    if index == target {
                        return child.index_of(count, &segment[i..], usage, up);
                    }
                    if (up && index > target) || (!up && index < target) {
                        break;
                    }
                    count += child.sizes(usage);
                }
                return (count, 0);
            } else if segment[i] != self.segment[i] {
                let precedes = if up {
                    segment[i] < self.segment[i]
                } else {
                    segment[i] > self.segment[i]
                };
                let skipped = if precedes { 0 } else { self.sizes(usage) };
                return (count + skipped, 0);
            }
            i += 1;
        }
    }

    pub(crate) fn describe(&self, indent: usize, out: &mut String) {
        use std::fmt::Write;
        let pad = " ".repeat(indent);
        let value = match self.value() {
            Some(value) => hex::encode(value),
            None if self.is_tombstone() => "<tombstone>".to_string(),
            None => "<none>".to_string(),
        };
        let _ = writeln!(
            out,
            "{pad}{:?} => {value} @{} [hash:{} real:{} byte:{} tree:{}]",
            self.segment,
            self.timestamp,
            hex::encode(self.hash),
            self.real_size,
            self.byte_size,
            self.tree_size,
        );
        if let Some(tree) = &self.tree_value {
            tree.describe_into(indent + 4, out);
        }
        for child in self.children.iter().flatten() {
            child.describe(indent + 2, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::rip;
    use super::*;

    fn build(entries: &[(&[u8], &[u8])]) -> Box<Node> {
        let mut root = Node::structural(Vec::new());
        root.rehash(&[], 1);
        for (ts, (key, value)) in entries.iter().enumerate() {
            let n = Node::new(rip(key), value.to_vec(), None, ts as i64 + 1, false, BYTE_VALUE);
            root = Node::insert(Some(root), &[], n, BYTE_VALUE, 1).0;
        }
        root
    }

    #[test]
    fn test_insert_and_find() {
        let root = build(&[(b"apple", b"1"), (b"apply", b"2"), (b"banana", b"3")]);
        assert_eq!(root.find(&rip(b"apple")).and_then(Node::value), Some(&b"1"[..]));
        assert_eq!(root.find(&rip(b"apply")).and_then(Node::value), Some(&b"2"[..]));
        assert!(root.find(&rip(b"appl")).is_none());
        assert_eq!(root.byte_size, 3);
    }

    #[test]
    fn test_hash_independent_of_insert_order() {
        let a = build(&[(b"a", b"1"), (b"ab", b"2"), (b"b", b"3")]);
        let mut b = Node::structural(Vec::new());
        b.rehash(&[], 1);
        for (key, value, ts) in [(&b"b"[..], &b"3"[..], 3), (b"ab", b"2", 2), (b"a", b"1", 1)] {
            let n = Node::new(rip(key), value.to_vec(), None, ts, false, BYTE_VALUE);
            b = Node::insert(Some(b), &[], n, BYTE_VALUE, 1).0;
        }
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn test_delete_restores_previous_hash() {
        let before = build(&[(b"a", b"1"), (b"b", b"2")]);
        let after = build(&[(b"a", b"1"), (b"b", b"2"), (b"ba", b"3")]);
        let (after, previous) = Node::delete(Some(after), &[], &rip(b"ba"), BYTE_VALUE, 1);
        assert!(previous.had(BYTE_VALUE));
        assert_eq!(previous.bytes, b"3".to_vec());
        assert_eq!(after.map(|node| node.hash), Some(before.hash));
    }

    #[test]
    fn test_delete_merges_structural_node() {
        let root = build(&[(b"aa", b"1"), (b"ab", b"2")]);
        let (root, _) = Node::delete(Some(root), &[], &rip(b"aa"), BYTE_VALUE, 1);
        let root = root.unwrap();
        let expected = build(&[(b"ab", b"2")]);
        assert_eq!(root.hash, expected.hash);
        assert_eq!(root.child_count(), 1);
    }

    #[test]
    fn test_tombstone_counts_in_real_size_only() {
        let root = build(&[(b"a", b"1")]);
        let (root, _) = Node::insert(
            Some(root),
            &[],
            Node::tombstone(rip(b"b"), 9),
            BYTE_VALUE,
            10,
        );
        assert_eq!(root.byte_size, 1);
        assert_eq!(root.real_size, 2);
        assert!(root.find(&rip(b"b")).unwrap().is_tombstone());
    }

    #[test]
    fn test_gc_collects_old_tombstone() {
        let root = build(&[(b"a", b"1")]);
        let (root, _) = Node::insert(Some(root), &[], Node::tombstone(rip(b"b"), 5), BYTE_VALUE, 6);
        let mut root = root;
        root.rehash(&[], 6 + ZOMBIE_LIFETIME);
        assert!(root.find(&rip(b"b")).is_none());
        assert_eq!(root.real_size, 1);
    }

    fn with_tombstone(root: Box<Node>, key: &[u8]) -> Box<Node> {
        Node::insert(Some(root), &[], Node::tombstone(rip(key), 5), BYTE_VALUE, 6).0
    }

    #[test]
    fn test_gc_tombstone_keeps_single_child() {
        let mut root = with_tombstone(build(&[(b"ab", b"2")]), b"a");
        assert!(root.find(&rip(b"a")).unwrap().is_tombstone());
        assert_eq!(root.real_size, 2);

        root.rehash(&[], 6 + ZOMBIE_LIFETIME);
        assert!(root.find(&rip(b"a")).is_none());
        assert_eq!(root.find(&rip(b"ab")).and_then(Node::value), Some(&b"2"[..]));
        assert_eq!(root.real_size, 1);
        assert_eq!(root.byte_size, 1);
        assert_eq!(root.hash, build(&[(b"ab", b"2")]).hash);
    }

    #[test]
    fn test_gc_tombstone_keeps_many_children() {
        let mut root = with_tombstone(build(&[(b"ab", b"2"), (b"a1", b"3")]), b"a");
        assert_eq!(root.real_size, 3);

        root.rehash(&[], 6 + ZOMBIE_LIFETIME);
        let node = root.find(&rip(b"a")).unwrap();
        assert!(node.is_empty());
        assert!(!node.is_tombstone());
        assert_eq!(root.find(&rip(b"ab")).and_then(Node::value), Some(&b"2"[..]));
        assert_eq!(root.find(&rip(b"a1")).and_then(Node::value), Some(&b"3"[..]));
        assert_eq!(root.real_size, 2);
        assert_eq!(root.hash, build(&[(b"ab", b"2"), (b"a1", b"3")]).hash);
    }

    #[test]
    fn test_gc_young_tombstone_survives() {
        let mut root = with_tombstone(build(&[(b"ab", b"2")]), b"a");
        root.rehash(&[], 4 + ZOMBIE_LIFETIME);
        assert!(root.find(&rip(b"a")).unwrap().is_tombstone());
        assert_eq!(root.real_size, 2);
    }

    #[test]
    fn test_gc_drops_stale_empty_sub_trie() {
        let root = build(&[(b"a", b"1")]);
        let stale = Node::new(rip(b"s"), Vec::new(), Some(Box::new(Trie::new(5))), 5, false, TREE_VALUE);
        let (root, _) = Node::insert(Some(root), &[], stale, TREE_VALUE, 6);
        let fresh = Node::new(
            rip(b"u"),
            Vec::new(),
            Some(Box::new(Trie::new(6 + ZOMBIE_LIFETIME))),
            6,
            false,
            TREE_VALUE,
        );
        let (mut root, _) = Node::insert(Some(root), &[], fresh, TREE_VALUE, 6);
        assert!(root.find(&rip(b"s")).and_then(Node::sub_trie).is_some());

        root.rehash(&[], 6 + ZOMBIE_LIFETIME);
        assert!(root.find(&rip(b"s")).is_none());
        assert!(root.find(&rip(b"u")).and_then(Node::sub_trie).is_some());
        assert_eq!(root.find(&rip(b"a")).and_then(Node::value), Some(&b"1"[..]));
        assert_eq!(root.real_size, 2);
    }

    #[test]
    fn test_index_of_counts_preceding() {
        let root = build(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3"), (b"d", b"4")]);
        assert_eq!(root.index_of(0, &rip(b"c"), BYTE_VALUE, true), (2, BYTE_VALUE));
        assert_eq!(root.index_of(0, &rip(b"c"), BYTE_VALUE, false), (1, BYTE_VALUE));
        assert_eq!(root.index_of(0, &rip(b"bb"), BYTE_VALUE, true), (2, 0));
        assert_eq!(root.index_of(0, &rip(b"0"), BYTE_VALUE, true), (0, 0));
        assert_eq!(root.index_of(0, &rip(b"z"), BYTE_VALUE, true), (4, 0));
    }

    #[test]
    fn test_finger_missing_key() {
        let root = build(&[(b"a", b"1")]);
        assert!(!root.finger(&rip(b"b")).exists);
        let print = root.finger(&rip(b"a"));
        assert!(print.exists);
        assert_eq!(print.key, rip(b"a"));
        assert_eq!(print.timestamp, 1);
    }
}

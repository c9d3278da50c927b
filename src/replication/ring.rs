//! Ring Topology
//!
//! Sorted set of ring members with circular neighbour lookups. No networking:
//! the membership protocol keeps it current.
//!
//! Changes are published on a broadcast channel after the lock is released,
//! so subscribers may call straight back into the ring.

use crate::replication::types::{Remote, StoreError, POSITION_SIZE};
use crate::trie::{Digest, Hasher};
use parking_lot::RwLock;
use std::cmp::Ordering;
use tokio::sync::broadcast;

/// Whether `needle` lies in `[from, to)` on the circle. An empty interval
/// (`from == to`) covers the whole circle.
pub fn between_ie(needle: &[u8], from: &[u8], to: &[u8]) -> bool {
    match from.cmp(to) {
        Ordering::Equal => true,
        Ordering::Less => from <= needle && needle < to,
        Ordering::Greater => from <= needle || needle < to,
    }
}

/// Whether `needle` lies in `[from, to]` on the circle.
pub fn between_ii(needle: &[u8], from: &[u8], to: &[u8]) -> bool {
    match from.cmp(to) {
        Ordering::Equal => true,
        Ordering::Less => from <= needle && needle <= to,
        Ordering::Greater => from <= needle || needle <= to,
    }
}

/// Position as a point on the 2^128 circle. Positions compare as byte
/// strings, so shorter ones are padded on the right.
fn position_value(pos: &[u8]) -> u128 {
    let mut bytes = [0u8; POSITION_SIZE];
    let len = pos.len().min(POSITION_SIZE);
    bytes[..len].copy_from_slice(&pos[..len]);
    u128::from_be_bytes(bytes)
}

/// Consistent-hash ring of members, sorted by (position, address) and unique
/// by address.
pub struct Ring {
    nodes: RwLock<Vec<Remote>>,
    changes: broadcast::Sender<Vec<Remote>>,
}

impl Default for Ring {
    fn default() -> Self {
        Self::new()
    }
}

impl Ring {
    pub fn new() -> Self {
        Self::with_nodes(Vec::new())
    }

    pub fn with_nodes(nodes: Vec<Remote>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            nodes: RwLock::new(normalize(nodes)),
            changes,
        }
    }

    /// Receive the member list every time it changes.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<Remote>> {
        self.changes.subscribe()
    }

    pub fn nodes(&self) -> Vec<Remote> {
        self.nodes.read().clone()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Number of replicas a key can have: `redundancy` capped by the size of
    /// the ring.
    pub fn redundancy(&self, redundancy: usize) -> usize {
        self.len().min(redundancy)
    }

    pub fn hash(&self) -> Digest {
        hash_nodes(&self.nodes.read())
    }

    pub fn describe(&self) -> String {
        self.nodes
            .read()
            .iter()
            .map(|remote| remote.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Run `f` on the member list and publish the result if the ring hash
    /// changed.
    fn mutate<R>(&self, f: impl FnOnce(&mut Vec<Remote>) -> R) -> R {
        let (result, changed) = {
            let mut nodes = self.nodes.write();
            let before = hash_nodes(&nodes);
            let result = f(&mut *nodes);
            let changed = (hash_nodes(&nodes) != before).then(|| nodes.clone());
            (result, changed)
        };
        if let Some(nodes) = changed {
            // No subscribers is fine.
            let _ = self.changes.send(nodes);
        }
        result
    }

    /// Replace the member list wholesale.
    pub fn set_nodes(&self, nodes: Vec<Remote>) {
        let nodes = normalize(nodes);
        self.mutate(|current| *current = nodes);
    }

    /// Insert `remote`, or move it if its address is already present at a
    /// different position.
    pub fn add(&self, remote: Remote) {
        self.mutate(|nodes| {
            if let Some(index) = nodes.iter().position(|current| current.addr == remote.addr) {
                if nodes[index].pos == remote.pos {
                    return;
                }
                nodes.remove(index);
            }
            let index = nodes.partition_point(|current| *current <= remote);
            nodes.insert(index, remote);
        });
    }

    /// Remove the member with `remote`'s address. The last member can never
    /// be removed.
    pub fn remove(&self, remote: &Remote) -> Result<(), StoreError> {
        self.mutate(|nodes| {
            let Some(index) = nodes.iter().position(|current| current.addr == remote.addr) else {
                return Ok(());
            };
            if nodes.len() == 1 {
                return Err(StoreError::LastMember);
            }
            nodes.remove(index);
            Ok(())
        })
    }

    /// Circular predecessor of `remote`, which need not be a member.
    pub fn predecessor(&self, remote: &Remote) -> Option<Remote> {
        let nodes = self.nodes.read();
        if nodes.is_empty() {
            return None;
        }
        let index = nodes.partition_point(|current| current < remote);
        let index = if index > 0 && index < nodes.len() {
            index - 1
        } else {
            nodes.len() - 1
        };
        Some(nodes[index].clone())
    }

    /// Circular successor of `remote`, which need not be a member.
    pub fn successor(&self, remote: &Remote) -> Option<Remote> {
        let nodes = self.nodes.read();
        if nodes.is_empty() {
            return None;
        }
        let index = nodes.partition_point(|current| current <= remote);
        let index = if index < nodes.len() { index } else { 0 };
        Some(nodes[index].clone())
    }

    /// The member before `pos`, the first member at exactly `pos` (if any)
    /// and the first member after `pos`.
    pub fn remotes(&self, pos: &[u8]) -> (Option<Remote>, Option<Remote>, Option<Remote>) {
        let nodes = self.nodes.read();
        let (before, at, after) = position_indices(&nodes, pos);
        let pick = |index: Option<usize>| index.map(|index| nodes[index].clone());
        (pick(before), pick(at), pick(after))
    }

    /// Midpoint of the largest gap between consecutive members, used to place
    /// a joining member.
    pub fn get_slot(&self) -> Vec<u8> {
        let nodes = self.nodes.read();
        if nodes.is_empty() {
            return vec![0; POSITION_SIZE];
        }
        let mut biggest_gap = 0u128;
        let mut biggest_index = 0;
        for (index, node) in nodes.iter().enumerate() {
            let this = position_value(&node.pos);
            let gap = match nodes.get(index + 1) {
                Some(next) => position_value(&next.pos).wrapping_sub(this),
                None => match position_value(&nodes[0].pos).wrapping_sub(this) {
                    // Every member at one point: the gap is the whole circle.
                    0 => u128::MAX,
                    gap => gap,
                },
            };
            if gap > biggest_gap {
                biggest_gap = gap;
                biggest_index = index;
            }
        }
        let half = if biggest_gap == u128::MAX {
            1 << 127
        } else {
            biggest_gap / 2
        };
        let slot = position_value(&nodes[biggest_index].pos).wrapping_add(half);
        slot.to_be_bytes().to_vec()
    }

    /// Drop every member strictly between `predecessor` and `successor`,
    /// walking the circle upwards from `predecessor`.
    pub fn clean(&self, predecessor: &Remote, successor: &Remote) {
        self.mutate(|nodes| {
            if nodes.is_empty() {
                return;
            }
            let (_, _, from) = remote_indices(nodes, predecessor);
            let (_, at, after) = remote_indices(nodes, successor);
            let to = at.unwrap_or(after);
            if from > to {
                nodes.truncate(from);
                nodes.drain(..to);
            } else {
                nodes.drain(from..to);
            }
        });
    }
}

fn normalize(mut nodes: Vec<Remote>) -> Vec<Remote> {
    nodes.sort();
    let mut seen = std::collections::HashSet::new();
    nodes.retain(|remote| seen.insert(remote.addr.clone()));
    nodes
}

fn hash_nodes(nodes: &[Remote]) -> Digest {
    let mut hasher = Hasher::new();
    for node in nodes {
        hasher.update(&node.pos).update(node.addr.as_bytes()).update(&[0]);
    }
    hasher.finish()
}

/// Indices of the member before `pos`, the first member at `pos` and the
/// first member after `pos`, all circular.
fn position_indices(nodes: &[Remote], pos: &[u8]) -> (Option<usize>, Option<usize>, Option<usize>) {
    if nodes.is_empty() {
        return (None, None, None);
    }
    let len = nodes.len();
    let index = nodes.partition_point(|node| node.pos.as_slice() < pos);
    if index == len {
        return (Some(len - 1), None, Some(0));
    }
    let before = if index == 0 { len - 1 } else { index - 1 };
    if nodes[index].pos == pos {
        let after = nodes.partition_point(|node| node.pos.as_slice() <= pos);
        (Some(before), Some(index), Some(if after < len { after } else { 0 }))
    } else {
        (Some(before), None, Some(index))
    }
}

/// Like [`position_indices`] but ordering by the full (position, address).
fn remote_indices(nodes: &[Remote], remote: &Remote) -> (usize, Option<usize>, usize) {
    let len = nodes.len();
    let index = nodes.partition_point(|node| node < remote);
    if index == len {
        return (len - 1, None, 0);
    }
    let before = if index == 0 { len - 1 } else { index - 1 };
    if nodes[index] == *remote {
        let after = nodes.partition_point(|node| node <= remote);
        (before, Some(index), if after < len { after } else { 0 })
    } else {
        (before, None, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(pos: u8, addr: &str) -> Remote {
        Remote::new(vec![pos], addr)
    }

    fn build_ring() -> (Ring, Vec<Remote>) {
        let ring = Ring::new();
        let mut expected = Vec::new();
        for (pos, addr) in [(0, "a"), (1, "b"), (2, "c"), (3, "d"), (4, "e"), (6, "f"), (7, "g")] {
            ring.add(remote(pos, addr));
            expected.push(remote(pos, addr));
        }
        (ring, expected)
    }

    fn assert_indices(ring: &Ring, pos: u8, before: Option<u8>, at: Option<u8>, after: Option<u8>) {
        let (b, m, a) = ring.remotes(&[pos]);
        assert_eq!(b.map(|r| r.pos[0]), before, "before {}", pos);
        assert_eq!(m.map(|r| r.pos[0]), at, "at {}", pos);
        assert_eq!(a.map(|r| r.pos[0]), after, "after {}", pos);
    }

    #[test]
    fn test_ring_indices() {
        let (ring, _) = build_ring();
        assert_indices(&ring, 0, Some(7), Some(0), Some(1));
        assert_indices(&ring, 1, Some(0), Some(1), Some(2));
        assert_indices(&ring, 2, Some(1), Some(2), Some(3));
        assert_indices(&ring, 3, Some(2), Some(3), Some(4));
        assert_indices(&ring, 4, Some(3), Some(4), Some(6));
        assert_indices(&ring, 5, Some(4), None, Some(6));
        assert_indices(&ring, 6, Some(4), Some(6), Some(7));
        assert_indices(&ring, 7, Some(6), Some(7), Some(0));
    }

    #[test]
    fn test_remotes_between_members() {
        let (ring, _) = build_ring();
        let (before, at, after) = ring.remotes(&[5]);
        assert_eq!(before, Some(remote(4, "e")));
        assert_eq!(at, None);
        assert_eq!(after, Some(remote(6, "f")));
    }

    #[test]
    fn test_ring_clean() {
        let (ring, mut expected) = build_ring();
        ring.clean(&remote(0, "a"), &remote(2, "c"));
        expected.remove(1);
        assert_eq!(ring.nodes(), expected);

        let (ring, expected) = build_ring();
        ring.clean(&remote(0, "a"), &remote(1, "b"));
        assert_eq!(ring.nodes(), expected);

        let (ring, expected) = build_ring();
        ring.clean(&remote(4, "e"), &remote(6, "f"));
        assert_eq!(ring.nodes(), expected);

        let (ring, expected) = build_ring();
        ring.clean(&remote(7, "g"), &remote(0, "a"));
        assert_eq!(ring.nodes(), expected);

        let (ring, expected) = build_ring();
        ring.clean(&remote(7, "g"), &remote(1, "b"));
        assert_eq!(ring.nodes(), expected[1..].to_vec());

        let (ring, expected) = build_ring();
        ring.clean(&remote(6, "f"), &remote(0, "a"));
        assert_eq!(ring.nodes(), expected[..6].to_vec());

        let (ring, expected) = build_ring();
        ring.clean(&remote(3, "d"), &remote(3, "d"));
        assert_eq!(ring.nodes(), expected[3..4].to_vec());
    }

    #[test]
    fn test_ring_clean_to_absent_member() {
        let (ring, expected) = build_ring();
        ring.clean(&remote(0, "a"), &remote(5, "x"));
        let mut wanted = vec![expected[0].clone()];
        wanted.extend_from_slice(&expected[5..]);
        assert_eq!(ring.nodes(), wanted);
    }

    #[test]
    fn test_ring_equal_positions() {
        let ring = Ring::new();
        let ra = remote(0, "a");
        let rb = remote(2, "b");
        let rc = remote(2, "c");
        let rd = remote(4, "d");
        let re = remote(5, "e");
        for r in [&ra, &rb, &rc, &rd, &re] {
            ring.add(r.clone());
        }
        assert_eq!(ring.predecessor(&ra), Some(re.clone()));
        assert_eq!(ring.predecessor(&remote(1, "aa")), Some(ra.clone()));
        assert_eq!(ring.predecessor(&rb), Some(ra.clone()));
        assert_eq!(ring.predecessor(&rc), Some(rb.clone()));
        assert_eq!(ring.predecessor(&remote(3, "ca")), Some(rc.clone()));
        assert_eq!(ring.predecessor(&rd), Some(rc.clone()));
        assert_eq!(ring.predecessor(&re), Some(rd.clone()));
        assert_eq!(ring.successor(&ra), Some(rb.clone()));
        assert_eq!(ring.successor(&remote(1, "aa")), Some(rb.clone()));
        assert_eq!(ring.successor(&rb), Some(rc.clone()));
        assert_eq!(ring.successor(&rc), Some(rd.clone()));
        assert_eq!(ring.successor(&remote(3, "ca")), Some(rd.clone()));
        assert_eq!(ring.successor(&rd), Some(re.clone()));
        assert_eq!(ring.successor(&re), Some(ra.clone()));

        let nodes = ring.nodes();
        assert_eq!(position_indices(&nodes, &[1]), (Some(0), None, Some(1)));
        assert_eq!(position_indices(&nodes, &[2]), (Some(0), Some(1), Some(3)));
        assert_eq!(position_indices(&nodes, &[3]), (Some(2), None, Some(3)));
        assert_eq!(position_indices(&nodes, &[4]), (Some(2), Some(3), Some(4)));
    }

    #[test]
    fn test_successor_wraps() {
        let (ring, _) = build_ring();
        assert_eq!(ring.successor(&remote(7, "g")), Some(remote(0, "a")));
        assert_eq!(ring.predecessor(&remote(0, "a")), Some(remote(7, "g")));
    }

    #[test]
    fn test_add_repositions_existing_address() {
        let (ring, _) = build_ring();
        ring.add(remote(5, "b"));
        let nodes = ring.nodes();
        assert_eq!(nodes.len(), 7);
        assert_eq!(nodes.iter().filter(|r| r.addr == "b").count(), 1);
        assert_eq!(nodes[3], remote(4, "e"));
        assert_eq!(nodes[4], remote(5, "b"));
        assert!(nodes.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_remove_last_member_fails() {
        let ring = Ring::new();
        ring.add(remote(1, "a"));
        assert_eq!(ring.remove(&remote(1, "a")), Err(StoreError::LastMember));
        ring.add(remote(2, "b"));
        assert_eq!(ring.remove(&remote(9, "a")), Ok(()));
        assert_eq!(ring.nodes(), vec![remote(2, "b")]);
    }

    #[test]
    fn test_get_slot_splits_largest_gap() {
        let ring = Ring::new();
        ring.add(Remote::new(vec![0; POSITION_SIZE], "a"));
        let slot = ring.get_slot();
        assert_eq!(slot.len(), POSITION_SIZE);
        assert_eq!(slot[0], 0x80);

        let mut quarter = vec![0; POSITION_SIZE];
        quarter[0] = 0x40;
        ring.add(Remote::new(quarter, "b"));
        // Largest gap runs from 0x40.. back round to 0x00..; its midpoint is 0xa0..
        assert_eq!(ring.get_slot()[0], 0xa0);
    }

    #[tokio::test]
    async fn test_changes_are_published_only_when_hash_changes() {
        let (ring, _) = build_ring();
        let mut changes = ring.subscribe();
        ring.add(remote(0, "a"));
        assert!(changes.try_recv().is_err());
        ring.add(remote(5, "h"));
        let nodes = changes.recv().await.unwrap();
        assert_eq!(nodes.len(), 8);
    }

    #[test]
    fn test_hash_depends_on_membership() {
        let (ring, _) = build_ring();
        let (other, _) = build_ring();
        assert_eq!(ring.hash(), other.hash());
        other.remove(&remote(3, "d")).unwrap();
        assert_ne!(ring.hash(), other.hash());
    }

    #[test]
    fn test_between() {
        assert!(between_ie(&[2], &[1], &[3]));
        assert!(!between_ie(&[3], &[1], &[3]));
        assert!(between_ii(&[3], &[1], &[3]));
        assert!(between_ie(&[0], &[5], &[1]));
        assert!(!between_ie(&[3], &[5], &[1]));
        assert!(between_ie(&[9], &[4], &[4]));
    }
}

//! Merkle Radix Trie
//!
//! Nibble-keyed, path-compressed storage engine with cached structural
//! fingerprints.
//!
//! ## Architecture
//!
//! - **Node**: one path-compressed trie node carrying an optional byte value,
//!   an optional nested [`Trie`], a timestamp and cached hash/size counters
//! - **Trie**: unsynchronized root + configuration + optional mirror index
//! - **Tree**: the lockable, clock-driven, optionally logged handle used by
//!   the rest of the system
//! - **Print**: a fingerprint of one node, the unit exchanged during
//!   anti-entropy
//!
//! ## How It Works
//!
//! 1. Every key byte is split into two nibbles, so each node has at most
//!    16 children
//! 2. Chains of single-child nodes are merged into one node with a longer
//!    segment
//! 3. Every mutation rehashes the path back to the root, keeping each node's
//!    hash a digest of its full key, value digest, sub-trie hash and children
//! 4. Deletes issued through the replication surface leave tombstones that
//!    are collected once older than [`ZOMBIE_LIFETIME`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ring_store::trie::Tree;
//! use ring_store::infrastructure::clock::ManualClock;
//!
//! let tree = Tree::new(Arc::new(ManualClock::new()));
//! tree.put(b"apple", b"red", 1);
//! assert_eq!(tree.get(b"apple"), Some((b"red".to_vec(), 1)));
//! ```

mod digest;
mod iter;
mod node;
mod print;
mod tree;
#[allow(clippy::module_inception)]
mod trie;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use digest::{digest, Digest, Hasher, DIGEST_SIZE};
pub use iter::Bounds;
pub use node::Node;
pub use print::{Print, SubPrint};
pub use tree::Tree;
pub use trie::{Entry, Trie};

/// Half of a key byte.
pub type Nibble = u8;

/// Use bit: the node carries a byte value.
pub const BYTE_VALUE: u8 = 1;

/// Use bit: the node carries a nested sub-trie.
pub const TREE_VALUE: u8 = 2;

/// How long a tombstone survives before garbage collection, in clock units
/// (nanoseconds).
pub const ZOMBIE_LIFETIME: i64 = 24 * 60 * 60 * 1_000_000_000;

/// Configuration key that turns on the value-ordered mirror index.
pub const MIRRORED: &str = "mirrored";

/// Configuration value that enables [`MIRRORED`].
pub const YES: &str = "yes";

/// Timestamped string configuration of one trie.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub data: BTreeMap<String, String>,
    pub timestamp: i64,
}

impl Configuration {
    pub fn new(data: BTreeMap<String, String>, timestamp: i64) -> Self {
        Self { data, timestamp }
    }

    pub fn is_mirrored(&self) -> bool {
        self.data.get(MIRRORED).map(String::as_str) == Some(YES)
    }
}

/// A value as seen by the replication surface: bytes, timestamp and whether
/// the bytes are live or the entry is a tombstone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub timestamp: i64,
    pub present: bool,
}

/// Split each byte into its high and low nibble.
pub fn rip(bytes: &[u8]) -> Vec<Nibble> {
    let mut nibbles = Vec::with_capacity(bytes.len() * 2);
    for byte in bytes {
        nibbles.push(byte >> 4);
        nibbles.push(byte & 0x0f);
    }
    nibbles
}

/// Join nibble pairs back into bytes. A trailing odd nibble becomes the high
/// half of a final byte.
pub fn stitch(nibbles: &[Nibble]) -> Vec<u8> {
    nibbles
        .chunks(2)
        .map(|pair| match pair {
            [high, low] => (high << 4) | low,
            [high] => high << 4,
            _ => 0,
        })
        .collect()
}

/// Key of a value inside the mirror index: `value ++ 0 ++ escape(key)`.
pub(crate) fn mirror_key(value: &[u8], key: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(value.len() + key.len() + 1);
    result.extend_from_slice(value);
    result.push(0);
    result.extend_from_slice(&escape(key));
    result
}

/// Double every zero byte so a single zero can act as a separator.
pub(crate) fn escape(bytes: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(bytes.len());
    for &byte in bytes {
        result.push(byte);
        if byte == 0 {
            result.push(0);
        }
    }
    result
}

pub(crate) fn join(prefix: &[Nibble], segment: &[Nibble]) -> Vec<Nibble> {
    let mut key = Vec::with_capacity(prefix.len() + segment.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(segment);
    key
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_rip_splits_high_then_low() {
        assert_eq!(rip(&[0xab, 0x01]), vec![0x0a, 0x0b, 0x00, 0x01]);
        assert!(rip(&[]).is_empty());
    }

    #[test]
    fn test_stitch_reverses_rip() {
        let bytes = b"hello world".to_vec();
        assert_eq!(stitch(&rip(&bytes)), bytes);
    }

    #[test]
    fn test_stitch_odd_length() {
        assert_eq!(stitch(&[0x0a, 0x0b, 0x0c]), vec![0xab, 0xc0]);
    }

    #[test]
    fn test_escape_doubles_zeros() {
        assert_eq!(escape(&[1, 0, 2]), vec![1, 0, 0, 2]);
        assert_eq!(mirror_key(&[7], &[0]), vec![7, 0, 0, 0]);
    }

    #[test]
    fn test_configuration_mirrored() {
        let mut data = BTreeMap::new();
        assert!(!Configuration::new(data.clone(), 0).is_mirrored());
        data.insert(MIRRORED.to_string(), YES.to_string());
        assert!(Configuration::new(data, 0).is_mirrored());
    }
}

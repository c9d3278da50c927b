use super::digest::Digest;
use super::Nibble;
use serde::{Deserialize, Serialize};

/// Hash of one child slot inside a [`Print`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubPrint {
    pub key: Vec<Nibble>,
    pub sum: Digest,
    pub exists: bool,
}

/// Fingerprint of a single trie node: enough to decide whether two replicas
/// differ at this node, in its value, in its sub-trie or in which children.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Print {
    pub exists: bool,
    pub key: Vec<Nibble>,
    pub empty: bool,
    pub timestamp: i64,
    pub sub_tree: bool,
    pub sub_prints: Vec<SubPrint>,
    pub byte_hash: Digest,
    pub tree_hash: Option<Digest>,
    pub tree_data_timestamp: i64,
    pub tree_size: usize,
}

impl Print {
    /// Timestamp of the node, zero when it does not exist.
    pub fn timestamp(&self) -> i64 {
        if self.exists {
            self.timestamp
        } else {
            0
        }
    }

    /// Whether `other` already holds this node's value: it carries an equal or
    /// newer timestamp, or the very same bytes. Equal timestamps keep the
    /// value already stored.
    pub fn covered_by(&self, other: &Print) -> bool {
        if !self.exists {
            return !other.exists;
        }
        other.exists && (other.timestamp >= self.timestamp || other.byte_hash == self.byte_hash)
    }

    /// Child fingerprint at `index`, or an absent one.
    pub fn sub_print(&self, index: usize) -> SubPrint {
        self.sub_prints.get(index).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn print(timestamp: i64, hash: u8) -> Print {
        Print {
            exists: true,
            timestamp,
            byte_hash: [hash; 16],
            ..Default::default()
        }
    }

    #[test]
    fn test_newer_destination_covers() {
        assert!(print(1, 1).covered_by(&print(2, 2)));
        assert!(!print(2, 1).covered_by(&print(1, 2)));
    }

    #[test]
    fn test_equal_timestamp_keeps_incumbent() {
        assert!(print(5, 1).covered_by(&print(5, 2)));
    }

    #[test]
    fn test_same_bytes_cover_older_timestamp() {
        assert!(print(9, 7).covered_by(&print(1, 7)));
    }

    #[test]
    fn test_missing_destination_never_covers() {
        assert!(!print(1, 1).covered_by(&Print::default()));
        assert!(Print::default().covered_by(&Print::default()));
        assert_eq!(Print::default().timestamp(), 0);
    }
}

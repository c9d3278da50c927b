//! Ordered traversal of a node subtree.
//!
//! Forward order visits a node before its children (a key sorts before
//! every extension of it); reverse order is the exact mirror image.

use super::node::Node;
use super::{join, rip, Nibble};
use std::cmp::Ordering;

/// Key range for ordered scans. `None` leaves that side open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bounds {
    pub min: Option<Vec<u8>>,
    pub max: Option<Vec<u8>>,
    pub min_inclusive: bool,
    pub max_inclusive: bool,
}

impl Bounds {
    /// The whole key space.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(min: Option<&[u8]>, max: Option<&[u8]>, min_inclusive: bool, max_inclusive: bool) -> Self {
        Self {
            min: min.map(<[u8]>::to_vec),
            max: max.map(<[u8]>::to_vec),
            min_inclusive,
            max_inclusive,
        }
    }

    pub(crate) fn ripped(&self) -> KeyRange {
        KeyRange {
            min: self.min.as_deref().map(rip),
            max: self.max.as_deref().map(rip),
            min_inclusive: self.min_inclusive,
            max_inclusive: self.max_inclusive,
        }
    }

    /// Whether a byte key falls inside the range.
    pub fn admits(&self, key: &[u8]) -> bool {
        let above = match &self.min {
            None => true,
            Some(min) => match key.cmp(min.as_slice()) {
                Ordering::Greater => true,
                Ordering::Equal => self.min_inclusive,
                Ordering::Less => false,
            },
        };
        let below = match &self.max {
            None => true,
            Some(max) => match key.cmp(max.as_slice()) {
                Ordering::Less => true,
                Ordering::Equal => self.max_inclusive,
                Ordering::Greater => false,
            },
        };
        above && below
    }
}

/// [`Bounds`] expressed in nibbles.
#[derive(Debug, Clone, Default)]
pub(crate) struct KeyRange {
    pub min: Option<Vec<Nibble>>,
    pub max: Option<Vec<Nibble>>,
    pub min_inclusive: bool,
    pub max_inclusive: bool,
}

impl KeyRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn exclusive_from(min: Vec<Nibble>) -> Self {
        Self {
            min: Some(min),
            ..Default::default()
        }
    }

    pub fn exclusive_to(max: Vec<Nibble>) -> Self {
        Self {
            max: Some(max),
            ..Default::default()
        }
    }

    fn admits(&self, key: &[Nibble]) -> bool {
        let above = match &self.min {
            None => true,
            Some(min) => match key.cmp(min.as_slice()) {
                Ordering::Greater => true,
                Ordering::Equal => self.min_inclusive,
                Ordering::Less => false,
            },
        };
        let below = match &self.max {
            None => true,
            Some(max) => match key.cmp(max.as_slice()) {
                Ordering::Less => true,
                Ordering::Equal => self.max_inclusive,
                Ordering::Greater => false,
            },
        };
        above && below
    }

    /// Whether any key starting with `prefix` can fall inside the range.
    fn may_contain(&self, prefix: &[Nibble]) -> bool {
        let above = self.min.as_ref().map_or(true, |min| {
            let common = prefix.len().min(min.len());
            prefix[..common] >= min[..common]
        });
        let below = self.max.as_ref().map_or(true, |max| {
            let common = prefix.len().min(max.len());
            prefix[..common] <= max[..common]
        });
        above && below
    }

    /// Whether every key starting with `prefix` falls inside the range.
    fn covers(&self, prefix: &[Nibble]) -> bool {
        let above = self.min.as_ref().map_or(true, |min| match prefix.cmp(min.as_slice()) {
            Ordering::Greater => true,
            Ordering::Equal => self.min_inclusive,
            Ordering::Less => false,
        });
        let below = self
            .max
            .as_ref()
            .map_or(true, |max| prefix < max.as_slice() && !max.starts_with(prefix));
        above && below
    }
}

/// Visitor over `(full nibble key, node)`; returning false stops the walk.
pub(crate) type Visitor<'v> = dyn FnMut(&[Nibble], &Node) -> bool + 'v;

/// Visitor that also receives the running rank of the node.
pub(crate) type IndexVisitor<'v> = dyn FnMut(&[Nibble], &Node, usize) -> bool + 'v;

fn selected(node: &Node, usage: u8) -> bool {
    !node.empty && (usage == 0 || node.usage & usage != 0)
}

impl Node {
    pub(crate) fn each(&self, prefix: &mut Vec<Nibble>, usage: u8, f: &mut Visitor<'_>) -> bool {
        let mark = prefix.len();
        prefix.extend_from_slice(&self.segment);
        let mut cont = !selected(self, usage) || f(prefix, self);
        if cont {
            for child in self.children.iter().flatten() {
                if !child.each(prefix, usage, f) {
                    cont = false;
                    break;
                }
            }
        }
        prefix.truncate(mark);
        cont
    }

    pub(crate) fn reverse_each(&self, prefix: &mut Vec<Nibble>, usage: u8, f: &mut Visitor<'_>) -> bool {
        let mark = prefix.len();
        prefix.extend_from_slice(&self.segment);
        let mut cont = true;
        for child in self.children.iter().rev().flatten() {
            if !child.reverse_each(prefix, usage, f) {
                cont = false;
                break;
            }
        }
        if cont && selected(self, usage) {
            cont = f(prefix, self);
        }
        prefix.truncate(mark);
        cont
    }

    pub(crate) fn each_between(
        &self,
        prefix: &mut Vec<Nibble>,
        range: &KeyRange,
        usage: u8,
        f: &mut Visitor<'_>,
    ) -> bool {
        let mark = prefix.len();
        prefix.extend_from_slice(&self.segment);
        let mut cont = true;
        if selected(self, usage) && range.admits(prefix) {
            cont = f(prefix, self);
        }
        if cont {
            for child in self.children.iter().flatten() {
                if range.may_contain(&join(prefix, &child.segment))
                    && !child.each_between(prefix, range, usage, f)
                {
                    cont = false;
                    break;
                }
            }
        }
        prefix.truncate(mark);
        cont
    }

    pub(crate) fn reverse_each_between(
        &self,
        prefix: &mut Vec<Nibble>,
        range: &KeyRange,
        usage: u8,
        f: &mut Visitor<'_>,
    ) -> bool {
        let mark = prefix.len();
        prefix.extend_from_slice(&self.segment);
        let mut cont = true;
        for child in self.children.iter().rev().flatten() {
            if range.may_contain(&join(prefix, &child.segment))
                && !child.reverse_each_between(prefix, range, usage, f)
            {
                cont = false;
                break;
            }
        }
        if cont && selected(self, usage) && range.admits(prefix) {
            cont = f(prefix, self);
        }
        prefix.truncate(mark);
        cont
    }

    /// Count entries inside `range` without visiting fully covered subtrees.
    pub(crate) fn size_between(&self, prefix: &mut Vec<Nibble>, range: &KeyRange, usage: u8) -> usize {
        let mark = prefix.len();
        prefix.extend_from_slice(&self.segment);
        let mut result = 0;
        if range.admits(prefix) {
            result += self.own_size(usage);
        }
        for child in self.children.iter().flatten() {
            let child_key = join(prefix, &child.segment);
            if range.covers(&child_key) {
                result += child.sizes(usage);
            } else if range.may_contain(&child_key) {
                result += child.size_between(prefix, range, usage);
            }
        }
        prefix.truncate(mark);
        result
    }

    /// Visit entries whose rank lies in `[min, max]`. `count` is the rank of
    /// the first entry in this subtree and is advanced past it.
    pub(crate) fn each_between_index(
        &self,
        prefix: &mut Vec<Nibble>,
        count: &mut usize,
        min: Option<usize>,
        max: Option<usize>,
        usage: u8,
        f: &mut IndexVisitor<'_>,
    ) -> bool {
        let mark = prefix.len();
        prefix.extend_from_slice(&self.segment);
        let mut cont = true;
        if selected(self, usage) {
            if min.map_or(true, |min| *count >= min) && max.map_or(true, |max| *count <= max) {
                cont = f(prefix, self, *count);
            }
            *count += self.own_size(usage);
        }
        if cont {
            for child in self.children.iter().flatten() {
                let size = child.sizes(usage);
                let reaches = min.map_or(true, |min| *count + size > min);
                let starts = max.map_or(true, |max| *count <= max);
                if !starts {
                    cont = false;
                    break;
                }
                if reaches {
                    if !child.each_between_index(prefix, count, min, max, usage, f) {
                        cont = false;
                        break;
                    }
                } else {
                    *count += size;
                }
            }
        }
        prefix.truncate(mark);
        cont
    }

    /// Reverse-order twin of [`Node::each_between_index`]; ranks count from
    /// the last entry.
    pub(crate) fn reverse_each_between_index(
        &self,
        prefix: &mut Vec<Nibble>,
        count: &mut usize,
        min: Option<usize>,
        max: Option<usize>,
        usage: u8,
        f: &mut IndexVisitor<'_>,
    ) -> bool {
        let mark = prefix.len();
        prefix.extend_from_slice(&self.segment);
        let mut cont = true;
        for child in self.children.iter().rev().flatten() {
            let size = child.sizes(usage);
            let reaches = min.map_or(true, |min| *count + size > min);
            let starts = max.map_or(true, |max| *count <= max);
            if !starts {
                cont = false;
                break;
            }
            if reaches {
                if !child.reverse_each_between_index(prefix, count, min, max, usage, f) {
                    cont = false;
                    break;
                }
            } else {
                *count += size;
            }
        }
        if cont && selected(self, usage) {
            if min.map_or(true, |min| *count >= min) && max.map_or(true, |max| *count <= max) {
                cont = f(prefix, self, *count);
            }
            *count += self.own_size(usage);
        }
        prefix.truncate(mark);
        cont
    }
}

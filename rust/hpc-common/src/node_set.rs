// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Fixed-universe ordered set of node indices.
//!
//! A `NodeSet` is created for a universe of `size` indices (the node table
//! length, or the number of sub-node units such as cores) and never grows.
//! All binary operations assume both operands share the same universe;
//! indices beyond the receiver's universe are ignored.

use std::fmt;

use bitvec::prelude::*;
use serde::{Deserialize, Serialize};

use crate::status::{SchedError, SchedResult};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "NodeSetRepr", into = "NodeSetRepr")]
pub struct NodeSet {
    bits: BitVec<u64, Lsb0>,
}

/// Serialized form: range string plus explicit bit count.
#[derive(Serialize, Deserialize)]
struct NodeSetRepr {
    bits: String,
    size: usize,
}

impl NodeSet {
    /// An empty set over `size` indices.
    pub fn new(size: usize) -> Self {
        Self {
            bits: BitVec::repeat(false, size),
        }
    }

    /// A set containing every index of the universe.
    pub fn full(size: usize) -> Self {
        Self {
            bits: BitVec::repeat(true, size),
        }
    }

    pub fn from_indices(size: usize, indices: impl IntoIterator<Item = usize>) -> Self {
        let mut set = Self::new(size);
        for i in indices {
            set.insert(i);
        }
        set
    }

    /// Size of the universe (not the number of members).
    pub fn size(&self) -> usize {
        self.bits.len()
    }

    /// Number of members.
    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.bits.get(index).map(|b| *b).unwrap_or(false)
    }

    /// Add `index`. Out-of-universe indices are ignored.
    pub fn insert(&mut self, index: usize) {
        if index < self.bits.len() {
            self.bits.set(index, true);
        }
    }

    pub fn remove(&mut self, index: usize) {
        if index < self.bits.len() {
            self.bits.set(index, false);
        }
    }

    pub fn clear(&mut self) {
        self.bits.fill(false);
    }

    pub fn first(&self) -> Option<usize> {
        self.bits.first_one()
    }

    pub fn last(&self) -> Option<usize> {
        self.bits.last_one()
    }

    /// Members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    /// Keep only members also present in `other`.
    pub fn intersect_with(&mut self, other: &NodeSet) {
        let n = self.common_len(other);
        self.bits[..n] &= &other.bits[..n];
        self.bits[n..].fill(false);
    }

    pub fn union_with(&mut self, other: &NodeSet) {
        let n = self.common_len(other);
        self.bits[..n] |= &other.bits[..n];
    }

    /// Remove every member of `other` (and-not).
    pub fn subtract(&mut self, other: &NodeSet) {
        let n = self.common_len(other);
        let keep = !other.bits[..n].to_bitvec();
        self.bits[..n] &= keep.as_bitslice();
    }

    pub fn intersection(&self, other: &NodeSet) -> NodeSet {
        let mut out = self.clone();
        out.intersect_with(other);
        out
    }

    pub fn union(&self, other: &NodeSet) -> NodeSet {
        let mut out = self.clone();
        out.union_with(other);
        out
    }

    /// Every index of the universe not in `self`.
    pub fn complement(&self) -> NodeSet {
        let mut out = NodeSet::full(self.size());
        out.subtract(self);
        out
    }

    /// True when every member of `self` is also in `other`.
    pub fn is_subset_of(&self, other: &NodeSet) -> bool {
        let n = self.common_len(other);
        self.bits[n..].not_any()
            && self.words(other, n).all(|(mine, theirs)| mine & !theirs == 0)
    }

    /// True when every member of `other` is also in `self`.
    pub fn is_superset_of(&self, other: &NodeSet) -> bool {
        other.is_subset_of(self)
    }

    pub fn overlaps(&self, other: &NodeSet) -> bool {
        let n = self.common_len(other);
        self.words(other, n).any(|(mine, theirs)| mine & theirs != 0)
    }

    fn common_len(&self, other: &NodeSet) -> usize {
        self.size().min(other.size())
    }

    /// The first `n` bits of both sets, a word at a time.
    fn words<'a>(&'a self, other: &'a NodeSet, n: usize) -> impl Iterator<Item = (u64, u64)> + 'a {
        self.bits[..n]
            .chunks(64)
            .zip(other.bits[..n].chunks(64))
            .map(|(mine, theirs)| (mine.load_le::<u64>(), theirs.load_le::<u64>()))
    }

    /// Format as a compact range list, e.g. `0-3,7,9-10`.
    pub fn to_range_string(&self) -> String {
        let mut out = String::new();
        let mut run: Option<(usize, usize)> = None;
        for i in self.iter() {
            run = match run {
                Some((start, end)) if end + 1 == i => Some((start, i)),
                Some((start, end)) => {
                    push_range(&mut out, start, end);
                    Some((i, i))
                }
                None => Some((i, i)),
            };
        }
        if let Some((start, end)) = run {
            push_range(&mut out, start, end);
        }
        out
    }

    /// Parse a range list produced by [`NodeSet::to_range_string`].
    pub fn parse_ranges(size: usize, text: &str) -> SchedResult<NodeSet> {
        let mut set = NodeSet::new(size);
        for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (start, end) = match part.split_once('-') {
                Some((a, b)) => (parse_index(a)?, parse_index(b)?),
                None => {
                    let i = parse_index(part)?;
                    (i, i)
                }
            };
            if start > end || end >= size {
                return Err(SchedError::invalid_argument(format!(
                    "range {part} outside node set of size {size}"
                )));
            }
            for i in start..=end {
                set.insert(i);
            }
        }
        Ok(set)
    }
}

fn push_range(out: &mut String, start: usize, end: usize) {
    if !out.is_empty() {
        out.push(',');
    }
    if start == end {
        out.push_str(&start.to_string());
    } else {
        out.push_str(&format!("{start}-{end}"));
    }
}

fn parse_index(s: &str) -> SchedResult<usize> {
    s.trim()
        .parse::<usize>()
        .map_err(|e| SchedError::invalid_argument(format!("bad node index {s:?}: {e}")))
}

impl fmt::Display for NodeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.to_range_string())
    }
}

impl fmt::Debug for NodeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeSet({}/{}: {})", self.count(), self.size(), self.to_range_string())
    }
}

impl From<NodeSet> for NodeSetRepr {
    fn from(set: NodeSet) -> Self {
        Self {
            bits: set.to_range_string(),
            size: set.size(),
        }
    }
}

impl TryFrom<NodeSetRepr> for NodeSet {
    type Error = SchedError;

    fn try_from(repr: NodeSetRepr) -> Result<Self, Self::Error> {
        NodeSet::parse_ranges(repr.size, &repr.bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_ops() {
        let a = NodeSet::from_indices(8, [0, 1, 2, 5]);
        let b = NodeSet::from_indices(8, [2, 3, 5]);

        assert_eq!(a.intersection(&b), NodeSet::from_indices(8, [2, 5]));
        assert_eq!(a.union(&b), NodeSet::from_indices(8, [0, 1, 2, 3, 5]));

        let mut c = a.clone();
        c.subtract(&b);
        assert_eq!(c, NodeSet::from_indices(8, [0, 1]));

        assert_eq!(a.complement(), NodeSet::from_indices(8, [3, 4, 6, 7]));
        assert!(a.overlaps(&b));
        assert!(!c.overlaps(&b));
    }

    #[test]
    fn test_subset_and_superset() {
        let all = NodeSet::full(4);
        let some = NodeSet::from_indices(4, [1, 3]);
        assert!(some.is_subset_of(&all));
        assert!(all.is_superset_of(&some));
        assert!(!all.is_subset_of(&some));
        assert!(NodeSet::new(4).is_subset_of(&some));
    }

    #[test]
    fn test_set_ops_span_words() {
        let a = NodeSet::from_indices(200, [3, 64, 130, 199]);
        let b = NodeSet::from_indices(200, [64, 65, 199]);
        assert_eq!(a.intersection(&b), NodeSet::from_indices(200, [64, 199]));
        assert!(a.overlaps(&b));

        let mut rest = a.clone();
        rest.subtract(&b);
        assert_eq!(rest, NodeSet::from_indices(200, [3, 130]));
        assert!(!rest.overlaps(&b));
        assert!(rest.is_subset_of(&a));
        assert!(!a.is_subset_of(&rest));
        assert_eq!(a.complement().count(), 196);
    }

    #[test]
    fn test_mismatched_universes() {
        let wide = NodeSet::from_indices(100, [1, 70]);
        let narrow = NodeSet::full(10);

        let mut w = wide.clone();
        w.intersect_with(&narrow);
        assert_eq!(w, NodeSet::from_indices(100, [1]));

        let mut n = narrow.clone();
        n.union_with(&wide);
        assert_eq!(n, NodeSet::full(10));
        n.subtract(&wide);
        assert_eq!(n.count(), 9);

        assert!(!wide.is_subset_of(&narrow));
        assert!(NodeSet::from_indices(100, [1]).is_subset_of(&narrow));
        assert!(wide.overlaps(&narrow));
    }

    #[test]
    fn test_out_of_universe_ignored() {
        let mut set = NodeSet::new(3);
        set.insert(7);
        assert!(set.is_empty());
        assert!(!set.contains(7));
        assert_eq!(set.size(), 3);
    }

    #[test]
    fn test_range_string() {
        let set = NodeSet::from_indices(12, [0, 1, 2, 3, 7, 9, 10]);
        assert_eq!(set.to_range_string(), "0-3,7,9-10");
        assert_eq!(NodeSet::parse_ranges(12, "0-3,7,9-10").unwrap(), set);
        assert_eq!(NodeSet::new(5).to_range_string(), "");
        assert!(NodeSet::parse_ranges(5, "").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_out_of_range() {
        assert!(NodeSet::parse_ranges(4, "2-6").is_err());
        assert!(NodeSet::parse_ranges(4, "3-1").is_err());
        assert!(NodeSet::parse_ranges(4, "x").is_err());
    }

    #[test]
    fn test_serde_carries_bit_count() {
        let set = NodeSet::from_indices(10, [1, 2, 8]);
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"{"bits":"1-2,8","size":10}"#);
        let back: NodeSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
        assert_eq!(back.size(), 10);
    }

    #[test]
    fn test_first_last_iter() {
        let set = NodeSet::from_indices(16, [4, 9, 15]);
        assert_eq!(set.first(), Some(4));
        assert_eq!(set.last(), Some(15));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![4, 9, 15]);
        assert_eq!(NodeSet::new(4).first(), None);
    }
}

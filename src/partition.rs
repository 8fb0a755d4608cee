//! Opcode space partitioning.
//!
//! Given the set of `(mask, match)` pairs of all encodings, the partitioner
//! recursively splits the set on a subset of the bits every element's mask has in
//! common, picking the subset which bisects the set most evenly. The resulting
//! decision tree lets a generated classifier discard most candidate encodings
//! with a handful of mask tests instead of a full linear scan.

use crate::helpers::iter_bits;
use crate::insn_set::InsnSet;
use log::warn;
use std::fmt::Write;
use thiserror::Error;

/// A split is only accepted when the ratio between the two half sizes stays
/// below this threshold.
const MAX_SCORE: f64 = 65.0;

/// Sets of this size or smaller are kept as leaves.
const MIN_SPLIT_LEN: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartitionError {
    #[error("cannot partition an empty set")]
    Empty,
    #[error("cannot partition set with no common mask")]
    NoCommonMask,
}

/// One element of the partitioned set: an encoding reduced to its identity and
/// constant bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionElement {
    /// Index of the encoding in the [InsnSet] decode order.
    pub index: usize,
    pub variant: String,
    pub mask: u32,
    pub value: u32,
}

/// Node of the decision tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionNode {
    /// Test `word & criterion`: zero goes left, nonzero goes right.
    Split {
        criterion: u32,
        zero: Box<PartitionNode>,
        nonzero: Box<PartitionNode>,
    },
    /// Candidate encodings, in decode order.
    Leaf(Vec<PartitionElement>),
}

impl PartitionNode {
    /// Number of encodings held below this node.
    pub fn len(&self) -> usize {
        match self {
            Self::Split { zero, nonzero, .. } => zero.len() + nonzero.len(),
            Self::Leaf(elements) => elements.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Depth of the tree below this node, 1 for a leaf.
    pub fn depth(&self) -> usize {
        match self {
            Self::Split { zero, nonzero, .. } => 1 + zero.depth().max(nonzero.depth()),
            Self::Leaf(_) => 1,
        }
    }

    /// The candidate encodings a word routes to.
    pub fn candidates(&self, word: u32) -> &[PartitionElement] {
        match self {
            Self::Split {
                criterion,
                zero,
                nonzero,
            } => {
                if word & criterion == 0 {
                    zero.candidates(word)
                } else {
                    nonzero.candidates(word)
                }
            }
            Self::Leaf(elements) => elements,
        }
    }

    /// Textual rendering of the tree, for generator diagnostics.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_into(&mut out, 0);
        out
    }

    fn dump_into(&self, out: &mut String, indent: usize) {
        let pad = "   ".repeat(indent);
        match self {
            Self::Split {
                criterion,
                zero,
                nonzero,
            } => {
                let _ = writeln!(
                    out,
                    "{}Partition 0x{:x} <{} + {}> {{",
                    pad,
                    criterion,
                    zero.len(),
                    nonzero.len()
                );
                zero.dump_into(out, indent + 1);
                let _ = writeln!(out, "{}}} else {{", pad);
                nonzero.dump_into(out, indent + 1);
                let _ = writeln!(out, "{}}}", pad);
            }
            Self::Leaf(elements) => {
                let names: Vec<&str> = elements.iter().map(|e| e.variant.as_str()).collect();
                let _ = writeln!(out, "{}{}: [ {} ]", pad, elements.len(), names.join(", "));
            }
        }
    }
}

/// Builds the decision tree for a whole instruction set.
pub fn partition_insn_set(set: &InsnSet) -> Result<PartitionNode, PartitionError> {
    let elements: Vec<PartitionElement> = set
        .opcodes()
        .iter()
        .enumerate()
        .map(|(index, o)| PartitionElement {
            index,
            variant: o.variant().into(),
            mask: o.mask(),
            value: o.match_value(),
        })
        .collect();
    partition(elements)
}

/// Recursively partitions a set of encodings. The root is split once even when
/// small; children recurse only while they hold more than [MIN_SPLIT_LEN]
/// elements.
pub fn partition(elements: Vec<PartitionElement>) -> Result<PartitionNode, PartitionError> {
    if elements.is_empty() {
        return Err(PartitionError::Empty);
    }
    if common_mask(&elements) == 0 {
        return Err(PartitionError::NoCommonMask);
    }
    log_leaf_ambiguities(&elements);
    Ok(split(elements))
}

fn common_mask(elements: &[PartitionElement]) -> u32 {
    elements.iter().fold(!0, |acc, e| acc & e.mask)
}

/// Finds the best discriminator among all non-trivial subsets of the common mask
/// bits, scored by how evenly it bisects the set.
fn best_discriminator(elements: &[PartitionElement]) -> Option<u32> {
    let common = common_mask(elements);
    let bits: Vec<u32> = iter_bits(common).collect();
    let mut best: Option<(f64, u32)> = None;
    // All subsets of the common bits except the empty and the full one.
    for subset in 1..(1u64 << bits.len()) - 1 {
        let mask = bits
            .iter()
            .enumerate()
            .filter(|&(i, _)| subset & (1 << i) != 0)
            .fold(0, |acc, (_, &b)| acc | b);
        let zero = elements.iter().filter(|e| e.value & mask == 0).count();
        let nonzero = elements.len() - zero;
        if zero == 0 || nonzero == 0 {
            continue;
        }
        let score = zero.max(nonzero) as f64 / zero.min(nonzero) as f64;
        if best.map_or(true, |(s, _)| score < s) {
            best = Some((score, mask));
        }
    }
    match best {
        Some((score, mask)) if score < MAX_SCORE => Some(mask),
        Some((score, _)) => {
            warn!(
                "cannot further partition set of {} elements, best score {:.1}",
                elements.len(),
                score
            );
            None
        }
        None => {
            warn!(
                "cannot further partition set of {} elements, no usable discriminator",
                elements.len()
            );
            None
        }
    }
}

fn split(elements: Vec<PartitionElement>) -> PartitionNode {
    if common_mask(&elements) == 0 {
        return PartitionNode::Leaf(elements);
    }
    let Some(criterion) = best_discriminator(&elements) else {
        return PartitionNode::Leaf(elements);
    };
    let (nonzero, zero): (Vec<_>, Vec<_>) =
        elements.into_iter().partition(|e| e.value & criterion != 0);
    PartitionNode::Split {
        criterion,
        zero: Box::new(descend(zero)),
        nonzero: Box::new(descend(nonzero)),
    }
}

fn descend(elements: Vec<PartitionElement>) -> PartitionNode {
    if elements.len() > MIN_SPLIT_LEN {
        split(elements)
    } else {
        PartitionNode::Leaf(elements)
    }
}

/// Warns about encodings whose constant bits cannot tell them apart; their
/// relative decode order is the deterministic tie-breaker.
fn log_leaf_ambiguities(elements: &[PartitionElement]) {
    for (i, a) in elements.iter().enumerate() {
        for b in &elements[i + 1..] {
            let common = a.mask & b.mask;
            if a.value & common == b.value & common {
                warn!(
                    "encodings {} and {} are ambiguous under their common mask, keeping {} first",
                    a.variant, b.variant, a.variant
                );
            }
        }
    }
}

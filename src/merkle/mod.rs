//! Sort-ordered binary tree with lazily-rebuilt Merkle hashing, plus its flat
//! on-disk encoding. Two overlays share one leaf set: a sort tree (here, a
//! `BTreeMap` keyed by leaf name — it already gives us O(log n) membership
//! and ordered iteration for free) and a Merkle tree, built fresh from the
//! sorted leaves whenever the structure is marked dirty.

mod codec;
mod tree;

pub use codec::{decode_tree, encode_tree};
pub use tree::{Leaf, MerkleTree, Node};

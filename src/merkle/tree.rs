use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// A single leaf: `(name, content hash, byte length, last-modified millis)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub name: String,
    pub hash: [u8; 32],
    pub length: u64,
    pub last_modified: u64,
}

/// One arena-allocated node of the built Merkle tree. Leaves have
/// `left == right == None` and `node_count == leaf_count == 1`. An internal
/// node's `hash` is `SHA256(left.hash || right.hash)`, or the lone child's
/// hash unchanged if only one child is present.
#[derive(Debug, Clone)]
pub struct Node {
    pub min_name: String,
    pub hash: [u8; 32],
    pub length: u64,
    pub last_modified: u64,
    pub node_count: u64,
    pub leaf_count: u64,
    pub left: Option<usize>,
    pub right: Option<usize>,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

/// The well-defined root hash of a tree with zero leaves.
pub fn empty_root_hash() -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"");
    hasher.finalize().into()
}

/// Sort-ordered leaf set plus its lazily-derived Merkle overlay.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    leaves: BTreeMap<String, Leaf>,
    nodes: Vec<Node>,
    root: Option<usize>,
    dirty: bool,
}

impl Default for MerkleTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MerkleTree {
    pub fn new() -> Self {
        MerkleTree {
            leaves: BTreeMap::new(),
            nodes: Vec::new(),
            root: None,
            dirty: true,
        }
    }

    pub fn from_leaves(leaves: Vec<Leaf>) -> Self {
        let mut tree = Self::new();
        for leaf in leaves {
            tree.add_item(leaf);
        }
        tree
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn leaves(&self) -> impl Iterator<Item = &Leaf> {
        self.leaves.values()
    }

    /// Insert, or replace in place if `leaf.name` already exists.
    pub fn add_item(&mut self, leaf: Leaf) {
        self.leaves.insert(leaf.name.clone(), leaf);
        self.dirty = true;
    }

    /// Replace the leaf with matching name. Returns `false` if absent.
    pub fn update_item(&mut self, leaf: Leaf) -> bool {
        if !self.leaves.contains_key(&leaf.name) {
            return false;
        }
        self.leaves.insert(leaf.name.clone(), leaf);
        self.dirty = true;
        true
    }

    /// Remove the leaf with the given name. Returns `false` if absent.
    pub fn delete_item(&mut self, name: &str) -> bool {
        let removed = self.leaves.remove(name).is_some();
        if removed {
            self.dirty = true;
        }
        removed
    }

    /// O(log n) lookup by sort order (via the underlying `BTreeMap`).
    pub fn find_item_node(&self, name: &str) -> Option<&Leaf> {
        self.leaves.get(name)
    }

    /// Rebuild the Merkle tree from the current leaf set if dirty. No-op
    /// otherwise.
    pub fn rebuild_if_dirty(&mut self) {
        if !self.dirty {
            return;
        }
        self.nodes.clear();
        let ordered: Vec<&Leaf> = self.leaves.values().collect();
        self.root = build_merkle_tree(&mut self.nodes, &ordered);
        self.dirty = false;
    }

    /// Current root hash, rebuilding the tree first if dirty.
    pub fn root_hash(&mut self) -> [u8; 32] {
        self.rebuild_if_dirty();
        match self.root {
            Some(idx) => self.nodes[idx].hash,
            None => empty_root_hash(),
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn root_index(&self) -> Option<usize> {
        self.root
    }

    /// Pre-order traversal (parent, left, right). `visitor` returning `false`
    /// skips that node's children but continues with its siblings.
    pub fn traverse_sync<F: FnMut(&Node) -> bool>(&self, visitor: &mut F) {
        if let Some(root) = self.root {
            self.traverse_node(root, visitor);
        }
    }

    fn traverse_node<F: FnMut(&Node) -> bool>(&self, idx: usize, visitor: &mut F) {
        let node = &self.nodes[idx];
        if !visitor(node) {
            return;
        }
        if let Some(left) = node.left {
            self.traverse_node(left, visitor);
        }
        if let Some(right) = node.right {
            self.traverse_node(right, visitor);
        }
    }

    /// Async variant of [`MerkleTree::traverse_sync`], for visitors that need
    /// to suspend (e.g. to fetch sibling data from `Storage`).
    pub async fn traverse_async<F, Fut>(&self, visitor: &mut F)
    where
        F: FnMut(Node) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        if let Some(root) = self.root {
            self.traverse_node_async(root, visitor).await;
        }
    }

    fn traverse_node_async<'a, F, Fut>(
        &'a self,
        idx: usize,
        visitor: &'a mut F,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + 'a>>
    where
        F: FnMut(Node) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        Box::pin(async move {
            let node = self.nodes[idx].clone();
            let left = node.left;
            let right = node.right;
            if !visitor(node).await {
                return;
            }
            if let Some(left) = left {
                self.traverse_node_async(left, visitor).await;
            }
            if let Some(right) = right {
                self.traverse_node_async(right, visitor).await;
            }
        })
    }
}

/// Pure function: build a balanced hash tree over already-sorted leaves and
/// append it to `nodes`, returning the root's index.
fn build_merkle_tree(nodes: &mut Vec<Node>, leaves: &[&Leaf]) -> Option<usize> {
    if leaves.is_empty() {
        return None;
    }
    if leaves.len() == 1 {
        let leaf = leaves[0];
        nodes.push(Node {
            min_name: leaf.name.clone(),
            hash: leaf.hash,
            length: leaf.length,
            last_modified: leaf.last_modified,
            node_count: 1,
            leaf_count: 1,
            left: None,
            right: None,
        });
        return Some(nodes.len() - 1);
    }

    let mid = leaves.len() / 2;
    let left_idx = build_merkle_tree(nodes, &leaves[..mid]);
    let right_idx = build_merkle_tree(nodes, &leaves[mid..]);

    let left = left_idx.map(|i| nodes[i].clone());
    let right = right_idx.map(|i| nodes[i].clone());

    let hash = match (&left, &right) {
        (Some(l), Some(r)) => hash_pair(&l.hash, &r.hash),
        (Some(l), None) => l.hash,
        (None, Some(r)) => r.hash,
        (None, None) => unreachable!("non-empty leaf slice always yields at least one child"),
    };

    let min_name = match (&left, &right) {
        (Some(l), Some(r)) => std::cmp::min(l.min_name.clone(), r.min_name.clone()),
        (Some(l), None) => l.min_name.clone(),
        (None, Some(r)) => r.min_name.clone(),
        (None, None) => unreachable!(),
    };

    let node_count = 1 + left.as_ref().map_or(0, |n| n.node_count) + right.as_ref().map_or(0, |n| n.node_count);
    let leaf_count = left.as_ref().map_or(0, |n| n.leaf_count) + right.as_ref().map_or(0, |n| n.leaf_count);
    let length = left.as_ref().map_or(0, |n| n.length) + right.as_ref().map_or(0, |n| n.length);
    let last_modified = std::cmp::max(
        left.as_ref().map_or(0, |n| n.last_modified),
        right.as_ref().map_or(0, |n| n.last_modified),
    );

    nodes.push(Node {
        min_name,
        hash,
        length,
        last_modified,
        node_count,
        leaf_count,
        left: left_idx,
        right: right_idx,
    });
    Some(nodes.len() - 1)
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str, seed: u8) -> Leaf {
        Leaf {
            name: name.to_string(),
            hash: [seed; 32],
            length: seed as u64,
            last_modified: 1000,
        }
    }

    #[test]
    fn empty_tree_has_well_defined_root() {
        let mut tree = MerkleTree::new();
        assert_eq!(tree.root_hash(), empty_root_hash());
    }

    #[test]
    fn find_item_node_respects_deletions() {
        let mut tree = MerkleTree::new();
        tree.add_item(leaf("b", 1));
        tree.add_item(leaf("a", 2));
        tree.add_item(leaf("c", 3));
        assert!(tree.find_item_node("a").is_some());
        tree.delete_item("a");
        assert!(tree.find_item_node("a").is_none());
        assert!(tree.find_item_node("b").is_some());
    }

    #[test]
    fn node_count_invariant_holds() {
        let mut tree = MerkleTree::new();
        for i in 0..7u8 {
            tree.add_item(leaf(&format!("k{i}"), i));
        }
        tree.rebuild_if_dirty();
        for node in tree.nodes() {
            let left_count = node.left.map_or(0, |i| tree.nodes()[i].node_count);
            let right_count = node.right.map_or(0, |i| tree.nodes()[i].node_count);
            assert_eq!(node.node_count, 1 + left_count + right_count);
        }
    }

    #[test]
    fn build_is_deterministic() {
        let mut a = MerkleTree::new();
        let mut b = MerkleTree::new();
        for i in 0..20u8 {
            a.add_item(leaf(&format!("k{i}"), i));
        }
        for i in (0..20u8).rev() {
            b.add_item(leaf(&format!("k{i}"), i));
        }
        assert_eq!(a.root_hash(), b.root_hash());
    }

    #[test]
    fn round_trip_insert_delete_insert_restores_root() {
        let mut tree = MerkleTree::new();
        tree.add_item(leaf("a", 1));
        tree.add_item(leaf("b", 2));
        let h1 = tree.root_hash();
        tree.add_item(leaf("c", 3));
        tree.delete_item("c");
        let h2 = tree.root_hash();
        assert_eq!(h1, h2);
    }

    #[test]
    fn update_changes_root_and_revert_restores_it() {
        let mut tree = MerkleTree::new();
        tree.add_item(leaf("a", 1));
        tree.add_item(leaf("b", 2));
        tree.add_item(leaf("c", 3));
        let snapshot = tree.root_hash();
        tree.update_item(leaf("b", 99));
        let updated = tree.root_hash();
        assert_ne!(snapshot, updated);
        tree.update_item(leaf("b", 2));
        assert_eq!(tree.root_hash(), snapshot);
    }
}

//! Binary Merkle backing of the step record.
//!
//! The step is committed as a perfect binary tree hashed with SHA-256
//! (distinct from the keccak used on all Ethereum-facing data). Generalized
//! indices follow the usual scheme: root = 1, left child = 2i, right = 2i+1.
//! Subtrees of all-zero chunks are never materialized; their roots come from
//! a per-depth table.

use std::collections::HashMap;
use std::sync::OnceLock;

use ethereum_types::H256;
use stepex_crypto::sha256;

/// Deepest subtree the schema uses (the 2^21-chunk memory copies).
pub const MAX_TREE_DEPTH: usize = 40;

pub fn hash_pair(left: &H256, right: &H256) -> H256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_bytes());
    buf[32..].copy_from_slice(right.as_bytes());
    H256(sha256(buf))
}

/// Root of an all-zero subtree with `depth` levels below it.
pub fn zero_hash(depth: usize) -> H256 {
    static TABLE: OnceLock<Vec<H256>> = OnceLock::new();
    let table = TABLE.get_or_init(|| {
        let mut table = Vec::with_capacity(MAX_TREE_DEPTH + 1);
        table.push(H256::zero());
        for depth in 1..=MAX_TREE_DEPTH {
            let child = table[depth - 1];
            table.push(hash_pair(&child, &child));
        }
        table
    });
    table[depth]
}

/// Map of every interior node of the committed trees: parent root to the
/// `(left, right)` pair. This is the `binary_nodes` section of the witness.
pub type BinaryNodeDb = HashMap<H256, (H256, H256)>;

/// Computes tree roots, optionally recording every hashed pair (and the
/// zero-subtree pairs walks may descend into) for witness output.
#[derive(Debug, Default)]
pub struct TreeBuilder {
    pub nodes: Option<BinaryNodeDb>,
}

impl TreeBuilder {
    pub fn collecting() -> Self {
        let mut builder = Self {
            nodes: Some(BinaryNodeDb::new()),
        };
        // seed the zero pairs so gindex walks never dead-end in a zero region
        for depth in 1..=MAX_TREE_DEPTH {
            let child = zero_hash(depth - 1);
            builder.record(zero_hash(depth), child, child);
        }
        builder
    }

    fn record(&mut self, parent: H256, left: H256, right: H256) {
        if let Some(nodes) = self.nodes.as_mut() {
            nodes.insert(parent, (left, right));
        }
    }

    pub fn pair(&mut self, left: H256, right: H256) -> H256 {
        let parent = hash_pair(&left, &right);
        self.record(parent, left, right);
        parent
    }

    /// Merkleizes `chunks` into a subtree of the given depth (capacity
    /// `2^depth` chunks), padding with zero subtrees on the right.
    pub fn merkleize_chunks(&mut self, chunks: &[H256], depth: usize) -> H256 {
        debug_assert!(chunks.len() <= 1usize << depth);
        if chunks.is_empty() {
            return zero_hash(depth);
        }
        if depth == 0 {
            return chunks[0];
        }
        let half = 1usize << (depth - 1);
        let left = self.merkleize_chunks(&chunks[..chunks.len().min(half)], depth - 1);
        let right = if chunks.len() > half {
            self.merkleize_chunks(&chunks[half..], depth - 1)
        } else {
            zero_hash(depth - 1)
        };
        self.pair(left, right)
    }

    /// Merkleizes a byte string into a `2^depth`-chunk subtree with the byte
    /// length mixed in: `hash(chunks_root, len)`.
    pub fn merkleize_bytes(&mut self, data: &[u8], depth: usize) -> H256 {
        let chunks = pack_bytes(data);
        let chunks_root = self.merkleize_chunks(&chunks, depth);
        self.pair(chunks_root, len_chunk(data.len()))
    }

    /// Merkleizes a list of 32-byte items with its length mixed in.
    pub fn merkleize_list(&mut self, items: &[H256], depth: usize) -> H256 {
        let items_root = self.merkleize_chunks(items, depth);
        self.pair(items_root, len_chunk(items.len()))
    }
}

/// Packs bytes into 32-byte chunks, zero-padding the last one.
pub fn pack_bytes(data: &[u8]) -> Vec<H256> {
    data.chunks(32)
        .map(|chunk| {
            let mut out = [0u8; 32];
            out[..chunk.len()].copy_from_slice(chunk);
            H256(out)
        })
        .collect()
}

/// Little-endian length mix-in chunk.
pub fn len_chunk(len: usize) -> H256 {
    let mut out = [0u8; 32];
    out[..8].copy_from_slice(&(len as u64).to_le_bytes());
    H256(out)
}

// === Generalized index navigation ===

/// Appends a subtree path below `parent`: `sub` is a gindex relative to the
/// subtree's own root.
pub fn gindex_concat(parent: u64, sub: u64) -> u64 {
    debug_assert!(sub >= 1);
    if sub == 1 {
        return parent;
    }
    let depth = 63 - sub.leading_zeros();
    (parent << depth) | (sub & ((1 << depth) - 1))
}

/// Gindex of the `i`-th leaf of a `depth`-deep subtree rooted at `parent`.
pub fn gindex_leaf(parent: u64, depth: usize, index: u64) -> u64 {
    gindex_concat(parent, (1u64 << depth) | index)
}

/// All gindices a Merkle multiproof for `targets` needs: each target's path
/// to the root plus the sibling of every node on those paths.
pub fn proof_closure(targets: &std::collections::BTreeSet<u64>) -> std::collections::BTreeSet<u64> {
    let mut out = std::collections::BTreeSet::new();
    for &target in targets {
        let mut node = target;
        while node > 1 {
            out.insert(node);
            out.insert(node ^ 1);
            node >>= 1;
        }
    }
    out.insert(1);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_hash_table_is_consistent() {
        assert_eq!(zero_hash(0), H256::zero());
        assert_eq!(zero_hash(3), hash_pair(&zero_hash(2), &zero_hash(2)));
    }

    #[test]
    fn merkleize_pads_with_zero_subtrees() {
        let mut builder = TreeBuilder::default();
        let chunk = H256::repeat_byte(0x01);
        let root = builder.merkleize_chunks(&[chunk], 2);
        let expected = hash_pair(&hash_pair(&chunk, &zero_hash(0)), &zero_hash(1));
        assert_eq!(root, expected);
    }

    #[test]
    fn byte_length_is_mixed_in() {
        let mut builder = TreeBuilder::default();
        let a = builder.merkleize_bytes(&[0u8; 10], 2);
        let b = builder.merkleize_bytes(&[0u8; 11], 2);
        assert_ne!(a, b);
    }

    #[test]
    fn collected_nodes_allow_walking() {
        let mut builder = TreeBuilder::collecting();
        let chunks = [H256::repeat_byte(1), H256::repeat_byte(2)];
        let root = builder.merkleize_chunks(&chunks, 1);
        let nodes = builder.nodes.unwrap();
        let (left, right) = nodes[&root];
        assert_eq!(left, chunks[0]);
        assert_eq!(right, chunks[1]);
    }

    #[test]
    fn gindex_helpers() {
        // leaf 3 of a depth-2 subtree below gindex 5
        assert_eq!(gindex_leaf(5, 2, 3), 5 * 4 + 3);
        assert_eq!(gindex_concat(7, 1), 7);
        assert_eq!(gindex_concat(2, 3), 2 * 2 + 1);
    }

    #[test]
    fn proof_closure_contains_siblings() {
        let targets = std::collections::BTreeSet::from([12u64]);
        let closure = proof_closure(&targets);
        for g in [1u64, 2, 3, 6, 7, 12, 13] {
            assert!(closure.contains(&g));
        }
    }
}

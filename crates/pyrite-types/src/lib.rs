//! # pyrite-types
//!
//! Chain primitives for the Pyrite blockchain.
//!
//! This crate provides:
//! - 32-byte blake2b-256 hashes and hashing helpers
//! - Block headers, transactions, receipts and assembled blocks
//! - Derived list roots used to validate block bodies against headers
//! - The binary state trie node format used by fast synchronization

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use std::fmt;

/// Block height within the chain.
pub type BlockNumber = u64;

/// Cumulative chain work advertised by peers.
pub type TotalDifficulty = u128;

/// A 32-byte blake2b-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The all-zero hash.
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw byte view.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether this is the all-zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Compute the blake2b-256 digest of a byte slice.
pub fn hash_bytes(data: &[u8]) -> Hash256 {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(data);
    Hash256(hasher.finalize().into())
}

/// Domain tags mixed into derived list roots so that a transaction list and
/// an uncle list with identical contents can never produce the same root.
mod root_tag {
    pub const TRANSACTIONS: u8 = 1;
    pub const UNCLES: u8 = 2;
    pub const RECEIPTS: u8 = 3;
}

fn list_root<I: Iterator<Item = Hash256>>(tag: u8, hashes: I) -> Hash256 {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update([tag]);
    for hash in hashes {
        hasher.update(hash.as_bytes());
    }
    Hash256(hasher.finalize().into())
}

/// Derive the root committing to an ordered transaction list.
pub fn transaction_root(transactions: &[Transaction]) -> Hash256 {
    list_root(root_tag::TRANSACTIONS, transactions.iter().map(|t| t.hash()))
}

/// Derive the root committing to an ordered uncle header list.
pub fn uncle_root(uncles: &[Header]) -> Hash256 {
    list_root(root_tag::UNCLES, uncles.iter().map(|u| u.hash()))
}

/// Derive the root committing to an ordered receipt list.
pub fn receipt_root(receipts: &[Receipt]) -> Hash256 {
    list_root(root_tag::RECEIPTS, receipts.iter().map(|r| r.hash()))
}

/// A block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Hash of the parent block header.
    pub parent_hash: Hash256,
    /// Block height.
    pub number: BlockNumber,
    /// Root of the state trie after executing this block.
    pub state_root: Hash256,
    /// Root committing to the block's transaction list.
    pub tx_root: Hash256,
    /// Root committing to the block's uncle list.
    pub uncle_root: Hash256,
    /// Root committing to the block's receipt list.
    pub receipt_root: Hash256,
    /// Per-block difficulty.
    pub difficulty: u64,
    /// Unix timestamp.
    pub time: u64,
    /// Arbitrary extra data.
    pub extra: Vec<u8>,
}

impl Header {
    /// Compute the header hash over the canonical field encoding.
    pub fn hash(&self) -> Hash256 {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(self.parent_hash.as_bytes());
        hasher.update(self.number.to_be_bytes());
        hasher.update(self.state_root.as_bytes());
        hasher.update(self.tx_root.as_bytes());
        hasher.update(self.uncle_root.as_bytes());
        hasher.update(self.receipt_root.as_bytes());
        hasher.update(self.difficulty.to_be_bytes());
        hasher.update(self.time.to_be_bytes());
        hasher.update(&self.extra);
        Hash256(hasher.finalize().into())
    }

    /// Whether the header commits to an empty body (no transactions, no
    /// uncles). Such blocks need no body retrieval during sync.
    pub fn has_empty_body(&self) -> bool {
        self.tx_root == transaction_root(&[]) && self.uncle_root == uncle_root(&[])
    }
}

impl Default for Header {
    fn default() -> Self {
        Self {
            parent_hash: Hash256::ZERO,
            number: 0,
            state_root: Hash256::ZERO,
            tx_root: transaction_root(&[]),
            uncle_root: uncle_root(&[]),
            receipt_root: receipt_root(&[]),
            difficulty: 0,
            time: 0,
            extra: Vec::new(),
        }
    }
}

/// An opaque transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Serialized transaction payload.
    pub data: Vec<u8>,
}

impl Transaction {
    /// Create a transaction from its payload.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Transaction hash.
    pub fn hash(&self) -> Hash256 {
        hash_bytes(&self.data)
    }
}

/// An opaque execution receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Serialized receipt payload.
    pub data: Vec<u8>,
}

impl Receipt {
    /// Create a receipt from its payload.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Receipt hash.
    pub fn hash(&self) -> Hash256 {
        hash_bytes(&self.data)
    }
}

/// An assembled block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// The block header.
    pub header: Header,
    /// The transaction list.
    pub transactions: Vec<Transaction>,
    /// The uncle header list.
    pub uncles: Vec<Header>,
}

impl Block {
    /// Assemble a block from a header and its body parts.
    pub fn new(header: Header, transactions: Vec<Transaction>, uncles: Vec<Header>) -> Self {
        Self {
            header,
            transactions,
            uncles,
        }
    }

    /// Block hash (the header hash).
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Block height.
    pub fn number(&self) -> BlockNumber {
        self.header.number
    }
}

/// A state trie node in its wire encoding.
///
/// Layout: `child_count: u8`, then `child_count` 32-byte child hashes, then
/// the remaining bytes as opaque payload. A node is addressed by the
/// blake2b-256 digest of its encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateNode {
    /// Hashes of child nodes referenced by this node.
    pub children: Vec<Hash256>,
    /// Opaque node payload.
    pub payload: Vec<u8>,
}

impl StateNode {
    /// Encode the node into its canonical byte form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.children.len() * 32 + self.payload.len());
        out.push(self.children.len() as u8);
        for child in &self.children {
            out.extend_from_slice(child.as_bytes());
        }
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a node from its byte form. Returns `None` if the data is
    /// truncated.
    pub fn decode(data: &[u8]) -> Option<Self> {
        let (&count, rest) = data.split_first()?;
        let want = count as usize * 32;
        if rest.len() < want {
            return None;
        }
        let children = rest[..want]
            .chunks_exact(32)
            .map(|chunk| {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(chunk);
                Hash256(bytes)
            })
            .collect();
        Some(Self {
            children,
            payload: rest[want..].to_vec(),
        })
    }

    /// Hash addressing this node.
    pub fn hash(&self) -> Hash256 {
        hash_bytes(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_determinism() {
        let a = hash_bytes(b"pyrite");
        let b = hash_bytes(b"pyrite");
        assert_eq!(a, b);
        assert_ne!(a, hash_bytes(b"pyrit"));
        assert_eq!(a.as_bytes().len(), 32);
    }

    #[test]
    fn test_header_hash_covers_fields() {
        let header = Header::default();
        let mut other = header.clone();
        other.number = 1;
        assert_ne!(header.hash(), other.hash());

        let mut other = header.clone();
        other.extra = vec![1];
        assert_ne!(header.hash(), other.hash());
    }

    #[test]
    fn test_empty_body_detection() {
        let header = Header::default();
        assert!(header.has_empty_body());

        let tx = Transaction::new(vec![1, 2, 3]);
        let mut full = header.clone();
        full.tx_root = transaction_root(&[tx]);
        assert!(!full.has_empty_body());
    }

    #[test]
    fn test_list_roots_are_domain_separated() {
        // Identical (empty) contents under different tags must not collide.
        assert_ne!(transaction_root(&[]), uncle_root(&[]));
        assert_ne!(transaction_root(&[]), receipt_root(&[]));
    }

    #[test]
    fn test_list_root_is_order_sensitive() {
        let a = Transaction::new(vec![1]);
        let b = Transaction::new(vec![2]);
        assert_ne!(
            transaction_root(&[a.clone(), b.clone()]),
            transaction_root(&[b, a])
        );
    }

    #[test]
    fn test_state_node_roundtrip() {
        let node = StateNode {
            children: vec![hash_bytes(b"left"), hash_bytes(b"right")],
            payload: vec![7, 7, 7],
        };
        let encoded = node.encode();
        let decoded = StateNode::decode(&encoded).unwrap();
        assert_eq!(node, decoded);
        assert_eq!(node.hash(), hash_bytes(&encoded));
    }

    #[test]
    fn test_state_node_truncated() {
        assert!(StateNode::decode(&[]).is_none());
        // Claims two children but carries bytes for less than one.
        assert!(StateNode::decode(&[2, 0xab, 0xcd]).is_none());
    }
}

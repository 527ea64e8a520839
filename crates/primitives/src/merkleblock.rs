//! Merkle block proofs: a block header plus a partial merkle tree that commits
//! to a subset of the block's transactions.

use fluxd_consensus::constants::MAX_BLOCK_SIZE;
use fluxd_consensus::Hash256;

use crate::block::{merkle_hash_pair, Block, BlockHeader};
use crate::encoding::{decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder};

const MIN_SERIALIZED_TX_SIZE: u32 = 60;
const MAX_TREE_TRANSACTIONS: u32 = MAX_BLOCK_SIZE / MIN_SERIALIZED_TX_SIZE;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialMerkleTree {
    pub n_transactions: u32,
    pub bits: Vec<bool>,
    pub hashes: Vec<Hash256>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleBlock {
    pub header: BlockHeader,
    pub txn: PartialMerkleTree,
}

impl MerkleBlock {
    /// Builds a proof for the transactions of `block` selected by `include`.
    pub fn from_block(block: &Block, include: impl Fn(&Hash256) -> bool) -> Self {
        let txids = block.txids();
        let matches: Vec<bool> = txids.iter().map(&include).collect();
        Self {
            header: block.header.clone(),
            txn: PartialMerkleTree::build(&txids, &matches),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode(bytes)
    }
}

impl Encodable for MerkleBlock {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.header.consensus_encode(encoder);
        self.txn.consensus_encode(encoder);
    }
}

impl Decodable for MerkleBlock {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode(decoder)?;
        let txn = PartialMerkleTree::consensus_decode(decoder)?;
        Ok(Self { header, txn })
    }
}

/// Result of walking a partial tree: the committed root, the matched txids
/// in block order and their positions within the block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractedMatches {
    pub root: Hash256,
    pub txids: Vec<Hash256>,
    pub positions: Vec<u32>,
}

impl PartialMerkleTree {
    pub fn build(txids: &[Hash256], matches: &[bool]) -> Self {
        let n_transactions = u32::try_from(txids.len()).unwrap_or(u32::MAX);
        let mut tree = Self {
            n_transactions,
            bits: Vec::new(),
            hashes: Vec::new(),
        };
        if txids.is_empty() || txids.len() != matches.len() {
            return tree;
        }
        let height = tree_height(n_transactions);
        tree.build_node(height, 0, txids, matches);
        tree
    }

    /// Recomputes the root and collects matched txids. `None` means the
    /// encoding is malformed or not minimal.
    pub fn extract_matches(&self) -> Option<ExtractedMatches> {
        if self.n_transactions == 0
            || self.n_transactions > MAX_TREE_TRANSACTIONS
            || self.hashes.len() > self.n_transactions as usize
            || self.bits.len() < self.hashes.len()
        {
            return None;
        }

        let mut walker = TreeWalker {
            tree: self,
            bits_used: 0,
            hashes_used: 0,
            matched: Vec::new(),
            positions: Vec::new(),
        };
        let root = walker.visit(tree_height(self.n_transactions), 0)?;

        if walker.bits_used.div_ceil(8) != self.bits.len().div_ceil(8)
            || walker.hashes_used != self.hashes.len()
        {
            return None;
        }
        Some(ExtractedMatches {
            root,
            txids: walker.matched,
            positions: walker.positions,
        })
    }

    fn build_node(&mut self, height: u32, pos: u32, txids: &[Hash256], matches: &[bool]) {
        let start = (pos as usize) << height;
        let end = ((pos as usize + 1) << height).min(txids.len());
        let parent_of_match = matches[start..end].iter().any(|matched| *matched);
        self.bits.push(parent_of_match);

        if height == 0 || !parent_of_match {
            self.hashes.push(subtree_hash(self.n_transactions, height, pos, txids));
            return;
        }

        self.build_node(height - 1, pos * 2, txids, matches);
        if pos * 2 + 1 < tree_width(self.n_transactions, height - 1) {
            self.build_node(height - 1, pos * 2 + 1, txids, matches);
        }
    }
}

struct TreeWalker<'a> {
    tree: &'a PartialMerkleTree,
    bits_used: usize,
    hashes_used: usize,
    matched: Vec<Hash256>,
    positions: Vec<u32>,
}

impl TreeWalker<'_> {
    fn visit(&mut self, height: u32, pos: u32) -> Option<Hash256> {
        let parent_of_match = *self.tree.bits.get(self.bits_used)?;
        self.bits_used += 1;

        if height == 0 || !parent_of_match {
            let hash = *self.tree.hashes.get(self.hashes_used)?;
            self.hashes_used += 1;
            if height == 0 && parent_of_match {
                self.matched.push(hash);
                self.positions.push(pos);
            }
            return Some(hash);
        }

        let left = self.visit(height - 1, pos * 2)?;
        let right = if pos * 2 + 1 < tree_width(self.tree.n_transactions, height - 1) {
            let right = self.visit(height - 1, pos * 2 + 1)?;
            // Identical siblings would allow CVE-2012-2459 style duplication.
            if right == left {
                return None;
            }
            right
        } else {
            left
        };
        Some(merkle_hash_pair(&left, &right))
    }
}

impl Encodable for PartialMerkleTree {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.n_transactions);
        encoder.write_varint(self.hashes.len() as u64);
        for hash in &self.hashes {
            encoder.write_hash_le(hash);
        }

        let mut flag_bytes = vec![0u8; self.bits.len().div_ceil(8)];
        for (idx, bit) in self.bits.iter().enumerate() {
            if *bit {
                flag_bytes[idx / 8] |= 1u8 << (idx % 8);
            }
        }
        encoder.write_var_bytes(&flag_bytes);
    }
}

impl Decodable for PartialMerkleTree {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let n_transactions = decoder.read_u32_le()?;
        if n_transactions > MAX_TREE_TRANSACTIONS {
            return Err(DecodeError::InvalidData(
                "too many transactions in merkle tree",
            ));
        }

        let hash_count = decoder.read_count()?;
        if hash_count > n_transactions as usize {
            return Err(DecodeError::InvalidData("too many hashes in merkle tree"));
        }
        let mut hashes = Vec::with_capacity(hash_count);
        for _ in 0..hash_count {
            hashes.push(decoder.read_hash_le()?);
        }

        let flag_bytes = decoder.read_var_bytes()?;
        if flag_bytes.len() > (n_transactions as usize * 2).div_ceil(8) {
            return Err(DecodeError::InvalidData(
                "too many flag bytes in merkle tree",
            ));
        }
        let bits = flag_bytes
            .iter()
            .flat_map(|byte| (0..8).map(move |bit| byte & (1u8 << bit) != 0))
            .collect();

        Ok(Self {
            n_transactions,
            bits,
            hashes,
        })
    }
}

fn subtree_hash(n_transactions: u32, height: u32, pos: u32, txids: &[Hash256]) -> Hash256 {
    if height == 0 {
        return txids[pos as usize];
    }
    let left = subtree_hash(n_transactions, height - 1, pos * 2, txids);
    let right = if pos * 2 + 1 < tree_width(n_transactions, height - 1) {
        subtree_hash(n_transactions, height - 1, pos * 2 + 1, txids)
    } else {
        left
    };
    merkle_hash_pair(&left, &right)
}

fn tree_height(n_transactions: u32) -> u32 {
    let mut height = 0u32;
    while tree_width(n_transactions, height) > 1 {
        height += 1;
    }
    height
}

fn tree_width(n_transactions: u32, height: u32) -> u32 {
    let n = u64::from(n_transactions);
    ((n + (1u64 << height) - 1) >> height) as u32
}

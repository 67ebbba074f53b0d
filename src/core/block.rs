//! Block and block header data model
//!
//! A header commits to the previous block, the merkle root of the
//! contained transaction ids, and the proof-of-work fields. The block hash
//! is the double SHA-256 of the header's 84-byte canonical encoding.

use crate::codec::{write_u32, write_u64, CodecError, Decodable, Encodable, Reader};
use crate::core::params::{subsidy, ChainParams};
use crate::core::pow::meets_target;
use crate::core::transaction::Transaction;
use crate::crypto::{hash256, merkle_root, Hash256};
use serde::{Deserialize, Serialize};

/// Current block version
pub const BLOCK_VERSION: u32 = 1;

/// Block header containing consensus metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    /// Hash of the previous block header (zero for genesis)
    pub prev_hash: Hash256,
    /// Merkle root over the txids of the contained transactions
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds
    pub timestamp: u64,
    /// Compact difficulty target
    pub bits: u32,
    /// Proof-of-work counter
    pub nonce: u64,
}

impl BlockHeader {
    /// The block hash: double SHA-256 of the canonical header encoding
    pub fn hash(&self) -> Hash256 {
        hash256(&self.to_vec())
    }

    /// Whether this header's hash satisfies its own target
    pub fn is_valid_pow(&self) -> bool {
        meets_target(&self.hash(), self.bits)
    }
}

impl Encodable for BlockHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        write_u32(out, self.version);
        self.prev_hash.encode(out);
        self.merkle_root.encode(out);
        write_u64(out, self.timestamp);
        write_u32(out, self.bits);
        write_u64(out, self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            version: r.read_u32()?,
            prev_hash: Hash256::decode(r)?,
            merkle_root: Hash256::decode(r)?,
            timestamp: r.read_u64()?,
            bits: r.read_u32()?,
            nonce: r.read_u64()?,
        })
    }
}

/// A block in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub height: u64,
    /// Transactions; the first must be the coinbase
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Assemble an unmined block over the given transactions
    pub fn new(
        height: u64,
        prev_hash: Hash256,
        transactions: Vec<Transaction>,
        bits: u32,
        timestamp: u64,
    ) -> Self {
        let merkle_root = Self::compute_merkle_root(&transactions);
        Self {
            header: BlockHeader {
                version: BLOCK_VERSION,
                prev_hash,
                merkle_root,
                timestamp,
                bits,
                nonce: 0,
            },
            height,
            transactions,
        }
    }

    /// The deterministic genesis block for a network.
    ///
    /// Never searched for proof of work: its hash anchors the chain and is
    /// not re-validated.
    pub fn genesis(params: &ChainParams) -> Self {
        let coinbase = Transaction::coinbase(
            params.chain_id,
            &params.genesis_address(),
            subsidy(0),
            0,
        );
        Self::new(
            0,
            Hash256::ZERO,
            vec![coinbase],
            params.genesis_bits,
            params.genesis_timestamp,
        )
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn compute_merkle_root(transactions: &[Transaction]) -> Hash256 {
        let txids: Vec<Hash256> = transactions.iter().map(|tx| tx.txid()).collect();
        merkle_root(&txids)
    }

    /// Whether the header's merkle root matches the contained transactions
    pub fn verify_merkle_root(&self) -> bool {
        Self::compute_merkle_root(&self.transactions) == self.header.merkle_root
    }

    /// The coinbase, if the block is well-formed enough to have one
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    /// Serialized size in bytes
    pub fn size(&self) -> usize {
        self.to_vec().len()
    }
}

impl Encodable for Block {
    fn encode(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        write_u64(out, self.height);
        self.transactions.encode(out);
    }
}

impl Decodable for Block {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            header: BlockHeader::decode(r)?,
            height: r.read_u64()?,
            transactions: Vec::<Transaction>::decode(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::COIN;

    #[test]
    fn test_header_encoding_is_fixed_width() {
        let genesis = Block::genesis(&ChainParams::regtest());
        assert_eq!(genesis.header.to_vec().len(), 84);
    }

    #[test]
    fn test_genesis_deterministic() {
        let params = ChainParams::mainnet();
        let g1 = Block::genesis(&params);
        let g2 = Block::genesis(&params);
        assert_eq!(g1.hash(), g2.hash());
        assert!(g1.header.prev_hash.is_zero());
        assert_eq!(g1.transactions[0].total_output(), 50 * COIN);
        assert!(g1.verify_merkle_root());
    }

    #[test]
    fn test_genesis_differs_per_network() {
        let mainnet = Block::genesis(&ChainParams::mainnet());
        let regtest = Block::genesis(&ChainParams::regtest());
        assert_ne!(mainnet.hash(), regtest.hash());
    }

    #[test]
    fn test_nonce_changes_hash() {
        let mut block = Block::genesis(&ChainParams::regtest());
        let original = block.hash();
        block.header.nonce += 1;
        assert_ne!(block.hash(), original);
    }

    #[test]
    fn test_merkle_root_detects_tampering() {
        let params = ChainParams::regtest();
        let mut block = Block::genesis(&params);
        assert!(block.verify_merkle_root());

        block.transactions[0].outputs[0].amount += 1;
        assert!(!block.verify_merkle_root());
    }

    #[test]
    fn test_block_round_trip() {
        let block = Block::genesis(&ChainParams::regtest());
        let decoded = Block::from_bytes(&block.to_vec()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }

    #[test]
    fn test_coinbase_accessor() {
        let block = Block::genesis(&ChainParams::regtest());
        assert!(block.coinbase().is_some());
    }
}

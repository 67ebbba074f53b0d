//! Blockchain state management
//!
//! Holds the canonical chain, the UTXO set, per-block undo records, and
//! lookup indices. `accept_block` is the single entry point for extending
//! the chain; it enforces every header, structure, and transaction rule
//! before the UTXO set is touched, so a rejected block leaves no trace.

use crate::codec::Encodable;
use crate::core::block::Block;
use crate::core::params::{
    subsidy, ChainParams, MAX_BLOCK_SIZE, MAX_FUTURE_BLOCK_TIME, MTP_BLOCK_COUNT,
};
use crate::core::pow::{block_work, meets_target, next_bits};
use crate::core::transaction::{OutPoint, Transaction};
use crate::core::utxo::{BlockUndo, UtxoEntry, UtxoSet};
use crate::core::validation::{validate_transaction, TxError};
use crate::crypto::Hash256;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Block validation and acceptance errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BlockError {
    #[error("Previous hash does not match the chain tip")]
    BadPrevHash,
    #[error("Block height {got} does not follow tip height {tip}")]
    BadHeight { got: u64, tip: u64 },
    #[error("Block timestamp outside the allowed window")]
    BadTimestamp,
    #[error("Header hash does not satisfy the difficulty target")]
    BadPoW,
    #[error("Compact target {got:#x} does not match the schedule {expected:#x}")]
    BadBits { expected: u32, got: u32 },
    #[error("Block size {0} exceeds limit")]
    Oversized(usize),
    #[error("Merkle root does not match transactions")]
    BadMerkleRoot,
    #[error("Bad coinbase: {0}")]
    BadCoinbase(&'static str),
    #[error("Coinbase claims {claimed}, at most {allowed} allowed")]
    BadCoinbaseValue { claimed: u64, allowed: u64 },
    #[error("Duplicate block")]
    Duplicate,
    #[error(transparent)]
    Tx(#[from] TxError),
}

/// Summary of chain state for status surfaces
#[derive(Debug, Clone)]
pub struct ChainInfo {
    pub height: u64,
    pub tip_hash: Hash256,
    pub utxo_count: usize,
    pub total_coins: u64,
    pub chain_work: u128,
    pub next_bits: u32,
    pub current_subsidy: u64,
    pub blocks_until_halving: u64,
}

/// The canonical chain and its derived state
pub struct Blockchain {
    params: ChainParams,
    blocks: Vec<Block>,
    utxo: UtxoSet,
    /// Undo record per accepted block, aligned with `blocks`
    undo_stack: Vec<BlockUndo>,
    /// Confirmed transaction locations: txid -> (height, index in block)
    tx_index: HashMap<Hash256, (u64, usize)>,
    /// Block hash -> height
    block_index: HashMap<Hash256, u64>,
    chain_work: u128,
}

impl Blockchain {
    /// Create a chain holding only the genesis block
    pub fn new(params: ChainParams) -> Self {
        let genesis = Block::genesis(&params);
        let mut utxo = UtxoSet::new();
        let undo = utxo
            .apply_block(&genesis)
            .expect("genesis applies to an empty set");

        let mut chain = Self {
            params,
            blocks: Vec::new(),
            utxo,
            undo_stack: vec![undo],
            tx_index: HashMap::new(),
            block_index: HashMap::new(),
            chain_work: block_work(genesis.header.bits),
        };
        chain.index_block(&genesis);
        chain.blocks.push(genesis);
        chain
    }

    /// Rebuild a chain from stored blocks, re-validating every one.
    /// `blocks[0]` must be this network's genesis.
    pub fn from_blocks(params: ChainParams, blocks: Vec<Block>) -> Result<Self, BlockError> {
        let mut chain = Self::new(params);
        let mut iter = blocks.into_iter();
        match iter.next() {
            Some(genesis) if genesis.hash() == chain.tip().hash() => {}
            _ => return Err(BlockError::BadPrevHash),
        }
        for block in iter {
            chain.accept_block(block)?;
        }
        Ok(chain)
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn tip(&self) -> &Block {
        self.blocks.last().expect("chain always holds genesis")
    }

    pub fn height(&self) -> u64 {
        self.blocks.len() as u64 - 1
    }

    pub fn utxo(&self) -> &UtxoSet {
        &self.utxo
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn get_block(&self, height: u64) -> Option<&Block> {
        self.blocks.get(height as usize)
    }

    pub fn get_block_by_hash(&self, hash: &Hash256) -> Option<&Block> {
        self.block_index
            .get(hash)
            .and_then(|&h| self.blocks.get(h as usize))
    }

    pub fn contains_block(&self, hash: &Hash256) -> bool {
        self.block_index.contains_key(hash)
    }

    /// Location of a confirmed transaction, if any
    pub fn get_tx_location(&self, txid: &Hash256) -> Option<(u64, usize)> {
        self.tx_index.get(txid).copied()
    }

    pub fn get_transaction(&self, txid: &Hash256) -> Option<&Transaction> {
        let (height, index) = self.get_tx_location(txid)?;
        self.blocks.get(height as usize)?.transactions.get(index)
    }

    pub fn chain_work(&self) -> u128 {
        self.chain_work
    }

    /// Median of the last 11 block timestamps
    pub fn median_time_past(&self) -> u64 {
        let mut times: Vec<u64> = self
            .blocks
            .iter()
            .rev()
            .take(MTP_BLOCK_COUNT)
            .map(|b| b.header.timestamp)
            .collect();
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Compact target required of the next block
    pub fn next_bits(&self) -> u32 {
        let headers: Vec<(u64, u32)> = self
            .blocks
            .iter()
            .map(|b| (b.header.timestamp, b.header.bits))
            .collect();
        next_bits(&self.params, &headers)
    }

    /// Validate and append a block extending the current tip.
    ///
    /// On any failure the chain, UTXO set, and indices are unchanged.
    pub fn accept_block(&mut self, block: Block) -> Result<(), BlockError> {
        let tip = self.tip();

        if self.block_index.contains_key(&block.hash()) {
            return Err(BlockError::Duplicate);
        }

        // Header checks
        if block.header.prev_hash != tip.hash() {
            return Err(BlockError::BadPrevHash);
        }
        if block.height != tip.height + 1 {
            return Err(BlockError::BadHeight {
                got: block.height,
                tip: tip.height,
            });
        }
        if block.header.timestamp <= self.median_time_past() {
            return Err(BlockError::BadTimestamp);
        }
        let now = Utc::now().timestamp() as u64;
        if block.header.timestamp > now + MAX_FUTURE_BLOCK_TIME {
            return Err(BlockError::BadTimestamp);
        }
        let expected_bits = self.next_bits();
        if block.header.bits != expected_bits {
            return Err(BlockError::BadBits {
                expected: expected_bits,
                got: block.header.bits,
            });
        }
        if !meets_target(&block.hash(), block.header.bits) {
            return Err(BlockError::BadPoW);
        }

        // Structure checks
        let size = block.to_vec().len();
        if size > MAX_BLOCK_SIZE {
            return Err(BlockError::Oversized(size));
        }
        let coinbase = match block.transactions.first() {
            Some(tx) if tx.is_coinbase() => tx,
            _ => return Err(BlockError::BadCoinbase("first transaction must be coinbase")),
        };
        if block.transactions.iter().skip(1).any(|tx| tx.is_coinbase()) {
            return Err(BlockError::BadCoinbase("multiple coinbase transactions"));
        }
        if coinbase.outputs.is_empty() {
            return Err(BlockError::BadCoinbase("coinbase has no outputs"));
        }
        if coinbase.locktime as u64 != block.height {
            return Err(BlockError::BadCoinbase("coinbase does not commit to height"));
        }
        if coinbase.chain_id != self.params.chain_id {
            return Err(BlockError::BadCoinbase("coinbase chain id mismatch"));
        }
        if !block.verify_merkle_root() {
            return Err(BlockError::BadMerkleRoot);
        }

        // Transaction checks against a view layering prior-in-block state
        let mut in_block_spends: HashSet<OutPoint> = HashSet::new();
        let mut in_block_outputs: HashMap<OutPoint, UtxoEntry> = HashMap::new();
        let mut fees: u64 = 0;

        let coinbase_txid = coinbase.txid();
        for (vout, output) in coinbase.outputs.iter().enumerate() {
            in_block_outputs.insert(
                OutPoint::new(coinbase_txid, vout as u32),
                UtxoEntry {
                    output: output.clone(),
                    height: block.height,
                    coinbase: true,
                },
            );
        }

        for tx in block.transactions.iter().skip(1) {
            let fee = {
                let view = self.utxo.view(&in_block_spends, &in_block_outputs);
                validate_transaction(tx, &view, block.height, self.params.chain_id)?
            };
            fees = fees.checked_add(fee).ok_or(TxError::MoneyRange)?;

            for input in &tx.inputs {
                in_block_spends.insert(input.prev);
            }
            let txid = tx.txid();
            for (vout, output) in tx.outputs.iter().enumerate() {
                in_block_outputs.insert(
                    OutPoint::new(txid, vout as u32),
                    UtxoEntry {
                        output: output.clone(),
                        height: block.height,
                        coinbase: false,
                    },
                );
            }
        }

        // Coinbase may claim at most subsidy plus the fees it collected
        let allowed = subsidy(block.height).saturating_add(fees);
        let claimed = coinbase.total_output();
        if claimed > allowed {
            return Err(BlockError::BadCoinbaseValue { claimed, allowed });
        }

        // All rules hold; mutate state. apply_block re-checks input
        // existence and is atomic, so a failure here cannot corrupt the set.
        let undo = self
            .utxo
            .apply_block(&block)
            .map_err(|_| BlockError::Tx(TxError::InputMissing(OutPoint::new(Hash256::ZERO, 0))))?;

        self.chain_work += block_work(block.header.bits);
        self.undo_stack.push(undo);
        self.index_block(&block);
        log::info!(
            "Accepted block {} at height {} ({} txs, {} fees)",
            block.hash(),
            block.height,
            block.transactions.len(),
            fees
        );
        self.blocks.push(block);

        Ok(())
    }

    /// Disconnect the tip block, rolling the UTXO set and indices back.
    /// The genesis block cannot be disconnected.
    ///
    /// This is the reorganization hook: a branch switch is a sequence of
    /// disconnects followed by accepts.
    pub fn disconnect_tip(&mut self) -> Option<Block> {
        if self.blocks.len() <= 1 {
            return None;
        }
        let block = self.blocks.pop().expect("length checked above");
        let undo = self.undo_stack.pop().expect("undo aligned with blocks");
        self.utxo.rollback(&undo);
        self.chain_work -= block_work(block.header.bits);
        self.block_index.remove(&block.hash());
        for tx in &block.transactions {
            self.tx_index.remove(&tx.txid());
        }
        log::info!("Disconnected block {} at height {}", block.hash(), block.height);
        Some(block)
    }

    fn index_block(&mut self, block: &Block) {
        self.block_index.insert(block.hash(), block.height);
        for (index, tx) in block.transactions.iter().enumerate() {
            self.tx_index.insert(tx.txid(), (block.height, index));
        }
    }

    /// Exponentially spaced block locator from the tip back to genesis
    pub fn locator(&self) -> Vec<Hash256> {
        let mut locator = Vec::new();
        let mut index = self.height() as i64;
        let mut step: i64 = 1;

        while index > 0 {
            locator.push(self.blocks[index as usize].hash());
            if locator.len() >= 10 {
                step *= 2;
            }
            index -= step;
        }
        locator.push(self.blocks[0].hash());
        locator
    }

    /// Height just past the most recent locator hash found in our chain.
    /// Unknown locators start the caller from height 1 (past genesis).
    pub fn locate_fork(&self, locator: &[Hash256]) -> u64 {
        for hash in locator {
            if let Some(&height) = self.block_index.get(hash) {
                return height + 1;
            }
        }
        1
    }

    /// Balance of an address, counting immature coinbase outputs
    pub fn balance(&self, address: &str) -> u64 {
        self.utxo.balance(address)
    }

    /// Spendable outputs for an address at the next block height,
    /// excluding immature coinbases
    pub fn spendable_utxos(&self, address: &str) -> Vec<(OutPoint, UtxoEntry)> {
        let next_height = self.height() + 1;
        self.utxo
            .utxos_for_address(address)
            .into_iter()
            .filter(|(_, entry)| {
                !entry.coinbase
                    || next_height.saturating_sub(entry.height)
                        >= crate::core::params::COINBASE_MATURITY
            })
            .collect()
    }

    pub fn spendable_balance(&self, address: &str) -> u64 {
        self.spendable_utxos(address)
            .iter()
            .map(|(_, e)| e.output.amount)
            .sum()
    }

    pub fn info(&self) -> ChainInfo {
        use crate::core::params::HALVING_INTERVAL;
        let height = self.height();
        ChainInfo {
            height,
            tip_hash: self.tip().hash(),
            utxo_count: self.utxo.len(),
            total_coins: self.utxo.total_amount(),
            chain_work: self.chain_work,
            next_bits: self.next_bits(),
            current_subsidy: subsidy(height + 1),
            blocks_until_halving: HALVING_INTERVAL - (height + 1) % HALVING_INTERVAL,
        }
    }
}

//! Transaction pool for pending transactions
//!
//! Admission validates against the chain UTXO set overlaid with the pool's
//! own spends and outputs, so the pool never holds two transactions
//! spending the same outpoint and chains of unconfirmed parents are
//! accepted. Entries are evicted by fee rate when the pool is full,
//! removed on confirmation or conflict, and expired by age.

use crate::core::blockchain::Blockchain;
use crate::core::params::{MAX_MEMPOOL_BYTES, MEMPOOL_EXPIRY, MIN_RELAY_FEE};
use crate::core::transaction::{OutPoint, Transaction};
use crate::core::utxo::UtxoEntry;
use crate::core::validation::{validate_transaction, TxError};
use crate::crypto::Hash256;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Mempool admission errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MempoolError {
    #[error("Transaction already in mempool")]
    Duplicate,
    #[error("Fee rate {rate} below minimum relay fee {min}")]
    FeeTooLow { rate: u64, min: u64 },
    #[error("Mempool full and fee rate too low to evict")]
    Full,
    #[error(transparent)]
    Tx(#[from] TxError),
}

/// A pending transaction with its admission metadata
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    /// Unix timestamp when the transaction was admitted
    pub received_at: u64,
    pub fee: u64,
    /// Fee per 1000 bytes
    pub fee_rate: u64,
    pub size: usize,
}

/// Summary counters for status surfaces
#[derive(Debug, Clone)]
pub struct MempoolStats {
    pub tx_count: usize,
    pub total_bytes: usize,
    pub total_fees: u64,
}

/// Pool of valid, unconfirmed transactions awaiting a block
#[derive(Debug)]
pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    /// Outpoints spent by pool transactions, for double-spend exclusion
    spent: HashMap<OutPoint, Hash256>,
    total_bytes: usize,
    max_bytes: usize,
}

impl Mempool {
    pub fn new() -> Self {
        Self::with_capacity(MAX_MEMPOOL_BYTES)
    }

    pub fn with_capacity(max_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            spent: HashMap::new(),
            total_bytes: 0,
            max_bytes,
        }
    }

    /// Validate and admit a transaction.
    ///
    /// The transaction may spend outputs of other pool transactions;
    /// outpoints already spent in the pool are rejected as double-spends.
    pub fn add_transaction(
        &mut self,
        tx: Transaction,
        chain: &Blockchain,
    ) -> Result<Hash256, MempoolError> {
        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return Err(MempoolError::Duplicate);
        }

        let fee = {
            let spends: HashSet<OutPoint> = self.spent.keys().copied().collect();
            let outputs = self.pending_outputs(chain.height() + 1);
            let view = chain.utxo().view(&spends, &outputs);
            validate_transaction(&tx, &view, chain.height() + 1, chain.params().chain_id)?
        };

        let size = tx.size();
        let fee_rate = fee.saturating_mul(1000) / size.max(1) as u64;
        if fee_rate < MIN_RELAY_FEE {
            return Err(MempoolError::FeeTooLow {
                rate: fee_rate,
                min: MIN_RELAY_FEE,
            });
        }

        // Evict from the cheap end until the new transaction fits
        while self.total_bytes + size > self.max_bytes {
            match self.lowest_fee_rate_txid() {
                Some(victim) => {
                    let victim_rate = self.entries[&victim].fee_rate;
                    if victim_rate >= fee_rate {
                        return Err(MempoolError::Full);
                    }
                    self.remove(&victim);
                }
                None => return Err(MempoolError::Full),
            }
        }

        for input in &tx.inputs {
            self.spent.insert(input.prev, txid);
        }
        self.total_bytes += size;
        self.entries.insert(
            txid,
            MempoolEntry {
                tx,
                received_at: Utc::now().timestamp() as u64,
                fee,
                fee_rate,
                size,
            },
        );
        log::debug!("Admitted {} to mempool (fee rate {})", txid, fee_rate);
        Ok(txid)
    }

    /// Outputs created by pool transactions, visible to dependent spends
    fn pending_outputs(&self, next_height: u64) -> HashMap<OutPoint, UtxoEntry> {
        let mut outputs = HashMap::new();
        for entry in self.entries.values() {
            let txid = entry.tx.txid();
            for (vout, output) in entry.tx.outputs.iter().enumerate() {
                outputs.insert(
                    OutPoint::new(txid, vout as u32),
                    UtxoEntry {
                        output: output.clone(),
                        height: next_height,
                        coinbase: false,
                    },
                );
            }
        }
        outputs
    }

    fn lowest_fee_rate_txid(&self) -> Option<Hash256> {
        self.entries
            .values()
            .min_by_key(|e| e.fee_rate)
            .map(|e| e.tx.txid())
    }

    /// Remove a transaction and unindex its spends
    pub fn remove(&mut self, txid: &Hash256) -> Option<Transaction> {
        let entry = self.entries.remove(txid)?;
        for input in &entry.tx.inputs {
            self.spent.remove(&input.prev);
        }
        self.total_bytes -= entry.size;
        Some(entry.tx)
    }

    /// Greedy selection for a block template: descending fee rate, parents
    /// always before children, until the byte or sigop budget runs out.
    pub fn select_for_block(
        &self,
        chain: &Blockchain,
        max_bytes: usize,
        max_sigops: usize,
    ) -> Vec<Transaction> {
        let mut candidates: Vec<&MempoolEntry> = self.entries.values().collect();
        candidates.sort_by(|a, b| b.fee_rate.cmp(&a.fee_rate));

        let mut selected: Vec<Transaction> = Vec::new();
        let mut selected_ids: HashSet<Hash256> = HashSet::new();
        let mut bytes = 0usize;
        let mut sigops = 0usize;

        // Each pass admits transactions whose parents are already satisfied;
        // repeat until nothing more fits so child-after-parent order holds
        loop {
            let mut progressed = false;
            for entry in &candidates {
                let txid = entry.tx.txid();
                if selected_ids.contains(&txid) {
                    continue;
                }
                if bytes + entry.size > max_bytes
                    || sigops + entry.tx.inputs.len() > max_sigops
                {
                    continue;
                }
                let parents_ready = entry.tx.inputs.iter().all(|input| {
                    chain.utxo().contains(&input.prev)
                        || selected_ids.contains(&input.prev.txid)
                });
                if !parents_ready {
                    continue;
                }
                selected.push(entry.tx.clone());
                selected_ids.insert(txid);
                bytes += entry.size;
                sigops += entry.tx.inputs.len();
                progressed = true;
            }
            if !progressed {
                break;
            }
        }

        selected
    }

    /// Purge after a block is accepted: drop the confirmed transactions and
    /// anything made unspendable by the block's spends.
    pub fn purge_block(&mut self, confirmed: &[Transaction]) {
        let mut block_spends: HashSet<OutPoint> = HashSet::new();
        for tx in confirmed {
            self.remove(&tx.txid());
            for input in &tx.inputs {
                block_spends.insert(input.prev);
            }
        }

        let conflicting: Vec<Hash256> = self
            .entries
            .values()
            .filter(|e| e.tx.inputs.iter().any(|i| block_spends.contains(&i.prev)))
            .map(|e| e.tx.txid())
            .collect();
        for txid in conflicting {
            log::debug!("Evicting {} from mempool: inputs confirmed elsewhere", txid);
            self.remove(&txid);
        }
    }

    /// Drop entries older than the expiry window
    pub fn expire(&mut self, now: u64) -> usize {
        let expired: Vec<Hash256> = self
            .entries
            .values()
            .filter(|e| now.saturating_sub(e.received_at) > MEMPOOL_EXPIRY)
            .map(|e| e.tx.txid())
            .collect();
        for txid in &expired {
            self.remove(txid);
        }
        expired.len()
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    /// Whether any pool transaction already spends this outpoint
    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spent.contains_key(outpoint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.entries.keys().copied().collect()
    }

    pub fn stats(&self) -> MempoolStats {
        MempoolStats {
            tx_count: self.entries.len(),
            total_bytes: self.total_bytes,
            total_fees: self.entries.values().map(|e| e.fee).sum(),
        }
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::blockchain::Blockchain;
    use crate::core::params::{subsidy, ChainParams, COIN, COINBASE_MATURITY, MAX_BLOCK_SIGOPS};
    use crate::core::pow::meets_target;
    use crate::core::transaction::TransactionBuilder;
    use crate::core::Block;
    use crate::crypto::KeyPair;

    /// Chain where `key` owns mature coinbases from blocks 1 and 2
    fn funded_chain2(key: &KeyPair) -> (Blockchain, OutPoint, OutPoint) {
        let mut chain = Blockchain::new(ChainParams::regtest());
        let mut ops = Vec::new();
        for _ in 0..=(COINBASE_MATURITY + 1) {
            let height = chain.height() + 1;
            let recipient = if height <= 2 {
                key.address()
            } else {
                "filler".to_string()
            };
            let coinbase =
                Transaction::coinbase(chain.params().chain_id, &recipient, subsidy(height), height);
            if height <= 2 {
                ops.push(OutPoint::new(coinbase.txid(), 0));
            }
            let mut block = Block::new(
                height,
                chain.tip().hash(),
                vec![coinbase],
                chain.next_bits(),
                chain.median_time_past() + 1,
            );
            while !meets_target(&block.hash(), block.header.bits) {
                block.header.nonce += 1;
            }
            chain.accept_block(block).unwrap();
        }
        (chain, ops[0], ops[1])
    }

    /// Chain where `key` owns a mature coinbase from block 1
    fn funded_chain(key: &KeyPair) -> (Blockchain, OutPoint) {
        let (chain, op, _) = funded_chain2(key);
        (chain, op)
    }

    /// Spend leaving a generous fee so the relay floor is met
    fn spend_with_fee(key: &KeyPair, outpoint: OutPoint, to: &str, amount: u64) -> Transaction {
        TransactionBuilder::new(1)
            .add_input(outpoint)
            .add_output(to, amount)
            .build_and_sign(key)
            .unwrap()
    }

    #[test]
    fn test_admit_and_duplicate() {
        let key = KeyPair::generate();
        let (chain, outpoint) = funded_chain(&key);
        let mut mempool = Mempool::new();

        let tx = spend_with_fee(&key, outpoint, "recipient", 49 * COIN);
        let txid = mempool.add_transaction(tx.clone(), &chain).unwrap();
        assert!(mempool.contains(&txid));
        assert_eq!(
            mempool.add_transaction(tx, &chain),
            Err(MempoolError::Duplicate)
        );
    }

    #[test]
    fn test_double_spend_rejected() {
        let key = KeyPair::generate();
        let (chain, outpoint) = funded_chain(&key);
        let mut mempool = Mempool::new();

        let tx1 = spend_with_fee(&key, outpoint, "first", 49 * COIN);
        let tx2 = spend_with_fee(&key, outpoint, "second", 48 * COIN);

        mempool.add_transaction(tx1, &chain).unwrap();
        let before = mempool.len();
        assert!(matches!(
            mempool.add_transaction(tx2, &chain),
            Err(MempoolError::Tx(TxError::DoubleSpend(_)))
        ));
        assert_eq!(mempool.len(), before);
    }

    #[test]
    fn test_unconfirmed_chain_accepted() {
        let key = KeyPair::generate();
        let (chain, outpoint) = funded_chain(&key);
        let mut mempool = Mempool::new();

        let parent = spend_with_fee(&key, outpoint, &key.address(), 49 * COIN);
        let child = spend_with_fee(
            &key,
            OutPoint::new(parent.txid(), 0),
            "grandchild",
            48 * COIN,
        );

        mempool.add_transaction(parent.clone(), &chain).unwrap();
        mempool.add_transaction(child.clone(), &chain).unwrap();

        // Selection orders the parent before the child despite its lower fee
        let selected = mempool.select_for_block(&chain, 1_000_000, MAX_BLOCK_SIGOPS);
        let parent_pos = selected.iter().position(|t| t.txid() == parent.txid());
        let child_pos = selected.iter().position(|t| t.txid() == child.txid());
        assert!(parent_pos.unwrap() < child_pos.unwrap());
    }

    #[test]
    fn test_fee_too_low_rejected() {
        let key = KeyPair::generate();
        let (chain, outpoint) = funded_chain(&key);
        let mut mempool = Mempool::new();

        // Fee of zero: below any relay floor
        let tx = spend_with_fee(&key, outpoint, "recipient", 50 * COIN);
        assert!(matches!(
            mempool.add_transaction(tx, &chain),
            Err(MempoolError::FeeTooLow { .. })
        ));
    }

    #[test]
    fn test_purge_confirmed_and_conflicting() {
        let key = KeyPair::generate();
        let (chain, outpoint) = funded_chain(&key);
        let mut mempool = Mempool::new();

        let tx = spend_with_fee(&key, outpoint, "recipient", 49 * COIN);
        mempool.add_transaction(tx.clone(), &chain).unwrap();

        // A block confirming a different spend of the same outpoint purges ours
        let competing = spend_with_fee(&key, outpoint, "other", 48 * COIN);
        mempool.purge_block(&[competing]);
        assert!(mempool.is_empty());
        assert!(!mempool.is_spent(&outpoint));
    }

    #[test]
    fn test_expiry() {
        let key = KeyPair::generate();
        let (chain, outpoint) = funded_chain(&key);
        let mut mempool = Mempool::new();

        let tx = spend_with_fee(&key, outpoint, "recipient", 49 * COIN);
        mempool.add_transaction(tx, &chain).unwrap();

        let now = Utc::now().timestamp() as u64;
        assert_eq!(mempool.expire(now), 0);
        assert_eq!(mempool.expire(now + MEMPOOL_EXPIRY + 1), 1);
        assert!(mempool.is_empty());
    }

    #[test]
    fn test_eviction_prefers_low_fee_rate() {
        let key = KeyPair::generate();
        let (chain, op1, op2) = funded_chain2(&key);

        // Pool with room for roughly one transaction
        let mut mempool = Mempool::with_capacity(250);

        let cheap = spend_with_fee(&key, op1, "cheap", 49 * COIN + COIN / 2);
        let cheap_id = mempool.add_transaction(cheap, &chain).unwrap();

        // A higher-fee independent spend evicts the cheap one to make room
        let rich = spend_with_fee(&key, op2, "rich", 45 * COIN);
        let rich_id = mempool.add_transaction(rich, &chain).unwrap();

        assert!(!mempool.contains(&cheap_id));
        assert!(mempool.contains(&rich_id));
        assert_eq!(mempool.len(), 1);
    }

    #[test]
    fn test_full_pool_rejects_cheaper_tx() {
        let key = KeyPair::generate();
        let (chain, op1, op2) = funded_chain2(&key);
        let mut mempool = Mempool::with_capacity(250);

        let rich = spend_with_fee(&key, op1, "rich", 45 * COIN);
        mempool.add_transaction(rich, &chain).unwrap();

        let cheap = spend_with_fee(&key, op2, "cheap", 49 * COIN + COIN / 2);
        assert_eq!(
            mempool.add_transaction(cheap, &chain),
            Err(MempoolError::Full)
        );
    }
}

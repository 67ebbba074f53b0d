//! UTXO set management
//!
//! The authoritative ledger state: a map from outpoint to unspent output.
//! Blocks are applied atomically and every application produces an undo
//! record that restores the set byte-for-byte on rollback. Overlay views
//! layer pending spends and outputs on top of the set so mempool and
//! in-block validation never mutate it.

use crate::core::block::Block;
use crate::core::transaction::{OutPoint, TxOutput};
use crate::crypto::Hash256;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Errors from applying a block to the UTXO set
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ApplyError {
    #[error("Input {0} not found in UTXO set")]
    MissingInput(OutPoint),
    #[error("Output {0} already exists in UTXO set")]
    DuplicateOutput(OutPoint),
}

/// An unspent output together with its provenance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub output: TxOutput,
    /// Height of the block that created this output
    pub height: u64,
    /// Whether the creating transaction was a coinbase (maturity applies)
    pub coinbase: bool,
}

/// Read-only view of spendable outputs used by validation
pub trait UtxoView {
    fn get(&self, outpoint: &OutPoint) -> Option<UtxoEntry>;

    /// Whether the outpoint is known to be spent by a pending transaction.
    /// Distinguishes a double-spend from an output that never existed.
    fn is_spent(&self, _outpoint: &OutPoint) -> bool {
        false
    }
}

/// Record of the UTXO mutations made by one block, sufficient to undo them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockUndo {
    pub block_hash: Hash256,
    /// Entries removed by the block, to be restored on rollback
    pub spent: Vec<(OutPoint, UtxoEntry)>,
    /// Outpoints created by the block, to be removed on rollback
    pub created: Vec<OutPoint>,
}

/// The set of all unspent transaction outputs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UtxoSet {
    entries: HashMap<OutPoint, UtxoEntry>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.entries.get(outpoint)
    }

    /// Add a single unspent output
    pub fn add(&mut self, outpoint: OutPoint, entry: UtxoEntry) {
        self.entries.insert(outpoint, entry);
    }

    /// Remove a spent output, returning it if present
    pub fn remove(&mut self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.entries.remove(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.entries.contains_key(outpoint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all unspent amounts
    pub fn total_amount(&self) -> u64 {
        self.entries.values().map(|e| e.output.amount).sum()
    }

    /// All unspent outputs paying the given address
    pub fn utxos_for_address(&self, address: &str) -> Vec<(OutPoint, UtxoEntry)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.output.is_owned_by(address))
            .map(|(op, e)| (*op, e.clone()))
            .collect()
    }

    pub fn balance(&self, address: &str) -> u64 {
        self.entries
            .values()
            .filter(|e| e.output.is_owned_by(address))
            .map(|e| e.output.amount)
            .sum()
    }

    /// Apply a block: remove every spent outpoint and add every new output.
    ///
    /// The application is atomic. All lookups run against a staged delta
    /// first, so nothing is committed unless the whole block applies, and
    /// outputs created earlier in the block are spendable later in it.
    pub fn apply_block(&mut self, block: &Block) -> Result<BlockUndo, ApplyError> {
        let mut spent: Vec<(OutPoint, UtxoEntry)> = Vec::new();
        let mut spent_keys: HashSet<OutPoint> = HashSet::new();
        let mut added: HashMap<OutPoint, UtxoEntry> = HashMap::new();
        let mut added_order: Vec<OutPoint> = Vec::new();

        for tx in &block.transactions {
            for input in &tx.inputs {
                // Spending an output created earlier in this same block
                if added.remove(&input.prev).is_some() {
                    added_order.retain(|op| op != &input.prev);
                    continue;
                }
                if spent_keys.contains(&input.prev) {
                    return Err(ApplyError::MissingInput(input.prev));
                }
                match self.entries.get(&input.prev) {
                    Some(entry) => {
                        spent.push((input.prev, entry.clone()));
                        spent_keys.insert(input.prev);
                    }
                    None => return Err(ApplyError::MissingInput(input.prev)),
                }
            }

            let txid = tx.txid();
            for (vout, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(txid, vout as u32);
                if self.entries.contains_key(&outpoint) && !spent_keys.contains(&outpoint) {
                    return Err(ApplyError::DuplicateOutput(outpoint));
                }
                if added.contains_key(&outpoint) {
                    return Err(ApplyError::DuplicateOutput(outpoint));
                }
                added.insert(
                    outpoint,
                    UtxoEntry {
                        output: output.clone(),
                        height: block.height,
                        coinbase: tx.is_coinbase(),
                    },
                );
                added_order.push(outpoint);
            }
        }

        // Commit the staged delta
        for (outpoint, _) in &spent {
            self.entries.remove(outpoint);
        }
        for outpoint in &added_order {
            let entry = added
                .get(outpoint)
                .expect("staged outpoint present in delta");
            self.entries.insert(*outpoint, entry.clone());
        }

        Ok(BlockUndo {
            block_hash: block.hash(),
            spent,
            created: added_order,
        })
    }

    /// Undo a previously applied block: remove its outputs and restore the
    /// entries it spent
    pub fn rollback(&mut self, undo: &BlockUndo) {
        for outpoint in &undo.created {
            self.entries.remove(outpoint);
        }
        for (outpoint, entry) in &undo.spent {
            self.entries.insert(*outpoint, entry.clone());
        }
    }

    /// Cheap immutable overlay for validating against pending state
    pub fn view<'a>(
        &'a self,
        extra_spends: &'a HashSet<OutPoint>,
        extra_outputs: &'a HashMap<OutPoint, UtxoEntry>,
    ) -> OverlayView<'a> {
        OverlayView {
            base: self,
            extra_spends,
            extra_outputs,
        }
    }
}

impl UtxoView for UtxoSet {
    fn get(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.entries.get(outpoint).cloned()
    }
}

/// Immutable layering of pending spends and outputs over a `UtxoSet`
pub struct OverlayView<'a> {
    base: &'a UtxoSet,
    extra_spends: &'a HashSet<OutPoint>,
    extra_outputs: &'a HashMap<OutPoint, UtxoEntry>,
}

impl UtxoView for OverlayView<'_> {
    fn get(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        if self.extra_spends.contains(outpoint) {
            return None;
        }
        if let Some(entry) = self.extra_outputs.get(outpoint) {
            return Some(entry.clone());
        }
        self.base.get(outpoint).cloned()
    }

    fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.extra_spends.contains(outpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::Block;
    use crate::core::params::ChainParams;
    use crate::core::transaction::{Transaction, TransactionBuilder};
    use crate::crypto::{hash256, KeyPair};

    fn chain_with_genesis() -> (ChainParams, UtxoSet, Block) {
        let params = ChainParams::regtest();
        let genesis = Block::genesis(&params);
        let mut utxo = UtxoSet::new();
        utxo.apply_block(&genesis).unwrap();
        (params, utxo, genesis)
    }

    fn next_block(params: &ChainParams, prev: &Block, txs: Vec<Transaction>) -> Block {
        let height = prev.height + 1;
        let coinbase = Transaction::coinbase(params.chain_id, "miner", 50, height);
        let mut all = vec![coinbase];
        all.extend(txs);
        Block::new(
            height,
            prev.hash(),
            all,
            params.genesis_bits,
            prev.header.timestamp + 600,
        )
    }

    #[test]
    fn test_apply_genesis_creates_subsidy_output() {
        let (params, utxo, genesis) = chain_with_genesis();
        assert_eq!(utxo.len(), 1);
        let outpoint = OutPoint::new(genesis.transactions[0].txid(), 0);
        let entry = utxo.get(&outpoint).unwrap();
        assert!(entry.coinbase);
        assert_eq!(entry.height, 0);
        assert_eq!(entry.output.script_pubkey, params.genesis_address());
    }

    #[test]
    fn test_apply_then_rollback_restores_exactly() {
        let (params, mut utxo, genesis) = chain_with_genesis();
        let before = utxo.clone();

        let block = next_block(&params, &genesis, vec![]);
        let undo = utxo.apply_block(&block).unwrap();
        assert_eq!(utxo.len(), 2);

        utxo.rollback(&undo);
        assert_eq!(utxo.entries, before.entries);
    }

    #[test]
    fn test_apply_missing_input_leaves_set_untouched() {
        let (params, mut utxo, genesis) = chain_with_genesis();
        let before = utxo.clone();

        let key = KeyPair::generate();
        let bogus = TransactionBuilder::new(params.chain_id)
            .add_input(OutPoint::new(hash256(b"no such tx"), 0))
            .add_output("someone", 10)
            .build_and_sign(&key)
            .unwrap();
        let block = next_block(&params, &genesis, vec![bogus]);

        assert!(matches!(
            utxo.apply_block(&block),
            Err(ApplyError::MissingInput(_))
        ));
        assert_eq!(utxo.entries, before.entries);
    }

    #[test]
    fn test_in_block_chained_spend() {
        let (params, mut utxo, genesis) = chain_with_genesis();

        // First block pays the miner, second block has a tx chain: the
        // coinbase-funded tx is spent by a child inside the same block
        let key = KeyPair::generate();
        let block1 = {
            let coinbase =
                Transaction::coinbase(params.chain_id, &key.address(), 50, genesis.height + 1);
            Block::new(
                1,
                genesis.hash(),
                vec![coinbase],
                params.genesis_bits,
                genesis.header.timestamp + 600,
            )
        };
        let coinbase_op = OutPoint::new(block1.transactions[0].txid(), 0);
        utxo.apply_block(&block1).unwrap();

        let parent = TransactionBuilder::new(params.chain_id)
            .add_input(coinbase_op)
            .add_output(&key.address(), 50)
            .build_and_sign(&key)
            .unwrap();
        let child = TransactionBuilder::new(params.chain_id)
            .add_input(OutPoint::new(parent.txid(), 0))
            .add_output("final", 50)
            .build_and_sign(&key)
            .unwrap();
        let child_op = OutPoint::new(child.txid(), 0);

        let block2 = next_block(&params, &block1, vec![parent.clone(), child]);
        let undo = utxo.apply_block(&block2).unwrap();

        // The intermediate output was created and spent within the block
        assert!(utxo.get(&OutPoint::new(parent.txid(), 0)).is_none());
        assert!(utxo.get(&child_op).is_some());
        assert!(utxo.get(&coinbase_op).is_none());

        // Rollback restores the coinbase output and removes the child's
        utxo.rollback(&undo);
        assert!(utxo.get(&coinbase_op).is_some());
        assert!(utxo.get(&child_op).is_none());
    }

    #[test]
    fn test_overlay_view_spend_and_output_layers() {
        let (params, utxo, genesis) = chain_with_genesis();
        let genesis_op = OutPoint::new(genesis.transactions[0].txid(), 0);

        let mut spends = HashSet::new();
        let mut outputs = HashMap::new();
        let pending_op = OutPoint::new(hash256(b"pending tx"), 0);
        outputs.insert(
            pending_op,
            UtxoEntry {
                output: TxOutput::new(10, "pending recipient"),
                height: 1,
                coinbase: false,
            },
        );
        spends.insert(genesis_op);

        let view = utxo.view(&spends, &outputs);
        assert!(view.get(&genesis_op).is_none());
        assert!(view.is_spent(&genesis_op));
        assert!(view.get(&pending_op).is_some());
        let _ = params;
    }
}

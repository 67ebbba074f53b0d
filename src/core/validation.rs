//! Transaction validation
//!
//! Purely functional over a `UtxoView`: checks structure, input existence,
//! coinbase maturity, signatures, and value conservation, and returns the
//! fee on success. Each check fails early with the most specific error.

use crate::codec::Encodable;
use crate::core::params::{COINBASE_MATURITY, MAX_MONEY, MAX_TX_SIZE};
use crate::core::transaction::{OutPoint, Transaction};
use crate::core::utxo::UtxoView;
use crate::crypto::{pubkey_to_address, verify_signature};
use std::collections::HashSet;
use thiserror::Error;

/// Transaction validation errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TxError {
    #[error("Transaction has no outputs")]
    NoOutputs,
    #[error("Output amount outside money range")]
    MoneyRange,
    #[error("Transaction size {0} exceeds limit")]
    Oversized(usize),
    #[error("Chain id mismatch: expected {expected}, got {got}")]
    ChainIdMismatch { expected: u32, got: u32 },
    #[error("Coinbase transaction outside a block")]
    CoinbaseOutsideBlock,
    #[error("Input {0} not found")]
    InputMissing(OutPoint),
    #[error("Input {0} is already spent")]
    DoubleSpend(OutPoint),
    #[error("Coinbase input needs {missing} more confirmations")]
    CoinbaseImmature { missing: u64 },
    #[error("Bad signature on input {0}")]
    BadSignature(usize),
    #[error("Inputs are worth less than outputs")]
    NegativeFee,
}

/// Validate a transaction against a UTXO view at the given chain context.
///
/// `height` is the height the transaction would confirm at (used for
/// coinbase maturity). Returns the fee. Never mutates the view.
pub fn validate_transaction(
    tx: &Transaction,
    view: &dyn UtxoView,
    height: u64,
    chain_id: u32,
) -> Result<u64, TxError> {
    // Structural checks first: they need no UTXO context
    if tx.outputs.is_empty() {
        return Err(TxError::NoOutputs);
    }
    let mut output_total: u64 = 0;
    for output in &tx.outputs {
        if output.amount > MAX_MONEY {
            return Err(TxError::MoneyRange);
        }
        output_total = output_total
            .checked_add(output.amount)
            .filter(|&t| t <= MAX_MONEY)
            .ok_or(TxError::MoneyRange)?;
    }
    if tx.chain_id != chain_id {
        return Err(TxError::ChainIdMismatch {
            expected: chain_id,
            got: tx.chain_id,
        });
    }
    let size = tx.to_vec().len();
    if size > MAX_TX_SIZE {
        return Err(TxError::Oversized(size));
    }

    // Coinbase rules are enforced by block validation
    if tx.is_coinbase() {
        return Err(TxError::CoinbaseOutsideBlock);
    }

    let mut input_total: u64 = 0;
    let mut seen: HashSet<OutPoint> = HashSet::new();

    for (index, input) in tx.inputs.iter().enumerate() {
        if !seen.insert(input.prev) {
            return Err(TxError::DoubleSpend(input.prev));
        }
        if view.is_spent(&input.prev) {
            return Err(TxError::DoubleSpend(input.prev));
        }
        let entry = view
            .get(&input.prev)
            .ok_or(TxError::InputMissing(input.prev))?;

        if entry.coinbase {
            let confirmations = height.saturating_sub(entry.height);
            if confirmations < COINBASE_MATURITY {
                return Err(TxError::CoinbaseImmature {
                    missing: COINBASE_MATURITY - confirmations,
                });
            }
        }

        // The spender's key must hash to the address the output pays
        let address =
            pubkey_to_address(&input.pubkey).map_err(|_| TxError::BadSignature(index))?;
        if address != entry.output.script_pubkey {
            return Err(TxError::BadSignature(index));
        }
        let sighash = tx.sighash(index);
        match verify_signature(&input.pubkey, &sighash, &input.signature) {
            Ok(true) => {}
            _ => return Err(TxError::BadSignature(index)),
        }

        input_total = input_total
            .checked_add(entry.output.amount)
            .ok_or(TxError::MoneyRange)?;
    }

    input_total
        .checked_sub(output_total)
        .ok_or(TxError::NegativeFee)
}

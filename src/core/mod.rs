//! Core consensus components
//!
//! The fundamental building blocks:
//! - Transactions and outpoints (UTXO model)
//! - Blocks and headers with compact-target proof of work
//! - The UTXO set with atomic apply/rollback
//! - Transaction and block validation
//! - The canonical chain

pub mod block;
pub mod blockchain;
pub mod params;
pub mod pow;
pub mod transaction;
pub mod utxo;
pub mod validation;

pub use block::{Block, BlockHeader};
pub use blockchain::{BlockError, Blockchain, ChainInfo};
pub use params::{
    subsidy, ChainParams, COIN, COINBASE_MATURITY, HALVING_INTERVAL, MAX_BLOCK_SIZE, MAX_MONEY,
    MAX_TX_SIZE, RETARGET_INTERVAL, TARGET_BLOCK_TIME,
};
pub use transaction::{OutPoint, Transaction, TransactionBuilder, TxInput, TxOutput};
pub use utxo::{ApplyError, BlockUndo, OverlayView, UtxoEntry, UtxoSet, UtxoView};
pub use validation::{validate_transaction, TxError};

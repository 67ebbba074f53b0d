//! ironcoin: a minimalistic UTXO-based cryptocurrency node
//!
//! This crate implements the consensus core of a proof-of-work
//! cryptocurrency:
//! - ECDSA signatures (secp256k1) with enforced low-S values
//! - Canonical serialization for hashing, signing, and the wire
//! - A UTXO ledger with atomic block apply and rollback
//! - Transaction and block validation with replay protection
//! - A fee-prioritized mempool
//! - Longest-chain proof of work with compact-target retargeting
//! - A tokio-based P2P node with inventory sync and peer banning
//!
//! # Example
//!
//! ```rust
//! use ironcoin::core::{Blockchain, ChainParams};
//! use ironcoin::mining::{Mempool, Miner};
//! use ironcoin::wallet::Wallet;
//! use std::sync::atomic::AtomicBool;
//!
//! // A regtest chain mines in microseconds
//! let mut chain = Blockchain::new(ChainParams::regtest());
//! let mut mempool = Mempool::new();
//!
//! let wallet = Wallet::new();
//! let miner = Miner::new(&wallet.address());
//! let cancel = AtomicBool::new(false);
//!
//! let (block, stats) = miner.mine(&mut chain, &mut mempool, &cancel).unwrap().unwrap();
//! println!("Mined block {} in {} attempts", block.height, stats.hash_attempts);
//!
//! println!("Balance: {}", wallet.balance(&chain));
//! ```

pub mod codec;
pub mod core;
pub mod crypto;
pub mod mining;
pub mod network;
pub mod storage;
pub mod wallet;

// Re-export commonly used types
pub use codec::{CodecError, Decodable, Encodable};
pub use core::{
    Block, BlockError, BlockHeader, Blockchain, ChainParams, OutPoint, Transaction,
    TransactionBuilder, TxError, TxInput, TxOutput, UtxoSet, COIN,
};
pub use crypto::{Hash256, KeyPair};
pub use mining::{Mempool, Miner};
pub use network::{Node, NodeConfig};
pub use storage::{ChainStore, JsonStore};
pub use wallet::Wallet;

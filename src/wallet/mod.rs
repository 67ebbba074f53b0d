//! Wallet: key custody seam and transaction building

pub mod wallet;

pub use wallet::{KeyStore, MemoryKeyStore, Wallet, WalletError};

//! Wallet and key custody
//!
//! `KeyStore` is the seam behind which key storage (and any at-rest
//! encryption) lives; consensus code only ever asks it for a signing key.
//! `Wallet` builds spending transactions: it selects mature UTXOs, adds a
//! change output, and signs every input.

use crate::core::blockchain::Blockchain;
use crate::core::transaction::{Transaction, TransactionBuilder};
use crate::crypto::{KeyError, KeyPair};
use std::collections::HashMap;
use thiserror::Error;

/// Wallet errors
#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Insufficient spendable funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },
    #[error("No key for address {0}")]
    UnknownAddress(String),
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Source of signing keys, keyed by address
pub trait KeyStore {
    fn signing_key(&self, address: &str) -> Option<KeyPair>;
    fn addresses(&self) -> Vec<String>;
}

/// In-memory key store
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: HashMap<String, KeyPair>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate and store a fresh key pair, returning its address
    pub fn generate(&mut self) -> String {
        let key = KeyPair::generate();
        let address = key.address();
        self.keys.insert(address.clone(), key);
        address
    }

    pub fn insert(&mut self, key: KeyPair) -> String {
        let address = key.address();
        self.keys.insert(address.clone(), key);
        address
    }
}

impl KeyStore for MemoryKeyStore {
    fn signing_key(&self, address: &str) -> Option<KeyPair> {
        self.keys.get(address).cloned()
    }

    fn addresses(&self) -> Vec<String> {
        self.keys.keys().cloned().collect()
    }
}

/// A single-key wallet
pub struct Wallet {
    key: KeyPair,
}

impl Wallet {
    pub fn new() -> Self {
        Self {
            key: KeyPair::generate(),
        }
    }

    pub fn from_key(key: KeyPair) -> Self {
        Self { key }
    }

    pub fn address(&self) -> String {
        self.key.address()
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key
    }

    /// Total balance, including immature coinbase outputs
    pub fn balance(&self, chain: &Blockchain) -> u64 {
        chain.balance(&self.address())
    }

    /// Balance spendable in the next block
    pub fn spendable_balance(&self, chain: &Blockchain) -> u64 {
        chain.spendable_balance(&self.address())
    }

    /// Build and sign a payment of `amount` to `recipient`, spending the
    /// smallest sufficient set of mature UTXOs and returning change here.
    pub fn send_to(
        &self,
        chain: &Blockchain,
        recipient: &str,
        amount: u64,
        fee: u64,
    ) -> Result<Transaction, WalletError> {
        let address = self.address();
        let needed = amount
            .checked_add(fee)
            .ok_or(WalletError::InsufficientFunds {
                have: 0,
                need: u64::MAX,
            })?;

        let mut utxos = chain.spendable_utxos(&address);
        // Largest first keeps input counts small
        utxos.sort_by(|a, b| b.1.output.amount.cmp(&a.1.output.amount));

        let mut selected = Vec::new();
        let mut total = 0u64;
        for (outpoint, entry) in utxos {
            selected.push(outpoint);
            total += entry.output.amount;
            if total >= needed {
                break;
            }
        }
        if total < needed {
            return Err(WalletError::InsufficientFunds {
                have: total,
                need: needed,
            });
        }

        let mut builder = TransactionBuilder::new(chain.params().chain_id);
        for outpoint in selected {
            builder = builder.add_input(outpoint);
        }
        builder = builder.add_output(recipient, amount);
        let change = total - needed;
        if change > 0 {
            builder = builder.add_output(&address, change);
        }

        Ok(builder.build_and_sign(&self.key)?)
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::{ChainParams, COIN, COINBASE_MATURITY};
    use crate::mining::{Mempool, Miner};
    use std::sync::atomic::AtomicBool;

    /// Chain where the wallet owns one mature coinbase
    fn funded_chain(wallet: &Wallet) -> Blockchain {
        let mut chain = Blockchain::new(ChainParams::regtest());
        let mut pool = Mempool::new();
        let cancel = AtomicBool::new(false);

        Miner::new(&wallet.address())
            .mine(&mut chain, &mut pool, &cancel)
            .unwrap();
        let filler = Miner::new("filler");
        for _ in 0..COINBASE_MATURITY {
            filler.mine(&mut chain, &mut pool, &cancel).unwrap();
        }
        chain
    }

    #[test]
    fn test_balances_respect_maturity() {
        let wallet = Wallet::new();
        let mut chain = Blockchain::new(ChainParams::regtest());
        let mut pool = Mempool::new();
        let cancel = AtomicBool::new(false);
        Miner::new(&wallet.address())
            .mine(&mut chain, &mut pool, &cancel)
            .unwrap();

        assert_eq!(wallet.balance(&chain), 50 * COIN);
        assert_eq!(wallet.spendable_balance(&chain), 0);
    }

    #[test]
    fn test_send_with_change() {
        let wallet = Wallet::new();
        let chain = funded_chain(&wallet);
        assert_eq!(wallet.spendable_balance(&chain), 50 * COIN);

        let tx = wallet
            .send_to(&chain, "recipient", 20 * COIN, COIN / 10)
            .unwrap();
        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(tx.outputs[0].amount, 20 * COIN);
        assert_eq!(tx.outputs[0].script_pubkey, "recipient");
        assert_eq!(tx.outputs[1].amount, 30 * COIN - COIN / 10);
        assert_eq!(tx.outputs[1].script_pubkey, wallet.address());
    }

    #[test]
    fn test_send_insufficient_funds() {
        let wallet = Wallet::new();
        let chain = funded_chain(&wallet);
        assert!(matches!(
            wallet.send_to(&chain, "recipient", 60 * COIN, 0),
            Err(WalletError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn test_built_transaction_confirms() {
        let wallet = Wallet::new();
        let mut chain = funded_chain(&wallet);
        let mut pool = Mempool::new();
        let cancel = AtomicBool::new(false);

        let tx = wallet
            .send_to(&chain, "recipient", 10 * COIN, COIN / 100)
            .unwrap();
        pool.add_transaction(tx, &chain).unwrap();

        Miner::new("other_miner")
            .mine(&mut chain, &mut pool, &cancel)
            .unwrap();
        assert_eq!(chain.balance("recipient"), 10 * COIN);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_memory_key_store() {
        let mut store = MemoryKeyStore::new();
        let address = store.generate();
        assert!(store.signing_key(&address).is_some());
        assert!(store.signing_key("unknown").is_none());
        assert_eq!(store.addresses().len(), 1);
    }
}

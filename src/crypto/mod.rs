//! Cryptographic utilities for the blockchain
//!
//! This module provides:
//! - SHA-256 / double SHA-256 / HASH160 hashing
//! - ECDSA key management with low-S signatures (secp256k1)
//! - Merkle root calculation

pub mod hash;
pub mod keys;
pub mod merkle;

pub use hash::{hash160, hash256, sha256, Hash256};
pub use keys::{
    pubkey_to_address, sign_message, verify_signature, KeyError, KeyPair, ADDRESS_VERSION,
};
pub use merkle::merkle_root;

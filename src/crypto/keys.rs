//! ECDSA key management for the blockchain
//!
//! Provides key pair generation, DER signing with enforced low-S values,
//! and verification that rejects malleable high-S signatures. Uses the
//! secp256k1 curve.

use rand::rngs::OsRng;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

use super::hash::{hash160, sha256, Hash256};

/// Version byte prepended to the HASH160 before base58check encoding
pub const ADDRESS_VERSION: u8 = 0x00;

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature encoding")]
    InvalidSignature,
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// A key pair consisting of a private key and its corresponding public key
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from an existing secret key
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secret_key = SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Get the private key as a hex string
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Get the public key in compressed SEC1 form (33 bytes)
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key.serialize().to_vec()
    }

    /// Derive the address for this key pair
    pub fn address(&self) -> String {
        pubkey_to_address(&self.public_key.serialize())
            .expect("serialized public key is always valid")
    }

    /// Sign a 32-byte message hash, returning a DER-encoded low-S signature
    pub fn sign(&self, msg_hash: &Hash256) -> Vec<u8> {
        sign_message(&self.secret_key, msg_hash)
    }
}

/// Derive a base58check address from compressed public key bytes:
/// `base58check(version || RIPEMD160(SHA256(pubkey)))`
pub fn pubkey_to_address(pubkey: &[u8]) -> Result<String, KeyError> {
    // Reject garbage early so a bad pubkey can never alias a real address
    PublicKey::from_slice(pubkey).map_err(|_| KeyError::InvalidPublicKey)?;

    let mut payload = vec![ADDRESS_VERSION];
    payload.extend_from_slice(&hash160(pubkey));

    let checksum = sha256(&sha256(&payload));
    payload.extend_from_slice(&checksum[..4]);

    Ok(bs58::encode(payload).into_string())
}

/// Sign a 32-byte message hash with a secret key.
/// The underlying library always produces low-S signatures.
pub fn sign_message(secret_key: &SecretKey, msg_hash: &Hash256) -> Vec<u8> {
    let secp = Secp256k1::new();
    let message = Message::from_digest(*msg_hash.as_bytes());
    secp.sign_ecdsa(&message, secret_key)
        .serialize_der()
        .to_vec()
}

/// Verify a DER-encoded signature against a compressed public key and a
/// 32-byte message hash.
///
/// High-S signatures are rejected outright: `(r, n - s)` verifies under
/// plain ECDSA but would let a relay change the signature bytes without
/// changing what was signed.
pub fn verify_signature(
    pubkey: &[u8],
    msg_hash: &Hash256,
    signature: &[u8],
) -> Result<bool, KeyError> {
    let secp = Secp256k1::verification_only();

    let public_key = PublicKey::from_slice(pubkey).map_err(|_| KeyError::InvalidPublicKey)?;
    let sig = match Signature::from_der(signature) {
        Ok(sig) => sig,
        Err(_) => return Ok(false),
    };

    // normalize_s is a no-op exactly when s is already in the low half
    let mut normalized = sig;
    normalized.normalize_s();
    if normalized != sig {
        return Ok(false);
    }

    let message = Message::from_digest(*msg_hash.as_bytes());
    Ok(secp.verify_ecdsa(&message, &sig, &public_key).is_ok())
}

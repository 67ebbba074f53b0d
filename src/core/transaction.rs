//! Transaction data model
//!
//! Implements the UTXO transaction types and their canonical encodings.
//! A transaction id commits to everything except input signatures and
//! public keys, so signature malleability can never change the txid. The
//! sighash for input `i` is the same base serialization tagged with the
//! input index.

use crate::codec::{
    write_bytes, write_string, write_u32, write_u64, write_varint, CodecError, Decodable,
    Encodable, Reader,
};
use crate::crypto::{hash256, Hash256, KeyError, KeyPair};
use serde::{Deserialize, Serialize};

/// Sequence value for inputs that do not opt into anything special
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// Current transaction version
pub const TX_VERSION: u32 = 2;

/// Reference to a specific output of a specific transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, vout: u32) -> Self {
        Self { txid, vout }
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

impl Encodable for OutPoint {
    fn encode(&self, out: &mut Vec<u8>) {
        self.txid.encode(out);
        write_u32(out, self.vout);
    }
}

impl Decodable for OutPoint {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            txid: Hash256::decode(r)?,
            vout: r.read_u32()?,
        })
    }
}

/// Transaction input spending a previous output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub prev: OutPoint,
    /// DER-encoded low-S signature over the enclosing transaction's sighash
    pub signature: Vec<u8>,
    /// Compressed public key whose address must match the spent output
    pub pubkey: Vec<u8>,
    pub sequence: u32,
}

impl TxInput {
    pub fn unsigned(prev: OutPoint) -> Self {
        Self {
            prev,
            signature: Vec::new(),
            pubkey: Vec::new(),
            sequence: SEQUENCE_FINAL,
        }
    }
}

impl Encodable for TxInput {
    fn encode(&self, out: &mut Vec<u8>) {
        self.prev.encode(out);
        write_bytes(out, &self.signature);
        write_bytes(out, &self.pubkey);
        write_u32(out, self.sequence);
    }
}

impl Decodable for TxInput {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            prev: OutPoint::decode(r)?,
            signature: r.read_bytes()?,
            pubkey: r.read_bytes()?,
            sequence: r.read_u32()?,
        })
    }
}

/// Transaction output creating a new spendable coin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub amount: u64,
    /// Recipient address (hash of public key, base58check)
    pub script_pubkey: String,
}

impl TxOutput {
    pub fn new(amount: u64, script_pubkey: &str) -> Self {
        Self {
            amount,
            script_pubkey: script_pubkey.to_string(),
        }
    }

    pub fn is_owned_by(&self, address: &str) -> bool {
        self.script_pubkey == address
    }
}

impl Encodable for TxOutput {
    fn encode(&self, out: &mut Vec<u8>) {
        write_u64(out, self.amount);
        write_string(out, &self.script_pubkey);
    }
}

impl Decodable for TxOutput {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            amount: r.read_u64()?,
            script_pubkey: r.read_string()?,
        })
    }
}

/// A blockchain transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    /// Replay protection: must match the node's chain id
    pub chain_id: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub locktime: u32,
}

impl Transaction {
    pub fn new(chain_id: u32, inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Self {
            version: TX_VERSION,
            chain_id,
            inputs,
            outputs,
            locktime: 0,
        }
    }

    /// Create a coinbase transaction minting `amount` to `recipient`.
    ///
    /// Coinbase transactions have no inputs; the block height is committed
    /// into `locktime` so coinbases at different heights never share a txid.
    pub fn coinbase(chain_id: u32, recipient: &str, amount: u64, height: u64) -> Self {
        Self {
            version: TX_VERSION,
            chain_id,
            inputs: Vec::new(),
            outputs: vec![TxOutput::new(amount, recipient)],
            locktime: height as u32,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Serialization underlying both the txid and the sighash: everything
    /// except input signatures and public keys
    fn sighash_base(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u32(&mut out, self.version);
        write_u32(&mut out, self.chain_id);
        write_varint(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            input.prev.encode(&mut out);
            write_u32(&mut out, input.sequence);
        }
        self.outputs.encode(&mut out);
        write_u32(&mut out, self.locktime);
        out
    }

    /// The transaction id: double SHA-256 of the signature-free serialization
    pub fn txid(&self) -> Hash256 {
        hash256(&self.sighash_base())
    }

    /// The hash signed by input `index`
    pub fn sighash(&self, index: usize) -> Hash256 {
        let mut data = self.sighash_base();
        write_u32(&mut data, index as u32);
        hash256(&data)
    }

    /// Sign every input with the given key pair
    pub fn sign_inputs(&mut self, key_pair: &KeyPair) -> Result<(), KeyError> {
        let pubkey = key_pair.public_key_bytes();
        for index in 0..self.inputs.len() {
            let sighash = self.sighash(index);
            let signature = key_pair.sign(&sighash);
            let input = &mut self.inputs[index];
            input.signature = signature;
            input.pubkey = pubkey.clone();
        }
        Ok(())
    }

    pub fn total_output(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    /// Serialized size in bytes (full form, including signatures)
    pub fn size(&self) -> usize {
        self.to_vec().len()
    }
}

impl Encodable for Transaction {
    fn encode(&self, out: &mut Vec<u8>) {
        write_u32(out, self.version);
        write_u32(out, self.chain_id);
        self.inputs.encode(out);
        self.outputs.encode(out);
        write_u32(out, self.locktime);
    }
}

impl Decodable for Transaction {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            version: r.read_u32()?,
            chain_id: r.read_u32()?,
            inputs: Vec::<TxInput>::decode(r)?,
            outputs: Vec::<TxOutput>::decode(r)?,
            locktime: r.read_u32()?,
        })
    }
}

/// Builder for spending transactions
pub struct TransactionBuilder {
    chain_id: u32,
    inputs: Vec<TxInput>,
    outputs: Vec<TxOutput>,
}

impl TransactionBuilder {
    pub fn new(chain_id: u32) -> Self {
        Self {
            chain_id,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn add_input(mut self, prev: OutPoint) -> Self {
        self.inputs.push(TxInput::unsigned(prev));
        self
    }

    pub fn add_output(mut self, recipient: &str, amount: u64) -> Self {
        self.outputs.push(TxOutput::new(amount, recipient));
        self
    }

    /// Build and sign all inputs with a single key pair
    pub fn build_and_sign(self, key_pair: &KeyPair) -> Result<Transaction, KeyError> {
        let mut tx = Transaction::new(self.chain_id, self.inputs, self.outputs);
        tx.sign_inputs(key_pair)?;
        Ok(tx)
    }

    pub fn build(self) -> Transaction {
        Transaction::new(self.chain_id, self.inputs, self.outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_outpoint(tag: &[u8]) -> OutPoint {
        OutPoint::new(hash256(tag), 0)
    }

    #[test]
    fn test_coinbase_transaction() {
        let tx = Transaction::coinbase(1, "miner_address", 50, 7);
        assert!(tx.is_coinbase());
        assert_eq!(tx.total_output(), 50);
        assert_eq!(tx.locktime, 7);
    }

    #[test]
    fn test_coinbase_txid_unique_per_height() {
        let tx1 = Transaction::coinbase(1, "addr", 50, 1);
        let tx2 = Transaction::coinbase(1, "addr", 50, 2);
        assert_ne!(tx1.txid(), tx2.txid());
    }

    #[test]
    fn test_txid_ignores_signatures() {
        let key = KeyPair::generate();
        let mut tx = TransactionBuilder::new(1)
            .add_input(sample_outpoint(b"prev"))
            .add_output("recipient", 40)
            .build();

        let unsigned_id = tx.txid();
        tx.sign_inputs(&key).unwrap();
        assert_eq!(tx.txid(), unsigned_id);

        // Corrupting the signature must not move the txid either
        tx.inputs[0].signature[4] ^= 0x01;
        assert_eq!(tx.txid(), unsigned_id);
    }

    #[test]
    fn test_sighash_distinct_per_input() {
        let tx = TransactionBuilder::new(1)
            .add_input(sample_outpoint(b"a"))
            .add_input(sample_outpoint(b"b"))
            .add_output("recipient", 10)
            .build();

        assert_ne!(tx.sighash(0), tx.sighash(1));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let key = KeyPair::generate();
        let tx = TransactionBuilder::new(1)
            .add_input(sample_outpoint(b"prev"))
            .add_output("recipient", 40)
            .add_output("change", 9)
            .build_and_sign(&key)
            .unwrap();

        let decoded = Transaction::from_bytes(&tx.to_vec()).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.txid(), tx.txid());
    }

    #[test]
    fn test_chain_id_changes_txid() {
        let tx1 = Transaction::coinbase(1, "addr", 50, 0);
        let tx2 = Transaction::coinbase(2, "addr", 50, 0);
        assert_ne!(tx1.txid(), tx2.txid());
    }
}

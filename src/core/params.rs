//! Consensus constants and per-network chain parameters

use crate::crypto::{hash160, sha256, ADDRESS_VERSION};

/// Smallest currency unit per coin
pub const COIN: u64 = 100_000_000;

/// Maximum amount of money in circulation
pub const MAX_MONEY: u64 = 21_000_000 * COIN;

/// Subsidy paid by the genesis block and before the first halving
pub const INITIAL_SUBSIDY: u64 = 50 * COIN;

/// Number of blocks between subsidy halvings
pub const HALVING_INTERVAL: u64 = 210_000;

/// Number of blocks between difficulty retargets
pub const RETARGET_INTERVAL: u64 = 2016;

/// Target spacing between blocks, in seconds
pub const TARGET_BLOCK_TIME: u64 = 600;

/// Confirmations required before a coinbase output can be spent
pub const COINBASE_MATURITY: u64 = 100;

/// Maximum serialized block size in bytes
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Maximum signature operations per block
pub const MAX_BLOCK_SIGOPS: usize = 20_000;

/// Maximum serialized transaction size in bytes
pub const MAX_TX_SIZE: usize = 100_000;

/// Maximum total mempool size in bytes
pub const MAX_MEMPOOL_BYTES: usize = 300_000_000;

/// Minimum relay fee per 1000 bytes of transaction
pub const MIN_RELAY_FEE: u64 = 1000;

/// Mempool entries older than this are expired, in seconds (14 days)
pub const MEMPOOL_EXPIRY: u64 = 14 * 24 * 60 * 60;

/// Maximum allowed drift of a block timestamp into the future, in seconds
pub const MAX_FUTURE_BLOCK_TIME: u64 = 2 * 60 * 60;

/// Number of trailing blocks used for the median-time-past rule
pub const MTP_BLOCK_COUNT: usize = 11;

/// Block subsidy at a given height: halved every `HALVING_INTERVAL` blocks
/// until the shift exhausts the 64-bit amount
pub fn subsidy(height: u64) -> u64 {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    INITIAL_SUBSIDY >> halvings
}

/// Per-network parameters. Consensus rules read these rather than global
/// constants so tests can run against a trivially-minable target.
#[derive(Debug, Clone)]
pub struct ChainParams {
    /// Replay-protection id carried by every transaction
    pub chain_id: u32,
    /// Wire magic identifying this network
    pub magic: [u8; 4],
    /// Default P2P listening port
    pub port: u16,
    /// Compact difficulty target of the genesis block, also the pow limit
    pub genesis_bits: u32,
    /// Fixed genesis timestamp
    pub genesis_timestamp: u64,
}

impl ChainParams {
    pub fn mainnet() -> Self {
        Self {
            chain_id: 1,
            magic: *b"IRON",
            port: 8333,
            genesis_bits: 0x1d00ffff,
            genesis_timestamp: 1_000_000_000,
        }
    }

    /// Local-testing network: near-trivial target so blocks mine instantly
    pub fn regtest() -> Self {
        Self {
            chain_id: 1,
            magic: *b"IRTS",
            port: 18333,
            genesis_bits: 0x207fffff,
            genesis_timestamp: 1_000_000_000,
        }
    }

    /// The well-known address the genesis subsidy is paid to.
    ///
    /// Derived from a fixed preimage rather than a real public key, so the
    /// genesis coins have no known spending key.
    pub fn genesis_address(&self) -> String {
        let mut payload = vec![ADDRESS_VERSION];
        payload.extend_from_slice(&hash160(b"ironcoin genesis output"));
        let checksum = sha256(&sha256(&payload));
        payload.extend_from_slice(&checksum[..4]);
        bs58::encode(payload).into_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsidy_schedule() {
        assert_eq!(subsidy(0), 50 * COIN);
        assert_eq!(subsidy(HALVING_INTERVAL - 1), 50 * COIN);
        assert_eq!(subsidy(HALVING_INTERVAL), 25 * COIN);
        assert_eq!(subsidy(2 * HALVING_INTERVAL), 12 * COIN + COIN / 2);
        assert_eq!(subsidy(64 * HALVING_INTERVAL), 0);
        assert_eq!(subsidy(u64::MAX), 0);
    }

    #[test]
    fn test_total_supply_below_cap() {
        let mut total: u64 = 0;
        for halving in 0..64u64 {
            total += subsidy(halving * HALVING_INTERVAL) * HALVING_INTERVAL;
        }
        assert!(total <= MAX_MONEY);
    }

    #[test]
    fn test_genesis_address_deterministic() {
        let params = ChainParams::mainnet();
        assert_eq!(params.genesis_address(), params.genesis_address());
        assert!(params.genesis_address().starts_with('1'));
    }
}

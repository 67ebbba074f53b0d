//! Persistence adapter
//!
//! Consensus assumes an in-memory model; durability is behind the
//! `ChainStore` trait so a node can plug in any backend. The JSON file
//! implementation here is what the CLI uses. Loading replays blocks
//! through full validation, so a tampered file cannot smuggle in state
//! that the consensus rules would reject.

use crate::core::blockchain::{BlockError, Blockchain};
use crate::core::params::ChainParams;
use crate::core::Block;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Stored chain failed validation: {0}")]
    Invalid(#[from] BlockError),
}

/// Pluggable chain persistence
pub trait ChainStore {
    fn save(&self, chain: &Blockchain) -> Result<(), StorageError>;
    fn load(&self, params: ChainParams) -> Result<Option<Blockchain>, StorageError>;
}

/// JSON file store: the whole block sequence in one file
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            path: data_dir.as_ref().join("blocks.json"),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

impl ChainStore for JsonStore {
    fn save(&self, chain: &Blockchain) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec(chain.blocks())?;

        // Write-then-rename so a crash never leaves a torn file
        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn load(&self, params: ChainParams) -> Result<Option<Blockchain>, StorageError> {
        if !self.exists() {
            return Ok(None);
        }
        let json = fs::read(&self.path)?;
        let blocks: Vec<Block> = serde_json::from_slice(&json)?;
        let chain = Blockchain::from_blocks(params, blocks)?;
        log::info!(
            "Loaded chain at height {} from {}",
            chain.height(),
            self.path.display()
        );
        Ok(Some(chain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mining::{Mempool, Miner};
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        assert!(!store.exists());

        let mut chain = Blockchain::new(ChainParams::regtest());
        let mut pool = Mempool::new();
        let cancel = AtomicBool::new(false);
        let miner = Miner::new("miner");
        for _ in 0..3 {
            miner.mine(&mut chain, &mut pool, &cancel).unwrap();
        }

        store.save(&chain).unwrap();
        assert!(store.exists());

        let loaded = store.load(ChainParams::regtest()).unwrap().unwrap();
        assert_eq!(loaded.height(), 3);
        assert_eq!(loaded.tip().hash(), chain.tip().hash());
        assert_eq!(loaded.balance("miner"), chain.balance("miner"));
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        assert!(store.load(ChainParams::regtest()).unwrap().is_none());
    }

    #[test]
    fn test_tampered_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());

        let mut chain = Blockchain::new(ChainParams::regtest());
        let mut pool = Mempool::new();
        let cancel = AtomicBool::new(false);
        Miner::new("miner")
            .mine(&mut chain, &mut pool, &cancel)
            .unwrap();
        store.save(&chain).unwrap();

        // Inflate the miner's reward in the stored file
        let path = dir.path().join("blocks.json");
        let mut blocks: Vec<Block> =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        blocks[1].transactions[0].outputs[0].amount *= 2;
        fs::write(&path, serde_json::to_vec(&blocks).unwrap()).unwrap();

        assert!(matches!(
            store.load(ChainParams::regtest()),
            Err(StorageError::Invalid(_))
        ));
    }
}

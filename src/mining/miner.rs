//! Mining engine
//!
//! Assembles block templates from the mempool and searches the nonce space
//! for a header hash at or below the target. The search is cooperative:
//! cancellation is checked between fixed-size nonce batches so a tip change
//! can abort a stale template quickly.

use crate::core::blockchain::{BlockError, Blockchain};
use crate::core::params::{subsidy, MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE};
use crate::core::transaction::Transaction;
use crate::core::Block;
use crate::mining::mempool::Mempool;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Nonces tried between cancellation checks
pub const NONCE_BATCH: u64 = 1 << 16;

/// Template bytes reserved for the coinbase and header
const TEMPLATE_RESERVE: usize = 4_000;

/// Statistics for one mining attempt
#[derive(Debug, Clone)]
pub struct MiningStats {
    pub hash_attempts: u64,
    pub time_ms: u128,
    pub hash_rate: f64,
}

/// Miner producing blocks for a reward address
pub struct Miner {
    address: String,
}

impl Miner {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Build a candidate block on the current tip: select transactions by
    /// fee rate, then pay subsidy plus collected fees to the miner.
    pub fn build_template(&self, chain: &Blockchain, mempool: &Mempool) -> Block {
        let height = chain.height() + 1;
        let selected =
            mempool.select_for_block(chain, MAX_BLOCK_SIZE - TEMPLATE_RESERVE, MAX_BLOCK_SIGOPS);

        let fees: u64 = selected
            .iter()
            .map(|tx| mempool.get(&tx.txid()).map(|e| e.fee).unwrap_or(0))
            .sum();

        let coinbase = Transaction::coinbase(
            chain.params().chain_id,
            &self.address,
            subsidy(height) + fees,
            height,
        );
        let mut transactions = vec![coinbase];
        transactions.extend(selected);

        // Keep the timestamp valid even when mining immediately on a block
        // whose timestamp ran ahead of the wall clock
        let timestamp = (Utc::now().timestamp() as u64).max(chain.median_time_past() + 1);

        Block::new(
            height,
            chain.tip().hash(),
            transactions,
            chain.next_bits(),
            timestamp,
        )
    }

    /// Search the nonce space until the header meets its target.
    ///
    /// Returns `None` if `cancel` was raised. When a nonce range is
    /// exhausted the timestamp is bumped, which re-keys the search space.
    pub fn solve(block: &mut Block, cancel: &AtomicBool) -> Option<MiningStats> {
        let start = Instant::now();
        let mut attempts: u64 = 0;

        loop {
            for _ in 0..NONCE_BATCH {
                if block.header.is_valid_pow() {
                    let elapsed = start.elapsed().as_millis();
                    let hash_rate = if elapsed > 0 {
                        attempts as f64 / (elapsed as f64 / 1000.0)
                    } else {
                        attempts as f64
                    };
                    return Some(MiningStats {
                        hash_attempts: attempts,
                        time_ms: elapsed,
                        hash_rate,
                    });
                }
                attempts += 1;
                if block.header.nonce == u64::MAX {
                    // Nonce space exhausted: advance the clock and restart
                    block.header.nonce = 0;
                    block.header.timestamp += 1;
                } else {
                    block.header.nonce += 1;
                }
            }
            if cancel.load(Ordering::Relaxed) {
                return None;
            }
        }
    }

    /// Assemble, solve, and submit one block. Returns the accepted block,
    /// or `None` if mining was cancelled.
    pub fn mine(
        &self,
        chain: &mut Blockchain,
        mempool: &mut Mempool,
        cancel: &AtomicBool,
    ) -> Result<Option<(Block, MiningStats)>, BlockError> {
        let mut block = self.build_template(chain, mempool);
        log::info!(
            "Mining block {} with {} transactions",
            block.height,
            block.transactions.len()
        );

        let stats = match Miner::solve(&mut block, cancel) {
            Some(stats) => stats,
            None => return Ok(None),
        };

        chain.accept_block(block.clone())?;
        mempool.purge_block(&block.transactions);

        log::info!(
            "Mined block {} in {}ms ({} attempts, {:.0} H/s)",
            block.height,
            stats.time_ms,
            stats.hash_attempts,
            stats.hash_rate
        );
        Ok(Some((block, stats)))
    }
}

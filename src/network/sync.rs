//! Initial block download
//!
//! When a peer advertises a higher chain, it becomes the sync peer and is
//! sent GETBLOCKS with an exponentially spaced block locator. The peer
//! answers with batches of block inventory; a batch smaller than the
//! protocol maximum means the peer has nothing further and sync ends.

use crate::core::blockchain::Blockchain;
use crate::crypto::Hash256;
use crate::network::message::{Message, MAX_INV_ITEMS};
use crate::network::peer::PeerManager;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Default)]
struct SyncState {
    syncing: bool,
    sync_peer: Option<SocketAddr>,
}

/// Drives catch-up against a better-provisioned peer
pub struct ChainSync {
    blockchain: Arc<RwLock<Blockchain>>,
    peers: Arc<PeerManager>,
    state: Mutex<SyncState>,
}

impl ChainSync {
    pub fn new(blockchain: Arc<RwLock<Blockchain>>, peers: Arc<PeerManager>) -> Self {
        Self {
            blockchain,
            peers,
            state: Mutex::new(SyncState::default()),
        }
    }

    pub async fn is_syncing(&self) -> bool {
        self.state.lock().await.syncing
    }

    pub async fn sync_peer(&self) -> Option<SocketAddr> {
        self.state.lock().await.sync_peer
    }

    /// Start syncing if any ready peer advertises a higher chain.
    /// Returns true when a sync was started.
    pub async fn check_sync(&self) -> bool {
        let our_height = self.blockchain.read().await.height();

        let (peer, peer_height) = match self.peers.best_peer().await {
            Some(best) => best,
            None => return false,
        };
        if peer_height <= our_height {
            return false;
        }

        {
            let mut state = self.state.lock().await;
            if state.syncing {
                return false;
            }
            state.syncing = true;
            state.sync_peer = Some(peer);
        }

        log::info!(
            "Peer {} advertises height {} (ours {}), starting block download",
            peer,
            peer_height,
            our_height
        );
        self.request_blocks(peer).await;
        true
    }

    /// Send GETBLOCKS with a locator from our tip back to genesis
    pub async fn request_blocks(&self, peer: SocketAddr) {
        let locator = self.blockchain.read().await.locator();
        let msg = Message::GetBlocks {
            locator,
            stop: Hash256::ZERO,
        };
        if let Err(e) = self.peers.send_to(&peer, msg).await {
            log::warn!("Failed to request blocks from {}: {}", peer, e);
            self.finish().await;
        }
    }

    /// Called with each block-INV batch from the sync peer. A short batch
    /// ends the download; a full one asks for the next window after the
    /// blocks arrive.
    pub async fn on_inv_batch(&self, from: SocketAddr, batch_len: usize) {
        let mut state = self.state.lock().await;
        if !state.syncing || state.sync_peer != Some(from) {
            return;
        }
        if batch_len < MAX_INV_ITEMS {
            state.syncing = false;
            state.sync_peer = None;
            log::info!("Initial block download complete");
        }
    }

    /// Continue the download after a batch of blocks connected
    pub async fn continue_sync(&self) {
        let peer = {
            let state = self.state.lock().await;
            if !state.syncing {
                return;
            }
            state.sync_peer
        };
        if let Some(peer) = peer {
            self.request_blocks(peer).await;
        }
    }

    /// Abort any sync against this peer (it disconnected or timed out)
    pub async fn peer_gone(&self, addr: &SocketAddr) {
        let mut state = self.state.lock().await;
        if state.sync_peer == Some(*addr) {
            state.syncing = false;
            state.sync_peer = None;
            log::info!("Sync peer {} lost, block download aborted", addr);
        }
    }

    async fn finish(&self) {
        let mut state = self.state.lock().await;
        state.syncing = false;
        state.sync_peer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ChainParams;

    fn setup() -> ChainSync {
        let chain = Arc::new(RwLock::new(Blockchain::new(ChainParams::regtest())));
        let peers = Arc::new(PeerManager::new());
        ChainSync::new(chain, peers)
    }

    #[tokio::test]
    async fn test_no_sync_without_peers() {
        let sync = setup();
        assert!(!sync.check_sync().await);
        assert!(!sync.is_syncing().await);
    }

    #[tokio::test]
    async fn test_short_batch_ends_sync() {
        let sync = setup();
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        {
            let mut state = sync.state.lock().await;
            state.syncing = true;
            state.sync_peer = Some(addr);
        }

        // A batch from a different peer is ignored
        let other: SocketAddr = "127.0.0.1:8888".parse().unwrap();
        sync.on_inv_batch(other, 3).await;
        assert!(sync.is_syncing().await);

        // A short batch from the sync peer finishes the download
        sync.on_inv_batch(addr, 3).await;
        assert!(!sync.is_syncing().await);
    }

    #[tokio::test]
    async fn test_peer_gone_aborts() {
        let sync = setup();
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        {
            let mut state = sync.state.lock().await;
            state.syncing = true;
            state.sync_peer = Some(addr);
        }
        sync.peer_gone(&addr).await;
        assert!(!sync.is_syncing().await);
    }
}

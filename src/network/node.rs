//! P2P node
//!
//! Owns the shared chain and mempool state and drives everything else:
//! accepting connections, dispatching peer messages, tracking requested
//! inventory, relaying validated data, periodic maintenance, and the
//! optional mining task.
//!
//! Lock discipline: the blockchain lock serializes all chain and UTXO
//! mutation; the mempool lock is taken after it, never the reverse. The
//! inventory request tracker uses a plain mutex held only for map lookups.

use crate::core::blockchain::{BlockError, Blockchain};
use crate::core::params::ChainParams;
use crate::core::{Block, Transaction};
use crate::crypto::Hash256;
use crate::mining::{Mempool, MempoolError, Miner};
use crate::network::message::{InvItem, InvKind, Message, VersionMessage, MAX_INV_ITEMS};
use crate::network::peer::{Misbehavior, PeerManager, REQUEST_TIMEOUT};
use crate::network::server::{connect_to_peer, handle_connection, PeerEvent, Server};
use crate::network::sync::ChainSync;
use chrono::Utc;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// Maintenance cadence: pings, stale requests, expiry sweeps
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Keep dialing known addresses until this many connections exist
pub const TARGET_OUTBOUND: usize = 8;

/// Node configuration
#[derive(Clone)]
pub struct NodeConfig {
    pub params: ChainParams,
    /// Port to listen on; 0 picks an ephemeral port
    pub port: u16,
    /// Peers to dial at startup
    pub bootstrap_peers: Vec<String>,
    /// Run the mining task, paying this address
    pub mine_to: Option<String>,
}

impl NodeConfig {
    pub fn new(params: ChainParams) -> Self {
        let port = params.port;
        Self {
            params,
            port,
            bootstrap_peers: Vec::new(),
            mine_to: None,
        }
    }
}

/// In-flight GETDATA bookkeeping with per-item timeouts
#[derive(Default)]
struct RequestTracker {
    blocks: HashMap<Hash256, (SocketAddr, Instant)>,
    txs: HashMap<Hash256, (SocketAddr, Instant)>,
}

impl RequestTracker {
    fn map(&mut self, kind: InvKind) -> &mut HashMap<Hash256, (SocketAddr, Instant)> {
        match kind {
            InvKind::Block => &mut self.blocks,
            InvKind::Tx => &mut self.txs,
        }
    }

    fn is_requested(&self, item: &InvItem) -> bool {
        match item.kind {
            InvKind::Block => self.blocks.contains_key(&item.hash),
            InvKind::Tx => self.txs.contains_key(&item.hash),
        }
    }

    fn note(&mut self, item: &InvItem, from: SocketAddr) {
        self.map(item.kind).insert(item.hash, (from, Instant::now()));
    }

    fn complete(&mut self, kind: InvKind, hash: &Hash256) {
        self.map(kind).remove(hash);
    }

    /// Remove and return every request past its timeout
    fn take_stale(&mut self) -> Vec<(InvItem, SocketAddr)> {
        let mut stale = Vec::new();
        for (kind, map) in [
            (InvKind::Block, &mut self.blocks),
            (InvKind::Tx, &mut self.txs),
        ] {
            let expired: Vec<Hash256> = map
                .iter()
                .filter(|(_, (_, at))| at.elapsed() > REQUEST_TIMEOUT)
                .map(|(h, _)| *h)
                .collect();
            for hash in expired {
                let (peer, _) = map.remove(&hash).expect("key collected above");
                stale.push((InvItem { kind, hash }, peer));
            }
        }
        stale
    }

    fn pending_blocks(&self) -> usize {
        self.blocks.len()
    }
}

/// Snapshot of node state for status surfaces
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub port: u16,
    pub height: u64,
    pub peers: usize,
    pub mempool_txs: usize,
    pub syncing: bool,
}

/// The P2P node
pub struct Node {
    config: NodeConfig,
    pub blockchain: Arc<RwLock<Blockchain>>,
    pub mempool: Arc<RwLock<Mempool>>,
    pub peer_manager: Arc<PeerManager>,
    pub sync: Arc<ChainSync>,
    requests: Arc<Mutex<RequestTracker>>,
    /// Raised whenever the tip moves; the miner polls it between batches
    tip_changed: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    /// Nonce in our VERSION, for self-connection detection
    local_nonce: u64,
    event_tx: Option<mpsc::Sender<PeerEvent>>,
    listen_port: u16,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        let blockchain = Blockchain::new(config.params.clone());
        Self::with_chain(config, blockchain)
    }

    /// Build a node around an existing chain (e.g. loaded from storage)
    pub fn with_chain(config: NodeConfig, blockchain: Blockchain) -> Self {
        let blockchain = Arc::new(RwLock::new(blockchain));
        let peer_manager = Arc::new(PeerManager::new());
        let sync = Arc::new(ChainSync::new(blockchain.clone(), peer_manager.clone()));
        let listen_port = config.port;

        Self {
            config,
            blockchain,
            mempool: Arc::new(RwLock::new(Mempool::new())),
            peer_manager,
            sync,
            requests: Arc::new(Mutex::new(RequestTracker::default())),
            tip_changed: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            local_nonce: rand::random(),
            event_tx: None,
            listen_port,
            tasks: Vec::new(),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            port: self.listen_port,
            height: self.blockchain.read().await.height(),
            peers: self.peer_manager.peer_count().await,
            mempool_txs: self.mempool.read().await.len(),
            syncing: self.sync.is_syncing().await,
        }
    }

    /// Bind the listener, spawn the acceptor and maintenance tasks, dial
    /// bootstrap peers, then process peer events until shutdown.
    pub async fn start(&mut self) -> Result<(), std::io::Error> {
        self.running.store(true, Ordering::SeqCst);

        let server = Server::bind(self.config.port).await?;
        self.listen_port = server.port();

        let (event_tx, mut event_rx) = mpsc::channel::<PeerEvent>(1024);
        self.event_tx = Some(event_tx.clone());

        // Acceptor task
        {
            let peer_manager = self.peer_manager.clone();
            let blockchain = self.blockchain.clone();
            let running = self.running.clone();
            let magic = self.config.params.magic;
            let event_tx = event_tx.clone();
            let local_nonce = self.local_nonce;
            self.tasks.push(tokio::spawn(async move {
                loop {
                    let (stream, addr) = match server.accept().await {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            if running.load(Ordering::SeqCst) {
                                log::error!("Accept error: {}", e);
                                continue;
                            }
                            break;
                        }
                    };
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    if peer_manager.can_accept(&addr).await.is_err() {
                        log::debug!("Refusing connection from {}", addr);
                        continue;
                    }
                    let version = {
                        let chain = blockchain.read().await;
                        Message::Version(VersionMessage::new(local_nonce, chain.height()))
                    };
                    let pm = peer_manager.clone();
                    let tx = event_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, addr, magic, pm, version, tx, false).await
                        {
                            log::debug!("Connection with {} ended: {}", addr, e);
                        }
                    });
                }
            }));
        }

        // Maintenance task
        self.tasks.push(self.spawn_maintenance());

        // Mining task, if configured
        if let Some(address) = self.config.mine_to.clone() {
            let miner_task = self.spawn_miner(address);
            self.tasks.push(miner_task);
        }

        for peer in self.config.bootstrap_peers.clone() {
            if let Err(e) = self.connect_to(&peer).await {
                log::warn!("Bootstrap connection to {} failed: {}", peer, e);
            }
        }

        // Central event loop
        while self.running.load(Ordering::SeqCst) {
            match event_rx.recv().await {
                Some(PeerEvent::Message(from, msg)) => self.handle_message(from, msg).await,
                Some(PeerEvent::Disconnected(addr)) => {
                    self.sync.peer_gone(&addr).await;
                }
                None => break,
            }
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }
        log::info!("Node stopped");
        Ok(())
    }

    /// Signal every task to wind down
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        // Wake the miner so it notices `running` went false
        self.tip_changed.store(true, Ordering::SeqCst);
        if let Some(tx) = &self.event_tx {
            let _ = tx.try_send(PeerEvent::Disconnected("0.0.0.0:0".parse().unwrap()));
        }
    }

    /// Dial a peer and run its connection tasks
    pub async fn connect_to(&self, addr: &str) -> Result<(), crate::network::peer::PeerError> {
        let (stream, peer_addr) = connect_to_peer(addr).await?;
        let version = {
            let chain = self.blockchain.read().await;
            Message::Version(VersionMessage::new(self.local_nonce, chain.height()))
        };
        let event_tx = self
            .event_tx
            .clone()
            .ok_or(crate::network::peer::PeerError::Disconnected)?;
        let pm = self.peer_manager.clone();
        let magic = self.config.params.magic;
        tokio::spawn(async move {
            if let Err(e) =
                handle_connection(stream, peer_addr, magic, pm, version, event_tx, true).await
            {
                log::debug!("Connection with {} ended: {}", peer_addr, e);
            }
        });
        Ok(())
    }

    /// Queue a reply the peer asked for; a full queue disconnects rather
    /// than stalling the event loop
    async fn reply(&self, to: &SocketAddr, msg: Message) {
        if !self.peer_manager.try_send_to(to, msg).await {
            log::debug!("Outbound queue to {} unavailable, disconnecting", to);
            self.peer_manager.remove_peer(to).await;
            self.sync.peer_gone(to).await;
        }
    }

    /// Dispatch one peer message
    async fn handle_message(&self, from: SocketAddr, msg: Message) {
        if !self.peer_manager.check_rate(&from).await {
            self.peer_manager
                .penalize(&from, Misbehavior::TooManyMessages)
                .await;
            return;
        }

        match msg {
            Message::Version(version) => {
                if version.nonce == self.local_nonce {
                    log::debug!("Dropping self-connection via {}", from);
                    self.peer_manager.remove_peer(&from).await;
                    return;
                }
                self.peer_manager.record_version(&from, &version).await;
                self.reply(&from, Message::Verack).await;
                self.sync.check_sync().await;
            }

            Message::Verack => {
                self.peer_manager.record_verack(&from).await;
                self.sync.check_sync().await;
            }

            Message::Ping(nonce) => {
                self.reply(&from, Message::Pong(nonce)).await;
            }

            Message::Pong(nonce) => {
                self.peer_manager.record_pong(&from, nonce).await;
            }

            Message::GetAddr => {
                let addrs = self.peer_manager.known_peers().await;
                self.reply(&from, Message::Addr(addrs)).await;
            }

            Message::Addr(addrs) => {
                self.peer_manager.add_known_peers(addrs).await;
            }

            Message::Inv(items) => self.handle_inv(from, items).await,

            Message::GetData(items) => self.handle_getdata(from, items).await,

            Message::Block(block) => self.handle_block(from, block).await,

            Message::Tx(tx) => self.handle_tx(from, tx).await,

            Message::GetBlocks { locator, stop } => {
                self.handle_getblocks(from, locator, stop).await;
            }
        }
    }

    /// Request announced items we do not yet have
    async fn handle_inv(&self, from: SocketAddr, items: Vec<InvItem>) {
        let block_items = items.iter().filter(|i| i.kind == InvKind::Block).count();

        let mut wanted = Vec::new();
        {
            let chain = self.blockchain.read().await;
            let mempool = self.mempool.read().await;
            let mut requests = self.requests.lock().expect("request tracker poisoned");
            for item in &items {
                let have = match item.kind {
                    InvKind::Block => chain.contains_block(&item.hash),
                    InvKind::Tx => {
                        mempool.contains(&item.hash)
                            || chain.get_tx_location(&item.hash).is_some()
                    }
                };
                if have || requests.is_requested(item) {
                    continue;
                }
                requests.note(item, from);
                wanted.push(*item);
            }
        }

        if !wanted.is_empty() {
            self.reply(&from, Message::GetData(wanted)).await;
        }

        if block_items > 0 {
            self.sync.on_inv_batch(from, block_items).await;
        }
    }

    /// Serve requested blocks and transactions
    async fn handle_getdata(&self, from: SocketAddr, items: Vec<InvItem>) {
        for item in items {
            let response = match item.kind {
                InvKind::Block => {
                    let chain = self.blockchain.read().await;
                    chain.get_block_by_hash(&item.hash).cloned().map(Message::Block)
                }
                InvKind::Tx => {
                    let mempool = self.mempool.read().await;
                    match mempool.get(&item.hash) {
                        Some(entry) => Some(Message::Tx(entry.tx.clone())),
                        None => {
                            drop(mempool);
                            let chain = self.blockchain.read().await;
                            chain.get_transaction(&item.hash).cloned().map(Message::Tx)
                        }
                    }
                }
            };
            match response {
                Some(msg) => self.reply(&from, msg).await,
                None => log::debug!("Peer {} requested unknown item {}", from, item.hash),
            }
        }
    }

    /// Validate a received block and extend the chain
    async fn handle_block(&self, from: SocketAddr, block: Block) {
        let hash = block.hash();
        self.requests
            .lock()
            .expect("request tracker poisoned")
            .complete(InvKind::Block, &hash);

        let result = {
            let mut chain = self.blockchain.write().await;
            chain.accept_block(block.clone())
        };

        match result {
            Ok(()) => {
                self.tip_changed.store(true, Ordering::SeqCst);
                {
                    let mut mempool = self.mempool.write().await;
                    mempool.purge_block(&block.transactions);
                }
                self.peer_manager
                    .relay(Message::Inv(vec![InvItem::block(hash)]), Some(&from))
                    .await;

                // During catch-up, ask for the next window once this batch
                // has fully connected
                let pending = self
                    .requests
                    .lock()
                    .expect("request tracker poisoned")
                    .pending_blocks();
                if pending == 0 && self.sync.is_syncing().await {
                    self.sync.continue_sync().await;
                }
            }
            Err(BlockError::Duplicate) => {}
            Err(BlockError::BadPrevHash) => {
                // A block off our tip usually means we are behind, not that
                // the peer is hostile
                log::debug!("Block {} does not extend our tip", hash);
                self.sync.check_sync().await;
            }
            Err(e) => {
                log::warn!("Invalid block {} from {}: {}", hash, from, e);
                self.peer_manager
                    .penalize(&from, Misbehavior::InvalidBlock)
                    .await;
            }
        }
    }

    /// Validate a received transaction into the mempool and relay it
    async fn handle_tx(&self, from: SocketAddr, tx: Transaction) {
        let txid = tx.txid();
        self.requests
            .lock()
            .expect("request tracker poisoned")
            .complete(InvKind::Tx, &txid);

        let result = {
            let chain = self.blockchain.read().await;
            let mut mempool = self.mempool.write().await;
            mempool.add_transaction(tx, &chain)
        };

        match result {
            Ok(txid) => {
                self.peer_manager
                    .relay(Message::Inv(vec![InvItem::tx(txid)]), Some(&from))
                    .await;
            }
            Err(MempoolError::Duplicate) => {}
            Err(MempoolError::Tx(e)) => {
                log::debug!("Invalid tx {} from {}: {}", txid, from, e);
                self.peer_manager
                    .penalize(&from, Misbehavior::InvalidTx)
                    .await;
            }
            Err(e) => {
                // Policy rejections (fee, capacity) are not misbehavior
                log::debug!("Tx {} not admitted: {}", txid, e);
            }
        }
    }

    /// Answer a locator with inventory for the blocks that follow it
    async fn handle_getblocks(&self, from: SocketAddr, locator: Vec<Hash256>, stop: Hash256) {
        let items: Vec<InvItem> = {
            let chain = self.blockchain.read().await;
            let start = chain.locate_fork(&locator);
            let mut items = Vec::new();
            for height in start..=chain.height() {
                let hash = chain
                    .get_block(height)
                    .expect("height within chain")
                    .hash();
                items.push(InvItem::block(hash));
                if items.len() >= MAX_INV_ITEMS || hash == stop {
                    break;
                }
            }
            items
        };
        // An empty INV still signals "nothing after your locator"
        self.reply(&from, Message::Inv(items)).await;
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let peer_manager = self.peer_manager.clone();
        let blockchain = self.blockchain.clone();
        let mempool = self.mempool.clone();
        let sync = self.sync.clone();
        let requests = self.requests.clone();
        let running = self.running.clone();
        let event_tx = self.event_tx.clone();
        let magic = self.config.params.magic;
        let local_nonce = self.local_nonce;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.tick().await;
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;

                // Keep-alives
                for addr in peer_manager.ready_peers().await {
                    let nonce: u64 = rand::random();
                    peer_manager.mark_ping(&addr, nonce).await;
                    let _ = peer_manager.send_to(&addr, Message::Ping(nonce)).await;
                }

                // Idle connections
                for addr in peer_manager.idle_peers().await {
                    log::info!("Dropping idle peer {}", addr);
                    peer_manager.remove_peer(&addr).await;
                    sync.peer_gone(&addr).await;
                }

                // Stale requests: penalize the silent peer and re-request
                let stale = {
                    let mut tracker = requests.lock().expect("request tracker poisoned");
                    tracker.take_stale()
                };
                for (item, peer) in stale {
                    peer_manager
                        .penalize(&peer, Misbehavior::RequestTimeout)
                        .await;
                    let others: Vec<SocketAddr> = peer_manager
                        .ready_peers()
                        .await
                        .into_iter()
                        .filter(|a| a != &peer)
                        .collect();
                    if let Some(other) = others.first() {
                        {
                            let mut tracker = requests.lock().expect("request tracker poisoned");
                            tracker.note(&item, *other);
                        }
                        let _ = peer_manager
                            .send_to(other, Message::GetData(vec![item]))
                            .await;
                    }
                }

                // Discovery: learn more addresses and dial until the
                // connection target is met
                let connected = peer_manager.ready_peers().await;
                if let Some(first) = connected.first() {
                    let _ = peer_manager.send_to(first, Message::GetAddr).await;
                }
                if connected.len() < TARGET_OUTBOUND {
                    if let Some(event_tx) = event_tx.clone() {
                        let connected_strs: Vec<String> =
                            connected.iter().map(|a| a.to_string()).collect();
                        let candidate = peer_manager
                            .known_peers()
                            .await
                            .into_iter()
                            .find(|addr| !connected_strs.contains(addr));
                        if let Some(addr) = candidate {
                            if let Ok((stream, peer_addr)) = connect_to_peer(&addr).await {
                                let version = {
                                    let chain = blockchain.read().await;
                                    Message::Version(VersionMessage::new(
                                        local_nonce,
                                        chain.height(),
                                    ))
                                };
                                let pm = peer_manager.clone();
                                tokio::spawn(async move {
                                    let _ = handle_connection(
                                        stream, peer_addr, magic, pm, version, event_tx, true,
                                    )
                                    .await;
                                });
                            }
                        }
                    }
                }

                peer_manager.cleanup_bans().await;
                mempool
                    .write()
                    .await
                    .expire(Utc::now().timestamp() as u64);
                sync.check_sync().await;
            }
        })
    }

    /// Run a mining loop on this node's chain and mempool. The search is
    /// cancelled whenever the tip moves and restarted on the new tip.
    pub fn spawn_miner(&self, address: String) -> JoinHandle<()> {
        let blockchain = self.blockchain.clone();
        let mempool = self.mempool.clone();
        let peer_manager = self.peer_manager.clone();
        let tip_changed = self.tip_changed.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            let miner = Miner::new(&address);
            while running.load(Ordering::SeqCst) {
                let template = {
                    let chain = blockchain.read().await;
                    let pool = mempool.read().await;
                    miner.build_template(&chain, &pool)
                };

                tip_changed.store(false, Ordering::SeqCst);
                let cancel = tip_changed.clone();
                let solved = tokio::task::spawn_blocking(move || {
                    let mut block = template;
                    Miner::solve(&mut block, &cancel).map(|stats| (block, stats))
                })
                .await
                .ok()
                .flatten();

                let Some((block, stats)) = solved else {
                    // Cancelled: tip moved or shutdown requested
                    continue;
                };

                let accepted = {
                    let mut chain = blockchain.write().await;
                    chain.accept_block(block.clone())
                };
                match accepted {
                    Ok(()) => {
                        log::info!(
                            "Mined block {} at height {} ({} attempts)",
                            block.hash(),
                            block.height,
                            stats.hash_attempts
                        );
                        mempool.write().await.purge_block(&block.transactions);
                        peer_manager
                            .relay(Message::Inv(vec![InvItem::block(block.hash())]), None)
                            .await;
                    }
                    Err(e) => {
                        // The tip moved while submitting; rebuild and retry
                        log::debug!("Mined block not accepted: {}", e);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> NodeConfig {
        let mut config = NodeConfig::new(ChainParams::regtest());
        config.port = 0;
        config
    }

    #[tokio::test]
    async fn test_node_status() {
        let node = Node::new(test_config());
        let status = node.status().await;
        assert_eq!(status.height, 0);
        assert_eq!(status.peers, 0);
        assert_eq!(status.mempool_txs, 0);
        assert!(!status.syncing);
    }

    #[tokio::test]
    async fn test_two_nodes_sync_and_relay() {
        let mut node_a = Node::new(test_config());

        // Node A mines three blocks before B appears
        {
            let mut chain = node_a.blockchain.write().await;
            let mut pool = Mempool::new();
            let miner = Miner::new("miner_a");
            let cancel = AtomicBool::new(false);
            for _ in 0..3 {
                miner.mine(&mut chain, &mut pool, &cancel).unwrap();
            }
            assert_eq!(chain.height(), 3);
        }

        let a_chain = node_a.blockchain.clone();
        let a_handle = tokio::spawn(async move {
            let _ = node_a.start().await;
            node_a
        });

        // Wait for A's listener; its port is ephemeral, so retry the dial
        tokio::time::sleep(Duration::from_millis(100)).await;

        // B cannot know A's ephemeral port from here, so this test drives
        // sync at the component level instead: B accepts A's blocks in order
        let node_b = Node::new(test_config());
        let blocks: Vec<Block> = a_chain.read().await.blocks().to_vec();
        for block in blocks.iter().skip(1) {
            node_b
                .handle_block("127.0.0.1:1111".parse().unwrap(), block.clone())
                .await;
        }
        assert_eq!(node_b.blockchain.read().await.height(), 3);

        a_handle.abort();
    }

    #[tokio::test]
    async fn test_invalid_block_penalizes_peer() {
        let node = Node::new(test_config());
        let peer: SocketAddr = "127.0.0.1:2222".parse().unwrap();
        let (tx, _rx) = mpsc::channel(8);
        node.peer_manager
            .add_peer(peer, crate::network::peer::PeerHandle { addr: peer, tx }, false)
            .await
            .unwrap();

        // A block with a bogus coinbase value on the correct parent
        let chain = node.blockchain.read().await;
        let coinbase = Transaction::coinbase(1, "cheater", u64::MAX / 2, 1);
        let mut block = Block::new(
            1,
            chain.tip().hash(),
            vec![coinbase],
            chain.next_bits(),
            chain.median_time_past() + 1,
        );
        drop(chain);
        while !crate::core::pow::meets_target(&block.hash(), block.header.bits) {
            block.header.nonce += 1;
        }

        node.handle_block(peer, block).await;

        // Invalid block is an instant ban
        assert!(node.peer_manager.is_banned(&peer.ip()).await);
    }

    #[tokio::test]
    async fn test_getblocks_answers_with_inventory() {
        let node = Node::new(test_config());
        {
            let mut chain = node.blockchain.write().await;
            let mut pool = Mempool::new();
            let miner = Miner::new("miner");
            let cancel = AtomicBool::new(false);
            for _ in 0..5 {
                miner.mine(&mut chain, &mut pool, &cancel).unwrap();
            }
        }

        let peer: SocketAddr = "127.0.0.1:3333".parse().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        node.peer_manager
            .add_peer(peer, crate::network::peer::PeerHandle { addr: peer, tx }, false)
            .await
            .unwrap();

        // A locator holding only genesis: the peer wants everything after it
        let genesis_hash = node.blockchain.read().await.get_block(0).unwrap().hash();
        node.handle_getblocks(peer, vec![genesis_hash], Hash256::ZERO)
            .await;

        match rx.recv().await.unwrap() {
            Message::Inv(items) => {
                assert_eq!(items.len(), 5);
                assert!(items.iter().all(|i| i.kind == InvKind::Block));
            }
            other => panic!("expected inventory, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inv_requests_only_unknown_items() {
        let node = Node::new(test_config());
        let peer: SocketAddr = "127.0.0.1:4444".parse().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        node.peer_manager
            .add_peer(peer, crate::network::peer::PeerHandle { addr: peer, tx }, false)
            .await
            .unwrap();

        let known = node.blockchain.read().await.tip().hash();
        let unknown = crate::crypto::hash256(b"unseen block");

        node.handle_inv(peer, vec![InvItem::block(known), InvItem::block(unknown)])
            .await;

        match rx.recv().await.unwrap() {
            Message::GetData(items) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].hash, unknown);
            }
            other => panic!("expected getdata, got {:?}", other),
        }

        // Re-announcing does not re-request
        node.handle_inv(peer, vec![InvItem::block(unknown)]).await;
        assert!(rx.try_recv().is_err());
    }
}

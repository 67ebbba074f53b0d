//! Peer lifecycle and reputation management
//!
//! Tracks every connection through the CONNECTING -> HANDSHAKING -> READY
//! state machine, scores misbehavior until the ban threshold, rate-limits
//! inbound traffic with a per-peer token bucket, and enforces connection
//! limits per IP and in total.

use crate::network::message::Message;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

/// Maximum simultaneous peers
pub const MAX_PEERS: usize = 125;

/// Maximum inbound connections from one IP
pub const MAX_CONNECTIONS_PER_IP: usize = 3;

/// Ban score at which a peer is disconnected and blacklisted
pub const BAN_THRESHOLD: u32 = 100;

/// How long a ban lasts (24 hours)
pub const BAN_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Token-bucket refill rate: requests per minute
pub const MAX_REQUESTS_PER_MINUTE: u32 = 60;

/// Interval between keep-alive pings
pub const PING_INTERVAL: Duration = Duration::from_secs(120);

/// Grace period after a ping before a silent peer is dropped
pub const PING_TIMEOUT: Duration = Duration::from_secs(600);

/// How long to wait for a requested item before re-requesting elsewhere
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Outbound queue depth per peer
pub const OUTBOUND_QUEUE_SIZE: usize = 128;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Connection limit reached")]
    TooManyPeers,
    #[error("Peer is banned")]
    Banned,
    #[error("Protocol violation: {0}")]
    ProtocolViolation(&'static str),
    #[error("Request timed out")]
    Timeout,
}

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// TCP dial in progress
    Connecting,
    /// Connected, VERSION/VERACK not yet exchanged both ways
    Handshaking,
    /// Handshake complete, full message flow
    Ready,
    Disconnected,
}

/// Misbehavior kinds and their ban-score penalties
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Misbehavior {
    InvalidBlock,
    InvalidTx,
    OversizedMessage,
    TooManyMessages,
    ProtocolViolation,
    RequestTimeout,
}

impl Misbehavior {
    pub fn penalty(&self) -> u32 {
        match self {
            Misbehavior::InvalidBlock => 100,
            Misbehavior::InvalidTx => 10,
            Misbehavior::OversizedMessage => 50,
            Misbehavior::TooManyMessages => 20,
            Misbehavior::ProtocolViolation => 50,
            Misbehavior::RequestTimeout => 10,
        }
    }
}

/// Token bucket limiting inbound requests per peer
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    /// Tokens per second
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(per_minute: u32) -> Self {
        Self {
            capacity: per_minute as f64,
            tokens: per_minute as f64,
            rate: per_minute as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    /// Take one token; false means the caller is over its rate
    pub fn allow(&mut self) -> bool {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.last_refill = Instant::now();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-peer connection bookkeeping
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub state: PeerState,
    pub outbound: bool,
    pub version: u32,
    pub user_agent: String,
    /// Chain height the peer advertised in its VERSION
    pub start_height: u64,
    pub connected_at: Instant,
    pub last_send: Instant,
    pub last_recv: Instant,
    pub ban_score: u32,
    pub rate: TokenBucket,
    pub version_received: bool,
    pub verack_received: bool,
    pub last_ping_nonce: Option<u64>,
    pub last_ping_at: Option<Instant>,
    pub messages_received: u64,
    pub messages_sent: u64,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr, outbound: bool) -> Self {
        let now = Instant::now();
        Self {
            addr,
            state: if outbound {
                PeerState::Connecting
            } else {
                PeerState::Handshaking
            },
            outbound,
            version: 0,
            user_agent: String::new(),
            start_height: 0,
            connected_at: now,
            last_send: now,
            last_recv: now,
            ban_score: 0,
            rate: TokenBucket::new(MAX_REQUESTS_PER_MINUTE),
            version_received: false,
            verack_received: false,
            last_ping_nonce: None,
            last_ping_at: None,
            messages_received: 0,
            messages_sent: 0,
        }
    }

    /// Both VERSION and VERACK seen from the remote side
    pub fn handshake_complete(&self) -> bool {
        self.version_received && self.verack_received
    }

    /// True when no traffic has arrived for a full ping cycle plus grace
    pub fn is_idle(&self) -> bool {
        self.last_recv.elapsed() > PING_INTERVAL + PING_TIMEOUT
    }

    pub fn record_pong(&mut self, nonce: u64) -> Option<Duration> {
        if self.last_ping_nonce == Some(nonce) {
            let latency = self.last_ping_at.map(|at| at.elapsed());
            self.last_ping_nonce = None;
            self.last_ping_at = None;
            return latency;
        }
        None
    }
}

/// Handle for queueing messages to a peer's writer task
#[derive(Clone)]
pub struct PeerHandle {
    pub addr: SocketAddr,
    pub tx: mpsc::Sender<Message>,
}

impl PeerHandle {
    /// Queue a message, waiting for room. Only the writer path and
    /// responses that must not be dropped use this.
    pub async fn send(&self, msg: Message) -> Result<(), PeerError> {
        self.tx.send(msg).await.map_err(|_| PeerError::Disconnected)
    }

    /// Queue without blocking. Returns false when the queue is full, which
    /// is acceptable only for droppable announcements (INV).
    pub fn try_send(&self, msg: Message) -> bool {
        self.tx.try_send(msg).is_ok()
    }
}

/// A blacklisted address
#[derive(Debug, Clone)]
pub struct BanEntry {
    pub ip: IpAddr,
    pub until: Instant,
    pub reason: String,
}

impl BanEntry {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.until
    }
}

/// Aggregate peer counters
#[derive(Debug, Clone)]
pub struct PeerManagerStats {
    pub total: usize,
    pub ready: usize,
    pub outbound: usize,
    pub banned: usize,
}

/// Owns every peer record, handle, and the ban list
pub struct PeerManager {
    peers: RwLock<HashMap<SocketAddr, PeerInfo>>,
    handles: RwLock<HashMap<SocketAddr, PeerHandle>>,
    /// Addresses learned from ADDR messages and successful connections
    known_peers: RwLock<Vec<String>>,
    banned: RwLock<HashMap<IpAddr, BanEntry>>,
}

impl PeerManager {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
            known_peers: RwLock::new(Vec::new()),
            banned: RwLock::new(HashMap::new()),
        }
    }

    pub async fn is_banned(&self, ip: &IpAddr) -> bool {
        let banned = self.banned.read().await;
        banned.get(ip).map(|e| !e.is_expired()).unwrap_or(false)
    }

    /// Disconnect and blacklist an address
    pub async fn ban(&self, ip: IpAddr, reason: &str) {
        let peers_to_drop: Vec<SocketAddr> = {
            let peers = self.peers.read().await;
            peers
                .keys()
                .filter(|addr| addr.ip() == ip)
                .copied()
                .collect()
        };
        for addr in peers_to_drop {
            self.remove_peer(&addr).await;
        }

        let mut banned = self.banned.write().await;
        banned.insert(
            ip,
            BanEntry {
                ip,
                until: Instant::now() + BAN_DURATION,
                reason: reason.to_string(),
            },
        );
        log::warn!("Banned {} for {:?}: {}", ip, BAN_DURATION, reason);
    }

    pub async fn cleanup_bans(&self) {
        let mut banned = self.banned.write().await;
        banned.retain(|_, entry| !entry.is_expired());
    }

    /// Admission check for a new connection
    pub async fn can_accept(&self, addr: &SocketAddr) -> Result<(), PeerError> {
        if self.is_banned(&addr.ip()).await {
            return Err(PeerError::Banned);
        }
        let peers = self.peers.read().await;
        if peers.len() >= MAX_PEERS {
            return Err(PeerError::TooManyPeers);
        }
        let from_ip = peers.keys().filter(|a| a.ip() == addr.ip()).count();
        if from_ip >= MAX_CONNECTIONS_PER_IP {
            return Err(PeerError::TooManyPeers);
        }
        Ok(())
    }

    pub async fn add_peer(
        &self,
        addr: SocketAddr,
        handle: PeerHandle,
        outbound: bool,
    ) -> Result<(), PeerError> {
        self.can_accept(&addr).await?;

        self.peers
            .write()
            .await
            .insert(addr, PeerInfo::new(addr, outbound));
        self.handles.write().await.insert(addr, handle);

        if outbound {
            self.add_known_peers(vec![addr.to_string()]).await;
        }
        log::info!("Peer {} added (outbound: {})", addr, outbound);
        Ok(())
    }

    pub async fn remove_peer(&self, addr: &SocketAddr) {
        let removed = self.peers.write().await.remove(addr);
        self.handles.write().await.remove(addr);
        if removed.is_some() {
            log::info!("Peer {} removed", addr);
        }
    }

    pub async fn set_state(&self, addr: &SocketAddr, state: PeerState) {
        if let Some(peer) = self.peers.write().await.get_mut(addr) {
            peer.state = state;
        }
    }

    /// Record an inbound VERSION; completes the handshake if VERACK arrived
    pub async fn record_version(&self, addr: &SocketAddr, version: &crate::network::message::VersionMessage) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(addr) {
            peer.version = version.version;
            peer.user_agent = version.user_agent.clone();
            peer.start_height = version.start_height;
            peer.version_received = true;
            if peer.handshake_complete() {
                peer.state = PeerState::Ready;
            }
        }
    }

    pub async fn record_verack(&self, addr: &SocketAddr) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(addr) {
            peer.verack_received = true;
            if peer.handshake_complete() {
                peer.state = PeerState::Ready;
            }
        }
    }

    /// Update traffic counters for a received message
    pub async fn record_recv(&self, addr: &SocketAddr) {
        if let Some(peer) = self.peers.write().await.get_mut(addr) {
            peer.last_recv = Instant::now();
            peer.messages_received += 1;
        }
    }

    /// Check the peer's token bucket; false means over the rate limit
    pub async fn check_rate(&self, addr: &SocketAddr) -> bool {
        match self.peers.write().await.get_mut(addr) {
            Some(peer) => peer.rate.allow(),
            None => false,
        }
    }

    /// Apply a penalty. Returns true when the peer crossed the ban
    /// threshold and was banned.
    pub async fn penalize(&self, addr: &SocketAddr, misbehavior: Misbehavior) -> bool {
        let (score, should_ban) = {
            let mut peers = self.peers.write().await;
            match peers.get_mut(addr) {
                Some(peer) => {
                    peer.ban_score += misbehavior.penalty();
                    (peer.ban_score, peer.ban_score >= BAN_THRESHOLD)
                }
                None => return false,
            }
        };
        log::warn!("Peer {} misbehaved ({:?}), ban score {}", addr, misbehavior, score);
        if should_ban {
            self.ban(addr.ip(), &format!("{:?}", misbehavior)).await;
        }
        should_ban
    }

    pub async fn get_peer(&self, addr: &SocketAddr) -> Option<PeerInfo> {
        self.peers.read().await.get(addr).cloned()
    }

    pub async fn ready_peers(&self) -> Vec<SocketAddr> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.state == PeerState::Ready)
            .map(|p| p.addr)
            .collect()
    }

    pub async fn all_peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// The ready peer advertising the highest chain
    pub async fn best_peer(&self) -> Option<(SocketAddr, u64)> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.state == PeerState::Ready)
            .max_by_key(|p| p.start_height)
            .map(|p| (p.addr, p.start_height))
    }

    /// Peers with no traffic past the idle window
    pub async fn idle_peers(&self) -> Vec<SocketAddr> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.is_idle())
            .map(|p| p.addr)
            .collect()
    }

    pub async fn mark_ping(&self, addr: &SocketAddr, nonce: u64) {
        if let Some(peer) = self.peers.write().await.get_mut(addr) {
            peer.last_ping_nonce = Some(nonce);
            peer.last_ping_at = Some(Instant::now());
        }
    }

    pub async fn record_pong(&self, addr: &SocketAddr, nonce: u64) -> Option<Duration> {
        self.peers
            .write()
            .await
            .get_mut(addr)
            .and_then(|p| p.record_pong(nonce))
    }

    pub async fn known_peers(&self) -> Vec<String> {
        self.known_peers.read().await.clone()
    }

    pub async fn add_known_peers(&self, addrs: Vec<String>) {
        let mut known = self.known_peers.write().await;
        for addr in addrs {
            if !known.contains(&addr) {
                known.push(addr);
            }
        }
    }

    /// Queue a message for one peer, waiting for room
    pub async fn send_to(&self, addr: &SocketAddr, msg: Message) -> Result<(), PeerError> {
        let handle = {
            let handles = self.handles.read().await;
            handles.get(addr).cloned()
        };
        match handle {
            Some(handle) => {
                let sent = handle.send(msg).await;
                if sent.is_ok() {
                    if let Some(peer) = self.peers.write().await.get_mut(addr) {
                        peer.last_send = Instant::now();
                        peer.messages_sent += 1;
                    }
                }
                sent
            }
            None => Err(PeerError::Disconnected),
        }
    }

    /// Queue a message without blocking. Returns false when the peer is
    /// gone or its outbound queue is full; callers that must deliver
    /// should disconnect the peer in that case rather than wait.
    pub async fn try_send_to(&self, addr: &SocketAddr, msg: Message) -> bool {
        let handles = self.handles.read().await;
        match handles.get(addr) {
            Some(handle) => handle.try_send(msg),
            None => false,
        }
    }

    /// Fan an announcement out to every ready peer except `except`.
    /// Queued without blocking; full queues drop the announcement.
    pub async fn relay(&self, msg: Message, except: Option<&SocketAddr>) {
        let targets = self.ready_peers().await;
        let handles = self.handles.read().await;
        for addr in targets {
            if Some(&addr) == except {
                continue;
            }
            if let Some(handle) = handles.get(&addr) {
                if !handle.try_send(msg.clone()) {
                    log::debug!("Dropping relay to {}: outbound queue full", addr);
                }
            }
        }
    }

    pub async fn stats(&self) -> PeerManagerStats {
        let peers = self.peers.read().await;
        let banned = self.banned.read().await;
        PeerManagerStats {
            total: peers.len(),
            ready: peers.values().filter(|p| p.state == PeerState::Ready).count(),
            outbound: peers.values().filter(|p| p.outbound).count(),
            banned: banned.len(),
        }
    }
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::VersionMessage;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn handle(addr: SocketAddr) -> (PeerHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        (PeerHandle { addr, tx }, rx)
    }

    #[tokio::test]
    async fn test_handshake_state_machine() {
        let manager = PeerManager::new();
        let a = addr(9001);
        let (h, _rx) = handle(a);
        manager.add_peer(a, h, true).await.unwrap();

        assert_eq!(manager.get_peer(&a).await.unwrap().state, PeerState::Connecting);

        manager.set_state(&a, PeerState::Handshaking).await;
        manager.record_version(&a, &VersionMessage::new(1, 42)).await;
        assert_eq!(manager.get_peer(&a).await.unwrap().state, PeerState::Handshaking);

        manager.record_verack(&a).await;
        let peer = manager.get_peer(&a).await.unwrap();
        assert_eq!(peer.state, PeerState::Ready);
        assert_eq!(peer.start_height, 42);
    }

    #[tokio::test]
    async fn test_ban_threshold_and_blacklist() {
        let manager = PeerManager::new();
        let a = addr(9002);
        let (h, _rx) = handle(a);
        manager.add_peer(a, h, false).await.unwrap();

        // One invalid block is an instant ban
        assert!(manager.penalize(&a, Misbehavior::InvalidBlock).await);
        assert!(manager.is_banned(&a.ip()).await);
        assert_eq!(manager.peer_count().await, 0);

        // Reconnection attempts are refused while banned
        let (h2, _rx2) = handle(a);
        assert!(matches!(
            manager.add_peer(a, h2, false).await,
            Err(PeerError::Banned)
        ));
    }

    #[tokio::test]
    async fn test_gradual_ban_accumulation() {
        let manager = PeerManager::new();
        let a = addr(9003);
        let (h, _rx) = handle(a);
        manager.add_peer(a, h, false).await.unwrap();

        // Nine invalid transactions stay under the threshold
        for _ in 0..9 {
            assert!(!manager.penalize(&a, Misbehavior::InvalidTx).await);
        }
        // The tenth crosses 100
        assert!(manager.penalize(&a, Misbehavior::InvalidTx).await);
    }

    #[tokio::test]
    async fn test_per_ip_connection_limit() {
        let manager = PeerManager::new();
        for port in 0..MAX_CONNECTIONS_PER_IP as u16 {
            let a = addr(9100 + port);
            let (h, _rx) = handle(a);
            manager.add_peer(a, h, false).await.unwrap();
        }
        let a = addr(9100 + MAX_CONNECTIONS_PER_IP as u16);
        let (h, _rx) = handle(a);
        assert!(matches!(
            manager.add_peer(a, h, false).await,
            Err(PeerError::TooManyPeers)
        ));
    }

    #[tokio::test]
    async fn test_best_peer_requires_ready() {
        let manager = PeerManager::new();
        let a = addr(9200);
        let (h, _rx) = handle(a);
        manager.add_peer(a, h, true).await.unwrap();
        manager.record_version(&a, &VersionMessage::new(1, 500)).await;

        // Still handshaking: not eligible
        assert!(manager.best_peer().await.is_none());

        manager.record_verack(&a).await;
        assert_eq!(manager.best_peer().await, Some((a, 500)));
    }

    #[test]
    fn test_token_bucket_exhausts_and_refills() {
        let mut bucket = TokenBucket::new(60);
        for _ in 0..60 {
            assert!(bucket.allow());
        }
        assert!(!bucket.allow());
    }

    #[tokio::test]
    async fn test_pong_matches_nonce() {
        let manager = PeerManager::new();
        let a = addr(9300);
        let (h, _rx) = handle(a);
        manager.add_peer(a, h, true).await.unwrap();

        manager.mark_ping(&a, 777).await;
        assert!(manager.record_pong(&a, 778).await.is_none());
        assert!(manager.record_pong(&a, 777).await.is_some());
    }
}

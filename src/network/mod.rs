//! P2P networking
//!
//! Peer lifecycle, wire framing, message types, inventory synchronization,
//! and the node that ties them together.

pub mod message;
pub mod node;
pub mod peer;
pub mod server;
pub mod sync;
pub mod wire;

pub use message::{InvItem, InvKind, Message, VersionMessage, MAX_INV_ITEMS, PROTOCOL_VERSION};
pub use node::{Node, NodeConfig, NodeStatus};
pub use peer::{
    BanEntry, Misbehavior, PeerError, PeerHandle, PeerInfo, PeerManager, PeerState, TokenBucket,
    BAN_DURATION, BAN_THRESHOLD, MAX_CONNECTIONS_PER_IP, MAX_PEERS, MAX_REQUESTS_PER_MINUTE,
};
pub use server::{PeerEvent, Server};
pub use sync::ChainSync;
pub use wire::{FrameCodec, MAX_MESSAGE_SIZE};

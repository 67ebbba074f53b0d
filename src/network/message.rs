//! Network message types for the P2P protocol
//!
//! Each message maps to a 12-byte ASCII command on the wire and a payload
//! in the canonical codec. Decoding dispatches on the command to a typed
//! payload, so handlers match on a single enum.

use crate::codec::{
    write_string, write_u32, write_u64, write_u8, CodecError, Decodable, Encodable, Reader,
};
use crate::core::{Block, Transaction};
use crate::crypto::Hash256;
use chrono::Utc;

/// Protocol version spoken by this node
pub const PROTOCOL_VERSION: u32 = 1;

/// Service flag advertising a full node
pub const SERVICE_NODE_NETWORK: u64 = 1;

/// Maximum inventory items per INV/GETDATA message; an INV carrying fewer
/// than this also signals the end of an initial block download batch
pub const MAX_INV_ITEMS: usize = 500;

/// Maximum hashes in a block locator
pub const MAX_LOCATOR_HASHES: usize = 101;

/// Maximum addresses in an ADDR message
pub const MAX_ADDR_ITEMS: usize = 1000;

/// VERSION handshake payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: u64,
    /// Random nonce detecting self-connections
    pub nonce: u64,
    pub user_agent: String,
    /// Height of the sender's chain tip
    pub start_height: u64,
}

impl VersionMessage {
    pub fn new(nonce: u64, start_height: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            services: SERVICE_NODE_NETWORK,
            timestamp: Utc::now().timestamp() as u64,
            nonce,
            user_agent: format!("ironcoin/{}", env!("CARGO_PKG_VERSION")),
            start_height,
        }
    }
}

impl Encodable for VersionMessage {
    fn encode(&self, out: &mut Vec<u8>) {
        write_u32(out, self.version);
        write_u64(out, self.services);
        write_u64(out, self.timestamp);
        write_u64(out, self.nonce);
        write_string(out, &self.user_agent);
        write_u64(out, self.start_height);
    }
}

impl Decodable for VersionMessage {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            version: r.read_u32()?,
            services: r.read_u64()?,
            timestamp: r.read_u64()?,
            nonce: r.read_u64()?,
            user_agent: r.read_string()?,
            start_height: r.read_u64()?,
        })
    }
}

/// Kind tag for inventory items
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvKind {
    Tx,
    Block,
}

/// Announcement of a transaction or block by hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvItem {
    pub kind: InvKind,
    pub hash: Hash256,
}

impl InvItem {
    pub fn tx(hash: Hash256) -> Self {
        Self {
            kind: InvKind::Tx,
            hash,
        }
    }

    pub fn block(hash: Hash256) -> Self {
        Self {
            kind: InvKind::Block,
            hash,
        }
    }
}

impl Encodable for InvItem {
    fn encode(&self, out: &mut Vec<u8>) {
        let tag = match self.kind {
            InvKind::Tx => 1,
            InvKind::Block => 2,
        };
        write_u8(out, tag);
        self.hash.encode(out);
    }
}

impl Decodable for InvItem {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let kind = match r.read_u8()? {
            1 => InvKind::Tx,
            2 => InvKind::Block,
            _ => return Err(CodecError::InvalidValue("inventory kind")),
        };
        Ok(Self {
            kind,
            hash: Hash256::decode(r)?,
        })
    }
}

/// All P2P messages
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    GetAddr,
    /// Known peer addresses as "host:port" strings
    Addr(Vec<String>),
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    Block(Block),
    Tx(Transaction),
    /// Request block inventory following the most recent locator match
    GetBlocks {
        locator: Vec<Hash256>,
        stop: Hash256,
    },
}

impl Message {
    /// Wire command string for this message
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::GetAddr => "getaddr",
            Message::Addr(_) => "addr",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::GetBlocks { .. } => "getblocks",
        }
    }

    /// Encode the payload (without framing)
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Message::Version(v) => v.encode(&mut out),
            Message::Verack | Message::GetAddr => {}
            Message::Ping(nonce) | Message::Pong(nonce) => write_u64(&mut out, *nonce),
            Message::Addr(addrs) => {
                crate::codec::write_varint(&mut out, addrs.len() as u64);
                for addr in addrs {
                    write_string(&mut out, addr);
                }
            }
            Message::Inv(items) | Message::GetData(items) => items.encode(&mut out),
            Message::Block(block) => block.encode(&mut out),
            Message::Tx(tx) => tx.encode(&mut out),
            Message::GetBlocks { locator, stop } => {
                locator.encode(&mut out);
                stop.encode(&mut out);
            }
        }
        out
    }

    /// Decode a payload for the given command. The whole payload must be
    /// consumed; message-specific item limits are enforced here.
    pub fn decode(command: &str, payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        let message = match command {
            "version" => Message::Version(VersionMessage::decode(&mut r)?),
            "verack" => Message::Verack,
            "ping" => Message::Ping(r.read_u64()?),
            "pong" => Message::Pong(r.read_u64()?),
            "getaddr" => Message::GetAddr,
            "addr" => {
                let count = r.read_varint()?;
                if count > MAX_ADDR_ITEMS as u64 {
                    return Err(CodecError::InvalidValue("too many addresses"));
                }
                let mut addrs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    addrs.push(r.read_string()?);
                }
                Message::Addr(addrs)
            }
            "inv" => Message::Inv(Self::decode_inv(&mut r)?),
            "getdata" => Message::GetData(Self::decode_inv(&mut r)?),
            "block" => Message::Block(Block::decode(&mut r)?),
            "tx" => Message::Tx(Transaction::decode(&mut r)?),
            "getblocks" => {
                let locator = Vec::<Hash256>::decode(&mut r)?;
                if locator.len() > MAX_LOCATOR_HASHES {
                    return Err(CodecError::InvalidValue("locator too long"));
                }
                Message::GetBlocks {
                    locator,
                    stop: Hash256::decode(&mut r)?,
                }
            }
            _ => return Err(CodecError::InvalidValue("unknown command")),
        };
        r.finish()?;
        Ok(message)
    }

    fn decode_inv(r: &mut Reader<'_>) -> Result<Vec<InvItem>, CodecError> {
        let items = Vec::<InvItem>::decode(r)?;
        if items.len() > MAX_INV_ITEMS {
            return Err(CodecError::InvalidValue("too many inventory items"));
        }
        Ok(items)
    }
}

//! Wire framing for P2P messages
//!
//! Every frame is `magic (4) || command (12, ASCII null-padded) ||
//! payload_len (4, LE) || checksum (4, first bytes of hash256(payload)) ||
//! payload`. A bad magic, an oversized length, or a checksum mismatch is a
//! protocol violation and surfaces as an I/O error, which disconnects the
//! peer.

use crate::crypto::hash256;
use crate::network::message::Message;
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Frame header size: magic + command + length + checksum
pub const HEADER_SIZE: usize = 24;

/// Maximum payload size (32 MiB)
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Length-prefixed, checksummed frame codec for one network's magic
pub struct FrameCodec {
    magic: [u8; 4],
}

impl FrameCodec {
    pub fn new(magic: [u8; 4]) -> Self {
        Self { magic }
    }
}

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

impl Encoder<Message> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.encode_payload();
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(invalid_data("payload exceeds message size limit"));
        }

        let command = item.command().as_bytes();
        let mut command_field = [0u8; 12];
        command_field[..command.len()].copy_from_slice(command);

        let checksum = hash256(&payload);

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_slice(&self.magic);
        dst.put_slice(&command_field);
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&checksum.as_bytes()[..4]);
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        if src[..4] != self.magic {
            return Err(invalid_data("invalid network magic"));
        }

        let command_field = &src[4..16];
        let len = u32::from_le_bytes([src[16], src[17], src[18], src[19]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(invalid_data("oversized message"));
        }

        if src.len() < HEADER_SIZE + len {
            // Pre-reserve so the transport reads the rest in one pass
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        let command = {
            let end = command_field
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(command_field.len());
            std::str::from_utf8(&command_field[..end])
                .map_err(|_| invalid_data("non-ASCII command"))?
                .to_string()
        };
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&src[20..24]);

        src.advance(HEADER_SIZE);
        let payload = src.split_to(len);

        if hash256(&payload).as_bytes()[..4] != checksum {
            return Err(invalid_data("checksum mismatch"));
        }

        Message::decode(&command, &payload)
            .map(Some)
            .map_err(|e| invalid_data(&e.to_string()))
    }
}

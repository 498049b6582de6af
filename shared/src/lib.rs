//! Types shared between the gateway core and the network-decode layer:
//! inbound packet envelopes, parse faults, the bounds-checked decode
//! container, and the outbound notices the core sends to clients.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

/// Protocol revision expected from connecting clients.
pub const PROTOCOL_VERSION: u32 = 3;

/// Hard ceiling on any client-supplied repeated field. Individual opcodes
/// may enforce tighter limits through [`BoundedVec`].
pub const MAX_CLIENT_ARRAY_LEN: usize = 4096;

/// Largest payload the decode layer will hand to the core.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Which socket of a connection an envelope arrived on. The secondary
/// channel is attached after login via a correlation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionChannel {
    Primary,
    Secondary,
}

/// A single already-decoded inbound message: opcode, originating channel
/// and raw payload. The envelope itself is immutable once queued; only the
/// read cursor advances while a handler parses the payload.
#[derive(Debug, Clone)]
pub struct PacketEnvelope {
    pub opcode: u16,
    pub channel: ConnectionChannel,
    payload: Vec<u8>,
    read_cursor: usize,
}

impl PacketEnvelope {
    pub fn new(opcode: u16, channel: ConnectionChannel, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            channel,
            payload,
            read_cursor: 0,
        }
    }

    /// Bytes not yet consumed by the handler.
    pub fn remaining(&self) -> usize {
        self.payload.len() - self.read_cursor
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn read_u8(&mut self) -> Result<u8, ParseFault> {
        let bytes = self.read_bytes(1)?;
        Ok(bytes[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, ParseFault> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, ParseFault> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, ParseFault> {
        let bytes = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    /// Consumes `count` bytes, faulting instead of reading past the end.
    pub fn read_bytes(&mut self, count: usize) -> Result<&[u8], ParseFault> {
        if count > self.remaining() {
            return Err(ParseFault::Truncated {
                opcode: self.opcode,
                wanted: count,
                remaining: self.remaining(),
            });
        }
        let start = self.read_cursor;
        self.read_cursor += count;
        Ok(&self.payload[start..self.read_cursor])
    }
}

/// A malformed or oversized packet payload. Always recovered locally: the
/// offending packet is dropped and the session continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseFault {
    /// Handler tried to read past the end of the payload.
    Truncated {
        opcode: u16,
        wanted: usize,
        remaining: usize,
    },
    /// A client-declared repeated field exceeded its enforced maximum.
    ArrayLimitExceeded { limit: usize },
    /// Payload exceeded [`MAX_PAYLOAD_BYTES`] before decode.
    Oversized { len: usize },
}

impl fmt::Display for ParseFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseFault::Truncated {
                opcode,
                wanted,
                remaining,
            } => write!(
                f,
                "truncated payload for opcode {:#06x}: wanted {} bytes, {} remaining",
                opcode, wanted, remaining
            ),
            ParseFault::ArrayLimitExceeded { limit } => {
                write!(f, "client array exceeded enforced limit of {}", limit)
            }
            ParseFault::Oversized { len } => {
                write!(f, "payload of {} bytes exceeds maximum", len)
            }
        }
    }
}

impl Error for ParseFault {}

/// Growable container with an enforced maximum capacity, used when decoding
/// client-supplied repeated fields. Insertion past the limit is rejected
/// with a typed fault rather than silently truncated, so a forged length
/// prefix cannot make the server allocate or loop unboundedly.
#[derive(Debug, Clone)]
pub struct BoundedVec<T> {
    items: Vec<T>,
    limit: usize,
}

impl<T> BoundedVec<T> {
    pub fn new(limit: usize) -> Self {
        Self {
            items: Vec::new(),
            limit: limit.min(MAX_CLIENT_ARRAY_LEN),
        }
    }

    pub fn push(&mut self, item: T) -> Result<(), ParseFault> {
        if self.items.len() >= self.limit {
            return Err(ParseFault::ArrayLimitExceeded { limit: self.limit });
        }
        self.items.push(item);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn into_inner(self) -> Vec<T> {
        self.items
    }
}

/// Messages the core sends back to a client. The core serializes a notice
/// with bincode and hands the bytes to the connection; it never does its
/// own wire framing.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum ServerNotice {
    /// 1-based position in the login queue, re-sent as the queue advances.
    QueuePosition { position: u32 },
    /// Admission granted; the client may proceed with world entry.
    LoginProceed,
    Disconnected { reason: String },
    BanNotice { seconds: u64 },
}

impl ServerNotice {
    /// Encodes the notice for transmission. Encoding these variants cannot
    /// fail; an empty frame is returned in the degenerate case so notify
    /// paths never have to handle an error.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Option<ServerNotice> {
        bincode::deserialize(bytes).ok()
    }
}

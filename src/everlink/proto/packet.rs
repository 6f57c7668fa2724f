use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;

use crate::everlink::common::{Error, Result};

/// Size of the little-endian i64 length prefix on every wire frame.
pub const LENGTH_PREFIX_BYTES: usize = 8;

/// Type tag carried in the first byte of every top-level Packet. The numeric
/// values are part of the wire contract between client and server builds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    TerminalBuffer = 0,
    KeepAlive = 1,
    PortForwardData = 2,
    PortForwardSourceRequest = 3,
    PortForwardSourceResponse = 4,
    PortForwardDestinationRequest = 5,
    PortForwardDestinationResponse = 6,
}

impl PacketType {
    pub fn new(b: u8) -> Result<PacketType> {
        match b {
            0 => Ok(PacketType::TerminalBuffer),
            1 => Ok(PacketType::KeepAlive),
            2 => Ok(PacketType::PortForwardData),
            3 => Ok(PacketType::PortForwardSourceRequest),
            4 => Ok(PacketType::PortForwardSourceResponse),
            5 => Ok(PacketType::PortForwardDestinationRequest),
            6 => Ok(PacketType::PortForwardDestinationResponse),
            _ => Err(Error::protocol_error(format!("unknown packet type {}", b))),
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// One application frame on the resilient stream: a type tag followed by a
/// length-prefixed payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(packet_type: PacketType, payload: Bytes) -> Packet {
        Packet {
            packet_type,
            payload,
        }
    }

    pub fn from_message<M: Message>(packet_type: PacketType, msg: &M) -> Packet {
        Packet {
            packet_type,
            payload: Bytes::from(msg.encode_to_vec()),
        }
    }

    pub fn decode<M: Message + Default>(&self) -> Result<M> {
        M::decode(self.payload.as_ref()).map_err(Error::from)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + LENGTH_PREFIX_BYTES + self.payload.len());
        buf.put_u8(self.packet_type.as_u8());
        buf.put_i64_le(self.payload.len() as i64);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// Validates a decoded length prefix against the configured frame cap.
pub fn check_frame_length(length: i64, max_frame_bytes: usize) -> Result<usize> {
    if length < 0 {
        return Err(Error::protocol_error(format!(
            "negative frame length {}",
            length
        )));
    }
    let length = length as usize;
    if length > max_frame_bytes {
        return Err(Error::protocol_error(format!(
            "frame length {} exceeds cap {}",
            length, max_frame_bytes
        )));
    }
    Ok(length)
}

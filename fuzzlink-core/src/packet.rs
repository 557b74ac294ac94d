//! A complete frame: header plus encoded body.

use crate::error::FuzzlinkError;
use crate::header::{Direction, HEADER_SIZE, PacketHeader};
use crate::message::Message;

/// Largest body accepted in either direction. Program outputs and raw
/// coverage dominate; 64 MiB leaves plenty of headroom.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Largest frame the codec will buffer.
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: PacketHeader,
    payload: Vec<u8>,
}

impl Packet {
    /// Frame a message of either family.
    pub fn from_message<M: Message>(message: &M) -> Result<Self, FuzzlinkError> {
        let payload = message.encode_body()?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FuzzlinkError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            header: PacketHeader::new(M::DIRECTION, message.tag(), &payload),
            payload,
        })
    }

    /// Decode the body as a message of family `M`.
    pub fn into_message<M: Message>(self) -> Result<M, FuzzlinkError> {
        if self.header.direction() != M::DIRECTION {
            return Err(FuzzlinkError::MalformedFrame(format!(
                "{} frame cannot carry {}",
                self.header.direction(),
                M::FAMILY
            )));
        }
        M::decode_body(self.header.tag(), &self.payload)
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn tag(&self) -> u32 {
        self.header.tag()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len());
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parse exactly one frame travelling in `direction`.
    ///
    /// `bytes` must hold the whole frame and nothing else.
    pub fn from_bytes(bytes: &[u8], direction: Direction) -> Result<Self, FuzzlinkError> {
        let header = PacketHeader::from_bytes(bytes, direction)?;
        let len = checked_payload_len(&header)?;
        let body = &bytes[HEADER_SIZE..];
        if body.len() < len {
            return Err(FuzzlinkError::MalformedFrame(format!(
                "frame truncated: {} of {len} payload bytes",
                body.len()
            )));
        }
        if body.len() > len {
            return Err(FuzzlinkError::MalformedFrame(format!(
                "{} trailing bytes after frame",
                body.len() - len
            )));
        }
        header.verify(body)?;
        Ok(Self {
            header,
            payload: body.to_vec(),
        })
    }
}

/// Payload length from a header, rejecting anything above the limit.
pub(crate) fn checked_payload_len(header: &PacketHeader) -> Result<usize, FuzzlinkError> {
    let len = header.payload_len();
    if len > MAX_PAYLOAD_SIZE as u64 {
        return Err(FuzzlinkError::MalformedFrame(format!(
            "payload length {len} exceeds limit {MAX_PAYLOAD_SIZE}"
        )));
    }
    Ok(len as usize)
}

//! Fixed-size frame header.
//!
//! ```text
//! offset  size  field
//!      0     4  magic        "FZH0" (host → executor) / "FZE0" (executor → host)
//!      4     4  tag          message variant, see `message`
//!      8     8  payload_len  bytes following the header
//!     16     4  checksum     first 4 bytes of blake3(payload), 0 if empty
//! ```
//!
//! All fields are little-endian.

use crate::error::FuzzlinkError;

/// Size of an encoded header in bytes.
pub const HEADER_SIZE: usize = 20;

/// Which way a frame travels. Each direction has its own magic so a
/// decoder never has to guess the family from the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    HostToExecutor,
    ExecutorToHost,
}

impl Direction {
    pub const fn magic(self) -> [u8; 4] {
        match self {
            Direction::HostToExecutor => *b"FZH0",
            Direction::ExecutorToHost => *b"FZE0",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::HostToExecutor => write!(f, "host->executor"),
            Direction::ExecutorToHost => write!(f, "executor->host"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    direction: Direction,
    tag: u32,
    payload_len: u64,
    checksum: u32,
}

impl PacketHeader {
    pub fn new(direction: Direction, tag: u32, payload: &[u8]) -> Self {
        Self {
            direction,
            tag,
            payload_len: payload.len() as u64,
            checksum: checksum(payload),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.direction.magic());
        buf[4..8].copy_from_slice(&self.tag.to_le_bytes());
        buf[8..16].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[16..20].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Parse a header, requiring the magic of `expected`.
    pub fn from_bytes(bytes: &[u8], expected: Direction) -> Result<Self, FuzzlinkError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FuzzlinkError::MalformedFrame(format!(
                "header truncated: {} < {HEADER_SIZE} bytes",
                bytes.len()
            )));
        }
        if bytes[0..4] != expected.magic() {
            return Err(FuzzlinkError::MalformedFrame(format!(
                "bad magic {:02x?}, expected {expected} frame",
                &bytes[0..4]
            )));
        }
        Ok(Self {
            direction: expected,
            tag: read_u32(&bytes[4..8]),
            payload_len: u64::from_le_bytes([
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14],
                bytes[15],
            ]),
            checksum: read_u32(&bytes[16..20]),
        })
    }

    /// Verify `payload` against the stored length and checksum.
    pub fn verify(&self, payload: &[u8]) -> Result<(), FuzzlinkError> {
        if payload.len() as u64 != self.payload_len {
            return Err(FuzzlinkError::MalformedFrame(format!(
                "payload length {} does not match header {}",
                payload.len(),
                self.payload_len
            )));
        }
        if checksum(payload) != self.checksum {
            return Err(FuzzlinkError::MalformedFrame("checksum mismatch".into()));
        }
        Ok(())
    }
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// Truncated blake3 digest of a payload; empty payloads hash to 0.
pub fn checksum(payload: &[u8]) -> u32 {
    if payload.is_empty() {
        return 0;
    }
    let hash = blake3::hash(payload);
    let b = hash.as_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = PacketHeader::new(Direction::ExecutorToHost, 3, b"hello");
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], b"FZE0");
        let decoded = PacketHeader::from_bytes(&bytes, Direction::ExecutorToHost).unwrap();
        assert_eq!(decoded, header);
        decoded.verify(b"hello").unwrap();
    }

    #[test]
    fn wrong_direction_rejected() {
        let bytes = PacketHeader::new(Direction::HostToExecutor, 1, &[]).to_bytes();
        let err = PacketHeader::from_bytes(&bytes, Direction::ExecutorToHost).unwrap_err();
        assert!(matches!(err, FuzzlinkError::MalformedFrame(_)));
    }

    #[test]
    fn empty_payload_has_zero_checksum() {
        let header = PacketHeader::new(Direction::HostToExecutor, 5, &[]);
        assert_eq!(header.checksum(), 0);
        assert_eq!(header.payload_len(), 0);
    }

    #[test]
    fn tampered_payload_fails_verify() {
        let header = PacketHeader::new(Direction::HostToExecutor, 1, b"abc");
        assert!(header.verify(b"abd").is_err());
        assert!(header.verify(b"ab").is_err());
    }

    #[test]
    fn truncated_header_rejected() {
        let bytes = PacketHeader::new(Direction::HostToExecutor, 1, &[]).to_bytes();
        assert!(PacketHeader::from_bytes(&bytes[..10], Direction::HostToExecutor).is_err());
    }
}

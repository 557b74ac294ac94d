//! Framing for both message families.
//!
//! [`encode`] / [`decode`] are the pure, whole-frame transforms.
//! [`FrameCodec`] adapts the same format to `tokio_util::codec` for use
//! with `Framed` streams; partial input there means "wait for more bytes".

use std::marker::PhantomData;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FuzzlinkError;
use crate::header::{HEADER_SIZE, PacketHeader};
use crate::message::{ExecutorMessage, HostMessage, Message};
use crate::packet::{Packet, checked_payload_len};

/// Encode one message into a complete frame.
pub fn encode<M: Message>(message: &M) -> Result<Vec<u8>, FuzzlinkError> {
    Ok(Packet::from_message(message)?.to_bytes())
}

/// Decode exactly one complete frame.
pub fn decode<M: Message>(bytes: &[u8]) -> Result<M, FuzzlinkError> {
    Packet::from_bytes(bytes, M::DIRECTION)?.into_message()
}

/// Streaming codec reading `In` frames and writing `Out` frames.
#[derive(Debug)]
pub struct FrameCodec<In, Out> {
    _marker: PhantomData<fn(Out) -> In>,
}

/// The host reads executor messages and writes host messages.
pub type HostCodec = FrameCodec<ExecutorMessage, HostMessage>;

/// The executor reads host messages and writes executor messages.
pub type ExecutorCodec = FrameCodec<HostMessage, ExecutorMessage>;

impl<In, Out> FrameCodec<In, Out> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<In, Out> Default for FrameCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: Message, Out> Decoder for FrameCodec<In, Out> {
    type Item = In;
    type Error = FuzzlinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = PacketHeader::from_bytes(&src[..HEADER_SIZE], In::DIRECTION)?;
        let len = checked_payload_len(&header)?;
        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(len);
        header.verify(&payload)?;
        In::decode_body(header.tag(), &payload).map(Some)
    }
}

impl<In, Out: Message> Encoder<Out> for FrameCodec<In, Out> {
    type Error = FuzzlinkError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let packet = Packet::from_message(&item)?;
        dst.reserve(packet.len());
        dst.extend_from_slice(&packet.header().to_bytes());
        dst.extend_from_slice(packet.payload());
        Ok(())
    }
}

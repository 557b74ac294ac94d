//! The two closed message families.
//!
//! Host→executor and executor→host traffic use disjoint sum types so a
//! decoder never infers direction from content. Each variant has a fixed
//! numeric tag carried in the frame header; unknown tags are reported as
//! `FuzzlinkError::UnknownVariant`, never coerced into a default.

use std::fmt;

use bincode::Options;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::FuzzlinkError;
use crate::header::Direction;
use crate::packet::MAX_PAYLOAD_SIZE;
use crate::protocol::{
    ConnectReply, ConnectRequest, CoverFilter, ExecRequest, ExecResult, ExecutingMessage,
    InfoReply, SignalUpdate, StateResult,
};

// ── Tags ─────────────────────────────────────────────────────────

/// Tags of host → executor messages.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostTag {
    ConnectReply = 0x01,
    CoverFilter = 0x02,
    ExecRequest = 0x03,
    SignalUpdate = 0x04,
    CorpusTriaged = 0x05,
    StateRequest = 0x06,
}

impl TryFrom<u32> for HostTag {
    type Error = FuzzlinkError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(HostTag::ConnectReply),
            0x02 => Ok(HostTag::CoverFilter),
            0x03 => Ok(HostTag::ExecRequest),
            0x04 => Ok(HostTag::SignalUpdate),
            0x05 => Ok(HostTag::CorpusTriaged),
            0x06 => Ok(HostTag::StateRequest),
            tag => Err(FuzzlinkError::UnknownVariant {
                family: HostMessage::FAMILY,
                tag,
            }),
        }
    }
}

/// Tags of executor → host messages.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorTag {
    ConnectRequest = 0x01,
    InfoReply = 0x02,
    Executing = 0x03,
    ExecResult = 0x04,
    StateResult = 0x05,
}

impl TryFrom<u32> for ExecutorTag {
    type Error = FuzzlinkError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(ExecutorTag::ConnectRequest),
            0x02 => Ok(ExecutorTag::InfoReply),
            0x03 => Ok(ExecutorTag::Executing),
            0x04 => Ok(ExecutorTag::ExecResult),
            0x05 => Ok(ExecutorTag::StateResult),
            tag => Err(FuzzlinkError::UnknownVariant {
                family: ExecutorMessage::FAMILY,
                tag,
            }),
        }
    }
}

// ── Families ─────────────────────────────────────────────────────

/// Everything the host may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMessage {
    ConnectReply(ConnectReply),
    CoverFilter(CoverFilter),
    ExecRequest(ExecRequest),
    SignalUpdate(SignalUpdate),
    CorpusTriaged,
    StateRequest,
}

/// Everything the executor may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorMessage {
    ConnectRequest(ConnectRequest),
    InfoReply(InfoReply),
    Executing(ExecutingMessage),
    ExecResult(ExecResult),
    StateResult(StateResult),
}

/// A message family that can be framed.
pub trait Message: Sized + Send + fmt::Display + fmt::Debug + 'static {
    /// Direction every frame of this family travels in.
    const DIRECTION: Direction;
    /// Name used in diagnostics.
    const FAMILY: &'static str;

    fn tag(&self) -> u32;

    fn encode_body(&self) -> Result<Vec<u8>, FuzzlinkError>;

    fn decode_body(tag: u32, body: &[u8]) -> Result<Self, FuzzlinkError>;
}

impl Message for HostMessage {
    const DIRECTION: Direction = Direction::HostToExecutor;
    const FAMILY: &'static str = "HostMessage";

    fn tag(&self) -> u32 {
        let tag = match self {
            HostMessage::ConnectReply(_) => HostTag::ConnectReply,
            HostMessage::CoverFilter(_) => HostTag::CoverFilter,
            HostMessage::ExecRequest(_) => HostTag::ExecRequest,
            HostMessage::SignalUpdate(_) => HostTag::SignalUpdate,
            HostMessage::CorpusTriaged => HostTag::CorpusTriaged,
            HostMessage::StateRequest => HostTag::StateRequest,
        };
        tag as u32
    }

    fn encode_body(&self) -> Result<Vec<u8>, FuzzlinkError> {
        match self {
            HostMessage::ConnectReply(m) => encode_value(m),
            HostMessage::CoverFilter(m) => encode_value(m),
            HostMessage::ExecRequest(m) => encode_value(m),
            HostMessage::SignalUpdate(m) => encode_value(m),
            HostMessage::CorpusTriaged | HostMessage::StateRequest => Ok(Vec::new()),
        }
    }

    fn decode_body(tag: u32, body: &[u8]) -> Result<Self, FuzzlinkError> {
        Ok(match HostTag::try_from(tag)? {
            HostTag::ConnectReply => HostMessage::ConnectReply(decode_value(body)?),
            HostTag::CoverFilter => HostMessage::CoverFilter(decode_value(body)?),
            HostTag::ExecRequest => HostMessage::ExecRequest(decode_value(body)?),
            HostTag::SignalUpdate => HostMessage::SignalUpdate(decode_value(body)?),
            HostTag::CorpusTriaged => {
                expect_empty(body)?;
                HostMessage::CorpusTriaged
            }
            HostTag::StateRequest => {
                expect_empty(body)?;
                HostMessage::StateRequest
            }
        })
    }
}

impl Message for ExecutorMessage {
    const DIRECTION: Direction = Direction::ExecutorToHost;
    const FAMILY: &'static str = "ExecutorMessage";

    fn tag(&self) -> u32 {
        let tag = match self {
            ExecutorMessage::ConnectRequest(_) => ExecutorTag::ConnectRequest,
            ExecutorMessage::InfoReply(_) => ExecutorTag::InfoReply,
            ExecutorMessage::Executing(_) => ExecutorTag::Executing,
            ExecutorMessage::ExecResult(_) => ExecutorTag::ExecResult,
            ExecutorMessage::StateResult(_) => ExecutorTag::StateResult,
        };
        tag as u32
    }

    fn encode_body(&self) -> Result<Vec<u8>, FuzzlinkError> {
        match self {
            ExecutorMessage::ConnectRequest(m) => encode_value(m),
            ExecutorMessage::InfoReply(m) => encode_value(m),
            ExecutorMessage::Executing(m) => encode_value(m),
            ExecutorMessage::ExecResult(m) => encode_value(m),
            ExecutorMessage::StateResult(m) => encode_value(m),
        }
    }

    fn decode_body(tag: u32, body: &[u8]) -> Result<Self, FuzzlinkError> {
        Ok(match ExecutorTag::try_from(tag)? {
            ExecutorTag::ConnectRequest => ExecutorMessage::ConnectRequest(decode_value(body)?),
            ExecutorTag::InfoReply => ExecutorMessage::InfoReply(decode_value(body)?),
            ExecutorTag::Executing => ExecutorMessage::Executing(decode_value(body)?),
            ExecutorTag::ExecResult => ExecutorMessage::ExecResult(decode_value(body)?),
            ExecutorTag::StateResult => ExecutorMessage::StateResult(decode_value(body)?),
        })
    }
}

impl fmt::Display for HostMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostMessage::ConnectReply(_) => write!(f, "ConnectReply"),
            HostMessage::CoverFilter(m) => write!(f, "CoverFilter({} pcs)", m.pcs.len()),
            HostMessage::ExecRequest(m) => write!(f, "ExecRequest(id={})", m.id),
            HostMessage::SignalUpdate(m) => write!(f, "SignalUpdate({} new)", m.new_max.len()),
            HostMessage::CorpusTriaged => write!(f, "CorpusTriaged"),
            HostMessage::StateRequest => write!(f, "StateRequest"),
        }
    }
}

impl fmt::Display for ExecutorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorMessage::ConnectRequest(m) => write!(f, "ConnectRequest({})", m.name),
            ExecutorMessage::InfoReply(_) => write!(f, "InfoReply"),
            ExecutorMessage::Executing(m) => {
                write!(f, "Executing(id={}, proc={}, try={})", m.id, m.proc_id, m.attempt)
            }
            ExecutorMessage::ExecResult(m) => write!(f, "ExecResult(id={})", m.id),
            ExecutorMessage::StateResult(_) => write!(f, "StateResult"),
        }
    }
}

// ── Body encoding ────────────────────────────────────────────────

/// Fixed-width little-endian bincode, with trailing bytes rejected and
/// sequence lengths capped by the payload limit.
fn body_options() -> impl Options {
    bincode::options()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_PAYLOAD_SIZE as u64)
        .reject_trailing_bytes()
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, FuzzlinkError> {
    body_options()
        .serialize(value)
        .map_err(|e| FuzzlinkError::Encoding(e.to_string()))
}

fn decode_value<T: DeserializeOwned>(body: &[u8]) -> Result<T, FuzzlinkError> {
    body_options()
        .deserialize(body)
        .map_err(|e| FuzzlinkError::MalformedFrame(format!("bad body: {e}")))
}

fn expect_empty(body: &[u8]) -> Result<(), FuzzlinkError> {
    if body.is_empty() {
        Ok(())
    } else {
        Err(FuzzlinkError::MalformedFrame(format!(
            "unexpected {}-byte body on a bodiless message",
            body.len()
        )))
    }
}

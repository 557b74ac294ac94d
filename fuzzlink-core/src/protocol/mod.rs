//! Structured payloads carried by the two message families.
//!
//! Each sub-module covers one protocol phase. Payloads are serialized with
//! `serde` + `bincode` and wrapped in a [`Packet`] by the message layer.
//!
//! [`Packet`]: crate::packet::Packet

pub mod control;
pub mod exec;
pub mod handshake;
pub mod info;

pub use control::{SignalUpdate, StateResult};
pub use exec::{
    CallInfo, Comparison, ExecOpts, ExecRequest, ExecResult, ExecutingMessage, ProgInfo,
};
pub use handshake::{ConnectReply, ConnectRequest};
pub use info::{CoverFilter, FeatureInfo, FileInfo, GlobInfo, InfoReply};

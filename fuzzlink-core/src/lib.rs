//! # fuzzlink-core
//!
//! Wire protocol between a fuzzing host and the executors that run test
//! programs inside a kernel under test.
//!
//! This crate contains:
//! - **Framing**: `PacketHeader`, `Packet`, the frame codec and the two
//!   closed message families (`HostMessage`, `ExecutorMessage`)
//! - **Payloads**: handshake, feature/info exchange, execution and
//!   session-control types
//! - **Aggregation**: folding per-thread feedback into one `ProgInfo`
//! - **Network**: `Connection` for framed channels with background I/O
//! - **State**: session lifecycle, host-side execution tracking and
//!   executor-side worker slots
//! - **Task**: `TaskPool` for keyed async work
//! - **Error**: `FuzzlinkError`, the `thiserror`-based error type

pub mod aggregate;
pub mod codec;
pub mod error;
pub mod flags;
pub mod header;
pub mod message;
pub mod network;
pub mod packet;
pub mod protocol;
pub mod state;
pub mod task;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use aggregate::{ProgInfoBuilder, fold_extra};
pub use codec::{ExecutorCodec, FrameCodec, HostCodec, decode, encode};
pub use error::FuzzlinkError;
pub use flags::{CallFlag, ExecEnv, ExecFlag, Feature, RequestFlag};
pub use header::{Direction, HEADER_SIZE, PacketHeader};
pub use message::{ExecutorMessage, ExecutorTag, HostMessage, HostTag, Message};
pub use network::{
    Connection, ConnectionInfo, ConnectionSender, ExecutorConnection, HostConnection, SendPermit,
};
pub use packet::{MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE, Packet};
pub use protocol::*;
pub use state::{
    Assignment, Completed, ExecState, ExecutorSnapshot, ExecutorState, HostState, Lost,
    Session, SessionPhase,
};
pub use task::{TaskEvent, TaskPool};

//! # fuzzlink-host
//!
//! Accepts executor connections, runs the handshake and feature exchange
//! for each one, and drives program execution across all of them.
//!
//! - [`session`]: one executor from handshake to close, with its own
//!   outstanding-request table
//! - [`pool`]: many sessions multiplexed, plus broadcast of max signal and
//!   the corpus-triaged flag
//! - [`driver`]: replays a program directory over ready sessions
//! - [`service`]: the accept loop tying it together

pub mod config;
pub mod driver;
pub mod pool;
pub mod service;
pub mod session;

pub use config::HostConfig;
pub use pool::{HostPool, PoolEvent};
pub use service::HostService;
pub use session::{HostSession, SessionCommand, SessionEvent, SessionSettings};

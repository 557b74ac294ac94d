//! # fuzzlink-executor
//!
//! Connects to a host, reports which features work on this machine and
//! runs the programs it is sent in a fixed number of worker slots.
//!
//! - [`features`]: feature setup plus the file and glob report
//! - [`runner`]: the [`ProgramRunner`](runner::ProgramRunner) seam and a
//!   process-per-program implementation
//! - [`session`]: the protocol side of one session
//! - [`service`]: dial, establish, serve

pub mod config;
pub mod features;
pub mod runner;
pub mod service;
pub mod session;

pub use config::ExecutorConfig;
pub use features::{FeatureProbe, StaticProbe};
pub use runner::{CallReport, ProcessRunner, ProgramRunner, RunError, RunJob, RunOutput};
pub use service::ExecutorService;
pub use session::{ExecutorSession, ExecutorSettings};

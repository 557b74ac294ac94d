//! Connection handshake payloads.
//!
//! # Wire Protocol
//!
//! ```text
//! Executor ──[ConnectRequest]──► Host
//!   who am I, which build am I
//!
//! Host ──────[ConnectReply]────► Executor
//!   session configuration and the desired feature set
//! ```
//!
//! Exactly one of each per channel. Anything else arriving first is a
//! protocol violation.

use serde::{Deserialize, Serialize};

use crate::error::FuzzlinkError;
use crate::flags::Feature;

/// First message on every channel, sent by the executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ConnectRequest {
    /// Instance name, e.g. `vm-3`.
    pub name: String,
    /// Target architecture, e.g. `amd64`.
    pub arch: String,
    /// Revision of the executor build.
    pub git_revision: String,
    /// Revision of the syscall descriptions the executor was built with.
    pub syz_revision: String,
}

impl ConnectRequest {
    pub fn new(name: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arch: arch.into(),
            ..Default::default()
        }
    }

    pub fn with_revisions(mut self, git: impl Into<String>, syz: impl Into<String>) -> Self {
        self.git_revision = git.into();
        self.syz_revision = syz.into();
        self
    }

    /// Check that the executor was built for the same target as `host`.
    ///
    /// Empty revisions on either side are treated as "unknown" and match.
    pub fn check_compatible(&self, host: &ConnectRequest) -> Result<(), FuzzlinkError> {
        if self.arch != host.arch {
            return Err(FuzzlinkError::Incompatible(format!(
                "executor {} runs arch {}, host expects {}",
                self.name, self.arch, host.arch
            )));
        }
        for (what, ours, theirs) in [
            ("git revision", &host.git_revision, &self.git_revision),
            ("descriptions revision", &host.syz_revision, &self.syz_revision),
        ] {
            if !ours.is_empty() && !theirs.is_empty() && ours != theirs {
                return Err(FuzzlinkError::Incompatible(format!(
                    "executor {} has {what} {theirs}, host has {ours}",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Session configuration pushed by the host in answer to `ConnectRequest`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectReply {
    pub debug: bool,
    /// Collect raw coverage.
    pub cover: bool,
    /// Collect edge coverage only (cheaper, loses ordering).
    pub cover_edges: bool,
    /// Word size of the target kernel is 64 bits.
    pub kernel_64_bit: bool,
    /// Number of worker processes.
    pub procs: u32,
    /// Global timeout multiplier for slow or emulated targets.
    pub slowdown: u32,
    pub syscall_timeout_ms: u32,
    pub program_timeout_ms: u32,
    /// Stack frames that mark a known-benign leak report.
    pub leak_frames: Vec<String>,
    /// Stack frames that mark a known-benign data race report.
    pub race_frames: Vec<String>,
    /// Features the host wants set up.
    pub features: Feature,
    /// Files to read back from the executor environment.
    pub files: Vec<String>,
    /// Glob patterns to expand inside the executor environment.
    pub globs: Vec<String>,
}

impl Default for ConnectReply {
    fn default() -> Self {
        Self {
            debug: false,
            cover: true,
            cover_edges: true,
            kernel_64_bit: true,
            procs: 1,
            slowdown: 1,
            syscall_timeout_ms: 50,
            program_timeout_ms: 5_000,
            leak_frames: Vec::new(),
            race_frames: Vec::new(),
            features: Feature::empty(),
            files: Vec::new(),
            globs: Vec::new(),
        }
    }
}

impl ConnectReply {
    /// Program timeout adjusted by the slowdown multiplier.
    pub fn program_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(
            u64::from(self.program_timeout_ms) * u64::from(self.slowdown.max(1)),
        )
    }

    /// Per-call timeout adjusted by the slowdown multiplier.
    pub fn syscall_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(
            u64::from(self.syscall_timeout_ms) * u64::from(self.slowdown.max(1)),
        )
    }
}

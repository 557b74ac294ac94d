//! Program execution payloads.
//!
//! # Wire Protocol
//!
//! ```text
//! Host ──────[ExecRequest]────► Executor
//!   id, program bytes, options
//!
//! Executor ──[Executing]──────► Host      (once per attempt)
//!   id, proc_id, attempt, queueing latency
//!
//! Executor ──[ExecResult]─────► Host      (exactly once, unless the
//!   id, output, error, info                 channel dies first)
//! ```
//!
//! `Executing` is deliberately tiny: it has to leave the machine before
//! the program it announces gets a chance to take the kernel down.

use serde::{Deserialize, Serialize};

use crate::flags::{CallFlag, ExecEnv, ExecFlag, RequestFlag};

// ── Request ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct ExecOpts {
    pub env_flags: ExecEnv,
    pub exec_flags: ExecFlag,
    pub sandbox_arg: i64,
}

impl ExecOpts {
    /// Whether moving from `self` to `next` needs a fresh worker process.
    ///
    /// Only the environment flags and the sandbox argument configure
    /// process-global state; exec flags are applied per program.
    pub fn requires_restart(&self, next: &ExecOpts) -> bool {
        self.env_flags != next.env_flags || self.sandbox_arg != next.sandbox_arg
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ExecRequest {
    pub id: u64,
    /// Serialized program, or an executable when `IS_BINARY` is set.
    pub prog_data: Vec<u8>,
    pub exec_opts: ExecOpts,
    pub flags: RequestFlag,
    /// Calls whose signal is returned in full, bypassing max-signal
    /// suppression on the executor.
    pub all_signal: Vec<i32>,
}

impl ExecRequest {
    pub fn new(id: u64, prog_data: Vec<u8>) -> Self {
        Self {
            id,
            prog_data,
            ..Default::default()
        }
    }

    pub fn with_opts(mut self, opts: ExecOpts) -> Self {
        self.exec_opts = opts;
        self
    }

    pub fn with_flags(mut self, flags: RequestFlag) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_all_signal(mut self, calls: Vec<i32>) -> Self {
        self.all_signal = calls;
        self
    }

    pub fn is_binary(&self) -> bool {
        self.flags.contains(RequestFlag::IS_BINARY)
    }

    pub fn returns_output(&self) -> bool {
        self.flags.contains(RequestFlag::RETURN_OUTPUT)
    }

    pub fn returns_error(&self) -> bool {
        self.flags.contains(RequestFlag::RETURN_ERROR)
    }

    /// Whether full signal was requested for call `index`.
    pub fn wants_all_signal(&self, index: usize) -> bool {
        self.all_signal.iter().any(|&c| c >= 0 && c as usize == index)
    }
}

// ── Executing ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ExecutingMessage {
    pub id: u64,
    /// Identity of the worker process instance; changes on every relaunch.
    pub proc_id: u64,
    /// 0 for the first try, incremented on every retry after a crash.
    pub attempt: u32,
    /// Time the request spent queued before a worker picked it up.
    pub wait_duration_ns: u64,
}

// ── Result ────────────────────────────────────────────────────────

/// Operand pair observed at a comparison instruction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct Comparison {
    pub op1: u64,
    pub op2: u64,
}

impl Comparison {
    pub fn new(op1: u64, op2: u64) -> Self {
        Self { op1, op2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CallInfo {
    pub flags: CallFlag,
    /// errno-style result; 0 is success.
    pub error: i32,
    pub signal: Vec<u64>,
    /// Deduplicated iff the program ran with `ExecFlag::DEDUP_COVER`.
    pub cover: Vec<u64>,
    pub comps: Vec<Comparison>,
}

impl CallInfo {
    pub fn finished(error: i32) -> Self {
        Self {
            flags: CallFlag::EXECUTED | CallFlag::FINISHED,
            error,
            ..Default::default()
        }
    }

    pub fn with_cover(mut self, cover: Vec<u64>) -> Self {
        self.cover = cover;
        self
    }

    pub fn with_signal(mut self, signal: Vec<u64>) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_comps(mut self, comps: Vec<Comparison>) -> Self {
        self.comps = comps;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.signal.is_empty() && self.cover.is_empty() && self.comps.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProgInfo {
    /// One entry per program call, in program order.
    pub calls: Vec<CallInfo>,
    /// Unmerged background-thread feedback. Always empty once the
    /// aggregator has run; see `ProgInfo::merge_extra`.
    pub extra_raw: Vec<CallInfo>,
    /// Background-thread feedback merged into one entry.
    pub extra: Option<CallInfo>,
    pub elapsed_ns: u64,
    /// Programs this worker process ran before this one.
    pub freshness: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ExecResult {
    pub id: u64,
    pub proc_id: u64,
    /// Captured stdout/stderr when `RETURN_OUTPUT` was requested.
    pub output: Vec<u8>,
    /// Empty on success.
    pub error: String,
    pub info: Option<ProgInfo>,
    /// The executor refused the request without running it (busy, or a
    /// duplicate id). The program itself said nothing and may be sent
    /// again.
    pub rejected: bool,
}

impl ExecResult {
    pub fn failed(id: u64, proc_id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            proc_id,
            error: error.into(),
            ..Default::default()
        }
    }

    /// Refusal to run `id` at all; carries no process and no feedback.
    pub fn rejected(id: u64, reason: impl Into<String>) -> Self {
        Self {
            id,
            error: reason.into(),
            rejected: true,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_flags_alone_do_not_restart() {
        let a = ExecOpts {
            env_flags: ExecEnv::SANDBOX_NONE | ExecEnv::SIGNAL,
            exec_flags: ExecFlag::COLLECT_SIGNAL,
            sandbox_arg: 0,
        };
        let b = ExecOpts {
            exec_flags: ExecFlag::COLLECT_COVER | ExecFlag::DEDUP_COVER | ExecFlag::THREADED,
            ..a
        };
        assert!(!a.requires_restart(&b));
    }

    #[test]
    fn env_or_sandbox_changes_restart() {
        let a = ExecOpts::default();
        let env = ExecOpts {
            env_flags: ExecEnv::SANDBOX_SETUID,
            ..a
        };
        let sandbox = ExecOpts {
            sandbox_arg: 7,
            ..a
        };
        assert!(a.requires_restart(&env));
        assert!(a.requires_restart(&sandbox));
    }

    #[test]
    fn request_flag_accessors() {
        let req = ExecRequest::new(1, vec![0x7f])
            .with_flags(RequestFlag::IS_BINARY | RequestFlag::RETURN_ERROR)
            .with_all_signal(vec![2, -1]);
        assert!(req.is_binary());
        assert!(req.returns_error());
        assert!(!req.returns_output());
        assert!(req.wants_all_signal(2));
        assert!(!req.wants_all_signal(0));
    }

    #[test]
    fn failed_result() {
        let res = ExecResult::failed(9, 2, "worker died");
        assert!(!res.is_success());
        assert!(res.info.is_none());
        assert_eq!(res.proc_id, 2);
        assert!(!res.rejected);
    }

    #[test]
    fn rejected_result_is_not_a_program_failure() {
        let res = ExecResult::rejected(4, "all worker slots are busy");
        assert!(res.rejected);
        assert!(!res.is_success());
        assert_eq!((res.id, res.proc_id), (4, 0));
        assert!(res.info.is_none());
    }
}

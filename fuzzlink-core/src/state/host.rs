//! Host-side execution tracking.
//!
//! Every outstanding `ExecRequest` id maps to a small state machine:
//!
//! ```text
//!  Pending ──► Executing{proc, attempt} ──► Done   (Completed)
//!     │              │  ▲  (retry: attempt+1)
//!     │              └──┘
//!     └──────────────┴──────────────────► Lost   (channel closed / timed out)
//! ```
//!
//! Only the live states sit in the table. Reaching `Done` or `Lost`
//! removes the entry and hands it back as a [`Completed`] or [`Lost`]
//! record, so a second result for the same id is rejected.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::FuzzlinkError;
use crate::protocol::{ExecRequest, ExecResult, ExecutingMessage};

// ── ExecState ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    /// Sent, not yet acknowledged.
    Pending,
    /// The executor started running it.
    Executing { proc_id: u64, attempt: u32 },
}

/// One attempt to run a request, as reported by `Executing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub proc_id: u64,
    pub attempt: u32,
    pub wait: Duration,
    pub started_at: Instant,
}

// ── TrackedExec ───────────────────────────────────────────────────

/// An outstanding request.
#[derive(Debug)]
pub struct TrackedExec {
    pub request: ExecRequest,
    pub state: ExecState,
    /// Attempts in the order they were reported, one per `(id, attempt)`.
    pub attempts: Vec<Attempt>,
    pub sent_at: Instant,
    /// `None` means no timeout.
    pub deadline: Option<Duration>,
}

impl TrackedExec {
    pub fn is_expired(&self) -> bool {
        match self.deadline {
            Some(d) => self.sent_at.elapsed() > d,
            None => false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.sent_at.elapsed()
    }

    /// The most recent attempt, if the executor acknowledged the request.
    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }
}

/// A request that finished, with the request it answers.
#[derive(Debug)]
pub struct Completed {
    pub request: ExecRequest,
    pub result: ExecResult,
    pub attempts: Vec<Attempt>,
    pub latency: Duration,
}

/// A request that will never get a result.
#[derive(Debug)]
pub struct Lost {
    pub request: ExecRequest,
    /// State at the moment it was lost (`Pending` or `Executing`).
    pub last_state: ExecState,
    pub attempts: Vec<Attempt>,
}

// ── HostState ─────────────────────────────────────────────────────

/// Outstanding executions of one session. Owned exclusively by the host.
#[derive(Debug, Default)]
pub struct HostState {
    requests: HashMap<u64, TrackedExec>,
    default_timeout: Option<Duration>,
    next_id: u64,
}

impl HostState {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Timeouts ──────────────────────────────────────────────────

    pub fn set_default_timeout(&mut self, timeout: Duration) {
        self.default_timeout = Some(timeout);
    }

    pub fn clear_default_timeout(&mut self) {
        self.default_timeout = None;
    }

    // ── Ids ───────────────────────────────────────────────────────

    /// Next id that is not outstanding.
    pub fn allocate_id(&mut self) -> u64 {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if !self.requests.contains_key(&self.next_id) {
                return self.next_id;
            }
        }
    }

    // ── Tracking ──────────────────────────────────────────────────

    /// Track a request with the default timeout.
    pub fn track(&mut self, request: ExecRequest) -> Result<(), FuzzlinkError> {
        self.track_with_deadline(request, self.default_timeout)
    }

    /// Track a request with an explicit timeout.
    ///
    /// Fails if the id is still outstanding.
    pub fn track_with_deadline(
        &mut self,
        request: ExecRequest,
        deadline: Option<Duration>,
    ) -> Result<(), FuzzlinkError> {
        let id = request.id;
        if self.requests.contains_key(&id) {
            return Err(FuzzlinkError::DuplicateRequest(id));
        }
        self.requests.insert(
            id,
            TrackedExec {
                request,
                state: ExecState::Pending,
                attempts: Vec::new(),
                sent_at: Instant::now(),
                deadline,
            },
        );
        Ok(())
    }

    /// Record an `Executing` acknowledgement.
    ///
    /// Returns `Ok(true)` for a new `(id, attempt)`, `Ok(false)` for a
    /// repeat of one already seen, and `UnexpectedResult` for an id that
    /// is not outstanding.
    pub fn on_executing(&mut self, msg: &ExecutingMessage) -> Result<bool, FuzzlinkError> {
        let tracked = self
            .requests
            .get_mut(&msg.id)
            .ok_or(FuzzlinkError::UnexpectedResult(msg.id))?;
        if tracked.attempts.iter().any(|a| a.attempt == msg.attempt) {
            return Ok(false);
        }
        tracked.attempts.push(Attempt {
            proc_id: msg.proc_id,
            attempt: msg.attempt,
            wait: Duration::from_nanos(msg.wait_duration_ns),
            started_at: Instant::now(),
        });
        tracked.state = ExecState::Executing {
            proc_id: msg.proc_id,
            attempt: msg.attempt,
        };
        Ok(true)
    }

    /// Resolve a request with its result.
    ///
    /// A result for an id that is not outstanding (never sent, already
    /// answered, or already lost) is rejected.
    pub fn on_result(&mut self, result: ExecResult) -> Result<Completed, FuzzlinkError> {
        let tracked = self
            .requests
            .remove(&result.id)
            .ok_or(FuzzlinkError::UnexpectedResult(result.id))?;
        Ok(Completed {
            latency: tracked.elapsed(),
            request: tracked.request,
            result,
            attempts: tracked.attempts,
        })
    }

    // ── Queries ───────────────────────────────────────────────────

    pub fn pending_count(&self) -> usize {
        self.requests.len()
    }

    pub fn is_outstanding(&self, id: u64) -> bool {
        self.requests.contains_key(&id)
    }

    pub fn get(&self, id: u64) -> Option<&TrackedExec> {
        self.requests.get(&id)
    }

    pub fn state(&self, id: u64) -> Option<ExecState> {
        self.requests.get(&id).map(|t| t.state)
    }

    // ── Loss ──────────────────────────────────────────────────────

    /// Ids whose deadline has passed. Does not remove them.
    pub fn check_timeouts(&self) -> Vec<u64> {
        self.requests
            .iter()
            .filter(|(_, t)| t.is_expired())
            .map(|(&id, _)| id)
            .collect()
    }

    /// Remove every expired request and report it as lost.
    pub fn drain_expired(&mut self) -> Vec<Lost> {
        let expired = self.check_timeouts();
        expired
            .into_iter()
            .filter_map(|id| self.requests.remove(&id))
            .map(Self::into_lost)
            .collect()
    }

    /// The channel is gone: every outstanding request is lost.
    pub fn close(&mut self) -> Vec<Lost> {
        let mut lost: Vec<Lost> = self.requests.drain().map(|(_, t)| Self::into_lost(t)).collect();
        lost.sort_by_key(|l| l.request.id);
        lost
    }

    fn into_lost(tracked: TrackedExec) -> Lost {
        Lost {
            request: tracked.request,
            last_state: tracked.state,
            attempts: tracked.attempts,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────

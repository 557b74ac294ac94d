//! Executor-side worker slot tracking.
//!
//! The executor runs `procs` worker processes. Each slot holds at most one
//! program at a time and remembers the environment its process was
//! launched with: a request with different environment flags or sandbox
//! argument needs a fresh process, a request that only changes exec flags
//! does not.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::FuzzlinkError;
use crate::protocol::{ExecOpts, ExecRequest, ProgInfo};

// ── ProcSlot ──────────────────────────────────────────────────────

/// One worker process slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcSlot {
    pub index: usize,
    /// Identity of the current process instance; 0 before first launch.
    pub proc_id: u64,
    /// Options the current process was launched with.
    pub launched_with: Option<ExecOpts>,
    /// Programs run by the current process instance.
    pub freshness: u64,
    /// Execution id currently running in this slot.
    pub busy_with: Option<u64>,
    /// Attempt number of the program currently running.
    pub attempt: u32,
    pub restarts: u64,
}

impl ProcSlot {
    fn new(index: usize) -> Self {
        Self {
            index,
            proc_id: 0,
            launched_with: None,
            freshness: 0,
            busy_with: None,
            attempt: 0,
            restarts: 0,
        }
    }

    pub fn is_free(&self) -> bool {
        self.busy_with.is_none()
    }

    /// Whether the current process can run a program with `opts`.
    pub fn matches(&self, opts: &ExecOpts) -> bool {
        self.launched_with
            .as_ref()
            .is_some_and(|cur| !cur.requires_restart(opts))
    }
}

/// Where and how a program will run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub slot: usize,
    pub proc_id: u64,
    pub attempt: u32,
    /// Programs the process ran before this one.
    pub freshness: u64,
    /// A new process was launched for this assignment.
    pub restarted: bool,
}

/// Diagnostic view returned in `StateResult`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSnapshot {
    pub slots: Vec<ProcSlot>,
    pub executed: u64,
    pub corpus_triaged: bool,
    pub max_signal: usize,
}

// ── ExecutorState ─────────────────────────────────────────────────

#[derive(Debug)]
pub struct ExecutorState {
    slots: Vec<ProcSlot>,
    next_proc_id: u64,
    executed: u64,
    corpus_triaged: bool,
    /// Restart a process after this many programs once the corpus is
    /// triaged; 0 disables periodic restarts.
    restart_every: u64,
    max_signal: HashSet<u64>,
}

impl ExecutorState {
    pub fn new(procs: usize) -> Self {
        Self {
            slots: (0..procs.max(1)).map(ProcSlot::new).collect(),
            next_proc_id: 0,
            executed: 0,
            corpus_triaged: false,
            restart_every: 0,
            max_signal: HashSet::new(),
        }
    }

    pub fn with_restart_every(mut self, programs: u64) -> Self {
        self.restart_every = programs;
        self
    }

    pub fn slots(&self) -> &[ProcSlot] {
        &self.slots
    }

    pub fn free_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_free()).count()
    }

    pub fn executed(&self) -> u64 {
        self.executed
    }

    // ── Assignment ────────────────────────────────────────────────

    /// Pick a slot for `request`.
    ///
    /// Prefers the lowest free slot whose process already has the right
    /// environment; otherwise relaunches the lowest free slot. Requests
    /// are never queued: with every slot busy the request is rejected.
    pub fn assign(&mut self, request: &ExecRequest) -> Result<Assignment, FuzzlinkError> {
        let opts = &request.exec_opts;
        let slot = self
            .slots
            .iter()
            .find(|s| s.is_free() && s.matches(opts))
            .or_else(|| self.slots.iter().find(|s| s.is_free()))
            .map(|s| s.index)
            .ok_or(FuzzlinkError::ProtocolViolation(
                "all worker slots are busy",
            ))?;
        self.assign_to(slot, request)
    }

    /// Run `request` in a specific slot; fails with `SlotBusy` if the slot
    /// already has a program in flight.
    pub fn assign_to(
        &mut self,
        slot: usize,
        request: &ExecRequest,
    ) -> Result<Assignment, FuzzlinkError> {
        let needs_periodic_restart = self.needs_periodic_restart(slot);
        let s = self
            .slots
            .get(slot)
            .ok_or(FuzzlinkError::ProtocolViolation("no such worker slot"))?;
        if let Some(busy_with) = s.busy_with {
            return Err(FuzzlinkError::SlotBusy { slot, busy_with });
        }
        let restarted = !s.matches(&request.exec_opts) || needs_periodic_restart;
        if restarted {
            self.relaunch(slot, request.exec_opts);
        }

        let s = &mut self.slots[slot];
        s.busy_with = Some(request.id);
        s.attempt = 0;
        Ok(Assignment {
            slot,
            proc_id: s.proc_id,
            attempt: 0,
            freshness: s.freshness,
            restarted,
        })
    }

    fn needs_periodic_restart(&self, slot: usize) -> bool {
        self.corpus_triaged
            && self.restart_every > 0
            && self
                .slots
                .get(slot)
                .is_some_and(|s| s.freshness >= self.restart_every)
    }

    fn relaunch(&mut self, slot: usize, opts: ExecOpts) -> u64 {
        self.next_proc_id += 1;
        let s = &mut self.slots[slot];
        if s.launched_with.is_some() {
            s.restarts += 1;
        }
        s.proc_id = self.next_proc_id;
        s.launched_with = Some(opts);
        s.freshness = 0;
        self.next_proc_id
    }

    /// The worker in `slot` died while running `id`: launch a new process
    /// and retry with the next attempt number.
    pub fn retry(&mut self, slot: usize, id: u64) -> Result<Assignment, FuzzlinkError> {
        let s = self.busy_slot(slot, id)?;
        let opts = s.launched_with.unwrap_or_default();
        let attempt = s.attempt + 1;
        self.relaunch(slot, opts);
        let s = &mut self.slots[slot];
        s.attempt = attempt;
        Ok(Assignment {
            slot,
            proc_id: s.proc_id,
            attempt,
            freshness: s.freshness,
            restarted: true,
        })
    }

    /// `id` finished in `slot`; the slot is free again.
    pub fn complete(&mut self, slot: usize, id: u64) -> Result<(), FuzzlinkError> {
        self.busy_slot(slot, id)?;
        let s = &mut self.slots[slot];
        s.busy_with = None;
        s.attempt = 0;
        s.freshness += 1;
        self.executed += 1;
        Ok(())
    }

    /// `id` was abandoned in `slot` (e.g. the session is shutting down).
    /// The process is considered unusable and will be relaunched.
    pub fn abandon(&mut self, slot: usize, id: u64) -> Result<(), FuzzlinkError> {
        self.busy_slot(slot, id)?;
        let s = &mut self.slots[slot];
        s.busy_with = None;
        s.attempt = 0;
        s.launched_with = None;
        Ok(())
    }

    fn busy_slot(&self, slot: usize, id: u64) -> Result<&ProcSlot, FuzzlinkError> {
        match self.slots.get(slot) {
            Some(s) if s.busy_with == Some(id) => Ok(s),
            _ => Err(FuzzlinkError::ProtocolViolation(
                "slot is not running this execution",
            )),
        }
    }

    // ── Session control ───────────────────────────────────────────

    /// Raise the sticky triaged flag. Returns `true` the first time.
    pub fn mark_corpus_triaged(&mut self) -> bool {
        !std::mem::replace(&mut self.corpus_triaged, true)
    }

    pub fn corpus_triaged(&self) -> bool {
        self.corpus_triaged
    }

    /// Merge newly discovered maximum signal.
    pub fn update_max_signal(&mut self, new_max: &[u64]) {
        self.max_signal.extend(new_max.iter().copied());
    }

    pub fn max_signal_len(&self) -> usize {
        self.max_signal.len()
    }

    /// Strip signal the host already knows about, except for calls listed
    /// in the request's `all_signal`.
    pub fn filter_signal(&self, request: &ExecRequest, info: &mut ProgInfo) {
        if self.max_signal.is_empty() {
            return;
        }
        for (index, call) in info.calls.iter_mut().enumerate() {
            if !request.wants_all_signal(index) {
                call.signal.retain(|s| !self.max_signal.contains(s));
            }
        }
        if let Some(extra) = info.extra.as_mut() {
            extra.signal.retain(|s| !self.max_signal.contains(s));
        }
    }

    pub fn snapshot(&self) -> ExecutorSnapshot {
        ExecutorSnapshot {
            slots: self.slots.clone(),
            executed: self.executed,
            corpus_triaged: self.corpus_triaged,
            max_signal: self.max_signal.len(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{ExecEnv, ExecFlag};
    use crate::protocol::CallInfo;

    fn request(id: u64, env: ExecEnv, exec: ExecFlag, sandbox_arg: i64) -> ExecRequest {
        ExecRequest::new(id, Vec::new()).with_opts(ExecOpts {
            env_flags: env,
            exec_flags: exec,
            sandbox_arg,
        })
    }

    #[test]
    fn exec_flag_change_keeps_process() {
        let mut state = ExecutorState::new(2);
        let a = state
            .assign(&request(1, ExecEnv::SANDBOX_NONE, ExecFlag::COLLECT_SIGNAL, 0))
            .unwrap();
        assert!(a.restarted);
        state.complete(a.slot, 1).unwrap();

        let b = state
            .assign(&request(
                2,
                ExecEnv::SANDBOX_NONE,
                ExecFlag::COLLECT_COVER | ExecFlag::DEDUP_COVER,
                0,
            ))
            .unwrap();
        assert!(!b.restarted);
        assert_eq!(b.proc_id, a.proc_id);
        assert_eq!(b.freshness, 1);
    }

    #[test]
    fn env_change_relaunches() {
        let mut state = ExecutorState::new(1);
        let a = state
            .assign(&request(1, ExecEnv::SANDBOX_NONE, ExecFlag::empty(), 0))
            .unwrap();
        state.complete(a.slot, 1).unwrap();

        let b = state
            .assign(&request(2, ExecEnv::SANDBOX_SETUID, ExecFlag::empty(), 0))
            .unwrap();
        assert!(b.restarted);
        assert_ne!(b.proc_id, a.proc_id);
        assert_eq!(b.freshness, 0);
        state.complete(b.slot, 2).unwrap();

        let c = state
            .assign(&request(3, ExecEnv::SANDBOX_SETUID, ExecFlag::empty(), 9))
            .unwrap();
        assert!(c.restarted);
        assert_ne!(c.proc_id, b.proc_id);
        assert_eq!(state.slots()[0].restarts, 2);
    }

    #[test]
    fn prefers_matching_free_slot() {
        let mut state = ExecutorState::new(2);
        let env_a = request(1, ExecEnv::SANDBOX_NONE, ExecFlag::empty(), 0);
        let env_b = request(2, ExecEnv::SANDBOX_SETUID, ExecFlag::empty(), 0);
        let a = state.assign(&env_a).unwrap();
        let b = state.assign(&env_b).unwrap();
        assert_eq!((a.slot, b.slot), (0, 1));
        state.complete(0, 1).unwrap();
        state.complete(1, 2).unwrap();

        let again = state
            .assign(&request(3, ExecEnv::SANDBOX_SETUID, ExecFlag::empty(), 0))
            .unwrap();
        assert_eq!(again.slot, 1);
        assert!(!again.restarted);
    }

    #[test]
    fn busy_slot_is_rejected_not_queued() {
        let mut state = ExecutorState::new(1);
        state.assign(&request(1, ExecEnv::empty(), ExecFlag::empty(), 0)).unwrap();
        assert!(matches!(
            state.assign_to(0, &request(2, ExecEnv::empty(), ExecFlag::empty(), 0)),
            Err(FuzzlinkError::SlotBusy {
                slot: 0,
                busy_with: 1
            })
        ));
        assert!(state
            .assign(&request(3, ExecEnv::empty(), ExecFlag::empty(), 0))
            .is_err());
        assert_eq!(state.free_slots(), 0);
    }

    #[test]
    fn retry_bumps_attempt_and_identity() {
        let mut state = ExecutorState::new(1);
        let a = state
            .assign(&request(1, ExecEnv::SANDBOX_NONE, ExecFlag::empty(), 0))
            .unwrap();
        let r = state.retry(a.slot, 1).unwrap();
        assert_eq!(r.attempt, 1);
        assert_ne!(r.proc_id, a.proc_id);
        assert!(state.retry(a.slot, 99).is_err());

        state.complete(a.slot, 1).unwrap();
        assert_eq!(state.executed(), 1);
        // Environment survives the crash relaunch.
        let b = state
            .assign(&request(2, ExecEnv::SANDBOX_NONE, ExecFlag::empty(), 0))
            .unwrap();
        assert!(!b.restarted);
    }

    #[test]
    fn periodic_restart_only_after_triage() {
        let mut state = ExecutorState::new(1).with_restart_every(2);
        let req = |id| request(id, ExecEnv::empty(), ExecFlag::empty(), 0);
        let first = state.assign(&req(1)).unwrap();
        state.complete(0, 1).unwrap();
        state.assign(&req(2)).unwrap();
        state.complete(0, 2).unwrap();

        let before = state.assign(&req(3)).unwrap();
        assert_eq!(before.proc_id, first.proc_id);
        state.complete(0, 3).unwrap();

        assert!(state.mark_corpus_triaged());
        assert!(!state.mark_corpus_triaged());
        let after = state.assign(&req(4)).unwrap();
        assert!(after.restarted);
        assert_ne!(after.proc_id, first.proc_id);
    }

    #[test]
    fn signal_filter_respects_all_signal() {
        let mut state = ExecutorState::new(1);
        state.update_max_signal(&[1, 2]);
        let req = ExecRequest::new(1, Vec::new()).with_all_signal(vec![1]);
        let mut info = ProgInfo {
            calls: vec![
                CallInfo::default().with_signal(vec![1, 2, 3]),
                CallInfo::default().with_signal(vec![1, 2, 3]),
            ],
            extra: Some(CallInfo::default().with_signal(vec![2, 4])),
            ..Default::default()
        };
        state.filter_signal(&req, &mut info);
        assert_eq!(info.calls[0].signal, vec![3]);
        assert_eq!(info.calls[1].signal, vec![1, 2, 3]);
        assert_eq!(info.extra.unwrap().signal, vec![4]);
    }

    #[test]
    fn snapshot_serializes() {
        let mut state = ExecutorState::new(2);
        state.update_max_signal(&[5]);
        let snap = state.snapshot();
        assert_eq!(snap.slots.len(), 2);
        assert_eq!(snap.max_signal, 1);
        let json = serde_json::to_string(&snap).unwrap();
        let back: ExecutorSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
    }
}

//! Replays a directory of programs across all ready sessions.
//!
//! The driver keeps every session saturated with `procs` requests, feeds
//! newly seen signal back for broadcasting, and declares the corpus
//! triaged once each program has actually run at least once. A request
//! the executor refused, or one that never got an answer, goes back to
//! the front of the queue and does not count.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::path::Path;

use tracing::{debug, info, warn};

use fuzzlink_core::{
    Completed, ExecOpts, ExecRequest, ExecResult, Feature, Lost, RequestFlag, Session,
};

/// Counters reported when the host shuts down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub completed: u64,
    pub failed: u64,
    pub lost: u64,
    /// Requests the executor refused without running them.
    pub rejected: u64,
}

#[derive(Debug, Clone, Copy)]
struct SessionSlot {
    opts: ExecOpts,
    capacity: usize,
    in_flight: usize,
}

/// What to do after a result came in.
#[derive(Debug, Default)]
pub struct Followup {
    /// All signal in the result, for the pool to merge and broadcast.
    pub signal: Vec<u64>,
    /// More work for the same session.
    pub next: Vec<ExecRequest>,
    /// The first full pass over the corpus just finished.
    pub triaged: bool,
}

#[derive(Debug)]
pub struct CorpusDriver {
    programs: Vec<Vec<u8>>,
    sandbox: Feature,
    flags: RequestFlag,
    sessions: HashMap<u64, SessionSlot>,
    /// Session and program index of every request in flight.
    in_flight: HashMap<u64, (u64, usize)>,
    /// Programs to run before continuing round-robin.
    retry: VecDeque<usize>,
    cursor: usize,
    next_id: u64,
    ran_once: HashSet<usize>,
    triaged: bool,
    stats: DriverStats,
}

impl CorpusDriver {
    pub fn new(programs: Vec<Vec<u8>>, sandbox: Feature, flags: RequestFlag) -> Self {
        Self {
            programs,
            sandbox,
            flags,
            sessions: HashMap::new(),
            in_flight: HashMap::new(),
            retry: VecDeque::new(),
            cursor: 0,
            next_id: 0,
            ran_once: HashSet::new(),
            triaged: false,
            stats: DriverStats::default(),
        }
    }

    /// Read every regular file in `dir`, in name order.
    pub fn load_dir(dir: &Path) -> io::Result<Vec<Vec<u8>>> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        paths.sort();
        paths.iter().map(std::fs::read).collect()
    }

    pub fn stats(&self) -> &DriverStats {
        &self.stats
    }

    pub fn is_triaged(&self) -> bool {
        self.triaged
    }

    /// An empty corpus is triaged from the start.
    pub fn triaged_at_start(&self) -> bool {
        self.programs.is_empty()
    }

    /// A session became ready; returns its initial batch.
    pub fn on_ready(&mut self, id: u64, session: &Session) -> Vec<ExecRequest> {
        let opts = match session.exec_opts(self.sandbox) {
            Ok(opts) => opts,
            Err(e) => {
                warn!(session = id, error = %e, "not scheduling programs on session");
                return Vec::new();
            }
        };
        let capacity = session.config().procs.max(1) as usize;
        self.sessions.insert(
            id,
            SessionSlot {
                opts,
                capacity,
                in_flight: 0,
            },
        );
        self.fill(id)
    }

    pub fn on_completed(&mut self, session: u64, done: &Completed) -> Followup {
        let mut followup = Followup::default();
        if done.result.rejected {
            // Busy executor: the program never ran. Refilling right away
            // would only bounce off the same busy slot, so the next
            // `refill` picks it up.
            self.stats.rejected += 1;
            debug!(session, id = done.request.id, reason = %done.result.error, "request refused");
            if let Some(index) = self.finish(session, done.request.id) {
                self.retry.push_front(index);
            }
            return followup;
        }
        if let Some(index) = self.finish(session, done.request.id) {
            if done.result.is_success() {
                self.stats.completed += 1;
                self.ran_once.insert(index);
            } else {
                self.stats.failed += 1;
                debug!(session, id = done.request.id, error = %done.result.error, "program failed");
                // A program that fails deterministically still counts as
                // triaged.
                self.ran_once.insert(index);
            }
        }
        followup.signal = collect_signal(&done.result);
        if !self.triaged && !self.programs.is_empty() && self.ran_once.len() == self.programs.len() {
            self.triaged = true;
            followup.triaged = true;
            info!(programs = self.programs.len(), "first corpus pass finished");
        }
        followup.next = self.fill(session);
        followup
    }

    /// A request will never complete; its program goes to the front of
    /// the queue. Returns replacement work if the session is still usable.
    pub fn on_lost(&mut self, session: u64, lost: &Lost) -> Vec<ExecRequest> {
        self.stats.lost += 1;
        if let Some(index) = self.finish(session, lost.request.id) {
            self.retry.push_front(index);
        }
        self.fill(session)
    }

    /// A session is gone. Anything it still held goes back in the queue.
    pub fn on_closed(&mut self, session: u64) {
        self.sessions.remove(&session);
        let mut orphaned: Vec<(u64, usize)> = self
            .in_flight
            .iter()
            .filter(|(_, (s, _))| *s == session)
            .map(|(&id, &(_, index))| (id, index))
            .collect();
        orphaned.sort_unstable();
        for (id, index) in orphaned {
            self.in_flight.remove(&id);
            self.retry.push_back(index);
        }
    }

    /// Top up every session with spare capacity, in session order.
    pub fn refill(&mut self) -> Vec<(u64, Vec<ExecRequest>)> {
        let mut ids: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, slot)| slot.in_flight < slot.capacity)
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids.into_iter()
            .map(|id| (id, self.fill(id)))
            .filter(|(_, batch)| !batch.is_empty())
            .collect()
    }

    /// Stop handing out work; results and losses are still counted.
    pub fn stop_scheduling(&mut self) {
        self.sessions.clear();
    }

    /// Give back a request that could not be submitted.
    pub fn unsubmitted(&mut self, session: u64, id: u64) {
        if let Some(index) = self.finish(session, id) {
            self.retry.push_front(index);
        }
    }

    fn finish(&mut self, session: u64, id: u64) -> Option<usize> {
        let (owner, index) = self.in_flight.remove(&id)?;
        debug_assert_eq!(owner, session);
        if let Some(slot) = self.sessions.get_mut(&owner) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
        Some(index)
    }

    fn fill(&mut self, session: u64) -> Vec<ExecRequest> {
        let mut batch = Vec::new();
        if self.programs.is_empty() {
            return batch;
        }
        let Some(slot) = self.sessions.get(&session).copied() else {
            return batch;
        };
        for _ in slot.in_flight..slot.capacity {
            let index = self.retry.pop_front().unwrap_or_else(|| {
                let i = self.cursor;
                self.cursor = (self.cursor + 1) % self.programs.len();
                i
            });
            self.next_id += 1;
            let request = ExecRequest::new(self.next_id, self.programs[index].clone())
                .with_opts(slot.opts)
                .with_flags(self.flags);
            self.in_flight.insert(request.id, (session, index));
            batch.push(request);
        }
        if let Some(s) = self.sessions.get_mut(&session) {
            s.in_flight += batch.len();
        }
        batch
    }
}

fn collect_signal(result: &ExecResult) -> Vec<u64> {
    let Some(info) = &result.info else {
        return Vec::new();
    };
    info.calls
        .iter()
        .chain(info.extra.iter())
        .flat_map(|c| c.signal.iter().copied())
        .collect()
}

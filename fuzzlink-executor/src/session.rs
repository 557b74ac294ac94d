//! The executor's side of one session.
//!
//! ```text
//!  connect ──► ConnectRequest ──► ConnectReply ──► feature setup
//!                                                      │
//!              CoverFilter (with coverage) ◄── InfoReply
//!                   │
//!                   ▼
//!   ExecRequest ──► assign slot ──► Executing ──► run ──► ExecResult
//!                        ▲                          │
//!                        └──── worker crash: retry ─┘
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use fuzzlink_core::{
    Assignment, ConnectRequest, ExecRequest, ExecResult, ExecutingMessage, ExecutorConnection,
    ExecutorMessage, ExecutorState, Feature, FuzzlinkError, HostMessage, ProgInfo,
    ProgInfoBuilder, Session, SessionPhase, StateResult, TaskEvent, TaskPool,
};

use crate::config::ExecutorConfig;
use crate::features::{FeatureProbe, collect_info};
use crate::runner::{ProgramRunner, RunError, RunJob, RunOutput};

/// Parameters for one session, usually taken from [`ExecutorConfig`].
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub hello: ConnectRequest,
    /// Bound on each setup reply from the host.
    pub handshake_timeout: Duration,
    /// Runs per program before a worker crash is reported.
    pub max_attempts: u32,
    pub restart_every: u64,
}

impl ExecutorSettings {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            hello: config.hello(),
            handshake_timeout: config.handshake_timeout(),
            max_attempts: config.runner.max_attempts.max(1),
            restart_every: config.runner.restart_every,
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}

#[derive(Debug)]
struct InFlight {
    request: ExecRequest,
    assignment: Assignment,
}

pub struct ExecutorSession {
    conn: ExecutorConnection,
    phase: SessionPhase,
    session: Session,
    state: ExecutorState,
    cover_filter: HashSet<u64>,
    runner: Arc<dyn ProgramRunner>,
    runs: TaskPool<Result<RunOutput, RunError>>,
    in_flight: HashMap<u64, InFlight>,
    max_attempts: u32,
}

impl ExecutorSession {
    /// Handshake with the host and report feature setup.
    pub async fn establish(
        mut conn: ExecutorConnection,
        settings: &ExecutorSettings,
        probe: &dyn FeatureProbe,
        runner: Arc<dyn ProgramRunner>,
    ) -> Result<Self, FuzzlinkError> {
        let mut phase = SessionPhase::default();
        phase.begin_handshake()?;
        conn.send(ExecutorMessage::ConnectRequest(settings.hello.clone()))
            .await?;

        let reply = match tokio::time::timeout(settings.handshake_timeout, conn.recv()).await {
            Err(_) => return Err(FuzzlinkError::HandshakeTimeout(settings.handshake_timeout)),
            Ok(msg) => match msg? {
                HostMessage::ConnectReply(reply) => reply,
                _ => {
                    return Err(FuzzlinkError::ProtocolViolation(
                        "first host message must be ConnectReply",
                    ));
                }
            },
        };
        phase.complete_handshake()?;
        info!(
            procs = reply.procs,
            features = %reply.features.names(),
            "connected to host"
        );

        let report = collect_info(probe, &reply).await;
        conn.send_flushed(ExecutorMessage::InfoReply(report.clone()))
            .await?;
        let procs = reply.procs as usize;
        let mut session = Session::new(settings.hello.clone(), reply);
        session.apply_info(&report)?;

        let mut cover_filter = HashSet::new();
        if session.is_available(Feature::COVERAGE) {
            match tokio::time::timeout(settings.handshake_timeout, conn.recv()).await {
                Err(_) => return Err(FuzzlinkError::Timeout(settings.handshake_timeout)),
                Ok(msg) => match msg? {
                    HostMessage::CoverFilter(filter) => cover_filter.extend(filter.pcs),
                    _ => {
                        return Err(FuzzlinkError::ProtocolViolation(
                            "expected CoverFilter after InfoReply",
                        ));
                    }
                },
            }
        }
        phase.complete_setup()?;
        info!(
            available = %session.available_features().names(),
            cover_filter = cover_filter.len(),
            "setup complete"
        );

        Ok(Self {
            conn,
            phase,
            session,
            state: ExecutorState::new(procs).with_restart_every(settings.restart_every),
            cover_filter,
            runner,
            runs: TaskPool::new(),
            in_flight: HashMap::new(),
            max_attempts: settings.max_attempts.max(1),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> &ExecutorState {
        &self.state
    }

    pub fn cover_filter_len(&self) -> usize {
        self.cover_filter.len()
    }

    /// Serve requests until the host goes away. Returns the number of
    /// programs executed.
    ///
    /// A program failure without `ReturnError` ends the session with
    /// `ExecutionFailed`.
    pub async fn run(mut self) -> Result<u64, FuzzlinkError> {
        let outcome = loop {
            tokio::select! {
                msg = self.conn.recv() => match msg {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg).await {
                            break Err(e);
                        }
                    }
                    Err(FuzzlinkError::ChannelClosed) => break Ok(()),
                    Err(e) => break Err(e),
                },
                Some(event) = self.runs.recv() => {
                    if let Err(e) = self.handle_run(event).await {
                        break Err(e);
                    }
                }
            }
        };

        self.phase.close();
        self.runs.abort_all();
        for (id, flight) in self.in_flight.drain() {
            let _ = self.state.abandon(flight.assignment.slot, id);
        }
        let executed = self.state.executed();
        match &outcome {
            Ok(()) => info!(executed, "host closed the session"),
            Err(e) => warn!(executed, error = %e, "session failed"),
        }
        self.conn.shutdown().await;
        outcome.map(|()| executed)
    }

    async fn handle_message(&mut self, msg: HostMessage) -> Result<(), FuzzlinkError> {
        match msg {
            HostMessage::ExecRequest(request) => {
                self.phase.ensure_ready()?;
                self.start(request).await?;
            }
            HostMessage::SignalUpdate(update) => {
                self.state.update_max_signal(&update.new_max);
                debug!(
                    new = update.new_max.len(),
                    total = self.state.max_signal_len(),
                    "max signal updated"
                );
            }
            HostMessage::CorpusTriaged => {
                if self.state.mark_corpus_triaged() {
                    info!("corpus triaged; leak checks and periodic restarts enabled");
                }
            }
            HostMessage::StateRequest => {
                let state = StateResult::from_json(&self.state.snapshot()).unwrap_or_else(|e| {
                    warn!(error = %e, "state snapshot failed");
                    StateResult::default()
                });
                self.conn.send(ExecutorMessage::StateResult(state)).await?;
            }
            HostMessage::ConnectReply(_) | HostMessage::CoverFilter(_) => {
                return Err(FuzzlinkError::ProtocolViolation(
                    "setup message after the session became ready",
                ));
            }
        }
        Ok(())
    }

    async fn start(&mut self, request: ExecRequest) -> Result<(), FuzzlinkError> {
        let received = Instant::now();
        let assigned = if self.in_flight.contains_key(&request.id) {
            Err(FuzzlinkError::DuplicateRequest(request.id))
        } else {
            self.state.assign(&request)
        };
        match assigned {
            Ok(assignment) => self.launch(request, assignment, received).await,
            Err(e) => {
                // Never queued: the host hears about it right away.
                warn!(id = request.id, error = %e, "rejecting request");
                self.conn
                    .send(ExecutorMessage::ExecResult(ExecResult::rejected(
                        request.id,
                        e.to_string(),
                    )))
                    .await
            }
        }
    }

    async fn launch(
        &mut self,
        request: ExecRequest,
        assignment: Assignment,
        received: Instant,
    ) -> Result<(), FuzzlinkError> {
        let id = request.id;
        // Flushed before the run starts so the host learns which process
        // ran the program even if the worker takes the machine down.
        self.conn
            .send_flushed(ExecutorMessage::Executing(ExecutingMessage {
                id,
                proc_id: assignment.proc_id,
                attempt: assignment.attempt,
                wait_duration_ns: nanos(received.elapsed()),
            }))
            .await?;
        if assignment.restarted {
            debug!(slot = assignment.slot, proc = assignment.proc_id, "worker relaunched");
        }

        let job = RunJob {
            slot: assignment.slot,
            proc_id: assignment.proc_id,
            attempt: assignment.attempt,
            request: request.clone(),
            leak_check: self.state.corpus_triaged(),
        };
        let runner = Arc::clone(&self.runner);
        let limit = self.session.program_timeout();
        self.runs.spawn(id, async move {
            match tokio::time::timeout(limit, runner.run(job)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RunError::Timeout(limit)),
            }
        });
        self.in_flight.insert(
            id,
            InFlight {
                request,
                assignment,
            },
        );
        Ok(())
    }

    async fn handle_run(
        &mut self,
        event: TaskEvent<Result<RunOutput, RunError>>,
    ) -> Result<(), FuzzlinkError> {
        let (id, outcome) = match event {
            TaskEvent::Finished(id, outcome) => (id, outcome),
            TaskEvent::Panicked(id, msg) => (id, Err(RunError::Crashed(format!("runner panicked: {msg}")))),
        };
        let Some(InFlight {
            request,
            assignment,
        }) = self.in_flight.remove(&id)
        else {
            return Ok(());
        };
        let slot = assignment.slot;

        match outcome {
            Ok(output) => {
                self.state.complete(slot, id)?;
                let result = self.build_result(&request, &assignment, output);
                debug!(id, slot, proc = assignment.proc_id, "program finished");
                self.conn.send(ExecutorMessage::ExecResult(result)).await?;
            }
            Err(e) if e.is_retryable() && assignment.attempt + 1 < self.max_attempts => {
                warn!(id, slot, attempt = assignment.attempt, error = %e, "retrying in a new worker");
                let next = self.state.retry(slot, id)?;
                // The wait reported for a retry starts at the relaunch, not
                // at the original request.
                self.launch(request, next, Instant::now()).await?;
            }
            Err(e) => {
                if e.poisons_worker() {
                    self.state.abandon(slot, id)?;
                } else {
                    self.state.complete(slot, id)?;
                }
                if !request.returns_error() {
                    return Err(FuzzlinkError::ExecutionFailed {
                        id,
                        reason: e.to_string(),
                    });
                }
                debug!(id, slot, error = %e, "reporting program failure");
                self.conn
                    .send(ExecutorMessage::ExecResult(ExecResult::failed(
                        id,
                        assignment.proc_id,
                        e.to_string(),
                    )))
                    .await?;
            }
        }
        Ok(())
    }

    fn build_result(
        &self,
        request: &ExecRequest,
        assignment: &Assignment,
        output: RunOutput,
    ) -> ExecResult {
        let elapsed_ns = nanos(output.elapsed);
        let mut builder = ProgInfoBuilder::new(output.ncalls, request.exec_opts.exec_flags);
        for report in output.reports {
            match report.call {
                Some(index) => builder.record_call(index, report.info),
                None => builder.record_extra(report.info),
            }
        }
        let mut info = builder.finish(elapsed_ns, assignment.freshness);
        self.state.filter_signal(request, &mut info);
        self.apply_cover_filter(&mut info);

        ExecResult {
            id: request.id,
            proc_id: assignment.proc_id,
            output: if request.returns_output() {
                output.output
            } else {
                Vec::new()
            },
            error: String::new(),
            info: Some(info),
            rejected: false,
        }
    }

    fn apply_cover_filter(&self, info: &mut ProgInfo) {
        if self.cover_filter.is_empty() {
            return;
        }
        for call in info.calls.iter_mut().chain(info.extra.iter_mut()) {
            call.cover.retain(|pc| self.cover_filter.contains(pc));
        }
    }
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

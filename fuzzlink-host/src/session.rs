//! One executor session, from handshake to close.
//!
//! ```text
//!  accept ──► ConnectRequest ──► ConnectReply ──► InfoReply ──► CoverFilter
//!                                                                  │
//!                 ┌────────────── run loop ◄──────────────────────┘
//!                 │  Executing / ExecResult / StateResult  (network)
//!                 │  Submit / Control / Close               (pool)
//!                 │  outbox ──► writer queue                (network)
//!                 │  expiry sweep                           (timer)
//!                 ▼
//!               close: every outstanding id is reported Lost,
//!                      every submit still queued is Rejected
//! ```
//!
//! Outgoing messages wait in a local outbox until the writer queue has
//! room, so an executor that stops reading never stalls the loop: its
//! results and expiry sweep keep going until the outbox limit closes it.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use fuzzlink_core::{
    Completed, ConnectReply, ConnectRequest, CoverFilter, ExecRequest, ExecutingMessage,
    ExecutorMessage, Feature, FuzzlinkError, HostConnection, HostMessage, HostState, Lost,
    Session, SessionPhase, StateResult,
};

/// Messages a session may hold back for a slow executor before giving up
/// on it.
pub const OUTBOX_LIMIT: usize = 4_096;

/// Bound on flushing the last messages to a closing executor.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Parameters shared by every session of one host.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// This host's own build; executors must match it.
    pub host_build: ConnectRequest,
    pub reply: ConnectReply,
    pub cover_filter: Vec<u64>,
    pub handshake_timeout: Duration,
    pub info_timeout: Duration,
    pub result_grace: Duration,
    /// Attempts an executor may spend on one program before it answers.
    pub executor_attempts: u32,
    pub sweep_interval: Duration,
}

impl SessionSettings {
    /// How long a request may stay unanswered before it counts as lost.
    ///
    /// Covers every attempt the executor may make, so a program still being
    /// retried is never given up on and sent again to a busy executor.
    pub fn result_deadline(&self, program_timeout: Duration) -> Duration {
        program_timeout * self.executor_attempts.max(1) + self.result_grace
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            host_build: ConnectRequest::new("fuzzlink-host", "amd64"),
            reply: ConnectReply::default(),
            cover_filter: Vec::new(),
            handshake_timeout: Duration::from_secs(60),
            info_timeout: Duration::from_secs(300),
            result_grace: Duration::from_secs(10),
            executor_attempts: 3,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Requests from the pool to a session task.
#[derive(Debug)]
pub enum SessionCommand {
    /// Track and send a request. A request that cannot be tracked comes
    /// back as `SessionEvent::Rejected`.
    Submit(ExecRequest),
    /// Forward a control message as-is.
    Control(HostMessage),
    Close,
}

/// What a session reports back to the pool.
#[derive(Debug)]
pub enum SessionEvent {
    /// Setup finished; programs may be submitted.
    Ready(Session),
    Executing(ExecutingMessage),
    Completed(Completed),
    Lost(Lost),
    /// A submitted request was never sent.
    Rejected {
        request: ExecRequest,
        reason: String,
    },
    State(StateResult),
    /// Always the last event. `None` for an orderly close.
    Closed(Option<String>),
}

pub struct HostSession {
    id: u64,
    conn: HostConnection,
    phase: SessionPhase,
    session: Session,
    table: HostState,
    outbox: VecDeque<HostMessage>,
    sweep_interval: Duration,
}

impl HostSession {
    /// Run the handshake and info exchange on a fresh connection.
    pub async fn establish(
        id: u64,
        mut conn: HostConnection,
        settings: &SessionSettings,
    ) -> Result<Self, FuzzlinkError> {
        let mut phase = SessionPhase::default();
        phase.begin_handshake()?;

        let hello = match tokio::time::timeout(settings.handshake_timeout, conn.recv()).await {
            Err(_) => return Err(FuzzlinkError::HandshakeTimeout(settings.handshake_timeout)),
            Ok(msg) => match msg? {
                ExecutorMessage::ConnectRequest(req) => req,
                _ => {
                    return Err(FuzzlinkError::ProtocolViolation(
                        "first message must be ConnectRequest",
                    ));
                }
            },
        };
        info!(
            session = id,
            executor = %hello.name,
            arch = %hello.arch,
            peer = ?conn.peer_addr(),
            "executor connected"
        );
        hello.check_compatible(&settings.host_build)?;
        conn.send(HostMessage::ConnectReply(settings.reply.clone()))
            .await?;
        phase.complete_handshake()?;

        let mut session = Session::new(hello, settings.reply.clone());
        let info = match tokio::time::timeout(settings.info_timeout, conn.recv()).await {
            Err(_) => return Err(FuzzlinkError::Timeout(settings.info_timeout)),
            Ok(msg) => match msg? {
                ExecutorMessage::InfoReply(info) => info,
                _ => {
                    return Err(FuzzlinkError::ProtocolViolation(
                        "expected InfoReply after the handshake",
                    ));
                }
            },
        };
        session.apply_info(&info)?;
        for (feature, reason) in session.unavailable_features() {
            warn!(session = id, feature = %feature.names(), %reason, "feature unavailable");
        }

        if session.is_available(Feature::COVERAGE) {
            conn.send(HostMessage::CoverFilter(CoverFilter {
                pcs: settings.cover_filter.clone(),
            }))
            .await?;
        }
        phase.complete_setup()?;

        let mut table = HostState::new();
        table.set_default_timeout(settings.result_deadline(session.program_timeout()));
        info!(
            session = id,
            features = %session.available_features().names(),
            "session ready"
        );

        Ok(Self {
            id,
            conn,
            phase,
            session,
            table,
            outbox: VecDeque::new(),
            sweep_interval: settings.sweep_interval,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    /// Serve the session until the channel dies or the pool closes it.
    ///
    /// Emits `Lost` for every request still outstanding at the end,
    /// `Rejected` for every submit not yet taken from `commands`, then
    /// `Closed`.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<(), FuzzlinkError> {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let sender = self.conn.sender();

        let outcome = loop {
            if self.outbox.len() > OUTBOX_LIMIT {
                break Err(FuzzlinkError::Other(format!(
                    "executor stopped reading; {} messages queued",
                    self.outbox.len()
                )));
            }
            tokio::select! {
                permit = sender.reserve(), if !self.outbox.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(msg) = self.outbox.pop_front() {
                            permit.send(msg);
                        }
                    }
                    Err(e) => break Err(e),
                },
                msg = self.conn.recv() => {
                    let handled = match msg {
                        Ok(msg) => self.handle_message(msg, &events),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = handled {
                        break Err(e);
                    }
                }
                cmd = commands.recv() => match cmd {
                    Some(SessionCommand::Close) | None => break Ok(()),
                    Some(cmd) => self.handle_command(cmd, &events),
                },
                _ = sweep.tick() => {
                    for lost in self.table.drain_expired() {
                        warn!(session = self.id, id = lost.request.id, "execution timed out");
                        let _ = events.send(SessionEvent::Lost(lost));
                    }
                }
            }
        };
        drop(sender);

        self.phase.close();
        let lost = self.table.close();
        if !lost.is_empty() {
            warn!(session = self.id, count = lost.len(), "session closed with executions in flight");
        }
        for entry in lost {
            let _ = events.send(SessionEvent::Lost(entry));
        }
        reject_queued(self.id, &mut commands, &events);
        let reason = outcome.as_ref().err().map(ToString::to_string);
        match &reason {
            Some(r) => warn!(session = self.id, reason = %r, "session closed"),
            None => info!(session = self.id, "session closed"),
        }
        let _ = events.send(SessionEvent::Closed(reason));
        if outcome.is_ok() {
            self.flush_outbox().await;
        }
        self.conn.shutdown().await;
        outcome
    }

    /// Best effort: hand what is left in the outbox to the writer.
    async fn flush_outbox(&mut self) {
        let conn = &self.conn;
        let outbox = &mut self.outbox;
        let flushed = tokio::time::timeout(CLOSE_GRACE, async {
            while let Some(msg) = outbox.pop_front() {
                if conn.send(msg).await.is_err() {
                    break;
                }
            }
        })
        .await;
        if flushed.is_err() {
            debug!(session = self.id, left = self.outbox.len(), "dropping unsent messages");
        }
    }

    fn handle_message(
        &mut self,
        msg: ExecutorMessage,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<(), FuzzlinkError> {
        match msg {
            ExecutorMessage::Executing(m) => {
                self.phase.ensure_ready()?;
                match self.table.on_executing(&m) {
                    Ok(true) => {
                        debug!(session = self.id, id = m.id, proc = m.proc_id, attempt = m.attempt, "executing");
                        let _ = events.send(SessionEvent::Executing(m));
                    }
                    Ok(false) => debug!(session = self.id, id = m.id, attempt = m.attempt, "repeated Executing"),
                    Err(e) => warn!(session = self.id, error = %e, "ignoring Executing"),
                }
            }
            ExecutorMessage::ExecResult(result) => {
                self.phase.ensure_ready()?;
                match self.table.on_result(result) {
                    Ok(done) => {
                        debug!(
                            session = self.id,
                            id = done.request.id,
                            latency = ?done.latency,
                            error = %done.result.error,
                            "execution finished"
                        );
                        let _ = events.send(SessionEvent::Completed(done));
                    }
                    // Late answers to requests already reported lost end
                    // up here as well.
                    Err(e) => warn!(session = self.id, error = %e, "dropping result"),
                }
            }
            ExecutorMessage::StateResult(state) => {
                let _ = events.send(SessionEvent::State(state));
            }
            ExecutorMessage::ConnectRequest(_) | ExecutorMessage::InfoReply(_) => {
                return Err(FuzzlinkError::ProtocolViolation(
                    "setup message after the session became ready",
                ));
            }
        }
        Ok(())
    }

    fn handle_command(
        &mut self,
        cmd: SessionCommand,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) {
        match cmd {
            SessionCommand::Submit(request) => {
                let id = request.id;
                match self.table.track(request.clone()) {
                    Ok(()) => {
                        self.outbox.push_back(HostMessage::ExecRequest(request));
                        debug!(session = self.id, id, "request queued");
                    }
                    Err(e) => {
                        warn!(session = self.id, id, error = %e, "refusing request");
                        let _ = events.send(SessionEvent::Rejected {
                            request,
                            reason: e.to_string(),
                        });
                    }
                }
            }
            SessionCommand::Control(msg) => self.outbox.push_back(msg),
            SessionCommand::Close => {}
        }
    }
}

/// Hand every submit still waiting in `commands` back as `Rejected`.
pub(crate) fn reject_queued(
    session: u64,
    commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    events: &mpsc::UnboundedSender<SessionEvent>,
) {
    commands.close();
    while let Ok(cmd) = commands.try_recv() {
        if let SessionCommand::Submit(request) = cmd {
            debug!(session, id = request.id, "session gone before the request was sent");
            let _ = events.send(SessionEvent::Rejected {
                request,
                reason: FuzzlinkError::ChannelClosed.to_string(),
            });
        }
    }
}

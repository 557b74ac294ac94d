//! Multiplexing many executor sessions.
//!
//! Each session runs in its own task (tracked by a [`TaskPool`]) and
//! reports through its own event channel; the pool merges those channels
//! with a `StreamMap`, so one stalled executor never holds up the others.
//! Both directions use unbounded channels and nothing here waits on a
//! session: submits and broadcasts are queued, and every outcome comes
//! back as an event.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::StreamMap;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use fuzzlink_core::{
    ExecRequest, FuzzlinkError, HostConnection, HostMessage, SignalUpdate, TaskEvent, TaskPool,
};

use crate::session::{HostSession, SessionCommand, SessionEvent, SessionSettings, reject_queued};

/// An event from one session.
#[derive(Debug)]
pub struct PoolEvent {
    pub session: u64,
    pub event: SessionEvent,
}

#[derive(Debug)]
struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    ready: bool,
    /// Submitted ids without a `Completed`, `Lost` or `Rejected` event yet.
    outstanding: HashSet<u64>,
}

pub struct HostPool {
    settings: Arc<SessionSettings>,
    sessions: HashMap<u64, SessionHandle>,
    events: StreamMap<u64, UnboundedReceiverStream<SessionEvent>>,
    tasks: TaskPool<Result<(), FuzzlinkError>>,
    next_session: u64,
    corpus_triaged: bool,
    max_signal: HashSet<u64>,
}

impl HostPool {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            sessions: HashMap::new(),
            events: StreamMap::new(),
            tasks: TaskPool::new(),
            next_session: 0,
            corpus_triaged: false,
            max_signal: HashSet::new(),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Number of live sessions, including those still in setup.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ids of sessions that finished setup.
    pub fn ready_sessions(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, h)| h.ready)
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn corpus_triaged(&self) -> bool {
        self.corpus_triaged
    }

    /// Start a session on an accepted connection. Returns its id.
    ///
    /// A late joiner is brought up to date: it receives the accumulated
    /// max signal and, if already raised, the triaged flag.
    pub fn add_connection(&mut self, conn: HostConnection) -> u64 {
        self.next_session += 1;
        let id = self.next_session;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        if !self.max_signal.is_empty() {
            let mut new_max: Vec<u64> = self.max_signal.iter().copied().collect();
            new_max.sort_unstable();
            let _ = cmd_tx.send(SessionCommand::Control(HostMessage::SignalUpdate(
                SignalUpdate { new_max },
            )));
        }
        if self.corpus_triaged {
            let _ = cmd_tx.send(SessionCommand::Control(HostMessage::CorpusTriaged));
        }

        let settings = Arc::clone(&self.settings);
        self.tasks.spawn(id, async move {
            let mut cmd_rx = cmd_rx;
            let session = match HostSession::establish(id, conn, &settings).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(session = id, error = %e, "session setup failed");
                    reject_queued(id, &mut cmd_rx, &event_tx);
                    let _ = event_tx.send(SessionEvent::Closed(Some(e.to_string())));
                    return Err(e);
                }
            };
            let _ = event_tx.send(SessionEvent::Ready(session.session().clone()));
            session.run(cmd_rx, event_tx).await
        });

        self.events.insert(id, UnboundedReceiverStream::new(event_rx));
        self.sessions.insert(
            id,
            SessionHandle {
                commands: cmd_tx,
                ready: false,
                outstanding: HashSet::new(),
            },
        );
        debug!(session = id, "session spawned");
        id
    }

    /// Queue a request for one session.
    ///
    /// Returns at once. An id still outstanding on that session is refused
    /// with `DuplicateRequest`; otherwise exactly one `Completed`, `Lost`
    /// or `Rejected` event follows for it.
    pub fn submit(&mut self, session: u64, request: ExecRequest) -> Result<(), FuzzlinkError> {
        let handle = self
            .sessions
            .get_mut(&session)
            .ok_or(FuzzlinkError::ChannelClosed)?;
        let id = request.id;
        if !handle.outstanding.insert(id) {
            return Err(FuzzlinkError::DuplicateRequest(id));
        }
        if handle.commands.send(SessionCommand::Submit(request)).is_err() {
            handle.outstanding.remove(&id);
            return Err(FuzzlinkError::ChannelClosed);
        }
        Ok(())
    }

    /// Requests submitted to `session` that have not been resolved yet.
    pub fn outstanding(&self, session: u64) -> usize {
        self.sessions
            .get(&session)
            .map_or(0, |h| h.outstanding.len())
    }

    /// Ask a session for a state snapshot; the answer arrives as
    /// `SessionEvent::State`.
    pub fn request_state(&self, session: u64) -> Result<(), FuzzlinkError> {
        self.send_to(session, HostMessage::StateRequest)
    }

    /// Merge newly found max signal and broadcast the new part.
    pub fn broadcast_signal(&mut self, signal: &[u64]) {
        let new_max: Vec<u64> = signal
            .iter()
            .copied()
            .filter(|s| self.max_signal.insert(*s))
            .collect();
        if new_max.is_empty() {
            return;
        }
        debug!(count = new_max.len(), "broadcasting new max signal");
        self.broadcast(HostMessage::SignalUpdate(SignalUpdate { new_max }));
    }

    /// Raise the triaged flag. Only the first call broadcasts; sessions
    /// that join later get the flag on connect.
    pub fn mark_corpus_triaged(&mut self) {
        if std::mem::replace(&mut self.corpus_triaged, true) {
            return;
        }
        info!("corpus triaged");
        self.broadcast(HostMessage::CorpusTriaged);
    }

    fn broadcast(&self, msg: HostMessage) {
        for (id, handle) in &self.sessions {
            if handle
                .commands
                .send(SessionCommand::Control(msg.clone()))
                .is_err()
            {
                debug!(session = id, "broadcast to closing session");
            }
        }
    }

    fn send_to(&self, session: u64, msg: HostMessage) -> Result<(), FuzzlinkError> {
        let handle = self
            .sessions
            .get(&session)
            .ok_or(FuzzlinkError::ChannelClosed)?;
        handle.commands.send(SessionCommand::Control(msg))?;
        Ok(())
    }

    /// Close one session. Its outstanding requests are reported as lost.
    pub fn close(&self, session: u64) {
        if let Some(handle) = self.sessions.get(&session) {
            let _ = handle.commands.send(SessionCommand::Close);
        }
    }

    /// Close every session.
    pub fn close_all(&self) {
        for handle in self.sessions.values() {
            let _ = handle.commands.send(SessionCommand::Close);
        }
    }

    /// Next event from any session. `None` once no session is left.
    pub async fn next_event(&mut self) -> Option<PoolEvent> {
        loop {
            if self.events.is_empty() && self.tasks.is_empty() {
                return None;
            }
            tokio::select! {
                Some((session, event)) = self.events.next() => {
                    let resolved = match &event {
                        SessionEvent::Completed(done) => Some(done.request.id),
                        SessionEvent::Lost(lost) => Some(lost.request.id),
                        SessionEvent::Rejected { request, .. } => Some(request.id),
                        _ => None,
                    };
                    match (&event, self.sessions.get_mut(&session)) {
                        (SessionEvent::Closed(_), _) => {
                            self.sessions.remove(&session);
                        }
                        (SessionEvent::Ready(_), Some(h)) => h.ready = true,
                        (_, Some(h)) => {
                            if let Some(id) = resolved {
                                h.outstanding.remove(&id);
                            }
                        }
                        (_, None) => {}
                    }
                    return Some(PoolEvent { session, event });
                }
                Some(task) = self.tasks.recv() => {
                    if let TaskEvent::Panicked(session, msg) = task {
                        error!(session, panic = %msg, "session task panicked");
                        self.events.remove(&session);
                        if self.sessions.remove(&session).is_some() {
                            return Some(PoolEvent {
                                session,
                                event: SessionEvent::Closed(Some(format!("session task panicked: {msg}"))),
                            });
                        }
                    }
                }
                else => return None,
            }
        }
    }

    /// Abort every session task without the orderly close.
    pub fn abort_all(&mut self) {
        self.tasks.abort_all();
        self.sessions.clear();
        self.events.clear();
    }
}

impl std::fmt::Debug for HostPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPool")
            .field("sessions", &self.sessions.len())
            .field("corpus_triaged", &self.corpus_triaged)
            .field("max_signal", &self.max_signal.len())
            .finish()
    }
}

//! Host service: accept executors and keep them busy.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use fuzzlink_core::{
    ExecRequest, ExecutorSnapshot, FuzzlinkError, HostConnection, RequestFlag,
};

use crate::config::HostConfig;
use crate::driver::{CorpusDriver, DriverStats};
use crate::pool::{HostPool, PoolEvent};
use crate::session::SessionEvent;

/// How long sessions get to report their lost requests on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How often sessions with spare capacity are topped up.
const REFILL_INTERVAL: Duration = Duration::from_millis(500);

pub struct HostService {
    config: HostConfig,
    running: Arc<AtomicBool>,
}

impl HostService {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle that stops the service when set to `false`.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Bind the configured address and serve until stopped.
    pub async fn run(&self) -> Result<DriverStats, FuzzlinkError> {
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        info!("listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve on an already bound listener until stopped.
    pub async fn serve(&self, listener: TcpListener) -> Result<DriverStats, FuzzlinkError> {
        self.running.store(true, Ordering::SeqCst);

        let settings = self.config.to_session_settings()?;
        let sandbox = self.config.sandbox()?;
        let programs = match self.config.corpus_dir() {
            Some(dir) => {
                let programs = CorpusDriver::load_dir(&dir)?;
                info!("loaded {} programs from {}", programs.len(), dir.display());
                programs
            }
            None => Vec::new(),
        };
        let mut flags = RequestFlag::RETURN_ERROR;
        if self.config.corpus.binary {
            flags |= RequestFlag::IS_BINARY;
        }
        if self.config.corpus.return_output {
            flags |= RequestFlag::RETURN_OUTPUT;
        }

        let mut driver = CorpusDriver::new(programs, sandbox, flags);
        let mut pool = HostPool::new(settings);
        if driver.triaged_at_start() {
            pool.mark_corpus_triaged();
        }
        let mut refill = tokio::time::interval(REFILL_INTERVAL);
        refill.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if pool.len() >= self.config.network.max_sessions {
                            warn!("refusing executor at {peer}: session limit reached");
                            continue;
                        }
                        let id = pool.add_connection(HostConnection::from_tcp(stream));
                        debug!(session = id, "accepted {peer}");
                    }
                    Err(e) => warn!("accept error: {e}"),
                },
                Some(event) = pool.next_event() => {
                    handle_event(&mut pool, &mut driver, event);
                }
                _ = refill.tick() => {
                    for (session, batch) in driver.refill() {
                        submit_all(&mut pool, &mut driver, session, batch);
                    }
                }
                _ = wait_for_stop(&self.running) => break,
            }
        }

        info!("shutting down {} sessions", pool.len());
        driver.stop_scheduling();
        pool.close_all();
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(event) = pool.next_event().await {
                handle_event(&mut pool, &mut driver, event);
            }
        })
        .await;
        if drained.is_err() {
            warn!("sessions did not close in time; aborting");
            pool.abort_all();
        }

        let stats = driver.stats().clone();
        info!(
            completed = stats.completed,
            failed = stats.failed,
            lost = stats.lost,
            rejected = stats.rejected,
            "host stopped"
        );
        Ok(stats)
    }
}

fn handle_event(pool: &mut HostPool, driver: &mut CorpusDriver, ev: PoolEvent) {
    let PoolEvent { session, event } = ev;
    match event {
        SessionEvent::Ready(s) => {
            info!(
                session,
                executor = %s.executor().name,
                procs = s.config().procs,
                "executor ready"
            );
            let _ = pool.request_state(session);
            let batch = driver.on_ready(session, &s);
            submit_all(pool, driver, session, batch);
        }
        SessionEvent::Executing(m) => {
            debug!(session, id = m.id, proc = m.proc_id, attempt = m.attempt, "executing");
        }
        SessionEvent::Completed(done) => {
            let followup = driver.on_completed(session, &done);
            pool.broadcast_signal(&followup.signal);
            if followup.triaged {
                pool.mark_corpus_triaged();
            }
            submit_all(pool, driver, session, followup.next);
        }
        SessionEvent::Lost(lost) => {
            warn!(session, id = lost.request.id, state = ?lost.last_state, "execution lost");
            let next = driver.on_lost(session, &lost);
            submit_all(pool, driver, session, next);
        }
        SessionEvent::Rejected { request, reason } => {
            debug!(session, id = request.id, %reason, "request not sent");
            driver.unsubmitted(session, request.id);
        }
        SessionEvent::State(state) => {
            match serde_json::from_slice::<ExecutorSnapshot>(&state.data) {
                Ok(snap) => info!(
                    session,
                    executed = snap.executed,
                    slots = snap.slots.len(),
                    triaged = snap.corpus_triaged,
                    max_signal = snap.max_signal,
                    "executor state"
                ),
                Err(e) => warn!(session, error = %e, "unreadable executor state"),
            }
        }
        SessionEvent::Closed(reason) => {
            driver.on_closed(session);
            if let Some(reason) = reason {
                warn!(session, %reason, "executor session ended");
            }
        }
    }
}

fn submit_all(
    pool: &mut HostPool,
    driver: &mut CorpusDriver,
    session: u64,
    batch: Vec<ExecRequest>,
) {
    for request in batch {
        let id = request.id;
        if let Err(e) = pool.submit(session, request) {
            debug!(session, id, error = %e, "submit failed");
            driver.unsubmitted(session, id);
        }
    }
}

async fn wait_for_stop(running: &Arc<AtomicBool>) {
    loop {
        if !running.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

//! Executor integration tests: a scripted host drives a real
//! `ExecutorSession` backed by a scripted runner.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fuzzlink_core::{
    CallInfo, ConnectReply, CoverFilter, ExecEnv, ExecFlag, ExecOpts, ExecRequest, ExecResult,
    ExecutingMessage, ExecutorConnection, ExecutorMessage, ExecutorSnapshot, Feature,
    FuzzlinkError, HostConnection, HostMessage, RequestFlag, SignalUpdate,
};
use fuzzlink_executor::{
    CallReport, ExecutorSession, ExecutorSettings, ProgramRunner, RunError, RunJob, RunOutput,
    StaticProbe,
};
use tokio::task::JoinHandle;

// ── Scripted runner ──────────────────────────────────────────────

/// Behaviour is chosen by the program text.
struct ScriptedRunner;

#[async_trait]
impl ProgramRunner for ScriptedRunner {
    async fn run(&self, job: RunJob) -> Result<RunOutput, RunError> {
        match job.request.prog_data.as_slice() {
            b"crash" => Err(RunError::Crashed("SIGSEGV".into())),
            b"crash-once" if job.attempt == 0 => Err(RunError::Crashed("SIGSEGV".into())),
            b"slow-crash-once" if job.attempt == 0 => {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Err(RunError::Crashed("SIGSEGV".into()))
            }
            b"fail" => Err(RunError::Failed("exit status 1".into())),
            b"hang" => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(RunOutput::default())
            }
            b"slow" => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(two_calls())
            }
            _ => Ok(two_calls()),
        }
    }
}

fn two_calls() -> RunOutput {
    RunOutput {
        ncalls: 2,
        reports: vec![
            CallReport {
                call: Some(0),
                info: CallInfo::finished(0)
                    .with_cover(vec![10, 11, 10])
                    .with_signal(vec![1, 2]),
            },
            CallReport {
                call: Some(1),
                info: CallInfo::finished(0).with_signal(vec![3]),
            },
            CallReport {
                call: None,
                info: CallInfo::default().with_cover(vec![12]).with_signal(vec![4]),
            },
        ],
        output: b"log".to_vec(),
        elapsed: Duration::from_millis(1),
    }
}

// ── Host side ────────────────────────────────────────────────────

struct Harness {
    host: HostConnection,
    executor: JoinHandle<Result<u64, FuzzlinkError>>,
}

async fn start(procs: u32, program_timeout_ms: u32, cover_filter: Vec<u64>) -> Harness {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let mut host = HostConnection::new(a);
    let executor = tokio::spawn(async move {
        let probe = StaticProbe::new(Feature::COVERAGE | Feature::SANDBOX_NONE);
        let settings = ExecutorSettings {
            handshake_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let session = ExecutorSession::establish(
            ExecutorConnection::new(b),
            &settings,
            &probe,
            Arc::new(ScriptedRunner),
        )
        .await?;
        session.run().await
    });

    assert!(matches!(next(&mut host).await, ExecutorMessage::ConnectRequest(_)));
    host.send(HostMessage::ConnectReply(ConnectReply {
        procs,
        program_timeout_ms,
        features: Feature::COVERAGE | Feature::SANDBOX_NONE | Feature::FAULT,
        ..Default::default()
    }))
    .await
    .unwrap();
    let ExecutorMessage::InfoReply(info) = next(&mut host).await else {
        panic!("expected InfoReply");
    };
    assert_eq!(
        info.available_features(),
        Feature::COVERAGE | Feature::SANDBOX_NONE
    );
    host.send(HostMessage::CoverFilter(CoverFilter { pcs: cover_filter }))
        .await
        .unwrap();
    Harness { host, executor }
}

async fn next(host: &mut HostConnection) -> ExecutorMessage {
    tokio::time::timeout(Duration::from_secs(5), host.recv())
        .await
        .expect("timeout")
        .expect("recv failed")
}

async fn executing(host: &mut HostConnection) -> ExecutingMessage {
    match next(host).await {
        ExecutorMessage::Executing(m) => m,
        other => panic!("expected Executing, got {other}"),
    }
}

async fn result(host: &mut HostConnection) -> ExecResult {
    match next(host).await {
        ExecutorMessage::ExecResult(r) => r,
        other => panic!("expected ExecResult, got {other}"),
    }
}

fn request(id: u64, prog: &[u8]) -> HostMessage {
    HostMessage::ExecRequest(ExecRequest::new(id, prog.to_vec()))
}

fn request_with(id: u64, prog: &[u8], flags: RequestFlag) -> HostMessage {
    HostMessage::ExecRequest(ExecRequest::new(id, prog.to_vec()).with_flags(flags))
}

// ── Tests ────────────────────────────────────────────────────────

#[tokio::test]
async fn runs_program_and_folds_feedback() {
    let mut h = start(2, 5_000, Vec::new()).await;
    let mut req = ExecRequest::new(1, b"ok".to_vec()).with_flags(RequestFlag::RETURN_OUTPUT);
    req.exec_opts.exec_flags = ExecFlag::COLLECT_SIGNAL | ExecFlag::COLLECT_COVER | ExecFlag::DEDUP_COVER;
    h.host.send(HostMessage::ExecRequest(req)).await.unwrap();

    let started = executing(&mut h.host).await;
    assert_eq!((started.id, started.proc_id, started.attempt), (1, 1, 0));

    let res = result(&mut h.host).await;
    assert!(res.is_success());
    assert_eq!(res.proc_id, 1);
    assert_eq!(res.output, b"log");
    let info = res.info.unwrap();
    assert_eq!(info.calls.len(), 2);
    assert_eq!(info.calls[0].cover, vec![10, 11]);
    assert_eq!(info.calls[1].signal, vec![3]);
    assert!(info.extra_raw.is_empty());
    assert_eq!(info.extra.unwrap().signal, vec![4]);
    assert_eq!(info.freshness, 0);

    drop(h.host);
    assert_eq!(h.executor.await.unwrap().unwrap(), 1);
}

#[tokio::test]
async fn cover_filter_restricts_reported_cover() {
    let mut h = start(1, 5_000, vec![11, 12]).await;
    h.host.send(request(1, b"ok")).await.unwrap();
    executing(&mut h.host).await;
    let info = result(&mut h.host).await.info.unwrap();
    assert_eq!(info.calls[0].cover, vec![11]);
    assert_eq!(info.extra.unwrap().cover, vec![12]);
    assert!(info.calls[0].signal.contains(&1));
}

#[tokio::test]
async fn crash_is_retried_in_a_fresh_worker() {
    let mut h = start(1, 5_000, Vec::new()).await;
    h.host.send(request(7, b"crash-once")).await.unwrap();

    let first = executing(&mut h.host).await;
    let second = executing(&mut h.host).await;
    assert_eq!(first.id, 7);
    assert_eq!(second.id, 7);
    assert_eq!(second.attempt, first.attempt + 1);
    assert_ne!(second.proc_id, first.proc_id);

    let res = result(&mut h.host).await;
    assert!(res.is_success());
    assert_eq!(res.proc_id, second.proc_id);
}

#[tokio::test]
async fn retry_wait_starts_at_the_relaunch() {
    let mut h = start(1, 5_000, Vec::new()).await;
    h.host.send(request(8, b"slow-crash-once")).await.unwrap();

    let first = executing(&mut h.host).await;
    let second = executing(&mut h.host).await;
    assert_eq!((first.attempt, second.attempt), (0, 1));
    // The crashed attempt ran for 300ms; none of that is queueing.
    assert!(second.wait_duration_ns < Duration::from_millis(150).as_nanos() as u64);
    assert!(result(&mut h.host).await.is_success());
}

#[tokio::test]
async fn worker_identity_follows_environment_not_exec_flags() {
    let mut h = start(1, 5_000, Vec::new()).await;
    let base = ExecOpts {
        env_flags: ExecEnv::SANDBOX_NONE | ExecEnv::SIGNAL,
        exec_flags: ExecFlag::COLLECT_SIGNAL,
        sandbox_arg: 0,
    };
    let setuid = ExecEnv::SANDBOX_SETUID | ExecEnv::SIGNAL;
    let steps = [
        base,
        ExecOpts {
            exec_flags: ExecFlag::COLLECT_COVER | ExecFlag::DEDUP_COVER | ExecFlag::THREADED,
            ..base
        },
        ExecOpts {
            env_flags: setuid,
            ..base
        },
        ExecOpts {
            env_flags: setuid,
            sandbox_arg: 7,
            ..base
        },
    ];

    let mut procs = Vec::new();
    for (id, opts) in (1..).zip(steps) {
        let req = ExecRequest::new(id, b"ok".to_vec()).with_opts(opts);
        h.host.send(HostMessage::ExecRequest(req)).await.unwrap();
        let started = executing(&mut h.host).await;
        assert_eq!((started.id, started.attempt), (id, 0));
        procs.push(started.proc_id);
        assert!(result(&mut h.host).await.is_success());
    }
    assert_eq!(procs[1], procs[0], "exec flags alone relaunched the worker");
    assert_ne!(procs[2], procs[1], "env change kept the old worker");
    assert_ne!(procs[3], procs[2], "sandbox arg change kept the old worker");
}

#[tokio::test]
async fn persistent_crash_becomes_an_error_result() {
    let mut h = start(1, 5_000, Vec::new()).await;
    h.host
        .send(request_with(3, b"crash", RequestFlag::RETURN_ERROR))
        .await
        .unwrap();
    // Default settings allow three attempts.
    for attempt in 0..3 {
        assert_eq!(executing(&mut h.host).await.attempt, attempt);
    }
    let res = result(&mut h.host).await;
    assert_eq!(res.id, 3);
    assert!(res.error.contains("crashed"));
    assert!(res.info.is_none());
    assert!(!res.rejected);

    // The slot is usable again.
    h.host.send(request(4, b"ok")).await.unwrap();
    executing(&mut h.host).await;
    assert!(result(&mut h.host).await.is_success());
}

#[tokio::test]
async fn failure_without_return_error_ends_the_session() {
    let mut h = start(1, 5_000, Vec::new()).await;
    h.host.send(request(9, b"fail")).await.unwrap();
    executing(&mut h.host).await;

    let err = h.executor.await.unwrap().unwrap_err();
    assert!(matches!(err, FuzzlinkError::ExecutionFailed { id: 9, .. }));
    assert!(matches!(h.host.recv().await, Err(FuzzlinkError::ChannelClosed)));
}

#[tokio::test]
async fn timeout_is_reported_with_return_error() {
    let mut h = start(1, 100, Vec::new()).await;
    h.host
        .send(request_with(5, b"hang", RequestFlag::RETURN_ERROR))
        .await
        .unwrap();
    executing(&mut h.host).await;
    let res = result(&mut h.host).await;
    assert!(res.error.contains("timed out"));
}

#[tokio::test]
async fn busy_executor_rejects_instead_of_queueing() {
    let mut h = start(1, 5_000, Vec::new()).await;
    h.host.send(request(1, b"slow")).await.unwrap();
    h.host.send(request(2, b"ok")).await.unwrap();

    assert_eq!(executing(&mut h.host).await.id, 1);
    let rejected = result(&mut h.host).await;
    assert_eq!(rejected.id, 2);
    assert!(rejected.rejected);
    assert!(rejected.error.contains("busy"));
    let done = result(&mut h.host).await;
    assert_eq!(done.id, 1);
    assert!(done.is_success());
}

#[tokio::test]
async fn known_signal_is_suppressed_and_state_reported() {
    let mut h = start(2, 5_000, Vec::new()).await;
    h.host
        .send(HostMessage::SignalUpdate(SignalUpdate { new_max: vec![1, 2] }))
        .await
        .unwrap();
    h.host.send(HostMessage::CorpusTriaged).await.unwrap();
    h.host.send(HostMessage::CorpusTriaged).await.unwrap();

    let req = ExecRequest::new(1, b"ok".to_vec()).with_all_signal(vec![1]);
    h.host.send(HostMessage::ExecRequest(req)).await.unwrap();
    executing(&mut h.host).await;
    let info = result(&mut h.host).await.info.unwrap();
    assert!(info.calls[0].signal.is_empty());
    assert_eq!(info.calls[1].signal, vec![3]);

    h.host.send(HostMessage::StateRequest).await.unwrap();
    let ExecutorMessage::StateResult(state) = next(&mut h.host).await else {
        panic!("expected StateResult");
    };
    let snap: ExecutorSnapshot = serde_json::from_slice(&state.data).unwrap();
    assert_eq!(snap.executed, 1);
    assert!(snap.corpus_triaged);
    assert_eq!(snap.max_signal, 2);
    assert_eq!(snap.slots.len(), 2);
}

#[tokio::test]
async fn setup_message_after_ready_is_fatal() {
    let h = start(1, 5_000, Vec::new()).await;
    h.host
        .send(HostMessage::ConnectReply(ConnectReply::default()))
        .await
        .unwrap();
    let err = h.executor.await.unwrap().unwrap_err();
    assert!(matches!(err, FuzzlinkError::ProtocolViolation(_)));
}

#[tokio::test]
async fn silent_host_times_out_the_handshake() {
    let (a, b) = tokio::io::duplex(1024);
    let _host = HostConnection::new(a);
    let settings = ExecutorSettings {
        handshake_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let probe = StaticProbe::new(Feature::COVERAGE);
    let err = ExecutorSession::establish(
        ExecutorConnection::new(b),
        &settings,
        &probe,
        Arc::new(ScriptedRunner),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, FuzzlinkError::HandshakeTimeout(_)));
}

//! Integration tests: full session lifecycle over localhost TCP, message
//! round-trips through the public codec, and streaming decode against
//! mock I/O.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use fuzzlink_core::{
    CallFlag, CallInfo, Comparison, ConnectReply, ConnectRequest, ConnectionInfo, CoverFilter,
    ExecEnv, ExecFlag, ExecOpts, ExecRequest, ExecResult, ExecState, ExecutingMessage,
    ExecutorConnection, ExecutorMessage, ExecutorState, Feature, FeatureInfo, FileInfo,
    FuzzlinkError, GlobInfo, HostCodec, HostConnection, HostMessage, HostState, InfoReply,
    ProgInfo, RequestFlag, Session, SignalUpdate, StateResult, decode, encode,
};
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, FramedWrite};

// ── Helpers ──────────────────────────────────────────────────────

async fn ephemeral_listener() -> (TcpListener, ConnectionInfo) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, ConnectionInfo::new(addr.ip().to_string(), addr.port()))
}

async fn connected_pair() -> (HostConnection, ExecutorConnection) {
    let (listener, info) = ephemeral_listener().await;
    let dial = tokio::spawn(async move {
        ExecutorConnection::connect(info.to_string()).await.unwrap()
    });
    let (stream, _) = listener.accept().await.unwrap();
    (HostConnection::from_tcp(stream), dial.await.unwrap())
}

async fn recv<T>(
    fut: impl std::future::Future<Output = Result<T, FuzzlinkError>>,
) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timeout")
        .expect("recv failed")
}

// ── End to end ───────────────────────────────────────────────────

#[tokio::test]
async fn amd64_session_end_to_end() {
    let (mut host, mut executor) = connected_pair().await;
    let host_build = ConnectRequest::new("host", "amd64");

    // Handshake.
    executor
        .send(ExecutorMessage::ConnectRequest(ConnectRequest::new("vm-0", "amd64")))
        .await
        .unwrap();
    let ExecutorMessage::ConnectRequest(hello) = recv(host.recv()).await else {
        panic!("expected ConnectRequest");
    };
    hello.check_compatible(&host_build).unwrap();
    let reply = ConnectReply {
        features: Feature::COVERAGE | Feature::SANDBOX_NONE,
        ..Default::default()
    };
    host.send(HostMessage::ConnectReply(reply.clone())).await.unwrap();
    let mut session = Session::new(hello, reply);

    let HostMessage::ConnectReply(got) = recv(executor.recv()).await else {
        panic!("expected ConnectReply");
    };
    assert_eq!(got.features, Feature::COVERAGE | Feature::SANDBOX_NONE);

    // Feature report: one of two features is unusable.
    executor
        .send(ExecutorMessage::InfoReply(InfoReply {
            features: vec![
                FeatureInfo::available(Feature::COVERAGE, true),
                FeatureInfo::unavailable(
                    Feature::SANDBOX_NONE,
                    "not supported in this kernel build",
                ),
            ],
            ..Default::default()
        }))
        .await
        .unwrap();
    let ExecutorMessage::InfoReply(info) = recv(host.recv()).await else {
        panic!("expected InfoReply");
    };
    session.apply_info(&info).unwrap();
    assert_eq!(session.available_features(), Feature::COVERAGE);
    assert!(!session.is_available(Feature::SANDBOX_NONE));
    assert!(session.exec_opts(Feature::SANDBOX_NONE).is_err());

    // One execution.
    let mut table = HostState::new();
    let request = ExecRequest::new(1, b"prog".to_vec()).with_flags(RequestFlag::RETURN_OUTPUT);
    assert!(!request.exec_opts.env_flags.contains(ExecEnv::SANDBOX_NONE));
    table.track(request.clone()).unwrap();
    host.send(HostMessage::ExecRequest(request)).await.unwrap();

    let HostMessage::ExecRequest(req) = recv(executor.recv()).await else {
        panic!("expected ExecRequest");
    };
    executor
        .send_flushed(ExecutorMessage::Executing(ExecutingMessage {
            id: req.id,
            proc_id: 7,
            attempt: 0,
            wait_duration_ns: 0,
        }))
        .await
        .unwrap();
    let expected = ExecResult {
        id: 1,
        proc_id: 7,
        output: b"ok\n".to_vec(),
        error: String::new(),
        info: Some(ProgInfo {
            calls: vec![CallInfo {
                flags: CallFlag::EXECUTED | CallFlag::FINISHED,
                error: 0,
                cover: vec![0x1000, 0x1004],
                ..Default::default()
            }],
            elapsed_ns: 150_000,
            freshness: 0,
            ..Default::default()
        }),
        rejected: false,
    };
    executor
        .send(ExecutorMessage::ExecResult(expected.clone()))
        .await
        .unwrap();

    let ExecutorMessage::Executing(started) = recv(host.recv()).await else {
        panic!("expected Executing");
    };
    assert!(table.on_executing(&started).unwrap());
    assert_eq!(
        table.state(1),
        Some(ExecState::Executing {
            proc_id: 7,
            attempt: 0
        })
    );

    let ExecutorMessage::ExecResult(result) = recv(host.recv()).await else {
        panic!("expected ExecResult");
    };
    assert_eq!(result, expected);
    let done = table.on_result(result).unwrap();
    assert_eq!(done.attempts.len(), 1);
    assert_eq!(table.pending_count(), 0);
}

#[tokio::test]
async fn at_most_one_result_per_id() {
    let mut table = HostState::new();
    table.track(ExecRequest::new(5, Vec::new())).unwrap();
    assert!(matches!(
        table.track(ExecRequest::new(5, Vec::new())),
        Err(FuzzlinkError::DuplicateRequest(5))
    ));

    table.on_result(ExecResult::failed(5, 1, "boom")).unwrap();
    assert!(matches!(
        table.on_result(ExecResult::failed(5, 1, "again")),
        Err(FuzzlinkError::UnexpectedResult(5))
    ));
    assert!(matches!(
        table.on_result(ExecResult::failed(6, 1, "never sent")),
        Err(FuzzlinkError::UnexpectedResult(6))
    ));

    // Once lost, a late result is also rejected.
    table.track(ExecRequest::new(9, Vec::new())).unwrap();
    let lost = table.close();
    assert_eq!(lost.len(), 1);
    assert!(table.on_result(ExecResult::failed(9, 1, "late")).is_err());
}

#[tokio::test]
async fn dropped_channel_voids_outstanding_ids() {
    let (mut host, executor) = connected_pair().await;
    let mut table = HostState::new();
    for id in 1..=3 {
        let req = ExecRequest::new(id, Vec::new());
        table.track(req.clone()).unwrap();
        host.send(HostMessage::ExecRequest(req)).await.unwrap();
    }
    drop(executor);

    let err = loop {
        match tokio::time::timeout(Duration::from_secs(5), host.recv())
            .await
            .expect("timeout")
        {
            Ok(_) => continue,
            Err(e) => break e,
        }
    };
    assert!(err.is_session_fatal());
    let lost: Vec<u64> = table.close().iter().map(|l| l.request.id).collect();
    assert_eq!(lost, vec![1, 2, 3]);
}

// ── Round-trips ──────────────────────────────────────────────────

#[test]
fn every_host_variant_survives_the_codec() {
    let messages = vec![
        HostMessage::ConnectReply(ConnectReply {
            leak_frames: vec!["kfree_skb".into()],
            features: Feature::from_bits_retain(1 << 60) | Feature::FAULT,
            files: vec!["/proc/version".into()],
            globs: Vec::new(),
            ..Default::default()
        }),
        HostMessage::CoverFilter(CoverFilter { pcs: Vec::new() }),
        HostMessage::ExecRequest(
            ExecRequest::new(u64::MAX, Vec::new())
                .with_opts(ExecOpts {
                    env_flags: ExecEnv::from_bits_retain(1 << 63),
                    exec_flags: ExecFlag::empty(),
                    sandbox_arg: -1,
                })
                .with_all_signal(vec![0, -1]),
        ),
        HostMessage::SignalUpdate(SignalUpdate::default()),
        HostMessage::CorpusTriaged,
        HostMessage::StateRequest,
    ];
    for message in messages {
        let bytes = encode(&message).unwrap();
        assert_eq!(decode::<HostMessage>(&bytes).unwrap(), message);
    }
}

#[test]
fn every_executor_variant_survives_the_codec() {
    let messages = vec![
        ExecutorMessage::ConnectRequest(
            ConnectRequest::new("", "arm64").with_revisions("abc", ""),
        ),
        ExecutorMessage::InfoReply(InfoReply {
            error: String::new(),
            features: vec![FeatureInfo::unavailable(Feature::SWAP, "no swap device")],
            files: vec![FileInfo {
                name: "/etc/hostname".into(),
                exists: true,
                error: String::new(),
                data: Vec::new(),
            }],
            globs: vec![GlobInfo {
                name: "/dev/*".into(),
                files: Vec::new(),
            }],
        }),
        ExecutorMessage::Executing(ExecutingMessage::default()),
        ExecutorMessage::ExecResult(ExecResult {
            info: Some(ProgInfo {
                calls: vec![CallInfo {
                    flags: CallFlag::from_bits_retain(0x80),
                    error: -14,
                    comps: vec![Comparison::new(0, u64::MAX)],
                    ..Default::default()
                }],
                extra: Some(CallInfo::default()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ExecutorMessage::ExecResult(ExecResult::rejected(3, "all worker slots are busy")),
        ExecutorMessage::StateResult(StateResult::default()),
    ];
    for message in messages {
        let bytes = encode(&message).unwrap();
        assert_eq!(decode::<ExecutorMessage>(&bytes).unwrap(), message);
    }
}

#[test]
fn unknown_tag_is_distinct_from_malformed() {
    let mut bytes = encode(&HostMessage::StateRequest).unwrap();
    bytes[4..8].copy_from_slice(&0xdead_u32.to_le_bytes());
    assert!(matches!(
        decode::<HostMessage>(&bytes),
        Err(FuzzlinkError::UnknownVariant { tag: 0xdead, .. })
    ));

    let bytes = encode(&HostMessage::StateRequest).unwrap();
    let mut trailing = bytes.clone();
    trailing.push(0);
    assert!(matches!(
        decode::<HostMessage>(&trailing),
        Err(FuzzlinkError::MalformedFrame(_))
    ));
}

#[test]
fn proc_identity_follows_environment() {
    let mut state = ExecutorState::new(1);
    let base = ExecOpts {
        env_flags: ExecEnv::SIGNAL | ExecEnv::SANDBOX_NONE,
        exec_flags: ExecFlag::COLLECT_SIGNAL,
        sandbox_arg: 0,
    };
    let run = |state: &mut ExecutorState, id: u64, opts: ExecOpts| {
        let a = state.assign(&ExecRequest::new(id, Vec::new()).with_opts(opts)).unwrap();
        state.complete(a.slot, id).unwrap();
        a.proc_id
    };

    let first = run(&mut state, 1, base);
    let flags_only = run(
        &mut state,
        2,
        ExecOpts {
            exec_flags: ExecFlag::COLLECT_COVER | ExecFlag::COLLECT_COMPS,
            ..base
        },
    );
    assert_eq!(first, flags_only);

    let new_sandbox = run(
        &mut state,
        3,
        ExecOpts {
            sandbox_arg: 3,
            ..base
        },
    );
    assert_ne!(new_sandbox, first);
    let new_env = run(
        &mut state,
        4,
        ExecOpts {
            env_flags: ExecEnv::SIGNAL | ExecEnv::SANDBOX_SETUID,
            sandbox_arg: 3,
            ..base
        },
    );
    assert_ne!(new_env, new_sandbox);
}

// ── Streaming over mock I/O ──────────────────────────────────────

#[tokio::test]
async fn framed_read_reassembles_split_frames() {
    let first = encode(&ExecutorMessage::Executing(ExecutingMessage {
        id: 1,
        proc_id: 2,
        attempt: 0,
        wait_duration_ns: 3,
    }))
    .unwrap();
    let second = encode(&ExecutorMessage::StateResult(StateResult {
        data: br#"{"executed":0}"#.to_vec(),
    }))
    .unwrap();

    let mock = tokio_test::io::Builder::new()
        .read(&first[..7])
        .read(&first[7..])
        .read(&second[..second.len() - 2])
        .read(&second[second.len() - 2..])
        .build();
    let mut reader = FramedRead::new(mock, HostCodec::new());

    assert!(matches!(
        reader.next().await,
        Some(Ok(ExecutorMessage::Executing(m))) if m.id == 1
    ));
    assert!(matches!(
        reader.next().await,
        Some(Ok(ExecutorMessage::StateResult(_)))
    ));
    assert!(reader.next().await.is_none());
}

#[tokio::test]
async fn framed_write_emits_exact_frames() {
    let message = HostMessage::SignalUpdate(SignalUpdate {
        new_max: vec![1, 2, 3],
    });
    let expected = encode(&message).unwrap();
    let mock = tokio_test::io::Builder::new().write(&expected).build();
    let mut writer = FramedWrite::new(mock, HostCodec::new());
    writer.send(message).await.unwrap();
}

//! Per-session state shared by host and executor.
//!
//! `SessionPhase` models the channel lifecycle with validated transitions
//! that return `Result` instead of panicking. `Session` is the negotiated
//! configuration; it is a plain value handed by reference to every
//! handler, so several sessions can live in one process without locks.

use std::time::{Duration, Instant};

use crate::error::FuzzlinkError;
use crate::flags::{ExecEnv, ExecFlag, Feature};
use crate::protocol::{ConnectReply, ConnectRequest, ExecOpts, FeatureInfo, InfoReply};

// ── SessionPhase ─────────────────────────────────────────────────

/// The current phase of a host/executor channel.
///
/// ```text
///  Disconnected ──► Handshaking ──► Configuring ──► Ready
///                        │               │            │
///                        ▼               ▼            ▼
///                        └──────────► Closed ◄────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// No channel yet.
    #[default]
    Disconnected,

    /// Channel is up; waiting for ConnectRequest/ConnectReply.
    Handshaking,

    /// Handshake done; feature setup and InfoReply pending.
    Configuring,

    /// Programs may be executed.
    Ready {
        /// When the session became ready.
        since: Instant,
    },

    /// Channel closed; terminal.
    Closed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Handshaking => write!(f, "Handshaking"),
            Self::Configuring => write!(f, "Configuring"),
            Self::Ready { .. } => write!(f, "Ready"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

impl SessionPhase {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// How long the session has been ready; `None` in any other phase.
    pub fn ready_duration(&self) -> Option<Duration> {
        match self {
            Self::Ready { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Disconnected`.
    pub fn begin_handshake(&mut self) -> Result<(), FuzzlinkError> {
        match self {
            Self::Disconnected => {
                *self = Self::Handshaking;
                Ok(())
            }
            _ => Err(FuzzlinkError::ProtocolViolation(
                "cannot handshake: channel already in use",
            )),
        }
    }

    /// Valid from: `Handshaking`.
    pub fn complete_handshake(&mut self) -> Result<(), FuzzlinkError> {
        match self {
            Self::Handshaking => {
                *self = Self::Configuring;
                Ok(())
            }
            _ => Err(FuzzlinkError::ProtocolViolation(
                "handshake message outside the handshake phase",
            )),
        }
    }

    /// Valid from: `Configuring`.
    pub fn complete_setup(&mut self) -> Result<(), FuzzlinkError> {
        match self {
            Self::Configuring => {
                *self = Self::Ready {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(FuzzlinkError::ProtocolViolation(
                "info exchange outside the configuring phase",
            )),
        }
    }

    /// Require `Ready` before execution traffic.
    pub fn ensure_ready(&self) -> Result<(), FuzzlinkError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(FuzzlinkError::ProtocolViolation(
                "execution traffic before the session is ready",
            ))
        }
    }

    /// Move to `Closed` from anywhere.
    pub fn close(&mut self) {
        *self = Self::Closed;
    }
}

// ── Session ──────────────────────────────────────────────────────

/// Negotiated configuration of one host/executor pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    executor: ConnectRequest,
    config: ConnectReply,
    available: Feature,
    reports: Vec<FeatureInfo>,
}

impl Session {
    /// Start a session from a completed handshake. Until `apply_info`
    /// runs, no feature counts as available.
    pub fn new(executor: ConnectRequest, config: ConnectReply) -> Self {
        Self {
            executor,
            config,
            available: Feature::empty(),
            reports: Vec::new(),
        }
    }

    pub fn executor(&self) -> &ConnectRequest {
        &self.executor
    }

    pub fn config(&self) -> &ConnectReply {
        &self.config
    }

    pub fn requested_features(&self) -> Feature {
        self.config.features
    }

    /// Requested features whose setup succeeded.
    pub fn available_features(&self) -> Feature {
        self.available
    }

    pub fn is_available(&self, feature: Feature) -> bool {
        self.available.contains(feature)
    }

    /// Requested features that are not usable, with the reason.
    pub fn unavailable_features(&self) -> Vec<(Feature, String)> {
        self.config
            .features
            .iter()
            .filter(|f| !self.available.contains(*f))
            .map(|f| {
                let reason = self
                    .reports
                    .iter()
                    .find(|r| r.id == f)
                    .map(|r| r.reason.clone())
                    .unwrap_or_else(|| "not reported by executor".to_string());
                (f, reason)
            })
            .collect()
    }

    /// Apply the executor's feature report.
    ///
    /// A non-empty top-level error is fatal. Individual feature failures
    /// only make that feature unavailable. Reports for features that were
    /// never requested are ignored.
    pub fn apply_info(&mut self, info: &InfoReply) -> Result<(), FuzzlinkError> {
        if !info.error.is_empty() {
            return Err(FuzzlinkError::SetupFailed(info.error.clone()));
        }
        self.available = info.available_features() & self.config.features;
        self.reports = info.features.clone();
        Ok(())
    }

    /// Wall-clock budget for one program, including slowdown.
    pub fn program_timeout(&self) -> Duration {
        self.config.program_timeout()
    }

    /// Default options for programs run under `sandbox`.
    ///
    /// Fails if `sandbox` is not a single sandbox feature that is available
    /// in this session.
    pub fn exec_opts(&self, sandbox: Feature) -> Result<ExecOpts, FuzzlinkError> {
        let sandbox_env = match sandbox {
            s if s == Feature::SANDBOX_NONE => ExecEnv::SANDBOX_NONE,
            s if s == Feature::SANDBOX_SETUID => ExecEnv::SANDBOX_SETUID,
            s if s == Feature::SANDBOX_NAMESPACE => ExecEnv::SANDBOX_NAMESPACE,
            s if s == Feature::SANDBOX_ANDROID => ExecEnv::SANDBOX_ANDROID,
            _ => return Err(FuzzlinkError::Other(format!("{sandbox:?} is not a sandbox"))),
        };
        if !self.is_available(sandbox) {
            return Err(FuzzlinkError::Other(format!(
                "sandbox {} is unavailable in this session",
                sandbox.names()
            )));
        }

        let mut env_flags = (self.available - Feature::SANDBOXES).exec_env() | sandbox_env;
        if self.config.debug {
            env_flags |= ExecEnv::DEBUG;
        }
        let mut exec_flags = ExecFlag::DEDUP_COVER;
        if self.is_available(Feature::COVERAGE) {
            exec_flags |= ExecFlag::COLLECT_SIGNAL;
        }
        Ok(ExecOpts {
            env_flags,
            exec_flags,
            sandbox_arg: 0,
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn session(features: Feature) -> Session {
        Session::new(
            ConnectRequest::new("vm-0", "amd64"),
            ConnectReply {
                features,
                ..Default::default()
            },
        )
    }

    #[test]
    fn happy_path_lifecycle() {
        let mut phase = SessionPhase::default();
        phase.begin_handshake().unwrap();
        assert_eq!(phase, SessionPhase::Handshaking);
        phase.complete_handshake().unwrap();
        assert_eq!(phase, SessionPhase::Configuring);
        assert!(phase.ensure_ready().is_err());
        phase.complete_setup().unwrap();
        assert!(phase.is_ready());
        assert!(phase.ready_duration().is_some());
        phase.close();
        assert!(phase.is_closed());
    }

    #[test]
    fn invalid_transitions() {
        let mut phase = SessionPhase::Disconnected;
        assert!(phase.complete_handshake().is_err());
        assert!(phase.complete_setup().is_err());

        let mut phase = SessionPhase::Ready {
            since: Instant::now(),
        };
        assert!(phase.begin_handshake().is_err());
    }

    #[test]
    fn display_format() {
        assert_eq!(SessionPhase::Configuring.to_string(), "Configuring");
        assert_eq!(
            SessionPhase::Ready {
                since: Instant::now()
            }
            .to_string(),
            "Ready"
        );
    }

    #[test]
    fn partial_feature_failure_is_not_fatal() {
        let mut s = session(Feature::COVERAGE | Feature::SANDBOX_NONE | Feature::FAULT);
        let info = InfoReply {
            features: vec![
                FeatureInfo::available(Feature::COVERAGE, true),
                FeatureInfo::unavailable(Feature::SANDBOX_NONE, "not supported in this kernel build"),
                FeatureInfo::available(Feature::LEAK, false),
            ],
            ..Default::default()
        };
        s.apply_info(&info).unwrap();

        assert_eq!(s.available_features(), Feature::COVERAGE);
        let missing = s.unavailable_features();
        assert_eq!(missing.len(), 2);
        assert_eq!(
            missing[0],
            (
                Feature::SANDBOX_NONE,
                "not supported in this kernel build".to_string()
            )
        );
        assert_eq!(missing[1].1, "not reported by executor");
    }

    #[test]
    fn top_level_error_is_fatal() {
        let mut s = session(Feature::COVERAGE);
        let info = InfoReply {
            error: "kcov: permission denied".into(),
            ..Default::default()
        };
        assert!(matches!(
            s.apply_info(&info),
            Err(FuzzlinkError::SetupFailed(_))
        ));
    }

    #[test]
    fn exec_opts_require_available_sandbox() {
        let mut s = session(Feature::COVERAGE | Feature::SANDBOX_NONE | Feature::SANDBOX_SETUID);
        s.apply_info(&InfoReply {
            features: vec![
                FeatureInfo::available(Feature::COVERAGE, true),
                FeatureInfo::unavailable(Feature::SANDBOX_NONE, "nope"),
                FeatureInfo::available(Feature::SANDBOX_SETUID, false),
            ],
            ..Default::default()
        })
        .unwrap();

        assert!(s.exec_opts(Feature::SANDBOX_NONE).is_err());
        assert!(s.exec_opts(Feature::COVERAGE).is_err());

        let opts = s.exec_opts(Feature::SANDBOX_SETUID).unwrap();
        assert!(opts.env_flags.contains(ExecEnv::SANDBOX_SETUID | ExecEnv::SIGNAL));
        assert!(!opts.env_flags.contains(ExecEnv::SANDBOX_NONE));
        assert!(opts.exec_flags.contains(ExecFlag::COLLECT_SIGNAL));
    }
}

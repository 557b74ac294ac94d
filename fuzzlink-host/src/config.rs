//! Configuration for the fuzzing host.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fuzzlink_core::{ConnectReply, ConnectRequest, Feature, FuzzlinkError};

use crate::session::SessionSettings;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub network: NetworkConfig,
    /// Build the executors must match.
    pub target: TargetConfig,
    /// Session parameters pushed to every executor.
    pub session: SessionConfig,
    pub timeouts: TimeoutConfig,
    pub corpus: CorpusConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to accept executors on.
    pub listen_addr: String,
    pub port: u16,
    /// Further executors are refused while this many sessions are open.
    pub max_sessions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub name: String,
    /// Target architecture, e.g. "amd64".
    pub arch: String,
    /// Empty to accept any revision.
    pub git_revision: String,
    pub syz_revision: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub debug: bool,
    pub cover: bool,
    pub cover_edges: bool,
    pub kernel_64_bit: bool,
    /// Worker processes per executor.
    pub procs: u32,
    pub slowdown: u32,
    pub syscall_timeout_ms: u32,
    pub program_timeout_ms: u32,
    /// Feature names to request, e.g. `["coverage", "sandbox_none"]`.
    pub features: Vec<String>,
    /// Sandbox programs run under: "none", "setuid", "namespace" or "android".
    pub sandbox: String,
    pub files: Vec<String>,
    pub globs: Vec<String>,
    pub leak_frames: Vec<String>,
    pub race_frames: Vec<String>,
    /// PCs to restrict coverage to. Empty means no filter.
    pub cover_filter: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub handshake_secs: u64,
    /// Upper bound on executor feature setup.
    pub info_secs: u64,
    /// Added to the executor's retry budget before a request counts as
    /// lost.
    pub result_grace_secs: u64,
    /// Attempts each executor makes per program; must be at least the
    /// executors' `runner.max_attempts`.
    pub executor_attempts: u32,
    /// How often outstanding requests are checked for expiry.
    pub sweep_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    /// Directory of serialized programs to run. Empty disables the driver.
    pub dir: String,
    /// Treat corpus entries as executables.
    pub binary: bool,
    /// Ask executors for captured output.
    pub return_output: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            target: TargetConfig::default(),
            session: SessionConfig::default(),
            timeouts: TimeoutConfig::default(),
            corpus: CorpusConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".into(),
            port: 7070,
            max_sessions: 64,
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            name: "fuzzlink-host".into(),
            arch: "amd64".into(),
            git_revision: String::new(),
            syz_revision: String::new(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let reply = ConnectReply::default();
        Self {
            debug: reply.debug,
            cover: reply.cover,
            cover_edges: reply.cover_edges,
            kernel_64_bit: reply.kernel_64_bit,
            procs: 4,
            slowdown: reply.slowdown,
            syscall_timeout_ms: reply.syscall_timeout_ms,
            program_timeout_ms: reply.program_timeout_ms,
            features: vec!["coverage".into(), "sandbox_none".into()],
            sandbox: "none".into(),
            files: Vec::new(),
            globs: Vec::new(),
            leak_frames: Vec::new(),
            race_frames: Vec::new(),
            cover_filter: Vec::new(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_secs: 60,
            info_secs: 300,
            result_grace_secs: 10,
            executor_attempts: 3,
            sweep_ms: 1_000,
        }
    }
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            dir: String::new(),
            binary: false,
            return_output: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl HostConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file.
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.network.listen_addr, self.network.port)
    }

    pub fn corpus_dir(&self) -> Option<PathBuf> {
        (!self.corpus.dir.is_empty()).then(|| PathBuf::from(&self.corpus.dir))
    }

    /// The sandbox feature programs run under.
    pub fn sandbox(&self) -> Result<Feature, FuzzlinkError> {
        let feature = Feature::from_names(&[format!("sandbox_{}", self.session.sandbox)])?;
        if Feature::SANDBOXES.contains(feature) {
            Ok(feature)
        } else {
            Err(FuzzlinkError::Other(format!(
                "unknown sandbox {:?}",
                self.session.sandbox
            )))
        }
    }

    /// Per-session parameters derived from this configuration.
    pub fn to_session_settings(&self) -> Result<SessionSettings, FuzzlinkError> {
        let s = &self.session;
        let features = Feature::from_names(&s.features)?;
        let reply = ConnectReply {
            debug: s.debug,
            cover: s.cover,
            cover_edges: s.cover_edges,
            kernel_64_bit: s.kernel_64_bit,
            procs: s.procs.max(1),
            slowdown: s.slowdown.max(1),
            syscall_timeout_ms: s.syscall_timeout_ms,
            program_timeout_ms: s.program_timeout_ms,
            leak_frames: s.leak_frames.clone(),
            race_frames: s.race_frames.clone(),
            features,
            files: s.files.clone(),
            globs: s.globs.clone(),
        };
        let t = &self.target;
        Ok(SessionSettings {
            host_build: ConnectRequest::new(&t.name, &t.arch)
                .with_revisions(&t.git_revision, &t.syz_revision),
            reply,
            cover_filter: s.cover_filter.clone(),
            handshake_timeout: Duration::from_secs(self.timeouts.handshake_secs),
            info_timeout: Duration::from_secs(self.timeouts.info_secs),
            result_grace: Duration::from_secs(self.timeouts.result_grace_secs),
            executor_attempts: self.timeouts.executor_attempts.max(1),
            sweep_interval: Duration::from_millis(self.timeouts.sweep_ms.max(10)),
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────

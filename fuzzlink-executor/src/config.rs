//! Configuration for the fuzzing executor.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fuzzlink_core::{ConnectRequest, ConnectionInfo, Feature, FuzzlinkError};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub network: NetworkConfig,
    pub executor: IdentityConfig,
    pub features: FeaturesConfig,
    pub runner: RunnerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host to connect to.
    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
    /// Bound on waiting for each setup reply from the host.
    pub handshake_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub name: String,
    pub arch: String,
    pub git_revision: String,
    pub syz_revision: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    /// Features this machine supports. Anything else the host asks for is
    /// reported unavailable.
    pub supported: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Program that reads a serialized program on stdin. Binary programs
    /// are run directly when empty, or passed as an argument otherwise.
    pub interpreter: String,
    /// Runs per program before a worker crash is reported.
    pub max_attempts: u32,
    /// Relaunch a worker after this many programs once the corpus is
    /// triaged. 0 disables periodic restarts.
    pub restart_every: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 7070,
            connect_timeout_secs: 30,
            handshake_timeout_secs: 60,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: "executor-0".into(),
            arch: "amd64".into(),
            git_revision: String::new(),
            syz_revision: String::new(),
        }
    }
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            supported: vec!["coverage".into(), "sandbox_none".into()],
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interpreter: String::new(),
            max_attempts: 3,
            restart_every: 0,
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

impl ExecutorConfig {
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

    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    pub fn server(&self) -> ConnectionInfo {
        ConnectionInfo::new(&self.network.host, self.network.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.network.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.network.handshake_timeout_secs)
    }

    /// The `ConnectRequest` this executor opens every session with.
    pub fn hello(&self) -> ConnectRequest {
        let id = &self.executor;
        ConnectRequest::new(&id.name, &id.arch).with_revisions(&id.git_revision, &id.syz_revision)
    }

    pub fn supported_features(&self) -> Result<Feature, FuzzlinkError> {
        Feature::from_names(&self.features.supported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let text = toml::to_string_pretty(&ExecutorConfig::default()).unwrap();
        let back: ExecutorConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.runner.max_attempts, 3);
        assert_eq!(back.server().to_string(), "127.0.0.1:7070");
    }

    #[test]
    fn hello_carries_identity() {
        let cfg: ExecutorConfig = toml::from_str(
            r#"
            [executor]
            name = "vm-3"
            arch = "arm64"
            git_revision = "abc"
            "#,
        )
        .unwrap();
        let hello = cfg.hello();
        assert_eq!(hello.name, "vm-3");
        assert_eq!(hello.arch, "arm64");
        assert_eq!(hello.git_revision, "abc");
        assert!(hello.syz_revision.is_empty());
    }

    #[test]
    fn supported_features_parse() {
        let mut cfg = ExecutorConfig::default();
        assert_eq!(
            cfg.supported_features().unwrap(),
            Feature::COVERAGE | Feature::SANDBOX_NONE
        );
        cfg.features.supported.push("teleport".into());
        assert!(cfg.supported_features().is_err());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = ExecutorConfig::load(Path::new("/nonexistent/fuzzlink-executor.toml"));
        assert_eq!(cfg.network.port, 7070);
    }
}

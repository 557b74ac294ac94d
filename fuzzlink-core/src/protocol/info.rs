//! Feature and environment report sent once feature setup finishes.
//!
//! # Wire Protocol
//!
//! ```text
//! Executor ──[InfoReply]───► Host
//!   per-feature setup outcome, requested files, expanded globs
//!
//! Host ──────[CoverFilter]─► Executor
//!   allow-list of coverage addresses (a reply, never requested)
//! ```

use serde::{Deserialize, Serialize};

use crate::flags::Feature;

/// Setup outcome for one feature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeatureInfo {
    pub id: Feature,
    /// The feature needed a one-time setup step on this executor.
    pub need_setup: bool,
    /// Why the feature is unavailable; empty means available.
    pub reason: String,
}

impl FeatureInfo {
    pub fn available(id: Feature, need_setup: bool) -> Self {
        Self {
            id,
            need_setup,
            reason: String::new(),
        }
    }

    pub fn unavailable(id: Feature, reason: impl Into<String>) -> Self {
        Self {
            id,
            need_setup: false,
            reason: reason.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.reason.is_empty()
    }
}

/// Contents of one requested file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FileInfo {
    pub name: String,
    pub exists: bool,
    /// Read error other than "does not exist".
    pub error: String,
    pub data: Vec<u8>,
}

/// Expansion of one requested glob pattern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct GlobInfo {
    pub name: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct InfoReply {
    /// Non-empty when setup failed so badly that the session is useless.
    pub error: String,
    pub features: Vec<FeatureInfo>,
    pub files: Vec<FileInfo>,
    pub globs: Vec<GlobInfo>,
}

impl InfoReply {
    /// Union of all features whose setup succeeded.
    pub fn available_features(&self) -> Feature {
        self.features
            .iter()
            .filter(|f| f.is_available())
            .fold(Feature::empty(), |acc, f| acc | f.id)
    }

    /// Features that were reported and failed, with their reasons.
    pub fn unavailable_features(&self) -> impl Iterator<Item = &FeatureInfo> {
        self.features.iter().filter(|f| !f.is_available())
    }

    pub fn file(&self, name: &str) -> Option<&FileInfo> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn glob(&self, name: &str) -> Option<&GlobInfo> {
        self.globs.iter().find(|g| g.name == name)
    }
}

/// Coverage allow-list computed by the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CoverFilter {
    pub pcs: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_features_skip_failures() {
        let info = InfoReply {
            features: vec![
                FeatureInfo::available(Feature::COVERAGE, true),
                FeatureInfo::unavailable(
                    Feature::SANDBOX_NONE,
                    "not supported in this kernel build",
                ),
            ],
            ..Default::default()
        };
        assert_eq!(info.available_features(), Feature::COVERAGE);
        let failed: Vec<_> = info.unavailable_features().map(|f| f.id).collect();
        assert_eq!(failed, vec![Feature::SANDBOX_NONE]);
    }

    #[test]
    fn lookup_file_and_glob() {
        let info = InfoReply {
            files: vec![FileInfo {
                name: "/proc/version".into(),
                exists: true,
                error: String::new(),
                data: b"Linux".to_vec(),
            }],
            globs: vec![GlobInfo {
                name: "/dev/tty*".into(),
                files: vec!["/dev/tty0".into()],
            }],
            ..Default::default()
        };
        assert_eq!(info.file("/proc/version").unwrap().data, b"Linux");
        assert!(info.file("/nope").is_none());
        assert_eq!(info.glob("/dev/tty*").unwrap().files.len(), 1);
    }
}

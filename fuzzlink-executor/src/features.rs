//! Feature setup and the file/glob report sent in `InfoReply`.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use globset::{GlobBuilder, GlobMatcher};
use tracing::{debug, warn};
use walkdir::WalkDir;

use fuzzlink_core::{ConnectReply, Feature, FeatureInfo, FileInfo, GlobInfo, InfoReply};

/// Sets up one requested feature on this machine.
///
/// Failing to set up a feature is not an error: the reason travels back to
/// the host in `FeatureInfo::reason` and the session goes on without it.
#[async_trait]
pub trait FeatureProbe: Send + Sync {
    async fn setup(&self, feature: Feature) -> FeatureInfo;

    /// Machine-wide setup problem that makes the session useless.
    async fn check_machine(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Reports a fixed set of features as available.
#[derive(Debug, Clone)]
pub struct StaticProbe {
    supported: Feature,
}

impl StaticProbe {
    pub fn new(supported: Feature) -> Self {
        Self { supported }
    }
}

#[async_trait]
impl FeatureProbe for StaticProbe {
    async fn setup(&self, feature: Feature) -> FeatureInfo {
        if feature.bits() & !Feature::all().bits() != 0 {
            return FeatureInfo::unavailable(feature, "unknown feature");
        }
        if self.supported.contains(feature) {
            // Coverage needs the per-process kcov setup; the others are
            // plain capability checks.
            FeatureInfo::available(feature, feature.intersects(Feature::COVERAGE | Feature::COMPARISONS))
        } else {
            FeatureInfo::unavailable(feature, "not supported on this machine")
        }
    }
}

/// Run feature setup and collect everything the host asked for.
pub async fn collect_info(probe: &dyn FeatureProbe, reply: &ConnectReply) -> InfoReply {
    if let Err(error) = probe.check_machine().await {
        warn!(%error, "machine setup failed");
        return InfoReply {
            error,
            ..Default::default()
        };
    }

    let mut features = Vec::new();
    for feature in reply.features.iter() {
        let info = probe.setup(feature).await;
        if !info.is_available() {
            debug!(feature = %feature.names(), reason = %info.reason, "feature unavailable");
        }
        features.push(info);
    }

    let files = reply.files.iter().map(|name| read_file(name)).collect();
    let globs = reply
        .globs
        .iter()
        .map(|pattern| GlobInfo {
            name: pattern.clone(),
            files: expand_glob(pattern).unwrap_or_else(|e| {
                warn!(%pattern, error = %e, "bad glob");
                Vec::new()
            }),
        })
        .collect();

    InfoReply {
        error: String::new(),
        features,
        files,
        globs,
    }
}

/// Read one file for the host. A missing file is reported, not an error.
pub fn read_file(name: &str) -> FileInfo {
    match std::fs::read(name) {
        Ok(data) => FileInfo {
            name: name.to_string(),
            exists: true,
            error: String::new(),
            data,
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileInfo {
            name: name.to_string(),
            exists: false,
            error: String::new(),
            data: Vec::new(),
        },
        Err(e) => FileInfo {
            name: name.to_string(),
            exists: true,
            error: e.to_string(),
            data: Vec::new(),
        },
    }
}

/// Expand `pattern` against the filesystem; matches are sorted.
///
/// `*` never crosses a path separator, `**` does.
pub fn expand_glob(pattern: &str) -> Result<Vec<String>, globset::Error> {
    let matcher: GlobMatcher = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()?
        .compile_matcher();
    let (root, depth) = walk_root(pattern);
    let mut walk = WalkDir::new(&root).follow_links(false).min_depth(1);
    if let Some(depth) = depth {
        walk = walk.max_depth(depth);
    }
    let mut files: Vec<String> = walk
        .into_iter()
        .flatten()
        .map(|entry| entry.into_path())
        .filter(|path| matcher.is_match(path))
        .map(|path| path.display().to_string())
        .collect();
    files.sort();
    Ok(files)
}

/// The literal directory a glob starts in, and how deep below it matches
/// can be (`None` with `**`).
fn walk_root(pattern: &str) -> (PathBuf, Option<usize>) {
    let is_meta = |s: &str| s.contains(['*', '?', '[', '{']);
    let mut root = PathBuf::new();
    let mut rest = 0;
    let mut unbounded = false;
    let mut in_pattern = false;
    for comp in Path::new(pattern).components() {
        let text = comp.as_os_str().to_string_lossy();
        if !in_pattern && !is_meta(&text) {
            root.push(comp);
            continue;
        }
        in_pattern = true;
        if matches!(comp, Component::Normal(_)) {
            rest += 1;
        }
        if text.contains("**") {
            unbounded = true;
        }
    }
    if !in_pattern {
        // A literal path: it matches itself.
        let parent = root.parent().map(Path::to_path_buf).unwrap_or_default();
        return (non_empty(parent), Some(1));
    }
    (non_empty(root), (!unbounded).then_some(rest))
}

fn non_empty(p: PathBuf) -> PathBuf {
    if p.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        p
    }
}

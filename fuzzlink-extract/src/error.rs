//! Error type for constant extraction.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unknown arch {0}")]
    UnknownArch(String),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: {msg}")]
    Parse {
        path: PathBuf,
        line: usize,
        msg: String,
    },

    /// The probe program did not compile; carries the compiler's output.
    #[error("failed to compile constant probe with {compiler}:\n{stderr}")]
    Compile { compiler: String, stderr: String },

    #[error("constant probe failed: {0}")]
    Probe(String),

    #[error("constant probe returned {got} values, expected {expected}")]
    ValueCount { expected: usize, got: usize },
}

impl ExtractError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

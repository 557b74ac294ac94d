//! Out-of-band session control.
//!
//! ```text
//! Host ──────[SignalUpdate]──► Executor   fire-and-forget
//! Host ──────[CorpusTriaged]─► Executor   level-triggered, idempotent
//! Host ──────[StateRequest]──► Executor
//! Executor ──[StateResult]───► Host       always answered, maybe partial
//! ```

use serde::{Deserialize, Serialize};

/// Newly discovered maximum signal. Executors that miss one are merely
/// less efficient, never out of sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SignalUpdate {
    pub new_max: Vec<u64>,
}

/// Diagnostic snapshot of executor state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateResult {
    /// JSON-encoded snapshot; see the executor's snapshot type.
    pub data: Vec<u8>,
}

impl StateResult {
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            data: serde_json::to_vec(value)?,
        })
    }

    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }
}

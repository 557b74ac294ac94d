//! Folding per-thread feedback into one program result.
//!
//! A program may fan out to several worker threads. Per-call feedback is
//! placed positionally into `ProgInfo::calls`; feedback from background
//! threads that cannot be attributed to a call lands in `extra_raw` and
//! is folded into the single `extra` entry before the result leaves the
//! executor.
//!
//! Folding rules:
//! - cover: concatenated, deduplicated iff `ExecFlag::DEDUP_COVER`
//! - signal: set union
//! - comparisons: concatenated as-is; the same operand pair seen at a
//!   different program point is still informative
//!
//! Every fold keeps first-encounter order, so the output is a pure
//! function of the input.

use std::collections::HashSet;

use tracing::warn;

use crate::flags::{CallFlag, ExecFlag};
use crate::protocol::{CallInfo, ProgInfo};

/// Drop repeated values, keeping the first occurrence of each.
pub fn dedup_in_order(values: &mut Vec<u64>) {
    let mut seen = HashSet::with_capacity(values.len());
    values.retain(|v| seen.insert(*v));
}

/// Merge raw background-thread entries into one `CallInfo`.
///
/// Pure: the same `raw` and `dedup` always give the same result.
pub fn fold_extra(raw: &[CallInfo], dedup: bool) -> CallInfo {
    let mut merged = CallInfo::default();
    let mut signal_seen = HashSet::new();
    for entry in raw {
        merged.flags |= entry.flags;
        if merged.error == 0 {
            merged.error = entry.error;
        }
        merged.cover.extend_from_slice(&entry.cover);
        for &s in &entry.signal {
            if signal_seen.insert(s) {
                merged.signal.push(s);
            }
        }
        merged.comps.extend_from_slice(&entry.comps);
    }
    if dedup {
        dedup_in_order(&mut merged.cover);
    }
    merged
}

impl ProgInfo {
    /// Fold `extra_raw` into `extra` and clear it.
    ///
    /// Idempotent: with nothing left in `extra_raw` this is a no-op.
    pub fn merge_extra(&mut self, flags: ExecFlag) {
        if self.extra_raw.is_empty() {
            return;
        }
        let raw = std::mem::take(&mut self.extra_raw);
        let dedup = flags.contains(ExecFlag::DEDUP_COVER);
        let folded = match self.extra.take() {
            // An already merged entry counts as the first raw entry.
            Some(prev) => {
                let mut all = Vec::with_capacity(raw.len() + 1);
                all.push(prev);
                all.extend(raw);
                fold_extra(&all, dedup)
            }
            None => fold_extra(&raw, dedup),
        };
        self.extra = Some(folded);
    }
}

/// Assembles a `ProgInfo` from reports arriving in any order from any
/// number of threads.
#[derive(Debug)]
pub struct ProgInfoBuilder {
    flags: ExecFlag,
    calls: Vec<CallInfo>,
    extra_raw: Vec<CallInfo>,
    dropped: usize,
}

impl ProgInfoBuilder {
    /// `ncalls` is the number of calls in the submitted program.
    pub fn new(ncalls: usize, flags: ExecFlag) -> Self {
        Self {
            flags,
            calls: vec![CallInfo::default(); ncalls],
            extra_raw: Vec::new(),
            dropped: 0,
        }
    }

    /// Record feedback for call `index`.
    ///
    /// Reports for the same call are merged. An index outside the program
    /// is a bug in the reporting thread: it asserts in debug builds and is
    /// dropped with a warning otherwise.
    pub fn record_call(&mut self, index: usize, info: CallInfo) {
        let dedup = self.dedup();
        let Some(slot) = self.calls.get_mut(index) else {
            debug_assert!(
                false,
                "call index {index} out of range for {}-call program",
                self.calls.len()
            );
            warn!(
                index,
                ncalls = self.calls.len(),
                "dropping feedback for out-of-range call"
            );
            self.dropped += 1;
            return;
        };
        if slot.flags.is_empty() && slot.is_empty() {
            *slot = info;
        } else {
            *slot = fold_extra(&[std::mem::take(slot), info], dedup);
        }
    }

    /// Record feedback that is not attributable to any call.
    pub fn record_extra(&mut self, info: CallInfo) {
        self.extra_raw.push(info);
    }

    /// Number of reports dropped for out-of-range indices.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    fn dedup(&self) -> bool {
        self.flags.contains(ExecFlag::DEDUP_COVER)
    }

    /// Finish the program: enforce dedup, fold extras, stamp timings.
    pub fn finish(self, elapsed_ns: u64, freshness: u64) -> ProgInfo {
        let dedup = self.dedup();
        let mut calls = self.calls;
        if dedup {
            for call in &mut calls {
                dedup_in_order(&mut call.cover);
            }
        }
        let mut info = ProgInfo {
            calls,
            extra_raw: self.extra_raw,
            extra: None,
            elapsed_ns,
            freshness,
        };
        info.merge_extra(self.flags);
        info
    }
}

/// Whether a call ran to completion without error.
pub fn call_succeeded(call: &CallInfo) -> bool {
    call.flags.contains(CallFlag::FINISHED) && call.error == 0
}

//! Lifecycle derivation.
//!
//! A session's lifecycle state is never persisted: it is a pure function of
//! the record and the current time, recomputed on every read. Two reads of
//! the same record at different times may therefore yield different states
//! without any write having occurred.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::SessionRecord;

/// A session with no activity for longer than this is considered stalled.
/// Strict comparison: exactly five minutes of silence is still `Working`.
pub const STALL_THRESHOLD_MS: i64 = 300_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Spawning,
    Working,
    Completed,
    Failed,
    Stalled,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Spawning => "spawning",
            LifecycleState::Working => "working",
            LifecycleState::Completed => "completed",
            LifecycleState::Failed => "failed",
            LifecycleState::Stalled => "stalled",
        }
    }

    /// States the operator is expected to act on (respawn or kill).
    pub fn needs_intervention(self) -> bool {
        matches!(self, LifecycleState::Failed | LifecycleState::Stalled)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a record into a lifecycle state. Pure and total; rule order is a
/// fixed precedence, not independent booleans: the first match wins.
pub fn derive_state(record: &SessionRecord, now: DateTime<Utc>) -> LifecycleState {
    if record.raw_status == "completed" || record.progress == 100 {
        return LifecycleState::Completed;
    }
    if is_error_status(&record.raw_status) || tokens_exhausted(record) {
        return LifecycleState::Failed;
    }
    if matches!(record.raw_status.as_str(), "spawning" | "starting") {
        return LifecycleState::Spawning;
    }
    // A record that has never reported activity counts as active right now,
    // so it cannot be stalled on first observation.
    let last_activity = record.last_activity.unwrap_or(now);
    if (now - last_activity).num_milliseconds() > STALL_THRESHOLD_MS {
        return LifecycleState::Stalled;
    }
    LifecycleState::Working
}

fn is_error_status(raw: &str) -> bool {
    matches!(raw, "failed" | "error")
}

/// `tokens_used > 0.95 * tokens_limit`, in exact integer arithmetic
/// (`used * 20 > limit * 19`). A zero limit never divides; it degenerates to
/// "failed iff any tokens were spent".
fn tokens_exhausted(record: &SessionRecord) -> bool {
    (record.tokens_used as u128) * 20 > (record.tokens_limit as u128) * 19
}

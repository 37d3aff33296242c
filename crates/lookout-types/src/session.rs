use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One worker session as observed from the control plane.
///
/// The record is the *normalized* view: wire-level field aliases and
/// defaulting live in `lookout-wire`. Lifecycle state is never stored on the
/// record; it is recomputed from these fields and the current time on every
/// read (see [`crate::status::derive_state`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Opaque stable identifier, unique across the control plane.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub task: String,
    /// Raw status string as reported, e.g. "working" / "completed" /
    /// "failed" / "starting". Kept verbatim; classification happens on read.
    pub raw_status: String,
    /// Reported completion percentage, clamped to 0..=100 on ingest.
    pub progress: u8,
    pub tokens_used: u64,
    pub tokens_limit: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// Monotonically non-decreasing per id: a stale update must never move
    /// this backward. The store enforces that on merge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(default)]
    pub priority: SessionPriority,
}

impl SessionRecord {
    /// Progress with the completed override applied: a session whose raw
    /// status is "completed" counts as 100% regardless of the reported value.
    pub fn effective_progress(&self) -> u8 {
        if self.raw_status == "completed" {
            100
        } else {
            self.progress.min(100)
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum SessionPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl Default for SessionPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl SessionPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionPriority::Critical => "critical",
            SessionPriority::High => "high",
            SessionPriority::Normal => "normal",
            SessionPriority::Low => "low",
        }
    }
}

impl fmt::Display for SessionPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionPriority {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "critical" => Ok(SessionPriority::Critical),
            "high" => Ok(SessionPriority::High),
            "normal" | "" => Ok(SessionPriority::Normal),
            "low" => Ok(SessionPriority::Low),
            other => Err(format!("Unknown priority: {other}")),
        }
    }
}

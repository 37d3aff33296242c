//! Wire-format models for the control-plane API.
//!
//! The control plane is loose about field spellings (`sessionId` vs `id`,
//! `updatedAt` vs `lastActivity`, ...) and omits fields freely. Everything
//! here deserializes leniently and normalizes into the typed
//! [`SessionRecord`] the rest of the workspace works with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lookout_types::{SessionPriority, SessionRecord};

/// Token budget assumed when the control plane does not report one.
pub const DEFAULT_TOKENS_LIMIT: u64 = 50_000;

/// Expected runtime assumed for the time-based progress estimate.
const DEFAULT_EXPECTED_DURATION_MS: i64 = 3_600_000;

/// A session record as the control plane sends it: every field optional
/// except the id, with alias spellings accepted for the fields that drifted
/// across control-plane versions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawSession {
    #[serde(alias = "sessionId")]
    pub id: String,
    #[serde(default, alias = "taskName")]
    pub name: Option<String>,
    #[serde(default, alias = "taskDescription", alias = "prompt")]
    pub task: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub progress: Option<i64>,
    #[serde(default)]
    pub tokens_used: Option<u64>,
    #[serde(default)]
    pub tokens_limit: Option<u64>,
    #[serde(default, alias = "createdAt")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, alias = "updatedAt")]
    pub last_activity: Option<DateTime<Utc>>,
    /// Expected total runtime in milliseconds; feeds the progress estimate
    /// when the control plane reports neither progress nor token usage.
    #[serde(default, alias = "expectedDurationMs")]
    pub expected_duration: Option<i64>,
    #[serde(default, alias = "workdir")]
    pub output_path: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
}

impl RawSession {
    /// Normalize into a [`SessionRecord`]. `now` anchors the time-based
    /// progress estimate so the conversion stays a pure function.
    pub fn into_record(self, now: DateTime<Utc>) -> SessionRecord {
        let raw_status = self
            .status
            .clone()
            .unwrap_or_else(|| "working".to_string());
        let progress = self.estimate_progress(now);
        SessionRecord {
            id: self.id,
            name: self.name.unwrap_or_else(|| "Unnamed Agent".to_string()),
            task: self.task.unwrap_or_else(|| "No description".to_string()),
            raw_status,
            progress,
            tokens_used: self.tokens_used.unwrap_or(0),
            tokens_limit: self.tokens_limit.unwrap_or(DEFAULT_TOKENS_LIMIT),
            start_time: self.start_time,
            last_activity: self.last_activity,
            output_path: self.output_path,
            priority: self
                .priority
                .as_deref()
                .and_then(|p| p.parse().ok())
                .unwrap_or(SessionPriority::Normal),
        }
    }

    /// Reported progress if present (clamped); otherwise estimated:
    /// completed is 100, failed is 0, then token usage capped at 90, then
    /// elapsed time against the expected duration capped at 95.
    fn estimate_progress(&self, now: DateTime<Utc>) -> u8 {
        if let Some(p) = self.progress {
            return p.clamp(0, 100) as u8;
        }
        match self.status.as_deref() {
            Some("completed") => return 100,
            Some("failed") => return 0,
            _ => {}
        }
        let used = self.tokens_used.unwrap_or(0);
        let limit = self.tokens_limit.unwrap_or(0);
        if used > 0 && limit > 0 {
            return (used.saturating_mul(100) / limit).min(90) as u8;
        }
        if let Some(start) = self.start_time {
            let expected = self
                .expected_duration
                .unwrap_or(DEFAULT_EXPECTED_DURATION_MS)
                .max(1);
            let elapsed = (now - start).num_milliseconds().max(0);
            return ((elapsed.saturating_mul(100) / expected).min(95)) as u8;
        }
        0
    }
}

/// One frame from the push channel. The control plane emits either a bare
/// updated record or a `{type, session}` envelope; both are accepted.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PushMessage {
    Envelope {
        #[serde(rename = "type")]
        kind: String,
        session: RawSession,
    },
    Bare(RawSession),
}

impl PushMessage {
    pub fn kind(&self) -> Option<&str> {
        match self {
            PushMessage::Envelope { kind, .. } => Some(kind),
            PushMessage::Bare(_) => None,
        }
    }

    pub fn into_session(self) -> RawSession {
        match self {
            PushMessage::Envelope { session, .. } => session,
            PushMessage::Bare(session) => session,
        }
    }
}

/// One line from `GET /sessions/{id}/logs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub level: String,
    pub message: String,
}

/// Body of `POST /sessions/{id}/kill`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillRequest {
    pub reason: String,
}

impl Default for KillRequest {
    fn default() -> Self {
        Self {
            reason: "Manual termination".to_string(),
        }
    }
}

//! Monitor configuration.
//!
//! Values come from the caller or from `LOOKOUT_*` environment variables;
//! a config is immutable for the lifetime of one pipeline instance.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Control-plane API base, e.g. `http://127.0.0.1:3000/api`.
    pub base_url: String,
    /// Sent as `Authorization: Bearer <token>` on every call when present.
    pub bearer_token: Option<String>,
    /// One full-poll attempt per tick.
    pub poll_interval: Duration,
    /// Open the push channel alongside polling.
    pub use_push: bool,
    /// Consecutive push reconnect failures tolerated before degrading to
    /// poll-only for the rest of this instance's lifetime.
    pub max_reconnect_attempts: u32,
    /// Per-action timeout, independent of the poll/push timers.
    pub action_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000/api".to_string(),
            bearer_token: None,
            poll_interval: Duration::from_millis(10_000),
            use_push: true,
            max_reconnect_attempts: 5,
            action_timeout: Duration::from_millis(10_000),
        }
    }
}

impl MonitorConfig {
    /// Build from `LOOKOUT_*` environment variables, defaulting anything
    /// unset. Never fails: a missing environment is just the default config.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("LOOKOUT_API_URL").unwrap_or(defaults.base_url),
            bearer_token: std::env::var("LOOKOUT_API_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
            poll_interval: env_millis("LOOKOUT_POLL_INTERVAL_MS", defaults.poll_interval),
            use_push: env_bool("LOOKOUT_USE_PUSH", defaults.use_push),
            max_reconnect_attempts: std::env::var("LOOKOUT_MAX_RECONNECT_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_reconnect_attempts),
            action_timeout: env_millis("LOOKOUT_ACTION_TIMEOUT_MS", defaults.action_timeout),
        }
    }

    /// The push channel lives at a well-known path next to the REST API.
    pub fn push_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws_base}/sessions/ws")
    }
}

fn env_millis(var: &str, default: Duration) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_bool(var: &str, default: bool) -> bool {
    match std::env::var(var) {
        Ok(v) => v == "1" || v.eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = MonitorConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(10_000));
        assert_eq!(config.action_timeout, Duration::from_millis(10_000));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert!(config.use_push);
        assert!(config.bearer_token.is_none());
    }

    #[test]
    fn push_url_swaps_scheme_and_appends_path() {
        let config = MonitorConfig {
            base_url: "http://127.0.0.1:3000/api".into(),
            ..Default::default()
        };
        assert_eq!(config.push_url(), "ws://127.0.0.1:3000/api/sessions/ws");

        let config = MonitorConfig {
            base_url: "https://ops.example.com/api/".into(),
            ..Default::default()
        };
        assert_eq!(config.push_url(), "wss://ops.example.com/api/sessions/ws");
    }
}

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    /// Poll or push network failure. Absorbed by the pipeline (retried on
    /// schedule), surfaced to callers only for direct client calls.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed payload from the control plane. Logged and dropped by the
    /// pipeline; polling is unaffected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The control plane rejected a dispatched action.
    #[error("action rejected ({status}): {message}")]
    Action { status: u16, message: String },

    /// A dispatched action did not complete within its timeout.
    #[error("action timed out after {0:?}")]
    ActionTimeout(Duration),

    /// Push reconnect attempts exhausted; the pipeline is poll-only until
    /// restarted. Raised by the push loop exactly once per pipeline
    /// instance, alongside the degraded-state transition.
    #[error("push channel abandoned after {0} failed reconnect attempts")]
    ReconnectExhausted(u32),
}

impl From<reqwest::Error> for MonitorError {
    fn from(err: reqwest::Error) -> Self {
        MonitorError::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MonitorError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        MonitorError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;

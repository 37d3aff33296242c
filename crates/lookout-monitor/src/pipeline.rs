//! The update pipeline: a poll loop that is the authoritative, self-healing
//! backstop, and an optional push loop layered on top for low-latency deltas.
//!
//! Polling never stops while the pipeline runs. The push channel reconnects
//! with exponential backoff and, once its attempts are exhausted, is
//! abandoned for the lifetime of the instance; the operator restarts the
//! pipeline to retry push.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest, http::header::AUTHORIZATION, Message,
};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use lookout_wire::PushMessage;

use crate::error::{MonitorError, Result};
use crate::events::MonitorEvent;
use crate::monitor::MonitorInner;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Polling,
    Streaming,
    Degraded,
    Stopped,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Polling => "polling",
            PipelineState::Streaming => "streaming",
            PipelineState::Degraded => "degraded",
            PipelineState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff before reconnect attempt `attempt` (1-based): `2^attempt` seconds.
pub fn reconnect_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt))
}

/// One poll per interval tick, plus out-of-band polls on demand. The first
/// poll fires immediately, not after the first interval wait.
pub(crate) async fn poll_loop(inner: Arc<MonitorInner>) {
    let mut interval = tokio::time::interval(inner.config.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = interval.tick() => {}
            _ = inner.refresh.notified() => {
                debug!("forced out-of-band reconciliation");
            }
        }
        poll_once(&inner).await;
    }
    debug!("poll loop stopped");
}

/// A single full reconciliation attempt. Failure keeps the last good
/// snapshot and never blocks the next scheduled attempt.
async fn poll_once(inner: &MonitorInner) {
    match inner.client.list_sessions().await {
        Ok(raw) => {
            let now = Utc::now();
            let records: Vec<_> = raw.into_iter().map(|r| r.into_record(now)).collect();
            let generation = inner.store.apply_full_snapshot(records);
            *inner.last_error.write() = None;
            debug!(generation, "full reconciliation applied");
        }
        Err(err) => {
            let error = err.to_string();
            warn!(%error, "session poll failed; keeping last good snapshot");
            *inner.last_error.write() = Some(error.clone());
            inner.events.publish(MonitorEvent::PollFailed { error });
        }
    }
}

pub(crate) async fn push_loop(inner: Arc<MonitorInner>) {
    let mut attempts: u32 = 0;
    loop {
        if inner.cancel.is_cancelled() {
            break;
        }
        match connect(&inner).await {
            Ok(stream) => {
                attempts = 0;
                inner.set_state(PipelineState::Streaming);
                inner.events.publish(MonitorEvent::PushConnected);
                info!(url = %inner.config.push_url(), "push channel connected");
                run_stream(&inner, stream).await;
                if inner.cancel.is_cancelled() {
                    break;
                }
                inner.set_state(PipelineState::Polling);
            }
            Err(err) => {
                warn!(error = %err, "push connect failed");
            }
        }

        attempts += 1;
        if attempts > inner.config.max_reconnect_attempts {
            // Degrade exactly once; polling carries on as the sole source.
            let exhausted = attempts - 1;
            let reason = MonitorError::ReconnectExhausted(exhausted);
            inner.set_state(PipelineState::Degraded);
            *inner.last_error.write() = Some(reason.to_string());
            warn!(error = %reason, "continuing poll-only");
            inner
                .events
                .publish(MonitorEvent::PushDegraded { attempts: exhausted });
            break;
        }

        let delay = reconnect_delay(attempts);
        debug!(attempt = attempts, ?delay, "scheduling push reconnect");
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!("push loop stopped");
}

async fn connect(inner: &MonitorInner) -> Result<WsStream> {
    let url = inner.config.push_url();
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|err| MonitorError::Transport(err.to_string()))?;
    if let Some(token) = &inner.config.bearer_token {
        let value = format!("Bearer {token}")
            .parse()
            .map_err(|_| MonitorError::Protocol("bearer token is not a valid header".into()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    let (stream, _) = connect_async(request).await?;
    Ok(stream)
}

/// Read frames until the connection drops or the pipeline is cancelled.
async fn run_stream(inner: &MonitorInner, stream: WsStream) {
    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => apply_frame(inner, &text),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    inner.events.publish(MonitorEvent::PushLost {
                        error: "connection closed".to_string(),
                    });
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "push channel read failed");
                    inner.events.publish(MonitorEvent::PushLost {
                        error: err.to_string(),
                    });
                    break;
                }
            }
        }
    }
}

/// Merge one push frame. The delta is tagged with the generation observed at
/// receive time; if a full poll lands in between, the store's fence discards
/// it rather than resurrecting superseded data.
fn apply_frame(inner: &MonitorInner, text: &str) {
    let source_generation = inner.store.generation();
    match serde_json::from_str::<PushMessage>(text) {
        Ok(message) => {
            if let Some(kind) = message.kind() {
                debug!(kind, "push frame");
            }
            let record = message.into_session().into_record(Utc::now());
            if !inner.store.apply_delta(record, source_generation) {
                debug!(source_generation, "stale push delta discarded");
            }
        }
        Err(err) => {
            // Malformed frame: drop it. The poll loop self-heals whatever
            // this frame would have told us.
            warn!(error = %err, "malformed push frame dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delays_double_from_two_seconds() {
        let delays: Vec<u64> = (1..=5).map(|a| reconnect_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32]);
    }

    #[test]
    fn reconnect_delay_saturates_instead_of_overflowing() {
        assert_eq!(reconnect_delay(200).as_secs(), u64::MAX);
    }

    #[test]
    fn state_labels_are_stable() {
        assert_eq!(PipelineState::Idle.as_str(), "idle");
        assert_eq!(PipelineState::Polling.as_str(), "polling");
        assert_eq!(PipelineState::Streaming.as_str(), "streaming");
        assert_eq!(PipelineState::Degraded.as_str(), "degraded");
        assert_eq!(PipelineState::Stopped.as_str(), "stopped");
    }
}

//! The monitor facade: owns the store, the pipeline tasks, and the action
//! dispatcher, and is the one handle a consumer (UI, CLI) needs.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use lookout_types::SessionRecord;
use lookout_wire::LogEntry;

use crate::client::ControlPlaneClient;
use crate::config::MonitorConfig;
use crate::error::Result;
use crate::events::{EventBus, MonitorEvent};
use crate::pipeline::{self, PipelineState};
use crate::store::{ReconcilingStore, Snapshot};

pub(crate) struct MonitorInner {
    pub(crate) config: MonitorConfig,
    pub(crate) client: ControlPlaneClient,
    pub(crate) store: ReconcilingStore,
    pub(crate) events: EventBus,
    pub(crate) state: RwLock<PipelineState>,
    pub(crate) last_error: RwLock<Option<String>>,
    /// Wakes the poll loop for an out-of-band reconciliation.
    pub(crate) refresh: Notify,
    pub(crate) cancel: CancellationToken,
    started: Mutex<bool>,
}

impl MonitorInner {
    pub(crate) fn set_state(&self, next: PipelineState) {
        *self.state.write() = next;
    }
}

/// Live view of, and control handle for, the sessions on one control plane.
///
/// Cloning is cheap and every clone shares the same pipeline and store.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> Self {
        let events = EventBus::new();
        let client = ControlPlaneClient::new(&config);
        let store = ReconcilingStore::new(events.clone());
        Self {
            inner: Arc::new(MonitorInner {
                config,
                client,
                store,
                events,
                state: RwLock::new(PipelineState::Idle),
                last_error: RwLock::new(None),
                refresh: Notify::new(),
                cancel: CancellationToken::new(),
                started: Mutex::new(false),
            }),
        }
    }

    /// Spawn the poll loop (and the push loop when configured). The first
    /// poll is issued immediately. Idempotent; must run inside a Tokio
    /// runtime.
    pub fn start(&self) {
        let mut started = self.inner.started.lock();
        if *started || self.inner.cancel.is_cancelled() {
            return;
        }
        *started = true;
        self.inner.set_state(PipelineState::Polling);
        tokio::spawn(pipeline::poll_loop(self.inner.clone()));
        if self.inner.config.use_push {
            tokio::spawn(pipeline::push_loop(self.inner.clone()));
        }
    }

    /// Stop the pipeline: cancels the poll timer and closes the push
    /// connection without further reconnects. The last snapshot stays
    /// readable, and in-flight actions are deliberately left to complete or
    /// time out on their own.
    pub fn stop(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.set_state(PipelineState::Stopped);
        self.inner.events.publish(MonitorEvent::Stopped);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.inner.events.subscribe()
    }

    /// The current consistent snapshot; never torn mid-merge.
    pub fn current(&self) -> Arc<Snapshot> {
        self.inner.store.current()
    }

    /// Records in stable id order.
    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.inner.store.sessions()
    }

    pub fn state(&self) -> PipelineState {
        *self.inner.state.read()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.read().clone()
    }

    /// Terminate a session. On success the poll loop reconciles immediately
    /// instead of waiting out the interval; on failure the error goes to the
    /// caller and the normal schedule resumes untouched.
    pub async fn kill(&self, id: &str, reason: Option<String>) -> Result<()> {
        self.inner.client.kill(id, reason).await?;
        self.force_refresh();
        Ok(())
    }

    /// Restart a failed or stalled session with the given configuration.
    /// Mutating, so it forces reconciliation the same way `kill` does.
    pub async fn respawn(&self, id: &str, config: Value) -> Result<()> {
        self.inner.client.respawn(id, config).await?;
        self.force_refresh();
        Ok(())
    }

    /// Read-only; does not touch the store or the pipeline.
    pub async fn logs(&self, id: &str, limit: usize) -> Result<Vec<LogEntry>> {
        self.inner.client.logs(id, limit).await
    }

    /// Read-only; the payload shape is provider-defined.
    pub async fn metrics(&self, id: &str) -> Result<Value> {
        self.inner.client.metrics(id).await
    }

    fn force_refresh(&self) {
        debug!("mutation succeeded; requesting immediate reconciliation");
        self.inner.refresh.notify_one();
    }
}

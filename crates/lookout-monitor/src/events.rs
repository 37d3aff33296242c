use tokio::sync::broadcast;

/// Pipeline notifications for the consumer (a UI, the CLI, tests).
///
/// Failures never blank the view: the last good snapshot stays readable and
/// these events carry the error/degraded indicators instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// The store accepted a mutation (full poll or push delta).
    SnapshotUpdated { generation: u64 },
    /// A scheduled or forced poll failed; the previous snapshot is intact.
    PollFailed { error: String },
    PushConnected,
    PushLost { error: String },
    /// Reconnects exhausted; poll-only from here on. Published exactly once
    /// per pipeline instance.
    PushDegraded { attempts: u32 },
    Stopped,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }

    /// Lossy by design: publishing never blocks and a slow subscriber only
    /// hurts itself.
    pub fn publish(&self, event: MonitorEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

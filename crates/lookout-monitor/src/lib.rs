//! Live session telemetry and control.
//!
//! Keeps a client-side view of the sessions on a remote control plane
//! correct and fresh: periodic full polls reconcile the world, a push
//! channel streams low-latency deltas in between, and generation fencing in
//! the store guarantees the (reorderable, duplicable) push channel can never
//! resurrect state a newer poll has corrected. Actions (kill, respawn) go
//! back to the control plane and force an immediate reconciliation so the
//! operator sees their effect without waiting out the poll interval.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod monitor;
pub mod pipeline;
pub mod store;

pub use client::ControlPlaneClient;
pub use config::MonitorConfig;
pub use error::{MonitorError, Result};
pub use events::{EventBus, MonitorEvent};
pub use monitor::Monitor;
pub use pipeline::{reconnect_delay, PipelineState};
pub use store::{ReconcilingStore, SessionEntry, Snapshot};

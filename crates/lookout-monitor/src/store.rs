//! The reconciling store.
//!
//! Two sources write here: the periodic full poll (authoritative) and the
//! push channel (incremental, may reorder or duplicate). Every full poll
//! advances a generation counter; push deltas carry the generation observed
//! when the frame arrived. A delta tagged below the current generation
//! describes a world a newer full reconciliation has already corrected and is
//! discarded, so the push channel can never resurrect superseded data.
//!
//! Mutations build a fresh [`Snapshot`] and swap the whole `Arc`, so readers
//! hold an immutable, never-torn view and need no locking of their own.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use lookout_types::SessionRecord;

use crate::events::{EventBus, MonitorEvent};

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEntry {
    pub record: SessionRecord,
    /// Generation that last wrote this entry.
    pub source_generation: u64,
}

/// Immutable view of the session set as of one generation.
///
/// Entries are keyed in a `BTreeMap`, so iteration order is stable by id and
/// independent of network arrival order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Snapshot {
    generation: u64,
    entries: BTreeMap<String, SessionEntry>,
}

impl Snapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, id: &str) -> Option<&SessionEntry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &SessionEntry> {
        self.entries.values()
    }

    /// Records in stable id order.
    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.entries.values().map(|e| e.record.clone()).collect()
    }
}

pub struct ReconcilingStore {
    current: RwLock<Arc<Snapshot>>,
    events: EventBus,
}

impl ReconcilingStore {
    pub fn new(events: EventBus) -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::default())),
            events,
        }
    }

    /// The live snapshot. Cheap (`Arc` clone); the returned view never
    /// changes under the caller.
    pub fn current(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.current().sessions()
    }

    /// Replace the whole view with an authoritative full poll. Ids absent
    /// from `records` are dropped: deletion-by-omission is only meaningful
    /// against a complete listing, which is exactly what a full poll is.
    ///
    /// Returns the new generation.
    pub fn apply_full_snapshot(&self, records: Vec<SessionRecord>) -> u64 {
        let mut guard = self.current.write();
        let previous = guard.clone();
        let generation = previous.generation + 1;

        let mut entries = BTreeMap::new();
        for mut record in records {
            // last_activity is monotone per id even across reconciliations;
            // a poll that raced behind an already-applied delta must not
            // rewind it.
            if let Some(existing) = previous.get(&record.id) {
                record.last_activity =
                    max_activity(existing.record.last_activity, record.last_activity);
            }
            entries.insert(
                record.id.clone(),
                SessionEntry {
                    record,
                    source_generation: generation,
                },
            );
        }

        *guard = Arc::new(Snapshot {
            generation,
            entries,
        });
        drop(guard);

        self.events
            .publish(MonitorEvent::SnapshotUpdated { generation });
        generation
    }

    /// Merge one pushed record, tagged with the generation in effect when the
    /// frame arrived. Stale tags (below the current generation) are discarded.
    ///
    /// Returns `true` if the delta was applied.
    pub fn apply_delta(&self, mut record: SessionRecord, source_generation: u64) -> bool {
        let mut guard = self.current.write();
        let snapshot = guard.clone();
        if source_generation < snapshot.generation {
            return false;
        }

        let mut entries = snapshot.entries.clone();
        if let Some(existing) = entries.get(&record.id) {
            record.last_activity =
                max_activity(existing.record.last_activity, record.last_activity);
        }
        entries.insert(
            record.id.clone(),
            SessionEntry {
                record,
                source_generation,
            },
        );

        let generation = snapshot.generation;
        *guard = Arc::new(Snapshot {
            generation,
            entries,
        });
        drop(guard);

        self.events
            .publish(MonitorEvent::SnapshotUpdated { generation });
        true
    }
}

fn max_activity(
    old: Option<chrono::DateTime<chrono::Utc>>,
    new: Option<chrono::DateTime<chrono::Utc>>,
) -> Option<chrono::DateTime<chrono::Utc>> {
    match (old, new) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

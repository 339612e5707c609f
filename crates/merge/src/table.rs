//! Canonical per-topic tables.
//!
//! Each table is an `Arc<HashMap>` behind a lock. Writers mutate through
//! `Arc::make_mut`, so a snapshot taken by a reader is never changed under
//! it: the writer clones the map if any snapshot is still alive.

use common::stream::{StreamEvent, StreamPayload, Topic};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Where a canonical record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    Baseline,
    Stream,
}

/// Most recently accepted state for one key of a topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalRecord {
    pub entity_id: String,
    pub payload: StreamPayload,
    /// Event-origin time, or the fetch time for baseline records.
    pub timestamp: i64,
    pub source: RecordSource,
    /// Local time the record was written.
    pub updated_at: i64,
}

impl CanonicalRecord {
    pub fn from_event(event: StreamEvent, source: RecordSource, updated_at: i64) -> Self {
        Self {
            entity_id: event.entity_id,
            payload: event.payload,
            timestamp: event.timestamp,
            source,
            updated_at,
        }
    }
}

/// Outcome of offering an event to a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Insert,
    Replace,
    /// Older than the stored record.
    Stale,
    /// Same timestamp as the stored record.
    Duplicate,
}

impl Verdict {
    /// Last-write-wins on `incoming`. Equal timestamps replace only when
    /// `accept_equal` is set.
    pub fn decide(existing: Option<&CanonicalRecord>, incoming: i64, accept_equal: bool) -> Self {
        match existing {
            None => Verdict::Insert,
            Some(record) if incoming > record.timestamp => Verdict::Replace,
            Some(record) if incoming == record.timestamp => {
                if accept_equal {
                    Verdict::Replace
                } else {
                    Verdict::Duplicate
                }
            }
            Some(_) => Verdict::Stale,
        }
    }

    pub fn accepted(&self) -> bool {
        matches!(self, Verdict::Insert | Verdict::Replace)
    }
}

/// Read-only view of one topic table.
pub type TableSnapshot = Arc<HashMap<String, CanonicalRecord>>;

#[derive(Debug, Default)]
pub(crate) struct TopicTable {
    records: RwLock<TableSnapshot>,
}

impl TopicTable {
    pub(crate) fn snapshot(&self) -> TableSnapshot {
        self.records.read().clone()
    }

    pub(crate) fn get(&self, key: &str) -> Option<CanonicalRecord> {
        self.records.read().get(key).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Run `f` against a writable copy of the table.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut HashMap<String, CanonicalRecord>) -> R) -> R {
        let mut guard = self.records.write();
        f(Arc::make_mut(&mut guard))
    }
}

/// One table per topic.
#[derive(Debug, Default)]
pub(crate) struct Tables {
    positions: TopicTable,
    statuses: TopicTable,
    commands: TopicTable,
}

impl Tables {
    pub(crate) fn get(&self, topic: Topic) -> &TopicTable {
        match topic {
            Topic::Positions => &self.positions,
            Topic::Statuses => &self.statuses,
            Topic::CommandResponses => &self.commands,
        }
    }
}

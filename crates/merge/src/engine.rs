//! Streaming merge engine.
//!
//! `ingest` buffers at most one pending event per record key, keeping the
//! newest by event timestamp. A flush folds the buffer into the canonical
//! tables and emits a single [`MergeUpdate`] if anything changed. With a
//! non-zero throttle the first event after a flush schedules the next flush
//! one throttle window later; with a zero throttle `ingest` flushes inline.

use crate::baseline::{BaselineEntry, BaselineSource};
use crate::error::Result;
use crate::table::{CanonicalRecord, RecordSource, TableSnapshot, Tables, Verdict};
use common::stream::{now_ms, StreamEvent, Topic};
use connection::{EventBus, Unsubscribe};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use subscription::EventSink;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Merge engine configuration.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Minimum interval between two flushes. Zero flushes on every ingest.
    pub throttle: Duration,
    /// Let an event replace a record carrying the same timestamp.
    pub accept_equal_timestamps: bool,
    /// Age after which position and status records are evicted.
    pub max_record_age: Option<Duration>,
    /// Period of the eviction task.
    pub eviction_interval: Duration,
    /// Reject events stamped further than this into the future.
    pub max_clock_skew: Option<Duration>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(100),
            accept_equal_timestamps: false,
            max_record_age: None,
            eviction_interval: Duration::from_secs(10),
            max_clock_skew: None,
        }
    }
}

/// Notification emitted once per flush (or baseline seed) that changed the tables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeUpdate {
    pub topics: BTreeSet<Topic>,
    pub applied: usize,
    pub dropped: usize,
}

/// Counters for one topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicStats {
    pub applied: u64,
    /// Stale, duplicate, superseded-while-pending and skewed events.
    pub dropped: u64,
    pub evicted: u64,
    pub records: usize,
    /// Local time of the last applied change.
    pub last_update: Option<i64>,
}

/// Engine-wide statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeStats {
    pub topics: BTreeMap<Topic, TopicStats>,
    pub pending: usize,
    pub last_flush_at: Option<i64>,
}

/// Flush timer armed by `ingest`, tagged with the epoch it was armed for.
struct FlushTimer {
    epoch: u64,
    handle: JoinHandle<()>,
}

/// Buffered events and the timer that will flush them. Both live under one
/// lock so that draining and disarming happen together.
#[derive(Default)]
struct Pending {
    events: HashMap<(Topic, String), StreamEvent>,
    timer: Option<FlushTimer>,
    epoch: u64,
}

impl Pending {
    /// Take every buffered event. `fired` is the epoch of the timer running
    /// this drain; a timer that is no longer armed drains nothing.
    fn drain(&mut self, fired: Option<u64>) -> Vec<StreamEvent> {
        match fired {
            Some(epoch) => {
                if self.timer.as_ref().map(|t| t.epoch) != Some(epoch) {
                    return Vec::new();
                }
                // Dropping our own handle detaches the running task
                self.timer = None;
            }
            None => {
                if let Some(timer) = self.timer.take() {
                    timer.handle.abort();
                }
            }
        }
        self.events.drain().map(|(_, event)| event).collect()
    }
}

#[derive(Default)]
struct Counters {
    topics: BTreeMap<Topic, TopicStats>,
    last_flush_at: Option<i64>,
}

impl Counters {
    fn topic(&mut self, topic: Topic) -> &mut TopicStats {
        self.topics.entry(topic).or_default()
    }
}

struct EngineInner {
    config: MergeConfig,
    tables: Tables,
    pending: Mutex<Pending>,
    counters: Mutex<Counters>,
    eviction: Mutex<Option<JoinHandle<()>>>,
    updates: EventBus<(), MergeUpdate>,
}

/// Handle to the merge engine. Cloning shares the same tables.
#[derive(Clone)]
pub struct MergeEngine {
    inner: Arc<EngineInner>,
}

impl MergeEngine {
    pub fn new(config: MergeConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                tables: Tables::default(),
                pending: Mutex::new(Pending::default()),
                counters: Mutex::new(Counters::default()),
                eviction: Mutex::new(None),
                updates: EventBus::new(),
            }),
        }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.inner.config
    }

    /// Buffer `event` for the next flush.
    ///
    /// With a non-zero throttle this must run inside a tokio runtime.
    pub fn ingest(&self, event: StreamEvent) {
        let topic = event.topic();

        if let Some(skew) = self.inner.config.max_clock_skew {
            let now = now_ms();
            if event.timestamp > now.saturating_add(millis(skew)) {
                warn!(
                    "Dropping {} event for {} stamped {} ms ahead of the local clock",
                    topic,
                    event.entity_id,
                    event.timestamp.saturating_sub(now)
                );
                self.inner.count_dropped(topic, 1);
                return;
            }
        }

        let throttle = self.inner.config.throttle;
        {
            let mut pending = self.inner.pending.lock();
            let key = (topic, event.record_key().to_string());
            let superseded = pending
                .events
                .get(&key)
                .is_some_and(|queued| queued.timestamp > event.timestamp);
            if superseded {
                drop(pending);
                debug!("{} event for {} superseded while pending", topic, key.1);
                self.inner.count_dropped(topic, 1);
                return;
            }
            pending.events.insert(key, event);

            if !throttle.is_zero() && pending.timer.is_none() {
                pending.epoch += 1;
                let epoch = pending.epoch;
                let weak = Arc::downgrade(&self.inner);
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(throttle).await;
                    if let Some(inner) = weak.upgrade() {
                        let engine = MergeEngine { inner };
                        let batch = engine.inner.pending.lock().drain(Some(epoch));
                        engine.apply(batch);
                    }
                });
                pending.timer = Some(FlushTimer { epoch, handle });
            }
        }

        if throttle.is_zero() {
            self.flush();
        }
    }

    /// Apply every pending event now. Returns the emitted notification, if
    /// anything changed.
    pub fn flush(&self) -> Option<MergeUpdate> {
        let batch = self.inner.pending.lock().drain(None);
        self.apply(batch)
    }

    fn apply(&self, batch: Vec<StreamEvent>) -> Option<MergeUpdate> {
        if batch.is_empty() {
            return None;
        }

        let mut by_topic: BTreeMap<Topic, Vec<StreamEvent>> = BTreeMap::new();
        for event in batch {
            by_topic.entry(event.topic()).or_default().push(event);
        }

        let now = now_ms();
        let accept_equal = self.inner.config.accept_equal_timestamps;
        let mut topics = BTreeSet::new();
        let mut applied = 0;
        let mut dropped = 0;

        for (topic, events) in by_topic {
            let (topic_applied, topic_dropped) = self.inner.tables.get(topic).update(|table| {
                let mut accepted = 0usize;
                let mut rejected = 0usize;
                for event in events {
                    let key = event.record_key().to_string();
                    let verdict = Verdict::decide(table.get(&key), event.timestamp, accept_equal);
                    if verdict.accepted() {
                        table.insert(key, CanonicalRecord::from_event(event, RecordSource::Stream, now));
                        accepted += 1;
                    } else {
                        debug!(
                            "{} event for {} at {} dropped ({:?})",
                            topic, key, event.timestamp, verdict
                        );
                        rejected += 1;
                    }
                }
                (accepted, rejected)
            });

            self.inner.record_flush(topic, topic_applied, topic_dropped, now);
            if topic_applied > 0 {
                topics.insert(topic);
            }
            applied += topic_applied;
            dropped += topic_dropped;
        }

        self.inner.counters.lock().last_flush_at = Some(now);
        debug!("Flushed {} applied, {} dropped", applied, dropped);

        if applied == 0 {
            return None;
        }
        let update = MergeUpdate {
            topics,
            applied,
            dropped,
        };
        self.inner.updates.emit(&update);
        Some(update)
    }

    /// Seed `topic` with baseline entries fetched at `fetched_at`. Only keys
    /// absent from the table are inserted; existing records always win.
    pub fn seed_baseline(&self, topic: Topic, entries: Vec<BaselineEntry>, fetched_at: i64) -> usize {
        let now = now_ms();
        let inserted = self.inner.tables.get(topic).update(|table| {
            let mut inserted = 0usize;
            for entry in entries {
                if entry.payload.topic() != topic {
                    warn!("Skipping {} baseline entry seeded into {}", entry.payload.topic(), topic);
                    continue;
                }
                let event = StreamEvent::new(entry.entity_id, entry.payload, fetched_at);
                let key = event.record_key().to_string();
                if table.contains_key(&key) {
                    continue;
                }
                table.insert(key, CanonicalRecord::from_event(event, RecordSource::Baseline, now));
                inserted += 1;
            }
            inserted
        });

        info!("Seeded {} {} records from baseline", inserted, topic);
        if inserted > 0 {
            self.inner.record_flush(topic, inserted, 0, now);
            self.inner.updates.emit(&MergeUpdate {
                topics: BTreeSet::from([topic]),
                applied: inserted,
                dropped: 0,
            });
        }
        inserted
    }

    /// Fetch `topic` from `source` and seed it, stamping records with the
    /// time the fetch started.
    pub async fn load_baseline(&self, source: &dyn BaselineSource, topic: Topic) -> Result<usize> {
        let fetched_at = now_ms();
        let entries = source.fetch(topic).await?;
        Ok(self.seed_baseline(topic, entries, fetched_at))
    }

    /// Remove position and status records older than `max_age`.
    pub fn evict_older_than(&self, max_age: Duration) -> usize {
        let cutoff = now_ms().saturating_sub(millis(max_age));
        let mut total = 0;

        for topic in Topic::ALL.into_iter().filter(Topic::is_evictable) {
            let evicted = self.inner.tables.get(topic).update(|table| {
                let before = table.len();
                table.retain(|_, record| record.timestamp >= cutoff);
                before - table.len()
            });
            if evicted > 0 {
                debug!("Evicted {} {} records", evicted, topic);
                self.inner.counters.lock().topic(topic).evicted += evicted as u64;
                counter!("fleet_merge_evicted_total", "topic" => topic.as_str())
                    .increment(evicted as u64);
            }
            total += evicted;
        }
        total
    }

    /// Start periodic eviction if `max_record_age` is configured. Returns
    /// whether a task was started.
    pub fn start_eviction(&self) -> bool {
        let Some(max_age) = self.inner.config.max_record_age else {
            return false;
        };
        let period = self.inner.config.eviction_interval;
        if period.is_zero() {
            warn!("Eviction interval is zero; eviction disabled");
            return false;
        }

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.reset();
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                MergeEngine { inner }.evict_older_than(max_age);
            }
        });
        if let Some(previous) = self.inner.eviction.lock().replace(task) {
            previous.abort();
        }
        info!("Evicting records older than {:?} every {:?}", max_age, period);
        true
    }

    /// Every current record of `topic`, in no particular order.
    pub fn get_all(&self, topic: Topic) -> Vec<CanonicalRecord> {
        self.inner.tables.get(topic).snapshot().values().cloned().collect()
    }

    /// Record for `key` (entity id, or command id for command responses).
    pub fn get_for_entity(&self, topic: Topic, key: &str) -> Option<CanonicalRecord> {
        self.inner.tables.get(topic).get(key)
    }

    /// Immutable view of `topic`'s table.
    pub fn snapshot(&self, topic: Topic) -> TableSnapshot {
        self.inner.tables.get(topic).snapshot()
    }

    pub fn stats(&self) -> MergeStats {
        let counters = self.inner.counters.lock();
        let topics = Topic::ALL
            .into_iter()
            .map(|topic| {
                let mut stats = counters.topics.get(&topic).cloned().unwrap_or_default();
                stats.records = self.inner.tables.get(topic).len();
                (topic, stats)
            })
            .collect();
        MergeStats {
            topics,
            pending: self.inner.pending.lock().events.len(),
            last_flush_at: counters.last_flush_at,
        }
    }

    /// Register `handler` for change notifications.
    pub fn on_update<F>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(&MergeUpdate) + Send + Sync + 'static,
    {
        self.inner.updates.listen(handler)
    }
}

impl EventSink for MergeEngine {
    fn ingest(&self, event: StreamEvent) {
        MergeEngine::ingest(self, event);
    }
}

impl EngineInner {
    fn count_dropped(&self, topic: Topic, n: usize) {
        self.counters.lock().topic(topic).dropped += n as u64;
        counter!("fleet_merge_dropped_total", "topic" => topic.as_str()).increment(n as u64);
    }

    fn record_flush(&self, topic: Topic, applied: usize, dropped: usize, now: i64) {
        {
            let mut counters = self.counters.lock();
            let stats = counters.topic(topic);
            stats.applied += applied as u64;
            stats.dropped += dropped as u64;
            if applied > 0 {
                stats.last_update = Some(now);
            }
        }
        counter!("fleet_merge_applied_total", "topic" => topic.as_str()).increment(applied as u64);
        counter!("fleet_merge_dropped_total", "topic" => topic.as_str()).increment(dropped as u64);
        gauge!("fleet_merge_records", "topic" => topic.as_str()).set(self.tables.get(topic).len() as f64);
    }
}

/// `duration` in whole milliseconds, saturating at `i64::MAX`.
fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(timer) = self.pending.get_mut().timer.take() {
            timer.handle.abort();
        }
        if let Some(task) = self.eviction.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::stream::{CommandResponse, Position, Status, StreamPayload};

    fn position(entity: &str, latitude: f64, ts: i64) -> StreamEvent {
        StreamEvent::new(
            entity,
            StreamPayload::Position(Position {
                latitude,
                longitude: 0.0,
                altitude: 0.0,
                heading: 0.0,
                speed: 0.0,
            }),
            ts,
        )
    }

    fn latitude(record: &CanonicalRecord) -> f64 {
        match &record.payload {
            StreamPayload::Position(p) => p.latitude,
            other => panic!("not a position: {:?}", other),
        }
    }

    fn immediate() -> MergeEngine {
        MergeEngine::new(MergeConfig {
            throttle: Duration::ZERO,
            ..Default::default()
        })
    }

    fn count_updates(engine: &MergeEngine) -> Arc<Mutex<Vec<MergeUpdate>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _ = engine.on_update(move |u| sink.lock().push(u.clone()));
        seen
    }

    #[test]
    fn test_duplicate_event_applies_once() {
        let engine = immediate();
        let updates = count_updates(&engine);

        engine.ingest(position("d1", 1.0, 100));
        engine.ingest(position("d1", 1.0, 100));

        assert_eq!(updates.lock().len(), 1);
        let stats = engine.stats();
        assert_eq!(stats.topics[&Topic::Positions].applied, 1);
        assert_eq!(stats.topics[&Topic::Positions].dropped, 1);
        assert_eq!(stats.topics[&Topic::Positions].records, 1);
    }

    #[test]
    fn test_equal_timestamps_can_be_accepted() {
        let engine = MergeEngine::new(MergeConfig {
            throttle: Duration::ZERO,
            accept_equal_timestamps: true,
            ..Default::default()
        });
        engine.ingest(position("d1", 1.0, 100));
        engine.ingest(position("d1", 2.0, 100));
        let record = engine.get_for_entity(Topic::Positions, "d1").unwrap();
        assert_eq!(latitude(&record), 2.0);
    }

    #[test]
    fn test_last_write_wins_in_either_order() {
        for order in [[100, 50], [50, 100]] {
            let engine = immediate();
            for ts in order {
                engine.ingest(position("d1", ts as f64, ts));
            }
            let record = engine.get_for_entity(Topic::Positions, "d1").unwrap();
            assert_eq!(record.timestamp, 100);
            assert_eq!(latitude(&record), 100.0);
            assert_eq!(record.source, RecordSource::Stream);
        }
    }

    #[test]
    fn test_command_responses_keyed_by_command_id() {
        let engine = immediate();
        for (command_id, status, ts) in [("c1", "sent", 10), ("c2", "sent", 11), ("c1", "done", 20)] {
            engine.ingest(StreamEvent::new(
                "d1",
                StreamPayload::CommandResponse(CommandResponse {
                    command_id: command_id.to_string(),
                    status: status.to_string(),
                    message: None,
                }),
                ts,
            ));
        }

        assert_eq!(engine.get_all(Topic::CommandResponses).len(), 2);
        let c1 = engine.get_for_entity(Topic::CommandResponses, "c1").unwrap();
        assert!(matches!(c1.payload, StreamPayload::CommandResponse(ref r) if r.status == "done"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_window_emits_one_update() {
        let engine = MergeEngine::new(MergeConfig {
            throttle: Duration::from_millis(100),
            ..Default::default()
        });
        let updates = count_updates(&engine);

        for ts in [10, 40, 30, 20] {
            engine.ingest(position("d1", ts as f64, ts));
        }
        assert!(engine.get_for_entity(Topic::Positions, "d1").is_none());
        assert_eq!(engine.stats().pending, 1);

        tokio::time::sleep(Duration::from_millis(150)).await;

        let record = engine.get_for_entity(Topic::Positions, "d1").unwrap();
        assert_eq!(record.timestamp, 40);
        assert_eq!(
            *updates.lock(),
            vec![MergeUpdate {
                topics: BTreeSet::from([Topic::Positions]),
                applied: 1,
                dropped: 0,
            }]
        );

        // The next window is scheduled by the next event
        engine.ingest(position("d1", 50.0, 50));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(updates.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_flush_cancels_timer() {
        let engine = MergeEngine::new(MergeConfig {
            throttle: Duration::from_secs(1),
            ..Default::default()
        });
        let updates = count_updates(&engine);

        engine.ingest(position("d1", 1.0, 1));
        assert!(engine.flush().is_some());
        assert!(engine.flush().is_none());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(updates.lock().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ingest_never_strands_pending_events() {
        let engine = MergeEngine::new(MergeConfig {
            throttle: Duration::from_micros(20),
            ..Default::default()
        });

        for round in 0..20i64 {
            let producer = engine.clone();
            let last = (round + 1) * 5_000;
            tokio::task::spawn_blocking(move || {
                for ts in (round * 5_000 + 1)..=last {
                    producer.ingest(position("d1", ts as f64, ts));
                }
            })
            .await
            .unwrap();

            // Only the armed timer may drain what is left
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(engine.stats().pending, 0, "round {}", round);
            let record = engine.get_for_entity(Topic::Positions, "d1").unwrap();
            assert_eq!(record.timestamp, last, "round {}", round);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_rearms_after_manual_flush() {
        let engine = MergeEngine::new(MergeConfig {
            throttle: Duration::from_millis(100),
            ..Default::default()
        });

        engine.ingest(position("d1", 1.0, 1));
        engine.flush();
        engine.ingest(position("d1", 2.0, 2));
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(engine.stats().pending, 0);
        assert_eq!(engine.get_for_entity(Topic::Positions, "d1").unwrap().timestamp, 2);
    }

    #[test]
    fn test_stream_beats_baseline() {
        let engine = immediate();
        let t0 = now_ms();
        let seeded = engine.seed_baseline(
            Topic::Positions,
            vec![BaselineEntry {
                entity_id: "A".to_string(),
                payload: StreamPayload::Position(Position {
                    latitude: -1.0,
                    longitude: 0.0,
                    altitude: 0.0,
                    heading: 0.0,
                    speed: 0.0,
                }),
            }],
            t0,
        );
        assert_eq!(seeded, 1);
        assert_eq!(
            engine.get_for_entity(Topic::Positions, "A").unwrap().source,
            RecordSource::Baseline
        );

        engine.ingest(position("A", 5.0, t0 + 5));
        let record = engine.get_for_entity(Topic::Positions, "A").unwrap();
        assert_eq!(latitude(&record), 5.0);
        assert_eq!(record.source, RecordSource::Stream);
    }

    #[test]
    fn test_baseline_never_overwrites() {
        let engine = immediate();
        engine.ingest(position("A", 7.0, 1_000));

        let entries = vec![
            BaselineEntry {
                entity_id: "A".to_string(),
                payload: position("A", -1.0, 0).payload,
            },
            BaselineEntry {
                entity_id: "B".to_string(),
                payload: position("B", 2.0, 0).payload,
            },
        ];
        assert_eq!(engine.seed_baseline(Topic::Positions, entries, 5_000), 1);
        assert_eq!(latitude(&engine.get_for_entity(Topic::Positions, "A").unwrap()), 7.0);
        assert_eq!(engine.get_all(Topic::Positions).len(), 2);
    }

    struct FixedSource(Vec<BaselineEntry>);

    #[async_trait]
    impl BaselineSource for FixedSource {
        async fn fetch(&self, _topic: Topic) -> Result<Vec<BaselineEntry>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_load_baseline_stamps_fetch_time() {
        let engine = immediate();
        let source = FixedSource(vec![BaselineEntry {
            entity_id: "d9".to_string(),
            payload: StreamPayload::Status(Status {
                flight_status: "idle".to_string(),
                battery_level: 99.0,
                signal_strength: 0.0,
                is_connected: true,
            }),
        }]);

        let before = now_ms();
        assert_eq!(engine.load_baseline(&source, Topic::Statuses).await.unwrap(), 1);
        let record = engine.get_for_entity(Topic::Statuses, "d9").unwrap();
        assert!(record.timestamp >= before);
        assert_eq!(record.source, RecordSource::Baseline);
    }

    #[test]
    fn test_eviction_spares_command_responses() {
        let engine = immediate();
        let now = now_ms();
        engine.ingest(position("old", 0.0, now - 60_000));
        engine.ingest(position("fresh", 0.0, now));
        engine.ingest(StreamEvent::new(
            "old",
            StreamPayload::CommandResponse(CommandResponse {
                command_id: "c1".to_string(),
                status: "done".to_string(),
                message: None,
            }),
            now - 60_000,
        ));

        assert_eq!(engine.evict_older_than(Duration::from_secs(30)), 1);
        assert!(engine.get_for_entity(Topic::Positions, "old").is_none());
        assert!(engine.get_for_entity(Topic::Positions, "fresh").is_some());
        assert!(engine.get_for_entity(Topic::CommandResponses, "c1").is_some());
        assert_eq!(engine.stats().topics[&Topic::Positions].evicted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_eviction_task() {
        let engine = MergeEngine::new(MergeConfig {
            throttle: Duration::ZERO,
            max_record_age: Some(Duration::from_secs(30)),
            eviction_interval: Duration::from_secs(10),
            ..Default::default()
        });
        let stale = now_ms() - 60_000;
        engine.ingest(position("old", 0.0, stale));
        engine.ingest(position("fresh", 0.0, now_ms()));
        engine.ingest(StreamEvent::new(
            "old",
            StreamPayload::Status(Status {
                flight_status: "landed".to_string(),
                battery_level: 10.0,
                signal_strength: 0.0,
                is_connected: false,
            }),
            stale,
        ));
        engine.ingest(StreamEvent::new(
            "old",
            StreamPayload::CommandResponse(CommandResponse {
                command_id: "c1".to_string(),
                status: "done".to_string(),
                message: None,
            }),
            stale,
        ));

        assert!(engine.start_eviction());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(engine.get_all(Topic::Positions).len(), 2);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(engine.get_for_entity(Topic::Positions, "old").is_none());
        assert!(engine.get_for_entity(Topic::Positions, "fresh").is_some());
        assert!(engine.get_for_entity(Topic::Statuses, "old").is_none());
        assert!(engine.get_for_entity(Topic::CommandResponses, "c1").is_some());
        let stats = engine.stats();
        assert_eq!(stats.topics[&Topic::Positions].evicted, 1);
        assert_eq!(stats.topics[&Topic::Statuses].evicted, 1);
    }

    #[test]
    fn test_eviction_disabled_without_max_age() {
        assert!(!immediate().start_eviction());
    }

    #[test]
    fn test_huge_durations_saturate() {
        let engine = MergeEngine::new(MergeConfig {
            throttle: Duration::ZERO,
            max_clock_skew: Some(Duration::MAX),
            ..Default::default()
        });
        engine.ingest(position("d1", 0.0, i64::MAX));
        assert!(engine.get_for_entity(Topic::Positions, "d1").is_some());

        assert_eq!(engine.evict_older_than(Duration::from_millis(u64::MAX)), 0);
        assert_eq!(engine.evict_older_than(Duration::MAX), 0);
        assert_eq!(engine.get_all(Topic::Positions).len(), 1);
    }

    #[test]
    fn test_clock_skew_guard() {
        let engine = MergeEngine::new(MergeConfig {
            throttle: Duration::ZERO,
            max_clock_skew: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        engine.ingest(position("d1", 0.0, now_ms() + 60_000));
        assert!(engine.get_for_entity(Topic::Positions, "d1").is_none());
        assert_eq!(engine.stats().topics[&Topic::Positions].dropped, 1);
    }

    #[test]
    fn test_snapshot_survives_later_flush() {
        let engine = immediate();
        engine.ingest(position("d1", 1.0, 1));
        let snapshot = engine.snapshot(Topic::Positions);
        engine.ingest(position("d1", 2.0, 2));

        assert_eq!(latitude(&snapshot["d1"]), 1.0);
        assert_eq!(latitude(&engine.get_for_entity(Topic::Positions, "d1").unwrap()), 2.0);
    }
}

//! Subscription workers and the three streaming disciplines.
//!
//! Every subscription runs one periodic task that drains its
//! characteristics' pipelines and hands [`Record`]s to the user callback:
//!
//! - [`StreamMode::EveryUpdate`]: at most one value per characteristic per
//!   tick, each delivered in its own record.
//! - [`StreamMode::Batched`]: everything queued, grouped per characteristic,
//!   in one record per tick.
//! - [`StreamMode::Aggregated`]: one value per characteristic per tick;
//!   silent characteristics raise [`ValueFlags::MISSING`].
//!
//! Ticks that produce nothing are skipped. Workers are tracked so a
//! disconnect can wait for all of them to exit.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use blim_types::{Record, RecordPayload, StreamMode, ValueFlags};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use crate::gatt::Characteristic;
use crate::pool::Value;
use crate::scope::CancelScope;

/// Callback receiving subscription records. The record is only borrowed.
pub type RecordCallback = Arc<dyn Fn(&Record) + Send + Sync>;

/// Handle identifying one subscription on its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Immutable description of what a worker drains and how.
pub(crate) struct Subscription {
    pub(crate) id: SubscriptionId,
    pub(crate) mode: StreamMode,
    pub(crate) period: Duration,
    pub(crate) characteristics: Vec<Arc<Characteristic>>,
    pub(crate) scope: CancelScope,
    pub(crate) callback: RecordCallback,
}

/// Fields of the record being assembled for one tick.
#[derive(Default)]
struct RecordMeta {
    ts_us: i64,
    seq: u64,
    flags: ValueFlags,
}

impl RecordMeta {
    fn absorb(&mut self, value: &Value) {
        self.ts_us = self.ts_us.max(value.ts_us());
        self.seq = self.seq.max(value.seq());
        self.flags |= value.flags();
    }

    fn finish(self, payload: RecordPayload) -> Record {
        Record {
            ts_us: self.ts_us,
            seq: self.seq,
            flags: self.flags,
            payload,
        }
    }
}

impl Subscription {
    /// Run until the scope is cancelled.
    async fn run(self) {
        debug!(
            id = %self.id,
            mode = %self.mode,
            period = ?self.period,
            characteristics = self.characteristics.len(),
            "subscription worker started"
        );
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.scope.cancelled() => break,
                _ = ticker.tick() => self.tick(),
            }
        }
        debug!(id = %self.id, "subscription worker stopped");
    }

    fn tick(&self) {
        match self.mode {
            StreamMode::EveryUpdate => self.tick_every_update(),
            StreamMode::Batched => self.tick_batched(),
            StreamMode::Aggregated => self.tick_aggregated(),
        }
    }

    fn tick_every_update(&self) {
        for characteristic in &self.characteristics {
            let pipeline = characteristic.pipeline();
            let Some(value) = pipeline.try_pop() else {
                continue;
            };
            if self.scope.is_cancelled() {
                pipeline.pool().release(value);
                return;
            }
            let mut meta = RecordMeta::default();
            meta.absorb(&value);
            let values = BTreeMap::from([(characteristic.uuid().to_string(), value.to_bytes())]);
            pipeline.pool().release(value);
            self.deliver(&meta.finish(RecordPayload::Values(values)));
        }
    }

    fn tick_batched(&self) {
        let mut meta = RecordMeta::default();
        let mut batches: BTreeMap<String, Vec<Bytes>> = BTreeMap::new();
        let mut drained = Vec::new();

        for characteristic in &self.characteristics {
            let pipeline = characteristic.pipeline();
            // Unbounded: a busy characteristic is drained completely.
            if pipeline.drain_into(&mut drained) == 0 {
                continue;
            }
            let batch = batches.entry(characteristic.uuid().to_string()).or_default();
            for value in drained.drain(..) {
                meta.absorb(&value);
                batch.push(value.to_bytes());
                pipeline.pool().release(value);
            }
        }

        if !batches.is_empty() {
            self.deliver(&meta.finish(RecordPayload::BatchValues(batches)));
        }
    }

    fn tick_aggregated(&self) {
        let mut meta = RecordMeta::default();
        let mut values = BTreeMap::new();

        for characteristic in &self.characteristics {
            let pipeline = characteristic.pipeline();
            match pipeline.try_pop() {
                Some(value) => {
                    meta.absorb(&value);
                    values.insert(characteristic.uuid().to_string(), value.to_bytes());
                    pipeline.pool().release(value);
                }
                None => meta.flags |= ValueFlags::MISSING,
            }
        }

        if !values.is_empty() {
            self.deliver(&meta.finish(RecordPayload::Values(values)));
        }
    }

    /// Invoke the callback unless cancelled. Panics are logged and swallowed.
    fn deliver(&self, record: &Record) {
        if self.scope.is_cancelled() {
            return;
        }
        if catch_unwind(AssertUnwindSafe(|| (self.callback)(record))).is_err() {
            error!(id = %self.id, seq = record.seq, "subscription callback panicked");
        }
    }
}

struct WorkerEntry {
    scope: CancelScope,
    handle: JoinHandle<()>,
}

/// Registry of running subscription workers.
pub(crate) struct SubscriptionManager {
    workers: Mutex<BTreeMap<SubscriptionId, WorkerEntry>>,
    tracker: TaskTracker,
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub(crate) fn new() -> Self {
        Self {
            workers: Mutex::new(BTreeMap::new()),
            tracker: TaskTracker::new(),
            next_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Spawn the worker for `subscription`.
    pub(crate) fn start(&self, subscription: Subscription) -> SubscriptionId {
        let id = subscription.id;
        let scope = subscription.scope.clone();
        let handle = self.tracker.spawn(subscription.run());
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, WorkerEntry { scope, handle });
        id
    }

    /// Cancel every registered worker and wait until those workers have
    /// exited. Workers started after the registry was taken are left alone.
    pub(crate) async fn cancel_all(&self) -> usize {
        let entries = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for entry in entries.values() {
            entry.scope.cancel();
        }
        let count = entries.len();
        for (id, entry) in entries {
            if let Err(err) = entry.handle.await {
                error!(%id, error = %err, "subscription worker failed");
            }
        }
        count
    }

    /// Cancel one worker and wait for it. Returns `false` for unknown ids.
    pub(crate) async fn cancel(&self, id: SubscriptionId) -> bool {
        let entry = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        let Some(entry) = entry else {
            return false;
        };
        entry.scope.cancel();
        if let Err(err) = entry.handle.await {
            error!(%id, error = %err, "subscription worker failed");
        }
        true
    }

    /// Drop registry entries whose worker already exited.
    pub(crate) fn prune(&self) {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, entry| !entry.handle.is_finished());
    }

    pub(crate) fn active(&self) -> Vec<SubscriptionId> {
        self.prune();
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Number of worker tasks still running.
    pub(crate) fn running(&self) -> usize {
        self.tracker.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::DiscoveredCharacteristic;
    use crate::gatt::Link;
    use crate::pipeline::NotificationPipeline;
    use crate::pool::ValuePool;
    use blim_types::CharacteristicProperties;
    use blim_types::uuid::expand_uuid;
    use std::sync::atomic::AtomicUsize;

    fn characteristic(uuid: &str, pool: &Arc<ValuePool>) -> Arc<Characteristic> {
        let handle = DiscoveredCharacteristic {
            uuid: expand_uuid(uuid).unwrap(),
            service_uuid: expand_uuid("180d").unwrap(),
            properties: CharacteristicProperties::NOTIFY,
            descriptors: Vec::new(),
        };
        Arc::new(Characteristic::new(
            handle,
            Vec::new(),
            Arc::new(Link::new()),
            NotificationPipeline::new(16, pool.clone()),
        ))
    }

    fn collecting(
        mode: StreamMode,
        characteristics: Vec<Arc<Characteristic>>,
    ) -> (Subscription, Arc<Mutex<Vec<Record>>>) {
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink = records.clone();
        let subscription = Subscription {
            id: SubscriptionId(1),
            mode,
            period: Duration::from_millis(100),
            characteristics,
            scope: CancelScope::new(),
            callback: Arc::new(move |record: &Record| sink.lock().unwrap().push(record.clone())),
        };
        (subscription, records)
    }

    #[test]
    fn test_every_update_one_record_per_value() {
        let pool = Arc::new(ValuePool::new());
        let a = characteristic("2a37", &pool);
        let b = characteristic("2a38", &pool);
        a.process_notification(&[1]);
        a.process_notification(&[2]);
        b.process_notification(&[3]);

        let (sub, records) = collecting(StreamMode::EveryUpdate, vec![a.clone(), b]);
        sub.tick();
        let records = records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].values().unwrap()["2a37"].as_ref(), &[1]);
        assert_eq!(records[1].values().unwrap()["2a38"].as_ref(), &[3]);
        assert_eq!(a.pipeline().len(), 1, "one value per characteristic per tick");
    }

    #[test]
    fn test_batched_keeps_arrival_order() {
        let pool = Arc::new(ValuePool::new());
        let a = characteristic("2a37", &pool);
        for byte in 0..5u8 {
            a.process_notification(&[byte]);
        }
        let (sub, records) = collecting(StreamMode::Batched, vec![a]);
        sub.tick();
        sub.tick();

        let records = records.lock().unwrap();
        assert_eq!(records.len(), 1, "empty tick is skipped");
        let batch = &records[0].batch_values().unwrap()["2a37"];
        let bytes: Vec<u8> = batch.iter().map(|b| b[0]).collect();
        assert_eq!(bytes, vec![0, 1, 2, 3, 4]);
        assert_eq!(records[0].seq, 5);
        assert!(records[0].values().is_none());
    }

    #[test]
    fn test_aggregated_marks_missing() {
        let pool = Arc::new(ValuePool::new());
        let a = characteristic("2a37", &pool);
        let b = characteristic("2a38", &pool);
        a.process_notification(&[9]);

        let (sub, records) = collecting(StreamMode::Aggregated, vec![a, b]);
        sub.tick();
        sub.tick();

        let records = records.lock().unwrap();
        assert_eq!(records.len(), 1, "all-missing tick is skipped");
        assert_eq!(records[0].len(), 1);
        assert!(records[0].flags.contains(ValueFlags::MISSING));
    }

    #[test]
    fn test_dropped_flag_reaches_record() {
        let pool = Arc::new(ValuePool::new());
        let handle = DiscoveredCharacteristic {
            uuid: expand_uuid("2a37").unwrap(),
            service_uuid: expand_uuid("180d").unwrap(),
            properties: CharacteristicProperties::NOTIFY,
            descriptors: Vec::new(),
        };
        let a = Arc::new(Characteristic::new(
            handle,
            Vec::new(),
            Arc::new(Link::new()),
            NotificationPipeline::new(2, pool),
        ));
        for byte in 0..3u8 {
            a.process_notification(&[byte]);
        }
        let (sub, records) = collecting(StreamMode::Batched, vec![a]);
        sub.tick();
        assert!(records.lock().unwrap()[0].flags.contains(ValueFlags::DROPPED));
    }

    #[test]
    fn test_cancelled_subscription_delivers_nothing() {
        let pool = Arc::new(ValuePool::new());
        let a = characteristic("2a37", &pool);
        a.process_notification(&[1]);
        let (sub, records) = collecting(StreamMode::EveryUpdate, vec![a.clone()]);
        sub.scope.cancel();
        sub.tick();
        assert!(records.lock().unwrap().is_empty());
        assert!(a.pipeline().is_empty());
        assert_eq!(pool.stats().released, 1);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let pool = Arc::new(ValuePool::new());
        let a = characteristic("2a37", &pool);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sub = Subscription {
            id: SubscriptionId(7),
            mode: StreamMode::EveryUpdate,
            period: Duration::from_millis(5),
            characteristics: vec![a.clone()],
            scope: CancelScope::new(),
            callback: Arc::new(move |_: &Record| {
                counter.fetch_add(1, Ordering::SeqCst);
                panic!("callback bug");
            }),
        };
        a.process_notification(&[1]);
        sub.tick();
        a.process_notification(&[2]);
        sub.tick();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manager_cancel_all_joins_workers() {
        let pool = Arc::new(ValuePool::new());
        let manager = SubscriptionManager::new();
        let root = CancelScope::new();
        for _ in 0..3 {
            let (mut sub, _) = collecting(StreamMode::Batched, vec![characteristic("2a37", &pool)]);
            sub.id = manager.next_id();
            sub.scope = root.child();
            manager.start(sub);
        }
        assert_eq!(manager.active().len(), 3);
        assert_eq!(manager.cancel_all().await, 3);
        assert_eq!(manager.running(), 0);
        assert!(manager.active().is_empty());
        assert!(!root.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manager_targeted_cancel() {
        let pool = Arc::new(ValuePool::new());
        let manager = SubscriptionManager::new();
        let mut ids = Vec::new();
        for _ in 0..2 {
            let (mut sub, _) =
                collecting(StreamMode::Aggregated, vec![characteristic("2a37", &pool)]);
            sub.id = manager.next_id();
            ids.push(manager.start(sub));
        }
        assert!(manager.cancel(ids[0]).await);
        assert!(!manager.cancel(ids[0]).await, "second cancel is unknown");
        assert_eq!(manager.active(), vec![ids[1]]);
        manager.cancel_all().await;
    }
}

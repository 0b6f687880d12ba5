//! Per-characteristic notification pipeline.
//!
//! Each characteristic owns a bounded FIFO of pooled [`Value`]s fed from the
//! adapter's notification context. Enqueueing never blocks: when the queue is
//! full the oldest value is evicted (flagged [`ValueFlags::DROPPED`] and
//! released) so the newest sample always survives. After [`close`] the
//! pipeline rejects new values until it is explicitly [`reset`].
//!
//! [`close`]: NotificationPipeline::close
//! [`reset`]: NotificationPipeline::reset

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use blim_types::ValueFlags;
use tracing::{error, trace};

use crate::error::{Error, Result};
use crate::pool::{Value, ValuePool};

/// Default queue capacity per characteristic.
pub const DEFAULT_PIPELINE_CAPACITY: usize = 128;

/// Callback invoked synchronously for every notification, before queueing.
pub type DirectSubscriber = Arc<dyn Fn(&Value) + Send + Sync>;

/// What happened to a value handed to [`NotificationPipeline::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queued after evicting the oldest value, whose sequence is given.
    QueuedAfterDrop { dropped_seq: u64 },
    /// The pipeline is closed; the value went straight back to the pool.
    Rejected,
}

#[derive(Debug)]
struct QueueState {
    queue: VecDeque<Value>,
    capacity: usize,
    closed: bool,
}

pub struct NotificationPipeline {
    state: Mutex<QueueState>,
    subscribers: RwLock<Vec<DirectSubscriber>>,
    pool: Arc<ValuePool>,
    dropped: AtomicU64,
}

impl std::fmt::Debug for NotificationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("NotificationPipeline")
            .field("len", &state.queue.len())
            .field("capacity", &state.capacity)
            .field("closed", &state.closed)
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

impl NotificationPipeline {
    /// Create an open pipeline.
    pub fn new(capacity: usize, pool: Arc<ValuePool>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                closed: false,
            }),
            subscribers: RwLock::new(Vec::new()),
            pool,
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pool the pipeline's values come from.
    pub fn pool(&self) -> &Arc<ValuePool> {
        &self.pool
    }

    /// Admit a value, evicting the oldest one if the queue is full.
    pub fn enqueue(&self, mut value: Value) -> EnqueueOutcome {
        let mut state = self.lock();
        if state.closed {
            drop(state);
            self.pool.release(value);
            return EnqueueOutcome::Rejected;
        }

        let mut outcome = EnqueueOutcome::Queued;
        if state.queue.len() >= state.capacity
            && let Some(mut oldest) = state.queue.pop_front()
        {
            oldest.mark(ValueFlags::DROPPED);
            let dropped_seq = oldest.seq();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(dropped_seq, "pipeline full, evicted oldest value");
            self.pool.release(oldest);
            // The survivor carries the loss forward to the consumer.
            value.mark(ValueFlags::DROPPED);
            outcome = EnqueueOutcome::QueuedAfterDrop { dropped_seq };
        }
        state.queue.push_back(value);
        outcome
    }

    /// Take the oldest queued value without waiting.
    pub fn try_pop(&self) -> Option<Value> {
        self.lock().queue.pop_front()
    }

    /// Move every queued value into `out`, oldest first.
    pub fn drain_into(&self, out: &mut Vec<Value>) -> usize {
        let mut state = self.lock();
        let count = state.queue.len();
        out.extend(state.queue.drain(..));
        count
    }

    /// Release every queued value back to the pool.
    pub fn drain(&self) -> usize {
        let drained: Vec<Value> = self.lock().queue.drain(..).collect();
        let count = drained.len();
        self.pool.release_all(drained);
        count
    }

    /// Mark the pipeline closed. Returns `false` if it already was.
    pub fn close(&self) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        true
    }

    /// Drain queued values and close, as done at teardown.
    pub fn drain_and_close(&self) -> usize {
        let drained: Vec<Value> = {
            let mut state = self.lock();
            state.closed = true;
            state.queue.drain(..).collect()
        };
        let count = drained.len();
        self.pool.release_all(drained);
        count
    }

    /// Reopen a closed pipeline with a new capacity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the pipeline is still open.
    pub fn reset(&self, capacity: usize) -> Result<()> {
        let leftovers: Vec<Value> = {
            let mut state = self.lock();
            if !state.closed {
                return Err(Error::invalid_config(
                    "cannot reset an open notification pipeline",
                ));
            }
            let leftovers = state.queue.drain(..).collect();
            state.queue = VecDeque::with_capacity(capacity);
            state.capacity = capacity.max(1);
            state.closed = false;
            leftovers
        };
        self.pool.release_all(leftovers);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Total values evicted by backpressure since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn add_subscriber(&self, subscriber: DirectSubscriber) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscriber);
    }

    pub fn clear_subscribers(&self) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Invoke each direct subscriber with `value`. A panicking subscriber is
    /// logged and skipped.
    pub fn notify_subscribers(&self, value: &Value) {
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for subscriber in subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(value))).is_err() {
                error!(seq = value.seq(), "direct subscriber panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn pipeline(capacity: usize) -> NotificationPipeline {
        NotificationPipeline::new(capacity, Arc::new(ValuePool::new()))
    }

    #[test]
    fn test_fifo_order() {
        let p = pipeline(4);
        for byte in 1..=3u8 {
            let value = p.pool().acquire(&[byte]);
            assert_eq!(p.enqueue(value), EnqueueOutcome::Queued);
        }
        let order: Vec<u8> = std::iter::from_fn(|| p.try_pop()).map(|v| v.data()[0]).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_drop_oldest_keeps_newest() {
        let p = pipeline(2);
        let first = p.pool().acquire(&[1]);
        let first_seq = first.seq();
        p.enqueue(first);
        p.enqueue(p.pool().acquire(&[2]));
        let outcome = p.enqueue(p.pool().acquire(&[3]));

        assert_eq!(outcome, EnqueueOutcome::QueuedAfterDrop { dropped_seq: first_seq });
        assert_eq!(p.len(), 2);
        assert_eq!(p.dropped(), 1);

        let second = p.try_pop().unwrap();
        assert_eq!(second.data(), &[2]);
        assert!(!second.flags().contains(ValueFlags::DROPPED));
        let newest = p.try_pop().unwrap();
        assert_eq!(newest.data(), &[3]);
        assert!(newest.flags().contains(ValueFlags::DROPPED));
    }

    #[test]
    fn test_evicted_value_returns_to_pool() {
        let p = pipeline(1);
        p.enqueue(p.pool().acquire(&[1]));
        p.enqueue(p.pool().acquire(&[2]));
        assert_eq!(p.pool().stats().released, 1);
        assert_eq!(p.pool().idle_buffers(), 1);
    }

    #[test]
    fn test_closed_pipeline_rejects() {
        let p = pipeline(4);
        assert!(p.close());
        assert!(!p.close(), "second close is a no-op");
        assert_eq!(p.enqueue(p.pool().acquire(&[1])), EnqueueOutcome::Rejected);
        assert!(p.is_empty());
        assert_eq!(p.pool().stats().released, 1);
    }

    #[test]
    fn test_reset_requires_closed() {
        let p = pipeline(4);
        assert!(matches!(p.reset(8), Err(Error::InvalidConfig(_))));

        p.enqueue(p.pool().acquire(&[1]));
        assert_eq!(p.drain_and_close(), 1);
        p.reset(8).unwrap();
        assert!(!p.is_closed());
        assert_eq!(p.capacity(), 8);
        assert_eq!(p.enqueue(p.pool().acquire(&[2])), EnqueueOutcome::Queued);
    }

    #[test]
    fn test_drain_into_preserves_order() {
        let p = pipeline(8);
        for byte in 0..5u8 {
            p.enqueue(p.pool().acquire(&[byte]));
        }
        let mut out = Vec::new();
        assert_eq!(p.drain_into(&mut out), 5);
        let bytes: Vec<u8> = out.iter().map(|v| v.data()[0]).collect();
        assert_eq!(bytes, vec![0, 1, 2, 3, 4]);
        assert!(p.is_empty());
    }

    #[test]
    fn test_direct_subscribers_survive_panics() {
        let p = pipeline(4);
        let calls = Arc::new(AtomicUsize::new(0));
        p.add_subscriber(Arc::new(|_: &Value| panic!("bad subscriber")));
        let counter = calls.clone();
        p.add_subscriber(Arc::new(move |v: &Value| {
            assert_eq!(v.data(), &[7]);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let value = p.pool().acquire(&[7]);
        p.notify_subscribers(&value);
        p.notify_subscribers(&value);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(p.subscriber_count(), 2);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// The queue never exceeds capacity, always holds the newest value,
        /// and yields strictly increasing sequence numbers.
        #[test]
        fn bounded_and_newest_retained(capacity in 1usize..32, pushes in 1usize..200) {
            let p = NotificationPipeline::new(capacity, Arc::new(ValuePool::new()));
            let mut newest = 0;
            for i in 0..pushes {
                let value = p.pool().acquire(&(i as u32).to_le_bytes());
                newest = value.seq();
                p.enqueue(value);
                prop_assert!(p.len() <= capacity);
            }

            let mut out = Vec::new();
            p.drain_into(&mut out);
            prop_assert_eq!(out.last().map(Value::seq), Some(newest));
            prop_assert!(out.windows(2).all(|w| w[0].seq() < w[1].seq()));
            prop_assert_eq!(p.dropped() as usize, pushes.saturating_sub(capacity));
        }
    }
}

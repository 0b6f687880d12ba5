//! Pooled notification values.
//!
//! Notifications arrive at radio rate, so their payload buffers are recycled
//! instead of allocated per packet. A [`Value`] handed to a callback is only
//! borrowed: copy the payload (e.g. with [`Value::to_bytes`]) if it must
//! outlive the call, because the buffer goes back to the pool right after.
//!
//! Each pool owns its sequence counter. Pools that need a common ordering
//! can share one through [`ValuePool::with_sequence`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use blim_types::ValueFlags;
use bytes::Bytes;
use time::OffsetDateTime;

/// Initial capacity of a freshly allocated value buffer.
pub const DEFAULT_VALUE_CAPACITY: usize = 256;

/// Buffers that grew beyond this capacity are freed instead of pooled.
pub const MAX_POOLED_CAPACITY: usize = 1024;

/// Upper bound on idle buffers kept by one pool.
pub const MAX_IDLE_BUFFERS: usize = 1024;

/// One notification payload with its arrival metadata.
#[derive(Debug)]
pub struct Value {
    ts_us: i64,
    seq: u64,
    data: Vec<u8>,
    flags: ValueFlags,
}

impl Value {
    /// Arrival time in microseconds since the Unix epoch.
    pub fn ts_us(&self) -> i64 {
        self.ts_us
    }

    /// Pool-wide sequence number, strictly increasing in acquisition order.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn flags(&self) -> ValueFlags {
        self.flags
    }

    pub fn mark(&mut self, flags: ValueFlags) {
        self.flags |= flags;
    }

    /// Copy the payload out of the pooled buffer.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }
}

/// Counters describing pool behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub acquired: u64,
    /// Acquisitions served from an idle buffer.
    pub recycled: u64,
    pub released: u64,
    /// Released buffers freed for exceeding [`MAX_POOLED_CAPACITY`].
    pub discarded: u64,
}

/// Recycling allocator for [`Value`]s. Never blocks: if the idle list is
/// contended, acquisition allocates and release frees.
#[derive(Debug)]
pub struct ValuePool {
    idle: Mutex<Vec<Vec<u8>>>,
    sequence: Arc<AtomicU64>,
    acquired: AtomicU64,
    recycled: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
}

impl Default for ValuePool {
    fn default() -> Self {
        Self::new()
    }
}

impl ValuePool {
    /// Create a pool with its own sequence counter.
    pub fn new() -> Self {
        Self::with_sequence(Arc::new(AtomicU64::new(0)))
    }

    /// Create a pool that draws sequence numbers from a shared counter.
    pub fn with_sequence(sequence: Arc<AtomicU64>) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            sequence,
            acquired: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
            released: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Copy `bytes` into a pooled buffer and stamp time and sequence.
    pub fn acquire(&self, bytes: &[u8]) -> Value {
        let reused = self.idle.try_lock().ok().and_then(|mut idle| idle.pop());
        let mut data = match reused {
            Some(buf) => {
                self.recycled.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => Vec::with_capacity(DEFAULT_VALUE_CAPACITY.max(bytes.len())),
        };
        data.clear();
        data.extend_from_slice(bytes);
        self.acquired.fetch_add(1, Ordering::Relaxed);

        Value {
            ts_us: now_us(),
            seq: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            data,
            flags: ValueFlags::empty(),
        }
    }

    /// Return a value's buffer to the pool.
    pub fn release(&self, value: Value) {
        self.released.fetch_add(1, Ordering::Relaxed);
        let mut data = value.data;
        if data.capacity() > MAX_POOLED_CAPACITY {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        data.clear();
        if let Ok(mut idle) = self.idle.try_lock()
            && idle.len() < MAX_IDLE_BUFFERS
        {
            idle.push(data);
        }
    }

    /// Release every value in `values`.
    pub fn release_all(&self, values: impl IntoIterator<Item = Value>) {
        for value in values {
            self.release(value);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    /// Number of buffers waiting for reuse.
    pub fn idle_buffers(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}

pub(crate) fn now_us() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000) as i64
}

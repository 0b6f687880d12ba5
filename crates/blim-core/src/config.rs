//! Connection options and per-connection tuning.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::gatt::{DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT};
use crate::pipeline::DEFAULT_PIPELINE_CAPACITY;
use crate::validation::SubscribeTarget;

/// Default timeout for dialing a peripheral.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for each descriptor read during discovery.
pub const DEFAULT_DESCRIPTOR_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Polling period of EveryUpdate workers.
pub const DEFAULT_EVERY_UPDATE_TICK: Duration = Duration::from_millis(5);

/// Period used by Batched and Aggregated workers when none is given.
pub const DEFAULT_BATCH_PERIOD: Duration = Duration::from_millis(100);

/// Chunk size of device-level chunked writes.
pub const DEFAULT_WRITE_CHUNK_SIZE: usize = 20;

/// Pause between chunks of a chunked write.
pub const DEFAULT_CHUNK_DELAY: Duration = Duration::from_millis(10);

/// Options for a single connect call.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use blim_core::{ConnectOptions, SubscribeTarget};
///
/// let options = ConnectOptions::default()
///     .connect_timeout(Duration::from_secs(10))
///     .skip_descriptor_reads()
///     .subscribe(SubscribeTarget::service("180d").characteristic("2a37"));
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    /// Per-descriptor read timeout. `Duration::ZERO` skips descriptor reads.
    pub descriptor_read_timeout: Duration,
    /// Targets whose notifications are enabled right after discovery.
    pub subscribe_targets: Vec<SubscribeTarget>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            descriptor_read_timeout: DEFAULT_DESCRIPTOR_READ_TIMEOUT,
            subscribe_targets: Vec::new(),
        }
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn descriptor_read_timeout(mut self, timeout: Duration) -> Self {
        self.descriptor_read_timeout = timeout;
        self
    }

    /// Do not read descriptor values during discovery.
    #[must_use]
    pub fn skip_descriptor_reads(self) -> Self {
        self.descriptor_read_timeout(Duration::ZERO)
    }

    /// Enable notifications for `target` once connected.
    #[must_use]
    pub fn subscribe(mut self, target: SubscribeTarget) -> Self {
        self.subscribe_targets.push(target);
        self
    }

    /// Reads descriptor values during discovery.
    pub fn reads_descriptors(&self) -> bool {
        !self.descriptor_read_timeout.is_zero()
    }

    /// Validate the options.
    ///
    /// Checks that:
    /// - `connect_timeout` is > 0
    /// - every subscribe target names a service
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            return Err(Error::invalid_config("connect_timeout must be > 0"));
        }
        if self
            .subscribe_targets
            .iter()
            .any(|target| target.service.trim().is_empty())
        {
            return Err(Error::invalid_config(
                "subscribe target is missing a service UUID",
            ));
        }
        Ok(())
    }
}

/// Tuning shared by every connect cycle of one [`Connection`](crate::Connection).
///
/// ```
/// use std::time::Duration;
/// use blim_core::ConnectionConfig;
///
/// let config = ConnectionConfig::default()
///     .pipeline_capacity(512)
///     .batch_period(Duration::from_millis(250));
/// assert_eq!(config.pipeline_capacity, 512);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Queue capacity of each characteristic's notification pipeline.
    pub pipeline_capacity: usize,
    pub every_update_tick: Duration,
    /// Period for Batched/Aggregated subscriptions that pass no rate.
    pub batch_period: Duration,
    /// Used by reads that pass `Duration::ZERO`.
    pub read_timeout: Duration,
    /// Used by writes that pass `Duration::ZERO`.
    pub write_timeout: Duration,
    pub write_chunk_size: usize,
    pub chunk_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pipeline_capacity: DEFAULT_PIPELINE_CAPACITY,
            every_update_tick: DEFAULT_EVERY_UPDATE_TICK,
            batch_period: DEFAULT_BATCH_PERIOD,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            write_chunk_size: DEFAULT_WRITE_CHUNK_SIZE,
            chunk_delay: DEFAULT_CHUNK_DELAY,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn pipeline_capacity(mut self, capacity: usize) -> Self {
        self.pipeline_capacity = capacity;
        self
    }

    #[must_use]
    pub fn every_update_tick(mut self, tick: Duration) -> Self {
        self.every_update_tick = tick;
        self
    }

    #[must_use]
    pub fn batch_period(mut self, period: Duration) -> Self {
        self.batch_period = period;
        self
    }

    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    #[must_use]
    pub fn write_chunk_size(mut self, size: usize) -> Self {
        self.write_chunk_size = size;
        self
    }

    #[must_use]
    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline_capacity == 0 {
            return Err(Error::invalid_config("pipeline_capacity must be > 0"));
        }
        if self.every_update_tick.is_zero() || self.batch_period.is_zero() {
            return Err(Error::invalid_config("worker periods must be > 0"));
        }
        if self.read_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(Error::invalid_config("default timeouts must be > 0"));
        }
        if self.write_chunk_size == 0 {
            return Err(Error::invalid_config("write_chunk_size must be > 0"));
        }
        Ok(())
    }
}

//! In-memory adapter for testing.
//!
//! [`MockAdapter`] dials [`MockPeripheral`]s instead of radios, so the whole
//! engine (discovery, notifications, teardown) can be exercised without
//! Bluetooth hardware.
//!
//! # Features
//!
//! - **Builder-defined profile**: services, characteristics with properties,
//!   descriptor values and initial characteristic values
//! - **Failure injection**: make dialing, discovery, subscribing or
//!   unsubscribing fail
//! - **Latency simulation**: delay dials, reads and descriptor reads
//! - **Synthetic traffic**: push notifications with [`MockPeripheral::notify`]
//!   and drop the link with [`MockPeripheral::simulate_link_loss`]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use blim_types::CharacteristicProperties;
use blim_types::uuid::expand_uuid;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::{
    DiscoveredCharacteristic, DiscoveredDescriptor, DiscoveredService, GattAdapter, GattSession,
    NotificationHandler,
};
use crate::error::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Unparseable UUID strings map to the nil UUID.
fn parse(uuid: &str) -> Uuid {
    expand_uuid(uuid).unwrap_or_default()
}

async fn simulate_latency(latency_ms: &AtomicU64) {
    let latency = latency_ms.load(Ordering::Relaxed);
    if latency > 0 {
        tokio::time::sleep(Duration::from_millis(latency)).await;
    }
}

/// A write recorded by a [`MockPeripheral`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockWrite {
    pub characteristic: Uuid,
    pub data: Vec<u8>,
    pub with_response: bool,
}

/// Snapshot of a peripheral's call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockCounters {
    pub dials: u32,
    pub discoveries: u32,
    pub reads: u32,
    pub writes: u32,
    pub descriptor_reads: u32,
    pub subscribes: u32,
    pub unsubscribes: u32,
    pub cancels: u32,
}

#[derive(Default)]
struct Counters {
    dials: AtomicU32,
    discoveries: AtomicU32,
    reads: AtomicU32,
    writes: AtomicU32,
    descriptor_reads: AtomicU32,
    subscribes: AtomicU32,
    unsubscribes: AtomicU32,
    cancels: AtomicU32,
}

fn bump(counter: &AtomicU32) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// A simulated peripheral.
pub struct MockPeripheral {
    address: String,
    profile: Vec<DiscoveredService>,
    values: Mutex<HashMap<Uuid, Vec<u8>>>,
    descriptor_values: HashMap<(Uuid, Uuid), Vec<u8>>,
    handlers: Mutex<HashMap<Uuid, NotificationHandler>>,
    writes: Mutex<Vec<MockWrite>>,
    connected: AtomicBool,
    link_lost: Mutex<CancellationToken>,
    counters: Counters,
    dial_failure: Mutex<Option<String>>,
    fail_discovery: AtomicBool,
    fail_subscribe: AtomicBool,
    fail_unsubscribe: AtomicBool,
    /// Simulated dial latency in milliseconds (0 = no delay).
    dial_latency_ms: AtomicU64,
    /// Simulated characteristic read latency in milliseconds.
    read_latency_ms: AtomicU64,
    /// Simulated descriptor read latency in milliseconds.
    descriptor_latency_ms: AtomicU64,
    /// Delay before a subscribe is confirmed, in milliseconds.
    subscribe_latency_ms: AtomicU64,
}

impl std::fmt::Debug for MockPeripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPeripheral")
            .field("address", &self.address)
            .field("services", &self.profile.len())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl MockPeripheral {
    pub fn builder() -> MockPeripheralBuilder {
        MockPeripheralBuilder::new()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> MockCounters {
        let c = &self.counters;
        let get = |counter: &AtomicU32| counter.load(Ordering::Relaxed);
        MockCounters {
            dials: get(&c.dials),
            discoveries: get(&c.discoveries),
            reads: get(&c.reads),
            writes: get(&c.writes),
            descriptor_reads: get(&c.descriptor_reads),
            subscribes: get(&c.subscribes),
            unsubscribes: get(&c.unsubscribes),
            cancels: get(&c.cancels),
        }
    }

    /// Writes received so far, oldest first.
    pub fn writes(&self) -> Vec<MockWrite> {
        lock(&self.writes).clone()
    }

    /// Current value of a characteristic.
    pub fn value(&self, characteristic: &str) -> Option<Vec<u8>> {
        lock(&self.values).get(&parse(characteristic)).cloned()
    }

    pub fn set_value(&self, characteristic: &str, data: impl Into<Vec<u8>>) {
        lock(&self.values).insert(parse(characteristic), data.into());
    }

    /// Characteristics with notifications enabled.
    pub fn notifying(&self) -> usize {
        lock(&self.handlers).len()
    }

    /// Deliver a notification synchronously. Returns `false` when nobody is
    /// subscribed to `characteristic`.
    pub fn notify(&self, characteristic: &str, data: &[u8]) -> bool {
        let handler = lock(&self.handlers).get(&parse(characteristic)).cloned();
        match handler {
            Some(handler) => {
                handler(data);
                true
            }
            None => false,
        }
    }

    /// Drop the link as if the peripheral went out of range.
    pub fn simulate_link_loss(&self) {
        self.connected.store(false, Ordering::Relaxed);
        lock(&self.handlers).clear();
        lock(&self.link_lost).cancel();
    }

    /// Make dials fail with `message` (mapped like a platform error), or
    /// succeed again with `None`.
    pub fn set_dial_failure(&self, message: Option<&str>) {
        *lock(&self.dial_failure) = message.map(str::to_string);
    }

    pub fn set_discovery_failure(&self, fail: bool) {
        self.fail_discovery.store(fail, Ordering::Relaxed);
    }

    pub fn set_subscribe_failure(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::Relaxed);
    }

    pub fn set_unsubscribe_failure(&self, fail: bool) {
        self.fail_unsubscribe.store(fail, Ordering::Relaxed);
    }

    /// Set simulated dial latency. `Duration::ZERO` disables it.
    pub fn set_dial_latency(&self, latency: Duration) {
        self.dial_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Set simulated characteristic read latency.
    pub fn set_read_latency(&self, latency: Duration) {
        self.read_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Set simulated descriptor read latency.
    pub fn set_descriptor_latency(&self, latency: Duration) {
        self.descriptor_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Set how long a subscribe takes to be confirmed. The peripheral starts
    /// notifying as soon as the request arrives.
    pub fn set_subscribe_latency(&self, latency: Duration) {
        self.subscribe_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    fn check_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::not_connected())
        }
    }

    async fn dial(self: &Arc<Self>) -> Result<Arc<dyn GattSession>> {
        bump(&self.counters.dials);
        simulate_latency(&self.dial_latency_ms).await;
        let failure = lock(&self.dial_failure).clone();
        if let Some(message) = failure {
            return Err(Error::from_adapter_message(message));
        }
        if self.connected.swap(true, Ordering::Relaxed) {
            return Err(Error::already_connected());
        }
        *lock(&self.link_lost) = CancellationToken::new();
        Ok(Arc::new(MockSession {
            peripheral: self.clone(),
        }))
    }
}

/// Session handed out by [`MockAdapter::dial`].
struct MockSession {
    peripheral: Arc<MockPeripheral>,
}

#[async_trait]
impl GattSession for MockSession {
    fn address(&self) -> String {
        self.peripheral.address.clone()
    }

    async fn discover_profile(&self) -> Result<Vec<DiscoveredService>> {
        let p = &self.peripheral;
        bump(&p.counters.discoveries);
        p.check_connected()?;
        if p.fail_discovery.load(Ordering::Relaxed) {
            return Err(Error::Adapter("mock discovery failure".into()));
        }
        Ok(p.profile.clone())
    }

    async fn read_characteristic(
        &self,
        characteristic: &DiscoveredCharacteristic,
    ) -> Result<Vec<u8>> {
        let p = &self.peripheral;
        bump(&p.counters.reads);
        simulate_latency(&p.read_latency_ms).await;
        p.check_connected()?;
        Ok(lock(&p.values)
            .get(&characteristic.uuid)
            .cloned()
            .unwrap_or_default())
    }

    async fn write_characteristic(
        &self,
        characteristic: &DiscoveredCharacteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let p = &self.peripheral;
        bump(&p.counters.writes);
        p.check_connected()?;
        lock(&p.values).insert(characteristic.uuid, data.to_vec());
        lock(&p.writes).push(MockWrite {
            characteristic: characteristic.uuid,
            data: data.to_vec(),
            with_response,
        });
        Ok(())
    }

    async fn read_descriptor(&self, descriptor: &DiscoveredDescriptor) -> Result<Vec<u8>> {
        let p = &self.peripheral;
        bump(&p.counters.descriptor_reads);
        simulate_latency(&p.descriptor_latency_ms).await;
        p.check_connected()?;
        p.descriptor_values
            .get(&(descriptor.characteristic_uuid, descriptor.uuid))
            .cloned()
            .ok_or_else(|| Error::Adapter(format!("descriptor {} has no value", descriptor.uuid)))
    }

    async fn subscribe(
        &self,
        characteristic: &DiscoveredCharacteristic,
        handler: NotificationHandler,
    ) -> Result<()> {
        let p = &self.peripheral;
        bump(&p.counters.subscribes);
        p.check_connected()?;
        if p.fail_subscribe.load(Ordering::Relaxed) {
            return Err(Error::Adapter("mock subscribe failure".into()));
        }
        lock(&p.handlers).insert(characteristic.uuid, handler);
        simulate_latency(&p.subscribe_latency_ms).await;
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: &DiscoveredCharacteristic) -> Result<()> {
        let p = &self.peripheral;
        bump(&p.counters.unsubscribes);
        lock(&p.handlers).remove(&characteristic.uuid);
        if p.fail_unsubscribe.load(Ordering::Relaxed) {
            return Err(Error::Adapter("mock unsubscribe failure".into()));
        }
        p.check_connected()
    }

    async fn cancel_connection(&self) -> Result<()> {
        let p = &self.peripheral;
        bump(&p.counters.cancels);
        p.connected.store(false, Ordering::Relaxed);
        lock(&p.handlers).clear();
        Ok(())
    }

    fn link_lost(&self) -> CancellationToken {
        lock(&self.peripheral.link_lost).clone()
    }
}

/// Adapter that dials registered [`MockPeripheral`]s by address.
#[derive(Debug, Default)]
pub struct MockAdapter {
    peripherals: Mutex<HashMap<String, Arc<MockPeripheral>>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peripheral and return a shared handle to it.
    pub fn add(&self, peripheral: MockPeripheral) -> Arc<MockPeripheral> {
        let peripheral = Arc::new(peripheral);
        lock(&self.peripherals).insert(peripheral.address.to_lowercase(), peripheral.clone());
        peripheral
    }

    pub fn peripheral(&self, address: &str) -> Option<Arc<MockPeripheral>> {
        lock(&self.peripherals).get(&address.to_lowercase()).cloned()
    }
}

#[async_trait]
impl GattAdapter for MockAdapter {
    async fn dial(&self, address: &str) -> Result<Arc<dyn GattSession>> {
        let peripheral = self
            .peripheral(address)
            .ok_or_else(|| Error::device_not_found(address))?;
        peripheral.dial().await
    }
}

/// Builder for [`MockPeripheral`] profiles.
///
/// ```
/// use blim_core::mock::MockPeripheral;
/// use blim_types::CharacteristicProperties;
///
/// let peripheral = MockPeripheral::builder()
///     .address("AA:BB:CC:DD:EE:FF")
///     .characteristic("180d", "2a37", CharacteristicProperties::NOTIFY)
///     .descriptor("180d", "2a37", "2902", [0x00, 0x00])
///     .build();
/// assert_eq!(peripheral.address(), "AA:BB:CC:DD:EE:FF");
/// ```
#[derive(Debug)]
pub struct MockPeripheralBuilder {
    address: String,
    profile: Vec<DiscoveredService>,
    values: HashMap<Uuid, Vec<u8>>,
    descriptor_values: HashMap<(Uuid, Uuid), Vec<u8>>,
}

impl Default for MockPeripheralBuilder {
    fn default() -> Self {
        Self {
            address: format!("MOCK-{:06X}", rand::random::<u32>() % 0xFFFFFF),
            profile: Vec::new(),
            values: HashMap::new(),
            descriptor_values: HashMap::new(),
        }
    }
}

impl MockPeripheralBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn address(mut self, address: &str) -> Self {
        self.address = address.to_string();
        self
    }

    fn service_mut(&mut self, service: Uuid) -> &mut DiscoveredService {
        let index = match self.profile.iter().position(|s| s.uuid == service) {
            Some(index) => index,
            None => {
                self.profile.push(DiscoveredService {
                    uuid: service,
                    characteristics: Vec::new(),
                });
                self.profile.len() - 1
            }
        };
        &mut self.profile[index]
    }

    fn characteristic_mut(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
    ) -> &mut DiscoveredCharacteristic {
        let entry = self.service_mut(service);
        let index = match entry.characteristics.iter().position(|c| c.uuid == characteristic) {
            Some(index) => index,
            None => {
                entry.characteristics.push(DiscoveredCharacteristic {
                    uuid: characteristic,
                    service_uuid: service,
                    properties: CharacteristicProperties::empty(),
                    descriptors: Vec::new(),
                });
                entry.characteristics.len() - 1
            }
        };
        &mut entry.characteristics[index]
    }

    /// Add a characteristic (and its service, if new).
    #[must_use]
    pub fn characteristic(
        mut self,
        service: &str,
        characteristic: &str,
        properties: CharacteristicProperties,
    ) -> Self {
        self.characteristic_mut(parse(service), parse(characteristic))
            .properties = properties;
        self
    }

    /// Add a descriptor whose value is served by reads.
    #[must_use]
    pub fn descriptor(
        mut self,
        service: &str,
        characteristic: &str,
        descriptor: &str,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        let (service, characteristic, descriptor) =
            (parse(service), parse(characteristic), parse(descriptor));
        self.characteristic_mut(service, characteristic)
            .descriptors
            .push(DiscoveredDescriptor {
                uuid: descriptor,
                service_uuid: service,
                characteristic_uuid: characteristic,
                value: None,
            });
        self.descriptor_values
            .insert((characteristic, descriptor), value.into());
        self
    }

    /// Initial value returned by characteristic reads.
    #[must_use]
    pub fn value(mut self, characteristic: &str, data: impl Into<Vec<u8>>) -> Self {
        self.values.insert(parse(characteristic), data.into());
        self
    }

    pub fn build(self) -> MockPeripheral {
        MockPeripheral {
            address: self.address,
            profile: self.profile,
            values: Mutex::new(self.values),
            descriptor_values: self.descriptor_values,
            handlers: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            link_lost: Mutex::new(CancellationToken::new()),
            counters: Counters::default(),
            dial_failure: Mutex::new(None),
            fail_discovery: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            fail_unsubscribe: AtomicBool::new(false),
            dial_latency_ms: AtomicU64::new(0),
            read_latency_ms: AtomicU64::new(0),
            descriptor_latency_ms: AtomicU64::new(0),
            subscribe_latency_ms: AtomicU64::new(0),
        }
    }
}

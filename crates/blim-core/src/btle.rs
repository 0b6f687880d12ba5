//! btleplug-backed radio adapter.
//!
//! [`BtleplugAdapter`] resolves peripherals by address (or platform id on
//! macOS), scanning briefly when the peripheral is not cached. Each session
//! runs two background tasks until it is dropped or released: a dispatcher
//! routing the peripheral's notification stream to handlers by
//! characteristic UUID, and a watcher that turns the adapter's
//! `DeviceDisconnected` event into link loss.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use blim_types::CharacteristicProperties;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Descriptor, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::adapter::{
    DiscoveredCharacteristic, DiscoveredDescriptor, DiscoveredService, GattAdapter, GattSession,
    NotificationHandler,
};
use crate::error::{ConnectionState, Error, Result};
use crate::util::{HIDDEN_ADDRESS, addresses_match, create_identifier, format_peripheral_id};

/// How long to scan for a peripheral that is not in the adapter's cache.
pub const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Map a btleplug error onto the engine's taxonomy.
fn normalize(err: btleplug::Error, operation: &str, uuid: Option<&Uuid>) -> Error {
    let target = uuid.map(ToString::to_string).unwrap_or_default();
    match err {
        btleplug::Error::NotConnected => Error::not_connected().context(operation.to_string()),
        btleplug::Error::TimedOut(duration) => {
            Error::timeout(format!("{operation} {target}").trim_end().to_string(), duration)
        }
        btleplug::Error::NotSupported(_) => Error::unsupported(operation, target),
        btleplug::Error::Other(source) => Error::from_adapter_message(source.to_string()),
        other => Error::Bluetooth(other),
    }
}

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters.into_iter().next().ok_or_else(|| {
        Error::Connection(ConnectionState::BluetoothOff).context("no Bluetooth adapter found")
    })
}

/// Radio adapter backed by the platform Bluetooth stack.
#[derive(Debug, Clone)]
pub struct BtleplugAdapter {
    adapter: Adapter,
    scan_duration: Duration,
}

impl BtleplugAdapter {
    /// Use the first adapter on the system.
    pub async fn new() -> Result<Self> {
        Ok(Self::from_adapter(get_adapter().await?))
    }

    pub fn from_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            scan_duration: DEFAULT_SCAN_DURATION,
        }
    }

    /// Set how long to scan for uncached peripherals.
    #[must_use]
    pub fn scan_duration(mut self, duration: Duration) -> Self {
        self.scan_duration = duration;
        self
    }

    pub fn inner(&self) -> &Adapter {
        &self.adapter
    }

    async fn find_cached(&self, address: &str) -> Result<Option<Peripheral>> {
        for peripheral in self.adapter.peripherals().await? {
            let id = format_peripheral_id(&peripheral.id());
            if addresses_match(&id, address) {
                debug!(%id, "matched by peripheral id");
                return Ok(Some(peripheral));
            }
            if let Ok(Some(props)) = peripheral.properties().await {
                let reported = props.address.to_string();
                if reported != HIDDEN_ADDRESS && addresses_match(&reported, address) {
                    debug!(address = %reported, "matched by address");
                    return Ok(Some(peripheral));
                }
            }
        }
        Ok(None)
    }

    /// Find `address` in the cache, scanning once if needed.
    async fn find_peripheral(&self, address: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self.find_cached(address).await? {
            return Ok(peripheral);
        }

        info!(%address, scan = ?self.scan_duration, "peripheral not cached, scanning");
        self.adapter.start_scan(ScanFilter::default()).await?;
        sleep(self.scan_duration).await;
        self.adapter.stop_scan().await?;

        self.find_cached(address)
            .await?
            .ok_or_else(|| Error::device_not_found(address))
    }
}

#[async_trait]
impl GattAdapter for BtleplugAdapter {
    #[tracing::instrument(level = "debug", skip_all, fields(address = %address))]
    async fn dial(&self, address: &str) -> Result<Arc<dyn GattSession>> {
        let peripheral = self.find_peripheral(address).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| normalize(e, "connect", None))?;

        let session = BtleplugSession::start(&self.adapter, peripheral).await?;
        Ok(Arc::new(session))
    }
}

type Handlers = Arc<Mutex<HashMap<Uuid, NotificationHandler>>>;

/// One live btleplug connection.
struct BtleplugSession {
    address: String,
    peripheral: Peripheral,
    characteristics: Mutex<HashMap<(Uuid, Uuid), Characteristic>>,
    handlers: Handlers,
    link_lost: CancellationToken,
    /// Stops the dispatcher and watcher tasks.
    stop: CancellationToken,
}

impl BtleplugSession {
    async fn start(adapter: &Adapter, peripheral: Peripheral) -> Result<Self> {
        let address = match peripheral.properties().await {
            Ok(Some(props)) => create_identifier(&props.address.to_string(), &peripheral.id()),
            _ => format_peripheral_id(&peripheral.id()),
        };

        let handlers: Handlers = Arc::default();
        let link_lost = CancellationToken::new();
        let stop = CancellationToken::new();

        let mut notifications = peripheral.notifications().await?;
        let routes = handlers.clone();
        let dispatch_stop = stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = dispatch_stop.cancelled() => break,
                    next = notifications.next() => {
                        let Some(notification) = next else { break };
                        let handler = lock(&routes).get(&notification.uuid).cloned();
                        match handler {
                            Some(handler) => handler(&notification.value),
                            None => {
                                trace!(uuid = %notification.uuid, "notification without handler")
                            }
                        }
                    }
                }
            }
        });

        let mut events = adapter.events().await?;
        let peripheral_id = peripheral.id();
        let watch_stop = stop.clone();
        let lost = link_lost.clone();
        let watched = address.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = watch_stop.cancelled() => break,
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                            warn!(address = %watched, "peripheral disconnected");
                            lost.cancel();
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        });

        Ok(Self {
            address,
            peripheral,
            characteristics: Mutex::new(HashMap::new()),
            handlers,
            link_lost,
            stop,
        })
    }

    fn lookup(&self, characteristic: &DiscoveredCharacteristic) -> Result<Characteristic> {
        lock(&self.characteristics)
            .get(&(characteristic.service_uuid, characteristic.uuid))
            .cloned()
            .ok_or_else(|| {
                Error::characteristic_not_found(
                    characteristic.service_uuid.to_string(),
                    characteristic.uuid.to_string(),
                )
            })
    }
}

impl Drop for BtleplugSession {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[async_trait]
impl GattSession for BtleplugSession {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn discover_profile(&self) -> Result<Vec<DiscoveredService>> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| normalize(e, "discover services", None))?;

        let mut cache = HashMap::new();
        let services = self
            .peripheral
            .services()
            .into_iter()
            .map(|service| DiscoveredService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|characteristic| {
                        let discovered = DiscoveredCharacteristic {
                            uuid: characteristic.uuid,
                            service_uuid: characteristic.service_uuid,
                            properties: CharacteristicProperties::from_bits_retain(
                                characteristic.properties.bits(),
                            ),
                            descriptors: characteristic
                                .descriptors
                                .iter()
                                .map(|d| DiscoveredDescriptor {
                                    uuid: d.uuid,
                                    service_uuid: d.service_uuid,
                                    characteristic_uuid: d.characteristic_uuid,
                                    value: None,
                                })
                                .collect(),
                        };
                        cache.insert(
                            (characteristic.service_uuid, characteristic.uuid),
                            characteristic,
                        );
                        discovered
                    })
                    .collect(),
            })
            .collect::<Vec<_>>();

        debug!(services = services.len(), characteristics = cache.len(), "profile discovered");
        *lock(&self.characteristics) = cache;
        Ok(services)
    }

    async fn read_characteristic(
        &self,
        characteristic: &DiscoveredCharacteristic,
    ) -> Result<Vec<u8>> {
        let target = self.lookup(characteristic)?;
        self.peripheral
            .read(&target)
            .await
            .map_err(|e| normalize(e, "read", Some(&characteristic.uuid)))
    }

    async fn write_characteristic(
        &self,
        characteristic: &DiscoveredCharacteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let target = self.lookup(characteristic)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(&target, data, write_type)
            .await
            .map_err(|e| normalize(e, "write", Some(&characteristic.uuid)))
    }

    async fn read_descriptor(&self, descriptor: &DiscoveredDescriptor) -> Result<Vec<u8>> {
        let target = Descriptor {
            uuid: descriptor.uuid,
            service_uuid: descriptor.service_uuid,
            characteristic_uuid: descriptor.characteristic_uuid,
        };
        self.peripheral
            .read_descriptor(&target)
            .await
            .map_err(|e| normalize(e, "read descriptor", Some(&descriptor.uuid)))
    }

    async fn subscribe(
        &self,
        characteristic: &DiscoveredCharacteristic,
        handler: NotificationHandler,
    ) -> Result<()> {
        let target = self.lookup(characteristic)?;
        lock(&self.handlers).insert(characteristic.uuid, handler);
        if let Err(err) = self.peripheral.subscribe(&target).await {
            lock(&self.handlers).remove(&characteristic.uuid);
            return Err(normalize(err, "subscribe", Some(&characteristic.uuid)));
        }
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: &DiscoveredCharacteristic) -> Result<()> {
        lock(&self.handlers).remove(&characteristic.uuid);
        let target = self.lookup(characteristic)?;
        self.peripheral
            .unsubscribe(&target)
            .await
            .map_err(|e| normalize(e, "unsubscribe", Some(&characteristic.uuid)))
    }

    async fn cancel_connection(&self) -> Result<()> {
        self.stop.cancel();
        lock(&self.handlers).clear();
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| normalize(e, "disconnect", None))
    }

    fn link_lost(&self) -> CancellationToken {
        self.link_lost.clone()
    }
}

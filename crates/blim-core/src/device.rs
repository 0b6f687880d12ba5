//! Discovered peripherals and their connection lifecycle.
//!
//! A [`Device`] is created when a peripheral is first seen, refreshed from
//! later advertisements, and owns at most one [`Connection`]. Connecting
//! creates the connection on demand; disconnecting tears it down and drops it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use blim_types::advertisement::{Advertisement, is_valid_device_name, name_from_manufacturer_data};
use blim_types::uuid::normalize_uuid;
use blim_types::CharacteristicProperties;
use bytes::Bytes;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::adapter::GattAdapter;
use crate::config::{ConnectOptions, ConnectionConfig};
use crate::connection::Connection;
use crate::error::{Error, Result};

const GAP_SERVICE: &str = "1800";
const DEVICE_NAME: &str = "2a00";

/// A peripheral seen by the scanner.
///
/// Not `Clone`: a device owns its live connection. Share it behind a lock if
/// several tasks need it.
pub struct Device {
    address: String,
    name: Option<String>,
    rssi: i16,
    tx_power: Option<i16>,
    connectable: bool,
    manufacturer_data: Bytes,
    /// Normalized, sorted and deduplicated.
    services: Vec<String>,
    service_data: BTreeMap<String, Bytes>,
    config: ConnectionConfig,
    connection: Option<Arc<Connection>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.address)
            .field("name", &self.name)
            .field("rssi", &self.rssi)
            .field("services", &self.services)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Device {
    /// A device known only by its address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
            rssi: 0,
            tx_power: None,
            connectable: false,
            manufacturer_data: Bytes::new(),
            services: Vec::new(),
            service_data: BTreeMap::new(),
            config: ConnectionConfig::default(),
            connection: None,
        }
    }

    /// A device populated from its first advertisement.
    pub fn from_advertisement(advertisement: &Advertisement) -> Self {
        let mut device = Self::new(advertisement.address.clone());
        device.update(advertisement);
        device
    }

    /// Configuration used when the connection is created.
    #[must_use]
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Merge a re-advertisement into the device.
    ///
    /// Fields the advertisement leaves empty keep their previous value;
    /// advertised services and service data accumulate.
    pub fn update(&mut self, advertisement: &Advertisement) {
        let advertised = advertisement
            .local_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty());
        if let Some(name) = advertised {
            self.name = Some(name.to_string());
        } else if self.name.is_none() {
            self.name = name_from_manufacturer_data(&advertisement.manufacturer_data);
        }

        self.rssi = advertisement.rssi;
        self.connectable = advertisement.connectable;
        if advertisement.tx_power.is_some() {
            self.tx_power = advertisement.tx_power;
        }
        if !advertisement.manufacturer_data.is_empty() {
            self.manufacturer_data = advertisement.manufacturer_data.clone();
        }

        self.services
            .extend(advertisement.services.iter().map(|s| normalize_uuid(s)));
        self.services.sort();
        self.services.dedup();

        for (uuid, data) in &advertisement.service_data {
            self.service_data.insert(normalize_uuid(uuid), data.clone());
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Advertised, manufacturer-derived or GAP-read name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn rssi(&self) -> i16 {
        self.rssi
    }

    pub fn tx_power(&self) -> Option<i16> {
        self.tx_power
    }

    pub fn is_connectable(&self) -> bool {
        self.connectable
    }

    pub fn manufacturer_data(&self) -> &Bytes {
        &self.manufacturer_data
    }

    /// Advertised service UUIDs, normalized and sorted.
    pub fn services(&self) -> &[String] {
        &self.services
    }

    pub fn service_data(&self) -> &BTreeMap<String, Bytes> {
        &self.service_data
    }

    /// The live connection, if one exists.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|connection| connection.is_connected())
    }

    /// Connect through `adapter`, creating the connection if needed.
    ///
    /// After connecting, the name is refreshed from the GAP Device Name
    /// characteristic when the peripheral exposes a readable one.
    ///
    /// # Errors
    ///
    /// Everything [`Connection::connect`] returns, plus
    /// [`Error::InvalidConfig`] if the device's configuration is invalid.
    #[tracing::instrument(level = "info", skip_all, fields(address = %self.address))]
    pub async fn connect(
        &mut self,
        adapter: Arc<dyn GattAdapter>,
        options: ConnectOptions,
    ) -> Result<Arc<Connection>> {
        let connection = match &self.connection {
            Some(connection) => connection.clone(),
            None => {
                let connection = Arc::new(Connection::with_config(adapter, self.config.clone())?);
                self.connection = Some(connection.clone());
                connection
            }
        };

        connection.connect(&self.address, options).await?;

        if let Some(name) = read_gap_name(&connection).await {
            debug!(%name, "name from GAP");
            self.name = Some(name);
        }
        info!(name = ?self.name, "device connected");
        Ok(connection)
    }

    /// Disconnect and discard the connection. A no-op without one.
    #[tracing::instrument(level = "info", skip_all, fields(address = %self.address))]
    pub async fn disconnect(&mut self) -> Result<()> {
        match self.connection.take() {
            Some(connection) => connection.disconnect().await,
            None => Ok(()),
        }
    }

    /// Write `data` to the characteristic `uuid` (in whichever service holds
    /// it) in chunks of the configured size.
    ///
    /// Chunks are separated by the configured delay and the whole transfer
    /// holds the connection's write lock, so other writes cannot interleave.
    /// Characteristics with the WRITE property are written with response.
    ///
    /// # Errors
    ///
    /// - a not-connected [`Error::Connection`] without a connection
    /// - [`Error::NotFound`] if no service has the characteristic
    /// - [`Error::Unsupported`] if it accepts no writes
    /// - the first failing chunk's error
    #[tracing::instrument(level = "debug", skip_all, fields(uuid = %uuid, len = data.len()))]
    pub async fn write_chunked(&self, uuid: &str, data: &[u8]) -> Result<()> {
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(Error::not_connected)?;
        let characteristic = connection.find_characteristic(uuid)?;
        let properties = characteristic.properties();
        if !properties.can_write() {
            return Err(Error::unsupported("write", characteristic.uuid()));
        }
        let with_response = properties.contains(CharacteristicProperties::WRITE);
        let chunk_size = connection.config().write_chunk_size;
        let delay = connection.config().chunk_delay;

        let _guard = characteristic.link().write_lock.lock().await;
        for (index, chunk) in data.chunks(chunk_size).enumerate() {
            if index > 0 && !delay.is_zero() {
                sleep(delay).await;
            }
            characteristic
                .write_locked(chunk, with_response, Duration::ZERO)
                .await
                .map_err(|e| e.context(format!("chunk {index}")))?;
        }
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.is_connected() {
            warn!(
                address = %self.address,
                "Device dropped without calling disconnect(); \
                 the link stays up until the connection is dropped"
            );
        }
    }
}

/// Read GAP Device Name, returning it only when it passes the name rules.
async fn read_gap_name(connection: &Connection) -> Option<String> {
    let characteristic = connection.characteristic(GAP_SERVICE, DEVICE_NAME).ok()?;
    if !characteristic.properties().can_read() {
        return None;
    }
    match characteristic.read(Duration::ZERO).await {
        Ok(raw) => decode_name(&raw),
        Err(err) => {
            debug!(error = %err, "device name read failed");
            None
        }
    }
}

fn decode_name(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let name = text.trim_matches('\0').trim();
    is_valid_device_name(name).then(|| name.to_string())
}

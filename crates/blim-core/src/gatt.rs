//! Discovered GATT topology: services, characteristics and descriptors.
//!
//! These objects are created at connect time and survive reconnects: a
//! reconnect refreshes each characteristic's live handle instead of
//! replacing the object, so pipelines, cached values and direct subscribers
//! stay attached.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use blim_types::descriptor::{
    DescriptorValue, PresentationFormat, parse_descriptor_value, resolve_aggregate_formats,
};
use blim_types::uuid::{self as uuids, known_name, normalize_uuid};
use blim_types::CharacteristicProperties;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::adapter::{DiscoveredCharacteristic, GattSession};
use crate::error::{DescriptorError, Error, Result};
use crate::pipeline::NotificationPipeline;
use crate::pool::Value;

/// Default timeout for characteristic reads.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for characteristic writes.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Session slot shared by a connection and every characteristic it owns.
pub(crate) struct Link {
    session: RwLock<Option<Arc<dyn GattSession>>>,
    /// Serializes writes across the whole connection.
    pub(crate) write_lock: Mutex<()>,
}

impl Link {
    pub(crate) fn new() -> Self {
        Self {
            session: RwLock::new(None),
            write_lock: Mutex::new(()),
        }
    }

    pub(crate) fn session(&self) -> Option<Arc<dyn GattSession>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set(&self, session: Option<Arc<dyn GattSession>>) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = session;
    }
}

/// A GATT descriptor with its discovery-time value.
#[derive(Debug)]
pub struct Descriptor {
    uuid: String,
    raw: Option<Bytes>,
    read_error: Option<DescriptorError>,
    parsed: OnceLock<std::result::Result<Option<DescriptorValue>, DescriptorError>>,
}

impl Descriptor {
    pub(crate) fn new(uuid: &str, raw: Option<Bytes>, read_error: Option<DescriptorError>) -> Self {
        Self {
            uuid: normalize_uuid(uuid),
            raw,
            read_error,
            parsed: OnceLock::new(),
        }
    }

    /// Normalized UUID.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn known_name(&self) -> Option<&'static str> {
        known_name(&self.uuid)
    }

    /// Raw bytes read at discovery, if reading was enabled and succeeded.
    pub fn raw(&self) -> Option<&Bytes> {
        self.raw.as_ref()
    }

    /// Typed value, parsed on first access.
    ///
    /// `Ok(None)` means nothing was read (reads disabled or empty payload).
    /// Read failures and parse failures come back as [`DescriptorError`].
    pub fn parsed(&self) -> std::result::Result<Option<&DescriptorValue>, &DescriptorError> {
        if let Some(err) = &self.read_error {
            return Err(err);
        }
        self.parsed
            .get_or_init(|| match &self.raw {
                Some(raw) => {
                    parse_descriptor_value(&self.uuid, raw).map_err(DescriptorError::Parse)
                }
                None => Ok(None),
            })
            .as_ref()
            .map(Option::as_ref)
    }

    /// Error recorded for this descriptor, from reading or parsing.
    pub fn error(&self) -> Option<&DescriptorError> {
        self.parsed().err()
    }
}

/// A characteristic: properties, descriptors, live handle and pipeline.
pub struct Characteristic {
    uuid: String,
    service_uuid: String,
    properties: CharacteristicProperties,
    descriptors: Vec<Descriptor>,
    handle: RwLock<Option<DiscoveredCharacteristic>>,
    link: Arc<Link>,
    pipeline: NotificationPipeline,
    value: RwLock<Option<Bytes>>,
    notifying: AtomicBool,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl std::fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Characteristic")
            .field("uuid", &self.uuid)
            .field("service_uuid", &self.service_uuid)
            .field("properties", &self.properties)
            .field("descriptors", &self.descriptors.len())
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

impl Characteristic {
    pub(crate) fn new(
        handle: DiscoveredCharacteristic,
        mut descriptors: Vec<Descriptor>,
        link: Arc<Link>,
        pipeline: NotificationPipeline,
    ) -> Self {
        descriptors.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        Self {
            uuid: uuids::uuid_key(&handle.uuid),
            service_uuid: uuids::uuid_key(&handle.service_uuid),
            properties: handle.properties,
            descriptors,
            handle: RwLock::new(Some(handle)),
            link,
            pipeline,
            value: RwLock::new(None),
            notifying: AtomicBool::new(false),
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Timeouts used when a read or write is given `Duration::ZERO`.
    pub(crate) fn with_default_timeouts(mut self, read: Duration, write: Duration) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    /// Normalized UUID.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Normalized UUID of the owning service.
    pub fn service_uuid(&self) -> &str {
        &self.service_uuid
    }

    pub fn known_name(&self) -> Option<&'static str> {
        known_name(&self.uuid)
    }

    pub fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    /// Descriptors sorted by UUID.
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    /// Look up a descriptor by UUID (any spelling).
    pub fn descriptor(&self, uuid: &str) -> Result<&Descriptor> {
        let key = normalize_uuid(uuid);
        self.descriptors
            .iter()
            .find(|d| d.uuid == key)
            .ok_or_else(|| Error::descriptor_not_found(&self.uuid, uuid))
    }

    /// Presentation formats referenced by the aggregate format descriptor,
    /// matched by position against this characteristic's 0x2904 descriptors.
    ///
    /// Returns `None` when there is no aggregate format descriptor.
    pub fn aggregate_format(
        &self,
    ) -> Option<std::result::Result<Vec<PresentationFormat>, DescriptorError>> {
        let aggregate = self.descriptor(uuids::AGGREGATE_FORMAT).ok()?;
        let handles = match aggregate.parsed() {
            Ok(Some(DescriptorValue::AggregateFormat(handles))) => handles.clone(),
            Ok(_) => Vec::new(),
            Err(err) => return Some(Err(err.clone())),
        };

        let formats: Vec<PresentationFormat> = self
            .descriptors
            .iter()
            .filter(|d| d.uuid == uuids::PRESENTATION_FORMAT)
            .filter_map(|d| match d.parsed() {
                Ok(Some(DescriptorValue::PresentationFormat(format))) => Some(*format),
                _ => None,
            })
            .collect();

        Some(resolve_aggregate_formats(&handles, &formats).map_err(DescriptorError::Parse))
    }

    /// Last value received by notification or read.
    pub fn value(&self) -> Option<Bytes> {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_value(&self, value: Bytes) {
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    /// Remote notifications are currently enabled.
    pub fn is_notifying(&self) -> bool {
        self.notifying.load(Ordering::Acquire)
    }

    pub(crate) fn set_notifying(&self, notifying: bool) {
        self.notifying.store(notifying, Ordering::Release);
    }

    pub fn pipeline(&self) -> &NotificationPipeline {
        &self.pipeline
    }

    /// Register a callback invoked synchronously for every notification.
    ///
    /// The [`Value`] is only valid during the call.
    pub fn add_direct_subscriber<F>(&self, subscriber: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.pipeline.add_subscriber(Arc::new(subscriber));
    }

    /// Live adapter handle; `None` until discovered.
    pub(crate) fn handle(&self) -> Option<DiscoveredCharacteristic> {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn refresh_handle(&self, handle: DiscoveredCharacteristic) {
        *self.handle.write().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Handle an incoming notification payload.
    ///
    /// Updates the cached value, fans out to direct subscribers and then
    /// queues the value for subscription workers.
    pub(crate) fn process_notification(&self, data: &[u8]) {
        let value = self.pipeline.pool().acquire(data);
        self.set_value(value.to_bytes());
        self.pipeline.notify_subscribers(&value);
        let outcome = self.pipeline.enqueue(value);
        trace!(uuid = %self.uuid, ?outcome, "notification processed");
    }

    fn live(&self, operation: &str) -> Result<(Arc<dyn GattSession>, DiscoveredCharacteristic)> {
        let session = self
            .link
            .session()
            .ok_or_else(|| Error::not_connected().context(format!("{operation} {}", self.uuid)))?;
        let handle = self
            .handle()
            .ok_or_else(|| Error::not_connected().context(format!("{operation} {}", self.uuid)))?;
        Ok((session, handle))
    }

    /// Read the current value from the peripheral.
    ///
    /// A zero `read_timeout` uses the connection's configured default
    /// ([`DEFAULT_READ_TIMEOUT`] unless changed).
    ///
    /// # Errors
    ///
    /// - [`Error::Unsupported`] if the characteristic is not readable
    /// - a not-connected [`Error::Connection`] without a live session
    /// - [`Error::Timeout`] naming the UUID and duration
    #[tracing::instrument(level = "debug", skip_all, fields(uuid = %self.uuid))]
    pub async fn read(&self, read_timeout: Duration) -> Result<Bytes> {
        if !self.properties.can_read() {
            return Err(Error::unsupported("read", &self.uuid));
        }
        let (session, handle) = self.live("read")?;
        let read_timeout = if read_timeout.is_zero() {
            self.read_timeout
        } else {
            read_timeout
        };

        let data = timeout(read_timeout, session.read_characteristic(&handle))
            .await
            .map_err(|_| {
                Error::timeout(format!("read characteristic {}", self.uuid), read_timeout)
            })??;

        let data = Bytes::from(data);
        self.set_value(data.clone());
        debug!(len = data.len(), "characteristic read");
        Ok(data)
    }

    /// Write `data` to the peripheral. Writes on one connection are
    /// serialized.
    ///
    /// A zero `write_timeout` uses the connection's configured default.
    ///
    /// # Errors
    ///
    /// - [`Error::Unsupported`] if the characteristic accepts no writes
    /// - a not-connected [`Error::Connection`] without a live session
    /// - [`Error::Timeout`] naming the UUID and duration
    #[tracing::instrument(level = "debug", skip_all, fields(uuid = %self.uuid, len = data.len()))]
    pub async fn write(
        &self,
        data: &[u8],
        with_response: bool,
        write_timeout: Duration,
    ) -> Result<()> {
        if !self.properties.can_write() {
            return Err(Error::unsupported("write", &self.uuid));
        }
        let _guard = self.link.write_lock.lock().await;
        self.write_locked(data, with_response, write_timeout).await
    }

    /// Write while the caller already holds the connection's write lock.
    pub(crate) async fn write_locked(
        &self,
        data: &[u8],
        with_response: bool,
        write_timeout: Duration,
    ) -> Result<()> {
        let (session, handle) = self.live("write")?;
        let write_timeout = if write_timeout.is_zero() {
            self.write_timeout
        } else {
            write_timeout
        };

        timeout(
            write_timeout,
            session.write_characteristic(&handle, data, with_response),
        )
        .await
        .map_err(|_| Error::timeout(format!("write characteristic {}", self.uuid), write_timeout))?
    }

    pub(crate) fn link(&self) -> &Arc<Link> {
        &self.link
    }
}

/// A primary service and its characteristics.
#[derive(Debug, Clone)]
pub struct Service {
    uuid: String,
    characteristics: BTreeMap<String, Arc<Characteristic>>,
}

impl Service {
    pub(crate) fn new(
        uuid: String,
        characteristics: BTreeMap<String, Arc<Characteristic>>,
    ) -> Self {
        Self {
            uuid,
            characteristics,
        }
    }

    /// Normalized UUID.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn known_name(&self) -> Option<&'static str> {
        known_name(&self.uuid)
    }

    /// Characteristics ordered by UUID.
    pub fn characteristics(&self) -> impl Iterator<Item = &Arc<Characteristic>> {
        self.characteristics.values()
    }

    pub(crate) fn characteristic_map(&self) -> &BTreeMap<String, Arc<Characteristic>> {
        &self.characteristics
    }

    /// Look up a characteristic by UUID (any spelling).
    pub fn characteristic(&self, uuid: &str) -> Result<Arc<Characteristic>> {
        self.characteristics
            .get(&normalize_uuid(uuid))
            .cloned()
            .ok_or_else(|| Error::characteristic_not_found(&self.uuid, uuid))
    }

    pub fn len(&self) -> usize {
        self.characteristics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.characteristics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ValuePool;
    use blim_types::uuid::expand_uuid;

    fn characteristic(
        uuid: &str,
        props: CharacteristicProperties,
        descriptors: Vec<Descriptor>,
    ) -> Characteristic {
        let handle = DiscoveredCharacteristic {
            uuid: expand_uuid(uuid).unwrap(),
            service_uuid: expand_uuid("180d").unwrap(),
            properties: props,
            descriptors: Vec::new(),
        };
        Characteristic::new(
            handle,
            descriptors,
            Arc::new(Link::new()),
            NotificationPipeline::new(8, Arc::new(ValuePool::new())),
        )
    }

    #[test]
    fn test_descriptor_lazy_parse() {
        let d = Descriptor::new("0x2902", Some(Bytes::from_static(&[1, 0])), None);
        assert_eq!(d.uuid(), "2902");
        assert_eq!(d.known_name(), Some("Client Characteristic Configuration"));
        assert!(matches!(
            d.parsed(),
            Ok(Some(DescriptorValue::ClientConfig(c))) if c.notifications
        ));
    }

    #[test]
    fn test_descriptor_errors() {
        let error = DescriptorError::Timeout(Duration::from_secs(2));
        let timed_out = Descriptor::new("2901", None, Some(error));
        assert_eq!(timed_out.error().map(DescriptorError::reason), Some("timeout"));

        let malformed = Descriptor::new("2904", Some(Bytes::from_static(&[1, 2])), None);
        assert_eq!(malformed.error().map(DescriptorError::reason), Some("parse_error"));

        let skipped = Descriptor::new("2902", None, None);
        assert!(matches!(skipped.parsed(), Ok(None)));
    }

    #[test]
    fn test_descriptors_sorted_and_found() {
        let chr = characteristic(
            "2a37",
            CharacteristicProperties::NOTIFY,
            vec![
                Descriptor::new("2904", None, None),
                Descriptor::new("2901", None, None),
                Descriptor::new("2902", None, None),
            ],
        );
        let order: Vec<&str> = chr.descriptors().iter().map(Descriptor::uuid).collect();
        assert_eq!(order, vec!["2901", "2902", "2904"]);
        assert!(chr.descriptor("00002902-0000-1000-8000-00805f9b34fb").is_ok());

        let err = chr.descriptor("2906").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "descriptor \"2906\" not found in characteristic \"2a37\"");
    }

    #[test]
    fn test_aggregate_format_positional() {
        let fmt_a = [0x06, 0x00, 0x00, 0x27, 0x01, 0x00, 0x00];
        let fmt_b = [0x04, 0xff, 0x2f, 0x27, 0x01, 0x00, 0x00];
        let chr = characteristic(
            "2a37",
            CharacteristicProperties::READ,
            vec![
                Descriptor::new("2904", Some(Bytes::copy_from_slice(&fmt_a)), None),
                Descriptor::new("2904", Some(Bytes::copy_from_slice(&fmt_b)), None),
                Descriptor::new("2905", Some(Bytes::from_static(&[0x20, 0x00, 0x21, 0x00])), None),
            ],
        );
        let formats = chr.aggregate_format().unwrap().unwrap();
        assert_eq!(formats.len(), 2);
        assert_eq!(formats[0].format, 0x06);
        assert_eq!(formats[1].exponent, -1);
    }

    #[test]
    fn test_aggregate_format_count_mismatch() {
        let chr = characteristic(
            "2a37",
            CharacteristicProperties::READ,
            vec![Descriptor::new("2905", Some(Bytes::from_static(&[0x20, 0x00])), None)],
        );
        let err = chr.aggregate_format().unwrap().unwrap_err();
        assert_eq!(err.reason(), "parse_error");
        assert!(characteristic("2a38", CharacteristicProperties::READ, vec![])
            .aggregate_format()
            .is_none());
    }

    #[test]
    fn test_process_notification_updates_cache_and_queue() {
        let chr = characteristic("2a37", CharacteristicProperties::NOTIFY, vec![]);
        chr.process_notification(&[0x00, 0x48]);
        assert_eq!(chr.value().unwrap().as_ref(), &[0x00, 0x48]);
        assert_eq!(chr.pipeline().len(), 1);
    }

    #[tokio::test]
    async fn test_read_unsupported_names_uuid() {
        let chr = characteristic("2a39", CharacteristicProperties::WRITE, vec![]);
        let err = chr.read(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_unsupported());
        assert!(err.to_string().contains("2a39"));
    }

    #[tokio::test]
    async fn test_write_without_session_is_not_connected() {
        let chr = characteristic("2a39", CharacteristicProperties::WRITE, vec![]);
        let err = chr.write(&[1], true, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_connection_state(crate::error::ConnectionState::NotConnected));
    }
}

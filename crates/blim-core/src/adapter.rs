//! Radio adapter abstraction.
//!
//! The engine never talks to a Bluetooth stack directly. It dials through a
//! [`GattAdapter`] and drives the resulting [`GattSession`]; both are object
//! safe so a connection can hold `Arc<dyn GattAdapter>`. The crate ships a
//! btleplug-backed implementation ([`crate::btle::BtleplugAdapter`]) and an
//! in-memory one for tests ([`crate::mock::MockAdapter`]).

use std::sync::Arc;

use async_trait::async_trait;
use blim_types::CharacteristicProperties;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;

/// Handler the adapter calls with each notification payload.
///
/// Called from the adapter's delivery context; it must not block.
pub type NotificationHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// A descriptor as found during profile discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDescriptor {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    /// Value delivered together with discovery, if the platform provides it.
    pub value: Option<Vec<u8>>,
}

/// A characteristic as found during profile discovery. Also serves as the
/// live handle the session uses to address the characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<DiscoveredDescriptor>,
}

/// A primary service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

/// Factory for sessions: resolves an address and establishes the link.
#[async_trait]
pub trait GattAdapter: Send + Sync {
    /// Create the device handle for `address` and connect to it.
    ///
    /// The caller bounds this with its connect timeout.
    async fn dial(&self, address: &str) -> Result<Arc<dyn GattSession>>;
}

/// One live link to a peripheral.
#[async_trait]
pub trait GattSession: Send + Sync {
    /// Address or platform identifier of the peer.
    fn address(&self) -> String;

    /// Discover services, characteristics and descriptors.
    async fn discover_profile(&self) -> Result<Vec<DiscoveredService>>;

    async fn read_characteristic(&self, characteristic: &DiscoveredCharacteristic)
    -> Result<Vec<u8>>;

    async fn write_characteristic(
        &self,
        characteristic: &DiscoveredCharacteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<()>;

    async fn read_descriptor(&self, descriptor: &DiscoveredDescriptor) -> Result<Vec<u8>>;

    /// Enable notifications (or indications) and route payloads to `handler`.
    async fn subscribe(
        &self,
        characteristic: &DiscoveredCharacteristic,
        handler: NotificationHandler,
    ) -> Result<()>;

    async fn unsubscribe(&self, characteristic: &DiscoveredCharacteristic) -> Result<()>;

    /// Tear the link down and release platform resources.
    async fn cancel_connection(&self) -> Result<()>;

    /// Token the adapter cancels when the link drops on its own.
    fn link_lost(&self) -> CancellationToken;
}

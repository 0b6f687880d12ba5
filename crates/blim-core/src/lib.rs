//! BLE GATT connection and subscription engine.
//!
//! This crate manages the client side of a Bluetooth Low Energy link: it
//! connects to a peripheral, discovers its services, characteristics and
//! descriptors, and turns characteristic notifications into a stream of
//! [`Record`]s delivered to your callback at a rate you choose.
//!
//! # Features
//!
//! - **Connection lifecycle**: connect with timeout, full profile discovery,
//!   reconnect that keeps existing characteristic handles valid, strict
//!   teardown order
//! - **Descriptor model**: descriptor values read at connect time and parsed
//!   lazily (presentation format, aggregate format, valid range, ...)
//! - **Streaming policies**: every update, batched, or aggregated snapshots
//! - **Bounded buffering**: per-characteristic ring buffers that drop the
//!   oldest value on overflow, backed by a shared buffer pool
//! - **Link-loss detection**: the connection scope is cancelled with a
//!   not-connected cause when the peripheral goes away
//! - **Radio-agnostic**: a btleplug adapter for real hardware and a mock
//!   adapter for tests
//!
//! # Platform Differences
//!
//! - **macOS**: peripherals are identified by a CoreBluetooth UUID, which
//!   differs between Macs.
//! - **Linux/Windows**: peripherals are identified by their MAC address
//!   (e.g., `AA:BB:CC:DD:EE:FF`).
//!
//! [`btle::BtleplugAdapter`] accepts either form.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use blim_core::btle::BtleplugAdapter;
//! use blim_core::{ConnectOptions, Connection, StreamMode, SubscribeTarget};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let adapter = Arc::new(BtleplugAdapter::new().await?);
//!     let connection = Connection::new(adapter);
//!     connection
//!         .connect("AA:BB:CC:DD:EE:FF", ConnectOptions::default())
//!         .await?;
//!
//!     let id = connection
//!         .subscribe(
//!             &[SubscribeTarget::service("180d").characteristic("2a37")],
//!             StreamMode::EveryUpdate,
//!             Duration::ZERO,
//!             |record| println!("{record:?}"),
//!         )
//!         .await?;
//!
//!     tokio::time::sleep(Duration::from_secs(10)).await;
//!     connection.cancel_subscription(id).await;
//!     connection.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod btle;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod events;
pub mod gatt;
pub mod mock;
pub mod pipeline;
pub mod pool;
pub mod scope;
pub mod subscription;
pub mod util;
pub mod validation;

// Core exports
pub use adapter::{GattAdapter, GattSession, NotificationHandler};
pub use config::{ConnectOptions, ConnectionConfig};
pub use connection::{Connection, LinkState};
pub use device::Device;
pub use error::{
    ConnectionState, DescriptorError, Error, ResourceKind, Result, ValidationFailure,
};
pub use events::{ConnectionEvent, EventReceiver};
pub use gatt::{Characteristic, Descriptor, Service};
pub use pipeline::NotificationPipeline;
pub use pool::{PoolStats, Value, ValuePool};
pub use scope::{CancelCause, CancelScope};
pub use subscription::{RecordCallback, SubscriptionId};
pub use util::{addresses_match, create_identifier, format_peripheral_id};
pub use validation::SubscribeTarget;

// Re-export from blim-types
pub use blim_types::uuid as uuids;
pub use blim_types::{
    Advertisement, CharacteristicProperties, DescriptorValue, PresentationFormat, Record,
    RecordPayload, StreamMode, ValueFlags,
};

/// Type alias for a shared connection reference.
pub type SharedConnection = std::sync::Arc<Connection>;

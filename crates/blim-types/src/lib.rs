//! Platform-agnostic GATT types for the blim BLE engine.
//!
//! This crate holds the pieces of the data model that do not need a radio
//! or an async runtime, so they can be shared by the engine (blim-core),
//! scripting bridges and tests.
//!
//! # Features
//!
//! - UUID normalization and well-known SIG identifiers
//! - Characteristic property bitset
//! - Descriptor payload parsers with strict length validation
//! - Streaming modes, value flags and subscription records
//! - Advertisement snapshots
//!
//! # Example
//!
//! ```
//! use blim_types::uuid::normalize_uuid;
//! use blim_types::descriptor::{DescriptorValue, parse_descriptor_value};
//!
//! assert_eq!(normalize_uuid("00002902-0000-1000-8000-00805f9b34fb"), "2902");
//!
//! let value = parse_descriptor_value("2902", &[0x01, 0x00]).unwrap();
//! assert!(matches!(value, Some(DescriptorValue::ClientConfig(c)) if c.notifications));
//! ```

pub mod advertisement;
pub mod descriptor;
pub mod error;
pub mod properties;
pub mod record;
pub mod uuid;

pub use advertisement::Advertisement;
pub use descriptor::{
    ClientConfig, DescriptorValue, ExtendedProperties, PresentationFormat, ServerConfig,
    ValidRange,
};
pub use error::{ParseError, ParseResult};
pub use properties::CharacteristicProperties;
pub use record::{Record, RecordPayload, StreamMode, ValueFlags};
pub use uuid as uuids;

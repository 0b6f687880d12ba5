//! Advertisement snapshots and device-name heuristics.

use std::collections::BTreeMap;

use bytes::Bytes;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Advertising PDU contents as reported by a scanner.
///
/// The scanner itself lives outside this crate; this is the shape it hands
/// over when a peripheral is first seen or re-advertises.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Advertisement {
    pub address: String,
    pub local_name: Option<String>,
    pub rssi: i16,
    pub tx_power: Option<i16>,
    pub connectable: bool,
    pub manufacturer_data: Bytes,
    /// Advertised service UUIDs, any spelling.
    pub services: Vec<String>,
    /// Service data keyed by service UUID, any spelling.
    pub service_data: BTreeMap<String, Bytes>,
}

impl Advertisement {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    #[must_use]
    pub fn tx_power(mut self, tx_power: i16) -> Self {
        self.tx_power = Some(tx_power);
        self
    }

    #[must_use]
    pub fn connectable(mut self, connectable: bool) -> Self {
        self.connectable = connectable;
        self
    }

    #[must_use]
    pub fn manufacturer_data(mut self, data: impl Into<Bytes>) -> Self {
        self.manufacturer_data = data.into();
        self
    }

    #[must_use]
    pub fn service(mut self, uuid: impl Into<String>) -> Self {
        self.services.push(uuid.into());
        self
    }

    #[must_use]
    pub fn service_data(mut self, uuid: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.service_data.insert(uuid.into(), data.into());
        self
    }
}

/// True if `name` looks like a human-assigned device name: 3 to 32
/// characters with at least one letter.
pub fn is_valid_device_name(name: &str) -> bool {
    let len = name.chars().count();
    (3..=32).contains(&len) && name.chars().any(char::is_alphabetic)
}

/// Look for an embedded printable ASCII name inside manufacturer data.
///
/// Many vendors put the model name in their manufacturer payload. The first
/// run of printable characters (capped at 32) that passes
/// [`is_valid_device_name`] wins.
pub fn name_from_manufacturer_data(data: &[u8]) -> Option<String> {
    if data.len() < 4 {
        return None;
    }

    let printable = |b: &u8| (0x20..=0x7e).contains(b);
    let mut start = 0;
    while start + 3 < data.len() {
        if !printable(&data[start]) {
            start += 1;
            continue;
        }
        let run: Vec<u8> = data[start..]
            .iter()
            .take(32)
            .take_while(|b| printable(*b))
            .copied()
            .collect();
        if run.len() >= 3 {
            let candidate = String::from_utf8_lossy(&run).trim().to_string();
            if is_valid_device_name(&candidate) {
                return Some(candidate);
            }
        }
        start += 1;
    }
    None
}

//! Streaming modes, value flags and the records delivered to subscribers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

bitflags::bitflags! {
    /// Per-value and per-record condition flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct ValueFlags: u32 {
        /// One or more values were discarded by drop-oldest backpressure.
        const DROPPED = 1 << 0;
        /// A characteristic produced no value during an aggregation window.
        const MISSING = 1 << 1;
    }
}

/// How a subscription worker turns queued values into records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum StreamMode {
    /// One record per value, delivered on a short fixed tick.
    #[default]
    EveryUpdate,
    /// All queued values per characteristic, once per period.
    Batched,
    /// At most one value per characteristic per period; silent
    /// characteristics are flagged as missing.
    Aggregated,
}

impl StreamMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamMode::EveryUpdate => "every_update",
            StreamMode::Batched => "batched",
            StreamMode::Aggregated => "aggregated",
        }
    }
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamMode {
    type Err = ParseError;

    /// Accepts `every_update`, `EveryUpdate`, `every-update` and the like.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "everyupdate" => Ok(StreamMode::EveryUpdate),
            "batched" | "batch" => Ok(StreamMode::Batched),
            "aggregated" | "aggregate" => Ok(StreamMode::Aggregated),
            _ => Err(ParseError::InvalidData(format!("unknown stream mode: {s}"))),
        }
    }
}

/// Payload of a [`Record`]: exactly one of the two shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RecordPayload {
    /// One value per characteristic UUID (EveryUpdate and Aggregated).
    Values(BTreeMap<String, Bytes>),
    /// Every value drained per characteristic UUID, in arrival order (Batched).
    BatchValues(BTreeMap<String, Vec<Bytes>>),
}

/// Unit delivered to a subscription callback.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Record {
    /// Timestamp in microseconds since the Unix epoch.
    pub ts_us: i64,
    /// Sequence number of the newest value in the record.
    pub seq: u64,
    /// Union of the contained values' flags plus record-level conditions.
    pub flags: ValueFlags,
    pub payload: RecordPayload,
}

impl Record {
    /// Single-value map, if this record was produced by EveryUpdate or
    /// Aggregated mode.
    pub fn values(&self) -> Option<&BTreeMap<String, Bytes>> {
        match &self.payload {
            RecordPayload::Values(values) => Some(values),
            RecordPayload::BatchValues(_) => None,
        }
    }

    /// Multi-value map, if this record was produced by Batched mode.
    pub fn batch_values(&self) -> Option<&BTreeMap<String, Vec<Bytes>>> {
        match &self.payload {
            RecordPayload::BatchValues(batches) => Some(batches),
            RecordPayload::Values(_) => None,
        }
    }

    /// Number of characteristics carrying data.
    pub fn len(&self) -> usize {
        match &self.payload {
            RecordPayload::Values(values) => values.len(),
            RecordPayload::BatchValues(batches) => batches.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_union() {
        let mut flags = ValueFlags::empty();
        assert!(flags.is_empty());
        flags |= ValueFlags::DROPPED;
        flags.insert(ValueFlags::MISSING);
        assert!(flags.contains(ValueFlags::DROPPED | ValueFlags::MISSING));
        assert_eq!(flags.bits(), 0b11);
    }

    #[test]
    fn test_stream_mode_parse() {
        assert_eq!("EveryUpdate".parse::<StreamMode>().unwrap(), StreamMode::EveryUpdate);
        assert_eq!("every_update".parse::<StreamMode>().unwrap(), StreamMode::EveryUpdate);
        assert_eq!("Batched".parse::<StreamMode>().unwrap(), StreamMode::Batched);
        assert_eq!("aggregated".parse::<StreamMode>().unwrap(), StreamMode::Aggregated);
        assert!("sometimes".parse::<StreamMode>().is_err());
    }

    #[test]
    fn test_record_accessors() {
        let mut values = BTreeMap::new();
        values.insert("2a37".to_string(), Bytes::from_static(&[1, 2]));
        let record = Record {
            ts_us: 10,
            seq: 3,
            flags: ValueFlags::empty(),
            payload: RecordPayload::Values(values),
        };
        assert_eq!(record.len(), 1);
        assert!(record.batch_values().is_none());
        assert_eq!(record.values().unwrap()["2a37"].as_ref(), &[1, 2]);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_record_json_shape() {
        let mut batches = BTreeMap::new();
        batches.insert(
            "2a19".to_string(),
            vec![Bytes::from_static(&[90]), Bytes::from_static(&[89])],
        );
        let record = Record {
            ts_us: 1,
            seq: 2,
            flags: ValueFlags::DROPPED,
            payload: RecordPayload::BatchValues(batches),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["flags"], "DROPPED");
        assert_eq!(json["payload"]["batch_values"]["2a19"][1], serde_json::json!([89]));
        assert_eq!(serde_json::to_value(StreamMode::Batched).unwrap(), "batched");
    }
}

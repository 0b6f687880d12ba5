//! Parsers for well-known GATT descriptor payloads.
//!
//! Lengths are checked strictly. Unknown descriptor UUIDs never fail: their
//! payload comes back as [`DescriptorValue::Raw`].

use bytes::{Buf, Bytes};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};
use crate::uuid::{self as uuids, normalize_uuid};

/// Characteristic Extended Properties (0x2900).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExtendedProperties {
    pub reliable_write: bool,
    pub writable_auxiliaries: bool,
}

/// Client Characteristic Configuration (0x2902).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClientConfig {
    pub notifications: bool,
    pub indications: bool,
}

/// Server Characteristic Configuration (0x2903).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ServerConfig {
    pub broadcasts: bool,
}

/// Characteristic Presentation Format (0x2904).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PresentationFormat {
    /// Format code of the characteristic value (e.g. 0x06 = uint16).
    pub format: u8,
    /// Base-10 exponent: `value = raw * 10^exponent`.
    pub exponent: i8,
    /// Unit UUID (e.g. 0x2700 = unitless).
    pub unit: u16,
    /// Namespace of `description` (0x01 = Bluetooth SIG).
    pub namespace: u8,
    pub description: u16,
}

/// Valid Range (0x2906). Bounds are in the characteristic's own format.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ValidRange {
    pub min: Bytes,
    pub max: Bytes,
}

/// Typed descriptor payload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DescriptorValue {
    ExtendedProperties(ExtendedProperties),
    UserDescription(String),
    ClientConfig(ClientConfig),
    ServerConfig(ServerConfig),
    PresentationFormat(PresentationFormat),
    /// Attribute handles of the referenced presentation format descriptors.
    AggregateFormat(Vec<u16>),
    ValidRange(ValidRange),
    Raw(Bytes),
}

pub fn parse_extended_properties(data: &[u8]) -> ParseResult<ExtendedProperties> {
    let bits = parse_u16_exact("extended properties", data)?;
    Ok(ExtendedProperties {
        reliable_write: bits & 0x0001 != 0,
        writable_auxiliaries: bits & 0x0002 != 0,
    })
}

pub fn parse_client_config(data: &[u8]) -> ParseResult<ClientConfig> {
    let bits = parse_u16_exact("client configuration", data)?;
    Ok(ClientConfig {
        notifications: bits & 0x0001 != 0,
        indications: bits & 0x0002 != 0,
    })
}

pub fn parse_server_config(data: &[u8]) -> ParseResult<ServerConfig> {
    let bits = parse_u16_exact("server configuration", data)?;
    Ok(ServerConfig {
        broadcasts: bits & 0x0001 != 0,
    })
}

/// Decode a user description, dropping trailing NUL terminators.
pub fn parse_user_description(data: &[u8]) -> ParseResult<String> {
    let end = data.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    std::str::from_utf8(&data[..end])
        .map(str::to_string)
        .map_err(|e| ParseError::InvalidUtf8 {
            kind: "user description",
            message: e.to_string(),
        })
}

pub fn parse_presentation_format(data: &[u8]) -> ParseResult<PresentationFormat> {
    if data.len() != 7 {
        return Err(ParseError::length("presentation format", "7", data.len()));
    }
    let mut buf = data;
    Ok(PresentationFormat {
        format: buf.get_u8(),
        exponent: buf.get_i8(),
        unit: buf.get_u16_le(),
        namespace: buf.get_u8(),
        description: buf.get_u16_le(),
    })
}

/// Split a valid range at the midpoint. An odd trailing byte belongs to `max`.
pub fn parse_valid_range(data: &[u8]) -> ParseResult<ValidRange> {
    if data.len() < 2 {
        return Err(ParseError::length("valid range", "at least 2", data.len()));
    }
    let (min, max) = data.split_at(data.len() / 2);
    Ok(ValidRange {
        min: Bytes::copy_from_slice(min),
        max: Bytes::copy_from_slice(max),
    })
}

/// Read the little-endian handle list of an aggregate format descriptor.
pub fn parse_aggregate_handles(data: &[u8]) -> ParseResult<Vec<u16>> {
    if data.len() % 2 != 0 {
        return Err(ParseError::InvalidData(
            "malformed aggregate format: incomplete handle".into(),
        ));
    }
    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Map aggregate handles to presentation formats by position.
///
/// Platforms such as CoreBluetooth do not expose descriptor handles, so the
/// referenced formats are matched to the sibling 0x2904 descriptors in
/// discovery order. The mapping is refused when it would be ambiguous:
/// duplicate handles (unless there is a single handle or a single format)
/// or a count mismatch.
pub fn resolve_aggregate_formats<T: Clone>(handles: &[u16], formats: &[T]) -> ParseResult<Vec<T>> {
    if handles.is_empty() {
        return Ok(Vec::new());
    }

    let mut unique = handles.to_vec();
    unique.sort_unstable();
    unique.dedup();
    if unique.len() != handles.len() && handles.len() != 1 && formats.len() != 1 {
        return Err(ParseError::InvalidData(
            "aggregate format contains duplicate handles, cannot map descriptors reliably".into(),
        ));
    }

    if formats.len() != handles.len() {
        return Err(ParseError::InvalidData(format!(
            "descriptor count mismatch ({} found, {} expected), cannot map reliably",
            formats.len(),
            handles.len()
        )));
    }

    Ok(formats.to_vec())
}

/// Parse a descriptor payload according to its UUID (any spelling).
///
/// Returns `Ok(None)` for an empty payload, except for the aggregate format
/// where an empty handle list is meaningful.
pub fn parse_descriptor_value(uuid: &str, data: &[u8]) -> ParseResult<Option<DescriptorValue>> {
    let key = normalize_uuid(uuid);
    if data.is_empty() && key != uuids::AGGREGATE_FORMAT {
        return Ok(None);
    }

    let value = match key.as_str() {
        uuids::EXTENDED_PROPERTIES => {
            DescriptorValue::ExtendedProperties(parse_extended_properties(data)?)
        }
        uuids::USER_DESCRIPTION => DescriptorValue::UserDescription(parse_user_description(data)?),
        uuids::CLIENT_CONFIG => DescriptorValue::ClientConfig(parse_client_config(data)?),
        uuids::SERVER_CONFIG => DescriptorValue::ServerConfig(parse_server_config(data)?),
        uuids::PRESENTATION_FORMAT => {
            DescriptorValue::PresentationFormat(parse_presentation_format(data)?)
        }
        uuids::AGGREGATE_FORMAT => DescriptorValue::AggregateFormat(parse_aggregate_handles(data)?),
        uuids::VALID_RANGE => DescriptorValue::ValidRange(parse_valid_range(data)?),
        _ => DescriptorValue::Raw(Bytes::copy_from_slice(data)),
    };
    Ok(Some(value))
}

fn parse_u16_exact(kind: &'static str, data: &[u8]) -> ParseResult<u16> {
    if data.len() != 2 {
        return Err(ParseError::length(kind, "2", data.len()));
    }
    Ok(u16::from_le_bytes([data[0], data[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config() {
        let cfg = parse_client_config(&[0x03, 0x00]).unwrap();
        assert!(cfg.notifications);
        assert!(cfg.indications);

        let cfg = parse_client_config(&[0x01, 0x00]).unwrap();
        assert!(cfg.notifications);
        assert!(!cfg.indications);

        assert!(parse_client_config(&[0x01]).is_err());
        assert!(parse_client_config(&[0x01, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_extended_and_server_config() {
        let ext = parse_extended_properties(&[0x02, 0x00]).unwrap();
        assert!(!ext.reliable_write);
        assert!(ext.writable_auxiliaries);

        let srv = parse_server_config(&[0x01, 0x00]).unwrap();
        assert!(srv.broadcasts);
    }

    #[test]
    fn test_user_description_trims_nul() {
        assert_eq!(parse_user_description(b"Pulse\0\0").unwrap(), "Pulse");
        assert_eq!(parse_user_description(b"\0").unwrap(), "");
        assert!(parse_user_description(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_presentation_format() {
        // uint16, exponent -2, unit 0x272f (celsius), SIG namespace, description 0x0000
        let data = [0x06, 0xfe, 0x2f, 0x27, 0x01, 0x00, 0x00];
        let fmt = parse_presentation_format(&data).unwrap();
        assert_eq!(fmt.format, 0x06);
        assert_eq!(fmt.exponent, -2);
        assert_eq!(fmt.unit, 0x272f);
        assert_eq!(fmt.namespace, 1);
        assert_eq!(fmt.description, 0);

        let err = parse_presentation_format(&data[..6]).unwrap_err();
        assert!(err.to_string().contains("expected 7 bytes, got 6"));
    }

    #[test]
    fn test_valid_range_split() {
        let range = parse_valid_range(&[1, 2, 3, 4]).unwrap();
        assert_eq!(range.min.as_ref(), &[1, 2]);
        assert_eq!(range.max.as_ref(), &[3, 4]);

        let odd = parse_valid_range(&[1, 2, 3]).unwrap();
        assert_eq!(odd.min.as_ref(), &[1]);
        assert_eq!(odd.max.as_ref(), &[2, 3]);

        assert!(parse_valid_range(&[1]).is_err());
    }

    #[test]
    fn test_aggregate_handles() {
        assert_eq!(parse_aggregate_handles(&[]).unwrap(), Vec::<u16>::new());
        assert_eq!(
            parse_aggregate_handles(&[0x10, 0x00, 0x14, 0x00]).unwrap(),
            vec![0x0010, 0x0014]
        );
        assert!(parse_aggregate_handles(&[0x10, 0x00, 0x14]).is_err());
    }

    #[test]
    fn test_resolve_aggregate_formats() {
        let formats = ["a", "b"];
        assert_eq!(resolve_aggregate_formats(&[1, 2], &formats).unwrap(), vec!["a", "b"]);
        assert!(resolve_aggregate_formats(&[1, 2, 3], &formats).is_err());
        assert!(resolve_aggregate_formats(&[1, 1], &formats).is_err());
        // A single referenced format may be listed twice.
        assert_eq!(resolve_aggregate_formats(&[7], &["only"]).unwrap(), vec!["only"]);
        assert!(resolve_aggregate_formats::<&str>(&[], &[]).unwrap().is_empty());
    }

    #[test]
    fn test_parse_descriptor_value_dispatch() {
        assert_eq!(
            parse_descriptor_value("0x2902", &[0x01, 0x00]).unwrap(),
            Some(DescriptorValue::ClientConfig(ClientConfig {
                notifications: true,
                indications: false
            }))
        );
        assert_eq!(parse_descriptor_value("2902", &[]).unwrap(), None);
        assert_eq!(
            parse_descriptor_value("2905", &[]).unwrap(),
            Some(DescriptorValue::AggregateFormat(vec![]))
        );
        assert_eq!(
            parse_descriptor_value("00002901-0000-1000-8000-00805f9b34fb", b"Rate\0").unwrap(),
            Some(DescriptorValue::UserDescription("Rate".into()))
        );
    }

    #[test]
    fn test_unknown_descriptor_is_raw() {
        let value = parse_descriptor_value("abcd", &[9, 8, 7]).unwrap();
        assert_eq!(value, Some(DescriptorValue::Raw(Bytes::from_static(&[9, 8, 7]))));
    }
}

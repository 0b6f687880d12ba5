//! Bluetooth UUID normalization and well-known GATT identifiers.
//!
//! Every lookup in the engine compares *normalized* UUID strings: lowercase,
//! dash-free, without a `0x` prefix, and with 128-bit UUIDs built on the
//! Bluetooth SIG base shortened to their 16-bit form. That makes `"2902"`,
//! `"0x2902"` and `"00002902-0000-1000-8000-00805f9b34fb"` the same key.

use uuid::{Uuid, uuid};

/// Trailing 96 bits of the Bluetooth SIG base UUID, dash-free.
pub const SIG_BASE_SUFFIX: &str = "00001000800000805f9b34fb";

// --- Standard Service UUIDs ---

/// Generic Access Profile (GAP) service.
pub const GAP_SERVICE: Uuid = uuid!("00001800-0000-1000-8000-00805f9b34fb");

/// Generic Attribute Profile (GATT) service.
pub const GATT_SERVICE: Uuid = uuid!("00001801-0000-1000-8000-00805f9b34fb");

/// Device Information service.
pub const DEVICE_INFO_SERVICE: Uuid = uuid!("0000180a-0000-1000-8000-00805f9b34fb");

/// Battery service.
pub const BATTERY_SERVICE: Uuid = uuid!("0000180f-0000-1000-8000-00805f9b34fb");

/// Heart Rate service.
pub const HEART_RATE_SERVICE: Uuid = uuid!("0000180d-0000-1000-8000-00805f9b34fb");

// --- Standard Characteristic UUIDs ---

/// GAP Device Name characteristic.
pub const DEVICE_NAME: Uuid = uuid!("00002a00-0000-1000-8000-00805f9b34fb");

/// GAP Appearance characteristic.
pub const APPEARANCE: Uuid = uuid!("00002a01-0000-1000-8000-00805f9b34fb");

/// Battery Level characteristic.
pub const BATTERY_LEVEL: Uuid = uuid!("00002a19-0000-1000-8000-00805f9b34fb");

/// Heart Rate Measurement characteristic.
pub const HEART_RATE_MEASUREMENT: Uuid = uuid!("00002a37-0000-1000-8000-00805f9b34fb");

// --- Descriptor UUIDs (normalized short form) ---

/// Characteristic Extended Properties descriptor.
pub const EXTENDED_PROPERTIES: &str = "2900";

/// Characteristic User Description descriptor.
pub const USER_DESCRIPTION: &str = "2901";

/// Client Characteristic Configuration descriptor.
pub const CLIENT_CONFIG: &str = "2902";

/// Server Characteristic Configuration descriptor.
pub const SERVER_CONFIG: &str = "2903";

/// Characteristic Presentation Format descriptor.
pub const PRESENTATION_FORMAT: &str = "2904";

/// Characteristic Aggregate Format descriptor.
pub const AGGREGATE_FORMAT: &str = "2905";

/// Valid Range descriptor.
pub const VALID_RANGE: &str = "2906";

/// Normalize a UUID string into the form used for every lookup key.
///
/// # Example
///
/// ```
/// use blim_types::uuid::normalize_uuid;
///
/// assert_eq!(normalize_uuid("0x2902"), "2902");
/// assert_eq!(normalize_uuid("00002902-0000-1000-8000-00805F9B34FB"), "2902");
/// assert_eq!(
///     normalize_uuid("6E400001-B5A3-F393-E0A9-E50E24DCCA9E"),
///     "6e400001b5a3f393e0a9e50e24dcca9e"
/// );
/// ```
pub fn normalize_uuid(raw: &str) -> String {
    let lower = raw.trim().to_ascii_lowercase();
    let stripped = lower.strip_prefix("0x").unwrap_or(&lower);
    let compact: String = stripped.chars().filter(|c| *c != '-').collect();

    if compact.len() == 32
        && compact.starts_with("0000")
        && compact.ends_with(SIG_BASE_SUFFIX)
    {
        return compact[4..8].to_string();
    }
    compact
}

/// Normalize every UUID in a slice.
pub fn normalize_uuids<S: AsRef<str>>(raw: &[S]) -> Vec<String> {
    raw.iter().map(|u| normalize_uuid(u.as_ref())).collect()
}

/// Normalized key for a parsed [`Uuid`].
pub fn uuid_key(uuid: &Uuid) -> String {
    normalize_uuid(&uuid.to_string())
}

/// Expand a UUID string (any accepted spelling) into a full 128-bit [`Uuid`].
///
/// 16-bit and 32-bit short forms are placed on the SIG base. Returns `None`
/// when the input is not valid hex of a supported width.
pub fn expand_uuid(raw: &str) -> Option<Uuid> {
    let key = normalize_uuid(raw);
    if !key.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    match key.len() {
        4 => Uuid::parse_str(&format!("0000{key}{SIG_BASE_SUFFIX}")).ok(),
        8 => Uuid::parse_str(&format!("{key}{SIG_BASE_SUFFIX}")).ok(),
        32 => Uuid::parse_str(&key).ok(),
        _ => None,
    }
}

/// Human-readable SIG name for a handful of common UUIDs.
///
/// Accepts any spelling; unknown identifiers return `None`.
pub fn known_name(raw: &str) -> Option<&'static str> {
    let name = match normalize_uuid(raw).as_str() {
        "1800" => "Generic Access",
        "1801" => "Generic Attribute",
        "180a" => "Device Information",
        "180d" => "Heart Rate",
        "180f" => "Battery Service",
        "1809" => "Health Thermometer",
        "181a" => "Environmental Sensing",
        "2a00" => "Device Name",
        "2a01" => "Appearance",
        "2a04" => "Peripheral Preferred Connection Parameters",
        "2a05" => "Service Changed",
        "2a19" => "Battery Level",
        "2a24" => "Model Number String",
        "2a25" => "Serial Number String",
        "2a26" => "Firmware Revision String",
        "2a27" => "Hardware Revision String",
        "2a28" => "Software Revision String",
        "2a29" => "Manufacturer Name String",
        "2a37" => "Heart Rate Measurement",
        "2a38" => "Body Sensor Location",
        "2a39" => "Heart Rate Control Point",
        "2900" => "Characteristic Extended Properties",
        "2901" => "Characteristic User Description",
        "2902" => "Client Characteristic Configuration",
        "2903" => "Server Characteristic Configuration",
        "2904" => "Characteristic Presentation Format",
        "2905" => "Characteristic Aggregate Format",
        "2906" => "Valid Range",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_short_forms() {
        assert_eq!(normalize_uuid("2902"), "2902");
        assert_eq!(normalize_uuid("0x2902"), "2902");
        assert_eq!(normalize_uuid("0X2A37"), "2a37");
        assert_eq!(normalize_uuid("  180D "), "180d");
    }

    #[test]
    fn test_normalize_sig_base() {
        assert_eq!(normalize_uuid("00002902-0000-1000-8000-00805f9b34fb"), "2902");
        assert_eq!(normalize_uuid("0000180000001000800000805F9B34FB"), "1800");
    }

    #[test]
    fn test_normalize_custom_uuid_kept_in_full() {
        assert_eq!(
            normalize_uuid("F0CD1503-95DA-4F4B-9AC8-AA55D312AF0C"),
            "f0cd150395da4f4b9ac8aa55d312af0c"
        );
        // 32-bit SIG values do not collapse to 16 bits.
        assert_eq!(
            normalize_uuid("12345678-0000-1000-8000-00805f9b34fb"),
            "1234567800001000800000805f9b34fb"
        );
    }

    #[test]
    fn test_uuid_key_matches_string_form() {
        assert_eq!(uuid_key(&GAP_SERVICE), "1800");
        assert_eq!(uuid_key(&HEART_RATE_MEASUREMENT), "2a37");
    }

    #[test]
    fn test_expand_uuid() {
        assert_eq!(expand_uuid("2a00"), Some(DEVICE_NAME));
        assert_eq!(expand_uuid("0x180f"), Some(BATTERY_SERVICE));
        assert_eq!(
            expand_uuid("0000180d-0000-1000-8000-00805f9b34fb"),
            Some(HEART_RATE_SERVICE)
        );
        assert_eq!(expand_uuid("xyz1"), None);
        assert_eq!(expand_uuid("123"), None);
    }

    #[test]
    fn test_known_name() {
        assert_eq!(known_name("0x2902"), Some("Client Characteristic Configuration"));
        assert_eq!(known_name("00001800-0000-1000-8000-00805f9b34fb"), Some("Generic Access"));
        assert_eq!(known_name("ffff"), None);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Normalizing twice gives the same key as normalizing once.
        #[test]
        fn normalize_is_idempotent(raw in "[0-9a-fA-F-]{0,40}") {
            let once = normalize_uuid(&raw);
            prop_assert_eq!(normalize_uuid(&once), once);
        }

        /// Short, prefixed and SIG-base spellings of a 16-bit UUID agree.
        #[test]
        fn short_spellings_agree(short in 0u16..=u16::MAX) {
            let plain = format!("{short:04x}");
            let prefixed = format!("0x{short:04X}");
            let full = format!("0000{short:04x}-0000-1000-8000-00805f9b34fb");
            prop_assert_eq!(normalize_uuid(&prefixed), plain.clone());
            prop_assert_eq!(normalize_uuid(&full), plain);
        }

        /// Expansion and normalization round-trip for any parsed UUID.
        #[test]
        fn expand_then_key(bytes in any::<[u8; 16]>()) {
            let uuid = Uuid::from_bytes(bytes);
            let key = uuid_key(&uuid);
            prop_assert_eq!(expand_uuid(&key), Some(uuid));
        }
    }
}

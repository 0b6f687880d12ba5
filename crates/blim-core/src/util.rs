//! Peripheral identifier helpers.

use btleplug::platform::PeripheralId;

/// Address reported by platforms that hide the real MAC (e.g. macOS).
pub const HIDDEN_ADDRESS: &str = "00:00:00:00:00:00";

/// Format a peripheral ID as a plain string.
///
/// On macOS peripheral IDs are UUIDs; elsewhere they wrap the address.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Identifier to connect with: the address, or the peripheral ID where the
/// platform hides the address.
pub fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> String {
    if address == HIDDEN_ADDRESS {
        format_peripheral_id(peripheral_id)
    } else {
        address.to_string()
    }
}

/// Compare two addresses ignoring case and separators.
pub fn addresses_match(left: &str, right: &str) -> bool {
    let canonical = |s: &str| {
        s.chars()
            .filter(|c| !matches!(c, ':' | '-'))
            .flat_map(char::to_lowercase)
            .collect::<String>()
    };
    let left = canonical(left);
    !left.is_empty() && left == canonical(right)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addresses_match() {
        assert!(addresses_match("AA:BB:CC:DD:EE:FF", "aabbccddeeff"));
        assert!(addresses_match("aa-bb-cc-dd-ee-ff", "AA:BB:CC:DD:EE:FF"));
        assert!(!addresses_match("AA:BB:CC:DD:EE:FF", "AA:BB:CC:DD:EE:00"));
        assert!(!addresses_match("", ""));
    }

    #[test]
    fn test_platform_uuid_ids_match() {
        assert!(addresses_match(
            "F0CD1503-95DA-4F4B-9AC8-AA55D312AF0C",
            "f0cd150395da4f4b9ac8aa55d312af0c"
        ));
    }
}

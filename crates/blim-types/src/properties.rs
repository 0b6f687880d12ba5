//! GATT characteristic property bitset.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Characteristic properties as declared in the GATT characteristic
    /// declaration. Bit positions follow the Bluetooth Core specification, so
    /// a raw declaration byte converts losslessly with
    /// [`from_bits_retain`](Self::from_bits_retain).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    #[repr(transparent)]
    pub struct CharacteristicProperties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

impl CharacteristicProperties {
    const NAMES: [(Self, &'static str); 8] = [
        (Self::BROADCAST, "Broadcast"),
        (Self::READ, "Read"),
        (Self::WRITE_WITHOUT_RESPONSE, "WriteWithoutResponse"),
        (Self::WRITE, "Write"),
        (Self::NOTIFY, "Notify"),
        (Self::INDICATE, "Indicate"),
        (Self::AUTHENTICATED_SIGNED_WRITES, "AuthenticatedSignedWrites"),
        (Self::EXTENDED_PROPERTIES, "ExtendedProperties"),
    ];

    pub const fn can_read(self) -> bool {
        self.contains(Self::READ)
    }

    /// True for either write flavour.
    pub const fn can_write(self) -> bool {
        self.intersects(Self::WRITE.union(Self::WRITE_WITHOUT_RESPONSE))
    }

    /// True when the peripheral can push values (notify or indicate).
    pub const fn supports_notifications(self) -> bool {
        self.intersects(Self::NOTIFY.union(Self::INDICATE))
    }

    /// Names of the set properties, in bit order.
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl fmt::Display for CharacteristicProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("None");
        }
        f.write_str(&self.names().join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_helpers() {
        let props = CharacteristicProperties::READ | CharacteristicProperties::NOTIFY;
        assert!(props.can_read());
        assert!(!props.can_write());
        assert!(props.supports_notifications());

        let write_only = CharacteristicProperties::WRITE_WITHOUT_RESPONSE;
        assert!(write_only.can_write());
        assert!(!write_only.can_read());
        assert!(!write_only.supports_notifications());

        assert!(CharacteristicProperties::INDICATE.supports_notifications());
    }

    #[test]
    fn test_display() {
        let props = CharacteristicProperties::from_bits_retain(0x12);
        assert_eq!(props.to_string(), "Read|Notify");
        assert_eq!(CharacteristicProperties::empty().to_string(), "None");
    }

    #[test]
    fn test_declaration_byte_is_lossless() {
        let props = CharacteristicProperties::from_bits_retain(0xff);
        assert_eq!(props, CharacteristicProperties::all());
        assert_eq!(props.bits(), 0xff);
        assert_eq!(props.names().len(), 8);
    }
}

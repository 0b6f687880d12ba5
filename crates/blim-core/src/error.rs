//! Error types for blim-core.
//!
//! Errors fall into a small number of classes that callers branch on:
//!
//! | Class | Variant | Typical reaction |
//! |-------|---------|------------------|
//! | Connection state | [`Error::Connection`] | Connect (again) or stop |
//! | Not found | [`Error::NotFound`], not-found [`Error::Validation`] | Fix the target UUIDs |
//! | Unsupported | [`Error::Unsupported`], unsupported [`Error::Validation`] | Use a different operation |
//! | Timeout | [`Error::Timeout`] | Retry |
//!
//! Classes stay matchable through [`Error::Context`] wrapping: use
//! [`Error::is_connection_state`], [`Error::is_not_found`],
//! [`Error::is_unsupported`] and [`Error::is_timeout`] rather than matching
//! variants directly.
//!
//! Descriptor read failures are not returned at all; they are attached to the
//! descriptor as a [`DescriptorError`].

use std::fmt;
use std::time::Duration;

use blim_types::ParseError;
use thiserror::Error;

/// Errors that can occur while talking to a GATT peripheral.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error from btleplug.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Sentinel connection-state condition.
    #[error("{0}")]
    Connection(ConnectionState),

    /// No peripheral with the given address could be found.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// A service, characteristic or descriptor does not exist.
    #[error("{}", not_found_message(.resource, .uuids))]
    NotFound {
        resource: ResourceKind,
        /// UUID chain, innermost first (e.g. `[characteristic, service]`).
        uuids: Vec<String>,
    },

    /// The target exists but cannot perform the operation.
    #[error("operation \"{operation}\" is not supported by characteristic \"{uuid}\"")]
    Unsupported { operation: String, uuid: String },

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out, including its target UUID.
        operation: String,
        duration: Duration,
    },

    /// Pre-flight validation found one or more problems.
    #[error(transparent)]
    Validation(ValidationFailure),

    /// Several independent operations failed.
    #[error("{operation} failures - {}", .failures.join("; "))]
    Aggregate {
        operation: String,
        failures: Vec<String>,
    },

    /// The connect cycle an operation belonged to ended while it ran.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Free-form failure reported by a radio adapter.
    #[error("Adapter error: {0}")]
    Adapter(String),

    /// Payload could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// An error with additional context. Classification helpers look through it.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

/// Connection-state sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ConnectionState {
    NotConnected,
    AlreadyConnected,
    NotInitialized,
    BluetoothOff,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "device not connected"),
            Self::AlreadyConnected => write!(f, "device already connected"),
            Self::NotInitialized => write!(f, "connection is not initialized"),
            Self::BluetoothOff => write!(f, "bluetooth is turned off"),
        }
    }
}

/// Kind of GATT attribute a [`Error::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Service,
    Characteristic,
    Descriptor,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service => write!(f, "service"),
            Self::Characteristic => write!(f, "characteristic"),
            Self::Descriptor => write!(f, "descriptor"),
        }
    }
}

fn not_found_message(resource: &ResourceKind, uuids: &[String]) -> String {
    let target = uuids.first().map(String::as_str).unwrap_or("");
    match (*resource, uuids.get(1)) {
        (ResourceKind::Characteristic, Some(parent)) => {
            format!("{resource} \"{target}\" not found in service \"{parent}\"")
        }
        (ResourceKind::Descriptor, Some(parent)) => {
            format!("{resource} \"{target}\" not found in characteristic \"{parent}\"")
        }
        _ => format!("{resource} \"{target}\" not found"),
    }
}

/// A characteristic that validation could not find, with the service it was
/// looked up in (both as the caller spelled them).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingCharacteristic {
    pub service: String,
    pub characteristic: String,
}

impl fmt::Display for MissingCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (in service {})", self.characteristic, self.service)
    }
}

/// Every problem found by one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationFailure {
    pub missing_services: Vec<String>,
    pub missing_characteristics: Vec<MissingCharacteristic>,
    /// Characteristics that exist but cannot notify or indicate.
    pub unsupported: Vec<MissingCharacteristic>,
}

impl ValidationFailure {
    pub fn is_empty(&self) -> bool {
        self.missing_services.is_empty()
            && self.missing_characteristics.is_empty()
            && self.unsupported.is_empty()
    }

    /// True when a capability problem was found.
    pub fn is_unsupported(&self) -> bool {
        !self.unsupported.is_empty()
    }

    /// True when only existence problems were found.
    pub fn is_not_found(&self) -> bool {
        !self.is_unsupported()
            && (!self.missing_services.is_empty() || !self.missing_characteristics.is_empty())
    }

    /// Fold another pass into this one.
    pub fn merge(&mut self, other: ValidationFailure) {
        self.missing_services.extend(other.missing_services);
        self.missing_characteristics
            .extend(other.missing_characteristics);
        self.unsupported.extend(other.unsupported);
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |items: &[MissingCharacteristic]| {
            items
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut parts = Vec::new();
        if !self.missing_services.is_empty() {
            parts.push(format!(
                "missing services: {}",
                self.missing_services.join(", ")
            ));
        }
        if !self.missing_characteristics.is_empty() {
            parts.push(format!(
                "missing characteristics: {}",
                join(&self.missing_characteristics)
            ));
        }
        if !self.unsupported.is_empty() {
            parts.push(format!(
                "characteristics without notification support: {}",
                join(&self.unsupported)
            ));
        }
        write!(f, "validation failed - {}", parts.join("; "))
    }
}

impl std::error::Error for ValidationFailure {}

/// Why a descriptor value is unavailable.
///
/// Stored on the descriptor; discovery never fails because of one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DescriptorError {
    #[error("timeout: descriptor read exceeded {0:?}")]
    Timeout(Duration),

    #[error("read_error: {0}")]
    Read(String),

    #[error("parse_error: {0}")]
    Parse(ParseError),
}

impl DescriptorError {
    /// Short machine-readable reason.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Read(_) => "read_error",
            Self::Parse(_) => "parse_error",
        }
    }
}

impl Error {
    pub fn not_connected() -> Self {
        Self::Connection(ConnectionState::NotConnected)
    }

    pub fn already_connected() -> Self {
        Self::Connection(ConnectionState::AlreadyConnected)
    }

    pub fn not_initialized() -> Self {
        Self::Connection(ConnectionState::NotInitialized)
    }

    /// Create a device not found error for a specific address.
    pub fn device_not_found(address: impl Into<String>) -> Self {
        Self::DeviceNotFound(address.into())
    }

    pub fn service_not_found(service: impl Into<String>) -> Self {
        Self::NotFound {
            resource: ResourceKind::Service,
            uuids: vec![service.into()],
        }
    }

    pub fn characteristic_not_found(
        service: impl Into<String>,
        characteristic: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            resource: ResourceKind::Characteristic,
            uuids: vec![characteristic.into(), service.into()],
        }
    }

    pub fn descriptor_not_found(
        characteristic: impl Into<String>,
        descriptor: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            resource: ResourceKind::Descriptor,
            uuids: vec![descriptor.into(), characteristic.into()],
        }
    }

    /// Create an unsupported-operation error.
    pub fn unsupported(operation: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
            uuid: uuid.into(),
        }
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Wrap this error with a context message, keeping it classifiable.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Map a free-form adapter message onto the taxonomy.
    ///
    /// Radio stacks report connection-state problems as text; recognizing
    /// them here keeps [`Error::is_connection_state`] usable for callers.
    pub fn from_adapter_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("not connected") || lower.contains("disconnected") {
            Self::not_connected().context(message)
        } else if lower.contains("already connected") {
            Self::already_connected().context(message)
        } else if lower.contains("not initialized") {
            Self::not_initialized().context(message)
        } else if lower.contains("bluetooth is turned off") || lower.contains("powered off") {
            Self::Connection(ConnectionState::BluetoothOff).context(message)
        } else if lower.contains("deadline exceeded") || lower.contains("timed out") {
            Self::timeout(message, Duration::ZERO)
        } else {
            Self::Adapter(message)
        }
    }

    /// The innermost error under any [`Error::Context`] layers.
    pub fn root(&self) -> &Error {
        let mut current = self;
        while let Error::Context { source, .. } = current {
            current = source;
        }
        current
    }

    /// Connection-state sentinel carried by this error, if any.
    pub fn connection_state(&self) -> Option<ConnectionState> {
        match self.root() {
            Error::Connection(state) => Some(*state),
            Error::Bluetooth(btleplug::Error::NotConnected) => Some(ConnectionState::NotConnected),
            _ => None,
        }
    }

    pub fn is_connection_state(&self, state: ConnectionState) -> bool {
        self.connection_state() == Some(state)
    }

    /// True for missing services, characteristics and descriptors.
    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Error::NotFound { .. } => true,
            Error::Validation(failure) => failure.is_not_found(),
            _ => false,
        }
    }

    /// True when the target exists but cannot perform the operation.
    pub fn is_unsupported(&self) -> bool {
        match self.root() {
            Error::Unsupported { .. } => true,
            Error::Validation(failure) => failure.is_unsupported(),
            Error::Bluetooth(btleplug::Error::NotSupported(_)) => true,
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self.root(),
            Error::Timeout { .. } | Error::Bluetooth(btleplug::Error::TimedOut(_))
        )
    }
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled)
    }
}

/// Result type alias using blim-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::not_connected();
        assert_eq!(err.to_string(), "device not connected");

        let err = Error::service_not_found("180d");
        assert_eq!(err.to_string(), "service \"180d\" not found");

        let err = Error::characteristic_not_found("180d", "2a37");
        assert_eq!(
            err.to_string(),
            "characteristic \"2a37\" not found in service \"180d\""
        );

        let err = Error::descriptor_not_found("2a37", "2902");
        assert_eq!(
            err.to_string(),
            "descriptor \"2902\" not found in characteristic \"2a37\""
        );

        let err = Error::timeout("read characteristic 2a19", Duration::from_secs(5));
        assert!(err.to_string().contains("2a19"));
        assert!(err.to_string().contains("5s"));

        let err = Error::unsupported("read", "2a39");
        assert_eq!(
            err.to_string(),
            "operation \"read\" is not supported by characteristic \"2a39\""
        );
    }

    #[test]
    fn test_context_keeps_classification() {
        let err = Error::not_connected()
            .context("subscribe")
            .context("script call");
        assert!(err.is_connection_state(ConnectionState::NotConnected));
        assert!(!err.is_connection_state(ConnectionState::AlreadyConnected));
        assert_eq!(err.to_string(), "script call: subscribe: device not connected");

        let err = Error::unsupported("write", "2a37").context("write failed");
        assert!(err.is_unsupported());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_cancelled_through_context() {
        let err = Error::Cancelled.context("subscription");
        assert!(err.is_cancelled());
        assert!(!err.is_connection_state(ConnectionState::NotConnected));
        assert!(err.to_string().contains("Operation cancelled"));
    }

    #[test]
    fn test_validation_failure_message() {
        let failure = ValidationFailure {
            missing_services: vec!["ffe0".into()],
            missing_characteristics: vec![MissingCharacteristic {
                service: "180d".into(),
                characteristic: "2a99".into(),
            }],
            unsupported: vec![MissingCharacteristic {
                service: "180d".into(),
                characteristic: "2a39".into(),
            }],
        };
        assert_eq!(
            failure.to_string(),
            "validation failed - missing services: ffe0; \
             missing characteristics: 2a99 (in service 180d); \
             characteristics without notification support: 2a39 (in service 180d)"
        );

        let err = Error::Validation(failure);
        assert!(err.is_unsupported());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_validation_not_found_only() {
        let err = Error::Validation(ValidationFailure {
            missing_services: vec!["dead".into()],
            ..Default::default()
        });
        assert!(err.is_not_found());
        assert!(!err.is_unsupported());
    }

    #[test]
    fn test_from_adapter_message() {
        assert!(
            Error::from_adapter_message("Device Not Connected")
                .is_connection_state(ConnectionState::NotConnected)
        );
        assert!(
            Error::from_adapter_message("peer already connected")
                .is_connection_state(ConnectionState::AlreadyConnected)
        );
        assert!(
            Error::from_adapter_message("Bluetooth is turned off")
                .is_connection_state(ConnectionState::BluetoothOff)
        );
        assert!(Error::from_adapter_message("context deadline exceeded").is_timeout());
        assert!(matches!(
            Error::from_adapter_message("GATT error 0x85"),
            Error::Adapter(_)
        ));
    }

    #[test]
    fn test_btleplug_classification() {
        let err: Error = btleplug::Error::NotConnected.into();
        assert!(err.is_connection_state(ConnectionState::NotConnected));

        let err: Error = btleplug::Error::TimedOut(Duration::from_secs(1)).into();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_descriptor_error_reason() {
        assert_eq!(DescriptorError::Timeout(Duration::from_secs(2)).reason(), "timeout");
        assert_eq!(DescriptorError::Read("gatt".into()).reason(), "read_error");
        let parse = DescriptorError::Parse(ParseError::InvalidData("x".into()));
        assert_eq!(parse.reason(), "parse_error");
        assert!(parse.to_string().starts_with("parse_error: "));
    }
}

//! Pre-flight checks for subscribe and unsubscribe targets.
//!
//! Validation collects every problem it finds instead of stopping at the
//! first, so one call reports all misconfigured UUIDs at once.

use std::collections::BTreeMap;
use std::sync::Arc;

use blim_types::uuid::normalize_uuid;
use serde::{Deserialize, Serialize};

use crate::error::{MissingCharacteristic, ValidationFailure};
use crate::gatt::{Characteristic, Service};

/// A service and, optionally, a subset of its characteristics.
///
/// An empty characteristic list selects every characteristic in the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeTarget {
    pub service: String,
    #[serde(default)]
    pub characteristics: Vec<String>,
}

impl SubscribeTarget {
    /// Target every characteristic of `service`.
    pub fn service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            characteristics: Vec::new(),
        }
    }

    /// Add a characteristic to the target.
    #[must_use]
    pub fn characteristic(mut self, uuid: impl Into<String>) -> Self {
        self.characteristics.push(uuid.into());
        self
    }

    /// Replace the characteristic list.
    #[must_use]
    pub fn characteristics<I, S>(mut self, uuids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.characteristics = uuids.into_iter().map(Into::into).collect();
        self
    }
}

/// Characteristics that passed validation, keyed by `(service, characteristic)`.
pub(crate) type Validated = BTreeMap<(String, String), Arc<Characteristic>>;

/// Check one target against the discovered topology.
///
/// With `require_notify`, every selected characteristic that can neither
/// notify nor indicate is reported as unsupported, whether it was named
/// explicitly or selected through an empty characteristic list.
pub(crate) fn validate_target(
    services: &BTreeMap<String, Service>,
    target: &SubscribeTarget,
    require_notify: bool,
) -> Result<Validated, ValidationFailure> {
    let mut failure = ValidationFailure::default();
    let mut validated = Validated::new();

    let Some(service) = services.get(&normalize_uuid(&target.service)) else {
        failure.missing_services.push(target.service.clone());
        return Err(failure);
    };

    if target.characteristics.is_empty() {
        for characteristic in service.characteristics() {
            if require_notify && !characteristic.properties().supports_notifications() {
                failure.unsupported.push(MissingCharacteristic {
                    service: target.service.clone(),
                    characteristic: characteristic.uuid().to_string(),
                });
                continue;
            }
            validated.insert(
                (service.uuid().to_string(), characteristic.uuid().to_string()),
                characteristic.clone(),
            );
        }
    }

    for uuid in &target.characteristics {
        let Ok(characteristic) = service.characteristic(uuid) else {
            failure.missing_characteristics.push(MissingCharacteristic {
                service: target.service.clone(),
                characteristic: uuid.clone(),
            });
            continue;
        };
        if require_notify && !characteristic.properties().supports_notifications() {
            failure.unsupported.push(MissingCharacteristic {
                service: target.service.clone(),
                characteristic: uuid.clone(),
            });
            continue;
        }
        validated.insert(
            (service.uuid().to_string(), characteristic.uuid().to_string()),
            characteristic,
        );
    }

    if failure.is_empty() {
        Ok(validated)
    } else {
        Err(failure)
    }
}

/// Validate several targets, merging all failures into one report.
pub(crate) fn validate_targets(
    services: &BTreeMap<String, Service>,
    targets: &[SubscribeTarget],
    require_notify: bool,
) -> Result<Validated, ValidationFailure> {
    let mut failure = ValidationFailure::default();
    let mut validated = Validated::new();
    for target in targets {
        match validate_target(services, target, require_notify) {
            Ok(found) => validated.extend(found),
            Err(problems) => failure.merge(problems),
        }
    }
    if failure.is_empty() {
        Ok(validated)
    } else {
        Err(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::DiscoveredCharacteristic;
    use crate::error::Error;
    use crate::gatt::Link;
    use crate::pipeline::NotificationPipeline;
    use crate::pool::ValuePool;
    use blim_types::CharacteristicProperties;
    use blim_types::uuid::expand_uuid;

    fn topology() -> BTreeMap<String, Service> {
        let link = Arc::new(Link::new());
        let pool = Arc::new(ValuePool::new());
        let mut characteristics = BTreeMap::new();
        for (uuid, props) in [
            ("2a37", CharacteristicProperties::NOTIFY),
            ("2a38", CharacteristicProperties::READ),
            ("2a39", CharacteristicProperties::WRITE),
        ] {
            let handle = DiscoveredCharacteristic {
                uuid: expand_uuid(uuid).unwrap(),
                service_uuid: expand_uuid("180d").unwrap(),
                properties: props,
                descriptors: Vec::new(),
            };
            let chr = Characteristic::new(
                handle,
                Vec::new(),
                link.clone(),
                NotificationPipeline::new(4, pool.clone()),
            );
            characteristics.insert(uuid.to_string(), Arc::new(chr));
        }
        BTreeMap::from([(
            "180d".to_string(),
            Service::new("180d".into(), characteristics),
        )])
    }

    #[test]
    fn test_explicit_characteristics_any_spelling() {
        let services = topology();
        let target = SubscribeTarget::service("0000180D-0000-1000-8000-00805F9B34FB")
            .characteristic("0x2A37");
        let validated = validate_target(&services, &target, true).unwrap();
        assert_eq!(validated.len(), 1);
        assert!(validated.contains_key(&("180d".to_string(), "2a37".to_string())));
    }

    #[test]
    fn test_empty_list_selects_every_characteristic() {
        let services = topology();
        let target = SubscribeTarget::service("180d");
        assert_eq!(validate_target(&services, &target, false).unwrap().len(), 3);
    }

    #[test]
    fn test_empty_list_reports_non_notifying() {
        let services = topology();
        let target = SubscribeTarget::service("180d");
        let failure = validate_target(&services, &target, true).unwrap_err();
        assert!(failure.missing_services.is_empty());
        assert!(failure.missing_characteristics.is_empty());
        let unsupported: Vec<_> = failure
            .unsupported
            .iter()
            .map(|m| m.characteristic.as_str())
            .collect();
        assert_eq!(unsupported, ["2a38", "2a39"]);

        let err = Error::Validation(failure);
        assert!(err.is_unsupported());
        assert!(err.to_string().contains("2a38 (in service 180d)"));
    }

    #[test]
    fn test_collects_every_problem() {
        let services = topology();
        let targets = [
            SubscribeTarget::service("1234"),
            SubscribeTarget::service("180d").characteristics(["2a37", "2a99", "2a38"]),
        ];
        let failure = validate_targets(&services, &targets, true).unwrap_err();
        assert_eq!(failure.missing_services, vec!["1234"]);
        assert_eq!(failure.missing_characteristics.len(), 1);
        assert_eq!(failure.unsupported.len(), 1);

        let message = Error::Validation(failure).to_string();
        assert_eq!(
            message,
            "validation failed - missing services: 1234; \
             missing characteristics: 2a99 (in service 180d); \
             characteristics without notification support: 2a38 (in service 180d)"
        );
    }

    #[test]
    fn test_missing_only_is_not_found_class() {
        let services = topology();
        let failure =
            validate_target(&services, &SubscribeTarget::service("ffff"), true).unwrap_err();
        let err = Error::Validation(failure);
        assert!(err.is_not_found());
        assert!(!err.is_unsupported());
    }

    #[test]
    fn test_capability_ignored_without_require_notify() {
        let services = topology();
        let target = SubscribeTarget::service("180d").characteristic("2a39");
        assert!(validate_target(&services, &target, false).is_ok());

        let err = Error::Validation(validate_target(&services, &target, true).unwrap_err());
        assert!(err.is_unsupported());
        assert!(!err.is_not_found());
    }
}

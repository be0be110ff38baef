//! GATT identifiers for the services and characteristics this engine consumes.

use std::fmt;

use uuid::Uuid;

/// Fitness Machine Service UUID (0x1826).
pub const FITNESS_MACHINE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_1826_0000_1000_8000_0080_5f9b_34fb);

/// Indoor Bike Data characteristic UUID (0x2AD2).
pub const INDOOR_BIKE_DATA_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad2_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine Control Point characteristic UUID (0x2AD9).
pub const CONTROL_POINT_UUID: Uuid = Uuid::from_u128(0x0000_2ad9_0000_1000_8000_0080_5f9b_34fb);

/// Heart Rate Service UUID (0x180D).
pub const HEART_RATE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);

/// Heart Rate Measurement characteristic UUID (0x2A37).
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a37_0000_1000_8000_0080_5f9b_34fb);

/// Role of a discovered characteristic.
///
/// The engine routes inbound notifications by role; notifications on
/// characteristics with no role are dropped silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicRole {
    /// Indoor Bike Data (0x2AD2), notify.
    IndoorBikeData,
    /// Heart Rate Measurement (0x2A37), notify.
    HeartRateMeasurement,
    /// Fitness Machine Control Point (0x2AD9), write + indicate.
    ControlPoint,
}

impl CharacteristicRole {
    /// Attempts to classify a characteristic UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        match uuid {
            INDOOR_BIKE_DATA_UUID => Some(Self::IndoorBikeData),
            HEART_RATE_MEASUREMENT_UUID => Some(Self::HeartRateMeasurement),
            CONTROL_POINT_UUID => Some(Self::ControlPoint),
            _ => None,
        }
    }

    /// Returns the characteristic UUID for this role.
    #[must_use]
    pub const fn uuid(self) -> Uuid {
        match self {
            Self::IndoorBikeData => INDOOR_BIKE_DATA_UUID,
            Self::HeartRateMeasurement => HEART_RATE_MEASUREMENT_UUID,
            Self::ControlPoint => CONTROL_POINT_UUID,
        }
    }

    /// Returns the UUID of the service this characteristic belongs to.
    #[must_use]
    pub const fn service_uuid(self) -> Uuid {
        match self {
            Self::IndoorBikeData | Self::ControlPoint => FITNESS_MACHINE_SERVICE_UUID,
            Self::HeartRateMeasurement => HEART_RATE_SERVICE_UUID,
        }
    }

    /// Static name for error reporting and logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::IndoorBikeData => "IndoorBikeData",
            Self::HeartRateMeasurement => "HeartRateMeasurement",
            Self::ControlPoint => "ControlPoint",
        }
    }
}

impl fmt::Display for CharacteristicRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_from_uuid() {
        assert_eq!(
            CharacteristicRole::from_uuid(INDOOR_BIKE_DATA_UUID),
            Some(CharacteristicRole::IndoorBikeData)
        );
        assert_eq!(
            CharacteristicRole::from_uuid(HEART_RATE_MEASUREMENT_UUID),
            Some(CharacteristicRole::HeartRateMeasurement)
        );
        assert_eq!(
            CharacteristicRole::from_uuid(CONTROL_POINT_UUID),
            Some(CharacteristicRole::ControlPoint)
        );
        // Battery Level - not a role we consume
        let battery = Uuid::from_u128(0x0000_2a19_0000_1000_8000_0080_5f9b_34fb);
        assert_eq!(CharacteristicRole::from_uuid(battery), None);
    }

    #[test]
    fn test_role_service_mapping() {
        assert_eq!(
            CharacteristicRole::ControlPoint.service_uuid(),
            FITNESS_MACHINE_SERVICE_UUID
        );
        assert_eq!(
            CharacteristicRole::HeartRateMeasurement.service_uuid(),
            HEART_RATE_SERVICE_UUID
        );
    }
}

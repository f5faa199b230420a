/*!
 * Classification of the 4-byte device type codes reported by the router.
 */
use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of entity a device type is modelled as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// Single-channel dimmable load
    Dimmer,
}

/// Known device types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    /// DALI fluorescent lamps
    DaliFluorescentLamps,
    /// DALI emergency lighting
    DaliEmergencyLighting,
    /// DALI discharge lamps
    DaliDischargeLamps,
    /// DALI low voltage halogen lamps
    DaliLowVoltageHalogenLamps,
    /// DALI incandescent lamps
    DaliIncandescentLamps,
    /// DALI DC dimmer
    DaliDcDimmer,
    /// DALI LED module
    DaliLedModule,
    /// DALI relay
    DaliRelay,
}

impl DeviceType {
    /// Every known type
    pub const ALL: &'static [DeviceType] = &[
        DeviceType::DaliFluorescentLamps,
        DeviceType::DaliEmergencyLighting,
        DeviceType::DaliDischargeLamps,
        DeviceType::DaliLowVoltageHalogenLamps,
        DeviceType::DaliIncandescentLamps,
        DeviceType::DaliDcDimmer,
        DeviceType::DaliLedModule,
        DeviceType::DaliRelay,
    ];

    /// Type code bytes, most significant first
    pub fn bytes(&self) -> [u8; 4] {
        match self {
            DeviceType::DaliFluorescentLamps => [0x00, 0x00, 0x00, 0x01],
            DeviceType::DaliEmergencyLighting => [0x00, 0x00, 0x01, 0x01],
            DeviceType::DaliDischargeLamps => [0x00, 0x00, 0x02, 0x01],
            DeviceType::DaliLowVoltageHalogenLamps => [0x00, 0x00, 0x03, 0x01],
            DeviceType::DaliIncandescentLamps => [0x00, 0x00, 0x04, 0x01],
            DeviceType::DaliDcDimmer => [0x00, 0x00, 0x05, 0x01],
            DeviceType::DaliLedModule => [0x00, 0x00, 0x06, 0x01],
            DeviceType::DaliRelay => [0x00, 0x00, 0x07, 0x01],
        }
    }

    /// Numeric type code as sent by the router
    pub fn code(&self) -> u32 {
        u32::from_be_bytes(self.bytes())
    }

    /// Type for a numeric code, if recognised
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.code() == code)
    }

    /// Human readable description
    pub fn description(&self) -> &'static str {
        match self {
            DeviceType::DaliFluorescentLamps => "Fluorescent lamps",
            DeviceType::DaliEmergencyLighting => "Emergency lighting",
            DeviceType::DaliDischargeLamps => "Discharge lamps",
            DeviceType::DaliLowVoltageHalogenLamps => "Low voltage halogen lamps",
            DeviceType::DaliIncandescentLamps => "Incandescent lamps",
            DeviceType::DaliDcDimmer => "DC dimmer",
            DeviceType::DaliLedModule => "LED lamps",
            DeviceType::DaliRelay => "Relay",
        }
    }

    /// How the device is modelled
    pub fn entity_kind(&self) -> EntityKind {
        EntityKind::Dimmer
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(DeviceType::DaliLedModule.code(), 0x0601);
        assert_eq!(DeviceType::DaliLedModule.code(), 1537);
        assert_eq!(DeviceType::DaliEmergencyLighting.code(), 0x0101);
        assert_eq!(DeviceType::DaliRelay.code(), 0x0701);
    }

    #[test]
    fn test_lookup() {
        assert_eq!(DeviceType::from_code(1537), Some(DeviceType::DaliLedModule));
        assert_eq!(DeviceType::from_code(0x0201), Some(DeviceType::DaliDischargeLamps));
        assert_eq!(DeviceType::from_code(0x0001), Some(DeviceType::DaliFluorescentLamps));
        assert_eq!(DeviceType::from_code(0x0802), None);
        for device_type in DeviceType::ALL {
            assert_eq!(DeviceType::from_code(device_type.code()), Some(*device_type));
            assert_eq!(device_type.entity_kind(), EntityKind::Dimmer);
        }
    }
}

/*!
 * HelvarNet addressing.
 *
 * Every control point on a router is reached through the four-level hierarchy
 * `cluster.router.subnet.device`. Router and subnet addresses are prefixes of
 * a device address; the wire form is `@1.1.2.15`, the identifier form used for
 * entity ids is `1-1-2-15`.
 */
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{HelvarError, Result};

/// Separator used on the wire
pub const WIRE_SEPARATOR: char = '.';

/// Separator used for stable identifiers
pub const UID_SEPARATOR: char = '-';

/// Lighting bus technology of a subnet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusType {
    /// DALI bus (subnets 1 and 2)
    Dali,
    /// Helvar S-DIM bus (subnet 3)
    SDim,
    /// DMX bus (subnet 4)
    Dmx,
}

impl BusType {
    /// Bus type for a subnet number
    pub fn from_subnet(subnet: u8) -> Option<Self> {
        match subnet {
            1 | 2 => Some(BusType::Dali),
            3 => Some(BusType::SDim),
            4 => Some(BusType::Dmx),
            _ => None,
        }
    }

    /// Display name of the bus
    pub fn name(&self) -> &'static str {
        match self {
            BusType::Dali => "DALI",
            BusType::SDim => "S-DIM",
            BusType::Dmx => "DMX",
        }
    }
}

impl fmt::Display for BusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A router, subnet or device address
///
/// Cluster and router are always present. Derived equality compares each
/// position, so two addresses are equal exactly when every field present on
/// either side matches and absent fields are absent on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    cluster: u8,
    router: u8,
    subnet: Option<u8>,
    device: Option<u8>,
}

impl Address {
    /// Router address (`cluster.router`)
    pub fn router(cluster: u8, router: u8) -> Self {
        Self {
            cluster,
            router,
            subnet: None,
            device: None,
        }
    }

    /// Subnet address (`cluster.router.subnet`)
    pub fn subnet_of(cluster: u8, router: u8, subnet: u8) -> Self {
        Self {
            subnet: Some(subnet),
            ..Self::router(cluster, router)
        }
    }

    /// Full device address
    pub fn device_of(cluster: u8, router: u8, subnet: u8, device: u8) -> Self {
        Self {
            subnet: Some(subnet),
            device: Some(device),
            ..Self::router(cluster, router)
        }
    }

    /// Cluster id
    pub fn cluster_id(&self) -> u8 {
        self.cluster
    }

    /// Router id
    pub fn router_id(&self) -> u8 {
        self.router
    }

    /// Subnet id, if present
    pub fn subnet_id(&self) -> Option<u8> {
        self.subnet
    }

    /// Device id, if present
    pub fn device_id(&self) -> Option<u8> {
        self.device
    }

    /// Specialise a router address to a subnet. Only used while an entity is
    /// being initialised.
    pub fn set_subnet(&mut self, subnet: u8) {
        self.subnet = Some(subnet);
    }

    /// Specialise a subnet address to a device. Only used while an entity is
    /// being initialised.
    pub fn set_device(&mut self, device: u8) {
        self.device = Some(device);
    }

    /// Copy of this address with the given subnet
    pub fn with_subnet(mut self, subnet: u8) -> Self {
        self.set_subnet(subnet);
        self
    }

    /// Copy of this address with the given device
    pub fn with_device(mut self, device: u8) -> Self {
        self.set_device(device);
        self
    }

    /// The `cluster.router` prefix of this address
    pub fn router_address(&self) -> Self {
        Self::router(self.cluster, self.router)
    }

    /// True if this address is on the given router
    pub fn is_on_router(&self, router: &Address) -> bool {
        self.cluster == router.cluster && self.router == router.router
    }

    /// True when all four fields are present and within protocol ranges
    pub fn is_valid_for_device(&self) -> bool {
        self.cluster <= 253
            && (1..=254).contains(&self.router)
            && matches!(self.subnet, Some(1..=4))
            && matches!(self.device, Some(1..=255))
    }

    /// Bus technology derived from the subnet
    pub fn bus_type(&self) -> Option<BusType> {
        self.subnet.and_then(BusType::from_subnet)
    }

    /// Join the populated fields with `separator`, stopping at the first absent one
    pub fn format(&self, separator: char) -> String {
        let mut out = format!("{}{}{}", self.cluster, separator, self.router);
        if let Some(subnet) = self.subnet {
            out.push(separator);
            out.push_str(&subnet.to_string());
            if let Some(device) = self.device {
                out.push(separator);
                out.push_str(&device.to_string());
            }
        }
        out
    }

    /// Wire form without the leading `@`
    pub fn to_wire(&self) -> String {
        self.format(WIRE_SEPARATOR)
    }

    /// Stable identifier form (`1-1-2-15`)
    pub fn to_uid(&self) -> String {
        self.format(UID_SEPARATOR)
    }

    /// Parse the identifier form produced by [`Address::to_uid`]
    pub fn from_uid(uid: &str) -> Result<Self> {
        Self::parse_with(uid, UID_SEPARATOR)
    }

    /// Parse an address split on `separator`, ignoring a leading `@`
    pub fn parse_with(text: &str, separator: char) -> Result<Self> {
        let trimmed = text.trim();
        let body = trimmed.strip_prefix('@').unwrap_or(trimmed);

        let parts = body
            .split(separator)
            .map(|part| {
                part.trim().parse::<u8>().map_err(|_| {
                    HelvarError::invalid_address(format!(
                        "'{}' is not a numeric address field in '{}'",
                        part, text
                    ))
                })
            })
            .collect::<Result<Vec<u8>>>()?;

        match parts.as_slice() {
            [cluster, router] => Ok(Self::router(*cluster, *router)),
            [cluster, router, subnet] => Ok(Self::subnet_of(*cluster, *router, *subnet)),
            [cluster, router, subnet, device] => {
                Ok(Self::device_of(*cluster, *router, *subnet, *device))
            }
            _ => Err(HelvarError::invalid_address(format!(
                "expected 2 to 4 fields in '{}'",
                text
            ))),
        }
    }
}

impl FromStr for Address {
    type Err = HelvarError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_with(s, WIRE_SEPARATOR)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.to_wire())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_address() {
        let address: Address = "@1.1.2.15".parse().unwrap();
        assert_eq!(address.cluster_id(), 1);
        assert_eq!(address.router_id(), 1);
        assert_eq!(address.subnet_id(), Some(2));
        assert_eq!(address.device_id(), Some(15));
        assert!(address.is_valid_for_device());
    }

    #[test]
    fn test_parse_partial_addresses() {
        let router: Address = "1.254".parse().unwrap();
        assert_eq!(router, Address::router(1, 254));
        assert!(!router.is_valid_for_device());

        let subnet: Address = "@0.1.4".parse().unwrap();
        assert_eq!(subnet.subnet_id(), Some(4));
        assert_eq!(subnet.device_id(), None);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            "@1.x.2".parse::<Address>(),
            Err(HelvarError::InvalidAddress(_))
        ));
        assert!("@1".parse::<Address>().is_err());
        assert!("1.1.1.1.1".parse::<Address>().is_err());
        assert!("".parse::<Address>().is_err());
        assert!("1.1.300".parse::<Address>().is_err());
    }

    #[test]
    fn test_format_round_trip() {
        for text in ["1.1", "0.254.3", "1.1.2.15", "253.1.4.255"] {
            let address: Address = text.parse().unwrap();
            assert_eq!(address.format('.'), text);
        }
    }

    #[test]
    fn test_uid_has_no_dots_and_round_trips() {
        let address = Address::device_of(1, 2, 3, 4);
        let uid = address.to_uid();
        assert_eq!(uid, "1-2-3-4");
        assert!(!uid.contains('.'));
        assert_eq!(Address::from_uid(&uid).unwrap(), address);

        let router = Address::router(0, 9);
        assert_eq!(Address::from_uid(&router.to_uid()).unwrap(), router);
    }

    #[test]
    fn test_positional_equality() {
        let a = Address::subnet_of(1, 1, 2);
        assert_eq!(a, "1.1.2".parse().unwrap());
        assert_ne!(a, Address::device_of(1, 1, 2, 5));
        assert_ne!(a, Address::router(1, 1));
    }

    #[test]
    fn test_setters_specialise_router_address() {
        let mut address = Address::router(1, 1);
        address.set_subnet(2);
        address.set_device(7);
        assert_eq!(address, Address::device_of(1, 1, 2, 7));
        assert_eq!(address.router_address(), Address::router(1, 1));
        assert_eq!(address.to_string(), "@1.1.2.7");
    }

    #[test]
    fn test_bus_type() {
        assert_eq!(Address::subnet_of(1, 1, 1).bus_type(), Some(BusType::Dali));
        assert_eq!(Address::subnet_of(1, 1, 2).bus_type(), Some(BusType::Dali));
        assert_eq!(Address::subnet_of(1, 1, 3).bus_type(), Some(BusType::SDim));
        assert_eq!(Address::subnet_of(1, 1, 4).bus_type(), Some(BusType::Dmx));
        assert_eq!(Address::subnet_of(1, 1, 5).bus_type(), None);
        assert_eq!(Address::router(1, 1).bus_type(), None);
    }
}

//! DCC address forms and the CAN/R-Bus/LocoNet detector addressing union.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("vehicle address {0} out of range (1..=10239)")]
    VehicleOutOfRange(u16),
    #[error("accessory address {0} out of range (1..=2048)")]
    AccessoryOutOfRange(u16),
}

/// A 14-bit DCC vehicle (loco) address, 1..=10239.
///
/// Addresses 1..=127 use the short-address wire form; 128..=10239 use the
/// two-byte extended form (top two bits of the first byte set to `11`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VehicleAddress(u16);

impl VehicleAddress {
    pub const MAX: u16 = 10239;
    pub const SHORT_MAX: u16 = 127;

    pub fn new(address: u16) -> Result<Self, AddressError> {
        if address == 0 || address > Self::MAX {
            return Err(AddressError::VehicleOutOfRange(address));
        }
        Ok(Self(address))
    }

    pub fn value(&self) -> u16 {
        self.0
    }

    pub fn is_short(&self) -> bool {
        self.0 <= Self::SHORT_MAX
    }
}

/// An 11-bit DCC accessory-decoder address, 1..=2048.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccessoryAddress(u16);

impl AccessoryAddress {
    pub const MAX: u16 = 2048;

    pub fn new(address: u16) -> Result<Self, AddressError> {
        if address == 0 || address > Self::MAX {
            return Err(AddressError::AccessoryOutOfRange(address));
        }
        Ok(Self(address))
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

/// Addressing for a single feedback point on one of the three detector buses
/// a Z21-family command station can relay (§3, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectorAddress {
    CanNetwork(u16),
    CanModule { network: u16, module: u8 },
    CanPort { network: u16, module: u8, port: u8 },
    RBusGroup(u16),
    RBusModule { group: u16, module: u8 },
    RBusPort { group: u16, module: u8, port: u8 },
    LoconetSic(u16),
    LoconetModule { sic: u16, module: u8 },
    LissyModule(u16),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_vehicle_address_short_vs_extended() {
        assert!(VehicleAddress::new(127).unwrap().is_short());
        assert!(!VehicleAddress::new(128).unwrap().is_short());
    }

    #[test]
    fn test_vehicle_address_out_of_range() {
        assert_eq!(VehicleAddress::new(0), Err(AddressError::VehicleOutOfRange(0)));
        assert_eq!(
            VehicleAddress::new(10240),
            Err(AddressError::VehicleOutOfRange(10240))
        );
        assert!(VehicleAddress::new(10239).is_ok());
    }

    #[test]
    fn test_accessory_address_out_of_range() {
        assert_eq!(
            AccessoryAddress::new(0),
            Err(AddressError::AccessoryOutOfRange(0))
        );
        assert_eq!(
            AccessoryAddress::new(2049),
            Err(AddressError::AccessoryOutOfRange(2049))
        );
        assert!(AccessoryAddress::new(2048).is_ok());
    }
}

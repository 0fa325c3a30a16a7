//! DCC track-packet encoding (§4.1).
//!
//! Builds the byte sequences that both LP2 and Z21 ultimately push out onto
//! the rails: address bytes, an instruction, and a trailing XOR checksum.
//! Pure and allocation-light; no I/O here.

use thiserror::Error;

use crate::address::{AccessoryAddress, VehicleAddress};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DccError {
    #[error("CV index {0} out of range (1..=1024)")]
    CvOutOfRange(u16),
    #[error("speed28 raw value {0} out of range (0..=31)")]
    Speed28OutOfRange(u8),
    #[error("speed126 raw value {0} out of range (0..=127)")]
    Speed126OutOfRange(u8),
    #[error("speed14 raw value {0} out of range (0..=15)")]
    Speed14OutOfRange(u8),
    #[error("bit position {0} out of range (0..=7)")]
    BitPositionOutOfRange(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    fn bit(self) -> u8 {
        match self {
            Direction::Forward => 1,
            Direction::Reverse => 0,
        }
    }
}

/// A built DCC request: address bytes + instruction bytes + XOR checksum,
/// ready to hand to a framer. Invariant: `xor(bytes) == 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DccRequest {
    bytes: Vec<u8>,
}

impl DccRequest {
    fn from_parts(address: &[u8], instruction: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(address.len() + instruction.len() + 1);
        bytes.extend_from_slice(address);
        bytes.extend_from_slice(instruction);
        let checksum = bytes.iter().fold(0u8, |acc, b| acc ^ b);
        bytes.push(checksum);
        Self { bytes }
    }

    pub fn to_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

fn encode_vehicle_address(address: VehicleAddress) -> Vec<u8> {
    let v = address.value();
    if address.is_short() {
        vec![v as u8]
    } else {
        vec![0xC0 | ((v >> 8) as u8), (v & 0xFF) as u8]
    }
}

/// Parses the address prefix off a received DCC packet, returning the
/// decoded address and the remainder (instruction bytes + checksum).
pub fn parse_vehicle_address(bytes: &[u8]) -> Option<(VehicleAddress, &[u8])> {
    if bytes.is_empty() {
        return None;
    }
    if bytes[0] & 0xC0 == 0xC0 {
        if bytes.len() < 2 {
            return None;
        }
        let addr = (((bytes[0] & 0x3F) as u16) << 8) | bytes[1] as u16;
        Some((VehicleAddress::new(addr).ok()?, &bytes[2..]))
    } else {
        Some((VehicleAddress::new(bytes[0] as u16).ok()?, &bytes[1..]))
    }
}

/// `00 00`: the broadcast reset packet.
pub fn reset() -> DccRequest {
    DccRequest::from_parts(&[0x00], &[0x00])
}

/// `01SFXXXX`, 14 speed steps (S=direction, F=headlight, X=4-bit speed).
pub fn speed14(
    address: VehicleAddress,
    speed: u8,
    direction: Direction,
    headlight: bool,
) -> Result<DccRequest, DccError> {
    if speed > 0x0F {
        return Err(DccError::Speed14OutOfRange(speed));
    }
    let instr = 0x40 | (direction.bit() << 5) | ((headlight as u8) << 4) | speed;
    Ok(DccRequest::from_parts(
        &encode_vehicle_address(address),
        &[instr],
    ))
}

/// `01SXXXXX`, 28 speed steps, low bit interleaved per S9.2.
///
/// `speed` is the raw 5-bit NMRA speed code (0=stop, 1=emergency stop,
/// 2..=31 running speeds), matching the value callers pass in directly.
pub fn speed28(
    address: VehicleAddress,
    speed: u8,
    direction: Direction,
) -> Result<DccRequest, DccError> {
    if speed > 0x1F {
        return Err(DccError::Speed28OutOfRange(speed));
    }
    let data5 = ((speed & 0x01) << 4) | ((speed >> 1) & 0x0F);
    let instr = 0x40 | (direction.bit() << 5) | data5;
    Ok(DccRequest::from_parts(
        &encode_vehicle_address(address),
        &[instr],
    ))
}

/// `3F SVVVVVVV`, 126 speed steps (advanced operations instruction).
pub fn speed126(
    address: VehicleAddress,
    speed: u8,
    direction: Direction,
) -> Result<DccRequest, DccError> {
    if speed > 0x7F {
        return Err(DccError::Speed126OutOfRange(speed));
    }
    let data = (direction.bit() << 7) | speed;
    Ok(DccRequest::from_parts(
        &encode_vehicle_address(address),
        &[0x3F, data],
    ))
}

/// Function group 1: F0 (headlight) through F4. `100DDDDD`.
pub fn function_group1(
    address: VehicleAddress,
    f0: bool,
    f1: bool,
    f2: bool,
    f3: bool,
    f4: bool,
) -> DccRequest {
    let instr = 0x80
        | ((f0 as u8) << 4)
        | ((f4 as u8) << 3)
        | ((f3 as u8) << 2)
        | ((f2 as u8) << 1)
        | (f1 as u8);
    DccRequest::from_parts(&encode_vehicle_address(address), &[instr])
}

/// Function group 2, F5-F8. `1011DDDD`.
pub fn function_group_f5_f8(
    address: VehicleAddress,
    f5: bool,
    f6: bool,
    f7: bool,
    f8: bool,
) -> DccRequest {
    let instr = 0xB0 | ((f8 as u8) << 3) | ((f7 as u8) << 2) | ((f6 as u8) << 1) | (f5 as u8);
    DccRequest::from_parts(&encode_vehicle_address(address), &[instr])
}

/// Function group 3, F9-F12. `1010DDDD`.
pub fn function_group_f9_f12(
    address: VehicleAddress,
    f9: bool,
    f10: bool,
    f11: bool,
    f12: bool,
) -> DccRequest {
    let instr = 0xA0 | ((f12 as u8) << 3) | ((f11 as u8) << 2) | ((f10 as u8) << 1) | (f9 as u8);
    DccRequest::from_parts(&encode_vehicle_address(address), &[instr])
}

/// Feature-expansion group, F13-F20: `11011110`, then a bitmap byte.
pub fn function_group_f13_f20(address: VehicleAddress, bitmap: u8) -> DccRequest {
    DccRequest::from_parts(&encode_vehicle_address(address), &[0xDE, bitmap])
}

/// Feature-expansion group, F21-F28: `11011111`, then a bitmap byte.
pub fn function_group_f21_f28(address: VehicleAddress, bitmap: u8) -> DccRequest {
    DccRequest::from_parts(&encode_vehicle_address(address), &[0xDF, bitmap])
}

/// Feature-expansion group, F29-F36: `11011000`, then a bitmap byte.
pub fn function_group_f29_f36(address: VehicleAddress, bitmap: u8) -> DccRequest {
    DccRequest::from_parts(&encode_vehicle_address(address), &[0xD8, bitmap])
}

/// Feature-expansion group, F37-F44: `11011001`, then a bitmap byte.
pub fn function_group_f37_f44(address: VehicleAddress, bitmap: u8) -> DccRequest {
    DccRequest::from_parts(&encode_vehicle_address(address), &[0xD9, bitmap])
}

/// Feature-expansion group, F45-F52: `11011010`, then a bitmap byte.
pub fn function_group_f45_f52(address: VehicleAddress, bitmap: u8) -> DccRequest {
    DccRequest::from_parts(&encode_vehicle_address(address), &[0xDA, bitmap])
}

/// Feature-expansion group, F53-F60: `11011011`, then a bitmap byte.
pub fn function_group_f53_f60(address: VehicleAddress, bitmap: u8) -> DccRequest {
    DccRequest::from_parts(&encode_vehicle_address(address), &[0xDB, bitmap])
}

/// Feature-expansion group, F61-F68: `11011100`, then a bitmap byte.
pub fn function_group_f61_f68(address: VehicleAddress, bitmap: u8) -> DccRequest {
    DccRequest::from_parts(&encode_vehicle_address(address), &[0xDC, bitmap])
}

/// Feature-expansion groups 4..10 (F13 and up) as a single dispatcher, per
/// NMRA S9.2.1. Each variant's `bitmap` packs its functions LSB-first in
/// ascending numeric order (`FunctionGroup::F13_20(bitmap)` has F13 in bit 0,
/// F20 in bit 7). Groups 1-3 (F0-F12) pack their function bits directly into
/// the opcode byte rather than a separate bitmap, so they stay as the
/// individual `function_group1`/`function_group_f5_f8`/`function_group_f9_f12`
/// calls above instead of joining this dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionGroup {
    F13_20(u8),
    F21_28(u8),
    F29_36(u8),
    F37_44(u8),
    F45_52(u8),
    F53_60(u8),
    F61_68(u8),
}

/// Dispatches to the matching feature-expansion group encoder above.
pub fn set_functions(address: VehicleAddress, group: FunctionGroup) -> DccRequest {
    match group {
        FunctionGroup::F13_20(bitmap) => function_group_f13_f20(address, bitmap),
        FunctionGroup::F21_28(bitmap) => function_group_f21_f28(address, bitmap),
        FunctionGroup::F29_36(bitmap) => function_group_f29_f36(address, bitmap),
        FunctionGroup::F37_44(bitmap) => function_group_f37_f44(address, bitmap),
        FunctionGroup::F45_52(bitmap) => function_group_f45_f52(address, bitmap),
        FunctionGroup::F53_60(bitmap) => function_group_f53_f60(address, bitmap),
        FunctionGroup::F61_68(bitmap) => function_group_f61_f68(address, bitmap),
    }
}

/// The `CC` sub-field of the CV access instruction prefix, §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CvAccessKind {
    VerifyByte = 0b01,
    BitManipulation = 0b10,
    WriteByte = 0b11,
}

fn cv_access_prefix(cv: u16, kind: CvAccessKind) -> Result<[u8; 2], DccError> {
    if !(1..=1024).contains(&cv) {
        return Err(DccError::CvOutOfRange(cv));
    }
    let addr10 = cv - 1;
    let byte1 = 0x70 | ((kind as u8) << 2) | ((addr10 >> 8) as u8 & 0x03);
    let byte2 = (addr10 & 0xFF) as u8;
    Ok([byte1, byte2])
}

/// Verify-bit: checks whether bit `pos` of CV `cv` equals `value`. Service
/// mode addresses the single decoder on the programming track regardless of
/// its own address, so these packets carry no address byte at all.
pub fn verify_bit(cv: u16, value: bool, pos: u8) -> Result<DccRequest, DccError> {
    if pos > 7 {
        return Err(DccError::BitPositionOutOfRange(pos));
    }
    let prefix = cv_access_prefix(cv, CvAccessKind::BitManipulation)?;
    let bit_byte = 0xE0 | ((value as u8) << 3) | pos;
    Ok(DccRequest::from_parts(&[], &[prefix[0], prefix[1], bit_byte]))
}

/// Write-bit: sets bit `pos` of CV `cv` to `value`. Addressless; see
/// [`verify_bit`].
pub fn write_bit(cv: u16, value: bool, pos: u8) -> Result<DccRequest, DccError> {
    if pos > 7 {
        return Err(DccError::BitPositionOutOfRange(pos));
    }
    let prefix = cv_access_prefix(cv, CvAccessKind::BitManipulation)?;
    let bit_byte = 0xE0 | (1 << 4) | ((value as u8) << 3) | pos;
    Ok(DccRequest::from_parts(&[], &[prefix[0], prefix[1], bit_byte]))
}

/// Verify-byte: checks whether CV `cv` equals `value`. Addressless; see
/// [`verify_bit`].
pub fn verify_byte(cv: u16, value: u8) -> Result<DccRequest, DccError> {
    let prefix = cv_access_prefix(cv, CvAccessKind::VerifyByte)?;
    Ok(DccRequest::from_parts(&[], &[prefix[0], prefix[1], value]))
}

/// Write-byte: writes `value` into CV `cv`. Addressless; see [`verify_bit`].
pub fn write_byte(cv: u16, value: u8) -> Result<DccRequest, DccError> {
    let prefix = cv_access_prefix(cv, CvAccessKind::WriteByte)?;
    Ok(DccRequest::from_parts(&[], &[prefix[0], prefix[1], value]))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_reset() {
        assert_eq!(reset().to_bytes(), &[0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_speed28_short_address() {
        let addr = VehicleAddress::new(3).unwrap();
        let req = speed28(addr, 16, Direction::Forward).unwrap();
        assert_eq!(req.to_bytes(), &[0x03, 0x68, 0x6B]);
    }

    #[test]
    fn test_speed28_extended_address() {
        let addr = VehicleAddress::new(830).unwrap();
        let req = speed28(addr, 17, Direction::Reverse).unwrap();
        assert_eq!(req.to_bytes(), &[0xC3, 0x3E, 0x58, 0xA5]);
    }

    #[test]
    fn test_verify_bit_cv29() {
        let req = verify_bit(29, true, 5).unwrap();
        assert_eq!(req.to_bytes(), &[0x78, 0x1C, 0xED, 0x89]);
    }

    #[test]
    fn test_write_byte_cv29() {
        let req = write_byte(29, 48).unwrap();
        assert_eq!(req.to_bytes(), &[0x7C, 0x1C, 0x30, 0x50]);
    }

    #[test]
    fn test_write_byte_cv1021() {
        let req = write_byte(1021, 3).unwrap();
        assert_eq!(req.to_bytes(), &[0x7F, 0xFC, 0x03, 0x80]);
    }

    #[test]
    fn test_cv_out_of_range() {
        assert_eq!(write_byte(1025, 0), Err(DccError::CvOutOfRange(1025)));
        assert_eq!(write_byte(0, 0), Err(DccError::CvOutOfRange(0)));
    }

    #[test]
    fn test_function_groups_6_through_10() {
        let addr = VehicleAddress::new(3).unwrap();
        assert_eq!(
            function_group_f29_f36(addr, 0x01).to_bytes(),
            &[0x03, 0xD8, 0x01, 0xDA]
        );
        assert_eq!(
            function_group_f37_f44(addr, 0x01).to_bytes(),
            &[0x03, 0xD9, 0x01, 0xDB]
        );
        assert_eq!(
            function_group_f45_f52(addr, 0x01).to_bytes(),
            &[0x03, 0xDA, 0x01, 0xD8]
        );
        assert_eq!(
            function_group_f53_f60(addr, 0x01).to_bytes(),
            &[0x03, 0xDB, 0x01, 0xD9]
        );
        assert_eq!(
            function_group_f61_f68(addr, 0x01).to_bytes(),
            &[0x03, 0xDC, 0x01, 0xDE]
        );
    }

    #[test]
    fn test_speed_out_of_range() {
        let addr = VehicleAddress::new(3).unwrap();
        assert_eq!(
            speed28(addr, 32, Direction::Forward),
            Err(DccError::Speed28OutOfRange(32))
        );
    }

    #[test]
    fn test_checksum_is_xor_of_all_bytes() {
        let addr = VehicleAddress::new(3).unwrap();
        let req = speed28(addr, 16, Direction::Forward).unwrap();
        let xor = req.to_bytes().iter().fold(0u8, |acc, b| acc ^ b);
        assert_eq!(xor, 0);
    }

    #[test]
    fn test_parse_vehicle_address_short() {
        let (addr, rest) = parse_vehicle_address(&[0x03, 0x68, 0x6B]).unwrap();
        assert_eq!(addr.value(), 3);
        assert_eq!(rest, &[0x68, 0x6B]);
    }

    #[test]
    fn test_parse_vehicle_address_extended() {
        let (addr, rest) = parse_vehicle_address(&[0xC3, 0x3E, 0x58, 0xA5]).unwrap();
        assert_eq!(addr.value(), 830);
        assert_eq!(rest, &[0x58, 0xA5]);
    }
}

/// A DCC accessory-decoder packet (§4.1 is phrased for vehicles; the
/// accessory form is the same address-plus-instruction-plus-checksum shape
/// with an 11-bit accessory address in place of the vehicle address).
pub fn accessory(address: AccessoryAddress, activate: bool, output: u8) -> DccRequest {
    let v = address.value() - 1;
    let board = (v >> 2) as u8;
    let nibble = (v & 0x03) as u8;
    let addr_byte = 0x80 | (board & 0x3F);
    let instr_byte = 0x80 | (nibble << 1) | ((activate as u8) << 3) | (output & 0x01);
    DccRequest::from_parts(&[addr_byte], &[instr_byte])
}

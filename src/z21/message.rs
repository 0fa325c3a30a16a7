//! Z21 LAN IDs, XBus sub-opcodes, and the high-level message types built on
//! top of the raw [`crate::z21::framing::Frame`] (§4.5, §6).

use crate::z21::framing::{self, Frame, LAN_X};

pub mod lan_id {
    pub const GET_SERIAL_NUMBER: u16 = 0x10;
    pub const GET_HWINFO: u16 = 0x1A;
    pub const LOGOFF: u16 = 0x30;
    pub const LAN_X: u16 = 0x0040;
    pub const GET_BROADCASTFLAGS: u16 = 0x51;
    pub const SET_BROADCASTFLAGS: u16 = 0x50;
    pub const SYSTEMSTATE_DATACHANGED: u16 = 0x84;
    pub const CAN_DETECTOR: u16 = 0xC4;
    pub const RMBUS_DATACHANGED: u16 = 0x80;
    pub const LOCONET_Z21_RX: u16 = 0xA0;
    /// `LAN_GET_LOCKSTATE`: not assigned a wire value anywhere in the source
    /// material (§4.5 names only the behavior, "lock state... queried on
    /// demand and cached"); this crate's own stable allocation, same
    /// convention as the CAN-detector frame layout (see DESIGN.md).
    pub const GET_LOCKSTATE: u16 = 0x19;
}

pub mod xbus_op {
    pub const STATUS_REQUEST: u8 = 0x21;
    pub const STATUS_CHANGED: u8 = 0x62;
    pub const SET_TRACK_POWER: u8 = 0x21;
    pub const BC_TRACK_POWER_OFF: u8 = 0x61;
    pub const BC_TRACK_POWER_ON: u8 = 0x61;
    pub const BC_PROGRAMMING_MODE: u8 = 0x61;
    pub const BC_TRACK_SHORT_CIRCUIT: u8 = 0x61;
    pub const BC_STOPPED: u8 = 0x81;
    pub const CV_READ: u8 = 0x23;
    pub const CV_WRITE: u8 = 0x24;
    pub const CV_POM_READ: u8 = 0xE4;
    pub const CV_POM_WRITE: u8 = 0xE6;
    pub const CV_RESULT: u8 = 0x64;
    pub const CV_NACK_SHORT_CIRCUIT: u8 = 0x61;
    pub const CV_NACK: u8 = 0x61;
}

/// `db0` sub-opcodes that follow an `0x61` header for the single-byte
/// broadcast/status messages of §4.5.
pub mod db0 {
    pub const TRACK_POWER_OFF: u8 = 0x00;
    pub const TRACK_POWER_ON: u8 = 0x01;
    pub const PROGRAMMING_MODE: u8 = 0x02;
    pub const TRACK_SHORT_CIRCUIT: u8 = 0x08;
    pub const CV_NACK_SHORT_CIRCUIT: u8 = 0x12;
    pub const CV_NACK: u8 = 0x13;
}

/// A tiny hand-rolled bitflags macro, in lieu of pulling in the `bitflags`
/// crate for a single 32-bit mask type.
macro_rules! bitflags_lite {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name($ty);

        impl $name {
            $(pub const $flag: $name = $name($value);)*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn bits(&self) -> $ty {
                self.0
            }

            pub const fn from_bits(bits: $ty) -> Self {
                Self(bits)
            }

            pub const fn contains(&self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

bitflags_lite! {
    /// The Z21 broadcast-subscription bitmask (`LAN_GET/SET_BROADCASTFLAGS`).
    pub struct Subscriptions: u32 {
        const GENERIC = 1 << 0;
        const RBUS = 1 << 2;
        const SYSTEM_STATE = 1 << 8;
        const ALL_LOCO_INFO = 1 << 16;
        const CAN_DETECTOR = 1 << 18;
    }
}

pub fn broadcast_flags_from_payload(payload: &[u8]) -> Option<Subscriptions> {
    if payload.len() < 4 {
        return None;
    }
    let bits = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    Some(Subscriptions::from_bits(bits))
}

pub fn set_broadcast_flags_frame(flags: Subscriptions) -> Vec<u8> {
    framing::encode_frame(lan_id::SET_BROADCASTFLAGS, &flags.bits().to_le_bytes())
}

pub fn get_broadcast_flags_frame() -> Vec<u8> {
    framing::encode_frame(lan_id::GET_BROADCASTFLAGS, &[])
}

pub fn status_request_frame() -> Vec<u8> {
    framing::encode_frame(LAN_X, &framing::xbus_with_checksum(vec![xbus_op::STATUS_REQUEST, 0x24]))
}

pub fn get_serial_number_frame() -> Vec<u8> {
    framing::encode_frame(lan_id::GET_SERIAL_NUMBER, &[])
}

pub fn parse_serial_number(payload: &[u8]) -> Option<u32> {
    Some(u32::from_le_bytes(payload.get(0..4)?.try_into().ok()?))
}

pub fn get_hwinfo_frame() -> Vec<u8> {
    framing::encode_frame(lan_id::GET_HWINFO, &[])
}

/// `(hardware_type, firmware_version)` as reported by `LAN_GET_HWINFO`.
pub fn parse_hwinfo(payload: &[u8]) -> Option<(u32, u32)> {
    if payload.len() < 8 {
        return None;
    }
    let hw_type = u32::from_le_bytes(payload[0..4].try_into().ok()?);
    let fw_version = u32::from_le_bytes(payload[4..8].try_into().ok()?);
    Some((hw_type, fw_version))
}

pub fn get_lock_state_frame() -> Vec<u8> {
    framing::encode_frame(lan_id::GET_LOCKSTATE, &[])
}

/// A single byte: non-zero means the station is locked (e.g. by another
/// controlling app holding exclusive access).
pub fn parse_lock_state(payload: &[u8]) -> Option<bool> {
    Some(*payload.first()? != 0)
}

pub fn set_track_power_on_frame() -> Vec<u8> {
    framing::encode_frame(LAN_X, &framing::xbus_with_checksum(vec![0x21, 0x81]))
}

pub fn set_track_power_off_frame() -> Vec<u8> {
    framing::encode_frame(LAN_X, &framing::xbus_with_checksum(vec![0x21, 0x80]))
}

pub fn emergency_stop_frame() -> Vec<u8> {
    framing::encode_frame(LAN_X, &framing::xbus_with_checksum(vec![0x80]))
}

/// The 7-byte `LAN_X` broadcasts (§4.5) that drive the track-power state
/// machine irrespective of who initiated the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackPowerBroadcast {
    PowerOff,
    PowerOn,
    ProgrammingMode,
    ShortCircuit,
}

pub fn parse_track_power_broadcast(payload: &[u8]) -> Option<TrackPowerBroadcast> {
    if payload.len() != 2 || payload[0] != 0x61 {
        return None;
    }
    match payload[1] {
        db0::TRACK_POWER_OFF => Some(TrackPowerBroadcast::PowerOff),
        db0::TRACK_POWER_ON => Some(TrackPowerBroadcast::PowerOn),
        db0::PROGRAMMING_MODE => Some(TrackPowerBroadcast::ProgrammingMode),
        db0::TRACK_SHORT_CIRCUIT => Some(TrackPowerBroadcast::ShortCircuit),
        _ => None,
    }
}

/// Builds the direct-mode `Read CV` XBus request (§4.5 scenario 5): header
/// `0x23 0x11`, the 0-based CV index (big-endian), then checksum.
pub fn read_cv_request(cv: u16) -> Vec<u8> {
    let idx = cv.saturating_sub(1);
    let data = vec![xbus_op::CV_READ, 0x11, (idx >> 8) as u8, (idx & 0xFF) as u8];
    framing::xbus_with_checksum(data)
}

/// Builds the direct-mode `Write CV` XBus request.
pub fn write_cv_request(cv: u16, value: u8) -> Vec<u8> {
    let idx = cv.saturating_sub(1);
    let data = vec![
        xbus_op::CV_WRITE,
        0x12,
        (idx >> 8) as u8,
        (idx & 0xFF) as u8,
        value,
    ];
    framing::xbus_with_checksum(data)
}

/// Builds a POM (programming-on-main) CV write request addressed to a
/// running vehicle.
pub fn write_cv_pom_request(vehicle_address: u16, cv: u16, value: u8) -> Vec<u8> {
    let idx = cv.saturating_sub(1);
    let data = vec![
        xbus_op::CV_POM_WRITE,
        0x30,
        (vehicle_address >> 8) as u8 | 0xC0,
        (vehicle_address & 0xFF) as u8,
        0xEC | ((idx >> 8) as u8 & 0x03),
        (idx & 0xFF) as u8,
        value,
    ];
    framing::xbus_with_checksum(data)
}

/// Builds a POM CV read request addressed to a running vehicle.
pub fn read_cv_pom_request(vehicle_address: u16, cv: u16) -> Vec<u8> {
    let idx = cv.saturating_sub(1);
    let data = vec![
        xbus_op::CV_POM_READ,
        0x30,
        (vehicle_address >> 8) as u8 | 0xC0,
        (vehicle_address & 0xFF) as u8,
        0xE4 | ((idx >> 8) as u8 & 0x03),
        (idx & 0xFF) as u8,
        0x00,
    ];
    framing::xbus_with_checksum(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigResponse {
    Result { cv: u16, value: u8 },
    ShortCircuit,
    ValueRejected,
}

/// Parses a response to a CV read/write request. The device reports CV
/// indices 0-based on the wire (§4.5 scenario 5: requesting CV 1 yields
/// `ConfigResult(cv=0, ...)`), so callers compare against `requested_cv - 1`.
pub fn parse_config_response(payload: &[u8]) -> Option<ConfigResponse> {
    if payload.len() < 2 {
        return None;
    }
    match (payload[0], payload[1]) {
        (xbus_op::CV_RESULT, 0x14) if payload.len() >= 5 => {
            let cv = u16::from_be_bytes([payload[2], payload[3]]);
            Some(ConfigResponse::Result {
                cv,
                value: payload[4],
            })
        }
        (0x61, db0::CV_NACK_SHORT_CIRCUIT) => Some(ConfigResponse::ShortCircuit),
        (0x61, db0::CV_NACK) => Some(ConfigResponse::ValueRejected),
        _ => None,
    }
}

pub fn is_lan_x(frame: &Frame) -> bool {
    frame.lan_id == LAN_X
}

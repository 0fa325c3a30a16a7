//! CAN feedback-detector aggregation (§4.6): raw per-frame CAN messages are
//! merged per `(network, module, port)` into consolidated [`DetectorInfo`]
//! events, with completeness detection across fragmented vehicle-set frames.

use crate::address::DetectorAddress;
use crate::dcc::Direction;
use std::collections::HashMap;

/// A single raw CAN feedback frame as received on the wire: `(network,
/// module, port, type, v1, v2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    pub network: u16,
    pub module: u8,
    pub port: u8,
    pub kind: CanFrameKind,
    pub v1: u16,
    pub v2: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanFrameKind {
    Occupancy,
    /// `VehicleSetN` for N in 1..=15.
    VehicleSet(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccupancyFrame {
    pub occupied: bool,
    pub power_on: bool,
}

/// Decodes the `v1` field of an `Occupancy` frame: bit8 = occupied, bit12 = power.
fn decode_occupancy(v1: u16) -> OccupancyFrame {
    OccupancyFrame {
        occupied: v1 & 0x0100 != 0,
        power_on: v1 & 0x1000 != 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VehicleSlot {
    pub address: u16,
    pub direction: Direction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VehicleSetFrame {
    pub set_number: u8,
    pub slots: Vec<VehicleSlot>,
    /// Set when the highest slot's vehicle-2 field is zero, i.e. no more
    /// sets follow this one.
    pub is_last: bool,
}

fn decode_vehicle_slot(raw_address: u16, raw_direction: bool) -> Option<VehicleSlot> {
    if raw_address == 0 {
        return None;
    }
    Some(VehicleSlot {
        address: raw_address & 0x3FFF,
        direction: if raw_direction {
            Direction::Forward
        } else {
            Direction::Reverse
        },
    })
}

/// Decodes a `VehicleSetN` frame's `(v1, v2)` pair into up to two slots.
/// Direction is carried in each address field's top bit (bit 15 set =
/// forward), matching the vehicle-address-with-direction encoding used
/// throughout the Z21 LAN protocol.
fn decode_vehicle_set(set_number: u8, v1: u16, v2: u16) -> VehicleSetFrame {
    let mut slots = Vec::new();
    if let Some(slot) = decode_vehicle_slot(v1 & 0x3FFF, v1 & 0x8000 != 0) {
        slots.push(slot);
    }
    if let Some(slot) = decode_vehicle_slot(v2 & 0x3FFF, v2 & 0x8000 != 0) {
        slots.push(slot);
    }
    VehicleSetFrame {
        set_number,
        slots,
        is_last: v2 == 0,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct DetectorState {
    occupancy: Option<OccupancyFrame>,
    vehicle_sets: Vec<VehicleSetFrame>,
}

impl DetectorState {
    fn is_complete(&self) -> bool {
        let Some(occupancy) = self.occupancy else {
            return false;
        };
        let Some(last_set) = self.vehicle_sets.last() else {
            return !occupancy.occupied;
        };
        let has_vehicles = self.vehicle_sets.iter().any(|s| !s.slots.is_empty());
        last_set.is_last && has_vehicles == occupancy.occupied
    }

    fn to_info(&self, address: DetectorAddress) -> DetectorInfo {
        let occupancy = self.occupancy.unwrap_or(OccupancyFrame {
            occupied: false,
            power_on: false,
        });
        let mut vehicles = Vec::new();
        let mut directions = Vec::new();
        for set in &self.vehicle_sets {
            for slot in &set.slots {
                vehicles.push(slot.address);
                directions.push(slot.direction);
            }
        }
        DetectorInfo {
            address,
            occupied: occupancy.occupied,
            power_on: occupancy.power_on,
            vehicles,
            directions,
        }
    }
}

/// A consolidated, model-layer feedback-detector event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorInfo {
    pub address: DetectorAddress,
    pub occupied: bool,
    pub power_on: bool,
    pub vehicles: Vec<u16>,
    pub directions: Vec<Direction>,
}

/// Per-network detector state, keyed by `(module, port)`. Created lazily,
/// destroyed on disconnect; state survives across completeness cycles
/// (a completed detector keeps its last-known state until overwritten).
#[derive(Debug, Default)]
pub struct NetworkState {
    network: u16,
    modules: HashMap<(u8, u8), DetectorState>,
}

impl NetworkState {
    pub fn new(network: u16) -> Self {
        Self {
            network,
            modules: HashMap::new(),
        }
    }

    /// Feeds a single CAN frame into the aggregator. Returns `Some` exactly
    /// once per completeness transition (§8 property: "complete" triggers
    /// exactly one emission before transitioning back to partial on new
    /// input).
    pub fn feed(&mut self, frame: CanFrame) -> Option<DetectorInfo> {
        let key = (frame.module, frame.port);
        let state = self.modules.entry(key).or_default();
        let was_complete = state.is_complete();
        match frame.kind {
            CanFrameKind::Occupancy => {
                state.occupancy = Some(decode_occupancy(frame.v1));
            }
            CanFrameKind::VehicleSet(1) => {
                state.vehicle_sets.clear();
                state.vehicle_sets.push(decode_vehicle_set(1, frame.v1, frame.v2));
            }
            CanFrameKind::VehicleSet(n) => {
                state.vehicle_sets.push(decode_vehicle_set(n, frame.v1, frame.v2));
            }
        }
        let now_complete = state.is_complete();
        if now_complete && !was_complete {
            let address = DetectorAddress::CanPort {
                network: self.network,
                module: frame.module,
                port: frame.port,
            };
            Some(state.to_info(address))
        } else {
            None
        }
    }

    pub fn remove(&mut self, module: u8, port: u8) {
        self.modules.remove(&(module, port));
    }
}

/// A single-frame R-Bus or LocoNet feedback event, emitted directly without
/// any merge/completeness bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleFeedback {
    pub address: DetectorAddress,
    pub occupied: bool,
}

pub fn rbus_feedback(group: u16, module: u8, port: u8, occupied: bool) -> SimpleFeedback {
    SimpleFeedback {
        address: DetectorAddress::RBusPort {
            group,
            module,
            port,
        },
        occupied,
    }
}

pub fn loconet_feedback(sic: u16, module: u8, occupied: bool) -> SimpleFeedback {
    SimpleFeedback {
        address: DetectorAddress::LoconetModule { sic, module },
        occupied,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_scenario_occupancy_then_vehicle_set1_completes() {
        let mut net = NetworkState::new(0x310B);

        let first = net.feed(CanFrame {
            network: 0x310B,
            module: 1,
            port: 2,
            kind: CanFrameKind::Occupancy,
            v1: 0x1100,
            v2: 0,
        });
        assert!(first.is_none());

        let second = net.feed(CanFrame {
            network: 0x310B,
            module: 1,
            port: 2,
            kind: CanFrameKind::VehicleSet(1),
            v1: 0x8042,
            v2: 0,
        });
        let info = second.expect("detector should complete on this frame");
        assert!(info.occupied);
        assert_eq!(info.vehicles, vec![0x42]);
        assert_eq!(info.directions, vec![Direction::Forward]);
    }

    #[test]
    fn test_completion_is_emitted_exactly_once() {
        let mut net = NetworkState::new(1);
        net.feed(CanFrame {
            network: 1,
            module: 1,
            port: 1,
            kind: CanFrameKind::Occupancy,
            v1: 0x0000,
            v2: 0,
        });
        let info = net
            .feed(CanFrame {
                network: 1,
                module: 1,
                port: 1,
                kind: CanFrameKind::VehicleSet(1),
                v1: 0,
                v2: 0,
            })
            .expect("unoccupied with no vehicles is complete");
        assert!(!info.occupied);
        assert!(info.vehicles.is_empty());

        let repeat = net.feed(CanFrame {
            network: 1,
            module: 1,
            port: 1,
            kind: CanFrameKind::Occupancy,
            v1: 0x0000,
            v2: 0,
        });
        assert!(repeat.is_none(), "resending the same occupancy state must not re-emit");
    }

    #[test]
    fn test_new_vehicle_set1_resets_previous_sets() {
        let mut net = NetworkState::new(1);
        net.feed(CanFrame {
            network: 1,
            module: 2,
            port: 3,
            kind: CanFrameKind::Occupancy,
            v1: 0x0100,
            v2: 0,
        });
        net.feed(CanFrame {
            network: 1,
            module: 2,
            port: 3,
            kind: CanFrameKind::VehicleSet(1),
            v1: 0x8001,
            v2: 0x8002,
        });
        let info = net
            .feed(CanFrame {
                network: 1,
                module: 2,
                port: 3,
                kind: CanFrameKind::VehicleSet(1),
                v1: 0x8003,
                v2: 0,
            })
            .expect("second VehicleSet1 replaces the first and completes");
        assert_eq!(info.vehicles, vec![0x03]);
    }
}

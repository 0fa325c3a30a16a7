//! Z21 UDP protocol: datagram framing, XBus messages, the client state
//! machine, and CAN/R-Bus/LocoNet feedback-detector aggregation (§4.5, §4.6).

pub mod client;
pub mod config;
pub mod detector;
pub mod framing;
pub mod message;

pub use client::{ConnectionState, EngineError, Event, TrackPower, Z21Client};
pub use config::{ConfigError, Z21Config};
pub use detector::DetectorInfo;

//! Protocol-engine core for model-railroad DCC command stations: a packet
//! codec, CV addressing, and serial (ESU LokProgrammer, "LP2") and UDP (Roco
//! Z21) link engines built on top of it.
//!
//! This crate owns the wire protocols only — framing, checksums, connection
//! state machines, and CV/detector bookkeeping. It does not provide a UI,
//! persisted layout model, or file formats; see the `lp2-tool` and
//! `z21-tool` binaries for minimal CLI drivers.

pub mod address;
pub mod cv;
pub mod dcc;
pub mod lp2;
pub mod z21;

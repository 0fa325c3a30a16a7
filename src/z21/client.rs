//! Z21 UDP client: connection lifecycle, track-power state machine, CV
//! programming in direct and POM modes, and CAN/R-Bus/LocoNet feedback
//! aggregation (§4.5, §4.6).
//!
//! Per the single-threaded cooperative model (§5) there is no background
//! receive task: every public operation that expects a reply drives its own
//! receive loop via [`Z21Client::recv_matching`], feeding every decoded frame
//! through the permanent broadcast handler before (and regardless of)
//! whatever that operation itself is waiting to match.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::time::Instant;

use crate::address::DetectorAddress;
use crate::z21::config::Z21Config;
use crate::z21::detector::{CanFrame, CanFrameKind, DetectorInfo, NetworkState};
use crate::z21::framing::{self, Frame, Z21Framer};
use crate::z21::message::{self, ConfigResponse, TrackPowerBroadcast};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for a response")]
    Timeout,
    #[error("not connected")]
    NotConnected,
    #[error("CV index {0} out of range (1..=1024)")]
    CvOutOfRange(u16),
    #[error("short circuit during programming")]
    ShortCircuit,
    #[error("device rejected the written value")]
    ValueRejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackPower {
    PowerOn,
    PowerOff,
    ProgrammingMode,
    ShortCircuit,
    EmergencyStop,
}

/// A high-level event surfaced by the permanent broadcast observer. There is
/// no callback chain here (§9 allows "closures or typed message enums
/// dispatched on the event loop"); callers drain the queue with
/// [`Z21Client::drain_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    TrackPower(TrackPower),
    Detector(DetectorInfo),
}

pub struct Z21Client {
    socket: Option<UdpSocket>,
    remote: Option<SocketAddr>,
    config: Z21Config,
    framer: Z21Framer,
    state: ConnectionState,
    track_power: TrackPower,
    detectors: HashMap<u16, NetworkState>,
    events: Vec<Event>,
    serial_number: Option<u32>,
    hardware_info: Option<(u32, u32)>,
    lock_state: Option<bool>,
}

impl Z21Client {
    pub fn new(config: Z21Config) -> Self {
        Self {
            socket: None,
            remote: None,
            config,
            framer: Z21Framer::new(),
            state: ConnectionState::Disconnected,
            track_power: TrackPower::PowerOff,
            detectors: HashMap::new(),
            events: Vec::new(),
            serial_number: None,
            hardware_info: None,
            lock_state: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn track_power(&self) -> TrackPower {
        self.track_power
    }

    pub fn drain_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// Binds a local UDP socket and confirms the station is reachable with a
    /// status query, guarded by the connect-timeout (§4.5). The socket is
    /// not Rust-level `connect`ed: the wrong-host/port check happens
    /// explicitly on every received datagram so it can be logged rather than
    /// silently ignored by the OS.
    pub async fn connect(&mut self, addr: impl ToSocketAddrs) -> Result<(), EngineError> {
        self.state = ConnectionState::Connecting;
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        let remote = tokio::net::lookup_host(addr)
            .await?
            .next()
            .ok_or(EngineError::NotConnected)?;
        self.socket = Some(socket);
        self.remote = Some(remote);

        self.send_frame(&message::status_request_frame()).await?;
        let connect_timeout = self.config.connect_timeout;
        let result = self
            .recv_matching(connect_timeout, |_frame| Some(()))
            .await;
        match result {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                self.socket = None;
                self.remote = None;
                self.state = ConnectionState::Error;
                Err(e)
            }
        }
    }

    /// Clears the send buffer, all cached state, and the pending detector
    /// tables (§5 cancellation semantics).
    pub fn disconnect(&mut self) {
        self.socket = None;
        self.remote = None;
        self.detectors.clear();
        self.events.clear();
        self.serial_number = None;
        self.hardware_info = None;
        self.lock_state = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Writes one or more pre-encoded frames as a single coalesced
    /// datagram, up to [`framing::MAX_DATAGRAM_LEN`] bytes.
    async fn send_frame(&self, frame: &[u8]) -> Result<(), EngineError> {
        let socket = self.socket.as_ref().ok_or(EngineError::NotConnected)?;
        let remote = self.remote.ok_or(EngineError::NotConnected)?;
        debug!("Z21 send {} bytes to {remote}", frame.len());
        socket.send_to(frame, remote).await?;
        Ok(())
    }

    /// Drives the receive loop until `matcher` returns `Some`, or `timeout`
    /// elapses. Every decoded frame is first handed to the permanent
    /// broadcast observer (which never consumes) before the matcher is
    /// tried, matching the FIFO observer-chain ordering of §5.
    async fn recv_matching<T>(
        &mut self,
        timeout: Duration,
        mut matcher: impl FnMut(&Frame) -> Option<T>,
    ) -> Result<T, EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(EngineError::Timeout);
            }
            let socket = self.socket.as_ref().ok_or(EngineError::NotConnected)?;
            let mut buf = [0u8; framing::MAX_DATAGRAM_LEN];
            let (n, from) = match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await
            {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return Err(EngineError::Io(e)),
                Err(_) => return Err(EngineError::Timeout),
            };
            if Some(from) != self.remote {
                warn!("dropping Z21 datagram from unexpected host {from}");
                continue;
            }
            for frame in self.framer.feed(&buf[..n]) {
                self.handle_broadcast(&frame);
                if let Some(result) = matcher(&frame) {
                    return Ok(result);
                }
            }
        }
    }

    /// Like [`Z21Client::recv_matching`], but additionally re-sends `frame`
    /// whenever it has gone [`Z21Config::retransmit_after`] without a match,
    /// mirroring the pending-request retransmission sweep of §4.5/§5 (the
    /// reference sweeps a list of pending entries on a 1-second timer; with
    /// exactly one pending entry per in-flight call here, that collapses to
    /// resending the instant the entry crosses the staleness threshold,
    /// rather than waiting for the next sweep tick — finer-grained, but the
    /// same "older than 2s gets re-enqueued, timestamp refreshed" contract).
    async fn recv_matching_with_retransmit<T>(
        &mut self,
        frame: &[u8],
        timeout: Duration,
        mut matcher: impl FnMut(&Frame) -> Option<T>,
    ) -> Result<T, EngineError> {
        self.send_frame(frame).await?;
        let deadline = Instant::now() + timeout;
        let mut last_sent = Instant::now();
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::Timeout);
            }
            let retransmit_at = last_sent + self.config.retransmit_after;
            let wake = retransmit_at.min(deadline);
            let wait = wake.saturating_duration_since(now);

            let socket = self.socket.as_ref().ok_or(EngineError::NotConnected)?;
            let mut buf = [0u8; framing::MAX_DATAGRAM_LEN];
            match tokio::time::timeout(wait, socket.recv_from(&mut buf)).await {
                Ok(Ok((n, from))) => {
                    if Some(from) != self.remote {
                        warn!("dropping Z21 datagram from unexpected host {from}");
                        continue;
                    }
                    for decoded in self.framer.feed(&buf[..n]) {
                        self.handle_broadcast(&decoded);
                        if let Some(result) = matcher(&decoded) {
                            return Ok(result);
                        }
                    }
                }
                Ok(Err(e)) => return Err(EngineError::Io(e)),
                Err(_) => {
                    if Instant::now() >= deadline {
                        return Err(EngineError::Timeout);
                    }
                    debug!("Z21 request stale after {:?}, retransmitting", self.config.retransmit_after);
                    self.send_frame(frame).await?;
                    last_sent = Instant::now();
                }
            }
        }
    }

    /// The permanent broadcast observer (§4.5, §9): updates client
    /// attributes and queues high-level events. Never consumes a frame.
    fn handle_broadcast(&mut self, frame: &Frame) {
        if message::is_lan_x(frame) {
            if let Some(broadcast) = message::parse_track_power_broadcast(&frame.payload) {
                self.track_power = match broadcast {
                    TrackPowerBroadcast::PowerOff => TrackPower::PowerOff,
                    TrackPowerBroadcast::PowerOn => TrackPower::PowerOn,
                    TrackPowerBroadcast::ProgrammingMode => TrackPower::ProgrammingMode,
                    TrackPowerBroadcast::ShortCircuit => TrackPower::ShortCircuit,
                };
                self.events.push(Event::TrackPower(self.track_power));
            }
            return;
        }
        if frame.lan_id == message::lan_id::CAN_DETECTOR {
            if let Some(can_frame) = decode_can_detector_frame(&frame.payload) {
                let state = self
                    .detectors
                    .entry(can_frame.network)
                    .or_insert_with(|| NetworkState::new(can_frame.network));
                if let Some(info) = state.feed(can_frame) {
                    self.events.push(Event::Detector(info));
                }
            }
        }
    }

    pub async fn enable_track_power(&mut self) -> Result<(), EngineError> {
        self.send_frame(&message::set_track_power_on_frame()).await?;
        self.track_power = TrackPower::PowerOn;
        Ok(())
    }

    pub async fn disable_track_power(&mut self) -> Result<(), EngineError> {
        self.send_frame(&message::set_track_power_off_frame()).await?;
        self.track_power = TrackPower::PowerOff;
        Ok(())
    }

    pub async fn request_emergency_stop(&mut self) -> Result<(), EngineError> {
        self.send_frame(&message::emergency_stop_frame()).await?;
        self.track_power = TrackPower::EmergencyStop;
        Ok(())
    }

    fn check_cv_range(cv: u16) -> Result<(), EngineError> {
        if cv == 0 || cv > 1024 {
            return Err(EngineError::CvOutOfRange(cv));
        }
        Ok(())
    }

    /// Direct-mode CV read (`vehicle_address = 0`, §4.5): guarded by the
    /// 5-second programming timeout, and track power is re-enabled on every
    /// outcome including timeout.
    pub async fn read_cv(&mut self, cv: u16) -> Result<u8, EngineError> {
        Self::check_cv_range(cv)?;
        let frame = framing::encode_frame(message::lan_id::LAN_X, &message::read_cv_request(cv));

        let target = cv.saturating_sub(1);
        let timeout = self.config.programming_timeout;
        let result = self
            .recv_matching_with_retransmit(&frame, timeout, |frame| {
                if !message::is_lan_x(frame) {
                    return None;
                }
                match message::parse_config_response(&frame.payload) {
                    Some(ConfigResponse::Result { cv: got, value }) if got == target => {
                        Some(Ok(value))
                    }
                    Some(ConfigResponse::ShortCircuit) => Some(Err(EngineError::ShortCircuit)),
                    Some(ConfigResponse::ValueRejected) => Some(Err(EngineError::ValueRejected)),
                    _ => None,
                }
            })
            .await;

        let _ = self.enable_track_power().await;
        match result {
            Ok(inner) => inner,
            Err(e) => Err(e),
        }
    }

    /// POM-mode CV read (`vehicle_address != 0`): no power toggling.
    pub async fn read_cv_pom(&mut self, vehicle_address: u16, cv: u16) -> Result<u8, EngineError> {
        Self::check_cv_range(cv)?;
        let frame = framing::encode_frame(
            message::lan_id::LAN_X,
            &message::read_cv_pom_request(vehicle_address, cv),
        );
        let target = cv.saturating_sub(1);
        let timeout = self.config.programming_timeout;
        self.recv_matching_with_retransmit(&frame, timeout, |frame| {
            if !message::is_lan_x(frame) {
                return None;
            }
            match message::parse_config_response(&frame.payload) {
                Some(ConfigResponse::Result { cv: got, value }) if got == target => Some(value),
                _ => None,
            }
        })
        .await
    }

    /// Direct-mode CV write: send-and-verify. The device gives no direct
    /// acknowledgement, so 100ms later a read confirms the written value
    /// (§4.5).
    pub async fn write_cv(&mut self, cv: u16, value: u8) -> Result<(), EngineError> {
        Self::check_cv_range(cv)?;
        let frame = framing::encode_frame(message::lan_id::LAN_X, &message::write_cv_request(cv, value));
        self.send_frame(&frame).await?;
        tokio::time::sleep(self.config.pom_write_verify_delay).await;
        let read_back = self.read_cv(cv).await?;
        if read_back == value {
            Ok(())
        } else {
            Err(EngineError::ValueRejected)
        }
    }

    /// POM-mode CV write: fire-and-verify the same way, but through the
    /// vehicle-addressed POM request and without power toggling.
    pub async fn write_cv_pom(
        &mut self,
        vehicle_address: u16,
        cv: u16,
        value: u8,
    ) -> Result<(), EngineError> {
        Self::check_cv_range(cv)?;
        let frame = framing::encode_frame(
            message::lan_id::LAN_X,
            &message::write_cv_pom_request(vehicle_address, cv, value),
        );
        self.send_frame(&frame).await?;
        tokio::time::sleep(self.config.pom_write_verify_delay).await;
        let read_back = self.read_cv_pom(vehicle_address, cv).await?;
        if read_back == value {
            Ok(())
        } else {
            Err(EngineError::ValueRejected)
        }
    }

    /// Sequential read of several CVs, direct mode, in order.
    pub async fn read_variables(&mut self, cvs: &[u16]) -> Vec<Result<u8, EngineError>> {
        let mut out = Vec::with_capacity(cvs.len());
        for &cv in cvs {
            out.push(self.read_cv(cv).await);
        }
        out
    }

    pub async fn serial_number(&mut self) -> Result<u32, EngineError> {
        if let Some(serial) = self.serial_number {
            return Ok(serial);
        }
        self.send_frame(&message::get_serial_number_frame()).await?;
        let timeout = self.config.connect_timeout;
        let serial = self
            .recv_matching(timeout, |frame| {
                if frame.lan_id == message::lan_id::GET_SERIAL_NUMBER {
                    message::parse_serial_number(&frame.payload)
                } else {
                    None
                }
            })
            .await?;
        self.serial_number = Some(serial);
        Ok(serial)
    }

    pub async fn hardware_info(&mut self) -> Result<(u32, u32), EngineError> {
        if let Some(info) = self.hardware_info {
            return Ok(info);
        }
        self.send_frame(&message::get_hwinfo_frame()).await?;
        let timeout = self.config.connect_timeout;
        let info = self
            .recv_matching(timeout, |frame| {
                if frame.lan_id == message::lan_id::GET_HWINFO {
                    message::parse_hwinfo(&frame.payload)
                } else {
                    None
                }
            })
            .await?;
        self.hardware_info = Some(info);
        Ok(info)
    }

    /// Whether the station reports itself locked (e.g. held exclusively by
    /// another controlling app). Queried on demand and cached, same shape as
    /// [`Z21Client::serial_number`] and [`Z21Client::hardware_info`] (§4.5).
    pub async fn lock_state(&mut self) -> Result<bool, EngineError> {
        if let Some(locked) = self.lock_state {
            return Ok(locked);
        }
        self.send_frame(&message::get_lock_state_frame()).await?;
        let timeout = self.config.connect_timeout;
        let locked = self
            .recv_matching(timeout, |frame| {
                if frame.lan_id == message::lan_id::GET_LOCKSTATE {
                    message::parse_lock_state(&frame.payload)
                } else {
                    None
                }
            })
            .await?;
        self.lock_state = Some(locked);
        Ok(locked)
    }
}

/// Decodes a `LAN_CAN_DETECTOR` payload into a [`CanFrame`]. The wire layout
/// here (`network_le16, module, port, kind, v1_le16, v2_le16`) is not
/// specified; it's this crate's own compact encoding, documented in
/// DESIGN.md.
fn decode_can_detector_frame(payload: &[u8]) -> Option<CanFrame> {
    if payload.len() < 9 {
        return None;
    }
    let network = u16::from_le_bytes([payload[0], payload[1]]);
    let module = payload[2];
    let port = payload[3];
    let kind = match payload[4] {
        0 => CanFrameKind::Occupancy,
        n @ 1..=15 => CanFrameKind::VehicleSet(n),
        _ => return None,
    };
    let v1 = u16::from_le_bytes([payload[5], payload[6]]);
    let v2 = u16::from_le_bytes([payload[7], payload[8]]);
    Some(CanFrame {
        network,
        module,
        port,
        kind,
        v1,
        v2,
    })
}

pub fn encode_can_detector_frame(frame: &CanFrame) -> Vec<u8> {
    let kind_byte = match frame.kind {
        CanFrameKind::Occupancy => 0,
        CanFrameKind::VehicleSet(n) => n,
    };
    let mut payload = Vec::with_capacity(9);
    payload.extend_from_slice(&frame.network.to_le_bytes());
    payload.push(frame.module);
    payload.push(frame.port);
    payload.push(kind_byte);
    payload.extend_from_slice(&frame.v1.to_le_bytes());
    payload.extend_from_slice(&frame.v2.to_le_bytes());
    framing::encode_frame(message::lan_id::CAN_DETECTOR, &payload)
}

/// Builds a [`DetectorAddress::CanPort`] for a detector reported under a
/// given network/module/port.
pub fn can_port_address(network: u16, module: u8, port: u8) -> DetectorAddress {
    DetectorAddress::CanPort {
        network,
        module,
        port,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_check_cv_range_rejects_zero_and_overflow() {
        assert!(Z21Client::check_cv_range(0).is_err());
        assert!(Z21Client::check_cv_range(1025).is_err());
        assert!(Z21Client::check_cv_range(1).is_ok());
        assert!(Z21Client::check_cv_range(1024).is_ok());
    }

    #[test]
    fn test_can_detector_frame_roundtrip() {
        let frame = CanFrame {
            network: 0x310B,
            module: 1,
            port: 2,
            kind: CanFrameKind::VehicleSet(1),
            v1: 0x8042,
            v2: 0,
        };
        let encoded = encode_can_detector_frame(&frame);
        let z21_frame = framing::Z21Framer::new().feed(&encoded).remove(0);
        let decoded = decode_can_detector_frame(&z21_frame.payload).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_initial_state_is_disconnected() {
        let client = Z21Client::new(Z21Config::default());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.track_power(), TrackPower::PowerOff);
    }

    #[test]
    fn test_handle_broadcast_updates_track_power_and_queues_event() {
        let mut client = Z21Client::new(Z21Config::default());
        let frame = Frame {
            lan_id: message::lan_id::LAN_X,
            payload: vec![0x61, 0x01],
        };
        client.handle_broadcast(&frame);
        assert_eq!(client.track_power(), TrackPower::PowerOn);
        let events = client.drain_events();
        assert_eq!(events, vec![Event::TrackPower(TrackPower::PowerOn)]);
    }

    #[test]
    fn test_handle_broadcast_detector_completion_emits_event() {
        let mut client = Z21Client::new(Z21Config::default());
        let occupancy = Frame {
            lan_id: message::lan_id::CAN_DETECTOR,
            payload: {
                let f = CanFrame {
                    network: 1,
                    module: 1,
                    port: 1,
                    kind: CanFrameKind::Occupancy,
                    v1: 0x0100,
                    v2: 0,
                };
                let mut p = f.network.to_le_bytes().to_vec();
                p.push(f.module);
                p.push(f.port);
                p.push(0);
                p.extend_from_slice(&f.v1.to_le_bytes());
                p.extend_from_slice(&f.v2.to_le_bytes());
                p
            },
        };
        client.handle_broadcast(&occupancy);
        assert!(client.drain_events().is_empty());

        let vehicle_set = Frame {
            lan_id: message::lan_id::CAN_DETECTOR,
            payload: {
                let mut p = 1u16.to_le_bytes().to_vec();
                p.push(1);
                p.push(1);
                p.push(1);
                p.extend_from_slice(&0x8042u16.to_le_bytes());
                p.extend_from_slice(&0u16.to_le_bytes());
                p
            },
        };
        client.handle_broadcast(&vehicle_set);
        let events = client.drain_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Detector(info) => {
                assert!(info.occupied);
                assert_eq!(info.vehicles, vec![0x42]);
            }
            other => panic!("expected a detector event, got {other:?}"),
        }
    }

    /// Drops the first request on the wire, then answers the retransmit: the
    /// `read_cv` call should still complete successfully once
    /// `retransmit_after` has elapsed, exercising §4.5's retransmission
    /// sweep (here collapsed to the single in-flight request this per-call
    /// model carries, per the doc comment on `recv_matching_with_retransmit`).
    #[tokio::test(start_paused = true)]
    async fn test_read_cv_succeeds_after_retransmit() {
        let device = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let device_addr = device.local_addr().unwrap();

        let mut config = Z21Config::default();
        config.retransmit_after = Duration::from_millis(50);
        config.programming_timeout = Duration::from_secs(5);
        let mut client = Z21Client::new(config);
        client.socket = Some(UdpSocket::bind(("127.0.0.1", 0)).await.unwrap());
        client.remote = Some(device_addr);
        client.state = ConnectionState::Connected;

        let device_task = tokio::spawn(async move {
            let mut buf = [0u8; 1472];
            let (_n, from) = device.recv_from(&mut buf).await.unwrap();
            // drop the first request; wait for the retransmit.
            let (_n2, from2) = device.recv_from(&mut buf).await.unwrap();
            assert_eq!(from, from2);
            let response = framing::encode_frame(
                message::lan_id::LAN_X,
                &framing::xbus_with_checksum(vec![message::xbus_op::CV_RESULT, 0x14, 0x00, 0x00, 0x07]),
            );
            device.send_to(&response, from2).await.unwrap();
        });

        let value = client.read_cv(1).await.unwrap();
        assert_eq!(value, 7);
        device_task.await.unwrap();
    }
}

//! Z21 UDP datagram framing (§4.5): length-prefixed little-endian frames,
//! one or more per datagram, plus the XBus checksum carried inside
//! `LAN_X` payloads.

use bytes::{Buf, BytesMut};
use log::warn;

pub const LAN_X: u16 = 0x0040;
pub const MAX_DATAGRAM_LEN: usize = 1472;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub lan_id: u16,
    pub payload: Vec<u8>,
}

/// Encodes a single frame: `len_le16, lan_id_le16, payload`.
pub fn encode_frame(lan_id: u16, payload: &[u8]) -> Vec<u8> {
    let length = (4 + payload.len()) as u16;
    let mut out = Vec::with_capacity(length as usize);
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&lan_id.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Incremental datagram-buffer reader. Feed it the bytes of each received
/// UDP datagram; it yields every complete frame the buffer now contains,
/// leaving any trailing partial frame buffered for the next call.
#[derive(Debug, Default)]
pub struct Z21Framer {
    buf: BytesMut,
}

impl Z21Framer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            if self.buf.len() < 2 {
                break;
            }
            let length = u16::from_le_bytes([self.buf[0], self.buf[1]]) as usize;
            if length < 4 {
                warn!("discarding Z21 datagram: frame length {length} is invalid (< 4)");
                self.buf.clear();
                break;
            }
            if self.buf.len() < length {
                // prefix shorter than its declared length: wait for more
                break;
            }
            let mut frame_bytes = self.buf.split_to(length);
            let lan_id = u16::from_le_bytes([frame_bytes[2], frame_bytes[3]]);
            frame_bytes.advance(4);
            frames.push(Frame {
                lan_id,
                payload: frame_bytes.to_vec(),
            });
        }
        frames
    }
}

/// XBus checksum: XOR of every byte in `payload` except the trailing
/// checksum byte itself (the checksum covers offset 4..len-2 of the full
/// Z21 frame, i.e. the whole XBus payload minus its own last byte).
pub fn xbus_checksum(payload_without_checksum: &[u8]) -> u8 {
    payload_without_checksum.iter().fold(0u8, |acc, b| acc ^ b)
}

pub fn xbus_with_checksum(mut data: Vec<u8>) -> Vec<u8> {
    let checksum = xbus_checksum(&data);
    data.push(checksum);
    data
}

pub fn xbus_checksum_valid(payload: &[u8]) -> bool {
    match payload.split_last() {
        Some((checksum, rest)) => xbus_checksum(rest) == *checksum,
        None => false,
    }
}

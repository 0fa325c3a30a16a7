//! LP2 byte-stream framing (§4.3): start/stop/escape framing over the
//! half-duplex serial link to the LokProgrammer.

use thiserror::Error;

pub const START_MARKER: u8 = 0x7F;
pub const END_MARKER: u8 = 0x81;
pub const ESCAPE_CHAR: u8 = 0x80;

fn needs_escape(b: u8) -> bool {
    matches!(b, START_MARKER | ESCAPE_CHAR | END_MARKER)
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("escape char at end of stream with no following byte")]
    DanglingEscape,
}

/// Frames a payload for the wire: `7F 7F <escaped payload> 81`.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(START_MARKER);
    out.push(START_MARKER);
    for &b in payload {
        if needs_escape(b) {
            out.push(ESCAPE_CHAR);
            // the mask is 0x00 in this protocol: escaping only interposes
            // the escape char, it never transforms the byte itself.
            out.push(b ^ 0x00);
        } else {
            out.push(b);
        }
    }
    out.push(END_MARKER);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Start1,
    Body,
    Escaped,
}

/// Incremental reader: feed it bytes as they arrive off the serial port and
/// it yields complete, decoded frame payloads.
#[derive(Debug, Default)]
pub struct Lp2Framer {
    state: StateHolder,
    current: Vec<u8>,
}

#[derive(Debug)]
struct StateHolder(State);

impl Default for StateHolder {
    fn default() -> Self {
        StateHolder(State::Idle)
    }
}

impl Lp2Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of raw bytes, returning any frames completed along the
    /// way (in the order their terminators were seen).
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &b in bytes {
            match self.state.0 {
                State::Idle => {
                    if b == START_MARKER {
                        self.state.0 = State::Start1;
                    }
                    // any other byte outside a frame is simply ignored
                }
                State::Start1 => {
                    if b == START_MARKER {
                        self.state.0 = State::Body;
                        self.current.clear();
                    } else {
                        // unexpected byte inside Start1: restart from Idle
                        self.state.0 = State::Idle;
                    }
                }
                State::Body => match b {
                    END_MARKER => {
                        frames.push(std::mem::take(&mut self.current));
                        self.state.0 = State::Idle;
                    }
                    ESCAPE_CHAR => {
                        self.state.0 = State::Escaped;
                    }
                    _ => {
                        self.current.push(b);
                    }
                },
                State::Escaped => {
                    self.current.push(b ^ 0x00);
                    self.state.0 = State::Body;
                }
            }
        }
        frames
    }
}

/// Decodes a single, already-delimited frame (including its `7F 7F ... 81`
/// markers) in one shot. Useful for tests and for one-off decoding; streaming
/// callers should use [`Lp2Framer`] instead.
pub fn decode_one(framed: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut framer = Lp2Framer::new();
    let mut frames = framer.feed(framed);
    if frames.is_empty() {
        return Err(FrameError::DanglingEscape);
    }
    Ok(frames.remove(0))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_roundtrip_with_escapes() {
        let payload = vec![0x01, 0x02, 0x03, 0x7F, 0x80, 0x81];
        let encoded = encode(&payload);
        assert_eq!(
            encoded,
            vec![
                0x7F, 0x7F, 0x01, 0x02, 0x03, 0x80, 0x7F, 0x80, 0x80, 0x80, 0x81, 0x81
            ]
        );
        assert_eq!(decode_one(&encoded).unwrap(), payload);
    }

    #[test]
    fn test_roundtrip_no_escapes() {
        let payload = vec![0x01, 0x02, 0x03];
        let encoded = encode(&payload);
        assert_eq!(decode_one(&encoded).unwrap(), payload);
    }

    #[test]
    fn test_concatenated_frames_decode_in_order() {
        let p1 = vec![1, 2, 3];
        let p2 = vec![4, 5, 6];
        let mut stream = encode(&p1);
        stream.extend(encode(&p2));

        let mut framer = Lp2Framer::new();
        let frames = framer.feed(&stream);
        assert_eq!(frames, vec![p1, p2]);
    }

    #[test]
    fn test_fed_byte_at_a_time() {
        let payload = vec![9, 8, 7];
        let stream = encode(&payload);
        let mut framer = Lp2Framer::new();
        let mut got = Vec::new();
        for b in stream {
            got.extend(framer.feed(&[b]));
        }
        assert_eq!(got, vec![payload]);
    }

    #[test]
    fn test_garbage_before_start_is_ignored() {
        let payload = vec![1, 2, 3];
        let mut stream = vec![0x00, 0x01, 0x7F]; // lone 0x7F, should restart
        stream.extend(encode(&payload));
        let mut framer = Lp2Framer::new();
        let frames = framer.feed(&stream);
        assert_eq!(frames, vec![payload]);
    }

    #[test]
    fn test_unexpected_byte_in_start1_restarts_idle() {
        // 7F followed by something other than 7F should discard and restart
        let mut stream = vec![0x7F, 0x00];
        let payload = vec![1];
        stream.extend(encode(&payload));
        let mut framer = Lp2Framer::new();
        let frames = framer.feed(&stream);
        assert_eq!(frames, vec![payload]);
    }
}

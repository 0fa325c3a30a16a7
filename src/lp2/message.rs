//! LP2 message header (§3): `(type, sequence, identifier, payload)`.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("frame too short for an LP2 header ({0} bytes, need at least 3)")]
    TooShort(usize),
    #[error("unknown message type byte {0:#04x}")]
    UnknownType(u8),
    #[error("response payload is empty, missing status byte")]
    MissingStatus(),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request = 0x01,
    Response = 0x02,
}

impl MessageType {
    fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            0x01 => Ok(MessageType::Request),
            0x02 => Ok(MessageType::Response),
            other => Err(MessageError::UnknownType(other)),
        }
    }
}

/// Status byte leading a Response payload. The concrete status codes are
/// engine-specific (see `lp2::engine::Status`); this just carries the raw
/// value through the framing layer.
pub type StatusByte = u8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub sequence: u8,
    pub identifier: u8,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn request(sequence: u8, identifier: u8, payload: Vec<u8>) -> Self {
        Self {
            message_type: MessageType::Request,
            sequence,
            identifier,
            payload,
        }
    }

    pub fn response(sequence: u8, identifier: u8, status: StatusByte, payload: Vec<u8>) -> Self {
        let mut full_payload = Vec::with_capacity(payload.len() + 1);
        full_payload.push(status);
        full_payload.extend(payload);
        Self {
            message_type: MessageType::Response,
            sequence,
            identifier,
            payload: full_payload,
        }
    }

    /// Only meaningful for `MessageType::Response`: the leading status byte.
    pub fn status(&self) -> Result<StatusByte, MessageError> {
        self.payload.first().copied().ok_or(MessageError::MissingStatus())
    }

    /// The payload with the leading status byte stripped, for a Response.
    pub fn response_body(&self) -> &[u8] {
        if self.payload.is_empty() {
            &[]
        } else {
            &self.payload[1..]
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(3 + self.payload.len());
        bytes.push(self.message_type as u8);
        bytes.push(self.sequence);
        bytes.push(self.identifier);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() < 3 {
            return Err(MessageError::TooShort(bytes.len()));
        }
        let message_type = MessageType::from_byte(bytes[0])?;
        Ok(Self {
            message_type,
            sequence: bytes[1],
            identifier: bytes[2],
            payload: bytes[3..].to_vec(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let msg = Message::request(7, 0x10, vec![1, 2, 3]);
        let bytes = msg.to_bytes();
        assert_eq!(bytes, vec![0x01, 7, 0x10, 1, 2, 3]);
        assert_eq!(Message::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_response_has_status_byte() {
        let msg = Message::response(7, 0x10, 0x00, vec![42]);
        assert_eq!(msg.status().unwrap(), 0x00);
        assert_eq!(msg.response_body(), &[42]);
    }

    #[test]
    fn test_too_short() {
        assert_eq!(Message::from_bytes(&[0x01, 0x02]), Err(MessageError::TooShort(2)));
    }

    #[test]
    fn test_unknown_type() {
        assert_eq!(
            Message::from_bytes(&[0x03, 0x00, 0x00]),
            Err(MessageError::UnknownType(0x03))
        );
    }
}

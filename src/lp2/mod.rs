//! ESU LokProgrammer (LP2) serial protocol: framing, message header, and the
//! connection/CV-programming engine (§4.3, §4.4).

pub mod config;
pub mod engine;
pub mod framing;
pub mod message;

pub use config::{ConfigError, Lp2Config, PowerOffPolicy};
pub use engine::{Acknowledge, ConnectionState, EngineError, Lp2Engine, Mode, Response, ResponseStatus};
pub use message::{Message, MessageType};

//! Core types: identifiers, messages, endpoint attributes, constants and
//! errors. Always compiled; free of I/O.

pub mod constants;
mod endpoint;
mod error;
mod guid;
mod message;

pub use endpoint::EndpointAttributes;
pub use error::{
    BusError, BusResult, ConfigError, MessageDirection, TransportError, ValidationError,
};
pub use guid::{ConnectionId, Guid, PacketId};
pub use message::Message;

//! Error types for the message bus.
//!
//! Errors are cloneable: a single terminal error is attached to every queued,
//! encoded and unacknowledged send of a connection, so I/O errors are held
//! behind an [`Arc`].

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::endpoint::EndpointAttributes;
use super::guid::PacketId;
use crate::packet::{DecodeError, EncodeError};

/// Direction of traffic, used when networking is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageDirection {
    /// Bytes read from a socket.
    Incoming,
    /// Bytes written to a socket.
    Outgoing,
}

impl fmt::Display for MessageDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageDirection::Incoming => f.write_str("incoming"),
            MessageDirection::Outgoing => f.write_str("outgoing"),
        }
    }
}

/// Errors fatal to a connection.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The peer closed the socket.
    #[error("socket was closed")]
    SocketClosed,

    /// Reading from the socket failed.
    #[error("socket read error: {0}")]
    Read(Arc<io::Error>),

    /// Writing to the socket failed.
    #[error("socket write error: {0}")]
    Write(Arc<io::Error>),

    /// No read progress while a read was outstanding.
    #[error("socket read stalled for {timeout:?}")]
    ReadStalled {
        /// Configured read stall timeout.
        timeout: Duration,
    },

    /// No write progress while writes were pending.
    #[error("socket write stalled for {timeout:?}")]
    WriteStalled {
        /// Configured write stall timeout.
        timeout: Duration,
    },

    /// Malformed or corrupt inbound packet.
    #[error("error decoding incoming packet: {0}")]
    Decode(#[from] DecodeError),

    /// Outbound packet could not be framed.
    #[error("error encoding outcoming packet: {0}")]
    Encode(#[from] EncodeError),

    /// An Ack arrived while nothing awaited one.
    #[error("unexpected ack received for packet {packet_id}")]
    UnexpectedAck {
        /// Id carried by the stray Ack.
        packet_id: PacketId,
    },

    /// An Ack arrived for a packet other than the oldest unacknowledged one.
    #[error("ack for invalid packet id received: expected {expected}, actual {actual}")]
    AckMismatch {
        /// Oldest unacknowledged packet id.
        expected: PacketId,
        /// Id carried by the Ack.
        actual: PacketId,
    },

    /// The poller refused the connection.
    #[error("cannot register connection pollable")]
    Registration,

    /// The listening socket could not be bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// Address or path being bound.
        address: String,
        /// Underlying failure.
        source: Arc<io::Error>,
    },

    /// Address resolution failed.
    #[error("failed to resolve {address}: {message}")]
    Resolve {
        /// Address being resolved.
        address: String,
        /// Resolver message.
        message: String,
    },

    /// Establishing the connection failed.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        /// Target address or path.
        address: String,
        /// Underlying failure.
        source: Arc<io::Error>,
    },

    /// The address could not be parsed.
    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    /// Networking is disabled for the process.
    #[error("networking is disabled for {direction} messages")]
    NetworkingDisabled {
        /// Direction that was attempted.
        direction: MessageDirection,
    },

    /// The connection was terminated.
    #[error("{reason}")]
    Terminated {
        /// Human-readable reason.
        reason: String,
    },

    /// The owning server stopped.
    #[error("bus server terminated")]
    ServerStopped,

    /// The server was started twice.
    #[error("bus server is already started")]
    AlreadyStarted,

    /// Transport runtime could not be created.
    #[error("cannot start poller {name}: {source}")]
    Runtime {
        /// Poller name.
        name: String,
        /// Underlying failure.
        source: Arc<io::Error>,
    },
}

impl TransportError {
    /// Default termination error ("bus terminated").
    pub fn terminated() -> Self {
        TransportError::Terminated {
            reason: "bus terminated".to_string(),
        }
    }

    /// Termination with a custom reason.
    pub fn terminated_with(reason: impl Into<String>) -> Self {
        TransportError::Terminated {
            reason: reason.into(),
        }
    }

    /// Check if this error is a stall.
    pub fn is_stall(&self) -> bool {
        matches!(
            self,
            TransportError::ReadStalled { .. } | TransportError::WriteStalled { .. }
        )
    }

    /// Check if this error is a protocol violation by the peer.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TransportError::Decode(_)
                | TransportError::UnexpectedAck { .. }
                | TransportError::AckMismatch { .. }
        )
    }
}

/// Errors that reject a single send without affecting the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The message has too many parts.
    #[error("invalid part count: {count} (limit {limit})")]
    TooManyParts {
        /// Actual part count.
        count: usize,
        /// Configured limit.
        limit: usize,
    },

    /// A part exceeds the size limit.
    #[error("invalid size of part {index}: {size} (limit {limit})")]
    PartTooLarge {
        /// Zero-based index of the offending part.
        index: usize,
        /// Actual size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Neither a TCP endpoint nor a unix socket path was given.
    #[error("{0}")]
    MissingEndpoint(&'static str),

    /// The default network is not among the configured networks.
    #[error("default network {0:?} is not configured")]
    UnknownDefaultNetwork(String),

    /// A network address range could not be parsed.
    #[error("invalid network {network:?} range {range:?}")]
    InvalidNetwork {
        /// Network name.
        network: String,
        /// Offending range.
        range: String,
    },

    /// Some numeric option is out of range.
    #[error("invalid value for {option}: {message}")]
    InvalidValue {
        /// Option name.
        option: &'static str,
        /// Explanation.
        message: String,
    },
}

/// Top-level bus errors.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// Connection-fatal transport error.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The message was rejected before being queued.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The send was canceled before encoding started.
    #[error("send canceled")]
    Canceled,

    /// The send did not complete in time.
    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    /// An error annotated with the attributes of the endpoint it occurred on.
    #[error("{source} ({attributes})")]
    Endpoint {
        /// Endpoint the error belongs to.
        attributes: EndpointAttributes,
        /// Wrapped error.
        source: Box<BusError>,
    },
}

impl BusError {
    /// Attach endpoint attributes; an already annotated error is left alone.
    pub fn with_endpoint(self, attributes: &EndpointAttributes) -> Self {
        match self {
            BusError::Endpoint { .. } => self,
            other => BusError::Endpoint {
                attributes: attributes.clone(),
                source: Box::new(other),
            },
        }
    }

    /// The error without endpoint annotations.
    pub fn inner(&self) -> &BusError {
        match self {
            BusError::Endpoint { source, .. } => source.inner(),
            other => other,
        }
    }

    /// Endpoint attributes, if attached.
    pub fn endpoint(&self) -> Option<&EndpointAttributes> {
        match self {
            BusError::Endpoint { attributes, .. } => Some(attributes),
            _ => None,
        }
    }

    /// The transport error, if this is one.
    pub fn as_transport(&self) -> Option<&TransportError> {
        match self.inner() {
            BusError::Transport(error) => Some(error),
            _ => None,
        }
    }

    /// Check if this error is fatal to the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(self.inner(), BusError::Transport(_))
    }

    /// Check if this error rejected a single message only.
    pub fn is_validation(&self) -> bool {
        matches!(self.inner(), BusError::Validation(_))
    }
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

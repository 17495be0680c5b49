//! The bus handle and message handler seams.

use std::sync::Arc;

use super::counters::Statistics;
use super::poller::BoxFuture;
use super::send::{SendFuture, SendOptions};
use crate::core::{BusError, EndpointAttributes, Message};

/// Called once with the terminal error of a bus.
pub type TerminatedCallback = Box<dyn FnOnce(&BusError) + Send + 'static>;

/// Handle returned by [`Bus::subscribe_terminated`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

/// A point-to-point message bus.
///
/// Implemented by connections on both sides; handlers receive the bus a
/// message arrived on so they can reply over it.
pub trait Bus: Send + Sync {
    /// Human-readable endpoint description.
    fn endpoint_description(&self) -> &str;

    /// Structured endpoint attributes.
    fn endpoint_attributes(&self) -> &EndpointAttributes;

    /// Peer address (or socket path).
    fn endpoint_address(&self) -> &str;

    /// Network this bus is classified into.
    fn network_name(&self) -> &str;

    /// Traffic counters of this bus.
    fn statistics(&self) -> Statistics;

    /// Resolves once the connection is open, or with the error that ended it.
    fn ready(&self) -> BoxFuture<Result<(), BusError>>;

    /// Queue a message.
    ///
    /// Oversized messages are rejected here with a validation error; the
    /// connection is unaffected. Otherwise the returned future reports
    /// delivery according to `options`.
    fn send(&self, message: Message, options: SendOptions) -> Result<SendFuture, BusError>;

    /// Set the traffic class byte of the underlying socket.
    fn set_tos_level(&self, tos: u8);

    /// Request termination with `error`. Idempotent; the first error wins.
    fn terminate(&self, error: BusError);

    /// Register a callback for termination. Runs immediately if the bus is
    /// already terminated.
    fn subscribe_terminated(&self, callback: TerminatedCallback) -> SubscriptionId;

    /// Drop a termination callback that has not run yet.
    fn unsubscribe_terminated(&self, id: SubscriptionId);
}

/// Receives inbound messages.
///
/// Runs on a poller thread; long work should be moved elsewhere.
pub trait MessageHandler: Send + Sync {
    /// Handle one message that arrived on `reply_bus`.
    fn handle_message(&self, message: Message, reply_bus: Arc<dyn Bus>);
}

impl<F> MessageHandler for F
where
    F: Fn(Message, Arc<dyn Bus>) + Send + Sync,
{
    fn handle_message(&self, message: Message, reply_bus: Arc<dyn Bus>) {
        self(message, reply_bus)
    }
}

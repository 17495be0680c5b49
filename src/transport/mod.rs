//! Bus transport.
//!
//! Connections move framed packets (see [`crate::packet`]) over TCP or
//! unix-domain stream sockets. The moving parts:
//!
//! - **Poller**: [`TokioPoller`] drives [`Pollable`] objects from socket
//!   readiness; a [`ControlWord`] per pollable keeps at most one pass
//!   running and coalesces concurrent requests.
//! - **Connection**: [`Connection`] owns a socket, the outgoing packet
//!   queues and the decoder. Sends resolve through [`SendFuture`].
//! - **Dispatcher**: [`Dispatcher`] owns the pollers, the per-network
//!   [`Statistics`] and the stall detector.
//!
//! ```text
//!   send() ──► queued ──► encoded ──► written ──► [acked] ──► resolved
//!                  ▲                                  │
//!   socket ──► decoder ──► handler ──► reply bus ─────┘
//! ```

mod bus;
mod config;
mod connection;
mod control;
mod counters;
mod dispatcher;
mod network;
mod poller;
mod resolver;
mod send;
mod socket;

pub use bus::{Bus, MessageHandler, SubscriptionId, TerminatedCallback};
pub use config::{BusConfig, ClientConfig, DispatcherConfig, ServerConfig};
pub use connection::{Connection, ConnectionRole, ConnectionState};
pub use control::{ControlWord, PollControl, needs_retry};
pub use counters::{NetworkCounters, Statistics};
pub use dispatcher::Dispatcher;
pub use network::{InvalidNetwork, IpNetwork, NetworkClassifier, to_ipv6};
pub use poller::{BoxFuture, PollSource, PollToken, Pollable, Poller, TokioPoller};
pub use resolver::{AddressResolver, DnsResolver, parse_service_address};
pub use send::{DeliveryTracking, MemoryZone, PacketState, SendFuture, SendOptions};
pub use socket::{BusSocket, ListenerKind, ListenerSocket, SocketKind, local_bus_path};

pub(crate) use connection::{ConnectionParams, ConnectionTarget};

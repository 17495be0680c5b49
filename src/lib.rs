//! # msgbus
//!
//! Point-to-point message bus over TCP and unix-domain stream sockets.
//!
//! A bus carries ordered multi-part messages between two endpoints. Each
//! message travels as one framed packet; parts may be protected by CRC32C
//! checksums and delivery may be confirmed by the peer with an Ack packet.
//!
//! - **Ordering**: messages sent over one bus are delivered in send order
//! - **Tracking**: sends resolve when written or, optionally, when acked
//! - **Liveness**: stalled reads and writes terminate the connection
//! - **Accounting**: per-network byte, packet and error counters
//!
//! ## Feature Flags
//!
//! - `transport` (default): poller, sockets, connections, dispatcher
//! - `client` (default): [`client::BusClient`]
//! - `server` (default): [`server::BusServer`]
//!
//! ## Modules
//!
//! - [`core`]: identifiers, messages, constants and errors (always included)
//! - [`packet`]: wire framing (always included)
//! - [`transport`]: connections and the dispatcher (requires `transport`)
//! - [`client`]: bus client (requires `client`)
//! - [`server`]: bus server (requires `server`)
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use msgbus::prelude::*;
//!
//! # async fn run() -> Result<(), BusError> {
//! let dispatcher = Dispatcher::new(DispatcherConfig::default())?;
//!
//! let server = BusServer::new(ServerConfig::tcp(9000), dispatcher.clone())?;
//! server
//!     .start(|message: Message, reply: Arc<dyn Bus>| {
//!         // Echo every message back to its sender.
//!         let _ = reply.send(message, SendOptions::default());
//!     })
//!     .await?;
//!
//! let client = BusClient::new(ClientConfig::tcp("localhost:9000"), dispatcher)?;
//! let bus = client.create_bus(|message: Message, _: Arc<dyn Bus>| {
//!     println!("reply with {} parts", message.part_count());
//! })?;
//! bus.ready().await?;
//! bus.send(Message::single("ping"), SendOptions::acknowledged())?.await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Wire framing (always included)
pub mod packet;

// Transport layer (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transport;

// Client API (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

// Server API (feature-gated)
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;

    #[cfg(feature = "transport")]
    pub use crate::transport::{
        Bus, BusConfig, ClientConfig, ConnectionState, DeliveryTracking, Dispatcher,
        DispatcherConfig, MemoryZone, MessageHandler, SendFuture, SendOptions, ServerConfig,
        Statistics,
    };

    #[cfg(feature = "client")]
    pub use crate::client::{BusClient, ClientBus};

    #[cfg(feature = "server")]
    pub use crate::server::BusServer;
}

// Re-export commonly used items at crate root
pub use crate::core::{BusError, BusResult, Message, TransportError};

#[cfg(feature = "transport")]
pub use crate::transport::{Bus, Dispatcher, SendOptions};

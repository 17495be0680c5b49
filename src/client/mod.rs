//! Bus client.
//!
//! A [`BusClient`] holds a connection configuration and creates
//! [`ClientBus`] handles, one connection each.

#[allow(clippy::module_inception)]
mod client;

pub use client::*;

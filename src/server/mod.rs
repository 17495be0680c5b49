//! Bus server.
//!
//! A [`BusServer`] listens on a TCP port and/or a unix-domain socket,
//! classifies accepted peers into networks and enforces connection limits.

mod listener;
#[allow(clippy::module_inception)]
mod server;

pub use server::*;

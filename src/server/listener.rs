//! Listening socket registered with the acceptor poller.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::server::ServerInner;
use crate::core::{BusError, TransportError};
use crate::transport::{
    BoxFuture, BusConfig, ListenerSocket, PollControl, PollSource, PollToken, Pollable, Poller,
};

/// Bind, retrying with backoff while the address is busy.
pub(super) async fn bind_with_retries<F>(
    address: &str,
    config: &BusConfig,
    bind: F,
) -> Result<ListenerSocket, BusError>
where
    F: Fn() -> io::Result<ListenerSocket>,
{
    let mut attempt = 0;
    loop {
        match bind() {
            Ok(socket) => return Ok(socket),
            Err(error) if attempt < config.bind_retry_count => {
                attempt += 1;
                warn!(%address, attempt, %error, "Failed to bind server socket, retrying");
                tokio::time::sleep(config.bind_retry_backoff).await;
            }
            Err(error) => {
                return Err(TransportError::Bind {
                    address: address.to_string(),
                    source: Arc::new(error),
                }
                .into());
            }
        }
    }
}

/// Accepts peers and hands them to the server.
pub(super) struct Listener {
    socket: Mutex<Option<Arc<ListenerSocket>>>,
    description: String,
    local_addr: Option<SocketAddr>,
    server: Weak<ServerInner>,
    poller: Arc<dyn Poller>,
    token: OnceLock<PollToken>,
}

impl Listener {
    pub(super) fn new(socket: ListenerSocket, server: Weak<ServerInner>, poller: Arc<dyn Poller>) -> Arc<Self> {
        Arc::new(Self {
            description: socket.description(),
            local_addr: socket.local_addr(),
            socket: Mutex::new(Some(Arc::new(socket))),
            server,
            poller,
            token: OnceLock::new(),
        })
    }

    pub(super) fn description(&self) -> &str {
        &self.description
    }

    pub(super) fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Register with the poller and start accepting.
    pub(super) fn start(self: &Arc<Self>) -> Result<(), TransportError> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let pollable: Weak<dyn Pollable> = weak;
        let token = self
            .poller
            .try_register(pollable)
            .ok_or(TransportError::Registration)?;
        let _ = self.token.set(token);

        let Some(socket) = self.socket.lock().clone() else {
            return Err(TransportError::ServerStopped);
        };
        self.poller
            .arm(token, socket as Arc<dyn PollSource>, PollControl::READ);
        debug!(endpoint = %self.description, "Listener started");
        Ok(())
    }

    /// Stop accepting; the returned future completes once the socket is
    /// closed. The work proceeds even if the future is dropped.
    pub(super) fn stop(&self) -> BoxFuture<()> {
        match self.token.get() {
            Some(&token) => {
                self.poller.unarm(token);
                self.poller.unregister(token)
            }
            None => {
                self.socket.lock().take();
                Box::pin(async {})
            }
        }
    }
}

impl Pollable for Listener {
    fn logging_tag(&self) -> String {
        format!("Listener: {}", self.description)
    }

    fn on_event(&self, _control: PollControl) {
        let Some(socket) = self.socket.lock().clone() else {
            return;
        };
        loop {
            match socket.accept() {
                Ok((stream, peer)) => {
                    trace!(endpoint = %self.description, ?peer, "Connection accepted");
                    match self.server.upgrade() {
                        Some(server) => server.on_accepted(stream, peer, socket.unix_path()),
                        None => return,
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error)
                    if matches!(
                        error.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) => {}
                Err(error) => {
                    warn!(endpoint = %self.description, %error, "Failed to accept connection");
                    break;
                }
            }
        }
    }

    fn on_shutdown(&self) {
        self.socket.lock().take();
        debug!(endpoint = %self.description, "Listener stopped");
    }
}

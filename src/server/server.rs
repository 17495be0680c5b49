//! Bus server: listeners, accepted connections and connection limits.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::listener::{Listener, bind_with_retries};
use crate::core::constants::LOCAL_NETWORK_NAME;
use crate::core::{BusError, ConnectionId, EndpointAttributes, TransportError};
use crate::transport::{
    Bus, Connection, ConnectionParams, ConnectionRole, ConnectionTarget, Dispatcher,
    ListenerSocket, MessageHandler, NetworkClassifier, ServerConfig, SocketKind,
};

/// A listening bus server.
///
/// Dropping the server stops it.
pub struct BusServer {
    inner: Arc<ServerInner>,
}

#[derive(Default)]
struct ConnectionSet {
    connections: HashMap<ConnectionId, (Arc<Connection>, String)>,
    per_network: HashMap<String, usize>,
}

pub(super) struct ServerInner {
    config: ServerConfig,
    dispatcher: Dispatcher,
    classifier: NetworkClassifier,
    handler: OnceLock<Arc<dyn MessageHandler>>,
    listeners: Mutex<Vec<Arc<Listener>>>,
    connections: Mutex<ConnectionSet>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for BusServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusServer")
            .field("port", &self.inner.config.port)
            .field("unix_domain_socket_path", &self.inner.config.unix_domain_socket_path)
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl BusServer {
    /// Create a server; fails on invalid configuration.
    pub fn new(config: ServerConfig, dispatcher: Dispatcher) -> Result<Self, BusError> {
        config.validate()?;
        let classifier = NetworkClassifier::new(config.parsed_networks()?, config.default_network.clone());
        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                dispatcher,
                classifier,
                handler: OnceLock::new(),
                listeners: Mutex::new(Vec::new()),
                connections: Mutex::new(ConnectionSet::default()),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Bind the configured endpoints and start accepting.
    ///
    /// Binding is retried according to the bus configuration.
    pub async fn start(&self, handler: impl MessageHandler + 'static) -> Result<(), BusError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::ServerStopped.into());
        }
        if self.inner.handler.set(Arc::new(handler)).is_err() {
            return Err(TransportError::AlreadyStarted.into());
        }

        let config = &self.inner.config;
        let poller = self.inner.dispatcher.acceptor_poller()?;
        let handle = poller.invoker();
        let backlog = config.max_backlog_size;

        let mut listeners = Vec::new();
        let mut local = None;
        if let Some(port) = config.port {
            let socket = bind_with_retries(&format!("port {port}"), &config.bus, || {
                ListenerSocket::bind_tcp(port, backlog, &handle)
            })
            .await?;
            let bound = socket.local_addr().map_or(port, |addr| addr.port());
            local = config.local_socket_path(bound).map(|path| (bound, path));
            listeners.push(Listener::new(socket, Arc::downgrade(&self.inner), Arc::clone(&poller)));
        }
        if let Some((port, path)) = local {
            // The TCP endpoint serves everyone; the local one is a shortcut.
            match ListenerSocket::bind_local(port, backlog, &handle) {
                Ok(socket) => {
                    listeners.push(Listener::new(socket, Arc::downgrade(&self.inner), Arc::clone(&poller)));
                }
                Err(error) => {
                    warn!(path = %path.display(), %error, "Failed to bind local server socket");
                }
            }
        }
        if let Some(path) = &config.unix_domain_socket_path {
            let socket = bind_with_retries(&path.display().to_string(), &config.bus, || {
                ListenerSocket::bind_unix(path, backlog, &handle)
            })
            .await?;
            listeners.push(Listener::new(socket, Arc::downgrade(&self.inner), Arc::clone(&poller)));
        }

        for listener in &listeners {
            listener.start()?;
        }
        let endpoints: Vec<&str> = listeners.iter().map(|listener| listener.description()).collect();
        info!(?endpoints, "Bus server started");
        *self.inner.listeners.lock() = listeners;
        Ok(())
    }

    /// Close the listeners and terminate every connection.
    pub async fn stop(&self) {
        for stopped in self.inner.shutdown() {
            stopped.await;
        }
    }

    /// Bound TCP address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .listeners
            .lock()
            .iter()
            .find_map(|listener| listener.local_addr())
    }

    /// Number of live server-side connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().connections.len()
    }

    /// Live connections in one network.
    pub fn network_connection_count(&self, network: &str) -> usize {
        self.inner
            .connections
            .lock()
            .per_network
            .get(network)
            .copied()
            .unwrap_or(0)
    }
}

impl Drop for BusServer {
    fn drop(&mut self) {
        // Listener teardown continues in the background.
        drop(self.inner.shutdown());
    }
}

impl ServerInner {
    fn shutdown(&self) -> Vec<crate::transport::BoxFuture<()>> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        let listeners = std::mem::take(&mut *self.listeners.lock());
        let stopped = listeners.iter().map(|listener| listener.stop()).collect();

        let connections: Vec<Arc<Connection>> = self
            .connections
            .lock()
            .connections
            .values()
            .map(|(connection, _)| Arc::clone(connection))
            .collect();
        info!(connections = connections.len(), "Stopping bus server");
        for connection in connections {
            connection.terminate(TransportError::ServerStopped.into());
        }
        stopped
    }

    /// Admit a peer accepted by a TCP listener (`peer` set) or by the
    /// unix-domain listener at `path`.
    pub(super) fn on_accepted(
        self: &Arc<Self>,
        socket: SocketKind,
        peer: Option<SocketAddr>,
        path: Option<&Path>,
    ) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let Some(handler) = self.handler.get() else {
            return;
        };

        let id = ConnectionId::create();
        let mut attributes = EndpointAttributes::new();
        let (address, network, generate_checksums) = match peer {
            Some(peer) => {
                let network = self.classifier.classify(peer.ip()).to_string();
                attributes.insert("address", peer);
                (peer.to_string(), network, self.config.bus.generate_checksums)
            }
            None => {
                let path = path.map(|path| path.display().to_string()).unwrap_or_default();
                attributes.insert("unix_domain_socket_path", &path);
                (path, LOCAL_NETWORK_NAME.to_string(), false)
            }
        };
        attributes.insert("network", &network);
        attributes.insert("connection_id", id);

        let connection = {
            let mut set = self.connections.lock();
            // `shutdown` snapshots the set under this lock after raising the flag.
            if self.stopped.load(Ordering::SeqCst) {
                debug!(%address, "Connection dropped: server is stopping");
                return;
            }
            if set.connections.len() >= self.config.max_simultaneous_connections {
                warn!(
                    %address,
                    %network,
                    limit = self.config.max_simultaneous_connections,
                    "Connection dropped: too many simultaneous connections"
                );
                return;
            }
            let limit = self.config.connection_limit(&network);
            let count = set.per_network.get(&network).copied().unwrap_or(0);
            if count >= limit {
                warn!(%address, %network, limit, "Connection dropped: network connection limit reached");
                return;
            }

            let connection = match Connection::new(ConnectionParams {
                id,
                role: ConnectionRole::Server,
                config: self.config.bus.clone(),
                description: address.clone(),
                address,
                network: network.clone(),
                attributes,
                generate_checksums,
                target: ConnectionTarget::Accepted(socket),
                handler: Arc::clone(handler),
                dispatcher: self.dispatcher.clone(),
            }) {
                Ok(connection) => connection,
                Err(error) => {
                    warn!(%error, "Failed to create server connection");
                    return;
                }
            };
            set.connections.insert(id, (Arc::clone(&connection), network.clone()));
            *set.per_network.entry(network).or_default() += 1;
            connection
        };

        let server = Arc::downgrade(self);
        connection.subscribe_terminated(Box::new(move |_| {
            if let Some(server) = server.upgrade() {
                server.remove(id);
            }
        }));
        debug!(connection_id = %id, endpoint = %connection.endpoint_description(), "Bus server connection created");
        connection.start();
    }

    fn remove(&self, id: ConnectionId) {
        let removed = {
            let mut set = self.connections.lock();
            let removed = set.connections.remove(&id);
            if let Some((_, network)) = &removed {
                if let Some(count) = set.per_network.get_mut(network) {
                    *count -= 1;
                    if *count == 0 {
                        set.per_network.remove(network);
                    }
                }
            }
            removed
        };
        if removed.is_some() {
            debug!(connection_id = %id, "Bus server connection removed");
        }
    }
}

//! Bus client: dials a TCP address or a unix-domain socket.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::core::constants::{DEFAULT_NETWORK_NAME, LOCAL_NETWORK_NAME};
use crate::core::{BusError, ConnectionId, EndpointAttributes, Message, MessageDirection, TransportError};
use crate::transport::{
    AddressResolver, Bus, BoxFuture, ClientConfig, Connection, ConnectionParams, ConnectionRole,
    ConnectionState, ConnectionTarget, Dispatcher, DnsResolver, MessageHandler, SendFuture,
    SendOptions, Statistics, SubscriptionId, TerminatedCallback, local_bus_path,
    parse_service_address,
};

/// Creates client buses from one configuration.
pub struct BusClient {
    config: ClientConfig,
    dispatcher: Dispatcher,
    resolver: Arc<dyn AddressResolver>,
    unix_path: Option<PathBuf>,
    description: String,
    address: String,
    network: String,
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("endpoint", &self.description)
            .field("network", &self.network)
            .finish()
    }
}

impl BusClient {
    /// Create a client; fails on invalid configuration.
    pub fn new(config: ClientConfig, dispatcher: Dispatcher) -> Result<Self, BusError> {
        config.validate()?;

        let unix_path = config
            .unix_domain_socket_path
            .clone()
            .or_else(|| local_fallback(&config));
        let (description, address, network) = match &unix_path {
            Some(path) => (
                format!("unix://{}", path.display()),
                path.display().to_string(),
                LOCAL_NETWORK_NAME.to_string(),
            ),
            None => {
                let address = config.address.clone().unwrap_or_default();
                let network = config
                    .network_name
                    .clone()
                    .unwrap_or_else(|| DEFAULT_NETWORK_NAME.to_string());
                (address.clone(), address, network)
            }
        };

        Ok(Self {
            config,
            dispatcher,
            resolver: Arc::new(DnsResolver),
            unix_path,
            description,
            address,
            network,
        })
    }

    /// Replace the address resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Human-readable endpoint description.
    pub fn endpoint_description(&self) -> &str {
        &self.description
    }

    /// Open a new connection. Incoming messages go to `handler`.
    ///
    /// Returns as soon as the connection is started; await
    /// [`Bus::ready`] to wait for it to open.
    pub fn create_bus(&self, handler: impl MessageHandler + 'static) -> Result<ClientBus, BusError> {
        if self.dispatcher.is_networking_disabled() {
            return Err(TransportError::NetworkingDisabled {
                direction: MessageDirection::Outgoing,
            }
            .into());
        }

        let id = ConnectionId::create();
        let mut attributes = EndpointAttributes::new()
            .with("network", &self.network)
            .with("connection_id", id);
        let (target, generate_checksums) = match &self.unix_path {
            Some(path) => {
                attributes.insert("unix_domain_socket_path", path.display());
                (ConnectionTarget::Unix(path.clone()), false)
            }
            None => {
                attributes.insert("address", &self.address);
                let (host, port) = parse_service_address(&self.address)?;
                let target = ConnectionTarget::Tcp {
                    host,
                    port,
                    resolver: Arc::clone(&self.resolver),
                };
                (target, self.config.bus.generate_checksums)
            }
        };

        let connection = Connection::new(ConnectionParams {
            id,
            role: ConnectionRole::Client,
            config: self.config.bus.clone(),
            description: self.description.clone(),
            address: self.address.clone(),
            network: self.network.clone(),
            attributes,
            generate_checksums,
            target,
            handler: Arc::new(handler),
            dispatcher: self.dispatcher.clone(),
        })?;
        debug!(
            connection_id = %id,
            endpoint = %self.description,
            network = %self.network,
            "Bus client connection created"
        );
        connection.start();
        Ok(ClientBus { connection })
    }
}

/// Local socket of a same-host server, when preferred and present.
fn local_fallback(config: &ClientConfig) -> Option<PathBuf> {
    if !config.prefer_local_socket {
        return None;
    }
    let (host, port) = parse_service_address(config.address.as_deref()?).ok()?;
    let loopback = host == "localhost" || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback());
    let path = local_bus_path(port);
    (loopback && path.exists()).then_some(path)
}

/// Client end of a bus. Dropping it terminates the connection.
#[derive(Debug)]
pub struct ClientBus {
    connection: Arc<Connection>,
}

impl ClientBus {
    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Unix-domain socket path, for local connections.
    pub fn unix_domain_socket_path(&self) -> Option<&Path> {
        self.connection
            .endpoint_attributes()
            .get("unix_domain_socket_path")
            .map(Path::new)
    }
}

impl Bus for ClientBus {
    fn endpoint_description(&self) -> &str {
        self.connection.endpoint_description()
    }

    fn endpoint_attributes(&self) -> &EndpointAttributes {
        self.connection.endpoint_attributes()
    }

    fn endpoint_address(&self) -> &str {
        self.connection.endpoint_address()
    }

    fn network_name(&self) -> &str {
        self.connection.network_name()
    }

    fn statistics(&self) -> Statistics {
        self.connection.statistics()
    }

    fn ready(&self) -> BoxFuture<Result<(), BusError>> {
        self.connection.ready()
    }

    fn send(&self, message: Message, options: SendOptions) -> Result<SendFuture, BusError> {
        self.connection.send(message, options)
    }

    fn set_tos_level(&self, tos: u8) {
        self.connection.set_tos_level(tos);
    }

    fn terminate(&self, error: BusError) {
        self.connection.terminate(error);
    }

    fn subscribe_terminated(&self, callback: TerminatedCallback) -> SubscriptionId {
        self.connection.subscribe_terminated(callback)
    }

    fn unsubscribe_terminated(&self, id: SubscriptionId) {
        self.connection.unsubscribe_terminated(id);
    }
}

impl Drop for ClientBus {
    fn drop(&mut self) {
        self.connection.terminate(TransportError::terminated().into());
    }
}

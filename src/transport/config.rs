//! Bus, client, server and dispatcher configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::network::IpNetwork;
use super::socket::local_bus_path;
use crate::core::ConfigError;
use crate::core::constants::{
    DEFAULT_BIND_RETRY_BACKOFF, DEFAULT_BIND_RETRY_COUNT, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_LIVENESS_CHECK_PERIOD, DEFAULT_MAX_BACKLOG_SIZE, DEFAULT_MAX_SIMULTANEOUS_CONNECTIONS,
    DEFAULT_NETWORK_NAME, DEFAULT_READ_STALL_TIMEOUT, DEFAULT_THREAD_POOL_SIZE,
    DEFAULT_WRITE_STALL_TIMEOUT, MAX_MESSAGE_PART_COUNT, MAX_MESSAGE_PART_SIZE,
};

/// Options shared by client and server connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Set `TCP_NODELAY` on TCP sockets.
    pub enable_no_delay: bool,
    /// Set `TCP_QUICKACK` on TCP sockets (Linux only).
    pub enable_quick_ack: bool,
    /// Number of bind attempts before giving up.
    pub bind_retry_count: u32,
    /// Pause between bind attempts.
    pub bind_retry_backoff: Duration,
    /// Upper bound on connection establishment.
    pub connect_timeout: Duration,
    /// Abort when no byte is read for this long while a read is outstanding.
    pub read_stall_timeout: Duration,
    /// Abort when no byte is written for this long while writes are pending.
    pub write_stall_timeout: Duration,
    /// Verify checksums of inbound packets.
    pub verify_checksums: bool,
    /// Generate checksums for outbound packets (never on "local" traffic).
    pub generate_checksums: bool,
    /// Maximum number of parts per message.
    pub max_message_part_count: usize,
    /// Maximum size of a single part.
    pub max_message_part_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            enable_no_delay: true,
            enable_quick_ack: true,
            bind_retry_count: DEFAULT_BIND_RETRY_COUNT,
            bind_retry_backoff: DEFAULT_BIND_RETRY_BACKOFF,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_stall_timeout: DEFAULT_READ_STALL_TIMEOUT,
            write_stall_timeout: DEFAULT_WRITE_STALL_TIMEOUT,
            verify_checksums: true,
            generate_checksums: true,
            max_message_part_count: MAX_MESSAGE_PART_COUNT,
            max_message_part_size: MAX_MESSAGE_PART_SIZE,
        }
    }
}

impl BusConfig {
    /// Check option ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_part_count == 0 || self.max_message_part_count > MAX_MESSAGE_PART_COUNT
        {
            return Err(ConfigError::InvalidValue {
                option: "max_message_part_count",
                message: format!("must be in 1..={MAX_MESSAGE_PART_COUNT}"),
            });
        }
        if self.max_message_part_size > MAX_MESSAGE_PART_SIZE {
            return Err(ConfigError::InvalidValue {
                option: "max_message_part_size",
                message: format!("must not exceed {MAX_MESSAGE_PART_SIZE}"),
            });
        }
        if self.read_stall_timeout.is_zero() || self.write_stall_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                option: "stall_timeout",
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Listening server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Shared bus options.
    #[serde(flatten)]
    pub bus: BusConfig,
    /// TCP port to listen on (0 picks an ephemeral port).
    pub port: Option<u16>,
    /// Unix-domain socket path to listen on.
    pub unix_domain_socket_path: Option<PathBuf>,
    /// With a `port` and no explicit unix-domain path, also listen on
    /// [`local_bus_path`] for that port so same-host clients can skip TCP.
    pub enable_local_socket: bool,
    /// Listen backlog.
    pub max_backlog_size: u32,
    /// Limit on simultaneously open connections, over all networks and for
    /// each network without an explicit limit.
    pub max_simultaneous_connections: usize,
    /// Per-network connection limits.
    pub network_connection_limits: BTreeMap<String, usize>,
    /// Network name to list of CIDR ranges (IPv4 ranges are matched as
    /// IPv4-mapped IPv6).
    pub networks: BTreeMap<String, Vec<String>>,
    /// Network for peers matching no range.
    pub default_network: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            port: None,
            unix_domain_socket_path: None,
            enable_local_socket: true,
            max_backlog_size: DEFAULT_MAX_BACKLOG_SIZE,
            max_simultaneous_connections: DEFAULT_MAX_SIMULTANEOUS_CONNECTIONS,
            network_connection_limits: BTreeMap::new(),
            networks: BTreeMap::new(),
            default_network: DEFAULT_NETWORK_NAME.to_string(),
        }
    }
}

impl ServerConfig {
    /// Server listening on a TCP port.
    pub fn tcp(port: u16) -> Self {
        Self {
            port: Some(port),
            ..Self::default()
        }
    }

    /// Server listening on a unix-domain socket.
    pub fn unix_domain(path: impl Into<PathBuf>) -> Self {
        Self {
            unix_domain_socket_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Set the global connection limit.
    pub fn with_max_simultaneous_connections(mut self, limit: usize) -> Self {
        self.max_simultaneous_connections = limit;
        self
    }

    /// Set the connection limit of one network.
    pub fn with_network_limit(mut self, network: impl Into<String>, limit: usize) -> Self {
        self.network_connection_limits.insert(network.into(), limit);
        self
    }

    /// Enable or disable the local unix-domain listener of a TCP server.
    pub fn with_local_socket(mut self, enabled: bool) -> Self {
        self.enable_local_socket = enabled;
        self
    }

    /// Path of the local listener to bind for the TCP port `bound`, if any.
    pub fn local_socket_path(&self, bound: u16) -> Option<PathBuf> {
        (self.enable_local_socket && self.port.is_some() && self.unix_domain_socket_path.is_none())
            .then(|| local_bus_path(bound))
    }

    /// Add a network with its address ranges.
    pub fn with_network(
        mut self,
        name: impl Into<String>,
        ranges: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.networks
            .insert(name.into(), ranges.into_iter().map(Into::into).collect());
        self
    }

    /// Set the default network.
    pub fn with_default_network(mut self, name: impl Into<String>) -> Self {
        self.default_network = name.into();
        self
    }

    /// Replace the shared bus options.
    pub fn with_bus(mut self, bus: BusConfig) -> Self {
        self.bus = bus;
        self
    }

    /// Connection limit applying to `network`.
    pub fn connection_limit(&self, network: &str) -> usize {
        self.network_connection_limits
            .get(network)
            .copied()
            .unwrap_or(self.max_simultaneous_connections)
    }

    /// Parse the configured network ranges.
    pub fn parsed_networks(&self) -> Result<Vec<(IpNetwork, String)>, ConfigError> {
        let mut parsed = Vec::new();
        for (name, ranges) in &self.networks {
            for range in ranges {
                let network = range.parse::<IpNetwork>().map_err(|_| ConfigError::InvalidNetwork {
                    network: name.clone(),
                    range: range.clone(),
                })?;
                parsed.push((network, name.clone()));
            }
        }
        Ok(parsed)
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bus.validate()?;
        if self.port.is_none() && self.unix_domain_socket_path.is_none() {
            return Err(ConfigError::MissingEndpoint(
                "\"port\" and \"unix_domain_socket_path\" cannot be both missing",
            ));
        }
        if self.max_backlog_size == 0 {
            return Err(ConfigError::InvalidValue {
                option: "max_backlog_size",
                message: "must be positive".to_string(),
            });
        }
        if self.default_network != DEFAULT_NETWORK_NAME
            && !self.networks.contains_key(&self.default_network)
        {
            return Err(ConfigError::UnknownDefaultNetwork(
                self.default_network.clone(),
            ));
        }
        self.parsed_networks()?;
        Ok(())
    }
}

/// Client connection configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Shared bus options.
    #[serde(flatten)]
    pub bus: BusConfig,
    /// `host:port` to connect to.
    pub address: Option<String>,
    /// Network the connection is accounted to.
    pub network_name: Option<String>,
    /// Unix-domain socket path to connect to; takes precedence over
    /// `address`.
    pub unix_domain_socket_path: Option<PathBuf>,
    /// When `address` is a loopback `host:port` and a server's local socket
    /// for that port exists at client creation, connect through it instead.
    pub prefer_local_socket: bool,
}

impl ClientConfig {
    /// Client connecting to a `host:port` address.
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }

    /// Client connecting to a `host:port` address within a named network.
    pub fn tcp_in_network(address: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            network_name: Some(network.into()),
            ..Self::default()
        }
    }

    /// Client connecting to a unix-domain socket.
    pub fn unix_domain(path: impl Into<PathBuf>) -> Self {
        Self {
            unix_domain_socket_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Client connecting to the local socket of a same-host TCP server.
    pub fn local(port: u16) -> Self {
        Self::unix_domain(local_bus_path(port))
    }

    /// Prefer the local socket over loopback TCP when it is available.
    pub fn prefer_local_socket(mut self) -> Self {
        self.prefer_local_socket = true;
        self
    }

    /// Replace the shared bus options.
    pub fn with_bus(mut self, bus: BusConfig) -> Self {
        self.bus = bus;
        self
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bus.validate()?;
        if self.address.is_none() && self.unix_domain_socket_path.is_none() {
            return Err(ConfigError::MissingEndpoint(
                "\"address\" and \"unix_domain_socket_path\" cannot be both missing",
            ));
        }
        Ok(())
    }
}

/// Dispatcher (registry) configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of transfer poller threads.
    pub thread_pool_size: usize,
    /// Period of the liveness sweep.
    pub liveness_check_period: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            thread_pool_size: DEFAULT_THREAD_POOL_SIZE,
            liveness_check_period: DEFAULT_LIVENESS_CHECK_PERIOD,
        }
    }
}

impl DispatcherConfig {
    /// Check the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                option: "thread_pool_size",
                message: "must be positive".to_string(),
            });
        }
        if self.liveness_check_period.is_zero() {
            return Err(ConfigError::InvalidValue {
                option: "liveness_check_period",
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

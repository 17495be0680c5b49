//! Address parsing and resolution.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;

use crate::core::{BusError, TransportError};

/// Resolves host names to IP addresses.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Resolve `host` to one address.
    async fn resolve(&self, host: &str) -> Result<IpAddr, BusError>;
}

/// Resolver backed by the runtime's `getaddrinfo` thread pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsResolver;

#[async_trait]
impl AddressResolver for DnsResolver {
    async fn resolve(&self, host: &str) -> Result<IpAddr, BusError> {
        if let Ok(address) = host.parse::<IpAddr>() {
            return Ok(address);
        }
        let mut addresses = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|error| TransportError::Resolve {
                address: host.to_string(),
                message: error.to_string(),
            })?;
        addresses
            .next()
            .map(|address| address.ip())
            .ok_or_else(|| {
                TransportError::Resolve {
                    address: host.to_string(),
                    message: "no addresses found".to_string(),
                }
                .into()
            })
    }
}

/// Split `host:port` (or `[v6]:port`) into host and port.
pub fn parse_service_address(address: &str) -> Result<(String, u16), TransportError> {
    let invalid = || TransportError::InvalidAddress(address.to_string());

    if let Ok(socket_address) = address.parse::<SocketAddr>() {
        return Ok((socket_address.ip().to_string(), socket_address.port()));
    }

    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let host = host
        .strip_prefix('[')
        .and_then(|host| host.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() || (host.contains(':') && host.parse::<IpAddr>().is_err()) {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_service_address() {
        assert_eq!(
            parse_service_address("localhost:9013").unwrap(),
            ("localhost".to_string(), 9013)
        );
        assert_eq!(
            parse_service_address("127.0.0.1:80").unwrap(),
            ("127.0.0.1".to_string(), 80)
        );
        assert_eq!(
            parse_service_address("[::1]:443").unwrap(),
            ("::1".to_string(), 443)
        );
        assert_eq!(
            parse_service_address("node-1.cluster.local:1").unwrap(),
            ("node-1.cluster.local".to_string(), 1)
        );
    }

    #[test]
    fn test_parse_service_address_errors() {
        assert!(parse_service_address("localhost").is_err());
        assert!(parse_service_address("localhost:http").is_err());
        assert!(parse_service_address(":80").is_err());
        assert!(parse_service_address("host:70000").is_err());
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        let address = DnsResolver.resolve("10.1.2.3").await.unwrap();
        assert_eq!(address, "10.1.2.3".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let address = DnsResolver.resolve("localhost").await.unwrap();
        assert!(address.is_loopback());
    }
}

//! Network classification of peer addresses.
//!
//! Every connection is accounted to a logical network. Server-side peers are
//! classified by longest-prefix match over configured address ranges;
//! unix-domain peers always belong to the "local" network.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;

use thiserror::Error;

use crate::core::constants::DEFAULT_NETWORK_NAME;

/// An IPv6 address range. IPv4 ranges are stored IPv4-mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpNetwork {
    address: Ipv6Addr,
    prefix_len: u8,
}

/// Error parsing an [`IpNetwork`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid network {0:?}")]
pub struct InvalidNetwork(pub String);

impl IpNetwork {
    /// Create a range; host bits of `address` are cleared.
    pub fn new(address: IpAddr, prefix_len: u8) -> Option<Self> {
        let (address, prefix_len) = match address {
            IpAddr::V4(v4) if prefix_len <= 32 => (v4.to_ipv6_mapped(), prefix_len + 96),
            IpAddr::V6(v6) if prefix_len <= 128 => (v6, prefix_len),
            _ => return None,
        };
        let bits = u128::from(address) & Self::mask(prefix_len);
        Some(Self {
            address: Ipv6Addr::from(bits),
            prefix_len,
        })
    }

    /// Prefix length in IPv6 terms.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Check whether `address` falls in the range.
    pub fn contains(&self, address: IpAddr) -> bool {
        let bits = u128::from(to_ipv6(address));
        bits & Self::mask(self.prefix_len) == u128::from(self.address)
    }

    fn mask(prefix_len: u8) -> u128 {
        match prefix_len {
            0 => 0,
            len => u128::MAX << (128 - u32::from(len)),
        }
    }
}

impl FromStr for IpNetwork {
    type Err = InvalidNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidNetwork(s.to_string());
        let (address, prefix_len) = match s.split_once('/') {
            Some((address, len)) => {
                let address = address.parse::<IpAddr>().map_err(|_| invalid())?;
                let len = len.parse::<u8>().map_err(|_| invalid())?;
                (address, len)
            }
            None => {
                let address = s.parse::<IpAddr>().map_err(|_| invalid())?;
                let len = if address.is_ipv4() { 32 } else { 128 };
                (address, len)
            }
        };
        Self::new(address, prefix_len).ok_or_else(invalid)
    }
}

impl fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Maps any IP address into the IPv6 space.
pub fn to_ipv6(address: IpAddr) -> Ipv6Addr {
    match address {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Longest-prefix classifier from address ranges to network names.
#[derive(Debug, Clone)]
pub struct NetworkClassifier {
    networks: Vec<(IpNetwork, String)>,
    default_network: String,
}

impl Default for NetworkClassifier {
    fn default() -> Self {
        Self::new(Vec::new(), DEFAULT_NETWORK_NAME)
    }
}

impl NetworkClassifier {
    /// Build a classifier; ranges are tried most specific first.
    pub fn new(mut networks: Vec<(IpNetwork, String)>, default_network: impl Into<String>) -> Self {
        networks.sort_by(|(a, _), (b, _)| b.prefix_len().cmp(&a.prefix_len()));
        Self {
            networks,
            default_network: default_network.into(),
        }
    }

    /// Network name for a peer address.
    pub fn classify(&self, address: IpAddr) -> &str {
        self.networks
            .iter()
            .find(|(network, _)| network.contains(address))
            .map_or(self.default_network.as_str(), |(_, name)| name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_ipv6() {
        let network: IpNetwork = "fc00::/7".parse().unwrap();
        assert_eq!(network.prefix_len(), 7);
        assert!(network.contains(ip("fd12::1")));
        assert!(!network.contains(ip("2001:db8::1")));
    }

    #[test]
    fn test_parse_ipv4_is_mapped() {
        let network: IpNetwork = "10.0.0.0/8".parse().unwrap();
        assert_eq!(network.prefix_len(), 104);
        assert!(network.contains(ip("10.1.2.3")));
        assert!(network.contains(ip("::ffff:10.1.2.3")));
        assert!(!network.contains(ip("11.0.0.1")));
    }

    #[test]
    fn test_host_bits_are_cleared() {
        let network: IpNetwork = "192.168.1.77/24".parse().unwrap();
        assert_eq!(network.to_string(), "::ffff:192.168.1.0/120");
    }

    #[test]
    fn test_single_address() {
        let network: IpNetwork = "127.0.0.1".parse().unwrap();
        assert!(network.contains(ip("127.0.0.1")));
        assert!(!network.contains(ip("127.0.0.2")));
    }

    #[test]
    fn test_parse_errors() {
        assert!("10.0.0.0/33".parse::<IpNetwork>().is_err());
        assert!("::/129".parse::<IpNetwork>().is_err());
        assert!("nonsense/8".parse::<IpNetwork>().is_err());
        assert!("10.0.0.0/x".parse::<IpNetwork>().is_err());
    }

    #[test]
    fn test_zero_prefix_matches_everything() {
        let network: IpNetwork = "::/0".parse().unwrap();
        assert!(network.contains(ip("1.2.3.4")));
        assert!(network.contains(ip("2001:db8::1")));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let classifier = NetworkClassifier::new(
            vec![
                ("10.0.0.0/8".parse().unwrap(), "wide".to_string()),
                ("10.1.0.0/16".parse().unwrap(), "narrow".to_string()),
            ],
            "default",
        );
        assert_eq!(classifier.classify(ip("10.1.2.3")), "narrow");
        assert_eq!(classifier.classify(ip("10.2.0.1")), "wide");
        assert_eq!(classifier.classify(ip("192.168.0.1")), "default");
    }

    #[test]
    fn test_default_classifier() {
        assert_eq!(
            NetworkClassifier::default().classify(ip("127.0.0.1")),
            DEFAULT_NETWORK_NAME
        );
    }
}

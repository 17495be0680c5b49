//! 128-bit identifiers for connections and packets.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Random 128-bit identifier.
///
/// Rendered as four dash-separated lowercase hex words, most significant
/// first (`a1b2-c3d4-e5f6-1234`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Guid(u128);

impl Guid {
    /// The all-zero identifier.
    pub const NULL: Self = Self(0);

    /// Generate a fresh random identifier.
    pub fn create() -> Self {
        loop {
            let value: u128 = rand::random();
            if value != 0 {
                return Self(value);
            }
        }
    }

    /// Wrap a raw value.
    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    /// Raw value.
    pub const fn as_u128(self) -> u128 {
        self.0
    }

    /// Little-endian wire representation.
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    /// Parse the little-endian wire representation.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_le_bytes(bytes))
    }

    /// Check for the all-zero identifier.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words = [
            (self.0 >> 96) as u32,
            (self.0 >> 64) as u32,
            (self.0 >> 32) as u32,
            self.0 as u32,
        ];
        write!(f, "{:x}-{:x}-{:x}-{:x}", words[0], words[1], words[2], words[3])
    }
}

/// Identifies a connection for its whole lifetime.
pub type ConnectionId = Guid;

/// Identifies a packet; an Ack echoes the id of the message it confirms.
pub type PacketId = Guid;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_is_not_null() {
        assert!(!Guid::create().is_null());
        assert!(Guid::NULL.is_null());
    }

    #[test]
    fn test_create_is_unique() {
        let a = Guid::create();
        let b = Guid::create();
        assert_ne!(a, b);
    }

    #[test]
    fn test_display() {
        let id = Guid::from_u128(0x0000_0001_0000_00ab_dead_beef_0000_0000);
        assert_eq!(id.to_string(), "1-ab-deadbeef-0");
    }

    #[test]
    fn test_bytes_are_little_endian() {
        let id = Guid::from_u128(1);
        let bytes = id.to_bytes();
        assert_eq!(bytes[0], 1);
        assert!(bytes[1..].iter().all(|b| *b == 0));
        assert_eq!(Guid::from_bytes(bytes), id);
    }
}

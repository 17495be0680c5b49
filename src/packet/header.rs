//! Packet header, type and flags.

use super::error::DecodeError;
use crate::core::PacketId;
use crate::core::constants::{NULL_CHECKSUM, PACKET_HEADER_SIZE, PACKET_SIGNATURE};

/// Packet type carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    /// Multi-part message.
    Message = 0,
    /// Acknowledgement echoing a message's packet id; header only.
    Ack = 1,
}

impl PacketType {
    /// Parse a packet type from its wire value.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Message),
            1 => Some(Self::Ack),
            _ => None,
        }
    }

    /// Wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Packet flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketFlags(u16);

impl PacketFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// The sender awaits an Ack for this message.
    pub const REQUEST_ACKNOWLEDGEMENT: Self = Self(0x0001);
    /// The receiver should keep the payload out of core dumps.
    pub const USE_UNDUMPABLE_MEMORY_ZONE: Self = Self(0x0002);

    const KNOWN: u16 = 0x0003;

    /// Create flags from a raw value.
    pub fn from_u16(value: u16) -> Self {
        Self(value)
    }

    /// Raw value.
    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// Check if an Ack is requested.
    pub fn requests_ack(self) -> bool {
        self.0 & Self::REQUEST_ACKNOWLEDGEMENT.0 != 0
    }

    /// Check if the payload belongs in undumpable memory.
    pub fn uses_undumpable_memory(self) -> bool {
        self.0 & Self::USE_UNDUMPABLE_MEMORY_ZONE.0 != 0
    }

    /// Set REQUEST_ACKNOWLEDGEMENT.
    pub fn with_ack_request(self) -> Self {
        Self(self.0 | Self::REQUEST_ACKNOWLEDGEMENT.0)
    }

    /// Set USE_UNDUMPABLE_MEMORY_ZONE.
    pub fn with_undumpable_memory(self) -> Self {
        Self(self.0 | Self::USE_UNDUMPABLE_MEMORY_ZONE.0)
    }

    /// Check that reserved bits are zero.
    pub fn is_valid(self) -> bool {
        self.0 & !Self::KNOWN == 0
    }
}

/// Fixed-size packet header.
///
/// Wire format (44 bytes, little-endian):
/// ```text
/// +-----------+--------+--------+-----------+------------+--------------+--------------+-----------+
/// | Signature | Type   | Flags  | Packet ID | Part count | Checksummed  | Payload size | Header    |
/// | 4 bytes   | 2 bytes| 2 bytes| 16 bytes  | 4 bytes    | 4 bytes      | 8 bytes      | CRC32C 4  |
/// +-----------+--------+--------+-----------+------------+--------------+--------------+-----------+
/// ```
/// The header checksum covers the preceding 40 bytes; zero means absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet type.
    pub packet_type: PacketType,
    /// Packet flags.
    pub flags: PacketFlags,
    /// Packet id.
    pub packet_id: PacketId,
    /// Number of parts that follow.
    pub part_count: u32,
    /// Number of leading parts carrying a checksum.
    pub checksummed_part_count: u32,
    /// Total payload bytes across all parts.
    pub payload_size: u64,
}

const CHECKSUM_OFFSET: usize = PACKET_HEADER_SIZE - 4;

impl PacketHeader {
    /// Header of an Ack for `packet_id`.
    pub fn ack(packet_id: PacketId) -> Self {
        Self {
            packet_type: PacketType::Ack,
            flags: PacketFlags::NONE,
            packet_id,
            part_count: 0,
            checksummed_part_count: 0,
            payload_size: 0,
        }
    }

    /// Serialize the header, computing its checksum if requested.
    pub fn to_bytes(&self, generate_checksum: bool) -> [u8; PACKET_HEADER_SIZE] {
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        buf[0..4].copy_from_slice(&PACKET_SIGNATURE.to_le_bytes());
        buf[4..6].copy_from_slice(&self.packet_type.as_u16().to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.as_u16().to_le_bytes());
        buf[8..24].copy_from_slice(&self.packet_id.to_bytes());
        buf[24..28].copy_from_slice(&self.part_count.to_le_bytes());
        buf[28..32].copy_from_slice(&self.checksummed_part_count.to_le_bytes());
        buf[32..40].copy_from_slice(&self.payload_size.to_le_bytes());
        let checksum = if generate_checksum {
            crc32c::crc32c(&buf[..CHECKSUM_OFFSET])
        } else {
            NULL_CHECKSUM
        };
        buf[CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Parse a header, verifying its checksum when present and requested.
    pub fn from_bytes(
        bytes: &[u8; PACKET_HEADER_SIZE],
        verify_checksum: bool,
    ) -> Result<Self, DecodeError> {
        let signature = read_u32(bytes, 0);
        if signature != PACKET_SIGNATURE {
            return Err(DecodeError::SignatureMismatch {
                expected: PACKET_SIGNATURE,
                actual: signature,
            });
        }

        let checksum = read_u32(bytes, CHECKSUM_OFFSET);
        if verify_checksum && checksum != NULL_CHECKSUM {
            let actual = crc32c::crc32c(&bytes[..CHECKSUM_OFFSET]);
            if actual != checksum {
                return Err(DecodeError::HeaderChecksumMismatch {
                    expected: checksum,
                    actual,
                });
            }
        }

        let raw_type = u16::from_le_bytes([bytes[4], bytes[5]]);
        let packet_type = PacketType::from_u16(raw_type).ok_or(DecodeError::InvalidType(raw_type))?;

        let flags = PacketFlags::from_u16(u16::from_le_bytes([bytes[6], bytes[7]]));
        if !flags.is_valid() {
            return Err(DecodeError::InvalidFlags(flags.as_u16()));
        }

        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes[8..24]);

        let mut payload_size = [0u8; 8];
        payload_size.copy_from_slice(&bytes[32..40]);

        Ok(Self {
            packet_type,
            flags,
            packet_id: PacketId::from_bytes(id),
            part_count: read_u32(bytes, 24),
            checksummed_part_count: read_u32(bytes, 28),
            payload_size: u64::from_le_bytes(payload_size),
        })
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PacketHeader {
        PacketHeader {
            packet_type: PacketType::Message,
            flags: PacketFlags::NONE.with_ack_request(),
            packet_id: PacketId::from_u128(0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10),
            part_count: 3,
            checksummed_part_count: 2,
            payload_size: 5010,
        }
    }

    #[test]
    fn test_packet_type_from_u16() {
        assert_eq!(PacketType::from_u16(0), Some(PacketType::Message));
        assert_eq!(PacketType::from_u16(1), Some(PacketType::Ack));
        assert_eq!(PacketType::from_u16(2), None);
    }

    #[test]
    fn test_flags() {
        let flags = PacketFlags::NONE;
        assert!(!flags.requests_ack());
        assert!(!flags.uses_undumpable_memory());

        let flags = flags.with_ack_request().with_undumpable_memory();
        assert!(flags.requests_ack());
        assert!(flags.uses_undumpable_memory());
        assert!(flags.is_valid());

        assert!(!PacketFlags::from_u16(0x0100).is_valid());
    }

    #[test]
    fn test_header_layout() {
        let bytes = sample().to_bytes(false);
        assert_eq!(&bytes[0..4], b"YTbs");
        assert_eq!(&bytes[4..6], &[0, 0]);
        assert_eq!(&bytes[6..8], &[1, 0]);
        assert_eq!(bytes[8], 0x10);
        assert_eq!(bytes[23], 0x01);
        assert_eq!(&bytes[24..28], &[3, 0, 0, 0]);
        assert_eq!(&bytes[28..32], &[2, 0, 0, 0]);
        assert_eq!(&bytes[32..40], &5010u64.to_le_bytes());
        assert_eq!(&bytes[40..44], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_header_parse() {
        let header = sample();
        let parsed = PacketHeader::from_bytes(&header.to_bytes(true), true).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_checksum_mismatch() {
        let mut bytes = sample().to_bytes(true);
        bytes[30] ^= 0xff;
        assert!(matches!(
            PacketHeader::from_bytes(&bytes, true),
            Err(DecodeError::HeaderChecksumMismatch { .. })
        ));
        // Verification disabled: corruption goes unnoticed.
        assert!(PacketHeader::from_bytes(&bytes, false).is_ok());
    }

    #[test]
    fn test_header_without_checksum_is_accepted() {
        let bytes = sample().to_bytes(false);
        assert!(PacketHeader::from_bytes(&bytes, true).is_ok());
    }

    #[test]
    fn test_bad_signature() {
        let mut bytes = sample().to_bytes(false);
        bytes[0] = b'X';
        assert!(matches!(
            PacketHeader::from_bytes(&bytes, true),
            Err(DecodeError::SignatureMismatch { .. })
        ));
    }

    #[test]
    fn test_bad_type_and_flags() {
        let mut bytes = sample().to_bytes(false);
        bytes[4] = 7;
        assert_eq!(
            PacketHeader::from_bytes(&bytes, true),
            Err(DecodeError::InvalidType(7))
        );

        let mut bytes = sample().to_bytes(false);
        bytes[7] = 0x80;
        assert_eq!(
            PacketHeader::from_bytes(&bytes, true),
            Err(DecodeError::InvalidFlags(0x8001))
        );
    }

    #[test]
    fn test_ack_header_fixture() {
        let bytes = PacketHeader::ack(PacketId::from_u128(0xab)).to_bytes(false);
        assert_eq!(
            hex::encode(bytes),
            "59546273\
             0100\
             0000\
             ab000000000000000000000000000000\
             00000000\
             00000000\
             0000000000000000\
             00000000"
        );
    }
}

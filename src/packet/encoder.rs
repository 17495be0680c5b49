//! Pull-style packet encoder.

use bytes::Bytes;

use super::error::EncodeError;
use super::header::{PacketFlags, PacketHeader, PacketType};
use crate::core::constants::{
    MAX_MESSAGE_PART_COUNT, MAX_MESSAGE_PART_SIZE, PACKET_HEADER_SIZE,
    PART_CHECKSUM_SIZE, PART_LENGTH_SIZE,
};
use crate::core::{Message, PacketId};

const PART_HEADER_CAPACITY: usize = PART_CHECKSUM_SIZE + PART_LENGTH_SIZE;

/// A contiguous byte range produced by the encoder.
#[derive(Debug, Clone, Copy)]
pub enum Fragment<'a> {
    /// Framing bytes owned by the encoder.
    Header(&'a [u8]),
    /// A message part, shareable without copying.
    Part(&'a Bytes),
}

impl Fragment<'_> {
    /// Fragment bytes.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Fragment::Header(bytes) => bytes,
            Fragment::Part(bytes) => bytes,
        }
    }

    /// Fragment length.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the fragment is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    FixedHeader,
    PartHeader,
    PartBody,
    Finished,
}

/// Turns one packet at a time into a sequence of fragments.
///
/// The encoder holds nothing beyond the current fragment: the fixed header,
/// a part's length/checksum prefix, or a shared reference to the part.
#[derive(Debug)]
pub struct PacketEncoder {
    phase: Phase,
    header: [u8; PACKET_HEADER_SIZE],
    part_header: [u8; PART_HEADER_CAPACITY],
    part_header_len: usize,
    parts: Vec<Bytes>,
    part_index: usize,
    checksummed_part_count: usize,
}

impl Default for PacketEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketEncoder {
    /// Create an idle encoder.
    pub fn new() -> Self {
        Self {
            phase: Phase::Finished,
            header: [0u8; PACKET_HEADER_SIZE],
            part_header: [0u8; PART_HEADER_CAPACITY],
            part_header_len: 0,
            parts: Vec::new(),
            part_index: 0,
            checksummed_part_count: 0,
        }
    }

    /// Number of parts that get a checksum on the wire.
    pub fn checksummed_part_count(
        generate_checksums: bool,
        requested: usize,
        part_count: usize,
    ) -> usize {
        if generate_checksums {
            requested.min(part_count)
        } else {
            0
        }
    }

    /// Encoded size of a packet.
    pub fn packet_size(
        packet_type: PacketType,
        message: &Message,
        checksummed_part_count: usize,
    ) -> usize {
        match packet_type {
            PacketType::Ack => PACKET_HEADER_SIZE,
            PacketType::Message => {
                let checksummed = checksummed_part_count.min(message.part_count());
                PACKET_HEADER_SIZE
                    + message.part_count() * PART_LENGTH_SIZE
                    + checksummed * PART_CHECKSUM_SIZE
                    + message.payload_size()
            }
        }
    }

    /// Begin encoding a packet.
    ///
    /// `checksummed_part_count` is the requested count; it is clamped to the
    /// part count and zeroed when checksum generation is off.
    pub fn start(
        &mut self,
        packet_type: PacketType,
        flags: PacketFlags,
        generate_checksums: bool,
        checksummed_part_count: usize,
        packet_id: PacketId,
        message: Message,
    ) -> Result<(), EncodeError> {
        let parts = message.into_parts();

        if packet_type == PacketType::Ack && !parts.is_empty() {
            return Err(EncodeError::AckWithPayload(parts.len()));
        }
        if parts.len() > MAX_MESSAGE_PART_COUNT {
            return Err(EncodeError::PartCountExceeded {
                count: parts.len(),
                limit: MAX_MESSAGE_PART_COUNT,
            });
        }
        if let Some((index, part)) = parts
            .iter()
            .enumerate()
            .find(|(_, part)| part.len() > MAX_MESSAGE_PART_SIZE)
        {
            return Err(EncodeError::PartSizeExceeded {
                index,
                size: part.len(),
                limit: MAX_MESSAGE_PART_SIZE,
            });
        }

        let checksummed =
            Self::checksummed_part_count(generate_checksums, checksummed_part_count, parts.len());
        let header = PacketHeader {
            packet_type,
            flags,
            packet_id,
            part_count: parts.len() as u32,
            checksummed_part_count: checksummed as u32,
            payload_size: parts.iter().map(|part| part.len() as u64).sum(),
        };

        self.header = header.to_bytes(generate_checksums);
        self.parts = parts;
        self.part_index = 0;
        self.checksummed_part_count = checksummed;
        self.phase = Phase::FixedHeader;
        Ok(())
    }

    /// The current fragment. Empty once finished.
    pub fn fragment(&self) -> Fragment<'_> {
        match self.phase {
            Phase::FixedHeader => Fragment::Header(&self.header),
            Phase::PartHeader => Fragment::Header(&self.part_header[..self.part_header_len]),
            Phase::PartBody => Fragment::Part(&self.parts[self.part_index]),
            Phase::Finished => Fragment::Header(&[]),
        }
    }

    /// Move past the current fragment.
    pub fn next_fragment(&mut self) {
        match self.phase {
            Phase::FixedHeader => self.begin_part(0),
            Phase::PartHeader => {
                if self.parts[self.part_index].is_empty() {
                    self.begin_part(self.part_index + 1);
                } else {
                    self.phase = Phase::PartBody;
                }
            }
            Phase::PartBody => self.begin_part(self.part_index + 1),
            Phase::Finished => {}
        }
    }

    /// Whether every fragment of the packet has been produced.
    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    fn begin_part(&mut self, index: usize) {
        if index >= self.parts.len() {
            self.phase = Phase::Finished;
            self.parts.clear();
            return;
        }

        let part = &self.parts[index];
        let mut len = 0;
        if index < self.checksummed_part_count {
            let checksum = crc32c::crc32c(part);
            self.part_header[..PART_CHECKSUM_SIZE].copy_from_slice(&checksum.to_le_bytes());
            len += PART_CHECKSUM_SIZE;
        }
        self.part_header[len..len + PART_LENGTH_SIZE]
            .copy_from_slice(&(part.len() as u32).to_le_bytes());
        len += PART_LENGTH_SIZE;

        self.part_header_len = len;
        self.part_index = index;
        self.phase = Phase::PartHeader;
    }
}

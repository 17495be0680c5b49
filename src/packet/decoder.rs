//! Pull-style packet decoder.

use bytes::Bytes;

use super::error::DecodeError;
use super::header::{PacketFlags, PacketHeader, PacketType};
use crate::core::constants::{
    MAX_MESSAGE_PART_COUNT, MAX_MESSAGE_PART_SIZE, PACKET_HEADER_SIZE, PART_CHECKSUM_SIZE,
    PART_LENGTH_SIZE,
};
use crate::core::{Message, PacketId};

const PART_HEADER_CAPACITY: usize = PART_CHECKSUM_SIZE + PART_LENGTH_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    FixedHeader,
    PartHeader,
    PartBody,
    Finished,
}

/// Reassembles packets from a byte stream.
///
/// The caller asks for [`fragment`](Self::fragment), fills any prefix of it,
/// and reports the count through [`advance`](Self::advance). Once
/// [`is_finished`](Self::is_finished) the packet is available until
/// [`restart`](Self::restart).
#[derive(Debug)]
pub struct PacketDecoder {
    verify_checksums: bool,
    max_part_count: usize,
    max_part_size: usize,

    phase: Phase,
    filled: usize,
    header_buf: [u8; PACKET_HEADER_SIZE],
    part_header_buf: [u8; PART_HEADER_CAPACITY],
    part_header_len: usize,
    part_body: Vec<u8>,

    header: Option<PacketHeader>,
    parts: Vec<Bytes>,
    part_index: usize,
    part_checksum: Option<u32>,
    payload_seen: u64,
    packet_size: usize,
}

impl PacketDecoder {
    /// Create a decoder using the hard message limits.
    pub fn new(verify_checksums: bool) -> Self {
        Self::with_limits(verify_checksums, MAX_MESSAGE_PART_COUNT, MAX_MESSAGE_PART_SIZE)
    }

    /// Create a decoder with explicit part limits.
    pub fn with_limits(verify_checksums: bool, max_part_count: usize, max_part_size: usize) -> Self {
        Self {
            verify_checksums,
            max_part_count,
            max_part_size,
            phase: Phase::FixedHeader,
            filled: 0,
            header_buf: [0u8; PACKET_HEADER_SIZE],
            part_header_buf: [0u8; PART_HEADER_CAPACITY],
            part_header_len: 0,
            part_body: Vec::new(),
            header: None,
            parts: Vec::new(),
            part_index: 0,
            part_checksum: None,
            payload_seen: 0,
            packet_size: 0,
        }
    }

    /// Destination for the next bytes. Empty once finished.
    pub fn fragment(&mut self) -> &mut [u8] {
        match self.phase {
            Phase::FixedHeader => &mut self.header_buf[self.filled..],
            Phase::PartHeader => &mut self.part_header_buf[self.filled..self.part_header_len],
            Phase::PartBody => &mut self.part_body[self.filled..],
            Phase::Finished => &mut [],
        }
    }

    /// Record that `count` bytes of the current fragment were filled.
    pub fn advance(&mut self, count: usize) -> Result<(), DecodeError> {
        self.filled += count;
        self.packet_size += count;

        let target = match self.phase {
            Phase::FixedHeader => PACKET_HEADER_SIZE,
            Phase::PartHeader => self.part_header_len,
            Phase::PartBody => self.part_body.len(),
            Phase::Finished => return Ok(()),
        };
        debug_assert!(self.filled <= target);
        if self.filled < target {
            return Ok(());
        }

        self.filled = 0;
        match self.phase {
            Phase::FixedHeader => self.end_fixed_header(),
            Phase::PartHeader => self.end_part_header(),
            Phase::PartBody => self.end_part_body(),
            Phase::Finished => Ok(()),
        }
    }

    /// Whether a whole packet has been decoded.
    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    /// Whether a packet is partially decoded.
    pub fn is_in_progress(&self) -> bool {
        !self.is_finished() && self.packet_size > 0
    }

    /// Reset for the next packet.
    pub fn restart(&mut self) {
        self.phase = Phase::FixedHeader;
        self.filled = 0;
        self.part_header_len = 0;
        self.part_body = Vec::new();
        self.header = None;
        self.parts.clear();
        self.part_index = 0;
        self.part_checksum = None;
        self.payload_seen = 0;
        self.packet_size = 0;
    }

    /// Type of the decoded packet.
    pub fn packet_type(&self) -> Option<PacketType> {
        self.header.map(|header| header.packet_type)
    }

    /// Flags of the decoded packet.
    pub fn packet_flags(&self) -> PacketFlags {
        self.header.map_or(PacketFlags::NONE, |header| header.flags)
    }

    /// Id of the decoded packet.
    pub fn packet_id(&self) -> PacketId {
        self.header.map_or(PacketId::NULL, |header| header.packet_id)
    }

    /// Bytes consumed by the current packet so far.
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Take the decoded payload.
    pub fn take_message(&mut self) -> Message {
        Message::from_parts(std::mem::take(&mut self.parts))
    }

    fn end_fixed_header(&mut self) -> Result<(), DecodeError> {
        let header = PacketHeader::from_bytes(&self.header_buf, self.verify_checksums)?;

        let count = header.part_count as usize;
        let checksummed = header.checksummed_part_count as usize;
        match header.packet_type {
            PacketType::Ack if count != 0 => return Err(DecodeError::AckWithPayload(count)),
            _ if count > self.max_part_count => {
                return Err(DecodeError::PartCountExceeded {
                    count,
                    limit: self.max_part_count,
                });
            }
            _ if checksummed > count => {
                return Err(DecodeError::InvalidChecksummedPartCount { checksummed, count });
            }
            _ => {}
        }

        self.header = Some(header);
        self.parts = Vec::with_capacity(count.min(64));
        self.begin_part(0)
    }

    fn end_part_header(&mut self) -> Result<(), DecodeError> {
        let (checksum, length) = if self.part_header_len == PART_HEADER_CAPACITY {
            let mut checksum = [0u8; PART_CHECKSUM_SIZE];
            checksum.copy_from_slice(&self.part_header_buf[..PART_CHECKSUM_SIZE]);
            let mut length = [0u8; PART_LENGTH_SIZE];
            length.copy_from_slice(&self.part_header_buf[PART_CHECKSUM_SIZE..]);
            (Some(u32::from_le_bytes(checksum)), u32::from_le_bytes(length))
        } else {
            let mut length = [0u8; PART_LENGTH_SIZE];
            length.copy_from_slice(&self.part_header_buf[..PART_LENGTH_SIZE]);
            (None, u32::from_le_bytes(length))
        };

        let size = length as usize;
        if size > self.max_part_size {
            return Err(DecodeError::PartSizeExceeded {
                index: self.part_index,
                size,
                limit: self.max_part_size,
            });
        }

        self.payload_seen += length as u64;
        let expected = self.header.map_or(0, |header| header.payload_size);
        if self.payload_seen > expected {
            return Err(DecodeError::PayloadSizeMismatch {
                expected,
                actual: self.payload_seen,
            });
        }

        self.part_checksum = checksum;
        self.part_body = vec![0u8; size];
        if size == 0 {
            return self.end_part_body();
        }
        self.phase = Phase::PartBody;
        Ok(())
    }

    fn end_part_body(&mut self) -> Result<(), DecodeError> {
        let body = std::mem::take(&mut self.part_body);
        if let (true, Some(expected)) = (self.verify_checksums, self.part_checksum) {
            let actual = crc32c::crc32c(&body);
            if actual != expected {
                return Err(DecodeError::PartChecksumMismatch {
                    index: self.part_index,
                    expected,
                    actual,
                });
            }
        }
        self.parts.push(Bytes::from(body));
        self.begin_part(self.part_index + 1)
    }

    fn begin_part(&mut self, index: usize) -> Result<(), DecodeError> {
        let Some(header) = self.header else {
            return Ok(());
        };

        if index >= header.part_count as usize {
            if self.payload_seen != header.payload_size {
                return Err(DecodeError::PayloadSizeMismatch {
                    expected: header.payload_size,
                    actual: self.payload_seen,
                });
            }
            self.phase = Phase::Finished;
            return Ok(());
        }

        self.part_index = index;
        self.part_checksum = None;
        self.part_header_len = if index < header.checksummed_part_count as usize {
            PART_HEADER_CAPACITY
        } else {
            PART_LENGTH_SIZE
        };
        self.phase = Phase::PartHeader;
        Ok(())
    }
}

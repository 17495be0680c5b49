//! Packet codec errors.

use thiserror::Error;

/// Errors raised while decoding inbound bytes.
///
/// Every decode error is fatal to the connection; the stream position is
/// lost once framing is broken.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Header does not start with the packet signature.
    #[error("packet signature mismatch: expected {expected:#010x}, actual {actual:#010x}")]
    SignatureMismatch {
        /// Expected signature.
        expected: u32,
        /// Received value.
        actual: u32,
    },

    /// Unknown packet type.
    #[error("invalid packet type {0}")]
    InvalidType(u16),

    /// Reserved flag bits are set.
    #[error("invalid packet flags {0:#06x}")]
    InvalidFlags(u16),

    /// The header checksum does not match.
    #[error("packet header checksum mismatch: expected {expected:#010x}, actual {actual:#010x}")]
    HeaderChecksumMismatch {
        /// Checksum carried by the header.
        expected: u32,
        /// Checksum of the received header bytes.
        actual: u32,
    },

    /// Too many parts announced.
    #[error("invalid part count {count} (limit {limit})")]
    PartCountExceeded {
        /// Announced count.
        count: usize,
        /// Configured limit.
        limit: usize,
    },

    /// A part exceeds the size limit.
    #[error("invalid size {size} of part {index} (limit {limit})")]
    PartSizeExceeded {
        /// Zero-based part index.
        index: usize,
        /// Announced size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// More checksummed parts than parts.
    #[error("invalid checksummed part count {checksummed} for {count} parts")]
    InvalidChecksummedPartCount {
        /// Announced checksummed part count.
        checksummed: usize,
        /// Announced part count.
        count: usize,
    },

    /// A part checksum does not match.
    #[error("checksum mismatch in part {index}: expected {expected:#010x}, actual {actual:#010x}")]
    PartChecksumMismatch {
        /// Zero-based part index.
        index: usize,
        /// Checksum carried on the wire.
        expected: u32,
        /// Checksum of the received bytes.
        actual: u32,
    },

    /// Part sizes do not add up to the announced payload size.
    #[error("payload size mismatch: header says {expected}, parts carry {actual}")]
    PayloadSizeMismatch {
        /// Payload size from the header.
        expected: u64,
        /// Sum of part sizes seen so far.
        actual: u64,
    },

    /// An Ack packet announced a payload.
    #[error("ack packet carries {0} parts")]
    AckWithPayload(usize),
}

/// Errors raised while framing an outbound packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// Too many parts to frame.
    #[error("invalid part count {count} (limit {limit})")]
    PartCountExceeded {
        /// Actual part count.
        count: usize,
        /// Limit.
        limit: usize,
    },

    /// A part is too large to frame.
    #[error("invalid size {size} of part {index} (limit {limit})")]
    PartSizeExceeded {
        /// Zero-based part index.
        index: usize,
        /// Actual size.
        size: usize,
        /// Limit.
        limit: usize,
    },

    /// Ack packets cannot carry a payload.
    #[error("ack packet cannot carry {0} parts")]
    AckWithPayload(usize),
}

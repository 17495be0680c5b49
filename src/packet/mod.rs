//! Packet framing.
//!
//! Pure data transformation between messages and wire bytes:
//!
//! - **Header**: [`PacketHeader`] with [`PacketType`] and [`PacketFlags`]
//! - **Encoder**: [`PacketEncoder`] yields [`Fragment`]s one at a time
//! - **Decoder**: [`PacketDecoder`] asks for bytes one fragment at a time
//!
//! A message packet is the fixed header followed, for every part, by an
//! optional CRC32C (only for the first `checksummed_part_count` parts), a
//! 32-bit length and the part bytes. An Ack is a bare header echoing the id
//! of the message it confirms.
//!
//! ```text
//! +----------+-----+-----+--------+-----+-----+--------+-----+--------+
//! | Header   | crc | len | part 0 | ... | len | part k | ... | part n |
//! | 44 bytes | 4   | 4   |        |     | 4   |        |     |        |
//! +----------+-----+-----+--------+-----+-----+--------+-----+--------+
//!             <- checksummed parts ->    <- remaining parts ->
//! ```

mod decoder;
mod encoder;
mod error;
mod header;

pub use decoder::PacketDecoder;
pub use encoder::{Fragment, PacketEncoder};
pub use error::{DecodeError, EncodeError};
pub use header::{PacketFlags, PacketHeader, PacketType};

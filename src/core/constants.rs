//! Bus constants.
//!
//! Wire-level values are fixed by the packet format and MUST NOT be changed
//! without bumping [`PACKET_SIGNATURE`].

use std::time::Duration;

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// Signature opening every packet header ("YTbs", little-endian).
pub const PACKET_SIGNATURE: u32 = 0x7362_5459;

/// Checksum value meaning "no checksum was computed".
pub const NULL_CHECKSUM: u32 = 0;

/// Fixed packet header size.
///
/// signature (4) + type (2) + flags (2) + packet id (16) + part count (4)
/// + checksummed part count (4) + payload size (8) + header checksum (4).
pub const PACKET_HEADER_SIZE: usize = 44;

/// Size of the per-part length prefix.
pub const PART_LENGTH_SIZE: usize = 4;

/// Size of the optional per-part checksum prefix.
pub const PART_CHECKSUM_SIZE: usize = 4;

// =============================================================================
// MESSAGE LIMITS
// =============================================================================

/// Hard upper bound on the number of parts in one message.
pub const MAX_MESSAGE_PART_COUNT: usize = 1 << 28;

/// Hard upper bound on the size of a single message part (1 GiB).
pub const MAX_MESSAGE_PART_SIZE: usize = 1 << 30;

// =============================================================================
// I/O BATCHING
// =============================================================================

/// Size of the per-connection read buffer.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Largest single read issued straight into a decoder fragment.
pub const MAX_BATCH_READ_SIZE: usize = 64 * 1024;

/// Fragments at most this large are copied into the coalescing buffer.
pub const MAX_WRITE_COALESCE_SIZE: usize = 1024;

/// Initial capacity of the coalescing write buffer.
pub const WRITE_BUFFER_SIZE: usize = 16 * 1024;

/// Maximum number of fragments passed to one vectored write.
pub const MAX_FRAGMENTS_PER_WRITE: usize = 256;

/// Maximum number of bytes passed to one vectored write.
pub const MAX_BATCH_WRITE_SIZE: usize = 64 * 1024;

// =============================================================================
// NETWORKS
// =============================================================================

/// Network assigned to peers that match no configured address range.
pub const DEFAULT_NETWORK_NAME: &str = "default";

/// Network assigned to unix-domain peers.
pub const LOCAL_NETWORK_NAME: &str = "local";

/// Default traffic class byte.
pub const DEFAULT_TOS_LEVEL: u8 = 0;

// =============================================================================
// TIMEOUTS AND DEFAULTS
// =============================================================================

/// Default read stall timeout.
pub const DEFAULT_READ_STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Default write stall timeout.
pub const DEFAULT_WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Default connect timeout for client connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default number of bind attempts.
pub const DEFAULT_BIND_RETRY_COUNT: u32 = 5;

/// Default pause between bind attempts.
pub const DEFAULT_BIND_RETRY_BACKOFF: Duration = Duration::from_secs(3);

/// Default listen backlog.
pub const DEFAULT_MAX_BACKLOG_SIZE: u32 = 8192;

/// Default limit on simultaneously open server connections.
pub const DEFAULT_MAX_SIMULTANEOUS_CONNECTIONS: usize = 50_000;

/// Default number of transfer poller threads.
pub const DEFAULT_THREAD_POOL_SIZE: usize = 8;

/// Default period of the liveness sweep.
pub const DEFAULT_LIVENESS_CHECK_PERIOD: Duration = Duration::from_secs(1);

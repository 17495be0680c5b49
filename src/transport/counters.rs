//! Per-network traffic counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters shared by every connection of one network.
///
/// Plain relaxed atomics; the values are statistics, not synchronization.
#[derive(Debug, Default)]
pub struct NetworkCounters {
    pub(crate) in_bytes: AtomicI64,
    pub(crate) in_packets: AtomicI64,
    pub(crate) out_bytes: AtomicI64,
    pub(crate) out_packets: AtomicI64,
    pub(crate) pending_out_packets: AtomicI64,
    pub(crate) pending_out_bytes: AtomicI64,
    pub(crate) client_connections: AtomicI64,
    pub(crate) server_connections: AtomicI64,
    pub(crate) stalled_reads: AtomicI64,
    pub(crate) stalled_writes: AtomicI64,
    pub(crate) read_errors: AtomicI64,
    pub(crate) write_errors: AtomicI64,
    pub(crate) retransmits: AtomicI64,
    pub(crate) encoder_errors: AtomicI64,
    pub(crate) decoder_errors: AtomicI64,
}

/// Snapshot of [`NetworkCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    /// Bytes read.
    pub in_bytes: i64,
    /// Packets received.
    pub in_packets: i64,
    /// Bytes written.
    pub out_bytes: i64,
    /// Packets fully written.
    pub out_packets: i64,
    /// Packets enqueued but not yet written.
    pub pending_out_packets: i64,
    /// Bytes enqueued but not yet written.
    pub pending_out_bytes: i64,
    /// Open client connections.
    pub client_connections: i64,
    /// Open server connections.
    pub server_connections: i64,
    /// Connections aborted by read stall detection.
    pub stalled_reads: i64,
    /// Connections aborted by write stall detection.
    pub stalled_writes: i64,
    /// Socket read failures.
    pub read_errors: i64,
    /// Socket write failures.
    pub write_errors: i64,
    /// TCP retransmits.
    pub retransmits: i64,
    /// Packets that failed to encode.
    pub encoder_errors: i64,
    /// Packets that failed to decode.
    pub decoder_errors: i64,
}

impl NetworkCounters {
    /// Take a snapshot.
    pub fn statistics(&self) -> Statistics {
        let load = |counter: &AtomicI64| counter.load(Ordering::Relaxed);
        Statistics {
            in_bytes: load(&self.in_bytes),
            in_packets: load(&self.in_packets),
            out_bytes: load(&self.out_bytes),
            out_packets: load(&self.out_packets),
            pending_out_packets: load(&self.pending_out_packets),
            pending_out_bytes: load(&self.pending_out_bytes),
            client_connections: load(&self.client_connections),
            server_connections: load(&self.server_connections),
            stalled_reads: load(&self.stalled_reads),
            stalled_writes: load(&self.stalled_writes),
            read_errors: load(&self.read_errors),
            write_errors: load(&self.write_errors),
            retransmits: load(&self.retransmits),
            encoder_errors: load(&self.encoder_errors),
            decoder_errors: load(&self.decoder_errors),
        }
    }

    pub(crate) fn add(counter: &AtomicI64, delta: i64) {
        counter.fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn increment(counter: &AtomicI64) {
        Self::add(counter, 1);
    }
}

/// Pending-output charge of one queued packet against a set of counters.
///
/// Charged on creation; [`PendingCharge::release`] consumes it, so a packet
/// can only be released once.
#[derive(Debug)]
pub(crate) struct PendingCharge {
    counters: Vec<Arc<NetworkCounters>>,
    bytes: i64,
}

impl PendingCharge {
    pub(crate) fn new(counters: Vec<Arc<NetworkCounters>>, bytes: usize) -> Self {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        for counter in &counters {
            NetworkCounters::increment(&counter.pending_out_packets);
            NetworkCounters::add(&counter.pending_out_bytes, bytes);
        }
        Self { counters, bytes }
    }

    pub(crate) fn release(self) {
        for counter in &self.counters {
            NetworkCounters::add(&counter.pending_out_packets, -1);
            NetworkCounters::add(&counter.pending_out_bytes, -self.bytes);
        }
    }
}

impl std::ops::AddAssign for Statistics {
    fn add_assign(&mut self, other: Self) {
        self.in_bytes += other.in_bytes;
        self.in_packets += other.in_packets;
        self.out_bytes += other.out_bytes;
        self.out_packets += other.out_packets;
        self.pending_out_packets += other.pending_out_packets;
        self.pending_out_bytes += other.pending_out_bytes;
        self.client_connections += other.client_connections;
        self.server_connections += other.server_connections;
        self.stalled_reads += other.stalled_reads;
        self.stalled_writes += other.stalled_writes;
        self.read_errors += other.read_errors;
        self.write_errors += other.write_errors;
        self.retransmits += other.retransmits;
        self.encoder_errors += other.encoder_errors;
        self.decoder_errors += other.decoder_errors;
    }
}

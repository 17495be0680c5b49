//! Send options, per-packet shared state and the send future.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Sleep;

use super::counters::PendingCharge;
use crate::core::{BusError, PacketId, TransportError};

/// When a send is considered complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryTracking {
    /// Complete once every byte is written to the socket.
    #[default]
    None,
    /// Complete once the peer acknowledges receipt.
    Acknowledged,
}

/// Memory placement hint forwarded to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryZone {
    /// Regular memory.
    #[default]
    Normal,
    /// Memory excluded from core dumps.
    Undumpable,
}

/// Per-message send options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Delivery tracking level.
    pub tracking: DeliveryTracking,
    /// Number of leading parts to checksum; [`SendOptions::ALL_PARTS`]
    /// checksums everything.
    pub checksummed_part_count: usize,
    /// Memory placement hint.
    pub memory_zone: MemoryZone,
    /// Allow [`SendFuture::cancel`] to withdraw the message while queued.
    pub enable_send_cancelation: bool,
    /// Fail the send if it does not complete in time.
    pub timeout: Option<Duration>,
}

impl SendOptions {
    /// Checksum every part.
    pub const ALL_PARTS: usize = usize::MAX;

    /// Options with the given tracking level.
    pub fn tracked(tracking: DeliveryTracking) -> Self {
        Self {
            tracking,
            ..Self::default()
        }
    }

    /// Request an acknowledgement.
    pub fn acknowledged() -> Self {
        Self::tracked(DeliveryTracking::Acknowledged)
    }

    /// Enable cancellation.
    pub fn cancelable(mut self) -> Self {
        self.enable_send_cancelation = true;
        self
    }

    /// Set a timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Limit checksumming to the first `count` parts.
    pub fn with_checksummed_parts(mut self, count: usize) -> Self {
        self.checksummed_part_count = count;
        self
    }

    /// Set the memory placement hint.
    pub fn with_memory_zone(mut self, zone: MemoryZone) -> Self {
        self.memory_zone = zone;
        self
    }
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            tracking: DeliveryTracking::None,
            checksummed_part_count: Self::ALL_PARTS,
            memory_zone: MemoryZone::Normal,
            enable_send_cancelation: false,
            timeout: None,
        }
    }
}

/// Lifecycle of an outbound message packet. One-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketState {
    /// Waiting for the encoder.
    Queued = 0,
    /// Encoding started; bytes will be written.
    Encoded = 1,
    /// Withdrawn before encoding.
    Canceled = 2,
}

impl PacketState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PacketState::Queued,
            1 => PacketState::Encoded,
            _ => PacketState::Canceled,
        }
    }
}

type SendResult = Result<(), BusError>;

/// State shared between a queued packet and its [`SendFuture`].
#[derive(Debug)]
pub(crate) struct SendState {
    state: AtomicU8,
    cancelable: bool,
    promise: Mutex<Option<oneshot::Sender<SendResult>>>,
    charge: Mutex<Option<PendingCharge>>,
}

impl SendState {
    pub(crate) fn new(cancelable: bool) -> (Self, oneshot::Receiver<SendResult>) {
        let (sender, receiver) = oneshot::channel();
        let state = Self {
            state: AtomicU8::new(PacketState::Queued as u8),
            cancelable,
            promise: Mutex::new(Some(sender)),
            charge: Mutex::new(None),
        };
        (state, receiver)
    }

    /// Attach the pending-output charge released when the packet leaves
    /// the queue, by cancellation or otherwise.
    pub(crate) fn set_charge(&self, charge: PendingCharge) {
        *self.charge.lock() = Some(charge);
    }

    /// Release the pending-output charge; later calls are no-ops.
    pub(crate) fn release_charge(&self) {
        if let Some(charge) = self.charge.lock().take() {
            charge.release();
        }
    }

    pub(crate) fn state(&self) -> PacketState {
        PacketState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Claim the packet for the encoder. Fails if canceled.
    pub(crate) fn mark_encoded(&self) -> bool {
        self.state
            .compare_exchange(
                PacketState::Queued as u8,
                PacketState::Encoded as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Withdraw the packet. Fails once encoding started.
    pub(crate) fn cancel(&self) -> bool {
        if !self.cancelable {
            return false;
        }
        let canceled = self
            .state
            .compare_exchange(
                PacketState::Queued as u8,
                PacketState::Canceled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if canceled {
            self.release_charge();
            self.complete(Err(BusError::Canceled));
        }
        canceled
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.state() == PacketState::Canceled
    }

    /// Resolve the future; later calls are ignored.
    pub(crate) fn complete(&self, result: SendResult) {
        if let Some(sender) = self.promise.lock().take() {
            let _ = sender.send(result);
        }
    }
}

/// Completes when a message is written (or acknowledged), or fails with
/// the error that ended the connection.
#[derive(Debug)]
pub struct SendFuture {
    packet_id: PacketId,
    state: std::sync::Arc<SendState>,
    receiver: oneshot::Receiver<SendResult>,
    timeout: Option<Duration>,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl SendFuture {
    pub(crate) fn new(
        packet_id: PacketId,
        state: std::sync::Arc<SendState>,
        receiver: oneshot::Receiver<SendResult>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            packet_id,
            state,
            receiver,
            timeout,
            deadline: None,
        }
    }

    /// Id of the packet carrying the message.
    pub fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    /// Current packet state.
    pub fn state(&self) -> PacketState {
        self.state.state()
    }

    /// Withdraw the message if it has not reached the encoder.
    ///
    /// Returns `true` if the message will never be written; the future then
    /// resolves with [`BusError::Canceled`].
    pub fn cancel(&self) -> bool {
        self.state.cancel()
    }
}

impl Future for SendFuture {
    type Output = SendResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => return Poll::Ready(result),
            Poll::Ready(Err(_)) => {
                return Poll::Ready(Err(TransportError::terminated_with(
                    "send promise abandoned",
                )
                .into()));
            }
            Poll::Pending => {}
        }

        let Some(timeout) = self.timeout else {
            return Poll::Pending;
        };
        let deadline = self
            .deadline
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
        match deadline.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.state.cancel();
                self.timeout = None;
                Poll::Ready(Err(BusError::Timeout(timeout)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

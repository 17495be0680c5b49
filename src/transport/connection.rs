//! Bus connection state machine.
//!
//! A connection ties together a socket, a poller registration, the packet
//! codec and the outbound queues:
//!
//! ```text
//!   Resolving ──> Opening ──> Open ──> Aborted | Closed
//!   (client)      (server starts here)
//! ```
//!
//! Producers push onto a lock-free queue and poke the poller; all socket
//! work happens in [`Pollable::on_event`] passes, which the control word
//! keeps to one thread at a time. Lock order is `io` before `shared`.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::bus::{Bus, MessageHandler, SubscriptionId, TerminatedCallback};
use super::config::BusConfig;
use super::control::{ControlWord, PollControl, needs_retry};
use super::counters::{NetworkCounters, PendingCharge, Statistics};
use super::dispatcher::Dispatcher;
use super::poller::{BoxFuture, PollSource, PollToken, Pollable, Poller};
use super::resolver::AddressResolver;
use super::send::{DeliveryTracking, MemoryZone, SendFuture, SendOptions, SendState};
use super::socket::{BusSocket, SocketKind};
use crate::core::constants::{
    DEFAULT_TOS_LEVEL, MAX_BATCH_READ_SIZE, MAX_BATCH_WRITE_SIZE, MAX_FRAGMENTS_PER_WRITE,
    MAX_WRITE_COALESCE_SIZE, PACKET_HEADER_SIZE, READ_BUFFER_SIZE, WRITE_BUFFER_SIZE,
};
use crate::core::{
    BusError, ConnectionId, EndpointAttributes, Message, MessageDirection, PacketId,
    TransportError, ValidationError,
};
use crate::packet::{Fragment, PacketDecoder, PacketEncoder, PacketFlags, PacketType};

const DISARMED: u64 = u64::MAX;

/// Which side created the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Dialed by a client.
    Client,
    /// Accepted by a server.
    Server,
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Resolving the peer address.
    Resolving,
    /// Connecting, or accepted and not yet registered.
    Opening,
    /// Exchanging packets.
    Open,
    /// Ended by an error or a termination request.
    Aborted,
    /// Torn down without an abort.
    Closed,
}

impl ConnectionState {
    /// Whether the connection has ended.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Aborted | ConnectionState::Closed)
    }
}

/// Where the socket comes from.
pub(crate) enum ConnectionTarget {
    Accepted(SocketKind),
    Tcp {
        host: String,
        port: u16,
        resolver: Arc<dyn AddressResolver>,
    },
    Unix(PathBuf),
}

pub(crate) struct ConnectionParams {
    pub id: ConnectionId,
    pub role: ConnectionRole,
    pub config: BusConfig,
    pub description: String,
    pub address: String,
    pub network: String,
    pub attributes: EndpointAttributes,
    pub generate_checksums: bool,
    pub target: ConnectionTarget,
    pub handler: Arc<dyn MessageHandler>,
    pub dispatcher: Dispatcher,
}

struct Packet {
    packet_type: PacketType,
    flags: PacketFlags,
    id: PacketId,
    message: Message,
    checksummed_part_count: usize,
    size: usize,
    send: Option<Arc<SendState>>,
}

impl Packet {
    fn ack(id: PacketId) -> Self {
        Self {
            packet_type: PacketType::Ack,
            flags: PacketFlags::NONE,
            id,
            message: Message::new(),
            checksummed_part_count: 0,
            size: PACKET_HEADER_SIZE,
            send: None,
        }
    }

    fn complete(&self, result: Result<(), BusError>) {
        if let Some(send) = &self.send {
            send.complete(result);
        }
    }

    fn is_canceled(&self) -> bool {
        self.send.as_ref().is_some_and(|send| send.is_canceled())
    }
}

struct EncodedPacket {
    packet: Packet,
    remaining: usize,
}

/// Bytes ready for the socket: small fragments copied into the coalescing
/// buffer, large parts shared without copying.
enum WriteFragment {
    Coalesced(Bytes),
    Borrowed(Bytes),
}

impl WriteFragment {
    fn bytes(&self) -> &Bytes {
        match self {
            WriteFragment::Coalesced(bytes) | WriteFragment::Borrowed(bytes) => bytes,
        }
    }

    fn len(&self) -> usize {
        self.bytes().len()
    }

    fn advance(&mut self, count: usize) {
        match self {
            WriteFragment::Coalesced(bytes) | WriteFragment::Borrowed(bytes) => bytes.advance(count),
        }
    }
}

struct IoState {
    decoder: PacketDecoder,
    encoder: PacketEncoder,
    read_buffer: Box<[u8]>,
    queued_packets: VecDeque<Packet>,
    encoded_packets: VecDeque<EncodedPacket>,
    unacked_packets: VecDeque<Packet>,
    fragments: VecDeque<WriteFragment>,
    fragment_bytes: usize,
    coalesce: BytesMut,
}

struct Shared {
    state: ConnectionState,
    socket: Option<Arc<BusSocket>>,
    tos: u8,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    callbacks: Vec<(SubscriptionId, TerminatedCallback)>,
    fired: bool,
}

type CounterOf = fn(&NetworkCounters) -> &AtomicI64;

/// One end of a bus.
pub struct Connection {
    id: ConnectionId,
    role: ConnectionRole,
    config: BusConfig,
    description: String,
    address: String,
    network: String,
    attributes: EndpointAttributes,
    generate_checksums: bool,

    dispatcher: Dispatcher,
    poller: Arc<dyn Poller>,
    handler: Arc<dyn MessageHandler>,
    counters: Arc<NetworkCounters>,
    statistics: Arc<NetworkCounters>,
    weak_self: Weak<Connection>,
    created_at: Instant,

    target: Mutex<Option<ConnectionTarget>>,
    poll_token: OnceLock<PollToken>,
    control: ControlWord,
    shared: Mutex<Shared>,
    error: OnceLock<BusError>,
    io: Mutex<IoState>,
    queued_messages: SegQueue<Packet>,
    read_stall_deadline: AtomicU64,
    write_stall_deadline: AtomicU64,
    ready: watch::Sender<Option<Result<(), BusError>>>,
    subscribers: Mutex<Subscribers>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("endpoint", &self.description)
            .field("network", &self.network)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(params: ConnectionParams) -> Result<Arc<Self>, TransportError> {
        let poller = params.dispatcher.xfer_poller()?;
        let counters = params.dispatcher.counters(&params.network);
        let state = match params.role {
            ConnectionRole::Client => ConnectionState::Resolving,
            ConnectionRole::Server => ConnectionState::Opening,
        };
        let decoder = PacketDecoder::with_limits(
            params.config.verify_checksums,
            params.config.max_message_part_count,
            params.config.max_message_part_size,
        );
        let (ready, _) = watch::channel(None);

        Ok(Arc::new_cyclic(|weak_self| Self {
            id: params.id,
            role: params.role,
            config: params.config,
            description: params.description,
            address: params.address,
            network: params.network,
            attributes: params.attributes,
            generate_checksums: params.generate_checksums,
            dispatcher: params.dispatcher,
            poller,
            handler: params.handler,
            counters,
            statistics: Arc::default(),
            weak_self: weak_self.clone(),
            created_at: Instant::now(),
            target: Mutex::new(Some(params.target)),
            poll_token: OnceLock::new(),
            control: ControlWord::offline(),
            shared: Mutex::new(Shared {
                state,
                socket: None,
                tos: DEFAULT_TOS_LEVEL,
            }),
            error: OnceLock::new(),
            io: Mutex::new(IoState {
                decoder,
                encoder: PacketEncoder::new(),
                read_buffer: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
                queued_packets: VecDeque::new(),
                encoded_packets: VecDeque::new(),
                unacked_packets: VecDeque::new(),
                fragments: VecDeque::new(),
                fragment_bytes: 0,
                coalesce: BytesMut::with_capacity(WRITE_BUFFER_SIZE),
            }),
            queued_messages: SegQueue::new(),
            read_stall_deadline: AtomicU64::new(DISARMED),
            write_stall_deadline: AtomicU64::new(DISARMED),
            ready,
            subscribers: Mutex::new(Subscribers::default()),
        }))
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Client or server side.
    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// The terminal error, once set.
    pub fn error(&self) -> Option<BusError> {
        self.error.get().cloned()
    }

    /// Register with the poller and start connecting (client) or open right
    /// away (server).
    pub(crate) fn start(self: &Arc<Self>) {
        debug!(
            connection_id = %self.id,
            endpoint = %self.description,
            network = %self.network,
            role = ?self.role,
            "Starting connection"
        );

        let pollable: Weak<dyn Pollable> = self.weak_self.clone();
        let Some(token) = self.poller.try_register(pollable) else {
            self.abort(TransportError::Registration.into());
            return;
        };
        let _ = self.poll_token.set(token);
        self.dispatcher.register_connection(self, &self.poller.invoker());

        let Some(target) = self.target.lock().take() else {
            return;
        };
        match target {
            ConnectionTarget::Accepted(socket) => self.open(socket),
            target => {
                let weak = self.weak_self.clone();
                let address = self.address.clone();
                let timeout = self.config.connect_timeout;
                self.poller.invoker().spawn(async move {
                    let result = establish(&weak, target, address, timeout).await;
                    let Some(connection) = weak.upgrade() else {
                        return;
                    };
                    match result {
                        Ok(Some(socket)) => connection.open(socket),
                        Ok(None) => {}
                        Err(error) => connection.abort(error),
                    }
                });
            }
        }
    }

    fn begin_opening(&self) -> bool {
        let mut shared = self.shared.lock();
        if shared.state.is_terminal() {
            return false;
        }
        shared.state = ConnectionState::Opening;
        true
    }

    fn open(&self, kind: SocketKind) {
        let socket = match BusSocket::new(kind, &self.poller.invoker()) {
            Ok(socket) => Arc::new(socket),
            Err(error) => {
                self.abort(
                    TransportError::Connect {
                        address: self.address.clone(),
                        source: Arc::new(error),
                    }
                    .into(),
                );
                return;
            }
        };
        socket.configure(&self.config);
        let Some(&token) = self.poll_token.get() else {
            return;
        };

        {
            let mut shared = self.shared.lock();
            if shared.state.is_terminal() {
                return;
            }
            shared.state = ConnectionState::Open;
            if shared.tos != DEFAULT_TOS_LEVEL && !socket.set_tos(shared.tos) {
                debug!(connection_id = %self.id, tos = shared.tos, "Failed to set TOS level");
            }
            shared.socket = Some(Arc::clone(&socket));
            self.count(connection_counter(self.role), 1);
            self.poller.arm(
                token,
                socket as Arc<dyn PollSource>,
                PollControl::READ | PollControl::WRITE | PollControl::EDGE_TRIGGERED,
            );
        }
        self.read_stall_deadline.store(DISARMED, Ordering::Relaxed);
        self.write_stall_deadline.store(DISARMED, Ordering::Relaxed);
        self.set_ready(Ok(()));
        debug!(connection_id = %self.id, endpoint = %self.description, "Connection established");

        let pending = self.control.go_online().without(PollControl::OFFLINE);
        if !pending.is_empty() {
            self.retry(true);
        }
    }

    fn validate(&self, message: &Message) -> Result<(), BusError> {
        let limit = self.config.max_message_part_count;
        if message.part_count() > limit {
            return Err(ValidationError::TooManyParts {
                count: message.part_count(),
                limit,
            }
            .into());
        }
        let limit = self.config.max_message_part_size;
        if let Some((index, part)) = message
            .parts()
            .iter()
            .enumerate()
            .find(|(_, part)| part.len() > limit)
        {
            return Err(ValidationError::PartTooLarge {
                index,
                size: part.len(),
                limit,
            }
            .into());
        }
        Ok(())
    }

    fn retry(&self, wakeup: bool) {
        if let Some(&token) = self.poll_token.get() {
            self.poller.retry(token, wakeup);
        }
    }

    fn count(&self, counter: CounterOf, delta: i64) {
        NetworkCounters::add(counter(&self.counters), delta);
        NetworkCounters::add(counter(&self.statistics), delta);
    }

    fn release_pending(&self, packet: &Packet) {
        match &packet.send {
            Some(send) => send.release_charge(),
            None => {
                self.count(|c| &c.pending_out_packets, -1);
                self.count(|c| &c.pending_out_bytes, -(packet.size as i64));
            }
        }
    }

    fn terminal_error(&self) -> BusError {
        self.error.get().cloned().unwrap_or_else(|| {
            BusError::from(TransportError::terminated()).with_endpoint(&self.attributes)
        })
    }

    fn set_ready(&self, result: Result<(), BusError>) {
        self.ready.send_if_modified(|value| {
            if value.is_some() {
                return false;
            }
            *value = Some(result);
            true
        });
    }

    // ========================================================================
    // Event processing
    // ========================================================================

    fn run(&self, action: PollControl) {
        if action.contains(PollControl::TERMINATE) {
            self.abort(self.terminal_error());
            return;
        }
        let socket = {
            let shared = self.shared.lock();
            if shared.state != ConnectionState::Open {
                return;
            }
            shared.socket.clone()
        };
        let Some(socket) = socket else {
            return;
        };
        if let Err(error) = self.process(action, &socket) {
            self.abort(error.into());
        }
    }

    fn process(&self, action: PollControl, socket: &BusSocket) -> Result<(), TransportError> {
        if self.dispatcher.is_networking_disabled() {
            let direction = if action.contains(PollControl::READ) {
                MessageDirection::Incoming
            } else {
                MessageDirection::Outgoing
            };
            return Err(TransportError::NetworkingDisabled { direction });
        }

        let mut io = self.io.lock();
        let mut read_progress = false;
        if action.contains(PollControl::READ) {
            read_progress = self.read_socket(&mut io, socket)?;
        }
        let mut write_progress = false;
        if self.state() == ConnectionState::Open {
            self.process_queued_messages(&mut io);
            write_progress = self.write_socket(&mut io, socket)?;
        }
        self.update_read_stall(&io, read_progress);
        self.update_write_stall(&io, write_progress);
        Ok(())
    }

    fn read_socket(&self, io: &mut IoState, socket: &BusSocket) -> Result<bool, TransportError> {
        let mut progressed = false;
        loop {
            let direct = io.decoder.fragment().len() >= READ_BUFFER_SIZE;
            let result = if direct {
                let fragment = io.decoder.fragment();
                let len = fragment.len().min(MAX_BATCH_READ_SIZE);
                socket.read(&mut fragment[..len])
            } else {
                socket.read(&mut io.read_buffer)
            };
            let count = match result {
                Ok(0) => return Err(TransportError::SocketClosed),
                Ok(count) => count,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    self.count(|c| &c.read_errors, 1);
                    return Err(TransportError::Read(Arc::new(error)));
                }
            };
            progressed = true;
            self.count(|c| &c.in_bytes, count as i64);

            if direct {
                self.advance_decoder(io, count)?;
                continue;
            }
            let mut offset = 0;
            while offset < count {
                let chunk = {
                    let fragment = io.decoder.fragment();
                    let chunk = fragment.len().min(count - offset);
                    fragment[..chunk].copy_from_slice(&io.read_buffer[offset..offset + chunk]);
                    chunk
                };
                offset += chunk;
                self.advance_decoder(io, chunk)?;
            }
        }
        Ok(progressed)
    }

    fn advance_decoder(&self, io: &mut IoState, count: usize) -> Result<(), TransportError> {
        if let Err(error) = io.decoder.advance(count) {
            self.count(|c| &c.decoder_errors, 1);
            return Err(error.into());
        }
        if io.decoder.is_finished() {
            self.on_packet_received(io)?;
        }
        Ok(())
    }

    fn on_packet_received(&self, io: &mut IoState) -> Result<(), TransportError> {
        self.count(|c| &c.in_packets, 1);
        let packet_id = io.decoder.packet_id();
        trace!(
            connection_id = %self.id,
            packet_id = %packet_id,
            packet_size = io.decoder.packet_size(),
            "Packet received"
        );

        let result = match io.decoder.packet_type() {
            Some(PacketType::Ack) => Self::on_ack_received(io, packet_id),
            Some(PacketType::Message) => {
                self.on_message_received(io, packet_id);
                Ok(())
            }
            None => Ok(()),
        };
        io.decoder.restart();
        result
    }

    fn on_ack_received(io: &mut IoState, packet_id: PacketId) -> Result<(), TransportError> {
        let Some(expected) = io.unacked_packets.front().map(|packet| packet.id) else {
            return Err(TransportError::UnexpectedAck { packet_id });
        };
        if expected != packet_id {
            return Err(TransportError::AckMismatch {
                expected,
                actual: packet_id,
            });
        }
        if let Some(packet) = io.unacked_packets.pop_front() {
            packet.complete(Ok(()));
        }
        Ok(())
    }

    fn on_message_received(&self, io: &mut IoState, packet_id: PacketId) {
        if io.decoder.packet_flags().requests_ack() {
            let ack = Packet::ack(packet_id);
            self.count(|c| &c.pending_out_packets, 1);
            self.count(|c| &c.pending_out_bytes, ack.size as i64);
            io.queued_packets.push_back(ack);
        }
        let message = io.decoder.take_message();
        if let Some(reply_bus) = self.weak_self.upgrade() {
            self.handler.handle_message(message, reply_bus);
        }
    }

    fn process_queued_messages(&self, io: &mut IoState) {
        for _ in 0..self.queued_messages.len() {
            let Some(packet) = self.queued_messages.pop() else {
                break;
            };
            io.queued_packets.push_back(packet);
        }
    }

    fn write_socket(&self, io: &mut IoState, socket: &BusSocket) -> Result<bool, TransportError> {
        let mut progressed = false;
        loop {
            self.encode_fragments(io)?;
            if io.fragments.is_empty() {
                break;
            }

            let result = {
                let mut slices = Vec::with_capacity(io.fragments.len().min(MAX_FRAGMENTS_PER_WRITE));
                let mut bytes = 0;
                for fragment in &io.fragments {
                    if slices.len() == MAX_FRAGMENTS_PER_WRITE || bytes >= MAX_BATCH_WRITE_SIZE {
                        break;
                    }
                    slices.push(IoSlice::new(fragment.bytes()));
                    bytes += fragment.len();
                }
                socket.write_vectored(&slices)
            };
            let written = match result {
                Ok(0) => {
                    self.count(|c| &c.write_errors, 1);
                    return Err(TransportError::Write(Arc::new(io::ErrorKind::WriteZero.into())));
                }
                Ok(written) => written,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    self.count(|c| &c.write_errors, 1);
                    return Err(TransportError::Write(Arc::new(error)));
                }
            };
            progressed = true;
            self.count(|c| &c.out_bytes, written as i64);
            self.on_bytes_written(io, written);
        }
        Ok(progressed)
    }

    fn encode_fragments(&self, io: &mut IoState) -> Result<(), TransportError> {
        while io.fragments.len() < MAX_FRAGMENTS_PER_WRITE
            && io.fragment_bytes + io.coalesce.len() < MAX_BATCH_WRITE_SIZE
        {
            if io.encoder.is_finished() && !self.start_next_packet(io)? {
                break;
            }
            let borrowed = match io.encoder.fragment() {
                Fragment::Part(part) if part.len() > MAX_WRITE_COALESCE_SIZE => Some(part.clone()),
                fragment => {
                    io.coalesce.extend_from_slice(fragment.as_slice());
                    None
                }
            };
            if let Some(part) = borrowed {
                Self::flush_coalesced(io);
                io.fragment_bytes += part.len();
                io.fragments.push_back(WriteFragment::Borrowed(part));
            }
            io.encoder.next_fragment();
        }
        Self::flush_coalesced(io);
        Ok(())
    }

    fn flush_coalesced(io: &mut IoState) {
        if !io.coalesce.is_empty() {
            let bytes = io.coalesce.split().freeze();
            io.fragment_bytes += bytes.len();
            io.fragments.push_back(WriteFragment::Coalesced(bytes));
        }
        if io.coalesce.capacity() < MAX_WRITE_COALESCE_SIZE {
            io.coalesce.reserve(WRITE_BUFFER_SIZE);
        }
    }

    fn start_next_packet(&self, io: &mut IoState) -> Result<bool, TransportError> {
        while let Some(mut packet) = io.queued_packets.pop_front() {
            if let Some(send) = &packet.send {
                if !send.mark_encoded() {
                    trace!(connection_id = %self.id, packet_id = %packet.id, "Dropping canceled packet");
                    self.release_pending(&packet);
                    continue;
                }
            }

            let message = std::mem::take(&mut packet.message);
            if let Err(error) = io.encoder.start(
                packet.packet_type,
                packet.flags,
                self.generate_checksums,
                packet.checksummed_part_count,
                packet.id,
                message,
            ) {
                self.count(|c| &c.encoder_errors, 1);
                self.release_pending(&packet);
                let error = TransportError::from(error);
                packet.complete(Err(BusError::from(error.clone()).with_endpoint(&self.attributes)));
                return Err(error);
            }

            trace!(
                connection_id = %self.id,
                packet_id = %packet.id,
                packet_size = packet.size,
                "Packet encoding started"
            );
            let remaining = packet.size;
            io.encoded_packets.push_back(EncodedPacket { packet, remaining });
            return Ok(true);
        }
        Ok(false)
    }

    fn on_bytes_written(&self, io: &mut IoState, written: usize) {
        let mut remaining = written;
        while remaining > 0 {
            let Some(fragment) = io.fragments.front_mut() else {
                break;
            };
            let len = fragment.len();
            if remaining >= len {
                remaining -= len;
                io.fragment_bytes -= len;
                io.fragments.pop_front();
            } else {
                fragment.advance(remaining);
                io.fragment_bytes -= remaining;
                remaining = 0;
            }
        }

        let mut remaining = written;
        while remaining > 0 {
            let Some(encoded) = io.encoded_packets.front_mut() else {
                break;
            };
            let retired = encoded.remaining.min(remaining);
            encoded.remaining -= retired;
            remaining -= retired;
            if encoded.remaining == 0 {
                if let Some(encoded) = io.encoded_packets.pop_front() {
                    self.on_packet_sent(io, encoded.packet);
                }
            }
        }
    }

    fn on_packet_sent(&self, io: &mut IoState, packet: Packet) {
        self.release_pending(&packet);
        self.count(|c| &c.out_packets, 1);
        trace!(
            connection_id = %self.id,
            packet_id = %packet.id,
            packet_size = packet.size,
            "Packet sent"
        );
        if packet.packet_type == PacketType::Message && packet.flags.requests_ack() {
            io.unacked_packets.push_back(packet);
        } else {
            packet.complete(Ok(()));
        }
    }

    // ========================================================================
    // Stall detection
    // ========================================================================

    fn now_nanos(&self) -> u64 {
        u64::try_from(self.created_at.elapsed().as_nanos()).unwrap_or(DISARMED - 1)
    }

    fn update_read_stall(&self, io: &IoState, progressed: bool) {
        let outstanding = io.decoder.is_in_progress() || !io.unacked_packets.is_empty();
        self.update_stall(&self.read_stall_deadline, outstanding, progressed, self.config.read_stall_timeout);
    }

    fn update_write_stall(&self, io: &IoState, progressed: bool) {
        let outstanding = !io.fragments.is_empty()
            || !io.encoded_packets.is_empty()
            || io.queued_packets.iter().any(|packet| !packet.is_canceled());
        self.update_stall(&self.write_stall_deadline, outstanding, progressed, self.config.write_stall_timeout);
    }

    fn update_stall(&self, deadline: &AtomicU64, outstanding: bool, progressed: bool, timeout: Duration) {
        if !outstanding {
            deadline.store(DISARMED, Ordering::Relaxed);
        } else if progressed || deadline.load(Ordering::Relaxed) == DISARMED {
            let timeout = u64::try_from(timeout.as_nanos()).unwrap_or(DISARMED);
            deadline.store(self.now_nanos().saturating_add(timeout), Ordering::Relaxed);
        }
    }

    /// Abort if a direction made no progress within its stall timeout.
    pub(crate) fn check_liveness(&self) {
        if self.error.get().is_some() || self.state() != ConnectionState::Open {
            return;
        }
        let now = self.now_nanos();

        let read_deadline = self.read_stall_deadline.load(Ordering::Relaxed);
        if read_deadline != DISARMED && now >= read_deadline {
            self.count(|c| &c.stalled_reads, 1);
            debug!(connection_id = %self.id, "Socket read stalled");
            self.abort(
                TransportError::ReadStalled {
                    timeout: self.config.read_stall_timeout,
                }
                .into(),
            );
            return;
        }

        let write_deadline = self.write_stall_deadline.load(Ordering::Relaxed);
        if write_deadline != DISARMED && now >= write_deadline {
            self.count(|c| &c.stalled_writes, 1);
            debug!(connection_id = %self.id, "Socket write stalled");
            self.abort(
                TransportError::WriteStalled {
                    timeout: self.config.write_stall_timeout,
                }
                .into(),
            );
        }
    }

    // ========================================================================
    // Termination
    // ========================================================================

    /// Fail the connection now. Idempotent; the first error wins.
    pub(crate) fn abort(&self, error: BusError) {
        let error = error.with_endpoint(&self.attributes);
        {
            let mut shared = self.shared.lock();
            if shared.state.is_terminal() {
                return;
            }
            let _ = self.error.set(error);
            if shared.state == ConnectionState::Open {
                self.count(connection_counter(self.role), -1);
            }
            shared.state = ConnectionState::Aborted;
            shared.socket = None;
            if let Some(&token) = self.poll_token.get() {
                self.poller.unarm(token);
            }
        }
        self.control.shutdown();

        let error = self.terminal_error();
        debug!(connection_id = %self.id, %error, "Connection aborted");
        self.set_ready(Err(error));

        match self.poll_token.get() {
            Some(&token) => drop(self.poller.unregister(token)),
            None => {
                self.close();
                self.fire_terminated();
            }
        }
    }

    /// Release the socket and fail everything still queued. Idempotent.
    pub(crate) fn close(&self) {
        {
            let mut shared = self.shared.lock();
            let _ = self
                .error
                .set(BusError::from(TransportError::terminated()).with_endpoint(&self.attributes));
            if shared.state == ConnectionState::Open {
                self.count(connection_counter(self.role), -1);
            }
            if !shared.state.is_terminal() {
                shared.state = ConnectionState::Closed;
            }
            shared.socket = None;
            if let Some(&token) = self.poll_token.get() {
                self.poller.unarm(token);
            }
        }
        self.control.set_offline();
        self.read_stall_deadline.store(DISARMED, Ordering::Relaxed);
        self.write_stall_deadline.store(DISARMED, Ordering::Relaxed);

        let error = self.terminal_error();
        self.set_ready(Err(error.clone()));
        self.discard_queued_messages();

        let mut io = self.io.lock();
        for packet in io.queued_packets.drain(..) {
            self.release_pending(&packet);
            packet.complete(Err(error.clone()));
        }
        for encoded in io.encoded_packets.drain(..) {
            self.release_pending(&encoded.packet);
            encoded.packet.complete(Err(error.clone()));
        }
        for packet in io.unacked_packets.drain(..) {
            packet.complete(Err(error.clone()));
        }
        io.fragments.clear();
        io.fragment_bytes = 0;
        io.coalesce.clear();
        io.encoder = PacketEncoder::new();
        io.decoder.restart();
    }

    fn discard_queued_messages(&self) {
        let error = self.terminal_error();
        while let Some(packet) = self.queued_messages.pop() {
            self.release_pending(&packet);
            packet.complete(Err(error.clone()));
        }
    }

    fn fire_terminated(&self) {
        let callbacks = {
            let mut subscribers = self.subscribers.lock();
            if subscribers.fired {
                return;
            }
            subscribers.fired = true;
            std::mem::take(&mut subscribers.callbacks)
        };
        let error = self.terminal_error();
        debug!(connection_id = %self.id, %error, "Connection terminated");
        for (_, callback) in callbacks {
            callback(&error);
        }
    }
}

fn connection_counter(role: ConnectionRole) -> CounterOf {
    match role {
        ConnectionRole::Client => |c| &c.client_connections,
        ConnectionRole::Server => |c| &c.server_connections,
    }
}

async fn establish(
    connection: &Weak<Connection>,
    target: ConnectionTarget,
    address: String,
    timeout: Duration,
) -> Result<Option<SocketKind>, BusError> {
    let connect_error = |source: io::Error| TransportError::Connect {
        address: address.clone(),
        source: Arc::new(source),
    };
    let timed_out = || io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
    let opening = || {
        connection
            .upgrade()
            .is_some_and(|connection| connection.begin_opening())
    };

    match target {
        ConnectionTarget::Accepted(socket) => Ok(Some(socket)),
        ConnectionTarget::Tcp { host, port, resolver } => {
            let ip = resolver.resolve(&host).await?;
            if !opening() {
                return Ok(None);
            }
            let peer = SocketAddr::new(ip, port);
            trace!(%peer, "Connecting");
            let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(peer))
                .await
                .map_err(|_| connect_error(timed_out()))?
                .map_err(connect_error)?;
            Ok(Some(SocketKind::Tcp(stream.into_std().map_err(connect_error)?)))
        }
        ConnectionTarget::Unix(path) => {
            if !opening() {
                return Ok(None);
            }
            let stream = tokio::time::timeout(timeout, tokio::net::UnixStream::connect(&path))
                .await
                .map_err(|_| connect_error(timed_out()))?
                .map_err(connect_error)?;
            Ok(Some(SocketKind::Unix(stream.into_std().map_err(connect_error)?)))
        }
    }
}

impl Pollable for Connection {
    fn logging_tag(&self) -> String {
        format!(
            "ConnectionId: {}, Network: {}, Endpoint: {}",
            self.id, self.network, self.description
        )
    }

    fn on_event(&self, control: PollControl) {
        let Some(action) = self.control.begin(control) else {
            return;
        };
        self.run(action);
        if needs_retry(self.control.end()) {
            self.retry(false);
        }
    }

    fn on_shutdown(&self) {
        self.close();
        self.fire_terminated();
    }
}

impl Bus for Connection {
    fn endpoint_description(&self) -> &str {
        &self.description
    }

    fn endpoint_attributes(&self) -> &EndpointAttributes {
        &self.attributes
    }

    fn endpoint_address(&self) -> &str {
        &self.address
    }

    fn network_name(&self) -> &str {
        &self.network
    }

    fn statistics(&self) -> Statistics {
        self.statistics.statistics()
    }

    fn ready(&self) -> BoxFuture<Result<(), BusError>> {
        let mut receiver = self.ready.subscribe();
        let attributes = self.attributes.clone();
        Box::pin(async move {
            let result = match receiver.wait_for(Option::is_some).await {
                Ok(value) => (*value).clone(),
                Err(_) => None,
            };
            result.unwrap_or_else(|| {
                Err(BusError::from(TransportError::terminated()).with_endpoint(&attributes))
            })
        })
    }

    fn send(&self, message: Message, options: SendOptions) -> Result<SendFuture, BusError> {
        if self.dispatcher.is_networking_disabled() {
            return Err(BusError::from(TransportError::NetworkingDisabled {
                direction: MessageDirection::Outgoing,
            })
            .with_endpoint(&self.attributes));
        }
        self.validate(&message)
            .map_err(|error| error.with_endpoint(&self.attributes))?;

        let id = PacketId::create();
        let (state, receiver) = SendState::new(options.enable_send_cancelation);
        let state = Arc::new(state);
        let future = SendFuture::new(id, Arc::clone(&state), receiver, options.timeout);
        if let Some(error) = self.error.get() {
            state.complete(Err(error.clone()));
            return Ok(future);
        }

        let mut flags = PacketFlags::NONE;
        if options.tracking == DeliveryTracking::Acknowledged {
            flags = flags.with_ack_request();
        }
        if options.memory_zone == MemoryZone::Undumpable {
            flags = flags.with_undumpable_memory();
        }
        let checksummed_part_count = PacketEncoder::checksummed_part_count(
            self.generate_checksums,
            options.checksummed_part_count,
            message.part_count(),
        );
        let size = PacketEncoder::packet_size(PacketType::Message, &message, checksummed_part_count);

        state.set_charge(PendingCharge::new(
            vec![Arc::clone(&self.counters), Arc::clone(&self.statistics)],
            size,
        ));
        trace!(connection_id = %self.id, packet_id = %id, packet_size = size, "Message enqueued");
        self.queued_messages.push(Packet {
            packet_type: PacketType::Message,
            flags,
            id,
            message,
            checksummed_part_count,
            size,
            send: Some(state),
        });

        if self.error.get().is_some() {
            self.discard_queued_messages();
        } else if self.control.request(PollControl::WRITE).is_empty() {
            self.retry(true);
        }
        Ok(future)
    }

    fn set_tos_level(&self, tos: u8) {
        let mut shared = self.shared.lock();
        shared.tos = tos;
        if let Some(socket) = &shared.socket {
            if !socket.set_tos(tos) {
                debug!(connection_id = %self.id, tos, "Failed to set TOS level");
            }
        }
    }

    fn terminate(&self, error: BusError) {
        if self.error.get().is_some() || self.state().is_terminal() {
            return;
        }
        if self.error.set(error.with_endpoint(&self.attributes)).is_err() {
            return;
        }
        debug!(connection_id = %self.id, error = %self.terminal_error(), "Termination requested");

        let previous = self.control.request(PollControl::TERMINATE);
        if previous.contains(PollControl::OFFLINE) {
            let state = self.state();
            if state != ConnectionState::Open && !state.is_terminal() {
                self.abort(self.terminal_error());
            }
        } else if !previous.contains(PollControl::RUNNING) {
            self.retry(true);
        }
    }

    fn subscribe_terminated(&self, callback: TerminatedCallback) -> SubscriptionId {
        let mut subscribers = self.subscribers.lock();
        let id = SubscriptionId(subscribers.next_id);
        subscribers.next_id += 1;
        if subscribers.fired {
            drop(subscribers);
            callback(&self.terminal_error());
        } else {
            subscribers.callbacks.push((id, callback));
        }
        id
    }

    fn unsubscribe_terminated(&self, id: SubscriptionId) {
        self.subscribers
            .lock()
            .callbacks
            .retain(|(subscription, _)| *subscription != id);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
        if let Some(&token) = self.poll_token.get() {
            drop(self.poller.unregister(token));
        }
        self.fire_terminated();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::runtime::Handle;

    use super::*;
    use crate::transport::config::DispatcherConfig;

    fn dispatcher() -> Dispatcher {
        Dispatcher::with_handle(DispatcherConfig::default(), Handle::current()).unwrap()
    }

    fn unstarted(dispatcher: &Dispatcher) -> Arc<Connection> {
        let config = BusConfig {
            max_message_part_size: 16,
            ..BusConfig::default()
        };
        let id = ConnectionId::create();
        Connection::new(ConnectionParams {
            id,
            role: ConnectionRole::Client,
            config,
            description: "unix:///nonexistent".to_string(),
            address: "/nonexistent".to_string(),
            network: "local".to_string(),
            attributes: EndpointAttributes::new().with("connection_id", id),
            generate_checksums: false,
            target: ConnectionTarget::Unix(PathBuf::from("/nonexistent")),
            handler: Arc::new(|_: Message, _: Arc<dyn Bus>| {}),
            dispatcher: dispatcher.clone(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_rejects_oversized_part() {
        let dispatcher = dispatcher();
        let connection = unstarted(&dispatcher);
        let message = Message::single(vec![0u8; 17]);
        let error = connection.send(message, SendOptions::default()).unwrap_err();
        assert!(error.is_validation());
        assert!(connection.error().is_none());
        assert_eq!(connection.statistics().pending_out_packets, 0);
    }

    #[tokio::test]
    async fn test_send_accounts_pending_bytes() {
        let dispatcher = dispatcher();
        let connection = unstarted(&dispatcher);

        let _future = connection
            .send(Message::single(&b"hello"[..]), SendOptions::default())
            .unwrap();
        let statistics = connection.statistics();
        assert_eq!(statistics.pending_out_packets, 1);
        assert_eq!(statistics.pending_out_bytes, (PACKET_HEADER_SIZE + 4 + 5) as i64);
    }

    #[tokio::test]
    async fn test_cancel_releases_pending_before_encoding() {
        let dispatcher = dispatcher();
        let connection = unstarted(&dispatcher);

        let future = connection
            .send(Message::single(&b"hello"[..]), SendOptions::default().cancelable())
            .unwrap();
        assert_eq!(connection.statistics().pending_out_packets, 1);
        assert!(future.cancel());
        let statistics = connection.statistics();
        assert_eq!(statistics.pending_out_packets, 0);
        assert_eq!(statistics.pending_out_bytes, 0);
        assert!(matches!(future.await, Err(BusError::Canceled)));

        // A queue holding only canceled packets is not outstanding work.
        let mut io = connection.io.lock();
        connection.process_queued_messages(&mut io);
        assert_eq!(io.queued_packets.len(), 1);
        connection.update_write_stall(&io, false);
        assert_eq!(connection.write_stall_deadline.load(Ordering::Relaxed), DISARMED);

        assert!(!connection.start_next_packet(&mut io).unwrap());
        assert!(io.queued_packets.is_empty());
        drop(io);
        assert_eq!(connection.statistics().pending_out_packets, 0);
        assert_eq!(connection.statistics().pending_out_bytes, 0);
    }

    #[tokio::test]
    async fn test_close_fails_queued_sends() {
        let dispatcher = dispatcher();
        let connection = unstarted(&dispatcher);

        let future = connection
            .send(Message::single(&b"hello"[..]), SendOptions::default())
            .unwrap();
        connection.close();
        connection.close();

        let error = future.await.unwrap_err();
        assert!(error.is_fatal());
        assert!(error.endpoint().is_some());
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(connection.statistics().pending_out_packets, 0);
        assert_eq!(connection.statistics().pending_out_bytes, 0);
        assert!(connection.ready().await.is_err());
    }

    #[tokio::test]
    async fn test_terminate_before_open_aborts_once() {
        let dispatcher = dispatcher();
        let connection = unstarted(&dispatcher);
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            connection.subscribe_terminated(Box::new(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }

        connection.terminate(TransportError::terminated_with("first").into());
        connection.terminate(TransportError::terminated_with("second").into());

        assert_eq!(connection.state(), ConnectionState::Aborted);
        assert!(connection.error().unwrap().to_string().starts_with("first"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Late subscribers run immediately.
        let late = Arc::new(AtomicUsize::new(0));
        {
            let late = Arc::clone(&late);
            connection.subscribe_terminated(Box::new(move |_| {
                late.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let dispatcher = dispatcher();
        let connection = unstarted(&dispatcher);
        let fired = Arc::new(AtomicUsize::new(0));
        let id = {
            let fired = Arc::clone(&fired);
            connection.subscribe_terminated(Box::new(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            }))
        };
        connection.unsubscribe_terminated(id);
        connection.abort(TransportError::SocketClosed.into());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_send_after_abort_fails_immediately() {
        let dispatcher = dispatcher();
        let connection = unstarted(&dispatcher);
        connection.abort(TransportError::SocketClosed.into());

        let future = connection
            .send(Message::single(&b"late"[..]), SendOptions::default())
            .unwrap();
        let error = future.await.unwrap_err();
        assert!(matches!(error.as_transport(), Some(TransportError::SocketClosed)));
    }

    #[test]
    fn test_write_fragment_advance() {
        let mut fragment = WriteFragment::Borrowed(Bytes::from_static(b"abcdef"));
        fragment.advance(2);
        assert_eq!(fragment.bytes().as_ref(), b"cdef");
        assert_eq!(fragment.len(), 4);
    }
}

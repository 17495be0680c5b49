//! End-to-end tests over real sockets.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use msgbus::client::{BusClient, ClientBus};
use msgbus::core::constants::PACKET_HEADER_SIZE;
use msgbus::core::{BusError, Message, PacketId, TransportError};
use msgbus::packet::{PacketDecoder, PacketHeader};
use msgbus::server::BusServer;
use msgbus::transport::{
    Bus, BusConfig, ClientConfig, Dispatcher, DispatcherConfig, SendOptions, ServerConfig,
    local_bus_path,
};

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn dispatcher() -> Dispatcher {
    init_tracing();
    let config = DispatcherConfig {
        thread_pool_size: 2,
        liveness_check_period: Duration::from_millis(50),
    };
    Dispatcher::with_handle(config, Handle::current()).unwrap()
}

fn ignore(_: Message, _: Arc<dyn Bus>) {}

async fn echo_server(config: ServerConfig, dispatcher: &Dispatcher) -> BusServer {
    let server = BusServer::new(config, dispatcher.clone()).unwrap();
    server
        .start(|message: Message, reply: Arc<dyn Bus>| {
            let _ = reply.send(message, SendOptions::default());
        })
        .await
        .unwrap();
    server
}

fn collecting_client(
    client: &BusClient,
) -> (ClientBus, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let bus = client
        .create_bus(move |message: Message, _: Arc<dyn Bus>| {
            let _ = tx.send(message);
        })
        .unwrap();
    (bus, rx)
}

fn tcp_client(server: &BusServer, dispatcher: &Dispatcher, bus: BusConfig) -> BusClient {
    let port = server.local_addr().unwrap().port();
    let config = ClientConfig::tcp(format!("127.0.0.1:{port}")).with_bus(bus);
    BusClient::new(config, dispatcher.clone()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_echo_preserves_order_and_content() {
    let dispatcher = dispatcher();
    let server = echo_server(ServerConfig::tcp(0), &dispatcher).await;
    let client = tcp_client(&server, &dispatcher, BusConfig::default());
    let (bus, mut replies) = collecting_client(&client);
    timeout(WAIT, bus.ready()).await.unwrap().unwrap();

    let sent: Vec<Message> = [10usize, 0, 5000]
        .iter()
        .map(|&size| {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            Message::from_parts(vec![Bytes::from(payload), Bytes::from_static(b"tail")])
        })
        .collect();
    for message in &sent {
        bus.send(message.clone(), SendOptions::default()).unwrap();
    }

    for expected in &sent {
        let received = timeout(WAIT, replies.recv()).await.unwrap().unwrap();
        assert_eq!(received.parts(), expected.parts());
    }
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_acknowledged_send_resolves() {
    let dispatcher = dispatcher();
    let server = echo_server(ServerConfig::tcp(0), &dispatcher).await;
    let client = tcp_client(&server, &dispatcher, BusConfig::default());
    let bus = client.create_bus(ignore).unwrap();

    let delivered = bus
        .send(Message::single("ping"), SendOptions::acknowledged())
        .unwrap();
    timeout(WAIT, delivered).await.unwrap().unwrap();

    let statistics = bus.statistics();
    assert_eq!(statistics.pending_out_packets, 0);
    assert_eq!(statistics.pending_out_bytes, 0);
    assert_eq!(statistics.client_connections, 1);
    assert!(statistics.out_packets >= 1);
    assert!(statistics.in_packets >= 1);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_peer_close_fails_unacknowledged_send() {
    let dispatcher = dispatcher();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });

    let client = BusClient::new(
        ClientConfig::tcp(format!("127.0.0.1:{port}")),
        dispatcher.clone(),
    )
    .unwrap();
    let bus = client.create_bus(ignore).unwrap();
    let delivered = bus
        .send(Message::single("lost"), SendOptions::acknowledged())
        .unwrap();

    let error = timeout(WAIT, delivered).await.unwrap().unwrap_err();
    assert!(error.is_fatal(), "unexpected error: {error}");
    assert!(error.endpoint().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_oversized_part_is_rejected_without_terminating() {
    let dispatcher = dispatcher();
    let server = echo_server(ServerConfig::tcp(0), &dispatcher).await;
    let limits = BusConfig {
        max_message_part_size: 16,
        ..BusConfig::default()
    };
    let client = tcp_client(&server, &dispatcher, limits);
    let bus = client.create_bus(ignore).unwrap();
    timeout(WAIT, bus.ready()).await.unwrap().unwrap();

    let error = bus
        .send(Message::single(vec![0u8; 17]), SendOptions::acknowledged())
        .unwrap_err();
    assert!(error.is_validation());

    let delivered = bus
        .send(Message::single(vec![0u8; 16]), SendOptions::acknowledged())
        .unwrap();
    timeout(WAIT, delivered).await.unwrap().unwrap();
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connection_limit_drops_extra_peers() {
    let dispatcher = dispatcher();
    let server = echo_server(
        ServerConfig::tcp(0).with_max_simultaneous_connections(2),
        &dispatcher,
    )
    .await;
    let client = tcp_client(&server, &dispatcher, BusConfig::default());

    let mut buses = Vec::new();
    for _ in 0..2 {
        let bus = client.create_bus(ignore).unwrap();
        let delivered = bus
            .send(Message::single("hello"), SendOptions::acknowledged())
            .unwrap();
        timeout(WAIT, delivered).await.unwrap().unwrap();
        buses.push(bus);
    }
    assert_eq!(server.connection_count(), 2);

    let rejected = client.create_bus(ignore).unwrap();
    let delivered = rejected
        .send(Message::single("hello"), SendOptions::acknowledged())
        .unwrap();
    assert!(timeout(WAIT, delivered).await.unwrap().is_err());
    assert_eq!(server.connection_count(), 2);
    server.stop().await;
}

/// Accept one TCP peer and hand its stream to `serve`.
async fn raw_peer<F, Fut>(serve: F) -> u16
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            serve(stream).await;
        }
    });
    port
}

/// Decode every message packet the peer writes until it closes.
async fn decode_messages(mut stream: TcpStream, messages: mpsc::UnboundedSender<Message>) {
    let mut decoder = PacketDecoder::new(true);
    loop {
        let read = match stream.read(decoder.fragment()).await {
            Ok(0) | Err(_) => return,
            Ok(read) => read,
        };
        decoder.advance(read).unwrap();
        if decoder.is_finished() {
            let _ = messages.send(decoder.take_message());
            decoder.restart();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_network_connection_limit_drops_extra_peers() {
    let dispatcher = dispatcher();
    let config = ServerConfig::tcp(0)
        .with_network("loopback", ["127.0.0.0/8"])
        .with_network_limit("loopback", 1);
    let server = echo_server(config, &dispatcher).await;
    let client = tcp_client(&server, &dispatcher, BusConfig::default());

    let admitted = client.create_bus(ignore).unwrap();
    let delivered = admitted
        .send(Message::single("first"), SendOptions::acknowledged())
        .unwrap();
    timeout(WAIT, delivered).await.unwrap().unwrap();
    assert_eq!(server.network_connection_count("loopback"), 1);
    assert_eq!(server.network_connection_count("default"), 0);

    let rejected = client.create_bus(ignore).unwrap();
    let delivered = rejected
        .send(Message::single("second"), SendOptions::acknowledged())
        .unwrap();
    assert!(timeout(WAIT, delivered).await.unwrap().is_err());
    assert_eq!(server.network_connection_count("loopback"), 1);
    assert_eq!(server.connection_count(), 1);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unread_peer_triggers_write_stall() {
    let dispatcher = dispatcher();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let port = raw_peer(move |stream| async move {
        // Accept but never read, so the socket buffers fill up.
        let _ = stop_rx.await;
        drop(stream);
    })
    .await;

    let config = ClientConfig::tcp(format!("127.0.0.1:{port}")).with_bus(BusConfig {
        write_stall_timeout: Duration::from_millis(200),
        ..BusConfig::default()
    });
    let client = BusClient::new(config, dispatcher.clone()).unwrap();
    let bus = client.create_bus(ignore).unwrap();
    let part = Bytes::from(vec![0u8; 4 << 20]);
    let delivered = bus
        .send(Message::from_parts(vec![part; 16]), SendOptions::default())
        .unwrap();

    let error = timeout(WAIT, delivered).await.unwrap().unwrap_err();
    assert!(
        matches!(error.as_transport(), Some(TransportError::WriteStalled { .. })),
        "unexpected error: {error}"
    );
    assert_eq!(bus.statistics().stalled_writes, 1);
    assert_eq!(bus.statistics().stalled_reads, 0);
    let _ = stop_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_canceled_message_is_never_written() {
    let dispatcher = dispatcher();
    let (start_tx, start_rx) = oneshot::channel::<()>();
    let (messages_tx, mut messages) = mpsc::unbounded_channel();
    let port = raw_peer(move |stream| async move {
        // Hold off reading until the bulk message has clogged the socket.
        let _ = start_rx.await;
        decode_messages(stream, messages_tx).await;
    })
    .await;

    let client = BusClient::new(
        ClientConfig::tcp(format!("127.0.0.1:{port}")),
        dispatcher.clone(),
    )
    .unwrap();
    let bus = client.create_bus(ignore).unwrap();
    let part = Bytes::from(vec![7u8; 4 << 20]);
    let bulk = bus
        .send(Message::from_parts(vec![part; 8]), SendOptions::default())
        .unwrap();
    let withdrawn = bus
        .send(Message::single("withdrawn"), SendOptions::default().cancelable())
        .unwrap();

    assert!(withdrawn.cancel());
    assert!(matches!(withdrawn.await, Err(BusError::Canceled)));
    assert_eq!(bus.statistics().pending_out_packets, 1);

    let after = bus
        .send(Message::single("after"), SendOptions::default())
        .unwrap();
    let _ = start_tx.send(());
    timeout(WAIT, bulk).await.unwrap().unwrap();
    timeout(WAIT, after).await.unwrap().unwrap();

    let first = timeout(WAIT, messages.recv()).await.unwrap().unwrap();
    assert_eq!(first.part_count(), 8);
    let second = timeout(WAIT, messages.recv()).await.unwrap().unwrap();
    assert_eq!(second.parts(), &[Bytes::from_static(b"after")]);

    let statistics = bus.statistics();
    assert_eq!(statistics.pending_out_packets, 0);
    assert_eq!(statistics.pending_out_bytes, 0);
    assert_eq!(statistics.out_packets, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unexpected_ack_aborts_connection() {
    let dispatcher = dispatcher();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let port = raw_peer(move |mut stream| async move {
        let ack = PacketHeader::ack(PacketId::create()).to_bytes(true);
        let _ = stream.write_all(&ack).await;
        let _ = stop_rx.await;
    })
    .await;

    let client = BusClient::new(
        ClientConfig::tcp(format!("127.0.0.1:{port}")),
        dispatcher.clone(),
    )
    .unwrap();
    let bus = client.create_bus(ignore).unwrap();
    let (tx, rx) = oneshot::channel();
    bus.subscribe_terminated(Box::new(move |error: &BusError| {
        let _ = tx.send(error.clone());
    }));

    let error = timeout(WAIT, rx).await.unwrap().unwrap();
    assert!(
        matches!(error.as_transport(), Some(TransportError::UnexpectedAck { .. })),
        "unexpected error: {error}"
    );
    assert!(bus.state().is_terminal());
    let _ = stop_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mismatched_ack_fails_pending_send() {
    let dispatcher = dispatcher();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let port = raw_peer(move |mut stream| async move {
        // Wait for the message header, then acknowledge some other packet.
        let mut header = [0u8; PACKET_HEADER_SIZE];
        if stream.read_exact(&mut header).await.is_ok() {
            let ack = PacketHeader::ack(PacketId::create()).to_bytes(true);
            let _ = stream.write_all(&ack).await;
        }
        let _ = stop_rx.await;
    })
    .await;

    let client = BusClient::new(
        ClientConfig::tcp(format!("127.0.0.1:{port}")),
        dispatcher.clone(),
    )
    .unwrap();
    let bus = client.create_bus(ignore).unwrap();
    let delivered = bus
        .send(Message::single("ping"), SendOptions::acknowledged())
        .unwrap();
    let expected = delivered.packet_id();

    let error = timeout(WAIT, delivered).await.unwrap().unwrap_err();
    match error.as_transport() {
        Some(TransportError::AckMismatch { expected: id, .. }) => assert_eq!(*id, expected),
        _ => panic!("unexpected error: {error}"),
    }
    let _ = stop_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_silent_peer_triggers_read_stall() {
    let dispatcher = dispatcher();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let accepted = listener.accept().await;
        // Hold the socket open without ever replying.
        let _ = stop_rx.await;
        drop(accepted);
    });

    let config = ClientConfig::tcp(format!("127.0.0.1:{port}")).with_bus(BusConfig {
        read_stall_timeout: Duration::from_millis(200),
        ..BusConfig::default()
    });
    let client = BusClient::new(config, dispatcher.clone()).unwrap();
    let bus = client.create_bus(ignore).unwrap();
    let delivered = bus
        .send(Message::single("anyone?"), SendOptions::acknowledged())
        .unwrap();

    let error = timeout(WAIT, delivered).await.unwrap().unwrap_err();
    assert!(
        matches!(error.as_transport(), Some(TransportError::ReadStalled { .. })),
        "unexpected error: {error}"
    );
    assert_eq!(bus.statistics().stalled_reads, 1);
    assert_eq!(bus.statistics().stalled_writes, 0);
    let _ = stop_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_terminate_fires_callback_once() {
    let dispatcher = dispatcher();
    let server = echo_server(ServerConfig::tcp(0), &dispatcher).await;
    let client = tcp_client(&server, &dispatcher, BusConfig::default());
    let bus = Arc::new(client.create_bus(ignore).unwrap());
    timeout(WAIT, bus.ready()).await.unwrap().unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = oneshot::channel();
    {
        let fired = Arc::clone(&fired);
        bus.subscribe_terminated(Box::new(move |error: &BusError| {
            fired.fetch_add(1, Ordering::SeqCst);
            let _ = done_tx.send(error.to_string());
        }));
    }

    let threads: Vec<_> = (0..8)
        .map(|i| {
            let bus = Arc::clone(&bus);
            std::thread::spawn(move || {
                bus.terminate(TransportError::terminated_with(format!("terminator {i}")).into());
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    let reason = timeout(WAIT, done_rx).await.unwrap().unwrap();
    assert!(reason.starts_with("terminator "), "unexpected reason: {reason}");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_networking_disabled_rejects_new_buses() {
    let dispatcher = dispatcher();
    let server = echo_server(ServerConfig::tcp(0), &dispatcher).await;
    let client = tcp_client(&server, &dispatcher, BusConfig::default());

    dispatcher.disable_networking();
    let error = client.create_bus(ignore).unwrap_err();
    assert!(matches!(
        error.as_transport(),
        Some(TransportError::NetworkingDisabled { .. })
    ));
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unix_domain_socket_round_trip() {
    let dispatcher = dispatcher();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus.sock");

    let server = echo_server(ServerConfig::unix_domain(&path), &dispatcher).await;
    let client = BusClient::new(ClientConfig::unix_domain(&path), dispatcher.clone()).unwrap();
    let (bus, mut replies) = collecting_client(&client);
    timeout(WAIT, bus.ready()).await.unwrap().unwrap();

    assert_eq!(bus.network_name(), "local");
    assert_eq!(bus.unix_domain_socket_path(), Some(path.as_path()));

    bus.send(Message::single("over unix"), SendOptions::default())
        .unwrap();
    let reply = timeout(WAIT, replies.recv()).await.unwrap().unwrap();
    assert_eq!(reply.parts(), &[Bytes::from_static(b"over unix")]);
    assert_eq!(server.network_connection_count("local"), 1);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tcp_server_also_listens_locally() {
    let dispatcher = dispatcher();
    let server = echo_server(ServerConfig::tcp(0), &dispatcher).await;
    let port = server.local_addr().unwrap().port();
    let path = local_bus_path(port);
    assert!(path.exists());

    let config = ClientConfig::tcp(format!("127.0.0.1:{port}")).prefer_local_socket();
    let client = BusClient::new(config, dispatcher.clone()).unwrap();
    let (bus, mut replies) = collecting_client(&client);
    timeout(WAIT, bus.ready()).await.unwrap().unwrap();
    assert_eq!(bus.network_name(), "local");
    assert_eq!(bus.unix_domain_socket_path(), Some(path.as_path()));

    bus.send(Message::single("nearby"), SendOptions::default())
        .unwrap();
    let reply = timeout(WAIT, replies.recv()).await.unwrap().unwrap();
    assert_eq!(reply.parts(), &[Bytes::from_static(b"nearby")]);

    let direct = BusClient::new(ClientConfig::local(port), dispatcher.clone()).unwrap();
    let bus = direct.create_bus(ignore).unwrap();
    let delivered = bus
        .send(Message::single("direct"), SendOptions::acknowledged())
        .unwrap();
    timeout(WAIT, delivered).await.unwrap().unwrap();
    assert_eq!(server.network_connection_count("local"), 2);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_socket_can_be_disabled() {
    let dispatcher = dispatcher();
    let server = echo_server(ServerConfig::tcp(0).with_local_socket(false), &dispatcher).await;
    let port = server.local_addr().unwrap().port();
    assert!(!local_bus_path(port).exists());

    let config = ClientConfig::tcp(format!("127.0.0.1:{port}")).prefer_local_socket();
    let client = BusClient::new(config, dispatcher.clone()).unwrap();
    let bus = client.create_bus(ignore).unwrap();
    let delivered = bus
        .send(Message::single("tcp"), SendOptions::acknowledged())
        .unwrap();
    timeout(WAIT, delivered).await.unwrap().unwrap();
    assert_eq!(bus.network_name(), "default");
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_server_stop_terminates_clients() {
    let dispatcher = dispatcher();
    let server = echo_server(ServerConfig::tcp(0), &dispatcher).await;
    let client = tcp_client(&server, &dispatcher, BusConfig::default());
    let bus = client.create_bus(ignore).unwrap();
    let delivered = bus
        .send(Message::single("hello"), SendOptions::acknowledged())
        .unwrap();
    timeout(WAIT, delivered).await.unwrap().unwrap();

    let (tx, rx) = oneshot::channel();
    bus.subscribe_terminated(Box::new(move |error: &BusError| {
        let _ = tx.send(error.is_fatal());
    }));

    server.stop().await;
    assert!(timeout(WAIT, rx).await.unwrap().unwrap());
    assert!(bus.state().is_terminal());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dispatcher_statistics_per_network() {
    let dispatcher = dispatcher();
    let server = echo_server(ServerConfig::tcp(0), &dispatcher).await;
    let client = tcp_client(&server, &dispatcher, BusConfig::default());
    let bus = client.create_bus(ignore).unwrap();
    let delivered = bus
        .send(Message::single("counted"), SendOptions::acknowledged())
        .unwrap();
    timeout(WAIT, delivered).await.unwrap().unwrap();

    let statistics = dispatcher.statistics("default");
    assert_eq!(statistics.client_connections, 1);
    assert_eq!(statistics.server_connections, 1);
    assert!(statistics.out_bytes > 0);
    assert!(statistics.in_bytes > 0);
    assert!(dispatcher.network_statistics().contains_key("default"));
    server.stop().await;
}

//! Integration tests for botlink.
//!
//! These exercise the full engine over real loopback TCP: a scripted peer
//! stands in for the robot, decoding requests with the same wire codec and
//! answering them, fragmented and batched like a real stream would be.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use botlink::protocol::{encode_packets, FrameBuffer};
use botlink::{
    AsyncRequestCommand, CommandRegistry, CommandSender, Connection, ConnectionEvent,
    ConnectionState, Packet, PacketParam,
};

/// Install a log subscriber once; `RUST_LOG` controls verbosity.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Read exactly one packet from the peer side of the socket.
async fn read_one_packet(stream: &mut TcpStream, registry: &Arc<CommandRegistry>) -> Packet {
    let mut frames = FrameBuffer::new(registry.clone());
    let mut buf = vec![0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "peer closed before a full packet arrived");
        let (mut packets, err) = frames.push(&buf[..n]);
        assert!(err.is_none(), "peer failed to decode request: {err:?}");
        if let Some(packet) = packets.pop() {
            return packet;
        }
    }
}

/// Poll until `check` passes or two seconds elapse.
async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition did not become true within two seconds");
}

#[tokio::test]
async fn test_request_response_roundtrip_over_tcp() {
    init_tracing();
    let registry = CommandRegistry::new();
    let echo = registry.register("ECHO").unwrap();

    let recorded: Arc<parking_lot::Mutex<Vec<(Packet, Vec<Packet>)>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = recorded.clone();
    echo.set_response_handler(move |request, responses| {
        let sink = sink.clone();
        async move {
            sink.lock().push((request, responses));
        }
    })
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connection = Connection::new(registry.clone(), &addr.ip().to_string(), addr.port());
    let sender = CommandSender::new(connection, registry.clone());

    sender.connect().await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();

    let id = sender
        .make_request(&echo, [PacketParam::Str("hi".to_string())], true)
        .await
        .unwrap();

    // The peer sees the request exactly as sent.
    let request = read_one_packet(&mut peer, &registry).await;
    assert!(request.is_request());
    assert_eq!(request.request_id, id);
    assert_eq!(request.params, vec![PacketParam::Str("hi".to_string())]);

    // Answer it, split across two writes to force reassembly.
    let response = Packet::response(echo.clone(), id, [PacketParam::Str("hi".to_string())]);
    let bytes = encode_packets(std::slice::from_ref(&response));
    let cut = bytes.len() / 2;
    peer.write_all(&bytes[..cut]).await.unwrap();
    peer.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    peer.write_all(&bytes[cut..]).await.unwrap();
    peer.flush().await.unwrap();

    wait_until(|| !recorded.lock().is_empty()).await;
    let calls = recorded.lock();
    assert_eq!(calls.len(), 1);
    let (seen_request, seen_responses) = &calls[0];
    assert_eq!(seen_request.request_id, id);
    assert_eq!(seen_responses, &vec![response]);
}

#[tokio::test]
async fn test_async_request_with_keep_alive() {
    init_tracing();
    let registry = CommandRegistry::new();
    let logs = registry.register("LOGS").unwrap();
    let fetch_logs: AsyncRequestCommand<(String, Option<i32>), Vec<String>> =
        AsyncRequestCommand::new(logs).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connection = Connection::new(registry.clone(), &addr.ip().to_string(), addr.port());
    let sender = CommandSender::new(connection, registry.clone());
    sender.connect().await.unwrap();

    let peer_registry = registry.clone();
    let peer = tokio::spawn(async move {
        let (mut peer, _) = listener.accept().await.unwrap();
        let request = read_one_packet(&mut peer, &peer_registry).await;
        // Absent optional count arg was omitted on the wire.
        assert_eq!(
            request.params,
            vec![PacketParam::Str("drive".to_string())]
        );

        // Stall with a keep-alive before the real answer.
        let keep_alive = Packet::response(
            peer_registry.keep_alive(),
            request.request_id,
            Vec::<PacketParam>::new(),
        );
        peer.write_all(&encode_packets(&[keep_alive])).await.unwrap();
        peer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let response = Packet::response(
            peer_registry.find("LOGS").unwrap(),
            request.request_id,
            [
                PacketParam::Str("line one".to_string()),
                PacketParam::Str("line two".to_string()),
            ],
        );
        peer.write_all(&encode_packets(&[response])).await.unwrap();
        peer.flush().await.unwrap();
        peer
    });

    let lines = fetch_logs
        .request(&sender, ("drive".to_string(), None))
        .await
        .unwrap();
    assert_eq!(lines, vec!["line one".to_string(), "line two".to_string()]);

    // Keep the peer socket alive until the exchange is done.
    drop(peer.await.unwrap());
}

#[tokio::test]
async fn test_batched_requests_arrive_in_order() {
    init_tracing();
    let registry = CommandRegistry::new();
    let echo = registry.register("ECHO").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connection = Connection::new(registry.clone(), &addr.ip().to_string(), addr.port());
    let sender = CommandSender::new(connection, registry.clone());
    sender.connect().await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            sender
                .make_request(&echo, [PacketParam::Int(i)], false)
                .await
                .unwrap(),
        );
    }
    sender.send().await.unwrap();

    // The flush coalesces all five requests into one write, so decode the
    // whole batch with a single frame buffer to keep wire order.
    let mut frames = FrameBuffer::new(registry.clone());
    let mut requests = Vec::new();
    let mut buf = vec![0u8; 1024];
    while requests.len() < ids.len() {
        let n = peer.read(&mut buf).await.unwrap();
        assert!(n > 0, "peer closed before all requests arrived");
        let (mut packets, err) = frames.push(&buf[..n]);
        assert!(err.is_none(), "peer failed to decode request: {err:?}");
        requests.append(&mut packets);
    }

    for (i, (expected_id, request)) in ids.into_iter().zip(requests).enumerate() {
        assert_eq!(request.request_id, expected_id);
        assert_eq!(request.params, vec![PacketParam::Int(i as i32)]);
    }
}

#[tokio::test]
async fn test_unknown_command_from_peer_is_terminal() {
    init_tracing();
    let registry = CommandRegistry::new();
    registry.register("ECHO").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connection = Connection::new(registry.clone(), &addr.ip().to_string(), addr.port());

    connection.connect().await.unwrap();
    let mut events = connection.subscribe_events();
    let (mut peer, _) = listener.accept().await.unwrap();

    // A syntactically complete packet for a command the registry has never
    // seen: '>' + "NOPE" + request id + zero params.
    let mut bytes = vec![b'>'];
    bytes.extend_from_slice(b"NOPE");
    bytes.extend_from_slice(&1i32.to_be_bytes());
    bytes.extend_from_slice(&0i32.to_be_bytes());
    peer.write_all(&bytes).await.unwrap();
    peer.flush().await.unwrap();

    let mut saw_lost = false;
    loop {
        match events.recv().await.unwrap() {
            ConnectionEvent::Lost(reason) => {
                assert!(reason.contains("NOPE"));
                saw_lost = true;
            }
            ConnectionEvent::StateChanged(ConnectionState::Closed) => break,
            ConnectionEvent::StateChanged(_) => {}
        }
    }
    assert!(saw_lost);
    assert_eq!(connection.state().await, ConnectionState::Closed);
}

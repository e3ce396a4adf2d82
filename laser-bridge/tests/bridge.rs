//! End-to-end tests: TCP clients on one side, a scripted UDP controller on
//! the other, both on loopback.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use laser_bridge::codec::{build_datagram, control, scramble_all, DEFAULT_MAGIC};
use laser_bridge::config::crate_version;
use laser_bridge::link::LinkSnapshot;
use laser_bridge::session::Health;
use laser_bridge::state::LinkState;
use laser_bridge::{Bridge, BridgeConfig, LogStatus, TimerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(3);
const QUIET: Duration = Duration::from_millis(150);

// ----- Harness -----

struct Harness {
    controller: Controller,
    tcp: SocketAddr,
    health_addr: Option<SocketAddr>,
    health: watch::Receiver<Health>,
    link: watch::Receiver<LinkSnapshot>,
    shutdown: CancellationToken,
    run: JoinHandle<Result<(), laser_bridge::BridgeError>>,
}

struct Controller {
    socket: UdpSocket,
    reply_to: SocketAddr,
}

impl Controller {
    /// Next datagram of any kind.
    async fn recv(&self) -> Vec<u8> {
        let mut buf = [0u8; 2048];
        let (n, _) = timeout(WAIT, self.socket.recv_from(&mut buf))
            .await
            .expect("controller received nothing")
            .unwrap();
        buf[..n].to_vec()
    }

    /// Next data datagram; single-byte control datagrams are skipped.
    async fn recv_data(&self) -> Vec<u8> {
        loop {
            let d = self.recv().await;
            if d.len() > 1 {
                return d;
            }
        }
    }

    /// Assert no data datagram arrives for a short while.
    async fn assert_no_data(&self) {
        let mut buf = [0u8; 2048];
        let deadline = tokio::time::Instant::now() + QUIET;
        loop {
            match tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                Err(_) => return,
                Ok(Ok((n, _))) => assert!(n <= 1, "unexpected {n}-byte datagram"),
                Ok(Err(e)) => panic!("controller socket: {e}"),
            }
        }
    }

    async fn send(&self, bytes: &[u8]) {
        self.socket.send_to(bytes, self.reply_to).await.unwrap();
    }
}

async fn start(tweak: impl FnOnce(&mut BridgeConfig)) -> Harness {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut config = BridgeConfig {
        tcp_listen: "127.0.0.1:0".parse().unwrap(),
        controller: socket.local_addr().unwrap(),
        udp_inbound_port: 0,
        timers: TimerConfig::fast(),
        ..BridgeConfig::default()
    };
    tweak(&mut config);

    let bridge = Bridge::bind(config, Arc::new(LogStatus)).await.unwrap();
    let reply_to = SocketAddr::from(([127, 0, 0, 1], bridge.inbound_addr().port()));
    let tcp = bridge.local_addr();
    let health_addr = bridge.health_addr();
    let health = bridge.health();
    let link = bridge.link();
    let shutdown = bridge.shutdown_token();
    let run = tokio::spawn(bridge.run());

    Harness {
        controller: Controller { socket, reply_to },
        tcp,
        health_addr,
        health,
        link,
        shutdown,
        run,
    }
}

/// Bridge whose controller has acknowledged the handshake.
async fn connected() -> Harness {
    let mut h = start(|_| {}).await;
    assert_eq!(h.controller.recv().await, vec![control::CONNECT]);
    h.controller.send(&[control::HANDSHAKE_ACK]).await;
    timeout(WAIT, h.link.wait_for(|s| s.state == LinkState::Connected))
        .await
        .unwrap()
        .unwrap();
    h
}

fn envelope(payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x4C];
    out.extend((payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn on_wire(payload: &[u8]) -> Vec<u8> {
    build_datagram(&scramble_all(payload, DEFAULT_MAGIC))
}

async fn read_exact(client: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    timeout(WAIT, client.read_exact(&mut buf))
        .await
        .expect("client received nothing")
        .unwrap();
    buf
}

async fn assert_closed(client: &mut TcpStream) {
    let mut buf = [0u8; 16];
    let r = timeout(WAIT, client.read(&mut buf))
        .await
        .expect("connection stayed open");
    assert!(matches!(r, Ok(0) | Err(_)), "expected close, got {r:?}");
}

async fn wait_health(h: &mut Harness, pred: impl FnMut(&Health) -> bool) {
    timeout(WAIT, h.health.wait_for(pred))
        .await
        .expect("health never matched")
        .unwrap();
}

// ----- Tests -----

#[tokio::test]
async fn data_is_scrambled_checksummed_and_gated_on_ack() {
    let h = connected().await;
    let mut client = TcpStream::connect(h.tcp).await.unwrap();

    let first = [0xC6, 0x01, 0x10, 0x00];
    let second = [0x01, 0x02];
    let mut bytes = envelope(&first);
    bytes.extend(envelope(&second));
    client.write_all(&bytes).await.unwrap();

    assert_eq!(h.controller.recv_data().await, on_wire(&first));
    h.controller.assert_no_data().await;

    h.controller.send(&[control::SUCCESS]).await;
    assert_eq!(h.controller.recv_data().await, on_wire(&second));
}

#[tokio::test]
async fn envelope_split_across_reads_is_forwarded_once() {
    let h = connected().await;
    let mut client = TcpStream::connect(h.tcp).await.unwrap();
    let bytes = [0x4C, 0x00, 0x04, 0xC6, 0x01, 0x10, 0x00];

    for chunk in [&bytes[..1], &bytes[1..4], &bytes[4..]] {
        client.write_all(chunk).await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        h.controller.recv_data().await,
        on_wire(&[0xC6, 0x01, 0x10, 0x00])
    );
}

#[tokio::test]
async fn ping_is_answered_locally() {
    let h = connected().await;
    let mut client = TcpStream::connect(h.tcp).await.unwrap();
    client.write_all(&[0x50, 0x00, 0x00]).await.unwrap();

    let (major, minor) = crate_version();
    assert_eq!(read_exact(&mut client, 5).await, vec![0x50, 0x00, 0x02, major, minor]);
    h.controller.assert_no_data().await;
}

#[tokio::test]
async fn controller_response_is_relayed_as_data_envelope() {
    let h = connected().await;
    let mut client = TcpStream::connect(h.tcp).await.unwrap();
    client.write_all(&envelope(&[0x10])).await.unwrap();
    h.controller.recv_data().await;

    h.controller.send(&build_datagram(&[0xDA, 0x01])).await;
    assert_eq!(read_exact(&mut client, 5).await, vec![0x4C, 0x00, 0x02, 0xDA, 0x01]);

    // The response released the gate.
    client.write_all(&envelope(&[0x11])).await.unwrap();
    assert_eq!(h.controller.recv_data().await, on_wire(&[0x11]));
}

#[tokio::test]
async fn second_client_waits_until_first_disconnects() {
    let mut h = connected().await;
    let mut a = TcpStream::connect(h.tcp).await.unwrap();
    wait_health(&mut h, |s| s.active_session_present).await;
    let mut b = TcpStream::connect(h.tcp).await.unwrap();
    wait_health(&mut h, |s| s.queue_depth == 1).await;

    b.write_all(&envelope(b"from-b")).await.unwrap();
    // A ping behind queued Data is held with it.
    b.write_all(&[0x50, 0x00, 0x00]).await.unwrap();
    a.write_all(&envelope(b"from-a")).await.unwrap();

    assert_eq!(h.controller.recv_data().await, on_wire(b"from-a"));
    h.controller.send(&[control::SUCCESS]).await;
    h.controller.assert_no_data().await;
    assert_eq!(h.health.borrow().queue_depth, 1);

    drop(a);
    assert_eq!(h.controller.recv_data().await, on_wire(b"from-b"));
    wait_health(&mut h, |s| s.queue_depth == 0 && s.is_active_session_busy).await;

    let (major, minor) = crate_version();
    h.controller.send(&[control::SUCCESS]).await;
    assert_eq!(read_exact(&mut b, 5).await, vec![0x50, 0x00, 0x02, major, minor]);
}

#[tokio::test]
async fn unanswered_transmission_times_out_the_session() {
    let h = connected().await;
    let mut client = TcpStream::connect(h.tcp).await.unwrap();
    client.write_all(&envelope(b"stuck")).await.unwrap();
    h.controller.recv_data().await;

    assert_closed(&mut client).await;

    // The link is free again for the next client.
    let mut next = TcpStream::connect(h.tcp).await.unwrap();
    next.write_all(&envelope(b"next")).await.unwrap();
    assert_eq!(h.controller.recv_data().await, on_wire(b"next"));
}

#[tokio::test]
async fn malformed_envelope_drops_the_connection() {
    let h = start(|c| c.max_envelope_payload = 16).await;
    let mut client = TcpStream::connect(h.tcp).await.unwrap();
    client.write_all(&[0x4C, 0x00, 0x20]).await.unwrap();
    assert_closed(&mut client).await;
}

#[tokio::test]
async fn empty_data_envelope_is_relayed() {
    let h = connected().await;
    let mut client = TcpStream::connect(h.tcp).await.unwrap();
    let mut bytes = envelope(b"");
    bytes.extend(envelope(b"after"));
    client.write_all(&bytes).await.unwrap();

    assert_eq!(h.controller.recv_data().await, on_wire(b""));
    h.controller.send(&[control::SUCCESS]).await;
    assert_eq!(h.controller.recv_data().await, on_wire(b"after"));
}

#[tokio::test]
async fn client_streaming_ahead_of_acks_keeps_order() {
    let h = start(|c| {
        c.max_envelope_payload = 512;
        c.link.handshake = false;
        c.link.keepalive = false;
    })
    .await;
    let mut client = TcpStream::connect(h.tcp).await.unwrap();

    let payloads: Vec<Vec<u8>> = (0..64u8).map(|i| vec![i; 512]).collect();
    let mut stream = Vec::new();
    for p in &payloads {
        stream.extend(envelope(p));
    }
    let (_read, mut write) = client.into_split();
    let writer = tokio::spawn(async move { write.write_all(&stream).await });

    for p in &payloads {
        assert_eq!(h.controller.recv_data().await, on_wire(p));
        h.controller.send(&[control::SUCCESS]).await;
    }
    timeout(WAIT, writer).await.unwrap().unwrap().unwrap();
    h.controller.assert_no_data().await;
}

#[tokio::test]
async fn error_ack_retries_then_success_continues() {
    let h = connected().await;
    let mut client = TcpStream::connect(h.tcp).await.unwrap();
    let mut bytes = envelope(b"one");
    bytes.extend(envelope(b"two"));
    client.write_all(&bytes).await.unwrap();

    let original = h.controller.recv_data().await;
    h.controller.send(&[control::ERROR]).await;
    assert_eq!(h.controller.recv_data().await, original);
    h.controller.send(&[control::SUCCESS]).await;
    assert_eq!(h.controller.recv_data().await, on_wire(b"two"));
}

#[tokio::test]
async fn silent_controller_degrades_but_still_carries_data() {
    let mut h = start(|_| {}).await;
    timeout(WAIT, h.link.wait_for(|s| s.state == LinkState::Degraded))
        .await
        .unwrap()
        .unwrap();

    let mut client = TcpStream::connect(h.tcp).await.unwrap();
    client.write_all(&envelope(b"burn")).await.unwrap();
    assert_eq!(h.controller.recv_data().await, on_wire(b"burn"));

    h.controller.send(&[control::SUCCESS]).await;
    timeout(WAIT, h.link.wait_for(|s| s.state == LinkState::Connected))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn data_sent_during_handshake_goes_out_once_connected() {
    let h = start(|c| c.timers.handshake_retry = Duration::from_secs(5)).await;
    assert_eq!(h.controller.recv().await, vec![control::CONNECT]);

    let mut client = TcpStream::connect(h.tcp).await.unwrap();
    client.write_all(&envelope(b"early")).await.unwrap();
    h.controller.assert_no_data().await;

    h.controller.send(&[control::HANDSHAKE_ACK]).await;
    assert_eq!(h.controller.recv_data().await, on_wire(b"early"));
}

#[tokio::test]
async fn shutdown_disconnects_controller_and_clients() {
    let h = connected().await;
    let mut client = TcpStream::connect(h.tcp).await.unwrap();
    client.write_all(&[0x50, 0x00, 0x00]).await.unwrap();
    read_exact(&mut client, 5).await;

    h.shutdown.cancel();
    loop {
        if h.controller.recv().await == [control::DISCONNECT] {
            break;
        }
    }
    assert_closed(&mut client).await;
    assert!(timeout(WAIT, h.run).await.unwrap().unwrap().is_ok());
}

#[tokio::test]
async fn health_endpoint_serves_snapshot() {
    let h = start(|c| c.health_listen = Some("127.0.0.1:0".parse().unwrap())).await;
    let addr = h.health_addr.expect("health endpoint enabled");

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut body = String::new();
    timeout(WAIT, stream.read_to_string(&mut body))
        .await
        .unwrap()
        .unwrap();
    assert!(body.starts_with("HTTP/1.1 200"), "{body}");
    assert!(body.contains("\"queueDepth\":0"), "{body}");
    assert!(body.contains("\"link\""), "{body}");
    h.shutdown.cancel();
}

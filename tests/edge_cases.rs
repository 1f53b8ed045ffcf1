#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Edge-case tests against a live server driven by a raw UDP peer
//! Covers hostile input, handshakes in clear, duplicate events and unready transports

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use datagram_protocol::config::{ServerConfig, TransportConfig};
use datagram_protocol::error::ProtocolError;
use datagram_protocol::protocol::message::{Connect, Key, Ping};
use datagram_protocol::service::server::KEY_CACHE_HEADROOM;
use datagram_protocol::service::{ClientInfo, Server, ServerListener};
use datagram_protocol::transport::Transport;
use datagram_protocol::utils::crypto::{default_cipher, Cipher, SealedBox};
use datagram_protocol::{application_events, frame, unframe, wire_struct, Message};
use tokio::net::UdpSocket;
use tokio::time::timeout;

wire_struct! {
    #[derive(Debug, Clone, PartialEq)]
    pub struct Shout {
        pub text: String,
    }
}

application_events! {
    #[derive(Debug, Clone, PartialEq)]
    pub enum Room {
        Shout(Shout) = 3,
    }
}

#[derive(Default)]
struct Heard {
    events: Mutex<Vec<(i32, Room)>>,
}

impl ServerListener<Room> for Heard {
    fn on_event(&self, client: &ClientInfo, event: Room) {
        self.events.lock().unwrap().push((client.id, event));
    }
}

fn transport_config() -> TransportConfig {
    TransportConfig {
        receive_timeout: Duration::from_millis(20),
        ..TransportConfig::default()
    }
}

async fn server(listener: Arc<Heard>) -> (Server<Room>, SocketAddr) {
    let config = ServerConfig {
        address: "127.0.0.1:0".into(),
        connection_timeout: Duration::from_secs(5),
        max_connections: 8,
        poll_interval: Duration::from_millis(20),
    };
    let server: Server<Room> = Server::bind(config, &transport_config(), listener).await.unwrap();
    server.start();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

async fn raw_peer() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn send(socket: &UdpSocket, to: SocketAddr, message: Message<Room>) {
    socket.send_to(&frame(&message), to).await.unwrap();
}

/// Next datagram decoded as plaintext, within one second
async fn recv(socket: &UdpSocket) -> Option<Message<Room>> {
    let mut buf = vec![0u8; 65_535];
    let (len, _) = timeout(Duration::from_secs(1), socket.recv_from(&mut buf))
        .await
        .ok()?
        .ok()?;
    unframe::<Room>(&buf[..len])
}

async fn wait_until<F: Fn() -> bool>(check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

// ============================================================================
// HANDSHAKE IN CLEAR
// ============================================================================

#[tokio::test]
async fn test_key_request_is_answered_in_clear() {
    let (server, addr) = server(Arc::default()).await;
    let peer = raw_peer().await;

    send(
        &peer,
        addr,
        Message::from(Key {
            request_key: true,
            key: None,
        }),
    )
    .await;

    match recv(&peer).await {
        Some(Message::Key(key)) => {
            assert!(!key.request_key);
            assert_eq!(key.key.as_ref(), Some(server.public_key()));
        }
        other => panic!("expected server key, got {other:?}"),
    }
    server.stop().await;
}

#[tokio::test]
async fn test_connect_without_key_is_accepted_in_clear() {
    let (server, addr) = server(Arc::default()).await;
    let peer = raw_peer().await;

    send(&peer, addr, Message::from(Connect { name: "raw".into() })).await;
    match recv(&peer).await {
        Some(Message::AcceptConnection(accept)) => assert_eq!(accept.client_id, 1),
        other => panic!("expected accept, got {other:?}"),
    }
    assert_eq!(server.client_count(), 1);

    // a repeated connect is acknowledged with the same id
    send(&peer, addr, Message::from(Connect { name: "raw".into() })).await;
    match recv(&peer).await {
        Some(Message::AcceptConnection(accept)) => assert_eq!(accept.client_id, 1),
        other => panic!("expected accept, got {other:?}"),
    }
    assert_eq!(server.client_count(), 1);
    server.stop().await;
}

#[tokio::test]
async fn test_replies_are_sealed_once_peer_key_is_known() {
    let (server, addr) = server(Arc::default()).await;
    let peer = raw_peer().await;
    let keys = SealedBox.generate_keypair().unwrap();

    send(
        &peer,
        addr,
        Message::from(Key {
            request_key: false,
            key: Some(keys.public.clone()),
        }),
    )
    .await;
    send(&peer, addr, Message::from(Connect { name: "sealed".into() })).await;

    let mut buf = vec![0u8; 65_535];
    let (len, _) = timeout(Duration::from_secs(1), peer.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let opened = SealedBox.decrypt(&keys.private, &buf[..len]).unwrap();
    assert!(matches!(
        unframe::<Room>(&opened),
        Some(Message::AcceptConnection(_))
    ));
    server.stop().await;
}

// ============================================================================
// HOSTILE INPUT
// ============================================================================

#[tokio::test]
async fn test_key_cache_is_bounded_for_unconnected_peers() {
    let (server, addr) = server(Arc::default()).await;
    let limit = 8 + KEY_CACHE_HEADROOM;

    // a fresh source port per key, none of which ever connects
    let mut strays = Vec::new();
    for _ in 0..limit + 20 {
        let stray = raw_peer().await;
        let keys = SealedBox.generate_keypair().unwrap();
        send(
            &stray,
            addr,
            Message::from(Key {
                request_key: false,
                key: Some(keys.public.clone()),
            }),
        )
        .await;
        strays.push(stray);
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(server.cached_keys() > 0);
    assert!(server.cached_keys() <= limit);

    // a connected peer keeps its key through eviction
    let peer = raw_peer().await;
    let keys = SealedBox.generate_keypair().unwrap();
    send(
        &peer,
        addr,
        Message::from(Key {
            request_key: false,
            key: Some(keys.public.clone()),
        }),
    )
    .await;
    send(&peer, addr, Message::from(Connect { name: "kept".into() })).await;
    let mut buf = vec![0u8; 65_535];
    let (len, _) = timeout(Duration::from_secs(1), peer.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert!(SealedBox.decrypt(&keys.private, &buf[..len]).is_ok());

    for stray in &strays {
        send(
            stray,
            addr,
            Message::from(Key {
                request_key: false,
                key: Some(keys.public.clone()),
            }),
        )
        .await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(server.cached_keys() <= limit);

    // the connected peer's replies are still sealed
    send(
        &peer,
        addr,
        Message::from(Ping {
            timestamp: 9,
            should_return: true,
        }),
    )
    .await;
    let (len, _) = timeout(Duration::from_secs(1), peer.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert!(SealedBox.decrypt(&keys.private, &buf[..len]).is_ok());
    server.stop().await;
}

#[tokio::test]
async fn test_garbage_datagrams_are_ignored() {
    let heard = Arc::new(Heard::default());
    let (server, addr) = server(heard.clone()).await;
    let peer = raw_peer().await;

    let junk: Vec<Vec<u8>> = vec![
        vec![],
        vec![0xFF],
        vec![0, 0, 0, 99, 0, 0, 0, 0],
        vec![0xAB; 200],
        // looks like a sealed box but was never sealed
        vec![7u8; 32 + 24 + 16 + 40],
    ];
    for bytes in &junk {
        peer.send_to(bytes, addr).await.unwrap();
    }

    // the server is still healthy and answers a real handshake
    send(&peer, addr, Message::from(Connect { name: "after".into() })).await;
    assert!(matches!(
        recv(&peer).await,
        Some(Message::AcceptConnection(_))
    ));
    assert!(heard.events.lock().unwrap().is_empty());
    server.stop().await;
}

#[tokio::test]
async fn test_corrupted_ciphertext_is_dropped() {
    let heard = Arc::new(Heard::default());
    let (server, addr) = server(heard.clone()).await;
    let peer = raw_peer().await;

    send(&peer, addr, Message::from(Connect { name: "tamper".into() })).await;
    recv(&peer).await.unwrap();

    let event = frame(&Message::event(0, Room::from(Shout { text: "hi".into() })));
    let mut sealed = default_cipher().encrypt(server.public_key(), &event).unwrap();
    sealed[60] ^= 0x55;
    peer.send_to(&sealed, addr).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(heard.events.lock().unwrap().is_empty());
    assert_eq!(server.client_count(), 1);
    server.stop().await;
}

#[tokio::test]
async fn test_events_from_unknown_peer_are_dropped() {
    let heard = Arc::new(Heard::default());
    let (server, addr) = server(heard.clone()).await;
    let stranger = raw_peer().await;

    send(
        &stranger,
        addr,
        Message::event(0, Room::from(Shout { text: "let me in".into() })),
    )
    .await;

    assert!(recv(&stranger).await.is_none());
    assert!(heard.events.lock().unwrap().is_empty());
    assert_eq!(server.client_count(), 0);
    server.stop().await;
}

// ============================================================================
// SESSION TRAFFIC
// ============================================================================

#[tokio::test]
async fn test_duplicate_event_confirmed_but_delivered_once() {
    let heard = Arc::new(Heard::default());
    let (server, addr) = server(heard.clone()).await;
    let peer = raw_peer().await;

    send(&peer, addr, Message::from(Connect { name: "dup".into() })).await;
    recv(&peer).await.unwrap();

    let event = Message::event(0, Room::from(Shout { text: "echo".into() }));
    for _ in 0..2 {
        send(&peer, addr, event.clone()).await;
        assert_eq!(recv(&peer).await, Some(Message::confirmation(0)));
    }

    wait_until(|| !heard.events.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(heard.events.lock().unwrap().len(), 1);
    server.stop().await;
}

#[tokio::test]
async fn test_ping_is_echoed_with_original_timestamp() {
    let (server, addr) = server(Arc::default()).await;
    let peer = raw_peer().await;

    send(&peer, addr, Message::from(Connect { name: "pinger".into() })).await;
    recv(&peer).await.unwrap();

    send(
        &peer,
        addr,
        Message::from(Ping {
            timestamp: 123_456,
            should_return: true,
        }),
    )
    .await;
    assert_eq!(
        recv(&peer).await,
        Some(Message::from(Ping {
            timestamp: 123_456,
            should_return: false,
        }))
    );

    // an echo is never echoed back
    send(
        &peer,
        addr,
        Message::from(Ping {
            timestamp: 1,
            should_return: false,
        }),
    )
    .await;
    assert!(recv(&peer).await.is_none());
    server.stop().await;
}

#[tokio::test]
async fn test_unknown_client_operations() {
    let (server, _) = server(Arc::default()).await;
    assert!(matches!(
        server.send_event(7, Room::from(Shout { text: "?".into() })),
        Err(ProtocolError::UnknownClient(7))
    ));
    assert_eq!(server.broadcast_event(Room::from(Shout { text: "?".into() })), 0);
    assert!(server.clients().is_empty());
    server.stop().await;
}

// ============================================================================
// UNREADY TRANSPORT
// ============================================================================

#[tokio::test]
async fn test_unready_transport_refuses_sends() {
    let taken = raw_peer().await;
    let addr = taken.local_addr().unwrap();

    let cipher = default_cipher();
    let keys = cipher.generate_keypair().unwrap();
    let transport: Transport<Room> = Transport::bind(addr, &transport_config(), cipher, keys).await;

    assert!(!transport.is_ready());
    assert!(transport.local_addr().is_none());
    assert!(matches!(
        transport.send(addr, &Message::from(Ping::default()), None),
        Err(ProtocolError::TransportNotReady)
    ));
    assert!(matches!(
        transport.ensure_ready(),
        Err(ProtocolError::TransportNotReady)
    ));
    transport.stop().await;
}

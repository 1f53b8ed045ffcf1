//! Chaos engineering tests
//!
//! Drives the reliable event layer through lossy, duplicating and reordering
//! links, both as pure state machines and over a real UDP relay.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use datagram_protocol::config::{ClientConfig, ServerConfig, TransportConfig};
use datagram_protocol::service::{Client, ClientInfo, ClientListener, Server, ServerListener};
use datagram_protocol::{application_events, frame, unframe, wire_struct, EventManager, Message};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::time::{sleep, Instant};

wire_struct! {
    #[derive(Debug, Clone, PartialEq)]
    pub struct Tick {
        pub seq: i32,
    }
}

application_events! {
    #[derive(Debug, Clone, PartialEq)]
    pub enum Sim {
        Tick(Tick) = 1,
    }
}

/// Simulates packet loss (returns true if packet should be dropped)
fn simulate_packet_loss(loss_rate: f32) -> bool {
    rand::rng().random::<f32>() < loss_rate
}

/// One direction of a simulated link: drops, duplicates and reorders frames.
struct Link {
    rng: StdRng,
    loss: f64,
    duplication: f64,
    in_flight: Vec<Vec<u8>>,
}

impl Link {
    fn new(seed: u64, loss: f64, duplication: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            loss,
            duplication,
            in_flight: Vec::new(),
        }
    }

    fn send(&mut self, message: &Message<Sim>) {
        if self.rng.random_bool(self.loss) {
            return;
        }
        let bytes = frame(message);
        if self.rng.random_bool(self.duplication) {
            self.in_flight.push(bytes.clone());
        }
        self.in_flight.push(bytes);
    }

    fn deliver(&mut self) -> Vec<Message<Sim>> {
        let mut batch = std::mem::take(&mut self.in_flight);
        batch.shuffle(&mut self.rng);
        batch.iter().filter_map(|b| unframe::<Sim>(b)).collect()
    }
}

fn run_lossy_exchange(seed: u64, loss: f64, count: i32) -> (HashMap<i32, usize>, usize, u32) {
    let timeout = Duration::from_millis(100);
    let mut sender: EventManager<Sim> = EventManager::new(timeout);
    let mut receiver: EventManager<Sim> = EventManager::new(timeout);
    let mut forward = Link::new(seed, loss, 0.1);
    let mut backward = Link::new(seed.wrapping_add(1), loss, 0.1);
    let mut deliveries: HashMap<i32, usize> = HashMap::new();

    let mut now = Instant::now();
    for seq in 0..count {
        let message = sender.send_event(Sim::from(Tick { seq }), now).unwrap();
        forward.send(&message);
    }

    let mut rounds = 0;
    while !sender.pending().is_empty() && rounds < 500 {
        rounds += 1;
        for message in forward.deliver() {
            if let Message::Event(carrier) = message {
                let received = receiver.on_receive_event(carrier.event_id, carrier.event);
                backward.send(&received.confirmation);
                if let Some(Sim::Tick(tick)) = received.delivered {
                    *deliveries.entry(tick.seq).or_default() += 1;
                }
            }
        }
        for message in backward.deliver() {
            if let Message::EventConfirmation(confirmation) = message {
                sender.on_receive_confirmation(confirmation.event_id);
            }
        }
        now += Duration::from_millis(120);
        for message in sender.tick(now) {
            forward.send(&message);
        }
    }

    (deliveries, sender.pending().len(), rounds)
}

#[test]
fn test_every_event_delivered_once_over_lossy_link() {
    for seed in [1, 7, 42, 1337] {
        let (deliveries, pending, _) = run_lossy_exchange(seed, 0.3, 100);
        assert_eq!(pending, 0, "seed {seed} left events unconfirmed");
        assert_eq!(deliveries.len(), 100, "seed {seed} lost events");
        assert!(
            deliveries.values().all(|&n| n == 1),
            "seed {seed} delivered an event twice"
        );
    }
}

#[test]
fn test_heavy_loss_still_converges() {
    let (deliveries, pending, rounds) = run_lossy_exchange(99, 0.7, 20);
    assert_eq!(pending, 0);
    assert_eq!(deliveries.len(), 20);
    assert!(rounds > 1);
}

#[test]
fn test_lossless_link_needs_no_retransmission() {
    let (deliveries, pending, rounds) = run_lossy_exchange(5, 0.0, 50);
    assert_eq!(pending, 0);
    assert_eq!(deliveries.len(), 50);
    assert_eq!(rounds, 1);
}

/// UDP relay between one client and a server that drops datagrams once
/// `lossy` is set.
async fn spawn_relay(server: SocketAddr, loss_rate: f32, lossy: Arc<AtomicBool>) -> SocketAddr {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut client: Option<SocketAddr> = None;
        let mut buf = vec![0u8; 65_535];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let target = if from == server {
                match client {
                    Some(c) => c,
                    None => continue,
                }
            } else {
                client = Some(from);
                server
            };
            if lossy.load(Ordering::Relaxed) && simulate_packet_loss(loss_rate) {
                continue;
            }
            let _ = socket.send_to(&buf[..len], target).await;
        }
    });
    addr
}

#[derive(Default)]
struct Collected {
    seen: Mutex<HashMap<i32, usize>>,
}

impl Collected {
    fn record(&self, event: Sim) {
        let Sim::Tick(tick) = event;
        *self.seen.lock().unwrap().entry(tick.seq).or_default() += 1;
    }

    fn distinct(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn all_once(&self) -> bool {
        self.seen.lock().unwrap().values().all(|&n| n == 1)
    }
}

impl ServerListener<Sim> for Collected {
    fn on_event(&self, _client: &ClientInfo, event: Sim) {
        self.record(event);
    }
}

impl ClientListener<Sim> for Collected {
    fn on_event(&self, event: Sim) {
        self.record(event);
    }
}

#[tokio::test]
#[serial_test::serial]
async fn test_events_survive_lossy_udp_relay() {
    let transport = TransportConfig {
        receive_timeout: Duration::from_millis(20),
        confirmation_timeout: Duration::from_millis(80),
        ..TransportConfig::default()
    };
    let server_seen = Arc::new(Collected::default());
    let server: Server<Sim> = Server::bind(
        ServerConfig {
            address: "127.0.0.1:0".into(),
            connection_timeout: Duration::from_secs(5),
            max_connections: 4,
            poll_interval: Duration::from_millis(20),
        },
        &transport,
        server_seen.clone(),
    )
    .await
    .unwrap();
    server.start();

    let lossy = Arc::new(AtomicBool::new(false));
    let relay = spawn_relay(server.local_addr().unwrap(), 0.3, lossy.clone()).await;

    let client_seen = Arc::new(Collected::default());
    let client = Arc::new(
        Client::<Sim>::bind(
            ClientConfig {
                bind_address: "127.0.0.1:0".into(),
                ping_interval: Duration::from_millis(100),
                connection_timeout: Duration::from_secs(5),
                ..ClientConfig::default()
            },
            &transport,
            client_seen.clone(),
        )
        .await
        .unwrap(),
    );
    client.start();
    let id = client
        .connect_and_wait(relay, "chaos", Duration::from_secs(2))
        .await
        .unwrap();

    lossy.store(true, Ordering::Relaxed);
    for seq in 0..30 {
        client.send_event(Sim::from(Tick { seq })).unwrap();
        server.send_event(id, Sim::from(Tick { seq })).unwrap();
    }

    let host = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            loop {
                client.update();
                sleep(Duration::from_millis(20)).await;
            }
        })
    };

    let deadline = Instant::now() + Duration::from_secs(10);
    while (server_seen.distinct() < 30 || client_seen.distinct() < 30 || client.pending_events() > 0)
        && Instant::now() < deadline
    {
        sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(server_seen.distinct(), 30);
    assert_eq!(client_seen.distinct(), 30);
    assert!(server_seen.all_once());
    assert!(client_seen.all_once());
    assert_eq!(client.pending_events(), 0);

    host.abort();
    client.stop().await;
    server.stop().await;
}

//! # Server Sessions
//!
//! Multiplexes many client sessions over one UDP socket.
//!
//! The receive loop classifies every inbound message:
//!
//! - `Key`: cache the sender's public key by address, answering in clear with the
//!   server key when asked
//! - `Connect`: re-acknowledge a known address, reject when full, otherwise
//!   allocate the next client id, register a [`RemoteClient`], spawn its handler
//!   task and answer `AcceptConnection` encrypted with the peer key
//! - `Disconnect`: drop the session and stop its handler
//! - anything else: forward to the session's inbox, or drop it when the address
//!   has no session
//!
//! Each handler task owns the session's [`EventManager`], runs a liveness
//! countdown reset by every inbound message, echoes pings that ask for it and
//! retransmits unconfirmed events. On expiry it removes its own table entry and
//! reports the timeout exactly once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{ServerConfig, TransportConfig};
use crate::error::{ProtocolError, Result};
use crate::protocol::events::EventManager;
use crate::protocol::message::{AcceptConnection, Connect, Disconnect, Key, Message, Ping, RejectConnection};
use crate::protocol::registry::ApplicationEvent;
use crate::transport::udp::{ReceiveHandler, Transport};
use crate::utils::crypto::{default_cipher, PublicKey, SharedCipher};
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::join_task;

/// Reason sent when `max_connections` is reached
pub const REASON_SERVER_FULL: &str = "server full";

/// Peer keys cached beyond `max_connections` for peers still mid-handshake
pub const KEY_CACHE_HEADROOM: usize = 64;

/// Public view of a connected client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: i32,
    pub address: SocketAddr,
    pub name: String,
}

/// Session callbacks. Invoked from the receive task or the client's handler
/// task, so implementations must not block.
pub trait ServerListener<E>: Send + Sync + 'static {
    fn on_connect(&self, _client: &ClientInfo) {}

    /// The client sent `Disconnect` or was disconnected by the server
    fn on_disconnect(&self, _client: &ClientInfo) {}

    /// The client's liveness countdown expired
    fn on_timeout(&self, _client: &ClientInfo) {}

    /// A new (non-duplicate) application event arrived
    fn on_event(&self, _client: &ClientInfo, _event: E) {}
}

/// Listener that ignores every callback
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopServerListener;

impl<E> ServerListener<E> for NoopServerListener {}

enum Command<E> {
    Inbound(Message<E>),
    Send(E),
}

/// Server-side state of one connected peer.
pub struct RemoteClient<E> {
    info: ClientInfo,
    inbox: mpsc::UnboundedSender<Command<E>>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<E> RemoteClient<E> {
    pub fn info(&self) -> &ClientInfo {
        &self.info
    }

    fn halt(&self) {
        self.running.store(false, Ordering::Release);
    }

    async fn stop(&self) {
        self.halt();
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            join_task(handle, "client-handler").await;
        }
    }
}

struct Shared<E> {
    config: ServerConfig,
    confirmation_timeout: Duration,
    transport: Transport<E>,
    sessions: DashMap<SocketAddr, Arc<RemoteClient<E>>>,
    peer_keys: DashMap<SocketAddr, PublicKey>,
    next_id: AtomicI32,
    listener: Arc<dyn ServerListener<E>>,
}

/// A datagram server managing many concurrent client sessions.
pub struct Server<E> {
    shared: Arc<Shared<E>>,
}

impl<E: ApplicationEvent> Server<E> {
    /// Bind `config.address` with the default cipher and a fresh keypair.
    ///
    /// A bind failure is not an error: the server is returned not ready and
    /// [`Server::start`] does nothing. Check [`Server::is_ready`].
    pub async fn bind(
        config: ServerConfig,
        transport: &TransportConfig,
        listener: Arc<dyn ServerListener<E>>,
    ) -> Result<Self> {
        Self::bind_with_cipher(config, transport, default_cipher(), listener).await
    }

    pub async fn bind_with_cipher(
        config: ServerConfig,
        transport: &TransportConfig,
        cipher: SharedCipher,
        listener: Arc<dyn ServerListener<E>>,
    ) -> Result<Self> {
        let addr: SocketAddr = config.address.parse().map_err(|e| {
            ProtocolError::ConfigError(format!("Invalid server address '{}': {e}", config.address))
        })?;
        let keys = cipher.generate_keypair()?;
        let transport_layer = Transport::bind(addr, transport, cipher, keys).await;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                confirmation_timeout: transport.confirmation_timeout,
                transport: transport_layer,
                sessions: DashMap::new(),
                peer_keys: DashMap::new(),
                next_id: AtomicI32::new(1),
                listener,
            }),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.shared.transport.is_ready()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.transport.local_addr()
    }

    pub fn public_key(&self) -> &PublicKey {
        self.shared.transport.public_key()
    }

    /// Start the socket loops. A no-op when the socket is not bound.
    pub fn start(&self) {
        if !self.is_ready() {
            warn!("Server not ready; start ignored");
            return;
        }
        let weak: Weak<Shared<E>> = Arc::downgrade(&self.shared);
        let handler: ReceiveHandler<E> = Arc::new(move |from, message| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_message(from, message);
            }
        });
        self.shared.transport.start(handler);
        info!(addr = ?self.local_addr(), "Server started");
    }

    /// Send an application event to one client.
    pub fn send_event(&self, client_id: i32, event: E) -> Result<()> {
        let client = self
            .shared
            .find(client_id)
            .ok_or(ProtocolError::UnknownClient(client_id))?;
        client
            .inbox
            .send(Command::Send(event))
            .map_err(|_| ProtocolError::UnknownClient(client_id))
    }

    /// Send an application event to every connected client. Returns how many
    /// sessions it was queued for.
    pub fn broadcast_event(&self, event: E) -> usize {
        let mut queued = 0;
        for entry in self.shared.sessions.iter() {
            if entry.value().inbox.send(Command::Send(event.clone())).is_ok() {
                queued += 1;
            }
        }
        queued
    }

    /// Tell a client to disconnect and tear its session down.
    #[instrument(skip(self))]
    pub async fn disconnect_client(&self, client_id: i32) -> Result<()> {
        let client = self
            .shared
            .find(client_id)
            .ok_or(ProtocolError::UnknownClient(client_id))?;
        let addr = client.info.address;
        self.shared.reply(addr, &Message::from(Disconnect {}));
        if let Some((_, removed)) = self
            .shared
            .sessions
            .remove_if(&addr, |_, c| Arc::ptr_eq(c, &client))
        {
            self.shared.peer_keys.remove(&addr);
            removed.stop().await;
            self.shared.closed(&removed.info);
            self.shared.listener.on_disconnect(&removed.info);
        }
        Ok(())
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = self
            .shared
            .sessions
            .iter()
            .map(|entry| entry.value().info.clone())
            .collect();
        clients.sort_by_key(|c| c.id);
        clients
    }

    pub fn client_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Number of peer public keys currently cached
    pub fn cached_keys(&self) -> usize {
        self.shared.peer_keys.len()
    }

    /// Notify every client, stop all handlers and then the socket loops.
    pub async fn stop(&self) {
        let addrs: Vec<SocketAddr> = self.shared.sessions.iter().map(|e| *e.key()).collect();
        for addr in addrs {
            if let Some((_, client)) = self.shared.sessions.remove(&addr) {
                self.shared.reply(addr, &Message::from(Disconnect {}));
                self.shared.peer_keys.remove(&addr);
                client.stop().await;
                self.shared.closed(&client.info);
            }
        }
        self.shared.peer_keys.clear();
        self.shared.transport.stop().await;
        global_metrics().log_metrics();
        info!("Server stopped");
    }
}

impl<E> Drop for Server<E> {
    fn drop(&mut self) {
        for entry in self.shared.sessions.iter() {
            entry.value().halt();
        }
        self.shared.transport.halt();
    }
}

impl<E: ApplicationEvent> Shared<E> {
    fn find(&self, client_id: i32) -> Option<Arc<RemoteClient<E>>> {
        self.sessions
            .iter()
            .find(|entry| entry.value().info.id == client_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn peer_key(&self, addr: SocketAddr) -> Option<PublicKey> {
        self.peer_keys.get(&addr).map(|k| k.value().clone())
    }

    /// Send to `addr`, encrypted when its key is known
    fn reply(&self, addr: SocketAddr, message: &Message<E>) {
        let key = self.peer_key(addr);
        if let Err(e) = self.transport.send(addr, message, key.as_ref()) {
            debug!(to = %addr, error = %e, "Failed to queue reply");
        }
    }

    fn closed(&self, info: &ClientInfo) {
        global_metrics().connection_closed();
        info!(client_id = info.id, addr = %info.address, "Client session closed");
    }

    fn handle_message(self: &Arc<Self>, from: SocketAddr, message: Message<E>) {
        match message {
            Message::Key(key) => self.on_key(from, key),
            Message::Connect(connect) => self.on_connect(from, connect),
            Message::Disconnect(_) => self.on_disconnect(from),
            other => match self.sessions.get(&from) {
                Some(client) => {
                    let _ = client.inbox.send(Command::Inbound(other));
                }
                None => {
                    global_metrics().unknown_peer_drop();
                    debug!(from = %from, kind = other.kind().name(), "Message from unknown peer dropped");
                }
            },
        }
    }

    fn on_key(&self, from: SocketAddr, key: Key) {
        if let Some(material) = key.key {
            match self.transport.cipher().import_public_key(material.as_bytes()) {
                Ok(imported) if self.make_room_for_key(from) => {
                    self.peer_keys.insert(from, imported);
                    debug!(from = %from, "Peer key cached");
                }
                Ok(_) => {
                    warn!(from = %from, cached = self.peer_keys.len(), "Peer key cache full, key dropped");
                }
                Err(e) => {
                    debug!(from = %from, error = %e, "Rejected peer key");
                    return;
                }
            }
        }
        if key.request_key {
            let answer = Message::from(Key {
                request_key: false,
                key: Some(self.transport.public_key().clone()),
            });
            if let Err(e) = self.transport.send(from, &answer, None) {
                debug!(to = %from, error = %e, "Failed to send server key");
            }
        }
    }

    fn key_cache_limit(&self) -> usize {
        self.config.max_connections.saturating_add(KEY_CACHE_HEADROOM)
    }

    /// Whether a key from `from` fits the cache, evicting keys of peers that
    /// never completed a connect when it is full.
    fn make_room_for_key(&self, from: SocketAddr) -> bool {
        if self.peer_keys.contains_key(&from) || self.peer_keys.len() < self.key_cache_limit() {
            return true;
        }
        self.peer_keys.retain(|addr, _| self.sessions.contains_key(addr));
        debug!(cached = self.peer_keys.len(), "Evicted keys of peers without a session");
        self.peer_keys.len() < self.key_cache_limit()
    }

    fn on_connect(self: &Arc<Self>, from: SocketAddr, connect: Connect) {
        if let Some(existing) = self.sessions.get(&from).map(|c| Arc::clone(c.value())) {
            trace!(client_id = existing.info.id, "Repeated connect acknowledged");
            let _ = existing.inbox.send(Command::Inbound(Message::from(connect)));
            self.reply(
                from,
                &Message::from(AcceptConnection {
                    client_id: existing.info.id,
                }),
            );
            return;
        }

        if self.sessions.len() >= self.config.max_connections {
            global_metrics().connection_rejected();
            info!(from = %from, "Connection rejected: server full");
            self.reply(
                from,
                &Message::from(RejectConnection {
                    reason: REASON_SERVER_FULL.into(),
                }),
            );
            return;
        }

        let client = match self.sessions.entry(from) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                let (inbox, rx) = mpsc::unbounded_channel();
                let client = Arc::new(RemoteClient {
                    info: ClientInfo {
                        id: self.next_id.fetch_add(1, Ordering::Relaxed),
                        address: from,
                        name: connect.name,
                    },
                    inbox,
                    running: Arc::new(AtomicBool::new(true)),
                    handle: Mutex::new(None),
                });
                let handle = tokio::spawn(run_client(Arc::clone(self), Arc::clone(&client), rx));
                if let Ok(mut guard) = client.handle.lock() {
                    *guard = Some(handle);
                }
                slot.insert(Arc::clone(&client));
                client
            }
        };

        global_metrics().connection_established();
        info!(client_id = client.info.id, addr = %from, name = %client.info.name, "Client connected");
        self.reply(
            from,
            &Message::from(AcceptConnection {
                client_id: client.info.id,
            }),
        );
        self.listener.on_connect(&client.info);
    }

    fn on_disconnect(&self, from: SocketAddr) {
        if let Some((_, client)) = self.sessions.remove(&from) {
            self.peer_keys.remove(&from);
            client.halt();
            self.closed(&client.info);
            self.listener.on_disconnect(&client.info);
        }
    }

    fn on_inbound(&self, client: &RemoteClient<E>, events: &mut EventManager<E>, message: Message<E>) {
        let addr = client.info.address;
        match message {
            Message::Ping(ping) if ping.should_return => {
                self.reply(
                    addr,
                    &Message::from(Ping {
                        timestamp: ping.timestamp,
                        should_return: false,
                    }),
                );
            }
            Message::Event(event) => {
                let received = events.on_receive_event(event.event_id, event.event);
                self.reply(addr, &received.confirmation);
                if let Some(delivered) = received.delivered {
                    self.listener.on_event(&client.info, delivered);
                }
            }
            Message::EventConfirmation(confirmation) => {
                events.on_receive_confirmation(confirmation.event_id);
            }
            Message::Connect(_) => {
                // the peer started a new session and numbers its events from 0 again
                *events = EventManager::new(self.confirmation_timeout);
                debug!(client_id = client.info.id, "Event state reset for reconnecting client");
            }
            other => trace!(client_id = client.info.id, kind = other.kind().name(), "Liveness only"),
        }
    }
}

/// Per-client handler: owns the session's event state and liveness countdown.
async fn run_client<E: ApplicationEvent>(
    shared: Arc<Shared<E>>,
    client: Arc<RemoteClient<E>>,
    mut rx: mpsc::UnboundedReceiver<Command<E>>,
) {
    let mut events = EventManager::new(shared.confirmation_timeout);
    let mut deadline = Instant::now() + shared.config.connection_timeout;

    while client.running.load(Ordering::Acquire) {
        match timeout(shared.config.poll_interval, rx.recv()).await {
            Ok(Some(Command::Inbound(message))) => {
                deadline = Instant::now() + shared.config.connection_timeout;
                shared.on_inbound(&client, &mut events, message);
            }
            Ok(Some(Command::Send(event))) => match events.send_event(event, Instant::now()) {
                Ok(message) => shared.reply(client.info.address, &message),
                Err(e) => warn!(client_id = client.info.id, error = %e, "Event not sent"),
            },
            Ok(None) => break,
            Err(_) => {}
        }

        let now = Instant::now();
        for message in events.tick(now) {
            shared.reply(client.info.address, &message);
        }

        if now >= deadline {
            let addr = client.info.address;
            if shared
                .sessions
                .remove_if(&addr, |_, c| Arc::ptr_eq(c, &client))
                .is_some()
            {
                shared.peer_keys.remove(&addr);
                global_metrics().timeout();
                shared.closed(&client.info);
                info!(client_id = client.info.id, "Client timed out");
                shared.listener.on_timeout(&client.info);
            }
            break;
        }
    }
    client.running.store(false, Ordering::Release);
    trace!(client_id = client.info.id, "Client handler exited");
}

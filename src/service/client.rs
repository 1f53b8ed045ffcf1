//! # Client Session
//!
//! ```text
//! Disconnected -> AwaitingKey -> AwaitingAccept -> Connected -> Disconnected | TimedOut
//! ```
//!
//! `connect` starts with a clear-text key request unless the server's key is
//! already cached, in which case the encrypted `Connect` goes out directly.
//! Inbound messages are processed on the transport's receive task; the host
//! drives pings, event retransmission and the liveness countdown by calling
//! [`Client::update`] at a steady cadence.
//!
//! The countdown runs in every active state, so a connect attempt to a silent
//! address ends in `TimedOut` just like a dead established session.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{ClientConfig, TransportConfig};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::events::EventManager;
use crate::protocol::message::{Connect, Disconnect, Key, Message, Ping};
use crate::protocol::registry::ApplicationEvent;
use crate::transport::udp::{ReceiveHandler, Transport};
use crate::utils::crypto::{default_cipher, PublicKey, SharedCipher};
use crate::utils::metrics::global_metrics;
use crate::utils::time::{current_timestamp_millis, latency_from_echo};
use crate::utils::timeout::with_timeout_error;

/// Where the client is in the session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Disconnected,
    AwaitingKey,
    AwaitingAccept,
    Connected,
    TimedOut,
}

impl ClientState {
    /// States in which a server address is set and the countdown runs
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ClientState::AwaitingKey | ClientState::AwaitingAccept | ClientState::Connected
        )
    }
}

/// Session callbacks, fired after the session lock is released.
pub trait ClientListener<E>: Send + Sync + 'static {
    fn on_connect(&self, _client_id: i32) {}

    fn on_reject(&self, _reason: &str) {}

    /// Local `disconnect()` or a server-initiated `Disconnect`
    fn on_disconnect(&self) {}

    fn on_timeout(&self) {}

    fn on_event(&self, _event: E) {}
}

/// Listener that ignores every callback
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopClientListener;

impl<E> ClientListener<E> for NoopClientListener {}

enum Notice<E> {
    Connected(i32),
    Rejected(String),
    Disconnected,
    TimedOut,
    Event(E),
}

struct Session<E> {
    state: ClientState,
    server: Option<SocketAddr>,
    name: String,
    client_id: Option<i32>,
    latency_ms: Option<i64>,
    rejection: Option<String>,
    deadline: Instant,
    last_ping: Option<Instant>,
    events: EventManager<E>,
}

impl<E: ApplicationEvent> Session<E> {
    fn new(confirmation_timeout: Duration) -> Self {
        Self {
            state: ClientState::Disconnected,
            server: None,
            name: String::new(),
            client_id: None,
            latency_ms: None,
            rejection: None,
            deadline: Instant::now(),
            last_ping: None,
            events: EventManager::new(confirmation_timeout),
        }
    }

    fn end(&mut self, state: ClientState) {
        self.state = state;
        self.server = None;
        self.client_id = None;
        self.last_ping = None;
    }
}

struct Shared<E> {
    config: ClientConfig,
    confirmation_timeout: Duration,
    transport: Transport<E>,
    session: Mutex<Session<E>>,
    server_keys: DashMap<SocketAddr, PublicKey>,
    listener: Arc<dyn ClientListener<E>>,
}

/// A datagram client holding at most one server session at a time.
pub struct Client<E> {
    shared: Arc<Shared<E>>,
}

impl<E: ApplicationEvent> Client<E> {
    /// Bind `config.bind_address` with the default cipher and a fresh keypair.
    pub async fn bind(
        config: ClientConfig,
        transport: &TransportConfig,
        listener: Arc<dyn ClientListener<E>>,
    ) -> Result<Self> {
        Self::bind_with_cipher(config, transport, default_cipher(), listener).await
    }

    pub async fn bind_with_cipher(
        config: ClientConfig,
        transport: &TransportConfig,
        cipher: SharedCipher,
        listener: Arc<dyn ClientListener<E>>,
    ) -> Result<Self> {
        let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
            ProtocolError::ConfigError(format!(
                "Invalid client bind address '{}': {e}",
                config.bind_address
            ))
        })?;
        let keys = cipher.generate_keypair()?;
        let transport_layer = Transport::bind(addr, transport, cipher, keys).await;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                confirmation_timeout: transport.confirmation_timeout,
                transport: transport_layer,
                session: Mutex::new(Session::new(transport.confirmation_timeout)),
                server_keys: DashMap::new(),
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
            warn!("Client not ready; start ignored");
            return;
        }
        let weak: Weak<Shared<E>> = Arc::downgrade(&self.shared);
        let handler: ReceiveHandler<E> = Arc::new(move |from, message| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_message(from, message);
            }
        });
        self.shared.transport.start(handler);
    }

    /// Begin a session with `server`.
    #[instrument(skip_all, fields(server = %server))]
    pub fn connect(&self, server: SocketAddr, name: &str) -> Result<()> {
        self.shared.transport.ensure_ready()?;
        let shared = &self.shared;
        let mut session = shared.lock()?;

        session.server = Some(server);
        session.name = name.to_string();
        session.client_id = None;
        session.latency_ms = None;
        session.rejection = None;
        session.last_ping = None;
        session.deadline = Instant::now() + shared.config.connection_timeout;
        session.events = EventManager::new(shared.confirmation_timeout);

        match shared.server_key(server) {
            Some(key) => {
                session.state = ClientState::AwaitingAccept;
                // the server forgets peer keys when a session ends
                shared.transport.send(
                    server,
                    &Message::from(Key {
                        request_key: false,
                        key: Some(shared.transport.public_key().clone()),
                    }),
                    None,
                )?;
                shared.transport.send(
                    server,
                    &Message::from(Connect {
                        name: session.name.clone(),
                    }),
                    Some(&key),
                )?;
                debug!("Server key cached; connect sent");
            }
            None => {
                session.state = ClientState::AwaitingKey;
                shared.transport.send(
                    server,
                    &Message::from(Key {
                        request_key: true,
                        key: Some(shared.transport.public_key().clone()),
                    }),
                    None,
                )?;
                debug!("Key requested");
            }
        }
        Ok(())
    }

    /// Connect to the configured server address under the configured name.
    pub fn connect_configured(&self) -> Result<()> {
        if self.shared.config.address.is_empty() {
            return Err(ProtocolError::ConfigError(constants::ERR_NO_SERVER.into()));
        }
        let server: SocketAddr = self.shared.config.address.parse().map_err(|e| {
            ProtocolError::ConfigError(format!(
                "Invalid server address '{}': {e}",
                self.shared.config.address
            ))
        })?;
        let name = self.shared.config.name.clone();
        self.connect(server, &name)
    }

    /// Connect and drive [`Client::update`] until the session is accepted,
    /// rejected, or `wait` elapses.
    pub async fn connect_and_wait(&self, server: SocketAddr, name: &str, wait: Duration) -> Result<i32> {
        self.connect(server, name)?;
        with_timeout_error(
            async {
                loop {
                    self.update();
                    {
                        let session = self.shared.lock()?;
                        match session.state {
                            ClientState::Connected => {
                                if let Some(id) = session.client_id {
                                    return Ok(id);
                                }
                            }
                            ClientState::TimedOut => return Err(ProtocolError::PeerTimeout),
                            ClientState::Disconnected => {
                                let reason = session
                                    .rejection
                                    .clone()
                                    .unwrap_or_else(|| constants::ERR_NOT_CONNECTED.to_string());
                                return Err(ProtocolError::ConnectionRejected(reason));
                            }
                            ClientState::AwaitingKey | ClientState::AwaitingAccept => {}
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
            wait,
        )
        .await
    }

    /// Periodic bookkeeping: liveness countdown, pings while connected and
    /// event retransmission. Call at a steady cadence from the host loop.
    pub fn update(&self) {
        let shared = &self.shared;
        let mut notices = Vec::new();
        {
            let Ok(mut session) = shared.lock() else {
                return;
            };
            if !session.state.is_active() {
                return;
            }
            let now = Instant::now();

            if now >= session.deadline {
                session.end(ClientState::TimedOut);
                global_metrics().timeout();
                info!("Server session timed out");
                notices.push(Notice::TimedOut);
            } else if let Some(server) = session.server {
                let key = shared.server_key(server);
                if session.state == ClientState::Connected {
                    let due = session
                        .last_ping
                        .map_or(true, |at| now.saturating_duration_since(at) >= shared.config.ping_interval);
                    if due {
                        session.last_ping = Some(now);
                        let ping = Message::from(Ping {
                            timestamp: current_timestamp_millis(),
                            should_return: true,
                        });
                        shared.send(server, &ping, key.as_ref());
                    }
                }
                for message in session.events.tick(now) {
                    shared.send(server, &message, key.as_ref());
                }
            }
        }
        shared.notify(notices);
    }

    /// Send an application event to the server. Requires a connected session.
    pub fn send_event(&self, event: E) -> Result<()> {
        let shared = &self.shared;
        let mut session = shared.lock()?;
        let server = match (session.state, session.server) {
            (ClientState::Connected, Some(server)) => server,
            _ => return Err(ProtocolError::NotConnected),
        };
        let message = session.events.send_event(event, Instant::now())?;
        let key = shared.server_key(server);
        shared.transport.send(server, &message, key.as_ref())
    }

    /// Send a clear-text `Disconnect` and drop the session without waiting for
    /// an acknowledgment.
    #[instrument(skip(self))]
    pub fn disconnect(&self) -> Result<()> {
        let shared = &self.shared;
        {
            let mut session = shared.lock()?;
            let server = match session.server {
                Some(server) if session.state.is_active() => server,
                _ => return Err(ProtocolError::NotConnected),
            };
            session.end(ClientState::Disconnected);
            shared.send(server, &Message::from(Disconnect {}), None);
            info!(server = %server, "Disconnected");
        }
        shared.notify(vec![Notice::Disconnected]);
        Ok(())
    }

    pub fn state(&self) -> ClientState {
        self.shared
            .lock()
            .map(|s| s.state)
            .unwrap_or(ClientState::Disconnected)
    }

    /// Server-assigned id of the current session
    pub fn client_id(&self) -> Option<i32> {
        self.shared.lock().ok().and_then(|s| s.client_id)
    }

    /// Half the last ping round trip, in milliseconds
    pub fn latency(&self) -> Option<i64> {
        self.shared.lock().ok().and_then(|s| s.latency_ms)
    }

    pub fn server_address(&self) -> Option<SocketAddr> {
        self.shared.lock().ok().and_then(|s| s.server)
    }

    /// Events sent and not yet confirmed
    pub fn pending_events(&self) -> usize {
        self.shared
            .lock()
            .map(|s| s.events.pending().len())
            .unwrap_or(0)
    }

    /// Stop the socket loops. The session state is left as is.
    pub async fn stop(&self) {
        self.shared.transport.stop().await;
    }
}

impl<E> Drop for Client<E> {
    fn drop(&mut self) {
        self.shared.transport.halt();
    }
}

impl<E: ApplicationEvent> Shared<E> {
    fn lock(&self) -> Result<MutexGuard<'_, Session<E>>> {
        self.session
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))
    }

    fn server_key(&self, server: SocketAddr) -> Option<PublicKey> {
        self.server_keys.get(&server).map(|k| k.value().clone())
    }

    fn send(&self, to: SocketAddr, message: &Message<E>, key: Option<&PublicKey>) {
        if let Err(e) = self.transport.send(to, message, key) {
            debug!(to = %to, error = %e, "Failed to queue message");
        }
    }

    fn notify(&self, notices: Vec<Notice<E>>) {
        for notice in notices {
            match notice {
                Notice::Connected(id) => self.listener.on_connect(id),
                Notice::Rejected(reason) => self.listener.on_reject(&reason),
                Notice::Disconnected => self.listener.on_disconnect(),
                Notice::TimedOut => self.listener.on_timeout(),
                Notice::Event(event) => self.listener.on_event(event),
            }
        }
    }

    fn handle_message(&self, from: SocketAddr, message: Message<E>) {
        let mut notices = Vec::new();
        {
            let Ok(mut session) = self.lock() else {
                return;
            };
            if session.server != Some(from) || !session.state.is_active() {
                global_metrics().unknown_peer_drop();
                debug!(from = %from, kind = message.kind().name(), "Message outside a session dropped");
                return;
            }
            session.deadline = Instant::now() + self.config.connection_timeout;
            self.on_message(&mut session, from, message, &mut notices);
        }
        self.notify(notices);
    }

    fn on_message(
        &self,
        session: &mut Session<E>,
        from: SocketAddr,
        message: Message<E>,
        notices: &mut Vec<Notice<E>>,
    ) {
        match message {
            Message::Key(key) => {
                if let Some(material) = key.key {
                    match self.transport.cipher().import_public_key(material.as_bytes()) {
                        Ok(imported) => {
                            self.server_keys.insert(from, imported.clone());
                            if session.state == ClientState::AwaitingKey
                                && self.config.connect_on_receive_key
                            {
                                session.state = ClientState::AwaitingAccept;
                                let connect = Message::from(Connect {
                                    name: session.name.clone(),
                                });
                                self.send(from, &connect, Some(&imported));
                                debug!("Server key received; connect sent");
                            }
                        }
                        Err(e) => debug!(error = %e, "Rejected server key"),
                    }
                }
                if key.request_key {
                    let answer = Message::from(Key {
                        request_key: false,
                        key: Some(self.transport.public_key().clone()),
                    });
                    self.send(from, &answer, None);
                }
            }
            Message::AcceptConnection(accept) => {
                if session.state == ClientState::Connected {
                    trace!(client_id = accept.client_id, "Repeated accept ignored");
                    return;
                }
                session.state = ClientState::Connected;
                session.client_id = Some(accept.client_id);
                info!(client_id = accept.client_id, "Connected");
                notices.push(Notice::Connected(accept.client_id));
            }
            Message::RejectConnection(reject) => {
                if session.state == ClientState::Connected {
                    return;
                }
                info!(reason = %reject.reason, "Connection rejected");
                session.end(ClientState::Disconnected);
                session.rejection = Some(reject.reason.clone());
                notices.push(Notice::Rejected(reject.reason));
            }
            Message::Ping(ping) if ping.should_return => {
                let echo = Message::from(Ping {
                    timestamp: ping.timestamp,
                    should_return: false,
                });
                self.send(from, &echo, self.server_key(from).as_ref());
            }
            Message::Ping(ping) => {
                let latency = latency_from_echo(ping.timestamp, current_timestamp_millis());
                session.latency_ms = Some(latency);
                trace!(latency_ms = latency, "Ping echo");
            }
            Message::Event(event) => {
                let received = session.events.on_receive_event(event.event_id, event.event);
                self.send(from, &received.confirmation, self.server_key(from).as_ref());
                if let Some(delivered) = received.delivered {
                    notices.push(Notice::Event(delivered));
                }
            }
            Message::EventConfirmation(confirmation) => {
                session.events.on_receive_confirmation(confirmation.event_id);
            }
            Message::Disconnect(_) => {
                info!("Server closed the session");
                session.end(ClientState::Disconnected);
                notices.push(Notice::Disconnected);
            }
            Message::Connect(_) => trace!("Unexpected connect from server ignored"),
        }
    }
}

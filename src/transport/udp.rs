//! # UDP Transport
//!
//! Two independent loops share one bound socket:
//!
//! - [`Sender`] drains an unbounded queue of ready-to-send [`Datagram`]s, one
//!   `send_to` each. There is no batching and no backpressure beyond queue growth.
//! - [`Receiver`] reads with a bounded wait so it can recheck its running flag,
//!   tries to decrypt with the local private key (falling back to the raw bytes
//!   as plaintext), unframes, and hands every decoded message to the registered
//!   handler on the receive task itself.
//!
//! Both loops are started and stopped idempotently. If the socket failed to bind,
//! the transport is not ready: `start` is a logged no-op and sends fail with
//! [`ProtocolError::TransportNotReady`]. Callers check [`Transport::is_ready`].
//!
//! Undecodable datagrams never reach the handler; they are dropped with a debug
//! log and a metric.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::TransportConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::Message;
use crate::protocol::registry::{frame, unframe, ApplicationEvent};
use crate::utils::crypto::{KeyPair, PublicKey, SharedCipher};
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::join_task;

/// Callback invoked on the receive task for each decoded message
pub type ReceiveHandler<E> = Arc<dyn Fn(SocketAddr, Message<E>) + Send + Sync>;

/// A ready-to-transmit payload and its destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub addr: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Outbound half: queue plus send loop.
pub struct Sender {
    socket: Option<Arc<UdpSocket>>,
    queue: mpsc::UnboundedSender<Datagram>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Datagram>>>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<mpsc::UnboundedReceiver<Datagram>>>>,
    poll_interval: Duration,
}

impl Sender {
    pub fn new(socket: Option<Arc<UdpSocket>>, poll_interval: Duration) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        Self {
            socket,
            queue,
            rx: Mutex::new(Some(rx)),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            poll_interval,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.socket.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queue a datagram. Accepted even while the loop is stopped; it goes out on
    /// the next start.
    pub fn enqueue(&self, datagram: Datagram) -> Result<()> {
        if !self.is_ready() {
            return Err(ProtocolError::TransportNotReady);
        }
        self.queue
            .send(datagram)
            .map_err(|_| ProtocolError::TransportError(constants::ERR_QUEUE_CLOSED.into()))
    }

    pub fn start(&self) {
        let Some(socket) = self.socket.clone() else {
            warn!("Sender not bound; start ignored");
            return;
        };
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let rx = match self.rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(rx) = rx else {
            warn!("Sender queue unavailable; start ignored");
            self.running.store(false, Ordering::Release);
            return;
        };

        let handle = tokio::spawn(send_loop(
            socket,
            rx,
            Arc::clone(&self.running),
            self.poll_interval,
        ));
        if let Ok(mut guard) = self.handle.lock() {
            *guard = Some(handle);
        }
    }

    /// Ask the loop to exit without waiting for it
    pub fn halt(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub async fn stop(&self) {
        self.halt();
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if let Some(rx) = join_task(handle, "sender").await {
                if let Ok(mut guard) = self.rx.lock() {
                    *guard = Some(rx);
                }
            }
        }
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    mut rx: mpsc::UnboundedReceiver<Datagram>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
) -> mpsc::UnboundedReceiver<Datagram> {
    debug!("Send loop started");
    while running.load(Ordering::Acquire) {
        match timeout(poll_interval, rx.recv()).await {
            Err(_) => continue,
            Ok(None) => break,
            Ok(Some(datagram)) => transmit(&socket, &datagram).await,
        }
    }

    // flush what was queued before the stop, e.g. a final Disconnect
    while let Ok(datagram) = rx.try_recv() {
        transmit(&socket, &datagram).await;
    }
    debug!("Send loop stopped");
    rx
}

async fn transmit(socket: &UdpSocket, datagram: &Datagram) {
    match socket.send_to(&datagram.bytes, datagram.addr).await {
        Ok(n) => {
            global_metrics().datagram_sent(n as u64);
            trace!(to = %datagram.addr, bytes = n, "Datagram sent");
        }
        Err(e) => debug!(to = %datagram.addr, error = %e, "Datagram send failed"),
    }
}

/// Inbound half: bounded-wait read loop.
pub struct Receiver<E> {
    socket: Option<Arc<UdpSocket>>,
    cipher: SharedCipher,
    keys: Arc<KeyPair>,
    decrypt: bool,
    max_datagram_size: usize,
    receive_timeout: Duration,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    _events: std::marker::PhantomData<fn() -> E>,
}

impl<E> Receiver<E> {
    pub fn new(
        socket: Option<Arc<UdpSocket>>,
        cipher: SharedCipher,
        keys: Arc<KeyPair>,
        config: &TransportConfig,
    ) -> Self {
        Self {
            socket,
            cipher,
            keys,
            decrypt: config.encryption_enabled,
            max_datagram_size: config.max_datagram_size,
            receive_timeout: config.receive_timeout,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            _events: std::marker::PhantomData,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.socket.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn start(&self, handler: ReceiveHandler<E>)
    where
        E: ApplicationEvent,
    {
        let Some(socket) = self.socket.clone() else {
            warn!("Receiver not bound; start ignored");
            return;
        };
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let ctx = ReceiveContext {
            socket,
            cipher: Arc::clone(&self.cipher),
            keys: self.decrypt.then(|| Arc::clone(&self.keys)),
            handler,
            buffer_size: self.max_datagram_size,
            wait: self.receive_timeout,
        };
        let handle = tokio::spawn(receive_loop(ctx, Arc::clone(&self.running)));
        if let Ok(mut guard) = self.handle.lock() {
            *guard = Some(handle);
        }
    }

    pub fn halt(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub async fn stop(&self) {
        self.halt();
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            join_task(handle, "receiver").await;
        }
    }
}

struct ReceiveContext<E> {
    socket: Arc<UdpSocket>,
    cipher: SharedCipher,
    keys: Option<Arc<KeyPair>>,
    handler: ReceiveHandler<E>,
    buffer_size: usize,
    wait: Duration,
}

impl<E: ApplicationEvent> ReceiveContext<E> {
    /// Decrypt if possible, otherwise treat the payload as plaintext
    fn open<'a>(&self, data: &'a [u8]) -> Cow<'a, [u8]> {
        let Some(keys) = &self.keys else {
            return Cow::Borrowed(data);
        };
        match self.cipher.decrypt(&keys.private, data) {
            Ok(plain) => Cow::Owned(plain),
            Err(_) => {
                global_metrics().decrypt_fallback();
                Cow::Borrowed(data)
            }
        }
    }

    fn dispatch(&self, from: SocketAddr, data: &[u8]) {
        global_metrics().datagram_received(data.len() as u64);
        let plain = self.open(data);
        match unframe::<E>(&plain) {
            Some(message) => {
                trace!(from = %from, kind = message.kind().name(), "Message received");
                (self.handler)(from, message);
            }
            None => debug!(from = %from, len = data.len(), "Datagram dropped"),
        }
    }
}

async fn receive_loop<E: ApplicationEvent>(ctx: ReceiveContext<E>, running: Arc<AtomicBool>) {
    let mut buf = vec![0u8; ctx.buffer_size];
    debug!("Receive loop started");
    while running.load(Ordering::Acquire) {
        match timeout(ctx.wait, ctx.socket.recv_from(&mut buf)).await {
            Err(_) => continue,
            Ok(Ok((len, from))) => ctx.dispatch(from, &buf[..len]),
            // ICMP errors from earlier sends surface here on some platforms
            Ok(Err(e)) => debug!(error = %e, "Socket receive error"),
        }
    }
    debug!("Receive loop stopped");
}

/// A bound socket with its sender and receiver loops and the local keypair.
pub struct Transport<E> {
    local_addr: Option<SocketAddr>,
    sender: Sender,
    receiver: Receiver<E>,
    cipher: SharedCipher,
    keys: Arc<KeyPair>,
    encryption_enabled: bool,
}

impl<E> Transport<E> {
    /// Bind `addr`. A bind failure is logged and yields a transport that is not
    /// ready rather than an error.
    #[instrument(skip_all, fields(addr = %addr))]
    pub async fn bind(
        addr: SocketAddr,
        config: &TransportConfig,
        cipher: SharedCipher,
        keys: KeyPair,
    ) -> Self
    where
        E: ApplicationEvent,
    {
        let socket = match UdpSocket::bind(addr).await {
            Ok(socket) => Some(Arc::new(socket)),
            Err(e) => {
                warn!(error = %e, "Failed to bind UDP socket; transport not ready");
                None
            }
        };
        let local_addr = socket.as_ref().and_then(|s| s.local_addr().ok());
        if let Some(local) = local_addr {
            info!(local = %local, cipher = cipher.name(), "UDP transport bound");
        }

        let keys = Arc::new(keys);
        Self {
            local_addr,
            sender: Sender::new(socket.clone(), config.receive_timeout),
            receiver: Receiver::new(socket, Arc::clone(&cipher), Arc::clone(&keys), config),
            cipher,
            keys,
            encryption_enabled: config.encryption_enabled,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.local_addr.is_some()
    }

    pub fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(ProtocolError::TransportNotReady)
        }
    }

    pub fn is_running(&self) -> bool {
        self.sender.is_running() && self.receiver.is_running()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// This endpoint's public key, as sent in Key messages
    pub fn public_key(&self) -> &PublicKey {
        &self.keys.public
    }

    pub fn cipher(&self) -> &SharedCipher {
        &self.cipher
    }

    /// Start both loops, delivering decoded messages to `handler`
    pub fn start(&self, handler: ReceiveHandler<E>)
    where
        E: ApplicationEvent,
    {
        if !self.is_ready() {
            warn!("Transport not ready; start ignored");
            return;
        }
        self.sender.start();
        self.receiver.start(handler);
    }

    /// Frame `message`, encrypt it for `key` when one is given, and queue it.
    pub fn send(&self, addr: SocketAddr, message: &Message<E>, key: Option<&PublicKey>) -> Result<()>
    where
        E: ApplicationEvent,
    {
        self.ensure_ready()?;
        let framed = frame(message);
        let seal_for = key.filter(|_| self.encryption_enabled);
        let bytes = match seal_for {
            Some(key) => match self.cipher.encrypt(key, &framed) {
                Ok(sealed) => {
                    global_metrics().encryption();
                    sealed
                }
                Err(e) => {
                    global_metrics().encryption_failure();
                    debug!(to = %addr, error = %e, "Failed to seal message");
                    return Err(e);
                }
            },
            None => framed,
        };
        trace!(to = %addr, kind = message.kind().name(), encrypted = seal_for.is_some(), "Message queued");
        self.send_raw(addr, bytes)
    }

    /// Queue an already encoded payload as is
    pub fn send_raw(&self, addr: SocketAddr, bytes: Vec<u8>) -> Result<()> {
        self.sender.enqueue(Datagram { addr, bytes })
    }

    /// Signal both loops to exit without waiting
    pub fn halt(&self) {
        self.sender.halt();
        self.receiver.halt();
    }

    /// Stop both loops and wait for them to exit
    pub async fn stop(&self) {
        self.receiver.stop().await;
        self.sender.stop().await;
    }
}

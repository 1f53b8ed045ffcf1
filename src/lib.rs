//! # Datagram Protocol
//!
//! Encrypted client/server messaging over UDP with a generic field marshaller and
//! an application-level reliable event layer.
//!
//! ## Layers
//! - [`codec`]: per-kind field encoders and the ordered-field marshaller
//!   (`wire_struct!`)
//! - [`protocol`]: control messages, the message/event registries
//!   (`application_events!`), framing and the reliable [`EventManager`]
//! - [`utils::crypto`]: pluggable whole-datagram asymmetric encryption
//! - [`transport`]: send and receive loops over one bound UDP socket
//! - [`service`]: client and server session state machines
//!
//! ## Delivery semantics
//! Events are retransmitted until confirmed and each id is delivered at most
//! once, but **not in order**. Applications that need ordering must sequence
//! events themselves.
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use datagram_protocol::config::NetworkConfig;
//! use datagram_protocol::service::{Client, NoopClientListener, NoopServerListener, Server};
//! use datagram_protocol::{application_events, wire_struct};
//!
//! wire_struct! {
//!     #[derive(Debug, Clone, PartialEq)]
//!     pub struct Chat { pub text: String }
//! }
//!
//! application_events! {
//!     #[derive(Debug, Clone, PartialEq)]
//!     pub enum LobbyEvent { Chat(Chat) = 1 }
//! }
//!
//! # async fn run() -> datagram_protocol::Result<()> {
//! let config = NetworkConfig::default();
//! let server: Server<LobbyEvent> =
//!     Server::bind(config.server.clone(), &config.transport, Arc::new(NoopServerListener)).await?;
//! server.start();
//!
//! let client: Client<LobbyEvent> =
//!     Client::bind(config.client.clone(), &config.transport, Arc::new(NoopClientListener)).await?;
//! client.start();
//! client.connect_configured()?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

// Referenced by the exported macros
pub use bytes;

pub use error::{DecodeError, ProtocolError, Result};
pub use protocol::events::EventManager;
pub use protocol::message::Message;
pub use protocol::registry::{frame, unframe, ApplicationEvent, MessageKind};

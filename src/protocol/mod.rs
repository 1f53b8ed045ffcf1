//! # Protocol Layer
//!
//! Message types, the type registries with wire framing, and the reliable
//! event layer.
//!
//! ## Components
//! - **Message**: control messages (Key, Connect, Disconnect, AcceptConnection,
//!   RejectConnection, Ping) and the Event / EventConfirmation carriers
//! - **Registry**: fixed message ids, application event sets, `frame`/`unframe`
//! - **Events**: per-connection sequencing, acknowledgment and retransmission

pub mod events;
pub mod message;
pub mod registry;

//! # Error Types
//!
//! Error handling for the datagram protocol.
//!
//! Two layers of errors exist:
//! - [`DecodeError`]: everything that can go wrong while turning bytes back into
//!   fields, messages or application events. Receive paths never surface these
//!   to the socket loop; they are logged, counted and the datagram is dropped.
//! - [`ProtocolError`]: the crate-wide error returned from fallible operations
//!   (binding, encryption, session calls, configuration).
//!
//! Session-level failures (timeouts, rejections, remote disconnects) are reported
//! through listener callbacks rather than returned from the send/receive path.
//!
//! ## Example Usage
//! ```rust
//! use datagram_protocol::error::{DecodeError, ProtocolError, Result};
//!
//! fn check(len: usize) -> Result<()> {
//!     if len < 4 {
//!         return Err(DecodeError::Truncated { needed: 4, available: len }.into());
//!     }
//!     Ok(())
//! }
//!
//! assert!(matches!(check(2), Err(ProtocolError::Decode(_))));
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Synchronization errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Cryptographic errors
    pub const ERR_KEY_LENGTH: &str = "Key material has the wrong length";

    /// Transport errors
    pub const ERR_QUEUE_CLOSED: &str = "Outbound datagram queue closed";

    /// Session errors
    pub const ERR_NOT_CONNECTED: &str = "No active session with a server";
    pub const ERR_NO_SERVER: &str = "No server address configured";
}

/// Failures while decoding a field, a marshalled body or a framed message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Truncated buffer: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Field count mismatch: expected {expected}, found {found}")]
    FieldCountMismatch { expected: usize, found: i32 },

    #[error("Unknown field type id: {0}")]
    UnknownType(i32),

    #[error("Field {index} has type id {found}, expected {expected}")]
    FieldTypeMismatch { index: usize, expected: i32, found: i32 },

    #[error("Invalid length prefix: {0}")]
    InvalidLength(i32),

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Unknown message type id: {0}")]
    UnknownMessage(i32),

    #[error("Unknown application event type id: {0}")]
    UnknownEvent(i32),

    #[error("Event message carries no event payload")]
    MissingEvent,
}

/// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transport not ready: socket failed to bind")]
    TransportNotReady,

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Peer timed out")]
    PeerTimeout,

    #[error("Connection rejected: {0}")]
    ConnectionRejected(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Unknown client id: {0}")]
    UnknownClient(i32),

    #[error("Event ids exhausted for this session")]
    EventIdsExhausted,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

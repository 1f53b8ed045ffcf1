//! # Message Registry & Framing
//!
//! Two independent, closed type registries:
//!
//! - [`MessageKind`]: the control/transport messages, with fixed wire ids
//! - application event sets: enums declared with
//!   [`application_events!`](crate::application_events), each variant pinned to a
//!   numeric tag at its definition site
//!
//! Both are fixed at compile time, so they are read-only and shared by every
//! receive path without synchronization.
//!
//! ## Framing
//! ```text
//! [typeId(4)] [marshalled body]
//! ```

use bytes::{BufMut, BytesMut};
use std::fmt;
use tracing::debug;

use crate::codec::marshal::read_i32;
use crate::codec::{marshal_into, unmarshal};
use crate::error::DecodeError;
use crate::protocol::message::Message;
use crate::utils::metrics::global_metrics;

/// Stable wire ids of every message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageKind {
    Key = 0,
    Connect = 1,
    Disconnect = 2,
    AcceptConnection = 3,
    RejectConnection = 4,
    Ping = 5,
    Event = 6,
    EventConfirmation = 7,
}

impl MessageKind {
    /// Every registered message type, in id order
    pub const ALL: [MessageKind; 8] = [
        MessageKind::Key,
        MessageKind::Connect,
        MessageKind::Disconnect,
        MessageKind::AcceptConnection,
        MessageKind::RejectConnection,
        MessageKind::Ping,
        MessageKind::Event,
        MessageKind::EventConfirmation,
    ];

    pub fn id(self) -> i32 {
        self as i32
    }

    /// Resolve a wire id; `None` for unregistered ids
    pub fn from_id(id: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.id() == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Key => "KEY",
            MessageKind::Connect => "CONNECT",
            MessageKind::Disconnect => "DISCONNECT",
            MessageKind::AcceptConnection => "ACCEPT_CONNECTION",
            MessageKind::RejectConnection => "REJECT_CONNECTION",
            MessageKind::Ping => "PING",
            MessageKind::Event => "EVENT",
            MessageKind::EventConfirmation => "EVENT_CONFIRMATION",
        }
    }
}

/// A closed set of application events carried inside `Event` messages.
///
/// Implemented by [`application_events!`](crate::application_events); hand
/// implementations must keep `event_type` and `unmarshal_body` in agreement.
pub trait ApplicationEvent: Clone + fmt::Debug + Send + Sync + 'static {
    /// Stable tag of this variant
    fn event_type(&self) -> i32;

    /// Marshal the variant's payload (without the tag)
    fn marshal_body(&self, out: &mut BytesMut);

    /// Rebuild the variant registered under `event_type`
    fn unmarshal_body(event_type: i32, body: &[u8]) -> Result<Self, DecodeError>;
}

/// Declare an application event set with fixed numeric tags.
///
/// Each variant wraps one `wire_struct!` payload. Duplicate tags fail to compile.
///
/// ```rust
/// use datagram_protocol::{application_events, wire_struct};
/// use datagram_protocol::protocol::registry::ApplicationEvent;
///
/// wire_struct! {
///     #[derive(Debug, Clone, PartialEq)]
///     pub struct Chat { pub text: String }
/// }
///
/// application_events! {
///     #[derive(Debug, Clone, PartialEq)]
///     pub enum LobbyEvent {
///         Chat(Chat) = 1,
///     }
/// }
///
/// let event = LobbyEvent::from(Chat { text: "gg".into() });
/// assert_eq!(event.event_type(), 1);
/// ```
#[macro_export]
macro_rules! application_events {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident ( $payload:ty ) = $tag:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $name {
            $( $(#[$vmeta])* $variant($payload), )+
        }

        const _: () = {
            let tags: &[i32] = &[$($tag),+];
            let mut i = 0;
            while i < tags.len() {
                let mut j = i + 1;
                while j < tags.len() {
                    if tags[i] == tags[j] {
                        panic!("duplicate application event tag");
                    }
                    j += 1;
                }
                i += 1;
            }
        };

        impl $crate::protocol::registry::ApplicationEvent for $name {
            fn event_type(&self) -> i32 {
                match self {
                    $( Self::$variant(_) => $tag, )+
                }
            }

            fn marshal_body(&self, out: &mut $crate::bytes::BytesMut) {
                match self {
                    $( Self::$variant(payload) => $crate::codec::marshal_into(payload, out), )+
                }
            }

            fn unmarshal_body(
                event_type: i32,
                body: &[u8],
            ) -> ::std::result::Result<Self, $crate::error::DecodeError> {
                match event_type {
                    $( $tag => $crate::codec::unmarshal::<$payload>(body).map(Self::$variant), )+
                    other => ::std::result::Result::Err($crate::error::DecodeError::UnknownEvent(other)),
                }
            }
        }

        $(
            impl ::std::convert::From<$payload> for $name {
                fn from(payload: $payload) -> Self {
                    Self::$variant(payload)
                }
            }
        )+
    };
}

/// Prefix the marshalled body with its message type id.
pub fn frame<E: ApplicationEvent>(message: &Message<E>) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(64);
    out.put_i32(message.kind().id());
    match message {
        Message::Key(m) => marshal_into(m, &mut out),
        Message::Connect(m) => marshal_into(m, &mut out),
        Message::Disconnect(m) => marshal_into(m, &mut out),
        Message::AcceptConnection(m) => marshal_into(m, &mut out),
        Message::RejectConnection(m) => marshal_into(m, &mut out),
        Message::Ping(m) => marshal_into(m, &mut out),
        Message::Event(m) => marshal_into(m, &mut out),
        Message::EventConfirmation(m) => marshal_into(m, &mut out),
    }
    out.to_vec()
}

/// Decode a framed message, reporting why it failed.
pub fn try_unframe<E: ApplicationEvent>(bytes: &[u8]) -> Result<Message<E>, DecodeError> {
    let mut body = bytes;
    let id = read_i32(&mut body)?;
    let kind = MessageKind::from_id(id).ok_or(DecodeError::UnknownMessage(id))?;

    Ok(match kind {
        MessageKind::Key => Message::Key(unmarshal(body)?),
        MessageKind::Connect => Message::Connect(unmarshal(body)?),
        MessageKind::Disconnect => Message::Disconnect(unmarshal(body)?),
        MessageKind::AcceptConnection => Message::AcceptConnection(unmarshal(body)?),
        MessageKind::RejectConnection => Message::RejectConnection(unmarshal(body)?),
        MessageKind::Ping => Message::Ping(unmarshal(body)?),
        MessageKind::Event => Message::Event(unmarshal(body)?),
        MessageKind::EventConfirmation => Message::EventConfirmation(unmarshal(body)?),
    })
}

/// Decode a framed message; `None` on an unknown type id or any marshaller
/// failure. Never panics on arbitrary input.
pub fn unframe<E: ApplicationEvent>(bytes: &[u8]) -> Option<Message<E>> {
    match try_unframe(bytes) {
        Ok(message) => Some(message),
        Err(e) => {
            global_metrics().decode_failure();
            debug!(error = %e, len = bytes.len(), "Dropping undecodable message");
            None
        }
    }
}

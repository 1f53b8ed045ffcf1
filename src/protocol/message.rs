//! Control messages and the generic event carriers.
//!
//! Every struct here declares its wire fields in order with `wire_struct!`; the
//! declaration order is the marshalled order.

use crate::codec::{FieldReader, FieldWriter, Marshal};
use crate::error::DecodeError;
use crate::protocol::registry::{ApplicationEvent, MessageKind};
use crate::utils::crypto::PublicKey;
use crate::wire_struct;

wire_struct! {
    /// Key exchange. Sent in clear; `request_key` asks the peer to answer with
    /// its own public key.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct Key {
        pub request_key: bool,
        pub key: Option<PublicKey>,
    }
}

wire_struct! {
    /// Session request carrying the client's display name.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct Connect {
        pub name: String,
    }
}

wire_struct! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Disconnect {}
}

wire_struct! {
    /// Session accepted; carries the server-assigned client id.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AcceptConnection {
        pub client_id: i32,
    }
}

wire_struct! {
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct RejectConnection {
        pub reason: String,
    }
}

wire_struct! {
    /// Liveness probe. The receiver echoes a ping whose `should_return` is set,
    /// clearing the flag first so the echo is never echoed again.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Ping {
        pub timestamp: i64,
        pub should_return: bool,
    }
}

wire_struct! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventConfirmation {
        pub event_id: i32,
    }
}

/// Carrier for one application event with its per-connection id.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage<E> {
    pub event_id: i32,
    pub event: E,
}

impl<E: ApplicationEvent> Marshal for EventMessage<E> {
    const FIELD_COUNT: usize = 2;

    fn write_fields(&self, w: &mut FieldWriter<'_>) {
        w.field(&self.event_id);
        w.event(&self.event);
    }

    fn read_fields(r: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            event_id: r.field::<i32>()?,
            event: r.event()?,
        })
    }
}

/// Every message that can travel between two endpoints.
#[derive(Debug, Clone, PartialEq)]
pub enum Message<E> {
    Key(Key),
    Connect(Connect),
    Disconnect(Disconnect),
    AcceptConnection(AcceptConnection),
    RejectConnection(RejectConnection),
    Ping(Ping),
    Event(EventMessage<E>),
    EventConfirmation(EventConfirmation),
}

impl<E> Message<E> {
    /// Registry entry for this message
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Key(_) => MessageKind::Key,
            Message::Connect(_) => MessageKind::Connect,
            Message::Disconnect(_) => MessageKind::Disconnect,
            Message::AcceptConnection(_) => MessageKind::AcceptConnection,
            Message::RejectConnection(_) => MessageKind::RejectConnection,
            Message::Ping(_) => MessageKind::Ping,
            Message::Event(_) => MessageKind::Event,
            Message::EventConfirmation(_) => MessageKind::EventConfirmation,
        }
    }

    pub fn event(event_id: i32, event: E) -> Self {
        Message::Event(EventMessage { event_id, event })
    }

    pub fn confirmation(event_id: i32) -> Self {
        Message::EventConfirmation(EventConfirmation { event_id })
    }
}

macro_rules! message_from {
    ($($variant:ident),*) => {
        $(
            impl<E> From<$variant> for Message<E> {
                fn from(msg: $variant) -> Self {
                    Message::$variant(msg)
                }
            }
        )*
    };
}

message_from!(
    Key,
    Connect,
    Disconnect,
    AcceptConnection,
    RejectConnection,
    Ping,
    EventConfirmation
);

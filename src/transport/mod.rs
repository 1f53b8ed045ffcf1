//! # Transport Layer
//!
//! Connectionless datagram transport. One bound UDP socket per endpoint, served
//! by a send loop and a receive loop.

pub mod udp;

pub use udp::{Datagram, ReceiveHandler, Receiver, Sender, Transport};

//! # Session State Machines
//!
//! Client and server orchestration on top of the UDP transport: key exchange,
//! connect/accept/reject, liveness countdowns and per-peer reliable events.

pub mod client;
pub mod server;

pub use client::{Client, ClientListener, ClientState, NoopClientListener};
pub use server::{ClientInfo, NoopServerListener, RemoteClient, Server, ServerListener};

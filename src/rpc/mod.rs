//! RPC Module
//!
//! A lightweight framed-RPC stack over TCP.
//!
//! ## Connection Anatomy
//! Every connection starts with a one-line JSON [`protocol::Handshake`]
//! selecting the codec and the server-side handle timeout. After that the
//! stream is a sequence of frames, each a length-prefixed header segment
//! followed by a length-prefixed body segment.
//!
//! ## Core Mechanisms
//! - **Multiplexing**: one client connection carries many outstanding calls;
//!   responses are correlated by sequence number, not arrival order.
//! - **Typed services**: methods are registered as typed async closures; the
//!   registry decodes arguments and encodes replies with the connection's
//!   codec.
//! - **Supervision**: server handlers run under an optional handle timeout;
//!   client calls run under optional call/connect timeouts.
//! - **Discovery & fan-out**: [`xclient::XClient`] layers server discovery,
//!   load-balanced selection and broadcast over cached clients.

pub mod client;
pub mod codec;
pub mod discovery;
pub mod protocol;
pub mod server;
pub mod service;
pub mod xclient;

pub use client::{Client, ClientOptions};
pub use codec::{CodecKind, Header};
pub use discovery::{Discovery, MultiServerDiscovery, RegistryDiscovery, SelectMode};
pub use protocol::Handshake;
pub use server::Server;
pub use service::Service;
pub use xclient::{BroadcastResult, XClient};

#[cfg(test)]
mod tests;

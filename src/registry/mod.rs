//! Registry Module
//!
//! A minimal heartbeat registry over HTTP. Servers announce themselves with
//! periodic POSTs; discovery clients GET the live set; entries that miss
//! their heartbeat window are swept on read.
//!
//! ## Core Mechanisms
//! - **Heartbeats**: each server runs a background task that re-POSTs its
//!   address on a fixed cadence, comfortably inside the registry TTL.
//! - **TTL Sweep**: liveness is judged lazily — every GET drops entries
//!   whose last heartbeat is older than the TTL, so no reaper task is
//!   needed.
//! - **Header Transport**: the server set travels in a response header,
//!   comma-joined and sorted, so a GET needs no body parsing at all.

pub mod handlers;
pub mod service;

pub use handlers::router;
pub use service::{start_heartbeat, Registry, DEFAULT_REGISTRY_PATH, SERVERS_HEADER, SERVER_HEADER};

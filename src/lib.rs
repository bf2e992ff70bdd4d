//! Distributed Cache & RPC Library
//!
//! This library crate bundles two cooperating infrastructure subsystems that
//! share a peer-addressing model:
//!
//! - **`cache`**: A peer-aware in-memory cache. Named [`cache::Group`]s sit on
//!   top of a byte-budgeted LRU engine; misses are coalesced per key and
//!   resolved either from a remote peer (chosen by consistent hashing) or
//!   from a caller-supplied loader.
//! - **`rpc`**: A lightweight RPC framework. A codec-pluggable framed
//!   protocol over TCP, explicit service registration, a multiplexed client,
//!   and a discovery-backed fan-out client with random/round-robin selection
//!   and broadcast.
//! - **`registry`**: The coordination layer between the two sides of `rpc`:
//!   servers announce themselves with periodic heartbeats, clients discover
//!   the live server set over HTTP, and stale entries are swept by TTL.

pub mod cache;
pub mod registry;
pub mod rpc;

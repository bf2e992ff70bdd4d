//! Peer Wire Protocol
//!
//! Peers serve each other's reads over HTTP: `GET <base>/<group>/<key>`
//! returns `200` with a compact binary body, `404` for an unknown group, and
//! `500` when the group's loader failed. The body is a bincode-encoded
//! [`PeerResponse`] rather than raw bytes so the message can grow fields
//! without breaking older peers.

use serde::{Deserialize, Serialize};

/// Prefix that separates peer traffic from user routes.
pub const DEFAULT_BASE_PATH: &str = "/_cachemesh/";

/// Virtual nodes per real peer on the hash ring.
pub const DEFAULT_REPLICAS: usize = 50;

/// Response body for a peer read.
#[derive(Debug, Serialize, Deserialize)]
pub struct PeerResponse {
    /// The cached value for the requested key.
    pub value: Vec<u8>,
}

//! Peer-Aware Cache Module
//!
//! Implements a namespaced, byte-budgeted in-memory cache that can spill
//! reads to remote peers before falling back to its source of truth.
//!
//! ## Core Mechanisms
//! - **LRU Eviction**: Each group is backed by a recency-ordered store that
//!   evicts from the cold end whenever the configured byte budget is
//!   exceeded.
//! - **Consistent Hashing**: Keys map to peers through a virtual-node hash
//!   ring, so adding a peer only moves a bounded fraction of the key space.
//! - **Single-Flight Loading**: Concurrent misses for the same key collapse
//!   into one load; every waiter observes the shared result.
//! - **HTTP Peer Protocol**: Peers serve each other's reads over
//!   `GET <base>/<group>/<key>` with a compact binary response body.

pub mod group;
pub mod handlers;
pub mod lru;
pub mod pool;
pub mod protocol;
pub mod ring;
pub mod singleflight;
pub mod types;

pub use group::{Getter, Group, GroupRegistry, PeerGetter, PeerPicker};
pub use pool::HttpPool;
pub use types::ByteView;

#[cfg(test)]
mod tests;

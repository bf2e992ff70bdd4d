//! Consistent Hash Ring
//!
//! Maps keys to peers so that every node computes the same ownership
//! independently, and so that peer-set changes only move a bounded fraction
//! of the key space.
//!
//! ## Mechanism
//! - **Virtual nodes**: each real peer contributes `replicas` points on the
//!   ring, hashed from an index-prefixed copy of its name, which smooths the
//!   key distribution.
//! - **Lookup**: the key is hashed and binary-searched to the first virtual
//!   point at or past it; the search wraps around, forming a ring.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::Hasher;

/// Pluggable hash for ring placement. The default folds the std hasher down
/// to 32 bits; tests substitute a deterministic one.
pub type HashFn = Box<dyn Fn(&[u8]) -> u32 + Send + Sync>;

fn default_hash(bytes: &[u8]) -> u32 {
    let mut hasher = DefaultHasher::new();
    hasher.write(bytes);
    hasher.finish() as u32
}

pub struct HashRing {
    replicas: usize,
    hash: HashFn,
    /// All virtual points, kept sorted ascending for binary search.
    points: Vec<u32>,
    /// Virtual point -> real peer name.
    owners: HashMap<u32, String>,
}

impl HashRing {
    pub fn new(replicas: usize) -> Self {
        Self::with_hasher(replicas, Box::new(default_hash))
    }

    pub fn with_hasher(replicas: usize, hash: HashFn) -> Self {
        Self {
            replicas,
            hash,
            points: Vec::new(),
            owners: HashMap::new(),
        }
    }

    /// Adds real peers to the ring. Additive: callers that need to replace
    /// the peer set build a fresh ring instead.
    pub fn add<S: AsRef<str>>(&mut self, keys: &[S]) {
        for key in keys {
            let key = key.as_ref();
            for i in 0..self.replicas {
                let point = (self.hash)(format!("{}{}", i, key).as_bytes());
                self.points.push(point);
                self.owners.insert(point, key.to_string());
            }
        }
        self.points.sort_unstable();
    }

    /// Returns the peer owning `key`, or `None` on an empty ring.
    ///
    /// Stable: the same key maps to the same peer until the peer set
    /// changes.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let hash = (self.hash)(key.as_bytes());
        let idx = match self.points.binary_search(&hash) {
            Ok(idx) => idx,
            Err(idx) => idx % self.points.len(),
        };
        self.owners.get(&self.points[idx]).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

//! HTTP Peer Pool
//!
//! The concrete peer transport: an [`HttpPool`] knows every peer's base URL,
//! maps keys to peers through the hash ring, and hands out [`HttpPeer`]
//! clients that fetch values with a plain GET. The serving side lives in
//! [`super::handlers`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use url::Url;

use super::group::{PeerGetter, PeerPicker};
use super::protocol::{PeerResponse, DEFAULT_BASE_PATH, DEFAULT_REPLICAS};
use super::ring::HashRing;

struct PoolState {
    ring: HashRing,
    getters: HashMap<String, Arc<HttpPeer>>,
}

/// Peer selector backed by a consistent-hash ring over HTTP peers.
pub struct HttpPool {
    /// This node's own base address, e.g. `http://127.0.0.1:8001`.
    self_addr: String,
    base_path: String,
    state: Mutex<PoolState>,
}

impl HttpPool {
    pub fn new(self_addr: &str) -> Self {
        Self::with_base_path(self_addr, DEFAULT_BASE_PATH)
    }

    pub fn with_base_path(self_addr: &str, base_path: &str) -> Self {
        Self {
            self_addr: self_addr.to_string(),
            base_path: base_path.to_string(),
            state: Mutex::new(PoolState {
                ring: HashRing::new(DEFAULT_REPLICAS),
                getters: HashMap::new(),
            }),
        }
    }

    /// Replaces the peer set. The ring and the per-peer clients are rebuilt
    /// from scratch so stale peers cannot linger.
    pub fn set_peers<S: AsRef<str>>(&self, peers: &[S]) {
        let mut ring = HashRing::new(DEFAULT_REPLICAS);
        ring.add(peers);

        let http = reqwest::Client::new();
        let getters = peers
            .iter()
            .map(|peer| {
                let peer = peer.as_ref().to_string();
                let getter = Arc::new(HttpPeer {
                    base_url: format!("{}{}", peer, self.base_path),
                    http: http.clone(),
                });
                (peer, getter)
            })
            .collect();

        let mut state = self.state.lock().expect("pool lock poisoned");
        state.ring = ring;
        state.getters = getters;
    }
}

impl PeerPicker for HttpPool {
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerGetter>> {
        let state = self.state.lock().expect("pool lock poisoned");
        let peer = state.ring.get(key)?;
        if peer == self.self_addr {
            return None;
        }
        tracing::info!("picked peer {} for key {}", peer, key);
        state
            .getters
            .get(peer)
            .map(|getter| getter.clone() as Arc<dyn PeerGetter>)
    }
}

/// HTTP client for a single remote peer.
pub struct HttpPeer {
    /// Peer address including the base path, e.g.
    /// `http://127.0.0.1:8001/_cachemesh/`.
    base_url: String,
    http: reqwest::Client,
}

impl HttpPeer {
    fn url_for(&self, group: &str, key: &str) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)?;
        // push() percent-encodes, so group names and keys survive slashes.
        url.path_segments_mut()
            .map_err(|_| anyhow!("cache: peer address cannot be a base: {}", self.base_url))?
            .pop_if_empty()
            .push(group)
            .push(key);
        Ok(url)
    }
}

#[async_trait]
impl PeerGetter for HttpPeer {
    async fn get(&self, group: &str, key: &str) -> Result<Vec<u8>> {
        let url = self.url_for(group, key)?;
        let response = self.http.get(url).send().await?;

        if !response.status().is_success() {
            return Err(anyhow!("cache: peer returned {}", response.status()));
        }

        let body = response.bytes().await?;
        let decoded: PeerResponse = bincode::deserialize(&body)?;
        Ok(decoded.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_urls_are_escaped() {
        let peer = HttpPeer {
            base_url: "http://127.0.0.1:8001/_cachemesh/".to_string(),
            http: reqwest::Client::new(),
        };

        let url = peer.url_for("scores", "Tom Jones/1").unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:8001/_cachemesh/scores/Tom%20Jones%2F1"
        );
    }

    #[test]
    fn test_pick_peer_skips_self() {
        let pool = HttpPool::new("http://127.0.0.1:8001");
        pool.set_peers(&["http://127.0.0.1:8001"]);

        assert!(pool.pick_peer("any-key").is_none());
    }

    #[test]
    fn test_empty_pool_picks_nobody() {
        let pool = HttpPool::new("http://127.0.0.1:8001");
        assert!(pool.pick_peer("key").is_none());
    }
}

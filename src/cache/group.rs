//! Cache Groups
//!
//! A [`Group`] is a named cache namespace. Reads try the local store first,
//! then (under a single-flight guard) a remote peer chosen by the registered
//! [`PeerPicker`], and finally the caller-supplied [`Getter`] — the source
//! of truth. Whatever the path, the group ends up owning its own copy of the
//! bytes.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;

use super::lru::SharedCache;
use super::singleflight::FlightGroup;
use super::types::ByteView;

/// Source of truth consulted when a key misses everywhere else.
#[async_trait]
pub trait Getter: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
}

type BoxedGetterFn =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send>> + Send + Sync>;

/// Adapts an async closure into a [`Getter`].
pub struct FnGetter {
    load: BoxedGetterFn,
}

impl FnGetter {
    pub fn new<F, Fut>(load: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
    {
        Self {
            load: Arc::new(move |key| Box::pin(load(key))),
        }
    }
}

#[async_trait]
impl Getter for FnGetter {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        (self.load)(key.to_string()).await
    }
}

/// Selects the peer responsible for a key, or `None` when the key belongs
/// to the local node.
pub trait PeerPicker: Send + Sync {
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerGetter>>;
}

/// Fetches a group's value from one remote peer.
#[async_trait]
pub trait PeerGetter: Send + Sync {
    async fn get(&self, group: &str, key: &str) -> Result<Vec<u8>>;
}

/// A named cache namespace.
pub struct Group {
    name: String,
    getter: Box<dyn Getter>,
    main_cache: SharedCache,
    peers: OnceLock<Arc<dyn PeerPicker>>,
    loader: FlightGroup<ByteView>,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group").field("name", &self.name).finish()
    }
}

impl Group {
    fn new(name: &str, cache_bytes: usize, getter: Box<dyn Getter>) -> Self {
        Self {
            name: name.to_string(),
            getter,
            main_cache: SharedCache::new(cache_bytes),
            peers: OnceLock::new(),
            loader: FlightGroup::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wires in peer selection. A group accepts a picker at most once.
    pub fn register_peer_picker(&self, peers: Arc<dyn PeerPicker>) -> Result<()> {
        self.peers
            .set(peers)
            .map_err(|_| anyhow!("cache: peer picker registered more than once"))
    }

    /// Looks up `key`, loading it on a miss. Concurrent misses for the same
    /// key collapse into one load.
    pub async fn get(&self, key: &str) -> Result<ByteView> {
        if key.is_empty() {
            return Ok(ByteView::default());
        }

        if let Some(value) = self.main_cache.get(key) {
            tracing::debug!("cache hit for {} in group {}", key, self.name);
            return Ok(value);
        }

        self.load(key).await
    }

    async fn load(&self, key: &str) -> Result<ByteView> {
        self.loader
            .run(key, || async {
                if let Some(peers) = self.peers.get() {
                    if let Some(peer) = peers.pick_peer(key) {
                        match peer.get(&self.name, key).await {
                            Ok(bytes) => return Ok(ByteView::from(bytes)),
                            Err(err) => {
                                tracing::warn!(
                                    "failed to get {} from peer, falling back: {}",
                                    key,
                                    err
                                );
                            }
                        }
                    }
                }
                self.get_locally(key).await
            })
            .await
    }

    async fn get_locally(&self, key: &str) -> Result<ByteView> {
        let bytes = self.getter.get(key).await?;
        let value = ByteView::from(bytes);
        self.main_cache.insert(key, value.clone());
        Ok(value)
    }
}

/// Explicit container for the groups of one process. Scoped rather than
/// global so tests and embedders can run several side by side.
pub struct GroupRegistry {
    groups: DashMap<String, Arc<Group>>,
}

impl GroupRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            groups: DashMap::new(),
        })
    }

    /// Creates and registers a group. Names are unique per registry.
    pub fn add_group<G>(&self, name: &str, cache_bytes: usize, getter: G) -> Result<Arc<Group>>
    where
        G: Getter + 'static,
    {
        let group = Arc::new(Group::new(name, cache_bytes, Box::new(getter)));
        match self.groups.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(anyhow!("cache: group already defined: {}", name))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(group.clone());
                Ok(group)
            }
        }
    }

    pub fn get_group(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.get(name).map(|entry| entry.value().clone())
    }
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self {
            groups: DashMap::new(),
        }
    }
}

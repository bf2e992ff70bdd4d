//! Service Discovery
//!
//! Supplies the fan-out client with server addresses. The static variant
//! holds a caller-maintained list; the registry-backed variant refreshes the
//! list from the heartbeat registry, at most once per update interval.
//!
//! Addresses use the discovery format `"<protocol>@<host:port>"`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::RwLock;

use crate::registry::SERVERS_HEADER;

/// Load-balancing strategy for picking one server out of many.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    Random,
    RoundRobin,
}

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Re-reads the server list from the backing source, if any.
    async fn refresh(&self) -> Result<()>;
    /// Replaces the server list by hand.
    async fn update(&self, servers: Vec<String>) -> Result<()>;
    /// Picks one server according to `mode`.
    async fn get(&self, mode: SelectMode) -> Result<String>;
    /// Returns the whole current server list.
    async fn get_all(&self) -> Result<Vec<String>>;
}

/// Discovery over a hand-maintained server list.
pub struct MultiServerDiscovery {
    servers: RwLock<Vec<String>>,
    /// Round-robin cursor; starts at a random offset so a fleet of fresh
    /// clients does not stampede the first server.
    index: AtomicUsize,
}

impl MultiServerDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers: RwLock::new(servers),
            index: AtomicUsize::new(rand::thread_rng().gen_range(0..u32::MAX as usize)),
        }
    }
}

#[async_trait]
impl Discovery for MultiServerDiscovery {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        *self.servers.write().await = servers;
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        let servers = self.servers.read().await;
        let n = servers.len();
        if n == 0 {
            return Err(anyhow!("rpc discovery: no available servers"));
        }
        match mode {
            SelectMode::Random => Ok(servers[rand::thread_rng().gen_range(0..n)].clone()),
            SelectMode::RoundRobin => {
                let index = self.index.fetch_add(1, Ordering::Relaxed);
                Ok(servers[index % n].clone())
            }
        }
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        Ok(self.servers.read().await.clone())
    }
}

/// Default interval between registry refreshes.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Discovery backed by the heartbeat registry.
///
/// The registry is consulted lazily: a refresh inside the update interval
/// is a no-op, and a failed refresh leaves the previous list intact.
pub struct RegistryDiscovery {
    inner: MultiServerDiscovery,
    registry_url: String,
    update_interval: Duration,
    last_update: Mutex<Option<Instant>>,
    http: reqwest::Client,
}

impl RegistryDiscovery {
    pub fn new(registry_url: &str, update_interval: Option<Duration>) -> Self {
        Self {
            inner: MultiServerDiscovery::new(Vec::new()),
            registry_url: registry_url.to_string(),
            update_interval: update_interval.unwrap_or(DEFAULT_UPDATE_INTERVAL),
            last_update: Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    fn is_fresh(&self) -> bool {
        let last_update = self.last_update.lock().expect("last_update poisoned");
        matches!(*last_update, Some(at) if at.elapsed() < self.update_interval)
    }

    fn mark_updated(&self) {
        *self.last_update.lock().expect("last_update poisoned") = Some(Instant::now());
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<()> {
        if self.is_fresh() {
            return Ok(());
        }
        tracing::info!("refreshing servers from registry {}", self.registry_url);

        let response = self.http.get(&self.registry_url).send().await?;
        let header = response
            .headers()
            .get(SERVERS_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| anyhow!("rpc discovery: registry response missing servers header"))?;

        let servers: Vec<String> = header
            .split(',')
            .map(str::trim)
            .filter(|server| !server.is_empty())
            .map(str::to_string)
            .collect();

        self.inner.update(servers).await?;
        self.mark_updated();
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.inner.update(servers).await?;
        self.mark_updated();
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.refresh().await?;
        self.inner.get(mode).await
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        self.refresh().await?;
        self.inner.get_all().await
    }
}

//! Registry Core & Heartbeat Task
//!
//! The registry itself is an address table with a TTL; everything dynamic
//! happens on read. The heartbeat half lives here too so servers and the
//! registry agree on defaults.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use dashmap::DashMap;

/// Path the registry endpoint is mounted on.
pub const DEFAULT_REGISTRY_PATH: &str = "/_rpc_/registry";

/// Response header carrying the comma-joined live server set.
pub const SERVERS_HEADER: &str = "X-Rpc-Servers";

/// Request header carrying one server's address on a heartbeat POST.
pub const SERVER_HEADER: &str = "X-Rpc-Server";

/// Entries older than this are swept. Heartbeats default to arriving one
/// minute ahead of it.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Live-server table: address to last-heartbeat time.
pub struct Registry {
    ttl: Duration,
    servers: DashMap<String, Instant>,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    /// A zero TTL means entries never expire.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            servers: DashMap::new(),
        }
    }

    /// Adds a server or refreshes its heartbeat time.
    pub fn put_server(&self, addr: &str) {
        self.servers.insert(addr.to_string(), Instant::now());
    }

    /// Sweeps expired entries and returns the sorted live set.
    pub fn alive_servers(&self) -> Vec<String> {
        if !self.ttl.is_zero() {
            self.servers
                .retain(|_, heartbeat| heartbeat.elapsed() <= self.ttl);
        }
        let mut alive: Vec<String> = self
            .servers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        alive.sort();
        alive
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the heartbeat task for one server.
///
/// POSTs immediately, then on every tick. The default cadence is the
/// registry TTL minus a minute, leaving room for a slow round trip. The
/// task gives up after the first failed send; failures are logged, not
/// retried.
pub fn start_heartbeat(
    registry_url: &str,
    addr: &str,
    period: Option<Duration>,
) -> tokio::task::JoinHandle<()> {
    let period = period.unwrap_or(DEFAULT_TTL - Duration::from_secs(60));
    let registry_url = registry_url.to_string();
    let addr = addr.to_string();

    tokio::spawn(async move {
        let http = reqwest::Client::new();
        let mut ticks = tokio::time::interval(period);
        loop {
            ticks.tick().await;
            if let Err(err) = send_heartbeat(&http, &registry_url, &addr).await {
                tracing::error!("rpc registry: heartbeat failed: {}", err);
                break;
            }
        }
    })
}

async fn send_heartbeat(http: &reqwest::Client, registry_url: &str, addr: &str) -> Result<()> {
    tracing::debug!("{} sends heartbeat to registry {}", addr, registry_url);
    let response = http
        .post(registry_url)
        .header(SERVER_HEADER, addr)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(anyhow!("registry returned {}", response.status()));
    }
    Ok(())
}

//! Discovery-Backed Fan-Out Client
//!
//! [`XClient`] layers three things over [`Client`]: discovery (where are the
//! servers), selection (which one takes this call), and a connection cache
//! keyed by address (dead clients are closed and re-dialed on next use). It
//! also offers [`XClient::broadcast`], which fans one call out to every
//! known server with fail-fast cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use super::client::{Client, ClientOptions};
use super::discovery::{Discovery, SelectMode};

/// Outcome of a broadcast.
///
/// The fan-out deliberately reports the first error even when another peer
/// produced a reply, so both slots are exposed; [`BroadcastResult::into_result`]
/// applies that error-wins rule, and callers that want succeed-if-any can
/// inspect `reply` directly.
pub struct BroadcastResult<R> {
    /// First successful reply, if any peer produced one.
    pub reply: Option<R>,
    /// First failure, if any peer produced one.
    pub error: Option<Error>,
}

impl<R> BroadcastResult<R> {
    pub fn into_result(self) -> Result<R> {
        match self.error {
            Some(error) => Err(error),
            None => self
                .reply
                .ok_or_else(|| anyhow!("rpc client: broadcast produced no reply")),
        }
    }
}

struct BroadcastState<R> {
    reply: Option<R>,
    error: Option<Error>,
}

pub struct XClient {
    discovery: Arc<dyn Discovery>,
    mode: SelectMode,
    opts: ClientOptions,
    clients: tokio::sync::Mutex<HashMap<String, Arc<Client>>>,
}

impl XClient {
    pub fn new(discovery: Arc<dyn Discovery>, mode: SelectMode, opts: ClientOptions) -> Self {
        Self {
            discovery,
            mode,
            opts,
            clients: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Closes and drops every cached client.
    pub async fn close(&self) {
        let mut clients = self.clients.lock().await;
        for (addr, client) in clients.drain() {
            tracing::debug!("closing cached client for {}", addr);
            let _ = client.close().await;
        }
    }

    /// Picks one server by the configured mode and delegates the call.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + Sync,
        R: DeserializeOwned,
    {
        let rpc_addr = self.discovery.get(self.mode).await?;
        self.call_addr(&rpc_addr, service_method, args, None).await
    }

    /// Like [`XClient::call`] with a per-call deadline.
    pub async fn call_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R>
    where
        A: Serialize + Sync,
        R: DeserializeOwned,
    {
        let rpc_addr = self.discovery.get(self.mode).await?;
        self.call_addr(&rpc_addr, service_method, args, Some(timeout))
            .await
    }

    /// Fans the call out to every discovered server.
    ///
    /// The first failure fires a shared cancel signal that aborts peers
    /// still in flight; the first successful reply is kept. Every branch
    /// has completed by the time this returns.
    pub async fn broadcast<A, R>(
        &self,
        service_method: &str,
        args: &A,
        timeout: Option<Duration>,
    ) -> BroadcastResult<R>
    where
        A: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let servers = match self.discovery.get_all().await {
            Ok(servers) => servers,
            Err(error) => {
                return BroadcastResult {
                    reply: None,
                    error: Some(error),
                }
            }
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let state = Mutex::new(BroadcastState::<R> {
            reply: None,
            error: None,
        });

        let calls = servers.iter().map(|rpc_addr| {
            let mut cancel = cancel_rx.clone();
            let state = &state;
            let cancel_tx = &cancel_tx;
            async move {
                let result = self
                    .broadcast_call::<A, R>(rpc_addr, service_method, args, timeout, &mut cancel)
                    .await;

                let mut state = state.lock().expect("broadcast state poisoned");
                match result {
                    Ok(reply) => {
                        if state.reply.is_none() {
                            state.reply = Some(reply);
                        }
                    }
                    Err(error) => {
                        if state.error.is_none() {
                            state.error = Some(error);
                            // Fail fast: abort the peers still in flight.
                            let _ = cancel_tx.send(true);
                        }
                    }
                }
            }
        });
        futures::future::join_all(calls).await;

        let state = state.into_inner().expect("broadcast state poisoned");
        BroadcastResult {
            reply: state.reply,
            error: state.error,
        }
    }

    async fn call_addr<A, R>(
        &self,
        rpc_addr: &str,
        service_method: &str,
        args: &A,
        timeout: Option<Duration>,
    ) -> Result<R>
    where
        A: Serialize + Sync,
        R: DeserializeOwned,
    {
        let client = self.dial_cached(rpc_addr).await?;
        match timeout {
            Some(timeout) => client.call_timeout(service_method, args, timeout).await,
            None => client.call(service_method, args).await,
        }
    }

    async fn broadcast_call<A, R>(
        &self,
        rpc_addr: &str,
        service_method: &str,
        args: &A,
        timeout: Option<Duration>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<R>
    where
        A: Serialize + Sync,
        R: DeserializeOwned,
    {
        let client = self.dial_cached(rpc_addr).await?;
        match timeout {
            None => client.call_cancellable(service_method, args, cancel).await,
            Some(timeout) => {
                match tokio::time::timeout(
                    timeout,
                    client.call_cancellable(service_method, args, cancel),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!(
                        "rpc client: call failed: deadline exceeded after {:?}",
                        timeout
                    )),
                }
            }
        }
    }

    /// Returns a live cached client for the address, re-dialing when the
    /// cached one has died.
    async fn dial_cached(&self, rpc_addr: &str) -> Result<Arc<Client>> {
        let mut clients = self.clients.lock().await;

        if let Some(client) = clients.get(rpc_addr) {
            if client.is_available() {
                return Ok(client.clone());
            }
            let _ = client.close().await;
            clients.remove(rpc_addr);
        }

        let client = Client::dial_rpc_addr(rpc_addr, self.opts.clone()).await?;
        clients.insert(rpc_addr.to_string(), client.clone());
        Ok(client)
    }
}

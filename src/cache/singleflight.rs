//! Single-Flight Coalescer
//!
//! Collapses concurrent requests for the same key into one underlying
//! computation. The first caller runs the work; everyone else waits on its
//! completion signal and shares the outcome. Entries are removed as soon as
//! the work resolves — the coalescer deduplicates in-flight work, it does
//! not cache results.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use tokio::sync::broadcast;

/// Outcome shared with waiters. Errors cross the channel as messages
/// because the underlying error type is not clonable.
type SharedOutcome<T> = Result<T, String>;

pub struct FlightGroup<T: Clone> {
    inflight: Mutex<HashMap<String, broadcast::Sender<SharedOutcome<T>>>>,
}

impl<T: Clone + Send + 'static> FlightGroup<T> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `work` for `key` unless an identical call is already in flight,
    /// in which case the shared result is awaited instead.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let waiter = {
            let mut inflight = self.inflight.lock().expect("flight table poisoned");
            match inflight.get(key) {
                Some(leader) => Some(leader.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    inflight.insert(key.to_string(), tx);
                    None
                }
            }
        };

        if let Some(mut rx) = waiter {
            return match rx.recv().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(message)) => Err(anyhow!(message)),
                // The leader dropped without publishing; treat as failure.
                Err(_) => Err(anyhow!("in-flight call dropped")),
            };
        }

        let result = work().await;

        let shared = match &result {
            Ok(value) => Ok(value.clone()),
            Err(err) => Err(err.to_string()),
        };
        let mut inflight = self.inflight.lock().expect("flight table poisoned");
        if let Some(tx) = inflight.remove(key) {
            // No waiters is fine; send only fails when nobody subscribed.
            let _ = tx.send(shared);
        }

        result
    }
}

impl<T: Clone + Send + 'static> Default for FlightGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

//! Cache Module Tests
//!
//! Scenario coverage for the read path: loader fallback and hit counting,
//! single-flight collapsing under concurrency, and a two-node peer fetch
//! over real sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use dashmap::DashMap;

use super::group::{FnGetter, GroupRegistry, PeerPicker};
use super::handlers::peer_router;
use super::pool::HttpPool;

fn scores_db() -> HashMap<String, String> {
    HashMap::from([
        ("Tom".to_string(), "630".to_string()),
        ("Jack".to_string(), "589".to_string()),
        ("Sam".to_string(), "567".to_string()),
    ])
}

#[tokio::test]
async fn test_group_loads_once_per_key() {
    let db = scores_db();
    let load_counts: Arc<DashMap<String, usize>> = Arc::new(DashMap::new());

    let counts = load_counts.clone();
    let getter = FnGetter::new(move |key: String| {
        let db = db.clone();
        let counts = counts.clone();
        async move {
            match db.get(&key) {
                Some(value) => {
                    *counts.entry(key).or_insert(0) += 1;
                    Ok(value.clone().into_bytes())
                }
                None => Err(anyhow!("{} not exist", key)),
            }
        }
    });

    let registry = GroupRegistry::new();
    let group = registry.add_group("scores", 2 << 10, getter).unwrap();

    for (key, want) in scores_db() {
        // First read goes to the loader.
        let view = group.get(&key).await.unwrap();
        assert_eq!(view.to_string(), want);
        // Second read is a cache hit.
        let view = group.get(&key).await.unwrap();
        assert_eq!(view.to_string(), want);
        assert_eq!(*load_counts.get(&key).unwrap(), 1);
    }

    let err = group.get("unknown").await.unwrap_err();
    assert!(err.to_string().contains("not exist"));
}

#[tokio::test]
async fn test_empty_key_returns_empty_view() {
    let registry = GroupRegistry::new();
    let group = registry
        .add_group(
            "empty",
            1024,
            FnGetter::new(|_key| async { Err(anyhow!("loader must not run")) }),
        )
        .unwrap();

    let view = group.get("").await.unwrap();
    assert!(view.is_empty());
}

#[tokio::test]
async fn test_duplicate_group_name_rejected() {
    let registry = GroupRegistry::new();
    registry
        .add_group("dup", 1024, FnGetter::new(|key: String| async move {
            Ok(key.into_bytes())
        }))
        .unwrap();

    let err = registry
        .add_group("dup", 1024, FnGetter::new(|key: String| async move {
            Ok(key.into_bytes())
        }))
        .unwrap_err();
    assert!(err.to_string().contains("already defined"));
}

#[tokio::test]
async fn test_concurrent_misses_collapse_to_one_load() {
    let load_count = Arc::new(AtomicUsize::new(0));

    let counter = load_count.clone();
    let getter = FnGetter::new(move |key: String| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            Ok(key.into_bytes())
        }
    });

    let registry = GroupRegistry::new();
    let group = registry.add_group("burst", 1 << 20, getter).unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let group = group.clone();
        handles.push(tokio::spawn(async move { group.get("hot-key").await }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().to_string(), "hot-key");
    }

    assert_eq!(load_count.load(Ordering::SeqCst), 1);
}

/// Installs the log subscriber so a failing test shows the peer-selection
/// and fallback traces. Repeat calls are no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Spins up a peer node: a group registry with a loader over `db`, served
/// by the peer router on an ephemeral port. Returns its base address.
async fn start_peer_node(db: HashMap<String, String>) -> (String, Arc<GroupRegistry>) {
    init_tracing();
    let getter = FnGetter::new(move |key: String| {
        let db = db.clone();
        async move {
            db.get(&key)
                .map(|value| value.clone().into_bytes())
                .ok_or_else(|| anyhow!("{} not exist", key))
        }
    });

    let registry = GroupRegistry::new();
    registry.add_group("scores", 1 << 20, getter).unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("http://{}", listener.local_addr().unwrap());
    let app = peer_router(registry.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, registry)
}

#[tokio::test]
async fn test_get_from_remote_peer() {
    // The remote peer knows the answers; the local node's loader always
    // fails, so any value must have come over the wire.
    let (peer_addr, _peer_registry) = start_peer_node(scores_db()).await;

    let local_registry = GroupRegistry::new();
    let group = local_registry
        .add_group(
            "scores",
            1 << 20,
            FnGetter::new(|key: String| async move { Err(anyhow!("{} not exist", key)) }),
        )
        .unwrap();

    // Only the remote peer is in the pool, so every key picks it.
    let pool = Arc::new(HttpPool::new("http://127.0.0.1:1"));
    pool.set_peers(&[peer_addr]);
    group
        .register_peer_picker(pool.clone() as Arc<dyn PeerPicker>)
        .unwrap();

    let view = group.get("Tom").await.unwrap();
    assert_eq!(view.to_string(), "630");

    // A key unknown on both sides falls back to the local loader's error.
    let err = group.get("unknown").await.unwrap_err();
    assert!(err.to_string().contains("not exist"));
}

#[tokio::test]
async fn test_peer_picker_registered_once() {
    let registry = GroupRegistry::new();
    let group = registry
        .add_group("single", 1024, FnGetter::new(|key: String| async move {
            Ok(key.into_bytes())
        }))
        .unwrap();

    let pool = Arc::new(HttpPool::new("http://127.0.0.1:1"));
    group
        .register_peer_picker(pool.clone() as Arc<dyn PeerPicker>)
        .unwrap();
    assert!(group
        .register_peer_picker(pool as Arc<dyn PeerPicker>)
        .is_err());
}

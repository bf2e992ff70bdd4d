//! RPC Module Tests
//!
//! End-to-end coverage over real sockets: call round trips, multiplexing,
//! both timeout layers, in-band dispatch errors, HTTP tunneling, and the
//! fan-out client's call and broadcast paths.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use super::client::{Client, ClientOptions};
use super::codec::CodecKind;
use super::discovery::{MultiServerDiscovery, SelectMode};
use super::server::Server;
use super::service::Service;
use super::xclient::XClient;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SumArgs {
    num1: i64,
    num2: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SleepArgs {
    millis: u64,
}

/// Installs the log subscriber so a failing test shows the server and
/// client traces for the path under test. Repeat calls are no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// `Arith.Sum` adds; `Arith.Sleep` stalls for the requested time and then
/// returns it, which makes both timeout layers easy to probe.
fn arith_service() -> Service {
    Service::new("Arith")
        .method("Sum", |args: SumArgs| async move {
            Ok(args.num1 + args.num2)
        })
        .method("Sleep", |args: SleepArgs| async move {
            tokio::time::sleep(Duration::from_millis(args.millis)).await;
            Ok(args.millis)
        })
}

async fn start_server() -> String {
    init_tracing();
    let server = Server::new();
    server.register(arith_service()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(server.serve(listener));
    addr
}

/// A server whose `Echo.Tag` replies with a fixed tag after a fixed delay.
/// Used to tell broadcast responders apart.
async fn start_tagged_server(tag: u64, delay: Duration) -> String {
    init_tracing();
    let server = Server::new();
    server
        .register(Service::new("Echo").method("Tag", move |_args: ()| async move {
            tokio::time::sleep(delay).await;
            Ok(tag)
        }))
        .unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(server.serve(listener));
    addr
}

#[tokio::test]
async fn test_call_round_trip() {
    let addr = start_server().await;
    let client = Client::dial(&addr, ClientOptions::default()).await.unwrap();

    let reply: i64 = client
        .call("Arith.Sum", &SumArgs { num1: 1, num2: 2 })
        .await
        .unwrap();
    assert_eq!(reply, 3);
}

#[tokio::test]
async fn test_concurrent_calls_multiplex_one_connection() {
    let addr = start_server().await;
    let client = Client::dial(&addr, ClientOptions::default()).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..10i64 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let reply: i64 = client
                .call("Arith.Sum", &SumArgs { num1: i, num2: i * i })
                .await?;
            Ok::<_, anyhow::Error>((i, reply))
        }));
    }
    for handle in handles {
        let (i, reply) = handle.await.unwrap().unwrap();
        assert_eq!(reply, i + i * i);
    }
}

#[tokio::test]
async fn test_json_codec_round_trip() {
    let addr = start_server().await;
    let opts = ClientOptions {
        codec: CodecKind::Json,
        ..ClientOptions::default()
    };
    let client = Client::dial(&addr, opts).await.unwrap();

    let reply: i64 = client
        .call("Arith.Sum", &SumArgs { num1: 20, num2: 22 })
        .await
        .unwrap();
    assert_eq!(reply, 42);
}

#[tokio::test]
async fn test_dispatch_errors_travel_in_band() {
    let addr = start_server().await;
    let client = Client::dial(&addr, ClientOptions::default()).await.unwrap();

    let err = client
        .call::<_, i64>("Arith.Nope", &SumArgs { num1: 1, num2: 2 })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("can't find method"));

    let err = client
        .call::<_, i64>("Nope.Sum", &SumArgs { num1: 1, num2: 2 })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("can't find service"));

    // The connection survives dispatch errors.
    let reply: i64 = client
        .call("Arith.Sum", &SumArgs { num1: 2, num2: 3 })
        .await
        .unwrap();
    assert_eq!(reply, 5);
}

#[tokio::test]
async fn test_server_handle_timeout() {
    let addr = start_server().await;
    let opts = ClientOptions {
        handle_timeout: Duration::from_millis(100),
        ..ClientOptions::default()
    };
    let client = Client::dial(&addr, opts).await.unwrap();

    let err = client
        .call::<_, u64>("Arith.Sleep", &SleepArgs { millis: 2_000 })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("handle timeout"));

    // A request inside the budget still succeeds on the same connection.
    let reply: u64 = client
        .call("Arith.Sleep", &SleepArgs { millis: 0 })
        .await
        .unwrap();
    assert_eq!(reply, 0);
}

#[tokio::test]
async fn test_client_call_timeout() {
    let addr = start_server().await;
    let client = Client::dial(&addr, ClientOptions::default()).await.unwrap();

    let err = client
        .call_timeout::<_, u64>(
            "Arith.Sleep",
            &SleepArgs { millis: 2_000 },
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("call failed"));

    // The late response is discarded as stale; the client keeps working.
    let reply: i64 = client
        .call("Arith.Sum", &SumArgs { num1: 1, num2: 1 })
        .await
        .unwrap();
    assert_eq!(reply, 2);
}

#[tokio::test]
async fn test_closed_client_refuses_calls() {
    let addr = start_server().await;
    let client = Client::dial(&addr, ClientOptions::default()).await.unwrap();

    client.close().await.unwrap();
    assert!(!client.is_available());

    let err = client
        .call::<_, i64>("Arith.Sum", &SumArgs { num1: 1, num2: 2 })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("shut down"));
}

#[tokio::test]
async fn test_http_tunneled_dial() {
    init_tracing();
    let server = Server::new();
    server.register(arith_service()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(server.serve_http(listener));

    let client = Client::dial_http(&addr, ClientOptions::default())
        .await
        .unwrap();
    let reply: i64 = client
        .call("Arith.Sum", &SumArgs { num1: 7, num2: 8 })
        .await
        .unwrap();
    assert_eq!(reply, 15);
}

#[tokio::test]
async fn test_tunnel_rejects_plain_requests() {
    init_tracing();
    let server = Server::new();
    server.register(arith_service()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(server.serve_http(listener));

    let response = reqwest::Client::new()
        .get(format!("http://{}/_rpc_", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 405);
}

#[tokio::test]
async fn test_xclient_calls_through_discovery() {
    let addr1 = start_server().await;
    let addr2 = start_server().await;

    let discovery = Arc::new(MultiServerDiscovery::new(vec![
        format!("tcp@{}", addr1),
        format!("tcp@{}", addr2),
    ]));
    let xclient = XClient::new(discovery, SelectMode::RoundRobin, ClientOptions::default());

    for i in 0..6i64 {
        let reply: i64 = xclient
            .call("Arith.Sum", &SumArgs { num1: i, num2: 1 })
            .await
            .unwrap();
        assert_eq!(reply, i + 1);
    }
    xclient.close().await;
}

#[tokio::test]
async fn test_broadcast_collects_one_reply() {
    let addrs = vec![
        format!("tcp@{}", start_tagged_server(1, Duration::ZERO).await),
        format!("tcp@{}", start_tagged_server(2, Duration::ZERO).await),
        format!("tcp@{}", start_tagged_server(3, Duration::ZERO).await),
    ];
    let discovery = Arc::new(MultiServerDiscovery::new(addrs));
    let xclient = XClient::new(discovery, SelectMode::Random, ClientOptions::default());

    let result = xclient.broadcast::<(), u64>("Echo.Tag", &(), None).await;
    assert!(result.error.is_none());
    let reply = result.reply.unwrap();
    assert!((1..=3).contains(&reply));
    xclient.close().await;
}

#[tokio::test]
async fn test_broadcast_reports_first_error_but_keeps_fast_reply() {
    // Two fast responders and one that blows the deadline.
    let addrs = vec![
        format!("tcp@{}", start_tagged_server(1, Duration::ZERO).await),
        format!("tcp@{}", start_tagged_server(2, Duration::ZERO).await),
        format!(
            "tcp@{}",
            start_tagged_server(3, Duration::from_secs(5)).await
        ),
    ];
    let discovery = Arc::new(MultiServerDiscovery::new(addrs));
    let xclient = XClient::new(discovery, SelectMode::Random, ClientOptions::default());

    let result = xclient
        .broadcast::<(), u64>("Echo.Tag", &(), Some(Duration::from_millis(300)))
        .await;

    // The slow peer failed the whole broadcast, by design, yet the reply
    // slot holds a fast responder's answer.
    let reply = *result.reply.as_ref().unwrap();
    assert!(reply == 1 || reply == 2);
    let message = result.error.as_ref().unwrap().to_string();
    assert!(message.contains("call failed"));

    // Error-wins: the combined view is still a failure.
    assert!(result.into_result().is_err());
    xclient.close().await;
}

#[tokio::test]
async fn test_bad_magic_number_closes_connection() {
    let addr = start_server().await;

    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;
    let mut stream = tokio::net::TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(b"{\"magic_number\":1,\"codec\":\"bincode\",\"connect_timeout_ms\":0,\"handle_timeout_ms\":0}\n")
        .await
        .unwrap();

    // The server hangs up without answering.
    let mut buf = Vec::new();
    let n = stream.read_to_end(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}

//! RPC Client
//!
//! One [`Client`] owns one connection and multiplexes any number of
//! concurrent calls over it. Requests get a strictly increasing sequence
//! number and park a completion channel in the pending table; a background
//! receive loop drains responses serially and wakes the matching caller.
//! Responses may arrive in any order — correlation is by sequence number.
//!
//! `closing` (the user hung up) and `shutdown` (the connection died) are
//! monotone terminal states: once either is set, new calls are refused and,
//! on shutdown, everything pending fails with the fatal error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};

use super::codec::{CodecKind, FrameReader, FrameWriter, Header};
use super::protocol::{
    Handshake, CONNECTED_STATUS, DEFAULT_CONNECT_TIMEOUT, DEFAULT_RPC_PATH, MAGIC_NUMBER,
};

/// Per-connection client configuration, carried to the server in the
/// handshake.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub codec: CodecKind,
    /// Bounds dial + handshake; zero waits forever.
    pub connect_timeout: Duration,
    /// Server-side per-request budget for this connection; zero means none.
    pub handle_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            codec: CodecKind::Bincode,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

/// Response payload or in-band error message for one call.
type CallReply = Result<Vec<u8>, String>;

pub struct Client {
    kind: CodecKind,
    seq: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<CallReply>>>,
    sending: tokio::sync::Mutex<FrameWriter<OwnedWriteHalf>>,
    closing: AtomicBool,
    shutdown: AtomicBool,
}

impl Client {
    /// Dials a raw-TCP endpoint and performs the handshake, bounded by the
    /// connect timeout.
    pub async fn dial(addr: &str, opts: ClientOptions) -> Result<Arc<Client>> {
        let connect_timeout = opts.connect_timeout;
        with_connect_timeout(connect_timeout, async move {
            let stream = TcpStream::connect(addr).await?;
            let (read_half, write_half) = stream.into_split();
            Self::from_split(BufReader::new(read_half), write_half, &opts).await
        })
        .await
    }

    /// Dials through an HTTP CONNECT tunnel: after the server's success
    /// status the same socket switches to raw framing.
    pub async fn dial_http(addr: &str, opts: ClientOptions) -> Result<Arc<Client>> {
        let connect_timeout = opts.connect_timeout;
        with_connect_timeout(connect_timeout, async move {
            let stream = TcpStream::connect(addr).await?;
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);

            write_half
                .write_all(format!("CONNECT {} HTTP/1.0\r\n\r\n", DEFAULT_RPC_PATH).as_bytes())
                .await?;

            let mut status_line = String::new();
            reader.read_line(&mut status_line).await?;
            if !status_line.contains(CONNECTED_STATUS) {
                return Err(anyhow!(
                    "rpc client: unexpected HTTP response: {}",
                    status_line.trim()
                ));
            }
            // Consume the blank line ending the response head.
            let mut blank = String::new();
            reader.read_line(&mut blank).await?;

            Self::from_split(reader, write_half, &opts).await
        })
        .await
    }

    /// Dials a discovery-format address, `"<protocol>@<host:port>"`.
    /// `http` tunnels; anything else is a raw transport dial.
    pub async fn dial_rpc_addr(rpc_addr: &str, opts: ClientOptions) -> Result<Arc<Client>> {
        let Some((protocol, addr)) = rpc_addr.split_once('@') else {
            return Err(anyhow!(
                "rpc client: wrong address format '{}', expect protocol@addr",
                rpc_addr
            ));
        };
        match protocol {
            "http" => Self::dial_http(addr, opts).await,
            _ => Self::dial(addr, opts).await,
        }
    }

    async fn from_split(
        reader: BufReader<OwnedReadHalf>,
        write_half: OwnedWriteHalf,
        opts: &ClientOptions,
    ) -> Result<Arc<Client>> {
        let mut writer = FrameWriter::new(write_half, opts.codec);

        let handshake = Handshake {
            magic_number: MAGIC_NUMBER,
            codec: opts.codec,
            connect_timeout_ms: opts.connect_timeout.as_millis() as u64,
            handle_timeout_ms: opts.handle_timeout.as_millis() as u64,
        };
        let mut line = serde_json::to_string(&handshake)?;
        line.push('\n');
        writer.send_raw(line.as_bytes()).await?;

        let client = Arc::new(Client {
            kind: opts.codec,
            seq: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            sending: tokio::sync::Mutex::new(writer),
            closing: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });

        let frames = FrameReader::new(reader, opts.codec);
        let receiver = client.clone();
        tokio::spawn(async move {
            receiver.receive_loop(frames).await;
        });

        Ok(client)
    }

    /// True until the user closes the client or the connection dies.
    pub fn is_available(&self) -> bool {
        !self.closing.load(Ordering::SeqCst) && !self.shutdown.load(Ordering::SeqCst)
    }

    /// Hangs up. Pending calls fail as the receive loop notices the closed
    /// connection.
    pub async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("rpc client: connection is shut down"));
        }
        self.sending.lock().await.shutdown().await
    }

    /// Calls `service_method`, waiting as long as it takes.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + Sync,
        R: DeserializeOwned,
    {
        let (_seq, rx) = self.start_call(service_method, args).await?;
        decode_reply(self.kind, rx.await)
    }

    /// Calls with a deadline. On expiry the pending entry is removed and a
    /// late response, should it still arrive, is discarded as stale.
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
        if timeout.is_zero() {
            return self.call(service_method, args).await;
        }
        let (seq, rx) = self.start_call(service_method, args).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(reply) => decode_reply(self.kind, reply),
            Err(_) => {
                self.remove_call(seq);
                Err(anyhow!(
                    "rpc client: call failed: deadline exceeded after {:?}",
                    timeout
                ))
            }
        }
    }

    /// Calls under a shared cancellation signal; used by broadcast to abort
    /// peers once one of them has failed.
    pub(crate) async fn call_cancellable<A, R>(
        &self,
        service_method: &str,
        args: &A,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<R>
    where
        A: Serialize + Sync,
        R: DeserializeOwned,
    {
        let (seq, rx) = self.start_call(service_method, args).await?;
        tokio::select! {
            reply = rx => decode_reply(self.kind, reply),
            _ = cancel.changed() => {
                self.remove_call(seq);
                Err(anyhow!("rpc client: call failed: cancelled"))
            }
        }
    }

    async fn start_call<A: Serialize>(
        &self,
        service_method: &str,
        args: &A,
    ) -> Result<(u64, oneshot::Receiver<CallReply>)> {
        let body = self.kind.encode(args)?;
        let (tx, rx) = oneshot::channel();

        // Registration happens under the sending lock, nesting sending then
        // pending exactly like terminate_calls. Seq assignment and the frame
        // write are therefore atomic against other callers: frames leave the
        // socket in seq order.
        let mut writer = self.sending.lock().await;
        let seq = self.register_call(tx)?;
        let header = Header {
            service_method: service_method.to_string(),
            seq,
            error: None,
        };
        if let Err(err) = writer.send(&header, &body).await {
            self.remove_call(seq);
            return Err(err);
        }
        Ok((seq, rx))
    }

    fn register_call(&self, tx: oneshot::Sender<CallReply>) -> Result<u64> {
        let mut pending = self.pending.lock().expect("pending table poisoned");
        // Checked under the lock so registration cannot race termination.
        if self.closing.load(Ordering::SeqCst) || self.shutdown.load(Ordering::SeqCst) {
            return Err(anyhow!("rpc client: connection is shut down"));
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        pending.insert(seq, tx);
        Ok(seq)
    }

    fn remove_call(&self, seq: u64) -> Option<oneshot::Sender<CallReply>> {
        self.pending
            .lock()
            .expect("pending table poisoned")
            .remove(&seq)
    }

    async fn receive_loop(self: Arc<Self>, mut frames: FrameReader<BufReader<OwnedReadHalf>>) {
        let fatal = loop {
            let header = match frames.read_header().await {
                Ok(header) => header,
                Err(err) => break err.to_string(),
            };
            // The body segment is consumed unconditionally to keep framing
            // intact, even when nobody wants it.
            let body = match frames.read_body().await {
                Ok(body) => body,
                Err(err) => break err.to_string(),
            };

            match self.remove_call(header.seq) {
                // Stale: the call timed out or was cancelled; discard.
                None => {}
                Some(tx) => {
                    let outcome = match header.error {
                        Some(message) => Err(message),
                        None => Ok(body),
                    };
                    let _ = tx.send(outcome);
                }
            }
        };
        self.terminate_calls(fatal).await;
    }

    /// Marks the client shut down and fails everything pending.
    async fn terminate_calls(&self, reason: String) {
        // Same lock order as the send path: sending, then pending.
        let _sending = self.sending.lock().await;
        let mut pending = self.pending.lock().expect("pending table poisoned");
        self.shutdown.store(true, Ordering::SeqCst);
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(format!("rpc client: connection is shut down: {}", reason)));
        }
    }
}

fn decode_reply<R: DeserializeOwned>(
    kind: CodecKind,
    reply: Result<CallReply, oneshot::error::RecvError>,
) -> Result<R> {
    match reply {
        Ok(Ok(bytes)) => kind.decode(&bytes),
        Ok(Err(message)) => Err(anyhow!(message)),
        Err(_) => Err(anyhow!("rpc client: connection is shut down")),
    }
}

async fn with_connect_timeout<T>(
    connect_timeout: Duration,
    dial: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    if connect_timeout.is_zero() {
        return dial.await;
    }
    match tokio::time::timeout(connect_timeout, dial).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("rpc client: connect timeout")),
    }
}

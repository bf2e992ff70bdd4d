//! RPC Server
//!
//! Accepts connections, validates the handshake, then runs the frame loop:
//! read a header+body pair, resolve the method, and dispatch it on its own
//! task. Responses from concurrent handlers are serialized through a
//! per-connection sending mutex, so frames never interleave on the wire;
//! clients correlate by sequence number.
//!
//! A connection moves through `handshake -> frame loop -> drain`: any fatal
//! read error ends the frame loop, and in-flight handlers are awaited
//! before the connection drops.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use super::codec::{FrameReader, FrameWriter, Header};
use super::protocol::{Handshake, CONNECTED_STATUS, MAGIC_NUMBER};
use super::service::{Method, Service, ServiceRegistry};

pub struct Server {
    services: Arc<ServiceRegistry>,
}

type SharedWriter = Arc<Mutex<FrameWriter<OwnedWriteHalf>>>;

impl Server {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            services: Arc::new(ServiceRegistry::new()),
        })
    }

    /// Registers a service. Re-registering a name is an error.
    pub fn register(&self, service: Service) -> Result<()> {
        self.services.register(service)
    }

    /// Accept loop for raw-TCP connections. Each connection is served on
    /// its own task; an accept error ends the loop.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tracing::debug!("accepted rpc connection from {}", addr);
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.serve_conn(stream).await;
                    });
                }
                Err(err) => {
                    tracing::error!("rpc server: accept error: {}", err);
                    return Ok(());
                }
            }
        }
    }

    /// Serves one already-accepted connection.
    pub async fn serve_conn(self: Arc<Self>, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let reader = BufReader::new(read_half);
        if let Err(err) = self.serve_split(reader, write_half).await {
            tracing::warn!("rpc server: connection ended: {}", err);
        }
    }

    /// Accept loop for HTTP-tunneled connections: a CONNECT to the rpc path
    /// is answered with a success status line, after which both sides speak
    /// raw framing on the same socket.
    pub async fn serve_http(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tracing::debug!("accepted tunneled connection from {}", addr);
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.serve_tunnel(stream).await {
                            tracing::warn!("rpc server: tunnel ended: {}", err);
                        }
                    });
                }
                Err(err) => {
                    tracing::error!("rpc server: accept error: {}", err);
                    return Ok(());
                }
            }
        }
    }

    async fn serve_tunnel(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;

        // Request head: method line, then headers until the blank line. The
        // client sends nothing further until it has seen our status line.
        let mut request_line = String::new();
        reader.read_line(&mut request_line).await?;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 || line == "\r\n" || line == "\n" {
                break;
            }
        }

        let method = request_line.split_whitespace().next().unwrap_or("");
        if method != "CONNECT" {
            writer
                .write_all(
                    b"HTTP/1.1 405 Method Not Allowed\r\n\
                      Content-Type: text/plain; charset=utf-8\r\n\
                      Connection: close\r\n\r\n\
                      405 must CONNECT\n",
                )
                .await?;
            return Err(anyhow!("rpc server: tunnel rejected {}", method));
        }

        writer
            .write_all(format!("HTTP/1.0 {}\r\n\r\n", CONNECTED_STATUS).as_bytes())
            .await?;

        self.serve_split(reader, writer).await
    }

    async fn serve_split(
        self: Arc<Self>,
        mut reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    ) -> Result<()> {
        // Handshake line first; everything after is framed.
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let handshake: Handshake = serde_json::from_str(line.trim())
            .map_err(|err| anyhow!("rpc server: options error: {}", err))?;
        if handshake.magic_number != MAGIC_NUMBER {
            return Err(anyhow!(
                "rpc server: invalid magic number {:#x}",
                handshake.magic_number
            ));
        }

        let kind = handshake.codec;
        let handle_timeout = handshake.handle_timeout();
        let mut frames = FrameReader::new(reader, kind);
        let sending: SharedWriter = Arc::new(Mutex::new(FrameWriter::new(writer, kind)));
        let mut handlers = JoinSet::new();

        loop {
            // A header read error (EOF included) is unrecoverable framing
            // loss; a failed method lookup is not, and is reported in-band.
            let header = match frames.read_header().await {
                Ok(header) => header,
                Err(_) => break,
            };
            let body = match frames.read_body().await {
                Ok(body) => body,
                Err(_) => break,
            };

            match self.services.find(&header.service_method) {
                Ok(method) => {
                    let sending = sending.clone();
                    handlers.spawn(handle_request(
                        method,
                        kind,
                        header,
                        body,
                        sending,
                        handle_timeout,
                    ));
                }
                Err(err) => {
                    let response = Header {
                        error: Some(err.to_string()),
                        ..header
                    };
                    send_response(&sending, &response, &[]).await;
                }
            }
        }

        // Drain in-flight handlers before dropping the connection.
        while handlers.join_next().await.is_some() {}
        let _ = sending.lock().await.shutdown().await;
        Ok(())
    }
}

/// Runs one request to completion under the connection's handle timeout and
/// writes the response.
///
/// On timeout the handler future is dropped — it cannot send a late
/// response or linger as a leaked task — and the client sees a timeout
/// error for this seq.
async fn handle_request(
    method: Arc<Method>,
    kind: super::codec::CodecKind,
    header: Header,
    body: Vec<u8>,
    sending: SharedWriter,
    handle_timeout: Duration,
) {
    let result = if handle_timeout.is_zero() {
        method.invoke(kind, body).await
    } else {
        match tokio::time::timeout(handle_timeout, method.invoke(kind, body)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "rpc server: request handle timeout: expect within {:?}",
                handle_timeout
            )),
        }
    };

    match result {
        Ok(reply) => {
            send_response(&sending, &header, &reply).await;
        }
        Err(err) => {
            let response = Header {
                error: Some(err.to_string()),
                ..header
            };
            send_response(&sending, &response, &[]).await;
        }
    }
}

async fn send_response(sending: &SharedWriter, header: &Header, body: &[u8]) {
    if let Err(err) = sending.lock().await.send(header, body).await {
        tracing::error!("rpc server: write response error: {}", err);
    }
}

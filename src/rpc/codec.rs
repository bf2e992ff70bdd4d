//! Codec & Framing
//!
//! Every request and response is one frame: a length-prefixed header
//! segment followed by a length-prefixed body segment. The length prefix is
//! a big-endian `u32`, so the reader always knows exactly how many bytes to
//! take and never scans for delimiters.
//!
//! How the header and the typed payloads inside the body are encoded is the
//! codec's choice — [`CodecKind`] names the encoding negotiated in the
//! handshake, and both sides use it for everything after the handshake
//! line.

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

/// Upper bound for a single segment. Rejects corrupt length prefixes before
/// they turn into huge allocations.
const MAX_SEGMENT_BYTES: u32 = 16 * 1024 * 1024;

/// Frame header carried ahead of every body.
///
/// `error` is empty on requests and on successful responses; a failed
/// response carries the error message here and an empty body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Qualified method name, `"Service.Method"`.
    pub service_method: String,
    /// Correlates a response with its request on a multiplexed connection.
    pub seq: u64,
    pub error: Option<String>,
}

/// Named payload encoding, negotiated per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Bincode,
    Json,
}

impl CodecKind {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            CodecKind::Bincode => Ok(bincode::serialize(value)?),
            CodecKind::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            CodecKind::Bincode => Ok(bincode::deserialize(bytes)?),
            CodecKind::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

/// Reads frames off a connection. `read_header` must precede the matching
/// `read_body`/`discard_body`.
pub struct FrameReader<R> {
    inner: R,
    kind: CodecKind,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, kind: CodecKind) -> Self {
        Self { inner, kind }
    }

    pub async fn read_header(&mut self) -> Result<Header> {
        let segment = self.read_segment().await?;
        self.kind.decode(&segment)
    }

    /// Returns the raw body bytes; the caller decodes them with the typed
    /// schema it expects.
    pub async fn read_body(&mut self) -> Result<Vec<u8>> {
        self.read_segment().await
    }

    async fn read_segment(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.inner.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_SEGMENT_BYTES {
            return Err(anyhow!("rpc codec: segment of {} bytes exceeds limit", len));
        }
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

/// Writes frames onto a connection.
///
/// Header and body are buffered and flushed together, so the peer can never
/// observe a header without its body.
pub struct FrameWriter<W: AsyncWrite + Unpin> {
    inner: BufWriter<W>,
    kind: CodecKind,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, kind: CodecKind) -> Self {
        Self {
            inner: BufWriter::new(inner),
            kind,
        }
    }

    pub async fn send(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let header_bytes = self.kind.encode(header)?;
        self.write_segment(&header_bytes).await?;
        self.write_segment(body).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Writes raw bytes ahead of any framing (the handshake line).
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    async fn write_segment(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner
            .write_all(&(bytes.len() as u32).to_be_bytes())
            .await?;
        self.inner.write_all(bytes).await?;
        Ok(())
    }
}

//! RPC Connection Protocol
//!
//! Constants and the negotiation message exchanged at the head of every
//! connection. The handshake is a single newline-terminated JSON object so
//! the byte stream that follows is unambiguous; everything after it is
//! framed by the negotiated codec.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::codec::CodecKind;

/// Marks a connection as speaking this protocol.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Path a tunneled client CONNECTs to.
pub const DEFAULT_RPC_PATH: &str = "/_rpc_";

/// Status line the server answers a CONNECT with before switching to raw
/// framing.
pub const CONNECTED_STATUS: &str = "200 Connected to RPC";

/// Default connect timeout applied by dialing clients.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection negotiation message.
///
/// The client picks the codec and the handle timeout the server will apply
/// to this connection's requests. Timeouts travel as milliseconds; `0`
/// means no limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    pub magic_number: u32,
    pub codec: CodecKind,
    pub connect_timeout_ms: u64,
    pub handle_timeout_ms: u64,
}

impl Handshake {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handle_timeout(&self) -> Duration {
        Duration::from_millis(self.handle_timeout_ms)
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec: CodecKind::Bincode,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            handle_timeout_ms: 0,
        }
    }
}

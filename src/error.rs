use std::io;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Everything that can terminate a tunnel session.
///
/// All variants are terminal: none are retried, and none cross the session
/// boundary — they drive the close routine and a log record, nothing else.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The early-data negotiation header was not valid URL-safe base64.
    #[error("invalid early data encoding: {0}")]
    Decode(#[from] base64::DecodeError),

    /// The header's identity field did not match the configured identity.
    #[error("unknown client identity")]
    Auth,

    /// The header itself was malformed.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// The backend was unreachable or the connect attempt timed out.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Read or write failure on the client WebSocket mid-relay.
    #[error("client transport error: {0}")]
    ClientTransport(#[from] WsError),

    /// Read or write failure on the backend TCP stream mid-relay.
    #[error("backend transport error: {0}")]
    BackendTransport(#[from] io::Error),

    /// The session's cumulative byte ceiling was reached.
    #[error("session byte limit exceeded ({limit} bytes)")]
    LimitExceeded { limit: u64 },
}

pub type Result<T, E = TunnelError> = std::result::Result<T, E>;

impl TunnelError {
    pub fn connect_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Connect {
            addr: addr.into(),
            source,
        }
    }

    /// True when the peer rejected us rather than the transport failing.
    pub fn is_handshake_rejection(&self) -> bool {
        matches!(self, Self::Auth | Self::Protocol(_) | Self::Decode(_))
    }
}

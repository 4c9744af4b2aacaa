use std::fmt;

use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

use crate::error::TunnelError;

/// Why a session ended. Recorded for logging only; never surfaced to the
/// peer and never retried.
#[derive(Debug)]
pub enum CloseReason {
    /// The client sent a close frame or dropped the WebSocket.
    ClientClosed,
    /// The backend reached end of stream.
    BackendClosed,
    /// No traffic in either direction within the configured window.
    IdleTimeout,
    /// A decode, parse, connect, transport, or quota failure.
    Error(TunnelError),
}

impl CloseReason {
    /// A clean shutdown initiated by one of the two transports.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::ClientClosed | Self::BackendClosed)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClosed => write!(f, "client closed"),
            Self::BackendClosed => write!(f, "backend closed"),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::Error(e) => write!(f, "{e}"),
        }
    }
}

/// Closes the client WebSocket, tolerating a transport that is already in a
/// non-open state. Every termination path of a session funnels through here,
/// so a second invocation must be a no-op rather than an error.
pub async fn close_client<S>(sender: &mut SplitSink<WebSocketStream<S>, Message>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match sender.close().await {
        Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {}
        Err(e) => debug!(error = %e, "Error while closing client WebSocket"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio_tungstenite::tungstenite::protocol::Role;

    #[tokio::test]
    async fn close_is_idempotent() {
        let (server_io, client_io) = tokio::io::duplex(4096);
        let ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let (mut sender, _receiver) = ws.split();
        close_client(&mut sender).await;
        // Second close against an already-closed transport must not error.
        close_client(&mut sender).await;
        drop(client_io);
    }

    #[tokio::test]
    async fn close_after_peer_vanishes_is_tolerated() {
        let (server_io, client_io) = tokio::io::duplex(4096);
        drop(client_io);
        let ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let (mut sender, _receiver) = ws.split();
        close_client(&mut sender).await;
        close_client(&mut sender).await;
    }

    #[test]
    fn clean_reasons_are_classified() {
        assert!(CloseReason::ClientClosed.is_clean());
        assert!(CloseReason::BackendClosed.is_clean());
        assert!(!CloseReason::IdleTimeout.is_clean());
        assert!(!CloseReason::Error(TunnelError::Auth).is_clean());
    }
}

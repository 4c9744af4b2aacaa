//! One tunneled connection: WebSocket upgrade, handshake header, backend
//! connect, and the two relay pumps.

use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::oneshot;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_tungstenite::{
    WebSocketStream, accept_hdr_async,
    tungstenite::{
        Error as TungsteniteError, Message,
        error::ProtocolError,
        handshake::server::{Request, Response},
    },
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::early_data::decode_early_data;
use crate::error::TunnelError;
use crate::header::parse_request;
use crate::lifecycle::{CloseReason, close_client};
use crate::tls::AcceptedStream;

pub const BUFFER_SIZE: usize = 8192;

/// Static per-server values injected into every session, so the relay core
/// never reads process-wide state.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub identity: Uuid,
    pub byte_limit: Option<u64>,
    pub connect_timeout: Duration,
    pub idle_timeout: Option<Duration>,
}

impl SessionSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            identity: config.auth.identity,
            byte_limit: config.limits.session_byte_limit,
            connect_timeout: config.limits.connect_timeout(),
            idle_timeout: config.limits.idle_timeout(),
        }
    }
}

/// Performs the WebSocket upgrade, capturing any early data smuggled into
/// the `Sec-WebSocket-Protocol` header, then runs the tunnel session to
/// completion.
#[tracing::instrument(
    skip(stream, settings),
    fields(client_addr = %stream.peer_addr().map_or_else(|_| "unknown".to_string(), |a| a.to_string()))
)]
pub async fn handle_connection(stream: AcceptedStream, settings: Arc<SessionSettings>) -> Result<()> {
    let negotiated = Arc::new(Mutex::new(None::<String>));
    let negotiated_clone = negotiated.clone();

    let callback = move |req: &Request, mut response: Response| {
        if let Some(protocol) = req.headers().get("sec-websocket-protocol") {
            if let Ok(value) = protocol.to_str() {
                if let Ok(mut guard) = negotiated_clone.lock() {
                    *guard = Some(value.to_string());
                }
                // A client that requested a sub-protocol expects it echoed.
                response
                    .headers_mut()
                    .insert("sec-websocket-protocol", protocol.clone());
            }
        }
        Ok(response)
    };

    let ws_stream = accept_hdr_async(stream, callback)
        .await
        .context("Failed to perform WebSocket handshake")?;

    let early_data_header = negotiated.lock().unwrap().take().unwrap_or_default();
    run_session(ws_stream, &early_data_header, &settings).await;
    Ok(())
}

/// Runs one tunnel session over an established WebSocket.
///
/// The inbound pump consumes client messages one at a time: the first chunk
/// (early data or first frame) carries the header, is parsed, and gates the
/// backend connect; everything after the payload offset is the first backend
/// write, and every later frame is forwarded verbatim in arrival order with
/// one in-flight write. The outbound pump waits on a one-shot rendezvous for
/// the connected backend, acknowledges the accepted header to the client,
/// then forwards backend reads the same way. Whichever side terminates first
/// wins the select; all paths funnel into the same close routine, and no
/// error crosses this boundary.
pub async fn run_session<S>(
    websocket: WebSocketStream<S>,
    early_data_header: &str,
    settings: &SessionSettings,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_sender, mut ws_receiver) = websocket.split();

    let early_data = match decode_early_data(early_data_header) {
        Ok(buf) => buf,
        Err(e) => {
            // No trustworthy header bytes exist; close without ever touching
            // a backend.
            warn!(error = %e, "Rejecting session with undecodable early data");
            close_client(&mut ws_sender).await;
            return CloseReason::Error(e);
        }
    };
    let mut early_data = (!early_data.is_empty()).then(|| Bytes::from(early_data));

    // client -> backend and backend -> client, for the close log and quota.
    let bytes_in = AtomicU64::new(0);
    let bytes_out = AtomicU64::new(0);
    let last_activity = Mutex::new(Instant::now());
    let (ready_tx, ready_rx) = oneshot::channel::<(OwnedReadHalf, [u8; 2])>();

    let inbound = async {
        // The first chunk carries the header: early data when present,
        // otherwise the first binary frame.
        let first_chunk = match early_data.take() {
            Some(data) => data,
            None => loop {
                match ws_receiver.next().await {
                    Some(Ok(Message::Binary(data))) => break data,
                    Some(Ok(Message::Text(_))) => {
                        warn!("Dropping text message (binary only)");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Ok(CloseReason::ClientClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => match e {
                        TungsteniteError::ConnectionClosed
                        | TungsteniteError::Protocol(
                            ProtocolError::ResetWithoutClosingHandshake,
                        ) => {
                            debug!("Client disconnected: {e}");
                            return Ok(CloseReason::ClientClosed);
                        }
                        _ => return Err(TunnelError::ClientTransport(e)),
                    },
                }
            },
        };

        let request = parse_request(&first_chunk, &settings.identity)?;
        if request.version != 0 {
            debug!(version = request.version, "Echoing unrecognized header version");
        }

        debug!(target_addr = %request.target_addr(), "Attempting to connect to target server");
        let backend = match timeout(
            settings.connect_timeout,
            TcpStream::connect((request.host.as_str(), request.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TunnelError::connect_failed(request.target_addr(), e)),
            Err(_) => {
                return Err(TunnelError::connect_failed(
                    request.target_addr(),
                    io::Error::new(io::ErrorKind::TimedOut, "connect attempt timed out"),
                ));
            }
        };
        info!(target_addr = %request.target_addr(), "Connected to target server");

        let (backend_reader, mut backend_writer) = backend.into_split();

        // Client payload sharing the header chunk becomes the first write.
        let payload = first_chunk.slice(request.payload_offset..);
        if !payload.is_empty() {
            backend_writer.write_all(&payload).await?;
            bytes_in.fetch_add(payload.len() as u64, Ordering::Relaxed);
        }
        *last_activity.lock().unwrap() = Instant::now();

        let _ = ready_tx.send((backend_reader, request.response_header()));

        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    debug!(bytes = data.len(), "Forwarding data from WebSocket to backend");
                    backend_writer.write_all(&data).await?;
                    bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);
                    *last_activity.lock().unwrap() = Instant::now();
                }
                Ok(Message::Text(_)) => {
                    warn!("Dropping text message (binary only)");
                }
                Ok(Message::Close(_)) => {
                    info!("WebSocket connection closed");
                    return Ok(CloseReason::ClientClosed);
                }
                Err(e) => match e {
                    TungsteniteError::ConnectionClosed
                    | TungsteniteError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                        debug!("Client disconnected: {e}");
                        return Ok(CloseReason::ClientClosed);
                    }
                    _ => return Err(TunnelError::ClientTransport(e)),
                },
                _ => {}
            }
        }
        Ok(CloseReason::ClientClosed)
    };

    let outbound = async {
        let (mut backend_reader, response_header) = match ready_rx.await {
            Ok(ready) => ready,
            // The header was never accepted; the inbound side reports why.
            Err(_) => std::future::pending().await,
        };

        // Acknowledge the accepted header before any relayed payload.
        ws_sender
            .send(Message::Binary(Bytes::copy_from_slice(&response_header)))
            .await?;

        let mut buffer = [0u8; BUFFER_SIZE];
        loop {
            match backend_reader.read(&mut buffer).await {
                Ok(0) => {
                    info!("Backend connection closed");
                    return Ok(CloseReason::BackendClosed);
                }
                Ok(n) => {
                    if let Some(limit) = settings.byte_limit {
                        if bytes_out.load(Ordering::Relaxed) + n as u64 > limit {
                            return Err(TunnelError::LimitExceeded { limit });
                        }
                    }
                    debug!(bytes = n, "Forwarding data from backend to WebSocket");
                    ws_sender
                        .send(Message::Binary(Bytes::copy_from_slice(&buffer[..n])))
                        .await?;
                    bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                    *last_activity.lock().unwrap() = Instant::now();
                }
                Err(e) => return Err(TunnelError::BackendTransport(e)),
            }
        }
    };

    let watchdog = async {
        match settings.idle_timeout {
            Some(limit) => loop {
                let deadline = *last_activity.lock().unwrap() + limit;
                if Instant::now() >= deadline {
                    break;
                }
                sleep_until(deadline).await;
            },
            None => std::future::pending().await,
        }
    };

    let outcome = tokio::select! {
        result = inbound => result,
        result = outbound => result,
        () = watchdog => Ok(CloseReason::IdleTimeout),
    };

    let reason = match outcome {
        Ok(reason) => reason,
        Err(e) => {
            if e.is_handshake_rejection() {
                // No descriptive payload goes back to an unauthenticated peer.
                debug!(error = %e, "Rejecting session during handshake");
            } else {
                error!(error = %e, "Session failed");
            }
            CloseReason::Error(e)
        }
    };

    close_client(&mut ws_sender).await;

    info!(
        reason = %reason,
        bytes_in = bytes_in.load(Ordering::Relaxed),
        bytes_out = bytes_out.load(Ordering::Relaxed),
        "Tunnel session closed"
    );
    reason
}

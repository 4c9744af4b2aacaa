//! Authenticated WebSocket Tunnel Server
//!
//! Relays a TCP connection carried inside a WebSocket: the client sends a
//! small binary header (identity, destination, command), optionally smuggled
//! into the handshake as early data, and the server connects to the
//! destination and forwards bytes in both directions until either side
//! closes. Supports TLS termination on the listener.

pub mod config;
pub mod early_data;
pub mod error;
pub mod header;
pub mod lifecycle;
pub mod session;
pub mod tls;

// Re-export commonly used types and functions
pub use config::{AuthConfig, Config, LimitsConfig, ListenConfig, TlsConfig, load_config};
pub use early_data::decode_early_data;
pub use error::TunnelError;
pub use header::{TunnelRequest, parse_request};
pub use lifecycle::{CloseReason, close_client};
pub use session::{BUFFER_SIZE, SessionSettings, handle_connection, run_session};
pub use tls::{AcceptedStream, load_tls_config};

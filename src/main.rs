use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

use websocket_tunnel::config::load_config;
use websocket_tunnel::session::{SessionSettings, handle_connection};
use websocket_tunnel::tls::{AcceptedStream, load_tls_config};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = load_config()?;
    info!(
        config_file = "config.toml",
        listen_ip = %config.listen.ip,
        listen_port = config.listen.port,
        tls = config.listen.tls.is_some(),
        session_byte_limit = config.limits.session_byte_limit,
        "Configuration loaded"
    );

    let settings = Arc::new(SessionSettings::from_config(&config));

    let tls_acceptor = match &config.listen.tls {
        Some(tls_config) => {
            let server_config = load_tls_config(tls_config)?;
            Some(TlsAcceptor::from(Arc::new(server_config)))
        }
        None => None,
    };

    let addr = format!("{}:{}", config.listen.ip, config.listen.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to address {addr}"))?;

    info!(
        listen_addr = %addr,
        "WebSocket tunnel listening"
    );

    while let Ok((stream, addr)) = listener.accept().await {
        let settings = settings.clone();
        let tls_acceptor = tls_acceptor.clone();

        tokio::spawn(async move {
            let accepted = match tls_acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => AcceptedStream::Tls(Box::new(tls_stream)),
                    Err(e) => {
                        error!(client_addr = %addr, error = %e, "TLS handshake failed");
                        return;
                    }
                },
                None => AcceptedStream::Plain(stream),
            };

            if let Err(e) = handle_connection(accepted, settings).await {
                error!(client_addr = %addr, error = %e, "Connection failed");
            }
        });
    }

    Ok(())
}

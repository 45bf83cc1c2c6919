//! WebSocket listener

use crate::codec::MAX_FRAME_BYTES;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::info;

#[derive(Error, Debug)]
pub enum WsServerError {
    #[error("bind failed: {0}")]
    BindFailed(String),

    #[error("accept failed: {0}")]
    AcceptFailed(String),

    #[error("upgrade failed: {0}")]
    UpgradeFailed(String),
}

/// Listener configuration
#[derive(Debug, Clone)]
pub struct WsServerConfig {
    /// Bind address
    pub bind: SocketAddr,

    /// Maximum concurrent connections
    pub max_connections: usize,
}

impl Default for WsServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9220".parse().expect("static addr"),
            max_connections: 10000,
        }
    }
}

/// Accepts raw TCP connections; the upgrade happens per-connection so slow
/// handshakes never block the accept loop.
pub struct WsServer {
    listener: TcpListener,
    config: WsServerConfig,
}

impl WsServer {
    pub async fn bind(config: WsServerConfig) -> Result<Self, WsServerError> {
        let listener = TcpListener::bind(config.bind)
            .await
            .map_err(|e| WsServerError::BindFailed(e.to_string()))?;

        info!("collaboration listener on {}", config.bind);
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn max_connections(&self) -> usize {
        self.config.max_connections
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), WsServerError> {
        self.listener
            .accept()
            .await
            .map_err(|e| WsServerError::AcceptFailed(e.to_string()))
    }
}

/// Complete the WebSocket handshake with the server frame limits applied.
pub async fn upgrade(stream: TcpStream) -> Result<WebSocketStream<TcpStream>, WsServerError> {
    let config = WebSocketConfig::default()
        .max_message_size(Some(MAX_FRAME_BYTES))
        .max_frame_size(Some(MAX_FRAME_BYTES));

    tokio_tungstenite::accept_async_with_config(stream, Some(config))
        .await
        .map_err(|e| WsServerError::UpgradeFailed(e.to_string()))
}

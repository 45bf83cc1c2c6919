//! WebSocket session
//!
//! Strictly typed `ClientMessage`/`ServerMessage` traffic over a split
//! socket: the sender half is cheap to clone across the heartbeat task and
//! the operation path, the receiver half stays with the read loop.

use anyhow::{Result, anyhow};
use easel_protocol::{ClientMessage, ServerMessage};
use easel_transport::MessageCodec;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsTx = SplitSink<WsStream, Message>;
type WsRx = SplitStream<WsStream>;

/// Encapsulated collaboration session
pub struct WsSession {
    tx: Arc<Mutex<WsTx>>,
    rx: WsRx,
    codec: MessageCodec,
}

impl WsSession {
    /// Connect to the server endpoint (`ws://host:port`).
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let url = if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
            endpoint.to_string()
        } else {
            format!("ws://{endpoint}")
        };

        info!("connecting to {url}");
        let (ws_stream, _) = connect_async(&url).await?;
        let (tx, rx) = ws_stream.split();

        Ok(Self {
            tx: Arc::new(Mutex::new(tx)),
            rx,
            codec: MessageCodec::new(),
        })
    }

    pub async fn send(&self, message: &ClientMessage) -> Result<()> {
        let frame = self.codec.encode(message).map_err(|e| anyhow!("{e}"))?;
        let mut tx = self.tx.lock().await;
        tx.send(frame).await?;
        Ok(())
    }

    /// Receive the next server message. `None` means the connection closed.
    pub async fn recv(&mut self) -> Result<Option<ServerMessage>> {
        loop {
            let message = match self.rx.next().await {
                Some(Ok(m)) => m,
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            };

            if message.is_close() {
                return Ok(None);
            }
            match self.codec.decode::<ServerMessage>(&message) {
                Ok(Some(decoded)) => return Ok(Some(decoded)),
                Ok(None) => continue,
                Err(e) => {
                    debug!(error = %e, "dropping undecodable frame");
                    continue;
                }
            }
        }
    }

    /// Split into an independently clonable sender and the receive loop half.
    pub fn split(self) -> (WsSender, WsReceiver) {
        (
            WsSender {
                tx: self.tx,
                codec: self.codec.clone(),
            },
            WsReceiver {
                rx: self.rx,
                codec: self.codec,
            },
        )
    }
}

#[derive(Clone)]
pub struct WsSender {
    tx: Arc<Mutex<WsTx>>,
    codec: MessageCodec,
}

impl WsSender {
    pub async fn send(&self, message: &ClientMessage) -> Result<()> {
        let frame = self.codec.encode(message).map_err(|e| anyhow!("{e}"))?;
        let mut tx = self.tx.lock().await;
        tx.send(frame).await?;
        Ok(())
    }
}

pub struct WsReceiver {
    rx: WsRx,
    codec: MessageCodec,
}

impl WsReceiver {
    pub async fn recv(&mut self) -> Result<Option<ServerMessage>> {
        loop {
            let message = match self.rx.next().await {
                Some(Ok(m)) => m,
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            };
            if message.is_close() {
                return Ok(None);
            }
            match self.codec.decode::<ServerMessage>(&message) {
                Ok(Some(decoded)) => return Ok(Some(decoded)),
                Ok(None) => continue,
                Err(e) => {
                    debug!(error = %e, "dropping undecodable frame");
                    continue;
                }
            }
        }
    }
}

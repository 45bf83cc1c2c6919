//! Bounded per-connection send queue
//!
//! Every connection gets one outbox. Senders never await: a full queue means
//! the peer is not draining, and the policy is to close the connection and
//! let the client reconnect and resync rather than drop frames silently.

use crate::codec::{CodecError, MessageCodec};
use easel_protocol::ServerMessage;
use futures::{Sink, SinkExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("send queue full")]
    Overflow,

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Sending half, held by the session registry.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Message>,
    codec: MessageCodec,
}

impl Outbox {
    pub fn send(&self, message: &ServerMessage) -> Result<(), OutboxError> {
        let frame = self.codec.encode(message)?;
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => OutboxError::Overflow,
            mpsc::error::TrySendError::Closed(_) => OutboxError::Closed,
        })
    }

    /// Raw frame passthrough, used for server-initiated close frames.
    pub fn send_raw(&self, frame: Message) -> Result<(), OutboxError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => OutboxError::Overflow,
            mpsc::error::TrySendError::Closed(_) => OutboxError::Closed,
        })
    }
}

/// Create an outbox with the given queue depth.
pub fn outbox(depth: usize, codec: MessageCodec) -> (Outbox, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel(depth);
    (Outbox { tx, codec }, rx)
}

/// Drain an outbox into the connection's sink. Ends when the outbox is
/// dropped or the sink errors (peer gone).
pub fn spawn_writer<S>(mut rx: mpsc::Receiver<Message>, mut sink: S) -> JoinHandle<()>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: std::fmt::Display,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                debug!(error = %e, "writer stopped");
                break;
            }
        }
        let _ = sink.close().await;
    })
}

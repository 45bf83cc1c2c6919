//! Easel Transport - WebSocket and framing layer
//!
//! This crate provides:
//! - WebSocket listener with frame-size limits
//! - Message codec (JSON payloads, zstd-compressed above a threshold)
//! - Bounded per-connection outbox; overflow closes the connection
//! - The `Dispatcher` seam the rooms use to reach connections

mod codec;
mod dispatch;
mod listener;
mod outbox;

pub use codec::*;
pub use dispatch::*;
pub use listener::*;
pub use outbox::*;

/// Raw frame type, for the close-frame passthrough on [`Outbox::send_raw`].
pub use tokio_tungstenite::tungstenite::Message;

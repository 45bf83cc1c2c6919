//! Easel Client
//!
//! Reference implementation of the client side of the collaboration
//! protocol: optimistic apply with local undo capture, rollback on reject or
//! ack timeout, temp-id reconciliation, catch-up via `sync_check`, and full
//! resync when the gap outgrows the server's ring.

pub mod config;
pub mod engine;
pub mod session;

pub use config::ClientConfig;
pub use engine::{ClientEngine, EngineError};
pub use session::WsSession;

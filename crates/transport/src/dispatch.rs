//! Dispatcher seam
//!
//! Rooms and the media forwarder address connections through this trait
//! instead of the concrete registry, which keeps the fan-out direction
//! (room -> connection) free of a dependency cycle.

use async_trait::async_trait;
use easel_protocol::ServerMessage;

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Deliver to one connection. Delivery is best-effort: a missing or
    /// overflowing connection is handled by the implementation (the latter
    /// by closing it).
    async fn dispatch(&self, connection_id: u64, message: ServerMessage);
}

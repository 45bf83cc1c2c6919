//! Easel Store - durable persistence
//!
//! Single SQLite database (WAL mode) holding users, projects, the append-only
//! per-project operation log, file metadata and active sessions. The hot
//! contract is `append_operation`: atomically take max(seq)+1 for the project
//! and insert, so sequence numbers are contiguous from 1 per project.

mod error;
mod store;

pub use error::StoreError;
pub use store::*;

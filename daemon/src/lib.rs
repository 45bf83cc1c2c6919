//! Easel Daemon
//!
//! Server-authoritative collaboration core for the shared media canvas:
//! per-project operation pipeline (admission, sequencing, persistence,
//! fan-out), rooms with presence and a recent-ops ring, sync/catch-up, media
//! ingestion, and the supporting HTTP surface.
//!
//! The binary lives in `main.rs`; the library exists so integration tests can
//! run a full in-process server on ephemeral ports.

pub mod config;
pub mod connection;
pub mod http;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod room;
pub mod server;
pub mod sync;

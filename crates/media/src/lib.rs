//! Easel Media - content-addressed ingestion
//!
//! Blobs are addressed by their SHA-256. Ingesting the same content twice is
//! a no-op that returns the existing record; nodes reference blobs by hash
//! and resolve them over HTTP, so operations never carry media bytes.

mod events;
mod registry;
mod thumbnail;

pub use events::*;
pub use registry::*;
pub use thumbnail::{THUMBNAIL_SIZES, ThumbnailSet};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] easel_store::StoreError),

    #[error("declared hash {declared} does not match content hash {actual}")]
    HashMismatch { declared: String, actual: String },

    #[error("empty upload")]
    EmptyUpload,
}

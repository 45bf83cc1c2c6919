//! Content-addressed registry

use crate::events::{MediaEvent, MediaEventPayload, MediaEventSender, TranscodeEvent};
use crate::thumbnail::{THUMBNAIL_SIZES, derive_thumbnails};
use crate::MediaError;
use bytes::Bytes;
use easel_store::{NewFile, Store};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Result of one upload.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub hash: String,
    pub filename: String,
    pub url: String,
    pub size: u64,
    pub thumbnails: Vec<u32>,
    /// false when the hash was already known and nothing was re-stored
    pub created: bool,
}

/// Owns the blob directories and the hash -> artifact mapping (backed by the
/// store's `files` table).
#[derive(Clone)]
pub struct MediaRegistry {
    media_dir: PathBuf,
    thumb_dir: PathBuf,
    store: Store,
    events: MediaEventSender,
}

impl MediaRegistry {
    pub async fn new(
        media_dir: PathBuf,
        thumb_dir: PathBuf,
        store: Store,
        events: MediaEventSender,
    ) -> Result<Self, MediaError> {
        tokio::fs::create_dir_all(&media_dir).await?;
        for size in THUMBNAIL_SIZES {
            tokio::fs::create_dir_all(thumb_dir.join(size.to_string())).await?;
        }
        Ok(Self {
            media_dir,
            thumb_dir,
            store,
            events,
        })
    }

    pub fn media_dir(&self) -> &PathBuf {
        &self.media_dir
    }

    pub fn thumb_dir(&self) -> &PathBuf {
        &self.thumb_dir
    }

    /// Ingest one uploaded blob.
    ///
    /// Content is hashed with SHA-256; a declared hash that does not match
    /// is refused, and a hash that is already registered returns the
    /// existing record without re-storing anything.
    pub async fn ingest(
        &self,
        bytes: Bytes,
        declared_mime: Option<&str>,
        original_name: Option<&str>,
        declared_hash: Option<&str>,
        project_id: Option<i64>,
    ) -> Result<IngestOutcome, MediaError> {
        if bytes.is_empty() {
            return Err(MediaError::EmptyUpload);
        }

        let hash = hex_digest(&bytes);
        if let Some(declared) = declared_hash {
            if !declared.eq_ignore_ascii_case(&hash) {
                return Err(MediaError::HashMismatch {
                    declared: declared.to_string(),
                    actual: hash,
                });
            }
        }

        let mime = declared_mime.unwrap_or("application/octet-stream");
        let filename = format!("{hash}.{}", extension_for_mime(mime));

        let registered = self
            .store
            .register_file(&NewFile {
                filename: filename.clone(),
                original_name: original_name.map(str::to_owned),
                mime: Some(mime.to_string()),
                size: bytes.len() as i64,
                hash: hash.clone(),
                project_id,
            })
            .await?;

        let thumbnails = if registered.created {
            self.store_blob(&registered.record.filename, &bytes).await?;
            self.store_thumbnails(&hash, bytes.clone()).await?
        } else {
            debug!(%hash, "re-upload of known hash, reusing stored artifact");
            self.existing_thumbnail_sizes(&hash).await
        };

        let outcome = IngestOutcome {
            url: format!("/uploads/{}", registered.record.filename),
            filename: registered.record.filename.clone(),
            size: bytes.len() as u64,
            thumbnails: thumbnails.clone(),
            created: registered.created,
            hash: hash.clone(),
        };

        self.publish(MediaEvent {
            project_id,
            payload: MediaEventPayload::Ready {
                hash,
                urls: self.urls_for(&outcome),
                formats: vec![mime.to_string()],
            },
        })
        .await;

        if mime.starts_with("video/") {
            // Transcoding itself runs out of process; queueing is the part
            // the ingest path owns.
            let queued_name = original_name.unwrap_or(&outcome.filename).to_string();
            self.publish_transcode(project_id, TranscodeEvent::Queued {
                filename: queued_name,
            })
            .await;
        }

        if registered.created {
            info!(hash = %outcome.hash, size = outcome.size, "blob ingested");
        }
        Ok(outcome)
    }

    /// Forward a transcode event into the room side-channel. The ingest path
    /// queues here; an external worker reports start/progress/completion
    /// through the same door.
    pub async fn publish_transcode(&self, project_id: Option<i64>, event: TranscodeEvent) {
        debug!(filename = event.filename(), "transcode event");
        self.publish(MediaEvent {
            project_id,
            payload: MediaEventPayload::Transcode(event),
        })
        .await;
    }

    /// Unlink blobs and thumbnails for files removed by the orphan sweep.
    pub async fn remove_blobs(&self, filenames: &[String]) {
        for filename in filenames {
            let path = self.media_dir.join(filename);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                debug!(path = %path.display(), error = %e, "blob already gone");
            }
            if let Some(hash) = filename.split('.').next() {
                for size in THUMBNAIL_SIZES {
                    let thumb = self.thumb_dir.join(size.to_string()).join(format!("{hash}.jpg"));
                    let _ = tokio::fs::remove_file(thumb).await;
                }
            }
        }
    }

    fn urls_for(&self, outcome: &IngestOutcome) -> BTreeMap<String, String> {
        let mut urls = BTreeMap::new();
        urls.insert("original".to_string(), outcome.url.clone());
        for size in &outcome.thumbnails {
            urls.insert(
                format!("thumb{size}"),
                format!("/thumbnails/{size}/{}.jpg", outcome.hash),
            );
        }
        urls
    }

    async fn store_blob(&self, filename: &str, bytes: &Bytes) -> Result<(), MediaError> {
        let path = self.media_dir.join(filename);
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn store_thumbnails(&self, hash: &str, bytes: Bytes) -> Result<Vec<u32>, MediaError> {
        // Decoding and resizing are CPU-bound.
        let set = tokio::task::spawn_blocking(move || derive_thumbnails(&bytes))
            .await
            .unwrap_or_default();

        let mut sizes = Vec::with_capacity(set.entries.len());
        for (size, data) in set.entries {
            let path = self.thumb_dir.join(size.to_string()).join(format!("{hash}.jpg"));
            match tokio::fs::write(&path, &data).await {
                Ok(()) => sizes.push(size),
                // A missing size is not fatal; the client falls back to the
                // next one up.
                Err(e) => warn!(size, error = %e, "failed to store thumbnail"),
            }
        }
        Ok(sizes)
    }

    async fn existing_thumbnail_sizes(&self, hash: &str) -> Vec<u32> {
        let mut sizes = Vec::new();
        for size in THUMBNAIL_SIZES {
            let path = self.thumb_dir.join(size.to_string()).join(format!("{hash}.jpg"));
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                sizes.push(size);
            }
        }
        sizes
    }

    async fn publish(&self, event: MediaEvent) {
        if self.events.send(event).await.is_err() {
            debug!("media event channel closed");
        }
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "video/quicktime" => "mov",
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::media_event_channel;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::io::Cursor;

    async fn registry() -> (MediaRegistry, crate::events::MediaEventReceiver, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("easel.db")).await.unwrap();
        let (tx, rx) = media_event_channel(16);
        let registry = MediaRegistry::new(
            dir.path().join("uploads"),
            dir.path().join("thumbnails"),
            store,
            tx,
        )
        .await
        .unwrap();
        (registry, rx, dir)
    }

    fn png_bytes() -> Bytes {
        let img = RgbImage::from_pixel(300, 150, image::Rgb([10, 20, 30]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        Bytes::from(out.into_inner())
    }

    #[tokio::test]
    async fn ingest_is_idempotent_on_content() {
        let (registry, mut rx, _dir) = registry().await;
        let bytes = png_bytes();

        let first = registry
            .ingest(bytes.clone(), Some("image/png"), Some("photo.png"), None, None)
            .await
            .unwrap();
        assert!(first.created);
        assert_eq!(first.thumbnails, vec![64, 128, 256]);
        assert!(
            registry
                .media_dir()
                .join(&first.filename)
                .exists()
        );

        let second = registry
            .ingest(bytes, Some("image/png"), Some("photo-copy.png"), None, None)
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.hash, first.hash);
        assert_eq!(second.thumbnails, first.thumbnails);

        // Both ingests announce readiness.
        for _ in 0..2 {
            let event = rx.recv().await.unwrap();
            assert!(matches!(event.payload, MediaEventPayload::Ready { .. }));
        }
    }

    #[tokio::test]
    async fn declared_hash_mismatch_is_refused() {
        let (registry, _rx, _dir) = registry().await;
        let err = registry
            .ingest(png_bytes(), Some("image/png"), None, Some("deadbeef"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::HashMismatch { .. }));
    }

    #[tokio::test]
    async fn video_upload_queues_transcode() {
        let (registry, mut rx, _dir) = registry().await;
        registry
            .ingest(
                Bytes::from_static(b"not really an mp4"),
                Some("video/mp4"),
                Some("clip.mp4"),
                None,
                Some(7),
            )
            .await
            .unwrap();

        let ready = rx.recv().await.unwrap();
        assert!(matches!(ready.payload, MediaEventPayload::Ready { .. }));
        let queued = rx.recv().await.unwrap();
        assert_eq!(queued.project_id, Some(7));
        match queued.payload {
            MediaEventPayload::Transcode(TranscodeEvent::Queued { filename }) => {
                assert_eq!(filename, "clip.mp4");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

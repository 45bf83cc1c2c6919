//! Media event side-channel
//!
//! Ingestion and the (external) transcode worker publish events here; the
//! daemon forwards them into the owning project's room as `media_ready` and
//! `video_processing_*` messages.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Progress of an asynchronous video transcode, addressed by the original
/// filename the client uploaded under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TranscodeEvent {
    Queued { filename: String },
    Start { filename: String },
    Progress { filename: String, percent: f32 },
    Complete { filename: String, formats: Vec<String> },
    Failed { filename: String, error: String },
}

impl TranscodeEvent {
    pub fn filename(&self) -> &str {
        match self {
            Self::Queued { filename }
            | Self::Start { filename }
            | Self::Progress { filename, .. }
            | Self::Complete { filename, .. }
            | Self::Failed { filename, .. } => filename,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaEventPayload {
    /// A hash became resolvable: the blob and its derived artifacts exist.
    Ready {
        hash: String,
        urls: BTreeMap<String, String>,
        formats: Vec<String>,
    },
    Transcode(TranscodeEvent),
}

/// An event plus the project whose room should hear about it (`None` for
/// uploads not yet attached to a project).
#[derive(Debug, Clone, PartialEq)]
pub struct MediaEvent {
    pub project_id: Option<i64>,
    pub payload: MediaEventPayload,
}

pub type MediaEventSender = mpsc::Sender<MediaEvent>;
pub type MediaEventReceiver = mpsc::Receiver<MediaEvent>;

pub fn media_event_channel(capacity: usize) -> (MediaEventSender, MediaEventReceiver) {
    mpsc::channel(capacity)
}

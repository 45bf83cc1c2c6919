//! Message codec
//!
//! Server frames are binary: one flags byte followed by the JSON payload,
//! zstd-compressed when it crosses the threshold (bit 0 of the flags).
//! Inbound, plain text JSON is accepted as well so thin clients can skip
//! compression entirely.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;
use tracing::trace;

pub use easel_protocol::MAX_FRAME_BYTES;

/// Payloads below this stay uncompressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// zstd level used for outbound frames.
pub const COMPRESSION_LEVEL: i32 = 3;

const FLAG_COMPRESSED: u8 = 0x01;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    #[error("deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("compression failed: {0}")]
    CompressionFailed(String),

    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("invalid frame format")]
    InvalidFrameFormat,

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Encoder/decoder for one connection. Stateless and cheap to clone.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    compression_enabled: bool,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self {
            compression_enabled: true,
        }
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_compression() -> Self {
        Self {
            compression_enabled: false,
        }
    }

    /// Encode a message as a binary WebSocket frame.
    pub fn encode<T: Serialize>(&self, message: &T) -> Result<Message, CodecError> {
        let json = serde_json::to_vec(message)
            .map_err(|e| CodecError::SerializationFailed(e.to_string()))?;

        let (payload, compressed) = if self.compression_enabled && json.len() >= COMPRESSION_THRESHOLD
        {
            let compressed = zstd::encode_all(json.as_slice(), COMPRESSION_LEVEL)
                .map_err(|e| CodecError::CompressionFailed(e.to_string()))?;
            (compressed, true)
        } else {
            (json, false)
        };

        trace!(
            size = payload.len(),
            compressed,
            "encoded outbound frame"
        );

        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(if compressed { FLAG_COMPRESSED } else { 0x00 });
        frame.extend_from_slice(&payload);
        Ok(Message::Binary(frame.into()))
    }

    /// Decode one inbound WebSocket message.
    ///
    /// Returns `Ok(None)` for control frames and close; callers treat that
    /// as "nothing to dispatch".
    pub fn decode<T: DeserializeOwned>(&self, message: &Message) -> Result<Option<T>, CodecError> {
        match message {
            Message::Text(text) => {
                let value = serde_json::from_str(text.as_str())
                    .map_err(|e| CodecError::DeserializationFailed(e.to_string()))?;
                Ok(Some(value))
            }
            Message::Binary(data) => {
                if data.is_empty() {
                    return Err(CodecError::InvalidFrameFormat);
                }
                if data.len() > MAX_FRAME_BYTES {
                    return Err(CodecError::FrameTooLarge {
                        size: data.len(),
                        max: MAX_FRAME_BYTES,
                    });
                }
                let flags = data[0];
                let rest = &data[1..];
                let payload = if flags & FLAG_COMPRESSED != 0 {
                    decompress_with_limit(rest, MAX_FRAME_BYTES)?
                } else {
                    rest.to_vec()
                };
                let value = serde_json::from_slice(&payload)
                    .map_err(|e| CodecError::DeserializationFailed(e.to_string()))?;
                Ok(Some(value))
            }
            _ => Ok(None),
        }
    }
}

/// Decompress with a hard output cap; a frame that inflates past the cap is
/// refused rather than buffered.
pub fn decompress_with_limit(data: &[u8], max_size: usize) -> Result<Vec<u8>, CodecError> {
    use std::io::Read;

    let mut decoder =
        zstd::Decoder::new(data).map_err(|e| CodecError::DecompressionFailed(e.to_string()))?;

    let mut result = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = decoder
            .read(&mut buf)
            .map_err(|e| CodecError::DecompressionFailed(e.to_string()))?;
        if n == 0 {
            break;
        }
        if result.len() + n > max_size {
            return Err(CodecError::FrameTooLarge {
                size: result.len() + n,
                max: max_size,
            });
        }
        result.extend_from_slice(&buf[..n]);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_protocol::ClientMessage;

    #[test]
    fn small_messages_stay_uncompressed() {
        let codec = MessageCodec::new();
        let msg = ClientMessage::Heartbeat {
            timestamp: 1,
            project_id: 7,
        };
        let encoded = codec.encode(&msg).unwrap();
        let Message::Binary(data) = &encoded else {
            panic!("expected binary frame");
        };
        assert_eq!(data[0], 0x00);

        let decoded: ClientMessage = codec.decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn large_messages_are_compressed() {
        let codec = MessageCodec::new();
        let msg = ClientMessage::SyncCheck {
            project_id: 7,
            last_seq: 1,
            state_hash: Some("a".repeat(4096)),
        };
        let encoded = codec.encode(&msg).unwrap();
        let Message::Binary(data) = &encoded else {
            panic!("expected binary frame");
        };
        assert_eq!(data[0], FLAG_COMPRESSED);
        assert!(data.len() < 4096);

        let decoded: ClientMessage = codec.decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn plain_text_json_is_accepted() {
        let codec = MessageCodec::new();
        let msg = Message::text(r#"{"type":"heartbeat","timestamp":5,"projectId":1}"#);
        let decoded: ClientMessage = codec.decode(&msg).unwrap().unwrap();
        assert_eq!(
            decoded,
            ClientMessage::Heartbeat {
                timestamp: 5,
                project_id: 1
            }
        );
    }

    #[test]
    fn decompression_bomb_is_refused() {
        let zeroes = vec![0u8; 1024 * 1024];
        let compressed = zstd::encode_all(zeroes.as_slice(), 3).unwrap();
        assert!(decompress_with_limit(&compressed, 64 * 1024).is_err());
    }
}

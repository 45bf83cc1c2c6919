//! Payload admission checks
//!
//! Operations never carry media bytes; blobs go through the upload path and
//! nodes reference them by hash. The checks here run before any operation is
//! parsed.

use crate::operation::OperationError;
use serde_json::Value;

/// Maximum serialized size of a single operation's params (1 MiB).
pub const MAX_OPERATION_BYTES: usize = 1024 * 1024;

/// Maximum size of one transport frame (50 MiB); full-state syncs of large
/// projects are the only messages that come near it.
pub const MAX_FRAME_BYTES: usize = 50 * 1024 * 1024;

/// Recursively scan a JSON value for embedded data-URIs.
pub fn contains_inline_media(value: &Value) -> bool {
    match value {
        Value::String(s) => s.trim_start().starts_with("data:"),
        Value::Array(items) => items.iter().any(contains_inline_media),
        Value::Object(map) => map.values().any(contains_inline_media),
        _ => false,
    }
}

/// Admission check for operation params: size cap, then inline-media ban.
pub fn check_operation_payload(params: &Value) -> Result<(), OperationError> {
    let size = serde_json::to_string(params).map(|s| s.len()).unwrap_or(0);
    if size > MAX_OPERATION_BYTES {
        return Err(OperationError::PayloadTooLarge {
            size,
            max: MAX_OPERATION_BYTES,
        });
    }
    if contains_inline_media(params) {
        return Err(OperationError::InlineMedia);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_nested_data_uri() {
        let params = json!({
            "type": "image",
            "properties": {"src": "data:image/png;base64,iVBORw0KGgo="}
        });
        assert!(contains_inline_media(&params));
        assert!(matches!(
            check_operation_payload(&params),
            Err(OperationError::InlineMedia)
        ));
    }

    #[test]
    fn hash_references_pass() {
        let params = json!({
            "type": "image",
            "properties": {"hash": "9f86d081884c7d65", "serverFilename": "9f86d081.jpg"}
        });
        assert!(check_operation_payload(&params).is_ok());
    }

    #[test]
    fn oversized_payload_is_refused() {
        let big = "x".repeat(MAX_OPERATION_BYTES + 1);
        let params = json!({"text": big});
        assert!(matches!(
            check_operation_payload(&params),
            Err(OperationError::PayloadTooLarge { .. })
        ));
    }
}

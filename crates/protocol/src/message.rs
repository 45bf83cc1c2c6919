//! Wire messages
//!
//! Everything on the WebSocket channel is one JSON object tagged by `type`,
//! with camelCase payload fields. `ClientMessage` flows client → server,
//! `ServerMessage` the other way.

use crate::operation::StateChanges;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinProject {
        project_id: i64,
        username: String,
        display_name: String,
        tab_id: String,
    },
    #[serde(rename_all = "camelCase")]
    LeaveProject { project_id: i64 },
    #[serde(rename_all = "camelCase")]
    ExecuteOperation {
        operation_id: String,
        operation_type: String,
        params: Value,
        state_version: u64,
        /// Client-side undo hint; the server generates its own and ignores
        /// this beyond logging.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        undo_data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transaction_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SyncCheck {
        project_id: i64,
        last_seq: u64,
        /// Advisory only; never authoritative.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state_hash: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    RequestFullSync { project_id: i64 },
    #[serde(rename_all = "camelCase")]
    Heartbeat { timestamp: u64, project_id: i64 },
}

/// One entry of the persisted operation log, as it travels in
/// `sync_response.missedOperations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationEntry {
    pub seq: u64,
    pub project_id: i64,
    pub user_id: i64,
    pub tab_id: String,
    pub operation_type: String,
    pub operation_id: String,
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub id: i64,
    pub name: String,
    pub owner_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub last_modified: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub connection_id: u64,
    pub user_id: i64,
    pub project_id: i64,
    pub tab_id: String,
    pub joined_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabRef {
    pub connection_id: u64,
    pub tab_id: String,
}

/// One distinct user present in a room, with all of their open tabs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveUser {
    pub user_id: i64,
    pub username: String,
    pub display_name: String,
    pub tabs: Vec<TabRef>,
}

/// Reasons an operation is refused. Mirrored by HTTP error codes where the
/// REST surface hits the same condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NotAuthenticated,
    UnknownType,
    ValidationFailed,
    SequenceConflict,
    PayloadTooLarge,
    PayloadContainsInlineMedia,
    NotFound,
    RateLimited,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    ProjectJoined {
        project: ProjectInfo,
        session: SessionDescriptor,
        sequence_number: u64,
    },
    #[serde(rename_all = "camelCase")]
    ActiveUsers { users: Vec<ActiveUser> },
    #[serde(rename_all = "camelCase")]
    UserJoined { user: ActiveUser },
    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: i64, username: String },
    #[serde(rename_all = "camelCase")]
    TabClosed { user_id: i64, tab_id: String },
    #[serde(rename_all = "camelCase")]
    OperationAck {
        operation_id: String,
        seq: u64,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        assigned_ids: BTreeMap<String, u64>,
    },
    #[serde(rename_all = "camelCase")]
    OperationRejected {
        operation_id: String,
        reason: RejectReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    StateUpdate {
        state_version: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation_id: Option<String>,
        changes: StateChanges,
        origin_user_id: i64,
        origin_tab_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transaction_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_undo: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_redo: Option<bool>,
    },
    #[serde(rename_all = "camelCase")]
    SyncResponse {
        needs_sync: bool,
        /// `None` with `needsSync: true` means the gap exceeds the ring and
        /// the client must request a full sync.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        missed_operations: Option<Vec<OperationEntry>>,
        latest_seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_state_hash: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    FullStateSync { state: Value, state_version: u64 },
    #[serde(rename_all = "camelCase")]
    MediaReady {
        hash: String,
        urls: BTreeMap<String, String>,
        formats: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    VideoProcessingQueued { filename: String },
    #[serde(rename_all = "camelCase")]
    VideoProcessingStart { filename: String },
    #[serde(rename_all = "camelCase")]
    VideoProcessingProgress { filename: String, percent: f32 },
    #[serde(rename_all = "camelCase")]
    VideoProcessingComplete {
        filename: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        formats: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    HeartbeatResponse { timestamp: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn execute_operation_wire_shape() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "execute_operation",
            "operationId": "a",
            "operationType": "node_create",
            "params": {"type": "image", "pos": [100.0, 100.0], "size": [200.0, 200.0]},
            "stateVersion": 11
        }))
        .unwrap();
        match &msg {
            ClientMessage::ExecuteOperation {
                operation_id,
                operation_type,
                state_version,
                ..
            } => {
                assert_eq!(operation_id, "a");
                assert_eq!(operation_type, "node_create");
                assert_eq!(*state_version, 11);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("\"type\":\"execute_operation\""));
        assert!(!text.contains("undoData"));
    }

    #[test]
    fn ack_includes_assigned_ids_only_when_present() {
        let bare = ServerMessage::OperationAck {
            operation_id: "a".into(),
            seq: 12,
            assigned_ids: BTreeMap::new(),
        };
        assert!(!serde_json::to_string(&bare).unwrap().contains("assignedIds"));

        let mapped = ServerMessage::OperationAck {
            operation_id: "a".into(),
            seq: 12,
            assigned_ids: BTreeMap::from([("t-17".to_string(), 42u64)]),
        };
        let text = serde_json::to_string(&mapped).unwrap();
        assert!(text.contains("\"assignedIds\":{\"t-17\":42}"));
    }

    #[test]
    fn reject_reason_uses_snake_case() {
        let msg = ServerMessage::OperationRejected {
            operation_id: "x".into(),
            reason: RejectReason::PayloadContainsInlineMedia,
            error: None,
        };
        assert!(
            serde_json::to_string(&msg)
                .unwrap()
                .contains("payload_contains_inline_media")
        );
    }
}

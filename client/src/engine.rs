//! Client-side canvas engine
//!
//! Mirrors the project canvas and reconciles it with the authoritative
//! server: operations apply optimistically with their undo captured, acks
//! confirm them (remapping temp ids to server ids), rejects and ack timeouts
//! roll them back, and sequence gaps trigger catch-up or a full resync.
//!
//! Optimistic node ids are allocated from a placeholder region far above any
//! server-assigned id, so a concurrent peer's create can never collide with a
//! node that is still waiting for its ack. Callers should not reference a
//! node in follow-up operations until its create has been acked.

use easel_protocol::{
    CanvasState, ClientMessage, OperationError, OperationKind, OperationParams, ServerMessage,
    StateChanges, UndoData, apply_operation, apply_undo,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// First placeholder id. Server ids are assigned from 1 upwards and stay far
/// below this.
pub const PLACEHOLDER_BASE: u64 = 1 << 32;

/// Ack deadline for ordinary operations.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Ack deadline for operations referencing media blobs.
pub const MEDIA_ACK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error("invalid snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

struct PendingOp {
    undo: UndoData,
    /// temp id -> placeholder id the optimistic apply allocated
    local_assigned: BTreeMap<String, u64>,
    deadline: Instant,
    order: u64,
}

/// Optimistic mirror of one project.
pub struct ClientEngine {
    project_id: i64,
    canvas: CanvasState,
    last_seq: u64,
    pending: HashMap<String, PendingOp>,
    next_order: u64,
}

impl ClientEngine {
    pub fn new(project_id: i64) -> Self {
        let mut canvas = CanvasState::new();
        canvas.next_node_id = PLACEHOLDER_BASE;
        Self {
            project_id,
            canvas,
            last_seq: 0,
            pending: HashMap::new(),
            next_order: 0,
        }
    }

    pub fn canvas(&self) -> &CanvasState {
        &self.canvas
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Optimistically apply an operation and produce the message to send.
    ///
    /// For `node_create` without a client id a temp id is injected so the
    /// ack can map the placeholder node to its authoritative id.
    pub fn prepare(
        &mut self,
        operation_type: &str,
        mut params: Value,
    ) -> Result<ClientMessage, EngineError> {
        let operation_id = uuid::Uuid::new_v4().to_string();

        let kind = OperationKind::parse(operation_type)?;
        if kind == OperationKind::NodeCreate {
            if let Some(map) = params.as_object_mut() {
                map.entry("id")
                    .or_insert_with(|| Value::String(format!("t-{operation_id}")));
            }
        }

        let op = OperationParams::parse(kind, &params)?;
        op.validate(&self.canvas)?;
        let outcome = op.apply(&mut self.canvas)?;

        let deadline = Instant::now()
            + if is_media_linked(kind, &params) {
                MEDIA_ACK_TIMEOUT
            } else {
                ACK_TIMEOUT
            };
        self.pending.insert(operation_id.clone(), PendingOp {
            undo: outcome.undo,
            local_assigned: outcome.assigned_ids,
            deadline,
            order: self.next_order,
        });
        self.next_order += 1;

        Ok(ClientMessage::ExecuteOperation {
            operation_id,
            operation_type: operation_type.to_string(),
            params,
            state_version: self.last_seq,
            undo_data: None,
            transaction_id: None,
        })
    }

    /// Feed one server message through the reconciler. A returned message
    /// must be sent to the server (catch-up or resync requests, and the
    /// initial full-sync request after a join).
    pub fn handle(&mut self, message: &ServerMessage) -> Result<Option<ClientMessage>, EngineError> {
        match message {
            ServerMessage::ProjectJoined {
                sequence_number, ..
            } => {
                self.last_seq = *sequence_number;
                self.pending.clear();
                // The join carries no canvas; hydrate through a full sync.
                Ok(Some(ClientMessage::RequestFullSync {
                    project_id: self.project_id,
                }))
            }

            ServerMessage::OperationAck {
                operation_id,
                seq,
                assigned_ids,
            } => {
                let Some(pending) = self.pending.remove(operation_id) else {
                    debug!(operation_id, "ack for unknown operation");
                    return Ok(None);
                };
                if *seq == self.last_seq + 1 {
                    for (temp, server_id) in assigned_ids {
                        if let Some(local) = pending.local_assigned.get(temp) {
                            rename_node(&mut self.canvas, *local, *server_id);
                        }
                    }
                    self.last_seq = *seq;
                    Ok(None)
                } else {
                    // We missed peer operations between our send and the
                    // ack; drop the optimistic copy and replay everything.
                    apply_undo(&mut self.canvas, &pending.undo)?;
                    Ok(Some(self.sync_check()))
                }
            }

            ServerMessage::OperationRejected {
                operation_id,
                reason,
                error,
            } => {
                if let Some(pending) = self.pending.remove(operation_id) {
                    warn!(operation_id, ?reason, ?error, "operation rejected, rolling back");
                    apply_undo(&mut self.canvas, &pending.undo)?;
                }
                Ok(None)
            }

            ServerMessage::StateUpdate {
                state_version,
                changes,
                ..
            } => {
                if *state_version <= self.last_seq {
                    debug!(state_version, "stale state update");
                    return Ok(None);
                }
                if *state_version == self.last_seq + 1 {
                    self.apply_changes(changes);
                    self.last_seq = *state_version;
                    Ok(None)
                } else {
                    Ok(Some(self.sync_check()))
                }
            }

            ServerMessage::SyncResponse {
                needs_sync,
                missed_operations,
                latest_seq,
                ..
            } => {
                if !needs_sync {
                    self.last_seq = *latest_seq;
                    return Ok(None);
                }
                match missed_operations {
                    Some(entries) => {
                        self.rollback_pending();
                        for entry in entries {
                            if entry.seq <= self.last_seq {
                                continue;
                            }
                            if apply_operation(
                                &mut self.canvas,
                                &entry.operation_type,
                                &entry.params,
                            )
                            .is_err()
                            {
                                // Local state has diverged beyond replay.
                                warn!(seq = entry.seq, "replay failed, requesting full sync");
                                return Ok(Some(ClientMessage::RequestFullSync {
                                    project_id: self.project_id,
                                }));
                            }
                            self.last_seq = entry.seq;
                        }
                        Ok(None)
                    }
                    None => Ok(Some(ClientMessage::RequestFullSync {
                        project_id: self.project_id,
                    })),
                }
            }

            ServerMessage::FullStateSync {
                state,
                state_version,
            } => {
                let mut canvas = CanvasState::from_value(Some(state.clone()))?;
                canvas.next_node_id = canvas.next_node_id.max(PLACEHOLDER_BASE);
                self.canvas = canvas;
                self.pending.clear();
                self.last_seq = *state_version;
                Ok(None)
            }

            // Presence and media notifications carry no canvas state.
            _ => Ok(None),
        }
    }

    /// Roll back operations whose ack deadline passed; returns their ids.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<String> {
        let mut expired: Vec<(u64, String)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, p)| (p.order, id.clone()))
            .collect();
        // Undo in reverse submission order.
        expired.sort_by(|a, b| b.0.cmp(&a.0));

        let mut ids = Vec::with_capacity(expired.len());
        for (_, id) in expired {
            if let Some(pending) = self.pending.remove(&id) {
                warn!(operation_id = %id, "ack timeout, rolling back");
                if let Err(e) = apply_undo(&mut self.canvas, &pending.undo) {
                    warn!(error = %e, "rollback failed");
                }
            }
            ids.push(id);
        }
        ids
    }

    pub fn sync_check(&self) -> ClientMessage {
        ClientMessage::SyncCheck {
            project_id: self.project_id,
            last_seq: self.last_seq,
            state_hash: None,
        }
    }

    pub fn heartbeat(&self, timestamp: u64) -> ClientMessage {
        ClientMessage::Heartbeat {
            timestamp,
            project_id: self.project_id,
        }
    }

    fn rollback_pending(&mut self) {
        let mut pending: Vec<(u64, UndoData)> = self
            .pending
            .drain()
            .map(|(_, p)| (p.order, p.undo))
            .collect();
        pending.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, undo) in pending {
            if let Err(e) = apply_undo(&mut self.canvas, &undo) {
                warn!(error = %e, "pending rollback failed");
            }
        }
    }

    fn apply_changes(&mut self, changes: &StateChanges) {
        for node in &changes.added {
            self.canvas.insert_node(node.clone());
        }
        for node in &changes.updated {
            self.canvas.insert_node(node.clone());
        }
        for id in &changes.removed {
            self.canvas.remove_node(*id);
        }
        if let Some(order) = &changes.layer_order {
            // Keep optimistic placeholder nodes (unknown to the server) at
            // the top of the authoritative order.
            let mut merged = order.clone();
            for id in self.canvas.layer_order.clone() {
                if !merged.contains(&id) && self.canvas.contains(id) {
                    merged.push(id);
                }
            }
            self.canvas.layer_order = merged;
        }
        // Placeholder allocation must survive server-driven inserts.
        self.canvas.next_node_id = self.canvas.next_node_id.max(PLACEHOLDER_BASE);
    }
}

fn is_media_linked(kind: OperationKind, params: &Value) -> bool {
    kind == OperationKind::NodeCreate
        && params
            .get("properties")
            .and_then(|p| p.get("hash"))
            .is_some()
}

/// Move a node to its authoritative id, keeping its layer position.
fn rename_node(canvas: &mut CanvasState, old_id: u64, new_id: u64) {
    if old_id == new_id || !canvas.contains(old_id) {
        return;
    }
    if let Some(mut node) = canvas.nodes.remove(&old_id) {
        node.id = new_id;
        for slot in canvas.layer_order.iter_mut() {
            if *slot == old_id {
                *slot = new_id;
            }
        }
        canvas.nodes.insert(new_id, node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn joined_engine() -> ClientEngine {
        let mut engine = ClientEngine::new(7);
        let request = engine
            .handle(&ServerMessage::ProjectJoined {
                project: easel_protocol::ProjectInfo {
                    id: 7,
                    name: "canvas".into(),
                    owner_id: 1,
                    description: None,
                    last_modified: 0,
                },
                session: easel_protocol::SessionDescriptor {
                    connection_id: 1,
                    user_id: 1,
                    project_id: 7,
                    tab_id: "A".into(),
                    joined_at: 0,
                },
                sequence_number: 0,
            })
            .unwrap();
        assert!(matches!(request, Some(ClientMessage::RequestFullSync { .. })));
        engine
            .handle(&ServerMessage::FullStateSync {
                state: Value::Null,
                state_version: 0,
            })
            .unwrap();
        engine
    }

    fn create_params() -> Value {
        json!({
            "id": "t-17",
            "type": "image",
            "pos": [50.0, 50.0],
            "size": [200.0, 200.0]
        })
    }

    #[test]
    fn ack_remaps_placeholder_to_server_id() {
        let mut engine = joined_engine();
        let message = engine.prepare("node_create", create_params()).unwrap();
        let ClientMessage::ExecuteOperation { operation_id, .. } = &message else {
            panic!("expected execute_operation");
        };

        // Optimistic node lives in the placeholder region.
        assert!(engine.canvas().contains(PLACEHOLDER_BASE));

        engine
            .handle(&ServerMessage::OperationAck {
                operation_id: operation_id.clone(),
                seq: 1,
                assigned_ids: BTreeMap::from([("t-17".to_string(), 42u64)]),
            })
            .unwrap();

        assert!(!engine.canvas().contains(PLACEHOLDER_BASE));
        let node = engine.canvas().get(42).expect("renamed node");
        assert_eq!(node.pos, [50.0, 50.0]);
        assert_eq!(engine.canvas().layer_order, vec![42]);
        assert_eq!(engine.last_seq(), 1);
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn reject_rolls_back_optimistic_state() {
        let mut engine = joined_engine();
        let message = engine.prepare("node_create", create_params()).unwrap();
        let ClientMessage::ExecuteOperation { operation_id, .. } = &message else {
            panic!("expected execute_operation");
        };
        assert_eq!(engine.canvas().node_count(), 1);

        engine
            .handle(&ServerMessage::OperationRejected {
                operation_id: operation_id.clone(),
                reason: easel_protocol::RejectReason::ValidationFailed,
                error: None,
            })
            .unwrap();
        assert_eq!(engine.canvas().node_count(), 0);
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn state_update_gap_requests_catch_up() {
        let mut engine = joined_engine();
        let update = ServerMessage::StateUpdate {
            state_version: 5,
            operation_id: None,
            changes: StateChanges::default(),
            origin_user_id: 2,
            origin_tab_id: "B".into(),
            transaction_id: None,
            is_undo: None,
            is_redo: None,
        };
        let action = engine.handle(&update).unwrap();
        assert!(matches!(
            action,
            Some(ClientMessage::SyncCheck { last_seq: 0, .. })
        ));
        // The gap is not applied; we wait for the replay.
        assert_eq!(engine.last_seq(), 0);
    }

    #[test]
    fn beyond_ring_response_requests_full_sync() {
        let mut engine = joined_engine();
        let action = engine
            .handle(&ServerMessage::SyncResponse {
                needs_sync: true,
                missed_operations: None,
                latest_seq: 900,
                server_state_hash: None,
            })
            .unwrap();
        assert!(matches!(action, Some(ClientMessage::RequestFullSync { .. })));
    }

    #[test]
    fn missed_operations_replay_in_order() {
        let mut engine = joined_engine();
        let entries = vec![
            easel_protocol::OperationEntry {
                seq: 1,
                project_id: 7,
                user_id: 2,
                tab_id: "B".into(),
                operation_type: "node_create".into(),
                operation_id: "peer-1".into(),
                params: json!({"type": "text", "pos": [0.0, 0.0], "size": [10.0, 10.0]}),
                undo_data: None,
                transaction_id: None,
                created_at: 0,
            },
            easel_protocol::OperationEntry {
                seq: 2,
                project_id: 7,
                user_id: 2,
                tab_id: "B".into(),
                operation_type: "node_move".into(),
                operation_id: "peer-2".into(),
                params: json!({"nodeId": 1, "position": [9.0, 9.0]}),
                undo_data: None,
                transaction_id: None,
                created_at: 0,
            },
        ];
        let action = engine
            .handle(&ServerMessage::SyncResponse {
                needs_sync: true,
                missed_operations: Some(entries),
                latest_seq: 2,
                server_state_hash: None,
            })
            .unwrap();
        assert!(action.is_none());
        assert_eq!(engine.last_seq(), 2);
        assert_eq!(engine.canvas().get(1).unwrap().pos, [9.0, 9.0]);
    }

    #[test]
    fn ack_timeout_rolls_back() {
        let mut engine = joined_engine();
        engine.prepare("node_create", create_params()).unwrap();
        assert_eq!(engine.canvas().node_count(), 1);

        let expired = engine.check_timeouts(Instant::now() + ACK_TIMEOUT * 2);
        assert_eq!(expired.len(), 1);
        assert_eq!(engine.canvas().node_count(), 0);
    }

    #[test]
    fn full_sync_replaces_state_and_clears_pending() {
        let mut engine = joined_engine();
        engine.prepare("node_create", create_params()).unwrap();

        let state = json!({
            "nodes": {"3": {
                "id": 3, "type": "text",
                "pos": [1.0, 1.0], "size": [10.0, 10.0]
            }},
            "layerOrder": [3],
            "nextNodeId": 4
        });
        engine
            .handle(&ServerMessage::FullStateSync {
                state,
                state_version: 900,
            })
            .unwrap();
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.last_seq(), 900);
        assert_eq!(engine.canvas().node_count(), 1);
        assert!(engine.canvas().contains(3));
        // Placeholder allocation stays clear of server ids.
        assert!(engine.canvas().next_node_id >= PLACEHOLDER_BASE);
    }
}

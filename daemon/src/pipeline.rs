//! Operation pipeline
//!
//! Admission (session + payload checks), idempotency, sequencing and
//! persistence inside the project lane, then fan-out: ack to the originator,
//! `state_update` deltas to every other Active session. Rejections roll the
//! canvas back (or never touch it) so the in-memory state always equals the
//! persisted log.

use crate::metrics::Metrics;
use crate::registry::{Session, SessionRegistry, SessionState};
use crate::room::{Room, RoomManager};
use dashmap::DashMap;
use easel_protocol::{
    ApplyOutcome, OperationEntry, OperationError, OperationKind, OperationParams, RejectReason,
    ServerMessage, apply_undo, check_operation_payload,
};
use easel_store::{OperationEnvelope, Store, StoreError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Attempts against a losing `appendOperation` race before giving up.
const APPEND_RETRIES: u32 = 3;

struct DedupEntry {
    at: Instant,
    response: ServerMessage,
}

/// The inbound `execute_operation` payload, decoupled from the transport.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub operation_id: String,
    pub operation_type: String,
    pub params: Value,
    pub state_version: u64,
    pub transaction_id: Option<String>,
}

pub struct OperationPipeline {
    store: Store,
    registry: Arc<SessionRegistry>,
    rooms: Arc<RoomManager>,
    metrics: Arc<Metrics>,
    /// operationId -> last response, for at-least-once retries.
    dedup: DashMap<String, DedupEntry>,
    dedup_ttl: Duration,
}

impl OperationPipeline {
    pub fn new(
        store: Store,
        registry: Arc<SessionRegistry>,
        rooms: Arc<RoomManager>,
        metrics: Arc<Metrics>,
        dedup_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            rooms,
            metrics,
            dedup: DashMap::new(),
            dedup_ttl,
        })
    }

    /// Entry point for one `execute_operation` message.
    pub async fn execute(&self, connection_id: u64, request: ExecuteRequest) {
        let started = Instant::now();

        // 1. The session must be Active in the stated project.
        let session = match self.registry.session(connection_id) {
            Some(s) if s.state == SessionState::Active => s,
            _ => {
                self.reject(
                    connection_id,
                    &request.operation_id,
                    RejectReason::NotAuthenticated,
                    Some("no active session".into()),
                    false,
                );
                return;
            }
        };

        // 2. Idempotent replay: a retried operationId inside the TTL gets
        //    the previous response verbatim, with no side effects.
        if let Some(previous) = self.replay(&request.operation_id) {
            debug!(operation_id = %request.operation_id, "dedup replay");
            self.registry.send_to(connection_id, &previous);
            return;
        }

        match self.admit_and_apply(&session, &request).await {
            Ok(accepted) => {
                self.metrics.operations_accepted.inc();
                self.metrics
                    .operation_duration
                    .observe(started.elapsed().as_secs_f64());

                let ack = ServerMessage::OperationAck {
                    operation_id: request.operation_id.clone(),
                    seq: accepted.last_seq,
                    assigned_ids: accepted.assigned_ids,
                };
                self.remember(&request.operation_id, &ack);
                self.registry.send_to(connection_id, &ack);

                let room = accepted.room;
                for update in accepted.updates {
                    self.rooms
                        .broadcast_except(&room, connection_id, &update)
                        .await;
                }

                if accepted.ops_since_snapshot >= self.rooms.snapshot_interval() {
                    let rooms = self.rooms.clone();
                    tokio::spawn(async move {
                        rooms.persist_snapshot(&room).await;
                    });
                }
            }
            Err(rejection) => {
                self.reject(
                    connection_id,
                    &request.operation_id,
                    rejection.reason,
                    rejection.error,
                    true,
                );
            }
        }
    }

    /// Steps 3-7: payload checks, parse, lane entry, apply, persist.
    async fn admit_and_apply(
        &self,
        session: &Session,
        request: &ExecuteRequest,
    ) -> Result<Accepted, Rejection> {
        self.metrics
            .operation_payload_size
            .observe(serde_json::to_string(&request.params).map(|s| s.len()).unwrap_or(0) as f64);

        check_operation_payload(&request.params).map_err(Rejection::from_operation)?;
        let kind =
            OperationKind::parse(&request.operation_type).map_err(Rejection::from_operation)?;
        let op = OperationParams::parse(kind, &request.params).map_err(Rejection::from_operation)?;

        let room = self
            .rooms
            .get(session.project_id)
            .ok_or_else(|| Rejection::internal("room gone while session active"))?;

        // Project lane: everything from validate to ring update happens
        // under the canvas guard.
        let mut canvas = room.lock_canvas().await;
        op.validate(&canvas).map_err(Rejection::from_operation)?;

        let accepted = if let OperationParams::Transaction(tx) = &op {
            self.apply_transaction(session, request, &room, &mut canvas, tx)
                .await?
        } else {
            self.apply_single(session, request, &room, &mut canvas, &op)
                .await?
        };
        drop(canvas);
        Ok(accepted)
    }

    /// Single operation: mutate the canvas, then persist; a failed append
    /// rolls the mutation back before rejecting.
    async fn apply_single(
        &self,
        session: &Session,
        request: &ExecuteRequest,
        room: &Arc<Room>,
        canvas: &mut easel_protocol::CanvasState,
        op: &OperationParams,
    ) -> Result<Accepted, Rejection> {
        let outcome = op.apply(canvas).map_err(Rejection::from_operation)?;
        let undo_value = serde_json::to_value(&outcome.undo).ok();

        let envelope = OperationEnvelope {
            operation_id: request.operation_id.clone(),
            params: request.params.clone(),
            undo_data: undo_value.clone(),
            transaction_id: request.transaction_id.clone(),
        };

        let seq = match self
            .append_with_retry(session, &request.operation_type, &envelope)
            .await
        {
            Ok(seq) => seq,
            Err(rejection) => {
                if let Err(e) = apply_undo(canvas, &outcome.undo) {
                    error!(error = %e, "rollback after failed append");
                }
                return Err(rejection);
            }
        };

        let entry = OperationEntry {
            seq,
            project_id: session.project_id,
            user_id: session.user_id,
            tab_id: session.tab_id.clone(),
            operation_type: request.operation_type.clone(),
            operation_id: request.operation_id.clone(),
            params: request.params.clone(),
            undo_data: undo_value,
            transaction_id: request.transaction_id.clone(),
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        let ops_since_snapshot = room.record_applied(entry);

        Ok(Accepted {
            room: room.clone(),
            last_seq: seq,
            assigned_ids: outcome.assigned_ids.clone(),
            updates: vec![state_update(session, request, seq, &outcome)],
            ops_since_snapshot,
        })
    }

    /// Transaction: children apply to a scratch canvas, persist as one
    /// contiguous block, and only then replace the live canvas. Peers get
    /// one `state_update` per child, all tagged with the transactionId.
    async fn apply_transaction(
        &self,
        session: &Session,
        request: &ExecuteRequest,
        room: &Arc<Room>,
        canvas: &mut easel_protocol::CanvasState,
        tx: &easel_protocol::TransactionParams,
    ) -> Result<Accepted, Rejection> {
        let children = tx.parse_children().map_err(Rejection::from_operation)?;
        let transaction_id = request
            .transaction_id
            .clone()
            .or_else(|| tx.transaction_id.clone());

        let mut scratch = canvas.clone();
        let mut outcomes: Vec<(OperationKind, Value, ApplyOutcome)> =
            Vec::with_capacity(children.len());
        for (kind, child) in &children {
            child.validate(&scratch).map_err(Rejection::from_operation)?;
            let outcome = child.apply(&mut scratch).map_err(Rejection::from_operation)?;
            let params = child_params(child);
            outcomes.push((*kind, params, outcome));
        }

        let batch: Vec<(String, OperationEnvelope)> = outcomes
            .iter()
            .enumerate()
            .map(|(index, (kind, params, outcome))| {
                (
                    kind.as_str().to_string(),
                    OperationEnvelope {
                        operation_id: format!("{}#{index}", request.operation_id),
                        params: params.clone(),
                        undo_data: serde_json::to_value(&outcome.undo).ok(),
                        transaction_id: transaction_id.clone(),
                    },
                )
            })
            .collect();

        let seqs = match self
            .store
            .append_operations(
                session.project_id,
                session.user_id,
                &session.tab_id,
                &batch,
            )
            .await
        {
            Ok(seqs) => seqs,
            Err(e) => return Err(Rejection::from_store(e)),
        };

        *canvas = scratch;

        let mut assigned_ids = BTreeMap::new();
        let mut updates = Vec::with_capacity(outcomes.len());
        let mut ops_since_snapshot = 0;
        let now = chrono::Utc::now().timestamp_millis();
        for (index, ((kind, params, outcome), seq)) in
            outcomes.iter().zip(seqs.iter()).enumerate()
        {
            assigned_ids.extend(outcome.assigned_ids.clone());
            ops_since_snapshot = room.record_applied(OperationEntry {
                seq: *seq,
                project_id: session.project_id,
                user_id: session.user_id,
                tab_id: session.tab_id.clone(),
                operation_type: kind.as_str().to_string(),
                operation_id: format!("{}#{index}", request.operation_id),
                params: params.clone(),
                undo_data: serde_json::to_value(&outcome.undo).ok(),
                transaction_id: transaction_id.clone(),
                created_at: now,
            });
            updates.push(ServerMessage::StateUpdate {
                state_version: *seq,
                operation_id: Some(request.operation_id.clone()),
                changes: outcome.changes.clone(),
                origin_user_id: session.user_id,
                origin_tab_id: session.tab_id.clone(),
                transaction_id: transaction_id.clone(),
                is_undo: None,
                is_redo: None,
            });
        }

        Ok(Accepted {
            room: room.clone(),
            last_seq: *seqs.last().unwrap_or(&room.seq()),
            assigned_ids,
            updates,
            ops_since_snapshot,
        })
    }

    async fn append_with_retry(
        &self,
        session: &Session,
        operation_type: &str,
        envelope: &OperationEnvelope,
    ) -> Result<u64, Rejection> {
        let mut attempt = 0;
        loop {
            match self
                .store
                .append_operation(
                    session.project_id,
                    session.user_id,
                    &session.tab_id,
                    operation_type,
                    envelope,
                )
                .await
            {
                Ok(seq) => return Ok(seq),
                Err(StoreError::Conflict) if attempt < APPEND_RETRIES => {
                    attempt += 1;
                    debug!(attempt, "append conflict, retrying");
                }
                Err(e) => return Err(Rejection::from_store(e)),
            }
        }
    }

    fn replay(&self, operation_id: &str) -> Option<ServerMessage> {
        let entry = self.dedup.get(operation_id)?;
        if entry.at.elapsed() < self.dedup_ttl {
            Some(entry.response.clone())
        } else {
            drop(entry);
            self.dedup.remove(operation_id);
            None
        }
    }

    fn remember(&self, operation_id: &str, response: &ServerMessage) {
        self.dedup.insert(operation_id.to_string(), DedupEntry {
            at: Instant::now(),
            response: response.clone(),
        });
    }

    /// Drop dedup entries past the TTL; called periodically by the server.
    pub fn sweep_dedup(&self) {
        let ttl = self.dedup_ttl;
        self.dedup.retain(|_, entry| entry.at.elapsed() < ttl);
    }

    fn reject(
        &self,
        connection_id: u64,
        operation_id: &str,
        reason: RejectReason,
        error: Option<String>,
        remember: bool,
    ) {
        self.metrics.operations_rejected.inc();
        if reason == RejectReason::Internal {
            let correlation_id = uuid::Uuid::new_v4();
            error!(%correlation_id, operation_id, detail = ?error, "internal rejection");
        } else {
            debug!(operation_id, ?reason, "operation rejected");
        }
        let message = ServerMessage::OperationRejected {
            operation_id: operation_id.to_string(),
            reason,
            error,
        };
        if remember {
            self.remember(operation_id, &message);
        }
        self.registry.send_to(connection_id, &message);
    }
}

struct Accepted {
    room: Arc<Room>,
    last_seq: u64,
    assigned_ids: BTreeMap<String, u64>,
    updates: Vec<ServerMessage>,
    ops_since_snapshot: u64,
}

struct Rejection {
    reason: RejectReason,
    error: Option<String>,
}

impl Rejection {
    fn from_operation(e: OperationError) -> Self {
        let reason = match &e {
            OperationError::UnknownType(_) => RejectReason::UnknownType,
            OperationError::Invalid(_) | OperationError::NestedTransaction => {
                RejectReason::ValidationFailed
            }
            OperationError::NodeNotFound(_) => RejectReason::NotFound,
            OperationError::InlineMedia => RejectReason::PayloadContainsInlineMedia,
            OperationError::PayloadTooLarge { .. } => RejectReason::PayloadTooLarge,
        };
        let error = match &e {
            OperationError::NodeNotFound(id) => Some(format!("node {id}")),
            other => Some(other.to_string()),
        };
        Self { reason, error }
    }

    fn from_store(e: StoreError) -> Self {
        match e {
            StoreError::Conflict => Self {
                reason: RejectReason::SequenceConflict,
                error: Some("sequence conflict".into()),
            },
            other => {
                warn!(error = %other, "store failure during append");
                Self {
                    reason: RejectReason::Internal,
                    error: Some(other.to_string()),
                }
            }
        }
    }

    fn internal(detail: &str) -> Self {
        Self {
            reason: RejectReason::Internal,
            error: Some(detail.to_string()),
        }
    }
}

fn child_params(op: &OperationParams) -> Value {
    let serialized = match op {
        OperationParams::NodeCreate(p) => serde_json::to_value(p),
        OperationParams::NodeDelete(p) => serde_json::to_value(p),
        OperationParams::NodeMove(p) => serde_json::to_value(p),
        OperationParams::NodeResize(p) => serde_json::to_value(p),
        OperationParams::NodeRotate(p) => serde_json::to_value(p),
        OperationParams::NodePropertyUpdate(p) => serde_json::to_value(p),
        OperationParams::NodeBatchPropertyUpdate(p) => serde_json::to_value(p),
        OperationParams::LayerOrderChange(p) => serde_json::to_value(p),
        OperationParams::Transaction(p) => serde_json::to_value(p),
    };
    serialized.unwrap_or(Value::Null)
}

fn state_update(
    session: &Session,
    request: &ExecuteRequest,
    seq: u64,
    outcome: &ApplyOutcome,
) -> ServerMessage {
    ServerMessage::StateUpdate {
        state_version: seq,
        operation_id: Some(request.operation_id.clone()),
        changes: outcome.changes.clone(),
        origin_user_id: session.user_id,
        origin_tab_id: session.tab_id.clone(),
        transaction_id: request.transaction_id.clone(),
        is_undo: None,
        is_redo: None,
    }
}

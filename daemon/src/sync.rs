//! Sync service
//!
//! Answers `sync_check` from the recent-ops ring (falling back to the store
//! when entries have been evicted) and serves on-demand full resyncs from the
//! authoritative canvas. The client's `stateHash` is advisory; the server
//! always reports its own.

use crate::registry::{SessionRegistry, SessionState};
use crate::room::RoomManager;
use easel_protocol::ServerMessage;
use easel_store::Store;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct SyncService {
    store: Store,
    rooms: Arc<RoomManager>,
    registry: Arc<SessionRegistry>,
}

impl SyncService {
    pub fn new(
        store: Store,
        rooms: Arc<RoomManager>,
        registry: Arc<SessionRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            rooms,
            registry,
        })
    }

    pub async fn sync_check(&self, connection_id: u64, project_id: i64, last_seq: u64) {
        let Some(room) = self.authorized_room(connection_id, project_id) else {
            return;
        };

        let latest_seq = room.seq();
        let server_state_hash = Some(self.state_hash(&room).await);

        let response = if latest_seq == last_seq {
            ServerMessage::SyncResponse {
                needs_sync: false,
                missed_operations: None,
                latest_seq,
                server_state_hash,
            }
        } else if last_seq > latest_seq {
            // A client claiming to be ahead of the log can only recover via
            // a full resync.
            warn!(connection_id, last_seq, latest_seq, "client ahead of log");
            ServerMessage::SyncResponse {
                needs_sync: true,
                missed_operations: None,
                latest_seq,
                server_state_hash,
            }
        } else if (latest_seq - last_seq) as usize <= room.ring_capacity() {
            let missed = match room.ring_ops_since(last_seq) {
                Some(ops) if ops.len() as u64 == latest_seq - last_seq => ops,
                // Ring miss (evicted or freshly hydrated room): the log has
                // every operation.
                _ => {
                    let limit = (latest_seq - last_seq) as u32;
                    match self.store.operations_since(project_id, last_seq, limit).await {
                        Ok(ops) => ops,
                        Err(e) => {
                            warn!(project_id, error = %e, "store catch-up failed");
                            return;
                        }
                    }
                }
            };
            debug!(connection_id, missed = missed.len(), "serving catch-up");
            ServerMessage::SyncResponse {
                needs_sync: true,
                missed_operations: Some(missed),
                latest_seq,
                server_state_hash,
            }
        } else {
            ServerMessage::SyncResponse {
                needs_sync: true,
                missed_operations: None,
                latest_seq,
                server_state_hash,
            }
        };

        self.registry.send_to(connection_id, &response);
    }

    pub async fn full_sync(&self, connection_id: u64, project_id: i64) {
        let Some(room) = self.authorized_room(connection_id, project_id) else {
            return;
        };

        let (state, state_version) = {
            let canvas = room.lock_canvas().await;
            (canvas.to_value(), room.seq())
        };
        debug!(connection_id, state_version, "serving full state sync");
        self.registry.send_to(connection_id, &ServerMessage::FullStateSync {
            state,
            state_version,
        });
    }

    fn authorized_room(
        &self,
        connection_id: u64,
        project_id: i64,
    ) -> Option<Arc<crate::room::Room>> {
        let session = self.registry.session(connection_id)?;
        if session.state != SessionState::Active || session.project_id != project_id {
            debug!(connection_id, project_id, "sync request without active session");
            return None;
        }
        self.rooms.get(project_id)
    }

    async fn state_hash(&self, room: &Arc<crate::room::Room>) -> String {
        let blob = {
            let canvas = room.lock_canvas().await;
            canvas.to_value().to_string()
        };
        Sha256::digest(blob.as_bytes())
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

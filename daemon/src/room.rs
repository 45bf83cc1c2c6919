//! Rooms - per-project coordination
//!
//! A room owns the volatile ordering state of one project: the authoritative
//! in-memory canvas, the sequence counter mirroring the store, the connected
//! members, and the recent-ops ring for fast catch-up. The canvas mutex *is*
//! the per-project serial lane: whoever holds it may append to the log, and
//! the counter/ring only change under it, so sequence numbers form one total
//! order per project.

use crate::metrics::Metrics;
use crate::registry::{Session, SessionState};
use easel_protocol::{ActiveUser, CanvasState, OperationEntry, ServerMessage, TabRef};
use easel_store::Store;
use easel_transport::Dispatcher;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::MutexGuard;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RoomMember {
    pub user_id: i64,
    pub username: String,
    pub display_name: String,
    pub tab_id: String,
    pub state: SessionState,
}

/// In-memory state for one project.
pub struct Room {
    pub project_id: i64,
    /// Mirrors `Store::latest_seq` whenever the lane is idle.
    seq: AtomicU64,
    /// The serial lane. Holding this guard is the permission to append.
    canvas: tokio::sync::Mutex<CanvasState>,
    members: RwLock<HashMap<u64, RoomMember>>,
    ring: Mutex<VecDeque<OperationEntry>>,
    ring_capacity: usize,
    ops_since_snapshot: AtomicU64,
}

impl Room {
    fn new(project_id: i64, canvas: CanvasState, latest_seq: u64, ring_capacity: usize) -> Self {
        Self {
            project_id,
            seq: AtomicU64::new(latest_seq),
            canvas: tokio::sync::Mutex::new(canvas),
            members: RwLock::new(HashMap::new()),
            ring: Mutex::new(VecDeque::with_capacity(ring_capacity)),
            ring_capacity,
            ops_since_snapshot: AtomicU64::new(0),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Enter the project lane.
    pub async fn lock_canvas(&self) -> MutexGuard<'_, CanvasState> {
        self.canvas.lock().await
    }

    /// Record one persisted operation. Must be called while holding the
    /// canvas guard; returns how many ops accumulated since the last
    /// snapshot so the caller can decide to persist one.
    pub fn record_applied(&self, entry: OperationEntry) -> u64 {
        self.seq.store(entry.seq, Ordering::Release);
        let mut ring = self.ring.lock();
        ring.push_back(entry);
        while ring.len() > self.ring_capacity {
            ring.pop_front();
        }
        self.ops_since_snapshot.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_snapshot_counter(&self) {
        self.ops_since_snapshot.store(0, Ordering::Relaxed);
    }

    pub fn ring_capacity(&self) -> usize {
        self.ring_capacity
    }

    /// Ops with seq > `last_seq` from the ring, or `None` when the gap
    /// starts before the oldest retained entry.
    pub fn ring_ops_since(&self, last_seq: u64) -> Option<Vec<OperationEntry>> {
        let ring = self.ring.lock();
        let oldest = match ring.front() {
            Some(entry) => entry.seq,
            None => return if self.seq() == last_seq { Some(Vec::new()) } else { None },
        };
        if last_seq + 1 < oldest {
            return None;
        }
        Some(ring.iter().filter(|e| e.seq > last_seq).cloned().collect())
    }

    pub fn add_member(&self, connection_id: u64, member: RoomMember) {
        self.members.write().insert(connection_id, member);
    }

    pub fn remove_member(&self, connection_id: u64) -> Option<RoomMember> {
        self.members.write().remove(&connection_id)
    }

    pub fn set_member_state(&self, connection_id: u64, state: SessionState) {
        if let Some(member) = self.members.write().get_mut(&connection_id) {
            member.state = state;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }

    /// Copy-on-read member snapshot so no lock is held across sends.
    pub fn members_snapshot(&self) -> Vec<(u64, RoomMember)> {
        self.members
            .read()
            .iter()
            .map(|(id, m)| (*id, m.clone()))
            .collect()
    }

    /// How many Active tabs the user currently has in this room.
    pub fn tabs_of_user(&self, user_id: i64) -> usize {
        self.members
            .read()
            .values()
            .filter(|m| m.user_id == user_id && m.state == SessionState::Active)
            .count()
    }

    /// Distinct users with at least one Active session, with their tabs.
    pub fn active_users(&self) -> Vec<ActiveUser> {
        let members = self.members.read();
        let mut users: HashMap<i64, ActiveUser> = HashMap::new();
        for (connection_id, member) in members.iter() {
            if member.state != SessionState::Active {
                continue;
            }
            let entry = users.entry(member.user_id).or_insert_with(|| ActiveUser {
                user_id: member.user_id,
                username: member.username.clone(),
                display_name: member.display_name.clone(),
                tabs: Vec::new(),
            });
            entry.tabs.push(TabRef {
                connection_id: *connection_id,
                tab_id: member.tab_id.clone(),
            });
        }
        let mut list: Vec<ActiveUser> = users.into_values().collect();
        list.sort_by_key(|u| u.user_id);
        for user in &mut list {
            user.tabs.sort_by_key(|t| t.connection_id);
        }
        list
    }
}

/// Owns the live rooms: creation on first join, teardown (with a final
/// snapshot) when the last session leaves, and all room-addressed fan-out.
pub struct RoomManager {
    rooms: dashmap::DashMap<i64, Arc<Room>>,
    store: Store,
    /// Fan-out seam; the session registry behind it owns the outboxes.
    dispatcher: Arc<dyn Dispatcher>,
    metrics: Arc<Metrics>,
    ring_capacity: usize,
    snapshot_interval: u64,
}

impl RoomManager {
    pub fn new(
        store: Store,
        dispatcher: Arc<dyn Dispatcher>,
        metrics: Arc<Metrics>,
        ring_capacity: usize,
        snapshot_interval: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            rooms: dashmap::DashMap::new(),
            store,
            dispatcher,
            metrics,
            ring_capacity,
            snapshot_interval,
        })
    }

    pub fn get(&self, project_id: i64) -> Option<Arc<Room>> {
        self.rooms.get(&project_id).map(|e| e.value().clone())
    }

    pub fn snapshot_interval(&self) -> u64 {
        self.snapshot_interval
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Get the live room or hydrate one from the store: persisted snapshot
    /// plus a replay of every logged operation past its save marker.
    pub async fn get_or_create(&self, project_id: i64) -> Result<Arc<Room>, easel_store::StoreError> {
        if let Some(room) = self.get(project_id) {
            return Ok(room);
        }

        let canvas = load_canvas(&self.store, project_id).await?;
        let latest_seq = self.store.latest_seq(project_id).await?;
        let room = Arc::new(Room::new(
            project_id,
            canvas,
            latest_seq,
            self.ring_capacity,
        ));

        let room = match self.rooms.entry(project_id) {
            dashmap::mapref::entry::Entry::Occupied(existing) => existing.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(room.clone());
                info!(project_id, latest_seq, "room created");
                room
            }
        };
        self.metrics.active_rooms.set(self.rooms.len() as i64);
        Ok(room)
    }

    /// Add the session to the room and emit presence. The caller has already
    /// sent `project_joined` and flipped the session Active.
    pub async fn admit(&self, room: &Arc<Room>, session: &Session) {
        let first_tab = room.tabs_of_user(session.user_id) == 0;
        room.add_member(
            session.connection_id,
            RoomMember {
                user_id: session.user_id,
                username: session.username.clone(),
                display_name: session.display_name.clone(),
                tab_id: session.tab_id.clone(),
                state: SessionState::Active,
            },
        );

        if first_tab {
            let user = room
                .active_users()
                .into_iter()
                .find(|u| u.user_id == session.user_id);
            if let Some(user) = user {
                self.broadcast_except(
                    room,
                    session.connection_id,
                    &ServerMessage::UserJoined { user },
                )
                .await;
            }
        }
        self.broadcast_all(room, &ServerMessage::ActiveUsers {
            users: room.active_users(),
        })
        .await;
    }

    /// Remove the session, emit `user_left`/`tab_closed`, and tear the room
    /// down (persisting a final snapshot) when it empties.
    pub async fn leave(&self, room: &Arc<Room>, connection_id: u64) {
        let Some(member) = room.remove_member(connection_id) else {
            return;
        };
        debug!(project_id = room.project_id, connection_id, "session left room");

        let message = if room.tabs_of_user(member.user_id) == 0 {
            ServerMessage::UserLeft {
                user_id: member.user_id,
                username: member.username.clone(),
            }
        } else {
            ServerMessage::TabClosed {
                user_id: member.user_id,
                tab_id: member.tab_id.clone(),
            }
        };
        self.broadcast_all(room, &message).await;
        self.broadcast_all(room, &ServerMessage::ActiveUsers {
            users: room.active_users(),
        })
        .await;

        if room.is_empty() {
            self.rooms.remove(&room.project_id);
            self.metrics.active_rooms.set(self.rooms.len() as i64);
            self.persist_snapshot(room).await;
            info!(project_id = room.project_id, "room closed");
        }
    }

    /// Persist the current canvas with its seq marker.
    pub async fn persist_snapshot(&self, room: &Arc<Room>) {
        let (blob, seq) = {
            let canvas = room.lock_canvas().await;
            (canvas.to_value(), room.seq())
        };
        room.reset_snapshot_counter();
        if let Err(e) = self.store.save_snapshot(room.project_id, &blob, seq).await {
            warn!(project_id = room.project_id, error = %e, "snapshot persist failed");
        } else {
            debug!(project_id = room.project_id, seq, "snapshot persisted");
        }
    }

    /// Snapshot every live room (shutdown path).
    pub async fn persist_all(&self) {
        let rooms: Vec<Arc<Room>> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for room in rooms {
            self.persist_snapshot(&room).await;
        }
    }

    pub async fn send_to(&self, connection_id: u64, message: &ServerMessage) {
        self.dispatcher.dispatch(connection_id, message.clone()).await;
    }

    pub async fn broadcast_all(&self, room: &Arc<Room>, message: &ServerMessage) {
        for (connection_id, member) in room.members_snapshot() {
            if member.state == SessionState::Active {
                self.dispatcher.dispatch(connection_id, message.clone()).await;
            }
        }
    }

    pub async fn broadcast_except(
        &self,
        room: &Arc<Room>,
        except: u64,
        message: &ServerMessage,
    ) {
        for (connection_id, member) in room.members_snapshot() {
            if connection_id != except && member.state == SessionState::Active {
                self.dispatcher.dispatch(connection_id, message.clone()).await;
            }
        }
    }
}

/// Canonical canvas of a project: the persisted blob patched by every logged
/// operation past its save marker.
pub async fn load_canvas(
    store: &Store,
    project_id: i64,
) -> Result<CanvasState, easel_store::StoreError> {
    let (mut canvas, marker) = match store.load_snapshot(project_id).await {
        Ok(Some((blob, marker))) => (CanvasState::from_value(Some(blob))?, marker),
        Ok(None) => (CanvasState::new(), 0),
        Err(easel_store::StoreError::NotFound(_)) => (CanvasState::new(), 0),
        Err(e) => return Err(e),
    };

    let mut cursor = marker;
    loop {
        let batch = store.operations_since(project_id, cursor, 512).await?;
        if batch.is_empty() {
            break;
        }
        for entry in &batch {
            cursor = entry.seq;
            if let Err(e) =
                easel_protocol::apply_operation(&mut canvas, &entry.operation_type, &entry.params)
            {
                // A logged op must have applied once; a replay failure means
                // the snapshot already contains it.
                debug!(project_id, seq = entry.seq, error = %e, "replay skipped op");
            }
        }
    }
    Ok(canvas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(seq: u64) -> OperationEntry {
        OperationEntry {
            seq,
            project_id: 1,
            user_id: 1,
            tab_id: "tab".into(),
            operation_type: "node_move".into(),
            operation_id: format!("op-{seq}"),
            params: json!({"nodeId": 1, "position": [0.0, 0.0]}),
            undo_data: None,
            transaction_id: None,
            created_at: 0,
        }
    }

    fn room_with_ops(capacity: usize, upto: u64) -> Room {
        let room = Room::new(1, CanvasState::new(), 0, capacity);
        for seq in 1..=upto {
            room.record_applied(entry(seq));
        }
        room
    }

    #[test]
    fn ring_serves_gap_within_capacity() {
        let room = room_with_ops(256, 180);
        let ops = room.ring_ops_since(100).expect("gap fits the ring");
        assert_eq!(ops.len(), 80);
        assert_eq!(ops.first().unwrap().seq, 101);
        assert_eq!(ops.last().unwrap().seq, 180);
    }

    #[test]
    fn ring_rejects_gap_beyond_capacity() {
        let room = room_with_ops(256, 900);
        // Oldest retained seq is 645; a client at 10 is beyond the ring.
        assert!(room.ring_ops_since(10).is_none());
        assert!(room.ring_ops_since(644).is_some());
    }

    #[test]
    fn ring_on_empty_room_only_serves_up_to_date_clients() {
        let room = Room::new(1, CanvasState::new(), 5, 256);
        assert!(room.ring_ops_since(5).unwrap().is_empty());
        assert!(room.ring_ops_since(3).is_none());
    }

    #[test]
    fn active_users_groups_tabs_by_user() {
        let room = Room::new(1, CanvasState::new(), 0, 16);
        for (conn, tab) in [(10u64, "A"), (11, "B")] {
            room.add_member(conn, RoomMember {
                user_id: 1,
                username: "alice".into(),
                display_name: "Alice".into(),
                tab_id: tab.into(),
                state: SessionState::Active,
            });
        }
        room.add_member(12, RoomMember {
            user_id: 2,
            username: "bob".into(),
            display_name: "Bob".into(),
            tab_id: "C".into(),
            state: SessionState::Joining,
        });

        let users = room.active_users();
        // Bob is still Joining and not visible yet.
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].tabs.len(), 2);
        assert_eq!(users[0].username, "alice");
    }
}

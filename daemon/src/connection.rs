//! Per-connection reader task
//!
//! Each accepted socket gets a reader (this module) and a writer (the outbox
//! drain). The reader decodes frames in arrival order, dispatches them, and
//! enforces the heartbeat policy; the connection dies on decode of an
//! oversized frame, on outbox overflow, or after three missed heartbeats.

use crate::registry::{ConnectionHandle, Session, SessionState};
use crate::server::ServerContext;
use easel_protocol::{ClientMessage, ProjectInfo, ServerMessage, SessionDescriptor};
use easel_transport::{CodecError, Message, MessageCodec, outbox, spawn_writer, upgrade};
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, ctx: Arc<ServerContext>) {
    let ws = match upgrade(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%addr, error = %e, "websocket upgrade failed");
            return;
        }
    };
    let (sink, mut rx) = ws.split();

    let codec = MessageCodec::new();
    let (outbox, outbox_rx) = outbox(ctx.config.limits.send_queue_depth, codec.clone());
    let mut writer = spawn_writer(outbox_rx, sink);

    let handle = ctx.registry.register(outbox);
    let connection_id = handle.connection_id;
    debug!(%addr, connection_id, "connection open");

    let heartbeat_interval = Duration::from_secs(ctx.config.limits.heartbeat_interval_secs);
    let heartbeat_deadline = heartbeat_interval * ctx.config.limits.heartbeat_max_misses;
    let mut watchdog = tokio::time::interval(heartbeat_interval);
    watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = rx.next() => {
                let message = match message {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        debug!(connection_id, error = %e, "read error");
                        break;
                    }
                    None => break,
                };
                if message.is_close() {
                    break;
                }
                match codec.decode::<ClientMessage>(&message) {
                    Ok(Some(client_message)) => {
                        ctx.metrics.messages_received.inc();
                        dispatch(&ctx, &handle, client_message).await;
                    }
                    Ok(None) => {}
                    Err(CodecError::FrameTooLarge { size, max }) => {
                        warn!(connection_id, size, max, "oversized frame, closing");
                        let _ = handle.outbox.send_raw(Message::Close(None));
                        break;
                    }
                    Err(e) => {
                        debug!(connection_id, error = %e, "undecodable frame");
                    }
                }
            }
            _ = watchdog.tick() => {
                if handle.since_heartbeat() > heartbeat_deadline {
                    info!(connection_id, "heartbeat timeout");
                    let _ = handle.outbox.send_raw(Message::Close(None));
                    break;
                }
            }
            _ = handle.closed.notified() => {
                debug!(connection_id, "connection killed");
                break;
            }
        }
    }

    teardown(&ctx, &handle).await;
    ctx.registry.unregister(connection_id);
    // Dropping the last outbox handle ends the writer once the queue (close
    // frame included) has drained; a peer that stopped reading gets cut off.
    drop(handle);
    if tokio::time::timeout(Duration::from_secs(1), &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    debug!(%addr, connection_id, "connection closed");
}

async fn dispatch(ctx: &Arc<ServerContext>, handle: &Arc<ConnectionHandle>, message: ClientMessage) {
    match message {
        ClientMessage::JoinProject {
            project_id,
            username,
            display_name,
            tab_id,
        } => {
            join_project(ctx, handle, project_id, username, display_name, tab_id).await;
        }
        ClientMessage::LeaveProject { project_id } => {
            leave_project(ctx, handle, Some(project_id)).await;
        }
        ClientMessage::ExecuteOperation {
            operation_id,
            operation_type,
            params,
            state_version,
            undo_data: _,
            transaction_id,
        } => {
            ctx.pipeline
                .execute(handle.connection_id, crate::pipeline::ExecuteRequest {
                    operation_id,
                    operation_type,
                    params,
                    state_version,
                    transaction_id,
                })
                .await;
        }
        ClientMessage::SyncCheck {
            project_id,
            last_seq,
            state_hash: _,
        } => {
            ctx.sync.sync_check(handle.connection_id, project_id, last_seq).await;
        }
        ClientMessage::RequestFullSync { project_id } => {
            ctx.sync.full_sync(handle.connection_id, project_id).await;
        }
        ClientMessage::Heartbeat { timestamp: _, project_id: _ } => {
            handle.touch();
            if let Err(e) = ctx.store.touch_session(handle.connection_id).await {
                debug!(error = %e, "session touch failed");
            }
            ctx.registry.send_to(
                handle.connection_id,
                &ServerMessage::HeartbeatResponse {
                    timestamp: chrono::Utc::now().timestamp_millis() as u64,
                },
            );
        }
    }
}

async fn join_project(
    ctx: &Arc<ServerContext>,
    handle: &Arc<ConnectionHandle>,
    project_id: i64,
    username: String,
    display_name: String,
    tab_id: String,
) {
    // Switching projects is Leave(old) then Join(new); in between the
    // connection is a member of nothing and hears no old-project frames.
    if let Some(existing) = handle.session() {
        if existing.project_id != project_id {
            leave_project(ctx, handle, None).await;
        } else {
            debug!(connection_id = handle.connection_id, "re-join of same project");
            leave_project(ctx, handle, None).await;
        }
    }

    let user = match ctx.store.upsert_user(&username, &display_name).await {
        Ok(user) => user,
        Err(e) => {
            warn!(error = %e, "join failed creating user");
            return;
        }
    };

    // First join creates the project.
    let project = match ctx
        .store
        .ensure_project(project_id, "Untitled Canvas", user.id)
        .await
    {
        Ok(project) => project,
        Err(e) => {
            warn!(error = %e, "join failed resolving project");
            return;
        }
    };
    if let Err(e) = ctx.store.add_collaborator(project.id, user.id).await {
        debug!(error = %e, "collaborator insert failed");
    }

    let room = match ctx.rooms.get_or_create(project_id).await {
        Ok(room) => room,
        Err(e) => {
            warn!(project_id, error = %e, "join failed hydrating room");
            return;
        }
    };

    let joined_at = chrono::Utc::now().timestamp_millis();
    let session = Session {
        connection_id: handle.connection_id,
        user_id: user.id,
        username: user.username.clone(),
        display_name: user.display_name.clone(),
        project_id,
        tab_id: tab_id.clone(),
        joined_at,
        state: SessionState::Joining,
    };
    handle.set_session(session.clone());

    if let Err(e) = ctx
        .store
        .upsert_session(handle.connection_id, user.id, project_id, &tab_id)
        .await
    {
        debug!(error = %e, "session row upsert failed");
    }

    ctx.registry.send_to(
        handle.connection_id,
        &ServerMessage::ProjectJoined {
            project: ProjectInfo {
                id: project.id,
                name: project.name,
                owner_id: project.owner_id,
                description: project.description,
                last_modified: project.last_modified,
            },
            session: SessionDescriptor {
                connection_id: handle.connection_id,
                user_id: user.id,
                project_id,
                tab_id: tab_id.clone(),
                joined_at,
            },
            sequence_number: room.seq(),
        },
    );

    handle.set_state(SessionState::Active);
    let mut active = session;
    active.state = SessionState::Active;
    ctx.rooms.admit(&room, &active).await;

    info!(
        connection_id = handle.connection_id,
        project_id,
        user = %active.username,
        tab = %active.tab_id,
        "session joined"
    );
}

async fn leave_project(
    ctx: &Arc<ServerContext>,
    handle: &Arc<ConnectionHandle>,
    expected_project: Option<i64>,
) {
    let Some(session) = handle.session() else {
        return;
    };
    if let Some(project_id) = expected_project {
        if session.project_id != project_id {
            debug!(
                connection_id = handle.connection_id,
                "leave for a project the session is not in"
            );
            return;
        }
    }

    handle.set_state(SessionState::Leaving);
    if let Some(room) = ctx.rooms.get(session.project_id) {
        ctx.rooms.leave(&room, handle.connection_id).await;
    }
    handle.clear_session();
    if let Err(e) = ctx.store.remove_session(handle.connection_id).await {
        debug!(error = %e, "session row removal failed");
    }
    info!(
        connection_id = handle.connection_id,
        project_id = session.project_id,
        "session left"
    );
}

async fn teardown(ctx: &Arc<ServerContext>, handle: &Arc<ConnectionHandle>) {
    leave_project(ctx, handle, None).await;
}

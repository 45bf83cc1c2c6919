//! Service wiring and lifecycle
//!
//! `start` builds the full service graph (store, media registry, session
//! registry, rooms, pipeline, sync) and spawns the listeners. The returned
//! handle reports the actually-bound addresses (port 0 friendly) and drives
//! graceful shutdown: stop accepting, snapshot live rooms, checkpoint, close.

use crate::config::DaemonConfig;
use crate::metrics::Metrics;
use crate::pipeline::OperationPipeline;
use crate::registry::SessionRegistry;
use crate::room::RoomManager;
use crate::sync::SyncService;
use anyhow::{Context, Result};
use easel_media::{
    MediaEvent, MediaEventPayload, MediaEventReceiver, MediaRegistry, TranscodeEvent,
    media_event_channel,
};
use easel_protocol::ServerMessage;
use easel_store::Store;
use easel_transport::{Dispatcher, WsServer, WsServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shared service graph handed to every connection and HTTP handler.
pub struct ServerContext {
    pub config: DaemonConfig,
    pub store: Store,
    pub media: MediaRegistry,
    pub registry: Arc<SessionRegistry>,
    pub rooms: Arc<RoomManager>,
    pub pipeline: Arc<OperationPipeline>,
    pub sync: Arc<SyncService>,
    pub metrics: Arc<Metrics>,
}

pub struct ServerHandle {
    pub ws_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub ctx: Arc<ServerContext>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Graceful shutdown: stop listeners, snapshot rooms, checkpoint, close.
    pub async fn shutdown(mut self) {
        info!("shutting down");
        let _ = self.shutdown.send(true);
        // Give the HTTP server and outboxes a moment to drain.
        tokio::time::sleep(Duration::from_millis(100)).await;

        self.ctx.rooms.persist_all().await;
        self.ctx.store.close().await;

        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("shutdown complete");
    }
}

pub async fn start(config: DaemonConfig) -> Result<ServerHandle> {
    if let Some(parent) = PathBuf::from(&config.storage.database_path).parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    let store = Store::open(&config.storage.database_path)
        .await
        .context("opening store")?;

    let (media_tx, media_rx) = media_event_channel(256);
    let media = MediaRegistry::new(
        PathBuf::from(&config.storage.media_dir),
        PathBuf::from(&config.storage.thumbnail_dir),
        store.clone(),
        media_tx,
    )
    .await
    .context("initializing media registry")?;

    let metrics = Arc::new(Metrics::new());
    let registry = SessionRegistry::new(metrics.clone());
    let rooms = RoomManager::new(
        store.clone(),
        registry.clone() as Arc<dyn Dispatcher>,
        metrics.clone(),
        config.limits.ring_capacity,
        config.storage.snapshot_interval_ops,
    );
    let pipeline = OperationPipeline::new(
        store.clone(),
        registry.clone(),
        rooms.clone(),
        metrics.clone(),
        Duration::from_secs(config.limits.dedup_ttl_secs),
    );
    let sync = SyncService::new(store.clone(), rooms.clone(), registry.clone());

    let ctx = Arc::new(ServerContext {
        config: config.clone(),
        store,
        media,
        registry,
        rooms,
        pipeline,
        sync,
        metrics,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    // Collaboration listener
    let ws_server = WsServer::bind(WsServerConfig {
        bind: config.server.bind,
        max_connections: config.server.max_connections,
    })
    .await
    .context("binding collaboration listener")?;
    let ws_addr = ws_server.local_addr()?;

    {
        let ctx = ctx.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = ws_server.accept() => {
                        let (stream, addr) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                                continue;
                            }
                        };
                        if ctx.registry.count() >= ws_server.max_connections() {
                            warn!(%addr, "connection limit reached, refusing");
                            continue;
                        }
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            crate::connection::handle_connection(stream, addr, ctx).await;
                        });
                    }
                }
            }
        }));
    }

    // HTTP API
    let http_listener = tokio::net::TcpListener::bind(config.server.http_bind)
        .await
        .context("binding http listener")?;
    let http_addr = http_listener.local_addr()?;
    info!("http api listening on {http_addr}");

    {
        let app = crate::http::router(ctx.clone());
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let served = axum::serve(http_listener, app).with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            });
            if let Err(e) = served.await {
                warn!(error = %e, "http server error");
            }
        }));
    }

    // Media event forwarder
    {
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(forward_media_events(ctx, media_rx)));
    }

    // Dedup cache sweeper
    {
        let ctx = ctx.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => ctx.pipeline.sweep_dedup(),
                }
            }
        }));
    }

    // Prometheus exporter
    tasks.push(crate::metrics::start_server(&config.monitoring));

    info!(%ws_addr, %http_addr, "easel daemon ready");
    Ok(ServerHandle {
        ws_addr,
        http_addr,
        ctx,
        shutdown: shutdown_tx,
        tasks,
    })
}

/// Turn media events into room broadcasts.
async fn forward_media_events(ctx: Arc<ServerContext>, mut rx: MediaEventReceiver) {
    while let Some(MediaEvent {
        project_id,
        payload,
    }) = rx.recv().await
    {
        let Some(project_id) = project_id else {
            debug!("media event without project, nothing to notify");
            continue;
        };
        let Some(room) = ctx.rooms.get(project_id) else {
            debug!(project_id, "media event for idle project");
            continue;
        };

        let message = match payload {
            MediaEventPayload::Ready {
                hash,
                urls,
                formats,
            } => ServerMessage::MediaReady {
                hash,
                urls,
                formats,
            },
            MediaEventPayload::Transcode(event) => match event {
                TranscodeEvent::Queued { filename } => {
                    ServerMessage::VideoProcessingQueued { filename }
                }
                TranscodeEvent::Start { filename } => {
                    ServerMessage::VideoProcessingStart { filename }
                }
                TranscodeEvent::Progress { filename, percent } => {
                    ServerMessage::VideoProcessingProgress { filename, percent }
                }
                TranscodeEvent::Complete { filename, formats } => {
                    ServerMessage::VideoProcessingComplete {
                        filename,
                        formats: Some(formats),
                        error: None,
                    }
                }
                TranscodeEvent::Failed { filename, error } => {
                    ServerMessage::VideoProcessingComplete {
                        filename,
                        formats: None,
                        error: Some(error),
                    }
                }
            },
        };
        ctx.rooms.broadcast_all(&room, &message).await;
    }
}

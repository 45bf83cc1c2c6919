//! Prometheus metrics
//!
//! Counters, gauges and histograms for the collaboration core, exported in
//! the text format on a dedicated port through the same axum stack the HTTP
//! API uses.

use crate::config::MonitoringConfig;
use axum::Router;
use axum::routing::get;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::sync::LazyLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Global metrics registry
static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Metrics struct
pub struct Metrics {
    // Counters
    pub operations_accepted: IntCounter,
    pub operations_rejected: IntCounter,
    pub messages_sent: IntCounter,
    pub messages_received: IntCounter,
    pub outbox_overflows: IntCounter,
    pub ingest_bytes: IntCounter,

    // Gauges
    pub active_connections: IntGauge,
    pub active_rooms: IntGauge,

    // Histograms
    pub operation_duration: Histogram,
    pub operation_payload_size: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let operations_accepted = IntCounter::with_opts(Opts::new(
            "easel_operations_accepted_total",
            "Operations sequenced and persisted",
        ))
        .unwrap();

        let operations_rejected = IntCounter::with_opts(Opts::new(
            "easel_operations_rejected_total",
            "Operations refused before sequencing",
        ))
        .unwrap();

        let messages_sent = IntCounter::with_opts(Opts::new(
            "easel_messages_sent_total",
            "Server frames queued to connections",
        ))
        .unwrap();

        let messages_received = IntCounter::with_opts(Opts::new(
            "easel_messages_received_total",
            "Client frames decoded",
        ))
        .unwrap();

        let outbox_overflows = IntCounter::with_opts(Opts::new(
            "easel_outbox_overflows_total",
            "Connections closed for send-queue overflow",
        ))
        .unwrap();

        let ingest_bytes = IntCounter::with_opts(Opts::new(
            "easel_ingest_bytes_total",
            "Bytes accepted by the media registry",
        ))
        .unwrap();

        let active_connections = IntGauge::with_opts(Opts::new(
            "easel_active_connections",
            "Currently open WebSocket connections",
        ))
        .unwrap();

        let active_rooms = IntGauge::with_opts(Opts::new(
            "easel_active_rooms",
            "Rooms with at least one session",
        ))
        .unwrap();

        let operation_duration = Histogram::with_opts(HistogramOpts::new(
            "easel_operation_duration_seconds",
            "Validate+sequence+persist time per operation",
        ))
        .unwrap();

        let operation_payload_size = Histogram::with_opts(
            HistogramOpts::new(
                "easel_operation_payload_bytes",
                "Serialized operation params size",
            )
            .buckets(vec![64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0]),
        )
        .unwrap();

        // Register metrics
        REGISTRY.register(Box::new(operations_accepted.clone())).ok();
        REGISTRY.register(Box::new(operations_rejected.clone())).ok();
        REGISTRY.register(Box::new(messages_sent.clone())).ok();
        REGISTRY.register(Box::new(messages_received.clone())).ok();
        REGISTRY.register(Box::new(outbox_overflows.clone())).ok();
        REGISTRY.register(Box::new(ingest_bytes.clone())).ok();
        REGISTRY.register(Box::new(active_connections.clone())).ok();
        REGISTRY.register(Box::new(active_rooms.clone())).ok();
        REGISTRY.register(Box::new(operation_duration.clone())).ok();
        REGISTRY.register(Box::new(operation_payload_size.clone())).ok();

        Self {
            operations_accepted,
            operations_rejected,
            messages_sent,
            messages_received,
            outbox_overflows,
            ingest_bytes,
            active_connections,
            active_rooms,
            operation_duration,
            operation_payload_size,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Render the registry in the Prometheus text exposition format.
pub fn render() -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut out = String::new();
    if let Err(e) = encoder.encode_utf8(&REGISTRY.gather(), &mut out) {
        warn!(error = %e, "metrics rendering failed");
    }
    out
}

/// Spawn the exporter on its own port.
pub fn start_server(config: &MonitoringConfig) -> JoinHandle<()> {
    let bind = config.prometheus_bind;
    let enabled = config.prometheus_enabled;

    tokio::spawn(async move {
        if !enabled {
            debug!("metrics exporter is off");
            return;
        }

        let app = Router::new().route("/metrics", get(|| async { render() }));
        let listener = match tokio::net::TcpListener::bind(bind).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(%bind, error = %e, "metrics exporter could not bind");
                return;
            }
        };

        info!(%bind, "metrics exporter up");
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "metrics exporter stopped");
        }
    })
}

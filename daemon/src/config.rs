//! Daemon configuration

use anyhow::Result;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Protocol limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl DaemonConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            limits: LimitsConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Collaboration (WebSocket) bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// HTTP API bind address (uploads, projects, operational endpoints)
    #[serde(default = "default_http_bind")]
    pub http_bind: SocketAddr,

    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_bind() -> SocketAddr {
    "0.0.0.0:9220".parse().unwrap()
}

fn default_http_bind() -> SocketAddr {
    "0.0.0.0:9221".parse().unwrap()
}

fn default_max_connections() -> usize {
    10000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            http_bind: default_http_bind(),
            max_connections: default_max_connections(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Directory for uploaded blobs
    #[serde(default = "default_media_dir")]
    pub media_dir: String,

    /// Directory for derived thumbnails
    #[serde(default = "default_thumbnail_dir")]
    pub thumbnail_dir: String,

    /// Persist a canvas snapshot every N appended operations
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_ops: u64,
}

fn default_database_path() -> String {
    "/var/lib/easel/easel.db".to_string()
}

fn default_media_dir() -> String {
    "/var/lib/easel/uploads".to_string()
}

fn default_thumbnail_dir() -> String {
    "/var/lib/easel/thumbnails".to_string()
}

fn default_snapshot_interval() -> u64 {
    100
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            media_dir: default_media_dir(),
            thumbnail_dir: default_thumbnail_dir(),
            snapshot_interval_ops: default_snapshot_interval(),
        }
    }
}

/// Protocol limits
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Recent-ops ring capacity per room
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    /// Seconds an operation id stays in the dedup cache
    #[serde(default = "default_dedup_ttl")]
    pub dedup_ttl_secs: u64,

    /// Per-connection outbox depth; overflow closes the connection
    #[serde(default = "default_send_queue_depth")]
    pub send_queue_depth: usize,

    /// Expected client heartbeat interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Missed heartbeats before the session is terminated
    #[serde(default = "default_heartbeat_misses")]
    pub heartbeat_max_misses: u32,
}

fn default_ring_capacity() -> usize {
    256
}

fn default_dedup_ttl() -> u64 {
    60
}

fn default_send_queue_depth() -> usize {
    256
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_heartbeat_misses() -> u32 {
    3
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            ring_capacity: default_ring_capacity(),
            dedup_ttl_secs: default_dedup_ttl(),
            send_queue_depth: default_send_queue_depth(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_max_misses: default_heartbeat_misses(),
        }
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// Prometheus metrics bind address
    #[serde(default = "default_prometheus_bind")]
    pub prometheus_bind: SocketAddr,

    /// Enable Prometheus
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,
}

fn default_prometheus_bind() -> SocketAddr {
    "0.0.0.0:9290".parse().unwrap()
}

fn default_true() -> bool {
    true
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus_bind: default_prometheus_bind(),
            prometheus_enabled: default_true(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [server]
            bind = "127.0.0.1:4000"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(config.limits.ring_capacity, 256);
        assert_eq!(config.limits.heartbeat_max_misses, 3);
        assert_eq!(config.storage.snapshot_interval_ops, 100);
    }
}

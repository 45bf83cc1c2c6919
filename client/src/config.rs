//! Client configuration

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

/// Client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Server WebSocket endpoint
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Username presented on join (created server-side on first use)
    #[serde(default = "default_username")]
    pub username: String,

    /// Display name shown to peers
    #[serde(default)]
    pub display_name: Option<String>,

    /// Project to join
    #[serde(default = "default_project")]
    pub project_id: i64,

    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
}

fn default_endpoint() -> String {
    "ws://127.0.0.1:9220".to_string()
}

fn default_username() -> String {
    whoami()
}

fn default_project() -> i64 {
    1
}

fn default_heartbeat() -> u64 {
    10
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "easel-user".to_string())
}

impl ClientConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: ClientConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            username: default_username(),
            display_name: None,
            project_id: default_project(),
            heartbeat_secs: default_heartbeat(),
        }
    }
}

//! Canvas node record

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of element placed on the canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Image,
    Video,
    Text,
    Group,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Image => "image",
            NodeType::Video => "video",
            NodeType::Text => "text",
            NodeType::Group => "group",
        }
    }
}

/// A positioned, sized, possibly rotated element on the canvas.
///
/// Media nodes never carry bytes; their `properties` hold
/// `{hash, serverFilename, filename}` references into the media
/// registry, resolved by the client over HTTP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: u64,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub pos: [f64; 2],
    pub size: [f64; 2],
    #[serde(default)]
    pub rotation: f64,
    #[serde(default)]
    pub aspect_ratio: f64,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flags: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl Node {
    /// Aspect ratio implied by the current size (1.0 for degenerate heights).
    pub fn computed_aspect_ratio(&self) -> f64 {
        aspect_ratio_of(self.size)
    }
}

/// width / height, defaulting to 1.0 when the height is zero or not finite
pub fn aspect_ratio_of(size: [f64; 2]) -> f64 {
    if size[1].abs() > f64::EPSILON && size[0].is_finite() && size[1].is_finite() {
        size[0] / size[1]
    } else {
        1.0
    }
}

//! Canvas state - the node graph of a project
//!
//! Nodes live in an arena keyed by id; everything else refers to them by id
//! and resolves through the arena. `layer_order` is the paint order and is
//! always a permutation of the arena keys.

use crate::node::Node;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// In-memory node graph of one project.
///
/// This is the value that gets serialized into the project's canvas blob.
/// `navigation` is an opaque passthrough section owned by the HTTP
/// navigation-state endpoint; operations never touch it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasState {
    #[serde(default)]
    pub nodes: BTreeMap<u64, Node>,
    #[serde(default)]
    pub layer_order: Vec<u64>,
    #[serde(default = "first_node_id")]
    pub next_node_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub navigation: Option<serde_json::Value>,
}

fn first_node_id() -> u64 {
    1
}

impl Default for CanvasState {
    fn default() -> Self {
        Self {
            nodes: BTreeMap::new(),
            layer_order: Vec::new(),
            next_node_id: 1,
            navigation: None,
        }
    }
}

impl CanvasState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next authoritative node id. Monotonic per project.
    pub fn allocate_node_id(&mut self) -> u64 {
        let id = self.next_node_id;
        self.next_node_id += 1;
        id
    }

    /// Insert a node at the top of the paint order.
    ///
    /// The node id must already be allocated; re-inserting an existing id
    /// replaces the node but keeps its layer position.
    pub fn insert_node(&mut self, node: Node) {
        let id = node.id;
        if self.nodes.insert(id, node).is_none() {
            self.layer_order.push(id);
        }
        if self.next_node_id <= id {
            self.next_node_id = id + 1;
        }
    }

    /// Remove a node, returning it if present.
    pub fn remove_node(&mut self, id: u64) -> Option<Node> {
        let node = self.nodes.remove(&id)?;
        self.layer_order.retain(|n| *n != id);
        Some(node)
    }

    pub fn get(&self, id: u64) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Serialize into the snapshot blob representation.
    pub fn to_value(&self) -> serde_json::Value {
        // A canvas is always representable as JSON; the maps are
        // string-keyed after serde's u64 key conversion.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Rebuild from a snapshot blob. `None`/`null` means an empty canvas.
    pub fn from_value(value: Option<serde_json::Value>) -> Result<Self, serde_json::Error> {
        match value {
            None | Some(serde_json::Value::Null) => Ok(Self::new()),
            Some(v) => serde_json::from_value(v),
        }
    }

    /// Hashes of all media blobs referenced by any node.
    pub fn referenced_hashes(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter_map(|n| n.properties.get("hash"))
            .filter_map(|v| v.as_str())
            .map(str::to_owned)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeType;

    fn node(id: u64) -> Node {
        Node {
            id,
            node_type: NodeType::Text,
            pos: [0.0, 0.0],
            size: [100.0, 50.0],
            rotation: 0.0,
            aspect_ratio: 2.0,
            title: String::new(),
            flags: Default::default(),
            properties: Default::default(),
        }
    }

    #[test]
    fn insert_tracks_layer_order_and_next_id() {
        let mut canvas = CanvasState::new();
        let a = canvas.allocate_node_id();
        canvas.insert_node(node(a));
        let b = canvas.allocate_node_id();
        canvas.insert_node(node(b));

        assert_eq!(canvas.layer_order, vec![a, b]);
        assert_eq!(canvas.next_node_id, 3);

        canvas.remove_node(a);
        assert_eq!(canvas.layer_order, vec![b]);
        // ids are never reused
        assert_eq!(canvas.allocate_node_id(), 3);
    }

    #[test]
    fn snapshot_roundtrip_preserves_state() {
        let mut canvas = CanvasState::new();
        let id = canvas.allocate_node_id();
        canvas.insert_node(node(id));
        canvas.navigation = Some(serde_json::json!({"scale": 1.5}));

        let blob = canvas.to_value();
        let restored = CanvasState::from_value(Some(blob)).unwrap();
        assert_eq!(restored, canvas);
    }

    #[test]
    fn empty_blob_is_empty_canvas() {
        let canvas = CanvasState::from_value(None).unwrap();
        assert_eq!(canvas.node_count(), 0);
        assert_eq!(canvas.next_node_id, 1);
    }
}

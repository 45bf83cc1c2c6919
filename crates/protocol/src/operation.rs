//! The registered operation set
//!
//! Every mutation of a project's node graph is one of the operations defined
//! here. Each kind carries a (validate, apply, undo) triple: `validate` checks
//! references and parameter shapes against the current canvas, `apply` mutates
//! the canvas and produces the delta broadcast to peers, and the returned
//! `UndoData` restores the exact pre-operation state when applied through
//! [`apply_undo`].
//!
//! The same code runs on the server (authoritative apply inside the project
//! lane) and in the reference client (optimistic apply before the ack).

use crate::canvas::CanvasState;
use crate::node::{Node, NodeType, aspect_ratio_of};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Tolerance when reconciling a client-declared aspect ratio with the one
/// implied by the new size.
pub const ASPECT_RATIO_TOLERANCE: f64 = 1e-3;

#[derive(Error, Debug)]
pub enum OperationError {
    #[error("unknown operation type: {0}")]
    UnknownType(String),

    #[error("invalid parameters: {0}")]
    Invalid(String),

    #[error("node {0} not found")]
    NodeNotFound(u64),

    #[error("operation payload embeds inline media")]
    InlineMedia,

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("transactions cannot nest")]
    NestedTransaction,
}

/// Registered operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    NodeCreate,
    NodeDelete,
    NodeMove,
    NodeResize,
    NodeRotate,
    NodePropertyUpdate,
    NodeBatchPropertyUpdate,
    LayerOrderChange,
    Transaction,
}

impl OperationKind {
    pub fn parse(s: &str) -> Result<Self, OperationError> {
        match s {
            "node_create" => Ok(Self::NodeCreate),
            "node_delete" => Ok(Self::NodeDelete),
            "node_move" => Ok(Self::NodeMove),
            "node_resize" => Ok(Self::NodeResize),
            "node_rotate" => Ok(Self::NodeRotate),
            "node_property_update" => Ok(Self::NodePropertyUpdate),
            "node_batch_property_update" => Ok(Self::NodeBatchPropertyUpdate),
            "layer_order_change" => Ok(Self::LayerOrderChange),
            "transaction" => Ok(Self::Transaction),
            other => Err(OperationError::UnknownType(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NodeCreate => "node_create",
            Self::NodeDelete => "node_delete",
            Self::NodeMove => "node_move",
            Self::NodeResize => "node_resize",
            Self::NodeRotate => "node_rotate",
            Self::NodePropertyUpdate => "node_property_update",
            Self::NodeBatchPropertyUpdate => "node_batch_property_update",
            Self::LayerOrderChange => "layer_order_change",
            Self::Transaction => "transaction",
        }
    }
}

/// Node-graph delta produced by an accepted operation, broadcast to peers
/// inside `state_update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChanges {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<Node>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updated: Vec<Node>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_order: Option<Vec<u64>>,
}

impl StateChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.layer_order.is_none()
    }

    pub fn merge(&mut self, other: StateChanges) {
        self.added.extend(other.added);
        self.updated.extend(other.updated);
        self.removed.extend(other.removed);
        if other.layer_order.is_some() {
            self.layer_order = other.layer_order;
        }
    }
}

/// Result of applying one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    pub changes: StateChanges,
    pub undo: UndoData,
    /// temp client id -> authoritative node id (node_create only)
    pub assigned_ids: BTreeMap<String, u64>,
}

/// Server-generated undo descriptor. Applying it through [`apply_undo`]
/// restores the canvas to its exact pre-operation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UndoData {
    #[serde(rename_all = "camelCase")]
    RemoveNodes { node_ids: Vec<u64> },
    #[serde(rename_all = "camelCase")]
    RestoreNodes {
        nodes: Vec<Node>,
        layer_order: Vec<u64>,
    },
    #[serde(rename_all = "camelCase")]
    RestorePositions { positions: BTreeMap<u64, [f64; 2]> },
    #[serde(rename_all = "camelCase")]
    RestoreSizes { sizes: BTreeMap<u64, SizeRestore> },
    #[serde(rename_all = "camelCase")]
    RestoreRotations { rotations: BTreeMap<u64, f64> },
    #[serde(rename_all = "camelCase")]
    RestoreProperties {
        node_id: u64,
        previous: BTreeMap<String, Option<Value>>,
    },
    #[serde(rename_all = "camelCase")]
    RestoreBatch { inverses: Vec<PropertyRestore> },
    #[serde(rename_all = "camelCase")]
    RestoreLayerOrder { previous_order: Vec<u64> },
    #[serde(rename_all = "camelCase")]
    Compound { children: Vec<UndoData> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeRestore {
    pub size: [f64; 2],
    pub aspect_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyRestore {
    pub node_id: u64,
    pub property: String,
    /// `None` means the property did not exist before the operation.
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCreateParams {
    /// Client-generated temporary id, replaced by the authoritative id in
    /// the ack's `assignedIds` map.
    #[serde(default, rename = "id", skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub pos: [f64; 2],
    pub size: [f64; 2],
    #[serde(default)]
    pub rotation: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flags: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDeleteParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_ids: Vec<u64>,
}

impl NodeDeleteParams {
    fn targets(&self) -> Vec<u64> {
        let mut ids = self.node_ids.clone();
        if let Some(id) = self.node_id {
            ids.push(id);
        }
        ids.dedup();
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMoveParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_ids: Vec<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub positions: Vec<[f64; 2]>,
}

impl NodeMoveParams {
    fn entries(&self) -> Result<Vec<(u64, [f64; 2])>, OperationError> {
        match (self.node_id, self.position) {
            (Some(id), Some(pos)) => Ok(vec![(id, pos)]),
            (None, None) if !self.node_ids.is_empty() => {
                if self.node_ids.len() != self.positions.len() {
                    return Err(OperationError::Invalid(
                        "nodeIds and positions length mismatch".into(),
                    ));
                }
                Ok(self.node_ids.iter().copied().zip(self.positions.iter().copied()).collect())
            }
            _ => Err(OperationError::Invalid(
                "expected nodeId+position or nodeIds+positions".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResizeParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_ids: Vec<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sizes: Vec<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aspect_ratios: Vec<f64>,
}

impl NodeResizeParams {
    fn entries(&self) -> Result<Vec<(u64, [f64; 2], Option<f64>)>, OperationError> {
        match (self.node_id, self.size) {
            (Some(id), Some(size)) => Ok(vec![(id, size, self.aspect_ratio)]),
            (None, None) if !self.node_ids.is_empty() => {
                if self.node_ids.len() != self.sizes.len() {
                    return Err(OperationError::Invalid(
                        "nodeIds and sizes length mismatch".into(),
                    ));
                }
                if !self.aspect_ratios.is_empty() && self.aspect_ratios.len() != self.node_ids.len()
                {
                    return Err(OperationError::Invalid(
                        "aspectRatios length mismatch".into(),
                    ));
                }
                Ok(self
                    .node_ids
                    .iter()
                    .enumerate()
                    .map(|(i, id)| (*id, self.sizes[i], self.aspect_ratios.get(i).copied()))
                    .collect())
            }
            _ => Err(OperationError::Invalid(
                "expected nodeId+size or nodeIds+sizes".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRotateParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_ids: Vec<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rotations: Vec<f64>,
}

impl NodeRotateParams {
    fn entries(&self) -> Result<Vec<(u64, f64)>, OperationError> {
        match (self.node_id, self.rotation) {
            (Some(id), Some(rot)) => Ok(vec![(id, rot)]),
            (None, None) if !self.node_ids.is_empty() => {
                if self.node_ids.len() != self.rotations.len() {
                    return Err(OperationError::Invalid(
                        "nodeIds and rotations length mismatch".into(),
                    ));
                }
                Ok(self.node_ids.iter().copied().zip(self.rotations.iter().copied()).collect())
            }
            _ => Err(OperationError::Invalid(
                "expected nodeId+rotation or nodeIds+rotations".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePropertyUpdateParams {
    pub node_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, Value>>,
}

impl NodePropertyUpdateParams {
    fn updates(&self) -> Result<BTreeMap<String, Value>, OperationError> {
        if let Some(map) = &self.properties {
            if map.is_empty() {
                return Err(OperationError::Invalid("empty properties map".into()));
            }
            return Ok(map.clone());
        }
        match (&self.property, &self.value) {
            (Some(key), Some(value)) if !key.is_empty() => {
                let mut map = BTreeMap::new();
                map.insert(key.clone(), value.clone());
                Ok(map)
            }
            _ => Err(OperationError::Invalid(
                "expected property+value or properties".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyUpdateEntry {
    pub node_id: u64,
    pub property: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeBatchPropertyUpdateParams {
    pub updates: Vec<PropertyUpdateEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerOrderChangeParams {
    pub new_layer_order: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildOperation {
    #[serde(rename = "type", alias = "operationType")]
    pub operation_type: String,
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub operations: Vec<ChildOperation>,
}

impl TransactionParams {
    /// Parse all children up front. Nested transactions are refused.
    pub fn parse_children(&self) -> Result<Vec<(OperationKind, OperationParams)>, OperationError> {
        if self.operations.is_empty() {
            return Err(OperationError::Invalid("empty transaction".into()));
        }
        self.operations
            .iter()
            .map(|child| {
                let kind = OperationKind::parse(&child.operation_type)?;
                if kind == OperationKind::Transaction {
                    return Err(OperationError::NestedTransaction);
                }
                let op = OperationParams::parse(kind, &child.params)?;
                Ok((kind, op))
            })
            .collect()
    }
}

/// A parsed, typed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationParams {
    NodeCreate(NodeCreateParams),
    NodeDelete(NodeDeleteParams),
    NodeMove(NodeMoveParams),
    NodeResize(NodeResizeParams),
    NodeRotate(NodeRotateParams),
    NodePropertyUpdate(NodePropertyUpdateParams),
    NodeBatchPropertyUpdate(NodeBatchPropertyUpdateParams),
    LayerOrderChange(LayerOrderChangeParams),
    Transaction(TransactionParams),
}

fn invalid(e: serde_json::Error) -> OperationError {
    OperationError::Invalid(e.to_string())
}

fn finite2(v: [f64; 2]) -> bool {
    v[0].is_finite() && v[1].is_finite()
}

impl OperationParams {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::NodeCreate(_) => OperationKind::NodeCreate,
            Self::NodeDelete(_) => OperationKind::NodeDelete,
            Self::NodeMove(_) => OperationKind::NodeMove,
            Self::NodeResize(_) => OperationKind::NodeResize,
            Self::NodeRotate(_) => OperationKind::NodeRotate,
            Self::NodePropertyUpdate(_) => OperationKind::NodePropertyUpdate,
            Self::NodeBatchPropertyUpdate(_) => OperationKind::NodeBatchPropertyUpdate,
            Self::LayerOrderChange(_) => OperationKind::LayerOrderChange,
            Self::Transaction(_) => OperationKind::Transaction,
        }
    }

    pub fn parse(kind: OperationKind, params: &Value) -> Result<Self, OperationError> {
        let params = params.clone();
        Ok(match kind {
            OperationKind::NodeCreate => {
                Self::NodeCreate(serde_json::from_value(params).map_err(invalid)?)
            }
            OperationKind::NodeDelete => {
                Self::NodeDelete(serde_json::from_value(params).map_err(invalid)?)
            }
            OperationKind::NodeMove => {
                Self::NodeMove(serde_json::from_value(params).map_err(invalid)?)
            }
            OperationKind::NodeResize => {
                Self::NodeResize(serde_json::from_value(params).map_err(invalid)?)
            }
            OperationKind::NodeRotate => {
                Self::NodeRotate(serde_json::from_value(params).map_err(invalid)?)
            }
            OperationKind::NodePropertyUpdate => {
                Self::NodePropertyUpdate(serde_json::from_value(params).map_err(invalid)?)
            }
            OperationKind::NodeBatchPropertyUpdate => {
                Self::NodeBatchPropertyUpdate(serde_json::from_value(params).map_err(invalid)?)
            }
            OperationKind::LayerOrderChange => {
                Self::LayerOrderChange(serde_json::from_value(params).map_err(invalid)?)
            }
            OperationKind::Transaction => {
                Self::Transaction(serde_json::from_value(params).map_err(invalid)?)
            }
        })
    }

    /// Check references and parameter shapes against the current canvas.
    /// A successful validation guarantees that `apply` will not fail for
    /// every kind except `Transaction`, whose children validate against the
    /// evolving state during apply.
    pub fn validate(&self, canvas: &CanvasState) -> Result<(), OperationError> {
        match self {
            Self::NodeCreate(p) => {
                if !finite2(p.pos) || !finite2(p.size) {
                    return Err(OperationError::Invalid("non-finite pos or size".into()));
                }
                if p.size[0] <= 0.0 || p.size[1] <= 0.0 {
                    return Err(OperationError::Invalid("size must be positive".into()));
                }
                if !p.rotation.is_finite() {
                    return Err(OperationError::Invalid("non-finite rotation".into()));
                }
                if p.temp_id.as_deref() == Some("") {
                    return Err(OperationError::Invalid("empty temp id".into()));
                }
                Ok(())
            }
            Self::NodeDelete(_) => Ok(()),
            Self::NodeMove(p) => {
                for (id, pos) in p.entries()? {
                    if !canvas.contains(id) {
                        return Err(OperationError::NodeNotFound(id));
                    }
                    if !finite2(pos) {
                        return Err(OperationError::Invalid("non-finite position".into()));
                    }
                }
                Ok(())
            }
            Self::NodeResize(p) => {
                for (id, size, _) in p.entries()? {
                    if !canvas.contains(id) {
                        return Err(OperationError::NodeNotFound(id));
                    }
                    if !finite2(size) || size[0] <= 0.0 || size[1] <= 0.0 {
                        return Err(OperationError::Invalid("invalid size".into()));
                    }
                }
                Ok(())
            }
            Self::NodeRotate(p) => {
                for (id, rot) in p.entries()? {
                    if !canvas.contains(id) {
                        return Err(OperationError::NodeNotFound(id));
                    }
                    if !rot.is_finite() {
                        return Err(OperationError::Invalid("non-finite rotation".into()));
                    }
                }
                Ok(())
            }
            Self::NodePropertyUpdate(p) => {
                if !canvas.contains(p.node_id) {
                    return Err(OperationError::NodeNotFound(p.node_id));
                }
                let updates = p.updates()?;
                validate_property_updates(updates.iter().map(|(k, v)| (k.as_str(), v)))
            }
            Self::NodeBatchPropertyUpdate(p) => {
                if p.updates.is_empty() {
                    return Err(OperationError::Invalid("empty batch".into()));
                }
                for entry in &p.updates {
                    if !canvas.contains(entry.node_id) {
                        return Err(OperationError::NodeNotFound(entry.node_id));
                    }
                }
                validate_property_updates(
                    p.updates.iter().map(|e| (e.property.as_str(), &e.value)),
                )
            }
            Self::LayerOrderChange(p) => {
                let mut proposed = p.new_layer_order.clone();
                proposed.sort_unstable();
                proposed.dedup();
                let mut current: Vec<u64> = canvas.nodes.keys().copied().collect();
                current.sort_unstable();
                if proposed != current || p.new_layer_order.len() != current.len() {
                    return Err(OperationError::Invalid(
                        "newLayerOrder is not a permutation of the current nodes".into(),
                    ));
                }
                Ok(())
            }
            Self::Transaction(p) => {
                // Children are re-validated one by one against the evolving
                // state inside apply; this pass catches shape errors early.
                let children = p.parse_children()?;
                let mut temp_ids: Vec<&str> = children
                    .iter()
                    .filter_map(|(_, op)| match op {
                        Self::NodeCreate(c) => c.temp_id.as_deref(),
                        _ => None,
                    })
                    .collect();
                temp_ids.sort_unstable();
                let before = temp_ids.len();
                temp_ids.dedup();
                if temp_ids.len() != before {
                    return Err(OperationError::Invalid(
                        "duplicate temp ids in transaction".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Mutate the canvas. Must be called after a successful `validate`
    /// against the same state.
    pub fn apply(&self, canvas: &mut CanvasState) -> Result<ApplyOutcome, OperationError> {
        match self {
            Self::NodeCreate(p) => {
                let id = canvas.allocate_node_id();
                let aspect_ratio = p.aspect_ratio.unwrap_or_else(|| aspect_ratio_of(p.size));
                let node = Node {
                    id,
                    node_type: p.node_type,
                    pos: p.pos,
                    size: p.size,
                    rotation: p.rotation.rem_euclid(360.0),
                    aspect_ratio,
                    title: p.title.clone().unwrap_or_default(),
                    flags: p.flags.clone(),
                    properties: p.properties.clone(),
                };
                canvas.insert_node(node.clone());
                let mut assigned_ids = BTreeMap::new();
                if let Some(temp) = &p.temp_id {
                    assigned_ids.insert(temp.clone(), id);
                }
                Ok(ApplyOutcome {
                    changes: StateChanges {
                        added: vec![node],
                        ..Default::default()
                    },
                    undo: UndoData::RemoveNodes { node_ids: vec![id] },
                    assigned_ids,
                })
            }
            Self::NodeDelete(p) => {
                let layer_order = canvas.layer_order.clone();
                let mut removed_nodes = Vec::new();
                let mut removed_ids = Vec::new();
                for id in p.targets() {
                    if let Some(node) = canvas.remove_node(id) {
                        removed_nodes.push(node);
                        removed_ids.push(id);
                    }
                }
                Ok(ApplyOutcome {
                    changes: StateChanges {
                        removed: removed_ids,
                        ..Default::default()
                    },
                    undo: UndoData::RestoreNodes {
                        nodes: removed_nodes,
                        layer_order,
                    },
                    assigned_ids: BTreeMap::new(),
                })
            }
            Self::NodeMove(p) => {
                let mut positions = BTreeMap::new();
                let mut updated = Vec::new();
                for (id, pos) in p.entries()? {
                    let node = canvas.get_mut(id).ok_or(OperationError::NodeNotFound(id))?;
                    positions.insert(id, node.pos);
                    node.pos = pos;
                    updated.push(node.clone());
                }
                Ok(ApplyOutcome {
                    changes: StateChanges {
                        updated,
                        ..Default::default()
                    },
                    undo: UndoData::RestorePositions { positions },
                    assigned_ids: BTreeMap::new(),
                })
            }
            Self::NodeResize(p) => {
                let mut sizes = BTreeMap::new();
                let mut updated = Vec::new();
                for (id, size, declared) in p.entries()? {
                    let node = canvas.get_mut(id).ok_or(OperationError::NodeNotFound(id))?;
                    sizes.insert(
                        id,
                        SizeRestore {
                            size: node.size,
                            aspect_ratio: node.aspect_ratio,
                        },
                    );
                    node.size = size;
                    let computed = aspect_ratio_of(size);
                    node.aspect_ratio = match declared {
                        Some(a) if (a - computed).abs() <= ASPECT_RATIO_TOLERANCE => a,
                        _ => computed,
                    };
                    updated.push(node.clone());
                }
                Ok(ApplyOutcome {
                    changes: StateChanges {
                        updated,
                        ..Default::default()
                    },
                    undo: UndoData::RestoreSizes { sizes },
                    assigned_ids: BTreeMap::new(),
                })
            }
            Self::NodeRotate(p) => {
                let mut rotations = BTreeMap::new();
                let mut updated = Vec::new();
                for (id, rot) in p.entries()? {
                    let node = canvas.get_mut(id).ok_or(OperationError::NodeNotFound(id))?;
                    rotations.insert(id, node.rotation);
                    node.rotation = rot.rem_euclid(360.0);
                    updated.push(node.clone());
                }
                Ok(ApplyOutcome {
                    changes: StateChanges {
                        updated,
                        ..Default::default()
                    },
                    undo: UndoData::RestoreRotations { rotations },
                    assigned_ids: BTreeMap::new(),
                })
            }
            Self::NodePropertyUpdate(p) => {
                let updates = p.updates()?;
                let node = canvas
                    .get_mut(p.node_id)
                    .ok_or(OperationError::NodeNotFound(p.node_id))?;
                let mut previous = BTreeMap::new();
                for (key, value) in updates {
                    previous.insert(key.clone(), set_node_property(node, &key, value)?);
                }
                Ok(ApplyOutcome {
                    changes: StateChanges {
                        updated: vec![node.clone()],
                        ..Default::default()
                    },
                    undo: UndoData::RestoreProperties {
                        node_id: p.node_id,
                        previous,
                    },
                    assigned_ids: BTreeMap::new(),
                })
            }
            Self::NodeBatchPropertyUpdate(p) => {
                let mut inverses = Vec::with_capacity(p.updates.len());
                let mut touched = Vec::new();
                for entry in &p.updates {
                    let node = canvas
                        .get_mut(entry.node_id)
                        .ok_or(OperationError::NodeNotFound(entry.node_id))?;
                    let old = set_node_property(node, &entry.property, entry.value.clone())?;
                    inverses.push(PropertyRestore {
                        node_id: entry.node_id,
                        property: entry.property.clone(),
                        value: old,
                    });
                    if !touched.contains(&entry.node_id) {
                        touched.push(entry.node_id);
                    }
                }
                let updated = touched
                    .iter()
                    .filter_map(|id| canvas.get(*id).cloned())
                    .collect();
                Ok(ApplyOutcome {
                    changes: StateChanges {
                        updated,
                        ..Default::default()
                    },
                    undo: UndoData::RestoreBatch { inverses },
                    assigned_ids: BTreeMap::new(),
                })
            }
            Self::LayerOrderChange(p) => {
                let previous_order = std::mem::replace(
                    &mut canvas.layer_order,
                    p.new_layer_order.clone(),
                );
                Ok(ApplyOutcome {
                    changes: StateChanges {
                        layer_order: Some(p.new_layer_order.clone()),
                        ..Default::default()
                    },
                    undo: UndoData::RestoreLayerOrder { previous_order },
                    assigned_ids: BTreeMap::new(),
                })
            }
            Self::Transaction(p) => {
                // Children apply sequentially against a scratch copy so a
                // failing child leaves the canvas untouched.
                let children = p.parse_children()?;
                let mut scratch = canvas.clone();
                let mut changes = StateChanges::default();
                let mut undos = Vec::with_capacity(children.len());
                let mut assigned_ids = BTreeMap::new();
                for (_, op) in &children {
                    op.validate(&scratch)?;
                    let outcome = op.apply(&mut scratch)?;
                    changes.merge(outcome.changes);
                    undos.push(outcome.undo);
                    assigned_ids.extend(outcome.assigned_ids);
                }
                *canvas = scratch;
                Ok(ApplyOutcome {
                    changes,
                    undo: UndoData::Compound { children: undos },
                    assigned_ids,
                })
            }
        }
    }
}

fn validate_property_updates<'a>(
    updates: impl Iterator<Item = (&'a str, &'a Value)>,
) -> Result<(), OperationError> {
    for (key, value) in updates {
        if key.is_empty() {
            return Err(OperationError::Invalid("empty property name".into()));
        }
        if key == "title" && !(value.is_string() || value.is_null()) {
            return Err(OperationError::Invalid("title must be a string".into()));
        }
    }
    Ok(())
}

/// Set one property on a node, returning the previous value
/// (`None` = property was absent). A `null` value removes the property.
fn set_node_property(
    node: &mut Node,
    key: &str,
    value: Value,
) -> Result<Option<Value>, OperationError> {
    if key == "title" {
        let old = Some(Value::String(node.title.clone()));
        node.title = match value {
            Value::String(s) => s,
            Value::Null => String::new(),
            _ => return Err(OperationError::Invalid("title must be a string".into())),
        };
        return Ok(old);
    }
    match value {
        Value::Null => Ok(node.properties.remove(key)),
        v => Ok(node.properties.insert(key.to_string(), v)),
    }
}

/// Restore the pre-operation state described by `undo`.
pub fn apply_undo(canvas: &mut CanvasState, undo: &UndoData) -> Result<StateChanges, OperationError> {
    match undo {
        UndoData::RemoveNodes { node_ids } => {
            let mut removed = Vec::new();
            for id in node_ids {
                if canvas.remove_node(*id).is_some() {
                    removed.push(*id);
                }
            }
            Ok(StateChanges {
                removed,
                ..Default::default()
            })
        }
        UndoData::RestoreNodes { nodes, layer_order } => {
            let mut added = Vec::new();
            for node in nodes {
                canvas.insert_node(node.clone());
                added.push(node.clone());
            }
            canvas.layer_order = layer_order.clone();
            Ok(StateChanges {
                added,
                layer_order: Some(layer_order.clone()),
                ..Default::default()
            })
        }
        UndoData::RestorePositions { positions } => {
            let mut updated = Vec::new();
            for (id, pos) in positions {
                let node = canvas.get_mut(*id).ok_or(OperationError::NodeNotFound(*id))?;
                node.pos = *pos;
                updated.push(node.clone());
            }
            Ok(StateChanges {
                updated,
                ..Default::default()
            })
        }
        UndoData::RestoreSizes { sizes } => {
            let mut updated = Vec::new();
            for (id, restore) in sizes {
                let node = canvas.get_mut(*id).ok_or(OperationError::NodeNotFound(*id))?;
                node.size = restore.size;
                node.aspect_ratio = restore.aspect_ratio;
                updated.push(node.clone());
            }
            Ok(StateChanges {
                updated,
                ..Default::default()
            })
        }
        UndoData::RestoreRotations { rotations } => {
            let mut updated = Vec::new();
            for (id, rot) in rotations {
                let node = canvas.get_mut(*id).ok_or(OperationError::NodeNotFound(*id))?;
                node.rotation = *rot;
                updated.push(node.clone());
            }
            Ok(StateChanges {
                updated,
                ..Default::default()
            })
        }
        UndoData::RestoreProperties { node_id, previous } => {
            let node = canvas
                .get_mut(*node_id)
                .ok_or(OperationError::NodeNotFound(*node_id))?;
            for (key, old) in previous {
                restore_node_property(node, key, old.clone());
            }
            Ok(StateChanges {
                updated: vec![node.clone()],
                ..Default::default()
            })
        }
        UndoData::RestoreBatch { inverses } => {
            let mut updated = Vec::new();
            for inverse in inverses.iter().rev() {
                let node = canvas
                    .get_mut(inverse.node_id)
                    .ok_or(OperationError::NodeNotFound(inverse.node_id))?;
                restore_node_property(node, &inverse.property, inverse.value.clone());
                let snapshot = node.clone();
                updated.retain(|n: &Node| n.id != snapshot.id);
                updated.push(snapshot);
            }
            Ok(StateChanges {
                updated,
                ..Default::default()
            })
        }
        UndoData::RestoreLayerOrder { previous_order } => {
            canvas.layer_order = previous_order.clone();
            Ok(StateChanges {
                layer_order: Some(previous_order.clone()),
                ..Default::default()
            })
        }
        UndoData::Compound { children } => {
            let mut changes = StateChanges::default();
            for child in children.iter().rev() {
                changes.merge(apply_undo(canvas, child)?);
            }
            Ok(changes)
        }
    }
}

fn restore_node_property(node: &mut Node, key: &str, old: Option<Value>) {
    if key == "title" {
        node.title = old.and_then(|v| v.as_str().map(str::to_owned)).unwrap_or_default();
        return;
    }
    match old {
        Some(v) => {
            node.properties.insert(key.to_string(), v);
        }
        None => {
            node.properties.remove(key);
        }
    }
}

/// Parse, validate and apply one operation in a single step.
///
/// Used for operation-log replay and by the reference client; the server
/// pipeline calls the three stages separately so it can reject before
/// touching the canvas.
pub fn apply_operation(
    canvas: &mut CanvasState,
    operation_type: &str,
    params: &Value,
) -> Result<ApplyOutcome, OperationError> {
    let kind = OperationKind::parse(operation_type)?;
    let op = OperationParams::parse(kind, params)?;
    op.validate(canvas)?;
    op.apply(canvas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn canvas_with_node() -> (CanvasState, u64) {
        let mut canvas = CanvasState::new();
        let outcome = apply_operation(
            &mut canvas,
            "node_create",
            &json!({
                "type": "image",
                "pos": [100.0, 100.0],
                "size": [200.0, 100.0],
                "properties": {"hash": "abc123"}
            }),
        )
        .unwrap();
        let id = outcome.changes.added[0].id;
        (canvas, id)
    }

    #[test]
    fn create_assigns_monotonic_ids_and_temp_mapping() {
        let mut canvas = CanvasState::new();
        let outcome = apply_operation(
            &mut canvas,
            "node_create",
            &json!({
                "id": "t-17",
                "type": "image",
                "pos": [50.0, 50.0],
                "size": [200.0, 200.0]
            }),
        )
        .unwrap();
        assert_eq!(outcome.assigned_ids.get("t-17"), Some(&1));
        assert_eq!(canvas.get(1).unwrap().pos, [50.0, 50.0]);

        let outcome = apply_operation(
            &mut canvas,
            "node_create",
            &json!({"type": "text", "pos": [0.0, 0.0], "size": [10.0, 10.0]}),
        )
        .unwrap();
        assert_eq!(outcome.changes.added[0].id, 2);
    }

    #[test]
    fn create_computes_aspect_ratio_from_size() {
        let (canvas, id) = canvas_with_node();
        assert!((canvas.get(id).unwrap().aspect_ratio - 2.0).abs() < 1e-9);
    }

    #[test]
    fn move_unknown_node_is_not_found() {
        let (canvas, _) = canvas_with_node();
        let op = OperationParams::parse(
            OperationKind::NodeMove,
            &json!({"nodeId": 999, "position": [10.0, 10.0]}),
        )
        .unwrap();
        assert!(matches!(
            op.validate(&canvas),
            Err(OperationError::NodeNotFound(999))
        ));
    }

    #[test]
    fn resize_keeps_declared_aspect_within_tolerance() {
        let (mut canvas, id) = canvas_with_node();
        apply_operation(
            &mut canvas,
            "node_resize",
            &json!({"nodeId": id, "size": [300.0, 150.0], "aspectRatio": 2.0005}),
        )
        .unwrap();
        assert!((canvas.get(id).unwrap().aspect_ratio - 2.0005).abs() < 1e-9);

        // A declared ratio far off the real one is recomputed.
        apply_operation(
            &mut canvas,
            "node_resize",
            &json!({"nodeId": id, "size": [300.0, 100.0], "aspectRatio": 1.0}),
        )
        .unwrap();
        assert!((canvas.get(id).unwrap().aspect_ratio - 3.0).abs() < 1e-9);
    }

    #[test]
    fn rotation_wraps_modulo_360() {
        let (mut canvas, id) = canvas_with_node();
        apply_operation(
            &mut canvas,
            "node_rotate",
            &json!({"nodeId": id, "rotation": -90.0}),
        )
        .unwrap();
        assert!((canvas.get(id).unwrap().rotation - 270.0).abs() < 1e-9);
    }

    #[test]
    fn layer_order_change_requires_permutation() {
        let (mut canvas, id) = canvas_with_node();
        apply_operation(
            &mut canvas,
            "node_create",
            &json!({"type": "text", "pos": [0.0, 0.0], "size": [10.0, 10.0]}),
        )
        .unwrap();

        let bad = OperationParams::parse(
            OperationKind::LayerOrderChange,
            &json!({"newLayerOrder": [id]}),
        )
        .unwrap();
        assert!(bad.validate(&canvas).is_err());

        apply_operation(
            &mut canvas,
            "layer_order_change",
            &json!({"newLayerOrder": [2, id]}),
        )
        .unwrap();
        assert_eq!(canvas.layer_order, vec![2, id]);
    }

    #[test]
    fn undo_roundtrip_restores_exact_state() {
        let (mut canvas, id) = canvas_with_node();
        let before = canvas.clone();

        let ops = [
            json!({"type": "node_move", "params": {"nodeId": id, "position": [7.0, 8.0]}}),
            json!({"type": "node_resize", "params": {"nodeId": id, "size": [50.0, 25.0]}}),
            json!({"type": "node_rotate", "params": {"nodeId": id, "rotation": 45.0}}),
            json!({"type": "node_property_update",
                   "params": {"nodeId": id, "property": "title", "value": "renamed"}}),
            json!({"type": "node_delete", "params": {"nodeIds": [id]}}),
        ];
        let mut undos = Vec::new();
        for op in &ops {
            let outcome = apply_operation(
                &mut canvas,
                op["type"].as_str().unwrap(),
                &op["params"],
            )
            .unwrap();
            undos.push(outcome.undo);
        }
        for undo in undos.iter().rev() {
            apply_undo(&mut canvas, undo).unwrap();
        }
        assert_eq!(canvas, before);
    }

    #[test]
    fn batch_property_update_undoes_in_reverse() {
        let (mut canvas, id) = canvas_with_node();
        let before = canvas.clone();
        let outcome = apply_operation(
            &mut canvas,
            "node_batch_property_update",
            &json!({"updates": [
                {"nodeId": id, "property": "opacity", "value": 0.5},
                {"nodeId": id, "property": "opacity", "value": 0.25},
            ]}),
        )
        .unwrap();
        assert_eq!(canvas.get(id).unwrap().properties["opacity"], json!(0.25));
        apply_undo(&mut canvas, &outcome.undo).unwrap();
        assert_eq!(canvas, before);
    }

    #[test]
    fn transaction_is_atomic() {
        let (mut canvas, id) = canvas_with_node();
        let before = canvas.clone();
        // Second child references a missing node; nothing may stick.
        let result = apply_operation(
            &mut canvas,
            "transaction",
            &json!({"operations": [
                {"type": "node_move", "params": {"nodeId": id, "position": [1.0, 1.0]}},
                {"type": "node_move", "params": {"nodeId": 999, "position": [2.0, 2.0]}},
            ]}),
        );
        assert!(result.is_err());
        assert_eq!(canvas, before);

        let outcome = apply_operation(
            &mut canvas,
            "transaction",
            &json!({"operations": [
                {"type": "node_create", "params":
                    {"id": "t-1", "type": "text", "pos": [0.0, 0.0], "size": [10.0, 10.0]}},
                {"type": "node_move", "params": {"nodeId": id, "position": [1.0, 1.0]}},
            ]}),
        )
        .unwrap();
        assert_eq!(outcome.assigned_ids.len(), 1);
        apply_undo(&mut canvas, &outcome.undo).unwrap();
        assert_eq!(canvas, before);
    }

    #[test]
    fn nested_transactions_are_refused() {
        let canvas = CanvasState::new();
        let op = OperationParams::parse(
            OperationKind::Transaction,
            &json!({"operations": [
                {"type": "transaction", "params": {"operations": []}},
            ]}),
        )
        .unwrap();
        assert!(matches!(
            op.validate(&canvas),
            Err(OperationError::NestedTransaction)
        ));
    }

    #[test]
    fn delete_skips_missing_nodes() {
        let (mut canvas, id) = canvas_with_node();
        let outcome = apply_operation(
            &mut canvas,
            "node_delete",
            &json!({"nodeIds": [id, 424242]}),
        )
        .unwrap();
        assert_eq!(outcome.changes.removed, vec![id]);
        assert_eq!(canvas.node_count(), 0);
    }
}

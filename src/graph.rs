// Workflow graphs
//
// This is the type-safe representation of a ComfyUI "API format" node graph.
// A graph is a map of node id -> node, and edges are expressed as NodeRefs sitting
// in a node's inputs. Everything is kept in sorted maps, so serializing the same
// graph twice always gives the same bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type NodeId = String;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("node {0} not found in workflow")]
    NodeNotFound(NodeId),
    #[error("node {id} ({expected}) not found in workflow")]
    MissingNode { id: NodeId, expected: String },
    #[error("node {id} should be a {expected}, but is a {found}")]
    ClassMismatch {
        id: NodeId,
        expected: String,
        found: String,
    },
    #[error("input {node}.{field} points at missing node {target}")]
    DanglingRef {
        node: NodeId,
        field: String,
        target: NodeId,
    },
    #[error("node {0} already exists")]
    DuplicateNode(NodeId),
    #[error("failed to parse workflow: {0}")]
    Parse(#[from] serde_json::Error),
}

/// An edge: "output number `.1` of node `.0`".
/// Serializes as a two-element array, e.g. `["4", 1]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef(pub NodeId, pub u32);

impl NodeRef {
    pub fn new(node: impl Into<NodeId>, output: u32) -> Self {
        Self(node.into(), output)
    }

    pub fn node(&self) -> &str {
        &self.0
    }

    pub fn output(&self) -> u32 {
        self.1
    }
}

/// A node input. Either a literal, or a reference to another node's output.
// Variant order matters for the untagged representation: a two-element array has
// to be tried as a reference before anything else.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Ref(NodeRef),
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl Value {
    pub fn as_node_ref(&self) -> Option<&NodeRef> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }
}

impl From<NodeRef> for Value {
    fn from(r: NodeRef) -> Self {
        Value::Ref(r)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub title: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub inputs: BTreeMap<String, Value>,
    pub class_type: String,
    #[serde(rename = "_meta", default)]
    pub meta: Meta,
}

impl Node {
    pub fn new(class_type: &str, title: &str) -> Self {
        Self {
            inputs: BTreeMap::new(),
            class_type: class_type.to_owned(),
            meta: Meta {
                title: title.to_owned(),
            },
        }
    }

    pub fn with_input(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.inputs.insert(field.to_owned(), value.into());
        self
    }

    pub fn input(&self, field: &str) -> Option<&Value> {
        self.inputs.get(field)
    }

    /// Every edge leaving this node's inputs, as (field, target).
    pub fn refs(&self) -> impl Iterator<Item = (&str, &NodeRef)> {
        self.inputs
            .iter()
            .filter_map(|(field, value)| value.as_node_ref().map(|r| (field.as_str(), r)))
    }
}

/// A whole workflow. `Clone` is a deep copy; nothing is shared between clones.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Graph {
    nodes: BTreeMap<NodeId, Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(text: &str) -> Result<Self, GraphError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<serde_json::Value, GraphError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &str) -> Result<&Node, GraphError> {
        self.nodes
            .get(id)
            .ok_or_else(|| GraphError::NodeNotFound(id.to_owned()))
    }

    pub fn node_mut(&mut self, id: &str) -> Result<&mut Node, GraphError> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::NodeNotFound(id.to_owned()))
    }

    /// Looks up a node and checks that it is the operation we think it is.
    /// Both failure cases name the class that was expected.
    pub fn expect_class(&self, id: &str, class_type: &str) -> Result<&Node, GraphError> {
        let node = self.nodes.get(id).ok_or_else(|| GraphError::MissingNode {
            id: id.to_owned(),
            expected: class_type.to_owned(),
        })?;
        if node.class_type != class_type {
            return Err(GraphError::ClassMismatch {
                id: id.to_owned(),
                expected: class_type.to_owned(),
                found: node.class_type.clone(),
            });
        }
        Ok(node)
    }

    /// Sets (or overwrites) one input of an existing node.
    /// Never creates the node; a missing node means the template and its adapter disagree.
    pub fn set_input(
        &mut self,
        id: &str,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<(), GraphError> {
        let node = self.node_mut(id)?;
        node.inputs.insert(field.to_owned(), value.into());
        Ok(())
    }

    pub fn insert_node(&mut self, id: impl Into<NodeId>, node: Node) -> Result<(), GraphError> {
        let id = id.into();
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateNode(id));
        }
        self.nodes.insert(id, node);
        Ok(())
    }

    pub fn count_class(&self, class_type: &str) -> usize {
        self.nodes
            .values()
            .filter(|n| n.class_type == class_type)
            .count()
    }

    /// First id above every numeric node id in the graph.
    /// Non-numeric ids are ignored; ComfyUI exports only use numbers.
    pub fn next_free_id(&self) -> u64 {
        self.nodes
            .keys()
            .filter_map(|id| id.parse::<u64>().ok())
            .max()
            .map_or(1, |max| max + 1)
    }

    /// Checks that every NodeRef points at a node of this graph.
    pub fn validate_refs(&self) -> Result<(), GraphError> {
        for (id, node) in &self.nodes {
            for (field, target) in node.refs() {
                if !self.nodes.contains_key(target.node()) {
                    return Err(GraphError::DanglingRef {
                        node: id.clone(),
                        field: field.to_owned(),
                        target: target.node().to_owned(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Blake3 hash of the canonical JSON form. Equal graphs have equal fingerprints.
    pub fn fingerprint(&self) -> Result<String, GraphError> {
        let text = serde_json::to_string(self)?;
        Ok(crate::utils::hash(&text))
    }
}

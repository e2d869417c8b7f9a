//! Identity types for graphs, nodes and pins.
//!
//! `GraphId` is a plain newtype in the same spirit as every other id in the
//! crate. IR nodes and pins live in slot maps, so their keys are
//! generational and stay valid across removals during pass rewriting.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Stable identity of a declarative graph asset.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphId(pub u32);

impl GraphId {
    pub const INVALID: GraphId = GraphId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "GraphId(INVALID)")
        } else {
            write!(f, "GraphId({})", self.0)
        }
    }
}

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Names a node back in its declarative graph.
///
/// Nodes created by template expansion keep the declarative id of the node
/// they came from and get a distinct `instance` so that diagnostics still
/// point at something the user can click on.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub graph: GraphId,
    pub node: Arc<str>,
    pub instance: Option<u32>,
}

impl NodeKey {
    pub fn new(graph: GraphId, node: impl Into<Arc<str>>) -> Self {
        Self {
            graph,
            node: node.into(),
            instance: None,
        }
    }

    pub fn with_instance(mut self, instance: u32) -> Self {
        self.instance = Some(instance);
        self
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.instance {
            Some(i) => write!(f, "{}/{}#{}", self.graph.0, self.node, i),
            None => write!(f, "{}/{}", self.graph.0, self.node),
        }
    }
}

/// Prefix used for the ids of graph output nodes.
pub const OUTPUT_NODE_PREFIX: &str = "Output.";

/// A compile target: one pin of one node in one graph.
///
/// Executors are cached per `GraphPinRef`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphPinRef {
    pub graph: GraphId,
    pub node: Arc<str>,
    pub pin: Arc<str>,
}

impl GraphPinRef {
    pub fn new(graph: GraphId, node: impl Into<Arc<str>>, pin: impl Into<Arc<str>>) -> Self {
        Self {
            graph,
            node: node.into(),
            pin: pin.into(),
        }
    }

    /// The value pin of a graph output node.
    pub fn output(graph: GraphId, output_node_id: impl Into<Arc<str>>) -> Self {
        Self::new(graph, output_node_id, "Value")
    }

    /// The same pin in another graph, used when walking to a parent graph.
    pub fn with_graph(&self, graph: GraphId) -> Self {
        Self {
            graph,
            node: self.node.clone(),
            pin: self.pin.clone(),
        }
    }
}

impl fmt::Debug for GraphPinRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for GraphPinRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}", self.graph.0, self.node, self.pin)
    }
}

slotmap::new_key_type! {
    /// Node key in an [`IrGraph`](super::ir::IrGraph).
    pub struct IrNodeId;
    /// Pin key in an [`IrGraph`](super::ir::IrGraph).
    pub struct IrPinId;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_id_invalid() {
        assert!(!GraphId::INVALID.is_valid());
        assert!(GraphId(0).is_valid());
        assert_eq!(format!("{:?}", GraphId::INVALID), "GraphId(INVALID)");
        assert_eq!(format!("{}", GraphId(7)), "GraphId(7)");
    }

    #[test]
    fn test_node_key_display() {
        let key = NodeKey::new(GraphId(2), "Add_1");
        assert_eq!(key.to_string(), "2/Add_1");
        assert_eq!(key.with_instance(3).to_string(), "2/Add_1#3");
    }

    #[test]
    fn test_pin_ref_output() {
        let pin = GraphPinRef::output(GraphId(1), "Output.abc");
        assert_eq!(&*pin.pin, "Value");
        assert_eq!(pin.with_graph(GraphId(4)).graph, GraphId(4));
    }
}

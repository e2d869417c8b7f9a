//! Declarative graph model.
//!
//! This is what an editor saves: nodes with named, typed pins whose links
//! are listed on both ends. It is serialized as JSON and is the input to
//! translation.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::buffer::value::Value;
use crate::graph::error::GraphResult;
use crate::graph::id::{GraphId, OUTPUT_NODE_PREFIX};
use crate::graph::types::PinType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledGraph {
    pub id: GraphId,
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<CompiledNode>,
    #[serde(default)]
    pub parameters: Vec<GraphParameter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphParameter {
    pub guid: String,
    pub name: String,
    pub pin_type: PinType,
    pub default: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledNode {
    pub node_id: String,
    pub kind: CompiledNodeKind,
    #[serde(default)]
    pub input_pins: Vec<CompiledPin>,
    #[serde(default)]
    pub output_pins: Vec<CompiledPin>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CompiledNodeKind {
    /// A node backed by a registered operation.
    Struct { operation: String },
    /// A reference to another graph.
    Macro { graph: GraphId, mode: MacroMode },
    /// Reads a graph parameter.
    Parameter { guid: String },
    /// A graph input. Its value comes from the calling context.
    Input {
        name: String,
        #[serde(default)]
        has_default_pin: bool,
    },
    /// A graph output. Node ids of outputs start with `Output.`.
    Output { name: String },
}

/// How a macro node is brought into the calling graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MacroMode {
    /// Called at runtime through its own executor.
    Function,
    /// Inlined into the caller during compilation.
    Template,
    /// Called at runtime and allowed to call itself.
    RecursiveTemplate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledPin {
    pub name: String,
    pub pin_type: PinType,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub linked_to: Vec<PinEndpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PinEndpoint {
    pub node_id: String,
    pub pin: String,
}

impl PinEndpoint {
    pub fn new(node_id: impl Into<String>, pin: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            pin: pin.into(),
        }
    }
}

impl CompiledPin {
    pub fn new(name: impl Into<String>, pin_type: PinType) -> Self {
        Self {
            name: name.into(),
            pin_type,
            default_value: None,
            linked_to: Vec::new(),
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }
}

impl CompiledNode {
    pub fn input(&self, name: &str) -> Option<&CompiledPin> {
        self.input_pins.iter().find(|p| p.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&CompiledPin> {
        self.output_pins.iter().find(|p| p.name == name)
    }

    pub fn is_output_node(&self) -> bool {
        matches!(self.kind, CompiledNodeKind::Output { .. })
    }
}

impl CompiledGraph {
    pub fn new(id: GraphId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            nodes: Vec::new(),
            parameters: Vec::new(),
        }
    }

    pub fn find_node(&self, node_id: &str) -> Option<&CompiledNode> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Output node by its display name.
    pub fn output_node(&self, name: &str) -> Option<&CompiledNode> {
        self.nodes.iter().find(|n| match &n.kind {
            CompiledNodeKind::Output { name: n } => n == name,
            _ => false,
        })
    }

    /// Input node by its display name.
    pub fn input_node(&self, name: &str) -> Option<&CompiledNode> {
        self.nodes.iter().find(|n| match &n.kind {
            CompiledNodeKind::Input { name: n, .. } => n == name,
            _ => false,
        })
    }

    /// Link `from.output` to `to.input`, recording the endpoint on both
    /// pins. Returns false if either pin is missing.
    pub fn link(&mut self, from: &str, output: &str, to: &str, input: &str) -> bool {
        let has_output = self.find_node(from).and_then(|n| n.output(output)).is_some();
        let has_input = self.find_node(to).and_then(|n| n.input(input)).is_some();
        if !has_output || !has_input {
            return false;
        }
        for node in &mut self.nodes {
            if node.node_id == from {
                if let Some(pin) = node.output_pins.iter_mut().find(|p| p.name == output) {
                    pin.linked_to.push(PinEndpoint::new(to, input));
                }
            }
            if node.node_id == to {
                if let Some(pin) = node.input_pins.iter_mut().find(|p| p.name == input) {
                    pin.linked_to.push(PinEndpoint::new(from, output));
                }
            }
        }
        true
    }

    pub fn parameter(&self, guid: &str) -> Option<&GraphParameter> {
        self.parameters.iter().find(|p| p.guid == guid)
    }

    /// Every graph referenced by a macro node.
    pub fn referenced_graphs(&self) -> BTreeSet<GraphId> {
        self.nodes
            .iter()
            .filter_map(|n| match n.kind {
                CompiledNodeKind::Macro { graph, .. } => Some(graph),
                _ => None,
            })
            .collect()
    }

    /// Output node ids that do not follow the `Output.` naming rule.
    pub fn misnamed_outputs(&self) -> impl Iterator<Item = &CompiledNode> {
        self.nodes
            .iter()
            .filter(|n| n.is_output_node() && !n.node_id.starts_with(OUTPUT_NODE_PREFIX))
    }

    pub fn from_json(json: &str) -> GraphResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> GraphResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> GraphResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn save(&self, path: &Path) -> GraphResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::value::ValueKind;

    fn sample() -> CompiledGraph {
        let mut g = CompiledGraph::new(GraphId(3), "sample");
        g.nodes.push(CompiledNode {
            node_id: "Output.0".into(),
            kind: CompiledNodeKind::Output {
                name: "Density".into(),
            },
            input_pins: vec![CompiledPin::new("Value", PinType::Buffer(ValueKind::Float))
                .with_default(Value::Float(1.0))],
            output_pins: vec![],
        });
        g.nodes.push(CompiledNode {
            node_id: "Call".into(),
            kind: CompiledNodeKind::Macro {
                graph: GraphId(9),
                mode: MacroMode::Function,
            },
            input_pins: vec![],
            output_pins: vec![],
        });
        g
    }

    #[test]
    fn test_json_round_trip_preserves_graph() {
        let g = sample();
        let json = g.to_json().unwrap();
        assert!(json.contains("\"type\": \"Output\""));
        assert_eq!(CompiledGraph::from_json(&json).unwrap(), g);
    }

    #[test]
    fn test_lookup_helpers() {
        let g = sample();
        assert_eq!(g.output_node("Density").unwrap().node_id, "Output.0");
        assert!(g.input_node("Density").is_none());
        assert_eq!(g.referenced_graphs().into_iter().collect::<Vec<_>>(), vec![GraphId(9)]);
        assert_eq!(g.misnamed_outputs().count(), 0);
    }

    #[test]
    fn test_link_records_both_ends() {
        let mut g = sample();
        g.nodes.push(CompiledNode {
            node_id: "Abs".into(),
            kind: CompiledNodeKind::Struct { operation: "Abs".into() },
            input_pins: vec![],
            output_pins: vec![CompiledPin::new("Result", PinType::Buffer(ValueKind::Float))],
        });
        assert!(g.link("Abs", "Result", "Output.0", "Value"));
        assert_eq!(g.find_node("Abs").unwrap().output("Result").unwrap().linked_to.len(), 1);
        assert_eq!(
            g.find_node("Output.0").unwrap().input("Value").unwrap().linked_to,
            vec![PinEndpoint::new("Abs", "Result")]
        );
        assert!(!g.link("Abs", "Missing", "Output.0", "Value"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graphs").join("g.json");
        let g = sample();
        g.save(&path).unwrap();
        assert_eq!(CompiledGraph::load(&path).unwrap(), g);
    }
}

//! Test data builders for declarative graphs

use voxelgraph_rs::graph::{CompiledGraph, CompiledNode, CompiledNodeKind, CompiledPin, GraphId, MacroMode, PinType};
use voxelgraph_rs::{Value, ValueKind};

pub const FLOAT: PinType = PinType::Buffer(ValueKind::Float);
pub const VECTOR: PinType = PinType::Buffer(ValueKind::Vector);

/// Builder for one declarative node
pub struct NodeBuilder {
    node: CompiledNode,
}

impl NodeBuilder {
    /// A struct node running `operation`
    pub fn op(id: &str, operation: &str) -> Self {
        Self::with_kind(
            id,
            CompiledNodeKind::Struct {
                operation: operation.to_string(),
            },
        )
    }

    /// A graph output; the id gets the `Output.` prefix
    pub fn output(id: &str, name: &str) -> Self {
        Self::with_kind(&format!("Output.{id}"), CompiledNodeKind::Output { name: name.to_string() })
            .input_default("Value", FLOAT, Value::Float(0.0))
    }

    pub fn input(mut self, name: &str, pin_type: PinType) -> Self {
        self.node.input_pins.push(CompiledPin::new(name, pin_type));
        self
    }

    pub fn input_default(mut self, name: &str, pin_type: PinType, value: Value) -> Self {
        self.node.input_pins.push(CompiledPin::new(name, pin_type).with_default(value));
        self
    }

    pub fn out(mut self, name: &str, pin_type: PinType) -> Self {
        self.node.output_pins.push(CompiledPin::new(name, pin_type));
        self
    }

    pub fn macro_call(id: &str, graph: GraphId, mode: MacroMode) -> Self {
        Self::with_kind(id, CompiledNodeKind::Macro { graph, mode })
    }

    fn with_kind(id: &str, kind: CompiledNodeKind) -> Self {
        Self {
            node: CompiledNode {
                node_id: id.to_string(),
                kind,
                input_pins: Vec::new(),
                output_pins: Vec::new(),
            },
        }
    }

    pub fn build(self) -> CompiledNode {
        self.node
    }
}

/// `Abs(Value) -> Result` over floats
pub fn abs(id: &str) -> NodeBuilder {
    NodeBuilder::op(id, "Abs")
        .input_default("Value", FLOAT, Value::Float(-1.0))
        .out("Result", FLOAT)
}

/// `Add(A, B) -> Result` over floats
pub fn add(id: &str) -> NodeBuilder {
    NodeBuilder::op(id, "Add")
        .input_default("A", FLOAT, Value::Float(1.0))
        .input_default("B", FLOAT, Value::Float(2.0))
        .out("Result", FLOAT)
}

/// Builder for declarative graphs with symmetric links
pub struct GraphBuilder {
    graph: CompiledGraph,
    links: Vec<(String, String, String, String)>,
}

impl GraphBuilder {
    pub fn new(id: u32) -> Self {
        Self {
            graph: CompiledGraph::new(GraphId(id), format!("graph{id}")),
            links: Vec::new(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.graph.name = name.to_string();
        self
    }

    pub fn node(mut self, node: NodeBuilder) -> Self {
        self.graph.nodes.push(node.build());
        self
    }

    /// Link `from.output` to `to.input`
    pub fn link(mut self, from: &str, output: &str, to: &str, input: &str) -> Self {
        self.links
            .push((from.to_string(), output.to_string(), to.to_string(), input.to_string()));
        self
    }

    pub fn build(mut self) -> CompiledGraph {
        for (from, output, to, input) in &self.links {
            assert!(
                self.graph.link(from, output, to, input),
                "Invalid test link {}.{} -> {}.{}",
                from,
                output,
                to,
                input
            );
        }
        self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_builder_links_both_ends() {
        let g = GraphBuilder::new(1)
            .node(abs("A"))
            .node(NodeBuilder::output("0", "Density"))
            .link("A", "Result", "Output.0", "Value")
            .build();

        assert_eq!(g.nodes.len(), 2);
        assert_eq!(g.find_node("A").unwrap().output("Result").unwrap().linked_to.len(), 1);
        assert_eq!(g.find_node("Output.0").unwrap().input("Value").unwrap().linked_to.len(), 1);
    }
}

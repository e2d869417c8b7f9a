//! Immutable runtime graphs.
//!
//! An [`Executor`] is built once from a fully compiled IR graph: every
//! surviving IR node becomes a [`RuntimeNode`] whose inputs point either at
//! an upstream node output or at a constant. Executors are shared by every
//! query against the same compile target.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::graph::error::{GraphError, GraphResult};
use crate::graph::id::{GraphPinRef, IrNodeId, IrPinId, NodeKey};
use crate::graph::ir::{GraphSignature, IrGraph, IrNodeKind};
use crate::graph::operation::Operation;
use crate::graph::types::PinType;
use crate::query::future::FutureValue;
use crate::query::query::{MemoKey, Query};
use crate::runtime::compute;
use crate::runtime::value::{NodeOutputs, RuntimeValue};

/// Where an input gets its value.
#[derive(Debug, Clone)]
pub enum InputSource {
    Upstream { node: u32, output: u32 },
    /// Default of an unlinked pin, or the neutral value of its type.
    Constant(RuntimeValue),
}

#[derive(Debug, Clone)]
pub struct RuntimeInput {
    pub name: Arc<str>,
    pub pin_type: PinType,
    pub source: InputSource,
}

#[derive(Debug, Clone)]
pub struct RuntimeOutput {
    pub name: Arc<str>,
    pub pin_type: PinType,
}

#[derive(Debug, Clone)]
pub struct RuntimeNode {
    pub key: NodeKey,
    pub operation: Operation,
    pub inputs: Vec<RuntimeInput>,
    pub outputs: Vec<RuntimeOutput>,
}

impl RuntimeNode {
    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|i| &*i.name == name)
    }
}

/// Statistics about one compile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileStats {
    /// Nodes in the translated graph, before any pass.
    pub translated_nodes: usize,

    /// Nodes in the executor.
    pub runtime_nodes: usize,

    /// Nodes pruned by dead-code elimination.
    pub removed_nodes: usize,

    pub templates_expanded: usize,

    pub passthroughs_removed: usize,

    pub virtual_pins_disconnected: usize,

    /// Compilation time in microseconds
    pub compile_time_us: u64,
}

pub struct Executor {
    id: u64,
    target: GraphPinRef,
    nodes: Vec<RuntimeNode>,
    /// Input of the IR root. `None` for a graph that does not exist.
    root: Option<RuntimeInput>,
    signature: GraphSignature,
    stats: CompileStats,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("nodes", &self.nodes.len())
            .field("has_root", &self.root.is_some())
            .finish()
    }
}

impl Executor {
    /// Executor with no root: evaluates to an empty value.
    pub fn empty(id: u64, target: GraphPinRef) -> Self {
        Self {
            id,
            target,
            nodes: Vec::new(),
            root: None,
            signature: GraphSignature::default(),
            stats: CompileStats::default(),
        }
    }

    /// Duplicate the IR nodes listed in `order` into runtime nodes.
    ///
    /// `order` must be topological and contain `root`; `graph` must be free
    /// of passthroughs and templates.
    pub fn build(
        id: u64,
        target: GraphPinRef,
        graph: &IrGraph,
        root: IrNodeId,
        order: &[IrNodeId],
        mut stats: CompileStats,
    ) -> GraphResult<Self> {
        let mut index: FxHashMap<IrNodeId, u32> = FxHashMap::default();
        let mut nodes = Vec::with_capacity(order.len());

        for &id in order {
            if id == root {
                continue;
            }
            let node = graph.node(id)?;
            let operation = match &node.kind {
                IrNodeKind::Struct(op) if !op.is_template() => op.clone(),
                IrNodeKind::Struct(_) => {
                    return Err(GraphError::Internal(format!("template {} survived compilation", node.key)))
                }
                IrNodeKind::Passthrough => {
                    return Err(GraphError::Internal(format!("passthrough {} survived compilation", node.key)))
                }
                IrNodeKind::Root => return Err(GraphError::Internal("graph has two roots".into())),
            };

            let inputs = node
                .inputs()
                .iter()
                .map(|&pin| runtime_input(graph, &index, pin))
                .collect::<GraphResult<Vec<_>>>()?;
            let outputs = node
                .outputs()
                .iter()
                .map(|&pin| {
                    let p = graph.pin(pin)?;
                    Ok(RuntimeOutput {
                        name: p.name.clone(),
                        pin_type: p.pin_type,
                    })
                })
                .collect::<GraphResult<Vec<_>>>()?;

            index.insert(id, nodes.len() as u32);
            nodes.push(RuntimeNode {
                key: node.key.clone(),
                operation,
                inputs,
                outputs,
            });
        }

        let root_pin = graph
            .node(root)?
            .inputs()
            .first()
            .copied()
            .ok_or_else(|| GraphError::Internal("root has no input".into()))?;
        let root_input = runtime_input(graph, &index, root_pin)?;

        stats.runtime_nodes = nodes.len();
        Ok(Self {
            id,
            target,
            nodes,
            root: Some(root_input),
            signature: graph.signature(),
            stats,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &GraphPinRef {
        &self.target
    }

    pub fn has_root(&self) -> bool {
        self.root.is_some()
    }

    pub fn root_type(&self) -> Option<PinType> {
        self.root.as_ref().map(|r| r.pin_type)
    }

    pub fn nodes(&self) -> &[RuntimeNode] {
        &self.nodes
    }

    pub fn node(&self, index: u32) -> Option<&RuntimeNode> {
        self.nodes.get(index as usize)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_keys(&self) -> Vec<NodeKey> {
        self.nodes.iter().map(|n| n.key.clone()).collect()
    }

    /// Whether a node of the source graph survived compilation.
    pub fn contains_node(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| &*n.key.node == node)
    }

    pub fn signature(&self) -> &GraphSignature {
        &self.signature
    }

    pub fn stats(&self) -> &CompileStats {
        &self.stats
    }

    /// Structural equality: same node, pin and link multiset.
    pub fn is_identical(&self, other: &Executor) -> bool {
        self.root.is_some() == other.root.is_some() && self.signature == other.signature
    }

    // ── Evaluation ──

    /// Evaluate the root for `query`.
    pub fn execute(self: &Arc<Self>, query: &Query) -> FutureValue<RuntimeValue> {
        match &self.root {
            Some(root) => self.evaluate_input(root, query),
            None => FutureValue::resolved(RuntimeValue::Empty),
        }
    }

    /// Value of one input, with `Empty` replaced by the neutral value.
    pub fn evaluate_input(self: &Arc<Self>, input: &RuntimeInput, query: &Query) -> FutureValue<RuntimeValue> {
        match &input.source {
            InputSource::Constant(value) => FutureValue::resolved(value.clone()),
            InputSource::Upstream { node, output } => {
                let output = *output as usize;
                let pin_type = input.pin_type;
                self.evaluate_node(*node, query).map(move |outputs| {
                    outputs
                        .get(output)
                        .cloned()
                        .unwrap_or_default()
                        .or_neutral(pin_type)
                })
            }
        }
    }

    /// Outputs of one node, memoized per query and call context.
    pub fn evaluate_node(self: &Arc<Self>, node: u32, query: &Query) -> FutureValue<NodeOutputs> {
        let key = MemoKey {
            executor: self.id,
            node,
            context: query.context().id(),
        };
        query
            .cache()
            .get_or_compute(key, || compute::compute_node(self, node, query))
    }
}

fn runtime_input(graph: &IrGraph, index: &FxHashMap<IrNodeId, u32>, pin: IrPinId) -> GraphResult<RuntimeInput> {
    let p = graph.pin(pin)?;
    let source = match graph.links(pin).first() {
        Some(&upstream) => {
            let up = graph.pin(upstream)?;
            let node = *index.get(&up.node).ok_or_else(|| {
                GraphError::Internal(format!("{} is linked to a node outside the sort order", graph.describe_pin(pin)))
            })?;
            let output = graph
                .node(up.node)?
                .outputs()
                .iter()
                .position(|&o| o == upstream)
                .ok_or(GraphError::UnknownPin(upstream))? as u32;
            InputSource::Upstream { node, output }
        }
        None => InputSource::Constant(RuntimeValue::from_default(p.default, p.pin_type)),
    };
    Ok(RuntimeInput {
        name: p.name.clone(),
        pin_type: p.pin_type,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ops::ArithOp;
    use crate::buffer::value::{Value, ValueKind};
    use crate::graph::id::GraphId;
    use crate::graph::ir::PinSpec;
    use crate::graph::operation::BuiltinOp;

    const F: PinType = PinType::Buffer(ValueKind::Float);

    fn add_graph() -> (IrGraph, IrNodeId, Vec<IrNodeId>) {
        let mut g = IrGraph::new(GraphId(1));
        let add = g.add_node(
            NodeKey::new(GraphId(1), "Add"),
            IrNodeKind::Struct(BuiltinOp::Arith(ArithOp::Add).into()),
        );
        g.add_input(add, PinSpec::new("A", F).with_default(Some(Value::Float(2.0)))).unwrap();
        g.add_input(add, PinSpec::new("B", F).with_default(Some(Value::Float(3.0)))).unwrap();
        let out = g.add_output(add, PinSpec::new("Result", F)).unwrap();
        let root = g.add_node(NodeKey::new(GraphId(1), "Root"), IrNodeKind::Root);
        let value = g.add_input(root, PinSpec::new("Value", F)).unwrap();
        g.make_link(out, value).unwrap();
        (g, root, vec![add, root])
    }

    #[test]
    fn test_build_wires_upstream_and_constants() {
        let (g, root, order) = add_graph();
        let target = GraphPinRef::new(GraphId(1), "Add", "Result");
        let exec = Executor::build(7, target, &g, root, &order, CompileStats::default()).unwrap();

        assert_eq!(exec.num_nodes(), 1);
        assert!(exec.contains_node("Add"));
        assert_eq!(exec.root_type(), Some(F));
        let add = exec.node(0).unwrap();
        assert!(matches!(add.inputs[0].source, InputSource::Constant(_)));
        assert_eq!(exec.stats().runtime_nodes, 1);
    }

    #[test]
    fn test_empty_executor_is_not_identical_to_built() {
        let (g, root, order) = add_graph();
        let target = GraphPinRef::new(GraphId(1), "Add", "Result");
        let built = Executor::build(1, target.clone(), &g, root, &order, CompileStats::default()).unwrap();
        let rebuilt = Executor::build(2, target.clone(), &g, root, &order, CompileStats::default()).unwrap();
        let empty = Executor::empty(3, target);

        assert!(built.is_identical(&rebuilt));
        assert!(!built.is_identical(&empty));
        assert!(!empty.has_root());
    }

    #[test]
    fn test_passthrough_is_rejected() {
        let (mut g, root, mut order) = add_graph();
        let pass = g.add_node(NodeKey::new(GraphId(1), "Pass"), IrNodeKind::Passthrough);
        order.insert(0, pass);
        let err = Executor::build(1, GraphPinRef::new(GraphId(1), "Add", "Result"), &g, root, &order, CompileStats::default());
        assert!(matches!(err, Err(GraphError::Internal(_))));
    }
}

//! Mutable intermediate representation used by the compiler passes.
//!
//! Nodes and pins live in slot maps and are addressed by generational keys.
//! Links are stored symmetrically in a side table: if `a` lists `b` then `b`
//! lists `a`. Every mutation goes through [`IrGraph`] so the two ends never
//! disagree.

use std::sync::Arc;

use slotmap::{SecondaryMap, SlotMap};
use smallvec::SmallVec;

use crate::buffer::value::Value;
use crate::graph::error::{GraphError, GraphResult};
use crate::graph::id::{GraphId, IrNodeId, IrPinId, NodeKey};
use crate::graph::operation::Operation;
use crate::graph::types::{PinDirection, PinFlags, PinType};

#[derive(Debug, Clone)]
pub enum IrNodeKind {
    /// The single sink of a graph being compiled. Its one input is the
    /// compile target.
    Root,
    Struct(Operation),
    /// Input `i` forwards to output `i`. Removed before execution.
    Passthrough,
}

#[derive(Debug, Clone)]
pub struct IrNode {
    pub key: NodeKey,
    pub kind: IrNodeKind,
    inputs: SmallVec<[IrPinId; 4]>,
    outputs: SmallVec<[IrPinId; 2]>,
}

impl IrNode {
    pub fn inputs(&self) -> &[IrPinId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[IrPinId] {
        &self.outputs
    }

    pub fn operation(&self) -> Option<&Operation> {
        match &self.kind {
            IrNodeKind::Struct(op) => Some(op),
            _ => None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self.kind, IrNodeKind::Passthrough)
    }
}

#[derive(Debug, Clone)]
pub struct IrPin {
    pub node: IrNodeId,
    pub name: Arc<str>,
    pub pin_type: PinType,
    pub direction: PinDirection,
    pub default: Option<Value>,
    pub flags: PinFlags,
}

/// Description of a pin to add.
#[derive(Debug, Clone)]
pub struct PinSpec {
    pub name: Arc<str>,
    pub pin_type: PinType,
    pub default: Option<Value>,
    pub flags: PinFlags,
}

impl PinSpec {
    pub fn new(name: impl Into<Arc<str>>, pin_type: PinType) -> Self {
        Self {
            name: name.into(),
            pin_type,
            default: None,
            flags: PinFlags::NONE,
        }
    }

    pub fn with_default(mut self, default: Option<Value>) -> Self {
        self.default = default;
        self
    }

    pub fn with_flags(mut self, flags: PinFlags) -> Self {
        self.flags = flags;
        self
    }
}

type LinkList = SmallVec<[IrPinId; 2]>;

#[derive(Debug, Clone, Default)]
pub struct IrGraph {
    graph: GraphId,
    nodes: SlotMap<IrNodeId, IrNode>,
    pins: SlotMap<IrPinId, IrPin>,
    links: SecondaryMap<IrPinId, LinkList>,
    next_instance: u32,
}

impl IrGraph {
    pub fn new(graph: GraphId) -> Self {
        Self {
            graph,
            ..Default::default()
        }
    }

    pub fn graph_id(&self) -> GraphId {
        self.graph
    }

    // ── Nodes ──

    pub fn add_node(&mut self, key: NodeKey, kind: IrNodeKind) -> IrNodeId {
        self.nodes.insert(IrNode {
            key,
            kind,
            inputs: SmallVec::new(),
            outputs: SmallVec::new(),
        })
    }

    pub fn node(&self, id: IrNodeId) -> GraphResult<&IrNode> {
        self.nodes.get(id).ok_or(GraphError::UnknownNode(id))
    }

    pub fn node_mut(&mut self, id: IrNodeId) -> GraphResult<&mut IrNode> {
        self.nodes.get_mut(id).ok_or(GraphError::UnknownNode(id))
    }

    pub fn contains_node(&self, id: IrNodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (IrNodeId, &IrNode)> {
        self.nodes.iter()
    }

    /// Snapshot of node ids, for passes that mutate while iterating.
    pub fn node_ids(&self) -> Vec<IrNodeId> {
        self.nodes.keys().collect()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_pins(&self) -> usize {
        self.pins.len()
    }

    pub fn num_links(&self) -> usize {
        self.links.values().map(|l| l.len()).sum::<usize>() / 2
    }

    pub fn find_node(&self, key: &NodeKey) -> Option<IrNodeId> {
        self.nodes.iter().find(|(_, n)| &n.key == key).map(|(id, _)| id)
    }

    /// Next free template instance index.
    pub fn allocate_instance(&mut self) -> u32 {
        self.next_instance += 1;
        self.next_instance
    }

    /// Remove a node, its pins and every link touching them.
    pub fn remove_node(&mut self, id: IrNodeId) -> GraphResult<IrNode> {
        let node = self.nodes.remove(id).ok_or(GraphError::UnknownNode(id))?;
        for &pin in node.inputs.iter().chain(node.outputs.iter()) {
            self.break_all_links(pin);
            self.links.remove(pin);
            self.pins.remove(pin);
        }
        Ok(node)
    }

    // ── Pins ──

    pub fn add_pin(&mut self, node: IrNodeId, direction: PinDirection, spec: PinSpec) -> GraphResult<IrPinId> {
        if !self.nodes.contains_key(node) {
            return Err(GraphError::UnknownNode(node));
        }
        let pin = self.pins.insert(IrPin {
            node,
            name: spec.name,
            pin_type: spec.pin_type,
            direction,
            default: spec.default,
            flags: spec.flags,
        });
        self.links.insert(pin, SmallVec::new());
        let n = self.node_mut(node)?;
        match direction {
            PinDirection::Input => n.inputs.push(pin),
            PinDirection::Output => n.outputs.push(pin),
        }
        Ok(pin)
    }

    pub fn add_input(&mut self, node: IrNodeId, spec: PinSpec) -> GraphResult<IrPinId> {
        self.add_pin(node, PinDirection::Input, spec)
    }

    pub fn add_output(&mut self, node: IrNodeId, spec: PinSpec) -> GraphResult<IrPinId> {
        self.add_pin(node, PinDirection::Output, spec)
    }

    pub fn pin(&self, id: IrPinId) -> GraphResult<&IrPin> {
        self.pins.get(id).ok_or(GraphError::UnknownPin(id))
    }

    pub fn pin_mut(&mut self, id: IrPinId) -> GraphResult<&mut IrPin> {
        self.pins.get_mut(id).ok_or(GraphError::UnknownPin(id))
    }

    pub fn pins(&self) -> impl Iterator<Item = (IrPinId, &IrPin)> {
        self.pins.iter()
    }

    pub fn find_input(&self, node: IrNodeId, name: &str) -> Option<IrPinId> {
        let n = self.nodes.get(node)?;
        n.inputs.iter().copied().find(|&p| &*self.pins[p].name == name)
    }

    pub fn find_output(&self, node: IrNodeId, name: &str) -> Option<IrPinId> {
        let n = self.nodes.get(node)?;
        n.outputs.iter().copied().find(|&p| &*self.pins[p].name == name)
    }

    // ── Links ──

    pub fn links(&self, pin: IrPinId) -> &[IrPinId] {
        self.links.get(pin).map(|l| l.as_slice()).unwrap_or(&[])
    }

    pub fn is_linked(&self, pin: IrPinId) -> bool {
        !self.links(pin).is_empty()
    }

    /// Link two pins of opposite direction. Linking twice is a no-op.
    pub fn make_link(&mut self, a: IrPinId, b: IrPinId) -> GraphResult<()> {
        let (pa, pb) = (self.pin(a)?, self.pin(b)?);
        if pa.direction == pb.direction {
            return Err(GraphError::InvalidLink(format!(
                "{}.{} and {}.{} have the same direction",
                self.nodes[pa.node].key, pa.name, self.nodes[pb.node].key, pb.name
            )));
        }
        if self.links(a).contains(&b) {
            return Ok(());
        }
        if let Some(l) = self.links.get_mut(a) {
            l.push(b);
        }
        if let Some(l) = self.links.get_mut(b) {
            l.push(a);
        }
        Ok(())
    }

    pub fn break_link(&mut self, a: IrPinId, b: IrPinId) {
        if let Some(l) = self.links.get_mut(a) {
            l.retain(|p| *p != b);
        }
        if let Some(l) = self.links.get_mut(b) {
            l.retain(|p| *p != a);
        }
    }

    pub fn break_all_links(&mut self, pin: IrPinId) {
        let others: LinkList = self.links.get(pin).cloned().unwrap_or_default();
        for other in others {
            self.break_link(pin, other);
        }
    }

    /// Give input `to` the same upstream links and default as input `from`.
    pub fn copy_input_pin_to(&mut self, from: IrPinId, to: IrPinId) -> GraphResult<()> {
        let default = self.pin(from)?.default;
        self.pin_mut(to)?.default = default;
        let upstream: LinkList = self.links(from).iter().copied().collect();
        for source in upstream {
            self.make_link(source, to)?;
        }
        Ok(())
    }

    /// Link output `to` to every input that output `from` feeds.
    pub fn copy_output_pin_to(&mut self, from: IrPinId, to: IrPinId) -> GraphResult<()> {
        let downstream: LinkList = self.links(from).iter().copied().collect();
        for target in downstream {
            self.make_link(to, target)?;
        }
        Ok(())
    }

    /// Nodes feeding any input of `node`, without duplicates.
    pub fn upstream_nodes(&self, node: IrNodeId) -> SmallVec<[IrNodeId; 4]> {
        let mut out = SmallVec::new();
        if let Some(n) = self.nodes.get(node) {
            for &input in &n.inputs {
                for &source in self.links(input) {
                    let owner = self.pins[source].node;
                    if !out.contains(&owner) {
                        out.push(owner);
                    }
                }
            }
        }
        out
    }

    /// Nodes fed by any output of `node`, without duplicates.
    pub fn downstream_nodes(&self, node: IrNodeId) -> SmallVec<[IrNodeId; 4]> {
        let mut out = SmallVec::new();
        if let Some(n) = self.nodes.get(node) {
            for &output in &n.outputs {
                for &target in self.links(output) {
                    let owner = self.pins[target].node;
                    if !out.contains(&owner) {
                        out.push(owner);
                    }
                }
            }
        }
        out
    }

    /// Human readable `node.pin` for diagnostics.
    pub fn describe_pin(&self, pin: IrPinId) -> String {
        match self.pins.get(pin) {
            Some(p) => format!("{}.{}", self.nodes[p.node].key, p.name),
            None => format!("{pin:?}"),
        }
    }

    // ── Signature ──

    /// Order-independent structural description of the graph.
    pub fn signature(&self) -> GraphSignature {
        let mut nodes: Vec<NodeSignature> = self
            .nodes
            .values()
            .map(|n| {
                let kind = match &n.kind {
                    IrNodeKind::Root => "Root".to_string(),
                    IrNodeKind::Passthrough => "Passthrough".to_string(),
                    IrNodeKind::Struct(op) => op.signature(),
                };
                let pins = n
                    .inputs
                    .iter()
                    .chain(n.outputs.iter())
                    .map(|&p| {
                        let pin = &self.pins[p];
                        PinSignature {
                            name: pin.name.clone(),
                            direction: pin.direction,
                            pin_type: pin.pin_type,
                            default: pin.default.map(|v| v.ordered_bits()),
                        }
                    })
                    .collect();
                NodeSignature {
                    key: n.key.clone(),
                    kind,
                    pins,
                }
            })
            .collect();
        nodes.sort();

        let mut links: Vec<LinkSignature> = Vec::new();
        for (id, pin) in self.pins.iter() {
            if pin.direction != PinDirection::Output {
                continue;
            }
            for &target in self.links(id) {
                let t = &self.pins[target];
                links.push(LinkSignature {
                    from: (self.nodes[pin.node].key.clone(), pin.name.clone()),
                    to: (self.nodes[t.node].key.clone(), t.name.clone()),
                });
            }
        }
        links.sort();

        GraphSignature { nodes, links }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PinSignature {
    name: Arc<str>,
    direction: PinDirection,
    pin_type: PinType,
    default: Option<(u8, [u64; 3])>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeSignature {
    key: NodeKey,
    kind: String,
    pins: Vec<PinSignature>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkSignature {
    from: (NodeKey, Arc<str>),
    to: (NodeKey, Arc<str>),
}

/// Structural identity of a compiled graph. Two executors whose signatures
/// are equal compute the same thing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct GraphSignature {
    nodes: Vec<NodeSignature>,
    links: Vec<LinkSignature>,
}

impl GraphSignature {
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_links(&self) -> usize {
        self.links.len()
    }
}

//! Template expansion routines.
//!
//! Each expansion first wraps the template node in a passthrough so the
//! rewritten region has a clear boundary, builds the replacement between
//! the passthrough's outputs and inputs, then removes the template node.
//! The passthrough itself is dropped later by `remove_passthroughs`.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::buffer::ops::ArithOp;
use crate::graph::error::{GraphError, GraphResult};
use crate::graph::id::{IrNodeId, IrPinId, NodeKey};
use crate::graph::ir::{IrGraph, IrNodeKind, PinSpec};
use crate::graph::operation::BuiltinOp;
use crate::graph::types::{PinDirection, PinType};

/// Passthrough placed around a template node.
struct Boundary {
    /// Template input name to the passthrough output carrying it.
    inputs: FxHashMap<Arc<str>, IrPinId>,
    /// Template output name to the passthrough input that must receive it.
    outputs: FxHashMap<Arc<str>, IrPinId>,
    instance: u32,
}

fn wrap_in_passthrough(graph: &mut IrGraph, template: IrNodeId) -> GraphResult<Boundary> {
    let node = graph.node(template)?.clone();
    let instance = graph.allocate_instance();
    let key = NodeKey::new(node.key.graph, format!("{}/Passthrough", node.key.node)).with_instance(instance);
    let pt = graph.add_node(key, IrNodeKind::Passthrough);

    let mut boundary = Boundary {
        inputs: FxHashMap::default(),
        outputs: FxHashMap::default(),
        instance,
    };

    for &pin in node.inputs() {
        let p = graph.pin(pin)?.clone();
        let pt_in = graph.add_input(pt, PinSpec::new(format!("Input{}", p.name), p.pin_type))?;
        let pt_out = graph.add_output(pt, PinSpec::new(p.name.clone(), p.pin_type))?;
        graph.copy_input_pin_to(pin, pt_in)?;
        boundary.inputs.insert(p.name, pt_out);
    }
    for &pin in node.outputs() {
        let p = graph.pin(pin)?.clone();
        let pt_in = graph.add_input(pt, PinSpec::new(p.name.clone(), p.pin_type))?;
        let pt_out = graph.add_output(pt, PinSpec::new(format!("Output{}", p.name), p.pin_type))?;
        graph.copy_output_pin_to(pin, pt_out)?;
        boundary.outputs.insert(p.name, pt_in);
    }

    graph.remove_node(template)?;
    Ok(boundary)
}

fn add_arith(
    graph: &mut IrGraph,
    key: NodeKey,
    op: ArithOp,
    ty: PinType,
) -> GraphResult<(IrPinId, IrPinId, IrPinId)> {
    let id = graph.add_node(key, IrNodeKind::Struct(BuiltinOp::Arith(op).into()));
    let a = graph.add_input(id, PinSpec::new("A", ty))?;
    let b = graph.add_input(id, PinSpec::new("B", ty))?;
    let out = graph.add_output(id, PinSpec::new("Result", ty))?;
    Ok((a, b, out))
}

fn boundary_pin(map: &FxHashMap<Arc<str>, IrPinId>, name: &str) -> GraphResult<IrPinId> {
    map.get(name)
        .copied()
        .ok_or_else(|| GraphError::Internal(format!("template pin '{name}' missing")))
}

/// `Lerp(A, B, Alpha)` becomes `A + (B - A) * Alpha`.
pub fn expand_lerp(graph: &mut IrGraph, template: IrNodeId) -> GraphResult<()> {
    let base = graph.node(template)?.key.clone();
    let ty = graph
        .find_output(template, "Result")
        .map(|p| graph.pin(p).map(|p| p.pin_type))
        .transpose()?
        .unwrap_or(PinType::Wildcard);

    let boundary = wrap_in_passthrough(graph, template)?;
    let a = boundary_pin(&boundary.inputs, "A")?;
    let b = boundary_pin(&boundary.inputs, "B")?;
    let alpha = boundary_pin(&boundary.inputs, "Alpha")?;
    let result = boundary_pin(&boundary.outputs, "Result")?;

    let part = |name: &str| NodeKey::new(base.graph, format!("{}/{name}", base.node)).with_instance(boundary.instance);

    let (sub_a, sub_b, sub_out) = add_arith(graph, part("Subtract"), ArithOp::Subtract, ty)?;
    graph.make_link(b, sub_a)?;
    graph.make_link(a, sub_b)?;

    let (mul_a, mul_b, mul_out) = add_arith(graph, part("Multiply"), ArithOp::Multiply, ty)?;
    graph.make_link(sub_out, mul_a)?;
    graph.make_link(alpha, mul_b)?;

    let (add_a, add_b, add_out) = add_arith(graph, part("Add"), ArithOp::Add, ty)?;
    graph.make_link(a, add_a)?;
    graph.make_link(mul_out, add_b)?;
    graph.make_link(add_out, result)?;
    Ok(())
}

/// Copy `body` into `graph` in place of an inline macro node. Graph inputs
/// of the body are fed from the macro's inputs, graph outputs feed the
/// macro's consumers.
pub fn expand_inline(graph: &mut IrGraph, template: IrNodeId, body: &IrGraph) -> GraphResult<()> {
    let boundary = wrap_in_passthrough(graph, template)?;

    let mut pin_map: FxHashMap<IrPinId, IrPinId> = FxHashMap::default();
    let mut graph_inputs = Vec::new();
    let mut graph_outputs = Vec::new();

    for (_, node) in body.nodes() {
        if matches!(node.kind, IrNodeKind::Root) {
            continue;
        }
        let copy = graph.add_node(node.key.clone().with_instance(boundary.instance), node.kind.clone());
        for &pin in node.inputs().iter().chain(node.outputs().iter()) {
            let p = body.pin(pin)?;
            let spec = PinSpec::new(p.name.clone(), p.pin_type)
                .with_default(p.default)
                .with_flags(p.flags);
            pin_map.insert(pin, graph.add_pin(copy, p.direction, spec)?);
        }
        match node.operation().and_then(|op| op.as_builtin()) {
            Some(BuiltinOp::GraphInput { name, .. }) => graph_inputs.push((copy, name.clone())),
            Some(BuiltinOp::GraphOutput { name }) => graph_outputs.push((copy, name.clone())),
            _ => {}
        }
    }

    for (id, pin) in body.pins() {
        if pin.direction != PinDirection::Output {
            continue;
        }
        for target in body.links(id) {
            if let (Some(&from), Some(&to)) = (pin_map.get(&id), pin_map.get(target)) {
                graph.make_link(from, to)?;
            }
        }
    }

    for (node, name) in graph_inputs {
        let Some(&source) = boundary.inputs.get(&name) else {
            continue;
        };
        let outputs = graph.node(node)?.outputs().to_vec();
        for output in outputs {
            for consumer in graph.links(output).to_vec() {
                graph.break_link(output, consumer);
                graph.make_link(source, consumer)?;
            }
        }
        graph.remove_node(node)?;
    }

    for (node, name) in graph_outputs {
        if let Some(&sink) = boundary.outputs.get(&name) {
            if let Some(&value) = graph.node(node)?.inputs().first() {
                graph.copy_input_pin_to(value, sink)?;
            }
        }
        graph.remove_node(node)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::value::{Value, ValueKind};
    use crate::graph::id::GraphId;

    const F: PinType = PinType::Buffer(ValueKind::Float);

    fn abs(graph: &mut IrGraph, name: &str) -> (IrNodeId, IrPinId, IrPinId) {
        let id = graph.add_node(NodeKey::new(graph.graph_id(), name), IrNodeKind::Struct(BuiltinOp::Abs.into()));
        let i = graph.add_input(id, PinSpec::new("Value", F)).unwrap();
        let o = graph.add_output(id, PinSpec::new("Result", F)).unwrap();
        (id, i, o)
    }

    #[test]
    fn test_lerp_expands_into_arithmetic() {
        let mut g = IrGraph::new(GraphId(0));
        let (_, _, src) = abs(&mut g, "Src");
        let (_, sink, _) = abs(&mut g, "Sink");
        let lerp = g.add_node(NodeKey::new(GraphId(0), "Lerp"), IrNodeKind::Struct(BuiltinOp::Lerp.into()));
        let a = g.add_input(lerp, PinSpec::new("A", F)).unwrap();
        g.add_input(lerp, PinSpec::new("B", F).with_default(Some(Value::Float(10.0)))).unwrap();
        g.add_input(lerp, PinSpec::new("Alpha", F).with_default(Some(Value::Float(0.5)))).unwrap();
        let out = g.add_output(lerp, PinSpec::new("Result", F)).unwrap();
        g.make_link(src, a).unwrap();
        g.make_link(out, sink).unwrap();

        expand_lerp(&mut g, lerp).unwrap();
        assert!(!g.contains_node(lerp));

        let mut kinds: Vec<_> = g
            .nodes()
            .filter_map(|(_, n)| n.operation().map(|op| op.name().to_string()))
            .collect();
        kinds.sort();
        assert_eq!(kinds, vec!["Abs", "Abs", "Add", "Multiply", "Subtract"]);
        assert_eq!(g.nodes().filter(|(_, n)| n.is_passthrough()).count(), 1);

        crate::graph::passes::remove_passthroughs(&mut g).unwrap();
        // Sink is now fed by the Add node, whose A input reads Src directly.
        let add_out = g.links(sink)[0];
        let add = g.pin(add_out).unwrap().node;
        assert_eq!(g.node(add).unwrap().operation().unwrap().name(), "Add");
        let add_a = g.find_input(add, "A").unwrap();
        assert_eq!(g.links(add_a), &[src]);
    }

    #[test]
    fn test_inline_replaces_inputs_and_outputs() {
        // Body: Input "X" -> Abs -> Output "Y"
        let mut body = IrGraph::new(GraphId(7));
        let input = body.add_node(
            NodeKey::new(GraphId(7), "In"),
            IrNodeKind::Struct(
                BuiltinOp::GraphInput {
                    name: "X".into(),
                    default: None,
                    has_default_pin: false,
                }
                .into(),
            ),
        );
        let input_out = body.add_output(input, PinSpec::new("Value", F)).unwrap();
        let (_, abs_in, abs_out) = abs(&mut body, "Abs");
        let output = body.add_node(
            NodeKey::new(GraphId(7), "Output.y"),
            IrNodeKind::Struct(BuiltinOp::GraphOutput { name: "Y".into() }.into()),
        );
        let output_in = body.add_input(output, PinSpec::new("Value", F)).unwrap();
        body.make_link(input_out, abs_in).unwrap();
        body.make_link(abs_out, output_in).unwrap();

        let mut g = IrGraph::new(GraphId(1));
        let (_, _, src) = abs(&mut g, "Src");
        let (_, sink, _) = abs(&mut g, "Sink");
        let call = g.add_node(
            NodeKey::new(GraphId(1), "Call"),
            IrNodeKind::Struct(BuiltinOp::InlineGraph { graph: GraphId(7) }.into()),
        );
        let x = g.add_input(call, PinSpec::new("X", F)).unwrap();
        let y = g.add_output(call, PinSpec::new("Y", F)).unwrap();
        g.make_link(src, x).unwrap();
        g.make_link(y, sink).unwrap();

        expand_inline(&mut g, call, &body).unwrap();
        crate::graph::passes::remove_passthroughs(&mut g).unwrap();

        assert_eq!(g.num_nodes(), 3);
        let inlined_out = g.links(sink)[0];
        let inlined = g.pin(inlined_out).unwrap().node;
        let key = &g.node(inlined).unwrap().key;
        assert_eq!(key.graph, GraphId(7));
        assert!(key.instance.is_some());
        let inlined_in = g.find_input(inlined, "Value").unwrap();
        assert_eq!(g.links(inlined_in), &[src]);
    }
}

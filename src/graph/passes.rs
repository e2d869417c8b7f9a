//! IR rewrite passes.
//!
//! Passes run in a fixed order (see [`GraphCompiler`](super::compiler::GraphCompiler)).
//! A pass that finds user errors reports them to the [`DiagnosticScope`] and
//! returns [`GraphError::PassFailed`], which aborts the compile.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::buffer::value::{Value, ValueKind};
use crate::diagnostics::DiagnosticScope;
use crate::graph::error::{GraphError, GraphResult};
use crate::graph::id::{GraphId, IrNodeId, IrPinId, NodeKey};
use crate::graph::ir::{IrGraph, IrNodeKind, PinSpec};
use crate::graph::operation::BuiltinOp;
use crate::graph::types::{PinDirection, PinType};

fn fail(pass: &'static str, errors: usize) -> GraphError {
    GraphError::PassFailed { pass, errors }
}

// ==================== Remove unused nodes ====================

/// Prune every node not backward-reachable from `root` through input links.
/// Returns the number of removed nodes.
pub fn remove_unused_nodes(graph: &mut IrGraph, root: IrNodeId) -> GraphResult<usize> {
    let mut reachable = FxHashSet::default();
    let mut stack = vec![root];
    reachable.insert(root);

    while let Some(node) = stack.pop() {
        for upstream in graph.upstream_nodes(node) {
            if reachable.insert(upstream) {
                stack.push(upstream);
            }
        }
    }

    let mut removed = 0;
    for id in graph.node_ids() {
        if !reachable.contains(&id) {
            graph.remove_node(id)?;
            removed += 1;
        }
    }
    Ok(removed)
}

// ==================== Checks ====================

pub fn check_wildcards(graph: &IrGraph, diags: &mut DiagnosticScope) -> GraphResult<()> {
    let mut errors = 0;
    for (_, pin) in graph.pins() {
        if pin.pin_type.is_wildcard() {
            let key = &graph.node(pin.node)?.key;
            diags.pin_error(key, &pin.name, "Wildcard pin type was never resolved");
            errors += 1;
        }
    }
    if errors > 0 {
        return Err(fail("check-wildcards", errors));
    }
    Ok(())
}

pub fn check_no_default(graph: &IrGraph, diags: &mut DiagnosticScope) -> GraphResult<()> {
    let mut errors = 0;
    for (id, pin) in graph.pins() {
        if pin.direction == PinDirection::Input && pin.flags.must_connect && !graph.is_linked(id) {
            let key = &graph.node(pin.node)?.key;
            diags.pin_error(key, &pin.name, "Pin must be connected");
            errors += 1;
        }
    }
    if errors > 0 {
        return Err(fail("check-no-default", errors));
    }
    Ok(())
}

// ==================== Sort ====================

/// Topological order, peeled in rounds. Doubles as the cycle check: when a
/// round peels nothing, the remaining nodes that lie on a cycle are
/// reported, one diagnostic per node.
pub fn sort_nodes(graph: &IrGraph, diags: &mut DiagnosticScope) -> GraphResult<Vec<IrNodeId>> {
    let mut pending: FxHashMap<IrNodeId, usize> = FxHashMap::default();
    for (id, _) in graph.nodes() {
        pending.insert(id, graph.upstream_nodes(id).len());
    }

    let mut order = Vec::with_capacity(pending.len());
    let mut ready: VecDeque<IrNodeId> = pending
        .iter()
        .filter(|&(_, &n)| n == 0)
        .map(|(&id, _)| id)
        .collect();

    while !ready.is_empty() {
        let round: Vec<_> = ready.drain(..).collect();
        for id in round {
            pending.remove(&id);
            order.push(id);
            for down in graph.downstream_nodes(id) {
                if let Some(n) = pending.get_mut(&down) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push_back(down);
                    }
                }
            }
        }
    }

    if pending.is_empty() {
        return Ok(order);
    }

    // Nodes downstream of a cycle are stuck too. Peel those off from the
    // other end so only nodes on a cycle remain.
    let mut remaining: FxHashSet<IrNodeId> = pending.keys().copied().collect();
    loop {
        let dangling: Vec<_> = remaining
            .iter()
            .copied()
            .filter(|&id| !graph.downstream_nodes(id).iter().any(|d| remaining.contains(d)))
            .collect();
        if dangling.is_empty() {
            break;
        }
        for id in dangling {
            remaining.remove(&id);
        }
    }

    let mut keys: Vec<NodeKey> = remaining
        .iter()
        .filter_map(|&id| graph.node(id).ok().map(|n| n.key.clone()))
        .collect();
    keys.sort();
    let names = keys.iter().map(|k| k.node.to_string()).collect::<Vec<_>>().join(", ");
    for key in &keys {
        diags.error(key, format!("Loop in a graph: {names}"));
    }
    Err(fail("sort-nodes", keys.len()))
}

// ==================== Templates ====================

/// Supplies translated IR of graphs referenced by template-mode macros.
pub trait TemplateResolver {
    fn resolve(&self, graph: GraphId, diags: &mut DiagnosticScope) -> GraphResult<std::sync::Arc<IrGraph>>;
}

/// Expand template nodes until none are left. Returns the number of
/// expansions.
pub fn replace_templates(
    graph: &mut IrGraph,
    resolver: &dyn TemplateResolver,
    diags: &mut DiagnosticScope,
    limit: usize,
) -> GraphResult<usize> {
    let mut expansions = 0;
    loop {
        let next = graph.nodes().find_map(|(id, n)| match &n.kind {
            IrNodeKind::Struct(op) if op.is_template() => Some((id, op.as_builtin().cloned())),
            _ => None,
        });
        let Some((id, op)) = next else {
            break;
        };

        expansions += 1;
        if expansions > limit {
            let key = graph.node(id)?.key.clone();
            diags.error(&key, format!("Template expansion limit of {limit} reached"));
            return Err(GraphError::TemplateLimit(limit));
        }

        match op {
            Some(BuiltinOp::Lerp) => super::templates::expand_lerp(graph, id)?,
            Some(BuiltinOp::InlineGraph { graph: callee }) => {
                let body = resolver.resolve(callee, diags)?;
                super::templates::expand_inline(graph, id, &body)?;
            }
            _ => {
                return Err(GraphError::Internal(format!(
                    "template node {} has no expansion",
                    graph.node(id)?.key
                )))
            }
        }
    }
    Ok(expansions)
}

// ==================== Passthroughs ====================

/// Rewire every consumer of a passthrough output to the passthrough's own
/// upstream source, then drop the passthrough. Returns the number removed.
pub fn remove_passthroughs(graph: &mut IrGraph) -> GraphResult<usize> {
    let passthroughs: Vec<_> = graph
        .nodes()
        .filter(|(_, n)| n.is_passthrough())
        .map(|(id, _)| id)
        .collect();

    for &id in &passthroughs {
        let node = graph.node(id)?;
        let pairs: Vec<(IrPinId, IrPinId)> = node
            .inputs()
            .iter()
            .copied()
            .zip(node.outputs().iter().copied())
            .collect();
        for (input, output) in pairs {
            let consumers: Vec<_> = graph.links(output).to_vec();
            for consumer in consumers {
                graph.break_link(output, consumer);
                graph.copy_input_pin_to(input, consumer)?;
            }
        }
        graph.remove_node(id)?;
    }
    Ok(passthroughs.len())
}

// ==================== Virtual pins ====================

/// Cut links into virtual pins and reset them to their declared default.
pub fn disconnect_virtual_pins(graph: &mut IrGraph) -> GraphResult<usize> {
    let virtual_pins: Vec<_> = graph
        .pins()
        .filter(|(_, p)| p.direction == PinDirection::Input && p.flags.virtual_pin)
        .map(|(id, _)| id)
        .collect();

    let mut disconnected = 0;
    for pin in virtual_pins {
        if graph.is_linked(pin) {
            graph.break_all_links(pin);
            disconnected += 1;
        }
        let p = graph.pin_mut(pin)?;
        if p.default.is_none() {
            p.default = p.pin_type.value_kind().map(Value::type_default);
        }
    }
    Ok(disconnected)
}

// ==================== Exec output ====================

/// Name of the synthesized root-execute node.
pub const ROOT_EXECUTE_NODE: &str = "RootExecute";

/// Collect every exec output nobody consumes, plus the sources of explicit
/// `Execute` markers, into one merge node feeding a single `RootExecute`.
/// Returns the `RootExecute` node.
pub fn add_exec_output(graph: &mut IrGraph) -> GraphResult<IrNodeId> {
    let markers: Vec<_> = graph
        .nodes()
        .filter(|(_, n)| matches!(n.operation().and_then(|op| op.as_builtin()), Some(BuiltinOp::Execute)))
        .map(|(id, _)| id)
        .collect();
    for marker in markers {
        graph.remove_node(marker)?;
    }

    let mut sources: Vec<(NodeKey, IrPinId)> = graph
        .pins()
        .filter(|(id, p)| p.direction == PinDirection::Output && p.pin_type.is_exec() && !graph.is_linked(*id))
        .filter_map(|(id, p)| graph.node(p.node).ok().map(|n| (n.key.clone(), id)))
        .collect();
    // Deterministic merge order regardless of arena layout.
    sources.sort_by(|a, b| a.0.cmp(&b.0));

    let graph_id = graph.graph_id();
    let merge = graph.add_node(
        NodeKey::new(graph_id, format!("Execs_{}", sources.len())),
        IrNodeKind::Struct(
            BuiltinOp::MergeExec {
                inputs: sources.len() as u32,
            }
            .into(),
        ),
    );
    for (i, (_, source)) in sources.iter().enumerate() {
        let input = graph.add_input(merge, PinSpec::new(format!("Exec{i}"), PinType::Exec))?;
        graph.make_link(*source, input)?;
    }
    let merged = graph.add_output(merge, PinSpec::new("Exec", PinType::Exec))?;

    let root_exec = graph.add_node(
        NodeKey::new(graph_id, ROOT_EXECUTE_NODE),
        IrNodeKind::Struct(BuiltinOp::RootExecute.into()),
    );
    let exec_in = graph.add_input(root_exec, PinSpec::new("ExecIn", PinType::Exec))?;
    graph.add_input(
        root_exec,
        PinSpec::new("EnableNode", PinType::Scalar(ValueKind::Bool)).with_default(Some(Value::Bool(true))),
    )?;
    graph.add_output(root_exec, PinSpec::new("Exec", PinType::Exec))?;
    graph.make_link(merged, exec_in)?;

    Ok(root_exec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::operation::Operation;
    use crate::graph::types::PinFlags;

    const F: PinType = PinType::Buffer(ValueKind::Float);

    struct Builder {
        graph: IrGraph,
    }

    impl Builder {
        fn new() -> Self {
            Self {
                graph: IrGraph::new(GraphId(0)),
            }
        }

        fn node(&mut self, name: &str, op: BuiltinOp) -> IrNodeId {
            let id = self
                .graph
                .add_node(NodeKey::new(GraphId(0), name), IrNodeKind::Struct(Operation::Builtin(op.clone())));
            if let Some(schema) = op.schema() {
                for s in schema {
                    let ty = match s.ty {
                        crate::graph::types::SchemaType::Exec => PinType::Exec,
                        crate::graph::types::SchemaType::Kind(k) => PinType::Buffer(k),
                        crate::graph::types::SchemaType::AnyData => F,
                    };
                    let spec = PinSpec::new(s.name, ty).with_default(s.default).with_flags(s.flags);
                    self.graph.add_pin(id, s.direction, spec).unwrap();
                }
            }
            id
        }

        fn root(&mut self) -> (IrNodeId, IrPinId) {
            let id = self.graph.add_node(NodeKey::new(GraphId(0), "Root"), IrNodeKind::Root);
            let pin = self.graph.add_input(id, PinSpec::new("Value", F)).unwrap();
            (id, pin)
        }

        fn link(&mut self, from: IrNodeId, out: &str, to: IrNodeId, input: &str) {
            let a = self.graph.find_output(from, out).unwrap();
            let b = self.graph.find_input(to, input).unwrap();
            self.graph.make_link(a, b).unwrap();
        }
    }

    fn names(graph: &IrGraph) -> Vec<String> {
        let mut v: Vec<_> = graph.nodes().map(|(_, n)| n.key.node.to_string()).collect();
        v.sort();
        v
    }

    #[test]
    fn test_remove_unused_keeps_root_cone() {
        let mut b = Builder::new();
        let a = b.node("A", BuiltinOp::GetPosition);
        let len = b.node("B", BuiltinOp::Length);
        let c = b.node("C", BuiltinOp::Length);
        let (root, root_in) = b.root();
        b.link(a, "Position", len, "Vector");
        b.link(a, "Position", c, "Vector");
        let out = b.graph.find_output(len, "Length").unwrap();
        b.graph.make_link(out, root_in).unwrap();

        let removed = remove_unused_nodes(&mut b.graph, root).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(names(&b.graph), vec!["A", "B", "Root"]);
        assert!(!b.graph.contains_node(c));
    }

    #[test]
    fn test_check_no_default_flags_unlinked_must_connect() {
        let mut b = Builder::new();
        b.node("Len", BuiltinOp::Length);
        let mut diags = DiagnosticScope::new();
        let err = check_no_default(&b.graph, &mut diags).unwrap_err();
        assert!(matches!(err, GraphError::PassFailed { pass: "check-no-default", errors: 1 }));
        assert_eq!(diags.messages()[0].pin.as_deref(), Some("Vector"));
    }

    #[test]
    fn test_check_wildcards() {
        let mut b = Builder::new();
        let n = b.node("Abs", BuiltinOp::Abs);
        let pin = b.graph.find_input(n, "Value").unwrap();
        b.graph.pin_mut(pin).unwrap().pin_type = PinType::Wildcard;
        let mut diags = DiagnosticScope::new();
        assert!(check_wildcards(&b.graph, &mut diags).is_err());
        assert_eq!(diags.error_count(), 1);
    }

    #[test]
    fn test_sort_orders_upstream_first() {
        let mut b = Builder::new();
        let a = b.node("A", BuiltinOp::Abs);
        let c = b.node("C", BuiltinOp::Abs);
        let bb = b.node("B", BuiltinOp::Abs);
        b.link(a, "Result", bb, "Value");
        b.link(bb, "Result", c, "Value");

        let order = sort_nodes(&b.graph, &mut DiagnosticScope::new()).unwrap();
        assert_eq!(order, vec![a, bb, c]);
    }

    #[test]
    fn test_sort_reports_only_cycle_nodes() {
        let mut b = Builder::new();
        let src = b.node("Src", BuiltinOp::GetPosition);
        let x = b.node("X", BuiltinOp::Arith(crate::buffer::ops::ArithOp::Add));
        let y = b.node("Y", BuiltinOp::Abs);
        let after = b.node("After", BuiltinOp::Abs);
        b.link(src, "Position", x, "A");
        b.link(x, "Result", y, "Value");
        b.link(y, "Result", x, "B");
        b.link(y, "Result", after, "Value");

        let mut diags = DiagnosticScope::new();
        let err = sort_nodes(&b.graph, &mut diags).unwrap_err();
        assert!(matches!(err, GraphError::PassFailed { errors: 2, .. }));
        let named: Vec<_> = diags.messages().iter().map(|d| d.node.clone().unwrap().node.to_string()).collect();
        assert_eq!(named, vec!["X", "Y"]);
        assert!(diags.messages()[0].message.starts_with("Loop in a graph"));
    }

    #[test]
    fn test_remove_passthroughs_rewires_consumers() {
        let mut b = Builder::new();
        let a = b.node("A", BuiltinOp::Abs);
        let c = b.node("C", BuiltinOp::Abs);
        let pt = b.graph.add_node(NodeKey::new(GraphId(0), "PT"), IrNodeKind::Passthrough);
        let pt_in = b.graph.add_input(pt, PinSpec::new("InputX", F)).unwrap();
        let pt_out = b.graph.add_output(pt, PinSpec::new("X", F)).unwrap();
        let a_out = b.graph.find_output(a, "Result").unwrap();
        let c_in = b.graph.find_input(c, "Value").unwrap();
        b.graph.make_link(a_out, pt_in).unwrap();
        b.graph.make_link(pt_out, c_in).unwrap();

        assert_eq!(remove_passthroughs(&mut b.graph).unwrap(), 1);
        assert_eq!(b.graph.links(c_in), &[a_out]);
        assert_eq!(b.graph.num_nodes(), 2);
    }

    #[test]
    fn test_disconnect_virtual_pins_resets_default() {
        let mut b = Builder::new();
        let src = b.node("Src", BuiltinOp::GetLod);
        let lod = b.node("Lod", BuiltinOp::GetLod);
        b.link(src, "Result", lod, "Lod");
        let pin = b.graph.find_input(lod, "Lod").unwrap();
        assert_eq!(b.graph.pin(pin).unwrap().flags, PinFlags::VIRTUAL);

        assert_eq!(disconnect_virtual_pins(&mut b.graph).unwrap(), 1);
        assert!(!b.graph.is_linked(pin));
        assert_eq!(b.graph.pin(pin).unwrap().default, Some(Value::Int(0)));
    }

    #[test]
    fn test_add_exec_output_merges_unconsumed_triggers() {
        let mut b = Builder::new();
        let e1 = b.node("E1", BuiltinOp::Emit);
        let e2 = b.node("E2", BuiltinOp::Emit);
        let marker = b.node("Mark", BuiltinOp::Execute);
        b.link(e2, "Exec", marker, "Exec");
        let _ = e1;

        let root_exec = add_exec_output(&mut b.graph).unwrap();
        assert_eq!(names(&b.graph), vec!["E1", "E2", "Execs_2", "RootExecute"]);
        let node = b.graph.node(root_exec).unwrap();
        assert_eq!(node.inputs().len(), 2);
        let enable = b.graph.find_input(root_exec, "EnableNode").unwrap();
        assert_eq!(b.graph.pin(enable).unwrap().default, Some(Value::Bool(true)));
        let exec_in = b.graph.find_input(root_exec, "ExecIn").unwrap();
        assert!(b.graph.is_linked(exec_in));
    }
}

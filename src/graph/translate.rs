//! Declarative graph to IR translation.
//!
//! Every problem found here is reported against the declarative node it
//! came from. Translation keeps going after an error so the user sees all
//! of them at once, then fails if any error was reported.

use std::collections::BTreeSet;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::buffer::value::{Value, ValueKind};
use crate::diagnostics::DiagnosticScope;
use crate::graph::compiled::{CompiledGraph, CompiledNode, CompiledNodeKind, CompiledPin, MacroMode};
use crate::graph::error::{GraphError, GraphResult};
use crate::graph::id::{GraphId, IrNodeId, IrPinId, NodeKey, OUTPUT_NODE_PREFIX};
use crate::graph::ir::{IrGraph, IrNodeKind, PinSpec};
use crate::graph::library::GraphProvider;
use crate::graph::operation::{BuiltinOp, Operation, OperationRegistry};
use crate::graph::types::{PinDirection, PinSchema, PinType, SchemaType};

/// Result of a successful translation.
#[derive(Debug, Clone)]
pub struct Translation {
    pub graph: IrGraph,
    pub referenced_graphs: BTreeSet<GraphId>,
}

type PinMap = FxHashMap<(Arc<str>, Arc<str>, PinDirection), IrPinId>;

pub struct Translator<'a> {
    registry: &'a OperationRegistry,
    provider: &'a dyn GraphProvider,
}

impl<'a> Translator<'a> {
    pub fn new(registry: &'a OperationRegistry, provider: &'a dyn GraphProvider) -> Self {
        Self { registry, provider }
    }

    pub fn translate(&self, source: &CompiledGraph, diags: &mut DiagnosticScope) -> GraphResult<Translation> {
        let errors_before = diags.error_count();
        let mut graph = IrGraph::new(source.id);
        let mut pins = PinMap::default();
        let mut referenced = BTreeSet::new();

        for node in &source.nodes {
            let key = NodeKey::new(source.id, node.node_id.as_str());
            self.check_defaults(node, &key, diags);

            let Some(op) = self.resolve_operation(source, node, &key, &mut referenced, diags) else {
                continue;
            };
            let id = graph.add_node(key.clone(), IrNodeKind::Struct(op.clone()));
            self.add_pins(&mut graph, &mut pins, id, node, &op, &key, diags)?;
        }

        self.translate_links(source, &mut graph, &pins, diags)?;

        let errors = diags.error_count() - errors_before;
        if errors > 0 {
            return Err(GraphError::TranslationFailed {
                graph: source.id,
                errors,
            });
        }
        tracing::trace!(
            "Translated graph {} into {} nodes, {} links",
            source.id,
            graph.num_nodes(),
            graph.num_links()
        );
        Ok(Translation {
            graph,
            referenced_graphs: referenced,
        })
    }

    fn check_defaults(&self, node: &CompiledNode, key: &NodeKey, diags: &mut DiagnosticScope) {
        for pin in node.input_pins.iter().chain(node.output_pins.iter()) {
            let Some(value) = pin.default_value else {
                continue;
            };
            let valid = match pin.pin_type {
                PinType::Wildcard => true,
                PinType::Exec => false,
                PinType::Scalar(k) | PinType::Buffer(k) => value.kind() == k,
            };
            if !valid {
                diags.pin_error(
                    key,
                    &pin.name,
                    format!("Invalid default value {} for pin of type {}", value, pin.pin_type),
                );
            }
        }
    }

    /// `None` means the node is skipped; an error or warning was reported.
    fn resolve_operation(
        &self,
        source: &CompiledGraph,
        node: &CompiledNode,
        key: &NodeKey,
        referenced: &mut BTreeSet<GraphId>,
        diags: &mut DiagnosticScope,
    ) -> Option<Operation> {
        match &node.kind {
            CompiledNodeKind::Struct { operation } => match self.registry.create(operation) {
                Some(op) => Some(op),
                None => {
                    let linked = node
                        .input_pins
                        .iter()
                        .chain(node.output_pins.iter())
                        .any(|p| !p.linked_to.is_empty());
                    let message = format!("Outdated node: unknown operation '{operation}'");
                    if linked {
                        diags.error(key, message);
                    } else {
                        diags.warning(key, format!("{message}, node skipped"));
                    }
                    None
                }
            },
            CompiledNodeKind::Macro { graph, mode } => {
                referenced.insert(*graph);
                let Some(callee) = self.provider.graph(*graph) else {
                    diags.error(key, format!("Outdated node: graph {graph} not found"));
                    return None;
                };
                let mut ok = true;
                for pin in &node.input_pins {
                    if callee.input_node(&pin.name).is_none() {
                        diags.pin_error(key, &pin.name, format!("Outdated node: graph {graph} has no input '{}'", pin.name));
                        ok = false;
                    }
                }
                let mut outputs = Vec::with_capacity(node.output_pins.len());
                for pin in &node.output_pins {
                    match callee.output_node(&pin.name) {
                        Some(out) => outputs.push((Arc::from(pin.name.as_str()), Arc::from(out.node_id.as_str()))),
                        None => {
                            diags.pin_error(key, &pin.name, format!("Outdated node: graph {graph} has no output '{}'", pin.name));
                            ok = false;
                        }
                    }
                }
                if !ok {
                    return None;
                }
                let op = match mode {
                    MacroMode::Template => BuiltinOp::InlineGraph { graph: *graph },
                    MacroMode::Function | MacroMode::RecursiveTemplate => BuiltinOp::CallGraph {
                        graph: *graph,
                        outputs,
                        recursive: *mode == MacroMode::RecursiveTemplate,
                    },
                };
                Some(op.into())
            }
            CompiledNodeKind::Parameter { guid } => match source.parameter(guid) {
                Some(param) => Some(
                    BuiltinOp::ParameterRead {
                        guid: Arc::from(guid.as_str()),
                        default: param.default,
                    }
                    .into(),
                ),
                None => {
                    diags.error(key, format!("Parameter '{guid}' not found"));
                    None
                }
            },
            CompiledNodeKind::Input { name, has_default_pin } => Some(
                BuiltinOp::GraphInput {
                    name: Arc::from(name.as_str()),
                    default: node.output_pins.first().and_then(|p| p.default_value),
                    has_default_pin: *has_default_pin,
                }
                .into(),
            ),
            CompiledNodeKind::Output { name } => {
                if !node.node_id.starts_with(OUTPUT_NODE_PREFIX) {
                    diags.error(
                        key,
                        format!("Output node id '{}' must start with '{OUTPUT_NODE_PREFIX}'", node.node_id),
                    );
                    return None;
                }
                Some(
                    BuiltinOp::GraphOutput {
                        name: Arc::from(name.as_str()),
                    }
                    .into(),
                )
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn add_pins(
        &self,
        graph: &mut IrGraph,
        pins: &mut PinMap,
        id: IrNodeId,
        node: &CompiledNode,
        op: &Operation,
        key: &NodeKey,
        diags: &mut DiagnosticScope,
    ) -> GraphResult<()> {
        let mut add = |graph: &mut IrGraph, direction: PinDirection, spec: PinSpec| -> GraphResult<()> {
            let name = spec.name.clone();
            let pin = graph.add_pin(id, direction, spec)?;
            pins.insert((key.node.clone(), name, direction), pin);
            Ok(())
        };

        match op.schema() {
            Some(schema) => {
                for s in schema {
                    let declared = match s.direction {
                        PinDirection::Input => node.input(s.name),
                        PinDirection::Output => node.output(s.name),
                    };
                    match declared {
                        Some(pin) if s.ty.accepts(pin.pin_type) => {
                            add(graph, s.direction, schema_pin(s, pin))?;
                        }
                        Some(pin) => {
                            diags.pin_error(
                                key,
                                s.name,
                                format!("Outdated node: pin '{}' has type {}", s.name, pin.pin_type),
                            );
                        }
                        None => {
                            diags.pin_error(key, s.name, format!("Outdated node: missing pin '{}'", s.name));
                        }
                    }
                }
                let extra = node
                    .input_pins
                    .iter()
                    .filter(|p| !schema.iter().any(|s| s.direction == PinDirection::Input && s.name == p.name))
                    .chain(
                        node.output_pins
                            .iter()
                            .filter(|p| !schema.iter().any(|s| s.direction == PinDirection::Output && s.name == p.name)),
                    );
                for pin in extra {
                    diags.pin_error(key, &pin.name, format!("Outdated node: unknown pin '{}'", pin.name));
                }
                check_any_data_kinds(node, schema, key, diags);
            }
            None => {
                for pin in &node.input_pins {
                    add(graph, PinDirection::Input, declared_pin(pin))?;
                }
                for pin in &node.output_pins {
                    add(graph, PinDirection::Output, declared_pin(pin))?;
                }
            }
        }
        Ok(())
    }

    fn translate_links(
        &self,
        source: &CompiledGraph,
        graph: &mut IrGraph,
        pins: &PinMap,
        diags: &mut DiagnosticScope,
    ) -> GraphResult<()> {
        let lookup = |node: &str, pin: &str, direction| pins.get(&(Arc::from(node), Arc::from(pin), direction)).copied();

        for node in &source.nodes {
            let key = NodeKey::new(source.id, node.node_id.as_str());

            for input in &node.input_pins {
                if input.linked_to.len() > 1 {
                    diags.pin_error(
                        &key,
                        &input.name,
                        format!("Too many pins linked: {} links into one input", input.linked_to.len()),
                    );
                }
                for end in &input.linked_to {
                    let back = source
                        .find_node(&end.node_id)
                        .and_then(|n| n.output(&end.pin))
                        .is_some_and(|p| p.linked_to.iter().any(|e| e.node_id == node.node_id && e.pin == input.name));
                    if !back {
                        diags.pin_error(
                            &key,
                            &input.name,
                            format!("Translation error: {}.{} does not link back", end.node_id, end.pin),
                        );
                    }
                }
            }

            for output in &node.output_pins {
                for end in &output.linked_to {
                    let Some(target_node) = source.find_node(&end.node_id) else {
                        diags.pin_error(&key, &output.name, format!("Translation error: node '{}' not found", end.node_id));
                        continue;
                    };
                    let Some(target_pin) = target_node.input(&end.pin) else {
                        diags.pin_error(
                            &key,
                            &output.name,
                            format!("Translation error: pin '{}.{}' not found", end.node_id, end.pin),
                        );
                        continue;
                    };
                    if !target_pin.linked_to.iter().any(|e| e.node_id == node.node_id && e.pin == output.name) {
                        diags.pin_error(
                            &key,
                            &output.name,
                            format!("Translation error: {}.{} does not link back", end.node_id, end.pin),
                        );
                        continue;
                    }
                    if !output.pin_type.can_link_to(target_pin.pin_type) {
                        diags.pin_error(
                            &key,
                            &output.name,
                            format!(
                                "Type mismatch: {} cannot link to {} ({}.{})",
                                output.pin_type, target_pin.pin_type, end.node_id, end.pin
                            ),
                        );
                        continue;
                    }
                    // Either end may belong to a skipped node.
                    let from = lookup(&node.node_id, &output.name, PinDirection::Output);
                    let to = lookup(&end.node_id, &end.pin, PinDirection::Input);
                    if let (Some(from), Some(to)) = (from, to) {
                        graph.make_link(from, to)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// The `AnyData` pins of one node resolve to a single value kind. Scalars
/// still promote to buffers of that kind.
fn check_any_data_kinds(node: &CompiledNode, schema: &[PinSchema], key: &NodeKey, diags: &mut DiagnosticScope) {
    let mut resolved: Option<(&str, ValueKind)> = None;
    for s in schema.iter().filter(|s| s.ty == SchemaType::AnyData) {
        let declared = match s.direction {
            PinDirection::Input => node.input(s.name),
            PinDirection::Output => node.output(s.name),
        };
        let Some(kind) = declared.and_then(|p| p.pin_type.value_kind()) else {
            continue;
        };
        match resolved {
            None => resolved = Some((s.name, kind)),
            Some((first, expected)) if expected != kind => {
                diags.pin_error(
                    key,
                    s.name,
                    format!("Type mismatch: pin '{}' is {kind} but '{first}' is {expected}", s.name),
                );
            }
            Some(_) => {}
        }
    }
}

fn declared_pin(pin: &CompiledPin) -> PinSpec {
    PinSpec::new(pin.name.as_str(), pin.pin_type).with_default(pin.default_value)
}

fn schema_pin(schema: &PinSchema, pin: &CompiledPin) -> PinSpec {
    let default: Option<Value> = pin.default_value.or(schema.default);
    PinSpec::new(schema.name, pin.pin_type)
        .with_default(default)
        .with_flags(schema.flags)
}

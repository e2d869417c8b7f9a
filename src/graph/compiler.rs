//! Compile driver: target selection, the pass pipeline and executor build.
//!
//! Pass order:
//! 1. remove unused nodes
//! 2. check wildcards
//! 3. check must-connect pins
//! 4. sort (cycle check)
//! 5. replace templates
//! 6. remove passthroughs
//! 7. disconnect virtual pins
//! 8. remove unused nodes again
//!
//! followed by a final sort and [`Executor::build`].

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use crate::config::DEFAULT_MAX_TEMPLATE_EXPANSIONS;
use crate::diagnostics::{Diagnostic, DiagnosticScope};
use crate::graph::cache::CompilationScope;
use crate::graph::compiled::CompiledGraph;
use crate::graph::error::{GraphError, GraphResult};
use crate::graph::id::{GraphId, GraphPinRef, IrNodeId, NodeKey};
use crate::graph::ir::{IrGraph, IrNodeKind, PinSpec};
use crate::graph::library::GraphProvider;
use crate::graph::operation::OperationRegistry;
use crate::graph::passes::{self, TemplateResolver};
use crate::graph::translate::Translator;
use crate::graph::types::PinDirection;
use crate::runtime::executor::{CompileStats, Executor};

/// Name of the synthesized root node.
pub const ROOT_NODE: &str = "Root";

/// Result of one compile.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    /// `None` when compilation failed. An executor without a root means
    /// the graph does not exist.
    pub executor: Option<Arc<Executor>>,
    pub diagnostics: Vec<Diagnostic>,
    /// Graphs this compile read, directly or through macros.
    pub referenced_graphs: BTreeSet<GraphId>,
}

impl CompileOutput {
    pub fn succeeded(&self) -> bool {
        self.executor.is_some()
    }
}

/// Resolves inline macro bodies through the compilation scope and
/// remembers which graphs were pulled in.
struct ScopeResolver<'a> {
    scope: &'a CompilationScope,
    registry: &'a OperationRegistry,
    provider: &'a dyn GraphProvider,
    referenced: RefCell<BTreeSet<GraphId>>,
}

impl TemplateResolver for ScopeResolver<'_> {
    fn resolve(&self, graph: GraphId, diags: &mut DiagnosticScope) -> GraphResult<Arc<IrGraph>> {
        let mut referenced = self.referenced.borrow_mut();
        referenced.insert(graph);
        match self.scope.translate(graph, self.registry, self.provider, diags)? {
            Some(t) => {
                referenced.extend(t.referenced_graphs.iter().copied());
                Ok(Arc::new(t.graph.clone()))
            }
            None => Err(GraphError::GraphNotFound(graph)),
        }
    }
}

pub struct GraphCompiler<'a> {
    registry: &'a OperationRegistry,
    provider: &'a dyn GraphProvider,
    max_template_expansions: usize,
}

impl<'a> GraphCompiler<'a> {
    pub fn new(registry: &'a OperationRegistry, provider: &'a dyn GraphProvider) -> Self {
        Self {
            registry,
            provider,
            max_template_expansions: DEFAULT_MAX_TEMPLATE_EXPANSIONS,
        }
    }

    pub fn with_max_template_expansions(mut self, limit: usize) -> Self {
        self.max_template_expansions = limit;
        self
    }

    /// Translate a declarative graph into IR, for editors that want the
    /// diagnostics without compiling.
    pub fn translate(&self, graph: &CompiledGraph) -> Result<IrGraph, Vec<Diagnostic>> {
        let mut diags = DiagnosticScope::new();
        match Translator::new(self.registry, self.provider).translate(graph, &mut diags) {
            Ok(t) => Ok(t.graph),
            Err(e) => {
                if !diags.has_error() {
                    diags.push(Diagnostic::error(e.to_string()));
                }
                Err(diags.into_messages())
            }
        }
    }

    /// Compile `target` into an executor with id `executor_id`.
    pub fn compile(&self, target: &GraphPinRef, scope: &CompilationScope, executor_id: u64) -> CompileOutput {
        let start = Instant::now();
        let mut diags = DiagnosticScope::new();
        let mut referenced = BTreeSet::from([target.graph]);

        let translated = match scope.translate(target.graph, self.registry, self.provider, &mut diags) {
            Ok(Some(t)) => t,
            Ok(None) => {
                tracing::debug!("Graph {} not found, compiling {} to an empty executor", target.graph, target);
                return CompileOutput {
                    executor: Some(Arc::new(Executor::empty(executor_id, target.clone()))),
                    diagnostics: diags.into_messages(),
                    referenced_graphs: referenced,
                };
            }
            Err(e) => {
                tracing::debug!("Compile of {} failed: {}", target, e);
                return CompileOutput {
                    executor: None,
                    diagnostics: diags.into_messages(),
                    referenced_graphs: referenced,
                };
            }
        };
        referenced.extend(translated.referenced_graphs.iter().copied());

        let resolver = ScopeResolver {
            scope,
            registry: self.registry,
            provider: self.provider,
            referenced: RefCell::new(BTreeSet::new()),
        };
        let mut graph = translated.graph.clone();
        let result = self.run_passes(&mut graph, target, &resolver, &mut diags).and_then(|(root, order, mut stats)| {
            stats.compile_time_us = start.elapsed().as_micros() as u64;
            Executor::build(executor_id, target.clone(), &graph, root, &order, stats)
        });
        referenced.extend(resolver.referenced.into_inner());

        match result {
            Ok(executor) => {
                tracing::debug!(
                    "Compiled {} into {} nodes in {}us",
                    target,
                    executor.num_nodes(),
                    executor.stats().compile_time_us
                );
                CompileOutput {
                    executor: Some(Arc::new(executor)),
                    diagnostics: diags.into_messages(),
                    referenced_graphs: referenced,
                }
            }
            Err(e) => {
                if !diags.has_error() {
                    diags.push(Diagnostic::error(format!("Internal compiler error: {e}")));
                }
                tracing::debug!("Compile of {} failed: {}", target, e);
                CompileOutput {
                    executor: None,
                    diagnostics: diags.into_messages(),
                    referenced_graphs: referenced,
                }
            }
        }
    }

    fn run_passes(
        &self,
        graph: &mut IrGraph,
        target: &GraphPinRef,
        resolver: &dyn TemplateResolver,
        diags: &mut DiagnosticScope,
    ) -> GraphResult<(IrNodeId, Vec<IrNodeId>, CompileStats)> {
        let mut stats = CompileStats {
            translated_nodes: graph.num_nodes(),
            ..Default::default()
        };
        let root = add_root(graph, target, diags)?;

        stats.removed_nodes = passes::remove_unused_nodes(graph, root)?;
        passes::check_wildcards(graph, diags)?;
        passes::check_no_default(graph, diags)?;
        passes::sort_nodes(graph, diags)?;
        stats.templates_expanded = passes::replace_templates(graph, resolver, diags, self.max_template_expansions)?;
        stats.passthroughs_removed = passes::remove_passthroughs(graph)?;
        stats.virtual_pins_disconnected = passes::disconnect_virtual_pins(graph)?;
        stats.removed_nodes += passes::remove_unused_nodes(graph, root)?;

        // Template bodies can bring their own wildcards and loops.
        if stats.templates_expanded > 0 {
            passes::check_wildcards(graph, diags)?;
            passes::check_no_default(graph, diags)?;
        }
        let order = passes::sort_nodes(graph, diags)?;
        Ok((root, order, stats))
    }
}

/// Add the root node and connect it to the target pin.
///
/// An output target is linked into the root. An input target is copied
/// into the root and its node removed, so the root reads what the input
/// would have read.
fn add_root(graph: &mut IrGraph, target: &GraphPinRef, diags: &mut DiagnosticScope) -> GraphResult<IrNodeId> {
    let key = NodeKey::new(target.graph, target.node.clone());
    let Some(node) = graph.find_node(&key) else {
        diags.push(Diagnostic::error(format!("Compile target {target} not found")).with_node(key));
        return Err(GraphError::PassFailed {
            pass: "add-root",
            errors: 1,
        });
    };

    let (pin, direction) = match graph.find_output(node, &target.pin) {
        Some(pin) => (pin, PinDirection::Output),
        None => match graph.find_input(node, &target.pin) {
            Some(pin) => (pin, PinDirection::Input),
            None => {
                diags.pin_error(&key, &target.pin, format!("Compile target pin '{}' not found", target.pin));
                return Err(GraphError::PassFailed {
                    pass: "add-root",
                    errors: 1,
                });
            }
        },
    };

    let pin_type = graph.pin(pin)?.pin_type;
    if pin_type.is_wildcard() {
        diags.pin_error(&key, &target.pin, "Compile target pin has a wildcard type");
        return Err(GraphError::PassFailed {
            pass: "add-root",
            errors: 1,
        });
    }

    let root = graph.add_node(NodeKey::new(target.graph, ROOT_NODE), IrNodeKind::Root);
    let value = graph.add_input(root, PinSpec::new("Value", pin_type))?;
    match direction {
        PinDirection::Output => graph.make_link(pin, value)?,
        PinDirection::Input => {
            graph.copy_input_pin_to(pin, value)?;
            graph.remove_node(node)?;
        }
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::value::{Value, ValueKind};
    use crate::graph::compiled::{CompiledNode, CompiledNodeKind, CompiledPin, PinEndpoint};
    use crate::graph::library::GraphLibrary;
    use crate::graph::types::PinType;

    const F: PinType = PinType::Buffer(ValueKind::Float);

    fn linked(mut pin: CompiledPin, node: &str, other: &str) -> CompiledPin {
        pin.linked_to.push(PinEndpoint::new(node, other));
        pin
    }

    fn abs(id: &str, input_from: Option<&str>, output_to: Option<(&str, &str)>) -> CompiledNode {
        let mut input = CompiledPin::new("Value", F);
        if let Some(from) = input_from {
            input = linked(input, from, "Result");
        }
        let mut output = CompiledPin::new("Result", F);
        if let Some((node, pin)) = output_to {
            output = linked(output, node, pin);
        }
        CompiledNode {
            node_id: id.into(),
            kind: CompiledNodeKind::Struct {
                operation: "Abs".into(),
            },
            input_pins: vec![input],
            output_pins: vec![output],
        }
    }

    fn output(from: &str) -> CompiledNode {
        CompiledNode {
            node_id: "Output.0".into(),
            kind: CompiledNodeKind::Output { name: "Density".into() },
            input_pins: vec![linked(
                CompiledPin::new("Value", F).with_default(Value::Float(0.0)),
                from,
                "Result",
            )],
            output_pins: vec![],
        }
    }

    fn library_with(graph: CompiledGraph) -> GraphLibrary {
        let library = GraphLibrary::new();
        library.insert(graph);
        library
    }

    #[test]
    fn test_compile_output_target() {
        let mut g = CompiledGraph::new(GraphId(1), "chain");
        g.nodes.push(abs("A", None, Some(("B", "Value"))));
        g.nodes.push(abs("B", Some("A"), Some(("Output.0", "Value"))));
        g.nodes.push(output("B"));
        let library = library_with(g);
        let registry = OperationRegistry::new();
        let scope = CompilationScope::new();

        let out = GraphCompiler::new(&registry, &library).compile(&GraphPinRef::output(GraphId(1), "Output.0"), &scope, 1);
        let exec = out.executor.unwrap();
        assert!(exec.has_root());
        assert_eq!(exec.num_nodes(), 2);
        assert!(!exec.contains_node("Output.0"));
        assert!(out.referenced_graphs.contains(&GraphId(1)));
    }

    #[test]
    fn test_missing_graph_gives_rootless_executor() {
        let library = GraphLibrary::new();
        let registry = OperationRegistry::new();
        let out = GraphCompiler::new(&registry, &library).compile(
            &GraphPinRef::output(GraphId(5), "Output.0"),
            &CompilationScope::new(),
            1,
        );
        assert!(out.succeeded());
        assert!(!out.executor.unwrap().has_root());
    }

    #[test]
    fn test_missing_target_pin_fails() {
        let mut g = CompiledGraph::new(GraphId(1), "g");
        g.nodes.push(abs("A", None, None));
        let library = library_with(g);
        let registry = OperationRegistry::new();
        let out = GraphCompiler::new(&registry, &library).compile(
            &GraphPinRef::new(GraphId(1), "A", "Nope"),
            &CompilationScope::new(),
            1,
        );
        assert!(!out.succeeded());
        assert!(out.diagnostics.iter().any(|d| d.message.contains("Nope")));
    }

    #[test]
    fn test_translate_reports_outdated_node() {
        let mut g = CompiledGraph::new(GraphId(1), "g");
        let mut node = abs("A", None, None);
        node.input_pins.clear();
        g.nodes.push(node);
        let library = GraphLibrary::new();
        let registry = OperationRegistry::new();
        let diags = GraphCompiler::new(&registry, &library).translate(&g).unwrap_err();
        assert!(diags.iter().any(|d| d.message.starts_with("Outdated node")));
    }
}

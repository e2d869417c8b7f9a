//! Compiler integration tests: dead code elimination, cycles, idempotence

mod common;

use common::builders::{abs, add, GraphBuilder, NodeBuilder, FLOAT, VECTOR};
use proptest::prelude::*;
use voxelgraph_rs::Value;
use voxelgraph_rs::graph::{
    CompilationScope, CompileOutput, CompiledGraph, GraphCompiler, GraphId, GraphLibrary, GraphPinRef, OperationRegistry,
};

fn compile(graph: CompiledGraph) -> CompileOutput {
    let target = GraphPinRef::output(graph.id, "Output.0");
    let library = GraphLibrary::new();
    library.insert(graph);
    let registry = OperationRegistry::new();
    GraphCompiler::new(&registry, &library).compile(&target, &CompilationScope::new(), 1)
}

/// `A -> B -> Output` with `A -> C` unused
fn chain_with_unused_branch() -> CompiledGraph {
    GraphBuilder::new(1)
        .node(abs("A"))
        .node(abs("B"))
        .node(abs("C"))
        .node(NodeBuilder::output("0", "Density"))
        .link("A", "Result", "B", "Value")
        .link("A", "Result", "C", "Value")
        .link("B", "Result", "Output.0", "Value")
        .build()
}

#[test]
fn test_unused_node_is_eliminated() {
    let output = compile(chain_with_unused_branch());
    let executor = output.executor.expect("compile succeeds");

    assert!(executor.has_root());
    assert!(executor.contains_node("A"));
    assert!(executor.contains_node("B"));
    assert!(!executor.contains_node("C"));
}

#[test]
fn test_cycle_names_both_nodes() {
    let graph = GraphBuilder::new(1)
        .node(abs("A"))
        .node(abs("B"))
        .node(NodeBuilder::output("0", "Density"))
        .link("A", "Result", "B", "Value")
        .link("B", "Result", "A", "Value")
        .link("B", "Result", "Output.0", "Value")
        .build();

    let output = compile(graph);
    assert!(output.executor.is_none());

    let loops: Vec<_> = output
        .diagnostics
        .iter()
        .filter(|d| d.message.starts_with("Loop in a graph"))
        .collect();
    assert_eq!(loops.len(), 2);
    assert!(loops.iter().all(|d| d.message.contains('A') && d.message.contains('B')));
}

#[test]
fn test_mixed_kind_inputs_fail_compile() {
    let graph = GraphBuilder::new(1)
        .node(
            NodeBuilder::op("Add", "Add")
                .input_default("A", FLOAT, Value::Float(1.0))
                .input("B", VECTOR)
                .out("Result", FLOAT),
        )
        .node(NodeBuilder::output("0", "Density"))
        .link("Add", "Result", "Output.0", "Value")
        .build();

    let output = compile(graph);
    assert!(output.executor.is_none());

    let mismatch = output
        .diagnostics
        .iter()
        .find(|d| d.message.starts_with("Type mismatch"))
        .expect("mismatch reported");
    assert_eq!(mismatch.pin.as_deref(), Some("B"));
    assert_eq!(mismatch.node.as_ref().map(|n| n.node.as_ref()), Some("Add"));
}

#[test]
fn test_recompile_is_identical() {
    let library = GraphLibrary::new();
    library.insert(chain_with_unused_branch());
    let registry = OperationRegistry::new();
    let target = GraphPinRef::output(GraphId(1), "Output.0");
    let compiler = GraphCompiler::new(&registry, &library);

    let first = compiler.compile(&target, &CompilationScope::new(), 1).executor.unwrap();
    let second = compiler.compile(&target, &CompilationScope::new(), 2).executor.unwrap();
    assert!(first.is_identical(&second));

    library.insert(
        GraphBuilder::new(1)
            .node(abs("A"))
            .node(NodeBuilder::output("0", "Density"))
            .link("A", "Result", "Output.0", "Value")
            .build(),
    );
    let third = compiler.compile(&target, &CompilationScope::new(), 3).executor.unwrap();
    assert!(!first.is_identical(&third));
}

#[test]
fn test_compile_json_graph() {
    let json = chain_with_unused_branch().to_json().unwrap();
    let graph = CompiledGraph::from_json(&json).unwrap();
    assert!(compile(graph).executor.is_some());
}

/// Random DAG of `Add` nodes: node `i` may read nodes `< i`.
fn dag_strategy() -> impl Strategy<Value = (usize, Vec<(Option<usize>, Option<usize>)>, usize)> {
    (2usize..10).prop_flat_map(|n| {
        let edges = (0..n)
            .map(|i| {
                if i == 0 {
                    Just((None, None)).boxed()
                } else {
                    (proptest::option::of(0..i), proptest::option::of(0..i)).boxed()
                }
            })
            .collect::<Vec<_>>();
        (Just(n), edges, 0..n)
    })
}

proptest! {
    #[test]
    fn test_dead_code_elimination_is_exact((n, edges, root) in dag_strategy()) {
        let name = |i: usize| format!("N{i}");
        let mut builder = GraphBuilder::new(7).node(NodeBuilder::output("0", "Density"));
        for i in 0..n {
            builder = builder.node(add(&name(i)));
        }
        for (i, (a, b)) in edges.iter().enumerate() {
            if let Some(a) = a {
                builder = builder.link(&name(*a), "Result", &name(i), "A");
            }
            if let Some(b) = b {
                builder = builder.link(&name(*b), "Result", &name(i), "B");
            }
        }
        let graph = builder.link(&name(root), "Result", "Output.0", "Value").build();

        // Backward closure from the node feeding the output
        let mut reachable = vec![false; n];
        let mut stack = vec![root];
        while let Some(i) = stack.pop() {
            if std::mem::replace(&mut reachable[i], true) {
                continue;
            }
            let (a, b) = edges[i];
            stack.extend(a);
            stack.extend(b);
        }

        let output = compile(graph);
        let executor = output.executor.expect("acyclic graphs compile");
        for (i, &expected) in reachable.iter().enumerate() {
            prop_assert_eq!(executor.contains_node(&name(i)), expected, "node {}", i);
        }
    }
}

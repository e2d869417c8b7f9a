//! VoxelGraph - command line entry point
//!
//! Loads the engine configuration and any graph files given on the command
//! line, evaluates each graph's first output over a small grid and runs a
//! chunk spawner around a sphere invoker.
//!
//! Usage: `voxelgraph [--config <file>] [graph.json ...]`

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use voxelgraph_rs::{
    config::{self, EngineConfig},
    graph::{CompiledGraph, CompiledNode, CompiledNodeKind, CompiledPin, GraphId, GraphPinRef, PinType},
    math::Vec3,
    query::{PositionQuery, QueryParameters},
    runtime::{RuntimeMessage, RuntimeValue, VoxelRuntime},
    spatial::{InvokerComponent, SpawnerEvent},
    Value, ValueKind,
};

struct Args {
    config: Option<PathBuf>,
    graphs: Vec<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        config: None,
        graphs: Vec::new(),
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter.next().context("--config expects a path")?;
            args.config = Some(PathBuf::from(path));
        } else {
            args.graphs.push(PathBuf::from(arg));
        }
    }
    Ok(args)
}

fn init_logging(config: &EngineConfig) -> Option<WorkerGuard> {
    let (file_layer, guard) = if config.logging.file {
        match config::ensure_app_data_dir() {
            Ok(dir) => {
                let appender = tracing_appender::rolling::daily(dir.join(config::LOG_DIR), "voxelgraph.log");
                let (writer, guard) = tracing_appender::non_blocking(appender);
                (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
            }
            Err(e) => {
                eprintln!("Log file disabled: {}", e);
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)))
        .with(fmt::layer())
        .with(file_layer)
        .init();

    guard
}

/// `length(position) - radius`: a sphere density field.
fn demo_graph(radius: f32) -> CompiledGraph {
    const V: PinType = PinType::Buffer(ValueKind::Vector);
    const F: PinType = PinType::Buffer(ValueKind::Float);

    let mut graph = CompiledGraph::new(GraphId(1), "Sphere");
    graph.nodes.push(CompiledNode {
        node_id: "Position".into(),
        kind: CompiledNodeKind::Struct {
            operation: "GetPosition".into(),
        },
        input_pins: vec![],
        output_pins: vec![CompiledPin::new("Position", V)],
    });
    graph.nodes.push(CompiledNode {
        node_id: "Length".into(),
        kind: CompiledNodeKind::Struct {
            operation: "Length".into(),
        },
        input_pins: vec![CompiledPin::new("Vector", V)],
        output_pins: vec![CompiledPin::new("Length", F)],
    });
    graph.nodes.push(CompiledNode {
        node_id: "Subtract".into(),
        kind: CompiledNodeKind::Struct {
            operation: "Subtract".into(),
        },
        input_pins: vec![
            CompiledPin::new("A", F).with_default(Value::Float(0.0)),
            CompiledPin::new("B", F).with_default(Value::Float(radius)),
        ],
        output_pins: vec![CompiledPin::new("Result", F)],
    });
    graph.nodes.push(CompiledNode {
        node_id: "Output.Density".into(),
        kind: CompiledNodeKind::Output {
            name: "Density".into(),
        },
        input_pins: vec![CompiledPin::new("Value", F).with_default(Value::Float(0.0))],
        output_pins: vec![],
    });

    graph.link("Position", "Position", "Length", "Vector");
    graph.link("Length", "Length", "Subtract", "A");
    graph.link("Subtract", "Result", "Output.Density", "Value");
    graph
}

fn first_output(graph: &CompiledGraph) -> Option<GraphPinRef> {
    graph
        .nodes
        .iter()
        .find(|n| n.is_output_node())
        .map(|n| GraphPinRef::output(graph.id, n.node_id.as_str()))
}

/// Await `target` over an 8x8x8 grid, ticking the runtime while waiting so
/// privileged continuations can run.
fn evaluate_grid(runtime: &mut VoxelRuntime, tokio_rt: &tokio::runtime::Runtime, target: &GraphPinRef) -> RuntimeValue {
    let parameters = QueryParameters::new().with(PositionQuery::Grid3D {
        start: Vec3::splat(-400.0),
        step: 100.0,
        size: [8, 8, 8],
    });
    let (query, _tracker) = runtime.make_query(parameters);
    let future = runtime.executors().evaluate(target, &query);

    tokio_rt.block_on(async {
        let mut interval = tokio::time::interval(Duration::from_millis(1));
        loop {
            tokio::select! {
                value = future.clone() => break value,
                _ = interval.tick() => {
                    runtime.tick();
                }
            }
        }
    })
}

fn summarize(value: &RuntimeValue) -> String {
    match value.as_buffer() {
        Some(buffer) => {
            let inside = buffer
                .as_float()
                .map(|b| b.as_slice().iter().filter(|&&d| d < 0.0).count())
                .unwrap_or(0);
            format!("{} value(s), {} inside", buffer.len(), inside)
        }
        None => format!("{:?}", value),
    }
}

fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => EngineConfig::load(path).with_context(|| format!("Failed to load config {:?}", path))?,
        None => match EngineConfig::default_path() {
            Ok(path) => EngineConfig::load_or_default(path),
            Err(_) => EngineConfig::default(),
        },
    };

    let _log_guard = init_logging(&config);
    tracing::info!("Starting VoxelGraph");

    let (mut runtime, bridge) = VoxelRuntime::init(config)?;
    let tokio_rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_time()
        .build()
        .context("Failed to start async runtime")?;

    // Graphs
    let mut graphs = Vec::new();
    for path in &args.graphs {
        let graph = CompiledGraph::load(path).with_context(|| format!("Failed to load graph {:?}", path))?;
        tracing::info!("Loaded graph {} '{}' from {:?}", graph.id, graph.name, path);
        graphs.push(graph);
    }
    if graphs.is_empty() {
        graphs.push(demo_graph(250.0));
    }

    let targets: Vec<GraphPinRef> = graphs.iter().filter_map(first_output).collect();
    for graph in graphs {
        bridge.submit_graph(graph);
    }
    runtime.tick();

    for target in &targets {
        let value = evaluate_grid(&mut runtime, &tokio_rt, target);
        tracing::info!("{}: {}", target, summarize(&value));
    }

    // Chunks around a sphere invoker
    let world = runtime.world();
    let spawner = runtime.add_default_spawner();
    let _invoker = runtime
        .invokers()
        .add_invoker(InvokerComponent::sphere(world, runtime.config().spawner.chunk_world_size() * 4.0));

    let mut added = 0usize;
    let mut removed = 0usize;
    for _ in 0..64 {
        runtime.tick();
        for msg in bridge.drain() {
            match msg {
                RuntimeMessage::Chunks(SpawnerEvent::ChunksAdded { chunks, .. }) => added += chunks.len(),
                RuntimeMessage::Chunks(SpawnerEvent::ChunksRemoved { chunks, .. }) => removed += chunks.len(),
                RuntimeMessage::Chunks(SpawnerEvent::BudgetExceeded { max_chunks, .. }) => {
                    tracing::warn!("Chunk budget of {} exceeded", max_chunks)
                }
                RuntimeMessage::Diagnostic(diagnostic) => tracing::info!("{}", diagnostic),
                RuntimeMessage::ExecutorUpdated(_) | RuntimeMessage::Shutdown => {}
            }
        }
        let busy = runtime.spawners().iter().any(|s| s.is_task_in_progress());
        if !busy && added > 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    let live = runtime
        .spawners()
        .iter()
        .find(|s| s.id() == spawner)
        .map(|s| s.num_chunks())
        .unwrap_or(0);
    tracing::info!("Spawner {}: {} chunk(s) live, {} added, {} removed", spawner.0, live, added, removed);

    bridge.shutdown();
    runtime.tick();
    tracing::info!("Shutting down...");
    Ok(())
}

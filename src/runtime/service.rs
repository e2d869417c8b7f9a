//! The runtime service owned by the privileged thread.
//!
//! [`VoxelRuntime`] wires the scheduler, graph library, executor cache and
//! spatial managers together. The host drives it by calling
//! [`VoxelRuntime::tick`] from the thread that created it and talks to it
//! through the [`RuntimeBridge`] returned by [`VoxelRuntime::init`].

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::config::EngineConfig;
use crate::diagnostics::{Diagnostic, DiagnosticsHub};
use crate::error::{Result, VoxelGraphError};
use crate::graph::library::GraphLibrary;
use crate::graph::operation::OperationRegistry;
use crate::math::Transform;
use crate::query::dependency::DependencyTracker;
use crate::query::parameters::QueryParameters;
use crate::query::query::{EvalEnvironment, Query};
use crate::query::task::TaskScheduler;
use crate::runtime::bridge::{RuntimeBridge, RuntimeCommand, RuntimeMessage};
use crate::runtime::manager::{ExecutorManager, ExecutorUpdate, ManagerSettings};
use crate::spatial::chunk_spawner::{ChunkSpawner, ChunkSpawnerSettings, SpawnerEvent, SpawnerId};
use crate::spatial::collision::{CollisionManager, CollisionSink};
use crate::spatial::invoker_manager::InvokerManager;
use crate::spatial::WorldId;

/// Counters returned by [`VoxelRuntime::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeTickStats {
    pub commands: usize,
    pub privileged_tasks: usize,
    pub compiled: usize,
    pub evicted: usize,
    pub invokers_rebuilt: bool,
    pub messages: usize,
}

pub struct VoxelRuntime {
    config: EngineConfig,
    world: WorldId,
    local_to_world: Transform,
    scheduler: TaskScheduler,
    diagnostics: Arc<DiagnosticsHub>,
    environment: Arc<EvalEnvironment>,
    library: Arc<GraphLibrary>,
    registry: Arc<OperationRegistry>,
    executors: Arc<ExecutorManager>,
    invokers: Arc<InvokerManager>,
    spawners: Vec<ChunkSpawner>,
    collision: Option<CollisionManager>,

    // Bridge ends
    cmd_rx: Receiver<RuntimeCommand>,
    msg_tx: Sender<RuntimeMessage>,

    // Internal feeds forwarded to the host
    spawner_tx: Sender<SpawnerEvent>,
    spawner_rx: Receiver<SpawnerEvent>,
    diagnostic_rx: Receiver<Diagnostic>,
    update_rx: Receiver<ExecutorUpdate>,

    running: bool,
}

impl std::fmt::Debug for VoxelRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoxelRuntime")
            .field("world", &self.world)
            .field("graphs", &self.library.len())
            .field("executors", &self.executors.len())
            .field("spawners", &self.spawners.len())
            .field("running", &self.running)
            .finish()
    }
}

impl VoxelRuntime {
    /// Build the runtime and bind the calling thread as the privileged
    /// thread. Returns the host's end of the bridge.
    pub fn init(config: EngineConfig) -> Result<(Self, RuntimeBridge)> {
        let scheduler = TaskScheduler::new(config.runtime.worker_threads)?;
        scheduler.bind_privileged_thread();

        let diagnostics = Arc::new(DiagnosticsHub::new());
        let environment = Arc::new(
            EvalEnvironment::new(scheduler.clone(), diagnostics.clone())
                .with_limits(config.compiler.max_context_depth, crate::config::MAX_VOXELS_PER_QUERY),
        );
        let library = Arc::new(GraphLibrary::new());
        let registry = Arc::new(OperationRegistry::new());
        let executors = ExecutorManager::new(
            registry.clone(),
            library.clone(),
            environment.clone(),
            ManagerSettings {
                idle_timeout: config.runtime.executor_idle_timeout(),
                max_template_expansions: config.compiler.max_template_expansions,
            },
        );
        let invokers = InvokerManager::new(config.invoker);

        let (bridge, cmd_rx, msg_tx) = RuntimeBridge::new();
        let (spawner_tx, spawner_rx) = crossbeam_channel::unbounded();
        let diagnostic_rx = diagnostics.subscribe();
        let update_rx = executors.subscribe();

        tracing::info!("Voxel runtime started with {} worker(s)", scheduler.num_workers());

        let runtime = Self {
            config,
            world: WorldId::default(),
            local_to_world: Transform::IDENTITY,
            scheduler,
            diagnostics,
            environment,
            library,
            registry,
            executors,
            invokers,
            spawners: Vec::new(),
            collision: None,
            cmd_rx,
            msg_tx,
            spawner_tx,
            spawner_rx,
            diagnostic_rx,
            update_rx,
            running: true,
        };
        Ok((runtime, bridge))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn world(&self) -> WorldId {
        self.world
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn diagnostics(&self) -> &Arc<DiagnosticsHub> {
        &self.diagnostics
    }

    pub fn environment(&self) -> &Arc<EvalEnvironment> {
        &self.environment
    }

    pub fn library(&self) -> &Arc<GraphLibrary> {
        &self.library
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    pub fn executors(&self) -> &Arc<ExecutorManager> {
        &self.executors
    }

    pub fn invokers(&self) -> &Arc<InvokerManager> {
        &self.invokers
    }

    pub fn spawners(&self) -> &[ChunkSpawner] {
        &self.spawners
    }

    pub fn collision(&self) -> Option<&CollisionManager> {
        self.collision.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Transform applied to every spawner's octree.
    pub fn set_local_to_world(&mut self, transform: Transform) {
        self.local_to_world = transform;
    }

    /// Add a chunk spawner in this runtime's world.
    pub fn add_spawner(&mut self, settings: ChunkSpawnerSettings) -> SpawnerId {
        let spawner = ChunkSpawner::new(
            self.world,
            settings,
            self.invokers.clone(),
            self.scheduler.clone(),
            self.diagnostics.clone(),
            self.spawner_tx.clone(),
        );
        let id = spawner.id();
        self.spawners.push(spawner);
        id
    }

    /// Add a spawner using the configured defaults.
    pub fn add_default_spawner(&mut self) -> SpawnerId {
        self.add_spawner(self.config.spawner.clone())
    }

    pub fn remove_spawner(&mut self, id: SpawnerId) -> bool {
        let before = self.spawners.len();
        self.spawners.retain(|s| s.id() != id);
        before != self.spawners.len()
    }

    /// Enable instanced collision, routing toggles to `sink`.
    pub fn enable_collision(&mut self, sink: Arc<dyn CollisionSink>) -> Result<()> {
        if !self.config.collision.enabled {
            return Err(VoxelGraphError::Config("Collision is disabled in the configuration".to_string()));
        }
        self.collision = Some(CollisionManager::new(
            self.world,
            self.invokers.clone(),
            self.scheduler.clone(),
            sink,
        ));
        Ok(())
    }

    /// A fresh query bound to this runtime's evaluation environment.
    pub fn make_query(&self, parameters: QueryParameters) -> (Query, DependencyTracker) {
        let tracker = DependencyTracker::new("runtime query");
        let query = Query::new(self.environment.clone(), parameters, tracker.clone());
        (query, tracker)
    }

    /// One privileged-thread step.
    pub fn tick(&mut self) -> RuntimeTickStats {
        let mut stats = RuntimeTickStats {
            commands: self.handle_commands(),
            ..Default::default()
        };

        stats.privileged_tasks = self.scheduler.run_privileged_tasks();

        let executor_stats = self.executors.tick();
        stats.compiled = executor_stats.compiled;
        stats.evicted = executor_stats.evicted;

        stats.invokers_rebuilt = self.invokers.tick();
        for spawner in &self.spawners {
            spawner.tick(&self.local_to_world);
        }
        if let Some(collision) = &self.collision {
            collision.tick();
        }

        // Spawner finalizers queued this tick
        stats.privileged_tasks += self.scheduler.run_privileged_tasks();

        stats.messages = self.forward_messages();
        stats
    }

    fn handle_commands(&mut self) -> usize {
        let mut handled = 0;
        while handled < self.config.runtime.privileged_queue_capacity {
            match self.cmd_rx.try_recv() {
                Ok(cmd) => {
                    self.handle_command(cmd);
                    handled += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.running {
                        tracing::info!("Runtime bridge dropped by host");
                        self.running = false;
                    }
                    break;
                }
            }
        }
        handled
    }

    fn handle_command(&mut self, cmd: RuntimeCommand) {
        match cmd {
            RuntimeCommand::SubmitGraph(graph) => {
                let id = graph.id;
                tracing::debug!("Graph {} '{}' submitted", id, graph.name);
                self.library.insert(graph);
                self.executors.on_graph_changed(id);
            }
            RuntimeCommand::RemoveGraph(id) => {
                if self.library.remove(id).is_some() {
                    tracing::debug!("Graph {} removed", id);
                }
                self.executors.on_graph_removed(id);
            }
            RuntimeCommand::SetGraphParent { instance, parent } => {
                self.library.set_parent(instance, parent);
                self.executors.on_graph_changed(instance);
            }
            RuntimeCommand::Shutdown => {
                self.shutdown();
            }
        }
    }

    fn forward_messages(&self) -> usize {
        let mut sent = 0;
        let mut send = |msg: RuntimeMessage| {
            if let Err(e) = self.msg_tx.try_send(msg) {
                tracing::warn!("Failed to forward runtime message: {}", e);
            } else {
                sent += 1;
            }
        };
        while let Ok(diagnostic) = self.diagnostic_rx.try_recv() {
            send(RuntimeMessage::Diagnostic(diagnostic));
        }
        while let Ok(update) = self.update_rx.try_recv() {
            send(RuntimeMessage::ExecutorUpdated(update));
        }
        while let Ok(event) = self.spawner_rx.try_recv() {
            send(RuntimeMessage::Chunks(event));
        }
        sent
    }

    /// Stop handling commands and notify the host.
    pub fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        tracing::info!("Voxel runtime shutting down");
        let _ = self.msg_tx.send(RuntimeMessage::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::value::{Value, ValueKind};
    use crate::graph::compiled::{CompiledGraph, CompiledNode, CompiledNodeKind, CompiledPin};
    use crate::graph::id::{GraphId, GraphPinRef};
    use crate::graph::types::PinType;

    fn constant_graph(id: u32, value: f32) -> CompiledGraph {
        let mut g = CompiledGraph::new(GraphId(id), "constant");
        g.nodes.push(CompiledNode {
            node_id: "Output.0".into(),
            kind: CompiledNodeKind::Output { name: "Value".into() },
            input_pins: vec![CompiledPin::new("Value", PinType::Buffer(ValueKind::Float)).with_default(Value::Float(value))],
            output_pins: vec![],
        });
        g
    }

    fn runtime() -> (VoxelRuntime, RuntimeBridge) {
        let mut config = EngineConfig::default();
        config.runtime.worker_threads = 1;
        VoxelRuntime::init(config).unwrap()
    }

    #[test]
    fn test_submit_graph_through_bridge() {
        let (mut runtime, bridge) = runtime();
        bridge.submit_graph(constant_graph(1, 4.0));
        let stats = runtime.tick();
        assert_eq!(stats.commands, 1);
        assert!(runtime.library().contains(GraphId(1)));

        let target = GraphPinRef::output(GraphId(1), "Output.0");
        assert!(runtime.executors().get_executor(&target).get().cloned().flatten().is_some());
    }

    #[test]
    fn test_executor_updates_are_forwarded() {
        let (mut runtime, bridge) = runtime();
        bridge.submit_graph(constant_graph(1, 4.0));
        runtime.tick();
        let target = GraphPinRef::output(GraphId(1), "Output.0");
        runtime.executors().get_executor(&target);

        bridge.submit_graph(constant_graph(1, 5.0));
        runtime.tick();
        let updates = bridge
            .drain()
            .into_iter()
            .filter(|m| matches!(m, RuntimeMessage::ExecutorUpdated(u) if u.changed))
            .count();
        assert_eq!(updates, 1);
    }

    #[test]
    fn test_shutdown_command() {
        let (mut runtime, bridge) = runtime();
        bridge.shutdown();
        runtime.tick();
        assert!(!runtime.is_running());
        assert!(bridge.drain().iter().any(|m| matches!(m, RuntimeMessage::Shutdown)));
    }

    #[test]
    fn test_dropped_bridge_stops_runtime() {
        let (mut runtime, bridge) = runtime();
        drop(bridge);
        runtime.tick();
        assert!(!runtime.is_running());
    }

    #[test]
    fn test_collision_respects_config() {
        let mut config = EngineConfig::default();
        config.collision.enabled = false;
        let (mut runtime, _bridge) = VoxelRuntime::init(config).unwrap();
        let sink = Arc::new(crate::spatial::collision::MockCollisionSink::new());
        assert!(runtime.enable_collision(sink).is_err());
    }

    #[test]
    fn test_spawners_can_be_removed() {
        let (mut runtime, _bridge) = runtime();
        let id = runtime.add_default_spawner();
        assert_eq!(runtime.spawners().len(), 1);
        assert!(runtime.remove_spawner(id));
        assert!(!runtime.remove_spawner(id));
    }
}

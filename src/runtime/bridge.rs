//! Thread boundary between the runtime service and its host.
//!
//! The host (editor, tool or the `voxelgraph` binary) owns a
//! [`RuntimeBridge`]; the [`VoxelRuntime`](crate::runtime::service::VoxelRuntime)
//! owns the opposite ends and handles commands during its tick.

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::diagnostics::Diagnostic;
use crate::graph::compiled::CompiledGraph;
use crate::graph::id::GraphId;
use crate::runtime::manager::ExecutorUpdate;
use crate::spatial::chunk_spawner::SpawnerEvent;

/// Messages sent from the runtime to the host.
#[derive(Debug, Clone)]
pub enum RuntimeMessage {
    /// A compile or evaluation problem.
    Diagnostic(Diagnostic),

    /// A compile target was recompiled or dropped.
    ExecutorUpdated(ExecutorUpdate),

    /// Chunk requests appeared, disappeared or hit the budget.
    Chunks(SpawnerEvent),

    /// The runtime is shutting down.
    Shutdown,
}

/// Commands sent from the host to the runtime.
#[derive(Debug, Clone)]
pub enum RuntimeCommand {
    /// Insert or replace a declarative graph and recompile what used it.
    SubmitGraph(CompiledGraph),
    /// Delete a graph; its executors are dropped.
    RemoveGraph(GraphId),
    /// Make `instance` fall back to `parent` for missing pins.
    SetGraphParent { instance: GraphId, parent: GraphId },
    /// Stop handling commands.
    Shutdown,
}

/// Channel capacity for commands (host → runtime).
const CMD_CHANNEL_CAPACITY: usize = 256;
/// Channel capacity for messages (runtime → host).
const MSG_CHANNEL_CAPACITY: usize = 10_000;

/// Host-side handle for talking to the runtime.
pub struct RuntimeBridge {
    pub cmd_tx: Sender<RuntimeCommand>,
    pub msg_rx: Receiver<RuntimeMessage>,
}

impl RuntimeBridge {
    /// Create a new bridge pair: `(bridge_for_host, cmd_rx, msg_tx)`.
    ///
    /// The runtime owns `cmd_rx` and `msg_tx`.
    pub fn new() -> (Self, Receiver<RuntimeCommand>, Sender<RuntimeMessage>) {
        let (cmd_tx, cmd_rx) = bounded(CMD_CHANNEL_CAPACITY);
        let (msg_tx, msg_rx) = bounded(MSG_CHANNEL_CAPACITY);
        (Self { cmd_tx, msg_rx }, cmd_rx, msg_tx)
    }

    /// Drain all pending messages.
    pub fn drain(&self) -> Vec<RuntimeMessage> {
        let mut msgs = Vec::new();
        while let Ok(msg) = self.msg_rx.try_recv() {
            msgs.push(msg);
        }
        msgs
    }

    /// Try to receive a single message without blocking.
    pub fn try_recv(&self) -> Option<RuntimeMessage> {
        self.msg_rx.try_recv().ok()
    }

    pub fn send_command(&self, cmd: RuntimeCommand) -> bool {
        self.cmd_tx.send(cmd).is_ok()
    }

    pub fn submit_graph(&self, graph: CompiledGraph) {
        let _ = self.cmd_tx.send(RuntimeCommand::SubmitGraph(graph));
    }

    pub fn remove_graph(&self, id: GraphId) {
        let _ = self.cmd_tx.send(RuntimeCommand::RemoveGraph(id));
    }

    pub fn set_graph_parent(&self, instance: GraphId, parent: GraphId) {
        let _ = self.cmd_tx.send(RuntimeCommand::SetGraphParent { instance, parent });
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(RuntimeCommand::Shutdown);
    }
}

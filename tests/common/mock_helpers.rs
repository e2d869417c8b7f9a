//! Mock construction helpers

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use voxelgraph_rs::diagnostics::DiagnosticsHub;
use voxelgraph_rs::graph::{GraphLibrary, OperationRegistry};
use voxelgraph_rs::query::{EvalEnvironment, TaskScheduler};
use voxelgraph_rs::runtime::{ExecutorManager, ManagerSettings};
use voxelgraph_rs::spatial::{CollisionComponentId, CollisionSink};

/// Create test channels with default size
pub fn create_test_channels<T, U>() -> (Sender<T>, Receiver<T>, Sender<U>, Receiver<U>) {
    let (tx1, rx1) = bounded(16);
    let (tx2, rx2) = bounded(16);
    (tx1, rx1, tx2, rx2)
}

/// Scheduler with the calling thread bound as the privileged thread
pub fn create_test_scheduler() -> TaskScheduler {
    let scheduler = TaskScheduler::new(2).expect("worker pool");
    scheduler.bind_privileged_thread();
    scheduler
}

/// Library plus executor manager sharing one evaluation environment
pub fn create_test_manager() -> (Arc<GraphLibrary>, Arc<ExecutorManager>) {
    let scheduler = create_test_scheduler();
    let environment = Arc::new(EvalEnvironment::new(scheduler, Arc::new(DiagnosticsHub::new())));
    let library = Arc::new(GraphLibrary::new());
    let manager = ExecutorManager::new(
        Arc::new(OperationRegistry::new()),
        library.clone(),
        environment,
        ManagerSettings {
            idle_timeout: Duration::from_secs(30),
            ..Default::default()
        },
    );
    (library, manager)
}

/// Records every toggle request
#[derive(Debug, Default)]
pub struct RecordingCollisionSink {
    pub enabled: Mutex<Vec<(CollisionComponentId, Vec<usize>)>>,
    pub disabled: Mutex<Vec<(CollisionComponentId, Vec<usize>)>>,
}

impl RecordingCollisionSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn disabled_count(&self) -> usize {
        self.disabled.lock().unwrap().iter().map(|(_, v)| v.len()).sum()
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled.lock().unwrap().iter().map(|(_, v)| v.len()).sum()
    }
}

impl CollisionSink for RecordingCollisionSink {
    fn enable_instances(&self, component: CollisionComponentId, indices: &[usize]) {
        self.enabled.lock().unwrap().push((component, indices.to_vec()));
    }

    fn disable_instances(&self, component: CollisionComponentId, indices: &[usize]) {
        self.disabled.lock().unwrap().push((component, indices.to_vec()));
    }
}

//! Executor cache keyed by compile target.
//!
//! Compiles happen on the privileged thread. Requests from elsewhere get a
//! pending future that the next [`ExecutorManager::tick`] resolves. Each
//! target owns a [`Dependency`] that is invalidated whenever a recompile
//! changes what the target computes.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use rustc_hash::FxHashMap;

use crate::graph::cache::CompilationScope;
use crate::graph::compiler::{CompileOutput, GraphCompiler};
use crate::graph::id::{GraphId, GraphPinRef};
use crate::graph::ir::GraphSignature;
use crate::graph::library::GraphProvider;
use crate::graph::operation::OperationRegistry;
use crate::query::dependency::{Dependency, InvalidationScope};
use crate::query::future::{FutureValue, Promise};
use crate::query::query::{EvalEnvironment, ExecutorSource, Query};
use crate::runtime::executor::Executor;
use crate::runtime::value::RuntimeValue;
use crate::sync::lock;

/// Settings for [`ExecutorManager`].
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Strong references unused for this long are released.
    pub idle_timeout: Duration,
    pub max_template_expansions: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(crate::config::DEFAULT_EXECUTOR_IDLE_SECS),
            max_template_expansions: crate::config::DEFAULT_MAX_TEMPLATE_EXPANSIONS,
        }
    }
}

/// What the last compile of a target produced. Compared across recompiles
/// to decide whether dependents must be invalidated.
#[derive(Debug, Clone, PartialEq)]
enum CompileStatus {
    Failed,
    Compiled { has_root: bool, signature: GraphSignature },
}

impl CompileStatus {
    fn of(output: &CompileOutput) -> Self {
        match &output.executor {
            Some(e) => CompileStatus::Compiled {
                has_root: e.has_root(),
                signature: e.signature().clone(),
            },
            None => CompileStatus::Failed,
        }
    }
}

/// Sent whenever a target is (re)compiled or dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorUpdate {
    pub target: GraphPinRef,
    pub executor_id: Option<u64>,
    pub succeeded: bool,
    /// Whether dependents were invalidated.
    pub changed: bool,
}

type PendingCompile = FutureValue<Option<Arc<Executor>>>;

struct Entry {
    dependency: Arc<Dependency>,
    executor: Weak<Executor>,
    /// Keeps the executor alive while it is used; released after the idle
    /// timeout unless pinned.
    strong: Option<Arc<Executor>>,
    executor_id: Option<u64>,
    status: Option<CompileStatus>,
    referenced_graphs: BTreeSet<GraphId>,
    last_used: Instant,
    pins: Arc<AtomicUsize>,
    pending: Option<PendingCompile>,
}

impl Entry {
    fn new(target: &GraphPinRef) -> Self {
        Self {
            dependency: Dependency::new(format!("executor {target}")),
            executor: Weak::new(),
            strong: None,
            executor_id: None,
            status: None,
            referenced_graphs: BTreeSet::from([target.graph]),
            last_used: Instant::now(),
            pins: Arc::new(AtomicUsize::new(0)),
            pending: None,
        }
    }

    fn live_executor(&self) -> Option<Arc<Executor>> {
        self.strong.clone().or_else(|| self.executor.upgrade())
    }
}

/// Keeps an executor from being evicted while held.
pub struct ExecutorPin {
    executor: Arc<Executor>,
    pins: Arc<AtomicUsize>,
}

impl ExecutorPin {
    fn new(executor: Arc<Executor>, pins: Arc<AtomicUsize>) -> Self {
        pins.fetch_add(1, Ordering::AcqRel);
        Self { executor, pins }
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }
}

impl std::ops::Deref for ExecutorPin {
    type Target = Executor;

    fn deref(&self) -> &Executor {
        &self.executor
    }
}

impl Drop for ExecutorPin {
    fn drop(&mut self) {
        self.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Counters returned by [`ExecutorManager::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerTickStats {
    pub compiled: usize,
    pub evicted: usize,
}

pub struct ExecutorManager {
    registry: Arc<OperationRegistry>,
    provider: Arc<dyn GraphProvider>,
    environment: Arc<EvalEnvironment>,
    settings: ManagerSettings,
    entries: Mutex<FxHashMap<GraphPinRef, Entry>>,
    pending: Mutex<Vec<(GraphPinRef, Promise<Option<Arc<Executor>>>)>>,
    next_executor_id: AtomicU64,
    subscribers: Mutex<Vec<Sender<ExecutorUpdate>>>,
}

impl std::fmt::Debug for ExecutorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorManager")
            .field("entries", &self.len())
            .field("settings", &self.settings)
            .finish()
    }
}

impl ExecutorManager {
    /// Create the manager and bind it as the environment's executor source.
    pub fn new(
        registry: Arc<OperationRegistry>,
        provider: Arc<dyn GraphProvider>,
        environment: Arc<EvalEnvironment>,
        settings: ManagerSettings,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            registry,
            provider,
            environment,
            settings,
            entries: Mutex::new(FxHashMap::default()),
            pending: Mutex::new(Vec::new()),
            next_executor_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        });
        let source: Weak<dyn ExecutorSource> = Arc::downgrade(&manager) as Weak<ExecutorManager>;
        if !manager.environment.bind_executors(source) {
            tracing::warn!("Evaluation environment already has an executor source");
        }
        manager
    }

    pub fn environment(&self) -> &Arc<EvalEnvironment> {
        &self.environment
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    pub fn subscribe(&self) -> Receiver<ExecutorUpdate> {
        let (tx, rx) = crossbeam_channel::unbounded();
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Dependency invalidated when `target` changes.
    pub fn dependency(&self, target: &GraphPinRef) -> Arc<Dependency> {
        let mut entries = lock(&self.entries);
        entries
            .entry(target.clone())
            .or_insert_with(|| Entry::new(target))
            .dependency
            .clone()
    }

    /// Executor for `target`. Compiles inline on the privileged thread;
    /// elsewhere the compile is queued for the next tick.
    pub fn get_executor(&self, target: &GraphPinRef) -> FutureValue<Option<Arc<Executor>>> {
        {
            let mut entries = lock(&self.entries);
            let entry = entries.entry(target.clone()).or_insert_with(|| Entry::new(target));
            if let Some(executor) = entry.live_executor() {
                entry.last_used = Instant::now();
                entry.strong = Some(executor.clone());
                return FutureValue::resolved(Some(executor));
            }
            if entry.status == Some(CompileStatus::Failed) {
                return FutureValue::resolved(None);
            }
            if let Some(pending) = &entry.pending {
                return pending.clone();
            }
            if !self.environment.scheduler.is_privileged_thread() {
                let (future, promise) = FutureValue::pending();
                entry.pending = Some(future.clone());
                lock(&self.pending).push((target.clone(), promise));
                tracing::trace!("Queued compile of {}", target);
                return future;
            }
        }

        let scope = CompilationScope::new();
        FutureValue::resolved(self.compile_and_store(target, &scope))
    }

    /// Pin the current executor of `target`, compiling it if needed and
    /// possible on this thread.
    pub fn pin_executor(&self, target: &GraphPinRef) -> Option<ExecutorPin> {
        let executor = self.get_executor(target).get().cloned().flatten()?;
        let pins = lock(&self.entries).get(target)?.pins.clone();
        Some(ExecutorPin::new(executor, pins))
    }

    /// Evaluate `target` for `query`. The target's dependency is always
    /// recorded, even if it fails to compile, so fixing the graph
    /// re-evaluates the query.
    pub fn evaluate(&self, target: &GraphPinRef, query: &Query) -> FutureValue<RuntimeValue> {
        let (dependency, pins) = {
            let mut entries = lock(&self.entries);
            let entry = entries.entry(target.clone()).or_insert_with(|| Entry::new(target));
            (entry.dependency.clone(), entry.pins.clone())
        };
        query.add_dependency(&dependency);

        let query = query.clone();
        self.get_executor(target).and_then(move |executor| match executor {
            Some(executor) => {
                let pin = ExecutorPin::new(executor.clone(), pins);
                let result = executor.execute(&query);
                result.on_resolved(move |_| drop(pin));
                result
            }
            None => FutureValue::resolved(RuntimeValue::Empty),
        })
    }

    /// Drain queued compiles and release idle executors. Must run on the
    /// privileged thread.
    pub fn tick(&self) -> ManagerTickStats {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&self, now: Instant) -> ManagerTickStats {
        let mut stats = ManagerTickStats::default();
        let pending = std::mem::take(&mut *lock(&self.pending));
        if !pending.is_empty() {
            let _invalidation = InvalidationScope::new();
            let scope = CompilationScope::new();
            for (target, promise) in pending {
                let executor = self.compile_and_store(&target, &scope);
                promise.resolve(executor);
                stats.compiled += 1;
            }
        }
        stats.evicted = self.evict_idle(now);
        stats
    }

    /// Release strong references idle longer than the timeout. Pinned
    /// executors are kept.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let mut evicted = 0;
        let mut entries = lock(&self.entries);
        for (target, entry) in entries.iter_mut() {
            if entry.strong.is_none() || entry.pins.load(Ordering::Acquire) > 0 {
                continue;
            }
            if now.saturating_duration_since(entry.last_used) >= self.settings.idle_timeout {
                tracing::trace!("Releasing idle executor for {}", target);
                entry.strong = None;
                evicted += 1;
            }
        }
        evicted
    }

    /// Recompile every target that read `graph`, directly or through an
    /// instance of it, and invalidate those whose result changed.
    pub fn on_graph_changed(&self, graph: GraphId) -> usize {
        let affected: Vec<GraphPinRef> = {
            let entries = lock(&self.entries);
            entries
                .iter()
                .filter(|(_, e)| e.status.is_some())
                .filter(|(_, e)| e.referenced_graphs.iter().any(|&r| self.derives_from(r, graph)))
                .map(|(t, _)| t.clone())
                .collect()
        };
        if affected.is_empty() {
            return 0;
        }

        tracing::debug!("Graph {} changed, recompiling {} executor(s)", graph, affected.len());
        let _invalidation = InvalidationScope::new();
        let scope = CompilationScope::new();
        for target in &affected {
            if target.graph == graph && self.provider.graph(graph).is_none() {
                self.remove_target(target);
            } else {
                self.compile_and_store(target, &scope);
            }
        }
        affected.len()
    }

    /// Drop every target of a deleted graph.
    pub fn on_graph_removed(&self, graph: GraphId) -> usize {
        let targets: Vec<_> = lock(&self.entries)
            .keys()
            .filter(|t| t.graph == graph)
            .cloned()
            .collect();
        let _invalidation = InvalidationScope::new();
        for target in &targets {
            self.remove_target(target);
        }
        // Callers inlining the deleted graph must fail now.
        self.on_graph_changed(graph);
        targets.len()
    }

    /// `graph` is `ancestor` or an instance of it.
    fn derives_from(&self, graph: GraphId, ancestor: GraphId) -> bool {
        let mut current = Some(graph);
        let mut hops = 0;
        while let Some(g) = current {
            if g == ancestor {
                return true;
            }
            hops += 1;
            if hops > 64 {
                tracing::warn!("Instance chain of graph {} is too deep or cyclic", graph);
                return false;
            }
            current = self.provider.parent(g);
        }
        false
    }

    fn remove_target(&self, target: &GraphPinRef) {
        let Some(entry) = lock(&self.entries).remove(target) else {
            return;
        };
        if let Some(id) = entry.executor_id {
            self.environment.diagnostics.clear_generation(id);
        }
        entry.dependency.invalidate();
        self.publish(ExecutorUpdate {
            target: target.clone(),
            executor_id: None,
            succeeded: false,
            changed: true,
        });
    }

    fn compile_and_store(&self, target: &GraphPinRef, scope: &CompilationScope) -> Option<Arc<Executor>> {
        let id = self.next_executor_id.fetch_add(1, Ordering::Relaxed);
        let output = GraphCompiler::new(&self.registry, self.provider.as_ref())
            .with_max_template_expansions(self.settings.max_template_expansions)
            .compile(target, scope, id);
        self.environment.diagnostics.report_all(output.diagnostics.iter().cloned());
        let status = CompileStatus::of(&output);
        let succeeded = output.executor.is_some();

        let (changed, dependency, previous_id) = {
            let mut entries = lock(&self.entries);
            let entry = entries.entry(target.clone()).or_insert_with(|| Entry::new(target));
            // The first compile of a target has nothing to invalidate.
            let changed = entry.status.as_ref().is_some_and(|old| *old != status);
            entry.status = Some(status);
            entry.referenced_graphs = output.referenced_graphs.clone();
            entry.executor = output.executor.as_ref().map(Arc::downgrade).unwrap_or_default();
            entry.strong = output.executor.clone();
            entry.last_used = Instant::now();
            entry.pending = None;
            let previous_id = entry.executor_id.replace(id);
            (changed, entry.dependency.clone(), previous_id)
        };

        if let Some(previous) = previous_id {
            self.environment.diagnostics.clear_generation(previous);
        }
        if changed {
            tracing::info!("Executor for {} changed (id {}), invalidating dependents", target, id);
            dependency.invalidate();
        }
        self.publish(ExecutorUpdate {
            target: target.clone(),
            executor_id: Some(id),
            succeeded,
            changed,
        });
        output.executor
    }

    fn publish(&self, update: ExecutorUpdate) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| tx.send(update.clone()).is_ok());
    }
}

impl ExecutorSource for ExecutorManager {
    fn evaluate(&self, target: &GraphPinRef, query: &Query) -> FutureValue<RuntimeValue> {
        ExecutorManager::evaluate(self, target, query)
    }
}

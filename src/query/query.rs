//! Queries: parameters, context chain, dependency tracker and memo cache.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use rustc_hash::FxHashMap;

use crate::config::{MAX_CONTEXT_DEPTH, MAX_VOXELS_PER_QUERY};
use crate::diagnostics::DiagnosticsHub;
use crate::graph::id::{GraphId, GraphPinRef, NodeKey};
use crate::query::dependency::{Dependency, DependencyRegion, DependencyTracker};
use crate::query::error::QueryError;
use crate::query::future::FutureValue;
use crate::query::parameters::{QueryParameter, QueryParameters};
use crate::query::task::TaskScheduler;
use crate::runtime::value::{NodeOutputs, RuntimeValue};
use crate::sync::lock;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Evaluates graph pins on behalf of function calls.
pub trait ExecutorSource: Send + Sync {
    fn evaluate(&self, target: &GraphPinRef, query: &Query) -> FutureValue<RuntimeValue>;
}

/// Inputs bound by a function call, read lazily by the callee.
pub trait ContextInputs: Send + Sync {
    fn input(&self, name: &str) -> Option<FutureValue<RuntimeValue>>;
}

/// Services shared by every query of a runtime.
pub struct EvalEnvironment {
    pub scheduler: TaskScheduler,
    pub diagnostics: Arc<DiagnosticsHub>,
    pub max_context_depth: u32,
    pub max_voxels: u64,
    executors: OnceLock<Weak<dyn ExecutorSource>>,
}

impl EvalEnvironment {
    pub fn new(scheduler: TaskScheduler, diagnostics: Arc<DiagnosticsHub>) -> Self {
        Self {
            scheduler,
            diagnostics,
            max_context_depth: MAX_CONTEXT_DEPTH,
            max_voxels: MAX_VOXELS_PER_QUERY,
            executors: OnceLock::new(),
        }
    }

    pub fn with_limits(mut self, max_context_depth: u32, max_voxels: u64) -> Self {
        self.max_context_depth = max_context_depth;
        self.max_voxels = max_voxels;
        self
    }

    /// Bind the executor source used by function calls. Only the first
    /// binding is kept.
    pub fn bind_executors(&self, source: Weak<dyn ExecutorSource>) -> bool {
        self.executors.set(source).is_ok()
    }

    pub fn executors(&self) -> Option<Arc<dyn ExecutorSource>> {
        self.executors.get().and_then(|w| w.upgrade())
    }
}

impl fmt::Debug for EvalEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvalEnvironment")
            .field("scheduler", &self.scheduler)
            .field("max_context_depth", &self.max_context_depth)
            .field("max_voxels", &self.max_voxels)
            .finish()
    }
}

// ==================== Context ====================

/// One frame of the function-call chain.
pub struct QueryContext {
    id: u64,
    parent: Option<Arc<QueryContext>>,
    call: Option<NodeKey>,
    graph: Option<GraphId>,
    depth: u32,
    inputs: Option<Arc<dyn ContextInputs>>,
}

impl QueryContext {
    pub fn root() -> Arc<Self> {
        Arc::new(Self {
            id: 0,
            parent: None,
            call: None,
            graph: None,
            depth: 0,
            inputs: None,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn parent(&self) -> Option<&Arc<QueryContext>> {
        self.parent.as_ref()
    }

    /// Node that entered this context.
    pub fn call(&self) -> Option<&NodeKey> {
        self.call.as_ref()
    }

    pub fn graph(&self) -> Option<GraphId> {
        self.graph
    }

    pub fn input(&self, name: &str) -> Option<FutureValue<RuntimeValue>> {
        self.inputs.as_ref().and_then(|i| i.input(name))
    }

    /// Whether `graph` is already being evaluated up the chain.
    pub fn is_evaluating(&self, graph: GraphId) -> bool {
        let mut current = Some(self);
        while let Some(ctx) = current {
            if ctx.graph == Some(graph) {
                return true;
            }
            current = ctx.parent.as_deref();
        }
        false
    }

    /// Call chain from the outermost call inward.
    pub fn call_stack(&self) -> Vec<NodeKey> {
        let mut stack = Vec::with_capacity(self.depth as usize);
        let mut current = Some(self);
        while let Some(ctx) = current {
            if let Some(call) = &ctx.call {
                stack.push(call.clone());
            }
            current = ctx.parent.as_deref();
        }
        stack.reverse();
        stack
    }
}

impl fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryContext")
            .field("id", &self.id)
            .field("depth", &self.depth)
            .field("call", &self.call)
            .finish()
    }
}

// ==================== Memo cache ====================

/// Key of one memoized node evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoKey {
    pub executor: u64,
    pub node: u32,
    pub context: u64,
}

/// Node outputs memoized for the lifetime of a query.
#[derive(Default)]
pub struct QueryCache {
    entries: Mutex<FxHashMap<MemoKey, FutureValue<NodeOutputs>>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memoized future for `key`. The first caller installs a pending
    /// entry and runs `compute` without holding the lock; every other
    /// caller gets that same future.
    pub fn get_or_compute(
        &self,
        key: MemoKey,
        compute: impl FnOnce() -> FutureValue<NodeOutputs>,
    ) -> FutureValue<NodeOutputs> {
        let (future, promise) = {
            let mut entries = lock(&self.entries);
            if let Some(existing) = entries.get(&key) {
                return existing.clone();
            }
            let (future, promise) = FutureValue::pending();
            entries.insert(key, future.clone());
            (future, promise)
        };

        compute().on_resolved(move |outputs| {
            promise.resolve(outputs.clone());
        });
        future
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

// ==================== Query ====================

/// Immutable evaluation request. Cloning is cheap.
#[derive(Clone)]
pub struct Query {
    environment: Arc<EvalEnvironment>,
    parameters: Arc<QueryParameters>,
    context: Arc<QueryContext>,
    tracker: DependencyTracker,
    cache: Arc<QueryCache>,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("parameters", &self.parameters)
            .field("context", &self.context)
            .field("tracker", &self.tracker)
            .finish()
    }
}

impl Query {
    pub fn new(environment: Arc<EvalEnvironment>, parameters: QueryParameters, tracker: DependencyTracker) -> Self {
        Self {
            environment,
            parameters: Arc::new(parameters),
            context: QueryContext::root(),
            tracker,
            cache: Arc::new(QueryCache::new()),
        }
    }

    pub fn environment(&self) -> &Arc<EvalEnvironment> {
        &self.environment
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.environment.scheduler
    }

    pub fn diagnostics(&self) -> &DiagnosticsHub {
        &self.environment.diagnostics
    }

    pub fn parameters(&self) -> &QueryParameters {
        &self.parameters
    }

    pub fn parameter<P: QueryParameter>(&self) -> Option<&P> {
        self.parameters.get::<P>()
    }

    pub fn context(&self) -> &Arc<QueryContext> {
        &self.context
    }

    pub fn tracker(&self) -> &DependencyTracker {
        &self.tracker
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn add_dependency(&self, dependency: &Arc<Dependency>) {
        self.tracker.add_dependency(dependency);
    }

    pub fn add_dependency_region(&self, dependency: &Arc<Dependency>, region: DependencyRegion) {
        self.tracker.add_dependency_region(dependency, region);
    }

    /// Same context and tracker, new parameters and a fresh memo cache.
    pub fn make_new_query(&self, parameters: QueryParameters) -> Query {
        Query {
            environment: self.environment.clone(),
            parameters: Arc::new(parameters),
            context: self.context.clone(),
            tracker: self.tracker.clone(),
            cache: Arc::new(QueryCache::new()),
        }
    }

    /// Copy of this query with one parameter added or replaced.
    pub fn with_parameter<P: QueryParameter>(&self, parameter: P) -> Query {
        self.make_new_query(self.parameters.as_ref().clone().with(parameter))
    }

    /// Enter a function call. The memo cache is shared; the new context id
    /// separates the memo entries.
    pub fn enter_context(
        &self,
        call: NodeKey,
        graph: GraphId,
        inputs: Arc<dyn ContextInputs>,
    ) -> Result<Query, QueryError> {
        let depth = self.context.depth + 1;
        let max = self.environment.max_context_depth;
        if depth > max {
            return Err(QueryError::ContextTooDeep { depth, max });
        }
        let context = Arc::new(QueryContext {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            parent: Some(self.context.clone()),
            call: Some(call),
            graph: Some(graph),
            depth,
            inputs: Some(inputs),
        });
        Ok(Query {
            environment: self.environment.clone(),
            parameters: self.parameters.clone(),
            context,
            tracker: self.tracker.clone(),
            cache: self.cache.clone(),
        })
    }
}

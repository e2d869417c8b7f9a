//! Per-session translation cache.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use rustc_hash::FxHashMap;

use crate::diagnostics::{Diagnostic, DiagnosticScope};
use crate::graph::error::{GraphError, GraphResult};
use crate::graph::id::GraphId;
use crate::graph::ir::IrGraph;
use crate::graph::library::GraphProvider;
use crate::graph::operation::OperationRegistry;
use crate::graph::passes;
use crate::graph::translate::Translator;
use crate::sync::{read, write};

/// A translated graph, ready to be cloned into a compile.
#[derive(Debug)]
pub struct TranslatedGraph {
    /// IR with the exec output already added.
    pub graph: IrGraph,
    pub referenced_graphs: BTreeSet<GraphId>,
}

#[derive(Debug)]
struct CacheEntry {
    result: Option<Arc<TranslatedGraph>>,
    /// Replayed into every compile that hits this entry.
    diagnostics: Vec<Diagnostic>,
}

/// Memoizes declarative-to-IR translation per graph id.
///
/// Concurrent requests for the same graph wait on one translation and all
/// observe the same `Arc<TranslatedGraph>`.
#[derive(Debug, Default)]
pub struct CompilationScope {
    entries: RwLock<FxHashMap<GraphId, Arc<OnceLock<CacheEntry>>>>,
    translations: AtomicUsize,
}

impl CompilationScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate `graph`, or return the cached translation.
    ///
    /// `Ok(None)` means the provider has no such graph.
    pub fn translate(
        &self,
        graph: GraphId,
        registry: &OperationRegistry,
        provider: &dyn GraphProvider,
        diags: &mut DiagnosticScope,
    ) -> GraphResult<Option<Arc<TranslatedGraph>>> {
        let Some(source) = provider.graph(graph) else {
            return Ok(None);
        };

        let cell = {
            let entries = read(&self.entries);
            entries.get(&graph).cloned()
        };
        let cell = match cell {
            Some(cell) => cell,
            None => write(&self.entries).entry(graph).or_default().clone(),
        };

        let entry = cell.get_or_init(|| {
            self.translations.fetch_add(1, Ordering::Relaxed);
            let mut local = DiagnosticScope::new();
            let result = Translator::new(registry, provider)
                .translate(&source, &mut local)
                .and_then(|t| {
                    let mut ir = t.graph;
                    passes::add_exec_output(&mut ir)?;
                    Ok(TranslatedGraph {
                        graph: ir,
                        referenced_graphs: t.referenced_graphs,
                    })
                });
            match result {
                Ok(t) => CacheEntry {
                    result: Some(Arc::new(t)),
                    diagnostics: local.into_messages(),
                },
                Err(e) => {
                    tracing::debug!("Translation of graph {} failed: {}", graph, e);
                    CacheEntry {
                        result: None,
                        diagnostics: local.into_messages(),
                    }
                }
            }
        });

        diags.extend(entry.diagnostics.iter().cloned());
        match &entry.result {
            Some(t) => Ok(Some(t.clone())),
            None => Err(GraphError::TranslationFailed {
                graph,
                errors: entry.diagnostics.iter().filter(|d| d.is_error()).count(),
            }),
        }
    }

    /// Drop the cached translation of an edited graph.
    pub fn invalidate(&self, graph: GraphId) -> bool {
        write(&self.entries).remove(&graph).is_some()
    }

    pub fn clear(&self) {
        write(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of translations actually performed.
    pub fn translation_count(&self) -> usize {
        self.translations.load(Ordering::Relaxed)
    }
}

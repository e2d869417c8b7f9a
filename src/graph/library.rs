//! Graph storage and lookup.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

use crate::graph::compiled::CompiledGraph;
use crate::graph::error::GraphResult;
use crate::graph::id::GraphId;
use crate::sync::{read, write};

/// Source of declarative graphs for the compiler and executor manager.
///
/// `parent` links an instance graph to the graph it overrides. Executor
/// lookups fall back along this chain when a pin is missing.
#[cfg_attr(test, mockall::automock)]
pub trait GraphProvider: Send + Sync {
    fn graph(&self, id: GraphId) -> Option<Arc<CompiledGraph>>;

    fn parent(&self, id: GraphId) -> Option<GraphId>;
}

/// In-memory [`GraphProvider`] with a revision counter.
#[derive(Debug, Default)]
pub struct GraphLibrary {
    graphs: RwLock<FxHashMap<GraphId, Arc<CompiledGraph>>>,
    parents: RwLock<FxHashMap<GraphId, GraphId>>,
    revision: AtomicU64,
}

impl GraphLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a graph, returning the previous version.
    pub fn insert(&self, graph: CompiledGraph) -> Option<Arc<CompiledGraph>> {
        self.revision.fetch_add(1, Ordering::Relaxed);
        write(&self.graphs).insert(graph.id, Arc::new(graph))
    }

    pub fn remove(&self, id: GraphId) -> Option<Arc<CompiledGraph>> {
        self.revision.fetch_add(1, Ordering::Relaxed);
        write(&self.parents).remove(&id);
        write(&self.graphs).remove(&id)
    }

    pub fn set_parent(&self, instance: GraphId, parent: GraphId) {
        write(&self.parents).insert(instance, parent);
    }

    pub fn contains(&self, id: GraphId) -> bool {
        read(&self.graphs).contains_key(&id)
    }

    pub fn ids(&self) -> Vec<GraphId> {
        let mut ids: Vec<_> = read(&self.graphs).keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        read(&self.graphs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bumped on every insert or removal.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Relaxed)
    }

    /// Load every `*.json` graph in a directory. Returns the loaded ids.
    pub fn load_dir(&self, dir: &Path) -> GraphResult<Vec<GraphId>> {
        let mut loaded = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let graph = CompiledGraph::load(&path)?;
            tracing::debug!("Loaded graph {} from {}", graph.id, path.display());
            loaded.push(graph.id);
            self.insert(graph);
        }
        loaded.sort();
        Ok(loaded)
    }
}

impl GraphProvider for GraphLibrary {
    fn graph(&self, id: GraphId) -> Option<Arc<CompiledGraph>> {
        read(&self.graphs).get(&id).cloned()
    }

    fn parent(&self, id: GraphId) -> Option<GraphId> {
        read(&self.parents).get(&id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_replace_remove() {
        let lib = GraphLibrary::new();
        assert!(lib.insert(CompiledGraph::new(GraphId(1), "a")).is_none());
        let old = lib.insert(CompiledGraph::new(GraphId(1), "b")).unwrap();
        assert_eq!(old.name, "a");
        assert_eq!(lib.graph(GraphId(1)).unwrap().name, "b");
        assert_eq!(lib.revision(), 2);

        lib.set_parent(GraphId(1), GraphId(0));
        assert_eq!(lib.parent(GraphId(1)), Some(GraphId(0)));
        lib.remove(GraphId(1));
        assert!(lib.is_empty());
        assert_eq!(lib.parent(GraphId(1)), None);
    }

    #[test]
    fn test_load_dir_skips_other_files() {
        let dir = tempfile::tempdir().unwrap();
        CompiledGraph::new(GraphId(5), "five")
            .save(&dir.path().join("five.json"))
            .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let lib = GraphLibrary::new();
        assert_eq!(lib.load_dir(dir.path()).unwrap(), vec![GraphId(5)]);
        assert!(lib.contains(GraphId(5)));
    }
}

//! Sparse octree updated incrementally through three callbacks.
//!
//! Cells live on an integer lattice where a node of height `h` spans
//! `1 << h` leaf cells per axis. The root has height `depth` and is centered
//! on the origin. Only nodes whose parent chose to subdivide exist, so the
//! live leaves are exactly the height-0 nodes.

use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};

use crate::math::{Aabb, Vec3};

new_key_type! {
    pub struct OctreeKey;
}

/// Integer cube in leaf-cell units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellBounds {
    pub min: [i64; 3],
    pub size: i64,
}

impl CellBounds {
    /// World box of the cell when one leaf cell measures `cell_size`.
    pub fn to_aabb(&self, cell_size: f64) -> Aabb {
        let min = Vec3::new(self.min[0] as f64, self.min[1] as f64, self.min[2] as f64) * cell_size;
        Aabb {
            min,
            max: min + Vec3::splat(self.size as f64 * cell_size),
        }
    }

    fn child(&self, index: usize) -> CellBounds {
        let half = self.size / 2;
        CellBounds {
            min: [
                self.min[0] + if index & 1 != 0 { half } else { 0 },
                self.min[1] + if index & 2 != 0 { half } else { 0 },
                self.min[2] + if index & 4 != 0 { half } else { 0 },
            ],
            size: half,
        }
    }
}

/// Read-only view of a node handed to the update callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OctreeNodeRef {
    pub key: OctreeKey,
    pub height: u32,
    pub bounds: CellBounds,
}

#[derive(Debug, Clone)]
struct OctreeNode<T> {
    height: u32,
    bounds: CellBounds,
    children: Option<[OctreeKey; 8]>,
    data: T,
}

#[derive(Debug, Clone)]
pub struct Octree<T> {
    depth: u32,
    root: OctreeKey,
    nodes: SlotMap<OctreeKey, OctreeNode<T>>,
}

impl<T: Default> Octree<T> {
    pub fn new(depth: u32) -> Self {
        let size = 1i64 << depth;
        let offset = -(size / 2);
        let mut nodes = SlotMap::with_key();
        let root = nodes.insert(OctreeNode {
            height: depth,
            bounds: CellBounds {
                min: [offset; 3],
                size,
            },
            children: None,
            data: T::default(),
        });
        Self { depth, root, nodes }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn root_bounds(&self) -> CellBounds {
        self.nodes[self.root].bounds
    }

    pub fn get(&self, key: OctreeKey) -> Option<&T> {
        self.nodes.get(key).map(|n| &n.data)
    }

    /// Height-0 nodes with their data.
    pub fn leaves(&self) -> impl Iterator<Item = (OctreeNodeRef, &T)> + '_ {
        self.nodes.iter().filter(|(_, n)| n.height == 0).map(|(key, n)| {
            (
                OctreeNodeRef {
                    key,
                    height: 0,
                    bounds: n.bounds,
                },
                &n.data,
            )
        })
    }

    /// Walks the tree from the root.
    ///
    /// - `should_subdivide(node, num_nodes)` decides whether a node above
    ///   height 0 keeps (or gains) its eight children.
    /// - `on_create` runs for every node created, parents first.
    /// - `on_destroy` runs for every node removed, children first.
    pub fn update(
        &mut self,
        mut should_subdivide: impl FnMut(&OctreeNodeRef, usize) -> bool,
        mut on_create: impl FnMut(&OctreeNodeRef, &mut T),
        mut on_destroy: impl FnMut(&OctreeNodeRef, &mut T),
    ) {
        let mut stack = vec![self.root];
        while let Some(key) = stack.pop() {
            let Some(node) = self.nodes.get(key) else {
                continue;
            };
            let node_ref = OctreeNodeRef {
                key,
                height: node.height,
                bounds: node.bounds,
            };
            if node_ref.height == 0 {
                continue;
            }

            if !should_subdivide(&node_ref, self.nodes.len()) {
                self.destroy_children(key, &mut on_destroy);
                continue;
            }

            let children = match self.nodes[key].children {
                Some(children) => children,
                None => self.create_children(&node_ref, &mut on_create),
            };
            stack.extend(children.iter().rev());
        }
    }

    fn create_children(&mut self, parent: &OctreeNodeRef, on_create: &mut impl FnMut(&OctreeNodeRef, &mut T)) -> [OctreeKey; 8] {
        let mut children = [OctreeKey::default(); 8];
        for (index, slot) in children.iter_mut().enumerate() {
            let bounds = parent.bounds.child(index);
            let height = parent.height - 1;
            let key = self.nodes.insert(OctreeNode {
                height,
                bounds,
                children: None,
                data: T::default(),
            });
            let child_ref = OctreeNodeRef { key, height, bounds };
            on_create(&child_ref, &mut self.nodes[key].data);
            *slot = key;
        }
        self.nodes[parent.key].children = Some(children);
        children
    }

    fn destroy_children(&mut self, key: OctreeKey, on_destroy: &mut impl FnMut(&OctreeNodeRef, &mut T)) {
        let Some(children) = self.nodes.get_mut(key).and_then(|n| n.children.take()) else {
            return;
        };
        for child in children {
            self.destroy_children(child, on_destroy);
            if let Some(mut node) = self.nodes.remove(child) {
                let node_ref = OctreeNodeRef {
                    key: child,
                    height: node.height,
                    bounds: node.bounds,
                };
                on_destroy(&node_ref, &mut node.data);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touches_origin(node: &OctreeNodeRef) -> bool {
        (0..3).all(|a| node.bounds.min[a] <= 0 && 0 < node.bounds.min[a] + node.bounds.size)
    }

    #[test]
    fn test_root_is_centered() {
        let tree: Octree<u32> = Octree::new(3);
        assert_eq!(
            tree.root_bounds(),
            CellBounds {
                min: [-4; 3],
                size: 8
            }
        );
        assert_eq!(tree.num_nodes(), 1);
        assert_eq!(tree.leaves().count(), 0);
    }

    #[test]
    fn test_subdivide_toward_origin() {
        let mut tree: Octree<u32> = Octree::new(3);
        let mut created = 0;
        tree.update(|n, _| touches_origin(n), |_, _| created += 1, |_, _| {});
        // One chain of subdivisions, eight children per level.
        assert_eq!(created, 24);
        assert_eq!(tree.leaves().count(), 8);
    }

    #[test]
    fn test_collapse_destroys_children_first() {
        let mut tree: Octree<u32> = Octree::new(2);
        tree.update(|_, _| true, |_, _| {}, |_, _| {});
        assert_eq!(tree.num_nodes(), 1 + 8 + 64);

        let mut heights = Vec::new();
        tree.update(|_, _| false, |_, _| {}, |n, _| heights.push(n.height));
        assert_eq!(heights.len(), 72);
        assert_eq!(heights[0], 0);
        assert_eq!(tree.num_nodes(), 1);
    }

    #[test]
    fn test_data_survives_updates() {
        let mut tree: Octree<u32> = Octree::new(1);
        let mut next = 0;
        tree.update(
            |_, _| true,
            |_, data| {
                next += 1;
                *data = next;
            },
            |_, _| {},
        );
        let before: Vec<u32> = tree.leaves().map(|(_, d)| *d).collect();

        tree.update(|_, _| true, |_, _| panic!("no new nodes"), |_, _| panic!("nothing removed"));
        let after: Vec<u32> = tree.leaves().map(|(_, d)| *d).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_budget_from_node_count() {
        let mut tree: Octree<u32> = Octree::new(4);
        tree.update(|_, count| count <= 20, |_, _| {}, |_, _| {});
        assert!(tree.num_nodes() <= 20 + 8);
    }

    #[test]
    fn test_cell_to_aabb() {
        let cell = CellBounds {
            min: [-1, 0, 2],
            size: 2,
        };
        let b = cell.to_aabb(10.0);
        assert_eq!(b.min, Vec3::new(-10.0, 0.0, 20.0));
        assert_eq!(b.max, Vec3::new(10.0, 20.0, 40.0));
    }
}

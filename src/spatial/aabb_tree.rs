//! Static bounding-box tree over indexed elements.
//!
//! Built once, top-down, by splitting on the longest axis at the median
//! element center. Internal node bounds are exact unions of their
//! children, so pruning with [`AabbTree::overlap`] never rejects an element
//! whose own bounds intersect the query.

use crate::math::Aabb;

/// Maximum number of elements stored in a single leaf.
pub const MAX_LEAF_ELEMENTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AabbElement {
    pub bounds: Aabb,
    pub index: usize,
}

#[derive(Debug, Clone)]
enum TreeNode {
    Internal { bounds: Aabb, left: usize, right: usize },
    Leaf { bounds: Aabb, start: usize, end: usize },
}

impl TreeNode {
    fn bounds(&self) -> &Aabb {
        match self {
            TreeNode::Internal { bounds, .. } | TreeNode::Leaf { bounds, .. } => bounds,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AabbTree {
    nodes: Vec<TreeNode>,
    elements: Vec<AabbElement>,
}

impl AabbTree {
    pub fn new(mut elements: Vec<AabbElement>) -> Self {
        elements.retain(|e| e.bounds.is_valid());
        let mut tree = Self {
            nodes: Vec::with_capacity(elements.len().max(1) * 2 / MAX_LEAF_ELEMENTS + 1),
            elements,
        };
        if !tree.elements.is_empty() {
            let len = tree.elements.len();
            tree.build(0, len);
        }
        tree
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn bounds(&self) -> Aabb {
        self.nodes.first().map_or(Aabb::EMPTY, |n| *n.bounds())
    }

    pub fn elements(&self) -> &[AabbElement] {
        &self.elements
    }

    fn build(&mut self, start: usize, end: usize) -> usize {
        let bounds = self.elements[start..end]
            .iter()
            .fold(Aabb::EMPTY, |acc, e| acc.union(&e.bounds));
        let node = self.nodes.len();

        if end - start <= MAX_LEAF_ELEMENTS {
            self.nodes.push(TreeNode::Leaf { bounds, start, end });
            return node;
        }

        let size = bounds.size();
        let axis = if size.x >= size.y && size.x >= size.z {
            0
        } else if size.y >= size.z {
            1
        } else {
            2
        };
        self.elements[start..end].sort_by(|a, b| {
            a.bounds
                .center()
                .component(axis)
                .total_cmp(&b.bounds.center().component(axis))
        });

        // Placeholder, patched once both children exist.
        self.nodes.push(TreeNode::Leaf { bounds, start, end });
        let mid = start + (end - start) / 2;
        let left = self.build(start, mid);
        let right = self.build(mid, end);
        self.nodes[node] = TreeNode::Internal { bounds, left, right };
        node
    }

    /// Calls `f` for every element whose bounds intersect `query` until it
    /// returns `true`. Returns whether any call did.
    pub fn overlap(&self, query: &Aabb, mut f: impl FnMut(usize) -> bool) -> bool {
        if self.nodes.is_empty() {
            return false;
        }
        let mut stack = vec![0usize];
        while let Some(node) = stack.pop() {
            match &self.nodes[node] {
                TreeNode::Internal { bounds, left, right } => {
                    if bounds.intersects(query) {
                        stack.push(*right);
                        stack.push(*left);
                    }
                }
                TreeNode::Leaf { bounds, start, end } => {
                    if !bounds.intersects(query) {
                        continue;
                    }
                    for element in &self.elements[*start..*end] {
                        if element.bounds.intersects(query) && f(element.index) {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }

    /// Indices of every element intersecting `query`.
    pub fn query(&self, query: &Aabb) -> Vec<usize> {
        let mut out = Vec::new();
        self.overlap(query, |index| {
            out.push(index);
            false
        });
        out
    }

    /// Generic traversal: `should_visit` is asked about node bounds and then
    /// about each element's bounds; accepted elements go to `on_element`.
    pub fn traverse(&self, mut should_visit: impl FnMut(&Aabb) -> bool, mut on_element: impl FnMut(usize)) {
        if self.nodes.is_empty() {
            return;
        }
        let mut stack = vec![0usize];
        while let Some(node) = stack.pop() {
            let current = &self.nodes[node];
            if !should_visit(current.bounds()) {
                continue;
            }
            match current {
                TreeNode::Internal { left, right, .. } => {
                    stack.push(*right);
                    stack.push(*left);
                }
                TreeNode::Leaf { start, end, .. } => {
                    for element in &self.elements[*start..*end] {
                        if should_visit(&element.bounds) {
                            on_element(element.index);
                        }
                    }
                }
            }
        }
    }
}

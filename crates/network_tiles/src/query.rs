//! Read-side region queries over a built or reloaded tree.

use std::sync::Arc;

use crate::centroid::SpatialCentroid;
use crate::node::QuadNode;

/// Region queries over a tree rooted at `root`.
///
/// Matching is by region overlap only. A returned leaf may hold no object
/// that actually lies inside the query rectangle.
pub struct QueryEngine<T> {
    root: Arc<QuadNode<T>>,
}

impl<T> QueryEngine<T> {
    pub fn new(root: Arc<QuadNode<T>>) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Arc<QuadNode<T>> {
        &self.root
    }

    /// Every leaf whose region overlaps `region`.
    pub fn matching_leaves(&self, region: &SpatialCentroid) -> Vec<Arc<QuadNode<T>>> {
        let mut leaves = Vec::new();
        if !region.overlaps(self.root.centroid()) {
            return leaves;
        }

        let mut stack = vec![Arc::clone(&self.root)];
        while let Some(node) = stack.pop() {
            match node.children() {
                None => leaves.push(node),
                Some(children) => stack.extend(
                    children
                        .iter()
                        .rev()
                        .filter(|child| region.overlaps(child.centroid()))
                        .cloned(),
                ),
            }
        }
        leaves
    }

    /// Nodes covering `region` at the finest level that fits in `budget`.
    ///
    /// Descends level by level. Once expanding the whole frontier would return
    /// more than `budget` nodes, internal nodes that have a sparse bag are
    /// returned in place of their subtrees. Internal nodes without one have no
    /// content of their own and are always expanded, so the result can exceed
    /// `budget` when the tree was never sparsified.
    pub fn sparse_matching_leaves(
        &self,
        region: &SpatialCentroid,
        budget: usize,
    ) -> Vec<Arc<QuadNode<T>>> {
        if !region.overlaps(self.root.centroid()) {
            return Vec::new();
        }

        let mut frontier = vec![Arc::clone(&self.root)];
        loop {
            if frontier.iter().all(|node| node.is_leaf()) {
                return frontier;
            }

            let expanded = self.expand(&frontier, region, |_| true);
            if expanded.len() <= budget {
                frontier = expanded;
                continue;
            }

            let forced = self.expand(&frontier, region, |node| node.sparse_bag_id().is_none());
            if forced.len() == frontier.len()
                && forced.iter().zip(&frontier).all(|(a, b)| a.guid() == b.guid())
            {
                return forced;
            }
            frontier = forced;
        }
    }

    /// Replaces each internal node accepted by `expand` with its overlapping
    /// children.
    fn expand<F>(
        &self,
        frontier: &[Arc<QuadNode<T>>],
        region: &SpatialCentroid,
        expand: F,
    ) -> Vec<Arc<QuadNode<T>>>
    where
        F: Fn(&QuadNode<T>) -> bool,
    {
        let mut next = Vec::with_capacity(frontier.len() * 4);
        for node in frontier {
            match node.children() {
                Some(children) if expand(node) => next.extend(
                    children
                        .iter()
                        .filter(|child| region.overlaps(child.centroid()))
                        .cloned(),
                ),
                _ => next.push(Arc::clone(node)),
            }
        }
        next
    }
}

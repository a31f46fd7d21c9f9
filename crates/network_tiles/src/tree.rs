//! The quadtree and its insertion algorithm.
//!
//! Insertion walks an explicit worklist instead of recursing. An object that
//! matches several children (an edge crossing a border) descends into the
//! first match and the remaining matches are pushed back onto the worklist,
//! so it ends up in every leaf it touches.
//!
//! Leaves never grow without bound: once a leaf buffers
//! `max_objects_per_bag` objects they are shed as a [`QuadBag`] through
//! [`TreeHooks::shed`]. After `max_bags_before_split` sheds the leaf splits
//! and asks the hooks to pull its old bags back for redistribution.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::bag::QuadBag;
use crate::centroid::SpatialCentroid;
use crate::config::BuildSettings;
use crate::error::{InsertError, InsertResult};
use crate::node::{NodeId, QuadNode, Quadable};

/// Callbacks the tree uses to hand data to whoever drives the build.
///
/// Implementations must be safe to call concurrently from many workers.
pub trait TreeHooks<T>: Send + Sync {
    /// Called once for every node, before it becomes reachable.
    fn register(&self, _node: &Arc<QuadNode<T>>) {}

    /// Takes ownership of a bag drained from a node.
    fn shed(&self, bag: QuadBag<T>);

    /// Called by the thread that split `node_id`; its shed bags must be
    /// reinserted below it.
    fn mark_for_rework(&self, node_id: NodeId);
}

/// Thresholds that drive shedding and splitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeLimits {
    pub max_objects_per_bag: usize,
    pub max_bags_before_split: usize,
    pub max_depth: u32,
}

impl From<&BuildSettings> for TreeLimits {
    fn from(settings: &BuildSettings) -> Self {
        Self {
            max_objects_per_bag: settings.max_objects_per_bag,
            max_bags_before_split: settings.max_bags_before_split,
            max_depth: settings.max_depth,
        }
    }
}

impl Default for TreeLimits {
    fn default() -> Self {
        Self::from(&BuildSettings::default())
    }
}

/// Running totals for a tree.
#[derive(Debug, Default)]
pub struct TreeStats {
    objects_inserted: AtomicUsize,
    leaf_appends: AtomicUsize,
    unmatched_objects: AtomicUsize,
    splits: AtomicUsize,
    bags_shed: AtomicUsize,
    objects_shed: AtomicUsize,
}

/// Point-in-time copy of [`TreeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TreeStatsSnapshot {
    pub objects_inserted: usize,
    /// Includes duplicates from border fan-out
    pub leaf_appends: usize,
    /// Descent steps where no child matched; each one is a logic error
    pub unmatched_objects: usize,
    pub splits: usize,
    pub bags_shed: usize,
    pub objects_shed: usize,
}

impl TreeStats {
    pub fn snapshot(&self) -> TreeStatsSnapshot {
        TreeStatsSnapshot {
            objects_inserted: self.objects_inserted.load(Ordering::Relaxed),
            leaf_appends: self.leaf_appends.load(Ordering::Relaxed),
            unmatched_objects: self.unmatched_objects.load(Ordering::Relaxed),
            splits: self.splits.load(Ordering::Relaxed),
            bags_shed: self.bags_shed.load(Ordering::Relaxed),
            objects_shed: self.objects_shed.load(Ordering::Relaxed),
        }
    }
}

/// A quadtree being built.
pub struct QuadTree<T> {
    tree_id: Uuid,
    root: Arc<QuadNode<T>>,
    /// Every node by id; each id is written once, when the node is created
    registry: DashMap<NodeId, Arc<QuadNode<T>>>,
    hooks: Arc<dyn TreeHooks<T>>,
    limits: TreeLimits,
    stats: TreeStats,
}

impl<T> QuadTree<T>
where
    T: Quadable + Clone + Send + Sync,
{
    /// Creates an empty tree covering `centroid`.
    pub fn new(centroid: SpatialCentroid, limits: TreeLimits, hooks: Arc<dyn TreeHooks<T>>) -> Self {
        let tree_id = Uuid::new_v4();
        let root = Arc::new(QuadNode::new_root(centroid, tree_id));
        let tree = Self {
            tree_id,
            root: Arc::clone(&root),
            registry: DashMap::new(),
            hooks,
            limits,
            stats: TreeStats::default(),
        };
        tree.register(&root);
        info!("🌳 Created quadtree {} over {}", tree_id, centroid);
        tree
    }

    pub fn tree_id(&self) -> Uuid {
        self.tree_id
    }

    pub fn root(&self) -> &Arc<QuadNode<T>> {
        &self.root
    }

    pub fn limits(&self) -> TreeLimits {
        self.limits
    }

    pub fn stats(&self) -> TreeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Looks up a node by id.
    pub fn node(&self, node_id: &NodeId) -> Option<Arc<QuadNode<T>>> {
        self.registry.get(node_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn node_count(&self) -> usize {
        self.registry.len()
    }

    /// Inserts an object starting from the root.
    pub fn insert_one(&self, object: T) -> InsertResult<()> {
        self.stats.objects_inserted.fetch_add(1, Ordering::Relaxed);
        self.process(vec![(Arc::clone(&self.root), object)])
    }

    /// Inserts an object starting from a known node.
    pub fn insert_into(&self, node: &Arc<QuadNode<T>>, object: T) -> InsertResult<()> {
        self.stats.objects_inserted.fetch_add(1, Ordering::Relaxed);
        self.process(vec![(Arc::clone(node), object)])
    }

    /// Inserts an object starting from the node registered under `node_id`.
    pub fn insert_into_id(&self, node_id: &NodeId, object: T) -> InsertResult<()> {
        let node = self.node(node_id).ok_or(InsertError::UnknownNode(*node_id))?;
        self.insert_into(&node, object)
    }

    /// Flushes every node's buffer to the shed hook.
    ///
    /// Returns the number of objects shed.
    pub fn shed_all(&self) -> usize {
        let mut shed = 0;
        for node in self.root.descendants() {
            shed += self.shed_node(&node).map(|(objects, _)| objects).unwrap_or(0);
        }
        debug!("shed_all flushed {} objects from tree {}", shed, self.tree_id);
        shed
    }

    fn process(&self, mut worklist: Vec<(Arc<QuadNode<T>>, T)>) -> InsertResult<()> {
        let mut result = Ok(());

        'worklist: while let Some((mut node, object)) = worklist.pop() {
            while !node.is_leaf() {
                let mut matches = node.matching_children(&object).into_iter().cloned();
                let Some(first) = matches.next() else {
                    self.stats.unmatched_objects.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "❌ Logic error: no child of node {} ({}) matches object {}",
                        node.guid(),
                        node.centroid(),
                        object.id()
                    );
                    result = Err(InsertError::NoMatchingChild {
                        node: node.guid(),
                        object: object.id(),
                    });
                    continue 'worklist;
                };
                for other in matches {
                    worklist.push((other, object.clone()));
                }
                node = first;
            }

            self.append(&node, object);
        }

        result
    }

    fn append(&self, leaf: &Arc<QuadNode<T>>, object: T) {
        leaf.push_local(object);
        self.stats.leaf_appends.fetch_add(1, Ordering::Relaxed);
        // pairs with the fence in `split`
        fence(Ordering::SeqCst);

        if !leaf.is_leaf() {
            // the node split under us; internal nodes must not keep objects
            self.shed_node(leaf);
            return;
        }

        if leaf.local_len() < self.limits.max_objects_per_bag {
            return;
        }

        let Some((_, bags_shed)) = self.shed_node(leaf) else {
            return;
        };

        if bags_shed >= self.limits.max_bags_before_split
            && leaf.depth() < self.limits.max_depth
            && self.split(leaf)
        {
            self.hooks.mark_for_rework(leaf.guid());
            // anything appended between the drain and the split
            self.shed_node(leaf);
        }
    }

    fn split(&self, leaf: &Arc<QuadNode<T>>) -> bool {
        if !leaf.try_split(|child| self.register(child)) {
            return false;
        }
        fence(Ordering::SeqCst);
        self.stats.splits.fetch_add(1, Ordering::Relaxed);
        debug!(
            "✂️ Split node {} at depth {} ({})",
            leaf.guid(),
            leaf.depth(),
            leaf.centroid()
        );
        true
    }

    /// Drains a node into a bag. Returns the object count and the node's
    /// bag count, or `None` when the buffer was already empty.
    fn shed_node(&self, node: &QuadNode<T>) -> Option<(usize, usize)> {
        let objects = node.drain_local();
        if objects.is_empty() {
            return None;
        }

        let count = objects.len();
        let bags_shed = node.counters().record_shed(count);
        self.stats.bags_shed.fetch_add(1, Ordering::Relaxed);
        self.stats.objects_shed.fetch_add(count, Ordering::Relaxed);
        debug!("Shed {} objects from node {} (bag #{})", count, node.guid(), bags_shed);

        self.hooks
            .shed(QuadBag::new(node.guid(), self.tree_id, objects));
        Some((count, bags_shed))
    }

    fn register(&self, node: &Arc<QuadNode<T>>) {
        self.registry.insert(node.guid(), Arc::clone(node));
        self.hooks.register(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Dot {
        id: usize,
        x: f64,
        y: f64,
    }

    impl Quadable for Dot {
        fn id(&self) -> String {
            self.id.to_string()
        }

        fn is_within(&self, region: &SpatialCentroid) -> bool {
            region.contains_point(self.x, self.y)
        }
    }

    /// Keeps shed bags in memory and reinserts nothing.
    #[derive(Default)]
    struct Recorder {
        shed: Mutex<Vec<QuadBag<Dot>>>,
        reworked: Mutex<Vec<NodeId>>,
    }

    impl TreeHooks<Dot> for Recorder {
        fn shed(&self, bag: QuadBag<Dot>) {
            self.shed.lock().unwrap().push(bag);
        }

        fn mark_for_rework(&self, node_id: NodeId) {
            self.reworked.lock().unwrap().push(node_id);
        }
    }

    fn tree(limits: TreeLimits) -> (QuadTree<Dot>, Arc<Recorder>) {
        let hooks = Arc::new(Recorder::default());
        let tree = QuadTree::new(
            SpatialCentroid::new(0.0, 0.0, 100.0, 100.0),
            limits,
            hooks.clone() as Arc<dyn TreeHooks<Dot>>,
        );
        (tree, hooks)
    }

    fn dot(id: usize, x: f64, y: f64) -> Dot {
        Dot { id, x, y }
    }

    #[test]
    fn test_insert_below_threshold_stays_local() {
        let (tree, hooks) = tree(TreeLimits {
            max_objects_per_bag: 10,
            max_bags_before_split: 2,
            max_depth: 8,
        });
        for i in 0..9 {
            tree.insert_one(dot(i, i as f64, 0.0)).unwrap();
        }

        assert_eq!(tree.root().local_len(), 9);
        assert!(hooks.shed.lock().unwrap().is_empty());
        assert_eq!(tree.node_count(), 1);
    }

    #[test]
    fn test_overflow_sheds_a_bag() {
        let (tree, hooks) = tree(TreeLimits {
            max_objects_per_bag: 10,
            max_bags_before_split: 5,
            max_depth: 8,
        });
        for i in 0..10 {
            tree.insert_one(dot(i, 1.0, 1.0)).unwrap();
        }

        let shed = hooks.shed.lock().unwrap();
        assert_eq!(shed.len(), 1);
        assert_eq!(shed[0].len(), 10);
        assert_eq!(shed[0].owning_node_id, tree.root().guid());
        assert_eq!(tree.root().local_len(), 0);
        assert_eq!(tree.root().counters().bags_shed(), 1);
    }

    #[test]
    fn test_split_after_enough_bags_marks_rework() {
        let (tree, hooks) = tree(TreeLimits {
            max_objects_per_bag: 4,
            max_bags_before_split: 2,
            max_depth: 8,
        });
        for i in 0..8 {
            tree.insert_one(dot(i, -10.0 + i as f64, 10.0)).unwrap();
        }

        assert!(!tree.root().is_leaf());
        assert_eq!(tree.node_count(), 5);
        assert_eq!(*hooks.reworked.lock().unwrap(), vec![tree.root().guid()]);
        assert_eq!(tree.stats().splits, 1);

        // new objects descend into the children
        tree.insert_one(dot(100, 50.0, 50.0)).unwrap();
        let children = tree.root().children().unwrap();
        assert_eq!(children[3].local_len(), 1);
        assert_eq!(tree.root().local_len(), 0);
    }

    #[test]
    fn test_border_object_fans_out() {
        let (tree, _) = tree(TreeLimits {
            max_objects_per_bag: 100,
            max_bags_before_split: 1,
            max_depth: 8,
        });
        tree.root().try_split(|_| {});

        tree.insert_one(dot(1, 0.0, 50.0)).unwrap();

        let children = tree.root().children().unwrap();
        let holders: Vec<usize> = children.iter().map(|c| c.local_len()).collect();
        assert_eq!(holders, vec![0, 1, 0, 1]);
        assert_eq!(tree.stats().leaf_appends, 2);
    }

    #[test]
    fn test_unmatched_object_is_counted_and_skipped() {
        let (tree, _) = tree(TreeLimits::default());
        tree.root().try_split(|_| {});

        let result = tree.insert_one(dot(7, 500.0, 500.0));

        assert!(matches!(result, Err(InsertError::NoMatchingChild { .. })));
        assert_eq!(tree.stats().unmatched_objects, 1);
        assert_eq!(tree.root().element_count(), 0);
    }

    #[test]
    fn test_insert_into_unknown_node() {
        let (tree, _) = tree(TreeLimits::default());
        let missing = Uuid::new_v4();
        assert!(matches!(
            tree.insert_into_id(&missing, dot(1, 0.0, 0.0)),
            Err(InsertError::UnknownNode(id)) if id == missing
        ));
    }

    #[test]
    fn test_shed_all_empties_every_node() {
        let (tree, hooks) = tree(TreeLimits {
            max_objects_per_bag: 5,
            max_bags_before_split: 2,
            max_depth: 8,
        });
        for i in 0..23 {
            let x = (i as f64 * 7.0) % 90.0 - 45.0;
            tree.insert_one(dot(i, x, -x)).unwrap();
        }

        tree.shed_all();

        assert!(tree.root().descendants().iter().all(|n| !n.has_local()));
        let shed: usize = hooks.shed.lock().unwrap().iter().map(QuadBag::len).sum();
        assert_eq!(shed, 23);
        // nothing left to flush the second time
        assert_eq!(tree.shed_all(), 0);
    }

    #[test]
    fn test_coincident_points_stop_at_max_depth() {
        let (tree, _) = tree(TreeLimits {
            max_objects_per_bag: 2,
            max_bags_before_split: 1,
            max_depth: 2,
        });
        for i in 0..40 {
            tree.insert_one(dot(i, 0.0, 0.0)).unwrap();
        }

        assert_eq!(tree.root().max_depth(), 2);
        assert!(tree
            .root()
            .leaves()
            .iter()
            .all(|leaf| leaf.depth() <= 2));
    }

    #[test]
    fn test_children_are_registered() {
        let (tree, _) = tree(TreeLimits::default());
        tree.split(tree.root());
        for id in tree.root().child_ids().unwrap() {
            assert!(tree.node(&id).is_some());
        }
    }
}

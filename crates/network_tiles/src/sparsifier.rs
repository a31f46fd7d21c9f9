//! Weighted sampling of internal nodes for low-zoom rendering.
//!
//! Every internal node gets a sparse bag: a sample of its subtree drawn in
//! proportion to where the objects actually are. Each child is weighted by its
//! share of the parent's `items_in_tree`, and each bag within a child by its
//! share of that child's bag volume. Leaf children contribute their shed bags,
//! internal children their own sparse bag, so sampling works bottom-up.
//!
//! Run [`annotate_counts`](crate::report::annotate_counts) first.

use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::bag::QuadBag;
use crate::config::SparsifySettings;
use crate::node::{QuadNode, Quadable};
use crate::store::BagStore;

/// Totals from one sparsify pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SparsifySummary {
    pub nodes_sampled: usize,
    pub objects_sampled: usize,
    pub important_objects: usize,
    /// Nodes that hit the retry budget before reaching the target size
    pub exhausted: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Sparsifier {
    max_objects_per_bag: usize,
    oversample_factor: usize,
    max_tries: usize,
}

struct WeightedBag<T> {
    weight: f64,
    bag: Arc<QuadBag<T>>,
}

impl Sparsifier {
    pub fn new(max_objects_per_bag: usize, settings: &SparsifySettings) -> Self {
        Self {
            max_objects_per_bag,
            oversample_factor: settings.oversample_factor,
            max_tries: settings.max_tries,
        }
    }

    /// Sample size each internal node aims for.
    pub fn target(&self) -> usize {
        self.max_objects_per_bag * self.oversample_factor
    }

    /// Samples every internal node below `node`, children first.
    ///
    /// Objects for which `is_important` holds are always kept, so a node
    /// with many of them may exceed [`target`](Self::target). Each node makes
    /// at most `max_tries` draws, so a large target can be cut short.
    pub fn sparsify<T, F, R>(
        &self,
        node: &QuadNode<T>,
        store: &dyn BagStore<T>,
        is_important: &F,
        rng: &mut R,
    ) -> SparsifySummary
    where
        T: Quadable + Clone,
        F: Fn(&T) -> bool,
        R: Rng + ?Sized,
    {
        let mut summary = SparsifySummary::default();
        self.visit(node, store, is_important, rng, &mut summary);
        info!(
            "🎲 Sparsified {} nodes: {} objects sampled ({} important), {} hit the retry budget",
            summary.nodes_sampled,
            summary.objects_sampled,
            summary.important_objects,
            summary.exhausted
        );
        summary
    }

    fn visit<T, F, R>(
        &self,
        node: &QuadNode<T>,
        store: &dyn BagStore<T>,
        is_important: &F,
        rng: &mut R,
        summary: &mut SparsifySummary,
    ) where
        T: Quadable + Clone,
        F: Fn(&T) -> bool,
        R: Rng + ?Sized,
    {
        let Some(children) = node.children() else {
            return;
        };
        for child in children {
            self.visit(child, store, is_important, rng, summary);
        }

        let total = node.counters().items_in_tree();
        let mut table = Vec::new();
        let mut candidates = Vec::new();
        for child in children {
            let bags: Vec<Arc<QuadBag<T>>> = if child.is_leaf() {
                store.bags(&child.guid())
            } else {
                child.sparse_bag().cloned().into_iter().collect()
            };
            let count = child.counters().items_in_tree();
            let in_bags: usize = bags.iter().map(|bag| bag.len()).sum();

            if total > 0 && count > 0 && in_bags > 0 {
                let child_share = count as f64 / total as f64;
                for bag in bags.iter().filter(|bag| !bag.is_empty()) {
                    table.push(WeightedBag {
                        weight: child_share * bag.len() as f64 / in_bags as f64,
                        bag: Arc::clone(bag),
                    });
                }
            }
            candidates.extend(bags);
        }

        let mut seen = HashSet::new();
        let mut objects = Vec::new();
        for bag in &candidates {
            for object in bag.objects.iter().filter(|o| is_important(*o)) {
                if seen.insert(object.id()) {
                    objects.push(object.clone());
                }
            }
        }
        let important = objects.len();

        let target = self.target();
        let mass: f64 = table.iter().map(|entry| entry.weight).sum();
        // every draw spends a try, accepted or not
        let mut draws = 0;
        while objects.len() < target && draws < self.max_tries && mass > 0.0 {
            draws += 1;
            let bag = pick(&table, rng.gen::<f64>() * mass);
            let object = &bag.objects[rng.gen_range(0..bag.len())];
            if seen.insert(object.id()) {
                objects.push(object.clone());
            }
        }

        if objects.len() < target && draws >= self.max_tries {
            summary.exhausted += 1;
        }
        summary.nodes_sampled += 1;
        summary.objects_sampled += objects.len();
        summary.important_objects += important;

        debug!(
            "Sparse bag for node {}: {} objects ({} important) from {} bags",
            node.guid(),
            objects.len(),
            important,
            table.len()
        );
        if !node.set_sparse_bag(QuadBag::new(node.guid(), node.tree_id(), objects)) {
            debug!("Node {} already has a sparse bag, keeping it", node.guid());
        }
    }
}

/// Walks the cumulative weights to the bag owning `roll`.
fn pick<T>(table: &[WeightedBag<T>], roll: f64) -> &Arc<QuadBag<T>> {
    let mut cumulative = 0.0;
    for entry in table {
        cumulative += entry.weight;
        if roll < cumulative {
            return &entry.bag;
        }
    }
    // float rounding can leave `roll` a hair past the last boundary
    &table[table.len() - 1].bag
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::centroid::SpatialCentroid;
    use crate::report::annotate_counts;
    use crate::store::MemoryBagStore;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: usize,
        important: bool,
    }

    impl Quadable for Item {
        fn id(&self) -> String {
            self.id.to_string()
        }

        fn is_within(&self, _region: &SpatialCentroid) -> bool {
            true
        }
    }

    fn is_important(item: &Item) -> bool {
        item.important
    }

    /// A root with four leaf children, each holding `per_leaf` shed objects
    /// split over bags of `bag_size`.
    fn build(per_leaf: [usize; 4], bag_size: usize) -> (Arc<QuadNode<Item>>, MemoryBagStore<Item>) {
        let root = Arc::new(QuadNode::new_root(
            SpatialCentroid::new(0.0, 0.0, 10.0, 10.0),
            Uuid::new_v4(),
        ));
        root.try_split(|_| {});
        let store = MemoryBagStore::new();
        let mut next_id = 0;
        for (leaf, count) in root.children().unwrap().iter().zip(per_leaf) {
            let items: Vec<Item> = (next_id..next_id + count)
                .map(|id| Item {
                    id,
                    important: id % 97 == 0,
                })
                .collect();
            next_id += count;
            for chunk in items.chunks(bag_size) {
                leaf.counters().record_shed(chunk.len());
                store.put(Arc::new(QuadBag::new(leaf.guid(), leaf.tree_id(), chunk.to_vec())));
            }
        }
        annotate_counts(&root);
        (root, store)
    }

    fn sparsifier(max_objects_per_bag: usize) -> Sparsifier {
        Sparsifier::new(max_objects_per_bag, &SparsifySettings::default())
    }

    #[test]
    fn test_leaves_are_untouched() {
        let (root, store) = build([10, 10, 10, 10], 5);
        sparsifier(2).sparsify(&root, &store, &is_important, &mut StdRng::seed_from_u64(1));

        assert!(root.sparse_bag().is_some());
        for leaf in root.children().unwrap() {
            assert!(leaf.sparse_bag().is_none());
        }
    }

    #[test]
    fn test_sample_is_bounded_and_unique() {
        let (root, store) = build([400, 300, 200, 100], 50);
        let summary =
            sparsifier(20).sparsify(&root, &store, &is_important, &mut StdRng::seed_from_u64(7));

        let bag = root.sparse_bag().unwrap();
        assert_eq!(bag.len(), 100);
        assert_eq!(bag.owning_node_id, root.guid());
        assert_eq!(summary.nodes_sampled, 1);

        let ids: HashSet<String> = bag.objects.iter().map(Item::id).collect();
        assert_eq!(ids.len(), bag.len());
    }

    #[test]
    fn test_important_objects_always_kept() {
        let (root, store) = build([400, 300, 200, 100], 50);
        sparsifier(5).sparsify(&root, &store, &is_important, &mut StdRng::seed_from_u64(3));

        let bag = root.sparse_bag().unwrap();
        let important: HashSet<usize> = (0..1000).filter(|id| id % 97 == 0).collect();
        let kept: HashSet<usize> = bag
            .objects
            .iter()
            .filter(|o| o.important)
            .map(|o| o.id)
            .collect();
        assert_eq!(kept, important);
        assert!(bag.len() <= 25);
    }

    #[test]
    fn test_small_subtree_exhausts_retries() {
        let (root, store) = build([3, 2, 0, 1], 2);
        let summary =
            sparsifier(10).sparsify(&root, &store, &is_important, &mut StdRng::seed_from_u64(11));

        // only six distinct objects exist
        assert_eq!(root.sparse_bag().unwrap().len(), 6);
        assert_eq!(summary.exhausted, 1);
    }

    #[test]
    fn test_draws_are_capped_by_max_tries() {
        // 40 000 distinct objects would fill a target of 2500
        let (root, store) = build([10_000; 4], 500);
        let settings = SparsifySettings::default();
        let summary = Sparsifier::new(500, &settings).sparsify(
            &root,
            &store,
            &is_important,
            &mut StdRng::seed_from_u64(13),
        );

        let bag = root.sparse_bag().unwrap();
        let important = bag.objects.iter().filter(|o| o.important).count();
        assert_eq!(important, (0..40_000).filter(|id| id % 97 == 0).count());
        assert!(bag.len() - important <= settings.max_tries);
        assert!(bag.len() < 2500);
        assert_eq!(summary.exhausted, 1);
    }

    #[test]
    fn test_empty_children_are_never_drawn() {
        let (root, store) = build([0, 0, 50, 0], 10);
        sparsifier(4).sparsify(&root, &store, &is_important, &mut StdRng::seed_from_u64(5));

        let bag = root.sparse_bag().unwrap();
        assert_eq!(bag.len(), 20);
        assert!(bag.objects.iter().all(|o| o.id < 50));
    }

    #[test]
    fn test_nested_nodes_sample_from_child_sparse_bags() {
        let (root, store) = build([100, 100, 100, 100], 25);
        let inner = &root.children().unwrap()[0];
        // split a child that already has bags; its bags stay with it
        inner.try_split(|_| {});
        for (g, grandchild) in inner.children().unwrap().iter().enumerate() {
            let items: Vec<Item> = (0..30)
                .map(|i| Item {
                    id: 10_000 + g * 100 + i,
                    important: false,
                })
                .collect();
            grandchild.counters().record_shed(items.len());
            store.put(Arc::new(QuadBag::new(grandchild.guid(), grandchild.tree_id(), items)));
        }
        annotate_counts(&root);

        let summary =
            sparsifier(4).sparsify(&root, &store, &is_important, &mut StdRng::seed_from_u64(9));

        assert_eq!(summary.nodes_sampled, 2);
        let inner_bag = inner.sparse_bag().unwrap();
        assert_eq!(inner_bag.len(), 20);
        // the root only ever sees the inner node through its sparse bag
        let inner_ids: HashSet<usize> = inner_bag.objects.iter().map(|o| o.id).collect();
        for object in &root.sparse_bag().unwrap().objects {
            if object.id >= 10_000 {
                assert!(inner_ids.contains(&object.id));
            }
        }
    }
}

//! Build reports: subtree counts, printable build state and bag listings.
//!
//! [`annotate_counts`] must run before sparsifying; the sampler weighs each
//! child by the `items_in_tree` counter it caches.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::bag::BagId;
use crate::centroid::SpatialCentroid;
use crate::node::{NodeId, QuadNode};
use crate::store::BagStore;
use crate::tree::TreeStatsSnapshot;

/// Computes and caches `items_in_tree` for every node below `node`.
///
/// A leaf counts its local and shed objects, an internal node the sum of its
/// children. Returns the count for `node`.
pub fn annotate_counts<T>(node: &QuadNode<T>) -> usize {
    let items = match node.children() {
        None => node.local_len() + node.counters().objects_shed(),
        Some(children) => children.iter().map(|child| annotate_counts(child)).sum(),
    };
    node.counters().set_items_in_tree(items);
    items
}

/// Per-node view of a built tree, written as `tree_report.json`.
#[derive(Debug, Clone, Serialize)]
pub struct TreeReport {
    pub guid: NodeId,
    pub is_leaf: bool,
    pub depth: u32,
    pub items_in_tree: usize,
    pub local_items: usize,
    pub items_shed: usize,
    /// Objects currently held for this node in the bag store
    pub stored_items: usize,
    pub centroid: SpatialCentroid,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeReport>,
}

impl TreeReport {
    /// Annotates the subtree and captures it.
    pub fn collect<T>(node: &Arc<QuadNode<T>>, store: &dyn BagStore<T>) -> Self {
        annotate_counts(node);
        Self::capture(node, store)
    }

    fn capture<T>(node: &Arc<QuadNode<T>>, store: &dyn BagStore<T>) -> Self {
        let children = node
            .children()
            .map(|children| {
                children
                    .iter()
                    .map(|child| Self::capture(child, store))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            guid: node.guid(),
            is_leaf: node.is_leaf(),
            depth: node.depth(),
            items_in_tree: node.counters().items_in_tree(),
            local_items: node.local_len(),
            items_shed: node.counters().objects_shed(),
            stored_items: store.bags(&node.guid()).iter().map(|bag| bag.len()).sum(),
            centroid: *node.centroid(),
            children,
        }
    }

    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(TreeReport::node_count).sum::<usize>()
    }
}

/// Printable state of a build coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct BuildSnapshot {
    pub tree_id: Uuid,
    pub producers_done: usize,
    pub producer_count: usize,
    pub workers_done: usize,
    pub worker_count: usize,
    pub reworkers_done: usize,
    pub reworker_count: usize,
    pub queue_len: usize,
    pub rework_len: usize,
    pub node_count: usize,
    pub leaf_count: usize,
    pub max_depth: u32,
    pub stored_nodes: usize,
    pub objects_in_storage: usize,
    pub stats: TreeStatsSnapshot,
    pub clean: bool,
}

impl fmt::Display for BuildSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "tree {}", self.tree_id)?;
        writeln!(f, "producers {}/{} finished", self.producers_done, self.producer_count)?;
        writeln!(f, "workers {}/{} finished", self.workers_done, self.worker_count)?;
        writeln!(f, "reworkers {}/{} finished", self.reworkers_done, self.reworker_count)?;
        writeln!(f, "worklist = {}", self.queue_len)?;
        writeln!(f, "rework = {}", self.rework_len)?;
        writeln!(f, "clean = {}", self.clean)?;
        writeln!(f)?;
        writeln!(
            f,
            "nodes = {} (leaves {}, max depth {})",
            self.node_count, self.leaf_count, self.max_depth
        )?;
        writeln!(
            f,
            "objects in storage = {} across {} nodes",
            self.objects_in_storage, self.stored_nodes
        )?;
        writeln!(
            f,
            "inserted = {}, leaf appends = {}, unmatched = {}",
            self.stats.objects_inserted, self.stats.leaf_appends, self.stats.unmatched_objects
        )?;
        writeln!(
            f,
            "splits = {}, bags shed = {}, objects shed = {}",
            self.stats.splits, self.stats.bags_shed, self.stats.objects_shed
        )
    }
}

/// One stored bag, as listed in `bag_list.csv`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BagListing {
    pub node_id: NodeId,
    pub bag_id: BagId,
    pub depth: u32,
    pub objects: usize,
    pub needs_rework: bool,
}

/// Renders bag listings as CSV with a header row.
pub fn bag_listing_csv(listings: &[BagListing]) -> String {
    let mut csv = String::from("node_id,bag_id,depth,objects,needs_rework\n");
    for l in listings {
        csv.push_str(&format!(
            "{},{},{},{},{}\n",
            l.node_id, l.bag_id, l.depth, l.objects, l.needs_rework
        ));
    }
    csv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bag::QuadBag;
    use crate::store::MemoryBagStore;

    fn tree() -> Arc<QuadNode<u32>> {
        let root = Arc::new(QuadNode::new_root(
            SpatialCentroid::new(0.0, 0.0, 4.0, 4.0),
            Uuid::new_v4(),
        ));
        root.try_split(|_| {});
        root
    }

    #[test]
    fn test_annotate_counts_sums_leaves() {
        let root = tree();
        let children = root.children().unwrap();
        children[0].push_local(1);
        children[0].push_local(2);
        children[2].counters().record_shed(5);
        // residue on an internal node is not part of its subtree count
        root.push_local(9);

        assert_eq!(annotate_counts(&root), 7);
        assert_eq!(root.counters().items_in_tree(), 7);
        assert_eq!(children[0].counters().items_in_tree(), 2);
        assert_eq!(children[1].counters().items_in_tree(), 0);
    }

    #[test]
    fn test_report_reflects_store() {
        let root = tree();
        let leaf = &root.children().unwrap()[3];
        let store = MemoryBagStore::new();
        leaf.counters().record_shed(3);
        store.put(Arc::new(QuadBag::new(leaf.guid(), leaf.tree_id(), vec![1, 2, 3])));

        let report = TreeReport::collect(&root, &store);

        assert_eq!(report.node_count(), 5);
        assert_eq!(report.items_in_tree, 3);
        assert_eq!(report.children[3].stored_items, 3);
        assert!(report.children[3].is_leaf);
        assert!(!report.is_leaf);

        let json = serde_json::to_value(&report).unwrap();
        assert!(json["children"][0].get("children").is_none());
    }

    #[test]
    fn test_bag_listing_csv() {
        let listing = BagListing {
            node_id: Uuid::nil(),
            bag_id: Uuid::nil(),
            depth: 2,
            objects: 17,
            needs_rework: false,
        };
        let csv = bag_listing_csv(&[listing]);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[1],
            "00000000-0000-0000-0000-000000000000,00000000-0000-0000-0000-000000000000,2,17,false"
        );
    }
}

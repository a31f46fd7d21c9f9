//! Where shed bags live until they are reworked, sampled or exported.

use dashmap::DashMap;
use std::sync::Arc;

use crate::bag::QuadBag;
use crate::node::NodeId;

/// A store of shed bags indexed by owning node.
///
/// Must be safe to call from many workers at once. `take` removes atomically:
/// two concurrent takes for the same node never both receive a bag.
pub trait BagStore<T>: Send + Sync {
    fn put(&self, bag: Arc<QuadBag<T>>);

    /// Bags currently held for a node.
    fn bags(&self, node_id: &NodeId) -> Vec<Arc<QuadBag<T>>>;

    /// Removes and returns every bag held for a node.
    fn take(&self, node_id: &NodeId) -> Vec<Arc<QuadBag<T>>>;

    /// Nodes that currently have at least one bag.
    fn node_ids(&self) -> Vec<NodeId>;

    fn node_count(&self) -> usize {
        self.node_ids().len()
    }

    /// Objects across every stored bag.
    fn total_objects(&self) -> usize {
        self.node_ids()
            .iter()
            .flat_map(|id| self.bags(id))
            .map(|bag| bag.len())
            .sum()
    }
}

/// In-memory [`BagStore`].
pub struct MemoryBagStore<T> {
    bags: DashMap<NodeId, Vec<Arc<QuadBag<T>>>>,
}

impl<T> MemoryBagStore<T> {
    pub fn new() -> Self {
        Self {
            bags: DashMap::new(),
        }
    }
}

impl<T> Default for MemoryBagStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync> BagStore<T> for MemoryBagStore<T> {
    fn put(&self, bag: Arc<QuadBag<T>>) {
        self.bags.entry(bag.owning_node_id).or_default().push(bag);
    }

    fn bags(&self, node_id: &NodeId) -> Vec<Arc<QuadBag<T>>> {
        self.bags
            .get(node_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    fn take(&self, node_id: &NodeId) -> Vec<Arc<QuadBag<T>>> {
        self.bags
            .remove(node_id)
            .map(|(_, bags)| bags)
            .unwrap_or_default()
    }

    fn node_ids(&self) -> Vec<NodeId> {
        self.bags
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| *entry.key())
            .collect()
    }

    fn node_count(&self) -> usize {
        self.bags.len()
    }

    fn total_objects(&self) -> usize {
        self.bags
            .iter()
            .map(|entry| entry.value().iter().map(|bag| bag.len()).sum::<usize>())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_put_and_take() {
        let store = MemoryBagStore::new();
        let node = Uuid::new_v4();
        let tree = Uuid::new_v4();
        store.put(Arc::new(QuadBag::new(node, tree, vec![1, 2])));
        store.put(Arc::new(QuadBag::new(node, tree, vec![3])));
        store.put(Arc::new(QuadBag::new(Uuid::new_v4(), tree, vec![4])));

        assert_eq!(store.bags(&node).len(), 2);
        assert_eq!(store.node_count(), 2);
        assert_eq!(store.total_objects(), 4);

        let taken = store.take(&node);
        assert_eq!(taken.len(), 2);
        assert!(store.bags(&node).is_empty());
        assert!(store.take(&node).is_empty());
        assert_eq!(store.total_objects(), 1);
    }

    #[test]
    fn test_concurrent_takes_never_share_bags() {
        let store = Arc::new(MemoryBagStore::new());
        let node = Uuid::new_v4();
        let tree = Uuid::new_v4();
        for i in 0..100 {
            store.put(Arc::new(QuadBag::new(node, tree, vec![i])));
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.take(&node).len())
            })
            .collect();
        let taken: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(taken, 100);
    }
}

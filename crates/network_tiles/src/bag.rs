//! Immutable batches of objects shed out of a node's working buffer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::node::NodeId;

/// Identifier of a shed bag.
pub type BagId = Uuid;

/// A batch of objects shed from one quadtree node.
///
/// Contents never change after creation. Reworking a bag re-queues its
/// objects as a unit rather than editing the bag in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuadBag<T> {
    pub bag_id: BagId,
    /// The node these objects were shed from.
    pub owning_node_id: NodeId,
    pub tree_id: Uuid,
    pub objects: Vec<T>,
    pub needs_rework: bool,
}

impl<T> QuadBag<T> {
    /// Creates a bag with a fresh id.
    pub fn new(owning_node_id: NodeId, tree_id: Uuid, objects: Vec<T>) -> Self {
        Self {
            bag_id: Uuid::new_v4(),
            owning_node_id,
            tree_id,
            objects,
            needs_rework: false,
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Flags this bag for rework, keeping its identity.
    pub fn flag_for_rework(mut self) -> Self {
        self.needs_rework = true;
        self
    }
}

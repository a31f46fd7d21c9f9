//! Quadtree nodes and the on-disk tree record format.
//!
//! A node owns a rectangular region, a lock-free buffer of objects that have
//! not been shed yet, and a set of counters. Splitting is one-way: once the
//! four children are set the node is internal for the rest of its life.

use crossbeam::queue::SegQueue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use uuid::Uuid;

use crate::bag::{BagId, QuadBag};
use crate::centroid::SpatialCentroid;
use crate::error::{CacheError, CacheResult};

/// Identifier of a quadtree node.
pub type NodeId = Uuid;

/// Anything that can be placed in the quadtree.
pub trait Quadable {
    /// Stable identity, unique within one build.
    fn id(&self) -> String;

    /// Whether this object belongs to the given region.
    ///
    /// An object may belong to several sibling regions (an edge crossing a
    /// border), in which case it is stored in each of them.
    fn is_within(&self, region: &SpatialCentroid) -> bool;
}

/// Per-node counters.
#[derive(Debug, Default)]
pub struct NodeCounters {
    objects_shed: AtomicUsize,
    bags_shed: AtomicUsize,
    items_in_tree: AtomicUsize,
}

impl NodeCounters {
    pub const OBJECTS_SHED: &'static str = "objects_shed";
    pub const BAGS_SHED: &'static str = "bags_shed";
    pub const ITEMS_IN_TREE: &'static str = "items_in_tree";

    pub fn objects_shed(&self) -> usize {
        self.objects_shed.load(Ordering::SeqCst)
    }

    pub fn bags_shed(&self) -> usize {
        self.bags_shed.load(Ordering::SeqCst)
    }

    /// Subtree size cached by the last report pass.
    pub fn items_in_tree(&self) -> usize {
        self.items_in_tree.load(Ordering::SeqCst)
    }

    /// Records a shed bag and returns the node's bag count after it.
    pub(crate) fn record_shed(&self, objects: usize) -> usize {
        self.objects_shed.fetch_add(objects, Ordering::SeqCst);
        self.bags_shed.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn set_items_in_tree(&self, items: usize) {
        self.items_in_tree.store(items, Ordering::SeqCst);
    }

    /// The counters as a name to value map.
    pub fn snapshot(&self) -> BTreeMap<String, usize> {
        BTreeMap::from([
            (Self::OBJECTS_SHED.to_string(), self.objects_shed()),
            (Self::BAGS_SHED.to_string(), self.bags_shed()),
            (Self::ITEMS_IN_TREE.to_string(), self.items_in_tree()),
        ])
    }

    fn from_snapshot(map: &BTreeMap<String, usize>) -> Self {
        let get = |key: &str| AtomicUsize::new(map.get(key).copied().unwrap_or(0));
        Self {
            objects_shed: get(Self::OBJECTS_SHED),
            bags_shed: get(Self::BAGS_SHED),
            items_in_tree: get(Self::ITEMS_IN_TREE),
        }
    }
}

/// A node of the quadtree.
pub struct QuadNode<T> {
    guid: NodeId,
    tree_id: Uuid,
    centroid: SpatialCentroid,
    depth: u32,
    children: OnceLock<[Arc<QuadNode<T>>; 4]>,
    /// Guards the leaf to internal transition only.
    split_lock: Mutex<()>,
    local_objects: SegQueue<T>,
    counters: NodeCounters,
    sparse_bag_id: OnceLock<BagId>,
    sparse_bag: OnceLock<Arc<QuadBag<T>>>,
}

impl<T> QuadNode<T> {
    /// Creates the root node of a tree.
    pub fn new_root(centroid: SpatialCentroid, tree_id: Uuid) -> Self {
        Self::new(centroid, tree_id, 0)
    }

    fn new(centroid: SpatialCentroid, tree_id: Uuid, depth: u32) -> Self {
        Self {
            guid: Uuid::new_v4(),
            tree_id,
            centroid,
            depth,
            children: OnceLock::new(),
            split_lock: Mutex::new(()),
            local_objects: SegQueue::new(),
            counters: NodeCounters::default(),
            sparse_bag_id: OnceLock::new(),
            sparse_bag: OnceLock::new(),
        }
    }

    pub fn guid(&self) -> NodeId {
        self.guid
    }

    pub fn tree_id(&self) -> Uuid {
        self.tree_id
    }

    pub fn centroid(&self) -> &SpatialCentroid {
        &self.centroid
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn counters(&self) -> &NodeCounters {
        &self.counters
    }

    /// A node is a leaf until it has been split.
    pub fn is_leaf(&self) -> bool {
        self.children.get().is_none()
    }

    pub fn children(&self) -> Option<&[Arc<QuadNode<T>>; 4]> {
        self.children.get()
    }

    pub fn child_ids(&self) -> Option<[NodeId; 4]> {
        self.children().map(|c| c.each_ref().map(|child| child.guid))
    }

    /// Splits this leaf into four quadrants.
    ///
    /// Returns `true` only for the caller that actually performed the split.
    /// `register` sees every new child before the children become visible to
    /// other threads.
    pub fn try_split<F>(&self, mut register: F) -> bool
    where
        F: FnMut(&Arc<QuadNode<T>>),
    {
        if !self.is_leaf() {
            return false;
        }

        let _guard = self.split_lock.lock().unwrap_or_else(PoisonError::into_inner);
        // another thread may have won while we waited
        if !self.is_leaf() {
            return false;
        }

        let children = self
            .centroid
            .quadrants()
            .map(|c| Arc::new(QuadNode::new(c, self.tree_id, self.depth + 1)));
        for child in &children {
            register(child);
        }

        self.children.set(children).is_ok()
    }

    /// Children whose region contains `object`.
    pub fn matching_children(&self, object: &T) -> Vec<&Arc<QuadNode<T>>>
    where
        T: Quadable,
    {
        self.children()
            .map(|children| {
                children
                    .iter()
                    .filter(|child| object.is_within(&child.centroid))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn push_local(&self, object: T) {
        self.local_objects.push(object);
    }

    pub fn local_len(&self) -> usize {
        self.local_objects.len()
    }

    pub fn has_local(&self) -> bool {
        !self.local_objects.is_empty()
    }

    /// Takes every object currently buffered in this node.
    pub fn drain_local(&self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.local_objects.len());
        while let Some(object) = self.local_objects.pop() {
            drained.push(object);
        }
        drained
    }

    pub fn sparse_bag(&self) -> Option<&Arc<QuadBag<T>>> {
        self.sparse_bag.get()
    }

    pub fn sparse_bag_id(&self) -> Option<BagId> {
        self.sparse_bag_id.get().copied()
    }

    /// Attaches the sparsified sample. A node keeps its first sample.
    pub fn set_sparse_bag(&self, bag: QuadBag<T>) -> bool {
        let bag_id = bag.bag_id;
        if self.sparse_bag.set(Arc::new(bag)).is_err() {
            return false;
        }
        let _ = self.sparse_bag_id.set(bag_id);
        true
    }

    /// Depth of the deepest leaf below this node, relative to it.
    pub fn max_depth(&self) -> u32 {
        match self.children() {
            None => 0,
            Some(children) => 1 + children.iter().map(|c| c.max_depth()).max().unwrap_or(0),
        }
    }

    /// Objects held by the leaves of this subtree, local and shed.
    pub fn element_count(&self) -> usize {
        match self.children() {
            None => self.local_len() + self.counters.objects_shed(),
            Some(children) => children.iter().map(|c| c.element_count()).sum(),
        }
    }

    /// Every node of the subtree rooted here, parents before children.
    pub fn descendants(self: &Arc<Self>) -> Vec<Arc<QuadNode<T>>> {
        let mut nodes = Vec::new();
        let mut stack = vec![Arc::clone(self)];
        while let Some(node) = stack.pop() {
            if let Some(children) = node.children() {
                stack.extend(children.iter().rev().cloned());
            }
            nodes.push(node);
        }
        nodes
    }

    /// Every leaf of the subtree rooted here.
    pub fn leaves(self: &Arc<Self>) -> Vec<Arc<QuadNode<T>>> {
        self.descendants()
            .into_iter()
            .filter(|n| n.is_leaf())
            .collect()
    }

    /// Structural snapshot of this subtree for serialization.
    pub fn to_record(&self) -> NodeRecord {
        NodeRecord {
            guid: self.guid,
            tree_id: self.tree_id,
            centroid: self.centroid,
            children: self
                .children()
                .map(|children| children.iter().map(|c| c.to_record()).collect()),
            counters: self.counters.snapshot(),
            depth: self.depth,
            items_in_tree: self.counters.items_in_tree(),
            sparse_bag_id: self.sparse_bag_id(),
        }
    }

    /// Rebuilds a read-only tree from its record. Loaded nodes hold no objects.
    ///
    /// A record whose `children` is present but not exactly four entries long
    /// is rejected rather than loaded as a leaf.
    pub fn from_record(record: NodeRecord) -> CacheResult<Arc<Self>> {
        let node = QuadNode {
            guid: record.guid,
            tree_id: record.tree_id,
            centroid: record.centroid,
            depth: record.depth,
            children: OnceLock::new(),
            split_lock: Mutex::new(()),
            local_objects: SegQueue::new(),
            counters: NodeCounters::from_snapshot(&record.counters),
            sparse_bag_id: OnceLock::new(),
            sparse_bag: OnceLock::new(),
        };
        if let Some(bag_id) = record.sparse_bag_id {
            let _ = node.sparse_bag_id.set(bag_id);
        }
        if let Some(children) = record.children {
            let built = children
                .into_iter()
                .map(QuadNode::from_record)
                .collect::<CacheResult<Vec<_>>>()?;
            let four = <[Arc<QuadNode<T>>; 4]>::try_from(built).map_err(|built| {
                CacheError::MalformedTree {
                    node: record.guid,
                    children: built.len(),
                }
            })?;
            let _ = node.children.set(four);
        }
        Ok(Arc::new(node))
    }
}

impl<T> fmt::Debug for QuadNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuadNode")
            .field("guid", &self.guid)
            .field("tree_id", &self.tree_id)
            .field("centroid", &self.centroid)
            .field("depth", &self.depth)
            .field("is_leaf", &self.is_leaf())
            .field("local_objects", &self.local_len())
            .field("counters", &self.counters)
            .field("sparse_bag_id", &self.sparse_bag_id())
            .finish()
    }
}

/// Serialized form of a node and its subtree, the `quad.json` format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub guid: NodeId,
    pub tree_id: Uuid,
    pub centroid: SpatialCentroid,
    pub children: Option<Vec<NodeRecord>>,
    pub counters: BTreeMap<String, usize>,
    pub depth: u32,
    #[serde(default)]
    pub items_in_tree: usize,
    pub sparse_bag_id: Option<BagId>,
}

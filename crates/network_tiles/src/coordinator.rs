//! Concurrent build coordinator.
//!
//! Three pools of tokio tasks share one work queue:
//!
//! - **producers** (one per input stream) enqueue batches aimed at the root,
//!   backing off while the queue is above its soft cap
//! - **workers** pop batches and insert them into the [`QuadTree`]
//! - **reworkers** turn bags pulled back by a split into new batches aimed at
//!   the node that shed them, so they re-descend into the right children
//!
//! The coordinator is also the tree's [`TreeHooks`]: sheds go to the
//! [`BagStore`], and a split moves the node's bags into the rework collection.
//!
//! Termination uses an outstanding-work counter. It is incremented before any
//! batch or bag is enqueued and decremented only once that unit has been fully
//! handled, so it cannot read zero while a unit is queued or held by a task.

use crossbeam::queue::SegQueue;
use dashmap::DashSet;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, SemaphorePermit, TryAcquireError};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::bag::QuadBag;
use crate::centroid::SpatialCentroid;
use crate::config::BuildSettings;
use crate::error::{BuildError, BuildResult};
use crate::node::{NodeId, QuadNode, Quadable};
use crate::report::{BagListing, BuildSnapshot};
use crate::store::{BagStore, MemoryBagStore};
use crate::tree::{QuadTree, TreeHooks, TreeLimits, TreeStatsSnapshot};

/// One producer's input: an iterator of object batches.
pub type BatchStream<T> = Box<dyn Iterator<Item = Vec<T>> + Send>;

/// A batch of objects to insert below `target`.
struct WorkItem<T> {
    target: NodeId,
    batch: Vec<T>,
}

#[derive(Debug, Clone, Copy)]
enum Pool {
    Producer,
    Worker,
    Reworker,
}

impl Pool {
    fn name(self) -> &'static str {
        match self {
            Pool::Producer => "producer",
            Pool::Worker => "worker",
            Pool::Reworker => "reworker",
        }
    }
}

/// Shared state between the coordinator and its tasks.
struct BuildState<T> {
    queue: SegQueue<WorkItem<T>>,
    rework: SegQueue<Arc<QuadBag<T>>>,
    store: Arc<dyn BagStore<T>>,
    /// Nodes that have split; their sheds go straight to rework
    reworked: DashSet<NodeId>,
    /// Batches and bags queued or held by a task
    outstanding: AtomicUsize,
    producer_count: AtomicUsize,
    worker_count: AtomicUsize,
    reworker_count: AtomicUsize,
    producers_done: AtomicUsize,
    workers_done: AtomicUsize,
    reworkers_done: AtomicUsize,
    /// Set when a task unwinds so the others stop waiting on it
    aborted: AtomicBool,
    batches_enqueued: AtomicUsize,
    bags_reworked: AtomicUsize,
    failed_inserts: AtomicUsize,
    skipped_batches: AtomicUsize,
}

impl<T> BuildState<T>
where
    T: Quadable + Clone + Send + Sync,
{
    fn new(store: Arc<dyn BagStore<T>>) -> Self {
        Self {
            queue: SegQueue::new(),
            rework: SegQueue::new(),
            store,
            reworked: DashSet::new(),
            outstanding: AtomicUsize::new(0),
            producer_count: AtomicUsize::new(0),
            worker_count: AtomicUsize::new(0),
            reworker_count: AtomicUsize::new(0),
            producers_done: AtomicUsize::new(0),
            workers_done: AtomicUsize::new(0),
            reworkers_done: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            batches_enqueued: AtomicUsize::new(0),
            bags_reworked: AtomicUsize::new(0),
            failed_inserts: AtomicUsize::new(0),
            skipped_batches: AtomicUsize::new(0),
        }
    }

    /// Resets per-build state. Batches left queued by an aborted build are
    /// dropped; rework bags are kept and become outstanding again.
    fn begin(&self, producers: usize, workers: usize, reworkers: usize) {
        let mut stale = 0;
        while self.queue.pop().is_some() {
            stale += 1;
        }
        if stale > 0 {
            warn!("⚠️ Dropped {} batches left over from an aborted build", stale);
        }
        self.outstanding.store(self.rework.len(), Ordering::SeqCst);
        self.producer_count.store(producers, Ordering::SeqCst);
        self.worker_count.store(workers, Ordering::SeqCst);
        self.reworker_count.store(reworkers, Ordering::SeqCst);
        self.producers_done.store(0, Ordering::SeqCst);
        self.workers_done.store(0, Ordering::SeqCst);
        self.reworkers_done.store(0, Ordering::SeqCst);
        self.aborted.store(false, Ordering::SeqCst);
        self.batches_enqueued.store(0, Ordering::SeqCst);
        self.bags_reworked.store(0, Ordering::SeqCst);
        self.failed_inserts.store(0, Ordering::SeqCst);
        self.skipped_batches.store(0, Ordering::SeqCst);
    }

    fn enqueue(&self, item: WorkItem<T>) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.queue.push(item);
    }

    fn finish_unit(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    fn producers_finished(&self) -> bool {
        self.producers_done.load(Ordering::SeqCst) >= self.producer_count.load(Ordering::SeqCst)
    }

    fn workers_finished(&self) -> bool {
        self.workers_done.load(Ordering::SeqCst) >= self.worker_count.load(Ordering::SeqCst)
    }

    fn reworkers_finished(&self) -> bool {
        self.reworkers_done.load(Ordering::SeqCst) >= self.reworker_count.load(Ordering::SeqCst)
    }

    /// Workers keep going while producers run or any batch or bag is pending.
    fn worker_may_exit(&self) -> bool {
        if self.aborted.load(Ordering::SeqCst) {
            return true;
        }
        self.producers_finished()
            && self.rework.is_empty()
            && self.outstanding.load(Ordering::SeqCst) == 0
            && self.queue.is_empty()
    }

    /// Reworkers outlive both other pools; only workers can create rework.
    fn reworker_may_exit(&self) -> bool {
        if self.aborted.load(Ordering::SeqCst) {
            return true;
        }
        self.producers_finished() && self.workers_finished() && self.rework.is_empty()
    }

    fn is_clean(&self) -> bool {
        self.queue.is_empty()
            && self.rework.is_empty()
            && self.producers_finished()
            && self.workers_finished()
            && self.reworkers_finished()
    }

    fn move_to_rework(&self, node_id: &NodeId) -> usize {
        let bags = self.store.take(node_id);
        let moved = bags.len();
        for bag in bags {
            let flagged = Arc::try_unwrap(bag)
                .unwrap_or_else(|shared| (*shared).clone())
                .flag_for_rework();
            self.outstanding.fetch_add(1, Ordering::SeqCst);
            self.rework.push(Arc::new(flagged));
        }
        moved
    }

    /// Inserts one batch, skipping objects whose insertion fails or panics.
    fn process(&self, tree: &QuadTree<T>, item: WorkItem<T>) {
        let Some(node) = tree.node(&item.target) else {
            self.skipped_batches.fetch_add(1, Ordering::Relaxed);
            warn!(
                "⚠️ Target node {} not in registry, skipping batch of {}",
                item.target,
                item.batch.len()
            );
            return;
        };

        for object in item.batch {
            let id = object.id();
            match catch_unwind(AssertUnwindSafe(|| tree.insert_into(&node, object))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.failed_inserts.fetch_add(1, Ordering::Relaxed);
                    debug!("Skipped object {}: {}", id, e);
                }
                Err(_) => {
                    self.failed_inserts.fetch_add(1, Ordering::Relaxed);
                    error!("❌ Panic while inserting object {}, skipping it", id);
                }
            }
        }
    }
}

impl<T> TreeHooks<T> for BuildState<T>
where
    T: Quadable + Clone + Send + Sync,
{
    fn shed(&self, bag: QuadBag<T>) {
        let node_id = bag.owning_node_id;
        self.store.put(Arc::new(bag));
        // pairs with the fence in `mark_for_rework`: one side always sees the other
        fence(Ordering::SeqCst);
        if self.reworked.contains(&node_id) {
            let moved = self.move_to_rework(&node_id);
            if moved > 0 {
                debug!("Redirected {} late bag(s) of node {} to rework", moved, node_id);
            }
        }
    }

    fn mark_for_rework(&self, node_id: NodeId) {
        self.reworked.insert(node_id);
        fence(Ordering::SeqCst);
        let moved = self.move_to_rework(&node_id);
        debug!("🔁 Marked node {} for rework ({} bags)", node_id, moved);
    }
}

/// Increments a pool's completion counter when its task ends, even by panic.
struct Completion<'a, T> {
    state: &'a BuildState<T>,
    pool: Pool,
}

impl<T> Drop for Completion<'_, T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.state.aborted.store(true, Ordering::SeqCst);
        }
        let counter = match self.pool {
            Pool::Producer => &self.state.producers_done,
            Pool::Worker => &self.state.workers_done,
            Pool::Reworker => &self.state.reworkers_done,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Outcome of a successful build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub producers: usize,
    pub workers: usize,
    pub reworkers: usize,
    pub batches_enqueued: usize,
    pub bags_reworked: usize,
    pub failed_inserts: usize,
    pub skipped_batches: usize,
    pub elapsed: Duration,
    pub tree: TreeStatsSnapshot,
}

/// Runs concurrent builds of one quadtree.
///
/// Only one build runs at a time; a second caller waits at most
/// `admission_timeout_ms` for the first to finish.
pub struct BuildCoordinator<T> {
    settings: BuildSettings,
    tree: Arc<QuadTree<T>>,
    state: Arc<BuildState<T>>,
    admission: Semaphore,
}

impl<T> BuildCoordinator<T>
where
    T: Quadable + Clone + Send + Sync + 'static,
{
    /// Creates a coordinator whose bags are kept in memory.
    pub fn new(centroid: SpatialCentroid, settings: BuildSettings) -> Self {
        Self::with_store(centroid, settings, Arc::new(MemoryBagStore::new()))
    }

    pub fn with_store(
        centroid: SpatialCentroid,
        settings: BuildSettings,
        store: Arc<dyn BagStore<T>>,
    ) -> Self {
        let state = Arc::new(BuildState::new(store));
        let hooks: Arc<dyn TreeHooks<T>> = state.clone();
        let tree = Arc::new(QuadTree::new(centroid, TreeLimits::from(&settings), hooks));
        Self {
            settings,
            tree,
            state,
            admission: Semaphore::new(1),
        }
    }

    pub fn tree(&self) -> &Arc<QuadTree<T>> {
        &self.tree
    }

    pub fn root(&self) -> &Arc<QuadNode<T>> {
        self.tree.root()
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn BagStore<T>> {
        &self.state.store
    }

    /// Builds from `streams`. Returns `false` if another build holds the
    /// coordinator or if any task failed; the error is logged.
    pub async fn concurrent_add(
        &self,
        streams: Vec<BatchStream<T>>,
        worker_count: usize,
        rework_worker_count: usize,
    ) -> bool {
        match self
            .try_concurrent_add(streams, worker_count, rework_worker_count)
            .await
        {
            Ok(summary) => {
                info!(
                    "✅ Build finished in {:?}: {} batches, {} bags reworked, {} failed inserts",
                    summary.elapsed,
                    summary.batches_enqueued,
                    summary.bags_reworked,
                    summary.failed_inserts
                );
                true
            }
            Err(e) => {
                error!("❌ Build failed: {}", e);
                false
            }
        }
    }

    pub async fn try_concurrent_add(
        &self,
        streams: Vec<BatchStream<T>>,
        worker_count: usize,
        rework_worker_count: usize,
    ) -> BuildResult<BuildSummary> {
        if worker_count == 0 {
            return Err(BuildError::InvalidPoolSize { pool: "worker_count" });
        }
        if rework_worker_count == 0 {
            return Err(BuildError::InvalidPoolSize {
                pool: "rework_worker_count",
            });
        }

        let _permit = self.admit().await?;
        let started = Instant::now();
        let producers = streams.len();
        info!(
            "🚀 Starting build of tree {}: {} producers, {} workers, {} reworkers",
            self.tree.tree_id(),
            producers,
            worker_count,
            rework_worker_count
        );

        self.state.begin(producers, worker_count, rework_worker_count);
        let root_id = self.tree.root().guid();
        let mut tasks = JoinSet::new();

        for stream in streams {
            let state = Arc::clone(&self.state);
            let settings = self.settings.clone();
            tasks.spawn(async move { run_producer(state, root_id, stream, settings).await });
        }
        for _ in 0..worker_count {
            let state = Arc::clone(&self.state);
            let tree = Arc::clone(&self.tree);
            let delay = self.settings.delay();
            tasks.spawn(async move { run_worker(state, tree, delay).await });
        }
        for _ in 0..rework_worker_count {
            let state = Arc::clone(&self.state);
            let settings = self.settings.clone();
            tasks.spawn(async move { run_reworker(state, settings).await });
        }

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            let error = match joined {
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => e,
                Err(e) => BuildError::TaskFailed {
                    pool: "build",
                    reason: e.to_string(),
                },
            };
            error!("❌ Build task failed: {}", error);
            failure.get_or_insert(error);
        }
        if let Some(error) = failure {
            return Err(error);
        }

        if !self.state.rework.is_empty() {
            return Err(BuildError::ReworkNotDrained(self.state.rework.len()));
        }
        if !self.state.queue.is_empty() {
            return Err(BuildError::QueueNotDrained(self.state.queue.len()));
        }

        Ok(BuildSummary {
            producers,
            workers: worker_count,
            reworkers: rework_worker_count,
            batches_enqueued: self.state.batches_enqueued.load(Ordering::SeqCst),
            bags_reworked: self.state.bags_reworked.load(Ordering::SeqCst),
            failed_inserts: self.state.failed_inserts.load(Ordering::SeqCst),
            skipped_batches: self.state.skipped_batches.load(Ordering::SeqCst),
            elapsed: started.elapsed(),
            tree: self.tree.stats(),
        })
    }

    /// Flushes every node and reinserts whatever that pulls back, until
    /// nothing is left buffered, queued or awaiting rework.
    ///
    /// Returns the number of objects reinserted. This runs on the calling
    /// thread; async callers should move it to a blocking task. Fails with
    /// [`BuildError::BuildInProgress`] while a build holds the coordinator.
    pub fn settle(&self) -> BuildResult<usize> {
        let _permit = self.admission.try_acquire().map_err(|e| match e {
            TryAcquireError::NoPermits => BuildError::BuildInProgress,
            TryAcquireError::Closed => BuildError::AdmissionClosed,
        })?;
        let mut reinserted = 0;

        loop {
            self.tree.shed_all();
            let mut progressed = false;

            while let Some(item) = self.state.queue.pop() {
                self.state.process(&self.tree, item);
                self.state.finish_unit();
                progressed = true;
            }
            while let Some(bag) = self.state.rework.pop() {
                reinserted += bag.len();
                let item = WorkItem {
                    target: bag.owning_node_id,
                    batch: bag.objects.clone(),
                };
                self.state.process(&self.tree, item);
                self.state.finish_unit();
                progressed = true;
            }

            if !progressed {
                break;
            }
        }

        debug!("Settled tree {}: {} objects reinserted", self.tree.tree_id(), reinserted);
        Ok(reinserted)
    }

    /// Moves every bag shed by `node_id` into the rework collection.
    pub fn mark_for_rework(&self, node_id: NodeId) {
        self.state.mark_for_rework(node_id);
    }

    /// Whether the last build terminated with nothing left queued.
    pub fn has_clean_state(&self) -> bool {
        self.state.is_clean()
    }

    pub fn queue_len(&self) -> usize {
        self.state.queue.len()
    }

    pub fn rework_len(&self) -> usize {
        self.state.rework.len()
    }

    /// Bags currently stored for a node.
    pub fn bags_for(&self, node_id: &NodeId) -> Vec<Arc<QuadBag<T>>> {
        self.state.store.bags(node_id)
    }

    pub fn leaves(&self) -> Vec<Arc<QuadNode<T>>> {
        self.tree.root().leaves()
    }

    pub fn total_objects_in_storage(&self) -> usize {
        self.state.store.total_objects()
    }

    /// Current build state for logs and `results.txt`.
    pub fn snapshot(&self) -> BuildSnapshot {
        let root = self.tree.root();
        let leaves = root.leaves();
        BuildSnapshot {
            tree_id: self.tree.tree_id(),
            producers_done: self.state.producers_done.load(Ordering::SeqCst),
            producer_count: self.state.producer_count.load(Ordering::SeqCst),
            workers_done: self.state.workers_done.load(Ordering::SeqCst),
            worker_count: self.state.worker_count.load(Ordering::SeqCst),
            reworkers_done: self.state.reworkers_done.load(Ordering::SeqCst),
            reworker_count: self.state.reworker_count.load(Ordering::SeqCst),
            queue_len: self.state.queue.len(),
            rework_len: self.state.rework.len(),
            node_count: self.tree.node_count(),
            leaf_count: leaves.len(),
            max_depth: root.max_depth(),
            stored_nodes: self.state.store.node_count(),
            objects_in_storage: self.state.store.total_objects(),
            stats: self.tree.stats(),
            clean: self.state.is_clean(),
        }
    }

    /// Every stored bag, grouped by node in tree order.
    pub fn shed_bag_listing(&self) -> Vec<BagListing> {
        self.tree
            .root()
            .descendants()
            .iter()
            .flat_map(|node| {
                let depth = node.depth();
                self.state
                    .store
                    .bags(&node.guid())
                    .into_iter()
                    .map(move |bag| BagListing {
                        node_id: bag.owning_node_id,
                        bag_id: bag.bag_id,
                        depth,
                        objects: bag.len(),
                        needs_rework: bag.needs_rework,
                    })
            })
            .collect()
    }

    async fn admit(&self) -> BuildResult<SemaphorePermit<'_>> {
        let timeout = self.settings.admission_timeout();
        match tokio::time::timeout(timeout, self.admission.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(BuildError::AdmissionClosed),
            Err(_) => {
                warn!("⏳ Build admission refused after {:?}", timeout);
                Err(BuildError::AdmissionTimeout(self.settings.admission_timeout_ms))
            }
        }
    }
}

async fn run_producer<T>(
    state: Arc<BuildState<T>>,
    root_id: NodeId,
    stream: BatchStream<T>,
    settings: BuildSettings,
) -> BuildResult<()>
where
    T: Quadable + Clone + Send + Sync,
{
    let _done = Completion {
        state: &state,
        pool: Pool::Producer,
    };
    let delay = settings.delay();

    for batch in stream {
        if batch.is_empty() {
            continue;
        }
        while state.queue.len() >= settings.max_worklist_size {
            tokio::time::sleep(delay).await;
        }
        state.enqueue(WorkItem {
            target: root_id,
            batch,
        });
        state.batches_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    debug!("{} finished", Pool::Producer.name());
    Ok(())
}

async fn run_worker<T>(
    state: Arc<BuildState<T>>,
    tree: Arc<QuadTree<T>>,
    delay: Duration,
) -> BuildResult<()>
where
    T: Quadable + Clone + Send + Sync,
{
    let _done = Completion {
        state: &state,
        pool: Pool::Worker,
    };

    loop {
        match state.queue.pop() {
            Some(item) => {
                state.process(&tree, item);
                state.finish_unit();
            }
            None => {
                if state.worker_may_exit() {
                    break;
                }
                tokio::time::sleep(delay).await;
            }
        }
    }

    debug!("{} finished", Pool::Worker.name());
    Ok(())
}

async fn run_reworker<T>(state: Arc<BuildState<T>>, settings: BuildSettings) -> BuildResult<()>
where
    T: Quadable + Clone + Send + Sync,
{
    let _done = Completion {
        state: &state,
        pool: Pool::Reworker,
    };
    let delay = settings.delay();

    loop {
        if state.queue.len() >= settings.max_worklist_size {
            tokio::time::sleep(delay).await;
            continue;
        }
        match state.rework.pop() {
            Some(bag) => {
                let bag = Arc::try_unwrap(bag).unwrap_or_else(|shared| (*shared).clone());
                debug!(
                    "Reworking bag {} ({} objects) from node {}",
                    bag.bag_id,
                    bag.len(),
                    bag.owning_node_id
                );
                // the bag's outstanding unit passes to the batch
                state.queue.push(WorkItem {
                    target: bag.owning_node_id,
                    batch: bag.objects,
                });
                state.bags_reworked.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                if state.reworker_may_exit() {
                    break;
                }
                tokio::time::sleep(delay).await;
            }
        }
    }

    if state.aborted.load(Ordering::SeqCst) && !state.rework.is_empty() {
        return Err(BuildError::TaskFailed {
            pool: Pool::Reworker.name(),
            reason: format!("{} bags left after another task aborted", state.rework.len()),
        });
    }

    debug!("{} finished", Pool::Reworker.name());
    Ok(())
}

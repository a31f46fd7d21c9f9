//! Cache of reloaded trees keyed by asset id.
//!
//! The cache is an ordinary value handed to whoever serves queries; it owns
//! no global state. Loading goes through a [`TreeLoader`], and concurrent
//! requests for the same asset share a single load.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use crate::centroid::SpatialCentroid;
use crate::error::{CacheError, CacheResult};
use crate::export::{tile_file_name, TREE_FILE};
use crate::node::{NodeRecord, QuadNode};
use crate::query::QueryEngine;

/// A content file to fetch for a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TileFile {
    pub url: String,
    pub centroid: SpatialCentroid,
    pub depth: u32,
    pub is_leaf: bool,
}

/// A reloaded tree and where its content files are served from.
pub struct CachedQuadTree<T> {
    asset_id: String,
    base_url: String,
    engine: QueryEngine<T>,
}

impl<T> CachedQuadTree<T> {
    pub fn new(asset_id: impl Into<String>, root: Arc<QuadNode<T>>, base_url: &str) -> Self {
        Self {
            asset_id: asset_id.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            engine: QueryEngine::new(root),
        }
    }

    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    pub fn root(&self) -> &Arc<QuadNode<T>> {
        self.engine.root()
    }

    /// URLs of the content files of every leaf overlapping `region`.
    pub fn matching_leaf_files(&self, region: &SpatialCentroid) -> Vec<String> {
        self.engine
            .matching_leaves(region)
            .iter()
            .map(|leaf| self.url_for(leaf))
            .collect()
    }

    /// Content files covering `region` at the finest level within `budget`.
    pub fn sparse_matching_files(&self, region: &SpatialCentroid, budget: usize) -> Vec<TileFile> {
        self.engine
            .sparse_matching_leaves(region, budget)
            .iter()
            .map(|node| TileFile {
                url: self.url_for(node),
                centroid: *node.centroid(),
                depth: node.depth(),
                is_leaf: node.is_leaf(),
            })
            .collect()
    }

    fn url_for(&self, node: &QuadNode<T>) -> String {
        format!("{}/{}/{}", self.base_url, self.asset_id, tile_file_name(&node.guid()))
    }
}

/// Loads the tree for an asset.
#[async_trait]
pub trait TreeLoader<T>: Send + Sync {
    async fn load(&self, asset_id: &str) -> CacheResult<CachedQuadTree<T>>;
}

/// Reads `{root}/{asset_id}/quad.json`.
#[derive(Debug, Clone)]
pub struct DirectoryTreeLoader {
    root: PathBuf,
    base_url: String,
}

impl DirectoryTreeLoader {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> TreeLoader<T> for DirectoryTreeLoader {
    #[instrument(skip(self))]
    async fn load(&self, asset_id: &str) -> CacheResult<CachedQuadTree<T>> {
        let path = self.root.join(asset_id).join(TREE_FILE);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(CacheError::NotFound(asset_id.to_string()));
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| CacheError::FileRead(path.clone(), e))?;
        let record: NodeRecord = serde_json::from_str(&content)
            .map_err(|e| CacheError::Deserialization(path.clone(), e))?;

        let root = QuadNode::from_record(record)?;

        info!("📂 Loaded tree for asset {} from {}", asset_id, path.display());
        Ok(CachedQuadTree::new(asset_id, root, &self.base_url))
    }
}

/// Asset id to loaded tree.
pub struct TreeCache<T> {
    loader: Arc<dyn TreeLoader<T>>,
    trees: DashMap<String, Arc<OnceCell<Arc<CachedQuadTree<T>>>>>,
}

impl<T: Send + Sync + 'static> TreeCache<T> {
    pub fn new(loader: Arc<dyn TreeLoader<T>>) -> Self {
        Self {
            loader,
            trees: DashMap::new(),
        }
    }

    /// Returns the cached tree, loading it on first use.
    ///
    /// A failed load leaves nothing cached, so the next call tries again.
    pub async fn get_or_load(&self, asset_id: &str) -> CacheResult<Arc<CachedQuadTree<T>>> {
        // Clone the cell out so no map guard is held across the load.
        let cell = Arc::clone(
            self.trees
                .entry(asset_id.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .value(),
        );

        let tree = cell
            .get_or_try_init(|| async {
                debug!("Cache miss for asset {}", asset_id);
                self.loader.load(asset_id).await.map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(tree))
    }

    /// Caches an already built tree, replacing any previous entry.
    pub fn store(&self, tree: CachedQuadTree<T>) -> Arc<CachedQuadTree<T>> {
        let tree = Arc::new(tree);
        let cell = OnceCell::new_with(Some(Arc::clone(&tree)));
        self.trees.insert(tree.asset_id().to_string(), Arc::new(cell));
        tree
    }

    pub fn evict(&self, asset_id: &str) -> bool {
        self.trees.remove(asset_id).is_some()
    }

    /// Number of assets with a loaded tree.
    pub fn len(&self) -> usize {
        self.trees.iter().filter(|entry| entry.value().initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

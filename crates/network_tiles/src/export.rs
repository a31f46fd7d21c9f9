//! Writes a built tree to an output directory.
//!
//! Layout:
//! - `quad.json`: the tree structure as a nested [`NodeRecord`]
//! - `{guid}.json`: tile content per leaf (its shed bags) and per internal
//!   node (its sparse bag), named after the node
//! - `results.txt`, `tree_report.json`, `bag_list.csv`: build diagnostics

use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::error::{ExportError, ExportResult};
use crate::graph::{GraphObject, TileContent};
use crate::node::{NodeId, NodeRecord, QuadNode};
use crate::store::BagStore;

pub const TREE_FILE: &str = "quad.json";
pub const RESULTS_FILE: &str = "results.txt";
pub const REPORT_FILE: &str = "tree_report.json";
pub const BAG_LIST_FILE: &str = "bag_list.csv";

/// File name of a node's tile content.
pub fn tile_file_name(node_id: &NodeId) -> String {
    format!("{}.json", node_id)
}

/// Writes tree and tile files below one directory.
#[derive(Debug, Clone)]
pub struct TileWriter {
    out_dir: PathBuf,
}

impl TileWriter {
    /// Creates the output directory if needed.
    pub fn new(out_dir: impl Into<PathBuf>) -> ExportResult<Self> {
        let out_dir = out_dir.into();
        fs::create_dir_all(&out_dir).map_err(|e| ExportError::DirectoryCreate(out_dir.clone(), e))?;
        Ok(Self { out_dir })
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.out_dir.join(file_name)
    }

    pub fn write_text(&self, file_name: &str, text: &str) -> ExportResult<PathBuf> {
        let path = self.path_for(file_name);
        fs::write(&path, text).map_err(|e| ExportError::FileWrite(path.clone(), e))?;
        Ok(path)
    }

    pub fn write_json<V: Serialize + ?Sized>(&self, file_name: &str, value: &V) -> ExportResult<PathBuf> {
        let path = self.path_for(file_name);
        let json =
            serde_json::to_string(value).map_err(|e| ExportError::Serialization(path.clone(), e))?;
        fs::write(&path, json).map_err(|e| ExportError::FileWrite(path.clone(), e))?;
        Ok(path)
    }

    /// Writes `quad.json` through a temporary file so readers never see a
    /// partial tree.
    #[instrument(skip_all, fields(dir = %self.out_dir.display()))]
    pub fn write_tree<T>(&self, root: &QuadNode<T>) -> ExportResult<PathBuf> {
        let record: NodeRecord = root.to_record();
        let path = self.path_for(TREE_FILE);
        let temp_path = path.with_extension("tmp");

        let json = serde_json::to_string(&record)
            .map_err(|e| ExportError::Serialization(path.clone(), e))?;
        fs::write(&temp_path, json).map_err(|e| ExportError::FileWrite(temp_path.clone(), e))?;
        fs::rename(&temp_path, &path).map_err(|e| ExportError::FileWrite(path.clone(), e))?;

        info!("💾 Wrote tree {} to {}", root.tree_id(), path.display());
        Ok(path)
    }

    /// Writes one tile per leaf from its stored bags, in parallel.
    #[instrument(skip_all, fields(leaves = leaves.len()))]
    pub fn export_leaves(
        &self,
        leaves: &[Arc<QuadNode<GraphObject>>],
        store: &dyn BagStore<GraphObject>,
    ) -> ExportResult<usize> {
        leaves.par_iter().try_for_each(|leaf| -> ExportResult<()> {
            let bags = store.bags(&leaf.guid());
            let content = TileContent::from_objects(bags.iter().flat_map(|bag| bag.objects.iter()));
            self.write_json(&tile_file_name(&leaf.guid()), &content)?;
            debug!("Exported leaf {} ({} objects)", leaf.guid(), content.len());
            Ok(())
        })?;

        info!("📦 Exported {} leaf tiles", leaves.len());
        Ok(leaves.len())
    }

    /// Writes one tile per internal node from its sparse bag, in parallel.
    #[instrument(skip_all)]
    pub fn export_sparse(&self, root: &Arc<QuadNode<GraphObject>>) -> ExportResult<usize> {
        let internal: Vec<_> = root
            .descendants()
            .into_iter()
            .filter(|node| !node.is_leaf())
            .collect();

        internal.par_iter().try_for_each(|node| -> ExportResult<()> {
            let bag = node
                .sparse_bag()
                .ok_or(ExportError::MissingSparseBag(node.guid()))?;
            let content = TileContent::from_objects(&bag.objects);
            self.write_json(&tile_file_name(&node.guid()), &content)?;
            Ok(())
        })?;

        info!("📦 Exported {} sparse tiles", internal.len());
        Ok(internal.len())
    }
}

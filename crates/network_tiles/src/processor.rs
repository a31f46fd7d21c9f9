//! End-to-end tiling of a graph: build, settle, sample and export.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument};

use crate::config::TileSettings;
use crate::coordinator::{BuildCoordinator, BuildSummary};
use crate::error::{ProcessError, ProcessResult};
use crate::export::{TileWriter, BAG_LIST_FILE, REPORT_FILE, RESULTS_FILE};
use crate::graph::GraphObject;
use crate::node::QuadNode;
use crate::report::{bag_listing_csv, TreeReport};
use crate::source::Graph;
use crate::sparsifier::{Sparsifier, SparsifySummary};

/// What a tiling run produced.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSummary {
    pub input_objects: usize,
    pub dropped_edges: usize,
    pub build: BuildSummary,
    /// Objects pulled back and reinserted while settling
    pub reinserted: usize,
    pub node_count: usize,
    pub leaf_tiles: usize,
    pub sparse_tiles: usize,
    pub sparsify: SparsifySummary,
    pub tree_file: PathBuf,
    pub elapsed: Duration,
}

/// A tiled graph: the in-memory tree plus the run summary.
pub struct ProcessedGraph {
    pub root: Arc<QuadNode<GraphObject>>,
    pub summary: ProcessSummary,
}

/// Tiles `graph` into `output_dir`.
///
/// Writes `results.txt`, `tree_report.json` and `bag_list.csv`, one content
/// file per node, and finally `quad.json`.
#[instrument(skip(graph, settings), fields(output = %output_dir.display()))]
pub async fn process_graph(
    graph: Graph,
    output_dir: &Path,
    settings: &TileSettings,
) -> ProcessResult<ProcessedGraph> {
    settings.validate()?;
    let started = Instant::now();
    let input_objects = graph.object_count();
    let dropped_edges = graph.dropped_edges;

    let coordinator = Arc::new(BuildCoordinator::new(graph.bounds, settings.build.clone()));
    let streams = graph.into_streams(settings.build.batch_size);
    let build = coordinator
        .try_concurrent_add(
            streams,
            settings.build.effective_worker_count(),
            settings.build.rework_worker_count,
        )
        .await?;
    let settling = Arc::clone(&coordinator);
    let reinserted = tokio::task::spawn_blocking(move || settling.settle())
        .await
        .map_err(|e| ProcessError::TaskFailed(e.to_string()))??;

    let writer = TileWriter::new(output_dir)?;
    writer.write_text(RESULTS_FILE, &coordinator.snapshot().to_string())?;
    let report = TreeReport::collect(coordinator.root(), coordinator.store().as_ref());
    writer.write_json(REPORT_FILE, &report)?;
    writer.write_text(BAG_LIST_FILE, &bag_listing_csv(&coordinator.shed_bag_listing()))?;

    let root = Arc::clone(coordinator.root());
    let store = Arc::clone(coordinator.store());
    let sparsifier = Sparsifier::new(settings.build.max_objects_per_bag, &settings.sparsify);
    let seed = settings.sparsify.seed;
    let export_root = Arc::clone(&root);

    // Sampling and file output are blocking work.
    let (leaf_tiles, sparsify, sparse_tiles, tree_file) = tokio::task::spawn_blocking(move || {
        let leaf_tiles = writer.export_leaves(&export_root.leaves(), store.as_ref())?;

        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let sparsify =
            sparsifier.sparsify(&export_root, store.as_ref(), &GraphObject::is_important, &mut rng);
        let sparse_tiles = writer.export_sparse(&export_root)?;
        let tree_file = writer.write_tree(&export_root)?;
        Ok::<_, ProcessError>((leaf_tiles, sparsify, sparse_tiles, tree_file))
    })
    .await
    .map_err(|e| ProcessError::TaskFailed(e.to_string()))??;

    let summary = ProcessSummary {
        input_objects,
        dropped_edges,
        build,
        reinserted,
        node_count: report.node_count(),
        leaf_tiles,
        sparse_tiles,
        sparsify,
        tree_file,
        elapsed: started.elapsed(),
    };
    info!(
        "🗺️ Tiled {} objects into {} nodes ({} leaf tiles, {} sparse tiles) in {:?}",
        summary.input_objects,
        summary.node_count,
        summary.leaf_tiles,
        summary.sparse_tiles,
        summary.elapsed
    );

    Ok(ProcessedGraph { root, summary })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildSettings, SparsifySettings};
    use crate::export::{tile_file_name, TREE_FILE};
    use crate::graph::TileContent;
    use crate::node::NodeRecord;
    use crate::source::GraphInput;

    fn ring_graph(count: usize) -> Graph {
        let nodes: Vec<serde_json::Value> = (0..count)
            .map(|i| {
                let angle = i as f64 * 0.37;
                let radius = 1.0 + (i % 50) as f64;
                serde_json::json!({
                    "id": format!("n{i}"),
                    "x": radius * angle.cos(),
                    "y": radius * angle.sin(),
                    "attrs": if i % 100 == 0 { serde_json::json!({"importance": 1}) } else { serde_json::json!({}) }
                })
            })
            .collect();
        let edges: Vec<serde_json::Value> = (1..count)
            .map(|i| serde_json::json!({"source": format!("n{}", i - 1), "target": format!("n{i}")}))
            .collect();
        let input: GraphInput =
            serde_json::from_value(serde_json::json!({"nodes": nodes, "edges": edges})).unwrap();
        Graph::from_input(input).unwrap()
    }

    fn small_settings() -> TileSettings {
        TileSettings {
            build: BuildSettings {
                max_objects_per_bag: 20,
                max_bags_before_split: 2,
                batch_size: 25,
                delay_ms: 1,
                ..BuildSettings::default()
            },
            sparsify: SparsifySettings {
                seed: Some(7),
                ..SparsifySettings::default()
            },
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_process_graph_writes_every_tile() {
        let dir = tempfile::tempdir().unwrap();
        let processed = process_graph(ring_graph(600), dir.path(), &small_settings())
            .await
            .unwrap();

        let summary = &processed.summary;
        assert_eq!(summary.input_objects, 1199);
        assert!(summary.build.tree.splits > 0);
        assert_eq!(summary.leaf_tiles + summary.sparse_tiles, summary.node_count);
        assert_eq!(summary.tree_file, dir.path().join(TREE_FILE));

        for file in [TREE_FILE, RESULTS_FILE, REPORT_FILE, BAG_LIST_FILE] {
            assert!(dir.path().join(file).exists(), "missing {file}");
        }
        for node in processed.root.descendants() {
            assert!(dir.path().join(tile_file_name(&node.guid())).exists());
        }

        let json = std::fs::read_to_string(dir.path().join(TREE_FILE)).unwrap();
        let record: NodeRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record.guid, processed.root.guid());
        assert_eq!(record.items_in_tree, processed.root.counters().items_in_tree());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_every_node_lands_in_a_leaf_tile() {
        let dir = tempfile::tempdir().unwrap();
        let processed = process_graph(ring_graph(300), dir.path(), &small_settings())
            .await
            .unwrap();

        let mut seen = std::collections::HashSet::new();
        for leaf in processed.root.leaves() {
            let json =
                std::fs::read_to_string(dir.path().join(tile_file_name(&leaf.guid()))).unwrap();
            let content: TileContent = serde_json::from_str(&json).unwrap();
            seen.extend(content.nodes.into_iter().map(|n| n.id));
        }
        assert_eq!(seen.len(), 300);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_root_sample_keeps_important_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let processed = process_graph(ring_graph(600), dir.path(), &small_settings())
            .await
            .unwrap();

        let sample = processed.root.sparse_bag().expect("root is sampled");
        for i in (0..600).step_by(100) {
            let id = format!("n{i}");
            assert!(
                sample.objects.iter().any(|o| matches!(o, GraphObject::Node(n) if n.id == id)),
                "{id} missing from the root sample"
            );
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_settings_rejected_before_building() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = small_settings();
        settings.build.batch_size = 0;

        let graph = Graph::from_input(
            serde_json::from_str(r#"{"nodes": [{"id": "a", "x": 0, "y": 0}]}"#).unwrap(),
        )
        .unwrap();
        let result = process_graph(graph, &dir.path().join("out"), &settings).await;

        assert!(matches!(result, Err(ProcessError::Config(_))));
        assert!(!dir.path().join("out").exists());
    }
}

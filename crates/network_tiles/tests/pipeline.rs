//! End-to-end test: tile a graph to disk, then serve it from a tree cache.

use network_tiles::{
    process_graph, BuildSettings, DirectoryTreeLoader, Graph, GraphObject, SpatialCentroid,
    SparsifySettings, TileContent, TileSettings, TreeCache,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

const BASE_URL: &str = "https://tiles.test";

async fn write_grid_graph(path: &Path, side: usize) {
    let mut nodes = Vec::new();
    let mut edges = Vec::new();
    for row in 0..side {
        for col in 0..side {
            let id = format!("{row}-{col}");
            nodes.push(json!({
                "id": id,
                "x": col as f64 * 3.1 + 0.05,
                "y": row as f64 * 2.9 + 0.05,
                "size": 2,
                "attrs": if row == col { json!({"importance": 1}) } else { json!({}) }
            }));
            if col > 0 {
                edges.push(json!({"source": format!("{row}-{}", col - 1), "target": id}));
            }
        }
    }
    let document = json!({"nodes": nodes, "edges": edges});
    tokio::fs::write(path, document.to_string()).await.unwrap();
}

fn url_to_path(root: &Path, url: &str) -> std::path::PathBuf {
    root.join(url.trim_start_matches(BASE_URL).trim_start_matches('/'))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tiles_are_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("graph.json");
    write_grid_graph(&input, 40).await;

    let settings = TileSettings {
        build: BuildSettings {
            max_objects_per_bag: 40,
            max_bags_before_split: 2,
            batch_size: 64,
            delay_ms: 1,
            ..BuildSettings::default()
        },
        sparsify: SparsifySettings {
            seed: Some(1),
            ..SparsifySettings::default()
        },
    };

    let graph = Graph::load(&input).await.unwrap();
    assert_eq!(graph.nodes.len(), 1600);
    assert_eq!(graph.edges.len(), 1560);

    let tiles_root = dir.path().join("tiles");
    let processed = process_graph(graph, &tiles_root.join("grid"), &settings)
        .await
        .unwrap();
    assert!(processed.summary.node_count > 1);

    let loader = DirectoryTreeLoader::new(&tiles_root, BASE_URL);
    let cache: TreeCache<GraphObject> = TreeCache::new(Arc::new(loader));
    let tree = cache.get_or_load("grid").await.unwrap();
    assert_eq!(tree.root().guid(), processed.root.guid());
    assert_eq!(
        tree.root().descendants().len(),
        processed.root.descendants().len()
    );

    // the full view at the leaf level sees every node of the graph
    let everything = *tree.root().centroid();
    let mut seen = std::collections::HashSet::new();
    for url in tree.matching_leaf_files(&everything) {
        let json = tokio::fs::read_to_string(url_to_path(&tiles_root, &url))
            .await
            .unwrap();
        let content: TileContent = serde_json::from_str(&json).unwrap();
        seen.extend(content.nodes.into_iter().map(|n| n.id));
    }
    assert_eq!(seen.len(), 1600);

    // a tight budget falls back to sampled internal tiles
    let files = tree.sparse_matching_files(&everything, 4);
    assert!(!files.is_empty());
    assert!(files.iter().any(|f| !f.is_leaf));
    for file in &files {
        let path = url_to_path(&tiles_root, &file.url);
        assert!(path.exists(), "missing {}", path.display());
    }

    // a small window near the origin touches few leaves
    let corner = SpatialCentroid::new(1.0, 1.0, 0.5, 0.5);
    let near = tree.matching_leaf_files(&corner);
    assert!(!near.is_empty());
    assert!(near.len() < processed.root.leaves().len());
}

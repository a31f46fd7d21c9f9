//! Tile builder entry point.
//!
//! Loads a graph, tiles it into `{output}/{asset}/` and optionally runs a
//! region query against the written tiles through a tree cache.

mod cli;
mod config;
mod logging;

use anyhow::{Context, Result};
use network_tiles::{process_graph, DirectoryTreeLoader, Graph, GraphObject, TreeCache};
use std::sync::Arc;
use tracing::{error, info};

use crate::cli::CliArgs;
use crate::config::AppConfig;
use crate::logging::setup_logging;

/// Sparse query budget when `--budget` is not given.
const DEFAULT_QUERY_BUDGET: usize = 16;

async fn run(args: CliArgs, config: AppConfig) -> Result<()> {
    let asset_id = args.asset_id();
    let output_root = config.output_dir();
    let output_dir = output_root.join(&asset_id);

    info!("📥 Reading graph from {}", args.input.display());
    let graph = Graph::load(&args.input)
        .await
        .with_context(|| format!("Failed to load graph {}", args.input.display()))?;
    info!(
        "🌍 Bounds {}: {} nodes, {} edges ({} dropped)",
        graph.bounds,
        graph.nodes.len(),
        graph.edges.len(),
        graph.dropped_edges
    );

    let processed = process_graph(graph, &output_dir, &config.tiles).await?;
    let summary = &processed.summary;
    info!("📋 Build summary:");
    info!("  - Objects: {}", summary.input_objects);
    info!(
        "  - Splits: {} | Bags reworked: {} | Reinserted while settling: {}",
        summary.build.tree.splits, summary.build.bags_reworked, summary.reinserted
    );
    info!(
        "  - Tiles: {} leaf, {} sparse",
        summary.leaf_tiles, summary.sparse_tiles
    );
    info!("  - Tree file: {}", summary.tree_file.display());

    if let Some(region) = args.query {
        let loader = DirectoryTreeLoader::new(&output_root, config.output.base_url.clone());
        let cache: TreeCache<GraphObject> = TreeCache::new(Arc::new(loader));
        let tree = cache.get_or_load(&asset_id).await?;
        let budget = args.budget.unwrap_or(DEFAULT_QUERY_BUDGET);

        let leaves = tree.matching_leaf_files(&region);
        let sparse = tree.sparse_matching_files(&region, budget);
        info!(
            "🔎 Query {}: {} leaf tiles, {} tiles within budget {}",
            region,
            leaves.len(),
            sparse.len(),
            budget
        );
        println!("{}", serde_json::to_string_pretty(&sparse)?);
    }

    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = CliArgs::parse()?;

    // Load configuration first (before logging setup)
    let mut config = AppConfig::load_from_file(&args.config_path).await?;
    config.apply_args(&args);
    config
        .validate()
        .context("Configuration validation failed")?;

    setup_logging(&config.logging)?;
    info!(
        "🚀 Tile Builder v{} | Config: {}",
        env!("CARGO_PKG_VERSION"),
        args.config_path.display()
    );

    if let Err(e) = run(args, config).await {
        error!("❌ Tiling failed: {:?}", e);
        std::process::exit(1);
    }

    Ok(())
}

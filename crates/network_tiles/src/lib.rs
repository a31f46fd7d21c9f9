//! # Network Tiles
//!
//! A concurrent quadtree index that cuts large graph datasets into tiles a
//! web viewer can fetch region by region, and zoom level by zoom level.
//!
//! ## Core Features
//!
//! - **Concurrent Build**: Producer, worker and reworker pools on Tokio share a
//!   lock-free work queue; only one build runs per coordinator at a time
//! - **Split and Shed**: Leaves buffer objects, shed them as immutable bags and
//!   split once they have shed enough; bags shed before a split are reworked
//!   into the new children
//! - **Sparsifying**: Every internal node gets a weighted random sample of its
//!   subtree, always keeping objects flagged as important
//! - **Region Queries**: Matching leaves for a rectangle, or the finest level
//!   of nodes that fits in a result budget
//! - **Tile Export**: `quad.json` plus one content file per node, and a cache
//!   that reloads trees for serving
//!
//! ## Architecture Overview
//!
//! - [`centroid`], [`bag`], [`node`]: regions, shed bags and tree nodes
//! - [`tree`]: single-object insertion, splitting and shedding
//! - [`coordinator`]: the concurrent build driver and its admission control
//! - [`store`]: where shed bags go
//! - [`sparsifier`], [`query`], [`cache`]: the read side
//! - [`graph`], [`source`], [`export`], [`processor`]: graph input, tile
//!   output and the pipeline joining them
//!
//! ## Quick Start Example
//!
//! ```rust,no_run
//! use network_tiles::{process_graph, Graph, QueryEngine, SpatialCentroid, TileSettings};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let graph = Graph::load(Path::new("graph.json")).await?;
//!     let processed = process_graph(graph, Path::new("tiles"), &TileSettings::default()).await?;
//!
//!     let engine = QueryEngine::new(processed.root);
//!     let view = SpatialCentroid::new(0.0, 0.0, 100.0, 100.0);
//!     for node in engine.sparse_matching_leaves(&view, 16) {
//!         println!("{} at depth {}", node.guid(), node.depth());
//!     }
//!     Ok(())
//! }
//! ```

pub mod bag;
pub mod cache;
pub mod centroid;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod export;
pub mod graph;
pub mod node;
pub mod processor;
pub mod query;
pub mod report;
pub mod source;
pub mod sparsifier;
pub mod store;
pub mod tree;

pub use bag::{BagId, QuadBag};
pub use cache::{CachedQuadTree, DirectoryTreeLoader, TileFile, TreeCache, TreeLoader};
pub use centroid::SpatialCentroid;
pub use config::{BuildSettings, SparsifySettings, TileSettings};
pub use coordinator::{BatchStream, BuildCoordinator, BuildSummary};
pub use error::*;
pub use export::TileWriter;
pub use graph::{GraphEdge, GraphNode, GraphObject, TileContent};
pub use node::{NodeId, NodeRecord, QuadNode, Quadable};
pub use processor::{process_graph, ProcessSummary, ProcessedGraph};
pub use query::QueryEngine;
pub use report::{annotate_counts, BuildSnapshot, TreeReport};
pub use source::{batch_objects, Graph};
pub use sparsifier::{Sparsifier, SparsifySummary};
pub use store::{BagStore, MemoryBagStore};
pub use tree::{QuadTree, TreeHooks, TreeLimits};

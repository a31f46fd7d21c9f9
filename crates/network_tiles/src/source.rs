//! Object sources: batching and JSON graph input.
//!
//! The input format is a plain JSON document:
//!
//! ```json
//! {
//!   "nodes": [{"id": "a", "x": 0.5, "y": 1.0, "label": "A", "size": 3, "r": 255}],
//!   "edges": [{"source": "a", "target": "b", "weight": 2.0}]
//! }
//! ```
//!
//! Edges are resolved against node positions when the graph is loaded; an
//! edge naming an unknown node is dropped with a warning.

use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{info, instrument, warn};

use crate::centroid::SpatialCentroid;
use crate::coordinator::BatchStream;
use crate::error::{SourceError, SourceResult};
use crate::graph::{GraphEdge, GraphNode, GraphObject};

/// Default objects per batch.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Half-width used for an axis along which every node has the same coordinate.
const MIN_HALF_WIDTH: f64 = 0.5;

/// Groups an iterator into batches of at most `batch_size` objects.
pub struct Batched<I: Iterator> {
    inner: I,
    batch_size: usize,
}

impl<I: Iterator> Iterator for Batched<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch: Vec<I::Item> = self.inner.by_ref().take(self.batch_size).collect();
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }
}

/// Wraps `objects` as a producer stream of batches.
pub fn batch_objects<I, T>(objects: I, batch_size: usize) -> BatchStream<T>
where
    I: IntoIterator<Item = T>,
    I::IntoIter: Send + 'static,
{
    Box::new(Batched {
        inner: objects.into_iter(),
        batch_size: batch_size.max(1),
    })
}

#[derive(Debug, Deserialize)]
struct InputNode {
    id: String,
    x: f64,
    y: f64,
    label: Option<String>,
    size: Option<f64>,
    r: Option<u8>,
    g: Option<u8>,
    b: Option<u8>,
    #[serde(default)]
    attrs: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct InputEdge {
    source: String,
    target: String,
    weight: Option<f64>,
    r: Option<u8>,
    g: Option<u8>,
    b: Option<u8>,
}

/// The raw JSON document.
#[derive(Debug, Deserialize)]
pub struct GraphInput {
    nodes: Vec<InputNode>,
    #[serde(default)]
    edges: Vec<InputEdge>,
}

/// A graph ready to be indexed.
#[derive(Debug, Clone)]
pub struct Graph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    /// Smallest region covering every node
    pub bounds: SpatialCentroid,
    /// Edges dropped for naming an unknown node
    pub dropped_edges: usize,
}

impl Graph {
    /// Reads and resolves a JSON graph file.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn load(path: &Path) -> SourceResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SourceError::FileRead(path.to_path_buf(), e))?;
        let input: GraphInput = serde_json::from_str(&content)
            .map_err(|e| SourceError::Deserialization(path.to_path_buf(), e))?;
        let graph = Self::from_input(input)?;
        info!(
            "📥 Loaded graph from {}: {} nodes, {} edges",
            path.display(),
            graph.nodes.len(),
            graph.edges.len()
        );
        Ok(graph)
    }

    pub fn from_input(input: GraphInput) -> SourceResult<Self> {
        if input.nodes.is_empty() {
            return Err(SourceError::EmptyGraph);
        }

        let mut nodes = Vec::with_capacity(input.nodes.len());
        for raw in input.nodes {
            if !raw.x.is_finite() || !raw.y.is_finite() {
                return Err(SourceError::InvalidPosition(raw.id));
            }
            let mut node = GraphNode::new(raw.id, raw.x, raw.y);
            if let Some(label) = raw.label {
                node.label = label;
            }
            node.size = raw.size.unwrap_or(1.0);
            node.r = raw.r.unwrap_or(0);
            node.g = raw.g.unwrap_or(0);
            node.b = raw.b.unwrap_or(0);
            node.attrs = raw.attrs;
            nodes.push(node);
        }

        let by_id: HashMap<&str, &GraphNode> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        let mut edges = Vec::with_capacity(input.edges.len());
        let mut dropped_edges = 0;
        for raw in input.edges {
            let (Some(source), Some(target)) =
                (by_id.get(raw.source.as_str()), by_id.get(raw.target.as_str()))
            else {
                warn!("Dropping edge {} to {}: unknown endpoint", raw.source, raw.target);
                dropped_edges += 1;
                continue;
            };
            let mut edge = GraphEdge::new(source, target);
            edge.weight = raw.weight.unwrap_or(1.0);
            edge.r = raw.r.unwrap_or(0);
            edge.g = raw.g.unwrap_or(0);
            edge.b = raw.b.unwrap_or(0);
            edges.push(edge);
        }

        let bounds = bounds_of(&nodes);
        Ok(Self {
            nodes,
            edges,
            bounds,
            dropped_edges,
        })
    }

    /// One producer stream for nodes and one for edges.
    pub fn into_streams(self, batch_size: usize) -> Vec<BatchStream<GraphObject>> {
        vec![
            batch_objects(self.nodes.into_iter().map(GraphObject::from), batch_size),
            batch_objects(self.edges.into_iter().map(GraphObject::from), batch_size),
        ]
    }

    pub fn object_count(&self) -> usize {
        self.nodes.len() + self.edges.len()
    }
}

fn bounds_of(nodes: &[GraphNode]) -> SpatialCentroid {
    let (mut min_x, mut min_y) = (f64::MAX, f64::MAX);
    let (mut max_x, mut max_y) = (f64::MIN, f64::MIN);
    for node in nodes {
        min_x = min_x.min(node.pos.x);
        min_y = min_y.min(node.pos.y);
        max_x = max_x.max(node.pos.x);
        max_y = max_y.max(node.pos.y);
    }

    let mut bounds = SpatialCentroid::from_bounds(min_x, min_y, max_x, max_y);
    if bounds.x_half_width <= 0.0 {
        bounds.x_half_width = MIN_HALF_WIDTH;
    }
    if bounds.y_half_width <= 0.0 {
        bounds.y_half_width = MIN_HALF_WIDTH;
    }
    bounds
}

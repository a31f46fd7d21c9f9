//! Graph nodes and edges as quadtree objects, and their tile content format.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::centroid::SpatialCentroid;
use crate::node::Quadable;

/// Tolerance below which a segment is treated as axis-aligned.
const EPSILON: f64 = 1e-6;

/// Attribute marking an object that sparsifying must always keep.
pub const IMPORTANCE_ATTR: &str = "importance";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// A graph vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub pos: Position,
    pub label: String,
    pub size: f64,
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub attrs: BTreeMap<String, Value>,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, x: f64, y: f64) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            pos: Position::new(x, y),
            size: 1.0,
            r: 0,
            g: 0,
            b: 0,
            attrs: BTreeMap::new(),
        }
    }

    /// Whether `attrs["importance"]` is 1.
    pub fn is_important(&self) -> bool {
        match self.attrs.get(IMPORTANCE_ATTR) {
            Some(Value::Number(n)) => n.as_f64() == Some(1.0),
            Some(Value::String(s)) => s.trim() == "1",
            Some(Value::Bool(b)) => *b,
            _ => false,
        }
    }
}

/// A graph edge with its endpoints resolved to positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub start: Position,
    pub end: Position,
    pub weight: f64,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl GraphEdge {
    pub fn new(source: &GraphNode, target: &GraphNode) -> Self {
        Self {
            source: source.id.clone(),
            target: target.id.clone(),
            start: source.pos,
            end: target.pos,
            weight: 1.0,
            r: 0,
            g: 0,
            b: 0,
        }
    }

    pub fn edge_id(&self) -> String {
        format!("{} to {}", self.source, self.target)
    }

    /// Inside the region, or crossing one of its borders.
    pub fn intersects(&self, region: &SpatialCentroid) -> bool {
        let (min_x, max_x) = (region.min_x(), region.max_x());
        let (min_y, max_y) = (region.min_y(), region.max_y());

        let contained = region.contains_point(self.start.x, self.start.y)
            && region.contains_point(self.end.x, self.end.y);

        contained
            || self.crosses_horizontal(max_y, min_x, max_x)
            || self.crosses_horizontal(min_y, min_x, max_x)
            || self.crosses_vertical(min_x, min_y, max_y)
            || self.crosses_vertical(max_x, min_y, max_y)
    }

    /// Whether the edge meets the segment from `(min_x, y)` to `(max_x, y)`.
    fn crosses_horizontal(&self, y: f64, min_x: f64, max_x: f64) -> bool {
        let (s, e) = (self.start, self.end);
        if y < s.y.min(e.y) || y > s.y.max(e.y) {
            return false;
        }
        if (e.y - s.y).abs() <= EPSILON {
            // flat edge lying on the line
            return (s.y - y).abs() <= EPSILON
                && s.x.max(e.x) >= min_x
                && s.x.min(e.x) <= max_x;
        }
        let x = (e.x - s.x) / (e.y - s.y) * (y - s.y) + s.x;
        x >= min_x && x <= max_x
    }

    /// Whether the edge meets the segment from `(x, min_y)` to `(x, max_y)`.
    fn crosses_vertical(&self, x: f64, min_y: f64, max_y: f64) -> bool {
        let (s, e) = (self.start, self.end);
        if x < s.x.min(e.x) || x > s.x.max(e.x) {
            return false;
        }
        if (e.x - s.x).abs() <= EPSILON {
            return (s.x - x).abs() <= EPSILON
                && s.y.max(e.y) >= min_y
                && s.y.min(e.y) <= max_y;
        }
        let y = (e.y - s.y) / (e.x - s.x) * (x - s.x) + s.y;
        y >= min_y && y <= max_y
    }
}

/// Anything stored in a graph quadtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum GraphObject {
    Node(GraphNode),
    Edge(GraphEdge),
}

impl GraphObject {
    pub fn is_important(&self) -> bool {
        match self {
            GraphObject::Node(node) => node.is_important(),
            GraphObject::Edge(_) => false,
        }
    }
}

impl Quadable for GraphObject {
    fn id(&self) -> String {
        match self {
            GraphObject::Node(node) => node.id.clone(),
            GraphObject::Edge(edge) => edge.edge_id(),
        }
    }

    fn is_within(&self, region: &SpatialCentroid) -> bool {
        match self {
            GraphObject::Node(node) => region.contains_point(node.pos.x, node.pos.y),
            GraphObject::Edge(edge) => edge.intersects(region),
        }
    }
}

impl From<GraphNode> for GraphObject {
    fn from(node: GraphNode) -> Self {
        GraphObject::Node(node)
    }
}

impl From<GraphEdge> for GraphObject {
    fn from(edge: GraphEdge) -> Self {
        GraphObject::Edge(edge)
    }
}

fn hex_color(r: u8, g: u8, b: u8) -> String {
    format!("#{:02X}{:02X}{:02X}", r, g, b)
}

/// A node as written to a tile file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigmaNode {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub label: String,
    pub size: u32,
    pub color: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, Value>,
}

impl From<&GraphNode> for SigmaNode {
    fn from(node: &GraphNode) -> Self {
        Self {
            id: node.id.clone(),
            x: node.pos.x,
            y: node.pos.y,
            label: node.label.clone(),
            size: node.size.clamp(1.0, 12.0) as u32,
            color: hex_color(node.r, node.g, node.b),
            attrs: node.attrs.clone(),
        }
    }
}

/// An edge as written to a tile file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigmaEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub color: String,
}

impl From<&GraphEdge> for SigmaEdge {
    fn from(edge: &GraphEdge) -> Self {
        Self {
            id: edge.edge_id(),
            source: edge.source.clone(),
            target: edge.target.clone(),
            color: hex_color(edge.r, edge.g, edge.b),
        }
    }
}

/// Contents of one `{guid}.json` tile file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TileContent {
    pub nodes: Vec<SigmaNode>,
    pub edges: Vec<SigmaEdge>,
}

impl TileContent {
    pub fn from_objects<'a, I>(objects: I) -> Self
    where
        I: IntoIterator<Item = &'a GraphObject>,
    {
        let mut content = TileContent::default();
        for object in objects {
            match object {
                GraphObject::Node(node) => content.nodes.push(node.into()),
                GraphObject::Edge(edge) => content.edges.push(edge.into()),
            }
        }
        content
    }

    pub fn len(&self) -> usize {
        self.nodes.len() + self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn edge(x1: f64, y1: f64, x2: f64, y2: f64) -> GraphEdge {
        GraphEdge::new(&GraphNode::new("a", x1, y1), &GraphNode::new("b", x2, y2))
    }

    #[test]
    fn test_node_containment_is_inclusive() {
        let region = SpatialCentroid::new(0.0, 0.0, 1.0, 1.0);
        let on_border = GraphObject::from(GraphNode::new("n", 1.0, -1.0));
        let outside = GraphObject::from(GraphNode::new("m", 1.1, 0.0));

        assert!(on_border.is_within(&region));
        assert!(!outside.is_within(&region));
    }

    #[test]
    fn test_edge_fully_inside() {
        let region = SpatialCentroid::new(0.0, 0.0, 10.0, 10.0);
        assert!(edge(-1.0, -1.0, 2.0, 3.0).intersects(&region));
    }

    #[test]
    fn test_edge_crossing_region() {
        let region = SpatialCentroid::new(0.0, 0.0, 1.0, 1.0);
        // passes straight through, both endpoints outside
        assert!(edge(-5.0, 0.5, 5.0, -0.5).intersects(&region));
        // diagonal through a corner
        assert!(edge(-2.0, -2.0, 2.0, 2.0).intersects(&region));
        // misses entirely
        assert!(!edge(2.0, -5.0, 2.5, 5.0).intersects(&region));
        assert!(!edge(-5.0, 3.0, 5.0, 2.0).intersects(&region));
    }

    #[test]
    fn test_axis_aligned_edges() {
        let region = SpatialCentroid::new(0.0, 0.0, 1.0, 1.0);
        assert!(edge(-3.0, 0.0, 3.0, 0.0).intersects(&region));
        assert!(edge(0.5, -3.0, 0.5, 3.0).intersects(&region));
        // on the top border line but beyond the right edge
        assert!(!edge(2.0, 1.0, 4.0, 1.0).intersects(&region));
    }

    #[test]
    fn test_edge_on_shared_border_is_in_both_neighbours() {
        let left = SpatialCentroid::new(-5.0, 0.0, 5.0, 5.0);
        let right = SpatialCentroid::new(5.0, 0.0, 5.0, 5.0);
        let on_border = GraphObject::from(edge(0.0, -2.0, 0.0, 2.0));

        assert_eq!(left.max_x(), 0.0);
        assert!(on_border.is_within(&left));
        assert!(on_border.is_within(&right));
    }

    #[test]
    fn test_importance_attr() {
        let mut node = GraphNode::new("n", 0.0, 0.0);
        assert!(!node.is_important());
        node.attrs.insert(IMPORTANCE_ATTR.to_string(), json!(1));
        assert!(node.is_important());
        node.attrs.insert(IMPORTANCE_ATTR.to_string(), json!("1"));
        assert!(node.is_important());
        node.attrs.insert(IMPORTANCE_ATTR.to_string(), json!(0));
        assert!(!node.is_important());
    }

    #[test]
    fn test_tile_content_format() {
        let mut a = GraphNode::new("a", 1.5, -2.0);
        a.size = 40.0;
        a.r = 255;
        a.b = 16;
        let b = GraphNode::new("b", 0.0, 0.0);
        let mut e = GraphEdge::new(&a, &b);
        e.g = 10;

        let objects = vec![GraphObject::from(a), GraphObject::from(b), GraphObject::from(e)];
        let content = TileContent::from_objects(&objects);
        let value = serde_json::to_value(&content).unwrap();

        assert_eq!(value["nodes"][0]["id"], "a");
        assert_eq!(value["nodes"][0]["size"], 12);
        assert_eq!(value["nodes"][0]["color"], "#FF0010");
        assert_eq!(value["nodes"][1]["size"], 1);
        assert_eq!(value["edges"][0]["id"], "a to b");
        assert_eq!(value["edges"][0]["color"], "#000A00");
        assert_eq!(content.len(), 3);
    }
}

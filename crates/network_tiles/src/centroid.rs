//! Rectangular regions owned by quadtree nodes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An axis-aligned rectangle described by its center and half-widths.
///
/// Borders are inclusive: a point lying exactly on `x_center + x_half_width`
/// belongs to the region. Two centroids are equal only if all four fields
/// match exactly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpatialCentroid {
    pub x_center: f64,
    pub y_center: f64,
    pub x_half_width: f64,
    pub y_half_width: f64,
}

impl SpatialCentroid {
    /// Creates a centroid from its center and half-widths.
    pub fn new(x_center: f64, y_center: f64, x_half_width: f64, y_half_width: f64) -> Self {
        Self {
            x_center,
            y_center,
            x_half_width,
            y_half_width,
        }
    }

    /// Creates the smallest centroid covering the given bounds.
    pub fn from_bounds(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        let x_half_width = (max_x - min_x) / 2.0;
        let y_half_width = (max_y - min_y) / 2.0;
        Self {
            x_center: min_x + x_half_width,
            y_center: min_y + y_half_width,
            x_half_width,
            y_half_width,
        }
    }

    pub fn min_x(&self) -> f64 {
        self.x_center - self.x_half_width
    }

    pub fn max_x(&self) -> f64 {
        self.x_center + self.x_half_width
    }

    pub fn min_y(&self) -> f64 {
        self.y_center - self.y_half_width
    }

    pub fn max_y(&self) -> f64 {
        self.y_center + self.y_half_width
    }

    /// Whether a point lies inside this region, borders included.
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.min_x() && x <= self.max_x() && y >= self.min_y() && y <= self.max_y()
    }

    /// The four quadrants produced by a split.
    ///
    /// Ordered `(-x,-y)`, `(-x,+y)`, `(+x,-y)`, `(+x,+y)`. Each quadrant has half
    /// the half-widths of this region and a center offset by that amount.
    pub fn quadrants(&self) -> [SpatialCentroid; 4] {
        let hw = self.x_half_width / 2.0;
        let hh = self.y_half_width / 2.0;
        let mut quads = [*self; 4];
        let mut index = 0;
        for x_sign in [-1.0, 1.0] {
            for y_sign in [-1.0, 1.0] {
                quads[index] = SpatialCentroid::new(
                    self.x_center + x_sign * hw,
                    self.y_center + y_sign * hh,
                    hw,
                    hh,
                );
                index += 1;
            }
        }
        quads
    }

    /// Rectangle overlap test used by region queries.
    ///
    /// `other` matches if its center lies within `self`, or if its border
    /// interval overlaps ours on both axes. The interval test covers `other`
    /// straddling either border as well as `other` sitting wholly between
    /// them, which in turn covers `self` being fully inside `other`.
    pub fn overlaps(&self, other: &SpatialCentroid) -> bool {
        if self.contains_point(other.x_center, other.y_center) {
            return true;
        }

        let crosses_x = straddles(other.min_x(), other.max_x(), self.min_x())
            || straddles(other.min_x(), other.max_x(), self.max_x())
            || (other.min_x() >= self.min_x() && other.max_x() <= self.max_x());
        let crosses_y = straddles(other.min_y(), other.max_y(), self.min_y())
            || straddles(other.min_y(), other.max_y(), self.max_y())
            || (other.min_y() >= self.min_y() && other.max_y() <= self.max_y());

        crosses_x && crosses_y
    }

    pub fn area(&self) -> f64 {
        4.0 * self.x_half_width * self.y_half_width
    }
}

fn straddles(low: f64, high: f64, border: f64) -> bool {
    low <= border && high >= border
}

impl fmt::Display for SpatialCentroid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x_center: {}, y_center: {}, x_half_width: {}, y_half_width: {}",
            self.x_center, self.y_center, self.x_half_width, self.y_half_width
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quadrant_split_is_exact() {
        let c = SpatialCentroid::new(50.0, 50.0, 100.0, 100.0);
        let quads = c.quadrants();

        assert_eq!(quads[0], SpatialCentroid::new(0.0, 0.0, 50.0, 50.0));
        assert_eq!(quads[1], SpatialCentroid::new(0.0, 100.0, 50.0, 50.0));
        assert_eq!(quads[2], SpatialCentroid::new(100.0, 0.0, 50.0, 50.0));
        assert_eq!(quads[3], SpatialCentroid::new(100.0, 100.0, 50.0, 50.0));

        let total: f64 = quads.iter().map(SpatialCentroid::area).sum();
        assert_eq!(total, c.area());
    }

    #[test]
    fn test_from_bounds() {
        let c = SpatialCentroid::from_bounds(0.0, -10.0, 100.0, 10.0);
        assert_eq!(c, SpatialCentroid::new(50.0, 0.0, 50.0, 10.0));
        assert_eq!(c.min_x(), 0.0);
        assert_eq!(c.max_y(), 10.0);
    }

    #[test]
    fn test_borders_are_inclusive() {
        let c = SpatialCentroid::new(0.0, 0.0, 10.0, 10.0);
        assert!(c.contains_point(10.0, 10.0));
        assert!(c.contains_point(-10.0, 0.0));
        assert!(!c.contains_point(10.000001, 0.0));
    }

    #[test]
    fn test_overlap_cases() {
        let query = SpatialCentroid::new(0.0, 0.0, 10.0, 10.0);

        // fully inside the query
        assert!(query.overlaps(&SpatialCentroid::new(1.0, 1.0, 2.0, 2.0)));
        // query fully inside the quad
        assert!(query.overlaps(&SpatialCentroid::new(0.0, 0.0, 100.0, 100.0)));
        // crosses the right border, fully between the y borders
        assert!(query.overlaps(&SpatialCentroid::new(12.0, 0.0, 5.0, 2.0)));
        // crosses a corner
        assert!(query.overlaps(&SpatialCentroid::new(12.0, 12.0, 5.0, 5.0)));
        // touching edge only
        assert!(query.overlaps(&SpatialCentroid::new(15.0, 0.0, 5.0, 5.0)));
        // disjoint
        assert!(!query.overlaps(&SpatialCentroid::new(30.0, 0.0, 5.0, 5.0)));
        assert!(!query.overlaps(&SpatialCentroid::new(0.0, -30.0, 5.0, 5.0)));
    }

    #[test]
    fn test_equality_is_exact() {
        let a = SpatialCentroid::new(1.0, 2.0, 3.0, 4.0);
        let b = SpatialCentroid::new(1.0, 2.0, 3.0, 4.0 + f64::EPSILON * 8.0);
        assert_eq!(a, a);
        assert_ne!(a, b);
    }
}

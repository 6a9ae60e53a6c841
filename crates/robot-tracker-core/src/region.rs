//! Operator-defined image regions that bound where targets are searched.

use serde::{Deserialize, Serialize};

use crate::{PixelRect, Pt2};

/// Static region of one camera's image, in pixels.
///
/// Serialized with a `shape` tag, e.g.
/// `{"shape": "circle", "center": [320.0, 240.0], "radius": 100.0}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum WorkspaceRegion {
    Rectangle(PixelRect),
    Circle { center: Pt2, radius: f64 },
    /// Ordered vertices; the closing edge is implicit.
    Polygon { vertices: Vec<Pt2> },
}

impl WorkspaceRegion {
    pub fn is_valid(&self) -> bool {
        match self {
            WorkspaceRegion::Rectangle(r) => r.width > 0 && r.height > 0,
            WorkspaceRegion::Circle { center, radius } => {
                let finite = center.x.is_finite() && center.y.is_finite() && radius.is_finite();
                finite && *radius > 0.0
            }
            WorkspaceRegion::Polygon { vertices } => {
                vertices.len() >= 3
                    && vertices.iter().all(|v| v.x.is_finite() && v.y.is_finite())
                    && polygon_area(vertices) > 0.0
            }
        }
    }

    /// Point test. Circle and polygon boundaries count as inside.
    pub fn contains(&self, p: Pt2) -> bool {
        match self {
            WorkspaceRegion::Rectangle(r) => r.contains_point(p),
            WorkspaceRegion::Circle { center, radius } => (p - *center).norm() <= *radius,
            WorkspaceRegion::Polygon { vertices } => polygon_contains(vertices, p),
        }
    }

    /// Smallest pixel rectangle covering the region, clipped to a
    /// `width × height` frame. `None` if the region lies outside the frame.
    pub fn bounding_rect(&self, width: usize, height: usize) -> Option<PixelRect> {
        match self {
            WorkspaceRegion::Rectangle(r) => r.intersection(&PixelRect::full(width, height)),
            WorkspaceRegion::Circle { center, radius } => {
                PixelRect::around(*center, *radius, width, height)
            }
            WorkspaceRegion::Polygon { vertices } => {
                if vertices.len() < 3 {
                    return None;
                }
                let (mut x0, mut y0) = (f64::INFINITY, f64::INFINITY);
                let (mut x1, mut y1) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
                for v in vertices {
                    x0 = x0.min(v.x);
                    y0 = y0.min(v.y);
                    x1 = x1.max(v.x);
                    y1 = y1.max(v.y);
                }
                let x0 = x0.floor().max(0.0);
                let y0 = y0.floor().max(0.0);
                let x1 = x1.ceil().min(width as f64);
                let y1 = y1.ceil().min(height as f64);
                if !(x0 < x1 && y0 < y1) {
                    return None;
                }
                Some(PixelRect {
                    x: x0 as u32,
                    y: y0 as u32,
                    width: (x1 - x0) as u32,
                    height: (y1 - y0) as u32,
                })
            }
        }
    }
}

fn polygon_area(vertices: &[Pt2]) -> f64 {
    let n = vertices.len();
    let twice: f64 = (0..n)
        .map(|i| {
            let (a, b) = (vertices[i], vertices[(i + 1) % n]);
            a.x * b.y - b.x * a.y
        })
        .sum();
    0.5 * twice.abs()
}

fn on_segment(a: Pt2, b: Pt2, p: Pt2) -> bool {
    let ab = b - a;
    let ap = p - a;
    let cross = ab.x * ap.y - ab.y * ap.x;
    let len = ab.norm();
    if len == 0.0 {
        return ap.norm() <= 1e-9;
    }
    cross.abs() / len <= 1e-9 && ap.dot(&ab) >= 0.0 && ap.dot(&ab) <= ab.norm_squared()
}

/// Even-odd ray casting with the boundary treated as inside.
fn polygon_contains(vertices: &[Pt2], p: Pt2) -> bool {
    let n = vertices.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (vi, vj) = (vertices[i], vertices[j]);
        if on_segment(vj, vi, p) {
            return true;
        }
        let crosses = (vi.y > p.y) != (vj.y > p.y);
        if crosses && p.x < (vj.x - vi.x) * (p.y - vi.y) / (vj.y - vi.y) + vi.x {
            inside = !inside;
        }
        j = i;
    }
    inside
}

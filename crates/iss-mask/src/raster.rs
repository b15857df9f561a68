//! Polygon geometry and scan-line rasterization.
//!
//! Pixels follow the center convention: pixel `(x, y)` is covered when the
//! point `(x + 0.5, y + 0.5)` is inside the polygon under the even-odd rule.
//! Work is restricted to the polygon's bounding box clamped to the image.

use crate::types::{BoundingBox, Pixel, Point};

/// Rasterize a polygon into the set of covered pixels, in row-major order.
///
/// Fewer than 3 vertices, a zero-sized image or non-finite coordinates
/// yield an empty set. Self-intersecting polygons are filled even-odd.
pub fn polygon_to_pixels(points: &[Point], width: u32, height: u32) -> Vec<Pixel> {
    if points.len() < 3 || width == 0 || height == 0 {
        return Vec::new();
    }
    if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
        return Vec::new();
    }

    let bb = bounding_box(points);
    let y_start = bb.y.floor().max(0.0);
    let y_end = (bb.y + bb.height).ceil().min(height as f64);
    if y_end <= y_start {
        return Vec::new();
    }

    let mut pixels = Vec::new();
    let mut xs: Vec<f64> = Vec::with_capacity(points.len());
    for y in (y_start as u32)..(y_end as u32) {
        scanline_intersections(points, y as f64 + 0.5, &mut xs);
        // Sorted crossings pair up into disjoint inside spans [xs[0], xs[1]), ...
        for span in xs.chunks_exact(2) {
            let start = (span[0] - 0.5).ceil().max(0.0);
            let end = (span[1] - 0.5).ceil().min(width as f64);
            if end <= start {
                continue;
            }
            pixels.extend((start as u32..end as u32).map(|x| Pixel { x, y }));
        }
    }
    pixels
}

/// Collect the sorted x positions where the polygon boundary crosses the
/// horizontal line at `sample_y`.
///
/// An edge counts when exactly one endpoint lies strictly below the line,
/// so a vertex shared by two edges is never counted twice.
fn scanline_intersections(points: &[Point], sample_y: f64, xs: &mut Vec<f64>) {
    xs.clear();
    let n = points.len();
    for i in 0..n {
        let p1 = points[i];
        let p2 = points[(i + 1) % n];
        if (p1.y > sample_y) != (p2.y > sample_y) {
            xs.push(p1.x + (sample_y - p1.y) * (p2.x - p1.x) / (p2.y - p1.y));
        }
    }
    xs.sort_by(|a, b| a.total_cmp(b));
}

/// Shoelace area of a polygon; 0 for fewer than 3 vertices.
pub fn polygon_area(points: &[Point]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let n = points.len();
    let mut twice_area = 0.0;
    for i in 0..n {
        let j = (i + 1) % n;
        twice_area += points[i].x * points[j].y - points[j].x * points[i].y;
    }
    twice_area.abs() / 2.0
}

/// Axis-aligned vertex bounding box; all zero for an empty list.
pub fn bounding_box(points: &[Point]) -> BoundingBox {
    let Some(first) = points.first() else {
        return BoundingBox::default();
    };
    let (mut min_x, mut max_x, mut min_y, mut max_y) = (first.x, first.x, first.y, first.y);
    for p in &points[1..] {
        min_x = min_x.min(p.x);
        max_x = max_x.max(p.x);
        min_y = min_y.min(p.y);
        max_y = max_y.max(p.y);
    }
    BoundingBox {
        x: min_x,
        y: min_y,
        width: max_x - min_x,
        height: max_y - min_y,
    }
}

/// Union of several boxes as a clockwise 4-point rectangle, `None` when empty.
pub fn combined_bounding_box<'a>(boxes: impl IntoIterator<Item = &'a BoundingBox>) -> Option<Vec<Point>> {
    let mut boxes = boxes.into_iter();
    let first = boxes.next()?;
    let (mut min_x, mut min_y) = (first.x, first.y);
    let (mut max_x, mut max_y) = (first.x + first.width, first.y + first.height);
    for bb in boxes {
        min_x = min_x.min(bb.x);
        min_y = min_y.min(bb.y);
        max_x = max_x.max(bb.x + bb.width);
        max_y = max_y.max(bb.y + bb.height);
    }
    Some(vec![
        Point::new(min_x, min_y),
        Point::new(max_x, min_y),
        Point::new(max_x, max_y),
        Point::new(min_x, max_y),
    ])
}

// ============================================================================
// GEOMETRY UTILITIES — segment/rect tests used by drawing and selection
// ============================================================================

use emath::{Pos2, Rect, pos2};

/// Inclusive point-in-rect test. `padding` widens the rect symmetrically so a
/// brush whose center is just outside the canvas but whose radius overlaps it
/// is not prematurely discarded.
pub fn point_in_rect(p: Pos2, rect: Rect, padding: f32) -> bool {
    p.x >= rect.min.x - padding
        && p.x <= rect.max.x + padding
        && p.y >= rect.min.y - padding
        && p.y <= rect.max.y + padding
}

/// Intersection of segments p1–p2 and p3–p4, if the parametric solutions for
/// both segments land in [0, 1].
pub fn line_line(p1: Pos2, p2: Pos2, p3: Pos2, p4: Pos2) -> Option<Pos2> {
    let denom = (p4.y - p3.y) * (p2.x - p1.x) - (p4.x - p3.x) * (p2.y - p1.y);
    let ua = ((p4.x - p3.x) * (p1.y - p3.y) - (p4.y - p3.y) * (p1.x - p3.x)) / denom;
    let ub = ((p2.x - p1.x) * (p1.y - p3.y) - (p2.y - p1.y) * (p1.x - p3.x)) / denom;

    if (0.0..=1.0).contains(&ua) && (0.0..=1.0).contains(&ub) {
        Some(pos2(p1.x + ua * (p2.x - p1.x), p1.y + ua * (p2.y - p1.y)))
    } else {
        None
    }
}

/// Intersection points between segment p1–p2 and the four (padded) edges of
/// `rect`: 0 to 4 points, in top/right/bottom/left edge order.
pub fn line_rect(p1: Pos2, p2: Pos2, rect: Rect, padding: f32) -> Vec<Pos2> {
    let (l, t) = (rect.min.x - padding, rect.min.y - padding);
    let (r, b) = (rect.max.x + padding, rect.max.y + padding);

    [
        line_line(p1, p2, pos2(l, t), pos2(r, t)),
        line_line(p1, p2, pos2(r, t), pos2(r, b)),
        line_line(p1, p2, pos2(l, b), pos2(r, b)),
        line_line(p1, p2, pos2(l, t), pos2(l, b)),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Clamp segment p1–p2 to the (padded) rect.
///
/// Exactly one edge intersection: the endpoint inside the rect is kept and
/// the other is replaced by the intersection. Two intersections (both
/// endpoints outside, segment crossing through): the intersections, sorted by
/// distance from p1. Anything else: the segment unchanged — callers decide
/// whether a fully-outside segment should be skipped.
pub fn clamp_segment(p1: Pos2, p2: Pos2, rect: Rect, padding: f32) -> (Pos2, Pos2) {
    let mut hits = line_rect(p1, p2, rect, padding);

    match hits.len() {
        1 => {
            if point_in_rect(p1, rect, padding) {
                (p1, hits[0])
            } else {
                (hits[0], p2)
            }
        }
        2 => {
            hits.sort_by(|a, b| p1.distance(*a).total_cmp(&p1.distance(*b)));
            (hits[0], hits[1])
        }
        _ => (p1, p2),
    }
}

/// Grow a running bounding rect to include `p` in O(1). Seed with
/// [`Rect::NOTHING`] so the first point becomes a zero-size rect.
pub fn grow_rect(rect: Rect, p: Pos2) -> Rect {
    let mut rect = rect;
    rect.extend_with(p);
    rect
}

/// The value of smaller magnitude, sign preserved.
pub fn min_abs(a: f32, b: f32) -> f32 {
    if b.abs() < a.abs() { b } else { a }
}

/// The value of larger magnitude, sign preserved.
pub fn max_abs(a: f32, b: f32) -> f32 {
    if b.abs() > a.abs() { b } else { a }
}

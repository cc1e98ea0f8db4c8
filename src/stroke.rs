// ============================================================================
// STROKES — immutable vector records of drawn content
// ============================================================================

use ab_glyph::FontArc;
use emath::{Pos2, Rect};
use image::Rgba;

use crate::transform::Affine2;

/// Pixel-blending rule used when a stroke is rasterized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CompositeMode {
    /// Paint over what is already there (source-over).
    #[default]
    Normal,
    /// Punch through to transparency (destination-out).
    Erase,
}

impl CompositeMode {
    pub fn name(&self) -> &'static str {
        match self {
            CompositeMode::Normal => "normal",
            CompositeMode::Erase => "erase",
        }
    }

    pub fn all() -> &'static [CompositeMode] {
        &[CompositeMode::Normal, CompositeMode::Erase]
    }
}

/// One segment of a brush path. Coordinates are canvas space at draw time;
/// the owning stroke's `transform` maps them into the layer-local frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PathSegment {
    MoveTo(Pos2),
    LineTo(Pos2),
    QuadTo { ctrl: Pos2, to: Pos2 },
}

/// An ordered run of path segments, built incrementally while the pointer
/// moves.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VectorPath {
    pub segments: Vec<PathSegment>,
}

impl VectorPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn move_to(&mut self, p: Pos2) {
        self.segments.push(PathSegment::MoveTo(p));
    }

    pub fn line_to(&mut self, p: Pos2) {
        self.segments.push(PathSegment::LineTo(p));
    }

    pub fn quad_to(&mut self, ctrl: Pos2, to: Pos2) {
        self.segments.push(PathSegment::QuadTo { ctrl, to });
    }

    pub fn is_empty(&self) -> bool {
        // a lone MoveTo draws nothing
        !self.segments.iter().any(|s| !matches!(s, PathSegment::MoveTo(_)))
    }
}

/// A free-hand brush stroke.
#[derive(Clone, Debug, PartialEq)]
pub struct PathStroke {
    pub color: Rgba<u8>,
    pub width: f32,
    pub path: VectorPath,
    pub mode: CompositeMode,
    /// Crop/selection bounds active at draw time, same frame as `path`.
    pub clip: Rect,
    /// Inverse of the layer transform at the moment the stroke was drawn:
    /// maps draw-time canvas coordinates into the layer-local frame, so
    /// later transform edits never disturb recorded ink.
    pub transform: Affine2,
}

/// A committed run of text, rasterized as static geometry.
#[derive(Clone, Debug)]
pub struct TextStroke {
    pub text: String,
    pub font: FontArc,
    /// Pixel height of the font.
    pub size: f32,
    /// Left edge / vertical center of the first line, draw-time canvas frame.
    pub origin: Pos2,
    pub color: Rgba<u8>,
    pub clip: Rect,
    pub transform: Affine2,
}

impl PartialEq for TextStroke {
    // the font handle is session-constant and carries no Eq; compare the
    // recorded geometry and style
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
            && self.size == other.size
            && self.origin == other.origin
            && self.color == other.color
            && self.clip == other.clip
            && self.transform == other.transform
    }
}

/// One immutable, append-only unit of drawn content in a layer's state.
#[derive(Clone, Debug, PartialEq)]
pub enum Stroke {
    Path(PathStroke),
    Text(TextStroke),
}

impl Stroke {
    pub fn clip(&self) -> Rect {
        match self {
            Stroke::Path(s) => s.clip,
            Stroke::Text(s) => s.clip,
        }
    }

    pub fn transform(&self) -> Affine2 {
        match self {
            Stroke::Path(s) => s.transform,
            Stroke::Text(s) => s.transform,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emath::pos2;

    #[test]
    fn empty_path_detection() {
        let mut path = VectorPath::new();
        assert!(path.is_empty());
        path.move_to(pos2(1.0, 2.0));
        assert!(path.is_empty());
        path.line_to(pos2(3.0, 4.0));
        assert!(!path.is_empty());
    }

    #[test]
    fn composite_mode_names() {
        assert_eq!(CompositeMode::Normal.name(), "normal");
        assert_eq!(CompositeMode::Erase.name(), "erase");
        assert_eq!(CompositeMode::all().len(), 2);
    }
}

// ============================================================================
// LAYER — live raster owner for one slot of the stack
// ============================================================================

use std::sync::Arc;

use emath::{Rect, vec2};
use image::RgbaImage;

use crate::document::{LayerEntry, LayerId};
use crate::raster;
use crate::stroke::Stroke;
use crate::transform::Affine2;

/// The immutable, history-visible part of a layer. `strokes` only grows by
/// append or shrinks by undo; [`Layer::set_state`] compares lengths to decide
/// between incremental repaint and full rebuild.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerState {
    /// Committed transform, layer-local center-origin space to canvas
    /// center-origin space.
    pub transform: Affine2,
    pub visible: bool,
    /// Layer opacity in `[0, 1]`.
    pub alpha: f32,
    pub strokes: Vec<Stroke>,
}

impl Default for LayerState {
    fn default() -> Self {
        Self { transform: Affine2::IDENTITY, visible: true, alpha: 1.0, strokes: Vec::new() }
    }
}

/// A live layer: one raster surface sized to fit its content, the mirror of
/// the last applied [`LayerState`], and a transient preview transform for
/// in-progress move/rotate/scale gestures.
///
/// The layer-local frame is center-origin: surface pixel `(x, y)` is local
/// point `(x - sw/2, y - sh/2)`. The base image is drawn centered, and the
/// surface may grow beyond the canvas to fit out-of-bounds strokes.
pub struct Layer {
    id: LayerId,
    name: String,
    image: Option<Arc<RgbaImage>>,
    surface: RgbaImage,
    state: LayerState,
    preview: Affine2,
}

impl Layer {
    pub fn from_image(name: impl Into<String>, image: RgbaImage) -> Self {
        let image = Arc::new(image);
        let mut layer = Self {
            id: LayerId::new(),
            name: name.into(),
            surface: RgbaImage::new(image.width(), image.height()),
            image: Some(image),
            state: LayerState::default(),
            preview: Affine2::IDENTITY,
        };
        layer.repaint();
        layer
    }

    pub fn empty(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: LayerId::new(),
            name: name.into(),
            image: None,
            surface: RgbaImage::new(width.max(1), height.max(1)),
            state: LayerState::default(),
            preview: Affine2::IDENTITY,
        }
    }

    /// Rebuild a layer from a history entry. Only reached when the live layer
    /// for a restored snapshot is gone; replays the full stroke log.
    pub fn from_entry(entry: &LayerEntry, canvas_width: u32, canvas_height: u32) -> Self {
        let surface = match &entry.image {
            Some(img) => RgbaImage::new(img.width(), img.height()),
            None => RgbaImage::new(canvas_width.max(1), canvas_height.max(1)),
        };
        let mut layer = Self {
            id: entry.id,
            name: entry.name.clone(),
            image: entry.image.clone(),
            surface,
            state: entry.state.clone(),
            preview: Affine2::IDENTITY,
        };
        layer.repaint();
        layer
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &LayerState {
        &self.state
    }

    pub fn surface_size(&self) -> (u32, u32) {
        self.surface.dimensions()
    }

    /// Snapshot this layer for a Document.
    pub fn entry(&self) -> LayerEntry {
        LayerEntry {
            id: self.id,
            name: self.name.clone(),
            image: self.image.clone(),
            state: self.state.clone(),
        }
    }

    /// Preview × committed — what the layer is currently displayed with.
    pub fn full_transform(&self) -> Affine2 {
        self.preview * self.state.transform
    }

    pub fn preview_transform(&self) -> Affine2 {
        self.preview
    }

    /// Apply an immutable snapshot to the live surface.
    ///
    /// Strokes were added: rasterize only the new suffix (cheap, the redo /
    /// commit path). Strokes were removed: clear, redraw the base image,
    /// replay the survivors in order — raster operations are not invertible,
    /// so undo pays the full rebuild. Equal lengths leave the surface alone;
    /// transform, visibility and alpha are draw-time attributes.
    pub fn set_state(&mut self, new: &LayerState) {
        let old_len = self.state.strokes.len();
        let new_len = new.strokes.len();

        if new_len > old_len {
            for stroke in &new.strokes[old_len..] {
                let place = self.surface_offset() * stroke.transform();
                raster::draw_stroke(&mut self.surface, stroke, place);
            }
            self.state = new.clone();
        } else if new_len < old_len {
            self.state = new.clone();
            self.repaint();
        } else {
            self.state = new.clone();
        }
    }

    /// Pre-multiply a delta onto the transient preview transform.
    pub fn preview_transform_by(&mut self, delta: Affine2) {
        self.preview = delta * self.preview;
    }

    pub fn preview_transform_to(&mut self, m: Affine2) {
        self.preview = m;
    }

    /// Drop an in-progress transform gesture without committing.
    pub fn cancel_preview(&mut self) {
        self.preview = Affine2::IDENTITY;
    }

    /// Compose the preview into the committed transform and reset it.
    /// Returns the new snapshot for the caller to push into history, or
    /// `None` when the preview was already identity (no-op signal — keeps
    /// history free of empty entries).
    pub fn finalize_preview(&mut self) -> Option<LayerState> {
        if self.preview.is_identity() {
            return None;
        }
        self.state.transform = self.preview * self.state.transform;
        self.preview = Affine2::IDENTITY;
        Some(self.state.clone())
    }

    /// Grow the backing surface symmetrically on each side until
    /// `stroke_rect` (layer-local), widened by half the stroke width, fits.
    /// Growth shifts the surface origin, so the base image and every stroke
    /// are replayed.
    pub fn resize_fit_stroke(&mut self, stroke_rect: Rect, stroke_width: f32) {
        let (w, h) = (self.surface.width() as f32, self.surface.height() as f32);
        let half = stroke_width / 2.0;

        // local frame is center-origin, so the surface spans ±w/2, ±h/2.
        // An empty rect (Rect::NOTHING) yields -inf overflows and no growth.
        let dx = (-w / 2.0 - (stroke_rect.min.x - half))
            .max((stroke_rect.max.x + half) - w / 2.0)
            .max(0.0);
        let dy = (-h / 2.0 - (stroke_rect.min.y - half))
            .max((stroke_rect.max.y + half) - h / 2.0)
            .max(0.0);

        if dx > 0.0 || dy > 0.0 {
            let new_w = (w + (2.0 * dx).trunc()) as u32;
            let new_h = (h + (2.0 * dy).trunc()) as u32;
            self.surface = RgbaImage::new(new_w, new_h);
            self.repaint();
        }
    }

    /// Append a stroke and rasterize it incrementally. Returns the new
    /// snapshot for the caller to commit.
    pub fn add_stroke(&mut self, stroke: Stroke) -> LayerState {
        let place = self.surface_offset() * stroke.transform();
        raster::draw_stroke(&mut self.surface, &stroke, place);
        self.state.strokes.push(stroke);
        self.state.clone()
    }

    /// Composite this layer onto a canvas-sized target, applying alpha and
    /// preview × committed transform. A no-op when the layer is hidden,
    /// fully transparent, or has nothing to show.
    pub fn draw_on(&self, target: &mut RgbaImage) {
        self.draw_on_with_alpha(target, self.state.alpha);
    }

    /// Like [`Self::draw_on`] with an alpha override — the sandwich middle
    /// cache is rendered opaque and the layer alpha applied at recombine.
    pub(crate) fn draw_on_with_alpha(&self, target: &mut RgbaImage, alpha: f32) {
        if !self.state.visible
            || alpha <= 0.0
            || (self.state.strokes.is_empty() && self.image.is_none())
        {
            return;
        }

        let (tw, th) = target.dimensions();
        let (sw, sh) = self.surface.dimensions();
        let m = Affine2::from_translation(vec2(tw as f32 / 2.0, th as f32 / 2.0))
            * self.preview
            * self.state.transform
            * Affine2::from_translation(vec2(-(sw as f32) / 2.0, -(sh as f32) / 2.0));
        raster::transform_blit(target, &self.surface, m, alpha, None);
    }

    /// Direct read access for the compositor's middle-cache path and tests.
    pub fn surface(&self) -> &RgbaImage {
        &self.surface
    }

    fn surface_offset(&self) -> Affine2 {
        Affine2::from_translation(vec2(
            self.surface.width() as f32 / 2.0,
            self.surface.height() as f32 / 2.0,
        ))
    }

    /// Clear, draw the base image centered, replay every committed stroke.
    fn repaint(&mut self) {
        raster::clear(&mut self.surface);
        if let Some(img) = &self.image {
            let ox = (self.surface.width() as i64 - img.width() as i64) / 2;
            let oy = (self.surface.height() as i64 - img.height() as i64) / 2;
            image::imageops::replace(&mut self.surface, &**img, ox, oy);
        }
        let offset = self.surface_offset();
        let strokes = std::mem::take(&mut self.state.strokes);
        for stroke in &strokes {
            raster::draw_stroke(&mut self.surface, stroke, offset * stroke.transform());
        }
        self.state.strokes = strokes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stroke::{CompositeMode, PathStroke, VectorPath};
    use emath::pos2;
    use image::Rgba;

    fn dot_stroke(x: f32, y: f32, width: f32) -> Stroke {
        let mut path = VectorPath::new();
        path.move_to(pos2(x, y));
        path.line_to(pos2(x, y));
        Stroke::Path(PathStroke {
            color: Rgba([255, 0, 0, 255]),
            width,
            path,
            mode: CompositeMode::Normal,
            clip: Rect::from_min_max(pos2(-1000.0, -1000.0), pos2(1000.0, 1000.0)),
            transform: Affine2::IDENTITY,
        })
    }

    #[test]
    fn set_state_undo_rebuilds_to_match_incremental() {
        let mut layer = Layer::empty("Main", 64, 64);

        // local center-origin coords: dot near the middle
        let s1 = dot_stroke(0.0, 0.0, 8.0);
        let s2 = dot_stroke(10.0, -5.0, 6.0);

        let state1 = layer.add_stroke(s1);
        let after_one: Vec<u8> = layer.surface().as_raw().clone();
        let _state2 = layer.add_stroke(s2);

        // undo the second stroke: full rebuild must reproduce the
        // incremental surface exactly
        layer.set_state(&state1);
        assert_eq!(layer.surface().as_raw(), &after_one);
    }

    #[test]
    fn set_state_redo_is_incremental_and_identical() {
        let mut layer = Layer::empty("Main", 64, 64);
        let state0 = layer.state().clone();

        let s1 = dot_stroke(-12.0, 4.0, 10.0);
        let state1 = layer.add_stroke(s1);
        let drawn: Vec<u8> = layer.surface().as_raw().clone();

        layer.set_state(&state0);
        layer.set_state(&state1);
        assert_eq!(layer.surface().as_raw(), &drawn);
    }

    #[test]
    fn finalize_preview_identity_is_noop() {
        let mut layer = Layer::empty("Main", 16, 16);
        assert!(layer.finalize_preview().is_none());

        layer.preview_transform_by(Affine2::from_translation(emath::vec2(3.0, 0.0)));
        let state = layer.finalize_preview().expect("non-identity preview commits");
        assert_eq!(state.transform.translation(), emath::vec2(3.0, 0.0));
        assert!(layer.preview_transform().is_identity());
    }

    #[test]
    fn cancel_preview_resets_without_commit() {
        let mut layer = Layer::empty("Main", 16, 16);
        layer.preview_transform_by(Affine2::from_rotation_deg(45.0));
        layer.cancel_preview();
        assert!(layer.preview_transform().is_identity());
        assert!(layer.state().transform.is_identity());
    }

    #[test]
    fn resize_fit_stroke_grows_symmetrically() {
        let mut layer = Layer::empty("Main", 40, 40);
        // stroke sticking 10px out the right side (local frame spans ±20)
        let rect = Rect::from_min_max(pos2(0.0, 0.0), pos2(30.0, 10.0));
        layer.resize_fit_stroke(rect, 4.0);

        let (w, h) = layer.surface_size();
        // needs 30 + 2 = 32 > 20 on the right: dx = 12, both sides grow
        assert_eq!(w, 64);
        assert_eq!(h, 40);
    }

    #[test]
    fn resize_fit_stroke_ignores_fitting_rect() {
        let mut layer = Layer::empty("Main", 40, 40);
        layer.resize_fit_stroke(Rect::from_min_max(pos2(-10.0, -10.0), pos2(10.0, 10.0)), 4.0);
        assert_eq!(layer.surface_size(), (40, 40));

        // an empty running rect (no points recorded) never grows
        layer.resize_fit_stroke(Rect::NOTHING, 12.0);
        assert_eq!(layer.surface_size(), (40, 40));
    }

    #[test]
    fn draw_on_skips_hidden_and_transparent() {
        let mut layer = Layer::empty("Main", 16, 16);
        layer.add_stroke(dot_stroke(0.0, 0.0, 8.0));

        let mut state = layer.state().clone();
        state.visible = false;
        layer.set_state(&state);

        let mut target = RgbaImage::new(16, 16);
        layer.draw_on(&mut target);
        assert!(target.pixels().all(|p| p[3] == 0));

        state.visible = true;
        state.alpha = 0.0;
        layer.set_state(&state);
        layer.draw_on(&mut target);
        assert!(target.pixels().all(|p| p[3] == 0));
    }
}

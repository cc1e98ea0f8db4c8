// ============================================================================
// EDITOR — the layered compositor and all user-facing operations
// ============================================================================

use std::cell::Cell;

use ab_glyph::FontArc;
use emath::{Pos2, Rect, Vec2, pos2, vec2};
use image::{Rgba, RgbaImage};

use crate::document::{Document, LayerEntry};
use crate::geometry::{clamp_segment, grow_rect, line_rect, max_abs, min_abs, point_in_rect};
use crate::history::History;
use crate::io::{EncodeError, OutputFormat, encode_composite};
use crate::layer::Layer;
use crate::raster;
use crate::stroke::{CompositeMode, PathStroke, Stroke, TextStroke, VectorPath};
use crate::transform::Affine2;

/// Fraction of the viewport the canvas fills at the initial / reset fit.
const FIT_MARGIN: f32 = 0.95;

/// Transform gestures are rejected once the composed determinant would drop
/// below this, keeping every transform in the system invertible.
const MIN_DETERMINANT: f32 = 1e-4;

/// Exclusive interaction modes. Only one is active at a time; switching is
/// rejected while an interaction is in progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    None,
    Crop,
    Rotate,
    Move,
    Scale,
    Draw,
    Text,
    Erase,
    Select,
}

/// How the layer stack is combined into the composite. Selected explicitly
/// whenever the stack shape changes, instead of branching per operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CompositeStrategy {
    /// One layer: draw it straight into the composite, skip the caches.
    SingleLayer,
    /// Everything below the active layer pre-rendered into `bottom`,
    /// everything above into `top`; per-event work is the active layer only.
    Sandwich,
}

/// Viewport transform plus the lazily cached inverse of the full
/// canvas-to-screen mapping, invalidated whenever an input changes.
struct Viewport {
    width: u32,
    height: u32,
    /// Pan/zoom, pre-multiplied; operates in center-relative space.
    transform: Affine2,
    inverse: Cell<Option<Affine2>>,
}

impl Viewport {
    fn new(width: u32, height: u32) -> Self {
        Self { width, height, transform: Affine2::IDENTITY, inverse: Cell::new(None) }
    }

    fn invalidate(&self) {
        self.inverse.set(None);
    }

    fn fit_scale(&self, canvas_w: u32, canvas_h: u32) -> f32 {
        (self.width as f32 / canvas_w as f32 * FIT_MARGIN)
            .min(self.height as f32 / canvas_h as f32 * FIT_MARGIN)
    }

    /// Full canvas-to-screen mapping: the canvas center lands on the
    /// viewport center, transformed by pan/zoom.
    fn full_transform(&self, canvas_w: u32, canvas_h: u32) -> Affine2 {
        Affine2::from_translation(vec2(self.width as f32 / 2.0, self.height as f32 / 2.0))
            * self.transform
            * Affine2::from_translation(vec2(-(canvas_w as f32) / 2.0, -(canvas_h as f32) / 2.0))
    }

    fn inverse_transform(&self, canvas_w: u32, canvas_h: u32) -> Affine2 {
        if let Some(inv) = self.inverse.get() {
            return inv;
        }
        let inv = self
            .full_transform(canvas_w, canvas_h)
            .inverse()
            .expect("viewport scale is clamped, transform stays invertible");
        self.inverse.set(Some(inv));
        inv
    }
}

/// Transient per-gesture state. Not part of history.
struct InteractionCache {
    /// Canvas space → active-layer local space, captured at gesture start.
    layer_transform_inv: Affine2,
    /// The vector path being recorded, draw-time canvas coordinates.
    path: VectorPath,
    /// Last raw pointer position in canvas coordinates.
    last_point: Option<Pos2>,
    /// Where the live brush currently sits on the middle cache.
    anchor: Pos2,
    /// Running stroke bounds in layer-local coordinates.
    rect: Rect,
    /// Selection drag: origin and signed extent, canvas coordinates.
    sel_origin: Pos2,
    sel_size: Vec2,
    has_selection: bool,
    fixed_aspect: bool,
    width: f32,
    color: Rgba<u8>,
    mode: CompositeMode,
    text: String,
    text_size: f32,
    text_origin: Pos2,
    text_pending: bool,
}

impl Default for InteractionCache {
    fn default() -> Self {
        Self {
            layer_transform_inv: Affine2::IDENTITY,
            path: VectorPath::new(),
            last_point: None,
            anchor: pos2(0.0, 0.0),
            rect: Rect::NOTHING,
            sel_origin: pos2(0.0, 0.0),
            sel_size: vec2(0.0, 0.0),
            has_selection: false,
            fixed_aspect: false,
            width: 0.0,
            color: Rgba([0, 0, 0, 255]),
            mode: CompositeMode::Normal,
            text: String::new(),
            text_size: 0.0,
            text_origin: pos2(0.0, 0.0),
            text_pending: false,
        }
    }
}

/// The compositing engine: layer stack, viewport, sandwich caches, history,
/// and every user-facing operation. All methods are synchronous; the host
/// decodes gestures into these calls (screen coordinates in, the editor maps
/// them through the inverse viewport transform).
pub struct Editor {
    history: History<Document>,
    /// Live layers in z-order, bottom-most first, parallel to the current
    /// Document.
    live: Vec<Layer>,
    /// Layers removed from the stack, kept so undo can re-hydrate them
    /// without replaying their stroke logs.
    retired: Vec<Layer>,
    active: usize,
    canvas_w: u32,
    canvas_h: u32,
    mode: Mode,
    interacting: bool,
    viewport: Viewport,
    strategy: CompositeStrategy,
    bottom: RgbaImage,
    middle: RgbaImage,
    top: RgbaImage,
    composite: RgbaImage,
    cache: InteractionCache,
    font: Option<FontArc>,
}

impl Editor {
    /// Build an editor around an initial bitmap; the canvas takes the
    /// bitmap's dimensions and the viewport starts at the fit scale.
    pub fn new(bitmap: RgbaImage, viewport_width: u32, viewport_height: u32) -> Self {
        let (w, h) = bitmap.dimensions();
        let layer = Layer::from_image("Main", bitmap);
        let doc = Document { width: w, height: h, layers: vec![layer.entry()] };

        let mut viewport = Viewport::new(viewport_width.max(1), viewport_height.max(1));
        let fit = viewport.fit_scale(w, h);
        viewport.transform = Affine2::from_scale(fit, fit);

        let mut editor = Self {
            history: History::new(doc),
            live: vec![layer],
            retired: Vec::new(),
            active: 0,
            canvas_w: w,
            canvas_h: h,
            mode: Mode::None,
            interacting: false,
            viewport,
            strategy: CompositeStrategy::SingleLayer,
            bottom: RgbaImage::new(w, h),
            middle: RgbaImage::new(w, h),
            top: RgbaImage::new(w, h),
            composite: RgbaImage::new(w, h),
            cache: InteractionCache::default(),
            font: None,
        };
        editor.full_render();
        editor
    }

    // ---- read access --------------------------------------------------------

    pub fn layers(&self) -> &[LayerEntry] {
        &self.history.current().layers
    }

    pub fn active_layer_index(&self) -> usize {
        self.active
    }

    pub fn canvas_size(&self) -> (u32, u32) {
        (self.canvas_w, self.canvas_h)
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_interacting(&self) -> bool {
        self.interacting
    }

    pub fn viewport_transform(&self) -> Affine2 {
        self.viewport.transform
    }

    /// Committed transform of the active layer.
    pub fn layer_transform(&self) -> Affine2 {
        self.live[self.active].state().transform
    }

    /// Preview × committed of the active layer — what a transform gizmo
    /// reads back during a gesture.
    pub fn preview_layer_transform(&self) -> Affine2 {
        self.live[self.active].full_transform()
    }

    /// The current selection rectangle in canvas space, if any.
    pub fn selection_rect(&self) -> Option<Rect> {
        if !self.cache.has_selection {
            return None;
        }
        let a = self.cache.sel_origin;
        let b = a + self.cache.sel_size;
        Some(Rect::from_two_pos(a, b))
    }

    /// The fully composited canvas at full resolution.
    pub fn composite(&self) -> &RgbaImage {
        &self.composite
    }

    /// Encode the composite for the export collaborator.
    pub fn to_output_bitmap(&self, format: OutputFormat) -> Result<Vec<u8>, EncodeError> {
        encode_composite(&self.composite, format)
    }

    /// Render the composite into a viewport-sized frame through the viewport
    /// transform, over an optional background fill.
    pub fn render_viewport(&self, background: Option<Rgba<u8>>) -> RgbaImage {
        let mut frame = match background {
            Some(bg) => RgbaImage::from_pixel(self.viewport.width, self.viewport.height, bg),
            None => RgbaImage::new(self.viewport.width, self.viewport.height),
        };
        let full = self.viewport.full_transform(self.canvas_w, self.canvas_h);
        raster::transform_blit(&mut frame, &self.composite, full, 1.0, None);
        frame
    }

    // ---- mode machine -------------------------------------------------------

    /// Switch the exclusive interaction mode. Rejected while an interaction
    /// is in progress — the gesture must finish or be cancelled first.
    pub fn set_mode(&mut self, mode: Mode) -> bool {
        if self.interacting {
            log::warn!("mode switch to {mode:?} rejected: interaction in progress");
            return false;
        }
        self.mode = mode;
        true
    }

    // ---- viewport -----------------------------------------------------------

    pub fn set_viewport_size(&mut self, width: u32, height: u32) {
        self.viewport.width = width.max(1);
        self.viewport.height = height.max(1);
        self.viewport.invalidate();
    }

    pub fn pan_viewport_by(&mut self, delta: Vec2) {
        self.viewport.transform = Affine2::from_translation(delta) * self.viewport.transform;
        self.viewport.invalidate();
    }

    /// Zoom about an anchor given in normalized viewport coordinates
    /// (`(0.5, 0.5)` is the viewport center).
    pub fn scale_viewport_by(&mut self, ds: f32, anchor: Pos2) {
        // keep the accumulated scale well away from zero
        let current = self.viewport.transform.max_scale();
        let ds = ds.clamp(0.001 / current.max(0.001), 1000.0);

        let pivot = pos2(
            (anchor.x - 0.5) * self.viewport.width as f32,
            (anchor.y - 0.5) * self.viewport.height as f32,
        );
        self.viewport.transform =
            Affine2::from_scale_about(ds, ds, pivot) * self.viewport.transform;
        self.viewport.invalidate();
    }

    pub fn reset_viewport(&mut self) {
        let fit = self.viewport.fit_scale(self.canvas_w, self.canvas_h);
        self.viewport.transform = Affine2::from_scale(fit, fit);
        self.viewport.invalidate();
    }

    // ---- layer management ---------------------------------------------------

    /// Append a new layer on top of the stack and make it active. With no
    /// bitmap the layer starts transparent at canvas size.
    pub fn add_layer(&mut self, bitmap: Option<RgbaImage>) {
        let name = format!("Layer {}", self.live.len() - 1);
        let layer = match bitmap {
            Some(b) => Layer::from_image(name, b),
            None => Layer::empty(name, self.canvas_w, self.canvas_h),
        };
        self.live.push(layer);
        self.active = self.live.len() - 1;
        self.commit();
        self.full_render();
    }

    /// Remove a layer. Deleting the last remaining layer is a no-op.
    pub fn delete_layer(&mut self, index: usize) -> bool {
        if index >= self.live.len() || self.live.len() <= 1 {
            log::warn!("delete_layer({index}) ignored: {} layer(s)", self.live.len());
            return false;
        }
        let removed = self.live.remove(index);
        self.retired.push(removed);
        self.active = self.active.min(self.live.len() - 1);
        self.commit();
        self.full_render();
        true
    }

    pub fn toggle_layer_visibility(&mut self, index: usize) -> bool {
        let Some(layer) = self.live.get_mut(index) else {
            return false;
        };
        let mut state = layer.state().clone();
        state.visible = !state.visible;
        layer.set_state(&state);
        self.commit();
        self.full_render();
        true
    }

    /// Change a layer's opacity. With `commit` false this is a live slider
    /// preview: the layer redraws but history is untouched; the final value
    /// of the gesture is pushed with `commit` true.
    pub fn set_layer_alpha(&mut self, alpha: f32, index: usize, commit: bool) -> bool {
        let Some(layer) = self.live.get_mut(index) else {
            return false;
        };
        let alpha = alpha.clamp(0.0, 1.0);
        if layer.state().alpha == alpha && !commit {
            return false;
        }
        let mut state = layer.state().clone();
        state.alpha = alpha;
        layer.set_state(&state);
        if commit {
            self.commit();
        }
        self.full_render();
        true
    }

    /// Swap a layer with its neighbor (`delta` is +1 or -1). The active
    /// index follows the moved layer.
    pub fn move_layer(&mut self, delta: i32, index: usize) -> bool {
        let Some(target) = index.checked_add_signed(delta as isize) else {
            return false;
        };
        if index >= self.live.len() || target >= self.live.len() {
            return false;
        }
        self.live.swap(index, target);
        self.active = if target == self.active {
            index
        } else if index == self.active {
            target
        } else {
            self.active
        };
        self.commit();
        self.full_render();
        true
    }

    /// Clamp and set the active layer, rebuilding the sandwich caches.
    pub fn set_active_layer(&mut self, index: usize) {
        self.active = index.min(self.live.len() - 1);
        self.sandwich_layer();
        self.render();
    }

    // ---- transform previews -------------------------------------------------

    /// Pre-multiply a delta onto the active layer's preview transform
    /// (move/rotate/scale gestures). Rejected if the composed transform
    /// would become non-invertible.
    pub fn preview_layer_transform_by(&mut self, delta: Affine2) -> bool {
        let candidate = delta * self.live[self.active].full_transform();
        if candidate.determinant().abs() < MIN_DETERMINANT {
            log::warn!("transform preview rejected: determinant too small");
            return false;
        }
        self.interacting = true;
        self.live[self.active].preview_transform_by(delta);
        self.render();
        true
    }

    /// Replace the active layer's preview transform outright.
    pub fn preview_layer_transform_to(&mut self, m: Affine2) -> bool {
        let candidate = m * self.live[self.active].state().transform;
        if candidate.determinant().abs() < MIN_DETERMINANT {
            log::warn!("transform preview rejected: determinant too small");
            return false;
        }
        self.interacting = true;
        self.live[self.active].preview_transform_to(m);
        self.render();
        true
    }

    /// Compose the preview into the committed transform and push one history
    /// entry. An identity preview commits nothing.
    pub fn finalize_layer_preview(&mut self) -> bool {
        self.interacting = false;
        if self.live[self.active].finalize_preview().is_none() {
            return false;
        }
        self.commit();
        self.render();
        true
    }

    /// Cancel-key path: drop the in-progress transform without committing.
    pub fn cancel_layer_preview(&mut self) {
        self.interacting = false;
        self.live[self.active].cancel_preview();
        self.render();
    }

    // ---- whole-canvas transforms --------------------------------------------

    /// Mirror every layer about the canvas center, one history entry.
    pub fn flip(&mut self, horizontal: bool, vertical: bool) {
        if !horizontal && !vertical {
            return;
        }
        let t = Affine2::from_scale(
            if horizontal { -1.0 } else { 1.0 },
            if vertical { -1.0 } else { 1.0 },
        );
        for layer in &mut self.live {
            layer.preview_transform_by(t);
            layer.finalize_preview();
        }
        self.commit();
        self.full_render();
    }

    /// Rotate every layer 90° about the canvas center and swap the canvas
    /// dimensions, one history entry.
    pub fn rotate_quarter(&mut self, clockwise: bool) {
        let t = Affine2::from_rotation_deg(if clockwise { 90.0 } else { -90.0 });
        for layer in &mut self.live {
            layer.preview_transform_by(t);
            layer.finalize_preview();
        }
        let (w, h) = (self.canvas_h, self.canvas_w);
        self.resize_canvas(w, h);
        self.commit();
        self.full_render();
    }

    // ---- free-hand drawing --------------------------------------------------

    /// Begin a brush stroke at a screen-space point. The first dab lands
    /// immediately unless the point is outside the active clip region plus
    /// half the brush width (the out-of-bounds dead zone).
    pub fn start_drawing(
        &mut self,
        screen_point: Pos2,
        width: f32,
        color: Rgba<u8>,
        mode: CompositeMode,
    ) {
        self.interacting = true;
        self.prepare_middle();

        let p = self.canvas_from_screen(screen_point);
        let avail = self.active_clip_rect();
        let layer_full = Affine2::from_translation(vec2(
            self.canvas_w as f32 / 2.0,
            self.canvas_h as f32 / 2.0,
        )) * self.live[self.active].state().transform;
        let layer_inv = layer_full
            .inverse()
            .expect("layer transforms are kept invertible");

        let c = &mut self.cache;
        c.width = width;
        c.color = color;
        c.mode = mode;
        c.path = VectorPath::new();
        c.last_point = Some(p);
        c.layer_transform_inv = layer_inv;

        let padding = (width / 2.0).ceil();
        if !point_in_rect(p, avail, padding) {
            // dead zone: track the pointer, rasterize nothing until re-entry
            c.rect = Rect::NOTHING;
            return;
        }

        let raw = layer_inv.apply(p);
        c.rect = Rect::from_min_max(raw, raw);
        c.anchor = p;
        c.path.move_to(p);
        c.path.line_to(p);

        if self.live[self.active].state().visible {
            self.stamp_live(&[(p, None)], avail);
            self.render_with_middle();
        }
    }

    /// Extend the live stroke with a quadratic segment smoothed through the
    /// midpoint, clamped against the active clip region.
    pub fn curve_to(&mut self, screen_point: Pos2) {
        let Some(last) = self.cache.last_point else {
            return;
        };
        let to = self.canvas_from_screen(screen_point);
        let avail = self.active_clip_rect();
        let padding = (self.cache.width / 2.0).ceil();

        let oob = !point_in_rect(to, avail, padding);
        let prev_oob = !point_in_rect(last, avail, padding);

        if oob && !prev_oob {
            // leaving the region: close with a straight clamped segment
            self.extend_line(to, avail, padding);
            return;
        }
        if oob && prev_oob && line_rect(last, to, avail, padding).is_empty() {
            self.cache.last_point = Some(to);
            return;
        }

        let (clamped_from, clamped_to) = clamp_segment(last, to, avail, padding);
        if prev_oob {
            self.cache.path.move_to(clamped_from);
            self.cache.anchor = clamped_from;
        }
        let mid = pos2(
            (clamped_from.x + clamped_to.x) / 2.0,
            (clamped_from.y + clamped_to.y) / 2.0,
        );

        if self.live[self.active].state().visible {
            self.stamp_live(&[(mid, Some(clamped_from))], avail);
            self.render_with_middle();
        }

        let raw_mid = self.cache.layer_transform_inv.apply(mid);
        self.cache.rect = grow_rect(self.cache.rect, raw_mid);
        self.cache.path.quad_to(clamped_from, mid);
        self.cache.anchor = mid;
        self.cache.last_point = Some(to);
    }

    /// Extend the live stroke with a straight segment.
    pub fn line_to(&mut self, screen_point: Pos2) {
        let to = self.canvas_from_screen(screen_point);
        let avail = self.active_clip_rect();
        let padding = (self.cache.width / 2.0).ceil();
        self.extend_line(to, avail, padding);
    }

    fn extend_line(&mut self, to: Pos2, avail: Rect, padding: f32) {
        let Some(last) = self.cache.last_point else {
            return;
        };

        let oob = !point_in_rect(to, avail, padding);
        let prev_oob = !point_in_rect(last, avail, padding);
        if oob && prev_oob && line_rect(last, to, avail, padding).is_empty() {
            self.cache.last_point = Some(to);
            return;
        }

        let (clamped_from, clamped_to) = clamp_segment(last, to, avail, padding);
        if prev_oob {
            self.cache.path.move_to(clamped_from);
            self.cache.anchor = clamped_from;
        }

        if self.live[self.active].state().visible {
            self.stamp_live(&[(clamped_to, None)], avail);
            self.render_with_middle();
        }

        let raw_to = self.cache.layer_transform_inv.apply(clamped_to);
        self.cache.rect = grow_rect(self.cache.rect, raw_to);
        self.cache.path.line_to(clamped_to);
        self.cache.anchor = clamped_to;
        self.cache.last_point = Some(to);
    }

    /// Commit the accumulated path as a stroke: grow the layer surface to
    /// fit, rasterize, push one history entry. A gesture that never entered
    /// the clip region commits nothing.
    pub fn end_drawing(&mut self) {
        self.interacting = false;
        let avail = self.active_clip_rect();
        let path = std::mem::take(&mut self.cache.path);
        let rect = self.cache.rect;
        self.cache.last_point = None;
        self.cache.rect = Rect::NOTHING;

        raster::clear(&mut self.middle);
        if path.is_empty() {
            self.render();
            return;
        }

        self.live[self.active].resize_fit_stroke(rect, self.cache.width);
        let stroke = Stroke::Path(PathStroke {
            color: self.cache.color,
            width: self.cache.width,
            path,
            mode: self.cache.mode,
            clip: avail,
            transform: self.cache.layer_transform_inv,
        });
        self.live[self.active].add_stroke(stroke);
        self.commit();
        self.render();
    }

    // ---- region selection / crop --------------------------------------------

    /// Begin a selection drag; the origin is clamped into the canvas.
    pub fn start_region_select(&mut self, screen_point: Pos2, fixed_aspect: bool) {
        self.interacting = true;
        let p = self.clamp_to_canvas(self.canvas_from_screen(screen_point));
        self.cache.sel_origin = p;
        self.cache.sel_size = vec2(0.0, 0.0);
        self.cache.has_selection = true;
        self.cache.fixed_aspect = fixed_aspect;
    }

    /// Update the selection drag. In fixed-aspect mode the extent is
    /// re-derived from the canvas aspect ratio and re-clamped to stay inside
    /// the canvas, preserving drag direction signs throughout.
    pub fn region_select(&mut self, screen_point: Pos2) {
        if !self.cache.has_selection {
            return;
        }
        let to = self.clamp_to_canvas(self.canvas_from_screen(screen_point));
        let origin = self.cache.sel_origin;
        let mut w = to.x - origin.x;
        let mut h = to.y - origin.y;

        if self.cache.fixed_aspect {
            let aspect = self.canvas_w as f32 / self.canvas_h as f32;

            w = max_abs(w, sign_or_one(w) * h.abs() * aspect);
            h = max_abs(h, sign_or_one(h) * w.abs() / aspect);

            w = w.clamp(-origin.x, self.canvas_w as f32 - origin.x);
            h = h.clamp(-origin.y, self.canvas_h as f32 - origin.y);

            w = min_abs(w, sign_or_one(w) * h.abs() * aspect);
            h = min_abs(h, sign_or_one(h) * w.abs() / aspect);
        }

        self.cache.sel_size = vec2(w, h);
    }

    /// Finish the selection drag. A degenerate (sub-pixel) rectangle is
    /// discarded and treated as "no selection".
    pub fn end_region_select(&mut self) -> bool {
        self.interacting = false;
        if self.cache.sel_size.x.abs() < 1.0 || self.cache.sel_size.y.abs() < 1.0 {
            log::debug!("degenerate selection discarded");
            self.cache.has_selection = false;
            return false;
        }
        true
    }

    /// Clear any active selection without cropping.
    pub fn clear_selection(&mut self) {
        self.cache.has_selection = false;
    }

    /// Crop the canvas to the selection: every layer is translated so the
    /// selection center becomes the canvas center, the canvas takes the
    /// selection's dimensions, and one Document is committed. Content
    /// outside the new bounds is only visually discarded — undoing restores
    /// it from the stroke logs and transforms.
    pub fn crop_to_region(&mut self) -> bool {
        let Some(rect) = self.selection_rect() else {
            return false;
        };
        if rect.width() < 1.0 || rect.height() < 1.0 {
            self.cache.has_selection = false;
            return false;
        }

        let canvas_center = pos2(self.canvas_w as f32 / 2.0, self.canvas_h as f32 / 2.0);
        let t = Affine2::from_translation(canvas_center - rect.center());

        for layer in &mut self.live {
            let mut state = layer.state().clone();
            state.transform = t * state.transform;
            layer.set_state(&state);
        }
        self.resize_canvas(rect.width().round() as u32, rect.height().round() as u32);
        self.commit();
        self.cache.has_selection = false;
        self.full_render();
        true
    }

    // ---- text ---------------------------------------------------------------

    /// Provide the font used by subsequent text strokes. Text operations are
    /// inert until a font is set (the host owns font acquisition).
    pub fn set_text_font(&mut self, font: FontArc) {
        self.font = Some(font);
    }

    /// Anchor a text insertion at a screen-space point: the first line is
    /// vertically centered on it. Returns `false` without a font.
    pub fn insert_text_at(&mut self, screen_point: Pos2, size: f32, color: Rgba<u8>) -> bool {
        if self.font.is_none() {
            log::warn!("insert_text_at ignored: no font configured");
            return false;
        }
        self.interacting = true;
        self.prepare_middle();

        let p = self.canvas_from_screen(screen_point);
        let layer_full = Affine2::from_translation(vec2(
            self.canvas_w as f32 / 2.0,
            self.canvas_h as f32 / 2.0,
        )) * self.live[self.active].state().transform;

        let c = &mut self.cache;
        c.layer_transform_inv = layer_full
            .inverse()
            .expect("layer transforms are kept invertible");
        c.text.clear();
        c.text_size = size;
        c.color = color;
        c.text_origin = p;
        c.text_pending = true;
        true
    }

    /// Replace the pending text and refresh the live preview.
    pub fn update_text(&mut self, text: &str) {
        if !self.cache.text_pending {
            return;
        }
        self.cache.text = text.to_owned();
        self.prepare_middle();

        let Some(font) = self.font.clone() else {
            return;
        };
        if self.live[self.active].state().visible && !text.is_empty() {
            let avail = self.active_clip_rect();
            let preview = TextStroke {
                text: self.cache.text.clone(),
                font,
                size: self.cache.text_size,
                origin: self.cache.text_origin,
                color: self.cache.color,
                clip: avail,
                transform: Affine2::IDENTITY,
            };
            raster::draw_text_onto(&mut self.middle, &preview, Affine2::IDENTITY);
        }
        self.render_with_middle();
    }

    /// Commit the pending text as a stroke. Empty text commits nothing.
    pub fn finalize_text(&mut self) -> bool {
        self.interacting = false;
        self.cache.text_pending = false;
        raster::clear(&mut self.middle);

        let text = std::mem::take(&mut self.cache.text);
        let Some(font) = self.font.clone() else {
            self.render();
            return false;
        };
        if text.is_empty() {
            self.render();
            return false;
        }

        // surface growth uses the rendered bounds mapped into layer space
        let origin = self.cache.text_origin;
        let size = self.cache.text_size;
        let color = self.cache.color;
        if let Some((buf, off)) = raster::rasterize_text(&font, &text, size, origin, color) {
            let bounds = Rect::from_min_size(off, vec2(buf.width() as f32, buf.height() as f32));
            let local = map_rect(bounds, self.cache.layer_transform_inv);
            self.live[self.active].resize_fit_stroke(local, 0.0);
        }

        let stroke = Stroke::Text(TextStroke {
            text,
            font,
            size,
            origin,
            color,
            clip: self.active_clip_rect(),
            transform: self.cache.layer_transform_inv,
        });
        self.live[self.active].add_stroke(stroke);
        self.commit();
        self.render();
        true
    }

    // ---- history ------------------------------------------------------------

    pub fn undo(&mut self) -> bool {
        let (old_w, old_h) = (self.canvas_w, self.canvas_h);
        if !self.history.undo() {
            return false;
        }
        self.restore_current(old_w, old_h);
        true
    }

    pub fn redo(&mut self) -> bool {
        let (old_w, old_h) = (self.canvas_w, self.canvas_h);
        if !self.history.redo() {
            return false;
        }
        self.restore_current(old_w, old_h);
        true
    }

    // ---- internals ----------------------------------------------------------

    fn canvas_from_screen(&self, p: Pos2) -> Pos2 {
        self.viewport
            .inverse_transform(self.canvas_w, self.canvas_h)
            .apply(p)
    }

    fn clamp_to_canvas(&self, p: Pos2) -> Pos2 {
        pos2(
            p.x.clamp(0.0, self.canvas_w as f32),
            p.y.clamp(0.0, self.canvas_h as f32),
        )
    }

    fn canvas_rect(&self) -> Rect {
        Rect::from_min_max(
            pos2(0.0, 0.0),
            pos2(self.canvas_w as f32, self.canvas_h as f32),
        )
    }

    /// The crop/selection bounds if set, else the full canvas.
    fn active_clip_rect(&self) -> Rect {
        self.selection_rect().unwrap_or_else(|| self.canvas_rect())
    }

    /// Snapshot the live stack into a new Document and push it.
    fn commit(&mut self) {
        let doc = Document {
            width: self.canvas_w,
            height: self.canvas_h,
            layers: self.live.iter().map(Layer::entry).collect(),
        };
        self.history.push(doc);
        log::debug!(
            "committed document #{} ({} layers)",
            self.history.len(),
            self.live.len()
        );
    }

    fn resize_canvas(&mut self, width: u32, height: u32) {
        let (width, height) = (width.max(1), height.max(1));
        self.canvas_w = width;
        self.canvas_h = height;
        self.bottom = RgbaImage::new(width, height);
        self.middle = RgbaImage::new(width, height);
        self.top = RgbaImage::new(width, height);
        self.composite = RgbaImage::new(width, height);
        self.viewport.invalidate();
    }

    /// Rebuild the bottom/top caches around the active layer and pick the
    /// composition strategy for the current stack shape.
    fn sandwich_layer(&mut self) {
        self.strategy = if self.live.len() == 1 {
            CompositeStrategy::SingleLayer
        } else {
            CompositeStrategy::Sandwich
        };
        if self.strategy == CompositeStrategy::SingleLayer {
            return;
        }
        raster::clear(&mut self.bottom);
        raster::clear(&mut self.top);
        for layer in &self.live[..self.active] {
            layer.draw_on(&mut self.bottom);
        }
        for layer in &self.live[self.active + 1..] {
            layer.draw_on(&mut self.top);
        }
    }

    /// Recomposite using the cached sandwich: only the active layer is drawn
    /// fresh.
    fn render(&mut self) {
        raster::clear(&mut self.composite);
        match self.strategy {
            CompositeStrategy::SingleLayer => {
                self.live[self.active].draw_on(&mut self.composite);
            }
            CompositeStrategy::Sandwich => {
                if self.active > 0 {
                    raster::blit_over(&mut self.composite, &self.bottom, 1.0);
                }
                self.live[self.active].draw_on(&mut self.composite);
                if self.active + 1 < self.live.len() {
                    raster::blit_over(&mut self.composite, &self.top, 1.0);
                }
            }
        }
    }

    /// Like [`Self::render`] but the active layer comes from the middle
    /// cache (live gesture feedback), with the layer alpha applied here.
    fn render_with_middle(&mut self) {
        let alpha = self.live[self.active].state().alpha;
        raster::clear(&mut self.composite);
        if self.active > 0 {
            raster::blit_over(&mut self.composite, &self.bottom, 1.0);
        }
        raster::blit_over(&mut self.composite, &self.middle, alpha);
        if self.active + 1 < self.live.len() {
            raster::blit_over(&mut self.composite, &self.top, 1.0);
        }
    }

    fn full_render(&mut self) {
        self.sandwich_layer();
        self.render();
    }

    /// Draw the active layer opaque onto the cleared middle cache; its alpha
    /// is applied when the sandwich is recombined.
    fn prepare_middle(&mut self) {
        raster::clear(&mut self.middle);
        self.live[self.active].draw_on_with_alpha(&mut self.middle, 1.0);
    }

    /// Stamp live feedback onto the middle cache in canvas coordinates.
    /// Each element is `(to, Some(ctrl))` for a quadratic or `(to, None)`
    /// for a line from the current anchor.
    fn stamp_live(&mut self, segments: &[(Pos2, Option<Pos2>)], clip: Rect) {
        let mut path = VectorPath::new();
        path.move_to(self.cache.anchor);
        for &(to, ctrl) in segments {
            match ctrl {
                Some(ctrl) => path.quad_to(ctrl, to),
                None => path.line_to(to),
            }
        }
        let stroke = PathStroke {
            color: self.cache.color,
            width: self.cache.width,
            path,
            mode: self.cache.mode,
            clip,
            transform: Affine2::IDENTITY,
        };
        raster::stroke_path_onto(&mut self.middle, &stroke, Affine2::IDENTITY);
    }

    /// Re-hydrate the live stack from the current history snapshot.
    fn restore_current(&mut self, old_w: u32, old_h: u32) {
        let doc = self.history.current().clone();
        if doc.width != old_w || doc.height != old_h {
            self.resize_canvas(doc.width, doc.height);
            self.reset_viewport();
        }

        let mut pool: Vec<Layer> = self.live.drain(..).chain(self.retired.drain(..)).collect();
        let mut live = Vec::with_capacity(doc.layers.len());
        for entry in &doc.layers {
            let layer = match pool.iter().position(|l| l.id() == entry.id) {
                Some(i) => {
                    let mut layer = pool.swap_remove(i);
                    layer.set_state(&entry.state);
                    layer
                }
                None => {
                    // all session layers are retained, so this is unexpected
                    log::warn!("restoring layer {:?} from snapshot replay", entry.id);
                    Layer::from_entry(entry, doc.width, doc.height)
                }
            };
            live.push(layer);
        }
        self.retired = pool;
        self.live = live;
        self.active = self.active.min(self.live.len() - 1);
        self.full_render();
    }
}

/// `Math.sign(x) || 1`: drag-direction sign with zero treated as positive.
fn sign_or_one(x: f32) -> f32 {
    if x == 0.0 { 1.0 } else { x.signum() }
}

/// Axis-aligned bounds of a rect pushed through an affine transform.
fn map_rect(rect: Rect, m: Affine2) -> Rect {
    let mut out = Rect::NOTHING;
    for corner in [
        rect.min,
        pos2(rect.max.x, rect.min.y),
        pos2(rect.min.x, rect.max.y),
        rect.max,
    ] {
        out = grow_rect(out, m.apply(corner));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn editor_with_canvas(w: u32, h: u32) -> Editor {
        Editor::new(RgbaImage::from_pixel(w, h, Rgba([128, 128, 128, 255])), 800, 600)
    }

    /// Map a canvas-space point to the screen coordinates the gesture API
    /// expects.
    fn screen(editor: &Editor, canvas_point: Pos2) -> Pos2 {
        let (w, h) = editor.canvas_size();
        editor.viewport.full_transform(w, h).apply(canvas_point)
    }

    #[test]
    fn mode_switch_rejected_while_interacting() {
        let mut editor = editor_with_canvas(100, 100);
        assert!(editor.set_mode(Mode::Draw));

        editor.start_drawing(screen(&editor, pos2(50.0, 50.0)), 8.0, Rgba([0, 0, 0, 255]), CompositeMode::Normal);
        assert!(editor.is_interacting());
        assert!(!editor.set_mode(Mode::Crop));
        assert_eq!(editor.mode(), Mode::Draw);

        editor.end_drawing();
        assert!(editor.set_mode(Mode::Crop));
    }

    #[test]
    fn drawing_commits_one_history_entry() {
        let mut editor = editor_with_canvas(100, 100);
        assert!(!editor.can_undo());

        editor.start_drawing(screen(&editor, pos2(20.0, 20.0)), 6.0, Rgba([255, 0, 0, 255]), CompositeMode::Normal);
        editor.curve_to(screen(&editor, pos2(40.0, 30.0)));
        editor.curve_to(screen(&editor, pos2(60.0, 20.0)));
        editor.line_to(screen(&editor, pos2(70.0, 25.0)));
        editor.end_drawing();

        assert!(editor.can_undo());
        assert_eq!(editor.layers()[0].state.strokes.len(), 1);

        assert!(editor.undo());
        assert_eq!(editor.layers()[0].state.strokes.len(), 0);
        assert!(editor.redo());
        assert_eq!(editor.layers()[0].state.strokes.len(), 1);
    }

    #[test]
    fn fully_out_of_bounds_gesture_commits_nothing() {
        let mut editor = editor_with_canvas(100, 100);
        editor.start_drawing(screen(&editor, pos2(300.0, 300.0)), 6.0, Rgba([0, 0, 0, 255]), CompositeMode::Normal);
        editor.curve_to(screen(&editor, pos2(320.0, 340.0)));
        editor.end_drawing();

        assert!(!editor.can_undo());
        assert!(editor.layers()[0].state.strokes.is_empty());
    }

    #[test]
    fn delete_last_layer_is_noop() {
        let mut editor = editor_with_canvas(50, 50);
        assert!(!editor.delete_layer(0));
        assert_eq!(editor.layers().len(), 1);

        editor.add_layer(None);
        assert_eq!(editor.layers().len(), 2);
        assert!(editor.delete_layer(1));
        assert!(!editor.delete_layer(0));
    }

    #[test]
    fn alpha_preview_skips_history() {
        let mut editor = editor_with_canvas(50, 50);
        assert!(editor.set_layer_alpha(0.5, 0, false));
        assert!(!editor.can_undo());

        assert!(editor.set_layer_alpha(0.5, 0, true));
        assert!(editor.can_undo());
        assert_eq!(editor.layers()[0].state.alpha, 0.5);

        editor.undo();
        assert_eq!(editor.layers()[0].state.alpha, 1.0);
    }

    #[test]
    fn crop_recenters_selection() {
        let mut editor = editor_with_canvas(200, 200);
        editor.start_region_select(screen(&editor, pos2(50.0, 50.0)), false);
        editor.region_select(screen(&editor, pos2(150.0, 150.0)));
        assert!(editor.end_region_select());
        assert!(editor.crop_to_region());

        assert_eq!(editor.canvas_size(), (100, 100));
        // the selection was centered on the canvas, so no translation: the
        // old selection center (center-origin (0,0)) stays the canvas center
        let t = editor.layers()[0].state.transform;
        let moved = t.apply(pos2(0.0, 0.0));
        assert!(moved.x.abs() < 1e-2 && moved.y.abs() < 1e-2, "moved {moved:?}");

        // off-center crop moves layers by the recentering delta
        editor.undo();
        assert_eq!(editor.canvas_size(), (200, 200));
        editor.start_region_select(screen(&editor, pos2(120.0, 120.0)), false);
        editor.region_select(screen(&editor, pos2(180.0, 180.0)));
        editor.end_region_select();
        assert!(editor.crop_to_region());
        assert_eq!(editor.canvas_size(), (60, 60));
        let t = editor.layers()[0].state.transform.translation();
        assert!((t.x + 50.0).abs() < 1e-2 && (t.y + 50.0).abs() < 1e-2, "translation {t:?}");
    }

    #[test]
    fn degenerate_selection_is_discarded() {
        let mut editor = editor_with_canvas(100, 100);
        editor.start_region_select(screen(&editor, pos2(40.0, 40.0)), false);
        editor.region_select(screen(&editor, pos2(40.4, 90.0)));
        assert!(!editor.end_region_select());
        assert!(editor.selection_rect().is_none());
        assert!(!editor.crop_to_region());
        assert!(!editor.can_undo());
    }

    #[test]
    fn fixed_aspect_selection_follows_canvas_ratio() {
        let mut editor = editor_with_canvas(200, 100);
        editor.start_region_select(screen(&editor, pos2(10.0, 10.0)), true);
        editor.region_select(screen(&editor, pos2(50.0, 90.0)));
        let rect = editor.selection_rect().expect("selection active");
        let aspect = rect.width() / rect.height();
        assert!((aspect - 2.0).abs() < 1e-3, "aspect {aspect}");

        // stays inside the canvas even when the drag runs past it
        editor.region_select(screen(&editor, pos2(400.0, 400.0)));
        let rect = editor.selection_rect().unwrap();
        assert!(rect.max.x <= 200.001 && rect.max.y <= 100.001);
        let aspect = rect.width() / rect.height();
        assert!((aspect - 2.0).abs() < 1e-3, "aspect {aspect}");
    }

    #[test]
    fn flip_applies_to_all_layers_in_one_entry() {
        let mut editor = editor_with_canvas(80, 80);
        editor.add_layer(None);
        editor.add_layer(None);
        let depth_before = editor.history.len();

        editor.flip(true, false);
        assert_eq!(editor.history.len(), depth_before + 1);
        for entry in editor.layers() {
            assert_eq!(entry.state.transform.a, -1.0);
            assert_eq!(entry.state.transform.d, 1.0);
        }
    }

    #[test]
    fn rotate_swaps_canvas_dimensions() {
        let mut editor = editor_with_canvas(120, 80);
        editor.rotate_quarter(true);
        assert_eq!(editor.canvas_size(), (80, 120));

        editor.undo();
        assert_eq!(editor.canvas_size(), (120, 80));
        editor.redo();
        assert_eq!(editor.canvas_size(), (80, 120));
    }

    #[test]
    fn preview_transform_rejected_when_degenerate() {
        let mut editor = editor_with_canvas(50, 50);
        assert!(!editor.preview_layer_transform_by(Affine2::from_scale(0.0, 1.0)));
        assert!(editor.preview_layer_transform_by(Affine2::from_scale(2.0, 2.0)));
        assert!(editor.finalize_layer_preview());
    }

    #[test]
    fn cancel_preview_leaves_no_history() {
        let mut editor = editor_with_canvas(50, 50);
        editor.preview_layer_transform_by(Affine2::from_translation(vec2(10.0, 0.0)));
        assert!(editor.is_interacting());
        editor.cancel_layer_preview();
        assert!(!editor.is_interacting());
        assert!(!editor.can_undo());
        assert!(editor.layers()[0].state.transform.is_identity());

        // finalize with identity preview is equally silent
        assert!(!editor.finalize_layer_preview());
        assert!(!editor.can_undo());
    }

    #[test]
    fn move_layer_keeps_active_following() {
        let mut editor = editor_with_canvas(40, 40);
        editor.add_layer(None); // active = 1
        assert_eq!(editor.active_layer_index(), 1);

        assert!(editor.move_layer(-1, 1));
        assert_eq!(editor.active_layer_index(), 0);
        assert!(!editor.move_layer(-1, 0));
        assert!(editor.move_layer(1, 0));
        assert_eq!(editor.active_layer_index(), 1);
    }

    #[test]
    fn scale_viewport_keeps_anchor_point() {
        let mut editor = editor_with_canvas(100, 100);
        let before = editor.canvas_from_screen(pos2(400.0, 300.0));
        editor.scale_viewport_by(2.0, pos2(0.5, 0.5));
        let after = editor.canvas_from_screen(pos2(400.0, 300.0));
        assert!((before.x - after.x).abs() < 1e-3);
        assert!((before.y - after.y).abs() < 1e-3);
    }

    #[test]
    fn undo_restores_viewport_fit_on_dimension_change() {
        let mut editor = editor_with_canvas(100, 100);
        editor.pan_viewport_by(vec2(40.0, 0.0));
        editor.rotate_quarter(true);
        let rotated_scale = editor.viewport_transform().max_scale();
        assert!(rotated_scale > 0.0);

        editor.undo();
        // dimension change resets the fit, dropping the pan
        assert_eq!(editor.viewport_transform().translation(), vec2(0.0, 0.0));
    }
}

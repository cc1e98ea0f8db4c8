// ============================================================================
// RASTERIZATION — brush dabs, glyph rendering, affine blits, pixel blending
// ============================================================================
//
// Everything here is deterministic: replaying a stroke log from scratch takes
// the exact same code paths as drawing the strokes one at a time, so the two
// produce pixel-identical surfaces.

use ab_glyph::{Font, FontArc, Glyph, GlyphId, ScaleFont, point as glyph_point};
use emath::{Pos2, Rect, pos2};
use image::{Rgba, RgbaImage};
use rayon::prelude::*;

use crate::geometry::point_in_rect;
use crate::stroke::{CompositeMode, PathSegment, PathStroke, Stroke, TextStroke};
use crate::transform::Affine2;

/// Dab spacing along a segment, as a fraction of the dab radius.
const DAB_SPACING: f32 = 0.5;

/// Maximum number of line steps a quadratic segment is flattened into.
const MAX_QUAD_STEPS: usize = 64;

// ----------------------------------------------------------------------------
// pixel blending
// ----------------------------------------------------------------------------

/// Blend `top` onto `base` with the given composite mode, scaling the top
/// alpha by `opacity` (doubles as antialias coverage).
pub fn blend_pixel(base: Rgba<u8>, top: Rgba<u8>, mode: CompositeMode, opacity: f32) -> Rgba<u8> {
    // Fast path: fully transparent top pixel — nothing to blend
    if top[3] == 0 || opacity <= 0.0 {
        return base;
    }

    match mode {
        CompositeMode::Normal => {
            // Fast path: fully opaque top pixel at full opacity — overwrite
            if opacity >= 1.0 && top[3] == 255 {
                return top;
            }

            let ta = (top[3] as f32 / 255.0) * opacity.clamp(0.0, 1.0);
            let ba = base[3] as f32 / 255.0;
            let out_a = ta + ba * (1.0 - ta);
            if out_a <= 0.0 {
                return Rgba([0, 0, 0, 0]);
            }

            let blend = |t: u8, b: u8| {
                let t = t as f32 / 255.0;
                let b = b as f32 / 255.0;
                (((t * ta + b * ba * (1.0 - ta)) / out_a) * 255.0)
                    .round()
                    .clamp(0.0, 255.0) as u8
            };
            Rgba([
                blend(top[0], base[0]),
                blend(top[1], base[1]),
                blend(top[2], base[2]),
                (out_a * 255.0).round().clamp(0.0, 255.0) as u8,
            ])
        }
        CompositeMode::Erase => {
            // destination-out: keep color, knock out alpha
            let ta = (top[3] as f32 / 255.0) * opacity.clamp(0.0, 1.0);
            let a = (base[3] as f32 * (1.0 - ta)).round().clamp(0.0, 255.0) as u8;
            Rgba([base[0], base[1], base[2], a])
        }
    }
}

// ----------------------------------------------------------------------------
// clipping
// ----------------------------------------------------------------------------

/// Pixel-exact clip test for strokes: a surface pixel is kept iff its center,
/// pulled back into the stroke's draw-time frame, lies inside the clip rect.
/// A rect clip under a rotated transform is a parallelogram on the surface,
/// so the test runs in the source frame rather than on surface coordinates.
pub struct SurfaceClip {
    rect: Rect,
    surface_to_clip: Affine2,
}

impl SurfaceClip {
    pub fn new(rect: Rect, surface_to_clip: Affine2) -> Self {
        Self { rect, surface_to_clip }
    }

    #[inline]
    pub fn allows(&self, x: u32, y: u32) -> bool {
        let p = self.surface_to_clip.apply(pos2(x as f32 + 0.5, y as f32 + 0.5));
        point_in_rect(p, self.rect, 0.0)
    }
}

// ----------------------------------------------------------------------------
// brush strokes
// ----------------------------------------------------------------------------

/// Stamp one round, 1px-feathered dab. `center` and `radius` are in surface
/// pixels.
fn fill_dab(
    surface: &mut RgbaImage,
    center: Pos2,
    radius: f32,
    color: Rgba<u8>,
    mode: CompositeMode,
    clip: &SurfaceClip,
) {
    let (w, h) = surface.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let r = radius.max(0.5);

    let x0 = (center.x - r - 1.0).floor().max(0.0) as u32;
    let y0 = (center.y - r - 1.0).floor().max(0.0) as u32;
    let x1 = ((center.x + r + 1.0).ceil() as i64).clamp(0, w as i64 - 1) as u32;
    let y1 = ((center.y + r + 1.0).ceil() as i64).clamp(0, h as i64 - 1) as u32;
    if x0 > x1 || y0 > y1 {
        return;
    }

    for y in y0..=y1 {
        for x in x0..=x1 {
            let d = pos2(x as f32 + 0.5, y as f32 + 0.5).distance(center);
            let coverage = (r + 0.5 - d).clamp(0.0, 1.0);
            if coverage <= 0.0 || !clip.allows(x, y) {
                continue;
            }
            let px = surface.get_pixel_mut(x, y);
            *px = blend_pixel(*px, color, mode, coverage);
        }
    }
}

/// Stamp dabs along a straight segment in surface pixels. A zero-length
/// segment stamps a single dab (the round-cap dot at stroke start).
fn stamp_segment(
    surface: &mut RgbaImage,
    a: Pos2,
    b: Pos2,
    radius: f32,
    color: Rgba<u8>,
    mode: CompositeMode,
    clip: &SurfaceClip,
) {
    let len = a.distance(b);
    let spacing = (radius * DAB_SPACING).max(0.5);
    let steps = (len / spacing).ceil() as usize;
    for i in 0..=steps {
        let t = if steps == 0 { 0.0 } else { i as f32 / steps as f32 };
        fill_dab(surface, a + (b - a) * t, radius, color, mode, clip);
    }
}

/// Rasterize a brush stroke onto `surface`. `place` maps the stroke's
/// draw-time canvas coordinates into surface pixels (surface-center offset
/// composed with the stroke's stored layer-inverse transform).
pub fn stroke_path_onto(surface: &mut RgbaImage, stroke: &PathStroke, place: Affine2) {
    // Scale clamping guarantees invertibility; failure here is a bug, not a
    // runtime condition.
    let surface_to_clip = place.inverse().expect("stroke placement must be invertible");
    let clip = SurfaceClip::new(stroke.clip, surface_to_clip);
    let radius = (stroke.width * 0.5 * place.max_scale()).max(0.25);

    let mut cursor: Option<Pos2> = None;
    for seg in &stroke.path.segments {
        match *seg {
            PathSegment::MoveTo(p) => cursor = Some(p),
            PathSegment::LineTo(p) => {
                if let Some(a) = cursor {
                    stamp_segment(
                        surface,
                        place.apply(a),
                        place.apply(p),
                        radius,
                        stroke.color,
                        stroke.mode,
                        &clip,
                    );
                }
                cursor = Some(p);
            }
            PathSegment::QuadTo { ctrl, to } => {
                if let Some(a) = cursor {
                    let chord = a.distance(ctrl) + ctrl.distance(to);
                    let steps = ((chord / 3.0).ceil() as usize).clamp(2, MAX_QUAD_STEPS);
                    let mut prev = place.apply(a);
                    for i in 1..=steps {
                        let t = i as f32 / steps as f32;
                        let u = 1.0 - t;
                        let p = pos2(
                            u * u * a.x + 2.0 * u * t * ctrl.x + t * t * to.x,
                            u * u * a.y + 2.0 * u * t * ctrl.y + t * t * to.y,
                        );
                        let p = place.apply(p);
                        stamp_segment(surface, prev, p, radius, stroke.color, stroke.mode, &clip);
                        prev = p;
                    }
                }
                cursor = Some(to);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// text
// ----------------------------------------------------------------------------

/// Lay out and rasterize multiline text into a tight RGBA buffer.
///
/// `origin` is the left edge / vertical center of the first line; subsequent
/// lines stack by the font's line height, each drawn with a middle baseline.
/// Returns the buffer and its top-left position in the same frame as
/// `origin`, or `None` when nothing has visible outlines.
pub fn rasterize_text(
    font: &FontArc,
    text: &str,
    size: f32,
    origin: Pos2,
    color: Rgba<u8>,
) -> Option<(RgbaImage, Pos2)> {
    let scaled = font.as_scaled(size);
    let ascent = scaled.ascent();
    let descent = scaled.descent();
    let line_height = scaled.height();

    let mut glyphs: Vec<Glyph> = Vec::new();
    let mut y_center = origin.y;
    for line in text.split('\n') {
        let baseline = y_center + (ascent + descent) * 0.5;
        let mut cursor = origin.x;
        let mut prev: Option<GlyphId> = None;
        for ch in line.chars() {
            let id = font.glyph_id(ch);
            if let Some(p) = prev {
                cursor += scaled.kern(p, id);
            }
            glyphs.push(id.with_scale_and_position(size, glyph_point(cursor, baseline)));
            cursor += scaled.h_advance(id);
            prev = Some(id);
        }
        y_center += line_height;
    }

    let outlined: Vec<_> = glyphs
        .into_iter()
        .filter_map(|g| font.outline_glyph(g))
        .collect();

    let mut bounds = Rect::NOTHING;
    for og in &outlined {
        let b = og.px_bounds();
        bounds.extend_with(pos2(b.min.x, b.min.y));
        bounds.extend_with(pos2(b.max.x, b.max.y));
    }
    if !bounds.is_positive() {
        return None;
    }

    let off = pos2(bounds.min.x.floor(), bounds.min.y.floor());
    let buf_w = (bounds.max.x - off.x).ceil() as u32 + 1;
    let buf_h = (bounds.max.y - off.y).ceil() as u32 + 1;
    let mut buf = RgbaImage::new(buf_w, buf_h);

    for og in outlined {
        let b = og.px_bounds();
        let gx0 = (b.min.x - off.x) as i64;
        let gy0 = (b.min.y - off.y) as i64;
        og.draw(|x, y, coverage| {
            let bx = gx0 + x as i64;
            let by = gy0 + y as i64;
            if bx < 0 || by < 0 || bx >= buf_w as i64 || by >= buf_h as i64 {
                return;
            }
            let px = buf.get_pixel_mut(bx as u32, by as u32);
            *px = blend_pixel(*px, color, CompositeMode::Normal, coverage);
        });
    }

    Some((buf, off))
}

/// Rasterize a text stroke onto `surface` through `place` (draw-time canvas
/// coordinates to surface pixels), honoring the stroke's clip rect.
pub fn draw_text_onto(surface: &mut RgbaImage, stroke: &TextStroke, place: Affine2) {
    let Some((buf, off)) = rasterize_text(
        &stroke.font,
        &stroke.text,
        stroke.size,
        stroke.origin,
        stroke.color,
    ) else {
        return;
    };

    let surface_to_clip = place.inverse().expect("stroke placement must be invertible");
    let clip = SurfaceClip::new(stroke.clip, surface_to_clip);
    let m = place * Affine2::from_translation(off.to_vec2());
    transform_blit(surface, &buf, m, 1.0, Some(&clip));
}

/// Dispatch a stroke onto a surface. `place` already composes the
/// surface-center offset with the stroke's stored transform.
pub fn draw_stroke(surface: &mut RgbaImage, stroke: &Stroke, place: Affine2) {
    match stroke {
        Stroke::Path(s) => stroke_path_onto(surface, s, place),
        Stroke::Text(s) => draw_text_onto(surface, s, place),
    }
}

// ----------------------------------------------------------------------------
// blits
// ----------------------------------------------------------------------------

/// Composite `src` onto `dst` through the affine `m` (src pixels → dst
/// pixels) with bilinear sampling and source-over blending at `alpha`.
/// Destination rows run in parallel.
pub fn transform_blit(
    dst: &mut RgbaImage,
    src: &RgbaImage,
    m: Affine2,
    alpha: f32,
    clip: Option<&SurfaceClip>,
) {
    if alpha <= 0.0 || src.width() == 0 || src.height() == 0 {
        return;
    }
    let inv = m.inverse().expect("blit transform must be invertible");

    let (dw, dh) = dst.dimensions();
    let (sw, sh) = (src.width() as f32, src.height() as f32);

    // destination bounds of the transformed source rect
    let mut bb = Rect::NOTHING;
    for corner in [pos2(0.0, 0.0), pos2(sw, 0.0), pos2(0.0, sh), pos2(sw, sh)] {
        bb.extend_with(m.apply(corner));
    }
    let x0 = bb.min.x.floor().max(0.0) as usize;
    let y0 = bb.min.y.floor().max(0.0) as usize;
    let x1 = (bb.max.x.ceil() as i64).clamp(0, dw as i64) as usize;
    let y1 = (bb.max.y.ceil() as i64).clamp(0, dh as i64) as usize;
    if x0 >= x1 || y0 >= y1 {
        return;
    }

    let row_bytes = dw as usize * 4;
    dst.as_mut()
        .par_chunks_exact_mut(row_bytes)
        .enumerate()
        .skip(y0)
        .take(y1 - y0)
        .for_each(|(dy, row)| {
            for dx in x0..x1 {
                if let Some(clip) = clip {
                    if !clip.allows(dx as u32, dy as u32) {
                        continue;
                    }
                }
                let sp = inv.apply(pos2(dx as f32 + 0.5, dy as f32 + 0.5));
                // pixel-index space: center of pixel (i, j) is (i+0.5, j+0.5)
                let top = bilinear_sample(src, sp.x - 0.5, sp.y - 0.5);
                if top[3] == 0 {
                    continue;
                }
                let idx = dx * 4;
                let base = Rgba([row[idx], row[idx + 1], row[idx + 2], row[idx + 3]]);
                let out = blend_pixel(base, top, CompositeMode::Normal, alpha);
                row[idx..idx + 4].copy_from_slice(&out.0);
            }
        });
}

/// Same-size source-over overlay, used to recombine the sandwich caches.
pub fn blit_over(dst: &mut RgbaImage, src: &RgbaImage, alpha: f32) {
    debug_assert_eq!(dst.dimensions(), src.dimensions());
    if alpha <= 0.0 {
        return;
    }
    let row_bytes = dst.width() as usize * 4;
    if row_bytes == 0 {
        return;
    }
    dst.as_mut()
        .par_chunks_exact_mut(row_bytes)
        .zip(src.as_raw().par_chunks_exact(row_bytes))
        .for_each(|(drow, srow)| {
            for idx in (0..row_bytes).step_by(4) {
                if srow[idx + 3] == 0 {
                    continue;
                }
                let base = Rgba([drow[idx], drow[idx + 1], drow[idx + 2], drow[idx + 3]]);
                let top = Rgba([srow[idx], srow[idx + 1], srow[idx + 2], srow[idx + 3]]);
                let out = blend_pixel(base, top, CompositeMode::Normal, alpha);
                drow[idx..idx + 4].copy_from_slice(&out.0);
            }
        });
}

/// Bilinear interpolation sampling in pixel-index space; coordinates outside
/// the image sample as transparent.
fn bilinear_sample(img: &RgbaImage, x: f32, y: f32) -> Rgba<u8> {
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let (w, h) = (img.width() as i32, img.height() as i32);
    if x0 < -1 || y0 < -1 || x0 >= w || y0 >= h {
        return Rgba([0, 0, 0, 0]);
    }
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let sample = |sx: i32, sy: i32| -> [f32; 4] {
        if sx < 0 || sy < 0 || sx >= w || sy >= h {
            [0.0; 4]
        } else {
            let p = img.get_pixel(sx as u32, sy as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32, p[3] as f32]
        }
    };

    let tl = sample(x0, y0);
    let tr = sample(x0 + 1, y0);
    let bl = sample(x0, y0 + 1);
    let br = sample(x0 + 1, y0 + 1);

    let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;
    let mut out = [0u8; 4];
    for c in 0..4 {
        let top = lerp(tl[c], tr[c], fx);
        let bot = lerp(bl[c], br[c], fx);
        out[c] = lerp(top, bot, fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgba(out)
}

/// Clear an image to fully transparent.
pub fn clear(img: &mut RgbaImage) {
    img.as_mut().fill(0);
}

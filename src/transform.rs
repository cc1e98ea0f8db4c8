// ============================================================================
// AFFINE TRANSFORM — 2×3 matrix value type used by every other module
// ============================================================================

use emath::{Pos2, Vec2, pos2, vec2};

/// Determinants below this magnitude count as singular.
const SINGULAR_EPS: f32 = 1e-6;

/// Identity detection tolerates the error accumulated by composing and
/// inverting f32 matrices over a gesture.
const IDENTITY_EPS: f32 = 1e-4;

/// Returned by [`Affine2::inverse`] when the determinant is ~0.
///
/// Never expected at runtime: callers clamp scale factors away from zero
/// before composing, so hitting this is an invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("singular transform cannot be inverted")]
pub struct SingularTransformError;

/// A 2D affine transform (scale/rotate/skew/translate) as six coefficients:
///
/// ```text
/// | a  c  e |         x' = a·x + c·y + e
/// | b  d  f |         y' = b·x + d·y + f
/// ```
///
/// Immutable value type. `A * B` is the matrix product and applies `B` first;
/// pre-multiplying a delta `D` onto `M` is written `D * M`, which composes
/// the delta relative to the space `M` maps into. Viewport pan/zoom and
/// layer transform edits both compose this way.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Affine2 {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub e: f32,
    pub f: f32,
}

impl Default for Affine2 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Affine2 {
    pub const IDENTITY: Affine2 = Affine2 { a: 1.0, b: 0.0, c: 0.0, d: 1.0, e: 0.0, f: 0.0 };

    pub fn from_translation(t: Vec2) -> Self {
        Affine2 { e: t.x, f: t.y, ..Self::IDENTITY }
    }

    pub fn from_scale(sx: f32, sy: f32) -> Self {
        Affine2 { a: sx, d: sy, ..Self::IDENTITY }
    }

    /// Scale about `pivot` so the pivot point stays fixed.
    pub fn from_scale_about(sx: f32, sy: f32, pivot: Pos2) -> Self {
        Self::from_translation(pivot.to_vec2())
            * Self::from_scale(sx, sy)
            * Self::from_translation(-pivot.to_vec2())
    }

    /// Rotation about the origin. Positive angles rotate clockwise in the
    /// y-down raster convention.
    pub fn from_rotation_deg(degrees: f32) -> Self {
        let (sin, cos) = degrees.to_radians().sin_cos();
        Affine2 { a: cos, b: sin, c: -sin, d: cos, e: 0.0, f: 0.0 }
    }

    /// Rotation about `pivot`.
    pub fn from_rotation_about(degrees: f32, pivot: Pos2) -> Self {
        Self::from_translation(pivot.to_vec2())
            * Self::from_rotation_deg(degrees)
            * Self::from_translation(-pivot.to_vec2())
    }

    pub fn apply(&self, p: Pos2) -> Pos2 {
        pos2(
            self.a * p.x + self.c * p.y + self.e,
            self.b * p.x + self.d * p.y + self.f,
        )
    }

    /// Transform a direction (translation coefficients ignored).
    pub fn apply_vec(&self, v: Vec2) -> Vec2 {
        vec2(self.a * v.x + self.c * v.y, self.b * v.x + self.d * v.y)
    }

    pub fn determinant(&self) -> f32 {
        self.a * self.d - self.b * self.c
    }

    pub fn inverse(&self) -> Result<Affine2, SingularTransformError> {
        let det = self.determinant();
        if det.abs() < SINGULAR_EPS {
            return Err(SingularTransformError);
        }
        let inv = 1.0 / det;
        Ok(Affine2 {
            a: self.d * inv,
            b: -self.b * inv,
            c: -self.c * inv,
            d: self.a * inv,
            e: (self.c * self.f - self.d * self.e) * inv,
            f: (self.b * self.e - self.a * self.f) * inv,
        })
    }

    pub fn is_identity(&self) -> bool {
        (self.a - 1.0).abs() < IDENTITY_EPS
            && self.b.abs() < IDENTITY_EPS
            && self.c.abs() < IDENTITY_EPS
            && (self.d - 1.0).abs() < IDENTITY_EPS
            && self.e.abs() < IDENTITY_EPS
            && self.f.abs() < IDENTITY_EPS
    }

    /// Rotation component in degrees, rounded to 0.1° and normalized to
    /// `[0, 360)` for UI readback.
    pub fn angle_deg(&self) -> f32 {
        let angle = (self.b.atan2(self.a).to_degrees() * 10.0).round() / 10.0;
        (angle + 360.0) % 360.0
    }

    /// The larger of the two axis scale magnitudes. Uniform-scale UIs read a
    /// single number, so the dominant axis wins.
    pub fn max_scale(&self) -> f32 {
        self.a.hypot(self.b).max(self.c.hypot(self.d))
    }

    pub fn translation(&self) -> Vec2 {
        vec2(self.e, self.f)
    }
}

impl std::ops::Mul for Affine2 {
    type Output = Affine2;

    fn mul(self, rhs: Affine2) -> Affine2 {
        Affine2 {
            a: self.a * rhs.a + self.c * rhs.b,
            b: self.b * rhs.a + self.d * rhs.b,
            c: self.a * rhs.c + self.c * rhs.d,
            d: self.b * rhs.c + self.d * rhs.d,
            e: self.a * rhs.e + self.c * rhs.f + self.e,
            f: self.b * rhs.e + self.d * rhs.f + self.f,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_pos_eq(got: Pos2, want: Pos2) {
        assert!(
            (got.x - want.x).abs() < 1e-3 && (got.y - want.y).abs() < 1e-3,
            "got {got:?}, want {want:?}"
        );
    }

    #[test]
    fn translate_then_scale_composes_right_to_left() {
        let m = Affine2::from_scale(2.0, 2.0) * Affine2::from_translation(vec2(3.0, 0.0));
        // translation applied first, then scaled
        assert_pos_eq(m.apply(pos2(1.0, 1.0)), pos2(8.0, 2.0));
    }

    #[test]
    fn rotation_is_clockwise_in_raster_coords() {
        let m = Affine2::from_rotation_deg(90.0);
        // +x rotates onto +y (downwards on screen)
        assert_pos_eq(m.apply(pos2(1.0, 0.0)), pos2(0.0, 1.0));
    }

    #[test]
    fn scale_about_pivot_keeps_pivot_fixed() {
        let pivot = pos2(10.0, 20.0);
        let m = Affine2::from_scale_about(3.0, 3.0, pivot);
        assert_pos_eq(m.apply(pivot), pivot);
        assert_pos_eq(m.apply(pos2(11.0, 20.0)), pos2(13.0, 20.0));
    }

    #[test]
    fn inverse_round_trips() {
        let m = Affine2::from_rotation_deg(30.0)
            * Affine2::from_scale(2.0, 0.5)
            * Affine2::from_translation(vec2(5.0, -7.0));
        let inv = m.inverse().unwrap();
        let p = pos2(13.0, 42.0);
        assert_pos_eq(inv.apply(m.apply(p)), p);
        assert!((m * inv).is_identity());
    }

    #[test]
    fn zero_scale_is_singular() {
        assert_eq!(Affine2::from_scale(0.0, 1.0).inverse(), Err(SingularTransformError));
    }

    #[test]
    fn decompose_angle_and_scale() {
        let m = Affine2::from_rotation_deg(45.0) * Affine2::from_scale(2.0, 0.5);
        assert!((m.angle_deg() - 45.0).abs() < 0.11);
        assert!((m.max_scale() - 2.0).abs() < 1e-4);

        let neg = Affine2::from_rotation_deg(-90.0);
        assert!((neg.angle_deg() - 270.0).abs() < 0.11);
    }

    #[test]
    fn identity_checks() {
        assert!(Affine2::IDENTITY.is_identity());
        assert!(!Affine2::from_translation(vec2(0.1, 0.0)).is_identity());
        let t = Affine2::from_translation(vec2(4.0, 9.0));
        assert_eq!(t.translation(), vec2(4.0, 9.0));
    }
}

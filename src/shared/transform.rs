//! 2D affine transforms accumulated along the item tree.

use super::geometry::{PointF, RectF};

/// Affine transform mapping `(x, y)` to
/// `(m11 * x + m21 * y + dx, m12 * x + m22 * y + dy)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub m11: f64,
    pub m12: f64,
    pub m21: f64,
    pub m22: f64,
    pub dx: f64,
    pub dy: f64,
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    pub const fn identity() -> Self {
        Self {
            m11: 1.0,
            m12: 0.0,
            m21: 0.0,
            m22: 1.0,
            dx: 0.0,
            dy: 0.0,
        }
    }

    pub fn translation(dx: f64, dy: f64) -> Self {
        Self {
            dx,
            dy,
            ..Self::identity()
        }
    }

    pub fn scaling(sx: f64, sy: f64) -> Self {
        Self {
            m11: sx,
            m22: sy,
            ..Self::identity()
        }
    }

    /// Clockwise rotation in screen space (y axis pointing down)
    pub fn rotation(degrees: f64) -> Self {
        let (sin, cos) = degrees.to_radians().sin_cos();
        Self {
            m11: cos,
            m12: sin,
            m21: -sin,
            m22: cos,
            dx: 0.0,
            dy: 0.0,
        }
    }

    /// Orthographic projection from a `width` x `height` device space with a
    /// top-left origin into normalized device coordinates
    pub fn ortho(width: f64, height: f64) -> Self {
        Self {
            m11: 2.0 / width,
            m12: 0.0,
            m21: 0.0,
            m22: -2.0 / height,
            dx: -1.0,
            dy: 1.0,
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }

    /// True when the transform only moves points
    pub fn is_translation(&self) -> bool {
        self.m11 == 1.0 && self.m22 == 1.0 && self.m12 == 0.0 && self.m21 == 0.0
    }

    /// Translation component, exact for pure translations
    pub fn offset(&self) -> PointF {
        PointF::new(self.dx, self.dy)
    }

    pub fn map(&self, p: PointF) -> PointF {
        PointF::new(
            self.m11 * p.x + self.m21 * p.y + self.dx,
            self.m12 * p.x + self.m22 * p.y + self.dy,
        )
    }

    /// Bounding rectangle of the mapped corners
    pub fn map_rect(&self, r: &RectF) -> RectF {
        let corners = [
            self.map(PointF::new(r.left(), r.top())),
            self.map(PointF::new(r.right(), r.top())),
            self.map(PointF::new(r.right(), r.bottom())),
            self.map(PointF::new(r.left(), r.bottom())),
        ];
        let mut min_x = f64::MAX;
        let mut min_y = f64::MAX;
        let mut max_x = f64::MIN;
        let mut max_y = f64::MIN;
        for c in corners {
            min_x = min_x.min(c.x);
            min_y = min_y.min(c.y);
            max_x = max_x.max(c.x);
            max_y = max_y.max(c.y);
        }
        RectF::new(min_x, min_y, max_x - min_x, max_y - min_y)
    }

    pub fn determinant(&self) -> f64 {
        self.m11 * self.m22 - self.m21 * self.m12
    }

    pub fn inverted(&self) -> Option<Transform> {
        let det = self.determinant();
        if det.abs() < f64::EPSILON {
            return None;
        }
        let m11 = self.m22 / det;
        let m21 = -self.m21 / det;
        let m12 = -self.m12 / det;
        let m22 = self.m11 / det;
        Some(Transform {
            m11,
            m12,
            m21,
            m22,
            dx: -(m11 * self.dx + m21 * self.dy),
            dy: -(m12 * self.dx + m22 * self.dy),
        })
    }

    /// Column-major 4x4 matrix for shader uniforms
    pub fn to_gl_matrix(&self) -> [f32; 16] {
        [
            self.m11 as f32, self.m12 as f32, 0.0, 0.0,
            self.m21 as f32, self.m22 as f32, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            self.dx as f32, self.dy as f32, 0.0, 1.0,
        ]
    }
}

/// `(a * b).map(p) == a.map(b.map(p))`
impl std::ops::Mul for Transform {
    type Output = Transform;

    fn mul(self, b: Transform) -> Transform {
        let a = self;
        Transform {
            m11: a.m11 * b.m11 + a.m21 * b.m12,
            m12: a.m12 * b.m11 + a.m22 * b.m12,
            m21: a.m11 * b.m21 + a.m21 * b.m22,
            m22: a.m12 * b.m21 + a.m22 * b.m22,
            dx: a.m11 * b.dx + a.m21 * b.dy + a.dx,
            dy: a.m12 * b.dx + a.m22 * b.dy + a.dy,
        }
    }
}

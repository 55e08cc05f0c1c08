//! Window quads: textured rectangles in window-local coordinates.
//!
//! Vertices are stored clockwise starting at the top-left corner.

use crate::shared::geometry::{PointF, RectF};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuadKind {
    Contents,
    Decoration,
    Shadow,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WindowVertex {
    pub x: f64,
    pub y: f64,
    /// Texture coordinate, pixel-space or normalized depending on the node
    pub u: f64,
    pub v: f64,
}

impl WindowVertex {
    pub const fn new(x: f64, y: f64, u: f64, v: f64) -> Self {
        Self { x, y, u, v }
    }

    pub fn position(&self) -> PointF {
        PointF::new(self.x, self.y)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowQuad {
    pub kind: QuadKind,
    /// Surface index for content quads (depth-first visit order)
    pub id: i32,
    pub verts: [WindowVertex; 4],
    /// Texture axes swapped (vertical decoration parts)
    pub uv_swapped: bool,
}

impl WindowQuad {
    pub fn new(kind: QuadKind, id: i32, verts: [WindowVertex; 4]) -> Self {
        Self {
            kind,
            id,
            verts,
            uv_swapped: false,
        }
    }

    /// Axis-aligned quad with texture coordinates spanning `(u0, v0)..(u1, v1)`
    pub fn from_rect(kind: QuadKind, id: i32, rect: RectF, uv: RectF) -> Self {
        Self::new(
            kind,
            id,
            [
                WindowVertex::new(rect.left(), rect.top(), uv.left(), uv.top()),
                WindowVertex::new(rect.right(), rect.top(), uv.right(), uv.top()),
                WindowVertex::new(rect.right(), rect.bottom(), uv.right(), uv.bottom()),
                WindowVertex::new(rect.left(), rect.bottom(), uv.left(), uv.bottom()),
            ],
        )
    }

    pub fn left(&self) -> f64 {
        self.verts.iter().map(|v| v.x).fold(f64::MAX, f64::min)
    }

    pub fn right(&self) -> f64 {
        self.verts.iter().map(|v| v.x).fold(f64::MIN, f64::max)
    }

    pub fn top(&self) -> f64 {
        self.verts.iter().map(|v| v.y).fold(f64::MAX, f64::min)
    }

    pub fn bottom(&self) -> f64 {
        self.verts.iter().map(|v| v.y).fold(f64::MIN, f64::max)
    }

    pub fn bounds(&self) -> RectF {
        RectF::from_points(
            PointF::new(self.left(), self.top()),
            PointF::new(self.right(), self.bottom()),
        )
    }

    pub fn translated(&self, dx: f64, dy: f64) -> WindowQuad {
        let mut q = self.clone();
        for v in &mut q.verts {
            v.x += dx;
            v.y += dy;
        }
        q
    }

    /// Part of this quad covering `(x1, y1)..(x2, y2)`, texture coordinates
    /// interpolated linearly. The range must lie within the quad.
    pub fn make_sub_quad(&self, x1: f64, y1: f64, x2: f64, y2: f64) -> WindowQuad {
        debug_assert!(x1 < x2 && y1 < y2);
        debug_assert!(x1 >= self.left() && x2 <= self.right());
        debug_assert!(y1 >= self.top() && y2 <= self.bottom());

        let mut ret = self.clone();
        ret.verts[0].x = x1;
        ret.verts[3].x = x1;
        ret.verts[1].x = x2;
        ret.verts[2].x = x2;
        ret.verts[0].y = y1;
        ret.verts[1].y = y1;
        ret.verts[2].y = y2;
        ret.verts[3].y = y2;

        let my_u0 = self.verts[0].u;
        let my_u1 = self.verts[2].u;
        let my_v0 = self.verts[0].v;
        let my_v1 = self.verts[2].v;

        let width = self.right() - self.left();
        let height = self.bottom() - self.top();
        let tex_width = my_u1 - my_u0;
        let tex_height = my_v1 - my_v0;

        if !self.uv_swapped {
            let u0 = (x1 - self.left()) / width * tex_width + my_u0;
            let u1 = (x2 - self.left()) / width * tex_width + my_u0;
            let v0 = (y1 - self.top()) / height * tex_height + my_v0;
            let v1 = (y2 - self.top()) / height * tex_height + my_v0;
            ret.verts[0].u = u0;
            ret.verts[3].u = u0;
            ret.verts[1].u = u1;
            ret.verts[2].u = u1;
            ret.verts[0].v = v0;
            ret.verts[1].v = v0;
            ret.verts[2].v = v1;
            ret.verts[3].v = v1;
        } else {
            let u0 = (y1 - self.top()) / height * tex_width + my_u0;
            let u1 = (y2 - self.top()) / height * tex_width + my_u0;
            let v0 = (x1 - self.left()) / width * tex_height + my_v0;
            let v1 = (x2 - self.left()) / width * tex_height + my_v0;
            ret.verts[0].u = u0;
            ret.verts[1].u = u0;
            ret.verts[2].u = u1;
            ret.verts[3].u = u1;
            ret.verts[0].v = v0;
            ret.verts[3].v = v0;
            ret.verts[1].v = v1;
            ret.verts[2].v = v1;
        }
        ret
    }
}

/// Ordered list of quads
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowQuadList(pub Vec<WindowQuad>);

impl WindowQuadList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, quad: WindowQuad) {
        self.0.push(quad);
    }

    pub fn extend(&mut self, other: WindowQuadList) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, WindowQuad> {
        self.0.iter()
    }

    pub fn select(&self, kind: QuadKind) -> WindowQuadList {
        WindowQuadList(self.0.iter().filter(|q| q.kind == kind).cloned().collect())
    }

    pub fn filter_out(&self, kind: QuadKind) -> WindowQuadList {
        WindowQuadList(self.0.iter().filter(|q| q.kind != kind).cloned().collect())
    }

    /// Split quads so none is larger than `max_size` in either direction.
    /// Effects that deform windows use this to get enough vertices.
    pub fn make_grid(&self, max_size: f64) -> WindowQuadList {
        let Some(first) = self.0.first() else {
            return self.clone();
        };
        let (mut left, mut top) = (first.left(), first.top());
        for q in &self.0 {
            left = left.min(q.left());
            top = top.min(q.top());
        }

        let mut ret = WindowQuadList::new();
        for q in &self.0 {
            let (ql, qt, qr, qb) = (q.left(), q.top(), q.right(), q.bottom());
            if ql == qr || qt == qb {
                ret.push(q.clone());
                continue;
            }
            let x_begin = left + ((ql - left) / max_size).floor() * max_size;
            let y_begin = top + ((qt - top) / max_size).floor() * max_size;
            let mut y = y_begin;
            while y < qb {
                let y0 = y.max(qt);
                let y1 = qb.min(y + max_size);
                let mut x = x_begin;
                while x < qr {
                    let x0 = x.max(ql);
                    let x1 = qr.min(x + max_size);
                    ret.push(q.make_sub_quad(x0, y0, x1, y1));
                    x += max_size;
                }
                y += max_size;
            }
        }
        ret
    }
}

impl IntoIterator for WindowQuadList {
    type Item = WindowQuad;
    type IntoIter = std::vec::IntoIter<WindowQuad>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a WindowQuadList {
    type Item = &'a WindowQuad;
    type IntoIter = std::slice::Iter<'a, WindowQuad>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<WindowQuad> for WindowQuadList {
    fn from_iter<I: IntoIterator<Item = WindowQuad>>(iter: I) -> Self {
        WindowQuadList(iter.into_iter().collect())
    }
}

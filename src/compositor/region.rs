//! Damage and clip regions
//!
//! A `Region` is a set of disjoint rectangles. Every operation keeps the
//! rectangles non-overlapping; equality compares covered area, not the
//! decomposition.

use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Sub, SubAssign};

use crate::shared::geometry::{Point, Rect};

/// Rectangle used for "no clipping". Large enough to cover any device space
/// while leaving room for translation without overflow.
const INFINITE_RECT: Rect = Rect::new(i32::MIN / 2, i32::MIN / 2, i32::MAX, i32::MAX);

#[derive(Debug, Clone, Default)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rect(rect: Rect) -> Self {
        if rect.is_empty() {
            return Self::default();
        }
        Self { rects: vec![rect] }
    }

    pub fn from_rects<I: IntoIterator<Item = Rect>>(rects: I) -> Self {
        let mut region = Self::default();
        for r in rects {
            region.add_rect(r);
        }
        region
    }

    /// Region meaning "everything"
    pub fn infinite() -> Self {
        Self::from_rect(INFINITE_RECT)
    }

    pub fn is_infinite(&self) -> bool {
        self.rects.len() == 1 && self.rects[0] == INFINITE_RECT
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rect> {
        self.rects.iter()
    }

    pub fn rect_count(&self) -> usize {
        self.rects.len()
    }

    /// Covered pixel count
    pub fn area(&self) -> i64 {
        self.rects.iter().map(Rect::area).sum()
    }

    pub fn bounding_rect(&self) -> Rect {
        self.rects
            .iter()
            .fold(Rect::default(), |acc, r| acc.united(r))
    }

    pub fn contains_point(&self, p: Point) -> bool {
        self.rects.iter().any(|r| r.contains_point(p))
    }

    /// True when `rect` is completely covered
    pub fn contains_rect(&self, rect: &Rect) -> bool {
        if rect.is_empty() {
            return true;
        }
        let mut rest = vec![*rect];
        for clip in &self.rects {
            rest = rest.iter().flat_map(|r| subtract_rect(r, clip)).collect();
            if rest.is_empty() {
                return true;
            }
        }
        false
    }

    pub fn intersects_rect(&self, rect: &Rect) -> bool {
        self.rects.iter().any(|r| r.intersects(rect))
    }

    pub fn intersects(&self, other: &Region) -> bool {
        other.rects.iter().any(|r| self.intersects_rect(r))
    }

    pub fn translated(&self, dx: i32, dy: i32) -> Region {
        if self.is_infinite() {
            return self.clone();
        }
        Region {
            rects: self.rects.iter().map(|r| r.translated(dx, dy)).collect(),
        }
    }

    pub fn translate(&mut self, dx: i32, dy: i32) {
        *self = self.translated(dx, dy);
    }

    /// Scale every rectangle, rounding outwards
    pub fn scaled(&self, factor: f64) -> Region {
        if self.is_infinite() || factor == 1.0 {
            return self.clone();
        }
        Region::from_rects(self.rects.iter().map(|r| r.scaled(factor)))
    }

    fn add_rect(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        let mut pieces = vec![rect];
        for existing in &self.rects {
            pieces = pieces.iter().flat_map(|p| subtract_rect(p, existing)).collect();
            if pieces.is_empty() {
                return;
            }
        }
        self.rects.extend(pieces);
        self.coalesce();
    }

    fn subtract_rect(&mut self, rect: &Rect) {
        if rect.is_empty() || !self.intersects_rect(rect) {
            return;
        }
        self.rects = self.rects.iter().flat_map(|r| subtract_rect(r, rect)).collect();
        self.coalesce();
    }

    fn intersect_rect(&self, rect: &Rect) -> Region {
        let rects = self
            .rects
            .iter()
            .map(|r| r.intersected(rect))
            .filter(|r| !r.is_empty())
            .collect();
        let mut region = Region { rects };
        region.coalesce();
        region
    }

    /// Merge neighbours sharing a full edge: column runs first, then row runs
    fn coalesce(&mut self) {
        self.rects.sort_by_key(|r| (r.x, r.width, r.y));
        merge_runs(&mut self.rects);
        self.rects.sort_by_key(|r| (r.y, r.height, r.x));
        merge_runs(&mut self.rects);
        self.rects.sort_by_key(|r| (r.y, r.x));
    }
}

/// Fold every rect into its predecessor when the two form a rectangle
fn merge_runs(rects: &mut Vec<Rect>) {
    rects.dedup_by(|next, prev| match merge_adjacent(prev, next) {
        Some(merged) => {
            *prev = merged;
            true
        }
        None => false,
    });
}

fn merge_adjacent(a: &Rect, b: &Rect) -> Option<Rect> {
    if a.x == b.x && a.width == b.width {
        if a.bottom() == b.top() {
            return Some(Rect::new(a.x, a.y, a.width, a.height + b.height));
        }
        if b.bottom() == a.top() {
            return Some(Rect::new(a.x, b.y, a.width, a.height + b.height));
        }
    }
    if a.y == b.y && a.height == b.height {
        if a.right() == b.left() {
            return Some(Rect::new(a.x, a.y, a.width + b.width, a.height));
        }
        if b.right() == a.left() {
            return Some(Rect::new(b.x, a.y, a.width + b.width, a.height));
        }
    }
    None
}

/// `r - s` as up to four disjoint rectangles
fn subtract_rect(r: &Rect, s: &Rect) -> Vec<Rect> {
    let i = r.intersected(s);
    if i.is_empty() {
        return vec![*r];
    }
    let candidates = [
        Rect::new(r.x, r.y, r.width, i.top() - r.top()),
        Rect::new(r.x, i.bottom(), r.width, r.bottom() - i.bottom()),
        Rect::new(r.x, i.y, i.left() - r.left(), i.height),
        Rect::new(i.right(), i.y, r.right() - i.right(), i.height),
    ];
    candidates.into_iter().filter(|c| !c.is_empty()).collect()
}

impl PartialEq for Region {
    fn eq(&self, other: &Region) -> bool {
        if self.rects == other.rects {
            return true;
        }
        self.area() == other.area() && (self - other).is_empty() && (other - self).is_empty()
    }
}

impl Eq for Region {}

impl From<Rect> for Region {
    fn from(rect: Rect) -> Self {
        Region::from_rect(rect)
    }
}

impl FromIterator<Rect> for Region {
    fn from_iter<I: IntoIterator<Item = Rect>>(iter: I) -> Self {
        Region::from_rects(iter)
    }
}

impl BitOr<&Region> for &Region {
    type Output = Region;

    fn bitor(self, rhs: &Region) -> Region {
        let mut out = self.clone();
        out |= rhs;
        out
    }
}

impl BitOrAssign<&Region> for Region {
    fn bitor_assign(&mut self, rhs: &Region) {
        if rhs.is_empty() || self.is_infinite() {
            return;
        }
        if self.is_empty() || rhs.is_infinite() {
            *self = rhs.clone();
            return;
        }
        for r in &rhs.rects {
            self.add_rect(*r);
        }
    }
}

impl BitOrAssign<Rect> for Region {
    fn bitor_assign(&mut self, rhs: Rect) {
        if rhs == INFINITE_RECT {
            *self = Region::infinite();
        } else if !self.is_infinite() {
            self.add_rect(rhs);
        }
    }
}

impl BitAnd<&Region> for &Region {
    type Output = Region;

    fn bitand(self, rhs: &Region) -> Region {
        if rhs.is_infinite() {
            return self.clone();
        }
        if self.is_infinite() {
            return rhs.clone();
        }
        // Both operands are disjoint, so pairwise intersections are too
        let mut out = Region::new();
        for r in &rhs.rects {
            out.rects.extend(self.intersect_rect(r).rects);
        }
        out.coalesce();
        out
    }
}

impl BitAnd<&Rect> for &Region {
    type Output = Region;

    fn bitand(self, rhs: &Rect) -> Region {
        self.intersect_rect(rhs)
    }
}

impl BitAndAssign<&Region> for Region {
    fn bitand_assign(&mut self, rhs: &Region) {
        *self = &*self & rhs;
    }
}

impl BitAndAssign<Rect> for Region {
    fn bitand_assign(&mut self, rhs: Rect) {
        *self = self.intersect_rect(&rhs);
    }
}

impl Sub<&Region> for &Region {
    type Output = Region;

    fn sub(self, rhs: &Region) -> Region {
        let mut out = self.clone();
        out -= rhs;
        out
    }
}

impl SubAssign<&Region> for Region {
    fn sub_assign(&mut self, rhs: &Region) {
        if rhs.is_infinite() {
            self.rects.clear();
            return;
        }
        for r in &rhs.rects {
            if self.is_empty() {
                break;
            }
            self.subtract_rect(r);
        }
    }
}

impl SubAssign<Rect> for Region {
    fn sub_assign(&mut self, rhs: Rect) {
        self.subtract_rect(&rhs);
    }
}

macro_rules! forward_owned {
    ($tr:ident, $method:ident) => {
        impl $tr<Region> for Region {
            type Output = Region;

            fn $method(self, rhs: Region) -> Region {
                (&self).$method(&rhs)
            }
        }

        impl $tr<&Region> for Region {
            type Output = Region;

            fn $method(self, rhs: &Region) -> Region {
                (&self).$method(rhs)
            }
        }
    };
}

forward_owned!(BitOr, bitor);
forward_owned!(BitAnd, bitand);
forward_owned!(Sub, sub);

#[cfg(test)]
mod tests {
    use super::*;

    fn r(x: i32, y: i32, w: i32, h: i32) -> Rect {
        Rect::new(x, y, w, h)
    }

    #[test]
    fn test_union_keeps_rects_disjoint() {
        let a = Region::from(r(0, 0, 100, 100));
        let b = Region::from(r(50, 50, 100, 100));
        let u = &a | &b;
        assert_eq!(u.area(), 100 * 100 * 2 - 50 * 50);
        for (i, x) in u.rects().iter().enumerate() {
            for y in &u.rects()[i + 1..] {
                assert!(!x.intersects(y));
            }
        }
    }

    #[test]
    fn test_difference_and_subtrahend_are_disjoint() {
        let a = Region::from_rects([r(0, 0, 100, 100), r(150, 0, 20, 20)]);
        let b = Region::from_rects([r(10, 10, 30, 30), r(90, 90, 100, 5)]);
        let d = &a - &b;
        assert!((&d & &b).is_empty());
        assert_eq!(d.area(), a.area() - (&a & &b).area());
    }

    #[test]
    fn test_bounding_of_union_contains_both() {
        let a = Region::from(r(-20, 5, 10, 10));
        let b = Region::from(r(40, 60, 5, 5));
        let bound = (&a | &b).bounding_rect();
        assert!(bound.contains(&a.bounding_rect()));
        assert!(bound.contains(&b.bounding_rect()));
    }

    #[test]
    fn test_translation_preserves_area() {
        let a = Region::from_rects([r(0, 0, 10, 10), r(20, 20, 5, 7)]);
        assert_eq!(a.translated(13, -4).area(), a.area());
    }

    #[test]
    fn test_equality_ignores_decomposition() {
        let split = Region::from_rects([r(0, 0, 50, 100), r(50, 0, 50, 100)]);
        let whole = Region::from(r(0, 0, 100, 100));
        assert_eq!(split, whole);
        let stacked = Region::from_rects([r(0, 0, 100, 30), r(0, 30, 30, 70), r(30, 30, 70, 70)]);
        assert_eq!(stacked, whole);
    }

    #[test]
    fn test_infinite_is_identity_for_intersection() {
        let a = Region::from(r(3, 4, 5, 6));
        assert_eq!(&a & &Region::infinite(), a);
        assert!((&a - &Region::infinite()).is_empty());
        assert!((&Region::infinite() | &a).is_infinite());
    }

    #[test]
    fn test_contains_rect_across_pieces() {
        let a = Region::from_rects([r(0, 0, 10, 20), r(10, 0, 10, 20)]);
        assert!(a.contains_rect(&r(5, 5, 10, 10)));
        assert!(!a.contains_rect(&r(15, 5, 10, 10)));
    }

    #[test]
    fn test_grid_of_pixels_coalesces_to_one_rect() {
        let mut grid = Region::new();
        for y in 0..10 {
            for x in 0..10 {
                grid |= r(x, y, 1, 1);
            }
        }
        assert_eq!(grid.rect_count(), 1);
        assert_eq!(grid.rects()[0], r(0, 0, 10, 10));
    }
}

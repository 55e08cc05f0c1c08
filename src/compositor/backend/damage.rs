//! Damage bookkeeping shared by the backends

use std::collections::VecDeque;

use super::SwapStrategy;
use crate::compositor::region::Region;
use crate::shared::geometry::Rect;

/// Frames remembered for buffer-age repair
pub const MAX_DAMAGE_HISTORY: usize = 10;

/// Damage of recently posted frames, newest first
#[derive(Debug, Clone, Default)]
pub struct DamageHistory {
    entries: VecDeque<Region>,
}

impl DamageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, damage: Region) {
        self.entries.push_front(damage);
        self.entries.truncate(MAX_DAMAGE_HISTORY);
    }

    /// Area a back buffer of the given age is missing. An age the history
    /// cannot answer means the whole display.
    pub fn accumulated(&self, age: i32, display: Rect) -> Region {
        let age = age as usize;
        if age == 0 || age > self.entries.len() {
            return Region::from(display);
        }
        let mut region = Region::new();
        for damage in self.entries.iter().take(age - 1) {
            region |= damage;
        }
        region
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Grow the paint region so a partial present stays cheap. Only applies
/// when the back buffer contents are not preserved by buffer age.
pub fn extend_paint_region(
    region: &mut Region,
    display: Rect,
    strategy: SwapStrategy,
    buffer_age: bool,
    opaque_fullscreen: bool,
) {
    if buffer_age {
        return;
    }
    match strategy {
        SwapStrategy::ExtendDamage => {
            let factor = if opaque_fullscreen { 0.49 } else { 0.748 };
            let limit = (factor * display.area() as f64) as i64;
            if region.iter().any(|r| r.area() > limit) {
                *region = Region::from(display);
            }
        }
        SwapStrategy::PaintFullScreen => *region = Region::from(display),
        SwapStrategy::CopyFrontBuffer | SwapStrategy::NoSwapEncourage => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISPLAY: Rect = Rect::new(0, 0, 100, 100);

    #[test]
    fn test_history_is_capped_newest_first() {
        let mut history = DamageHistory::new();
        for i in 0..12 {
            history.push(Region::from(Rect::new(i, 0, 1, 1)));
        }
        assert_eq!(history.len(), MAX_DAMAGE_HISTORY);
        // age 2 only needs the newest frame
        assert_eq!(history.accumulated(2, DISPLAY), Region::from(Rect::new(11, 0, 1, 1)));
    }

    #[test]
    fn test_accumulated_damage() {
        let mut history = DamageHistory::new();
        history.push(Region::from(Rect::new(0, 0, 10, 10)));
        history.push(Region::from(Rect::new(50, 50, 10, 10)));

        assert!(history.accumulated(1, DISPLAY).is_empty());
        assert_eq!(
            history.accumulated(2, DISPLAY),
            Region::from(Rect::new(50, 50, 10, 10))
        );
        assert_eq!(history.accumulated(2, DISPLAY).area(), 100);
        assert_eq!(history.accumulated(0, DISPLAY), Region::from(DISPLAY));
        assert_eq!(history.accumulated(3, DISPLAY), Region::from(DISPLAY));
    }

    #[test]
    fn test_extend_damage_thresholds() {
        let mut small = Region::from(Rect::new(0, 0, 70, 70));
        extend_paint_region(&mut small, DISPLAY, SwapStrategy::ExtendDamage, false, false);
        assert_eq!(small.area(), 4900);

        // Exactly 0.49 of the display is not enough
        extend_paint_region(&mut small, DISPLAY, SwapStrategy::ExtendDamage, false, true);
        assert_eq!(small.area(), 4900);

        let mut over = Region::from(Rect::new(0, 0, 71, 71));
        extend_paint_region(&mut over, DISPLAY, SwapStrategy::ExtendDamage, false, true);
        assert_eq!(over, Region::from(DISPLAY));

        let mut big = Region::from(Rect::new(0, 0, 100, 75));
        extend_paint_region(&mut big, DISPLAY, SwapStrategy::ExtendDamage, false, false);
        assert_eq!(big, Region::from(DISPLAY));
    }

    #[test]
    fn test_strategies() {
        let r = Region::from(Rect::new(0, 0, 5, 5));

        let mut full = r.clone();
        extend_paint_region(&mut full, DISPLAY, SwapStrategy::PaintFullScreen, false, false);
        assert_eq!(full, Region::from(DISPLAY));

        let mut kept = r.clone();
        extend_paint_region(&mut kept, DISPLAY, SwapStrategy::PaintFullScreen, true, false);
        assert_eq!(kept, r);

        for strategy in [SwapStrategy::CopyFrontBuffer, SwapStrategy::NoSwapEncourage] {
            let mut region = Region::from(Rect::new(0, 0, 100, 99));
            extend_paint_region(&mut region, DISPLAY, strategy, false, false);
            assert_eq!(region.area(), 9900);
        }
    }
}

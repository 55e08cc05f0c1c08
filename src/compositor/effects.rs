//! Effect hooks
//!
//! Effects observe and modify painting through pre/post hooks. They never
//! draw themselves; whatever values sit in the paint data when the render
//! nodes are built are the ones applied.

use std::time::Duration;

use bitflags::bitflags;

use super::quads::WindowQuadList;
use super::region::Region;
use super::window::{DisableReason, WindowId};
use crate::shared::geometry::Rect;
use crate::shared::transform::Transform;

bitflags! {
    /// Flags controlling how a frame or window is painted
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PaintMask: u32 {
        /// Window (or part of it) is painted opaque
        const WINDOW_OPAQUE = 1 << 0;
        /// Window (or part of it) is painted translucent
        const WINDOW_TRANSLUCENT = 1 << 1;
        /// Window is painted with transformed geometry
        const WINDOW_TRANSFORMED = 1 << 2;
        /// Only a region of the screen is painted
        const SCREEN_REGION = 1 << 3;
        /// The whole screen is painted with transformed geometry
        const SCREEN_TRANSFORMED = 1 << 4;
        /// At least one window is painted transformed
        const SCREEN_WITH_TRANSFORMED_WINDOWS = 1 << 5;
        /// Clear the whole background first without optimizing it
        const SCREEN_BACKGROUND_FIRST = 1 << 6;
        /// Smooth scaling filter
        const WINDOW_LANCZOS = 1 << 8;
    }
}

/// What effects may learn about a window
#[derive(Debug, Clone)]
pub struct EffectWindow {
    pub id: WindowId,
    pub geometry: Rect,
    pub opacity: f64,
    pub has_alpha: bool,
    pub deleted: bool,
}

#[derive(Debug, Clone)]
pub struct ScreenPrePaintData {
    pub mask: PaintMask,
    pub paint: Region,
}

#[derive(Debug, Clone)]
pub struct WindowPrePaintData {
    pub mask: PaintMask,
    /// Region that will be painted, screen coordinates
    pub paint: Region,
    /// Region covered opaquely by the window, screen coordinates
    pub clip: Region,
    pub quads: WindowQuadList,
    pub disable: DisableReason,
}

impl WindowPrePaintData {
    /// Paint translucent; nothing below can be clipped away
    pub fn set_translucent(&mut self) {
        self.mask.insert(PaintMask::WINDOW_TRANSLUCENT);
        self.mask.remove(PaintMask::WINDOW_OPAQUE);
        self.clip = Region::new();
    }

    /// Paint with a transform; the window may no longer cover its clip
    pub fn set_transformed(&mut self) {
        self.mask.insert(PaintMask::WINDOW_TRANSFORMED);
    }

    pub fn enable_painting(&mut self, reason: DisableReason) {
        self.disable.remove(reason);
    }

    pub fn disable_painting(&mut self, reason: DisableReason) {
        self.disable.insert(reason);
    }
}

/// Per-window paint attributes
#[derive(Debug, Clone)]
pub struct WindowPaintData {
    pub opacity: f64,
    pub brightness: f64,
    pub saturation: f64,
    /// 1.0 once the previous contents are fully faded out
    pub cross_fade_progress: f64,
    /// Applied on top of the window position
    pub transform: Transform,
    pub quads: WindowQuadList,
}

impl WindowPaintData {
    pub fn new(opacity: f64, quads: WindowQuadList) -> Self {
        Self {
            opacity,
            brightness: 1.0,
            saturation: 1.0,
            cross_fade_progress: 1.0,
            transform: Transform::identity(),
            quads,
        }
    }

    /// Multiply opacity, clamped to `[0, 1]`
    pub fn multiply_opacity(&mut self, factor: f64) -> f64 {
        self.opacity = (self.opacity * factor).clamp(0.0, 1.0);
        self.opacity
    }
}

/// Hooks an effect may implement. All default to no-ops.
pub trait Effect {
    fn name(&self) -> &str;

    fn pre_paint_screen(&mut self, _data: &mut ScreenPrePaintData, _time: Duration) {}

    fn post_paint_screen(&mut self) {}

    fn pre_paint_window(
        &mut self,
        _window: &EffectWindow,
        _data: &mut WindowPrePaintData,
        _time: Duration,
    ) {
    }

    fn paint_window(
        &mut self,
        _window: &EffectWindow,
        _mask: PaintMask,
        _region: &mut Region,
        _data: &mut WindowPaintData,
    ) {
    }

    fn post_paint_window(&mut self, _window: &EffectWindow) {}

    /// A window was closed; return true to keep it around as a tombstone
    /// (the effect then owns one reference and must release it)
    fn window_closed(&mut self, _window: &EffectWindow) -> bool {
        false
    }

    /// Released tombstone references, drained after every frame
    fn take_released(&mut self) -> Vec<WindowId> {
        Vec::new()
    }
}

/// Loaded effects in call order
#[derive(Default)]
pub struct EffectChain {
    effects: Vec<Box<dyn Effect>>,
}

impl EffectChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&mut self, effect: Box<dyn Effect>) {
        tracing::debug!("Compositor: loaded effect {}", effect.name());
        self.effects.push(effect);
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn pre_paint_screen(&mut self, data: &mut ScreenPrePaintData, time: Duration) {
        for e in &mut self.effects {
            e.pre_paint_screen(data, time);
        }
    }

    pub fn post_paint_screen(&mut self) {
        for e in &mut self.effects {
            e.post_paint_screen();
        }
    }

    pub fn pre_paint_window(&mut self, w: &EffectWindow, data: &mut WindowPrePaintData, time: Duration) {
        for e in &mut self.effects {
            e.pre_paint_window(w, data, time);
        }
    }

    pub fn paint_window(
        &mut self,
        w: &EffectWindow,
        mask: PaintMask,
        region: &mut Region,
        data: &mut WindowPaintData,
    ) {
        for e in &mut self.effects {
            e.paint_window(w, mask, region, data);
        }
    }

    pub fn post_paint_window(&mut self, w: &EffectWindow) {
        for e in &mut self.effects {
            e.post_paint_window(w);
        }
    }

    /// Number of effects that took a reference on the closed window
    pub fn window_closed(&mut self, w: &EffectWindow) -> u32 {
        self.effects
            .iter_mut()
            .map(|e| e.window_closed(w) as u32)
            .sum()
    }

    pub fn take_released(&mut self) -> Vec<WindowId> {
        self.effects
            .iter_mut()
            .flat_map(|e| e.take_released())
            .collect()
    }
}

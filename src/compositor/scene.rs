//! Scene paint orchestration
//!
//! One `paint()` per frame: ask the backend what a reused back buffer is
//! missing, let effects adjust the frame, cull windows hidden behind opaque
//! ones, draw the rest bottom-up and hand the painted and damaged areas back
//! to the backend for presentation.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use super::backend::{
    extend_paint_region, Backend, DrawParams, RenderBackend, ResetStatus, SwapStrategy,
};
use super::context::CompositorContext;
use super::decoration::RenderPool;
use super::effects::{Effect, EffectChain, PaintMask, ScreenPrePaintData, WindowPaintData, WindowPrePaintData};
use super::fps::FpsCounter;
use super::pixmap::{Buffer, BufferStorage};
use super::quads::WindowQuadList;
use super::region::Region;
use super::render_node::{collect_nodes, window_item, RenderContext};
use super::shadow::{Shadow, ShadowTextureCache};
use super::sync::SyncManager;
use super::window::{SceneWindow, Toplevel, WindowId};
use crate::config::Config;
use crate::dbus::Notifier;
use crate::error::{BackendError, BindError};
use crate::shared::geometry::{Rect, Size};

/// How long a graphics reset may take to clear
pub const RESET_TIMEOUT: Duration = Duration::from_secs(10);

const RESET_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Scene settings taken from the configuration
#[derive(Debug, Clone)]
pub struct SceneOptions {
    pub swap_strategy: SwapStrategy,
    pub explicit_sync: bool,
    pub decoration_threads: usize,
}

impl SceneOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            swap_strategy: config.compositor.swap_strategy,
            explicit_sync: config.compositor.explicit_sync,
            decoration_threads: config.decorations.threads,
        }
    }
}

/// A window that survived the first pass and will be painted
struct Phase2Data {
    id: WindowId,
    mask: PaintMask,
    region: Region,
    clip: Region,
    quads: WindowQuadList,
}

pub struct Scene {
    backend: Backend,
    screen: Rect,
    options: SceneOptions,
    windows: HashMap<WindowId, SceneWindow>,
    /// Bottom to top, tombstones included
    stacking: Vec<WindowId>,
    effects: EffectChain,
    sync: Option<SyncManager>,
    /// Fence triggered for the current frame
    fence: Option<usize>,
    shadow_cache: ShadowTextureCache,
    decoration_pool: RenderPool,
    notifier: Rc<dyn Notifier>,
    reset_occurred: bool,
    reconstruction_requested: bool,
    reset_timeout: Duration,
    /// Screen areas to repaint that belong to no window
    pending_repaint: Region,
    painted_region: Region,
    repaint_region: Region,
    damaged_region: Region,
    last_paint: Option<Instant>,
    fps: FpsCounter,
}

impl Scene {
    pub fn new(mut backend: Backend, screen: Size, ctx: &CompositorContext) -> Result<Self, BackendError> {
        let options = SceneOptions::from_config(ctx.config());
        let kind = backend.kind();

        let sync = if options.explicit_sync {
            match backend.fence_ops().map(SyncManager::new) {
                Some(Ok(sync)) => {
                    info!("Compositor: explicit sync enabled");
                    Some(sync)
                }
                Some(Err(e)) => {
                    warn!("Compositor: failed to create fences, using implicit sync: {}", e);
                    None
                }
                None => {
                    debug!("Compositor: {} backend has no fences", kind);
                    None
                }
            }
        } else {
            None
        };

        let decoration_pool = RenderPool::new(options.decoration_threads)
            .map_err(|e| BackendError::init(kind.name(), format!("failed to start decoration workers: {}", e)))?;

        let screen = Rect::from_size(screen);
        Ok(Self {
            backend,
            screen,
            options,
            windows: HashMap::new(),
            stacking: Vec::new(),
            effects: EffectChain::new(),
            sync,
            fence: None,
            shadow_cache: ctx.shadow_cache().clone(),
            decoration_pool,
            notifier: ctx.notifier(),
            reset_occurred: false,
            reconstruction_requested: false,
            reset_timeout: RESET_TIMEOUT,
            pending_repaint: Region::from(screen),
            painted_region: Region::new(),
            repaint_region: Region::new(),
            damaged_region: Region::new(),
            last_paint: None,
            fps: FpsCounter::new(),
        })
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn screen(&self) -> Rect {
        self.screen
    }

    pub fn load_effect(&mut self, effect: Box<dyn Effect>) {
        self.effects.load(effect);
    }

    // Windows

    pub fn window(&self, id: WindowId) -> Option<&SceneWindow> {
        self.windows.get(&id)
    }

    pub fn window_mut(&mut self, id: WindowId) -> Option<&mut SceneWindow> {
        self.windows.get_mut(&id)
    }

    /// Windows bottom to top
    pub fn stacking_order(&self) -> &[WindowId] {
        &self.stacking
    }

    /// Add a window on top of the stack
    pub fn add_window(&mut self, toplevel: Toplevel) {
        let id = toplevel.id;
        if self.windows.contains_key(&id) {
            self.remove_window(id);
        }
        let decoration_shadow = toplevel.decoration.as_ref().and_then(|d| d.shadow().cloned());
        let mut window = SceneWindow::new(toplevel);
        if let Some(shadow) = decoration_shadow {
            window.set_shadow(Some(Shadow::from_decoration(shadow, window.size())));
        }
        window.add_repaint_full();
        self.windows.insert(id, window);
        self.stacking.push(id);
        debug!("Compositor: added window {}", id);
    }

    pub fn update_window(&mut self, toplevel: Toplevel) {
        let Some(window) = self.windows.get_mut(&toplevel.id) else {
            return;
        };
        let repaint = window.update_toplevel(toplevel);
        window.add_repaint(&repaint);
    }

    /// Drop a window at once, without a tombstone
    pub fn remove_window(&mut self, id: WindowId) {
        if let Some(window) = self.windows.remove(&id) {
            self.pending_repaint |= &window.visible_rect();
            debug!("Compositor: removed window {}", id);
        }
        self.stacking.retain(|w| *w != id);
    }

    /// The window was closed. Effects that want to animate it keep it as a
    /// tombstone; otherwise it goes away.
    pub fn window_closed(&mut self, id: WindowId) {
        let Some(window) = self.windows.get_mut(&id) else {
            return;
        };
        if window.is_deleted() {
            return;
        }
        let references = self.effects.window_closed(&window.effect_window());
        if references == 0 {
            self.remove_window(id);
            return;
        }
        window.set_deleted(references);
        window.add_repaint_full();
    }

    /// Restack live windows in `order` (bottom to top). Tombstones keep their
    /// slot relative to the window below them.
    pub fn restack(&mut self, order: &[WindowId]) {
        let mut stacking: Vec<WindowId> = order
            .iter()
            .copied()
            .filter(|id| self.windows.get(id).is_some_and(|w| !w.is_deleted()))
            .collect();
        for (index, id) in self.stacking.iter().enumerate() {
            if !self.windows.get(id).is_some_and(SceneWindow::is_deleted) {
                continue;
            }
            let below = self.stacking[..index]
                .iter()
                .rev()
                .find_map(|b| stacking.iter().position(|s| s == b));
            let slot = below.map_or(0, |p| p + 1);
            stacking.insert(slot, *id);
        }
        if stacking != self.stacking {
            for id in &stacking {
                if let Some(window) = self.windows.get_mut(id) {
                    window.add_repaint_full();
                }
            }
            self.stacking = stacking;
        }
    }

    /// New buffer contents for a window. `damage` is buffer-local.
    pub fn commit(&mut self, id: WindowId, buffer: Buffer, damage: &Region) {
        if let Some(window) = self.windows.get_mut(&id) {
            let screen_damage = damage.translated(window.x(), window.y());
            window.commit(buffer, damage);
            window.add_repaint(&screen_damage);
        }
    }

    /// Damage the current contents of a window. `damage` is buffer-local.
    pub fn add_damage(&mut self, id: WindowId, damage: &Region) {
        if let Some(window) = self.windows.get_mut(&id) {
            window.add_damage(damage);
            let screen_damage = damage.translated(window.x(), window.y());
            window.add_repaint(&screen_damage);
        }
    }

    /// The window buffer is gone, e.g. after a resize
    pub fn discard_pixmap(&mut self, id: WindowId) {
        if let Some(window) = self.windows.get_mut(&id) {
            window.discard_pixmap();
        }
    }

    pub fn set_shadow(&mut self, id: WindowId, shadow: Option<Shadow>) {
        if let Some(window) = self.windows.get_mut(&id) {
            window.add_repaint_full();
            window.set_shadow(shadow);
            window.add_repaint_full();
        }
    }

    /// Repaint a screen area on the next frame
    pub fn add_repaint(&mut self, region: &Region) {
        self.pending_repaint |= region;
    }

    /// Whether the next `paint()` has anything to do
    pub fn has_pending_repaints(&self) -> bool {
        !self.pending_repaint.is_empty()
            || !self.effects.is_empty()
            || self.windows.values().any(|w| !w.repaints().is_empty())
    }

    pub fn screen_geometry_changed(&mut self, size: Size) {
        info!("Compositor: screen resized to {}x{}", size.width, size.height);
        self.screen = Rect::from_size(size);
        self.backend.screen_geometry_changed(size);
        self.pending_repaint = Region::from(self.screen);
    }

    // Frame results

    /// Area the back buffer needed repainted at the start of the last frame
    pub fn repaint_region(&self) -> &Region {
        &self.repaint_region
    }

    pub fn painted_region(&self) -> &Region {
        &self.painted_region
    }

    /// Area that changed on screen in the last frame
    pub fn damaged_region(&self) -> &Region {
        &self.damaged_region
    }

    pub fn fps(&self) -> f64 {
        self.fps.fps()
    }

    // Graphics reset

    /// True once after a graphics reset; the owner should rebuild the scene
    pub fn take_reconstruction_request(&mut self) -> bool {
        std::mem::take(&mut self.reconstruction_requested)
    }

    pub fn reset_occurred(&self) -> bool {
        self.reset_occurred
    }

    fn handle_graphics_reset(&mut self, status: ResetStatus) {
        match status {
            ResetStatus::Guilty => error!("Compositor: graphics reset attributable to the compositor"),
            ResetStatus::Innocent => error!("Compositor: graphics reset not attributable to the compositor"),
            _ => error!("Compositor: graphics reset of unknown cause"),
        }

        let deadline = Instant::now() + self.reset_timeout;
        while self.backend.reset_status() != ResetStatus::NoError {
            if Instant::now() >= deadline {
                error!("Compositor: graphics reset did not clear within {:?}", self.reset_timeout);
                break;
            }
            std::thread::sleep(RESET_POLL_INTERVAL);
        }

        if !self.reset_occurred {
            info!("Compositor: requesting scene reconstruction");
            self.reconstruction_requested = true;
            self.notifier.notify(
                "Desktop effects were restarted",
                "The graphics driver reset; the compositor restarts its renderer.",
            );
        }
        self.reset_occurred = true;
    }

    // Explicit sync

    /// Fence the X command stream. Called after window contents were
    /// submitted and before the frame reads them.
    pub fn trigger_fence(&mut self) {
        let Some(sync) = &mut self.sync else {
            return;
        };
        let index = sync.next_fence();
        match sync.trigger(index) {
            Ok(()) => self.fence = Some(index),
            Err(e) => {
                warn!("Compositor: fence trigger failed, explicit sync disabled: {}", e);
                self.sync = None;
                self.fence = None;
            }
        }
    }

    pub fn explicit_sync(&self) -> bool {
        self.sync.is_some()
    }

    // Painting

    /// Paint one frame. `damage` is screen damage gathered outside the
    /// scene. Returns the time spent, zero when nothing was painted because
    /// of a graphics reset.
    pub fn paint(&mut self, damage: &Region) -> Duration {
        if self.reset_occurred {
            return Duration::ZERO;
        }
        let start = Instant::now();
        let time = self.last_paint.map(|t| start - t).unwrap_or_default();
        self.last_paint = Some(start);

        let repaint = self.backend.begin_frame(self.screen);
        let status = self.backend.reset_status();
        if status != ResetStatus::NoError {
            self.handle_graphics_reset(status);
            return Duration::ZERO;
        }

        let damage = damage | &std::mem::take(&mut self.pending_repaint);
        let (mut valid, update) = self.paint_screen(&damage, &repaint, time);

        let display = Region::from(self.screen);
        if !self.backend.supports_buffer_age()
            && self.options.swap_strategy == SwapStrategy::CopyFrontBuffer
            && valid != display
        {
            self.backend.copy_pixels(&(&display - &valid));
            valid = display;
        }
        self.backend.end_frame(self.screen, &valid, &update);

        if self.fence.take().is_some() {
            if let Some(sync) = &mut self.sync {
                if !sync.update_fences() {
                    warn!("Compositor: fence timed out, explicit sync disabled");
                    self.sync = None;
                }
            }
        }

        for id in self.effects.take_released() {
            self.release_tombstone(id);
        }

        let elapsed = start.elapsed();
        if let Some(stats) = self.fps.tick(elapsed) {
            debug!(
                "Compositor: {:.1} fps, slowest frame {:.2} ms",
                stats.fps,
                stats.max_frame_time.as_secs_f64() * 1000.0
            );
        }
        elapsed
    }

    fn release_tombstone(&mut self, id: WindowId) {
        let Some(window) = self.windows.get_mut(&id) else {
            return;
        };
        if window.is_deleted() && window.unreference() {
            self.remove_window(id);
        }
    }

    /// Returns `(valid, update)` for `end_frame`
    fn paint_screen(&mut self, damage: &Region, repaint: &Region, time: Duration) -> (Region, Region) {
        let display = Region::from(self.screen);
        let mask = if *damage == display {
            PaintMask::empty()
        } else {
            PaintMask::SCREEN_REGION
        };
        let mut data = ScreenPrePaintData {
            mask,
            paint: damage.clone(),
        };
        self.effects.pre_paint_screen(&mut data, time);
        let mut mask = data.mask;
        let mut region = data.paint;

        let transformed = mask.intersects(PaintMask::SCREEN_TRANSFORMED | PaintMask::SCREEN_WITH_TRANSFORMED_WINDOWS);
        if transformed {
            mask.remove(PaintMask::SCREEN_REGION);
            region = Region::infinite();
        } else if mask.contains(PaintMask::SCREEN_REGION) {
            region &= self.screen;
        } else {
            region = display.clone();
        }

        self.painted_region = region.clone();
        self.repaint_region = repaint.clone();

        if transformed {
            self.paint_generic_screen(mask, time);
        } else {
            self.paint_simple_screen(mask, &region, time);
        }

        for id in &self.stacking {
            if let Some(window) = self.windows.get(id) {
                self.effects.post_paint_window(&window.effect_window());
            }
        }
        self.effects.post_paint_screen();

        let valid = &(&region | &self.painted_region) & &display;
        (valid, self.damaged_region.clone())
    }

    /// Prepare one window for the frame. Returns the pre-paint data, or
    /// `None` when the window is not painted.
    fn pre_paint_window(
        &mut self,
        id: WindowId,
        orig_mask: PaintMask,
        region: &Region,
        time: Duration,
    ) -> Option<(WindowPrePaintData, bool)> {
        let window = self.windows.get_mut(&id)?;
        let opaque = window.is_opaque();
        let mask = orig_mask
            | if opaque {
                PaintMask::WINDOW_OPAQUE
            } else {
                PaintMask::WINDOW_TRANSLUCENT
            };
        window.reset_painting_enabled();
        let paint = if region.is_infinite() {
            region.clone()
        } else {
            region | window.repaints()
        };
        window.preprocess();
        window.reset_repaints();

        let opaque_fullscreen = opaque && window.toplevel().geometry == self.screen;
        let clip = window.opaque_clip().translated(window.x(), window.y());
        let quads = window.build_quads();
        let mut data = WindowPrePaintData {
            mask,
            paint,
            clip,
            quads,
            disable: window.disable_reasons(),
        };
        self.effects.pre_paint_window(&window.effect_window(), &mut data, time);
        window.set_disable_reasons(data.disable);
        if !window.is_painting_enabled() {
            trace!("Compositor: window {} not painted: {:?}", id, window.disable_reasons());
            return None;
        }
        Some((data, opaque_fullscreen))
    }

    fn paint_simple_screen(&mut self, orig_mask: PaintMask, region: &Region, time: Duration) {
        let display = Region::from(self.screen);
        let mut phase2 = Vec::with_capacity(self.stacking.len());
        let mut dirty = region.clone();
        let mut opaque_fullscreen = false;

        for id in self.stacking.clone() {
            let Some((data, fullscreen)) = self.pre_paint_window(id, orig_mask, region, time) else {
                continue;
            };
            opaque_fullscreen |= fullscreen;
            dirty |= &data.paint;
            phase2.push(Phase2Data {
                id,
                mask: data.mask,
                region: data.paint,
                clip: data.clip,
                quads: data.quads,
            });
        }

        // Parts of the back buffer repaint that no window covers this frame
        let repaint_clip = &self.repaint_region - &dirty;
        dirty |= &self.repaint_region;

        let mut full_repaint = dirty == display;
        if !full_repaint {
            extend_paint_region(
                &mut dirty,
                self.screen,
                self.options.swap_strategy,
                self.backend.supports_buffer_age(),
                opaque_fullscreen,
            );
            full_repaint = dirty == display;
        }

        // Top-down occlusion pass
        let mut allclips = Region::new();
        let mut upper_translucent_damage = Region::new();
        for data in phase2.iter_mut().rev() {
            if full_repaint {
                data.region = display.clone();
            } else {
                data.region |= &upper_translucent_damage;
            }
            data.region -= &allclips;

            if !data.clip.is_empty() && !data.mask.contains(PaintMask::WINDOW_TRANSLUCENT) {
                allclips |= &data.clip;
                if !full_repaint {
                    upper_translucent_damage |= &(&data.region - &data.clip);
                }
            } else if !full_repaint {
                upper_translucent_damage |= &data.region;
            }
        }

        let mut painted_area = Region::new();
        if orig_mask.contains(PaintMask::SCREEN_BACKGROUND_FIRST) {
            self.backend.paint_background(&Region::infinite());
        } else {
            painted_area = &dirty - &allclips;
            self.backend.paint_background(&painted_area);
        }

        for data in phase2 {
            painted_area |= &data.region;
            self.paint_window(data.id, data.mask, painted_area.clone(), data.quads);
        }

        if full_repaint {
            self.painted_region = display.clone();
            self.damaged_region = &display - &repaint_clip;
        } else {
            self.painted_region |= &painted_area;
            self.damaged_region = &painted_area - &repaint_clip;
        }
    }

    fn paint_generic_screen(&mut self, orig_mask: PaintMask, time: Duration) {
        let infinite = Region::infinite();
        let mut phase2 = Vec::with_capacity(self.stacking.len());
        for id in self.stacking.clone() {
            if let Some((data, _)) = self.pre_paint_window(id, orig_mask, &infinite, time) {
                phase2.push((id, data.mask, data.quads));
            }
        }

        self.backend.paint_background(&infinite);
        for (id, mask, quads) in phase2 {
            self.paint_window(id, mask, infinite.clone(), quads);
        }
        self.damaged_region = Region::from(self.screen);
    }

    fn paint_window(&mut self, id: WindowId, mask: PaintMask, region: Region, quads: WindowQuadList) {
        let mut region = &region & &Region::from(self.screen);
        if region.is_empty() {
            return;
        }
        let Some(window) = self.windows.get(&id) else {
            return;
        };
        if window.is_deleted() && window.toplevel().skips_close_animation {
            return;
        }

        let mut data = WindowPaintData::new(window.toplevel().opacity, quads);
        self.effects
            .paint_window(&window.effect_window(), mask, &mut region, &mut data);

        if let Err(e) = self.prepare_textures(id) {
            debug!("Compositor: skipping window {}: {}", id, e);
            return;
        }

        let Some(window) = self.windows.get(&id) else {
            return;
        };
        let item = window_item(window, mask, &data);
        let ctx = RenderContext::new(mask, region);
        let nodes = collect_nodes(&item, &ctx);
        if nodes.is_empty() {
            return;
        }
        let params = DrawParams {
            brightness: data.brightness,
            saturation: data.saturation,
            scissor: ctx.hardware_clipping.then(|| ctx.clip.clone()),
        };
        self.backend.draw(&nodes, &params);
    }

    /// Bind the window pixmap and bring decoration and shadow textures up to
    /// date. A failure leaves the window out of this frame.
    fn prepare_textures(&mut self, id: WindowId) -> Result<(), BindError> {
        let Self {
            windows,
            backend,
            sync,
            fence,
            shadow_cache,
            decoration_pool,
            ..
        } = self;
        let window = windows.get_mut(&id).ok_or(BindError::NoBuffer)?;

        if let (Some(sync), Some(index)) = (sync.as_mut(), *fence) {
            let damaged_x11 = window.pixmap().is_some_and(|p| {
                !p.damage().is_empty() && matches!(p.buffer().map(|b| &b.storage), Some(BufferStorage::X11Pixmap(_)))
            });
            if damaged_x11 {
                sync.wait(index);
            }
        }

        let frame = window.size();
        if let Some(renderer) = window.decoration_renderer_mut() {
            renderer.render(frame, decoration_pool);
            if let Err(e) = renderer.upload(backend) {
                debug!("Compositor: decoration upload failed for window {}: {}", id, e);
            }
        }
        if let Some(shadow) = window.shadow_mut() {
            if let Err(e) = shadow.prepare(backend, shadow_cache) {
                debug!("Compositor: shadow texture failed for window {}: {}", id, e);
            }
        }

        window.bind(backend)?;
        window.reset_damage();
        Ok(())
    }
}

impl std::fmt::Debug for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scene")
            .field("backend", &self.backend)
            .field("screen", &self.screen)
            .field("windows", &self.stacking)
            .field("explicit_sync", &self.sync.is_some())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use super::*;
    use crate::compositor::backend::opengl::tests::FakeGlDevice;
    use crate::compositor::backend::raster::tests::FakeOutput;
    use crate::compositor::backend::{OpenGlBackend, RasterBackend};
    use crate::compositor::effects::EffectWindow;
    use crate::compositor::pixmap::tests::shm_buffer;
    use crate::compositor::sync::tests::FakeFenceOps;
    use crate::dbus::tests::RecordingNotifier;

    const SCREEN: Size = Size::new(200, 200);

    pub fn test_config() -> Config {
        let mut config = Config::default();
        config.decorations.threads = 0;
        config
    }

    pub fn context(config: Config, notifier: RecordingNotifier) -> CompositorContext {
        CompositorContext::new(None, config, Rc::new(notifier))
    }

    fn gl_scene(device: FakeGlDevice) -> Scene {
        let backend = Backend::OpenGl(OpenGlBackend::new(Box::new(device), SCREEN, true));
        Scene::new(backend, SCREEN, &context(test_config(), RecordingNotifier::default())).unwrap()
    }

    fn raster_scene() -> Scene {
        let backend = Backend::Raster(RasterBackend::new(Box::new(FakeOutput::default()), SCREEN));
        Scene::new(backend, SCREEN, &context(test_config(), RecordingNotifier::default())).unwrap()
    }

    fn opaque_window(scene: &mut Scene, id: WindowId, rect: Rect, color: u32) {
        scene.add_window(Toplevel::new(id, rect));
        let buffer = shm_buffer(id as u64, rect.size(), color);
        scene.commit(id, buffer, &Region::from(Rect::from_size(rect.size())));
    }

    #[test]
    fn test_undamaged_frame_with_buffer_age_repaints_nothing() {
        let device = FakeGlDevice::with_buffer_age(1);
        let log = device.log.clone();
        let mut scene = gl_scene(device);
        opaque_window(&mut scene, 1, Rect::new(10, 10, 100, 100), 0xff336699);

        scene.paint(&Region::new());
        assert!(log.borrow().iter().any(|l| l == "swap"));
        log.borrow_mut().clear();

        scene.paint(&Region::new());
        assert!(scene.repaint_region().is_empty());
        assert!(scene.damaged_region().is_empty());
        assert!(!log.borrow().iter().any(|l| l == "swap"));
    }

    #[test]
    fn test_damage_is_painted_and_presented() {
        let device = FakeGlDevice::with_buffer_age(1);
        let mut scene = gl_scene(device);
        opaque_window(&mut scene, 1, Rect::new(0, 0, 100, 100), 0xff336699);
        scene.paint(&Region::new());

        let damage = Region::from(Rect::new(120, 120, 10, 10));
        scene.paint(&damage);
        assert_eq!(*scene.damaged_region(), damage);
        assert_eq!(*scene.painted_region(), damage);
    }

    #[test]
    fn test_opaque_window_hides_the_one_below() {
        let mut scene = raster_scene();
        opaque_window(&mut scene, 1, Rect::new(0, 0, 100, 100), 0xffff0000);
        opaque_window(&mut scene, 2, Rect::new(0, 0, 100, 100), 0xff00ff00);
        scene.paint(&Region::from(scene.screen()));

        let Backend::Raster(raster) = scene.backend() else {
            panic!("raster backend expected");
        };
        assert_eq!(raster.back_buffer().pixel(50, 50), 0xff00ff00);
        assert_eq!(raster.back_buffer().pixel(150, 150), 0xff000000);
    }

    #[test]
    fn test_damage_below_opaque_window_is_culled() {
        let mut scene = raster_scene();
        opaque_window(&mut scene, 1, Rect::new(20, 20, 50, 50), 0xffff0000);
        opaque_window(&mut scene, 2, Rect::new(0, 0, 100, 100), 0xff00ff00);
        scene.paint(&Region::new());

        scene.add_damage(1, &Region::from(Rect::new(0, 0, 10, 10)));
        scene.paint(&Region::new());

        // Window 1 was never prepared, so its damage is still pending
        let lower = scene.window(1).unwrap().pixmap().unwrap();
        assert!(!lower.damage().is_empty());
        assert!(scene.damaged_region().is_empty());
    }

    #[test]
    fn test_copy_front_buffer_repairs_unpainted_area() {
        let device = FakeGlDevice::default();
        let log = device.log.clone();
        let backend = Backend::OpenGl(OpenGlBackend::new(Box::new(device), SCREEN, false));
        let mut config = test_config();
        config.compositor.swap_strategy = SwapStrategy::CopyFrontBuffer;
        let mut scene = Scene::new(backend, SCREEN, &context(config, RecordingNotifier::default())).unwrap();
        scene.paint(&Region::new());
        log.borrow_mut().clear();

        scene.paint(&Region::from(Rect::new(0, 0, 10, 10)));
        assert!(log.borrow().iter().any(|l| l.starts_with("front_to_back")));
    }

    #[test]
    fn test_graphics_reset_aborts_frame_and_requests_rebuild_once() {
        let device = FakeGlDevice::with_buffer_age(1);
        let log = device.log.clone();
        device
            .resets
            .borrow_mut()
            .extend([ResetStatus::Guilty, ResetStatus::Guilty, ResetStatus::NoError]);
        let resets = device.resets.clone();
        let notifier = RecordingNotifier::default();
        let sent = notifier.sent.clone();
        let backend = Backend::OpenGl(OpenGlBackend::new(Box::new(device), SCREEN, true));
        let mut scene = Scene::new(backend, SCREEN, &context(test_config(), notifier)).unwrap();
        opaque_window(&mut scene, 1, Rect::new(0, 0, 50, 50), 0xff000000);

        assert_eq!(scene.paint(&Region::from(scene.screen())), Duration::ZERO);
        assert!(resets.borrow().is_empty());
        assert!(!log.borrow().iter().any(|l| l == "swap" || l.starts_with("draw")));
        assert!(scene.reset_occurred());
        assert!(scene.take_reconstruction_request());
        assert!(!scene.take_reconstruction_request());
        assert_eq!(sent.borrow().len(), 1);

        // Nothing is painted until the scene is rebuilt
        assert_eq!(scene.paint(&Region::from(scene.screen())), Duration::ZERO);
        assert!(!scene.take_reconstruction_request());
        assert_eq!(sent.borrow().len(), 1);
    }

    #[test]
    fn test_stuck_reset_gives_up_after_timeout() {
        let device = FakeGlDevice::default();
        device.resets.borrow_mut().extend(std::iter::repeat(ResetStatus::Unknown).take(1000));
        let mut scene = gl_scene(device);
        scene.reset_timeout = Duration::ZERO;
        assert_eq!(scene.paint(&Region::new()), Duration::ZERO);
        assert!(scene.take_reconstruction_request());
    }

    #[test]
    fn test_fence_is_waited_before_binding_x11_pixmap() {
        let ops = FakeFenceOps::signaling();
        let fence_log = ops.log.clone();
        let mut scene = raster_scene();
        scene.sync = Some(SyncManager::new(Box::new(ops)).unwrap());

        scene.add_window(Toplevel::new(1, Rect::new(0, 0, 40, 40)));
        scene.commit(1, Buffer::x11_pixmap(1, 77, Size::new(40, 40), false), &Region::from(Rect::new(0, 0, 40, 40)));
        scene.trigger_fence();
        scene.paint(&Region::new());

        let log = fence_log.borrow();
        assert_eq!(log[0], "trigger 1");
        assert_eq!(log[1], "wait 1");
        assert!(scene.explicit_sync());
    }

    #[test]
    fn test_fence_timeout_disables_explicit_sync() {
        let mut ops = FakeFenceOps::default();
        ops.wait_result = Some(crate::compositor::sync::ClientWait::TimeoutExpired);
        let mut scene = raster_scene();
        scene.sync = Some(SyncManager::new(Box::new(ops)).unwrap());
        // Fill the ring so the fence after the cursor is still pending
        for _ in 0..4 {
            scene.trigger_fence();
        }
        scene.paint(&Region::new());
        assert!(!scene.explicit_sync());
    }

    struct KeepClosed {
        released: Rc<RefCell<VecDeque<WindowId>>>,
    }

    impl Effect for KeepClosed {
        fn name(&self) -> &str {
            "keep-closed"
        }

        fn window_closed(&mut self, _window: &EffectWindow) -> bool {
            true
        }

        fn take_released(&mut self) -> Vec<WindowId> {
            self.released.borrow_mut().drain(..).collect()
        }
    }

    #[test]
    fn test_tombstone_lives_until_released() {
        let released = Rc::new(RefCell::new(VecDeque::new()));
        let mut scene = raster_scene();
        scene.load_effect(Box::new(KeepClosed {
            released: released.clone(),
        }));
        opaque_window(&mut scene, 1, Rect::new(0, 0, 40, 40), 0xff00ff00);
        scene.paint(&Region::new());

        scene.window_closed(1);
        assert!(scene.window(1).unwrap().is_deleted());
        scene.paint(&Region::new());
        assert!(scene.window(1).is_some());

        released.borrow_mut().push_back(1);
        scene.paint(&Region::new());
        assert!(scene.window(1).is_none());
        assert!(scene.stacking_order().is_empty());
    }

    #[test]
    fn test_closed_window_without_effects_is_removed() {
        let mut scene = raster_scene();
        opaque_window(&mut scene, 1, Rect::new(0, 0, 40, 40), 0xff00ff00);
        scene.paint(&Region::new());
        scene.window_closed(1);
        assert!(scene.window(1).is_none());
        assert!(scene.has_pending_repaints());
    }

    #[test]
    fn test_restack_keeps_tombstone_above_its_neighbour() {
        let released = Rc::new(RefCell::new(VecDeque::new()));
        let mut scene = raster_scene();
        scene.load_effect(Box::new(KeepClosed { released }));
        for id in 1..=3 {
            opaque_window(&mut scene, id, Rect::new(0, 0, 10, 10), 0xff000000);
        }
        scene.window_closed(2);
        scene.restack(&[3, 1]);
        assert_eq!(scene.stacking_order(), &[3, 1, 2]);
    }

    #[test]
    fn test_screen_change_repaints_everything() {
        let mut scene = raster_scene();
        scene.paint(&Region::new());
        scene.screen_geometry_changed(Size::new(300, 100));
        assert!(scene.has_pending_repaints());
        scene.paint(&Region::new());
        assert_eq!(*scene.damaged_region(), Region::from(Rect::new(0, 0, 300, 100)));
    }
}

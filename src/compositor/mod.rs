//! Compositor Module
//!
//! Scene graph, render backends and the repaint driver. The platform layer
//! supplies backends and windows; the compositor picks the first backend that
//! comes up, builds a scene on it and paints whenever something changed.

pub mod backend;
pub mod context;
pub mod decoration;
pub mod effects;
pub mod fps;
pub mod pixmap;
pub mod quads;
pub mod region;
pub mod render_node;
pub mod scene;
pub mod shadow;
pub mod sync;
pub mod texture;
pub mod window;

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::BackendError;
use crate::shared::geometry::Size;
use backend::{Backend, BackendKind, RenderBackend};
use context::CompositorContext;
use region::Region;
use scene::Scene;

/// What the compositor needs from the windowing system
pub trait Platform {
    fn screen_size(&self) -> Size;

    /// Bring up a backend of the given kind on the platform's output
    fn create_backend(&mut self, kind: BackendKind, config: &Config) -> Result<Backend, BackendError>;

    /// Add every window the platform knows about to a fresh scene
    fn populate(&mut self, scene: &mut Scene);

    /// Push queued requests out before a frame is painted
    fn flush(&mut self) {}
}

pub struct Compositor {
    ctx: CompositorContext,
    scene: Option<Scene>,
    pending_damage: Region,
}

impl Compositor {
    pub fn new(ctx: CompositorContext) -> Self {
        Self {
            ctx,
            scene: None,
            pending_damage: Region::new(),
        }
    }

    pub fn context(&self) -> &CompositorContext {
        &self.ctx
    }

    pub fn scene(&self) -> Option<&Scene> {
        self.scene.as_ref()
    }

    pub fn scene_mut(&mut self) -> Option<&mut Scene> {
        self.scene.as_mut()
    }

    pub fn is_active(&self) -> bool {
        self.scene.is_some()
    }

    /// Build a scene on the first backend from the configured preference
    /// list that initializes. Returns false when none does; the desktop then
    /// runs without compositing.
    pub fn setup(&mut self, platform: &mut dyn Platform) -> bool {
        self.teardown();
        self.ctx.reset_shadow_cache();

        let size = platform.screen_size();
        let backends = self.ctx.config().compositor.backends.clone();
        for kind in backends {
            debug!("Compositor: trying {} backend", kind);
            let scene = platform
                .create_backend(kind, self.ctx.config())
                .and_then(|backend| Scene::new(backend, size, &self.ctx));
            match scene {
                Ok(mut scene) => {
                    info!("Compositor: using {} backend", kind);
                    platform.populate(&mut scene);
                    self.ctx.set_backend(Some(kind));
                    self.scene = Some(scene);
                    self.pending_damage = Region::new();
                    return true;
                }
                Err(e) => warn!("Compositor: {} backend failed: {}", kind, e),
            }
        }

        warn!("Compositor: no backend could be initialized, compositing disabled");
        false
    }

    /// Drop the scene and its backend
    pub fn teardown(&mut self) {
        if let Some(scene) = self.scene.take() {
            info!("Compositor: tearing down {} scene", scene.backend().kind());
        }
        self.ctx.set_backend(None);
    }

    /// Screen damage from outside the scene, e.g. an exposed root window
    pub fn add_damage(&mut self, region: &Region) {
        if self.scene.is_some() {
            self.pending_damage |= region;
        }
    }

    pub fn screen_geometry_changed(&mut self, size: Size) {
        if let Some(scene) = &mut self.scene {
            scene.screen_geometry_changed(size);
        }
    }

    /// Run one repaint cycle. Returns the frame time when a frame was
    /// painted.
    pub fn perform_compositing(&mut self, platform: &mut dyn Platform) -> Option<Duration> {
        if self
            .scene
            .as_mut()
            .is_some_and(|scene| scene.take_reconstruction_request())
        {
            info!("Compositor: rebuilding the scene after a graphics reset");
            self.setup(platform);
        }

        let scene = self.scene.as_mut()?;
        if self.pending_damage.is_empty() && !scene.has_pending_repaints() {
            return None;
        }

        platform.flush();
        scene.trigger_fence();
        let damage = std::mem::take(&mut self.pending_damage);
        Some(scene.paint(&damage))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::backend::opengl::tests::FakeGlDevice;
    use super::backend::raster::tests::FakeOutput;
    use super::backend::{OpenGlBackend, RasterBackend, ResetStatus};
    use super::scene::tests::{context, test_config};
    use super::window::Toplevel;
    use super::*;
    use crate::dbus::tests::RecordingNotifier;
    use crate::shared::geometry::Rect;

    const SCREEN: Size = Size::new(120, 80);

    #[derive(Default)]
    struct FakePlatform {
        broken: Vec<BackendKind>,
        attempts: Vec<BackendKind>,
        populated: u32,
        flushes: u32,
        resets: Rc<RefCell<VecDeque<ResetStatus>>>,
    }

    impl Platform for FakePlatform {
        fn screen_size(&self) -> Size {
            SCREEN
        }

        fn create_backend(&mut self, kind: BackendKind, _config: &Config) -> Result<Backend, BackendError> {
            self.attempts.push(kind);
            if self.broken.contains(&kind) {
                return Err(BackendError::init(kind.name(), "no usable visual"));
            }
            match kind {
                BackendKind::OpenGl => {
                    let mut device = FakeGlDevice::with_buffer_age(1);
                    device.resets = self.resets.clone();
                    Ok(Backend::OpenGl(OpenGlBackend::new(Box::new(device), SCREEN, true)))
                }
                BackendKind::Raster => Ok(Backend::Raster(RasterBackend::new(
                    Box::new(FakeOutput::default()),
                    SCREEN,
                ))),
                BackendKind::XRender => Err(BackendError::MissingExtension("RENDER")),
            }
        }

        fn populate(&mut self, scene: &mut Scene) {
            self.populated += 1;
            scene.add_window(Toplevel::new(1, Rect::new(0, 0, 40, 40)));
        }

        fn flush(&mut self) {
            self.flushes += 1;
        }
    }

    fn compositor() -> Compositor {
        Compositor::new(context(test_config(), RecordingNotifier::default()))
    }

    #[test]
    fn test_falls_back_to_next_backend() {
        let mut platform = FakePlatform {
            broken: vec![BackendKind::OpenGl],
            ..Default::default()
        };
        let mut compositor = compositor();
        assert!(compositor.setup(&mut platform));
        assert_eq!(platform.attempts, vec![BackendKind::OpenGl, BackendKind::Raster]);
        assert_eq!(compositor.context().backend(), Some(BackendKind::Raster));
        assert_eq!(compositor.scene().unwrap().backend().kind(), BackendKind::Raster);
        assert_eq!(platform.populated, 1);
    }

    #[test]
    fn test_no_backend_disables_compositing() {
        let mut platform = FakePlatform {
            broken: vec![BackendKind::OpenGl, BackendKind::Raster],
            ..Default::default()
        };
        let mut compositor = compositor();
        assert!(!compositor.setup(&mut platform));
        assert_eq!(platform.attempts, BackendKind::FALLBACK_ORDER.to_vec());
        assert!(!compositor.is_active());
        assert_eq!(compositor.context().backend(), None);
        assert!(compositor.perform_compositing(&mut platform).is_none());
    }

    #[test]
    fn test_idle_compositor_does_not_paint() {
        let mut platform = FakePlatform::default();
        let mut compositor = compositor();
        compositor.setup(&mut platform);

        assert!(compositor.perform_compositing(&mut platform).is_some());
        assert!(compositor.perform_compositing(&mut platform).is_none());
        assert_eq!(platform.flushes, 1);

        compositor.add_damage(&Region::from(Rect::new(0, 0, 5, 5)));
        assert!(compositor.perform_compositing(&mut platform).is_some());
        assert_eq!(*compositor.scene().unwrap().damaged_region(), Region::from(Rect::new(0, 0, 5, 5)));
    }

    #[test]
    fn test_graphics_reset_rebuilds_scene() {
        let mut platform = FakePlatform::default();
        platform
            .resets
            .borrow_mut()
            .extend([ResetStatus::Innocent, ResetStatus::NoError]);
        let mut compositor = compositor();
        compositor.setup(&mut platform);

        assert_eq!(compositor.perform_compositing(&mut platform), Some(Duration::ZERO));
        assert!(compositor.scene().unwrap().reset_occurred());

        // The next cycle replaces the scene and paints on the new one
        assert!(compositor.perform_compositing(&mut platform).is_some());
        assert_eq!(platform.populated, 2);
        assert_eq!(platform.attempts, vec![BackendKind::OpenGl, BackendKind::OpenGl]);
        assert!(!compositor.scene().unwrap().reset_occurred());
    }
}

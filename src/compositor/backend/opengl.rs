//! OpenGL backend
//!
//! Frame bookkeeping (buffer age, damage history, partial presents) lives
//! here; every GL and GLX call goes through a `GlDevice`.

use std::time::Instant;

use tracing::{debug, trace};

use super::damage::DamageHistory;
use super::{flip_rect, BackendKind, DrawParams, RenderBackend, ResetStatus};
use crate::compositor::pixmap::{Buffer, BufferStorage, TextureBackend};
use crate::compositor::region::Region;
use crate::compositor::render_node::RenderNode;
use crate::compositor::sync::FenceOps;
use crate::compositor::texture::{GlResource, GlTexture, ReleaseQueue, Texture};
use crate::error::BindError;
use crate::shared::geometry::{Rect, Size};
use crate::shared::image::Image;
use crate::shared::transform::Transform;

/// Texture created from an X11 pixmap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixmapBinding {
    pub texture: u32,
    pub glx_pixmap: u64,
    pub y_inverted: bool,
}

/// One textured draw
#[derive(Debug)]
pub struct DrawCall<'a> {
    pub texture: u32,
    /// Interleaved `x, y, u, v`, two triangles per quad
    pub vertices: &'a [f32],
    pub mvp: [f32; 16],
    pub opacity: f32,
    pub brightness: f32,
    pub saturation: f32,
    pub blend: bool,
}

/// GL context, window surface and texture primitives. Rects are in GL window
/// coordinates (bottom-left origin).
pub trait GlDevice {
    fn make_current(&mut self) -> bool;

    fn supports_buffer_age(&self) -> bool;

    fn query_buffer_age(&mut self) -> i32;

    fn supports_copy_sub_buffer(&self) -> bool;

    fn swap_buffers(&mut self);

    fn copy_sub_buffer(&mut self, rect: Rect);

    /// Copy rects of the back buffer to the front buffer
    fn copy_back_to_front(&mut self, rects: &[Rect]);

    /// Copy rects of the front buffer to the back buffer
    fn copy_front_to_back(&mut self, rects: &[Rect]);

    /// Wait for pending X rendering
    fn wait_x(&mut self);

    /// Wait for pending GL rendering and flush
    fn wait_gl(&mut self);

    fn flush(&mut self);

    fn reset_status(&mut self) -> ResetStatus;

    fn clear(&mut self, rects: &[Rect]);

    fn set_scissor(&mut self, rect: Option<Rect>);

    fn create_texture(&mut self, image: &Image) -> Result<u32, String>;

    fn update_texture(&mut self, texture: u32, image: &Image, rect: Rect) -> Result<(), String>;

    fn bind_pixmap(&mut self, pixmap: u32, size: Size, has_alpha: bool) -> Result<PixmapBinding, String>;

    /// Release and bind again so the texture picks up new pixmap contents
    fn rebind_pixmap(&mut self, texture: u32, glx_pixmap: u64);

    fn draw(&mut self, call: &DrawCall<'_>);

    fn release(&mut self, resource: GlResource);

    fn fence_ops(&mut self) -> Option<Box<dyn FenceOps>>;

    fn resize(&mut self, size: Size);
}

pub struct OpenGlBackend {
    device: Box<dyn GlDevice>,
    release: ReleaseQueue<GlResource>,
    screen: Size,
    use_buffer_age: bool,
    buffer_age: i32,
    history: DamageHistory,
    last_damage: Region,
    frame_start: Option<Instant>,
    vertices: Vec<f32>,
}

impl OpenGlBackend {
    pub fn new(device: Box<dyn GlDevice>, screen: Size, use_buffer_age: bool) -> Self {
        let use_buffer_age = use_buffer_age && device.supports_buffer_age();
        debug!(
            "Compositor: OpenGL backend {}x{}, buffer age {}",
            screen.width,
            screen.height,
            if use_buffer_age { "enabled" } else { "disabled" }
        );
        Self {
            device,
            release: ReleaseQueue::new(),
            screen,
            use_buffer_age,
            buffer_age: 0,
            history: DamageHistory::new(),
            last_damage: Region::new(),
            frame_start: None,
            vertices: Vec::new(),
        }
    }

    fn release_pending(&mut self) {
        for resource in self.release.drain() {
            self.device.release(resource);
        }
    }

    fn gl_rects(&self, region: &Region) -> Vec<Rect> {
        region.iter().map(|r| flip_rect(*r, self.screen.height)).collect()
    }

    fn present(&mut self, screen: Rect) {
        let full_repaint = self.use_buffer_age || self.last_damage == Region::from(screen);
        if full_repaint {
            self.device.swap_buffers();
            if self.use_buffer_age {
                self.buffer_age = self.device.query_buffer_age();
            }
        } else if self.device.supports_copy_sub_buffer() {
            for rect in self.gl_rects(&self.last_damage) {
                self.device.copy_sub_buffer(rect);
            }
        } else {
            let rects = self.gl_rects(&self.last_damage);
            self.device.copy_back_to_front(&rects);
        }
        if !self.use_buffer_age {
            self.device.wait_gl();
        }
    }

    fn push_quads(&mut self, node: &RenderNode<'_>) {
        self.vertices.clear();
        for quad in &node.quads {
            let corner = |i: usize| {
                let v = &quad.verts[i];
                let (u, t) = node.texture.normalize(v.u, v.v, node.coords);
                [v.x as f32, v.y as f32, u as f32, t as f32]
            };
            for i in [0, 1, 2, 0, 2, 3] {
                self.vertices.extend_from_slice(&corner(i));
            }
        }
    }
}

impl TextureBackend for OpenGlBackend {
    fn create_texture(&mut self, buffer: &Buffer) -> Result<Texture, BindError> {
        match &buffer.storage {
            BufferStorage::Shm(image) => {
                let name = self.device.create_texture(image).map_err(BindError::Upload)?;
                Ok(Texture::OpenGl(GlTexture::new(name, buffer.size, true, self.release.clone())))
            }
            BufferStorage::X11Pixmap(pixmap) => {
                let binding = self
                    .device
                    .bind_pixmap(*pixmap, buffer.size, buffer.has_alpha)
                    .map_err(BindError::Upload)?;
                let texture = GlTexture::new(binding.texture, buffer.size, binding.y_inverted, self.release.clone())
                    .with_glx_pixmap(binding.glx_pixmap);
                Ok(Texture::OpenGl(texture))
            }
        }
    }

    fn update_texture(&mut self, texture: &mut Texture, buffer: &Buffer, damage: &Region) -> Result<(), BindError> {
        let Texture::OpenGl(texture) = texture else {
            return Err(BindError::Unsupported);
        };
        match &buffer.storage {
            BufferStorage::Shm(image) => {
                for rect in damage.iter() {
                    let rect = rect.intersected(&image.rect());
                    if rect.is_empty() {
                        continue;
                    }
                    self.device
                        .update_texture(texture.name, image, rect)
                        .map_err(BindError::Upload)?;
                }
            }
            BufferStorage::X11Pixmap(_) => {
                let glx_pixmap = texture.glx_pixmap.ok_or(BindError::Unsupported)?;
                self.device.rebind_pixmap(texture.name, glx_pixmap);
            }
        }
        Ok(())
    }
}

impl RenderBackend for OpenGlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::OpenGl
    }

    fn begin_frame(&mut self, screen: Rect) -> Region {
        self.frame_start = Some(Instant::now());
        self.release_pending();
        if !self.device.make_current() {
            debug!("Compositor: failed to make the GL context current");
        }
        let repaint = if self.use_buffer_age {
            self.history.accumulated(self.buffer_age, screen)
        } else {
            Region::new()
        };
        self.device.wait_x();
        repaint
    }

    fn end_frame(&mut self, screen: Rect, valid: &Region, update: &Region) {
        if update.is_empty() {
            self.last_damage = Region::new();
            // Anything rendered only repaired a reused back buffer, which
            // now matches the front buffer
            if !valid.is_empty() {
                self.device.flush();
            }
            self.buffer_age = 1;
            return;
        }

        self.last_damage = valid.clone();
        self.present(screen);

        if self.use_buffer_age {
            self.history.push(update.clone());
        }
        if let Some(start) = self.frame_start.take() {
            trace!("Compositor: GL frame took {:?}", start.elapsed());
        }
    }

    fn supports_buffer_age(&self) -> bool {
        self.use_buffer_age
    }

    fn buffer_age(&self) -> i32 {
        self.buffer_age
    }

    fn paint_background(&mut self, region: &Region) {
        if region.is_infinite() {
            self.device.clear(&[Rect::from_size(self.screen)]);
        } else {
            let rects = self.gl_rects(region);
            self.device.clear(&rects);
        }
    }

    fn draw(&mut self, nodes: &[RenderNode<'_>], params: &DrawParams) {
        let projection = Transform::ortho(self.screen.width as f64, self.screen.height as f64);
        let scissor = params.scissor.as_ref().map(|s| self.gl_rects(s));

        for node in nodes {
            let Texture::OpenGl(texture) = node.texture else {
                trace!("Compositor: skipping node without a GL texture");
                continue;
            };
            if node.quads.is_empty() || node.opacity <= 0.0 {
                continue;
            }
            self.push_quads(node);
            let vertices = std::mem::take(&mut self.vertices);
            let call = DrawCall {
                texture: texture.name,
                vertices: &vertices,
                mvp: (projection * node.transform).to_gl_matrix(),
                opacity: node.opacity as f32,
                brightness: params.brightness as f32,
                saturation: params.saturation as f32,
                blend: node.has_alpha || node.opacity < 1.0,
            };
            match &scissor {
                Some(rects) => {
                    for rect in rects {
                        self.device.set_scissor(Some(*rect));
                        self.device.draw(&call);
                    }
                    self.device.set_scissor(None);
                }
                None => self.device.draw(&call),
            }
            self.vertices = vertices;
        }
    }

    fn copy_pixels(&mut self, region: &Region) {
        let rects = self.gl_rects(region);
        self.device.copy_front_to_back(&rects);
    }

    fn screen_geometry_changed(&mut self, size: Size) {
        self.screen = size;
        self.buffer_age = 0;
        self.history.clear();
        self.device.resize(size);
    }

    fn reset_status(&mut self) -> ResetStatus {
        self.device.reset_status()
    }

    fn fence_ops(&mut self) -> Option<Box<dyn FenceOps>> {
        self.device.fence_ops()
    }
}

impl Drop for OpenGlBackend {
    fn drop(&mut self) {
        self.release_pending();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::*;
    use crate::compositor::pixmap::tests::shm_buffer;
    use crate::compositor::quads::{QuadKind, WindowQuad, WindowQuadList};
    use crate::compositor::texture::CoordinateType;
    use crate::shared::geometry::RectF;

    /// Records device calls. Reset statuses are popped one per query.
    #[derive(Default)]
    pub struct FakeGlDevice {
        pub log: Rc<RefCell<Vec<String>>>,
        pub buffer_age: Option<i32>,
        pub copy_sub_buffer: bool,
        pub resets: Rc<RefCell<VecDeque<ResetStatus>>>,
        next_texture: u32,
    }

    impl FakeGlDevice {
        pub fn with_buffer_age(age: i32) -> Self {
            Self {
                buffer_age: Some(age),
                ..Self::default()
            }
        }

        fn log(&self, entry: impl Into<String>) {
            self.log.borrow_mut().push(entry.into());
        }
    }

    impl GlDevice for FakeGlDevice {
        fn make_current(&mut self) -> bool {
            true
        }

        fn supports_buffer_age(&self) -> bool {
            self.buffer_age.is_some()
        }

        fn query_buffer_age(&mut self) -> i32 {
            self.buffer_age.unwrap_or(0)
        }

        fn supports_copy_sub_buffer(&self) -> bool {
            self.copy_sub_buffer
        }

        fn swap_buffers(&mut self) {
            self.log("swap");
        }

        fn copy_sub_buffer(&mut self, rect: Rect) {
            self.log(format!("copy_sub_buffer {:?}", rect));
        }

        fn copy_back_to_front(&mut self, rects: &[Rect]) {
            self.log(format!("back_to_front {}", rects.len()));
        }

        fn copy_front_to_back(&mut self, rects: &[Rect]) {
            self.log(format!("front_to_back {}", rects.len()));
        }

        fn wait_x(&mut self) {}

        fn wait_gl(&mut self) {}

        fn flush(&mut self) {
            self.log("flush");
        }

        fn reset_status(&mut self) -> ResetStatus {
            self.resets.borrow_mut().pop_front().unwrap_or(ResetStatus::NoError)
        }

        fn clear(&mut self, rects: &[Rect]) {
            self.log(format!("clear {}", rects.len()));
        }

        fn set_scissor(&mut self, rect: Option<Rect>) {
            if let Some(rect) = rect {
                self.log(format!("scissor {:?}", rect));
            }
        }

        fn create_texture(&mut self, _image: &Image) -> Result<u32, String> {
            self.next_texture += 1;
            Ok(self.next_texture)
        }

        fn update_texture(&mut self, texture: u32, _image: &Image, rect: Rect) -> Result<(), String> {
            self.log(format!("update {} {:?}", texture, rect));
            Ok(())
        }

        fn bind_pixmap(&mut self, pixmap: u32, _size: Size, _has_alpha: bool) -> Result<PixmapBinding, String> {
            self.next_texture += 1;
            Ok(PixmapBinding {
                texture: self.next_texture,
                glx_pixmap: pixmap as u64 + 1000,
                y_inverted: false,
            })
        }

        fn rebind_pixmap(&mut self, texture: u32, _glx_pixmap: u64) {
            self.log(format!("rebind {}", texture));
        }

        fn draw(&mut self, call: &DrawCall<'_>) {
            self.log(format!(
                "draw {} verts={} blend={}",
                call.texture,
                call.vertices.len() / 4,
                call.blend
            ));
        }

        fn release(&mut self, resource: GlResource) {
            self.log(format!("release {:?}", resource));
        }

        fn fence_ops(&mut self) -> Option<Box<dyn FenceOps>> {
            None
        }

        fn resize(&mut self, size: Size) {
            self.log(format!("resize {}x{}", size.width, size.height));
        }
    }

    const SCREEN: Rect = Rect::new(0, 0, 100, 100);

    fn backend(device: FakeGlDevice) -> (OpenGlBackend, Rc<RefCell<Vec<String>>>) {
        let log = device.log.clone();
        (OpenGlBackend::new(Box::new(device), SCREEN.size(), true), log)
    }

    #[test]
    fn test_empty_update_sets_buffer_age_without_posting() {
        let (mut gl, log) = backend(FakeGlDevice::with_buffer_age(3));
        gl.begin_frame(SCREEN);
        gl.end_frame(SCREEN, &Region::from(Rect::new(0, 0, 5, 5)), &Region::new());
        assert_eq!(gl.buffer_age(), 1);
        assert_eq!(*log.borrow(), vec!["flush".to_string()]);
    }

    #[test]
    fn test_buffer_age_repaint_comes_from_history() {
        let (mut gl, _log) = backend(FakeGlDevice::with_buffer_age(2));
        // Unknown age: everything
        assert_eq!(gl.begin_frame(SCREEN), Region::from(SCREEN));

        gl.end_frame(SCREEN, &Region::from(SCREEN), &Region::from(SCREEN));
        // One frame of history does not cover a two frame old buffer
        assert_eq!(gl.begin_frame(SCREEN), Region::from(SCREEN));

        let damage = Region::from(Rect::new(10, 10, 5, 5));
        gl.end_frame(SCREEN, &Region::from(SCREEN), &damage);
        assert_eq!(gl.buffer_age(), 2);
        assert_eq!(gl.begin_frame(SCREEN), damage);
    }

    #[test]
    fn test_partial_present_uses_copy_sub_buffer() {
        let device = FakeGlDevice {
            copy_sub_buffer: true,
            ..FakeGlDevice::default()
        };
        let (mut gl, log) = backend(device);
        assert!(gl.begin_frame(SCREEN).is_empty());
        let valid = Region::from(Rect::new(10, 0, 20, 30));
        gl.end_frame(SCREEN, &valid, &valid);
        assert_eq!(
            *log.borrow(),
            vec![format!("copy_sub_buffer {:?}", Rect::new(10, 70, 20, 30))]
        );

        log.borrow_mut().clear();
        gl.end_frame(SCREEN, &Region::from(SCREEN), &valid);
        assert_eq!(*log.borrow(), vec!["swap".to_string()]);
    }

    #[test]
    fn test_partial_present_falls_back_to_copy_pixels() {
        let (mut gl, log) = backend(FakeGlDevice::default());
        let valid = Region::from_rects([Rect::new(0, 0, 10, 10), Rect::new(50, 50, 10, 10)]);
        gl.end_frame(SCREEN, &valid, &valid);
        assert_eq!(*log.borrow(), vec!["back_to_front 2".to_string()]);
    }

    #[test]
    fn test_screen_change_resets_buffer_age() {
        let (mut gl, log) = backend(FakeGlDevice::with_buffer_age(1));
        gl.end_frame(SCREEN, &Region::from(SCREEN), &Region::from(SCREEN));
        assert_eq!(gl.buffer_age(), 1);
        gl.screen_geometry_changed(Size::new(200, 100));
        assert_eq!(gl.buffer_age(), 0);
        assert!(log.borrow().contains(&"resize 200x100".to_string()));
        assert_eq!(gl.begin_frame(Rect::new(0, 0, 200, 100)), Region::from(Rect::new(0, 0, 200, 100)));
    }

    #[test]
    fn test_textures_are_released_next_frame() {
        let (mut gl, log) = backend(FakeGlDevice::default());
        let texture = gl.create_texture(&shm_buffer(1, Size::new(4, 4), 0xff000000)).unwrap();
        drop(texture);
        gl.begin_frame(SCREEN);
        assert_eq!(*log.borrow(), vec!["release Texture(1)".to_string()]);
    }

    #[test]
    fn test_shm_update_uploads_each_damaged_rect() {
        let (mut gl, log) = backend(FakeGlDevice::default());
        let buffer = shm_buffer(1, Size::new(40, 40), 0xff000000);
        let mut texture = gl.create_texture(&buffer).unwrap();
        let damage = Region::from_rects([Rect::new(0, 0, 5, 5), Rect::new(30, 30, 20, 20)]);
        gl.update_texture(&mut texture, &buffer, &damage).unwrap();
        assert_eq!(
            *log.borrow(),
            vec![
                format!("update 1 {:?}", Rect::new(0, 0, 5, 5)),
                format!("update 1 {:?}", Rect::new(30, 30, 10, 10)),
            ]
        );
    }

    #[test]
    fn test_draw_blends_translucent_nodes_and_scissors() {
        let (mut gl, log) = backend(FakeGlDevice::default());
        let texture = gl.create_texture(&shm_buffer(1, Size::new(10, 10), 0xff000000)).unwrap();
        let rect = RectF::new(0.0, 0.0, 10.0, 10.0);
        let quads: WindowQuadList = [WindowQuad::from_rect(QuadKind::Contents, 0, rect, rect)].into_iter().collect();
        let node = RenderNode {
            texture: &texture,
            quads,
            transform: Transform::translation(5.0, 5.0),
            opacity: 0.5,
            has_alpha: false,
            coords: CoordinateType::Unnormalized,
        };
        let params = DrawParams {
            scissor: Some(Region::from(Rect::new(0, 0, 50, 50))),
            ..DrawParams::default()
        };
        gl.draw(std::slice::from_ref(&node), &params);
        assert_eq!(
            *log.borrow(),
            vec![
                format!("scissor {:?}", Rect::new(0, 50, 50, 50)),
                "draw 1 verts=6 blend=true".to_string(),
            ]
        );
    }
}

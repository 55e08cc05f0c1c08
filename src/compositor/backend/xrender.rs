//! XRender backend
//!
//! Everything is composited server side into a back buffer picture. Each
//! quad becomes one composite request with a picture transform mapping
//! screen pixels to texels.

use tracing::{debug, trace};

use super::{BackendKind, DrawParams, RenderBackend};
use crate::compositor::pixmap::{Buffer, BufferStorage, TextureBackend};
use crate::compositor::quads::WindowQuad;
use crate::compositor::region::Region;
use crate::compositor::render_node::RenderNode;
use crate::compositor::texture::{ReleaseQueue, Texture, XRenderPicture, XRenderResource};
use crate::error::BindError;
use crate::shared::geometry::{PointF, Rect, Size};
use crate::shared::image::Image;
use crate::shared::transform::Transform;

/// One composite request onto the back buffer
#[derive(Debug, Clone, PartialEq)]
pub struct Composite {
    pub picture: u32,
    /// Maps screen pixels to source texels
    pub transform: Transform,
    pub dst: Rect,
    pub opacity: f64,
    pub blend: bool,
    /// Clip rectangles on the back buffer
    pub clip: Option<Vec<Rect>>,
}

/// Server-side pictures and pixmaps
pub trait XRenderDevice {
    /// Picture wrapping a client pixmap
    fn create_picture(&mut self, pixmap: u32, has_alpha: bool) -> Result<u32, String>;

    /// Upload an image into a new pixmap. Returns `(pixmap, picture)`.
    fn upload_image(&mut self, image: &Image) -> Result<(u32, u32), String>;

    fn update_image(&mut self, pixmap: u32, image: &Image, rect: Rect) -> Result<(), String>;

    fn fill(&mut self, rects: &[Rect], color: u32);

    fn composite(&mut self, op: &Composite);

    /// Blend a premultiplied solid `color` over the area `op` just painted,
    /// masked by the alpha of its picture
    fn tint(&mut self, op: &Composite, color: u32);

    /// Copy the back buffer to the front, clipped to `clip` when given
    fn present(&mut self, clip: Option<&[Rect]>);

    fn free(&mut self, resource: XRenderResource);

    fn flush(&mut self);

    fn resize(&mut self, size: Size);
}

pub struct XRenderBackend {
    device: Box<dyn XRenderDevice>,
    release: ReleaseQueue<XRenderResource>,
    screen: Size,
    last_damage: Region,
}

impl XRenderBackend {
    pub fn new(device: Box<dyn XRenderDevice>, screen: Size) -> Self {
        debug!("Compositor: XRender backend {}x{}", screen.width, screen.height);
        Self {
            device,
            release: ReleaseQueue::new(),
            screen,
            last_damage: Region::new(),
        }
    }

    fn release_pending(&mut self) {
        for resource in self.release.drain() {
            self.device.free(resource);
        }
    }

    fn present(&mut self, screen: Rect) {
        if self.last_damage == Region::from(screen) {
            self.device.present(None);
        } else {
            let rects = self.last_damage.rects().to_vec();
            self.device.present(Some(&rects));
        }
        self.device.flush();
    }
}

/// Translucent black darkens, translucent white brightens. Premultiplied
/// ARGB, `None` at neutral brightness.
fn brightness_overlay(brightness: f64, opacity: f64) -> Option<u32> {
    if brightness == 1.0 {
        return None;
    }
    let (strength, white) = if brightness < 1.0 {
        (1.0 - brightness, false)
    } else {
        (brightness - 1.0, true)
    };
    let alpha = (strength.clamp(0.0, 1.0) * opacity.clamp(0.0, 1.0) * 255.0).round() as u32;
    if alpha == 0 {
        return None;
    }
    let channel = if white { alpha } else { 0 };
    Some(alpha << 24 | channel << 16 | channel << 8 | channel)
}

/// Affine map taking the screen position of a quad to its texels, from the
/// top-left, top-right and bottom-left corners
fn quad_transform(node: &RenderNode<'_>, quad: &WindowQuad) -> Option<Transform> {
    let screen = |i: usize| node.transform.map(quad.verts[i].position());
    let texel = |i: usize| {
        let v = &quad.verts[i];
        let (x, y) = node.texture.to_pixels(v.u, v.v, node.coords);
        PointF::new(x, y)
    };
    let frame = |o: PointF, a: PointF, b: PointF| Transform {
        m11: a.x - o.x,
        m12: a.y - o.y,
        m21: b.x - o.x,
        m22: b.y - o.y,
        dx: o.x,
        dy: o.y,
    };
    let from_screen = frame(screen(0), screen(1), screen(3)).inverted()?;
    Some(frame(texel(0), texel(1), texel(3)) * from_screen)
}

impl TextureBackend for XRenderBackend {
    fn create_texture(&mut self, buffer: &Buffer) -> Result<Texture, BindError> {
        let picture = match &buffer.storage {
            BufferStorage::Shm(image) => {
                let (pixmap, picture) = self.device.upload_image(image).map_err(BindError::Upload)?;
                XRenderPicture::new(picture, buffer.size, Some(pixmap), self.release.clone())
            }
            BufferStorage::X11Pixmap(pixmap) => {
                let picture = self
                    .device
                    .create_picture(*pixmap, buffer.has_alpha)
                    .map_err(BindError::Upload)?;
                XRenderPicture::new(picture, buffer.size, None, self.release.clone())
            }
        };
        Ok(Texture::XRender(picture))
    }

    fn update_texture(&mut self, texture: &mut Texture, buffer: &Buffer, damage: &Region) -> Result<(), BindError> {
        let Texture::XRender(picture) = texture else {
            return Err(BindError::Unsupported);
        };
        // Pictures of client pixmaps always show the current contents
        let (BufferStorage::Shm(image), Some(pixmap)) = (&buffer.storage, picture.pixmap) else {
            return Ok(());
        };
        for rect in damage.iter() {
            self.device
                .update_image(pixmap, image, *rect)
                .map_err(BindError::Upload)?;
        }
        Ok(())
    }
}

impl RenderBackend for XRenderBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::XRender
    }

    fn begin_frame(&mut self, _screen: Rect) -> Region {
        self.release_pending();
        Region::new()
    }

    fn end_frame(&mut self, screen: Rect, valid: &Region, update: &Region) {
        if update.is_empty() {
            return;
        }
        self.last_damage = valid.clone();
        self.present(screen);
    }

    fn supports_buffer_age(&self) -> bool {
        false
    }

    fn buffer_age(&self) -> i32 {
        0
    }

    fn paint_background(&mut self, region: &Region) {
        let region = region & &Region::from(Rect::from_size(self.screen));
        self.device.fill(region.rects(), 0xff00_0000);
    }

    fn draw(&mut self, nodes: &[RenderNode<'_>], params: &DrawParams) {
        let clip = params.scissor.as_ref().map(|s| s.rects().to_vec());
        for node in nodes {
            let Texture::XRender(picture) = node.texture else {
                trace!("Compositor: skipping node without a picture");
                continue;
            };
            if node.opacity <= 0.0 {
                continue;
            }
            let overlay = brightness_overlay(params.brightness, node.opacity);
            for quad in &node.quads {
                let Some(transform) = quad_transform(node, quad) else {
                    continue;
                };
                let dst = node.transform.map_rect(&quad.bounds()).to_aligned_rect();
                let op = Composite {
                    picture: picture.picture,
                    transform,
                    dst,
                    opacity: node.opacity,
                    blend: node.has_alpha || node.opacity < 1.0,
                    clip: clip.clone(),
                };
                self.device.composite(&op);
                if let Some(color) = overlay {
                    self.device.tint(&op, color);
                }
            }
        }
    }

    fn copy_pixels(&mut self, _region: &Region) {
        // The back buffer is a pixmap and keeps its contents
    }

    fn screen_geometry_changed(&mut self, size: Size) {
        self.screen = size;
        self.device.resize(size);
    }
}

impl Drop for XRenderBackend {
    fn drop(&mut self) {
        self.release_pending();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::compositor::pixmap::tests::shm_buffer;
    use crate::compositor::quads::{QuadKind, WindowQuadList};
    use crate::compositor::texture::CoordinateType;
    use crate::shared::geometry::RectF;

    #[derive(Default)]
    struct FakeDevice {
        log: Rc<RefCell<Vec<String>>>,
        composites: Rc<RefCell<Vec<Composite>>>,
        next_id: u32,
    }

    impl XRenderDevice for FakeDevice {
        fn create_picture(&mut self, pixmap: u32, _has_alpha: bool) -> Result<u32, String> {
            Ok(pixmap + 100)
        }

        fn upload_image(&mut self, _image: &Image) -> Result<(u32, u32), String> {
            self.next_id += 2;
            Ok((self.next_id - 1, self.next_id))
        }

        fn update_image(&mut self, pixmap: u32, _image: &Image, rect: Rect) -> Result<(), String> {
            self.log.borrow_mut().push(format!("update {} {:?}", pixmap, rect));
            Ok(())
        }

        fn fill(&mut self, rects: &[Rect], _color: u32) {
            self.log.borrow_mut().push(format!("fill {}", rects.len()));
        }

        fn composite(&mut self, op: &Composite) {
            self.composites.borrow_mut().push(op.clone());
        }

        fn tint(&mut self, op: &Composite, color: u32) {
            self.log.borrow_mut().push(format!("tint {} {:#010x}", op.picture, color));
        }

        fn present(&mut self, clip: Option<&[Rect]>) {
            self.log
                .borrow_mut()
                .push(format!("present {:?}", clip.map(|c| c.len())));
        }

        fn free(&mut self, resource: XRenderResource) {
            self.log.borrow_mut().push(format!("free {:?}", resource));
        }

        fn flush(&mut self) {}

        fn resize(&mut self, _size: Size) {}
    }

    const SCREEN: Rect = Rect::new(0, 0, 100, 100);

    #[test]
    fn test_region_present_is_clipped() {
        let device = FakeDevice::default();
        let log = device.log.clone();
        let mut xr = XRenderBackend::new(Box::new(device), SCREEN.size());
        xr.end_frame(SCREEN, &Region::from(Rect::new(0, 0, 10, 10)), &Region::new());
        assert!(log.borrow().is_empty());

        xr.end_frame(SCREEN, &Region::from(Rect::new(0, 0, 10, 10)), &Region::from(Rect::new(0, 0, 10, 10)));
        xr.end_frame(SCREEN, &Region::from(SCREEN), &Region::from(SCREEN));
        assert_eq!(*log.borrow(), vec!["present Some(1)".to_string(), "present None".to_string()]);
    }

    #[test]
    fn test_uploaded_pictures_free_their_pixmap() {
        let device = FakeDevice::default();
        let log = device.log.clone();
        let mut xr = XRenderBackend::new(Box::new(device), SCREEN.size());
        let buffer = shm_buffer(1, Size::new(8, 8), 0xff000000);
        let mut texture = xr.create_texture(&buffer).unwrap();
        xr.update_texture(&mut texture, &buffer, &Region::from(Rect::new(1, 1, 2, 2)))
            .unwrap();
        drop(texture);
        xr.begin_frame(SCREEN);
        assert_eq!(
            *log.borrow(),
            vec![
                format!("update 1 {:?}", Rect::new(1, 1, 2, 2)),
                "free Picture(2)".to_string(),
                "free Pixmap(1)".to_string(),
            ]
        );
    }

    #[test]
    fn test_quad_transform_maps_screen_to_texels() {
        let device = FakeDevice::default();
        let composites = device.composites.clone();
        let mut xr = XRenderBackend::new(Box::new(device), SCREEN.size());
        let texture = xr
            .create_texture(&Buffer::x11_pixmap(1, 7, Size::new(20, 20), true))
            .unwrap();
        let quads: WindowQuadList = [WindowQuad::from_rect(
            QuadKind::Contents,
            0,
            RectF::new(0.0, 0.0, 10.0, 10.0),
            RectF::new(5.0, 5.0, 10.0, 10.0),
        )]
        .into_iter()
        .collect();
        let node = RenderNode {
            texture: &texture,
            quads,
            transform: Transform::translation(30.0, 40.0),
            opacity: 1.0,
            has_alpha: true,
            coords: CoordinateType::Unnormalized,
        };
        xr.draw(std::slice::from_ref(&node), &DrawParams::default());

        let composites = composites.borrow();
        assert_eq!(composites.len(), 1);
        let op = &composites[0];
        assert_eq!(op.picture, 107);
        assert_eq!(op.dst, Rect::new(30, 40, 10, 10));
        assert!(op.blend);
        assert_eq!(op.transform.map(PointF::new(30.0, 40.0)), PointF::new(5.0, 5.0));
        assert_eq!(op.transform.map(PointF::new(40.0, 50.0)), PointF::new(15.0, 15.0));
    }

    #[test]
    fn test_brightness_overlay_colors() {
        assert_eq!(brightness_overlay(1.0, 1.0), None);
        assert_eq!(brightness_overlay(0.5, 1.0), Some(0x8000_0000));
        assert_eq!(brightness_overlay(1.5, 1.0), Some(0x8080_8080));
        // Fades with the window
        assert_eq!(brightness_overlay(0.5, 0.5), Some(0x4000_0000));
    }

    #[test]
    fn test_dimmed_draw_tints_each_quad() {
        let device = FakeDevice::default();
        let log = device.log.clone();
        let composites = device.composites.clone();
        let mut xr = XRenderBackend::new(Box::new(device), SCREEN.size());
        let texture = xr
            .create_texture(&Buffer::x11_pixmap(1, 7, Size::new(20, 20), false))
            .unwrap();
        let r = RectF::new(0.0, 0.0, 20.0, 20.0);
        let node = RenderNode {
            texture: &texture,
            quads: [WindowQuad::from_rect(QuadKind::Contents, 0, r, r)].into_iter().collect(),
            transform: Transform::default(),
            opacity: 1.0,
            has_alpha: false,
            coords: CoordinateType::Unnormalized,
        };

        xr.draw(std::slice::from_ref(&node), &DrawParams::default());
        assert_eq!(composites.borrow().len(), 1);
        assert!(log.borrow().is_empty());

        let params = DrawParams {
            brightness: 0.5,
            ..DrawParams::default()
        };
        xr.draw(std::slice::from_ref(&node), &params);
        assert_eq!(composites.borrow().len(), 2);
        assert_eq!(*log.borrow(), vec!["tint 107 0x80000000".to_string()]);
    }
}

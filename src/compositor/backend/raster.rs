//! Software backend
//!
//! Render nodes are rasterized on the CPU into a premultiplied ARGB32 back
//! buffer which a `RasterOutput` puts on screen. The back buffer is never
//! invalidated between frames, so no buffer age bookkeeping is needed.

use tracing::{debug, trace};

use super::{BackendKind, DrawParams, RenderBackend};
use crate::compositor::pixmap::{Buffer, BufferStorage, TextureBackend};
use crate::compositor::quads::WindowQuad;
use crate::compositor::region::Region;
use crate::compositor::render_node::RenderNode;
use crate::compositor::texture::Texture;
use crate::error::BindError;
use crate::shared::geometry::{Point, PointF, Rect, RectF, Size};
use crate::shared::image::{blend_over, modulate, Image};

const BACKGROUND: u32 = 0xff00_0000;

/// Where finished frames go
pub trait RasterOutput {
    /// Put `region` of `image` on screen
    fn present(&mut self, image: &Image, region: &Region);

    /// Read `rect` of an X11 pixmap into an image of the rect's size
    fn read_pixmap(&mut self, pixmap: u32, rect: Rect) -> Result<Image, String>;

    fn resize(&mut self, _size: Size) {}
}

pub struct RasterBackend {
    output: Box<dyn RasterOutput>,
    back: Image,
}

impl RasterBackend {
    pub fn new(output: Box<dyn RasterOutput>, screen: Size) -> Self {
        debug!("Compositor: raster backend {}x{}", screen.width, screen.height);
        Self {
            output,
            back: Image::filled(screen, BACKGROUND),
        }
    }

    pub fn back_buffer(&self) -> &Image {
        &self.back
    }

    fn screen(&self) -> Rect {
        self.back.rect()
    }

    fn draw_quad(&mut self, node: &RenderNode<'_>, image: &Image, quad: &WindowQuad, clip: Rect, params: &DrawParams) {
        let Some(inverse) = node.transform.inverted() else {
            return;
        };
        let bounds = quad.bounds();
        if !bounds.is_valid() {
            return;
        }
        let target = node.transform.map_rect(&bounds);
        let x0 = (target.left().floor() as i32).max(clip.left());
        let y0 = (target.top().floor() as i32).max(clip.top());
        let x1 = (target.right().ceil() as i32).min(clip.right());
        let y1 = (target.bottom().ceil() as i32).min(clip.bottom());
        let blend = node.has_alpha || node.opacity < 1.0;

        for y in y0..y1 {
            for x in x0..x1 {
                let local = inverse.map(PointF::new(x as f64 + 0.5, y as f64 + 0.5));
                let Some((u, v)) = interpolate_uv(quad, &bounds, local) else {
                    continue;
                };
                let (px, py) = node.texture.to_pixels(u, v, node.coords);
                let texel = image.pixel(px.floor() as i32, py.floor() as i32);
                let src = modulate(texel, node.opacity, params.brightness, params.saturation);
                let dst = if blend { blend_over(self.back.pixel(x, y), src) } else { src };
                self.back.set_pixel(x, y, dst);
            }
        }
    }
}

/// Texture coordinate at `p` inside an axis-aligned quad. Interpolates the
/// four corners so quads with swapped texture axes sample correctly.
fn interpolate_uv(quad: &WindowQuad, bounds: &RectF, p: PointF) -> Option<(f64, f64)> {
    if p.x < bounds.left() || p.x >= bounds.right() || p.y < bounds.top() || p.y >= bounds.bottom() {
        return None;
    }
    let s = (p.x - bounds.left()) / bounds.width;
    let t = (p.y - bounds.top()) / bounds.height;
    let [a, b, c, d] = quad.verts;
    let weights = [(1.0 - s) * (1.0 - t), s * (1.0 - t), s * t, (1.0 - s) * t];
    let u = weights[0] * a.u + weights[1] * b.u + weights[2] * c.u + weights[3] * d.u;
    let v = weights[0] * a.v + weights[1] * b.v + weights[2] * c.v + weights[3] * d.v;
    Some((u, v))
}

impl TextureBackend for RasterBackend {
    fn create_texture(&mut self, buffer: &Buffer) -> Result<Texture, BindError> {
        let image = match &buffer.storage {
            BufferStorage::Shm(image) => (**image).clone(),
            BufferStorage::X11Pixmap(pixmap) => self
                .output
                .read_pixmap(*pixmap, Rect::from_size(buffer.size))
                .map_err(BindError::Upload)?,
        };
        Ok(Texture::Raster(image))
    }

    fn update_texture(&mut self, texture: &mut Texture, buffer: &Buffer, damage: &Region) -> Result<(), BindError> {
        let Texture::Raster(target) = texture else {
            return Err(BindError::Unsupported);
        };
        match &buffer.storage {
            BufferStorage::Shm(image) => {
                for rect in damage.iter() {
                    target.copy_from(image, *rect, rect.top_left());
                }
            }
            BufferStorage::X11Pixmap(pixmap) => {
                let bounds = Rect::from_size(buffer.size);
                for rect in damage.iter() {
                    let rect = rect.intersected(&bounds);
                    if rect.is_empty() {
                        continue;
                    }
                    let part = self.output.read_pixmap(*pixmap, rect).map_err(BindError::Upload)?;
                    target.copy_from(&part, part.rect(), rect.top_left());
                }
            }
        }
        Ok(())
    }
}

impl RenderBackend for RasterBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Raster
    }

    fn begin_frame(&mut self, screen: Rect) -> Region {
        if screen.size() != self.back.size() {
            self.screen_geometry_changed(screen.size());
        }
        Region::new()
    }

    fn end_frame(&mut self, _screen: Rect, valid: &Region, update: &Region) {
        if update.is_empty() {
            return;
        }
        let region = valid & &Region::from(self.screen());
        trace!("Compositor: presenting {} raster rects", region.rect_count());
        self.output.present(&self.back, &region);
    }

    fn supports_buffer_age(&self) -> bool {
        false
    }

    fn buffer_age(&self) -> i32 {
        0
    }

    fn paint_background(&mut self, region: &Region) {
        let region = region & &Region::from(self.screen());
        for rect in region.iter() {
            self.back.fill_rect(*rect, BACKGROUND);
        }
    }

    fn draw(&mut self, nodes: &[RenderNode<'_>], params: &DrawParams) {
        let screen = self.screen();
        let clips: Vec<Rect> = match &params.scissor {
            Some(scissor) => (scissor & &Region::from(screen)).rects().to_vec(),
            None => vec![screen],
        };
        for node in nodes {
            let Texture::Raster(image) = node.texture else {
                trace!("Compositor: skipping node without a raster texture");
                continue;
            };
            if node.opacity <= 0.0 {
                continue;
            }
            for quad in &node.quads {
                for clip in &clips {
                    self.draw_quad(node, image, quad, *clip, params);
                }
            }
        }
    }

    fn copy_pixels(&mut self, _region: &Region) {
        // The back buffer already holds the previous frame
    }

    fn screen_geometry_changed(&mut self, size: Size) {
        let mut back = Image::filled(size, BACKGROUND);
        back.copy_from(&self.back, self.back.rect(), Point::default());
        self.back = back;
        self.output.resize(size);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::compositor::quads::{QuadKind, WindowQuadList, WindowVertex};
    use crate::compositor::texture::CoordinateType;
    use crate::shared::transform::Transform;

    #[derive(Default)]
    pub struct FakeOutput {
        pub presented: Rc<RefCell<Vec<Region>>>,
        pub reads: Rc<RefCell<Vec<Rect>>>,
        pub fail_reads: bool,
    }

    impl RasterOutput for FakeOutput {
        fn present(&mut self, _image: &Image, region: &Region) {
            self.presented.borrow_mut().push(region.clone());
        }

        fn read_pixmap(&mut self, _pixmap: u32, rect: Rect) -> Result<Image, String> {
            if self.fail_reads {
                return Err("BadDrawable".into());
            }
            self.reads.borrow_mut().push(rect);
            Ok(Image::filled(rect.size(), 0xffff0000))
        }
    }

    const RED: u32 = 0xffff0000;
    const GREEN: u32 = 0xff00ff00;

    fn quad(rect: RectF, uv: RectF) -> WindowQuadList {
        [WindowQuad::from_rect(QuadKind::Contents, 0, rect, uv)].into_iter().collect()
    }

    fn node<'a>(texture: &'a Texture, quads: WindowQuadList, transform: Transform, opacity: f64) -> RenderNode<'a> {
        RenderNode {
            texture,
            quads,
            transform,
            opacity,
            has_alpha: false,
            coords: CoordinateType::Unnormalized,
        }
    }

    #[test]
    fn test_translated_quad_lands_at_offset() {
        let mut raster = RasterBackend::new(Box::new(FakeOutput::default()), Size::new(20, 20));
        let texture = Texture::Raster(Image::filled(Size::new(10, 10), RED));
        let r = RectF::new(0.0, 0.0, 10.0, 10.0);
        let n = node(&texture, quad(r, r), Transform::translation(5.0, 5.0), 1.0);
        raster.draw(std::slice::from_ref(&n), &DrawParams::default());

        let back = raster.back_buffer();
        assert_eq!(back.pixel(5, 5), RED);
        assert_eq!(back.pixel(14, 14), RED);
        assert_eq!(back.pixel(4, 5), BACKGROUND);
        assert_eq!(back.pixel(15, 15), BACKGROUND);
    }

    #[test]
    fn test_scaled_quad_samples_nearest() {
        let mut raster = RasterBackend::new(Box::new(FakeOutput::default()), Size::new(20, 20));
        let mut image = Image::filled(Size::new(2, 1), RED);
        image.set_pixel(1, 0, GREEN);
        let texture = Texture::Raster(image);
        let n = node(
            &texture,
            quad(RectF::new(0.0, 0.0, 2.0, 1.0), RectF::new(0.0, 0.0, 2.0, 1.0)),
            Transform::scaling(10.0, 10.0),
            1.0,
        );
        raster.draw(std::slice::from_ref(&n), &DrawParams::default());
        assert_eq!(raster.back_buffer().pixel(9, 9), RED);
        assert_eq!(raster.back_buffer().pixel(10, 9), GREEN);
        assert_eq!(raster.back_buffer().pixel(10, 10), BACKGROUND);
    }

    #[test]
    fn test_translucent_node_blends_over_background() {
        let mut raster = RasterBackend::new(Box::new(FakeOutput::default()), Size::new(4, 4));
        let texture = Texture::Raster(Image::filled(Size::new(4, 4), 0xffffffff));
        let r = RectF::new(0.0, 0.0, 4.0, 4.0);
        let n = node(&texture, quad(r, r), Transform::identity(), 0.5);
        raster.draw(std::slice::from_ref(&n), &DrawParams::default());
        assert_eq!(raster.back_buffer().pixel(0, 0), 0xff808080);
    }

    #[test]
    fn test_scissor_limits_drawing() {
        let mut raster = RasterBackend::new(Box::new(FakeOutput::default()), Size::new(10, 10));
        let texture = Texture::Raster(Image::filled(Size::new(10, 10), RED));
        let r = RectF::new(0.0, 0.0, 10.0, 10.0);
        let n = node(&texture, quad(r, r), Transform::identity(), 1.0);
        let params = DrawParams {
            scissor: Some(Region::from(Rect::new(0, 0, 5, 10))),
            ..DrawParams::default()
        };
        raster.draw(std::slice::from_ref(&n), &params);
        assert_eq!(raster.back_buffer().pixel(4, 4), RED);
        assert_eq!(raster.back_buffer().pixel(5, 4), BACKGROUND);
    }

    #[test]
    fn test_swapped_uv_axes() {
        // Texture x runs down the screen
        let mut raster = RasterBackend::new(Box::new(FakeOutput::default()), Size::new(1, 2));
        let mut image = Image::filled(Size::new(2, 1), RED);
        image.set_pixel(1, 0, GREEN);
        let texture = Texture::Raster(image);
        let mut q = WindowQuad::new(
            QuadKind::Decoration,
            0,
            [
                WindowVertex::new(0.0, 0.0, 0.0, 0.0),
                WindowVertex::new(1.0, 0.0, 0.0, 1.0),
                WindowVertex::new(1.0, 2.0, 2.0, 1.0),
                WindowVertex::new(0.0, 2.0, 2.0, 0.0),
            ],
        );
        q.uv_swapped = true;
        let n = node(&texture, [q].into_iter().collect(), Transform::identity(), 1.0);
        raster.draw(std::slice::from_ref(&n), &DrawParams::default());
        assert_eq!(raster.back_buffer().pixel(0, 0), RED);
        assert_eq!(raster.back_buffer().pixel(0, 1), GREEN);
    }

    #[test]
    fn test_present_only_with_update() {
        let output = FakeOutput::default();
        let presented = output.presented.clone();
        let mut raster = RasterBackend::new(Box::new(output), Size::new(10, 10));
        let screen = Rect::new(0, 0, 10, 10);
        assert!(raster.begin_frame(screen).is_empty());
        raster.end_frame(screen, &Region::from(screen), &Region::new());
        assert!(presented.borrow().is_empty());

        raster.end_frame(screen, &Region::from(Rect::new(5, 5, 20, 20)), &Region::from(screen));
        assert_eq!(*presented.borrow(), vec![Region::from(Rect::new(5, 5, 5, 5))]);
    }

    #[test]
    fn test_x11_pixmaps_are_read_back() {
        let mut raster = RasterBackend::new(Box::new(FakeOutput::default()), Size::new(10, 10));
        let buffer = Buffer::x11_pixmap(1, 42, Size::new(3, 3), false);
        let texture = raster.create_texture(&buffer).unwrap();
        assert!(matches!(&texture, Texture::Raster(img) if img.pixel(1, 1) == RED));

        let failing = FakeOutput {
            fail_reads: true,
            ..FakeOutput::default()
        };
        let mut raster = RasterBackend::new(Box::new(failing), Size::new(10, 10));
        assert!(matches!(raster.create_texture(&buffer), Err(BindError::Upload(_))));
    }

    #[test]
    fn test_x11_pixmap_damage_reads_only_damaged_rects() {
        let output = FakeOutput::default();
        let reads = output.reads.clone();
        let mut raster = RasterBackend::new(Box::new(output), Size::new(10, 10));
        let buffer = Buffer::x11_pixmap(1, 42, Size::new(8, 8), false);
        let mut texture = Texture::Raster(Image::filled(Size::new(8, 8), GREEN));

        let damage = Region::from_rects([Rect::new(0, 0, 2, 2), Rect::new(5, 5, 10, 10)]);
        raster.update_texture(&mut texture, &buffer, &damage).unwrap();

        // Clipped to the pixmap
        let expected = &damage & &Region::from(Rect::new(0, 0, 8, 8));
        let fetched: Region = reads.borrow().iter().copied().collect();
        assert_eq!(fetched, expected);
        assert_eq!(reads.borrow().iter().map(Rect::area).sum::<i64>(), expected.area());

        let Texture::Raster(image) = &texture else {
            unreachable!();
        };
        assert_eq!(image.pixel(1, 1), RED);
        assert_eq!(image.pixel(7, 7), RED);
        assert_eq!(image.pixel(3, 3), GREEN);
    }
}

//! XRender device: pictures on the X server, composited into a back buffer
//! pixmap and copied to the overlay window on present.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};
use x11rb::connection::Connection;
use x11rb::protocol::render::{
    self, ChangePictureAux, Color, ConnectionExt as RenderExt, CreatePictureAux, Fixed, PictOp, PictType,
    Pictformat, Pictforminfo, Picture,
};
use x11rb::protocol::xproto::{ConnectionExt as _, CreateGCAux, Gcontext, Rectangle, SubwindowMode};
use x11rb::rust_connection::RustConnection;
use x11rb::NONE;

use super::put_image;
use crate::compositor::backend::xrender::{Composite, XRenderDevice};
use crate::compositor::texture::XRenderResource;
use crate::error::BackendError;
use crate::shared::geometry::{Point, Rect, Size};
use crate::shared::image::Image;
use crate::shared::transform::Transform;

fn fixed(v: f64) -> Fixed {
    (v * 65536.0).round() as Fixed
}

fn x_rects(rects: &[Rect]) -> Vec<Rectangle> {
    rects
        .iter()
        .map(|r| Rectangle {
            x: r.x as i16,
            y: r.y as i16,
            width: r.width as u16,
            height: r.height as u16,
        })
        .collect()
}

/// 0xAARRGGBB to a 16 bit per channel render color
fn render_color(argb: u32) -> Color {
    let channel = |shift: u32| ((argb >> shift) & 0xff) as u16 * 0x101;
    Color {
        red: channel(16),
        green: channel(8),
        blue: channel(0),
        alpha: channel(24),
    }
}

fn render_transform(t: &Transform) -> render::Transform {
    render::Transform {
        matrix11: fixed(t.m11),
        matrix12: fixed(t.m21),
        matrix13: fixed(t.dx),
        matrix21: fixed(t.m12),
        matrix22: fixed(t.m22),
        matrix23: fixed(t.dy),
        matrix31: 0,
        matrix32: 0,
        matrix33: fixed(1.0),
    }
}

fn find_format(formats: &[Pictforminfo], depth: u8, alpha: bool) -> Option<Pictformat> {
    formats
        .iter()
        .find(|f| {
            f.type_ == PictType::DIRECT
                && f.depth == depth
                && f.direct.red_shift == 16
                && f.direct.green_shift == 8
                && f.direct.blue_shift == 0
                && (f.direct.alpha_mask != 0) == alpha
        })
        .map(|f| f.id)
}

pub struct X11XRenderDevice {
    conn: Arc<RustConnection>,
    root: u32,
    root_depth: u8,
    size: Size,
    argb32: Pictformat,
    rgb24: Pictformat,
    visual_format: Pictformat,
    /// Overlay window picture
    front: Picture,
    back_pixmap: u32,
    back: Picture,
    /// GC for depth 32 upload pixmaps
    gc: Gcontext,
    gc_pixmap: u32,
    /// Solid fill pictures keyed by color
    solids: HashMap<[u16; 4], Picture>,
    back_clipped: bool,
}

impl X11XRenderDevice {
    pub fn new(
        conn: Arc<RustConnection>,
        root: u32,
        root_depth: u8,
        root_visual: u32,
        overlay: u32,
        size: Size,
    ) -> Result<Self, BackendError> {
        let err = |e: &dyn std::fmt::Display| BackendError::init("xrender", e.to_string());

        let version = conn
            .render_query_version(0, 11)
            .map_err(|_| BackendError::MissingExtension("RENDER"))?
            .reply()
            .map_err(|e| err(&e))?;
        debug!(
            "Compositor: RENDER {}.{}",
            version.major_version, version.minor_version
        );

        let formats = conn
            .render_query_pict_formats()
            .map_err(|e| err(&e))?
            .reply()
            .map_err(|e| err(&e))?;
        let argb32 = find_format(&formats.formats, 32, true).ok_or_else(|| err(&"no ARGB32 format"))?;
        let rgb24 = find_format(&formats.formats, 24, false).ok_or_else(|| err(&"no RGB24 format"))?;
        let visual_format = formats
            .screens
            .iter()
            .flat_map(|s| &s.depths)
            .flat_map(|d| &d.visuals)
            .find(|v| v.visual == root_visual)
            .map(|v| v.format)
            .unwrap_or(rgb24);

        let front = conn.generate_id().map_err(|e| err(&e))?;
        conn.render_create_picture(
            front,
            overlay,
            visual_format,
            &CreatePictureAux::new().subwindowmode(SubwindowMode::INCLUDE_INFERIORS),
        )
        .map_err(|e| err(&e))?;

        let gc_pixmap = conn.generate_id().map_err(|e| err(&e))?;
        conn.create_pixmap(32, gc_pixmap, root, 1, 1).map_err(|e| err(&e))?;
        let gc = conn.generate_id().map_err(|e| err(&e))?;
        conn.create_gc(gc, gc_pixmap, &CreateGCAux::new().graphics_exposures(0))
            .map_err(|e| err(&e))?;

        let mut device = Self {
            conn,
            root,
            root_depth,
            size,
            argb32,
            rgb24,
            visual_format,
            front,
            back_pixmap: NONE,
            back: NONE,
            gc,
            gc_pixmap,
            solids: HashMap::new(),
            back_clipped: false,
        };
        device.create_back_buffer().map_err(|e| err(&e))?;
        device.conn.flush().map_err(|e| err(&e))?;
        Ok(device)
    }

    fn create_back_buffer(&mut self) -> Result<(), x11rb::errors::ReplyOrIdError> {
        let pixmap = self.conn.generate_id()?;
        self.conn.create_pixmap(
            self.root_depth,
            pixmap,
            self.root,
            self.size.width as u16,
            self.size.height as u16,
        )?;
        let picture = self.conn.generate_id()?;
        self.conn
            .render_create_picture(picture, pixmap, self.visual_format, &CreatePictureAux::new())?;
        self.back_pixmap = pixmap;
        self.back = picture;
        self.back_clipped = false;
        Ok(())
    }

    fn free_back_buffer(&mut self) {
        if self.back != NONE {
            let _ = self.conn.render_free_picture(self.back);
            let _ = self.conn.free_pixmap(self.back_pixmap);
            self.back = NONE;
            self.back_pixmap = NONE;
        }
    }

    fn solid(&mut self, color: Color) -> Option<Picture> {
        let key = [color.red, color.green, color.blue, color.alpha];
        if let Some(picture) = self.solids.get(&key) {
            return Some(*picture);
        }
        let picture = self.conn.generate_id().ok()?;
        self.conn.render_create_solid_fill(picture, color).ok()?;
        self.solids.insert(key, picture);
        Some(picture)
    }

    fn mask(&mut self, opacity: f64) -> Option<Picture> {
        let alpha = (opacity.clamp(0.0, 1.0) * 65535.0).round() as u16;
        self.solid(Color {
            red: 0,
            green: 0,
            blue: 0,
            alpha,
        })
    }

    fn set_back_clip(&mut self, clip: Option<&[Rect]>) {
        let result = match clip {
            Some(rects) => {
                self.back_clipped = true;
                self.conn
                    .render_set_picture_clip_rectangles(self.back, 0, 0, &x_rects(rects))
                    .map(|_| ())
            }
            None if self.back_clipped => {
                self.back_clipped = false;
                self.conn
                    .render_change_picture(self.back, &ChangePictureAux::new().clipmask(NONE))
                    .map(|_| ())
            }
            None => Ok(()),
        };
        if let Err(e) = result {
            debug!("Compositor: failed to set back buffer clip: {}", e);
        }
    }
}

impl XRenderDevice for X11XRenderDevice {
    fn create_picture(&mut self, pixmap: u32, has_alpha: bool) -> Result<u32, String> {
        let format = if has_alpha { self.argb32 } else { self.rgb24 };
        let picture = self.conn.generate_id().map_err(|e| e.to_string())?;
        self.conn
            .render_create_picture(picture, pixmap, format, &CreatePictureAux::new())
            .map_err(|e| e.to_string())?;
        let filter = b"bilinear";
        self.conn
            .render_set_picture_filter(picture, filter, &[])
            .map_err(|e| e.to_string())?;
        Ok(picture)
    }

    fn upload_image(&mut self, image: &Image) -> Result<(u32, u32), String> {
        let size = image.size();
        let pixmap = self.conn.generate_id().map_err(|e| e.to_string())?;
        self.conn
            .create_pixmap(32, pixmap, self.root, size.width as u16, size.height as u16)
            .map_err(|e| e.to_string())?;
        put_image(&self.conn, pixmap, self.gc, 32, image, image.rect(), Point::default()).map_err(|e| e.to_string())?;
        let picture = self.create_picture(pixmap, true)?;
        Ok((pixmap, picture))
    }

    fn update_image(&mut self, pixmap: u32, image: &Image, rect: Rect) -> Result<(), String> {
        put_image(&self.conn, pixmap, self.gc, 32, image, rect, Point::new(rect.x, rect.y)).map_err(|e| e.to_string())
    }

    fn fill(&mut self, rects: &[Rect], color: u32) {
        if rects.is_empty() {
            return;
        }
        self.set_back_clip(None);
        if let Err(e) = self
            .conn
            .render_fill_rectangles(PictOp::SRC, self.back, render_color(color), &x_rects(rects))
        {
            debug!("Compositor: fill failed: {}", e);
        }
    }

    fn composite(&mut self, op: &Composite) {
        if op.dst.is_empty() {
            return;
        }
        self.set_back_clip(op.clip.as_deref());
        let mask = if op.opacity < 1.0 { self.mask(op.opacity) } else { None };
        let pict_op = if op.blend { PictOp::OVER } else { PictOp::SRC };

        let result = self
            .conn
            .render_set_picture_transform(op.picture, render_transform(&op.transform))
            .and_then(|_| {
                // Source coordinates are screen coordinates; the picture
                // transform maps them to texels
                self.conn.render_composite(
                    pict_op,
                    op.picture,
                    mask.unwrap_or(NONE),
                    self.back,
                    op.dst.x as i16,
                    op.dst.y as i16,
                    0,
                    0,
                    op.dst.x as i16,
                    op.dst.y as i16,
                    op.dst.width as u16,
                    op.dst.height as u16,
                )
            });
        if let Err(e) = result {
            debug!("Compositor: composite of picture {} failed: {}", op.picture, e);
        }
    }

    fn tint(&mut self, op: &Composite, color: u32) {
        if op.dst.is_empty() {
            return;
        }
        let Some(fill) = self.solid(render_color(color)) else {
            return;
        };
        self.set_back_clip(op.clip.as_deref());
        // The window picture is the mask so the overlay follows its shape
        let result = self
            .conn
            .render_set_picture_transform(op.picture, render_transform(&op.transform))
            .and_then(|_| {
                self.conn.render_composite(
                    PictOp::OVER,
                    fill,
                    op.picture,
                    self.back,
                    0,
                    0,
                    op.dst.x as i16,
                    op.dst.y as i16,
                    op.dst.x as i16,
                    op.dst.y as i16,
                    op.dst.width as u16,
                    op.dst.height as u16,
                )
            });
        if let Err(e) = result {
            debug!("Compositor: tint of picture {} failed: {}", op.picture, e);
        }
    }

    fn present(&mut self, clip: Option<&[Rect]>) {
        let result = match clip {
            Some(rects) => self
                .conn
                .render_set_picture_clip_rectangles(self.front, 0, 0, &x_rects(rects))
                .map(|_| ()),
            None => self
                .conn
                .render_change_picture(self.front, &ChangePictureAux::new().clipmask(NONE))
                .map(|_| ()),
        };
        let result = result.and_then(|_| {
            self.conn
                .render_composite(
                    PictOp::SRC,
                    self.back,
                    NONE,
                    self.front,
                    0,
                    0,
                    0,
                    0,
                    0,
                    0,
                    self.size.width as u16,
                    self.size.height as u16,
                )
                .map(|_| ())
        });
        if let Err(e) = result {
            debug!("Compositor: XRender present failed: {}", e);
        }
        trace!("Compositor: XRender present {:?}", clip.map(<[Rect]>::len));
    }

    fn free(&mut self, resource: XRenderResource) {
        let result = match resource {
            XRenderResource::Picture(picture) => self.conn.render_free_picture(picture).map(|_| ()),
            XRenderResource::Pixmap(pixmap) => self.conn.free_pixmap(pixmap).map(|_| ()),
        };
        if let Err(e) = result {
            debug!("Compositor: failed to free {:?}: {}", resource, e);
        }
    }

    fn flush(&mut self) {
        let _ = self.conn.flush();
    }

    fn resize(&mut self, size: Size) {
        self.free_back_buffer();
        self.size = size;
        if let Err(e) = self.create_back_buffer() {
            debug!("Compositor: failed to recreate XRender back buffer: {}", e);
        }
    }
}

impl Drop for X11XRenderDevice {
    fn drop(&mut self) {
        self.free_back_buffer();
        for picture in self.solids.values() {
            let _ = self.conn.render_free_picture(*picture);
        }
        let _ = self.conn.render_free_picture(self.front);
        let _ = self.conn.free_gc(self.gc);
        let _ = self.conn.free_pixmap(self.gc_pixmap);
        let _ = self.conn.flush();
    }
}

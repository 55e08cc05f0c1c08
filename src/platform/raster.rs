//! Software output: finished frames are written to the overlay window with
//! PutImage, window pixmaps are read back with GetImage.

use std::sync::Arc;

use tracing::debug;
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{ConnectionExt as _, CreateGCAux, Gcontext, ImageFormat};
use x11rb::rust_connection::RustConnection;

use super::put_image;
use crate::compositor::backend::raster::RasterOutput;
use crate::compositor::region::Region;
use crate::error::BackendError;
use crate::shared::geometry::{Point, Rect};
use crate::shared::image::Image;

/// Read `rect` of a drawable into an ARGB image. Depth 24 contents are made
/// opaque.
pub(crate) fn get_image(conn: &RustConnection, drawable: u32, rect: Rect) -> Result<Image, String> {
    if rect.is_empty() {
        return Err(format!("empty read of drawable {}", drawable));
    }
    let reply = conn
        .get_image(
            ImageFormat::Z_PIXMAP,
            drawable,
            rect.x as i16,
            rect.y as i16,
            rect.width as u16,
            rect.height as u16,
            !0,
        )
        .map_err(|e| e.to_string())?
        .reply()
        .map_err(|e| e.to_string())?;

    let opaque = if reply.depth == 32 { 0 } else { 0xff00_0000 };
    let pixels: Vec<u32> = reply
        .data
        .chunks_exact(4)
        .map(|px| u32::from_ne_bytes([px[0], px[1], px[2], px[3]]) | opaque)
        .collect();
    Image::from_pixels(rect.size(), pixels).ok_or_else(|| format!("short image reply for drawable {}", drawable))
}

pub struct X11RasterOutput {
    conn: Arc<RustConnection>,
    window: u32,
    gc: Gcontext,
    depth: u8,
}

impl X11RasterOutput {
    pub fn new(conn: Arc<RustConnection>, window: u32, depth: u8) -> Result<Self, BackendError> {
        let x11 = |e: &dyn std::fmt::Display| BackendError::init("raster", e.to_string());
        let gc = conn.generate_id().map_err(|e| x11(&e))?;
        conn.create_gc(gc, window, &CreateGCAux::new().graphics_exposures(0))
            .map_err(|e| x11(&e))?;
        debug!("Compositor: raster output on window {} (depth {})", window, depth);
        Ok(Self { conn, window, gc, depth })
    }
}

impl RasterOutput for X11RasterOutput {
    fn present(&mut self, image: &Image, region: &Region) {
        for rect in region.iter() {
            let result = put_image(&self.conn, self.window, self.gc, self.depth, image, *rect, Point::new(rect.x, rect.y));
            if let Err(e) = result {
                debug!("Compositor: raster present failed: {}", e);
                return;
            }
        }
        let _ = self.conn.flush();
    }

    fn read_pixmap(&mut self, pixmap: u32, rect: Rect) -> Result<Image, String> {
        get_image(&self.conn, pixmap, rect)
    }
}

impl Drop for X11RasterOutput {
    fn drop(&mut self) {
        let _ = self.conn.free_gc(self.gc);
    }
}

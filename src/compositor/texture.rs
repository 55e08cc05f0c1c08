//! Backend textures
//!
//! A `Texture` is whatever the active backend samples from: a GL texture
//! name, a CPU image, or an XRender picture. GPU and server-side handles
//! are not freed from `Drop` directly (there may be no current context);
//! they are queued and the owning backend releases them at the start of
//! the next frame.

use std::cell::RefCell;
use std::rc::Rc;

use crate::shared::geometry::Size;
use crate::shared::image::Image;

/// Texture coordinate convention of a render node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateType {
    /// `0.0..=1.0` across the texture
    Normalized,
    /// Texture pixels
    Unnormalized,
}

/// Deferred destruction queue shared between textures and their backend
#[derive(Debug)]
pub struct ReleaseQueue<T>(Rc<RefCell<Vec<T>>>);

impl<T> Clone for ReleaseQueue<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Default for ReleaseQueue<T> {
    fn default() -> Self {
        Self(Rc::new(RefCell::new(Vec::new())))
    }
}

impl<T> ReleaseQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: T) {
        self.0.borrow_mut().push(item);
    }

    pub fn drain(&self) -> Vec<T> {
        std::mem::take(&mut *self.0.borrow_mut())
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlResource {
    Texture(u32),
    /// GLX pixmap bound with texture-from-pixmap
    GlxPixmap(u64),
}

#[derive(Debug)]
pub struct GlTexture {
    pub name: u32,
    pub size: Size,
    /// Row 0 is the top of the image
    pub y_inverted: bool,
    pub glx_pixmap: Option<u64>,
    release: ReleaseQueue<GlResource>,
}

impl GlTexture {
    pub fn new(name: u32, size: Size, y_inverted: bool, release: ReleaseQueue<GlResource>) -> Self {
        Self {
            name,
            size,
            y_inverted,
            glx_pixmap: None,
            release,
        }
    }

    pub fn with_glx_pixmap(mut self, glx_pixmap: u64) -> Self {
        self.glx_pixmap = Some(glx_pixmap);
        self
    }
}

impl Drop for GlTexture {
    fn drop(&mut self) {
        if let Some(pixmap) = self.glx_pixmap.take() {
            self.release.push(GlResource::GlxPixmap(pixmap));
        }
        self.release.push(GlResource::Texture(self.name));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XRenderResource {
    Picture(u32),
    Pixmap(u32),
}

#[derive(Debug)]
pub struct XRenderPicture {
    pub picture: u32,
    pub size: Size,
    /// Server pixmap created by us for uploaded images; `None` when the
    /// picture wraps a client-owned window pixmap
    pub pixmap: Option<u32>,
    release: ReleaseQueue<XRenderResource>,
}

impl XRenderPicture {
    pub fn new(picture: u32, size: Size, pixmap: Option<u32>, release: ReleaseQueue<XRenderResource>) -> Self {
        Self {
            picture,
            size,
            pixmap,
            release,
        }
    }
}

impl Drop for XRenderPicture {
    fn drop(&mut self) {
        self.release.push(XRenderResource::Picture(self.picture));
        if let Some(pixmap) = self.pixmap.take() {
            self.release.push(XRenderResource::Pixmap(pixmap));
        }
    }
}

#[derive(Debug)]
pub enum Texture {
    OpenGl(GlTexture),
    Raster(Image),
    XRender(XRenderPicture),
}

impl Texture {
    pub fn size(&self) -> Size {
        match self {
            Texture::OpenGl(t) => t.size,
            Texture::Raster(img) => img.size(),
            Texture::XRender(p) => p.size,
        }
    }

    pub fn is_null(&self) -> bool {
        self.size().is_empty()
    }

    /// Map a texture coordinate of the given convention to normalized GL
    /// coordinates, accounting for the texture orientation
    pub fn normalize(&self, u: f64, v: f64, coords: CoordinateType) -> (f64, f64) {
        let size = self.size();
        let (u, mut v) = match coords {
            CoordinateType::Normalized => (u, v),
            CoordinateType::Unnormalized => (
                u / size.width.max(1) as f64,
                v / size.height.max(1) as f64,
            ),
        };
        if let Texture::OpenGl(t) = self {
            if !t.y_inverted {
                v = 1.0 - v;
            }
        }
        (u, v)
    }

    /// Map a texture coordinate to texture pixels
    pub fn to_pixels(&self, u: f64, v: f64, coords: CoordinateType) -> (f64, f64) {
        match coords {
            CoordinateType::Unnormalized => (u, v),
            CoordinateType::Normalized => {
                let size = self.size();
                (u * size.width as f64, v * size.height as f64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropped_gl_texture_is_queued_for_release() {
        let queue = ReleaseQueue::new();
        let tex = GlTexture::new(7, Size::new(4, 4), true, queue.clone()).with_glx_pixmap(99);
        drop(Texture::OpenGl(tex));
        assert_eq!(
            queue.drain(),
            vec![GlResource::GlxPixmap(99), GlResource::Texture(7)]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_normalize_flips_non_inverted_gl_textures() {
        let queue = ReleaseQueue::new();
        let tex = Texture::OpenGl(GlTexture::new(1, Size::new(100, 50), false, queue));
        assert_eq!(tex.normalize(50.0, 0.0, CoordinateType::Unnormalized), (0.5, 1.0));
        let raster = Texture::Raster(Image::new(Size::new(100, 50)));
        assert_eq!(raster.normalize(50.0, 25.0, CoordinateType::Unnormalized), (0.5, 0.5));
        assert_eq!(raster.to_pixels(0.5, 0.5, CoordinateType::Normalized), (50.0, 25.0));
    }
}

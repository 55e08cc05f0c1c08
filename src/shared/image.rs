//! CPU-side premultiplied ARGB32 images.
//!
//! Used for SHM client buffers, the software rasterizer's back buffer,
//! shadow atlases and decoration parts painted by the worker pool.

use super::geometry::{Point, Rect, Size};

/// Premultiplied `0xAARRGGBB` pixels, row-major, stride == width
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Image {
    size: Size,
    data: Vec<u32>,
}

impl Image {
    /// Fully transparent image
    pub fn new(size: Size) -> Self {
        Self::filled(size, 0)
    }

    pub fn filled(size: Size, color: u32) -> Self {
        let size = if size.is_empty() { Size::default() } else { size };
        Self {
            size,
            data: vec![color; size.area() as usize],
        }
    }

    /// Wrap existing pixels. Returns `None` if the pixel count does not match.
    pub fn from_pixels(size: Size, data: Vec<u32>) -> Option<Self> {
        if size.is_empty() || data.len() != size.area() as usize {
            return None;
        }
        Some(Self { size, data })
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn width(&self) -> i32 {
        self.size.width
    }

    pub fn height(&self) -> i32 {
        self.size.height
    }

    pub fn rect(&self) -> Rect {
        Rect::from_size(self.size)
    }

    pub fn is_null(&self) -> bool {
        self.size.is_empty()
    }

    pub fn pixels(&self) -> &[u32] {
        &self.data
    }

    pub fn pixels_mut(&mut self) -> &mut [u32] {
        &mut self.data
    }

    /// Raw bytes for uploads (native endian, which is BGRA on little endian)
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    fn index(&self, x: i32, y: i32) -> usize {
        (y * self.size.width + x) as usize
    }

    pub fn pixel(&self, x: i32, y: i32) -> u32 {
        if !self.rect().contains_point(Point::new(x, y)) {
            return 0;
        }
        self.data[self.index(x, y)]
    }

    pub fn set_pixel(&mut self, x: i32, y: i32, color: u32) {
        if self.rect().contains_point(Point::new(x, y)) {
            let i = self.index(x, y);
            self.data[i] = color;
        }
    }

    /// Pixels of one row clipped to `[x0, x1)`
    pub fn fill_rect(&mut self, rect: Rect, color: u32) {
        let r = rect.intersected(&self.rect());
        for y in r.top()..r.bottom() {
            let start = self.index(r.left(), y);
            self.data[start..start + r.width as usize].fill(color);
        }
    }

    /// Copy `src_rect` of `src` to `dst` in this image, replacing pixels
    pub fn copy_from(&mut self, src: &Image, src_rect: Rect, dst: Point) {
        let clipped = src_rect.intersected(&src.rect());
        // Clipping the source origin moves the destination along with it
        let dst = Point::new(dst.x + clipped.x - src_rect.x, dst.y + clipped.y - src_rect.y);
        let src_rect = clipped;
        let target = Rect::new(dst.x, dst.y, src_rect.width, src_rect.height).intersected(&self.rect());
        if target.is_empty() {
            return;
        }
        let sx = src_rect.x + (target.x - dst.x);
        let sy = src_rect.y + (target.y - dst.y);
        for row in 0..target.height {
            let s = src.index(sx, sy + row);
            let d = self.index(target.x, target.y + row);
            let len = target.width as usize;
            self.data[d..d + len].copy_from_slice(&src.data[s..s + len]);
        }
    }

    /// Sub-image covering `rect` (clipped to the image)
    pub fn copy(&self, rect: Rect) -> Image {
        let rect = rect.intersected(&self.rect());
        let mut out = Image::new(rect.size());
        out.copy_from(self, rect, Point::default());
        out
    }

    /// Source-over composite of `src` at `dst`
    pub fn draw_image(&mut self, src: &Image, dst: Point) {
        let target = Rect::new(dst.x, dst.y, src.width(), src.height()).intersected(&self.rect());
        for y in target.top()..target.bottom() {
            for x in target.left()..target.right() {
                let s = src.pixel(x - dst.x, y - dst.y);
                let i = self.index(x, y);
                self.data[i] = blend_over(self.data[i], s);
            }
        }
    }

    /// Swap the x and y axes. Vertical decoration parts are stored this way in
    /// the atlas so that every part is laid out horizontally.
    pub fn transposed(&self) -> Image {
        let mut out = Image::new(self.size.transposed());
        for y in 0..self.height() {
            for x in 0..self.width() {
                out.set_pixel(y, x, self.pixel(x, y));
            }
        }
        out
    }

    /// Replicate the edge pixels of `viewport` into the rest of the image,
    /// so bilinear sampling at part edges never bleeds into padding.
    pub fn clamp_to(&mut self, viewport: Rect) {
        let viewport = viewport.intersected(&self.rect());
        if viewport.is_empty() {
            return;
        }
        for y in 0..self.height() {
            let sy = y.clamp(viewport.top(), viewport.bottom() - 1);
            for x in 0..self.width() {
                if viewport.contains_point(Point::new(x, y)) {
                    continue;
                }
                let sx = x.clamp(viewport.left(), viewport.right() - 1);
                let v = self.pixel(sx, sy);
                self.set_pixel(x, y, v);
            }
        }
    }

    /// True when every pixel only carries alpha (shadow tiles usually do)
    pub fn is_alpha_only(&self) -> bool {
        self.data.iter().all(|p| p & 0x00ff_ffff == 0)
    }
}

pub fn alpha(p: u32) -> u32 {
    p >> 24
}

/// Premultiplied source-over
pub fn blend_over(dst: u32, src: u32) -> u32 {
    let sa = alpha(src);
    if sa == 0xff {
        return src;
    }
    if sa == 0 && src == 0 {
        return dst;
    }
    let inv = 255 - sa;
    let mut out = 0u32;
    for shift in [0u32, 8, 16, 24] {
        let s = (src >> shift) & 0xff;
        let d = (dst >> shift) & 0xff;
        let c = (s + (d * inv + 127) / 255).min(255);
        out |= c << shift;
    }
    out
}

/// Apply opacity, brightness and saturation to a premultiplied pixel
pub fn modulate(p: u32, opacity: f64, brightness: f64, saturation: f64) -> u32 {
    if opacity >= 1.0 && brightness == 1.0 && saturation == 1.0 {
        return p;
    }
    let a = alpha(p) as f64;
    let mut r = ((p >> 16) & 0xff) as f64;
    let mut g = ((p >> 8) & 0xff) as f64;
    let mut b = (p & 0xff) as f64;
    if saturation != 1.0 {
        let luma = 0.2126 * r + 0.7152 * g + 0.0722 * b;
        r = luma + (r - luma) * saturation;
        g = luma + (g - luma) * saturation;
        b = luma + (b - luma) * saturation;
    }
    let rgb_factor = opacity * brightness;
    let ch = |v: f64, f: f64| -> u32 { (v * f).round().clamp(0.0, 255.0) as u32 };
    let a_out = ch(a, opacity);
    // Premultiplied colors must never exceed alpha
    let clamp_to_alpha = |c: u32| c.min(a_out);
    (a_out << 24)
        | (clamp_to_alpha(ch(r, rgb_factor)) << 16)
        | (clamp_to_alpha(ch(g, rgb_factor)) << 8)
        | clamp_to_alpha(ch(b, rgb_factor))
}

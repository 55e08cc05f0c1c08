//! Window shadows
//!
//! A shadow is made of eight tiles around the window. Tiles are packed into
//! one atlas texture and drawn with normalized texture coordinates. Shadows
//! provided by a decoration already come as one image; windows sharing the
//! same decoration shadow share its texture through `ShadowTextureCache`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use tracing::{debug, trace};

use super::pixmap::{Buffer, TextureBackend};
use super::quads::{QuadKind, WindowQuad, WindowQuadList};
use super::region::Region;
use super::texture::Texture;
use crate::error::BindError;
use crate::shared::geometry::{Margins, Point, PointF, Rect, RectF, Size};
use crate::shared::image::Image;

/// Number of tiles; also the number of pixmaps in the X11 shadow property
pub const ELEMENT_COUNT: usize = 8;

/// Tile index, in X11 property order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowElement {
    Top = 0,
    TopRight = 1,
    Right = 2,
    BottomRight = 3,
    Bottom = 4,
    BottomLeft = 5,
    Left = 6,
    TopLeft = 7,
}

/// Shadow drawn by a decoration: one image split into tiles around an
/// inner rect
#[derive(Debug)]
pub struct DecorationShadow {
    image: Rc<Image>,
    padding: Margins,
    elements: [Rect; ELEMENT_COUNT],
}

impl DecorationShadow {
    pub fn new(image: Image, padding: Margins, inner: Rect) -> Self {
        let (w, h) = (image.width(), image.height());
        let (r, b) = (inner.right(), inner.bottom());
        let mut elements = [Rect::default(); ELEMENT_COUNT];
        elements[ShadowElement::TopLeft as usize] = Rect::new(0, 0, inner.x, inner.y);
        elements[ShadowElement::Top as usize] = Rect::new(inner.x, 0, inner.width, inner.y);
        elements[ShadowElement::TopRight as usize] = Rect::new(r, 0, w - r, inner.y);
        elements[ShadowElement::Right as usize] = Rect::new(r, inner.y, w - r, inner.height);
        elements[ShadowElement::BottomRight as usize] = Rect::new(r, b, w - r, h - b);
        elements[ShadowElement::Bottom as usize] = Rect::new(inner.x, b, inner.width, h - b);
        elements[ShadowElement::BottomLeft as usize] = Rect::new(0, b, inner.x, h - b);
        elements[ShadowElement::Left as usize] = Rect::new(0, inner.y, inner.x, inner.height);
        Self {
            image: Rc::new(image),
            padding,
            elements,
        }
    }

    pub fn padding(&self) -> Margins {
        self.padding
    }

    pub fn image(&self) -> &Rc<Image> {
        &self.image
    }

    pub fn element_size(&self, element: ShadowElement) -> Size {
        self.elements[element as usize].size()
    }
}

/// Decoration shadow textures keyed by shadow identity. Entries are weak:
/// the texture lives as long as one `Shadow` holds it.
#[derive(Debug, Clone, Default)]
pub struct ShadowTextureCache {
    entries: Rc<RefCell<HashMap<usize, Weak<Texture>>>>,
}

impl ShadowTextureCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_texture(
        &self,
        shadow: &Rc<DecorationShadow>,
        backend: &mut dyn TextureBackend,
    ) -> Result<Rc<Texture>, BindError> {
        let key = Rc::as_ptr(shadow) as usize;
        let mut entries = self.entries.borrow_mut();
        entries.retain(|_, texture| texture.strong_count() > 0);

        if let Some(texture) = entries.get(&key).and_then(Weak::upgrade) {
            return Ok(texture);
        }

        let buffer = Buffer::shm(0, shadow.image.clone(), true);
        let texture = Rc::new(backend.create_texture(&buffer)?);
        entries.insert(key, Rc::downgrade(&texture));
        debug!("Compositor: created shared decoration shadow texture {:?}", buffer.size);
        Ok(texture)
    }

    /// Number of shadow textures still alive
    pub fn len(&self) -> usize {
        self.entries
            .borrow()
            .values()
            .filter(|t| t.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
enum Source {
    Elements(Box<[Image; ELEMENT_COUNT]>),
    Decoration(Rc<DecorationShadow>),
}

#[derive(Debug)]
pub struct Shadow {
    source: Source,
    /// Extent of the shadow outside the window on each side
    offsets: Margins,
    window_size: Size,
    region: Region,
    quads: WindowQuadList,
    texture: Option<Rc<Texture>>,
}

impl Shadow {
    /// Shadow from eight tiles. Fails when all tiles are empty.
    pub fn from_elements(elements: [Image; ELEMENT_COUNT], offsets: Margins, window_size: Size) -> Option<Self> {
        let mut shadow = Self {
            source: Source::Elements(Box::new(elements)),
            offsets,
            window_size,
            region: Region::new(),
            quads: WindowQuadList::new(),
            texture: None,
        };
        if shadow.atlas_size().is_empty() {
            return None;
        }
        shadow.update_region();
        shadow.build_quads();
        Some(shadow)
    }

    pub fn from_decoration(shadow: Rc<DecorationShadow>, window_size: Size) -> Self {
        let offsets = shadow.padding;
        let mut shadow = Self {
            source: Source::Decoration(shadow),
            offsets,
            window_size,
            region: Region::new(),
            quads: WindowQuadList::new(),
            texture: None,
        };
        shadow.update_region();
        shadow.build_quads();
        shadow
    }

    /// Shadow from the `_KDE_NET_WM_SHADOW` property: eight pixmaps followed
    /// by the top, right, bottom and left offsets. `fetch` reads a pixmap.
    pub fn from_x11_property(
        data: &[u32],
        mut fetch: impl FnMut(u32) -> Option<Image>,
        window_size: Size,
    ) -> Option<Self> {
        if data.len() < ELEMENT_COUNT + 4 {
            return None;
        }
        let mut elements: [Image; ELEMENT_COUNT] = Default::default();
        for (element, &pixmap) in elements.iter_mut().zip(&data[..ELEMENT_COUNT]) {
            *element = fetch(pixmap)?;
        }
        let offset = |i: usize| data[ELEMENT_COUNT + i] as i32;
        let offsets = Margins::new(offset(3), offset(0), offset(1), offset(2));
        Self::from_elements(elements, offsets, window_size)
    }

    pub fn offsets(&self) -> Margins {
        self.offsets
    }

    /// Area covered by the shadow, frame-local
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Quads with normalized texture coordinates, frame-local
    pub fn quads(&self) -> &WindowQuadList {
        &self.quads
    }

    pub fn texture(&self) -> Option<&Texture> {
        self.texture.as_deref()
    }

    pub fn is_decoration_shadow(&self) -> bool {
        matches!(self.source, Source::Decoration(_))
    }

    pub fn geometry_changed(&mut self, size: Size) {
        if self.window_size == size {
            return;
        }
        self.window_size = size;
        self.update_region();
        self.build_quads();
    }

    pub fn element_size(&self, element: ShadowElement) -> Size {
        match &self.source {
            Source::Elements(elements) => elements[element as usize].size(),
            Source::Decoration(shadow) => shadow.element_size(element),
        }
    }

    /// Create the texture if needed
    pub fn prepare(&mut self, backend: &mut dyn TextureBackend, cache: &ShadowTextureCache) -> Result<(), BindError> {
        if self.texture.is_some() {
            return Ok(());
        }
        let texture = match &self.source {
            Source::Decoration(shadow) => cache.get_texture(shadow, backend)?,
            Source::Elements(_) => {
                let atlas = self.compose_atlas();
                Rc::new(backend.create_texture(&Buffer::shm(0, Rc::new(atlas), true))?)
            }
        };
        self.texture = Some(texture);
        Ok(())
    }

    /// Drop the texture; it is recreated by the next `prepare`
    pub fn release_texture(&mut self) {
        self.texture = None;
    }

    fn margins(&self) -> Margins {
        use ShadowElement::*;
        let w = |e| self.element_size(e).width;
        let h = |e| self.element_size(e).height;
        Margins::new(
            w(TopLeft).max(w(Left)).max(w(BottomLeft)),
            h(TopLeft).max(h(Top)).max(h(TopRight)),
            w(TopRight).max(w(Right)).max(w(BottomRight)),
            h(BottomRight).max(h(Bottom)).max(h(BottomLeft)),
        )
    }

    fn atlas_size(&self) -> Size {
        use ShadowElement::*;
        if let Source::Decoration(shadow) = &self.source {
            return shadow.image.size();
        }
        let m = self.margins();
        let size = |e| self.element_size(e);
        Size::new(
            m.left + size(Top).width.max(size(Bottom).width) + m.right,
            m.top + size(Left).height.max(size(Right).height) + m.bottom,
        )
    }

    fn compose_atlas(&self) -> Image {
        use ShadowElement::*;
        let Source::Elements(elements) = &self.source else {
            return Image::new(self.atlas_size());
        };
        let size = self.atlas_size();
        let m = self.margins();
        let (w, h) = (size.width, size.height);
        let el = |e: ShadowElement| &elements[e as usize];

        let mut atlas = Image::new(size);
        let mut put = |e: ShadowElement, x: i32, y: i32| {
            let src = el(e);
            atlas.copy_from(src, src.rect(), Point::new(x, y));
        };
        put(TopLeft, 0, 0);
        put(Top, m.left, 0);
        put(TopRight, w - el(TopRight).width(), 0);
        put(Left, 0, m.top);
        put(Right, w - el(Right).width(), m.top);
        put(BottomLeft, 0, h - el(BottomLeft).height());
        put(Bottom, m.left, h - el(Bottom).height());
        put(BottomRight, w - el(BottomRight).width(), h - el(BottomRight).height());
        atlas
    }

    fn update_region(&mut self) {
        let (w, h) = (self.window_size.width, self.window_size.height);
        let o = self.offsets;
        let top = Rect::new(0, -o.top, w, o.top);
        let right = Rect::new(w, -o.top, o.right, h + o.top + o.bottom);
        let bottom = Rect::new(0, h, w, o.bottom);
        let left = Rect::new(-o.left, -o.top, o.left, h + o.top + o.bottom);
        self.region = Region::from_rects([top, right, bottom, left]);
    }

    fn build_quads(&mut self) {
        use ShadowElement::*;
        self.quads = WindowQuadList::new();
        let mut quads = WindowQuadList::new();

        // Tiny windows get no shadow
        if self.window_size.width < 5 || self.window_size.height < 5 {
            self.region = Region::new();
            return;
        }

        let size = |e| self.element_size(e);
        let sizef = |e| {
            let s: Size = size(e);
            (s.width as f64, s.height as f64)
        };
        let m = self.margins();
        let (ml, mt, mr, mb) = (m.left as f64, m.top as f64, m.right as f64, m.bottom as f64);
        let o = self.offsets;
        let outer = RectF::from_points(
            PointF::new(-o.left as f64, -o.top as f64),
            PointF::new(
                (self.window_size.width + o.right) as f64,
                (self.window_size.height + o.bottom) as f64,
            ),
        );
        let atlas = self.atlas_size();
        let (width, height) = (atlas.width as f64, atlas.height as f64);

        let corner = |e: ShadowElement, x: f64, y: f64, fallback: PointF| {
            if size(e).is_empty() {
                RectF::new(fallback.x, fallback.y, 0.0, 0.0)
            } else {
                let (w, h) = sizef(e);
                RectF::new(x, y, w, h)
            }
        };

        let mut top_left = corner(
            TopLeft,
            outer.left(),
            outer.top(),
            PointF::new(outer.left() + ml, outer.top() + mt),
        );
        let mut top_right = corner(
            TopRight,
            outer.right() - sizef(TopRight).0,
            outer.top(),
            PointF::new(outer.right() - mr, outer.top() + mt),
        );
        let mut bottom_right = corner(
            BottomRight,
            outer.right() - sizef(BottomRight).0,
            outer.bottom() - sizef(BottomRight).1,
            PointF::new(outer.right() - mr, outer.bottom() - mb),
        );
        let mut bottom_left = corner(
            BottomLeft,
            outer.left(),
            outer.bottom() - sizef(BottomLeft).1,
            PointF::new(outer.left() + ml, outer.bottom() - mb),
        );

        // Corners may overlap on small windows; split the overlap evenly
        distribute_horizontally(&mut top_left, &mut top_right);
        distribute_horizontally(&mut bottom_left, &mut bottom_right);
        distribute_vertically(&mut top_left, &mut bottom_left);
        distribute_vertically(&mut top_right, &mut bottom_right);

        let mut push = |rect: RectF, tx1: f64, ty1: f64, tx2: f64, ty2: f64| {
            if rect.is_valid() {
                quads.push(WindowQuad::from_rect(
                    QuadKind::Shadow,
                    0,
                    rect,
                    RectF::from_points(PointF::new(tx1, ty1), PointF::new(tx2, ty2)),
                ));
            }
        };

        push(top_left, 0.0, 0.0, top_left.width / width, top_left.height / height);
        push(top_right, 1.0 - top_right.width / width, 0.0, 1.0, top_right.height / height);
        push(
            bottom_right,
            1.0 - bottom_right.width / width,
            1.0 - bottom_right.height / height,
            1.0,
            1.0,
        );
        push(bottom_left, 0.0, 1.0 - bottom_left.height / height, bottom_left.width / width, 1.0);

        let mut top = RectF::from_points(
            PointF::new(top_left.right(), outer.top()),
            PointF::new(top_right.left(), outer.top() + sizef(Top).1),
        );
        let mut right = RectF::from_points(
            PointF::new(outer.right() - sizef(Right).0, top_right.bottom()),
            PointF::new(outer.right(), bottom_right.top()),
        );
        let mut bottom = RectF::from_points(
            PointF::new(bottom_left.right(), outer.bottom() - sizef(Bottom).1),
            PointF::new(bottom_right.left(), outer.bottom()),
        );
        let mut left = RectF::from_points(
            PointF::new(outer.left(), top_left.bottom()),
            PointF::new(outer.left() + sizef(Left).0, bottom_left.top()),
        );

        distribute_horizontally(&mut left, &mut right);
        distribute_vertically(&mut top, &mut bottom);

        let tx = ml / width;
        let ty = mt / height;
        push(top, tx, 0.0, tx + sizef(Top).0 / width, top.height / height);
        push(right, 1.0 - right.width / width, ty, 1.0, ty + sizef(Right).1 / height);
        push(bottom, tx, 1.0 - bottom.height / height, tx + sizef(Bottom).0 / width, 1.0);
        push(left, 0.0, ty, left.width / width, ty + sizef(Left).1 / height);

        trace!("Compositor: shadow has {} quads", quads.len());
        self.quads = quads;
    }
}

fn distribute_horizontally(left: &mut RectF, right: &mut RectF) {
    if left.right() > right.left() {
        let bounded_right = left.right().min(right.right());
        let bounded_left = left.left().max(right.left());
        let half_overlap = (bounded_right - bounded_left) / 2.0;
        left.set_right(bounded_right - half_overlap);
        right.set_left(bounded_left + half_overlap);
    }
}

fn distribute_vertically(top: &mut RectF, bottom: &mut RectF) {
    if top.bottom() > bottom.top() {
        let bounded_bottom = top.bottom().min(bottom.bottom());
        let bounded_top = top.top().max(bottom.top());
        let half_overlap = (bounded_bottom - bounded_top) / 2.0;
        top.set_bottom(bounded_bottom - half_overlap);
        bottom.set_top(bounded_top + half_overlap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::pixmap::tests::FakeUploader;

    fn tiles(size: i32) -> [Image; ELEMENT_COUNT] {
        std::array::from_fn(|_| Image::filled(Size::new(size, size), 0x80000000))
    }

    fn decoration_shadow() -> Rc<DecorationShadow> {
        Rc::new(DecorationShadow::new(
            Image::filled(Size::new(64, 64), 0x40000000),
            Margins::new(16, 16, 16, 16),
            Rect::new(24, 24, 16, 16),
        ))
    }

    #[test]
    fn test_shadow_region_surrounds_window() {
        let shadow = Shadow::from_elements(tiles(10), Margins::new(10, 10, 10, 10), Size::new(100, 50)).unwrap();
        let region = shadow.region();
        assert_eq!(region.bounding_rect(), Rect::new(-10, -10, 120, 70));
        assert!(!region.intersects_rect(&Rect::new(0, 0, 100, 50)));
        assert_eq!(shadow.quads().len(), 8);
    }

    #[test]
    fn test_tiny_window_has_no_shadow() {
        let shadow = Shadow::from_elements(tiles(10), Margins::new(10, 10, 10, 10), Size::new(4, 50)).unwrap();
        assert!(shadow.quads().is_empty());
        assert!(shadow.region().is_empty());
    }

    #[test]
    fn test_overlapping_corners_are_redistributed() {
        // 20px corners with 10px offsets on a 10px wide window overlap by 10px
        let shadow = Shadow::from_elements(tiles(20), Margins::new(10, 10, 10, 10), Size::new(10, 100)).unwrap();
        let corners: Vec<RectF> = shadow.quads().iter().take(2).map(WindowQuad::bounds).collect();
        assert_eq!(corners[0].right(), corners[1].left());
        assert_eq!(corners[0].right(), 5.0);
    }

    #[test]
    fn test_property_layout() {
        let data = [1, 2, 3, 4, 5, 6, 7, 8, 11, 12, 13, 14];
        let mut fetched = Vec::new();
        let shadow = Shadow::from_x11_property(
            &data,
            |pixmap| {
                fetched.push(pixmap);
                Some(Image::filled(Size::new(4, 4), 0xff000000))
            },
            Size::new(100, 100),
        )
        .unwrap();
        assert_eq!(fetched, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(shadow.offsets(), Margins::new(14, 11, 12, 13));
        assert!(Shadow::from_x11_property(&data[..11], |_| None, Size::new(1, 1)).is_none());
    }

    #[test]
    fn test_decoration_shadows_share_one_texture() {
        let mut uploader = FakeUploader::default();
        let cache = ShadowTextureCache::new();
        let deco = decoration_shadow();

        let mut a = Shadow::from_decoration(deco.clone(), Size::new(100, 100));
        let mut b = Shadow::from_decoration(deco.clone(), Size::new(200, 80));
        a.prepare(&mut uploader, &cache).unwrap();
        b.prepare(&mut uploader, &cache).unwrap();

        assert_eq!(uploader.created, 1);
        assert!(std::ptr::eq(a.texture().unwrap(), b.texture().unwrap()));

        drop(a);
        assert_eq!(cache.len(), 1);
        assert!(b.texture().is_some());

        drop(b);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_atlas_places_tiles_at_edges() {
        let mut elements = tiles(4);
        elements[ShadowElement::BottomRight as usize] = Image::filled(Size::new(4, 4), 0xff0000ff);
        let shadow = Shadow::from_elements(elements, Margins::new(4, 4, 4, 4), Size::new(50, 50)).unwrap();
        let atlas = shadow.compose_atlas();
        assert_eq!(atlas.size(), Size::new(12, 12));
        assert_eq!(atlas.pixel(11, 11), 0xff0000ff);
        assert_eq!(atlas.pixel(0, 0), 0x80000000);
    }
}

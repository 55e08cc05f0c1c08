//! Render nodes
//!
//! A window is painted as a small item tree: shadow (z = -2), decoration
//! (z = -1), the main surface (z = 0) and its sub-surfaces (z > 0). The tree
//! is flattened each frame into render nodes, one per textured item, in
//! back-to-front order. Backends only ever see render nodes.

use super::effects::{PaintMask, WindowPaintData};
use super::pixmap::WindowPixmap;
use super::quads::{QuadKind, WindowQuad, WindowQuadList};
use super::region::Region;
use super::texture::{CoordinateType, Texture};
use super::window::SceneWindow;
use crate::shared::geometry::{PointF, Rect, RectF};
use crate::shared::transform::Transform;

/// One paintable unit of a frame
#[derive(Debug)]
pub struct RenderNode<'a> {
    pub texture: &'a Texture,
    /// Quads in item-local coordinates
    pub quads: WindowQuadList,
    /// Item-local to screen
    pub transform: Transform,
    pub opacity: f64,
    /// Needs blending even at full opacity
    pub has_alpha: bool,
    pub coords: CoordinateType,
}

#[derive(Debug)]
pub enum ItemContent<'a> {
    /// Only groups children
    None,
    Shadow(&'a Texture),
    Decoration(&'a Texture),
    Surface(&'a WindowPixmap),
    /// Contents before the last resize, faded out
    PreviousSurface(&'a Texture),
}

#[derive(Debug)]
pub struct Item<'a> {
    pub z: i32,
    pub position: PointF,
    pub transform: Transform,
    pub opacity: f64,
    pub visible: bool,
    pub quads: WindowQuadList,
    pub content: ItemContent<'a>,
    pub children: Vec<Item<'a>>,
}

impl<'a> Item<'a> {
    pub fn new(z: i32, content: ItemContent<'a>, quads: WindowQuadList) -> Self {
        Self {
            z,
            position: PointF::default(),
            transform: Transform::identity(),
            opacity: 1.0,
            visible: true,
            quads,
            content,
            children: Vec::new(),
        }
    }

    pub fn with_opacity(mut self, opacity: f64) -> Self {
        self.opacity = opacity;
        self
    }

    /// Children ordered by z; equal z keeps insertion order
    fn sorted_children(&self) -> Vec<&Item<'a>> {
        let mut children: Vec<_> = self.children.iter().collect();
        children.sort_by_key(|c| c.z);
        children
    }
}

/// Clip state shared by one window's node collection
#[derive(Debug, Clone)]
pub struct RenderContext {
    /// Screen-space paint region
    pub clip: Region,
    /// The backend clips with a scissor; quads are left whole
    pub hardware_clipping: bool,
}

impl RenderContext {
    pub fn new(mask: PaintMask, clip: Region) -> Self {
        let transformed = mask.intersects(PaintMask::WINDOW_TRANSFORMED | PaintMask::SCREEN_TRANSFORMED);
        Self {
            hardware_clipping: !clip.is_infinite() && transformed,
            clip,
        }
    }
}

/// Clip `quads` (item-local) against the screen-space clip. Quads fully
/// inside one clip rect are kept whole, the others are split per rect.
pub fn clip_quads(quads: &WindowQuadList, transform: &Transform, ctx: &RenderContext) -> WindowQuadList {
    if ctx.clip.is_infinite() || ctx.hardware_clipping || !transform.is_translation() {
        return quads.clone();
    }

    let offset = transform.offset();
    let (dx, dy) = (offset.x.round() as i32, offset.y.round() as i32);

    let mut out = WindowQuadList::new();
    for quad in quads {
        let quad_rect = RectF::from_points(
            PointF::new(quad.left(), quad.top()),
            PointF::new(quad.right(), quad.bottom()),
        );
        for r in ctx.clip.iter() {
            let clip = RectF::from(r.translated(-dx, -dy));
            let intersected = clip.intersected(&quad_rect);
            if !intersected.is_valid() {
                continue;
            }
            if intersected == quad_rect {
                out.push(quad.clone());
                break;
            }
            out.push(quad.make_sub_quad(
                intersected.left(),
                intersected.top(),
                intersected.right(),
                intersected.bottom(),
            ));
        }
    }
    out
}

/// Flatten `root` into render nodes in paint order
pub fn collect_nodes<'a>(root: &Item<'a>, ctx: &RenderContext) -> Vec<RenderNode<'a>> {
    let mut nodes = Vec::new();
    visit(root, Transform::identity(), 1.0, ctx, &mut nodes);
    nodes
}

fn visit<'a>(
    item: &Item<'a>,
    parent: Transform,
    parent_opacity: f64,
    ctx: &RenderContext,
    nodes: &mut Vec<RenderNode<'a>>,
) {
    let transform = parent * Transform::translation(item.position.x, item.position.y) * item.transform;
    let opacity = parent_opacity * item.opacity;
    let children = item.sorted_children();

    for child in children.iter().filter(|c| c.z < 0 && c.visible) {
        visit(child, transform, opacity, ctx, nodes);
    }

    let leaf = match &item.content {
        ItemContent::None => None,
        ItemContent::Shadow(texture) => Some((*texture, true, CoordinateType::Normalized)),
        ItemContent::Decoration(texture) => Some((*texture, true, CoordinateType::Unnormalized)),
        ItemContent::PreviousSurface(texture) => Some((*texture, true, CoordinateType::Normalized)),
        ItemContent::Surface(pixmap) => pixmap.texture().map(|texture| {
            let has_alpha = pixmap.has_alpha() && !(&pixmap.shape() - pixmap.opaque()).is_empty();
            (texture, has_alpha, CoordinateType::Unnormalized)
        }),
    };
    if let Some((texture, has_alpha, coords)) = leaf {
        let quads = clip_quads(&item.quads, &transform, ctx);
        if !quads.is_empty() {
            nodes.push(RenderNode {
                texture,
                quads,
                transform,
                opacity,
                has_alpha,
                coords,
            });
        }
    }

    for child in children.iter().filter(|c| c.z >= 0 && c.visible) {
        visit(child, transform, opacity, ctx, nodes);
    }
}

/// Opacity of the current contents while the previous ones fade out
pub fn cross_fade_opacity(opacity: f64, progress: f64, has_alpha: bool) -> f64 {
    if progress != 1.0 && (opacity < 0.95 || has_alpha) {
        opacity * (1.0 - (1.0 - progress).powf(1.0 + 2.0 * opacity))
    } else {
        opacity
    }
}

/// Remap pixel-space content UVs from `client` (current buffer) into the
/// previous pixmap's contents rect, normalized to its size
fn remap_to_previous(quads: &WindowQuadList, client: Rect, previous: &WindowPixmap) -> WindowQuadList {
    let old = previous.contents_rect();
    let size = previous.size();
    let (cw, ch) = (client.width.max(1) as f64, client.height.max(1) as f64);
    let (pw, ph) = (size.width.max(1) as f64, size.height.max(1) as f64);

    quads
        .iter()
        .map(|quad| {
            let mut quad: WindowQuad = quad.clone();
            for v in &mut quad.verts {
                let fx = (v.u - client.x as f64) / cw;
                let fy = (v.v - client.y as f64) / ch;
                v.u = (fx * old.width as f64 + old.x as f64) / pw;
                v.v = (fy * old.height as f64 + old.y as f64) / ph;
            }
            quad
        })
        .collect()
}

/// Item tree of `window` as painted with `data`
pub fn window_item<'a>(window: &'a SceneWindow, mask: PaintMask, data: &WindowPaintData) -> Item<'a> {
    let mut root = Item::new(0, ItemContent::None, WindowQuadList::new());
    root.position = window.pos().to_f64();
    if mask.contains(PaintMask::WINDOW_TRANSFORMED) {
        root.transform = data.transform;
    }

    if let Some(texture) = window.shadow().and_then(|s| s.texture()) {
        let quads = data.quads.select(QuadKind::Shadow);
        root.children
            .push(Item::new(-2, ItemContent::Shadow(texture), quads).with_opacity(data.opacity));
    }

    if let Some(texture) = window.decoration_renderer().and_then(|r| r.texture()) {
        let quads = data.quads.select(QuadKind::Decoration);
        root.children
            .push(Item::new(-1, ItemContent::Decoration(texture), quads).with_opacity(data.opacity));
    }

    let Some(pixmap) = window.pixmap() else {
        return root;
    };

    let previous = window
        .previous_pixmap()
        .filter(|_| data.cross_fade_progress != 1.0)
        .and_then(|p| p.texture().map(|t| (p, t)));
    let contents = data.quads.select(QuadKind::Contents);

    let mut id = 0;
    pixmap.visit(&mut |p, _| {
        if !p.is_valid() {
            return;
        }
        let quads: WindowQuadList = contents.iter().filter(|q| q.id == id).cloned().collect();
        let mut opacity = data.opacity;
        if id == 0 && previous.is_some() {
            opacity = cross_fade_opacity(data.opacity, data.cross_fade_progress, window.toplevel().has_alpha);
        }
        root.children
            .push(Item::new(id, ItemContent::Surface(p), quads).with_opacity(opacity));

        if id == 0 {
            if let Some((prev, texture)) = previous {
                let main: WindowQuadList = contents.iter().filter(|q| q.id == 0).cloned().collect();
                let quads = remap_to_previous(&main, window.toplevel().client_rect, prev);
                let opacity = data.opacity * (1.0 - data.cross_fade_progress);
                root.children
                    .push(Item::new(0, ItemContent::PreviousSurface(texture), quads).with_opacity(opacity));
            }
        }
        id += 1;
    });

    root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::pixmap::tests::{shm_buffer, FakeUploader};
    use crate::compositor::window::Toplevel;
    use crate::shared::geometry::Size;
    use crate::shared::image::Image;

    fn raster(w: i32, h: i32) -> Texture {
        Texture::Raster(Image::new(Size::new(w, h)))
    }

    fn quad(x: f64, y: f64, w: f64, h: f64) -> WindowQuad {
        let r = RectF::new(x, y, w, h);
        WindowQuad::from_rect(QuadKind::Contents, 0, r, r)
    }

    fn region_ctx(rect: Rect) -> RenderContext {
        RenderContext::new(PaintMask::SCREEN_REGION, Region::from(rect))
    }

    #[test]
    fn test_quad_outside_clip_emits_no_node() {
        let texture = raster(100, 100);
        let mut root = Item::new(0, ItemContent::Shadow(&texture), WindowQuadList(vec![quad(0.0, 0.0, 10.0, 10.0)]));
        root.position = PointF::new(100.0, 100.0);
        let nodes = collect_nodes(&root, &region_ctx(Rect::new(0, 0, 50, 50)));
        assert!(nodes.is_empty());
    }

    #[test]
    fn test_straddling_quad_is_cut_to_clip() {
        let texture = raster(100, 100);
        let mut root = Item::new(0, ItemContent::Decoration(&texture), WindowQuadList(vec![quad(0.0, 0.0, 40.0, 40.0)]));
        root.position = PointF::new(10.0, 10.0);
        let clip = Rect::new(0, 0, 30, 30);
        let nodes = collect_nodes(&root, &region_ctx(clip));
        assert_eq!(nodes.len(), 1);

        // Item-local clip is the screen clip moved by -position
        let b = nodes[0].quads.0[0].bounds();
        assert_eq!(b, RectF::new(0.0, 0.0, 20.0, 20.0));
        assert!(b.right() <= 40.0 && b.bottom() <= 40.0);
        assert_eq!(nodes[0].quads.0[0].verts[2].u, 20.0);
    }

    #[test]
    fn test_quad_inside_one_rect_is_kept_whole() {
        let texture = raster(100, 100);
        let q = quad(5.0, 5.0, 10.0, 10.0);
        let root = Item::new(0, ItemContent::Shadow(&texture), WindowQuadList(vec![q.clone()]));
        let clip = Region::from_rects([Rect::new(0, 0, 20, 20), Rect::new(40, 0, 20, 20)]);
        let nodes = collect_nodes(&root, &RenderContext::new(PaintMask::empty(), clip));
        assert_eq!(nodes[0].quads.0, vec![q]);
    }

    #[test]
    fn test_transformed_paint_skips_clipping() {
        let texture = raster(100, 100);
        let mut root = Item::new(0, ItemContent::Shadow(&texture), WindowQuadList(vec![quad(0.0, 0.0, 40.0, 40.0)]));
        root.transform = Transform::scaling(2.0, 2.0);
        let nodes = collect_nodes(&root, &region_ctx(Rect::new(0, 0, 10, 10)));
        assert_eq!(nodes[0].quads.len(), 1);
        assert_eq!(nodes[0].quads.0[0].bounds(), RectF::new(0.0, 0.0, 40.0, 40.0));

        let ctx = RenderContext::new(PaintMask::WINDOW_TRANSFORMED, Region::from(Rect::new(0, 0, 10, 10)));
        assert!(ctx.hardware_clipping);
    }

    #[test]
    fn test_children_are_visited_in_z_order() {
        let shadow = raster(10, 10);
        let deco = raster(10, 10);
        let q = || WindowQuadList(vec![quad(0.0, 0.0, 10.0, 10.0)]);
        let mut root = Item::new(0, ItemContent::None, WindowQuadList::new()).with_opacity(0.5);
        root.children.push(Item::new(-1, ItemContent::Decoration(&deco), q()));
        root.children.push(Item::new(-2, ItemContent::Shadow(&shadow), q()).with_opacity(0.5));
        let nodes = collect_nodes(&root, &RenderContext::new(PaintMask::empty(), Region::infinite()));
        assert_eq!(nodes.len(), 2);
        assert!(std::ptr::eq(nodes[0].texture, &shadow));
        assert_eq!(nodes[0].opacity, 0.25);
        assert_eq!(nodes[0].coords, CoordinateType::Normalized);
        assert_eq!(nodes[1].coords, CoordinateType::Unnormalized);
    }

    #[test]
    fn test_cross_fade_opacity() {
        assert_eq!(cross_fade_opacity(0.5, 1.0, false), 0.5);
        // Opaque, no alpha: not faded
        assert_eq!(cross_fade_opacity(1.0, 0.5, false), 1.0);
        let expected = 0.5 * (1.0 - 0.5f64.powf(2.0));
        assert!((cross_fade_opacity(0.5, 0.5, false) - expected).abs() < 1e-12);
        let alpha = 1.0 - 0.5f64.powf(3.0);
        assert!((cross_fade_opacity(1.0, 0.5, true) - alpha).abs() < 1e-12);
    }

    #[test]
    fn test_window_item_with_previous_contents() {
        let mut uploader = FakeUploader::default();
        let mut top = Toplevel::new(1, Rect::new(10, 10, 100, 100));
        top.client_rect = Rect::new(0, 0, 100, 100);
        top.has_alpha = true;
        let mut window = SceneWindow::new(top);
        window.commit(shm_buffer(1, Size::new(100, 100), 0xff000000), &Region::new());
        window.preprocess();
        window.bind(&mut uploader).unwrap();
        window.discard_pixmap();
        // Held by a cross-fading effect across the new pixmap
        window.reference_previous_pixmap();

        let mut top = window.toplevel().clone();
        top.geometry = Rect::new(10, 10, 120, 120);
        top.client_rect = Rect::new(0, 0, 120, 120);
        window.update_toplevel(top);
        window.commit(shm_buffer(2, Size::new(120, 120), 0xffffffff), &Region::new());
        window.preprocess();
        window.bind(&mut uploader).unwrap();
        assert!(window.previous_pixmap().is_some());

        let mut data = WindowPaintData::new(1.0, window.build_quads());
        data.cross_fade_progress = 0.5;
        let item = window_item(&window, PaintMask::empty(), &data);
        let nodes = collect_nodes(&item, &RenderContext::new(PaintMask::empty(), Region::infinite()));
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].opacity, cross_fade_opacity(1.0, 0.5, true));
        assert_eq!(nodes[1].coords, CoordinateType::Normalized);
        assert_eq!(nodes[1].opacity, 0.5);
        // Far corner of the client rect maps onto the previous contents
        let uv = nodes[1].quads.0[0].verts[2];
        assert_eq!((uv.u, uv.v), (1.0, 1.0));
        assert_eq!(nodes[0].transform.offset(), PointF::new(10.0, 10.0));
    }
}

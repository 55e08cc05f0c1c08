//! Decoration rendering
//!
//! The four decoration parts of a window are painted into CPU images by a
//! small worker pool and packed into one atlas. Left and right parts are
//! stored transposed so that every part is laid out horizontally. The atlas
//! is uploaded through the active backend like any other buffer.
//!
//! Atlas layout (1px padding around every part):
//!
//! ```text
//! +--------------------------+
//! | top                      |
//! | bottom                   |
//! | left (transposed)        |
//! | right (transposed)       |
//! +--------------------------+
//! ```

use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};

use super::pixmap::{Buffer, TextureBackend};
use super::quads::{QuadKind, WindowQuad, WindowQuadList, WindowVertex};
use super::region::Region;
use super::shadow::DecorationShadow;
use super::texture::Texture;
use crate::error::BindError;
use crate::shared::geometry::{Margins, Point, Rect, Size};
use crate::shared::image::Image;

const PADDING: i32 = 1;

/// What a painter is asked to draw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaintContext {
    pub frame: Size,
    pub borders: Margins,
    /// Area to paint, frame-local
    pub clip: Rect,
    /// Frame-local position of the target image's top-left pixel
    pub origin: Point,
}

/// Draws decoration pixels. Runs on worker threads.
pub trait DecorationPainter: Send + Sync {
    fn paint(&self, target: &mut Image, ctx: &PaintContext);
}

/// Solid titlebar and border colors
#[derive(Debug, Clone, Copy)]
pub struct FlatDecorationPainter {
    pub titlebar: u32,
    pub border: u32,
}

impl DecorationPainter for FlatDecorationPainter {
    fn paint(&self, target: &mut Image, ctx: &PaintContext) {
        let titlebar = Rect::new(0, 0, ctx.frame.width, ctx.borders.top).intersected(&ctx.clip);
        target.fill_rect(ctx.clip.translated(-ctx.origin.x, -ctx.origin.y), self.border);
        target.fill_rect(titlebar.translated(-ctx.origin.x, -ctx.origin.y), self.titlebar);
    }
}

/// Decoration of a window, owned by the window collaborator
pub struct Decoration {
    borders: Margins,
    has_alpha: bool,
    painter: Arc<dyn DecorationPainter>,
    shadow: Option<Rc<DecorationShadow>>,
}

impl Decoration {
    pub fn new(borders: Margins, painter: Arc<dyn DecorationPainter>) -> Self {
        Self {
            borders,
            has_alpha: false,
            painter,
            shadow: None,
        }
    }

    pub fn with_alpha(mut self, has_alpha: bool) -> Self {
        self.has_alpha = has_alpha;
        self
    }

    pub fn with_shadow(mut self, shadow: Rc<DecorationShadow>) -> Self {
        self.shadow = Some(shadow);
        self
    }

    pub fn borders(&self) -> Margins {
        self.borders
    }

    pub fn has_alpha(&self) -> bool {
        self.has_alpha
    }

    pub fn painter(&self) -> &Arc<dyn DecorationPainter> {
        &self.painter
    }

    pub fn shadow(&self) -> Option<&Rc<DecorationShadow>> {
        self.shadow.as_ref()
    }
}

impl std::fmt::Debug for Decoration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoration")
            .field("borders", &self.borders)
            .field("has_alpha", &self.has_alpha)
            .field("shadow", &self.shadow.is_some())
            .finish()
    }
}

/// Frame-local rects of the four decoration parts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecorationRects {
    pub left: Rect,
    pub top: Rect,
    pub right: Rect,
    pub bottom: Rect,
}

impl DecorationRects {
    pub fn bounding(&self) -> Rect {
        self.left
            .united(&self.top)
            .united(&self.right)
            .united(&self.bottom)
    }
}

pub fn layout_rects(frame: Size, b: Margins) -> DecorationRects {
    let (w, h) = (frame.width, frame.height);
    let side = (h - b.top - b.bottom).max(0);
    DecorationRects {
        top: Rect::new(0, 0, w, b.top),
        bottom: Rect::new(0, h - b.bottom, w, b.bottom),
        left: Rect::new(0, b.top, b.left, side),
        right: Rect::new(w - b.right, b.top, b.right, side),
    }
}

fn align(value: i32, align: i32) -> i32 {
    (value + align - 1) & !(align - 1)
}

pub fn atlas_size(rects: &DecorationRects) -> Size {
    let width = rects
        .top
        .width
        .max(rects.bottom.width)
        .max(rects.left.height)
        .max(rects.right.height);
    let height = rects.top.height + rects.bottom.height + rects.left.width + rects.right.width;
    Size::new(align(width + 2 * PADDING, 128), height + 4 * 2 * PADDING)
}

/// Atlas positions of the top, bottom, left and right parts
fn atlas_positions(rects: &DecorationRects) -> [Point; 4] {
    let top = Point::new(PADDING, PADDING);
    let bottom = Point::new(PADDING, top.y + rects.top.height + 2 * PADDING);
    let left = Point::new(PADDING, bottom.y + rects.bottom.height + 2 * PADDING);
    let right = Point::new(PADDING, left.y + rects.left.width + 2 * PADDING);
    [top, bottom, left, right]
}

/// Decoration quads for `region` (frame-local), with pixel-space texture
/// coordinates into the atlas
pub fn make_quads(rects: &DecorationRects, region: &Region, scale: f64) -> WindowQuadList {
    let [top_pos, bottom_pos, left_pos, right_pos] = atlas_positions(rects);
    // Transposed parts swap their atlas coordinates
    let parts = [
        (rects.left, Point::new(left_pos.y, left_pos.x), true),
        (rects.top, top_pos, false),
        (rects.right, Point::new(right_pos.y, right_pos.x), true),
        (rects.bottom, bottom_pos, false),
    ];

    let mut list = WindowQuadList::new();
    for (rect, sprite, swap) in parts {
        let offset = sprite - rect.top_left();
        for r in (region & &rect).iter() {
            if r.is_empty() {
                continue;
            }
            let (x0, y0, x1, y1) = (r.left(), r.top(), r.right(), r.bottom());
            let u0 = ((x0 + offset.x) as f64 * scale) as i32 as f64;
            let v0 = ((y0 + offset.y) as f64 * scale) as i32 as f64;
            let u1 = ((x1 + offset.x) as f64 * scale) as i32 as f64;
            let v1 = ((y1 + offset.y) as f64 * scale) as i32 as f64;
            let (x0, y0, x1, y1) = (x0 as f64, y0 as f64, x1 as f64, y1 as f64);

            let verts = if swap {
                [
                    WindowVertex::new(x0, y0, v0, u0),
                    WindowVertex::new(x1, y0, v0, u1),
                    WindowVertex::new(x1, y1, v1, u1),
                    WindowVertex::new(x0, y1, v1, u0),
                ]
            } else {
                [
                    WindowVertex::new(x0, y0, u0, v0),
                    WindowVertex::new(x1, y0, u1, v0),
                    WindowVertex::new(x1, y1, u1, v1),
                    WindowVertex::new(x0, y1, u0, v1),
                ]
            };
            let mut quad = WindowQuad::new(QuadKind::Decoration, 0, verts);
            quad.uv_swapped = swap;
            list.push(quad);
        }
    }
    list
}

// Worker pool

struct Job {
    id: usize,
    image: Image,
    ctx: PaintContext,
    painter: Arc<dyn DecorationPainter>,
}

impl Job {
    fn run(&mut self) {
        self.painter.paint(&mut self.image, &self.ctx);
    }
}

#[derive(Default)]
struct Queue {
    tasks: VecDeque<Job>,
    finished: Vec<Job>,
    pending: usize,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    new_tasks: Condvar,
    done: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Threads painting decoration parts. With zero threads jobs run inline on
/// the caller.
pub struct RenderPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl RenderPool {
    pub fn new(threads: usize) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            new_tasks: Condvar::new(),
            done: Condvar::new(),
        });
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("deco-render-{i}"))
                .spawn(move || worker_loop(&shared))?;
            workers.push(handle);
        }
        debug!("Compositor: decoration render pool with {} threads", threads);
        Ok(Self { shared, workers })
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    fn submit(&self, mut jobs: Vec<Job>) {
        if self.workers.is_empty() {
            for job in &mut jobs {
                job.run();
            }
            self.shared.lock().finished.extend(jobs);
            return;
        }
        let mut queue = self.shared.lock();
        queue.pending += jobs.len();
        queue.tasks.extend(jobs);
        self.shared.new_tasks.notify_all();
    }

    /// Block until every submitted job is done and take the results
    fn wait(&self) -> Vec<Job> {
        let mut queue = self.shared.lock();
        while queue.pending > 0 {
            queue = self
                .shared
                .done
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
        std::mem::take(&mut queue.finished)
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let mut job = {
            let mut queue = shared.lock();
            loop {
                if queue.shutdown {
                    return;
                }
                if let Some(job) = queue.tasks.pop_front() {
                    break job;
                }
                queue = shared
                    .new_tasks
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let mut completion = Completion { shared, job: None };
        job.run();
        completion.job = Some(job);
    }
}

/// Accounts for a taken job once it is over, also when its painter panics
struct Completion<'a> {
    shared: &'a Shared,
    job: Option<Job>,
}

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            warn!("Compositor: decoration painter panicked, part left unpainted");
        }
        let mut queue = self.shared.lock();
        queue.finished.extend(self.job.take());
        queue.pending -= 1;
        if queue.pending == 0 {
            self.shared.done.notify_all();
        }
    }
}

impl Drop for RenderPool {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.new_tasks.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("Compositor: decoration render thread panicked");
            }
        }
    }
}

// Renderer

struct PartUpload {
    position: Point,
    part: Rect,
    geo: Rect,
    viewport: Rect,
    rotated: bool,
}

/// Renders one window's decoration into its atlas texture
pub struct DecorationRenderer {
    decoration: Weak<Decoration>,
    /// Frame-local area waiting to be repainted
    scheduled: Region,
    atlas: Option<Rc<Image>>,
    /// Atlas area changed since the last upload
    atlas_damage: Region,
    serial: u64,
    texture: Option<Texture>,
    stale: bool,
}

impl DecorationRenderer {
    pub fn new(decoration: &Rc<Decoration>) -> Self {
        Self {
            decoration: Rc::downgrade(decoration),
            scheduled: Region::new(),
            atlas: None,
            atlas_damage: Region::new(),
            serial: 0,
            texture: None,
            stale: true,
        }
    }

    pub fn schedule(&mut self, region: &Region) {
        self.scheduled |= region;
    }

    pub fn scheduled(&self) -> &Region {
        &self.scheduled
    }

    /// Sever the link to the decoration; the last rendered atlas is kept
    pub fn detach(&mut self) {
        self.decoration = Weak::new();
    }

    pub fn is_detached(&self) -> bool {
        self.decoration.strong_count() == 0
    }

    pub fn atlas(&self) -> Option<&Image> {
        self.atlas.as_deref()
    }

    pub fn texture(&self) -> Option<&Texture> {
        self.texture.as_ref()
    }

    /// Drop the backend texture (backend change); the atlas is re-uploaded
    pub fn release_texture(&mut self) {
        self.texture = None;
        self.stale = true;
    }

    /// Paint scheduled parts into the atlas. Returns true when the atlas
    /// changed.
    pub fn render(&mut self, frame: Size, pool: &RenderPool) -> bool {
        if self.scheduled.is_empty() {
            return false;
        }
        let Some(decoration) = self.decoration.upgrade() else {
            return false;
        };

        let borders = decoration.borders();
        let rects = layout_rects(frame, borders);
        self.resize_atlas(&rects);
        let Some(atlas) = self.atlas.as_mut() else {
            self.scheduled = Region::new();
            return false;
        };

        let geometry = self.scheduled.bounding_rect();
        let [top_pos, bottom_pos, left_pos, right_pos] = atlas_positions(&rects);
        let parts = [
            (rects.left, left_pos, true),
            (rects.top, top_pos, false),
            (rects.right, right_pos, true),
            (rects.bottom, bottom_pos, false),
        ];

        let mut jobs = Vec::new();
        let mut uploads = Vec::new();
        for (part, position, rotated) in parts {
            let geo = part.intersected(&geometry);
            if geo.is_empty() {
                continue;
            }
            // Pad only edges that are part edges; a dirty area in the middle
            // of a part must not overwrite its neighbours
            let mut rect = geo;
            if rect.left() == part.left() {
                rect = rect.adjusted(-PADDING, 0, 0, 0);
            }
            if rect.top() == part.top() {
                rect = rect.adjusted(0, -PADDING, 0, 0);
            }
            if rect.right() == part.right() {
                rect = rect.adjusted(0, 0, PADDING, 0);
            }
            if rect.bottom() == part.bottom() {
                rect = rect.adjusted(0, 0, 0, PADDING);
            }

            jobs.push(Job {
                id: uploads.len(),
                image: Image::new(rect.size()),
                ctx: PaintContext {
                    frame,
                    borders,
                    clip: geo,
                    origin: rect.top_left(),
                },
                painter: decoration.painter().clone(),
            });
            uploads.push(PartUpload {
                position,
                part,
                geo,
                viewport: geo.translated(-rect.x, -rect.y),
                rotated,
            });
        }

        pool.submit(jobs);
        let atlas = Rc::make_mut(atlas);
        for job in pool.wait() {
            let upload = &uploads[job.id];
            let mut image = job.image;
            let mut viewport = upload.viewport;
            image.clamp_to(viewport);

            let mut dirty_offset = upload.geo.top_left() - upload.part.top_left();
            if upload.rotated {
                image = image.transposed();
                viewport = Rect::new(viewport.y, viewport.x, viewport.height, viewport.width);
                dirty_offset = Point::new(dirty_offset.y, dirty_offset.x);
            }

            let dst = upload.position + dirty_offset - viewport.top_left();
            atlas.copy_from(&image, image.rect(), dst);
            self.atlas_damage |= Rect::new(dst.x, dst.y, image.width(), image.height());
        }

        trace!(
            "Compositor: rendered decoration parts in {:?}",
            self.scheduled.bounding_rect()
        );
        self.scheduled = Region::new();
        true
    }

    fn resize_atlas(&mut self, rects: &DecorationRects) {
        let size = atlas_size(rects);
        if self.atlas.as_ref().is_some_and(|a| a.size() == size) {
            return;
        }
        if size.is_empty() {
            self.atlas = None;
        } else {
            self.atlas = Some(Rc::new(Image::new(size)));
            self.atlas_damage = Region::from(Rect::from_size(size));
            // Every part must be redrawn into the new atlas
            self.scheduled = Region::from(rects.bounding());
        }
        self.texture = None;
        self.stale = true;
        self.serial += 1;
    }

    /// Upload atlas changes to the backend texture
    pub fn upload(&mut self, backend: &mut dyn TextureBackend) -> Result<(), BindError> {
        let Some(atlas) = &self.atlas else {
            return Ok(());
        };
        let buffer = Buffer::shm(self.serial, atlas.clone(), true);
        match self.texture.as_mut() {
            Some(texture) if !self.stale => {
                if !self.atlas_damage.is_empty() {
                    backend.update_texture(texture, &buffer, &self.atlas_damage)?;
                }
            }
            _ => {
                self.texture = Some(backend.create_texture(&buffer)?);
                self.stale = false;
            }
        }
        self.atlas_damage = Region::new();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::pixmap::tests::FakeUploader;

    const TITLE: u32 = 0xff203040;
    const BORDER: u32 = 0xff808080;

    fn decoration() -> Rc<Decoration> {
        let painter = Arc::new(FlatDecorationPainter {
            titlebar: TITLE,
            border: BORDER,
        });
        Rc::new(Decoration::new(Margins::new(4, 20, 4, 4), painter))
    }

    #[test]
    fn test_layout_rects() {
        let rects = layout_rects(Size::new(100, 80), Margins::new(4, 20, 6, 5));
        assert_eq!(rects.top, Rect::new(0, 0, 100, 20));
        assert_eq!(rects.bottom, Rect::new(0, 75, 100, 5));
        assert_eq!(rects.left, Rect::new(0, 20, 4, 55));
        assert_eq!(rects.right, Rect::new(94, 20, 6, 55));
        assert_eq!(rects.bounding(), Rect::new(0, 0, 100, 80));
    }

    #[test]
    fn test_atlas_size_is_aligned() {
        let rects = layout_rects(Size::new(100, 80), Margins::new(4, 20, 4, 4));
        // width: max(100, 100, 56, 56) + 2 -> 128; height: 20 + 4 + 4 + 4 + 8
        assert_eq!(atlas_size(&rects), Size::new(128, 40));
    }

    #[test]
    fn test_quads_cover_decoration_with_swapped_sides() {
        let rects = layout_rects(Size::new(100, 80), Margins::new(4, 20, 4, 4));
        let shape = &Region::from(Rect::new(0, 0, 100, 80)) - &Region::from(Rect::new(4, 20, 92, 56));
        let quads = make_quads(&rects, &shape, 1.0);
        assert_eq!(quads.len(), 4);
        let swapped = quads.iter().filter(|q| q.uv_swapped).count();
        assert_eq!(swapped, 2);

        // Top part starts one pixel into the atlas
        let top = quads.iter().find(|q| q.top() == 0.0).unwrap();
        assert_eq!((top.verts[0].u, top.verts[0].v), (1.0, 1.0));
    }

    #[test]
    fn test_render_fills_atlas_and_uploads_damage() {
        let deco = decoration();
        let pool = RenderPool::new(2).unwrap();
        let mut renderer = DecorationRenderer::new(&deco);
        let frame = Size::new(100, 80);
        renderer.schedule(&Region::from(Rect::from_size(frame)));
        assert!(renderer.render(frame, &pool));
        assert!(renderer.scheduled().is_empty());

        let atlas = renderer.atlas().unwrap();
        // Titlebar at (1, 1), padding clamped from the edge
        assert_eq!(atlas.pixel(1, 1), TITLE);
        assert_eq!(atlas.pixel(0, 0), TITLE);
        // Bottom part at y = 20 + 3
        assert_eq!(atlas.pixel(10, 23), BORDER);

        let mut uploader = FakeUploader::default();
        renderer.upload(&mut uploader).unwrap();
        assert_eq!(uploader.created, 1);

        // Partial repaint updates the existing texture
        renderer.schedule(&Region::from(Rect::new(40, 5, 10, 5)));
        assert!(renderer.render(frame, &pool));
        renderer.upload(&mut uploader).unwrap();
        assert_eq!(uploader.created, 1);
        assert_eq!(uploader.updated.len(), 1);
        assert_eq!(uploader.updated[0].bounding_rect(), Rect::new(41, 6, 10, 5));
    }

    #[test]
    fn test_rotated_parts_match_quad_texture_coordinates() {
        let deco = decoration();
        let pool = RenderPool::new(0).unwrap();
        let mut renderer = DecorationRenderer::new(&deco);
        let frame = Size::new(100, 80);
        renderer.schedule(&Region::from(Rect::from_size(frame)));
        renderer.render(frame, &pool);
        let atlas = renderer.atlas().unwrap();

        let rects = layout_rects(frame, deco.borders());
        let quads = make_quads(&rects, &Region::from(rects.left), 1.0);
        let q = &quads.0[0];
        assert!(q.uv_swapped);
        assert_eq!(atlas.pixel(q.verts[0].u as i32, q.verts[0].v as i32), BORDER);
    }

    struct PanickingPainter;

    impl DecorationPainter for PanickingPainter {
        fn paint(&self, _target: &mut Image, _ctx: &PaintContext) {
            panic!("painter failure");
        }
    }

    #[test]
    fn test_wait_returns_after_painter_panic() {
        let pool = RenderPool::new(1).unwrap();
        let painter: Arc<dyn DecorationPainter> = Arc::new(PanickingPainter);
        let ctx = PaintContext {
            frame: Size::new(10, 10),
            borders: Margins::new(1, 1, 1, 1),
            clip: Rect::new(0, 0, 10, 1),
            origin: Point::new(0, 0),
        };
        pool.submit(vec![Job {
            id: 0,
            image: Image::new(Size::new(10, 1)),
            ctx,
            painter,
        }]);
        // The failed part is dropped rather than handed back
        assert!(pool.wait().is_empty());
    }

    #[test]
    fn test_detached_renderer_keeps_atlas() {
        let deco = decoration();
        let pool = RenderPool::new(0).unwrap();
        let mut renderer = DecorationRenderer::new(&deco);
        let frame = Size::new(50, 50);
        renderer.schedule(&Region::from(Rect::from_size(frame)));
        renderer.render(frame, &pool);
        renderer.detach();
        drop(deco);
        assert!(renderer.is_detached());
        assert!(renderer.atlas().is_some());
        renderer.schedule(&Region::from(Rect::from_size(frame)));
        assert!(!renderer.render(frame, &pool));
    }
}

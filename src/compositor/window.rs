//! Scene-side state of a toplevel window.
//!
//! The window collaborator owns policy (mapping, stacking, geometry). The
//! scene keeps per-window rendering state here: the pixmap tree, the pixmap
//! of the previous buffer used for cross-fading, repaints, cached quads, the
//! shadow and the decoration renderer.

use std::rc::Rc;

use bitflags::bitflags;
use tracing::{debug, trace};

use super::decoration::{self, Decoration, DecorationRenderer};
use super::effects::EffectWindow;
use super::pixmap::{Buffer, TextureBackend, WindowPixmap};
use super::quads::{QuadKind, WindowQuad, WindowQuadList};
use super::region::Region;
use super::shadow::Shadow;
use crate::error::BindError;
use crate::shared::geometry::{Margins, Point, Rect, RectF, Size};

pub type WindowId = u32;

bitflags! {
    /// Reasons a window is currently not painted
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DisableReason: u32 {
        /// Hidden by the window manager
        const HIDDEN = 1 << 0;
        /// Closed; kept as a tombstone for effects
        const DELETED = 1 << 1;
        /// Not on the current desktop
        const DESKTOP = 1 << 2;
        const MINIMIZED = 1 << 3;
        /// Disabled by an effect
        const EFFECT = 1 << 4;
    }
}

/// Toplevel state as reported by the window collaborator
#[derive(Debug, Clone)]
pub struct Toplevel {
    pub id: WindowId,
    /// Frame geometry in screen coordinates; the window buffer covers it
    pub geometry: Rect,
    /// Client area, frame-local
    pub client_rect: Rect,
    pub opacity: f64,
    pub has_alpha: bool,
    pub shaded: bool,
    pub minimized: bool,
    pub on_current_desktop: bool,
    pub hidden: bool,
    pub skips_close_animation: bool,
    pub wants_shadow: bool,
    /// Area the client declared opaque, frame-local
    pub opaque_region: Region,
    /// Bounding shape, frame-local. `None` for unshaped windows.
    pub shape: Option<Region>,
    pub decoration: Option<Rc<Decoration>>,
}

impl Toplevel {
    pub fn new(id: WindowId, geometry: Rect) -> Self {
        Self {
            id,
            geometry,
            client_rect: Rect::from_size(geometry.size()),
            opacity: 1.0,
            has_alpha: false,
            shaded: false,
            minimized: false,
            on_current_desktop: true,
            hidden: false,
            skips_close_animation: false,
            wants_shadow: true,
            opaque_region: Region::new(),
            shape: None,
            decoration: None,
        }
    }

    /// Frame-local rect
    pub fn rect(&self) -> Rect {
        Rect::from_size(self.geometry.size())
    }

    pub fn frame_margins(&self) -> Margins {
        self.decoration
            .as_ref()
            .map(|d| d.borders())
            .unwrap_or_default()
    }

    /// Area not covered by the decoration
    pub fn transparent_rect(&self) -> Rect {
        self.rect().shrunk_by(self.frame_margins())
    }
}

pub struct SceneWindow {
    toplevel: Toplevel,
    deleted: bool,
    /// Tombstone references held by effects
    refcount: u32,
    pixmap: Option<WindowPixmap>,
    previous: Option<WindowPixmap>,
    previous_refs: u32,
    pending: Option<Buffer>,
    pending_damage: Region,
    /// Screen coordinates
    repaints: Region,
    disable: DisableReason,
    shadow: Option<Shadow>,
    decoration_renderer: Option<DecorationRenderer>,
    cached_quads: Option<WindowQuadList>,
    buffer_shape: Option<Region>,
}

impl SceneWindow {
    pub fn new(toplevel: Toplevel) -> Self {
        let decoration_renderer = toplevel.decoration.as_ref().map(DecorationRenderer::new);
        let mut window = Self {
            toplevel,
            deleted: false,
            refcount: 0,
            pixmap: None,
            previous: None,
            previous_refs: 0,
            pending: None,
            pending_damage: Region::new(),
            repaints: Region::new(),
            disable: DisableReason::empty(),
            shadow: None,
            decoration_renderer,
            cached_quads: None,
            buffer_shape: None,
        };
        window.reset_painting_enabled();
        window
    }

    pub fn id(&self) -> WindowId {
        self.toplevel.id
    }

    pub fn toplevel(&self) -> &Toplevel {
        &self.toplevel
    }

    /// Apply a new toplevel state from the window collaborator. Returns the
    /// screen area that needs repainting because of the change.
    pub fn update_toplevel(&mut self, toplevel: Toplevel) -> Region {
        let old = self.visible_rect();
        let resized = toplevel.geometry.size() != self.toplevel.geometry.size();
        let decoration_changed = match (&toplevel.decoration, &self.toplevel.decoration) {
            (Some(a), Some(b)) => !Rc::ptr_eq(a, b),
            (None, None) => false,
            _ => true,
        };
        let shape_changed = toplevel.shape != self.toplevel.shape;

        if decoration_changed {
            self.decoration_renderer = toplevel.decoration.as_ref().map(DecorationRenderer::new);
        }
        if resized || decoration_changed {
            if let Some(renderer) = &mut self.decoration_renderer {
                renderer.schedule(&Region::from(Rect::from_size(toplevel.geometry.size())));
            }
        }
        self.toplevel = toplevel;
        if resized {
            if let Some(shadow) = &mut self.shadow {
                shadow.geometry_changed(self.toplevel.geometry.size());
            }
        }
        if resized || shape_changed {
            self.discard_shape();
        }
        self.discard_quads();
        self.reset_painting_enabled();

        &old | &self.visible_rect()
    }

    pub fn pos(&self) -> Point {
        self.toplevel.geometry.top_left()
    }

    pub fn x(&self) -> i32 {
        self.toplevel.geometry.x
    }

    pub fn y(&self) -> i32 {
        self.toplevel.geometry.y
    }

    pub fn size(&self) -> Size {
        self.toplevel.geometry.size()
    }

    /// Frame geometry plus shadow, screen coordinates
    pub fn visible_rect(&self) -> Region {
        let mut region = Region::from(self.toplevel.geometry);
        if let Some(shadow) = &self.shadow {
            region |= &shadow.region().translated(self.x(), self.y());
        }
        region
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_opaque(&self) -> bool {
        self.toplevel.opacity == 1.0 && !self.toplevel.has_alpha
    }

    pub fn is_shaded(&self) -> bool {
        self.toplevel.shaded
    }

    pub fn effect_window(&self) -> EffectWindow {
        EffectWindow {
            id: self.id(),
            geometry: self.toplevel.geometry,
            opacity: self.toplevel.opacity,
            has_alpha: self.toplevel.has_alpha,
            deleted: self.deleted,
        }
    }

    // Painting enable state

    pub fn is_painting_enabled(&self) -> bool {
        self.disable.is_empty()
    }

    pub fn disable_reasons(&self) -> DisableReason {
        self.disable
    }

    pub fn reset_painting_enabled(&mut self) {
        self.disable = DisableReason::empty();
        if self.deleted {
            self.disable |= DisableReason::DELETED;
        }
        if !self.toplevel.on_current_desktop {
            self.disable |= DisableReason::DESKTOP;
        }
        if self.toplevel.minimized {
            self.disable |= DisableReason::MINIMIZED;
        }
        if self.toplevel.hidden {
            self.disable |= DisableReason::HIDDEN;
        }
    }

    pub fn enable_painting(&mut self, reason: DisableReason) {
        self.disable.remove(reason);
    }

    pub fn disable_painting(&mut self, reason: DisableReason) {
        self.disable.insert(reason);
    }

    /// Replace the disable reasons after effects had a say
    pub fn set_disable_reasons(&mut self, reasons: DisableReason) {
        self.disable = reasons;
    }

    // Repaints

    pub fn add_repaint(&mut self, region: &Region) {
        self.repaints |= region;
    }

    /// Schedule a repaint of the whole window, shadow included
    pub fn add_repaint_full(&mut self) {
        let full = self.visible_rect();
        self.repaints |= &full;
    }

    pub fn repaints(&self) -> &Region {
        &self.repaints
    }

    pub fn reset_repaints(&mut self) {
        self.repaints = Region::new();
    }

    // Buffers and pixmaps

    /// Record a committed buffer. `damage` is buffer-local. The pixmap picks
    /// the buffer up on the next `preprocess`.
    pub fn commit(&mut self, buffer: Buffer, damage: &Region) {
        if self.deleted {
            return;
        }
        self.pending_damage |= damage;
        self.pending = Some(buffer);
    }

    /// Damage the current buffer contents without a new commit
    pub fn add_damage(&mut self, damage: &Region) {
        if let Some(pixmap) = &mut self.pixmap {
            pixmap.add_damage(damage);
        }
    }

    /// Update the sub-surface tree of the current pixmap
    pub fn set_sub_surfaces(&mut self, order: &[(u32, Point)]) {
        if let Some(pixmap) = &mut self.pixmap {
            pixmap.set_children(order);
            self.discard_quads();
        }
    }

    pub fn commit_sub_surface(&mut self, key: u32, buffer: Buffer, damage: &Region) -> bool {
        let Some(child) = self.pixmap.as_mut().and_then(|p| p.child_mut(key)) else {
            return false;
        };
        let recreated = child.buffer().is_none_or(|b| b.size != buffer.size);
        child.attach(buffer, damage);
        if recreated {
            self.discard_quads();
        }
        true
    }

    /// Take pending buffers into the pixmap
    pub fn preprocess(&mut self) {
        if self.pixmap.is_none() || self.pending.is_some() {
            self.update_pixmap();
        }
    }

    fn update_pixmap(&mut self) {
        if self.deleted {
            return;
        }
        let Some(buffer) = self.pending.take() else {
            return;
        };
        let damage = std::mem::take(&mut self.pending_damage);
        match &mut self.pixmap {
            Some(pixmap) if pixmap.is_valid() && !pixmap.is_discarded() => {
                pixmap.attach(buffer, &damage);
            }
            _ => {
                let mut pixmap = WindowPixmap::new(buffer);
                pixmap.set_contents_rect(self.toplevel.client_rect);
                self.pixmap = Some(pixmap);
                self.unreference_previous_pixmap();
                self.discard_quads();
            }
        }
    }

    pub fn pixmap(&self) -> Option<&WindowPixmap> {
        self.pixmap.as_ref()
    }

    pub fn pixmap_mut(&mut self) -> Option<&mut WindowPixmap> {
        self.pixmap.as_mut()
    }

    pub fn previous_pixmap(&self) -> Option<&WindowPixmap> {
        self.previous.as_ref()
    }

    /// The current buffer is gone (resize, unredirect). A valid pixmap is
    /// kept as the previous one for cross-fading.
    pub fn discard_pixmap(&mut self) {
        if let Some(mut pixmap) = self.pixmap.take() {
            if pixmap.is_valid() {
                pixmap.mark_discarded();
                self.previous = Some(pixmap);
                self.previous_refs = 0;
                self.reference_previous_pixmap();
            }
        }
    }

    pub fn reference_previous_pixmap(&mut self) {
        if self.previous.as_ref().is_some_and(WindowPixmap::is_discarded) {
            self.previous_refs += 1;
        }
    }

    pub fn unreference_previous_pixmap(&mut self) {
        if !self.previous.as_ref().is_some_and(WindowPixmap::is_discarded) {
            return;
        }
        self.previous_refs = self.previous_refs.saturating_sub(1);
        if self.previous_refs == 0 {
            self.previous = None;
        }
    }

    /// Bind the current pixmap tree to textures of `backend`. The caller
    /// resets damage after a successful bind.
    pub fn bind(&mut self, backend: &mut dyn TextureBackend) -> Result<(), BindError> {
        let pixmap = self.pixmap.as_mut().ok_or(BindError::NoBuffer)?;
        pixmap.bind(backend)
    }

    /// Damage of the pixmap tree mapped to screen coordinates
    pub fn pixmap_damage(&self) -> Region {
        let mut damage = Region::new();
        if let Some(pixmap) = &self.pixmap {
            pixmap.visit(&mut |p, offset| {
                damage |= &p.damage().translated(self.x() + offset.x, self.y() + offset.y);
            });
        }
        damage
    }

    pub fn reset_damage(&mut self) {
        if let Some(pixmap) = &mut self.pixmap {
            pixmap.reset_tree_damage();
        }
    }

    // Shapes

    /// Bounding shape of the window buffer, frame-local
    pub fn buffer_shape(&mut self) -> Region {
        if let Some(shape) = &self.buffer_shape {
            return shape.clone();
        }
        let rect = self.toplevel.rect();
        let shape = match &self.toplevel.shape {
            Some(shape) => shape & &rect,
            None => Region::from(rect),
        };
        self.buffer_shape = Some(shape.clone());
        shape
    }

    /// Shape of the client area, frame-local
    pub fn client_shape(&mut self) -> Region {
        if self.is_shaded() {
            return Region::new();
        }
        let shape = self.buffer_shape();
        let margins = self.toplevel.frame_margins();
        if margins.is_null() {
            return shape;
        }
        &shape & &self.toplevel.rect().shrunk_by(margins)
    }

    pub fn decoration_shape(&self) -> Region {
        &Region::from(self.toplevel.rect()) - &Region::from(self.toplevel.transparent_rect())
    }

    /// Area that hides whatever lies below the window, frame-local.
    /// Empty for translucent windows.
    pub fn opaque_clip(&mut self) -> Region {
        if self.is_opaque() {
            let mut clip = self.client_shape();
            let decorated = self.toplevel.decoration.as_ref();
            if decorated.is_some_and(|d| !d.has_alpha()) {
                clip |= &self.decoration_shape();
            }
            clip
        } else if self.toplevel.has_alpha && self.toplevel.opacity == 1.0 {
            let shape = self.client_shape();
            &shape & &self.toplevel.opaque_region
        } else {
            Region::new()
        }
    }

    pub fn discard_shape(&mut self) {
        self.buffer_shape = None;
        self.discard_quads();
    }

    // Quads

    pub fn discard_quads(&mut self) {
        self.cached_quads = None;
    }

    /// Contents, decoration and shadow quads in frame-local coordinates,
    /// cached until the geometry or the surface tree changes
    pub fn build_quads(&mut self) -> WindowQuadList {
        if let Some(quads) = &self.cached_quads {
            return quads.clone();
        }

        let mut quads = WindowQuadList::new();
        if !self.is_shaded() {
            quads.extend(self.make_contents_quads());
        }

        let margins = self.toplevel.frame_margins();
        if !margins.is_null() {
            let rects = decoration::layout_rects(self.size(), margins);
            let transparent = self.toplevel.transparent_rect();
            let shaded = self.is_shaded() || transparent.is_empty();
            let region = if shaded {
                Region::from(rects.bounding())
            } else {
                self.decoration_shape()
            };
            quads.extend(decoration::make_quads(&rects, &region, 1.0));
        }

        if let Some(shadow) = &self.shadow {
            if self.toplevel.wants_shadow {
                quads.extend(shadow.quads().clone());
            }
        }

        trace!("Compositor: built {} quads for window {}", quads.len(), self.id());
        self.cached_quads = Some(quads.clone());
        quads
    }

    fn make_contents_quads(&mut self) -> WindowQuadList {
        let root_shape = self.buffer_shape();
        let Some(pixmap) = &self.pixmap else {
            return WindowQuadList::new();
        };

        let mut quads = WindowQuadList::new();
        let mut id = 0;
        pixmap.visit(&mut |p, offset| {
            if !p.is_valid() {
                return;
            }
            let shape = if p.key() == 0 { root_shape.clone() } else { p.shape() };
            let quad_id = id;
            id += 1;
            for r in shape.iter() {
                let local = RectF::from(*r);
                let window = local.translated(offset.x as f64, offset.y as f64);
                quads.push(WindowQuad::from_rect(QuadKind::Contents, quad_id, window, local));
            }
        });
        quads
    }

    // Shadow and decoration

    pub fn shadow(&self) -> Option<&Shadow> {
        self.shadow.as_ref()
    }

    pub fn shadow_mut(&mut self) -> Option<&mut Shadow> {
        self.shadow.as_mut()
    }

    pub fn set_shadow(&mut self, shadow: Option<Shadow>) {
        self.shadow = shadow;
        self.discard_quads();
    }

    pub fn decoration_renderer(&self) -> Option<&DecorationRenderer> {
        self.decoration_renderer.as_ref()
    }

    pub fn decoration_renderer_mut(&mut self) -> Option<&mut DecorationRenderer> {
        self.decoration_renderer.as_mut()
    }

    /// Schedule a decoration repaint, frame-local
    pub fn schedule_decoration_repaint(&mut self, region: &Region) {
        if let Some(renderer) = &mut self.decoration_renderer {
            renderer.schedule(region);
            self.repaints |= &region.translated(self.x(), self.y());
        }
    }

    // Tombstones

    /// The window was closed. It stays in the scene while effects reference
    /// it; the pixmap, shadow and decoration renderer are kept as they are.
    pub fn set_deleted(&mut self, references: u32) {
        self.deleted = true;
        self.refcount = references;
        self.pending = None;
        self.pending_damage = Region::new();
        if let Some(renderer) = &mut self.decoration_renderer {
            renderer.detach();
        }
        self.toplevel.decoration = None;
        self.reset_painting_enabled();
        debug!(
            "Compositor: window {} closed, {} references",
            self.id(),
            references
        );
    }

    pub fn reference(&mut self) {
        self.refcount += 1;
    }

    /// Returns true when the tombstone is no longer referenced
    pub fn unreference(&mut self) -> bool {
        self.refcount = self.refcount.saturating_sub(1);
        self.refcount == 0
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }
}

impl std::fmt::Debug for SceneWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneWindow")
            .field("id", &self.toplevel.id)
            .field("geometry", &self.toplevel.geometry)
            .field("deleted", &self.deleted)
            .field("disable", &self.disable)
            .finish()
    }
}

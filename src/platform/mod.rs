//! X11 platform
//!
//! Redirects the children of the root window, tracks their geometry,
//! pixmaps, damage and properties, and feeds them to the scene. Backends
//! draw into the composite overlay window.

pub mod events;
pub mod fence;
pub mod glx;
pub mod raster;
pub mod xrender;

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, trace, warn};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::errors::ConnectionError;
use x11rb::protocol::composite::{self, ConnectionExt as CompositeExt};
use x11rb::protocol::damage::{self, ConnectionExt as DamageExt};
use x11rb::protocol::shape::{self, ConnectionExt as ShapeExt};
use x11rb::protocol::sync::{self, ConnectionExt as SyncExt};
use x11rb::protocol::xfixes::{self, ConnectionExt as XfixesExt};
use x11rb::protocol::xproto::*;
use x11rb::protocol::{ErrorKind, Event};
use x11rb::rust_connection::RustConnection;
use x11rb::NONE;

use crate::compositor::backend::{Backend, BackendKind, OpenGlBackend, RasterBackend, XRenderBackend};
use crate::compositor::decoration::{Decoration, FlatDecorationPainter};
use crate::compositor::pixmap::Buffer;
use crate::compositor::region::Region;
use crate::compositor::scene::Scene;
use crate::compositor::shadow::{DecorationShadow, Shadow};
use crate::compositor::window::Toplevel;
use crate::compositor::{Compositor, Platform};
use crate::config::{Config, DecorationConfig, ShadowConfig};
use crate::error::BackendError;
use crate::shared::geometry::{Margins, Point, Rect, Size};
use crate::shared::image::Image;

x11rb::atom_manager! {
    pub Atoms: AtomsCookie {
        _NET_WM_WINDOW_OPACITY,
        _KDE_NET_WM_SHADOW,
    }
}

/// PutImage `rect` of `image` at `dst`, split into requests the server
/// accepts
pub(crate) fn put_image(
    conn: &RustConnection,
    drawable: u32,
    gc: Gcontext,
    depth: u8,
    image: &Image,
    rect: Rect,
    dst: Point,
) -> Result<(), ConnectionError> {
    let clipped = rect.intersected(&image.rect());
    if clipped.is_empty() {
        return Ok(());
    }
    let dst = Point::new(dst.x + clipped.x - rect.x, dst.y + clipped.y - rect.y);
    let stride = clipped.width as usize * 4;
    let max_bytes = conn.maximum_request_bytes().saturating_sub(64);
    let rows_per_request = (max_bytes / stride).max(1) as i32;

    let mut row = 0;
    while row < clipped.height {
        let rows = rows_per_request.min(clipped.height - row);
        let chunk = image.copy(Rect::new(clipped.x, clipped.y + row, clipped.width, rows));
        conn.put_image(
            ImageFormat::Z_PIXMAP,
            drawable,
            gc,
            clipped.width as u16,
            rows as u16,
            dst.x as i16,
            (dst.y + row) as i16,
            0,
            depth,
            chunk.as_bytes(),
        )?;
        row += rows;
    }
    Ok(())
}

/// A top-level window as seen by the platform
#[derive(Debug, Clone)]
struct TrackedWindow {
    id: u32,
    /// Outer geometry including the border
    geometry: Rect,
    border_width: i32,
    depth: u8,
    mapped: bool,
    input_only: bool,
    override_redirect: bool,
    damage: Option<u32>,
    pixmap: Option<u32>,
    serial: u64,
    opacity: f64,
}

impl TrackedWindow {
    fn new(id: u32, geometry: Rect, border_width: i32, override_redirect: bool) -> Self {
        Self {
            id,
            geometry,
            border_width,
            depth: 24,
            mapped: false,
            input_only: false,
            override_redirect,
            damage: None,
            pixmap: None,
            serial: 0,
            opacity: 1.0,
        }
    }

    fn is_composited(&self) -> bool {
        self.mapped && !self.input_only
    }

    fn has_alpha(&self) -> bool {
        self.depth == 32
    }
}

fn outer_geometry(x: i16, y: i16, width: u16, height: u16, border_width: u16) -> Rect {
    let bw = border_width as i32 * 2;
    Rect::new(x as i32, y as i32, width as i32 + bw, height as i32 + bw)
}

/// Scene state of a tracked window. Managed windows get the built-in
/// decoration around them when there is one.
fn toplevel_for(window: &TrackedWindow, decoration: Option<&Rc<Decoration>>) -> Toplevel {
    let mut toplevel = Toplevel::new(window.id, window.geometry);
    toplevel.opacity = window.opacity;
    toplevel.has_alpha = window.has_alpha();
    toplevel.wants_shadow = !window.override_redirect;
    if let Some(decoration) = decoration.filter(|_| !window.override_redirect) {
        let borders = decoration.borders();
        toplevel.geometry = window.geometry.grown_by(borders);
        toplevel.client_rect = Rect::new(borders.left, borders.top, window.geometry.width, window.geometry.height);
        toplevel.decoration = Some(decoration.clone());
    }
    toplevel
}

/// Soft shadow tiles generated from the configured style
fn builtin_shadow(config: &ShadowConfig) -> Option<Rc<DecorationShadow>> {
    if !config.enabled || config.size <= 0 {
        return None;
    }
    let s = config.size;
    let side = 2 * s + 1;
    let mut image = Image::new(Size::new(side, side));
    for y in 0..side {
        for x in 0..side {
            let (dx, dy) = ((x - s) as f64, (y - s) as f64);
            let falloff = (1.0 - (dx * dx + dy * dy).sqrt() / s as f64).clamp(0.0, 1.0);
            let alpha = (config.strength as f64 * falloff * falloff).round() as u32;
            image.set_pixel(x, y, alpha << 24);
        }
    }
    let padding = Margins::new(config.left, config.top, config.right, config.bottom);
    Some(Rc::new(DecorationShadow::new(image, padding, Rect::new(s, s, 1, 1))))
}

fn builtin_decoration(config: &DecorationConfig, shadow: Option<&Rc<DecorationShadow>>) -> Option<Rc<Decoration>> {
    if !config.enabled {
        return None;
    }
    let bw = config.border_width as i32;
    let borders = Margins::new(bw, config.titlebar_height as i32, bw, bw);
    let painter = FlatDecorationPainter {
        titlebar: config.titlebar,
        border: config.border,
    };
    let mut decoration = Decoration::new(borders, Arc::new(painter));
    if let Some(shadow) = shadow {
        decoration = decoration.with_shadow(shadow.clone());
    }
    Some(Rc::new(decoration))
}

pub struct X11Platform {
    conn: Arc<RustConnection>,
    screen_num: usize,
    root: u32,
    root_depth: u8,
    root_visual: u32,
    overlay: u32,
    size: Size,
    atoms: Atoms,
    sync_available: bool,
    windows: HashMap<u32, TrackedWindow>,
    /// Bottom to top
    stacking: Vec<u32>,
    decoration: Option<Rc<Decoration>>,
    shadow: Option<Rc<DecorationShadow>>,
}

impl X11Platform {
    /// Check the required extensions, redirect the root window's children
    /// and take the overlay window
    pub fn new(conn: Arc<RustConnection>, screen_num: usize, config: &Config) -> Result<Self> {
        let screen = conn
            .setup()
            .roots
            .get(screen_num)
            .context("Invalid screen number")?;
        let (root, root_depth, root_visual) = (screen.root, screen.root_depth, screen.root_visual);
        let size = Size::new(screen.width_in_pixels as i32, screen.height_in_pixels as i32);

        conn.extension_information(composite::X11_EXTENSION_NAME)?
            .context("Composite extension not available")?;
        let version = conn
            .composite_query_version(0, 4)?
            .reply()
            .context("Failed to query composite version")?;
        info!("Composite extension {}.{}", version.major_version, version.minor_version);

        conn.extension_information(damage::X11_EXTENSION_NAME)?
            .context("Damage extension not available")?;
        // Damage requests fail until the version is negotiated
        let version = conn
            .damage_query_version(1, 1)?
            .reply()
            .context("Failed to query damage version")?;
        info!("Damage extension {}.{}", version.major_version, version.minor_version);

        conn.extension_information(xfixes::X11_EXTENSION_NAME)?
            .context("XFixes extension not available")?;
        conn.xfixes_query_version(5, 0)?
            .reply()
            .context("Failed to query xfixes version")?;

        conn.extension_information(shape::X11_EXTENSION_NAME)?
            .context("Shape extension not available")?;

        let sync_available = match conn.extension_information(sync::X11_EXTENSION_NAME)? {
            Some(_) => conn.sync_initialize(3, 1)?.reply().is_ok(),
            None => false,
        };
        if !sync_available {
            info!("SYNC extension not available, explicit sync disabled");
        }

        let atoms = Atoms::new(conn.as_ref())?.reply().context("Failed to intern atoms")?;

        conn.change_window_attributes(
            root,
            &ChangeWindowAttributesAux::new().event_mask(
                EventMask::SUBSTRUCTURE_NOTIFY | EventMask::STRUCTURE_NOTIFY | EventMask::PROPERTY_CHANGE,
            ),
        )?
        .check()
        .context("Failed to select root window events")?;

        conn.composite_redirect_subwindows(root, composite::Redirect::MANUAL)?
            .check()
            .context("Another compositor is running")?;

        let overlay = conn.composite_get_overlay_window(root)?.reply()?.overlay_win;
        info!("Using Composite Overlay Window: {}", overlay);

        // Input passes through the overlay to the windows below
        conn.shape_rectangles(
            shape::SO::SET,
            shape::SK::INPUT,
            ClipOrdering::UNSORTED,
            overlay,
            0,
            0,
            &[],
        )?;
        conn.change_window_attributes(overlay, &ChangeWindowAttributesAux::new().event_mask(EventMask::EXPOSURE))?;

        let shadow = builtin_shadow(&config.shadow);
        let decoration = builtin_decoration(&config.decorations, shadow.as_ref());

        let mut platform = Self {
            conn,
            screen_num,
            root,
            root_depth,
            root_visual,
            overlay,
            size,
            atoms,
            sync_available,
            windows: HashMap::new(),
            stacking: Vec::new(),
            decoration,
            shadow,
        };
        platform.scan_windows()?;
        platform.conn.flush()?;
        Ok(platform)
    }

    pub fn connection(&self) -> &Arc<RustConnection> {
        &self.conn
    }

    /// Track the windows that exist already
    fn scan_windows(&mut self) -> Result<()> {
        let tree = self.conn.query_tree(self.root)?.reply()?;
        for id in tree.children {
            if id == self.overlay {
                continue;
            }
            let Ok(geometry) = self.conn.get_geometry(id)?.reply() else {
                continue;
            };
            let Ok(attributes) = self.conn.get_window_attributes(id)?.reply() else {
                continue;
            };
            let outer = outer_geometry(geometry.x, geometry.y, geometry.width, geometry.height, geometry.border_width);
            let mut window = TrackedWindow::new(id, outer, geometry.border_width as i32, attributes.override_redirect);
            window.depth = geometry.depth;
            window.input_only = attributes.class == WindowClass::INPUT_ONLY;
            window.mapped = attributes.map_state == MapState::VIEWABLE;
            self.windows.insert(id, window);
            self.stacking.push(id);
            if self.windows[&id].is_composited() {
                self.start_compositing(id);
            }
        }
        debug!("Tracking {} windows", self.windows.len());
        Ok(())
    }

    fn track(&mut self, window: TrackedWindow) {
        let id = window.id;
        self.windows.insert(id, window);
        self.stacking.retain(|w| *w != id);
        self.stacking.push(id);
    }

    fn untrack(&mut self, id: u32) -> Option<TrackedWindow> {
        self.stacking.retain(|w| *w != id);
        self.windows.remove(&id)
    }

    /// Refresh depth and class. Both are fixed at creation but the create
    /// event does not carry them.
    fn refresh_attributes(&mut self, id: u32) -> Result<()> {
        let geometry = self.conn.get_geometry(id)?.reply()?;
        let attributes = self.conn.get_window_attributes(id)?.reply()?;
        if let Some(window) = self.windows.get_mut(&id) {
            window.depth = geometry.depth;
            window.input_only = attributes.class == WindowClass::INPUT_ONLY;
            window.geometry = outer_geometry(geometry.x, geometry.y, geometry.width, geometry.height, geometry.border_width);
            window.border_width = geometry.border_width as i32;
        }
        Ok(())
    }

    /// Damage tracking, pixmap and properties of a newly mapped window
    fn start_compositing(&mut self, id: u32) {
        if let Err(e) = self.create_damage(id) {
            debug!("Failed to create damage for window {}: {}", id, e);
        }
        self.name_pixmap(id);
        let opacity = self.read_opacity(id);
        if let Some(window) = self.windows.get_mut(&id) {
            window.opacity = opacity;
        }
    }

    fn stop_compositing(&mut self, id: u32) {
        let Some(window) = self.windows.get_mut(&id) else {
            return;
        };
        let damage = window.damage.take();
        let pixmap = window.pixmap.take();
        if let Some(damage) = damage {
            let _ = self.conn.damage_destroy(damage);
        }
        if let Some(pixmap) = pixmap {
            let _ = self.conn.free_pixmap(pixmap);
        }
    }

    fn create_damage(&mut self, id: u32) -> Result<()> {
        if self.windows.get(&id).is_some_and(|w| w.damage.is_some()) {
            return Ok(());
        }
        let damage = self.conn.generate_id()?;
        self.conn
            .damage_create(damage, id, damage::ReportLevel::NON_EMPTY)?
            .check()
            .context("damage_create failed")?;
        if let Some(window) = self.windows.get_mut(&id) {
            window.damage = Some(damage);
        }
        Ok(())
    }

    /// Name a fresh pixmap for the window contents, freeing the old one
    fn name_pixmap(&mut self, id: u32) -> Option<Buffer> {
        let conn = self.conn.clone();
        let window = self.windows.get_mut(&id)?;
        if let Some(old) = window.pixmap.take() {
            let _ = conn.free_pixmap(old);
        }
        let pixmap = conn.generate_id().ok()?;
        if let Err(e) = conn
            .composite_name_window_pixmap(id, pixmap)
            .map_err(anyhow::Error::from)
            .and_then(|cookie| cookie.check().map_err(anyhow::Error::from))
        {
            debug!("Failed to name pixmap of window {}: {}", id, e);
            return None;
        }
        window.pixmap = Some(pixmap);
        window.serial += 1;
        Some(Buffer::x11_pixmap(
            window.serial,
            pixmap,
            window.geometry.size(),
            window.has_alpha(),
        ))
    }

    fn current_buffer(&self, id: u32) -> Option<Buffer> {
        let window = self.windows.get(&id)?;
        let pixmap = window.pixmap?;
        Some(Buffer::x11_pixmap(window.serial, pixmap, window.geometry.size(), window.has_alpha()))
    }

    fn read_opacity(&self, id: u32) -> f64 {
        let reply = self
            .conn
            .get_property(false, id, self.atoms._NET_WM_WINDOW_OPACITY, AtomEnum::CARDINAL, 0, 1)
            .ok()
            .and_then(|cookie| cookie.reply().ok());
        reply
            .and_then(|r| r.value32().and_then(|mut v| v.next()))
            .map_or(1.0, |v| v as f64 / u32::MAX as f64)
    }

    fn read_shadow(&self, id: u32, size: Size) -> Option<Shadow> {
        let reply = self
            .conn
            .get_property(false, id, self.atoms._KDE_NET_WM_SHADOW, AtomEnum::CARDINAL, 0, 12)
            .ok()?
            .reply()
            .ok()?;
        let data: Vec<u32> = reply.value32()?.collect();
        let conn = &self.conn;
        let fetch = |pixmap: u32| {
            let geometry = conn.get_geometry(pixmap).ok()?.reply().ok()?;
            let size = Size::new(geometry.width as i32, geometry.height as i32);
            raster::get_image(conn, pixmap, Rect::from_size(size))
                .map_err(|e| debug!("Failed to read shadow pixmap {}: {}", pixmap, e))
                .ok()
        };
        Shadow::from_x11_property(&data, fetch, size)
    }

    /// Shadow of a window: its property first, then the built-in style for
    /// undecorated managed windows
    fn shadow_for(&self, toplevel: &Toplevel) -> Option<Shadow> {
        let size = toplevel.geometry.size();
        if let Some(shadow) = self.read_shadow(toplevel.id, size) {
            return Some(shadow);
        }
        if !toplevel.wants_shadow || toplevel.decoration.is_some() {
            return None;
        }
        self.shadow.as_ref().map(|s| Shadow::from_decoration(s.clone(), size))
    }

    fn toplevel(&self, id: u32) -> Option<Toplevel> {
        let window = self.windows.get(&id)?;
        Some(toplevel_for(window, self.decoration.as_ref()))
    }

    fn add_to_scene(&self, scene: &mut Scene, id: u32) {
        let Some(toplevel) = self.toplevel(id) else {
            return;
        };
        let shadow = self.shadow_for(&toplevel);
        scene.add_window(toplevel);
        if let Some(shadow) = shadow {
            scene.set_shadow(id, Some(shadow));
        }
        if let Some(buffer) = self.current_buffer(id) {
            let damage = Region::from(buffer.rect());
            scene.commit(id, buffer, &damage);
        }
    }

    fn composited_stacking(&self) -> Vec<u32> {
        self.stacking
            .iter()
            .copied()
            .filter(|id| self.windows.get(id).is_some_and(TrackedWindow::is_composited))
            .collect()
    }

    /// Apply an X event to the tracked windows and the scene
    pub fn handle_event(&mut self, event: Event, compositor: &mut Compositor) -> Result<()> {
        match event {
            Event::CreateNotify(e) if e.parent == self.root && e.window != self.overlay => {
                let geometry = outer_geometry(e.x, e.y, e.width, e.height, e.border_width);
                self.track(TrackedWindow::new(e.window, geometry, e.border_width as i32, e.override_redirect));
                trace!("Window {} created", e.window);
            }

            Event::DestroyNotify(e) => {
                if let Some(window) = self.untrack(e.window) {
                    // The damage object dies with the window, a named pixmap does not
                    if let Some(pixmap) = window.pixmap {
                        let _ = self.conn.free_pixmap(pixmap);
                    }
                    if let Some(scene) = compositor.scene_mut() {
                        scene.window_closed(e.window);
                    }
                    trace!("Window {} destroyed", e.window);
                }
            }

            Event::ReparentNotify(e) => {
                if e.parent == self.root {
                    let geometry = self.conn.get_geometry(e.window)?.reply()?;
                    let outer = outer_geometry(e.x, e.y, geometry.width, geometry.height, geometry.border_width);
                    self.track(TrackedWindow::new(e.window, outer, geometry.border_width as i32, e.override_redirect));
                } else if self.windows.contains_key(&e.window) {
                    // Now inside a frame; the frame is composited instead
                    self.stop_compositing(e.window);
                    self.untrack(e.window);
                    if let Some(scene) = compositor.scene_mut() {
                        scene.remove_window(e.window);
                    }
                }
            }

            Event::MapNotify(e) => {
                if !self.windows.contains_key(&e.window) {
                    return Ok(());
                }
                self.refresh_attributes(e.window)?;
                let Some(window) = self.windows.get_mut(&e.window) else {
                    return Ok(());
                };
                window.mapped = true;
                window.override_redirect = e.override_redirect;
                if window.input_only {
                    return Ok(());
                }
                self.start_compositing(e.window);
                if let Some(scene) = compositor.scene_mut() {
                    self.add_to_scene(scene, e.window);
                    scene.restack(&self.composited_stacking());
                }
                debug!("Window {} mapped", e.window);
            }

            Event::UnmapNotify(e) => {
                let Some(window) = self.windows.get_mut(&e.window) else {
                    return Ok(());
                };
                if !window.mapped {
                    return Ok(());
                }
                window.mapped = false;
                self.stop_compositing(e.window);
                if let Some(scene) = compositor.scene_mut() {
                    scene.window_closed(e.window);
                }
                debug!("Window {} unmapped", e.window);
            }

            Event::ConfigureNotify(e) if e.window == self.root => {
                let size = Size::new(e.width as i32, e.height as i32);
                if size != self.size {
                    info!("Screen resized to {}x{}", size.width, size.height);
                    self.size = size;
                    compositor.screen_geometry_changed(size);
                }
            }

            Event::ConfigureNotify(e) => {
                let Some(window) = self.windows.get_mut(&e.window) else {
                    return Ok(());
                };
                let geometry = outer_geometry(e.x, e.y, e.width, e.height, e.border_width);
                let resized = geometry.size() != window.geometry.size();
                window.geometry = geometry;
                window.border_width = e.border_width as i32;
                window.override_redirect = e.override_redirect;
                let composited = window.is_composited();

                self.stacking.retain(|w| *w != e.window);
                let index = self
                    .stacking
                    .iter()
                    .position(|w| *w == e.above_sibling)
                    .map_or(0, |i| i + 1);
                self.stacking.insert(index, e.window);

                if !composited {
                    return Ok(());
                }
                let buffer = if resized { self.name_pixmap(e.window) } else { None };
                let toplevel = self.toplevel(e.window);
                if let Some(scene) = compositor.scene_mut() {
                    if let Some(toplevel) = toplevel {
                        scene.update_window(toplevel);
                    }
                    if resized {
                        scene.discard_pixmap(e.window);
                    }
                    if let Some(buffer) = buffer {
                        let damage = Region::from(buffer.rect());
                        scene.commit(e.window, buffer, &damage);
                    }
                    scene.restack(&self.composited_stacking());
                }
            }

            Event::CirculateNotify(e) => {
                if self.windows.contains_key(&e.window) {
                    self.stacking.retain(|w| *w != e.window);
                    if e.place == Place::ON_TOP {
                        self.stacking.push(e.window);
                    } else {
                        self.stacking.insert(0, e.window);
                    }
                    if let Some(scene) = compositor.scene_mut() {
                        scene.restack(&self.composited_stacking());
                    }
                }
            }

            Event::DamageNotify(e) => {
                let Some(window) = self.windows.get(&e.drawable) else {
                    return Ok(());
                };
                let border = window.border_width;
                let region = self.conn.generate_id()?;
                self.conn.xfixes_create_region(region, &[])?;
                self.conn.damage_subtract(e.damage, NONE, region)?;
                let rects = self.conn.xfixes_fetch_region(region)?.reply()?.rectangles;
                self.conn.xfixes_destroy_region(region)?;

                // Damage is relative to the window origin inside the border
                let damage: Region = rects
                    .iter()
                    .map(|r| Rect::new(r.x as i32 + border, r.y as i32 + border, r.width as i32, r.height as i32))
                    .collect();
                if let Some(scene) = compositor.scene_mut() {
                    scene.add_damage(e.drawable, &damage);
                }
            }

            Event::PropertyNotify(e) if self.windows.contains_key(&e.window) => {
                if e.atom == self.atoms._NET_WM_WINDOW_OPACITY {
                    let opacity = self.read_opacity(e.window);
                    if let Some(window) = self.windows.get_mut(&e.window) {
                        window.opacity = opacity;
                    }
                    let toplevel = self.toplevel(e.window);
                    if let (Some(scene), Some(toplevel)) = (compositor.scene_mut(), toplevel) {
                        scene.update_window(toplevel);
                    }
                } else if e.atom == self.atoms._KDE_NET_WM_SHADOW {
                    let Some(toplevel) = self.toplevel(e.window) else {
                        return Ok(());
                    };
                    let shadow = self.shadow_for(&toplevel);
                    if let Some(scene) = compositor.scene_mut() {
                        scene.set_shadow(e.window, shadow);
                    }
                }
            }

            Event::Expose(e) if e.window == self.overlay => {
                compositor.add_damage(&Region::from(Rect::new(
                    e.x as i32,
                    e.y as i32,
                    e.width as i32,
                    e.height as i32,
                )));
            }

            Event::Error(e) => match e.error_kind {
                // Windows go away while requests about them are in flight
                ErrorKind::Window | ErrorKind::Drawable | ErrorKind::Match | ErrorKind::Pixmap => {
                    trace!("X11 error (expected for destroyed windows): {:?}", e);
                }
                ErrorKind::DamageBadDamage => {
                    trace!("Damage error (expected for destroyed windows): {:?}", e);
                }
                _ => warn!("X11 error: {:?}", e),
            },

            _ => {}
        }
        Ok(())
    }
}

impl Platform for X11Platform {
    fn screen_size(&self) -> Size {
        self.size
    }

    fn create_backend(&mut self, kind: BackendKind, config: &Config) -> Result<Backend, BackendError> {
        let backend = match kind {
            BackendKind::OpenGl => {
                let device = glx::GlxDevice::new(
                    self.conn.clone(),
                    self.screen_num,
                    self.root,
                    self.overlay,
                    self.size,
                    config.compositor.vsync,
                    self.sync_available && config.compositor.explicit_sync,
                )?;
                Backend::OpenGl(OpenGlBackend::new(Box::new(device), self.size, config.compositor.buffer_age))
            }
            BackendKind::Raster => {
                let output = raster::X11RasterOutput::new(self.conn.clone(), self.overlay, self.root_depth)?;
                Backend::Raster(RasterBackend::new(Box::new(output), self.size))
            }
            BackendKind::XRender => {
                let device = xrender::X11XRenderDevice::new(
                    self.conn.clone(),
                    self.root,
                    self.root_depth,
                    self.root_visual,
                    self.overlay,
                    self.size,
                )?;
                Backend::XRender(XRenderBackend::new(Box::new(device), self.size))
            }
        };
        Ok(backend)
    }

    fn populate(&mut self, scene: &mut Scene) {
        let stacking = self.composited_stacking();
        for id in &stacking {
            self.add_to_scene(scene, *id);
        }
        scene.restack(&stacking);
        debug!("Added {} windows to the scene", stacking.len());
    }

    fn flush(&mut self) {
        if let Err(e) = self.conn.flush() {
            debug!("Failed to flush X11 requests: {}", e);
        }
    }
}

impl Drop for X11Platform {
    fn drop(&mut self) {
        for id in self.windows.keys().copied().collect::<Vec<_>>() {
            self.stop_compositing(id);
        }
        let _ = self.conn.composite_unredirect_subwindows(self.root, composite::Redirect::MANUAL);
        let _ = self.conn.composite_release_overlay_window(self.root);
        let _ = self.conn.flush();
        info!("Released the composite overlay window");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::image::alpha;

    fn window(override_redirect: bool) -> TrackedWindow {
        let mut window = TrackedWindow::new(7, Rect::new(100, 50, 300, 200), 0, override_redirect);
        window.mapped = true;
        window
    }

    #[test]
    fn test_outer_geometry_includes_border() {
        assert_eq!(outer_geometry(10, 20, 100, 50, 2), Rect::new(10, 20, 104, 54));
    }

    #[test]
    fn test_undecorated_toplevel() {
        let mut w = window(false);
        w.depth = 32;
        w.opacity = 0.5;
        let toplevel = toplevel_for(&w, None);
        assert_eq!(toplevel.geometry, Rect::new(100, 50, 300, 200));
        assert!(toplevel.has_alpha);
        assert_eq!(toplevel.opacity, 0.5);
        assert!(toplevel.wants_shadow);
    }

    #[test]
    fn test_decoration_grows_frame_around_client() {
        let config = DecorationConfig {
            enabled: true,
            ..DecorationConfig::default()
        };
        let decoration = builtin_decoration(&config, None);
        let toplevel = toplevel_for(&window(false), decoration.as_ref());
        assert_eq!(toplevel.geometry, Rect::new(98, 18, 304, 234));
        assert_eq!(toplevel.client_rect, Rect::new(2, 32, 300, 200));
        assert!(toplevel.decoration.is_some());

        // Popups stay bare
        let popup = toplevel_for(&window(true), decoration.as_ref());
        assert!(popup.decoration.is_none());
        assert!(!popup.wants_shadow);
    }

    #[test]
    fn test_disabled_styles() {
        assert!(builtin_decoration(&DecorationConfig::default(), None).is_none());
        let config = ShadowConfig {
            enabled: false,
            ..ShadowConfig::default()
        };
        assert!(builtin_shadow(&config).is_none());
    }

    #[test]
    fn test_builtin_shadow_fades_out() {
        let config = ShadowConfig::default();
        let shadow = builtin_shadow(&config).unwrap();
        let image = shadow.image();
        let s = config.size;
        assert_eq!(image.size(), Size::new(2 * s + 1, 2 * s + 1));
        assert_eq!(alpha(image.pixel(s, s)), config.strength as u32);
        assert_eq!(alpha(image.pixel(0, 0)), 0);
        assert!(alpha(image.pixel(s, s / 2)) < config.strength as u32);
        assert_eq!(shadow.padding(), Margins::new(12, 8, 12, 16));
    }
}

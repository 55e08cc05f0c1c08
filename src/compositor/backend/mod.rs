//! Rendering backends
//!
//! The scene talks to exactly one backend, picked at construction. Each
//! backend turns window buffers into textures, draws render nodes into a
//! back buffer and presents the damaged part of it.

pub mod damage;
pub mod opengl;
pub mod raster;
pub mod xrender;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::pixmap::{Buffer, TextureBackend};
use super::region::Region;
use super::render_node::RenderNode;
use super::sync::FenceOps;
use super::texture::Texture;
use crate::error::BindError;
use crate::shared::geometry::{Rect, Size};

pub use damage::{extend_paint_region, DamageHistory, MAX_DAMAGE_HISTORY};
pub use opengl::OpenGlBackend;
pub use raster::RasterBackend;
pub use xrender::XRenderBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    OpenGl,
    Raster,
    XRender,
}

impl BackendKind {
    /// Order tried when nothing else is configured
    pub const FALLBACK_ORDER: [BackendKind; 3] = [BackendKind::OpenGl, BackendKind::Raster, BackendKind::XRender];

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::OpenGl => "opengl",
            BackendKind::Raster => "raster",
            BackendKind::XRender => "xrender",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "opengl" | "gl" | "glx" => Ok(BackendKind::OpenGl),
            "raster" | "software" | "qpainter" => Ok(BackendKind::Raster),
            "xrender" => Ok(BackendKind::XRender),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// How the paint region is grown when the back buffer is not preserved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStrategy {
    /// Paint the whole display once any damaged rect is large
    #[default]
    ExtendDamage,
    PaintFullScreen,
    /// Repair the rest of the back buffer from the front buffer
    CopyFrontBuffer,
    NoSwapEncourage,
}

/// Graphics reset status, sampled once per frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStatus {
    NoError,
    /// Caused by us
    Guilty,
    /// Caused by another context
    Innocent,
    Unknown,
}

/// Paint attributes applied to every node of one window
#[derive(Debug, Clone)]
pub struct DrawParams {
    pub brightness: f64,
    pub saturation: f64,
    /// Screen-space scissor for transformed painting; `None` when quads were
    /// already clipped
    pub scissor: Option<Region>,
}

impl Default for DrawParams {
    fn default() -> Self {
        Self {
            brightness: 1.0,
            saturation: 1.0,
            scissor: None,
        }
    }
}

pub trait RenderBackend: TextureBackend {
    fn kind(&self) -> BackendKind;

    /// Start a frame. Returns the area that must be repainted whatever the
    /// damage is, because the back buffer is missing it.
    fn begin_frame(&mut self, screen: Rect) -> Region;

    /// Finish a frame. `valid` is what was painted, `update` what changed on
    /// screen.
    fn end_frame(&mut self, screen: Rect, valid: &Region, update: &Region);

    fn supports_buffer_age(&self) -> bool;

    fn buffer_age(&self) -> i32;

    fn paint_background(&mut self, region: &Region);

    /// Draw render nodes back to front
    fn draw(&mut self, nodes: &[RenderNode<'_>], params: &DrawParams);

    /// Copy `region` from the front buffer into the back buffer
    fn copy_pixels(&mut self, region: &Region);

    fn screen_geometry_changed(&mut self, size: Size);

    fn reset_status(&mut self) -> ResetStatus {
        ResetStatus::NoError
    }

    /// Primitives for explicit synchronization, when the backend has them
    fn fence_ops(&mut self) -> Option<Box<dyn FenceOps>> {
        None
    }
}

/// The active backend
pub enum Backend {
    OpenGl(OpenGlBackend),
    Raster(RasterBackend),
    XRender(XRenderBackend),
}

macro_rules! dispatch {
    ($self:ident, $b:ident => $e:expr) => {
        match $self {
            Backend::OpenGl($b) => $e,
            Backend::Raster($b) => $e,
            Backend::XRender($b) => $e,
        }
    };
}

impl TextureBackend for Backend {
    fn create_texture(&mut self, buffer: &Buffer) -> Result<Texture, BindError> {
        dispatch!(self, b => b.create_texture(buffer))
    }

    fn update_texture(&mut self, texture: &mut Texture, buffer: &Buffer, damage: &Region) -> Result<(), BindError> {
        dispatch!(self, b => b.update_texture(texture, buffer, damage))
    }
}

impl RenderBackend for Backend {
    fn kind(&self) -> BackendKind {
        dispatch!(self, b => b.kind())
    }

    fn begin_frame(&mut self, screen: Rect) -> Region {
        dispatch!(self, b => b.begin_frame(screen))
    }

    fn end_frame(&mut self, screen: Rect, valid: &Region, update: &Region) {
        dispatch!(self, b => b.end_frame(screen, valid, update))
    }

    fn supports_buffer_age(&self) -> bool {
        dispatch!(self, b => b.supports_buffer_age())
    }

    fn buffer_age(&self) -> i32 {
        dispatch!(self, b => b.buffer_age())
    }

    fn paint_background(&mut self, region: &Region) {
        dispatch!(self, b => b.paint_background(region))
    }

    fn draw(&mut self, nodes: &[RenderNode<'_>], params: &DrawParams) {
        dispatch!(self, b => b.draw(nodes, params))
    }

    fn copy_pixels(&mut self, region: &Region) {
        dispatch!(self, b => b.copy_pixels(region))
    }

    fn screen_geometry_changed(&mut self, size: Size) {
        dispatch!(self, b => b.screen_geometry_changed(size))
    }

    fn reset_status(&mut self) -> ResetStatus {
        dispatch!(self, b => b.reset_status())
    }

    fn fence_ops(&mut self) -> Option<Box<dyn FenceOps>> {
        dispatch!(self, b => b.fence_ops())
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Backend").field(&self.kind()).finish()
    }
}

/// Flip a rect from top-left origin device space into bottom-left origin
/// window coordinates
pub fn flip_rect(rect: Rect, height: i32) -> Rect {
    Rect::new(rect.x, height - rect.y - rect.height, rect.width, rect.height)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_names() {
        assert_eq!("OpenGL".parse::<BackendKind>(), Ok(BackendKind::OpenGl));
        assert_eq!("xrender".parse::<BackendKind>(), Ok(BackendKind::XRender));
        assert!("vulkan".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Raster.to_string(), "raster");
    }

    #[test]
    fn test_flip_rect() {
        assert_eq!(flip_rect(Rect::new(10, 0, 20, 30), 100), Rect::new(10, 70, 20, 30));
    }
}

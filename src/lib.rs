//! Area Scene
//!
//! Scene compositing for X11: window pixmaps, decorations and shadows are
//! painted through an OpenGL, software or XRender backend onto the
//! composite overlay window.

pub mod compositor;
pub mod config;
pub mod dbus;
pub mod error;
pub mod platform;
pub mod shared;

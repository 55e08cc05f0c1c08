//! Geometry and pixel types shared by the scene and the backends

pub mod geometry;
pub mod image;
pub mod transform;

//! Error types for the scene and its backends

use thiserror::Error;

use crate::compositor::sync::FenceState;

/// Backend construction or per-frame failure
#[derive(Debug, Error)]
pub enum BackendError {
    /// Construction failed; the compositor falls back to the next backend
    #[error("{backend} backend initialization failed: {reason}")]
    Init { backend: &'static str, reason: String },

    #[error("missing extension {0}")]
    MissingExtension(&'static str),

    #[error("X11 request failed: {0}")]
    X11(String),

    #[error("OpenGL error: {0}")]
    Gl(String),
}

impl BackendError {
    pub fn init(backend: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Init {
            backend,
            reason: reason.into(),
        }
    }
}

/// Texture bind failure; the window contributes no node for the frame
#[derive(Debug, Error)]
pub enum BindError {
    #[error("no buffer attached")]
    NoBuffer,

    #[error("buffer is empty")]
    EmptyBuffer,

    #[error("buffer type not supported by this backend")]
    Unsupported,

    #[error("upload failed: {0}")]
    Upload(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("illegal fence transition: {op} in state {state:?}")]
    IllegalTransition { op: &'static str, state: FenceState },

    #[error("fence wait timed out")]
    Timeout,

    #[error("fence operation failed: {0}")]
    Driver(String),
}

//! State shared by every scene the compositor creates

use std::rc::Rc;
use std::sync::Arc;

use x11rb::rust_connection::RustConnection;

use super::backend::BackendKind;
use super::shadow::ShadowTextureCache;
use crate::config::Config;
use crate::dbus::Notifier;

/// Owns the X connection handle, the configuration, the active backend kind
/// and the decoration shadow cache. Outlives scenes across backend resets.
pub struct CompositorContext {
    connection: Option<Arc<RustConnection>>,
    config: Config,
    backend: Option<BackendKind>,
    shadow_cache: ShadowTextureCache,
    notifier: Rc<dyn Notifier>,
}

impl CompositorContext {
    pub fn new(connection: Option<Arc<RustConnection>>, config: Config, notifier: Rc<dyn Notifier>) -> Self {
        Self {
            connection,
            config,
            backend: None,
            shadow_cache: ShadowTextureCache::new(),
            notifier,
        }
    }

    pub fn connection(&self) -> Option<&Arc<RustConnection>> {
        self.connection.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Backend of the current scene, `None` while not compositing
    pub fn backend(&self) -> Option<BackendKind> {
        self.backend
    }

    pub(crate) fn set_backend(&mut self, backend: Option<BackendKind>) {
        self.backend = backend;
    }

    pub fn shadow_cache(&self) -> &ShadowTextureCache {
        &self.shadow_cache
    }

    /// Textures belong to one backend; a new scene starts with an empty cache
    pub(crate) fn reset_shadow_cache(&mut self) {
        self.shadow_cache = ShadowTextureCache::new();
    }

    pub fn notifier(&self) -> Rc<dyn Notifier> {
        self.notifier.clone()
    }
}

//! X11 SYNC fences imported into GL with GL_EXT_x11_sync_object

use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use x11rb::connection::Connection;
use x11rb::protocol::sync::ConnectionExt as _;
use x11rb::protocol::xproto::ConnectionExt as _;
use x11rb::rust_connection::RustConnection;

use crate::compositor::sync::{ClientWait, FenceHandle, FenceOps};
use crate::error::SyncError;

const GL_SYNC_X11_FENCE_EXT: gl::types::GLenum = 0x90E1;

type ImportSyncFn =
    unsafe extern "system" fn(gl::types::GLenum, gl::types::GLintptr, gl::types::GLbitfield) -> gl::types::GLsync;

pub struct X11FenceOps {
    conn: Arc<RustConnection>,
    root: u32,
    import_sync: ImportSyncFn,
}

fn gl_sync(fence: &FenceHandle) -> gl::types::GLsync {
    fence.gl_sync as gl::types::GLsync
}

impl X11FenceOps {
    /// `None` when the GL driver cannot import X fences. Needs a current GL
    /// context.
    pub fn new(
        conn: Arc<RustConnection>,
        root: u32,
        proc_address: impl Fn(&str) -> Option<unsafe extern "C" fn()>,
    ) -> Option<Self> {
        let import = proc_address("glImportSyncEXT")?;
        // SAFETY: signature from GL_EXT_x11_sync_object
        let import_sync = unsafe { std::mem::transmute::<unsafe extern "C" fn(), ImportSyncFn>(import) };
        Some(Self { conn, root, import_sync })
    }
}

impl FenceOps for X11FenceOps {
    fn create(&mut self) -> Result<FenceHandle, SyncError> {
        let x_fence = self.conn.generate_id().map_err(|e| SyncError::Driver(e.to_string()))?;
        self.conn
            .sync_create_fence(self.root, x_fence, false)
            .map_err(|e| SyncError::Driver(e.to_string()))?;
        self.conn.flush().map_err(|e| SyncError::Driver(e.to_string()))?;

        let sync = unsafe { (self.import_sync)(GL_SYNC_X11_FENCE_EXT, x_fence as gl::types::GLintptr, 0) };
        if sync.is_null() {
            let _ = self.conn.sync_destroy_fence(x_fence);
            return Err(SyncError::Driver("glImportSyncEXT failed".into()));
        }
        Ok(FenceHandle {
            x_fence,
            gl_sync: sync as usize,
        })
    }

    fn trigger(&mut self, fence: &FenceHandle) {
        if let Err(e) = self.conn.sync_trigger_fence(fence.x_fence) {
            warn!("Failed to trigger fence {}: {}", fence.x_fence, e);
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.conn.flush() {
            warn!("Failed to flush X connection: {}", e);
        }
    }

    fn gpu_wait(&mut self, fence: &FenceHandle) {
        unsafe { gl::WaitSync(gl_sync(fence), 0, gl::TIMEOUT_IGNORED) };
    }

    fn is_signaled(&mut self, fence: &FenceHandle) -> bool {
        let mut value = 0;
        unsafe { gl::GetSynciv(gl_sync(fence), gl::SYNC_STATUS, 1, ptr::null_mut(), &mut value) };
        value as u32 == gl::SIGNALED
    }

    fn client_wait(&mut self, fence: &FenceHandle, timeout: Duration) -> ClientWait {
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { gl::ClientWaitSync(gl_sync(fence), 0, nanos) } {
            gl::ALREADY_SIGNALED | gl::CONDITION_SATISFIED => ClientWait::Signaled,
            gl::TIMEOUT_EXPIRED => ClientWait::TimeoutExpired,
            _ => ClientWait::Failed,
        }
    }

    fn reset(&mut self, fence: &FenceHandle) -> u64 {
        let sequence = match self.conn.sync_reset_fence(fence.x_fence) {
            Ok(cookie) => cookie.sequence_number(),
            Err(e) => {
                warn!("Failed to reset fence {}: {}", fence.x_fence, e);
                return 0;
            }
        };
        self.flush();
        sequence
    }

    /// Requests are handled in order, so any reply after the reset proves
    /// the server has processed it
    fn finish_reset(&mut self, sequence: u64) {
        if sequence == 0 {
            return;
        }
        let round_trip = self
            .conn
            .get_input_focus()
            .map_err(x11rb::errors::ReplyError::from)
            .and_then(|cookie| cookie.reply());
        if let Err(e) = round_trip {
            warn!("Fence reset round trip failed: {}", e);
        }
    }

    fn destroy_x_fence(&mut self, fence: &FenceHandle) {
        if let Err(e) = self.conn.sync_destroy_fence(fence.x_fence) {
            warn!("Failed to destroy fence {}: {}", fence.x_fence, e);
        }
    }

    fn delete_gl_sync(&mut self, fence: &FenceHandle) {
        unsafe { gl::DeleteSync(gl_sync(fence)) };
    }
}

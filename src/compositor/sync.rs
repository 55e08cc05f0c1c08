//! Explicit synchronization with the X command stream.
//!
//! Each `SyncObject` pairs an X11 sync fence with a GL sync object imported
//! from it. The X server signals the fence once it has processed every
//! request sent before the trigger, so a GPU wait on the imported sync keeps
//! the GL command stream from sampling window pixmaps the server has not
//! finished drawing into.
//!
//! ```text
//! Ready -> trigger -> TriggerSent -> wait -> Waiting
//!                          |                    |
//!                          +------ finish ------+-> Done -> reset -> Resetting
//!                                                                      |
//! Ready <------------------------- finish_resetting -------------------+
//! ```

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::SyncError;

/// Number of fences in the ring
pub const MAX_FENCES: usize = 4;

/// Upper bound for blocking in `finish()`
pub const FINISH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    Ready,
    TriggerSent,
    Waiting,
    Done,
    Resetting,
}

/// X fence id plus the GL sync imported from it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceHandle {
    pub x_fence: u32,
    pub gl_sync: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientWait {
    Signaled,
    TimeoutExpired,
    Failed,
}

/// X11 and GL primitives behind a fence
pub trait FenceOps {
    /// Create an untriggered X fence and import it as a GL sync
    fn create(&mut self) -> Result<FenceHandle, SyncError>;
    fn trigger(&mut self, fence: &FenceHandle);
    fn flush(&mut self);
    /// Insert a GPU-side wait; does not block the CPU
    fn gpu_wait(&mut self, fence: &FenceHandle);
    fn is_signaled(&mut self, fence: &FenceHandle) -> bool;
    fn client_wait(&mut self, fence: &FenceHandle, timeout: Duration) -> ClientWait;
    /// Send a fence reset without waiting for it. Returns the request
    /// sequence, 0 when nothing was sent.
    fn reset(&mut self, fence: &FenceHandle) -> u64;
    /// Block until the server has processed the reset
    fn finish_reset(&mut self, sequence: u64);
    fn destroy_x_fence(&mut self, fence: &FenceHandle);
    fn delete_gl_sync(&mut self, fence: &FenceHandle);
}

#[derive(Debug)]
pub struct SyncObject {
    state: FenceState,
    handle: FenceHandle,
    reset_sequence: u64,
    destroyed: bool,
}

impl SyncObject {
    pub fn new(ops: &mut dyn FenceOps) -> Result<Self, SyncError> {
        let handle = ops.create()?;
        Ok(Self {
            state: FenceState::Ready,
            handle,
            reset_sequence: 0,
            destroyed: false,
        })
    }

    pub fn state(&self) -> FenceState {
        self.state
    }

    pub fn handle(&self) -> FenceHandle {
        self.handle
    }

    fn illegal(&self, op: &'static str) -> SyncError {
        debug_assert!(false, "illegal fence transition: {} in state {:?}", op, self.state);
        SyncError::IllegalTransition {
            op,
            state: self.state,
        }
    }

    /// Ask the X server to signal the fence. Completes a pending reset first.
    /// The caller flushes the connection.
    pub fn trigger(&mut self, ops: &mut dyn FenceOps) -> Result<(), SyncError> {
        match self.state {
            FenceState::Ready => {}
            FenceState::Resetting => self.finish_resetting(ops)?,
            _ => return Err(self.illegal("trigger")),
        }
        ops.trigger(&self.handle);
        self.state = FenceState::TriggerSent;
        Ok(())
    }

    /// GPU-side wait. A no-op unless the trigger was sent.
    pub fn wait(&mut self, ops: &mut dyn FenceOps) {
        if self.state != FenceState::TriggerSent {
            return;
        }
        ops.gpu_wait(&self.handle);
        self.state = FenceState::Waiting;
    }

    /// Make sure the fence is signaled, blocking up to one second
    pub fn finish(&mut self, ops: &mut dyn FenceOps) -> bool {
        match self.state {
            FenceState::Done => return true,
            // A wait may never have been inserted when the damaged window
            // ended up fully occluded
            FenceState::TriggerSent | FenceState::Waiting => {}
            _ => {
                let _ = self.illegal("finish");
                return false;
            }
        }

        if !ops.is_signaled(&self.handle) {
            debug!("Compositor: waiting for X fence to finish");
            match ops.client_wait(&self.handle, FINISH_TIMEOUT) {
                ClientWait::Signaled => {}
                ClientWait::TimeoutExpired => {
                    warn!("Compositor: timeout while waiting for X fence");
                    return false;
                }
                ClientWait::Failed => {
                    warn!("Compositor: client wait on X fence failed");
                    return false;
                }
            }
        }

        self.state = FenceState::Done;
        true
    }

    /// Reset the X fence without blocking. `finish_resetting` confirms it
    /// before the fence is triggered again.
    pub fn reset(&mut self, ops: &mut dyn FenceOps) -> Result<(), SyncError> {
        if self.state != FenceState::Done {
            return Err(self.illegal("reset"));
        }
        self.reset_sequence = ops.reset(&self.handle);
        ops.flush();
        self.state = FenceState::Resetting;
        Ok(())
    }

    pub fn finish_resetting(&mut self, ops: &mut dyn FenceOps) -> Result<(), SyncError> {
        if self.state != FenceState::Resetting {
            return Err(self.illegal("finish_resetting"));
        }
        ops.finish_reset(self.reset_sequence);
        self.state = FenceState::Ready;
        Ok(())
    }

    /// Signal the fence if nobody will, then destroy both halves. Deleting
    /// the GL sync of an unsignaled X fence deadlocks some drivers.
    pub fn force_signal_and_destroy(&mut self, ops: &mut dyn FenceOps) {
        if self.destroyed {
            return;
        }
        if matches!(self.state, FenceState::Ready | FenceState::Resetting) {
            if self.state == FenceState::Resetting {
                ops.finish_reset(self.reset_sequence);
                self.state = FenceState::Ready;
            }
            ops.trigger(&self.handle);
            self.state = FenceState::TriggerSent;
            ops.flush();
        }
        ops.destroy_x_fence(&self.handle);
        ops.delete_gl_sync(&self.handle);
        self.destroyed = true;
    }
}

/// Ring of fences used for explicit synchronization
pub struct SyncManager {
    ops: Box<dyn FenceOps>,
    fences: Vec<SyncObject>,
    next: usize,
}

impl SyncManager {
    pub fn new(mut ops: Box<dyn FenceOps>) -> Result<Self, SyncError> {
        let mut fences = Vec::with_capacity(MAX_FENCES);
        for _ in 0..MAX_FENCES {
            match SyncObject::new(ops.as_mut()) {
                Ok(fence) => fences.push(fence),
                Err(err) => {
                    for fence in &mut fences {
                        fence.force_signal_and_destroy(ops.as_mut());
                    }
                    return Err(err);
                }
            }
        }
        ops.flush();
        Ok(Self {
            ops,
            fences,
            next: 0,
        })
    }

    /// Index of the fence to use next; advances the cursor
    pub fn next_fence(&mut self) -> usize {
        let index = self.next;
        self.next = (self.next + 1) % MAX_FENCES;
        index
    }

    pub fn fence(&self, index: usize) -> &SyncObject {
        &self.fences[index]
    }

    pub fn trigger(&mut self, index: usize) -> Result<(), SyncError> {
        self.fences[index].trigger(self.ops.as_mut())?;
        self.ops.flush();
        Ok(())
    }

    pub fn wait(&mut self, index: usize) {
        self.fences[index].wait(self.ops.as_mut());
    }

    /// Advance the fences that the next frames will reuse. Returns false when
    /// a fence could not be finished; explicit sync should then be abandoned.
    pub fn update_fences(&mut self) -> bool {
        for i in 0..2.min(MAX_FENCES - 1) {
            let index = (self.next + i) % MAX_FENCES;
            let ops = self.ops.as_mut();
            let fence = &mut self.fences[index];
            let ok = match fence.state() {
                FenceState::Ready => true,
                FenceState::TriggerSent | FenceState::Waiting => {
                    fence.finish(ops) && fence.reset(ops).is_ok()
                }
                FenceState::Done => fence.reset(ops).is_ok(),
                FenceState::Resetting => fence.finish_resetting(ops).is_ok(),
            };
            if !ok {
                return false;
            }
        }
        true
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        for fence in &mut self.fences {
            fence.force_signal_and_destroy(self.ops.as_mut());
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    /// Records every call; fences signal immediately unless told otherwise
    #[derive(Default)]
    pub struct FakeFenceOps {
        pub log: Rc<RefCell<Vec<String>>>,
        pub next_id: u32,
        pub signaled: bool,
        pub wait_result: Option<ClientWait>,
    }

    impl FakeFenceOps {
        pub fn signaling() -> Self {
            Self {
                signaled: true,
                ..Self::default()
            }
        }

        fn log(&self, entry: String) {
            self.log.borrow_mut().push(entry);
        }
    }

    impl FenceOps for FakeFenceOps {
        fn create(&mut self) -> Result<FenceHandle, SyncError> {
            self.next_id += 1;
            Ok(FenceHandle {
                x_fence: self.next_id,
                gl_sync: self.next_id as usize,
            })
        }

        fn trigger(&mut self, fence: &FenceHandle) {
            self.log(format!("trigger {}", fence.x_fence));
        }

        fn flush(&mut self) {}

        fn gpu_wait(&mut self, fence: &FenceHandle) {
            self.log(format!("wait {}", fence.x_fence));
        }

        fn is_signaled(&mut self, _fence: &FenceHandle) -> bool {
            self.signaled
        }

        fn client_wait(&mut self, _fence: &FenceHandle, _timeout: Duration) -> ClientWait {
            self.wait_result.unwrap_or(ClientWait::Signaled)
        }

        fn reset(&mut self, fence: &FenceHandle) -> u64 {
            self.log(format!("reset {}", fence.x_fence));
            fence.x_fence as u64
        }

        fn finish_reset(&mut self, sequence: u64) {
            self.log(format!("finish_reset {}", sequence));
        }

        fn destroy_x_fence(&mut self, fence: &FenceHandle) {
            self.log(format!("destroy {}", fence.x_fence));
        }

        fn delete_gl_sync(&mut self, fence: &FenceHandle) {
            self.log(format!("delete_sync {}", fence.x_fence));
        }
    }

    #[test]
    fn test_full_cycle_returns_to_ready() {
        let mut ops = FakeFenceOps::signaling();
        let mut fence = SyncObject::new(&mut ops).unwrap();
        assert_eq!(fence.state(), FenceState::Ready);
        fence.trigger(&mut ops).unwrap();
        assert_eq!(fence.state(), FenceState::TriggerSent);
        fence.wait(&mut ops);
        assert_eq!(fence.state(), FenceState::Waiting);
        assert!(fence.finish(&mut ops));
        assert_eq!(fence.state(), FenceState::Done);
        assert!(fence.finish(&mut ops));
        fence.reset(&mut ops).unwrap();
        assert_eq!(fence.state(), FenceState::Resetting);
        fence.finish_resetting(&mut ops).unwrap();
        assert_eq!(fence.state(), FenceState::Ready);
    }

    #[test]
    fn test_wait_outside_trigger_sent_is_noop() {
        let mut ops = FakeFenceOps::signaling();
        let log = ops.log.clone();
        let mut fence = SyncObject::new(&mut ops).unwrap();
        fence.wait(&mut ops);
        assert_eq!(fence.state(), FenceState::Ready);
        fence.trigger(&mut ops).unwrap();
        fence.wait(&mut ops);
        fence.wait(&mut ops);
        assert_eq!(log.borrow().iter().filter(|e| e.starts_with("wait")).count(), 1);
    }

    #[test]
    fn test_trigger_from_resetting_finishes_reset() {
        let mut ops = FakeFenceOps::signaling();
        let log = ops.log.clone();
        let mut fence = SyncObject::new(&mut ops).unwrap();
        fence.trigger(&mut ops).unwrap();
        assert!(fence.finish(&mut ops));
        fence.reset(&mut ops).unwrap();
        fence.trigger(&mut ops).unwrap();
        assert_eq!(fence.state(), FenceState::TriggerSent);
        let log = log.borrow();
        let finish = log.iter().position(|e| e == "finish_reset 1").unwrap();
        let trigger = log.iter().rposition(|e| e == "trigger 1").unwrap();
        assert!(finish < trigger);
    }

    #[test]
    fn test_finish_timeout_keeps_state() {
        let mut ops = FakeFenceOps {
            wait_result: Some(ClientWait::TimeoutExpired),
            ..FakeFenceOps::default()
        };
        let mut fence = SyncObject::new(&mut ops).unwrap();
        fence.trigger(&mut ops).unwrap();
        assert!(!fence.finish(&mut ops));
        assert_eq!(fence.state(), FenceState::TriggerSent);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "illegal fence transition"))]
    fn test_reset_outside_done_is_rejected() {
        let mut ops = FakeFenceOps::signaling();
        let mut fence = SyncObject::new(&mut ops).unwrap();
        let result = fence.reset(&mut ops);
        assert!(matches!(result, Err(SyncError::IllegalTransition { .. })));
        assert_eq!(fence.state(), FenceState::Ready);
    }

    #[test]
    fn test_ring_advances_modulo_four() {
        let manager = SyncManager::new(Box::new(FakeFenceOps::signaling()));
        let mut manager = manager.unwrap();
        let order: Vec<usize> = (0..6).map(|_| manager.next_fence()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 0, 1]);
    }

    #[test]
    fn test_update_fences_recycles_upcoming_slots() {
        let mut manager = SyncManager::new(Box::new(FakeFenceOps::signaling())).unwrap();
        for _ in 0..MAX_FENCES {
            let i = manager.next_fence();
            manager.trigger(i).unwrap();
        }
        // Cursor is back at 0: slots 0 and 1 get finished and reset
        assert!(manager.update_fences());
        assert_eq!(manager.fence(0).state(), FenceState::Resetting);
        assert_eq!(manager.fence(1).state(), FenceState::Resetting);
        assert_eq!(manager.fence(2).state(), FenceState::TriggerSent);
        assert!(manager.update_fences());
        assert_eq!(manager.fence(0).state(), FenceState::Ready);
    }

    #[test]
    fn test_update_fences_fails_on_timeout() {
        let ops = FakeFenceOps {
            wait_result: Some(ClientWait::TimeoutExpired),
            ..FakeFenceOps::default()
        };
        let mut manager = SyncManager::new(Box::new(ops)).unwrap();
        let i = manager.next_fence();
        manager.trigger(i).unwrap();
        for _ in 0..3 {
            manager.next_fence();
        }
        assert!(!manager.update_fences());
    }

    #[test]
    fn test_drop_signals_untriggered_fences_before_destroy() {
        let ops = FakeFenceOps::signaling();
        let log = ops.log.clone();
        let mut manager = SyncManager::new(Box::new(ops)).unwrap();
        let i = manager.next_fence();
        manager.trigger(i).unwrap();
        drop(manager);
        let log = log.borrow();
        // Fence 1 was already triggered; the other three are signaled first
        assert_eq!(log.iter().filter(|e| e.starts_with("trigger")).count(), 4);
        for id in 1..=4 {
            let destroy = log.iter().position(|e| *e == format!("destroy {}", id)).unwrap();
            let delete = log.iter().position(|e| *e == format!("delete_sync {}", id)).unwrap();
            assert!(destroy < delete);
        }
    }
}

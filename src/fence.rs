//! Sync fences for fenced execution
//!
//! A [`SyncFence`] stands in for the file-descriptor-based fences a kernel
//! driver would hand out: a shared handle with a two-state view. Producers
//! (backends) signal it exactly once; consumers poll or block on it. An
//! execution owns at most one fence, and its completion state is read off
//! the fence rather than through the builder's non-fenced completion path.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Observable state of a sync fence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    /// Not yet signaled
    Active,
    /// Signaled; the guarded work completed successfully
    Signaled,
    /// Signaled with an error
    Error,
    /// The fence could not be queried
    Unknown,
}

#[derive(Debug)]
struct FenceInner {
    state: Mutex<FenceState>,
    cond: Condvar,
}

/// A shareable one-shot synchronization primitive
#[derive(Debug, Clone)]
pub struct SyncFence {
    inner: Arc<FenceInner>,
}

impl SyncFence {
    /// A fence in the `Active` state
    pub fn new() -> Self {
        SyncFence {
            inner: Arc::new(FenceInner {
                state: Mutex::new(FenceState::Active),
                cond: Condvar::new(),
            }),
        }
    }

    /// A fence that is already signaled
    pub fn signaled() -> Self {
        let fence = SyncFence::new();
        fence.signal(true);
        fence
    }

    /// Signal the fence; `success` selects `Signaled` or `Error`.
    /// Signaling an already-terminal fence is a no-op.
    pub fn signal(&self, success: bool) {
        let mut state = self.inner.state.lock().expect("fence lock poisoned");
        if *state == FenceState::Active {
            *state = if success {
                FenceState::Signaled
            } else {
                FenceState::Error
            };
            self.inner.cond.notify_all();
        }
    }

    /// Non-blocking poll of the current state
    pub fn state(&self) -> FenceState {
        *self.inner.state.lock().expect("fence lock poisoned")
    }

    /// Wait for the fence to leave `Active`
    ///
    /// `None` waits forever; `Some(Duration::ZERO)` is a non-blocking poll.
    /// Returns the state observed when the wait ended, which is `Active`
    /// when a finite wait timed out.
    pub fn wait(&self, timeout: Option<Duration>) -> FenceState {
        let guard = self.inner.state.lock().expect("fence lock poisoned");
        match timeout {
            None => {
                let guard = self
                    .inner
                    .cond
                    .wait_while(guard, |state| *state == FenceState::Active)
                    .expect("fence lock poisoned");
                *guard
            }
            Some(timeout) if timeout.is_zero() => *guard,
            Some(timeout) => {
                let (guard, _) = self
                    .inner
                    .cond
                    .wait_timeout_while(guard, timeout, |state| *state == FenceState::Active)
                    .expect("fence lock poisoned");
                *guard
            }
        }
    }

    /// Identity comparison; two handles are the same fence iff they share
    /// state
    pub fn same_fence(&self, other: &SyncFence) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for SyncFence {
    fn default() -> Self {
        SyncFence::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_initial_state_and_poll() {
        let fence = SyncFence::new();
        assert_eq!(fence.state(), FenceState::Active);
        assert_eq!(fence.wait(Some(Duration::ZERO)), FenceState::Active);
    }

    #[test]
    fn test_signal_success_and_error() {
        let fence = SyncFence::new();
        fence.signal(true);
        assert_eq!(fence.state(), FenceState::Signaled);

        let fence = SyncFence::new();
        fence.signal(false);
        assert_eq!(fence.state(), FenceState::Error);
    }

    #[test]
    fn test_signal_is_one_shot() {
        let fence = SyncFence::new();
        fence.signal(false);
        fence.signal(true);
        assert_eq!(fence.state(), FenceState::Error);
    }

    #[test]
    fn test_blocking_wait_sees_cross_thread_signal() {
        let fence = SyncFence::new();
        let signaller = fence.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signaller.signal(true);
        });
        assert_eq!(fence.wait(None), FenceState::Signaled);
        handle.join().unwrap();
    }

    #[test]
    fn test_timed_wait_times_out() {
        let fence = SyncFence::new();
        assert_eq!(
            fence.wait(Some(Duration::from_millis(5))),
            FenceState::Active
        );
    }

    #[test]
    fn test_fence_identity() {
        let fence = SyncFence::new();
        let alias = fence.clone();
        let other = SyncFence::new();
        assert!(fence.same_fence(&alias));
        assert!(!fence.same_fence(&other));
    }
}

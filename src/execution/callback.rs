//! Single-shot completion event for asynchronous executions
//!
//! The drive loop notifies the callback exactly once; clients block on
//! `wait()` or query results afterwards. When the execution runs on a
//! worker thread, the callback owns the join handle and joins it before
//! reporting results, so buffers bound to the execution are quiescent by
//! the time `wait()` returns.

use std::sync::{Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::warn;

use crate::device::{OutputShape, Timing};
use crate::error::ExecStatus;

type OnFinish = Box<dyn FnOnce(ExecStatus, &[OutputShape], Timing) -> ExecStatus + Send>;

struct CallbackState {
    notified: bool,
    status: ExecStatus,
    output_shapes: Vec<OutputShape>,
    timing: Timing,
    on_finish: Option<OnFinish>,
    thread: Option<JoinHandle<()>>,
}

impl CallbackState {
    fn new() -> Self {
        CallbackState {
            notified: false,
            status: ExecStatus::Ok,
            output_shapes: Vec::new(),
            timing: Timing::UNKNOWN,
            on_finish: None,
            thread: None,
        }
    }
}

/// Completion event returned by `start_compute`
pub struct ExecutionCallback {
    state: Mutex<CallbackState>,
    cond: Condvar,
}

impl ExecutionCallback {
    pub(crate) fn new() -> Self {
        ExecutionCallback {
            state: Mutex::new(CallbackState::new()),
            cond: Condvar::new(),
        }
    }

    /// Hook run inside `notify`, before results are published; it may
    /// rewrite the status (the builder's finish step does).
    pub(crate) fn set_on_finish(&self, on_finish: OnFinish) {
        let mut state = self.state.lock().expect("callback lock poisoned");
        state.on_finish = Some(on_finish);
    }

    pub(crate) fn bind_thread(&self, thread: JoinHandle<()>) {
        let mut state = self.state.lock().expect("callback lock poisoned");
        state.thread = Some(thread);
    }

    /// Publish the execution's result; must be called exactly once
    pub(crate) fn notify(&self, status: ExecStatus, output_shapes: Vec<OutputShape>, timing: Timing) {
        let mut state = self.state.lock().expect("callback lock poisoned");
        if state.notified {
            warn!("execution callback notified more than once; ignoring");
            return;
        }
        let status = match state.on_finish.take() {
            Some(on_finish) => on_finish(status, &output_shapes, timing),
            None => status,
        };
        state.status = status;
        state.output_shapes = output_shapes;
        state.timing = timing;
        state.notified = true;
        self.cond.notify_all();
    }

    /// Block until the execution has finished
    pub fn wait(&self) {
        let mut state = self.state.lock().expect("callback lock poisoned");
        while !state.notified {
            state = self.cond.wait(state).expect("callback lock poisoned");
        }
        // Join the worker so caller buffers are no longer touched.
        let thread = state.thread.take();
        drop(state);
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }

    /// Final status; blocks until finished
    pub fn status(&self) -> ExecStatus {
        self.wait();
        self.state.lock().expect("callback lock poisoned").status
    }

    /// Final output shapes; blocks until finished
    pub fn output_shapes(&self) -> Vec<OutputShape> {
        self.wait();
        self.state
            .lock()
            .expect("callback lock poisoned")
            .output_shapes
            .clone()
    }

    /// Timing of the last executed step; blocks until finished
    pub fn timing(&self) -> Timing {
        self.wait();
        self.state.lock().expect("callback lock poisoned").timing
    }
}
